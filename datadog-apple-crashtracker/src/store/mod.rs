// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! On-disk report store.
//!
//! Reports live flat in the install directory as
//! `<appName>-report-<hex16>.json`, keyed by monotonic 64-bit ids: the high
//! 32 bits are seeded from UTC calendar fields at initialization, the low
//! 32 bits come from an atomic counter, so ids sort by creation time across
//! launches. Initialization prunes oldest-first down to the configured
//! maximum.
//!
//! Two sidecar trees carry out-of-band data that monitors produce outside
//! the capture path: `ReportSidecars/<monitorId>/<hex16>.ksscr` per report
//! and `RunSidecars/<runUUID>/<monitorId>.ksscr` per run. Both are stitched
//! into the JSON at read time; run-sidecar directories with no surviving
//! report are deleted during cleanup. Orphan detection reads only the first
//! 2 KB of each report and finds the run id with a literal byte scan, no
//! JSON parser on that path.

use crate::crash_info::fixup;
use crate::shared::constants::{MAX_REPORT_SIZE, RUN_ID_SCAN_WINDOW, SIDECAR_EXTENSION};
use anyhow::Context;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicI64, AtomicU32};
use std::sync::Mutex;

/// Whether a sidecar belongs to one report or to a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SidecarScope {
    Report,
    Run,
}

/// Hook for merging a sidecar file into a report at read time. The
/// installed reporter routes this to the monitor registry.
pub trait SidecarStitcher {
    fn stitch(
        &self,
        monitor_id: &str,
        report: &str,
        sidecar_path: &Path,
        scope: SidecarScope,
    ) -> Option<String>;
}

/// A stitcher that stitches nothing.
pub struct NoStitcher;

impl SidecarStitcher for NoStitcher {
    fn stitch(&self, _: &str, _: &str, _: &Path, _: SidecarScope) -> Option<String> {
        None
    }
}

static NEXT_ID_HIGH: AtomicI64 = AtomicI64::new(0);
static NEXT_ID_LOW: AtomicU32 = AtomicU32::new(0);
static STORE_MUTEX: Mutex<()> = Mutex::new(());

pub struct ReportStore {
    reports_path: PathBuf,
    report_sidecars_path: PathBuf,
    run_sidecars_path: PathBuf,
    app_name: String,
    run_id: String,
    max_report_count: usize,
}

fn seed_ids_from_clock() {
    use chrono::{Datelike, Timelike, Utc};
    let now = Utc::now();
    let base: i64 = (now.second() as i64
        + now.minute() as i64 * 61
        + now.hour() as i64 * 61 * 60
        + now.ordinal0() as i64 * 61 * 60 * 24
        + (now.year() as i64 - 1900) * 61 * 60 * 24 * 366)
        << 23;
    let high = base & !0xffff_ffff;
    // Never move backwards: re-initialization in the same process must not
    // reissue ids that are already on disk.
    if high > NEXT_ID_HIGH.load(SeqCst) {
        NEXT_ID_HIGH.store(high, SeqCst);
        NEXT_ID_LOW.store((base & 0xffff_ffff) as u32, SeqCst);
    }
}

fn next_unique_id() -> i64 {
    NEXT_ID_HIGH.load(SeqCst) + NEXT_ID_LOW.fetch_add(1, SeqCst) as i64
}

impl ReportStore {
    pub fn new(
        reports_path: PathBuf,
        report_sidecars_path: PathBuf,
        run_sidecars_path: PathBuf,
        app_name: String,
        run_id: String,
        max_report_count: usize,
    ) -> Self {
        Self {
            reports_path,
            report_sidecars_path,
            run_sidecars_path,
            app_name,
            run_id,
            max_report_count,
        }
    }

    /// Create the directory tree, prune to the configured maximum, and seed
    /// the id counter.
    pub fn initialize(&self) -> anyhow::Result<()> {
        let _guard = STORE_MUTEX.lock().expect("store mutex poisoned");
        std::fs::create_dir_all(&self.reports_path)
            .with_context(|| format!("creating {}", self.reports_path.display()))?;
        std::fs::create_dir_all(&self.report_sidecars_path)?;
        std::fs::create_dir_all(&self.run_sidecars_path)?;
        self.prune_locked();
        seed_ids_from_clock();
        Ok(())
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn report_path_for_id(&self, id: i64) -> PathBuf {
        self.reports_path
            .join(format!("{}-report-{:016x}.json", self.app_name, id as u64))
    }

    fn id_from_filename(&self, filename: &str) -> Option<i64> {
        let rest = filename.strip_prefix(&self.app_name)?;
        let hex = rest.strip_prefix("-report-")?.strip_suffix(".json")?;
        if hex.len() != 16 {
            return None;
        }
        let id = u64::from_str_radix(hex, 16).ok()? as i64;
        if id > 0 {
            Some(id)
        } else {
            None
        }
    }

    /// Reserve the next report id and its path. Called at install time to
    /// pre-assign the crash report destination, and by `add_user_report`.
    pub fn next_report(&self) -> (i64, PathBuf) {
        let id = next_unique_id();
        (id, self.report_path_for_id(id))
    }

    fn report_ids_locked(&self) -> Vec<i64> {
        let mut ids = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.reports_path) else {
            tracing::error!(path = %self.reports_path.display(), "could not open reports directory");
            return ids;
        };
        for entry in entries.flatten() {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(id) = self.id_from_filename(name) {
                    ids.push(id);
                }
            }
        }
        ids.sort_unstable();
        ids
    }

    pub fn report_count(&self) -> usize {
        let _guard = STORE_MUTEX.lock().expect("store mutex poisoned");
        self.report_ids_locked().len()
    }

    /// All report ids, oldest first.
    pub fn report_ids(&self) -> Vec<i64> {
        let _guard = STORE_MUTEX.lock().expect("store mutex poisoned");
        self.report_ids_locked()
    }

    fn prune_locked(&self) {
        if self.max_report_count == 0 {
            return;
        }
        let ids = self.report_ids_locked();
        if ids.len() > self.max_report_count {
            let excess = ids.len() - self.max_report_count;
            for &id in ids.iter().take(excess) {
                self.delete_report_locked(id);
            }
        }
    }

    fn delete_report_locked(&self, id: i64) {
        let path = self.report_path_for_id(id);
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::error!(path = %path.display(), error = %e, "could not delete report");
        }
        // Per-report sidecars under every monitor directory.
        if let Ok(entries) = std::fs::read_dir(&self.report_sidecars_path) {
            for entry in entries.flatten() {
                let sidecar = entry
                    .path()
                    .join(format!("{:016x}.{}", id as u64, SIDECAR_EXTENSION));
                let _ = std::fs::remove_file(sidecar);
            }
        }
    }

    pub fn delete_report(&self, id: i64) {
        let _guard = STORE_MUTEX.lock().expect("store mutex poisoned");
        self.delete_report_locked(id);
    }

    pub fn delete_all_reports(&self) {
        let _guard = STORE_MUTEX.lock().expect("store mutex poisoned");
        for path in [
            &self.reports_path,
            &self.report_sidecars_path,
            &self.run_sidecars_path,
        ] {
            let Ok(entries) = std::fs::read_dir(path) else {
                continue;
            };
            for entry in entries.flatten() {
                let p = entry.path();
                let result = if p.is_dir() {
                    std::fs::remove_dir_all(&p)
                } else {
                    // Keep non-report files (state, logs) out of scope.
                    if p.extension().map(|e| e == "json").unwrap_or(false)
                        && self
                            .id_from_filename(entry.file_name().to_str().unwrap_or(""))
                            .is_some()
                    {
                        std::fs::remove_file(&p)
                    } else {
                        Ok(())
                    }
                };
                if let Err(e) = result {
                    tracing::warn!(path = %p.display(), error = %e, "delete failed");
                }
            }
        }
    }

    /// Store caller-provided report bytes under a fresh id.
    pub fn add_user_report(&self, report: &[u8]) -> anyhow::Result<i64> {
        let _guard = STORE_MUTEX.lock().expect("store mutex poisoned");
        let id = next_unique_id();
        let path = self.report_path_for_id(id);
        std::fs::write(&path, report).with_context(|| format!("writing {}", path.display()))?;
        Ok(id)
    }

    /// Read a report, apply the legacy-field fixup pass, and stitch in any
    /// sidecars. Run sidecars are stitched first so per-report data can
    /// override per-run data.
    pub fn read_report(&self, id: i64, stitcher: &dyn SidecarStitcher) -> anyhow::Result<String> {
        let _guard = STORE_MUTEX.lock().expect("store mutex poisoned");
        let path = self.report_path_for_id(id);
        let report = self.read_report_at_path_locked(&path)?;
        let report = self.stitch_run_sidecars(report, stitcher);
        Ok(self.stitch_report_sidecars(report, id, stitcher))
    }

    /// Read and fix up a report by path, without sidecar stitching.
    pub fn read_report_at_path(&self, path: &Path) -> anyhow::Result<String> {
        let _guard = STORE_MUTEX.lock().expect("store mutex poisoned");
        self.read_report_at_path_locked(path)
    }

    fn read_report_at_path_locked(&self, path: &Path) -> anyhow::Result<String> {
        let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        anyhow::ensure!(bytes.len() <= MAX_REPORT_SIZE, "report too large");
        let raw = String::from_utf8(bytes).context("report is not UTF-8")?;
        fixup::fixup_report(&raw).context("report failed fixup")
    }

    fn stitch_report_sidecars(
        &self,
        mut report: String,
        id: i64,
        stitcher: &dyn SidecarStitcher,
    ) -> String {
        let Ok(entries) = std::fs::read_dir(&self.report_sidecars_path) else {
            return report;
        };
        for entry in entries.flatten() {
            let Some(monitor_id) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            let sidecar = entry
                .path()
                .join(format!("{:016x}.{}", id as u64, SIDECAR_EXTENSION));
            if !sidecar.exists() {
                continue;
            }
            if let Some(stitched) = stitcher.stitch(&monitor_id, &report, &sidecar, SidecarScope::Report) {
                report = stitched;
            }
        }
        report
    }

    fn stitch_run_sidecars(&self, mut report: String, stitcher: &dyn SidecarStitcher) -> String {
        let Some(run_id) = extract_run_id(report.as_bytes()) else {
            return report;
        };
        let run_dir = self.run_sidecars_path.join(run_id);
        let Ok(entries) = std::fs::read_dir(&run_dir) else {
            return report;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if path.extension().and_then(|e| e.to_str()) != Some(SIDECAR_EXTENSION) {
                continue;
            }
            if let Some(stitched) = stitcher.stitch(stem, &report, &path, SidecarScope::Run) {
                report = stitched;
            }
        }
        report
    }

    /// Path for a per-report sidecar, creating the monitor's directory.
    pub fn report_sidecar_path(&self, monitor_id: &str, report_id: i64) -> anyhow::Result<PathBuf> {
        let dir = self.report_sidecars_path.join(monitor_id);
        std::fs::create_dir_all(&dir)?;
        Ok(dir.join(format!("{:016x}.{}", report_id as u64, SIDECAR_EXTENSION)))
    }

    /// Path for this run's sidecar for a monitor, creating the run
    /// directory.
    pub fn run_sidecar_path(&self, monitor_id: &str) -> anyhow::Result<PathBuf> {
        anyhow::ensure!(!self.run_id.is_empty(), "no run id");
        let dir = self.run_sidecars_path.join(&self.run_id);
        std::fs::create_dir_all(&dir)?;
        Ok(dir.join(format!("{monitor_id}.{SIDECAR_EXTENSION}")))
    }

    /// Delete run-sidecar directories that belong neither to the current
    /// run nor to any surviving report.
    pub fn cleanup_orphaned_run_sidecars(&self) {
        let _guard = STORE_MUTEX.lock().expect("store mutex poisoned");

        let mut active: HashSet<String> = HashSet::new();
        active.insert(self.run_id.clone());
        for id in self.report_ids_locked() {
            let path = self.report_path_for_id(id);
            if let Some(run_id) = read_run_id_prefix(&path) {
                active.insert(run_id);
            }
        }

        let Ok(entries) = std::fs::read_dir(&self.run_sidecars_path) else {
            return;
        };
        for entry in entries.flatten() {
            let Some(name) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            if name.starts_with('.') || active.contains(&name) {
                continue;
            }
            let dir = entry.path();
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                tracing::warn!(path = %dir.display(), error = %e, "orphan cleanup failed");
            }
        }
    }
}

/// Read the run id from a report's header window. Only the first 2 KB are
/// read; the id is located by a literal byte scan.
fn read_run_id_prefix(path: &Path) -> Option<String> {
    use std::io::Read;
    let mut file = std::fs::File::open(path).ok()?;
    let mut buf = [0u8; RUN_ID_SCAN_WINDOW];
    let mut filled = 0usize;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(_) => break,
        }
    }
    extract_run_id(&buf[..filled]).map(String::from)
}

/// Find `"run_id":"<uuid>"` in raw report bytes and validate the uuid.
fn extract_run_id(bytes: &[u8]) -> Option<&str> {
    const NEEDLE: &[u8] = b"\"run_id\":\"";
    const UUID_LEN: usize = 36;
    let start = bytes
        .windows(NEEDLE.len())
        .position(|window| window == NEEDLE)?
        + NEEDLE.len();
    let candidate = bytes.get(start..start + UUID_LEN)?;
    let text = core::str::from_utf8(candidate).ok()?;
    uuid::Uuid::parse_str(text).ok()?;
    Some(text)
}

#[cfg(test)]
mod tests;
