// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Hang / watchdog sentry.
//!
//! A watcher thread observes a heartbeat that the host's main thread posts
//! (`heartbeat()`, typically from its event loop). When the heartbeat
//! stalls past the configured threshold, the watcher emits a hang report
//! through the normal capture pipeline (the main thread is treated as the
//! offending thread and all threads are recorded) and keeps a small
//! memory-mapped sidecar file up to date with the hang's progress. If the
//! main thread comes back, the sidecar is marked recovered; if the process
//! dies hung, the sidecar's last timestamp tells the next launch when the
//! hang ended. The sidecar is stitched into the report at read time.

use crate::collector::threads;
use crate::monitors::callbacks;
use crate::monitors::context::{CrashCause, HandlingRequirements, MonitorFlags};
use crate::monitors::{self, MonitorApi};
use crate::shared::constants::{SIDECAR_MAGIC, SIDECAR_SIZE, SIDECAR_VERSION};
use crate::store::SidecarScope;
use mach2::mach_init::mach_thread_self;
use mach2::port::mach_port_t;
use memmap2::MmapMut;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

static ENABLED: AtomicBool = AtomicBool::new(false);
static INSTALLED: AtomicBool = AtomicBool::new(false);
static HEARTBEAT: AtomicU64 = AtomicU64::new(0);
static WATCHED_THREAD: AtomicU32 = AtomicU32::new(0);
static TASK_ROLE: AtomicI32 = AtomicI32::new(0);

pub const API_ID: &str = "watchdog";

fn monitor_id() -> &'static str {
    API_ID
}

fn monitor_flags() -> MonitorFlags {
    MonitorFlags {
        fatal: false,
        debugger_unsafe: true,
        async_safe: false,
    }
}

fn set_enabled(enabled: bool) {
    ENABLED.store(enabled && INSTALLED.load(SeqCst), SeqCst);
}

fn is_enabled() -> bool {
    ENABLED.load(SeqCst)
}

fn add_contextual_info(_ctx: &mut crate::monitors::context::MonitorContext) {}

fn notify_post_system_enable() {}

pub static API: MonitorApi = MonitorApi {
    id: monitor_id,
    flags: monitor_flags,
    set_enabled,
    is_enabled,
    add_contextual_info,
    notify_post_system_enable,
    write_report_section: None,
    stitch_report: Some(stitch_report),
};

/// Post a main-thread heartbeat. Call from the host's event loop; a stalled
/// heartbeat past the configured threshold is reported as a hang.
pub fn heartbeat() {
    HEARTBEAT.fetch_add(1, SeqCst);
}

/// Record the task's current role for the sidecar (foreground, background,
/// …). The host updates this on lifecycle transitions.
pub fn set_task_role(role: i32) {
    TASK_ROLE.store(role, SeqCst);
}

// MARK: - Sidecar file

struct Sidecar {
    map: MmapMut,
}

impl Sidecar {
    fn create(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(SIDECAR_SIZE as u64)?;
        // SAFETY: freshly created file of the right size, owned by us.
        let map = unsafe { MmapMut::map_mut(&file)? };
        let mut sidecar = Self { map };
        sidecar.write_i32(0, SIDECAR_MAGIC);
        sidecar.map[4] = SIDECAR_VERSION;
        sidecar.update(false);
        Ok(sidecar)
    }

    fn write_i32(&mut self, offset: usize, value: i32) {
        self.map[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn write_u64(&mut self, offset: usize, value: u64) {
        self.map[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Refresh the end timestamp, role, and recovered flag.
    fn update(&mut self, recovered: bool) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.write_u64(8, now);
        self.write_i32(16, TASK_ROLE.load(SeqCst));
        self.map[20] = recovered as u8;
        let _ = self.map.flush();
    }
}

/// Parsed view of a sidecar file, used at stitch time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SidecarData {
    pub end_timestamp: u64,
    pub end_role: i32,
    pub recovered: bool,
}

/// Read and validate a sidecar file.
pub fn read_sidecar(path: &Path) -> Option<SidecarData> {
    let bytes = std::fs::read(path).ok()?;
    if bytes.len() < SIDECAR_SIZE {
        return None;
    }
    let magic = i32::from_le_bytes(bytes[0..4].try_into().ok()?);
    if magic != SIDECAR_MAGIC {
        return None;
    }
    if bytes[4] != SIDECAR_VERSION {
        return None;
    }
    Some(SidecarData {
        end_timestamp: u64::from_le_bytes(bytes[8..16].try_into().ok()?),
        end_role: i32::from_le_bytes(bytes[16..20].try_into().ok()?),
        recovered: bytes[20] != 0,
    })
}

fn stitch_report(report: &str, sidecar_path: &Path, _scope: SidecarScope) -> Option<String> {
    let data = read_sidecar(sidecar_path)?;
    let mut value: serde_json::Value = serde_json::from_str(report).ok()?;
    let root = value.as_object_mut()?;
    root.insert(
        "hang".to_string(),
        serde_json::json!({
            "end_timestamp": data.end_timestamp,
            "end_role": data.end_role,
            "recovered": data.recovered,
        }),
    );
    serde_json::to_string(&value).ok()
}

// MARK: - Watcher

fn emit_hang_report(stalled_for: Duration, report_path: Option<PathBuf>) {
    let Some(path) = report_path else {
        tracing::error!("no report path available for hang report");
        return;
    };
    let watched = WATCHED_THREAD.load(SeqCst);

    // SAFETY: notify/handle contract on the watcher thread.
    unsafe {
        let ctx = callbacks::notify(monitor_id(), HandlingRequirements::report_only(true));
        ctx.report_path_override.set(path.to_str().unwrap_or(""));
        if !ctx.offending_context.fill_from_thread(watched, true) {
            tracing::warn!("could not fetch stalled thread state");
        }
        ctx.cause = CrashCause::Watchdog {
            stalled_for_ms: stalled_for.as_millis() as u64,
        };
        ctx.fault_address = ctx.offending_context.pc();
        callbacks::handle(ctx);
    }
}

fn watcher_main(stall_threshold: Duration, sidecar_path: PathBuf, factory: fn() -> Option<PathBuf>) {
    // The watcher must survive its own suspension machinery.
    // SAFETY: new send right, kept for the thread's lifetime.
    let self_thread = unsafe { mach_thread_self() };
    threads::add_reserved_thread(self_thread);

    let poll = stall_threshold / 4;
    let mut last_beat = HEARTBEAT.load(SeqCst);
    let mut last_change = Instant::now();
    let mut active_hang: Option<Sidecar> = None;

    loop {
        std::thread::sleep(poll.max(Duration::from_millis(25)));
        if !ENABLED.load(SeqCst) {
            if INSTALLED.load(SeqCst) {
                continue;
            }
            return;
        }

        let beat = HEARTBEAT.load(SeqCst);
        if beat != last_beat {
            last_beat = beat;
            last_change = Instant::now();
            if let Some(mut sidecar) = active_hang.take() {
                // The main thread came back; the hang is over.
                sidecar.update(true);
                tracing::info!("main thread recovered from hang");
            }
            continue;
        }

        let stalled_for = last_change.elapsed();
        if stalled_for < stall_threshold {
            continue;
        }

        match &mut active_hang {
            Some(sidecar) => {
                // Still hung; keep the sidecar's end point fresh so a death
                // during the hang leaves an accurate record.
                sidecar.update(false);
            }
            None => {
                tracing::warn!(stalled_ms = stalled_for.as_millis() as u64, "main thread hang");
                match Sidecar::create(&sidecar_path) {
                    Ok(sidecar) => active_hang = Some(sidecar),
                    Err(e) => tracing::error!(error = %e, "could not create hang sidecar"),
                }
                emit_hang_report(stalled_for, factory());
            }
        }
    }
}

/// Arm the watchdog. `watched_thread` is the Mach port of the thread whose
/// heartbeat is observed (the caller of `install`, normally the main
/// thread). `report_path_factory` reserves a fresh report path per hang.
pub fn install(
    stall_threshold: Duration,
    sidecar_path: PathBuf,
    watched_thread: mach_port_t,
    report_path_factory: fn() -> Option<PathBuf>,
) -> anyhow::Result<()> {
    if INSTALLED.swap(true, SeqCst) {
        return Ok(());
    }
    WATCHED_THREAD.store(watched_thread, SeqCst);
    HEARTBEAT.store(1, SeqCst);

    std::thread::Builder::new()
        .name("crash-watchdog".into())
        .spawn(move || watcher_main(stall_threshold, sidecar_path, report_path_factory))
        .map_err(|e| anyhow::anyhow!("could not spawn watchdog thread: {e}"))?;

    monitors::add_monitor(&API);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sidecar_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watchdog.ksscr");

        TASK_ROLE.store(2, SeqCst);
        let mut sidecar = Sidecar::create(&path).unwrap();
        sidecar.update(false);

        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.len(), SIDECAR_SIZE as u64);

        let data = read_sidecar(&path).unwrap();
        assert!(!data.recovered);
        assert_eq!(data.end_role, 2);
        assert!(data.end_timestamp > 0);

        sidecar.update(true);
        assert!(read_sidecar(&path).unwrap().recovered);
    }

    #[test]
    fn test_sidecar_rejects_bad_magic_and_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.ksscr");
        std::fs::write(&path, [0u8; SIDECAR_SIZE]).unwrap();
        assert_eq!(read_sidecar(&path), None);

        let mut bytes = [0u8; SIDECAR_SIZE];
        bytes[0..4].copy_from_slice(&SIDECAR_MAGIC.to_le_bytes());
        bytes[4] = 99; // wrong version
        std::fs::write(&path, bytes).unwrap();
        assert_eq!(read_sidecar(&path), None);

        // Truncated file.
        std::fs::write(&path, &bytes[..10]).unwrap();
        assert_eq!(read_sidecar(&path), None);
    }

    #[test]
    fn test_stitch_inserts_hang_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watchdog.ksscr");
        let mut sidecar = Sidecar::create(&path).unwrap();
        sidecar.update(true);

        let report = r#"{"crash_id": "x"}"#;
        let stitched = stitch_report(report, &path, SidecarScope::Run).unwrap();
        let value: serde_json::Value = serde_json::from_str(&stitched).unwrap();
        assert_eq!(value["hang"]["recovered"], true);
        assert_eq!(value["crash_id"], "x");
    }
}
