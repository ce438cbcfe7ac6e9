// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Installation and lifecycle API.
//!
//! `install` arms the whole reporter: store and crash-state initialization,
//! the binary-image cache, capture-path log redirection, report-path
//! pre-assignment, and every configured sentry. It can run once per
//! process; everything it wires up stays armed until the process dies.

use crate::macho::images;
use crate::memory::probe::VmProbe;
use crate::memory::MemoryReader;
use crate::monitors;
use crate::report;
use crate::shared::configuration::CrashReporterConfig;
use crate::shared::constants::MAX_PATH_LENGTH;
use crate::shared::fd_log;
use crate::state;
use crate::store::{ReportStore, SidecarScope, SidecarStitcher};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::AtomicBool;
use std::sync::OnceLock;

pub use crate::monitors::user::report_user_exception;
pub use crate::monitors::watchdog::{heartbeat, set_task_role};
pub use crate::report::CrashNotifyCallback;
pub use crate::shared::InstallError;

static INSTALLED: AtomicBool = AtomicBool::new(false);
static STORE: OnceLock<ReportStore> = OnceLock::new();

/// The installed report store.
pub fn store() -> Option<&'static ReportStore> {
    STORE.get()
}

/// Routes sidecar stitching through the monitor registry.
pub struct RegistryStitcher;

impl SidecarStitcher for RegistryStitcher {
    fn stitch(
        &self,
        monitor_id: &str,
        report: &str,
        sidecar_path: &Path,
        scope: SidecarScope,
    ) -> Option<String> {
        let api = monitors::monitor_by_id(monitor_id)?;
        let stitch = api.stitch_report?;
        stitch(report, sidecar_path, scope)
    }
}

fn hang_report_path() -> Option<PathBuf> {
    store().map(|s| s.next_report().1)
}

fn memory_self_check() -> bool {
    let marker: u64 = 0xD06F00D;
    VmProbe::new().read_u64(&marker as *const u64 as usize) == Some(marker)
}

/// Arm the crash reporter.
///
/// Must be called before any crash occurs, on the thread whose hangs the
/// watchdog should observe (normally the main thread). Returns a typed
/// error and arms nothing on failure; cannot be re-invoked in the same
/// process.
pub fn install(config: &CrashReporterConfig) -> Result<(), InstallError> {
    if INSTALLED.swap(true, SeqCst) {
        return Err(InstallError::AlreadyInstalled);
    }

    if !config.monitors().any() {
        return Err(InstallError::InvalidParameter("no monitors selected"));
    }
    let install_path = config.install_path();
    if install_path.as_os_str().len() >= MAX_PATH_LENGTH {
        return Err(InstallError::PathTooLong);
    }

    std::fs::create_dir_all(install_path).map_err(|e| {
        tracing::error!(error = %e, path = %install_path.display(), "create_dir_all failed");
        InstallError::CouldNotCreatePath
    })?;

    // Redirect capture-path logging to a file next to the reports; stderr
    // may be gone by the time a crash happens.
    let log_path = config.log_path();
    let log_path_str = log_path.to_str().ok_or(InstallError::LogFilenameFailed)?;
    let mut cpath = [0u8; MAX_PATH_LENGTH + 1];
    if log_path_str.len() >= MAX_PATH_LENGTH {
        return Err(InstallError::LogFilenameFailed);
    }
    cpath[..log_path_str.len()].copy_from_slice(log_path_str.as_bytes());
    // SAFETY: NUL-terminated buffer built above. The fd stays open for the
    // life of the process.
    let log_fd = unsafe {
        libc::open(
            cpath.as_ptr() as *const libc::c_char,
            libc::O_WRONLY | libc::O_CREAT | libc::O_APPEND,
            0o644,
        )
    };
    if log_fd < 0 {
        return Err(InstallError::LogFilenameFailed);
    }
    fd_log::set_fd(log_fd);

    if !memory_self_check() {
        return Err(InstallError::MemoryInitFailed);
    }

    let run_id = uuid::Uuid::new_v4().as_hyphenated().to_string();

    let store = ReportStore::new(
        config.reports_path(),
        config.report_sidecars_path(),
        config.run_sidecars_path(),
        config.app_name().to_string(),
        run_id.clone(),
        config.max_report_count(),
    );
    store.initialize().map_err(|e| {
        tracing::error!(error = %e, "report store initialization failed");
        InstallError::StoreInitFailed
    })?;
    let store = match STORE.set(store) {
        Ok(()) => STORE.get().expect("store just set"),
        Err(_) => return Err(InstallError::AlreadyInstalled),
    };

    state::init(&config.crash_state_path()).map_err(|e| {
        tracing::error!(error = %e, "crash state initialization failed");
        InstallError::CrashStateInitFailed
    })?;

    images::init();

    // Pre-assign the crash destination: no path construction happens while
    // the process is dying.
    let (report_id, report_path) = store.next_report();
    let recrash_path = store.report_path_for_id(report_id).with_extension("recrash.json");
    report::set_report_destination(&report_path, &recrash_path);
    report::set_run_id(&run_id);
    report::set_system_info_json(config.system_info_json().map(String::from));

    let monitors_config = config.monitors();
    if monitors_config.signal {
        let mut signals = config.signals().to_vec();
        if config.report_sigterm() && !signals.contains(&libc::SIGTERM) {
            signals.push(libc::SIGTERM);
        }
        crate::monitors::signal::install(
            &signals,
            config.create_alt_stack(),
            config.use_alt_stack(),
        )
        .map_err(|e| {
            tracing::error!(error = %e, "signal sentry installation failed");
            InstallError::NoActiveMonitors
        })?;
    }
    if monitors_config.mach_exception {
        // Refused under a debugger; the signal path still covers us there
        // (also masked, but re-enabled when detached from the debugger).
        if let Err(e) = crate::monitors::mach::install() {
            tracing::warn!(error = %e, "mach sentry not installed");
        }
    }
    if monitors_config.panic {
        crate::monitors::panic::install();
    }
    if monitors_config.user_reported {
        crate::monitors::user::install();
    }
    if monitors_config.watchdog {
        let sidecar_path = store
            .run_sidecar_path(crate::monitors::watchdog::API_ID)
            .map_err(|_| InstallError::StoreInitFailed)?;
        // SAFETY: new send right, kept for the process lifetime.
        let watched = unsafe { mach2::mach_init::mach_thread_self() };
        if let Err(e) = crate::monitors::watchdog::install(
            config.watchdog_stall_threshold(),
            sidecar_path,
            watched,
            hang_report_path,
        ) {
            tracing::warn!(error = %e, "watchdog not installed");
        }
    }

    if !monitors::activate_monitors() {
        return Err(InstallError::NoActiveMonitors);
    }

    store.cleanup_orphaned_run_sidecars();

    tracing::info!(
        app = config.app_name(),
        path = %install_path.display(),
        run_id,
        "crash reporter installed"
    );
    Ok(())
}

/// Whether the previous launch ended in a crash.
pub fn crashed_last_launch() -> bool {
    state::snapshot().crashed_last_launch
}

/// Application became active/inactive.
pub fn notify_app_active(is_active: bool) {
    state::notify_active(is_active);
}

/// Application entered/left the foreground.
pub fn notify_app_in_foreground(in_foreground: bool) {
    state::notify_foreground(in_foreground);
}

/// Application is terminating cleanly.
pub fn notify_app_terminate() {
    state::notify_terminate();
    monitors::disable_all_monitors();
}

/// Pre-baked JSON embedded as the report's `user` section. Validated here;
/// an invalid fragment is rejected rather than silently replaced at crash
/// time.
pub fn set_user_info_json(json: Option<&str>) -> anyhow::Result<()> {
    if let Some(json) = json {
        serde_json::from_str::<serde_json::Value>(json)
            .map_err(|e| anyhow::anyhow!("user info is not valid JSON: {e}"))?;
    }
    report::set_user_info_json(json.map(String::from));
    Ok(())
}

/// Install (or clear) the `user_atcrash` callback. It runs inside the
/// report writer while the process is dying and must be async-signal-safe.
pub fn set_crash_notify_callback(callback: Option<CrashNotifyCallback>) {
    report::set_crash_notify(callback);
}

/// Read a stored report with fixup and sidecar stitching applied.
pub fn read_report(report_id: i64) -> anyhow::Result<String> {
    let store = store().ok_or_else(|| anyhow::anyhow!("not installed"))?;
    store.read_report(report_id, &RegistryStitcher)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_self_check() {
        assert!(memory_self_check());
    }

    #[test]
    fn test_registry_stitcher_unknown_monitor() {
        let stitcher = RegistryStitcher;
        assert!(stitcher
            .stitch("no-such-monitor", "{}", Path::new("/tmp/x"), SidecarScope::Run)
            .is_none());
    }
}
