// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Install-time configuration for the crash reporter.

use crate::shared::constants::DEFAULT_MAX_REPORT_COUNT;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Which sentries to arm at install time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorSet {
    pub mach_exception: bool,
    pub signal: bool,
    pub panic: bool,
    pub watchdog: bool,
    pub user_reported: bool,
}

impl MonitorSet {
    /// Everything on. The registry still masks debugger-unsafe monitors when
    /// the process is being traced.
    pub fn all() -> Self {
        Self {
            mach_exception: true,
            signal: true,
            panic: true,
            watchdog: true,
            user_reported: true,
        }
    }

    /// Only the monitors that are safe while a debugger is attached.
    pub fn debugger_safe() -> Self {
        Self {
            mach_exception: false,
            signal: false,
            panic: true,
            watchdog: true,
            user_reported: true,
        }
    }

    pub fn any(&self) -> bool {
        self.mach_exception || self.signal || self.panic || self.watchdog || self.user_reported
    }
}

impl Default for MonitorSet {
    fn default() -> Self {
        Self::all()
    }
}

/// Validated configuration handed to `install`.
///
/// Construct through [`CrashReporterConfig::new`], which rejects
/// inconsistent settings up front so the capture path never has to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashReporterConfig {
    app_name: String,
    install_path: PathBuf,
    monitors: MonitorSet,
    signals: Vec<i32>,
    create_alt_stack: bool,
    use_alt_stack: bool,
    report_sigterm: bool,
    max_report_count: usize,
    watchdog_stall_threshold: Duration,
    /// Pre-baked JSON embedded verbatim as the report's `system` section.
    system_info_json: Option<String>,
}

impl CrashReporterConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        app_name: String,
        install_path: PathBuf,
        monitors: MonitorSet,
        signals: Vec<i32>,
        create_alt_stack: bool,
        use_alt_stack: bool,
        report_sigterm: bool,
        max_report_count: usize,
        watchdog_stall_threshold: Duration,
        system_info_json: Option<String>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(!app_name.is_empty(), "app_name must not be empty");
        anyhow::ensure!(
            !app_name.contains('/') && !app_name.contains('\0'),
            "app_name must be a plain filename component"
        );
        anyhow::ensure!(
            !(create_alt_stack && !use_alt_stack),
            "Cannot create an altstack without using it"
        );
        anyhow::ensure!(
            watchdog_stall_threshold >= Duration::from_millis(100),
            "watchdog stall threshold below 100ms would flood the store"
        );
        if let Some(json) = &system_info_json {
            serde_json::from_str::<serde_json::Value>(json)
                .map_err(|e| anyhow::anyhow!("system_info_json is not valid JSON: {e}"))?;
        }
        Ok(Self {
            app_name,
            install_path,
            monitors,
            signals,
            create_alt_stack,
            use_alt_stack,
            report_sigterm,
            max_report_count,
            watchdog_stall_threshold,
            system_info_json,
        })
    }

    pub fn with_defaults(app_name: &str, install_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        Self::new(
            app_name.to_string(),
            install_path.into(),
            MonitorSet::default(),
            default_signals(),
            true,
            true,
            false,
            DEFAULT_MAX_REPORT_COUNT,
            Duration::from_secs(2),
            None,
        )
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn install_path(&self) -> &PathBuf {
        &self.install_path
    }

    pub fn monitors(&self) -> MonitorSet {
        self.monitors
    }

    pub fn signals(&self) -> &[i32] {
        &self.signals
    }

    pub fn create_alt_stack(&self) -> bool {
        self.create_alt_stack
    }

    pub fn use_alt_stack(&self) -> bool {
        self.use_alt_stack
    }

    pub fn report_sigterm(&self) -> bool {
        self.report_sigterm
    }

    pub fn max_report_count(&self) -> usize {
        self.max_report_count
    }

    pub fn watchdog_stall_threshold(&self) -> Duration {
        self.watchdog_stall_threshold
    }

    pub fn system_info_json(&self) -> Option<&str> {
        self.system_info_json.as_deref()
    }

    pub fn reports_path(&self) -> PathBuf {
        self.install_path.clone()
    }

    pub fn report_sidecars_path(&self) -> PathBuf {
        self.install_path.join("ReportSidecars")
    }

    pub fn run_sidecars_path(&self) -> PathBuf {
        self.install_path.join("RunSidecars")
    }

    pub fn crash_state_path(&self) -> PathBuf {
        self.install_path
            .join(format!("{}-state.json", self.app_name))
    }

    pub fn log_path(&self) -> PathBuf {
        self.install_path.join(format!("{}-log.txt", self.app_name))
    }
}

/// The fatal signals intercepted by default.
pub fn default_signals() -> Vec<i32> {
    vec![
        libc::SIGILL,
        libc::SIGTRAP,
        libc::SIGABRT,
        libc::SIGBUS,
        libc::SIGFPE,
        libc::SIGSEGV,
        libc::SIGPIPE,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_altstack_paradox() {
        let err = CrashReporterConfig::new(
            "app".into(),
            "/tmp/x".into(),
            MonitorSet::default(),
            default_signals(),
            true,
            false,
            false,
            5,
            Duration::from_secs(2),
            None,
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot create an altstack without using it"
        );
    }

    #[test]
    fn test_rejects_bad_app_name() {
        assert!(CrashReporterConfig::with_defaults("", "/tmp/x").is_err());
        assert!(CrashReporterConfig::with_defaults("a/b", "/tmp/x").is_err());
    }

    #[test]
    fn test_rejects_invalid_system_json() {
        let err = CrashReporterConfig::new(
            "app".into(),
            "/tmp/x".into(),
            MonitorSet::default(),
            default_signals(),
            true,
            true,
            false,
            5,
            Duration::from_secs(2),
            Some("{not json".into()),
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_paths_derive_from_app_name() {
        let config = CrashReporterConfig::with_defaults("myapp", "/tmp/reports").unwrap();
        assert_eq!(
            config.crash_state_path(),
            PathBuf::from("/tmp/reports/myapp-state.json")
        );
        assert_eq!(
            config.report_sidecars_path(),
            PathBuf::from("/tmp/reports/ReportSidecars")
        );
        assert_eq!(
            config.run_sidecars_path(),
            PathBuf::from("/tmp/reports/RunSidecars")
        );
    }

    #[test]
    fn test_config_round_trips_through_serde() {
        let config = CrashReporterConfig::with_defaults("myapp", "/tmp/reports").unwrap();
        let json = serde_json::to_string(&config).unwrap();
        let back: CrashReporterConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }
}
