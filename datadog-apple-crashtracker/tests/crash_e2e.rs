// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! End-to-end capture tests.
//!
//! Each scenario forks, installs the reporter in the child, triggers a real
//! fault (or lifecycle event), lets the child die, and validates the
//! artifacts left on disk from the parent. This keeps deliberate crashes
//! out of the test runner's process, at the cost of running each scenario
//! in a pristine forked address space.

#![cfg(target_vendor = "apple")]

use datadog_apple_crashtracker::crash_info::CrashReport;
use datadog_apple_crashtracker::{CrashReporterConfig, MonitorSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn config_with(monitors: MonitorSet, dir: &Path) -> CrashReporterConfig {
    CrashReporterConfig::new(
        "e2eapp".to_string(),
        dir.to_path_buf(),
        monitors,
        vec![
            libc::SIGILL,
            libc::SIGTRAP,
            libc::SIGABRT,
            libc::SIGBUS,
            libc::SIGFPE,
            libc::SIGSEGV,
        ],
        true,
        true,
        false,
        10,
        Duration::from_millis(300),
        Some(r#"{"os": "macOS", "reporter_test": true}"#.to_string()),
    )
    .unwrap()
}

/// Fork; run `child` (which must never return); wait for the child and
/// return its wait status.
fn in_forked_child(child: impl FnOnce()) -> i32 {
    // SAFETY: classic fork/waitpid pair; the child only runs the closure.
    unsafe {
        match libc::fork() {
            -1 => panic!("fork failed"),
            0 => {
                child();
                libc::_exit(97); // the closure should have exited or died
            }
            pid => {
                let mut status = 0;
                let rc = libc::waitpid(pid, &mut status, 0);
                assert_eq!(rc, pid, "waitpid failed");
                status
            }
        }
    }
}

fn report_paths(dir: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .unwrap()
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| {
                    n.starts_with("e2eapp-report-")
                        && n.ends_with(".json")
                        && !n.ends_with(".recrash.json")
                })
                .unwrap_or(false)
        })
        .collect();
    paths.sort();
    paths
}

fn load_single_report(dir: &Path) -> CrashReport {
    let paths = report_paths(dir);
    assert_eq!(paths.len(), 1, "expected exactly one report in {dir:?}");
    let raw = std::fs::read_to_string(&paths[0]).unwrap();
    CrashReport::from_json(&raw).unwrap_or_else(|e| panic!("report not parseable: {e}\n{raw}"))
}

fn assert_common_invariants(report: &CrashReport) {
    assert_eq!(report.report_version_major, 1);
    assert_eq!(report.crash_id.len(), 36);
    assert_eq!(report.run_id.as_ref().unwrap().len(), 36);
    assert!(report.timestamp > 0);

    let page = page_size::get() as u64;
    for thread in &report.crash.threads {
        for frame in &thread.backtrace {
            assert!(
                frame.instruction_addr > page,
                "frame in NULL page: {frame:?}"
            );
        }
        if let Some(last) = thread.backtrace.last() {
            assert_ne!(last.instruction_addr, 0);
        }
    }
    for image in &report.crash.binary_images {
        image
            .image_addr
            .checked_add(image.image_size)
            .expect("image range overflows u64");
        if let Some(uuid) = &image.uuid {
            assert_eq!(uuid.len(), 36);
        }
    }
    // The pre-baked system section survived embedding.
    assert_eq!(report.system.as_ref().unwrap()["reporter_test"], true);
}

#[test]
fn test_null_pointer_segv_signal_sentry() {
    let dir = tempfile::tempdir().unwrap();
    let monitors = MonitorSet {
        mach_exception: false,
        signal: true,
        panic: false,
        watchdog: false,
        user_reported: true,
    };
    let config = config_with(monitors, dir.path());

    let status = in_forked_child(move || {
        datadog_apple_crashtracker::install(&config).unwrap();
        // SAFETY: deliberate null write to trigger SIGSEGV.
        unsafe {
            std::ptr::write_volatile(std::ptr::null_mut::<u32>(), 0xDEAD);
        }
    });
    // The child must have died from the re-raised signal.
    assert!(libc::WIFSIGNALED(status), "status: {status:#x}");
    assert_eq!(libc::WTERMSIG(status), libc::SIGSEGV);

    let report = load_single_report(dir.path());
    assert_common_invariants(&report);

    let error = &report.crash.error;
    assert_eq!(error.error_type, "signal");
    assert_eq!(error.signal, libc::SIGSEGV as u64);
    assert_eq!(error.signal_name.as_deref(), Some("SIGSEGV"));

    let crashed = report.crashed_thread().expect("a crashed thread");
    assert!(!crashed.backtrace.is_empty());
    assert!(crashed.registers.is_some());
    assert!(crashed.exception_registers.is_some());
    // At least one frame resolves into this test binary.
    assert!(report
        .crash
        .threads
        .iter()
        .flat_map(|t| &t.backtrace)
        .any(|f| f.object_name.is_some()));
}

#[test]
fn test_bad_access_mach_sentry() {
    let dir = tempfile::tempdir().unwrap();
    let monitors = MonitorSet {
        mach_exception: true,
        signal: false,
        panic: false,
        watchdog: false,
        user_reported: false,
    };
    let config = config_with(monitors, dir.path());

    let status = in_forked_child(move || {
        datadog_apple_crashtracker::install(&config).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        // SAFETY: deliberate wild read to raise EXC_BAD_ACCESS.
        unsafe {
            std::ptr::read_volatile(0x10 as *const u32);
        }
        libc::_exit(96);
    });
    assert!(libc::WIFSIGNALED(status));

    let report = load_single_report(dir.path());
    assert_common_invariants(&report);

    let error = &report.crash.error;
    assert_eq!(error.error_type, "mach");
    assert_eq!(error.mach_exception.as_deref(), Some("EXC_BAD_ACCESS"));
    assert_eq!(error.signal_name.as_deref(), Some("SIGSEGV"));

    // The Mach path records every other thread, crashed one included.
    let crashed = report.crashed_thread().expect("a crashed thread");
    assert!(!crashed.backtrace.is_empty());
}

#[test]
fn test_stack_overflow_is_detected_and_trimmed() {
    let dir = tempfile::tempdir().unwrap();
    let monitors = MonitorSet {
        mach_exception: true,
        signal: true,
        panic: false,
        watchdog: false,
        user_reported: false,
    };
    let config = config_with(monitors, dir.path());

    #[inline(never)]
    fn recurse(data: &mut [u8; 256]) -> u64 {
        let mut local = [0u8; 256];
        local[0] = data[0].wrapping_add(1);
        // Defeat tail-call optimization.
        recurse(&mut local) + local[0] as u64
    }

    let status = in_forked_child(move || {
        datadog_apple_crashtracker::install(&config).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let mut data = [0u8; 256];
        let result = recurse(&mut data);
        // Unreachable; keeps the call from being optimized out.
        libc::_exit((result & 1) as i32);
    });
    assert!(libc::WIFSIGNALED(status));

    let paths = report_paths(dir.path());
    assert!(!paths.is_empty(), "no report written for stack overflow");
    let raw = std::fs::read_to_string(&paths[0]).unwrap();
    let report = CrashReport::from_json(&raw).unwrap();

    let crashed = report.crashed_thread().expect("a crashed thread");
    assert!(
        crashed.backtrace_skipped > 0,
        "expected skipped frames, got {}",
        crashed.backtrace_skipped
    );
    assert_eq!(crashed.backtrace.len(), 50);
    if report.crash.error.error_type == "mach" {
        assert_eq!(
            report.crash.error.mach_code_name.as_deref(),
            Some("KERN_INVALID_ADDRESS")
        );
    }
}

#[test]
fn test_panic_sentry_writes_report() {
    let dir = tempfile::tempdir().unwrap();
    let monitors = MonitorSet {
        mach_exception: false,
        signal: false,
        panic: true,
        watchdog: false,
        user_reported: false,
    };
    let config = config_with(monitors, dir.path());

    let status = in_forked_child(move || {
        datadog_apple_crashtracker::install(&config).unwrap();
        let _ = std::panic::catch_unwind(|| {
            panic!("e2e panic message");
        });
        libc::_exit(42);
    });
    assert!(libc::WIFEXITED(status));
    assert_eq!(libc::WEXITSTATUS(status), 42);

    let report = load_single_report(dir.path());
    assert_common_invariants(&report);
    assert_eq!(report.crash.error.error_type, "panic");
    assert_eq!(
        report.crash.error.panic_message.as_deref(),
        Some("e2e panic message")
    );
    assert_eq!(report.crash.error.signal, libc::SIGABRT as u64);
    let crashed = report.crashed_thread().expect("a crashed thread");
    assert!(!crashed.backtrace.is_empty());
}

#[test]
fn test_user_reported_exception() {
    let dir = tempfile::tempdir().unwrap();
    let monitors = MonitorSet {
        mach_exception: false,
        signal: false,
        panic: false,
        watchdog: false,
        user_reported: true,
    };
    let config = config_with(monitors, dir.path());

    let status = in_forked_child(move || {
        datadog_apple_crashtracker::install(&config).unwrap();
        datadog_apple_crashtracker::report_user_exception(
            "ScriptError",
            "undefined is not a function",
            "lua",
            "game.lua:42",
            &[],
            false,
            false,
        );
        libc::_exit(42);
    });
    assert!(libc::WIFEXITED(status));
    assert_eq!(libc::WEXITSTATUS(status), 42);

    let report = load_single_report(dir.path());
    assert_common_invariants(&report);
    let error = &report.crash.error;
    assert_eq!(error.error_type, "user");
    assert_eq!(error.user_exception_name.as_deref(), Some("ScriptError"));
    assert_eq!(
        error.user_exception_reason.as_deref(),
        Some("undefined is not a function")
    );
    assert_eq!(error.user_exception_language.as_deref(), Some("lua"));
}

#[test]
fn test_recrash_in_user_callback() {
    let dir = tempfile::tempdir().unwrap();
    let monitors = MonitorSet {
        mach_exception: false,
        signal: true,
        panic: false,
        watchdog: false,
        user_reported: false,
    };
    let config = config_with(monitors, dir.path());

    fn crashing_callback(
        encoder: &mut datadog_apple_crashtracker::json::JsonEncoder<
            '_,
            datadog_apple_crashtracker::json::FdSink,
        >,
    ) {
        let _ = encoder.add_string(Some("note"), "about to fault");
        // SAFETY: deliberate fault inside the user section.
        unsafe {
            std::ptr::read_volatile(0x20 as *const u32);
        }
    }

    let status = in_forked_child(move || {
        datadog_apple_crashtracker::install(&config).unwrap();
        datadog_apple_crashtracker::set_crash_notify_callback(Some(crashing_callback));
        // SAFETY: the primary deliberate fault.
        unsafe {
            std::ptr::write_volatile(std::ptr::null_mut::<u32>(), 1);
        }
    });
    assert!(libc::WIFSIGNALED(status));

    // Primary report (possibly truncated mid-callback) plus a recrash
    // artifact, both present.
    let reports = report_paths(dir.path());
    assert_eq!(reports.len(), 1);
    let primary = std::fs::read_to_string(&reports[0]).unwrap();
    // The primary preserved its error info up to the callback point.
    assert!(primary.contains("\"signal_name\":\"SIGSEGV\""));
    assert!(primary.contains("\"error\""));

    let recrash: Vec<PathBuf> = std::fs::read_dir(dir.path())
        .unwrap()
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.to_str().map(|s| s.ends_with(".recrash.json")).unwrap_or(false))
        .collect();
    assert_eq!(recrash.len(), 1, "expected a recrash artifact");
    let recrash_raw = std::fs::read_to_string(&recrash[0]).unwrap();
    let value: serde_json::Value = serde_json::from_str(&recrash_raw).unwrap();
    assert_eq!(value["recrash_report"], true);
    assert_eq!(value["crash"]["error"]["type"], "signal");
}

#[test]
fn test_second_install_returns_already_installed() {
    let dir = tempfile::tempdir().unwrap();
    let monitors = MonitorSet {
        mach_exception: false,
        signal: true,
        panic: false,
        watchdog: false,
        user_reported: true,
    };
    let config = config_with(monitors, dir.path());
    let state_path = config.crash_state_path();

    let status = in_forked_child(move || {
        datadog_apple_crashtracker::install(&config).unwrap();
        let state_before = std::fs::read(&state_path).unwrap();
        match datadog_apple_crashtracker::install(&config) {
            Err(datadog_apple_crashtracker::InstallError::AlreadyInstalled) => {}
            other => {
                eprintln!("unexpected second install result: {other:?}");
                libc::_exit(1);
            }
        }
        // The failed install must not have touched the state file.
        let state_after = std::fs::read(&state_path).unwrap();
        if state_before != state_after {
            libc::_exit(2);
        }
        libc::_exit(42);
    });
    assert!(libc::WIFEXITED(status));
    assert_eq!(libc::WEXITSTATUS(status), 42);
}

#[test]
fn test_watchdog_detects_hang() {
    let dir = tempfile::tempdir().unwrap();
    let monitors = MonitorSet {
        mach_exception: false,
        signal: false,
        panic: false,
        watchdog: true,
        user_reported: false,
    };
    let config = config_with(monitors, dir.path());

    let status = in_forked_child(move || {
        datadog_apple_crashtracker::install(&config).unwrap();
        for _ in 0..3 {
            datadog_apple_crashtracker::collector::api::heartbeat();
            std::thread::sleep(Duration::from_millis(30));
        }
        // Stall well past the 300ms threshold without heartbeats.
        std::thread::sleep(Duration::from_millis(1200));
        libc::_exit(42);
    });
    assert!(libc::WIFEXITED(status));
    assert_eq!(libc::WEXITSTATUS(status), 42);

    let report = load_single_report(dir.path());
    assert_eq!(report.crash.error.error_type, "deadlock");
    assert_eq!(report.crash.error.signal, libc::SIGABRT as u64);

    // The hang sidecar exists under this run's directory.
    let run_dir = dir.path().join("RunSidecars");
    let sidecars: Vec<PathBuf> = walk(&run_dir)
        .into_iter()
        .filter(|p| p.extension().map(|e| e == "ksscr").unwrap_or(false))
        .collect();
    assert_eq!(sidecars.len(), 1);
    assert_eq!(std::fs::metadata(&sidecars[0]).unwrap().len(), 24);
}

fn walk(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                out.extend(walk(&path));
            } else {
                out.push(path);
            }
        }
    }
    out
}
