// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Persistent application state across launches.
//!
//! Tracks sessions, launches, and cumulative active/background durations,
//! plus the crashed-last-launch flag, in a small JSON file. Loaded at init
//! (a version mismatch resets to first-launch state), rewritten at every
//! state transition, and flushed one last time from the crash handler.
//!
//! Outside signal context the store is guarded by a mutex. The crash-time
//! rewrite runs lock-free and hand-emits the JSON through the async-safe
//! encoder: the race with a concurrent transition is accepted because the
//! process is dying.

use crate::json::{FdSink, JsonEncoder};
use crate::shared::constants::CRASH_STATE_VERSION;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64};
use std::sync::Mutex;
use std::time::Instant;

/// The persisted fields, exactly as they appear on disk.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CrashState {
    pub version: i64,
    #[serde(rename = "crashedLastLaunch")]
    pub crashed_last_launch: bool,
    #[serde(rename = "activeDurationSinceLastCrash")]
    pub active_duration_since_last_crash: f64,
    #[serde(rename = "backgroundDurationSinceLastCrash")]
    pub background_duration_since_last_crash: f64,
    #[serde(rename = "launchesSinceLastCrash")]
    pub launches_since_last_crash: i64,
    #[serde(rename = "sessionsSinceLastCrash")]
    pub sessions_since_last_crash: i64,
}

impl Default for CrashState {
    fn default() -> Self {
        Self {
            version: CRASH_STATE_VERSION,
            crashed_last_launch: false,
            active_duration_since_last_crash: 0.0,
            background_duration_since_last_crash: 0.0,
            launches_since_last_crash: 0,
            sessions_since_last_crash: 0,
        }
    }
}

/// A capture-time copy of the tracker's counters, embedded in reports.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateSnapshot {
    pub crashed_last_launch: bool,
    pub active_duration_since_last_crash: f64,
    pub background_duration_since_last_crash: f64,
    pub launches_since_last_crash: i64,
    pub sessions_since_last_crash: i64,
    pub sessions_since_launch: i64,
    pub active_duration_since_launch: f64,
    pub background_duration_since_launch: f64,
    pub application_active: bool,
    pub application_in_foreground: bool,
}

impl StateSnapshot {
    pub const fn empty() -> Self {
        Self {
            crashed_last_launch: false,
            active_duration_since_last_crash: 0.0,
            background_duration_since_last_crash: 0.0,
            launches_since_last_crash: 0,
            sessions_since_last_crash: 0,
            sessions_since_launch: 0,
            active_duration_since_launch: 0.0,
            background_duration_since_launch: 0.0,
            application_active: false,
            application_in_foreground: false,
        }
    }
}

// Mirror of the tracker used by the async-safe crash path. Durations are
// stored as f64 bits in u64 atomics; they are only ever written under the
// mutex or during the final crash flush.
struct Tracker {
    crashed_last_launch: AtomicBool,
    crashed: AtomicBool,
    active_since_last_crash_bits: AtomicU64,
    background_since_last_crash_bits: AtomicU64,
    active_since_launch_bits: AtomicU64,
    background_since_launch_bits: AtomicU64,
    launches_since_last_crash: AtomicU32,
    sessions_since_last_crash: AtomicU32,
    sessions_since_launch: AtomicU32,
    application_active: AtomicBool,
    application_in_foreground: AtomicBool,
}

static TRACKER: Tracker = Tracker {
    crashed_last_launch: AtomicBool::new(false),
    crashed: AtomicBool::new(false),
    active_since_last_crash_bits: AtomicU64::new(0),
    background_since_last_crash_bits: AtomicU64::new(0),
    active_since_launch_bits: AtomicU64::new(0),
    background_since_launch_bits: AtomicU64::new(0),
    launches_since_last_crash: AtomicU32::new(0),
    sessions_since_last_crash: AtomicU32::new(0),
    sessions_since_launch: AtomicU32::new(0),
    application_active: AtomicBool::new(false),
    application_in_foreground: AtomicBool::new(false),
};

struct PathState {
    path: Option<PathBuf>,
    transition_time: Option<Instant>,
}

static PATH_STATE: Mutex<PathState> = Mutex::new(PathState {
    path: None,
    transition_time: None,
});

// Crash-time copy of the state file path, written once at init so the
// signal path never touches the mutex.
static CRASH_PATH: PathCell = PathCell::new();

struct PathCell {
    buf: core::cell::UnsafeCell<[u8; 1024]>,
    len: AtomicU32,
}
// SAFETY: written once at init before any handler can run; read-only after.
unsafe impl Sync for PathCell {}

impl PathCell {
    const fn new() -> Self {
        Self {
            buf: core::cell::UnsafeCell::new([0; 1024]),
            len: AtomicU32::new(0),
        }
    }

    fn store(&self, path: &Path) {
        let bytes = path.as_os_str().as_encoded_bytes();
        let take = bytes.len().min(1023);
        // SAFETY: init-time single writer.
        unsafe {
            (&mut *self.buf.get())[..take].copy_from_slice(&bytes[..take]);
        }
        self.len.store(take as u32, SeqCst);
    }

    fn as_bytes(&self) -> &[u8] {
        let len = self.len.load(SeqCst) as usize;
        // SAFETY: immutable after init.
        unsafe { &(&*self.buf.get())[..len] }
    }
}

fn load_f64(bits: &AtomicU64) -> f64 {
    f64::from_bits(bits.load(SeqCst))
}

fn store_f64(bits: &AtomicU64, value: f64) {
    bits.store(value.to_bits(), SeqCst);
}

fn add_f64(bits: &AtomicU64, delta: f64) {
    store_f64(bits, load_f64(bits) + delta);
}

/// Load (or initialize) the state file, fold in this launch, and write the
/// updated state back.
pub fn init(path: &Path) -> anyhow::Result<()> {
    let loaded = match std::fs::read(path) {
        Ok(bytes) => match serde_json::from_slice::<CrashState>(&bytes) {
            Ok(state) if state.version == CRASH_STATE_VERSION => Some(state),
            Ok(state) => {
                tracing::warn!(version = state.version, "state file version mismatch");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not parse state file");
                None
            }
        },
        // Expected on first launch.
        Err(_) => None,
    };
    let previous = loaded.unwrap_or_default();

    TRACKER
        .crashed_last_launch
        .store(previous.crashed_last_launch, SeqCst);
    TRACKER.crashed.store(false, SeqCst);
    if previous.crashed_last_launch {
        store_f64(&TRACKER.active_since_last_crash_bits, 0.0);
        store_f64(&TRACKER.background_since_last_crash_bits, 0.0);
        TRACKER.launches_since_last_crash.store(0, SeqCst);
        TRACKER.sessions_since_last_crash.store(0, SeqCst);
    } else {
        store_f64(
            &TRACKER.active_since_last_crash_bits,
            previous.active_duration_since_last_crash,
        );
        store_f64(
            &TRACKER.background_since_last_crash_bits,
            previous.background_duration_since_last_crash,
        );
        TRACKER
            .launches_since_last_crash
            .store(previous.launches_since_last_crash as u32, SeqCst);
        TRACKER
            .sessions_since_last_crash
            .store(previous.sessions_since_last_crash as u32, SeqCst);
    }
    store_f64(&TRACKER.active_since_launch_bits, 0.0);
    store_f64(&TRACKER.background_since_launch_bits, 0.0);
    TRACKER.sessions_since_launch.store(1, SeqCst);

    // This launch is itself a new launch and session.
    TRACKER.launches_since_last_crash.fetch_add(1, SeqCst);
    TRACKER.sessions_since_last_crash.fetch_add(1, SeqCst);
    TRACKER.application_in_foreground.store(true, SeqCst);

    {
        let mut guard = PATH_STATE.lock().expect("state mutex poisoned");
        guard.path = Some(path.to_path_buf());
        guard.transition_time = Some(Instant::now());
    }
    CRASH_PATH.store(path);

    save()
}

fn current_state(crashed: bool) -> CrashState {
    CrashState {
        version: CRASH_STATE_VERSION,
        crashed_last_launch: crashed,
        active_duration_since_last_crash: load_f64(&TRACKER.active_since_last_crash_bits),
        background_duration_since_last_crash: load_f64(&TRACKER.background_since_last_crash_bits),
        launches_since_last_crash: TRACKER.launches_since_last_crash.load(SeqCst) as i64,
        sessions_since_last_crash: TRACKER.sessions_since_last_crash.load(SeqCst) as i64,
    }
}

fn save() -> anyhow::Result<()> {
    let guard = PATH_STATE.lock().expect("state mutex poisoned");
    let Some(path) = guard.path.as_ref() else {
        anyhow::bail!("crash state not initialized");
    };
    let state = current_state(TRACKER.crashed.load(SeqCst));
    let json = serde_json::to_string(&state)?;
    std::fs::write(path, json)?;
    Ok(())
}

fn elapsed_and_restart(guard: &mut PathState) -> f64 {
    let now = Instant::now();
    let elapsed = guard
        .transition_time
        .map(|t| now.duration_since(t).as_secs_f64())
        .unwrap_or(0.0);
    guard.transition_time = Some(now);
    elapsed
}

/// The application became active (true) or inactive (false).
pub fn notify_active(is_active: bool) {
    {
        let mut guard = PATH_STATE.lock().expect("state mutex poisoned");
        let duration = elapsed_and_restart(&mut guard);
        if !is_active && TRACKER.application_active.load(SeqCst) {
            add_f64(&TRACKER.active_since_last_crash_bits, duration);
            add_f64(&TRACKER.active_since_launch_bits, duration);
        }
        TRACKER.application_active.store(is_active, SeqCst);
    }
    let _ = save();
}

/// The application entered (true) or left (false) the foreground. Entering
/// the foreground starts a new session.
pub fn notify_foreground(in_foreground: bool) {
    {
        let mut guard = PATH_STATE.lock().expect("state mutex poisoned");
        let duration = elapsed_and_restart(&mut guard);
        if in_foreground {
            add_f64(&TRACKER.background_since_last_crash_bits, duration);
            add_f64(&TRACKER.background_since_launch_bits, duration);
            TRACKER.sessions_since_last_crash.fetch_add(1, SeqCst);
            TRACKER.sessions_since_launch.fetch_add(1, SeqCst);
        }
        TRACKER.application_in_foreground.store(in_foreground, SeqCst);
    }
    let _ = save();
}

/// Clean termination; flush durations.
pub fn notify_terminate() {
    {
        let mut guard = PATH_STATE.lock().expect("state mutex poisoned");
        let duration = elapsed_and_restart(&mut guard);
        add_f64(&TRACKER.background_since_last_crash_bits, duration);
        add_f64(&TRACKER.background_since_launch_bits, duration);
    }
    let _ = save();
}

/// Capture-time counters for the report.
pub fn snapshot() -> StateSnapshot {
    StateSnapshot {
        crashed_last_launch: TRACKER.crashed_last_launch.load(SeqCst),
        active_duration_since_last_crash: load_f64(&TRACKER.active_since_last_crash_bits),
        background_duration_since_last_crash: load_f64(&TRACKER.background_since_last_crash_bits),
        launches_since_last_crash: TRACKER.launches_since_last_crash.load(SeqCst) as i64,
        sessions_since_last_crash: TRACKER.sessions_since_last_crash.load(SeqCst) as i64,
        sessions_since_launch: TRACKER.sessions_since_launch.load(SeqCst) as i64,
        active_duration_since_launch: load_f64(&TRACKER.active_since_launch_bits),
        background_duration_since_launch: load_f64(&TRACKER.background_since_launch_bits),
        application_active: TRACKER.application_active.load(SeqCst),
        application_in_foreground: TRACKER.application_in_foreground.load(SeqCst),
    }
}

/// Crash-time flush. Lock-free and allocation-free: hand-emits the state
/// JSON to the file through the async-safe encoder. Racing a concurrent
/// transition write is accepted; the process is dying.
pub fn notify_crash_from_handler() {
    TRACKER.crashed.store(true, SeqCst);

    let path = CRASH_PATH.as_bytes();
    if path.is_empty() {
        return;
    }
    let mut cpath = [0u8; 1024];
    if path.len() >= cpath.len() {
        return;
    }
    cpath[..path.len()].copy_from_slice(path);
    // SAFETY: NUL-terminated buffer built above; O_TRUNC rewrite.
    let fd = unsafe {
        libc::open(
            cpath.as_ptr() as *const libc::c_char,
            libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
            0o644,
        )
    };
    if fd < 0 {
        return;
    }

    let state = current_state(true);
    let mut sink = FdSink::new(fd);
    let mut encoder = JsonEncoder::new(&mut sink);
    let _ = encoder.begin_object(None);
    let _ = encoder.add_int(Some("version"), state.version);
    let _ = encoder.add_bool(Some("crashedLastLaunch"), true);
    let _ = encoder.add_float(
        Some("activeDurationSinceLastCrash"),
        state.active_duration_since_last_crash,
    );
    let _ = encoder.add_float(
        Some("backgroundDurationSinceLastCrash"),
        state.background_duration_since_last_crash,
    );
    let _ = encoder.add_int(
        Some("launchesSinceLastCrash"),
        state.launches_since_last_crash,
    );
    let _ = encoder.add_int(
        Some("sessionsSinceLastCrash"),
        state.sessions_since_last_crash,
    );
    let _ = encoder.end();
    // SAFETY: fd from the open above.
    unsafe { libc::close(fd) };
}
