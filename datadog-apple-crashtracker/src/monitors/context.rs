// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The monitor context: the clearing-house record filled in during one
//! exception event.
//!
//! Contexts live in static storage, since the capture path cannot allocate, and
//! are handed out by `notify`. Every field is a fixed-size buffer; strings
//! are truncated rather than grown.

use crate::collector::machine_context::MachineContext;
use crate::state::StateSnapshot;

/// Bounded, NUL-free string storage for capture-time text.
#[derive(Clone, Copy)]
pub struct FixedString<const N: usize> {
    buf: [u8; N],
    len: usize,
}

impl<const N: usize> FixedString<N> {
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            len: 0,
        }
    }

    /// Store `s`, truncating at the buffer size on a UTF-8 boundary.
    pub fn set(&mut self, s: &str) {
        let mut take = s.len().min(N);
        while take > 0 && !s.is_char_boundary(take) {
            take -= 1;
        }
        self.buf[..take].copy_from_slice(&s.as_bytes()[..take]);
        self.len = take;
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.buf[..self.len]).unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<const N: usize> Default for FixedString<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// What a sentry asks of `notify`. ORed into the process-wide policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlingRequirements {
    pub is_fatal: bool,
    pub requires_async_safety: bool,
    pub should_record_threads: bool,
    pub should_write_report: bool,
    pub should_exit_immediately: bool,
}

impl HandlingRequirements {
    /// The standard fatal-crash set used by the signal and Mach sentries.
    pub const fn fatal_crash() -> Self {
        Self {
            is_fatal: true,
            requires_async_safety: true,
            should_record_threads: true,
            should_write_report: true,
            should_exit_immediately: false,
        }
    }

    /// Non-fatal, report-only (user reports, hangs).
    pub const fn report_only(record_threads: bool) -> Self {
        Self {
            is_fatal: false,
            requires_async_safety: false,
            should_record_threads: record_threads,
            should_write_report: true,
            should_exit_immediately: false,
        }
    }
}

pub const MAX_PREBAKED_FRAMES: usize = 100;

/// Cause-specific payload, one variant per exception class.
pub enum CrashCause {
    None,
    Mach {
        exception: i32,
        code: i64,
        subcode: i64,
    },
    Signal {
        signo: i32,
        code: i32,
    },
    /// An uncaught language-level exception (the Rust panic hook).
    Panic {
        message: FixedString<512>,
        backtrace: [usize; MAX_PREBAKED_FRAMES],
        backtrace_len: usize,
    },
    User {
        name: FixedString<128>,
        reason: FixedString<512>,
        language: FixedString<32>,
        line_of_code: FixedString<128>,
        backtrace: [usize; MAX_PREBAKED_FRAMES],
        backtrace_len: usize,
        log_all_threads: bool,
    },
    Watchdog {
        stalled_for_ms: u64,
    },
}

impl CrashCause {
    /// The discriminator written to the report's `error.type` field.
    pub fn type_name(&self) -> &'static str {
        match self {
            CrashCause::None => "unknown",
            CrashCause::Mach { .. } => "mach",
            CrashCause::Signal { .. } => "signal",
            CrashCause::Panic { .. } => "panic",
            CrashCause::User { .. } => "user",
            CrashCause::Watchdog { .. } => "deadlock",
        }
    }
}

/// Everything the report writer needs about one exception event.
pub struct MonitorContext {
    /// Hyphenated event UUID (36 ASCII bytes).
    pub event_id: FixedString<40>,
    /// Id of the monitor that raised the event.
    pub monitor_id: &'static str,
    /// The policy in effect for this event.
    pub requirements: HandlingRequirements,
    pub crashed_during_exception_handling: bool,
    /// Register state of the offending thread, plus the suspended-threads
    /// snapshot when threads were recorded.
    pub offending_context: MachineContext,
    pub fault_address: usize,
    pub cause: CrashCause,
    /// Crash-state counters at the moment of the event.
    pub app_state: StateSnapshot,
    pub is_stack_overflow: bool,
    /// Overrides the pre-assigned report path when set (sidecar-style
    /// reports, hang reports).
    pub report_path_override: FixedString<1024>,
}

impl MonitorContext {
    pub const fn empty() -> Self {
        Self {
            event_id: FixedString::new(),
            monitor_id: "",
            requirements: HandlingRequirements {
                is_fatal: false,
                requires_async_safety: false,
                should_record_threads: false,
                should_write_report: false,
                should_exit_immediately: false,
            },
            crashed_during_exception_handling: false,
            offending_context: MachineContext::empty(),
            fault_address: 0,
            cause: CrashCause::None,
            app_state: StateSnapshot::empty(),
            is_stack_overflow: false,
            report_path_override: FixedString::new(),
        }
    }

    /// Reset for a fresh event, preserving nothing.
    pub fn reset(&mut self) {
        *self = Self::empty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_string_truncates_on_char_boundary() {
        let mut s = FixedString::<8>::new();
        s.set("hello");
        assert_eq!(s.as_str(), "hello");
        s.set("abcdefghij");
        assert_eq!(s.as_str(), "abcdefgh");
        // 'é' is two bytes; truncation must not split it.
        s.set("abcdefgé");
        assert_eq!(s.as_str(), "abcdefg");
        s.clear();
        assert!(s.is_empty());
    }

    #[test]
    fn test_cause_type_names() {
        assert_eq!(
            CrashCause::Mach {
                exception: 1,
                code: 0,
                subcode: 0
            }
            .type_name(),
            "mach"
        );
        assert_eq!(CrashCause::Signal { signo: 11, code: 0 }.type_name(), "signal");
        assert_eq!(CrashCause::None.type_name(), "unknown");
    }
}
