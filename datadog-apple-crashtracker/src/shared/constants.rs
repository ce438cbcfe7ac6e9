// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Capture-pipeline tunables and on-disk format constants.
//!
//! Everything here is either a hard limit sized for async-signal-safe static
//! allocation, or part of an externally visible format (report schema,
//! sidecar struct, file layout) and therefore must not change without a
//! version bump.

/// Version number written to every report.
pub const REPORT_VERSION_MAJOR: i64 = 1;
pub const REPORT_VERSION_MINOR: i64 = 0;

/// Maximum depth allowed for a backtrace in a report.
pub const MAX_BACKTRACE_DEPTH: usize = 50;

/// Length at which a backtrace is considered to represent a stack overflow.
/// Past this point we cut off from the top of the stack rather than the
/// bottom, keeping the innermost frames closest to the overflow point.
pub const OVERFLOW_THRESHOLD: usize = 200;

/// Hard bound on raw backtrace-length traversal during overflow detection.
pub const BACKTRACE_GIVE_UP_POINT: usize = 10_000;

/// Capacity of the monitor registry. Every slot starts empty.
pub const MONITOR_CAPACITY: usize = 100;

/// Capacity of the binary-image cache. Overflowing images are reported from
/// dyld directly but not cached.
pub const IMAGE_CACHE_CAPACITY: usize = 2000;

/// Capacity of the per-image unwind-section cache.
pub const UNWIND_CACHE_CAPACITY: usize = 512;

/// Maximum number of threads that can be marked reserved (never suspended).
pub const RESERVED_THREAD_CAPACITY: usize = 10;

/// Maximum number of suspended-thread handles recorded in a machine context.
pub const MAX_CAPTURED_THREADS: usize = 1000;

/// Longest path the stores will construct.
pub const MAX_PATH_LENGTH: usize = 1024;

/// Bytes of a report scanned when extracting the run id (the id lives in the
/// report header, well inside this window).
pub const RUN_ID_SCAN_WINDOW: usize = 2048;

/// Persistent crash-state file format version.
pub const CRASH_STATE_VERSION: i64 = 1;

/// Hang sidecar file magic ('kshs', little-endian) and current version.
pub const SIDECAR_MAGIC: i32 = 0x6b73_6873;
pub const SIDECAR_VERSION: u8 = 1;

/// Size of the on-disk sidecar struct, C-ABI padded.
pub const SIDECAR_SIZE: usize = 24;

/// Extension used by all sidecar files.
pub const SIDECAR_EXTENSION: &str = "ksscr";

/// Default number of reports kept on disk before pruning oldest-first.
pub const DEFAULT_MAX_REPORT_COUNT: usize = 5;

/// Maximum report file size the read path will load.
pub const MAX_REPORT_SIZE: usize = 20_000_000;

/// Maximum nesting depth of the streaming JSON encoder's container stack.
pub const JSON_MAX_DEPTH: usize = 64;

/// Chunk size used when streaming a text file into a report.
pub const TEXT_FILE_CHUNK: usize = 512;

/// Number of bytes of stack memory dumped per thread, on each side of SP.
pub const STACK_DUMP_BEFORE: usize = 64;
pub const STACK_DUMP_AFTER: usize = 512;
