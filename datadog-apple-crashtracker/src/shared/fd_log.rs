// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Async-signal-safe logging for the capture path.
//!
//! No logging framework is safe to call from a signal handler, so the
//! capture pipeline logs through raw `write(2)` to a file descriptor:
//! stderr by default, redirected to a log file at install time. Normal-mode
//! code (install, stores, report reading) uses `tracing` instead.
//!
//! Formatting is done into a stack buffer with no allocation. Only the
//! pieces the capture path actually needs are provided: plain messages,
//! and messages with one hex or decimal argument.

use std::sync::atomic::{AtomicI32, AtomicU8, Ordering::SeqCst};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

static LOG_FD: AtomicI32 = AtomicI32::new(2);
static MAX_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);

const PREFIX: &[u8] = b"[apple-crashtracker] ";

/// Redirect capture-path logging to `fd`. The fd must remain valid for the
/// life of the process; it is never closed by this module.
pub fn set_fd(fd: i32) {
    LOG_FD.store(fd, SeqCst);
}

pub fn fd() -> i32 {
    LOG_FD.load(SeqCst)
}

pub fn set_max_level(level: Level) {
    MAX_LEVEL.store(level as u8, SeqCst);
}

fn enabled(level: Level) -> bool {
    level as u8 <= MAX_LEVEL.load(SeqCst)
}

fn level_tag(level: Level) -> &'static [u8] {
    match level {
        Level::Error => b"ERROR: ",
        Level::Warn => b"WARN: ",
        Level::Info => b"INFO: ",
        Level::Debug => b"DEBUG: ",
    }
}

/// Write all of `bytes` to `fd`, looping on partial writes. EINTR retries,
/// any other error abandons the message.
pub(crate) fn write_fully(fd: i32, mut bytes: &[u8]) -> bool {
    while !bytes.is_empty() {
        // SAFETY: the pointer/len pair comes from a valid slice.
        let n = unsafe { libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
        if n < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno == libc::EINTR {
                continue;
            }
            return false;
        }
        if n == 0 {
            return false;
        }
        bytes = &bytes[n as usize..];
    }
    true
}

fn push(buf: &mut [u8; 512], len: &mut usize, part: &[u8]) {
    let take = part.len().min(buf.len() - 1 - *len);
    buf[*len..*len + take].copy_from_slice(&part[..take]);
    *len += take;
}

fn emit(level: Level, parts: &[&[u8]]) {
    if !enabled(level) {
        return;
    }
    let fd = LOG_FD.load(SeqCst);
    let mut buf = [0u8; 512];
    let mut len = 0usize;
    push(&mut buf, &mut len, PREFIX);
    push(&mut buf, &mut len, level_tag(level));
    for part in parts {
        push(&mut buf, &mut len, part);
    }
    buf[len] = b'\n';
    len += 1;
    write_fully(fd, &buf[..len]);
}

pub fn error(msg: &str) {
    emit(Level::Error, &[msg.as_bytes()]);
}

pub fn warn(msg: &str) {
    emit(Level::Warn, &[msg.as_bytes()]);
}

pub fn info(msg: &str) {
    emit(Level::Info, &[msg.as_bytes()]);
}

pub fn error_hex(msg: &str, value: u64) {
    let mut num = [0u8; 18];
    let len = format_hex(value, &mut num);
    emit(Level::Error, &[msg.as_bytes(), b" 0x", &num[..len]]);
}

pub fn warn_dec(msg: &str, value: i64) {
    let mut num = [0u8; 20];
    let len = format_dec(value, &mut num);
    emit(Level::Warn, &[msg.as_bytes(), b" ", &num[..len]]);
}

/// Render `value` as lowercase hex into `out`, returning the length used.
pub(crate) fn format_hex(mut value: u64, out: &mut [u8; 18]) -> usize {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    if value == 0 {
        out[0] = b'0';
        return 1;
    }
    let mut tmp = [0u8; 16];
    let mut n = 0;
    while value > 0 {
        tmp[n] = DIGITS[(value & 0xF) as usize];
        value >>= 4;
        n += 1;
    }
    for i in 0..n {
        out[i] = tmp[n - 1 - i];
    }
    n
}

/// Render `value` as decimal into `out`, returning the length used.
pub(crate) fn format_dec(value: i64, out: &mut [u8; 20]) -> usize {
    let mut idx = 0;
    let negative = value < 0;
    let mut magnitude = value.unsigned_abs();
    let mut tmp = [0u8; 20];
    let mut n = 0;
    if magnitude == 0 {
        tmp[0] = b'0';
        n = 1;
    }
    while magnitude > 0 {
        tmp[n] = b'0' + (magnitude % 10) as u8;
        magnitude /= 10;
        n += 1;
    }
    if negative {
        out[idx] = b'-';
        idx += 1;
    }
    for i in 0..n {
        out[idx + i] = tmp[n - 1 - i];
    }
    idx + n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_hex() {
        let mut buf = [0u8; 18];
        let len = format_hex(0, &mut buf);
        assert_eq!(&buf[..len], b"0");
        let len = format_hex(0xdead_beef, &mut buf);
        assert_eq!(&buf[..len], b"deadbeef");
        let len = format_hex(u64::MAX, &mut buf);
        assert_eq!(&buf[..len], b"ffffffffffffffff");
    }

    #[test]
    fn test_format_dec() {
        let mut buf = [0u8; 20];
        let len = format_dec(0, &mut buf);
        assert_eq!(&buf[..len], b"0");
        let len = format_dec(42, &mut buf);
        assert_eq!(&buf[..len], b"42");
        let len = format_dec(-7, &mut buf);
        assert_eq!(&buf[..len], b"-7");
        let len = format_dec(i64::MIN, &mut buf);
        assert_eq!(&buf[..len], b"-9223372036854775808");
    }

    #[test]
    fn test_write_fully_to_pipe() {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        assert!(write_fully(fds[1], b"hello"));
        let mut buf = [0u8; 8];
        let n = unsafe { libc::read(fds[0], buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        assert_eq!(n, 5);
        assert_eq!(&buf[..5], b"hello");
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
