// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Streaming JSON encoder for the capture path.
//!
//! `serde_json` allocates; nothing that allocates may run in a signal
//! handler. This encoder is a small state machine over an explicit,
//! bounded container stack with no recursion and no heap. The sink is a trait so
//! the report writer can point it at a raw file descriptor while tests
//! collect bytes in memory.
//!
//! Output is always structurally valid JSON: errors latch a flag and turn
//! subsequent operations into no-ops, and embedded pre-encoded fragments
//! that fail validation are replaced by an `{"error", "json_data"}` object
//! rather than corrupting the document.

use crate::shared::constants::{JSON_MAX_DEPTH, TEXT_FILE_CHUNK};
use crate::shared::fd_log;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JsonError {
    #[error("sink rejected data")]
    SinkFailed,
    #[error("container depth limit exceeded")]
    TooDeep,
    #[error("unbalanced container close")]
    NotInContainer,
    #[error("operation invalid while building a string")]
    InString,
    #[error("operation requires an open string")]
    NotInString,
    #[error("encoder already failed")]
    Latched,
    #[error("invalid JSON fragment")]
    InvalidFragment,
    #[error("could not read file")]
    FileUnreadable,
}

/// Destination of encoded bytes. `write` returns false on failure; the
/// encoder latches and stops.
pub trait JsonSink {
    fn write(&mut self, bytes: &[u8]) -> bool;
}

/// Sink over a raw file descriptor; loops on partial writes.
pub struct FdSink {
    fd: i32,
}

impl FdSink {
    pub fn new(fd: i32) -> Self {
        Self { fd }
    }
}

impl JsonSink for FdSink {
    fn write(&mut self, bytes: &[u8]) -> bool {
        fd_log::write_fully(self.fd, bytes)
    }
}

/// Test/normal-mode sink collecting into a buffer.
#[derive(Default)]
pub struct VecSink {
    pub bytes: Vec<u8>,
}

impl JsonSink for VecSink {
    fn write(&mut self, bytes: &[u8]) -> bool {
        self.bytes.extend_from_slice(bytes);
        true
    }
}

#[derive(Clone, Copy, Default)]
struct Container {
    is_object: bool,
    has_elements: bool,
}

pub struct JsonEncoder<'s, S: JsonSink> {
    sink: &'s mut S,
    containers: [Container; JSON_MAX_DEPTH],
    depth: usize,
    in_string: bool,
    failed: bool,
}

/// `core::fmt` adapter over a stack buffer, for numbers.
struct StackWriter<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl core::fmt::Write for StackWriter<'_> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let bytes = s.as_bytes();
        if self.len + bytes.len() > self.buf.len() {
            return Err(core::fmt::Error);
        }
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(())
    }
}

macro_rules! fmt_to_stack {
    ($buf:expr, $($arg:tt)*) => {{
        let mut w = StackWriter { buf: $buf, len: 0 };
        let _ = core::fmt::write(&mut w, format_args!($($arg)*));
        w.len
    }};
}

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

impl<'s, S: JsonSink> JsonEncoder<'s, S> {
    pub fn new(sink: &'s mut S) -> Self {
        Self {
            sink,
            containers: [Container::default(); JSON_MAX_DEPTH],
            depth: 0,
            in_string: false,
            failed: false,
        }
    }

    /// Whether any operation has failed since construction.
    pub fn has_failed(&self) -> bool {
        self.failed
    }

    fn emit(&mut self, bytes: &[u8]) -> Result<(), JsonError> {
        if self.failed {
            return Err(JsonError::Latched);
        }
        if self.sink.write(bytes) {
            Ok(())
        } else {
            self.failed = true;
            Err(JsonError::SinkFailed)
        }
    }

    fn check_ready(&self) -> Result<(), JsonError> {
        if self.failed {
            return Err(JsonError::Latched);
        }
        if self.in_string {
            return Err(JsonError::InString);
        }
        Ok(())
    }

    /// Comma-separate from the previous element and emit the name when the
    /// enclosing container is an object.
    fn begin_element(&mut self, name: Option<&str>) -> Result<(), JsonError> {
        self.check_ready()?;
        if self.depth > 0 {
            let index = self.depth - 1;
            if self.containers[index].has_elements {
                self.emit(b",")?;
            }
            self.containers[index].has_elements = true;
            if self.containers[index].is_object {
                let name = name.unwrap_or("null");
                self.emit(b"\"")?;
                self.emit_string_body(name.as_bytes())?;
                self.emit(b"\":")?;
            }
        }
        Ok(())
    }

    fn push_container(&mut self, is_object: bool) -> Result<(), JsonError> {
        if self.depth >= JSON_MAX_DEPTH {
            self.failed = true;
            return Err(JsonError::TooDeep);
        }
        self.containers[self.depth] = Container {
            is_object,
            has_elements: false,
        };
        self.depth += 1;
        Ok(())
    }

    pub fn begin_object(&mut self, name: Option<&str>) -> Result<(), JsonError> {
        self.begin_element(name)?;
        self.push_container(true)?;
        self.emit(b"{")
    }

    pub fn begin_array(&mut self, name: Option<&str>) -> Result<(), JsonError> {
        self.begin_element(name)?;
        self.push_container(false)?;
        self.emit(b"[")
    }

    pub fn end_container(&mut self) -> Result<(), JsonError> {
        self.check_ready()?;
        if self.depth == 0 {
            return Err(JsonError::NotInContainer);
        }
        self.depth -= 1;
        let closer: &[u8] = if self.containers[self.depth].is_object {
            b"}"
        } else {
            b"]"
        };
        self.emit(closer)
    }

    /// Close every open container. The document is complete afterwards.
    pub fn end(&mut self) -> Result<(), JsonError> {
        while self.depth > 0 {
            self.end_container()?;
        }
        Ok(())
    }

    pub fn add_null(&mut self, name: Option<&str>) -> Result<(), JsonError> {
        self.begin_element(name)?;
        self.emit(b"null")
    }

    pub fn add_bool(&mut self, name: Option<&str>, value: bool) -> Result<(), JsonError> {
        self.begin_element(name)?;
        self.emit(if value { b"true" } else { b"false" })
    }

    pub fn add_int(&mut self, name: Option<&str>, value: i64) -> Result<(), JsonError> {
        self.begin_element(name)?;
        let mut buf = [0u8; 24];
        let len = fmt_to_stack!(&mut buf, "{value}");
        self.emit(&buf[..len])
    }

    pub fn add_uint(&mut self, name: Option<&str>, value: u64) -> Result<(), JsonError> {
        self.begin_element(name)?;
        let mut buf = [0u8; 24];
        let len = fmt_to_stack!(&mut buf, "{value}");
        self.emit(&buf[..len])
    }

    pub fn add_float(&mut self, name: Option<&str>, value: f64) -> Result<(), JsonError> {
        self.begin_element(name)?;
        if !value.is_finite() {
            // JSON has no NaN/Inf.
            return self.emit(b"null");
        }
        let mut buf = [0u8; 40];
        let len = fmt_to_stack!(&mut buf, "{value:?}");
        self.emit(&buf[..len])
    }

    pub fn add_string(&mut self, name: Option<&str>, value: &str) -> Result<(), JsonError> {
        self.begin_element(name)?;
        self.emit(b"\"")?;
        self.emit_string_body(value.as_bytes())?;
        self.emit(b"\"")
    }

    /// Raw bytes rendered as lowercase hex.
    pub fn add_data(&mut self, name: Option<&str>, data: &[u8]) -> Result<(), JsonError> {
        self.begin_string(name)?;
        let mut chunk = [0u8; 64];
        for block in data.chunks(32) {
            let mut len = 0;
            for &byte in block {
                chunk[len] = HEX_DIGITS[(byte >> 4) as usize];
                chunk[len + 1] = HEX_DIGITS[(byte & 0xF) as usize];
                len += 2;
            }
            self.emit(&chunk[..len])?;
        }
        self.end_string()
    }

    /// A 16-byte UUID as 8-4-4-4-12 lowercase hex.
    pub fn add_uuid(&mut self, name: Option<&str>, uuid: &[u8; 16]) -> Result<(), JsonError> {
        self.begin_element(name)?;
        let mut buf = [0u8; 38];
        buf[0] = b'"';
        let mut pos = 1;
        for (i, &byte) in uuid.iter().enumerate() {
            if i == 4 || i == 6 || i == 8 || i == 10 {
                buf[pos] = b'-';
                pos += 1;
            }
            buf[pos] = HEX_DIGITS[(byte >> 4) as usize];
            buf[pos + 1] = HEX_DIGITS[(byte & 0xF) as usize];
            pos += 2;
        }
        buf[pos] = b'"';
        pos += 1;
        self.emit(&buf[..pos])
    }

    /// Open a string element to be filled piecewise with `append_string`.
    pub fn begin_string(&mut self, name: Option<&str>) -> Result<(), JsonError> {
        self.begin_element(name)?;
        self.emit(b"\"")?;
        self.in_string = true;
        Ok(())
    }

    /// Append raw bytes to the open string, escaping as needed.
    pub fn append_string(&mut self, bytes: &[u8]) -> Result<(), JsonError> {
        if self.failed {
            return Err(JsonError::Latched);
        }
        if !self.in_string {
            return Err(JsonError::NotInString);
        }
        self.emit_string_body(bytes)
    }

    pub fn end_string(&mut self) -> Result<(), JsonError> {
        if !self.in_string {
            return Err(JsonError::NotInString);
        }
        self.in_string = false;
        self.emit(b"\"")
    }

    /// Stream a text file's contents in as a string element, 512 bytes at a
    /// time. Uses only `open`/`read`/`close`.
    pub fn add_text_file_element(&mut self, name: Option<&str>, path: &str) -> Result<(), JsonError> {
        let mut cpath = [0u8; 1024];
        if path.len() + 1 > cpath.len() {
            return Err(JsonError::FileUnreadable);
        }
        cpath[..path.len()].copy_from_slice(path.as_bytes());
        // SAFETY: NUL-terminated buffer built above.
        let fd = unsafe { libc::open(cpath.as_ptr() as *const libc::c_char, libc::O_RDONLY) };
        if fd < 0 {
            return Err(JsonError::FileUnreadable);
        }

        self.begin_string(name)?;
        let mut buffer = [0u8; TEXT_FILE_CHUNK];
        loop {
            // SAFETY: buffer pointer/len from a valid stack array.
            let n = unsafe { libc::read(fd, buffer.as_mut_ptr() as *mut libc::c_void, buffer.len()) };
            if n <= 0 {
                break;
            }
            if self.append_string(&buffer[..n as usize]).is_err() {
                break;
            }
        }
        // SAFETY: fd from the open above.
        unsafe { libc::close(fd) };
        self.end_string()
    }

    /// Embed a pre-encoded JSON fragment. An invalid fragment is replaced
    /// with `{"error": …, "json_data": <fragment-as-string>}` so the
    /// document stays parseable.
    pub fn add_json_element(&mut self, name: Option<&str>, fragment: &[u8]) -> Result<(), JsonError> {
        if validate_fragment(fragment) {
            self.begin_element(name)?;
            self.emit(fragment)
        } else {
            self.begin_object(name)?;
            self.add_string(Some("error"), "Invalid JSON data")?;
            self.begin_string(Some("json_data"))?;
            self.append_string(fragment)?;
            self.end_string()?;
            self.end_container()?;
            Err(JsonError::InvalidFragment)
        }
    }

    fn emit_string_body(&mut self, bytes: &[u8]) -> Result<(), JsonError> {
        // Escape into a bounded scratch buffer, flushing per chunk. UTF-8
        // continuation bytes pass through untouched.
        let mut scratch = [0u8; 256];
        let mut len = 0usize;
        for &byte in bytes {
            if len + 6 > scratch.len() {
                let flush = len;
                len = 0;
                self.emit_scratch(&scratch, flush)?;
            }
            match byte {
                b'"' => {
                    scratch[len..len + 2].copy_from_slice(b"\\\"");
                    len += 2;
                }
                b'\\' => {
                    scratch[len..len + 2].copy_from_slice(b"\\\\");
                    len += 2;
                }
                0x08 => {
                    scratch[len..len + 2].copy_from_slice(b"\\b");
                    len += 2;
                }
                0x0C => {
                    scratch[len..len + 2].copy_from_slice(b"\\f");
                    len += 2;
                }
                b'\n' => {
                    scratch[len..len + 2].copy_from_slice(b"\\n");
                    len += 2;
                }
                b'\r' => {
                    scratch[len..len + 2].copy_from_slice(b"\\r");
                    len += 2;
                }
                b'\t' => {
                    scratch[len..len + 2].copy_from_slice(b"\\t");
                    len += 2;
                }
                0x00..=0x1F => {
                    scratch[len..len + 4].copy_from_slice(b"\\u00");
                    scratch[len + 4] = HEX_DIGITS[(byte >> 4) as usize];
                    scratch[len + 5] = HEX_DIGITS[(byte & 0xF) as usize];
                    len += 6;
                }
                _ => {
                    scratch[len] = byte;
                    len += 1;
                }
            }
        }
        if len > 0 {
            self.emit_scratch(&scratch, len)?;
        }
        Ok(())
    }

    fn emit_scratch(&mut self, scratch: &[u8; 256], len: usize) -> Result<(), JsonError> {
        self.emit(&scratch[..len])
    }
}

/// Structural validation of a JSON fragment without allocation or
/// recursion: token scanner plus an explicit container stack.
pub fn validate_fragment(bytes: &[u8]) -> bool {
    #[derive(Clone, Copy, PartialEq)]
    enum Expect {
        Value,
        CommaOrClose,
        KeyOrClose,
        Key,
        Colon,
    }

    let mut stack = [false; JSON_MAX_DEPTH]; // true = object
    let mut depth = 0usize;
    let mut expect = Expect::Value;
    let mut pos = 0usize;
    let len = bytes.len();

    fn skip_ws(bytes: &[u8], pos: &mut usize) {
        while *pos < bytes.len() && matches!(bytes[*pos], b' ' | b'\t' | b'\n' | b'\r') {
            *pos += 1;
        }
    }

    fn skip_string(bytes: &[u8], pos: &mut usize) -> bool {
        // On entry *pos is at the opening quote.
        *pos += 1;
        while *pos < bytes.len() {
            match bytes[*pos] {
                b'\\' => {
                    *pos += 2;
                }
                b'"' => {
                    *pos += 1;
                    return true;
                }
                _ => *pos += 1,
            }
        }
        false
    }

    fn skip_scalar(bytes: &[u8], pos: &mut usize) -> bool {
        let start = *pos;
        while *pos < bytes.len()
            && !matches!(bytes[*pos], b',' | b']' | b'}' | b' ' | b'\t' | b'\n' | b'\r')
        {
            *pos += 1;
        }
        let token = &bytes[start..*pos];
        if token.is_empty() {
            return false;
        }
        matches!(token, b"true" | b"false" | b"null")
            || token.iter().all(|&b| {
                b.is_ascii_digit() || matches!(b, b'-' | b'+' | b'.' | b'e' | b'E')
            })
    }

    loop {
        skip_ws(bytes, &mut pos);
        if pos >= len {
            return false;
        }
        match expect {
            Expect::Value => match bytes[pos] {
                b'{' => {
                    if depth >= JSON_MAX_DEPTH {
                        return false;
                    }
                    stack[depth] = true;
                    depth += 1;
                    pos += 1;
                    expect = Expect::KeyOrClose;
                }
                b'[' => {
                    if depth >= JSON_MAX_DEPTH {
                        return false;
                    }
                    stack[depth] = false;
                    depth += 1;
                    pos += 1;
                    skip_ws(bytes, &mut pos);
                    if pos < len && bytes[pos] == b']' {
                        depth -= 1;
                        pos += 1;
                        if depth == 0 {
                            break;
                        }
                        expect = Expect::CommaOrClose;
                    } else {
                        expect = Expect::Value;
                    }
                }
                b'"' => {
                    if !skip_string(bytes, &mut pos) {
                        return false;
                    }
                    if depth == 0 {
                        break;
                    }
                    expect = Expect::CommaOrClose;
                }
                _ => {
                    if !skip_scalar(bytes, &mut pos) {
                        return false;
                    }
                    if depth == 0 {
                        break;
                    }
                    expect = Expect::CommaOrClose;
                }
            },
            Expect::KeyOrClose => match bytes[pos] {
                b'}' => {
                    depth -= 1;
                    pos += 1;
                    if depth == 0 {
                        break;
                    }
                    expect = Expect::CommaOrClose;
                }
                b'"' => {
                    if !skip_string(bytes, &mut pos) {
                        return false;
                    }
                    expect = Expect::Colon;
                }
                _ => return false,
            },
            Expect::Key => match bytes[pos] {
                b'"' => {
                    if !skip_string(bytes, &mut pos) {
                        return false;
                    }
                    expect = Expect::Colon;
                }
                _ => return false,
            },
            Expect::Colon => match bytes[pos] {
                b':' => {
                    pos += 1;
                    expect = Expect::Value;
                }
                _ => return false,
            },
            Expect::CommaOrClose => {
                let in_object = stack[depth - 1];
                match bytes[pos] {
                    b',' => {
                        pos += 1;
                        expect = if in_object { Expect::Key } else { Expect::Value };
                    }
                    b'}' if in_object => {
                        depth -= 1;
                        pos += 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    b']' if !in_object => {
                        depth -= 1;
                        pos += 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    _ => return false,
                }
            }
        }
    }

    // Only trailing whitespace may remain.
    skip_ws(bytes, &mut pos);
    pos == len
}
