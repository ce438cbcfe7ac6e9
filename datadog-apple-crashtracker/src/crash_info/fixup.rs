// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Report fixup pass.
//!
//! Runs over every report read back from disk, normalizing fields written
//! by older versions of the writer (or truncated by a mid-write death) so
//! downstream consumers only ever see the current schema.

use serde_json::{Map, Value};

/// Parse, normalize and re-serialize a raw report.
///
/// Normalizations applied:
/// - a report truncated mid-write (the process died while streaming) is
///   repaired by closing its open strings and containers;
/// - a legacy string `report_version` (`"1.0"`) becomes
///   `report_version_major`/`report_version_minor` integers;
/// - numeric fields written as strings (legacy hex addresses) are parsed
///   back to integers where the schema expects them;
/// - a missing `crash.binary_images` array is added empty;
/// - `backtrace_skipped` defaults to 0 on every thread.
pub fn fixup_report(raw: &str) -> anyhow::Result<String> {
    let mut value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(parse_err) => match repair_truncated(raw) {
            Some(repaired) => serde_json::from_str(&repaired)?,
            None => return Err(parse_err.into()),
        },
    };
    let Some(root) = value.as_object_mut() else {
        anyhow::bail!("report root is not an object");
    };

    fix_version(root);

    if let Some(crash) = root.get_mut("crash").and_then(Value::as_object_mut) {
        if !crash.contains_key("binary_images") {
            crash.insert("binary_images".into(), Value::Array(Vec::new()));
        }
        if let Some(threads) = crash.get_mut("threads").and_then(Value::as_array_mut) {
            for thread in threads.iter_mut() {
                if let Some(thread) = thread.as_object_mut() {
                    thread
                        .entry("backtrace_skipped")
                        .or_insert(Value::from(0i64));
                    if let Some(frames) =
                        thread.get_mut("backtrace").and_then(Value::as_array_mut)
                    {
                        for frame in frames.iter_mut() {
                            if let Some(frame) = frame.as_object_mut() {
                                for key in ["object_addr", "symbol_addr", "instruction_addr"] {
                                    fix_numeric_string(frame, key);
                                }
                            }
                        }
                    }
                }
            }
        }
        if let Some(error) = crash.get_mut("error").and_then(Value::as_object_mut) {
            fix_numeric_string(error, "address");
        }
    }

    Ok(serde_json::to_string(&value)?)
}

fn fix_version(root: &mut Map<String, Value>) {
    if root.contains_key("report_version_major") {
        return;
    }
    let (major, minor) = match root.get("report_version") {
        Some(Value::String(s)) => {
            let mut parts = s.splitn(2, '.');
            let major = parts.next().and_then(|p| p.parse().ok()).unwrap_or(1);
            let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
            (major, minor)
        }
        _ => (1, 0),
    };
    root.remove("report_version");
    root.insert("report_version_major".into(), Value::from(major));
    root.insert("report_version_minor".into(), Value::from(minor));
}

/// Best-effort repair of a report cut off mid-write: close the open
/// string, drop a dangling separator, and close every open container.
fn repair_truncated(raw: &str) -> Option<String> {
    let trimmed = raw.trim_end();
    if !trimmed.starts_with('{') {
        return None;
    }

    let mut closers: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for c in trimmed.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => closers.push('}'),
            '[' => closers.push(']'),
            '}' | ']' => {
                closers.pop()?;
            }
            _ => {}
        }
    }

    let mut repaired = String::with_capacity(trimmed.len() + closers.len() + 8);
    repaired.push_str(trimmed);
    if escaped {
        // A dangling escape can't be completed; drop it.
        repaired.pop();
    }
    if in_string {
        repaired.push('"');
    }
    match repaired.trim_end().chars().last() {
        Some(',') => {
            let cut = repaired.trim_end().len() - 1;
            repaired.truncate(cut);
        }
        Some(':') => repaired.push_str("null"),
        _ => {}
    }
    for closer in closers.iter().rev() {
        repaired.push(*closer);
    }
    Some(repaired)
}

/// Legacy writers emitted some addresses as `"0x1234"` strings.
fn fix_numeric_string(object: &mut Map<String, Value>, key: &str) {
    let Some(Value::String(s)) = object.get(key) else {
        return;
    };
    let parsed = if let Some(hex) = s.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse::<u64>().ok()
    };
    if let Some(number) = parsed {
        object.insert(key.into(), Value::from(number));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modern_report_passes_through() {
        let raw = r#"{"report_version_major": 1, "report_version_minor": 0,
                      "crash_id": "x", "timestamp": 1,
                      "crash": {"threads": [], "error": {"signal": 11, "type": "signal"},
                                "binary_images": []}}"#;
        let fixed = fixup_report(raw).unwrap();
        let value: Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(value["report_version_major"], 1);
    }

    #[test]
    fn test_legacy_version_string_is_split() {
        let raw = r#"{"report_version": "1.2", "crash": {"threads": [], "error": {"signal": 6, "type": "signal"}}}"#;
        let fixed = fixup_report(raw).unwrap();
        let value: Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(value["report_version_major"], 1);
        assert_eq!(value["report_version_minor"], 2);
        assert!(value.get("report_version").is_none());
        // binary_images materialized.
        assert!(value["crash"]["binary_images"].is_array());
    }

    #[test]
    fn test_hex_addresses_are_normalized() {
        let raw = r#"{"report_version_major": 1, "report_version_minor": 0,
            "crash": {"threads": [{"backtrace":
                [{"instruction_addr": "0xfff", "object_addr": "4096", "symbol_addr": 1}],
                "crashed": true}],
              "error": {"signal": 11, "type": "signal", "address": "0x10"}}}"#;
        let fixed = fixup_report(raw).unwrap();
        let value: Value = serde_json::from_str(&fixed).unwrap();
        let frame = &value["crash"]["threads"][0]["backtrace"][0];
        assert_eq!(frame["instruction_addr"], 0xfff);
        assert_eq!(frame["object_addr"], 4096);
        assert_eq!(frame["symbol_addr"], 1);
        assert_eq!(value["crash"]["threads"][0]["backtrace_skipped"], 0);
        assert_eq!(value["crash"]["error"]["address"], 0x10);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(fixup_report("not json").is_err());
        assert!(fixup_report("[1, 2]").is_err());
    }

    #[test]
    fn test_repairs_truncated_reports() {
        // Cut off inside a string value.
        let raw = r#"{"report_version_major": 1, "report_version_minor": 0,
            "crash": {"error": {"signal": 11, "type": "signal"}, "threads": []},
            "user_atcrash": {"note": "about to fau"#;
        let fixed = fixup_report(raw).unwrap();
        let value: Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(value["crash"]["error"]["signal"], 11);
        assert!(value["user_atcrash"]["note"].as_str().unwrap().starts_with("about"));

        // Cut off after a comma.
        let raw = r#"{"crash": {"threads": [{"crashed": true},"#;
        let fixed = fixup_report(raw).unwrap();
        let value: Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(value["crash"]["threads"][0]["crashed"], true);

        // Cut off after a key's colon.
        let raw = r#"{"crash": {"error": {"signal":"#;
        let fixed = fixup_report(raw).unwrap();
        let value: Value = serde_json::from_str(&fixed).unwrap();
        assert!(value["crash"]["error"]["signal"].is_null());
    }
}
