// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Typed view of persisted crash reports.
//!
//! The capture path streams reports through the async-safe encoder; this
//! module is the normal-mode read side: serde structs mirroring the report
//! schema, the legacy-field fixup pass, and the signal/Mach-exception name
//! tables shared with the writer.

pub mod fixup;
pub mod signals;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One stack frame as written to a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_name: Option<String>,
    #[serde(default)]
    pub object_addr: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol_name: Option<String>,
    #[serde(default)]
    pub symbol_addr: u64,
    pub instruction_addr: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadInfo {
    #[serde(default)]
    pub backtrace: Vec<FrameInfo>,
    #[serde(default)]
    pub backtrace_skipped: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registers: Option<BTreeMap<String, u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_registers: Option<BTreeMap<String, u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<Value>,
    pub crashed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mach_exception: Option<String>,
    #[serde(default)]
    pub mach_code: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mach_code_name: Option<String>,
    #[serde(default)]
    pub mach_subcode: u64,
    pub signal: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_name: Option<String>,
    #[serde(default)]
    pub signal_code: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_code_name: Option<String>,
    #[serde(default)]
    pub address: u64,
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub panic_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_exception_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_exception_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_exception_language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_exception_line_of_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryImageInfo {
    pub image_addr: u64,
    pub image_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default)]
    pub cpu_type: i64,
    #[serde(default)]
    pub cpu_subtype: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashSection {
    #[serde(default)]
    pub threads: Vec<ThreadInfo>,
    pub error: ErrorInfo,
    #[serde(default)]
    pub binary_images: Vec<BinaryImageInfo>,
}

/// A full report document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashReport {
    pub report_version_major: i64,
    pub report_version_minor: i64,
    pub crash_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_atcrash: Option<Value>,
    pub crash: CrashSection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_atcrash: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recrash_report: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hang: Option<Value>,
}

impl CrashReport {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn crashed_thread(&self) -> Option<&ThreadInfo> {
        self.crash.threads.iter().find(|t| t.crashed)
    }
}
