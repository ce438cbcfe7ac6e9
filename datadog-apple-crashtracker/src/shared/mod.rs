// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub mod configuration;
pub mod constants;
pub mod fd_log;

use thiserror::Error;

/// Errors that can occur while arming the crash reporter.
///
/// Returned by `install`. If any of these is returned, no reporter is armed
/// and the process runs with its default crash behavior.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InstallError {
    #[error("crash reporter is already installed in this process")]
    AlreadyInstalled,
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    #[error("install path is too long")]
    PathTooLong,
    #[error("could not create install path")]
    CouldNotCreatePath,
    #[error("report store initialization failed")]
    StoreInitFailed,
    #[error("memory subsystem initialization failed")]
    MemoryInitFailed,
    #[error("crash state initialization failed")]
    CrashStateInitFailed,
    #[error("could not derive a log filename")]
    LogFilenameFailed,
    #[error("no monitors could be activated")]
    NoActiveMonitors,
}
