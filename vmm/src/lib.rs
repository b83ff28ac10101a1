// Copyright © 2024 The vmhost Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Host-side workload resource and migration orchestration.
//!
//! The crate reasons over the host CPU topology, edits workload hardware
//! descriptions through a lossless XML tree, enforces run-state
//! preconditions, drives live and cold migrations, and reconciles the kernel
//! boot arguments that tune the host for dedicated workloads.

#[macro_use]
extern crate log;

pub mod builder;
pub mod command;
pub mod config;
pub mod disk;
pub mod display;
pub mod domain_xml;
pub mod host_services;
pub mod host_tuning;
pub mod isolation;
pub mod lifecycle;
pub mod memory_backing;
pub mod migration;
pub mod notify;
pub mod pinning;
pub mod topology;

#[cfg(test)]
mod mock;

use std::io;
use std::path::PathBuf;
use std::result;

use hypervisor::{HypervisorError, HypervisorVmError, VmState};
use thiserror::Error;

/// Errors returned by every public operation of this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or out-of-range request
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Workload is in the wrong state for the requested operation
    #[error("Vm {name} is {current}, operation requires {required}")]
    Precondition {
        name: String,
        required: String,
        current: VmState,
    },

    /// Unknown workload, socket, device or file
    #[error("Not found: {0}")]
    NotFound(String),

    /// Required external tool is not installed
    #[error("Required tool {0} is not installed")]
    ToolMissing(String),

    /// Neither root nor password-less sudo is available
    #[error("Insufficient privileges to run {0}: requires root or password-less sudo")]
    Permission(String),

    /// Hardware description could not be parsed or lacks expected structure
    #[error("Invalid hardware description: {0}")]
    Description(#[source] domain_xml::Error),

    /// A bounded wait ran out
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Failure reported by the hypervisor control plane
    #[error("Hypervisor error: {0}")]
    Hypervisor(#[source] HypervisorError),

    /// Failure of an operation issued on a workload
    #[error("Hypervisor error on {0}: {1}")]
    VmOperation(String, #[source] HypervisorVmError),

    /// Failure of an external command
    #[error("Command error: {0}")]
    Command(#[source] command::Error),

    /// External tool produced output that could not be understood
    #[error("Unexpected output from {0}: {1}")]
    ToolOutput(String, String),

    /// Filesystem failure
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Migration aborted by the caller
    #[error("Migration of {0} cancelled")]
    Cancelled(String),

    /// Worker thread could not be started
    #[error("Error spawning thread: {0}")]
    ThreadSpawn(#[source] io::Error),

    /// Worker thread ended without reporting back
    #[error("Thread {0} exited without a result")]
    ThreadExited(String),
}

pub type Result<T> = result::Result<T, Error>;

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn vm(name: &str, source: HypervisorVmError) -> Self {
        Error::VmOperation(name.to_owned(), source)
    }
}

impl From<HypervisorError> for Error {
    fn from(e: HypervisorError) -> Self {
        match e {
            HypervisorError::VmNotFound(name) => Error::NotFound(format!("vm {name}")),
            e => Error::Hypervisor(e),
        }
    }
}

impl From<domain_xml::Error> for Error {
    fn from(e: domain_xml::Error) -> Self {
        Error::Description(e)
    }
}

impl From<command::Error> for Error {
    fn from(e: command::Error) -> Self {
        match e {
            command::Error::NotInstalled(program) => Error::ToolMissing(program),
            command::Error::NoPrivilege(program) => Error::Permission(program),
            command::Error::Timeout(program, after) => {
                Error::Timeout(format!("{program} did not finish within {after:?}"))
            }
            e => Error::Command(e),
        }
    }
}
