// Copyright © 2024 The vmhost Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fmt;
use std::time::Duration;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
///
/// Enum for VM error
pub enum HypervisorVmError {
    #[error("Failed to get Vm state: {0}")]
    GetState(#[source] anyhow::Error),
    #[error("Failed to get Vm description: {0}")]
    GetXml(#[source] anyhow::Error),
    #[error("Failed to get Vm uuid: {0}")]
    GetUuid(#[source] anyhow::Error),
    #[error("Failed to start Vm: {0}")]
    Create(#[source] anyhow::Error),
    #[error("Failed to destroy Vm: {0}")]
    Destroy(#[source] anyhow::Error),
    #[error("Failed to pause Vm: {0}")]
    Suspend(#[source] anyhow::Error),
    #[error("Failed to resume Vm: {0}")]
    Resume(#[source] anyhow::Error),
    #[error("Failed to shut down Vm: {0}")]
    Shutdown(#[source] anyhow::Error),
    #[error("Failed to undefine Vm: {0}")]
    Undefine(#[source] anyhow::Error),
    #[error("Failed to migrate Vm: {0}")]
    Migrate(#[source] anyhow::Error),
    #[error("Failed to get migration job info: {0}")]
    JobInfo(#[source] anyhow::Error),
    #[error("Failed to abort migration job: {0}")]
    AbortJob(#[source] anyhow::Error),
}

///
/// Result type for returning from a function
///
pub type Result<T> = std::result::Result<T, HypervisorVmError>;

/// Run state as reported by the hypervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmState {
    NoState,
    Running,
    Blocked,
    Paused,
    ShuttingDown,
    ShutOff,
    Crashed,
    Suspended,
    Unknown,
}

impl VmState {
    /// True while the workload holds host resources and can be destroyed.
    pub fn is_active(&self) -> bool {
        matches!(self, VmState::Running | VmState::Blocked | VmState::Paused)
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            VmState::NoState => "no state",
            VmState::Running => "running",
            VmState::Blocked => "blocked",
            VmState::Paused => "paused",
            VmState::ShuttingDown => "shutting down",
            VmState::ShutOff => "shut off",
            VmState::Crashed => "crashed",
            VmState::Suspended => "suspended",
            VmState::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Channel used for a graceful shutdown request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownMode {
    GuestAgent,
    Acpi,
}

bitflags! {
    /// Extra state removed together with a workload definition.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct UndefineFlags: u32 {
        const MANAGED_SAVE = 1 << 0;
        const SNAPSHOTS_METADATA = 1 << 1;
        const NVRAM = 1 << 2;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct MigrateFlags: u32 {
        const LIVE = 1 << 0;
        const PERSIST_DEST = 1 << 1;
        const UNDEFINE_SOURCE = 1 << 2;
        const PEER2PEER = 1 << 3;
        const TUNNELLED = 1 << 4;
        const AUTO_CONVERGE = 1 << 5;
        const ABORT_ON_ERROR = 1 << 6;
    }
}

/// Arguments of a migrate-to-URI request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MigrateParams {
    pub dest_uri: String,
    pub flags: MigrateFlags,
    pub timeout: Option<Duration>,
    /// Options handed to the ssh transport of a tunnelled migration.
    pub ssh_options: Vec<String>,
}

/// Counters of the migration job currently running on a workload, in bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub mem_total: u64,
    pub mem_processed: u64,
    pub data_total: u64,
    pub data_processed: u64,
}

///
/// Trait to represent a defined workload
///
/// This crate provides a hypervisor-agnostic interfaces
///
pub trait Vm: Send + Sync {
    ///
    /// Workload name
    ///
    fn name(&self) -> String;
    ///
    /// Current run state
    ///
    fn state(&self) -> Result<VmState>;
    ///
    /// Hardware description, preferring the persistent definition if `inactive`
    ///
    fn xml_desc(&self, inactive: bool) -> Result<String>;
    ///
    /// Workload UUID
    ///
    fn uuid(&self) -> Result<String>;
    ///
    /// Start the workload
    ///
    fn create(&self) -> Result<()>;
    ///
    /// Immediately stop the workload
    ///
    fn destroy(&self) -> Result<()>;
    fn suspend(&self) -> Result<()>;
    fn resume(&self) -> Result<()>;
    ///
    /// Request a graceful shutdown, returning once the request is delivered
    ///
    fn shutdown(&self, mode: ShutdownMode) -> Result<()>;
    ///
    /// Remove the definition, leaving storage untouched
    ///
    fn undefine(&self, flags: UndefineFlags) -> Result<()>;
    ///
    /// Migrate to another host, blocking until the job completes
    ///
    fn migrate(&self, params: &MigrateParams) -> Result<()>;
    ///
    /// Progress of the active job
    ///
    fn job_progress(&self) -> Result<JobProgress>;
    ///
    /// Abort the active job
    ///
    fn abort_job(&self) -> Result<()>;
}
