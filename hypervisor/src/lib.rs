// Copyright © 2024 The vmhost Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! A generic abstraction around hypervisor control-plane functionality
//!
//! This crate offers a trait abstraction for the control plane managing
//! workloads on a host, and a backend driving it through `virsh`.
//!

#[macro_use]
extern crate log;

/// Hypevisor related module
pub mod hypervisor;

/// Vm related module
pub mod vm;

/// virsh backed implementation module
pub mod virsh;

use std::sync::Arc;
use std::time::Duration;

pub use crate::hypervisor::{Hypervisor, HypervisorError};
pub use virsh::VirshHypervisor;
pub use vm::{
    HypervisorVmError, JobProgress, MigrateFlags, MigrateParams, ShutdownMode, UndefineFlags, Vm,
    VmState,
};

/// Hypervisor handle for `uri`, with every control call bounded by `timeout`.
pub fn new(virsh: &str, uri: &str, timeout: Duration) -> Arc<dyn Hypervisor> {
    Arc::new(VirshHypervisor::new(virsh, uri, timeout))
}
