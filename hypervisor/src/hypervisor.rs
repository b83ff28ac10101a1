// Copyright © 2024 The vmhost Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::sync::Arc;

use thiserror::Error;

use crate::vm::Vm;

#[derive(Error, Debug)]
///
///
pub enum HypervisorError {
    ///
    /// The named workload is not known to the hypervisor
    ///
    #[error("Vm not found: {0}")]
    VmNotFound(String),
    ///
    /// Workload lookup failure
    ///
    #[error("Failed to look up Vm {0}: {1}")]
    VmLookup(String, #[source] anyhow::Error),
    ///
    /// Workload definition failure
    ///
    #[error("Failed to define Vm: {0}")]
    VmDefine(#[source] anyhow::Error),
    ///
    /// Listing defined workloads failed
    ///
    #[error("Failed to list Vms: {0}")]
    VmList(#[source] anyhow::Error),
}

///
/// Result type for returning from a function
///
pub type Result<T> = std::result::Result<T, HypervisorError>;

///
/// Trait to represent a hypervisor control plane
///
/// Every call opens its own connection to the control plane and releases it
/// before returning; handles are not pooled.
///
pub trait Hypervisor: Send + Sync {
    ///
    /// Connection URI of the control plane
    ///
    fn uri(&self) -> String;
    ///
    /// Look up a defined workload by name
    ///
    fn lookup_vm(&self, name: &str) -> Result<Arc<dyn Vm>>;
    ///
    /// Register (or redefine) a workload from its hardware description
    ///
    fn define_vm(&self, xml: &str, validate: bool) -> Result<Arc<dyn Vm>>;
    ///
    /// Names of every defined workload
    ///
    fn list_vms(&self) -> Result<Vec<String>>;
}
