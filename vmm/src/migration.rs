// Copyright © 2024 The vmhost Authors
//
// SPDX-License-Identifier: Apache-2.0

//! Live and cold migration of workloads between hosts.
//!
//! A live migration is one blocking hypervisor call. It runs on its own
//! thread while a sampler thread reports job progress, and the caller's
//! [`CancelToken`] can abort it at any point. Every attempt that gets past
//! validation emits exactly one outcome notification.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use hypervisor::{Hypervisor, JobProgress, MigrateFlags, MigrateParams, Vm, VmState};
use serde::{Deserialize, Serialize};

use crate::builder::{CpuMode, VmSpec, DEFAULT_LISTEN};
use crate::config::HostConfig;
use crate::disk::{DiskFormat, DiskTool};
use crate::domain_xml::{Document, Element};
use crate::lifecycle::{disk_path_from_xml, require_state, Controller, UNDEFINE_FLAGS};
use crate::notify::{Notification, Notifier};
use crate::{Error, Result};

const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(1);
/// How long a cancelled migration may take to unwind after the abort.
const DEFAULT_ABORT_GRACE: Duration = Duration::from_secs(10);

/// Options for the ssh transport of a tunnelled migration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshOptions {
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    #[serde(default)]
    pub skip_host_key_check: bool,
    #[serde(default)]
    pub known_hosts_file: Option<PathBuf>,
    #[serde(default)]
    pub extra: Vec<String>,
}

impl SshOptions {
    /// Command line options handed to ssh.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.skip_host_key_check {
            args.push("-o StrictHostKeyChecking=no".to_owned());
            if self.known_hosts_file.is_none() {
                args.push("-o UserKnownHostsFile=/dev/null".to_owned());
            }
        }
        if let Some(file) = &self.known_hosts_file {
            args.push(format!("-o UserKnownHostsFile={}", file.display()));
        }
        if let Some(key) = &self.identity_file {
            args.push(format!("-i {}", key.display()));
        }
        args.extend(
            self.extra
                .iter()
                .map(|o| o.trim().to_owned())
                .filter(|o| !o.is_empty()),
        );
        args
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationRequest {
    pub vm: String,
    pub dest_uri: String,
    pub live: bool,
    pub timeout: Option<Duration>,
    pub ssh: SshOptions,
}

impl MigrationRequest {
    pub fn new(vm: &str, dest_uri: &str, live: bool) -> Self {
        MigrationRequest {
            vm: vm.to_owned(),
            dest_uri: dest_uri.to_owned(),
            live,
            timeout: None,
            ssh: SshOptions::default(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.vm.trim().is_empty() {
            return Err(Error::Validation("vm name is required".to_owned()));
        }
        if self.dest_uri.trim().is_empty() {
            return Err(Error::Validation("destination URI is required".to_owned()));
        }
        Ok(())
    }

    fn params(&self) -> MigrateParams {
        let mut flags = MigrateFlags::PERSIST_DEST
            | MigrateFlags::UNDEFINE_SOURCE
            | MigrateFlags::PEER2PEER
            | MigrateFlags::TUNNELLED
            | MigrateFlags::AUTO_CONVERGE
            | MigrateFlags::ABORT_ON_ERROR;
        if self.live {
            flags |= MigrateFlags::LIVE;
        }
        MigrateParams {
            dest_uri: self.dest_uri.trim().to_owned(),
            flags,
            timeout: self.timeout.filter(|t| !t.is_zero()),
            ssh_options: self.ssh.to_args(),
        }
    }
}

/// Cancellation shared between a caller and a running migration.
///
/// Cancelling drops the only sender, which wakes every waiter at once.
#[derive(Clone)]
pub struct CancelToken {
    sender: Arc<Mutex<Option<flume::Sender<()>>>>,
    receiver: flume::Receiver<()>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (sender, receiver) = flume::bounded(0);
        CancelToken {
            sender: Arc::new(Mutex::new(Some(sender))),
            receiver,
        }
    }

    pub fn cancel(&self) {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Percentage of a job done, from memory counters or else data counters.
fn progress_percent(progress: &JobProgress) -> Option<(u8, u64, u64)> {
    let (processed, total) = if progress.mem_total > 0 {
        (progress.mem_processed, progress.mem_total)
    } else if progress.data_total > 0 {
        (progress.data_processed, progress.data_total)
    } else {
        return None;
    };
    let percent = (u128::from(processed) * 100 / u128::from(total)).min(100) as u8;
    Some((percent, processed, total))
}

fn spawn_sampler(
    vm: Arc<dyn Vm>,
    interval: Duration,
    notifier: Arc<dyn Notifier>,
    stop: flume::Receiver<()>,
) -> Result<thread::JoinHandle<()>> {
    let name = vm.name();
    thread::Builder::new()
        .name("migration_progress".to_owned())
        .spawn(move || loop {
            match stop.recv_timeout(interval) {
                Err(flume::RecvTimeoutError::Timeout) => {}
                _ => break,
            }
            match vm.job_progress() {
                Ok(progress) => {
                    if let Some((percent, processed, total)) = progress_percent(&progress) {
                        debug!("Migration of {name}: {percent}% ({processed}/{total})");
                        notifier.notify(&Notification::MigrationProgress {
                            vm: name.clone(),
                            percent,
                            processed,
                            total,
                        });
                    }
                }
                Err(e) => debug!("No job progress for {name}: {e}"),
            }
        })
        .map_err(Error::ThreadSpawn)
}

enum Wake {
    Done(Result<()>),
    Cancelled,
}

pub struct Migrator {
    hypervisor: Arc<dyn Hypervisor>,
    notifier: Arc<dyn Notifier>,
    progress_interval: Duration,
    abort_grace: Duration,
}

impl Migrator {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, notifier: Arc<dyn Notifier>) -> Self {
        Migrator {
            hypervisor,
            notifier,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            abort_grace: DEFAULT_ABORT_GRACE,
        }
    }

    pub fn from_config(
        hypervisor: Arc<dyn Hypervisor>,
        notifier: Arc<dyn Notifier>,
        config: &HostConfig,
    ) -> Self {
        Self::new(hypervisor, notifier).with_progress_interval(config.timeouts.migration_progress())
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn with_abort_grace(mut self, grace: Duration) -> Self {
        self.abort_grace = grace;
        self
    }

    fn outcome(&self, name: &str, destination: &str, result: Result<()>) -> Result<()> {
        let notification = match &result {
            Ok(()) => {
                info!("Migrated {name} to {destination}");
                Notification::MigrationFinished {
                    vm: name.to_owned(),
                    destination: destination.to_owned(),
                }
            }
            Err(Error::Cancelled(_)) => {
                info!("Migration of {name} cancelled");
                Notification::MigrationCancelled { vm: name.to_owned() }
            }
            Err(e) => {
                error!("Migration of {name} to {destination} failed: {e}");
                Notification::MigrationFailed {
                    vm: name.to_owned(),
                    error: e.to_string(),
                }
            }
        };
        self.notifier.notify(&notification);
        result
    }

    /// Move a workload to `request.dest_uri`, blocking until it has moved,
    /// failed, or been cancelled through `cancel`.
    pub fn migrate(&self, request: &MigrationRequest, cancel: &CancelToken) -> Result<()> {
        request.validate()?;
        let name = request.vm.as_str();
        let vm = self.hypervisor.lookup_vm(name)?;
        if request.live {
            require_state(&*vm, &[VmState::Running], "running")?;
        } else {
            require_state(
                &*vm,
                &[VmState::Running, VmState::Blocked, VmState::Paused],
                "running or paused",
            )?;
        }

        self.notifier.notify(&Notification::MigrationStarted {
            vm: name.to_owned(),
            destination: request.dest_uri.clone(),
            live: request.live,
        });
        let result = self.run(vm, request, cancel);
        self.outcome(name, &request.dest_uri, result)
    }

    fn run(&self, vm: Arc<dyn Vm>, request: &MigrationRequest, cancel: &CancelToken) -> Result<()> {
        let name = request.vm.clone();
        let (stop_tx, stop_rx) = flume::bounded::<()>(0);
        let sampler = spawn_sampler(
            vm.clone(),
            self.progress_interval,
            self.notifier.clone(),
            stop_rx,
        )?;

        let (done_tx, done_rx) = flume::bounded(1);
        let params = request.params();
        let migrating = vm.clone();
        let spawned = thread::Builder::new()
            .name(format!("migrate_{name}"))
            .spawn(move || {
                let result = migrating
                    .migrate(&params)
                    .map_err(|e| Error::vm(&migrating.name(), e));
                if let Err(flume::SendError(late)) = done_tx.send(result) {
                    report_late_outcome(&migrating.name(), &params.dest_uri, &late);
                }
            });

        let result = match spawned {
            Err(e) => Err(Error::ThreadSpawn(e)),
            Ok(_) => {
                let wake = flume::Selector::new()
                    .recv(&done_rx, |r| match r {
                        Ok(result) => Wake::Done(result),
                        Err(_) => Wake::Done(Err(Error::ThreadExited(format!("migrate_{name}")))),
                    })
                    .recv(&cancel.receiver, |_| Wake::Cancelled)
                    .wait();
                match wake {
                    Wake::Done(result) => result,
                    Wake::Cancelled => self.abort(&*vm, &name, done_rx),
                }
            }
        };

        drop(stop_tx);
        if sampler.join().is_err() {
            error!("Progress sampler of {name} panicked");
        }
        result
    }

    /// Abort the running job and wait a bounded time for the migrate call
    /// to return. Past that, the migrate thread is left to finish alone.
    fn abort(&self, vm: &dyn Vm, name: &str, done: flume::Receiver<Result<()>>) -> Result<()> {
        info!("Cancelling migration of {name}");
        if let Err(e) = vm.abort_job() {
            warn!("Failed to abort the migration job of {name}: {e}");
        }
        match done.recv_timeout(self.abort_grace) {
            Ok(Ok(())) => {
                warn!("Migration of {name} completed before the abort took effect");
                Ok(())
            }
            Ok(Err(e)) => {
                debug!("Migration of {name} ended after abort: {e}");
                Err(Error::Cancelled(name.to_owned()))
            }
            Err(_) => {
                warn!(
                    "Migration of {name} did not stop within {:?} of the abort, \
                     its outcome will be logged when it ends",
                    self.abort_grace
                );
                Err(Error::Cancelled(name.to_owned()))
            }
        }
    }

    /// Move a workload over shared storage: release it here, then recreate
    /// it on `dest`. The source definition is restored if the destination
    /// refuses it.
    pub fn cold_migrate(&self, name: &str, dest: &Controller, disks: &DiskTool) -> Result<()> {
        if name.trim().is_empty() {
            return Err(Error::Validation("vm name is required".to_owned()));
        }
        let destination = dest.hypervisor().uri();
        let vm = self.hypervisor.lookup_vm(name)?;
        let original = vm.xml_desc(true).map_err(|e| Error::vm(name, e))?;

        self.notifier.notify(&Notification::MigrationStarted {
            vm: name.to_owned(),
            destination: destination.clone(),
            live: false,
        });

        let result = release_for_cold_migration(&*self.hypervisor, name).and_then(|spec| {
            adopt_cold_migration(dest, &spec, disks).map(|_| ()).inspect_err(|_| {
                if let Err(e) = self.hypervisor.define_vm(&original, false) {
                    error!("Failed to restore the definition of {name}: {e}");
                }
            })
        });
        self.outcome(name, &destination, result)
    }
}

/// Log the result of a migrate call nobody waits for anymore, so a workload
/// reported as cancelled can be reconciled with where it actually runs.
fn report_late_outcome(name: &str, destination: &str, result: &Result<()>) {
    match result {
        Ok(()) => warn!("Cancelled migration of {name} completed anyway, it now runs on {destination}"),
        Err(e) => warn!("Cancelled migration of {name} ended late: {e}"),
    }
}

/// What a destination needs to recreate a released workload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColdMigrationSpec {
    pub name: String,
    pub memory_mib: u64,
    pub vcpus: u32,
    pub network: String,
    #[serde(default)]
    pub listen: Option<String>,
    #[serde(default)]
    pub vnc_password: Option<String>,
    /// Captured `<cpu>` element.
    #[serde(default)]
    pub cpu_xml: Option<String>,
    pub disk_path: PathBuf,
    #[serde(default)]
    pub disk_format: Option<String>,
}

/// Memory element value in MiB.
pub(crate) fn memory_mib(memory: &Element) -> Option<u64> {
    let value: u64 = memory.text().trim().parse().ok()?;
    let kib = match memory.attr("unit").as_deref().unwrap_or("KiB") {
        "b" | "bytes" => value / 1024,
        "k" | "K" | "KiB" => value,
        "KB" => value * 1000 / 1024,
        "M" | "MiB" => value * 1024,
        "MB" => value * 1_000_000 / 1024,
        "G" | "GiB" => value * 1024 * 1024,
        "GB" => value * 1_000_000_000 / 1024,
        _ => return None,
    };
    Some(kib / 1024)
}

impl ColdMigrationSpec {
    pub fn from_xml(xml: &str) -> Result<Self> {
        let doc = Document::parse_rooted(xml, "domain")?;
        let root = doc.root();
        let devices = root.child("devices");
        let device = |name: &'static str| {
            devices
                .into_iter()
                .flat_map(move |d| d.children_named(name))
        };

        let graphics = device("graphics").find(|g| g.attr("type").as_deref() == Some("vnc"));
        let disk_format = device("disk")
            .find(|d| d.attr("device").is_none_or(|dev| dev == "disk"))
            .and_then(|d| d.child("driver"))
            .and_then(|d| d.attr("type"));

        let spec = ColdMigrationSpec {
            name: root
                .child("name")
                .map(|n| n.text().trim().to_owned())
                .unwrap_or_default(),
            memory_mib: root.child("memory").and_then(memory_mib).unwrap_or(0),
            vcpus: root
                .child("vcpu")
                .and_then(|v| v.text().trim().parse().ok())
                .unwrap_or(0),
            network: device("interface")
                .find_map(|i| i.child("source").and_then(|s| s.attr("network")))
                .unwrap_or_default(),
            listen: graphics.and_then(|g| g.attr("listen")),
            vnc_password: graphics.and_then(|g| g.attr("passwd")),
            cpu_xml: root.child("cpu").map(|c| c.to_string()),
            disk_path: disk_path_from_xml(xml)?.unwrap_or_default(),
            disk_format,
        };
        Ok(spec)
    }

    pub fn validate(&self) -> Result<()> {
        let missing = if self.name.trim().is_empty() {
            Some("name")
        } else if self.disk_path.as_os_str().is_empty() {
            Some("disk path")
        } else if self.memory_mib == 0 {
            Some("memory")
        } else if self.vcpus == 0 {
            Some("vcpu count")
        } else if self.network.trim().is_empty() {
            Some("network")
        } else {
            None
        };
        match missing {
            Some(field) => Err(Error::Validation(format!(
                "cold migration of {:?} is missing its {field}",
                self.name
            ))),
            None => Ok(()),
        }
    }

    fn to_vm_spec(&self) -> VmSpec {
        let mut spec = VmSpec::new(&self.name, self.memory_mib, self.vcpus);
        spec.network = self.network.clone();
        spec.listen = self
            .listen
            .clone()
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LISTEN.to_owned());
        spec.vnc_password = self.vnc_password.clone();
        spec.disk = Some(self.disk_path.clone());
        spec.disk_format = self.disk_format.as_deref().map(DiskFormat::from);
        spec.cpu = match &self.cpu_xml {
            Some(cpu) => CpuMode::Raw(cpu.clone()),
            None => {
                warn!(
                    "No CPU description captured for {}, using host-passthrough",
                    self.name
                );
                CpuMode::HostPassthrough
            }
        };
        spec
    }
}

/// Stop and undefine a workload on this host, leaving its disk in place,
/// and return what the destination needs to recreate it.
pub fn release_for_cold_migration(
    hypervisor: &dyn Hypervisor,
    name: &str,
) -> Result<ColdMigrationSpec> {
    let vm = hypervisor.lookup_vm(name)?;
    let xml = vm.xml_desc(true).map_err(|e| Error::vm(name, e))?;
    let spec = ColdMigrationSpec::from_xml(&xml)?;
    spec.validate()?;

    let state = vm.state().map_err(|e| Error::vm(name, e))?;
    if state.is_active() {
        vm.destroy().map_err(|e| Error::vm(name, e))?;
    }
    vm.undefine(UNDEFINE_FLAGS)
        .map_err(|e| Error::vm(name, e))?;
    info!(
        "Released {name} for cold migration, disk {} kept",
        spec.disk_path.display()
    );
    Ok(spec)
}

/// Recreate and start a released workload on the host `dest` manages.
pub fn adopt_cold_migration(
    dest: &Controller,
    spec: &ColdMigrationSpec,
    disks: &DiskTool,
) -> Result<Arc<dyn Vm>> {
    spec.validate()?;
    if !Path::new(&spec.disk_path).is_file() {
        return Err(Error::NotFound(format!(
            "disk {} of {}",
            spec.disk_path.display(),
            spec.name
        )));
    }
    dest.create(&spec.to_vm_spec(), disks, None)
}
