// Copyright © 2024 The vmhost Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Run-state transitions and definition edits of workloads.
//!
//! Every operation checks the state it needs before issuing any mutating
//! call, so a failed precondition leaves the workload untouched. Edits go
//! through the persistent definition and are skipped when they would not
//! change it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hypervisor::{Hypervisor, ShutdownMode, UndefineFlags, Vm, VmState};
use serde::Serialize;

use crate::builder::{build_domain_xml, validate_vnc_password, VmSpec};
use crate::config::{HostConfig, StorageLayout};
use crate::disk::{DiskFormat, DiskTool};
use crate::display::{VncVideo, VncVideoInfo};
use crate::domain_xml::{self, Document, Element};
use crate::host_tuning::host_memory_mib;
use crate::memory_backing::{self, HugePages, HugePagesInfo, MemoryBalloon, MemoryBalloonInfo};
use crate::migration::memory_mib;
use crate::notify::{NoopNotifier, Notification, Notifier};
use crate::pinning::{self, describe_pins, PinningRequest, VcpuPin};
use crate::topology::Topology;
use crate::{Error, Result};

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(300);

/// States in which the definition may be edited.
const SHUT_OFF: &[VmState] = &[VmState::ShutOff, VmState::ShuttingDown];
const STARTABLE: &[VmState] = &[VmState::ShutOff, VmState::ShuttingDown, VmState::Crashed];
const REMOVABLE: &[VmState] = &[VmState::ShutOff, VmState::ShuttingDown, VmState::Crashed];

pub(crate) const UNDEFINE_FLAGS: UndefineFlags = UndefineFlags::MANAGED_SAVE
    .union(UndefineFlags::SNAPSHOTS_METADATA)
    .union(UndefineFlags::NVRAM);

/// Pins recorded in a definition and the request they correspond to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PinningReport {
    pub pins: Vec<VcpuPin>,
    /// `None` when unpinned or when the pins do not map onto one core range.
    pub request: Option<PinningRequest>,
}

/// Hardware changes for a shut off workload. Absent fields are kept.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceEdit {
    pub vcpus: Option<u32>,
    pub memory_mib: Option<u64>,
    /// Disks only grow, a smaller size leaves the image alone.
    pub disk_size_gib: Option<u64>,
}

impl ResourceEdit {
    fn validate(&self) -> Result<()> {
        if self.vcpus.is_none() && self.memory_mib.is_none() && self.disk_size_gib.is_none() {
            return Err(Error::Validation(
                "no vCPU count, memory or disk size to change".to_owned(),
            ));
        }
        let fields = [
            ("vCPU count", self.vcpus.map(u64::from)),
            ("memory", self.memory_mib),
            ("disk size", self.disk_size_gib),
        ];
        match fields.iter().find(|(_, value)| *value == Some(0)) {
            Some((what, _)) => Err(Error::Validation(format!("{what} must be positive"))),
            None => Ok(()),
        }
    }
}

/// Resources defined after an edit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ResourceReport {
    pub vcpus: u32,
    pub memory_mib: u64,
    pub disk_grown: bool,
}

fn set_vcpus(domain: &mut Element, vcpus: u32) -> domain_xml::Result<()> {
    let count = vcpus.to_string();
    let vcpu = domain
        .child_mut("vcpu")
        .ok_or_else(|| domain_xml::Error::Structure("domain has no <vcpu>".to_owned()))?;
    vcpu.set_text(&count);
    if vcpu.attr("current").is_some() {
        vcpu.set_attr("current", &count);
    }
    if let Some(cpu) = domain.child_mut("cpu") {
        if cpu.child("topology").is_some() {
            pinning::set_topology(cpu, vcpus as usize);
        }
    }
    Ok(())
}

fn set_memory(domain: &mut Element, mib: u64) -> domain_xml::Result<()> {
    let kib = mib.saturating_mul(1024).to_string();
    let memory = domain
        .child_mut("memory")
        .ok_or_else(|| domain_xml::Error::Structure("domain has no <memory>".to_owned()))?;
    memory.set_attr("unit", "KiB");
    memory.set_text(&kib);
    match domain.child_mut("currentMemory") {
        Some(current) => {
            current.set_attr("unit", "KiB");
            current.set_text(&kib);
        }
        None => domain
            .insert_after(
                "memory",
                Element::new("currentMemory")
                    .with_attr("unit", "KiB")
                    .with_text(&kib),
            )
            .map_err(|_| domain_xml::Error::Structure("domain has no <memory>".to_owned()))?,
    }
    Ok(())
}

/// Fail unless `vm` is in one of `allowed`, returning the observed state.
pub(crate) fn require_state(
    vm: &dyn Vm,
    allowed: &[VmState],
    required: &str,
) -> Result<VmState> {
    let name = vm.name();
    let current = vm.state().map_err(|e| Error::vm(&name, e))?;
    if allowed.contains(&current) {
        Ok(current)
    } else {
        Err(Error::Precondition {
            name,
            required: required.to_owned(),
            current,
        })
    }
}

/// File backing the first disk device of a definition.
pub(crate) fn disk_path_from_xml(xml: &str) -> Result<Option<PathBuf>> {
    let doc = Document::parse_rooted(xml, "domain")?;
    let path = doc
        .root()
        .child("devices")
        .into_iter()
        .flat_map(|d| d.children_named("disk"))
        .filter(|d| d.attr("device").is_none_or(|dev| dev == "disk"))
        .find_map(|d| d.child("source").and_then(|s| s.attr("file")))
        .filter(|f| !f.trim().is_empty())
        .map(PathBuf::from);
    Ok(path)
}

fn remove_file_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(Error::io(path, e)),
        _ => Ok(()),
    }
}

pub struct Controller {
    hypervisor: Arc<dyn Hypervisor>,
    layout: StorageLayout,
    shutdown_timeout: Duration,
    poll_interval: Duration,
    notifier: Arc<dyn Notifier>,
    meminfo: PathBuf,
}

impl Controller {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, layout: StorageLayout) -> Self {
        Controller {
            hypervisor,
            layout,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            notifier: Arc::new(NoopNotifier),
            meminfo: PathBuf::from("/proc/meminfo"),
        }
    }

    pub fn from_config(hypervisor: Arc<dyn Hypervisor>, config: &HostConfig) -> Self {
        Self::new(hypervisor, config.layout())
            .with_shutdown_timing(config.timeouts.shutdown(), config.timeouts.shutdown_poll())
            .with_meminfo(&config.meminfo)
    }

    pub fn with_shutdown_timing(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// File the host memory size is read from when memory grows.
    pub fn with_meminfo(mut self, meminfo: &Path) -> Self {
        self.meminfo = meminfo.to_path_buf();
        self
    }

    pub fn hypervisor(&self) -> &Arc<dyn Hypervisor> {
        &self.hypervisor
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    fn lookup(&self, name: &str) -> Result<Arc<dyn Vm>> {
        if name.trim().is_empty() {
            return Err(Error::Validation("vm name is required".to_owned()));
        }
        Ok(self.hypervisor.lookup_vm(name)?)
    }

    fn emit(&self, name: &str, event: &'static str) {
        self.notifier.notify(&Notification::Lifecycle {
            vm: name.to_owned(),
            event,
        });
    }

    pub fn state(&self, name: &str) -> Result<VmState> {
        let vm = self.lookup(name)?;
        vm.state().map_err(|e| Error::vm(name, e))
    }

    /// Every defined workload with its state.
    pub fn list(&self) -> Result<Vec<(String, VmState)>> {
        self.hypervisor
            .list_vms()?
            .into_iter()
            .map(|name| {
                let state = self.state(&name)?;
                Ok((name, state))
            })
            .collect()
    }

    /// Live description of a workload.
    pub fn get_xml(&self, name: &str) -> Result<String> {
        let vm = self.lookup(name)?;
        vm.xml_desc(false).map_err(|e| Error::vm(name, e))
    }

    /// Replace the whole definition of a shut off workload, keeping its UUID.
    pub fn update_xml(&self, name: &str, xml: &str) -> Result<()> {
        let mut doc = Document::parse_rooted(xml, "domain")?;
        let declared = doc
            .root()
            .child("name")
            .map(|n| n.text().trim().to_owned())
            .unwrap_or_default();
        if declared != name {
            return Err(Error::Validation(format!(
                "description names {declared:?}, expected {name:?}"
            )));
        }

        let vm = self.lookup(name)?;
        require_state(&*vm, &[VmState::ShutOff], "shut off")?;
        let uuid = vm.uuid().map_err(|e| Error::vm(name, e))?;

        let root = doc.root_mut();
        match root.child_mut("uuid") {
            Some(el) => el.set_text(&uuid),
            None => {
                let el = Element::new("uuid").with_text(&uuid);
                if let Err(el) = root.insert_after("name", el) {
                    root.push(el);
                }
            }
        }

        self.hypervisor.define_vm(&doc.to_string(), true)?;
        info!("Replaced the definition of {name}");
        self.emit(name, "redefined");
        Ok(())
    }

    /// Create the disk if needed, write the definition under the storage
    /// root, define the workload and start it.
    pub fn create(
        &self,
        spec: &VmSpec,
        disks: &DiskTool,
        topology: Option<&Topology>,
    ) -> Result<Arc<dyn Vm>> {
        spec.validate()?;
        match self.hypervisor.lookup_vm(&spec.name) {
            Ok(_) => {
                return Err(Error::Validation(format!(
                    "vm {} already exists",
                    spec.name
                )))
            }
            Err(hypervisor::HypervisorError::VmNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let pins = match (&spec.pinning, topology) {
            (Some(request), Some(topology)) => pinning::build_vcpu_pins(request, topology)?,
            (Some(_), None) => {
                return Err(Error::Validation(
                    "pinning requires the host topology".to_owned(),
                ))
            }
            (None, _) => Vec::new(),
        };

        let iso = match &spec.iso {
            Some(iso) => {
                let path = self.layout.iso_path(iso);
                if !path.is_file() {
                    return Err(Error::NotFound(format!("install media {}", path.display())));
                }
                Some(path)
            }
            None => None,
        };

        let disk = spec.disk.clone().unwrap_or_else(|| {
            self.layout.disk_path(
                &spec.name,
                spec.disk_format.as_ref().unwrap_or(&DiskFormat::Qcow2),
            )
        });
        let new_disk = !disk.exists();
        let format = match &spec.disk_format {
            Some(format) if disk.is_file() => format.clone(),
            _ => disks.ensure(&disk, spec.disk_size_gib)?,
        };

        let xml = build_domain_xml(spec, &disk, &format, iso.as_deref(), &pins)?;

        let xml_dir = self.layout.xml_dir();
        fs::create_dir_all(&xml_dir).map_err(|e| Error::io(&xml_dir, e))?;
        let xml_path = self.layout.xml_path(&spec.name);
        fs::write(&xml_path, &xml).map_err(|e| Error::io(&xml_path, e))?;

        let vm = self.hypervisor.define_vm(&xml, true)?;
        if let Err(e) = vm.create() {
            self.discard_created(&*vm, &xml_path, new_disk.then_some(disk.as_path()));
            return Err(Error::vm(&spec.name, e));
        }
        info!(
            "Created {} ({} MiB, {} vCPUs, disk {}), now running",
            spec.name,
            spec.memory_mib,
            if pins.is_empty() { spec.vcpus as usize } else { pins.len() },
            disk.display()
        );
        self.emit(&spec.name, "created");
        Ok(vm)
    }

    /// Undo a creation whose first start failed: drop the definition, the
    /// saved description and a disk made for it. Failures here are logged so
    /// the start error is what the caller sees.
    fn discard_created(&self, vm: &dyn Vm, xml_path: &Path, new_disk: Option<&Path>) {
        let name = vm.name();
        warn!("{name} failed to start, discarding its definition");
        if let Err(e) = vm.undefine(UNDEFINE_FLAGS) {
            error!("Failed to undefine {name}, it remains defined: {e}");
        }
        let mut leftovers = vec![xml_path];
        leftovers.extend(new_disk);
        for path in leftovers {
            if let Err(e) = remove_file_if_present(path) {
                error!("Failed to clean up after {name}: {e}");
            }
        }
    }

    pub fn start(&self, name: &str) -> Result<()> {
        let vm = self.lookup(name)?;
        require_state(&*vm, STARTABLE, "shut off or crashed")?;
        vm.create().map_err(|e| Error::vm(name, e))?;
        info!("Started {name}");
        self.emit(name, "started");
        Ok(())
    }

    /// Immediate power off.
    pub fn destroy(&self, name: &str) -> Result<()> {
        let vm = self.lookup(name)?;
        let state = vm.state().map_err(|e| Error::vm(name, e))?;
        if !state.is_active() {
            return Err(Error::Precondition {
                name: name.to_owned(),
                required: "running, blocked or paused".to_owned(),
                current: state,
            });
        }
        vm.destroy().map_err(|e| Error::vm(name, e))?;
        info!("Destroyed {name}, now shut off");
        self.emit(name, "destroyed");
        Ok(())
    }

    fn wait_for_shut_off(&self, vm: &dyn Vm, name: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if vm.state().map_err(|e| Error::vm(name, e))? == VmState::ShutOff {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "{name} did not shut off within {timeout:?}"
                )));
            }
            thread::sleep(self.poll_interval);
        }
    }

    /// Ask the guest to power off, through its agent first and the ACPI
    /// power button otherwise, and wait until it has.
    pub fn shutdown(&self, name: &str) -> Result<()> {
        let vm = self.lookup(name)?;
        require_state(&*vm, &[VmState::Running, VmState::Blocked], "running")?;

        if let Err(e) = vm.shutdown(ShutdownMode::GuestAgent) {
            warn!("Guest agent shutdown of {name} failed, falling back to ACPI: {e}");
            vm.shutdown(ShutdownMode::Acpi)
                .map_err(|e| Error::vm(name, e))?;
        }
        self.wait_for_shut_off(&*vm, name, self.shutdown_timeout)?;
        info!("Shut down {name}");
        self.emit(name, "shutdown");
        Ok(())
    }

    pub fn pause(&self, name: &str) -> Result<()> {
        let vm = self.lookup(name)?;
        require_state(&*vm, &[VmState::Running], "running")?;
        vm.suspend().map_err(|e| Error::vm(name, e))?;
        info!("Paused {name}");
        self.emit(name, "paused");
        Ok(())
    }

    pub fn resume(&self, name: &str) -> Result<()> {
        let vm = self.lookup(name)?;
        require_state(&*vm, &[VmState::Paused], "paused")?;
        vm.resume().map_err(|e| Error::vm(name, e))?;
        info!("Resumed {name}, now running");
        self.emit(name, "resumed");
        Ok(())
    }

    /// Forced power cycle.
    pub fn restart(&self, name: &str) -> Result<()> {
        let vm = self.lookup(name)?;
        let state = vm.state().map_err(|e| Error::vm(name, e))?;
        if state.is_active() {
            vm.destroy().map_err(|e| Error::vm(name, e))?;
            self.wait_for_shut_off(&*vm, name, self.shutdown_timeout)?;
        } else if !STARTABLE.contains(&state) {
            return Err(Error::Precondition {
                name: name.to_owned(),
                required: "running, paused, shut off or crashed".to_owned(),
                current: state,
            });
        }
        vm.create().map_err(|e| Error::vm(name, e))?;
        info!("Restarted {name}, now running");
        self.emit(name, "restarted");
        Ok(())
    }

    /// Drop the definition; storage is left in place.
    pub fn undefine(&self, name: &str) -> Result<()> {
        let vm = self.lookup(name)?;
        vm.undefine(UNDEFINE_FLAGS)
            .map_err(|e| Error::vm(name, e))?;
        info!("Undefined {name}");
        self.emit(name, "undefined");
        Ok(())
    }

    /// Destroy and undefine a workload, then delete its disk, its saved
    /// definitions and its per-workload disk directory.
    pub fn remove(&self, name: &str) -> Result<()> {
        let vm = self.lookup(name)?;
        let state = vm.state().map_err(|e| Error::vm(name, e))?;
        if !state.is_active() && !REMOVABLE.contains(&state) {
            return Err(Error::Precondition {
                name: name.to_owned(),
                required: "running, paused, shut off or crashed".to_owned(),
                current: state,
            });
        }

        let xml = vm.xml_desc(true).map_err(|e| Error::vm(name, e))?;
        let disk = disk_path_from_xml(&xml)?
            .ok_or_else(|| Error::Validation(format!("no disk found in the definition of {name}")))?;

        if state.is_active() {
            vm.destroy().map_err(|e| Error::vm(name, e))?;
        }
        vm.undefine(UNDEFINE_FLAGS)
            .map_err(|e| Error::vm(name, e))?;

        remove_file_if_present(&disk)?;
        remove_file_if_present(&self.layout.xml_path(name))?;
        if let Some(dir) = disk.parent() {
            remove_file_if_present(&dir.join(format!("{name}.xml")))?;
            if dir == self.layout.vm_disk_dir(name) {
                match fs::remove_dir_all(dir) {
                    Err(e) if e.kind() != io::ErrorKind::NotFound => {
                        return Err(Error::io(dir, e))
                    }
                    _ => {}
                }
            }
        }

        info!("Removed {name} and its disk {}", disk.display());
        self.emit(name, "removed");
        Ok(())
    }

    /// Rewrite the persistent definition of a shut off workload with `edit`,
    /// skipping the redefinition when nothing changed.
    fn edit_definition<T>(
        &self,
        name: &str,
        what: &str,
        edit: impl FnOnce(&str) -> Result<(String, T)>,
    ) -> Result<T> {
        let vm = self.lookup(name)?;
        require_state(&*vm, SHUT_OFF, "shut off")?;

        let current = vm.xml_desc(true).map_err(|e| Error::vm(name, e))?;
        let (updated, out) = edit(&current)?;
        if updated == current {
            info!("{what} already configured on {name}");
            return Ok(out);
        }

        self.hypervisor.define_vm(&updated, false)?;
        info!("Updated {what} on {name}");
        Ok(out)
    }

    fn definition(&self, name: &str) -> Result<String> {
        let vm = self.lookup(name)?;
        vm.xml_desc(true).map_err(|e| Error::vm(name, e))
    }

    pub fn change_vnc_password(&self, name: &str, password: &str) -> Result<()> {
        validate_vnc_password(password)?;
        self.edit_definition(name, "VNC password", |xml| {
            let mut doc = Document::parse_rooted(xml, "domain")?;
            let graphics = doc
                .root_mut()
                .child_mut("devices")
                .and_then(|devices| {
                    devices
                        .elements_mut()
                        .find(|e| e.name() == "graphics" && e.attr("type").as_deref() == Some("vnc"))
                })
                .ok_or_else(|| Error::NotFound(format!("VNC graphics of {name}")))?;
            graphics.set_attr("passwd", password);
            Ok((doc.to_string(), ()))
        })
    }

    pub fn hugepages(&self, name: &str) -> Result<HugePagesInfo> {
        Ok(memory_backing::inspect::<HugePages>(&self.definition(name)?)?)
    }

    pub fn set_hugepages(&self, name: &str, enable: bool) -> Result<HugePagesInfo> {
        self.edit_definition(name, "huge pages", |xml| {
            Ok(memory_backing::rewrite::<HugePages>(xml, enable)?)
        })
    }

    pub fn memory_balloon(&self, name: &str) -> Result<MemoryBalloonInfo> {
        Ok(memory_backing::inspect::<MemoryBalloon>(&self.definition(name)?)?)
    }

    pub fn set_memory_balloon(&self, name: &str, enable: bool) -> Result<MemoryBalloonInfo> {
        self.edit_definition(name, "memory balloon", |xml| {
            Ok(memory_backing::rewrite::<MemoryBalloon>(xml, enable)?)
        })
    }

    pub fn vnc_video(&self, name: &str) -> Result<VncVideoInfo> {
        Ok(memory_backing::inspect::<VncVideo>(&self.definition(name)?)?)
    }

    pub fn set_vnc_video(&self, name: &str, enable: bool) -> Result<VncVideoInfo> {
        self.edit_definition(name, "VNC video", |xml| {
            Ok(memory_backing::rewrite::<VncVideo>(xml, enable)?)
        })
    }

    /// Change the vCPU count, memory or disk size of a shut off workload.
    ///
    /// Everything is validated before the disk is touched: vCPUs of a pinned
    /// workload cannot change and memory may not exceed the host RAM.
    pub fn edit_resources(
        &self,
        name: &str,
        edit: &ResourceEdit,
        disks: &DiskTool,
    ) -> Result<ResourceReport> {
        edit.validate()?;
        let (report, changed) = self.edit_definition(name, "resources", |xml| {
            let mut doc = Document::parse_rooted(xml, "domain")?;
            let domain = doc.root_mut();
            let defined_vcpus = domain
                .child("vcpu")
                .and_then(|v| v.text().trim().parse::<u32>().ok())
                .ok_or_else(|| domain_xml::Error::Structure("domain has no usable <vcpu>".to_owned()))?;
            let defined_memory = domain
                .child("memory")
                .and_then(memory_mib)
                .ok_or_else(|| domain_xml::Error::Structure("domain has no usable <memory>".to_owned()))?;
            let vcpus = edit.vcpus.unwrap_or(defined_vcpus);
            let memory = edit.memory_mib.unwrap_or(defined_memory);

            if vcpus != defined_vcpus && !pinning::read_pins(domain)?.is_empty() {
                return Err(Error::Validation(format!(
                    "{name} has pinned vCPUs, remove CPU pinning before changing their count"
                )));
            }
            if memory != defined_memory {
                let host = host_memory_mib(&self.meminfo)?;
                if memory > host {
                    return Err(Error::Validation(format!(
                        "{memory} MiB exceeds the {host} MiB of host memory"
                    )));
                }
            }
            let grow = match edit.disk_size_gib {
                Some(size) => {
                    let disk = disk_path_from_xml(xml)?
                        .ok_or_else(|| Error::NotFound(format!("disk of {name}")))?;
                    Some((disk, size))
                }
                None => None,
            };

            let disk_grown = match grow {
                Some((disk, size)) => disks.grow(&disk, size)?,
                None => false,
            };
            if vcpus != defined_vcpus {
                set_vcpus(domain, vcpus)?;
            }
            if memory != defined_memory {
                set_memory(domain, memory)?;
            }
            let changed = disk_grown || vcpus != defined_vcpus || memory != defined_memory;
            let report = ResourceReport {
                vcpus,
                memory_mib: memory,
                disk_grown,
            };
            Ok((doc.to_string(), (report, changed)))
        })?;
        if changed {
            self.emit(name, "resized");
        }
        Ok(report)
    }

    /// Pin the workload to a core range of `topology`.
    pub fn apply_cpu_pinning(
        &self,
        name: &str,
        request: &PinningRequest,
        topology: &Topology,
    ) -> Result<Vec<VcpuPin>> {
        let pins = pinning::build_vcpu_pins(request, topology)?;
        self.edit_definition(name, "CPU pinning", |xml| {
            let mut doc = Document::parse_rooted(xml, "domain")?;
            pinning::apply_pins(doc.root_mut(), &pins)?;
            Ok((doc.to_string(), pins))
        })
    }

    pub fn remove_cpu_pinning(&self, name: &str) -> Result<()> {
        self.edit_definition(name, "CPU pinning removal", |xml| {
            let mut doc = Document::parse_rooted(xml, "domain")?;
            pinning::remove_pins(doc.root_mut())?;
            Ok((doc.to_string(), ()))
        })
    }

    pub fn get_cpu_pinning(&self, name: &str, topology: &Topology) -> Result<PinningReport> {
        let doc = Document::parse_rooted(&self.definition(name)?, "domain")?;
        let pins = pinning::read_pins(doc.root())?;
        let request = describe_pins(&pins, topology);
        Ok(PinningReport { pins, request })
    }
}
