// Copyright © 2024 The vmhost Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! In-memory hypervisor used by unit tests.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use hypervisor::vm;
use hypervisor::{
    Hypervisor, HypervisorError, HypervisorVmError, JobProgress, MigrateFlags, MigrateParams,
    ShutdownMode, UndefineFlags, Vm, VmState,
};

use crate::domain_xml::Document;

pub(crate) type CallLog = Arc<Mutex<Vec<String>>>;

/// Outcome of a migration started on a [`MockVm`].
#[derive(Clone, Debug)]
pub(crate) enum MigrateBehaviour {
    /// Complete after the given delay.
    Succeed(Duration),
    Fail(String),
    /// Run until `abort_job` is called.
    BlockUntilAbort,
}

pub(crate) struct MockVm {
    name: String,
    uuid: String,
    calls: CallLog,
    pub state: Mutex<VmState>,
    pub xml: Mutex<String>,
    pub undefined: AtomicBool,
    pub agent_shutdown_fails: AtomicBool,
    pub create_fails: AtomicBool,
    pub shutdown_takes_effect: AtomicBool,
    pub abort_fails: AtomicBool,
    pub migrate_behaviour: Mutex<MigrateBehaviour>,
    /// Successive `job_progress` answers; the last one repeats.
    pub progress: Mutex<VecDeque<JobProgress>>,
    aborted: (Mutex<bool>, Condvar),
}

impl MockVm {
    fn new(name: &str, uuid: String, xml: &str, calls: CallLog) -> Self {
        MockVm {
            name: name.to_owned(),
            uuid,
            calls,
            state: Mutex::new(VmState::ShutOff),
            xml: Mutex::new(xml.to_owned()),
            undefined: AtomicBool::new(false),
            agent_shutdown_fails: AtomicBool::new(false),
            create_fails: AtomicBool::new(false),
            shutdown_takes_effect: AtomicBool::new(true),
            abort_fails: AtomicBool::new(false),
            migrate_behaviour: Mutex::new(MigrateBehaviour::Succeed(Duration::ZERO)),
            progress: Mutex::new(VecDeque::new()),
            aborted: (Mutex::new(false), Condvar::new()),
        }
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn set_state(&self, state: VmState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn set_migrate(&self, behaviour: MigrateBehaviour) {
        *self.migrate_behaviour.lock().unwrap() = behaviour;
    }

    pub fn push_progress(&self, progress: JobProgress) {
        self.progress.lock().unwrap().push_back(progress);
    }

    pub fn xml(&self) -> String {
        self.xml.lock().unwrap().clone()
    }
}

impl Vm for MockVm {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn state(&self) -> vm::Result<VmState> {
        Ok(*self.state.lock().unwrap())
    }

    fn xml_desc(&self, _inactive: bool) -> vm::Result<String> {
        Ok(self.xml())
    }

    fn uuid(&self) -> vm::Result<String> {
        Ok(self.uuid.clone())
    }

    fn create(&self) -> vm::Result<()> {
        self.record(format!("create {}", self.name));
        if self.create_fails.load(Ordering::SeqCst) {
            return Err(HypervisorVmError::Create(anyhow!(
                "Requested operation is not valid: network 'default' is not active"
            )));
        }
        self.set_state(VmState::Running);
        Ok(())
    }

    fn destroy(&self) -> vm::Result<()> {
        self.record(format!("destroy {}", self.name));
        self.set_state(VmState::ShutOff);
        Ok(())
    }

    fn suspend(&self) -> vm::Result<()> {
        self.record(format!("suspend {}", self.name));
        self.set_state(VmState::Paused);
        Ok(())
    }

    fn resume(&self) -> vm::Result<()> {
        self.record(format!("resume {}", self.name));
        self.set_state(VmState::Running);
        Ok(())
    }

    fn shutdown(&self, mode: ShutdownMode) -> vm::Result<()> {
        let mode_name = match mode {
            ShutdownMode::GuestAgent => "agent",
            ShutdownMode::Acpi => "acpi",
        };
        self.record(format!("shutdown {} {mode_name}", self.name));
        if mode == ShutdownMode::GuestAgent && self.agent_shutdown_fails.load(Ordering::SeqCst) {
            return Err(HypervisorVmError::Shutdown(anyhow!(
                "guest agent is not connected"
            )));
        }
        if self.shutdown_takes_effect.load(Ordering::SeqCst) {
            self.set_state(VmState::ShutOff);
        }
        Ok(())
    }

    fn undefine(&self, flags: UndefineFlags) -> vm::Result<()> {
        self.record(format!("undefine {} {:?}", self.name, flags.bits()));
        self.undefined.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn migrate(&self, params: &MigrateParams) -> vm::Result<()> {
        self.record(format!("migrate {} {}", self.name, params.dest_uri));
        let behaviour = self.migrate_behaviour.lock().unwrap().clone();
        match behaviour {
            MigrateBehaviour::Succeed(delay) => {
                thread::sleep(delay);
                if params.flags.contains(MigrateFlags::UNDEFINE_SOURCE) {
                    self.undefined.store(true, Ordering::SeqCst);
                }
                self.set_state(VmState::ShutOff);
                Ok(())
            }
            MigrateBehaviour::Fail(reason) => Err(HypervisorVmError::Migrate(anyhow!(reason))),
            MigrateBehaviour::BlockUntilAbort => {
                let (lock, cvar) = &self.aborted;
                let mut aborted = lock.lock().unwrap();
                while !*aborted {
                    aborted = cvar.wait(aborted).unwrap();
                }
                Err(HypervisorVmError::Migrate(anyhow!(
                    "operation aborted: migration job: canceled by client"
                )))
            }
        }
    }

    fn job_progress(&self) -> vm::Result<JobProgress> {
        let mut progress = self.progress.lock().unwrap();
        if progress.len() > 1 {
            Ok(progress.pop_front().unwrap_or_default())
        } else {
            Ok(progress.front().copied().unwrap_or_default())
        }
    }

    fn abort_job(&self) -> vm::Result<()> {
        self.record(format!("abort {}", self.name));
        if self.abort_fails.load(Ordering::SeqCst) {
            return Err(HypervisorVmError::AbortJob(anyhow!("no job is active")));
        }
        let (lock, cvar) = &self.aborted;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct MockHypervisor {
    pub calls: CallLog,
    vms: Mutex<BTreeMap<String, Arc<MockVm>>>,
    pub reject_definitions: AtomicBool,
    /// Newly defined workloads refuse to start.
    pub reject_starts: AtomicBool,
}

impl MockHypervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Define `name` from the shared fixture and put it in `state`.
    pub fn add_vm(&self, name: &str, state: VmState) -> Arc<MockVm> {
        self.insert(name, &domain_xml(name), state)
    }

    pub fn insert(&self, name: &str, xml: &str, state: VmState) -> Arc<MockVm> {
        let mut vms = self.vms.lock().unwrap();
        let uuid = format!("6f1c2a4e-5b7d-4c3a-9e21-{:012}", vms.len() + 1);
        let vm = Arc::new(MockVm::new(name, uuid, xml, self.calls.clone()));
        vm.set_state(state);
        vms.insert(name.to_owned(), vm.clone());
        vm
    }

    pub fn vm(&self, name: &str) -> Option<Arc<MockVm>> {
        self.vms
            .lock()
            .unwrap()
            .get(name)
            .filter(|vm| !vm.undefined.load(Ordering::SeqCst))
            .cloned()
    }

    /// Every state changing call issued so far, in order.
    pub fn mutations(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Hypervisor for MockHypervisor {
    fn uri(&self) -> String {
        "test:///default".to_owned()
    }

    fn lookup_vm(&self, name: &str) -> hypervisor::hypervisor::Result<Arc<dyn Vm>> {
        self.vm(name)
            .map(|vm| vm as Arc<dyn Vm>)
            .ok_or_else(|| HypervisorError::VmNotFound(name.to_owned()))
    }

    fn define_vm(&self, xml: &str, validate: bool) -> hypervisor::hypervisor::Result<Arc<dyn Vm>> {
        if self.reject_definitions.load(Ordering::SeqCst) {
            return Err(HypervisorError::VmDefine(anyhow!(
                "XML document failed to validate against schema"
            )));
        }
        let doc = Document::parse(xml).map_err(|e| HypervisorError::VmDefine(e.into()))?;
        let name = doc
            .root()
            .child("name")
            .map(|n| n.text().trim().to_owned())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| HypervisorError::VmDefine(anyhow!("missing domain name")))?;

        self.calls
            .lock()
            .unwrap()
            .push(format!("define {name}{}", if validate { " validate" } else { "" }));

        match self.vm(&name) {
            Some(vm) => {
                *vm.xml.lock().unwrap() = xml.to_owned();
                Ok(vm as Arc<dyn Vm>)
            }
            None => {
                let vm = self.insert(&name, xml, VmState::ShutOff);
                vm.create_fails
                    .store(self.reject_starts.load(Ordering::SeqCst), Ordering::SeqCst);
                Ok(vm as Arc<dyn Vm>)
            }
        }
    }

    fn list_vms(&self) -> hypervisor::hypervisor::Result<Vec<String>> {
        Ok(self
            .vms
            .lock()
            .unwrap()
            .values()
            .filter(|vm| !vm.undefined.load(Ordering::SeqCst))
            .map(|vm| vm.name.clone())
            .collect())
    }
}

/// Install an executable stand-in for the tool `name` running `body`.
pub(crate) fn fake_tool(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

/// Description of a small q35 guest with a VNC console.
pub(crate) fn domain_xml(name: &str) -> String {
    format!(
        "<domain type='kvm'>
  <name>{name}</name>
  <uuid>6f1c2a4e-5b7d-4c3a-9e21-7d0c3b5a9f10</uuid>
  <memory unit='KiB'>4194304</memory>
  <currentMemory unit='KiB'>4194304</currentMemory>
  <vcpu placement='static'>4</vcpu>
  <os>
    <type arch='x86_64' machine='pc-q35-8.2'>hvm</type>
    <boot dev='hd'/>
  </os>
  <cpu mode='host-passthrough' check='none' migratable='on'>
    <topology sockets='1' cores='4' threads='1'/>
  </cpu>
  <devices>
    <emulator>/usr/bin/qemu-system-x86_64</emulator>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='/var/lib/vmhost/disks/{name}/{name}.qcow2'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <graphics type='vnc' port='-1' autoport='yes' listen='127.0.0.1' passwd='oldsecret'>
      <listen type='address' address='127.0.0.1'/>
    </graphics>
    <memballoon model='virtio'>
      <stats period='10'/>
    </memballoon>
  </devices>
</domain>
"
    )
}
