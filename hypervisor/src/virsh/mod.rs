// Copyright © 2024 The vmhost Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Control-plane backend driving the `virsh` client as a subprocess.
//!
//! Each operation spawns one `virsh -c <uri>` process, so the connection is
//! scoped to that call and closed when the process exits. Every call waits a
//! bounded time for the process; the migrate call is bounded by its own
//! timeout when one is set.

use std::io::{Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context};
use vmm_sys_util::tempfile::TempFile;
use wait_timeout::ChildExt;

use crate::hypervisor::{self, HypervisorError};
use crate::vm::{
    self, HypervisorVmError, JobProgress, MigrateFlags, MigrateParams, ShutdownMode,
    UndefineFlags, Vm, VmState,
};

/// Environment variable the control plane reads ssh options from.
const SSH_OPTS_ENV: &str = "LIBVIRT_SSH_OPTS";

#[derive(Clone, Debug)]
struct VirshClient {
    binary: String,
    uri: String,
    timeout: Duration,
}

/// Exit status and captured output of one finished call.
struct Output {
    status: ExitStatus,
    stdout: String,
    stderr: String,
}

impl VirshClient {
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-c").arg(&self.uri);
        cmd
    }

    fn run(&self, args: &[&str]) -> anyhow::Result<String> {
        let mut cmd = self.command();
        cmd.args(args);
        debug!("Running {} {}", self.binary, args.join(" "));
        check_output(args, self.wait(args, cmd, Some(self.timeout))?)
    }

    /// Spawn `cmd` and wait for it, killing it once `limit` runs out.
    fn wait(&self, args: &[&str], mut cmd: Command, limit: Option<Duration>) -> anyhow::Result<Output> {
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.binary))?;

        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let status = match limit {
            Some(limit) => match child.wait_timeout(limit)? {
                Some(status) => status,
                None => {
                    child.kill().ok();
                    child.wait().ok();
                    return Err(anyhow!(
                        "virsh {} did not finish within {limit:?}",
                        args.first().unwrap_or(&"")
                    ));
                }
            },
            None => child.wait()?,
        };

        Ok(Output {
            status,
            stdout: stdout.and_then(|h| h.join().ok()).unwrap_or_default(),
            stderr: stderr.and_then(|h| h.join().ok()).unwrap_or_default(),
        })
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        pipe.read_to_end(&mut buf).ok();
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn check_output(args: &[&str], output: Output) -> anyhow::Result<String> {
    if output.status.success() {
        return Ok(output.stdout.trim().to_owned());
    }

    let stderr = output.stderr.trim();
    let detail = if stderr.is_empty() {
        output.stdout.trim()
    } else {
        stderr
    };
    Err(anyhow!(
        "virsh {} failed ({}): {detail}",
        args.first().unwrap_or(&""),
        output.status
    ))
}

fn is_not_found(err: &anyhow::Error) -> bool {
    let msg = err.to_string();
    msg.contains("failed to get domain") || msg.contains("Domain not found")
}

pub struct VirshHypervisor {
    client: VirshClient,
}

impl VirshHypervisor {
    /// Create a hypervisor handle speaking to `uri` through the `virsh`
    /// binary, giving up on any call that takes longer than `timeout`.
    pub fn new(binary: &str, uri: &str, timeout: Duration) -> Self {
        VirshHypervisor {
            client: VirshClient {
                binary: binary.to_owned(),
                uri: uri.to_owned(),
                timeout,
            },
        }
    }

    fn vm(&self, name: &str) -> Arc<dyn Vm> {
        Arc::new(VirshVm {
            client: self.client.clone(),
            name: name.to_owned(),
        })
    }
}

impl hypervisor::Hypervisor for VirshHypervisor {
    fn uri(&self) -> String {
        self.client.uri.clone()
    }

    fn lookup_vm(&self, name: &str) -> hypervisor::Result<Arc<dyn Vm>> {
        match self.client.run(&["domuuid", name]) {
            Ok(_) => Ok(self.vm(name)),
            Err(e) if is_not_found(&e) => Err(HypervisorError::VmNotFound(name.to_owned())),
            Err(e) => Err(HypervisorError::VmLookup(name.to_owned(), e)),
        }
    }

    fn define_vm(&self, xml: &str, validate: bool) -> hypervisor::Result<Arc<dyn Vm>> {
        let file = TempFile::new_with_prefix("/tmp/vmhost-define")
            .map_err(|e| HypervisorError::VmDefine(e.into()))?;
        file.as_file()
            .write_all(xml.as_bytes())
            .map_err(|e| HypervisorError::VmDefine(e.into()))?;

        let path = file.as_path().to_string_lossy().into_owned();
        let mut args = vec!["define"];
        if validate {
            args.push("--validate");
        }
        args.push(&path);

        let out = self.client.run(&args).map_err(HypervisorError::VmDefine)?;
        let name = parse_defined_name(&out)
            .ok_or_else(|| HypervisorError::VmDefine(anyhow!("unexpected output: {out}")))?;
        Ok(self.vm(&name))
    }

    fn list_vms(&self) -> hypervisor::Result<Vec<String>> {
        let out = self
            .client
            .run(&["list", "--all", "--name"])
            .map_err(HypervisorError::VmList)?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_owned)
            .collect())
    }
}

pub struct VirshVm {
    client: VirshClient,
    name: String,
}

impl VirshVm {
    fn run(&self, args: &[&str]) -> anyhow::Result<String> {
        let mut full = args.to_vec();
        full.push(&self.name);
        self.client.run(&full)
    }
}

impl Vm for VirshVm {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn state(&self) -> vm::Result<VmState> {
        let out = self
            .run(&["domstate"])
            .map_err(HypervisorVmError::GetState)?;
        Ok(parse_state(&out))
    }

    fn xml_desc(&self, inactive: bool) -> vm::Result<String> {
        let args: &[&str] = if inactive {
            &["dumpxml", "--inactive"]
        } else {
            &["dumpxml"]
        };
        self.run(args).map_err(HypervisorVmError::GetXml)
    }

    fn uuid(&self) -> vm::Result<String> {
        self.run(&["domuuid"]).map_err(HypervisorVmError::GetUuid)
    }

    fn create(&self) -> vm::Result<()> {
        self.run(&["start"])
            .map(|_| ())
            .map_err(HypervisorVmError::Create)
    }

    fn destroy(&self) -> vm::Result<()> {
        self.run(&["destroy"])
            .map(|_| ())
            .map_err(HypervisorVmError::Destroy)
    }

    fn suspend(&self) -> vm::Result<()> {
        self.run(&["suspend"])
            .map(|_| ())
            .map_err(HypervisorVmError::Suspend)
    }

    fn resume(&self) -> vm::Result<()> {
        self.run(&["resume"])
            .map(|_| ())
            .map_err(HypervisorVmError::Resume)
    }

    fn shutdown(&self, mode: ShutdownMode) -> vm::Result<()> {
        let mode = match mode {
            ShutdownMode::GuestAgent => "agent",
            ShutdownMode::Acpi => "acpi",
        };
        self.run(&["shutdown", "--mode", mode])
            .map(|_| ())
            .map_err(HypervisorVmError::Shutdown)
    }

    fn undefine(&self, flags: UndefineFlags) -> vm::Result<()> {
        let mut args = vec!["undefine"];
        if flags.contains(UndefineFlags::MANAGED_SAVE) {
            args.push("--managed-save");
        }
        if flags.contains(UndefineFlags::SNAPSHOTS_METADATA) {
            args.push("--snapshots-metadata");
        }
        if flags.contains(UndefineFlags::NVRAM) {
            args.push("--nvram");
        }
        self.run(&args)
            .map(|_| ())
            .map_err(HypervisorVmError::Undefine)
    }

    fn migrate(&self, params: &MigrateParams) -> vm::Result<()> {
        let args = migrate_args(&self.name, params);
        let mut cmd = self.client.command();
        cmd.args(&args);
        if !params.ssh_options.is_empty() {
            cmd.env(SSH_OPTS_ENV, params.ssh_options.join(" "));
        }
        info!(
            "Migrating {} to {} with flags {:?}",
            self.name, params.dest_uri, params.flags
        );

        // Past its timeout the control plane suspends the guest so the copy
        // converges; allow one regular call timeout on top for that.
        let limit = params.timeout.map(|t| t + self.client.timeout);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.client
            .wait(&arg_refs, cmd, limit)
            .and_then(|output| check_output(&arg_refs, output))
            .map(|_| ())
            .map_err(HypervisorVmError::Migrate)
    }

    fn job_progress(&self) -> vm::Result<JobProgress> {
        let out = self
            .run(&["domjobinfo"])
            .map_err(HypervisorVmError::JobInfo)?;
        Ok(parse_job_info(&out))
    }

    fn abort_job(&self) -> vm::Result<()> {
        self.run(&["domjobabort"])
            .map(|_| ())
            .map_err(HypervisorVmError::AbortJob)
    }
}

fn migrate_args(name: &str, params: &MigrateParams) -> Vec<String> {
    let flag_args = [
        (MigrateFlags::PERSIST_DEST, "--persistent"),
        (MigrateFlags::UNDEFINE_SOURCE, "--undefinesource"),
        (MigrateFlags::PEER2PEER, "--p2p"),
        (MigrateFlags::TUNNELLED, "--tunnelled"),
        (MigrateFlags::LIVE, "--live"),
        (MigrateFlags::AUTO_CONVERGE, "--auto-converge"),
        (MigrateFlags::ABORT_ON_ERROR, "--abort-on-error"),
    ];

    let mut args = vec!["migrate".to_owned()];
    for (flag, arg) in flag_args {
        if params.flags.contains(flag) {
            args.push(arg.to_owned());
        }
    }
    if let Some(timeout) = params.timeout.filter(|t| t.as_secs() > 0) {
        args.push("--timeout".to_owned());
        args.push(timeout.as_secs().to_string());
    }
    args.push(name.to_owned());
    args.push(params.dest_uri.clone());
    args
}

fn parse_state(out: &str) -> VmState {
    match out.lines().next().unwrap_or("").trim() {
        "running" => VmState::Running,
        "idle" | "blocked" => VmState::Blocked,
        "paused" => VmState::Paused,
        "in shutdown" => VmState::ShuttingDown,
        "shut off" => VmState::ShutOff,
        "crashed" => VmState::Crashed,
        "pmsuspended" => VmState::Suspended,
        "no state" => VmState::NoState,
        _ => VmState::Unknown,
    }
}

/// Output of `define` is `Domain 'name' defined from /path`.
fn parse_defined_name(out: &str) -> Option<String> {
    let rest = out.trim().strip_prefix("Domain ")?;
    let (name, _) = rest.rsplit_once(" defined from")?;
    let name = name.trim().trim_matches('\'');
    (!name.is_empty()).then(|| name.to_owned())
}

fn parse_size(value: &str) -> Option<u64> {
    let mut parts = value.split_whitespace();
    let number: f64 = parts.next()?.parse().ok()?;
    let multiplier: u64 = match parts.next().unwrap_or("B") {
        "B" | "bytes" => 1,
        "KiB" => 1 << 10,
        "MiB" => 1 << 20,
        "GiB" => 1 << 30,
        "TiB" => 1 << 40,
        _ => return None,
    };
    Some((number * multiplier as f64) as u64)
}

fn parse_job_info(out: &str) -> JobProgress {
    let mut progress = JobProgress::default();
    for line in out.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let Some(bytes) = parse_size(value.trim()) else {
            continue;
        };
        match key.trim() {
            "Memory total" => progress.mem_total = bytes,
            "Memory processed" => progress.mem_processed = bytes,
            "Data total" => progress.data_total = bytes,
            "Data processed" => progress.data_processed = bytes,
            _ => {}
        }
    }
    progress
}
