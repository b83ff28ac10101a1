// Copyright © 2024 The vmhost Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Reconciliation of the kernel boot arguments that reserve host resources
//! for workloads: core isolation and huge pages.
//!
//! The persisted arguments of the default boot entry are compared with the
//! command line the host actually booted with. Both sides are normalized
//! first, so `hugepagesz=2048K` and `hugepagesz=2M` do not report a pending
//! reboot.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use option_parser::{CpuList, HugePageSize};
use serde::{Deserialize, Serialize};

use crate::command::{self, CommandRunner};
use crate::config::HostConfig;
use crate::isolation::{build_isolation_cpuset, socket_isolation, IsolationSelection, SocketIsolation};
use crate::notify::{NoopNotifier, Notification, Notifier};
use crate::topology::Topology;
use crate::{Error, Result};

const ISOLCPUS: &str = "isolcpus";
const NOHZ_FULL: &str = "nohz_full";
const RCU_NOCBS: &str = "rcu_nocbs";
const DEFAULT_HUGEPAGESZ: &str = "default_hugepagesz";
const HUGEPAGESZ: &str = "hugepagesz";
const HUGEPAGES: &str = "hugepages";

/// Access to the persisted kernel arguments of the host.
pub trait BootLoader: Send + Sync {
    /// Fail with [`Error::ToolMissing`] when the tool cannot be used.
    fn ensure_available(&self) -> Result<()>;
    /// Arguments of the default boot entry.
    fn default_args(&self) -> Result<String>;
    /// Add `args` to every boot entry.
    fn add_args(&self, args: &str) -> Result<()>;
    /// Drop the arguments named `keys` from every boot entry.
    fn remove_args(&self, keys: &[&str]) -> Result<()>;
}

/// [`BootLoader`] backed by `grubby`.
pub struct Grubby {
    binary: String,
    runner: CommandRunner,
}

impl Grubby {
    pub fn new(binary: &str, runner: CommandRunner) -> Self {
        Grubby {
            binary: binary.to_owned(),
            runner,
        }
    }
}

/// Pull the `args=` value out of `grubby --info` output.
fn extract_args_line(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        line.trim()
            .strip_prefix("args=")
            .map(|raw| raw.trim().trim_matches('"').to_owned())
    })
}

impl BootLoader for Grubby {
    fn ensure_available(&self) -> Result<()> {
        if command::has_binary(&self.binary) {
            Ok(())
        } else {
            Err(Error::ToolMissing(self.binary.clone()))
        }
    }

    fn default_args(&self) -> Result<String> {
        let out = self.runner.run_privileged(&self.binary, &["--info=DEFAULT"])?;
        extract_args_line(&out).ok_or_else(|| {
            Error::ToolOutput(self.binary.clone(), "no args= line for the default entry".to_owned())
        })
    }

    fn add_args(&self, args: &str) -> Result<()> {
        self.runner
            .run_privileged(&self.binary, &["--update-kernel=ALL", "--args", args])?;
        Ok(())
    }

    fn remove_args(&self, keys: &[&str]) -> Result<()> {
        let keys = keys.join(" ");
        self.runner
            .run_privileged(&self.binary, &["--update-kernel=ALL", "--remove-args", &keys])?;
        Ok(())
    }
}

/// Kernel command line as `key -> value`; flags map to an empty value.
pub fn parse_kernel_args(cmdline: &str) -> BTreeMap<String, String> {
    cmdline
        .split_whitespace()
        .map(|token| match token.split_once('=') {
            Some((key, value)) => (key.trim().to_owned(), value.trim().to_owned()),
            None => (token.trim().to_owned(), String::new()),
        })
        .collect()
}

/// A family of kernel arguments managed together.
pub trait KernelArgGroup: Sized {
    const KEYS: &'static [&'static str];

    fn from_args(args: &BTreeMap<String, String>) -> Result<Self>;
    /// Normalized value of every key, in `KEYS` order.
    fn canonical(&self) -> Vec<String>;
    /// Whether any key is present with a value.
    fn is_set(&self) -> bool;
}

fn raw_arg(args: &BTreeMap<String, String>, key: &str) -> String {
    args.get(key).map(|v| v.trim().to_owned()).unwrap_or_default()
}

fn invalid_arg(key: &str, raw: &str, reason: impl std::fmt::Display) -> Error {
    Error::Validation(format!("invalid {key} value {raw:?}: {reason}"))
}

fn parse_cpu_arg(key: &str, raw: &str) -> Result<CpuList> {
    let list = if key == ISOLCPUS {
        // Drop leading flags such as `domain,managed_irq,`.
        let parts: Vec<&str> = raw.split(',').collect();
        match parts
            .iter()
            .position(|p| p.chars().any(|c| c.is_ascii_digit()))
        {
            Some(start) => parts[start..].join(","),
            None if raw.is_empty() => String::new(),
            None => return Err(invalid_arg(key, raw, "missing CPU list")),
        }
    } else {
        raw.to_owned()
    };
    list.parse::<CpuList>()
        .map_err(|e| invalid_arg(key, raw, e))
}

/// `isolcpus`, `nohz_full` and `rcu_nocbs` as found on a command line.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IsolationArgs {
    pub isolcpus: String,
    pub nohz_full: String,
    pub rcu_nocbs: String,
    /// Isolated CPUs: `isolcpus`, else `nohz_full`, else `rcu_nocbs`.
    pub cpus: CpuList,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sockets: Vec<SocketIsolation>,
    #[serde(skip)]
    lists: [CpuList; 3],
}

impl KernelArgGroup for IsolationArgs {
    const KEYS: &'static [&'static str] = &[ISOLCPUS, NOHZ_FULL, RCU_NOCBS];

    fn from_args(args: &BTreeMap<String, String>) -> Result<Self> {
        let isolcpus = raw_arg(args, ISOLCPUS);
        let nohz_full = raw_arg(args, NOHZ_FULL);
        let rcu_nocbs = raw_arg(args, RCU_NOCBS);

        let lists = [
            parse_cpu_arg(ISOLCPUS, &isolcpus)?,
            parse_cpu_arg(NOHZ_FULL, &nohz_full)?,
            parse_cpu_arg(RCU_NOCBS, &rcu_nocbs)?,
        ];
        let cpus = lists
            .iter()
            .find(|l| !l.is_empty())
            .cloned()
            .unwrap_or_default();

        Ok(IsolationArgs {
            isolcpus,
            nohz_full,
            rcu_nocbs,
            cpus,
            sockets: Vec::new(),
            lists,
        })
    }

    fn canonical(&self) -> Vec<String> {
        self.lists.iter().map(|l| l.to_string()).collect()
    }

    fn is_set(&self) -> bool {
        !(self.isolcpus.is_empty() && self.nohz_full.is_empty() && self.rcu_nocbs.is_empty())
    }
}

/// Huge page arguments as found on a command line.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HugePagesArgs {
    pub default_hugepagesz: String,
    pub hugepagesz: String,
    pub hugepages: String,
    /// `default_hugepagesz`, else `hugepagesz`, in canonical form.
    pub page_size: Option<String>,
    pub page_count: Option<u64>,
    #[serde(skip)]
    sizes: [Option<HugePageSize>; 2],
}

fn parse_size_arg(key: &str, raw: &str) -> Result<Option<HugePageSize>> {
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<HugePageSize>()
        .map(Some)
        .map_err(|e| invalid_arg(key, raw, e))
}

impl KernelArgGroup for HugePagesArgs {
    const KEYS: &'static [&'static str] = &[DEFAULT_HUGEPAGESZ, HUGEPAGESZ, HUGEPAGES];

    fn from_args(args: &BTreeMap<String, String>) -> Result<Self> {
        let default_hugepagesz = raw_arg(args, DEFAULT_HUGEPAGESZ);
        let hugepagesz = raw_arg(args, HUGEPAGESZ);
        let hugepages = raw_arg(args, HUGEPAGES);

        let sizes = [
            parse_size_arg(DEFAULT_HUGEPAGESZ, &default_hugepagesz)?,
            parse_size_arg(HUGEPAGESZ, &hugepagesz)?,
        ];
        let page_count = if hugepages.is_empty() {
            None
        } else {
            Some(
                hugepages
                    .parse::<u64>()
                    .map_err(|e| invalid_arg(HUGEPAGES, &hugepages, e))?,
            )
        };

        Ok(HugePagesArgs {
            page_size: sizes.iter().flatten().next().map(|s| s.to_string()),
            default_hugepagesz,
            hugepagesz,
            hugepages,
            page_count,
            sizes,
        })
    }

    fn canonical(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .sizes
            .iter()
            .map(|s| s.map(|s| s.to_string()).unwrap_or_default())
            .collect();
        out.push(self.page_count.map(|c| c.to_string()).unwrap_or_default());
        out
    }

    fn is_set(&self) -> bool {
        !(self.default_hugepagesz.is_empty() && self.hugepagesz.is_empty() && self.hugepages.is_empty())
    }
}

/// Persisted versus booted view of one argument group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HostTuningState<V> {
    pub enabled: bool,
    pub reboot_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub configured: V,
    pub active: V,
}

/// Requested host huge page reservation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HugePagesSpec {
    pub page_size: String,
    pub count: u64,
}

impl HugePagesSpec {
    pub fn validate(&self) -> Result<HugePageSize> {
        let size = self
            .page_size
            .parse::<HugePageSize>()
            .map_err(|e| Error::Validation(format!("invalid page size: {e}")))?;
        if self.count == 0 {
            return Err(Error::Validation("page count must be > 0".to_owned()));
        }
        Ok(size)
    }
}

/// `Hugepagesize` and `HugePages_Total` from a meminfo file.
fn read_meminfo(path: &Path) -> Result<(Option<HugePageSize>, Option<u64>)> {
    let content = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    let mut size = None;
    let mut total = None;
    for line in content.lines() {
        if let Some(raw) = line.strip_prefix("Hugepagesize:") {
            size = raw.trim().parse::<HugePageSize>().ok();
        } else if let Some(raw) = line.strip_prefix("HugePages_Total:") {
            total = raw.trim().parse::<u64>().ok();
        }
    }
    Ok((size, total))
}

/// Host RAM in MiB, from the `MemTotal` line of a meminfo file.
pub fn host_memory_mib(path: &Path) -> Result<u64> {
    let content = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    content
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))
        .and_then(|raw| raw.trim().trim_end_matches("kB").trim().parse::<u64>().ok())
        .map(|kib| kib / 1024)
        .filter(|mib| *mib > 0)
        .ok_or_else(|| Error::ToolOutput(path.display().to_string(), "no usable MemTotal".to_owned()))
}

pub struct HostTuning {
    bootloader: Box<dyn BootLoader>,
    cmdline: PathBuf,
    meminfo: PathBuf,
    notifier: Arc<dyn Notifier>,
}

impl HostTuning {
    pub fn new(bootloader: Box<dyn BootLoader>, cmdline: &Path, meminfo: &Path) -> Self {
        HostTuning {
            bootloader,
            cmdline: cmdline.to_path_buf(),
            meminfo: meminfo.to_path_buf(),
            notifier: Arc::new(NoopNotifier),
        }
    }

    pub fn from_config(config: &HostConfig) -> Self {
        Self::new(
            Box::new(Grubby::new(&config.bootloader, config.command_runner())),
            &config.cmdline,
            &config.meminfo,
        )
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    fn state<G: KernelArgGroup>(&self) -> Result<HostTuningState<G>> {
        let configured = G::from_args(&parse_kernel_args(&self.bootloader.default_args()?))?;
        let booted = fs::read_to_string(&self.cmdline).map_err(|e| Error::io(&self.cmdline, e))?;
        let active = G::from_args(&parse_kernel_args(booted.trim()))?;

        Ok(HostTuningState {
            enabled: configured.is_set(),
            reboot_required: configured.canonical() != active.canonical(),
            message: None,
            configured,
            active,
        })
    }

    fn finish<V>(&self, mut state: HostTuningState<V>, event: &'static str, message: &str) -> HostTuningState<V> {
        let mut message = message.to_owned();
        if state.reboot_required {
            message.push_str(" (reboot required)");
        }
        info!("{message}");
        self.notifier.notify(&Notification::HostTuning {
            event,
            message: message.clone(),
        });
        state.message = Some(message);
        state
    }

    pub fn get_core_isolation(&self, topology: &Topology) -> Result<HostTuningState<IsolationArgs>> {
        let mut state = self.state::<IsolationArgs>()?;
        state.configured.sockets = socket_isolation(topology, &state.configured.cpus);
        state.active.sockets = socket_isolation(topology, &state.active.cpus);
        Ok(state)
    }

    /// Isolate the selected physical cores (with all their siblings) from
    /// the next boot on, replacing any previous isolation.
    pub fn set_core_isolation(
        &self,
        selections: &[IsolationSelection],
        topology: &Topology,
    ) -> Result<HostTuningState<IsolationArgs>> {
        let cpus = build_isolation_cpuset(selections, topology)?;
        if cpus.is_empty() {
            return Err(Error::Validation(
                "no cores selected for isolation; remove isolation instead".to_owned(),
            ));
        }
        self.bootloader.ensure_available()?;

        self.bootloader.remove_args(IsolationArgs::KEYS)?;
        self.bootloader.add_args(&format!(
            "{ISOLCPUS}={cpus} {NOHZ_FULL}={cpus} {RCU_NOCBS}={cpus}"
        ))?;

        let state = self.get_core_isolation(topology)?;
        Ok(self.finish(state, "isolation-updated", "host core isolation updated"))
    }

    pub fn remove_core_isolation(&self, topology: &Topology) -> Result<HostTuningState<IsolationArgs>> {
        self.bootloader.ensure_available()?;
        self.bootloader.remove_args(IsolationArgs::KEYS)?;
        let state = self.get_core_isolation(topology)?;
        Ok(self.finish(state, "isolation-removed", "host core isolation removed"))
    }

    /// Huge page state. When the booted command line does not carry huge
    /// page arguments, the active side reports what meminfo shows.
    pub fn get_hugepages(&self) -> Result<HostTuningState<HugePagesArgs>> {
        let mut state = self.state::<HugePagesArgs>()?;
        let (size, total) = read_meminfo(&self.meminfo)?;
        if state.active.page_size.is_none() {
            state.active.page_size = size.map(|s| s.to_string());
        }
        if state.active.page_count.is_none() {
            state.active.page_count = total;
        }
        Ok(state)
    }

    pub fn set_hugepages(&self, spec: &HugePagesSpec) -> Result<HostTuningState<HugePagesArgs>> {
        let size = spec.validate()?;
        self.bootloader.ensure_available()?;

        self.bootloader.remove_args(HugePagesArgs::KEYS)?;
        self.bootloader.add_args(&format!(
            "{DEFAULT_HUGEPAGESZ}={size} {HUGEPAGESZ}={size} {HUGEPAGES}={}",
            spec.count
        ))?;

        let state = self.get_hugepages()?;
        Ok(self.finish(state, "hugepages-updated", "host hugepages updated"))
    }

    pub fn remove_hugepages(&self) -> Result<HostTuningState<HugePagesArgs>> {
        self.bootloader.ensure_available()?;
        self.bootloader.remove_args(HugePagesArgs::KEYS)?;
        let state = self.get_hugepages()?;
        Ok(self.finish(state, "hugepages-removed", "host hugepages removed"))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use vmm_sys_util::tempdir::TempDir;

    use super::*;
    use crate::notify::tests::RecordingNotifier;
    use crate::topology::tests::ht_topology;

    /// Boot entry kept in memory, edited like grubby does.
    struct MemoryBootLoader {
        args: Mutex<String>,
        available: bool,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl MemoryBootLoader {
        fn new(args: &str, available: bool) -> (Self, Arc<Mutex<Vec<String>>>) {
            let calls = Arc::new(Mutex::new(Vec::new()));
            (
                MemoryBootLoader {
                    args: Mutex::new(args.to_owned()),
                    available,
                    calls: calls.clone(),
                },
                calls,
            )
        }
    }

    impl BootLoader for MemoryBootLoader {
        fn ensure_available(&self) -> Result<()> {
            if self.available {
                Ok(())
            } else {
                Err(Error::ToolMissing("grubby".to_owned()))
            }
        }

        fn default_args(&self) -> Result<String> {
            self.ensure_available()?;
            Ok(self.args.lock().unwrap().clone())
        }

        fn add_args(&self, args: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("add {args}"));
            let mut current = self.args.lock().unwrap();
            *current = format!("{} {args}", current.trim());
            Ok(())
        }

        fn remove_args(&self, keys: &[&str]) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("remove {}", keys.join(" ")));
            let mut current = self.args.lock().unwrap();
            *current = current
                .split_whitespace()
                .filter(|t| !keys.contains(&t.split('=').next().unwrap_or(t)))
                .collect::<Vec<_>>()
                .join(" ");
            Ok(())
        }
    }

    struct Host {
        _dir: TempDir,
        tuning: HostTuning,
        calls: Arc<Mutex<Vec<String>>>,
        notifier: Arc<RecordingNotifier>,
    }

    const MEMINFO: &str = "MemTotal:       65536000 kB
HugePages_Total:       0
HugePages_Free:        0
Hugepagesize:       2048 kB
";

    fn host(persisted: &str, booted: &str, available: bool) -> Host {
        let dir = TempDir::new_with_prefix("/tmp/vmhost-tuning").unwrap();
        let cmdline = dir.as_path().join("cmdline");
        let meminfo = dir.as_path().join("meminfo");
        fs::write(&cmdline, format!("{booted}\n")).unwrap();
        fs::write(&meminfo, MEMINFO).unwrap();

        let (bootloader, calls) = MemoryBootLoader::new(persisted, available);
        let notifier = Arc::new(RecordingNotifier::default());
        let tuning = HostTuning::new(Box::new(bootloader), &cmdline, &meminfo)
            .with_notifier(notifier.clone());
        Host {
            _dir: dir,
            tuning,
            calls,
            notifier,
        }
    }

    const BASE: &str = "BOOT_IMAGE=(hd0,gpt2)/vmlinuz-6.8.0 root=UUID=4c1e ro quiet";

    #[test]
    fn test_host_memory_mib() {
        let dir = TempDir::new_with_prefix("/tmp/vmhost-tuning").unwrap();
        let meminfo = dir.as_path().join("meminfo");
        fs::write(&meminfo, MEMINFO).unwrap();
        assert_eq!(host_memory_mib(&meminfo).unwrap(), 64000);

        fs::write(&meminfo, "MemFree: 12 kB\n").unwrap();
        assert!(matches!(host_memory_mib(&meminfo), Err(Error::ToolOutput(..))));
        assert!(matches!(
            host_memory_mib(&dir.as_path().join("missing")),
            Err(Error::Io { .. })
        ));
    }

    #[test]
    fn test_parse_kernel_args() {
        let args = parse_kernel_args("ro quiet isolcpus=2-3 root=UUID=4c1e=x");
        assert_eq!(args["ro"], "");
        assert_eq!(args["isolcpus"], "2-3");
        assert_eq!(args["root"], "UUID=4c1e=x");
    }

    #[test]
    fn test_extract_args_line() {
        let out = "index=0\nkernel=\"/boot/vmlinuz-6.8.0\"\nargs=\"ro quiet isolcpus=1\"\nroot=\"UUID=4c1e\"\n";
        assert_eq!(extract_args_line(out).unwrap(), "ro quiet isolcpus=1");
        assert!(extract_args_line("index=0\n").is_none());
    }

    #[test]
    fn test_isolation_args_normalization() {
        let args = parse_kernel_args("isolcpus=domain,managed_irq,3,1-2 rcu_nocbs=1-3");
        let parsed = IsolationArgs::from_args(&args).unwrap();
        assert_eq!(parsed.cpus.to_string(), "1-3");
        assert_eq!(parsed.canonical(), vec!["1-3", "", "1-3"]);
        assert!(parsed.is_set());

        // Fallback to nohz_full when isolcpus is absent.
        let parsed = IsolationArgs::from_args(&parse_kernel_args("nohz_full=4,5")).unwrap();
        assert_eq!(parsed.cpus.to_string(), "4-5");

        assert!(matches!(
            IsolationArgs::from_args(&parse_kernel_args("isolcpus=domain")),
            Err(Error::Validation(_))
        ));
        assert!(!IsolationArgs::from_args(&parse_kernel_args("ro"))
            .unwrap()
            .is_set());
    }

    #[test]
    fn test_set_core_isolation() {
        let h = host(BASE, BASE, true);
        let topology = ht_topology();
        let selection = [IsolationSelection {
            socket: 0,
            cores: vec![2, 3],
        }];

        let state = h.tuning.set_core_isolation(&selection, &topology).unwrap();
        assert_eq!(
            *h.calls.lock().unwrap(),
            vec![
                "remove isolcpus nohz_full rcu_nocbs".to_owned(),
                "add isolcpus=2-3,6-7 nohz_full=2-3,6-7 rcu_nocbs=2-3,6-7".to_owned(),
            ]
        );
        assert!(state.enabled);
        assert!(state.reboot_required);
        assert_eq!(
            state.message.as_deref(),
            Some("host core isolation updated (reboot required)")
        );
        assert_eq!(state.configured.cpus.to_string(), "2-3,6-7");
        assert_eq!(state.configured.sockets[0].isolated_core_indices, vec![2, 3]);
        assert!(state.active.cpus.is_empty());
        assert_eq!(h.notifier.events().len(), 1);
    }

    #[test]
    fn test_set_core_isolation_rejects_before_writing() {
        let h = host(BASE, BASE, true);
        let selection = [IsolationSelection {
            socket: 0,
            cores: vec![0, 1, 2],
        }];
        assert!(matches!(
            h.tuning.set_core_isolation(&selection, &ht_topology()),
            Err(Error::Validation(_))
        ));
        assert!(h.calls.lock().unwrap().is_empty());

        let h = host(BASE, BASE, false);
        let selection = [IsolationSelection {
            socket: 0,
            cores: vec![0],
        }];
        assert!(matches!(
            h.tuning.set_core_isolation(&selection, &ht_topology()),
            Err(Error::ToolMissing(_))
        ));
        assert!(h.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_core_isolation_in_sync() {
        let args = format!("{BASE} isolcpus=1,5 nohz_full=1,5 rcu_nocbs=1,5");
        let booted = format!("{BASE} isolcpus=managed_irq,5,1 nohz_full=1,5 rcu_nocbs=1,5");
        let h = host(&args, &booted, true);
        let state = h.tuning.get_core_isolation(&ht_topology()).unwrap();
        assert!(state.enabled);
        assert!(!state.reboot_required);
        assert_eq!(state.active.sockets[0].isolated_core_indices, vec![1]);

        let state = h.tuning.remove_core_isolation(&ht_topology()).unwrap();
        assert!(!state.enabled);
        assert!(state.reboot_required);
        assert_eq!(
            state.message.as_deref(),
            Some("host core isolation removed (reboot required)")
        );
    }

    #[test]
    fn test_hugepages() {
        let h = host(BASE, BASE, true);
        let state = h.tuning.get_hugepages().unwrap();
        assert!(!state.enabled);
        assert!(!state.reboot_required);
        // Booted values come from meminfo.
        assert_eq!(state.active.page_size.as_deref(), Some("2M"));
        assert_eq!(state.active.page_count, Some(0));

        let spec = HugePagesSpec {
            page_size: "1048576 kB".to_owned(),
            count: 16,
        };
        let state = h.tuning.set_hugepages(&spec).unwrap();
        assert_eq!(
            h.calls.lock().unwrap().last().unwrap(),
            "add default_hugepagesz=1G hugepagesz=1G hugepages=16"
        );
        assert!(state.enabled && state.reboot_required);
        assert_eq!(state.configured.page_size.as_deref(), Some("1G"));
        assert_eq!(state.configured.page_count, Some(16));
    }

    #[test]
    fn test_hugepages_canonical_comparison() {
        let h = host(
            &format!("{BASE} default_hugepagesz=2M hugepagesz=2M hugepages=512"),
            &format!("{BASE} default_hugepagesz=2048K hugepagesz=2048k hugepages=0512"),
            true,
        );
        let state = h.tuning.get_hugepages().unwrap();
        assert!(state.enabled);
        assert!(!state.reboot_required);
        assert_eq!(state.active.page_count, Some(512));

        let state = h.tuning.remove_hugepages().unwrap();
        assert!(!state.enabled);
        assert_eq!(
            state.message.as_deref(),
            Some("host hugepages removed (reboot required)")
        );
    }

    #[test]
    fn test_hugepages_validation() {
        let h = host(BASE, BASE, true);
        for (size, count) in [("2T", 4), ("0M", 4), ("2048", 4), ("2M", 0)] {
            let spec = HugePagesSpec {
                page_size: size.to_owned(),
                count,
            };
            assert!(
                matches!(h.tuning.set_hugepages(&spec), Err(Error::Validation(_))),
                "{size} {count}"
            );
        }
        assert!(h.calls.lock().unwrap().is_empty());
    }
}
