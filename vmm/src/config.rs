// Copyright © 2024 The vmhost Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hypervisor::Hypervisor;
use option_parser::{OptionParser, OptionParserError, StringList, Toggle, Tuple};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::builder::CpuMode;
use crate::command::CommandRunner;
use crate::disk::DiskFormat;
use crate::host_tuning::HugePagesSpec;
use crate::isolation::IsolationSelection;
use crate::pinning::PinningRequest;

pub const DEFAULT_URI: &str = "qemu:///system";
pub const DEFAULT_STORAGE_ROOT: &str = "/var/lib/vmhost";

/// Errors associated with host configuration and command line options.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Error reading configuration file {0:?}: {1}")]
    ReadConfig(PathBuf, #[source] io::Error),
    #[error("Error parsing configuration file {0:?}: {1}")]
    ParseConfig(PathBuf, #[source] serde_json::Error),
    #[error("Error parsing pinning parameters: {0}")]
    ParsePinning(#[source] OptionParserError),
    #[error("Error parsing pinning parameters: {0} is required")]
    ParsePinningMissing(&'static str),
    #[error("Error parsing isolation parameters: {0}")]
    ParseIsolation(#[source] OptionParserError),
    #[error("Error parsing isolation parameters: cores is required")]
    ParseIsolationMissing,
    #[error("Error parsing huge page parameters: {0}")]
    ParseHugePages(#[source] OptionParserError),
    #[error("Error parsing huge page parameters: {0} is required")]
    ParseHugePagesMissing(&'static str),
    #[error("Error parsing cpu parameters: {0}")]
    ParseCpuMode(#[source] OptionParserError),
    #[error("Error parsing cpu parameters: unknown mode {0}")]
    InvalidCpuMode(String),
}

pub type Result<T> = std::result::Result<T, Error>;

pub fn default_uri() -> String {
    DEFAULT_URI.to_owned()
}

fn default_virsh() -> String {
    "virsh".to_owned()
}

fn default_bootloader() -> String {
    "grubby".to_owned()
}

fn default_qemu_img() -> String {
    "qemu-img".to_owned()
}

fn default_systemctl() -> String {
    "systemctl".to_owned()
}

fn default_tuned_adm() -> String {
    "tuned-adm".to_owned()
}

fn default_storage_root() -> PathBuf {
    PathBuf::from(DEFAULT_STORAGE_ROOT)
}

fn default_cpu_sysfs() -> PathBuf {
    PathBuf::from("/sys/devices/system/cpu")
}

fn default_cmdline() -> PathBuf {
    PathBuf::from("/proc/cmdline")
}

fn default_meminfo() -> PathBuf {
    PathBuf::from("/proc/meminfo")
}

fn default_progress_interval_ms() -> u64 {
    1000
}

fn default_shutdown_timeout_s() -> u64 {
    120
}

fn default_shutdown_poll_ms() -> u64 {
    300
}

fn default_command_timeout_s() -> u64 {
    60
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_progress_interval_ms")]
    pub migration_progress_ms: u64,
    #[serde(default = "default_shutdown_timeout_s")]
    pub shutdown_s: u64,
    #[serde(default = "default_shutdown_poll_ms")]
    pub shutdown_poll_ms: u64,
    #[serde(default = "default_command_timeout_s")]
    pub command_s: u64,
}

impl TimeoutsConfig {
    pub fn migration_progress(&self) -> Duration {
        Duration::from_millis(self.migration_progress_ms)
    }

    pub fn shutdown(&self) -> Duration {
        Duration::from_secs(self.shutdown_s)
    }

    pub fn shutdown_poll(&self) -> Duration {
        Duration::from_millis(self.shutdown_poll_ms)
    }

    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command_s)
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        TimeoutsConfig {
            migration_progress_ms: default_progress_interval_ms(),
            shutdown_s: default_shutdown_timeout_s(),
            shutdown_poll_ms: default_shutdown_poll_ms(),
            command_s: default_command_timeout_s(),
        }
    }
}

/// Agent wide settings. Every field has a default so a partial file is valid.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct HostConfig {
    #[serde(default = "default_uri")]
    pub uri: String,
    #[serde(default = "default_virsh")]
    pub virsh: String,
    #[serde(default = "default_bootloader")]
    pub bootloader: String,
    #[serde(default = "default_qemu_img")]
    pub qemu_img: String,
    #[serde(default = "default_systemctl")]
    pub systemctl: String,
    #[serde(default = "default_tuned_adm")]
    pub tuned_adm: String,
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,
    #[serde(default = "default_cpu_sysfs")]
    pub cpu_sysfs: PathBuf,
    #[serde(default = "default_cmdline")]
    pub cmdline: PathBuf,
    #[serde(default = "default_meminfo")]
    pub meminfo: PathBuf,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            uri: default_uri(),
            virsh: default_virsh(),
            bootloader: default_bootloader(),
            qemu_img: default_qemu_img(),
            systemctl: default_systemctl(),
            tuned_adm: default_tuned_adm(),
            storage_root: default_storage_root(),
            cpu_sysfs: default_cpu_sysfs(),
            cmdline: default_cmdline(),
            meminfo: default_meminfo(),
            timeouts: TimeoutsConfig::default(),
        }
    }
}

impl HostConfig {
    /// Read a JSON configuration file, or use the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(HostConfig::default());
        };
        let content =
            fs::read_to_string(path).map_err(|e| Error::ReadConfig(path.to_path_buf(), e))?;
        serde_json::from_str(&content).map_err(|e| Error::ParseConfig(path.to_path_buf(), e))
    }

    pub fn layout(&self) -> StorageLayout {
        StorageLayout::new(&self.storage_root)
    }

    pub fn command_runner(&self) -> CommandRunner {
        CommandRunner::new(self.timeouts.command())
    }

    /// Control-plane handle for `uri`, sharing the command timeout.
    pub fn hypervisor(&self, uri: &str) -> Arc<dyn Hypervisor> {
        hypervisor::new(&self.virsh, uri, self.timeouts.command())
    }
}

/// Paths of everything the agent keeps under its storage root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: &Path) -> Self {
        StorageLayout {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn disks_dir(&self) -> PathBuf {
        self.root.join("disks")
    }

    pub fn isos_dir(&self) -> PathBuf {
        self.root.join("isos")
    }

    pub fn xml_dir(&self) -> PathBuf {
        self.root.join("xml")
    }

    /// Directory holding the disks of one workload.
    pub fn vm_disk_dir(&self, name: &str) -> PathBuf {
        self.disks_dir().join(name)
    }

    pub fn disk_path(&self, name: &str, format: &DiskFormat) -> PathBuf {
        self.vm_disk_dir(name).join(format!("{name}.{format}"))
    }

    pub fn xml_path(&self, name: &str) -> PathBuf {
        self.xml_dir().join(format!("{name}.xml"))
    }

    /// Bare file names resolve under `isos/`, paths are kept as given.
    pub fn iso_path(&self, iso: &str) -> PathBuf {
        if iso.contains('/') {
            PathBuf::from(iso)
        } else {
            self.isos_dir().join(iso)
        }
    }
}

impl PinningRequest {
    pub const SYNTAX: &'static str = "Pinning parameters \
        \"socket=<socket_id>,start=<first_core_index>,end=<last_core_index>,ht=on|off\"";

    pub fn parse(pinning: &str) -> Result<Self> {
        let mut parser = OptionParser::new();
        parser.add("socket").add("start").add("end").add("ht");
        parser.parse(pinning).map_err(Error::ParsePinning)?;

        let socket: u32 = parser
            .convert("socket")
            .map_err(Error::ParsePinning)?
            .unwrap_or(0);
        let start: usize = parser
            .convert("start")
            .map_err(Error::ParsePinning)?
            .ok_or(Error::ParsePinningMissing("start"))?;
        let end: usize = parser
            .convert("end")
            .map_err(Error::ParsePinning)?
            .unwrap_or(start);
        let hyperthreading = parser
            .convert::<Toggle>("ht")
            .map_err(Error::ParsePinning)?
            .unwrap_or(Toggle(false))
            .0;

        Ok(PinningRequest {
            socket,
            start,
            end,
            hyperthreading,
        })
    }
}

impl IsolationSelection {
    pub const SYNTAX: &'static str =
        "Isolation parameters \"cores=[<socket_id>@[<core_indices>],...]\"";

    pub fn parse_list(isolation: &str) -> Result<Vec<Self>> {
        let mut parser = OptionParser::new();
        parser.add("cores");
        parser.parse(isolation).map_err(Error::ParseIsolation)?;

        let cores = parser
            .convert::<Tuple<u32, Vec<usize>>>("cores")
            .map_err(Error::ParseIsolation)?
            .ok_or(Error::ParseIsolationMissing)?;

        Ok(cores
            .0
            .into_iter()
            .map(|(socket, cores)| IsolationSelection { socket, cores })
            .collect())
    }
}

impl HugePagesSpec {
    pub const SYNTAX: &'static str = "Huge page parameters \"size=<2M|1G|...>,count=<pages>\"";

    pub fn parse(hugepages: &str) -> Result<Self> {
        let mut parser = OptionParser::new();
        parser.add("size").add("count");
        parser.parse(hugepages).map_err(Error::ParseHugePages)?;

        let page_size = parser
            .get("size")
            .ok_or(Error::ParseHugePagesMissing("size"))?;
        let count: u64 = parser
            .convert("count")
            .map_err(Error::ParseHugePages)?
            .ok_or(Error::ParseHugePagesMissing("count"))?;

        Ok(HugePagesSpec { page_size, count })
    }
}

impl CpuMode {
    pub const SYNTAX: &'static str = "CPU parameters \
        \"mode=host-passthrough|host-model|custom,model=<cpu_model>,disable=[<feature>,...]\"";

    pub fn parse(cpu: &str) -> Result<Self> {
        let mut parser = OptionParser::new();
        parser.add("mode").add("model").add("disable");
        parser.parse(cpu).map_err(Error::ParseCpuMode)?;

        let model = parser.get("model");
        let disabled = parser
            .convert::<StringList>("disable")
            .map_err(Error::ParseCpuMode)?
            .map(|l| l.0)
            .unwrap_or_default();

        match parser.get("mode").as_deref() {
            None | Some("host-passthrough") | Some("passthrough") => Ok(CpuMode::HostPassthrough),
            Some("host-model") => Ok(CpuMode::HostModel),
            Some("custom") => Ok(CpuMode::Custom { model, disabled }),
            Some(other) => Err(Error::InvalidCpuMode(other.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use vmm_sys_util::tempfile::TempFile;

    use super::*;

    #[test]
    fn test_load_defaults() {
        let config = HostConfig::load(None).unwrap();
        assert_eq!(config.uri, "qemu:///system");
        assert_eq!(config.bootloader, "grubby");
        assert_eq!(config.timeouts.shutdown(), Duration::from_secs(120));
        assert_eq!(config.timeouts.shutdown_poll(), Duration::from_millis(300));
        assert_eq!(config.timeouts.migration_progress(), Duration::from_secs(1));
    }

    #[test]
    fn test_load_partial_file() {
        let tmp = TempFile::new().unwrap();
        fs::write(
            tmp.as_path(),
            r#"{"uri": "qemu+ssh://node2/system", "storage_root": "/srv/vmhost", "timeouts": {"shutdown_s": 30}}"#,
        )
        .unwrap();

        let config = HostConfig::load(Some(tmp.as_path())).unwrap();
        assert_eq!(config.uri, "qemu+ssh://node2/system");
        assert_eq!(config.virsh, "virsh");
        assert_eq!(config.tuned_adm, "tuned-adm");
        assert_eq!(config.systemctl, "systemctl");
        assert_eq!(config.timeouts.shutdown_s, 30);
        assert_eq!(config.timeouts.command_s, 60);
        assert_eq!(config.layout().xml_path("web"), Path::new("/srv/vmhost/xml/web.xml"));

        fs::write(tmp.as_path(), "{ not json").unwrap();
        assert!(matches!(
            HostConfig::load(Some(tmp.as_path())),
            Err(Error::ParseConfig(..))
        ));
        assert!(matches!(
            HostConfig::load(Some(Path::new("/nonexistent/vmhost.json"))),
            Err(Error::ReadConfig(..))
        ));
    }

    #[test]
    fn test_storage_layout() {
        let layout = StorageLayout::new(Path::new("/var/lib/vmhost"));
        assert_eq!(
            layout.disk_path("web", &DiskFormat::Qcow2),
            Path::new("/var/lib/vmhost/disks/web/web.qcow2")
        );
        assert_eq!(layout.vm_disk_dir("web"), Path::new("/var/lib/vmhost/disks/web"));
        assert_eq!(
            layout.iso_path("debian-12.iso"),
            Path::new("/var/lib/vmhost/isos/debian-12.iso")
        );
        assert_eq!(
            layout.iso_path("/mnt/media/debian-12.iso"),
            Path::new("/mnt/media/debian-12.iso")
        );
    }

    #[test]
    fn test_pinning_parsing() {
        assert_eq!(
            PinningRequest::parse("socket=1,start=2,end=5,ht=on").unwrap(),
            PinningRequest {
                socket: 1,
                start: 2,
                end: 5,
                hyperthreading: true
            }
        );
        assert_eq!(
            PinningRequest::parse("start=3").unwrap(),
            PinningRequest {
                socket: 0,
                start: 3,
                end: 3,
                hyperthreading: false
            }
        );
        assert!(matches!(
            PinningRequest::parse("socket=0,end=3"),
            Err(Error::ParsePinningMissing("start"))
        ));
        assert!(matches!(
            PinningRequest::parse("start=x"),
            Err(Error::ParsePinning(_))
        ));
        assert!(PinningRequest::parse("start=0,cores=4").is_err());
    }

    #[test]
    fn test_isolation_parsing() {
        assert_eq!(
            IsolationSelection::parse_list("cores=[0@[0,1],1@[2-3]]").unwrap(),
            vec![
                IsolationSelection {
                    socket: 0,
                    cores: vec![0, 1]
                },
                IsolationSelection {
                    socket: 1,
                    cores: vec![2, 3]
                },
            ]
        );
        assert!(matches!(
            IsolationSelection::parse_list(""),
            Err(Error::ParseIsolationMissing)
        ));
    }

    #[test]
    fn test_hugepages_parsing() {
        assert_eq!(
            HugePagesSpec::parse("size=1G,count=16").unwrap(),
            HugePagesSpec {
                page_size: "1G".to_owned(),
                count: 16
            }
        );
        assert!(matches!(
            HugePagesSpec::parse("count=16"),
            Err(Error::ParseHugePagesMissing("size"))
        ));
    }

    #[test]
    fn test_cpu_mode_parsing() {
        assert_eq!(CpuMode::parse("").unwrap(), CpuMode::HostPassthrough);
        assert_eq!(CpuMode::parse("mode=host-model").unwrap(), CpuMode::HostModel);
        assert_eq!(
            CpuMode::parse("mode=custom,model=Haswell,disable=[avx512f,tsx-ctrl]").unwrap(),
            CpuMode::Custom {
                model: Some("Haswell".to_owned()),
                disabled: vec!["avx512f".to_owned(), "tsx-ctrl".to_owned()],
            }
        );
        assert!(matches!(
            CpuMode::parse("mode=emulated"),
            Err(Error::InvalidCpuMode(_))
        ));
    }
}
