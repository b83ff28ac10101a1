// Copyright © 2024 The vmhost Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Hardware description of a new workload.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::disk::DiskFormat;
use crate::domain_xml::{escape, Document};
use crate::pinning::{apply_pins, PinningRequest, VcpuPin};
use crate::{Error, Result};

pub const DEFAULT_CPU_MODEL: &str = "Westmere";
pub const DEFAULT_LISTEN: &str = "127.0.0.1";
pub const DEFAULT_NETWORK: &str = "default";
pub const DEFAULT_MACHINE: &str = "q35";

/// Features disabled on custom CPU models so the guest can move between
/// hosts of different generations.
const PORTABLE_DISABLED_FEATURES: &[&str] = &[
    "vmx", "svm", "hle", "rtm", "invpcid", "umip", "ibrs", "ssbd", "stibp", "amd-stibp",
    "amd-ssbd", "md-clear", "spec-ctrl", "flush-l1d", "pdcm", "pcid", "ss", "erms",
];

const VNC_PASSWORD_SYMBOLS: &str = "!@#$%^&*()_+-[]{}|;:'\"<>?/~";

/// CPU model exposed to a guest.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum CpuMode {
    #[default]
    HostPassthrough,
    HostModel,
    /// Named model with extra disabled features on top of the portable set.
    Custom {
        model: Option<String>,
        disabled: Vec<String>,
    },
    /// A `<cpu>` element captured from an existing definition.
    Raw(String),
}

impl CpuMode {
    /// `<cpu>` element text for this mode.
    pub fn to_xml(&self) -> Result<String> {
        match self {
            CpuMode::HostPassthrough => {
                Ok("<cpu mode='host-passthrough' check='none' migratable='on'/>".to_owned())
            }
            CpuMode::HostModel => Ok("<cpu mode='host-model' check='partial'/>".to_owned()),
            CpuMode::Custom { model, disabled } => {
                Ok(build_custom_cpu_xml(model.as_deref(), disabled))
            }
            CpuMode::Raw(xml) => {
                Document::parse_rooted(xml, "cpu")?;
                Ok(xml.trim().to_owned())
            }
        }
    }
}

/// `<cpu mode='custom'>` for `model` (default `Westmere`), disabling the
/// portable feature set plus `disabled`, sorted and without duplicates.
pub fn build_custom_cpu_xml(model: Option<&str>, disabled: &[String]) -> String {
    let model = model
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .unwrap_or(DEFAULT_CPU_MODEL);
    let features: BTreeSet<&str> = disabled
        .iter()
        .map(|f| f.trim())
        .chain(PORTABLE_DISABLED_FEATURES.iter().copied())
        .filter(|f| !f.is_empty())
        .collect();

    let mut out = String::from("<cpu mode='custom' match='minimum' check='partial'>\n");
    out.push_str(&format!(
        "    <model fallback='forbid'>{}</model>\n",
        escape(model, '\'')
    ));
    for feature in features {
        out.push_str(&format!(
            "    <feature policy='disable' name='{}'/>\n",
            escape(feature, '\'')
        ));
    }
    out.push_str("  </cpu>");
    out
}

/// Password accepted for the VNC console.
pub fn validate_vnc_password(password: &str) -> Result<()> {
    if password.is_empty() {
        return Err(Error::Validation("VNC password must not be empty".to_owned()));
    }
    match password
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && !VNC_PASSWORD_SYMBOLS.contains(*c))
    {
        Some(c) => Err(Error::Validation(format!(
            "VNC password contains unsupported character {c:?}"
        ))),
        None => Ok(()),
    }
}

/// Names end up in file paths and must stay within one directory.
pub fn validate_vm_name(name: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        || name.starts_with('.')
    {
        return Err(Error::Validation(format!("invalid vm name {name:?}")));
    }
    Ok(())
}

/// Everything needed to create a workload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmSpec {
    pub name: String,
    pub memory_mib: u64,
    /// Ignored when `pinning` is set: one vCPU per pinned core.
    pub vcpus: u32,
    /// Defaults to `disks/<name>/<name>.<format>` under the storage root.
    pub disk: Option<PathBuf>,
    /// Size of the image to create when the disk does not exist yet.
    pub disk_size_gib: u64,
    /// Skip probing an existing image.
    pub disk_format: Option<DiskFormat>,
    pub iso: Option<String>,
    pub network: String,
    pub listen: String,
    pub vnc_password: Option<String>,
    pub cpu: CpuMode,
    pub machine: String,
    pub pinning: Option<PinningRequest>,
}

impl VmSpec {
    pub fn new(name: &str, memory_mib: u64, vcpus: u32) -> Self {
        VmSpec {
            name: name.to_owned(),
            memory_mib,
            vcpus,
            disk: None,
            disk_size_gib: 0,
            disk_format: None,
            iso: None,
            network: DEFAULT_NETWORK.to_owned(),
            listen: DEFAULT_LISTEN.to_owned(),
            vnc_password: None,
            cpu: CpuMode::default(),
            machine: DEFAULT_MACHINE.to_owned(),
            pinning: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_vm_name(&self.name)?;
        if self.memory_mib == 0 {
            return Err(Error::Validation("memory must be > 0".to_owned()));
        }
        if self.vcpus == 0 && self.pinning.is_none() {
            return Err(Error::Validation("vcpus must be > 0".to_owned()));
        }
        if self.network.trim().is_empty() {
            return Err(Error::Validation("network is required".to_owned()));
        }
        if self.listen.trim().is_empty() {
            return Err(Error::Validation("graphics listen address is required".to_owned()));
        }
        if let Some(password) = &self.vnc_password {
            validate_vnc_password(password)?;
        }
        Ok(())
    }
}

/// Render the definition of `spec` with its disk at `disk`.
///
/// When `pins` is not empty it drives the vCPU count, `<cputune>` and the
/// CPU topology.
pub fn build_domain_xml(
    spec: &VmSpec,
    disk: &Path,
    format: &DiskFormat,
    iso: Option<&Path>,
    pins: &[VcpuPin],
) -> Result<String> {
    let attr = |v: &str| escape(v, '\'');
    let disk_path = disk.to_string_lossy();
    let listen = attr(spec.listen.trim());
    let passwd = spec
        .vnc_password
        .as_deref()
        .map(|p| format!(" passwd='{}'", attr(p)))
        .unwrap_or_default();

    let (cdrom, boot) = match iso {
        Some(iso) => (
            format!(
                "
    <disk type='file' device='cdrom'>
      <driver name='qemu' type='raw'/>
      <source file='{}'/>
      <target dev='sda' bus='sata'/>
      <readonly/>
    </disk>",
                attr(&iso.to_string_lossy())
            ),
            "\n    <boot dev='cdrom'/>",
        ),
        None => (String::new(), ""),
    };

    let xml = format!(
        "<domain type='kvm'>
  <name>{name}</name>
  <memory unit='MiB'>{memory}</memory>
  <currentMemory unit='MiB'>{memory}</currentMemory>
  <vcpu placement='static'>{vcpus}</vcpu>
  <iothreads>1</iothreads>
  <os>
    <type arch='x86_64' machine='{machine}'>hvm</type>{boot}
    <boot dev='hd'/>
  </os>
  <features>
    <acpi/>
    <apic/>
  </features>
  {cpu}
  <clock offset='utc'/>
  <on_poweroff>destroy</on_poweroff>
  <on_reboot>restart</on_reboot>
  <on_crash>destroy</on_crash>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='{format}' cache='none' io='native'/>
      <source file='{disk}'/>
      <target dev='vda' bus='virtio'/>
    </disk>{cdrom}
    <interface type='network'>
      <source network='{network}'/>
      <model type='virtio'/>
    </interface>
    <graphics type='vnc' port='-1' autoport='yes' listen='{listen}'{passwd}>
      <listen type='address' address='{listen}'/>
    </graphics>
    <video>
      <model type='virtio'/>
    </video>
    <memballoon model='virtio'>
      <stats period='10'/>
    </memballoon>
  </devices>
  <seclabel type='none'/>
</domain>
",
        name = attr(&spec.name),
        memory = spec.memory_mib,
        vcpus = spec.vcpus,
        machine = attr(&spec.machine),
        cpu = spec.cpu.to_xml()?,
        format = attr(format.as_str()),
        disk = attr(&disk_path),
        network = attr(spec.network.trim()),
    );

    let mut doc = Document::parse_rooted(&xml, "domain")?;
    if !pins.is_empty() {
        apply_pins(doc.root_mut(), pins)?;
    }
    Ok(doc.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_backing::{self, MemoryBalloon};
    use crate::pinning::{build_vcpu_pins, read_pins};
    use crate::topology::tests::ht_topology;

    fn spec() -> VmSpec {
        let mut spec = VmSpec::new("web", 4096, 2);
        spec.vnc_password = Some("s3cret!".to_owned());
        spec
    }

    fn build(spec: &VmSpec, iso: Option<&Path>, pins: &[VcpuPin]) -> Document {
        let xml = build_domain_xml(
            spec,
            Path::new("/var/lib/vmhost/disks/web/web.qcow2"),
            &DiskFormat::Qcow2,
            iso,
            pins,
        )
        .unwrap();
        Document::parse(&xml).unwrap()
    }

    #[test]
    fn test_custom_cpu_xml() {
        let xml = build_custom_cpu_xml(None, &[]);
        let cpu = Document::parse(&xml).unwrap();
        let root = cpu.root();
        assert_eq!(root.attr("mode").as_deref(), Some("custom"));
        assert_eq!(root.child("model").unwrap().text(), "Westmere");
        assert_eq!(
            root.children_named("feature").count(),
            PORTABLE_DISABLED_FEATURES.len()
        );

        let xml = build_custom_cpu_xml(
            Some("Haswell"),
            &["avx512f".to_owned(), "vmx".to_owned(), " ".to_owned()],
        );
        let cpu = Document::parse(&xml).unwrap();
        let features: Vec<String> = cpu
            .root()
            .children_named("feature")
            .filter_map(|f| f.attr("name"))
            .collect();
        assert_eq!(features.len(), PORTABLE_DISABLED_FEATURES.len() + 1);
        assert_eq!(features[0], "amd-ssbd");
        assert!(features.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(cpu.root().child("model").unwrap().text(), "Haswell");
    }

    #[test]
    fn test_cpu_modes() {
        assert!(CpuMode::HostPassthrough
            .to_xml()
            .unwrap()
            .contains("host-passthrough"));
        let raw = CpuMode::Raw("<cpu mode='host-model'><model>EPYC</model></cpu>".to_owned());
        assert_eq!(raw.to_xml().unwrap(), "<cpu mode='host-model'><model>EPYC</model></cpu>");
        assert!(matches!(
            CpuMode::Raw("<vcpu>2</vcpu>".to_owned()).to_xml(),
            Err(Error::Description(_))
        ));
    }

    #[test]
    fn test_vnc_password_validation() {
        assert!(validate_vnc_password("abcXYZ019!@#").is_ok());
        assert!(validate_vnc_password("p'a\"s<s>").is_ok());
        assert!(matches!(validate_vnc_password(""), Err(Error::Validation(_))));
        assert!(matches!(
            validate_vnc_password("with space"),
            Err(Error::Validation(_))
        ));
        assert!(matches!(validate_vnc_password("pässword"), Err(Error::Validation(_))));
    }

    #[test]
    fn test_spec_validation() {
        assert!(spec().validate().is_ok());
        for name in ["", "../etc", "a/b", ".hidden", "two words"] {
            let mut s = spec();
            s.name = name.to_owned();
            assert!(matches!(s.validate(), Err(Error::Validation(_))), "{name}");
        }
        let mut s = spec();
        s.memory_mib = 0;
        assert!(s.validate().is_err());
        let mut s = spec();
        s.vcpus = 0;
        assert!(s.validate().is_err());
        s.pinning = Some(PinningRequest {
            socket: 0,
            start: 0,
            end: 1,
            hyperthreading: false,
        });
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_domain_xml() {
        let doc = build(&spec(), Some(Path::new("/var/lib/vmhost/isos/debian-12.iso")), &[]);
        let root = doc.root();
        assert_eq!(root.child("name").unwrap().text(), "web");
        assert_eq!(root.child("vcpu").unwrap().text(), "2");
        assert_eq!(root.find("os/type").unwrap().attr("machine").as_deref(), Some("q35"));
        let boots: Vec<String> = root
            .child("os")
            .unwrap()
            .children_named("boot")
            .filter_map(|b| b.attr("dev"))
            .collect();
        assert_eq!(boots, vec!["cdrom", "hd"]);

        let devices = root.child("devices").unwrap();
        let disks: Vec<_> = devices.children_named("disk").collect();
        assert_eq!(disks.len(), 2);
        assert_eq!(
            disks[0].child("source").unwrap().attr("file").as_deref(),
            Some("/var/lib/vmhost/disks/web/web.qcow2")
        );
        assert!(disks[1].child("readonly").is_some());

        let graphics = devices.child("graphics").unwrap();
        assert_eq!(graphics.attr("passwd").as_deref(), Some("s3cret!"));
        assert_eq!(graphics.attr("listen").as_deref(), Some("127.0.0.1"));

        // The balloon written at creation is already the canonical one.
        let xml = doc.to_string();
        assert_eq!(memory_backing::rewrite::<MemoryBalloon>(&xml, true).unwrap().0, xml);
    }

    #[test]
    fn test_domain_xml_escaping() {
        let mut s = spec();
        s.vnc_password = Some("a'b<c".to_owned());
        let doc = build(&s, None, &[]);
        let graphics = doc.root().find("devices/graphics").unwrap();
        assert_eq!(graphics.attr("passwd").as_deref(), Some("a'b<c"));
        assert!(doc.root().child("os").unwrap().children_named("boot").count() == 1);
    }

    #[test]
    fn test_domain_xml_with_pins() {
        let mut s = spec();
        s.cpu = CpuMode::Custom {
            model: None,
            disabled: vec![],
        };
        let request = PinningRequest {
            socket: 0,
            start: 1,
            end: 3,
            hyperthreading: true,
        };
        let pins = build_vcpu_pins(&request, &ht_topology()).unwrap();
        let doc = build(&s, None, &pins);
        let root = doc.root();

        assert_eq!(root.child("vcpu").unwrap().text(), "3");
        assert_eq!(read_pins(root).unwrap(), pins);
        let cpu = root.child("cpu").unwrap();
        assert_eq!(cpu.attr("mode").as_deref(), Some("custom"));
        assert_eq!(
            cpu.child("topology").unwrap().attr("cores").as_deref(),
            Some("3")
        );
    }
}
