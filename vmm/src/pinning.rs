// Copyright © 2024 The vmhost Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! vCPU pinning plans and their `<cputune>` rendering.

use option_parser::CpuList;
use serde::{Deserialize, Serialize};

use crate::domain_xml::{self, Document, Element};
use crate::topology::{PhysicalCore, Topology};
use crate::{Error, Result};

/// Pin a workload to physical cores `start..=end` of one socket.
///
/// Core indices count physical cores within the socket, from 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinningRequest {
    pub socket: u32,
    pub start: usize,
    pub end: usize,
    #[serde(default)]
    pub hyperthreading: bool,
}

/// Logical CPUs one vCPU may run on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcpuPin {
    pub vcpu: u32,
    pub cpuset: Vec<u32>,
}

fn selected_cores(request: &PinningRequest, topology: &Topology) -> Result<Vec<PhysicalCore>> {
    let socket = topology
        .socket(request.socket)
        .ok_or_else(|| Error::NotFound(format!("socket {}", request.socket)))?;

    if request.end < request.start {
        return Err(Error::Validation(format!(
            "core range end {} is before start {}",
            request.end, request.start
        )));
    }

    let cores = socket.physical_cores();
    if request.end >= cores.len() {
        return Err(Error::Validation(format!(
            "core range {}-{} exceeds socket {} which has {} physical cores (valid: 0..{})",
            request.start,
            request.end,
            request.socket,
            cores.len(),
            cores.len().saturating_sub(1)
        )));
    }

    Ok(cores[request.start..=request.end].to_vec())
}

pub fn validate_pinning(request: &PinningRequest, topology: &Topology) -> Result<()> {
    selected_cores(request, topology).map(|_| ())
}

/// One pin per selected physical core, vCPUs numbered from 0 in core order.
///
/// Without hyperthreading a vCPU gets the core's lowest sibling; with it,
/// the whole sibling set.
pub fn build_vcpu_pins(request: &PinningRequest, topology: &Topology) -> Result<Vec<VcpuPin>> {
    let pins = selected_cores(request, topology)?
        .into_iter()
        .enumerate()
        .map(|(vcpu, core)| VcpuPin {
            vcpu: vcpu as u32,
            cpuset: if request.hyperthreading {
                core.siblings
            } else {
                vec![core.id]
            },
        })
        .collect();
    Ok(pins)
}

fn pinned_cpus(pins: &[VcpuPin]) -> CpuList {
    CpuList::new(pins.iter().flat_map(|p| p.cpuset.iter().copied()).collect())
}

fn render_cputune(pins: &[VcpuPin], indent: &str) -> String {
    let mut out = String::from("<cputune>\n");
    for pin in pins {
        out.push_str(&format!(
            "{indent}  <vcpupin vcpu='{}' cpuset='{}'/>\n",
            pin.vcpu,
            CpuList::new(pin.cpuset.clone())
        ));
    }
    out.push_str(&format!(
        "{indent}  <emulatorpin cpuset='{}'/>\n{indent}</cputune>",
        pinned_cpus(pins)
    ));
    out
}

/// Render pins as a `<cputune>` block, one `vcpupin` per pin in order,
/// followed by an `emulatorpin` over every pinned CPU.
pub fn build_cputune_description(pins: &[VcpuPin]) -> String {
    render_cputune(pins, "")
}

pub(crate) fn set_topology(cpu: &mut Element, cores: usize) {
    let cores = cores.to_string();
    match cpu.child_mut("topology") {
        Some(topology) => {
            topology.set_attr("sockets", "1");
            topology.set_attr("cores", &cores);
            topology.set_attr("threads", "1");
        }
        None => cpu.push(
            Element::new("topology")
                .with_attr("sockets", "1")
                .with_attr("cores", &cores)
                .with_attr("threads", "1"),
        ),
    }
}

/// Rewrite `<vcpu>`, `<cputune>` and the CPU topology of a domain for `pins`.
pub fn apply_pins(domain: &mut Element, pins: &[VcpuPin]) -> domain_xml::Result<()> {
    let vcpu = domain
        .child_mut("vcpu")
        .ok_or_else(|| domain_xml::Error::Structure("domain has no <vcpu>".to_owned()))?;
    vcpu.set_text(&pins.len().to_string());

    let cputune = Document::parse(&render_cputune(pins, "  "))?.into_root();
    match domain.child("cputune").map(|e| e.same_as(&cputune)) {
        Some(true) => {}
        Some(false) => domain.replace_child(cputune),
        None => {
            if let Err(cputune) = domain.insert_after("vcpu", cputune) {
                domain.push(cputune);
            }
        }
    }

    match domain.child_mut("cpu") {
        Some(cpu) => set_topology(cpu, pins.len()),
        None => {
            let mut cpu = Element::new("cpu").with_attr("mode", "host-passthrough");
            set_topology(&mut cpu, pins.len());
            domain.insert_before_or_push("devices", cpu);
        }
    }

    Ok(())
}

/// Drop `<cputune>` and reset the topology to one thread per vCPU.
pub fn remove_pins(domain: &mut Element) -> domain_xml::Result<()> {
    let vcpus = domain
        .child("vcpu")
        .and_then(|v| v.text().trim().parse::<usize>().ok())
        .ok_or_else(|| domain_xml::Error::Structure("domain has no valid <vcpu>".to_owned()))?;

    domain.remove_children("cputune");
    if let Some(cpu) = domain.child_mut("cpu") {
        if cpu.child("topology").is_some() {
            set_topology(cpu, vcpus);
        }
    }
    Ok(())
}

/// Pins recorded in the domain's `<cputune>`, ordered by vCPU.
pub fn read_pins(domain: &Element) -> domain_xml::Result<Vec<VcpuPin>> {
    let Some(cputune) = domain.child("cputune") else {
        return Ok(Vec::new());
    };

    let mut pins = Vec::new();
    for pin in cputune.children_named("vcpupin") {
        let vcpu = pin
            .attr("vcpu")
            .and_then(|v| v.trim().parse::<u32>().ok())
            .ok_or_else(|| domain_xml::Error::Structure("vcpupin without vcpu".to_owned()))?;
        let cpuset = pin
            .attr("cpuset")
            .and_then(|c| c.parse::<CpuList>().ok())
            .ok_or_else(|| {
                domain_xml::Error::Structure(format!("vcpupin {vcpu} has an invalid cpuset"))
            })?;
        pins.push(VcpuPin {
            vcpu,
            cpuset: cpuset.0,
        });
    }
    pins.sort_by_key(|p| p.vcpu);
    Ok(pins)
}

/// Map pins back onto the request that would produce them on `topology`.
///
/// Returns `None` when the pins do not cover a contiguous core range of a
/// single socket.
pub fn describe_pins(pins: &[VcpuPin], topology: &Topology) -> Option<PinningRequest> {
    let first = pins.first()?.cpuset.first().copied()?;
    let socket = topology
        .sockets
        .iter()
        .find(|s| s.cpus.iter().any(|c| c.id == first))?;
    let cores = socket.physical_cores();

    let mut indices = Vec::with_capacity(pins.len());
    let mut hyperthreading = false;
    for pin in pins {
        let core = cores
            .iter()
            .find(|c| pin.cpuset.iter().all(|id| c.siblings.contains(id)))?;
        hyperthreading |= pin.cpuset.len() > 1;
        indices.push(core.index);
    }

    let start = *indices.first()?;
    let contiguous = indices.iter().enumerate().all(|(i, idx)| *idx == start + i);
    contiguous.then(|| PinningRequest {
        socket: socket.id,
        start,
        end: start + indices.len() - 1,
        hyperthreading,
    })
}
