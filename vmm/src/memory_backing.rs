// Copyright © 2024 The vmhost Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Memory related toggles of a workload description.
//!
//! Each toggle is a [`DomainFeature`]: it can report its state from a
//! description and rewrite the description to enable or disable itself,
//! touching nothing but its own elements. Rewriting twice in the same
//! direction leaves the document byte-for-byte unchanged the second time.

use serde::Serialize;

use crate::domain_xml::{self, Document, Element};

pub trait DomainFeature {
    /// Name used in logs and messages.
    const NAME: &'static str;
    type Info;

    fn inspect(domain: &Element) -> Self::Info;
    fn apply(domain: &mut Element, enable: bool) -> domain_xml::Result<()>;
}

/// Report the state of feature `F` in a serialized description.
pub fn inspect<F: DomainFeature>(xml: &str) -> domain_xml::Result<F::Info> {
    let doc = Document::parse_rooted(xml, "domain")?;
    Ok(F::inspect(doc.root()))
}

/// Enable or disable feature `F`, returning the new description and the
/// feature state it yields.
pub fn rewrite<F: DomainFeature>(xml: &str, enable: bool) -> domain_xml::Result<(String, F::Info)> {
    let mut doc = Document::parse_rooted(xml, "domain")?;
    F::apply(doc.root_mut(), enable)?;
    let info = F::inspect(doc.root());
    Ok((doc.to_string(), info))
}

const MEMORY_BACKING: &str = "memoryBacking";

fn has_backing_flag(domain: &Element, flag: &str) -> bool {
    domain
        .child(MEMORY_BACKING)
        .is_some_and(|mb| mb.child(flag).is_some())
}

/// Add `<flag/>` to `<memoryBacking>`, creating the container in front of
/// `<devices>` when needed.
fn add_backing_flag(domain: &mut Element, flag: &str) {
    match domain.child_mut(MEMORY_BACKING) {
        Some(mb) => {
            if mb.child(flag).is_none() {
                mb.push(Element::new(flag));
            }
        }
        None => domain.insert_before_or_push(
            "devices",
            Element::new(MEMORY_BACKING).with_child(Element::new(flag)),
        ),
    }
}

/// Remove `<flag/>` from `<memoryBacking>` and drop the container once empty.
fn remove_backing_flag(domain: &mut Element, flag: &str) {
    let emptied = match domain.child_mut(MEMORY_BACKING) {
        Some(mb) => mb.remove_children(flag) > 0 && mb.is_empty(),
        None => false,
    };
    if emptied {
        domain.remove_children(MEMORY_BACKING);
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HugePagesInfo {
    pub enabled: bool,
    pub has_memory_backing: bool,
    pub memory_locked: bool,
}

/// Back guest memory with host huge pages.
pub struct HugePages;

impl DomainFeature for HugePages {
    const NAME: &'static str = "hugepages";
    type Info = HugePagesInfo;

    fn inspect(domain: &Element) -> HugePagesInfo {
        HugePagesInfo {
            enabled: has_backing_flag(domain, "hugepages"),
            has_memory_backing: domain.child(MEMORY_BACKING).is_some(),
            memory_locked: has_backing_flag(domain, "locked"),
        }
    }

    fn apply(domain: &mut Element, enable: bool) -> domain_xml::Result<()> {
        if enable {
            add_backing_flag(domain, "hugepages");
        } else {
            remove_backing_flag(domain, "hugepages");
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MemoryBalloonInfo {
    pub enabled: bool,
    pub memory_locked: bool,
    pub has_memballoon: bool,
    pub model: Option<String>,
}

/// Virtio memory balloon. A disabled balloon is an explicit `model='none'`
/// device paired with locked guest memory.
pub struct MemoryBalloon;

impl MemoryBalloon {
    fn device(enable: bool) -> Element {
        if enable {
            Element::new("memballoon")
                .with_attr("model", "virtio")
                .with_child(Element::new("stats").with_attr("period", "10"))
        } else {
            Element::new("memballoon").with_attr("model", "none")
        }
    }
}

impl DomainFeature for MemoryBalloon {
    const NAME: &'static str = "memory balloon";
    type Info = MemoryBalloonInfo;

    fn inspect(domain: &Element) -> MemoryBalloonInfo {
        let balloon = domain.find("devices/memballoon");
        let model = balloon
            .and_then(|b| b.attr("model"))
            .map(|m| m.trim().to_owned());
        MemoryBalloonInfo {
            enabled: model
                .as_deref()
                .is_some_and(|m| !m.is_empty() && !m.eq_ignore_ascii_case("none")),
            memory_locked: has_backing_flag(domain, "locked"),
            has_memballoon: balloon.is_some(),
            model,
        }
    }

    fn apply(domain: &mut Element, enable: bool) -> domain_xml::Result<()> {
        let devices = domain
            .child_mut("devices")
            .ok_or_else(|| domain_xml::Error::Structure("domain has no <devices>".to_owned()))?;

        let wanted = Self::device(enable);
        let in_place = {
            let mut balloons = devices.children_named("memballoon");
            matches!(
                (balloons.next(), balloons.next()),
                (Some(b), None) if b.same_as(&wanted)
            )
        };
        if !in_place {
            devices.remove_children("memballoon");
            devices.push(wanted);
        }

        if enable {
            remove_backing_flag(domain, "locked");
        } else {
            add_backing_flag(domain, "locked");
        }
        Ok(())
    }
}
