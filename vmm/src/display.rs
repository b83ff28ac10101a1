// Copyright © 2024 The vmhost Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Browser console (noVNC) devices of a workload.
//!
//! Enabling gives the workload a VNC server and a virtio video adapter.
//! Disabling strips every remote display and audio device, SPICE plumbing
//! included, so the workload runs headless.

use serde::Serialize;

use crate::builder::DEFAULT_LISTEN;
use crate::domain_xml::{self, Element};
use crate::memory_backing::DomainFeature;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct VncVideoInfo {
    pub enabled: bool,
    pub vnc_graphics: bool,
    pub video_count: usize,
    /// Model of the first usable adapter, else of the first adapter.
    pub model: Option<String>,
}

fn video_model(video: &Element) -> Option<String> {
    video
        .child("model")
        .and_then(|m| m.attr("type"))
        .map(|t| t.trim().to_owned())
}

fn is_usable_model(model: &str) -> bool {
    !model.is_empty() && !model.eq_ignore_ascii_case("none")
}

fn is_graphics(device: &Element, kind: &str) -> bool {
    device.name() == "graphics" && device.attr("type").as_deref() == Some(kind)
}

/// Devices dropped when the console is disabled.
fn is_display_device(device: &Element) -> bool {
    let spicevmc = device.attr("type").as_deref() == Some("spicevmc");
    match device.name() {
        "graphics" => is_graphics(device, "vnc") || is_graphics(device, "spice"),
        "video" | "sound" | "audio" => true,
        "channel" | "redirdev" | "smartcard" => spicevmc,
        _ => false,
    }
}

fn vnc_graphics() -> Element {
    Element::new("graphics")
        .with_attr("type", "vnc")
        .with_attr("port", "-1")
        .with_attr("autoport", "yes")
        .with_attr("listen", DEFAULT_LISTEN)
        .with_child(
            Element::new("listen")
                .with_attr("type", "address")
                .with_attr("address", DEFAULT_LISTEN),
        )
}

fn set_virtio_model(video: &mut Element) {
    match video.child_mut("model") {
        Some(model) => {
            model.set_attr("type", "virtio");
            model.set_attr("heads", "1");
        }
        None => video.push(virtio_model()),
    }
}

fn virtio_model() -> Element {
    Element::new("model")
        .with_attr("type", "virtio")
        .with_attr("heads", "1")
}

pub struct VncVideo;

impl DomainFeature for VncVideo {
    const NAME: &'static str = "VNC video";
    type Info = VncVideoInfo;

    fn inspect(domain: &Element) -> VncVideoInfo {
        let Some(devices) = domain.child("devices") else {
            return VncVideoInfo::default();
        };
        let models: Vec<Option<String>> = devices.children_named("video").map(video_model).collect();
        let usable = models.iter().flatten().find(|m| is_usable_model(m));
        VncVideoInfo {
            enabled: usable.is_some(),
            vnc_graphics: devices.elements().any(|d| is_graphics(d, "vnc")),
            video_count: models.len(),
            model: usable.cloned().or_else(|| models.first().cloned().flatten()),
        }
    }

    fn apply(domain: &mut Element, enable: bool) -> domain_xml::Result<()> {
        let devices = domain
            .child_mut("devices")
            .ok_or_else(|| domain_xml::Error::Structure("domain has no <devices>".to_owned()))?;

        if !enable {
            let removed = devices.remove_children_where(is_display_device);
            debug!("Removed {removed} display devices");
            return Ok(());
        }

        if !devices.elements().any(|d| is_graphics(d, "vnc")) {
            devices.push(vnc_graphics());
        }
        if devices.child("video").is_none() {
            devices.push(Element::new("video").with_child(virtio_model()));
        } else {
            devices
                .elements_mut()
                .filter(|d| d.name() == "video")
                .for_each(set_virtio_model);
        }
        Ok(())
    }
}
