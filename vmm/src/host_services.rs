// Copyright © 2024 The vmhost Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Host services that shape workload latency: interrupt balancing through
//! `irqbalance` and the `tuned` performance profiles.
//!
//! Neither tool is installed on demand. A missing binary surfaces as
//! [`Error::ToolMissing`].

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::command::CommandRunner;
use crate::config::HostConfig;
use crate::notify::{NoopNotifier, Notification, Notifier};
use crate::{Error, Result};

const IRQBALANCE_UNIT: &str = "irqbalance.service";

/// Unit file states that start the unit at boot.
const ENABLED_UNIT_STATES: &[&str] = &["enabled", "enabled-runtime", "linked", "linked-runtime", "alias"];

/// Access to the host service manager.
pub trait ServiceManager: Send + Sync {
    /// `key=value` lines of `systemctl show` for `properties`.
    fn show(&self, unit: &str, properties: &[&str]) -> Result<String>;
    /// Enable and start, or disable and stop, `unit`.
    fn set_enabled(&self, unit: &str, enable: bool) -> Result<()>;
}

/// Access to the `tuned` daemon.
pub trait ProfileManager: Send + Sync {
    /// Output of `tuned-adm list`.
    fn list(&self) -> Result<String>;
    /// Activate the merge of `profiles`.
    fn select(&self, profiles: &[&str]) -> Result<()>;
}

pub struct Systemctl {
    binary: String,
    runner: CommandRunner,
}

impl Systemctl {
    pub fn new(binary: &str, runner: CommandRunner) -> Self {
        Systemctl {
            binary: binary.to_owned(),
            runner,
        }
    }
}

impl ServiceManager for Systemctl {
    fn show(&self, unit: &str, properties: &[&str]) -> Result<String> {
        let properties: Vec<String> = properties.iter().map(|p| format!("--property={p}")).collect();
        let mut args = vec!["show", unit];
        args.extend(properties.iter().map(String::as_str));
        Ok(self.runner.run(&self.binary, &args)?)
    }

    fn set_enabled(&self, unit: &str, enable: bool) -> Result<()> {
        let verb = if enable { "enable" } else { "disable" };
        self.runner.run_privileged(&self.binary, &[verb, "--now", unit])?;
        Ok(())
    }
}

pub struct TunedAdm {
    binary: String,
    runner: CommandRunner,
}

impl TunedAdm {
    pub fn new(binary: &str, runner: CommandRunner) -> Self {
        TunedAdm {
            binary: binary.to_owned(),
            runner,
        }
    }
}

impl ProfileManager for TunedAdm {
    fn list(&self) -> Result<String> {
        Ok(self.runner.run(&self.binary, &["list"])?)
    }

    fn select(&self, profiles: &[&str]) -> Result<()> {
        let mut args = vec!["profile"];
        args.extend_from_slice(profiles);
        self.runner.run_privileged(&self.binary, &args)?;
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IrqBalanceState {
    /// Started at boot.
    pub enabled: bool,
    /// Running now.
    pub active: bool,
    /// Raw `UnitFileState` and `ActiveState`.
    pub unit_file_state: String,
    pub active_state: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TunedProfile {
    pub name: String,
    pub description: String,
    pub active: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TunedProfiles {
    pub profiles: Vec<TunedProfile>,
    /// Space separated when several profiles are merged.
    pub active: Option<String>,
}

fn parse_properties(output: &str) -> BTreeMap<&str, &str> {
    output
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim(), value.trim()))
        .collect()
}

/// Parse `tuned-adm list`.
pub fn parse_tuned_list(output: &str) -> TunedProfiles {
    let mut profiles = Vec::new();
    let mut active = None;
    for line in output.lines().map(str::trim) {
        if let Some(entry) = line.strip_prefix("- ") {
            let (name, description) = entry.split_once(" - ").unwrap_or((entry, ""));
            profiles.push(TunedProfile {
                name: name.trim().to_owned(),
                description: description.trim().to_owned(),
                active: false,
            });
        } else if let Some(current) = line.strip_prefix("Current active profile:") {
            active = Some(current.trim().to_owned()).filter(|c| !c.is_empty());
        }
    }

    if let Some(current) = &active {
        let names: Vec<&str> = current.split_whitespace().collect();
        for profile in profiles.iter_mut() {
            profile.active = names.contains(&profile.name.as_str());
        }
    }
    TunedProfiles { profiles, active }
}

pub struct HostServices {
    services: Box<dyn ServiceManager>,
    tuned: Box<dyn ProfileManager>,
    notifier: Arc<dyn Notifier>,
}

impl HostServices {
    pub fn new(services: Box<dyn ServiceManager>, tuned: Box<dyn ProfileManager>) -> Self {
        HostServices {
            services,
            tuned,
            notifier: Arc::new(NoopNotifier),
        }
    }

    pub fn from_config(config: &HostConfig) -> Self {
        Self::new(
            Box::new(Systemctl::new(&config.systemctl, config.command_runner())),
            Box::new(TunedAdm::new(&config.tuned_adm, config.command_runner())),
        )
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    fn notify(&self, event: &'static str, message: String) {
        info!("{message}");
        self.notifier.notify(&Notification::HostTuning { event, message });
    }

    pub fn irqbalance(&self) -> Result<IrqBalanceState> {
        let output = self.services.show(
            IRQBALANCE_UNIT,
            &["LoadState", "UnitFileState", "ActiveState"],
        )?;
        let properties = parse_properties(&output);
        if properties.get("LoadState").copied() == Some("not-found") {
            return Err(Error::NotFound(format!("unit {IRQBALANCE_UNIT}")));
        }

        let unit_file_state = properties.get("UnitFileState").copied().unwrap_or_default();
        let active_state = properties.get("ActiveState").copied().unwrap_or_default();
        Ok(IrqBalanceState {
            enabled: ENABLED_UNIT_STATES.contains(&unit_file_state),
            active: active_state == "active",
            unit_file_state: unit_file_state.to_owned(),
            active_state: active_state.to_owned(),
        })
    }

    pub fn set_irqbalance(&self, enable: bool) -> Result<IrqBalanceState> {
        let current = self.irqbalance()?;
        if current.enabled == enable && current.active == enable {
            debug!("irqbalance already {}", if enable { "on" } else { "off" });
            return Ok(current);
        }

        self.services.set_enabled(IRQBALANCE_UNIT, enable)?;
        let state = self.irqbalance()?;
        let event = if enable { "irqbalance_enabled" } else { "irqbalance_disabled" };
        self.notify(
            event,
            format!(
                "irqbalance is now {} and {}",
                state.unit_file_state, state.active_state
            ),
        );
        Ok(state)
    }

    pub fn tuned_profiles(&self) -> Result<TunedProfiles> {
        Ok(parse_tuned_list(&self.tuned.list()?))
    }

    /// Activate `profiles`, merged in the given order. Unknown names are
    /// rejected before anything changes.
    pub fn set_tuned_profile(&self, profiles: &[&str]) -> Result<TunedProfiles> {
        let requested: Vec<&str> = profiles
            .iter()
            .flat_map(|p| p.split_whitespace())
            .collect();
        if requested.is_empty() {
            return Err(Error::Validation("no tuned profile given".to_owned()));
        }

        let available = self.tuned_profiles()?;
        if let Some(unknown) = requested
            .iter()
            .find(|name| !available.profiles.iter().any(|p| p.name == **name))
        {
            return Err(Error::NotFound(format!("tuned profile {unknown}")));
        }
        if available.active.as_deref() == Some(requested.join(" ").as_str()) {
            debug!("tuned profile {} already active", requested.join(" "));
            return Ok(available);
        }

        self.tuned.select(&requested)?;
        let updated = self.tuned_profiles()?;
        self.notify(
            "tuned_profile",
            format!(
                "tuned profile is now {}",
                updated.active.as_deref().unwrap_or("none")
            ),
        );
        Ok(updated)
    }
}
