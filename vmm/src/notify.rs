// Copyright © 2024 The vmhost Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::borrow::Cow;
use std::collections::HashMap;

use event_monitor::EventMonitor;

/// Operator visible event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    MigrationStarted {
        vm: String,
        destination: String,
        live: bool,
    },
    MigrationProgress {
        vm: String,
        /// Clamped to 0..=100.
        percent: u8,
        processed: u64,
        total: u64,
    },
    MigrationFinished {
        vm: String,
        destination: String,
    },
    MigrationFailed {
        vm: String,
        error: String,
    },
    MigrationCancelled {
        vm: String,
    },
    /// A lifecycle operation completed on a workload.
    Lifecycle {
        vm: String,
        event: &'static str,
    },
    /// Host kernel arguments were rewritten.
    HostTuning {
        event: &'static str,
        message: String,
    },
}

impl Notification {
    pub fn source(&self) -> &'static str {
        match self {
            Notification::MigrationStarted { .. }
            | Notification::MigrationProgress { .. }
            | Notification::MigrationFinished { .. }
            | Notification::MigrationFailed { .. }
            | Notification::MigrationCancelled { .. } => "migration",
            Notification::Lifecycle { .. } => "vm",
            Notification::HostTuning { .. } => "host",
        }
    }

    pub fn event(&self) -> &'static str {
        match self {
            Notification::MigrationStarted { .. } => "started",
            Notification::MigrationProgress { .. } => "progress",
            Notification::MigrationFinished { .. } => "finished",
            Notification::MigrationFailed { .. } => "failed",
            Notification::MigrationCancelled { .. } => "cancelled",
            Notification::Lifecycle { event, .. } | Notification::HostTuning { event, .. } => {
                *event
            }
        }
    }

    /// Whether this ends a migration attempt.
    pub fn is_migration_outcome(&self) -> bool {
        matches!(
            self,
            Notification::MigrationFinished { .. }
                | Notification::MigrationFailed { .. }
                | Notification::MigrationCancelled { .. }
        )
    }

    pub fn properties(&self) -> HashMap<Cow<'_, str>, Cow<'_, str>> {
        let mut properties: HashMap<Cow<str>, Cow<str>> = HashMap::new();
        match self {
            Notification::MigrationStarted {
                vm,
                destination,
                live,
            } => {
                properties.insert("vm".into(), vm.into());
                properties.insert("destination".into(), destination.into());
                properties.insert("live".into(), live.to_string().into());
            }
            Notification::MigrationProgress {
                vm,
                percent,
                processed,
                total,
            } => {
                properties.insert("vm".into(), vm.into());
                properties.insert("percent".into(), percent.to_string().into());
                properties.insert("processed".into(), processed.to_string().into());
                properties.insert("total".into(), total.to_string().into());
            }
            Notification::MigrationFinished { vm, destination } => {
                properties.insert("vm".into(), vm.into());
                properties.insert("destination".into(), destination.into());
            }
            Notification::MigrationFailed { vm, error } => {
                properties.insert("vm".into(), vm.into());
                properties.insert("error".into(), error.into());
            }
            Notification::MigrationCancelled { vm } | Notification::Lifecycle { vm, .. } => {
                properties.insert("vm".into(), vm.into());
            }
            Notification::HostTuning { message, .. } => {
                properties.insert("message".into(), message.into());
            }
        }
        properties
    }
}

/// Sink for operator notifications.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification);
}

/// Drops every notification.
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _notification: &Notification) {}
}

impl Notifier for EventMonitor {
    fn notify(&self, notification: &Notification) {
        self.event_log(
            notification.source(),
            notification.event(),
            Some(&notification.properties()),
        );
    }
}
