// Copyright © 2021 Intel Corporation
// Copyright © 2024 The vmhost Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::borrow::Cow;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Write};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Serialize)]
struct Event<'a> {
    timestamp: Duration,
    source: &'a str,
    event: &'a str,
    properties: Option<&'a HashMap<Cow<'a, str>, Cow<'a, str>>>,
}

/// Receiving end of the event stream.
///
/// Every event is appended to `file` (if any) and handed to each subscriber.
pub struct Monitor {
    pub rx: flume::Receiver<String>,
    pub file: Option<File>,
    pub broadcast: Vec<flume::Sender<Arc<String>>>,
}

impl Monitor {
    pub fn new(rx: flume::Receiver<String>, file: Option<File>) -> Self {
        Self {
            rx,
            file,
            broadcast: vec![],
        }
    }

    pub fn subscribe(&mut self) -> flume::Receiver<Arc<String>> {
        let (tx, rx) = flume::unbounded();
        self.broadcast.push(tx);
        rx
    }

    fn dispatch(&mut self, event: String) {
        if let Some(file) = self.file.as_mut() {
            // Dropped events are preferable to blocking the producer.
            file.write_all(event.as_bytes()).ok();
            file.write_all(b"\n\n").ok();
        }

        let event = Arc::new(event);
        self.broadcast.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Drain events on a dedicated thread until every `EventMonitor`
    /// handle has been dropped.
    pub fn spawn(mut self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("event-monitor".to_owned())
            .spawn(move || {
                while let Ok(event) = self.rx.recv() {
                    self.dispatch(event);
                }
            })
    }
}

/// Producer handle, cheap to clone and share between threads.
#[derive(Clone)]
pub struct EventMonitor {
    tx: flume::Sender<String>,
    start: Instant,
}

impl EventMonitor {
    pub fn event_log(
        &self,
        source: &str,
        event: &str,
        properties: Option<&HashMap<Cow<str>, Cow<str>>>,
    ) {
        let event = Event {
            timestamp: self.start.elapsed(),
            source,
            event,
            properties,
        };

        if let Ok(event) = serde_json::to_string_pretty(&event) {
            self.tx.send(event).ok();
        }
    }
}

fn set_file_nonblocking(file: &File) -> io::Result<()> {
    let fd = file.as_raw_fd();

    // SAFETY: FFI call to configure the fd
    let ret = unsafe {
        let mut flags = libc::fcntl(fd, libc::F_GETFL);
        flags |= libc::O_NONBLOCK;
        libc::fcntl(fd, libc::F_SETFL, flags)
    };

    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Create the producer handle and the monitor that consumes its events.
pub fn set_monitor(file: Option<File>) -> io::Result<(EventMonitor, Monitor)> {
    if let Some(ref file) = file {
        set_file_nonblocking(file)?;
    }

    let (tx, rx) = flume::unbounded();
    let monitor = Monitor::new(rx, file);

    Ok((
        EventMonitor {
            tx,
            start: Instant::now(),
        },
        monitor,
    ))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use vmm_sys_util::tempfile::TempFile;

    use super::*;

    #[test]
    fn test_event_broadcast() {
        let (handle, mut monitor) = set_monitor(None).unwrap();
        let events = monitor.subscribe();
        let thread = monitor.spawn().unwrap();

        let properties = HashMap::from([
            (Cow::from("vm"), Cow::from("web01")),
            (Cow::from("dest"), Cow::from("node2")),
        ]);
        handle.event_log("migration", "started", Some(&properties));
        handle.event_log("vm", "destroyed", None);
        drop(handle);
        thread.join().unwrap();

        let first: serde_json::Value = serde_json::from_str(&events.recv().unwrap()).unwrap();
        assert_eq!(first["source"], "migration");
        assert_eq!(first["event"], "started");
        assert_eq!(first["properties"]["vm"], "web01");
        assert_eq!(first["properties"]["dest"], "node2");

        let second: serde_json::Value = serde_json::from_str(&events.recv().unwrap()).unwrap();
        assert_eq!(second["event"], "destroyed");
        assert!(second["properties"].is_null());
        assert!(events.recv().is_err());
    }

    #[test]
    fn test_event_file() {
        let tmp = TempFile::new().unwrap();
        let file = tmp.as_file().try_clone().unwrap();
        let (handle, monitor) = set_monitor(Some(file)).unwrap();
        let thread = monitor.spawn().unwrap();

        let cpus = String::from("2-3,6-7");
        let properties = HashMap::from([(Cow::from("cpus"), Cow::from(cpus.as_str()))]);
        handle.event_log("host", "isolation-updated", Some(&properties));
        drop(handle);
        thread.join().unwrap();

        let content = fs::read_to_string(tmp.as_path()).unwrap();
        assert!(content.contains("\"isolation-updated\""));
        assert!(content.contains("\"2-3,6-7\""));
    }
}
