// Copyright © 2024 The vmhost Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use option_parser::CpuList;
use serde::Serialize;

use crate::{Error, Result};

/// A hardware thread and the ids of every thread sharing its core, itself included.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LogicalCpu {
    pub id: u32,
    pub siblings: Vec<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Socket {
    pub id: u32,
    pub cpus: Vec<LogicalCpu>,
}

/// A physical core derived from a socket's sibling sets.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PhysicalCore {
    /// Position within the socket, ordered by lowest sibling id.
    pub index: usize,
    /// Lowest sibling id.
    pub id: u32,
    pub siblings: Vec<u32>,
}

impl Socket {
    /// Group the socket's logical CPUs by identical sibling set.
    pub fn physical_cores(&self) -> Vec<PhysicalCore> {
        let mut groups: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
        for cpu in &self.cpus {
            let mut siblings = cpu.siblings.clone();
            if siblings.is_empty() {
                siblings.push(cpu.id);
            }
            siblings.sort_unstable();
            siblings.dedup();
            groups.entry(siblings[0]).or_insert(siblings);
        }

        groups
            .into_iter()
            .enumerate()
            .map(|(index, (id, siblings))| PhysicalCore {
                index,
                id,
                siblings,
            })
            .collect()
    }
}

/// Snapshot of the host CPU layout, sockets ordered by id.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Topology {
    pub sockets: Vec<Socket>,
}

impl Topology {
    /// Read `<root>/cpuN/topology/*` for every logical CPU.
    ///
    /// CPUs whose package id cannot be read (offline CPUs) are skipped. A
    /// missing sibling list means the CPU is its own only sibling.
    pub fn discover(root: &Path) -> Result<Self> {
        let entries = fs::read_dir(root).map_err(|e| Error::io(root, e))?;

        let mut sockets: BTreeMap<u32, Vec<LogicalCpu>> = BTreeMap::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(root, e))?;
            let name = entry.file_name();
            let Some(id) = name
                .to_str()
                .and_then(|n| n.strip_prefix("cpu"))
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };

            let topology = entry.path().join("topology");
            let Some(socket_id) = fs::read_to_string(topology.join("physical_package_id"))
                .ok()
                .and_then(|s| s.trim().parse::<u32>().ok())
            else {
                debug!("Skipping cpu{id}: no package id");
                continue;
            };

            let siblings = fs::read_to_string(topology.join("thread_siblings_list"))
                .ok()
                .and_then(|s| s.parse::<CpuList>().ok())
                .filter(|l| !l.is_empty())
                .map(|l| l.0)
                .unwrap_or_else(|| vec![id]);

            sockets
                .entry(socket_id)
                .or_default()
                .push(LogicalCpu { id, siblings });
        }

        let sockets: Vec<Socket> = sockets
            .into_iter()
            .map(|(id, mut cpus)| {
                cpus.sort_by_key(|c| c.id);
                Socket { id, cpus }
            })
            .collect();

        debug!("Found {} socket(s) under {}", sockets.len(), root.display());
        Ok(Topology { sockets })
    }

    pub fn socket(&self, id: u32) -> Option<&Socket> {
        self.sockets.iter().find(|s| s.id == id)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::fs;
    use std::path::Path;

    use vmm_sys_util::tempdir::TempDir;

    use super::*;

    /// One socket, 4 physical cores, siblings {0,4},{1,5},{2,6},{3,7}.
    pub(crate) fn ht_topology() -> Topology {
        topology_from(&[(0, 4, true)])
    }

    /// Build sockets of `cores` physical cores each, optionally hyperthreaded.
    /// Logical ids are laid out like Linux does: all first threads, then all
    /// second threads.
    pub(crate) fn topology_from(layout: &[(u32, u32, bool)]) -> Topology {
        let total: u32 = layout.iter().map(|(_, cores, _)| cores).sum();
        let mut base = 0;
        let mut sockets = Vec::new();
        for (socket_id, cores, ht) in layout {
            let mut cpus = Vec::new();
            for core in 0..*cores {
                let first = base + core;
                let siblings = if *ht {
                    vec![first, first + total]
                } else {
                    vec![first]
                };
                for id in &siblings {
                    cpus.push(LogicalCpu {
                        id: *id,
                        siblings: siblings.clone(),
                    });
                }
            }
            cpus.sort_by_key(|c| c.id);
            sockets.push(Socket {
                id: *socket_id,
                cpus,
            });
            base += cores;
        }
        Topology { sockets }
    }

    fn write_cpu(root: &Path, id: u32, package: Option<&str>, siblings: Option<&str>) {
        let dir = root.join(format!("cpu{id}")).join("topology");
        fs::create_dir_all(&dir).unwrap();
        if let Some(package) = package {
            fs::write(dir.join("physical_package_id"), package).unwrap();
        }
        if let Some(siblings) = siblings {
            fs::write(dir.join("thread_siblings_list"), siblings).unwrap();
        }
    }

    #[test]
    fn test_discover() {
        let tmp = TempDir::new_with_prefix("/tmp/vmhost-topology").unwrap();
        let root = tmp.as_path();
        for id in 0..4 {
            write_cpu(root, id, Some("0\n"), Some(&format!("{},{}\n", id, id + 4)));
            write_cpu(root, id + 4, Some("0\n"), Some(&format!("{},{}\n", id, id + 4)));
        }
        // Offline CPU without topology attributes.
        write_cpu(root, 8, None, None);
        // CPU with a package id but no sibling list.
        write_cpu(root, 9, Some("1"), None);
        fs::create_dir_all(root.join("cpufreq")).unwrap();
        fs::write(root.join("online"), "0-9").unwrap();

        let topology = Topology::discover(root).unwrap();
        assert_eq!(topology.sockets.len(), 2);

        let socket = topology.socket(0).unwrap();
        assert_eq!(socket.cpus.len(), 8);
        assert_eq!(socket.cpus[0].siblings, vec![0, 4]);
        assert_eq!(socket.cpus[5].id, 5);
        assert_eq!(socket.cpus[5].siblings, vec![1, 5]);

        let socket = topology.socket(1).unwrap();
        assert_eq!(
            socket.cpus,
            vec![LogicalCpu {
                id: 9,
                siblings: vec![9]
            }]
        );
        assert!(topology.socket(2).is_none());
    }

    #[test]
    fn test_discover_unreadable_root() {
        assert!(matches!(
            Topology::discover(Path::new("/nonexistent/vmhost/cpu")),
            Err(Error::Io { .. })
        ));
    }

    #[test]
    fn test_physical_cores() {
        let topology = ht_topology();
        let cores = topology.sockets[0].physical_cores();
        assert_eq!(cores.len(), 4);
        for (i, core) in cores.iter().enumerate() {
            assert_eq!(core.index, i);
            assert_eq!(core.id, i as u32);
            assert_eq!(core.siblings, vec![i as u32, i as u32 + 4]);
        }

        let topology = topology_from(&[(0, 2, false), (1, 3, false)]);
        let cores = topology.socket(1).unwrap().physical_cores();
        assert_eq!(
            cores.iter().map(|c| c.id).collect::<Vec<_>>(),
            vec![2, 3, 4]
        );
    }
}
