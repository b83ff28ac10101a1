// Copyright © 2024 The vmhost Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::BTreeSet;

use option_parser::CpuList;
use serde::{Deserialize, Serialize};

use crate::topology::Topology;
use crate::{Error, Result};

/// Physical core indices to isolate on one socket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationSelection {
    pub socket: u32,
    pub cores: Vec<usize>,
}

/// Isolation view of one socket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SocketIsolation {
    pub socket: u32,
    pub total_physical_cores: usize,
    pub max_isolatable_cores: usize,
    /// Cores whose sibling threads are all isolated.
    pub isolated_core_indices: Vec<usize>,
}

/// Turn per-socket core selections into the logical CPU list to isolate.
///
/// Every selected core contributes all of its sibling threads. A socket
/// may not isolate more than half of its physical cores.
pub fn build_isolation_cpuset(
    selections: &[IsolationSelection],
    topology: &Topology,
) -> Result<CpuList> {
    if selections.is_empty() {
        return Err(Error::Validation(
            "at least one socket selection is required".to_owned(),
        ));
    }

    let mut seen = BTreeSet::new();
    let mut cpus = Vec::new();
    for selection in selections {
        if !seen.insert(selection.socket) {
            return Err(Error::Validation(format!(
                "socket {} provided more than once",
                selection.socket
            )));
        }

        let socket = topology
            .socket(selection.socket)
            .ok_or_else(|| Error::NotFound(format!("socket {}", selection.socket)))?;
        let cores = socket.physical_cores();
        if cores.is_empty() {
            return Err(Error::Validation(format!(
                "socket {} has no physical cores",
                selection.socket
            )));
        }

        let indices: BTreeSet<usize> = selection.cores.iter().copied().collect();
        if indices.is_empty() {
            return Err(Error::Validation(format!(
                "socket {} must include at least one physical core index",
                selection.socket
            )));
        }

        let max = cores.len() / 2;
        if indices.len() > max {
            return Err(Error::Validation(format!(
                "socket {} exceeds isolation limit: requested {} physical cores, max allowed is {} (50% of {})",
                selection.socket,
                indices.len(),
                max,
                cores.len()
            )));
        }

        for idx in indices {
            let core = cores.get(idx).ok_or_else(|| {
                Error::Validation(format!(
                    "socket {} core index {} out of range (valid: 0..{})",
                    selection.socket,
                    idx,
                    cores.len() - 1
                ))
            })?;
            cpus.extend_from_slice(&core.siblings);
        }
    }

    Ok(CpuList::new(cpus))
}

/// Report, per socket, which physical cores `isolated` fully covers.
pub fn socket_isolation(topology: &Topology, isolated: &CpuList) -> Vec<SocketIsolation> {
    topology
        .sockets
        .iter()
        .map(|socket| {
            let cores = socket.physical_cores();
            SocketIsolation {
                socket: socket.id,
                total_physical_cores: cores.len(),
                max_isolatable_cores: cores.len() / 2,
                isolated_core_indices: cores
                    .iter()
                    .filter(|c| c.siblings.iter().all(|id| isolated.contains(*id)))
                    .map(|c| c.index)
                    .collect(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::tests::{ht_topology, topology_from};

    fn select(socket: u32, cores: &[usize]) -> IsolationSelection {
        IsolationSelection {
            socket,
            cores: cores.to_vec(),
        }
    }

    #[test]
    fn test_isolation_expands_siblings() {
        let cpus = build_isolation_cpuset(&[select(0, &[1, 0, 1])], &ht_topology()).unwrap();
        assert_eq!(cpus.0, vec![0, 1, 4, 5]);
        assert_eq!(cpus.to_string(), "0-1,4-5");
    }

    #[test]
    fn test_isolation_limit() {
        let topology = ht_topology();
        // Exactly half is allowed.
        build_isolation_cpuset(&[select(0, &[2, 3])], &topology).unwrap();

        match build_isolation_cpuset(&[select(0, &[0, 1, 2])], &topology) {
            Err(Error::Validation(msg)) => {
                assert!(msg.contains("max allowed is 2 (50% of 4)"), "{msg}")
            }
            r => panic!("unexpected result {r:?}"),
        }

        let odd = topology_from(&[(0, 5, false)]);
        build_isolation_cpuset(&[select(0, &[0, 4])], &odd).unwrap();
        assert!(build_isolation_cpuset(&[select(0, &[0, 1, 4])], &odd).is_err());

        let single = topology_from(&[(0, 1, true)]);
        assert!(matches!(
            build_isolation_cpuset(&[select(0, &[0])], &single),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_isolation_rejects_bad_selections() {
        let topology = topology_from(&[(0, 4, true), (1, 4, true)]);
        assert!(matches!(
            build_isolation_cpuset(&[], &topology),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            build_isolation_cpuset(&[select(0, &[0]), select(0, &[1])], &topology),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            build_isolation_cpuset(&[select(7, &[0])], &topology),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            build_isolation_cpuset(&[select(1, &[])], &topology),
            Err(Error::Validation(_))
        ));
        match build_isolation_cpuset(&[select(1, &[9])], &topology) {
            Err(Error::Validation(msg)) => assert!(msg.contains("valid: 0..3"), "{msg}"),
            r => panic!("unexpected result {r:?}"),
        }

        // Socket 1 logical ids are 4-7 and 12-15.
        let cpus =
            build_isolation_cpuset(&[select(0, &[3]), select(1, &[0, 1])], &topology).unwrap();
        assert_eq!(cpus.to_string(), "3-5,11-13");
    }

    #[test]
    fn test_socket_isolation() {
        let topology = ht_topology();
        let isolated: CpuList = "0-1,4-5,3".parse().unwrap();
        let report = socket_isolation(&topology, &isolated);
        assert_eq!(
            report,
            vec![SocketIsolation {
                socket: 0,
                total_physical_cores: 4,
                max_isolatable_cores: 2,
                // Core 3 is missing its sibling 7.
                isolated_core_indices: vec![0, 1],
            }]
        );
    }
}
