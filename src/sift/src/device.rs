// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

use log::debug;

use crate::ipdiscovery::IpDiscovery;
use crate::partition::PartitionId;
use crate::{Error, Result};

/// Stable handle for a device: its index in the engine's device table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DeviceId(pub usize);

/// A physical GPU: the KFD nodes sharing one PCI bus+device coordinate.
#[derive(Debug)]
pub struct Device {
    instance: u32,
    domain: u32,
    bdf: u32,
    ipdiscovery: Option<IpDiscovery>,
    partitions: Vec<PartitionId>,
}

impl Device {
    pub(crate) fn new(
        instance: u32,
        domain: u32,
        bdf: u32,
        ipdiscovery: Option<IpDiscovery>,
        partitions: Vec<PartitionId>,
    ) -> Device {
        Device {
            instance,
            domain,
            bdf,
            ipdiscovery,
            partitions,
        }
    }

    pub fn instance(&self) -> u32 {
        self.instance
    }

    pub fn domain(&self) -> u32 {
        self.domain
    }

    /// PCI bus/device/function packed as in the KFD `location_id`.
    pub fn bdf(&self) -> u32 {
        self.bdf
    }

    pub fn ipdiscovery(&self) -> Option<&IpDiscovery> {
        self.ipdiscovery.as_ref()
    }

    pub fn partitions(&self) -> &[PartitionId] {
        &self.partitions
    }
}

/// Distributes the device's unharvested GC die ids over its KFD nodes.
///
/// Each node takes instances until it holds `num_xcc` of them, in discovery
/// order. Without a discovery table only single-XCC nodes can be satisfied;
/// they all get die 0.
pub(crate) fn assign_xcc_die_ids(
    table: Option<&IpDiscovery>,
    num_xcc: &[u64],
) -> Result<Vec<Vec<u32>>> {
    let mut ids: Vec<Vec<u32>> = vec![Vec::new(); num_xcc.len()];
    match table {
        Some(table) => {
            let mut cursor = 0usize;
            for die in &table.dies {
                let gc = match die.ip("GC") {
                    Some(gc) => gc,
                    None => continue,
                };
                for inst in &gc.instances {
                    if inst.harvest != 0 {
                        continue;
                    }
                    for node in cursor..num_xcc.len() {
                        if (ids[node].len() as u64) < num_xcc[node] {
                            ids[node].push(inst.num_instance as u32);
                            cursor = node;
                            break;
                        }
                    }
                }
            }
        }
        None => {
            debug!("no IP discovery table, taking best guess at GC die ids");
            for (node, &xcc) in num_xcc.iter().enumerate() {
                if xcc > 1 {
                    return Err(Error::Generic(format!(
                        "KFD node reports {} XCCs but the device has no IP-discovery table",
                        xcc
                    )));
                }
                ids[node].push(0);
            }
        }
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipdiscovery::{Die, Ip, IpInstance};

    fn gc_table(instances: &[(u8, u8)]) -> IpDiscovery {
        let gc = Ip {
            name: "GC".to_string(),
            instances: instances
                .iter()
                .map(|&(num_instance, harvest)| IpInstance {
                    num_instance,
                    harvest,
                    ..Default::default()
                })
                .collect(),
        };
        let mut die = Die::default();
        die.ips.insert("GC".to_string(), gc);
        IpDiscovery { dies: vec![die] }
    }

    #[test]
    fn splits_gc_instances_over_nodes() {
        let table = gc_table(&[(0, 0), (1, 0), (2, 0), (3, 0)]);
        let ids = assign_xcc_die_ids(Some(&table), &[2, 2]).unwrap();
        assert_eq!(ids, vec![vec![0, 1], vec![2, 3]]);
    }

    #[test]
    fn harvested_instances_are_skipped() {
        let table = gc_table(&[(0, 0), (1, 1), (2, 0)]);
        let ids = assign_xcc_die_ids(Some(&table), &[1, 1]).unwrap();
        assert_eq!(ids, vec![vec![0], vec![2]]);
    }

    #[test]
    fn defaults_to_die_zero_without_a_table() {
        let ids = assign_xcc_die_ids(None, &[1, 1]).unwrap();
        assert_eq!(ids, vec![vec![0], vec![0]]);
    }

    #[test]
    fn multi_xcc_without_a_table_fails() {
        assert!(assign_xcc_die_ids(None, &[2]).is_err());
    }
}
