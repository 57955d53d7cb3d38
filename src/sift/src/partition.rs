// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

use std::fs;
use std::path::Path;

use log::{debug, error, warn};
use regex::Regex;

use crate::debugfs::{AmdGpuDebugFs, SramAccessor};
use crate::device::DeviceId;
use crate::kfd::KfdNodeProperties;
use crate::{Error, Result};

/// Stable handle for a partition: its index in the engine's partition table,
/// which is also its global enumeration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PartitionId(pub usize);

/// A spatial slice of a device: one KFD node, the unit at which registers
/// and memory are addressed.
#[derive(Debug)]
pub struct Partition {
    device: DeviceId,
    kfd_node: usize,
    drm_node: usize,
    local_id: usize,
    global_id: PartitionId,
    xcc_die_ids: Vec<u32>,
    // Privileged interfaces; absent when the debugfs tree is unreadable.
    debugfs: Option<AmdGpuDebugFs>,
    sram: Option<SramAccessor>,
}

impl Partition {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        device: DeviceId,
        kfd_node: usize,
        drm_node: usize,
        local_id: usize,
        global_id: PartitionId,
        xcc_die_ids: Vec<u32>,
        debugfs: Option<AmdGpuDebugFs>,
        sram: Option<SramAccessor>,
    ) -> Partition {
        Partition {
            device,
            kfd_node,
            drm_node,
            local_id,
            global_id,
            xcc_die_ids,
            debugfs,
            sram,
        }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Index of this partition's node in the KFD topology.
    pub fn kfd_node_index(&self) -> usize {
        self.kfd_node
    }

    /// Index of this partition's render node in the DRM table.
    pub fn drm_node_index(&self) -> usize {
        self.drm_node
    }

    pub fn local_id(&self) -> usize {
        self.local_id
    }

    pub fn global_id(&self) -> PartitionId {
        self.global_id
    }

    /// XCC die ids owned by this slice; every register offset is computed
    /// relative to them.
    pub fn xcc_die_ids(&self) -> &[u32] {
        &self.xcc_die_ids
    }

    pub fn debugfs(&self) -> Result<&AmdGpuDebugFs> {
        self.debugfs.as_ref().ok_or_else(|| {
            warn!("debugfs interface unavailable for partition {}", self.global_id.0);
            Error::NotPrivileged("amdgpu debugfs interface unavailable".to_string())
        })
    }

    pub(crate) fn sram(&self) -> Result<&SramAccessor> {
        self.sram.as_ref().ok_or_else(|| {
            warn!("system memory interface unavailable for partition {}", self.global_id.0);
            Error::NotPrivileged("system memory interface unavailable".to_string())
        })
    }
}

/// Locates the `dri` debugfs directory whose `name` file matches the node's
/// PCI coordinates, e.g. `amdgpu dev=0000:31:00.0 unique=0000:31:00.0`.
pub(crate) fn resolve_debugfs(dri_root: &Path, props: &KfdNodeProperties) -> Option<AmdGpuDebugFs> {
    let name_re = Regex::new(
        r"amdgpu\s+dev=([0-9a-fA-F]{4}):([0-9a-fA-F]{2}):([0-9a-fA-F]{2})\.([0-9a-fA-F])",
    )
    .expect("name regex");
    let entries = match fs::read_dir(dri_root) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("cannot read {}: {}", dri_root.display(), e);
            return None;
        }
    };
    for entry in entries.flatten() {
        let dir = entry.path();
        if !dir.is_dir() || !dir.join("amdgpu_regs2").exists() {
            continue;
        }
        let contents = match fs::read_to_string(dir.join("name")) {
            Ok(c) => c,
            Err(_) => continue,
        };
        let caps = match name_re.captures(&contents) {
            Some(c) => c,
            None => {
                error!("unexpected dri name file contents: {}", contents.trim());
                continue;
            }
        };
        let domain = u64::from_str_radix(&caps[1], 16).unwrap_or(u64::MAX);
        let bus = u32::from_str_radix(&caps[2], 16).unwrap_or(u32::MAX);
        let device = u32::from_str_radix(&caps[3], 16).unwrap_or(u32::MAX);
        if props.domain_id == domain && props.pci_bus() == bus && props.pci_device() == device {
            debug!(
                "{:04x}:{:02x}:{:02x} -> {}",
                domain,
                bus,
                device,
                dir.display()
            );
            match AmdGpuDebugFs::open(&dir) {
                Ok(dbg) => return Some(dbg),
                Err(e) => {
                    warn!("cannot open amdgpu debugfs at {}: {}", dir.display(), e);
                    return None;
                }
            }
        }
    }
    debug!(
        "no amdgpu debugfs directory for {:04x}:{:02x}:{:02x}",
        props.domain_id,
        props.pci_bus(),
        props.pci_device()
    );
    None
}

const GIB: u64 = 1 << 30;

pub(crate) fn round_up_gib(bytes: u64) -> u64 {
    ((bytes + GIB - 1) / GIB) * GIB
}

/// Routes a hive-global VRAM offset to `(peer slot, local offset)`, given
/// each peer's GiB-rounded VRAM size in `physical_id` order.
pub(crate) fn hive_route(rounded_sizes: &[u64], mut addr: u64) -> Result<(usize, u64)> {
    for (slot, &size) in rounded_sizes.iter().enumerate() {
        if addr < size {
            return Ok((slot, addr));
        }
        addr -= size;
    }
    Err(Error::OutOfRange(format!(
        "hive-global address exceeds the hive by {:#x} bytes",
        addr
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding_to_gib() {
        assert_eq!(round_up_gib(0), 0);
        assert_eq!(round_up_gib(1), GIB);
        assert_eq!(round_up_gib(GIB), GIB);
        assert_eq!(round_up_gib(63 * GIB + 5), 64 * GIB);
    }

    #[test]
    fn hive_routing() {
        let sizes = [64 * GIB, 64 * GIB];
        assert_eq!(hive_route(&sizes, 0).unwrap(), (0, 0));
        assert_eq!(hive_route(&sizes, 0x800).unwrap(), (0, 0x800));
        // An offset exactly at a peer's rounded size belongs to the next peer.
        assert_eq!(hive_route(&sizes, 64 * GIB).unwrap(), (1, 0));
        assert_eq!(hive_route(&sizes, 64 * GIB + 0x800).unwrap(), (1, 0x800));
        assert!(matches!(
            hive_route(&sizes, 128 * GIB),
            Err(Error::OutOfRange(_))
        ));
    }

    #[test]
    fn hive_routing_skips_vramless_peers() {
        let sizes = [0, 32 * GIB];
        assert_eq!(hive_route(&sizes, 0).unwrap(), (1, 0));
    }
}
