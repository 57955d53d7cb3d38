// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Device and partition enumeration, and the partition-level I/O surface.
//!
//! KFD nodes with compute units are bucketed by PCI bus+device into devices;
//! each node becomes one partition wired to its DRM render node, its XCC die
//! ids and (when privileged) its amdgpu debugfs accessors. Devices and
//! partitions live in two append-only vectors; [`DeviceId`] and
//! [`PartitionId`] are indices into them.

use std::collections::BTreeMap;
use std::path::PathBuf;

use log::debug;

use crate::device::{assign_xcc_die_ids, Device, DeviceId};
use crate::debugfs::SramAccessor;
use crate::drm::Drm;
use crate::ipdiscovery::IpDiscovery;
use crate::kfd::{KfdHandle, KfdNode, KfdNodeProperties, KfdProc};
use crate::partition::{hive_route, resolve_debugfs, round_up_gib, Partition, PartitionId};
use crate::pm4::{self, Runlist};
use crate::xlator::{self, TranslationSource, Xlator};
use crate::{logging, Error, Result};

/// Register aperture selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aperture {
    Mmio,
    Smn,
}

/// Linear memory region selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemRegion {
    Vram,
    SystemRam,
}

/// Filesystem roots the engine enumerates from. Overridable for tests.
#[derive(Debug, Clone)]
pub struct EngineRoots {
    pub kfd: PathBuf,
    pub kfd_debug: PathBuf,
    pub drm: PathBuf,
    pub dri_debug: PathBuf,
    pub pci: PathBuf,
    pub devmem: PathBuf,
}

impl Default for EngineRoots {
    fn default() -> Self {
        EngineRoots {
            kfd: PathBuf::from("/sys/class/kfd"),
            kfd_debug: PathBuf::from("/sys/kernel/debug/kfd"),
            drm: PathBuf::from("/sys/class/drm"),
            dri_debug: PathBuf::from("/sys/kernel/debug/dri"),
            pci: PathBuf::from("/sys/bus/pci/devices"),
            devmem: PathBuf::from("/dev/mem"),
        }
    }
}

/// The topology arena: every device and partition discovered at init.
/// Immutable after construction.
pub struct Engine {
    kfd: KfdHandle,
    drm: Drm,
    devices: Vec<Device>,
    partitions: Vec<Partition>,
}

impl Engine {
    pub fn new() -> Result<Engine> {
        Engine::with_roots(EngineRoots::default())
    }

    pub fn with_roots(roots: EngineRoots) -> Result<Engine> {
        logging::init()?;
        let kfd = KfdHandle::new(&roots.kfd, &roots.kfd_debug)?;
        let drm = Drm::new(&roots.drm)?;

        // Bucket compute nodes by (domain, bus+device); any function folds
        // into the same device.
        let mut buckets: BTreeMap<u64, Vec<usize>> = BTreeMap::new();
        for (idx, node) in kfd.nodes().iter().enumerate() {
            let props = &node.properties;
            if props.simd_count == 0 {
                continue;
            }
            let key = props.domain_id << 16 | (props.location_id & 0xfff_fff8);
            debug!("adding KFD node {} to device {:#018x}", node.instance, key);
            buckets.entry(key).or_default().push(idx);
        }

        let mut devices = Vec::new();
        let mut partitions: Vec<Partition> = Vec::new();
        for (instance, node_idxs) in buckets.values().enumerate() {
            let first = &kfd.nodes()[node_idxs[0]].properties;
            let domain = first.domain_id as u32;
            let bdf = first.location_id as u32;

            let pci_dir = roots.pci.join(format!(
                "{:04x}:{:02x}:{:02x}.{:x}",
                domain,
                first.pci_bus(),
                first.pci_device(),
                first.pci_function()
            ));
            let ip_dir = pci_dir.join("ip_discovery");
            let ipdiscovery = if ip_dir.is_dir() {
                Some(IpDiscovery::load(&ip_dir)?)
            } else {
                None
            };

            let num_xcc: Vec<u64> = node_idxs
                .iter()
                .map(|&i| kfd.nodes()[i].properties.num_xcc.max(1))
                .collect();
            let xcc_die_ids = assign_xcc_die_ids(ipdiscovery.as_ref(), &num_xcc)?;

            let device_id = DeviceId(instance);
            let mut members = Vec::new();
            for (local_id, (&kfd_idx, die_ids)) in
                node_idxs.iter().zip(xcc_die_ids).enumerate()
            {
                let props = &kfd.nodes()[kfd_idx].properties;
                let drm_name = format!("renderD{}", props.drm_render_minor);
                let drm_idx = drm.node_by_name(&drm_name).ok_or_else(|| {
                    Error::OutOfRange(format!("no DRM node named {}", drm_name))
                })?;
                let debugfs = resolve_debugfs(&roots.dri_debug, props);
                let sram = debugfs.as_ref().and_then(|dbg| {
                    SramAccessor::open(Some(&dbg.iomem_path()), &roots.devmem).ok()
                });
                let global_id = PartitionId(partitions.len());
                members.push(global_id);
                partitions.push(Partition::new(
                    device_id, kfd_idx, drm_idx, local_id, global_id, die_ids, debugfs, sram,
                ));
            }
            devices.push(Device::new(instance as u32, domain, bdf, ipdiscovery, members));
        }

        Ok(Engine {
            kfd,
            drm,
            devices,
            partitions,
        })
    }

    pub fn kfd(&self) -> &KfdHandle {
        &self.kfd
    }

    pub fn drm(&self) -> &Drm {
        &self.drm
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device(&self, id: DeviceId) -> Result<&Device> {
        self.devices
            .get(id.0)
            .ok_or_else(|| Error::OutOfRange(format!("no device {}", id.0)))
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn partition(&self, id: PartitionId) -> Result<&Partition> {
        self.partitions
            .get(id.0)
            .ok_or_else(|| Error::OutOfRange(format!("no partition {}", id.0)))
    }

    /// The KFD node backing a partition.
    pub fn kfd_node(&self, id: PartitionId) -> Result<&KfdNode> {
        let part = self.partition(id)?;
        Ok(&self.kfd.nodes()[part.kfd_node_index()])
    }

    pub fn node_properties(&self, id: PartitionId) -> Result<&KfdNodeProperties> {
        Ok(&self.kfd_node(id)?.properties)
    }

    /// Reads a 32-bit register through a partition's aperture.
    pub fn read_reg32(&self, id: PartitionId, aperture: Aperture, reg: u64) -> Result<u32> {
        let dbg = self.partition(id)?.debugfs()?;
        match aperture {
            Aperture::Mmio => dbg.mmio().read32(reg),
            Aperture::Smn => dbg.smn_read32(reg),
        }
    }

    /// Writes a 32-bit register through a partition's aperture.
    pub fn write_reg32(
        &self,
        id: PartitionId,
        aperture: Aperture,
        reg: u64,
        value: u32,
    ) -> Result<()> {
        let dbg = self.partition(id)?.debugfs()?;
        match aperture {
            Aperture::Mmio => dbg.mmio().write32(reg, value),
            Aperture::Smn => dbg.smn_write32(reg, value),
        }
    }

    /// Reads linear memory through a partition; VRAM addresses are
    /// hive-global for XGMI members.
    pub fn read(
        &self,
        id: PartitionId,
        region: MemRegion,
        addr: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        match region {
            MemRegion::Vram => {
                let (part, local) = self.route_vram(id, addr)?;
                part.debugfs()?.vram().read(local, buf)
            }
            MemRegion::SystemRam => self.partition(id)?.sram()?.read(addr, buf),
        }
    }

    /// Writes linear memory through a partition; VRAM addresses are
    /// hive-global for XGMI members.
    pub fn write(
        &self,
        id: PartitionId,
        region: MemRegion,
        addr: u64,
        buf: &[u8],
    ) -> Result<usize> {
        match region {
            MemRegion::Vram => {
                let (part, local) = self.route_vram(id, addr)?;
                part.debugfs()?.vram().write(local, buf)
            }
            MemRegion::SystemRam => self.partition(id)?.sram()?.write(addr, buf),
        }
    }

    /// Resolves a (possibly hive-global) VRAM address to the partition whose
    /// `amdgpu_vram` file covers it and the offset local to that partition.
    ///
    /// The debugfs file only addresses the local VRAM of its own device, so
    /// hive members stack up in `physical_id` order, each occupying its VRAM
    /// size rounded up to a GiB.
    fn route_vram(&self, id: PartitionId, addr: u64) -> Result<(&Partition, u64)> {
        let part = self.partition(id)?;
        let node = &self.drm.nodes()[part.drm_node_index()];
        if node.xgmi.hive_id == 0 {
            return Ok((part, addr));
        }
        let rounded: Vec<u64> = node
            .xgmi
            .peers
            .iter()
            .map(|&i| round_up_gib(self.drm.nodes()[i].total_vram_bytes()))
            .collect();
        let (slot, local) = hive_route(&rounded, addr)?;
        let peer = &self.drm.nodes()[node.xgmi.peers[slot]];
        if peer.card_name() == node.card_name() {
            return Ok((part, local));
        }
        let owner = self
            .partitions
            .iter()
            .find(|p| self.drm.nodes()[p.drm_node_index()].xgmi.device_id == peer.xgmi.device_id)
            .ok_or_else(|| {
                Error::OutOfRange(
                    "no partition with the expected XGMI device id".to_string(),
                )
            })?;
        Ok((owner, local))
    }

    /// Snapshot of the active runlists from the KFD debugfs.
    pub fn runlists(&self) -> Result<Vec<Runlist>> {
        let text = self.kfd.debugfs()?.runlists()?;
        pm4::parse_runlists(&text)
    }

    /// Processes currently registered with KFD.
    pub fn processes(&self) -> Result<Vec<KfdProc>> {
        self.kfd.processes()
    }

    /// Register/memory source for the translator, bound to one partition.
    pub fn partition_io(&self, id: PartitionId) -> PartitionIo<'_> {
        PartitionIo { engine: self, id }
    }

    /// A translator for a VMID whose page tables live behind this partition.
    pub fn xlator(&self, id: PartitionId, vmid: u32) -> Result<Xlator<PartitionIo<'_>>> {
        let part = self.partition(id)?;
        let props = self.node_properties(id)?;
        let xcc_die_id = *part.xcc_die_ids().first().ok_or_else(|| {
            Error::CodeBug("partition carries no XCC die ids".to_string())
        })?;
        Xlator::new(
            self.partition_io(id),
            props.device_id as u32,
            xcc_die_id,
            vmid,
        )
    }

    /// Finds the page-table base the scheduler programmed for `pasid` on
    /// this partition's GPU.
    pub fn pt_base_for_pasid(&self, id: PartitionId, pasid: u32) -> Result<u64> {
        let gpu_id = self.kfd_node(id)?.gpu_id;
        let runlists = self.runlists()?;
        xlator::pt_base_from_runlists(&runlists, gpu_id, pasid)
    }

    /// Finds the VMID whose base registers hold `pt_base`.
    pub fn vmid_for_pt_base(&self, id: PartitionId, pt_base: u64) -> Result<u32> {
        let part = self.partition(id)?;
        let props = self.node_properties(id)?;
        let xcc_die_id = *part.xcc_die_ids().first().ok_or_else(|| {
            Error::CodeBug("partition carries no XCC die ids".to_string())
        })?;
        xlator::vmid_from_pt_base(
            &self.partition_io(id),
            props.device_id as u32,
            xcc_die_id,
            pt_base,
        )
    }

    /// Builds a translator for a process's address space: PID to PASID via
    /// the KFD process list, PASID to page-table base via the runlists, base
    /// to VMID via the VMID registers.
    pub fn xlator_for_process(
        &self,
        id: PartitionId,
        pid: u32,
    ) -> Result<Xlator<PartitionIo<'_>>> {
        let procs = self.processes()?;
        let pasid = procs
            .iter()
            .find(|p| p.pid == pid)
            .map(|p| p.pasid)
            .ok_or_else(|| Error::Generic(format!("pid {} is not a KFD process", pid)))?;
        let pt_base = self.pt_base_for_pasid(id, pasid)?;
        let vmid = self.vmid_for_pt_base(id, pt_base)?;
        self.xlator(id, vmid)
    }

    /// A translator for the calling process itself.
    pub fn xlator_for_current_process(&self, id: PartitionId) -> Result<Xlator<PartitionIo<'_>>> {
        self.xlator_for_process(id, std::process::id())
    }
}

/// [`TranslationSource`] over a partition: MMIO registers plus VRAM/system
/// memory entry reads.
#[derive(Clone, Copy)]
pub struct PartitionIo<'a> {
    engine: &'a Engine,
    id: PartitionId,
}

impl TranslationSource for PartitionIo<'_> {
    fn read_reg32(&self, reg: u64) -> Result<u32> {
        self.engine.read_reg32(self.id, Aperture::Mmio, reg)
    }

    fn read_entry(&self, addr: u64, system: bool) -> Result<u64> {
        let region = if system {
            MemRegion::SystemRam
        } else {
            MemRegion::Vram
        };
        let mut buf = [0u8; 8];
        let n = self.engine.read(self.id, region, addr, &mut buf)?;
        if n != buf.len() {
            return Err(Error::Generic(format!(
                "short page-table entry read at {:#018x}: {} bytes",
                addr, n
            )));
        }
        Ok(u64::from_ne_bytes(buf))
    }
}
