// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! KFD topology shim.
//!
//! Parses the compute-topology view the Kernel Fusion Driver exports under
//! `/sys/class/kfd/kfd`: one node per spatial partition, a properties file of
//! `key value` lines per node, and one directory per process that currently
//! holds a PASID. The debugfs side exposes the raw command-processor runlist
//! text consumed by [`crate::pm4`].

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use regex::Regex;

use crate::fsutil::read_u64_dec;
use crate::{Error, Result};

const DEVID_OVERRIDE_ENV: &str = "ROCSIFT_DEVID_OVERRIDE";

/// Parsed `topology/nodes/<id>/properties` record. Keys the parser does not
/// know are ignored; keys absent from the file stay zero.
#[derive(Debug, Default, Clone)]
pub struct KfdNodeProperties {
    pub cpu_cores_count: u64,
    pub simd_count: u64,
    pub mem_banks_count: u64,
    pub caches_count: u64,
    pub io_links_count: u64,
    pub gfx_target_version: u64,
    pub vendor_id: u64,
    pub device_id: u64,
    pub location_id: u64,
    pub domain_id: u64,
    pub drm_render_minor: u64,
    pub hive_id: u64,
    pub num_sdma_engines: u64,
    pub num_cp_queues: u64,
    pub local_mem_size: u64,
    pub fw_version: u64,
    pub capability: u64,
    pub unique_id: u64,
    pub num_xcc: u64,
    pub max_engine_clk_fcompute: u64,
}

impl KfdNodeProperties {
    /// PCI bus number packed into `location_id`.
    pub fn pci_bus(&self) -> u32 {
        ((self.location_id >> 8) & 0xff) as u32
    }

    /// PCI device number packed into `location_id`.
    pub fn pci_device(&self) -> u32 {
        ((self.location_id >> 3) & 0x1f) as u32
    }

    /// PCI function number packed into `location_id`.
    pub fn pci_function(&self) -> u32 {
        (self.location_id & 0x7) as u32
    }
}

fn parse_properties(text: &str) -> KfdNodeProperties {
    let mut props = KfdNodeProperties::default();
    for line in text.lines() {
        let mut it = line.split_whitespace();
        let (key, value) = match (it.next(), it.next()) {
            (Some(k), Some(v)) => (k, v),
            _ => continue,
        };
        let value: u64 = match value.parse() {
            Ok(v) => v,
            Err(_) => continue,
        };
        match key {
            "cpu_cores_count" => props.cpu_cores_count = value,
            "simd_count" => props.simd_count = value,
            "mem_banks_count" => props.mem_banks_count = value,
            "caches_count" => props.caches_count = value,
            "io_links_count" => props.io_links_count = value,
            "gfx_target_version" => props.gfx_target_version = value,
            "vendor_id" => props.vendor_id = value,
            "device_id" => props.device_id = value,
            "location_id" => props.location_id = value,
            "domain" => props.domain_id = value,
            "drm_render_minor" => props.drm_render_minor = value,
            "hive_id" => props.hive_id = value,
            "num_sdma_engines" => props.num_sdma_engines = value,
            "num_cp_queues" => props.num_cp_queues = value,
            "local_mem_size" => props.local_mem_size = value,
            "fw_version" => props.fw_version = value,
            "capability" => props.capability = value,
            "unique_id" => props.unique_id = value,
            "num_xcc" => props.num_xcc = value,
            "max_engine_clk_fcompute" => props.max_engine_clk_fcompute = value,
            _ => {}
        }
    }
    props
}

/// One `ROCSIFT_DEVID_OVERRIDE` entry: a PCI coordinate and the device id to
/// substitute for nodes at that coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevidOverride {
    pub domain: u32,
    pub bus: u32,
    pub device: u32,
    pub function: u32,
    pub device_id: u32,
}

/// Parses the override list, e.g. `0.83:00.0->0x753,0.04:00.0->0x74a1`.
/// Any malformed entry fails the whole list.
pub fn parse_devid_overrides(text: &str) -> Result<Vec<DevidOverride>> {
    let entry_re = Regex::new(
        r"^([0-9a-fA-F]+)[.:]([0-9a-fA-F]+):([0-9a-fA-F]+)\.([0-9a-fA-F]+)->(0[xX])?([0-9a-fA-F]+)$",
    )
    .expect("override regex");
    let mut overrides = Vec::new();
    for entry in text.split(',') {
        let caps = entry_re.captures(entry.trim()).ok_or_else(|| {
            Error::Generic(format!(
                "invalid {} entry {:?}, expected e.g. 0.83:00.0->0x753",
                DEVID_OVERRIDE_ENV, entry
            ))
        })?;
        let hex = |i: usize| u32::from_str_radix(&caps[i], 16);
        overrides.push(DevidOverride {
            domain: hex(1).map_err(|e| Error::Generic(e.to_string()))?,
            bus: hex(2).map_err(|e| Error::Generic(e.to_string()))?,
            device: hex(3).map_err(|e| Error::Generic(e.to_string()))?,
            function: hex(4).map_err(|e| Error::Generic(e.to_string()))?,
            device_id: hex(6).map_err(|e| Error::Generic(e.to_string()))?,
        });
    }
    Ok(overrides)
}

fn apply_devid_overrides(props: &mut KfdNodeProperties, overrides: &[DevidOverride]) {
    for o in overrides {
        if o.domain as u64 == props.domain_id
            && o.bus == props.pci_bus()
            && o.device == props.pci_device()
            && o.function == props.pci_function()
        {
            info!(
                "device-id override {:04x}:{:02x}:{:02x}.{:x} {:#06x} -> {:#06x}",
                o.domain, o.bus, o.device, o.function, props.device_id, o.device_id
            );
            props.device_id = o.device_id as u64;
        }
    }
}

fn overrides_from_env() -> Result<Vec<DevidOverride>> {
    match std::env::var(DEVID_OVERRIDE_ENV) {
        Ok(text) => parse_devid_overrides(&text),
        Err(_) => Ok(Vec::new()),
    }
}

/// One KFD topology node.
#[derive(Debug)]
pub struct KfdNode {
    pub instance: u32,
    pub gpu_id: u32,
    pub properties: KfdNodeProperties,
    path: PathBuf,
}

impl KfdNode {
    fn load(path: &Path, overrides: &[DevidOverride]) -> Result<KfdNode> {
        let instance = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.parse::<u32>().ok())
            .ok_or_else(|| {
                Error::Generic(format!("bad KFD node directory {}", path.display()))
            })?;
        let mut properties = parse_properties(&fs::read_to_string(path.join("properties"))?);
        apply_devid_overrides(&mut properties, overrides);
        let gpu_id = read_u64_dec(&path.join("gpu_id"))? as u32;
        Ok(KfdNode {
            instance,
            gpu_id,
            properties,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A process currently registered with KFD.
#[derive(Debug, Clone, Copy)]
pub struct KfdProc {
    pub pid: u32,
    pub pasid: u32,
}

/// The KFD debugfs root, readable only by root.
#[derive(Debug)]
pub struct KfdDebugFs {
    root: PathBuf,
}

impl KfdDebugFs {
    pub fn open(root: &Path) -> Result<KfdDebugFs> {
        if !root.is_dir() {
            return Err(Error::NotPrivileged(format!(
                "KFD debugfs root {} is not accessible",
                root.display()
            )));
        }
        Ok(KfdDebugFs {
            root: root.to_path_buf(),
        })
    }

    /// The raw runlist dump for all nodes.
    pub fn runlists(&self) -> Result<String> {
        Ok(fs::read_to_string(self.root.join("rls"))?)
    }
}

/// The KFD topology: all nodes, sorted by instance, plus the debugfs handle
/// when this process is privileged enough to open it.
#[derive(Debug)]
pub struct KfdHandle {
    root: PathBuf,
    nodes: Vec<KfdNode>,
    debugfs: Option<KfdDebugFs>,
}

impl KfdHandle {
    pub fn new(root: &Path, debug_root: &Path) -> Result<KfdHandle> {
        let overrides = overrides_from_env()?;
        let topo = root.join("kfd").join("topology").join("nodes");
        let mut nodes = Vec::new();
        for entry in fs::read_dir(&topo)? {
            let entry = entry?;
            if entry.path().is_dir() {
                nodes.push(KfdNode::load(&entry.path(), &overrides)?);
            }
        }
        nodes.sort_by_key(|n| n.instance);
        debug!("KFD topology at {}: {} nodes", topo.display(), nodes.len());
        let debugfs = match KfdDebugFs::open(debug_root) {
            Ok(d) => Some(d),
            Err(e) => {
                warn!("{}", e);
                None
            }
        };
        Ok(KfdHandle {
            root: root.to_path_buf(),
            nodes,
            debugfs,
        })
    }

    pub fn nodes(&self) -> &[KfdNode] {
        &self.nodes
    }

    pub fn debugfs(&self) -> Result<&KfdDebugFs> {
        self.debugfs.as_ref().ok_or_else(|| {
            Error::NotPrivileged("KFD debugfs interface unavailable".to_string())
        })
    }

    /// Enumerates the processes under `proc/<pid>/pasid`.
    pub fn processes(&self) -> Result<Vec<KfdProc>> {
        let mut procs = Vec::new();
        for entry in fs::read_dir(self.root.join("kfd").join("proc"))? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let pid = match entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) {
                Some(pid) => pid,
                None => continue,
            };
            let pasid = read_u64_dec(&entry.path().join("pasid"))? as u32;
            procs.push(KfdProc { pid, pasid });
        }
        Ok(procs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROPERTIES: &str = "\
cpu_cores_count 0
simd_count 304
mem_banks_count 1
caches_count 148
io_links_count 1
gfx_target_version 90402
vendor_id 4098
device_id 29857
location_id 8960
domain 3
drm_render_minor 128
hive_id 55211970
num_sdma_engines 2
num_cp_queues 24
num_xcc 2
max_engine_clk_fcompute 2100
some_future_key 42
";

    #[test]
    fn properties_parse() {
        let p = parse_properties(PROPERTIES);
        assert_eq!(p.simd_count, 304);
        assert_eq!(p.device_id, 29857);
        assert_eq!(p.location_id, 8960);
        assert_eq!(p.domain_id, 3);
        assert_eq!(p.drm_render_minor, 128);
        assert_eq!(p.num_xcc, 2);
        // absent keys stay zero
        assert_eq!(p.local_mem_size, 0);
        assert_eq!(p.fw_version, 0);
    }

    #[test]
    fn pci_coordinates() {
        let p = KfdNodeProperties {
            location_id: 0x2300 | (4 << 3) | 5,
            ..Default::default()
        };
        assert_eq!(p.pci_bus(), 0x23);
        assert_eq!(p.pci_device(), 4);
        assert_eq!(p.pci_function(), 5);
    }

    #[test]
    fn override_parse() {
        let o = parse_devid_overrides("0.83:00.0->0x753,1:04:1f.7->74a1").unwrap();
        assert_eq!(
            o[0],
            DevidOverride {
                domain: 0,
                bus: 0x83,
                device: 0,
                function: 0,
                device_id: 0x753
            }
        );
        assert_eq!(o[1].domain, 1);
        assert_eq!(o[1].bus, 4);
        assert_eq!(o[1].device, 0x1f);
        assert_eq!(o[1].function, 7);
        assert_eq!(o[1].device_id, 0x74a1);
    }

    #[test]
    fn override_parse_rejects_garbage() {
        assert!(parse_devid_overrides("0.83:00.0").is_err());
        assert!(parse_devid_overrides("0.83:00.0->0x753,junk").is_err());
        assert!(parse_devid_overrides("->0x753").is_err());
    }

    #[test]
    fn override_applies_only_on_match() {
        let mut props = KfdNodeProperties {
            domain_id: 0,
            location_id: 0x8300,
            device_id: 0x66a1,
            ..Default::default()
        };
        let overrides = parse_devid_overrides("0.83:00.0->0x74a1,0.84:00.0->0x1234").unwrap();
        apply_devid_overrides(&mut props, &overrides);
        assert_eq!(props.device_id, 0x74a1);

        let mut other = KfdNodeProperties {
            domain_id: 2,
            location_id: 0x8300,
            device_id: 0x66a1,
            ..Default::default()
        };
        apply_devid_overrides(&mut other, &overrides);
        assert_eq!(other.device_id, 0x66a1);
    }

    #[test]
    fn nodes_from_tree() {
        let dir = tempfile::tempdir().unwrap();
        let topo = dir.path().join("kfd").join("topology").join("nodes");
        for (i, gpu_id) in [(0u32, 0u32), (1, 0x1576)] {
            let node = topo.join(i.to_string());
            std::fs::create_dir_all(&node).unwrap();
            std::fs::write(node.join("properties"), PROPERTIES).unwrap();
            std::fs::write(node.join("gpu_id"), format!("{}\n", gpu_id)).unwrap();
        }
        let kfd = KfdHandle::new(dir.path(), &dir.path().join("nope")).unwrap();
        assert_eq!(kfd.nodes().len(), 2);
        assert_eq!(kfd.nodes()[1].instance, 1);
        assert_eq!(kfd.nodes()[1].gpu_id, 0x1576);
        assert!(kfd.debugfs().is_err());
    }

    #[test]
    fn process_list_from_tree() {
        let dir = tempfile::tempdir().unwrap();
        let proc_root = dir.path().join("kfd").join("proc");
        let p = proc_root.join("4242");
        std::fs::create_dir_all(&p).unwrap();
        std::fs::write(p.join("pasid"), "32770\n").unwrap();
        std::fs::create_dir_all(dir.path().join("kfd").join("topology").join("nodes")).unwrap();
        let kfd = KfdHandle::new(dir.path(), &dir.path().join("nope")).unwrap();
        let procs = kfd.processes().unwrap();
        assert_eq!(procs.len(), 1);
        assert_eq!(procs[0].pid, 4242);
        assert_eq!(procs[0].pasid, 32770);
    }
}
