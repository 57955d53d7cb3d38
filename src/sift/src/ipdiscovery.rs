// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! IP-discovery table shim.
//!
//! Reads the per-device discovery tree the kernel exports under
//! `/sys/bus/pci/devices/<bdf>/ip_discovery`: one directory per die, one per
//! IP block, one per block instance. The topology model only consumes the
//! `GC` instances, but the whole tree is loaded so tools can inspect it.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::debug;

use crate::fsutil::{parse_u64_auto, read_trimmed, read_u64_dec};
use crate::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct IpInstance {
    pub num_instance: u8,
    pub base_addrs: Vec<u64>,
    pub harvest: u8,
    pub hw_id: u16,
    pub major: u8,
    pub minor: u8,
    pub revision: u8,
}

impl IpInstance {
    fn load(path: &Path) -> Result<IpInstance> {
        let base_text = read_trimmed(&path.join("base_addr"))?;
        let base_addrs: Vec<u64> = base_text
            .lines()
            .map(|l| parse_u64_auto(l))
            .collect::<Result<_>>()?;
        let num_base_addresses = parse_u64_auto(&read_trimmed(&path.join("num_base_addresses"))?)?;
        if base_addrs.len() as u64 != num_base_addresses {
            return Err(Error::OutOfRange(format!(
                "{}: num_base_addresses says {} but base_addr lists {}",
                path.display(),
                num_base_addresses,
                base_addrs.len()
            )));
        }
        Ok(IpInstance {
            num_instance: read_u64_dec(&path.join("num_instance"))? as u8,
            base_addrs,
            harvest: parse_u64_auto(&read_trimmed(&path.join("harvest"))?)? as u8,
            hw_id: parse_u64_auto(&read_trimmed(&path.join("hw_id"))?)? as u16,
            major: parse_u64_auto(&read_trimmed(&path.join("major"))?)? as u8,
            minor: parse_u64_auto(&read_trimmed(&path.join("minor"))?)? as u8,
            revision: parse_u64_auto(&read_trimmed(&path.join("revision"))?)? as u8,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct Ip {
    pub name: String,
    pub instances: Vec<IpInstance>,
}

impl Ip {
    fn load(path: &Path) -> Result<Ip> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let mut instances = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            if entry.path().is_dir() {
                instances.push(IpInstance::load(&entry.path())?);
            }
        }
        instances.sort_by_key(|i| i.num_instance);
        Ok(Ip { name, instances })
    }
}

#[derive(Debug, Clone, Default)]
pub struct Die {
    pub id: u32,
    pub ips: BTreeMap<String, Ip>,
}

impl Die {
    fn load(path: &Path) -> Result<Die> {
        let id = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.parse::<u32>().ok())
            .ok_or_else(|| Error::Generic(format!("bad die directory {}", path.display())))?;
        let mut ips = BTreeMap::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            if entry.path().is_dir() {
                let ip = Ip::load(&entry.path())?;
                ips.insert(ip.name.clone(), ip);
            }
        }
        Ok(Die { id, ips })
    }

    pub fn ip(&self, name: &str) -> Option<&Ip> {
        self.ips.get(name)
    }
}

/// One device's discovery table, dies sorted by id.
#[derive(Debug, Clone, Default)]
pub struct IpDiscovery {
    pub dies: Vec<Die>,
}

impl IpDiscovery {
    /// Loads the table rooted at `<pci device>/ip_discovery`.
    pub fn load(root: &Path) -> Result<IpDiscovery> {
        debug!("loading IP discovery table at {}", root.display());
        let mut dies = Vec::new();
        for entry in fs::read_dir(root.join("die"))? {
            let entry = entry?;
            if entry.path().is_dir() {
                dies.push(Die::load(&entry.path())?);
            }
        }
        dies.sort_by_key(|d| d.id);
        Ok(IpDiscovery { dies })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, text: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, text).unwrap();
    }

    fn fake_instance(root: &Path, die: u32, ip: &str, inst: u32, num_instance: u32, harvest: u32) {
        let dir = root
            .join("die")
            .join(die.to_string())
            .join(ip)
            .join(inst.to_string());
        write(&dir.join("num_instance"), &num_instance.to_string());
        write(&dir.join("base_addr"), "0x1000\n0x2000\n");
        write(&dir.join("num_base_addresses"), "2");
        write(&dir.join("harvest"), &harvest.to_string());
        write(&dir.join("hw_id"), "11");
        write(&dir.join("major"), "9");
        write(&dir.join("minor"), "4");
        write(&dir.join("revision"), "2");
    }

    #[test]
    fn loads_tree() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fake_instance(root, 0, "GC", 1, 1, 0);
        fake_instance(root, 0, "GC", 0, 0, 0);
        fake_instance(root, 0, "SDMA0", 0, 0, 0);

        let table = IpDiscovery::load(root).unwrap();
        assert_eq!(table.dies.len(), 1);
        let gc = table.dies[0].ip("GC").unwrap();
        assert_eq!(gc.instances.len(), 2);
        // sorted by num_instance
        assert_eq!(gc.instances[0].num_instance, 0);
        assert_eq!(gc.instances[1].num_instance, 1);
        assert_eq!(gc.instances[0].base_addrs, vec![0x1000, 0x2000]);
        assert_eq!(gc.instances[0].major, 9);
        assert!(table.dies[0].ip("VCN").is_none());
    }

    #[test]
    fn base_addr_count_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fake_instance(root, 0, "GC", 0, 0, 0);
        write(
            &root
                .join("die")
                .join("0")
                .join("GC")
                .join("0")
                .join("num_base_addresses"),
            "3",
        );
        assert!(matches!(
            IpDiscovery::load(root),
            Err(Error::OutOfRange(_))
        ));
    }
}
