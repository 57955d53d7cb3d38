// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! DRM node shim.
//!
//! Walks `/sys/class/drm` to pair each node with its `card*`/`render*` device
//! names, its VRAM total, and its XGMI hive membership. Hive peers are held
//! as indices into the owning [`Drm`] table, ordered by `xgmi_physical_id` —
//! the order in which peers stack up in the hive-global address space.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, error, warn};

use crate::fsutil::read_u64_dec;
use crate::Result;

/// XGMI hive membership for one DRM node. `hive_id == 0` means the node is
/// not part of a hive.
#[derive(Debug, Default, Clone)]
pub struct XgmiInfo {
    pub hive_id: u64,
    pub device_id: u64,
    pub physical_id: u64,
    /// Hive peers as indices into [`Drm::nodes`], sorted by `physical_id`.
    pub peers: Vec<usize>,
}

/// One `/sys/class/drm` entry.
#[derive(Debug)]
pub struct DrmNode {
    path: PathBuf,
    name: String,
    card_name: String,
    render_name: String,
    pub xgmi: XgmiInfo,
}

impl DrmNode {
    fn load(path: &Path) -> DrmNode {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let mut card_name = String::new();
        let mut render_name = String::new();
        // The node's device directory lists the card/render names that belong
        // to the same device. Some kernels nest it one level deeper.
        let mut drm_dir = path.join("device").join("drm");
        if !drm_dir.is_dir() {
            drm_dir = path.join("device").join("device").join("drm");
        }
        if let Ok(entries) = fs::read_dir(&drm_dir) {
            for entry in entries.flatten() {
                if !entry.path().is_dir() {
                    continue;
                }
                let entry_name = entry.file_name().to_string_lossy().to_string();
                if card_name.is_empty() && entry_name.starts_with("card") {
                    card_name = entry_name;
                } else if render_name.is_empty() && entry_name.starts_with("render") {
                    render_name = entry_name;
                }
            }
        } else {
            warn!("no DRM subdirectory for node {}", name);
        }
        DrmNode {
            path: path.to_path_buf(),
            name,
            card_name,
            render_name,
            xgmi: XgmiInfo::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn card_name(&self) -> &str {
        &self.card_name
    }

    pub fn render_name(&self) -> &str {
        &self.render_name
    }

    /// Total VRAM in bytes, zero when the node exposes none.
    pub fn total_vram_bytes(&self) -> u64 {
        let path = self.path.join("device").join("mem_info_vram_total");
        read_u64_dec(&path).unwrap_or(0)
    }
}

/// The `/sys/class/drm` table.
#[derive(Debug)]
pub struct Drm {
    nodes: Vec<DrmNode>,
}

impl Drm {
    pub fn new(root: &Path) -> Result<Drm> {
        // Order the nodes by path so indices are stable across runs.
        let mut paths: Vec<PathBuf> = fs::read_dir(root)?
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        paths.sort();
        let nodes: Vec<DrmNode> = paths.iter().map(|p| DrmNode::load(p)).collect();
        let mut drm = Drm { nodes };
        for i in 0..drm.nodes.len() {
            let xgmi = drm.load_xgmi(i);
            drm.nodes[i].xgmi = xgmi;
        }
        Ok(drm)
    }

    fn load_xgmi(&self, index: usize) -> XgmiInfo {
        let node = &self.nodes[index];
        let device = node.path.join("device");
        let mut xgmi = XgmiInfo::default();

        let devid_path = device.join("xgmi_device_id");
        if !devid_path.exists() {
            debug!("DRM node {} is not part of an XGMI hive", node.name);
            return xgmi;
        }
        xgmi.device_id = read_u64_dec(&devid_path).unwrap_or(0);

        let physical_path = device.join("xgmi_physical_id");
        if !physical_path.exists() {
            debug!("DRM node {} has no xgmi_physical_id", node.name);
            return xgmi;
        }
        xgmi.physical_id = read_u64_dec(&physical_path).unwrap_or(0);

        let hive_info = device.join("xgmi_hive_info");
        if !hive_info.is_dir() {
            return xgmi;
        }
        xgmi.hive_id = read_u64_dec(&hive_info.join("xgmi_hive_id")).unwrap_or(0);
        debug!(
            "DRM node {} is in hive {} at slot {}",
            node.name, xgmi.hive_id, xgmi.physical_id
        );

        // Each subdirectory of the hive-info directory is a peer device; its
        // drm listing names the card node we already enumerated.
        let mut peer_dirs: Vec<PathBuf> = match fs::read_dir(&hive_info) {
            Ok(entries) => entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect(),
            Err(_) => return xgmi,
        };
        peer_dirs.sort();
        for peer_dir in peer_dirs {
            let mut found = None;
            if let Ok(entries) = fs::read_dir(peer_dir.join("drm")) {
                for entry in entries.flatten() {
                    let entry_name = entry.file_name().to_string_lossy().to_string();
                    if entry.path().is_dir() && entry_name.starts_with("card") {
                        found = self.node_by_name(&entry_name);
                        break;
                    }
                }
            }
            match found {
                Some(peer) => xgmi.peers.push(peer),
                None => {
                    error!(
                        "failed to resolve hive peer {} for DRM node {}",
                        peer_dir.display(),
                        node.name
                    );
                    xgmi.peers.clear();
                    return xgmi;
                }
            }
        }
        xgmi.peers.sort_by_key(|&i| {
            let peer = &self.nodes[i];
            read_u64_dec(&peer.path.join("device").join("xgmi_physical_id")).unwrap_or(0)
        });
        xgmi
    }

    pub fn nodes(&self) -> &[DrmNode] {
        &self.nodes
    }

    pub fn node_by_name(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, text: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, text).unwrap();
    }

    #[test]
    fn enumerates_and_names() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let card = root.join("card0");
        fs::create_dir_all(card.join("device").join("drm").join("card0")).unwrap();
        fs::create_dir_all(card.join("device").join("drm").join("renderD128")).unwrap();
        write(&card.join("device").join("mem_info_vram_total"), "68719476736\n");
        let render = root.join("renderD128");
        fs::create_dir_all(render.join("device").join("drm").join("card0")).unwrap();

        let drm = Drm::new(root).unwrap();
        assert_eq!(drm.nodes().len(), 2);
        let idx = drm.node_by_name("card0").unwrap();
        let node = &drm.nodes()[idx];
        assert_eq!(node.card_name(), "card0");
        assert_eq!(node.render_name(), "renderD128");
        assert_eq!(node.total_vram_bytes(), 64 << 30);
        assert_eq!(node.xgmi.hive_id, 0);
        assert!(drm.node_by_name("card7").is_none());
    }

    #[test]
    fn xgmi_hive_peers_sorted_by_physical_id() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for (name, devid, phys) in [("card0", 100u64, 1u64), ("card1", 101, 0)] {
            let device = root.join(name).join("device");
            fs::create_dir_all(device.join("drm").join(name)).unwrap();
            write(&device.join("xgmi_device_id"), &devid.to_string());
            write(&device.join("xgmi_physical_id"), &phys.to_string());
            let hive = device.join("xgmi_hive_info");
            write(&hive.join("xgmi_hive_id"), "777");
            for peer in ["card0", "card1"] {
                fs::create_dir_all(hive.join(format!("dev-{}", peer)).join("drm").join(peer))
                    .unwrap();
            }
        }
        let drm = Drm::new(root).unwrap();
        let c0 = drm.node_by_name("card0").unwrap();
        let node = &drm.nodes()[c0];
        assert_eq!(node.xgmi.hive_id, 777);
        assert_eq!(node.xgmi.device_id, 100);
        assert_eq!(node.xgmi.peers.len(), 2);
        // card1 has physical id 0 and must come first
        assert_eq!(drm.nodes()[node.xgmi.peers[0]].name(), "card1");
        assert_eq!(drm.nodes()[node.xgmi.peers[1]].name(), "card0");
    }
}
