// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Byte accessors over the amdgpu debugfs character devices.
//!
//! Four backends: 32-bit MMIO registers (`amdgpu_regs2`), SMN registers
//! indirected through the three RSMU MMIO registers, linear VRAM
//! (`amdgpu_vram`) and linear system memory (`amdgpu_iomem`, falling back to
//! `/dev/mem`). All I/O is positional (`pread`/`pwrite`), so each register
//! access is a single atomic syscall on the backing fd.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{debug, error, warn};

use crate::{Error, Result};

/// RSMU register offsets used for the SMN indirection.
#[derive(Debug, Clone, Copy)]
pub struct RsmuRegs {
    pub index_hi: u64,
    pub index: u64,
    pub data: u64,
}

impl Default for RsmuRegs {
    fn default() -> Self {
        RsmuRegs {
            index_hi: 0x58,
            index: 0x50,
            data: 0x54,
        }
    }
}

/// 32-bit register accessor over `amdgpu_regs2`.
#[derive(Debug)]
pub struct MmioAccessor {
    file: File,
}

impl MmioAccessor {
    pub fn open(path: &Path) -> Result<MmioAccessor> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                error!("failed to open {}: {}", path.display(), e);
                Error::Io(e)
            })?;
        Ok(MmioAccessor { file })
    }

    pub fn read32(&self, reg: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.file.read_exact_at(&mut buf, reg).map_err(|e| {
            error!("failed to read register {:#x}: {}", reg, e);
            Error::Io(e)
        })?;
        Ok(u32::from_ne_bytes(buf))
    }

    pub fn write32(&self, reg: u64, value: u32) -> Result<()> {
        self.file
            .write_all_at(&value.to_ne_bytes(), reg)
            .map_err(|e| {
                error!("failed to write register {:#x}: {}", reg, e);
                Error::Io(e)
            })
    }
}

/// Linear byte accessor over a seekable debugfs file.
#[derive(Debug)]
pub struct LinearAccessor {
    file: File,
    path: PathBuf,
}

impl LinearAccessor {
    pub fn open(path: &Path) -> Result<LinearAccessor> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                error!("failed to open {}: {}", path.display(), e);
                Error::Io(e)
            })?;
        Ok(LinearAccessor {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn read(&self, address: u64, buf: &mut [u8]) -> Result<usize> {
        self.file.read_at(buf, address).map_err(|e| {
            warn!("{}: read at {:#018x} failed: {}", self.path.display(), address, e);
            Error::Io(e)
        })
    }

    pub fn write(&self, address: u64, buf: &[u8]) -> Result<usize> {
        self.file.write_at(buf, address).map_err(|e| {
            warn!("{}: write at {:#018x} failed: {}", self.path.display(), address, e);
            Error::Io(e)
        })
    }
}

/// System-memory accessor: `amdgpu_iomem` when available, with a `/dev/mem`
/// fallback that retries the same request on any IOMEM failure.
#[derive(Debug)]
pub struct SramAccessor {
    iomem: Option<LinearAccessor>,
    devmem: File,
}

impl SramAccessor {
    pub fn open(iomem_path: Option<&Path>, devmem_path: &Path) -> Result<SramAccessor> {
        let iomem = match iomem_path {
            Some(path) => match LinearAccessor::open(path) {
                Ok(a) => Some(a),
                Err(e) => {
                    warn!("iomem unavailable, using {} only: {}", devmem_path.display(), e);
                    None
                }
            },
            None => None,
        };
        let devmem = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_DSYNC)
            .open(devmem_path)
            .map_err(|e| {
                error!("failed to open {}: {}", devmem_path.display(), e);
                Error::Io(e)
            })?;
        Ok(SramAccessor { iomem, devmem })
    }

    pub fn read(&self, address: u64, buf: &mut [u8]) -> Result<usize> {
        if let Some(iomem) = &self.iomem {
            match iomem.read(address, buf) {
                Ok(n) => return Ok(n),
                Err(e) => debug!("iomem read failed, retrying via /dev/mem: {}", e),
            }
        }
        Ok(self.devmem.read_at(buf, address)?)
    }

    pub fn write(&self, address: u64, buf: &[u8]) -> Result<usize> {
        if let Some(iomem) = &self.iomem {
            match iomem.write(address, buf) {
                Ok(n) => return Ok(n),
                Err(e) => debug!("iomem write failed, retrying via /dev/mem: {}", e),
            }
        }
        Ok(self.devmem.write_at(buf, address)?)
    }
}

/// The per-partition bundle of amdgpu debugfs accessors.
///
/// SMN access is a stateful three-register sequence through the shared RSMU
/// window, so it is serialised here; plain MMIO accesses are not.
#[derive(Debug)]
pub struct AmdGpuDebugFs {
    root: PathBuf,
    mmio: MmioAccessor,
    vram: LinearAccessor,
    iomem: LinearAccessor,
    rsmu: RsmuRegs,
    smn_lock: Mutex<()>,
}

impl AmdGpuDebugFs {
    pub fn open(root: &Path) -> Result<AmdGpuDebugFs> {
        AmdGpuDebugFs::open_with_rsmu(root, RsmuRegs::default())
    }

    /// Opens the accessor bundle with non-default RSMU window offsets.
    pub fn open_with_rsmu(root: &Path, rsmu: RsmuRegs) -> Result<AmdGpuDebugFs> {
        let dbg = AmdGpuDebugFs {
            root: root.to_path_buf(),
            mmio: MmioAccessor::open(&root.join("amdgpu_regs2"))?,
            vram: LinearAccessor::open(&root.join("amdgpu_vram"))?,
            iomem: LinearAccessor::open(&root.join("amdgpu_iomem"))?,
            rsmu,
            smn_lock: Mutex::new(()),
        };
        debug!("opened amdgpu debugfs at {}", root.display());
        Ok(dbg)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn iomem_path(&self) -> PathBuf {
        self.root.join("amdgpu_iomem")
    }

    pub fn mmio(&self) -> &MmioAccessor {
        &self.mmio
    }

    pub fn vram(&self) -> &LinearAccessor {
        &self.vram
    }

    pub fn iomem(&self) -> &LinearAccessor {
        &self.iomem
    }

    pub fn smn_read32(&self, reg: u64) -> Result<u32> {
        let _guard = self.smn_lock.lock().expect("smn lock poisoned");
        self.mmio.write32(self.rsmu.index_hi, ((reg >> 32) & 0xff) as u32)?;
        self.mmio.write32(self.rsmu.index, (reg & 0xffff_ffff) as u32)?;
        self.mmio.read32(self.rsmu.data)
    }

    pub fn smn_write32(&self, reg: u64, value: u32) -> Result<()> {
        let _guard = self.smn_lock.lock().expect("smn lock poisoned");
        self.mmio.write32(self.rsmu.index_hi, ((reg >> 32) & 0xff) as u32)?;
        self.mmio.write32(self.rsmu.index, (reg & 0xffff_ffff) as u32)?;
        self.mmio.write32(self.rsmu.data, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn mmio_read32_is_positional() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("amdgpu_regs2");
        let mut f = File::create(&path).unwrap();
        f.write_all(&[0u8; 16]).unwrap();
        f.write_all(&0xdead_beefu32.to_ne_bytes()).unwrap();
        drop(f);

        let mmio = MmioAccessor::open(&path).unwrap();
        assert_eq!(mmio.read32(16).unwrap(), 0xdead_beef);
        assert_eq!(mmio.read32(0).unwrap(), 0);
        mmio.write32(4, 0x1234_5678).unwrap();
        assert_eq!(mmio.read32(4).unwrap(), 0x1234_5678);
        // out-of-file read fails instead of returning junk
        assert!(mmio.read32(4096).is_err());
    }

    #[test]
    fn sram_falls_back_to_devmem() {
        let dir = tempfile::tempdir().unwrap();
        let devmem = dir.path().join("mem");
        let mut f = File::create(&devmem).unwrap();
        f.write_all(&[0xaa; 8]).unwrap();
        drop(f);

        // No iomem at all: straight to the fallback.
        let sram = SramAccessor::open(None, &devmem).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(sram.read(2, &mut buf).unwrap(), 4);
        assert_eq!(buf, [0xaa; 4]);

        // Unopenable iomem path degrades to the fallback as well.
        let sram = SramAccessor::open(Some(&dir.path().join("missing")), &devmem).unwrap();
        assert_eq!(sram.read(0, &mut buf).unwrap(), 4);
        sram.write(0, &[1, 2]).unwrap();
        assert_eq!(sram.read(0, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..2], &[1, 2]);
    }
}
