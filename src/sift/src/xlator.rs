// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! GPU virtual-to-physical address translation.
//!
//! A [`Xlator`] is bound to one VMID of one partition and reproduces the
//! memory controller's walk in software: it reads the VM-context registers to
//! find the page-table root, then walks up to four levels of directory and
//! table entries held in VRAM or system memory. The VMID itself is found by
//! scanning the active runlists for a process's PASID and matching the
//! programmed page-table base against the sixteen VMID base registers.
//!
//! Register and memory reads go through the [`TranslationSource`] trait so
//! the walker can be exercised against synthetic page tables.

use log::error;

use crate::chip;
use crate::pm4::{Body, Runlist};
use crate::{Error, Result};

/// Per-XCC stride between GFX hub register apertures.
pub const GFXHUB_STRIDE: u64 = 0x40000;

pub fn gfxhub_offset(xcc_die_id: u32) -> u64 {
    GFXHUB_STRIDE * xcc_die_id as u64
}

const LOG2_4KIB: u32 = 12;
const LOG2_PDB_ENTRIES: u32 = 9;
const LOG2_2MIB: u32 = 21;
const ENTRY_BYTES: u64 = 8;
const PT_MAX_DEPTH: usize = 3;
const NUM_VMIDS: u32 = 16;

/// True when the translator has register offset tables for this device.
pub fn device_supported(device_id: u32) -> bool {
    chip::is_vega20(device_id) || chip::is_mi200(device_id) || chip::is_mi3xx(device_id)
}

fn unsupported(device_id: u32) -> Error {
    Error::Generic(format!(
        "device id {:#06x} is not supported by the translator",
        device_id
    ))
}

fn vm_context0_pt_base_lo32(device_id: u32) -> Result<u64> {
    if chip::is_mi3xx(device_id) {
        return Ok(0xA32C);
    }
    if chip::is_vega20(device_id) || chip::is_mi200(device_id) {
        return Ok(0xA3AC);
    }
    Err(unsupported(device_id))
}

fn vm_context0_pt_base_hi32(device_id: u32) -> Result<u64> {
    if chip::is_mi3xx(device_id) {
        return Ok(0xA330);
    }
    if chip::is_vega20(device_id) || chip::is_mi200(device_id) {
        return Ok(0xA3B0);
    }
    Err(unsupported(device_id))
}

fn vm_context0_pt_start_lo32(device_id: u32) -> Result<u64> {
    if chip::is_mi3xx(device_id) {
        return Ok(0xA3AC);
    }
    if chip::is_vega20(device_id) || chip::is_mi200(device_id) {
        return Ok(0xA42C);
    }
    Err(unsupported(device_id))
}

fn vm_context0_pt_start_hi32(device_id: u32) -> Result<u64> {
    if chip::is_mi3xx(device_id) {
        return Ok(0xA3B0);
    }
    if chip::is_vega20(device_id) || chip::is_mi200(device_id) {
        return Ok(0xA430);
    }
    Err(unsupported(device_id))
}

fn vm_context0_pt_end_lo32(device_id: u32) -> Result<u64> {
    if chip::is_mi3xx(device_id) {
        return Ok(0xA42C);
    }
    if chip::is_vega20(device_id) || chip::is_mi200(device_id) {
        return Ok(0xA4AC);
    }
    Err(unsupported(device_id))
}

fn vm_context0_pt_end_hi32(device_id: u32) -> Result<u64> {
    if chip::is_mi3xx(device_id) {
        return Ok(0xA430);
    }
    if chip::is_vega20(device_id) || chip::is_mi200(device_id) {
        return Ok(0xA4B0);
    }
    Err(unsupported(device_id))
}

fn vm_context0_cntl(device_id: u32) -> Result<u64> {
    if chip::is_mi3xx(device_id) {
        return Ok(0xA180);
    }
    if chip::is_vega20(device_id) || chip::is_mi200(device_id) {
        return Ok(0xA200);
    }
    Err(unsupported(device_id))
}

fn mc_vm_fb_offset_base(device_id: u32) -> Result<u64> {
    if chip::is_mi3xx(device_id) {
        return Ok(0xA51C);
    }
    if chip::is_vega20(device_id) || chip::is_mi200(device_id) {
        return Ok(0xA5AC);
    }
    Err(unsupported(device_id))
}

fn bits(val: u64, msb: u32, lsb: u32) -> u64 {
    let mask = ((1u64 << msb) - 1) * 2 + 1;
    (val & mask) >> lsb
}

/// Decoded page-directory entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pde {
    pub valid: bool,
    pub system: bool,
    pub coherent: bool,
    /// Child table address; stored shifted by 6 in the raw entry.
    pub base_address: u64,
    /// PDE-as-PTE: this entry terminates the walk at its own level.
    pub pte: bool,
    /// log2 number of 4 KiB pages each PTE below this PDE maps.
    pub block_fragment_size: u8,
}

impl Pde {
    pub fn decode(raw: u64) -> Pde {
        Pde {
            valid: bits(raw, 0, 0) != 0,
            system: bits(raw, 1, 1) != 0,
            coherent: bits(raw, 2, 2) != 0,
            base_address: bits(raw, 47, 6) << 6,
            pte: bits(raw, 54, 54) != 0,
            block_fragment_size: bits(raw, 63, 59) as u8,
        }
    }
}

/// Decoded page-table entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pte {
    pub valid: bool,
    pub system: bool,
    pub coherent: bool,
    pub tmz: bool,
    pub execute: bool,
    pub read: bool,
    pub write: bool,
    pub fragment: u8,
    /// Page address; stored shifted by 12 in the raw entry.
    pub base_address: u64,
    pub tiled: bool,
    pub sw: u8,
    pub pte: bool,
    pub log: bool,
    /// The entry points at one more level of 4 KiB PTEs.
    pub translate_further: bool,
    pub mtype: u8,
}

impl Pte {
    pub fn decode(raw: u64) -> Pte {
        Pte {
            valid: bits(raw, 0, 0) != 0,
            system: bits(raw, 1, 1) != 0,
            coherent: bits(raw, 2, 2) != 0,
            tmz: bits(raw, 3, 3) != 0,
            execute: bits(raw, 4, 4) != 0,
            read: bits(raw, 5, 5) != 0,
            write: bits(raw, 6, 6) != 0,
            fragment: bits(raw, 11, 7) as u8,
            base_address: bits(raw, 47, 12) << 12,
            tiled: bits(raw, 51, 51) != 0,
            sw: bits(raw, 53, 52) as u8,
            pte: bits(raw, 54, 54) != 0,
            log: bits(raw, 55, 55) != 0,
            translate_further: bits(raw, 56, 56) != 0,
            mtype: bits(raw, 58, 57) as u8,
        }
    }
}

/// Register and memory reads the walker needs from a partition.
pub trait TranslationSource {
    /// Reads a 32-bit MMIO register.
    fn read_reg32(&self, reg: u64) -> Result<u32>;
    /// Reads an 8-byte page-table entry from VRAM or system memory.
    fn read_entry(&self, addr: u64, system: bool) -> Result<u64>;
}

/// MMIO addresses of one VMID's VM-context registers.
///
/// 64-bit base/start/end registers stride 8 bytes per VMID, the 32-bit
/// control register strides 4; the framebuffer offset is shared.
#[derive(Debug, Clone, Copy)]
pub struct VmContextRegs {
    pub pt_base_lo: u64,
    pub pt_base_hi: u64,
    pub pt_start_lo: u64,
    pub pt_start_hi: u64,
    pub pt_end_lo: u64,
    pub pt_end_hi: u64,
    pub cntl: u64,
    pub fb_offset: u64,
}

impl VmContextRegs {
    pub fn for_vmid(device_id: u32, xcc_die_id: u32, vmid: u32) -> Result<VmContextRegs> {
        if vmid >= NUM_VMIDS {
            return Err(Error::OutOfRange(format!("vmid {} out of range", vmid)));
        }
        let hub = gfxhub_offset(xcc_die_id);
        let wide = 8 * vmid as u64;
        Ok(VmContextRegs {
            pt_base_lo: hub + wide + vm_context0_pt_base_lo32(device_id)?,
            pt_base_hi: hub + wide + vm_context0_pt_base_hi32(device_id)?,
            pt_start_lo: hub + wide + vm_context0_pt_start_lo32(device_id)?,
            pt_start_hi: hub + wide + vm_context0_pt_start_hi32(device_id)?,
            pt_end_lo: hub + wide + vm_context0_pt_end_lo32(device_id)?,
            pt_end_hi: hub + wide + vm_context0_pt_end_hi32(device_id)?,
            cntl: hub + 4 * vmid as u64 + vm_context0_cntl(device_id)?,
            fb_offset: hub + mc_vm_fb_offset_base(device_id)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct LevelInfo {
    pde_size_shift: u32,
    num_pdes: u64,
}

/// Per-walk state: context-register snapshot, level geometry and the
/// one-entry-per-level read cache. Recreated for every range translation, so
/// the cache never leaks between unrelated walks.
struct WalkHelper {
    pt_block_size: u32,
    pt_depth: u32,
    pt_start_addr: u64,
    pt_base_addr: u64,
    fb_offset: u64,
    levels: [LevelInfo; PT_MAX_DEPTH + 1],
    pdes: [Pde; PT_MAX_DEPTH + 1],
    cache: [Option<(u64, u64)>; PT_MAX_DEPTH + 1],
}

struct WalkResult {
    pte: Pte,
    size: u64,
    mask: u64,
}

impl WalkHelper {
    fn populate<S: TranslationSource>(src: &S, regs: &VmContextRegs) -> Result<WalkHelper> {
        let start_lo = src.read_reg32(regs.pt_start_lo)? as u64;
        let start_hi = src.read_reg32(regs.pt_start_hi)? as u64;
        let end_lo = src.read_reg32(regs.pt_end_lo)? as u64;
        let end_hi = src.read_reg32(regs.pt_end_hi)? as u64;
        let base_lo = src.read_reg32(regs.pt_base_lo)? as u64;
        let base_hi = src.read_reg32(regs.pt_base_hi)? as u64;
        let cntl = src.read_reg32(regs.cntl)? as u64;
        let fb_offset = (src.read_reg32(regs.fb_offset)? as u64) << 24;

        // Start and end registers hold page frame numbers.
        let pt_start_addr = ((start_hi << 32) | start_lo) << LOG2_4KIB;
        let pt_end_addr = ((end_hi << 32) | end_lo) << LOG2_4KIB;
        let pt_base_addr = (base_hi << 32) | base_lo;

        let pt_depth = bits(cntl, 2, 1) as u32;
        let pt_block_size = bits(cntl, 6, 3) as u32;
        if pt_depth == 0 {
            return Err(Error::Generic(
                "flat page tables are not supported".to_string(),
            ));
        }

        let va_range = pt_end_addr - pt_start_addr + (1 << LOG2_4KIB);
        let mut levels = [LevelInfo::default(); PT_MAX_DEPTH + 1];
        for (i, level) in levels.iter_mut().enumerate().take(pt_depth as usize + 1) {
            let shift = (pt_block_size + LOG2_2MIB) as i64
                + (i as i64 - 1) * LOG2_PDB_ENTRIES as i64;
            level.pde_size_shift = shift as u32;
            level.num_pdes = if i == pt_depth as usize {
                va_range / (1u64 << level.pde_size_shift)
            } else {
                1 << LOG2_PDB_ENTRIES
            };
        }

        Ok(WalkHelper {
            pt_block_size,
            pt_depth,
            pt_start_addr,
            pt_base_addr,
            fb_offset,
            levels,
            pdes: [Pde::default(); PT_MAX_DEPTH + 1],
            cache: [None; PT_MAX_DEPTH + 1],
        })
    }

    fn walk<S: TranslationSource>(&mut self, src: &S, va: u64) -> Result<WalkResult> {
        let va = va.wrapping_sub(self.pt_start_addr);
        let mut base = self.pt_base_addr;
        let mut pde_is_pte = false;
        let mut depth = self.pt_depth as i64;

        while depth >= 0 {
            let level = depth as usize;
            let mut pde = Pde::decode(base);
            self.pdes[level] = pde;
            if pde.pte {
                depth -= 1;
                pde_is_pte = true;
                break;
            }
            if !pde.system {
                // Child tables in VRAM are addressed relative to the
                // framebuffer window.
                pde.base_address = pde.base_address.wrapping_sub(self.fb_offset);
            }
            let info = self.levels[level];
            let pde_idx = (va >> info.pde_size_shift) & (info.num_pdes - 1);
            let entry_addr = pde.base_address + pde_idx * ENTRY_BYTES;
            base = match self.cache[level] {
                Some((addr, raw)) if addr == entry_addr => raw,
                _ => {
                    let raw = src.read_entry(entry_addr, pde.system)?;
                    self.cache[level] = Some((entry_addr, raw));
                    raw
                }
            };
            depth -= 1;
        }

        let mut pte = Pte::decode(base);
        // The loop leaves depth one below the level of the last decoded PDE.
        let last_pde = self.pdes[(depth + 1) as usize];

        let mut size = if pde_is_pte {
            if depth + 1 == 0 {
                1u64 << (self.pt_block_size + LOG2_2MIB)
            } else {
                (1u64 << LOG2_PDB_ENTRIES) * ENTRY_BYTES
            }
        } else {
            1u64 << (last_pde.block_fragment_size as u32 + LOG2_4KIB)
        };

        // Translate-further does not apply to PDE-as-PTE leaves. An F-bit
        // leaf has PDE format: its base points at a block of 4 KiB PTEs.
        if pte.valid && !pde_is_pte && pte.translate_further {
            if size != 1u64 << LOG2_2MIB {
                return Err(Error::Generic(
                    "2 MiB pages are required for translate-further".to_string(),
                ));
            }
            let num_ptes = 1u64 << LOG2_PDB_ENTRIES;
            let pte_idx = (va >> LOG2_4KIB) & (num_ptes - 1);
            size >>= LOG2_PDB_ENTRIES;
            let as_pde = Pde::decode(base);
            let raw = src.read_entry(as_pde.base_address + pte_idx * ENTRY_BYTES, as_pde.system)?;
            pte = Pte::decode(raw);
        }

        Ok(WalkResult {
            pte,
            size,
            mask: size - 1,
        })
    }
}

/// One translated extent: `size` is a power of two and both addresses are
/// aligned to it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Fragment {
    pub va: u64,
    pub pa: u64,
    pub size: u64,
    pub flags: Pte,
}

/// Single-address translation result.
#[derive(Debug, Clone, Copy)]
pub struct Translation {
    pub pa: u64,
    pub ok: bool,
    pub pte: Pte,
    pub size: u64,
}

fn fragments_overlap(lhs: &Fragment, rhs: &Fragment) -> bool {
    if !lhs.flags.valid || !rhs.flags.valid {
        return false;
    }
    if lhs.va == rhs.va && lhs.pa == rhs.pa && lhs.size == rhs.size {
        error!(
            "duplicate fragment: va {:#018x} pa {:#018x} size {:#x}",
            rhs.va, rhs.pa, rhs.size
        );
        return true;
    }
    if rhs.va >= lhs.va && rhs.va < lhs.va + lhs.size {
        error!(
            "va overlap: {:#018x} falls inside [{:#018x}, {:#018x})",
            rhs.va,
            lhs.va,
            lhs.va + lhs.size
        );
        return true;
    }
    if rhs.pa >= lhs.pa && rhs.pa < lhs.pa + lhs.size {
        error!(
            "pa overlap: {:#018x} falls inside [{:#018x}, {:#018x})",
            rhs.pa,
            lhs.pa,
            lhs.pa + lhs.size
        );
        return true;
    }
    if lhs.pa >= rhs.pa && lhs.pa < rhs.pa + rhs.size {
        error!(
            "pa overlap: {:#018x} falls inside [{:#018x}, {:#018x})",
            lhs.pa,
            rhs.pa,
            rhs.pa + rhs.size
        );
        return true;
    }
    false
}

fn same_flags(a: &Pte, b: &Pte) -> bool {
    a.valid == b.valid
        && a.system == b.system
        && a.coherent == b.coherent
        && a.tmz == b.tmz
        && a.execute == b.execute
        && a.read == b.read
        && a.write == b.write
        && a.fragment == b.fragment
        && a.tiled == b.tiled
        && a.sw == b.sw
        && a.pte == b.pte
        && a.log == b.log
        && a.translate_further == b.translate_further
        && a.mtype == b.mtype
}

fn is_contiguous(prev: &Fragment, curr: &Fragment) -> Result<bool> {
    if prev.va + prev.size > curr.va {
        return Err(Error::CodeBug(
            "range walk produced a backwards fragment".to_string(),
        ));
    }
    if prev.va + prev.size != curr.va {
        return Ok(false);
    }
    // Contiguous invalid extents coalesce regardless of physical addresses.
    if !prev.flags.valid && !curr.flags.valid {
        return Ok(true);
    }
    if prev.pa + prev.size != curr.pa {
        return Ok(false);
    }
    Ok(same_flags(&prev.flags, &curr.flags))
}

/// Address translator bound to one VMID of one partition.
///
/// The source (and therefore the partition) must outlive the translator; the
/// translator itself holds no other state than the register addresses.
pub struct Xlator<S> {
    src: S,
    vmid: u32,
    regs: VmContextRegs,
}

impl<S: TranslationSource> Xlator<S> {
    pub fn new(src: S, device_id: u32, xcc_die_id: u32, vmid: u32) -> Result<Xlator<S>> {
        if !device_supported(device_id) {
            return Err(unsupported(device_id));
        }
        Ok(Xlator {
            src,
            vmid,
            regs: VmContextRegs::for_vmid(device_id, xcc_die_id, vmid)?,
        })
    }

    pub fn vmid(&self) -> u32 {
        self.vmid
    }

    /// Translates a single address within its page.
    pub fn translate(&self, va: u64) -> Result<Translation> {
        let fragments = self.translate_range(va, 0x1000 - (va & 0xfff), false)?;
        let fragment = fragments.first().ok_or_else(|| {
            Error::CodeBug("range translation returned no fragments".to_string())
        })?;
        let aligned_va = va & !(fragment.size - 1);
        Ok(Translation {
            pa: fragment.flags.base_address + (va - aligned_va),
            ok: fragment.flags.valid,
            pte: fragment.flags,
            size: fragment.size,
        })
    }

    /// Translates `[va, va + size)` into fragments, optionally coalescing
    /// contiguous ones with identical flags.
    ///
    /// The walk starts at the enclosing page boundary, so the first fragment
    /// may begin below `va`. Any overlap between produced fragments fails
    /// the whole range.
    pub fn translate_range(&self, va: u64, size: u64, combine: bool) -> Result<Vec<Fragment>> {
        let mut helper = WalkHelper::populate(&self.src, &self.regs)?;
        let mut fragments = Vec::new();
        let mut prev: Option<Fragment> = None;
        let mut addr = va;
        let mut end = va + size;

        while addr < end {
            let result = helper.walk(&self.src, addr)?;
            let aligned_va = addr & !result.mask;
            if addr != aligned_va {
                // The range starts mid-page; grow it by the bytes below so
                // the requested span stays covered.
                end += addr - aligned_va;
            }
            let curr = Fragment {
                va: aligned_va,
                pa: result.pte.base_address,
                size: result.size,
                flags: result.pte,
            };
            match prev.take() {
                None => prev = Some(curr),
                Some(p) => {
                    if fragments_overlap(&p, &curr) {
                        return Err(Error::Generic("fragment overlap detected".to_string()));
                    }
                    if combine && is_contiguous(&p, &curr)? {
                        prev = Some(Fragment {
                            size: p.size + curr.size,
                            ..p
                        });
                    } else {
                        fragments.push(p);
                        prev = Some(curr);
                    }
                }
            }
            addr = curr.va + curr.size;
        }

        if let Some(p) = prev {
            fragments.push(p);
        }
        Ok(fragments)
    }
}

/// Finds the page-table base the scheduler programmed for `pasid` on the GPU
/// with `gpu_id`, from a snapshot of the active runlists.
///
/// The process may have exited between the PASID lookup and the runlist
/// snapshot; that race surfaces here as a plain error.
pub fn pt_base_from_runlists(runlists: &[Runlist], gpu_id: u32, pasid: u32) -> Result<u64> {
    let runlist = runlists
        .iter()
        .find(|r| r.gpu_id == gpu_id)
        .ok_or_else(|| Error::Generic(format!("no active runlist for gpu_id {:#x}", gpu_id)))?;
    let mut base = None;
    for entry in &runlist.entries {
        if let Body::MapProcess(b) = &entry.body {
            if b.pasid == pasid {
                base = Some(b.page_table_base());
            }
        }
    }
    base.ok_or_else(|| {
        Error::Generic(format!(
            "pasid {} is not mapped in the runlist for gpu_id {:#x}",
            pasid, gpu_id
        ))
    })
}

/// Finds the VMID whose base registers hold `pt_base`.
pub fn vmid_from_pt_base<S: TranslationSource>(
    src: &S,
    device_id: u32,
    xcc_die_id: u32,
    pt_base: u64,
) -> Result<u32> {
    for vmid in 0..NUM_VMIDS {
        let regs = VmContextRegs::for_vmid(device_id, xcc_die_id, vmid)?;
        let lo = src.read_reg32(regs.pt_base_lo)? as u64;
        let hi = src.read_reg32(regs.pt_base_hi)? as u64;
        if (hi << 32) | lo == pt_base {
            return Ok(vmid);
        }
    }
    Err(Error::Generic(format!(
        "page-table base {:#018x} is not programmed in any VMID",
        pt_base
    )))
}
