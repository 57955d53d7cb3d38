// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! PM4 runlist model.
//!
//! The kernel's runlist dump is a text rendering of the raw dword stream the
//! command processor executes. [`rls`] recovers the dwords per node; this
//! module frames them into packets and decodes the two Type-3 bodies the
//! scheduler emits for process/queue mapping. Unknown opcodes keep their raw
//! dwords so tools can still display them.

use log::{error, warn};

use crate::{Error, Result};

pub mod rls;

pub use rls::RlsParser;

pub const OP_NOP: u8 = 0x10;
pub const OP_SET_BASE: u8 = 0x11;
pub const OP_CLEAR_STATE: u8 = 0x12;
pub const OP_INDEX_BUFFER_SIZE: u8 = 0x13;
pub const OP_DISPATCH_DIRECT: u8 = 0x15;
pub const OP_DISPATCH_INDIRECT: u8 = 0x16;
pub const OP_ATOMIC_GDS: u8 = 0x1D;
pub const OP_OCCLUSION_QUERY: u8 = 0x1F;
pub const OP_SET_PREDICATION: u8 = 0x20;
pub const OP_REG_RMW: u8 = 0x21;
pub const OP_COND_EXEC: u8 = 0x22;
pub const OP_PRED_EXEC: u8 = 0x23;
pub const OP_DRAW_INDIRECT: u8 = 0x24;
pub const OP_DRAW_INDEX_INDIRECT: u8 = 0x25;
pub const OP_INDEX_BASE: u8 = 0x26;
pub const OP_DRAW_INDEX_2: u8 = 0x27;
pub const OP_CONTEXT_CONTROL: u8 = 0x28;
pub const OP_INDEX_TYPE: u8 = 0x2A;
pub const OP_DRAW_INDIRECT_MULTI: u8 = 0x2C;
pub const OP_DRAW_INDEX_AUTO: u8 = 0x2D;
pub const OP_NUM_INSTANCES: u8 = 0x2F;
pub const OP_DRAW_INDEX_MULTI_AUTO: u8 = 0x30;
pub const OP_INDIRECT_BUFFER_CNST: u8 = 0x33;
pub const OP_STRMOUT_BUFFER_UPDATE: u8 = 0x34;
pub const OP_DRAW_INDEX_OFFSET_2: u8 = 0x35;
pub const OP_DRAW_PREAMBLE: u8 = 0x36;
pub const OP_WRITE_DATA: u8 = 0x37;
pub const OP_DRAW_INDEX_INDIRECT_MULTI: u8 = 0x38;
pub const OP_MEM_SEMAPHORE: u8 = 0x39;
pub const OP_COPY_DW: u8 = 0x3B;
pub const OP_WAIT_REG_MEM: u8 = 0x3C;
pub const OP_INDIRECT_BUFFER: u8 = 0x3F;
pub const OP_COPY_DATA: u8 = 0x40;
pub const OP_PFP_SYNC_ME: u8 = 0x42;
pub const OP_SURFACE_SYNC: u8 = 0x43;
pub const OP_COND_WRITE: u8 = 0x45;
pub const OP_EVENT_WRITE: u8 = 0x46;
pub const OP_EVENT_WRITE_EOP: u8 = 0x47;
pub const OP_EVENT_WRITE_EOS: u8 = 0x48;
pub const OP_RELEASE_MEM: u8 = 0x49;
pub const OP_PREAMBLE_CNTL: u8 = 0x4A;
pub const OP_DMA_DATA: u8 = 0x50;
pub const OP_ACQUIRE_MEM: u8 = 0x58;
pub const OP_REWIND: u8 = 0x59;
pub const OP_LOAD_UCONFIG_REG: u8 = 0x5E;
pub const OP_LOAD_SH_REG: u8 = 0x5F;
pub const OP_LOAD_CONFIG_REG: u8 = 0x60;
pub const OP_LOAD_CONTEXT_REG: u8 = 0x61;
pub const OP_SET_CONFIG_REG: u8 = 0x68;
pub const OP_SET_CONTEXT_REG: u8 = 0x69;
pub const OP_SET_CONTEXT_REG_INDIRECT: u8 = 0x73;
pub const OP_SET_SH_REG: u8 = 0x76;
pub const OP_SET_SH_REG_OFFSET: u8 = 0x77;
pub const OP_SET_QUEUE_REG: u8 = 0x78;
pub const OP_SET_UCONFIG_REG: u8 = 0x79;
pub const OP_SCRATCH_RAM_WRITE: u8 = 0x7D;
pub const OP_SCRATCH_RAM_READ: u8 = 0x7E;
pub const OP_LOAD_CONST_RAM: u8 = 0x80;
pub const OP_WRITE_CONST_RAM: u8 = 0x81;
pub const OP_DUMP_CONST_RAM: u8 = 0x83;
pub const OP_INCREMENT_CE_COUNTER: u8 = 0x84;
pub const OP_INCREMENT_DE_COUNTER: u8 = 0x85;
pub const OP_WAIT_ON_CE_COUNTER: u8 = 0x86;
pub const OP_WAIT_ON_DE_COUNTER_DIFF: u8 = 0x88;
pub const OP_SWITCH_BUFFER: u8 = 0x8B;
pub const OP_SET_RESOURCES: u8 = 0xA0;
pub const OP_MAP_PROCESS: u8 = 0xA1;
pub const OP_MAP_QUEUES: u8 = 0xA2;
pub const OP_UNMAP_QUEUES: u8 = 0xA3;
pub const OP_QUERY_STATUS: u8 = 0xA4;
pub const OP_RUN_LIST: u8 = 0xA5;

/// Mnemonic for a Type-3 opcode, for display.
pub fn opcode_name(op: u8) -> &'static str {
    match op {
        OP_NOP => "NOP",
        OP_SET_BASE => "SET_BASE",
        OP_CLEAR_STATE => "CLEAR_STATE",
        OP_INDEX_BUFFER_SIZE => "INDEX_BUFFER_SIZE",
        OP_DISPATCH_DIRECT => "DISPATCH_DIRECT",
        OP_DISPATCH_INDIRECT => "DISPATCH_INDIRECT",
        OP_ATOMIC_GDS => "ATOMIC_GDS",
        OP_OCCLUSION_QUERY => "OCCLUSION_QUERY",
        OP_SET_PREDICATION => "SET_PREDICATION",
        OP_REG_RMW => "REG_RMW",
        OP_COND_EXEC => "COND_EXEC",
        OP_PRED_EXEC => "PRED_EXEC",
        OP_DRAW_INDIRECT => "DRAW_INDIRECT",
        OP_DRAW_INDEX_INDIRECT => "DRAW_INDEX_INDIRECT",
        OP_INDEX_BASE => "INDEX_BASE",
        OP_DRAW_INDEX_2 => "DRAW_INDEX_2",
        OP_CONTEXT_CONTROL => "CONTEXT_CONTROL",
        OP_INDEX_TYPE => "INDEX_TYPE",
        OP_DRAW_INDIRECT_MULTI => "DRAW_INDIRECT_MULTI",
        OP_DRAW_INDEX_AUTO => "DRAW_INDEX_AUTO",
        OP_NUM_INSTANCES => "NUM_INSTANCES",
        OP_DRAW_INDEX_MULTI_AUTO => "DRAW_INDEX_MULTI_AUTO",
        OP_INDIRECT_BUFFER_CNST => "INDIRECT_BUFFER_CNST",
        OP_STRMOUT_BUFFER_UPDATE => "STRMOUT_BUFFER_UPDATE",
        OP_DRAW_INDEX_OFFSET_2 => "DRAW_INDEX_OFFSET_2",
        OP_DRAW_PREAMBLE => "DRAW_PREAMBLE",
        OP_WRITE_DATA => "WRITE_DATA",
        OP_DRAW_INDEX_INDIRECT_MULTI => "DRAW_INDEX_INDIRECT_MULTI",
        OP_MEM_SEMAPHORE => "MEM_SEMAPHORE",
        OP_COPY_DW => "COPY_DW",
        OP_WAIT_REG_MEM => "WAIT_REG_MEM",
        OP_INDIRECT_BUFFER => "INDIRECT_BUFFER",
        OP_COPY_DATA => "COPY_DATA",
        OP_PFP_SYNC_ME => "PFP_SYNC_ME",
        OP_SURFACE_SYNC => "SURFACE_SYNC",
        OP_COND_WRITE => "COND_WRITE",
        OP_EVENT_WRITE => "EVENT_WRITE",
        OP_EVENT_WRITE_EOP => "EVENT_WRITE_EOP",
        OP_EVENT_WRITE_EOS => "EVENT_WRITE_EOS",
        OP_RELEASE_MEM => "RELEASE_MEM",
        OP_PREAMBLE_CNTL => "PREAMBLE_CNTL",
        OP_DMA_DATA => "DMA_DATA",
        OP_ACQUIRE_MEM => "ACQUIRE_MEM",
        OP_REWIND => "REWIND",
        OP_LOAD_UCONFIG_REG => "LOAD_UCONFIG_REG",
        OP_LOAD_SH_REG => "LOAD_SH_REG",
        OP_LOAD_CONFIG_REG => "LOAD_CONFIG_REG",
        OP_LOAD_CONTEXT_REG => "LOAD_CONTEXT_REG",
        OP_SET_CONFIG_REG => "SET_CONFIG_REG",
        OP_SET_CONTEXT_REG => "SET_CONTEXT_REG",
        OP_SET_CONTEXT_REG_INDIRECT => "SET_CONTEXT_REG_INDIRECT",
        OP_SET_SH_REG => "SET_SH_REG",
        OP_SET_SH_REG_OFFSET => "SET_SH_REG_OFFSET",
        OP_SET_QUEUE_REG => "SET_QUEUE_REG",
        OP_SET_UCONFIG_REG => "SET_UCONFIG_REG",
        OP_SCRATCH_RAM_WRITE => "SCRATCH_RAM_WRITE",
        OP_SCRATCH_RAM_READ => "SCRATCH_RAM_READ",
        OP_LOAD_CONST_RAM => "LOAD_CONST_RAM",
        OP_WRITE_CONST_RAM => "WRITE_CONST_RAM",
        OP_DUMP_CONST_RAM => "DUMP_CONST_RAM",
        OP_INCREMENT_CE_COUNTER => "INCREMENT_CE_COUNTER",
        OP_INCREMENT_DE_COUNTER => "INCREMENT_DE_COUNTER",
        OP_WAIT_ON_CE_COUNTER => "WAIT_ON_CE_COUNTER",
        OP_WAIT_ON_DE_COUNTER_DIFF => "WAIT_ON_DE_COUNTER_DIFF",
        OP_SWITCH_BUFFER => "SWITCH_BUFFER",
        OP_SET_RESOURCES => "SET_RESOURCES",
        OP_MAP_PROCESS => "MAP_PROCESS",
        OP_MAP_QUEUES => "MAP_QUEUES",
        OP_UNMAP_QUEUES => "UNMAP_QUEUES",
        OP_QUERY_STATUS => "QUERY_STATUS",
        OP_RUN_LIST => "RUN_LIST",
        _ => "UNKNOWN",
    }
}

fn slice32(val: u32, msb: u32, lsb: u32) -> u32 {
    let mask = ((1u64 << (msb + 1)) - 1) as u32;
    (val & mask) >> lsb
}

/// PM4 packet type, from header bits `[31:30]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Type1,
    Type2,
    Type3,
}

/// A framed packet header. `count` is the number of body dwords (the wire
/// field stores `count - 1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub packet_type: PacketType,
    pub opcode: u8,
    pub count: u16,
}

impl Header {
    pub fn parse(dword: u32) -> Result<Header> {
        let reserved = slice32(dword, 7, 0);
        if reserved != 0 {
            error!("non-zero reserved field in PM4 header: {:#04x}", reserved);
        }
        let packet_type = match slice32(dword, 31, 30) {
            1 => PacketType::Type1,
            2 => PacketType::Type2,
            3 => PacketType::Type3,
            t => {
                return Err(Error::Generic(format!(
                    "invalid PM4 packet type {} in header {:#010x}",
                    t, dword
                )))
            }
        };
        Ok(Header {
            packet_type,
            opcode: slice32(dword, 15, 8) as u8,
            count: (slice32(dword, 29, 16) + 1) as u16,
        })
    }

    pub fn to_dword(&self) -> u32 {
        let ty = match self.packet_type {
            PacketType::Type1 => 1u32,
            PacketType::Type2 => 2,
            PacketType::Type3 => 3,
        };
        (ty << 30) | ((self.count as u32 - 1) << 16) | ((self.opcode as u32) << 8)
    }
}

/// Decoded `MAP_PROCESS` body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapProcess {
    pub pasid: u32,
    pub single_memop: bool,
    pub debug_vmid: u16,
    pub debug_flag: bool,
    pub tmz: bool,
    pub diq_enable: bool,
    pub process_quantum: u8,
    pub vm_context_page_table_base_addr_lo32: u32,
    pub vm_context_page_table_base_addr_hi32: u32,
    pub sh_mem_bases: u32,
    pub sh_mem_config: u32,
    pub sq_shader_tba_lo: u32,
    pub sq_shader_tba_hi: u32,
    pub sq_shader_tma_lo: u32,
    pub sq_shader_tma_hi: u32,
    pub gds_addr_lo: u32,
    pub gds_addr_hi: u32,
    pub num_gws: u8,
    pub sdma_enable: bool,
    pub num_oac: u8,
    pub gds_size_hi: u8,
    pub gds_size_lo: u8,
    pub num_queues: u16,
    pub spi_gdbg_per_vmid_cntl: u32,
    pub tcp_watch0_cntl: u32,
    pub tcp_watch1_cntl: u32,
    pub tcp_watch2_cntl: u32,
    pub tcp_watch3_cntl: u32,
    pub completion_signal_lo32: u32,
    pub completion_signal_hi32: u32,
}

impl MapProcess {
    /// Page-table base programmed for the process, as one 64-bit value.
    pub fn page_table_base(&self) -> u64 {
        (self.vm_context_page_table_base_addr_hi32 as u64) << 32
            | self.vm_context_page_table_base_addr_lo32 as u64
    }

    const BODY_DWORDS: usize = 20;

    fn decode(body: &[u32]) -> Result<MapProcess> {
        if body.len() < Self::BODY_DWORDS {
            return Err(Error::Generic(format!(
                "MAP_PROCESS body has {} dwords, need {}",
                body.len(),
                Self::BODY_DWORDS
            )));
        }
        Ok(MapProcess {
            pasid: slice32(body[0], 15, 0),
            single_memop: slice32(body[0], 16, 16) != 0,
            debug_vmid: slice32(body[0], 21, 18) as u16,
            debug_flag: slice32(body[0], 22, 22) != 0,
            tmz: slice32(body[0], 23, 23) != 0,
            diq_enable: slice32(body[0], 24, 24) != 0,
            process_quantum: slice32(body[0], 31, 25) as u8,
            vm_context_page_table_base_addr_lo32: body[1],
            vm_context_page_table_base_addr_hi32: body[2],
            sh_mem_bases: body[3],
            sh_mem_config: body[4],
            sq_shader_tba_lo: body[5],
            sq_shader_tba_hi: body[6],
            sq_shader_tma_lo: body[7],
            sq_shader_tma_hi: body[8],
            gds_addr_lo: body[10],
            gds_addr_hi: body[11],
            num_gws: slice32(body[12], 6, 0) as u8,
            sdma_enable: slice32(body[12], 7, 7) != 0,
            num_oac: slice32(body[12], 11, 8) as u8,
            gds_size_hi: slice32(body[12], 15, 12) as u8,
            gds_size_lo: slice32(body[12], 21, 16) as u8,
            num_queues: slice32(body[12], 31, 22) as u16,
            spi_gdbg_per_vmid_cntl: body[13],
            tcp_watch0_cntl: body[14],
            tcp_watch1_cntl: body[15],
            tcp_watch2_cntl: body[16],
            tcp_watch3_cntl: body[17],
            completion_signal_lo32: body[18],
            completion_signal_hi32: body[19],
        })
    }

    fn encode(&self) -> Vec<u32> {
        let mut body = vec![0u32; Self::BODY_DWORDS];
        body[0] = self.pasid
            | (self.single_memop as u32) << 16
            | (self.debug_vmid as u32) << 18
            | (self.debug_flag as u32) << 22
            | (self.tmz as u32) << 23
            | (self.diq_enable as u32) << 24
            | (self.process_quantum as u32) << 25;
        body[1] = self.vm_context_page_table_base_addr_lo32;
        body[2] = self.vm_context_page_table_base_addr_hi32;
        body[3] = self.sh_mem_bases;
        body[4] = self.sh_mem_config;
        body[5] = self.sq_shader_tba_lo;
        body[6] = self.sq_shader_tba_hi;
        body[7] = self.sq_shader_tma_lo;
        body[8] = self.sq_shader_tma_hi;
        body[10] = self.gds_addr_lo;
        body[11] = self.gds_addr_hi;
        body[12] = self.num_gws as u32
            | (self.sdma_enable as u32) << 7
            | (self.num_oac as u32) << 8
            | (self.gds_size_hi as u32) << 12
            | (self.gds_size_lo as u32) << 16
            | (self.num_queues as u32) << 22;
        body[13] = self.spi_gdbg_per_vmid_cntl;
        body[14] = self.tcp_watch0_cntl;
        body[15] = self.tcp_watch1_cntl;
        body[16] = self.tcp_watch2_cntl;
        body[17] = self.tcp_watch3_cntl;
        body[18] = self.completion_signal_lo32;
        body[19] = self.completion_signal_hi32;
        body
    }
}

/// Decoded `MAP_QUEUES` body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapQueues {
    pub extended_engine_sel: u8,
    pub queue_sel: u8,
    pub vmid: u8,
    pub gws_enabled: bool,
    pub queue: u8,
    pub queue_type: u8,
    pub static_queue_group: u8,
    pub engine_sel: u8,
    pub num_queues: u8,
    pub check_disable: bool,
    pub doorbell_offset: u32,
    pub mqd_addr_lo: u32,
    pub mqd_addr_hi: u32,
    pub wptr_addr_lo: u32,
    pub wptr_addr_hi: u32,
}

impl MapQueues {
    const BODY_DWORDS: usize = 6;

    fn decode(body: &[u32]) -> Result<MapQueues> {
        if body.len() < Self::BODY_DWORDS {
            return Err(Error::Generic(format!(
                "MAP_QUEUES body has {} dwords, need {}",
                body.len(),
                Self::BODY_DWORDS
            )));
        }
        Ok(MapQueues {
            extended_engine_sel: slice32(body[0], 3, 2) as u8,
            queue_sel: slice32(body[0], 5, 4) as u8,
            vmid: slice32(body[0], 11, 8) as u8,
            gws_enabled: slice32(body[0], 12, 12) != 0,
            queue: slice32(body[0], 20, 13) as u8,
            queue_type: slice32(body[0], 23, 21) as u8,
            static_queue_group: slice32(body[0], 25, 24) as u8,
            engine_sel: slice32(body[0], 28, 26) as u8,
            num_queues: slice32(body[0], 31, 29) as u8,
            check_disable: slice32(body[1], 1, 1) != 0,
            doorbell_offset: slice32(body[1], 27, 2),
            mqd_addr_lo: body[2],
            mqd_addr_hi: body[3],
            wptr_addr_lo: body[4],
            wptr_addr_hi: body[5],
        })
    }

    fn encode(&self) -> Vec<u32> {
        vec![
            (self.extended_engine_sel as u32) << 2
                | (self.queue_sel as u32) << 4
                | (self.vmid as u32) << 8
                | (self.gws_enabled as u32) << 12
                | (self.queue as u32) << 13
                | (self.queue_type as u32) << 21
                | (self.static_queue_group as u32) << 24
                | (self.engine_sel as u32) << 26
                | (self.num_queues as u32) << 29,
            (self.check_disable as u32) << 1 | self.doorbell_offset << 2,
            self.mqd_addr_lo,
            self.mqd_addr_hi,
            self.wptr_addr_lo,
            self.wptr_addr_hi,
        ]
    }
}

/// Packet body, tagged by opcode. Opcodes without a decoder keep their raw
/// dwords instead of discarding them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    MapProcess(MapProcess),
    MapQueues(MapQueues),
    Raw(Vec<u32>),
}

/// One framed runlist packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub header: Header,
    pub body: Body,
}

impl Entry {
    /// Re-serialises the entry as its wire dwords (header first). Decoded
    /// bodies shorter than the header's count are zero-padded back to it.
    pub fn to_dwords(&self) -> Vec<u32> {
        let mut dwords = vec![self.header.to_dword()];
        match &self.body {
            Body::MapProcess(b) => dwords.extend(b.encode()),
            Body::MapQueues(b) => dwords.extend(b.encode()),
            Body::Raw(raw) => dwords.extend(raw.iter().copied()),
        }
        dwords.resize(1 + self.header.count as usize, 0);
        dwords
    }
}

/// Frames and decodes a single entry from `data` (header plus body).
pub fn parse_entry(data: &[u32]) -> Result<Entry> {
    let header = match data.first() {
        Some(&d) => Header::parse(d)?,
        None => return Err(Error::Generic("empty runlist entry".to_string())),
    };
    if data.len() - 1 < header.count as usize {
        return Err(Error::Generic(format!(
            "entry data is undersized for op {:#04x}: {} dwords, header says {}",
            header.opcode,
            data.len() - 1,
            header.count
        )));
    }
    let body_data = &data[1..=header.count as usize];
    let body = if header.packet_type == PacketType::Type3 {
        match header.opcode {
            OP_MAP_PROCESS => Body::MapProcess(MapProcess::decode(body_data)?),
            OP_MAP_QUEUES => Body::MapQueues(MapQueues::decode(body_data)?),
            op => {
                warn!("no body decoder for Type-3 opcode {:#04x}, keeping raw dwords", op);
                Body::Raw(body_data.to_vec())
            }
        }
    } else {
        warn!(
            "unsupported PM4 packet {:?}, keeping raw dwords",
            header.packet_type
        );
        Body::Raw(body_data.to_vec())
    };
    Ok(Entry { header, body })
}

/// Splits a runlist's dword stream into entries.
///
/// The cumulative entry lengths must cover the stream exactly; an entry whose
/// count runs past the end fails the whole runlist.
pub fn parse_entries(data: &[u32]) -> Result<Vec<Entry>> {
    if data.is_empty() {
        return Err(Error::Generic("tried to parse empty packet data".to_string()));
    }
    let mut sizes = Vec::new();
    let mut total = 0usize;
    while total < data.len() {
        let body = slice32(data[total], 29, 16) as usize + 1;
        let size = body + 1;
        total += size;
        sizes.push(size);
    }
    if total > data.len() {
        return Err(Error::Generic(format!(
            "runlist entry sizes cover {} dwords but only {} are present",
            total,
            data.len()
        )));
    }
    let mut entries = Vec::with_capacity(sizes.len());
    let mut start = 0;
    for size in sizes {
        let entry = parse_entry(&data[start..start + size])?;
        if entry.header.packet_type != PacketType::Type3 {
            error!(
                "unsupported PM4 packet {:?} in runlist, only Type-3 is meaningful",
                entry.header.packet_type
            );
        }
        entries.push(entry);
        start += size;
    }
    Ok(entries)
}

/// One node's runlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Runlist {
    pub node_id: u32,
    pub gpu_id: u32,
    pub entries: Vec<Entry>,
}

/// Parses every runlist in a `rls` dump, in file order.
pub fn parse_runlists(text: &str) -> Result<Vec<Runlist>> {
    let mut parser = RlsParser::new(text);
    let mut runlists = Vec::new();
    while let Some(raw) = parser.next_runlist()? {
        runlists.push(Runlist {
            node_id: raw.node_id,
            gpu_id: raw.gpu_id,
            entries: parse_entries(&raw.dwords)?,
        });
    }
    Ok(runlists)
}

/// Parses the runlist for one specific `(node, gpu)` pair.
pub fn parse_runlist(node_id: u32, gpu_id: u32, text: &str) -> Result<Runlist> {
    let mut parser = RlsParser::for_node(text, node_id, gpu_id);
    match parser.next_runlist()? {
        Some(raw) => Ok(Runlist {
            node_id: raw.node_id,
            gpu_id: raw.gpu_id,
            entries: parse_entries(&raw.dwords)?,
        }),
        None => Err(Error::Generic(format!(
            "no runlist found for node {} gpu_id {:#x}",
            node_id, gpu_id
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Dword stream from a real three-entry runlist: one MAP_PROCESS and two
    // MAP_QUEUES packets.
    const DATA: [u32; 35] = [
        0xc013a100, 0x14008000, 0x41875003, 0x00000001, 0x00010002, 0x00001118, 0x00000020,
        0x00000000, 0x00000030, 0x00000000, 0x00000000, 0x00000000, 0x00000000, 0x00800080,
        0x00000008, 0x00000000, 0x00000000, 0x00000000, 0x00000000, 0x00000000, 0x00000000,
        0xc005a200, 0x28000010, 0x00008800, 0x0171a000, 0x00000000, 0x0ce9c008, 0x00007f4c,
        0xc005a200, 0x20000010, 0x00008000, 0x0173b000, 0x00000000, 0x0cf32038, 0x00007f4c,
    ];

    #[test]
    fn header_framing() {
        let h = Header::parse(0xc013a100).unwrap();
        assert_eq!(h.packet_type, PacketType::Type3);
        assert_eq!(h.opcode, OP_MAP_PROCESS);
        assert_eq!(h.count, 20);
        assert_eq!(h.to_dword(), 0xc013a100);
    }

    #[test]
    fn header_rejects_type_zero() {
        assert!(Header::parse(0x0013a100).is_err());
    }

    #[test]
    fn header_tolerates_reserved_bits() {
        // Logged, not fatal.
        let h = Header::parse(0xc013a1ff).unwrap();
        assert_eq!(h.opcode, OP_MAP_PROCESS);
    }

    #[test]
    fn single_entry() {
        let entry = parse_entry(&DATA).unwrap();
        assert_eq!(entry.header.packet_type, PacketType::Type3);
        assert_eq!(entry.header.opcode, OP_MAP_PROCESS);
        assert_eq!(entry.header.count, 20);
    }

    #[test]
    fn map_process_body() {
        let entry = parse_entry(&DATA).unwrap();
        let b = match entry.body {
            Body::MapProcess(b) => b,
            other => panic!("wrong body: {:?}", other),
        };
        assert_eq!(b.pasid, 0x8000);
        assert!(!b.single_memop);
        assert_eq!(b.debug_vmid, 0);
        assert!(!b.debug_flag);
        assert!(!b.tmz);
        assert!(!b.diq_enable);
        assert_eq!(b.process_quantum, 0xA);
        assert_eq!(b.vm_context_page_table_base_addr_lo32, 0x41875003);
        assert_eq!(b.vm_context_page_table_base_addr_hi32, 0x00000001);
        assert_eq!(b.page_table_base(), 0x1_41875003);
        assert_eq!(b.sh_mem_bases, 0x00010002);
        assert_eq!(b.sh_mem_config, 0x00001118);
        assert_eq!(b.sq_shader_tba_lo, 0x20);
        assert_eq!(b.sq_shader_tma_lo, 0x30);
        assert_eq!(b.gds_addr_lo, 0);
        assert_eq!(b.num_gws, 0);
        assert!(b.sdma_enable);
        assert_eq!(b.num_oac, 0);
        assert_eq!(b.gds_size_hi, 0);
        assert_eq!(b.gds_size_lo, 0);
        assert_eq!(b.num_queues, 2);
        assert_eq!(b.spi_gdbg_per_vmid_cntl, 8);
        assert_eq!(b.completion_signal_lo32, 0);
        assert_eq!(b.completion_signal_hi32, 0);
    }

    #[test]
    fn map_queues_body() {
        let dwords = [
            0xc005a200, 0x28000010, 0x00008800, 0x0171a000, 0x00000000, 0x0ce9c008, 0x00007f4c,
        ];
        let entry = parse_entry(&dwords).unwrap();
        let b = match entry.body {
            Body::MapQueues(b) => b,
            other => panic!("wrong body: {:?}", other),
        };
        assert_eq!(b.queue_sel, 1);
        assert_eq!(b.engine_sel, 2);
        assert_eq!(b.num_queues, 1);
        assert!(!b.gws_enabled);
        assert!(!b.check_disable);
        assert_eq!(b.doorbell_offset, 0x2200);
        assert_eq!(b.mqd_addr_lo, 0x0171a000);
        assert_eq!(b.mqd_addr_hi, 0);
        assert_eq!(b.wptr_addr_lo, 0x0ce9c008);
        assert_eq!(b.wptr_addr_hi, 0x00007f4c);
    }

    #[test]
    fn entries_split() {
        let entries = parse_entries(&DATA).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].header.opcode, OP_MAP_PROCESS);
        assert_eq!(entries[1].header.opcode, OP_MAP_QUEUES);
        assert_eq!(entries[2].header.opcode, OP_MAP_QUEUES);
        assert_eq!(entries[0].header.count, 20);
        assert_eq!(entries[1].header.count, 6);
        assert_eq!(entries[2].header.count, 6);
    }

    #[test]
    fn entries_reject_truncated_stream() {
        assert!(parse_entries(&DATA[..30]).is_err());
        assert!(parse_entries(&[]).is_err());
    }

    #[test]
    fn unknown_opcode_keeps_raw_body() {
        let dwords = [0xc002a300u32, 1, 2, 3];
        let entry = parse_entry(&dwords).unwrap();
        assert_eq!(entry.header.opcode, OP_UNMAP_QUEUES);
        assert_eq!(entry.body, Body::Raw(vec![1, 2, 3]));
        assert_eq!(entry.to_dwords(), dwords);
    }

    #[test]
    fn entries_round_trip() {
        let entries = parse_entries(&DATA).unwrap();
        let mut dwords = Vec::new();
        for e in &entries {
            dwords.extend(e.to_dwords());
        }
        assert_eq!(dwords, DATA);
        assert_eq!(parse_entries(&dwords).unwrap(), entries);
    }
}
