// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

use std::fs;

use clap::{Parser, Subcommand};

use sift::pm4::{self, Body};
use sift::{chip, Aperture, MemRegion, PartitionId, Sift};

#[derive(Parser)]
#[clap(version = "0.1", about = "AMD GPU introspection tools")]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List devices and their partitions
    ListPartitions,
    /// List processes registered with KFD
    Ps,
    /// Dump the active runlists with decoded packets
    DumpRls,
    /// Read a 32-bit register
    ReadReg32 {
        /// GPU partition to target
        #[clap(short, long, default_value = "0")]
        partition: usize,
        /// MMIO or SMN
        #[clap(long, default_value = "MMIO")]
        aperture: String,
        /// Register address
        #[clap(value_parser = parse_num)]
        addr: u64,
    },
    /// Write a 32-bit register
    WriteReg32 {
        /// GPU partition to target
        #[clap(short, long, default_value = "0")]
        partition: usize,
        /// MMIO or SMN
        #[clap(long, default_value = "MMIO")]
        aperture: String,
        /// Register address
        #[clap(value_parser = parse_num)]
        addr: u64,
        /// 32-bit value to write
        #[clap(value_parser = parse_num)]
        value: u64,
    },
    /// Read linear memory and hexdump it
    ReadMem {
        /// GPU partition to target
        #[clap(short, long, default_value = "0")]
        partition: usize,
        /// vram or sysram
        #[clap(long, default_value = "vram")]
        region: String,
        /// Address to read from
        #[clap(value_parser = parse_num)]
        addr: u64,
        /// Number of bytes to read
        #[clap(short, long, default_value = "256", value_parser = parse_num)]
        size: u64,
    },
    /// Translate a GPU virtual address range to physical addresses
    Va2pa {
        /// ID to target based on id-type
        #[clap(value_parser = parse_num)]
        id: u64,
        /// Virtual address to translate
        #[clap(value_parser = parse_num)]
        va: u64,
        /// pid or vmid
        #[clap(short = 'i', long, default_value = "pid")]
        id_type: String,
        /// GPU partition to target
        #[clap(short, long, default_value = "0")]
        partition: usize,
        /// Address range size in bytes to translate
        #[clap(short, long, default_value = "4096", value_parser = parse_num)]
        size: u64,
        /// Don't combine contiguous fragments
        #[clap(short = 'n', long)]
        no_combine: bool,
    },
}

fn parse_num(s: &str) -> Result<u64, String> {
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        s.parse::<u64>()
    };
    parsed.map_err(|e| format!("{:?}: {}", s, e))
}

fn parse_aperture(s: &str) -> Result<Aperture, sift::Error> {
    match s {
        "MMIO" => Ok(Aperture::Mmio),
        "SMN" => Ok(Aperture::Smn),
        other => Err(sift::Error::Generic(format!(
            "--aperture must be MMIO or SMN, not {:?}",
            other
        ))),
    }
}

fn parse_region(s: &str) -> Result<MemRegion, sift::Error> {
    match s {
        "vram" => Ok(MemRegion::Vram),
        "sysram" => Ok(MemRegion::SystemRam),
        other => Err(sift::Error::Generic(format!(
            "--region must be vram or sysram, not {:?}",
            other
        ))),
    }
}

fn cmdline(pid: u32) -> String {
    match fs::read(format!("/proc/{}/cmdline", pid)) {
        Ok(raw) => String::from_utf8_lossy(&raw)
            .split('\0')
            .collect::<Vec<_>>()
            .join(" ")
            .trim()
            .to_string(),
        Err(_) => String::new(),
    }
}

fn hexdump(base: u64, data: &[u8]) {
    for (i, chunk) in data.chunks(16).enumerate() {
        let bytes: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
        println!("{:016x}: {}", base + (i as u64) * 16, bytes.join(" "));
    }
}

fn list_partitions(sift: &Sift) -> sift::Result<()> {
    for dev in sift.devices() {
        for &part_id in dev.partitions() {
            let part = sift.partition(part_id)?;
            let node = sift.kfd_node(part_id)?;
            println!(
                "{}:  Device {}.{} Node {} GPU_ID {:08x} {:04x}:{:04x}",
                part_id.0,
                dev.instance(),
                part.local_id(),
                node.instance,
                node.gpu_id,
                node.properties.vendor_id,
                node.properties.device_id,
            );
        }
    }
    Ok(())
}

fn ps(sift: &Sift) -> sift::Result<()> {
    println!("{:>8} {:>8} CMD", "PID", "PASID");
    for proc in sift.processes()? {
        println!("{:>8} {:>8} {}", proc.pid, proc.pasid, cmdline(proc.pid));
    }
    Ok(())
}

fn dump_rls(sift: &Sift) -> sift::Result<()> {
    for runlist in sift.runlists()? {
        println!("Node {}, gpu_id {:#x}:", runlist.node_id, runlist.gpu_id);
        for entry in &runlist.entries {
            let name = pm4::opcode_name(entry.header.opcode);
            match &entry.body {
                Body::MapProcess(b) => println!(
                    "  {} pasid {:#x} pt_base {:#018x} queues {}",
                    name,
                    b.pasid,
                    b.page_table_base(),
                    b.num_queues
                ),
                Body::MapQueues(b) => println!(
                    "  {} vmid {} doorbell {:#x} mqd {:#018x}",
                    name,
                    b.vmid,
                    b.doorbell_offset,
                    (b.mqd_addr_hi as u64) << 32 | b.mqd_addr_lo as u64
                ),
                Body::Raw(dwords) => println!("  {} ({} dwords)", name, dwords.len()),
            }
        }
    }
    Ok(())
}

fn va2pa(
    sift: &Sift,
    id: u64,
    va: u64,
    id_type: &str,
    partition: usize,
    size: u64,
    no_combine: bool,
) -> sift::Result<()> {
    let part = PartitionId(partition);
    let xlator = match id_type {
        "pid" => sift.xlator_for_process(part, id as u32)?,
        "vmid" => sift.xlator(part, id as u32)?,
        other => {
            return Err(sift::Error::Generic(format!(
                "--id-type must be pid or vmid, not {:?}",
                other
            )))
        }
    };
    let device_id = sift.node_properties(part)?.device_id as u32;
    println!("vmid {}", xlator.vmid());
    for frag in xlator.translate_range(va, size, !no_combine)? {
        let mtype = chip::decode_mtype(frag.flags.mtype, device_id).unwrap_or("?");
        println!(
            "va {:#018x} pa {:#018x} size {:#010x} {}{}{}{} {} {}",
            frag.va,
            frag.pa,
            frag.size,
            if frag.flags.valid { 'V' } else { '-' },
            if frag.flags.read { 'R' } else { '-' },
            if frag.flags.write { 'W' } else { '-' },
            if frag.flags.execute { 'X' } else { '-' },
            if frag.flags.system { "sys" } else { "vram" },
            mtype,
        );
    }
    Ok(())
}

fn run(cli: Cli) -> sift::Result<()> {
    let sift = Sift::init()?;
    match cli.command {
        Command::ListPartitions => list_partitions(&sift),
        Command::Ps => ps(&sift),
        Command::DumpRls => dump_rls(&sift),
        Command::ReadReg32 {
            partition,
            aperture,
            addr,
        } => {
            let value = sift.read_reg32(
                PartitionId(partition),
                parse_aperture(&aperture)?,
                addr,
            )?;
            println!("{:#010x}", value);
            Ok(())
        }
        Command::WriteReg32 {
            partition,
            aperture,
            addr,
            value,
        } => sift.write_reg32(
            PartitionId(partition),
            parse_aperture(&aperture)?,
            addr,
            value as u32,
        ),
        Command::ReadMem {
            partition,
            region,
            addr,
            size,
        } => {
            let mut buf = vec![0u8; size as usize];
            let n = sift.read(
                PartitionId(partition),
                parse_region(&region)?,
                addr,
                &mut buf,
            )?;
            hexdump(addr, &buf[..n]);
            Ok(())
        }
        Command::Va2pa {
            id,
            va,
            id_type,
            partition,
            size,
            no_combine,
        } => va2pa(&sift, id, va, &id_type, partition, size, no_combine),
    }
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("rocsift: {}", e);
        std::process::exit(1);
    }
}
