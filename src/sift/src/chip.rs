// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! PCI device-id catalogue and chip-family predicates.
//!
//! Register offset tables and the MType decode are selected per family, so
//! the rest of the library only ever asks "which family is this device id".

use crate::{Error, Result};

pub const CHIPID_NAVI10_W5700X: u32 = 0x7310;
pub const CHIPID_NAVI10_W5700: u32 = 0x7312;
pub const CHIPID_NAVI10_5700: u32 = 0x731B;
pub const CHIPID_NAVI10_5600: u32 = 0x731F;
pub const CHIPID_NAVI21_V620: u32 = 0x73A1;
pub const CHIPID_NAVI21_W6900X: u32 = 0x73A2;
pub const CHIPID_NAVI21_W6800: u32 = 0x73A3;
pub const CHIPID_NAVI21_6950XT: u32 = 0x73A5;
pub const CHIPID_NAVI21_W6800X: u32 = 0x73AB;
pub const CHIPID_NAVI21_V620MX: u32 = 0x73AE;
pub const CHIPID_NAVI21_6900XT: u32 = 0x73AF;
pub const CHIPID_NAVI21_6800XT: u32 = 0x73BF;
pub const CHIPID_NAVI31_W7900: u32 = 0x7448;
pub const CHIPID_NAVI31_7900XT: u32 = 0x744C;
pub const CHIPID_NAVI31_W7800: u32 = 0x745E;
pub const CHIPID_VEGA20_INSTINCT: u32 = 0x66A0;
pub const CHIPID_VEGA20_MI50: u32 = 0x66A1;
pub const CHIPID_VEGA20: u32 = 0x66A2;
pub const CHIPID_VEGA20_VEGAII: u32 = 0x66A3;
pub const CHIPID_VEGA20_VII: u32 = 0x66AF;
pub const CHIPID_MI100_0: u32 = 0x7388;
pub const CHIPID_MI100_1: u32 = 0x738C;
pub const CHIPID_MI100_2: u32 = 0x738E;
pub const CHIPID_MI210: u32 = 0x740F;
pub const CHIPID_MI250X: u32 = 0x7408;
pub const CHIPID_MI250X_MI250: u32 = 0x740C;
pub const CHIPID_MI300X: u32 = 0x74A1;
pub const CHIPID_MI300X_SRIOV: u32 = 0x74B5;
pub const CHIPID_MI300X_HF: u32 = 0x74A9;
pub const CHIPID_MI300X_HF_SRIOV: u32 = 0x74BD;
pub const CHIPID_MI300A: u32 = 0x74A0;
pub const CHIPID_MI300A_SRIOV: u32 = 0x74B4;
pub const CHIPID_MI325X: u32 = 0x74A5;
pub const CHIPID_MI325X_SRIOV: u32 = 0x74B9;

pub fn is_vega20(id: u32) -> bool {
    matches!(
        id,
        CHIPID_VEGA20_INSTINCT
            | CHIPID_VEGA20_MI50
            | CHIPID_VEGA20
            | CHIPID_VEGA20_VEGAII
            | CHIPID_VEGA20_VII
    )
}

pub fn is_mi100(id: u32) -> bool {
    matches!(id, CHIPID_MI100_0 | CHIPID_MI100_1 | CHIPID_MI100_2)
}

pub fn is_mi200(id: u32) -> bool {
    matches!(id, CHIPID_MI210 | CHIPID_MI250X | CHIPID_MI250X_MI250)
}

pub fn is_mi300a(id: u32) -> bool {
    matches!(id, CHIPID_MI300A | CHIPID_MI300A_SRIOV)
}

pub fn is_mi300x(id: u32) -> bool {
    matches!(id, CHIPID_MI300X | CHIPID_MI300X_SRIOV)
}

pub fn is_mi300x_hf(id: u32) -> bool {
    matches!(id, CHIPID_MI300X_HF | CHIPID_MI300X_HF_SRIOV)
}

pub fn is_mi325x(id: u32) -> bool {
    matches!(id, CHIPID_MI325X | CHIPID_MI325X_SRIOV)
}

pub fn is_mi300(id: u32) -> bool {
    is_mi300a(id) || is_mi300x(id) || is_mi300x_hf(id)
}

pub fn is_mi3xx(id: u32) -> bool {
    is_mi300(id) || is_mi325x(id)
}

pub fn is_navi10(id: u32) -> bool {
    matches!(
        id,
        CHIPID_NAVI10_W5700X | CHIPID_NAVI10_W5700 | CHIPID_NAVI10_5700 | CHIPID_NAVI10_5600
    )
}

pub fn is_navi21(id: u32) -> bool {
    matches!(
        id,
        CHIPID_NAVI21_V620
            | CHIPID_NAVI21_W6900X
            | CHIPID_NAVI21_W6800
            | CHIPID_NAVI21_6950XT
            | CHIPID_NAVI21_W6800X
            | CHIPID_NAVI21_V620MX
            | CHIPID_NAVI21_6900XT
            | CHIPID_NAVI21_6800XT
    )
}

pub fn is_navi31(id: u32) -> bool {
    matches!(
        id,
        CHIPID_NAVI31_W7900 | CHIPID_NAVI31_7900XT | CHIPID_NAVI31_W7800
    )
}

/// Decodes a PTE MType field into its mnemonic.
///
/// The encoding is family-dependent: the compute parts use a 2-bit field, the
/// Navi parts a 3-bit one with reserved holes.
pub fn decode_mtype(mtype: u8, device_id: u32) -> Result<&'static str> {
    let name = if is_mi100(device_id) || is_mi200(device_id) || is_mi3xx(device_id) {
        match mtype {
            0 => Some("NC"),
            1 => Some("RW"),
            2 => Some("CC"),
            3 => Some("UC"),
            _ => None,
        }
    } else if is_navi10(device_id) || is_navi21(device_id) || is_navi31(device_id) {
        match mtype {
            0 => Some("C_RW_US"),
            2 => Some("C_RO_S"),
            3 => Some("UC"),
            4 => Some("C_RW_S"),
            6 => Some("C_RO_US"),
            1 | 5 | 7 => Some("RESERVED"),
            _ => None,
        }
    } else {
        None
    };
    name.ok_or_else(|| {
        Error::OutOfRange(format!(
            "no mtype decode for value {} on device {:#06x}",
            mtype, device_id
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn families_are_disjoint() {
        for id in [CHIPID_VEGA20_MI50, CHIPID_MI210, CHIPID_MI300X, CHIPID_MI325X] {
            let hits = [is_vega20(id), is_mi100(id), is_mi200(id), is_mi3xx(id)]
                .iter()
                .filter(|&&b| b)
                .count();
            assert_eq!(hits, 1, "{:#06x} matched {} families", id, hits);
        }
        assert!(is_mi300(CHIPID_MI300A_SRIOV));
        assert!(is_mi3xx(CHIPID_MI325X_SRIOV));
        assert!(!is_mi300(CHIPID_MI325X));
    }

    #[test]
    fn mtype_compute_parts() {
        assert_eq!(decode_mtype(0, CHIPID_MI300X).unwrap(), "NC");
        assert_eq!(decode_mtype(1, CHIPID_MI210).unwrap(), "RW");
        assert_eq!(decode_mtype(2, CHIPID_MI100_0).unwrap(), "CC");
        assert_eq!(decode_mtype(3, CHIPID_MI250X).unwrap(), "UC");
    }

    #[test]
    fn mtype_navi_parts() {
        assert_eq!(decode_mtype(0, CHIPID_NAVI10_5700).unwrap(), "C_RW_US");
        assert_eq!(decode_mtype(2, CHIPID_NAVI21_6900XT).unwrap(), "C_RO_S");
        assert_eq!(decode_mtype(4, CHIPID_NAVI31_W7900).unwrap(), "C_RW_S");
        assert_eq!(decode_mtype(5, CHIPID_NAVI31_W7900).unwrap(), "RESERVED");
    }

    #[test]
    fn mtype_out_of_table() {
        assert!(decode_mtype(4, CHIPID_MI300X).is_err());
        assert!(decode_mtype(0, 0x1234).is_err());
    }
}
