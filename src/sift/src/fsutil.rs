// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

use std::fs;
use std::path::Path;

use crate::{Error, Result};

pub(crate) fn read_trimmed(path: &Path) -> Result<String> {
    Ok(fs::read_to_string(path)?.trim().to_string())
}

pub(crate) fn read_u64_dec(path: &Path) -> Result<u64> {
    let text = read_trimmed(path)?;
    text.parse::<u64>()
        .map_err(|e| Error::Generic(format!("{}: bad integer {:?}: {}", path.display(), text, e)))
}

/// Parses a decimal or `0x`-prefixed hexadecimal integer.
pub(crate) fn parse_u64_auto(text: &str) -> Result<u64> {
    let text = text.trim();
    let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        text.parse::<u64>()
    };
    parsed.map_err(|e| Error::Generic(format!("bad integer {:?}: {}", text, e)))
}
