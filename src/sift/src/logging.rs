// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

use std::sync::Once;

use log::LevelFilter;

use crate::{Error, Result};

const LEVEL_ENV: &str = "ROCSIFT_LOG_LEVEL";

static INIT: Once = Once::new();

pub(crate) fn level_from_str(s: &str) -> Option<LevelFilter> {
    match s {
        "off" => Some(LevelFilter::Off),
        "error" => Some(LevelFilter::Error),
        "warn" => Some(LevelFilter::Warn),
        "info" => Some(LevelFilter::Info),
        "debug" => Some(LevelFilter::Debug),
        "trace" => Some(LevelFilter::Trace),
        _ => None,
    }
}

/// Installs the stderr logger, reading the level from `ROCSIFT_LOG_LEVEL`.
///
/// Logging is off unless the variable is set. An unrecognised level is a hard
/// failure so a typo does not silently disable diagnostics.
pub(crate) fn init() -> Result<()> {
    let level = match std::env::var(LEVEL_ENV) {
        Ok(v) => level_from_str(&v)
            .ok_or_else(|| Error::Generic(format!("invalid {}: {}", LEVEL_ENV, v)))?,
        Err(_) => LevelFilter::Off,
    };
    INIT.call_once(|| {
        // A logger installed by the embedding process wins.
        let _ = env_logger::Builder::new().filter_level(level).try_init();
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names() {
        assert_eq!(level_from_str("off"), Some(LevelFilter::Off));
        assert_eq!(level_from_str("debug"), Some(LevelFilter::Debug));
        assert_eq!(level_from_str("trace"), Some(LevelFilter::Trace));
        assert_eq!(level_from_str("verbose"), None);
        assert_eq!(level_from_str("DEBUG"), None);
    }
}
