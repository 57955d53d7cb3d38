// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Userspace introspection for AMD discovery-style GPUs.
//!
//! The library enumerates GPUs and their spatial partitions from the KFD
//! topology, exposes register and linear-memory accessors over the amdgpu
//! debugfs interfaces, parses the command-processor runlists the kernel
//! publishes, and translates GPU virtual addresses to physical addresses by
//! walking the same page tables the memory controller walks.
//!
//! Everything hangs off an [`Engine`]: devices and partitions live in two
//! append-only vectors and are addressed through copyable index handles.
//! Acquire an engine through [`Sift::init`], which reference-counts a single
//! process-wide instance so independent initialisers nest correctly.

#![cfg(target_os = "linux")]

use std::sync::{Arc, Mutex};

pub mod chip;
pub mod debugfs;
pub mod drm;
pub mod engine;
mod fsutil;
pub mod ipdiscovery;
pub mod kfd;
mod logging;
pub mod pm4;
pub mod xlator;

mod device;
mod partition;

pub use device::{Device, DeviceId};
pub use engine::{Aperture, Engine, EngineRoots, MemRegion};
pub use partition::{Partition, PartitionId};
pub use xlator::{Fragment, Translation, Xlator};

/// Library errors, one variant per surfaced status kind.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Generic fatal error.
    #[error("{0}")]
    Generic(String),
    /// An internal invariant was violated; never expected on any input.
    #[error("code bug: {0}")]
    CodeBug(String),
    /// The backing kernel interface is unavailable (typically: not root).
    #[error("not privileged: {0}")]
    NotPrivileged(String),
    /// An index or address fell outside the enumerable or accessible space.
    #[error("out of range: {0}")]
    OutOfRange(String),
    /// A backend I/O operation failed; the caller may retry.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Dedicated [`Result`](https://doc.rust-lang.org/std/result/) type.
pub type Result<T> = std::result::Result<T, Error>;

struct EngineCell {
    refs: usize,
    engine: Option<Arc<Engine>>,
}

static ENGINE: Mutex<EngineCell> = Mutex::new(EngineCell {
    refs: 0,
    engine: None,
});

/// Reference-counted handle to the process-wide [`Engine`].
///
/// The first `init` builds the engine; nested `init`s share it; dropping the
/// last handle tears it down. The engine's contents are immutable after
/// construction, so shared handles never observe it change.
pub struct Sift {
    engine: Arc<Engine>,
}

impl Sift {
    /// Initialises (or attaches to) the global engine.
    pub fn init() -> Result<Sift> {
        let mut cell = ENGINE.lock().expect("engine lock poisoned");
        if cell.refs == 0 {
            if cell.engine.is_some() {
                return Err(Error::CodeBug(
                    "engine alive with zero references".to_string(),
                ));
            }
            cell.engine = Some(Arc::new(Engine::new()?));
        }
        cell.refs += 1;
        Ok(Sift {
            engine: cell.engine.as_ref().expect("engine just created").clone(),
        })
    }

    /// The engine this handle refers to.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }
}

impl Drop for Sift {
    fn drop(&mut self) {
        let mut cell = ENGINE.lock().expect("engine lock poisoned");
        cell.refs -= 1;
        if cell.refs == 0 {
            cell.engine = None;
        }
    }
}

impl std::ops::Deref for Sift {
    type Target = Engine;

    fn deref(&self) -> &Engine {
        &self.engine
    }
}
