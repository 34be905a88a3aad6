use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};

use crate::errors::Result;
use crate::registry::{Handle, ShMemRegistry};
use crate::segment::{ShMemMode, SharedMem};

pub static DEFAULT_SHMEM_NAME: &'static str = "shmsg";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShmemConfig {
    pub name: String,
    pub handle: Handle,
    /// Bytes; 0 opens an existing segment at its current size.
    pub size: usize,
    pub mode: ShMemMode,
}

impl Default for ShmemConfig {
    fn default() -> Self {
        ShmemConfig {
            name: DEFAULT_SHMEM_NAME.to_string(),
            handle: 0,
            size: 1 << 20,
            mode: ShMemMode::STD_SERVER,
        }
    }
}

impl ShmemConfig {
    /// Map the configured segment.
    pub fn open(&self) -> Result<Arc<SharedMem>> {
        Ok(Arc::new(SharedMem::with_handle(self.handle, &self.name, self.mode, self.size)?))
    }

    /// Map the configured segment and register it.
    pub fn open_registered(&self, registry: &ShMemRegistry) -> Result<Arc<SharedMem>> {
        let mem = self.open()?;
        registry.register(&mem)?;
        Ok(mem)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// Usable bytes per block, rounded up to the header alignment.
    pub payload_size: usize,
    /// Fraction of the ring scanned before a successful allocation counts as
    /// a high fill level.
    pub fill_warn_ratio: f64,
}

impl Default for RingConfig {
    fn default() -> Self {
        RingConfig {
            payload_size: 4096,
            fill_warn_ratio: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapConfig {
    /// Merge-and-retry cycles before an allocation gives up.
    pub max_merge_retries: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        HeapConfig { max_merge_retries: 10 }
    }
}
