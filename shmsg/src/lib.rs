pub mod config;
pub mod errors;
pub mod heap;
pub mod message;
pub mod ptr;
pub mod registry;
pub mod ring;
pub mod segment;

#[cfg(test)]
mod tests;

pub use config::{HeapConfig, RingConfig, ShmemConfig};
pub use errors::{Result, ShmemLibError};
pub use heap::{SharedHeap, ShMemAllocator};
pub use message::{demarshal, marshal, BufferStore, MessageBuffer, Serializable};
pub use ptr::{ShMemPtr, SmartPtr};
pub use registry::{Handle, ShMemRegistry, NO_HANDLE};
pub use ring::ShMemRingAllocator;
pub use segment::{ShMemMode, SharedMem};
