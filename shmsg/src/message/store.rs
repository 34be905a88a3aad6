use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use crate::errors::{Result, ShmemLibError};
use crate::heap::SharedHeap;
use crate::ptr::ShMemPtr;
use crate::registry::ShMemRegistry;
use crate::ring::ShMemRingAllocator;

/// Where a [`MessageBuffer`](crate::message::MessageBuffer) gets its blocks.
pub trait BufferStore {
    /// A block of at least `size` bytes held once; returns its capacity.
    fn allocate(&self, size: usize) -> Result<(NonNull<u8>, usize)>;

    /// Drop one hold on `block`.
    fn release(&self, block: NonNull<u8>) -> Result<()>;

    /// Turn the writer's single hold into `readers` holds.
    fn share(&self, block: NonNull<u8>, readers: i32) -> Result<()>;

    fn to_relative(&self, block: NonNull<u8>) -> Result<ShMemPtr<u8>>;

    /// Block and capacity behind a relative pointer received from a writer.
    fn resolve(&self, rel: ShMemPtr<u8>) -> Result<(NonNull<u8>, usize)>;

    /// True if relative pointers written into blocks of this store can be
    /// resolved by the reader.
    fn supports_shmem_access(&self) -> bool;

    fn registry(&self) -> Option<&ShMemRegistry>;
}

/// Process-local blocks; nothing leaves the process.
pub struct LocalStore {
    // u64 words keep blocks 8-byte aligned
    blocks: Mutex<HashMap<usize, Box<[u64]>>>,
    registry: Option<Arc<ShMemRegistry>>,
    shmem_access: bool,
}

impl LocalStore {
    pub fn new() -> LocalStore {
        LocalStore {
            blocks: Mutex::new(HashMap::new()),
            registry: None,
            shmem_access: false,
        }
    }

    /// Local blocks whose readers share this registry, so relative pointers
    /// marshaled into them stay meaningful.
    pub fn with_shmem_access(registry: Arc<ShMemRegistry>) -> LocalStore {
        LocalStore::with_registry(registry, true)
    }

    /// Local blocks that resolve shared memory through `registry` when
    /// writing; without `shmem_access` shared data is copied in by value.
    pub fn with_registry(registry: Arc<ShMemRegistry>, shmem_access: bool) -> LocalStore {
        LocalStore {
            blocks: Mutex::new(HashMap::new()),
            registry: Some(registry),
            shmem_access,
        }
    }

    pub fn live_blocks(&self) -> usize {
        self.blocks.lock().map_or(0, |b| b.len())
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        LocalStore::new()
    }
}

impl BufferStore for LocalStore {
    fn allocate(&self, size: usize) -> Result<(NonNull<u8>, usize)> {
        let words = (size + 7) / 8;
        let mut block = vec![0u64; words.max(1)].into_boxed_slice();
        let ptr = NonNull::new(block.as_mut_ptr() as *mut u8).ok_or(ShmemLibError::NullPointer)?;
        self.blocks.lock()?.insert(ptr.as_ptr() as usize, block);
        Ok((ptr, words * 8))
    }

    fn release(&self, block: NonNull<u8>) -> Result<()> {
        match self.blocks.lock()?.remove(&(block.as_ptr() as usize)) {
            Some(_) => Ok(()),
            None => Err(ShmemLibError::DoubleFree { offset: 0 }),
        }
    }

    fn share(&self, _block: NonNull<u8>, readers: i32) -> Result<()> {
        if readers != 1 {
            return Err(ShmemLibError::logic("local blocks have a single reader"));
        }
        Ok(())
    }

    fn to_relative(&self, _block: NonNull<u8>) -> Result<ShMemPtr<u8>> {
        Err(ShmemLibError::logic("local blocks are not in shared memory"))
    }

    fn resolve(&self, rel: ShMemPtr<u8>) -> Result<(NonNull<u8>, usize)> {
        Err(ShmemLibError::logic(format!("{:?} does not name a local block", rel)))
    }

    fn supports_shmem_access(&self) -> bool {
        self.shmem_access
    }

    fn registry(&self) -> Option<&ShMemRegistry> {
        self.registry.as_deref()
    }
}

/// Fixed blocks from a ring; a request above the payload size cannot grow.
pub struct RingStore {
    ring: Arc<ShMemRingAllocator>,
    registry: Arc<ShMemRegistry>,
}

impl RingStore {
    pub fn new(ring: Arc<ShMemRingAllocator>, registry: Arc<ShMemRegistry>) -> RingStore {
        RingStore { ring, registry }
    }

    pub fn ring(&self) -> &Arc<ShMemRingAllocator> {
        &self.ring
    }
}

impl BufferStore for RingStore {
    fn allocate(&self, size: usize) -> Result<(NonNull<u8>, usize)> {
        let available = self.ring.payload_size();
        if size > available {
            return Err(ShmemLibError::BufferOverflow {
                requested: size,
                available,
            });
        }
        Ok((self.ring.alloc_block(1)?, available))
    }

    fn release(&self, block: NonNull<u8>) -> Result<()> {
        self.ring.free_block(block)
    }

    fn share(&self, block: NonNull<u8>, readers: i32) -> Result<()> {
        if readers == 1 {
            return Ok(());
        }
        self.ring.lock_for_reading(block, readers)
    }

    fn to_relative(&self, block: NonNull<u8>) -> Result<ShMemPtr<u8>> {
        self.ring.to_shmem_ptr(block)
    }

    fn resolve(&self, rel: ShMemPtr<u8>) -> Result<(NonNull<u8>, usize)> {
        let block = rel.checked(&self.registry)?;
        self.ring.offset_of(block)?;
        Ok((block, self.ring.payload_size()))
    }

    fn supports_shmem_access(&self) -> bool {
        true
    }

    fn registry(&self) -> Option<&ShMemRegistry> {
        Some(&self.registry)
    }
}

/// Variable blocks from a locked free-list heap; one reader per block.
pub struct HeapStore {
    heap: Arc<SharedHeap>,
    registry: Arc<ShMemRegistry>,
}

impl HeapStore {
    pub fn new(heap: Arc<SharedHeap>, registry: Arc<ShMemRegistry>) -> HeapStore {
        HeapStore { heap, registry }
    }
}

impl BufferStore for HeapStore {
    fn allocate(&self, size: usize) -> Result<(NonNull<u8>, usize)> {
        self.heap.with_lock(|heap| match heap.alloc(size) {
            Some(block) => Ok((block, heap.block_size(block)?)),
            None => Err(ShmemLibError::BufferOverflow {
                requested: size,
                available: heap.get_max_free_mem_block(),
            }),
        })?
    }

    fn release(&self, block: NonNull<u8>) -> Result<()> {
        self.heap.free(block)
    }

    fn share(&self, _block: NonNull<u8>, readers: i32) -> Result<()> {
        if readers != 1 {
            return Err(ShmemLibError::logic("heap blocks have a single reader"));
        }
        Ok(())
    }

    fn to_relative(&self, block: NonNull<u8>) -> Result<ShMemPtr<u8>> {
        ShMemPtr::new(&self.heap.memory(), block.as_ptr())
    }

    fn resolve(&self, rel: ShMemPtr<u8>) -> Result<(NonNull<u8>, usize)> {
        let block = rel.checked(&self.registry)?;
        let capacity = self.heap.lock()?.block_size(block)?;
        Ok((block, capacity))
    }

    fn supports_shmem_access(&self) -> bool {
        true
    }

    fn registry(&self) -> Option<&ShMemRegistry> {
        Some(&self.registry)
    }
}
