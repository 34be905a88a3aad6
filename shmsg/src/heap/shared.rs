use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::Arc;

use log::debug;
use raw_sync::locks::{LockGuard, LockImpl, LockInit, Mutex};

use crate::config::HeapConfig;
use crate::errors::{Result, ShmemLibError};
use crate::heap::ShMemAllocator;
use crate::segment::SharedMem;

/// Free-list heap guarded by a process-shared mutex that lives at the start
/// of the segment, in front of the heap region.
pub struct SharedHeap {
    lock: Box<dyn LockImpl>,
    heap: UnsafeCell<ShMemAllocator>,
    // readable without the lock
    memory: Arc<SharedMem>,
}

// the allocator is only reached through the cross-process mutex
unsafe impl Send for SharedHeap {}
unsafe impl Sync for SharedHeap {}

/// Locked access to the allocator; the mutex is released on drop.
pub struct HeapGuard<'a> {
    _guard: LockGuard<'a>,
    heap: &'a mut ShMemAllocator,
}

impl SharedHeap {
    /// Create the mutex and lay out an empty heap behind it.
    pub fn new(memory: Arc<SharedMem>, config: &HeapConfig) -> Result<SharedHeap> {
        SharedHeap::open(memory, config, true)
    }

    /// Join the mutex and heap another process created.
    pub fn attach(memory: Arc<SharedMem>, config: &HeapConfig) -> Result<SharedHeap> {
        SharedHeap::open(memory, config, false)
    }

    fn open(memory: Arc<SharedMem>, config: &HeapConfig, create: bool) -> Result<SharedHeap> {
        let base = memory.begin();
        if base.is_null() {
            return Err(ShmemLibError::logic(format!("{} is not mapped", memory.name())));
        }
        let lock_size = Mutex::size_of(Some(base));
        if lock_size >= memory.size() {
            return Err(ShmemLibError::logic(format!(
                "{} is too small for a heap lock",
                memory.name()
            )));
        }
        let data = unsafe { base.add(lock_size) };
        let (lock, _) = unsafe {
            if create {
                Mutex::new(base, data)
            } else {
                Mutex::from_existing(base, data)
            }
        }
        .map_err(ShmemLibError::lock)?;
        let len = memory.size() - lock_size;
        let heap = ShMemAllocator::with_region(memory.clone(), lock_size, len, config, create)?;
        debug!(
            "{} heap in {} behind a {} byte lock",
            if create { "created" } else { "attached" },
            heap.memory().name(),
            lock_size
        );
        Ok(SharedHeap {
            lock,
            heap: UnsafeCell::new(heap),
            memory,
        })
    }

    /// Block until the mutex is held.
    pub fn lock(&self) -> Result<HeapGuard<'_>> {
        let guard = self.lock.lock().map_err(ShmemLibError::lock)?;
        Ok(HeapGuard {
            _guard: guard,
            heap: unsafe { &mut *self.heap.get() },
        })
    }

    /// Run `f` with the allocator locked.
    pub fn with_lock<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut ShMemAllocator) -> R,
    {
        let mut guard = self.lock()?;
        Ok(f(&mut *guard))
    }

    pub fn alloc(&self, size: usize) -> Result<Option<NonNull<u8>>> {
        self.with_lock(|heap| heap.alloc(size))
    }

    pub fn free(&self, p: NonNull<u8>) -> Result<()> {
        self.with_lock(|heap| heap.free(p))?
    }

    pub fn memory(&self) -> Arc<SharedMem> {
        self.memory.clone()
    }
}

impl<'a> Deref for HeapGuard<'a> {
    type Target = ShMemAllocator;

    fn deref(&self) -> &ShMemAllocator {
        self.heap
    }
}

impl<'a> DerefMut for HeapGuard<'a> {
    fn deref_mut(&mut self) -> &mut ShMemAllocator {
        self.heap
    }
}
