use std::sync::{Arc, RwLock, Weak};

use log::debug;

use crate::errors::{Result, ShmemLibError};
use crate::ptr::ShMemPtr;
use crate::segment::SharedMem;

/// Small integer naming a segment within one process.
pub type Handle = i32;

pub const NO_HANDLE: Handle = -1;

/// Upper bound for caller-assigned handles; the table is indexed by handle.
pub const MAX_HANDLES: usize = 1024;

struct ShMemEntry {
    handle: Handle,
    name: String,
    size: usize,
    // the segment belongs to whoever constructed it
    memory: Weak<SharedMem>,
}

/// Per-process table from handle (and name) to a mapped segment.
///
/// Every process sharing a segment registers it under the same handle, so a
/// relative pointer written in one process resolves in the other against that
/// process's own base address. One registry is built at start-up and handed to
/// the components that resolve relative pointers.
#[derive(Default)]
pub struct ShMemRegistry {
    entries: RwLock<Vec<Option<ShMemEntry>>>,
}

impl ShMemRegistry {
    pub fn new() -> ShMemRegistry {
        ShMemRegistry::default()
    }

    /// Register `memory` under `handle`. If the handle or the name is already
    /// known, the existing handle is returned and nothing changes.
    pub fn register_memory(&self, handle: Handle, name: &str, memory: &Arc<SharedMem>, size: usize) -> Result<Handle> {
        if handle < 0 || handle as usize >= MAX_HANDLES {
            return Err(ShmemLibError::logic(format!("handle {} out of range", handle)));
        }
        let mut entries = self.entries.write()?;
        if let Some(existing) = entries.iter().flatten().find(|e| e.handle == handle || e.name == name) {
            debug!("{} already registered as #{}", name, existing.handle);
            return Ok(existing.handle);
        }
        if memory.handle() != handle {
            return Err(ShmemLibError::logic(format!(
                "segment {} carries handle {}, registered as {}",
                memory.name(),
                memory.handle(),
                handle
            )));
        }
        let index = handle as usize;
        if entries.len() <= index {
            entries.resize_with(index + 1, || None);
        }
        entries[index] = Some(ShMemEntry {
            handle,
            name: name.to_string(),
            size,
            memory: Arc::downgrade(memory),
        });
        debug!("registered {} as #{} ({} bytes)", name, handle, size);
        Ok(handle)
    }

    /// Register a segment under its own handle and name.
    pub fn register(&self, memory: &Arc<SharedMem>) -> Result<Handle> {
        self.register_memory(memory.handle(), memory.name(), memory, memory.size())
    }

    /// The segment behind `handle`, if registered and still alive.
    pub fn get(&self, handle: Handle) -> Option<Arc<SharedMem>> {
        if handle < 0 {
            return None;
        }
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(handle as usize)
            .and_then(|e| e.as_ref())
            .and_then(|e| e.memory.upgrade())
    }

    /// The segment behind `handle`.
    ///
    /// # Panics
    /// If the handle is not registered; that is a programming error.
    pub fn segment(&self, handle: Handle) -> Arc<SharedMem> {
        match self.get(handle) {
            Some(mem) => mem,
            None => panic!("shared memory handle {} is not registered", handle),
        }
    }

    /// Base address of the segment in this process, null if unknown.
    pub fn base(&self, handle: Handle) -> *mut u8 {
        self.get(handle).map_or(std::ptr::null_mut(), |m| m.begin())
    }

    /// Name registered for `handle`, empty if none.
    pub fn name(&self, handle: Handle) -> String {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .flatten()
            .find(|e| e.handle == handle)
            .map(|e| e.name.clone())
            .unwrap_or_default()
    }

    /// Size recorded at registration, 0 if unknown.
    pub fn size(&self, handle: Handle) -> usize {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .flatten()
            .find(|e| e.handle == handle)
            .map_or(0, |e| e.size)
    }

    /// Handle registered for `name`, [`NO_HANDLE`] if none.
    pub fn find_handle(&self, name: &str) -> Handle {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .flatten()
            .find(|e| e.name == name)
            .map_or(NO_HANDLE, |e| e.handle)
    }

    /// Resolve a relative pointer against this process's mapping.
    pub fn resolve<T>(&self, p: ShMemPtr<T>) -> *mut T {
        p.get(self)
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
