use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};

use crate::errors::{Result, ShmemLibError};
use crate::registry::{Handle, ShMemRegistry, NO_HANDLE};
use crate::segment::SharedMem;

mod smart;

pub use smart::{SmartPtr, ARRAY_TYPE, SHARED_MEM_TYPE, UNMANAGED_TYPE};

/// Pointer into a registered segment as (handle, byte offset).
///
/// The address is recomputed from the registry on every access: the base of
/// a segment differs from process to process.
pub struct ShMemPtr<T> {
    handle: Handle,
    offset: i32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ShMemPtr<T> {
    /// Offset of `p` from the start of `mem`.
    pub fn new(mem: &SharedMem, p: *const T) -> Result<ShMemPtr<T>> {
        if mem.handle() == NO_HANDLE {
            return Err(ShmemLibError::logic(format!(
                "{} has no handle and cannot back relative pointers",
                mem.name()
            )));
        }
        if !mem.contains(p as *const u8) {
            return Err(ShmemLibError::InvalidPointer {
                segment: mem.name().to_string(),
                offset: (p as usize).wrapping_sub(mem.begin() as usize),
            });
        }
        let offset = p as usize - mem.begin() as usize;
        let offset = i32::try_from(offset).map_err(|_| ShmemLibError::InvalidPointer {
            segment: mem.name().to_string(),
            offset,
        })?;
        Ok(ShMemPtr::at(mem.handle(), offset))
    }

    /// Start of `mem`.
    pub fn base_of(mem: &SharedMem) -> ShMemPtr<T> {
        ShMemPtr::at(mem.handle(), 0)
    }

    pub const fn at(handle: Handle, offset: i32) -> ShMemPtr<T> {
        ShMemPtr {
            handle,
            offset,
            _marker: PhantomData,
        }
    }

    pub const fn null() -> ShMemPtr<T> {
        ShMemPtr::at(NO_HANDLE, 0)
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn offset(&self) -> i32 {
        self.offset
    }

    pub fn set(&mut self, handle: Handle, offset: i32) {
        self.handle = handle;
        self.offset = offset;
    }

    /// Null is an unset handle; offset 0 is a real address.
    pub fn is_null(&self) -> bool {
        self.handle == NO_HANDLE
    }

    pub fn set_null(&mut self) {
        self.handle = NO_HANDLE;
    }

    /// Non-null and inside the registered segment.
    pub fn is_valid(&self, registry: &ShMemRegistry) -> bool {
        !self.is_null()
            && self.offset >= 0
            && registry
                .get(self.handle)
                .map_or(false, |m| m.is_valid() && (self.offset as usize) < m.size())
    }

    /// Address in this process; null for a null pointer or an unknown handle.
    pub fn get(&self, registry: &ShMemRegistry) -> *mut T {
        if self.is_null() {
            return ptr::null_mut();
        }
        let base = registry.base(self.handle);
        if base.is_null() {
            return ptr::null_mut();
        }
        unsafe { self.unchecked(base) }
    }

    /// Address in this process, or an error for null, unknown or out of range
    /// pointers.
    pub fn checked(&self, registry: &ShMemRegistry) -> Result<NonNull<T>> {
        if self.is_null() {
            return Err(ShmemLibError::NullPointer);
        }
        let mem = registry
            .get(self.handle)
            .ok_or(ShmemLibError::NotRegistered(self.handle))?;
        if self.offset < 0 || self.offset as usize >= mem.size() {
            return Err(ShmemLibError::InvalidPointer {
                segment: mem.name().to_string(),
                offset: self.offset as usize,
            });
        }
        NonNull::new(unsafe { self.unchecked(mem.begin()) }).ok_or(ShmemLibError::NullPointer)
    }

    /// Pointer arithmetic only, for inner loops that already hold the base.
    ///
    /// # Safety
    /// `base` must be this process's base address of the pointer's segment.
    pub unsafe fn unchecked(&self, base: *mut u8) -> *mut T {
        base.offset(self.offset as isize) as *mut T
    }

    /// Element `i` counted from this pointer.
    ///
    /// # Safety
    /// As for [`ShMemPtr::unchecked`]; element `i` must lie inside the segment.
    pub unsafe fn index(&self, base: *mut u8, i: usize) -> *mut T {
        self.unchecked(base).add(i)
    }

    /// Same segment, `count` elements further. Fails if the offset leaves
    /// the `i32` range.
    pub fn add(&self, count: usize) -> Result<ShMemPtr<T>> {
        count
            .checked_mul(mem::size_of::<T>())
            .and_then(|bytes| i32::try_from(bytes).ok())
            .and_then(|bytes| self.offset.checked_add(bytes))
            .map(|offset| ShMemPtr::at(self.handle, offset))
            .ok_or_else(|| {
                ShmemLibError::logic(format!("{:?} + {} elements overflows the offset", self, count))
            })
    }

    pub fn cast<U>(&self) -> ShMemPtr<U> {
        ShMemPtr::at(self.handle, self.offset)
    }

    pub fn swap(&mut self, other: &mut ShMemPtr<T>) {
        mem::swap(self, other);
    }

    /// Compare by resolved address rather than by (handle, offset).
    pub fn same_address(&self, other: &ShMemPtr<T>, registry: &ShMemRegistry) -> bool {
        self.get(registry) == other.get(registry)
    }
}

impl<T> Clone for ShMemPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ShMemPtr<T> {}

impl<T> Default for ShMemPtr<T> {
    fn default() -> Self {
        ShMemPtr::null()
    }
}

impl<T> PartialEq for ShMemPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle && self.offset == other.offset
    }
}

impl<T> Eq for ShMemPtr<T> {}

impl<T> fmt::Debug for ShMemPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[[#{}: {}]]", self.handle, self.offset)
    }
}
