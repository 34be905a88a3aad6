use std::mem;
use std::ptr::NonNull;
use std::slice;
use std::sync::Arc;

use crate::errors::{Result, ShmemLibError};
use crate::message::{demarshal_array, marshal_array, MessageBuffer, Primitive, Serializable};
use crate::ptr::ShMemPtr;
use crate::registry::{Handle, ShMemRegistry};

pub const ARRAY_TYPE: i32 = 0;
pub const UNMANAGED_TYPE: i32 = 1;
pub const SHARED_MEM_TYPE: i32 = 2;

/// Array of primitives owned in one of three ways.
///
/// On the wire: element count, kind tag, then either the elements or, for
/// shared memory when the buffer's reader can resolve it, the relative
/// pointer alone.
#[derive(Clone)]
pub enum SmartPtr<T: Primitive> {
    Array(Arc<[T]>),
    SharedMemory { ptr: ShMemPtr<T>, len: usize },
    /// Memory owned elsewhere in this process; sent by value.
    Unmanaged { ptr: NonNull<T>, len: usize },
}

impl<T: Primitive> SmartPtr<T> {
    pub fn from_vec(values: Vec<T>) -> SmartPtr<T> {
        SmartPtr::Array(values.into())
    }

    pub fn shared(ptr: ShMemPtr<T>, len: usize) -> SmartPtr<T> {
        SmartPtr::SharedMemory { ptr, len }
    }

    /// # Safety
    /// `ptr` must be valid for reads of `len` elements for as long as the
    /// returned pointer or any clone of it is used.
    pub unsafe fn unmanaged(ptr: NonNull<T>, len: usize) -> SmartPtr<T> {
        SmartPtr::Unmanaged { ptr, len }
    }

    pub fn len(&self) -> usize {
        match self {
            SmartPtr::Array(values) => values.len(),
            SmartPtr::SharedMemory { len, .. } | SmartPtr::Unmanaged { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wire tag of this variant.
    pub fn kind(&self) -> i32 {
        match self {
            SmartPtr::Array(_) => ARRAY_TYPE,
            SmartPtr::SharedMemory { .. } => SHARED_MEM_TYPE,
            SmartPtr::Unmanaged { .. } => UNMANAGED_TYPE,
        }
    }

    /// Run `f` over the elements, resolving shared memory through `registry`.
    pub fn with_slice<R, F>(&self, registry: &ShMemRegistry, f: F) -> Result<R>
    where
        F: FnOnce(&[T]) -> R,
    {
        match self {
            SmartPtr::Array(values) => Ok(f(&values[..])),
            SmartPtr::Unmanaged { ptr, len } => Ok(f(unsafe { slice::from_raw_parts(ptr.as_ptr(), *len) })),
            SmartPtr::SharedMemory { ptr, len } => {
                if ptr.is_null() {
                    return Err(ShmemLibError::NullPointer);
                }
                // one lookup; the Arc keeps the segment mapped while `f` runs
                let mem = registry
                    .get(ptr.handle())
                    .ok_or(ShmemLibError::NotRegistered(ptr.handle()))?;
                let invalid = || ShmemLibError::InvalidPointer {
                    segment: mem.name().to_string(),
                    offset: ptr.offset() as usize,
                };
                let offset = usize::try_from(ptr.offset()).map_err(|_| invalid())?;
                let end = len
                    .checked_mul(T::SIZE)
                    .and_then(|bytes| offset.checked_add(bytes))
                    .ok_or_else(invalid)?;
                if !mem.is_valid() || offset >= mem.size() || end > mem.size() {
                    return Err(invalid());
                }
                let start = unsafe { mem.begin().add(offset) } as *const T;
                if start as usize % mem::align_of::<T>() != 0 {
                    return Err(invalid());
                }
                Ok(f(unsafe { slice::from_raw_parts(start, *len) }))
            }
        }
    }

    pub fn to_vec(&self, registry: &ShMemRegistry) -> Result<Vec<T>> {
        self.with_slice(registry, |values| values.to_vec())
    }
}

impl<T: Primitive> Serializable for SmartPtr<T> {
    fn serialize(&self, buffer: &mut MessageBuffer) -> Result<()> {
        let len = i32::try_from(self.len())
            .map_err(|_| ShmemLibError::Protocol(format!("{} elements do not fit i32", self.len())))?;
        match self {
            SmartPtr::Array(values) => {
                len.serialize(buffer)?;
                ARRAY_TYPE.serialize(buffer)?;
                marshal_array(buffer, &values[..])
            }
            SmartPtr::Unmanaged { ptr, len: n } => {
                len.serialize(buffer)?;
                ARRAY_TYPE.serialize(buffer)?;
                marshal_array(buffer, unsafe { slice::from_raw_parts(ptr.as_ptr(), *n) })
            }
            SmartPtr::SharedMemory { ptr, .. } if buffer.supports_shmem_access() => {
                len.serialize(buffer)?;
                SHARED_MEM_TYPE.serialize(buffer)?;
                ptr.serialize(buffer)
            }
            SmartPtr::SharedMemory { ptr, .. } => {
                let values = match buffer.registry() {
                    Some(registry) => self.to_vec(registry)?,
                    None => return Err(ShmemLibError::NotRegistered(ptr.handle())),
                };
                len.serialize(buffer)?;
                ARRAY_TYPE.serialize(buffer)?;
                marshal_array(buffer, &values)
            }
        }
    }

    fn deserialize(buffer: &MessageBuffer) -> Result<Self> {
        let len = i32::deserialize(buffer)?;
        let len = usize::try_from(len).map_err(|_| ShmemLibError::Protocol(format!("negative length {}", len)))?;
        match i32::deserialize(buffer)? {
            ARRAY_TYPE | UNMANAGED_TYPE => Ok(SmartPtr::from_vec(demarshal_array(buffer, len)?)),
            SHARED_MEM_TYPE => {
                let handle = Handle::deserialize(buffer)?;
                let offset = i32::deserialize(buffer)?;
                Ok(SmartPtr::shared(ShMemPtr::at(handle, offset), len))
            }
            tag => Err(ShmemLibError::Protocol(format!("unknown pointer kind {}", tag))),
        }
    }
}
