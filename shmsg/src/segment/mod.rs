use std::ffi::CString;
use std::fmt;
use std::ops::BitOr;
use std::ptr::{self, NonNull};

use ::shared_memory::{Shmem, ShmemConf, ShmemError};
use log::{debug, error, warn};
use once_cell::sync::OnceCell;
use serde_derive::{Deserialize, Serialize};

use crate::errors::{Result, ShmemLibError};
use crate::ptr::ShMemPtr;
use crate::registry::{Handle, NO_HANDLE};

/// Open/create behaviour of a segment, a bitset.
#[derive(Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShMemMode(u32);

impl ShMemMode {
    /// Segment must already exist.
    pub const FAIL_NEW: ShMemMode = ShMemMode(0);
    pub const CREATE_NEW: ShMemMode = ShMemMode(1);
    /// Unlink an existing segment before creating it again.
    pub const RECREATE_OLD: ShMemMode = ShMemMode(2);
    /// Owner unlinks the OS object when the segment is dropped.
    pub const KILL_ON_CLOSE: ShMemMode = ShMemMode(4);
    /// Without this flag the mapping is read-only.
    pub const WRITE_ACCESS: ShMemMode = ShMemMode(8);
    pub const LOCKED: ShMemMode = ShMemMode(16);

    pub const STD_CLIENT: ShMemMode = ShMemMode(1 | 8);
    pub const STD_LOCKED_CLIENT: ShMemMode = ShMemMode(1 | 8 | 16);
    pub const STD_SERVER: ShMemMode = ShMemMode(1 | 8 | 4);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> ShMemMode {
        ShMemMode(bits & 31)
    }

    pub const fn contains(self, other: ShMemMode) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn create_new(self) -> bool {
        self.0 & (Self::CREATE_NEW.0 | Self::RECREATE_OLD.0) != 0
    }

    pub fn recreate_old(self) -> bool {
        self.contains(Self::RECREATE_OLD)
    }

    pub fn kill_on_close(self) -> bool {
        self.contains(Self::KILL_ON_CLOSE)
    }

    pub fn write_access(self) -> bool {
        self.contains(Self::WRITE_ACCESS)
    }

    pub fn locked(self) -> bool {
        self.contains(Self::LOCKED)
    }
}

impl BitOr for ShMemMode {
    type Output = ShMemMode;

    fn bitor(self, rhs: ShMemMode) -> ShMemMode {
        ShMemMode(self.0 | rhs.0)
    }
}

impl fmt::Debug for ShMemMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::CREATE_NEW, "CreateNew"),
            (Self::RECREATE_OLD, "RecreateOld"),
            (Self::KILL_ON_CLOSE, "KillOnClose"),
            (Self::WRITE_ACCESS, "WriteAccess"),
            (Self::LOCKED, "Locked"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            write!(f, "ShMemMode(FailNew)")
        } else {
            write!(f, "ShMemMode({})", set.join(" | "))
        }
    }
}

// The variants own the memory behind `Mapping::base`; only dropped, never read.
enum Backing {
    #[allow(dead_code)]
    Os(Shmem),
    // u64 words keep the base 8-byte aligned
    #[allow(dead_code)]
    Heap(Box<[u64]>),
    Unmanaged,
}

struct Mapping {
    base: NonNull<u8>,
    size: usize,
    owner: bool,
    backing: Backing,
}

// The mapping is plain memory shared with other processes; every access to
// its content goes through atomics or caller-serialized allocators.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

/// One named shared memory block mapped into this process.
///
/// The base address is process-local. A segment may be created empty with a
/// handle and a name and mapped later through [`SharedMem::set`], so that a
/// registry can record the pairing before the backing store exists.
pub struct SharedMem {
    handle: Handle,
    name: String,
    mapping: OnceCell<Mapping>,
}

impl SharedMem {
    /// Empty, unmapped segment without a handle.
    pub fn new() -> SharedMem {
        SharedMem::deferred(NO_HANDLE, "")
    }

    /// Unmanaged segment: mapped, but carries no handle and therefore cannot
    /// back relative pointers.
    pub fn open(name: &str, mode: ShMemMode, size: usize) -> Result<SharedMem> {
        SharedMem::with_handle(NO_HANDLE, name, mode, size)
    }

    pub fn with_handle(handle: Handle, name: &str, mode: ShMemMode, size: usize) -> Result<SharedMem> {
        let mem = SharedMem::deferred(handle, name);
        mem.set(mode, size)?;
        Ok(mem)
    }

    /// Handle and name only; the OS object is opened by a later `set`.
    pub fn deferred(handle: Handle, name: &str) -> SharedMem {
        SharedMem {
            handle,
            name: os_name(name),
            mapping: OnceCell::new(),
        }
    }

    /// Process-local memory standing in for an OS segment.
    pub fn from_heap(handle: Handle, name: &str, size: usize) -> SharedMem {
        let mut words = vec![0u64; (size + 7) / 8].into_boxed_slice();
        let base = NonNull::new(words.as_mut_ptr() as *mut u8).unwrap_or(NonNull::dangling());
        let mem = SharedMem::deferred(handle, name);
        let _ = mem.mapping.set(Mapping {
            base,
            size,
            owner: true,
            backing: Backing::Heap(words),
        });
        mem
    }

    /// View over memory owned by the caller.
    ///
    /// # Safety
    /// `base` must be valid for reads and writes of `size` bytes, aligned to
    /// 8 bytes, and must outlive the returned segment.
    pub unsafe fn from_raw(handle: Handle, name: &str, base: NonNull<u8>, size: usize) -> SharedMem {
        let mem = SharedMem::deferred(handle, name);
        let _ = mem.mapping.set(Mapping {
            base,
            size,
            owner: false,
            backing: Backing::Unmanaged,
        });
        mem
    }

    /// Open or create the OS object and map it. A `size` of 0 takes the size
    /// of the existing object. On failure the segment stays unmapped.
    pub fn set(&self, mode: ShMemMode, size: usize) -> Result<()> {
        if self.mapping.get().is_some() {
            return Err(ShmemLibError::logic(format!("{} is already mapped", self.name)));
        }
        if self.name.len() <= 1 {
            return Err(ShmemLibError::logic("shared memory needs a name"));
        }
        let mapping = self.map(mode, size).map_err(|e| {
            error!("SharedMem::set {} failed: {}", self.name, e);
            e
        })?;
        debug!(
            "mapped {} ({} bytes, owner: {}, {:?})",
            self.name, mapping.size, mapping.owner, mode
        );
        self.mapping
            .set(mapping)
            .map_err(|_| ShmemLibError::logic(format!("{} was mapped concurrently", self.name)))
    }

    fn map(&self, mode: ShMemMode, size: usize) -> Result<Mapping> {
        if mode.recreate_old() {
            unlink(&self.name)?;
        }
        let mut shmem = if mode.create_new() && size > 0 {
            match ShmemConf::new().size(size).os_id(&self.name).create() {
                Ok(v) => v,
                Err(ShmemError::MappingIdExists) | Err(ShmemError::LinkExists) => self.open_existing()?,
                Err(e) => return Err(e.into()),
            }
        } else {
            self.open_existing()?
        };
        if size > 0 && shmem.len() < size {
            return Err(ShmemLibError::logic(format!(
                "{} has {} bytes, {} requested",
                self.name,
                shmem.len(),
                size
            )));
        }
        let owner = mode.kill_on_close();
        shmem.set_owner(owner);

        let base = NonNull::new(shmem.as_ptr())
            .ok_or_else(|| ShmemLibError::logic(format!("{} mapped at null", self.name)))?;
        let len = shmem.len();
        if !mode.write_access() {
            let rc = unsafe { libc::mprotect(base.as_ptr() as *mut libc::c_void, len, libc::PROT_READ) };
            if rc != 0 {
                return Err(ShmemLibError::os(format!("mprotect {}", self.name)));
            }
        }
        if mode.locked() {
            let rc = unsafe { libc::mlock(base.as_ptr() as *const libc::c_void, len) };
            if rc != 0 {
                warn!(
                    "could not lock {} in memory: {}",
                    self.name,
                    std::io::Error::last_os_error()
                );
            }
        }
        Ok(Mapping {
            base,
            size: len,
            owner,
            backing: Backing::Os(shmem),
        })
    }

    fn open_existing(&self) -> Result<Shmem> {
        ShmemConf::new().os_id(&self.name).open().map_err(|e| e.into())
    }

    /// Base address, null while unmapped.
    pub fn begin(&self) -> *mut u8 {
        self.mapping.get().map_or(ptr::null_mut(), |m| m.base.as_ptr())
    }

    pub fn size(&self) -> usize {
        self.mapping.get().map_or(0, |m| m.size)
    }

    pub fn is_valid(&self) -> bool {
        self.mapping.get().is_some()
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True if dropping this segment unlinks the OS object.
    pub fn is_owner(&self) -> bool {
        self.mapping.get().map_or(false, |m| m.owner)
    }

    pub fn is_os_backed(&self) -> bool {
        matches!(self.mapping.get().map(|m| &m.backing), Some(Backing::Os(_)))
    }

    /// True if `p` lies inside the mapped range.
    pub fn contains(&self, p: *const u8) -> bool {
        let begin = self.begin() as usize;
        let addr = p as usize;
        self.is_valid() && addr >= begin && addr < begin + self.size()
    }

    /// Relative pointer to `p`, which must lie inside this segment.
    pub fn to_shmem_ptr<T>(&self, p: *const T) -> Result<ShMemPtr<T>> {
        ShMemPtr::new(self, p)
    }
}

impl Default for SharedMem {
    fn default() -> Self {
        SharedMem::new()
    }
}

impl fmt::Display for SharedMem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ShMem: {} #{} @{:#x}({})",
            self.name,
            self.handle,
            self.begin() as usize,
            self.size()
        )
    }
}

impl fmt::Debug for SharedMem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// POSIX shared memory names carry a leading slash.
fn os_name(name: &str) -> String {
    if name.is_empty() || name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{}", name)
    }
}

fn unlink(name: &str) -> Result<()> {
    let c_name = CString::new(name).map_err(|_| ShmemLibError::logic(format!("bad shared memory name {:?}", name)))?;
    let rc = unsafe { libc::shm_unlink(c_name.as_ptr()) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ENOENT) {
            return Err(ShmemLibError::Os {
                context: format!("shm_unlink {}", name),
                source: err,
            });
        }
    }
    Ok(())
}
