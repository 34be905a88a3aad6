use std::fmt;
use std::mem;
use std::ptr::NonNull;
use std::sync::Arc;

use log::{debug, error};

use crate::config::HeapConfig;
use crate::errors::{Result, ShmemLibError};
use crate::segment::SharedMem;

mod shared;

pub use shared::{HeapGuard, SharedHeap};

const HEAP_MAGIC: u32 = 0x5348_4850;
const CHECK_SEED: u32 = 0xa5a5_5a5a;
const NONE: u32 = u32::MAX;
const ALIGN: usize = 8;

/// Shared state of all processes using one region: the cached free pointer
/// lives here, not in the allocator, so every attached process starts its
/// first-fit scan at the same chunk.
#[repr(C)]
#[derive(Clone, Copy)]
struct Control {
    magic: u32,
    current_free: u32,
    serial: u32,
    _reserved: u32,
}

const CONTROL_SIZE: usize = mem::size_of::<Control>();

/// Inline chunk header. `next`/`last` link the free ring by region offset.
#[repr(C)]
#[derive(Clone, Copy)]
struct ChunkHeader {
    /// Header included.
    length: u32,
    free: u32,
    /// Allocation serial; 0 while free.
    time_stamp: u32,
    check_sum: u32,
    next: u32,
    last: u32,
}

const HEADER_SIZE: usize = mem::size_of::<ChunkHeader>();

/// One entry of the free ring, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeChunk {
    pub offset: usize,
    /// Usable bytes.
    pub size: usize,
}

/// First-fit allocator over a free ring stored inside the region itself.
///
/// Not synchronized: callers serialize alloc and free across every process
/// attached to the region, see [`SharedHeap`].
pub struct ShMemAllocator {
    memory: Arc<SharedMem>,
    base: NonNull<u8>,
    len: usize,
    max_merge_retries: usize,
}

unsafe impl Send for ShMemAllocator {}

impl ShMemAllocator {
    pub const fn header_size() -> usize {
        HEADER_SIZE
    }

    /// Lay out a fresh heap over the whole segment: one free chunk.
    pub fn new(memory: Arc<SharedMem>, config: &HeapConfig) -> Result<ShMemAllocator> {
        let len = memory.size();
        ShMemAllocator::with_region(memory, 0, len, config, true)
    }

    /// Join a heap another process laid out over the segment.
    pub fn attach(memory: Arc<SharedMem>, config: &HeapConfig) -> Result<ShMemAllocator> {
        let len = memory.size();
        ShMemAllocator::with_region(memory, 0, len, config, false)
    }

    pub(crate) fn with_region(
        memory: Arc<SharedMem>,
        offset: usize,
        len: usize,
        config: &HeapConfig,
        create: bool,
    ) -> Result<ShMemAllocator> {
        if !memory.is_valid() || offset + len > memory.size() {
            return Err(ShmemLibError::logic(format!(
                "heap region {}+{} does not fit {}",
                offset, len, memory
            )));
        }
        let start = memory.begin() as usize + offset;
        let skew = align_up(start, ALIGN) - start;
        // offsets are u32; cap before aligning so the length stays aligned
        let len = len.saturating_sub(skew).min(u32::MAX as usize) & !(ALIGN - 1);
        if len < CONTROL_SIZE + HEADER_SIZE + ALIGN {
            return Err(ShmemLibError::logic(format!(
                "{} bytes are too small for a heap in {}",
                len,
                memory.name()
            )));
        }
        let base = NonNull::new((start + skew) as *mut u8)
            .ok_or_else(|| ShmemLibError::logic(format!("{} is not mapped", memory.name())))?;
        let mut heap = ShMemAllocator {
            memory,
            base,
            len,
            max_merge_retries: config.max_merge_retries,
        };
        if create {
            heap.init();
        } else if heap.control().magic != HEAP_MAGIC {
            return Err(ShmemLibError::logic(format!(
                "no heap found in {}",
                heap.memory.name()
            )));
        }
        Ok(heap)
    }

    /// Reset to a single free chunk spanning the region.
    pub fn init(&mut self) {
        let first = CONTROL_SIZE as u32;
        let length = (self.len - CONTROL_SIZE) as u32;
        self.write_chunk(
            first,
            ChunkHeader {
                length,
                free: 1,
                time_stamp: 0,
                check_sum: check_sum(first, length),
                next: first,
                last: first,
            },
        );
        self.set_control(Control {
            magic: HEAP_MAGIC,
            current_free: first,
            serial: 0,
            _reserved: 0,
        });
        debug!("heap over {}: {} usable bytes", self.memory.name(), self.capacity());
    }

    pub fn memory(&self) -> &Arc<SharedMem> {
        &self.memory
    }

    /// Usable bytes of the freshly initialized heap.
    pub fn capacity(&self) -> usize {
        self.len - CONTROL_SIZE - HEADER_SIZE
    }

    /// `size` usable bytes, or `None` when no chunk fits.
    ///
    /// First fit from the cached free chunk. A chunk too small is merged with
    /// its free successor in memory and tried again, up to the configured
    /// retry bound. A lap without a fit cleans the whole ring once and scans
    /// one more lap.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        // HEADER_SIZE is a multiple of ALIGN
        let need = match size.max(1).checked_add(HEADER_SIZE + ALIGN - 1) {
            Some(n) if n & !(ALIGN - 1) <= self.len => (n & !(ALIGN - 1)) as u32,
            _ => return self.alloc_failed(size),
        };
        let mut cleaned = false;
        let mut merges = 0;
        let mut start = self.control().current_free;
        if start == NONE {
            return self.alloc_failed(size);
        }
        let mut cur = start;
        loop {
            let chunk = self.chunk(cur);
            if chunk.length >= need + HEADER_SIZE as u32 {
                self.split(cur, need);
                break;
            }
            if chunk.length >= need {
                self.unlink(cur);
                break;
            }
            if let Some(absorbed) = self.merge(cur) {
                merges += 1;
                if absorbed == start {
                    start = cur;
                }
                if merges > self.max_merge_retries {
                    return self.alloc_failed(size);
                }
                continue;
            }
            cur = chunk.next;
            if cur == start {
                if cleaned {
                    return self.alloc_failed(size);
                }
                self.clean();
                cleaned = true;
                start = self.control().current_free;
                if start == NONE {
                    return self.alloc_failed(size);
                }
                cur = start;
            }
        }

        let mut control = self.control();
        control.serial = control.serial.wrapping_add(1).max(1);
        self.set_control(control);
        let mut chunk = self.chunk(cur);
        chunk.free = 0;
        chunk.time_stamp = control.serial;
        chunk.next = NONE;
        chunk.last = NONE;
        self.write_chunk(cur, chunk);

        let head = self.control().current_free;
        if head != NONE {
            self.merge(head);
        }
        Some(self.payload(cur))
    }

    fn alloc_failed(&mut self, size: usize) -> Option<NonNull<u8>> {
        error!(
            "{}: no chunk for {} bytes, free list: {:?}",
            self.memory.name(),
            size,
            self.free_list()
        );
        None
    }

    /// Return a chunk to the free ring and merge it with up to two of its
    /// successors.
    pub fn free(&mut self, p: NonNull<u8>) -> Result<()> {
        let at = self.chunk_of(p)?;
        let mut chunk = self.chunk(at);
        chunk.free = 1;
        chunk.time_stamp = 0;
        self.write_chunk(at, chunk);
        self.insert_head(at);
        for _ in 0..2 {
            if self.merge(at).is_none() {
                break;
            }
        }
        Ok(())
    }

    /// Usable bytes of the chunk behind `p`.
    pub fn block_size(&self, p: NonNull<u8>) -> Result<usize> {
        let at = self.chunk_of(p)?;
        Ok(self.chunk(at).length as usize - HEADER_SIZE)
    }

    /// Total free bytes after full coalescing.
    pub fn get_free_mem_size(&mut self) -> usize {
        self.clean();
        self.get_fragmented_free_mem_size()
    }

    /// Largest single free chunk after full coalescing.
    pub fn get_max_free_mem_block(&mut self) -> usize {
        self.clean();
        self.free_list().iter().map(|c| c.size).max().unwrap_or(0)
    }

    /// Total free bytes as the ring stands.
    pub fn get_fragmented_free_mem_size(&self) -> usize {
        self.free_list().iter().map(|c| c.size).sum()
    }

    /// The free ring from the cached free chunk on.
    pub fn free_list(&self) -> Vec<FreeChunk> {
        let mut list = Vec::new();
        let head = self.control().current_free;
        if head == NONE {
            return list;
        }
        let mut cur = head;
        loop {
            let chunk = self.chunk(cur);
            list.push(FreeChunk {
                offset: cur as usize,
                size: chunk.length as usize - HEADER_SIZE,
            });
            cur = chunk.next;
            // a broken ring must not hang a diagnostic
            if cur == head || list.len() > self.len / HEADER_SIZE {
                break;
            }
        }
        list
    }

    /// Merge every run of adjacent free chunks, walking the region in memory
    /// order.
    pub fn clean(&mut self) {
        let end = self.len as u32;
        let mut at = CONTROL_SIZE as u32;
        while at < end {
            if self.chunk(at).free != 0 {
                while self.merge(at).is_some() {}
            }
            at += self.chunk(at).length;
        }
    }

    fn split(&mut self, at: u32, need: u32) {
        let chunk = self.chunk(at);
        let rest = at + need;
        let rest_len = chunk.length - need;
        let (next, last) = if chunk.next == at { (rest, rest) } else { (chunk.next, chunk.last) };
        self.write_chunk(
            rest,
            ChunkHeader {
                length: rest_len,
                free: 1,
                time_stamp: 0,
                check_sum: check_sum(rest, rest_len),
                next,
                last,
            },
        );
        if next != rest {
            self.set_next(last, rest);
            self.set_last(next, rest);
        }
        self.set_length(at, need);
        let mut control = self.control();
        control.current_free = rest;
        self.set_control(control);
    }

    /// Merge the free chunk at `at` with its successor in memory if that one
    /// is free too. Returns the absorbed chunk.
    fn merge(&mut self, at: u32) -> Option<u32> {
        let chunk = self.chunk(at);
        if chunk.free == 0 {
            return None;
        }
        let succ = at + chunk.length;
        if succ as usize >= self.len {
            return None;
        }
        let next = self.chunk(succ);
        if next.free == 0 {
            return None;
        }
        self.unlink(succ);
        self.set_length(at, chunk.length + next.length);
        Some(succ)
    }

    fn unlink(&mut self, at: u32) {
        let chunk = self.chunk(at);
        let mut control = self.control();
        if chunk.next == at {
            control.current_free = NONE;
        } else {
            self.set_next(chunk.last, chunk.next);
            self.set_last(chunk.next, chunk.last);
            if control.current_free == at {
                control.current_free = chunk.next;
            }
        }
        self.set_control(control);
    }

    fn insert_head(&mut self, at: u32) {
        let mut control = self.control();
        let head = control.current_free;
        if head == NONE {
            self.set_next(at, at);
            self.set_last(at, at);
        } else {
            let last = self.chunk(head).last;
            self.set_next(at, head);
            self.set_last(at, last);
            self.set_next(last, at);
            self.set_last(head, at);
        }
        control.current_free = at;
        self.set_control(control);
    }

    fn chunk_of(&self, p: NonNull<u8>) -> Result<u32> {
        let addr = p.as_ptr() as usize;
        let base = self.base.as_ptr() as usize;
        let invalid = || ShmemLibError::InvalidPointer {
            segment: self.memory.name().to_string(),
            offset: addr.wrapping_sub(base),
        };
        if addr < base + CONTROL_SIZE + HEADER_SIZE || addr >= base + self.len || addr % ALIGN != 0 {
            return Err(invalid());
        }
        let at = (addr - base - HEADER_SIZE) as u32;
        let chunk = self.chunk(at);
        if chunk.check_sum != check_sum(at, chunk.length) {
            return Err(invalid());
        }
        if chunk.free != 0 {
            error!("{}: double free of chunk at offset {}", self.memory.name(), at);
            return Err(ShmemLibError::DoubleFree { offset: at as usize });
        }
        Ok(at)
    }

    fn payload(&self, at: u32) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(at as usize + HEADER_SIZE)) }
    }

    fn control(&self) -> Control {
        unsafe { (self.base.as_ptr() as *const Control).read() }
    }

    fn set_control(&mut self, control: Control) {
        unsafe { (self.base.as_ptr() as *mut Control).write(control) }
    }

    fn chunk(&self, at: u32) -> ChunkHeader {
        debug_assert!(at as usize + HEADER_SIZE <= self.len);
        unsafe { (self.base.as_ptr().add(at as usize) as *const ChunkHeader).read() }
    }

    fn write_chunk(&mut self, at: u32, chunk: ChunkHeader) {
        debug_assert!(at as usize + HEADER_SIZE <= self.len);
        unsafe { (self.base.as_ptr().add(at as usize) as *mut ChunkHeader).write(chunk) }
    }

    fn set_next(&mut self, at: u32, next: u32) {
        let mut chunk = self.chunk(at);
        chunk.next = next;
        self.write_chunk(at, chunk);
    }

    fn set_last(&mut self, at: u32, last: u32) {
        let mut chunk = self.chunk(at);
        chunk.last = last;
        self.write_chunk(at, chunk);
    }

    fn set_length(&mut self, at: u32, length: u32) {
        let mut chunk = self.chunk(at);
        chunk.length = length;
        chunk.check_sum = check_sum(at, length);
        self.write_chunk(at, chunk);
    }
}

impl fmt::Debug for ShMemAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShMemAllocator")
            .field("memory", &self.memory.name())
            .field("len", &self.len)
            .field("free_list", &self.free_list())
            .finish()
    }
}

fn check_sum(at: u32, length: u32) -> u32 {
    CHECK_SEED ^ at.rotate_left(16) ^ length
}

fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}
