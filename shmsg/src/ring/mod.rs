use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use log::{error, warn};

use crate::config::RingConfig;
use crate::errors::{Result, ShmemLibError};
use crate::ptr::ShMemPtr;
use crate::segment::SharedMem;

const HEADER_SIZE: usize = mem::size_of::<AtomicI32>();
const RING_MAGIC: u32 = 0x5348_5247;

/// Layout of the ring as its creator laid it out, in front of the blocks.
#[repr(C)]
struct RingControl {
    magic: AtomicU32,
    payload_size: AtomicU32,
    num_blocks: AtomicU32,
    _reserved: AtomicU32,
}

const CONTROL_SIZE: usize = mem::size_of::<RingControl>();

/// Fixed-size block allocator over one segment.
///
/// A small control block records the geometry; every block after it is a
/// reference count followed by the payload. A count of 0 means free, N > 0
/// means held by N readers. The count is the only synchronization: any
/// process mapping the segment may allocate and free.
pub struct ShMemRingAllocator {
    memory: Arc<SharedMem>,
    base: NonNull<u8>,
    payload_size: usize,
    block_size: usize,
    num_blocks: usize,
    warn_index: usize,
    alloc_failed: AtomicBool,
    high_fill: AtomicUsize,
}

// base points into `memory`, which the allocator keeps alive
unsafe impl Send for ShMemRingAllocator {}
unsafe impl Sync for ShMemRingAllocator {}

impl std::fmt::Debug for ShMemRingAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShMemRingAllocator")
            .field("payload_size", &self.payload_size)
            .field("block_size", &self.block_size)
            .field("num_blocks", &self.num_blocks)
            .finish_non_exhaustive()
    }
}

impl ShMemRingAllocator {
    /// Size of the per-block header.
    pub const fn header_size() -> usize {
        HEADER_SIZE
    }

    /// Segment size holding `blocks` blocks of `payload_size`.
    pub fn required_size(payload_size: usize, blocks: usize) -> usize {
        CONTROL_SIZE + (align_payload(payload_size) + HEADER_SIZE) * blocks
    }

    /// Lay a ring over `memory` and mark every block free.
    pub fn new(memory: Arc<SharedMem>, config: &RingConfig) -> Result<ShMemRingAllocator> {
        let ring = ShMemRingAllocator::layout(memory, config)?;
        ring.init();
        Ok(ring)
    }

    /// Join a ring another process laid out; block states are left alone.
    /// The ring must have been laid out with the same payload size.
    pub fn attach(memory: Arc<SharedMem>, config: &RingConfig) -> Result<ShMemRingAllocator> {
        let ring = ShMemRingAllocator::layout(memory, config)?;
        let control = ring.control();
        if control.magic.load(Ordering::Acquire) != RING_MAGIC {
            return Err(ShmemLibError::logic(format!("no ring found in {}", ring.memory.name())));
        }
        let payload_size = control.payload_size.load(Ordering::Relaxed) as usize;
        let num_blocks = control.num_blocks.load(Ordering::Relaxed) as usize;
        if payload_size != ring.payload_size || num_blocks != ring.num_blocks {
            return Err(ShmemLibError::logic(format!(
                "{} holds {} blocks of {} bytes, expected {} blocks of {} bytes",
                ring.memory.name(),
                num_blocks,
                payload_size,
                ring.num_blocks,
                ring.payload_size
            )));
        }
        Ok(ring)
    }

    fn layout(memory: Arc<SharedMem>, config: &RingConfig) -> Result<ShMemRingAllocator> {
        let base = NonNull::new(memory.begin())
            .ok_or_else(|| ShmemLibError::logic(format!("{} is not mapped", memory.name())))?;
        if base.as_ptr() as usize % HEADER_SIZE != 0 {
            return Err(ShmemLibError::logic(format!("{} is misaligned", memory.name())));
        }
        if config.payload_size == 0 {
            return Err(ShmemLibError::logic("ring payload size must not be 0"));
        }
        let payload_size = align_payload(config.payload_size);
        if u32::try_from(payload_size).is_err() {
            return Err(ShmemLibError::logic(format!("ring payload size {} is too large", payload_size)));
        }
        let block_size = payload_size + HEADER_SIZE;
        let num_blocks = (memory.size().saturating_sub(CONTROL_SIZE) / block_size).min(u32::MAX as usize);
        if num_blocks == 0 {
            return Err(ShmemLibError::logic(format!(
                "{} ({} bytes) is too small for one block of {} bytes",
                memory.name(),
                memory.size(),
                block_size
            )));
        }
        let ratio = config.fill_warn_ratio.clamp(0.0, 1.0);
        Ok(ShMemRingAllocator {
            memory,
            base,
            payload_size,
            block_size,
            num_blocks,
            warn_index: (num_blocks as f64 * ratio) as usize,
            alloc_failed: AtomicBool::new(false),
            high_fill: AtomicUsize::new(0),
        })
    }

    /// Mark every block free and record the geometry for attaching processes.
    pub fn init(&self) {
        for i in 0..self.num_blocks {
            self.header(i).store(0, Ordering::Release);
        }
        let control = self.control();
        control.payload_size.store(self.payload_size as u32, Ordering::Relaxed);
        control.num_blocks.store(self.num_blocks as u32, Ordering::Relaxed);
        control.magic.store(RING_MAGIC, Ordering::Release);
    }

    pub fn memory(&self) -> &Arc<SharedMem> {
        &self.memory
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    /// True from a failed pass until the next successful allocation.
    pub fn is_exhausted(&self) -> bool {
        self.alloc_failed.load(Ordering::Relaxed)
    }

    /// Allocations by this process that found their block past the warn
    /// index.
    pub fn high_fill_count(&self) -> usize {
        self.high_fill.load(Ordering::Relaxed)
    }

    /// Claim a free block for `num_readers` readers.
    ///
    /// One pass over the ring from its start. Past the warn index the scan
    /// yields between candidates so concurrent frees can land, and a hit
    /// there is logged as a high fill level. A pass without a free block
    /// fails with [`ShmemLibError::Exhausted`]; do not retry inline.
    pub fn alloc_block(&self, num_readers: i32) -> Result<NonNull<u8>> {
        if num_readers < 1 {
            return Err(ShmemLibError::logic(format!(
                "a block needs at least one reader, got {}",
                num_readers
            )));
        }
        for i in 0..self.num_blocks {
            let past_warn = i > self.warn_index;
            if past_warn {
                thread::yield_now();
            }
            if self
                .header(i)
                .compare_exchange(0, num_readers, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                if past_warn {
                    self.high_fill.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "{}: high fill level, block {} of {} allocated",
                        self.memory.name(),
                        i,
                        self.num_blocks
                    );
                }
                self.alloc_failed.store(false, Ordering::Relaxed);
                return Ok(self.payload(i));
            }
        }
        if !self.alloc_failed.swap(true, Ordering::Relaxed) {
            error!(
                "{}: no free block among {} blocks of {} bytes",
                self.memory.name(),
                self.num_blocks,
                self.block_size
            );
        }
        Err(ShmemLibError::Exhausted {
            segment: self.memory.name().to_string(),
            blocks: self.num_blocks,
            block_size: self.block_size,
        })
    }

    /// Drop one reference to the block behind `payload`.
    pub fn free_block(&self, payload: NonNull<u8>) -> Result<()> {
        let index = self.index_of(payload)?;
        let header = self.header(index);
        let mut current = header.load(Ordering::Relaxed);
        loop {
            if current <= 0 {
                let offset = self.payload_offset(index);
                error!("{}: double free of block at offset {}", self.memory.name(), offset);
                debug_assert!(current > 0, "double free of block at offset {}", offset);
                return Err(ShmemLibError::DoubleFree { offset });
            }
            match header.compare_exchange_weak(current, current - 1, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Hand a block its writer holds alone over to `readers` readers.
    pub fn lock_for_reading(&self, payload: NonNull<u8>, readers: i32) -> Result<()> {
        if readers < 1 {
            return Err(ShmemLibError::logic("a message needs at least one reader"));
        }
        let index = self.index_of(payload)?;
        self.header(index)
            .compare_exchange(1, readers, Ordering::AcqRel, Ordering::Relaxed)
            .map(|_| ())
            .map_err(|count| {
                ShmemLibError::logic(format!(
                    "block at offset {} has {} holders, expected its writer only",
                    self.payload_offset(index),
                    count
                ))
            })
    }

    pub fn ref_count(&self, payload: NonNull<u8>) -> Result<i32> {
        let index = self.index_of(payload)?;
        Ok(self.header(index).load(Ordering::Acquire))
    }

    /// Blocks with a count of 0 at the time of the scan.
    pub fn free_blocks(&self) -> usize {
        (0..self.num_blocks)
            .filter(|&i| self.header(i).load(Ordering::Relaxed) == 0)
            .count()
    }

    /// Offset of a payload from the segment start.
    pub fn offset_of(&self, payload: NonNull<u8>) -> Result<usize> {
        self.index_of(payload).map(|i| self.payload_offset(i))
    }

    /// Payload at a segment offset received from another process.
    pub fn block_at(&self, offset: usize) -> Result<NonNull<u8>> {
        let index = self.index_of_offset(offset)?;
        Ok(self.payload(index))
    }

    pub fn to_shmem_ptr(&self, payload: NonNull<u8>) -> Result<ShMemPtr<u8>> {
        self.index_of(payload)?;
        ShMemPtr::new(&self.memory, payload.as_ptr())
    }

    fn control(&self) -> &RingControl {
        unsafe { &*(self.base.as_ptr() as *const RingControl) }
    }

    fn header(&self, index: usize) -> &AtomicI32 {
        debug_assert!(index < self.num_blocks);
        unsafe { &*(self.base.as_ptr().add(CONTROL_SIZE + index * self.block_size) as *const AtomicI32) }
    }

    fn payload_offset(&self, index: usize) -> usize {
        CONTROL_SIZE + index * self.block_size + HEADER_SIZE
    }

    fn payload(&self, index: usize) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.payload_offset(index))) }
    }

    fn index_of(&self, payload: NonNull<u8>) -> Result<usize> {
        let offset = (payload.as_ptr() as usize).wrapping_sub(self.base.as_ptr() as usize);
        self.index_of_offset(offset)
    }

    fn index_of_offset(&self, offset: usize) -> Result<usize> {
        const FIRST: usize = CONTROL_SIZE + HEADER_SIZE;
        let index = offset.wrapping_sub(FIRST) / self.block_size;
        if offset < FIRST || (offset - FIRST) % self.block_size != 0 || index >= self.num_blocks {
            return Err(ShmemLibError::InvalidPointer {
                segment: self.memory.name().to_string(),
                offset,
            });
        }
        Ok(index)
    }
}

fn align_payload(size: usize) -> usize {
    (size + HEADER_SIZE - 1) & !(HEADER_SIZE - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn ring(payload_size: usize, blocks: usize) -> ShMemRingAllocator {
        let size = ShMemRingAllocator::required_size(payload_size, blocks);
        let mem = Arc::new(SharedMem::from_heap(0, "ring", size));
        let config = RingConfig {
            payload_size,
            ..Default::default()
        };
        ShMemRingAllocator::new(mem, &config).unwrap()
    }

    #[test]
    fn geometry() {
        let r = ring(64, 4);
        assert_eq!(ShMemRingAllocator::header_size(), 4);
        assert_eq!(r.block_size(), 68);
        assert_eq!(r.num_blocks(), 4);
        assert_eq!(r.free_blocks(), 4);
        // payload rounded up to the header alignment
        assert_eq!(ring(61, 2).payload_size(), 64);
    }

    #[test]
    fn four_blocks_then_exhausted() {
        let r = ring(64, 4);
        let mut seen = HashSet::new();
        for _ in 0..4 {
            let p = r.alloc_block(1).unwrap();
            assert!(seen.insert(p.as_ptr() as usize));
        }
        let mut starts: Vec<usize> = seen.iter().copied().collect();
        starts.sort();
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= 64);
        }
        let err = r.alloc_block(1).unwrap_err();
        assert!(err.is_fatal());
        // still exhausted, still an error
        assert!(r.alloc_block(1).is_err());
    }

    #[test]
    fn reference_counting() -> Result<()> {
        let r = ring(32, 1);
        let p = r.alloc_block(3)?;
        assert_eq!(r.ref_count(p)?, 3);
        r.free_block(p)?;
        r.free_block(p)?;
        assert!(r.alloc_block(1).is_err());
        r.free_block(p)?;
        assert_eq!(r.ref_count(p)?, 0);
        assert_eq!(r.alloc_block(1)?, p);
        Ok(())
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "double free"))]
    fn double_free_is_rejected() {
        let r = ring(32, 2);
        let p = r.alloc_block(1).unwrap();
        r.free_block(p).unwrap();
        assert!(matches!(r.free_block(p), Err(ShmemLibError::DoubleFree { .. })));
    }

    #[test]
    fn foreign_pointers_are_rejected() {
        let r = ring(32, 2);
        let p = r.alloc_block(1).unwrap();
        let inside = unsafe { NonNull::new_unchecked(p.as_ptr().add(1)) };
        assert!(matches!(r.free_block(inside), Err(ShmemLibError::InvalidPointer { .. })));
        assert!(r.block_at(0).is_err());
        assert!(r.block_at(CONTROL_SIZE + 4 + 36 * 2).is_err());
        assert_eq!(r.block_at(r.offset_of(p).unwrap()).unwrap(), p);
    }

    #[test]
    fn readers_take_over_from_writer() -> Result<()> {
        let r = ring(16, 2);
        let p = r.alloc_block(1)?;
        r.lock_for_reading(p, 2)?;
        assert_eq!(r.ref_count(p)?, 2);
        assert!(r.lock_for_reading(p, 3).is_err());
        r.free_block(p)?;
        r.free_block(p)?;
        assert_eq!(r.free_blocks(), 2);
        Ok(())
    }

    #[test]
    fn zero_readers_is_a_contract_violation() {
        let r = ring(16, 1);
        assert!(matches!(r.alloc_block(0), Err(ShmemLibError::Logic(_))));
        assert_eq!(r.free_blocks(), 1);
    }

    #[test]
    fn attach_keeps_block_states() -> Result<()> {
        let r = ring(16, 3);
        let p = r.alloc_block(2)?;
        let joined = ShMemRingAllocator::attach(
            r.memory().clone(),
            &RingConfig {
                payload_size: 16,
                ..Default::default()
            },
        )?;
        assert_eq!(joined.ref_count(p)?, 2);
        assert_eq!(joined.free_blocks(), 2);
        Ok(())
    }

    #[test]
    fn attach_rejects_a_different_layout() -> Result<()> {
        let r = ring(64, 4);
        let narrower = RingConfig {
            payload_size: 16,
            ..Default::default()
        };
        let err = ShMemRingAllocator::attach(r.memory().clone(), &narrower).unwrap_err();
        assert!(matches!(err, ShmemLibError::Logic(_)));
        assert_eq!(r.free_blocks(), 4);

        let blank = Arc::new(SharedMem::from_heap(0, "blank", ShMemRingAllocator::required_size(64, 4)));
        let same = RingConfig {
            payload_size: 64,
            ..Default::default()
        };
        assert!(ShMemRingAllocator::attach(blank, &same).is_err());
        assert_eq!(ShMemRingAllocator::attach(r.memory().clone(), &same)?.num_blocks(), 4);
        Ok(())
    }

    #[test]
    fn exhaustion_episode_ends_with_the_next_success() -> Result<()> {
        let r = ring(16, 2);
        let a = r.alloc_block(1)?;
        let _b = r.alloc_block(1)?;
        assert!(!r.is_exhausted());
        assert!(r.alloc_block(1).unwrap_err().is_fatal());
        assert!(r.is_exhausted());
        // repeated failures stay in the same episode
        assert!(r.alloc_block(1).is_err());
        assert!(r.is_exhausted());
        r.free_block(a)?;
        assert_eq!(r.alloc_block(1)?, a);
        assert!(!r.is_exhausted());
        Ok(())
    }

    #[test]
    fn high_fill_level_follows_the_warn_ratio() -> Result<()> {
        let with_ratio = |ratio: f64| -> Result<ShMemRingAllocator> {
            let mem = Arc::new(SharedMem::from_heap(0, "fill", ShMemRingAllocator::required_size(16, 8)));
            let config = RingConfig {
                payload_size: 16,
                fill_warn_ratio: ratio,
            };
            ShMemRingAllocator::new(mem, &config)
        };

        let early = with_ratio(0.25)?;
        for _ in 0..8 {
            early.alloc_block(1)?;
        }
        // blocks 3 to 7 lie past index 2
        assert_eq!(early.high_fill_count(), 5);

        let never = with_ratio(1.0)?;
        for _ in 0..8 {
            never.alloc_block(1)?;
        }
        assert_eq!(never.high_fill_count(), 0);

        let default = ring(16, 8);
        for _ in 0..8 {
            default.alloc_block(1)?;
        }
        assert_eq!(default.high_fill_count(), 3);
        Ok(())
    }

    #[test]
    fn segment_too_small_for_one_block() {
        let mem = Arc::new(SharedMem::from_heap(0, "tiny", 10));
        let config = RingConfig {
            payload_size: 64,
            ..Default::default()
        };
        assert!(ShMemRingAllocator::new(mem, &config).is_err());
        let unmapped = Arc::new(SharedMem::deferred(0, "unmapped"));
        assert!(ShMemRingAllocator::new(unmapped, &config).is_err());
    }
}
