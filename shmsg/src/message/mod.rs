use std::cell::Cell;
use std::fmt::Write as _;
use std::ptr::{self, NonNull};
use std::slice;

use log::error;

use crate::errors::{Result, ShmemLibError};
use crate::ptr::ShMemPtr;
use crate::registry::ShMemRegistry;

mod marshal;
mod store;

pub use marshal::{demarshal, demarshal_array, marshal, marshal_array, Primitive, Serializable};
pub use store::{BufferStore, HeapStore, LocalStore, RingStore};

const MESSAGE_NUM_AT: usize = 0;
const MSG_SIZE_AT: usize = 4;
const CHECK_SUM_AT: usize = 8;
/// message number, message size, checksum, reserved
pub const MESSAGE_HEADER_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Owned by the writer; writes allowed.
    Writing,
    /// Handed to readers; the writer holds nothing.
    Published,
    /// One reader's hold on a received block.
    Reading,
    Released,
}

/// Byte cursor over one block of a [`BufferStore`].
///
/// The block starts with a small header (message number, message size,
/// checksum) followed by the data. Writes go through [`MessageBuffer::has_space`],
/// which moves the data to a larger block when needed, so a write position
/// is never valid across a write call. Reads advance the same cursor and stop
/// at the message size.
pub struct MessageBuffer {
    store: Box<dyn BufferStore + Send>,
    block: Option<NonNull<u8>>,
    lim_size: usize,
    cursor: Cell<usize>,
    multi_use: i32,
    state: BufferState,
}

// the block is reachable only through this buffer
unsafe impl Send for MessageBuffer {}

impl MessageBuffer {
    /// Writer without a block; the first write allocates one.
    pub fn new(store: Box<dyn BufferStore + Send>) -> MessageBuffer {
        MessageBuffer {
            store,
            block: None,
            lim_size: 0,
            cursor: Cell::new(0),
            multi_use: 1,
            state: BufferState::Writing,
        }
    }

    /// Writer with a block of `size` data bytes.
    pub fn with_size(store: Box<dyn BufferStore + Send>, size: usize) -> Result<MessageBuffer> {
        let mut buffer = MessageBuffer::new(store);
        buffer.reset(size)?;
        Ok(buffer)
    }

    /// Reader over a block published by a writer, possibly in another
    /// process. The reader holds one reference until
    /// [`MessageBuffer::free_buffer`] or drop.
    pub fn receive(store: Box<dyn BufferStore + Send>, rel: ShMemPtr<u8>) -> Result<MessageBuffer> {
        let (block, capacity) = store.resolve(rel)?;
        let mut buffer = MessageBuffer::new(store);
        buffer.block = Some(block);
        buffer.lim_size = capacity.saturating_sub(MESSAGE_HEADER_SIZE);
        buffer.state = BufferState::Reading;
        let size = buffer.msg_size();
        if capacity < MESSAGE_HEADER_SIZE || size > buffer.lim_size {
            return Err(ShmemLibError::Protocol(format!(
                "message of {} bytes in a block of {}",
                size, capacity
            )));
        }
        Ok(buffer)
    }

    /// Drop the current block and start an empty message in a new one.
    pub fn reset(&mut self, size: usize) -> Result<()> {
        self.free_buffer()?;
        let (block, capacity) = self.store.allocate(size.max(1) + MESSAGE_HEADER_SIZE)?;
        unsafe { ptr::write_bytes(block.as_ptr(), 0, MESSAGE_HEADER_SIZE) };
        self.block = Some(block);
        self.lim_size = capacity - MESSAGE_HEADER_SIZE;
        self.cursor.set(0);
        self.state = BufferState::Writing;
        Ok(())
    }

    /// Hand the block to `multi_use` readers and return the pointer they
    /// receive it by. The writer keeps no hold afterwards.
    pub fn publish(&mut self) -> Result<ShMemPtr<u8>> {
        let block = self.writable_block()?;
        let rel = self.store.to_relative(block)?;
        self.store.share(block, self.multi_use)?;
        self.state = BufferState::Published;
        self.block = None;
        self.lim_size = 0;
        self.cursor.set(0);
        Ok(rel)
    }

    /// Release this buffer's hold on its block, if any.
    pub fn free_buffer(&mut self) -> Result<()> {
        let held = matches!(self.state, BufferState::Writing | BufferState::Reading);
        let block = self.block.take();
        self.lim_size = 0;
        self.cursor.set(0);
        self.state = BufferState::Released;
        match block {
            Some(block) if held => self.store.release(block),
            _ => Ok(()),
        }
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    /// Make room for `n` more bytes at the cursor, moving the message to a
    /// larger block if needed.
    pub fn has_space(&mut self, n: usize) -> Result<()> {
        let need = self.cursor.get() + n;
        if self.block.is_some() && need <= self.lim_size {
            if self.state != BufferState::Writing {
                return Err(ShmemLibError::logic(format!("cannot write a {:?} buffer", self.state)));
            }
            return Ok(());
        }
        match self.state {
            BufferState::Writing | BufferState::Released => {}
            state => return Err(ShmemLibError::logic(format!("cannot write a {:?} buffer", state))),
        }
        let Some(old) = self.block else {
            return self.reset(need);
        };
        let want = (need + MESSAGE_HEADER_SIZE).max(2 * (self.lim_size + MESSAGE_HEADER_SIZE));
        let (block, capacity) = self.store.allocate(want).map_err(|e| match e {
            ShmemLibError::BufferOverflow { available, .. } => ShmemLibError::BufferOverflow {
                requested: need,
                available: available.saturating_sub(MESSAGE_HEADER_SIZE),
            },
            e => e,
        })?;
        unsafe { ptr::copy_nonoverlapping(old.as_ptr(), block.as_ptr(), MESSAGE_HEADER_SIZE + self.msg_size()) };
        self.block = Some(block);
        self.lim_size = capacity - MESSAGE_HEADER_SIZE;
        self.store.release(old)
    }

    /// `n` writable bytes at the cursor; the cursor moves past them.
    pub fn reserve_bytes(&mut self, n: usize) -> Result<&mut [u8]> {
        self.has_space(n)?;
        let at = self.cursor.get();
        self.cursor.set(at + n);
        if at + n > self.msg_size() {
            self.set_header(MSG_SIZE_AT, (at + n) as u32);
        }
        let data = self.data_ptr();
        Ok(unsafe { slice::from_raw_parts_mut(data.add(at), n) })
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.reserve_bytes(bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    /// `n` bytes at the cursor; the cursor moves past them.
    pub fn read_bytes(&self, n: usize) -> Result<&[u8]> {
        let at = self.cursor.get();
        let available = self.msg_size().saturating_sub(at);
        if n > available {
            return Err(ShmemLibError::BufferUnderrun { requested: n, available });
        }
        if n == 0 {
            return Ok(&[]);
        }
        self.cursor.set(at + n);
        Ok(unsafe { slice::from_raw_parts(self.data_ptr().add(at), n) })
    }

    /// Move the cursor forward, over written bytes when reading or leaving a
    /// gap when writing.
    pub fn skip(&mut self, n: usize) -> Result<()> {
        if self.state == BufferState::Writing {
            self.reserve_bytes(n).map(|_| ())
        } else {
            self.read_bytes(n).map(|_| ())
        }
    }

    /// Bytes between the cursor and the end of the message.
    pub fn remaining(&self) -> usize {
        self.msg_size().saturating_sub(self.cursor.get())
    }

    pub fn rewind(&self) {
        self.cursor.set(0);
    }

    /// Empty the message, keeping the block.
    pub fn clear(&mut self) {
        self.cursor.set(0);
        if self.block.is_some() && self.state == BufferState::Writing {
            self.set_header(MSG_SIZE_AT, 0);
        }
    }

    pub fn current_pos(&self) -> usize {
        self.cursor.get()
    }

    /// Data capacity of the current block.
    pub fn capacity(&self) -> usize {
        self.lim_size
    }

    pub fn msg_size(&self) -> usize {
        self.header(MSG_SIZE_AT) as usize
    }

    pub fn set_msg_size(&mut self, size: usize) -> Result<()> {
        self.has_space(size.saturating_sub(self.cursor.get()))?;
        self.set_header(MSG_SIZE_AT, size as u32);
        Ok(())
    }

    pub fn message_num(&self) -> u32 {
        self.header(MESSAGE_NUM_AT)
    }

    pub fn set_message_num(&mut self, num: u32) -> Result<()> {
        self.has_space(0)?;
        self.set_header(MESSAGE_NUM_AT, num);
        Ok(())
    }

    /// Store the checksum of the current message in the header.
    pub fn set_checksum(&mut self) -> Result<()> {
        self.has_space(0)?;
        let sum = self.compute_checksum();
        self.set_header(CHECK_SUM_AT, sum as u32);
        Ok(())
    }

    pub fn checksum(&self) -> i32 {
        self.header(CHECK_SUM_AT) as i32
    }

    /// True if the stored checksum matches the message.
    pub fn verify_checksum(&self) -> bool {
        self.block.is_some() && self.checksum() == self.compute_checksum()
    }

    fn compute_checksum(&self) -> i32 {
        self.data()
            .iter()
            .enumerate()
            .fold(0i32, |sum, (i, b)| sum.wrapping_add(*b as i32).wrapping_add(i as i32))
    }

    /// The written message.
    pub fn data(&self) -> &[u8] {
        match self.block {
            Some(_) => unsafe { slice::from_raw_parts(self.data_ptr(), self.msg_size()) },
            None => &[],
        }
    }

    /// Replace this message with a copy of `other`'s.
    pub fn copy_from(&mut self, other: &MessageBuffer) -> Result<()> {
        self.clear();
        self.write_bytes(other.data())?;
        self.set_message_num(other.message_num())?;
        self.set_header(CHECK_SUM_AT, other.checksum() as u32);
        Ok(())
    }

    /// Hex dump of the message, 16 bytes per line.
    pub fn dump(&self) -> String {
        let mut out = format!(
            "message #{} size {} pos {}\n",
            self.message_num(),
            self.msg_size(),
            self.current_pos()
        );
        for (line, chunk) in self.data().chunks(16).enumerate() {
            let _ = write!(out, "{:08x}:", line * 16);
            for b in chunk {
                let _ = write!(out, " {:02x}", b);
            }
            out.push('\n');
        }
        out
    }

    pub fn add_multi_use(&mut self) {
        self.multi_use += 1;
    }

    pub fn remove_multi_use(&mut self) {
        self.multi_use = (self.multi_use - 1).max(1);
    }

    /// Readers the next publication is for.
    pub fn multi_use(&self) -> i32 {
        self.multi_use
    }

    pub fn supports_shmem_access(&self) -> bool {
        self.store.supports_shmem_access()
    }

    pub fn registry(&self) -> Option<&ShMemRegistry> {
        self.store.registry()
    }

    fn writable_block(&self) -> Result<NonNull<u8>> {
        match (self.state, self.block) {
            (BufferState::Writing, Some(block)) => Ok(block),
            (state, _) => Err(ShmemLibError::logic(format!("nothing to publish in a {:?} buffer", state))),
        }
    }

    fn data_ptr(&self) -> *mut u8 {
        match self.block {
            Some(block) => unsafe { block.as_ptr().add(MESSAGE_HEADER_SIZE) },
            None => ptr::null_mut(),
        }
    }

    fn header(&self, at: usize) -> u32 {
        match self.block {
            Some(block) => {
                let mut raw = [0u8; 4];
                unsafe { ptr::copy_nonoverlapping(block.as_ptr().add(at), raw.as_mut_ptr(), 4) };
                u32::from_ne_bytes(raw)
            }
            None => 0,
        }
    }

    fn set_header(&mut self, at: usize, value: u32) {
        if let Some(block) = self.block {
            let raw = value.to_ne_bytes();
            unsafe { ptr::copy_nonoverlapping(raw.as_ptr(), block.as_ptr().add(at), 4) };
        }
    }
}

impl Drop for MessageBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.free_buffer() {
            error!("failed to release message buffer: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::{HeapConfig, RingConfig};
    use crate::heap::SharedHeap;
    use crate::ring::ShMemRingAllocator;
    use crate::segment::SharedMem;

    fn ring_store(payload_size: usize, blocks: usize) -> (RingStore, Arc<ShMemRingAllocator>) {
        let registry = Arc::new(ShMemRegistry::new());
        let size = ShMemRingAllocator::required_size(payload_size, blocks);
        let mem = Arc::new(SharedMem::from_heap(1, "msg_ring", size));
        registry.register(&mem).unwrap();
        let config = RingConfig {
            payload_size,
            ..Default::default()
        };
        let ring = Arc::new(ShMemRingAllocator::new(mem, &config).unwrap());
        (RingStore::new(ring.clone(), registry), ring)
    }

    fn heap_store() -> (HeapStore, Arc<SharedHeap>) {
        let registry = Arc::new(ShMemRegistry::new());
        let mem = Arc::new(SharedMem::from_heap(2, "msg_heap", 1 << 14));
        registry.register(&mem).unwrap();
        let heap = Arc::new(SharedHeap::new(mem, &HeapConfig::default()).unwrap());
        (HeapStore::new(heap.clone(), registry), heap)
    }

    fn write_sample(buf: &mut MessageBuffer) -> Result<()> {
        buf.set_message_num(42)?;
        marshal(buf, &0xdead_beefu32)?;
        marshal(buf, &"weld seam".to_string())?;
        marshal(buf, &vec![1.5f64, -2.0, 3.25])?;
        buf.set_checksum()
    }

    fn read_sample(buf: &MessageBuffer) -> Result<()> {
        assert_eq!(buf.message_num(), 42);
        assert!(buf.verify_checksum());
        assert_eq!(demarshal::<u32>(buf)?, 0xdead_beef);
        assert_eq!(demarshal::<String>(buf)?, "weld seam");
        assert_eq!(demarshal::<Vec<f64>>(buf)?, vec![1.5, -2.0, 3.25]);
        assert_eq!(buf.remaining(), 0);
        Ok(())
    }

    #[test]
    fn local_round_trip() -> Result<()> {
        let mut buf = MessageBuffer::new(Box::new(LocalStore::new()));
        write_sample(&mut buf)?;
        buf.rewind();
        read_sample(&buf)
    }

    #[test]
    fn ring_round_trip_releases_the_block() -> Result<()> {
        let (store, ring) = ring_store(256, 2);
        let mut buf = MessageBuffer::with_size(Box::new(store), 128)?;
        write_sample(&mut buf)?;
        let rel = buf.publish()?;
        assert_eq!(buf.state(), BufferState::Published);
        drop(buf);
        assert_eq!(ring.free_blocks(), 1);

        let registry = Arc::new(ShMemRegistry::new());
        registry.register(ring.memory())?;
        let reader = RingStore::new(ring.clone(), registry);
        let received = MessageBuffer::receive(Box::new(reader), rel)?;
        read_sample(&received)?;
        drop(received);
        assert_eq!(ring.free_blocks(), 2);
        Ok(())
    }

    #[test]
    fn heap_round_trip() -> Result<()> {
        let (store, heap) = heap_store();
        let capacity = heap.lock()?.capacity();
        let registry = Arc::new(ShMemRegistry::new());
        registry.register(&heap.memory())?;

        let mut buf = MessageBuffer::new(Box::new(store));
        write_sample(&mut buf)?;
        let rel = buf.publish()?;

        let reader = HeapStore::new(heap.clone(), registry);
        let mut received = MessageBuffer::receive(Box::new(reader), rel)?;
        assert_eq!(received.state(), BufferState::Reading);
        read_sample(&received)?;
        received.free_buffer()?;
        assert_eq!(heap.lock()?.get_free_mem_size(), capacity);
        Ok(())
    }

    #[test]
    fn growth_keeps_written_bytes() -> Result<()> {
        let store = LocalStore::new();
        let mut buf = MessageBuffer::with_size(Box::new(store), 8)?;
        buf.set_message_num(9)?;
        let first = buf.capacity();
        let bytes: Vec<u8> = (0..=255).collect();
        buf.write_bytes(&bytes)?;
        buf.write_bytes(&bytes)?;
        assert!(buf.capacity() > first);
        assert_eq!(buf.message_num(), 9);
        assert_eq!(buf.msg_size(), 512);
        buf.rewind();
        assert_eq!(buf.read_bytes(256)?, &bytes[..]);
        assert_eq!(buf.read_bytes(256)?, &bytes[..]);
        Ok(())
    }

    #[test]
    fn ring_blocks_do_not_grow() -> Result<()> {
        let (store, ring) = ring_store(64, 2);
        let mut buf = MessageBuffer::with_size(Box::new(store), 16)?;
        assert_eq!(buf.capacity(), 64 - MESSAGE_HEADER_SIZE);
        let err = buf.write_bytes(&[0u8; 100]).unwrap_err();
        assert!(matches!(err, ShmemLibError::BufferOverflow { requested: 100, available: 48 }));
        drop(buf);
        assert_eq!(ring.free_blocks(), 2);
        Ok(())
    }

    #[test]
    fn fan_out_needs_every_reader() -> Result<()> {
        let (store, ring) = ring_store(128, 1);
        let mut buf = MessageBuffer::new(Box::new(store));
        buf.add_multi_use();
        buf.add_multi_use();
        buf.remove_multi_use();
        assert_eq!(buf.multi_use(), 2);
        marshal(&mut buf, &7u8)?;
        let rel = buf.publish()?;
        let block = ring.block_at(rel.offset() as usize)?;
        assert_eq!(ring.ref_count(block)?, 2);
        ring.free_block(block)?;
        assert_eq!(ring.free_blocks(), 0);
        ring.free_block(block)?;
        assert_eq!(ring.free_blocks(), 1);
        Ok(())
    }

    #[test]
    fn local_blocks_cannot_be_published() -> Result<()> {
        let store = LocalStore::new();
        let mut buf = MessageBuffer::new(Box::new(store));
        marshal(&mut buf, &1u32)?;
        assert!(buf.publish().is_err());
        assert_eq!(buf.state(), BufferState::Writing);
        assert!(!buf.supports_shmem_access());
        Ok(())
    }

    #[test]
    fn clear_skip_and_explicit_size() -> Result<()> {
        let mut buf = MessageBuffer::new(Box::new(LocalStore::new()));
        buf.skip(4)?;
        marshal(&mut buf, &3u16)?;
        assert_eq!(buf.current_pos(), 6);
        buf.rewind();
        buf.set_msg_size(4)?;
        buf.clear();
        assert_eq!(buf.msg_size(), 0);
        assert!(buf.read_bytes(1).is_err());
        buf.set_msg_size(32)?;
        assert_eq!(buf.msg_size(), 32);
        assert_eq!(buf.data().len(), 32);
        Ok(())
    }

    #[test]
    fn copy_and_dump() -> Result<()> {
        let mut a = MessageBuffer::new(Box::new(LocalStore::new()));
        a.set_message_num(3)?;
        a.write_bytes(&[0xab; 20])?;
        a.set_checksum()?;
        let mut b = MessageBuffer::new(Box::new(LocalStore::new()));
        b.copy_from(&a)?;
        assert_eq!(b.data(), a.data());
        assert_eq!(b.message_num(), 3);
        assert!(b.verify_checksum());
        let text = b.dump();
        assert!(text.starts_with("message #3 size 20"));
        assert!(text.contains("00000010: ab ab ab ab"));
        Ok(())
    }

    #[test]
    fn checksum_detects_changes() -> Result<()> {
        let mut buf = MessageBuffer::new(Box::new(LocalStore::new()));
        buf.write_bytes(&[1, 2, 3])?;
        buf.set_checksum()?;
        // (1+0) + (2+1) + (3+2)
        assert_eq!(buf.checksum(), 9);
        buf.write_bytes(&[4])?;
        assert!(!buf.verify_checksum());
        Ok(())
    }

    #[test]
    fn drop_releases_local_blocks() -> Result<()> {
        let store = Arc::new(LocalStore::new());
        struct Shared(Arc<LocalStore>);
        impl BufferStore for Shared {
            fn allocate(&self, size: usize) -> Result<(NonNull<u8>, usize)> {
                self.0.allocate(size)
            }
            fn release(&self, block: NonNull<u8>) -> Result<()> {
                self.0.release(block)
            }
            fn share(&self, block: NonNull<u8>, readers: i32) -> Result<()> {
                self.0.share(block, readers)
            }
            fn to_relative(&self, block: NonNull<u8>) -> Result<ShMemPtr<u8>> {
                self.0.to_relative(block)
            }
            fn resolve(&self, rel: ShMemPtr<u8>) -> Result<(NonNull<u8>, usize)> {
                self.0.resolve(rel)
            }
            fn supports_shmem_access(&self) -> bool {
                self.0.supports_shmem_access()
            }
            fn registry(&self) -> Option<&ShMemRegistry> {
                self.0.registry()
            }
        }
        let mut buf = MessageBuffer::new(Box::new(Shared(store.clone())));
        buf.write_bytes(&[0u8; 1000])?;
        assert_eq!(store.live_blocks(), 1);
        drop(buf);
        assert_eq!(store.live_blocks(), 0);
        Ok(())
    }
}
