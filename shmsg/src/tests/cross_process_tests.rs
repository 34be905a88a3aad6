// Two "processes" are two independent mappings of one OS segment, each with
// its own registry: bases differ, handles agree.

use std::sync::Arc;

use crate::config::{HeapConfig, RingConfig, ShmemConfig};
use crate::errors::Result;
use crate::heap::SharedHeap;
use crate::message::{demarshal, marshal, HeapStore, MessageBuffer, RingStore, Serializable};
use crate::ptr::{ShMemPtr, SmartPtr, SHARED_MEM_TYPE};
use crate::registry::ShMemRegistry;
use crate::ring::ShMemRingAllocator;
use crate::segment::tests::unique_name;
use crate::segment::{ShMemMode, SharedMem};

struct Process {
    registry: Arc<ShMemRegistry>,
    memory: Arc<SharedMem>,
}

fn server_and_client(handle: i32, size: usize) -> Result<(Process, Process)> {
    let config = ShmemConfig {
        name: unique_name("xproc"),
        handle,
        size,
        mode: ShMemMode::STD_SERVER,
    };
    let server_registry = Arc::new(ShMemRegistry::new());
    let server = config.open_registered(&server_registry)?;

    let client_config = ShmemConfig {
        mode: ShMemMode::STD_CLIENT,
        size: 0,
        ..config
    };
    let client_registry = Arc::new(ShMemRegistry::new());
    let client = client_config.open_registered(&client_registry)?;
    assert_ne!(server.begin(), client.begin());
    Ok((
        Process {
            registry: server_registry,
            memory: server,
        },
        Process {
            registry: client_registry,
            memory: client,
        },
    ))
}

#[derive(Debug, PartialEq)]
struct Measurement {
    frame: u64,
    seam_width: f32,
    profile: SmartPtr<i16>,
}

impl Serializable for Measurement {
    fn serialize(&self, buffer: &mut MessageBuffer) -> Result<()> {
        marshal(buffer, &self.frame)?;
        marshal(buffer, &self.seam_width)?;
        marshal(buffer, &self.profile)
    }

    fn deserialize(buffer: &MessageBuffer) -> Result<Self> {
        Ok(Measurement {
            frame: demarshal(buffer)?,
            seam_width: demarshal(buffer)?,
            profile: demarshal(buffer)?,
        })
    }
}

impl PartialEq for SmartPtr<i16> {
    fn eq(&self, other: &Self) -> bool {
        let registry = ShMemRegistry::new();
        self.kind() == other.kind() && self.to_vec(&registry).ok() == other.to_vec(&registry).ok()
    }
}

impl std::fmt::Debug for SmartPtr<i16> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SmartPtr(kind {}, len {})", self.kind(), self.len())
    }
}

#[test]
fn test_relative_pointer_resolves_in_both_processes() -> Result<()> {
    super::init_logging();
    let (a, b) = server_and_client(5, 4096)?;
    let raw = unsafe { a.memory.begin().add(128) };
    let rel = ShMemPtr::new(&a.memory, raw)?;
    assert_eq!((rel.handle(), rel.offset()), (5, 128));

    unsafe { *raw = 0x7e };
    let there = b.registry.resolve(rel);
    assert_eq!(there, unsafe { b.memory.begin().add(128) });
    assert_ne!(there, raw);
    assert_eq!(unsafe { *there }, 0x7e);
    Ok(())
}

#[test]
fn test_ring_message_crosses_mappings() -> Result<()> {
    super::init_logging();
    let ring_config = RingConfig {
        payload_size: 512,
        ..Default::default()
    };
    let (a, b) = server_and_client(1, ShMemRingAllocator::required_size(512, 8))?;
    let sender_ring = Arc::new(ShMemRingAllocator::new(a.memory.clone(), &ring_config)?);
    let receiver_ring = Arc::new(ShMemRingAllocator::attach(b.memory.clone(), &ring_config)?);

    let mut buf = MessageBuffer::new(Box::new(RingStore::new(sender_ring.clone(), a.registry.clone())));
    let sent = Measurement {
        frame: 991,
        seam_width: 1.75,
        profile: SmartPtr::from_vec(vec![-3, 0, 12, 40]),
    };
    buf.set_message_num(17)?;
    marshal(&mut buf, &sent)?;
    buf.set_checksum()?;
    let rel = buf.publish()?;
    assert_eq!(receiver_ring.free_blocks(), 7);

    let received = MessageBuffer::receive(Box::new(RingStore::new(receiver_ring.clone(), b.registry.clone())), rel)?;
    assert_eq!(received.message_num(), 17);
    assert!(received.verify_checksum());
    let got: Measurement = demarshal(&received)?;
    assert_eq!(got, sent);
    drop(received);
    assert_eq!(sender_ring.free_blocks(), 8);
    Ok(())
}

#[test]
fn test_shared_memory_payload_goes_by_reference() -> Result<()> {
    super::init_logging();
    let ring_config = RingConfig {
        payload_size: 128,
        ..Default::default()
    };
    let (a, b) = server_and_client(2, 1 << 16)?;
    // image data and message blocks share one segment: ring in the upper half
    let image = a.memory.begin() as *mut i16;
    for i in 0..64 {
        unsafe { *image.add(i) = i as i16 * 3 };
    }
    let half = a.memory.size() / 2;
    let ring_view = |p: &Process, create: bool| -> Result<Arc<ShMemRingAllocator>> {
        let base = unsafe { std::ptr::NonNull::new_unchecked(p.memory.begin().add(half)) };
        let view = Arc::new(unsafe { SharedMem::from_raw(9, "ring_view", base, half) });
        p.registry.register(&view)?;
        let ring = if create {
            ShMemRingAllocator::new(view, &ring_config)?
        } else {
            ShMemRingAllocator::attach(view, &ring_config)?
        };
        Ok(Arc::new(ring))
    };
    let sender_ring = ring_view(&a, true)?;
    let receiver_ring = ring_view(&b, false)?;

    let profile = SmartPtr::shared(ShMemPtr::new(&a.memory, image)?, 64);
    let mut buf = MessageBuffer::new(Box::new(RingStore::new(sender_ring, a.registry.clone())));
    marshal(&mut buf, &profile)?;
    assert_eq!(buf.msg_size(), 16);
    let rel = buf.publish()?;

    let received = MessageBuffer::receive(Box::new(RingStore::new(receiver_ring, b.registry.clone())), rel)?;
    let got: SmartPtr<i16> = demarshal(&received)?;
    assert_eq!(got.kind(), SHARED_MEM_TYPE);
    let values = got.to_vec(&b.registry)?;
    assert_eq!(values.len(), 64);
    assert_eq!(values[63], 189);
    Ok(())
}

#[test]
fn test_shared_heap_across_mappings() -> Result<()> {
    super::init_logging();
    let (a, b) = server_and_client(3, 1 << 15)?;
    let heap_a = Arc::new(SharedHeap::new(a.memory.clone(), &HeapConfig::default())?);
    let heap_b = Arc::new(SharedHeap::attach(b.memory.clone(), &HeapConfig::default())?);
    let capacity = heap_a.lock()?.capacity();

    let mut buf = MessageBuffer::new(Box::new(HeapStore::new(heap_a.clone(), a.registry.clone())));
    marshal(&mut buf, &"frame 12 ok".to_string())?;
    marshal(&mut buf, &vec![9u32; 300])?;
    let rel = buf.publish()?;

    let mut received = MessageBuffer::receive(Box::new(HeapStore::new(heap_b.clone(), b.registry.clone())), rel)?;
    assert_eq!(demarshal::<String>(&received)?, "frame 12 ok");
    assert_eq!(demarshal::<Vec<u32>>(&received)?, vec![9u32; 300]);
    received.free_buffer()?;

    assert_eq!(heap_a.lock()?.get_free_mem_size(), capacity);
    Ok(())
}
