use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Instant;

use clap::Parser;
use log::{info, warn};
use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};

use shmsg::message::{demarshal_array, marshal_array, RingStore};
use shmsg::{demarshal, marshal, MessageBuffer, RingConfig, ShMemPtr, ShMemRegistry, ShMemRingAllocator, ShmemConfig};

#[derive(Default, Debug, Serialize, Deserialize)]
#[serde(default)]
struct BenchConfig {
    shmem: ShmemConfig,
    ring: RingConfig,
}

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "shmsg-ring.toml")]
    config: String,
    #[clap(short = 'n', long = "messages", default_value = "1000000")]
    messages: u64,
    #[clap(short = 'r', long = "readers", default_value = "2")]
    readers: usize,
    /// Payload bytes per message.
    #[clap(short = 's', long = "size", default_value = "256")]
    size: usize,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let opts: Opts = Opts::parse();
    let cfg: BenchConfig = confy::load_path(&opts.config)?;

    let closing = Arc::new(AtomicBool::new(false));
    for signal in [SIGHUP, SIGINT, SIGQUIT, SIGTERM] {
        signal_hook::flag::register(signal, closing.clone())?;
    }

    let registry = Arc::new(ShMemRegistry::new());
    let memory = cfg.shmem.open_registered(&registry)?;
    println!("shmem info: {}", memory);
    let ring = Arc::new(ShMemRingAllocator::new(memory, &cfg.ring)?);

    let bench = Bench {
        messages: opts.messages,
        readers: opts.readers.max(1),
        size: opts.size,
    };
    let start = Instant::now();
    let stats = bench.run(ring, registry, &closing)?;
    let duration = start.elapsed();
    let iops = ((stats.sent as f64) / (duration.as_millis().max(1) as f64)) * 1_000f64;
    println!(
        "\n{:#?}K messages write/s. Total time: {:#?}",
        (iops / 1000f64) as u64,
        duration
    );
    println!(
        "sent {}, received {}, exhausted {} times",
        stats.sent, stats.received, stats.exhausted
    );
    Ok(())
}

struct Bench {
    messages: u64,
    readers: usize,
    size: usize,
}

#[derive(Debug, Default, PartialEq)]
struct Stats {
    sent: u64,
    received: u64,
    exhausted: u64,
}

impl Bench {
    /// One writer publishes every message to all readers; each reader checks
    /// and releases its copy.
    fn run(&self, ring: Arc<ShMemRingAllocator>, registry: Arc<ShMemRegistry>, closing: &AtomicBool) -> shmsg::Result<Stats> {
        let mut senders = Vec::with_capacity(self.readers);
        let mut workers = Vec::with_capacity(self.readers);
        for id in 0..self.readers {
            let (tx, rx) = mpsc::channel::<ShMemPtr<u8>>();
            senders.push(tx);
            let ring = ring.clone();
            let registry = registry.clone();
            let size = self.size;
            workers.push(thread::spawn(move || -> shmsg::Result<u64> {
                let mut received = 0u64;
                for rel in rx {
                    let buf = MessageBuffer::receive(Box::new(RingStore::new(ring.clone(), registry.clone())), rel)?;
                    let seq: u64 = demarshal(&buf)?;
                    let payload: Vec<u8> = demarshal_array(&buf, size)?;
                    if !buf.verify_checksum() || payload.iter().any(|b| *b != seq as u8) {
                        warn!("reader {}: message {} is corrupt", id, seq);
                    }
                    received += 1;
                }
                Ok(received)
            }));
        }

        let mut stats = Stats::default();
        let mut payload = vec![0u8; self.size];
        for seq in 0..self.messages {
            if closing.load(Ordering::Relaxed) {
                info!("interrupted after {} messages", seq);
                break;
            }
            payload.fill(seq as u8);
            let rel = loop {
                match self.publish(&ring, &registry, seq, &payload) {
                    Ok(rel) => break rel,
                    Err(e) if e.is_fatal() && !closing.load(Ordering::Relaxed) => {
                        stats.exhausted += 1;
                        thread::yield_now();
                    }
                    Err(e) => return Err(e),
                }
            };
            for tx in &senders {
                // a reader that hung up has already failed; its error is
                // reported on join
                let _ = tx.send(rel);
            }
            stats.sent += 1;
            if seq % 100_000 == 0 {
                eprint!("\rTotal {} ops (free blocks: {})", seq, ring.free_blocks());
            }
        }
        drop(senders);
        for w in workers {
            let received = w
                .join()
                .map_err(|_| shmsg::ShmemLibError::logic("reader thread panicked"))??;
            stats.received += received;
        }
        Ok(stats)
    }

    fn publish(
        &self,
        ring: &Arc<ShMemRingAllocator>,
        registry: &Arc<ShMemRegistry>,
        seq: u64,
        payload: &[u8],
    ) -> shmsg::Result<ShMemPtr<u8>> {
        let mut buf = MessageBuffer::new(Box::new(RingStore::new(ring.clone(), registry.clone())));
        for _ in 1..self.readers {
            buf.add_multi_use();
        }
        buf.set_message_num(seq as u32)?;
        marshal(&mut buf, &seq)?;
        marshal_array(&mut buf, payload)?;
        buf.set_checksum()?;
        buf.publish()
    }
}
