use std::error::Error;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use log::{info, warn};
use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};

use shmsg::{HeapConfig, SharedHeap, ShmemConfig};

#[derive(Default, Debug, Serialize, Deserialize)]
#[serde(default)]
struct BenchConfig {
    shmem: ShmemConfig,
    heap: HeapConfig,
}

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "shmsg-heap.toml")]
    config: String,
    #[clap(short = 'n', long = "iterations", default_value = "1000000")]
    iterations: u64,
    /// Largest request in bytes.
    #[clap(short = 'm', long = "max-size", default_value = "4096")]
    max_size: usize,
    /// Allocations kept alive at once.
    #[clap(short = 'l', long = "live", default_value = "64")]
    live: usize,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let opts: Opts = Opts::parse();
    let cfg: BenchConfig = confy::load_path(&opts.config)?;

    let closing = Arc::new(AtomicBool::new(false));
    for signal in [SIGHUP, SIGINT, SIGQUIT, SIGTERM] {
        signal_hook::flag::register(signal, closing.clone())?;
    }

    let memory = cfg.shmem.open()?;
    println!("shmem info: {}", memory);
    let heap = SharedHeap::new(memory, &cfg.heap)?;

    let churn = Churn {
        iterations: opts.iterations,
        max_size: opts.max_size.max(1),
        live: opts.live.max(1),
    };
    let start = Instant::now();
    let stats = churn.run(&heap, &closing)?;
    let duration = start.elapsed();
    let iops = ((stats.ops as f64) / (duration.as_millis().max(1) as f64)) * 1_000f64;
    println!(
        "\n{:#?}K alloc+free/s. Total time: {:#?}",
        (iops / 1000f64) as u64,
        duration
    );
    println!(
        "failed allocations {}, peak fragmented free {} bytes, capacity {} bytes",
        stats.failed, stats.peak_fragmented, stats.capacity
    );
    Ok(())
}

struct Churn {
    iterations: u64,
    max_size: usize,
    live: usize,
}

#[derive(Debug, Default)]
struct Stats {
    ops: u64,
    failed: u64,
    peak_fragmented: usize,
    capacity: usize,
}

/// Deterministic request sizes and slots.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

impl Churn {
    /// Random alloc/free traffic over a fixed number of live slots, then
    /// everything is freed and the heap must be whole again.
    fn run(&self, heap: &SharedHeap, closing: &AtomicBool) -> shmsg::Result<Stats> {
        let mut stats = Stats {
            capacity: heap.lock()?.capacity(),
            ..Default::default()
        };
        let mut slots: Vec<Option<(NonNull<u8>, usize, u8)>> = vec![None; self.live];
        let mut rng = Lcg(0x5eed);

        for i in 0..self.iterations {
            if closing.load(Ordering::Relaxed) {
                info!("interrupted after {} iterations", i);
                break;
            }
            let slot = (rng.next() as usize) % self.live;
            if let Some((p, size, tag)) = slots[slot].take() {
                let intact = unsafe { std::slice::from_raw_parts(p.as_ptr(), size) }
                    .iter()
                    .all(|b| *b == tag);
                if !intact {
                    warn!("block at {:p} was overwritten", p);
                }
                heap.free(p)?;
            } else {
                let size = 1 + (rng.next() as usize) % self.max_size;
                match heap.alloc(size)? {
                    Some(p) => {
                        let tag = i as u8;
                        unsafe { std::ptr::write_bytes(p.as_ptr(), tag, size) };
                        slots[slot] = Some((p, size, tag));
                    }
                    None => stats.failed += 1,
                }
            }
            stats.ops += 1;
            if i % 10_000 == 0 {
                let fragmented = heap.lock()?.get_fragmented_free_mem_size();
                stats.peak_fragmented = stats.peak_fragmented.max(fragmented);
            }
            if i % 100_000 == 0 {
                eprint!("\rTotal {} ops (failed: {})", i, stats.failed);
            }
        }

        for (p, _, _) in slots.into_iter().flatten() {
            heap.free(p)?;
        }
        let mut guard = heap.lock()?;
        let free = guard.get_free_mem_size();
        if free != stats.capacity {
            return Err(shmsg::ShmemLibError::logic(format!(
                "{} of {} bytes free after releasing every block",
                free, stats.capacity
            )));
        }
        Ok(stats)
    }
}
