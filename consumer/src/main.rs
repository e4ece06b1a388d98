use std::error::Error;
use std::thread;
use std::time::{Duration, Instant};

use clap::{self, Parser};
use serde_derive::{Deserialize, Serialize};

use shmq::core::{MessageQueue, QueueConfig};
use shmq::ShmqError;

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "shmq-consumer.toml")]
    config: String,
    #[clap(short = 'n', long = "count", default_value = "100000")]
    count: usize,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct ConsumerConfig {
    queue: QueueConfig,
}

fn main() -> Result<(), Box<dyn Error>> {
    let opts: Opts = Opts::parse();
    let cfg: ConsumerConfig = confy::load_path(&opts.config)?;
    let queue = attach_with_retry(&cfg.queue)?;
    run(&queue, opts.count)?;
    queue.close();
    Ok(())
}

/// The producer may not have created the mapping yet; poll for it briefly
/// before giving up.
fn attach_with_retry(cfg: &QueueConfig) -> Result<MessageQueue, ShmqError> {
    for _ in 0..50 {
        match MessageQueue::attach(cfg) {
            Ok(queue) => return Ok(queue),
            Err(_) => thread::sleep(Duration::from_millis(100)),
        }
    }
    MessageQueue::attach(cfg)
}

fn run(queue: &MessageQueue, count: usize) -> Result<(), Box<dyn Error>> {
    let start = Instant::now();
    let mut received = 0usize;

    while received < count {
        match queue.dequeue()? {
            Some(message) => {
                received += 1;
                if received % 1_000_000 == 0 {
                    eprint!(
                        "\rTotal {} ops (last message: {})",
                        received,
                        String::from_utf8_lossy(&message)
                    );
                }
            }
            None => thread::sleep(Duration::from_micros(10)),
        }
    }

    let duration = start.elapsed();
    let iops = ((received as f64) / (duration.as_millis().max(1) as f64)) * 1_000f64;
    println!(
        "\n{:#?}K messages read/s. Total time: {:#?}",
        (iops / 1000f64) as u64,
        duration
    );
    Ok(())
}
