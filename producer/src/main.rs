use std::error::Error;
use std::thread;
use std::time::{Duration, Instant};

use clap::{self, Parser};
use serde_derive::{Deserialize, Serialize};

use shmq::core::{MessageQueue, QueueConfig};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "shmq-producer.toml")]
    config: String,
    #[clap(short = 'n', long = "count", default_value = "100000")]
    count: usize,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct ProducerConfig {
    queue: QueueConfig,
}

fn main() -> Result<(), Box<dyn Error>> {
    let opts: Opts = Opts::parse();
    let cfg: ProducerConfig = confy::load_path(&opts.config)?;
    let queue = MessageQueue::create(&cfg.queue)?;
    run(&queue, opts.count)?;
    queue.close();
    Ok(())
}

fn run(queue: &MessageQueue, count: usize) -> Result<(), Box<dyn Error>> {
    let start = Instant::now();
    let mut sent = 0usize;
    let mut rejections = 0usize;

    while sent < count {
        let message = sent.to_string();
        if queue.enqueue(message.as_bytes())? {
            sent += 1;
            if sent % 1_000_000 == 0 {
                eprint!("\rTotal {} ops", sent);
            }
        } else {
            // Full ring or exhausted allocator; back off and let a
            // consumer drain.
            rejections += 1;
            thread::sleep(Duration::from_micros(50));
        }
    }

    let duration = start.elapsed();
    let iops = ((sent as f64) / (duration.as_millis().max(1) as f64)) * 1_000f64;
    println!(
        "\n{:#?}K messages write/s. Total time: {:#?}, rejected attempts: {}, overflow counter: {}",
        (iops / 1000f64) as u64,
        duration,
        rejections,
        queue.overflow_count(),
    );
    Ok(())
}
