//! Multi-producer/multi-consumer stress tests over a real shared-memory
//! mapping. Each thread builds its own `MessageQueue` from the shared
//! configuration, so every access goes through a separate mapping of the
//! region, the same way cooperating processes would.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::thread;

use tempfile::{tempdir, TempDir};

use crate::core::{MessageQueue, QueueConfig};

static TEST_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn stress_config(entry_count: usize, region_size: usize) -> (Arc<QueueConfig>, TempDir) {
    let test_id = TEST_ID_COUNTER.fetch_add(1, AtomicOrdering::SeqCst);
    let temp_dir = tempdir().expect("failed to create tempdir for stress test");
    let cfg = QueueConfig::builder()
        .data_dir(temp_dir.path().to_str().expect("path is not valid UTF-8"))
        .shmem_file_name(format!(
            "stress-{}-{}",
            std::process::id(),
            test_id
        ))
        .entry_count(entry_count)
        .region_size(region_size)
        .build()
        .expect("failed to build stress config");
    (Arc::new(cfg), temp_dir)
}

fn tag(producer: u32, seq: u32) -> [u8; 8] {
    let mut payload = [0u8; 8];
    payload[..4].copy_from_slice(&producer.to_le_bytes());
    payload[4..].copy_from_slice(&seq.to_le_bytes());
    payload
}

#[test]
fn four_producers_one_consumer_exactly_once_in_order() {
    const PRODUCERS: u32 = 4;
    const PER_PRODUCER: u32 = 100;

    let (cfg, _temp_dir) = stress_config(32, 256 * 1024);

    // The creator stays alive for the whole test so the flink file (owned
    // by the creating mapping) outlives the attached peers.
    let consumer = MessageQueue::create(&cfg).expect("failed to create queue");

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let cfg = Arc::clone(&cfg);
            thread::spawn(move || {
                let queue = MessageQueue::attach(&cfg).expect("producer failed to attach");
                for seq in 0..PER_PRODUCER {
                    loop {
                        match queue.enqueue(&tag(producer, seq)) {
                            Ok(true) => break,
                            Ok(false) => thread::yield_now(),
                            Err(e) => panic!("producer {} failed: {:?}", producer, e),
                        }
                    }
                }
            })
        })
        .collect();

    let mut next_seq = [0u32; PRODUCERS as usize];
    let mut received = 0u32;
    while received < PRODUCERS * PER_PRODUCER {
        match consumer.dequeue().expect("consumer failed") {
            Some(bytes) => {
                assert_eq!(bytes.len(), 8);
                let producer = u32::from_le_bytes(bytes[..4].try_into().unwrap());
                let seq = u32::from_le_bytes(bytes[4..].try_into().unwrap());
                assert!(producer < PRODUCERS);
                assert_eq!(
                    seq, next_seq[producer as usize],
                    "producer {} delivered out of order",
                    producer
                );
                next_seq[producer as usize] += 1;
                received += 1;
            }
            None => thread::yield_now(),
        }
    }

    for handle in producers {
        handle.join().expect("producer thread panicked");
    }
    assert!(consumer.is_empty());
    assert_eq!(next_seq, [PER_PRODUCER; PRODUCERS as usize]);
}

#[test]
fn mixed_sizes_two_consumers_no_loss_no_duplicates() {
    const PRODUCERS: u32 = 2;
    const CONSUMERS: u32 = 2;
    const PER_PRODUCER: u32 = 200;
    const TOTAL: usize = (PRODUCERS * PER_PRODUCER) as usize;

    let (cfg, _temp_dir) = stress_config(16, 512 * 1024);
    let creator = MessageQueue::create(&cfg).expect("failed to create queue");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let received = Arc::new(AtomicUsize::new(0));

    let mut workers = Vec::new();
    for producer in 0..PRODUCERS {
        let cfg = Arc::clone(&cfg);
        workers.push(thread::spawn(move || {
            let queue = MessageQueue::attach(&cfg).expect("producer failed to attach");
            for seq in 0..PER_PRODUCER {
                // Vary the payload length so runs of different chunk counts
                // churn through the allocator.
                let len = 8 + (seq as usize * 13) % 120;
                let mut payload = vec![0u8; len];
                payload[..8].copy_from_slice(&tag(producer, seq));
                payload[8..].fill((seq % 251) as u8);
                loop {
                    match queue.enqueue(&payload) {
                        Ok(true) => break,
                        Ok(false) => thread::yield_now(),
                        Err(e) => panic!("producer {} failed: {:?}", producer, e),
                    }
                }
            }
        }));
    }

    for _ in 0..CONSUMERS {
        let cfg = Arc::clone(&cfg);
        let seen = Arc::clone(&seen);
        let received = Arc::clone(&received);
        workers.push(thread::spawn(move || {
            let queue = MessageQueue::attach(&cfg).expect("consumer failed to attach");
            while received.load(AtomicOrdering::SeqCst) < TOTAL {
                match queue.dequeue().expect("consumer failed") {
                    Some(bytes) => {
                        assert!(bytes.len() >= 8);
                        let producer = u32::from_le_bytes(bytes[..4].try_into().unwrap());
                        let seq = u32::from_le_bytes(bytes[4..].try_into().unwrap());
                        let expected_len = 8 + (seq as usize * 13) % 120;
                        assert_eq!(bytes.len(), expected_len);
                        assert!(bytes[8..].iter().all(|&b| b == (seq % 251) as u8));
                        seen.lock().unwrap().push((producer, seq));
                        received.fetch_add(1, AtomicOrdering::SeqCst);
                    }
                    None => thread::yield_now(),
                }
            }
        }));
    }

    for handle in workers {
        handle.join().expect("worker thread panicked");
    }

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), TOTAL);
    let unique: HashSet<_> = seen.iter().copied().collect();
    assert_eq!(unique.len(), TOTAL, "a message was delivered twice");

    // Everything was drained and released; the queue still has room for a
    // large message, so the chunks all made it back.
    assert!(creator.is_empty());
    assert!(creator
        .enqueue(&vec![0x5Au8; 4 * 1024])
        .expect("creator handle failed"));
}
