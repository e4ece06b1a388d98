//! Region acquisition and the process-facing queue handle.
//!
//! The queue itself only needs a base address and a length; this module
//! supplies them from a file-link backed shared memory mapping, carries the
//! sizing parameters every peer must agree on, and wraps the whole thing in
//! a handle that shuts down cleanly when the process is told to terminate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use shared_memory::*;

use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::signal::*;
use signal_hook::iterator::Signals;

use crate::queue::{required_byte_size, RingQueue};
use crate::ShmqError;

pub static SHMEM_FILE_NAME: &str = "shmq-queue";

pub const DEFAULT_ENTRY_COUNT: usize = 256;
pub const DEFAULT_REGION_SIZE: usize = 1024 * 1024;

/// Sizing and naming parameters for one queue. Every process attaching to
/// the same queue must use an identical configuration; the region layout is
/// derived from `entry_count` and the mapping length.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct QueueConfig {
    pub data_dir: String,
    pub shmem_file_name: String,
    pub entry_count: usize,
    pub region_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            data_dir: String::from("."),
            shmem_file_name: String::from(SHMEM_FILE_NAME),
            entry_count: DEFAULT_ENTRY_COUNT,
            region_size: DEFAULT_REGION_SIZE,
        }
    }
}

impl QueueConfig {
    pub fn builder() -> QueueConfigBuilder {
        QueueConfigBuilder {
            config: QueueConfig::default(),
        }
    }
}

pub struct QueueConfigBuilder {
    config: QueueConfig,
}

impl QueueConfigBuilder {
    pub fn data_dir<S: Into<String>>(mut self, data_dir: S) -> Self {
        self.config.data_dir = data_dir.into();
        self
    }

    pub fn shmem_file_name<S: Into<String>>(mut self, shmem_file_name: S) -> Self {
        self.config.shmem_file_name = shmem_file_name.into();
        self
    }

    pub fn entry_count(mut self, entry_count: usize) -> Self {
        self.config.entry_count = entry_count;
        self
    }

    pub fn region_size(mut self, region_size: usize) -> Self {
        self.config.region_size = region_size;
        self
    }

    pub fn build(self) -> Result<QueueConfig, ShmqError> {
        let cfg = self.config;
        if cfg.entry_count < 2 {
            return Err(ShmqError::Logic(format!(
                "entry_count ({}) must be at least 2",
                cfg.entry_count
            )));
        }
        let minimum = required_byte_size(cfg.entry_count, 0);
        if cfg.region_size < minimum {
            return Err(ShmqError::Logic(format!(
                "region_size ({}) is below the {} bytes needed for {} ring slots",
                cfg.region_size, minimum, cfg.entry_count
            )));
        }
        Ok(cfg)
    }
}

fn shmem_file(cfg: &QueueConfig) -> String {
    format!("{}/{}", &cfg.data_dir, &cfg.shmem_file_name)
}

fn open_linked(cfg: &QueueConfig) -> Result<Box<Shmem>, ShmqError> {
    Ok(Box::new(ShmemConf::new().flink(shmem_file(cfg)).open()?))
}

/// Creates the backing mapping, or opens it when a peer created it first.
/// The boolean reports whether this call created (and therefore must
/// initialize) the region.
pub fn create_context(cfg: &QueueConfig) -> Result<(Box<Shmem>, bool), ShmqError> {
    match ShmemConf::new()
        .size(cfg.region_size)
        .flink(shmem_file(cfg))
        .create()
    {
        Ok(v) => Ok((Box::new(v), true)),
        Err(shared_memory::ShmemError::LinkExists) => Ok((open_linked(cfg)?, false)),
        Err(shmem_err) => Err(ShmqError::SharedMemory(shmem_err)),
    }
}

/// Opens a mapping some other process created.
pub fn attach_context(cfg: &QueueConfig) -> Result<Box<Shmem>, ShmqError> {
    open_linked(cfg)
}

/// A process's handle on one shared queue: the mapping, the queue view over
/// it, and a closing flag flipped by termination signals or [`close`].
///
/// [`close`]: MessageQueue::close
pub struct MessageQueue {
    shmem: Box<Shmem>,
    queue: RingQueue,
    closing: Arc<AtomicBool>,
}

impl MessageQueue {
    /// Creates the region (initializing it) or joins one a peer already
    /// created. The initializer must win the create race before any peer
    /// operates on the queue, which the flink create/open handshake
    /// guarantees.
    pub fn create(cfg: &QueueConfig) -> Result<MessageQueue, ShmqError> {
        let (shmem, created) = create_context(cfg)?;
        let queue = MessageQueue::with_shmem(shmem, cfg)?;
        if created {
            queue.queue.init();
        }
        Ok(queue)
    }

    /// Attaches to a region another process created and initialized.
    pub fn attach(cfg: &QueueConfig) -> Result<MessageQueue, ShmqError> {
        MessageQueue::with_shmem(attach_context(cfg)?, cfg)
    }

    fn with_shmem(shmem: Box<Shmem>, cfg: &QueueConfig) -> Result<MessageQueue, ShmqError> {
        let queue = unsafe { RingQueue::new(shmem.as_ptr(), shmem.len(), cfg.entry_count) };
        if !queue.is_valid() {
            return Err(ShmqError::Logic(format!(
                "mapping of {} bytes is too small for {} ring slots",
                shmem.len(),
                cfg.entry_count
            )));
        }

        let closing = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&closing);
        let mut signals = Signals::new([SIGHUP, SIGINT, SIGQUIT, SIGTERM]).map_err(ShmqError::Io)?;
        thread::spawn(move || {
            if signals.forever().next().is_some() {
                flag.store(true, Ordering::SeqCst);
            }
        });

        Ok(MessageQueue {
            shmem,
            queue,
            closing,
        })
    }

    /// Enqueues a copy of `data`. `Ok(false)` means the queue or allocator
    /// is out of room (the overflow counter was incremented); errors are
    /// reserved for a closed handle.
    pub fn enqueue(&self, data: &[u8]) -> Result<bool, ShmqError> {
        self.ensure_open()?;
        Ok(self.queue.enqueue(data))
    }

    /// Dequeues one message, or `Ok(None)` when the queue is empty.
    pub fn dequeue(&self) -> Result<Option<Vec<u8>>, ShmqError> {
        self.ensure_open()?;
        Ok(self.queue.dequeue())
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }

    pub fn overflow_count(&self) -> u32 {
        self.queue.overflow_count()
    }

    pub fn reset_overflow_count(&self) {
        self.queue.reset_overflow_count()
    }

    /// Marks the handle closed; subsequent operations fail. The region and
    /// the peers are unaffected.
    pub fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    /// Bytes the backing mapping actually spans (the requested size rounded
    /// up by the OS).
    pub fn region_len(&self) -> usize {
        self.shmem.len()
    }

    fn ensure_open(&self) -> Result<(), ShmqError> {
        if self.closing.load(Ordering::Relaxed) {
            return Err(ShmqError::Logic(String::from("queue handle is closed")));
        }
        Ok(())
    }
}
