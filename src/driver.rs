use errors::*;
use queue::MessageQueue;
use stats::DestCounters;
use worker::{Destination, Worker, WorkerShared};

use slog::Logger;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// The threaded destination driver base.
///
/// Owns the pieces every destination shares: the message queue, the
/// published counters, and the single worker thread that drains the queue
/// into the destination's callbacks. A concrete destination (the SQL driver,
/// a test stand-in, anything implementing `Destination`) composes one of
/// these rather than inheriting from it, and hands its callbacks over at
/// `init` time.
///
/// The public fields are configuration and may be adjusted freely before
/// `init`; after that the worker owns them.
pub struct ThreadedDestDriver {
    /// Delay between losing a connection (or failing to establish one) and
    /// the next attempt. Zero disables the delay.
    pub time_reopen: Duration,

    /// How many consecutive error verdicts a delivery unit survives before
    /// it is dropped.
    pub retries_max: u32,

    queue:          Arc<MessageQueue>,
    shared:         Arc<WorkerShared>,
    counters:       Option<DestCounters>,
    counters_bound: bool,
    persist_name:   Option<String>,
    stats_instance: Option<String>,
    worker:         Option<thread::JoinHandle<()>>,
}

impl ThreadedDestDriver {
    pub fn new() -> ThreadedDestDriver {
        ThreadedDestDriver {
            time_reopen:    Duration::from_secs(DEFAULT_TIME_REOPEN_SECS),
            retries_max:    DEFAULT_RETRIES_MAX,
            queue:          Arc::new(MessageQueue::new()),
            shared:         Arc::new(WorkerShared::new()),
            counters:       None,
            counters_bound: false,
            persist_name:   None,
            stats_instance: None,
            worker:         None,
        }
    }

    /// The queue feeding this driver. Upstream producers push into it; the
    /// worker is its only consumer.
    pub fn queue(&self) -> Arc<MessageQueue> {
        Arc::clone(&self.queue)
    }

    /// Derives the driver's identity from the destination, registers
    /// counters, and spawns the worker thread.
    pub fn init(&mut self, log: &Logger, dest: Box<Destination>) -> Result<()> {
        if self.worker.is_some() {
            return Err("Destination driver is already initialized".into());
        }

        let persist_name = dest.persist_name();
        let stats_instance = dest.stats_instance();
        let counters = DestCounters::register(&stats_instance);

        if !self.counters_bound {
            self.queue.bind_counters(
                counters.memory_usage.clone(),
                counters.queued_messages.clone(),
            );
            self.counters_bound = true;
        }

        let thread_name = format!("dest({})", stats_instance);
        let worker_log = log.new(o!("thread" => thread_name.clone()));
        info!(worker_log, "Initializing destination driver";
            "persist_name" => persist_name.as_str());

        self.shared.clear_stop();
        let mut worker = Worker {
            log:         worker_log,
            dest:        dest,
            queue:       Arc::clone(&self.queue),
            counters:    counters.clone(),
            shared:      Arc::clone(&self.shared),
            time_reopen: self.time_reopen,
            retries_max: self.retries_max,
            connected:   false,
        };
        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || worker.run())
            .chain_err(|| "Error spawning destination worker thread")?;

        self.worker = Some(handle);
        self.counters = Some(counters);
        self.persist_name = Some(persist_name);
        self.stats_instance = Some(stats_instance);
        Ok(())
    }

    /// Stops and joins the worker. The worker settles or rewinds any
    /// in-flight delivery unit on its way out, so the queue is left in a
    /// state a future run can pick up from.
    pub fn deinit(&mut self, log: &Logger) {
        if let Some(handle) = self.worker.take() {
            info!(log, "Deinitializing destination driver");
            self.shared.request_stop();
            self.queue.wake();
            let _ = handle.join();
        }
    }

    pub fn counters(&self) -> Option<&DestCounters> {
        self.counters.as_ref()
    }

    pub fn persist_name(&self) -> Option<&str> {
        self.persist_name.as_ref().map(|s| s.as_str())
    }

    pub fn stats_instance(&self) -> Option<&str> {
        self.stats_instance.as_ref().map(|s| s.as_str())
    }

    pub fn seq_num(&self) -> u64 {
        self.shared.seq_num()
    }

    pub fn batch_size(&self) -> usize {
        self.shared.batch_size()
    }

    pub fn retries_counter(&self) -> u32 {
        self.shared.retries_counter()
    }
}

//
// Private constants
//

const DEFAULT_TIME_REOPEN_SECS: u64 = 60;

const DEFAULT_RETRIES_MAX: u32 = 3;
