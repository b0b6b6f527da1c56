use message::Message;
use queue::MessageQueue;
use retry::{retry_action, RetryAction};
use stats::DestCounters;

use slog::Logger;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// A destination's reply to a delivery callback.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InsertVerdict {
    /// The message (or, from `flush`, the whole pending batch) is durably
    /// accepted by the destination.
    Success,

    /// The message is buffered inside the destination but not yet durable.
    /// The worker keeps it unacknowledged until a later `flush` settles the
    /// batch. Only meaningful from `insert`.
    Queued,

    /// The message is invalid for this destination. Discard it immediately;
    /// retrying would not help.
    Drop,

    /// Transient failure at the destination. Worth retrying, but only within
    /// the retry budget.
    Error,

    /// The transport to the destination is gone. Reconnect and retry without
    /// bound.
    NotConnected,
}

/// The callbacks a destination supplies to its worker, plus the identity
/// strings the driver derives names from.
///
/// All delivery callbacks are invoked from the driver's single worker
/// thread, so implementations may keep plain mutable state. `connect` may be
/// called many times over a destination's life; `disconnect` must be
/// idempotent. `insert` is never called between a `disconnect` and the next
/// successful `connect`.
pub trait Destination: Send {
    /// Stable key under which the queue's durable state is persisted across
    /// restarts. Must be deterministic for a given configuration.
    fn persist_name(&self) -> String;

    /// Counter label visible to operators. Must be deterministic for a given
    /// configuration.
    fn stats_instance(&self) -> String;

    fn connect(&mut self, _log: &Logger) -> bool {
        true
    }

    fn disconnect(&mut self, _log: &Logger) {}

    fn insert(&mut self, log: &Logger, ctx: &WorkerContext, msg: &Message) -> InsertVerdict;

    /// Settles the pending batch. Required in practice whenever `insert`
    /// ever answers `Queued`; the default suits destinations that never
    /// batch.
    fn flush(&mut self, _log: &Logger, _ctx: &WorkerContext) -> InsertVerdict {
        InsertVerdict::Success
    }
}

/// Read-only view of the worker's delivery state, passed into callbacks.
pub struct WorkerContext<'a> {
    shared: &'a WorkerShared,
}

impl<'a> WorkerContext<'a> {
    pub(crate) fn new(shared: &'a WorkerShared) -> WorkerContext<'a> {
        WorkerContext { shared: shared }
    }

    /// The delivery attempt ordinal. Starts at 1 and steps once per `insert`
    /// invocation, including replays of the same message, so templates can
    /// produce a distinct value per attempt.
    pub fn seq_num(&self) -> u64 {
        self.shared.seq_num()
    }

    /// Number of messages queued inside the destination since the last
    /// settled unit. Reads 0 inside the first `insert` of a fresh batch.
    pub fn batch_size(&self) -> usize {
        self.shared.batch_size()
    }

    /// Failed attempts made on the current delivery unit so far.
    pub fn retries_counter(&self) -> u32 {
        self.shared.retries_counter()
    }
}

//
// Private constants
//

/// How long the worker waits for another message before deciding the queue
/// has gone idle and flushing a pending batch.
const IDLE_FLUSH_TIMEOUT_MS: u64 = 100;

//
// Crate-internal types
//

/// Worker state shared with the owning driver: the stop flag and the
/// observable delivery counters. Everything here is atomic because the
/// driver (and tests) read it from outside the worker thread.
pub(crate) struct WorkerShared {
    stop:            AtomicBool,
    seq_num:         AtomicU64,
    batch_size:      AtomicUsize,
    retries_counter: AtomicU32,
    sleep_lock:      Mutex<()>,
    sleep_cond:      Condvar,
}

impl WorkerShared {
    pub(crate) fn new() -> WorkerShared {
        WorkerShared {
            stop:            AtomicBool::new(false),
            seq_num:         AtomicU64::new(1),
            batch_size:      AtomicUsize::new(0),
            retries_counter: AtomicU32::new(0),
            sleep_lock:      Mutex::new(()),
            sleep_cond:      Condvar::new(),
        }
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.sleep_cond.notify_all();
    }

    pub(crate) fn clear_stop(&self) {
        self.stop.store(false, Ordering::SeqCst);
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub(crate) fn seq_num(&self) -> u64 {
        self.seq_num.load(Ordering::SeqCst)
    }

    pub(crate) fn step_seq(&self) {
        let _ = self.seq_num.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn batch_size(&self) -> usize {
        self.batch_size.load(Ordering::SeqCst)
    }

    pub(crate) fn incr_batch(&self) {
        let _ = self.batch_size.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn reset_batch(&self) {
        self.batch_size.store(0, Ordering::SeqCst);
    }

    pub(crate) fn retries_counter(&self) -> u32 {
        self.retries_counter.load(Ordering::SeqCst)
    }

    pub(crate) fn incr_retries(&self) {
        let _ = self.retries_counter.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn reset_retries(&self) {
        self.retries_counter.store(0, Ordering::SeqCst);
    }

    /// Sleeps for `duration` unless (or until) a stop is requested. A zero
    /// duration returns immediately.
    fn sleep_interruptible(&self, duration: Duration) {
        if duration == Duration::from_secs(0) {
            return;
        }
        let deadline = Instant::now() + duration;
        let mut guard = self.sleep_lock.lock().unwrap();
        loop {
            if self.stop_requested() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            let (new_guard, _) = self.sleep_cond.wait_timeout(guard, deadline - now).unwrap();
            guard = new_guard;
        }
    }
}

/// The per-destination delivery loop. One instance runs on one thread,
/// spawned by the driver's `init` and joined by `deinit`.
pub(crate) struct Worker {
    pub log:         Logger,
    pub dest:        Box<Destination>,
    pub queue:       Arc<MessageQueue>,
    pub counters:    DestCounters,
    pub shared:      Arc<WorkerShared>,
    pub time_reopen: Duration,
    pub retries_max: u32,
    pub connected:   bool,
}

impl Worker {
    pub(crate) fn run(&mut self) {
        debug!(self.log, "Destination worker starting");

        while !self.shared.stop_requested() {
            if !self.connected && !self.try_connect() {
                continue;
            }

            // With a batch pending we only wait briefly: going idle is the
            // signal to flush what the destination has buffered. With no
            // batch there is nothing to do until a message (or a wake-up)
            // arrives.
            let timeout = if self.shared.batch_size() > 0 {
                Some(Duration::from_millis(IDLE_FLUSH_TIMEOUT_MS))
            } else {
                None
            };

            match self.queue.pop_head(timeout) {
                Some(msg) => self.handle_message(&msg),
                None => {
                    if self.shared.batch_size() > 0 && !self.shared.stop_requested() {
                        self.flush_pending();
                    }
                }
            }
        }

        self.finish();
        debug!(self.log, "Destination worker stopping");
    }

    //
    // Steps
    //

    fn try_connect(&mut self) -> bool {
        if self.dest.connect(&self.log) {
            self.connected = true;
            return true;
        }
        self.shared.sleep_interruptible(self.time_reopen);
        false
    }

    fn handle_message(&mut self, msg: &Message) {
        self.counters.processed_messages.incr();

        let verdict = {
            let ctx = WorkerContext::new(&self.shared);
            self.dest.insert(&self.log, &ctx, msg)
        };
        self.shared.step_seq();

        if verdict == InsertVerdict::Queued {
            self.shared.incr_batch();
            return;
        }

        // A non-queued insert verdict settles the pending batch plus the
        // message just handed over.
        let unit_len = self.shared.batch_size() + 1;
        self.settle_unit(verdict, unit_len);
    }

    fn flush_pending(&mut self) {
        let pending = self.shared.batch_size();
        if pending == 0 {
            return;
        }

        let verdict = {
            let ctx = WorkerContext::new(&self.shared);
            self.dest.flush(&self.log, &ctx)
        };
        let verdict = if verdict == InsertVerdict::Queued {
            warn!(self.log, "Destination answered flush with a queued verdict, treating as error");
            InsertVerdict::Error
        } else {
            verdict
        };
        self.settle_unit(verdict, pending);
    }

    fn settle_unit(&mut self, verdict: InsertVerdict, unit_len: usize) {
        if verdict == InsertVerdict::Error {
            self.shared.incr_retries();
        }

        match retry_action(verdict, self.shared.retries_counter(), self.retries_max) {
            RetryAction::Ack => self.accept_unit(unit_len),
            RetryAction::DropUnit => {
                if verdict == InsertVerdict::Error {
                    error!(self.log,
                        "Multiple failures while sending message(s) to destination, message(s) dropped";
                        "retries_max" => self.retries_max);
                }
                self.drop_unit(unit_len);
            }
            RetryAction::Retry => {
                error!(self.log,
                    "Error occurred while trying to send message(s) to destination, trying again";
                    "retries" => self.shared.retries_counter(),
                    "retries_max" => self.retries_max);
                self.rewind_unit(unit_len);
            }
            RetryAction::ReconnectAndRetry => {
                error!(self.log,
                    "Server disconnected while sending message(s), trying again";
                    "time_reopen" => self.time_reopen.as_secs());
                self.rewind_unit(unit_len);
                self.disconnect();
                self.shared.sleep_interruptible(self.time_reopen);
            }
        }
    }

    fn accept_unit(&mut self, unit_len: usize) {
        self.queue.ack_backlog(unit_len);
        self.counters.written_messages.add(unit_len as i64);
        self.shared.reset_batch();
        self.shared.reset_retries();
    }

    /// Returns a unit to the queue for another attempt. The messages revert
    /// to being queue-owned, so their `processed_messages` increments are
    /// taken back; the counter nets out to terminal outcomes and
    /// `processed == written + dropped` holds whenever the worker is
    /// quiescent.
    fn rewind_unit(&mut self, unit_len: usize) {
        self.queue.rewind_backlog(unit_len);
        self.counters.processed_messages.sub(unit_len as i64);
        self.shared.reset_batch();
    }

    fn drop_unit(&mut self, unit_len: usize) {
        warn!(self.log, "Message(s) dropped while sending to destination";
            "num_dropped" => unit_len);
        self.counters.dropped_messages.add(unit_len as i64);
        self.queue.ack_backlog(unit_len);
        self.shared.reset_batch();
        self.shared.reset_retries();
    }

    fn disconnect(&mut self) {
        self.dest.disconnect(&self.log);
        self.connected = false;
    }

    /// Shutdown path: give a pending batch one last chance to settle, then
    /// tear the connection down. A batch that won't settle is rewound so the
    /// queue's backlog can hand it to a future run.
    fn finish(&mut self) {
        let pending = self.shared.batch_size();
        if pending > 0 {
            let verdict = if self.connected {
                let ctx = WorkerContext::new(&self.shared);
                self.dest.flush(&self.log, &ctx)
            } else {
                InsertVerdict::NotConnected
            };

            if verdict == InsertVerdict::Success {
                self.accept_unit(pending);
            } else {
                info!(self.log, "Rewinding undelivered batch at shutdown";
                    "num_messages" => pending);
                self.rewind_unit(pending);
            }
        }

        if self.connected {
            self.disconnect();
        }
    }
}
