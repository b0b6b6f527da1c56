use message::Message;
use stats::Counter;

use std::cmp;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// The message queue feeding a destination worker.
///
/// Producers `push` onto the wait section; the single worker `pop_head`s
/// messages off it. A popped message is not gone: it moves to the backlog
/// section, where it stays until the worker either acknowledges it
/// (`ack_backlog`, delivery reached a terminal outcome) or rewinds it
/// (`rewind_backlog`, the delivery attempt failed and the message must be
/// handed out again). Rewinds restore original order, so retries replay the
/// exact same sequence.
///
/// An optional token-bucket throttle bounds the pop rate. `pop_head` blocks
/// while the bucket is empty even if messages are waiting.
pub struct MessageQueue {
    state: Mutex<QueueState>,
    cond:  Condvar,
}

impl MessageQueue {
    pub fn new() -> MessageQueue {
        MessageQueue {
            state: Mutex::new(QueueState {
                wait:            VecDeque::new(),
                backlog:         VecDeque::new(),
                throttle:        None,
                woken:           false,
                memory_usage:    None,
                queued_messages: None,
            }),
            cond:  Condvar::new(),
        }
    }

    pub fn push(&self, msg: Message) {
        let mut state = self.state.lock().unwrap();
        let msg = Arc::new(msg);
        if let Some(ref counter) = state.queued_messages {
            counter.incr();
        }
        if let Some(ref counter) = state.memory_usage {
            counter.add(msg.approx_size() as i64);
        }
        state.wait.push_back(msg);
        self.cond.notify_all();
    }

    /// Pops the head of the queue, honoring throttle credits.
    ///
    /// Blocks until a message is poppable, the timeout elapses (`None` means
    /// no bound), or `wake` is called. The returned message has been moved
    /// to the backlog and must eventually be settled through `ack_backlog`
    /// or `rewind_backlog`.
    pub fn pop_head(&self, timeout: Option<Duration>) -> Option<Arc<Message>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock().unwrap();
        loop {
            if state.woken {
                state.woken = false;
                return None;
            }

            let mut credit_wait = None;
            if !state.wait.is_empty() {
                match state.take_credit() {
                    Credit::Available => {
                        let msg = state.wait.pop_front().unwrap();
                        state.backlog.push_back(Arc::clone(&msg));
                        if let Some(ref counter) = state.queued_messages {
                            counter.decr();
                        }
                        return Some(msg);
                    }
                    Credit::Exhausted(wait) => credit_wait = Some(wait),
                }
            }

            // Nothing poppable right now. Sleep until something can change
            // that: a push, a wake, a throttle credit, or the caller's
            // deadline.
            let mut wait_for = credit_wait;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if deadline <= now {
                    return None;
                }
                let remaining = deadline - now;
                wait_for = Some(match wait_for {
                    Some(wait) => cmp::min(wait, remaining),
                    None => remaining,
                });
            }
            state = match wait_for {
                Some(duration) => self.cond.wait_timeout(state, duration).unwrap().0,
                None => self.cond.wait(state).unwrap(),
            };
        }
    }

    /// Settles the `n` oldest backlogged messages as delivered (or
    /// deliberately discarded).
    pub fn ack_backlog(&self, n: usize) {
        let mut state = self.state.lock().unwrap();
        let n = cmp::min(n, state.backlog.len());
        let mut freed = 0;
        for msg in state.backlog.drain(..n) {
            freed += msg.approx_size();
        }
        if let Some(ref counter) = state.memory_usage {
            counter.sub(freed as i64);
        }
    }

    /// Returns the `n` oldest backlogged messages to the head of the wait
    /// section, in their original order, so they are popped again before
    /// anything newer.
    pub fn rewind_backlog(&self, n: usize) {
        let mut state = self.state.lock().unwrap();
        let n = cmp::min(n, state.backlog.len());
        let unit: Vec<Arc<Message>> = state.backlog.drain(..n).collect();
        for msg in unit.into_iter().rev() {
            state.wait.push_front(msg);
        }
        if let Some(ref counter) = state.queued_messages {
            counter.add(n as i64);
        }
        self.cond.notify_all();
    }

    /// Number of messages waiting to be popped. Excludes the backlog.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().wait.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn backlog_len(&self) -> usize {
        self.state.lock().unwrap().backlog.len()
    }

    /// Caps pops at `per_sec` messages per second. Zero removes the cap. The
    /// bucket starts full, so a burst of one second's worth goes out
    /// immediately.
    pub fn set_throttle(&self, per_sec: u32) {
        let mut state = self.state.lock().unwrap();
        state.throttle = if per_sec == 0 {
            None
        } else {
            Some(Throttle {
                per_sec:     per_sec,
                credit:      f64::from(per_sec),
                last_refill: Instant::now(),
            })
        };
        self.cond.notify_all();
    }

    /// Interrupts a single blocked `pop_head`, which returns `None`. Used by
    /// the driver to get its worker's attention on shutdown.
    pub fn wake(&self) {
        let mut state = self.state.lock().unwrap();
        state.woken = true;
        self.cond.notify_all();
    }

    /// Hands the queue the gauges it maintains. Current contents are folded
    /// in immediately so gauges stay truthful even when messages were pushed
    /// before the driver finished initializing.
    pub fn bind_counters(&self, memory_usage: Counter, queued_messages: Counter) {
        let mut state = self.state.lock().unwrap();
        queued_messages.add(state.wait.len() as i64);
        let held: usize = state
            .wait
            .iter()
            .chain(state.backlog.iter())
            .map(|m| m.approx_size())
            .sum();
        memory_usage.add(held as i64);
        state.memory_usage = Some(memory_usage);
        state.queued_messages = Some(queued_messages);
    }
}

//
// Private types
//

struct QueueState {
    wait:            VecDeque<Arc<Message>>,
    backlog:         VecDeque<Arc<Message>>,
    throttle:        Option<Throttle>,
    woken:           bool,
    memory_usage:    Option<Counter>,
    queued_messages: Option<Counter>,
}

impl QueueState {
    fn take_credit(&mut self) -> Credit {
        let throttle = match self.throttle {
            Some(ref mut t) => t,
            None => return Credit::Available,
        };

        let now = Instant::now();
        let elapsed = now - throttle.last_refill;
        let elapsed_secs =
            elapsed.as_secs() as f64 + f64::from(elapsed.subsec_nanos()) * 1e-9;
        throttle.credit = (throttle.credit + elapsed_secs * f64::from(throttle.per_sec))
            .min(f64::from(throttle.per_sec));
        throttle.last_refill = now;

        if throttle.credit >= 1.0 {
            throttle.credit -= 1.0;
            Credit::Available
        } else {
            let secs = (1.0 - throttle.credit) / f64::from(throttle.per_sec);
            Credit::Exhausted(Duration::from_millis((secs * 1000.0).ceil() as u64 + 1))
        }
    }
}

struct Throttle {
    per_sec:     u32,
    credit:      f64,
    last_refill: Instant,
}

enum Credit {
    Available,
    Exhausted(Duration),
}

#[cfg(test)]
mod tests {
    use queue::*;
    use stats::Counter;
    use test_helpers;

    use std::thread;

    fn pop(queue: &MessageQueue) -> Arc<Message> {
        queue.pop_head(Some(Duration::from_secs(5))).unwrap()
    }

    #[test]
    fn test_queue_fifo_and_ack() {
        let queue = MessageQueue::new();
        queue.push(test_helpers::sample_message(0));
        queue.push(test_helpers::sample_message(1));
        assert_eq!(2, queue.len());

        let first = pop(&queue);
        assert_eq!(Some("0"), first.value("PID"));
        assert_eq!(1, queue.len());
        assert_eq!(1, queue.backlog_len());

        queue.ack_backlog(1);
        assert_eq!(0, queue.backlog_len());

        let second = pop(&queue);
        assert_eq!(Some("1"), second.value("PID"));
    }

    #[test]
    fn test_queue_pop_timeout() {
        let queue = MessageQueue::new();
        assert!(queue.pop_head(Some(Duration::from_millis(10))).is_none());
    }

    #[test]
    fn test_queue_rewind_restores_order() {
        let queue = MessageQueue::new();
        for i in 0..3 {
            queue.push(test_helpers::sample_message(i));
        }
        let _ = pop(&queue);
        let _ = pop(&queue);
        assert_eq!(2, queue.backlog_len());

        queue.rewind_backlog(2);
        assert_eq!(0, queue.backlog_len());
        assert_eq!(3, queue.len());

        // The rewound messages come back out first and in their original
        // order.
        assert_eq!(Some("0"), pop(&queue).value("PID"));
        assert_eq!(Some("1"), pop(&queue).value("PID"));
        assert_eq!(Some("2"), pop(&queue).value("PID"));
    }

    #[test]
    fn test_queue_throttle_paces_pops() {
        let queue = MessageQueue::new();
        queue.set_throttle(2);
        for i in 0..3 {
            queue.push(test_helpers::sample_message(i));
        }

        // The bucket starts with one second's credit, so the first two pops
        // are immediate.
        let start = Instant::now();
        let _ = pop(&queue);
        let _ = pop(&queue);
        assert!(queue.pop_head(Some(Duration::from_millis(20))).is_none());

        // The third has to wait for a refill (500ms at 2/sec).
        let _ = pop(&queue);
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[test]
    fn test_queue_wake_interrupts_pop() {
        let queue = Arc::new(MessageQueue::new());
        let queue_clone = Arc::clone(&queue);
        let popper = thread::spawn(move || queue_clone.pop_head(Some(Duration::from_secs(10))));

        // Give the popper a moment to block, then wake it empty-handed.
        thread::sleep(Duration::from_millis(50));
        queue.wake();
        assert!(popper.join().unwrap().is_none());
    }

    #[test]
    fn test_queue_gauges() {
        let queue = MessageQueue::new();
        queue.push(test_helpers::sample_message(0));

        let memory = Counter::new();
        let queued = Counter::new();
        queue.bind_counters(memory.clone(), queued.clone());

        // Pre-bind contents were folded in.
        assert_eq!(1, queued.get());
        assert!(memory.get() > 0);

        queue.push(test_helpers::sample_message(1));
        assert_eq!(2, queued.get());

        let _ = pop(&queue);
        assert_eq!(1, queued.get());

        // Popped but unacked messages still occupy memory.
        let held = memory.get();
        assert!(held > 0);

        queue.ack_backlog(1);
        let _ = pop(&queue);
        queue.ack_backlog(1);
        assert_eq!(0, queued.get());
        assert_eq!(0, memory.get());
    }
}
