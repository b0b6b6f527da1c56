use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

/// A named atomic counter handle.
///
/// Handles are cheap to clone and all clones point at the same underlying
/// value, so a counter registered by a driver can be read concurrently by
/// operational tooling and by tests.
#[derive(Clone, Debug)]
pub struct Counter {
    value: Arc<AtomicI64>,
}

impl Counter {
    pub fn new() -> Counter {
        Counter {
            value: Arc::new(AtomicI64::new(0)),
        }
    }

    #[inline]
    pub fn incr(&self) {
        self.add(1);
    }

    #[inline]
    pub fn decr(&self) {
        self.sub(1);
    }

    #[inline]
    pub fn add(&self, n: i64) {
        let _ = self.value.fetch_add(n, Ordering::SeqCst);
    }

    #[inline]
    pub fn sub(&self, n: i64) {
        let _ = self.value.fetch_sub(n, Ordering::SeqCst);
    }

    #[inline]
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }
}

/// The set of counters every destination driver publishes. All are registered
/// under the driver's stats instance name.
///
/// `processed_messages`, `written_messages` and `dropped_messages` only ever
/// grow. `memory_usage` and `queued_messages` are gauges tracking the bytes
/// and the number of messages currently held by the driver's queue.
#[derive(Clone, Debug)]
pub struct DestCounters {
    pub processed_messages: Counter,
    pub written_messages:   Counter,
    pub dropped_messages:   Counter,
    pub memory_usage:       Counter,
    pub queued_messages:    Counter,
}

impl DestCounters {
    pub fn register(instance: &str) -> DestCounters {
        DestCounters {
            processed_messages: counter(instance, "processed_messages"),
            written_messages:   counter(instance, "written_messages"),
            dropped_messages:   counter(instance, "dropped_messages"),
            memory_usage:       counter(instance, "memory_usage"),
            queued_messages:    counter(instance, "queued_messages"),
        }
    }
}

/// Fetches the counter registered under `<instance>.<name>`, creating it on
/// first use. Re-registration under the same name always yields a handle to
/// the same value, which is what keeps counters stable across driver
/// init/deinit cycles.
pub fn counter(instance: &str, name: &str) -> Counter {
    let key = format!("{}.{}", instance, name);
    let mut registry = REGISTRY.lock().unwrap();
    registry.entry(key).or_insert_with(Counter::new).clone()
}

//
// Private statics
//

lazy_static! {
    static ref REGISTRY: Mutex<HashMap<String, Counter>> = Mutex::new(HashMap::new());
}

#[cfg(test)]
mod tests {
    use stats::*;

    #[test]
    fn test_counter_ops() {
        let counter = Counter::new();
        assert_eq!(0, counter.get());

        counter.incr();
        counter.incr();
        assert_eq!(2, counter.get());

        counter.decr();
        assert_eq!(1, counter.get());

        counter.add(10);
        counter.sub(4);
        assert_eq!(7, counter.get());
    }

    #[test]
    fn test_counter_handles_share_value() {
        let counter = Counter::new();
        let clone = counter.clone();
        clone.add(3);
        assert_eq!(3, counter.get());
    }

    #[test]
    fn test_registry_is_stable() {
        let a = counter("stats.test_registry", "processed_messages");
        a.incr();

        // A second registration must come back with the same underlying
        // value.
        let b = counter("stats.test_registry", "processed_messages");
        assert_eq!(1, b.get());

        let other = counter("stats.test_registry", "written_messages");
        assert_eq!(0, other.get());
    }

    #[test]
    fn test_register_dest_counters() {
        let counters = DestCounters::register("stats.test_register_dest");
        counters.processed_messages.incr();
        assert_eq!(
            1,
            counter("stats.test_register_dest", "processed_messages").get()
        );
        assert_eq!(0, counters.dropped_messages.get());
    }
}
