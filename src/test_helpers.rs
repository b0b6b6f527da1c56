use message::Message;
use stats::Counter;

use slog;
use slog::{Drain, Logger, KV};
use slog_async;
use slog_term;
use std;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

pub fn log() -> Logger {
    let decorator = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let async_drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(async_drain, o!("env" => "test"))
}

pub fn log_sync() -> Logger {
    let decorator = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let drain = std::sync::Mutex::new(drain).fuse();
    slog::Logger::root(drain, o!("env" => "test"))
}

/// Builds a logger whose output is captured in memory so tests can assert on
/// emitted diagnostics.
pub fn grab_log() -> (Logger, GrabbedLog) {
    let records = Arc::new(Mutex::new(Vec::new()));
    let drain = GrabDrain {
        records: Arc::clone(&records),
    };
    let log = Logger::root(drain.fuse(), o!());
    (log, GrabbedLog { records: records })
}

/// The record store side of `grab_log`.
pub struct GrabbedLog {
    records: Arc<Mutex<Vec<String>>>,
}

impl GrabbedLog {
    pub fn contains(&self, needle: &str) -> bool {
        self.records
            .lock()
            .unwrap()
            .iter()
            .any(|line| line.contains(needle))
    }

    pub fn assert_contains(&self, needle: &str) {
        if !self.contains(needle) {
            panic!(
                "no grabbed log line contains {:?}; grabbed lines: {:#?}",
                needle,
                *self.records.lock().unwrap()
            );
        }
    }
}

/// Maximum number of 1ms spin iterations, so roughly a ten second ceiling.
pub const MAX_SPIN_ITERATIONS: usize = 10_000;

/// Waits for an asynchronously updated counter to reach an exact value,
/// panicking if it doesn't get there in time.
pub fn spin_for_counter_value(counter: &Counter, expected: i64) {
    let mut i = 0;
    while counter.get() != expected && i < MAX_SPIN_ITERATIONS {
        thread::sleep(Duration::from_millis(1));
        i += 1;
    }
    assert_eq!(
        expected,
        counter.get(),
        "counter did not reach the expected value"
    );
}

/// Waits for an arbitrary condition to come true.
pub fn spin_until<F>(desc: &str, condition: F)
where
    F: Fn() -> bool,
{
    let mut i = 0;
    while !condition() && i < MAX_SPIN_ITERATIONS {
        thread::sleep(Duration::from_millis(1));
        i += 1;
    }
    assert!(condition(), "condition never came true: {}", desc);
}

/// A message in the shape the wider pipeline would enqueue, with a `PID`
/// value distinguishing it from its neighbors.
pub fn sample_message(i: usize) -> Message {
    let mut msg = Message::new();
    msg.set_value("HOST", "localhost");
    msg.set_value("PROGRAM", "logsink-test");
    msg.set_value("MESSAGE", "árvíztűrő tükörfúrógép");
    msg.set_value("PID", &i.to_string());
    msg
}

//
// Private types
//

struct GrabDrain {
    records: Arc<Mutex<Vec<String>>>,
}

impl Drain for GrabDrain {
    type Ok = ();
    type Err = slog::Never;

    fn log(
        &self,
        record: &slog::Record,
        values: &slog::OwnedKVList,
    ) -> std::result::Result<(), slog::Never> {
        let mut line = format!("{}", record.msg());

        let mut serializer = LineSerializer { line: &mut line };
        let _ = record.kv().serialize(record, &mut serializer);
        let _ = values.serialize(record, &mut serializer);

        self.records.lock().unwrap().push(line);
        Ok(())
    }
}

struct LineSerializer<'a> {
    line: &'a mut String,
}

impl<'a> slog::Serializer for LineSerializer<'a> {
    fn emit_arguments(&mut self, key: slog::Key, val: &fmt::Arguments) -> slog::Result {
        self.line.push_str(&format!(" {}={}", key, val));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_helpers::*;

    #[test]
    fn test_grab_log() {
        let (log, grabbed) = grab_log();
        info!(log, "A grabbed message"; "answer" => 42);
        assert!(grabbed.contains("A grabbed message"));
        assert!(grabbed.contains("answer=42"));
        assert!(!grabbed.contains("never logged"));
    }

    #[test]
    fn test_spin_for_counter_value() {
        let counter = Counter::new();
        counter.add(3);
        spin_for_counter_value(&counter, 3);
    }

    #[test]
    fn test_sample_message() {
        let msg = sample_message(7);
        assert_eq!(Some("7"), msg.value("PID"));
        assert!(msg.approx_size() > 0);
    }
}
