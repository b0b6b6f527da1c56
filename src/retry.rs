use worker::InsertVerdict;

/// What the worker should do with the current delivery unit after a callback
/// came back with `verdict`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetryAction {
    /// Acknowledge the unit; it was delivered.
    Ack,

    /// Replay the same unit against the destination.
    Retry,

    /// Give the unit up: acknowledge it off the queue and account every
    /// message in it as dropped.
    DropUnit,

    /// Tear the connection down, wait out the reopen interval, reconnect,
    /// and replay the unit. Not subject to the retry budget.
    ReconnectAndRetry,
}

/// The retry policy, as a pure function of the last verdict and the attempt
/// counters.
///
/// `retries_counter` is the number of failed attempts made on the unit so
/// far, including the one that produced `verdict`. The key asymmetry:
/// `NotConnected` always maps to `ReconnectAndRetry` no matter how many
/// times it has happened, while `Error` burns through `retries_max` and then
/// drops.
///
/// `Queued` is not a unit-terminating verdict and never reaches the policy.
pub fn retry_action(verdict: InsertVerdict, retries_counter: u32, retries_max: u32) -> RetryAction {
    match verdict {
        InsertVerdict::Success | InsertVerdict::Queued => RetryAction::Ack,
        InsertVerdict::Drop => RetryAction::DropUnit,
        InsertVerdict::Error => {
            if retries_counter >= retries_max {
                RetryAction::DropUnit
            } else {
                RetryAction::Retry
            }
        }
        InsertVerdict::NotConnected => RetryAction::ReconnectAndRetry,
    }
}
