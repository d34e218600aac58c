use crate::events::{AssignmentEvent, BanditEvent};

/// Receives events produced by evaluations, typically to forward them to a data warehouse.
///
/// Implementations are called synchronously on the evaluating thread and should not block.
///
/// Any closure `Fn(AssignmentEvent)` is an `AssignmentLogger` that ignores bandit events.
pub trait AssignmentLogger {
    /// Called for every assignment of a flag whose allocation requests logging.
    fn log_assignment(&self, event: AssignmentEvent);

    /// Called for every bandit action selection.
    fn log_bandit_action(&self, event: BanditEvent) {
        let _ = event;
    }
}

pub(crate) struct NoopAssignmentLogger;

impl AssignmentLogger for NoopAssignmentLogger {
    fn log_assignment(&self, _event: AssignmentEvent) {}
}

impl<T: Fn(AssignmentEvent)> AssignmentLogger for T {
    fn log_assignment(&self, event: AssignmentEvent) {
        self(event);
    }
}
