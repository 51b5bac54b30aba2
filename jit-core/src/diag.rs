//! Diagnostic Sink
//!
//! Routes pass progress, consistency-checker failures, and pass give-ups to
//! the `log` crate, the way the teacher's `validator.rs` and `pipeline.rs`
//! report stage progress and validation warnings with `log::info!`/
//! `log::warn!`/`log::debug!`. No textual dump formatter is provided here;
//! that remains out of scope.

use crate::error::CompilerError;

/// Sink for compiler-pass diagnostics.
///
/// A trait rather than a concrete logger so tests can install a
/// recording sink instead of asserting on captured log output.
pub trait DiagSink {
    /// A pass is about to run.
    fn pass_start(&self, pass: &str) {
        let _ = pass;
    }

    /// A pass ran to completion without a fatal error.
    fn pass_complete(&self, pass: &str) {
        let _ = pass;
    }

    /// A pass declined to produce a result for a well-formed reason.
    fn give_up(&self, pass: &str, reason: &str);

    /// The consistency checker (or an internal assertion) found a fatal
    /// invariant violation. Called just before the error propagates up.
    fn invariant_violation(&self, err: &CompilerError);
}

/// Default sink: everything goes through the `log` crate at the level the
/// teacher uses for the analogous event (`log::info!` for stage boundaries,
/// `log::debug!` for routine give-ups, `log::warn!`/`log::error!` for
/// anything that indicates a defect).
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl DiagSink for LogSink {
    fn pass_start(&self, pass: &str) {
        log::info!("pass {pass}: starting");
    }

    fn pass_complete(&self, pass: &str) {
        log::info!("pass {pass}: complete");
    }

    fn give_up(&self, pass: &str, reason: &str) {
        log::debug!("pass {pass}: gave up: {reason}");
    }

    fn invariant_violation(&self, err: &CompilerError) {
        log::error!("{err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct RecordingSink {
        events: RefCell<Vec<String>>,
    }

    impl DiagSink for RecordingSink {
        fn pass_start(&self, pass: &str) {
            self.events.borrow_mut().push(format!("start:{pass}"));
        }

        fn pass_complete(&self, pass: &str) {
            self.events.borrow_mut().push(format!("complete:{pass}"));
        }

        fn give_up(&self, pass: &str, reason: &str) {
            self.events.borrow_mut().push(format!("give_up:{pass}:{reason}"));
        }

        fn invariant_violation(&self, err: &CompilerError) {
            self.events.borrow_mut().push(format!("invariant:{err}"));
        }
    }

    #[test]
    fn recording_sink_captures_events_in_order() {
        let sink = RecordingSink::default();
        sink.pass_start("checker");
        sink.give_up("cloner", "size limit exceeded");
        sink.pass_complete("checker");

        let events = sink.events.borrow();
        assert_eq!(
            *events,
            vec![
                "start:checker".to_string(),
                "give_up:cloner:size limit exceeded".to_string(),
                "complete:checker".to_string(),
            ]
        );
    }

    #[test]
    fn log_sink_default_give_up_does_not_panic() {
        let sink = LogSink;
        sink.give_up("escape", "no candidates");
    }
}
