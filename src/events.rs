//! Public event interface: session lifecycle events and the progress
//! counter the scanner reports while a device transforms.
//!
//! Realized as a callback registry (an `Arc<dyn EventSink>` shared between
//! the scanner and every in-flight protocol worker) rather than nested
//! emitters, since Rust has no single ambient event-loop object to hang
//! handlers off the way the original's event-emitter pattern does.

use crate::identity::Family;
use serde::Serialize;
use std::sync::Arc;

/// Immutable snapshot of a session, suitable for handing to an event sink
/// or serializing out to a caller.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub port_id: String,
    pub family: Family,
    pub step: u32,
    pub last_step: u32,
}

impl SessionInfo {
    /// `round(step / last_step * 100)`, clamped into `[0, 100]`.
    pub fn progress(&self) -> u32 {
        if self.last_step == 0 {
            return 100;
        }
        let raw = (self.step as f64 / self.last_step as f64) * 100.0;
        raw.round().clamp(0.0, 100.0) as u32
    }
}

/// A single mutable session: tracked by the scanner, keyed by port id.
pub struct Session {
    info: SessionInfo,
    sink: Arc<dyn EventSink>,
}

impl Session {
    pub fn new(port_id: String, family: Family, sink: Arc<dyn EventSink>) -> Self {
        let last_step = family.last_step();
        Self {
            info: SessionInfo {
                port_id,
                family,
                step: 0,
                last_step,
            },
            sink,
        }
    }

    pub fn port_id(&self) -> &str {
        &self.info.port_id
    }

    pub fn family(&self) -> Family {
        self.info.family
    }

    pub fn step(&self) -> u32 {
        self.info.step
    }

    pub fn last_step(&self) -> u32 {
        self.info.last_step
    }

    pub fn is_terminal(&self) -> bool {
        self.info.step >= self.info.last_step
    }

    pub fn snapshot(&self) -> SessionInfo {
        self.info.clone()
    }

    /// Advances `step`, emitting `progress`. Non-increasing writes are a
    /// no-op: step assignments are monotone by construction, so this guard
    /// only matters for the detach-handler race described in the protocol
    /// design notes.
    pub fn set_step(&mut self, step: u32) {
        if step <= self.info.step {
            return;
        }
        self.info.step = step.min(self.info.last_step);
        self.sink.on_progress(&self.info);
    }
}

/// Receives lifecycle and progress events from the scanner.
pub trait EventSink: Send + Sync {
    fn on_attach(&self, _session: &SessionInfo) {}
    fn on_detach(&self, _session: &SessionInfo) {}
    fn on_progress(&self, _session: &SessionInfo) {}
    fn on_error(&self, _error: &str) {}
    fn on_ready(&self) {}
}

/// An `EventSink` built from plain closures, for callers who don't want to
/// implement the trait directly.
pub struct CallbackSink<A, D, P, E, R> {
    pub attach: A,
    pub detach: D,
    pub progress: P,
    pub error: E,
    pub ready: R,
}

impl<A, D, P, E, R> EventSink for CallbackSink<A, D, P, E, R>
where
    A: Fn(&SessionInfo) + Send + Sync,
    D: Fn(&SessionInfo) + Send + Sync,
    P: Fn(&SessionInfo) + Send + Sync,
    E: Fn(&str) + Send + Sync,
    R: Fn() + Send + Sync,
{
    fn on_attach(&self, session: &SessionInfo) {
        (self.attach)(session)
    }

    fn on_detach(&self, session: &SessionInfo) {
        (self.detach)(session)
    }

    fn on_progress(&self, session: &SessionInfo) {
        (self.progress)(session)
    }

    fn on_error(&self, error: &str) {
        (self.error)(error)
    }

    fn on_ready(&self) {
        (self.ready)()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingSink {
        events: Mutex<Vec<String>>,
    }

    impl EventSink for RecordingSink {
        fn on_progress(&self, session: &SessionInfo) {
            self.events
                .lock()
                .unwrap()
                .push(format!("progress:{}", session.step));
        }
    }

    #[test]
    fn progress_rounds_as_specified() {
        let info = SessionInfo {
            port_id: "1-1".into(),
            family: Family::Cm3Like,
            step: 1,
            last_step: 40,
        };
        // 1/40 * 100 = 2.5 -> rounds to 3 (round-half-away-from-zero)
        assert_eq!(info.progress(), 3);
    }

    #[test]
    fn progress_at_terminal_step_is_100() {
        let info = SessionInfo {
            port_id: "1-1".into(),
            family: Family::Cm4,
            step: 10,
            last_step: 10,
        };
        assert_eq!(info.progress(), 100);
    }

    #[test]
    fn set_step_is_monotone_and_emits_progress() {
        let sink = Arc::new(RecordingSink {
            events: Mutex::new(Vec::new()),
        });
        let mut session = Session::new("1-1".into(), Family::Cm3Like, sink.clone());

        session.set_step(2);
        session.set_step(1); // non-increasing: ignored
        session.set_step(5);

        assert_eq!(session.step(), 5);
        assert_eq!(
            *sink.events.lock().unwrap(),
            vec!["progress:2".to_string(), "progress:5".to_string()]
        );
    }
}
