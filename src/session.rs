use tokio::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncMode {
    Slow,
    Fast,
}

/// Per-document sync state, owned by the scheduler and reset when the
/// active document changes. The cursor itself lives in the document store.
#[derive(Clone, Debug)]
pub struct SyncSession {
    pub document_id: String,
    pub mode: SyncMode,
    pub fast_until: Option<Instant>,
    pub in_flight_save: bool,
    pub in_flight_poll: bool,
    pub suspended: bool,
}

impl SyncSession {
    pub fn new(document_id: impl Into<String>) -> Self {
        SyncSession {
            document_id: document_id.into(),
            mode: SyncMode::Slow,
            fast_until: None,
            in_flight_save: false,
            in_flight_poll: false,
            suspended: false,
        }
    }

    /// Back to the state of a freshly opened document. A suspension
    /// survives: only reopening the document lifts it.
    pub fn reset(&mut self) {
        let suspended = self.suspended;
        *self = SyncSession::new(std::mem::take(&mut self.document_id));
        self.suspended = suspended;
    }

    /// Switches to fast mode until `now + window`. Returns true if the mode
    /// changed.
    pub fn enter_fast_mode(&mut self, now: Instant, window: Duration) -> bool {
        self.fast_until = Some(now + window);
        let changed = self.mode != SyncMode::Fast;
        self.mode = SyncMode::Fast;
        changed
    }

    /// Falls back to slow mode once the fast window is over. Returns true
    /// if the mode changed.
    pub fn decay(&mut self, now: Instant) -> bool {
        match self.fast_until {
            Some(until) if until <= now => {
                self.fast_until = None;
                self.mode = SyncMode::Slow;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_mode_decays_after_the_window() {
        let now = Instant::now();
        let mut session = SyncSession::new("doc");
        assert!(session.enter_fast_mode(now, Duration::from_secs(10)));
        assert!(!session.enter_fast_mode(now + Duration::from_secs(5), Duration::from_secs(10)));
        assert!(!session.decay(now + Duration::from_secs(10)));
        assert_eq!(session.mode, SyncMode::Fast);
        assert!(session.decay(now + Duration::from_secs(15)));
        assert_eq!(session.mode, SyncMode::Slow);
    }

    #[test]
    fn reset_keeps_the_document_and_suspension() {
        let mut session = SyncSession::new("doc");
        session.in_flight_save = true;
        session.in_flight_poll = true;
        session.enter_fast_mode(Instant::now(), Duration::from_secs(1));
        session.reset();
        assert_eq!(session.document_id, "doc");
        assert!(!session.in_flight_save && !session.in_flight_poll);
        assert!(!session.suspended);
        assert_eq!(session.mode, SyncMode::Slow);

        session.suspended = true;
        session.reset();
        assert!(session.suspended);
    }
}
