//! Latest-wins command queue in front of the device link.
//!
//! At most one command is pending and at most one write is in flight. The
//! queue itself does no I/O: the caller takes the next write with
//! [`CommandQueue::next_write`], performs it, and reports back through
//! [`CommandQueue::complete`].

use std::time::Duration;

use rover_protocol::{Command, CommandParseError};
use tokio::time::Instant;

/// Pause between consecutive writes when more work is pending.
pub const QUEUE_INTERVAL: Duration = Duration::from_millis(10);
/// Resend period for the last command while connected.
pub const RESEND_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("rejected command {raw:?}: {source}")]
    Rejected {
        raw: String,
        #[source]
        source: CommandParseError,
    },
    #[error("no writable characteristic selected, connect first")]
    NotConnected,
}

/// Validate an operator- or relay-supplied code before anything is queued.
pub fn validate(raw: &str) -> Result<Command, QueueError> {
    raw.parse().map_err(|source| QueueError::Rejected {
        raw: raw.to_string(),
        source,
    })
}

#[derive(Debug, Default)]
pub struct CommandQueue {
    pending: Option<Command>,
    immediate: bool,
    in_flight: Option<Command>,
    last_sent: Option<(Command, Instant)>,
}

impl CommandQueue {
    /// Coalescing enqueue. Re-enqueueing the pending command is a no-op
    /// unless `force` is set; anything else replaces it.
    pub fn enqueue(&mut self, cmd: Command, force: bool) {
        if self.pending == Some(cmd) && !force {
            return;
        }
        if self.pending != Some(cmd) {
            self.immediate = false;
        }
        self.pending = Some(cmd);
    }

    /// Replace whatever is pending with `Stop`, to be written without delay.
    pub fn push_stop(&mut self) {
        self.pending = Some(Command::Stop);
        self.immediate = true;
    }

    pub fn pending(&self) -> Option<Command> {
        self.pending
    }

    pub fn len(&self) -> usize {
        usize::from(self.pending.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_none()
    }

    pub fn in_flight(&self) -> Option<Command> {
        self.in_flight
    }

    pub fn last_sent(&self) -> Option<(Command, Instant)> {
        self.last_sent
    }

    /// Take the pending command for writing, unless a write is already out.
    pub fn next_write(&mut self) -> Option<Command> {
        if self.in_flight.is_some() {
            return None;
        }
        let cmd = self.pending.take()?;
        self.in_flight = Some(cmd);
        Some(cmd)
    }

    /// Record the outcome of the in-flight write. A failed command goes back
    /// as the sole pending entry.
    pub fn complete(&mut self, ok: bool, now: Instant) {
        let Some(cmd) = self.in_flight.take() else {
            return;
        };
        if ok {
            self.last_sent = Some((cmd, now));
        } else {
            self.immediate = cmd == Command::Stop;
            self.pending = Some(cmd);
        }
    }

    /// Delay before the next dispatch attempt, if anything is pending.
    pub fn reschedule_delay(&self) -> Option<Duration> {
        if self.pending.is_none() || self.in_flight.is_some() {
            return None;
        }
        Some(if self.immediate {
            Duration::ZERO
        } else {
            QUEUE_INTERVAL
        })
    }

    /// The command to resend if nothing was written for a full interval.
    pub fn resend_due(&self, now: Instant) -> Option<Command> {
        let (cmd, at) = self.last_sent?;
        (now.saturating_duration_since(at) >= RESEND_INTERVAL).then_some(cmd)
    }

    /// Drop pending work and history, e.g. when the link goes away.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_enqueues_coalesce() {
        let mut q = CommandQueue::default();
        for _ in 0..5 {
            q.enqueue(Command::Forward, false);
            assert_eq!(q.len(), 1);
        }
        assert_eq!(q.pending(), Some(Command::Forward));
    }

    #[test]
    fn test_latest_wins() {
        let mut q = CommandQueue::default();
        q.enqueue(Command::Forward, false);
        q.enqueue(Command::Left, false);
        assert_eq!(q.len(), 1);
        assert_eq!(q.pending(), Some(Command::Left));
    }

    #[test]
    fn test_stop_overrides_and_is_immediate() {
        let mut q = CommandQueue::default();
        q.enqueue(Command::Forward, false);
        q.push_stop();
        assert_eq!(q.pending(), Some(Command::Stop));
        assert_eq!(q.reschedule_delay(), Some(Duration::ZERO));

        q.enqueue(Command::Right, false);
        assert_eq!(q.reschedule_delay(), Some(QUEUE_INTERVAL));
    }

    #[test]
    fn test_single_write_in_flight() {
        let mut q = CommandQueue::default();
        q.enqueue(Command::Forward, false);
        assert_eq!(q.next_write(), Some(Command::Forward));
        q.enqueue(Command::Left, false);
        assert_eq!(q.next_write(), None);
        assert_eq!(q.reschedule_delay(), None);

        q.complete(true, Instant::now());
        assert_eq!(q.reschedule_delay(), Some(QUEUE_INTERVAL));
        assert_eq!(q.next_write(), Some(Command::Left));
    }

    #[test]
    fn test_failed_write_requeued_once() {
        let mut q = CommandQueue::default();
        q.enqueue(Command::Forward, false);
        q.next_write();
        q.enqueue(Command::Left, false);
        q.complete(false, Instant::now());
        assert_eq!(q.len(), 1);
        assert_eq!(q.pending(), Some(Command::Forward));
        assert!(q.last_sent().is_none());
    }

    #[test]
    fn test_validation_rejects_unknown() {
        for raw in ["Z", "", "f", "FF"] {
            assert!(matches!(validate(raw), Err(QueueError::Rejected { .. })));
        }
        assert_eq!(validate(" S ").unwrap(), Command::Stop);
    }

    #[test]
    fn test_rejected_command_leaves_pending_entry() {
        let mut q = CommandQueue::default();
        q.enqueue(Command::Forward, false);
        if let Ok(cmd) = validate("Z") {
            q.enqueue(cmd, false);
        }
        assert_eq!(q.pending(), Some(Command::Forward));
        assert_eq!(q.len(), 1);
        assert_eq!(q.in_flight(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resend_due_after_interval() {
        let mut q = CommandQueue::default();
        assert_eq!(q.resend_due(Instant::now()), None);

        q.enqueue(Command::SpeedMed, false);
        q.next_write();
        q.complete(true, Instant::now());
        assert_eq!(q.resend_due(Instant::now()), None);

        tokio::time::advance(RESEND_INTERVAL).await;
        assert_eq!(q.resend_due(Instant::now()), Some(Command::SpeedMed));
    }

    #[test]
    fn test_forced_enqueue_of_pending() {
        let mut q = CommandQueue::default();
        q.enqueue(Command::Forward, false);
        q.enqueue(Command::Forward, true);
        assert_eq!(q.len(), 1);
    }
}
