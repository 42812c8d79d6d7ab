//! Press/release bookkeeping for movement commands.

use std::collections::HashMap;
use std::time::Duration;

use rover_protocol::Command;
use tokio::task::AbortHandle;
use tokio::time::Instant;

/// A held command is released automatically after this long.
pub const HOLD_TIMEOUT: Duration = Duration::from_millis(5000);
/// Minimum spacing of throttled movement dispatches.
pub const THROTTLE_LIMIT: Duration = Duration::from_millis(100);
pub const STALE_CHECK_INTERVAL: Duration = Duration::from_secs(5);
/// Moving this long without a new command is worth a warning.
pub const STALE_AFTER: Duration = Duration::from_secs(10);

struct Watchdog {
    generation: u64,
    handle: AbortHandle,
}

/// Movement commands currently held, each with its own watchdog.
#[derive(Default)]
pub struct ActiveCommandSet {
    held: HashMap<Command, Watchdog>,
}

impl ActiveCommandSet {
    /// Hold `cmd`. A watchdog already armed for it is replaced.
    pub fn press(&mut self, cmd: Command, generation: u64, handle: AbortHandle) {
        if let Some(old) = self.held.insert(cmd, Watchdog { generation, handle }) {
            old.handle.abort();
        }
    }

    /// Let go of `cmd`, cancelling its watchdog. Returns whether it was held.
    pub fn release(&mut self, cmd: Command) -> bool {
        match self.held.remove(&cmd) {
            Some(w) => {
                w.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Whether a fired watchdog still belongs to the current hold of `cmd`.
    pub fn is_current(&self, cmd: Command, generation: u64) -> bool {
        self.held
            .get(&cmd)
            .is_some_and(|w| w.generation == generation)
    }

    pub fn contains(&self, cmd: Command) -> bool {
        self.held.contains_key(&cmd)
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn clear(&mut self) {
        for (_, w) in self.held.drain() {
            w.handle.abort();
        }
    }
}

impl Drop for ActiveCommandSet {
    fn drop(&mut self) {
        self.clear();
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ThrottleDecision {
    Run,
    /// Held back; `fire` at the given instant to run the latest call.
    Deferred(Instant),
}

/// Leading-edge throttle with a trailing call: the first call runs, calls
/// inside the window collapse into one run at the window's end.
#[derive(Debug)]
pub struct Throttle {
    limit: Duration,
    last_ran: Option<Instant>,
    trailing: Option<Command>,
}

impl Throttle {
    pub fn new(limit: Duration) -> Self {
        Self {
            limit,
            last_ran: None,
            trailing: None,
        }
    }

    pub fn call(&mut self, cmd: Command, now: Instant) -> ThrottleDecision {
        match self.last_ran {
            Some(at) if now.saturating_duration_since(at) < self.limit => {
                self.trailing = Some(cmd);
                ThrottleDecision::Deferred(at + self.limit)
            }
            _ => {
                self.trailing = None;
                self.last_ran = Some(now);
                ThrottleDecision::Run
            }
        }
    }

    /// The deferred call, if one is still waiting.
    pub fn fire(&mut self, now: Instant) -> Option<Command> {
        let cmd = self.trailing.take()?;
        self.last_ran = Some(now);
        Some(cmd)
    }

    /// Forget a waiting trailing call.
    pub fn cancel(&mut self) {
        self.trailing = None;
    }
}

/// What the client believes the vehicle is doing, from the commands it
/// issued. Never confirmed by the device.
#[derive(Debug, Clone)]
pub struct VehicleState {
    pub speed: Command,
    pub direction: Command,
    pub last_command_at: Option<Instant>,
    pub is_moving: bool,
}

impl Default for VehicleState {
    fn default() -> Self {
        Self {
            speed: Command::SpeedMed,
            direction: Command::Stop,
            last_command_at: None,
            is_moving: false,
        }
    }
}

impl VehicleState {
    pub fn record(&mut self, cmd: Command, now: Instant) {
        if cmd.is_speed() {
            self.speed = cmd;
        } else if cmd == Command::Stop {
            self.is_moving = false;
        } else {
            self.direction = cmd;
            self.is_moving = true;
        }
        self.last_command_at = Some(now);
    }

    /// Moving with no command issued for longer than [`STALE_AFTER`].
    pub fn is_stale(&self, now: Instant) -> bool {
        match self.last_command_at {
            Some(at) if self.is_moving => now.saturating_duration_since(at) > STALE_AFTER,
            _ => false,
        }
    }
}
