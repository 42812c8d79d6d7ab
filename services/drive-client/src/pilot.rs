//! The client's single control loop. Every timer, link event, relay message
//! and operator input is handled here, one at a time, so queue and session
//! state never see concurrent mutation. Link writes run as spawned tasks and
//! report back as events, keeping at most one of them outstanding.

use std::future::pending;

use rover_protocol::Command;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::auto_mode::{AutoAction, AutoEvent, AutoModeClient};
use crate::config::ServerApi;
use crate::connection::ConnectionManager;
use crate::console::OperatorInput;
use crate::controls::{
    ActiveCommandSet, Throttle, ThrottleDecision, VehicleState, HOLD_TIMEOUT,
    STALE_CHECK_INTERVAL, THROTTLE_LIMIT,
};
use crate::link::{LinkError, LinkEvent};
use crate::prefs::{Preferences, PrefsStore};
use crate::queue::{self, CommandQueue, QueueError, RESEND_INTERVAL};
use crate::session::LinkStatus;

#[derive(Debug)]
pub enum PilotEvent {
    Input(OperatorInput),
    WriteDone {
        epoch: u64,
        command: Command,
        result: Result<(), LinkError>,
    },
    HoldExpired {
        command: Command,
        generation: u64,
    },
}

pub struct Pilot {
    conn: ConnectionManager,
    link_events: Option<mpsc::UnboundedReceiver<LinkEvent>>,
    /// Bumped whenever the link goes away; completions from older links are stale.
    link_epoch: u64,
    queue: CommandQueue,
    active: ActiveCommandSet,
    hold_generation: u64,
    throttle: Throttle,
    vehicle: VehicleState,
    auto: AutoModeClient,
    relay_url: String,
    api: Option<ServerApi>,
    prefs: Preferences,
    prefs_store: Option<PrefsStore>,
    speed: Command,
    events: mpsc::UnboundedSender<PilotEvent>,
    dispatch_at: Option<Instant>,
    reconnect_at: Option<Instant>,
    throttle_at: Option<Instant>,
}

impl Pilot {
    pub fn new(
        conn: ConnectionManager,
        prefs: Preferences,
        prefs_store: Option<PrefsStore>,
        relay_url: String,
        api: Option<ServerApi>,
        events: mpsc::UnboundedSender<PilotEvent>,
    ) -> Self {
        let speed = prefs.speed_command();
        Self {
            conn,
            link_events: None,
            link_epoch: 0,
            queue: CommandQueue::default(),
            active: ActiveCommandSet::default(),
            hold_generation: 0,
            throttle: Throttle::new(THROTTLE_LIMIT),
            vehicle: VehicleState::default(),
            auto: AutoModeClient::default(),
            relay_url,
            api,
            prefs,
            prefs_store,
            speed,
            events,
            dispatch_at: None,
            reconnect_at: None,
            throttle_at: None,
        }
    }

    pub async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<PilotEvent>) {
        let start = Instant::now();
        // Ticks regardless of link state; resends only happen while connected.
        let mut heartbeat = interval_at(start + RESEND_INTERVAL, RESEND_INTERVAL);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stale_check = interval_at(start + STALE_CHECK_INTERVAL, STALE_CHECK_INTERVAL);
        info!(speed = %self.speed, "ready, connect the device to begin");

        loop {
            let dispatch_at = self.dispatch_at;
            let reconnect_at = self.reconnect_at;
            let throttle_at = self.throttle_at;

            tokio::select! {
                event = inbox.recv() => match event {
                    Some(PilotEvent::Input(OperatorInput::Quit)) | None => break,
                    Some(event) => self.handle(event).await,
                },
                event = next_link_event(&mut self.link_events) => self.on_link_event(event),
                event = self.auto.next_event() => self.on_auto_event(event),
                _ = heartbeat.tick() => self.resend_if_idle(),
                _ = stale_check.tick() => self.check_stale(),
                _ = sleep_until_opt(dispatch_at) => {
                    self.dispatch_at = None;
                    self.pump();
                }
                _ = sleep_until_opt(reconnect_at) => {
                    self.reconnect_at = None;
                    self.reconnect().await;
                }
                _ = sleep_until_opt(throttle_at) => {
                    self.throttle_at = None;
                    if let Some(cmd) = self.throttle.fire(Instant::now()) {
                        self.send_logged(cmd);
                    }
                }
            }
        }

        info!("shutting down");
        self.auto.deactivate();
        self.active.clear();
        self.conn.disconnect().await;
    }

    async fn handle(&mut self, event: PilotEvent) {
        match event {
            PilotEvent::Input(input) => self.on_input(input).await,
            PilotEvent::WriteDone {
                epoch,
                command,
                result,
            } => self.on_write_done(epoch, command, result),
            PilotEvent::HoldExpired {
                command,
                generation,
            } => {
                if self.active.is_current(command, generation) {
                    warn!(command = %command, "command not released in time, releasing");
                    self.release(command);
                }
            }
        }
    }

    async fn on_input(&mut self, input: OperatorInput) {
        match input {
            OperatorInput::Press(cmd) => self.press(cmd),
            OperatorInput::Release(cmd) => self.release(cmd),
            OperatorInput::Send(raw) => match queue::validate(&raw) {
                Ok(cmd) => self.send_logged(cmd),
                Err(e) => error!(error = %e, "command rejected"),
            },
            OperatorInput::Speed(cmd) => self.set_speed(cmd),
            OperatorInput::Connect => self.connect().await,
            OperatorInput::Disconnect => self.disconnect().await,
            OperatorInput::Auto(on) => self.set_auto(on),
            OperatorInput::Validate => self.validate_profiles(),
            OperatorInput::Quit => {}
        }
    }

    /// Queue `cmd` for the device. Only valid while connected.
    fn send_command(&mut self, cmd: Command) -> Result<(), QueueError> {
        if !self.conn.session().is_connected() {
            return Err(QueueError::NotConnected);
        }
        self.vehicle.record(cmd, Instant::now());
        if cmd == Command::Stop {
            self.throttle.cancel();
            self.throttle_at = None;
            self.queue.push_stop();
        } else {
            self.queue.enqueue(cmd, false);
        }
        self.pump();
        Ok(())
    }

    fn send_logged(&mut self, cmd: Command) {
        if let Err(e) = self.send_command(cmd) {
            error!(command = %cmd, error = %e, "command not sent");
        }
    }

    /// Start the pending write if the link is free.
    fn pump(&mut self) {
        let Some((device, characteristic)) = self.conn.session().writable() else {
            return;
        };
        let Some(command) = self.queue.next_write() else {
            return;
        };
        let epoch = self.link_epoch;
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = device
                .write(&characteristic, &[command.as_byte()], characteristic.write_mode())
                .await;
            let _ = events.send(PilotEvent::WriteDone {
                epoch,
                command,
                result,
            });
        });
    }

    fn on_write_done(&mut self, epoch: u64, command: Command, result: Result<(), LinkError>) {
        if epoch != self.link_epoch {
            debug!(command = %command, "ignoring write from a previous link");
            return;
        }
        let ok = match result {
            Ok(()) => {
                debug!(command = %command, "sent");
                true
            }
            Err(e) => {
                error!(command = %command, error = %e, "write failed");
                false
            }
        };
        self.queue.complete(ok, Instant::now());
        if let Some(delay) = self.queue.reschedule_delay() {
            self.dispatch_at = Some(Instant::now() + delay);
        }
    }

    /// Resend the last command when nothing went out for a full interval.
    fn resend_if_idle(&mut self) {
        if !self.conn.session().is_connected() {
            return;
        }
        if let Some(cmd) = self.queue.resend_due(Instant::now()) {
            debug!(command = %cmd, "resending last command");
            self.queue.enqueue(cmd, true);
            self.pump();
        }
    }

    fn check_stale(&self) {
        if self.vehicle.is_stale(Instant::now()) {
            warn!(
                direction = %self.vehicle.direction,
                "vehicle moving without a command update for a long time"
            );
        }
    }

    fn press(&mut self, cmd: Command) {
        if !self.conn.session().is_connected() {
            debug!(command = %cmd, "press ignored while disconnected");
            return;
        }
        self.hold_generation += 1;
        let generation = self.hold_generation;
        let events = self.events.clone();
        let watchdog = tokio::spawn(async move {
            sleep(HOLD_TIMEOUT).await;
            let _ = events.send(PilotEvent::HoldExpired {
                command: cmd,
                generation,
            });
        });
        self.active.press(cmd, generation, watchdog.abort_handle());

        match self.throttle.call(cmd, Instant::now()) {
            ThrottleDecision::Run => self.send_logged(cmd),
            ThrottleDecision::Deferred(at) => self.throttle_at = Some(at),
        }
    }

    fn release(&mut self, cmd: Command) {
        if !self.conn.session().is_connected() {
            return;
        }
        self.active.release(cmd);
        if self.active.is_empty() {
            self.send_logged(Command::Stop);
        }
    }

    fn set_speed(&mut self, cmd: Command) {
        self.speed = cmd;
        self.send_logged(cmd);
        self.prefs.speed = cmd.to_string();
        self.save_prefs();
    }

    async fn connect(&mut self) {
        let status = self.conn.session().status();
        if status != LinkStatus::Disconnected {
            info!(%status, "connect ignored");
            return;
        }
        self.reconnect_at = None;
        self.try_connect().await;
    }

    async fn try_connect(&mut self) -> bool {
        info!("opening device selection");
        match self.conn.initiate().await {
            Ok(events) => {
                self.link_events = Some(events);
                self.on_connected();
                true
            }
            Err(e) => {
                error!(error = %e, "connection failed");
                false
            }
        }
    }

    fn on_connected(&mut self) {
        self.queue.reset();
        info!(speed = %self.speed, "connected, applying speed");
        self.send_logged(self.speed);
        if let Some(device) = self.conn.session().device() {
            self.prefs.last_device_id = Some(device.id());
            self.prefs.last_device_name = device.name();
        }
        self.save_prefs();
    }

    async fn reconnect(&mut self) {
        if self.conn.session().status() != LinkStatus::Disconnected {
            return;
        }
        if !self.try_connect().await {
            // A failed attempt continues the bounded chain.
            self.schedule_reconnect();
        }
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Disconnected => {
                warn!("device disconnected");
                self.link_events = None;
                self.drop_link_state();
                self.schedule_reconnect();
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        if let Some(delay) = self.conn.handle_unexpected_disconnect() {
            self.reconnect_at = Some(Instant::now() + delay);
        }
    }

    async fn disconnect(&mut self) {
        self.reconnect_at = None;
        if !self.conn.disconnect().await {
            return;
        }
        self.link_events = None;
        self.drop_link_state();
    }

    fn drop_link_state(&mut self) {
        self.link_epoch += 1;
        self.active.clear();
        self.throttle.cancel();
        self.throttle_at = None;
        self.queue.reset();
        self.dispatch_at = None;
    }

    fn set_auto(&mut self, on: bool) {
        if on {
            self.active.clear();
            self.send_logged(Command::Stop);
            self.auto.activate(self.relay_url.clone());
        } else if self.auto.is_active() {
            info!("auto mode off");
            self.auto.deactivate();
            self.send_logged(Command::Stop);
        }
    }

    fn on_auto_event(&mut self, event: AutoEvent) {
        match self.auto.handle(event) {
            AutoAction::Forward(cmd) => self.send_logged(cmd),
            AutoAction::Ignore => {}
            AutoAction::Closed => self.send_logged(Command::Stop),
        }
    }

    fn validate_profiles(&self) {
        let Some(api) = self.api.clone() else {
            warn!("no server configured, cannot validate profiles");
            return;
        };
        let loaded = self.conn.profiles().len();
        tokio::spawn(async move {
            match api.validate().await {
                Ok(v) if v.ok => info!(loaded, "server BLE profiles are valid"),
                Ok(v) => {
                    error!(loaded, "server BLE profiles have problems");
                    for reason in &v.reasons {
                        error!("- {reason}");
                    }
                }
                Err(e) => error!(error = %e, "could not validate server BLE profiles"),
            }
        });
    }

    fn save_prefs(&self) {
        if let Some(store) = &self.prefs_store {
            store.save(&self.prefs);
        }
    }
}

async fn next_link_event(rx: &mut Option<mpsc::UnboundedReceiver<LinkEvent>>) -> LinkEvent {
    if let Some(events) = rx {
        if let Some(event) = events.recv().await {
            return event;
        }
        *rx = None;
    }
    pending().await
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => pending().await,
    }
}
