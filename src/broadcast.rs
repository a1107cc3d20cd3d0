//! Broadcast lifecycle manager.
//!
//! Owns the identity of the remote broadcast and the local encoder feeding
//! it. A background health monitor restarts a dead encoder against the same
//! ingest address without touching the remote broadcast, so an encoder crash
//! is invisible to anyone watching the broadcast identifier.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, bounded, select};
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::config::BroadcastSettings;
use crate::encoder::{Encoder, EncoderProcess};
use crate::error::BroadcastError;
use crate::platform::{BroadcastPlatform, BroadcastTicket, IngestionStatus, Privacy};

/// Lifecycle phase of the broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastPhase {
    NotStarted,
    Starting,
    WaitingForIngestion,
    Live,
    /// Live, but the encoder has exited and is awaiting repair.
    Degraded,
    Stopping,
    Stopped,
}

impl BroadcastPhase {
    pub fn name(self) -> &'static str {
        match self {
            BroadcastPhase::NotStarted => "not started",
            BroadcastPhase::Starting => "starting",
            BroadcastPhase::WaitingForIngestion => "waiting for ingestion",
            BroadcastPhase::Live => "live",
            BroadcastPhase::Degraded => "degraded",
            BroadcastPhase::Stopping => "stopping",
            BroadcastPhase::Stopped => "stopped",
        }
    }
}

impl fmt::Display for BroadcastPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Point-in-time view of the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastStatus {
    pub phase: BroadcastPhase,
    pub broadcast_id: Option<String>,
    pub ingest_address: Option<String>,
    /// Process id of the current encoder, if one is running.
    pub encoder_id: Option<u32>,
    pub consecutive_failures: u32,
    pub waiting_for_ingestion: bool,
    /// Number of encoder restarts performed for this broadcast.
    pub repairs: u32,
}

/// Result of one health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthReport {
    /// No broadcast is active.
    Idle,
    Healthy,
    /// The encoder is down but the failure budget is not spent yet.
    Unhealthy { consecutive_failures: u32 },
    /// The encoder was restarted.
    Repaired { encoder_id: u32 },
    /// A restart was attempted and failed; it is retried on the next check.
    RepairFailed { consecutive_failures: u32 },
}

/// One broadcast: remote identity plus local encoder.
struct BroadcastSession {
    ticket: BroadcastTicket,
    encoder: Option<Box<dyn EncoderProcess>>,
    consecutive_failures: u32,
    waiting_for_ingestion: bool,
    repairs: u32,
    /// A health check is talking to the platform or the encoder.
    check_in_flight: bool,
}

impl BroadcastSession {
    fn new(ticket: BroadcastTicket) -> Self {
        Self {
            ticket,
            encoder: None,
            consecutive_failures: 0,
            waiting_for_ingestion: true,
            repairs: 0,
            check_in_flight: false,
        }
    }

    fn current_report(&self) -> HealthReport {
        if self.consecutive_failures == 0 {
            HealthReport::Healthy
        } else {
            HealthReport::Unhealthy {
                consecutive_failures: self.consecutive_failures,
            }
        }
    }
}

struct ManagerState {
    phase: BroadcastPhase,
    session: Option<BroadcastSession>,
}

impl ManagerState {
    /// The session for broadcast `id`, if it is still the current one.
    fn session_for(&mut self, id: &str) -> Option<&mut BroadcastSession> {
        self.session.as_mut().filter(|session| session.ticket.id == id)
    }
}

/// Work a health check has to do once the state lock is released.
enum HealthStep {
    Done(HealthReport),
    PollIngestion(BroadcastTicket),
    Repair {
        ticket: BroadcastTicket,
        dead: Option<Box<dyn EncoderProcess>>,
    },
}

struct Inner {
    platform: Arc<dyn BroadcastPlatform>,
    encoder: Arc<dyn Encoder>,
    settings: BroadcastSettings,
    state: Mutex<ManagerState>,
}

struct HealthMonitor {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

impl HealthMonitor {
    fn spawn(inner: Arc<Inner>) -> Self {
        let (shutdown, shutdown_rx) = bounded::<()>(1);
        let handle = thread::spawn(move || health_loop(inner, shutdown_rx));
        Self { shutdown, handle }
    }

    /// Stop the monitor and wait for it to exit.
    fn cancel(self) {
        let _ = self.shutdown.try_send(());
        drop(self.shutdown);
        if self.handle.join().is_err() {
            error!("Health monitor thread panicked");
        }
    }

    /// Stop the monitor without waiting for a check that is in flight.
    /// Whatever that check finds is discarded once the broadcast is gone.
    fn detach(self) {
        let _ = self.shutdown.try_send(());
    }
}

fn health_loop(inner: Arc<Inner>, shutdown: Receiver<()>) {
    let ticker = crossbeam_channel::tick(inner.settings.health_interval);
    debug!(
        "Health monitor started (interval {:?})",
        inner.settings.health_interval
    );

    loop {
        let due = select! {
            recv(shutdown) -> _ => false,
            recv(ticker) -> _ => true,
        };
        if !due {
            break;
        }
        inner.check_health(false);
    }

    debug!("Health monitor stopped");
}

impl Inner {
    /// Run one health check. With `force`, a dead encoder is restarted
    /// immediately instead of waiting for the failure budget.
    ///
    /// Platform calls and encoder restarts run without the state lock, so
    /// status queries and start/stop never wait on them.
    fn check_health(&self, force: bool) -> HealthReport {
        match self.assess(force) {
            HealthStep::Done(report) => report,
            HealthStep::PollIngestion(ticket) => {
                self.poll_ingestion(&ticket);
                HealthReport::Healthy
            }
            HealthStep::Repair { ticket, dead } => self.repair(&ticket, dead),
        }
    }

    fn assess(&self, force: bool) -> HealthStep {
        let mut state = self.state.lock();
        let ManagerState { phase, session } = &mut *state;
        let Some(session) = session.as_mut() else {
            return HealthStep::Done(HealthReport::Idle);
        };
        if matches!(*phase, BroadcastPhase::Starting | BroadcastPhase::Stopping) {
            // Startup failed half-way or a stop is in progress; nothing to heal.
            return HealthStep::Done(HealthReport::Idle);
        }
        if session.check_in_flight {
            debug!(
                "Health check for broadcast {} already in flight",
                session.ticket.id
            );
            return HealthStep::Done(session.current_report());
        }

        let alive = session
            .encoder
            .as_mut()
            .is_some_and(|encoder| encoder.is_alive());

        if alive {
            if session.consecutive_failures > 0 {
                info!(
                    "Encoder healthy again after {} failed checks",
                    session.consecutive_failures
                );
            }
            session.consecutive_failures = 0;
            if *phase == BroadcastPhase::Degraded {
                *phase = BroadcastPhase::Live;
            }
            if *phase == BroadcastPhase::WaitingForIngestion {
                session.check_in_flight = true;
                return HealthStep::PollIngestion(session.ticket.clone());
            }
            return HealthStep::Done(HealthReport::Healthy);
        }

        session.consecutive_failures += 1;
        if *phase == BroadcastPhase::Live {
            warn!("Encoder for broadcast {} has exited", session.ticket.id);
            *phase = BroadcastPhase::Degraded;
        }

        if !force && session.consecutive_failures < self.settings.failure_threshold {
            warn!(
                "Encoder health check failed ({}/{})",
                session.consecutive_failures, self.settings.failure_threshold
            );
            return HealthStep::Done(session.current_report());
        }

        info!(
            "Restarting encoder for broadcast {} after {} failed checks",
            session.ticket.id, session.consecutive_failures
        );
        session.check_in_flight = true;
        HealthStep::Repair {
            ticket: session.ticket.clone(),
            dead: session.encoder.take(),
        }
    }

    /// Restart the encoder against the existing ingest address. The remote
    /// broadcast is left untouched.
    fn repair(
        &self,
        ticket: &BroadcastTicket,
        dead: Option<Box<dyn EncoderProcess>>,
    ) -> HealthReport {
        if let Some(dead) = dead {
            if let Err(e) = dead.stop(self.settings.stop_timeout) {
                warn!("Failed to clean up dead encoder: {}", e);
            }
        }

        let started = self
            .encoder
            .start(&ticket.ingest_address, &self.settings.source_url);

        let mut orphan = None;
        let report = {
            let mut state = self.state.lock();
            let current = state.session_for(&ticket.id).is_some();
            match started {
                Ok(process) if current => {
                    let encoder_id = process.id();
                    if let Some(session) = state.session_for(&ticket.id) {
                        session.encoder = Some(process);
                        session.consecutive_failures = 0;
                        session.repairs += 1;
                        session.check_in_flight = false;
                    }
                    if state.phase == BroadcastPhase::Degraded {
                        state.phase = BroadcastPhase::Live;
                    }
                    info!(
                        "Encoder restarted (pid {}) for broadcast {}",
                        encoder_id, ticket.id
                    );
                    HealthReport::Repaired { encoder_id }
                }
                Ok(process) => {
                    orphan = Some(process);
                    HealthReport::Idle
                }
                Err(e) => match state.session_for(&ticket.id) {
                    Some(session) => {
                        session.check_in_flight = false;
                        error!(
                            "Encoder restart failed for broadcast {}, retrying next check: {}",
                            ticket.id, e
                        );
                        HealthReport::RepairFailed {
                            consecutive_failures: session.consecutive_failures,
                        }
                    }
                    None => {
                        debug!("Broadcast {} ended during repair: {}", ticket.id, e);
                        HealthReport::Idle
                    }
                },
            }
        };

        if let Some(process) = orphan {
            info!(
                "Broadcast {} ended during repair, stopping the new encoder",
                ticket.id
            );
            if let Err(e) = process.stop(self.settings.stop_timeout) {
                warn!("Failed to stop encoder: {}", e);
            }
        }
        report
    }

    fn is_current(&self, id: &str) -> bool {
        self.state.lock().session_for(id).is_some()
    }

    fn poll_ingestion(&self, ticket: &BroadcastTicket) {
        let ready = match self.platform.ingestion_status(ticket) {
            Ok(IngestionStatus::Active) => true,
            Ok(IngestionStatus::Inactive) => {
                debug!("Broadcast {} still waiting for ingestion", ticket.id);
                false
            }
            Ok(IngestionStatus::Error) => {
                warn!(
                    "Platform reports an ingestion error for broadcast {}",
                    ticket.id
                );
                false
            }
            Err(e) => {
                warn!("Failed to query ingestion status: {}", e);
                false
            }
        };

        // The broadcast may have been stopped while the platform answered.
        let current = ready && self.is_current(&ticket.id);
        let live = current
            && match self.platform.transition_to_live(&ticket.id) {
                Ok(()) => true,
                Err(e) => {
                    warn!(
                        "Failed to transition broadcast {} to live: {}",
                        ticket.id, e
                    );
                    false
                }
            };

        let mut state = self.state.lock();
        let Some(session) = state.session_for(&ticket.id) else {
            debug!("Broadcast {} ended during ingestion check", ticket.id);
            return;
        };
        session.check_in_flight = false;
        if live {
            session.waiting_for_ingestion = false;
            if state.phase == BroadcastPhase::WaitingForIngestion {
                state.phase = BroadcastPhase::Live;
            }
            info!("Broadcast {} is live", ticket.id);
        }
    }
}

/// Owns the broadcast identity and encoder process.
pub struct BroadcastManager {
    inner: Arc<Inner>,
    monitor: Mutex<Option<HealthMonitor>>,
}

impl BroadcastManager {
    pub fn new(
        platform: Arc<dyn BroadcastPlatform>,
        encoder: Arc<dyn Encoder>,
        settings: BroadcastSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                platform,
                encoder,
                settings,
                state: Mutex::new(ManagerState {
                    phase: BroadcastPhase::NotStarted,
                    session: None,
                }),
            }),
            monitor: Mutex::new(None),
        }
    }

    /// Create a remote broadcast, start the encoder against it and begin
    /// health monitoring. Returns the broadcast identifier.
    ///
    /// # Errors
    ///
    /// * [`BroadcastError::AlreadyActive`] if a broadcast is running
    /// * [`BroadcastError::InProgress`] if another start or stop is underway
    /// * [`BroadcastError::Platform`] if the remote broadcast could not be
    ///   created; the manager stays in `NotStarted`
    /// * [`BroadcastError::Encoder`] if the encoder could not be launched;
    ///   the remote broadcast stays allocated until [`Self::stop_broadcast`]
    pub fn start_broadcast(&self) -> Result<String, BroadcastError> {
        let inner = &self.inner;
        let previous_phase = {
            let mut state = inner.state.lock();
            if let Some(session) = &state.session {
                return Err(BroadcastError::AlreadyActive {
                    id: session.ticket.id.clone(),
                });
            }
            if matches!(
                state.phase,
                BroadcastPhase::Starting | BroadcastPhase::Stopping
            ) {
                return Err(BroadcastError::InProgress {
                    phase: state.phase.name(),
                });
            }
            let previous = state.phase;
            state.phase = BroadcastPhase::Starting;
            previous
        };
        info!("Creating broadcast '{}'", inner.settings.title);

        let ticket = match inner
            .platform
            .create_broadcast(&inner.settings.title, inner.settings.privacy)
        {
            Ok(ticket) => ticket,
            Err(e) => {
                error!("Failed to create broadcast: {}", e);
                inner.state.lock().phase = if previous_phase == BroadcastPhase::Stopped {
                    BroadcastPhase::Stopped
                } else {
                    BroadcastPhase::NotStarted
                };
                return Err(e.into());
            }
        };

        let id = ticket.id.clone();
        let started = inner
            .encoder
            .start(&ticket.ingest_address, &inner.settings.source_url);
        let mut session = BroadcastSession::new(ticket);

        {
            let mut state = inner.state.lock();
            match started {
                Ok(process) => {
                    info!("Broadcast {} created, encoder pid {}", id, process.id());
                    session.encoder = Some(process);
                    state.session = Some(session);
                    state.phase = BroadcastPhase::WaitingForIngestion;
                }
                Err(e) => {
                    error!(
                        "Encoder failed to start for broadcast {}; stop the broadcast to release it: {}",
                        id, e
                    );
                    state.session = Some(session);
                    return Err(e.into());
                }
            }
        }

        let mut monitor = self.monitor.lock();
        if let Some(old) = monitor.take() {
            old.detach();
        }
        *monitor = Some(HealthMonitor::spawn(Arc::clone(&self.inner)));

        Ok(id)
    }

    /// Stop the encoder, end the remote broadcast and clear its identity.
    ///
    /// The identity is cleared even if the platform call fails; the error is
    /// still returned so the caller can report it.
    ///
    /// # Errors
    ///
    /// * [`BroadcastError::NotActive`] if no broadcast is running
    /// * [`BroadcastError::Platform`] if ending the remote broadcast failed
    pub fn stop_broadcast(&self) -> Result<(), BroadcastError> {
        let inner = &self.inner;
        let mut session = {
            let mut state = inner.state.lock();
            let Some(session) = state.session.take() else {
                return Err(BroadcastError::NotActive);
            };
            state.phase = BroadcastPhase::Stopping;
            session
        };
        info!("Stopping broadcast {}", session.ticket.id);

        if let Some(monitor) = self.monitor.lock().take() {
            monitor.detach();
        }

        if let Some(process) = session.encoder.take() {
            if let Err(e) = process.stop(inner.settings.stop_timeout) {
                warn!("Failed to stop encoder cleanly: {}", e);
            }
        }

        let ended = inner.platform.end_broadcast(&session.ticket.id);
        inner.state.lock().phase = BroadcastPhase::Stopped;

        match ended {
            Ok(()) => {
                info!("Broadcast {} ended", session.ticket.id);
                Ok(())
            }
            Err(e) => {
                error!("Failed to end broadcast {}: {}", session.ticket.id, e);
                Err(e.into())
            }
        }
    }

    /// Run one health check now, restarting a dead encoder immediately.
    pub fn ensure_healthy(&self) -> HealthReport {
        self.inner.check_health(true)
    }

    /// Run one regular health check, as the background monitor does.
    pub fn run_health_check(&self) -> HealthReport {
        self.inner.check_health(false)
    }

    pub fn is_active(&self) -> bool {
        self.inner.state.lock().session.is_some()
    }

    pub fn broadcast_id(&self) -> Option<String> {
        self.inner
            .state
            .lock()
            .session
            .as_ref()
            .map(|session| session.ticket.id.clone())
    }

    pub fn status(&self) -> BroadcastStatus {
        let state = self.inner.state.lock();
        let session = state.session.as_ref();
        BroadcastStatus {
            phase: state.phase,
            broadcast_id: session.map(|s| s.ticket.id.clone()),
            ingest_address: session.map(|s| s.ticket.ingest_address.clone()),
            encoder_id: session.and_then(|s| s.encoder.as_ref().map(|e| e.id())),
            consecutive_failures: session.map_or(0, |s| s.consecutive_failures),
            waiting_for_ingestion: session.is_some_and(|s| s.waiting_for_ingestion),
            repairs: session.map_or(0, |s| s.repairs),
        }
    }

    /// Privacy of the active broadcast as the platform reports it.
    pub fn privacy(&self) -> Result<Privacy, BroadcastError> {
        let id = self.broadcast_id().ok_or(BroadcastError::NotActive)?;
        Ok(self.inner.platform.get_privacy(&id)?)
    }

    pub fn set_privacy(&self, privacy: Privacy) -> Result<(), BroadcastError> {
        let id = self.broadcast_id().ok_or(BroadcastError::NotActive)?;
        self.inner.platform.set_privacy(&id, privacy)?;
        info!("Broadcast {} privacy set to {}", id, privacy);
        Ok(())
    }
}

impl Drop for BroadcastManager {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.cancel();
        }
        // The remote broadcast is left alone; only the local encoder dies
        // with the process.
        let process = self
            .inner
            .state
            .lock()
            .session
            .as_mut()
            .and_then(|s| s.encoder.take());
        if let Some(process) = process {
            if let Err(e) = process.stop(self.inner.settings.stop_timeout) {
                warn!("Failed to stop encoder on shutdown: {}", e);
            }
        }
    }
}
