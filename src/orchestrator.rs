//! Print-driven orchestration.
//!
//! The [`Orchestrator`] consumes poll events and is the only place that
//! decides a job has truly ended. Short telemetry outages and brief idle
//! readings are held for a grace period so one physical print never turns
//! into several timelapses or broadcasts. Last-layer finalization belongs to
//! the timelapse manager; the orchestrator only remembers that it happened so
//! the job end does not ask for it a second time.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};

use crate::broadcast::BroadcastManager;
use crate::config::OrchestratorPolicy;
use crate::error::{BroadcastError, SessionError};
use crate::poller::{PollEvent, StateObserver};
use crate::state::{JobKey, PrintPhase, PrinterState, ProgressReport};
use crate::timelapse::{SessionOutcome, StopReason, TimelapseManager};

/// Timelapse operations the orchestrator drives.
pub trait TimelapseControl: Send + Sync {
    fn start_session(&self, key: &JobKey) -> Result<(), SessionError>;

    fn notify_progress(
        &self,
        key: &JobKey,
        report: &ProgressReport,
    ) -> Result<SessionOutcome, SessionError>;

    fn stop_session(
        &self,
        key: &JobKey,
        reason: StopReason,
    ) -> Result<SessionOutcome, SessionError>;

    fn abandon_session(&self, key: &JobKey) -> bool;
}

impl TimelapseControl for TimelapseManager {
    fn start_session(&self, key: &JobKey) -> Result<(), SessionError> {
        TimelapseManager::start_session(self, key).map(|_| ())
    }

    fn notify_progress(
        &self,
        key: &JobKey,
        report: &ProgressReport,
    ) -> Result<SessionOutcome, SessionError> {
        TimelapseManager::notify_progress(self, key, report)
    }

    fn stop_session(
        &self,
        key: &JobKey,
        reason: StopReason,
    ) -> Result<SessionOutcome, SessionError> {
        TimelapseManager::stop_session(self, key, reason)
    }

    fn abandon_session(&self, key: &JobKey) -> bool {
        TimelapseManager::abandon_session(self, key)
    }
}

/// Broadcast operations the orchestrator drives.
pub trait BroadcastControl: Send + Sync {
    fn is_active(&self) -> bool;

    fn start_broadcast(&self) -> Result<String, BroadcastError>;

    fn stop_broadcast(&self) -> Result<(), BroadcastError>;
}

impl BroadcastControl for BroadcastManager {
    fn is_active(&self) -> bool {
        BroadcastManager::is_active(self)
    }

    fn start_broadcast(&self) -> Result<String, BroadcastError> {
        BroadcastManager::start_broadcast(self)
    }

    fn stop_broadcast(&self) -> Result<(), BroadcastError> {
        BroadcastManager::stop_broadcast(self)
    }
}

/// What the orchestrator did with one poll event.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// No job is tracked and none is running.
    NoJob,
    Started(JobKey),
    /// Progress was forwarded; the job keeps recording.
    Recording(JobKey),
    /// The timelapse manager finalized the job's timelapse at the last layer.
    LastLayer(JobKey),
    JobChanged { from: JobKey, to: JobKey },
    /// A loss or idle signal is inside its grace period.
    Holding(JobKey),
    Ended { key: JobKey, reason: StopReason },
}

struct TrackedJob {
    key: JobKey,
    /// Whether a timelapse session was started for this job.
    recording: bool,
    /// The printer reported `complete` or `error` for this job. Printing
    /// the same file again after that is a new job, not a resume.
    finished: bool,
}

/// Maps printer state transitions to timelapse and broadcast actions.
pub struct Orchestrator {
    policy: OrchestratorPolicy,
    timelapse: Arc<dyn TimelapseControl>,
    broadcast: Arc<dyn BroadcastControl>,
    job: Option<TrackedJob>,
    last_online: Option<DateTime<Utc>>,
    last_active: Option<DateTime<Utc>>,
    last_layer_triggered: HashSet<JobKey>,
}

impl Orchestrator {
    pub fn new(
        policy: OrchestratorPolicy,
        timelapse: Arc<dyn TimelapseControl>,
        broadcast: Arc<dyn BroadcastControl>,
    ) -> Self {
        Self {
            policy,
            timelapse,
            broadcast,
            job: None,
            last_online: None,
            last_active: None,
            last_layer_triggered: HashSet::new(),
        }
    }

    /// Key of the job currently tracked, if any.
    pub fn current_job(&self) -> Option<&JobKey> {
        self.job.as_ref().map(|job| &job.key)
    }

    pub fn last_online(&self) -> Option<DateTime<Utc>> {
        self.last_online
    }

    /// Evaluate one poll event.
    ///
    /// Grace periods are measured against the timestamps carried by the
    /// events, so replaying a recorded stream gives the same decisions.
    pub fn handle(&mut self, event: &PollEvent) -> Decision {
        match event {
            PollEvent::Unavailable { at, reason } => {
                debug!("Telemetry unavailable at {}: {}", at, reason);
                self.on_telemetry_lost(*at)
            }
            PollEvent::Changed { current, .. } | PollEvent::Unchanged { current } => {
                self.on_state(current)
            }
        }
    }

    fn on_state(&mut self, state: &PrinterState) -> Decision {
        if state.phase == PrintPhase::Offline {
            return self.on_telemetry_lost(state.captured_at);
        }
        self.last_online = Some(state.captured_at);

        if !state.phase.is_active() {
            return self.on_inactive(state);
        }
        self.last_active = Some(state.captured_at);

        let Some(key) = state.job_key() else {
            warn!("Printer reports {} without a file name", state.phase);
            return match &self.job {
                Some(job) => Decision::Holding(job.key.clone()),
                None => Decision::NoJob,
            };
        };

        match self.job.as_ref().map(|job| (job.key == key, job.finished)) {
            None => {
                self.start_job(key.clone(), state);
                Decision::Started(key)
            }
            Some((true, false)) => self.forward_progress(state),
            Some((true, true)) => self.restart_job(key, state),
            Some((false, _)) => self.change_job(key, state),
        }
    }

    fn on_inactive(&mut self, state: &PrinterState) -> Decision {
        let Some(job) = self.job.as_mut() else {
            return Decision::NoJob;
        };
        if matches!(state.phase, PrintPhase::Complete | PrintPhase::Error) {
            job.finished = true;
        }

        let since = self.last_active.unwrap_or(state.captured_at);
        let idle_for = (state.captured_at - since).to_std().unwrap_or_default();
        if idle_for >= self.policy.idle_grace {
            info!(
                "Printer {} for {:?}, ending job '{}'",
                state.phase, idle_for, job.key
            );
            return self.end_job(StopReason::JobEnded);
        }

        debug!(
            "Printer {} for {:?} (grace {:?}), holding job '{}'",
            state.phase, idle_for, self.policy.idle_grace, job.key
        );
        Decision::Holding(job.key.clone())
    }

    fn on_telemetry_lost(&mut self, at: DateTime<Utc>) -> Decision {
        let Some(job) = &self.job else {
            return Decision::NoJob;
        };

        let since = self.last_online.unwrap_or(at);
        let lost_for = (at - since).to_std().unwrap_or_default();
        if lost_for >= self.policy.offline_grace {
            warn!(
                "Printer unreachable for {:?}, ending job '{}'",
                lost_for, job.key
            );
            return self.end_job(StopReason::TelemetryLost);
        }

        info!(
            "Printer unreachable for {:?} (grace {:?}), holding job '{}'",
            lost_for, self.policy.offline_grace, job.key
        );
        Decision::Holding(job.key.clone())
    }

    fn start_job(&mut self, key: JobKey, state: &PrinterState) {
        info!("Print job '{}' started ({})", key, state.phase);

        let recording = self.policy.timelapse_enabled && self.start_session(&key);
        self.last_layer_triggered.remove(&key);
        self.job = Some(TrackedJob {
            key: key.clone(),
            recording,
            finished: false,
        });

        if self.policy.stream_enabled && !self.broadcast.is_active() {
            match self.broadcast.start_broadcast() {
                Ok(id) => info!("Broadcast {} started for '{}'", id, key),
                Err(e) => error!("Failed to start broadcast for '{}': {}", key, e),
            }
        }

        if recording {
            self.forward_progress(state);
        }
    }

    fn start_session(&self, key: &JobKey) -> bool {
        match self.timelapse.start_session(key) {
            Ok(()) => true,
            Err(SessionError::AlreadyActive { active }) => {
                // A session left over from a failed finalization.
                warn!("Clearing leftover timelapse '{}' before starting '{}'", active, key);
                self.retire_session(&active, StopReason::JobChanged);
                match self.timelapse.start_session(key) {
                    Ok(()) => true,
                    Err(e) => {
                        error!("Failed to start timelapse for '{}': {}", key, e);
                        false
                    }
                }
            }
            Err(e) => {
                error!("Failed to start timelapse for '{}': {}", key, e);
                false
            }
        }
    }

    /// Stop a session, abandoning it if it cannot be finalized.
    fn retire_session(&self, key: &JobKey, reason: StopReason) {
        if let Err(e) = self.timelapse.stop_session(key, reason) {
            error!("Failed to finalize timelapse for '{}': {}", key, e);
            self.timelapse.abandon_session(key);
        }
    }

    fn forward_progress(&mut self, state: &PrinterState) -> Decision {
        let Some(job) = self.job.as_mut() else {
            return Decision::NoJob;
        };
        let key = job.key.clone();

        if !job.recording || self.last_layer_triggered.contains(&key) {
            return Decision::Recording(key);
        }

        match self
            .timelapse
            .notify_progress(&key, &state.progress_report())
        {
            Ok(SessionOutcome::Recording) => Decision::Recording(key),
            Ok(SessionOutcome::Finalized { artifact, frames }) => {
                info!(
                    "Timelapse for '{}' finalized at last layer ({} frames, {:?})",
                    key, frames, artifact
                );
                self.last_layer_triggered.insert(key.clone());
                Decision::LastLayer(key)
            }
            Ok(SessionOutcome::Finalizing) => Decision::Recording(key),
            Ok(SessionOutcome::AlreadyFinalized) => {
                self.last_layer_triggered.insert(key.clone());
                Decision::Recording(key)
            }
            Err(SessionError::NotFound(_)) => {
                warn!("Timelapse for '{}' is gone, no longer forwarding progress", key);
                job.recording = false;
                Decision::Recording(key)
            }
            Err(e) => {
                // The session stays stopped; the next notification retries.
                error!("Timelapse finalization for '{}' failed: {}", key, e);
                Decision::Recording(key)
            }
        }
    }

    fn change_job(&mut self, key: JobKey, state: &PrinterState) -> Decision {
        let Some(old) = self.job.take() else {
            self.start_job(key.clone(), state);
            return Decision::Started(key);
        };

        info!("Print job changed from '{}' to '{}'", old.key, key);
        let finalized = self.last_layer_triggered.remove(&old.key);
        if old.recording && !finalized {
            self.retire_session(&old.key, StopReason::JobChanged);
        }

        // The broadcast carries on across jobs.
        self.start_job(key.clone(), state);
        Decision::JobChanged { from: old.key, to: key }
    }

    /// The same file printing again after the previous run finished.
    fn restart_job(&mut self, key: JobKey, state: &PrinterState) -> Decision {
        info!("Print job '{}' finished and started again", key);
        self.end_job(StopReason::JobEnded);
        self.last_active = Some(state.captured_at);
        self.start_job(key.clone(), state);
        Decision::Started(key)
    }

    fn end_job(&mut self, reason: StopReason) -> Decision {
        let Some(job) = self.job.take() else {
            return Decision::NoJob;
        };
        self.last_active = None;

        let finalized = self.last_layer_triggered.remove(&job.key);
        if job.recording && !finalized {
            if let Err(e) = self.timelapse.stop_session(&job.key, reason) {
                // Left stopped; cleared when the next job starts.
                error!("Failed to finalize timelapse for '{}': {}", job.key, e);
            }
        } else if finalized {
            debug!("Timelapse for '{}' already finalized at last layer", job.key);
        }

        if self.policy.end_stream_after_print && self.broadcast.is_active() {
            match self.broadcast.stop_broadcast() {
                Ok(()) => info!("Broadcast stopped after '{}' ({})", job.key, reason),
                Err(e) => error!("Failed to stop broadcast after '{}': {}", job.key, e),
            }
        }

        info!("Print job '{}' ended: {}", job.key, reason);
        Decision::Ended {
            key: job.key,
            reason,
        }
    }
}

impl StateObserver for Orchestrator {
    fn on_poll(&mut self, event: &PollEvent) {
        let decision = self.handle(event);
        debug!("Orchestrator decision: {:?}", decision);
    }
}
