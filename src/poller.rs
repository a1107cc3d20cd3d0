//! Periodic printer-state poller.
//!
//! Every tick issues one telemetry query, bounded by the configured timeout,
//! and dispatches exactly one [`PollEvent`] to each observer in registration
//! order. Observers run synchronously on the polling thread, so events are
//! always seen in tick order.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvError, Sender, TrySendError, bounded, select, unbounded};
use log::{debug, info, warn};

use crate::config::PollerSettings;
use crate::error::TelemetryError;
use crate::printer::TelemetrySource;
use crate::state::PrinterState;

/// Outcome of a single poll tick.
#[derive(Debug, Clone, PartialEq)]
pub enum PollEvent {
    /// The snapshot differs meaningfully from the last changed one.
    /// `previous` is `None` on the first successful tick.
    Changed {
        previous: Option<PrinterState>,
        current: PrinterState,
    },
    /// Telemetry succeeded but nothing meaningful moved.
    Unchanged { current: PrinterState },
    /// The query failed or timed out. This is not the same as the printer
    /// being offline.
    Unavailable { at: DateTime<Utc>, reason: String },
}

impl PollEvent {
    pub fn is_change(&self) -> bool {
        matches!(self, PollEvent::Changed { .. })
    }

    /// Snapshot carried by the event, if telemetry succeeded.
    pub fn current(&self) -> Option<&PrinterState> {
        match self {
            PollEvent::Changed { current, .. } | PollEvent::Unchanged { current } => Some(current),
            PollEvent::Unavailable { .. } => None,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            PollEvent::Changed { current, .. } | PollEvent::Unchanged { current } => {
                current.captured_at
            }
            PollEvent::Unavailable { at, .. } => *at,
        }
    }
}

/// Receives poll events on the polling thread.
pub trait StateObserver {
    fn on_poll(&mut self, event: &PollEvent);
}

/// Forward events to another thread. Events are dropped with a warning if
/// the receiving side is gone or full.
impl StateObserver for Sender<PollEvent> {
    fn on_poll(&mut self, event: &PollEvent) {
        if let Err(e) = self.try_send(event.clone()) {
            warn!("Failed to forward poll event: {}", e);
        }
    }
}

type Response = (u64, Result<PrinterState, TelemetryError>);

/// Runs telemetry queries off the polling thread so a hung request cannot
/// stall later ticks.
struct TelemetryWorker {
    request_tx: Sender<u64>,
    response_rx: Receiver<Response>,
    _handle: JoinHandle<()>,
}

impl TelemetryWorker {
    fn spawn(source: Arc<dyn TelemetrySource>) -> Self {
        // One queued request at most; a second one means the worker is stuck.
        let (request_tx, request_rx) = bounded::<u64>(1);
        let (response_tx, response_rx) = unbounded::<Response>();

        let handle = thread::spawn(move || {
            for seq in request_rx.iter() {
                let result = source.fetch_state();
                if response_tx.send((seq, result)).is_err() {
                    break;
                }
            }
            debug!("Telemetry worker exiting");
        });

        Self {
            request_tx,
            response_rx,
            _handle: handle,
        }
    }
}

enum Query {
    Done(Result<PrinterState, TelemetryError>),
    Cancelled,
}

enum Wait {
    Response(Result<Response, RecvError>),
    Shutdown,
    TimedOut,
}

/// Polls a [`TelemetrySource`] and emits change events.
pub struct StatePoller {
    settings: PollerSettings,
    worker: TelemetryWorker,
    last_changed: Option<PrinterState>,
    observers: Vec<Box<dyn StateObserver>>,
    next_seq: u64,
    /// Query that timed out and has not answered yet.
    in_flight: Option<u64>,
}

impl StatePoller {
    pub fn new(source: Arc<dyn TelemetrySource>, settings: PollerSettings) -> Self {
        Self {
            settings,
            worker: TelemetryWorker::spawn(source),
            last_changed: None,
            observers: Vec::new(),
            next_seq: 0,
            in_flight: None,
        }
    }

    /// Register an observer. Observers are called in registration order.
    pub fn subscribe(&mut self, observer: impl StateObserver + 'static) {
        self.observers.push(Box::new(observer));
    }

    /// Last snapshot that was reported as a change.
    pub fn last_state(&self) -> Option<&PrinterState> {
        self.last_changed.as_ref()
    }

    /// Run the poll loop until `shutdown` receives a message or disconnects.
    ///
    /// The first tick runs immediately. A tick in flight when shutdown is
    /// raised is abandoned without dispatching.
    pub fn run(&mut self, shutdown: &Receiver<()>) {
        info!(
            "State poller started (interval {:?}, timeout {:?})",
            self.settings.interval, self.settings.timeout
        );
        let ticker = crossbeam_channel::tick(self.settings.interval);

        loop {
            if self.tick(shutdown).is_none() {
                break;
            }

            let keep_running = select! {
                recv(ticker) -> _ => true,
                recv(shutdown) -> _ => false,
            };
            if !keep_running {
                break;
            }
        }

        info!("State poller stopped");
    }

    /// Run a single tick and return the dispatched event.
    pub fn poll_once(&mut self) -> PollEvent {
        let never = crossbeam_channel::never::<()>();
        match self.tick(&never) {
            Some(event) => event,
            None => PollEvent::Unavailable {
                at: Utc::now(),
                reason: "poll cancelled".to_string(),
            },
        }
    }

    fn tick(&mut self, shutdown: &Receiver<()>) -> Option<PollEvent> {
        let event = match self.query(shutdown) {
            Query::Cancelled => return None,
            Query::Done(Ok(state)) => self.classify(state),
            Query::Done(Err(e)) => {
                warn!("Telemetry unavailable: {}", e);
                PollEvent::Unavailable {
                    at: Utc::now(),
                    reason: e.to_string(),
                }
            }
        };

        if let PollEvent::Changed { previous, current } = &event {
            info!(
                "Printer state changed: {} -> {} ({:?}, {:.1}%)",
                previous
                    .as_ref()
                    .map(|p| p.phase.as_str())
                    .unwrap_or("none"),
                current.phase,
                current.filename,
                current.progress
            );
        }

        for observer in &mut self.observers {
            observer.on_poll(&event);
        }

        Some(event)
    }

    fn classify(&mut self, current: PrinterState) -> PollEvent {
        let changed = match &self.last_changed {
            None => true,
            Some(previous) => current.changed_from(previous, self.settings.progress_noise),
        };

        if changed {
            let previous = self.last_changed.replace(current.clone());
            PollEvent::Changed { previous, current }
        } else {
            debug!("Printer state unchanged ({})", current.phase);
            PollEvent::Unchanged { current }
        }
    }

    fn query(&mut self, shutdown: &Receiver<()>) -> Query {
        while let Ok((id, _)) = self.worker.response_rx.try_recv() {
            debug!("Discarding stale telemetry response #{}", id);
            if self.in_flight == Some(id) {
                self.in_flight = None;
            }
        }
        if self.in_flight.is_some() {
            return Query::Done(Err(TelemetryError::Busy));
        }

        self.next_seq += 1;
        let seq = self.next_seq;

        match self.worker.request_tx.try_send(seq) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => return Query::Done(Err(TelemetryError::Busy)),
            Err(TrySendError::Disconnected(_)) => {
                return Query::Done(Err(TelemetryError::WorkerStopped));
            }
        }

        let deadline = Instant::now() + self.settings.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let wait = select! {
                recv(self.worker.response_rx) -> msg => Wait::Response(msg),
                recv(shutdown) -> _ => Wait::Shutdown,
                default(remaining) => Wait::TimedOut,
            };

            match wait {
                Wait::Response(Ok((id, result))) if id == seq => {
                    self.in_flight = None;
                    return Query::Done(result);
                }
                Wait::Response(Ok((id, _))) => {
                    debug!("Discarding stale telemetry response #{}", id);
                }
                Wait::Response(Err(_)) => {
                    return Query::Done(Err(TelemetryError::WorkerStopped));
                }
                Wait::Shutdown => {
                    self.in_flight = Some(seq);
                    return Query::Cancelled;
                }
                Wait::TimedOut => {
                    self.in_flight = Some(seq);
                    return Query::Done(Err(TelemetryError::Timeout {
                        timeout_ms: self.settings.timeout.as_millis() as u64,
                    }));
                }
            }
        }
    }
}
