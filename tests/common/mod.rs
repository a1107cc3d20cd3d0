#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;

use printcast::config::{BroadcastSettings, TimelapseSettings};
use printcast::error::{
    BroadcastError, CaptureError, EncoderError, PlatformError, SessionError, TelemetryError,
};
use printcast::{
    BroadcastControl, BroadcastPlatform, BroadcastTicket, Encoder, EncoderProcess, FrameSource,
    IngestionStatus, JobKey, PrintPhase, PrinterState, Privacy, ProgressReport, SessionOutcome,
    StopReason, TelemetrySource, TimelapseControl, TimelapseManager, VideoAssembler,
};

/// Fixed reference time so grace-period arithmetic is exact.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

pub fn at(seconds: i64) -> DateTime<Utc> {
    t0() + chrono::Duration::seconds(seconds)
}

pub fn printing(file: &str, progress: f64, seconds: i64) -> PrinterState {
    PrinterState::new(Some(file), PrintPhase::Printing, progress).at(at(seconds))
}

pub fn printing_layer(file: &str, layer: u32, total: u32, seconds: i64) -> PrinterState {
    let progress = f64::from(layer) / f64::from(total) * 100.0;
    PrinterState::new(Some(file), PrintPhase::Printing, progress)
        .with_layers(layer, total)
        .at(at(seconds))
}

pub fn in_phase(file: Option<&str>, phase: PrintPhase, seconds: i64) -> PrinterState {
    PrinterState::new(file, phase, 0.0).at(at(seconds))
}

/// Poll until `condition` holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// A tiny valid PNG.
pub fn png_frame() -> Vec<u8> {
    let img = image::RgbImage::from_pixel(4, 4, image::Rgb([200, 30, 30]));
    let mut buffer = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buffer), image::ImageFormat::Png)
        .expect("encode png");
    buffer
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

/// Telemetry source answering from a script, optionally after a delay.
pub struct ScriptedTelemetry {
    script: Mutex<VecDeque<(Duration, Result<PrinterState, TelemetryError>)>>,
    pub calls: AtomicUsize,
}

impl ScriptedTelemetry {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, state: PrinterState) -> &Self {
        self.script.lock().push_back((Duration::ZERO, Ok(state)));
        self
    }

    pub fn push_delayed(&self, delay: Duration, state: PrinterState) -> &Self {
        self.script.lock().push_back((delay, Ok(state)));
        self
    }

    pub fn push_error(&self, error: TelemetryError) -> &Self {
        self.script.lock().push_back((Duration::ZERO, Err(error)));
        self
    }
}

impl TelemetrySource for ScriptedTelemetry {
    fn fetch_state(&self) -> Result<PrinterState, TelemetryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().pop_front();
        match next {
            Some((delay, result)) => {
                thread::sleep(delay);
                result
            }
            None => Err(TelemetryError::Connection {
                api_url: "http://printer.test".to_string(),
                reason: "script exhausted".to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Frames and assembly
// ---------------------------------------------------------------------------

/// Frame source that serves the same image, optionally failing some calls.
pub struct StaticFrames {
    frame: Vec<u8>,
    fail_first: usize,
    failing: AtomicBool,
    pub calls: AtomicUsize,
}

impl StaticFrames {
    pub fn new(frame: Vec<u8>) -> Self {
        Self {
            frame,
            fail_first: 0,
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    /// Fail the first `n` fetches, then serve frames.
    pub fn failing_first(frame: Vec<u8>, n: usize) -> Self {
        Self {
            fail_first: n,
            ..Self::new(frame)
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn frame(&self) -> &[u8] {
        &self.frame
    }
}

impl FrameSource for StaticFrames {
    fn fetch_frame(&self) -> Result<Vec<u8>, CaptureError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first || self.failing.load(Ordering::SeqCst) {
            return Err(CaptureError::Http {
                url: "http://camera.test/snapshot".to_string(),
                status: 503,
            });
        }
        Ok(self.frame.clone())
    }
}

/// What the assembler saw when it was invoked.
#[derive(Debug, Clone)]
pub struct Assembly {
    pub frames_dir: PathBuf,
    pub extension: String,
    pub frame_count: u64,
    pub fps: u32,
    pub output: PathBuf,
    /// Frame files present in the directory at assembly time, sorted.
    pub files: Vec<String>,
}

/// Assembler that records its invocations and writes a placeholder video.
pub struct RecordingAssembler {
    pub assemblies: Mutex<Vec<Assembly>>,
    fail: AtomicBool,
}

impl RecordingAssembler {
    pub fn new() -> Self {
        Self {
            assemblies: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.assemblies.lock().len()
    }
}

impl VideoAssembler for RecordingAssembler {
    fn assemble(
        &self,
        frames_dir: &Path,
        extension: &str,
        frame_count: u64,
        fps: u32,
        output: &Path,
    ) -> io::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(io::Error::other("encoder exited with status 1"));
        }

        let mut files: Vec<String> = fs::read_dir(frames_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        files.sort();

        fs::write(output, b"video")?;
        self.assemblies.lock().push(Assembly {
            frames_dir: frames_dir.to_path_buf(),
            extension: extension.to_string(),
            frame_count,
            fps,
            output: output.to_path_buf(),
            files,
        });
        Ok(())
    }
}

/// Timelapse settings writing into `dir` with a long capture interval, so
/// only the immediate first capture happens unless a test shortens it.
pub fn timelapse_settings(dir: &Path) -> TimelapseSettings {
    TimelapseSettings {
        output_dir: dir.to_path_buf(),
        capture_interval: Duration::from_secs(3600),
        ..TimelapseSettings::default()
    }
}

// ---------------------------------------------------------------------------
// Broadcast platform and encoder
// ---------------------------------------------------------------------------

/// In-memory broadcast platform.
pub struct FakePlatform {
    pub creates: AtomicUsize,
    pub ends: Mutex<Vec<String>>,
    pub transitions: Mutex<Vec<String>>,
    ingestion: Mutex<IngestionStatus>,
    reject_credentials: AtomicBool,
    fail_end: AtomicBool,
    privacy: Mutex<HashMap<String, Privacy>>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self {
            creates: AtomicUsize::new(0),
            ends: Mutex::new(Vec::new()),
            transitions: Mutex::new(Vec::new()),
            ingestion: Mutex::new(IngestionStatus::Inactive),
            reject_credentials: AtomicBool::new(false),
            fail_end: AtomicBool::new(false),
            privacy: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_ingestion(&self, status: IngestionStatus) {
        *self.ingestion.lock() = status;
    }

    pub fn reject_credentials(&self, reject: bool) {
        self.reject_credentials.store(reject, Ordering::SeqCst);
    }

    pub fn fail_end(&self, fail: bool) {
        self.fail_end.store(fail, Ordering::SeqCst);
    }

    pub fn end_count(&self) -> usize {
        self.ends.lock().len()
    }
}

impl BroadcastPlatform for FakePlatform {
    fn create_broadcast(
        &self,
        _title: &str,
        privacy: Privacy,
    ) -> Result<BroadcastTicket, PlatformError> {
        if self.reject_credentials.load(Ordering::SeqCst) {
            return Err(PlatformError::Authentication("invalid credentials".to_string()));
        }
        let n = self.creates.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("broadcast-{}", n);
        self.privacy.lock().insert(id.clone(), privacy);
        Ok(BroadcastTicket {
            id,
            stream_id: format!("stream-{}", n),
            ingest_address: format!("rtmp://ingest.test/live/key-{}", n),
        })
    }

    fn ingestion_status(
        &self,
        _ticket: &BroadcastTicket,
    ) -> Result<IngestionStatus, PlatformError> {
        Ok(*self.ingestion.lock())
    }

    fn transition_to_live(&self, id: &str) -> Result<(), PlatformError> {
        self.transitions.lock().push(id.to_string());
        Ok(())
    }

    fn end_broadcast(&self, id: &str) -> Result<(), PlatformError> {
        self.ends.lock().push(id.to_string());
        if self.fail_end.load(Ordering::SeqCst) {
            return Err(PlatformError::Network("connection reset".to_string()));
        }
        Ok(())
    }

    fn get_privacy(&self, id: &str) -> Result<Privacy, PlatformError> {
        self.privacy
            .lock()
            .get(id)
            .copied()
            .ok_or_else(|| PlatformError::MalformedResponse(format!("unknown video {}", id)))
    }

    fn set_privacy(&self, id: &str, privacy: Privacy) -> Result<(), PlatformError> {
        self.privacy.lock().insert(id.to_string(), privacy);
        Ok(())
    }
}

/// Platform whose ingestion query blocks until the test releases it, for
/// checking what can run while a health check waits on the network.
pub struct GatedPlatform {
    pub inner: FakePlatform,
    entered_tx: Sender<()>,
    entered_rx: Receiver<()>,
    release_tx: Sender<()>,
    release_rx: Receiver<()>,
}

impl GatedPlatform {
    pub fn new() -> Self {
        let (entered_tx, entered_rx) = unbounded();
        let (release_tx, release_rx) = unbounded();
        let inner = FakePlatform::new();
        inner.set_ingestion(IngestionStatus::Active);
        Self {
            inner,
            entered_tx,
            entered_rx,
            release_tx,
            release_rx,
        }
    }

    /// Wait until an ingestion query is blocked inside the platform.
    pub fn wait_entered(&self, timeout: Duration) -> bool {
        self.entered_rx.recv_timeout(timeout).is_ok()
    }

    pub fn release(&self) {
        let _ = self.release_tx.send(());
    }
}

impl BroadcastPlatform for GatedPlatform {
    fn create_broadcast(
        &self,
        title: &str,
        privacy: Privacy,
    ) -> Result<BroadcastTicket, PlatformError> {
        self.inner.create_broadcast(title, privacy)
    }

    fn ingestion_status(
        &self,
        ticket: &BroadcastTicket,
    ) -> Result<IngestionStatus, PlatformError> {
        let _ = self.entered_tx.send(());
        if self.release_rx.recv_timeout(Duration::from_secs(10)).is_err() {
            return Err(PlatformError::Network("timed out".to_string()));
        }
        self.inner.ingestion_status(ticket)
    }

    fn transition_to_live(&self, id: &str) -> Result<(), PlatformError> {
        self.inner.transition_to_live(id)
    }

    fn end_broadcast(&self, id: &str) -> Result<(), PlatformError> {
        self.inner.end_broadcast(id)
    }

    fn get_privacy(&self, id: &str) -> Result<Privacy, PlatformError> {
        self.inner.get_privacy(id)
    }

    fn set_privacy(&self, id: &str, privacy: Privacy) -> Result<(), PlatformError> {
        self.inner.set_privacy(id, privacy)
    }
}

struct FakeProcess {
    id: u32,
    alive: Arc<AtomicBool>,
    stops: Arc<AtomicUsize>,
}

impl EncoderProcess for FakeProcess {
    fn id(&self) -> u32 {
        self.id
    }

    fn is_alive(&mut self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn stop(self: Box<Self>, _timeout: Duration) -> Result<(), EncoderError> {
        self.alive.store(false, Ordering::SeqCst);
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Encoder whose processes live until a test kills them.
pub struct FakeEncoder {
    next_id: AtomicU32,
    pub starts: Mutex<Vec<(String, String)>>,
    pub stops: Arc<AtomicUsize>,
    current: Mutex<Option<Arc<AtomicBool>>>,
    fail_starts: AtomicBool,
}

impl FakeEncoder {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1000),
            starts: Mutex::new(Vec::new()),
            stops: Arc::new(AtomicUsize::new(0)),
            current: Mutex::new(None),
            fail_starts: AtomicBool::new(false),
        }
    }

    /// Simulate the most recently started process crashing.
    pub fn kill_current(&self) {
        if let Some(alive) = self.current.lock().as_ref() {
            alive.store(false, Ordering::SeqCst);
        }
    }

    pub fn fail_starts(&self, fail: bool) {
        self.fail_starts.store(fail, Ordering::SeqCst);
    }

    pub fn start_count(&self) -> usize {
        self.starts.lock().len()
    }

    pub fn ingest_addresses(&self) -> Vec<String> {
        self.starts.lock().iter().map(|(addr, _)| addr.clone()).collect()
    }
}

impl Encoder for FakeEncoder {
    fn start(
        &self,
        ingest_address: &str,
        source_url: &str,
    ) -> Result<Box<dyn EncoderProcess>, EncoderError> {
        if self.fail_starts.load(Ordering::SeqCst) {
            return Err(EncoderError::Spawn {
                program: "ffmpeg".to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no such file"),
            });
        }

        self.starts
            .lock()
            .push((ingest_address.to_string(), source_url.to_string()));
        let alive = Arc::new(AtomicBool::new(true));
        *self.current.lock() = Some(Arc::clone(&alive));
        Ok(Box::new(FakeProcess {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            alive,
            stops: Arc::clone(&self.stops),
        }))
    }
}

/// Broadcast settings with a monitor that never fires on its own.
pub fn broadcast_settings() -> BroadcastSettings {
    BroadcastSettings {
        source_url: "http://camera.test/stream".to_string(),
        health_interval: Duration::from_secs(3600),
        failure_threshold: 3,
        stop_timeout: Duration::from_millis(100),
        ..BroadcastSettings::default()
    }
}

// ---------------------------------------------------------------------------
// Orchestrator collaborators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum TimelapseCall {
    Start(JobKey),
    Notify(JobKey),
    Stop(JobKey, StopReason),
    Abandon(JobKey),
}

/// Real timelapse manager with every call and finalization recorded.
pub struct RecordingTimelapse {
    pub manager: TimelapseManager,
    pub assembler: Arc<RecordingAssembler>,
    pub calls: Mutex<Vec<TimelapseCall>>,
    pub finalized: Mutex<Vec<JobKey>>,
}

impl RecordingTimelapse {
    pub fn new(settings: TimelapseSettings) -> Self {
        let assembler = Arc::new(RecordingAssembler::new());
        Self {
            manager: TimelapseManager::new(
                Arc::new(StaticFrames::new(png_frame())),
                assembler.clone(),
                settings,
            ),
            assembler,
            calls: Mutex::new(Vec::new()),
            finalized: Mutex::new(Vec::new()),
        }
    }

    pub fn starts(&self) -> Vec<JobKey> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                TimelapseCall::Start(key) => Some(key.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn stops(&self) -> Vec<(JobKey, StopReason)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                TimelapseCall::Stop(key, reason) => Some((key.clone(), *reason)),
                _ => None,
            })
            .collect()
    }

    /// Calls other than progress notifications.
    pub fn lifecycle_calls(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| !matches!(call, TimelapseCall::Notify(_)))
            .count()
    }

    pub fn finalize_count(&self) -> usize {
        self.finalized.lock().len()
    }

    fn record(&self, key: &JobKey, outcome: &Result<SessionOutcome, SessionError>) {
        if let Ok(SessionOutcome::Finalized { .. }) = outcome {
            self.finalized.lock().push(key.clone());
        }
    }
}

impl TimelapseControl for RecordingTimelapse {
    fn start_session(&self, key: &JobKey) -> Result<(), SessionError> {
        self.calls.lock().push(TimelapseCall::Start(key.clone()));
        self.manager.start_session(key).map(|_| ())
    }

    fn notify_progress(
        &self,
        key: &JobKey,
        report: &ProgressReport,
    ) -> Result<SessionOutcome, SessionError> {
        self.calls.lock().push(TimelapseCall::Notify(key.clone()));
        let outcome = self.manager.notify_progress(key, report);
        self.record(key, &outcome);
        outcome
    }

    fn stop_session(
        &self,
        key: &JobKey,
        reason: StopReason,
    ) -> Result<SessionOutcome, SessionError> {
        self.calls.lock().push(TimelapseCall::Stop(key.clone(), reason));
        let outcome = self.manager.stop_session(key, reason);
        self.record(key, &outcome);
        outcome
    }

    fn abandon_session(&self, key: &JobKey) -> bool {
        self.calls.lock().push(TimelapseCall::Abandon(key.clone()));
        self.manager.abandon_session(key)
    }
}

/// Broadcast control that only counts calls.
pub struct CountingBroadcast {
    active: AtomicBool,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    fail_start: AtomicBool,
}

impl CountingBroadcast {
    pub fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            fail_start: AtomicBool::new(false),
        }
    }

    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl BroadcastControl for CountingBroadcast {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn start_broadcast(&self) -> Result<String, BroadcastError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(PlatformError::Authentication("invalid credentials".to_string()).into());
        }
        self.active.store(true, Ordering::SeqCst);
        Ok("broadcast-1".to_string())
    }

    fn stop_broadcast(&self) -> Result<(), BroadcastError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if !self.active.swap(false, Ordering::SeqCst) {
            return Err(BroadcastError::NotActive);
        }
        Ok(())
    }
}
