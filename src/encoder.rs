use std::io::Write;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::error::EncoderError;

/// A running encoder subprocess.
pub trait EncoderProcess: Send {
    /// OS process id, used to tell restarted encoders apart.
    fn id(&self) -> u32;

    /// Whether the process is still running.
    fn is_alive(&mut self) -> bool;

    /// Stop the process, waiting up to `timeout` before killing it.
    ///
    /// Must succeed when the process has already exited.
    fn stop(self: Box<Self>, timeout: Duration) -> Result<(), EncoderError>;
}

/// Launches encoder processes that push a camera feed to an ingest address.
pub trait Encoder: Send + Sync {
    fn start(
        &self,
        ingest_address: &str,
        source_url: &str,
    ) -> Result<Box<dyn EncoderProcess>, EncoderError>;
}

/// Streams the camera to RTMP with ffmpeg.
///
/// A silent audio track is muxed in because most platforms refuse to ingest
/// video-only streams.
pub struct FfmpegEncoder {
    ffmpeg_path: String,
    video_bitrate_kbps: u32,
}

impl FfmpegEncoder {
    pub fn new(ffmpeg_path: String) -> Self {
        Self {
            ffmpeg_path,
            video_bitrate_kbps: 2500,
        }
    }

    pub fn with_bitrate(mut self, video_bitrate_kbps: u32) -> Self {
        self.video_bitrate_kbps = video_bitrate_kbps;
        self
    }
}

impl Encoder for FfmpegEncoder {
    fn start(
        &self,
        ingest_address: &str,
        source_url: &str,
    ) -> Result<Box<dyn EncoderProcess>, EncoderError> {
        let bitrate = format!("{}k", self.video_bitrate_kbps);
        let child = Command::new(&self.ffmpeg_path)
            .args(["-loglevel", "error"])
            .args(["-i", source_url])
            .args(["-f", "lavfi", "-i", "anullsrc=channel_layout=stereo:sample_rate=44100"])
            .args(["-map", "0:v", "-map", "1:a"])
            .args(["-c:v", "libx264", "-preset", "veryfast", "-tune", "zerolatency"])
            .args(["-pix_fmt", "yuv420p", "-g", "60", "-b:v", &bitrate])
            .args(["-c:a", "aac", "-b:a", "128k"])
            .args(["-f", "flv", ingest_address])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| EncoderError::Spawn {
                program: self.ffmpeg_path.clone(),
                source,
            })?;

        info!("Encoder started (pid {})", child.id());
        Ok(Box::new(FfmpegProcess { child }))
    }
}

struct FfmpegProcess {
    child: Child,
}

impl EncoderProcess for FfmpegProcess {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!("Encoder {} exited with {}", self.child.id(), status);
                false
            }
            Err(e) => {
                warn!("Failed to query encoder {}: {}", self.child.id(), e);
                false
            }
        }
    }

    fn stop(mut self: Box<Self>, timeout: Duration) -> Result<(), EncoderError> {
        let pid = self.child.id();
        if self.child.try_wait()?.is_some() {
            debug!("Encoder {} already exited", pid);
            return Ok(());
        }

        // ffmpeg quits cleanly on 'q', flushing the output.
        if let Some(stdin) = self.child.stdin.as_mut() {
            let _ = stdin.write_all(b"q");
            let _ = stdin.flush();
        }
        drop(self.child.stdin.take());

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.child.try_wait()?.is_some() {
                info!("Encoder {} stopped", pid);
                return Ok(());
            }
            thread::sleep(Duration::from_millis(100));
        }

        warn!("Encoder {} did not exit within {:?}, killing", pid, timeout);
        if let Err(e) = self.child.kill() {
            // Exited between the last check and the kill.
            if e.kind() != std::io::ErrorKind::InvalidInput {
                return Err(e.into());
            }
        }
        self.child.wait()?;
        Ok(())
    }
}
