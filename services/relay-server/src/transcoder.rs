//! Supervises the video transcoder subprocess and feeds its stdout into the
//! viewer broadcast. The output is one continuous MPEG-TS stream; chunks are
//! forwarded as read, with no frame parsing.

use std::process::Stdio;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::fanout::broadcast::ChunkBroadcast;

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TranscoderError {
    #[error("no video source configured")]
    NoSource,
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Output parameters of the transcoded stream.
#[derive(Debug, Clone)]
pub struct VideoSettings {
    pub source: String,
    pub transport: String,
    pub resolution: String,
    pub bitrate: String,
    pub fps: String,
}

impl VideoSettings {
    pub fn from_config(cfg: &Config) -> Result<Self, TranscoderError> {
        let source = cfg.video_source.clone().ok_or(TranscoderError::NoSource)?;
        Ok(Self {
            source,
            transport: cfg.camera_transport.clone(),
            resolution: cfg.camera_res.clone(),
            bitrate: cfg.camera_bitrate.clone(),
            fps: cfg.camera_fps.clone(),
        })
    }

    /// ffmpeg arguments for a low-latency MPEG-1 stream on stdout.
    pub fn ffmpeg_args(&self) -> Vec<String> {
        [
            "-rtsp_transport", self.transport.as_str(),
            "-i", self.source.as_str(),
            "-an",
            "-f", "mpegts",
            "-codec:v", "mpeg1video",
            "-s", self.resolution.as_str(),
            "-b:v", self.bitrate.as_str(),
            "-r", self.fps.as_str(),
            "-g", self.fps.as_str(),
            "-bf", "0",
            "-tune", "zerolatency",
            "-preset", "ultrafast",
            "-",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

/// Routine ffmpeg progress output (`frame=... fps=...`, `bitrate=...`).
pub fn is_progress_line(line: &str) -> bool {
    if line.contains("bitrate=") {
        return true;
    }
    match line.find("frame=") {
        Some(at) => line[at..].contains("fps="),
        None => false,
    }
}

/// Lines of a diagnostic chunk worth surfacing. ffmpeg separates progress
/// updates with carriage returns, so both line endings split.
pub fn surfaced_lines(chunk: &str) -> impl Iterator<Item = &str> {
    chunk
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|l| !l.is_empty() && !is_progress_line(l))
}

/// Handle to the running transcoder. Exit is logged; there is no restart.
pub struct Transcoder {
    shutdown_tx: Option<oneshot::Sender<()>>,
    watcher: JoinHandle<()>,
}

impl Transcoder {
    pub fn spawn(
        program: &str,
        args: &[String],
        broadcast: Arc<ChunkBroadcast>,
    ) -> Result<Self, TranscoderError> {
        info!(program, args = %args.join(" "), "starting transcoder");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TranscoderError::Spawn {
                program: program.to_string(),
                source,
            })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_output(stdout, broadcast));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_diagnostics(stderr));
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let watcher = tokio::spawn(watch(child, shutdown_rx));
        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            watcher,
        })
    }

    pub fn is_finished(&self) -> bool {
        self.watcher.is_finished()
    }

    /// Kill the subprocess if it is still running and wait for it.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.watcher).await;
    }
}

async fn watch(mut child: Child, shutdown_rx: oneshot::Receiver<()>) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = shutdown_rx => {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill transcoder");
            }
            child.wait().await
        }
    };
    match status {
        Ok(status) => info!(%status, "transcoder exited"),
        Err(e) => error!(error = %e, "transcoder wait failed"),
    }
}

async fn pump_output(mut stdout: ChildStdout, broadcast: Arc<ChunkBroadcast>) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                broadcast.send_chunk(Bytes::copy_from_slice(&buf[..n]));
            }
            Err(e) => {
                warn!(error = %e, "transcoder output read failed");
                break;
            }
        }
    }
}

async fn pump_diagnostics(mut stderr: ChildStderr) {
    let mut buf = vec![0u8; 4096];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let chunk = String::from_utf8_lossy(&buf[..n]);
                for line in surfaced_lines(&chunk) {
                    info!(process = "transcoder", "{line}");
                }
            }
        }
    }
}
