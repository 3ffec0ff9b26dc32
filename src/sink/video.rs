//! Video encode through an `ffmpeg` child process reading raw frames on stdin.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, instrument, warn};

use super::{Finalizer, FrameWriter};
use crate::error::SinkError;
use crate::source::{BitDepth, Frame, FrameRate, PixelFormat};
use crate::subprocess::{spawn_detached, StderrTail};

/// How long `finish` waits for ffmpeg's stderr to close after exit.
const STDERR_GRACE: Duration = Duration::from_millis(500);

/// Encoder parameters forwarded to ffmpeg.
#[derive(Debug, Clone)]
pub struct EncoderSettings {
    pub ffmpeg: String,
    pub codec: String,
    pub crf: u32,
    pub preset: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: FrameRate,
    pub depth: BitDepth,
}

impl EncoderSettings {
    pub fn pixel_format(&self) -> PixelFormat {
        PixelFormat::for_depth(self.depth)
    }

    fn args(&self, output: &Path) -> Vec<String> {
        let mut args: Vec<String> = [
            "-y",
            "-v",
            "error",
            "-f",
            "rawvideo",
            "-pix_fmt",
            self.pixel_format().ffmpeg_name(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.extend([
            "-s".to_string(),
            format!("{}x{}", self.width, self.height),
            "-r".to_string(),
            self.frame_rate.to_string(),
            "-i".to_string(),
            "-".to_string(),
            "-c:v".to_string(),
            self.codec.clone(),
            "-crf".to_string(),
            self.crf.to_string(),
            "-preset".to_string(),
            self.preset.clone(),
        ]);
        args.push(output.display().to_string());
        args
    }
}

/// Pipes frames into an ffmpeg encoder writing `output`.
pub struct FfmpegEncoder {
    settings: EncoderSettings,
    output: PathBuf,
    child: Option<Arc<Mutex<Child>>>,
    stdin: Option<ChildStdin>,
    stderr: Option<StderrTail>,
    frames: u64,
}

impl FfmpegEncoder {
    pub fn new(settings: EncoderSettings, output: &Path) -> Self {
        Self {
            settings,
            output: output.to_path_buf(),
            child: None,
            stdin: None,
            stderr: None,
            frames: 0,
        }
    }

    fn check_frame(&self, frame: &Frame) -> Result<(), SinkError> {
        let expected = (
            self.settings.width,
            self.settings.height,
            self.settings.pixel_format(),
        );
        let actual = (frame.meta.width, frame.meta.height, frame.meta.format);
        if expected != actual {
            return Err(SinkError::FrameMismatch {
                expected: format!("{expected:?}"),
                actual: format!("{actual:?}"),
            });
        }
        Ok(())
    }
}

impl FrameWriter for FfmpegEncoder {
    #[instrument(skip(self), fields(output = %self.output.display()))]
    fn open(&mut self) -> Result<(), SinkError> {
        let mut command = Command::new(&self.settings.ffmpeg);
        command
            .args(self.settings.args(&self.output))
            .stdin(Stdio::piped())
            .stdout(Stdio::null());
        debug!(?command, "Spawning encoder");

        let (mut child, stderr) = spawn_detached(&mut command)?;
        self.stdin = child.stdin.take();
        self.stderr = Some(stderr);
        self.child = Some(Arc::new(Mutex::new(child)));
        info!(
            codec = %self.settings.codec,
            width = self.settings.width,
            height = self.settings.height,
            rate = %self.settings.frame_rate,
            "Encoder started"
        );
        Ok(())
    }

    fn write_frame(&mut self, frame: Frame) -> Result<(), SinkError> {
        self.check_frame(&frame)?;
        let stdin = self.stdin.as_mut().ok_or(SinkError::NotStarted)?;
        stdin
            .write_all(&frame.data)
            .map_err(|e| SinkError::Encode(format!("encoder pipe closed: {e}")))?;
        self.frames += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        // EOF on stdin makes ffmpeg flush and write the container trailer.
        drop(self.stdin.take());
        let Some(child) = self.child.take() else {
            return Ok(());
        };
        let status = child
            .lock()
            .map_err(|_| SinkError::Encode("encoder handle poisoned".into()))?
            .wait()?;
        if status.success() {
            debug!(frames = self.frames, "Encoder exited cleanly");
            return Ok(());
        }

        let stderr = self
            .stderr
            .take()
            .map(|mut tail| tail.text(STDERR_GRACE))
            .unwrap_or_default();
        Err(SinkError::Encode(format!("ffmpeg exited with {status}: {stderr}")))
    }

    fn finalizer(&self) -> Option<Box<dyn Finalizer>> {
        let child = self.child.as_ref()?;
        let pid = child.lock().ok()?.id();
        Some(Box::new(EncoderFinalizer {
            pid,
            child: Arc::clone(child),
        }))
    }

    fn describe(&self) -> String {
        self.output.display().to_string()
    }
}

/// Asks ffmpeg to close the container with SIGINT, killing it only if it
/// ignores the request.
///
/// The encode worker may be blocked in `finish` holding the child lock, so
/// signals go by pid and the lock is only ever polled.
struct EncoderFinalizer {
    pid: u32,
    child: Arc<Mutex<Child>>,
}

impl EncoderFinalizer {
    fn signal(&self, signal: Signal) -> Result<bool, SinkError> {
        match kill(Pid::from_raw(self.pid as i32), signal) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(e) => Err(SinkError::Encode(format!("failed to signal encoder: {e}"))),
        }
    }

    fn exited(&self) -> Result<bool, SinkError> {
        match self.child.try_lock() {
            Ok(mut child) => Ok(child.try_wait()?.is_some()),
            Err(TryLockError::WouldBlock) => Ok(false),
            Err(TryLockError::Poisoned(_)) => {
                Err(SinkError::Encode("encoder handle poisoned".into()))
            }
        }
    }
}

impl Finalizer for EncoderFinalizer {
    fn force_finalize(&mut self, grace: Duration) -> Result<(), SinkError> {
        if self.exited()? {
            return Ok(());
        }

        warn!(pid = self.pid, "Sending SIGINT to encoder");
        if !self.signal(Signal::SIGINT)? {
            return Ok(());
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if self.exited()? {
                debug!(pid = self.pid, "Encoder finalised after SIGINT");
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(20));
        }

        warn!(pid = self.pid, "Encoder ignored SIGINT, killing");
        self.signal(Signal::SIGKILL)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn settings(depth: BitDepth) -> EncoderSettings {
        EncoderSettings {
            ffmpeg: "ffmpeg".into(),
            codec: "libx264".into(),
            crf: 11,
            preset: "slow".into(),
            width: 4,
            height: 2,
            frame_rate: FrameRate::NTSC_FILM,
            depth,
        }
    }

    #[test]
    fn test_encoder_arguments() {
        let args = settings(BitDepth::Sixteen).args(Path::new("out.mkv"));
        let joined = args.join(" ");
        assert!(joined.starts_with("-y -v error -f rawvideo -pix_fmt rgb48le -s 4x2 -r 24000/1001 -i -"));
        assert!(joined.ends_with("-c:v libx264 -crf 11 -preset slow out.mkv"));
    }

    #[test]
    fn test_frame_geometry_checked_before_writing() {
        let encoder = FfmpegEncoder::new(settings(BitDepth::Eight), Path::new("out.mkv"));
        assert!(encoder
            .check_frame(&Frame::from_rgb8(0, RgbImage::new(4, 2)))
            .is_ok());
        assert!(matches!(
            encoder.check_frame(&Frame::from_rgb8(0, RgbImage::new(2, 2))),
            Err(SinkError::FrameMismatch { .. })
        ));
    }

    #[test]
    fn test_write_before_open_rejected() {
        let mut encoder = FfmpegEncoder::new(settings(BitDepth::Eight), Path::new("out.mkv"));
        assert!(matches!(
            encoder.write_frame(Frame::from_rgb8(0, RgbImage::new(4, 2))),
            Err(SinkError::NotStarted)
        ));
        assert!(encoder.finalizer().is_none());
    }

    #[cfg(unix)]
    mod fake_encoder {
        use super::*;
        use crate::pipeline::worker::StopOutcome;
        use crate::sink::{FrameSink, QueuedSink};
        use crate::subprocess::fake_ffmpeg;
        use std::os::unix::process::ExitStatusExt;

        fn encoder(dir: &std::path::Path, body: &str) -> FfmpegEncoder {
            let settings = EncoderSettings {
                ffmpeg: fake_ffmpeg(dir, body),
                width: 1,
                height: 1,
                ..settings(BitDepth::Eight)
            };
            FfmpegEncoder::new(settings, &dir.join("out.mkv"))
        }

        /// Script prefix that installs `trap` and then marks the script ready.
        fn trapping(dir: &std::path::Path, trap: &str) -> String {
            format!("trap {trap} INT; touch '{}'", dir.join("ready").display())
        }

        fn wait_until_ready(dir: &std::path::Path) {
            let deadline = Instant::now() + Duration::from_secs(5);
            while !dir.join("ready").exists() {
                assert!(Instant::now() < deadline, "script never installed its trap");
                std::thread::sleep(Duration::from_millis(10));
            }
        }

        fn wait_for_exit(encoder: &FfmpegEncoder, limit: Duration) -> std::process::ExitStatus {
            let child = encoder.child.as_ref().unwrap();
            let deadline = Instant::now() + limit;
            loop {
                if let Some(status) = child.lock().unwrap().try_wait().unwrap() {
                    return status;
                }
                assert!(Instant::now() < deadline, "encoder still running");
                std::thread::sleep(Duration::from_millis(20));
            }
        }

        #[test]
        fn test_clean_finish() {
            let dir = tempfile::tempdir().unwrap();
            let mut encoder = encoder(dir.path(), "cat > /dev/null");
            encoder.open().unwrap();
            encoder.write_frame(Frame::from_rgb8(0, RgbImage::new(1, 1))).unwrap();
            encoder.finish().unwrap();
        }

        #[test]
        fn test_failed_encode_reports_stderr_tail() {
            let dir = tempfile::tempdir().unwrap();
            let mut encoder = encoder(
                dir.path(),
                "cat > /dev/null; head -c 200000 /dev/zero >&2; echo >&2; echo 'Unknown encoder' >&2; exit 1",
            );
            encoder.open().unwrap();
            encoder.write_frame(Frame::from_rgb8(0, RgbImage::new(1, 1))).unwrap();
            match encoder.finish() {
                Err(SinkError::Encode(message)) => {
                    assert!(message.contains("Unknown encoder"), "{message}");
                }
                other => panic!("expected encode error, got {other:?}"),
            }
        }

        #[test]
        fn test_finalizer_stops_encoder_that_honours_sigint() {
            let dir = tempfile::tempdir().unwrap();
            let body = format!(
                "{}; while :; do sleep 0.05; done",
                trapping(dir.path(), "'exit 0'")
            );
            let mut encoder = encoder(dir.path(), &body);
            encoder.open().unwrap();
            wait_until_ready(dir.path());
            let mut finalizer = encoder.finalizer().unwrap();

            let started = Instant::now();
            finalizer.force_finalize(Duration::from_secs(5)).unwrap();
            assert!(started.elapsed() < Duration::from_secs(5));
            assert!(wait_for_exit(&encoder, Duration::from_secs(2)).success());
        }

        #[test]
        fn test_finalizer_kills_encoder_ignoring_sigint() {
            let dir = tempfile::tempdir().unwrap();
            let body = format!("{}; exec sleep 30", trapping(dir.path(), "''"));
            let mut encoder = encoder(dir.path(), &body);
            encoder.open().unwrap();
            wait_until_ready(dir.path());
            let mut finalizer = encoder.finalizer().unwrap();

            let started = Instant::now();
            finalizer.force_finalize(Duration::from_millis(200)).unwrap();
            assert!(started.elapsed() >= Duration::from_millis(200));
            let status = wait_for_exit(&encoder, Duration::from_secs(2));
            assert_eq!(status.signal(), Some(Signal::SIGKILL as i32));
        }

        #[test]
        fn test_stuck_encoder_times_out_sink_stop() {
            let dir = tempfile::tempdir().unwrap();
            let mut sink = QueuedSink::new(encoder(dir.path(), "trap '' INT; exec sleep 30"), 2);
            sink.start().unwrap();

            let started = Instant::now();
            assert_eq!(
                sink.stop(Duration::from_millis(200)).unwrap(),
                StopOutcome::TimedOut
            );
            assert!(started.elapsed() < Duration::from_secs(5));
        }
    }
}
