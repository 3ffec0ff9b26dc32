//! Video decode through an `ffmpeg` child process emitting raw RGB frames.

use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use super::{Decoded, DecodedQueue, Frame, FrameRate, FrameSource, PixelFormat, StreamInfo};
use crate::error::SourceError;
use crate::pipeline::worker::{StopOutcome, Worker};
use crate::subprocess::{spawn_detached, StderrTail};

/// How long the decode worker waits for ffmpeg's stderr to close after exit.
const STDERR_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    nb_frames: Option<String>,
    duration: Option<String>,
}

/// Probe pass: resolution, average frame rate and a frame-count estimate of
/// the first video stream.
#[instrument]
pub fn probe_video(ffprobe: &str, path: &Path) -> Result<StreamInfo, SourceError> {
    let output = Command::new(ffprobe)
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,avg_frame_rate,r_frame_rate,nb_frames,duration",
            "-of",
            "json",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .output()?;

    if !output.status.success() {
        return Err(SourceError::Probe(format!(
            "{} exited with {}: {}",
            ffprobe,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let parsed: ProbeOutput = serde_json::from_slice(&output.stdout)
        .map_err(|e| SourceError::Probe(format!("unreadable ffprobe output: {e}")))?;
    parse_probe(parsed)
}

fn parse_probe(probe: ProbeOutput) -> Result<StreamInfo, SourceError> {
    let stream = probe
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| SourceError::Probe("no video stream".into()))?;

    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => return Err(SourceError::Probe("video stream has no resolution".into())),
    };

    // ffprobe reports "0/0" for unknown average rates.
    let frame_rate = [&stream.avg_frame_rate, &stream.r_frame_rate]
        .into_iter()
        .flatten()
        .find_map(|rate| rate.parse::<FrameRate>().ok())
        .ok_or_else(|| SourceError::Probe("video stream has no frame rate".into()))?;

    let estimated_count = stream
        .nb_frames
        .as_deref()
        .and_then(|n| n.parse::<u64>().ok())
        .or_else(|| {
            let seconds: f64 = stream.duration.as_deref()?.parse().ok()?;
            Some((seconds * frame_rate.as_f64()).round() as u64)
        })
        .unwrap_or(0);

    Ok(StreamInfo {
        width,
        height,
        frame_rate,
        estimated_count,
    })
}

/// Decodes a video file to RGB24 frames at a fixed output rate.
pub struct FfmpegVideoSource {
    ffmpeg: String,
    path: PathBuf,
    info: StreamInfo,
    queue_capacity: usize,
    queue: DecodedQueue,
    child: Option<Arc<Mutex<Child>>>,
    worker: Option<Worker>,
}

impl FfmpegVideoSource {
    /// `info` normally comes from [`probe_video`]; its frame rate is the rate
    /// ffmpeg is asked to produce.
    pub fn new(ffmpeg: &str, path: &Path, info: StreamInfo, queue_capacity: usize) -> Self {
        Self {
            ffmpeg: ffmpeg.to_string(),
            path: path.to_path_buf(),
            info,
            queue_capacity: queue_capacity.max(1),
            queue: DecodedQueue::new(),
            child: None,
            worker: None,
        }
    }

    fn spawn_decoder(&self) -> Result<(Child, StderrTail), SourceError> {
        let mut command = Command::new(&self.ffmpeg);
        command
            .args(["-v", "error", "-nostdin", "-i"])
            .arg(&self.path)
            .args(["-map", "0:v:0", "-r"])
            .arg(self.info.frame_rate.to_string())
            .args(["-f", "rawvideo", "-pix_fmt", PixelFormat::Rgb24.ffmpeg_name(), "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped());

        debug!(?command, "Spawning decoder");
        Ok(spawn_detached(&mut command)?)
    }

    fn kill_decoder(&mut self) {
        if let Some(child) = self.child.take() {
            if let Ok(mut child) = child.lock() {
                if let Ok(None) = child.try_wait() {
                    let _ = child.kill();
                }
                let _ = child.wait();
            }
        }
    }
}

/// Read exactly one frame; `Ok(None)` on a clean end of the stream.
fn read_frame(reader: &mut impl Read, frame_size: usize) -> Result<Option<BytesMut>, SourceError> {
    let mut buf = BytesMut::zeroed(frame_size);
    let mut filled = 0;
    while filled < frame_size {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(SourceError::Decode(format!(
                    "truncated frame: {filled} of {frame_size} bytes"
                )))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Some(buf))
}

fn decode_exit_status(child: &Mutex<Child>, stderr: &mut StderrTail) -> Result<(), SourceError> {
    let status = child
        .lock()
        .map_err(|_| SourceError::Decode("decoder handle poisoned".into()))?
        .wait()?;
    if status.success() {
        return Ok(());
    }
    Err(SourceError::Decode(format!(
        "ffmpeg exited with {status}: {}",
        stderr.text(STDERR_GRACE)
    )))
}

impl FrameSource for FfmpegVideoSource {
    fn start(&mut self) -> Result<(), SourceError> {
        if self.queue.is_open() {
            return Err(SourceError::AlreadyStarted);
        }

        let (mut child, mut stderr) = self.spawn_decoder()?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| SourceError::Decode("decoder stdout not captured".into()))?;
        let child = Arc::new(Mutex::new(child));

        let (width, height) = (self.info.width, self.info.height);
        let frame_size = width as usize * height as usize * PixelFormat::Rgb24.bytes_per_pixel();
        let (tx, rx) = flume::bounded(self.queue_capacity);
        let decoder = Arc::clone(&child);

        let worker = Worker::spawn("video-decoder", move || {
            let mut sequence = 0u64;
            let message = loop {
                match read_frame(&mut stdout, frame_size) {
                    Ok(Some(buf)) => {
                        let frame =
                            Frame::from_raw(sequence, width, height, PixelFormat::Rgb24, buf.freeze());
                        let message = match frame {
                            Ok(frame) => Decoded::Frame(frame),
                            Err(e) => break Decoded::Failed(SourceError::Decode(e.to_string())),
                        };
                        if tx.send(message).is_err() {
                            debug!(frames = sequence, "Decode queue closed, decoder stopping");
                            return;
                        }
                        sequence += 1;
                    }
                    Ok(None) => match decode_exit_status(&decoder, &mut stderr) {
                        Ok(()) => {
                            debug!(frames = sequence, "Decoder reached end of stream");
                            break Decoded::End;
                        }
                        Err(e) => break Decoded::Failed(e),
                    },
                    Err(e) => break Decoded::Failed(e),
                }
            };
            let _ = tx.send(message);
        })?;

        info!(path = %self.path.display(), rate = %self.info.frame_rate, "Video decode started");
        self.queue.open(rx);
        self.child = Some(child);
        self.worker = Some(worker);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        self.queue.recv()
    }

    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn stop(&mut self, timeout: Duration) -> Result<StopOutcome, SourceError> {
        self.queue.close();
        let Some(mut worker) = self.worker.take() else {
            return Ok(StopOutcome::AlreadyStopped);
        };

        // A worker blocked on the pipe only wakes once ffmpeg goes away.
        if !worker.is_finished() {
            self.kill_decoder();
        }
        let outcome = worker.join_timeout(timeout);
        if outcome == StopOutcome::TimedOut {
            warn!("Decoder worker still running after stop");
        }
        self.kill_decoder();
        Ok(outcome)
    }
}

impl Drop for FfmpegVideoSource {
    fn drop(&mut self) {
        self.kill_decoder();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(json: &str) -> Result<StreamInfo, SourceError> {
        parse_probe(serde_json::from_str(json).unwrap())
    }

    #[test]
    fn test_parse_probe_with_frame_count() {
        let info = probe(
            r#"{"streams":[{"width":720,"height":480,"avg_frame_rate":"30000/1001",
                "r_frame_rate":"30000/1001","nb_frames":"300"}]}"#,
        )
        .unwrap();
        assert_eq!((info.width, info.height), (720, 480));
        assert_eq!(info.frame_rate, FrameRate::new(30000, 1001).unwrap());
        assert_eq!(info.estimated_count, 300);
    }

    #[test]
    fn test_parse_probe_falls_back_to_duration_and_real_rate() {
        let info = probe(
            r#"{"streams":[{"width":64,"height":32,"avg_frame_rate":"0/0",
                "r_frame_rate":"25/1","duration":"2.0"}]}"#,
        )
        .unwrap();
        assert_eq!(info.frame_rate, FrameRate::new(25, 1).unwrap());
        assert_eq!(info.estimated_count, 50);
    }

    #[test]
    fn test_parse_probe_without_video_stream() {
        assert!(matches!(
            probe(r#"{"streams":[]}"#),
            Err(SourceError::Probe(_))
        ));
        assert!(matches!(probe(r#"{}"#), Err(SourceError::Probe(_))));
    }

    #[test]
    fn test_read_frame_boundaries() {
        let data = vec![1u8; 10];
        let mut reader = &data[..];
        assert_eq!(read_frame(&mut reader, 5).unwrap().unwrap().len(), 5);
        assert_eq!(read_frame(&mut reader, 5).unwrap().unwrap().len(), 5);
        assert!(read_frame(&mut reader, 5).unwrap().is_none());

        let mut short = &data[..3];
        assert!(matches!(
            read_frame(&mut short, 5),
            Err(SourceError::Decode(_))
        ));
    }

    #[cfg(unix)]
    mod fake_decoder {
        use super::*;
        use crate::subprocess::fake_ffmpeg;

        /// 1x1 RGB source decoding through the script `body`.
        fn source(dir: &Path, body: &str) -> FfmpegVideoSource {
            let info = StreamInfo {
                width: 1,
                height: 1,
                frame_rate: FrameRate::new(25, 1).unwrap(),
                estimated_count: 2,
            };
            FfmpegVideoSource::new(&fake_ffmpeg(dir, body), Path::new("in.mkv"), info, 4)
        }

        /// Pull one frame on a helper thread so a hung decoder fails the test.
        fn next_within(
            mut source: FfmpegVideoSource,
            limit: Duration,
        ) -> (FfmpegVideoSource, Result<Option<Frame>, SourceError>) {
            let (tx, rx) = flume::bounded(1);
            std::thread::spawn(move || {
                let result = source.next_frame();
                let _ = tx.send((source, result));
            });
            rx.recv_timeout(limit).expect("decoder did not deliver in time")
        }

        #[test]
        fn test_frames_then_clean_end() {
            let dir = tempfile::tempdir().unwrap();
            let mut source = source(dir.path(), r"printf '\001\002\003\004\005\006'");
            source.start().unwrap();

            let first = source.next_frame().unwrap().unwrap();
            assert_eq!(&first.data[..], &[1, 2, 3]);
            let second = source.next_frame().unwrap().unwrap();
            assert_eq!((second.sequence(), &second.data[..]), (1, &[4u8, 5, 6][..]));
            assert!(source.next_frame().unwrap().is_none());
            assert_eq!(
                source.stop(Duration::from_secs(5)).unwrap(),
                StopOutcome::Finished
            );
        }

        #[test]
        fn test_stderr_flood_still_delivers_frame() {
            let dir = tempfile::tempdir().unwrap();
            let mut source = source(
                dir.path(),
                r"head -c 200000 /dev/zero >&2; printf '\011\011\011'",
            );
            source.start().unwrap();

            let (mut source, frame) = next_within(source, Duration::from_secs(10));
            assert_eq!(&frame.unwrap().unwrap().data[..], &[9, 9, 9]);
            assert!(source.next_frame().unwrap().is_none());
        }

        #[test]
        fn test_nonzero_exit_is_decode_error_with_stderr_tail() {
            let dir = tempfile::tempdir().unwrap();
            let mut source = source(dir.path(), "echo 'Invalid data found' >&2; exit 3");
            source.start().unwrap();

            match source.next_frame() {
                Err(SourceError::Decode(message)) => {
                    assert!(message.contains("Invalid data found"), "{message}");
                }
                other => panic!("expected decode error, got {other:?}"),
            }
        }

        #[test]
        fn test_truncated_frame_is_decode_error() {
            let dir = tempfile::tempdir().unwrap();
            let mut source = source(dir.path(), r"printf '\001\002\003\004'");
            source.start().unwrap();

            assert!(source.next_frame().unwrap().is_some());
            match source.next_frame() {
                Err(SourceError::Decode(message)) => assert!(message.contains("truncated")),
                other => panic!("expected truncated frame, got {other:?}"),
            }
        }

        #[test]
        fn test_stop_while_decoder_blocked() {
            let dir = tempfile::tempdir().unwrap();
            let mut source = source(dir.path(), "exec sleep 30");
            source.start().unwrap();

            let started = std::time::Instant::now();
            assert_eq!(
                source.stop(Duration::from_secs(5)).unwrap(),
                StopOutcome::Finished
            );
            assert!(started.elapsed() < Duration::from_secs(5));
            assert_eq!(
                source.stop(Duration::from_secs(5)).unwrap(),
                StopOutcome::AlreadyStopped
            );
        }
    }
}
