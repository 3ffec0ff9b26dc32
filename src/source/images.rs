//! Ordered still-image input.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, instrument};

use super::{Decoded, DecodedQueue, Frame, FrameRate, FrameSource, StreamInfo};
use crate::error::SourceError;
use crate::pipeline::worker::{StopOutcome, Worker};

/// Reads a list of image files in order, one frame per file.
pub struct ImageSequenceSource {
    paths: Vec<PathBuf>,
    info: StreamInfo,
    queue_capacity: usize,
    queue: DecodedQueue,
    worker: Option<Worker>,
}

impl ImageSequenceSource {
    /// Probe the first image for the stream resolution.
    ///
    /// An empty list is valid and yields an empty stream with a 0x0 resolution.
    #[instrument(skip(paths), fields(images = paths.len()))]
    pub fn new(
        paths: Vec<PathBuf>,
        frame_rate: FrameRate,
        queue_capacity: usize,
    ) -> Result<Self, SourceError> {
        let (width, height) = match paths.first() {
            Some(first) => image::image_dimensions(first).map_err(|source| SourceError::Image {
                path: first.clone(),
                source,
            })?,
            None => (0, 0),
        };

        info!(width, height, "Image sequence opened");

        Ok(Self {
            info: StreamInfo {
                width,
                height,
                frame_rate,
                estimated_count: paths.len() as u64,
            },
            paths,
            queue_capacity: queue_capacity.max(1),
            queue: DecodedQueue::new(),
            worker: None,
        })
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

fn read_image(sequence: u64, path: &Path) -> Result<Frame, SourceError> {
    let image = image::open(path).map_err(|source| SourceError::Image {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Frame::from_rgb8(sequence, image.into_rgb8()))
}

impl FrameSource for ImageSequenceSource {
    fn start(&mut self) -> Result<(), SourceError> {
        if self.queue.is_open() {
            return Err(SourceError::AlreadyStarted);
        }

        let (tx, rx) = flume::bounded(self.queue_capacity);
        let paths = self.paths.clone();
        let worker = Worker::spawn("image-reader", move || {
            for (sequence, path) in paths.iter().enumerate() {
                let message = match read_image(sequence as u64, path) {
                    Ok(frame) => Decoded::Frame(frame),
                    Err(e) => {
                        let _ = tx.send(Decoded::Failed(e));
                        return;
                    }
                };
                if tx.send(message).is_err() {
                    debug!("Image queue closed, reader stopping");
                    return;
                }
            }
            let _ = tx.send(Decoded::End);
        })?;

        self.queue.open(rx);
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
        Ok(match self.worker.take() {
            Some(mut worker) => worker.join_timeout(timeout),
            None => StopOutcome::AlreadyStopped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn write_images(dir: &Path, count: u8) -> Vec<PathBuf> {
        (0..count)
            .map(|i| {
                let path = dir.join(format!("frame_{i:03}.png"));
                RgbImage::from_pixel(4, 3, Rgb([i, i, i])).save(&path).unwrap();
                path
            })
            .collect()
    }

    #[test]
    fn test_reads_images_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_images(dir.path(), 3);
        let mut source = ImageSequenceSource::new(paths, FrameRate::NTSC_FILM, 1).unwrap();
        assert_eq!(source.resolution(), (4, 3));
        assert_eq!(source.estimated_count(), 3);

        source.start().unwrap();
        assert!(matches!(source.start(), Err(SourceError::AlreadyStarted)));

        for i in 0..3u8 {
            let frame = source.next_frame().unwrap().unwrap();
            assert_eq!(frame.sequence(), i as u64);
            assert_eq!(frame.data[0], i);
        }
        assert!(source.next_frame().unwrap().is_none());
        assert_eq!(
            source.stop(Duration::from_secs(5)).unwrap(),
            StopOutcome::Finished
        );
    }

    #[test]
    fn test_unreadable_image_is_an_error_not_end_of_stream() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = write_images(dir.path(), 1);
        let broken = dir.path().join("broken.png");
        std::fs::write(&broken, b"not a png").unwrap();
        paths.push(broken);

        let mut source = ImageSequenceSource::new(paths, FrameRate::NTSC_FILM, 4).unwrap();
        source.start().unwrap();
        assert!(source.next_frame().unwrap().is_some());
        assert!(matches!(
            source.next_frame(),
            Err(SourceError::Image { .. })
        ));
        source.stop(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_stop_unblocks_reader_on_full_queue() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_images(dir.path(), 6);
        let mut source = ImageSequenceSource::new(paths, FrameRate::NTSC_FILM, 1).unwrap();
        source.start().unwrap();
        source.next_frame().unwrap();
        assert_eq!(
            source.stop(Duration::from_secs(5)).unwrap(),
            StopOutcome::Finished
        );
    }

    #[test]
    fn test_empty_sequence_ends_immediately() {
        let mut source = ImageSequenceSource::new(Vec::new(), FrameRate::NTSC_FILM, 2).unwrap();
        assert_eq!(source.resolution(), (0, 0));
        source.start().unwrap();
        assert!(source.next_frame().unwrap().is_none());
    }
}
