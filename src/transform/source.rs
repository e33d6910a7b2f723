//! Synthetic capture source and the output sink
//!
//! The test pattern stands in for a camera track: it paces frames at the
//! configured rate and stops when its consumer goes away.

use std::time::{Duration, Instant};

use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    config::CaptureConfig,
    error::TransformError,
    model::frame::{frame_len, VideoFrame},
};

/// Frames buffered between the source and the transform.
const SOURCE_QUEUE_DEPTH: usize = 4;

/// Starts the paced test pattern. The task yields the number of frames
/// produced.
pub fn spawn_test_pattern(config: CaptureConfig) -> (mpsc::Receiver<VideoFrame>, JoinHandle<u64>) {
    let (tx, rx) = mpsc::channel(SOURCE_QUEUE_DEPTH);
    let fps = config.fps.max(1);

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_micros(1_000_000 / u64::from(fps)));
        let mut index = 0u64;

        while config.frames.map_or(true, |limit| index < limit) {
            ticker.tick().await;

            let frame = match test_pattern(index, config.width, config.height, fps) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Capture stopped: {}", e);
                    break;
                }
            };

            if tx.send(frame).await.is_err() {
                debug!("Capture consumer went away after {} frames", index);
                break;
            }
            index += 1;
        }

        index
    });

    (rx, handle)
}

/// A moving RGB gradient, one step per frame.
pub fn test_pattern(
    index: u64,
    width: u32,
    height: u32,
    fps: u32,
) -> Result<VideoFrame, TransformError> {
    let shift = (index % 256) as usize;
    let mut data = Vec::with_capacity(frame_len(width, height));

    for y in 0..height as usize {
        for x in 0..width as usize {
            data.push(((x + shift) % 256) as u8);
            data.push(((y + shift) % 256) as u8);
            data.push(shift as u8);
            data.push(u8::MAX);
        }
    }

    let timestamp = (index * 1_000_000 / u64::from(fps.max(1))) as i64;
    VideoFrame::new(timestamp, width, height, data)
}

/// The output end of the pipeline: logs what arrives, then releases it.
pub struct FrameSink {
    handle: JoinHandle<u64>,
}

impl FrameSink {
    /// Spawns the sink. Every `log_every` frames a progress line is logged.
    pub fn spawn(log_every: usize) -> (mpsc::Sender<VideoFrame>, Self) {
        let (tx, mut rx) = mpsc::channel::<VideoFrame>(SOURCE_QUEUE_DEPTH);
        let log_every = log_every.max(1) as u64;

        let handle = tokio::spawn(async move {
            let started = Instant::now();
            let mut size = None;
            let mut received = 0u64;

            while let Some(frame) = rx.recv().await {
                if size.is_none() {
                    info!(
                        "Output video started: {}x{}, setup time: {:.3}ms",
                        frame.width(),
                        frame.height(),
                        started.elapsed().as_secs_f64() * 1000.0
                    );
                } else if size != Some(frame.dimensions()) {
                    info!("Output video size changed to {}x{}", frame.width(), frame.height());
                }
                size = Some(frame.dimensions());
                received += 1;

                if received % log_every == 0 {
                    debug!("Output frame #{} ts={}", received, frame.timestamp());
                }
                frame.close();
            }

            received
        });

        (tx, Self { handle })
    }

    /// Waits for the sink to drain and returns how many frames it received.
    pub async fn finish(self) -> u64 {
        match self.handle.await {
            Ok(received) => received,
            Err(e) => {
                warn!("Output sink ended abnormally: {}", e);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bounded_pattern_is_paced_and_ordered() {
        let config = CaptureConfig {
            width: 4,
            height: 2,
            fps: 1000,
            frames: Some(5),
        };

        let (mut rx, handle) = spawn_test_pattern(config);
        let mut timestamps = vec![];
        while let Some(frame) = rx.recv().await {
            assert_eq!(frame.dimensions(), (4, 2));
            timestamps.push(frame.timestamp());
        }

        assert_eq!(timestamps, vec![0, 1000, 2000, 3000, 4000]);
        assert_eq!(handle.await.unwrap(), 5);
    }

    #[tokio::test]
    async fn pattern_stops_when_consumer_leaves() {
        let config = CaptureConfig {
            width: 2,
            height: 2,
            fps: 1000,
            frames: None,
        };

        let (mut rx, handle) = spawn_test_pattern(config);
        rx.recv().await.unwrap();
        drop(rx);

        assert!(handle.await.unwrap() >= 1);
    }

    #[tokio::test]
    async fn sink_counts_and_releases() {
        let (tx, sink) = FrameSink::spawn(1);
        for index in 0..3 {
            tx.send(test_pattern(index, 2, 2, 30).unwrap()).await.unwrap();
        }
        drop(tx);

        assert_eq!(sink.finish().await, 3);
    }

    #[test]
    fn pattern_shifts_each_frame() {
        let first = test_pattern(0, 2, 1, 30).unwrap();
        let second = test_pattern(1, 2, 1, 30).unwrap();

        assert_eq!(&first.data()[..4], &[0, 0, 0, 255]);
        assert_eq!(&second.data()[..4], &[1, 1, 1, 255]);
        assert_eq!(second.timestamp(), 33_333);
    }
}
