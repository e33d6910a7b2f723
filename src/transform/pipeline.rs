use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

use crate::{error::TransformError, model::frame::VideoFrame, transform::FrameTransformer};

/// Frame counters for one pipeline run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub frames_in: u64,
    pub frames_out: u64,
    /// Frames released without producing output (no device).
    pub frames_dropped: u64,
}

/// Pulls frames from `source`, transforms them and pushes the results into
/// `sink`, strictly in order.
///
/// On the first failure the source is cancelled (buffered frames are
/// released), the sink is aborted and the transformer's GPU resources are
/// freed before the error is returned.
pub async fn pipe_through(
    mut source: mpsc::Receiver<VideoFrame>,
    transformer: &mut FrameTransformer,
    sink: mpsc::Sender<VideoFrame>,
) -> Result<PipelineStats, TransformError> {
    let mut stats = PipelineStats::default();

    while let Some(frame) = source.recv().await {
        stats.frames_in += 1;

        let step = match transformer.transform(frame).await {
            Ok(Some(output)) => match sink.send(output).await {
                Ok(()) => {
                    stats.frames_out += 1;
                    Ok(())
                }
                Err(_) => Err(TransformError::SinkClosed),
            },
            Ok(None) => {
                stats.frames_dropped += 1;
                Ok(())
            }
            Err(e) => Err(e),
        };

        if let Err(e) = step {
            warn!("Aborting transform pipeline after {} frames: {}", stats.frames_in, e);
            source.close();
            while let Ok(pending) = source.try_recv() {
                pending.close();
            }
            drop(sink);
            transformer.destroy();
            return Err(e);
        }
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;
    use crate::transform::tests::{mock, tracked_frame};

    #[tokio::test]
    async fn frames_flow_in_order() {
        let (mut transformer, calls) = mock(None);
        let released = Arc::new(AtomicUsize::new(0));
        let (src_tx, src_rx) = mpsc::channel(8);
        let (sink_tx, mut sink_rx) = mpsc::channel(8);

        for ts in 0..5 {
            src_tx.send(tracked_frame(ts, 2, 2, &released)).await.unwrap();
        }
        drop(src_tx);

        let stats = pipe_through(src_rx, &mut transformer, sink_tx).await.unwrap();

        assert_eq!(stats.frames_in, 5);
        assert_eq!(stats.frames_out, 5);
        assert_eq!(calls.lock().unwrap().draws, 5);
        assert_eq!(released.load(Ordering::SeqCst), 5);

        let mut timestamps = vec![];
        while let Some(out) = sink_rx.recv().await {
            timestamps.push(out.timestamp());
        }
        assert_eq!(timestamps, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn failure_cancels_source_and_frees_gpu() {
        let (mut transformer, calls) = mock(Some(3));
        let released = Arc::new(AtomicUsize::new(0));
        let (src_tx, src_rx) = mpsc::channel(8);
        let (sink_tx, mut sink_rx) = mpsc::channel(8);

        for ts in 0..6 {
            src_tx.send(tracked_frame(ts, 2, 2, &released)).await.unwrap();
        }

        let err = pipe_through(src_rx, &mut transformer, sink_tx).await.unwrap_err();

        assert!(matches!(err, TransformError::Render(_)));
        // Three consumed by the transformer, three released by the cancel.
        assert_eq!(released.load(Ordering::SeqCst), 6);
        assert_eq!(calls.lock().unwrap().destroyed, 1);
        assert!(src_tx.send(tracked_frame(9, 2, 2, &released)).await.is_err());

        let mut delivered = 0;
        while sink_rx.recv().await.is_some() {
            delivered += 1;
        }
        assert_eq!(delivered, 2);
    }

    #[tokio::test]
    async fn closed_sink_aborts_pipeline() {
        let (mut transformer, _) = mock(None);
        let released = Arc::new(AtomicUsize::new(0));
        let (src_tx, src_rx) = mpsc::channel(8);
        let (sink_tx, sink_rx) = mpsc::channel(8);
        drop(sink_rx);

        for ts in 0..3 {
            src_tx.send(tracked_frame(ts, 2, 2, &released)).await.unwrap();
        }

        let err = pipe_through(src_rx, &mut transformer, sink_tx).await.unwrap_err();

        assert!(matches!(err, TransformError::SinkClosed));
        assert_eq!(released.load(Ordering::SeqCst), 3);
        assert!(!transformer.is_supported());
    }

    #[tokio::test]
    async fn unsupported_device_drops_every_frame() {
        let mut transformer = FrameTransformer::unsupported();
        let released = Arc::new(AtomicUsize::new(0));
        let (src_tx, src_rx) = mpsc::channel(8);
        let (sink_tx, mut sink_rx) = mpsc::channel(8);

        for ts in 0..4 {
            src_tx.send(tracked_frame(ts, 2, 2, &released)).await.unwrap();
        }
        drop(src_tx);

        let stats = pipe_through(src_rx, &mut transformer, sink_tx).await.unwrap();

        assert_eq!(stats.frames_dropped, 4);
        assert_eq!(stats.frames_out, 0);
        assert_eq!(released.load(Ordering::SeqCst), 4);
        assert!(sink_rx.recv().await.is_none());
    }
}
