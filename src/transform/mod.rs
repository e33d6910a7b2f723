//! GPU frame transform flow
//!
//! [`FrameTransformer`] owns the render device and applies a fixed shader to
//! every frame it is given. Frames go in one at a time and come out in the same
//! order with the same timestamps. The input frame is always released, whether
//! or not rendering succeeded.

pub mod pipeline;
pub mod renderer;
pub mod source;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::{config::CaptureConfig, error::TransformError, model::frame::VideoFrame};

use self::{
    pipeline::{pipe_through, PipelineStats},
    renderer::WgpuRenderer,
    source::{spawn_test_pattern, FrameSink},
};

/// The render seam: everything the transformer needs from a GPU.
#[async_trait]
pub trait FrameRenderer: Send {
    /// (Re)configures the drawing surface for frames of the given size.
    fn configure(&mut self, width: u32, height: u32) -> Result<(), TransformError>;

    /// Binds `frame` as a texture, issues one draw call and returns the
    /// rendered RGBA8 pixels once the submission has completed.
    async fn draw(&mut self, frame: &VideoFrame) -> Result<Vec<u8>, TransformError>;

    /// Frees the static buffers and un-configures the surface.
    fn destroy(&mut self);
}

pub struct FrameTransformer {
    renderer: Option<Box<dyn FrameRenderer>>,
    size: Option<(u32, u32)>,
}

impl FrameTransformer {
    /// Acquires the GPU. On failure the error is reported and an unsupported
    /// transformer is returned, which releases every frame without rendering.
    pub async fn init() -> Self {
        match WgpuRenderer::new().await {
            Ok(renderer) => Self::with_renderer(Box::new(renderer)),
            Err(e) => {
                error!("{}", e);
                error!("This host does not support GPU rendering; frames will be dropped.");
                Self::unsupported()
            }
        }
    }

    pub fn with_renderer(renderer: Box<dyn FrameRenderer>) -> Self {
        Self {
            renderer: Some(renderer),
            size: None,
        }
    }

    pub fn unsupported() -> Self {
        Self {
            renderer: None,
            size: None,
        }
    }

    pub fn is_supported(&self) -> bool {
        self.renderer.is_some()
    }

    pub fn set_size(&mut self, width: u32, height: u32) -> Result<(), TransformError> {
        let Some(renderer) = self.renderer.as_mut() else {
            return Err(TransformError::GpuUnsupported("transformer has no device".to_string()));
        };
        renderer.configure(width, height)?;
        self.size = Some((width, height));
        Ok(())
    }

    /// Transforms one frame.
    ///
    /// Returns `Ok(None)` when there is no device: the frame is released and
    /// nothing is produced. The input frame is consumed in every case.
    pub async fn transform(&mut self, frame: VideoFrame) -> Result<Option<VideoFrame>, TransformError> {
        if self.renderer.is_none() {
            frame.close();
            return Ok(None);
        }

        let (width, height) = frame.dimensions();
        if self.size != Some((width, height)) {
            if let Err(e) = self.set_size(width, height) {
                frame.close();
                return Err(e);
            }
        }

        let timestamp = frame.timestamp();
        let rendered = match self.renderer.as_mut() {
            Some(renderer) => renderer.draw(&frame).await,
            None => Err(TransformError::Render("renderer went away".to_string())),
        };
        frame.close();

        let output = VideoFrame::new(timestamp, width, height, rendered?)?;
        debug!("Transformed frame ts={}", timestamp);
        Ok(Some(output))
    }

    /// Releases all GPU resources. Later frames are released unrendered.
    pub fn destroy(&mut self) {
        if let Some(mut renderer) = self.renderer.take() {
            renderer.destroy();
        }
        self.size = None;
    }
}

impl Drop for FrameTransformer {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Runs the transform demo: synthetic camera -> GPU transform -> logging sink.
pub async fn run(capture: CaptureConfig) -> Result<PipelineStats, TransformError> {
    info!(
        "Starting transform: {}x{} @ {} fps, frames: {:?}",
        capture.width, capture.height, capture.fps, capture.frames
    );

    let (source, producer) = spawn_test_pattern(capture);
    let (sink_tx, sink) = FrameSink::spawn(capture.fps as usize);

    let mut transformer = FrameTransformer::init().await;
    let result = pipe_through(source, &mut transformer, sink_tx).await;
    transformer.destroy();

    if let Err(e) = producer.await {
        warn!("Capture task ended abnormally: {}", e);
    }
    let delivered = sink.finish().await;

    match &result {
        Ok(stats) => info!(
            "Transform finished: {} frames in, {} out, {} delivered",
            stats.frames_in, stats.frames_out, delivered
        ),
        Err(e) => error!("Transform pipeline failed: {}", e),
    }

    result
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    use tokio::sync::oneshot;

    use super::*;
    use crate::model::frame::frame_len;

    /// Records what the transformer asks of the GPU.
    #[derive(Default)]
    pub(crate) struct Calls {
        pub configures: Vec<(u32, u32)>,
        pub draws: usize,
        pub destroyed: usize,
    }

    pub(crate) struct MockRenderer {
        pub calls: Arc<Mutex<Calls>>,
        /// Draw number (1-based) that fails.
        pub fail_on: Option<usize>,
        /// Completion signal the first draw waits for, like a GPU submission.
        pub gate: Option<oneshot::Receiver<()>>,
    }

    #[async_trait]
    impl FrameRenderer for MockRenderer {
        fn configure(&mut self, width: u32, height: u32) -> Result<(), TransformError> {
            self.calls.lock().unwrap().configures.push((width, height));
            Ok(())
        }

        async fn draw(&mut self, frame: &VideoFrame) -> Result<Vec<u8>, TransformError> {
            if let Some(gate) = self.gate.take() {
                let _ = gate.await;
            }
            let mut calls = self.calls.lock().unwrap();
            calls.draws += 1;
            if Some(calls.draws) == self.fail_on {
                return Err(TransformError::Render("injected".to_string()));
            }
            // Invert the pixels so output is distinguishable from input.
            Ok(frame.data().iter().map(|b| 255 - b).collect())
        }

        fn destroy(&mut self) {
            self.calls.lock().unwrap().destroyed += 1;
        }
    }

    pub(crate) fn mock(fail_on: Option<usize>) -> (FrameTransformer, Arc<Mutex<Calls>>) {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let renderer = MockRenderer {
            calls: calls.clone(),
            fail_on,
            gate: None,
        };
        (FrameTransformer::with_renderer(Box::new(renderer)), calls)
    }

    pub(crate) fn tracked_frame(ts: i64, w: u32, h: u32, released: &Arc<AtomicUsize>) -> VideoFrame {
        let released = released.clone();
        VideoFrame::new(ts, w, h, vec![10; frame_len(w, h)])
            .unwrap()
            .with_release_hook(move |_| {
                released.fetch_add(1, Ordering::SeqCst);
            })
    }

    #[tokio::test]
    async fn output_keeps_input_timestamp() {
        let (mut transformer, _) = mock(None);
        let released = Arc::new(AtomicUsize::new(0));

        for ts in [0, 33_333, 66_666] {
            let out = transformer
                .transform(tracked_frame(ts, 4, 2, &released))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(out.timestamp(), ts);
            assert_eq!(out.dimensions(), (4, 2));
            assert_eq!(out.data()[0], 245);
        }

        assert_eq!(released.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failed_render_still_releases_input() {
        let (mut transformer, calls) = mock(Some(2));
        let released = Arc::new(AtomicUsize::new(0));

        assert!(transformer.transform(tracked_frame(1, 2, 2, &released)).await.is_ok());
        assert!(transformer.transform(tracked_frame(2, 2, 2, &released)).await.is_err());
        assert!(transformer.transform(tracked_frame(3, 2, 2, &released)).await.is_ok());

        assert_eq!(released.load(Ordering::SeqCst), 3);
        assert_eq!(calls.lock().unwrap().draws, 3);
    }

    #[tokio::test]
    async fn unsupported_releases_without_drawing() {
        let mut transformer = FrameTransformer::unsupported();
        let released = Arc::new(AtomicUsize::new(0));

        let out = transformer
            .transform(tracked_frame(0, 2, 2, &released))
            .await
            .unwrap();

        assert!(out.is_none());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn surface_is_resized_only_on_dimension_change() {
        let (mut transformer, calls) = mock(None);
        let released = Arc::new(AtomicUsize::new(0));

        for (w, h) in [(4, 4), (4, 4), (8, 2), (8, 2), (4, 4)] {
            transformer
                .transform(tracked_frame(0, w, h, &released))
                .await
                .unwrap();
        }

        assert_eq!(calls.lock().unwrap().configures, vec![(4, 4), (8, 2), (4, 4)]);
    }

    #[tokio::test]
    async fn destroy_frees_once_and_disables_rendering() {
        let (mut transformer, calls) = mock(None);
        let released = Arc::new(AtomicUsize::new(0));

        transformer.destroy();
        transformer.destroy();
        let out = transformer
            .transform(tracked_frame(0, 2, 2, &released))
            .await
            .unwrap();

        assert!(out.is_none());
        assert!(!transformer.is_supported());
        let calls = calls.lock().unwrap();
        assert_eq!(calls.destroyed, 1);
        assert_eq!(calls.draws, 0);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pending_render_lets_other_tasks_run() {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let (done_tx, done_rx) = oneshot::channel();
        let mut transformer = FrameTransformer::with_renderer(Box::new(MockRenderer {
            calls: calls.clone(),
            fail_on: None,
            gate: Some(done_rx),
        }));
        let released = Arc::new(AtomicUsize::new(0));

        // Only runs if the transform suspends while its draw is pending.
        tokio::spawn(async move {
            let _ = done_tx.send(());
        });

        let out = transformer
            .transform(tracked_frame(7, 2, 2, &released))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(out.timestamp(), 7);
        assert_eq!(calls.lock().unwrap().draws, 1);
    }
}
