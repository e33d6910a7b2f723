//! Video frames flowing through the transform pipeline
//!
//! A [`VideoFrame`] owns its pixels. Whoever holds the frame last is
//! responsible for releasing it, either explicitly with [`VideoFrame::close`]
//! or implicitly by dropping it. An optional release hook observes that moment
//! and fires exactly once per frame.

use std::fmt;

use crate::error::TransformError;

/// Bytes per pixel of the RGBA8 layout used everywhere in the pipeline.
pub const BYTES_PER_PIXEL: usize = 4;

type ReleaseHook = Box<dyn FnOnce(i64) + Send + Sync>;

/// One timestamped RGBA8 image sample.
pub struct VideoFrame {
    /// Presentation timestamp in microseconds.
    timestamp: i64,
    width: u32,
    height: u32,
    data: Vec<u8>,
    on_release: Option<ReleaseHook>,
}

impl VideoFrame {
    /// Creates a frame from tightly packed RGBA8 pixels.
    pub fn new(timestamp: i64, width: u32, height: u32, data: Vec<u8>) -> Result<Self, TransformError> {
        if width == 0 || height == 0 || data.len() != frame_len(width, height) {
            return Err(TransformError::InvalidFrame {
                width,
                height,
                len: data.len(),
            });
        }

        Ok(Self {
            timestamp,
            width,
            height,
            data,
            on_release: None,
        })
    }

    /// Registers a callback invoked with the frame timestamp when the frame is
    /// released.
    pub fn with_release_hook(mut self, hook: impl FnOnce(i64) + Send + Sync + 'static) -> Self {
        self.on_release = Some(Box::new(hook));
        self
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Releases the frame and its pixel buffer.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for VideoFrame {
    fn drop(&mut self) {
        if let Some(hook) = self.on_release.take() {
            hook(self.timestamp);
        }
    }
}

impl fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoFrame")
            .field("timestamp", &self.timestamp)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Size in bytes of a tightly packed RGBA8 frame.
pub fn frame_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * BYTES_PER_PIXEL
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    fn counted_frame(counter: &Arc<AtomicUsize>) -> VideoFrame {
        let counter = counter.clone();
        VideoFrame::new(33_333, 2, 2, vec![0; frame_len(2, 2)])
            .unwrap()
            .with_release_hook(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
    }

    #[test]
    fn close_releases_once() {
        let released = Arc::new(AtomicUsize::new(0));
        counted_frame(&released).close();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_releases_once() {
        let released = Arc::new(AtomicUsize::new(0));
        {
            let _frame = counted_frame(&released);
        }
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rejects_mismatched_buffer() {
        let err = VideoFrame::new(0, 4, 4, vec![0; 10]).unwrap_err();
        assert!(matches!(
            err,
            TransformError::InvalidFrame {
                width: 4,
                height: 4,
                len: 10
            }
        ));
    }
}
