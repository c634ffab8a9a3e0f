//! Voice-note capture as a scoped resource.
//!
//! A [`RecordingSession`] owns the capture device from `start` until it is
//! finished, cancelled or dropped. The device is released exactly once on
//! every one of those paths, including when starting fails.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::{debug, info, warn};

use crate::error::ClientError;

/// A platform audio input.
pub trait AudioCapture: Send {
    fn start(&mut self) -> Result<(), ClientError>;

    /// Stop capturing and return the encoded clip.
    fn stop(&mut self) -> Result<Vec<u8>, ClientError>;

    /// Give the device back to the platform.
    fn release(&mut self);

    /// MIME type of the clip returned by [`AudioCapture::stop`].
    fn mime_type(&self) -> &str;
}

pub struct RecordingSession<C: AudioCapture> {
    capture: C,
    released: bool,
}

impl<C: AudioCapture> RecordingSession<C> {
    pub fn start(mut capture: C) -> Result<Self, ClientError> {
        if let Err(e) = capture.start() {
            warn!(error = %e, "audio capture failed to start");
            capture.release();
            return Err(e);
        }
        debug!("audio capture started");
        Ok(Self {
            capture,
            released: false,
        })
    }

    /// Stop recording and return the clip as a `data:` URL, ready to send as
    /// an audio message.
    pub fn finish(mut self) -> Result<String, ClientError> {
        let clip = self.capture.stop();
        self.release();
        let clip = clip?;
        info!(bytes = clip.len(), "voice note recorded");
        Ok(format!(
            "data:{};base64,{}",
            self.capture.mime_type(),
            STANDARD.encode(clip)
        ))
    }

    /// Discard the recording.
    pub fn cancel(mut self) {
        if let Err(e) = self.capture.stop() {
            debug!(error = %e, "stop on cancel failed");
        }
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.capture.release();
        }
    }
}

impl<C: AudioCapture> Drop for RecordingSession<C> {
    fn drop(&mut self) {
        self.release();
    }
}
