//! Physical capture abstraction
//!
//! An [`InputDevice`] is the audio host (driver); it hands out
//! [`InputStream`]s. Streams are shared across threads behind `Arc`, so all
//! methods take `&self`.

use std::sync::Arc;
use std::time::Duration;

use crate::Result;

/// What a stream is opened for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRole {
    /// User-turn recording
    Capture,
    /// Low-rate barge-in monitoring while the assistant speaks
    Monitor,
}

/// Parameters for opening a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSpec {
    /// Capture or monitor
    pub role: StreamRole,
    /// Rate the reader wants samples delivered at
    pub sample_rate: u32,
    /// Requested driver block size; `None` leaves it to the driver
    pub block_frames: Option<u32>,
    /// Require an exact mono config at `sample_rate` instead of converting
    pub exact_format: bool,
}

impl StreamSpec {
    /// Fixed block size, exact mono format
    #[must_use]
    pub const fn rich(role: StreamRole, sample_rate: u32) -> Self {
        Self {
            role,
            sample_rate,
            block_frames: Some(1024),
            exact_format: true,
        }
    }

    /// Driver defaults, converted to the requested rate after capture
    #[must_use]
    pub const fn minimal(role: StreamRole, sample_rate: u32) -> Self {
        Self {
            role,
            sample_rate,
            block_frames: None,
            exact_format: false,
        }
    }
}

/// Audio host that can be (re)initialized and opens streams
pub trait InputDevice: Send + Sync {
    /// Bring the host up; safe to call after [`InputDevice::terminate`]
    ///
    /// # Errors
    ///
    /// Returns error if the audio host is unavailable
    fn initialize(&self) -> Result<()>;

    /// Release the host
    fn terminate(&self);

    /// Open a stream; it is returned stopped
    ///
    /// # Errors
    ///
    /// Returns error if no device matches or the driver refuses the spec
    fn open(&self, device_id: Option<&str>, spec: StreamSpec) -> Result<Arc<dyn InputStream>>;

    /// Human-readable input device names
    fn list_devices(&self) -> Vec<String>;
}

/// An open capture stream
pub trait InputStream: Send + Sync {
    /// Start delivering samples
    ///
    /// # Errors
    ///
    /// Returns error if the driver fails to start the stream
    fn start(&self) -> Result<()>;

    /// Stop delivering samples; buffered samples are discarded
    ///
    /// # Errors
    ///
    /// Returns error if the driver fails to stop the stream
    fn stop(&self) -> Result<()>;

    /// Close the stream; further calls fail
    fn close(&self);

    /// Whether the stream is started
    fn is_active(&self) -> bool;

    /// Read exactly `frames` mono samples, waiting at most `timeout`
    ///
    /// # Errors
    ///
    /// Returns error if the stream is stopped, closed or the read times out
    fn read(&self, frames: usize, timeout: Duration) -> Result<Vec<f32>>;

    /// Rate of the samples returned by [`InputStream::read`]
    fn sample_rate(&self) -> u32;
}
