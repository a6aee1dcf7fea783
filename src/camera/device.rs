//! Abstract camera-driver seam
//!
//! The platform driver (libcamera on the capture nodes) stays behind this
//! trait: it hands out DMA-backed plane descriptors and reusable requests
//! addressed by a cookie, and reports completions from its own thread. The
//! capture pipeline owns everything above this line (plane mappings, the
//! frame pool, back-pressure), so the driver surface stays minimal.

use std::os::unix::io::RawFd;

use super::CameraError;

/// Outcome of validating a requested stream configuration.
///
/// `Adjusted` means the driver silently substituted parameters; the capture
/// fleet treats that the same as `Invalid`, because a node recording at an
/// unexpected geometry poisons the whole frameset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigStatus {
    Valid,
    Adjusted,
    Invalid,
}

/// Requested video-recording stream: YUV420, fixed geometry, M DMA buffers.
#[derive(Clone, Copy, Debug)]
pub struct StreamFormat {
    pub width: u32,
    pub height: u32,
    pub buffer_count: usize,
}

/// One plane of a DMA buffer as exposed by the driver.
#[derive(Clone, Copy, Debug)]
pub struct PlaneDesc {
    pub fd: RawFd,
    pub offset: u64,
    pub len: usize,
}

/// Fixed capture controls applied once before the device starts.
///
/// Everything automatic is pinned: auto-exposure, auto-white-balance and
/// HDR off, exposure and gain explicit, focus manual. Deterministic capture
/// latency matters more than image quality here.
#[derive(Clone, Copy, Debug)]
pub struct CaptureControls {
    pub frame_duration_ns: (i64, i64),
    pub exposure_ns: i64,
    pub ae_enabled: bool,
    pub awb_enabled: bool,
    pub hdr_enabled: bool,
    pub lens_position: f32,
    pub analogue_gain: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionStatus {
    Complete,
    Cancelled,
}

/// Delivered by the driver when a queued request finishes.
#[derive(Clone, Copy, Debug)]
pub struct Completion {
    pub cookie: usize,
    pub status: CompletionStatus,
}

pub type CompletionHandler = Box<dyn FnMut(Completion) + Send>;

/// Platform camera driver.
///
/// Lifecycle: `configure` (allocates the DMA buffers), `create_request` once
/// per buffer with cookie = buffer index, `start`, then any number of
/// `queue_request` calls, then `stop`.
///
/// When the completion handler returns, the request is re-armed with its
/// original buffer and may be queued again.
pub trait CameraDevice: Send {
    /// Requests a YUV420 video-recording configuration and allocates the
    /// DMA buffers. Must not adjust parameters silently: the returned
    /// status reports exactly what the driver did.
    fn configure(&mut self, format: &StreamFormat) -> Result<ConfigStatus, CameraError>;

    /// Plane descriptors per allocated buffer. Valid after `configure`.
    fn buffers(&self) -> Result<Vec<Vec<PlaneDesc>>, CameraError>;

    /// Creates the reusable request for buffer `cookie`.
    fn create_request(&mut self, cookie: usize) -> Result<(), CameraError>;

    /// Applies controls, registers the completion handler, starts capture.
    fn start(
        &mut self,
        controls: &CaptureControls,
        on_complete: CompletionHandler,
    ) -> Result<(), CameraError>;

    /// Submits the request for buffer `cookie`.
    ///
    /// Runs from the capture-timer signal handler: implementations must not
    /// allocate, lock, or block.
    fn queue_request(&self, cookie: usize) -> Result<(), CameraError>;

    /// Stops capture. Requests still in flight complete with
    /// `CompletionStatus::Cancelled` before this returns.
    fn stop(&mut self);
}
