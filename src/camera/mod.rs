//! Camera source: DMA plane mappings, reusable requests, completion path
//!
//! Wraps the platform driver behind [`device::CameraDevice`]. Construction
//! configures a YUV420 video-recording stream and refuses any driver-side
//! adjustment, verifies the exact plane layout, maps each buffer's planes
//! (contiguous behind the Y-plane fd), and pins fixed manual controls so
//! capture latency is deterministic.
//!
//! At runtime the capture-timer signal handler calls [`CameraSource::queue_request`],
//! and the driver's completion context runs [`CompletionPath::handle`]: copy
//! the finished DMA frame into the next pool slot, publish the slot through
//! the SPSC queue, bump the in-flight gauge, post the loop semaphore. The
//! copy is deliberate; it frees the DMA buffer for immediate re-queueing
//! and decouples sensor timing from consumer latency.

pub mod device;
pub mod synthetic;

use std::io;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::config::Config;
use crate::pool::FramePool;
use crate::sem::Semaphore;
use crate::spsc::Producer;

use device::{
    CameraDevice, CaptureControls, Completion, CompletionStatus, ConfigStatus, StreamFormat,
};

/// Manual focus target, reciprocal meters (~0.3 m working distance on the rig).
const LENS_POSITION: f32 = 3.33;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("driver adjusted the stream configuration instead of honoring it")]
    ConfigAdjusted,

    #[error("stream configuration invalid for this sensor")]
    ConfigInvalid,

    #[error("buffer {cookie}: plane sizes {got:?} do not match expected {expected:?}")]
    PlaneLayout {
        cookie: usize,
        expected: [usize; 3],
        got: Vec<usize>,
    },

    #[error("failed to map DMA plane: {0}")]
    Map(#[source] io::Error),

    #[error("capture overrun: in-flight frames would exceed pool headroom")]
    Overrun,

    #[error("camera device error: {0}")]
    Device(String),

    #[error("device I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Read/write mapping of one DMA buffer's full YUV420 frame.
struct PlaneMapping {
    ptr: NonNull<u8>,
    len: usize,
}

unsafe impl Send for PlaneMapping {}

impl PlaneMapping {
    fn map(fd: RawFd, offset: u64, len: usize) -> Result<Self, CameraError> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(CameraError::Map(io::Error::last_os_error()));
        }
        Ok(PlaneMapping {
            // mmap returned non-MAP_FAILED, so the pointer is valid.
            ptr: unsafe { NonNull::new_unchecked(ptr.cast()) },
            len,
        })
    }
}

impl Drop for PlaneMapping {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
    }
}

/// Producer side of the frame path; owned by the driver's completion
/// context, which is the only writer of the pool cursor.
struct CompletionPath {
    maps: Vec<PlaneMapping>,
    pool: Arc<FramePool>,
    cursor: usize,
    producer: Producer<crate::pool::SlotPtr>,
    sem: Arc<Semaphore>,
    in_flight: Arc<AtomicI32>,
}

impl CompletionPath {
    fn handle(&mut self, completion: Completion) {
        // A cancelled request's buffer is already back with the driver; the
        // next timer fire re-queues it.
        if completion.status == CompletionStatus::Cancelled {
            return;
        }

        let src = &self.maps[completion.cookie];
        let dst = self.pool.slot_ptr(self.cursor);
        unsafe {
            std::ptr::copy_nonoverlapping(src.ptr.as_ptr(), dst.0.as_ptr(), src.len);
        }
        self.cursor = (self.cursor + 1) % self.pool.slots();

        // Queue capacity covers every frame the back-pressure rule admits,
        // so this accepts on the first attempt.
        while !self.producer.push(dst) {
            std::hint::spin_loop();
        }

        self.in_flight.fetch_add(1, Ordering::Relaxed);
        self.sem.post();
    }
}

pub struct CameraSource {
    device: Box<dyn CameraDevice>,
    next_req: AtomicUsize,
    dma_buffers: usize,
    pool_slots: usize,
    in_flight: Arc<AtomicI32>,
}

impl CameraSource {
    /// Configures, maps, and starts the device. Fails hard on any parameter
    /// adjustment or unexpected plane layout.
    pub fn new(
        config: &Config,
        mut device: Box<dyn CameraDevice>,
        pool: Arc<FramePool>,
        producer: Producer<crate::pool::SlotPtr>,
        sem: Arc<Semaphore>,
        in_flight: Arc<AtomicI32>,
    ) -> Result<Self, CameraError> {
        let format = StreamFormat {
            width: config.frame_width,
            height: config.frame_height,
            buffer_count: config.dma_buffers,
        };

        match device.configure(&format)? {
            ConfigStatus::Valid => {}
            ConfigStatus::Adjusted => return Err(CameraError::ConfigAdjusted),
            ConfigStatus::Invalid => return Err(CameraError::ConfigInvalid),
        }

        let buffers = device.buffers()?;
        if buffers.len() != config.dma_buffers {
            return Err(CameraError::Device(format!(
                "driver allocated {} buffers, requested {}",
                buffers.len(),
                config.dma_buffers
            )));
        }

        let y_bytes = config.frame_width as usize * config.frame_height as usize;
        let chroma_bytes = y_bytes / 4;
        let expected = [y_bytes, chroma_bytes, chroma_bytes];
        let frame_bytes = config.frame_bytes();

        let mut maps = Vec::with_capacity(buffers.len());
        for (cookie, planes) in buffers.iter().enumerate() {
            let got: Vec<usize> = planes.iter().map(|p| p.len).collect();
            if got != expected {
                return Err(CameraError::PlaneLayout {
                    cookie,
                    expected,
                    got,
                });
            }

            // U and V sit directly after Y in the same dmabuf, so one
            // mapping from the Y plane's fd covers the whole frame.
            let y_plane = &planes[0];
            maps.push(PlaneMapping::map(y_plane.fd, y_plane.offset, frame_bytes)?);
        }

        for cookie in 0..buffers.len() {
            device.create_request(cookie)?;
        }

        let controls = CaptureControls {
            frame_duration_ns: (config.frame_duration_min_ns, config.frame_duration_max_ns),
            exposure_ns: config.frame_duration_min_ns,
            ae_enabled: false,
            awb_enabled: false,
            hdr_enabled: false,
            lens_position: LENS_POSITION,
            analogue_gain: 1.0,
        };

        let mut path = CompletionPath {
            maps,
            pool,
            cursor: 0,
            producer,
            sem,
            in_flight: Arc::clone(&in_flight),
        };
        device.start(&controls, Box::new(move |c| path.handle(c)))?;

        Ok(CameraSource {
            device,
            next_req: AtomicUsize::new(0),
            dma_buffers: config.dma_buffers,
            pool_slots: config.frame_buffers,
            in_flight,
        })
    }

    /// Submits the next capture request.
    ///
    /// Callable from the capture-timer signal handler: touches only atomics
    /// and the driver's submit path. The in-flight gauge is the sole
    /// back-pressure signal; leaving two slots of headroom guarantees the
    /// pool writer never laps a slot the consumer still references, even
    /// while the loop is between its semaphore wake and the dequeue.
    pub fn queue_request(&self) -> Result<(), CameraError> {
        let in_flight = self.in_flight.load(Ordering::Relaxed);
        if in_flight > self.pool_slots as i32 - 2 {
            return Err(CameraError::Overrun);
        }

        let idx = self.next_req.load(Ordering::Relaxed);
        self.device.queue_request(idx)?;
        self.next_req
            .store((idx + 1) % self.dma_buffers, Ordering::Relaxed);
        Ok(())
    }

    /// Stops the device; in-flight requests complete as cancelled.
    pub fn stop(&mut self) {
        self.device.stop();
    }
}
