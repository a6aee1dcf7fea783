//! Pipeline controller
//!
//! Wires timer, camera, pool, queue, encoder and sockets into the recording
//! loop, and owns the four signals that drive it:
//!
//! - SIGUSR1: capture timer expiry; the handler queues the next request
//! - SIGIO: control datagram on the UDP socket (base timestamp / STOP)
//! - SIGINT / SIGTERM: graceful exit
//!
//! The main thread blocks in exactly two places, the loop semaphore and the
//! stream write; handlers preempt it on the pinned core, do their work
//! against the statics below, and return. Handlers never unwind: failures
//! in the capture path land in a sticky error word the loop inspects after
//! every wake, and malformed control traffic lands in a counter the loop
//! reports at debug level.

use std::io;
use std::ptr;
use std::sync::atomic::{
    AtomicBool, AtomicI32, AtomicI64, AtomicPtr, AtomicU64, Ordering,
};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::camera::device::CameraDevice;
use crate::camera::{CameraError, CameraSource};
use crate::config::Config;
use crate::connection::{Connection, NetError};
use crate::encoder::{EncoderError, VideoEncoder};
use crate::pool::FramePool;
use crate::sem::Semaphore;
use crate::spsc;
use crate::timer::{self, CaptureTimer};
use crate::rt;

/// Timer expiry signal.
const CAPTURE_SIGNAL: libc::c_int = libc::SIGUSR1;

const ERR_NONE: i32 = 0;
const ERR_OVERRUN: i32 = 1;
const ERR_DEVICE: i32 = 2;

// Shared between the signal handlers and the loop. Relaxed ordering
// throughout: the semaphore post/wait pair is the release/acquire edge, and
// stale reads of BASE_TS only cost one loop iteration. The pointer slots are
// written before handlers are installed and cleared after they are restored.
static RUNNING: AtomicBool = AtomicBool::new(false);
static BASE_TS: AtomicI64 = AtomicI64::new(0);
static STICKY_ERR: AtomicI32 = AtomicI32::new(ERR_NONE);
static MALFORMED: AtomicU64 = AtomicU64::new(0);
static UDP_FD: AtomicI32 = AtomicI32::new(-1);
static SEM: AtomicPtr<libc::sem_t> = AtomicPtr::new(ptr::null_mut());
static CAMERA: AtomicPtr<CameraSource> = AtomicPtr::new(ptr::null_mut());

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),

    #[error("encoder error: {0}")]
    Encoder(#[from] EncoderError),

    #[error("network error: {0}")]
    Net(#[from] NetError),

    #[error("real-time scheduling setup failed: {0}")]
    Scheduling(#[source] io::Error),

    #[error("capture timer failed: {0}")]
    Timer(#[source] io::Error),

    #[error("signal setup failed: {0}")]
    Signals(#[source] io::Error),

    #[error("loop semaphore failed: {0}")]
    Semaphore(#[source] io::Error),

    #[error("capture overrun: frames are produced faster than the loop drains them")]
    Overrun,

    #[error("capture request failed in the signal path")]
    CaptureFailed,
}

/// Control datagram, classified by size per the fleet protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CtlMsg {
    /// 8 bytes: base timestamp, nanoseconds since the epoch.
    Start(i64),
    /// 4 bytes, ASCII "STOP".
    Stop,
    /// Anything else; ignored.
    Malformed,
}

pub fn parse_ctl(buf: &[u8]) -> CtlMsg {
    match buf.len() {
        4 if buf == b"STOP" => CtlMsg::Stop,
        8 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(buf);
            CtlMsg::Start(i64::from_le_bytes(raw))
        }
        _ => CtlMsg::Malformed,
    }
}

extern "C" fn capture_signal_handler(_signo: libc::c_int) {
    if !RUNNING.load(Ordering::Relaxed) {
        return;
    }
    let camera = CAMERA.load(Ordering::Acquire);
    if camera.is_null() {
        return;
    }

    // Shared reference only: queue_request touches atomics and the driver
    // submit path, nothing the loop mutates.
    let result = unsafe { (*camera).queue_request() };
    let code = match result {
        Ok(()) => return,
        Err(CameraError::Overrun) => ERR_OVERRUN,
        Err(_) => ERR_DEVICE,
    };
    STICKY_ERR.store(code, Ordering::Relaxed);

    // Wake the loop so it sees the sticky error promptly.
    let sem = SEM.load(Ordering::Acquire);
    if !sem.is_null() {
        unsafe { libc::sem_post(sem) };
    }
}

extern "C" fn io_signal_handler(_signo: libc::c_int) {
    let fd = UDP_FD.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }

    let mut buf = [0u8; 8];
    let received = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
    if received < 0 {
        // Spurious SIGIO; the socket is non-blocking.
        return;
    }

    match parse_ctl(&buf[..received as usize]) {
        CtlMsg::Start(ts) => {
            BASE_TS.store(ts, Ordering::Relaxed);
            let sem = SEM.load(Ordering::Acquire);
            if !sem.is_null() {
                unsafe { libc::sem_post(sem) };
            }
        }
        // No post: frames already in flight each post once, which is
        // exactly what the loop needs to drain them.
        CtlMsg::Stop => BASE_TS.store(0, Ordering::Relaxed),
        CtlMsg::Malformed => {
            MALFORMED.fetch_add(1, Ordering::Relaxed);
        }
    }
}

extern "C" fn exit_signal_handler(_signo: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
    let sem = SEM.load(Ordering::Acquire);
    if !sem.is_null() {
        unsafe { libc::sem_post(sem) };
    }
}

/// Installs the three handlers, each with its own sigaction and SA_RESTART
/// so interrupted syscalls resume on their own.
fn install_signal_handlers() -> io::Result<()> {
    unsafe {
        let mut capture_action: libc::sigaction = std::mem::zeroed();
        capture_action.sa_sigaction = capture_signal_handler as *const () as libc::sighandler_t;
        capture_action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut capture_action.sa_mask);

        let mut io_action: libc::sigaction = std::mem::zeroed();
        io_action.sa_sigaction = io_signal_handler as *const () as libc::sighandler_t;
        io_action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut io_action.sa_mask);

        let mut exit_action: libc::sigaction = std::mem::zeroed();
        exit_action.sa_sigaction = exit_signal_handler as *const () as libc::sighandler_t;
        exit_action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut exit_action.sa_mask);

        if libc::sigaction(CAPTURE_SIGNAL, &capture_action, ptr::null_mut()) < 0
            || libc::sigaction(libc::SIGIO, &io_action, ptr::null_mut()) < 0
            || libc::sigaction(libc::SIGINT, &exit_action, ptr::null_mut()) < 0
            || libc::sigaction(libc::SIGTERM, &exit_action, ptr::null_mut()) < 0
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn restore_default_handlers() {
    unsafe {
        let mut default_action: libc::sigaction = std::mem::zeroed();
        default_action.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut default_action.sa_mask);
        for signal in [CAPTURE_SIGNAL, libc::SIGIO, libc::SIGINT, libc::SIGTERM] {
            libc::sigaction(signal, &default_action, ptr::null_mut());
        }
    }
}

/// Writes one packet, reopening the stream socket once on failure. A second
/// failure is surfaced and kills the run: a gap in the dataset is worse
/// than an aborted recording.
fn stream_with_retry(conn: &mut Connection, packet: &[u8]) -> Result<(), NetError> {
    match conn.stream_pkt(packet) {
        Ok(()) => Ok(()),
        Err(err) => {
            warn!(error = %err, "stream write failed, reopening connection");
            conn.discon_tcp();
            conn.stream_pkt(packet)
        }
    }
}

pub struct Pipeline {
    config: Config,
    pool: Arc<FramePool>,
    consumer: spsc::Consumer<crate::pool::SlotPtr>,
    sem: Arc<Semaphore>,
    in_flight: Arc<AtomicI32>,
    // Boxed so the address handed to the capture handler stays stable.
    camera: Box<CameraSource>,
    encoder: VideoEncoder,
    conn: Connection,
    timer: CaptureTimer,
}

impl Pipeline {
    /// Builds every stage in dependency order; any failure aborts startup.
    pub fn new(config: Config, device: Box<dyn CameraDevice>) -> Result<Self, PipelineError> {
        let sem = Arc::new(Semaphore::new().map_err(PipelineError::Semaphore)?);
        let (producer, consumer) = spsc::channel(config.frame_buffers);
        let pool = Arc::new(FramePool::new(config.frame_buffers, config.frame_bytes()));
        let in_flight = Arc::new(AtomicI32::new(0));

        let camera = Box::new(CameraSource::new(
            &config,
            device,
            Arc::clone(&pool),
            producer,
            Arc::clone(&sem),
            Arc::clone(&in_flight),
        )?);
        let encoder = VideoEncoder::new(&config)?;
        let conn = Connection::new(config.server_ip, config.tcp_port, config.udp_port);
        let timer = CaptureTimer::new(CAPTURE_SIGNAL).map_err(PipelineError::Timer)?;

        Ok(Pipeline {
            config,
            pool,
            consumer,
            sem,
            in_flight,
            camera,
            encoder,
            conn,
            timer,
        })
    }

    /// Runs the recording loop until a termination signal or a fatal error.
    pub fn run(&mut self) -> Result<(), PipelineError> {
        rt::pin_to_core(self.config.recording_cpu).map_err(PipelineError::Scheduling)?;
        rt::set_fifo_max_priority().map_err(PipelineError::Scheduling)?;
        info!(
            cpu = self.config.recording_cpu,
            "pinned with SCHED_FIFO at max priority"
        );

        BASE_TS.store(0, Ordering::Relaxed);
        STICKY_ERR.store(ERR_NONE, Ordering::Relaxed);
        MALFORMED.store(0, Ordering::Relaxed);
        SEM.store(self.sem.as_ptr(), Ordering::Release);
        CAMERA.store(
            &*self.camera as *const CameraSource as *mut CameraSource,
            Ordering::Release,
        );

        install_signal_handlers().map_err(PipelineError::Signals)?;
        RUNNING.store(true, Ordering::Relaxed);

        let result = self.run_loop();

        // Teardown mirrors creation order in reverse. Handlers go first so
        // nothing fires into a half-dismantled pipeline.
        RUNNING.store(false, Ordering::Relaxed);
        self.timer.disarm();
        restore_default_handlers();
        CAMERA.store(ptr::null_mut(), Ordering::Release);
        SEM.store(ptr::null_mut(), Ordering::Release);
        UDP_FD.store(-1, Ordering::Relaxed);

        self.camera.stop();
        let drained = self.drain_and_flush();
        self.conn.discon_tcp();
        self.conn.close_udp();

        result.and(drained)
    }

    fn run_loop(&mut self) -> Result<(), PipelineError> {
        let frame_duration = self.config.frame_duration_ns();
        // Absolute time of the last expiry this loop armed; lets a freshly
        // received base timestamp fire at exactly its own instant rather
        // than one period later.
        let mut armed_ts: i64 = 0;

        info!(
            fps = self.config.fps,
            width = self.config.frame_width,
            height = self.config.frame_height,
            "recording loop started, waiting for base timestamp"
        );

        while RUNNING.load(Ordering::Relaxed) {
            // (Re)bind the control socket and route it to SIGIO.
            if self.conn.udp_fd().is_none() {
                let fd = self.conn.bind_udp()?;
                UDP_FD.store(fd, Ordering::Release);
            }

            let base = BASE_TS.load(Ordering::Relaxed);
            if base != 0 {
                let next = if base == armed_ts {
                    base + frame_duration
                } else {
                    // Fresh base timestamp from the server: first capture
                    // happens at that instant, not one period later.
                    base
                };
                let target = timer::catch_up(next, frame_duration, timer::realtime_ns());

                // Advance only if no control message landed meanwhile; a
                // concurrent STOP or restart must not be overwritten.
                if BASE_TS
                    .compare_exchange(base, target, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    self.timer.arm(target).map_err(PipelineError::Timer)?;
                    armed_ts = target;
                }
            }

            self.sem.wait().map_err(PipelineError::Semaphore)?;

            let malformed = MALFORMED.swap(0, Ordering::Relaxed);
            if malformed > 0 {
                debug!(count = malformed, "ignored malformed control datagrams");
            }

            match STICKY_ERR.swap(ERR_NONE, Ordering::Relaxed) {
                ERR_NONE => {}
                ERR_OVERRUN => return Err(PipelineError::Overrun),
                _ => return Err(PipelineError::CaptureFailed),
            }

            // Empty queue means the wake was a start or termination event.
            let Some(slot) = self.consumer.pop() else {
                continue;
            };
            self.in_flight.fetch_sub(1, Ordering::Relaxed);

            let frame = unsafe { self.pool.frame(slot) };
            let conn = &mut self.conn;
            let mut sink = |packet: &[u8]| stream_with_retry(conn, packet);
            self.encoder.encode_frame(frame, &mut sink)?;
        }

        info!(frames = self.encoder.pts(), "recording loop stopped");
        Ok(())
    }

    /// Encodes any frames still queued, then flushes the encoder through
    /// the stream sink.
    fn drain_and_flush(&mut self) -> Result<(), PipelineError> {
        while let Some(slot) = self.consumer.pop() {
            self.in_flight.fetch_sub(1, Ordering::Relaxed);
            let frame = unsafe { self.pool.frame(slot) };
            let conn = &mut self.conn;
            let mut sink = |packet: &[u8]| stream_with_retry(conn, packet);
            self.encoder.encode_frame(frame, &mut sink)?;
        }

        let conn = &mut self.conn;
        let mut sink = |packet: &[u8]| stream_with_retry(conn, packet);
        self.encoder.flush(&mut sink)?;
        Ok(())
    }
}
