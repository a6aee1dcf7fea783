//! Synthetic camera device
//!
//! Stands in for the platform driver when the node runs without camera
//! hardware (bench setups, integration tests). DMA buffers are memfd-backed
//! so the capture side maps real file descriptors exactly as it would map a
//! dmabuf: three contiguous YUV420 planes behind one fd. A worker thread
//! plays the role of the driver's completion context: each queued request
//! is filled with a deterministic pattern and completed in submission order.

use std::fs::File;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use memmap2::MmapMut;

use super::device::{
    CameraDevice, CaptureControls, Completion, CompletionHandler, CompletionStatus, ConfigStatus,
    PlaneDesc, StreamFormat,
};
use super::CameraError;
use crate::spsc;

struct SynBuffer {
    file: File,
    planes: Vec<PlaneDesc>,
}

pub struct SyntheticCamera {
    /// Buffer geometry actually allocated; normally the requested format,
    /// unless pinned via [`with_fixed_sensor_size`](Self::with_fixed_sensor_size).
    sensor_size: Option<(u32, u32)>,
    validation: ConfigStatus,
    buffers: Vec<SynBuffer>,
    requests: Vec<bool>,
    cookie_tx: Option<spsc::Producer<usize>>,
    worker: Option<JoinHandle<()>>,
    stop_flag: Arc<AtomicBool>,
    started: AtomicBool,
}

impl SyntheticCamera {
    pub fn new() -> Self {
        SyntheticCamera {
            sensor_size: None,
            validation: ConfigStatus::Valid,
            buffers: Vec::new(),
            requests: Vec::new(),
            cookie_tx: None,
            worker: None,
            stop_flag: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
        }
    }

    /// Makes `configure` report `status` instead of `Valid`.
    pub fn with_validation(mut self, status: ConfigStatus) -> Self {
        self.validation = status;
        self
    }

    /// Pins the allocated buffer geometry regardless of the requested
    /// format, imitating a sensor that cannot deliver the asked-for size.
    pub fn with_fixed_sensor_size(mut self, width: u32, height: u32) -> Self {
        self.sensor_size = Some((width, height));
        self
    }

    fn alloc_buffer(width: u32, height: u32) -> Result<SynBuffer, CameraError> {
        let y_bytes = width as usize * height as usize;
        let chroma_bytes = y_bytes / 4;
        let frame_bytes = y_bytes + 2 * chroma_bytes;

        let fd = unsafe { libc::memfd_create(c"mocap-synthetic-dma".as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(CameraError::Io(std::io::Error::last_os_error()));
        }
        let file = unsafe { File::from_raw_fd(fd) };
        file.set_len(frame_bytes as u64)?;

        let raw = file.as_raw_fd();
        let planes = vec![
            PlaneDesc {
                fd: raw,
                offset: 0,
                len: y_bytes,
            },
            PlaneDesc {
                fd: raw,
                offset: y_bytes as u64,
                len: chroma_bytes,
            },
            PlaneDesc {
                fd: raw,
                offset: (y_bytes + chroma_bytes) as u64,
                len: chroma_bytes,
            },
        ];

        Ok(SynBuffer { file, planes })
    }
}

impl Default for SyntheticCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraDevice for SyntheticCamera {
    fn configure(&mut self, format: &StreamFormat) -> Result<ConfigStatus, CameraError> {
        if self.validation != ConfigStatus::Valid {
            return Ok(self.validation);
        }

        let (width, height) = self.sensor_size.unwrap_or((format.width, format.height));
        self.buffers.clear();
        for _ in 0..format.buffer_count {
            self.buffers.push(Self::alloc_buffer(width, height)?);
        }
        self.requests = vec![false; format.buffer_count];
        Ok(ConfigStatus::Valid)
    }

    fn buffers(&self) -> Result<Vec<Vec<PlaneDesc>>, CameraError> {
        if self.buffers.is_empty() {
            return Err(CameraError::Device("device not configured".to_string()));
        }
        Ok(self.buffers.iter().map(|b| b.planes.clone()).collect())
    }

    fn create_request(&mut self, cookie: usize) -> Result<(), CameraError> {
        let slot = self
            .requests
            .get_mut(cookie)
            .ok_or_else(|| CameraError::Device(format!("no buffer for cookie {cookie}")))?;
        *slot = true;
        Ok(())
    }

    fn start(
        &mut self,
        _controls: &CaptureControls,
        mut on_complete: CompletionHandler,
    ) -> Result<(), CameraError> {
        if self.started.load(Ordering::Relaxed) {
            return Err(CameraError::Device("device already started".to_string()));
        }

        let mut maps = Vec::with_capacity(self.buffers.len());
        for buf in &self.buffers {
            let map = unsafe { MmapMut::map_mut(&buf.file) }.map_err(CameraError::Map)?;
            maps.push(map);
        }

        let (tx, rx) = spsc::channel::<usize>(self.buffers.len().max(2));
        self.cookie_tx = Some(tx);
        self.stop_flag.store(false, Ordering::Relaxed);
        let stop = Arc::clone(&self.stop_flag);

        self.worker = Some(std::thread::spawn(move || {
            let mut frame_no: u64 = 0;
            loop {
                match rx.pop() {
                    Some(cookie) => {
                        if stop.load(Ordering::Relaxed) {
                            on_complete(Completion {
                                cookie,
                                status: CompletionStatus::Cancelled,
                            });
                            continue;
                        }

                        let map = &mut maps[cookie];
                        map.fill((frame_no & 0xff) as u8);
                        map[..8].copy_from_slice(&frame_no.to_le_bytes());
                        frame_no += 1;

                        on_complete(Completion {
                            cookie,
                            status: CompletionStatus::Complete,
                        });
                    }
                    None if stop.load(Ordering::Relaxed) => break,
                    None => std::thread::sleep(Duration::from_micros(200)),
                }
            }
        }));

        self.started.store(true, Ordering::Release);
        Ok(())
    }

    fn queue_request(&self, cookie: usize) -> Result<(), CameraError> {
        if !self.started.load(Ordering::Acquire) {
            return Err(CameraError::Device("device not started".to_string()));
        }
        if !self.requests.get(cookie).copied().unwrap_or(false) {
            return Err(CameraError::Device(format!(
                "no request created for cookie {cookie}"
            )));
        }

        let tx = self
            .cookie_tx
            .as_ref()
            .ok_or_else(|| CameraError::Device("device not started".to_string()))?;
        if !tx.push(cookie) {
            return Err(CameraError::Device("request queue full".to_string()));
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.cookie_tx = None;
        self.started.store(false, Ordering::Relaxed);
    }
}

impl Drop for SyntheticCamera {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format() -> StreamFormat {
        StreamFormat {
            width: 64,
            height: 48,
            buffer_count: 2,
        }
    }

    fn controls() -> CaptureControls {
        CaptureControls {
            frame_duration_ns: (16_666_666, 33_333_333),
            exposure_ns: 16_666_666,
            ae_enabled: false,
            awb_enabled: false,
            hdr_enabled: false,
            lens_position: 3.33,
            analogue_gain: 1.0,
        }
    }

    #[test]
    fn test_planes_are_contiguous_in_one_fd() {
        let mut cam = SyntheticCamera::new();
        cam.configure(&format()).unwrap();
        let buffers = cam.buffers().unwrap();
        assert_eq!(buffers.len(), 2);

        for planes in &buffers {
            assert_eq!(planes.len(), 3);
            let y = &planes[0];
            let u = &planes[1];
            let v = &planes[2];
            assert_eq!(y.len, 64 * 48);
            assert_eq!(u.len, 64 * 48 / 4);
            assert_eq!(v.len, 64 * 48 / 4);
            assert_eq!(u.fd, y.fd);
            assert_eq!(v.fd, y.fd);
            assert_eq!(u.offset, y.len as u64);
            assert_eq!(v.offset, (y.len + u.len) as u64);
        }
    }

    #[test]
    fn test_completions_arrive_in_submission_order() {
        let mut cam = SyntheticCamera::new();
        cam.configure(&format()).unwrap();
        cam.create_request(0).unwrap();
        cam.create_request(1).unwrap();

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        cam.start(
            &controls(),
            Box::new(move |c| {
                done_tx.send(c).unwrap();
            }),
        )
        .unwrap();

        cam.queue_request(0).unwrap();
        cam.queue_request(1).unwrap();

        let first = done_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let second = done_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(first.cookie, 0);
        assert_eq!(first.status, CompletionStatus::Complete);
        assert_eq!(second.cookie, 1);

        cam.stop();
    }

    #[test]
    fn test_queue_before_start_fails() {
        let mut cam = SyntheticCamera::new();
        cam.configure(&format()).unwrap();
        cam.create_request(0).unwrap();
        assert!(cam.queue_request(0).is_err());
    }
}
