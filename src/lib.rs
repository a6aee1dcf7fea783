//! Synchronized motion-capture camera node
//!
//! One node of a multi-camera rig: captures YUV420 frames on a wall-clock
//! grid shared across the fleet (PTP-disciplined), encodes them to H.264,
//! and streams the packets to the frameset server. The pipeline is a
//! single pinned SCHED_FIFO thread driven entirely by signals: a POSIX
//! timer queues capture requests, SIGIO delivers control datagrams, and a
//! semaphore wakes the loop once per completed frame.
//!
//! # Example
//!
//! ```no_run
//! use mocap_node::camera::synthetic::SyntheticCamera;
//! use mocap_node::config::Config;
//! use mocap_node::pipeline::Pipeline;
//!
//! let config = Config::load("config.txt")?;
//! let mut pipeline = Pipeline::new(config, Box::new(SyntheticCamera::new()))?;
//! pipeline.run()?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod camera;
pub mod config;
pub mod connection;
pub mod encoder;
pub mod pipeline;
pub mod pool;
pub mod rt;
pub mod sem;
pub mod spsc;
pub mod timer;

// Re-exports for convenience
pub use camera::device::CameraDevice;
pub use camera::CameraSource;
pub use config::Config;
pub use connection::Connection;
pub use encoder::VideoEncoder;
pub use pipeline::Pipeline;
pub use pool::FramePool;
