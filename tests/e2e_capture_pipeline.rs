//! End-to-end tests for the capture path: synthetic device -> DMA mapping ->
//! pool copy -> SPSC queue -> encoder -> TCP stream.
//!
//! These drive the same component chain the recording loop drives, minus
//! the global signal handlers and SCHED_FIFO setup (both need privileges
//! and process-wide state the test harness cannot own).

use std::net::{Ipv4Addr, TcpListener};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mocap_node::camera::synthetic::SyntheticCamera;
use mocap_node::camera::{CameraError, CameraSource};
use mocap_node::config::Config;
use mocap_node::connection::Connection;
use mocap_node::encoder::VideoEncoder;
use mocap_node::pool::{FramePool, SlotPtr};
use mocap_node::sem::Semaphore;
use mocap_node::spsc;

fn config_with_ports(frame_buffers: usize, dma_buffers: usize, tcp_port: u16) -> Config {
    Config::from_str(&format!(
        "FRAME_WIDTH=64\nFRAME_HEIGHT=48\nFPS=30\n\
         FRAME_DURATION_MIN=16666666\nFRAME_DURATION_MAX=33333333\n\
         FRAME_BUFFERS={frame_buffers}\nDMA_BUFFERS={dma_buffers}\n\
         RECORDING_CPU=0\nSERVER_IP=127.0.0.1\nTCP_PORT={tcp_port}\nUDP_PORT=5001\n"
    ))
    .unwrap()
}

struct Node {
    camera: CameraSource,
    consumer: spsc::Consumer<SlotPtr>,
    pool: Arc<FramePool>,
    sem: Arc<Semaphore>,
    in_flight: Arc<AtomicI32>,
    encoder: VideoEncoder,
    conn: Connection,
}

fn node(config: &Config) -> Node {
    let pool = Arc::new(FramePool::new(config.frame_buffers, config.frame_bytes()));
    let (producer, consumer) = spsc::channel(config.frame_buffers);
    let sem = Arc::new(Semaphore::new().unwrap());
    let in_flight = Arc::new(AtomicI32::new(0));

    let camera = CameraSource::new(
        config,
        Box::new(SyntheticCamera::new()),
        Arc::clone(&pool),
        producer,
        Arc::clone(&sem),
        Arc::clone(&in_flight),
    )
    .unwrap();

    Node {
        camera,
        consumer,
        pool,
        sem,
        in_flight,
        encoder: VideoEncoder::new(config).unwrap(),
        conn: Connection::new(config.server_ip, config.tcp_port, config.udp_port),
    }
}

/// Waits for the synthetic completion thread to post a frame.
fn wait_frame(sem: &Semaphore) {
    for _ in 0..5000 {
        if sem.value() > 0 {
            sem.wait().unwrap();
            return;
        }
        std::thread::sleep(Duration::from_micros(200));
    }
    panic!("no completion within timeout");
}

/// Spawns a byte-sink server and returns its port plus a handle yielding
/// everything it received.
fn byte_sink() -> (u16, std::thread::JoinHandle<Vec<u8>>) {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = std::thread::spawn(move || {
        use std::io::Read;
        let (mut stream, _) = listener.accept().unwrap();
        let mut received = Vec::new();
        stream.read_to_end(&mut received).unwrap();
        received
    });
    (port, handle)
}

#[test]
fn test_cold_start_single_frame_reaches_server() {
    let (port, server) = byte_sink();
    let config = config_with_ports(4, 3, port);
    let mut n = node(&config);

    // One timer fire: queue, complete, consume, encode, stream.
    n.camera.queue_request().unwrap();
    wait_frame(&n.sem);

    let slot = n.consumer.pop().expect("frame published");
    n.in_flight.fetch_sub(1, Ordering::Relaxed);

    let frame = unsafe { n.pool.frame(slot) };
    let conn = &mut n.conn;
    let mut sink = |packet: &[u8]| conn.stream_pkt(packet);
    n.encoder.encode_frame(frame, &mut sink).unwrap();

    assert_eq!(n.encoder.pts(), 1);
    n.camera.stop();
    n.conn.discon_tcp();

    let received = server.join().unwrap();
    assert!(!received.is_empty(), "server saw no encoded bytes");
}

#[test]
fn test_sustained_sequence_keeps_order_and_pts() {
    let (port, server) = byte_sink();
    let config = config_with_ports(4, 3, port);
    let mut n = node(&config);

    // 30 frames at the configured cadence, drained as they complete, the
    // steady-state shape of one recorded second.
    for i in 0..30u64 {
        n.camera.queue_request().unwrap();
        wait_frame(&n.sem);

        let slot = n.consumer.pop().expect("frame published");
        n.in_flight.fetch_sub(1, Ordering::Relaxed);

        let frame = unsafe { n.pool.frame(slot) };
        // Synthetic frames are stamped with their capture index.
        assert_eq!(u64::from_le_bytes(frame[..8].try_into().unwrap()), i);

        let conn = &mut n.conn;
        let mut sink = |packet: &[u8]| conn.stream_pkt(packet);
        n.encoder.encode_frame(frame, &mut sink).unwrap();
        assert_eq!(n.encoder.pts(), i + 1);
    }

    assert_eq!(n.in_flight.load(Ordering::Relaxed), 0);
    n.camera.stop();
    n.conn.discon_tcp();

    let received = server.join().unwrap();
    assert!(!received.is_empty());
}

#[test]
fn test_stop_drains_in_flight_frames() {
    let (port, server) = byte_sink();
    let config = config_with_ports(5, 3, port);
    let mut n = node(&config);

    // Two captures complete before the STOP; no further requests are
    // queued afterwards, but both frames must still reach the server.
    for _ in 0..2 {
        n.camera.queue_request().unwrap();
        wait_frame(&n.sem);
    }

    for i in 0..2u64 {
        let slot = n.consumer.pop().expect("frame survives STOP");
        n.in_flight.fetch_sub(1, Ordering::Relaxed);
        let frame = unsafe { n.pool.frame(slot) };
        assert_eq!(u64::from_le_bytes(frame[..8].try_into().unwrap()), i);

        let conn = &mut n.conn;
        let mut sink = |packet: &[u8]| conn.stream_pkt(packet);
        n.encoder.encode_frame(frame, &mut sink).unwrap();
    }
    assert_eq!(n.encoder.pts(), 2);

    n.camera.stop();
    n.conn.discon_tcp();
    assert!(!server.join().unwrap().is_empty());
}

#[test]
fn test_restart_continues_presentation_numbering() {
    let (port, server) = byte_sink();
    let config = config_with_ports(4, 3, port);
    let mut n = node(&config);

    let drain_one = |n: &mut Node| {
        wait_frame(&n.sem);
        let slot = n.consumer.pop().expect("frame published");
        n.in_flight.fetch_sub(1, Ordering::Relaxed);
        let frame = unsafe { n.pool.frame(slot) };
        let frame = frame.to_vec();
        let conn = &mut n.conn;
        let mut sink = |packet: &[u8]| conn.stream_pkt(packet);
        n.encoder.encode_frame(&frame, &mut sink).unwrap();
    };

    // First recording segment.
    for _ in 0..3 {
        n.camera.queue_request().unwrap();
        drain_one(&mut n);
    }
    assert_eq!(n.encoder.pts(), 3);

    // STOP, then a new base timestamp: the encoder is not recreated, so
    // numbering continues where the first segment ended.
    for _ in 0..2 {
        n.camera.queue_request().unwrap();
        drain_one(&mut n);
    }
    assert_eq!(n.encoder.pts(), 5);

    n.camera.stop();
    n.conn.discon_tcp();
    assert!(!server.join().unwrap().is_empty());
}

#[test]
fn test_paused_consumer_hits_overrun_at_pool_headroom() {
    // No server: nothing is streamed before the overrun trips.
    let config = config_with_ports(4, 3, 1);
    let mut n = node(&config);

    // Consumer never drains: with N = 4, requests 1..=3 are admitted and
    // the 4th violates the N - 2 headroom invariant.
    for _ in 0..3 {
        n.camera.queue_request().unwrap();
        wait_frame(&n.sem);
    }
    assert!(matches!(
        n.camera.queue_request(),
        Err(CameraError::Overrun)
    ));

    n.camera.stop();
}
