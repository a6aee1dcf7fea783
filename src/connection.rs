//! Server connection: control datagrams in, encoded stream out
//!
//! Two sockets. The UDP socket is bound to the node's control port and put
//! into signal-driven I/O mode, so the kernel raises SIGIO at this process
//! whenever the server sends a base timestamp or STOP; the main loop never
//! polls for control traffic. The TCP socket carries the encoded stream and
//! connects lazily: the server only sees a connection once the first encoded
//! packet exists. On any stream error the socket is dropped and the next
//! packet reconnects.

use std::io::{self, Write};
use std::net::{Ipv4Addr, SocketAddrV4, TcpStream, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};

use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum NetError {
    #[error("failed to bind control socket: {0}")]
    Bind(#[source] io::Error),

    #[error("failed to enable signal-driven I/O: {0}")]
    Sigio(#[source] io::Error),

    #[error("failed to connect to server: {0}")]
    Connect(#[source] io::Error),

    #[error("stream write failed: {0}")]
    Write(#[source] io::Error),
}

pub struct Connection {
    server: SocketAddrV4,
    udp_port: u16,
    udp: Option<UdpSocket>,
    tcp: Option<TcpStream>,
}

impl Connection {
    pub fn new(server_ip: Ipv4Addr, tcp_port: u16, udp_port: u16) -> Self {
        Connection {
            server: SocketAddrV4::new(server_ip, tcp_port),
            udp_port,
            udp: None,
            tcp: None,
        }
    }

    /// Binds the control socket and routes its readiness to SIGIO.
    ///
    /// Returns the raw fd so the signal handler can read datagrams without
    /// touching this struct.
    pub fn bind_udp(&mut self) -> Result<RawFd, NetError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.udp_port))
            .map_err(NetError::Bind)?;
        let fd = socket.as_raw_fd();

        // O_NONBLOCK so the handler's recv never blocks, O_ASYNC + owner so
        // arrivals raise SIGIO at this process.
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            if flags < 0
                || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK | libc::O_ASYNC) < 0
            {
                return Err(NetError::Sigio(io::Error::last_os_error()));
            }
            if libc::fcntl(fd, libc::F_SETOWN, libc::getpid()) < 0 {
                return Err(NetError::Sigio(io::Error::last_os_error()));
            }
        }

        info!(port = self.udp_port, "control socket bound, SIGIO armed");
        self.udp = Some(socket);
        Ok(fd)
    }

    /// Raw control-socket fd, if currently bound.
    pub fn udp_fd(&self) -> Option<RawFd> {
        self.udp.as_ref().map(|s| s.as_raw_fd())
    }

    /// Drops the control socket; the caller rebinds on the next iteration.
    pub fn close_udp(&mut self) {
        self.udp = None;
    }

    /// Connects the stream socket to the server's ingest port.
    pub fn conn_tcp(&mut self) -> Result<(), NetError> {
        let stream = TcpStream::connect(self.server).map_err(NetError::Connect)?;
        info!(server = %self.server, "stream connected");
        self.tcp = Some(stream);
        Ok(())
    }

    /// Drops the stream socket so the next packet reconnects.
    pub fn discon_tcp(&mut self) {
        if self.tcp.take().is_some() {
            debug!("stream disconnected");
        }
    }

    pub fn tcp_connected(&self) -> bool {
        self.tcp.is_some()
    }

    /// Writes one encoded packet to the stream, connecting lazily.
    ///
    /// Loops until every byte is written; interrupted writes retry, any
    /// other error tears the stream down and surfaces.
    pub fn stream_pkt(&mut self, data: &[u8]) -> Result<(), NetError> {
        if self.tcp.is_none() {
            self.conn_tcp()?;
        }
        // Taken out so a failed write drops the socket on the way out.
        let mut stream = self.tcp.take().ok_or_else(|| {
            NetError::Connect(io::Error::new(io::ErrorKind::NotConnected, "no stream"))
        })?;

        let mut written = 0;
        while written < data.len() {
            match stream.write(&data[written..]) {
                Ok(0) => {
                    return Err(NetError::Write(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "server closed the stream",
                    )));
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(NetError::Write(e)),
            }
        }

        self.tcp = Some(stream);
        Ok(())
    }
}
