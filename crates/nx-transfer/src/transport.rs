/// Datagram and stream transports behind one send/receive surface.
///
/// The chunked engine only needs "send one unit" and "receive at most N
/// bytes", so both socket kinds implement [`Transport`]. Connection setup
/// (bind, connect, accept) stays on the concrete types.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, Type};

use crate::error::{TransferError, is_timeout};
use crate::progress::CancelToken;
use crate::protocol::{DATAGRAM_RECV_BUFFER, MAX_DATAGRAM_PAYLOAD};

/// 1 MB socket buffers for stream throughput.
const STREAM_BUF_SIZE: usize = 1024 * 1024;

/// Which socket family a session runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Connectionless, unordered, unacknowledged (UDP).
    Datagram,
    /// Connection-oriented, ordered, reliable (TCP).
    Stream,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Datagram => f.write_str("udp"),
            Self::Stream => f.write_str("tcp"),
        }
    }
}

/// Unit-oriented I/O shared by both transports.
pub trait Transport {
    /// Send `data` to the peer as one unit.
    fn send_unit(&mut self, data: &[u8]) -> io::Result<()>;

    /// Receive at most `buf.len()` bytes. `Ok(0)` means the peer is done.
    fn recv_unit(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Receive buffer size to use for payload reads of `chunk_size` chunks.
    fn receive_capacity(&self, chunk_size: usize) -> usize {
        chunk_size
    }

    fn peer_addr(&self) -> Option<SocketAddr>;

    fn kind(&self) -> TransportKind;
}

// ── Datagram ───────────────────────────────────────────────────────────

/// UDP socket with an optional default peer for [`Transport::send_unit`].
pub struct DatagramTransport {
    socket: UdpSocket,
    peer: Option<SocketAddr>,
}

impl DatagramTransport {
    /// Bind a receiving socket with an enlarged OS receive buffer.
    pub fn bind(addr: SocketAddr) -> Result<Self, TransferError> {
        let socket = create_udp_socket(addr).map_err(|source| TransferError::Bind { addr, source })?;
        Ok(Self { socket, peer: None })
    }

    /// Ephemeral socket for sending to `dest`, bound to the matching
    /// unspecified address.
    pub fn for_peer(dest: SocketAddr) -> Result<Self, TransferError> {
        let local = match dest {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, 0)),
        };
        let mut transport = Self::bind(local)?;
        transport.peer = Some(dest);
        Ok(transport)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn set_peer(&mut self, peer: SocketAddr) {
        self.peer = Some(peer);
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.socket.set_read_timeout(timeout)
    }

    pub fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<()> {
        let sent = self.socket.send_to(data, addr)?;
        if sent != data.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("datagram truncated: sent {} of {} bytes", sent, data.len()),
            ));
        }
        Ok(())
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf)
    }

    /// Block until a datagram arrives, waking every `poll` to honour `cancel`.
    pub fn recv_from_cancellable(
        &self,
        buf: &mut [u8],
        poll: Duration,
        cancel: &CancelToken,
    ) -> Result<(usize, SocketAddr), TransferError> {
        self.socket
            .set_read_timeout(Some(poll))
            .map_err(TransferError::Transport)?;
        loop {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            match self.socket.recv_from(buf) {
                Ok(received) => return Ok(received),
                Err(ref e) if is_timeout(e) || e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransferError::Transport(e)),
            }
        }
    }
}

impl Transport for DatagramTransport {
    fn send_unit(&mut self, data: &[u8]) -> io::Result<()> {
        let peer = self
            .peer
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no datagram peer"))?;
        self.send_to(data, peer)
    }

    fn recv_unit(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // Source addresses are not checked; any sender may inject payload.
        let (n, _) = self.socket.recv_from(buf)?;
        Ok(n)
    }

    fn receive_capacity(&self, _chunk_size: usize) -> usize {
        MAX_DATAGRAM_PAYLOAD
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
    }
}

fn create_udp_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(false)?;
    if let Err(e) = socket.set_recv_buffer_size(DATAGRAM_RECV_BUFFER) {
        tracing::debug!("could not enlarge UDP receive buffer: {}", e);
    }
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

// ── Stream ─────────────────────────────────────────────────────────────

/// One established TCP connection.
pub struct StreamTransport {
    stream: TcpStream,
    peer: SocketAddr,
}

impl StreamTransport {
    /// Connect to `addr`, optionally bounded by `timeout`.
    pub fn connect(addr: SocketAddr, timeout: Option<Duration>) -> Result<Self, TransferError> {
        let stream = match timeout {
            Some(t) => TcpStream::connect_timeout(&addr, t),
            None => TcpStream::connect(addr),
        }
        .map_err(TransferError::Transport)?;
        Self::from_stream(stream, addr)
    }

    fn from_stream(stream: TcpStream, peer: SocketAddr) -> Result<Self, TransferError> {
        stream.set_nonblocking(false).map_err(TransferError::Transport)?;
        let sock_ref = SockRef::from(&stream);
        sock_ref.set_nodelay(true).map_err(TransferError::Transport)?;
        if let Err(e) = sock_ref
            .set_send_buffer_size(STREAM_BUF_SIZE)
            .and_then(|_| sock_ref.set_recv_buffer_size(STREAM_BUF_SIZE))
        {
            tracing::debug!("could not resize TCP buffers: {}", e);
        }
        Ok(Self { stream, peer })
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_write_timeout(timeout)
    }

    /// Shut down both directions. Dropping also closes the socket; this just
    /// makes the end of the session explicit to the peer.
    pub fn close(self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                tracing::debug!("TCP shutdown error: {}", e);
            }
        }
    }
}

impl Transport for StreamTransport {
    fn send_unit(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data)
    }

    fn recv_unit(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.stream.read(buf) {
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }
}

/// Listening TCP socket that accepts one connection per session.
pub struct StreamListener {
    listener: TcpListener,
}

impl StreamListener {
    /// Bind with backlog 1. `SO_REUSEADDR` lets a repeating receiver re-bind
    /// the same port while the previous connection sits in TIME_WAIT.
    pub fn bind(addr: SocketAddr) -> Result<Self, TransferError> {
        let listener = create_tcp_listener(addr).map_err(|source| TransferError::Bind { addr, source })?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Wait for one connection, polling `cancel` every `poll`.
    pub fn accept(&self, poll: Duration, cancel: &CancelToken) -> Result<StreamTransport, TransferError> {
        self.listener
            .set_nonblocking(true)
            .map_err(TransferError::Transport)?;
        loop {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            match self.listener.accept() {
                Ok((stream, peer)) => return StreamTransport::from_stream(stream, peer),
                Err(ref e) if is_timeout(e) || e.kind() == io::ErrorKind::Interrupted => {
                    std::thread::sleep(poll);
                }
                Err(e) => return Err(TransferError::Transport(e)),
            }
        }
    }
}

fn create_tcp_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1)?;
    Ok(socket.into())
}

/// Outward-facing local IPv4 address, or loopback when none is routable.
///
/// "Connecting" a UDP socket sends nothing; it only asks the OS which
/// interface it would route through.
pub fn local_ip() -> IpAddr {
    let probe = || -> io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(10, 255, 255, 255), 1))?;
        Ok(socket.local_addr()?.ip())
    };
    match probe() {
        Ok(ip) if !ip.is_unspecified() => ip,
        _ => IpAddr::V4(Ipv4Addr::LOCALHOST),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn datagram_unit_roundtrip() {
        let receiver = DatagramTransport::bind(loopback()).unwrap();
        let mut sender = DatagramTransport::for_peer(receiver.local_addr().unwrap()).unwrap();
        sender.send_unit(b"payload").unwrap();

        receiver.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"payload");
        assert_eq!(from.port(), sender.local_addr().unwrap().port());
    }

    #[test]
    fn datagram_without_peer_cannot_send() {
        let mut transport = DatagramTransport::bind(loopback()).unwrap();
        let err = transport.send_unit(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn datagram_receive_capacity_ignores_chunk_size() {
        let transport = DatagramTransport::bind(loopback()).unwrap();
        assert_eq!(transport.receive_capacity(1024), MAX_DATAGRAM_PAYLOAD);
        assert_eq!(transport.kind(), TransportKind::Datagram);
    }

    #[test]
    fn cancelled_datagram_wait_returns_promptly() {
        let transport = DatagramTransport::bind(loopback()).unwrap();
        let cancel = CancelToken::new();
        let remote = cancel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            remote.cancel();
        });
        let mut buf = [0u8; 16];
        let err = transport
            .recv_from_cancellable(&mut buf, Duration::from_millis(10), &cancel)
            .unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
        handle.join().unwrap();
    }

    #[test]
    fn stream_connect_accept_and_eof() {
        let listener = StreamListener::bind(loopback()).unwrap();
        let addr = listener.local_addr().unwrap();
        let client = thread::spawn(move || {
            let mut stream = StreamTransport::connect(addr, Some(Duration::from_secs(2))).unwrap();
            stream.send_unit(b"hello").unwrap();
            stream.close();
        });

        let mut server = listener
            .accept(Duration::from_millis(10), &CancelToken::new())
            .unwrap();
        assert_eq!(server.kind(), TransportKind::Stream);
        let mut buf = [0u8; 16];
        let mut got = Vec::new();
        loop {
            let n = server.recv_unit(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, b"hello");
        client.join().unwrap();
    }

    #[test]
    fn cancelled_accept_returns_cancelled() {
        let listener = StreamListener::bind(loopback()).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = listener
            .accept(Duration::from_millis(10), &cancel)
            .err()
            .unwrap();
        assert!(matches!(err, TransferError::Cancelled));
    }

    #[test]
    fn second_bind_on_busy_port_is_bind_error() {
        let first = DatagramTransport::bind(loopback()).unwrap();
        let err = DatagramTransport::bind(first.local_addr().unwrap())
            .err()
            .unwrap();
        assert!(matches!(err, TransferError::Bind { .. }));
    }

    #[test]
    fn local_ip_is_never_unspecified() {
        assert!(!local_ip().is_unspecified());
    }
}
