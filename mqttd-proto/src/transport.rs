use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::thread;
use std::time::{Duration, Instant};

/// The byte-level session a connection runs over.
///
/// Plain TCP, TLS and WebSocket sessions all fit behind this surface, so
/// wrappers layer transparently; the runtime only ever calls `send`,
/// `recv` and `shutdown`. Sockets are nonblocking once registered with
/// the reader loop; `recv` and `send` report `WouldBlock` accordingly.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Writes as many bytes as the socket accepts right now.
    fn send(&self, buf: &[u8]) -> io::Result<usize>;

    /// Reads whatever bytes are available right now.
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Closes both directions; subsequent reads observe EOF.
    fn shutdown(&self);

    /// The peer's address, when the transport knows it.
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// The server name the peer asked for during session setup
    /// (TLS SNI or WebSocket Host); `None` for plain TCP.
    fn server_name(&self) -> Option<String> {
        None
    }

    /// The descriptor to register with the reader loop's poll set.
    fn raw_fd(&self) -> RawFd;
}

/// Plain TCP transport.
pub struct TcpTransport {
    stream: TcpStream,
    peer: Option<SocketAddr>,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        TcpTransport { stream, peer }
    }
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TcpTransport").field("peer", &self.peer).finish()
    }
}

impl Transport for TcpTransport {
    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        (&self.stream).write(buf)
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.stream).read(buf)
    }

    fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

/// Writes the whole buffer to a nonblocking transport.
///
/// Backpressure from a peer with a full TCP window surfaces as
/// `WouldBlock`; the writer yields briefly and retries until the window
/// elapses. The sequencer is the only caller, so at most one thread per
/// connection sits in this loop.
pub(crate) fn write_all(transport: &dyn Transport, mut buf: &[u8], window: Duration) -> io::Result<()> {
    let deadline = Instant::now() + window;

    while !buf.is_empty() {
        match transport.send(buf) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => buf = &buf[n..],
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(io::ErrorKind::TimedOut.into());
                }
                thread::sleep(Duration::from_millis(1));
            }
            Err(err) => return Err(err),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    #[test]
    fn test_tcp_transport_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        let client = TcpTransport::new(client);
        let server = TcpTransport::new(server);

        assert!(client.peer_addr().is_some());
        assert!(client.server_name().is_none());

        write_all(&client, b"hello", Duration::from_secs(1)).unwrap();

        let mut buf = [0u8; 16];
        let n = server.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");

        client.shutdown();
        assert_eq!(server.recv(&mut buf).unwrap(), 0, "EOF after shutdown");
    }
}
