use crate::limits::ConnLimits;
use rustls::{ServerConfig, ServerConnection, StreamOwned};
use std::{
    cell::RefCell,
    io::{self, BufRead, BufReader, Read, Write},
    net::{IpAddr, Shutdown, SocketAddr, TcpStream},
    sync::Arc,
    time::{Duration, Instant},
};

#[cfg(unix)]
use std::os::fd::{AsRawFd, RawFd};

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Transport under a [`Connection`].
pub(crate) enum Stream {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ServerConnection, TcpStream>>),
    #[cfg(test)]
    Mock(mock::MockStream),
}

impl Stream {
    #[inline]
    pub(crate) fn tcp(&self) -> Option<&TcpStream> {
        match self {
            Stream::Plain(stream) => Some(stream),
            Stream::Tls(tls) => Some(&tls.sock),
            #[cfg(test)]
            Stream::Mock(_) => None,
        }
    }
}

impl Read for Stream {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(stream) => stream.read(buf),
            Stream::Tls(tls) => tls.read(buf),
            #[cfg(test)]
            Stream::Mock(mock) => mock.read(buf),
        }
    }
}

impl Write for Stream {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(stream) => stream.write(buf),
            Stream::Tls(tls) => tls.write(buf),
            #[cfg(test)]
            Stream::Mock(mock) => mock.write(buf),
        }
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Plain(stream) => stream.flush(),
            Stream::Tls(tls) => tls.flush(),
            #[cfg(test)]
            Stream::Mock(mock) => mock.flush(),
        }
    }
}

/// One accepted client socket and what is known about it.
///
/// A connection is owned by exactly one thread at a time: the listener that
/// accepted it, the worker serving it, or the monitor while it is parked.
/// It moves between them through the server queues only. Debug builds
/// check this on every socket access.
pub struct Connection {
    io: RefCell<BufReader<Stream>>,

    client_addr: IpAddr,
    client_port: u16,
    server_addr: SocketAddr,
    secure: bool,

    pub(crate) start_time: Instant,
    closed: bool,

    #[cfg(debug_assertions)]
    owner: Option<std::thread::ThreadId>,
}

impl Connection {
    /// Wraps an accepted socket, applying the socket timeout and, for TLS
    /// listeners, a server session whose handshake runs on the first read.
    pub(crate) fn new(
        stream: TcpStream,
        peer: SocketAddr,
        tls: Option<&Arc<ServerConfig>>,
        limits: &ConnLimits,
    ) -> io::Result<Self> {
        let timeout = Some(limits.socket_timeout).filter(|t| !t.is_zero());

        stream.set_nonblocking(false)?;
        stream.set_read_timeout(timeout)?;
        stream.set_write_timeout(timeout)?;
        let _ = stream.set_nodelay(true);

        let local = stream.local_addr()?;

        let (stream, secure) = match tls {
            Some(config) => {
                let session = ServerConnection::new(Arc::clone(config))
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

                (Stream::Tls(Box::new(StreamOwned::new(session, stream))), true)
            }
            None => (Stream::Plain(stream), false),
        };

        Ok(Self::from_stream(stream, peer, local, secure))
    }

    fn from_stream(stream: Stream, peer: SocketAddr, local: SocketAddr, secure: bool) -> Self {
        Self {
            io: RefCell::new(BufReader::with_capacity(READ_BUFFER_SIZE, stream)),

            client_addr: peer.ip(),
            client_port: peer.port(),
            server_addr: local,
            secure,

            start_time: Instant::now(),
            closed: false,

            #[cfg(debug_assertions)]
            owner: Some(std::thread::current().id()),
        }
    }

    /// Address of the client.
    #[inline]
    pub fn client_addr(&self) -> IpAddr {
        self.client_addr
    }

    /// Port of the client.
    #[inline]
    pub fn client_port(&self) -> u16 {
        self.client_port
    }

    /// Local address the connection was accepted on.
    #[inline]
    pub fn server_addr(&self) -> IpAddr {
        self.server_addr.ip()
    }

    /// Local port the connection was accepted on.
    #[inline]
    pub fn server_port(&self) -> u16 {
        self.server_addr.port()
    }

    /// `true` for connections accepted by a TLS listener.
    #[inline]
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Time since the connection was accepted or last returned from the monitor.
    #[inline]
    pub fn age(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// `true` once [`close`](Self::close) was called.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Reads at most `n` bytes. An empty result means the client closed the socket.
    pub fn recv(&mut self, n: usize) -> io::Result<Vec<u8>> {
        self.check_owner();

        let mut buf = vec![0; n];
        let read = self.io.get_mut().read(&mut buf)?;
        buf.truncate(read);

        Ok(buf)
    }

    /// Writes once and returns how many bytes the socket accepted.
    pub fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        self.check_owner();

        let stream = self.io.get_mut().get_mut();
        let written = stream.write(data)?;
        stream.flush()?;

        Ok(written)
    }

    /// Writes the whole buffer, retrying after partial writes and interrupts.
    pub fn sendall(&mut self, mut data: &[u8]) -> io::Result<()> {
        self.check_owner();

        let stream = self.io.get_mut().get_mut();
        while !data.is_empty() {
            match stream.write(data) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(written) => data = &data[written..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        stream.flush()
    }

    /// Buffered reader over the connection, shared by every request on it.
    #[inline]
    pub fn makefile(&mut self) -> &mut impl BufRead {
        self.check_owner();
        self.io.get_mut()
    }

    /// Shuts the socket down. Calling it again, or on a socket the peer already
    /// tore down, is not an error.
    pub fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let io = self.io.get_mut();

        if let Stream::Tls(tls) = io.get_mut() {
            tls.conn.send_close_notify();
            while tls.conn.wants_write() {
                if tls.conn.write_tls(&mut tls.sock).is_err() {
                    break;
                }
            }
        }

        match io.get_ref().tcp().map(|stream| stream.shutdown(Shutdown::Both)) {
            Some(Err(e)) if !is_already_closed(&e) => Err(e),
            _ => Ok(()),
        }
    }

    /// DER encoding of the certificate the client presented during the TLS
    /// handshake, if any.
    pub fn peer_certificate(&self) -> Option<Vec<u8>> {
        self.check_owner();

        match self.io.try_borrow().ok()?.get_ref() {
            Stream::Tls(tls) => tls
                .conn
                .peer_certificates()
                .and_then(|chain| chain.first())
                .map(|cert| cert.as_ref().to_vec()),
            _ => None,
        }
    }

    /// `true` when a TLS connection that has not started its handshake
    /// receives what looks like a plaintext request line. Blocks until the
    /// first byte arrives or the socket times out.
    pub(crate) fn is_plain_http_on_tls(&mut self) -> io::Result<bool> {
        let io = self.io_mut();
        if !io.buffer().is_empty() {
            return Ok(false);
        }

        let Stream::Tls(tls) = io.get_mut() else {
            return Ok(false);
        };
        if !tls.conn.is_handshaking() || tls.conn.wants_write() {
            return Ok(false);
        }

        // A TLS record starts with a content type byte (0x14..=0x18).
        let mut first = [0; 1];
        match tls.sock.peek(&mut first)? {
            0 => Ok(false),
            _ => Ok(first[0].is_ascii_uppercase()),
        }
    }

    /// `true` while a TLS session has not completed its handshake.
    pub(crate) fn is_handshaking(&self) -> bool {
        match self.io.try_borrow() {
            Ok(io) => matches!(io.get_ref(), Stream::Tls(tls) if tls.conn.is_handshaking()),
            Err(_) => false,
        }
    }

    /// Writes straight to the socket, below any TLS session.
    pub(crate) fn send_unencrypted(&mut self, data: &[u8]) -> io::Result<()> {
        match self.io_mut().get_mut() {
            Stream::Tls(tls) => {
                tls.sock.write_all(data)?;
                tls.sock.flush()
            }
            stream => {
                stream.write_all(data)?;
                stream.flush()
            }
        }
    }

    /// Shared handle used while one request cycle runs: the body reader and
    /// the response writer each borrow it for the duration of a single call.
    #[inline]
    pub(crate) fn shared_io(&self) -> &RefCell<BufReader<Stream>> {
        self.check_owner();
        &self.io
    }

    #[inline]
    pub(crate) fn io_mut(&mut self) -> &mut BufReader<Stream> {
        self.check_owner();
        self.io.get_mut()
    }

    /// Restarts the idle clock.
    #[inline]
    pub(crate) fn reset_clock(&mut self) {
        self.start_time = Instant::now();
    }

    /// `true` when a read would return without touching the socket: bytes
    /// sit in the read buffer or in the TLS session.
    pub(crate) fn has_buffered_data(&mut self) -> bool {
        let io = self.io.get_mut();
        if !io.buffer().is_empty() {
            return true;
        }

        match io.get_mut() {
            Stream::Tls(tls) => tls
                .conn
                .process_new_packets()
                .map(|state| state.plaintext_bytes_to_read() > 0)
                .unwrap_or(false),
            _ => false,
        }
    }

    #[cfg(unix)]
    #[inline]
    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        self.io.borrow().get_ref().tcp().map(|stream| stream.as_raw_fd())
    }

    /// Records the calling thread as the only one allowed to touch the socket.
    #[inline]
    pub(crate) fn claim(&mut self) {
        #[cfg(debug_assertions)]
        {
            self.owner = Some(std::thread::current().id());
        }
    }

    #[inline(always)]
    fn check_owner(&self) {
        #[cfg(debug_assertions)]
        debug_assert_eq!(
            self.owner,
            Some(std::thread::current().id()),
            "connection used by a thread that does not own it"
        );
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("client_addr", &self.client_addr)
            .field("client_port", &self.client_port)
            .field("server_addr", &self.server_addr)
            .field("secure", &self.secure)
            .field("closed", &self.closed)
            .finish()
    }
}

// EBADF means the descriptor is gone already.
#[inline]
fn is_already_closed(err: &io::Error) -> bool {
    const EBADF: i32 = 9;
    err.kind() == io::ErrorKind::NotConnected || err.raw_os_error() == Some(EBADF)
}
