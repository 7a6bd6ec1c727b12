#![allow(dead_code)]

use std::{
    io::{BufRead, BufReader, Read, Write},
    net::{SocketAddr, TcpStream},
    path::PathBuf,
    thread,
    time::{Duration, Instant},
};
use worker_web::{
    limits::{ConnLimits, ServerLimits},
    BindTarget, ChunkedReader, Server, ServerBuilder,
};

pub fn data(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/data").join(name)
}

pub fn server_limits() -> ServerLimits {
    ServerLimits {
        min_threads: 2,
        max_threads: 10,
        stop_check_interval: Duration::from_millis(20),
        ..ServerLimits::default()
    }
}

pub fn conn_limits() -> ConnLimits {
    ConnLimits {
        socket_timeout: Duration::from_secs(2),
        ..ConnLimits::default()
    }
}

/// Loopback builder with fast shutdown and no signal handling.
pub fn builder() -> ServerBuilder {
    Server::builder()
        .bind(BindTarget::new("127.0.0.1", 0))
        .server_limits(server_limits())
        .connection_limits(conn_limits())
        .handle_signals(false)
}

pub fn start(builder: ServerBuilder) -> (Server, SocketAddr) {
    let server = builder.build().unwrap();
    server.start(true).unwrap();
    let addr = server.local_addrs()[0];

    (server, addr)
}

pub fn wait_for(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    done()
}

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn text(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap()
    }
}

/// Minimal blocking HTTP/1.x client over any stream.
pub struct Client<S: Read + Write> {
    stream: BufReader<S>,
}

impl Client<TcpStream> {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        Self::new(stream)
    }
}

impl<S: Read + Write> Client<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    pub fn send(&mut self, raw: &[u8]) {
        let stream = self.stream.get_mut();
        stream.write_all(raw).unwrap();
        stream.flush().unwrap();
    }

    pub fn get(&mut self, path: &str) -> Response {
        self.send(format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n").as_bytes());
        self.response()
    }

    /// Reads one response; the body is framed by its headers. `head` skips
    /// the body as for a HEAD request.
    pub fn response_to(&mut self, head: bool) -> Response {
        let status_line = self.line();
        let mut parts = status_line.splitn(3, ' ');
        let _version = parts.next().unwrap();
        let status = parts.next().unwrap().parse().unwrap();
        let reason = parts.next().unwrap_or_default().to_owned();

        let mut headers = Vec::new();
        loop {
            let line = self.line();
            if line.is_empty() {
                break;
            }
            let (name, value) = line.split_once(':').unwrap();
            headers.push((name.to_owned(), value.trim().to_owned()));
        }

        let mut response = Response {
            status,
            reason,
            headers,
            body: Vec::new(),
        };

        if head || matches!(status, 100..=199 | 204 | 304) {
            return response;
        }

        if let Some(len) = response.header("Content-Length") {
            let mut body = vec![0; len.parse().unwrap()];
            self.stream.read_exact(&mut body).unwrap();
            response.body = body;
        } else if response.header("Transfer-Encoding") == Some("chunked") {
            ChunkedReader::new(&mut self.stream)
                .read_to_end(&mut response.body)
                .unwrap();
        } else {
            self.stream.read_to_end(&mut response.body).unwrap();
        }

        response
    }

    pub fn response(&mut self) -> Response {
        self.response_to(false)
    }

    /// Everything until the server closes the connection.
    pub fn read_all(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        self.stream.read_to_end(&mut out).unwrap();
        out
    }

    /// `true` when the server closed the connection.
    pub fn is_closed(&mut self) -> bool {
        let mut byte = [0; 1];
        match self.stream.read(&mut byte) {
            Ok(read) => read == 0,
            Err(err) => err.kind() == std::io::ErrorKind::ConnectionReset,
        }
    }

    pub fn get_ref(&self) -> &S {
        self.stream.get_ref()
    }

    fn line(&mut self) -> String {
        let mut line = String::new();
        self.stream.read_line(&mut line).unwrap();
        line.trim_end_matches(['\r', '\n']).to_owned()
    }
}
