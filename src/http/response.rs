//! Response side of the application interface: the start-response callback
//! and the body an application returns.

use crate::{
    errors::ResponseError,
    http::{
        body::{write_chunk, LAST_CHUNK},
        types::Version,
    },
    server::connection::Stream,
    AppError, SERVER_SOFTWARE,
};
use std::{
    cell::RefCell,
    fmt,
    io::{self, BufReader, Write},
};

/// Ordered `(name, value)` header pairs.
pub type HeaderList = Vec<(String, String)>;

/// Body returned by an application: a sequence of byte chunks.
///
/// A body known to hold a single chunk is sent with a `Content-Length`.
/// Anything else is streamed with `Transfer-Encoding: chunked` to HTTP/1.1
/// clients. HTTP/1.0 clients get a `Content-Length` when the body yields one
/// chunk, and a response delimited by closing the connection otherwise.
///
/// ```
/// use worker_web::ResponseBody;
///
/// let single = ResponseBody::from("hello");
/// let stream = ResponseBody::stream((0..3).map(|i| format!("part {i}\n")));
/// assert_eq!(single.len_hint(), Some(1));
/// assert_eq!(stream.len_hint(), Some(3));
/// ```
pub struct ResponseBody {
    chunks: Box<dyn Iterator<Item = Vec<u8>>>,
    len: Option<usize>,
}

impl ResponseBody {
    /// Body without any chunk.
    pub fn empty() -> Self {
        Self {
            chunks: Box::new(std::iter::empty()),
            len: Some(0),
        }
    }

    /// Body made of exactly one chunk.
    pub fn once<B: Into<Vec<u8>>>(data: B) -> Self {
        Self {
            chunks: Box::new(std::iter::once(data.into())),
            len: Some(1),
        }
    }

    /// Body produced lazily, one chunk per item.
    pub fn stream<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        I::IntoIter: 'static,
        B: Into<Vec<u8>> + 'static,
    {
        let chunks = chunks.into_iter();
        let len = match chunks.size_hint() {
            (lower, Some(upper)) if lower == upper => Some(lower),
            _ => None,
        };

        Self {
            chunks: Box::new(chunks.map(Into::into)),
            len,
        }
    }

    /// Number of chunks, when known up front.
    #[inline]
    pub fn len_hint(&self) -> Option<usize> {
        self.len
    }
}

impl Iterator for ResponseBody {
    type Item = Vec<u8>;

    #[inline]
    fn next(&mut self) -> Option<Vec<u8>> {
        self.chunks.next()
    }
}

impl From<&'static str> for ResponseBody {
    fn from(value: &'static str) -> Self {
        Self::once(value)
    }
}

impl From<String> for ResponseBody {
    fn from(value: String) -> Self {
        Self::once(value)
    }
}

impl From<Vec<u8>> for ResponseBody {
    fn from(value: Vec<u8>) -> Self {
        Self::once(value)
    }
}

impl From<&'static [u8]> for ResponseBody {
    fn from(value: &'static [u8]) -> Self {
        Self::once(value)
    }
}

impl From<Vec<Vec<u8>>> for ResponseBody {
    fn from(value: Vec<Vec<u8>>) -> Self {
        Self::stream(value)
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseBody").field("len", &self.len).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    /// The application declared a `Content-Length`.
    Declared,
    /// One section, length computed here.
    Length,
    Chunked,
    /// HTTP/1.0 stream, ends when the connection closes.
    UntilClose,
    /// 1xx, 204, 205 and 304 carry no body.
    NoBody,
}

/// Start-response callback handed to the application with each request.
///
/// The application calls [`start_response`](Self::start_response) once with
/// a status line and headers. Nothing reaches the client until the first body
/// bytes are ready, so a failing application can still replace the response
/// with [`start_response_with_error`](Self::start_response_with_error).
pub struct StartResponse<'a> {
    io: &'a RefCell<BufReader<Stream>>,
    version: Version,
    head: bool,
    client_close: bool,

    status: Option<String>,
    status_code: u16,
    headers: HeaderList,

    framing: Option<Framing>,
    keep_alive: bool,
    bytes_sent: u64,
    write_noted: bool,
}

impl<'a> StartResponse<'a> {
    pub(crate) fn new(
        io: &'a RefCell<BufReader<Stream>>,
        version: Version,
        head: bool,
        client_close: bool,
    ) -> Self {
        Self {
            io,
            version,
            head,
            client_close,

            status: None,
            status_code: 0,
            headers: Vec::new(),

            framing: None,
            keep_alive: false,
            bytes_sent: 0,
            write_noted: false,
        }
    }

    /// Records the status line (`"200 OK"`) and the response headers.
    ///
    /// May be called once per request. `Content-Length`, `Connection`,
    /// `Date` and `Server` are filled in when the application leaves them out.
    ///
    /// # Errors
    /// [`ResponseError::AlreadyStarted`] on a second call, and
    /// [`ResponseError::InvalidStatus`] / [`ResponseError::InvalidHeader`]
    /// for values that would break the response framing.
    pub fn start_response(&mut self, status: &str, headers: HeaderList) -> Result<(), ResponseError> {
        if self.status.is_some() {
            return Err(ResponseError::AlreadyStarted);
        }

        self.set(status, headers)
    }

    /// Replaces the pending response after `error` happened in the application.
    ///
    /// # Errors
    /// [`ResponseError::HeadersSent`], carrying `error`, when the headers
    /// already reached the client and the response cannot change anymore.
    pub fn start_response_with_error(
        &mut self,
        status: &str,
        headers: HeaderList,
        error: AppError,
    ) -> Result<(), ResponseError> {
        if self.framing.is_some() {
            return Err(ResponseError::HeadersSent(error));
        }

        self.set(status, headers)
    }

    /// Writes body bytes immediately, sending the headers first if needed.
    ///
    /// Returning the body from the application is preferred: it lets the
    /// server pick the framing. Bytes written here are framed as a stream
    /// unless the application declared a `Content-Length`.
    pub fn write(&mut self, data: &[u8]) -> Result<(), ResponseError> {
        if !self.write_noted {
            tracing::debug!("direct response write used, returning the body is preferred");
            self.write_noted = true;
        }

        if self.framing.is_none() {
            let framing = match self.declared_framing()? {
                Some(framing) => framing,
                None => self.stream_framing(),
            };
            self.send_headers(framing, Vec::new())?;
        }

        self.write_section(data)?;
        Ok(self.flush()?)
    }

    /// Status line recorded by `start_response`.
    #[inline]
    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    /// `true` once the status line and headers reached the client.
    #[inline]
    pub fn headers_sent(&self) -> bool {
        self.framing.is_some()
    }

    fn set(&mut self, status: &str, headers: HeaderList) -> Result<(), ResponseError> {
        self.status_code = parse_status(status)?;

        for (name, value) in &headers {
            let bad_name = name.is_empty() || name.bytes().any(|b| matches!(b, b'\r' | b'\n' | b':'));
            if bad_name || value.bytes().any(|b| matches!(b, b'\r' | b'\n')) {
                return Err(ResponseError::InvalidHeader(name.clone()));
            }
        }

        self.status = Some(status.to_string());
        self.headers = headers;
        Ok(())
    }

    /// Sends the returned body with the framing it calls for.
    pub(crate) fn finish(&mut self, mut body: ResponseBody) -> Result<(), ResponseError> {
        if self.framing.is_none() {
            if let Some(framing) = self.declared_framing()? {
                self.send_headers(framing, Vec::new())?;
            } else {
                match lookahead(&mut body, self.version) {
                    Sections::Single(data) => {
                        self.send_headers(Framing::Length, data)?;
                        return Ok(self.flush()?);
                    }
                    Sections::Stream(leading) => {
                        let framing = self.stream_framing();
                        self.send_headers(framing, Vec::new())?;
                        for chunk in leading {
                            self.write_section(&chunk)?;
                        }
                    }
                }
            }
        }

        for chunk in body {
            self.write_section(&chunk)?;
        }

        if self.framing == Some(Framing::Chunked) && !self.head {
            self.send(LAST_CHUNK)?;
        }
        Ok(self.flush()?)
    }

    // Framing that does not depend on the body, if any.
    fn declared_framing(&self) -> Result<Option<Framing>, ResponseError> {
        if self.status.is_none() {
            return Err(ResponseError::NotStarted);
        }

        if matches!(self.status_code, 100..=199 | 204 | 205 | 304) {
            return Ok(Some(Framing::NoBody));
        }

        Ok(self.header("Content-Length").map(|_| Framing::Declared))
    }

    fn stream_framing(&self) -> Framing {
        match self.version {
            Version::Http11 => Framing::Chunked,
            Version::Http10 => Framing::UntilClose,
        }
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    // Writes the status line and headers, followed by `body` for a
    // single-section response.
    fn send_headers(&mut self, framing: Framing, body: Vec<u8>) -> Result<(), ResponseError> {
        match framing {
            Framing::Length => self
                .headers
                .push(("Content-Length".to_string(), body.len().to_string())),
            Framing::Chunked => self
                .headers
                .push(("Transfer-Encoding".to_string(), "chunked".to_string())),
            _ => {}
        }

        let connection = match (framing, self.header("Connection")) {
            (Framing::UntilClose, _) => {
                self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case("Connection"));
                Some("close")
            }
            (_, Some(_)) => None,
            _ => Some(match (self.version, self.client_close) {
                (Version::Http11, false) => "keep-alive",
                _ => "close",
            }),
        };
        if let Some(value) = connection {
            self.headers.push(("Connection".to_string(), value.to_string()));
        }
        self.keep_alive = self
            .header("Connection")
            .is_some_and(|value| !value.trim().eq_ignore_ascii_case("close"));

        if self.header("Date").is_none() {
            let date = chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT");
            self.headers.push(("Date".to_string(), date.to_string()));
        }
        if self.header("Server").is_none() {
            self.headers.push(("Server".to_string(), SERVER_SOFTWARE.to_string()));
        }

        let status = self.status.as_deref().unwrap_or("500 Internal Server Error");
        let mut out = Vec::with_capacity(256 + body.len());
        out.extend_from_slice(b"HTTP/1.1 ");
        out.extend_from_slice(status.as_bytes());
        out.extend_from_slice(b"\r\n");
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");

        if !self.head && framing != Framing::NoBody {
            out.extend_from_slice(&body);
            self.bytes_sent += body.len() as u64;
        }

        self.framing = Some(framing);
        Ok(self.send(&out)?)
    }

    fn write_section(&mut self, data: &[u8]) -> io::Result<()> {
        if data.is_empty() || self.head || self.framing == Some(Framing::NoBody) {
            return Ok(());
        }

        match self.framing {
            Some(Framing::Chunked) => {
                let mut framed = Vec::with_capacity(data.len() + 16);
                write_chunk(&mut framed, data)?;
                self.send(&framed)?;
            }
            _ => self.send(data)?,
        }

        self.bytes_sent += data.len() as u64;
        Ok(())
    }

    fn send(&self, data: &[u8]) -> io::Result<()> {
        self.stream()?.get_mut().write_all(data)
    }

    fn flush(&self) -> io::Result<()> {
        self.stream()?.get_mut().flush()
    }

    fn stream(&self) -> io::Result<std::cell::RefMut<'_, BufReader<Stream>>> {
        self.io
            .try_borrow_mut()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "connection is busy"))
    }

    /// Writes a complete canned response, bypassing the recorded headers.
    pub(crate) fn send_raw(&mut self, response: &[u8]) -> io::Result<()> {
        self.framing = Some(Framing::NoBody);
        self.keep_alive = false;
        self.send(response)?;
        self.flush()
    }

    /// Status code for the request log, 0 before `start_response`.
    #[inline]
    pub(crate) fn status_code(&self) -> u16 {
        self.status_code
    }

    #[inline]
    pub(crate) fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    #[inline]
    pub(crate) fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }
}

impl fmt::Debug for StartResponse<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("headers_sent", &self.headers_sent())
            .finish()
    }
}

/// Validates a status line and returns its code.
pub(crate) fn parse_status(status: &str) -> Result<u16, ResponseError> {
    let bytes = status.as_bytes();
    let valid = bytes.len() >= 3
        && bytes[..3].iter().all(u8::is_ascii_digit)
        && matches!(bytes.get(3), None | Some(b' '))
        && !bytes.iter().any(|b| matches!(b, b'\r' | b'\n'));

    match valid {
        true => Ok(bytes[..3]
            .iter()
            .fold(0, |code, b| code * 10 + u16::from(b - b'0'))),
        false => Err(ResponseError::InvalidStatus(status.to_string())),
    }
}

enum Sections {
    /// Sent in one piece with a computed `Content-Length`.
    Single(Vec<u8>),
    /// Streamed; holds the chunks already pulled from the body.
    Stream(Vec<Vec<u8>>),
}

// A body known to hold at most one chunk is sent in one piece. Otherwise
// HTTP/1.1 streams right away, while older clients get a `Content-Length`
// when the body turns out to yield a single non-empty chunk.
fn lookahead(body: &mut ResponseBody, version: Version) -> Sections {
    if matches!(body.len_hint(), Some(0 | 1)) {
        return Sections::Single(body.next().unwrap_or_default());
    }
    if version == Version::Http11 {
        return Sections::Stream(Vec::new());
    }

    let mut chunks = body.by_ref().filter(|chunk| !chunk.is_empty());
    match (chunks.next(), chunks.next()) {
        (first, None) => Sections::Single(first.unwrap_or_default()),
        (Some(first), Some(second)) => Sections::Stream(vec![first, second]),
        (None, Some(second)) => Sections::Stream(vec![second]),
    }
}



#[cfg(test)]
mod start_response_tests {
    use super::*;
    use crate::server::connection::Connection;
    use std::sync::{Arc, Mutex};

    fn headers(pairs: &[(&str, &str)]) -> HeaderList {
        pairs.iter().map(|(n, v)| (n.to_string(), v.to_string())).collect()
    }

    // Output with the Date line removed
    fn written(out: &Arc<Mutex<Vec<u8>>>) -> String {
        let raw = String::from_utf8(out.lock().unwrap().clone()).unwrap();
        let (head, body) = raw.split_once("\r\n\r\n").unwrap();
        assert!(head.contains("\r\nDate: "), "{head}");

        let head: Vec<_> = head.split("\r\n").filter(|l| !l.starts_with("Date: ")).collect();
        format!("{}\r\n\r\n{body}", head.join("\r\n"))
    }

    fn respond(
        version: Version,
        head: bool,
        status: &str,
        pairs: &[(&str, &str)],
        body: ResponseBody,
    ) -> (String, bool) {
        let (conn, out) = Connection::mock("");
        let mut start = StartResponse::new(conn.shared_io(), version, head, false);

        start.start_response(status, headers(pairs)).unwrap();
        start.finish(body).unwrap();

        (written(&out), start.keep_alive())
    }

    const SERVER: &str = concat!("Server: worker_web/", env!("CARGO_PKG_VERSION"));

    #[test]
    fn single_chunk_gets_length() {
        let (out, keep_alive) = respond(
            Version::Http11,
            false,
            "200 OK",
            &[("Content-Type", "text/plain")],
            ResponseBody::from(vec![b"hi".to_vec()]),
        );

        assert_eq!(
            out,
            format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\
                 Connection: keep-alive\r\n{SERVER}\r\n\r\nhi"
            )
        );
        assert!(keep_alive);
    }

    #[test]
    fn lazy_single_chunk() {
        fn lazy() -> ResponseBody {
            ResponseBody::stream(["skip", "lazy"].into_iter().filter(|chunk| *chunk == "lazy"))
        }
        assert_eq!(lazy().len_hint(), None);

        // HTTP/1.1 only trusts a known length.
        let (out, _) = respond(Version::Http11, false, "200 OK", &[], lazy());
        assert!(out.contains("Transfer-Encoding: chunked\r\n"), "{out}");
        assert!(out.ends_with("\r\n\r\n4\r\nlazy\r\n0\r\n\r\n"), "{out}");

        let (out, keep_alive) = respond(Version::Http10, false, "200 OK", &[("Connection", "keep-alive")], lazy());
        assert!(out.contains("Content-Length: 4\r\n"), "{out}");
        assert!(out.ends_with("\r\n\r\nlazy"));
        assert!(keep_alive);
    }

    #[test]
    fn multi_chunk_is_chunked_on_http11() {
        let body = ResponseBody::from(vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
        let (out, keep_alive) = respond(Version::Http11, false, "200 OK", &[], body);

        assert!(out.contains("Transfer-Encoding: chunked\r\n"), "{out}");
        assert!(!out.contains("Content-Length"));
        assert!(out.ends_with("\r\n\r\n3\r\none\r\n3\r\ntwo\r\n5\r\nthree\r\n0\r\n\r\n"), "{out}");
        assert!(keep_alive);
    }

    #[test]
    fn multi_chunk_closes_on_http10() {
        let body = ResponseBody::from(vec![b"one".to_vec(), b"two".to_vec()]);
        let (out, keep_alive) = respond(
            Version::Http10,
            false,
            "200 OK",
            &[("Connection", "keep-alive")],
            body,
        );

        assert!(out.contains("Connection: close\r\n"), "{out}");
        assert!(!out.contains("keep-alive"));
        assert!(!out.contains("Transfer-Encoding"));
        assert!(out.ends_with("\r\n\r\nonetwo"));
        assert!(!keep_alive);
    }

    #[test]
    fn declared_length_is_honored() {
        let body = ResponseBody::from(vec![b"ab".to_vec(), b"cd".to_vec()]);
        let (out, _) = respond(Version::Http11, false, "200 OK", &[("content-length", "4")], body);

        assert!(out.starts_with("HTTP/1.1 200 OK\r\ncontent-length: 4\r\nConnection: keep-alive\r\n"), "{out}");
        assert!(!out.contains("Transfer-Encoding"));
        assert!(out.ends_with("\r\n\r\nabcd"));
    }

    #[test]
    fn empty_body() {
        let (out, _) = respond(Version::Http11, false, "200 OK", &[], ResponseBody::empty());
        assert!(out.contains("Content-Length: 0\r\n"), "{out}");
        assert!(out.ends_with("\r\n\r\n"));
    }

    #[test]
    fn head_keeps_headers_drops_body() {
        let (out, _) = respond(Version::Http11, true, "200 OK", &[], ResponseBody::from("hello"));
        assert!(out.contains("Content-Length: 5\r\n"), "{out}");
        assert!(out.ends_with("\r\n\r\n"));

        let body = ResponseBody::from(vec![b"a".to_vec(), b"b".to_vec()]);
        let (out, _) = respond(Version::Http11, true, "200 OK", &[], body);
        assert!(out.contains("Transfer-Encoding: chunked\r\n"), "{out}");
        assert!(out.ends_with("\r\n\r\n"));
    }

    #[test]
    fn no_body_statuses() {
        for status in ["204 No Content", "304 Not Modified"] {
            let (out, _) = respond(Version::Http11, false, status, &[], ResponseBody::from("ignored"));
            assert!(!out.contains("Content-Length"), "{out}");
            assert!(!out.contains("Transfer-Encoding"), "{out}");
            assert!(out.ends_with("\r\n\r\n"), "{out}");
        }
    }

    #[test]
    fn connection_header_precedence() {
        #[rustfmt::skip]
        let cases = [
            // version, client asked to close, app header, expected header, keep-alive
            (Version::Http11, false, None, "keep-alive", true),
            (Version::Http11, true, None, "close", false),
            (Version::Http10, false, None, "close", false),
            (Version::Http11, false, Some("close"), "close", false),
            (Version::Http10, false, Some("keep-alive"), "keep-alive", true),
        ];

        for (version, client_close, app, expected, keep_alive) in cases {
            let (conn, out) = Connection::mock("");
            let mut start = StartResponse::new(conn.shared_io(), version, false, client_close);

            let pairs: Vec<_> = app.map(|v| ("Connection", v)).into_iter().collect();
            start.start_response("200 OK", headers(&pairs)).unwrap();
            start.finish(ResponseBody::from("x")).unwrap();

            let out = written(&out);
            assert!(out.contains(&format!("Connection: {expected}\r\n")), "{out}");
            assert_eq!(out.matches("Connection:").count(), 1, "{out}");
            assert_eq!(start.keep_alive(), keep_alive, "{out}");
        }
    }

    #[test]
    fn app_date_and_server_win() {
        let (conn, out) = Connection::mock("");
        let mut start = StartResponse::new(conn.shared_io(), Version::Http11, false, false);

        let pairs = [("Date", "Thu, 01 Jan 1970 00:00:00 GMT"), ("Server", "custom")];
        start.start_response("200 OK", headers(&pairs)).unwrap();
        start.finish(ResponseBody::empty()).unwrap();

        let raw = String::from_utf8(out.lock().unwrap().clone()).unwrap();
        assert_eq!(raw.matches("Date:").count(), 1);
        assert!(raw.contains("Server: custom\r\n"));
        assert!(!raw.contains(SERVER));
    }

    #[test]
    fn start_response_rules() {
        let (conn, _) = Connection::mock("");
        let mut start = StartResponse::new(conn.shared_io(), Version::Http11, false, false);

        assert!(matches!(start.write(b"early"), Err(ResponseError::NotStarted)));
        assert!(matches!(
            start.start_response("OK", vec![]),
            Err(ResponseError::InvalidStatus(_))
        ));
        assert!(matches!(
            start.start_response("200 OK", headers(&[("X-Bad", "a\r\nb")])),
            Err(ResponseError::InvalidHeader(_))
        ));

        start.start_response("200 OK", vec![]).unwrap();
        assert!(matches!(
            start.start_response("200 OK", vec![]),
            Err(ResponseError::AlreadyStarted)
        ));

        start
            .start_response_with_error("503 Service Unavailable", vec![], "db down".into())
            .unwrap();
        assert_eq!(start.status(), Some("503 Service Unavailable"));
        assert_eq!(start.status_code(), 503);
    }

    #[test]
    fn error_recovery_after_headers_sent() {
        let (conn, _) = Connection::mock("");
        let mut start = StartResponse::new(conn.shared_io(), Version::Http11, false, false);

        start.start_response("200 OK", vec![]).unwrap();
        start.write(b"partial").unwrap();
        assert!(start.headers_sent());

        let err = start
            .start_response_with_error("500 Internal Server Error", vec![], "late failure".into())
            .unwrap_err();
        match err {
            ResponseError::HeadersSent(source) => assert_eq!(source.to_string(), "late failure"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn direct_write_then_returned_body() {
        let (conn, out) = Connection::mock("");
        let mut start = StartResponse::new(conn.shared_io(), Version::Http11, false, false);

        start.start_response("200 OK", vec![]).unwrap();
        start.write(b"first").unwrap();
        start.finish(ResponseBody::from("second")).unwrap();

        let out = written(&out);
        assert!(out.contains("Transfer-Encoding: chunked\r\n"), "{out}");
        assert!(out.ends_with("\r\n\r\n5\r\nfirst\r\n6\r\nsecond\r\n0\r\n\r\n"), "{out}");
        assert_eq!(start.bytes_sent(), 11);
    }

    #[test]
    fn finish_without_start_response() {
        let (conn, out) = Connection::mock("");
        let mut start = StartResponse::new(conn.shared_io(), Version::Http11, false, false);

        assert!(matches!(
            start.finish(ResponseBody::from("x")),
            Err(ResponseError::NotStarted)
        ));
        assert!(out.lock().unwrap().is_empty());
    }
}
