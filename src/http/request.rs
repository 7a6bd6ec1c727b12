use crate::{
    errors::{is_timeout, ErrorKind},
    http::{
        body::Body,
        types::{self, Method, Version},
    },
    limits::ReqLimits,
    SERVER_SOFTWARE,
};
use base64::prelude::*;
use std::{
    borrow::Cow,
    cell::RefCell,
    io::{self, BufRead},
    net::IpAddr,
};

// LINES

/// Outcome of [`read_line`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LineRead {
    /// A full line, terminator included, was appended.
    Complete,
    /// The stream ended. Whatever arrived before is in the buffer.
    Eof,
    /// The line is longer than the limit. Its start was consumed.
    TooLong,
}

/// Appends one `\n`-terminated line to `buf`, reading at most `limit` bytes.
///
/// Bytes are consumed from the reader as they are copied, so after an error
/// (a timeout, for instance) `buf` holds exactly what was taken.
pub(crate) fn read_line<R: BufRead + ?Sized>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    limit: usize,
) -> io::Result<LineRead> {
    loop {
        let available = match reader.fill_buf() {
            Ok(available) => available,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        if available.is_empty() {
            return Ok(LineRead::Eof);
        }

        let (take, done) = match memchr::memchr(b'\n', available) {
            Some(pos) => (pos + 1, true),
            None => (available.len(), false),
        };

        if buf.len() + take > limit {
            let room = limit.saturating_sub(buf.len());
            buf.extend_from_slice(&available[..room]);
            reader.consume(room);
            return Ok(LineRead::TooLong);
        }

        buf.extend_from_slice(&available[..take]);
        reader.consume(take);

        if done {
            return Ok(LineRead::Complete);
        }
    }
}

// REQUEST LINE

/// Parsed `METHOD SP target SP PROTOCOL` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RequestLine {
    pub(crate) method: Method,
    pub(crate) scheme: Option<String>,
    pub(crate) host: Option<String>,
    pub(crate) path: String,
    pub(crate) query: String,
    pub(crate) version: Version,
    pub(crate) raw: String,
}

impl RequestLine {
    pub(crate) fn parse(line: &[u8]) -> Result<Self, ErrorKind> {
        let line = line
            .strip_suffix(b"\n")
            .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
            .unwrap_or(line);

        let mut spaces = memchr::memchr_iter(b' ', line);
        let (Some(first), Some(second), None) = (spaces.next(), spaces.next(), spaces.next()) else {
            return Err(ErrorKind::InvalidRequestLine);
        };

        let method = Method::from_bytes(&line[..first])?;
        let target = &line[first + 1..second];
        let version = Version::from_bytes(&line[second + 1..])?;

        let (scheme, host, origin) = split_absolute(target)?;
        let (path, query) = match origin {
            b"*" => ("*".to_string(), String::new()),
            [b'/', ..] => match memchr::memchr(b'?', origin) {
                Some(pos) => (types::decode_path(&origin[..pos]), types::latin1(&origin[pos + 1..])),
                None => (types::decode_path(origin), String::new()),
            },
            _ => return Err(ErrorKind::InvalidUrl),
        };

        Ok(Self {
            method,
            scheme,
            host,
            path,
            query,
            version,
            raw: types::latin1(line),
        })
    }
}

type Absolute<'a> = (Option<String>, Option<String>, &'a [u8]);

// `scheme://host/path?query` -> (scheme, host, `/path?query`)
fn split_absolute(target: &[u8]) -> Result<Absolute<'_>, ErrorKind> {
    if matches!(target, [b'/', ..] | b"*") {
        return Ok((None, None, target));
    }

    let Some(pos) = memchr::memmem::find(target, b"://") else {
        return Ok((None, None, target));
    };

    let scheme = &target[..pos];
    if scheme.is_empty() || !scheme.iter().all(|b| b.is_ascii_alphanumeric() || b"+-.".contains(b)) {
        return Err(ErrorKind::InvalidUrl);
    }

    let rest = &target[pos + 3..];
    let host_end = rest
        .iter()
        .position(|&b| b == b'/' || b == b'?')
        .unwrap_or(rest.len());
    if host_end == 0 {
        return Err(ErrorKind::InvalidUrl);
    }

    let origin = &rest[host_end..];
    if !origin.starts_with(b"/") {
        return Err(ErrorKind::InvalidUrl);
    }

    Ok((
        Some(types::latin1(scheme)),
        Some(types::latin1(&rest[..host_end])),
        origin,
    ))
}

/// Reads the next request line, skipping one empty line left over from a
/// previous request.
///
/// A socket timeout before the first byte is [`ErrorKind::Idle`]: the client
/// simply has nothing to say yet. A timeout after that is a stalled request.
pub(crate) fn read_request_line<R: BufRead + ?Sized>(
    reader: &mut R,
    limits: &ReqLimits,
) -> Result<RequestLine, ErrorKind> {
    let mut line = Vec::with_capacity(128);

    for _ in 0..2 {
        line.clear();

        match read_line(reader, &mut line, limits.max_line_size) {
            Ok(LineRead::Complete) => {}
            Ok(LineRead::Eof) => return Err(ErrorKind::Closed),
            Ok(LineRead::TooLong) => return Err(ErrorKind::RequestLineTooLong),
            Err(e) if line.is_empty() && is_timeout(&e) => return Err(ErrorKind::Idle),
            Err(e) => return Err(e.into()),
        }

        if !line.trim_ascii().is_empty() {
            return RequestLine::parse(&line);
        }
    }

    Err(ErrorKind::InvalidRequestLine)
}

// HEADERS

/// Request headers, keyed by their normalized name.
///
/// Names are stored upper-cased with `-` replaced by `_`, so lookups match
/// `Content-Type`, `content-type` and `CONTENT_TYPE` alike. A header sent
/// twice keeps one entry with the values joined by `", "`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Value of the header `name`, in any spelling.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_key(&types::header_key(name.as_bytes()))
    }

    /// `true` if the header is present.
    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Normalized names and values, in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    fn get_key(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    // Returns the index of the entry that received the value.
    fn append(&mut self, key: String, value: String) -> usize {
        match self.entries.iter().position(|(k, _)| *k == key) {
            Some(index) => {
                let existing = &mut self.entries[index].1;
                existing.push_str(", ");
                existing.push_str(&value);
                index
            }
            None => {
                self.entries.push((key, value));
                self.entries.len() - 1
            }
        }
    }

    fn fold(&mut self, index: usize, continuation: &str) {
        if let Some((_, value)) = self.entries.get_mut(index) {
            value.push(' ');
            value.push_str(continuation);
        }
    }

    /// `true` when the last transfer coding is `chunked`.
    pub(crate) fn is_chunked(&self) -> bool {
        self.get_key("TRANSFER_ENCODING")
            .and_then(|value| value.rsplit(',').next())
            .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
    }

    /// Parsed `Content-Length`, `Ok(None)` when absent.
    pub(crate) fn content_length(&self) -> Result<Option<u64>, ErrorKind> {
        match self.get_key("CONTENT_LENGTH") {
            None => Ok(None),
            Some(value) => types::slice_to_usize(value.trim().as_bytes())
                .map(|len| Some(len as u64))
                .ok_or(ErrorKind::InvalidContentLength),
        }
    }

    /// `true` for `Expect: 100-continue`.
    pub(crate) fn expects_continue(&self) -> bool {
        self.get_key("EXPECT")
            .is_some_and(|value| value.trim().eq_ignore_ascii_case("100-continue"))
    }
}

/// Reads header lines up to and including the empty line that ends them.
///
/// A line starting with a space or a tab continues the previous header.
pub(crate) fn read_headers<R: BufRead + ?Sized>(
    reader: &mut R,
    limits: &ReqLimits,
) -> Result<Headers, ErrorKind> {
    let mut headers = Headers::default();
    let mut line = Vec::with_capacity(256);
    let mut last = None;

    for _ in 0..=limits.header_count {
        line.clear();

        match read_line(reader, &mut line, limits.max_line_size)? {
            LineRead::Complete => {}
            LineRead::Eof => return Err(ErrorKind::Closed),
            LineRead::TooLong => return Err(ErrorKind::InvalidHeader),
        }

        if line.iter().all(|&b| b.is_ascii_whitespace() || b == 0) {
            return Ok(headers);
        }

        if matches!(line[0], b' ' | b'\t') {
            let index = last.ok_or(ErrorKind::InvalidHeader)?;
            headers.fold(index, &types::latin1(line.trim_ascii()));
            continue;
        }

        let colon = memchr::memchr(b':', &line).ok_or(ErrorKind::InvalidHeader)?;
        let name = line[..colon].trim_ascii();
        if name.is_empty() {
            return Err(ErrorKind::InvalidHeader);
        }

        let value = types::latin1(line[colon + 1..].trim_ascii());
        last = Some(headers.append(types::header_key(name), value));
    }

    Err(ErrorKind::TooManyHeaders)
}

/// Picks the body reader the headers describe.
pub(crate) fn request_body<'a>(
    headers: &Headers,
    io: &'a RefCell<dyn BufRead + 'a>,
) -> Result<Body<'a>, ErrorKind> {
    if headers.is_chunked() {
        return Ok(Body::chunked(io));
    }

    Ok(match headers.content_length()? {
        Some(len) => Body::fixed(io, len),
        None => Body::empty(),
    })
}

// ENVIRON

/// What the request cycle knows about the connection a request came from.
#[derive(Debug, Clone)]
pub(crate) struct PeerInfo {
    pub(crate) client_addr: IpAddr,
    pub(crate) client_port: u16,
    pub(crate) server_addr: IpAddr,
    pub(crate) server_port: u16,
    pub(crate) secure: bool,
    pub(crate) multithread: bool,
    pub(crate) certificate: Option<Vec<u8>>,
}

/// Everything the application gets to know about one request.
///
/// Besides the typed accessors, [`var`](Environ::var) answers CGI-style
/// names such as `REQUEST_METHOD`, `PATH_INFO` or `HTTP_USER_AGENT`.
///
/// ```no_run
/// use worker_web::{app_fn, ResponseBody};
///
/// let app = app_fn(|env, start| {
///     let agent = env.var("HTTP_USER_AGENT").unwrap_or_default().into_owned();
///
///     start.start_response("200 OK", vec![("Content-Type".into(), "text/plain".into())])?;
///     Ok(ResponseBody::from(format!("{} {} from {agent}", env.method(), env.path())))
/// });
/// ```
#[derive(Debug)]
pub struct Environ<'a> {
    pub(crate) line: RequestLine,
    pub(crate) headers: Headers,
    pub(crate) body: Body<'a>,
    pub(crate) peer: PeerInfo,
}

impl<'a> Environ<'a> {
    #[inline]
    pub fn method(&self) -> Method {
        self.line.method
    }

    /// Percent-decoded path. An encoded slash stays `%2F`.
    #[inline]
    pub fn path(&self) -> &str {
        &self.line.path
    }

    /// Raw query string without the `?`, empty when there is none.
    #[inline]
    pub fn query(&self) -> &str {
        &self.line.query
    }

    #[inline]
    pub fn version(&self) -> Version {
        self.line.version
    }

    /// The request line as received, without its line terminator.
    #[inline]
    pub fn request_line(&self) -> &str {
        &self.line.raw
    }

    /// Scheme of an absolute request target (`GET http://host/ HTTP/1.1`).
    #[inline]
    pub fn target_scheme(&self) -> Option<&str> {
        self.line.scheme.as_deref()
    }

    /// Host of an absolute request target.
    #[inline]
    pub fn target_host(&self) -> Option<&str> {
        self.line.host.as_deref()
    }

    #[inline]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Shortcut for `headers().get(name)`.
    #[inline]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    #[inline]
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get_key("CONTENT_TYPE")
    }

    /// Declared body length. `None` when absent, invalid, or the body is chunked.
    pub fn content_length(&self) -> Option<u64> {
        match self.headers.is_chunked() {
            true => None,
            false => self.headers.content_length().ok().flatten(),
        }
    }

    #[inline]
    pub fn remote_addr(&self) -> IpAddr {
        self.peer.client_addr
    }

    #[inline]
    pub fn remote_port(&self) -> u16 {
        self.peer.client_port
    }

    /// Host the client asked for, without its port. Falls back to the local
    /// address when the request has no `Host` header.
    pub fn server_name(&self) -> Cow<'_, str> {
        match self.headers.get_key("HOST") {
            Some(host) => Cow::Borrowed(strip_port(host)),
            None => Cow::Owned(self.peer.server_addr.to_string()),
        }
    }

    #[inline]
    pub fn server_port(&self) -> u16 {
        self.peer.server_port
    }

    /// `true` when the request arrived over TLS.
    #[inline]
    pub fn is_secure(&self) -> bool {
        self.peer.secure
    }

    /// `"https"` or `"http"`.
    #[inline]
    pub fn url_scheme(&self) -> &'static str {
        match self.peer.secure {
            true => "https",
            false => "http",
        }
    }

    /// `false` only when the server runs a single worker thread.
    #[inline]
    pub fn multithread(&self) -> bool {
        self.peer.multithread
    }

    /// DER certificate the client authenticated with over mutual TLS.
    #[inline]
    pub fn peer_certificate(&self) -> Option<&[u8]> {
        self.peer.certificate.as_deref()
    }

    /// Request body stream.
    #[inline]
    pub fn body(&mut self) -> &mut Body<'a> {
        &mut self.body
    }

    /// CGI-style variable lookup.
    ///
    /// Headers are available as `HTTP_<NAME>`, with `CONTENT_TYPE` and
    /// `CONTENT_LENGTH` under their own names.
    pub fn var(&self, name: &str) -> Option<Cow<'_, str>> {
        let value = match name {
            "REQUEST_METHOD" => Cow::Borrowed(self.line.method.as_str()),
            "SCRIPT_NAME" => Cow::Borrowed(""),
            "PATH_INFO" => Cow::Borrowed(self.path()),
            "QUERY_STRING" => Cow::Borrowed(self.query()),
            "SERVER_PROTOCOL" => Cow::Borrowed(self.line.version.as_str()),
            "SERVER_NAME" => self.server_name(),
            "SERVER_PORT" => Cow::Owned(self.peer.server_port.to_string()),
            "SERVER_SOFTWARE" => Cow::Borrowed(SERVER_SOFTWARE),
            "REMOTE_ADDR" => Cow::Owned(self.peer.client_addr.to_string()),
            "REMOTE_PORT" => Cow::Owned(self.peer.client_port.to_string()),
            "HTTPS" => Cow::Borrowed(if self.peer.secure { "on" } else { "off" }),
            "URL_SCHEME" => Cow::Borrowed(self.url_scheme()),
            "SSL_CLIENT_RAW_CERT" => Cow::Owned(certificate_pem(self.peer_certificate()?)),
            "CONTENT_TYPE" | "CONTENT_LENGTH" => Cow::Borrowed(self.headers.get_key(name)?),
            _ => Cow::Borrowed(self.headers.get_key(name.strip_prefix("HTTP_")?)?),
        };

        Some(value)
    }
}

// DER -> PEM with 64-column lines
fn certificate_pem(der: &[u8]) -> String {
    let encoded = BASE64_STANDARD.encode(der);
    let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");

    for line in encoded.as_bytes().chunks(64) {
        pem.extend(line.iter().map(|&byte| byte as char));
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");

    pem
}

fn strip_port(host: &str) -> &str {
    // `[::1]:8080` keeps its brackets
    if let Some(end) = host.find(']') {
        return &host[..=end];
    }

    match host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}



#[cfg(test)]
mod headers {
    use super::{tools::headers, *};
    use proptest::prelude::*;

    #[test]
    fn parse_and_lookup() {
        let parsed = headers(
            "Host: example.com\r\n\
             Content-Type: text/plain\r\n\
             X-Empty:\r\n\
             user-agent:   curl/8.0  \r\n\
             \r\n",
        )
        .unwrap();

        assert_eq!(parsed.len(), 4);
        assert_eq!(parsed.get("host"), Some("example.com"));
        assert_eq!(parsed.get("CONTENT-TYPE"), Some("text/plain"));
        assert_eq!(parsed.get("content_type"), Some("text/plain"));
        assert_eq!(parsed.get("X-Empty"), Some(""));
        assert_eq!(parsed.get("User-Agent"), Some("curl/8.0"));
        assert_eq!(parsed.get("Accept"), None);

        let keys: Vec<_> = parsed.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["HOST", "CONTENT_TYPE", "X_EMPTY", "USER_AGENT"]);
    }

    #[test]
    fn folding_and_duplicates() {
        let parsed = headers(
            "X-Long: first\r\n\
             \x20 second\r\n\
             \tthird\r\n\
             Accept: text/html\r\n\
             accept: text/plain\r\n\
             X-Blank:\r\n\
             \tlater\r\n\
             \r\n",
        )
        .unwrap();

        assert_eq!(parsed.get("X-Blank"), Some(" later"));

        assert_eq!(parsed.get("X-Long"), Some("first second third"));
        assert_eq!(parsed.get("Accept"), Some("text/html, text/plain"));
    }

    #[test]
    fn terminators() {
        assert!(headers("Host: a\n\n").unwrap().contains("host"));
        assert!(headers("Host: a\r\n \t\r\n").unwrap().contains("host"));
        assert!(headers("Host: a\r\n\0\r\n").unwrap().contains("host"));
        assert!(headers("\r\n").unwrap().is_empty());
    }

    #[test]
    fn malformed() {
        #[rustfmt::skip]
        let cases = [
            (" leading continuation\r\n\r\n", ErrorKind::InvalidHeader),
            ("no colon here\r\n\r\n", ErrorKind::InvalidHeader),
            (": no name\r\n\r\n", ErrorKind::InvalidHeader),
            ("Host: a\r\n", ErrorKind::Closed),
            ("Host: a", ErrorKind::Closed),
        ];

        for (raw, expected) in cases {
            let err = headers(raw).unwrap_err();
            assert_eq!(
                std::mem::discriminant(&err),
                std::mem::discriminant(&expected),
                "{raw:?}: {err:?}"
            );
        }
    }

    #[test]
    fn header_count_limit() {
        let limits = ReqLimits {
            header_count: 3,
            ..ReqLimits::default()
        };
        let read = |raw: &str| read_headers(&mut std::io::Cursor::new(raw.as_bytes()), &limits);

        assert_eq!(read("A: 1\r\nB: 2\r\nC: 3\r\n\r\n").unwrap().len(), 3);
        assert!(matches!(
            read("A: 1\r\nB: 2\r\nC: 3\r\nD: 4\r\n\r\n"),
            Err(ErrorKind::TooManyHeaders)
        ));
    }

    #[test]
    fn body_semantics() {
        #[rustfmt::skip]
        let cases = [
            ("Transfer-Encoding: chunked\r\n\r\n", true, Ok(None)),
            ("Transfer-Encoding:  Chunked \r\n\r\n", true, Ok(None)),
            ("Transfer-Encoding: gzip, chunked\r\n\r\n", true, Ok(None)),
            ("Transfer-Encoding: gzip\r\n\r\n", false, Ok(None)),
            ("Content-Length: 42\r\n\r\n", false, Ok(Some(42))),
            ("Content-Length: 0\r\n\r\n", false, Ok(Some(0))),
            ("Content-Length: -1\r\n\r\n", false, Err(())),
            ("Content-Length: ten\r\n\r\n", false, Err(())),
            ("\r\n", false, Ok(None)),
        ];

        for (raw, chunked, length) in cases {
            let parsed = headers(raw).unwrap();
            assert_eq!(parsed.is_chunked(), chunked, "{raw:?}");
            assert_eq!(parsed.content_length().map_err(|_| ()), length, "{raw:?}");
        }

        assert!(headers("Expect: 100-Continue\r\n\r\n").unwrap().expects_continue());
        assert!(!headers("Expect: nothing\r\n\r\n").unwrap().expects_continue());
    }

    fn fold_part() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9/=;,.-]{1,12}"
    }

    proptest! {
        #[test]
        fn continuation_folding_joins_with_single_spaces(
            parts in proptest::collection::vec(fold_part(), 1..8),
            indents in proptest::collection::vec("[ \t]{1,3}", 8),
        ) {
            let mut raw = format!("X-Folded: {}\r\n", parts[0]);
            for (part, indent) in parts[1..].iter().zip(&indents) {
                raw.push_str(&format!("{indent}{part}  \r\n"));
            }
            raw.push_str("\r\n");

            let parsed = headers(&raw).unwrap();
            prop_assert_eq!(parsed.get("x-folded").unwrap(), parts.join(" "));
        }
    }
}
