//! Request bodies: fixed-length and chunked readers over the connection,
//! plus the chunk framing used for responses.

use crate::{http::request::read_line, http::request::LineRead, http::types::slice_to_hex};
use std::{
    cell::RefCell,
    fmt,
    io::{self, BufRead, Read, Write},
};

// Chunk size lines and trailer lines longer than this are rejected.
const CHUNK_LINE_LIMIT: usize = 4096;

/// Terminating zero-size chunk of a chunked body without trailers.
pub(crate) const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Frames `data` as one chunk: `<hex-size>\r\n<data>\r\n`.
///
/// Empty data is skipped, it would read as the terminating chunk.
#[inline]
pub(crate) fn write_chunk<W: Write>(writer: &mut W, data: &[u8]) -> io::Result<()> {
    if data.is_empty() {
        return Ok(());
    }

    write!(writer, "{:x}\r\n", data.len())?;
    writer.write_all(data)?;
    writer.write_all(b"\r\n")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
    Done,
}

/// Decoder state of a chunked body, independent of where the bytes come from.
#[derive(Debug, Clone)]
pub(crate) struct ChunkedDecoder {
    state: ChunkState,
    line: Vec<u8>,
}

impl ChunkedDecoder {
    pub(crate) fn new() -> Self {
        Self {
            state: ChunkState::Size,
            line: Vec::new(),
        }
    }

    #[inline]
    pub(crate) fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    pub(crate) fn read<R: BufRead + ?Sized>(&mut self, reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.state {
                ChunkState::Done => return Ok(0),

                ChunkState::Size => {
                    let line = self.next_line(reader)?;
                    // Blank lines before a size line are tolerated
                    if line.is_empty() {
                        continue;
                    }

                    let digits = match memchr::memchr(b';', line) {
                        Some(pos) => line[..pos].trim_ascii_end(),
                        None => line,
                    };

                    self.state = match slice_to_hex(digits) {
                        Some(0) => ChunkState::Trailers,
                        Some(size) => ChunkState::Data(size),
                        None => return Err(invalid_data("invalid chunk size")),
                    };
                }

                ChunkState::Data(remaining) => {
                    if buf.is_empty() {
                        return Ok(0);
                    }

                    let max = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
                    let read = reader.read(&mut buf[..max])?;
                    if read == 0 {
                        return Err(io::ErrorKind::UnexpectedEof.into());
                    }

                    let remaining = remaining - read as u64;
                    self.state = match remaining {
                        0 => ChunkState::DataEnd,
                        _ => ChunkState::Data(remaining),
                    };

                    return Ok(read);
                }

                ChunkState::DataEnd => {
                    if !self.next_line(reader)?.is_empty() {
                        return Err(invalid_data("chunk data longer than its size"));
                    }
                    self.state = ChunkState::Size;
                }

                ChunkState::Trailers => {
                    if self.next_line(reader)?.is_empty() {
                        self.state = ChunkState::Done;
                    }
                }
            }
        }
    }

    fn next_line<R: BufRead + ?Sized>(&mut self, reader: &mut R) -> io::Result<&[u8]> {
        self.line.clear();

        match read_line(reader, &mut self.line, CHUNK_LINE_LIMIT)? {
            LineRead::Complete => Ok(self.line.trim_ascii()),
            LineRead::TooLong => Err(invalid_data("chunk line too long")),
            LineRead::Eof => Err(io::ErrorKind::UnexpectedEof.into()),
        }
    }
}

#[inline]
fn invalid_data(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Decodes a chunked body from any buffered source, e.g. a response read
/// by a client. Trailers are consumed and dropped.
///
/// ```
/// use std::io::Read;
/// use worker_web::ChunkedReader;
///
/// let mut body = String::new();
/// ChunkedReader::new(&b"4\r\ntest\r\n0\r\n\r\n"[..])
///     .read_to_string(&mut body)
///     .unwrap();
///
/// assert_eq!(body, "test");
/// ```
pub struct ChunkedReader<R> {
    inner: R,
    decoder: ChunkedDecoder,
}

impl<R: BufRead> ChunkedReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            decoder: ChunkedDecoder::new(),
        }
    }

    /// `true` once the terminating chunk and trailers were read.
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.decoder.is_done()
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: BufRead> Read for ChunkedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.decoder.read(&mut self.inner, buf)
    }
}

enum BodyKind {
    Empty,
    Fixed(u64),
    Chunked(ChunkedDecoder),
}

/// Request body stream handed to the application.
///
/// Reads pull bytes straight from the connection. A chunked request body is
/// decoded on the fly, so both kinds look the same to the reader: a byte
/// stream that ends when the body ends.
///
/// ```no_run
/// use std::io::Read;
/// use worker_web::{app_fn, ResponseBody};
///
/// let app = app_fn(|env, start| {
///     let mut body = Vec::new();
///     env.body().read_to_end(&mut body)?;
///
///     start.start_response("200 OK", vec![])?;
///     Ok(ResponseBody::from(body))
/// });
/// ```
pub struct Body<'a> {
    io: Option<&'a RefCell<dyn BufRead + 'a>>,
    kind: BodyKind,
}

impl<'a> Body<'a> {
    pub(crate) fn empty() -> Self {
        Self {
            io: None,
            kind: BodyKind::Empty,
        }
    }

    pub(crate) fn fixed(io: &'a RefCell<dyn BufRead + 'a>, len: u64) -> Self {
        match len {
            0 => Self::empty(),
            len => Self {
                io: Some(io),
                kind: BodyKind::Fixed(len),
            },
        }
    }

    pub(crate) fn chunked(io: &'a RefCell<dyn BufRead + 'a>) -> Self {
        Self {
            io: Some(io),
            kind: BodyKind::Chunked(ChunkedDecoder::new()),
        }
    }

    /// `true` for `Transfer-Encoding: chunked` request bodies.
    pub fn is_chunked(&self) -> bool {
        matches!(self.kind, BodyKind::Chunked(_))
    }

    /// `true` once every byte of the body was read.
    pub fn is_finished(&self) -> bool {
        match &self.kind {
            BodyKind::Empty => true,
            BodyKind::Fixed(remaining) => *remaining == 0,
            BodyKind::Chunked(decoder) => decoder.is_done(),
        }
    }

    /// Consumes what the application left unread, up to `limit` bytes.
    /// Returns `false` when more than `limit` bytes remain or the stream broke.
    pub(crate) fn drain(&mut self, limit: u64) -> bool {
        if let BodyKind::Fixed(remaining) = self.kind {
            if remaining > limit {
                return false;
            }
        }

        let mut sink = io::sink();
        match io::copy(&mut self.by_ref().take(limit), &mut sink) {
            Ok(_) => self.is_finished(),
            Err(_) => false,
        }
    }
}

impl Read for Body<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(io) = self.io else {
            return Ok(0);
        };
        let mut io = io
            .try_borrow_mut()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "connection is busy"))?;

        match &mut self.kind {
            BodyKind::Empty => Ok(0),
            BodyKind::Fixed(0) => Ok(0),
            BodyKind::Fixed(remaining) => {
                let max = buf.len().min(usize::try_from(*remaining).unwrap_or(usize::MAX));
                let read = io.read(&mut buf[..max])?;
                if read == 0 && max > 0 {
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }

                *remaining -= read as u64;
                Ok(read)
            }
            BodyKind::Chunked(decoder) => decoder.read(&mut *io, buf),
        }
    }
}

impl fmt::Debug for Body<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            BodyKind::Empty => "empty",
            BodyKind::Fixed(_) => "fixed",
            BodyKind::Chunked(_) => "chunked",
        };

        f.debug_struct("Body")
            .field("kind", &kind)
            .field("finished", &self.is_finished())
            .finish()
    }
}
