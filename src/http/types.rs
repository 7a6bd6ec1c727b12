//! Core HTTP protocol types and byte-level helpers

use crate::errors::ErrorKind;
use std::fmt;

// HEADER NAMES

// Upper-cases ASCII letters and maps `-` to `_`, so `content-type`,
// `Content-Type` and `CONTENT_TYPE` share one key.
#[rustfmt::skip]
const HEADER_NAME_TABLE: [u8; 256] = [
    //   x0    x1    x2    x3    x4    x5    x6    x7    x8    x9    xA    xB    xC    xD    xE    xF
    0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F, // 0x
    0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1A, 0x1B, 0x1C, 0x1D, 0x1E, 0x1F, // 1x
    0x20, 0x21, 0x22, 0x23, 0x24, 0x25, 0x26, 0x27, 0x28, 0x29, 0x2A, 0x2B, 0x2C, b'_', 0x2E, 0x2F, // 2x
    0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x3A, 0x3B, 0x3C, 0x3D, 0x3E, 0x3F, // 3x
    0x40, b'A', b'B', b'C', b'D', b'E', b'F', b'G', b'H', b'I', b'J', b'K', b'L', b'M', b'N', b'O', // 4x
    b'P', b'Q', b'R', b'S', b'T', b'U', b'V', b'W', b'X', b'Y', b'Z', 0x5B, 0x5C, 0x5D, 0x5E, 0x5F, // 5x
    0x60, b'A', b'B', b'C', b'D', b'E', b'F', b'G', b'H', b'I', b'J', b'K', b'L', b'M', b'N', b'O', // 6x
    b'P', b'Q', b'R', b'S', b'T', b'U', b'V', b'W', b'X', b'Y', b'Z', 0x7B, 0x7C, 0x7D, 0x7E, 0x7F, // 7x
    0x80, 0x81, 0x82, 0x83, 0x84, 0x85, 0x86, 0x87, 0x88, 0x89, 0x8A, 0x8B, 0x8C, 0x8D, 0x8E, 0x8F, // 8x
    0x90, 0x91, 0x92, 0x93, 0x94, 0x95, 0x96, 0x97, 0x98, 0x99, 0x9A, 0x9B, 0x9C, 0x9D, 0x9E, 0x9F, // 9x
    0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6, 0xA7, 0xA8, 0xA9, 0xAA, 0xAB, 0xAC, 0xAD, 0xAE, 0xAF, // Ax
    0xB0, 0xB1, 0xB2, 0xB3, 0xB4, 0xB5, 0xB6, 0xB7, 0xB8, 0xB9, 0xBA, 0xBB, 0xBC, 0xBD, 0xBE, 0xBF, // Bx
    0xC0, 0xC1, 0xC2, 0xC3, 0xC4, 0xC5, 0xC6, 0xC7, 0xC8, 0xC9, 0xCA, 0xCB, 0xCC, 0xCD, 0xCE, 0xCF, // Cx
    0xD0, 0xD1, 0xD2, 0xD3, 0xD4, 0xD5, 0xD6, 0xD7, 0xD8, 0xD9, 0xDA, 0xDB, 0xDC, 0xDD, 0xDE, 0xDF, // Dx
    0xE0, 0xE1, 0xE2, 0xE3, 0xE4, 0xE5, 0xE6, 0xE7, 0xE8, 0xE9, 0xEA, 0xEB, 0xEC, 0xED, 0xEE, 0xEF, // Ex
    0xF0, 0xF1, 0xF2, 0xF3, 0xF4, 0xF5, 0xF6, 0xF7, 0xF8, 0xF9, 0xFA, 0xFB, 0xFC, 0xFD, 0xFE, 0xFF, // Fx
];

/// Normalizes a header name to its internal key (`User-Agent` -> `USER_AGENT`).
#[inline]
pub(crate) fn header_key(name: &[u8]) -> String {
    name.iter()
        .map(|&byte| HEADER_NAME_TABLE[byte as usize] as char)
        .collect()
}

/// Decodes bytes as ISO-8859-1, which maps every byte to one char.
#[inline]
pub(crate) fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&byte| byte as char).collect()
}

#[inline(always)]
pub(crate) fn slice_to_usize(bytes: &[u8]) -> Option<usize> {
    if bytes.is_empty() {
        return None;
    }

    let mut result: usize = 0;

    for &byte in bytes {
        if !byte.is_ascii_digit() {
            return None;
        }

        result = result
            .checked_mul(10)?
            .checked_add((byte - b'0') as usize)?;
    }

    Some(result)
}

#[inline(always)]
const fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// Parses a chunk size. Anything but hex digits, or an overflow, is `None`.
#[inline]
pub(crate) fn slice_to_hex(bytes: &[u8]) -> Option<u64> {
    if bytes.is_empty() {
        return None;
    }

    let mut result: u64 = 0;

    for &byte in bytes {
        result = result
            .checked_mul(16)?
            .checked_add(hex_value(byte)? as u64)?;
    }

    Some(result)
}

/// Percent-decodes a request path.
///
/// An encoded slash (`%2F` in either case) stays encoded as `%2F` so that it
/// cannot be confused with a segment separator. Invalid escapes are kept as
/// they are and invalid UTF-8 is replaced.
pub(crate) fn decode_path(raw: &[u8]) -> String {
    let mut decoded = Vec::with_capacity(raw.len());
    let mut rest = raw;

    while let Some(pos) = memchr::memchr(b'%', rest) {
        decoded.extend_from_slice(&rest[..pos]);
        rest = &rest[pos..];

        match (rest.get(1).copied(), rest.get(2).copied()) {
            (Some(b'2'), Some(b'F' | b'f')) => {
                decoded.extend_from_slice(b"%2F");
                rest = &rest[3..];
            }
            (Some(high), Some(low)) => match (hex_value(high), hex_value(low)) {
                (Some(high), Some(low)) => {
                    decoded.push(high << 4 | low);
                    rest = &rest[3..];
                }
                _ => {
                    decoded.push(b'%');
                    rest = &rest[1..];
                }
            },
            _ => {
                decoded.push(b'%');
                rest = &rest[1..];
            }
        }
    }
    decoded.extend_from_slice(rest);

    match simdutf8::basic::from_utf8(&decoded) {
        Ok(value) => value.to_owned(),
        Err(_) => String::from_utf8_lossy(&decoded).into_owned(),
    }
}

// METHOD

/// HTTP request methods
///
/// # References
///
/// - [RFC 9110, Section 9](https://datatracker.ietf.org/doc/html/rfc9110#section-9)
/// - [RFC 5789](https://datatracker.ietf.org/doc/html/rfc5789) (PATCH method)
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    /// OPTIONS method - describe the communication options for the target resource
    Options,
    /// GET method - transfer a current representation of the target resource
    Get,
    /// HEAD method - same as GET but without response body
    Head,
    /// POST method - perform resource-specific processing on the request payload
    Post,
    /// PUT method - replace all current representations of the target resource
    Put,
    /// DELETE method - remove all current representations of the target resource
    Delete,
    /// PATCH method - apply partial modifications to a resource
    Patch,
    /// TRACE method - perform a message loop-back test
    Trace,
    /// CONNECT method - establish a tunnel to the server identified by the target
    Connect,
}

impl Method {
    #[inline(always)]
    pub(crate) fn from_bytes(src: &[u8]) -> Result<Self, ErrorKind> {
        match src {
            b"OPTIONS" => Ok(Method::Options),
            b"GET" => Ok(Method::Get),
            b"HEAD" => Ok(Method::Head),
            b"POST" => Ok(Method::Post),
            b"PUT" => Ok(Method::Put),
            b"DELETE" => Ok(Method::Delete),
            b"PATCH" => Ok(Method::Patch),
            b"TRACE" => Ok(Method::Trace),
            b"CONNECT" => Ok(Method::Connect),
            _ => Err(ErrorKind::InvalidMethod),
        }
    }

    /// Returns the method name as sent on the wire.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Method::Options => "OPTIONS",
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// VERSION

/// HTTP protocol version
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Version {
    /// HTTP/1.0 - Added headers and status codes (1996)
    ///
    /// [RFC 1945](https://tools.ietf.org/html/rfc1945)
    Http10,

    /// HTTP/1.1 - Current standard with keep-alive and chunking (1999)
    ///
    /// [RFC 9112](https://datatracker.ietf.org/doc/html/rfc9112) and related
    Http11,
}

impl Version {
    #[inline(always)]
    pub(crate) const fn from_bytes(src: &[u8]) -> Result<Self, ErrorKind> {
        match src {
            b"HTTP/1.1" => Ok(Self::Http11),
            b"HTTP/1.0" => Ok(Self::Http10),
            _ => Err(ErrorKind::UnsupportedVersion),
        }
    }

    /// Returns the protocol as written in the request line (`HTTP/1.1`).
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_keys() {
        #[rustfmt::skip]
        let cases = [
            ("Content-Type", "CONTENT_TYPE"),
            ("content-length", "CONTENT_LENGTH"),
            ("X-Forwarded-For", "X_FORWARDED_FOR"),
            ("HOST", "HOST"),
            ("x_custom", "X_CUSTOM"),
            ("Sec-WebSocket-Key2", "SEC_WEBSOCKET_KEY2"),
        ];

        for (name, key) in cases {
            assert_eq!(header_key(name.as_bytes()), key);
        }
    }

    #[test]
    fn latin1_maps_every_byte() {
        assert_eq!(latin1(b"plain"), "plain");
        assert_eq!(latin1(&[0x63, 0x61, 0x66, 0xE9]), "caf\u{e9}");
    }

    #[test]
    fn decimal_and_hex() {
        assert_eq!(slice_to_usize(b"0"), Some(0));
        assert_eq!(slice_to_usize(b"1234"), Some(1234));
        assert_eq!(slice_to_usize(b""), None);
        assert_eq!(slice_to_usize(b"12a"), None);
        assert_eq!(slice_to_usize(b"-1"), None);
        assert_eq!(slice_to_usize(b"999999999999999999999999"), None);

        assert_eq!(slice_to_hex(b"0"), Some(0));
        assert_eq!(slice_to_hex(b"a"), Some(10));
        assert_eq!(slice_to_hex(b"1F"), Some(31));
        assert_eq!(slice_to_hex(b"ffffffff"), Some(0xffff_ffff));
        assert_eq!(slice_to_hex(b""), None);
        assert_eq!(slice_to_hex(b"xyz"), None);
        assert_eq!(slice_to_hex(b"11111111111111111"), None);
    }

    #[test]
    fn path_decoding_keeps_encoded_slash() {
        #[rustfmt::skip]
        let cases = [
            ("/plain/path", "/plain/path"),
            ("/a%20b", "/a b"),
            ("/a%2Fb", "/a%2Fb"),
            ("/a%2fb", "/a%2Fb"),
            ("/a%2F%20b%2f", "/a%2F b%2F"),
            ("/caf%C3%A9", "/caf\u{e9}"),
            ("/100%", "/100%"),
            ("/%zz", "/%zz"),
            ("/%4", "/%4"),
            ("/%252F", "/%2F"),
            ("/%FF", "/\u{fffd}"),
            ("*", "*"),
        ];

        for (raw, decoded) in cases {
            assert_eq!(decode_path(raw.as_bytes()), decoded, "{raw}");
        }
    }

    #[test]
    fn methods() {
        #[rustfmt::skip]
        let cases = [
            ("OPTIONS", Ok(Method::Options)), ("GET", Ok(Method::Get)),
            ("HEAD", Ok(Method::Head)), ("POST", Ok(Method::Post)),
            ("PUT", Ok(Method::Put)), ("DELETE", Ok(Method::Delete)),
            ("PATCH", Ok(Method::Patch)), ("TRACE", Ok(Method::Trace)),
            ("CONNECT", Ok(Method::Connect)),
            ("get", Err(())), ("GETS", Err(())), ("", Err(())), ("BREW", Err(())),
        ];

        for (name, expected) in cases {
            let parsed = Method::from_bytes(name.as_bytes()).map_err(|_| ());
            assert_eq!(parsed, expected, "{name}");

            if let Ok(method) = parsed {
                assert_eq!(method.as_str(), name);
            }
        }
    }

    #[test]
    fn versions() {
        assert_eq!(Version::from_bytes(b"HTTP/1.1").ok(), Some(Version::Http11));
        assert_eq!(Version::from_bytes(b"HTTP/1.0").ok(), Some(Version::Http10));
        assert!(Version::from_bytes(b"HTTP/2.0").is_err());
        assert!(Version::from_bytes(b"http/1.1").is_err());
        assert_eq!(Version::Http11.to_string(), "HTTP/1.1");
    }
}
