//! Incremental HTTP/1.x request parsing.
//!
//! [`RequestParser::parse`] consumes a byte window and either produces a
//! request head (with the number of bytes consumed, body excluded) or
//! reports that more data is needed. The caps on head and body size come
//! from the config store and bound what a connection can make the server
//! buffer.

use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::config::{Config, ConfigVar};
use crate::http::{HttpRequest, Method};

static REQUEST_BUFFER_SIZE: Lazy<Arc<ConfigVar<u64>>> = Lazy::new(|| {
    Config::lookup(
        "http.request.buffer_size",
        4 * 1024u64,
        "http request head cap in bytes",
    )
    .expect("http.request.buffer_size registration cannot fail")
});

static REQUEST_MAX_BODY_SIZE: Lazy<Arc<ConfigVar<u64>>> = Lazy::new(|| {
    Config::lookup(
        "http.request.max_body_size",
        64 * 1024 * 1024u64,
        "http request body cap in bytes",
    )
    .expect("http.request.max_body_size registration cannot fail")
});

/// Configured cap on the size of a request head.
pub fn request_buffer_size() -> usize {
    REQUEST_BUFFER_SIZE.value() as usize
}

/// Configured cap on the size of a request body.
pub fn request_max_body_size() -> u64 {
    REQUEST_MAX_BODY_SIZE.value()
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed request line")]
    InvalidRequestLine,

    #[error("unknown http method")]
    InvalidMethod,

    #[error("unsupported http version '{0}'")]
    InvalidVersion(String),

    #[error("malformed header line")]
    InvalidHeader,

    #[error("request head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("request body of {0} bytes exceeds the configured cap")]
    BodyTooLarge(u64),

    #[error("invalid content-length")]
    InvalidContentLength,
}

pub struct RequestParser;

impl RequestParser {
    /// Parse a complete request head out of `buf`.
    ///
    /// Returns `Ok(None)` when the terminating blank line has not arrived
    /// yet, otherwise the parsed head and the bytes consumed (the body,
    /// if any, follows at that offset).
    pub fn parse(buf: &[u8]) -> Result<Option<(HttpRequest, usize)>, ParseError> {
        let Some(head_len) = find_terminator(buf) else {
            return Ok(None);
        };
        let head = std::str::from_utf8(&buf[..head_len])
            .map_err(|_| ParseError::InvalidRequestLine)?;
        let mut lines = head.split("\r\n");
        let request_line = lines.next().ok_or(ParseError::InvalidRequestLine)?;
        let mut request = parse_request_line(request_line)?;

        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once(':')
                .ok_or(ParseError::InvalidHeader)?;
            let key = key.trim();
            if key.is_empty() {
                return Err(ParseError::InvalidHeader);
            }
            request.set_header(key, value.trim());
        }

        if let Some(connection) = request.header("connection") {
            request.set_close(!connection.eq_ignore_ascii_case("keep-alive"));
        }
        if let Some(cookies) = request.header("cookie").map(str::to_string) {
            for item in cookies.split(';') {
                let item = item.trim();
                if item.is_empty() {
                    continue;
                }
                match item.split_once('=') {
                    Some((k, v)) => request.set_cookie(k.trim(), v.trim()),
                    None => request.set_cookie(item, ""),
                }
            }
        }

        Ok(Some((request, head_len + 4)))
    }

    /// Declared body length of a parsed head.
    pub fn content_length(request: &HttpRequest) -> Result<u64, ParseError> {
        match request.header("content-length") {
            None => Ok(0),
            Some(v) => v.trim().parse().map_err(|_| ParseError::InvalidContentLength),
        }
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_request_line(line: &str) -> Result<HttpRequest, ParseError> {
    let mut parts = line.split(' ').filter(|p| !p.is_empty());
    let method = parts.next().ok_or(ParseError::InvalidRequestLine)?;
    let uri = parts.next().ok_or(ParseError::InvalidRequestLine)?;
    let version = parts.next().ok_or(ParseError::InvalidRequestLine)?;
    if parts.next().is_some() {
        return Err(ParseError::InvalidRequestLine);
    }

    let mut request = HttpRequest::default();
    request.set_method(Method::from_str(method).ok_or(ParseError::InvalidMethod)?);
    request.set_version(match version {
        "HTTP/1.1" => 0x11,
        "HTTP/1.0" => 0x10,
        other => return Err(ParseError::InvalidVersion(other.to_string())),
    });

    let (uri, fragment) = match uri.split_once('#') {
        Some((uri, fragment)) => (uri, fragment),
        None => (uri, ""),
    };
    let (path, query) = match uri.split_once('?') {
        Some((path, query)) => (path, query),
        None => (uri, ""),
    };
    request.set_path(if path.is_empty() { "/" } else { path });
    request.set_query(query);
    request.fragment = fragment.to_string();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((k, v)) => request.set_param(k, v),
            None => request.set_param(pair, ""),
        }
    }
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_a_simple_get() {
        let data = b"GET /index.html?a=1&b=two#frag HTTP/1.1\r\n\
                     Host: example.com\r\n\
                     Connection: keep-alive\r\n\r\n";
        let (req, consumed) = RequestParser::parse(data).unwrap().unwrap();
        assert_eq!(consumed, data.len());
        assert_eq!(req.method(), Method::Get);
        assert_eq!(req.path(), "/index.html");
        assert_eq!(req.query(), "a=1&b=two");
        assert_eq!(req.fragment(), "frag");
        assert_eq!(req.version(), 0x11);
        assert_eq!(req.header("host"), Some("example.com"));
        assert_eq!(req.param("a"), Some("1"));
        assert_eq!(req.param("b"), Some("two"));
        assert!(!req.is_close());
    }

    #[test]
    fn incomplete_head_asks_for_more() {
        assert!(RequestParser::parse(b"GET / HTTP/1.1\r\nHost:")
            .unwrap()
            .is_none());
        assert!(RequestParser::parse(b"").unwrap().is_none());
    }

    #[test]
    fn connection_close_and_default() {
        let (req, _) = RequestParser::parse(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(req.is_close());
        // No connection header: treated as close.
        let (req, _) = RequestParser::parse(b"GET / HTTP/1.1\r\n\r\n").unwrap().unwrap();
        assert!(req.is_close());
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(
            RequestParser::parse(b"FETCH / HTTP/1.1\r\n\r\n").unwrap_err(),
            ParseError::InvalidMethod
        );
        assert_eq!(
            RequestParser::parse(b"GET / HTTP/2.0\r\n\r\n").unwrap_err(),
            ParseError::InvalidVersion("HTTP/2.0".into())
        );
        assert_eq!(
            RequestParser::parse(b"GET /\r\n\r\n").unwrap_err(),
            ParseError::InvalidRequestLine
        );
        assert_eq!(
            RequestParser::parse(b"GET / HTTP/1.1\r\nbadheader\r\n\r\n").unwrap_err(),
            ParseError::InvalidHeader
        );
    }

    #[test]
    fn cookies_are_split() {
        let (req, _) = RequestParser::parse(
            b"GET / HTTP/1.1\r\nCookie: session=abc; theme=dark; bare\r\n\r\n",
        )
        .unwrap()
        .unwrap();
        assert_eq!(req.cookie("session"), Some("abc"));
        assert_eq!(req.cookie("theme"), Some("dark"));
        assert_eq!(req.cookie("bare"), Some(""));
    }

    #[test]
    fn content_length_parses_and_rejects() {
        let (req, _) = RequestParser::parse(
            b"POST /submit HTTP/1.1\r\nContent-Length: 11\r\n\r\n",
        )
        .unwrap()
        .unwrap();
        assert_eq!(RequestParser::content_length(&req).unwrap(), 11);
        let (req, _) = RequestParser::parse(
            b"POST / HTTP/1.1\r\nContent-Length: nope\r\n\r\n",
        )
        .unwrap()
        .unwrap();
        assert!(RequestParser::content_length(&req).is_err());
    }
}
