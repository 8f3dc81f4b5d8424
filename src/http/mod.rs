//! HTTP/1.x types for the demonstration server: methods, statuses,
//! request/response values with case-insensitive header maps, and their
//! wire rendering. The parser, the per-connection session and the server
//! live in the submodules.

use std::borrow::Borrow;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub mod parser;
pub mod server;
pub mod session;

pub use parser::{ParseError, RequestParser};
pub use server::{HttpServer, RequestHandler};
pub use session::HttpSession;

macro_rules! http_methods {
    ($(($variant:ident, $text:literal)),+ $(,)?) => {
        /// Request method.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum Method {
            $($variant),+
        }

        impl Method {
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }

            pub fn from_str(s: &str) -> Option<Method> {
                match s {
                    $($text => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

http_methods! {
    (Get, "GET"),
    (Post, "POST"),
    (Put, "PUT"),
    (Delete, "DELETE"),
    (Head, "HEAD"),
    (Options, "OPTIONS"),
    (Patch, "PATCH"),
    (Trace, "TRACE"),
    (Connect, "CONNECT"),
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

macro_rules! http_statuses {
    ($(($variant:ident, $code:literal, $reason:literal)),+ $(,)?) => {
        /// Response status.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum Status {
            $($variant),+
        }

        impl Status {
            pub const fn code(self) -> u16 {
                match self {
                    $(Self::$variant => $code),+
                }
            }

            pub const fn reason(self) -> &'static str {
                match self {
                    $(Self::$variant => $reason),+
                }
            }

            pub fn from_code(code: u16) -> Option<Status> {
                match code {
                    $($code => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

http_statuses! {
    (Continue, 100, "Continue"),
    (SwitchingProtocols, 101, "Switching Protocols"),
    (Ok, 200, "OK"),
    (Created, 201, "Created"),
    (Accepted, 202, "Accepted"),
    (NoContent, 204, "No Content"),
    (PartialContent, 206, "Partial Content"),
    (MovedPermanently, 301, "Moved Permanently"),
    (Found, 302, "Found"),
    (SeeOther, 303, "See Other"),
    (NotModified, 304, "Not Modified"),
    (TemporaryRedirect, 307, "Temporary Redirect"),
    (PermanentRedirect, 308, "Permanent Redirect"),
    (BadRequest, 400, "Bad Request"),
    (Unauthorized, 401, "Unauthorized"),
    (Forbidden, 403, "Forbidden"),
    (NotFound, 404, "Not Found"),
    (MethodNotAllowed, 405, "Method Not Allowed"),
    (RequestTimeout, 408, "Request Timeout"),
    (LengthRequired, 411, "Length Required"),
    (PayloadTooLarge, 413, "Payload Too Large"),
    (UriTooLong, 414, "URI Too Long"),
    (InternalServerError, 500, "Internal Server Error"),
    (NotImplemented, 501, "Not Implemented"),
    (BadGateway, 502, "Bad Gateway"),
    (ServiceUnavailable, 503, "Service Unavailable"),
    (GatewayTimeout, 504, "Gateway Timeout"),
    (HttpVersionNotSupported, 505, "HTTP Version Not Supported"),
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}

/// Map key comparing case-insensitively while preserving the spelling it
/// was inserted with.
#[derive(Debug, Clone, Eq)]
pub struct CiString(pub String);

impl PartialEq for CiString {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl PartialOrd for CiString {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CiString {
    fn cmp(&self, other: &Self) -> Ordering {
        let a = self.0.as_bytes().iter().map(u8::to_ascii_lowercase);
        let b = other.0.as_bytes().iter().map(u8::to_ascii_lowercase);
        a.cmp(b)
    }
}

/// Lets `&str` look up `CiString` keys without allocating.
#[derive(PartialEq, Eq)]
#[repr(transparent)]
struct CiStr(str);

impl CiStr {
    fn new(s: &str) -> &CiStr {
        // SAFETY: CiStr is a transparent wrapper around str.
        unsafe { &*(s as *const str as *const CiStr) }
    }
}

impl PartialOrd for CiStr {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CiStr {
    fn cmp(&self, other: &Self) -> Ordering {
        let a = self.0.as_bytes().iter().map(u8::to_ascii_lowercase);
        let b = other.0.as_bytes().iter().map(u8::to_ascii_lowercase);
        a.cmp(b)
    }
}

impl Borrow<CiStr> for CiString {
    fn borrow(&self) -> &CiStr {
        CiStr::new(&self.0)
    }
}

/// Case-insensitive string map used for headers, params and cookies.
pub type CiMap = BTreeMap<CiString, String>;

fn map_get<'m>(map: &'m CiMap, key: &str) -> Option<&'m str> {
    map.get(CiStr::new(key)).map(String::as_str)
}

fn map_get_as<T: FromStr>(map: &CiMap, key: &str, default: T) -> T {
    map_get(map, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// HTTP version as a packed nibble pair: `0x11` for 1.1, `0x10` for 1.0.
fn version_str(version: u8) -> &'static str {
    if version == 0x10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    }
}

////////////////////////////////////////////////////////////////////////////
// HttpRequest
////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone)]
pub struct HttpRequest {
    method: Method,
    version: u8,
    path: String,
    query: String,
    fragment: String,
    close: bool,
    headers: CiMap,
    params: CiMap,
    cookies: CiMap,
    body: String,
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self {
            method: Method::Get,
            version: 0x11,
            path: "/".to_string(),
            query: String::new(),
            fragment: String::new(),
            close: true,
            headers: CiMap::new(),
            params: CiMap::new(),
            cookies: CiMap::new(),
            body: String::new(),
        }
    }
}

impl HttpRequest {
    pub fn method(&self) -> Method {
        self.method
    }

    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn set_version(&mut self, version: u8) {
        self.version = version;
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn set_path(&mut self, path: impl Into<String>) {
        self.path = path.into();
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn set_query(&mut self, query: impl Into<String>) {
        self.query = query.into();
    }

    pub fn fragment(&self) -> &str {
        &self.fragment
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<String>) {
        self.body = body.into();
    }

    pub fn is_close(&self) -> bool {
        self.close
    }

    pub fn set_close(&mut self, close: bool) {
        self.close = close;
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        map_get(&self.headers, key)
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(CiString(key.into()), value.into());
    }

    pub fn del_header(&mut self, key: &str) {
        self.headers.remove(CiStr::new(key));
    }

    pub fn has_header(&self, key: &str) -> bool {
        self.header(key).is_some()
    }

    /// Header value parsed as `T`, `default` when absent or unparsable.
    pub fn header_as<T: FromStr>(&self, key: &str, default: T) -> T {
        map_get_as(&self.headers, key, default)
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        map_get(&self.params, key)
    }

    pub fn set_param(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.params.insert(CiString(key.into()), value.into());
    }

    /// Query parameter parsed as `T`; reads the params map, not the
    /// headers.
    pub fn param_as<T: FromStr>(&self, key: &str, default: T) -> T {
        map_get_as(&self.params, key, default)
    }

    pub fn cookie(&self, key: &str) -> Option<&str> {
        map_get(&self.cookies, key)
    }

    pub fn set_cookie(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.cookies.insert(CiString(key.into()), value.into());
    }

    pub fn headers(&self) -> &CiMap {
        &self.headers
    }
}

impl fmt::Display for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)?;
        if !self.query.is_empty() {
            write!(f, "?{}", self.query)?;
        }
        if !self.fragment.is_empty() {
            write!(f, "#{}", self.fragment)?;
        }
        write!(f, " {}\r\n", version_str(self.version))?;
        for (key, value) in &self.headers {
            if key.0.eq_ignore_ascii_case("connection") {
                continue;
            }
            write!(f, "{}: {}\r\n", key.0, value)?;
        }
        write!(
            f,
            "connection: {}\r\n",
            if self.close { "close" } else { "keep-alive" }
        )?;
        if !self.body.is_empty() {
            write!(f, "content-length: {}\r\n\r\n{}", self.body.len(), self.body)
        } else {
            write!(f, "\r\n")
        }
    }
}

////////////////////////////////////////////////////////////////////////////
// HttpResponse
////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone)]
pub struct HttpResponse {
    status: Status,
    version: u8,
    close: bool,
    reason: Option<String>,
    headers: CiMap,
    body: String,
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self::new(0x11, true)
    }
}

impl HttpResponse {
    pub fn new(version: u8, close: bool) -> Self {
        Self {
            status: Status::Ok,
            version,
            close,
            reason: None,
            headers: CiMap::new(),
            body: String::new(),
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn set_version(&mut self, version: u8) {
        self.version = version;
    }

    pub fn is_close(&self) -> bool {
        self.close
    }

    pub fn set_close(&mut self, close: bool) {
        self.close = close;
    }

    /// Override the standard reason phrase.
    pub fn set_reason(&mut self, reason: impl Into<String>) {
        self.reason = Some(reason.into());
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        map_get(&self.headers, key)
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(CiString(key.into()), value.into());
    }

    pub fn del_header(&mut self, key: &str) {
        self.headers.remove(CiStr::new(key));
    }

    pub fn header_as<T: FromStr>(&self, key: &str, default: T) -> T {
        map_get_as(&self.headers, key, default)
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<String>) {
        self.body = body.into();
    }
}

impl fmt::Display for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}\r\n",
            version_str(self.version),
            self.status.code(),
            self.reason.as_deref().unwrap_or(self.status.reason()),
        )?;
        for (key, value) in &self.headers {
            if key.0.eq_ignore_ascii_case("connection")
                || key.0.eq_ignore_ascii_case("content-length")
            {
                continue;
            }
            write!(f, "{}: {}\r\n", key.0, value)?;
        }
        write!(
            f,
            "connection: {}\r\n",
            if self.close { "close" } else { "keep-alive" }
        )?;
        write!(f, "content-length: {}\r\n\r\n{}", self.body.len(), self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn header_lookup_ignores_case() {
        let mut req = HttpRequest::default();
        req.set_header("Content-Type", "text/plain");
        assert_eq!(req.header("content-type"), Some("text/plain"));
        assert_eq!(req.header("CONTENT-TYPE"), Some("text/plain"));
        assert!(req.has_header("Content-type"));
        req.del_header("CONTENT-Type");
        assert!(!req.has_header("content-type"));
    }

    #[test]
    fn typed_getters_read_their_own_maps() {
        let mut req = HttpRequest::default();
        req.set_header("x-limit", "42");
        req.set_param("x-limit", "7");
        assert_eq!(req.header_as::<u32>("x-limit", 0), 42);
        assert_eq!(req.param_as::<u32>("x-limit", 0), 7);
        // A key present only in headers is not a param.
        req.set_header("only-header", "1");
        assert_eq!(req.param_as::<u32>("only-header", 99), 99);
    }

    #[test]
    fn response_renders_status_line_and_length() {
        let mut rsp = HttpResponse::new(0x11, false);
        rsp.set_status(Status::NotFound);
        rsp.set_body("gone");
        let text = rsp.to_string();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("connection: keep-alive\r\n"));
        assert!(text.ends_with("content-length: 4\r\n\r\ngone"));
    }

    #[test]
    fn status_code_round_trip() {
        assert_eq!(Status::from_code(200), Some(Status::Ok));
        assert_eq!(Status::from_code(504), Some(Status::GatewayTimeout));
        assert_eq!(Status::from_code(999), None);
        assert_eq!(Status::PayloadTooLarge.code(), 413);
    }

    #[test]
    fn method_round_trip() {
        assert_eq!(Method::from_str("DELETE"), Some(Method::Delete));
        assert_eq!(Method::from_str("delete"), None);
        assert_eq!(Method::Get.as_str(), "GET");
    }
}
