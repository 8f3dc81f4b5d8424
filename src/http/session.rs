//! Server side of one HTTP connection.
//!
//! [`HttpSession`] wraps an accepted [`Socket`] and speaks one request /
//! response exchange at a time: it buffers socket reads until a full
//! request head is parsed (bounded by the configured head cap), pulls in
//! the declared body (bounded by the body cap), and writes rendered
//! responses back through a gather write over the node-chained
//! [`ByteBuffer`].

use crate::buffer::ByteBuffer;
use crate::error::{Error, Result};
use crate::http::parser::{request_buffer_size, request_max_body_size, ParseError, RequestParser};
use crate::http::{HttpRequest, HttpResponse};
use crate::net::socket::Socket;

pub struct HttpSession {
    sock: Socket,
}

impl HttpSession {
    pub fn new(sock: Socket) -> Self {
        Self { sock }
    }

    pub fn socket(&self) -> &Socket {
        &self.sock
    }

    /// Read one request off the connection. Suspends the calling fiber
    /// while the peer is quiet; fails on EOF, on the receive timeout and
    /// on malformed or oversized input.
    pub fn recv_request(&mut self) -> Result<HttpRequest> {
        let head_cap = request_buffer_size();
        let mut window = Vec::with_capacity(1024);
        let mut chunk = [0u8; 1024];

        let (mut request, consumed) = loop {
            if let Some(parsed) = RequestParser::parse(&window)? {
                break parsed;
            }
            if window.len() > head_cap {
                return Err(ParseError::HeadTooLarge(head_cap).into());
            }
            let n = self.sock.recv(&mut chunk)?;
            if n == 0 {
                return Err(Error::IO(std::io::ErrorKind::UnexpectedEof.into()));
            }
            window.extend_from_slice(&chunk[..n]);
        };

        let content_length = RequestParser::content_length(&request)?;
        if content_length > request_max_body_size() {
            return Err(ParseError::BodyTooLarge(content_length).into());
        }
        if content_length > 0 {
            let mut body = window[consumed..].to_vec();
            body.truncate(content_length as usize);
            while (body.len() as u64) < content_length {
                let n = self.sock.recv(&mut chunk)?;
                if n == 0 {
                    return Err(Error::IO(std::io::ErrorKind::UnexpectedEof.into()));
                }
                let want = content_length as usize - body.len();
                body.extend_from_slice(&chunk[..n.min(want)]);
            }
            request.set_body(String::from_utf8_lossy(&body).into_owned());
        }
        Ok(request)
    }

    /// Render and fully write a response; returns the byte count.
    pub fn send_response(&mut self, response: &HttpResponse) -> Result<usize> {
        let mut buf = ByteBuffer::default();
        buf.write(response.to_string().as_bytes());
        let total = buf.size();
        buf.set_position(0)?;
        while buf.readable() > 0 {
            let iovs = buf.readable_iovecs(usize::MAX);
            let n = self.sock.writev_raw(&iovs)?;
            if n == 0 {
                return Err(Error::IO(std::io::ErrorKind::WriteZero.into()));
            }
            buf.set_position(buf.position() + n)?;
        }
        Ok(total)
    }

    pub fn close(&mut self) {
        if let Err(e) = self.sock.close() {
            log::warn!("session close failed: {e}");
        }
    }
}
