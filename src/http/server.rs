//! HTTP server over the TCP scaffolding.
//!
//! [`HttpServer`] implements [`ClientHandler`]: every accepted socket
//! becomes an [`HttpSession`] looping request → handler → response for
//! as long as keepalive allows. The actual content comes from a
//! [`RequestHandler`]; the default one answers with the server banner.

use std::sync::Arc;

use crate::http::{HttpRequest, HttpResponse, HttpSession};
use crate::net::socket::Socket;
use crate::net::tcp::{ClientHandler, TcpServer};
use crate::reactor::Reactor;

pub const SERVER_NAME: &str = "weft/0.1.0";

/// Produces a response for one parsed request.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, request: &HttpRequest) -> HttpResponse;
}

impl<F> RequestHandler for F
where
    F: Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
{
    fn handle(&self, request: &HttpRequest) -> HttpResponse {
        self(request)
    }
}

/// Default handler: the server banner.
struct Banner;

impl RequestHandler for Banner {
    fn handle(&self, _request: &HttpRequest) -> HttpResponse {
        let mut response = HttpResponse::default();
        response.set_header("Server", SERVER_NAME);
        response.set_header("Content-Type", "text/plain");
        response.set_body(SERVER_NAME);
        response
    }
}

pub struct HttpServer {
    keepalive: bool,
    handler: Arc<dyn RequestHandler>,
}

impl HttpServer {
    pub fn new(keepalive: bool, handler: Option<Arc<dyn RequestHandler>>) -> Arc<HttpServer> {
        Arc::new(HttpServer {
            keepalive,
            handler: handler.unwrap_or_else(|| Arc::new(Banner)),
        })
    }

    /// Wire an [`HttpServer`] into a [`TcpServer`] on the given reactors.
    pub fn server(
        keepalive: bool,
        handler: Option<Arc<dyn RequestHandler>>,
        worker: Arc<Reactor>,
        acceptor: Arc<Reactor>,
    ) -> Arc<TcpServer> {
        TcpServer::new(
            SERVER_NAME,
            Self::new(keepalive, handler),
            worker,
            acceptor,
        )
    }
}

impl ClientHandler for HttpServer {
    fn handle(&self, client: Socket) {
        log::debug!("handleClient {client}");
        let mut session = HttpSession::new(client);
        loop {
            let request = match session.recv_request() {
                Ok(request) => request,
                Err(e) => {
                    log::debug!("recv http request failed: {e}");
                    break;
                }
            };
            let keep = self.keepalive && !request.is_close();
            let mut response = self.handler.handle(&request);
            response.set_version(request.version());
            response.set_close(!keep);
            log::debug!(
                "{} {} -> {}",
                request.method(),
                request.path(),
                response.status(),
            );
            if let Err(e) = session.send_response(&response) {
                log::debug!("send http response failed: {e}");
                break;
            }
            if !keep {
                break;
            }
        }
        session.close();
    }
}
