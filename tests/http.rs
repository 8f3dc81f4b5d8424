use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use weft::http::{HttpResponse, HttpServer, RequestHandler, Status};
use weft::net::{Addr, Socket, TcpServer};
use weft::reactor::Reactor;

const RECV_WAIT: Duration = Duration::from_secs(10);

fn read_to_end(sock: &Socket) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 512];
    loop {
        match sock.recv(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) => panic!("recv failed: {e}"),
        }
    }
    out
}

/// Build, bind and start an HTTP server on a runtime fiber (descriptors
/// must be created on hooked threads); returns the server handle and the
/// bound address.
fn spawn_server(
    reactor: &Arc<Reactor>,
    keepalive: bool,
    handler: Option<Arc<dyn RequestHandler>>,
) -> (Arc<TcpServer>, Addr) {
    let (tx, rx) = mpsc::channel();
    let worker = reactor.clone();
    let acceptor = reactor.clone();
    reactor.submit(move || {
        let server = HttpServer::server(keepalive, handler, worker, acceptor);
        server
            .bind(&Addr::lookup_any("127.0.0.1:0").unwrap())
            .unwrap();
        let addr = server.local_addrs().pop().unwrap();
        server.start();
        tx.send((server, addr)).unwrap();
    });
    rx.recv_timeout(RECV_WAIT).unwrap()
}

#[test]
fn banner_round_trip() {
    let reactor = Reactor::new(2, false, "http").unwrap();
    let (server, addr) = spawn_server(&reactor, true, None);

    let (tx, rx) = mpsc::channel();
    reactor.submit(move || {
        let sock = Socket::tcp(&addr).unwrap();
        sock.connect(&addr).unwrap();
        sock.send_all(
            b"GET /hello?who=world HTTP/1.1\r\n\
              Host: localhost\r\n\
              Connection: close\r\n\r\n",
        )
        .unwrap();
        tx.send(read_to_end(&sock)).unwrap();
    });

    let reply = String::from_utf8(rx.recv_timeout(RECV_WAIT).unwrap()).unwrap();
    assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "reply: {reply}");
    assert!(reply.contains("connection: close\r\n"));
    assert!(reply.ends_with("weft/0.1.0"));

    server.stop();
    reactor.stop();
}

#[test]
fn keepalive_serves_multiple_requests_per_connection() {
    let reactor = Reactor::new(2, false, "keepalive").unwrap();
    let handler: Arc<dyn RequestHandler> = Arc::new(|req: &weft::http::HttpRequest| {
        let mut rsp = HttpResponse::default();
        rsp.set_body(format!("path={}", req.path()));
        rsp
    });
    let (server, addr) = spawn_server(&reactor, true, Some(handler));

    let (tx, rx) = mpsc::channel();
    reactor.submit(move || {
        let sock = Socket::tcp(&addr).unwrap();
        sock.connect(&addr).unwrap();

        for path in ["/first", "/second"] {
            sock.send_all(
                format!(
                    "GET {path} HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n"
                )
                .as_bytes(),
            )
            .unwrap();
            // Read one full response: headers + declared body.
            let mut window = Vec::new();
            let mut buf = [0u8; 256];
            let body = loop {
                let n = sock.recv(&mut buf).unwrap();
                assert!(n > 0, "server closed a keep-alive connection");
                window.extend_from_slice(&buf[..n]);
                if let Some(pos) = window.windows(4).position(|w| w == b"\r\n\r\n") {
                    let head = String::from_utf8_lossy(&window[..pos]).into_owned();
                    let length: usize = head
                        .lines()
                        .find_map(|l| l.strip_prefix("content-length: "))
                        .unwrap()
                        .parse()
                        .unwrap();
                    if window.len() >= pos + 4 + length {
                        break String::from_utf8_lossy(&window[pos + 4..pos + 4 + length])
                            .into_owned();
                    }
                }
            };
            assert_eq!(body, format!("path={path}"));
        }
        tx.send(()).unwrap();
    });

    rx.recv_timeout(RECV_WAIT).unwrap();
    server.stop();
    reactor.stop();
}

#[test]
fn custom_handler_sees_params_and_sets_status() {
    let reactor = Reactor::new(2, false, "handler").unwrap();
    let handler: Arc<dyn RequestHandler> = Arc::new(|req: &weft::http::HttpRequest| {
        let mut rsp = HttpResponse::default();
        if req.param("id").is_none() {
            rsp.set_status(Status::BadRequest);
            rsp.set_body("missing id");
        } else {
            rsp.set_body(format!("id={}", req.param_as::<u32>("id", 0)));
        }
        rsp
    });
    let (server, addr) = spawn_server(&reactor, false, Some(handler));

    let (tx, rx) = mpsc::channel();
    reactor.submit(move || {
        let ask = |request: &str| {
            let sock = Socket::tcp(&addr).unwrap();
            sock.connect(&addr).unwrap();
            sock.send_all(request.as_bytes()).unwrap();
            String::from_utf8_lossy(&read_to_end(&sock)).into_owned()
        };
        let good = ask("GET /item?id=7 HTTP/1.1\r\nHost: x\r\n\r\n");
        let bad = ask("GET /item HTTP/1.1\r\nHost: x\r\n\r\n");
        tx.send((good, bad)).unwrap();
    });

    let (good, bad) = rx.recv_timeout(RECV_WAIT).unwrap();
    assert!(good.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(good.ends_with("id=7"));
    assert!(bad.starts_with("HTTP/1.1 400 Bad Request\r\n"));

    server.stop();
    reactor.stop();
}
