// SPDX-License-Identifier: GPL-3.0-only

//! HTTP delivery of composites and status
//!
//! - `GET /video`: composites as a `multipart/x-mixed-replace` MJPEG stream
//! - `GET /status`: the controller's [`StatusSnapshot`] as JSON
//! - `GET /`: liveness
//!
//! Every request is served on its own thread, since a `/video` client holds
//! its connection for as long as it watches.
//!
//! [`StatusSnapshot`]: crate::pipeline::stats::StatusSnapshot

use crate::constants::overlay::JPEG_QUALITY;
use crate::constants::server::MJPEG_BOUNDARY;
use crate::pipeline::compositor::Composite;
use crate::pipeline::controller::StatusHandle;
use crate::pipeline::render::LatestComposite;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};
use tokio::sync::watch;
use tracing::{debug, info, warn};

type CompositeFeed = watch::Receiver<Option<Arc<Composite>>>;

/// Running HTTP server; shuts down on drop
pub struct MonitorServer {
    server: Arc<Server>,
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept: Option<JoinHandle<()>>,
}

impl MonitorServer {
    /// Bind `addr` and start serving composites from `surface`
    pub fn bind(addr: &str, surface: &LatestComposite, status: StatusHandle) -> io::Result<Self> {
        let server = Server::http(addr).map_err(|e| io::Error::other(e.to_string()))?;
        let local = server
            .server_addr()
            .to_ip()
            .ok_or_else(|| io::Error::other("listener has no IP address"))?;
        let server = Arc::new(server);
        let (shutdown, _) = watch::channel(false);

        let routes = Routes {
            frames: surface.subscribe(),
            status,
            shutdown: shutdown.subscribe(),
        };
        let accept = thread::Builder::new().name("http-accept".into()).spawn({
            let server = Arc::clone(&server);
            move || accept_loop(&server, routes)
        })?;

        info!(addr = %local, "HTTP server listening");
        Ok(Self {
            server,
            addr: local,
            shutdown,
            accept: Some(accept),
        })
    }

    /// Address actually bound (resolves port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting, end open video streams and wait for the accept loop
    pub fn shutdown(&mut self) {
        let Some(accept) = self.accept.take() else {
            return;
        };
        self.shutdown.send_replace(true);
        self.server.unblock();
        if accept.join().is_err() {
            warn!("HTTP accept thread panicked");
        }
        info!(addr = %self.addr, "HTTP server stopped");
    }
}

impl Drop for MonitorServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(server: &Server, routes: Routes) {
    for request in server.incoming_requests() {
        let routes = routes.clone();
        let spawned = thread::Builder::new()
            .name("http-request".into())
            .spawn(move || routes.handle(request));
        if let Err(e) = spawned {
            warn!(error = %e, "Failed to spawn HTTP request thread");
        }
    }
    debug!("HTTP accept loop finished");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Alive,
    Status,
    Video,
    NotFound,
}

fn route(method: &Method, url: &str) -> Route {
    if *method != Method::Get {
        return Route::NotFound;
    }
    match url.split('?').next().unwrap_or_default() {
        "/" => Route::Alive,
        "/status" => Route::Status,
        "/video" => Route::Video,
        _ => Route::NotFound,
    }
}

#[derive(Clone)]
struct Routes {
    frames: CompositeFeed,
    status: StatusHandle,
    shutdown: watch::Receiver<bool>,
}

impl Routes {
    fn handle(self, request: Request) {
        let url = request.url().to_string();
        let route = route(request.method(), &url);
        debug!(method = %request.method(), url, ?route, "HTTP request");

        let result = match route {
            Route::Alive => request.respond(json(r#"{"msg":"vision-monitor alive"}"#.into())),
            Route::Status => match serde_json::to_string(&self.status.snapshot()) {
                Ok(body) => request.respond(json(body)),
                Err(e) => {
                    warn!(error = %e, "Failed to serialize status");
                    request.respond(Response::empty(500))
                }
            },
            Route::Video => {
                info!(url, "MJPEG client connected");
                request.respond(mjpeg(MjpegStream::new(self.frames, self.shutdown)))
            }
            Route::NotFound => request.respond(Response::empty(404)),
        };

        // Clients hanging up mid-stream is routine
        if let Err(e) = result {
            debug!(url, error = %e, "HTTP response ended early");
        }
    }
}

fn with_headers<R: Read>(mut response: Response<R>, headers: &[(&str, &str)]) -> Response<R> {
    for (name, value) in headers {
        match Header::from_bytes(name.as_bytes(), value.as_bytes()) {
            Ok(header) => response.add_header(header),
            Err(()) => warn!(name, value, "Invalid HTTP header"),
        }
    }
    response
}

fn json(body: String) -> Response<io::Cursor<Vec<u8>>> {
    with_headers(
        Response::from_string(body),
        &[
            ("Content-Type", "application/json"),
            ("Access-Control-Allow-Origin", "*"),
        ],
    )
}

fn mjpeg(stream: MjpegStream) -> Response<MjpegStream> {
    let content_type = format!("multipart/x-mixed-replace; boundary={}", MJPEG_BOUNDARY);
    with_headers(
        Response::new(StatusCode(200), Vec::new(), stream, None, None),
        &[
            ("Content-Type", content_type.as_str()),
            ("Cache-Control", "no-cache"),
            ("Access-Control-Allow-Origin", "*"),
        ],
    )
}

/// Frame one JPEG as a multipart part
fn multipart_part(jpeg: &[u8]) -> Vec<u8> {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        MJPEG_BOUNDARY,
        jpeg.len()
    );
    let mut part = Vec::with_capacity(header.len() + jpeg.len() + 2);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part
}

/// Response body that yields one part per new composite
///
/// Blocks the request thread between composites. Ends when the server
/// shuts down or the surface goes away.
struct MjpegStream {
    frames: CompositeFeed,
    shutdown: watch::Receiver<bool>,
    part: Vec<u8>,
    pos: usize,
    /// The feed's current value has been sent (or was empty)
    current_seen: bool,
}

impl MjpegStream {
    fn new(frames: CompositeFeed, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            frames,
            shutdown,
            part: Vec::new(),
            pos: 0,
            current_seen: false,
        }
    }

    /// Wait for the next composite; false once the stream should end
    fn wait_changed(&mut self) -> bool {
        let frames = &mut self.frames;
        let shutdown = &mut self.shutdown;
        futures::executor::block_on(async {
            tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => false,
                changed = frames.changed() => changed.is_ok(),
            }
        })
    }

    /// Encode the next composite into `part`; false at end of stream
    fn next_part(&mut self) -> io::Result<bool> {
        loop {
            if *self.shutdown.borrow() {
                return Ok(false);
            }
            if self.current_seen && !self.wait_changed() {
                return Ok(false);
            }
            self.current_seen = true;

            let Some(composite) = self.frames.borrow_and_update().clone() else {
                continue;
            };
            let jpeg = composite.encode_jpeg(JPEG_QUALITY).map_err(io::Error::other)?;
            self.part = multipart_part(&jpeg);
            self.pos = 0;
            return Ok(true);
        }
    }
}

impl Read for MjpegStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.part.len() && !self.next_part()? {
            return Ok(0);
        }
        let n = buf.len().min(self.part.len() - self.pos);
        buf[..n].copy_from_slice(&self.part[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
