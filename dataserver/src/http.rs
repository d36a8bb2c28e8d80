//! Minimal HTTP/1.1 endpoint serving the latest telemetry snapshot as JSON.
//!
//! Every connection gets its own short-lived thread, carries one request and is closed after the
//! response. The request head is limited in size and has to arrive within a fixed deadline.
use std::{
    io::{self, BufRead, BufReader, Read, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use common::now_ms;
use serde::Serialize;

use crate::sink::LatestSnapshot;

pub const DATA_PATH: &str = "/get_data_from_B";

const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// Time a client has for sending the complete request line and headers.
const REQUEST_DEADLINE: Duration = Duration::from_secs(2);
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound for request line plus headers.
const MAX_HEAD_BYTES: u64 = 8 * 1024;

/// How long and how much trailing input is discarded before a connection is closed.
const LINGER_TIMEOUT: Duration = Duration::from_millis(500);
const LINGER_BYTES: u64 = 64 * 1024;

/// Connections served at the same time. Further ones are closed right away.
const MAX_CONNECTIONS: usize = 16;

/// Body of a successful data query.
#[derive(Debug, Serialize)]
struct DataResponse {
    left_rpm: f64,
    right_rpm: f64,
    linear_vel: f64,
    angular_vel: f64,
    /// When the producer published the sample, ms since the UNIX epoch.
    timestamp_a: i64,
    /// When this response was created, ms since the UNIX epoch.
    timestamp_b: i64,
    fresh: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Response {
    pub status: u16,
    pub body: String,
}

impl Response {
    fn json(status: u16, body: String) -> Self {
        Self { status, body }
    }

    fn error(status: u16, message: &str) -> Self {
        Self::json(status, serde_json::json!({ "error": message }).to_string())
    }

    fn reason(&self) -> &'static str {
        match self.status {
            200 => "OK",
            400 => "Bad Request",
            404 => "Not Found",
            405 => "Method Not Allowed",
            408 => "Request Timeout",
            431 => "Request Header Fields Too Large",
            503 => "Service Unavailable",
            _ => "Internal Server Error",
        }
    }

    fn write_to(&self, out: &mut impl Write) -> io::Result<()> {
        write!(
            out,
            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            self.status,
            self.reason(),
            self.body.len(),
            self.body
        )?;
        out.flush()
    }
}

/// Answers one request.
pub(crate) fn route(method: &str, target: &str, snapshot: &LatestSnapshot) -> Response {
    // the query string plays no role
    let path = target.split('?').next().unwrap_or(target);

    if path != DATA_PATH {
        return Response::error(404, "not found");
    }
    if method != "GET" {
        return Response::error(405, "only GET is supported");
    }

    let Some(latest) = snapshot.get() else {
        return Response::error(503, "no sample has been read yet");
    };

    let body = DataResponse {
        left_rpm: latest.sample.left_rpm,
        right_rpm: latest.sample.right_rpm,
        linear_vel: latest.sample.linear_velocity,
        angular_vel: latest.sample.angular_velocity,
        timestamp_a: latest.sample.produced_at_ms,
        timestamp_b: now_ms(),
        fresh: latest.sample.fresh,
    };

    match serde_json::to_string(&body) {
        Ok(body) => Response::json(200, body),
        Err(e) => {
            tracing::error!("Could not serialize response: {e}");
            Response::error(500, "serialization failed")
        }
    }
}

/// Reads from a stream until an absolute deadline, no matter how the data trickles in.
struct DeadlineReader<'a> {
    stream: &'a TcpStream,
    deadline: Instant,
}

impl Read for DeadlineReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "deadline passed"));
        }
        self.stream.set_read_timeout(Some(remaining))?;

        let mut stream = self.stream;
        stream.read(buf)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Head {
    Request { method: String, target: String },
    Malformed,
    TooLarge,
    /// The client went away before finishing the request line.
    Closed,
}

/// Reads one line including its `\n`. False if the input ended first.
fn read_line(reader: &mut impl BufRead, line: &mut Vec<u8>) -> io::Result<bool> {
    line.clear();
    reader.read_until(b'\n', line)?;
    Ok(line.ends_with(b"\n"))
}

/// Reads the request line and skips the headers, at most [`MAX_HEAD_BYTES`] in total.
fn read_head(input: impl Read) -> io::Result<Head> {
    let mut reader = BufReader::new(input.take(MAX_HEAD_BYTES));
    let mut line = Vec::new();

    if !read_line(&mut reader, &mut line)? {
        return Ok(if reader.get_ref().limit() == 0 {
            Head::TooLarge
        } else {
            Head::Closed
        });
    }
    let request_line = String::from_utf8_lossy(&line).into_owned();

    loop {
        if !read_line(&mut reader, &mut line)? {
            if reader.get_ref().limit() == 0 {
                return Ok(Head::TooLarge);
            }
            // headers cut short by the client closing its side, the request line is enough
            break;
        }
        if line == b"\r\n" || line == b"\n" {
            break;
        }
    }

    let mut parts = request_line.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(target), Some(version)) if version.starts_with("HTTP/") => {
            Ok(Head::Request {
                method: method.to_string(),
                target: target.to_string(),
            })
        }
        _ => Ok(Head::Malformed),
    }
}

/// Stops sending, then discards what the client still sends for a short while. Unread input
/// turns the close into a reset, which can discard the response on the client side.
fn linger_close(stream: &TcpStream) {
    if stream.shutdown(Shutdown::Write).is_err() {
        return;
    }
    let drain = DeadlineReader {
        stream,
        deadline: Instant::now() + LINGER_TIMEOUT,
    };
    let _ = io::copy(&mut drain.take(LINGER_BYTES), &mut io::sink());
}

fn handle_connection(stream: TcpStream, snapshot: &LatestSnapshot) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;

    let input = DeadlineReader {
        stream: &stream,
        deadline: Instant::now() + REQUEST_DEADLINE,
    };

    let response = match read_head(input) {
        Ok(Head::Request { method, target }) => {
            let response = route(&method, &target, snapshot);
            tracing::debug!("{method} {target} -> {}", response.status);
            response
        }
        Ok(Head::Malformed) => Response::error(400, "malformed request line"),
        Ok(Head::TooLarge) => Response::error(431, "request head too large"),
        Ok(Head::Closed) => return Ok(()),
        Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
            Response::error(408, "request not received in time")
        }
        Err(e) => return Err(e),
    };

    let mut out = &stream;
    response.write_to(&mut out)?;
    linger_close(&stream);

    Ok(())
}

/// Serves [`DATA_PATH`] on its own thread until the running flag is cleared.
pub struct QueryServer {
    handle: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl QueryServer {
    pub fn spawn(
        bind_address: &str,
        snapshot: LatestSnapshot,
        running: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(bind_address)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        tracing::info!("Serving http://{local_addr}{DATA_PATH}");

        let handle = thread::Builder::new()
            .name("query-server".to_string())
            .spawn(move || {
                let active = Arc::new(AtomicUsize::new(0));

                while running.load(Ordering::Relaxed) {
                    match listener.accept() {
                        Ok((stream, addr)) => {
                            if active.load(Ordering::Relaxed) >= MAX_CONNECTIONS {
                                tracing::warn!(
                                    "Dropping connection from {addr}, too many requests in flight"
                                );
                                continue;
                            }
                            active.fetch_add(1, Ordering::Relaxed);

                            let spawned = thread::Builder::new()
                                .name("query-connection".to_string())
                                .spawn({
                                    let snapshot = snapshot.clone();
                                    let active = active.clone();
                                    move || {
                                        if let Err(e) = handle_connection(stream, &snapshot) {
                                            tracing::warn!("Request from {addr} failed: {e}");
                                        }
                                        active.fetch_sub(1, Ordering::Relaxed);
                                    }
                                });
                            if let Err(e) = spawned {
                                active.fetch_sub(1, Ordering::Relaxed);
                                tracing::error!("Could not serve {addr}: {e}");
                            }
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                            thread::sleep(ACCEPT_POLL);
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {e}");
                            thread::sleep(ACCEPT_POLL);
                        }
                    }
                }
                tracing::info!("Query server stopped");
            })?;

        Ok(Self { handle, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for the accept thread to finish, which happens after the running flag is cleared.
    /// Connections still in flight end on their own within [`REQUEST_DEADLINE`].
    pub fn join(self) {
        if self.handle.join().is_err() {
            tracing::error!("Query server thread panicked");
        }
    }
}
