//! Transports
//!
//! [`Transport`] is the controller's blocking half: one request out, the
//! matching response back, bounded by a timeout. [`Endpoint`] is the
//! executor's half. Responses carry the sequence number of their request so
//! a late answer to a request that already timed out is skipped, not
//! mistaken for the current one.
//!
//! Two media: an in-process channel pair and a Unix socket carrying
//! length-prefixed JSON frames.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use thiserror::Error;

use super::protocol::{Envelope, Request, Response};

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// No executor answering; callers must not retry automatically
    #[error("Executor unavailable: {0}")]
    ExecutorUnavailable(String),

    /// The other side went away
    #[error("Transport disconnected")]
    Disconnected,

    #[error("Malformed message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Controller side of the channel
pub trait Transport: Send {
    /// Send `request` and block until its response arrives or `timeout` passes
    fn exchange(&mut self, request: &Request, timeout: Duration) -> Result<Response, TransportError>;
}

/// Executor side of the channel
pub trait Endpoint {
    /// Next request, or `None` if nothing arrived within `timeout`
    fn recv(&mut self, timeout: Duration) -> Result<Option<Envelope<Request>>, TransportError>;

    fn reply(&mut self, seq: u64, response: Response) -> Result<(), TransportError>;
}

/// In-process controller half
pub struct ChannelTransport {
    requests: Sender<Envelope<Request>>,
    responses: Receiver<Envelope<Response>>,
    seq: u64,
}

/// In-process executor half
pub struct ChannelEndpoint {
    requests: Receiver<Envelope<Request>>,
    responses: Sender<Envelope<Response>>,
}

/// Connected in-process pair
pub fn channel() -> (ChannelTransport, ChannelEndpoint) {
    let (request_tx, request_rx) = mpsc::channel();
    let (response_tx, response_rx) = mpsc::channel();
    (
        ChannelTransport {
            requests: request_tx,
            responses: response_rx,
            seq: 0,
        },
        ChannelEndpoint {
            requests: request_rx,
            responses: response_tx,
        },
    )
}

impl Transport for ChannelTransport {
    fn exchange(&mut self, request: &Request, timeout: Duration) -> Result<Response, TransportError> {
        self.seq += 1;
        let seq = self.seq;
        self.requests
            .send(Envelope {
                seq,
                body: request.clone(),
            })
            .map_err(|_| TransportError::ExecutorUnavailable("executor is not running".into()))?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.responses.recv_timeout(remaining) {
                Ok(envelope) if envelope.seq == seq => return Ok(envelope.body),
                Ok(stale) => log::debug!("Dropping stale response #{}", stale.seq),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(TransportError::ExecutorUnavailable(format!(
                        "no response to {} within {:?}",
                        request.name(),
                        timeout
                    )))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(TransportError::ExecutorUnavailable("executor exited".into()))
                }
            }
        }
    }
}

impl Endpoint for ChannelEndpoint {
    fn recv(&mut self, timeout: Duration) -> Result<Option<Envelope<Request>>, TransportError> {
        match self.requests.recv_timeout(timeout) {
            Ok(envelope) => Ok(Some(envelope)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected),
        }
    }

    fn reply(&mut self, seq: u64, response: Response) -> Result<(), TransportError> {
        self.responses
            .send(Envelope {
                seq,
                body: response,
            })
            .map_err(|_| TransportError::Disconnected)
    }
}

#[cfg(unix)]
pub use socket::{SocketEndpoint, SocketTransport};

#[cfg(unix)]
mod socket {
    use std::io::{ErrorKind, Read, Write};
    use std::os::unix::net::{UnixListener, UnixStream};
    use std::path::{Path, PathBuf};
    use std::time::{Duration, Instant};

    use serde::de::DeserializeOwned;
    use serde::Serialize;

    use super::{Endpoint, Transport, TransportError};
    use crate::ipc::protocol::{Envelope, Request, Response};

    const MAX_FRAME: usize = 256 * 1024 * 1024;

    fn write_frame<W: Write, T: Serialize>(writer: &mut W, value: &T) -> Result<(), TransportError> {
        let body = serde_json::to_vec(value)?;
        let len = u32::try_from(body.len()).map_err(|_| {
            std::io::Error::new(ErrorKind::InvalidData, "frame exceeds u32 length")
        })?;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(&body)?;
        writer.flush()?;
        Ok(())
    }

    /// Reassembles frames across reads that time out part-way
    #[derive(Default)]
    struct FrameReader {
        buffer: Vec<u8>,
    }

    impl FrameReader {
        fn take_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
            let Some(header) = self.buffer.get(..4) else {
                return Ok(None);
            };
            let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
            if len > MAX_FRAME {
                return Err(std::io::Error::new(
                    ErrorKind::InvalidData,
                    format!("frame of {} bytes is too large", len),
                )
                .into());
            }
            if self.buffer.len() < 4 + len {
                return Ok(None);
            }
            let frame = self.buffer[4..4 + len].to_vec();
            self.buffer.drain(..4 + len);
            Ok(Some(frame))
        }

        /// Next complete frame; `None` when the read timed out first
        fn poll<T: DeserializeOwned>(&mut self, stream: &mut UnixStream) -> Result<Option<T>, TransportError> {
            let mut chunk = [0u8; 8192];
            loop {
                if let Some(frame) = self.take_frame()? {
                    return Ok(Some(serde_json::from_slice(&frame)?));
                }
                match stream.read(&mut chunk) {
                    Ok(0) => return Err(TransportError::Disconnected),
                    Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                    Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                        return Ok(None)
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }

    fn read_timeout(timeout: Duration) -> Option<Duration> {
        // A zero timeout would mean "block forever"
        Some(timeout.max(Duration::from_millis(1)))
    }

    /// Controller half over a Unix socket
    pub struct SocketTransport {
        stream: UnixStream,
        reader: FrameReader,
        seq: u64,
    }

    impl SocketTransport {
        pub fn connect(path: impl AsRef<Path>) -> Result<Self, TransportError> {
            let path = path.as_ref();
            let stream = UnixStream::connect(path).map_err(|e| {
                TransportError::ExecutorUnavailable(format!("cannot connect to {}: {}", path.display(), e))
            })?;
            Ok(Self {
                stream,
                reader: FrameReader::default(),
                seq: 0,
            })
        }
    }

    impl Transport for SocketTransport {
        fn exchange(&mut self, request: &Request, timeout: Duration) -> Result<Response, TransportError> {
            self.seq += 1;
            let seq = self.seq;
            let unavailable = |e: TransportError| match e {
                TransportError::Disconnected | TransportError::Io(_) => {
                    TransportError::ExecutorUnavailable(e.to_string())
                }
                other => other,
            };
            write_frame(
                &mut self.stream,
                &Envelope {
                    seq,
                    body: request.clone(),
                },
            )
            .map_err(unavailable)?;

            let deadline = Instant::now() + timeout;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(TransportError::ExecutorUnavailable(format!(
                        "no response to {} within {:?}",
                        request.name(),
                        timeout
                    )));
                }
                self.stream.set_read_timeout(read_timeout(remaining))?;
                match self.reader.poll::<Envelope<Response>>(&mut self.stream) {
                    Ok(Some(envelope)) if envelope.seq == seq => return Ok(envelope.body),
                    Ok(Some(stale)) => log::debug!("Dropping stale response #{}", stale.seq),
                    Ok(None) => {}
                    Err(e) => return Err(unavailable(e)),
                }
            }
        }
    }

    /// Executor half: serves one controller connection at a time
    pub struct SocketEndpoint {
        path: PathBuf,
        listener: UnixListener,
        client: Option<(UnixStream, FrameReader)>,
    }

    impl SocketEndpoint {
        /// Listen on `path`, replacing a stale socket file
        pub fn bind(path: impl Into<PathBuf>) -> Result<Self, TransportError> {
            let path = path.into();
            match std::fs::remove_file(&path) {
                Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
            let listener = UnixListener::bind(&path)?;
            listener.set_nonblocking(true)?;
            log::info!("Listening on {}", path.display());
            Ok(Self {
                path,
                listener,
                client: None,
            })
        }

        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    impl Endpoint for SocketEndpoint {
        fn recv(&mut self, timeout: Duration) -> Result<Option<Envelope<Request>>, TransportError> {
            if self.client.is_none() {
                match self.listener.accept() {
                    Ok((stream, _)) => {
                        stream.set_nonblocking(false)?;
                        log::info!("Controller connected");
                        self.client = Some((stream, FrameReader::default()));
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        std::thread::sleep(timeout);
                        return Ok(None);
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            let Some((stream, reader)) = self.client.as_mut() else {
                return Ok(None);
            };
            stream.set_read_timeout(read_timeout(timeout))?;
            match reader.poll(stream) {
                Err(TransportError::Disconnected) => {
                    log::info!("Controller disconnected");
                    self.client = None;
                    Ok(None)
                }
                other => other,
            }
        }

        fn reply(&mut self, seq: u64, response: Response) -> Result<(), TransportError> {
            let (stream, _) = self.client.as_mut().ok_or(TransportError::Disconnected)?;
            write_frame(
                stream,
                &Envelope {
                    seq,
                    body: response,
                },
            )
        }
    }

    impl Drop for SocketEndpoint {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
