use crate::core::{Block, Blockchain};
use crate::error::{BlockchainError, Result};
use crate::utils::Hash256;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Deserializer;
use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Largest response body accepted from a peer
pub const MAX_RESPONSE_BYTES: u64 = 64 * 1024 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// Outcome of a liveness probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerHealth {
    pub reachable: bool,
    pub tip_height: Option<u64>,
}

impl PeerHealth {
    pub fn unreachable() -> PeerHealth {
        PeerHealth {
            reachable: false,
            tip_height: None,
        }
    }
}

/// How the engine talks to peers. Injected so reconciliation can be driven
/// without a network.
pub trait PeerTransport: Send + Sync {
    /// Full chain of `peer`; fails with `PeerUnreachable` or `Timeout`
    fn fetch_chain(&self, peer: &str) -> Result<Vec<Block>>;

    /// Cheap probe, never fails: an unreachable peer just says so
    fn health_check(&self, peer: &str) -> PeerHealth;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRequest {
    GetChain,
    Health,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerResponse {
    Chain { blocks: Vec<Block> },
    Health { tip_height: u64, tip_hash: Hash256 },
    Error { message: String },
}

fn classify_io(peer: &str, err: io::Error) -> BlockchainError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            BlockchainError::Timeout(peer.to_string())
        }
        _ => BlockchainError::PeerUnreachable(format!("{peer}: {err}")),
    }
}

/// One JSON request, one JSON response, one connection. `timeout` bounds the
/// whole exchange, connect included.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    timeout: Duration,
}

impl TcpTransport {
    pub fn new(timeout: Duration) -> TcpTransport {
        TcpTransport { timeout }
    }

    fn resolve(peer: &str) -> Result<SocketAddr> {
        peer.to_socket_addrs()
            .map_err(|e| BlockchainError::PeerUnreachable(format!("{peer}: {e}")))?
            .next()
            .ok_or_else(|| BlockchainError::PeerUnreachable(format!("{peer}: no address")))
    }

    fn remaining(peer: &str, deadline: Instant) -> Result<Duration> {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(BlockchainError::Timeout(peer.to_string()));
        }
        Ok(left)
    }

    fn request(&self, peer: &str, request: &PeerRequest) -> Result<PeerResponse> {
        let deadline = Instant::now() + self.timeout;
        let addr = Self::resolve(peer)?;
        let stream = TcpStream::connect_timeout(&addr, Self::remaining(peer, deadline)?)
            .map_err(|e| classify_io(peer, e))?;

        let payload = serde_json::to_vec(request)?;
        stream
            .set_write_timeout(Some(Self::remaining(peer, deadline)?))
            .map_err(|e| classify_io(peer, e))?;
        (&stream)
            .write_all(&payload)
            .map_err(|e| classify_io(peer, e))?;
        (&stream).flush().map_err(|e| classify_io(peer, e))?;
        let _ = stream.shutdown(Shutdown::Write);

        let buffer = Self::read_response(peer, &stream, deadline)?;
        debug!("Received {} bytes from {peer}", buffer.len());

        match serde_json::from_slice(&buffer) {
            Ok(PeerResponse::Error { message }) => Err(BlockchainError::PeerUnreachable(
                format!("{peer} answered with an error: {message}"),
            )),
            Ok(response) => Ok(response),
            Err(e) => Err(BlockchainError::PeerUnreachable(format!(
                "{peer} sent an unreadable response: {e}"
            ))),
        }
    }

    /// Read until the peer closes, never past `deadline` or `MAX_RESPONSE_BYTES`
    fn read_response(peer: &str, stream: &TcpStream, deadline: Instant) -> Result<Vec<u8>> {
        let mut limited = stream.take(MAX_RESPONSE_BYTES + 1);
        let mut buffer = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            stream
                .set_read_timeout(Some(Self::remaining(peer, deadline)?))
                .map_err(|e| classify_io(peer, e))?;
            match limited.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(classify_io(peer, e)),
            }
        }
        if buffer.len() as u64 > MAX_RESPONSE_BYTES {
            return Err(BlockchainError::PeerUnreachable(format!(
                "{peer} sent more than {MAX_RESPONSE_BYTES} bytes"
            )));
        }
        Ok(buffer)
    }
}

impl PeerTransport for TcpTransport {
    fn fetch_chain(&self, peer: &str) -> Result<Vec<Block>> {
        match self.request(peer, &PeerRequest::GetChain)? {
            PeerResponse::Chain { blocks } => {
                info!("Fetched {} blocks from {peer}", blocks.len());
                Ok(blocks)
            }
            other => Err(BlockchainError::PeerUnreachable(format!(
                "{peer} answered GetChain with {other:?}"
            ))),
        }
    }

    fn health_check(&self, peer: &str) -> PeerHealth {
        match self.request(peer, &PeerRequest::Health) {
            Ok(PeerResponse::Health { tip_height, .. }) => PeerHealth {
                reachable: true,
                tip_height: Some(tip_height),
            },
            Ok(other) => {
                warn!("Peer {peer} answered Health with {other:?}");
                PeerHealth::unreachable()
            }
            Err(e) => {
                warn!("Health check of {peer} failed: {e}");
                PeerHealth::unreachable()
            }
        }
    }
}

/// Answers `GetChain` and `Health` for the local chain
pub struct PeerServer {
    listener: TcpListener,
    blockchain: Blockchain,
    timeout: Duration,
}

impl PeerServer {
    pub fn bind(addr: &str, blockchain: Blockchain, timeout: Duration) -> Result<PeerServer> {
        let listener = TcpListener::bind(addr)?;
        info!("Peer server listening on {}", listener.local_addr()?);
        Ok(PeerServer {
            listener,
            blockchain,
            timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever, one handler thread each
    pub fn run(&self) -> Result<()> {
        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    let blockchain = self.blockchain.clone();
                    let timeout = self.timeout;
                    thread::spawn(move || {
                        let peer_addr = stream
                            .peer_addr()
                            .map(|a| a.to_string())
                            .unwrap_or_else(|_| "unknown".to_string());
                        if let Err(e) = Self::handle_connection(&blockchain, stream, timeout) {
                            error!("Error handling connection from {peer_addr}: {e}");
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {e}");
                }
            }
        }
        Ok(())
    }

    /// Run the accept loop on a background thread
    pub fn spawn(self) -> JoinHandle<()> {
        thread::spawn(move || {
            if let Err(e) = self.run() {
                error!("Peer server stopped: {e}");
            }
        })
    }

    fn handle_connection(
        blockchain: &Blockchain,
        stream: TcpStream,
        timeout: Duration,
    ) -> Result<()> {
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        let reader = BufReader::new(&stream);
        let request = Deserializer::from_reader(reader)
            .into_iter::<PeerRequest>()
            .next();

        let response = match request {
            Some(Ok(request)) => {
                debug!("Peer request: {request:?}");
                Self::answer(blockchain, request)
            }
            Some(Err(e)) => PeerResponse::Error {
                message: format!("unreadable request: {e}"),
            },
            None => PeerResponse::Error {
                message: "empty request".to_string(),
            },
        };

        serde_json::to_writer(&stream, &response)?;
        let _ = stream.shutdown(Shutdown::Both);
        Ok(())
    }

    fn answer(blockchain: &Blockchain, request: PeerRequest) -> PeerResponse {
        let result = match request {
            PeerRequest::GetChain => blockchain
                .blocks()
                .map(|blocks| PeerResponse::Chain { blocks }),
            PeerRequest::Health => blockchain.view(|chain| PeerResponse::Health {
                tip_height: chain.height(),
                tip_hash: chain.tip_hash().unwrap_or(Hash256::ZERO),
            }),
        };
        result.unwrap_or_else(|e| PeerResponse::Error {
            message: e.to_string(),
        })
    }
}
