//! Peer-to-peer chain synchronization
//!
//! Known peers live in a [`PeerTable`]. Chains are fetched through an injected
//! [`PeerTransport`] (TCP in production, anything in tests) and reconciled by
//! the pure longest-valid-chain rule in [`sync`].

pub mod peers;
pub mod sync;
pub mod transport;

pub use peers::{check_address, PeerTable};
pub use sync::{reconcile, select_chain, KeepReason, Reconciliation};
pub use transport::{PeerHealth, PeerRequest, PeerResponse, PeerServer, PeerTransport, TcpTransport};
