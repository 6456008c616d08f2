//! Whole-chain reconciliation against a peer's snapshot.
//!
//! Pure: no I/O and no locks. The caller fetches the remote blocks, asks
//! [`reconcile`] what to do, and applies a `Replace` through
//! [`Blockchain::replace_with`](crate::core::Blockchain::replace_with).

use crate::core::{Block, Chain};
use log::{debug, warn};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeepReason {
    /// Remote is not strictly longer; ties keep the local chain
    NotLonger { local: usize, remote: usize },
    /// Remote is longer but does not replay from genesis
    Invalid(String),
}

impl fmt::Display for KeepReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeepReason::NotLonger { local, remote } => {
                write!(f, "remote has {remote} blocks, local has {local}")
            }
            KeepReason::Invalid(msg) => write!(f, "remote chain invalid: {msg}"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Reconciliation {
    Keep { reason: KeepReason },
    Replace(Chain),
}

impl Reconciliation {
    pub fn is_replace(&self) -> bool {
        matches!(self, Reconciliation::Replace(_))
    }
}

/// Longest valid chain wins. Remote blocks are replayed under the local
/// chain's parameters, so a peer cannot lower the difficulty floor or raise the
/// reward.
pub fn reconcile(local: &Chain, remote: Vec<Block>) -> Reconciliation {
    if remote.len() <= local.len() {
        debug!(
            "Keeping local chain: remote {} blocks, local {}",
            remote.len(),
            local.len()
        );
        return Reconciliation::Keep {
            reason: KeepReason::NotLonger {
                local: local.len(),
                remote: remote.len(),
            },
        };
    }

    match Chain::from_blocks(remote, local.params().clone()) {
        Ok(chain) => Reconciliation::Replace(chain),
        Err(e) => {
            warn!("Remote chain rejected: {e}");
            Reconciliation::Keep {
                reason: KeepReason::Invalid(e.to_string()),
            }
        }
    }
}

/// The chain that survives reconciliation
pub fn select_chain(local: &Chain, remote: Vec<Block>) -> Chain {
    match reconcile(local, remote) {
        Reconciliation::Replace(chain) => chain,
        Reconciliation::Keep { .. } => local.clone(),
    }
}
