use crate::error::{BlockchainError, Result};
use crate::network::transport::PeerHealth;
use crate::storage::PeerRecord;
use log::info;
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Known peers and what their last health check said
pub struct PeerTable {
    inner: RwLock<BTreeMap<String, PeerRecord>>,
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Accepts `host:port` with a numeric port
pub fn check_address(address: &str) -> Result<()> {
    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(()),
        _ => Err(BlockchainError::Config(format!(
            "peer address {address:?} is not host:port"
        ))),
    }
}

impl PeerTable {
    pub fn new() -> PeerTable {
        PeerTable {
            inner: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn from_records(records: Vec<PeerRecord>) -> PeerTable {
        let map = records
            .into_iter()
            .map(|record| (record.address.clone(), record))
            .collect();
        PeerTable {
            inner: RwLock::new(map),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, PeerRecord>> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, PeerRecord>> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a peer; returns false if it was already known
    pub fn add(&self, address: &str) -> Result<bool> {
        let address = address.trim();
        check_address(address)?;
        let mut peers = self.write();
        if peers.contains_key(address) {
            return Ok(false);
        }
        peers.insert(address.to_string(), PeerRecord::new(address));
        info!("Added peer {address}");
        Ok(true)
    }

    pub fn remove(&self, address: &str) -> bool {
        self.write().remove(address).is_some()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.read().contains_key(address)
    }

    pub fn get(&self, address: &str) -> Option<PeerRecord> {
        self.read().get(address).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Every peer, ordered by address
    pub fn list(&self) -> Vec<PeerRecord> {
        self.read().values().cloned().collect()
    }

    /// Store the outcome of a health check made at `now` (ms)
    pub fn record_health(&self, address: &str, health: &PeerHealth, now: i64) {
        if let Some(record) = self.write().get_mut(address) {
            record.reachable = health.reachable;
            if health.reachable {
                record.last_seen = Some(now);
                record.tip_height = health.tip_height;
            }
        }
    }

    /// Mark a peer unreachable after a failed fetch
    pub fn mark_unreachable(&self, address: &str) {
        if let Some(record) = self.write().get_mut(address) {
            record.reachable = false;
        }
    }

    /// Poll order: reachable peers first, highest reported tip first, then by address
    pub fn prioritized(&self) -> Vec<String> {
        let mut records = self.list();
        records.sort_by(|a, b| {
            b.reachable
                .cmp(&a.reachable)
                .then(b.tip_height.cmp(&a.tip_height))
                .then(a.address.cmp(&b.address))
        });
        records.into_iter().map(|record| record.address).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy(tip: u64) -> PeerHealth {
        PeerHealth {
            reachable: true,
            tip_height: Some(tip),
        }
    }

    #[test]
    fn test_add_is_idempotent_and_checked() {
        let table = PeerTable::new();
        assert!(table.add("127.0.0.1:3001").unwrap());
        assert!(!table.add("127.0.0.1:3001").unwrap());
        assert!(table.add("no-port").is_err());
        assert!(table.add(":3001").is_err());
        assert!(table.add("host:99999").is_err());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_health_updates_record() {
        let table = PeerTable::new();
        table.add("127.0.0.1:3001").unwrap();
        table.record_health("127.0.0.1:3001", &healthy(7), 1_000);

        let record = table.get("127.0.0.1:3001").unwrap();
        assert!(record.reachable);
        assert_eq!(record.tip_height, Some(7));
        assert_eq!(record.last_seen, Some(1_000));

        table.record_health("127.0.0.1:3001", &PeerHealth::unreachable(), 2_000);
        let record = table.get("127.0.0.1:3001").unwrap();
        assert!(!record.reachable);
        assert_eq!(record.last_seen, Some(1_000));
    }

    #[test]
    fn test_prioritized_order() {
        let table = PeerTable::new();
        for addr in ["a:1", "b:1", "c:1", "d:1"] {
            table.add(addr).unwrap();
        }
        table.record_health("b:1", &healthy(3), 1);
        table.record_health("c:1", &healthy(9), 1);
        table.record_health("d:1", &PeerHealth::unreachable(), 1);

        assert_eq!(table.prioritized(), vec!["c:1", "b:1", "a:1", "d:1"]);
    }

    #[test]
    fn test_round_trip_through_records() {
        let table = PeerTable::new();
        table.add("a:1").unwrap();
        table.add("b:2").unwrap();
        let restored = PeerTable::from_records(table.list());
        assert_eq!(restored.list(), table.list());
        assert!(restored.remove("a:1"));
        assert!(!restored.contains("a:1"));
    }
}
