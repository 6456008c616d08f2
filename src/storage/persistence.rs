// Durable storage for the chain, the peer table and the cached aggregates.
// sled is the primary backend; when it cannot be opened I fall back to a single
// bincode image rewritten atomically (temp file + rename).

use crate::core::{Block, BlockBody, BlockHeader, Chain, ChainParams};
use crate::error::{BlockchainError, Result};
use crate::utils::{deserialize, from_json, serialize, to_json_pretty, Hash256};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sled::transaction::TransactionError;
use sled::{Db, Transactional, Tree};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const BLOCKS_TREE: &str = "blocks";
const PEERS_TREE: &str = "peers";
const STATE_TREE: &str = "state";
const STATE_KEY: &str = "chain_state";

const SLED_DIR: &str = "sled";
const FILE_IMAGE: &str = "chain.bin";

/// One block as it sits on disk: header fields, serialized body, recorded hash
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct StoredBlock {
    pub header: BlockHeader,
    pub body: Vec<u8>,
    pub hash: Hash256,
}

impl StoredBlock {
    pub fn from_block(block: &Block) -> Result<StoredBlock> {
        Ok(StoredBlock {
            header: block.header().clone(),
            body: serialize(block.body())?,
            // Recorded, not recomputed
            hash: block.sealed_hash().unwrap_or_else(|| block.hash()),
        })
    }

    pub fn into_block(self) -> Result<Block> {
        let body: BlockBody = deserialize(&self.body).map_err(|e| {
            BlockchainError::CorruptStore(format!("block {} body: {e}", self.header.index))
        })?;
        Ok(Block::from_parts(self.header, body, Some(self.hash)))
    }
}

/// Singleton record of cached aggregates, written in the same transaction as blocks
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct StateRecord {
    pub tip_hash: Hash256,
    pub total_supply: u64,
    pub block_count: u64,
    pub last_validated: bool,
}

impl StateRecord {
    pub fn for_chain(chain: &Chain, last_validated: bool) -> StateRecord {
        StateRecord {
            tip_hash: chain.tip_hash().unwrap_or(Hash256::ZERO),
            total_supply: chain.total_supply(),
            block_count: chain.len() as u64,
            last_validated,
        }
    }
}

/// Known peer and the outcome of its last health check
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct PeerRecord {
    pub address: String,
    /// Milliseconds since the Unix epoch of the last successful contact
    pub last_seen: Option<i64>,
    pub reachable: bool,
    pub tip_height: Option<u64>,
}

impl PeerRecord {
    pub fn new(address: &str) -> PeerRecord {
        PeerRecord {
            address: address.to_string(),
            last_seen: None,
            reachable: false,
            tip_height: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreBackend {
    Sled,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub backend: StoreBackend,
    pub block_count: u64,
    pub peer_count: usize,
}

/// Durable store contract.
///
/// `append_block` is the incremental path used on every commit; `replace_all`
/// rewrites the chain after a reconciliation. Both persist the block records
/// and the state record together or not at all.
pub trait ChainStore: Send + Sync {
    fn backend(&self) -> StoreBackend;

    /// Blocks in index order, `None` for a store that was never written
    fn load_blocks(&self) -> Result<Option<Vec<Block>>>;

    fn load_state(&self) -> Result<Option<StateRecord>>;

    fn append_block(&self, block: &Block, state: &StateRecord) -> Result<()>;

    fn replace_all(&self, blocks: &[Block], state: &StateRecord) -> Result<()>;

    fn load_peers(&self) -> Result<Vec<PeerRecord>>;

    fn save_peers(&self, peers: &[PeerRecord]) -> Result<()>;

    /// Full rewrite of `chain`
    fn save(&self, chain: &Chain) -> Result<()> {
        self.replace_all(chain.blocks(), &StateRecord::for_chain(chain, true))
    }

    /// Load and fully re-validate the stored chain.
    ///
    /// A store whose contents do not replay into a valid chain reports
    /// [`BlockchainError::CorruptStore`]; the caller decides whether to start
    /// over from genesis.
    fn load(&self, params: ChainParams) -> Result<Option<Chain>> {
        let Some(blocks) = self.load_blocks()? else {
            return Ok(None);
        };
        let chain = Chain::from_blocks(blocks, params).map_err(|e| match e {
            BlockchainError::CorruptStore(msg) => BlockchainError::CorruptStore(msg),
            other => BlockchainError::CorruptStore(format!("stored chain is invalid: {other}")),
        })?;
        Ok(Some(chain))
    }

    /// Pretty JSON export of every stored block
    fn snapshot(&self) -> Result<String> {
        let blocks = self.load_blocks()?.unwrap_or_default();
        to_json_pretty(&blocks)
    }

    fn stats(&self) -> Result<StoreStats> {
        Ok(StoreStats {
            backend: self.backend(),
            block_count: self.load_state()?.map(|s| s.block_count).unwrap_or(0),
            peer_count: self.load_peers()?.len(),
        })
    }
}

/// Parse a [`ChainStore::snapshot`] export back into blocks
pub fn import_snapshot(json: &str) -> Result<Vec<Block>> {
    from_json(json)
}

/// Open the store under `dir`: sled first, the atomic file image if sled fails
pub fn open_store(dir: &Path) -> Result<Arc<dyn ChainStore>> {
    fs::create_dir_all(dir)?;
    match SledStore::open(&dir.join(SLED_DIR)) {
        Ok(store) => Ok(Arc::new(store)),
        Err(e) => {
            warn!("sled store unavailable ({e}), falling back to file image");
            Ok(Arc::new(FileStore::open(&dir.join(FILE_IMAGE))?))
        }
    }
}

fn block_key(index: u64) -> [u8; 8] {
    index.to_be_bytes()
}

/// Check that stored records form a gap-free sequence agreeing with the state record
fn check_integrity(blocks: &[Block], state: Option<&StateRecord>) -> Result<()> {
    for (position, block) in blocks.iter().enumerate() {
        if block.index() != position as u64 {
            return Err(BlockchainError::CorruptStore(format!(
                "record {position} holds block {}",
                block.index()
            )));
        }
    }
    let Some(state) = state else {
        return Err(BlockchainError::CorruptStore(
            "blocks present without a state record".to_string(),
        ));
    };
    if state.block_count != blocks.len() as u64 {
        return Err(BlockchainError::CorruptStore(format!(
            "state expects {} blocks, found {}",
            state.block_count,
            blocks.len()
        )));
    }
    let tip = blocks.last().map(Block::hash).unwrap_or(Hash256::ZERO);
    if tip != state.tip_hash {
        return Err(BlockchainError::CorruptStore(format!(
            "state tip {} does not match stored tip {}",
            state.tip_hash.short(),
            tip.short()
        )));
    }
    Ok(())
}

pub struct SledStore {
    db: Db,
    blocks: Tree,
    peers: Tree,
    state: Tree,
}

impl SledStore {
    pub fn open(path: &Path) -> Result<SledStore> {
        let db = sled::open(path)?;
        let blocks = db.open_tree(BLOCKS_TREE)?;
        let peers = db.open_tree(PEERS_TREE)?;
        let state = db.open_tree(STATE_TREE)?;
        info!("Opened sled store at {}", path.display());
        Ok(SledStore {
            db,
            blocks,
            peers,
            state,
        })
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl ChainStore for SledStore {
    fn backend(&self) -> StoreBackend {
        StoreBackend::Sled
    }

    fn load_blocks(&self) -> Result<Option<Vec<Block>>> {
        let state = self.load_state()?;
        let mut blocks = Vec::new();
        for entry in self.blocks.iter() {
            let (key, value) = entry?;
            let record: StoredBlock = deserialize(&value).map_err(|e| {
                BlockchainError::CorruptStore(format!("undecodable block record: {e}"))
            })?;
            if key.as_ref() != block_key(record.header.index) {
                return Err(BlockchainError::CorruptStore(format!(
                    "block {} stored under the wrong key",
                    record.header.index
                )));
            }
            blocks.push(record.into_block()?);
        }

        if blocks.is_empty() && state.is_none() {
            return Ok(None);
        }
        check_integrity(&blocks, state.as_ref())?;
        debug!("Loaded {} blocks from sled", blocks.len());
        Ok(Some(blocks))
    }

    fn load_state(&self) -> Result<Option<StateRecord>> {
        match self.state.get(STATE_KEY)? {
            Some(bytes) => Ok(Some(deserialize(&bytes).map_err(|e| {
                BlockchainError::CorruptStore(format!("undecodable state record: {e}"))
            })?)),
            None => Ok(None),
        }
    }

    fn append_block(&self, block: &Block, state: &StateRecord) -> Result<()> {
        let key = block_key(block.index());
        let record = serialize(&StoredBlock::from_block(block)?)?;
        let state_bytes = serialize(state)?;

        (&self.blocks, &self.state)
            .transaction(|(blocks, state_tree)| {
                blocks.insert(&key[..], record.as_slice())?;
                state_tree.insert(STATE_KEY, state_bytes.as_slice())?;
                Ok(())
            })
            .map_err(|e: TransactionError| {
                BlockchainError::Persistence(format!("Failed to append block: {e}"))
            })?;
        self.flush()
    }

    fn replace_all(&self, blocks: &[Block], state: &StateRecord) -> Result<()> {
        let records = blocks
            .iter()
            .map(|b| Ok((block_key(b.index()), serialize(&StoredBlock::from_block(b)?)?)))
            .collect::<Result<Vec<_>>>()?;
        let state_bytes = serialize(state)?;

        // Anything past the new tip has to go in the same transaction
        let first_stale = block_key(blocks.len() as u64);
        let mut stale = Vec::new();
        for key in self.blocks.iter().keys() {
            let key = key?;
            if key.as_ref() >= &first_stale[..] {
                stale.push(key);
            }
        }

        (&self.blocks, &self.state)
            .transaction(|(block_tree, state_tree)| {
                for key in &stale {
                    block_tree.remove(key.as_ref())?;
                }
                for (key, record) in &records {
                    block_tree.insert(&key[..], record.as_slice())?;
                }
                state_tree.insert(STATE_KEY, state_bytes.as_slice())?;
                Ok(())
            })
            .map_err(|e: TransactionError| {
                BlockchainError::Persistence(format!("Failed to rewrite chain: {e}"))
            })?;
        self.flush()
    }

    fn load_peers(&self) -> Result<Vec<PeerRecord>> {
        self.peers
            .iter()
            .values()
            .map(|value| {
                let value = value?;
                deserialize(&value).map_err(|e| {
                    BlockchainError::CorruptStore(format!("undecodable peer record: {e}"))
                })
            })
            .collect()
    }

    fn save_peers(&self, peers: &[PeerRecord]) -> Result<()> {
        let mut batch = sled::Batch::default();
        for key in self.peers.iter().keys() {
            batch.remove(key?);
        }
        for peer in peers {
            batch.insert(peer.address.as_bytes(), serialize(peer)?);
        }
        self.peers.apply_batch(batch)?;
        self.flush()
    }
}

/// Everything the file backend keeps, written as one bincode image
#[derive(Debug, Clone, Default, bincode::Encode, bincode::Decode)]
struct FileImage {
    blocks: Vec<StoredBlock>,
    state: Option<StateRecord>,
    peers: Vec<PeerRecord>,
}

/// Fallback store: whole image rewritten through a temp file and an atomic rename
pub struct FileStore {
    path: PathBuf,
    image: Mutex<std::result::Result<FileImage, String>>,
}

impl FileStore {
    pub fn open(path: &Path) -> Result<FileStore> {
        let image = if path.exists() {
            let bytes = fs::read(path)?;
            deserialize::<FileImage>(&bytes).map_err(|e| format!("{}: {e}", path.display()))
        } else {
            Ok(FileImage::default())
        };
        if let Err(msg) = &image {
            warn!("File store image is unreadable: {msg}");
        }
        Ok(FileStore {
            path: path.to_path_buf(),
            image: Mutex::new(image),
        })
    }

    fn write_image(&self, image: &FileImage) -> Result<()> {
        let bytes = serialize(image)?;
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Apply `update` to a copy of the image, write it, then keep the copy
    fn update<F>(&self, allow_corrupt: bool, update: F) -> Result<()>
    where
        F: FnOnce(&mut FileImage) -> Result<()>,
    {
        let mut guard = self
            .image
            .lock()
            .map_err(|_| BlockchainError::Persistence("file store lock poisoned".to_string()))?;
        let mut next = match &*guard {
            Ok(image) => image.clone(),
            Err(_) if allow_corrupt => FileImage::default(),
            Err(msg) => return Err(BlockchainError::CorruptStore(msg.clone())),
        };
        update(&mut next)?;
        self.write_image(&next)?;
        *guard = Ok(next);
        Ok(())
    }

    fn read<T, F>(&self, read: F) -> Result<T>
    where
        F: FnOnce(&FileImage) -> Result<T>,
    {
        let guard = self
            .image
            .lock()
            .map_err(|_| BlockchainError::Persistence("file store lock poisoned".to_string()))?;
        match &*guard {
            Ok(image) => read(image),
            Err(msg) => Err(BlockchainError::CorruptStore(msg.clone())),
        }
    }
}

impl ChainStore for FileStore {
    fn backend(&self) -> StoreBackend {
        StoreBackend::File
    }

    fn load_blocks(&self) -> Result<Option<Vec<Block>>> {
        self.read(|image| {
            if image.blocks.is_empty() && image.state.is_none() {
                return Ok(None);
            }
            let blocks = image
                .blocks
                .iter()
                .cloned()
                .map(StoredBlock::into_block)
                .collect::<Result<Vec<_>>>()?;
            check_integrity(&blocks, image.state.as_ref())?;
            Ok(Some(blocks))
        })
    }

    fn load_state(&self) -> Result<Option<StateRecord>> {
        self.read(|image| Ok(image.state.clone()))
    }

    fn append_block(&self, block: &Block, state: &StateRecord) -> Result<()> {
        let record = StoredBlock::from_block(block)?;
        self.update(false, |image| {
            if block.index() != image.blocks.len() as u64 {
                return Err(BlockchainError::Persistence(format!(
                    "append of block {} onto {} stored blocks",
                    block.index(),
                    image.blocks.len()
                )));
            }
            image.blocks.push(record);
            image.state = Some(state.clone());
            Ok(())
        })
    }

    fn replace_all(&self, blocks: &[Block], state: &StateRecord) -> Result<()> {
        let records = blocks
            .iter()
            .map(StoredBlock::from_block)
            .collect::<Result<Vec<_>>>()?;
        // A full rewrite is how a caller recovers from a corrupt image
        self.update(true, |image| {
            image.blocks = records;
            image.state = Some(state.clone());
            Ok(())
        })
    }

    fn load_peers(&self) -> Result<Vec<PeerRecord>> {
        self.read(|image| Ok(image.peers.clone()))
    }

    fn save_peers(&self, peers: &[PeerRecord]) -> Result<()> {
        self.update(false, |image| {
            image.peers = peers.to_vec();
            Ok(())
        })
    }
}
