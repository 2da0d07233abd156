use std::path::Path;
use std::sync::Arc;

use rocksdb::{BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, MultiThreaded, Options};

use crate::errors::{ChainError, ChainResult};
use crate::types::{DsBlock, TxBlock, VcBlock};

pub const STORAGE_SCHEMA_VERSION: u32 = 1;

pub(crate) const CF_DS_BLOCKS: &str = "ds_blocks";
pub(crate) const CF_TX_BLOCKS: &str = "tx_blocks";
pub(crate) const CF_VC_BLOCKS: &str = "vc_blocks";
pub(crate) const CF_STATE_DELTAS: &str = "state_deltas";
pub(crate) const CF_METADATA: &str = "metadata";

const SCHEMA_VERSION_KEY: &[u8] = b"schema_version";

/// Metadata slots the post-consensus core maintains.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetaKey {
    LatestActiveDsBlockNum,
    DsIncompleted,
}

impl MetaKey {
    fn as_bytes(&self) -> &'static [u8] {
        match self {
            MetaKey::LatestActiveDsBlockNum => b"LATESTACTIVEDSBLOCKNUM",
            MetaKey::DsIncompleted => b"DSINCOMPLETED",
        }
    }
}

/// Durable store facade for finalized blocks, state deltas, and metadata.
/// Writes are synced before returning; payload interpretation stays with the
/// callers.
pub struct Storage {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl Storage {
    pub fn open(path: &Path) -> ChainResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_DS_BLOCKS, Options::default()),
            ColumnFamilyDescriptor::new(CF_TX_BLOCKS, Options::default()),
            ColumnFamilyDescriptor::new(CF_VC_BLOCKS, Options::default()),
            ColumnFamilyDescriptor::new(CF_STATE_DELTAS, Options::default()),
            ColumnFamilyDescriptor::new(CF_METADATA, Options::default()),
        ];
        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)?;
        let storage = Self { db: Arc::new(db) };
        storage.ensure_schema_supported()?;
        Ok(storage)
    }

    fn cf(&self, name: &str) -> ChainResult<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| ChainError::Config(format!("missing column family {name}")))
    }

    fn ensure_schema_supported(&self) -> ChainResult<()> {
        let metadata_cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&metadata_cf, SCHEMA_VERSION_KEY)? {
            Some(raw) => {
                let bytes: [u8; 4] = raw.as_slice().try_into().map_err(|_| {
                    ChainError::Config("corrupt schema version record".to_string())
                })?;
                let version = u32::from_be_bytes(bytes);
                if version != STORAGE_SCHEMA_VERSION {
                    return Err(ChainError::Config(format!(
                        "database schema version {version} is not the supported {STORAGE_SCHEMA_VERSION}"
                    )));
                }
                Ok(())
            }
            None => {
                self.db.put_cf(
                    &metadata_cf,
                    SCHEMA_VERSION_KEY,
                    STORAGE_SCHEMA_VERSION.to_be_bytes(),
                )?;
                Ok(())
            }
        }
    }

    pub fn put_ds_block(&self, block: &DsBlock) -> ChainResult<()> {
        let cf = self.cf(CF_DS_BLOCKS)?;
        let key = format!("ds:{}", block.header.block_num);
        self.db.put_cf(&cf, key, bincode::serialize(block)?)?;
        Ok(())
    }

    pub fn get_ds_block(&self, block_num: u64) -> ChainResult<Option<DsBlock>> {
        let cf = self.cf(CF_DS_BLOCKS)?;
        let key = format!("ds:{block_num}");
        match self.db.get_cf(&cf, key)? {
            Some(raw) => Ok(Some(bincode::deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn put_tx_block(&self, block: &TxBlock) -> ChainResult<()> {
        let cf = self.cf(CF_TX_BLOCKS)?;
        let key = format!("tx:{}", block.header.block_num);
        self.db.put_cf(&cf, key, bincode::serialize(block)?)?;
        Ok(())
    }

    pub fn get_tx_block(&self, block_num: u64) -> ChainResult<Option<TxBlock>> {
        let cf = self.cf(CF_TX_BLOCKS)?;
        let key = format!("tx:{block_num}");
        match self.db.get_cf(&cf, key)? {
            Some(raw) => Ok(Some(bincode::deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn put_vc_block(&self, block: &VcBlock) -> ChainResult<()> {
        let cf = self.cf(CF_VC_BLOCKS)?;
        let key = format!("vc:{}", block.block_hash);
        self.db.put_cf(&cf, key, bincode::serialize(block)?)?;
        Ok(())
    }

    pub fn get_vc_block(&self, block_hash: &str) -> ChainResult<Option<VcBlock>> {
        let cf = self.cf(CF_VC_BLOCKS)?;
        let key = format!("vc:{block_hash}");
        match self.db.get_cf(&cf, key)? {
            Some(raw) => Ok(Some(bincode::deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn put_state_delta(&self, tx_block_num: u64, delta: &[u8]) -> ChainResult<()> {
        let cf = self.cf(CF_STATE_DELTAS)?;
        let key = format!("delta:{tx_block_num}");
        self.db.put_cf(&cf, key, delta)?;
        Ok(())
    }

    pub fn get_state_delta(&self, tx_block_num: u64) -> ChainResult<Option<Vec<u8>>> {
        let cf = self.cf(CF_STATE_DELTAS)?;
        let key = format!("delta:{tx_block_num}");
        Ok(self.db.get_cf(&cf, key)?)
    }

    pub fn put_metadata(&self, key: MetaKey, value: &[u8]) -> ChainResult<()> {
        let cf = self.cf(CF_METADATA)?;
        self.db.put_cf(&cf, key.as_bytes(), value)?;
        Ok(())
    }

    pub fn get_metadata(&self, key: MetaKey) -> ChainResult<Option<Vec<u8>>> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(&cf, key.as_bytes())?)
    }
}
