//! The seam to the backend object store. The broker drives fragments
//! through this trait only; the concrete cluster API stays outside the
//! crate. `MemStore` is the in-tree implementation.

use hashbrown::HashMap;
use parking_lot::RwLock;

pub type PoolName = String;
pub type ObjectId = String;

#[derive(Debug, Eq, PartialEq)]
pub enum StoreError {
    NotConnected,
    UnknownPool,
    UnknownObject,
    /// Single operation exceeds what the backend accepts (E2BIG analogue).
    TooLarge,
    Backend(String),
}

pub trait ObjectStore: Send + Sync {
    /// Establish the cluster connection. Called once, on the worker
    /// thread that owns the client.
    fn connect(&self) -> Result<(), StoreError>;

    /// Open a per-pool context; idempotent.
    fn open_pool(&self, pool: &str) -> Result<(), StoreError>;

    fn read(&self, pool: &str, oid: &str, offset: u64, len: u32) -> Result<Vec<u8>, StoreError>;

    /// Write at an offset, or append when `append` is set.
    fn write(
        &self,
        pool: &str,
        oid: &str,
        offset: u64,
        data: &[u8],
        append: bool,
    ) -> Result<(), StoreError>;

    /// Largest single read/write the backend accepts.
    fn max_op_size(&self) -> u32;
}

/// In-memory pools of objects; reads past the end are truncated the way a
/// short object read would be.
pub struct MemStore {
    pools: RwLock<HashMap<PoolName, HashMap<ObjectId, Vec<u8>>>>,
    max_op: u32,
}

impl MemStore {
    pub const DEFAULT_MAX_OP: u32 = 8 * 1024 * 1024;

    pub fn new(max_op: u32) -> MemStore {
        MemStore {
            pools: RwLock::new(HashMap::new()),
            max_op,
        }
    }

    /// Seed an object, creating its pool on the way.
    pub fn put_object(&self, pool: &str, oid: &str, data: Vec<u8>) {
        self.pools
            .write()
            .entry(pool.to_string())
            .or_default()
            .insert(oid.to_string(), data);
    }

    pub fn object(&self, pool: &str, oid: &str) -> Option<Vec<u8>> {
        self.pools.read().get(pool)?.get(oid).cloned()
    }
}

impl Default for MemStore {
    fn default() -> MemStore {
        MemStore::new(MemStore::DEFAULT_MAX_OP)
    }
}

impl ObjectStore for MemStore {
    fn connect(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn open_pool(&self, pool: &str) -> Result<(), StoreError> {
        self.pools.write().entry(pool.to_string()).or_default();
        Ok(())
    }

    fn read(&self, pool: &str, oid: &str, offset: u64, len: u32) -> Result<Vec<u8>, StoreError> {
        if len > self.max_op {
            return Err(StoreError::TooLarge);
        }

        let pools = self.pools.read();
        let object = pools
            .get(pool)
            .ok_or(StoreError::UnknownPool)?
            .get(oid)
            .ok_or(StoreError::UnknownObject)?;

        let start = (offset as usize).min(object.len());
        let end = (offset as usize + len as usize).min(object.len());
        Ok(object[start..end].to_vec())
    }

    fn write(
        &self,
        pool: &str,
        oid: &str,
        offset: u64,
        data: &[u8],
        append: bool,
    ) -> Result<(), StoreError> {
        if data.len() as u64 > self.max_op as u64 {
            return Err(StoreError::TooLarge);
        }

        let mut pools = self.pools.write();
        let object = pools
            .get_mut(pool)
            .ok_or(StoreError::UnknownPool)?
            .entry(oid.to_string())
            .or_default();

        if append {
            object.extend_from_slice(data);
        } else {
            let end = offset as usize + data.len();
            if object.len() < end {
                object.resize(end, 0);
            }
            object[offset as usize..end].copy_from_slice(data);
        }

        Ok(())
    }

    fn max_op_size(&self) -> u32 {
        self.max_op
    }
}
