use crate::keyed::KeyedMutex;
use crate::kv::{KvBackend, MemoryKv};
use crate::lock::LockRecord;
use crate::StoreError;
use tracing::debug;

const MAX_STATE_ID_LEN: usize = 128;

/// Result of [`StateStore::try_acquire_lock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The record was stored and is now the active lock.
    Acquired(LockRecord),
    /// Another record already holds the lock; it is returned unchanged.
    Conflict(LockRecord),
}

/// Result of [`StateStore::release_lock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The token matched and the returned record was removed.
    Released(LockRecord),
    /// The token did not match; the active record is returned unchanged.
    Mismatch(LockRecord),
    NotLocked,
}

pub fn validate_state_id(id: &str) -> Result<(), StoreError> {
    let invalid = |reason: &str| StoreError::InvalidStateId {
        id: id.to_owned(),
        reason: reason.to_owned(),
    };
    if id.is_empty() || id.len() > MAX_STATE_ID_LEN {
        return Err(invalid("state id must be 1-128 characters"));
    }
    if id.starts_with('.') {
        return Err(invalid("state id must not start with '.'"));
    }
    if !id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
    {
        return Err(invalid("state id must match [a-zA-Z0-9_.-]"));
    }
    Ok(())
}

fn blob_key(id: &str) -> String {
    format!("{id}.tfstate")
}

fn lock_key(id: &str) -> String {
    format!("{id}.lock")
}

/// One opaque state blob and at most one [`LockRecord`] per state id.
///
/// Every operation on a given id runs under that id's guard, so the five
/// operations are linearizable per id. Different ids never share a guard.
pub struct StateStore {
    kv: Box<dyn KvBackend>,
    guards: KeyedMutex,
}

impl StateStore {
    pub fn new(kv: impl KvBackend + 'static) -> Self {
        Self {
            kv: Box::new(kv),
            guards: KeyedMutex::new(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryKv::new())
    }

    pub fn read(&self, id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        validate_state_id(id)?;
        self.guards.with(id, || self.kv.get(&blob_key(id)))
    }

    pub fn write(&self, id: &str, data: &[u8]) -> Result<(), StoreError> {
        validate_state_id(id)?;
        self.guards.with(id, || {
            debug!("write {id}: {} bytes", data.len());
            self.kv.put(&blob_key(id), data)
        })
    }

    /// Remove the blob and any lock. Returns `false` if neither existed.
    pub fn delete(&self, id: &str) -> Result<bool, StoreError> {
        validate_state_id(id)?;
        self.guards.with(id, || {
            let had_blob = self.kv.delete(&blob_key(id))?;
            let had_lock = self.kv.delete(&lock_key(id))?;
            debug!("delete {id}: blob={had_blob} lock={had_lock}");
            Ok(had_blob || had_lock)
        })
    }

    pub fn lock_info(&self, id: &str) -> Result<Option<LockRecord>, StoreError> {
        validate_state_id(id)?;
        self.guards.with(id, || self.load_lock(id))
    }

    pub fn try_acquire_lock(
        &self,
        id: &str,
        record: LockRecord,
    ) -> Result<AcquireOutcome, StoreError> {
        validate_state_id(id)?;
        self.guards.with(id, || {
            let data = serde_json::to_vec_pretty(&record)?;
            if self.kv.put_if_absent(&lock_key(id), &data)? {
                debug!("lock {id}: acquired by {}", record.id);
                return Ok(AcquireOutcome::Acquired(record));
            }
            match self.load_lock(id)? {
                Some(existing) => Ok(AcquireOutcome::Conflict(existing)),
                None => Err(StoreError::Io(std::io::Error::other(format!(
                    "lock record for {id} vanished during acquire"
                )))),
            }
        })
    }

    pub fn release_lock(&self, id: &str, token: &str) -> Result<ReleaseOutcome, StoreError> {
        validate_state_id(id)?;
        self.guards.with(id, || match self.load_lock(id)? {
            None => Ok(ReleaseOutcome::NotLocked),
            Some(existing) if existing.id == token => {
                self.kv.delete(&lock_key(id))?;
                debug!("lock {id}: released by {token}");
                Ok(ReleaseOutcome::Released(existing))
            }
            Some(existing) => Ok(ReleaseOutcome::Mismatch(existing)),
        })
    }

    /// Caller must hold the guard for `id`.
    fn load_lock(&self, id: &str) -> Result<Option<LockRecord>, StoreError> {
        match self.kv.get(&lock_key(id))? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }
}
