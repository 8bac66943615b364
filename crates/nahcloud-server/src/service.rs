//! The five Terraform HTTP backend operations on top of [`StateStore`].
//!
//! Reads and writes are allowed whether or not the state is locked. Terraform
//! attaches its lock id to writes, but the server only logs a mismatch and
//! never rejects the write.

use nahcloud_store::{
    AcquireOutcome, LockRecord, ReleaseOutcome, StateStore, StoreError, UnlockRequest,
};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("state not found: {0}")]
    NotFound(String),
    #[error("state is locked by '{}' (lock ID: {})", .0.who, .0.id)]
    Conflict(LockRecord),
    #[error("lock ID mismatch: state is locked with {}", .0.id)]
    LockMismatch(LockRecord),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidStateId { .. } | StoreError::InvalidKey(_) => {
                Self::InvalidInput(err.to_string())
            }
            _ => Self::Internal(err.to_string()),
        }
    }
}

/// Successful outcomes of an UNLOCK request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unlocked {
    Released(LockRecord),
    /// Nothing was locked. Treated as success for Terraform compatibility.
    NotLocked,
}

pub struct StateService {
    store: StateStore,
}

impl StateService {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn get_state(&self, id: &str) -> Result<Vec<u8>, ServiceError> {
        self.store
            .read(id)?
            .ok_or_else(|| ServiceError::NotFound(id.to_owned()))
    }

    /// `lock_id` is the `ID` query parameter Terraform sends while it holds the lock.
    pub fn set_state(
        &self,
        id: &str,
        body: &[u8],
        lock_id: Option<&str>,
    ) -> Result<(), ServiceError> {
        if body.is_empty() {
            return Err(ServiceError::InvalidInput(
                "state body must not be empty".to_owned(),
            ));
        }
        if let Some(lock_id) = lock_id {
            match self.store.lock_info(id)? {
                Some(held) if held.id == lock_id => {}
                Some(held) => warn!(
                    "write to {id} with lock {lock_id} while {} holds the lock",
                    held.id
                ),
                None => warn!("write to {id} with lock {lock_id} but the state is unlocked"),
            }
        }
        self.store.write(id, body)?;
        info!("state {id}: wrote {} bytes", body.len());
        Ok(())
    }

    /// Deleting an unknown id succeeds.
    pub fn delete_state(&self, id: &str) -> Result<(), ServiceError> {
        if self.store.delete(id)? {
            info!("state {id}: deleted");
        }
        Ok(())
    }

    pub fn acquire_lock(&self, id: &str, body: &[u8]) -> Result<LockRecord, ServiceError> {
        let mut record: LockRecord = parse_body(body)?;
        if record.id.is_empty() {
            return Err(ServiceError::InvalidInput("lock ID is required".to_owned()));
        }
        record.stamp(id);

        match self.store.try_acquire_lock(id, record)? {
            AcquireOutcome::Acquired(record) => {
                info!(
                    "state {id}: locked by {} ({} {})",
                    record.id, record.who, record.operation
                );
                Ok(record)
            }
            AcquireOutcome::Conflict(held) => {
                warn!("state {id}: lock conflict, held by {}", held.id);
                Err(ServiceError::Conflict(held))
            }
        }
    }

    pub fn release_lock(&self, id: &str, body: &[u8]) -> Result<Unlocked, ServiceError> {
        let req: UnlockRequest = parse_body(body)?;
        if req.id.is_empty() {
            return Err(ServiceError::InvalidInput("lock ID is required".to_owned()));
        }

        match self.store.release_lock(id, &req.id)? {
            ReleaseOutcome::Released(record) => {
                info!("state {id}: unlocked by {}", record.id);
                Ok(Unlocked::Released(record))
            }
            ReleaseOutcome::Mismatch(held) => {
                warn!(
                    "state {id}: unlock with {} rejected, held by {}",
                    req.id, held.id
                );
                Err(ServiceError::LockMismatch(held))
            }
            ReleaseOutcome::NotLocked => Ok(Unlocked::NotLocked),
        }
    }
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ServiceError> {
    if body.is_empty() {
        return Err(ServiceError::InvalidInput("request body is empty".to_owned()));
    }
    serde_json::from_slice(body)
        .map_err(|e| ServiceError::InvalidInput(format!("malformed JSON body: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn service() -> StateService {
        StateService::new(StateStore::in_memory())
    }

    fn lock_body(token: &str, who: &str) -> Vec<u8> {
        format!(r#"{{"ID":"{token}","Operation":"OperationTypeApply","Who":"{who}","Version":"1.9.8"}}"#)
            .into_bytes()
    }

    fn unlock_body(token: &str) -> Vec<u8> {
        format!(r#"{{"ID":"{token}"}}"#).into_bytes()
    }

    #[test]
    fn set_then_get_round_trips() {
        let svc = service();
        let blob = b"{\"version\":4,\"serial\":7,\"resources\":[]}";
        svc.set_state("prod", blob, None).unwrap();
        assert_eq!(svc.get_state("prod").unwrap(), blob.to_vec());
    }

    #[test]
    fn get_unknown_id_is_not_found() {
        assert!(matches!(
            service().get_state("never-written"),
            Err(ServiceError::NotFound(id)) if id == "never-written"
        ));
    }

    #[test]
    fn set_rejects_empty_body() {
        assert!(matches!(
            service().set_state("prod", b"", None),
            Err(ServiceError::InvalidInput(_))
        ));
    }

    #[test]
    fn delete_is_idempotent() {
        let svc = service();
        svc.set_state("prod", b"{}", None).unwrap();
        svc.delete_state("prod").unwrap();
        svc.delete_state("prod").unwrap();
        assert!(matches!(
            svc.get_state("prod"),
            Err(ServiceError::NotFound(_))
        ));
    }

    #[test]
    fn conflict_returns_current_holder() {
        let svc = service();
        let r1 = svc.acquire_lock("prod", &lock_body("r1", "alice")).unwrap();
        assert_eq!(r1.who, "alice");
        assert_eq!(r1.path, "prod");
        assert!(r1.created.is_some());

        match svc.acquire_lock("prod", &lock_body("r2", "bob")) {
            Err(ServiceError::Conflict(held)) => assert_eq!(held, r1),
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(svc.store().lock_info("prod").unwrap(), Some(r1));
    }

    #[test]
    fn wrong_token_release_is_mismatch() {
        let svc = service();
        let r1 = svc.acquire_lock("prod", &lock_body("r1", "alice")).unwrap();
        match svc.release_lock("prod", &unlock_body("wrong-token")) {
            Err(ServiceError::LockMismatch(held)) => assert_eq!(held, r1),
            other => panic!("expected mismatch, got {other:?}"),
        }
        assert_eq!(svc.store().lock_info("prod").unwrap(), Some(r1));
    }

    #[test]
    fn release_then_reacquire() {
        let svc = service();
        let r1 = svc.acquire_lock("prod", &lock_body("r1", "alice")).unwrap();
        assert_eq!(
            svc.release_lock("prod", &unlock_body("r1")).unwrap(),
            Unlocked::Released(r1)
        );
        svc.acquire_lock("prod", &lock_body("r2", "bob")).unwrap();
    }

    #[test]
    fn release_when_unlocked_is_lenient() {
        assert_eq!(
            service().release_lock("prod", &unlock_body("r1")).unwrap(),
            Unlocked::NotLocked
        );
    }

    #[test]
    fn delete_clears_lock() {
        let svc = service();
        svc.set_state("prod", b"{}", None).unwrap();
        svc.acquire_lock("prod", &lock_body("r1", "alice")).unwrap();
        svc.delete_state("prod").unwrap();
        svc.acquire_lock("prod", &lock_body("r2", "bob")).unwrap();
    }

    #[test]
    fn writes_are_not_blocked_by_a_foreign_lock() {
        let svc = service();
        svc.acquire_lock("prod", &lock_body("r1", "alice")).unwrap();
        svc.set_state("prod", b"{\"serial\":2}", Some("someone-else"))
            .unwrap();
        svc.set_state("prod", b"{\"serial\":3}", None).unwrap();
        assert_eq!(svc.get_state("prod").unwrap(), b"{\"serial\":3}".to_vec());
    }

    #[test]
    fn malformed_lock_bodies_are_invalid_input() {
        let svc = service();
        for body in [&b""[..], b"not json", b"{\"Who\":\"alice\"}", b"{\"ID\":\"\"}"] {
            assert!(
                matches!(
                    svc.acquire_lock("prod", body),
                    Err(ServiceError::InvalidInput(_))
                ),
                "{}",
                String::from_utf8_lossy(body)
            );
        }
        assert_eq!(svc.store().lock_info("prod").unwrap(), None);
    }

    #[test]
    fn malformed_unlock_bodies_are_invalid_input() {
        let svc = service();
        for body in [&b""[..], b"[1,2]", b"{}"] {
            assert!(matches!(
                svc.release_lock("prod", body),
                Err(ServiceError::InvalidInput(_))
            ));
        }
    }

    #[test]
    fn invalid_state_id_is_invalid_input() {
        assert!(matches!(
            service().get_state("../../etc/passwd"),
            Err(ServiceError::InvalidInput(_))
        ));
    }

    #[test]
    fn concurrent_acquire_single_winner() {
        const N: usize = 12;
        let svc = Arc::new(service());
        let barrier = Arc::new(Barrier::new(N));

        let handles: Vec<_> = (0..N)
            .map(|i| {
                let svc = Arc::clone(&svc);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    svc.acquire_lock("race", &lock_body(&format!("t{i}"), "ci"))
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let winners: Vec<&LockRecord> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1);
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(ServiceError::Conflict(held)) if held == winners[0]))
            .count();
        assert_eq!(conflicts, N - 1);
    }
}
