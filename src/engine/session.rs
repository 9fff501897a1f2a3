use std::{collections::BTreeMap, fmt::Debug, sync::Arc};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::core::exchange::Exchange;

/// A change applied to an exchange by [SessionStore::conditional_update].
pub type Mutator = Box<dyn FnOnce(&mut Exchange) + Send>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("exchange {0} not found")]
    NotFound(Uuid),
    #[error("exchange {id} already exists")]
    AlreadyExists { id: Uuid },
    #[error("exchange {id} is at sequence {actual}, expected {expected}")]
    Conflict { id: Uuid, expected: u64, actual: u64 },
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Storage interface for exchanges.
///
/// Implementations must make [conditional_update](SessionStore::conditional_update) atomic
/// with respect to every other write of the same exchange.
#[async_trait]
pub trait SessionStore: Debug {
    /// Store a new exchange.
    async fn create(&self, exchange: Exchange) -> Result<(), StoreError>;

    /// Get an exchange from the store.
    async fn get(&self, id: Uuid) -> Result<Exchange, StoreError>;

    /// Apply `mutator` only if the stored sequence equals `expected_sequence`.
    ///
    /// On success the store increments `sequence`, stamps `updated_at` and returns the
    /// committed exchange. Mutators must not change `id` or `sequence`.
    async fn conditional_update(
        &self,
        id: Uuid,
        expected_sequence: u64,
        mutator: Mutator,
    ) -> Result<Exchange, StoreError>;
}

/// A local in-memory store. Not for production use!
///
/// # Warning
/// This in-memory store should only be used for test purposes, it will not work for a distributed
/// deployment. Expired exchanges are never removed.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    store: Arc<Mutex<BTreeMap<Uuid, Exchange>>>,
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create(&self, exchange: Exchange) -> Result<(), StoreError> {
        let mut store = self.store.lock().await;
        if store.contains_key(&exchange.id) {
            return Err(StoreError::AlreadyExists { id: exchange.id });
        }
        store.insert(exchange.id, exchange);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Exchange, StoreError> {
        self.store
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn conditional_update(
        &self,
        id: Uuid,
        expected_sequence: u64,
        mutator: Mutator,
    ) -> Result<Exchange, StoreError> {
        let mut store = self.store.lock().await;
        let Some(stored) = store.get_mut(&id) else {
            return Err(StoreError::NotFound(id));
        };
        if stored.sequence != expected_sequence {
            return Err(StoreError::Conflict {
                id,
                expected: expected_sequence,
                actual: stored.sequence,
            });
        }

        // The stored record only changes once the mutator has returned.
        let mut updated = stored.clone();
        mutator(&mut updated);
        updated.id = id;
        updated.sequence = expected_sequence + 1;
        updated.updated_at = OffsetDateTime::now_utc();
        *stored = updated.clone();
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::core::exchange::{ExchangeState, Variables};

    use super::*;

    fn exchange() -> Exchange {
        let now = OffsetDateTime::now_utc();
        Exchange {
            id: Uuid::new_v4(),
            sequence: 0,
            ttl: 900,
            created_at: now,
            updated_at: now,
            state: ExchangeState::Pending,
            step: "a".into(),
            variables: Variables::default(),
            challenge: None,
            workflow_id: "w".into(),
            access_token: None,
            presentation_request: json!({}),
            backend_reference: None,
            reason: None,
        }
    }

    #[tokio::test]
    async fn conditional_update_increments_sequence() {
        let store = MemoryStore::default();
        let exchange = exchange();
        let id = exchange.id;
        store.create(exchange).await.unwrap();

        let updated = store
            .conditional_update(id, 0, Box::new(|e: &mut Exchange| e.step = "b".into()))
            .await
            .unwrap();
        assert_eq!(updated.sequence, 1);
        assert_eq!(store.get(id).await.unwrap().step, "b");
    }

    #[tokio::test]
    async fn stale_sequence_is_rejected_without_writing() {
        let store = MemoryStore::default();
        let exchange = exchange();
        let id = exchange.id;
        store.create(exchange).await.unwrap();
        store
            .conditional_update(id, 0, Box::new(|_: &mut Exchange| {}))
            .await
            .unwrap();

        let err = store
            .conditional_update(id, 0, Box::new(|e: &mut Exchange| e.step = "stale".into()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict {
                expected: 0,
                actual: 1,
                ..
            }
        ));
        assert_eq!(store.get(id).await.unwrap().step, "a");
    }

    #[tokio::test]
    async fn mutators_cannot_touch_sequence() {
        let store = MemoryStore::default();
        let exchange = exchange();
        let id = exchange.id;
        store.create(exchange).await.unwrap();
        let updated = store
            .conditional_update(id, 0, Box::new(|e: &mut Exchange| e.sequence = 42))
            .await
            .unwrap();
        assert_eq!(updated.sequence, 1);
    }

    #[tokio::test]
    async fn missing_and_duplicate_exchanges() {
        let store = MemoryStore::default();
        let exchange = exchange();
        let id = exchange.id;
        assert!(matches!(
            store.get(id).await,
            Err(StoreError::NotFound(missing)) if missing == id
        ));
        store.create(exchange.clone()).await.unwrap();
        assert!(matches!(
            store.create(exchange).await,
            Err(StoreError::AlreadyExists { .. })
        ));
    }
}
