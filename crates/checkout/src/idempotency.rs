//! Idempotency guard: at most one execution per (route, key), with response
//! replay for retries.

use reservation_store::{IdempotencyClaim, ReservationStore};
use serde::Serialize;

use crate::clock::Clock;
use crate::error::Result;

/// What the caller should do after consulting the guard.
#[derive(Debug, Clone, PartialEq)]
pub enum IdempotencyOutcome {
    /// First sighting of the key; the caller holds the claim and must call
    /// [`IdempotencyGuard::complete`] or [`IdempotencyGuard::abandon`].
    Proceed,

    /// A prior execution completed; return this stored response unchanged.
    Replay(serde_json::Value),

    /// Another execution with the same key is still running; do not re-run
    /// side effects.
    Conflict,
}

/// Deduplicates retried mutating requests keyed by a client-supplied
/// idempotency key, scoped per route.
#[derive(Clone)]
pub struct IdempotencyGuard<S, C> {
    store: S,
    clock: C,
    retention: chrono::Duration,
}

impl<S, C> IdempotencyGuard<S, C>
where
    S: ReservationStore,
    C: Clock,
{
    /// Creates a new guard. `retention` bounds how long completed records
    /// are kept for replay.
    pub fn new(store: S, clock: C, retention: chrono::Duration) -> Self {
        Self {
            store,
            clock,
            retention,
        }
    }

    /// Claims the key or reports why the caller must not proceed.
    ///
    /// The claim is atomic: of N concurrent first requests exactly one
    /// receives [`IdempotencyOutcome::Proceed`].
    #[tracing::instrument(skip(self))]
    pub async fn begin(&self, route: &str, key: &str) -> Result<IdempotencyOutcome> {
        let claim = self
            .store
            .claim_idempotency(route, key, self.clock.now())
            .await?;
        Ok(match claim {
            IdempotencyClaim::Claimed => IdempotencyOutcome::Proceed,
            IdempotencyClaim::InFlight => {
                metrics::counter!("idempotency_conflicts_total").increment(1);
                IdempotencyOutcome::Conflict
            }
            IdempotencyClaim::Completed(response) => {
                metrics::counter!("idempotency_replays_total").increment(1);
                IdempotencyOutcome::Replay(response)
            }
        })
    }

    /// Stores the response snapshot; all later requests with the key replay it.
    pub async fn complete(&self, route: &str, key: &str, response: &impl Serialize) -> Result<()> {
        let snapshot = serde_json::to_value(response)?;
        self.store
            .complete_idempotency(route, key, snapshot, self.clock.now())
            .await?;
        Ok(())
    }

    /// Releases an in-progress claim after a failed execution so the client
    /// can retry. Completed records are left untouched.
    pub async fn abandon(&self, route: &str, key: &str) -> Result<()> {
        self.store.release_idempotency(route, key).await?;
        Ok(())
    }

    /// Purges records older than the retention window.
    ///
    /// Returns the number of records deleted.
    pub async fn purge_expired(&self) -> Result<u64> {
        let cutoff = self.clock.now() - self.retention;
        Ok(self.store.purge_idempotency_before(cutoff).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{Duration, Utc};
    use reservation_store::InMemoryReservationStore;

    fn guard(
        store: &InMemoryReservationStore,
        clock: &ManualClock,
    ) -> IdempotencyGuard<InMemoryReservationStore, ManualClock> {
        IdempotencyGuard::new(store.clone(), clock.clone(), Duration::days(7))
    }

    #[tokio::test]
    async fn first_sighting_proceeds_then_replays() {
        let store = InMemoryReservationStore::new();
        let clock = ManualClock::new(Utc::now());
        let guard = guard(&store, &clock);

        assert_eq!(
            guard.begin("checkout", "key-1").await.unwrap(),
            IdempotencyOutcome::Proceed
        );

        guard
            .complete("checkout", "key-1", &serde_json::json!({"order": 1}))
            .await
            .unwrap();

        match guard.begin("checkout", "key-1").await.unwrap() {
            IdempotencyOutcome::Replay(v) => assert_eq!(v, serde_json::json!({"order": 1})),
            other => panic!("expected Replay, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_duplicate_conflicts() {
        let store = InMemoryReservationStore::new();
        let clock = ManualClock::new(Utc::now());
        let guard = guard(&store, &clock);

        guard.begin("checkout", "key-1").await.unwrap();
        assert_eq!(
            guard.begin("checkout", "key-1").await.unwrap(),
            IdempotencyOutcome::Conflict
        );
    }

    #[tokio::test]
    async fn abandoned_key_can_be_retried() {
        let store = InMemoryReservationStore::new();
        let clock = ManualClock::new(Utc::now());
        let guard = guard(&store, &clock);

        guard.begin("checkout", "key-1").await.unwrap();
        guard.abandon("checkout", "key-1").await.unwrap();
        assert_eq!(
            guard.begin("checkout", "key-1").await.unwrap(),
            IdempotencyOutcome::Proceed
        );
    }

    #[tokio::test]
    async fn keys_are_scoped_per_route() {
        let store = InMemoryReservationStore::new();
        let clock = ManualClock::new(Utc::now());
        let guard = guard(&store, &clock);

        guard.begin("checkout", "key-1").await.unwrap();
        assert_eq!(
            guard.begin("confirm", "key-1").await.unwrap(),
            IdempotencyOutcome::Proceed
        );
    }

    #[tokio::test]
    async fn purge_respects_retention_window() {
        let store = InMemoryReservationStore::new();
        let clock = ManualClock::new(Utc::now());
        let guard = guard(&store, &clock);

        guard.begin("checkout", "old").await.unwrap();
        guard
            .complete("checkout", "old", &serde_json::Value::Null)
            .await
            .unwrap();

        clock.advance(Duration::days(8));
        guard.begin("checkout", "fresh").await.unwrap();

        assert_eq!(guard.purge_expired().await.unwrap(), 1);
        assert_eq!(
            guard.begin("checkout", "old").await.unwrap(),
            IdempotencyOutcome::Proceed
        );
    }
}
