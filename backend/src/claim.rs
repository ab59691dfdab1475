use std::sync::Arc;

use draw_core::{NameKey, ParticipantName, Roster};
use tracing::{info, warn};

use crate::store::{
    run_transaction, ClaimRecord, OwnershipRecord, Record, RecordKey, RetryPolicy, StoreError,
    TransactionalStore, SERVER_TIMESTAMP,
};

#[derive(Debug, thiserror::Error)]
pub enum ClaimError {
    #[error("identity token required")]
    MissingIdentity,
    #[error("{0:?} is not on the roster")]
    InvalidName(String),
    #[error("this identity already picked another name")]
    IdentityAlreadyBound { bound_to: NameKey },
    #[error("{0:?} was already picked by someone else")]
    NameAlreadyClaimed(ParticipantName),
    #[error("claim kept conflicting after {attempts} attempts")]
    TransientConflict { attempts: u32 },
    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for ClaimError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::RetriesExhausted { attempts } => ClaimError::TransientConflict { attempts },
            other => ClaimError::Store(other),
        }
    }
}

/// Binds identity tokens to roster names, one name per identity and one
/// identity per name, permanently.
#[derive(Clone)]
pub struct ClaimCoordinator<S> {
    store: S,
    roster: Arc<Roster>,
    retry: RetryPolicy,
}

impl<S: TransactionalStore> ClaimCoordinator<S> {
    pub fn new(store: S, roster: Arc<Roster>, retry: RetryPolicy) -> Self {
        Self {
            store,
            roster,
            retry,
        }
    }

    /// Binds `identity` to `name`, or confirms the binding if it already
    /// exists. Both the claim and the ownership record are read and written
    /// in one transaction, so two identities racing for a name cannot both
    /// win.
    pub async fn claim_identity(
        &self,
        identity: &str,
        name: &str,
    ) -> Result<ParticipantName, ClaimError> {
        if identity.trim().is_empty() {
            return Err(ClaimError::MissingIdentity);
        }
        let key = self
            .roster
            .key_of(name)
            .ok_or_else(|| ClaimError::InvalidName(name.to_string()))?;

        let claim_key = RecordKey::Claim(identity.to_string());
        let owner_key = RecordKey::Ownership(key.clone());
        let outcome = run_transaction(&self.store, self.retry, |tx| {
            let claim = tx.get(&claim_key).and_then(Record::into_claim);
            let owner = tx.get(&owner_key).and_then(Record::into_ownership);

            if let Some(claim) = &claim {
                if claim.claimed_name_key != key {
                    return Err(ClaimError::IdentityAlreadyBound {
                        bound_to: claim.claimed_name_key.clone(),
                    });
                }
            }
            if let Some(owner) = &owner {
                if owner.owner_identity != identity {
                    return Err(ClaimError::NameAlreadyClaimed(name.to_string()));
                }
            }

            if claim.is_none() {
                tx.set(
                    claim_key.clone(),
                    Record::Claim(ClaimRecord {
                        claimed_name_key: key.clone(),
                        claimed_at: SERVER_TIMESTAMP,
                    }),
                )?;
            }
            if owner.is_none() {
                tx.set(
                    owner_key.clone(),
                    Record::Ownership(OwnershipRecord {
                        participant_name: name.to_string(),
                        owner_identity: identity.to_string(),
                        claimed_at: SERVER_TIMESTAMP,
                    }),
                )?;
            }
            Ok(claim.is_none() || owner.is_none())
        })
        .await;

        match outcome {
            Ok(true) => info!(%key, "identity bound to name"),
            Ok(false) => {}
            Err(ClaimError::IdentityAlreadyBound { ref bound_to }) => {
                warn!(requested = %key, %bound_to, "identity tried to switch names")
            }
            Err(ClaimError::NameAlreadyClaimed(_)) => warn!(%key, "name already claimed"),
            Err(ref err) => warn!(%key, %err, "claim failed"),
        }
        outcome.map(|_| name.to_string())
    }

    /// Name previously bound to `identity`, if any.
    pub async fn claimed_name(&self, identity: &str) -> Result<Option<ParticipantName>, ClaimError> {
        if identity.trim().is_empty() {
            return Err(ClaimError::MissingIdentity);
        }
        let claim = self
            .store
            .get(&RecordKey::Claim(identity.to_string()))
            .await?
            .and_then(Record::into_claim);
        Ok(claim.and_then(|c| {
            self.roster
                .name_for_key(&c.claimed_name_key)
                .map(str::to_owned)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{fast_retry, ContendedStore};
    use crate::store::MemoryStore;

    fn coordinator() -> (ClaimCoordinator<MemoryStore>, MemoryStore) {
        let store = MemoryStore::default();
        let claims = ClaimCoordinator::new(
            store.clone(),
            Arc::new(Roster::default()),
            RetryPolicy::default(),
        );
        (claims, store)
    }

    #[tokio::test]
    async fn repeat_claim_is_a_no_op() {
        let (claims, store) = coordinator();
        assert_eq!(claims.claim_identity("id-a", "Lucas").await.unwrap(), "Lucas");
        assert_eq!(store.len().await, 2);
        let claim_key = RecordKey::Claim("id-a".into());
        let version = store.version(&claim_key).await;

        assert_eq!(claims.claim_identity("id-a", "Lucas").await.unwrap(), "Lucas");
        assert_eq!(store.len().await, 2);
        assert_eq!(store.version(&claim_key).await, version);
    }

    #[tokio::test]
    async fn identity_cannot_switch_names() {
        let (claims, store) = coordinator();
        claims.claim_identity("id-a", "Lucas").await.unwrap();

        let err = claims.claim_identity("id-a", "Luana").await.unwrap_err();
        assert!(matches!(
            err,
            ClaimError::IdentityAlreadyBound { ref bound_to } if bound_to.as_str() == "lucas"
        ));
        assert_eq!(claims.claimed_name("id-a").await.unwrap().as_deref(), Some("Lucas"));
        assert!(store
            .get(&RecordKey::Ownership(NameKey::from_name("Luana")))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn name_belongs_to_first_claimant() {
        let (claims, store) = coordinator();
        claims.claim_identity("id-a", "Eva Maria").await.unwrap();

        let err = claims.claim_identity("id-b", "Eva Maria").await.unwrap_err();
        assert!(matches!(err, ClaimError::NameAlreadyClaimed(ref n) if n == "Eva Maria"));
        assert_eq!(claims.claimed_name("id-b").await.unwrap(), None);

        let owner = store
            .get(&RecordKey::Ownership(NameKey::from_name("Eva Maria")))
            .await
            .unwrap()
            .and_then(Record::into_ownership)
            .unwrap();
        assert_eq!(owner.owner_identity, "id-a");
        assert_eq!(owner.participant_name, "Eva Maria");
    }

    #[tokio::test]
    async fn rejects_bad_input_before_touching_store() {
        let (claims, store) = coordinator();
        assert!(matches!(
            claims.claim_identity("id-a", "Nobody").await,
            Err(ClaimError::InvalidName(_))
        ));
        assert!(matches!(
            claims.claim_identity("id-a", "").await,
            Err(ClaimError::InvalidName(_))
        ));
        assert!(matches!(
            claims.claim_identity("  ", "Lucas").await,
            Err(ClaimError::MissingIdentity)
        ));
        assert!(store.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_identities_get_exactly_one_winner() {
        let (claims, store) = coordinator();
        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let claims = claims.clone();
                tokio::spawn(async move {
                    let identity = format!("id-{i}");
                    let result = claims.claim_identity(&identity, "Gabriel").await;
                    (identity, result)
                })
            })
            .collect();

        let mut winners = Vec::new();
        for task in futures::future::join_all(tasks).await {
            let (identity, result) = task.unwrap();
            match result {
                Ok(name) => {
                    assert_eq!(name, "Gabriel");
                    winners.push(identity);
                }
                Err(err) => assert!(matches!(err, ClaimError::NameAlreadyClaimed(_)), "{err}"),
            }
        }

        assert_eq!(winners.len(), 1);
        let owner = store
            .get(&RecordKey::Ownership(NameKey::from_name("Gabriel")))
            .await
            .unwrap()
            .and_then(Record::into_ownership)
            .unwrap();
        assert_eq!(owner.owner_identity, winners[0]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn one_identity_racing_for_two_names_keeps_one() {
        let (claims, _store) = coordinator();
        let (first, second) = tokio::join!(
            claims.claim_identity("id-a", "Jonatas"),
            claims.claim_identity("id-a", "Danilo"),
        );

        let outcomes = [first, second];
        let bound: Vec<_> = outcomes.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(bound.len(), 1);
        assert!(outcomes
            .iter()
            .any(|r| matches!(r, Err(ClaimError::IdentityAlreadyBound { .. }))));
        assert_eq!(
            claims.claimed_name("id-a").await.unwrap().as_ref(),
            Some(bound[0])
        );
    }

    #[tokio::test]
    async fn exhausted_retries_surface_as_transient() {
        let claims = ClaimCoordinator::new(
            ContendedStore(MemoryStore::default()),
            Arc::new(Roster::default()),
            fast_retry(),
        );
        let err = claims.claim_identity("id-a", "Lucas").await.unwrap_err();
        assert!(matches!(err, ClaimError::TransientConflict { attempts: 3 }));
    }
}
