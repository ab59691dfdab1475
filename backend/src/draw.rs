use std::sync::Arc;

use draw_core::{build_assignment, GenerationFailure, NameKey, ParticipantName, Roster};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{error, info};

use crate::store::{
    run_transaction, AssignmentRecord, DrawingMetadata, Record, RecordKey, RetryPolicy,
    StoreError, TransactionalStore, SERVER_TIMESTAMP,
};

#[derive(Debug, thiserror::Error)]
pub enum DrawFailure {
    #[error("{0:?} is not on the roster")]
    InvalidName(String),
    #[error("drawing is locked but has no record for {0:?}")]
    DrawRecordMissing(ParticipantName),
    #[error(transparent)]
    GenerationFailure(#[from] GenerationFailure),
    #[error("drawing kept conflicting after {attempts} attempts")]
    TransientConflict { attempts: u32 },
    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for DrawFailure {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::RetriesExhausted { attempts } => DrawFailure::TransientConflict { attempts },
            other => DrawFailure::Store(other),
        }
    }
}

enum Drawn {
    Existing(ParticipantName),
    Fresh(ParticipantName),
}

/// Materializes the drawing once for the whole roster and hands each name
/// its recipient.
#[derive(Clone)]
pub struct DrawCoordinator<S> {
    store: S,
    roster: Arc<Roster>,
    retry: RetryPolicy,
    seed: Option<u64>,
}

impl<S: TransactionalStore> DrawCoordinator<S> {
    pub fn new(store: S, roster: Arc<Roster>, retry: RetryPolicy, seed: Option<u64>) -> Self {
        Self {
            store,
            roster,
            retry,
            seed,
        }
    }

    /// Returns the recipient drawn for `name`, performing the drawing first
    /// if nobody has yet.
    ///
    /// The caller must already have bound `name` to the requesting identity.
    pub async fn ensure_drawing(&self, name: &str) -> Result<ParticipantName, DrawFailure> {
        let key = self
            .roster
            .key_of(name)
            .ok_or_else(|| DrawFailure::InvalidName(name.to_string()))?;
        let record_key = RecordKey::Assignment(key);

        if let Some(record) = self
            .store
            .get(&record_key)
            .await?
            .and_then(Record::into_assignment)
        {
            return Ok(record.assigned_to);
        }

        let outcome = run_transaction(&self.store, self.retry, |tx| {
            let locked = tx
                .get(&RecordKey::DrawMeta)
                .and_then(Record::into_draw_meta)
                .is_some_and(|meta| meta.locked);
            if locked {
                // Drawn by a transaction that committed after the point read.
                return match tx.get(&record_key).and_then(Record::into_assignment) {
                    Some(record) => Ok(Drawn::Existing(record.assigned_to)),
                    None => Err(DrawFailure::DrawRecordMissing(name.to_string())),
                };
            }

            let assignment = build_assignment(&self.roster, &mut self.rng())?;
            debug_assert!(assignment.is_valid_for(&self.roster));

            tx.set(
                RecordKey::DrawMeta,
                Record::DrawMeta(DrawingMetadata {
                    locked: true,
                    created_at: SERVER_TIMESTAMP,
                }),
            )?;
            for person in self.roster.names() {
                let recipient = assignment
                    .recipient_of(person)
                    .ok_or_else(|| DrawFailure::DrawRecordMissing(person.clone()))?;
                tx.set(
                    RecordKey::Assignment(NameKey::from_name(person)),
                    Record::Assignment(AssignmentRecord {
                        name: person.clone(),
                        assigned_to: recipient.to_string(),
                        drawn_at: SERVER_TIMESTAMP,
                    }),
                )?;
            }

            assignment
                .recipient_of(name)
                .map(|recipient| Drawn::Fresh(recipient.to_string()))
                .ok_or_else(|| DrawFailure::DrawRecordMissing(name.to_string()))
        })
        .await;

        match outcome {
            Ok(Drawn::Fresh(recipient)) => {
                info!(participants = self.roster.len(), "drawing materialized");
                Ok(recipient)
            }
            Ok(Drawn::Existing(recipient)) => Ok(recipient),
            Err(err) => {
                match &err {
                    DrawFailure::DrawRecordMissing(_) | DrawFailure::GenerationFailure(_) => {
                        error!(%err, "drawing unusable")
                    }
                    _ => error!(%err, "ensure drawing failed"),
                }
                Err(err)
            }
        }
    }

    fn rng(&self) -> ChaCha8Rng {
        self.seed
            .map(ChaCha8Rng::seed_from_u64)
            .unwrap_or_else(ChaCha8Rng::from_entropy)
    }
}
