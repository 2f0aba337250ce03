//! Explicit two-phase coordination across queue scopes and other resources.
//!
//! An [`AmbientTransaction`] is passed by the caller to every resource that
//! should commit atomically with it. Queue scopes enlist through
//! [`QueueManager::begin_scope_in`](crate::QueueManager::begin_scope_in);
//! anything else implements [`TransactionParticipant`].

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use quay_core::{Error, Result, TransactionId};

/// A resource taking part in two-phase commit.
#[async_trait]
pub trait TransactionParticipant: Send + Sync {
    /// Label used in logs.
    fn name(&self) -> String;

    /// Vote on the outcome. An error vetoes the transaction.
    async fn prepare(&self) -> Result<()>;

    /// Make the prepared work permanent.
    async fn commit(&self) -> Result<()>;

    /// Discard the work. Called after a veto or an explicit rollback.
    async fn rollback(&self) -> Result<()>;
}

/// Coordinator for one external transaction.
///
/// Dropping it without [`commit`](Self::commit) or [`rollback`](Self::rollback)
/// releases every participant; queue scopes roll back when released.
pub struct AmbientTransaction {
    id: TransactionId,
    participants: Mutex<Vec<Arc<dyn TransactionParticipant>>>,
}

impl Default for AmbientTransaction {
    fn default() -> Self {
        Self::new()
    }
}

impl AmbientTransaction {
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: TransactionId::new(),
            participants: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub const fn id(&self) -> TransactionId {
        self.id
    }

    /// Add a participant.
    ///
    /// # Errors
    ///
    /// Returns `TransactionAborted` if the participant list is poisoned.
    pub fn enlist(&self, participant: Arc<dyn TransactionParticipant>) -> Result<()> {
        let mut participants = self
            .participants
            .lock()
            .map_err(|_| Error::transaction_aborted("participant list poisoned"))?;
        tracing::debug!(transaction_id = %self.id, participant = %participant.name(), "Participant enlisted");
        participants.push(participant);
        Ok(())
    }

    #[must_use]
    pub fn participant_count(&self) -> usize {
        self.participants.lock().map_or(0, |p| p.len())
    }

    fn take_participants(&self) -> Vec<Arc<dyn TransactionParticipant>> {
        self.participants
            .lock()
            .map(|mut p| std::mem::take(&mut *p))
            .unwrap_or_default()
    }

    /// Prepare every participant, then commit them all.
    ///
    /// # Errors
    ///
    /// Returns `TransactionAborted` if any participant vetoes; every
    /// participant is rolled back first. A failure in the commit phase is
    /// returned after the remaining participants have been committed.
    pub async fn commit(self) -> Result<()> {
        let participants = self.take_participants();

        for participant in &participants {
            if let Err(vote) = participant.prepare().await {
                tracing::warn!(
                    transaction_id = %self.id,
                    participant = %participant.name(),
                    error = %vote,
                    "Participant vetoed, rolling back"
                );
                rollback_all(self.id, &participants).await;
                return Err(Error::transaction_aborted(format!(
                    "{} vetoed: {vote}",
                    participant.name()
                )));
            }
        }

        let mut first_failure = None;
        for participant in &participants {
            if let Err(e) = participant.commit().await {
                tracing::error!(
                    transaction_id = %self.id,
                    participant = %participant.name(),
                    error = %e,
                    "Participant failed to commit after prepare"
                );
                first_failure.get_or_insert(e);
            }
        }

        tracing::debug!(transaction_id = %self.id, participants = participants.len(), "Ambient transaction committed");
        first_failure.map_or(Ok(()), Err)
    }

    /// Roll back every participant.
    ///
    /// # Errors
    ///
    /// Never fails; rollback errors are logged.
    pub async fn rollback(self) -> Result<()> {
        let participants = self.take_participants();
        rollback_all(self.id, &participants).await;
        Ok(())
    }
}

impl Drop for AmbientTransaction {
    fn drop(&mut self) {
        let released = self.take_participants().len();
        if released > 0 {
            tracing::debug!(transaction_id = %self.id, released, "Ambient transaction dropped unresolved");
        }
    }
}

async fn rollback_all(id: TransactionId, participants: &[Arc<dyn TransactionParticipant>]) {
    for participant in participants {
        if let Err(e) = participant.rollback().await {
            tracing::warn!(
                transaction_id = %id,
                participant = %participant.name(),
                error = %e,
                "Participant rollback failed"
            );
        }
    }
}
