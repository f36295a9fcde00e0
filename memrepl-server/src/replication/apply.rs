//! Application of live mutations on a slave
//!
//! A mutation whose precondition does not hold on the slave is reported as
//! [`ApplyOutcome::ConditionFailed`] and the session carries on. Only storage
//! failures and messages that are not live mutations are errors.

use super::message::Message;
use super::session::SessionPhase;
use super::storage::{
    AppendPrependOutcome, DeleteOutcome, IncrDecrOutcome, SetOutcome, StorageEngine,
};
use super::types::{ReplicationError, ReplicationResult};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionFailure {
    /// Add of a present key, or replace of an absent one
    NotStored,
    /// CAS mismatch
    Exists,
    NotFound,
    NotNumeric,
}

impl fmt::Display for ConditionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConditionFailure::NotStored => "not_stored",
            ConditionFailure::Exists => "exists",
            ConditionFailure::NotFound => "not_found",
            ConditionFailure::NotNumeric => "not_numeric",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    ConditionFailed(ConditionFailure),
}

impl ApplyOutcome {
    pub fn is_applied(self) -> bool {
        self == ApplyOutcome::Applied
    }
}

impl From<SetOutcome> for ApplyOutcome {
    fn from(outcome: SetOutcome) -> Self {
        match outcome {
            SetOutcome::Stored => ApplyOutcome::Applied,
            SetOutcome::NotStored => ApplyOutcome::ConditionFailed(ConditionFailure::NotStored),
            SetOutcome::Exists => ApplyOutcome::ConditionFailed(ConditionFailure::Exists),
            SetOutcome::NotFound => ApplyOutcome::ConditionFailed(ConditionFailure::NotFound),
        }
    }
}

impl From<IncrDecrOutcome> for ApplyOutcome {
    fn from(outcome: IncrDecrOutcome) -> Self {
        match outcome {
            IncrDecrOutcome::Applied(_) => ApplyOutcome::Applied,
            IncrDecrOutcome::NotFound => ApplyOutcome::ConditionFailed(ConditionFailure::NotFound),
            IncrDecrOutcome::NotNumeric => {
                ApplyOutcome::ConditionFailed(ConditionFailure::NotNumeric)
            }
        }
    }
}

impl From<AppendPrependOutcome> for ApplyOutcome {
    fn from(outcome: AppendPrependOutcome) -> Self {
        match outcome {
            AppendPrependOutcome::Applied => ApplyOutcome::Applied,
            AppendPrependOutcome::NotFound => {
                ApplyOutcome::ConditionFailed(ConditionFailure::NotFound)
            }
        }
    }
}

impl From<DeleteOutcome> for ApplyOutcome {
    fn from(outcome: DeleteOutcome) -> Self {
        match outcome {
            DeleteOutcome::Deleted => ApplyOutcome::Applied,
            DeleteOutcome::NotFound => ApplyOutcome::ConditionFailed(ConditionFailure::NotFound),
        }
    }
}

/// Apply one live message to `storage`
///
/// Time barriers carry no data and always count as applied.
pub async fn apply_live<S: StorageEngine>(
    storage: &S,
    msg: &Message,
) -> ReplicationResult<ApplyOutcome> {
    let outcome = match msg {
        Message::GetCas(op) => match storage.get_cas(op).await? {
            Some(_) => ApplyOutcome::Applied,
            None => ApplyOutcome::ConditionFailed(ConditionFailure::NotFound),
        },
        Message::Sarc(op) => storage.conditional_set(op).await?.into(),
        Message::Incr(op) => storage.incr(op).await?.into(),
        Message::Decr(op) => storage.decr(op).await?.into(),
        Message::Append(op) => storage.append(op).await?.into(),
        Message::Prepend(op) => storage.prepend(op).await?.into(),
        Message::Delete(op) => storage.delete(op).await?.into(),
        Message::TimeBarrier { .. } => ApplyOutcome::Applied,
        other => {
            return Err(ReplicationError::UnexpectedMessage {
                kind: other.kind(),
                phase: SessionPhase::Streaming,
            });
        }
    };
    Ok(outcome)
}
