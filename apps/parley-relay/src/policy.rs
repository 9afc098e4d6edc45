//! Access policy: who may join a call, and as what.
//!
//! Pure read-through to the application directory; re-queried on every join
//! attempt because team membership can change between calls.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::directory::{ApplicationDirectory, DirectoryError};

/// Participant role, fixed at join time for the life of the membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Candidate,
    Employer,
    Team,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Candidate => "candidate",
            Role::Employer => "employer",
            Role::Team => "team",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "candidate" => Some(Role::Candidate),
            "employer" => Some(Role::Employer),
            "team" => Some(Role::Team),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("call not found")]
    NotFound,
    #[error("not a party to this call")]
    Forbidden,
    #[error("directory unavailable: {0}")]
    Upstream(String),
}

impl From<DirectoryError> for PolicyError {
    fn from(err: DirectoryError) -> Self {
        PolicyError::Upstream(err.to_string())
    }
}

pub struct AccessPolicy {
    directory: Arc<dyn ApplicationDirectory>,
}

impl AccessPolicy {
    pub fn new(directory: Arc<dyn ApplicationDirectory>) -> Self {
        Self { directory }
    }

    /// Decide whether `user_id` may join the call and with what role.
    pub async fn authorize(&self, call_id: &str, user_id: &str) -> Result<Role, PolicyError> {
        let aggregate = self
            .directory
            .lookup(call_id)
            .await?
            .ok_or(PolicyError::NotFound)?;

        if aggregate.candidate_id == user_id {
            Ok(Role::Candidate)
        } else if aggregate.employer_id == user_id {
            Ok(Role::Employer)
        } else if aggregate.team_ids.iter().any(|id| id == user_id) {
            Ok(Role::Team)
        } else {
            Err(PolicyError::Forbidden)
        }
    }

    /// Every identity that would be authorized for the call right now.
    /// Used by ring-broadcast.
    pub async fn authorized_identities(
        &self,
        call_id: &str,
    ) -> Result<Vec<String>, PolicyError> {
        let aggregate = self
            .directory
            .lookup(call_id)
            .await?
            .ok_or(PolicyError::NotFound)?;
        let mut identities = vec![aggregate.candidate_id, aggregate.employer_id];
        identities.extend(aggregate.team_ids);
        identities.dedup();
        Ok(identities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{ApplicationAggregate, StaticDirectory};

    fn policy() -> AccessPolicy {
        let directory = StaticDirectory::new().with_application(
            "app-1",
            ApplicationAggregate {
                candidate_id: "alice".into(),
                employer_id: "bob".into(),
                team_ids: vec!["carol".into(), "dave".into()],
            },
        );
        AccessPolicy::new(Arc::new(directory))
    }

    #[tokio::test]
    async fn roles_are_derived_from_the_aggregate() {
        let policy = policy();
        assert_eq!(
            policy.authorize("app-1", "alice").await.expect("ok"),
            Role::Candidate
        );
        assert_eq!(
            policy.authorize("app-1", "bob").await.expect("ok"),
            Role::Employer
        );
        assert_eq!(
            policy.authorize("app-1", "carol").await.expect("ok"),
            Role::Team
        );
    }

    #[tokio::test]
    async fn authorize_is_deterministic_on_repeat() {
        let policy = policy();
        for _ in 0..3 {
            assert_eq!(
                policy.authorize("app-1", "dave").await.expect("ok"),
                Role::Team
            );
        }
    }

    #[tokio::test]
    async fn outsiders_are_forbidden() {
        let policy = policy();
        assert!(matches!(
            policy.authorize("app-1", "mallory").await,
            Err(PolicyError::Forbidden)
        ));
    }

    #[tokio::test]
    async fn missing_aggregate_is_not_found() {
        let policy = policy();
        assert!(matches!(
            policy.authorize("app-404", "alice").await,
            Err(PolicyError::NotFound)
        ));
    }

    #[tokio::test]
    async fn ring_broadcast_targets_all_parties() {
        let policy = policy();
        let identities = policy.authorized_identities("app-1").await.expect("ok");
        assert_eq!(identities, vec!["alice", "bob", "carol", "dave"]);
    }
}
