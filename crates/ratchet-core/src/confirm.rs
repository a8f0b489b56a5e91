//! Confirmation token issuance and validation.
//!
//! High-risk steps park the saga in `AWAITING_CONFIRMATION` behind a
//! single-use token with a 15-minute TTL, stored under both
//! `confirmation:{token}` and the reverse `confirmation:exec:{id}` key.
//! Resumption itself lives in the workflow machine; this service owns the
//! token lifecycle.

use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use uuid::Uuid;

use ratchet_store::ExecutionRepository;
use ratchet_store::models::{ConfirmationRecord, RiskAssessment, RiskLevel};

use crate::error::EngineError;

/// Token lifecycle service.
#[derive(Clone)]
pub struct ConfirmationService {
    repo: ExecutionRepository,
    ttl: Duration,
}

impl ConfirmationService {
    pub fn new(repo: ExecutionRepository, ttl: Duration) -> Self {
        Self { repo, ttl }
    }

    /// Issue a token for a step awaiting confirmation.
    pub async fn create(
        &self,
        execution_id: Uuid,
        step_id: &str,
        parameters: Map<String, Value>,
        risk: RiskAssessment,
        actor_id: Option<String>,
    ) -> Result<ConfirmationRecord, EngineError> {
        let now = Utc::now();
        let record = ConfirmationRecord {
            token: Uuid::new_v4(),
            execution_id,
            step_id: step_id.to_owned(),
            parameters,
            risk,
            actor_id,
            created_at: now,
            expires_at: now
                + chrono::Duration::from_std(self.ttl)
                    .unwrap_or_else(|_| chrono::Duration::seconds(900)),
        };
        self.repo.save_confirmation(&record, self.ttl).await?;
        tracing::info!(
            execution_id = %execution_id,
            step_id = %step_id,
            token = %record.token,
            risk_level = %record.risk.level,
            "confirmation token issued"
        );
        Ok(record)
    }

    /// Validate a token: it must exist, be within its TTL, and (when the
    /// issuing side recorded an actor) be presented by the same actor.
    /// Blocking-tier tokens additionally refuse anonymous confirms: a
    /// high-risk step only resumes for an identified approver.
    pub async fn validate(
        &self,
        token: Uuid,
        actor_id: Option<&str>,
    ) -> Result<ConfirmationRecord, EngineError> {
        let record = self
            .repo
            .load_confirmation(token)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("confirmation token {token}")))?;

        if record.expires_at < Utc::now() {
            // Defensive: the store TTL normally removes these first.
            self.repo
                .delete_confirmation(record.token, record.execution_id)
                .await?;
            return Err(EngineError::Expired(format!(
                "confirmation token {token} expired at {}",
                record.expires_at
            )));
        }

        if record.risk.level == RiskLevel::High && actor_id.is_none() {
            return Err(EngineError::Auth(format!(
                "confirmation token {token} requires an identified approver"
            )));
        }

        if let Some(expected) = &record.actor_id {
            match actor_id {
                Some(actual) if actual == expected => {}
                _ => {
                    return Err(EngineError::Auth(format!(
                        "confirmation token {token} was issued to a different actor"
                    )));
                }
            }
        }

        Ok(record)
    }

    /// Consume a token: both keys are deleted so a redelivered confirm is
    /// a NotFound. Returns [`EngineError::NotFound`] when another call got
    /// there first.
    pub async fn consume(&self, record: &ConfirmationRecord) -> Result<(), EngineError> {
        let existed = self
            .repo
            .delete_confirmation(record.token, record.execution_id)
            .await?;
        if !existed {
            return Err(EngineError::NotFound(format!(
                "confirmation token {} already consumed",
                record.token
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ratchet_store::MemoryStore;
    use ratchet_store::models::RiskLevel;

    use super::*;

    fn service(store: Arc<MemoryStore>) -> ConfirmationService {
        ConfirmationService::new(
            ExecutionRepository::new(store),
            Duration::from_secs(900),
        )
    }

    fn risk() -> RiskAssessment {
        RiskAssessment {
            level: RiskLevel::Medium,
            reason: "financial operation".to_string(),
            amount: Some(250.0),
            score: 0.3,
        }
    }

    #[tokio::test]
    async fn create_validate_consume_roundtrip() {
        let service = service(Arc::new(MemoryStore::new()));
        let execution_id = Uuid::new_v4();

        let record = service
            .create(execution_id, "s1", Map::new(), risk(), Some("user-1".into()))
            .await
            .unwrap();

        let validated = service
            .validate(record.token, Some("user-1"))
            .await
            .unwrap();
        assert_eq!(validated.step_id, "s1");

        service.consume(&validated).await.unwrap();

        // Single use: second validate is NotFound.
        let err = service.validate(record.token, Some("user-1")).await;
        assert!(matches!(err.unwrap_err(), EngineError::NotFound(_)));
        // And a second consume reports the same.
        let err = service.consume(&validated).await;
        assert!(matches!(err.unwrap_err(), EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn unknown_token_is_not_found() {
        let service = service(Arc::new(MemoryStore::new()));
        let err = service.validate(Uuid::new_v4(), None).await;
        assert!(matches!(err.unwrap_err(), EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn actor_mismatch_is_unauthorized() {
        let service = service(Arc::new(MemoryStore::new()));
        let record = service
            .create(
                Uuid::new_v4(),
                "s1",
                Map::new(),
                risk(),
                Some("user-1".into()),
            )
            .await
            .unwrap();

        let err = service.validate(record.token, Some("user-2")).await;
        assert!(matches!(err.unwrap_err(), EngineError::Auth(_)));
        let err = service.validate(record.token, None).await;
        assert!(matches!(err.unwrap_err(), EngineError::Auth(_)));
    }

    #[tokio::test]
    async fn blocking_tier_refuses_anonymous_confirms() {
        let service = service(Arc::new(MemoryStore::new()));
        let high = RiskAssessment {
            level: RiskLevel::High,
            reason: "financial operation, large amount".to_string(),
            amount: Some(5_000.0),
            score: 0.9,
        };
        let record = service
            .create(Uuid::new_v4(), "s1", Map::new(), high, None)
            .await
            .unwrap();

        let err = service.validate(record.token, None).await;
        assert!(matches!(err.unwrap_err(), EngineError::Auth(_)));

        // An identified approver gets through.
        service
            .validate(record.token, Some("ops-lead"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn anonymous_issue_accepts_any_actor() {
        let service = service(Arc::new(MemoryStore::new()));
        let record = service
            .create(Uuid::new_v4(), "s1", Map::new(), risk(), None)
            .await
            .unwrap();
        service.validate(record.token, Some("anyone")).await.unwrap();
    }

    #[tokio::test]
    async fn expired_token_is_gone() {
        let store = Arc::new(MemoryStore::new());
        let service = service(Arc::clone(&store));
        let record = service
            .create(Uuid::new_v4(), "s1", Map::new(), risk(), None)
            .await
            .unwrap();

        // Let the store TTL lapse.
        store.advance(Duration::from_secs(901));

        let err = service.validate(record.token, None).await;
        assert!(matches!(err.unwrap_err(), EngineError::NotFound(_)));
    }
}
