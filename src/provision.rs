//! Find-or-create provisioning of agent tokens, entities and alarms
//!
//! Every operation lists the collection first and only creates when no
//! object with the requested natural key exists, so repeated calls never
//! produce duplicates. Failures are not retried.

use crate::error::{ProvisionError, Result};
use crate::monitoring::{
    AgentToken, Alarm, Credentials, Entity, MonitoringClient, NewAgentToken, NewAlarm, NewEntity,
};

fn require_credentials(credentials: Option<&Credentials>) -> Result<&Credentials> {
    credentials.ok_or_else(|| ProvisionError::InvalidCredentials("nil credentials".to_string()))
}

/// Find the agent token labelled `label`, creating it if absent
pub async fn get_or_create_token(credentials: Option<&Credentials>, label: &str) -> Result<AgentToken> {
    let credentials = require_credentials(credentials)?;
    let client = MonitoringClient::new(credentials.clone())?;
    find_or_create_token(&client, None, label).await
}

/// Find-or-create an agent token through an existing client.
///
/// With `existing_token` set the lookup first matches the token value, then
/// falls back to the label, so a stale value never duplicates a labelled token.
pub async fn find_or_create_token(
    client: &MonitoringClient,
    existing_token: Option<&str>,
    label: &str,
) -> Result<AgentToken> {
    let tokens = client.agent_tokens();

    let by_secret = match existing_token {
        Some(secret) => tokens.find(|t| t.secret() == secret).await?.next(),
        None => None,
    };
    let found = match by_secret {
        Some(token) => Some(token),
        None => tokens.find_by_label(label).await?,
    };

    if let Some(token) = found {
        tracing::debug!("Found agent token {:?}", token.label);
        return Ok(token);
    }

    tracing::info!("No agent token for {:?}, creating one", label);
    tokens
        .create(NewAgentToken {
            label: label.to_string(),
        })
        .save()
        .await
}

/// Find the entity labelled `label`, creating it if absent
pub async fn get_or_create_entity(credentials: Option<&Credentials>, label: &str) -> Result<Entity> {
    let credentials = require_credentials(credentials)?;
    let client = MonitoringClient::new(credentials.clone())?;
    find_or_create_entity(&client, label).await
}

/// Find-or-create an entity through an existing client
pub async fn find_or_create_entity(client: &MonitoringClient, label: &str) -> Result<Entity> {
    let entities = client.entities();

    if let Some(entity) = entities.find_by_label(label).await? {
        tracing::debug!("Found entity {:?} ({})", entity.label, entity.id);
        return Ok(entity);
    }

    tracing::info!("No entity for {:?}, creating one", label);
    entities
        .create(NewEntity {
            label: label.to_string(),
            ..Default::default()
        })
        .save()
        .await
}

/// Find the alarm labelled `label` under `entity`, creating it if absent.
///
/// The check and notification plan ids are passed through unvalidated.
pub async fn get_or_create_alarm(
    client: &MonitoringClient,
    entity: &Entity,
    label: &str,
    check_id: &str,
    notification_plan_id: &str,
) -> Result<Alarm> {
    let alarms = client.alarms(entity);

    if let Some(alarm) = alarms.find_by_label(label).await? {
        tracing::debug!("Found alarm {:?} on {}", alarm.label, entity.id);
        return Ok(alarm);
    }

    tracing::info!("No alarm {:?} on {}, creating one", label, entity.id);
    alarms
        .create(NewAlarm {
            label: label.to_string(),
            check_id: check_id.to_string(),
            notification_plan_id: notification_plan_id.to_string(),
        })
        .save()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::MockFixture;
    use serde_json::json;

    fn mock_client(fixture: &MockFixture) -> MonitoringClient {
        MonitoringClient::with_fixture(Credentials::mock("Mr. Mockson"), fixture.clone())
    }

    #[tokio::test]
    async fn test_nil_credentials_rejected_before_any_call() {
        let err = get_or_create_token(None, "node1").await.unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidCredentials(_)));

        let err = get_or_create_entity(None, "node1").await.unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidCredentials(_)));
    }

    #[tokio::test]
    async fn test_token_found_by_existing_secret() {
        let fixture = MockFixture::new().with_object(
            "agent_tokens",
            json!({"id": "secret-1", "label": "old-name", "token": "secret-1"}),
        );
        let client = mock_client(&fixture);

        let token = find_or_create_token(&client, Some("secret-1"), "node1").await.unwrap();
        assert_eq!(token.label, "old-name");
        assert_eq!(fixture.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_secret_creates_under_label() {
        let fixture = MockFixture::new();
        let client = mock_client(&fixture);

        let token = find_or_create_token(&client, Some("gone"), "node1").await.unwrap();
        assert_eq!(token.label, "node1");
        assert_eq!(fixture.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_stale_secret_falls_back_to_label() {
        let fixture = MockFixture::new().with_object(
            "agent_tokens",
            json!({"id": "real", "label": "node1", "token": "real"}),
        );
        let client = mock_client(&fixture);

        let token = find_or_create_token(&client, Some("stale"), "node1").await.unwrap();
        assert_eq!(token.secret(), "real");
        assert_eq!(fixture.create_calls(), 0);
        assert_eq!(fixture.objects("agent_tokens").len(), 1);
    }

    #[tokio::test]
    async fn test_unlabelled_tokens_do_not_break_lookup() {
        let fixture = MockFixture::new()
            .with_object("agent_tokens", json!({"id": "x", "label": null, "token": "x"}));
        let client = mock_client(&fixture);

        let token = find_or_create_token(&client, None, "node1").await.unwrap();
        assert_eq!(token.label, "node1");
        assert_eq!(fixture.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_alarm_is_created_once_per_entity() {
        let fixture = MockFixture::new();
        let client = mock_client(&fixture);

        let entity = find_or_create_entity(&client, "Testing Entity").await.unwrap();
        let first = get_or_create_alarm(&client, &entity, "Testing Alarm", "Test Check", "Test Notification Plan")
            .await
            .unwrap();
        let second = get_or_create_alarm(&client, &entity, "Testing Alarm", "Test Check", "Test Notification Plan")
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.entity_id, entity.id);
        assert_eq!(first.check_id, "Test Check");
        assert_eq!(fixture.create_calls(), 2);
    }

    #[tokio::test]
    async fn test_alarm_under_missing_entity_is_remote_error() {
        let client = mock_client(&MockFixture::new());
        let ghost = Entity {
            id: "enGhost".to_string(),
            label: "ghost".to_string(),
            ip_addresses: Default::default(),
            metadata: Default::default(),
        };

        let err = get_or_create_alarm(&client, &ghost, "a", "c", "n").await.unwrap_err();
        assert_eq!(err.status(), Some(404));
    }
}
