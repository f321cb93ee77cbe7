use crate::database::postgres_repository::PostgresRepository;
use crate::error::app_error::AppError;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// One row of `security_audit_log`. Grouped so call sites stay readable.
#[derive(Debug, Default)]
pub struct SecurityAuditEvent<'a> {
    pub user_id: Option<&'a Uuid>,
    /// Login identity (email) when no user id is known.
    pub identity: Option<&'a str>,
    pub event_type: &'a str,
    pub success: bool,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub metadata: Option<JsonValue>,
}

impl<'a> SecurityAuditEvent<'a> {
    pub fn new(event_type: &'a str, success: bool) -> Self {
        Self {
            event_type,
            success,
            ..Self::default()
        }
    }

    pub fn user(mut self, user_id: &'a Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn identity(mut self, identity: &'a str) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn ip(mut self, ip_address: Option<String>) -> Self {
        self.ip_address = ip_address;
        self
    }

    pub fn user_agent(mut self, user_agent: Option<String>) -> Self {
        self.user_agent = user_agent;
        self
    }

    pub fn metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

impl PostgresRepository {
    /// Create a security audit log entry and log it to tracing
    pub async fn create_security_audit_log(&self, event: SecurityAuditEvent<'_>) -> Result<(), AppError> {
        log_audit_event(&event);

        sqlx::query(
            r#"
            INSERT INTO security_audit_log (user_id, identity, event_type, success, ip_address, user_agent, metadata)
            VALUES ($1, $2, $3, $4, $5::inet, $6, $7)
            "#,
        )
        .bind(event.user_id)
        .bind(event.identity)
        .bind(event.event_type)
        .bind(event.success)
        .bind(event.ip_address)
        .bind(event.user_agent)
        .bind(event.metadata)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Mirror an audit event to tracing for operational visibility.
pub(crate) fn log_audit_event(event: &SecurityAuditEvent<'_>) {
    let uid_str = event.user_id.map(|u| u.to_string());
    if event.success {
        tracing::info!(
            category = "audit",
            event_type = event.event_type,
            success = event.success,
            user_id = uid_str.as_deref().unwrap_or("-"),
            identity = event.identity.unwrap_or("-"),
            ip = event.ip_address.as_deref().unwrap_or("-"),
            user_agent = event.user_agent.as_deref().unwrap_or("-"),
            "security audit event"
        );
    } else {
        tracing::warn!(
            category = "audit",
            event_type = event.event_type,
            success = event.success,
            user_id = uid_str.as_deref().unwrap_or("-"),
            identity = event.identity.unwrap_or("-"),
            ip = event.ip_address.as_deref().unwrap_or("-"),
            user_agent = event.user_agent.as_deref().unwrap_or("-"),
            "security audit event (failure)"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::audit::audit_events;

    #[test]
    fn builder_fills_optional_fields() {
        let user_id = Uuid::new_v4();
        let event = SecurityAuditEvent::new(audit_events::LOGIN_FAILED, false)
            .user(&user_id)
            .identity("reader@example.com")
            .ip(Some("10.0.0.1".to_string()))
            .metadata(serde_json::json!({"remaining_attempts": 2}));

        assert_eq!(event.user_id, Some(&user_id));
        assert_eq!(event.identity, Some("reader@example.com"));
        assert_eq!(event.ip_address.as_deref(), Some("10.0.0.1"));
        assert!(event.user_agent.is_none());
        assert!(!event.success);
    }
}
