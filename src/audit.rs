//! Audit sink seam.
//!
//! The durable audit trail lives outside this subsystem; tracking
//! operations hand records to an injected [`AuditSink`]. Write failures
//! degrade observability, never correctness: every caller catches and logs
//! them instead of propagating into the request path.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit sink unavailable: {reason}")]
    Unavailable { reason: String },
}

/// One audit record: who did what to which target.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub action: String,
    pub actor_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_type: Option<String>,
    pub details: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(action: &str, actor_id: &str, details: serde_json::Value) -> Self {
        Self {
            action: action.to_string(),
            actor_id: actor_id.to_string(),
            target_id: None,
            target_type: None,
            details,
            ip: None,
            timestamp: Utc::now(),
        }
    }

    pub fn target(mut self, target_id: &str, target_type: &str) -> Self {
        self.target_id = Some(target_id.to_string());
        self.target_type = Some(target_type.to_string());
        self
    }

    pub fn ip(mut self, ip: &str) -> Self {
        self.ip = Some(ip.to_string());
        self
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> Result<(), AuditError>;
}

/// Default sink: emits structured audit events into the tracing pipeline,
/// where the host's log shipping picks them up.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, entry: AuditEntry) -> Result<(), AuditError> {
        info!(
            audit = true,
            action = %entry.action,
            actor_id = %entry.actor_id,
            target_id = entry.target_id.as_deref().unwrap_or(""),
            ip = entry.ip.as_deref().unwrap_or(""),
            details = %entry.details,
            "audit event"
        );
        Ok(())
    }
}

/// In-memory sink for tests and local development.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: RwLock<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.read().await.clone()
    }

    pub async fn entries_for_action(&self, action: &str) -> Vec<AuditEntry> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| e.action == action)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, entry: AuditEntry) -> Result<(), AuditError> {
        self.entries.write().await.push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_sink_records_and_filters() {
        let sink = MemoryAuditSink::new();
        sink.record(AuditEntry::new(
            "ip.block",
            "system",
            serde_json::json!({"ip": "10.0.0.1"}),
        ))
        .await
        .unwrap();
        sink.record(AuditEntry::new("sessions.terminate", "admin", serde_json::json!({})))
            .await
            .unwrap();

        assert_eq!(sink.entries().await.len(), 2);
        assert_eq!(sink.entries_for_action("ip.block").await.len(), 1);
    }

    #[test]
    fn test_entry_builder() {
        let entry = AuditEntry::new("ip.block", "system", serde_json::json!({}))
            .target("10.0.0.1", "ip")
            .ip("10.0.0.1");
        assert_eq!(entry.target_type.as_deref(), Some("ip"));
        assert_eq!(entry.ip.as_deref(), Some("10.0.0.1"));
    }
}
