/// Audit events for rule creation, deletion and NAT toggles
///
/// The rules manager reports through [`EventSink`], which is fire-and-forget:
/// a sink that fails to record an event logs a warning and the operation
/// goes on. [`AuditLog`] writes JSON lines to disk, [`MemorySink`] keeps
/// events in memory.
use crate::config::RulesConfig;
use crate::core::rule::{AddressId, Rule, VmId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;

/// Types of auditable events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RuleCreated,
    RuleDeleted,
    NatEnabled,
    NatDisabled,
    ApplyRules,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Type of event
    pub event_type: EventType,

    /// Whether the operation succeeded
    pub success: bool,

    /// Additional structured data about the event
    pub details: serde_json::Value,

    /// Error message if operation failed
    pub error: Option<String>,
}

impl AuditEvent {
    /// Creates a new audit event
    pub fn new(
        event_type: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            event_type,
            success,
            details,
            error,
        }
    }

    fn rule_details(rule: &Rule) -> serde_json::Value {
        serde_json::json!({
            "rule_id": rule.id,
            "address": rule.source_address,
            "ports": rule.source_ports.to_string(),
            "protocol": rule.protocol,
            "purpose": rule.purpose().as_ref(),
            "network": rule.network,
            "account": rule.account,
            "domain": rule.domain,
            "description": rule.to_string(),
        })
    }

    pub fn rule_created(rule: &Rule) -> Self {
        Self::new(EventType::RuleCreated, true, Self::rule_details(rule), None)
    }

    pub fn rule_deleted(rule: &Rule) -> Self {
        Self::new(EventType::RuleDeleted, true, Self::rule_details(rule), None)
    }

    pub fn nat_enabled(address: AddressId, vm: VmId) -> Self {
        Self::new(
            EventType::NatEnabled,
            true,
            serde_json::json!({ "address": address, "vm": vm }),
            None,
        )
    }

    pub fn nat_disabled(address: AddressId, success: bool) -> Self {
        let error = (!success).then(|| "revoked rules could not be pushed".to_string());
        Self::new(
            EventType::NatDisabled,
            success,
            serde_json::json!({ "address": address }),
            error,
        )
    }

    pub fn rules_applied(rule_count: usize, success: bool, error: Option<String>) -> Self {
        Self::new(
            EventType::ApplyRules,
            success,
            serde_json::json!({ "rule_count": rule_count }),
            error,
        )
    }
}

/// Receiver of rule events
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Records an event. Must not fail the calling operation.
    async fn record(&self, event: AuditEvent);
}

/// Audit log writer
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    /// Creates the audit log configured in `config`, or one in the XDG
    /// state directory when no path is set
    ///
    /// # Errors
    ///
    /// Returns `Err` if no path is configured and the state directory
    /// cannot be determined
    pub fn from_config(config: &RulesConfig) -> std::io::Result<Self> {
        let log_path = config.resolved_audit_log_path().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "State directory not found")
        })?;
        Ok(Self { log_path })
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: path.into(),
        }
    }

    /// Appends an event to the audit log
    ///
    /// Events are written as JSON-lines format (one JSON object per line)
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be opened or written
    pub async fn log(&self, event: &AuditEvent) -> std::io::Result<()> {
        let json = serde_json::to_string(event)?;
        crate::utils::ensure_parent(&self.log_path).await?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Reads the most recent events from the log, newest first
    ///
    /// Lines that fail to parse are skipped.
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be read
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = tokio::fs::read_to_string(&self.log_path).await?;

        let events: Vec<AuditEvent> = content
            .lines()
            .rev()
            .filter_map(|line| serde_json::from_str(line).ok())
            .take(count)
            .collect();

        Ok(events)
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }
}

#[async_trait]
impl EventSink for AuditLog {
    async fn record(&self, event: AuditEvent) {
        if let Err(e) = self.log(&event).await {
            tracing::warn!("Failed to write audit log: {}", e);
        }
    }
}

/// Keeps events in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded events, oldest first
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, event_type: EventType) -> usize {
        self.events()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn record(&self, event: AuditEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(_) => tracing::warn!("Dropping audit event: sink lock poisoned"),
        }
    }
}
