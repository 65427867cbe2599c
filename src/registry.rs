//! Application registry
//!
//! Keeps one [`ApplicationRecord`] per tenant name. The registry is a plain
//! keyed store: it performs no remote calls and enforces no state machine,
//! which is the orchestration service's job.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// Lifecycle state of a tenant application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppStatus {
    /// Function exists but has not been activated
    Deployed,
    /// Function exists and receives proxied traffic
    Active,
    /// Function exists but is not eligible for proxying
    Inactive,
    /// Function was removed; the record is kept
    Removed,
    /// The provider reported an unrecoverable condition
    Error,
}

impl AppStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppStatus::Deployed => "DEPLOYED",
            AppStatus::Active => "ACTIVE",
            AppStatus::Inactive => "INACTIVE",
            AppStatus::Removed => "REMOVED",
            AppStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEPLOYED" => Ok(AppStatus::Deployed),
            "ACTIVE" => Ok(AppStatus::Active),
            "INACTIVE" => Ok(AppStatus::Inactive),
            "REMOVED" => Ok(AppStatus::Removed),
            "ERROR" => Ok(AppStatus::Error),
            other => anyhow::bail!("Unknown application status: {}", other),
        }
    }
}

/// Registry entry for one tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationRecord {
    pub id: Uuid,
    pub name: String,
    pub status: AppStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApplicationRecord {
    /// A brand-new record with a fresh id and both timestamps set to `now`
    pub fn new(name: impl Into<String>, status: AppStatus, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            status,
            created_at: now,
            updated_at: now,
        }
    }

    /// Copy of this record moved to `status`.
    ///
    /// `updated_at` always advances, even when `now` does not move past the
    /// previous value (coarse clocks, back-to-back transitions).
    pub fn transition(&self, status: AppStatus, now: DateTime<Utc>) -> Self {
        let updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + chrono::Duration::microseconds(1)
        };
        Self {
            status,
            updated_at,
            ..self.clone()
        }
    }
}

/// Storage contract for application records.
///
/// Implementations must tolerate concurrent calls for different names.
/// Concurrent writes to the same name resolve as last-writer-wins.
pub trait AppRegistry: Send + Sync {
    /// Insert or replace the record stored under `record.name`
    fn upsert(&self, record: ApplicationRecord) -> anyhow::Result<ApplicationRecord>;

    fn find_by_name(&self, name: &str) -> anyhow::Result<Option<ApplicationRecord>>;

    /// All records, ordered by name
    fn find_all(&self) -> anyhow::Result<Vec<ApplicationRecord>>;

    /// Physically delete a record. Only used by cleanup paths; the normal
    /// lifecycle keeps removed records around.
    fn delete_by_name(&self, name: &str) -> anyhow::Result<bool>;
}

/// Shared handle to a registry implementation
pub type SharedRegistry = Arc<dyn AppRegistry>;

/// In-memory registry backed by a concurrent map
#[derive(Default)]
pub struct MemoryRegistry {
    records: DashMap<String, ApplicationRecord>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AppRegistry for MemoryRegistry {
    fn upsert(&self, record: ApplicationRecord) -> anyhow::Result<ApplicationRecord> {
        self.records.insert(record.name.clone(), record.clone());
        Ok(record)
    }

    fn find_by_name(&self, name: &str) -> anyhow::Result<Option<ApplicationRecord>> {
        Ok(self.records.get(name).map(|r| r.value().clone()))
    }

    fn find_all(&self) -> anyhow::Result<Vec<ApplicationRecord>> {
        let mut records: Vec<ApplicationRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    fn delete_by_name(&self, name: &str) -> anyhow::Result<bool> {
        Ok(self.records.remove(name).is_some())
    }
}
