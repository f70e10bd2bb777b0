//! Registry record types and the storage trait every backend implements.

use std::{fmt, str::FromStr};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Identifiers
// ============================================================================

/// Internal record identifier. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(pub i64);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ServerId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

pub const REGISTRATION_ID_PREFIX: &str = "srv_";

/// `srv_` followed by 16 lowercase hex characters.
pub fn make_registration_id() -> String {
    let bytes: [u8; 8] = rand::random();
    let mut id = String::with_capacity(REGISTRATION_ID_PREFIX.len() + 16);
    id.push_str(REGISTRATION_ID_PREFIX);
    for byte in bytes {
        id.push_str(&format!("{byte:02x}"));
    }
    id
}

// ============================================================================
// Server record
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HealthStatus {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "healthy" => Ok(HealthStatus::Healthy),
            "unhealthy" => Ok(HealthStatus::Unhealthy),
            "unknown" => Ok(HealthStatus::Unknown),
            other => Err(RegistryError::Storage(format!(
                "unrecognized health status '{other}'"
            ))),
        }
    }
}

/// One registered inference backend.
#[derive(Clone, Serialize)]
pub struct ServerRecord {
    pub id: ServerId,
    pub registration_id: String,
    pub model_name: String,
    pub endpoint_url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub health_status: HealthStatus,
    pub consecutive_failures: u32,
    pub is_active: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_successful_request_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub owner_name: Option<String>,
    pub owner_email: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Debug for ServerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerRecord")
            .field("id", &self.id)
            .field("registration_id", &self.registration_id)
            .field("model_name", &self.model_name)
            .field("endpoint_url", &self.endpoint_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("health_status", &self.health_status)
            .field("consecutive_failures", &self.consecutive_failures)
            .field("is_active", &self.is_active)
            .field("last_checked_at", &self.last_checked_at)
            .field(
                "last_successful_request_at",
                &self.last_successful_request_at,
            )
            .finish_non_exhaustive()
    }
}

impl ServerRecord {
    /// Fresh record as written at registration time.
    pub fn new(id: ServerId, registration_id: String, input: NewServer) -> Self {
        let now = Utc::now();
        Self {
            id,
            registration_id,
            model_name: input.model_name,
            endpoint_url: input.endpoint_url,
            api_key: input.api_key.filter(|k| !k.is_empty()),
            health_status: HealthStatus::Unknown,
            consecutive_failures: 0,
            is_active: true,
            last_checked_at: None,
            last_successful_request_at: None,
            last_error: None,
            owner_name: input.owner_name,
            owner_email: input.owner_email,
            description: input.description,
            tags: input.tags,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_routable(&self) -> bool {
        self.is_active && self.health_status == HealthStatus::Healthy
    }

    /// Applies a probe or forwarding outcome.
    pub fn apply_health_result(
        &mut self,
        is_healthy: bool,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) {
        if is_healthy {
            self.health_status = HealthStatus::Healthy;
            self.consecutive_failures = 0;
            self.last_successful_request_at = Some(now);
            self.last_error = None;
        } else {
            self.health_status = HealthStatus::Unhealthy;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            self.last_error = error_message.map(str::to_string);
        }
        self.last_checked_at = Some(now);
        self.updated_at = now;
    }

    /// Successful forwarded request. Health status is left to the prober.
    pub fn apply_request_success(&mut self, now: DateTime<Utc>) {
        self.last_successful_request_at = Some(now);
        self.consecutive_failures = 0;
        self.updated_at = now;
    }

    /// Returns true when at least one field changed.
    pub fn apply_update(&mut self, update: &ServerUpdate, now: DateTime<Utc>) -> bool {
        if update.is_empty() {
            return false;
        }
        if let Some(model_name) = &update.model_name {
            self.model_name = model_name.clone();
        }
        if let Some(endpoint_url) = &update.endpoint_url {
            self.endpoint_url = endpoint_url.clone();
        }
        if let Some(api_key) = &update.api_key {
            self.api_key = (!api_key.is_empty()).then(|| api_key.clone());
        }
        if let Some(owner_name) = &update.owner_name {
            self.owner_name = Some(owner_name.clone());
        }
        if let Some(owner_email) = &update.owner_email {
            self.owner_email = Some(owner_email.clone());
        }
        if let Some(description) = &update.description {
            self.description = Some(description.clone());
        }
        if let Some(tags) = &update.tags {
            self.tags = tags.clone();
        }
        self.updated_at = now;
        true
    }
}

/// Input for creating a record. The endpoint must already be normalized.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewServer {
    pub model_name: String,
    pub endpoint_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub owner_name: Option<String>,
    #[serde(default)]
    pub owner_email: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Partial update. `api_key: Some("")` clears the stored key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerUpdate {
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub owner_name: Option<String>,
    #[serde(default)]
    pub owner_email: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

impl ServerUpdate {
    pub fn is_empty(&self) -> bool {
        self.model_name.is_none()
            && self.endpoint_url.is_none()
            && self.api_key.is_none()
            && self.owner_name.is_none()
            && self.owner_email.is_none()
            && self.description.is_none()
            && self.tags.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerFilter {
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub health_status: Option<HealthStatus>,
    #[serde(default)]
    pub include_inactive: bool,
}

impl ServerFilter {
    pub fn matches(&self, record: &ServerRecord) -> bool {
        if !self.include_inactive && !record.is_active {
            return false;
        }
        if let Some(model) = &self.model_name {
            if &record.model_name != model {
                return false;
            }
        }
        if let Some(status) = self.health_status {
            if record.health_status != status {
                return false;
            }
        }
        true
    }
}

/// Counts over active records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_servers: usize,
    pub total_models: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub unknown: usize,
}

// ============================================================================
// Ordering helpers shared by backends
// ============================================================================

/// Least-recently-successful first, never-successful before everything, ties by id.
pub fn sort_by_least_recent_success(servers: &mut [ServerRecord]) {
    servers.sort_by(|a, b| {
        a.last_successful_request_at
            .cmp(&b.last_successful_request_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Newest registration first.
pub fn sort_by_newest(servers: &mut [ServerRecord]) {
    servers.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
}

// ============================================================================
// Storage trait
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Server not found: {0}")]
    NotFound(String),

    #[error("Duplicate registration id: {0}")]
    Duplicate(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Durable table of server records.
///
/// Every call is a self-contained read or a short read-modify-write; callers
/// must not assume anything about state between two calls.
#[async_trait]
pub trait RegistryStorage: Send + Sync + 'static {
    /// Inserts an active record with unknown health and zero failures.
    async fn create_server(&self, input: NewServer) -> RegistryResult<ServerRecord>;

    /// Active records only.
    async fn get_server(&self, id: ServerId) -> RegistryResult<Option<ServerRecord>>;

    /// Active or not.
    async fn get_by_registration_id(
        &self,
        registration_id: &str,
    ) -> RegistryResult<Option<ServerRecord>>;

    /// Newest first.
    async fn list_servers(&self, filter: &ServerFilter) -> RegistryResult<Vec<ServerRecord>>;

    /// Active and healthy records for one model, least recently successful first.
    async fn list_healthy_servers(&self, model_name: &str) -> RegistryResult<Vec<ServerRecord>>;

    /// Distinct models with at least one routable server, sorted.
    async fn list_models(&self) -> RegistryResult<Vec<String>>;

    /// Applies a partial update to an active record. `None` when nothing matched.
    async fn update_server(
        &self,
        registration_id: &str,
        update: ServerUpdate,
    ) -> RegistryResult<Option<ServerRecord>>;

    /// Healthy resets failures to zero; unhealthy increments them. Last write wins.
    async fn record_health_result(
        &self,
        id: ServerId,
        is_healthy: bool,
        error_message: Option<&str>,
    ) -> RegistryResult<ServerRecord>;

    /// Stamps a successful forwarded request and clears the failure streak.
    async fn record_request_success(&self, id: ServerId) -> RegistryResult<()>;

    /// Soft delete. False when the record is unknown or already inactive.
    async fn deregister_server(&self, registration_id: &str) -> RegistryResult<bool>;

    async fn stats(&self) -> RegistryResult<RegistryStats>;

    /// All active records.
    async fn list_active_servers(&self) -> RegistryResult<Vec<ServerRecord>> {
        self.list_servers(&ServerFilter::default()).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn record(id: i64) -> ServerRecord {
        ServerRecord::new(
            ServerId(id),
            make_registration_id(),
            NewServer {
                model_name: "llama".to_string(),
                endpoint_url: format!("http://backend-{id}"),
                api_key: Some("secret-key".to_string()),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_registration_id_format() {
        let id = make_registration_id();
        assert!(id.starts_with("srv_"));
        assert_eq!(id.len(), 20);
        assert!(
            id[4..]
                .chars()
                .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        );
        assert_ne!(id, make_registration_id());
    }

    #[test]
    fn test_new_record_starts_unknown() {
        let r = record(1);
        assert_eq!(r.health_status, HealthStatus::Unknown);
        assert_eq!(r.consecutive_failures, 0);
        assert!(r.is_active);
        assert!(!r.is_routable());
        assert!(r.last_checked_at.is_none());
    }

    #[test]
    fn test_health_transitions() {
        let mut r = record(1);
        let now = Utc::now();

        r.apply_health_result(false, Some("HTTP 500: boom"), now);
        r.apply_health_result(false, Some("HTTP 500: boom"), now);
        assert_eq!(r.health_status, HealthStatus::Unhealthy);
        assert_eq!(r.consecutive_failures, 2);
        assert_eq!(r.last_error.as_deref(), Some("HTTP 500: boom"));
        assert!(r.last_successful_request_at.is_none());

        r.apply_health_result(true, None, now);
        assert_eq!(r.health_status, HealthStatus::Healthy);
        assert_eq!(r.consecutive_failures, 0);
        assert_eq!(r.last_successful_request_at, Some(now));
        assert!(r.last_error.is_none());
        assert!(r.is_routable());
    }

    #[test]
    fn test_request_success_keeps_status() {
        let mut r = record(1);
        let now = Utc::now();
        r.apply_health_result(false, None, now);
        r.apply_request_success(now);
        assert_eq!(r.health_status, HealthStatus::Unhealthy);
        assert_eq!(r.consecutive_failures, 0);
        assert_eq!(r.last_successful_request_at, Some(now));
    }

    #[test]
    fn test_update_clears_api_key_with_empty_string() {
        let mut r = record(1);
        let changed = r.apply_update(
            &ServerUpdate {
                api_key: Some(String::new()),
                description: Some("8xH100".to_string()),
                ..Default::default()
            },
            Utc::now(),
        );
        assert!(changed);
        assert!(r.api_key.is_none());
        assert_eq!(r.description.as_deref(), Some("8xH100"));

        assert!(!r.apply_update(&ServerUpdate::default(), Utc::now()));
    }

    #[test]
    fn test_api_key_never_serialized_or_debugged() {
        let r = record(1);
        let json = serde_json::to_value(&r).unwrap();
        assert!(json.get("api_key").is_none());
        assert_eq!(json["health_status"], "unknown");
        assert!(!format!("{r:?}").contains("secret-key"));
    }

    #[test]
    fn test_least_recent_success_order() {
        let now = Utc::now();
        let mut a = record(1);
        a.last_successful_request_at = Some(now);
        let mut b = record(2);
        b.last_successful_request_at = Some(now - Duration::seconds(30));
        let c = record(3);
        let d = record(4);

        let mut servers = vec![a, b, d, c];
        sort_by_least_recent_success(&mut servers);
        let ids: Vec<i64> = servers.iter().map(|s| s.id.0).collect();
        assert_eq!(ids, vec![3, 4, 2, 1]);
    }

    #[test]
    fn test_filter_matches() {
        let mut r = record(1);
        assert!(ServerFilter::default().matches(&r));

        let by_model = ServerFilter {
            model_name: Some("mistral".to_string()),
            ..Default::default()
        };
        assert!(!by_model.matches(&r));

        r.is_active = false;
        assert!(!ServerFilter::default().matches(&r));
        assert!(
            ServerFilter {
                include_inactive: true,
                ..Default::default()
            }
            .matches(&r)
        );
    }

    #[test]
    fn test_health_status_parse() {
        assert_eq!("Healthy".parse::<HealthStatus>().unwrap(), HealthStatus::Healthy);
        assert!("sick".parse::<HealthStatus>().is_err());
    }
}
