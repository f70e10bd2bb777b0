//! In-memory registry backend.

use std::{
    collections::{BTreeSet, HashMap},
    sync::atomic::{AtomicI64, Ordering},
};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use super::core::{
    HealthStatus, NewServer, RegistryError, RegistryResult, RegistryStats, RegistryStorage,
    ServerFilter, ServerId, ServerRecord, ServerUpdate, make_registration_id,
    sort_by_least_recent_success, sort_by_newest,
};

#[derive(Default)]
struct InnerStore {
    servers: HashMap<ServerId, ServerRecord>,
    by_registration_id: HashMap<String, ServerId>,
}

/// Process-local registry. Locks are never held across an await point.
pub struct MemoryRegistryStorage {
    inner: RwLock<InnerStore>,
    next_id: AtomicI64,
}

impl Default for MemoryRegistryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistryStorage {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(InnerStore::default()),
            next_id: AtomicI64::new(1),
        }
    }

    /// Number of records ever created, inactive included.
    pub fn len(&self) -> usize {
        self.inner.read().servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RegistryStorage for MemoryRegistryStorage {
    async fn create_server(&self, input: NewServer) -> RegistryResult<ServerRecord> {
        let mut store = self.inner.write();

        let mut registration_id = make_registration_id();
        while store.by_registration_id.contains_key(&registration_id) {
            registration_id = make_registration_id();
        }

        let id = ServerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let record = ServerRecord::new(id, registration_id.clone(), input);

        store.by_registration_id.insert(registration_id, id);
        store.servers.insert(id, record.clone());
        Ok(record)
    }

    async fn get_server(&self, id: ServerId) -> RegistryResult<Option<ServerRecord>> {
        let store = self.inner.read();
        Ok(store.servers.get(&id).filter(|s| s.is_active).cloned())
    }

    async fn get_by_registration_id(
        &self,
        registration_id: &str,
    ) -> RegistryResult<Option<ServerRecord>> {
        let store = self.inner.read();
        Ok(store
            .by_registration_id
            .get(registration_id)
            .and_then(|id| store.servers.get(id))
            .cloned())
    }

    async fn list_servers(&self, filter: &ServerFilter) -> RegistryResult<Vec<ServerRecord>> {
        let mut servers: Vec<ServerRecord> = {
            let store = self.inner.read();
            store
                .servers
                .values()
                .filter(|s| filter.matches(s))
                .cloned()
                .collect()
        };
        sort_by_newest(&mut servers);
        Ok(servers)
    }

    async fn list_healthy_servers(&self, model_name: &str) -> RegistryResult<Vec<ServerRecord>> {
        let mut servers: Vec<ServerRecord> = {
            let store = self.inner.read();
            store
                .servers
                .values()
                .filter(|s| s.is_routable() && s.model_name == model_name)
                .cloned()
                .collect()
        };
        sort_by_least_recent_success(&mut servers);
        Ok(servers)
    }

    async fn list_models(&self) -> RegistryResult<Vec<String>> {
        let store = self.inner.read();
        let models: BTreeSet<&str> = store
            .servers
            .values()
            .filter(|s| s.is_routable())
            .map(|s| s.model_name.as_str())
            .collect();
        Ok(models.into_iter().map(str::to_string).collect())
    }

    async fn update_server(
        &self,
        registration_id: &str,
        update: ServerUpdate,
    ) -> RegistryResult<Option<ServerRecord>> {
        let mut store = self.inner.write();
        let Some(id) = store.by_registration_id.get(registration_id).copied() else {
            return Ok(None);
        };
        match store.servers.get_mut(&id) {
            Some(record) if record.is_active => {
                record.apply_update(&update, Utc::now());
                Ok(Some(record.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn record_health_result(
        &self,
        id: ServerId,
        is_healthy: bool,
        error_message: Option<&str>,
    ) -> RegistryResult<ServerRecord> {
        let mut store = self.inner.write();
        let record = store
            .servers
            .get_mut(&id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        record.apply_health_result(is_healthy, error_message, Utc::now());
        Ok(record.clone())
    }

    async fn record_request_success(&self, id: ServerId) -> RegistryResult<()> {
        let mut store = self.inner.write();
        let record = store
            .servers
            .get_mut(&id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        record.apply_request_success(Utc::now());
        Ok(())
    }

    async fn deregister_server(&self, registration_id: &str) -> RegistryResult<bool> {
        let mut store = self.inner.write();
        let Some(id) = store.by_registration_id.get(registration_id).copied() else {
            return Ok(false);
        };
        match store.servers.get_mut(&id) {
            Some(record) if record.is_active => {
                record.is_active = false;
                record.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn stats(&self) -> RegistryResult<RegistryStats> {
        let store = self.inner.read();
        let mut stats = RegistryStats::default();
        let mut models = BTreeSet::new();
        for record in store.servers.values().filter(|s| s.is_active) {
            stats.total_servers += 1;
            models.insert(record.model_name.as_str());
            match record.health_status {
                HealthStatus::Healthy => stats.healthy += 1,
                HealthStatus::Unhealthy => stats.unhealthy += 1,
                HealthStatus::Unknown => stats.unknown += 1,
            }
        }
        stats.total_models = models.len();
        Ok(stats)
    }
}
