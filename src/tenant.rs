use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::{Notifier, NotifyHub};
use crate::reaper;

/// Per-operator engines. Each tenant gets its own Engine, WAL, reaper and
/// compactor; all of them share one notifier.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    config: EngineConfig,
    notifier: Arc<dyn Notifier>,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, config: EngineConfig, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            config,
            notifier,
        }
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Sanitize tenant name to prevent path traversal
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        // Two callers racing on a new tenant must end up with the same engine
        let entry = self.engines.entry(tenant.to_string());
        if let Entry::Occupied(existing) = &entry {
            return Ok(existing.get().clone());
        }

        std::fs::create_dir_all(&self.data_dir)?;
        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let notify = Arc::new(NotifyHub::new(self.notifier.clone()));
        let engine = Arc::new(Engine::new(wal_path, notify, self.config.clone())?);

        tokio::spawn(reaper::run_reaper(engine.clone()));
        tokio::spawn(reaper::run_compactor(engine.clone()));

        entry.or_insert(engine.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        tracing::info!("tenant {safe_name} loaded");
        Ok(engine)
    }

    pub fn tenant_count(&self) -> usize {
        self.engines.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::notify::MemoryNotifier;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("courtside_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: PathBuf) -> TenantManager {
        TenantManager::new(dir, EngineConfig::default(), Arc::new(MemoryNotifier::new()))
    }

    fn court(id: Ulid) -> Court {
        Court {
            id,
            facility_id: Ulid::new(),
            name: "Centre Court".into(),
            facility_name: "Parkside".into(),
        }
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let dir = test_data_dir("isolation");
        let tm = manager(dir);

        let eng_a = tm.get_or_create("tenant_a").unwrap();
        let eng_b = tm.get_or_create("tenant_b").unwrap();

        // Same court id in both tenants
        let cid = Ulid::new();
        eng_a.create_court(court(cid)).await.unwrap();
        eng_b.create_court(court(cid)).await.unwrap();

        // 2030-01-01T10:00Z
        let span = Span::new(1_893_492_000_000, 1_893_495_600_000);
        eng_a
            .add_block(cid, span, BlockReason::Tournament, None, "staff")
            .await
            .unwrap();

        assert!(eng_b.conflicts(cid, span, None, None).await.unwrap().is_empty());
        assert_eq!(eng_a.conflicts(cid, span, None, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = manager(dir.clone());

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        let _eng = tm.get_or_create("my_club").unwrap();
        assert!(dir.join("my_club.wal").exists());
        assert_eq!(tm.tenant_count(), 1);
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let dir = test_data_dir("same_eng");
        let tm = manager(dir);

        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = manager(dir.clone());

        let _eng = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());

        assert!(tm.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let dir = test_data_dir("name_too_long");
        let tm = manager(dir);

        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }
}
