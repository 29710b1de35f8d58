use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;

use jobforge_core::{JobId, JobRecord};

use super::{AuditEntry, AuditLog, JobRepository, RepositoryError, RepositoryResult};

/// In-memory job repository for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobRepository {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.jobs.read().map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn create(&self, record: &JobRecord) -> RepositoryResult<()> {
        let mut jobs = self.jobs.write().map_err(|_| RepositoryError::Poisoned)?;
        if jobs.contains_key(&record.id) {
            return Err(RepositoryError::AlreadyExists(record.id));
        }
        jobs.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> RepositoryResult<Option<JobRecord>> {
        let jobs = self.jobs.read().map_err(|_| RepositoryError::Poisoned)?;
        Ok(jobs.get(&job_id).cloned())
    }

    async fn update(&self, record: &JobRecord) -> RepositoryResult<()> {
        let mut jobs = self.jobs.write().map_err(|_| RepositoryError::Poisoned)?;
        match jobs.get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound(record.id)),
        }
    }
}

/// In-memory audit log for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn actions(&self) -> Vec<String> {
        self.entries().into_iter().map(|e| e.action).collect()
    }
}

#[async_trait]
impl AuditLog for InMemoryAuditLog {
    async fn append(&self, entry: AuditEntry) -> RepositoryResult<()> {
        self.entries
            .lock()
            .map_err(|_| RepositoryError::Poisoned)?
            .push(entry);
        Ok(())
    }
}
