//! Key layout inside the shared store.

use jobforge_core::JobId;

/// Builds every store key under one namespace prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    ns: String,
}

impl KeySpace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self { ns: namespace.into() }
    }

    pub fn namespace(&self) -> &str {
        &self.ns
    }

    /// Main queue name for a job type: `<ns>:queue:<jobType>`.
    pub fn queue(&self, job_type: &str) -> String {
        format!("{}:queue:{job_type}", self.ns)
    }

    /// Dead-letter index for a job type: `<ns>:dlq:set:<jobType>`.
    ///
    /// Per-type keys sit one segment below a fixed tag (`set`, `entry`) so no
    /// job type can land on a registry key such as `dlq:types`.
    pub fn dlq(&self, job_type: &str) -> String {
        format!("{}:dlq:set:{job_type}", self.ns)
    }

    /// Inverse of [`KeySpace::queue`].
    pub fn job_type_of_queue<'a>(&self, queue_name: &'a str) -> Option<&'a str> {
        queue_name
            .strip_prefix(self.ns.as_str())?
            .strip_prefix(":queue:")
            .filter(|t| !t.is_empty())
    }

    pub fn idempotency(&self, key: &str) -> String {
        format!("{}:idem:{key}", self.ns)
    }

    pub fn dedupe(&self, job_type: &str, entity_key: &str) -> String {
        format!("{}:dedupe:{job_type}:{entity_key}", self.ns)
    }

    pub fn job_map(&self, job_id: JobId) -> String {
        format!("{}:jobmap:{job_id}", self.ns)
    }

    pub fn lock(&self, entity_type: &str, entity_id: &str) -> String {
        format!("{}:lock:{entity_type}:{entity_id}", self.ns)
    }

    pub fn circuit(&self, dependency: &str) -> String {
        format!("{}:circuit:{dependency}", self.ns)
    }

    pub fn circuits(&self) -> String {
        format!("{}:circuits", self.ns)
    }

    pub fn quarantine(&self, job_type: &str) -> String {
        format!("{}:quarantine:set:{job_type}", self.ns)
    }

    pub fn quarantine_entry(&self, job_type: &str, job_id: JobId) -> String {
        format!("{}:quarantine:entry:{job_type}:{job_id}", self.ns)
    }

    pub fn quarantine_types(&self) -> String {
        format!("{}:quarantine:types", self.ns)
    }

    pub fn quarantine_signature(&self, job_type: &str, hash: &str) -> String {
        format!("{}:quarantine:sig:{job_type}:{hash}", self.ns)
    }

    /// Failure counter for one entity; `entity_key` is `<entityType>:<entityId>`.
    pub fn quarantine_entity(&self, entity_key: &str) -> String {
        format!("{}:quarantine:entity:{entity_key}", self.ns)
    }

    pub fn sla_breaches(&self, job_type: &str) -> String {
        format!("{}:sla:breaches:{job_type}", self.ns)
    }

    pub fn sla_runs(&self, job_type: &str) -> String {
        format!("{}:sla:runs:{job_type}", self.ns)
    }

    pub fn dlq_entry(&self, job_type: &str, job_id: JobId) -> String {
        format!("{}:dlq:entry:{job_type}:{job_id}", self.ns)
    }

    pub fn dlq_written(&self, job_id: JobId) -> String {
        format!("{}:dlq:written:{job_id}", self.ns)
    }

    pub fn dlq_types(&self) -> String {
        format!("{}:dlq:types", self.ns)
    }
}
