//! Subscriber-side filtering of the shared event channel.

use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};

use jobforge_core::TenantId;

use crate::bus::Subscription;
use crate::event::{QueueEvent, QueueEventType};

/// Messages that carry a tenant scope.
pub trait TenantScoped {
    fn tenant_id(&self) -> Option<TenantId>;
}

impl TenantScoped for QueueEvent {
    fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }
}

/// Selects the events a subscriber cares about. Empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub queue_name: Option<String>,
    pub job_type: Option<String>,
    pub tenant_id: Option<TenantId>,
    pub event_types: Vec<QueueEventType>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    pub fn job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn types(mut self, event_types: &[QueueEventType]) -> Self {
        self.event_types = event_types.to_vec();
        self
    }

    pub fn matches(&self, event: &QueueEvent) -> bool {
        if let Some(q) = &self.queue_name {
            if event.queue_name.as_deref() != Some(q.as_str()) {
                return false;
            }
        }
        if let Some(t) = &self.job_type {
            if event.job_type.as_deref() != Some(t.as_str()) {
                return false;
            }
        }
        if let Some(tenant) = self.tenant_id {
            // Tenant-safe: unscoped events are not leaked into a tenant view.
            if event.tenant_id() != Some(tenant) {
                return false;
            }
        }
        self.event_types.is_empty() || self.event_types.contains(&event.event_type)
    }
}

/// A subscription that only yields events matching a filter.
#[derive(Debug)]
pub struct FilteredSubscription {
    inner: Subscription<QueueEvent>,
    filter: EventFilter,
}

impl FilteredSubscription {
    pub fn new(inner: Subscription<QueueEvent>, filter: EventFilter) -> Self {
        Self { inner, filter }
    }

    pub fn filter(&self) -> &EventFilter {
        &self.filter
    }

    /// Next matching event within `timeout`; non-matching events are discarded.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<QueueEvent, RecvTimeoutError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let event = self.inner.recv_timeout(remaining)?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// Drain all currently buffered matching events without blocking.
    pub fn drain(&self) -> Vec<QueueEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.inner.try_recv() {
            if self.filter.matches(&event) {
                out.push(event);
            }
        }
        out
    }
}
