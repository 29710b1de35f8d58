//! Queue lifecycle events and the bus that broadcasts them.

pub mod bus;
pub mod emitter;
pub mod event;
pub mod filter;
pub mod in_memory_bus;

pub use bus::{BusError, EventBus, Subscription};
pub use emitter::{QueueEvents, DEFAULT_RECENT_CAPACITY};
pub use event::{EventDraft, QueueEvent, QueueEventType, MAX_ERROR_SUMMARY_LEN};
pub use filter::{EventFilter, FilteredSubscription, TenantScoped};
pub use in_memory_bus::InMemoryEventBus;
