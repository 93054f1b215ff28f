//! `verdant-events`: job lifecycle notifications.

pub mod bus;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use event::{Event, JobEvent, JobLifecycle};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
