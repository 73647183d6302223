//! In-process publish-subscribe event bus for constellation lifecycle events.

pub mod bus;

pub use bus::InMemoryEventBus;
