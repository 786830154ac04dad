//! Event distribution: broadcast bus for observers, hook registries for
//! synchronous callbacks with subscription handles.

pub mod bus;
pub mod hooks;

pub use bus::EventBus;
pub use hooks::{HookRegistry, Subscription};
