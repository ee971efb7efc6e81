//! Interactive flows driving the sharing backend
//!
//! Each coordinator is a small state machine owned by one view of the
//! embedding application. Coordinators never mutate share state directly;
//! they call `SharingBackend` operations and observe the event bus.

pub mod export;
pub mod import;
#[cfg(test)]
pub(crate) mod mock;

pub use export::{ExportCoordinator, ExportPhase};
pub use import::{ImportCoordinator, ImportPhase, InputMode};
