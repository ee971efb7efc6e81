//! Instance sharing: package a local instance, serve it over a tunnel,
//! and import shared packages on the receiving side.
//!
//! The crate is a coordination layer for a launcher-style host
//! application. The host registers its instances with a [`LocalBackend`],
//! drives the [`ExportCoordinator`] and [`ImportCoordinator`] flows from
//! its UI, and observes progress through the [`EventBus`] or a
//! [`TransferStore`]. Tunnel vendors plug in via [`TunnelProvider`];
//! [`DirectTunnel`] serves without a relay.

pub mod backend;
pub mod client;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod export;
pub mod import;
pub mod instance;
pub mod manifest;
pub mod registry;
mod server;
pub mod store;
pub mod tunnel;

pub use backend::{LocalBackend, SharingBackend};
pub use coordinator::{ExportCoordinator, ExportPhase, ImportCoordinator, ImportPhase, InputMode};
pub use error::{ShareError, ShareResult};
pub use events::{
    EventBus, ProgressReporter, ShareDownloadEvent, ShareStatus, ShareStatusEvent, SharingEvent,
    SharingProgress,
};
pub use instance::{ImportedInstance, InstanceSpec};
pub use manifest::{
    format_size, ExportOptions, ExportableContent, PreparedExport, SharingManifest,
};
pub use registry::{ActiveShare, ShareRegistry};
pub use store::{TransferSnapshot, TransferStore};
pub use tunnel::{DirectTunnel, TunnelHandle, TunnelProvider};
