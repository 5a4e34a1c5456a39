//! Vehicle telemetry adapter core.
//!
//! Consumes decoded push events from a [`carlink_session::Session`] and
//! projects them into a host-owned, addressable state tree; translates host
//! write intents back into outbound commands. The tree itself is an external
//! collaborator behind the [`tree::StateTree`] trait.

pub mod adapter;
pub mod backend;
pub mod commands;
pub mod error;
pub mod history;
pub mod projector;
pub mod tree;

pub use adapter::{Adapter, AdapterConfig};
pub use backend::{BackendClient, CapabilityCatalog, StationPriceClient, VehicleMasterData};
pub use commands::{CommandDispatcher, CommandKind};
pub use error::{AdapterError, AdapterResult};
pub use history::{FuelPriceSource, HistoryConfig, HistoryRecord, HistoryTracker, Metric};
pub use projector::StateProjector;
pub use tree::{MemoryTree, StateTree, TreeError, WriteMeta};
