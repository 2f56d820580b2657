//! Server-side state synchronization for a split UI runtime
//!
//! Tracks property and container changes of live components, encodes them
//! as full values or granular patches for the peer, gates peer-originated
//! mutations through an access policy and runs all of it on a single
//! dispatcher thread.

pub mod access;
pub mod attach;
pub mod config;
pub mod container;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod session;
pub mod store;
pub mod types;
pub mod value;
pub mod wire;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use access::{AccessLevel, PropertyPath};
pub use attach::AttachOrder;
pub use config::SyncConfig;
pub use container::{IncomingOutcome, VersionedArray, VersionedContainer, VersionedMap};
pub use dispatcher::{
    DispatchContext, DispatchError, DispatcherHandle, EventDispatcher, Level, EVENT_LEVEL_DEFAULT,
    EVENT_LEVEL_SYNC_API_CALL,
};
pub use error::{SyncError, SyncResult};
pub use logging::{init_logging, LogLevel};
pub use session::{Session, SessionError, SessionHandle, Transport};
pub use store::{ChangeKind, PropertyStore};
pub use types::{PropertyDescription, PropertyType, StaticTypeRegistry, TypeRegistry};
pub use value::{wrap, Value};
