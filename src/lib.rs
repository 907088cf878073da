// Library modules
pub mod adapter;
pub mod broker;
pub mod changegroup;
pub mod config;
pub mod constants;
pub mod core;
pub mod error;
pub mod events;
pub mod mcp;
pub mod ws;

// Re-export commonly used types
pub use adapter::QsysAdapter;
pub use broker::Broker;
pub use changegroup::{ChangeGroupEngine, ChangesEvent, EngineEvent, EventSource};
pub use config::Config;
pub use crate::core::{ConnectionState, CoreClient, CoreEvent};
pub use error::{BrokerError, BrokerResult};
pub use events::{EventQuery, EventRecorder};
