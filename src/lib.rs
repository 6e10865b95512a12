// Library exports for the gateway server supervisor

pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod logs;
pub mod orchestrator;
pub mod process;
pub mod ring;
pub mod store;
pub mod types;
pub mod validate;

pub use config::{ServerSpec, SupervisorSettings};
pub use error::{ErrorKind, Result, SupervisorError};
pub use events::{DomainEvent, EventBus};
pub use orchestrator::{BatchAction, BatchMode, BatchOutcome, BatchResult, ServerOrchestrator};
pub use store::{FileStore, MemoryStore, Store};
pub use types::{ServerId, ServerRecord, ServerStatus, Transport};
pub use validate::{BasicValidator, SpecValidator};
