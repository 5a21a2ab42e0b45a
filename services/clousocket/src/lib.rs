pub mod catalog;
pub mod config;
pub mod gatehouse;
pub mod handlers;
pub mod heartbeat;
pub mod queue;
pub mod session;
pub mod store;
pub mod supervisor;

pub use catalog::{CommandTable, CommandTree, Deserializer, DeserializeError};
pub use config::{Config, ConfigError};
pub use handlers::{HandlerContext, HandlerRegistry};
pub use store::{StoreClient, StoreError};
pub use supervisor::{SessionRegistry, Supervisor};
