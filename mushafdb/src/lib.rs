pub mod audit;
pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod migration;
pub mod query;
pub mod queue;
pub mod record;
pub mod remote;
pub mod schema;
pub mod store;
pub mod validation;
pub mod watcher;

pub use config::StoreConfig;
pub use error::{MushafDbError, Result};
pub use migration::Migration;
pub use query::{Query, SortDirection};
pub use record::Record;
pub use remote::{GitHubStore, MemoryRemote, RemoteStore};
pub use schema::{CollectionSchema, FieldType, SchemaDefinition};
pub use store::{Store, StoreStatus};
pub use watcher::Subscription;
