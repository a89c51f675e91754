pub mod backend_registry;
pub mod config;
mod coordinator;
pub mod error;
pub mod harness;
pub mod hybrid_store;
mod key_serialization;
pub mod model;
pub mod onlinestore;
pub mod routing;
pub mod types;

pub use backend_registry::BackendRegistry;
pub use hybrid_store::HybridOnlineStore;
pub use routing::RoutingTable;
