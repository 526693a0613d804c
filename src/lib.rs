pub mod config;
pub mod error;
pub mod logic;
pub mod model;
pub mod seed;
pub mod store;

pub use error::{RepositoryError, Result};

// Export logic types
pub use logic::{
    BatchEntityStream, ChangeNotifier, DeleteHandler, EntityStore, EntityStream, HookConsumer, ImportEntityStream,
    LockCoordinator, RequestContext,
};

// Export all model types
pub use model::*;

// Export store types
pub use store::{Graph, GraphTransaction, InMemoryGraph};
