pub mod check_state;
pub mod delete;
pub mod discovery;
pub mod entity_store;
pub mod graph_helper;
pub mod hook_consumer;
pub mod locks;
pub mod mapper;
pub mod mutation_context;
pub mod notifier;
pub mod retriever;
pub mod transaction;
pub mod validate;

pub use check_state::EntityStateChecker;
pub use delete::{DeleteHandler, GraphDeleteHandler};
pub use discovery::{BatchEntityStream, EntityGraphDiscovery, EntityGraphDiscoveryContext, EntityStream, ImportEntityStream};
pub use entity_store::EntityStore;
pub use graph_helper::GraphHelper;
pub use hook_consumer::{hook_channel, AdaptiveWaiter, ConsumeOutcome, HookConsumer};
pub use locks::LockCoordinator;
pub use mapper::{trim_indexed_string, EntityGraphMapper};
pub use mutation_context::EntityMutationContext;
pub use notifier::{ChangeNotifier, LoggingNotifier};
pub use retriever::EntityGraphRetriever;
pub use transaction::{RequestContext, TransactionContext, TransactionScope};
pub use validate::{EntityValidator, ValidationMode};
