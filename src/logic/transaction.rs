use crate::error::{RepositoryError, Result};
use crate::logic::locks::{HeldLocks, LockCoordinator};
use crate::model::{EntityHeader, Guid, Status};
use crate::store::{EdgeId, Graph, GraphTransaction, VertexId};
use chrono::{DateTime, Utc};
use log::{debug, error, warn};
use std::collections::HashMap;

/// Per-call request information
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub user: String,
    pub request_time: DateTime<Utc>,
    /// 1-based attempt number when the call is retried
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub import_in_progress: bool,
}

impl RequestContext {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            request_time: Utc::now(),
            attempt_count: 1,
            max_attempts: 1,
            import_in_progress: false,
        }
    }

    pub fn with_attempt(mut self, attempt_count: u32, max_attempts: u32) -> Self {
        self.attempt_count = attempt_count;
        self.max_attempts = max_attempts;
        self
    }

    pub fn request_time_millis(&self) -> i64 {
        self.request_time.timestamp_millis()
    }
}

pub type PostCommitHook<'g> = Box<dyn FnOnce(bool) -> Result<()> + 'g>;

/// State of one unit of work: the graph transaction, its caches, post-commit
/// hooks, the entity locks it holds and the entities it touched.
pub struct TransactionContext<'g> {
    graph: Box<dyn GraphTransaction + 'g>,
    locks: &'g LockCoordinator,
    pub request: RequestContext,
    guid_cache: HashMap<VertexId, Guid>,
    vertex_status_cache: HashMap<VertexId, Status>,
    edge_status_cache: HashMap<EdgeId, Status>,
    hooks: Vec<PostCommitHook<'g>>,
    held_locks: HeldLocks,
    updated_guids: Vec<Guid>,
    deleted_entities: Vec<EntityHeader>,
    guid_updates: HashMap<Guid, Guid>,
    finished: bool,
}

impl<'g> TransactionContext<'g> {
    pub fn new(
        graph: Box<dyn GraphTransaction + 'g>,
        locks: &'g LockCoordinator,
        request: RequestContext,
    ) -> Self {
        Self {
            graph,
            locks,
            request,
            guid_cache: HashMap::new(),
            vertex_status_cache: HashMap::new(),
            edge_status_cache: HashMap::new(),
            hooks: Vec::new(),
            held_locks: HeldLocks::new(),
            updated_guids: Vec::new(),
            deleted_entities: Vec::new(),
            guid_updates: HashMap::new(),
            finished: false,
        }
    }

    pub fn graph(&self) -> &(dyn GraphTransaction + 'g) {
        self.graph.as_ref()
    }

    pub fn graph_mut(&mut self) -> &mut (dyn GraphTransaction + 'g) {
        self.graph.as_mut()
    }

    /// Locks the given entity identifiers until the end of the call
    pub fn lock<S: AsRef<str>>(&mut self, ids: &[S]) {
        self.locks.lock(&mut self.held_locks, ids);
    }

    pub fn held_locks(&self) -> &[String] {
        &self.held_locks
    }

    pub fn add_post_commit_hook(&mut self, hook: impl FnOnce(bool) -> Result<()> + 'g) {
        self.hooks.push(Box::new(hook));
    }

    pub fn cached_guid(&self, vertex: VertexId) -> Option<&Guid> {
        self.guid_cache.get(&vertex)
    }

    pub fn cache_guid(&mut self, vertex: VertexId, guid: Guid) {
        self.guid_cache.insert(vertex, guid);
    }

    pub fn cached_vertex_status(&self, vertex: VertexId) -> Option<Status> {
        self.vertex_status_cache.get(&vertex).copied()
    }

    pub fn cache_vertex_status(&mut self, vertex: VertexId, status: Status) {
        self.vertex_status_cache.insert(vertex, status);
    }

    pub fn cached_edge_status(&self, edge: EdgeId) -> Option<Status> {
        self.edge_status_cache.get(&edge).copied()
    }

    pub fn cache_edge_status(&mut self, edge: EdgeId, status: Status) {
        self.edge_status_cache.insert(edge, status);
    }

    pub fn evict_vertex(&mut self, vertex: VertexId) {
        self.guid_cache.remove(&vertex);
        self.vertex_status_cache.remove(&vertex);
    }

    pub fn evict_edge(&mut self, edge: EdgeId) {
        self.edge_status_cache.remove(&edge);
    }

    fn clear_caches(&mut self) {
        self.guid_cache.clear();
        self.vertex_status_cache.clear();
        self.edge_status_cache.clear();
    }

    /// Entity modified as a side effect (inverse references, deletes of referrers)
    pub fn record_entity_update(&mut self, guid: &str) {
        if !self.updated_guids.iter().any(|g| g == guid) {
            self.updated_guids.push(guid.to_string());
        }
    }

    pub fn updated_guids(&self) -> &[Guid] {
        &self.updated_guids
    }

    pub fn record_entity_delete(&mut self, header: EntityHeader) {
        if !self.deleted_entities.iter().any(|h| h.guid == header.guid) {
            self.deleted_entities.push(header);
        }
    }

    pub fn deleted_entities(&self) -> &[EntityHeader] {
        &self.deleted_entities
    }

    pub fn is_deleted_in_request(&self, guid: &str) -> bool {
        self.deleted_entities.iter().any(|h| h.guid == guid)
    }

    /// Guid found for an input entity by its unique attributes: input guid -> stored guid
    pub fn record_guid_update(&mut self, input_guid: &str, resolved_guid: &str) {
        self.guid_updates
            .insert(input_guid.to_string(), resolved_guid.to_string());
    }

    pub fn guid_updates(&self) -> &HashMap<Guid, Guid> {
        &self.guid_updates
    }

    /// Runs hooks in registration order, then clears caches and releases locks
    fn finish(&mut self, is_success: bool) {
        for hook in self.hooks.drain(..) {
            if let Err(e) = hook(is_success) {
                error!("post-commit hook failed: {}", e);
            }
        }
        self.clear_caches();
        self.locks.release_all(&mut self.held_locks);
        self.finished = true;
    }
}

impl Drop for TransactionContext<'_> {
    /// Unwinding out of the work closure: undo the writes before other calls can take the locks
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!("transaction abandoned; rolling back and releasing {} locks", self.held_locks.len());
        if let Err(e) = self.graph.rollback() {
            error!("graph rollback failed: {:?}", e);
        }
        self.hooks.clear();
        self.locks.release_all(&mut self.held_locks);
    }
}

/// Runs one unit of work: commit on success, rollback on error, and always
/// dispatch hooks, clear caches and release locks.
pub struct TransactionScope<'g> {
    graph: &'g dyn Graph,
    locks: &'g LockCoordinator,
}

impl<'g> TransactionScope<'g> {
    pub fn new(graph: &'g dyn Graph, locks: &'g LockCoordinator) -> Self {
        Self { graph, locks }
    }

    pub fn run<T>(
        &self,
        request: RequestContext,
        work: impl FnOnce(&mut TransactionContext<'g>) -> Result<T>,
    ) -> Result<T> {
        let mut ctx = TransactionContext::new(self.graph.begin(), self.locks, request);

        let mut result = work(&mut ctx);

        let is_success = if result.is_ok() {
            match ctx.graph.commit() {
                Ok(()) => true,
                Err(e) => {
                    error!("graph commit failed: {:?}", e);
                    if let Err(rollback_err) = ctx.graph.rollback() {
                        error!("graph rollback after failed commit failed: {:?}", rollback_err);
                    }
                    result = Err(e);
                    false
                }
            }
        } else {
            if let Err(e) = &result {
                log_rollback(e);
            }
            if let Err(rollback_err) = ctx.graph.rollback() {
                error!("graph rollback failed: {:?}", rollback_err);
            }
            false
        };

        debug!(
            "transaction finished: success={} attempt={}/{}",
            is_success, ctx.request.attempt_count, ctx.request.max_attempts
        );
        ctx.finish(is_success);

        result
    }
}

fn log_rollback(err: &RepositoryError) {
    if err.is_not_found() {
        warn!("graph rollback due to exception {:?}: {}", err.kind(), err);
    } else {
        error!("graph rollback due to exception: {:?}", err);
    }
}
