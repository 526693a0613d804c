//! Ingestion of hook messages published by metadata sources.

use crate::config::ConsumerConfig;
use crate::error::{ErrorKind, RepositoryError, Result};
use crate::logic::discovery::BatchEntityStream;
use crate::logic::entity_store::EntityStore;
use crate::logic::graph_helper::retry_with_sleep;
use crate::logic::transaction::RequestContext;
use crate::model::{AttrValue, EntitiesWithExtInfo, Entity, Guid, HookMessage, MutationResponse, ObjectId};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Result of handing one message to the consumer
#[derive(Debug)]
pub enum ConsumeOutcome {
    Processed(MutationResponse),
    Dropped(RepositoryError),
}

impl ConsumeOutcome {
    pub fn is_processed(&self) -> bool {
        matches!(self, ConsumeOutcome::Processed(_))
    }
}

/// Growing pause between infrastructure failures, reset after a quiet period
#[derive(Debug)]
pub struct AdaptiveWaiter {
    min_duration: Duration,
    max_duration: Duration,
    increment: Duration,
    reset_interval: Duration,
    wait_duration: Duration,
    last_wait_at: Option<Instant>,
}

impl AdaptiveWaiter {
    pub fn new(min_duration: Duration, max_duration: Duration, increment: Duration) -> Self {
        Self {
            min_duration,
            max_duration,
            increment,
            reset_interval: max_duration * 2,
            wait_duration: min_duration,
            last_wait_at: None,
        }
    }

    pub fn from_config(config: &ConsumerConfig) -> Self {
        let min = Duration::from_millis(config.min_retry_interval_ms);
        Self::new(min, Duration::from_millis(config.max_retry_interval_ms), min)
    }

    /// Duration of the pause taken at `now`
    pub fn next_wait(&mut self, now: Instant) -> Duration {
        let since_last = self
            .last_wait_at
            .map_or(Duration::ZERO, |last| now.saturating_duration_since(last));
        self.last_wait_at = Some(now);

        if since_last > self.reset_interval {
            self.wait_duration = self.min_duration;
        } else {
            self.wait_duration = (self.wait_duration + self.increment).min(self.max_duration);
        }
        self.wait_duration
    }

    pub fn pause(&mut self, reason: &RepositoryError) {
        let wait = self.next_wait(Instant::now());
        info!("pausing consumer for {:?} after: {}", wait, reason);
        std::thread::sleep(wait);
    }
}

/// Applies hook messages to an [`EntityStore`], retrying failed messages and
/// keeping the last few dropped ones
pub struct HookConsumer {
    store: Arc<EntityStore>,
    config: ConsumerConfig,
    failed: Mutex<VecDeque<HookMessage>>,
    waiter: Mutex<AdaptiveWaiter>,
    ignore_patterns: Vec<Regex>,
}

impl HookConsumer {
    pub fn new(store: Arc<EntityStore>, config: ConsumerConfig) -> Self {
        let waiter = AdaptiveWaiter::from_config(&config);
        Self {
            store,
            failed: Mutex::new(VecDeque::with_capacity(config.failed_cache_size)),
            waiter: Mutex::new(waiter),
            ignore_patterns: compile_patterns(&config.ignore_patterns),
            config,
        }
    }

    /// Messages dropped after their final attempt, oldest first
    pub fn failed_messages(&self) -> Vec<HookMessage> {
        self.failed.lock().iter().cloned().collect()
    }

    pub fn handle_message(&self, message: &HookMessage) -> ConsumeOutcome {
        let max_attempts = self.config.max_retries.max(1);
        let result = retry_with_sleep(max_attempts, self.config.retry_interval(), |attempt| {
            debug!("processing {} message, attempt {}/{}", message.kind(), attempt, max_attempts);
            self.process(message, attempt, max_attempts)
        });

        match result {
            Ok(response) => ConsumeOutcome::Processed(response),
            Err(e) => {
                warn!(
                    "[DROPPED_NOTIFICATION] {} message dropped after {} attempts: {}",
                    message.kind(),
                    max_attempts,
                    e
                );
                self.record_failed(message.clone());
                if e.kind() == ErrorKind::Transient {
                    self.waiter.lock().pause(&e);
                }
                ConsumeOutcome::Dropped(e)
            }
        }
    }

    fn record_failed(&self, message: HookMessage) {
        if self.config.failed_cache_size == 0 {
            return;
        }
        let mut failed = self.failed.lock();
        while failed.len() >= self.config.failed_cache_size {
            failed.pop_front();
        }
        failed.push_back(message);
    }

    fn process(&self, message: &HookMessage, attempt: u32, max_attempts: u32) -> Result<MutationResponse> {
        let user = message
            .user()
            .map(str::to_string)
            .unwrap_or_else(|| self.store.config().default_user.clone());
        let request = self.store.request_context();
        let request = RequestContext { user, ..request }.with_attempt(attempt, max_attempts);

        match message {
            HookMessage::EntityCreate { entities, .. } | HookMessage::EntityFullUpdate { entities, .. } => {
                let entities = self.without_ignored(entities);
                if entities.entities.is_empty() {
                    info!("{} message skipped: every entity is ignored", message.kind());
                    return Ok(MutationResponse::new());
                }
                self.store
                    .create_or_update(&request, &BatchEntityStream::new(entities), false)
            }
            HookMessage::EntityPartialUpdate { entity_id, entity, .. } => {
                self.store.update_entity(&request, entity_id, entity.clone())
            }
            HookMessage::EntityDelete { entities, .. } => self.delete(&request, entities),
        }
    }

    fn is_ignored(&self, entity: &Entity) -> bool {
        entity
            .attribute("qualifiedName")
            .and_then(AttrValue::as_str)
            .map_or(false, |name| self.ignore_patterns.iter().any(|p| p.is_match(name)))
    }

    /// Drops ignored entities and the references other entities hold to them
    fn without_ignored(&self, entities: &EntitiesWithExtInfo) -> EntitiesWithExtInfo {
        let mut kept = entities.clone();
        if self.ignore_patterns.is_empty() {
            return kept;
        }

        let ignored: HashSet<Guid> = entities
            .entities
            .iter()
            .chain(entities.referred_entities.values())
            .filter(|e| self.is_ignored(e))
            .map(|e| e.guid.clone())
            .collect();
        if ignored.is_empty() {
            return kept;
        }
        info!("ignoring {} entities: {:?}", ignored.len(), ignored);

        kept.entities.retain(|e| !ignored.contains(&e.guid));
        kept.referred_entities.retain(|guid, _| !ignored.contains(guid));
        for entity in kept.entities.iter_mut().chain(kept.referred_entities.values_mut()) {
            strip_references(entity, &ignored);
        }
        kept
    }

    fn delete(&self, request: &RequestContext, ids: &[ObjectId]) -> Result<MutationResponse> {
        let mut merged = MutationResponse::new();
        for id in ids {
            let response = match id.guid() {
                Some(guid) => self.store.delete_by_id(request, guid)?,
                None => self
                    .store
                    .delete_by_unique_attributes(request, &id.type_name, &id.unique_attributes)?,
            };
            for (op, headers) in response.mutated_entities {
                for header in headers {
                    merged.add_entity(op, header);
                }
            }
        }
        Ok(merged)
    }

    /// Consumes messages until the channel closes, one at a time on a blocking worker.
    /// Returns the number of messages processed successfully.
    pub async fn run(self: Arc<Self>, mut receiver: mpsc::Receiver<HookMessage>) -> usize {
        let mut processed = 0;
        while let Some(message) = receiver.recv().await {
            let consumer = Arc::clone(&self);
            match tokio::task::spawn_blocking(move || consumer.handle_message(&message)).await {
                Ok(outcome) if outcome.is_processed() => processed += 1,
                Ok(_) => {}
                Err(e) => error!("hook message worker failed: {}", e),
            }
        }
        info!("hook message channel closed after {} processed messages", processed);
        processed
    }
}

/// Anchored: a pattern has to match the whole qualified name. Invalid patterns are skipped.
fn compile_patterns(patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|pattern| match Regex::new(&format!("^(?:{})$", pattern)) {
            Ok(regex) => Some(regex),
            Err(e) => {
                error!("invalid ignore pattern {:?}: {}", pattern, e);
                None
            }
        })
        .collect()
}

fn strip_references(entity: &mut Entity, ignored: &HashSet<Guid>) {
    let points_at_ignored =
        |value: &AttrValue| matches!(value.as_object_id().and_then(ObjectId::guid), Some(guid) if ignored.contains(guid));

    entity.attributes.retain(|_, value| !points_at_ignored(&*value));
    for value in entity.attributes.values_mut() {
        if let AttrValue::Array(items) = value {
            items.retain(|item| !points_at_ignored(item));
        }
    }
}

/// Channel feeding a [`HookConsumer::run`] driver
pub fn hook_channel(config: &ConsumerConfig) -> (mpsc::Sender<HookMessage>, mpsc::Receiver<HookMessage>) {
    mpsc::channel(config.queue_capacity.max(1))
}
