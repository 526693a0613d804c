use crate::model::MutationResponse;
use log::info;

/// Receives the response of every successful call that changed at least one
/// entity, once per call
pub trait ChangeNotifier: Send + Sync {
    fn on_entities_mutated(&self, response: &MutationResponse, is_import: bool);
}

/// Default notifier: logs what changed
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingNotifier;

impl ChangeNotifier for LoggingNotifier {
    fn on_entities_mutated(&self, response: &MutationResponse, is_import: bool) {
        info!(
            "entities mutated: created={} updated={} partially updated={} deleted={} import={}",
            response.created().len(),
            response.updated().len(),
            response.partial_updated().len(),
            response.deleted().len(),
            is_import
        );
    }
}
