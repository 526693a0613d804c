use crate::model::Guid;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckStateRequest {
    #[serde(default)]
    pub entity_guids: Vec<Guid>,
    #[serde(default)]
    pub entity_types: Vec<String>,
    #[serde(default)]
    pub fix_issues: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityStateKind {
    #[default]
    Ok,
    Fixed,
    PartiallyFixed,
    NotFixed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityState {
    pub guid: Guid,
    pub type_name: String,
    pub state: EntityStateKind,
    #[serde(default)]
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckStateResult {
    pub entities_scanned: usize,
    pub entities_ok: usize,
    pub entities_fixed: usize,
    pub entities_partially_fixed: usize,
    pub entities_not_fixed: usize,
    pub state: EntityStateKind,
    /// Only entities with issues are listed
    #[serde(default)]
    pub entities: HashMap<Guid, EntityState>,
}

impl CheckStateResult {
    pub fn record(&mut self, entity: EntityState) {
        self.entities_scanned += 1;
        match entity.state {
            EntityStateKind::Ok => self.entities_ok += 1,
            EntityStateKind::Fixed => self.entities_fixed += 1,
            EntityStateKind::PartiallyFixed => self.entities_partially_fixed += 1,
            EntityStateKind::NotFixed => self.entities_not_fixed += 1,
        }
        self.state = if self.entities_not_fixed > 0 {
            EntityStateKind::NotFixed
        } else if self.entities_partially_fixed > 0 {
            EntityStateKind::PartiallyFixed
        } else if self.entities_fixed > 0 {
            EntityStateKind::Fixed
        } else {
            EntityStateKind::Ok
        };
        if entity.state != EntityStateKind::Ok {
            self.entities.insert(entity.guid.clone(), entity);
        }
    }
}
