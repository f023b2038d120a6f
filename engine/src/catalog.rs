//! Action catalog snapshot
//!
//! Maps action ids to their reward and cooldown. A catalog is immutable once
//! built; an external loader refreshes it by handing a whole new snapshot to
//! [`crate::Engine::replace_catalog`].

use crate::error::CatalogError;
use shared::ActionDefinition;
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct ActionCatalog {
    actions: HashMap<String, ActionDefinition>,
}

impl ActionCatalog {
    /// Builds a snapshot, rejecting empty ids, zero rewards and duplicates
    pub fn from_definitions(
        definitions: impl IntoIterator<Item = ActionDefinition>,
    ) -> Result<Self, CatalogError> {
        let mut actions = HashMap::new();

        for definition in definitions {
            if definition.action_id.is_empty() {
                return Err(CatalogError::EmptyActionId);
            }
            if definition.reward_amount == 0 {
                return Err(CatalogError::ZeroReward(definition.action_id));
            }
            if actions.contains_key(&definition.action_id) {
                return Err(CatalogError::DuplicateAction(definition.action_id));
            }
            actions.insert(definition.action_id.clone(), definition);
        }

        Ok(Self { actions })
    }

    pub fn get(&self, action_id: &str) -> Option<&ActionDefinition> {
        self.actions.get(action_id)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActionDefinition> {
        self.actions.values()
    }
}
