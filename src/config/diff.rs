use crate::config::{ServerSpec, SpecKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Key-level changes between two spec registries.
///
/// Produced upstream of the scheduler (by whatever reloads the catalog)
/// and consumed by
/// [`Scheduler::apply_catalog_diff`](crate::scheduler::Scheduler::apply_catalog_diff).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogDiff {
    /// Keys present only in the new registry.
    pub added_spec_keys: Vec<SpecKey>,
    /// Keys present only in the old registry.
    pub removed_spec_keys: Vec<SpecKey>,
    /// Keys present in both whose specs differ.
    pub updated_spec_keys: Vec<SpecKey>,
    /// New keys that took over a server name from a removed key.
    pub replaced_spec_keys: Vec<SpecKey>,
}

impl CatalogDiff {
    /// Computes the diff that turns `old` into `new`.
    ///
    /// Every key list is sorted so diffs compare and log deterministically.
    pub fn between(
        old: &HashMap<SpecKey, ServerSpec>,
        new: &HashMap<SpecKey, ServerSpec>,
    ) -> Self {
        let mut diff = CatalogDiff::default();

        let old_names: HashMap<&str, &SpecKey> =
            old.iter().map(|(key, spec)| (spec.name.as_str(), key)).collect();

        for (key, spec) in new {
            match old.get(key) {
                None => {
                    diff.added_spec_keys.push(key.clone());
                    if old_names.get(spec.name.as_str()).is_some_and(|prev| *prev != key) {
                        diff.replaced_spec_keys.push(key.clone());
                    }
                }
                Some(previous) if previous != spec => diff.updated_spec_keys.push(key.clone()),
                Some(_) => {}
            }
        }
        for key in old.keys() {
            if !new.contains_key(key) {
                diff.removed_spec_keys.push(key.clone());
            }
        }

        diff.added_spec_keys.sort();
        diff.removed_spec_keys.sort();
        diff.updated_spec_keys.sort();
        diff.replaced_spec_keys.sort();
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.added_spec_keys.is_empty()
            && self.removed_spec_keys.is_empty()
            && self.updated_spec_keys.is_empty()
            && self.replaced_spec_keys.is_empty()
    }
}
