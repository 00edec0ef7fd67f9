//! Callback registry: merging and pruning "worth revisiting" moments.
//!
//! A callback is identified by `(source_unit_index, moment)`, with exact text
//! equality on `moment`. Both operations here are pure and order-stable:
//! a key keeps the position where it was first seen, new keys are appended.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A narratively significant moment flagged as worth revisiting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Callback {
    pub source_unit_index: u32,
    pub moment: String,
    pub status: CallbackStatus,

    #[serde(default)]
    pub context: String,
}

impl Callback {
    pub fn ripe(source_unit_index: u32, moment: impl Into<String>) -> Self {
        Self {
            source_unit_index,
            moment: moment.into(),
            status: CallbackStatus::Ripe,
            context: String::new(),
        }
    }

    pub fn with_status(mut self, status: CallbackStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    fn key(&self) -> (u32, String) {
        (self.source_unit_index, self.moment.clone())
    }

    pub fn is_open(&self) -> bool {
        self.status == CallbackStatus::Ripe
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallbackStatus {
    /// Set up, not yet paid off
    Ripe,
    /// Paid off in a later unit
    Used,
    /// No longer worth revisiting
    Expired,
}

impl std::fmt::Display for CallbackStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Ripe => "ripe",
            Self::Used => "used",
            Self::Expired => "expired",
        })
    }
}

/// Merge two banks; `new` wins on key collisions (last-write-wins).
pub fn merge(old: &[Callback], new: &[Callback]) -> Vec<Callback> {
    let mut merged: Vec<Callback> = Vec::with_capacity(old.len() + new.len());
    let mut positions: HashMap<(u32, String), usize> = HashMap::new();

    for callback in old.iter().chain(new.iter()) {
        match positions.get(&callback.key()) {
            Some(&pos) => merged[pos] = callback.clone(),
            None => {
                positions.insert(callback.key(), merged.len());
                merged.push(callback.clone());
            }
        }
    }

    merged
}

/// Drop used/expired callbacks at least `prune_age` units old; keep every ripe one.
pub fn prune(merged: Vec<Callback>, current_unit: u32, prune_age: u32) -> Vec<Callback> {
    merged
        .into_iter()
        .filter(|c| {
            c.status == CallbackStatus::Ripe
                || current_unit.saturating_sub(c.source_unit_index) < prune_age
        })
        .collect()
}

/// Callbacks still waiting to be paid off.
pub fn ripe(bank: &[Callback]) -> Vec<&Callback> {
    bank.iter().filter(|c| c.is_open()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cb(src: u32, moment: &str, status: CallbackStatus) -> Callback {
        Callback::ripe(src, moment).with_status(status)
    }

    #[test]
    fn test_merge_dedups_with_later_status() {
        let old = vec![cb(2, "the broken locket", CallbackStatus::Ripe)];
        let new = vec![cb(2, "the broken locket", CallbackStatus::Used)];

        let merged = merge(&old, &new);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].status, CallbackStatus::Used);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let a = vec![
            cb(1, "oath at the well", CallbackStatus::Ripe),
            cb(3, "the stranger's scar", CallbackStatus::Ripe),
        ];
        let b = vec![
            cb(3, "the stranger's scar", CallbackStatus::Expired),
            cb(4, "a letter unopened", CallbackStatus::Ripe),
        ];

        let ab = merge(&a, &b);
        assert_eq!(merge(&a, &ab), ab);
    }

    #[test]
    fn test_merge_is_order_stable() {
        let old = vec![
            cb(1, "a", CallbackStatus::Ripe),
            cb(2, "b", CallbackStatus::Ripe),
        ];
        let new = vec![
            cb(5, "c", CallbackStatus::Ripe),
            cb(1, "a", CallbackStatus::Used),
        ];

        let merged = merge(&old, &new);
        let order: Vec<_> = merged.iter().map(|c| c.moment.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(merged[0].status, CallbackStatus::Used);
    }

    #[test]
    fn test_merge_keys_on_exact_moment_text() {
        let old = vec![cb(1, "the locket", CallbackStatus::Ripe)];
        let new = vec![cb(1, "The locket", CallbackStatus::Used)];
        assert_eq!(merge(&old, &new).len(), 2);
    }

    #[test]
    fn test_prune_example() {
        let merged = vec![
            cb(1, "first", CallbackStatus::Used),
            cb(8, "eighth", CallbackStatus::Used),
            cb(9, "ninth", CallbackStatus::Ripe),
        ];

        let pruned = prune(merged, 10, 3);
        let kept: Vec<u32> = pruned.iter().map(|c| c.source_unit_index).collect();
        assert_eq!(kept, vec![8, 9]);
    }

    #[test]
    fn test_prune_never_drops_ripe() {
        let merged = vec![cb(1, "ancient promise", CallbackStatus::Ripe)];
        assert_eq!(prune(merged, 500, 3).len(), 1);
    }

    #[test]
    fn test_prune_boundary_and_expired() {
        let merged = vec![
            cb(7, "exactly three", CallbackStatus::Expired),
            cb(8, "two", CallbackStatus::Expired),
        ];
        let pruned = prune(merged, 10, 3);
        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].source_unit_index, 8);
    }

    #[test]
    fn test_status_wire_format() {
        let c: Callback =
            serde_json::from_str(r#"{"source_unit_index":3,"moment":"m","status":"expired"}"#)
                .unwrap();
        assert_eq!(c.status, CallbackStatus::Expired);
        assert_eq!(c.context, "");
    }
}
