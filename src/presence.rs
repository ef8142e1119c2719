//! Presence store: a state snapshot plus join/leave diffs keyed by
//! `presence_ref`. Diffs that arrive before the snapshot of the current
//! join generation are queued and replayed once it lands.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One user-attached presence record. The wire identifies metas by
/// `phx_ref`; the store exposes that as `presence_ref`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceMeta {
    pub presence_ref: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

/// Mapping from presence key to its metas. No key ever has an empty
/// meta list.
pub type PresenceState = HashMap<String, Vec<PresenceMeta>>;

/// A join/leave pair produced against the current state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceDiff {
    pub joins: PresenceState,
    pub leaves: PresenceState,
}

/// Callback invocations computed by a sync; the channel fires these to
/// user bindings after releasing its lock.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceCallback {
    Join {
        key: String,
        current: Vec<PresenceMeta>,
        joined: Vec<PresenceMeta>,
    },
    Leave {
        key: String,
        remaining: Vec<PresenceMeta>,
        left: Vec<PresenceMeta>,
    },
}

#[derive(Default)]
pub(crate) struct Presence {
    state: PresenceState,
    pending_diffs: Vec<PresenceDiff>,
    /// Join generation the last snapshot belonged to. Diffs are pending
    /// until a snapshot arrives for the current generation.
    sync_join_ref: Option<String>,
}

impl Presence {
    pub(crate) fn state(&self) -> PresenceState {
        self.state.clone()
    }

    /// Applies a `presence_state` snapshot for the given join generation,
    /// then replays any queued diffs in arrival order.
    pub(crate) fn handle_state(
        &mut self,
        raw: &Value,
        join_ref: Option<String>,
    ) -> Vec<PresenceCallback> {
        self.sync_join_ref = join_ref;
        let new_state = transform_state(raw);
        let mut callbacks = self.sync_state(new_state);
        for diff in std::mem::take(&mut self.pending_diffs) {
            callbacks.extend(self.sync_diff(diff));
        }
        callbacks
    }

    /// Applies a `presence_diff`, or queues it when no snapshot has been
    /// seen for the current join generation. Returns `None` when queued.
    pub(crate) fn handle_diff(
        &mut self,
        raw: &Value,
        current_join_ref: Option<&str>,
    ) -> Option<Vec<PresenceCallback>> {
        let diff = transform_diff(raw);
        if self.sync_join_ref.as_deref() != current_join_ref || current_join_ref.is_none() {
            self.pending_diffs.push(diff);
            return None;
        }
        Some(self.sync_diff(diff))
    }

    /// Replaces the state with `new_state`, expressed as the equivalent
    /// join/leave diff so callbacks fire uniformly.
    fn sync_state(&mut self, new_state: PresenceState) -> Vec<PresenceCallback> {
        let mut diff = PresenceDiff::default();

        for (key, current_metas) in &self.state {
            match new_state.get(key) {
                None => {
                    diff.leaves.insert(key.clone(), current_metas.clone());
                }
                Some(new_metas) => {
                    let new_refs: Vec<&str> =
                        new_metas.iter().map(|m| m.presence_ref.as_str()).collect();
                    let left: Vec<PresenceMeta> = current_metas
                        .iter()
                        .filter(|m| !new_refs.contains(&m.presence_ref.as_str()))
                        .cloned()
                        .collect();
                    if !left.is_empty() {
                        diff.leaves.insert(key.clone(), left);
                    }
                }
            }
        }

        for (key, new_metas) in new_state {
            let joined = match self.state.get(&key) {
                None => new_metas,
                Some(current_metas) => {
                    let current_refs: Vec<&str> = current_metas
                        .iter()
                        .map(|m| m.presence_ref.as_str())
                        .collect();
                    new_metas
                        .into_iter()
                        .filter(|m| !current_refs.contains(&m.presence_ref.as_str()))
                        .collect()
                }
            };
            if !joined.is_empty() {
                diff.joins.insert(key, joined);
            }
        }

        self.sync_diff(diff)
    }

    /// Applies joins and leaves to the state, dropping keys whose meta
    /// list empties out.
    fn sync_diff(&mut self, diff: PresenceDiff) -> Vec<PresenceCallback> {
        let mut callbacks = Vec::new();

        for (key, joined) in diff.joins {
            let current = self.state.get(&key).cloned().unwrap_or_default();
            let joined_refs: Vec<&str> =
                joined.iter().map(|m| m.presence_ref.as_str()).collect();
            let mut merged: Vec<PresenceMeta> = current
                .iter()
                .filter(|m| !joined_refs.contains(&m.presence_ref.as_str()))
                .cloned()
                .collect();
            merged.extend(joined.iter().cloned());
            self.state.insert(key.clone(), merged);
            callbacks.push(PresenceCallback::Join {
                key,
                current,
                joined,
            });
        }

        for (key, left) in diff.leaves {
            let Some(current_metas) = self.state.get_mut(&key) else {
                continue;
            };
            let left_refs: Vec<&str> = left.iter().map(|m| m.presence_ref.as_str()).collect();
            current_metas.retain(|m| !left_refs.contains(&m.presence_ref.as_str()));
            let remaining = current_metas.clone();
            if remaining.is_empty() {
                self.state.remove(&key);
            }
            callbacks.push(PresenceCallback::Leave {
                key,
                remaining,
                left,
            });
        }

        callbacks
    }
}

/// Decodes the wire shape `{key: {metas: [{phx_ref, ..}]}}`.
fn transform_state(raw: &Value) -> PresenceState {
    let mut state = PresenceState::new();
    let Some(map) = raw.as_object() else {
        return state;
    };
    for (key, entry) in map {
        let metas = entry
            .get("metas")
            .and_then(Value::as_array)
            .map(|metas| metas.iter().filter_map(transform_meta).collect::<Vec<_>>())
            .unwrap_or_default();
        if !metas.is_empty() {
            state.insert(key.clone(), metas);
        }
    }
    state
}

fn transform_meta(raw: &Value) -> Option<PresenceMeta> {
    let object = raw.as_object()?;
    let presence_ref = object
        .get("phx_ref")
        .or_else(|| object.get("presence_ref"))
        .and_then(Value::as_str)?
        .to_string();
    let mut payload = object.clone();
    payload.remove("phx_ref");
    payload.remove("phx_ref_prev");
    payload.remove("presence_ref");
    Some(PresenceMeta {
        presence_ref,
        payload,
    })
}

fn transform_diff(raw: &Value) -> PresenceDiff {
    PresenceDiff {
        joins: transform_state(raw.get("joins").unwrap_or(&Value::Null)),
        leaves: transform_state(raw.get("leaves").unwrap_or(&Value::Null)),
    }
}
