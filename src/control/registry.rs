//! Close-callback registry

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use super::{CloseCallback, RegistrationId};
use crate::protocol::{InboundCommand, Way};

/// Order in which callbacks fire for a command without a `way`
const DISPATCH_ORDER: [Way; 2] = [Way::Web, Way::Terminal];

type Entries = Vec<(RegistrationId, CloseCallback)>;

/// Callbacks keyed by `(code, way)`, each fired at most once
///
/// Several sessions may share a key; each registration keeps its own id so
/// that one session ending never drops another's callback.
#[derive(Default)]
pub struct CallbackRegistry {
    callbacks: Mutex<HashMap<(String, Way), Entries>>,
    next_id: AtomicU64,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback alongside any others for the same key
    pub fn register(&self, code: &str, way: Way, callback: CloseCallback) -> RegistrationId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let Ok(mut callbacks) = self.callbacks.lock() else {
            warn!("Callback registry lock poisoned");
            return id;
        };
        let entries = callbacks.entry((code.to_string(), way)).or_default();
        if !entries.is_empty() {
            debug!(code = %code, way = %way, live = entries.len(), "Key already has live sessions");
        }
        entries.push((id, callback));
        id
    }

    /// Remove one registration without firing it
    ///
    /// Other registrations under the same key stay in place.
    pub fn remove(&self, code: &str, way: Way, id: RegistrationId) -> bool {
        let Ok(mut callbacks) = self.callbacks.lock() else {
            return false;
        };
        let key = (code.to_string(), way);
        let Some(entries) = callbacks.get_mut(&key) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            callbacks.remove(&key);
        }
        removed
    }

    /// Fire and remove the callbacks an inbound command addresses
    ///
    /// Returns how many callbacks ran.
    pub fn dispatch(&self, command: &InboundCommand) -> usize {
        let ways: Vec<Way> = match command.way {
            Some(way) => vec![way],
            None => DISPATCH_ORDER.to_vec(),
        };

        // Take callbacks out before running them so a callback may
        // re-enter the registry.
        let taken: Vec<(Way, CloseCallback)> = match self.callbacks.lock() {
            Ok(mut callbacks) => ways
                .into_iter()
                .filter_map(|way| {
                    callbacks
                        .remove(&(command.code.clone(), way))
                        .map(|entries| (way, entries))
                })
                .flat_map(|(way, entries)| entries.into_iter().map(move |(_, cb)| (way, cb)))
                .collect(),
            Err(_) => {
                warn!("Callback registry lock poisoned");
                return 0;
            }
        };

        if taken.is_empty() {
            debug!(code = %command.code, "No session registered for command");
        }

        let fired = taken.len();
        for (way, callback) in taken {
            debug!(code = %command.code, way = %way, "Firing close callback");
            callback();
        }
        fired
    }

    /// Number of live registrations
    pub fn len(&self) -> usize {
        self.callbacks
            .lock()
            .map(|c| c.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
