//! Dispatcher registry: message class → dispatchers.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::signal::{DispatchOutcome, Signal, TypeUrl};

use super::BusError;

/// Consumes signals of the message classes it exposes.
///
/// Repositories implement this to receive signals from a bus; the
/// dispatch typically routes and enqueues into the sharded inbox rather
/// than running handlers inline.
#[async_trait]
pub trait SignalDispatcher: Send + Sync {
    /// Stable identity used for uniqueness checks and unregistration.
    fn id(&self) -> &str;

    /// The message classes this dispatcher consumes. Must be non-empty.
    fn message_classes(&self) -> Vec<TypeUrl>;

    async fn dispatch(&self, signal: &Signal) -> DispatchOutcome;
}

/// Index of dispatchers per message class.
///
/// Unicast registries (the command bus) admit at most one dispatcher per
/// class; multicast registries append. Registration is rare and guarded
/// by a lock; lookup clones the per-class list out.
pub struct DispatcherRegistry {
    multicast: bool,
    dispatchers: RwLock<HashMap<TypeUrl, Vec<Arc<dyn SignalDispatcher>>>>,
}

impl DispatcherRegistry {
    pub fn unicast() -> Self {
        DispatcherRegistry {
            multicast: false,
            dispatchers: RwLock::new(HashMap::new()),
        }
    }

    pub fn multicast() -> Self {
        DispatcherRegistry {
            multicast: true,
            dispatchers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a dispatcher for every class it exposes.
    pub fn register(&self, dispatcher: Arc<dyn SignalDispatcher>) -> Result<(), BusError> {
        let classes = dispatcher.message_classes();
        if classes.is_empty() {
            return Err(BusError::InvalidDispatcher {
                dispatcher: dispatcher.id().to_string(),
            });
        }

        let mut map = self.dispatchers.write().expect("registry lock");
        if !self.multicast {
            for class in &classes {
                if let Some(existing) = map.get(class).and_then(|row| row.first()) {
                    return Err(BusError::DuplicateHandler {
                        class: class.clone(),
                        existing: existing.id().to_string(),
                    });
                }
            }
        }
        for class in classes {
            let row = map.entry(class).or_default();
            if row.iter().any(|d| d.id() == dispatcher.id()) {
                continue;
            }
            row.push(Arc::clone(&dispatcher));
        }
        Ok(())
    }

    /// Remove every association of the dispatcher with the given id.
    pub fn unregister(&self, dispatcher_id: &str) {
        let mut map = self.dispatchers.write().expect("registry lock");
        map.retain(|_, row| {
            row.retain(|d| d.id() != dispatcher_id);
            !row.is_empty()
        });
    }

    /// Remove all dispatchers.
    pub fn unregister_all(&self) {
        self.dispatchers.write().expect("registry lock").clear();
    }

    /// Dispatchers registered for the class, in registration order.
    pub fn dispatchers_of(&self, class: &TypeUrl) -> Vec<Arc<dyn SignalDispatcher>> {
        self.dispatchers
            .read()
            .expect("registry lock")
            .get(class)
            .cloned()
            .unwrap_or_default()
    }

    /// All classes with at least one dispatcher.
    pub fn registered_classes(&self) -> Vec<TypeUrl> {
        self.dispatchers
            .read()
            .expect("registry lock")
            .keys()
            .cloned()
            .collect()
    }
}
