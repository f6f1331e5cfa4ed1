//! Routing tables: message class → target entity ids.
//!
//! A repository owns one routing table per signal family it consumes.
//! Command routing is unicast (exactly one target per signal); event and
//! rejection routing are multicast (zero or many targets). Both tables
//! hold one function per message class plus a default fallback.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use crate::entity::EntityId;
use crate::model::{CommandContext, EventContext};
use crate::signal::{Signal, SignalMessage, TypeUrl};

/// Result type for routing operations.
pub type Result<T> = std::result::Result<T, RoutingError>;

/// Errors raised by routing tables.
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("a route for `{0}` is already set")]
    DuplicateRoute(TypeUrl),

    #[error("no route is set for `{0}`")]
    RouteNotFound(TypeUrl),

    #[error("routing `{class}` failed: {message}")]
    RouteFailed { class: TypeUrl, message: String },
}

type CommandRouteFn = dyn Fn(&Signal) -> Option<EntityId> + Send + Sync;
type EventRouteFn = dyn Fn(&Signal) -> BTreeSet<EntityId> + Send + Sync;

/// Routing table for commands: every signal resolves to exactly one id.
pub struct CommandRouting {
    routes: RwLock<HashMap<TypeUrl, Arc<CommandRouteFn>>>,
    default_route: Arc<CommandRouteFn>,
}

impl CommandRouting {
    /// A table with the given default route.
    pub fn with_default<F>(default_route: F) -> Self
    where
        F: Fn(&Signal) -> Option<EntityId> + Send + Sync + 'static,
    {
        CommandRouting {
            routes: RwLock::new(HashMap::new()),
            default_route: Arc::new(default_route),
        }
    }

    /// A table whose default reads the target id from a payload field.
    ///
    /// String and integer field values become string and integer ids; any
    /// other shape fails the route.
    pub fn by_id_field(field: impl Into<String>) -> Self {
        let field = field.into();
        Self::with_default(move |signal: &Signal| {
            let value: serde_json::Value = serde_json::from_slice(&signal.payload.value).ok()?;
            match value.get(&field)? {
                serde_json::Value::String(s) => Some(EntityId::Str(s.clone())),
                serde_json::Value::Number(n) => n.as_i64().map(EntityId::Int),
                _ => None,
            }
        })
    }

    /// Set a typed route for one command class.
    pub fn route<C, F>(&self, route: F) -> Result<()>
    where
        C: SignalMessage,
        F: Fn(&C, &CommandContext<'_>) -> EntityId + Send + Sync + 'static,
    {
        let class = TypeUrl::of::<C>();
        let erased: Arc<CommandRouteFn> = Arc::new(move |signal: &Signal| {
            let message: C = signal.payload.unpack().ok()?;
            Some(route(&message, &CommandContext::new(signal)))
        });
        let mut routes = self.routes.write().expect("routing table lock");
        if routes.contains_key(&class) {
            return Err(RoutingError::DuplicateRoute(class));
        }
        routes.insert(class, erased);
        Ok(())
    }

    /// Remove the route of a command class.
    pub fn remove(&self, class: &TypeUrl) -> Result<()> {
        let mut routes = self.routes.write().expect("routing table lock");
        routes
            .remove(class)
            .map(drop)
            .ok_or_else(|| RoutingError::RouteNotFound(class.clone()))
    }

    /// Resolve the single target of a command.
    pub fn apply(&self, signal: &Signal) -> Result<EntityId> {
        let class = signal.message_class().clone();
        let route = {
            let routes = self.routes.read().expect("routing table lock");
            routes.get(&class).cloned()
        };
        let target = match route {
            Some(route) => route(signal),
            None => (self.default_route)(signal),
        };
        target.ok_or(RoutingError::RouteFailed {
            class,
            message: "command routing returned no target".to_string(),
        })
    }
}

/// Routing table for events and rejections: zero or many targets.
pub struct EventRouting {
    routes: RwLock<HashMap<TypeUrl, Arc<EventRouteFn>>>,
    default_route: Arc<EventRouteFn>,
}

impl EventRouting {
    /// A table with the given default route.
    pub fn with_default<F>(default_route: F) -> Self
    where
        F: Fn(&Signal) -> BTreeSet<EntityId> + Send + Sync + 'static,
    {
        EventRouting {
            routes: RwLock::new(HashMap::new()),
            default_route: Arc::new(default_route),
        }
    }

    /// A table whose default routes every event to its producer.
    ///
    /// Events without a producer route nowhere, meaning the repository
    /// ignores them.
    pub fn by_producer() -> Self {
        Self::with_default(|signal: &Signal| {
            signal
                .context
                .producer
                .iter()
                .cloned()
                .collect::<BTreeSet<_>>()
        })
    }

    /// Set a typed route for one event class.
    pub fn route<E, F>(&self, route: F) -> Result<()>
    where
        E: SignalMessage,
        F: Fn(&E, &EventContext<'_>) -> BTreeSet<EntityId> + Send + Sync + 'static,
    {
        let class = TypeUrl::of::<E>();
        let erased: Arc<EventRouteFn> = Arc::new(move |signal: &Signal| {
            match signal.payload.unpack::<E>() {
                Ok(message) => route(&message, &EventContext::new(signal)),
                Err(_) => BTreeSet::new(),
            }
        });
        let mut routes = self.routes.write().expect("routing table lock");
        if routes.contains_key(&class) {
            return Err(RoutingError::DuplicateRoute(class));
        }
        routes.insert(class, erased);
        Ok(())
    }

    /// Remove the route of an event class.
    pub fn remove(&self, class: &TypeUrl) -> Result<()> {
        let mut routes = self.routes.write().expect("routing table lock");
        routes
            .remove(class)
            .map(drop)
            .ok_or_else(|| RoutingError::RouteNotFound(class.clone()))
    }

    /// Resolve the targets of an event. An empty set means this
    /// repository ignores the signal.
    pub fn apply(&self, signal: &Signal) -> BTreeSet<EntityId> {
        let route = {
            let routes = self.routes.read().expect("routing table lock");
            routes.get(signal.message_class()).cloned()
        };
        match route {
            Some(route) => route(signal),
            None => (self.default_route)(signal),
        }
    }
}

/// Convenience: a one-element target set.
pub fn one(id: impl Into<EntityId>) -> BTreeSet<EntityId> {
    let mut set = BTreeSet::new();
    set.insert(id.into());
    set
}

#[cfg(test)]
mod tests;
