//! Schema registry interface.

use std::fmt;

use crate::signal::AnyPayload;

/// Constraint violations reported by schema validation.
#[derive(Clone, Debug, Default)]
pub struct Violations {
    pub messages: Vec<String>,
}

impl Violations {
    pub fn of(messages: Vec<String>) -> Self {
        Violations { messages }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl fmt::Display for Violations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.messages.join("; "))
    }
}

/// Validates payloads against their message schema.
///
/// Message typing and field metadata are external to the core; the bus
/// pipeline only calls `validate` before dispatch. The default
/// implementation accepts everything.
pub trait SchemaRegistry: Send + Sync {
    fn validate(&self, payload: &AnyPayload) -> Result<(), Violations>;
}

/// Registry that performs no validation.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoValidationSchemaRegistry;

impl SchemaRegistry for NoValidationSchemaRegistry {
    fn validate(&self, _payload: &AnyPayload) -> Result<(), Violations> {
        Ok(())
    }
}
