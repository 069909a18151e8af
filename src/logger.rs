use std::sync::Arc;

/// Hierarchical logger handed through the gateway. Each component gets a
/// child scoped by name; output goes through `tracing` so callers pick the
/// subscriber. Purely observational, no behavioral coupling.
#[derive(Clone, Debug)]
pub struct Logger {
    scope: Arc<str>,
}

impl Logger {
    pub fn new(name: &str) -> Self {
        Logger {
            scope: Arc::from(name),
        }
    }

    pub fn child(&self, name: &str) -> Logger {
        Logger {
            scope: Arc::from(format!("{} - {}", self.scope, name)),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn debug(&self, message: &str) {
        tracing::debug!(scope = %self.scope, "{}", message);
    }

    pub fn info(&self, message: &str) {
        tracing::info!(scope = %self.scope, "{}", message);
    }

    pub fn error(&self, message: &str) {
        tracing::error!(scope = %self.scope, "{}", message);
    }
}

impl Default for Logger {
    fn default() -> Self {
        Logger::new("meshgate")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_scopes_nest() {
        let root = Logger::new("meshgate");
        let child = root.child("sources").child("users");
        assert_eq!(child.scope(), "meshgate - sources - users");
    }
}
