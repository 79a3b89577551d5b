//! Workspace metadata resolution.
//!
//! The manager asks an injected resolver for a workspace's working
//! directory and display name when a session request leaves them out.
//! Resolution failing or returning nothing is normal; sessions then
//! inherit the daemon's defaults.

use std::collections::HashMap;

/// Metadata a resolver can supply for one workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkspaceContext {
    pub cwd: Option<String>,
    pub name: Option<String>,
}

pub trait WorkspaceResolver: Send + Sync {
    fn resolve(&self, workspace_id: &str) -> WorkspaceContext;
}

/// Resolver that knows nothing. The default for embedders without a
/// workspace model.
pub struct NullResolver;

impl WorkspaceResolver for NullResolver {
    fn resolve(&self, _workspace_id: &str) -> WorkspaceContext {
        WorkspaceContext::default()
    }
}

/// Fixed table of workspace metadata.
pub struct StaticResolver {
    contexts: HashMap<String, WorkspaceContext>,
}

impl StaticResolver {
    pub fn new(contexts: HashMap<String, WorkspaceContext>) -> Self {
        Self { contexts }
    }

    pub fn single(workspace_id: &str, context: WorkspaceContext) -> Self {
        let mut contexts = HashMap::new();
        contexts.insert(workspace_id.to_string(), context);
        Self { contexts }
    }
}

impl WorkspaceResolver for StaticResolver {
    fn resolve(&self, workspace_id: &str) -> WorkspaceContext {
        self.contexts.get(workspace_id).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_resolver_returns_nothing() {
        let context = NullResolver.resolve("ws-1");
        assert_eq!(context, WorkspaceContext::default());
    }

    #[test]
    fn static_resolver_returns_known_and_defaults_unknown() {
        let resolver = StaticResolver::single(
            "ws-1",
            WorkspaceContext {
                cwd: Some("/srv/project".to_string()),
                name: Some("project".to_string()),
            },
        );

        assert_eq!(
            resolver.resolve("ws-1").cwd.as_deref(),
            Some("/srv/project")
        );
        assert_eq!(resolver.resolve("ws-unknown"), WorkspaceContext::default());
    }
}
