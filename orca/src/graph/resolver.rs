//! Registry mapping stage type keys to definitions.

use super::StageDefinitionBuilder;
use crate::errors::GraphValidationError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Resolves stage types, including aliases, to their definitions.
#[derive(Default)]
pub struct StageResolver {
    builders: RwLock<HashMap<String, Arc<dyn StageDefinitionBuilder>>>,
}

impl std::fmt::Debug for StageResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageResolver")
            .field("types", &self.types())
            .finish()
    }
}

impl StageResolver {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a definition under its type and aliases.
    ///
    /// Fails without registering anything if any key is already taken.
    pub fn register(&self, builder: Arc<dyn StageDefinitionBuilder>) -> Result<(), GraphValidationError> {
        let mut keys = vec![builder.stage_type().to_string()];
        keys.extend(builder.aliases());

        let mut builders = self.builders.write();
        if let Some(taken) = keys.iter().find(|key| builders.contains_key(key.as_str())) {
            return Err(GraphValidationError::new(format!(
                "Stage type '{taken}' is already registered"
            ))
            .with_stages(vec![taken.clone()])
            .with_code("GRAPH-DUPLICATE-TYPE"));
        }
        for key in keys {
            builders.insert(key, Arc::clone(&builder));
        }
        Ok(())
    }

    /// Looks up the definition for a stage type.
    pub fn resolve(&self, stage_type: &str) -> Result<Arc<dyn StageDefinitionBuilder>, GraphValidationError> {
        self.builders
            .read()
            .get(stage_type)
            .cloned()
            .ok_or_else(|| GraphValidationError::unknown_stage_type(stage_type))
    }

    /// Returns true if the type or alias is registered.
    #[must_use]
    pub fn contains(&self, stage_type: &str) -> bool {
        self.builders.read().contains_key(stage_type)
    }

    /// All registered keys, sorted.
    #[must_use]
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.builders.read().keys().cloned().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str, Vec<String>);

    impl StageDefinitionBuilder for Named {
        fn stage_type(&self) -> &str {
            self.0
        }

        fn aliases(&self) -> Vec<String> {
            self.1.clone()
        }
    }

    #[test]
    fn test_register_and_resolve_alias() {
        let resolver = StageResolver::new();
        resolver
            .register(Arc::new(Named("shrinkCluster", vec!["shrink".into()])))
            .unwrap();

        assert_eq!(resolver.resolve("shrink").unwrap().stage_type(), "shrinkCluster");
        assert!(resolver.contains("shrinkCluster"));
        assert_eq!(resolver.types(), vec!["shrink".to_string(), "shrinkCluster".to_string()]);
    }

    #[test]
    fn test_unknown_type() {
        let err = StageResolver::new().resolve("nope").err().unwrap();
        assert_eq!(err.code.as_deref(), Some("GRAPH-UNKNOWN-TYPE"));
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let resolver = StageResolver::new();
        resolver.register(Arc::new(Named("wait", vec![]))).unwrap();
        let err = resolver
            .register(Arc::new(Named("pause", vec!["wait".into()])))
            .unwrap_err();
        assert_eq!(err.code.as_deref(), Some("GRAPH-DUPLICATE-TYPE"));
        assert!(!resolver.contains("pause"));
    }
}
