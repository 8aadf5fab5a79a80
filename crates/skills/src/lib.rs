//! Built-in skills.
//!
//! Two example domains ship with BeamLens: process-level runtime metrics
//! ([`ProcessSkill`]) and application-registered table statistics
//! ([`TableSkill`]). Deployments register additional skills at
//! configuration time; anything implementing `beamlens_core::Skill` works.

pub mod process;
pub mod tables;

pub use process::ProcessSkill;
pub use tables::{TableRegistry, TableSkill, TableStats, TableStatsSource};

use std::sync::Arc;

use beamlens_core::SkillRegistry;

/// A registry pre-loaded with the built-in skills.
pub fn default_registry() -> SkillRegistry {
    let mut registry = SkillRegistry::new();
    registry.register(Arc::new(ProcessSkill::new()));
    registry.register(Arc::new(TableSkill::new(Arc::new(TableRegistry::new()))));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use beamlens_core::SkillId;

    #[test]
    fn default_registry_has_builtins() {
        let registry = default_registry();
        assert!(registry.get(&SkillId::new("process")).is_some());
        assert!(registry.get(&SkillId::new("tables")).is_some());
        assert_eq!(registry.len(), 2);
    }
}
