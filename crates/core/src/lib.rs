//! Package operator core types: CRDs, conditions, hashing, label selectors and JSON paths

#![forbid(unsafe_code)]

pub mod apis;
pub mod conditions;
pub mod gotemplate;
pub mod hash;
pub mod jsonpath;
pub mod object;
pub mod selector;
pub mod template;

pub use conditions::{Condition, ConditionStatus};
pub use object::ObjectKey;
pub use selector::LabelSelector;

/// Labels, annotations and finalizers shared across controllers.
pub mod meta {
    /// Marks objects the dynamic cache informers should see.
    pub const CACHE_LABEL: &str = "package-operator.run/cache";
    pub const CACHE_LABEL_VALUE: &str = "True";
    /// Manifest name of the package an object belongs to.
    pub const PACKAGE_LABEL: &str = "package-operator.run/package";
    /// Name of the Package instance an object belongs to.
    pub const PACKAGE_INSTANCE_LABEL: &str = "package-operator.run/instance";

    /// Revision of the ObjectSet that last wrote an object.
    pub const REVISION_ANNOTATION: &str = "package-operator.run/revision";
    /// Template hash on ObjectSets created by an ObjectDeployment.
    pub const HASH_ANNOTATION: &str = "package-operator.run/hash";
    /// JSON envelope of owner references used across cluster boundaries.
    pub const OWNERS_ANNOTATION: &str = "package-operator.run/owners";
    /// Phase a rendered package object is assigned to.
    pub const PHASE_ANNOTATION: &str = "package-operator.run/phase";
    pub const COLLISION_PROTECTION_ANNOTATION: &str = "package-operator.run/collision-protection";
    /// Newline separated `Source => dest/Type` condition mappings.
    pub const CONDITION_MAP_ANNOTATION: &str = "package-operator.run/condition-map";
    pub const CHUNKING_STRATEGY_ANNOTATION: &str = "packages.package-operator.run/chunking-strategy";
    /// Image the ObjectDeployment of a Package was rendered from.
    pub const PACKAGE_SOURCE_IMAGE_ANNOTATION: &str = "packages.package-operator.run/image";
    /// Rendering configuration of the Package, as JSON.
    pub const PACKAGE_CONFIG_ANNOTATION: &str = "packages.package-operator.run/config";

    /// Keeps an owner around until its dynamic cache watches are released.
    pub const CACHED_FINALIZER: &str = "package-operator.run/cached";
    /// Set by the apiserver for `propagationPolicy=Orphan` deletions.
    pub const ORPHAN_FINALIZER: &str = "orphan";
}

/// Environment variables consumed by the manager and the package pipeline.
pub mod env {
    pub const NAMESPACE: &str = "PKO_NAMESPACE";
    pub const IMAGE: &str = "PKO_IMAGE";
    pub const REMOTE_PHASE_PACKAGE_IMAGE: &str = "PKO_REMOTE_PHASE_PACKAGE_IMAGE";
    pub const TEST_STUB_IMAGE: &str = "PKO_TEST_STUB_IMAGE";
    pub const IMAGE_REGISTRY: &str = "PKO_IMAGE_REGISTRY";
    pub const REGISTRY_HOST_OVERRIDES: &str = "PKO_REGISTRY_HOST_OVERRIDES";
    /// Any non-empty value lets every phase adopt objects regardless of collision protection.
    pub const FORCE_ADOPTION: &str = "PKO_FORCE_ADOPTION";
    pub const DEFAULT_NAMESPACE: &str = "package-operator-system";
}

/// Field manager used for server-side apply.
pub const FIELD_OWNER: &str = "package-operator";
