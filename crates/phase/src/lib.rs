//! Phase reconciler: applies the objects of one phase, adopts them from
//! previous revisions, maps their conditions and probes them.

#![forbid(unsafe_code)]

mod adoption;
mod preflight;

use std::sync::Arc;
use std::time::Duration;

use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use kube::Resource;
use metrics::counter;
use serde_json::Value;
use tracing::{debug, info};

use pko_api::{apply_merge, ApiError, ObjectApi, Propagation};
use pko_cache::{CacheError, ObjectWatcher};
use pko_core::apis::{ConditionMapping, ObjectSetObject, ObjectSetTemplatePhase, RemotePhaseReference, API_VERSION};
use pko_core::conditions::{reasons, set_condition, types};
use pko_core::meta::{CACHE_LABEL, CACHE_LABEL_VALUE, OWNERS_ANNOTATION, PACKAGE_INSTANCE_LABEL, PACKAGE_LABEL};
use pko_core::object::{gvk_of_dynamic, value_to_dynamic};
use pko_core::{Condition, ConditionStatus, ObjectKey};
use pko_ownership::{OwnerIdentity, OwnerStrategy, OwnershipError};
use pko_probing::Prober;

pub use adoption::{object_revision, set_object_revision};
pub use preflight::{PreflightError, Violation};

/// Requeue delay for errors that only clear once someone changes the cluster.
pub const MISCONFIGURATION_RETRY: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum PhaseError {
    #[error("refusing adoption, object {object} not owned by previous revision")]
    NotOwnedByPreviousRevision { object: String },
    #[error("refusing adoption, revision collision on {object}")]
    RevisionCollision { object: String },
    #[error(transparent)]
    Preflight(#[from] PreflightError),
    #[error("invalid object {object}: {reason}")]
    InvalidObject { object: String, reason: String },
    #[error("{context} {object}: {source}")]
    Api {
        context: &'static str,
        object: String,
        #[source]
        source: ApiError,
    },
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("{object}: {source}")]
    Ownership {
        object: String,
        #[source]
        source: OwnershipError,
    },
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PhaseError {
    pub fn is_adoption_refused(&self) -> bool {
        matches!(self, Self::NotOwnedByPreviousRevision { .. } | Self::RevisionCollision { .. })
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Api { source, .. } => source.is_retryable(),
            Self::Cache(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// The object a phase is reconciled on behalf of.
#[derive(Debug, Clone)]
pub struct PhaseOwner {
    pub identity: OwnerIdentity,
    pub labels: std::collections::BTreeMap<String, String>,
    pub generation: Option<i64>,
    pub revision: i64,
    /// Objects are observed and probed but never written.
    pub paused: bool,
}

impl PhaseOwner {
    pub fn new<K: Resource<DynamicType = ()>>(owner: &K, revision: i64, paused: bool) -> Result<Self, OwnershipError> {
        Ok(Self {
            identity: OwnerIdentity::of(owner)?,
            labels: owner.meta().labels.clone().unwrap_or_default(),
            generation: owner.meta().generation,
            revision,
            paused,
        })
    }
}

/// A revision objects may be adopted from, plus the phases it delegated.
#[derive(Debug, Clone)]
pub struct PreviousRevision {
    pub owner: OwnerIdentity,
    pub remote_phases: Vec<OwnerIdentity>,
}

impl PreviousRevision {
    pub fn new(owner: OwnerIdentity, remote_phases: &[RemotePhaseReference]) -> Self {
        let kind = if owner.kind.starts_with("Cluster") { "ClusterObjectSetPhase" } else { "ObjectSetPhase" };
        let remote_phases = remote_phases
            .iter()
            .map(|r| OwnerIdentity {
                api_version: API_VERSION.to_string(),
                kind: kind.to_string(),
                name: r.name.clone(),
                namespace: owner.namespace.clone(),
                uid: r.uid.clone(),
            })
            .collect();
        Self { owner, remote_phases }
    }
}

/// Probe failures of one phase, one entry per object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbingResult {
    pub phase: String,
    pub failures: Vec<String>,
}

impl ProbingResult {
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn without_phase(&self) -> String {
        self.failures.join(", ")
    }
}

impl std::fmt::Display for ProbingResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Phase {:?} failed: {}", self.phase, self.without_phase())
    }
}

#[derive(Debug, Clone, Default)]
pub struct PhaseOutcome {
    /// Live objects of the phase as last observed or written.
    pub objects: Vec<DynamicObject>,
    pub probing: ProbingResult,
    /// Conditions mapped from the objects, stamped with the owner generation.
    pub conditions: Vec<Condition>,
}

/// A phase object with system labels, namespace and revision applied.
#[derive(Debug, Clone)]
pub struct Desired {
    pub gvk: GroupVersionKind,
    /// `None` when the apiserver does not serve the kind.
    pub namespaced: Option<bool>,
    pub name: String,
    pub object: DynamicObject,
}

impl Desired {
    pub fn position(&self) -> String {
        ObjectKey::of(&self.gvk, self.object.metadata.namespace.as_deref(), &self.name).to_string()
    }

    fn namespace(&self) -> Option<&str> {
        self.object.metadata.namespace.as_deref()
    }
}

pub(crate) fn object_ref(obj: &DynamicObject) -> String {
    let gvk = gvk_of_dynamic(obj).unwrap_or_else(|| GroupVersionKind::gvk("", "", ""));
    ObjectKey::of(&gvk, obj.metadata.namespace.as_deref(), obj.metadata.name.as_deref().unwrap_or("")).to_string()
}

struct RecordingProbe<'a> {
    phase: &'a str,
    probe: &'a dyn Prober,
    failures: Vec<String>,
}

impl<'a> RecordingProbe<'a> {
    fn new(phase: &'a str, probe: &'a dyn Prober) -> Self {
        Self { phase, probe, failures: Vec::new() }
    }

    fn probe(&mut self, obj: &DynamicObject) -> Result<(), serde_json::Error> {
        let outcome = self.probe.probe(&serde_json::to_value(obj)?);
        if !outcome.success {
            self.record(obj, &outcome.message);
        }
        Ok(())
    }

    fn missing(&mut self, obj: &DynamicObject) {
        self.record(obj, "not found");
    }

    fn record(&mut self, obj: &DynamicObject, msg: &str) {
        let gvk = gvk_of_dynamic(obj).unwrap_or_else(|| GroupVersionKind::gvk("", "", ""));
        self.failures.push(format!(
            "{} {} {}/{}: {}",
            gvk.group,
            gvk.kind,
            obj.metadata.namespace.as_deref().unwrap_or(""),
            obj.metadata.name.as_deref().unwrap_or(""),
            msg
        ));
    }

    fn finish(self) -> ProbingResult {
        if self.failures.is_empty() {
            return ProbingResult::default();
        }
        ProbingResult { phase: self.phase.to_string(), failures: self.failures }
    }
}

/// Copies conditions of `obj` onto the owner under their mapped types.
/// Conditions computed for an older generation of `obj` are skipped.
pub fn map_conditions(mappings: &[ConditionMapping], obj: &DynamicObject, owner_generation: Option<i64>) -> Vec<Condition> {
    if mappings.is_empty() {
        return Vec::new();
    }
    let Some(raw) = obj.data.pointer("/status/conditions").and_then(Value::as_array) else {
        return Vec::new();
    };
    let generation = obj.metadata.generation.unwrap_or(0);
    let mut out = Vec::new();
    for cond in raw.iter().filter_map(|c| serde_json::from_value::<Condition>(c.clone()).ok()) {
        if matches!(cond.observed_generation, Some(g) if g != 0 && g != generation) {
            continue;
        }
        let Some(m) = mappings.iter().find(|m| m.source_type == cond.type_) else { continue };
        let mut mapped = Condition::new(m.destination_type.clone(), cond.status, cond.reason, cond.message)
            .with_generation(owner_generation);
        mapped.last_transition_time = cond.last_transition_time;
        set_condition(&mut out, mapped);
    }
    out
}

/// Stamps `Available=False` for errors that need a cluster change to clear.
/// Returns the requeue delay when the error was absorbed into status.
pub fn report_error(err: &PhaseError, conditions: &mut Vec<Condition>, generation: Option<i64>) -> Option<Duration> {
    let reason = match err {
        PhaseError::Preflight(_) => reasons::PREFLIGHT_ERROR,
        PhaseError::NotOwnedByPreviousRevision { .. } => reasons::CONFLICT,
        PhaseError::RevisionCollision { .. } => reasons::COLLISION_DETECTED,
        _ => return None,
    };
    set_condition(
        conditions,
        Condition::new(types::AVAILABLE, ConditionStatus::False, reason, err.to_string()).with_generation(generation),
    );
    Some(MISCONFIGURATION_RETRY)
}

/// Reconciles and tears down phases against one apiserver.
#[derive(Clone)]
pub struct PhaseReconciler {
    writer: Arc<dyn ObjectApi>,
    cache: Arc<dyn ObjectWatcher>,
    strategy: Arc<dyn OwnerStrategy>,
    force_adoption: bool,
}

impl PhaseReconciler {
    pub fn new(writer: Arc<dyn ObjectApi>, cache: Arc<dyn ObjectWatcher>, strategy: Arc<dyn OwnerStrategy>) -> Self {
        Self { writer, cache, strategy, force_adoption: false }
    }

    /// Adopt regardless of each object's collision protection.
    pub fn with_force_adoption(mut self, force: bool) -> Self {
        self.force_adoption = force;
        self
    }

    pub fn strategy(&self) -> &Arc<dyn OwnerStrategy> {
        &self.strategy
    }

    fn api_err<'a>(context: &'static str, d: &'a Desired) -> impl FnOnce(ApiError) -> PhaseError + 'a {
        move |source| PhaseError::Api { context, object: d.position(), source }
    }

    async fn desired(&self, owner: &PhaseOwner, spec: &ObjectSetObject) -> Result<Desired, PhaseError> {
        let invalid = |reason: &str| PhaseError::InvalidObject {
            object: format!(
                "{} {}",
                spec.object.get("kind").and_then(Value::as_str).unwrap_or("<unknown>"),
                spec.object.pointer("/metadata/name").and_then(Value::as_str).unwrap_or("<unnamed>")
            ),
            reason: reason.to_string(),
        };
        let mut object = value_to_dynamic(spec.object.clone()).map_err(|e| invalid(&e.to_string()))?;
        let gvk = gvk_of_dynamic(&object).ok_or_else(|| invalid("missing apiVersion or kind"))?;
        let name = object.metadata.name.clone().filter(|n| !n.is_empty()).ok_or_else(|| invalid("missing name"))?;

        let namespaced = match self.writer.is_namespaced(&gvk).await {
            Ok(n) => Some(n),
            Err(e) if e.is_not_found() => None,
            Err(source) => {
                return Err(PhaseError::Api { context: "resolving scope of", object: name, source });
            }
        };
        match namespaced {
            Some(false) => object.metadata.namespace = None,
            _ => {
                if object.metadata.namespace.as_deref().unwrap_or("").is_empty() {
                    object.metadata.namespace = owner.identity.namespace.clone();
                }
            }
        }

        let labels = object.metadata.labels.get_or_insert_with(Default::default);
        labels.insert(CACHE_LABEL.to_string(), CACHE_LABEL_VALUE.to_string());
        for key in [PACKAGE_LABEL, PACKAGE_INSTANCE_LABEL] {
            if let Some(v) = owner.labels.get(key) {
                labels.insert(key.to_string(), v.clone());
            }
        }
        set_object_revision(&mut object.metadata, owner.revision);

        Ok(Desired { gvk, namespaced, name, object })
    }

    /// Applies every object of `phase` and probes the result. Returns early
    /// with an error on the first object that cannot be reconciled.
    pub async fn reconcile_phase(
        &self,
        owner: &PhaseOwner,
        phase: &ObjectSetTemplatePhase,
        probe: &dyn Prober,
        previous: &[PreviousRevision],
    ) -> Result<PhaseOutcome, PhaseError> {
        let mut desired = Vec::with_capacity(phase.objects.len());
        for spec in &phase.objects {
            desired.push(self.desired(owner, spec).await?);
        }
        preflight::check_phase(owner, &phase.name, &desired)?;

        let mut rec = RecordingProbe::new(&phase.name, probe);
        let mut outcome = PhaseOutcome::default();
        for (spec, d) in phase.objects.iter().zip(&desired) {
            let Some(actual) = self.reconcile_object(owner, spec, d, previous).await? else {
                rec.missing(&d.object);
                continue;
            };
            if !owner.paused {
                for c in map_conditions(&spec.condition_mappings, &actual, owner.generation) {
                    set_condition(&mut outcome.conditions, c);
                }
            }
            rec.probe(&actual)?;
            outcome.objects.push(actual);
        }
        outcome.probing = rec.finish();
        Ok(outcome)
    }

    async fn reconcile_object(
        &self,
        owner: &PhaseOwner,
        spec: &ObjectSetObject,
        d: &Desired,
        previous: &[PreviousRevision],
    ) -> Result<Option<DynamicObject>, PhaseError> {
        let mut desired = d.object.clone();
        self.strategy
            .set_controller_reference(&owner.identity, &mut desired.metadata)
            .map_err(|source| PhaseError::Ownership { object: d.position(), source })?;
        self.cache.watch(&owner.identity, &d.gvk).await?;

        if owner.paused {
            return self.cache.get(&d.gvk, d.namespace(), &d.name).await.map_err(Self::api_err("reading", d));
        }

        let cached = self.cache.get(&d.gvk, d.namespace(), &d.name).await.map_err(Self::api_err("reading", d))?;
        let current = match cached {
            Some(obj) => Some(obj),
            None => self.writer.get(&d.gvk, d.namespace(), &d.name).await.map_err(Self::api_err("reading", d))?,
        };
        let current = match current {
            Some(obj) => obj,
            None => match self.writer.create(&desired).await {
                Ok(created) => {
                    debug!(object = %d.position(), owner = %owner.identity, "created object");
                    counter!("phase_objects_applied_total", 1, "action" => "create");
                    return Ok(Some(created));
                }
                Err(e) if e.is_already_exists() => {
                    // Created behind the cache's back; take the apiserver's copy.
                    let live = self.writer.get(&d.gvk, d.namespace(), &d.name).await.map_err(Self::api_err("reading", d))?;
                    live.ok_or_else(|| Self::api_err("creating", d)(e))?
                }
                Err(e) => return Err(Self::api_err("creating", d)(e)),
            },
        };

        let mut updated = current.clone();
        let adopt = adoption::needs_adoption(
            self.strategy.as_ref(),
            owner,
            &current,
            previous,
            spec.collision_protection,
            self.force_adoption,
        )?;
        if adopt {
            info!(object = %d.position(), owner = %owner.identity, "adopting object");
            counter!("phase_adoptions_total", 1);
            set_object_revision(&mut updated.metadata, owner.revision);
            self.strategy.release_controller(&mut updated.metadata);
            self.strategy
                .set_controller_reference(&owner.identity, &mut updated.metadata)
                .map_err(|source| PhaseError::Ownership { object: d.position(), source })?;
        }
        if !self.strategy.is_controller(&owner.identity, &updated.metadata) {
            // Handed over to a newer revision; observe only.
            return Ok(Some(current));
        }

        desired.metadata.owner_references = updated.metadata.owner_references.clone();
        if let Some(owners) = updated.metadata.annotations.as_ref().and_then(|a| a.get(OWNERS_ANNOTATION)) {
            desired
                .metadata
                .annotations
                .get_or_insert_with(Default::default)
                .insert(OWNERS_ANNOTATION.to_string(), owners.clone());
        }
        if let Some(m) = desired.data.as_object_mut() {
            m.remove("status");
        }

        let live = serde_json::to_value(&current)?;
        let mut merged = live.clone();
        apply_merge(&mut merged, &serde_json::to_value(&desired)?);
        if merged == live {
            return Ok(Some(current));
        }
        let patched = self.writer.apply(&desired).await.map_err(Self::api_err("patching", d))?;
        counter!("phase_objects_applied_total", 1, "action" => "patch");
        Ok(Some(patched))
    }

    /// Deletes the objects of `phase` this owner controls and drops its
    /// owner reference from objects that were handed over. Returns true once
    /// nothing is left to wait for.
    pub async fn teardown_phase(&self, owner: &PhaseOwner, phase: &ObjectSetTemplatePhase) -> Result<bool, PhaseError> {
        let mut done = 0;
        for spec in &phase.objects {
            if self.teardown_object(owner, spec).await? {
                done += 1;
            }
        }
        Ok(done == phase.objects.len())
    }

    async fn teardown_object(&self, owner: &PhaseOwner, spec: &ObjectSetObject) -> Result<bool, PhaseError> {
        let d = self.desired(owner, spec).await?;
        // Unserved kinds and foreign namespaces hold nothing of ours.
        if !preflight::check_object(owner, &d).is_empty() {
            return Ok(true);
        }
        self.cache.watch(&owner.identity, &d.gvk).await?;

        let Some(mut current) =
            self.writer.get(&d.gvk, d.namespace(), &d.name).await.map_err(Self::api_err("reading", &d))?
        else {
            return Ok(true);
        };

        if !self.strategy.is_controller(&owner.identity, &current.metadata) {
            if !self.strategy.is_owner(&owner.identity, &current.metadata) {
                return Ok(true);
            }
            self.strategy.remove_owner(&owner.identity, &mut current.metadata);
            self.writer.update(&current).await.map_err(Self::api_err("removing owner reference from", &d))?;
            return Ok(true);
        }

        info!(object = %d.position(), owner = %owner.identity, "deleting managed object");
        match self.writer.delete(&d.gvk, d.namespace(), &d.name, Propagation::Foreground).await {
            Ok(()) => Ok(false),
            Err(e) if e.is_not_found() => Ok(true),
            Err(e) => Err(Self::api_err("deleting", &d)(e)),
        }
    }
}
