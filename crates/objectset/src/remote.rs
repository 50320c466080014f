//! Phases delegated to ObjectSetPhase objects served by another controller.

use kube::core::ObjectMeta;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::info;

use pko_api::{create_as, get_as, ObjectApi, ObjectReader, Propagation};
use pko_core::apis::{
    gvk_of, ControlledObjectReference, LifecycleState, ObjectSetKind, ObjectSetPhaseBody, ObjectSetPhaseKind,
    ObjectSetStatus, ObjectSetTemplatePhase, RemotePhaseReference,
};
use pko_core::conditions::{find_condition, is_condition_true, reasons, remove_condition, set_condition, types};
use pko_core::{Condition, ConditionStatus};
use pko_ownership::{NativeStrategy, OwnerStrategy};
use pko_phase::{PhaseOwner, ProbingResult};

use crate::Error;

pub fn remote_phase_name(set: &str, phase: &str) -> String {
    format!("{}-{}", set, phase)
}

pub(crate) struct RemoteOutcome {
    pub controller_of: Vec<ControlledObjectReference>,
    pub probing: ProbingResult,
}

fn desired<K: ObjectSetKind>(set: &K, owner: &PhaseOwner, phase: &ObjectSetTemplatePhase, name: &str) -> Result<K::Phase, Error> {
    let mut meta = ObjectMeta {
        name: Some(name.to_string()),
        namespace: set.namespace(),
        labels: set.meta().labels.clone(),
        annotations: set.meta().annotations.clone(),
        ..Default::default()
    };
    // Phase objects always live next to their set, so native references work.
    NativeStrategy.set_controller_reference(&owner.identity, &mut meta)?;
    let body = ObjectSetPhaseBody {
        paused: owner.paused,
        revision: owner.revision,
        previous: set.body().previous.clone(),
        availability_probes: set.body().template.availability_probes.clone(),
        phase: phase.clone(),
    };
    Ok(K::Phase::from_parts(meta, body))
}

/// Ensures the ObjectSetPhase for `phase` exists and reads back its verdict.
pub(crate) async fn reconcile_remote<K: ObjectSetKind>(
    api: &dyn ObjectApi,
    set: &K,
    owner: &PhaseOwner,
    phase: &ObjectSetTemplatePhase,
    status: &mut ObjectSetStatus,
) -> Result<RemoteOutcome, Error> {
    let gvk = gvk_of::<K::Phase>();
    let name = remote_phase_name(&set.name_any(), &phase.name);
    let namespace = set.namespace();

    let current = match get_as::<K::Phase, _>(api, &gvk, namespace.as_deref(), &name).await? {
        Some(p) => p,
        None => {
            let created = create_as(api, &desired(set, owner, phase, &name)?).await?;
            info!(phase = %name, class = %phase.class, "created remote phase");
            created
        }
    };

    let reference = RemotePhaseReference { name: name.clone(), uid: current.uid().unwrap_or_default() };
    match status.remote_phases.iter_mut().find(|r| r.name == name) {
        Some(r) => *r = reference,
        None => status.remote_phases.push(reference),
    }

    if current.body().paused != owner.paused {
        api.patch_merge(&gvk, namespace.as_deref(), &name, &json!({ "spec": { "paused": owner.paused } })).await?;
    }

    let generation = current.meta().generation;
    let phase_status = current.status();
    let conditions = phase_status.map(|s| s.conditions.as_slice()).unwrap_or_default();
    let failure = match find_condition(conditions, types::AVAILABLE) {
        Some(c) if c.observed_generation == generation && c.is_true() => None,
        Some(c) if c.observed_generation == generation => Some(c.message.clone()),
        _ => Some("no status reported".to_string()),
    };
    Ok(RemoteOutcome {
        controller_of: phase_status.map(|s| s.controller_of.clone()).unwrap_or_default(),
        probing: ProbingResult { phase: phase.name.clone(), failures: failure.into_iter().collect() },
    })
}

/// Deletes the ObjectSetPhase of `phase`; true once it is gone.
pub(crate) async fn teardown_remote<K: ObjectSetKind>(
    api: &dyn ObjectApi,
    set: &K,
    phase: &ObjectSetTemplatePhase,
) -> Result<bool, Error> {
    let gvk = gvk_of::<K::Phase>();
    let name = remote_phase_name(&set.name_any(), &phase.name);
    let namespace = set.namespace();
    match api.get(&gvk, namespace.as_deref(), &name).await? {
        None => Ok(true),
        Some(obj) => {
            if obj.metadata.deletion_timestamp.is_none() {
                api.delete(&gvk, namespace.as_deref(), &name, Propagation::Foreground).await?;
            }
            Ok(false)
        }
    }
}

/// Paused is only reported once every delegated phase agrees with the set.
pub(crate) async fn report_paused<K: ObjectSetKind>(
    api: &dyn ObjectApi,
    set: &K,
    status: &mut ObjectSetStatus,
) -> Result<(), Error> {
    let want = set.body().lifecycle_state == LifecycleState::Paused;
    let generation = set.meta().generation;
    let gvk = gvk_of::<K::Phase>();
    let namespace = set.namespace();

    let mut unknown = false;
    let mut paused = 0;
    for r in &status.remote_phases {
        match get_as::<K::Phase, _>(api, &gvk, namespace.as_deref(), &r.name).await? {
            Some(p) => {
                if is_condition_true(p.status().map(|s| s.conditions.as_slice()).unwrap_or_default(), types::PAUSED) {
                    paused += 1;
                }
            }
            None => unknown = true,
        }
    }
    let expected = if want { status.remote_phases.len() } else { 0 };

    if unknown || paused != expected {
        set_condition(
            &mut status.conditions,
            Condition::new(types::PAUSED, ConditionStatus::Unknown, reasons::PARTIALLY_PAUSED, "Waiting for ObjectSetPhases.")
                .with_generation(generation),
        );
    } else if want {
        set_condition(
            &mut status.conditions,
            Condition::new(types::PAUSED, ConditionStatus::True, reasons::PAUSED, "Lifecycle state set to paused.")
                .with_generation(generation),
        );
    } else {
        remove_condition(&mut status.conditions, types::PAUSED);
    }
    Ok(())
}
