//! Serves ObjectSetPhases of one class, either against the local apiserver
//! or against a target cluster with annotation based ownership.

use std::sync::Arc;

use kube::core::GroupVersionKind;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use pko_api::{ensure_finalizer, has_finalizer, patch_status, remove_finalizer, ObjectApi, ObjectReader};
use pko_cache::ObjectWatcher;
use pko_core::apis::{gvk_of, ControlledObjectReference, ObjectSetPhaseKind, RemotePhaseReference, GROUP, VERSION};
use pko_core::conditions::{reasons, remove_condition, set_condition, types};
use pko_core::meta::CACHED_FINALIZER;
use pko_core::{Condition, ConditionStatus};
use pko_ownership::{OwnerIdentity, OwnerStrategy};
use pko_phase::{report_error, PhaseOwner, PhaseReconciler, PreviousRevision};

use crate::{requeue_or_wait, Error, WAIT_RETRY};

pub struct PhaseContext {
    /// Client for the ObjectSetPhases and the ObjectSets they name as previous.
    pub api: Arc<dyn ObjectApi>,
    /// Cache of the cluster the phase objects are written to.
    pub cache: Arc<dyn ObjectWatcher>,
    pub phases: PhaseReconciler,
    pub class: String,
}

fn object_set_gvk(namespaced: bool) -> GroupVersionKind {
    GroupVersionKind::gvk(GROUP, VERSION, if namespaced { "ObjectSet" } else { "ClusterObjectSet" })
}

async fn previous_revisions<P: ObjectSetPhaseKind>(api: &dyn ObjectApi, phase: &P) -> Result<Vec<PreviousRevision>, Error> {
    let gvk = object_set_gvk(P::NAMESPACED);
    let namespace = phase.namespace();
    let mut out = Vec::new();
    for prev in &phase.body().previous {
        let Some(obj) = api.get(&gvk, namespace.as_deref(), &prev.name).await? else { continue };
        let remote: Vec<RemotePhaseReference> = match obj.data.pointer("/status/remotePhases") {
            Some(v) => serde_json::from_value(v.clone())?,
            None => Vec::new(),
        };
        out.push(PreviousRevision::new(OwnerIdentity::of_dynamic(&obj)?, &remote));
    }
    Ok(out)
}

/// Reconcile one ObjectSetPhase or ClusterObjectSetPhase.
pub async fn reconcile_phase<P: ObjectSetPhaseKind>(phase: Arc<P>, ctx: Arc<PhaseContext>) -> Result<Action, Error> {
    let phase = phase.as_ref();
    let body = phase.body();
    if body.phase.class != ctx.class {
        return Ok(Action::await_change());
    }
    let gvk = gvk_of::<P>();
    let generation = phase.meta().generation;
    let owner = PhaseOwner::new(phase, body.revision, body.paused)?;

    if phase.meta().deletion_timestamp.is_some() {
        if has_finalizer(phase.meta(), CACHED_FINALIZER) {
            if !ctx.phases.teardown_phase(&owner, &body.phase).await? {
                debug!(name = %phase.name_any(), "waiting for phase teardown");
                return Ok(Action::requeue(WAIT_RETRY));
            }
            ctx.cache.free(&owner.identity).await?;
            remove_finalizer(ctx.api.as_ref(), &gvk, phase.meta(), CACHED_FINALIZER).await?;
            info!(name = %phase.name_any(), "phase torn down");
        }
        return Ok(Action::await_change());
    }

    ensure_finalizer(ctx.api.as_ref(), &gvk, phase.meta(), CACHED_FINALIZER).await?;

    let mut status = phase.status().cloned().unwrap_or_default();
    let previous = previous_revisions(ctx.api.as_ref(), phase).await?;
    let probe = pko_probing::parse(&body.availability_probes)?;

    let requeue = match ctx.phases.reconcile_phase(&owner, &body.phase, probe.as_ref(), &previous).await {
        Ok(outcome) => {
            let strategy = ctx.phases.strategy();
            let mut controller_of: Vec<ControlledObjectReference> = outcome
                .objects
                .iter()
                .filter(|o| strategy.is_controller(&owner.identity, &o.metadata))
                .map(ControlledObjectReference::of)
                .collect();
            controller_of.sort();
            status.controller_of = controller_of;
            pko_core::conditions::sync_mapped_conditions(&mut status.conditions, &outcome.conditions, generation);
            let available = if outcome.probing.is_empty() {
                Condition::new(types::AVAILABLE, ConditionStatus::True, reasons::AVAILABLE, "Object is available and passes all probes.")
            } else {
                Condition::new(types::AVAILABLE, ConditionStatus::False, reasons::PROBE_FAILURE, outcome.probing.without_phase())
            };
            set_condition(&mut status.conditions, available.with_generation(generation));
            None
        }
        Err(e) => match report_error(&e, &mut status.conditions, generation) {
            Some(retry) => Some(retry),
            None => return Err(e.into()),
        },
    };

    if body.paused {
        set_condition(
            &mut status.conditions,
            Condition::new(types::PAUSED, ConditionStatus::True, reasons::PAUSED, "Lifecycle state set to paused.")
                .with_generation(generation),
        );
    } else {
        remove_condition(&mut status.conditions, types::PAUSED);
    }

    patch_status(ctx.api.as_ref(), &gvk, phase.namespace().as_deref(), &phase.name_any(), phase.status(), &status).await?;
    Ok(requeue_or_wait(requeue))
}
