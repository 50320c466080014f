use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use metrics::counter;
use tracing::{debug, info, warn};

use pko_api::{ensure_finalizer, get_as, has_finalizer, patch_status, remove_finalizer, ObjectApi};
use pko_core::apis::{
    gvk_of, ControlledObjectReference, LifecycleState, ObjectSetKind, ObjectSetStatus, ObjectSetTemplatePhase,
    ObjectSlice,
};
use pko_core::conditions::{
    find_condition, is_condition_true, reasons, remove_condition, set_condition, sync_mapped_conditions, types,
};
use pko_core::meta::{CACHED_FINALIZER, ORPHAN_FINALIZER};
use pko_core::{Condition, ConditionStatus};
use pko_ownership::{OwnerIdentity, OwnerStrategy};
use pko_phase::{report_error, PhaseOwner, ProbingResult};

use crate::remote::{reconcile_remote, report_paused, teardown_remote};
use crate::revision::{load_previous, next_revision, previous_revisions};
use crate::{requeue_or_wait, Context, Error, WAIT_RETRY};

/// Reconcile one ObjectSet or ClusterObjectSet.
pub async fn reconcile<K: ObjectSetKind>(set: Arc<K>, ctx: Arc<Context>) -> Result<Action, Error> {
    let set = set.as_ref();
    let mut status = set.status().cloned().unwrap_or_default();
    if is_condition_true(&status.conditions, types::ARCHIVED) {
        return Ok(Action::await_change());
    }

    if set.meta().deletion_timestamp.is_some() || set.body().lifecycle_state == LifecycleState::Archived {
        return teardown(set, &ctx, status).await;
    }

    ensure_finalizer(ctx.api.as_ref(), &gvk_of::<K>(), set.meta(), CACHED_FINALIZER).await?;

    let previous = load_previous(ctx.api.as_ref(), set).await?;
    let Some(revision) = next_revision(set, &previous) else {
        debug!(name = %set.name_any(), "waiting for previous revisions to be numbered");
        return Ok(Action::requeue(WAIT_RETRY));
    };
    status.revision = Some(revision);

    let requeue = match reconcile_phases(set, &ctx, revision, &previous, &mut status).await {
        Ok(requeue) => requeue,
        Err(Error::Phase(e)) => match report_error(&e, &mut status.conditions, set.meta().generation) {
            Some(retry) => {
                warn!(name = %set.name_any(), error = %e, "phase rejected");
                Some(retry)
            }
            None => return Err(Error::Phase(e)),
        },
        Err(e) => return Err(e),
    };

    report_paused(ctx.api.as_ref(), set, &mut status).await?;
    patch_status(ctx.api.as_ref(), &gvk_of::<K>(), set.namespace().as_deref(), &set.name_any(), set.status(), &status)
        .await?;
    Ok(requeue_or_wait(requeue))
}

async fn reconcile_phases<K: ObjectSetKind>(
    set: &K,
    ctx: &Context,
    revision: i64,
    previous: &[K],
    status: &mut ObjectSetStatus,
) -> Result<Option<Duration>, Error> {
    let body = set.body();
    let generation = set.meta().generation;
    let owner = PhaseOwner::new(set, revision, body.lifecycle_state == LifecycleState::Paused)?;
    let previous = previous_revisions(previous)?;
    let phases = load_slices(ctx.api.as_ref(), set, true).await?;
    let probe = pko_probing::parse(&body.template.availability_probes)?;
    let strategy = ctx.phases.strategy();

    let mut controller_of = Vec::new();
    let mut mapped = Vec::new();
    let mut in_transition = false;
    let mut failed: Option<ProbingResult> = None;
    for phase in &phases {
        let probing = if phase.class.is_empty() {
            let outcome = ctx.phases.reconcile_phase(&owner, phase, probe.as_ref(), &previous).await?;
            for obj in &outcome.objects {
                if strategy.is_controller(&owner.identity, &obj.metadata) {
                    controller_of.push(ControlledObjectReference::of(obj));
                } else {
                    in_transition = true;
                }
            }
            mapped.extend(outcome.conditions);
            outcome.probing
        } else {
            let remote = reconcile_remote(ctx.api.as_ref(), set, &owner, phase, status).await?;
            controller_of.extend(remote.controller_of);
            remote.probing
        };
        if !probing.is_empty() {
            failed = Some(probing);
            break;
        }
    }

    controller_of.sort();
    controller_of.dedup();
    status.controller_of = controller_of;
    sync_mapped_conditions(&mut status.conditions, &mapped, generation);
    if in_transition {
        set_condition(
            &mut status.conditions,
            Condition::new(
                types::IN_TRANSITION,
                ConditionStatus::True,
                reasons::IN_TRANSITION,
                "Objects are being handed over to another revision.",
            )
            .with_generation(generation),
        );
    } else {
        remove_condition(&mut status.conditions, types::IN_TRANSITION);
    }

    if let Some(probing) = failed {
        set_condition(
            &mut status.conditions,
            Condition::new(types::AVAILABLE, ConditionStatus::False, reasons::PROBE_FAILURE, probing.to_string())
                .with_generation(generation),
        );
        return Ok(None);
    }

    set_condition(
        &mut status.conditions,
        Condition::new(types::AVAILABLE, ConditionStatus::True, reasons::AVAILABLE, "Object is available and passes all probes.")
            .with_generation(generation),
    );
    Ok(report_success(&mut status.conditions, body.template.success_delay_seconds, generation))
}

/// Marks the set Succeeded once Available held for `delay_seconds`.
/// Returns how much longer to wait otherwise.
fn report_success(conditions: &mut Vec<Condition>, delay_seconds: Option<i32>, generation: Option<i64>) -> Option<Duration> {
    if is_condition_true(conditions, types::SUCCEEDED) {
        return None;
    }
    let delay = Duration::from_secs(delay_seconds.unwrap_or(0).max(0) as u64);
    if !delay.is_zero() {
        let since = find_condition(conditions, types::AVAILABLE)
            .and_then(|c| c.last_transition_time.as_deref())
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok());
        let elapsed = match since {
            Some(t) => (Utc::now() - t.with_timezone(&Utc)).to_std().unwrap_or_default(),
            None => Duration::ZERO,
        };
        if elapsed < delay {
            return Some(delay - elapsed);
        }
    }
    set_condition(
        conditions,
        Condition::new(
            types::SUCCEEDED,
            ConditionStatus::True,
            reasons::AVAILABLE_ONCE,
            "Object was available once and passed all probes.",
        )
        .with_generation(generation),
    );
    None
}

/// Phases with the objects of their slices appended. Missing slices are an
/// error while reconciling and skipped during teardown.
async fn load_slices<K: ObjectSetKind>(
    api: &dyn ObjectApi,
    set: &K,
    required: bool,
) -> Result<Vec<ObjectSetTemplatePhase>, Error> {
    let gvk = ObjectSlice::gvk(K::NAMESPACED);
    let namespace = set.namespace();
    let mut phases = set.body().template.phases.clone();
    for phase in &mut phases {
        for name in std::mem::take(&mut phase.slices) {
            match get_as::<ObjectSlice, _>(api, &gvk, namespace.as_deref(), &name).await? {
                Some(slice) => phase.objects.extend(slice.objects),
                None if required => {
                    return Err(Error::SliceMissing { kind: ObjectSlice::slice_kind(K::NAMESPACED), name });
                }
                None => warn!(slice = %name, "slice gone, skipping its objects"),
            }
        }
    }
    Ok(phases)
}

/// Archival and deletion: tear phases down in reverse order, then release
/// the cache and the finalizer.
async fn teardown<K: ObjectSetKind>(set: &K, ctx: &Context, mut status: ObjectSetStatus) -> Result<Action, Error> {
    let gvk = gvk_of::<K>();
    let generation = set.meta().generation;
    let archived = set.body().lifecycle_state == LifecycleState::Archived && set.meta().deletion_timestamp.is_none();
    remove_condition(&mut status.conditions, types::AVAILABLE);

    let owns_objects = has_finalizer(set.meta(), CACHED_FINALIZER);
    let orphaned = has_finalizer(set.meta(), ORPHAN_FINALIZER);
    let done = !owns_objects || orphaned || teardown_phases(set, ctx, &status).await?;

    if !done {
        if archived {
            set_condition(
                &mut status.conditions,
                Condition::new(
                    types::ARCHIVED,
                    ConditionStatus::False,
                    reasons::ARCHIVAL_IN_PROGRESS,
                    "Object teardown in progress.",
                )
                .with_generation(generation),
            );
        }
        patch_status(ctx.api.as_ref(), &gvk, set.namespace().as_deref(), &set.name_any(), set.status(), &status).await?;
        return Ok(Action::requeue(WAIT_RETRY));
    }

    ctx.cache.free(&OwnerIdentity::of(set)?).await?;
    remove_finalizer(ctx.api.as_ref(), &gvk, set.meta(), CACHED_FINALIZER).await?;
    if archived {
        status.controller_of.clear();
        set_condition(
            &mut status.conditions,
            Condition::new(types::ARCHIVED, ConditionStatus::True, reasons::ARCHIVED, "Object is archived.")
                .with_generation(generation),
        );
        patch_status(ctx.api.as_ref(), &gvk, set.namespace().as_deref(), &set.name_any(), set.status(), &status).await?;
        info!(name = %set.name_any(), "archived");
        counter!("objectset_teardowns_total", 1, "outcome" => "archived");
    } else {
        info!(name = %set.name_any(), orphaned, "teardown complete");
        counter!("objectset_teardowns_total", 1, "outcome" => if orphaned { "orphaned" } else { "deleted" });
    }
    Ok(Action::await_change())
}

async fn teardown_phases<K: ObjectSetKind>(set: &K, ctx: &Context, status: &ObjectSetStatus) -> Result<bool, Error> {
    let revision = status.revision.unwrap_or(set.body().revision);
    let owner = PhaseOwner::new(set, revision, false)?;
    let phases = load_slices(ctx.api.as_ref(), set, false).await?;
    for phase in phases.iter().rev() {
        let done = if phase.class.is_empty() {
            ctx.phases.teardown_phase(&owner, phase).await?
        } else {
            teardown_remote(ctx.api.as_ref(), set, phase).await?
        };
        if !done {
            debug!(name = %set.name_any(), phase = %phase.name, "waiting for phase teardown");
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn available_since(secs_ago: i64) -> Vec<Condition> {
        let mut c = Condition::new(types::AVAILABLE, ConditionStatus::True, reasons::AVAILABLE, "");
        c.last_transition_time = Some((Utc::now() - chrono::Duration::seconds(secs_ago)).to_rfc3339());
        vec![c]
    }

    #[test]
    fn success_is_immediate_without_delay() {
        let mut conds = available_since(0);
        assert_eq!(report_success(&mut conds, None, Some(1)), None);
        assert!(is_condition_true(&conds, types::SUCCEEDED));
    }

    #[test]
    fn success_waits_for_delay() {
        let mut conds = available_since(10);
        let wait = report_success(&mut conds, Some(60), Some(1)).unwrap();
        assert!(wait > Duration::from_secs(40) && wait <= Duration::from_secs(50));
        assert!(find_condition(&conds, types::SUCCEEDED).is_none());

        let mut conds = available_since(120);
        assert_eq!(report_success(&mut conds, Some(60), Some(1)), None);
        assert!(is_condition_true(&conds, types::SUCCEEDED));
    }

    #[test]
    fn success_is_sticky() {
        let mut conds = available_since(0);
        report_success(&mut conds, None, Some(1));
        conds[0].status = ConditionStatus::False;
        assert_eq!(report_success(&mut conds, Some(600), Some(2)), None);
        assert!(is_condition_true(&conds, types::SUCCEEDED));
    }
}
