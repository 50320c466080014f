//! Retiring superseded revisions.
//!
//! A revision is only archived after it has been paused and reports so,
//! which keeps it from fighting its successor over objects in between. Once
//! the newest revision is available every older one is retired; until then
//! an intermediate revision is retired only when it no longer controls
//! anything its successor wants.

use std::collections::BTreeSet;

use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::info;

use pko_api::{ObjectApi, Propagation};
use pko_core::apis::{gvk_of, LifecycleState, ObjectSetKind};
use pko_core::conditions::{is_condition_true, types};
use pko_core::object::gvk_of_value;

use crate::revisions::is_archived;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Retire {
    Pause,
    Archive,
}

/// (group, kind, namespace, name)
type ObjectId = (String, String, Option<String>, String);

fn is_available<S: ObjectSetKind>(set: &S) -> bool {
    set.status().map_or(false, |s| is_condition_true(&s.conditions, types::AVAILABLE))
}

fn is_paused<S: ObjectSetKind>(set: &S) -> bool {
    set.status().map_or(false, |s| is_condition_true(&s.conditions, types::PAUSED))
}

/// Objects a set declares inline.
fn declared_objects<S: ObjectSetKind>(set: &S) -> BTreeSet<ObjectId> {
    let default_ns = set.namespace();
    let mut out = BTreeSet::new();
    for phase in &set.body().template.phases {
        for o in &phase.objects {
            let Some(gvk) = gvk_of_value(&o.object) else { continue };
            let meta = &o.object["metadata"];
            let name = meta["name"].as_str().unwrap_or_default().to_string();
            let namespace = meta["namespace"].as_str().map(str::to_string).or_else(|| default_ns.clone());
            out.insert((gvk.group, gvk.kind, namespace, name));
        }
    }
    out
}

/// Objects a set reports to control. `None` until it has reported at all.
fn controlled_objects<S: ObjectSetKind>(set: &S) -> Option<BTreeSet<ObjectId>> {
    if is_archived(set) {
        return Some(BTreeSet::new());
    }
    let status = set.status().filter(|s| s.revision.is_some())?;
    Some(
        status
            .controller_of
            .iter()
            .map(|r| (r.group.clone(), r.kind.clone(), r.namespace.clone(), r.name.clone()))
            .collect(),
    )
}

fn retire_step<S: ObjectSetKind>(set: &S) -> Option<Retire> {
    if is_paused(set) {
        Some(Retire::Archive)
    } else if set.body().lifecycle_state == LifecycleState::Paused {
        None
    } else {
        Some(Retire::Pause)
    }
}

fn can_retire<S: ObjectSetKind>(previous: &S, successor: &S) -> bool {
    let Some(controlled) = controlled_objects(previous) else { return false };
    let wanted = declared_objects(successor);
    controlled.is_disjoint(&wanted) && !is_available(previous)
}

/// Steps for the revisions in `sets` that are due for retirement, as
/// indices into `sets`. `sets` runs from oldest to the current revision.
pub(crate) fn plan<S: ObjectSetKind>(sets: &[S]) -> Vec<(usize, Retire)> {
    let mut out = Vec::new();
    for j in (0..sets.len()).rev() {
        let latest = &sets[j];
        if is_available(latest) {
            for (i, older) in sets[..j].iter().enumerate() {
                if is_archived(older) {
                    continue;
                }
                if let Some(step) = retire_step(older) {
                    out.push((i, step));
                }
            }
            break;
        }
        if j == 0 {
            break;
        }
        let previous = &sets[j - 1];
        if is_archived(previous) || !can_retire(previous, latest) {
            continue;
        }
        if let Some(step) = retire_step(previous) {
            out.push((j - 1, step));
        }
    }
    out.sort_by_key(|(i, _)| *i);
    out
}

pub(crate) async fn retire<S: ObjectSetKind>(api: &dyn ObjectApi, set: &S, step: Retire) -> Result<(), Error> {
    let state = match step {
        Retire::Pause => LifecycleState::Paused,
        Retire::Archive => LifecycleState::Archived,
    };
    let patch = json!({
        "metadata": { "resourceVersion": set.meta().resource_version },
        "spec": { "lifecycleState": state },
    });
    api.patch_merge(&gvk_of::<S>(), set.namespace().as_deref(), &set.name_any(), &patch).await?;
    info!(object_set = %set.name_any(), ?state, "retiring revision");
    Ok(())
}

fn reports_archived<S: ObjectSetKind>(set: &S) -> bool {
    set.status().map_or(false, |s| is_condition_true(&s.conditions, types::ARCHIVED))
}

/// Deletes the oldest archived revisions beyond `limit`. Only revisions that
/// report the archival as done count, so objects are never torn down while
/// a revision is still handing them over.
pub(crate) async fn garbage_collect<S: ObjectSetKind>(api: &dyn ObjectApi, sets: &[S], limit: usize) -> Result<usize, Error> {
    let archived: Vec<&S> = sets
        .iter()
        .filter(|s| is_archived(*s) && reports_archived(*s) && s.meta().deletion_timestamp.is_none())
        .collect();
    let excess = archived.len().saturating_sub(limit);
    for set in archived.into_iter().take(excess) {
        match api.delete(&gvk_of::<S>(), set.namespace().as_deref(), &set.name_any(), Propagation::Background).await {
            Ok(()) => info!(object_set = %set.name_any(), "deleted archived revision"),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(excess)
}
