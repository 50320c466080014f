//! Revision numbering and lookup of the revisions a set may adopt from.

use kube::ResourceExt;

use pko_api::{get_as, ObjectApi};
use pko_core::apis::{gvk_of, ObjectSetKind};
use pko_ownership::OwnerIdentity;
use pko_phase::PreviousRevision;

use crate::Error;

/// Revision of `set`: the spec value when assigned, the recorded one when
/// already resolved, otherwise one past the newest previous revision.
/// `None` while a previous revision has not resolved its own number yet.
pub fn next_revision<K: ObjectSetKind>(set: &K, previous: &[K]) -> Option<i64> {
    let spec = set.body().revision;
    if spec != 0 {
        return Some(spec);
    }
    if let Some(r) = set.status().and_then(|s| s.revision) {
        return Some(r);
    }
    let mut latest = 0;
    for prev in previous {
        latest = latest.max(prev.status().and_then(|s| s.revision)?);
    }
    Some(latest + 1)
}

/// Previous revisions that still exist; deleted ones are skipped.
pub(crate) async fn load_previous<K: ObjectSetKind>(api: &dyn ObjectApi, set: &K) -> Result<Vec<K>, Error> {
    let gvk = gvk_of::<K>();
    let namespace = set.namespace();
    let mut out = Vec::with_capacity(set.body().previous.len());
    for prev in &set.body().previous {
        if let Some(obj) = get_as::<K, _>(api, &gvk, namespace.as_deref(), &prev.name).await? {
            out.push(obj);
        }
    }
    Ok(out)
}

pub(crate) fn previous_revisions<K: ObjectSetKind>(previous: &[K]) -> Result<Vec<PreviousRevision>, Error> {
    previous
        .iter()
        .map(|p| -> Result<PreviousRevision, Error> {
            let remote = p.status().map(|s| s.remote_phases.as_slice()).unwrap_or_default();
            Ok(PreviousRevision::new(OwnerIdentity::of(p)?, remote))
        })
        .collect()
}
