//! Template hashing, revision lookup and creation of the next ObjectSet.

use kube::core::ObjectMeta;
use kube::{Resource, ResourceExt};
use tracing::info;

use pko_api::{create_as, get_as, list_as, ObjectApi};
use pko_core::apis::{
    gvk_of, LifecycleState, ObjectDeploymentKind, ObjectSetBody, ObjectSetKind, ObjectSetTemplate,
    PreviousRevisionReference,
};
use pko_core::hash::compute_hash;
use pko_core::meta::HASH_ANNOTATION;
use pko_ownership::{NativeStrategy, OwnerIdentity, OwnerStrategy};

use crate::Error;

/// Stable hash of a deployment template, salted with the collision counter.
pub fn template_hash(template: &ObjectSetTemplate, collision_count: Option<i32>) -> Result<String, serde_json::Error> {
    compute_hash(template, collision_count)
}

pub fn object_set_name(deployment: &str, hash: &str) -> String {
    format!("{}-{}", deployment, hash)
}

/// Revision number of a set: assigned in spec, or resolved into status.
pub(crate) fn revision_of<S: ObjectSetKind>(set: &S) -> Option<i64> {
    match set.body().revision {
        0 => set.status().and_then(|s| s.revision),
        r => Some(r),
    }
}

pub(crate) fn hash_of<S: Resource>(set: &S) -> Option<&str> {
    set.meta().annotations.as_ref()?.get(HASH_ANNOTATION).map(String::as_str)
}

pub(crate) fn is_archived<S: ObjectSetKind>(set: &S) -> bool {
    set.body().lifecycle_state == LifecycleState::Archived
}

/// ObjectSets selected by the deployment, oldest revision first.
/// `None` while some set has not resolved its revision yet.
pub(crate) async fn list_revisions<D: ObjectDeploymentKind>(
    api: &dyn ObjectApi,
    deployment: &D,
) -> Result<Option<Vec<D::ObjectSet>>, Error> {
    let gvk = gvk_of::<D::ObjectSet>();
    let namespace = deployment.namespace();
    let sets: Vec<D::ObjectSet> = list_as::<D::ObjectSet, _>(api, &gvk, namespace.as_deref(), &deployment.body().selector).await?;
    let mut numbered = Vec::with_capacity(sets.len());
    for set in sets {
        match revision_of(&set) {
            Some(r) => numbered.push((r, set)),
            None => return Ok(None),
        }
    }
    numbered.sort_by_key(|(r, _)| *r);
    Ok(Some(numbered.into_iter().map(|(_, s)| s).collect()))
}

/// The next ObjectSet for `deployment`, adopting from every set that is not archived.
pub(crate) fn new_object_set<D: ObjectDeploymentKind>(
    deployment: &D,
    hash: &str,
    revision: i64,
    existing: &[D::ObjectSet],
) -> Result<D::ObjectSet, Error> {
    let template = &deployment.body().template;
    let mut annotations = deployment.annotations().clone();
    annotations.extend(template.metadata.annotations.clone());
    annotations.insert(HASH_ANNOTATION.to_string(), hash.to_string());
    let mut meta = ObjectMeta {
        name: Some(object_set_name(&deployment.name_any(), hash)),
        namespace: deployment.namespace(),
        labels: Some(template.metadata.labels.clone()).filter(|l| !l.is_empty()),
        annotations: Some(annotations),
        ..Default::default()
    };
    NativeStrategy.set_controller_reference(&OwnerIdentity::of(deployment)?, &mut meta)?;

    let body = ObjectSetBody {
        lifecycle_state: LifecycleState::Active,
        previous: existing
            .iter()
            .filter(|s| !is_archived(*s))
            .map(|s| PreviousRevisionReference { name: s.name_any() })
            .collect(),
        revision,
        template: template.spec.clone(),
    };
    Ok(D::ObjectSet::from_parts(meta, body))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Creation {
    Created,
    /// The set exists already and is ours; the list was served from a stale cache.
    AlreadyCurrent,
    /// A foreign set holds the name; the hash needs a new salt.
    Collision,
}

pub(crate) async fn create_revision<D: ObjectDeploymentKind>(
    api: &dyn ObjectApi,
    deployment: &D,
    desired: &D::ObjectSet,
    hash: &str,
) -> Result<Creation, Error> {
    let err = match create_as(api, desired).await {
        Ok(created) => {
            info!(deployment = %deployment.name_any(), object_set = %created.name_any(), "created revision");
            return Ok(Creation::Created);
        }
        Err(e) if e.is_already_exists() => e,
        Err(e) => return Err(e.into()),
    };

    let gvk = gvk_of::<D::ObjectSet>();
    let name = desired.name_any();
    let Some(existing) = get_as::<D::ObjectSet, _>(api, &gvk, desired.namespace().as_deref(), &name).await? else {
        // Deleted between create and read; the next pass creates it again.
        return Err(err.into());
    };
    let owner = OwnerIdentity::of(deployment)?;
    if NativeStrategy.is_controller(&owner, existing.meta()) && hash_of(&existing) == Some(hash) {
        return Ok(Creation::AlreadyCurrent);
    }
    Ok(Creation::Collision)
}
