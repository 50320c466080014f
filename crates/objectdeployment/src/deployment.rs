use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use metrics::counter;
use tracing::{debug, info, warn};

use pko_api::patch_status;
use pko_core::apis::{gvk_of, ObjectDeploymentKind};

use crate::archive::{garbage_collect, plan, retire};
use crate::revisions::{
    create_revision, hash_of, is_archived, list_revisions, new_object_set, revision_of, template_hash, Creation,
};
use crate::status::project;
use crate::{Context, Error, WAIT_RETRY};

/// Reconcile one ObjectDeployment or ClusterObjectDeployment.
pub async fn reconcile<D: ObjectDeploymentKind>(deployment: Arc<D>, ctx: Arc<Context>) -> Result<Action, Error> {
    let deployment = deployment.as_ref();
    if deployment.meta().deletion_timestamp.is_some() {
        // Revisions carry controller references and go with the deployment.
        return Ok(Action::await_change());
    }
    let api = ctx.api.as_ref();
    let gvk = gvk_of::<D>();
    let namespace = deployment.namespace();
    let name = deployment.name_any();
    let generation = deployment.meta().generation;
    let body = deployment.body();
    let mut status = deployment.status().cloned().unwrap_or_default();

    let hash = template_hash(&body.template, status.collision_count)?;
    status.template_hash = Some(hash.clone());

    let Some(mut sets) = list_revisions(api, deployment).await? else {
        debug!(%name, "waiting for revisions to report their number");
        patch_status(api, &gvk, namespace.as_deref(), &name, deployment.status(), &status).await?;
        return Ok(Action::requeue(WAIT_RETRY));
    };

    let current = sets.iter().rposition(|s| hash_of(s) == Some(hash.as_str()) && !is_archived(s));
    let mut action = Action::await_change();
    match current {
        Some(idx) => {
            // The current revision goes last, even when a rollback made it older than others.
            let current = sets.remove(idx);
            sets.push(current);
        }
        None if body.template.spec.phases.is_empty() => {
            info!(%name, "template has no phases, waiting for content");
        }
        None => {
            let revision = sets.iter().filter_map(revision_of).max().unwrap_or(0) + 1;
            let desired = new_object_set(deployment, &hash, revision, &sets)?;
            match create_revision(api, deployment, &desired, &hash).await? {
                Creation::Created => {}
                Creation::AlreadyCurrent => {
                    debug!(%name, %hash, "revision exists already, list was stale");
                    action = Action::requeue(WAIT_RETRY);
                }
                Creation::Collision => {
                    warn!(%name, %hash, "hash collision, bumping collision count");
                    counter!("objectdeployment_collisions_total", 1);
                    status.collision_count = Some(status.collision_count.unwrap_or(0) + 1);
                    action = Action::requeue(Duration::ZERO);
                }
            }
        }
    }

    if current.is_some() {
        for (i, step) in plan(&sets) {
            retire(api, &sets[i], step).await?;
        }
    }
    let (current, previous) = match (current, sets.split_last()) {
        (Some(_), Some((c, p))) => (Some(c), p),
        _ => (None, sets.as_slice()),
    };
    garbage_collect(api, previous, body.history_limit()).await?;

    project(&mut status, current, previous, generation);
    patch_status(api, &gvk, namespace.as_deref(), &name, deployment.status(), &status).await?;
    Ok(action)
}
