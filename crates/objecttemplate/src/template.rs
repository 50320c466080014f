use std::sync::Arc;

use kube::api::DynamicObject;
use kube::core::ObjectMeta;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use metrics::counter;
use tracing::{debug, info, warn};

use pko_api::{apply_merge, ensure_finalizer, patch_status, remove_finalizer, ObjectReader};
use pko_cache::ObjectWatcher;
use pko_core::apis::{gvk_of, ControlledObjectReference, ObjectTemplateKind, ObjectTemplateStatus};
use pko_core::conditions::{reasons, remove_condition, set_condition, types};
use pko_core::meta::CACHED_FINALIZER;
use pko_core::{Condition, ConditionStatus};
use pko_ownership::{NativeStrategy, OwnerIdentity, OwnerStrategy};

use crate::render::{place, render_object};
use crate::sources::sample;
use crate::{Context, Error, SourceError};

/// Reconcile one ObjectTemplate or ClusterObjectTemplate.
pub async fn reconcile<K: ObjectTemplateKind>(template: Arc<K>, ctx: Arc<Context>) -> Result<Action, Error> {
    let template = template.as_ref();
    let api = ctx.api.as_ref();
    let gvk = gvk_of::<K>();
    let name = template.name_any();
    let owner = OwnerIdentity::of(template)?;

    if template.meta().deletion_timestamp.is_some() {
        ctx.cache.free(&owner).await?;
        remove_finalizer(api, &gvk, template.meta(), CACHED_FINALIZER).await?;
        return Ok(Action::await_change());
    }
    ensure_finalizer(api, &gvk, template.meta(), CACHED_FINALIZER).await?;

    let generation = template.meta().generation;
    let mut status = template.status().cloned().unwrap_or_default();
    let invalid = |reason: &str, message: String| {
        Condition::new(types::INVALID, ConditionStatus::True, reason, message).with_generation(generation)
    };

    let action = match render_and_write(template, &ctx, &owner, &mut status).await {
        Ok(incomplete) => {
            remove_condition(&mut status.conditions, types::INVALID);
            counter!("objecttemplate_renders_total", 1, "outcome" => "success");
            if incomplete {
                Action::requeue(ctx.optional_resource_retry)
            } else {
                Action::await_change()
            }
        }
        Err(Error::Source(e)) => {
            warn!(%name, error = %e, "template source unusable");
            counter!("objecttemplate_renders_total", 1, "outcome" => "source_error");
            let retry = matches!(e, SourceError::Missing(_));
            let reason = if retry { reasons::SOURCE_MISSING } else { reasons::SOURCE_ERROR };
            set_condition(&mut status.conditions, invalid(reason, e.to_string()));
            if retry {
                Action::requeue(ctx.resource_retry)
            } else {
                Action::await_change()
            }
        }
        Err(Error::Template(e)) => {
            warn!(%name, error = %e, "template does not render");
            counter!("objecttemplate_renders_total", 1, "outcome" => "template_error");
            set_condition(&mut status.conditions, invalid(reasons::TEMPLATE_ERROR, e.to_string()));
            Action::await_change()
        }
        Err(e) => return Err(e),
    };

    patch_status(api, &gvk, template.namespace().as_deref(), &name, template.status(), &status).await?;
    Ok(action)
}

/// Samples, renders and writes the object. Returns true when some optional
/// source is still missing.
async fn render_and_write<K: ObjectTemplateKind>(
    template: &K,
    ctx: &Context,
    owner: &OwnerIdentity,
    status: &mut ObjectTemplateStatus,
) -> Result<bool, Error> {
    let api = ctx.api.as_ref();
    let sampled = sample(ctx, template, owner).await?;
    let (gvk, mut desired) = render_object(&template.body().template, &sampled.values, &ctx.environment)?;
    place(&mut desired, template.namespace().as_deref(), api.is_namespaced(&gvk).await?)?;

    ctx.cache.watch(owner, &gvk).await?;
    let namespace = desired.namespace();
    let name = desired.name_any();
    let live = match ctx.cache.get(&gvk, namespace.as_deref(), &name).await? {
        Some(live) => Some(live),
        None => api.get(&gvk, namespace.as_deref(), &name).await?,
    };

    let written = match live {
        None => {
            NativeStrategy.set_controller_reference(owner, &mut desired.metadata)?;
            let created = api.create(&desired).await?;
            info!(template = %template.name_any(), object = %name, kind = %gvk.kind, "created templated object");
            created
        }
        Some(live) => {
            adopt_metadata(&mut desired.metadata, &live.metadata);
            NativeStrategy.set_controller_reference(owner, &mut desired.metadata)?;
            copy_conditions(status, &live, template.meta().generation);
            if is_current(&live, &desired)? {
                debug!(object = %name, "templated object up to date");
                live
            } else {
                let updated = api.update(&desired).await?;
                info!(template = %template.name_any(), object = %name, kind = %gvk.kind, "updated templated object");
                updated
            }
        }
    };

    status.controller_of = Some(ControlledObjectReference::of(&written));
    Ok(sampled.incomplete)
}

/// Keeps what others put on the live object: labels and annotations the
/// template does not set, owner references, finalizers and the resourceVersion.
fn adopt_metadata(desired: &mut ObjectMeta, live: &ObjectMeta) {
    let mut labels = live.labels.clone().unwrap_or_default();
    labels.extend(desired.labels.take().unwrap_or_default());
    desired.labels = Some(labels).filter(|l| !l.is_empty());

    let mut annotations = live.annotations.clone().unwrap_or_default();
    annotations.extend(desired.annotations.take().unwrap_or_default());
    desired.annotations = Some(annotations).filter(|a| !a.is_empty());

    desired.owner_references = live.owner_references.clone();
    desired.finalizers = live.finalizers.clone();
    desired.resource_version = live.resource_version.clone();
}

/// True when writing `desired` would not change `live`.
fn is_current(live: &DynamicObject, desired: &DynamicObject) -> Result<bool, Error> {
    let live = serde_json::to_value(live)?;
    let mut merged = live.clone();
    apply_merge(&mut merged, &serde_json::to_value(desired)?);
    Ok(merged == live)
}

/// Surfaces fresh conditions of the rendered object on the template.
fn copy_conditions(status: &mut ObjectTemplateStatus, live: &DynamicObject, generation: Option<i64>) {
    let Some(conditions) = live.data["status"]["conditions"].as_array() else { return };
    for raw in conditions {
        let Ok(condition) = serde_json::from_value::<Condition>(raw.clone()) else { continue };
        if condition.observed_generation != live.metadata.generation {
            continue;
        }
        set_condition(&mut status.conditions, condition.with_generation(generation));
    }
}
