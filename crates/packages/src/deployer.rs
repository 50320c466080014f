//! Handing a rendered package to its ObjectDeployment, with oversized phases
//! moved into ObjectSlices.

use std::collections::{BTreeMap, BTreeSet};

use kube::core::ObjectMeta;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, info};

use pko_api::{create_as, get_as, list_as, update_as, ObjectApi, Propagation};
use pko_core::apis::{
    gvk_of, ObjectDeploymentBody, ObjectDeploymentKind, ObjectSetKind, ObjectSetObject, ObjectSetTemplate,
    ObjectSetTemplateMetadata, ObjectSetTemplateSpec, ObjectSlice, PackageKind, API_VERSION,
};
use pko_core::hash::compute_hash;
use pko_core::meta::{PACKAGE_CONFIG_ANNOTATION, PACKAGE_INSTANCE_LABEL, PACKAGE_LABEL, PACKAGE_SOURCE_IMAGE_ANNOTATION};
use pko_core::object::{from_dynamic, value_to_dynamic};
use pko_core::LabelSelector;
use pko_ownership::{NativeStrategy, OwnerIdentity, OwnerStrategy};

use crate::chunking::{ChunkingStrategy, SLICE_SIZE_LIMIT};
use crate::render::Rendered;
use crate::Error;

/// Names the deployment a slice was cut for.
pub const SLICE_OWNER_LABEL: &str = "slices.package-operator.run/owner";
const MAX_SLICE_COLLISIONS: i32 = 10;

/// The ObjectDeployment `package` should have for `rendered`.
pub fn desired_deployment<P: PackageKind>(package: &P, rendered: &Rendered, image: &str) -> Result<P::Deployment, Error> {
    let labels = BTreeMap::from([
        (PACKAGE_LABEL.to_string(), rendered.manifest_name.clone()),
        (PACKAGE_INSTANCE_LABEL.to_string(), package.name_any()),
    ]);
    let annotations = BTreeMap::from([
        (PACKAGE_SOURCE_IMAGE_ANNOTATION.to_string(), image.to_string()),
        (PACKAGE_CONFIG_ANNOTATION.to_string(), serde_json::to_string(&rendered.config)?),
    ]);
    let mut meta = ObjectMeta {
        name: Some(package.name_any()),
        namespace: package.namespace(),
        labels: Some(labels.clone()),
        annotations: Some(annotations),
        ..Default::default()
    };
    NativeStrategy.set_controller_reference(&OwnerIdentity::of(package)?, &mut meta)?;

    let body = ObjectDeploymentBody {
        revision_history_limit: None,
        selector: LabelSelector::from_labels(labels.clone()),
        template: ObjectSetTemplate {
            metadata: ObjectSetTemplateMetadata { labels, annotations: BTreeMap::new() },
            spec: rendered.template.clone(),
        },
    };
    Ok(P::Deployment::from_parts(meta, body))
}

/// Creates or updates the deployment and its slices. Returns the live deployment.
pub async fn deploy<P: PackageKind>(
    api: &dyn ObjectApi,
    desired: P::Deployment,
    strategy: ChunkingStrategy,
) -> Result<P::Deployment, Error> {
    let gvk = gvk_of::<P::Deployment>();
    let namespace = desired.namespace();
    let name = desired.name_any();
    let mut live = get_as::<P::Deployment, _>(api, &gvk, namespace.as_deref(), &name).await?;

    let mut spec = desired.body().template.spec.clone();
    let mut chunks = Vec::with_capacity(spec.phases.len());
    for phase in &spec.phases {
        chunks.push(strategy.chunk(&phase.objects, SLICE_SIZE_LIMIT)?);
    }
    if chunks.iter().any(|c| !c.is_empty()) {
        // Slices are owned by the deployment, which has to exist first.
        let owner = match live.clone() {
            Some(existing) => existing,
            None => {
                let mut body = desired.body().clone();
                body.template.spec = ObjectSetTemplateSpec::default();
                let created = create_as(api, &P::Deployment::from_parts(desired.meta().clone(), body)).await?;
                info!(deployment = %name, "created empty deployment to own slices");
                live = Some(created.clone());
                created
            }
        };
        for (phase, phase_chunks) in spec.phases.iter_mut().zip(chunks) {
            if phase_chunks.is_empty() {
                continue;
            }
            let mut slices = Vec::with_capacity(phase_chunks.len());
            for chunk in phase_chunks {
                slices.push(ensure_slice::<P::Deployment>(api, &owner, chunk).await?);
            }
            phase.objects.clear();
            phase.slices = slices;
        }
    }

    let mut body = desired.body().clone();
    body.template.spec = spec;
    let deployment = match live {
        None => {
            let created = create_as(api, &P::Deployment::from_parts(desired.meta().clone(), body)).await?;
            info!(deployment = %name, "created deployment");
            created
        }
        Some(live) => {
            let mut meta = live.meta().clone();
            meta.labels.get_or_insert_with(Default::default).extend(desired.labels().clone());
            meta.annotations.get_or_insert_with(Default::default).extend(desired.annotations().clone());
            let owner = NativeStrategy.controller_of(desired.meta());
            if let Some(owner) = owner {
                NativeStrategy.set_controller_reference(&owner, &mut meta)?;
            }
            let next = P::Deployment::from_parts(meta, body);
            if next.meta() == live.meta() && next.body() == live.body() {
                debug!(deployment = %name, "deployment up to date");
                live
            } else {
                let updated = update_as(api, &next).await?;
                info!(deployment = %name, "updated deployment");
                updated
            }
        }
    };

    collect_slices::<P::Deployment>(api, &deployment).await?;
    Ok(deployment)
}

/// Creates the slice for `objects`, or finds it in place. Returns its name.
async fn ensure_slice<D: ObjectDeploymentKind>(
    api: &dyn ObjectApi,
    deployment: &D,
    objects: Vec<ObjectSetObject>,
) -> Result<String, Error> {
    let gvk = ObjectSlice::gvk(D::NAMESPACED);
    let owner = OwnerIdentity::of(deployment)?;
    let namespace = deployment.namespace();
    for collisions in 0..MAX_SLICE_COLLISIONS {
        let hash = compute_hash(&objects, (collisions > 0).then_some(collisions))?;
        let name = format!("{}-{}", deployment.name_any(), hash);
        let mut meta = ObjectMeta {
            name: Some(name.clone()),
            namespace: namespace.clone(),
            labels: Some([(SLICE_OWNER_LABEL.to_string(), deployment.name_any())].into()),
            ..Default::default()
        };
        NativeStrategy.set_controller_reference(&owner, &mut meta)?;
        let slice = value_to_dynamic(json!({
            "apiVersion": API_VERSION,
            "kind": ObjectSlice::slice_kind(D::NAMESPACED),
            "metadata": meta,
            "objects": &objects,
        }))?;
        match api.create(&slice).await {
            Ok(_) => {
                info!(deployment = %deployment.name_any(), slice = %name, "created slice");
                return Ok(name);
            }
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e.into()),
        }
        let Some(existing) = api.get(&gvk, namespace.as_deref(), &name).await? else { continue };
        let existing: ObjectSlice = from_dynamic(&existing)?;
        if NativeStrategy.is_controller(&owner, &existing.metadata) && existing.objects == objects {
            return Ok(name);
        }
        debug!(slice = %name, "slice name taken, salting hash");
    }
    Err(Error::SliceCollision(deployment.name_any()))
}

/// Deletes slices of the deployment no longer referenced by it or any of its ObjectSets.
async fn collect_slices<D: ObjectDeploymentKind>(api: &dyn ObjectApi, deployment: &D) -> Result<(), Error> {
    let namespace = deployment.namespace();
    let gvk = ObjectSlice::gvk(D::NAMESPACED);
    let selector = LabelSelector::from_labels([(SLICE_OWNER_LABEL.to_string(), deployment.name_any())].into());
    let slices: Vec<ObjectSlice> = list_as(api, &gvk, namespace.as_deref(), &selector).await?;
    if slices.is_empty() {
        return Ok(());
    }

    let mut referenced: BTreeSet<String> =
        deployment.body().template.spec.phases.iter().flat_map(|p| p.slices.iter().cloned()).collect();
    let sets: Vec<D::ObjectSet> =
        list_as(api, &gvk_of::<D::ObjectSet>(), namespace.as_deref(), &deployment.body().selector).await?;
    for set in &sets {
        referenced.extend(set.body().template.phases.iter().flat_map(|p| p.slices.iter().cloned()));
    }

    let owner = OwnerIdentity::of(deployment)?;
    for slice in slices {
        let name = slice.metadata.name.clone().unwrap_or_default();
        if referenced.contains(&name) || !NativeStrategy.is_controller(&owner, &slice.metadata) {
            continue;
        }
        api.delete(&gvk, namespace.as_deref(), &name, Propagation::Background).await?;
        info!(deployment = %deployment.name_any(), slice = %name, "deleted unreferenced slice");
    }
    Ok(())
}
