use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::api::core::v1::Secret;
use kube::core::GroupVersionKind;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use pko_api::{ensure_finalizer, get_as, patch_status, remove_finalizer, ObjectApi};
use pko_core::apis::{gvk_of, ObjectDeploymentKind, PackageBody, PackageKind, PackageStatus, PackageStatusPhase};
use pko_core::conditions::{
    find_condition, is_condition_true, reasons, remove_condition, set_condition, sync_mapped_conditions, types,
};
use pko_core::hash::compute_hash;
use pko_core::meta::CACHED_FINALIZER;
use pko_core::{Condition, ConditionStatus};

use crate::chunking::ChunkingStrategy;
use crate::deployer::{deploy, desired_deployment};
use crate::manifest::Scope;
use crate::puller::{credentials_for, Credentials, Files};
use crate::render::{render, RenderInput};
use crate::{Context, Error};

const DOCKER_CONFIG_SECRET_TYPE: &str = "kubernetes.io/dockerconfigjson";
const DOCKER_CONFIG_KEY: &str = ".dockerconfigjson";

type SecretData = BTreeMap<String, BTreeMap<String, String>>;

/// Reconcile one Package or ClusterPackage.
pub async fn reconcile<P: PackageKind>(package: Arc<P>, ctx: Arc<Context>) -> Result<Action, Error> {
    let package = package.as_ref();
    let api = ctx.api.as_ref();
    let gvk = gvk_of::<P>();
    let namespace = package.namespace();
    let name = package.name_any();
    let uid = package.meta().uid.clone().unwrap_or_default();

    if package.meta().deletion_timestamp.is_some() {
        // The deployment carries a controller reference and goes with the package.
        ctx.backoff.forget(&uid);
        ctx.unpacked.forget(&uid);
        remove_finalizer(api, &gvk, package.meta(), CACHED_FINALIZER).await?;
        return Ok(Action::await_change());
    }
    ensure_finalizer(api, &gvk, package.meta(), CACHED_FINALIZER).await?;

    let body = package.body();
    let generation = package.meta().generation;
    let mut status = package.status().cloned().unwrap_or_default();
    let condition = |type_: &str, status: ConditionStatus, reason: &str, message: &str| {
        Condition::new(type_, status, reason, message).with_generation(generation)
    };
    let spec_hash = compute_hash(body, ctx.hash_modifier)?;
    let image = ctx.registry.resolve(&body.image);

    let outcome = match ctx.unpacked.get(&uid, &spec_hash) {
        Some(outcome) => Some(outcome),
        None if status.unpacked_hash.as_deref() == Some(spec_hash.as_str()) => {
            debug!(%name, hash = %spec_hash, "package already unpacked");
            None
        }
        None => {
            let started = Instant::now();
            let fetched = fetch(api, &ctx, package, &image).await;
            let (files, secrets) = match fetched {
                Ok(fetched) => fetched,
                Err(Error::Pull(error)) => {
                    let delay = ctx.backoff.next(&uid);
                    warn!(%name, %image, %error, retry_in = ?delay, "image pull failed");
                    counter!("package_unpacks_total", 1, "outcome" => "pull_failed");
                    set_condition(
                        &mut status.conditions,
                        condition(types::UNPACKED, ConditionStatus::False, reasons::IMAGE_PULL_BACK_OFF, &error.to_string()),
                    );
                    status.phase = Some(derive_phase(&status.conditions));
                    patch_status(api, &gvk, namespace.as_deref(), &name, package.status(), &status).await?;
                    return Ok(Action::requeue(delay));
                }
                Err(Error::Secret(message)) => {
                    let delay = ctx.backoff.next(&uid);
                    warn!(%name, %message, retry_in = ?delay, "secret validation failed");
                    set_condition(
                        &mut status.conditions,
                        condition(types::INVALID, ConditionStatus::True, reasons::SECRET_VALIDATION_FAILED, &message),
                    );
                    status.phase = Some(derive_phase(&status.conditions));
                    patch_status(api, &gvk, namespace.as_deref(), &name, package.status(), &status).await?;
                    return Ok(Action::requeue(delay));
                }
                Err(e) => return Err(e),
            };
            ctx.backoff.forget(&uid);

            let kind = P::kind(&());
            let input = RenderInput {
                files: &files,
                package: package.meta(),
                body,
                scope: if P::NAMESPACED { Scope::Namespaced } else { Scope::Cluster },
                package_kind: &kind,
                image: &image,
                registry: &ctx.registry,
                secrets: &secrets,
                environment: &ctx.environment,
            };
            let outcome = render(&input).map(Arc::new).map_err(|e| e.to_string());
            histogram!("package_unpack_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
            counter!("package_unpacks_total", 1, "outcome" => if outcome.is_ok() { "success" } else { "invalid" });
            ctx.unpacked.put(&uid, &spec_hash, outcome.clone());
            Some(outcome)
        }
    };

    match outcome {
        Some(Ok(rendered)) => {
            let strategy = match ChunkingStrategy::of(package.annotations()) {
                Ok(strategy) => strategy,
                Err(message) => return report_invalid(api, package, status, &message).await,
            };
            let desired = desired_deployment(package, &rendered, &image)?;
            deploy::<P>(api, desired, strategy).await?;
            if status.unpacked_hash.as_deref() != Some(spec_hash.as_str()) {
                info!(%name, hash = %spec_hash, manifest = %rendered.manifest_name, "package unpacked");
            }
            remove_condition(&mut status.conditions, types::INVALID);
            status.unpacked_hash = Some(spec_hash);
            set_condition(
                &mut status.conditions,
                condition(types::UNPACKED, ConditionStatus::True, reasons::UNPACK_SUCCESS, "Unpack job succeeded"),
            );
        }
        Some(Err(message)) => return report_invalid(api, package, status, &message).await,
        None => {}
    }

    let deployment: Option<P::Deployment> =
        get_as(api, &gvk_of::<P::Deployment>(), namespace.as_deref(), &name).await?;
    if let Some(deployment) = &deployment {
        roll_up(&mut status, deployment, generation);
    }
    status.phase = Some(derive_phase(&status.conditions));
    patch_status(api, &gvk, namespace.as_deref(), &name, package.status(), &status).await?;
    Ok(Action::await_change())
}

/// Content that can not be rendered stays invalid until the package changes.
async fn report_invalid<P: PackageKind>(
    api: &dyn ObjectApi,
    package: &P,
    mut status: PackageStatus,
    message: &str,
) -> Result<Action, Error> {
    warn!(name = %package.name_any(), %message, "package is invalid");
    set_condition(
        &mut status.conditions,
        Condition::new(types::INVALID, ConditionStatus::True, reasons::LOAD_ERROR, message)
            .with_generation(package.meta().generation),
    );
    status.phase = Some(derive_phase(&status.conditions));
    let namespace = package.namespace();
    patch_status(api, &gvk_of::<P>(), namespace.as_deref(), &package.name_any(), package.status(), &status).await?;
    Ok(Action::await_change())
}

/// Secrets are read from the package namespace; cluster packages use the operator namespace.
fn secret_namespace<P: PackageKind>(package: &P, ctx: &Context) -> String {
    package.namespace().filter(|ns| !ns.is_empty()).unwrap_or_else(|| ctx.operator_namespace.clone())
}

async fn read_secret(api: &dyn ObjectApi, namespace: &str, name: &str) -> Result<Secret, Error> {
    if name.contains('/') {
        return Err(Error::Secret(format!("secret {:?} must be referenced by name within {}", name, namespace)));
    }
    let gvk = GroupVersionKind::gvk("", "v1", "Secret");
    get_as(api, &gvk, Some(namespace), name)
        .await?
        .ok_or_else(|| Error::Secret(format!("secret {}/{} not found", namespace, name)))
}

async fn pull_credentials(api: &dyn ObjectApi, namespace: &str, body: &PackageBody, image: &str) -> Result<Credentials, Error> {
    let Some(name) = body.image_pull_secret.as_deref().filter(|n| !n.is_empty()) else {
        return Ok(Credentials::Anonymous);
    };
    let secret = read_secret(api, namespace, name).await?;
    if secret.type_.as_deref() != Some(DOCKER_CONFIG_SECRET_TYPE) {
        return Err(Error::Secret(format!("secret {} is not of type {}", name, DOCKER_CONFIG_SECRET_TYPE)));
    }
    let data = secret
        .data
        .as_ref()
        .and_then(|d| d.get(DOCKER_CONFIG_KEY))
        .ok_or_else(|| Error::Secret(format!("secret {} has no {} key", name, DOCKER_CONFIG_KEY)))?;
    credentials_for(&data.0, image).map_err(|e| Error::Secret(format!("secret {}: {}", name, e)))
}

async fn template_secrets(api: &dyn ObjectApi, namespace: &str, body: &PackageBody) -> Result<SecretData, Error> {
    let mut out = SecretData::new();
    for reference in &body.secrets {
        let secret = read_secret(api, namespace, &reference.secret.name).await?;
        let mut values = secret.string_data.clone().unwrap_or_default();
        for (key, value) in secret.data.iter().flatten() {
            let decoded = String::from_utf8(value.0.clone())
                .map_err(|_| Error::Secret(format!("secret {} key {} is not valid UTF-8", reference.secret.name, key)))?;
            values.insert(key.clone(), decoded);
        }
        out.insert(reference.name.clone(), values);
    }
    Ok(out)
}

/// Pulls the image with the package's credentials and gathers the secrets its templates see.
async fn fetch<P: PackageKind>(
    api: &dyn ObjectApi,
    ctx: &Context,
    package: &P,
    image: &str,
) -> Result<(Files, SecretData), Error> {
    let namespace = secret_namespace(package, ctx);
    let body = package.body();
    let credentials = pull_credentials(api, &namespace, body, image).await?;
    let secrets = template_secrets(api, &namespace, body).await?;
    let files = ctx.puller.pull(image, &credentials).await?;
    debug!(name = %package.name_any(), %image, files = files.len(), "image pulled");
    Ok((files, secrets))
}

/// Copies the deployment's Available, Progressing and mapped conditions onto the package.
fn roll_up<D: ObjectDeploymentKind>(status: &mut PackageStatus, deployment: &D, generation: Option<i64>) {
    let Some(deployment_status) = deployment.status() else { return };
    for type_ in [types::AVAILABLE, types::PROGRESSING] {
        match find_condition(&deployment_status.conditions, type_) {
            Some(c) => set_condition(&mut status.conditions, c.clone().with_generation(generation)),
            None => {
                remove_condition(&mut status.conditions, type_);
            }
        }
    }
    sync_mapped_conditions(&mut status.conditions, &deployment_status.conditions, generation);
    status.revision = deployment_status.revision;
}

/// Phase summary of the package conditions.
pub fn derive_phase(conditions: &[Condition]) -> PackageStatusPhase {
    if is_condition_true(conditions, types::INVALID) {
        PackageStatusPhase::Invalid
    } else if !is_condition_true(conditions, types::UNPACKED) {
        PackageStatusPhase::Unpacking
    } else if is_condition_true(conditions, types::PROGRESSING) {
        PackageStatusPhase::Progressing
    } else if is_condition_true(conditions, types::AVAILABLE) {
        PackageStatusPhase::Available
    } else {
        PackageStatusPhase::NotReady
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cond(type_: &str, status: ConditionStatus) -> Condition {
        Condition::new(type_, status, "Test", "")
    }

    #[test]
    fn invalid_wins_over_everything() {
        let conditions = vec![
            cond(types::UNPACKED, ConditionStatus::True),
            cond(types::AVAILABLE, ConditionStatus::True),
            cond(types::INVALID, ConditionStatus::True),
        ];
        assert_eq!(derive_phase(&conditions), PackageStatusPhase::Invalid);
    }

    #[test]
    fn phases_follow_conditions() {
        assert_eq!(derive_phase(&[]), PackageStatusPhase::Unpacking);
        assert_eq!(derive_phase(&[cond(types::UNPACKED, ConditionStatus::False)]), PackageStatusPhase::Unpacking);
        let mut conditions = vec![cond(types::UNPACKED, ConditionStatus::True), cond(types::PROGRESSING, ConditionStatus::True)];
        assert_eq!(derive_phase(&conditions), PackageStatusPhase::Progressing);
        conditions[1].status = ConditionStatus::False;
        conditions.push(cond(types::AVAILABLE, ConditionStatus::True));
        assert_eq!(derive_phase(&conditions), PackageStatusPhase::Available);
        conditions[2].status = ConditionStatus::False;
        assert_eq!(derive_phase(&conditions), PackageStatusPhase::NotReady);
    }
}
