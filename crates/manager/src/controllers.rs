//! Wiring of every controller against the live apiserver.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use futures::future::{self, BoxFuture, Ready};
use futures::{FutureExt, Stream, StreamExt};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::GroupVersionKind;
use kube::runtime::controller::{self, Action, Config as ControllerConfig};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{watcher, Controller};
use kube::{Api, Client, Resource};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use pko_api::{KubeApi, ObjectReader};
use pko_cache::{DynamicCache, RelayMode, Subscription};
use pko_core::apis::{
    ClusterObjectDeployment, ClusterObjectSet, ClusterObjectSetPhase, ClusterObjectTemplate, ClusterPackage, CrdObject,
    ObjectDeployment, ObjectDeploymentKind, ObjectSet, ObjectSetKind, ObjectSetPhase, ObjectSetPhaseKind,
    ObjectTemplate, ObjectTemplateKind, Package, PackageKind,
};
use pko_objectset::PhaseContext;
use pko_ownership::{AnnotationStrategy, NativeStrategy, OwnerKind, OwnerStrategy};
use pko_packages::OciPuller;
use pko_phase::PhaseReconciler;

use crate::config::RunArgs;

/// Logs what each controller stream yields.
pub fn log_reconcile_result<K, E>(
    kind: &'static str,
) -> impl FnMut(Result<(ObjectRef<K>, Action), controller::Error<E, watcher::Error>>) -> Ready<()>
where
    K: Resource,
    E: std::error::Error + 'static,
{
    move |result| {
        match result {
            Ok((obj, action)) => debug!(kind, name = %obj.name, namespace = ?obj.namespace, ?action, "reconciled"),
            Err(controller::Error::ReconcilerFailed(error, obj)) => {
                warn!(kind, name = %obj.name, namespace = ?obj.namespace, %error, "reconcile failed")
            }
            Err(error) => warn!(kind, %error, "controller error"),
        }
        future::ready(())
    }
}

/// Owners of `K` to reconcile after changes to objects in `cache`.
fn triggers<K: CrdObject>(
    cache: &DynamicCache,
    strategy: Arc<dyn OwnerStrategy>,
    mode: RelayMode,
) -> impl Stream<Item = ObjectRef<K>> + Send + 'static {
    let sub = Subscription { kind: OwnerKind::of::<K>(K::NAMESPACED), strategy, mode };
    cache.subscribe(sub).map(|key| {
        let obj = ObjectRef::<K>::new(&key.name);
        match key.namespace {
            Some(ns) => obj.within(&ns),
            None => obj,
        }
    })
}

struct Shared {
    client: Client,
    concurrency: u16,
}

impl Shared {
    fn controller<K: CrdObject>(&self) -> Controller<K> {
        Controller::new(Api::<K>::all(self.client.clone()), watcher::Config::default())
            .with_config(ControllerConfig::default().concurrency(self.concurrency))
            .shutdown_on_signal()
    }

    fn api<K: CrdObject>(&self) -> Api<K> {
        Api::all(self.client.clone())
    }
}

fn object_sets<K: ObjectSetKind>(
    shared: &Shared,
    cache: &DynamicCache,
    ctx: Arc<pko_objectset::Context>,
    kind: &'static str,
) -> BoxFuture<'static, ()> {
    shared
        .controller::<K>()
        .owns(shared.api::<K::Phase>(), watcher::Config::default())
        .reconcile_on(triggers::<K>(cache, Arc::new(NativeStrategy), RelayMode::Controller))
        .run(pko_objectset::reconcile::<K>, pko_objectset::error_policy::<K, _>, ctx)
        .for_each(log_reconcile_result(kind))
        .boxed()
}

fn object_set_phases<K: ObjectSetPhaseKind>(
    shared: &Shared,
    cache: &DynamicCache,
    ctx: Arc<PhaseContext>,
    kind: &'static str,
) -> BoxFuture<'static, ()> {
    let strategy = ctx.phases.strategy().clone();
    shared
        .controller::<K>()
        .reconcile_on(triggers::<K>(cache, strategy, RelayMode::Controller))
        .run(pko_objectset::reconcile_phase::<K>, pko_objectset::error_policy::<K, _>, ctx)
        .for_each(log_reconcile_result(kind))
        .boxed()
}

fn object_deployments<K: ObjectDeploymentKind>(
    shared: &Shared,
    ctx: Arc<pko_objectdeployment::Context>,
    kind: &'static str,
) -> BoxFuture<'static, ()> {
    shared
        .controller::<K>()
        .owns(shared.api::<K::ObjectSet>(), watcher::Config::default())
        .run(pko_objectdeployment::reconcile::<K>, pko_objectdeployment::error_policy::<K, _>, ctx)
        .for_each(log_reconcile_result(kind))
        .boxed()
}

fn object_templates<K: ObjectTemplateKind>(
    shared: &Shared,
    cache: &DynamicCache,
    ctx: Arc<pko_objecttemplate::Context>,
    kind: &'static str,
) -> BoxFuture<'static, ()> {
    shared
        .controller::<K>()
        .reconcile_on(triggers::<K>(cache, Arc::new(NativeStrategy), RelayMode::Watchers))
        .run(pko_objecttemplate::reconcile::<K>, pko_objecttemplate::error_policy::<K, _>, ctx)
        .for_each(log_reconcile_result(kind))
        .boxed()
}

fn packages<K: PackageKind>(shared: &Shared, ctx: Arc<pko_packages::Context>, kind: &'static str) -> BoxFuture<'static, ()> {
    shared
        .controller::<K>()
        .owns(shared.api::<K::Deployment>(), watcher::Config::default())
        .run(pko_packages::reconcile::<K>, pko_packages::error_policy::<K, _>, ctx)
        .for_each(log_reconcile_result(kind))
        .boxed()
}

/// Cluster facts handed to package and ObjectTemplate rendering.
async fn environment(client: &Client, api: &KubeApi) -> Value {
    let mut env = json!({});
    match client.apiserver_version().await {
        Ok(info) => env["kubernetes"] = json!({ "version": info.git_version }),
        Err(error) => warn!(%error, "could not read the kubernetes version"),
    }
    let cluster_version = GroupVersionKind::gvk("config.openshift.io", "v1", "ClusterVersion");
    if let Ok(Some(cv)) = api.get(&cluster_version, None, "version").await {
        if let Some(version) = cv.data.pointer("/status/desired/version").and_then(Value::as_str) {
            env["openShift"] = json!({ "version": version });
        }
    }
    env
}

/// Builds the phase context for ObjectSetPhases, against the target cluster when one is configured.
async fn phase_context(
    args: &RunArgs,
    api: Arc<KubeApi>,
    local_cache: Arc<DynamicCache>,
) -> Result<(PhaseContext, Arc<DynamicCache>)> {
    let (target_api, cache, strategy): (Arc<KubeApi>, Arc<DynamicCache>, Arc<dyn OwnerStrategy>) =
        match &args.target_kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path)
                    .with_context(|| format!("reading target kubeconfig {}", path.display()))?;
                let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .context("loading target kubeconfig")?;
                let client = Client::try_from(config).context("building target cluster client")?;
                let target = Arc::new(KubeApi::new(client));
                let cache = Arc::new(DynamicCache::new(target.clone(), args.cache_sync_timeout()));
                info!(kubeconfig = %path.display(), "ObjectSetPhases target a remote cluster");
                (target, cache, Arc::new(AnnotationStrategy))
            }
            None => (api.clone(), local_cache, Arc::new(NativeStrategy)),
        };
    let phases = PhaseReconciler::new(target_api, cache.clone(), strategy).with_force_adoption(args.force_adoption);
    let ctx = PhaseContext { api, cache: cache.clone(), phases, class: args.phase_class.clone() };
    Ok((ctx, cache))
}

pub async fn run(args: RunArgs) -> Result<()> {
    let registry = args.registry()?;
    let client = Client::try_default().await.context("connecting to the kubernetes apiserver")?;
    let api = Arc::new(KubeApi::new(client.clone()));
    let cache = Arc::new(DynamicCache::new(api.clone(), args.cache_sync_timeout()));
    let environment = environment(&client, &api).await;
    info!(
        namespace = %args.namespace,
        phase_class = %args.phase_class,
        concurrency = args.concurrency,
        image = ?args.image,
        remote_phase_package_image = ?args.remote_phase_package_image,
        test_stub_image = ?args.test_stub_image,
        %environment,
        "starting package operator"
    );

    let phases =
        PhaseReconciler::new(api.clone(), cache.clone(), Arc::new(NativeStrategy)).with_force_adoption(args.force_adoption);
    let set_ctx = Arc::new(pko_objectset::Context::new(api.clone(), cache.clone(), phases));
    let (phase_ctx, phase_cache) = phase_context(&args, api.clone(), cache.clone()).await?;
    let phase_ctx = Arc::new(phase_ctx);
    let deployment_ctx = Arc::new(pko_objectdeployment::Context::new(api.clone()));
    let template_ctx = Arc::new(
        pko_objecttemplate::Context::new(api.clone(), cache.clone())
            .with_environment(environment.clone())
            .with_resource_retry(args.object_template_resource_retry())
            .with_optional_resource_retry(args.object_template_optional_resource_retry()),
    );
    let package_ctx = Arc::new(
        pko_packages::Context::new(api.clone(), Arc::new(OciPuller::new()))
            .with_registry(registry)
            .with_hash_modifier(args.package_hash_modifier)
            .with_operator_namespace(args.namespace.clone())
            .with_environment(environment),
    );

    let shared = Shared { client, concurrency: args.concurrency };
    let controllers = vec![
        object_sets::<ObjectSet>(&shared, &cache, set_ctx.clone(), "ObjectSet"),
        object_sets::<ClusterObjectSet>(&shared, &cache, set_ctx, "ClusterObjectSet"),
        object_set_phases::<ObjectSetPhase>(&shared, &phase_cache, phase_ctx.clone(), "ObjectSetPhase"),
        object_set_phases::<ClusterObjectSetPhase>(&shared, &phase_cache, phase_ctx, "ClusterObjectSetPhase"),
        object_deployments::<ObjectDeployment>(&shared, deployment_ctx.clone(), "ObjectDeployment"),
        object_deployments::<ClusterObjectDeployment>(&shared, deployment_ctx, "ClusterObjectDeployment"),
        object_templates::<ObjectTemplate>(&shared, &cache, template_ctx.clone(), "ObjectTemplate"),
        object_templates::<ClusterObjectTemplate>(&shared, &cache, template_ctx, "ClusterObjectTemplate"),
        packages::<Package>(&shared, package_ctx.clone(), "Package"),
        packages::<ClusterPackage>(&shared, package_ctx, "ClusterPackage"),
    ];
    info!(controllers = controllers.len(), "controllers started");
    future::join_all(controllers).await;
    info!("controllers stopped");
    Ok(())
}
