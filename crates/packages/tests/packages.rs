use std::collections::BTreeMap;
use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::core::ObjectMeta;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use serde_json::json;

use pko_api::{get_as, MockApi, ObjectApi, WriteKind};
use pko_core::apis::{
    gvk_of, ClusterObjectDeployment, ClusterPackage, ObjectDeployment, ObjectSlice, Package, PackageBody, PackageKind,
    PackageSecretReference, PackageStatusPhase, SecretNameReference,
};
use pko_core::conditions::{find_condition, is_condition_true, reasons, types};
use pko_core::meta::{
    CACHED_FINALIZER, CHUNKING_STRATEGY_ANNOTATION, PACKAGE_INSTANCE_LABEL, PACKAGE_LABEL,
    PACKAGE_SOURCE_IMAGE_ANNOTATION,
};
use pko_core::object::to_dynamic;
use pko_ownership::{NativeStrategy, OwnerIdentity, OwnerStrategy};
use pko_packages::{extract_layers, reconcile, Context, Credentials, StaticPuller};

const IMAGE: &str = "quay.io/pko/web:v1";

const MANIFEST: &str = r#"apiVersion: manifests.package-operator.run/v1alpha1
kind: PackageManifest
metadata:
  name: web
spec:
  scopes: [Namespaced, Cluster]
  config:
    openAPIV3Schema:
      type: object
      properties:
        replicas:
          type: integer
          default: 1
"#;

const DEPLOY: &str = r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: {{ package.metadata.name }}
spec:
  replicas: {{ config.replicas }}
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: {{ package.metadata.name }}-settings
data:
  password: "{% if package.secrets.db is defined %}{{ package.secrets.db.password }}{% else %}none{% endif %}"
"#;

/// An image layer the way a registry hands it out.
fn layer(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        builder.append_data(&mut header, format!("package/{}", path), content.as_bytes()).unwrap();
    }
    let tarball = builder.into_inner().unwrap();
    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(&tarball).unwrap();
    gz.finish().unwrap()
}

fn publish(puller: &StaticPuller, image: &str, files: &[(&str, &str)]) {
    let layer = layer(files);
    puller.insert(image, extract_layers(image, [layer.as_slice()]).unwrap());
}

fn package(body: PackageBody) -> Package {
    let meta = ObjectMeta { name: Some("web".into()), namespace: Some("ns".into()), ..Default::default() };
    Package::from_parts(meta, body)
}

fn body(config: serde_json::Value) -> PackageBody {
    PackageBody { image: IMAGE.into(), config: Some(config), ..Default::default() }
}

fn setup(pkg: &Package) -> (Arc<MockApi>, Arc<StaticPuller>, Arc<Context>) {
    let api = Arc::new(MockApi::new());
    api.insert(to_dynamic(pkg).unwrap());
    let puller = Arc::new(StaticPuller::new());
    publish(&puller, IMAGE, &[("manifest.yaml", MANIFEST), ("deploy.yaml.j2", DEPLOY)]);
    let ctx = Arc::new(Context::new(api.clone(), puller.clone()));
    (api, puller, ctx)
}

async fn fetch(api: &MockApi) -> Package {
    get_as::<Package, _>(api, &gvk_of::<Package>(), Some("ns"), "web").await.unwrap().unwrap()
}

async fn deployment(api: &MockApi) -> Option<ObjectDeployment> {
    get_as::<ObjectDeployment, _>(api, &gvk_of::<ObjectDeployment>(), Some("ns"), "web").await.unwrap()
}

async fn run(api: &MockApi, ctx: &Arc<Context>) -> Action {
    reconcile(Arc::new(fetch(api).await), ctx.clone()).await.unwrap()
}

fn secret(name: &str, type_: &str, data: &[(&str, &str)]) -> Secret {
    Secret {
        metadata: ObjectMeta { name: Some(name.into()), namespace: Some("ns".into()), ..Default::default() },
        type_: Some(type_.into()),
        data: Some(data.iter().map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec()))).collect()),
        ..Default::default()
    }
}

#[tokio::test]
async fn package_is_unpacked_into_a_deployment() {
    let (api, puller, ctx) = setup(&package(body(json!({ "replicas": 3 }))));

    assert_eq!(run(&api, &ctx).await, Action::await_change());

    let pkg = fetch(&api).await;
    assert!(pkg.finalizers().iter().any(|f| f == CACHED_FINALIZER));
    let d = deployment(&api).await.expect("deployment created");
    assert!(NativeStrategy.is_controller(&OwnerIdentity::of(&pkg).unwrap(), &d.metadata));
    assert_eq!(d.labels().get(PACKAGE_LABEL).map(String::as_str), Some("web"));
    assert_eq!(d.labels().get(PACKAGE_INSTANCE_LABEL).map(String::as_str), Some("web"));
    assert_eq!(d.annotations().get(PACKAGE_SOURCE_IMAGE_ANNOTATION).map(String::as_str), Some(IMAGE));

    let phases = &d.spec.body.template.spec.phases;
    assert_eq!(phases.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(), vec!["deploy"]);
    let deploy = phases[0].objects.iter().find(|o| o.object["kind"] == "Deployment").unwrap();
    assert_eq!(deploy.object["spec"]["replicas"], 3);
    assert_eq!(deploy.object["metadata"]["labels"][PACKAGE_INSTANCE_LABEL], "web");
    assert!(!d.spec.body.template.spec.availability_probes.is_empty());

    let status = pkg.status.unwrap();
    assert!(is_condition_true(&status.conditions, types::UNPACKED));
    assert_eq!(find_condition(&status.conditions, types::UNPACKED).unwrap().reason, reasons::UNPACK_SUCCESS);
    assert!(status.unpacked_hash.is_some());
    assert_eq!(status.phase, Some(PackageStatusPhase::NotReady));
    assert_eq!(puller.pulls(), vec![(IMAGE.to_string(), Credentials::Anonymous)]);
}

#[tokio::test]
async fn unpacked_spec_is_not_pulled_again() {
    let (api, puller, ctx) = setup(&package(body(json!({}))));
    run(&api, &ctx).await;
    run(&api, &ctx).await;
    assert_eq!(puller.pulls().len(), 1);

    // A fresh process trusts the recorded hash.
    let restarted = Arc::new(Context::new(api.clone(), puller.clone()));
    api.clear_writes();
    run(&api, &restarted).await;
    assert_eq!(puller.pulls().len(), 1);
    assert!(api.writes().iter().all(|w| w.kind != WriteKind::Update));

    // A new hash modifier forces an unpack, which renders the same deployment.
    let salted = Arc::new(Context::new(api.clone(), puller.clone()).with_hash_modifier(Some(1)));
    run(&api, &salted).await;
    assert_eq!(puller.pulls().len(), 2);
    assert!(api.writes().iter().all(|w| w.kind != WriteKind::Update));
}

#[tokio::test]
async fn spec_changes_update_the_deployment() {
    let (api, puller, ctx) = setup(&package(body(json!({ "replicas": 1 }))));
    run(&api, &ctx).await;
    let first = fetch(&api).await.status.unwrap().unpacked_hash;

    let mut pkg = fetch(&api).await;
    pkg.spec.body.config = Some(json!({ "replicas": 5 }));
    api.update(&to_dynamic(&pkg).unwrap()).await.unwrap();
    run(&api, &ctx).await;

    assert_eq!(puller.pulls().len(), 2);
    assert_ne!(fetch(&api).await.status.unwrap().unpacked_hash, first);
    let d = deployment(&api).await.unwrap();
    let deploy = d.spec.body.template.spec.phases[0].objects.iter().find(|o| o.object["kind"] == "Deployment").unwrap();
    assert_eq!(deploy.object["spec"]["replicas"], 5);
}

#[tokio::test]
async fn pull_failures_back_off() {
    let mut b = body(json!({}));
    b.image = "quay.io/pko/missing:v1".into();
    let (api, _, ctx) = setup(&package(b));

    assert_eq!(run(&api, &ctx).await, Action::requeue(Duration::from_secs(10)));
    let status = fetch(&api).await.status.unwrap();
    let unpacked = find_condition(&status.conditions, types::UNPACKED).unwrap();
    assert_eq!(unpacked.reason, reasons::IMAGE_PULL_BACK_OFF);
    assert!(!unpacked.is_true());
    assert_eq!(status.phase, Some(PackageStatusPhase::Unpacking));
    assert!(deployment(&api).await.is_none());

    assert_eq!(run(&api, &ctx).await, Action::requeue(Duration::from_secs(20)));
    assert_eq!(ctx.backoff.len(), 1);
}

#[tokio::test]
async fn pull_secrets_are_validated() {
    let mut b = body(json!({}));
    b.image_pull_secret = Some("regcred".into());
    let (api, puller, ctx) = setup(&package(b));

    assert_eq!(run(&api, &ctx).await, Action::requeue(Duration::from_secs(10)));
    let status = fetch(&api).await.status.unwrap();
    assert_eq!(find_condition(&status.conditions, types::INVALID).unwrap().reason, reasons::SECRET_VALIDATION_FAILED);
    assert_eq!(status.phase, Some(PackageStatusPhase::Invalid));

    api.insert(to_dynamic(&secret("regcred", "Opaque", &[("token", "x")])).unwrap());
    assert_eq!(run(&api, &ctx).await, Action::requeue(Duration::from_secs(20)));
    assert!(puller.pulls().is_empty());

    let config = r#"{"auths":{"quay.io":{"username":"bot","password":"s3cret"}}}"#;
    api.insert(to_dynamic(&secret("regcred", "kubernetes.io/dockerconfigjson", &[(".dockerconfigjson", config)])).unwrap());
    assert_eq!(run(&api, &ctx).await, Action::await_change());
    assert_eq!(
        puller.pulls(),
        vec![(IMAGE.to_string(), Credentials::Basic { username: "bot".into(), password: "s3cret".into() })]
    );
    let status = fetch(&api).await.status.unwrap();
    assert!(find_condition(&status.conditions, types::INVALID).is_none());
    assert!(is_condition_true(&status.conditions, types::UNPACKED));
    assert!(ctx.backoff.is_empty());
}

#[tokio::test]
async fn template_secrets_are_decoded() {
    let mut b = body(json!({}));
    b.secrets = vec![PackageSecretReference { name: "db".into(), secret: SecretNameReference { name: "db-creds".into() } }];
    let (api, _, ctx) = setup(&package(b));
    api.insert(to_dynamic(&secret("db-creds", "Opaque", &[("password", "hunter2")])).unwrap());

    run(&api, &ctx).await;

    let d = deployment(&api).await.unwrap();
    let cm = d.spec.body.template.spec.phases[0].objects.iter().find(|o| o.object["kind"] == "ConfigMap").unwrap();
    assert_eq!(cm.object["data"]["password"], "hunter2");
}

#[tokio::test]
async fn broken_content_marks_the_package_invalid() {
    let (api, puller, ctx) = setup(&package(body(json!({ "replicas": "many" }))));

    assert_eq!(run(&api, &ctx).await, Action::await_change());
    let status = fetch(&api).await.status.unwrap();
    let invalid = find_condition(&status.conditions, types::INVALID).unwrap();
    assert_eq!(invalid.reason, reasons::LOAD_ERROR);
    assert!(invalid.message.contains("config.replicas"), "{}", invalid.message);
    assert_eq!(status.phase, Some(PackageStatusPhase::Invalid));
    assert!(deployment(&api).await.is_none());

    // The same spec is not pulled again to fail the same way.
    run(&api, &ctx).await;
    assert_eq!(puller.pulls().len(), 1);
}

#[tokio::test]
async fn deployment_status_rolls_up() {
    let (api, _, ctx) = setup(&package(body(json!({}))));
    run(&api, &ctx).await;

    let status = json!({
        "revision": 3,
        "conditions": [
            { "type": "Available", "status": "True", "reason": "Available", "message": "", "observedGeneration": 7 },
            { "type": "Progressing", "status": "False", "reason": "Idle", "message": "", "observedGeneration": 7 },
            { "type": "my-team/Ready", "status": "True", "reason": "Mapped", "message": "", "observedGeneration": 7 },
        ],
    });
    api.update_status(&gvk_of::<ObjectDeployment>(), Some("ns"), "web", &status).await.unwrap();
    run(&api, &ctx).await;

    let pkg = fetch(&api).await;
    let generation = pkg.metadata.generation;
    let status = pkg.status.unwrap();
    assert_eq!(status.revision, Some(3));
    assert_eq!(status.phase, Some(PackageStatusPhase::Available));
    for type_ in [types::AVAILABLE, types::PROGRESSING, "my-team/Ready"] {
        assert_eq!(find_condition(&status.conditions, type_).unwrap().observed_generation, generation, "{}", type_);
    }

    // Mapped conditions that disappear upstream disappear here too.
    let status = json!({
        "conditions": [
            { "type": "Available", "status": "True", "reason": "Available", "message": "", "observedGeneration": 7 },
            { "type": "Progressing", "status": "True", "reason": "Progressing", "message": "", "observedGeneration": 7 },
        ],
    });
    api.update_status(&gvk_of::<ObjectDeployment>(), Some("ns"), "web", &status).await.unwrap();
    run(&api, &ctx).await;
    let status = fetch(&api).await.status.unwrap();
    assert!(find_condition(&status.conditions, "my-team/Ready").is_none());
    assert_eq!(status.phase, Some(PackageStatusPhase::Progressing));
}

#[tokio::test]
async fn each_object_chunking_moves_objects_into_slices() {
    let mut pkg = package(body(json!({})));
    pkg.metadata.annotations = Some(BTreeMap::from([(CHUNKING_STRATEGY_ANNOTATION.to_string(), "EachObject".to_string())]));
    let (api, _, ctx) = setup(&pkg);

    run(&api, &ctx).await;

    let d = deployment(&api).await.unwrap();
    let phase = &d.spec.body.template.spec.phases[0];
    assert!(phase.objects.is_empty());
    assert_eq!(phase.slices.len(), 2);
    let slices = api.objects(&ObjectSlice::gvk(true));
    assert_eq!(slices.len(), 2);
    let owner = OwnerIdentity::of(&d).unwrap();
    for slice in &slices {
        assert!(phase.slices.contains(&slice.name_any()));
        assert!(NativeStrategy.is_controller(&owner, &slice.metadata));
    }

    // Rendering again finds the slices in place.
    let names: Vec<String> = slices.iter().map(|s| s.name_any()).collect();
    api.clear_writes();
    run(&api, &ctx).await;
    assert!(api.writes().iter().all(|w| w.kind != WriteKind::Update && w.kind != WriteKind::Delete));
    let again: Vec<String> = api.objects(&ObjectSlice::gvk(true)).iter().map(|s| s.name_any()).collect();
    assert_eq!(again, names);
}

#[tokio::test]
async fn unknown_chunking_strategy_is_invalid() {
    let mut pkg = package(body(json!({})));
    pkg.metadata.annotations = Some(BTreeMap::from([(CHUNKING_STRATEGY_ANNOTATION.to_string(), "Zip".to_string())]));
    let (api, _, ctx) = setup(&pkg);

    run(&api, &ctx).await;

    let status = fetch(&api).await.status.unwrap();
    assert_eq!(status.phase, Some(PackageStatusPhase::Invalid));
    assert!(deployment(&api).await.is_none());
}

#[tokio::test]
async fn cluster_packages_get_cluster_deployments() {
    let api = Arc::new(MockApi::new());
    let meta = ObjectMeta { name: Some("web".into()), ..Default::default() };
    api.insert(to_dynamic(&ClusterPackage::from_parts(meta, body(json!({})))).unwrap());
    let puller = Arc::new(StaticPuller::new());
    publish(&puller, IMAGE, &[("manifest.yaml", MANIFEST), ("deploy.yaml.j2", DEPLOY)]);
    let ctx = Arc::new(Context::new(api.clone(), puller));

    let pkg: ClusterPackage = get_as(api.as_ref(), &gvk_of::<ClusterPackage>(), None, "web").await.unwrap().unwrap();
    reconcile(Arc::new(pkg), ctx).await.unwrap();

    let d: Option<ClusterObjectDeployment> =
        get_as(api.as_ref(), &gvk_of::<ClusterObjectDeployment>(), None, "web").await.unwrap();
    assert!(d.is_some());
    let pkg: ClusterPackage = get_as(api.as_ref(), &gvk_of::<ClusterPackage>(), None, "web").await.unwrap().unwrap();
    assert!(is_condition_true(&pkg.status.unwrap().conditions, types::UNPACKED));
}

#[tokio::test]
async fn deletion_releases_the_package() {
    let (api, _, ctx) = setup(&package(body(json!({}))));
    run(&api, &ctx).await;

    api.delete(&gvk_of::<Package>(), Some("ns"), "web", pko_api::Propagation::Background).await.unwrap();
    let pkg = fetch(&api).await;
    assert!(pkg.metadata.deletion_timestamp.is_some());
    reconcile(Arc::new(pkg), ctx.clone()).await.unwrap();

    let gone = get_as::<Package, _>(api.as_ref(), &gvk_of::<Package>(), Some("ns"), "web").await.unwrap();
    assert!(gone.map_or(true, |p| !p.finalizers().iter().any(|f| f == CACHED_FINALIZER)));
}
