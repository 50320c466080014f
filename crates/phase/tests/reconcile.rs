#![forbid(unsafe_code)]

use std::sync::Arc;

use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use serde_json::{json, Value};

use pko_api::{MockApi, ObjectApi, WriteKind};
use pko_cache::MockCache;
use pko_core::apis::{
    CollisionProtection, ConditionMapping, ObjectSetObject, ObjectSetProbe, ObjectSetTemplatePhase, Probe,
    ProbeConditionSpec,
};
use pko_core::conditions::{find_condition, reasons, types};
use pko_core::meta::{CACHE_LABEL, PACKAGE_LABEL, REVISION_ANNOTATION};
use pko_core::object::value_to_dynamic;
use pko_ownership::{NativeStrategy, OwnerIdentity, OwnerStrategy};
use pko_phase::{report_error, PhaseError, PhaseOwner, PhaseReconciler, PreviousRevision, MISCONFIGURATION_RETRY};
use pko_probing::{parse, ProbeList};

fn identity(name: &str) -> OwnerIdentity {
    OwnerIdentity {
        api_version: "package-operator.run/v1alpha1".into(),
        kind: "ObjectSet".into(),
        name: name.into(),
        namespace: Some("ns".into()),
        uid: format!("uid-{}", name),
    }
}

fn owner(name: &str, revision: i64) -> PhaseOwner {
    PhaseOwner {
        identity: identity(name),
        labels: [(PACKAGE_LABEL.to_string(), "demo".to_string())].into_iter().collect(),
        generation: Some(4),
        revision,
        paused: false,
    }
}

fn object(v: Value) -> ObjectSetObject {
    ObjectSetObject { object: v, ..Default::default() }
}

fn cm_spec(name: &str) -> ObjectSetObject {
    object(json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": name }, "data": { "k": "v" } }))
}

fn phase(objects: Vec<ObjectSetObject>) -> ObjectSetTemplatePhase {
    ObjectSetTemplatePhase { name: "deploy".into(), objects, ..Default::default() }
}

fn configmaps() -> GroupVersionKind {
    GroupVersionKind::gvk("", "v1", "ConfigMap")
}

fn deployments() -> GroupVersionKind {
    GroupVersionKind::gvk("apps", "v1", "Deployment")
}

fn no_probe() -> ProbeList {
    ProbeList::default()
}

fn setup() -> (Arc<MockApi>, PhaseReconciler) {
    let api = Arc::new(MockApi::new());
    let cache = Arc::new(MockCache::new(api.clone()));
    let reconciler = PhaseReconciler::new(api.clone(), cache, Arc::new(NativeStrategy));
    (api, reconciler)
}

/// A live ConfigMap in `ns`, as an earlier revision would have left it.
fn live_cm(name: &str, controller: &str, revision: &str) -> DynamicObject {
    value_to_dynamic(json!({
        "apiVersion": "v1", "kind": "ConfigMap",
        "metadata": {
            "name": name, "namespace": "ns",
            "labels": { CACHE_LABEL: "True" },
            "annotations": { REVISION_ANNOTATION: revision },
            "ownerReferences": [{
                "apiVersion": "package-operator.run/v1alpha1", "kind": "ObjectSet",
                "name": controller, "uid": format!("uid-{}", controller), "controller": true
            }]
        },
        "data": { "k": "old" }
    }))
    .unwrap()
}

fn controller_name(obj: &DynamicObject) -> Option<String> {
    NativeStrategy.controller_of(&obj.metadata).map(|o| o.name)
}

#[tokio::test]
async fn creates_missing_objects_with_system_metadata() {
    let (api, r) = setup();
    let out = r.reconcile_phase(&owner("rev1", 1), &phase(vec![cm_spec("cm-1")]), &no_probe(), &[]).await.unwrap();

    assert_eq!(out.objects.len(), 1);
    assert!(out.probing.is_empty());
    let live = api.object(&configmaps(), Some("ns"), "cm-1").unwrap();
    let labels = live.metadata.labels.clone().unwrap();
    assert_eq!(labels.get(CACHE_LABEL).map(String::as_str), Some("True"));
    assert_eq!(labels.get(PACKAGE_LABEL).map(String::as_str), Some("demo"));
    assert_eq!(live.metadata.annotations.as_ref().unwrap()[REVISION_ANNOTATION], "1");
    assert_eq!(controller_name(&live).as_deref(), Some("rev1"));
    assert_eq!(api.writes().iter().filter(|w| w.kind == WriteKind::Create).count(), 1);
}

#[tokio::test]
async fn converged_phase_issues_no_writes() {
    let (api, r) = setup();
    let p = phase(vec![cm_spec("cm-1"), cm_spec("cm-2")]);
    r.reconcile_phase(&owner("rev1", 1), &p, &no_probe(), &[]).await.unwrap();
    api.clear_writes();

    r.reconcile_phase(&owner("rev1", 1), &p, &no_probe(), &[]).await.unwrap();
    assert!(api.writes().is_empty(), "unexpected writes: {:?}", api.writes());
}

#[tokio::test]
async fn drift_is_reverted() {
    let (api, r) = setup();
    let p = phase(vec![cm_spec("cm-1")]);
    r.reconcile_phase(&owner("rev1", 1), &p, &no_probe(), &[]).await.unwrap();
    api.patch_merge(&configmaps(), Some("ns"), "cm-1", &json!({ "data": { "k": "drifted", "extra": "x" } }))
        .await
        .unwrap();

    r.reconcile_phase(&owner("rev1", 1), &p, &no_probe(), &[]).await.unwrap();
    let live = api.object(&configmaps(), Some("ns"), "cm-1").unwrap();
    assert_eq!(live.data["data"]["k"], "v");
    // Fields the phase does not mention are left alone.
    assert_eq!(live.data["data"]["extra"], "x");
}

#[tokio::test]
async fn adopts_objects_of_previous_revision() {
    let (api, r) = setup();
    api.insert(live_cm("cm-1", "rev1", "1"));
    let previous = vec![PreviousRevision::new(identity("rev1"), &[])];

    r.reconcile_phase(&owner("rev2", 2), &phase(vec![cm_spec("cm-1")]), &no_probe(), &previous).await.unwrap();

    let live = api.object(&configmaps(), Some("ns"), "cm-1").unwrap();
    assert_eq!(controller_name(&live).as_deref(), Some("rev2"));
    assert!(NativeStrategy.is_owner(&identity("rev1"), &live.metadata));
    assert_eq!(live.metadata.annotations.as_ref().unwrap()[REVISION_ANNOTATION], "2");
    assert_eq!(live.data["data"]["k"], "v");
}

#[tokio::test]
async fn foreign_controller_is_a_conflict() {
    let (api, r) = setup();
    api.insert(live_cm("cm-1", "stranger", "1"));
    let o = owner("rev2", 2);

    let err = r.reconcile_phase(&o, &phase(vec![cm_spec("cm-1")]), &no_probe(), &[]).await.unwrap_err();
    assert!(matches!(err, PhaseError::NotOwnedByPreviousRevision { .. }));
    assert!(err.is_adoption_refused());

    let mut conditions = Vec::new();
    assert_eq!(report_error(&err, &mut conditions, o.generation), Some(MISCONFIGURATION_RETRY));
    let available = find_condition(&conditions, types::AVAILABLE).unwrap();
    assert_eq!(available.reason, reasons::CONFLICT);
    assert_eq!(available.observed_generation, Some(4));
    assert_eq!(controller_name(&api.object(&configmaps(), Some("ns"), "cm-1").unwrap()).as_deref(), Some("stranger"));
}

#[tokio::test]
async fn uncontrolled_objects_follow_collision_protection() {
    let (api, r) = setup();
    let mut orphan = live_cm("cm-1", "x", "");
    orphan.metadata.owner_references = None;
    api.insert(orphan);

    let mut spec = cm_spec("cm-1");
    let err = r.reconcile_phase(&owner("rev1", 1), &phase(vec![spec.clone()]), &no_probe(), &[]).await.unwrap_err();
    assert!(err.is_adoption_refused());

    spec.collision_protection = CollisionProtection::IfNoController;
    r.reconcile_phase(&owner("rev1", 1), &phase(vec![spec]), &no_probe(), &[]).await.unwrap();
    let live = api.object(&configmaps(), Some("ns"), "cm-1").unwrap();
    assert_eq!(controller_name(&live).as_deref(), Some("rev1"));
}

#[tokio::test]
async fn force_adoption_overrides_protection() {
    let (api, r) = setup();
    let r = r.with_force_adoption(true);
    api.insert(live_cm("cm-1", "stranger", "1"));
    r.reconcile_phase(&owner("rev2", 2), &phase(vec![cm_spec("cm-1")]), &no_probe(), &[]).await.unwrap();
    let live = api.object(&configmaps(), Some("ns"), "cm-1").unwrap();
    assert_eq!(controller_name(&live).as_deref(), Some("rev2"));
}

#[tokio::test]
async fn objects_of_newer_revisions_are_only_observed() {
    let (api, r) = setup();
    api.insert(live_cm("cm-1", "rev3", "3"));
    let previous = vec![PreviousRevision::new(identity("rev1"), &[])];

    let out =
        r.reconcile_phase(&owner("rev2", 2), &phase(vec![cm_spec("cm-1")]), &no_probe(), &previous).await.unwrap();
    assert_eq!(out.objects.len(), 1);
    assert!(api.writes().is_empty());
    let live = api.object(&configmaps(), Some("ns"), "cm-1").unwrap();
    assert_eq!(controller_name(&live).as_deref(), Some("rev3"));
    assert_eq!(live.data["data"]["k"], "old");
}

#[tokio::test]
async fn probe_failures_name_each_object() {
    let (_api, r) = setup();
    let deploy = object(json!({
        "apiVersion": "apps/v1", "kind": "Deployment",
        "metadata": { "name": "web" },
        "spec": { "replicas": 1 }
    }));
    let probe = parse(&[ObjectSetProbe {
        probes: vec![Probe {
            condition: Some(ProbeConditionSpec { type_: "Available".into(), status: "True".into() }),
            ..Default::default()
        }],
        ..Default::default()
    }])
    .unwrap();

    let out = r.reconcile_phase(&owner("rev1", 1), &phase(vec![deploy]), probe.as_ref(), &[]).await.unwrap();
    assert_eq!(
        out.probing.failures,
        vec![r#"apps Deployment ns/web: condition "Available" == "True": missing .status.conditions"#.to_string()]
    );
    assert!(out.probing.to_string().starts_with(r#"Phase "deploy" failed: apps Deployment ns/web"#));
}

#[tokio::test]
async fn paused_owner_observes_without_writing() {
    let (api, r) = setup();
    let mut o = owner("rev1", 1);
    o.paused = true;

    let out = r.reconcile_phase(&o, &phase(vec![cm_spec("cm-1")]), &no_probe(), &[]).await.unwrap();
    assert!(out.objects.is_empty());
    assert_eq!(out.probing.failures, vec![" ConfigMap ns/cm-1: not found".to_string()]);
    assert!(api.writes().is_empty());
}

#[tokio::test]
async fn conditions_are_mapped_from_current_generation_only() {
    let (api, r) = setup();
    let mut spec = object(json!({
        "apiVersion": "apps/v1", "kind": "Deployment",
        "metadata": { "name": "web" },
        "spec": { "replicas": 1 }
    }));
    spec.condition_mappings = vec![
        ConditionMapping { source_type: "Available".into(), destination_type: "my-prefix/Available".into() },
        ConditionMapping { source_type: "Progressing".into(), destination_type: "my-prefix/Progressing".into() },
    ];
    let p = phase(vec![spec]);
    r.reconcile_phase(&owner("rev1", 1), &p, &no_probe(), &[]).await.unwrap();
    api.update_status(
        &deployments(),
        Some("ns"),
        "web",
        &json!({ "conditions": [
            { "type": "Available", "status": "True", "reason": "MinimumReplicasAvailable", "observedGeneration": 1,
              "lastTransitionTime": "2024-05-01T10:00:00Z" },
            { "type": "Progressing", "status": "True", "observedGeneration": 7 }
        ]}),
    )
    .await
    .unwrap();

    let out = r.reconcile_phase(&owner("rev1", 1), &p, &no_probe(), &[]).await.unwrap();
    assert_eq!(out.conditions.len(), 1);
    let mapped = find_condition(&out.conditions, "my-prefix/Available").unwrap();
    assert!(mapped.is_true());
    assert_eq!(mapped.reason, "MinimumReplicasAvailable");
    assert_eq!(mapped.observed_generation, Some(4));
    assert_eq!(mapped.last_transition_time.as_deref(), Some("2024-05-01T10:00:00Z"));
}

#[tokio::test]
async fn preflight_rejects_objects_outside_the_owner_namespace() {
    let (api, r) = setup();
    let foreign = object(json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "cm", "namespace": "other" } }));
    let cluster = object(json!({ "apiVersion": "v1", "kind": "Namespace", "metadata": { "name": "team" } }));
    let o = owner("rev1", 1);

    let err = r.reconcile_phase(&o, &phase(vec![cm_spec("ok"), foreign, cluster]), &no_probe(), &[]).await.unwrap_err();
    let PhaseError::Preflight(pre) = &err else { panic!("expected preflight error, got {err}") };
    assert_eq!(pre.violations.len(), 2);
    assert_eq!(
        err.to_string(),
        r#"Phase "deploy", ConfigMap other/cm: must be within namespace "ns", Phase "deploy", Namespace team: cluster-scoped object requires a cluster-scoped owner"#
    );
    assert!(api.writes().is_empty());

    let mut conditions = Vec::new();
    report_error(&err, &mut conditions, o.generation);
    assert_eq!(find_condition(&conditions, types::AVAILABLE).unwrap().reason, reasons::PREFLIGHT_ERROR);
}

#[tokio::test]
async fn objects_without_cache_label_are_relabelled() {
    let (api, r) = setup();
    let mut unlabelled = live_cm("cm-1", "rev1", "1");
    unlabelled.metadata.labels = None;
    api.insert(unlabelled);

    r.reconcile_phase(&owner("rev1", 1), &phase(vec![cm_spec("cm-1")]), &no_probe(), &[]).await.unwrap();
    let live = api.object(&configmaps(), Some("ns"), "cm-1").unwrap();
    assert_eq!(live.metadata.labels.as_ref().unwrap()[CACHE_LABEL], "True");
    assert_eq!(api.writes().iter().map(|w| w.kind).collect::<Vec<_>>(), vec![WriteKind::Apply]);
}

#[tokio::test]
async fn teardown_deletes_controlled_and_releases_handed_over_objects() {
    let (api, r) = setup();
    let rev1 = owner("rev1", 1);
    let p = phase(vec![cm_spec("cm-1"), cm_spec("cm-2")]);
    r.reconcile_phase(&rev1, &p, &no_probe(), &[]).await.unwrap();

    // rev2 takes over cm-1 only.
    let previous = vec![PreviousRevision::new(identity("rev1"), &[])];
    r.reconcile_phase(&owner("rev2", 2), &phase(vec![cm_spec("cm-1")]), &no_probe(), &previous).await.unwrap();

    assert!(!r.teardown_phase(&rev1, &p).await.unwrap());
    assert!(api.object(&configmaps(), Some("ns"), "cm-2").is_none());
    let handed_over = api.object(&configmaps(), Some("ns"), "cm-1").unwrap();
    assert!(!NativeStrategy.is_owner(&identity("rev1"), &handed_over.metadata));
    assert_eq!(controller_name(&handed_over).as_deref(), Some("rev2"));

    assert!(r.teardown_phase(&rev1, &p).await.unwrap());
}

#[tokio::test]
async fn teardown_waits_for_finalizers() {
    let (api, r) = setup();
    let rev1 = owner("rev1", 1);
    let p = phase(vec![cm_spec("cm-1")]);
    r.reconcile_phase(&rev1, &p, &no_probe(), &[]).await.unwrap();
    api.patch_merge(&configmaps(), Some("ns"), "cm-1", &json!({ "metadata": { "finalizers": ["hold"] } }))
        .await
        .unwrap();

    assert!(!r.teardown_phase(&rev1, &p).await.unwrap());
    assert!(!r.teardown_phase(&rev1, &p).await.unwrap());
    api.patch_merge(&configmaps(), Some("ns"), "cm-1", &json!({ "metadata": { "finalizers": null } })).await.unwrap();
    assert!(r.teardown_phase(&rev1, &p).await.unwrap());
}

#[tokio::test]
async fn invalid_objects_are_rejected_before_any_write() {
    let (api, r) = setup();
    let nameless = object(json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": {} }));
    let err = r.reconcile_phase(&owner("rev1", 1), &phase(vec![cm_spec("ok"), nameless]), &no_probe(), &[])
        .await
        .unwrap_err();
    assert!(matches!(err, PhaseError::InvalidObject { .. }));
    assert!(!err.is_retryable());
    assert!(api.writes().is_empty());
}

#[test]
fn remote_phases_follow_owner_scope() {
    let refs = [pko_core::apis::RemotePhaseReference { name: "rev1-hosted".into(), uid: "u".into() }];
    let ns = PreviousRevision::new(identity("rev1"), &refs);
    assert_eq!(ns.remote_phases[0].kind, "ObjectSetPhase");
    assert_eq!(ns.remote_phases[0].namespace.as_deref(), Some("ns"));

    let cluster = OwnerIdentity { kind: "ClusterObjectSet".into(), namespace: None, ..identity("rev1") };
    let cl = PreviousRevision::new(cluster, &refs);
    assert_eq!(cl.remote_phases[0].kind, "ClusterObjectSetPhase");
}
