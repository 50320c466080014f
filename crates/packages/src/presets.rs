//! Phases and probes for well-known kinds, used when a manifest does not
//! declare its own.

use pko_core::apis::{
    ObjectSetProbe, Probe, ProbeCelSpec, ProbeConditionSpec, ProbeFieldsEqualSpec, ProbeKindSelector, ProbeSelector,
};

pub const OTHER_PHASE: &str = "other";

/// Preset phase names in rollout order.
pub const PHASES: [&str; 8] = ["namespaces", "policies", "rbac", "crds", "storage", "deploy", "publish", OTHER_PHASE];

const PHASE_KINDS: &[(&str, &[(&str, &str)])] = &[
    ("namespaces", &[("", "Namespace")]),
    (
        "policies",
        &[
            ("", "ResourceQuota"),
            ("", "LimitRange"),
            ("scheduling.k8s.io", "PriorityClass"),
            ("networking.k8s.io", "NetworkPolicy"),
            ("autoscaling", "HorizontalPodAutoscaler"),
            ("policy", "PodDisruptionBudget"),
        ],
    ),
    (
        "rbac",
        &[
            ("", "ServiceAccount"),
            ("rbac.authorization.k8s.io", "Role"),
            ("rbac.authorization.k8s.io", "RoleBinding"),
            ("rbac.authorization.k8s.io", "ClusterRole"),
            ("rbac.authorization.k8s.io", "ClusterRoleBinding"),
        ],
    ),
    ("crds", &[("apiextensions.k8s.io", "CustomResourceDefinition")]),
    ("storage", &[("", "PersistentVolume"), ("", "PersistentVolumeClaim"), ("storage.k8s.io", "StorageClass")]),
    (
        "deploy",
        &[
            ("apps", "Deployment"),
            ("apps", "DaemonSet"),
            ("apps", "StatefulSet"),
            ("apps", "ReplicaSet"),
            ("", "Pod"),
            ("batch", "Job"),
            ("batch", "CronJob"),
            ("", "Service"),
            ("", "Secret"),
            ("", "ConfigMap"),
        ],
    ),
    (
        "publish",
        &[
            ("networking.k8s.io", "Ingress"),
            ("apiregistration.k8s.io", "APIService"),
            ("route.openshift.io", "Route"),
            ("admissionregistration.k8s.io", "MutatingWebhookConfiguration"),
            ("admissionregistration.k8s.io", "ValidatingWebhookConfiguration"),
        ],
    ),
];

/// Preset phase for a group/kind; unknown kinds go last.
pub fn phase_for(group: &str, kind: &str) -> &'static str {
    PHASE_KINDS
        .iter()
        .find(|(_, kinds)| kinds.iter().any(|(g, k)| *g == group && *k == kind))
        .map_or(OTHER_PHASE, |(phase, _)| *phase)
}

fn condition(type_: &str) -> Probe {
    Probe { condition: Some(ProbeConditionSpec { type_: type_.into(), status: "True".into() }), ..Default::default() }
}

fn fields_equal(a: &str, b: &str) -> Probe {
    Probe { fields_equal: Some(ProbeFieldsEqualSpec { field_a: a.into(), field_b: b.into() }), ..Default::default() }
}

fn cel(rule: &str, message: &str) -> Probe {
    Probe { cel: Some(ProbeCelSpec { rule: rule.into(), message: message.into() }), ..Default::default() }
}

fn rolled_out() -> Vec<Probe> {
    vec![condition("Available"), fields_equal(".status.updatedReplicas", ".status.replicas")]
}

/// Default availability probes for a group/kind, if there are any.
pub fn probe_for(group: &str, kind: &str) -> Option<ObjectSetProbe> {
    let probes = match (group, kind) {
        ("apps", "Deployment" | "StatefulSet" | "ReplicaSet") => rolled_out(),
        ("apps", "DaemonSet") => vec![fields_equal(".status.desiredNumberScheduled", ".status.numberAvailable")],
        ("apiextensions.k8s.io", "CustomResourceDefinition") => vec![condition("Established")],
        ("batch", "Job") => vec![condition("Complete")],
        ("route.openshift.io", "Route") => vec![cel(
            r#"self.status.ingress.all(i, i.conditions.all(c, c.type == "Ready" && c.status == "True"))"#,
            "not all ingress points are reporting ready",
        )],
        ("", "PersistentVolumeClaim") => vec![cel(r#"self.status.phase == "Bound""#, "is not yet Bound")],
        ("package-operator.run", "Package" | "ClusterPackage") => vec![condition("Available")],
        _ => return None,
    };
    Some(ObjectSetProbe {
        selector: ProbeSelector {
            kind: Some(ProbeKindSelector { group: group.into(), kind: kind.into() }),
            selector: None,
        },
        probes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_phases() {
        assert_eq!(phase_for("", "Namespace"), "namespaces");
        assert_eq!(phase_for("apps", "Deployment"), "deploy");
        assert_eq!(phase_for("", "Deployment"), OTHER_PHASE);
        assert_eq!(phase_for("example.com", "Widget"), OTHER_PHASE);
        for (phase, _) in PHASE_KINDS {
            assert!(PHASES.contains(phase));
        }
    }

    #[test]
    fn deployments_wait_for_rollout() {
        let probe = probe_for("apps", "Deployment").unwrap();
        assert_eq!(probe.selector.kind.unwrap().kind, "Deployment");
        assert_eq!(probe.probes.len(), 2);
        assert!(probe_for("", "ConfigMap").is_none());
    }
}
