//! Builds probers from API probe specs.

use pko_core::apis::{ObjectSetProbe, Probe, ProbeSelector};

use crate::{
    CelProbe, ConditionProbe, FieldsEqualProbe, KindSelector, LabelSelectorGate, ObservedGenerationGate, ProbeError,
    ProbeList, Prober,
};

/// One selector-scoped, generation-gated prober per `ObjectSetProbe`, combined by conjunction.
pub fn parse(probes: &[ObjectSetProbe]) -> Result<Box<dyn Prober>, ProbeError> {
    let mut out: Vec<Box<dyn Prober>> = Vec::with_capacity(probes.len());
    for p in probes {
        let inner = parse_probes(&p.probes)?;
        out.push(parse_selector(&p.selector, inner));
    }
    Ok(Box::new(ProbeList(out)))
}

/// Probe specs with no variant set are ignored.
pub fn parse_probes(probes: &[Probe]) -> Result<Box<dyn Prober>, ProbeError> {
    let mut list: Vec<Box<dyn Prober>> = Vec::new();
    for p in probes {
        if let Some(c) = &p.condition {
            list.push(Box::new(ConditionProbe { type_: c.type_.clone(), status: c.status.clone() }));
        }
        if let Some(fe) = &p.fields_equal {
            list.push(Box::new(FieldsEqualProbe::new(&fe.field_a, &fe.field_b)?));
        }
        if let Some(cel) = &p.cel {
            list.push(Box::new(CelProbe::new(&cel.rule, &cel.message)?));
        }
    }
    Ok(Box::new(ObservedGenerationGate(Box::new(ProbeList(list)))))
}

/// Wraps `inner` in the kind selector, then the label selector.
pub fn parse_selector(selector: &ProbeSelector, inner: Box<dyn Prober>) -> Box<dyn Prober> {
    let mut p = inner;
    if let Some(kind) = &selector.kind {
        p = Box::new(KindSelector { group: kind.group.clone(), kind: kind.kind.clone(), inner: p });
    }
    if let Some(sel) = &selector.selector {
        p = Box::new(LabelSelectorGate { selector: sel.clone(), inner: p });
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;
    use pko_core::apis::{ProbeConditionSpec, ProbeFieldsEqualSpec, ProbeKindSelector};
    use serde_json::json;

    fn deployment_probe() -> ObjectSetProbe {
        ObjectSetProbe {
            selector: ProbeSelector {
                kind: Some(ProbeKindSelector { group: "apps".into(), kind: "Deployment".into() }),
                selector: None,
            },
            probes: vec![
                Probe {
                    condition: Some(ProbeConditionSpec { type_: "Available".into(), status: "True".into() }),
                    ..Default::default()
                },
                Probe {
                    fields_equal: Some(ProbeFieldsEqualSpec {
                        field_a: ".status.updatedReplicas".into(),
                        field_b: ".status.replicas".into(),
                    }),
                    ..Default::default()
                },
                Probe::default(),
            ],
        }
    }

    #[test]
    fn parsed_probes_gate_on_kind_and_generation() {
        let prober = parse(&[deployment_probe()]).unwrap();
        let cm = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "x"}});
        assert!(prober.probe(&cm).success);

        let stale = json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": {"name": "d", "generation": 3},
            "status": {"observedGeneration": 2}
        });
        assert_eq!(prober.probe(&stale).message, ".status outdated");

        let ready = json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": {"name": "d", "generation": 3},
            "status": {
                "observedGeneration": 3, "replicas": 2, "updatedReplicas": 2,
                "conditions": [{"type": "Available", "status": "True"}]
            }
        });
        assert!(prober.probe(&ready).success);
    }

    #[test]
    fn invalid_cel_fails_parsing() {
        let probe = ObjectSetProbe {
            selector: ProbeSelector::default(),
            probes: vec![Probe {
                cel: Some(pko_core::apis::ProbeCelSpec { rule: "1".into(), message: "m".into() }),
                ..Default::default()
            }],
        };
        assert!(parse(&[probe]).is_err());
    }
}
