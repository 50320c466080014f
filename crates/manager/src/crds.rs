use anyhow::{Context as _, Result};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;

use pko_core::apis::{
    object_slice_crd, ClusterObjectDeployment, ClusterObjectSet, ClusterObjectSetPhase, ClusterObjectTemplate,
    ClusterPackage, ObjectDeployment, ObjectSet, ObjectSetPhase, ObjectTemplate, Package,
};

/// Every CRD the operator serves.
pub fn all() -> Result<Vec<CustomResourceDefinition>> {
    let mut crds = vec![
        ObjectSet::crd(),
        ClusterObjectSet::crd(),
        ObjectSetPhase::crd(),
        ClusterObjectSetPhase::crd(),
        ObjectDeployment::crd(),
        ClusterObjectDeployment::crd(),
        ObjectTemplate::crd(),
        ClusterObjectTemplate::crd(),
        Package::crd(),
        ClusterPackage::crd(),
    ];
    for namespaced in [true, false] {
        crds.push(object_slice_crd(namespaced).context("building ObjectSlice CRD")?);
    }
    Ok(crds)
}

/// CRDs as one multi-document YAML stream.
pub fn render() -> Result<String> {
    let mut out = String::new();
    for crd in all()? {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(&crd).context("serializing CRD")?);
    }
    Ok(out)
}
