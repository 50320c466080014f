//! Reading template sources and copying their values into the render context.

use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use kube::ResourceExt;
use serde_json::{json, Value};
use tracing::info;

use pko_api::{ObjectApi, ObjectReader};
use pko_cache::ObjectWatcher;
use pko_core::apis::{ObjectTemplateKind, ObjectTemplateSource, ObjectTemplateSourceItem};
use pko_core::jsonpath;
use pko_core::meta::{CACHE_LABEL, CACHE_LABEL_VALUE};
use pko_core::object::gvk_from_parts;
use pko_ownership::OwnerIdentity;

use crate::{Context, Error, SourceError};

/// Values gathered from all sources.
#[derive(Debug, Default)]
pub(crate) struct Sampled {
    pub values: Value,
    /// Some optional source was absent; look again later.
    pub incomplete: bool,
}

fn describe(src: &ObjectTemplateSource, namespace: Option<&str>) -> String {
    match namespace {
        Some(ns) => format!("{} {}/{}", src.kind, ns, src.name),
        None => format!("{} {}", src.kind, src.name),
    }
}

/// Namespace to read `src` from. Namespaced templates stay in their own namespace.
fn source_namespace(
    template_ns: Option<&str>,
    src: &ObjectTemplateSource,
    namespaced: bool,
) -> Result<Option<String>, SourceError> {
    let requested = src.namespace.as_deref().filter(|ns| !ns.is_empty());
    let invalid = |reason: String| SourceError::Invalid { object: describe(src, requested), reason };
    match (template_ns, namespaced) {
        (Some(_), false) => Err(invalid("cluster-scoped sources need a ClusterObjectTemplate".into())),
        (Some(own), true) => match requested {
            Some(ns) if ns != own => Err(invalid(format!("must be within namespace {:?}", own))),
            _ => Ok(Some(own.to_string())),
        },
        (None, true) => match requested {
            Some(ns) => Ok(Some(ns.to_string())),
            None => Err(invalid("namespace required".into())),
        },
        (None, false) => Ok(None),
    }
}

/// Copies `.key` of `source` to `.destination` of `values`.
pub(crate) fn copy_item(source: &Value, item: &ObjectTemplateSourceItem, values: &mut Value) -> Result<(), String> {
    if !item.destination.starts_with('.') {
        return Err(format!("destination {:?} must start with '.'", item.destination));
    }
    let segments = jsonpath::parse(&item.key).map_err(|e| e.to_string())?;
    let value = jsonpath::get_segments(source, &segments).ok_or_else(|| format!("key {:?} not found", item.key))?;
    jsonpath::set(values, &item.destination, value.clone()).map_err(|e| e.to_string())
}

/// Labels an object so the dynamic cache informers pick it up.
async fn label_for_cache(api: &dyn ObjectApi, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<(), Error> {
    let patch = json!({ "metadata": { "labels": { CACHE_LABEL: CACHE_LABEL_VALUE } } });
    api.patch_merge(gvk, obj.namespace().as_deref(), &obj.name_any(), &patch).await?;
    Ok(())
}

async fn read_source(
    ctx: &Context,
    owner: &OwnerIdentity,
    gvk: &GroupVersionKind,
    namespace: Option<&str>,
    name: &str,
) -> Result<Option<DynamicObject>, Error> {
    ctx.cache.watch(owner, gvk).await?;
    if let Some(obj) = ctx.cache.get(gvk, namespace, name).await? {
        return Ok(Some(obj));
    }
    // Not labeled for the cache yet: look it up directly and label it so
    // changes reach us from now on.
    let Some(obj) = ctx.api.get(gvk, namespace, name).await? else { return Ok(None) };
    label_for_cache(ctx.api.as_ref(), gvk, &obj).await?;
    Ok(Some(obj))
}

pub(crate) async fn sample<K: ObjectTemplateKind>(
    ctx: &Context,
    template: &K,
    owner: &OwnerIdentity,
) -> Result<Sampled, Error> {
    let template_ns = template.namespace();
    let mut sampled = Sampled { values: Value::Object(Default::default()), incomplete: false };
    for src in &template.body().sources {
        let gvk = gvk_from_parts(&src.api_version, &src.kind);
        let namespaced = ctx.api.is_namespaced(&gvk).await?;
        let namespace = source_namespace(template_ns.as_deref(), src, namespaced)?;
        let object = describe(src, namespace.as_deref());

        let Some(obj) = read_source(ctx, owner, &gvk, namespace.as_deref(), &src.name).await? else {
            if src.optional {
                info!(template = %template.name_any(), source = %object, "optional source not found, retrying later");
                sampled.incomplete = true;
                continue;
            }
            return Err(SourceError::Missing(object).into());
        };

        let root = serde_json::to_value(&obj)?;
        for item in &src.items {
            copy_item(&root, item, &mut sampled.values)
                .map_err(|reason| SourceError::Invalid { object: object.clone(), reason })?;
        }
    }
    Ok(sampled)
}
