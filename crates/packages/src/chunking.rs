//! Moving phase objects into ObjectSlices so deployments stay below the
//! apiserver object size limit.

use std::collections::BTreeMap;
use std::str::FromStr;

use pko_core::apis::ObjectSetObject;
use pko_core::meta::CHUNKING_STRATEGY_ANNOTATION;

/// Serialized size a slice may reach.
pub const SLICE_SIZE_LIMIT: usize = 1 << 20;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChunkingStrategy {
    /// Keep everything inline.
    NoOp,
    /// One slice per object.
    EachObject,
    /// Fill slices in order, opening a new one when the next object does not fit.
    #[default]
    BinpackNextFit,
}

impl FromStr for ChunkingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NoOp" => Ok(Self::NoOp),
            "EachObject" => Ok(Self::EachObject),
            "BinpackNextFit" => Ok(Self::BinpackNextFit),
            other => Err(format!("unknown chunking strategy {:?}", other)),
        }
    }
}

impl ChunkingStrategy {
    /// Strategy requested through the package annotations.
    pub fn of(annotations: &BTreeMap<String, String>) -> Result<Self, String> {
        annotations.get(CHUNKING_STRATEGY_ANNOTATION).map_or(Ok(Self::default()), |s| s.parse())
    }

    /// Splits the objects of one phase into slices. An empty result means the
    /// phase keeps its objects inline.
    pub fn chunk(&self, objects: &[ObjectSetObject], limit: usize) -> Result<Vec<Vec<ObjectSetObject>>, serde_json::Error> {
        match self {
            Self::NoOp => Ok(Vec::new()),
            Self::EachObject => Ok(objects.iter().map(|o| vec![o.clone()]).collect()),
            Self::BinpackNextFit => {
                let sizes = objects.iter().map(|o| serde_json::to_vec(o).map(|b| b.len())).collect::<Result<Vec<_>, _>>()?;
                if sizes.iter().sum::<usize>() <= limit {
                    return Ok(Vec::new());
                }
                let mut chunks: Vec<Vec<ObjectSetObject>> = Vec::new();
                let mut used = 0;
                for (obj, size) in objects.iter().zip(sizes) {
                    match chunks.last_mut() {
                        Some(current) if used + size <= limit => current.push(obj.clone()),
                        _ => {
                            chunks.push(vec![obj.clone()]);
                            used = 0;
                        }
                    }
                    used += size;
                }
                Ok(chunks)
            }
        }
    }
}
