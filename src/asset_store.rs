use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::dsl::TextureShape;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Texture,
    LightProfile,
    BsdfMeasurement,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [
        ResourceKind::Texture,
        ResourceKind::LightProfile,
        ResourceKind::BsdfMeasurement,
    ];

    pub fn slot(self) -> usize {
        match self {
            ResourceKind::Texture => 0,
            ResourceKind::LightProfile => 1,
            ResourceKind::BsdfMeasurement => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Texture => "texture",
            ResourceKind::LightProfile => "light_profile",
            ResourceKind::BsdfMeasurement => "bsdf_measurement",
        }
    }
}

/// Kind-specific metadata reported by a [`ResourceStore`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceMeta {
    Texture {
        shape: TextureShape,
        width: u32,
        height: u32,
        depth: u32,
    },
    LightProfile {
        power: f32,
        maximum: f32,
    },
    BsdfMeasurement,
}

impl ResourceMeta {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceMeta::Texture { .. } => ResourceKind::Texture,
            ResourceMeta::LightProfile { .. } => ResourceKind::LightProfile,
            ResourceMeta::BsdfMeasurement => ResourceKind::BsdfMeasurement,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceAttributes {
    pub valid: bool,
    pub meta: ResourceMeta,
}

impl ResourceAttributes {
    /// Attributes of a reference the store could not resolve.
    pub fn invalid(kind: ResourceKind) -> Self {
        let meta = match kind {
            ResourceKind::Texture => ResourceMeta::Texture {
                shape: TextureShape::Invalid,
                width: 0,
                height: 0,
                depth: 0,
            },
            ResourceKind::LightProfile => ResourceMeta::LightProfile {
                power: 0.0,
                maximum: 0.0,
            },
            ResourceKind::BsdfMeasurement => ResourceMeta::BsdfMeasurement,
        };
        Self { valid: false, meta }
    }

    pub fn shape(&self) -> TextureShape {
        match self.meta {
            ResourceMeta::Texture { shape, .. } if self.valid => shape,
            _ => TextureShape::Invalid,
        }
    }
}

/// External store resolving resource names to their validity and metadata.
pub trait ResourceStore {
    fn resource_attributes(&self, kind: ResourceKind, name: &str) -> ResourceAttributes;
}

/// Thread-safe, clone-friendly in-memory resource store keyed by kind and name.
///
/// Names that were never inserted resolve as invalid.
#[derive(Debug, Clone, Default)]
pub struct AssetStore {
    inner: Arc<Mutex<HashMap<(ResourceKind, String), ResourceAttributes>>>,
}

/// One entry of an asset list file.
#[derive(Debug, Deserialize)]
struct AssetEntry {
    name: String,
    #[serde(default = "default_valid")]
    valid: bool,
    meta: ResourceMeta,
}

fn default_valid() -> bool {
    true
}

impl AssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a store from a JSON list of `{ "name", "valid"?, "meta": { "kind", ... } }`.
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        let entries: Vec<AssetEntry> = serde_json::from_str(text)
            .map_err(|e| anyhow::anyhow!("invalid asset list json: {e}"))?;
        let store = Self::new();
        for entry in entries {
            let kind = entry.meta.kind();
            store.insert(
                kind,
                entry.name,
                ResourceAttributes {
                    valid: entry.valid,
                    meta: entry.meta,
                },
            );
        }
        Ok(store)
    }

    pub fn insert_texture(&self, name: impl Into<String>, shape: TextureShape, size: [u32; 3]) {
        self.insert(
            ResourceKind::Texture,
            name,
            ResourceAttributes {
                valid: true,
                meta: ResourceMeta::Texture {
                    shape,
                    width: size[0],
                    height: size[1],
                    depth: size[2],
                },
            },
        );
    }

    pub fn insert_light_profile(&self, name: impl Into<String>, power: f32, maximum: f32) {
        self.insert(
            ResourceKind::LightProfile,
            name,
            ResourceAttributes {
                valid: true,
                meta: ResourceMeta::LightProfile { power, maximum },
            },
        );
    }

    pub fn insert_bsdf_measurement(&self, name: impl Into<String>) {
        self.insert(
            ResourceKind::BsdfMeasurement,
            name,
            ResourceAttributes {
                valid: true,
                meta: ResourceMeta::BsdfMeasurement,
            },
        );
    }

    /// Insert or replace the attributes of one resource.
    pub fn insert(&self, kind: ResourceKind, name: impl Into<String>, attributes: ResourceAttributes) {
        let Ok(mut map) = self.inner.lock() else {
            return;
        };
        map.insert((kind, name.into()), attributes);
    }

    pub fn contains(&self, kind: ResourceKind, name: &str) -> bool {
        self.inner
            .lock()
            .ok()
            .is_some_and(|map| map.contains_key(&(kind, name.to_string())))
    }

    pub fn remove(&self, kind: ResourceKind, name: &str) -> Option<ResourceAttributes> {
        self.inner.lock().ok()?.remove(&(kind, name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResourceStore for AssetStore {
    fn resource_attributes(&self, kind: ResourceKind, name: &str) -> ResourceAttributes {
        let Ok(map) = self.inner.lock() else {
            return ResourceAttributes::invalid(kind);
        };
        map.get(&(kind, name.to_string()))
            .cloned()
            .unwrap_or_else(|| ResourceAttributes::invalid(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_names_resolve_invalid() {
        let store = AssetStore::new();
        let attrs = store.resource_attributes(ResourceKind::Texture, "missing.png");
        assert!(!attrs.valid);
        assert_eq!(attrs.shape(), TextureShape::Invalid);
    }

    #[test]
    fn clones_share_contents() {
        let store = AssetStore::new();
        let other = store.clone();
        store.insert_texture("albedo.png", TextureShape::TwoD, [256, 128, 1]);
        assert!(other.contains(ResourceKind::Texture, "albedo.png"));
        let attrs = other.resource_attributes(ResourceKind::Texture, "albedo.png");
        assert_eq!(attrs.shape(), TextureShape::TwoD);
        assert_eq!(
            attrs.meta,
            ResourceMeta::Texture {
                shape: TextureShape::TwoD,
                width: 256,
                height: 128,
                depth: 1
            }
        );
    }

    #[test]
    fn loads_asset_list_json() {
        let store = AssetStore::from_json(
            r#"[
                {"name": "wood.png", "meta": {"kind": "texture", "shape": "2d", "width": 64, "height": 32, "depth": 1}},
                {"name": "lamp.ies", "valid": false, "meta": {"kind": "light_profile", "power": 1.0, "maximum": 1.0}}
            ]"#,
        )
        .unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.resource_attributes(ResourceKind::Texture, "wood.png").valid);
        assert!(!store.resource_attributes(ResourceKind::LightProfile, "lamp.ies").valid);
        assert!(AssetStore::from_json("{}").is_err());
    }

    #[test]
    fn kinds_do_not_collide() {
        let store = AssetStore::new();
        store.insert_light_profile("lamp", 10.0, 2.0);
        assert!(!store.contains(ResourceKind::Texture, "lamp"));
        assert!(store.resource_attributes(ResourceKind::LightProfile, "lamp").valid);
    }
}
