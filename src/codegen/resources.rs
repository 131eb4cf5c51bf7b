//! Resource registry and resource enumeration.
//!
//! Index 0 of every resource kind is reserved for "invalid/unused". A valid resource
//! gets the next free index the first time its name is seen by a registry and keeps
//! that index for the registry's whole lifetime, so every function of a link unit
//! agrees on it.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Serialize, Serializer};

use crate::asset_store::{ResourceAttributes, ResourceKind, ResourceStore};
use crate::dsl::{NodeOp, TextureShape, Value};

use super::lambda::{DistributionFunction, Lambda};
use super::resolver::{NameResolver, Resolution};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    /// `None` for references that never had a name.
    pub name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResourceBinding {
    pub index: u32,
    pub attributes: ResourceAttributes,
}

/// Per-fragment view of the resources it references, filled by enumeration.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResourceMap {
    entries: BTreeMap<ResourceKey, ResourceBinding>,
}

/// Serialized as a sequence of `[key, binding]` pairs in key order; struct keys
/// have no JSON object form.
impl Serialize for ResourceMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(&self.entries)
    }
}

impl ResourceMap {
    pub fn get(&self, kind: ResourceKind, name: Option<&str>) -> Option<&ResourceBinding> {
        self.entries.get(&ResourceKey {
            kind,
            name: name.map(str::to_string),
        })
    }

    pub fn insert(&mut self, key: ResourceKey, binding: ResourceBinding) {
        self.entries.insert(key, binding);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ResourceKey, &ResourceBinding)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resource kind and name of a literal, if it is a resource literal.
pub fn resource_ref(value: &Value) -> Option<(ResourceKind, Option<&str>)> {
    match value {
        Value::Texture { name, .. } => Some((ResourceKind::Texture, name.as_deref())),
        Value::LightProfile { name } => Some((ResourceKind::LightProfile, name.as_deref())),
        Value::BsdfMeasurement { name } => Some((ResourceKind::BsdfMeasurement, name.as_deref())),
        _ => None,
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResourceEntry {
    pub index: u32,
    pub name: String,
    pub shape: TextureShape,
    pub attributes: ResourceAttributes,
}

#[derive(Clone, Debug)]
pub struct ResourceRegistry {
    counters: [u32; 3],
    indices: HashMap<(ResourceKind, String), u32>,
    tables: [Vec<ResourceEntry>; 3],
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceRegistry {
    pub fn new() -> Self {
        let reserved = |kind| {
            vec![ResourceEntry {
                index: 0,
                name: String::new(),
                shape: TextureShape::Invalid,
                attributes: ResourceAttributes::invalid(kind),
            }]
        };
        Self {
            counters: [0; 3],
            indices: HashMap::new(),
            tables: [
                reserved(ResourceKind::Texture),
                reserved(ResourceKind::LightProfile),
                reserved(ResourceKind::BsdfMeasurement),
            ],
        }
    }

    /// Return the index of `name`, registering it if this is its first sighting.
    /// Invalid resources always get index 0 and are not remembered.
    pub fn register(&mut self, kind: ResourceKind, name: &str, attributes: &ResourceAttributes) -> u32 {
        if !attributes.valid {
            return 0;
        }
        if let Some(index) = self.indices.get(&(kind, name.to_string())) {
            return *index;
        }
        let slot = kind.slot();
        self.counters[slot] += 1;
        let index = self.counters[slot];
        self.indices.insert((kind, name.to_string()), index);
        self.tables[slot].push(ResourceEntry {
            index,
            name: name.to_string(),
            shape: attributes.shape(),
            attributes: attributes.clone(),
        });
        index
    }

    pub fn index_of(&self, kind: ResourceKind, name: &str) -> Option<u32> {
        self.indices.get(&(kind, name.to_string())).copied()
    }

    /// All entries of one kind in index order. Entry 0 is the reserved one.
    pub fn table(&self, kind: ResourceKind) -> &[ResourceEntry] {
        &self.tables[kind.slot()]
    }
}

/// Walks fragments and records every resource literal against a registry.
pub struct ResourceEnumerator<'a> {
    registry: &'a mut ResourceRegistry,
    store: &'a dyn ResourceStore,
    resolver: Option<&'a dyn NameResolver>,
}

impl<'a> ResourceEnumerator<'a> {
    pub fn new(registry: &'a mut ResourceRegistry, store: &'a dyn ResourceStore) -> Self {
        Self {
            registry,
            store,
            resolver: None,
        }
    }

    /// Also walk fragments that calls resolve to, since their bodies get inlined.
    pub fn with_resolver(mut self, resolver: &'a dyn NameResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Resolve one literal (and any resource literals nested in it) into `map`.
    pub fn enumerate_value(&mut self, value: &Value, map: &mut ResourceMap) {
        value.visit(&mut |v| {
            let Some((kind, name)) = resource_ref(v) else {
                return;
            };
            let key = ResourceKey {
                kind,
                name: name.map(str::to_string),
            };
            if map.entries.contains_key(&key) {
                return;
            }
            let (index, attributes) = match name {
                Some(name) => {
                    let attributes = self.store.resource_attributes(kind, name);
                    if !attributes.valid {
                        log::warn!("{} '{name}' is invalid, mapping it to index 0", kind.as_str());
                    }
                    (self.registry.register(kind, name, &attributes), attributes)
                }
                None => (0, ResourceAttributes::invalid(kind)),
            };
            map.insert(key, ResourceBinding { index, attributes });
        });
    }

    pub fn enumerate_values(&mut self, values: &[Value], map: &mut ResourceMap) {
        for v in values {
            self.enumerate_value(v, map);
        }
    }

    /// Walk every node reachable from the fragment's roots, then its captured
    /// parameter values, recording resources in the fragment's own map.
    pub fn enumerate_lambda(&mut self, lambda: &mut Lambda) {
        let mut map = std::mem::take(lambda.resources_mut());
        let mut visited = HashSet::new();
        self.walk(lambda, &mut map, &mut visited);
        let values: Vec<Value> = lambda.parameters().iter().map(|p| p.value.clone()).collect();
        self.enumerate_values(&values, &mut map);
        *lambda.resources_mut() = map;
    }

    fn walk(&mut self, lambda: &Lambda, map: &mut ResourceMap, visited: &mut HashSet<String>) {
        let graph = lambda.graph();
        for id in graph.post_order(&lambda.root_nodes()) {
            let Some(node) = graph.node(id) else {
                continue;
            };
            match &node.op {
                NodeOp::Constant { value } => self.enumerate_value(value, map),
                NodeOp::Call { name, .. } => {
                    let Some(resolver) = self.resolver else {
                        continue;
                    };
                    if let Some(Resolution::Fragment(callee)) = resolver.resolve(name) {
                        if visited.insert(name.clone()) {
                            self.walk(&callee, map, visited);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    /// Enumerate the main fragment, then each auxiliary fragment. Resources of the
    /// auxiliary fragments are recorded in both their own map and the main map.
    pub fn enumerate_distribution(&mut self, df: &mut DistributionFunction) {
        let (main, aux) = df.parts_mut();
        self.enumerate_lambda(main);
        for a in aux.iter_mut() {
            self.enumerate_lambda(a);
            for (key, binding) in a.resources().iter() {
                main.resources_mut().insert(key.clone(), binding.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset_store::AssetStore;

    fn store() -> AssetStore {
        let s = AssetStore::new();
        s.insert_texture("a.png", TextureShape::TwoD, [4, 4, 1]);
        s.insert_texture("b.png", TextureShape::Cube, [8, 8, 6]);
        s.insert_light_profile("lamp.ies", 120.0, 30.0);
        s
    }

    #[test]
    fn first_seen_order_and_reuse() {
        let s = store();
        let mut reg = ResourceRegistry::new();
        let mut map = ResourceMap::default();
        let mut e = ResourceEnumerator::new(&mut reg, &s);
        e.enumerate_values(
            &[
                Value::texture("a.png", TextureShape::TwoD),
                Value::texture("b.png", TextureShape::Cube),
                Value::texture("a.png", TextureShape::TwoD),
            ],
            &mut map,
        );
        assert_eq!(map.get(ResourceKind::Texture, Some("a.png")).unwrap().index, 1);
        assert_eq!(map.get(ResourceKind::Texture, Some("b.png")).unwrap().index, 2);
        let table = reg.table(ResourceKind::Texture);
        assert_eq!(table.len(), 3);
        assert_eq!(table[0].name, "");
        assert_eq!(table[2].shape, TextureShape::Cube);
    }

    #[test]
    fn invalid_references_never_consume_indices() {
        let s = store();
        let mut reg = ResourceRegistry::new();
        let mut map = ResourceMap::default();
        let mut e = ResourceEnumerator::new(&mut reg, &s);
        e.enumerate_values(
            &[
                Value::texture("missing_1.png", TextureShape::TwoD),
                Value::Texture {
                    name: None,
                    shape: TextureShape::TwoD,
                },
                Value::texture("missing_2.png", TextureShape::TwoD),
                Value::texture("a.png", TextureShape::TwoD),
            ],
            &mut map,
        );
        assert_eq!(map.get(ResourceKind::Texture, Some("missing_1.png")).unwrap().index, 0);
        assert_eq!(map.get(ResourceKind::Texture, None).unwrap().index, 0);
        assert_eq!(map.get(ResourceKind::Texture, Some("missing_2.png")).unwrap().index, 0);
        assert_eq!(map.get(ResourceKind::Texture, Some("a.png")).unwrap().index, 1);
        assert_eq!(reg.index_of(ResourceKind::Texture, "missing_1.png"), None);
    }

    #[test]
    fn kinds_have_independent_counters() {
        let s = store();
        let mut reg = ResourceRegistry::new();
        let mut map = ResourceMap::default();
        ResourceEnumerator::new(&mut reg, &s).enumerate_values(
            &[
                Value::texture("a.png", TextureShape::TwoD),
                Value::LightProfile {
                    name: Some("lamp.ies".into()),
                },
            ],
            &mut map,
        );
        assert_eq!(reg.index_of(ResourceKind::Texture, "a.png"), Some(1));
        assert_eq!(reg.index_of(ResourceKind::LightProfile, "lamp.ies"), Some(1));
        assert_eq!(reg.table(ResourceKind::BsdfMeasurement).len(), 1);
    }

    #[test]
    fn maps_serialize_as_ordered_pairs() {
        let s = store();
        let mut reg = ResourceRegistry::new();
        let mut map = ResourceMap::default();
        ResourceEnumerator::new(&mut reg, &s).enumerate_values(
            &[
                Value::texture("b.png", TextureShape::Cube),
                Value::texture("a.png", TextureShape::TwoD),
            ],
            &mut map,
        );
        let json = serde_json::to_value(&map).unwrap();
        let pairs = json.as_array().unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0][0]["name"], "a.png");
        assert_eq!(pairs[0][1]["index"], 2);
        assert_eq!(pairs[1][0]["name"], "b.png");
    }

    #[test]
    fn nested_literals_are_found() {
        let s = store();
        let mut reg = ResourceRegistry::new();
        let mut map = ResourceMap::default();
        let v = Value::Struct(vec![
            Value::Float(1.0),
            Value::Array(vec![Value::texture("b.png", TextureShape::Cube)]),
        ]);
        ResourceEnumerator::new(&mut reg, &s).enumerate_value(&v, &mut map);
        assert_eq!(map.len(), 1);
        assert_eq!(reg.index_of(ResourceKind::Texture, "b.png"), Some(1));
    }
}
