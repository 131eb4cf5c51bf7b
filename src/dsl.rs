//! Serde data model for the shading networks handed to the code generator.
//!
//! A [`CompiledMaterial`] is the already-elaborated output of the front end: one
//! expression graph plus a table of field paths pointing into it, and the
//! class-compiled parameters whose values stay mutable at runtime.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextureShape {
    Invalid,
    #[serde(rename = "2d")]
    TwoD,
    #[serde(rename = "3d")]
    ThreeD,
    Cube,
    Ptex,
}

impl TextureShape {
    pub fn as_str(self) -> &'static str {
        match self {
            TextureShape::Invalid => "invalid",
            TextureShape::TwoD => "2d",
            TextureShape::ThreeD => "3d",
            TextureShape::Cube => "cube",
            TextureShape::Ptex => "ptex",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarType {
    Bool,
    Int,
    Float,
    Double,
}

/// Coarse classification of a type or value, used for layout addressing and
/// kind checks when packing argument blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Bool,
    Int,
    Enum,
    Float,
    Double,
    String,
    Vector,
    Matrix,
    Array,
    Color,
    Struct,
    Texture,
    LightProfile,
    BsdfMeasurement,
    Bsdf,
    Edf,
    Vdf,
}

impl ValueKind {
    pub fn is_compound(self) -> bool {
        matches!(
            self,
            ValueKind::Vector
                | ValueKind::Matrix
                | ValueKind::Array
                | ValueKind::Color
                | ValueKind::Struct
        )
    }

    pub fn is_resource(self) -> bool {
        matches!(
            self,
            ValueKind::Texture | ValueKind::LightProfile | ValueKind::BsdfMeasurement
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StructField {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ValueType,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValueType {
    Bool,
    Int,
    Enum { name: String },
    Float,
    Double,
    String,
    Vector { element: ScalarType, size: u8 },
    Matrix { columns: u8, rows: u8 },
    Color,
    Array { element: Box<ValueType>, size: u32 },
    Struct { name: String, fields: Vec<StructField> },
    Texture { shape: TextureShape },
    LightProfile,
    BsdfMeasurement,
    Bsdf,
    Edf,
    Vdf,
}

impl From<ScalarType> for ValueType {
    fn from(s: ScalarType) -> Self {
        match s {
            ScalarType::Bool => ValueType::Bool,
            ScalarType::Int => ValueType::Int,
            ScalarType::Float => ValueType::Float,
            ScalarType::Double => ValueType::Double,
        }
    }
}

impl ValueType {
    pub fn float_vector(size: u8) -> Self {
        ValueType::Vector {
            element: ScalarType::Float,
            size,
        }
    }

    pub fn texture_2d() -> Self {
        ValueType::Texture {
            shape: TextureShape::TwoD,
        }
    }

    /// The `texture_return` struct produced by texture-based environment functions.
    pub fn texture_return() -> Self {
        ValueType::Struct {
            name: "texture_return".to_string(),
            fields: vec![
                StructField {
                    name: "tint".to_string(),
                    ty: ValueType::Color,
                },
                StructField {
                    name: "mono".to_string(),
                    ty: ValueType::Float,
                },
            ],
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            ValueType::Bool => ValueKind::Bool,
            ValueType::Int => ValueKind::Int,
            ValueType::Enum { .. } => ValueKind::Enum,
            ValueType::Float => ValueKind::Float,
            ValueType::Double => ValueKind::Double,
            ValueType::String => ValueKind::String,
            ValueType::Vector { .. } => ValueKind::Vector,
            ValueType::Matrix { .. } => ValueKind::Matrix,
            ValueType::Color => ValueKind::Color,
            ValueType::Array { .. } => ValueKind::Array,
            ValueType::Struct { .. } => ValueKind::Struct,
            ValueType::Texture { .. } => ValueKind::Texture,
            ValueType::LightProfile => ValueKind::LightProfile,
            ValueType::BsdfMeasurement => ValueKind::BsdfMeasurement,
            ValueType::Bsdf => ValueKind::Bsdf,
            ValueType::Edf => ValueKind::Edf,
            ValueType::Vdf => ValueKind::Vdf,
        }
    }

    pub fn is_df(&self) -> bool {
        matches!(self, ValueType::Bsdf | ValueType::Edf | ValueType::Vdf)
    }

    pub fn contains_df(&self) -> bool {
        match self {
            ValueType::Bsdf | ValueType::Edf | ValueType::Vdf => true,
            ValueType::Array { element, .. } => element.contains_df(),
            ValueType::Struct { fields, .. } => fields.iter().any(|f| f.ty.contains_df()),
            _ => false,
        }
    }

    pub fn is_resource(&self) -> bool {
        self.kind().is_resource()
    }

    pub fn is_texture_return(&self) -> bool {
        matches!(self, ValueType::Struct { name, .. } if name == "texture_return")
    }

    pub fn child_count(&self) -> usize {
        match self {
            ValueType::Vector { size, .. } => *size as usize,
            ValueType::Matrix { columns, .. } => *columns as usize,
            ValueType::Color => 3,
            ValueType::Array { size, .. } => *size as usize,
            ValueType::Struct { fields, .. } => fields.len(),
            _ => 0,
        }
    }

    pub fn child_type(&self, index: usize) -> Option<ValueType> {
        if index >= self.child_count() {
            return None;
        }
        match self {
            ValueType::Vector { element, .. } => Some((*element).into()),
            ValueType::Matrix { rows, .. } => Some(ValueType::float_vector(*rows)),
            ValueType::Color => Some(ValueType::Float),
            ValueType::Array { element, .. } => Some((**element).clone()),
            ValueType::Struct { fields, .. } => Some(fields[index].ty.clone()),
            _ => None,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Bool => write!(f, "bool"),
            ValueType::Int => write!(f, "int"),
            ValueType::Enum { name } => write!(f, "enum {name}"),
            ValueType::Float => write!(f, "float"),
            ValueType::Double => write!(f, "double"),
            ValueType::String => write!(f, "string"),
            ValueType::Vector { element, size } => {
                let e = match element {
                    ScalarType::Bool => "bool",
                    ScalarType::Int => "int",
                    ScalarType::Float => "float",
                    ScalarType::Double => "double",
                };
                write!(f, "{e}{size}")
            }
            ValueType::Matrix { columns, rows } => write!(f, "float{columns}x{rows}"),
            ValueType::Color => write!(f, "color"),
            ValueType::Array { element, size } => write!(f, "{element}[{size}]"),
            ValueType::Struct { name, .. } => write!(f, "struct {name}"),
            ValueType::Texture { shape } => write!(f, "texture_{}", shape.as_str()),
            ValueType::LightProfile => write!(f, "light_profile"),
            ValueType::BsdfMeasurement => write!(f, "bsdf_measurement"),
            ValueType::Bsdf => write!(f, "bsdf"),
            ValueType::Edf => write!(f, "edf"),
            ValueType::Vdf => write!(f, "vdf"),
        }
    }
}

/// A literal value. Resource literals carry `None` as their name when the
/// reference is invalid (for example an unresolved file path in the source).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    Bool(bool),
    Int(i32),
    Enum(i32),
    Float(f32),
    Double(f64),
    String(String),
    Vector(Vec<Value>),
    Matrix(Vec<Value>),
    Color([f32; 3]),
    Array(Vec<Value>),
    Struct(Vec<Value>),
    Texture {
        name: Option<String>,
        shape: TextureShape,
    },
    LightProfile {
        name: Option<String>,
    },
    BsdfMeasurement {
        name: Option<String>,
    },
}

impl Value {
    pub fn texture(name: &str, shape: TextureShape) -> Self {
        Value::Texture {
            name: Some(name.to_string()),
            shape,
        }
    }

    pub fn float3(x: f32, y: f32, z: f32) -> Self {
        Value::Vector(vec![Value::Float(x), Value::Float(y), Value::Float(z)])
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Enum(_) => ValueKind::Enum,
            Value::Float(_) => ValueKind::Float,
            Value::Double(_) => ValueKind::Double,
            Value::String(_) => ValueKind::String,
            Value::Vector(_) => ValueKind::Vector,
            Value::Matrix(_) => ValueKind::Matrix,
            Value::Color(_) => ValueKind::Color,
            Value::Array(_) => ValueKind::Array,
            Value::Struct(_) => ValueKind::Struct,
            Value::Texture { .. } => ValueKind::Texture,
            Value::LightProfile { .. } => ValueKind::LightProfile,
            Value::BsdfMeasurement { .. } => ValueKind::BsdfMeasurement,
        }
    }

    /// Child values of a compound value. Color components are exposed as floats.
    pub fn children(&self) -> Vec<Value> {
        match self {
            Value::Vector(v) | Value::Matrix(v) | Value::Array(v) | Value::Struct(v) => v.clone(),
            Value::Color(c) => c.iter().map(|x| Value::Float(*x)).collect(),
            _ => Vec::new(),
        }
    }

    pub fn child_count(&self) -> usize {
        match self {
            Value::Vector(v) | Value::Matrix(v) | Value::Array(v) | Value::Struct(v) => v.len(),
            Value::Color(_) => 3,
            _ => 0,
        }
    }

    /// Structural check that a literal can inhabit `ty`.
    pub fn conforms_to(&self, ty: &ValueType) -> bool {
        if self.kind() != ty.kind() {
            return false;
        }
        if !self.kind().is_compound() {
            return true;
        }
        if self.child_count() != ty.child_count() {
            return false;
        }
        self.children()
            .iter()
            .enumerate()
            .all(|(i, c)| ty.child_type(i).is_some_and(|t| c.conforms_to(&t)))
    }

    /// Visit this value and every nested value, parents first.
    pub fn visit(&self, f: &mut dyn FnMut(&Value)) {
        f(self);
        match self {
            Value::Vector(v) | Value::Matrix(v) | Value::Array(v) | Value::Struct(v) => {
                for c in v {
                    c.visit(f);
                }
            }
            _ => {}
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeOp {
    Constant { value: Value },
    Parameter { index: usize },
    Call { name: String, args: Vec<NodeId> },
    /// Result of the auxiliary fragment `index` of a distribution function.
    LambdaResult { index: usize },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub op: NodeOp,
    #[serde(rename = "type")]
    pub ty: ValueType,
}

/// Arena of typed expression nodes. Call arguments always refer to nodes that
/// were created earlier, so every graph is acyclic by construction.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExprGraph {
    nodes: Vec<Node>,
}

impl ExprGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    pub fn push(&mut self, op: NodeOp, ty: ValueType) -> Result<NodeId> {
        let id = NodeId(self.nodes.len() as u32);
        if let NodeOp::Call { name, args } = &op {
            if let Some(bad) = args.iter().find(|a| a.0 >= id.0) {
                bail!("call '{name}' references undefined node {bad}");
            }
        }
        self.nodes.push(Node { op, ty });
        Ok(id)
    }

    pub fn constant(&mut self, value: Value, ty: ValueType) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            op: NodeOp::Constant { value },
            ty,
        });
        id
    }

    pub fn parameter(&mut self, index: usize, ty: ValueType) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            op: NodeOp::Parameter { index },
            ty,
        });
        id
    }

    pub fn call(&mut self, name: impl Into<String>, args: &[NodeId], ty: ValueType) -> Result<NodeId> {
        self.push(
            NodeOp::Call {
                name: name.into(),
                args: args.to_vec(),
            },
            ty,
        )
    }

    pub fn is_constant(&self, id: NodeId) -> bool {
        matches!(
            self.node(id),
            Some(Node {
                op: NodeOp::Constant { .. },
                ..
            })
        )
    }

    /// Check the construction invariant on a graph that did not come from the builders
    /// (for example one loaded from JSON).
    pub fn validate(&self) -> Result<()> {
        for (i, node) in self.nodes.iter().enumerate() {
            if let NodeOp::Call { name, args } = &node.op {
                for a in args {
                    if a.index() >= i {
                        bail!("node n{i} (call '{name}') references {a}, which is not an earlier node");
                    }
                }
            }
            if let NodeOp::Constant { value } = &node.op {
                if !value.conforms_to(&node.ty) {
                    bail!("node n{i}: constant does not conform to its type {}", node.ty);
                }
            }
        }
        Ok(())
    }

    /// Reachable nodes from `roots` in dependency order: arguments before users,
    /// roots in the given order, call arguments left to right. Each node appears once.
    pub fn post_order(&self, roots: &[NodeId]) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut seen = vec![false; self.nodes.len()];
        let mut stack: Vec<(NodeId, bool)> = Vec::new();

        for &root in roots {
            stack.push((root, false));
            while let Some((id, expanded)) = stack.pop() {
                let Some(node) = self.node(id) else {
                    continue;
                };
                if expanded {
                    out.push(id);
                    continue;
                }
                if seen[id.index()] {
                    continue;
                }
                seen[id.index()] = true;
                stack.push((id, true));
                if let NodeOp::Call { args, .. } = &node.op {
                    for a in args.iter().rev() {
                        if !seen[a.index()] {
                            stack.push((*a, false));
                        }
                    }
                }
            }
        }
        out
    }

    /// Copy the subgraph of `source` reachable from `root` into this graph.
    ///
    /// `memo` maps source ids to ids in `self`; passing the same memo across calls
    /// keeps shared sub-expressions shared.
    pub fn import(
        &mut self,
        source: &ExprGraph,
        root: NodeId,
        memo: &mut HashMap<NodeId, NodeId>,
    ) -> Result<NodeId> {
        for id in source.post_order(&[root]) {
            if memo.contains_key(&id) {
                continue;
            }
            let node = source
                .node(id)
                .ok_or_else(|| anyhow!("import: missing node {id}"))?;
            let op = match &node.op {
                NodeOp::Call { name, args } => NodeOp::Call {
                    name: name.clone(),
                    args: args
                        .iter()
                        .map(|a| memo.get(a).copied().ok_or_else(|| anyhow!("import: unmapped {a}")))
                        .collect::<Result<_>>()?,
                },
                other => other.clone(),
            };
            let new_id = self.push(op, node.ty.clone())?;
            memo.insert(id, new_id);
        }
        memo.get(&root)
            .copied()
            .ok_or_else(|| anyhow!("import: root {root} is not part of the source graph"))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MaterialParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ValueType,
    pub value: Value,
}

/// The already-elaborated material produced by the front end.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompiledMaterial {
    pub name: String,
    pub graph: ExprGraph,
    /// Field path (for example `surface.scattering`) to the node computing it.
    pub fields: BTreeMap<String, NodeId>,
    /// Class-compiled arguments. Graph `parameter` nodes index into this list.
    #[serde(default)]
    pub parameters: Vec<MaterialParameter>,
}

impl CompiledMaterial {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            graph: ExprGraph::new(),
            fields: BTreeMap::new(),
            parameters: Vec::new(),
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let material: CompiledMaterial =
            serde_json::from_str(text).context("invalid material json")?;
        material.validate()?;
        Ok(material)
    }

    pub fn validate(&self) -> Result<()> {
        self.graph
            .validate()
            .with_context(|| format!("material '{}'", self.name))?;
        for (path, id) in &self.fields {
            if self.graph.node(*id).is_none() {
                bail!("field '{path}' references missing node {id}");
            }
        }
        for (i, node) in self.graph.nodes().iter().enumerate() {
            if let NodeOp::Parameter { index } = node.op {
                let Some(p) = self.parameters.get(index) else {
                    bail!("node n{i} references parameter {index}, material has {}", self.parameters.len());
                };
                if p.ty != node.ty {
                    bail!("node n{i}: parameter '{}' is {}, node says {}", p.name, p.ty, node.ty);
                }
            }
        }
        for p in &self.parameters {
            if !p.value.conforms_to(&p.ty) {
                bail!("parameter '{}' value does not conform to {}", p.name, p.ty);
            }
        }
        Ok(())
    }

    pub fn set_field(&mut self, path: impl Into<String>, node: NodeId) {
        self.fields.insert(path.into(), node);
    }

    pub fn add_parameter(&mut self, name: impl Into<String>, ty: ValueType, value: Value) -> NodeId {
        let index = self.parameters.len();
        self.parameters.push(MaterialParameter {
            name: name.into(),
            ty: ty.clone(),
            value,
        });
        self.graph.parameter(index, ty)
    }

    pub fn lookup_sub_expression(&self, path: &str) -> Option<NodeId> {
        self.fields.get(path).copied()
    }

    pub fn argument_values(&self) -> Vec<Value> {
        self.parameters.iter().map(|p| p.value.clone()).collect()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EnvironmentArgument {
    Constant {
        value: Value,
        #[serde(rename = "type")]
        ty: ValueType,
    },
    Parameter(MaterialParameter),
}

/// A call of an environment-producing function, with its arguments already bound.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentCall {
    pub function: String,
    #[serde(rename = "returnType")]
    pub return_type: ValueType,
    #[serde(default)]
    pub arguments: Vec<EnvironmentArgument>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_rejects_forward_references() {
        let mut g = ExprGraph::new();
        let a = g.constant(Value::Float(1.0), ValueType::Float);
        assert!(g.call("math::add", &[a, NodeId(7)], ValueType::Float).is_err());
        assert!(g.call("math::add", &[a, a], ValueType::Float).is_ok());
    }

    #[test]
    fn post_order_visits_shared_nodes_once() {
        let mut g = ExprGraph::new();
        let a = g.constant(Value::Float(1.0), ValueType::Float);
        let b = g.constant(Value::Float(2.0), ValueType::Float);
        let s = g.call("math::add", &[b, a], ValueType::Float).unwrap();
        let m = g.call("math::mul", &[s, a], ValueType::Float).unwrap();
        assert_eq!(g.post_order(&[m]), vec![b, a, s, m]);
    }

    #[test]
    fn import_shares_nodes_through_memo() {
        let mut src = ExprGraph::new();
        let a = src.constant(Value::Float(1.0), ValueType::Float);
        let x = src.call("math::sin", &[a], ValueType::Float).unwrap();
        let y = src.call("math::cos", &[a], ValueType::Float).unwrap();

        let mut dst = ExprGraph::new();
        let mut memo = HashMap::new();
        dst.import(&src, x, &mut memo).unwrap();
        dst.import(&src, y, &mut memo).unwrap();
        assert_eq!(dst.len(), 3);
    }

    #[test]
    fn conforms_checks_nested_children() {
        let ty = ValueType::Array {
            element: Box::new(ValueType::Color),
            size: 2,
        };
        let ok = Value::Array(vec![Value::Color([0.0; 3]), Value::Color([1.0; 3])]);
        let bad = Value::Array(vec![Value::Color([0.0; 3])]);
        assert!(ok.conforms_to(&ty));
        assert!(!bad.conforms_to(&ty));
    }

    #[test]
    fn contains_df_looks_through_compounds() {
        let ty = ValueType::Struct {
            name: "material_surface".to_string(),
            fields: vec![StructField {
                name: "scattering".to_string(),
                ty: ValueType::Bsdf,
            }],
        };
        assert!(ty.contains_df());
        assert!(!ValueType::Color.contains_df());
    }

    #[test]
    fn material_json_roundtrip_validates_parameters() {
        let mut m = CompiledMaterial::new("plastic");
        let p = m.add_parameter("roughness", ValueType::Float, Value::Float(0.25));
        m.set_field("surface.roughness", p);
        let text = serde_json::to_string(&m).unwrap();
        let back = CompiledMaterial::from_json(&text).unwrap();
        assert_eq!(back, m);

        let mut broken = m.clone();
        broken.parameters.clear();
        assert!(broken.validate().is_err());
    }
}
