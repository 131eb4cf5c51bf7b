//! Expression-graph fragments ("lambdas") and distribution functions.
//!
//! A [`Lambda`] owns its own graph. Fragments built from a material copy the
//! reachable part of the material graph, so later edits to the material never
//! leak into an already-built fragment.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::dsl::{
    CompiledMaterial, EnvironmentArgument, EnvironmentCall, ExprGraph, MaterialParameter, NodeId,
    NodeOp, ValueType,
};

use super::code_cache::hash_bytes;
use super::error::CodegenError;
use super::resolver::{Intrinsic, NameResolver, Resolution};
use super::resources::ResourceMap;
use super::types::{ExecutionContext, UniformState};

/// Result expressions of a fragment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "form", content = "nodes", rename_all = "snake_case")]
pub enum Roots {
    /// One body expression.
    Single(NodeId),
    /// Several outputs that may share sub-expressions, selected by index at runtime.
    MultiRoot(Vec<NodeId>),
}

#[derive(Clone, Debug)]
pub struct Lambda {
    name: String,
    context: ExecutionContext,
    graph: ExprGraph,
    roots: Option<Roots>,
    parameters: Vec<MaterialParameter>,
    resources: ResourceMap,
    imported: HashMap<NodeId, NodeId>,
    uniform_state: Option<UniformState>,
}

impl Lambda {
    pub fn new(name: impl Into<String>, context: ExecutionContext) -> Self {
        Self {
            name: name.into(),
            context,
            graph: ExprGraph::new(),
            roots: None,
            parameters: Vec::new(),
            resources: ResourceMap::default(),
            imported: HashMap::new(),
            uniform_state: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn context(&self) -> ExecutionContext {
        self.context
    }

    pub fn graph(&self) -> &ExprGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut ExprGraph {
        &mut self.graph
    }

    pub fn roots(&self) -> Option<&Roots> {
        self.roots.as_ref()
    }

    pub fn parameters(&self) -> &[MaterialParameter] {
        &self.parameters
    }

    pub fn resources(&self) -> &ResourceMap {
        &self.resources
    }

    pub fn resources_mut(&mut self) -> &mut ResourceMap {
        &mut self.resources
    }

    /// Object transforms and id baked into this fragment, if any.
    pub fn uniform_state(&self) -> Option<&UniformState> {
        self.uniform_state.as_ref()
    }

    pub fn set_uniform_state(&mut self, state: Option<UniformState>) {
        self.uniform_state = state;
    }

    pub fn has_captured_parameters(&self) -> bool {
        !self.parameters.is_empty()
    }

    pub fn add_parameter(&mut self, parameter: MaterialParameter) -> NodeId {
        let index = self.parameters.len();
        let ty = parameter.ty.clone();
        self.parameters.push(parameter);
        self.graph.parameter(index, ty)
    }

    /// Root nodes in output order, whichever form the fragment uses.
    pub fn root_nodes(&self) -> Vec<NodeId> {
        match &self.roots {
            None => Vec::new(),
            Some(Roots::Single(b)) => vec![*b],
            Some(Roots::MultiRoot(r)) => r.clone(),
        }
    }

    pub fn root_type(&self, index: usize) -> Option<&ValueType> {
        let id = *self.root_nodes().get(index)?;
        self.graph.node(id).map(|n| &n.ty)
    }

    pub fn set_body(&mut self, body: NodeId) -> Result<(), CodegenError> {
        if matches!(self.roots, Some(Roots::MultiRoot(_))) {
            return Err(CodegenError::SwitchFormViolation(self.name.clone()));
        }
        self.roots = Some(Roots::Single(body));
        Ok(())
    }

    /// Turn a single-body fragment into the switch form. The body becomes root 0.
    pub fn into_switch(&mut self) {
        self.roots = match self.roots.take() {
            None => Some(Roots::MultiRoot(Vec::new())),
            Some(Roots::Single(b)) => Some(Roots::MultiRoot(vec![b])),
            multi => multi,
        };
    }

    /// Append a root expression. Fragments with a single body must go through
    /// [`Lambda::into_switch`] first.
    pub fn add_root(&mut self, root: NodeId) -> Result<usize, CodegenError> {
        match &mut self.roots {
            Some(Roots::Single(_)) => Err(CodegenError::SwitchFormViolation(self.name.clone())),
            Some(Roots::MultiRoot(list)) => {
                list.push(root);
                Ok(list.len() - 1)
            }
            None => {
                self.roots = Some(Roots::MultiRoot(vec![root]));
                Ok(0)
            }
        }
    }

    /// Hash over a canonical serialization of everything that determines the code
    /// of this fragment except its name.
    pub fn content_hash(&self) -> serde_json::Result<[u8; 32]> {
        let reachable = self.graph.post_order(&self.root_nodes());
        let nodes: Vec<_> = reachable
            .iter()
            .filter_map(|id| self.graph.node(*id).map(|n| json!({ "id": id.0, "node": n })))
            .collect();
        // argument values live in the argument block, not in the code
        let parameters: Vec<_> = self
            .parameters
            .iter()
            .map(|p| json!({ "name": p.name, "type": p.ty }))
            .collect();
        let canonical = json!({
            "context": self.context,
            "roots": self.roots,
            "nodes": nodes,
            "parameters": parameters,
            "uniform_state": self.uniform_state,
        });
        Ok(hash_bytes(&serde_json::to_vec(&canonical)?))
    }

    fn check_field(
        material: &CompiledMaterial,
        path: &str,
        compile_constants: bool,
    ) -> Result<NodeId, CodegenError> {
        let id = material
            .lookup_sub_expression(path)
            .ok_or_else(|| CodegenError::InvalidPath(path.to_string()))?;
        let node = material
            .graph
            .node(id)
            .ok_or_else(|| CodegenError::InvalidPath(path.to_string()))?;
        if !compile_constants && material.graph.is_constant(id) {
            return Err(CodegenError::ConstantRejected(path.to_string()));
        }
        if node.ty.contains_df() || node.ty.is_resource() {
            return Err(CodegenError::UnsupportedFieldType {
                path: path.to_string(),
                ty: node.ty.to_string(),
            });
        }
        Ok(id)
    }

    /// Build a fragment computing the material field at `path`.
    ///
    /// All class-compiled material parameters become parameters of the fragment.
    pub fn from_sub_expression(
        material: &CompiledMaterial,
        path: &str,
        name: &str,
        compile_constants: bool,
    ) -> Result<Self, CodegenError> {
        let id = Self::check_field(material, path, compile_constants)?;
        let mut lambda = Lambda::new(name, ExecutionContext::for_path(path));
        lambda.parameters = material.parameters.clone();
        let mut memo = HashMap::new();
        let body = lambda
            .graph
            .import(&material.graph, id, &mut memo)
            .map_err(|_| CodegenError::InvalidPath(path.to_string()))?;
        lambda.imported = memo;
        lambda.roots = Some(Roots::Single(body));
        Ok(lambda)
    }

    /// Add the material field at `path` as a further root of a switch-form fragment
    /// built from the same material.
    pub fn add_sub_expression(
        &mut self,
        material: &CompiledMaterial,
        path: &str,
        compile_constants: bool,
    ) -> Result<usize, CodegenError> {
        if matches!(self.roots, Some(Roots::Single(_))) {
            return Err(CodegenError::SwitchFormViolation(self.name.clone()));
        }
        let id = Self::check_field(material, path, compile_constants)?;
        let found = ExecutionContext::for_path(path);
        if found != self.context {
            return Err(CodegenError::MixedExecutionContext {
                path: path.to_string(),
                expected: self.context,
                found,
            });
        }
        if self.parameters.is_empty() {
            self.parameters = material.parameters.clone();
        }
        let mut memo = std::mem::take(&mut self.imported);
        let root = self.graph.import(&material.graph, id, &mut memo);
        self.imported = memo;
        let root = root.map_err(|_| CodegenError::InvalidPath(path.to_string()))?;
        self.add_root(root)
    }

    /// Build the fragment for an environment function call.
    pub fn environment(call: &EnvironmentCall, name: &str) -> Result<Self, CodegenError> {
        let ty = &call.return_type;
        if *ty != ValueType::Color && !ty.is_texture_return() {
            return Err(CodegenError::InvalidEnvironmentType {
                function: call.function.clone(),
                found: ty.to_string(),
            });
        }
        let mut lambda = Lambda::new(name, ExecutionContext::Environment);
        let mut args = Vec::with_capacity(call.arguments.len());
        for arg in &call.arguments {
            let id = match arg {
                EnvironmentArgument::Constant { value, ty } => {
                    lambda.graph.constant(value.clone(), ty.clone())
                }
                EnvironmentArgument::Parameter(p) => lambda.add_parameter(p.clone()),
            };
            args.push(id);
        }
        let to_error = |e: anyhow::Error| CodegenError::InvalidParameters(format!("{e:#}"));
        let mut body = lambda
            .graph
            .call(call.function.clone(), &args, ty.clone())
            .map_err(to_error)?;
        if ty.is_texture_return() {
            body = lambda
                .graph
                .call("member:0", &[body], ValueType::Color)
                .map_err(to_error)?;
        }
        lambda.roots = Some(Roots::Single(body));
        Ok(lambda)
    }
}

/// A BSDF split into the distribution-specific main fragment and the value
/// sub-expressions it reads.
#[derive(Clone, Debug)]
pub struct DistributionFunction {
    main: Lambda,
    aux: Vec<Lambda>,
}

impl DistributionFunction {
    pub fn main(&self) -> &Lambda {
        &self.main
    }

    pub fn main_mut(&mut self) -> &mut Lambda {
        &mut self.main
    }

    pub fn aux(&self) -> &[Lambda] {
        &self.aux
    }

    pub fn parts_mut(&mut self) -> (&mut Lambda, &mut [Lambda]) {
        (&mut self.main, &mut self.aux)
    }

    pub fn name(&self) -> &str {
        self.main.name()
    }

    pub fn has_captured_parameters(&self) -> bool {
        self.main.has_captured_parameters()
    }

    /// Split the BSDF at `path` of `material`.
    ///
    /// Every non-constant value argument of a BSDF node becomes an auxiliary
    /// fragment; the main fragment reads it back through a `lambda_result` node.
    pub fn from_material(
        material: &CompiledMaterial,
        path: &str,
        name: &str,
        resolver: &dyn NameResolver,
        compile_constants: bool,
    ) -> Result<Self, CodegenError> {
        let id = material
            .lookup_sub_expression(path)
            .ok_or_else(|| CodegenError::InvalidPath(path.to_string()))?;
        let node = material
            .graph
            .node(id)
            .ok_or_else(|| CodegenError::InvalidPath(path.to_string()))?;
        match node.ty {
            ValueType::Bsdf => {}
            ValueType::Edf => return Err(CodegenError::EdfNotSupported(path.to_string())),
            ValueType::Vdf => return Err(CodegenError::VdfNotSupported(path.to_string())),
            ref other => {
                return Err(CodegenError::UnsupportedFieldType {
                    path: path.to_string(),
                    ty: other.to_string(),
                });
            }
        }
        if !compile_constants && material.graph.is_constant(id) {
            return Err(CodegenError::ConstantRejected(path.to_string()));
        }

        let mut splitter = Splitter {
            material,
            resolver,
            name,
            main: Lambda::new(name, ExecutionContext::for_path(path)),
            aux: Vec::new(),
            aux_of: HashMap::new(),
            main_of: HashMap::new(),
        };
        splitter.main.parameters = material.parameters.clone();
        let root = splitter.split(id)?;
        splitter.main.roots = Some(Roots::Single(root));
        Ok(Self {
            main: splitter.main,
            aux: splitter.aux,
        })
    }
}

struct Splitter<'a> {
    material: &'a CompiledMaterial,
    resolver: &'a dyn NameResolver,
    name: &'a str,
    main: Lambda,
    aux: Vec<Lambda>,
    aux_of: HashMap<NodeId, usize>,
    main_of: HashMap<NodeId, NodeId>,
}

impl Splitter<'_> {
    fn split(&mut self, id: NodeId) -> Result<NodeId, CodegenError> {
        if let Some(done) = self.main_of.get(&id) {
            return Ok(*done);
        }
        let graph = &self.material.graph;
        let node = graph
            .node(id)
            .ok_or_else(|| CodegenError::InvalidPath(id.to_string()))?;
        let NodeOp::Call { name, args } = &node.op else {
            return Err(CodegenError::UnsupportedBsdf(format!("{} node {id}", node.ty)));
        };
        match self.resolver.resolve(name) {
            Some(Resolution::Intrinsic(Intrinsic::Bsdf(_))) => {}
            _ => return Err(CodegenError::UnsupportedBsdf(name.clone())),
        }

        let mut new_args = Vec::with_capacity(args.len());
        for &arg in args {
            let arg_node = graph
                .node(arg)
                .ok_or_else(|| CodegenError::InvalidPath(arg.to_string()))?;
            let mapped = if arg_node.ty == ValueType::Bsdf {
                self.split(arg)?
            } else if arg_node.ty.is_df() {
                return Err(CodegenError::UnsupportedBsdf(format!("{name} with {} argument", arg_node.ty)));
            } else if let NodeOp::Constant { value } = &arg_node.op {
                self.main.graph.constant(value.clone(), arg_node.ty.clone())
            } else {
                let index = self.aux_index(arg)?;
                self.main
                    .graph
                    .push(NodeOp::LambdaResult { index }, arg_node.ty.clone())
                    .map_err(|e| CodegenError::BackendFailure(format!("{e:#}")))?
            };
            new_args.push(mapped);
        }
        let new_id = self
            .main
            .graph
            .call(name.clone(), &new_args, ValueType::Bsdf)
            .map_err(|e| CodegenError::BackendFailure(format!("{e:#}")))?;
        self.main_of.insert(id, new_id);
        Ok(new_id)
    }

    fn aux_index(&mut self, arg: NodeId) -> Result<usize, CodegenError> {
        if let Some(i) = self.aux_of.get(&arg) {
            return Ok(*i);
        }
        let index = self.aux.len();
        let mut lambda = Lambda::new(format!("{}_expr_{index}", self.name), ExecutionContext::Core);
        lambda.parameters = self.material.parameters.clone();
        let root = lambda
            .graph
            .import(&self.material.graph, arg, &mut HashMap::new())
            .map_err(|e| CodegenError::BackendFailure(format!("{e:#}")))?;
        lambda.roots = Some(Roots::Single(root));
        self.aux.push(lambda);
        self.aux_of.insert(arg, index);
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::resolver::StandardResolver;
    use crate::dsl::Value;

    fn material() -> CompiledMaterial {
        let mut m = CompiledMaterial::new("test");
        let tint = m.add_parameter("tint", ValueType::Color, Value::Color([0.5, 0.5, 0.5]));
        let r = m.graph.constant(Value::Float(0.0), ValueType::Float);
        let bsdf = m
            .graph
            .call("df::diffuse_reflection_bsdf", &[tint, r], ValueType::Bsdf)
            .unwrap();
        let disp = m.graph.constant(Value::float3(0.0, 0.0, 0.0), ValueType::float_vector(3));
        let n = m.graph.call("state::normal", &[], ValueType::float_vector(3)).unwrap();
        let edf = m.graph.call("df::diffuse_edf", &[], ValueType::Edf).unwrap();
        m.set_field("surface.scattering", bsdf);
        m.set_field("surface.emission.emission", edf);
        m.set_field("geometry.displacement", disp);
        m.set_field("geometry.normal", n);
        m.set_field("surface.tint", tint);
        m
    }

    #[test]
    fn single_body_rejects_roots_until_converted() {
        let m = material();
        let mut l = Lambda::from_sub_expression(&m, "geometry.normal", "f", true).unwrap();
        let err = l.add_sub_expression(&m, "surface.tint", true).unwrap_err();
        assert_eq!(err.code(), -11);

        l.into_switch();
        assert_eq!(l.add_sub_expression(&m, "surface.tint", true).unwrap(), 1);
        assert_eq!(l.root_nodes().len(), 2);
        assert!(l.set_body(NodeId(0)).is_err());
    }

    #[test]
    fn switch_rejects_mixed_contexts() {
        let m = material();
        let mut l = Lambda::from_sub_expression(&m, "geometry.normal", "f", true).unwrap();
        l.into_switch();
        let err = l.add_sub_expression(&m, "geometry.displacement", true).unwrap_err();
        assert_eq!(err.code(), -7);
    }

    #[test]
    fn field_checks_report_documented_codes() {
        let m = material();
        assert_eq!(Lambda::from_sub_expression(&m, "nope", "f", true).unwrap_err().code(), -2);
        assert_eq!(
            Lambda::from_sub_expression(&m, "surface.scattering", "f", true).unwrap_err().code(),
            -5
        );
        assert_eq!(
            Lambda::from_sub_expression(&m, "geometry.displacement", "f", false).unwrap_err().code(),
            -4
        );
    }

    #[test]
    fn content_hash_ignores_name_but_not_structure() {
        let m = material();
        let a = Lambda::from_sub_expression(&m, "geometry.normal", "a", true).unwrap();
        let b = Lambda::from_sub_expression(&m, "geometry.normal", "b", true).unwrap();
        let c = Lambda::from_sub_expression(&m, "surface.tint", "a", true).unwrap();
        assert_eq!(a.content_hash().unwrap(), b.content_hash().unwrap());
        assert_ne!(a.content_hash().unwrap(), c.content_hash().unwrap());
    }

    #[test]
    fn distribution_split_moves_values_into_aux_fragments() {
        let m = material();
        let r = StandardResolver::new();
        let df = DistributionFunction::from_material(&m, "surface.scattering", "mat", &r, true).unwrap();
        assert_eq!(df.aux().len(), 1);
        assert_eq!(df.aux()[0].name(), "mat_expr_0");
        assert!(df.main().has_captured_parameters());

        let err = DistributionFunction::from_material(&m, "surface.emission.emission", "e", &r, true)
            .unwrap_err();
        assert_eq!(err.code(), -8);
    }

    #[test]
    fn environment_requires_color_or_texture_return() {
        let call = EnvironmentCall {
            function: "env::sky".to_string(),
            return_type: ValueType::Float,
            arguments: vec![],
        };
        assert_eq!(Lambda::environment(&call, "env").unwrap_err().code(), -2);

        let call = EnvironmentCall {
            return_type: ValueType::texture_return(),
            ..call
        };
        let l = Lambda::environment(&call, "env").unwrap();
        assert_eq!(l.context(), ExecutionContext::Environment);
        assert_eq!(l.root_type(0), Some(&ValueType::Color));
    }
}
