//! Lowering of fragments and distribution functions into the shared SSA form.
//!
//! A [`ModuleBuilder`] accumulates functions, the read-only data segment, the
//! string table and argument-block declarations. Link units keep one builder for
//! their whole lifetime; single-function compiles use a fresh one.

pub mod ir;
mod optimize;

use std::collections::HashMap;

use anyhow::{Result, anyhow, bail};

use crate::asset_store::{ResourceKind, ResourceMeta};
use crate::dsl::{ExprGraph, MaterialParameter, Node, NodeId, NodeOp, ScalarType, Value, ValueType};

use super::arg_layout::{ArgBlockLayout, LayoutAddress, LayoutRules, ResourceIndexResolver};
use super::error::Message;
use super::lambda::{DistributionFunction, Lambda, Roots};
use super::options::BackendOptions;
use super::resolver::{BsdfNode, Intrinsic, NameResolver, Resolution};
use super::resources::{ResourceBinding, ResourceMap, resource_ref};
use super::types::{ExecutionContext, FunctionKind, InternalSpace, StateUsage, UniformState};

pub use ir::{
    ArgBlockDecl, BinaryOp, Inst, InstId, IrFunction, IrModule, Op, StateField, TernaryOp, UnaryOp,
};
pub use optimize::optimize;

const MAX_INLINE_DEPTH: u32 = 64;
const RO_THRESHOLD_BYTES: u32 = 16;

/// Resources and enums are carried as plain integers once lowered.
pub fn storage_type(ty: &ValueType) -> ValueType {
    match ty {
        ValueType::Enum { .. }
        | ValueType::Texture { .. }
        | ValueType::LightProfile
        | ValueType::BsdfMeasurement => ValueType::Int,
        ValueType::Array { element, size } => ValueType::Array {
            element: Box::new(storage_type(element)),
            size: *size,
        },
        ValueType::Struct { name, fields } => ValueType::Struct {
            name: name.clone(),
            fields: fields
                .iter()
                .map(|f| crate::dsl::StructField {
                    name: f.name.clone(),
                    ty: storage_type(&f.ty),
                })
                .collect(),
        },
        other => other.clone(),
    }
}

/// Settings shared by every function lowered into one module.
#[derive(Clone, Copy)]
pub struct LowerContext<'a> {
    pub options: &'a BackendOptions,
    pub resolver: &'a dyn NameResolver,
    pub use_ro_segment: bool,
    pub rules: LayoutRules,
}

#[derive(Clone, Debug, Default)]
struct StringTable {
    strings: Vec<String>,
    ids: HashMap<String, u32>,
}

impl StringTable {
    fn intern(&mut self, s: &str) -> u32 {
        if self.strings.is_empty() {
            self.strings.push(String::new());
            self.ids.insert(String::new(), 0);
        }
        if let Some(id) = self.ids.get(s) {
            return *id;
        }
        let id = self.strings.len() as u32;
        self.strings.push(s.to_string());
        self.ids.insert(s.to_string(), id);
        id
    }
}

/// Where `parameter` nodes of the graph being lowered read from.
enum Params<'p> {
    None,
    ArgBlock { block: u32, offsets: &'p [u32] },
    Bound(&'p [InstId]),
}

#[derive(Clone, Debug)]
pub struct ModuleBuilder {
    module: IrModule,
    strings: StringTable,
    ro_index: HashMap<Vec<u8>, u32>,
}

impl ModuleBuilder {
    pub fn new(options: &BackendOptions) -> Self {
        Self {
            module: IrModule {
                num_texture_spaces: options.num_texture_spaces,
                num_texture_results: options.num_texture_results,
                ..IrModule::default()
            },
            strings: StringTable::default(),
            ro_index: HashMap::new(),
        }
    }

    pub fn module(&self) -> &IrModule {
        &self.module
    }

    pub fn function_count(&self) -> usize {
        self.module.functions.len()
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.module.function(name).is_some()
    }

    pub fn string_id(&self, s: &str) -> Option<u32> {
        self.strings.ids.get(s).copied()
    }

    /// Add `s` to the string table used when strings are mapped to ids.
    pub fn intern_string(&mut self, s: &str) -> u32 {
        self.strings.intern(s)
    }

    pub fn finish(mut self) -> IrModule {
        self.module.strings = self.strings.strings;
        self.module
    }

    /// Declare an argument block and return its index with the offsets of its
    /// top-level parameters.
    pub fn declare_arg_block(&mut self, parameters: &[MaterialParameter], layout: &ArgBlockLayout) -> (u32, Vec<u32>) {
        let index = self.module.arg_blocks.len() as u32;
        self.module.arg_blocks.push(ArgBlockDecl {
            names: parameters.iter().map(|p| p.name.clone()).collect(),
            types: parameters.iter().map(|p| storage_type(&p.ty)).collect(),
        });
        let offsets = (0..parameters.len())
            .map(|i| layout.parameter(i).map_or(0, |e| e.offset as u32))
            .collect();
        (index, offsets)
    }

    fn add_ro_data(&mut self, bytes: &[u8]) -> u32 {
        if let Some(offset) = self.ro_index.get(bytes) {
            return *offset;
        }
        let ro = &mut self.module.ro_segment;
        ro.resize(ro.len().next_multiple_of(16), 0);
        let offset = ro.len() as u32;
        ro.extend_from_slice(bytes);
        self.ro_index.insert(bytes.to_vec(), offset);
        offset
    }

    /// Lower a fragment into one entry point.
    pub fn lower_lambda(
        &mut self,
        cx: LowerContext<'_>,
        lambda: &Lambda,
        kind: FunctionKind,
        arg_block: Option<(u32, &[u32])>,
        messages: &mut Vec<Message>,
    ) -> Result<()> {
        let roots = lambda.root_nodes();
        match (kind, lambda.roots()) {
            (FunctionKind::SwitchLambda, Some(Roots::MultiRoot(_))) => {}
            (FunctionKind::SwitchLambda, _) => bail!("switch function '{}' has no root list", lambda.name()),
            (_, Some(Roots::Single(_))) => {}
            _ => bail!("function '{}' needs a single body", lambda.name()),
        }

        let mut b = FnBuilder::new(cx, self, messages, lambda.resources(), lambda.name(), kind, lambda.context());
        b.uniform = lambda.uniform_state().copied();
        let params = match arg_block {
            Some((block, offsets)) => {
                b.func.arg_block = Some(block);
                Params::ArgBlock { block, offsets }
            }
            None => Params::None,
        };
        let results = b.lower_graph(lambda.graph(), &roots, &params, &[])?;
        b.func.results = results;
        let func = b.finish();
        self.module.functions.push(func);
        Ok(())
    }

    /// Lower a distribution function into its four entry points
    /// `<name>_init`, `<name>_sample`, `<name>_evaluate` and `<name>_pdf`.
    pub fn lower_distribution(
        &mut self,
        cx: LowerContext<'_>,
        df: &DistributionFunction,
        arg_block: Option<(u32, &[u32])>,
        messages: &mut Vec<Message>,
    ) -> Result<()> {
        let main = df.main();
        let root = *main
            .root_nodes()
            .first()
            .ok_or_else(|| anyhow!("distribution function '{}' has no body", df.name()))?;
        let cache_slots = cx.options.num_texture_results as usize;

        let mut lowered = Vec::with_capacity(4);
        for (kind, suffix) in FunctionKind::DF_ENTRIES {
            let name = format!("{}_{suffix}", df.name());
            let mut b = FnBuilder::new(cx, self, messages, main.resources(), &name, kind, main.context());
            let params = match arg_block {
                Some((block, offsets)) => {
                    b.func.arg_block = Some(block);
                    Params::ArgBlock { block, offsets }
                }
                None => Params::None,
            };

            let mut aux_ids = Vec::with_capacity(df.aux().len());
            for (i, aux) in df.aux().iter().enumerate() {
                let ty = aux
                    .root_type(0)
                    .cloned()
                    .ok_or_else(|| anyhow!("auxiliary fragment {i} has no body"))?;
                let cached = i < cache_slots && fits_texture_result(&ty);
                let id = if cached && kind != FunctionKind::DfInit {
                    b.usage.insert(StateUsage::TEXTURE_RESULTS);
                    b.emit(ty, Op::TextureResult(i as u32))
                } else {
                    let r = b.lower_graph(aux.graph(), &aux.root_nodes(), &params, &[])?;
                    r[0]
                };
                if cached && kind == FunctionKind::DfInit {
                    b.usage.insert(StateUsage::TEXTURE_RESULTS);
                    b.func.stores.push((i as u32, id));
                }
                aux_ids.push(id);
            }

            if kind != FunctionKind::DfInit {
                let r = b.lower_bsdf(main.graph(), root, kind, &params, &aux_ids)?;
                b.func.results.push(r);
            }
            lowered.push(b.finish());
        }
        self.module.functions.extend(lowered);
        Ok(())
    }
}

fn fits_texture_result(ty: &ValueType) -> bool {
    match ty {
        ValueType::Float | ValueType::Color => true,
        ValueType::Vector { element, size } => *element == ScalarType::Float && *size <= 4,
        _ => false,
    }
}

fn df_result_type(kind: FunctionKind) -> ValueType {
    match kind {
        FunctionKind::DfSample => ValueType::float_vector(4),
        FunctionKind::DfEvaluate => ValueType::Color,
        _ => ValueType::Float,
    }
}

/// Resolves resource literals inside constants against the fragment's map.
struct ConstResolver<'a> {
    resources: &'a ResourceMap,
    strings: &'a StringTable,
    mapped: bool,
}

impl ResourceIndexResolver for ConstResolver<'_> {
    fn resource_index(&self, kind: ResourceKind, name: Option<&str>) -> u32 {
        self.resources.get(kind, name).map_or(0, |b| b.index)
    }

    fn string_index(&self, text: &str) -> Option<u32> {
        if !self.mapped {
            return None;
        }
        self.strings.ids.get(text).copied()
    }
}

struct FnBuilder<'a> {
    cx: LowerContext<'a>,
    module: &'a mut ModuleBuilder,
    messages: &'a mut Vec<Message>,
    resources: &'a ResourceMap,
    func: IrFunction,
    usage: StateUsage,
    depth: u32,
    /// Object transforms and id folded into the code instead of read from the state.
    uniform: Option<UniformState>,
}

impl<'a> FnBuilder<'a> {
    fn new(
        cx: LowerContext<'a>,
        module: &'a mut ModuleBuilder,
        messages: &'a mut Vec<Message>,
        resources: &'a ResourceMap,
        name: &str,
        kind: FunctionKind,
        context: ExecutionContext,
    ) -> Self {
        Self {
            cx,
            module,
            messages,
            resources,
            func: IrFunction::new(name, kind, context),
            usage: StateUsage::default(),
            depth: 0,
            uniform: None,
        }
    }

    fn finish(mut self) -> IrFunction {
        optimize(&mut self.func, self.cx.options.opt_level, self.cx.options.fast_math);
        let module_usage = self.module.module.state_usage;
        self.module.module.state_usage = module_usage.union(self.usage);
        self.func
    }

    /// `m * v` for a three-component `v`, using the upper 3x4 of the row-major
    /// matrix `m`. The translation column only applies to points.
    fn fold_transform(&mut self, ty: ValueType, v: InstId, m: [[f32; 4]; 4], point: bool) -> InstId {
        let parts: Vec<InstId> = (0..3)
            .map(|index| self.emit(ValueType::Float, Op::Extract { value: v, index }))
            .collect();
        let mut rows = Vec::with_capacity(3);
        for row in &m[..3] {
            let mut acc = self.emit(ValueType::Float, Op::Float(if point { row[3] } else { 0.0 }));
            for (c, part) in parts.iter().enumerate() {
                let k = self.emit(ValueType::Float, Op::Float(row[c]));
                let term = self.emit(ValueType::Float, Op::Binary(BinaryOp::Mul, k, *part));
                acc = self.emit(ValueType::Float, Op::Binary(BinaryOp::Add, acc, term));
            }
            rows.push(acc);
        }
        self.emit(ty, Op::Construct(rows))
    }

    fn emit(&mut self, ty: ValueType, op: Op) -> InstId {
        let id = self.func.body.len() as InstId;
        self.func.body.push(Inst {
            ty: storage_type(&ty),
            op,
        });
        id
    }

    /// Record a diagnostic for the caller and turn it into an error.
    fn fail(&mut self, text: String) -> anyhow::Error {
        self.messages.push(Message::error(format!("{}: {text}", self.func.name)));
        anyhow!(text)
    }

    fn lower_graph(
        &mut self,
        graph: &ExprGraph,
        roots: &[NodeId],
        params: &Params<'_>,
        aux: &[InstId],
    ) -> Result<Vec<InstId>> {
        let mut memo: HashMap<NodeId, InstId> = HashMap::new();
        for id in graph.post_order(roots) {
            let node = graph
                .node(id)
                .ok_or_else(|| anyhow!("missing node {id}"))?;
            let inst = match &node.op {
                NodeOp::Constant { value } => self.lower_constant(value, &node.ty)?,
                NodeOp::Parameter { index } => match params {
                    Params::ArgBlock { block, offsets } => {
                        let offset = *offsets
                            .get(*index)
                            .ok_or_else(|| anyhow!("parameter {index} is not in the argument block"))?;
                        self.emit(
                            node.ty.clone(),
                            Op::ArgLoad {
                                block: *block,
                                offset,
                            },
                        )
                    }
                    Params::Bound(args) => *args
                        .get(*index)
                        .ok_or_else(|| anyhow!("call binds no argument {index}"))?,
                    Params::None => bail!("parameter {index} used without captured arguments"),
                },
                NodeOp::LambdaResult { index } => match aux.get(*index) {
                    Some(v) => *v,
                    None => return Err(self.fail(format!("lambda_result {index} outside a distribution function"))),
                },
                NodeOp::Call { name, args } => {
                    let arg_ids: Vec<InstId> = args
                        .iter()
                        .map(|a| memo.get(a).copied().ok_or_else(|| anyhow!("argument {a} not lowered")))
                        .collect::<Result<_>>()?;
                    self.lower_call(graph, node, name, args, &arg_ids)?
                }
            };
            memo.insert(id, inst);
        }
        roots
            .iter()
            .map(|r| memo.get(r).copied().ok_or_else(|| anyhow!("root {r} not lowered")))
            .collect()
    }

    fn lower_constant(&mut self, value: &Value, ty: &ValueType) -> Result<InstId> {
        let options = self.cx.options;
        Ok(match value {
            Value::Bool(b) => self.emit(ValueType::Bool, Op::Bool(*b)),
            Value::Int(i) | Value::Enum(i) => self.emit(ValueType::Int, Op::Int(*i)),
            Value::Float(f) => self.emit(ValueType::Float, Op::Float(*f)),
            Value::Double(d) => self.emit(ValueType::Double, Op::Double(*d)),
            Value::String(s) => {
                let handle = if options.map_strings_to_ids {
                    self.module.strings.intern(s)
                } else {
                    let mut bytes = s.as_bytes().to_vec();
                    bytes.push(0);
                    self.usage.insert(StateUsage::RO_DATA);
                    self.module.add_ro_data(&bytes)
                };
                self.emit(ValueType::String, Op::Int(handle as i32))
            }
            Value::Texture { .. } | Value::LightProfile { .. } | Value::BsdfMeasurement { .. } => {
                let index = self.resource_binding(value).map_or(0, |b| b.index);
                self.emit(ValueType::Int, Op::Int(index as i32))
            }
            compound => {
                if let Some(offset) = self.try_ro_constant(compound, ty) {
                    self.usage.insert(StateUsage::RO_DATA);
                    return Ok(self.emit(ty.clone(), Op::RoLoad { offset }));
                }
                let mut parts = Vec::with_capacity(compound.child_count());
                for (i, child) in compound.children().iter().enumerate() {
                    let child_ty = ty
                        .child_type(i)
                        .ok_or_else(|| anyhow!("constant has more children than {ty}"))?;
                    parts.push(self.lower_constant(child, &child_ty)?);
                }
                self.emit(ty.clone(), Op::Construct(parts))
            }
        })
    }

    /// Place a large compound constant into the read-only segment, encoded with
    /// the target's layout rules.
    fn try_ro_constant(&mut self, value: &Value, ty: &ValueType) -> Option<u32> {
        if !self.cx.use_ro_segment {
            return None;
        }
        let param = MaterialParameter {
            name: String::new(),
            ty: ty.clone(),
            value: value.clone(),
        };
        let layout = ArgBlockLayout::build(std::slice::from_ref(&param), self.cx.rules).ok()?;
        if (layout.size() as u32) <= RO_THRESHOLD_BYTES {
            return None;
        }
        if self.cx.options.map_strings_to_ids {
            value.visit(&mut |v| {
                if let Value::String(s) = v {
                    self.module.strings.intern(s);
                }
            });
        }
        let mut bytes = vec![0u8; layout.size()];
        let resolver = ConstResolver {
            resources: self.resources,
            strings: &self.module.strings,
            mapped: self.cx.options.map_strings_to_ids,
        };
        let address = layout.nested_address(0, LayoutAddress::ROOT)?;
        layout.set_value(&mut bytes, value, &resolver, address).ok()?;
        Some(self.module.add_ro_data(&bytes))
    }

    fn resource_binding(&self, value: &Value) -> Option<&'a ResourceBinding> {
        let (kind, name) = resource_ref(value)?;
        let binding = self.resources.get(kind, name);
        if binding.is_none() {
            log::warn!(
                "{} '{}' was not enumerated before lowering, using index 0",
                kind.as_str(),
                name.unwrap_or("<unnamed>")
            );
        }
        binding
    }

    /// The resource literal behind a call argument, when it is a constant.
    fn constant_resource<'g>(graph: &'g ExprGraph, id: NodeId) -> Option<&'g Value> {
        match &graph.node(id)?.op {
            NodeOp::Constant { value } if resource_ref(value).is_some() => Some(value),
            _ => None,
        }
    }

    fn lower_call(
        &mut self,
        graph: &ExprGraph,
        node: &Node,
        name: &str,
        arg_nodes: &[NodeId],
        args: &[InstId],
    ) -> Result<InstId> {
        match self.cx.resolver.resolve(name) {
            None => Err(self.fail(format!("unresolved call '{name}'"))),
            Some(Resolution::Fragment(callee)) => {
                if self.depth >= MAX_INLINE_DEPTH {
                    return Err(self.fail(format!("call '{name}' nests deeper than {MAX_INLINE_DEPTH} fragments")));
                }
                let Some(Roots::Single(body)) = callee.roots() else {
                    return Err(self.fail(format!("called fragment '{name}' has no single body")));
                };
                if callee.parameters().len() != args.len() {
                    return Err(self.fail(format!(
                        "'{name}' takes {} arguments, call passes {}",
                        callee.parameters().len(),
                        args.len()
                    )));
                }
                self.depth += 1;
                let result = self.lower_graph(callee.graph(), &[*body], &Params::Bound(args), &[]);
                self.depth -= 1;
                Ok(result?[0])
            }
            Some(Resolution::Intrinsic(intrinsic)) => self.lower_intrinsic(intrinsic, graph, node, arg_nodes, args),
        }
    }

    fn expect_args(&mut self, name: &str, args: &[InstId], n: usize) -> Result<()> {
        if args.len() != n {
            return Err(self.fail(format!("'{name}' expects {n} arguments, got {}", args.len())));
        }
        Ok(())
    }

    fn lower_intrinsic(
        &mut self,
        intrinsic: Intrinsic,
        graph: &ExprGraph,
        node: &Node,
        arg_nodes: &[NodeId],
        args: &[InstId],
    ) -> Result<InstId> {
        use Intrinsic as I;

        let ty = node.ty.clone();
        let label = format!("{intrinsic:?}");
        let context = self.func.context;
        let prefix = self.cx.options.tex_lookup_call_mode.runtime_prefix();

        Ok(match intrinsic {
            I::Add | I::Sub | I::Mul | I::Div | I::Less | I::LessEqual | I::Greater | I::Equal | I::And
            | I::Or | I::Min | I::Max | I::Pow | I::Dot | I::Cross => {
                self.expect_args(&label, args, 2)?;
                let op = match intrinsic {
                    I::Add => BinaryOp::Add,
                    I::Sub => BinaryOp::Sub,
                    I::Mul => BinaryOp::Mul,
                    I::Div => BinaryOp::Div,
                    I::Less => BinaryOp::Less,
                    I::LessEqual => BinaryOp::LessEqual,
                    I::Greater => BinaryOp::Greater,
                    I::Equal => BinaryOp::Equal,
                    I::And => BinaryOp::And,
                    I::Or => BinaryOp::Or,
                    I::Min => BinaryOp::Min,
                    I::Max => BinaryOp::Max,
                    I::Pow => BinaryOp::Pow,
                    I::Dot => BinaryOp::Dot,
                    _ => BinaryOp::Cross,
                };
                if op == BinaryOp::Div && self.cx.options.enable_exceptions && storage_type(&ty) == ValueType::Int {
                    return Ok(self.emit(
                        ty,
                        Op::RuntimeCall {
                            name: "checked_div_i32".to_string(),
                            args: args.to_vec(),
                        },
                    ));
                }
                self.emit(ty, Op::Binary(op, args[0], args[1]))
            }
            I::Neg | I::Not | I::Sin | I::Cos | I::Sqrt | I::Abs | I::Floor | I::Saturate | I::Normalize
            | I::Length => {
                self.expect_args(&label, args, 1)?;
                let op = match intrinsic {
                    I::Neg => UnaryOp::Neg,
                    I::Not => UnaryOp::Not,
                    I::Sin => UnaryOp::Sin,
                    I::Cos => UnaryOp::Cos,
                    I::Sqrt => UnaryOp::Sqrt,
                    I::Abs => UnaryOp::Abs,
                    I::Floor => UnaryOp::Floor,
                    I::Saturate => UnaryOp::Saturate,
                    I::Normalize => UnaryOp::Normalize,
                    _ => UnaryOp::Length,
                };
                self.emit(ty, Op::Unary(op, args[0]))
            }
            I::Select | I::Clamp | I::Lerp => {
                self.expect_args(&label, args, 3)?;
                let op = match intrinsic {
                    I::Select => TernaryOp::Select,
                    I::Clamp => TernaryOp::Clamp,
                    _ => TernaryOp::Lerp,
                };
                self.emit(ty, Op::Ternary(op, args[0], args[1], args[2]))
            }
            I::Construct => {
                let n = ty.child_count();
                if n == 0 || (args.len() != n && args.len() != 1) {
                    return Err(self.fail(format!("cannot construct {ty} from {} arguments", args.len())));
                }
                self.emit(ty, Op::Construct(args.to_vec()))
            }
            I::Member(index) => {
                self.expect_args(&label, args, 1)?;
                self.emit(
                    ty,
                    Op::Extract {
                        value: args[0],
                        index,
                    },
                )
            }
            I::StateNormal | I::StatePosition | I::StateObjectPosition | I::StateObjectNormal
            | I::StateTextureCoordinate | I::StateObjectId
                if context == ExecutionContext::Environment =>
            {
                return Err(self.fail(format!("{label} is not available in environment functions")));
            }
            I::StateDirection if context != ExecutionContext::Environment => {
                return Err(self.fail("state::direction is only available in environment functions".to_string()));
            }
            I::StateNormal => {
                self.usage.insert(StateUsage::NORMAL);
                self.emit(ty, Op::State(StateField::Normal))
            }
            I::StatePosition => {
                self.usage.insert(StateUsage::POSITION);
                self.emit(ty, Op::State(StateField::Position))
            }
            I::StateDirection => {
                self.usage.insert(StateUsage::DIRECTION);
                self.emit(ty, Op::State(StateField::Direction))
            }
            I::StateAnimationTime => {
                self.usage.insert(StateUsage::ANIMATION_TIME);
                self.emit(ty, Op::State(StateField::AnimationTime))
            }
            I::StateObjectPosition | I::StateObjectNormal => {
                let (field, bit, transform) = if intrinsic == I::StateObjectPosition {
                    (StateField::Position, StateUsage::POSITION, "transform_point_to_object")
                } else {
                    (StateField::Normal, StateUsage::NORMAL, "transform_normal_to_object")
                };
                self.usage.insert(bit);
                let v = self.emit(ty.clone(), Op::State(field));
                if self.cx.options.internal_space == InternalSpace::Object {
                    v
                } else if let Some(uniform) = self.uniform {
                    if intrinsic == I::StateObjectPosition {
                        self.fold_transform(ty, v, uniform.world_to_object, true)
                    } else {
                        // normals go through the inverse transpose of world_to_object
                        let m = uniform.object_to_world;
                        let transposed = std::array::from_fn(|r| std::array::from_fn(|c| m[c][r]));
                        self.fold_transform(ty, v, transposed, false)
                    }
                } else {
                    self.usage.insert(StateUsage::TRANSFORMS);
                    self.emit(
                        ty,
                        Op::RuntimeCall {
                            name: transform.to_string(),
                            args: vec![v],
                        },
                    )
                }
            }
            I::StateObjectId => match self.uniform {
                Some(uniform) => self.emit(ty, Op::Int(uniform.object_id)),
                None => {
                    self.usage.insert(StateUsage::OBJECT_ID);
                    self.emit(ty, Op::State(StateField::ObjectId))
                }
            },
            I::StateTextureCoordinate => {
                self.expect_args(&label, args, 1)?;
                let index = match graph.node(arg_nodes[0]).map(|n| &n.op) {
                    Some(NodeOp::Constant { value: Value::Int(i) }) if *i >= 0 => *i as u32,
                    _ => {
                        return Err(self.fail("state::texture_coordinate needs a constant index".to_string()));
                    }
                };
                if index >= self.cx.options.num_texture_spaces {
                    let zero = self.emit(ValueType::Float, Op::Float(0.0));
                    self.emit(ty, Op::Construct(vec![zero]))
                } else {
                    self.usage.insert(StateUsage::TEXTURE_COORDINATE);
                    self.emit(ty, Op::TextureCoordinate(index))
                }
            }
            I::TexLookupFloat | I::TexLookupFloat3 | I::TexLookupColor => {
                self.expect_args(&label, args, 2)?;
                let shape = match graph.node(arg_nodes[0]).map(|n| &n.ty) {
                    Some(ValueType::Texture { shape }) => shape.as_str(),
                    _ => return Err(self.fail(format!("{label} needs a texture argument"))),
                };
                let what = match intrinsic {
                    I::TexLookupFloat => "float",
                    I::TexLookupFloat3 => "float3",
                    _ => "color",
                };
                self.emit(
                    ty,
                    Op::RuntimeCall {
                        name: format!("{prefix}tex_lookup_{what}_{shape}"),
                        args: args.to_vec(),
                    },
                )
            }
            I::TexWidth | I::TexHeight | I::TexDepth | I::TexIsValid | I::LightProfilePower
            | I::LightProfileMaximum | I::LightProfileIsValid | I::BsdfMeasurementIsValid => {
                self.expect_args(&label, args, 1)?;
                let binding = Self::constant_resource(graph, arg_nodes[0]).and_then(|v| self.resource_binding(v));
                if let Some(b) = binding {
                    let folded = fold_resource_query(intrinsic, b);
                    let folded_ty = match folded {
                        Op::Bool(_) => ValueType::Bool,
                        Op::Int(_) => ValueType::Int,
                        _ => ValueType::Float,
                    };
                    self.emit(folded_ty, folded)
                } else {
                    let runtime = match intrinsic {
                        I::TexWidth => "tex_width",
                        I::TexHeight => "tex_height",
                        I::TexDepth => "tex_depth",
                        I::TexIsValid => "tex_isvalid",
                        I::LightProfilePower => "lp_power",
                        I::LightProfileMaximum => "lp_maximum",
                        I::LightProfileIsValid => "lp_isvalid",
                        _ => "bm_isvalid",
                    };
                    self.emit(
                        ty,
                        Op::RuntimeCall {
                            name: format!("{prefix}{runtime}"),
                            args: args.to_vec(),
                        },
                    )
                }
            }
            I::Bsdf(_) => {
                return Err(self.fail(format!(
                    "{label} constructs a distribution and can only appear in distribution functions"
                )));
            }
        })
    }

    fn lower_bsdf(
        &mut self,
        graph: &ExprGraph,
        id: NodeId,
        kind: FunctionKind,
        params: &Params<'_>,
        aux: &[InstId],
    ) -> Result<InstId> {
        let node = graph
            .node(id)
            .ok_or_else(|| anyhow!("missing node {id}"))?;
        let NodeOp::Call { name, args } = &node.op else {
            return Err(self.fail(format!("distribution node {id} is not a call")));
        };
        let bsdf = match self.cx.resolver.resolve(name) {
            Some(Resolution::Intrinsic(Intrinsic::Bsdf(b))) => b,
            _ => return Err(self.fail(format!("unsupported BSDF '{name}'"))),
        };

        let mut values = Vec::new();
        let mut layers = Vec::new();
        for &a in args {
            let is_bsdf = graph.node(a).is_some_and(|n| n.ty == ValueType::Bsdf);
            if is_bsdf {
                layers.push(a);
            } else {
                values.push(self.lower_graph(graph, &[a], params, aux)?[0]);
            }
        }

        let suffix = match kind {
            FunctionKind::DfSample => "sample",
            FunctionKind::DfEvaluate => "evaluate",
            _ => "pdf",
        };
        let result_ty = df_result_type(kind);

        match bsdf {
            BsdfNode::Tint => {
                if layers.len() != 1 || values.len() != 1 {
                    return Err(self.fail("df::tint takes a color and one BSDF".to_string()));
                }
                let inner = self.lower_bsdf(graph, layers[0], kind, params, aux)?;
                Ok(if kind == FunctionKind::DfEvaluate {
                    self.emit(result_ty, Op::Binary(BinaryOp::Mul, values[0], inner))
                } else {
                    inner
                })
            }
            BsdfNode::WeightedLayer => {
                if layers.len() != 2 || values.len() != 1 {
                    return Err(self.fail("df::weighted_layer takes a weight and two BSDFs".to_string()));
                }
                let layer = self.lower_bsdf(graph, layers[0], kind, params, aux)?;
                let base = self.lower_bsdf(graph, layers[1], kind, params, aux)?;
                Ok(if kind == FunctionKind::DfSample {
                    self.emit(
                        result_ty,
                        Op::RuntimeCall {
                            name: "bsdf_layer_sample".to_string(),
                            args: vec![values[0], layer, base],
                        },
                    )
                } else {
                    self.emit(result_ty, Op::Ternary(TernaryOp::Lerp, base, layer, values[0]))
                })
            }
            leaf => {
                if !layers.is_empty() {
                    return Err(self.fail(format!("'{name}' does not take BSDF arguments")));
                }
                Ok(self.emit(
                    result_ty,
                    Op::RuntimeCall {
                        name: format!("bsdf_{}_{suffix}", leaf.runtime_name()),
                        args: values,
                    },
                ))
            }
        }
    }
}

fn fold_resource_query(intrinsic: Intrinsic, binding: &ResourceBinding) -> Op {
    let attrs = &binding.attributes;
    match (intrinsic, &attrs.meta) {
        (Intrinsic::TexWidth, ResourceMeta::Texture { width, .. }) => Op::Int(*width as i32),
        (Intrinsic::TexHeight, ResourceMeta::Texture { height, .. }) => Op::Int(*height as i32),
        (Intrinsic::TexDepth, ResourceMeta::Texture { depth, .. }) => Op::Int(*depth as i32),
        (Intrinsic::TexWidth | Intrinsic::TexHeight | Intrinsic::TexDepth, _) => Op::Int(0),
        (Intrinsic::LightProfilePower, ResourceMeta::LightProfile { power, .. }) => Op::Float(*power),
        (Intrinsic::LightProfileMaximum, ResourceMeta::LightProfile { maximum, .. }) => Op::Float(*maximum),
        (Intrinsic::LightProfilePower | Intrinsic::LightProfileMaximum, _) => Op::Float(0.0),
        _ => Op::Bool(attrs.valid && binding.index != 0),
    }
}
