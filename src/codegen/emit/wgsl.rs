//! WGSL emission for the GPU target.
//!
//! Every function takes the shading state by pointer. Argument blocks and the
//! read-only segment are bound as `array<u32>` storage buffers and read with
//! `bitcast`, so their byte layout is exactly the one [`ArgBlockLayout`] builds
//! with [`LayoutRules::GpuStorage`].
//!
//! [`ArgBlockLayout`]: crate::codegen::arg_layout::ArgBlockLayout

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

use anyhow::{Result, bail};

use crate::codegen::arg_layout::{LayoutRules, child_offsets};
use crate::codegen::lower::{BinaryOp, InstId, IrFunction, IrModule, Op, StateField, TernaryOp, UnaryOp};
use crate::codegen::types::FunctionKind;
use crate::dsl::{ScalarType, ValueType};

const STATE_PARAM: &str = "state: ptr<function, ShadingState>";

/// Emitted module plus what a caller needs to validate or link it.
#[derive(Clone, Debug, Default)]
pub struct WgslOutput {
    pub source: String,
    /// Placeholder definitions of every runtime function the source calls.
    pub runtime_stubs: String,
    /// Signature line of each function, in module order.
    pub prototypes: Vec<String>,
}

impl WgslOutput {
    /// Source that parses on its own: the runtime stubs followed by the module.
    pub fn with_runtime_stubs(&self) -> String {
        format!("{}\n{}", self.runtime_stubs, self.source)
    }
}

fn sanitize(name: &str) -> String {
    let s: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    s.trim_start_matches('_').to_string()
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || (first == '_' && name.len() > 1 && !name.starts_with("__")))
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn field_ident(index: usize, name: &str) -> String {
    format!("m{index}_{}", sanitize(name))
}

fn scalar_name(s: ScalarType) -> Result<&'static str> {
    Ok(match s {
        ScalarType::Bool => "bool",
        ScalarType::Int => "i32",
        ScalarType::Float => "f32",
        ScalarType::Double => bail!("double precision values are not supported on the gpu target"),
    })
}

fn int_lit(i: i32) -> String {
    if i == i32::MIN {
        "(-2147483647i - 1i)".to_string()
    } else {
        format!("{i}i")
    }
}

fn float_lit(f: f32) -> String {
    if f.is_finite() {
        format!("{f:?}f")
    } else {
        format!("bitcast<f32>({}u)", f.to_bits())
    }
}

fn is_scalar(ty: &ValueType) -> bool {
    matches!(ty, ValueType::Bool | ValueType::Int | ValueType::Float | ValueType::String)
}

fn is_vector_like(ty: &ValueType) -> bool {
    matches!(ty, ValueType::Vector { .. } | ValueType::Color)
}

#[derive(Default)]
struct TypeNames {
    names: HashMap<ValueType, String>,
    used: HashSet<String>,
    definitions: String,
}

impl TypeNames {
    fn wgsl(&mut self, ty: &ValueType) -> Result<String> {
        Ok(match ty {
            ValueType::Bool => "bool".to_string(),
            ValueType::Int
            | ValueType::Enum { .. }
            | ValueType::String
            | ValueType::Texture { .. }
            | ValueType::LightProfile
            | ValueType::BsdfMeasurement => "i32".to_string(),
            ValueType::Float => "f32".to_string(),
            ValueType::Double => bail!("double precision values are not supported on the gpu target"),
            ValueType::Vector { element, size } => {
                if !(2..=4).contains(size) {
                    bail!("vectors of size {size} have no gpu equivalent");
                }
                format!("vec{size}<{}>", scalar_name(*element)?)
            }
            ValueType::Color => "vec3<f32>".to_string(),
            ValueType::Matrix { columns, rows } => {
                if !(2..=4).contains(columns) || !(2..=4).contains(rows) {
                    bail!("matrix {ty} has no gpu equivalent");
                }
                format!("mat{columns}x{rows}<f32>")
            }
            ValueType::Array { element, size } => format!("array<{}, {size}>", self.wgsl(element)?),
            ValueType::Struct { name, fields } => {
                if let Some(n) = self.names.get(ty) {
                    return Ok(n.clone());
                }
                let mut members = Vec::with_capacity(fields.len());
                for (i, f) in fields.iter().enumerate() {
                    members.push(format!("    {}: {},", field_ident(i, &f.name), self.wgsl(&f.ty)?));
                }
                let base = format!("S_{}", sanitize(name));
                let mut struct_name = base.clone();
                let mut k = 1;
                while self.used.contains(&struct_name) {
                    struct_name = format!("{base}_{k}");
                    k += 1;
                }
                let _ = writeln!(self.definitions, "struct {struct_name} {{\n{}\n}}\n", members.join("\n"));
                self.used.insert(struct_name.clone());
                self.names.insert(ty.clone(), struct_name.clone());
                struct_name
            }
            ValueType::Bsdf | ValueType::Edf | ValueType::Vdf => {
                bail!("distribution values cannot be materialized on the gpu target")
            }
        })
    }
}

struct Writer<'m> {
    module: &'m IrModule,
    types: TypeNames,
    stubs: String,
    stubbed: HashSet<String>,
}

impl<'m> Writer<'m> {
    /// Read a value of type `ty` at byte `offset` from a `array<u32>` buffer.
    fn load(&mut self, buffer: &str, ty: &ValueType, offset: u32) -> Result<String> {
        if offset % 4 != 0 {
            bail!("unaligned read at byte {offset} of {buffer}");
        }
        let word = offset / 4;
        Ok(match ty {
            ValueType::Bool => format!("({buffer}[{word}] != 0u)"),
            ValueType::Float => format!("bitcast<f32>({buffer}[{word}])"),
            ValueType::Double => bail!("double precision values are not supported on the gpu target"),
            t if is_scalar(t) || t.is_resource() || matches!(t, ValueType::Enum { .. }) => {
                format!("bitcast<i32>({buffer}[{word}])")
            }
            compound => {
                let offsets = child_offsets(compound, LayoutRules::GpuStorage)?;
                let mut parts = Vec::with_capacity(offsets.len());
                for (i, child_offset) in offsets.iter().enumerate() {
                    let Some(child) = compound.child_type(i) else {
                        bail!("{compound} has no child {i}");
                    };
                    parts.push(self.load(buffer, &child, offset + child_offset)?);
                }
                format!("{}({})", self.types.wgsl(compound)?, parts.join(", "))
            }
        })
    }

    fn operand(&mut self, func: &IrFunction, id: InstId, to: &ValueType) -> Result<String> {
        let from = &func.inst(id).ty;
        if is_scalar(from) && is_vector_like(to) {
            return Ok(format!("{}(v{id})", self.types.wgsl(to)?));
        }
        Ok(format!("v{id}"))
    }

    fn note_runtime(&mut self, func: &IrFunction, name: &str, args: &[InstId], ret: &ValueType) -> Result<()> {
        if !self.stubbed.insert(name.to_string()) {
            return Ok(());
        }
        let mut params = Vec::with_capacity(args.len());
        for (i, a) in args.iter().enumerate() {
            params.push(format!("a{i}: {}", self.types.wgsl(&func.inst(*a).ty)?));
        }
        let r = self.types.wgsl(ret)?;
        let _ = writeln!(self.stubs, "fn {name}({}) -> {r} {{ return {r}(); }}", params.join(", "));
        Ok(())
    }

    fn expr(&mut self, func: &IrFunction, id: InstId) -> Result<String> {
        let inst = func.inst(id);
        let ty = &inst.ty;
        Ok(match &inst.op {
            Op::Bool(b) => b.to_string(),
            Op::Int(i) => int_lit(*i),
            Op::Float(f) => float_lit(*f),
            Op::Double(_) => bail!("double precision values are not supported on the gpu target"),
            Op::RoLoad { offset } => self.load("ro_data", ty, *offset)?,
            Op::ArgLoad { block, offset } => self.load(&format!("arg_block_{block}"), ty, *offset)?,
            Op::Construct(args) => {
                let t = self.types.wgsl(ty)?;
                let n = ty.child_count();
                let parts: Vec<String> = if args.len() == 1 && n > 1 && !is_vector_like(ty) {
                    (0..n).map(|_| format!("v{}", args[0])).collect()
                } else {
                    args.iter().map(|a| format!("v{a}")).collect()
                };
                format!("{t}({})", parts.join(", "))
            }
            Op::Extract { value, index } => match &func.inst(*value).ty {
                ValueType::Struct { fields, .. } => {
                    let Some(f) = fields.get(*index as usize) else {
                        bail!("struct has no field {index}");
                    };
                    format!("v{value}.{}", field_ident(*index as usize, &f.name))
                }
                _ => format!("v{value}[{index}]"),
            },
            Op::Unary(u, a) => match u {
                UnaryOp::Neg => format!("(-v{a})"),
                UnaryOp::Not => format!("(!v{a})"),
                UnaryOp::Sin => format!("sin(v{a})"),
                UnaryOp::Cos => format!("cos(v{a})"),
                UnaryOp::Sqrt => format!("sqrt(v{a})"),
                UnaryOp::Abs => format!("abs(v{a})"),
                UnaryOp::Floor => format!("floor(v{a})"),
                UnaryOp::Saturate => format!("saturate(v{a})"),
                UnaryOp::Normalize => format!("normalize(v{a})"),
                UnaryOp::Length => format!("length(v{a})"),
            },
            Op::Binary(b, x, y) => {
                let infix = |sym: &str| format!("(v{x} {sym} v{y})");
                match b {
                    BinaryOp::Add => infix("+"),
                    BinaryOp::Sub => infix("-"),
                    BinaryOp::Mul => infix("*"),
                    BinaryOp::Div => infix("/"),
                    BinaryOp::Less => infix("<"),
                    BinaryOp::LessEqual => infix("<="),
                    BinaryOp::Greater => infix(">"),
                    BinaryOp::Equal => infix("=="),
                    BinaryOp::And if *ty == ValueType::Bool => infix("&&"),
                    BinaryOp::And => infix("&"),
                    BinaryOp::Or if *ty == ValueType::Bool => infix("||"),
                    BinaryOp::Or => infix("|"),
                    BinaryOp::Dot => format!("dot(v{x}, v{y})"),
                    BinaryOp::Cross => format!("cross(v{x}, v{y})"),
                    BinaryOp::Min | BinaryOp::Max | BinaryOp::Pow => {
                        let name = match b {
                            BinaryOp::Min => "min",
                            BinaryOp::Max => "max",
                            _ => "pow",
                        };
                        let a = self.operand(func, *x, ty)?;
                        let c = self.operand(func, *y, ty)?;
                        format!("{name}({a}, {c})")
                    }
                }
            }
            Op::Ternary(t, a, b, c) => match t {
                TernaryOp::Select => {
                    let on_true = self.operand(func, *b, ty)?;
                    let on_false = self.operand(func, *c, ty)?;
                    format!("select({on_false}, {on_true}, v{a})")
                }
                TernaryOp::Clamp => {
                    let lo = self.operand(func, *b, ty)?;
                    let hi = self.operand(func, *c, ty)?;
                    format!("clamp(v{a}, {lo}, {hi})")
                }
                TernaryOp::Lerp => {
                    let from = self.operand(func, *a, ty)?;
                    let to = self.operand(func, *b, ty)?;
                    format!("mix({from}, {to}, v{c})")
                }
            },
            Op::State(field) => {
                let name = match field {
                    StateField::Normal => "normal",
                    StateField::Position => "position",
                    StateField::Direction => "direction",
                    StateField::AnimationTime => "animation_time",
                    StateField::ObjectId => "object_id",
                };
                format!("(*state).{name}")
            }
            Op::TextureCoordinate(i) => format!("(*state).texture_coords[{i}]"),
            Op::TextureResult(i) => {
                let swizzle = match ty {
                    ValueType::Float => ".x",
                    ValueType::Vector { size: 2, .. } => ".xy",
                    ValueType::Vector { size: 4, .. } => "",
                    _ => ".xyz",
                };
                format!("(*state).texture_results[{i}]{swizzle}")
            }
            Op::RuntimeCall { name, args } => {
                self.note_runtime(func, name, args, ty)?;
                let a: Vec<String> = args.iter().map(|a| format!("v{a}")).collect();
                format!("{name}({})", a.join(", "))
            }
        })
    }

    /// `let` bindings for every instruction marked in `needed`.
    fn body(&mut self, out: &mut String, func: &IrFunction, needed: &[bool], indent: &str) -> Result<()> {
        for (i, inst) in func.body.iter().enumerate() {
            if !needed[i] {
                continue;
            }
            let id = i as InstId;
            let t = self.types.wgsl(&inst.ty)?;
            let e = self.expr(func, id)?;
            let _ = writeln!(out, "{indent}let v{i}: {t} = {e};");
        }
        Ok(())
    }

    /// Scalar float expressions covering every component of a value.
    fn flatten(&self, expr: String, ty: &ValueType, out: &mut Vec<String>) -> Result<()> {
        match ty {
            ValueType::Float => out.push(expr),
            ValueType::Bool => out.push(format!("select(0.0f, 1.0f, {expr})")),
            ValueType::Double => bail!("double precision values are not supported on the gpu target"),
            ValueType::Struct { fields, .. } => {
                for (i, f) in fields.iter().enumerate() {
                    self.flatten(format!("{expr}.{}", field_ident(i, &f.name)), &f.ty, out)?;
                }
            }
            t if t.child_count() > 0 => {
                for i in 0..t.child_count() {
                    let Some(child) = t.child_type(i) else {
                        bail!("{t} has no child {i}");
                    };
                    self.flatten(format!("{expr}[{i}]"), &child, out)?;
                }
            }
            _ => out.push(format!("f32({expr})")),
        }
        Ok(())
    }

    fn function(&mut self, func: &IrFunction) -> Result<(String, String)> {
        if !is_identifier(&func.name) {
            bail!("function name '{}' is not a valid WGSL identifier", func.name);
        }
        let mut out = String::new();
        let all = needed(func, &func.results, true);
        let prototype = match func.kind {
            FunctionKind::SwitchLambda => {
                let mut cases = Vec::with_capacity(func.results.len());
                let mut width = 1;
                for (case, r) in func.results.iter().enumerate() {
                    let mut flat = Vec::new();
                    self.flatten(format!("v{r}"), &func.inst(*r).ty, &mut flat)?;
                    width = width.max(flat.len());
                    let mut block = String::new();
                    let _ = writeln!(block, "        case {case}i: {{");
                    self.body(&mut block, func, &needed(func, &[*r], false), "            ")?;
                    for (k, e) in flat.iter().enumerate() {
                        let _ = writeln!(block, "            (*result)[{k}] = {e};");
                    }
                    block.push_str("            return true;\n        }\n");
                    cases.push(block);
                }
                let prototype = format!(
                    "fn {}({STATE_PARAM}, index: i32, result: ptr<function, array<f32, {width}>>) -> bool",
                    func.name
                );
                let _ = writeln!(out, "{prototype} {{");
                out.push_str("    switch index {\n");
                for c in cases {
                    out.push_str(&c);
                }
                out.push_str("        default: {}\n    }\n    return false;\n}\n");
                prototype
            }
            FunctionKind::DfInit => {
                let prototype = format!("fn {}({STATE_PARAM})", func.name);
                let _ = writeln!(out, "{prototype} {{");
                let live = needed(func, &func.stores.iter().map(|(_, v)| *v).collect::<Vec<_>>(), false);
                self.body(&mut out, func, &live, "    ")?;
                for (slot, v) in &func.stores {
                    let packed = match &func.inst(*v).ty {
                        ValueType::Float => format!("vec4<f32>(v{v}, 0.0f, 0.0f, 0.0f)"),
                        ValueType::Vector { size: 2, .. } => format!("vec4<f32>(v{v}, 0.0f, 0.0f)"),
                        ValueType::Vector { size: 4, .. } => format!("v{v}"),
                        _ => format!("vec4<f32>(v{v}, 0.0f)"),
                    };
                    let _ = writeln!(out, "    (*state).texture_results[{slot}] = {packed};");
                }
                out.push_str("}\n");
                prototype
            }
            _ => {
                let Some(r) = func.results.first() else {
                    bail!("function '{}' returns nothing", func.name);
                };
                let ret = self.types.wgsl(&func.inst(*r).ty)?;
                let prototype = format!("fn {}({STATE_PARAM}) -> {ret}", func.name);
                let _ = writeln!(out, "{prototype} {{");
                self.body(&mut out, func, &all, "    ")?;
                let _ = writeln!(out, "    return v{r};\n}}");
                prototype
            }
        };
        Ok((out, prototype))
    }

    fn state_struct(&self) -> String {
        let mut s = String::from("struct ShadingState {\n");
        s.push_str("    normal: vec3<f32>,\n");
        s.push_str("    position: vec3<f32>,\n");
        s.push_str("    direction: vec3<f32>,\n");
        s.push_str("    animation_time: f32,\n");
        s.push_str("    object_id: i32,\n");
        if self.module.num_texture_spaces > 0 {
            let _ = writeln!(s, "    texture_coords: array<vec3<f32>, {}>,", self.module.num_texture_spaces);
        }
        if self.module.num_texture_results > 0 {
            let _ = writeln!(s, "    texture_results: array<vec4<f32>, {}>,", self.module.num_texture_results);
        }
        s.push_str("}\n");
        s
    }
}

/// Instructions reachable from `roots`. Without `keep_all`, only what the roots use.
fn needed(func: &IrFunction, roots: &[InstId], keep_all: bool) -> Vec<bool> {
    if keep_all {
        return vec![true; func.body.len()];
    }
    let mut live = vec![false; func.body.len()];
    for r in roots {
        live[*r as usize] = true;
    }
    for i in (0..func.body.len()).rev() {
        if live[i] {
            for a in func.body[i].op.operands() {
                live[a as usize] = true;
            }
        }
    }
    live
}

pub fn write(module: &IrModule) -> Result<WgslOutput> {
    let mut w = Writer {
        module,
        types: TypeNames::default(),
        stubs: String::new(),
        stubbed: HashSet::new(),
    };

    let mut functions = String::new();
    let mut prototypes = Vec::with_capacity(module.functions.len());
    for func in &module.functions {
        let (text, prototype) = w.function(func)?;
        functions.push('\n');
        functions.push_str(&text);
        prototypes.push(prototype);
    }

    let mut source = String::from("// generated by node-forge-codegen\n\n");
    source.push_str(&w.state_struct());
    source.push('\n');
    source.push_str(&w.types.definitions);
    if !module.ro_segment.is_empty() {
        source.push_str("@group(0) @binding(0) var<storage, read> ro_data: array<u32>;\n");
    }
    for (k, block) in module.arg_blocks.iter().enumerate() {
        let names = block.names.join(", ");
        let _ = writeln!(source, "// arg block {k}: {names}");
        let _ = writeln!(source, "@group(1) @binding({k}) var<storage, read> arg_block_{k}: array<u32>;");
    }
    source.push_str(&functions);

    Ok(WgslOutput {
        source,
        runtime_stubs: w.stubs,
        prototypes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::lower::Inst;
    use crate::codegen::types::ExecutionContext;

    fn inst(ty: ValueType, op: Op) -> Inst {
        Inst { ty, op }
    }

    fn module_with(functions: Vec<IrFunction>) -> IrModule {
        IrModule {
            functions,
            num_texture_spaces: 4,
            ..IrModule::default()
        }
    }

    #[test]
    fn literals_are_typed() {
        assert_eq!(int_lit(-3), "-3i");
        assert_eq!(float_lit(0.5), "0.5f");
        assert_eq!(float_lit(2.0), "2.0f");
        assert!(float_lit(f32::INFINITY).starts_with("bitcast<f32>("));
    }

    #[test]
    fn lambda_with_state_and_runtime_call_parses() {
        let mut f = IrFunction::new("tinted", FunctionKind::Lambda, ExecutionContext::Core);
        f.body = vec![
            inst(ValueType::Int, Op::Int(1)),
            inst(ValueType::float_vector(3), Op::TextureCoordinate(0)),
            inst(
                ValueType::Color,
                Op::RuntimeCall {
                    name: "rt_vt_tex_lookup_color_2d".to_string(),
                    args: vec![0, 1],
                },
            ),
            inst(ValueType::Float, Op::Float(0.5)),
            inst(ValueType::Color, Op::Binary(BinaryOp::Mul, 2, 3)),
            inst(ValueType::Color, Op::Binary(BinaryOp::Max, 4, 3)),
        ];
        f.results.push(5);
        let out = write(&module_with(vec![f])).unwrap();
        assert_eq!(out.prototypes[0], "fn tinted(state: ptr<function, ShadingState>) -> vec3<f32>");
        assert!(out.source.contains("max(v4, vec3<f32>(v3))"));
        assert!(out.runtime_stubs.contains("fn rt_vt_tex_lookup_color_2d(a0: i32, a1: vec3<f32>) -> vec3<f32>"));
        naga::front::wgsl::parse_str(&out.with_runtime_stubs()).unwrap();
    }

    #[test]
    fn switch_functions_flatten_results() {
        let mut f = IrFunction::new("fields", FunctionKind::SwitchLambda, ExecutionContext::Core);
        f.body = vec![
            inst(ValueType::Float, Op::Float(1.0)),
            inst(ValueType::Color, Op::Construct(vec![0])),
            inst(ValueType::Bool, Op::Bool(true)),
        ];
        f.results = vec![1, 2];
        let out = write(&module_with(vec![f])).unwrap();
        assert!(out.prototypes[0].contains("result: ptr<function, array<f32, 3>>"));
        assert!(out.source.contains("(*result)[2] = v1[2];"));
        assert!(out.source.contains("select(0.0f, 1.0f, v2)"));
        naga::front::wgsl::parse_str(&out.with_runtime_stubs()).unwrap();
    }

    #[test]
    fn arg_block_reads_follow_storage_layout() {
        let mut f = IrFunction::new("p", FunctionKind::Lambda, ExecutionContext::Core);
        f.arg_block = Some(0);
        f.body = vec![inst(ValueType::float_vector(3), Op::ArgLoad { block: 0, offset: 16 })];
        f.results.push(0);
        let mut module = module_with(vec![f]);
        module.arg_blocks.push(crate::codegen::lower::ArgBlockDecl {
            names: vec!["flag".to_string(), "dir".to_string()],
            types: vec![ValueType::Bool, ValueType::float_vector(3)],
        });
        let out = write(&module).unwrap();
        assert!(out.source.contains(
            "vec3<f32>(bitcast<f32>(arg_block_0[4]), bitcast<f32>(arg_block_0[5]), bitcast<f32>(arg_block_0[6]))"
        ));
        naga::front::wgsl::parse_str(&out.with_runtime_stubs()).unwrap();
    }

    #[test]
    fn doubles_are_rejected() {
        let mut f = IrFunction::new("d", FunctionKind::Lambda, ExecutionContext::Core);
        f.body = vec![inst(ValueType::Double, Op::Double(1.0))];
        f.results.push(0);
        let err = write(&module_with(vec![f])).unwrap_err();
        assert!(err.to_string().contains("double"));
    }
}
