//! Human-readable listing of the portable IR.

use std::fmt::Write as _;

use crate::codegen::lower::{BinaryOp, IrFunction, IrModule, Op, StateField, TernaryOp, UnaryOp};
use crate::codegen::types::FunctionKind;
use crate::dsl::ValueType;

fn unary_name(op: UnaryOp) -> &'static str {
    match op {
        UnaryOp::Neg => "neg",
        UnaryOp::Not => "not",
        UnaryOp::Sin => "sin",
        UnaryOp::Cos => "cos",
        UnaryOp::Sqrt => "sqrt",
        UnaryOp::Abs => "abs",
        UnaryOp::Floor => "floor",
        UnaryOp::Saturate => "saturate",
        UnaryOp::Normalize => "normalize",
        UnaryOp::Length => "length",
    }
}

fn binary_name(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "add",
        BinaryOp::Sub => "sub",
        BinaryOp::Mul => "mul",
        BinaryOp::Div => "div",
        BinaryOp::Less => "lt",
        BinaryOp::LessEqual => "le",
        BinaryOp::Greater => "gt",
        BinaryOp::Equal => "eq",
        BinaryOp::And => "and",
        BinaryOp::Or => "or",
        BinaryOp::Min => "min",
        BinaryOp::Max => "max",
        BinaryOp::Pow => "pow",
        BinaryOp::Dot => "dot",
        BinaryOp::Cross => "cross",
    }
}

fn state_name(field: StateField) -> &'static str {
    match field {
        StateField::Normal => "normal",
        StateField::Position => "position",
        StateField::Direction => "direction",
        StateField::AnimationTime => "animation_time",
        StateField::ObjectId => "object_id",
    }
}

fn operands(ids: &[u32]) -> String {
    ids.iter().map(|a| format!("%{a}")).collect::<Vec<_>>().join(", ")
}

fn op_text(op: &Op) -> String {
    match op {
        Op::Bool(b) => format!("const {b}"),
        Op::Int(i) => format!("const {i}"),
        Op::Float(f) => format!("const {f:?}"),
        Op::Double(d) => format!("const {d:?}d"),
        Op::RoLoad { offset } => format!("ro_load +{offset}"),
        Op::ArgLoad { block, offset } => format!("arg_load {block} +{offset}"),
        Op::Construct(args) => format!("construct {}", operands(args)),
        Op::Extract { value, index } => format!("extract %{value}, {index}"),
        Op::Unary(u, a) => format!("{} %{a}", unary_name(*u)),
        Op::Binary(b, x, y) => format!("{} %{x}, %{y}", binary_name(*b)),
        Op::Ternary(t, a, b, c) => {
            let name = match t {
                TernaryOp::Select => "select",
                TernaryOp::Clamp => "clamp",
                TernaryOp::Lerp => "lerp",
            };
            format!("{name} %{a}, %{b}, %{c}")
        }
        Op::State(field) => format!("state {}", state_name(*field)),
        Op::TextureCoordinate(i) => format!("texture_coordinate {i}"),
        Op::TextureResult(i) => format!("texture_result {i}"),
        Op::RuntimeCall { name, args } => format!("call @{name}({})", operands(args)),
    }
}

/// Signature line of `func`, without its body.
pub fn prototype(func: &IrFunction) -> String {
    let mut params = vec!["state".to_string()];
    if let Some(block) = func.arg_block {
        params.push(format!("args: arg_block {block}"));
    }
    let ret = match func.kind {
        FunctionKind::DfInit => "void".to_string(),
        FunctionKind::SwitchLambda => {
            params.push("index: int".to_string());
            let tys: Vec<String> = func.result_types().iter().map(|t| t.to_string()).collect();
            format!("switch({})", tys.join(", "))
        }
        _ => func
            .result_types()
            .first()
            .map_or_else(|| "void".to_string(), |t| t.to_string()),
    };
    format!("fn {}({}) -> {ret}", func.name, params.join(", "))
}

fn write_function(out: &mut String, func: &IrFunction) {
    let _ = writeln!(out, "; {} {:?}", func.kind.as_str(), func.context);
    let _ = writeln!(out, "{} {{", prototype(func));
    for (i, inst) in func.body.iter().enumerate() {
        let _ = writeln!(out, "  %{i}: {} = {}", inst.ty, op_text(&inst.op));
    }
    for (slot, v) in &func.stores {
        let _ = writeln!(out, "  store texture_result {slot}, %{v}");
    }
    if !func.results.is_empty() {
        let _ = writeln!(out, "  ret {}", operands(&func.results));
    }
    out.push_str("}\n");
}

fn escape(s: &str) -> String {
    s.chars().flat_map(char::escape_default).collect()
}

/// Full listing of a module: header, data tables, argument blocks and functions.
pub fn write(module: &IrModule) -> String {
    let mut out = String::new();
    out.push_str("; node-forge portable ir\n");
    let _ = writeln!(out, "; state_usage 0x{:02x}", module.state_usage.0);
    let _ = writeln!(
        out,
        "; texture_spaces {} texture_results {}",
        module.num_texture_spaces, module.num_texture_results
    );
    if !module.ro_segment.is_empty() {
        let _ = writeln!(out, "ro_segment {} bytes", module.ro_segment.len());
        for (row, chunk) in module.ro_segment.chunks(16).enumerate() {
            let bytes: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
            let _ = writeln!(out, "  {:04x}: {}", row * 16, bytes.join(" "));
        }
    }
    for (i, s) in module.strings.iter().enumerate() {
        let _ = writeln!(out, "string {i} \"{}\"", escape(s));
    }
    for (i, block) in module.arg_blocks.iter().enumerate() {
        let fields: Vec<String> = block
            .names
            .iter()
            .zip(&block.types)
            .map(|(n, t): (&String, &ValueType)| format!("{n}: {t}"))
            .collect();
        let _ = writeln!(out, "arg_block {i} {{ {} }}", fields.join(", "));
    }
    for func in &module.functions {
        out.push('\n');
        write_function(&mut out, func);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::lower::Inst;
    use crate::codegen::types::ExecutionContext;

    #[test]
    fn listing_names_functions_and_instructions() {
        let mut f = IrFunction::new("tint", FunctionKind::Lambda, ExecutionContext::Core);
        f.body.push(Inst {
            ty: ValueType::Float,
            op: Op::Float(0.5),
        });
        f.body.push(Inst {
            ty: ValueType::Color,
            op: Op::Construct(vec![0]),
        });
        f.results.push(1);
        let module = IrModule {
            functions: vec![f],
            strings: vec![String::new(), "a\"b".to_string()],
            ..IrModule::default()
        };
        let text = write(&module);
        assert!(text.contains("fn tint(state) -> color {"));
        assert!(text.contains("%1: color = construct %0"));
        assert!(text.contains("ret %1"));
        assert!(text.contains("string 1 \"a\\\"b\""));
    }
}
