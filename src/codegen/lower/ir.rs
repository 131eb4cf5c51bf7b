//! Typed SSA form shared by every target.
//!
//! Each function is a flat list of instructions; an instruction may only use
//! instructions that precede it. Resource and enum values are plain `int`s here.

use serde::{Deserialize, Serialize};

use crate::dsl::ValueType;

use super::super::types::{ExecutionContext, FunctionKind, StateUsage};

pub type InstId = u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Neg,
    Not,
    Sin,
    Cos,
    Sqrt,
    Abs,
    Floor,
    Saturate,
    Normalize,
    Length,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Less,
    LessEqual,
    Greater,
    Equal,
    And,
    Or,
    Min,
    Max,
    Pow,
    Dot,
    Cross,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TernaryOp {
    /// `select(cond, on_true, on_false)` with the condition first.
    Select,
    Clamp,
    Lerp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateField {
    Normal,
    Position,
    Direction,
    AnimationTime,
    ObjectId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Bool(bool),
    Int(i32),
    Float(f32),
    Double(f64),
    /// Constant of the instruction's type stored in the read-only segment.
    RoLoad { offset: u32 },
    /// Captured parameter read from argument block `block`.
    ArgLoad { block: u32, offset: u32 },
    Construct(Vec<InstId>),
    Extract { value: InstId, index: u32 },
    Unary(UnaryOp, InstId),
    Binary(BinaryOp, InstId, InstId),
    Ternary(TernaryOp, InstId, InstId, InstId),
    State(StateField),
    TextureCoordinate(u32),
    TextureResult(u32),
    RuntimeCall { name: String, args: Vec<InstId> },
}

impl Op {
    pub fn operands(&self) -> Vec<InstId> {
        match self {
            Op::Construct(args) | Op::RuntimeCall { args, .. } => args.clone(),
            Op::Extract { value, .. } => vec![*value],
            Op::Unary(_, a) => vec![*a],
            Op::Binary(_, a, b) => vec![*a, *b],
            Op::Ternary(_, a, b, c) => vec![*a, *b, *c],
            _ => Vec::new(),
        }
    }

    pub fn map_operands(&mut self, f: &dyn Fn(InstId) -> InstId) {
        match self {
            Op::Construct(args) | Op::RuntimeCall { args, .. } => {
                for a in args.iter_mut() {
                    *a = f(*a);
                }
            }
            Op::Extract { value, .. } => *value = f(*value),
            Op::Unary(_, a) => *a = f(*a),
            Op::Binary(_, a, b) => {
                *a = f(*a);
                *b = f(*b);
            }
            Op::Ternary(_, a, b, c) => {
                *a = f(*a);
                *b = f(*b);
                *c = f(*c);
            }
            _ => {}
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Op::Bool(_) | Op::Int(_) | Op::Float(_) | Op::Double(_))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Inst {
    #[serde(rename = "type")]
    pub ty: ValueType,
    pub op: Op,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IrFunction {
    pub name: String,
    pub kind: FunctionKind,
    pub context: ExecutionContext,
    pub arg_block: Option<u32>,
    pub body: Vec<Inst>,
    /// Returned values. Switch functions return `results[index]`; init returns nothing.
    pub results: Vec<InstId>,
    /// Texture-result slots written by distribution init functions.
    pub stores: Vec<(u32, InstId)>,
}

impl IrFunction {
    pub fn new(name: impl Into<String>, kind: FunctionKind, context: ExecutionContext) -> Self {
        Self {
            name: name.into(),
            kind,
            context,
            arg_block: None,
            body: Vec::new(),
            results: Vec::new(),
            stores: Vec::new(),
        }
    }

    pub fn inst(&self, id: InstId) -> &Inst {
        &self.body[id as usize]
    }

    pub fn result_types(&self) -> Vec<&ValueType> {
        self.results.iter().map(|r| &self.inst(*r).ty).collect()
    }
}

/// Declared parameters of one argument block, in layout order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArgBlockDecl {
    pub names: Vec<String>,
    pub types: Vec<ValueType>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IrModule {
    pub functions: Vec<IrFunction>,
    pub ro_segment: Vec<u8>,
    pub strings: Vec<String>,
    pub arg_blocks: Vec<ArgBlockDecl>,
    pub state_usage: StateUsage,
    pub num_texture_spaces: u32,
    pub num_texture_results: u32,
}

impl IrModule {
    pub fn function(&self, name: &str) -> Option<&IrFunction> {
        self.functions.iter().find(|f| f.name == name)
    }
}
