//! Function-local clean-up passes run after lowering.
//!
//! opt_level 1 folds constants; opt_level 2 additionally merges identical
//! instructions and drops instructions nothing reads. Fast math enables the
//! identities that are not exact under IEEE rules.

use std::collections::HashMap;

use crate::dsl::ValueType;

use super::ir::{BinaryOp, Inst, InstId, IrFunction, Op, TernaryOp, UnaryOp};

pub fn optimize(func: &mut IrFunction, opt_level: u8, fast_math: bool) {
    if opt_level == 0 {
        return;
    }
    simplify(func, opt_level >= 2, fast_math);
    if opt_level >= 2 {
        eliminate_dead_code(func);
    }
}

enum Rewrite {
    Keep,
    Alias(InstId),
    Replace(Op),
    MulByReciprocal { value: InstId, reciprocal: f32 },
}

fn push(body: &mut Vec<Inst>, seen: &mut HashMap<String, InstId>, inst: Inst, cse: bool) -> InstId {
    if cse {
        let key = format!("{:?}", inst);
        if let Some(id) = seen.get(&key) {
            return *id;
        }
        let id = body.len() as InstId;
        body.push(inst);
        seen.insert(key, id);
        return id;
    }
    body.push(inst);
    (body.len() - 1) as InstId
}

fn simplify(func: &mut IrFunction, cse: bool, fast_math: bool) {
    let old = std::mem::take(&mut func.body);
    let mut remap: Vec<InstId> = Vec::with_capacity(old.len());
    let mut seen = HashMap::new();
    let mut body: Vec<Inst> = Vec::with_capacity(old.len());

    for mut inst in old {
        inst.op.map_operands(&|a| remap[a as usize]);
        let id = match fold(&body, &inst, fast_math) {
            Rewrite::Keep => push(&mut body, &mut seen, inst, cse),
            Rewrite::Alias(id) => id,
            Rewrite::Replace(op) => push(&mut body, &mut seen, Inst { ty: inst.ty, op }, cse),
            Rewrite::MulByReciprocal { value, reciprocal } => {
                let c = push(
                    &mut body,
                    &mut seen,
                    Inst {
                        ty: ValueType::Float,
                        op: Op::Float(reciprocal),
                    },
                    cse,
                );
                push(
                    &mut body,
                    &mut seen,
                    Inst {
                        ty: inst.ty,
                        op: Op::Binary(BinaryOp::Mul, value, c),
                    },
                    cse,
                )
            }
        };
        remap.push(id);
    }

    func.body = body;
    for r in func.results.iter_mut() {
        *r = remap[*r as usize];
    }
    for (_, v) in func.stores.iter_mut() {
        *v = remap[*v as usize];
    }
}

fn is_float_based(ty: &ValueType) -> bool {
    match ty {
        ValueType::Float | ValueType::Color => true,
        ValueType::Vector { element, .. } => *element == crate::dsl::ScalarType::Float,
        _ => false,
    }
}

fn fold(body: &[Inst], inst: &Inst, fast_math: bool) -> Rewrite {
    let op_of = |id: InstId| &body[id as usize].op;
    let ty_of = |id: InstId| &body[id as usize].ty;

    match &inst.op {
        Op::Unary(u, a) => match (u, op_of(*a)) {
            (UnaryOp::Neg, Op::Float(x)) => Rewrite::Replace(Op::Float(-x)),
            (UnaryOp::Neg, Op::Int(x)) => Rewrite::Replace(Op::Int(x.wrapping_neg())),
            (UnaryOp::Not, Op::Bool(b)) => Rewrite::Replace(Op::Bool(!b)),
            (UnaryOp::Sin, Op::Float(x)) => Rewrite::Replace(Op::Float(x.sin())),
            (UnaryOp::Cos, Op::Float(x)) => Rewrite::Replace(Op::Float(x.cos())),
            (UnaryOp::Sqrt, Op::Float(x)) => Rewrite::Replace(Op::Float(x.sqrt())),
            (UnaryOp::Abs, Op::Float(x)) => Rewrite::Replace(Op::Float(x.abs())),
            (UnaryOp::Abs, Op::Int(x)) => Rewrite::Replace(Op::Int(x.wrapping_abs())),
            (UnaryOp::Floor, Op::Float(x)) => Rewrite::Replace(Op::Float(x.floor())),
            (UnaryOp::Saturate, Op::Float(x)) => Rewrite::Replace(Op::Float(x.clamp(0.0, 1.0))),
            _ => Rewrite::Keep,
        },
        Op::Binary(b, x, y) => {
            if let Some(op) = fold_binary(*b, op_of(*x), op_of(*y)) {
                return Rewrite::Replace(op);
            }
            if !fast_math || !is_float_based(&inst.ty) {
                return Rewrite::Keep;
            }
            let same = |id: InstId| ty_of(id) == &inst.ty;
            match (b, op_of(*x), op_of(*y)) {
                (BinaryOp::Mul, _, Op::Float(c)) if *c == 1.0 && same(*x) => Rewrite::Alias(*x),
                (BinaryOp::Mul, Op::Float(c), _) if *c == 1.0 && same(*y) => Rewrite::Alias(*y),
                (BinaryOp::Add | BinaryOp::Sub, _, Op::Float(c)) if *c == 0.0 && same(*x) => Rewrite::Alias(*x),
                (BinaryOp::Add, Op::Float(c), _) if *c == 0.0 && same(*y) => Rewrite::Alias(*y),
                (BinaryOp::Div, _, Op::Float(c)) if *c != 0.0 => Rewrite::MulByReciprocal {
                    value: *x,
                    reciprocal: 1.0 / c,
                },
                _ => Rewrite::Keep,
            }
        }
        Op::Ternary(TernaryOp::Select, c, a, b) => match op_of(*c) {
            Op::Bool(true) if ty_of(*a) == &inst.ty => Rewrite::Alias(*a),
            Op::Bool(false) if ty_of(*b) == &inst.ty => Rewrite::Alias(*b),
            _ => Rewrite::Keep,
        },
        Op::Extract { value, index } => match op_of(*value) {
            Op::Construct(args)
                if args.len() == ty_of(*value).child_count()
                    && args.get(*index as usize).is_some_and(|a| ty_of(*a) == &inst.ty) =>
            {
                Rewrite::Alias(args[*index as usize])
            }
            _ => Rewrite::Keep,
        },
        _ => Rewrite::Keep,
    }
}

fn fold_binary(op: BinaryOp, a: &Op, b: &Op) -> Option<Op> {
    use BinaryOp::*;
    Some(match (a, b) {
        (Op::Float(x), Op::Float(y)) => match op {
            Add => Op::Float(x + y),
            Sub => Op::Float(x - y),
            Mul => Op::Float(x * y),
            Div => Op::Float(x / y),
            Min => Op::Float(x.min(*y)),
            Max => Op::Float(x.max(*y)),
            Pow => Op::Float(x.powf(*y)),
            Less => Op::Bool(x < y),
            LessEqual => Op::Bool(x <= y),
            Greater => Op::Bool(x > y),
            Equal => Op::Bool(x == y),
            _ => return None,
        },
        (Op::Int(x), Op::Int(y)) => match op {
            Add => Op::Int(x.wrapping_add(*y)),
            Sub => Op::Int(x.wrapping_sub(*y)),
            Mul => Op::Int(x.wrapping_mul(*y)),
            Div => Op::Int(x.checked_div(*y)?),
            Min => Op::Int(*x.min(y)),
            Max => Op::Int(*x.max(y)),
            Less => Op::Bool(x < y),
            LessEqual => Op::Bool(x <= y),
            Greater => Op::Bool(x > y),
            Equal => Op::Bool(x == y),
            _ => return None,
        },
        (Op::Bool(x), Op::Bool(y)) => match op {
            And => Op::Bool(*x && *y),
            Or => Op::Bool(*x || *y),
            Equal => Op::Bool(x == y),
            _ => return None,
        },
        _ => return None,
    })
}

fn eliminate_dead_code(func: &mut IrFunction) {
    let mut live = vec![false; func.body.len()];
    for r in func.results.iter().chain(func.stores.iter().map(|(_, v)| v)) {
        live[*r as usize] = true;
    }
    for i in (0..func.body.len()).rev() {
        if !live[i] {
            continue;
        }
        for a in func.body[i].op.operands() {
            live[a as usize] = true;
        }
    }

    let old = std::mem::take(&mut func.body);
    let mut remap = vec![0 as InstId; old.len()];
    for (i, mut inst) in old.into_iter().enumerate() {
        if !live[i] {
            continue;
        }
        inst.op.map_operands(&|a| remap[a as usize]);
        remap[i] = func.body.len() as InstId;
        func.body.push(inst);
    }
    for r in func.results.iter_mut() {
        *r = remap[*r as usize];
    }
    for (_, v) in func.stores.iter_mut() {
        *v = remap[*v as usize];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::types::{ExecutionContext, FunctionKind};

    fn func(body: Vec<(ValueType, Op)>, result: InstId) -> IrFunction {
        let mut f = IrFunction::new("f", FunctionKind::Lambda, ExecutionContext::Core);
        f.body = body.into_iter().map(|(ty, op)| Inst { ty, op }).collect();
        f.results.push(result);
        f
    }

    #[test]
    fn level_zero_leaves_code_alone() {
        let mut f = func(
            vec![
                (ValueType::Float, Op::Float(2.0)),
                (ValueType::Float, Op::Float(3.0)),
                (ValueType::Float, Op::Binary(BinaryOp::Add, 0, 1)),
            ],
            2,
        );
        let before = f.clone();
        optimize(&mut f, 0, true);
        assert_eq!(f, before);
    }

    #[test]
    fn folding_and_dce_collapse_constants() {
        let mut f = func(
            vec![
                (ValueType::Float, Op::Float(2.0)),
                (ValueType::Float, Op::Float(3.0)),
                (ValueType::Float, Op::Binary(BinaryOp::Add, 0, 1)),
            ],
            2,
        );
        optimize(&mut f, 2, false);
        assert_eq!(f.body.len(), 1);
        assert_eq!(f.inst(f.results[0]).op, Op::Float(5.0));
    }

    #[test]
    fn fast_math_rewrites_division_by_constant() {
        let body = vec![
            (ValueType::float_vector(3), Op::State(super::super::ir::StateField::Normal)),
            (ValueType::Float, Op::Float(4.0)),
            (ValueType::float_vector(3), Op::Binary(BinaryOp::Div, 0, 1)),
        ];
        let mut precise = func(body.clone(), 2);
        optimize(&mut precise, 2, false);
        assert!(matches!(precise.inst(precise.results[0]).op, Op::Binary(BinaryOp::Div, _, _)));

        let mut fast = func(body, 2);
        optimize(&mut fast, 2, true);
        let Op::Binary(BinaryOp::Mul, _, c) = fast.inst(fast.results[0]).op else {
            panic!("expected a multiply");
        };
        assert_eq!(fast.inst(c).op, Op::Float(0.25));
    }

    #[test]
    fn cse_merges_identical_instructions() {
        let mut f = func(
            vec![
                (ValueType::float_vector(3), Op::State(super::super::ir::StateField::Normal)),
                (ValueType::float_vector(3), Op::State(super::super::ir::StateField::Normal)),
                (ValueType::Float, Op::Binary(BinaryOp::Dot, 0, 1)),
            ],
            2,
        );
        optimize(&mut f, 2, false);
        assert_eq!(f.body.len(), 2);
        assert_eq!(f.inst(f.results[0]).op, Op::Binary(BinaryOp::Dot, 0, 0));
    }
}
