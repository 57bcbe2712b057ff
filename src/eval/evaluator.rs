use crate::error::{MicroflowError, Result};
use crate::value::Value;

use super::builtins;
use super::instructions::{BinaryOp, Expression, Instruction, UnaryOp};
use super::stack::EvalStack;

/// 求值作用域 - 单次求值期间对 flow state 数据的只读视图
pub struct EvalScope<'a> {
    /// The flow state's full values array (component input slots + variables).
    pub values: &'a [Value],
    /// Value-slot index of each input of the executing component.
    pub input_slots: &'a [usize],
    /// Offset of the first variable slot inside `values`.
    pub variable_base: usize,
}

/// 可赋值引用 - 赋值表达式解析出的左值
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssignableRef {
    Variable(usize),
}

/// Interpret a compiled expression against a flow state, producing one value
/// or a captioned failure. Never panics on malformed input.
pub fn eval_expression(expression: &Expression, scope: &EvalScope<'_>) -> Result<Value> {
    let mut stack = EvalStack::new();

    for instruction in &expression.instructions {
        match instruction {
            Instruction::PushLiteral(value) => stack.push(value.clone())?,
            Instruction::LoadVariable(index) => {
                let slot = scope.variable_base + index;
                let value = scope.values.get(slot).cloned().ok_or_else(|| {
                    MicroflowError::Evaluation(format!("variable index {index} out of range"))
                })?;
                stack.push(value)?;
            }
            Instruction::LoadInput(index) => {
                let slot = *scope.input_slots.get(*index).ok_or_else(|| {
                    MicroflowError::Evaluation(format!("input index {index} out of range"))
                })?;
                let value = scope.values.get(slot).cloned().unwrap_or_default();
                stack.push(value)?;
            }
            Instruction::Binary(op) => {
                let rhs = stack.pop();
                let lhs = stack.pop();
                if lhs.is_error() || rhs.is_error() {
                    stack.push(Value::Error)?;
                } else {
                    stack.push(apply_binary(*op, &lhs, &rhs)?)?;
                }
            }
            Instruction::Unary(op) => {
                let operand = stack.pop();
                if operand.is_error() {
                    stack.push(Value::Error)?;
                } else {
                    stack.push(apply_unary(*op, &operand)?)?;
                }
            }
            Instruction::Call { function, arity } => {
                let mut args = vec![Value::Undefined; *arity];
                for slot in args.iter_mut().rev() {
                    *slot = stack.pop();
                }
                if args.iter().any(Value::is_error) {
                    stack.push(Value::Error)?;
                } else {
                    let builtin = builtins::lookup(function)?;
                    stack.push(builtin(&args)?)?;
                }
            }
        }
    }

    let result = stack.pop();
    if result.is_error() {
        return Err(MicroflowError::Evaluation(
            "expression produced no value".to_string(),
        ));
    }
    if stack.len() != 0 {
        return Err(MicroflowError::Evaluation(
            "malformed expression: leftover operands".to_string(),
        ));
    }
    Ok(result)
}

/// Resolve an lvalue-like expression (currently: one variable load) for
/// components that write results back.
pub fn eval_assignable_expression(expression: &Expression) -> Result<AssignableRef> {
    match expression.instructions.as_slice() {
        [Instruction::LoadVariable(index)] => Ok(AssignableRef::Variable(*index)),
        _ => Err(MicroflowError::Evaluation(
            "expression is not assignable".to_string(),
        )),
    }
}

fn apply_binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value> {
    match op {
        BinaryOp::And => Ok(Value::Boolean(lhs.as_boolean() && rhs.as_boolean())),
        BinaryOp::Or => Ok(Value::Boolean(lhs.as_boolean() || rhs.as_boolean())),
        BinaryOp::Eq => Ok(Value::Boolean(lhs == rhs)),
        BinaryOp::NotEq => Ok(Value::Boolean(lhs != rhs)),
        BinaryOp::Less | BinaryOp::LessEq | BinaryOp::Greater | BinaryOp::GreaterEq => {
            let ordering = lhs.numeric_cmp(rhs).ok_or_else(|| {
                MicroflowError::Evaluation(format!(
                    "cannot compare {} and {}",
                    lhs.kind_name(),
                    rhs.kind_name()
                ))
            })?;
            let outcome = match op {
                BinaryOp::Less => ordering.is_lt(),
                BinaryOp::LessEq => ordering.is_le(),
                BinaryOp::Greater => ordering.is_gt(),
                _ => ordering.is_ge(),
            };
            Ok(Value::Boolean(outcome))
        }
        BinaryOp::Add => {
            if matches!(lhs, Value::String(_)) || matches!(rhs, Value::String(_)) {
                return Ok(Value::String(format!("{lhs}{rhs}")));
            }
            arithmetic(op, lhs, rhs)
        }
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => arithmetic(op, lhs, rhs),
    }
}

fn arithmetic(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value> {
    // Integer operands stay integers except for division.
    if let (Value::Integer(a), Value::Integer(b)) = (lhs, rhs) {
        match op {
            BinaryOp::Add => return Ok(Value::Integer(a.wrapping_add(*b))),
            BinaryOp::Sub => return Ok(Value::Integer(a.wrapping_sub(*b))),
            BinaryOp::Mul => return Ok(Value::Integer(a.wrapping_mul(*b))),
            BinaryOp::Mod => {
                if *b == 0 {
                    return Err(MicroflowError::Evaluation("division by zero".to_string()));
                }
                return Ok(Value::Integer(a.wrapping_rem(*b)));
            }
            _ => {}
        }
    }

    let type_error = || {
        MicroflowError::Evaluation(format!(
            "arithmetic on {} and {}",
            lhs.kind_name(),
            rhs.kind_name()
        ))
    };
    let a = lhs.as_float().ok_or_else(type_error)?;
    let b = rhs.as_float().ok_or_else(type_error)?;
    match op {
        BinaryOp::Add => Ok(Value::Float(a + b)),
        BinaryOp::Sub => Ok(Value::Float(a - b)),
        BinaryOp::Mul => Ok(Value::Float(a * b)),
        BinaryOp::Div | BinaryOp::Mod => {
            if b == 0.0 {
                return Err(MicroflowError::Evaluation("division by zero".to_string()));
            }
            if matches!(op, BinaryOp::Div) {
                Ok(Value::Float(a / b))
            } else {
                Ok(Value::Float(a % b))
            }
        }
        _ => unreachable!("non-arithmetic operator"),
    }
}

fn apply_unary(op: UnaryOp, operand: &Value) -> Result<Value> {
    match op {
        UnaryOp::Not => Ok(Value::Boolean(!operand.as_boolean())),
        UnaryOp::Neg => match operand {
            Value::Integer(n) => Ok(Value::Integer(n.wrapping_neg())),
            other => {
                let x = other.as_float().ok_or_else(|| {
                    MicroflowError::Evaluation(format!("cannot negate {}", other.kind_name()))
                })?;
                Ok(Value::Float(-x))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_scope<'a>(values: &'a [Value]) -> EvalScope<'a> {
        EvalScope {
            values,
            input_slots: &[],
            variable_base: 0,
        }
    }

    #[test]
    fn integer_arithmetic_stays_integer() {
        let expr = Expression::binary(
            BinaryOp::Add,
            Expression::literal(2i64),
            Expression::binary(BinaryOp::Mul, Expression::literal(3i64), Expression::literal(4i64)),
        );
        let result = eval_expression(&expr, &empty_scope(&[])).unwrap();
        assert_eq!(result, Value::Integer(14));
    }

    #[test]
    fn division_produces_float() {
        let expr = Expression::binary(
            BinaryOp::Div,
            Expression::literal(7i64),
            Expression::literal(2i64),
        );
        assert_eq!(eval_expression(&expr, &empty_scope(&[])).unwrap(), Value::Float(3.5));
    }

    #[test]
    fn division_by_zero_reports_cleanly() {
        let expr = Expression::binary(
            BinaryOp::Div,
            Expression::literal(1i64),
            Expression::literal(0i64),
        );
        assert!(matches!(
            eval_expression(&expr, &empty_scope(&[])),
            Err(MicroflowError::Evaluation(_))
        ));
    }

    #[test]
    fn string_concat_on_add() {
        let expr = Expression::binary(
            BinaryOp::Add,
            Expression::literal("n="),
            Expression::literal(5i64),
        );
        assert_eq!(
            eval_expression(&expr, &empty_scope(&[])).unwrap(),
            Value::String("n=5".into())
        );
    }

    #[test]
    fn variable_load_uses_variable_base() {
        let values = [Value::Undefined, Value::Integer(9)];
        let scope = EvalScope {
            values: &values,
            input_slots: &[],
            variable_base: 1,
        };
        let expr = Expression::variable(0);
        assert_eq!(eval_expression(&expr, &scope).unwrap(), Value::Integer(9));
    }

    #[test]
    fn underflow_surfaces_as_evaluation_error() {
        // A bare operator pops the error sentinel twice and poisons the result.
        let expr = Expression {
            instructions: vec![Instruction::Binary(BinaryOp::Add)],
        };
        assert!(matches!(
            eval_expression(&expr, &empty_scope(&[])),
            Err(MicroflowError::Evaluation(_))
        ));
    }

    #[test]
    fn leftover_operands_are_rejected() {
        let expr = Expression {
            instructions: vec![
                Instruction::PushLiteral(Value::Integer(1)),
                Instruction::PushLiteral(Value::Integer(2)),
            ],
        };
        assert!(matches!(
            eval_expression(&expr, &empty_scope(&[])),
            Err(MicroflowError::Evaluation(_))
        ));
    }

    #[test]
    fn builtin_call_roundtrip() {
        let expr = Expression::call(
            "clamp",
            vec![
                Expression::literal(12.0),
                Expression::literal(0.0),
                Expression::literal(10.0),
            ],
        );
        assert_eq!(eval_expression(&expr, &empty_scope(&[])).unwrap(), Value::Float(10.0));
    }

    #[test]
    fn unknown_function_is_an_error() {
        let expr = Expression::call("bogus", vec![]);
        assert!(matches!(
            eval_expression(&expr, &empty_scope(&[])),
            Err(MicroflowError::Evaluation(_))
        ));
    }

    #[test]
    fn assignable_resolution() {
        assert_eq!(
            eval_assignable_expression(&Expression::variable(3)).unwrap(),
            AssignableRef::Variable(3)
        );
        assert!(eval_assignable_expression(&Expression::literal(1i64)).is_err());
    }
}
