use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::error::{MicroflowError, Result};
use crate::value::Value;

pub(crate) type BuiltinFn = fn(&[Value]) -> Result<Value>;

/// 求值器内置函数表
pub(crate) static BUILTIN_FUNCTIONS: Lazy<HashMap<&'static str, BuiltinFn>> = Lazy::new(|| {
    let mut table: HashMap<&'static str, BuiltinFn> = HashMap::new();
    table.insert("abs", builtin_abs);
    table.insert("min", builtin_min);
    table.insert("max", builtin_max);
    table.insert("clamp", builtin_clamp);
    table.insert("floor", builtin_floor);
    table.insert("ceil", builtin_ceil);
    table.insert("round", builtin_round);
    table.insert("len", builtin_len);
    table
});

fn numeric_arg(args: &[Value], index: usize, function: &str) -> Result<f64> {
    args.get(index)
        .and_then(Value::as_float)
        .ok_or_else(|| {
            MicroflowError::Evaluation(format!(
                "`{function}` expects a numeric argument at position {index}"
            ))
        })
}

fn builtin_abs(args: &[Value]) -> Result<Value> {
    match args {
        [Value::Integer(n)] => Ok(Value::Integer(n.wrapping_abs())),
        _ => Ok(Value::Float(numeric_arg(args, 0, "abs")?.abs())),
    }
}

fn builtin_min(args: &[Value]) -> Result<Value> {
    let a = numeric_arg(args, 0, "min")?;
    let b = numeric_arg(args, 1, "min")?;
    Ok(Value::Float(a.min(b)))
}

fn builtin_max(args: &[Value]) -> Result<Value> {
    let a = numeric_arg(args, 0, "max")?;
    let b = numeric_arg(args, 1, "max")?;
    Ok(Value::Float(a.max(b)))
}

fn builtin_clamp(args: &[Value]) -> Result<Value> {
    let value = numeric_arg(args, 0, "clamp")?;
    let low = numeric_arg(args, 1, "clamp")?;
    let high = numeric_arg(args, 2, "clamp")?;
    Ok(Value::Float(value.clamp(low, high)))
}

fn builtin_floor(args: &[Value]) -> Result<Value> {
    Ok(Value::Float(numeric_arg(args, 0, "floor")?.floor()))
}

fn builtin_ceil(args: &[Value]) -> Result<Value> {
    Ok(Value::Float(numeric_arg(args, 0, "ceil")?.ceil()))
}

fn builtin_round(args: &[Value]) -> Result<Value> {
    Ok(Value::Float(numeric_arg(args, 0, "round")?.round()))
}

fn builtin_len(args: &[Value]) -> Result<Value> {
    match args.first() {
        Some(Value::String(s)) => Ok(Value::Integer(s.chars().count() as i64)),
        Some(Value::Array(items)) => Ok(Value::Integer(items.len() as i64)),
        other => Err(MicroflowError::Evaluation(format!(
            "`len` expects a string or array, got {}",
            other.map(Value::kind_name).unwrap_or("nothing")
        ))),
    }
}

pub(crate) fn lookup(function: &str) -> Result<BuiltinFn> {
    BUILTIN_FUNCTIONS
        .get(function)
        .copied()
        .ok_or_else(|| MicroflowError::Evaluation(format!("unknown function `{function}`")))
}
