//! Pure expression evaluation
//!
//! Expressions read only workflow inputs and locals; evaluating the same
//! expression over the same state yields the same value on every replay.
//! Any evaluation failure is a determinism violation from the engine's
//! perspective, so errors here are terse and permanent.

use serde_json::{Map, Number, Value};

use super::program::{BinaryOp, Expr};

/// Error from expression evaluation
#[derive(Debug, Clone, thiserror::Error)]
pub enum EvalError {
    #[error("unknown variable: {0}")]
    UnknownLocal(String),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("arithmetic produced a non-finite number")]
    NonFinite,
}

/// Evaluate an expression over workflow inputs and locals
pub fn eval_expr(
    expr: &Expr,
    inputs: &Value,
    locals: &Map<String, Value>,
) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal { value } => Ok(value.clone()),

        Expr::Input => Ok(inputs.clone()),

        Expr::Local { name } => locals
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::UnknownLocal(name.clone())),

        Expr::Get { object, key } => {
            let object = eval_expr(object, inputs, locals)?;
            match object {
                Value::Object(map) => Ok(map.get(key).cloned().unwrap_or(Value::Null)),
                // Missing data reads as null so workflows can branch on it.
                Value::Null => Ok(Value::Null),
                other => Err(EvalError::TypeMismatch(format!(
                    "cannot access property {key:?} of {}",
                    type_name(&other)
                ))),
            }
        }

        Expr::Object { fields } => {
            let mut map = Map::with_capacity(fields.len());
            for (key, value_expr) in fields {
                map.insert(key.clone(), eval_expr(value_expr, inputs, locals)?);
            }
            Ok(Value::Object(map))
        }

        Expr::List { items } => {
            let values = items
                .iter()
                .map(|item| eval_expr(item, inputs, locals))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Array(values))
        }

        Expr::Binary { op, left, right } => {
            let left = eval_expr(left, inputs, locals)?;
            let right = eval_expr(right, inputs, locals)?;
            eval_binary(*op, left, right)
        }

        Expr::Not { expr } => {
            let value = eval_expr(expr, inputs, locals)?;
            match value {
                Value::Bool(b) => Ok(Value::Bool(!b)),
                other => Err(EvalError::TypeMismatch(format!(
                    "cannot negate {}",
                    type_name(&other)
                ))),
            }
        }
    }
}

fn eval_binary(op: BinaryOp, left: Value, right: Value) -> Result<Value, EvalError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(left == right)),
        BinaryOp::Ne => Ok(Value::Bool(left != right)),

        BinaryOp::And | BinaryOp::Or => match (&left, &right) {
            (Value::Bool(l), Value::Bool(r)) => Ok(Value::Bool(if op == BinaryOp::And {
                *l && *r
            } else {
                *l || *r
            })),
            _ => Err(EvalError::TypeMismatch(format!(
                "logical operator requires booleans, got {} and {}",
                type_name(&left),
                type_name(&right)
            ))),
        },

        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = compare(&left, &right)?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                BinaryOp::Ge => ordering.is_ge(),
                _ => unreachable!(),
            }))
        }

        BinaryOp::Add => match (&left, &right) {
            (Value::String(l), Value::String(r)) => Ok(Value::String(format!("{l}{r}"))),
            _ => arithmetic(op, &left, &right),
        },

        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => arithmetic(op, &left, &right),
    }
}

fn compare(left: &Value, right: &Value) -> Result<std::cmp::Ordering, EvalError> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => {
            let l = l.as_f64().ok_or(EvalError::NonFinite)?;
            let r = r.as_f64().ok_or(EvalError::NonFinite)?;
            l.partial_cmp(&r).ok_or(EvalError::NonFinite)
        }
        (Value::String(l), Value::String(r)) => Ok(l.cmp(r)),
        _ => Err(EvalError::TypeMismatch(format!(
            "cannot compare {} with {}",
            type_name(left),
            type_name(right)
        ))),
    }
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, EvalError> {
    let (Value::Number(l), Value::Number(r)) = (left, right) else {
        return Err(EvalError::TypeMismatch(format!(
            "arithmetic requires numbers, got {} and {}",
            type_name(left),
            type_name(right)
        )));
    };

    // Integer operands stay integers except under division.
    if let (Some(l), Some(r)) = (l.as_i64(), r.as_i64()) {
        match op {
            BinaryOp::Add => return Ok(Value::from(l.wrapping_add(r))),
            BinaryOp::Sub => return Ok(Value::from(l.wrapping_sub(r))),
            BinaryOp::Mul => return Ok(Value::from(l.wrapping_mul(r))),
            BinaryOp::Div => {}
            _ => unreachable!(),
        }
    }

    let l = l.as_f64().ok_or(EvalError::NonFinite)?;
    let r = r.as_f64().ok_or(EvalError::NonFinite)?;

    let result = match op {
        BinaryOp::Add => l + r,
        BinaryOp::Sub => l - r,
        BinaryOp::Mul => l * r,
        BinaryOp::Div => {
            if r == 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            l / r
        }
        _ => unreachable!(),
    };

    Number::from_f64(result)
        .map(Value::Number)
        .ok_or(EvalError::NonFinite)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}
