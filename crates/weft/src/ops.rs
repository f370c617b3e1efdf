//! The value calculator.
//!
//! Stateless helpers for binary and unary instructions. One operator set
//! covers numbers, strings, and lists; dispatch is by operand type, with
//! int→float promotion when either side is a float. The runner delegates
//! here and never computes values itself.

use crate::bytecode::{BinOp, UnOp};
use crate::error::{Error, Result};
use crate::lists::{self, ListDef, ListTable};
use crate::strings::StringTable;
use crate::value::{ListRef, StrRef, Value};

/// Mutable slice of the world the calculator may touch: the constant pool
/// for reading strings, the tables for interning results.
pub(crate) struct OpEnv<'a> {
    pub consts: &'a [String],
    pub strings: &'a mut StringTable,
    pub lists: &'a mut ListTable,
    pub list_defs: &'a [ListDef],
}

impl OpEnv<'_> {
    fn str_of(&self, r: StrRef) -> &str {
        match r {
            StrRef::Const(i) => self.consts.get(i as usize).map(String::as_str).unwrap_or(""),
            StrRef::Heap(h) => self.strings.get(h),
        }
    }

    fn alloc_str(&mut self, text: String) -> Value {
        Value::Str(StrRef::Heap(self.strings.alloc(text)))
    }

    fn alloc_list(&mut self, set: lists::ListSet) -> Value {
        Value::List(ListRef(self.lists.alloc(set)))
    }

    /// Text form of a scalar, for string concatenation.
    fn scalar_text(&self, v: &Value) -> Option<String> {
        match v {
            Value::Str(r) => Some(self.str_of(*r).to_string()),
            Value::Int(i) => Some(i.to_string()),
            Value::Float(f) => Some(crate::output::render_float_text(*f)),
            Value::Bool(b) => Some(if *b { "true" } else { "false" }.to_string()),
            Value::Uint(u) => Some(u.to_string()),
            _ => None,
        }
    }
}

fn type_err(expected: &'static str, got: &Value) -> Error {
    Error::Type {
        expected,
        got: got.type_name(),
    }
}

pub(crate) fn apply_binary(op: BinOp, left: Value, right: Value, env: &mut OpEnv<'_>) -> Result<Value> {
    // Boolean connectives work on any truthy operands.
    match op {
        BinOp::And => return Ok(Value::Bool(left.is_truthy() && right.is_truthy())),
        BinOp::Or => return Ok(Value::Bool(left.is_truthy() || right.is_truthy())),
        _ => {}
    }

    // List algebra.
    if let (Value::List(a), Value::List(b)) = (&left, &right) {
        let a = env.lists.get(a.0).to_vec();
        let b = env.lists.get(b.0).to_vec();
        return Ok(match op {
            BinOp::Add => env.alloc_list(lists::union(&a, &b)),
            BinOp::Sub => env.alloc_list(lists::difference(&a, &b)),
            BinOp::Intersect => env.alloc_list(lists::intersect(&a, &b)),
            BinOp::Eq => Value::Bool(a == b),
            BinOp::Ne => Value::Bool(a != b),
            BinOp::Has => Value::Bool(lists::contains_all(&a, &b)),
            BinOp::Hasnt => Value::Bool(!lists::contains_all(&a, &b)),
            _ => return Err(type_err("number", &left)),
        });
    }

    // List shifted by an integer.
    if let (Value::List(a), Some(delta)) = (&left, right.as_int()) {
        let a = env.lists.get(a.0).to_vec();
        return Ok(match op {
            BinOp::Add => env.alloc_list(lists::shift(&a, delta, env.list_defs)),
            BinOp::Sub => env.alloc_list(lists::shift(&a, -delta, env.list_defs)),
            _ => return Err(type_err("list", &right)),
        });
    }

    // String operations.
    if matches!(left, Value::Str(_)) || matches!(right, Value::Str(_)) {
        return apply_string(op, &left, &right, env);
    }

    // Divert values compare by target.
    if let (Value::Divert(a), Value::Divert(b)) = (&left, &right) {
        return match op {
            BinOp::Eq => Ok(Value::Bool(a == b)),
            BinOp::Ne => Ok(Value::Bool(a != b)),
            _ => Err(type_err("number", &left)),
        };
    }

    apply_numeric(op, &left, &right)
}

fn apply_string(op: BinOp, left: &Value, right: &Value, env: &mut OpEnv<'_>) -> Result<Value> {
    let l = env
        .scalar_text(left)
        .ok_or_else(|| type_err("string", left))?;
    let r = env
        .scalar_text(right)
        .ok_or_else(|| type_err("string", right))?;
    match op {
        BinOp::Add => Ok(env.alloc_str(format!("{l}{r}"))),
        BinOp::Eq => Ok(Value::Bool(l == r)),
        BinOp::Ne => Ok(Value::Bool(l != r)),
        BinOp::Has => Ok(Value::Bool(l.contains(&r))),
        BinOp::Hasnt => Ok(Value::Bool(!l.contains(&r))),
        _ => Err(type_err("number", left)),
    }
}

fn apply_numeric(op: BinOp, left: &Value, right: &Value) -> Result<Value> {
    let use_float = matches!(left, Value::Float(_)) || matches!(right, Value::Float(_));

    if use_float {
        let l = left.as_float().ok_or_else(|| type_err("number", left))?;
        let r = right.as_float().ok_or_else(|| type_err("number", right))?;
        let v = match op {
            BinOp::Add => Value::Float(l + r),
            BinOp::Sub => Value::Float(l - r),
            BinOp::Mul => Value::Float(l * r),
            BinOp::Div => {
                if r == 0.0 {
                    return Err(Error::DivisionByZero);
                }
                Value::Float(l / r)
            }
            BinOp::Mod => {
                if r == 0.0 {
                    return Err(Error::DivisionByZero);
                }
                Value::Float(l % r)
            }
            BinOp::Pow => Value::Float(l.powf(r)),
            BinOp::Eq => Value::Bool(l == r),
            BinOp::Ne => Value::Bool(l != r),
            BinOp::Lt => Value::Bool(l < r),
            BinOp::Gt => Value::Bool(l > r),
            BinOp::Le => Value::Bool(l <= r),
            BinOp::Ge => Value::Bool(l >= r),
            BinOp::Min => Value::Float(l.min(r)),
            BinOp::Max => Value::Float(l.max(r)),
            _ => return Err(type_err("number", left)),
        };
        return Ok(v);
    }

    let l = left.as_int().ok_or_else(|| type_err("number", left))?;
    let r = right.as_int().ok_or_else(|| type_err("number", right))?;
    let v = match op {
        BinOp::Add => Value::Int(l.wrapping_add(r)),
        BinOp::Sub => Value::Int(l.wrapping_sub(r)),
        BinOp::Mul => Value::Int(l.wrapping_mul(r)),
        BinOp::Div => {
            if r == 0 {
                return Err(Error::DivisionByZero);
            }
            Value::Int(l.wrapping_div(r))
        }
        BinOp::Mod => {
            if r == 0 {
                return Err(Error::DivisionByZero);
            }
            Value::Int(l.wrapping_rem(r))
        }
        BinOp::Pow => {
            if r >= 0 {
                Value::Int(l.wrapping_pow(r as u32))
            } else {
                Value::Float((l as f32).powf(r as f32))
            }
        }
        BinOp::Eq => Value::Bool(l == r),
        BinOp::Ne => Value::Bool(l != r),
        BinOp::Lt => Value::Bool(l < r),
        BinOp::Gt => Value::Bool(l > r),
        BinOp::Le => Value::Bool(l <= r),
        BinOp::Ge => Value::Bool(l >= r),
        BinOp::Min => Value::Int(l.min(r)),
        BinOp::Max => Value::Int(l.max(r)),
        _ => return Err(type_err("number", left)),
    };
    Ok(v)
}

pub(crate) fn apply_unary(op: UnOp, operand: Value, env: &mut OpEnv<'_>) -> Result<Value> {
    match op {
        UnOp::Not => Ok(Value::Bool(!operand.is_truthy())),
        UnOp::Neg => match operand {
            Value::Int(i) => Ok(Value::Int(i.wrapping_neg())),
            Value::Float(f) => Ok(Value::Float(-f)),
            _ => Err(type_err("number", &operand)),
        },
        UnOp::Floor => match operand {
            Value::Int(_) => Ok(operand),
            Value::Float(f) => Ok(Value::Float(f.floor())),
            _ => Err(type_err("number", &operand)),
        },
        UnOp::Ceil => match operand {
            Value::Int(_) => Ok(operand),
            Value::Float(f) => Ok(Value::Float(f.ceil())),
            _ => Err(type_err("number", &operand)),
        },
        UnOp::ToInt => match operand {
            Value::Int(_) => Ok(operand),
            Value::Float(f) => Ok(Value::Int(f as i32)),
            Value::Bool(b) => Ok(Value::Int(b as i32)),
            _ => Err(type_err("number", &operand)),
        },
        UnOp::ToFloat => operand
            .as_float()
            .map(Value::Float)
            .ok_or_else(|| type_err("number", &operand)),
        UnOp::ListCount
        | UnOp::ListMin
        | UnOp::ListMax
        | UnOp::ListInvert
        | UnOp::ListValue => {
            let Value::List(l) = operand else {
                return Err(type_err("list", &operand));
            };
            let set = env.lists.get(l.0).to_vec();
            Ok(match op {
                UnOp::ListCount => Value::Int(set.len() as i32),
                UnOp::ListMin => {
                    let entries = lists::min_entry(&set).into_iter().collect();
                    env.alloc_list(entries)
                }
                UnOp::ListMax => {
                    let entries = lists::max_entry(&set).into_iter().collect();
                    env.alloc_list(entries)
                }
                UnOp::ListInvert => {
                    let inverted = lists::invert(&set, env.list_defs);
                    env.alloc_list(inverted)
                }
                UnOp::ListValue => {
                    Value::Int(lists::max_entry(&set).map_or(0, |(_, v)| v as i32))
                }
                _ => unreachable!(),
            })
        }
    }
}
