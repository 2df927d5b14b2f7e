//! Tree-walking evaluator over `serde_json::Value`.
//!
//! Evaluation has no side effects and no loops: cost is bounded by the node
//! count enforced at parse time and by the input sizes.

use std::collections::BTreeMap;

use serde_json::Value;

use super::parser::{BinOp, Func, Method, Node};
use super::Bindings;
use crate::error::{EngineError, Result};

pub(crate) struct Evaluator<'a> {
    bindings: &'a dyn Bindings,
    cache: BTreeMap<String, Value>,
}

impl<'a> Evaluator<'a> {
    pub fn new(bindings: &'a dyn Bindings) -> Self {
        Self {
            bindings,
            cache: BTreeMap::new(),
        }
    }

    pub fn eval(&mut self, node: &Node) -> Result<Value> {
        match node {
            Node::Lit(v) => Ok(v.clone()),
            Node::Ident(name) => self.ident(name),
            Node::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval(item)?);
                }
                Ok(Value::Array(out))
            }
            Node::Member(target, field) => {
                let t = self.eval(target)?;
                member(&t, field)
            }
            Node::Index(target, idx) => {
                let t = self.eval(target)?;
                let i = self.eval(idx)?;
                index(&t, &i)
            }
            Node::Call(func, args) => self.call(*func, args),
            Node::Method {
                target,
                method,
                args,
                regex,
            } => {
                let t = self.eval(target)?;
                let mut vals = Vec::with_capacity(args.len());
                for a in args {
                    vals.push(self.eval(a)?);
                }
                method_call(&t, *method, &vals, regex.as_ref())
            }
            Node::Not(inner) => {
                let v = self.eval(inner)?;
                Ok(Value::Bool(!as_bool(&v, "!")?))
            }
            Node::Neg(inner) => match self.eval(inner)? {
                Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        i.checked_neg()
                            .map(Value::from)
                            .ok_or_else(|| eval_err("integer overflow"))
                    } else {
                        Ok(Value::from(-n.as_f64().unwrap_or(0.0)))
                    }
                }
                other => Err(eval_err(&format!("cannot negate {}", type_name(&other)))),
            },
            Node::And(a, b) => {
                if !as_bool(&self.eval(a)?, "&&")? {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(as_bool(&self.eval(b)?, "&&")?))
            }
            Node::Or(a, b) => {
                if as_bool(&self.eval(a)?, "||")? {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(as_bool(&self.eval(b)?, "||")?))
            }
            Node::Binary(op, a, b) => {
                let l = self.eval(a)?;
                let r = self.eval(b)?;
                binary(*op, &l, &r)
            }
            Node::Cond(c, a, b) => {
                if as_bool(&self.eval(c)?, "?:")? {
                    self.eval(a)
                } else {
                    self.eval(b)
                }
            }
        }
    }

    fn ident(&mut self, name: &str) -> Result<Value> {
        if let Some(v) = self.cache.get(name) {
            return Ok(v.clone());
        }
        let v = self
            .bindings
            .resolve(name)
            .ok_or_else(|| eval_err(&format!("`{name}` is not available here")))?;
        self.cache.insert(name.to_string(), v.clone());
        Ok(v)
    }

    fn call(&mut self, func: Func, args: &[Node]) -> Result<Value> {
        let arg = match args.first() {
            Some(a) => self.eval(a)?,
            None => return Err(eval_err("missing argument")),
        };
        match func {
            Func::Has => Ok(Value::Bool(!arg.is_null())),
            Func::Size => size(&arg),
            Func::Int => match &arg {
                Value::Number(n) => n
                    .as_i64()
                    .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
                    .map(Value::from)
                    .ok_or_else(|| eval_err("not an integer")),
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::from)
                    .map_err(|_| eval_err(&format!("cannot convert `{s}` to int"))),
                Value::Bool(b) => Ok(Value::from(i64::from(*b))),
                other => Err(eval_err(&format!("cannot convert {} to int", type_name(other)))),
            },
            Func::String => Ok(Value::String(to_display(&arg))),
        }
    }
}

fn member(target: &Value, field: &str) -> Result<Value> {
    match target {
        Value::Object(m) => Ok(m.get(field).cloned().unwrap_or(Value::Null)),
        Value::Null => Ok(Value::Null),
        other => Err(eval_err(&format!("cannot read `.{field}` of {}", type_name(other)))),
    }
}

fn index(target: &Value, idx: &Value) -> Result<Value> {
    match (target, idx) {
        (Value::Object(m), Value::String(k)) => {
            // header maps are keyed lowercase; fall back to a case-insensitive probe
            if let Some(v) = m.get(k) {
                return Ok(v.clone());
            }
            let lower = k.to_ascii_lowercase();
            Ok(m.get(&lower).cloned().unwrap_or(Value::Null))
        }
        (Value::Array(a), Value::Number(n)) => {
            let Some(i) = n.as_i64() else {
                return Err(eval_err("list index must be an integer"));
            };
            if i < 0 {
                return Ok(Value::Null);
            }
            Ok(a.get(i as usize).cloned().unwrap_or(Value::Null))
        }
        (Value::Null, _) => Ok(Value::Null),
        (t, i) => Err(eval_err(&format!(
            "cannot index {} with {}",
            type_name(t),
            type_name(i)
        ))),
    }
}

fn method_call(target: &Value, method: Method, args: &[Value], regex: Option<&regex::Regex>) -> Result<Value> {
    if method == Method::Size {
        return size(target);
    }
    let s = match target {
        Value::String(s) => s.as_str(),
        Value::Null => return Ok(null_method(method)),
        other => {
            return Err(eval_err(&format!(
                "string method called on {}",
                type_name(other)
            )))
        }
    };
    match method {
        Method::StartsWith => Ok(Value::Bool(s.starts_with(str_arg(args)?))),
        Method::EndsWith => Ok(Value::Bool(s.ends_with(str_arg(args)?))),
        Method::Contains => Ok(Value::Bool(s.contains(str_arg(args)?))),
        Method::Matches => match regex {
            Some(re) => Ok(Value::Bool(re.is_match(s))),
            None => Err(eval_err("pattern not compiled")),
        },
        Method::LowerAscii => Ok(Value::String(s.to_ascii_lowercase())),
        Method::UpperAscii => Ok(Value::String(s.to_ascii_uppercase())),
        Method::Size => size(target),
    }
}

/// Predicates on a missing value are false; transforms stay missing.
fn null_method(method: Method) -> Value {
    match method {
        Method::LowerAscii | Method::UpperAscii => Value::Null,
        _ => Value::Bool(false),
    }
}

fn str_arg(args: &[Value]) -> Result<&str> {
    match args.first() {
        Some(Value::String(a)) => Ok(a.as_str()),
        Some(other) => Err(eval_err(&format!(
            "expected string argument, got {}",
            type_name(other)
        ))),
        None => Err(eval_err("missing argument")),
    }
}

fn size(v: &Value) -> Result<Value> {
    match v {
        Value::String(s) => Ok(Value::from(s.chars().count() as i64)),
        Value::Array(a) => Ok(Value::from(a.len() as i64)),
        Value::Object(m) => Ok(Value::from(m.len() as i64)),
        Value::Null => Ok(Value::from(0)),
        other => Err(eval_err(&format!("size() of {}", type_name(other)))),
    }
}

fn binary(op: BinOp, l: &Value, r: &Value) -> Result<Value> {
    match op {
        BinOp::Eq => Ok(Value::Bool(loose_eq(l, r))),
        BinOp::Ne => Ok(Value::Bool(!loose_eq(l, r))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ord = compare(l, r)?;
            Ok(Value::Bool(match op {
                BinOp::Lt => ord.is_lt(),
                BinOp::Le => ord.is_le(),
                BinOp::Gt => ord.is_gt(),
                _ => ord.is_ge(),
            }))
        }
        BinOp::In => match r {
            Value::Array(items) => Ok(Value::Bool(items.iter().any(|i| loose_eq(l, i)))),
            Value::Object(m) => match l {
                Value::String(k) => Ok(Value::Bool(m.contains_key(k))),
                other => Err(eval_err(&format!("map key must be a string, got {}", type_name(other)))),
            },
            Value::Null => Ok(Value::Bool(false)),
            other => Err(eval_err(&format!("`in` requires a list or map, got {}", type_name(other)))),
        },
        BinOp::Add => match (l, r) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
            (Value::Array(a), Value::Array(b)) => {
                let mut out = a.clone();
                out.extend(b.iter().cloned());
                Ok(Value::Array(out))
            }
            _ => arith(op, l, r),
        },
        BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => arith(op, l, r),
    }
}

fn arith(op: BinOp, l: &Value, r: &Value) -> Result<Value> {
    let (Value::Number(a), Value::Number(b)) = (l, r) else {
        return Err(eval_err(&format!(
            "arithmetic on {} and {}",
            type_name(l),
            type_name(r)
        )));
    };
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        let out = match op {
            BinOp::Add => x.checked_add(y),
            BinOp::Sub => x.checked_sub(y),
            BinOp::Mul => x.checked_mul(y),
            BinOp::Div => {
                if y == 0 {
                    return Err(eval_err("division by zero"));
                }
                x.checked_div(y)
            }
            BinOp::Rem => {
                if y == 0 {
                    return Err(eval_err("division by zero"));
                }
                x.checked_rem(y)
            }
            _ => None,
        };
        return out.map(Value::from).ok_or_else(|| eval_err("integer overflow"));
    }
    let x = a.as_f64().unwrap_or(0.0);
    let y = b.as_f64().unwrap_or(0.0);
    let out = match op {
        BinOp::Add => x + y,
        BinOp::Sub => x - y,
        BinOp::Mul => x * y,
        BinOp::Div => x / y,
        BinOp::Rem => x % y,
        _ => return Err(eval_err("unsupported operator")),
    };
    if out.is_finite() {
        Ok(Value::from(out))
    } else {
        Err(eval_err("non-finite result"))
    }
}

fn loose_eq(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => a.as_f64() == b.as_f64(),
        },
        _ => l == r,
    }
}

fn compare(l: &Value, r: &Value) -> Result<std::cmp::Ordering> {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
                return Ok(x.cmp(&y));
            }
            let x = a.as_f64().unwrap_or(0.0);
            let y = b.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).ok_or_else(|| eval_err("incomparable numbers"))
        }
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => Err(eval_err(&format!(
            "cannot compare {} with {}",
            type_name(l),
            type_name(r)
        ))),
    }
}

fn as_bool(v: &Value, op: &str) -> Result<bool> {
    match v {
        Value::Bool(b) => Ok(*b),
        other => Err(eval_err(&format!("`{op}` expects bool, got {}", type_name(other)))),
    }
}

pub(crate) fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "int",
        Value::Number(_) => "double",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

fn to_display(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn eval_err(msg: &str) -> EngineError {
    EngineError::Evaluation(msg.to_string())
}
