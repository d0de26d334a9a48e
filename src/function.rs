//! C4: built-in scalar functions and the per-value function-chain dispatch
//! (spec.md §4.4).

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{error, warn};

use crate::config::FctnDef;
use crate::error::PipelineError;
use crate::model::Value;
use crate::rpn::{self, RpnContext};

/// Everything a function needs besides the current value and its operand:
/// the row being built (for peer-value lookups, though the built-ins here
/// don't use them directly — `rpn` does), the host's `vars.*` map, and the
/// host name.
pub struct FunctionContext<'a> {
    pub row: &'a BTreeMap<String, Value>,
    pub hostvars: &'a BTreeMap<String, Value>,
    pub host: &'a str,
    pub val_id: &'a str,
}

/// Apply one `<fctn>` to `value`. Returns `Err` only for an unknown
/// function name — the caller logs it once per `(val_id, host)` and aborts
/// the chain for that row, per spec.md §4.4/§7.
pub fn apply(
    value: Value,
    fctn: &FctnDef,
    ctx: &FunctionContext<'_>,
) -> Result<Value, PipelineError> {
    let operand = || fctn.value.as_deref();

    match fctn.name.as_str() {
        "sum" | "max" | "min" => Ok(value),
        "+" => Ok(arith(&value, operand(), |a, b| Some(a + b))),
        "-" => Ok(arith(&value, operand(), |a, b| Some(a - b))),
        "*" => Ok(arith(&value, operand(), |a, b| Some(a * b))),
        "/" => Ok(arith(&value, operand(), |a, b| {
            if b == 0.0 {
                None
            } else {
                Some(a / b)
            }
        })),
        "%" => Ok(arith(&value, operand(), |a, b| {
            if b == 0.0 {
                None
            } else {
                Some(a % b)
            }
        })),
        "ln" => Ok(match value.as_f64() {
            Some(n) if n > 0.0 => Value::Number(n.ln()),
            _ => Value::Undefined,
        }),
        "log10" => Ok(match value.as_f64() {
            Some(n) if n > 0.0 => Value::Number(n.log10()),
            _ => Value::Undefined,
        }),
        "regexp" => Ok(apply_regexp(&value, operand())),
        "replace" => Ok(apply_replace(&value, operand(), fctn.with.as_deref())),
        "rpn" => {
            let program = operand().unwrap_or_default();
            let rpn_ctx = RpnContext {
                row: ctx.row,
                hostvars: ctx.hostvars,
                host: ctx.host,
            };
            Ok(rpn::evaluate(program, value, &rpn_ctx))
        }
        other => Err(PipelineError::UnknownFunction {
            val_id: ctx.val_id.to_string(),
            host: ctx.host.to_string(),
            name: other.to_string(),
        }),
    }
}

fn arith(value: &Value, operand: Option<&str>, f: impl Fn(f64, f64) -> Option<f64>) -> Value {
    let operand_n = operand.and_then(|s| s.trim().parse::<f64>().ok());
    match (value.as_f64(), operand_n) {
        (Some(a), Some(b)) => f(a, b).map(Value::Number).unwrap_or(Value::Undefined),
        _ => Value::Undefined,
    }
}

/// On match, yield capture group 1; on no match (or no group 1), pass the
/// value through unchanged (spec.md §8 "applying `regexp` whose pattern
/// lacks capture groups leaves the value untouched").
fn apply_regexp(value: &Value, pattern: Option<&str>) -> Value {
    let (Some(s), Some(pattern)) = (value.as_str_lossy(), pattern) else {
        return Value::Undefined;
    };
    match Regex::new(pattern) {
        Ok(re) => match re.captures(&s).and_then(|c| c.get(1)) {
            Some(m) => Value::Text(m.as_str().to_string()),
            None => value.clone(),
        },
        Err(e) => {
            warn!(pattern, error = %e, "regexp: invalid pattern");
            value.clone()
        }
    }
}

fn apply_replace(value: &Value, pattern: Option<&str>, with: Option<&str>) -> Value {
    let (Some(s), Some(pattern), Some(with)) = (value.as_str_lossy(), pattern, with) else {
        return Value::Undefined;
    };
    match Regex::new(pattern) {
        Ok(re) => Value::Text(re.replace_all(&s, with).into_owned()),
        Err(e) => {
            warn!(pattern, error = %e, "replace: invalid pattern");
            value.clone()
        }
    }
}

static VAL_WARNED: Lazy<std::sync::Mutex<std::collections::HashSet<(String, String)>>> =
    Lazy::new(|| std::sync::Mutex::new(std::collections::HashSet::new()));

/// Apply a val's function chain (in document order) to one row's current
/// value for that val. Logs unknown functions once per `(val_id, host)`
/// and stops the chain for this row on the first one, per spec.md §4.4.
pub fn apply_chain(mut value: Value, fctns: &[FctnDef], ctx: &FunctionContext<'_>) -> Value {
    for fctn in fctns {
        match apply(value.clone(), fctn, ctx) {
            Ok(next) => value = next,
            Err(e) => {
                let key = (ctx.val_id.to_string(), ctx.host.to_string());
                if VAL_WARNED.lock().unwrap().insert(key) {
                    error!(val_id = ctx.val_id, host = ctx.host, %e, "unknown function in chain");
                }
                return Value::Undefined;
            }
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(
        row: &'a BTreeMap<String, Value>,
        hostvars: &'a BTreeMap<String, Value>,
    ) -> FunctionContext<'a> {
        FunctionContext {
            row,
            hostvars,
            host: "h1",
            val_id: "v",
        }
    }

    fn fctn(name: &str, value: Option<&str>) -> FctnDef {
        FctnDef {
            name: name.to_string(),
            value: value.map(|s| s.to_string()),
            with: None,
        }
    }

    #[test]
    fn arithmetic_uses_operand_as_second_argument() {
        let row = BTreeMap::new();
        let hv = BTreeMap::new();
        let c = ctx(&row, &hv);
        let result = apply(Value::Number(10.0), &fctn("+", Some("5")), &c).unwrap();
        assert_eq!(result, Value::Number(15.0));
    }

    #[test]
    fn ln_of_zero_is_undefined() {
        let row = BTreeMap::new();
        let hv = BTreeMap::new();
        let c = ctx(&row, &hv);
        let result = apply(Value::Number(0.0), &fctn("ln", None), &c).unwrap();
        assert_eq!(result, Value::Undefined);
    }

    #[test]
    fn regexp_without_capture_group_passes_through() {
        let row = BTreeMap::new();
        let hv = BTreeMap::new();
        let c = ctx(&row, &hv);
        let result = apply(
            Value::from_str("eth0"),
            &fctn("regexp", Some("^eth")),
            &c,
        )
        .unwrap();
        assert_eq!(result, Value::from_str("eth0"));
    }

    #[test]
    fn replace_no_match_is_a_no_op() {
        let row = BTreeMap::new();
        let hv = BTreeMap::new();
        let c = ctx(&row, &hv);
        let mut f = fctn("replace", Some("xyz"));
        f.with = Some("q".to_string());
        let result = apply(Value::from_str("eth0"), &f, &c).unwrap();
        assert_eq!(result, Value::from_str("eth0"));
    }

    #[test]
    fn unknown_function_is_an_error() {
        let row = BTreeMap::new();
        let hv = BTreeMap::new();
        let c = ctx(&row, &hv);
        assert!(apply(Value::Number(1.0), &fctn("frobnicate", None), &c).is_err());
    }

    #[test]
    fn chain_stops_at_unknown_function() {
        let row = BTreeMap::new();
        let hv = BTreeMap::new();
        let c = ctx(&row, &hv);
        let fctns = vec![fctn("+", Some("1")), fctn("bogus", None), fctn("+", Some("1"))];
        let result = apply_chain(Value::Number(1.0), &fctns, &c);
        assert_eq!(result, Value::Undefined);
    }
}
