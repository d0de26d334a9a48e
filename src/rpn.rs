//! C5: the small stack-based expression language used by the `rpn`
//! function (spec.md §4.5).

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::model::Value;

static NUMBER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[+-]?([0-9]+\.?|[0-9]*\.[0-9]+)$").unwrap());

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Quoted(String),
    Raw(String),
}

/// Tokenise program text left to right: whitespace is discarded, quoted
/// strings (with `\x` escapes, unterminated quotes accepted) are read as a
/// unit, and everything else is a whitespace-delimited word.
fn tokenize(program: &str) -> Vec<Token> {
    let chars: Vec<char> = program.chars().collect();
    let mut i = 0;
    let mut tokens = Vec::new();

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '\'' || c == '"' {
            let quote = c;
            i += 1;
            let mut s = String::new();
            while i < chars.len() {
                let c = chars[i];
                if c == '\\' {
                    if i + 1 < chars.len() {
                        s.push(chars[i + 1]);
                        i += 2;
                    } else {
                        // Dangling escape at end of input: drop it, body ends here.
                        i += 1;
                        break;
                    }
                } else if c == quote {
                    i += 1;
                    break;
                } else {
                    s.push(c);
                    i += 1;
                }
            }
            tokens.push(Token::Quoted(s));
        } else {
            let start = i;
            while i < chars.len() && !chars[i].is_whitespace() {
                i += 1;
            }
            tokens.push(Token::Raw(chars[start..i].iter().collect()));
        }
    }
    tokens
}

/// Everything an RPN program can read besides its own stack: the row being
/// built, the per-host variables fetched from `vars.*`, and the host name.
pub struct RpnContext<'a> {
    pub row: &'a std::collections::BTreeMap<String, Value>,
    pub hostvars: &'a std::collections::BTreeMap<String, Value>,
    pub host: &'a str,
}

fn bool_value(b: bool) -> Value {
    Value::Number(if b { 1.0 } else { 0.0 })
}

fn pop_or_undefined(stack: &mut Vec<Value>) -> Value {
    stack.pop().unwrap_or(Value::Undefined)
}

fn binary_numeric(stack: &mut Vec<Value>, f: impl Fn(f64, f64) -> Option<f64>) {
    let b = pop_or_undefined(stack);
    let a = pop_or_undefined(stack);
    let result = match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => f(a, b).map(Value::Number).unwrap_or(Value::Undefined),
        _ => Value::Undefined,
    };
    stack.push(result);
}

fn compare(stack: &mut Vec<Value>, f: impl Fn(f64, f64) -> bool) {
    let b = pop_or_undefined(stack);
    let a = pop_or_undefined(stack);
    let result = match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => bool_value(f(a, b)),
        _ => bool_value(false),
    };
    stack.push(result);
}

/// Evaluate `program` against an initial stack of `[current_value]`,
/// returning the new top of stack. Unknown tokens are warned about once
/// per distinct name per call and otherwise skipped; numeric and string
/// errors (divide by zero, `ln(0)`, …) yield `Value::Undefined` rather than
/// aborting evaluation.
pub fn evaluate(program: &str, current_value: Value, ctx: &RpnContext<'_>) -> Value {
    let mut stack: Vec<Value> = vec![current_value];
    let mut warned: HashSet<String> = HashSet::new();

    for token in tokenize(program) {
        match token {
            Token::Quoted(s) => stack.push(Value::Text(s)),
            Token::Raw(word) => apply_word(&word, &mut stack, ctx, &mut warned),
        }
    }

    pop_or_undefined(&mut stack)
}

fn apply_word(
    word: &str,
    stack: &mut Vec<Value>,
    ctx: &RpnContext<'_>,
    warned: &mut HashSet<String>,
) {
    if NUMBER_RE.is_match(word) {
        if let Ok(n) = word.parse::<f64>() {
            stack.push(Value::Number(n));
            return;
        }
    }
    if let Some(name) = word.strip_prefix('$') {
        stack.push(ctx.row.get(name).cloned().unwrap_or(Value::Undefined));
        return;
    }
    if let Some(name) = word.strip_prefix('#') {
        stack.push(ctx.hostvars.get(name).cloned().unwrap_or(Value::Undefined));
        return;
    }
    if word == "@" {
        stack.push(Value::Text(ctx.host.to_string()));
        return;
    }

    match word {
        "+" => binary_numeric(stack, |a, b| Some(a + b)),
        "-" => binary_numeric(stack, |a, b| Some(a - b)),
        "*" => binary_numeric(stack, |a, b| Some(a * b)),
        "/" => binary_numeric(stack, |a, b| if b == 0.0 { None } else { Some(a / b) }),
        "%" => binary_numeric(stack, |a, b| if b == 0.0 { None } else { Some(a % b) }),
        "ln" => {
            let a = pop_or_undefined(stack);
            let result = match a.as_f64() {
                Some(n) if n > 0.0 => Value::Number(n.ln()),
                _ => Value::Undefined,
            };
            stack.push(result);
        }
        "log10" => {
            let a = pop_or_undefined(stack);
            let result = match a.as_f64() {
                Some(n) if n > 0.0 => Value::Number(n.log10()),
                _ => Value::Undefined,
            };
            stack.push(result);
        }
        "exp" => {
            let a = pop_or_undefined(stack);
            let result = a.as_f64().map(|n| Value::Number(n.exp())).unwrap_or(Value::Undefined);
            stack.push(result);
        }
        "pow" => binary_numeric(stack, |a, b| Some(a.powf(b))),
        "_" => stack.push(Value::Undefined),
        "defined?" => {
            let a = pop_or_undefined(stack);
            stack.push(bool_value(a.is_defined()));
        }
        "==" => {
            let b = pop_or_undefined(stack);
            let a = pop_or_undefined(stack);
            let result = match (a.is_defined(), b.is_defined()) {
                (false, false) => true,
                (false, _) | (_, false) => false,
                _ => values_equal(&a, &b),
            };
            stack.push(bool_value(result));
        }
        "!=" => {
            let b = pop_or_undefined(stack);
            let a = pop_or_undefined(stack);
            let result = match (a.is_defined(), b.is_defined()) {
                (false, false) => false,
                (false, _) | (_, false) => true,
                _ => !values_equal(&a, &b),
            };
            stack.push(bool_value(result));
        }
        "<" => compare(stack, |a, b| a < b),
        "<=" => compare(stack, |a, b| a <= b),
        ">" => compare(stack, |a, b| a > b),
        ">=" => compare(stack, |a, b| a >= b),
        "and" => {
            let b = pop_or_undefined(stack);
            let a = pop_or_undefined(stack);
            stack.push(bool_value(a.is_truthy() && b.is_truthy()));
        }
        "or" => {
            let b = pop_or_undefined(stack);
            let a = pop_or_undefined(stack);
            stack.push(bool_value(a.is_truthy() || b.is_truthy()));
        }
        "not" => {
            let a = pop_or_undefined(stack);
            stack.push(bool_value(!a.is_truthy()));
        }
        "ifelse" => {
            let b = pop_or_undefined(stack);
            let a = pop_or_undefined(stack);
            let pred = pop_or_undefined(stack);
            stack.push(if pred.is_truthy() { a } else { b });
        }
        "match" => {
            let pattern = pop_or_undefined(stack);
            let subject = pop_or_undefined(stack);
            let result = match (subject.as_str_lossy(), pattern.as_str_lossy()) {
                (Some(s), Some(p)) => match Regex::new(&p) {
                    Ok(re) => re
                        .captures(&s)
                        .and_then(|c| c.get(1))
                        .map(|m| Value::Text(m.as_str().to_string()))
                        .unwrap_or(Value::Undefined),
                    Err(_) => Value::Undefined,
                },
                _ => Value::Undefined,
            };
            stack.push(result);
        }
        "replace" => {
            let replacement = pop_or_undefined(stack);
            let pattern = pop_or_undefined(stack);
            let subject = pop_or_undefined(stack);
            let result = match (
                subject.as_str_lossy(),
                pattern.as_str_lossy(),
                replacement.as_str_lossy(),
            ) {
                (Some(s), Some(p), Some(r)) => match Regex::new(&p) {
                    Ok(re) => Value::Text(re.replace_all(&s, r.as_str()).into_owned()),
                    Err(_) => Value::Undefined,
                },
                _ => Value::Undefined,
            };
            stack.push(result);
        }
        "concat" => {
            let b = pop_or_undefined(stack);
            let a = pop_or_undefined(stack);
            let a_str = a.as_str_lossy().unwrap_or_default();
            let b_str = b.as_str_lossy().unwrap_or_default();
            stack.push(Value::Text(format!("{}{}", a_str, b_str)));
        }
        "pop" => {
            stack.pop();
        }
        "exch" => {
            let len = stack.len();
            if len >= 2 {
                stack.swap(len - 1, len - 2);
            }
        }
        "dup" => {
            if let Some(top) = stack.last().cloned() {
                stack.push(top);
            }
        }
        "index" => {
            let n = pop_or_undefined(stack);
            match n.as_f64() {
                Some(n) if n >= 1.0 => {
                    let n = n as usize;
                    let len = stack.len();
                    let result = if n <= len {
                        stack[len - n].clone()
                    } else {
                        Value::Undefined
                    };
                    stack.push(result);
                }
                _ => stack.push(Value::Undefined),
            }
        }
        _ => {
            if warned.insert(word.to_string()) {
                warn!(token = word, "rpn: unknown token");
            }
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => a.as_str_lossy() == b.as_str_lossy(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn ctx<'a>(
        row: &'a BTreeMap<String, Value>,
        hostvars: &'a BTreeMap<String, Value>,
    ) -> RpnContext<'a> {
        RpnContext {
            row,
            hostvars,
            host: "h1",
        }
    }

    #[test]
    fn rate_conversion_scenario() {
        let row = BTreeMap::new();
        let hostvars = BTreeMap::new();
        let c = ctx(&row, &hostvars);
        let result = evaluate(
            "8 * 1000000000 / 100 *",
            Value::Number(125000.0),
            &c,
        );
        assert_eq!(result, Value::Number(0.1));
    }

    #[test]
    fn divide_by_zero_is_undefined() {
        let row = BTreeMap::new();
        let hostvars = BTreeMap::new();
        let c = ctx(&row, &hostvars);
        let result = evaluate("0 /", Value::Number(5.0), &c);
        assert_eq!(result, Value::Undefined);

        let defined = evaluate("0 / defined?", Value::Number(5.0), &c);
        assert_eq!(defined, Value::Number(0.0));
    }

    #[test]
    fn ifelse_picks_else_branch_on_undefined_pred() {
        let row = BTreeMap::new();
        let hostvars = BTreeMap::new();
        let c = ctx(&row, &hostvars);
        // stack starts as [5]; "0 /" -> undefined; "defined?" -> 0; "'a' 'b' ifelse"
        let result = evaluate("0 / defined? 'a' 'b' ifelse", Value::Number(5.0), &c);
        assert_eq!(result, Value::Text("b".to_string()));
    }

    #[test]
    fn pop_on_empty_stack_is_a_no_op() {
        let row = BTreeMap::new();
        let hostvars = BTreeMap::new();
        let c = ctx(&row, &hostvars);
        let result = evaluate("pop pop", Value::Number(1.0), &c);
        assert_eq!(result, Value::Undefined);
    }

    #[test]
    fn dollar_lookup_reads_row_field() {
        let mut row = BTreeMap::new();
        row.insert("speed".to_string(), Value::Number(1000.0));
        let hostvars = BTreeMap::new();
        let c = ctx(&row, &hostvars);
        let result = evaluate("$speed 2 *", Value::Undefined, &c);
        assert_eq!(result, Value::Number(2000.0));
    }

    #[test]
    fn hash_lookup_reads_hostvar_and_at_reads_host() {
        let row = BTreeMap::new();
        let mut hostvars = BTreeMap::new();
        hostvars.insert("site".to_string(), Value::Text("dc1".to_string()));
        let c = ctx(&row, &hostvars);
        let result = evaluate("pop #site @ concat", Value::Undefined, &c);
        assert_eq!(result, Value::Text("dc1h1".to_string()));
    }

    #[test]
    fn unknown_token_is_skipped() {
        let row = BTreeMap::new();
        let hostvars = BTreeMap::new();
        let c = ctx(&row, &hostvars);
        let result = evaluate("bogus_fn 1 +", Value::Number(1.0), &c);
        assert_eq!(result, Value::Number(2.0));
    }

    #[test]
    fn unterminated_quote_takes_rest_of_program_as_body() {
        let row = BTreeMap::new();
        let hostvars = BTreeMap::new();
        let c = ctx(&row, &hostvars);
        let result = evaluate("pop 'abc", Value::Undefined, &c);
        assert_eq!(result, Value::Text("abc".to_string()));
    }

    #[test]
    fn index_duplicates_nth_from_top() {
        let row = BTreeMap::new();
        let hostvars = BTreeMap::new();
        let c = ctx(&row, &hostvars);
        // stack: [10]; "dup" -> [10, 10]; "20" -> [10,10,20]; "2 index" -> copy of
        // stack[-2] (counting from the top of the remaining stack after popping n).
        let result = evaluate("dup 20 2 index", Value::Number(10.0), &c);
        assert_eq!(result, Value::Number(10.0));
    }
}
