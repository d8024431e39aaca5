// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Boolean mini-language for descriptor `allow_if` expressions.
//!
//! Supports `&&`, `||`, `!`, parentheses, a small set of builtin calls,
//! comparisons over `resource.*` / `request.*` fields, and bare time-window
//! literals. Anything unrecognized evaluates to false.

use chrono::{Datelike, NaiveDateTime, Timelike, Weekday};
use serde_json::Value;

use crate::policy::Policy;

/// Evaluation context for one request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user: String,
    pub permissions: Vec<String>,
    pub roles: Vec<String>,
    /// Resource fields referenced as `resource.<field>`.
    pub resource: serde_json::Map<String, Value>,
    /// Request metadata referenced as `request.<field>`.
    pub request: serde_json::Map<String, Value>,
    /// Local wall time, used by the time-window primitives.
    pub now: NaiveDateTime,
}

impl AuthContext {
    pub fn new(user: impl Into<String>, now: NaiveDateTime) -> Self {
        Self {
            user: user.into(),
            permissions: Vec::new(),
            roles: Vec::new(),
            resource: serde_json::Map::new(),
            request: serde_json::Map::new(),
            now,
        }
    }
}

/// Evaluate an `allow_if` expression. Empty means no restriction.
pub fn evaluate(expr: &str, ctx: &AuthContext, policy: &Policy) -> bool {
    if expr.trim().is_empty() {
        return true;
    }
    split_outside_groups(expr, "||")
        .into_iter()
        .any(|part| evaluate_and(part.trim(), ctx, policy))
}

fn evaluate_and(expr: &str, ctx: &AuthContext, policy: &Policy) -> bool {
    split_outside_groups(expr, "&&")
        .into_iter()
        .all(|part| evaluate_term(part.trim(), ctx, policy))
}

/// Split on `op` only at paren depth zero and outside quoted strings, so
/// grouped subexpressions and call arguments stay intact.
fn split_outside_groups<'a>(expr: &'a str, op: &str) -> Vec<&'a str> {
    let bytes = expr.as_bytes();
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == q {
                    quote = None;
                }
            }
            None => match b {
                b'"' | b'\'' => quote = Some(b),
                b'(' => depth += 1,
                b')' => depth = depth.saturating_sub(1),
                _ => {
                    if depth == 0 && expr[i..].starts_with(op) {
                        parts.push(&expr[start..i]);
                        i += op.len();
                        start = i;
                        continue;
                    }
                }
            },
        }
        i += 1;
    }
    parts.push(&expr[start..]);
    parts
}

fn evaluate_term(term: &str, ctx: &AuthContext, policy: &Policy) -> bool {
    let term = term.trim();

    if let Some(rest) = term.strip_prefix('!') {
        return !evaluate_term(rest.trim(), ctx, policy);
    }
    if let Some(inner) = term.strip_prefix('(').and_then(|t| t.strip_suffix(')')) {
        return evaluate(inner, ctx, policy);
    }
    if term.contains('(') && term.ends_with(')') {
        return evaluate_call(term, ctx, policy);
    }
    if let Some((left, op, right)) = split_comparison(term) {
        return compare(
            &resolve_value(left, ctx),
            &resolve_value(right, ctx),
            op,
        );
    }
    if let Some((start, end)) = parse_time_range(term) {
        return time_between(ctx.now, start, end);
    }
    if let Some(day) = parse_weekday(term) {
        return ctx.now.weekday() == day;
    }

    truthy(&resolve_value(term, ctx))
}

fn evaluate_call(call: &str, ctx: &AuthContext, policy: &Policy) -> bool {
    let Some(open) = call.find('(') else {
        return false;
    };
    let name = call[..open].trim();
    let args_str = call[open + 1..call.len() - 1].trim();
    let args: Vec<&str> = if args_str.is_empty() {
        Vec::new()
    } else {
        args_str
            .split(',')
            .map(|a| a.trim().trim_matches(|c| c == '"' || c == '\''))
            .collect()
    };

    match name {
        "has_permission" => {
            args.len() == 1
                && (ctx.permissions.iter().any(|p| p == args[0] || p == "*")
                    || policy.can(&ctx.user, args[0]))
        }
        "has_role" => args.len() == 1 && ctx.roles.iter().any(|r| r == args[0]),
        "is_owner" => match args.as_slice() {
            [] => ["owner", "owner_id", "user_id", "created_by"]
                .iter()
                .any(|f| ctx.resource.get(*f).and_then(Value::as_str) == Some(ctx.user.as_str())),
            [field] => ctx.resource.get(*field).and_then(Value::as_str) == Some(ctx.user.as_str()),
            _ => false,
        },
        "time_between" => match args.as_slice() {
            [start, end] => match (parse_hm(start), parse_hm(end)) {
                (Some(s), Some(e)) => time_between(ctx.now, s, e),
                _ => false,
            },
            _ => false,
        },
        "day_of_week" => args.iter().any(|d| parse_weekday(d) == Some(ctx.now.weekday())),
        "hour_between" => match args.as_slice() {
            [start, end] => match (start.parse::<u32>(), end.parse::<u32>()) {
                (Ok(s), Ok(e)) => hour_between(ctx.now.hour(), s, e),
                _ => false,
            },
            _ => false,
        },
        // unknown calls fail closed
        _ => false,
    }
}

fn split_comparison(term: &str) -> Option<(&str, &str, &str)> {
    for op in [">=", "<=", "==", "!=", ">", "<"] {
        if let Some(idx) = term.find(op) {
            let left = term[..idx].trim();
            let right = term[idx + op.len()..].trim();
            return Some((left, op, right));
        }
    }
    None
}

fn resolve_value(expr: &str, ctx: &AuthContext) -> Value {
    let expr = expr.trim();

    if expr.len() >= 2 {
        for quote in ['"', '\''] {
            if expr.starts_with(quote) && expr.ends_with(quote) {
                return Value::String(expr[1..expr.len() - 1].to_string());
            }
        }
    }
    if let Ok(n) = expr.parse::<f64>()
        && let Some(num) = serde_json::Number::from_f64(n)
    {
        return Value::Number(num);
    }
    match expr {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "user_id" => return Value::String(ctx.user.clone()),
        "now" => return Value::String(ctx.now.to_string()),
        _ => {}
    }
    if let Some(field) = expr.strip_prefix("resource.") {
        return ctx.resource.get(field).cloned().unwrap_or(Value::Null);
    }
    if let Some(field) = expr.strip_prefix("request.") {
        return ctx.request.get(field).cloned().unwrap_or(Value::Null);
    }
    Value::String(expr.to_string())
}

fn compare(left: &Value, right: &Value, op: &str) -> bool {
    if let (Some(l), Some(r)) = (as_f64(left), as_f64(right)) {
        return match op {
            "==" => l == r,
            "!=" => l != r,
            ">" => l > r,
            ">=" => l >= r,
            "<" => l < r,
            "<=" => l <= r,
            _ => false,
        };
    }
    let l = string_repr(left);
    let r = string_repr(right);
    match op {
        "==" => l == r,
        "!=" => l != r,
        ">" => l > r,
        ">=" => l >= r,
        "<" => l < r,
        "<=" => l <= r,
        _ => false,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn string_repr(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty() && s != "false",
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::Null => false,
        _ => true,
    }
}

fn parse_hm(s: &str) -> Option<(u32, u32)> {
    let (h, m) = s.split_once(':')?;
    let hour: u32 = h.parse().ok()?;
    let minute: u32 = m.parse().ok()?;
    if hour < 24 && m.len() == 2 && minute < 60 {
        Some((hour, minute))
    } else {
        None
    }
}

/// "HH:MM-HH:MM" literal.
fn parse_time_range(term: &str) -> Option<((u32, u32), (u32, u32))> {
    let (start, end) = term.split_once('-')?;
    Some((parse_hm(start)?, parse_hm(end)?))
}

fn time_between(now: NaiveDateTime, start: (u32, u32), end: (u32, u32)) -> bool {
    let cur = (now.hour(), now.minute());
    if start < end {
        cur > start && cur < end
    } else {
        // spans midnight
        cur > start || cur < end
    }
}

fn hour_between(cur: u32, start: u32, end: u32) -> bool {
    if start <= end {
        cur >= start && cur < end
    } else {
        cur >= start || cur < end
    }
}

/// Full day name or three-letter prefix, case-insensitive.
fn parse_weekday(s: &str) -> Option<Weekday> {
    let lower = s.to_ascii_lowercase();
    let days = [
        ("monday", Weekday::Mon),
        ("tuesday", Weekday::Tue),
        ("wednesday", Weekday::Wed),
        ("thursday", Weekday::Thu),
        ("friday", Weekday::Fri),
        ("saturday", Weekday::Sat),
        ("sunday", Weekday::Sun),
    ];
    for (name, day) in days {
        if lower == name || lower == name[..3] {
            return Some(day);
        }
    }
    None
}
