//! Condition evaluation for exclusive gateway routing.
//!
//! The engine treats expression evaluation as an extension point: the
//! executor only needs `evaluate(expression, variables) -> bool`. The
//! shipped [`SimpleConditionEvaluator`] covers the small guard language
//! typically found on sequence flows: `${...}` wrappers, `==`/`!=`
//! comparisons against variables and literals, bare-variable truthiness,
//! and `&&`/`||`/`!` combinators. Anything richer plugs in behind the
//! trait.

use anyhow::{bail, Result};
use std::collections::BTreeMap;

/// Evaluates sequence-flow guard expressions over instance variables.
pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, variables: &BTreeMap<String, String>) -> Result<bool>;
}

/// Strips an outer `${ ... }` (or `${{ ... }}`) wrapper and surrounding
/// whitespace.
pub fn normalize_expression(raw: &str) -> String {
    let trimmed = raw.trim();
    let inner = if let Some(stripped) = trimmed.strip_prefix("${") {
        stripped.strip_suffix('}').unwrap_or(stripped)
    } else {
        trimmed
    };
    // A doubled wrapper leaves one brace pair behind.
    let inner = inner.trim();
    let inner = inner.strip_prefix('{').unwrap_or(inner);
    let inner = inner.strip_suffix('}').unwrap_or(inner);
    inner.trim().to_string()
}

/// Default evaluator: equality/inequality over string-encoded variables.
#[derive(Debug, Default, Clone)]
pub struct SimpleConditionEvaluator;

impl ExpressionEvaluator for SimpleConditionEvaluator {
    fn evaluate(&self, expression: &str, variables: &BTreeMap<String, String>) -> Result<bool> {
        let normalized = normalize_expression(expression);
        if normalized.is_empty() {
            // An empty guard never restricts the flow.
            return Ok(true);
        }
        eval_or(&normalized, variables)
    }
}

fn eval_or(expression: &str, variables: &BTreeMap<String, String>) -> Result<bool> {
    if let Some(parts) = split_top_level(expression, "||") {
        for part in parts {
            if eval_and(part, variables)? {
                return Ok(true);
            }
        }
        return Ok(false);
    }
    eval_and(expression, variables)
}

fn eval_and(expression: &str, variables: &BTreeMap<String, String>) -> Result<bool> {
    if let Some(parts) = split_top_level(expression, "&&") {
        for part in parts {
            if !eval_unary(part, variables)? {
                return Ok(false);
            }
        }
        return Ok(true);
    }
    eval_unary(expression, variables)
}

fn eval_unary(expression: &str, variables: &BTreeMap<String, String>) -> Result<bool> {
    let mut negated = false;
    let mut rest = expression.trim();
    while let Some(stripped) = rest.strip_prefix('!') {
        // Leave `!=` to the comparison level.
        if stripped.starts_with('=') {
            break;
        }
        negated = !negated;
        rest = stripped.trim_start();
    }
    if rest.is_empty() {
        bail!("expression ends with a negation operator");
    }
    let value = eval_comparison(rest, variables)?;
    Ok(value != negated)
}

fn eval_comparison(expression: &str, variables: &BTreeMap<String, String>) -> Result<bool> {
    if let Some(pos) = find_top_level(expression, "!=") {
        let left = resolve_operand(expression[..pos].trim(), variables)?;
        let right = resolve_operand(expression[pos + 2..].trim(), variables)?;
        return Ok(left != right);
    }
    if let Some(pos) = find_top_level(expression, "==") {
        let left = resolve_operand(expression[..pos].trim(), variables)?;
        let right = resolve_operand(expression[pos + 2..].trim(), variables)?;
        return Ok(left == right);
    }
    // Bare operand: truthiness of its resolved value.
    let value = resolve_operand(expression.trim(), variables)?;
    Ok(is_truthy(&value))
}

/// Resolve an operand to its string value: quoted literals stay literal,
/// known variable names resolve to their value, everything else (numbers,
/// `true`/`false`, unknown names) is taken verbatim. An unknown bare name
/// resolving to itself would make `x == "x"` truthy, so unknown
/// identifiers resolve to the empty string instead.
fn resolve_operand(operand: &str, variables: &BTreeMap<String, String>) -> Result<String> {
    if operand.is_empty() {
        bail!("comparison is missing an operand");
    }
    if let Some(literal) = strip_quotes(operand)? {
        return Ok(literal);
    }
    if let Some(value) = variables.get(operand) {
        return Ok(value.clone());
    }
    if operand == "true" || operand == "false" || operand == "null" {
        return Ok(operand.to_string());
    }
    if operand
        .chars()
        .next()
        .map(|c| c.is_ascii_digit() || c == '-')
        .unwrap_or(false)
    {
        return Ok(operand.to_string());
    }
    if operand.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        // Identifier with no bound variable.
        return Ok(String::new());
    }
    bail!("unsupported operand: {operand}")
}

fn strip_quotes(operand: &str) -> Result<Option<String>> {
    for quote in ['\'', '"'] {
        if let Some(stripped) = operand.strip_prefix(quote) {
            match stripped.strip_suffix(quote) {
                Some(inner) => return Ok(Some(inner.to_string())),
                None => bail!("unterminated string literal: {operand}"),
            }
        }
    }
    Ok(None)
}

fn is_truthy(value: &str) -> bool {
    !value.is_empty() && value != "false" && value != "0" && value != "null"
}

fn split_top_level<'a>(expression: &'a str, operator: &str) -> Option<Vec<&'a str>> {
    let mut parts = Vec::new();
    let mut start = 0usize;
    while start < expression.len() {
        match find_top_level(&expression[start..], operator) {
            Some(rel) => {
                parts.push(expression[start..start + rel].trim());
                start += rel + operator.len();
            }
            None => {
                parts.push(expression[start..].trim());
                break;
            }
        }
    }
    if parts.len() > 1 {
        Some(parts)
    } else {
        None
    }
}

/// Find `operator` outside string literals. Quote state tracks both quote
/// styles so `'a && b'` never splits.
fn find_top_level(expression: &str, operator: &str) -> Option<usize> {
    let mut in_single = false;
    let mut in_double = false;
    for (index, character) in expression.char_indices() {
        match character {
            '\'' if !in_double => {
                in_single = !in_single;
                continue;
            }
            '"' if !in_single => {
                in_double = !in_double;
                continue;
            }
            _ => {}
        }
        if !in_single && !in_double && expression[index..].starts_with(operator) {
            return Some(index);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn eval(expr: &str, pairs: &[(&str, &str)]) -> bool {
        SimpleConditionEvaluator
            .evaluate(expr, &vars(pairs))
            .unwrap()
    }

    #[test]
    fn empty_condition_is_truthy() {
        assert!(eval("", &[]));
        assert!(eval("  ", &[]));
    }

    #[test]
    fn equality_against_variable() {
        assert!(eval("approved == true", &[("approved", "true")]));
        assert!(!eval("approved == true", &[("approved", "false")]));
        assert!(eval("${approved == true}", &[("approved", "true")]));
    }

    #[test]
    fn inequality() {
        assert!(eval("status != 'rejected'", &[("status", "open")]));
        assert!(!eval("status != 'open'", &[("status", "open")]));
    }

    #[test]
    fn quoted_literals() {
        assert!(eval(r#"reason == "travel""#, &[("reason", "travel")]));
        assert!(eval("reason == 'travel'", &[("reason", "travel")]));
    }

    #[test]
    fn numeric_comparison_is_string_equality() {
        assert!(eval("days == 5", &[("days", "5")]));
        assert!(!eval("days == 5", &[("days", "6")]));
    }

    #[test]
    fn bare_variable_truthiness() {
        assert!(eval("approved", &[("approved", "true")]));
        assert!(!eval("approved", &[("approved", "false")]));
        assert!(!eval("approved", &[]));
        assert!(!eval("approved", &[("approved", "0")]));
    }

    #[test]
    fn negation() {
        assert!(eval("!approved", &[("approved", "false")]));
        assert!(!eval("!approved", &[("approved", "yes")]));
    }

    #[test]
    fn conjunction_and_disjunction() {
        let bindings = [("a", "true"), ("b", "false")];
        assert!(eval("a || b", &bindings));
        assert!(!eval("a && b", &bindings));
        assert!(eval("a && !b", &bindings));
    }

    #[test]
    fn operators_inside_quotes_do_not_split() {
        assert!(eval("note == 'x && y'", &[("note", "x && y")]));
    }

    #[test]
    fn unknown_identifier_is_falsy_not_self_quoting() {
        assert!(!eval("ghost == 'ghost'", &[]));
    }

    #[test]
    fn unterminated_literal_errors() {
        let result = SimpleConditionEvaluator.evaluate("x == 'oops", &vars(&[("x", "oops")]));
        assert!(result.is_err());
    }
}
