use rf_core::{Exchange, Expression, Result, RouteflowError};

/// Evaluate an expression to a string key. Integer values are stringified;
/// anything else (or a missing value) is a processing exception for this
/// exchange.
pub(crate) fn eval_key(
    expression: &Expression,
    exchange: &Exchange,
    what: &str,
) -> Result<String> {
    let value = expression(exchange)?.ok_or_else(|| {
        RouteflowError::permanent(format!("{what} evaluated to no value"))
    })?;
    if let Some(s) = value.get::<String>() {
        return Ok(s);
    }
    if let Some(n) = value.get::<i64>() {
        return Ok(n.to_string());
    }
    Err(RouteflowError::permanent(format!(
        "{what} must evaluate to a String or i64, got {}",
        value.type_name()
    )))
}
