use anyhow::{Context, Result};
use minijinja::{Environment, Value};

/// Renders configuration text through the template preprocessor.
///
/// Two functions are available inside `{{ ... }}` blocks:
/// - `env("NAME")` yields the variable's value, or undefined when unset;
/// - `default(fallback, value)` yields `fallback` when `value` is undefined,
///   none or an empty string.
///
/// Text without template directives renders unchanged.
pub fn render_text_template(text: &str) -> Result<String> {
    let mut env = Environment::new();
    env.set_keep_trailing_newline(true);
    env.add_function("env", env_var);
    env.add_function("default", default_value);

    env.render_str(text, ())
        .context("Failed to render config template")
}

fn env_var(name: String) -> Value {
    std::env::var(name)
        .map(Value::from)
        .unwrap_or(Value::UNDEFINED)
}

fn default_value(fallback: Value, value: Option<Value>) -> Value {
    match value {
        Some(v) if !is_blank(&v) => v,
        _ => fallback,
    }
}

fn is_blank(v: &Value) -> bool {
    v.is_undefined() || v.is_none() || v.as_str().is_some_and(str::is_empty)
}
