//! Template rendering: one fixed syntax, pure render.
//!
//! Effectful interpolations (`{{ref:..}}`, `{{script:..}}`) are resolved in
//! a pre-pass by the reference resolver; by the time a template reaches this
//! module it contains only plain variables.

use crate::error::Result;
use serde_json::{Map, Value};

/// Render a template against a flat variable map. Autoescape is off; prompt
/// text is not HTML.
pub fn render(template: &str, vars: &Map<String, Value>) -> Result<String> {
    let mut context = tera::Context::new();
    for (key, value) in vars {
        context.insert(key, value);
    }
    let rendered = tera::Tera::one_off(template, &context, false)?;
    Ok(rendered)
}

/// Build the variable map for one chain step.
///
/// Step args appear both as top-level variables and under `input`, so the
/// first step can use `{{input}}` and later steps `{{previous_step_result}}`.
pub fn step_vars(
    args: &Map<String, Value>,
    previous_step_result: &str,
    step_results: &std::collections::BTreeMap<usize, String>,
) -> Map<String, Value> {
    let mut vars = Map::new();
    for (key, value) in args {
        vars.insert(key.clone(), value.clone());
    }
    vars.insert("input".to_string(), Value::Object(args.clone()));
    vars.insert(
        "previous_step_result".to_string(),
        Value::String(previous_step_result.to_string()),
    );

    let mut results = Map::new();
    for (step, result) in step_results {
        results.insert(format!("step_{}", step), Value::String(result.clone()));
    }
    vars.insert("step_results".to_string(), Value::Object(results));
    vars
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_plain_variables() {
        let mut vars = Map::new();
        vars.insert("topic".to_string(), json!("rust lifetimes"));
        let out = render("Summarize {{ topic }} briefly.", &vars).unwrap();
        assert_eq!(out, "Summarize rust lifetimes briefly.");
    }

    #[test]
    fn template_without_variables_is_unchanged() {
        let vars = Map::new();
        let out = render("No placeholders here.", &vars).unwrap();
        assert_eq!(out, "No placeholders here.");
    }

    #[test]
    fn step_vars_expose_input_and_previous_result() {
        let mut args = Map::new();
        args.insert("query".to_string(), json!("find bugs"));
        let mut results = std::collections::BTreeMap::new();
        results.insert(1, "step one output".to_string());

        let vars = step_vars(&args, "step one output", &results);
        let out = render(
            "Prev: {{ previous_step_result }} / Query: {{ query }}",
            &vars,
        )
        .unwrap();
        assert_eq!(out, "Prev: step one output / Query: find bugs");
    }

    #[test]
    fn unknown_variable_is_an_error() {
        let vars = Map::new();
        assert!(render("{{ missing }}", &vars).is_err());
    }
}
