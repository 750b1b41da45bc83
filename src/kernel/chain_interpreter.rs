//! Chain interpreter (C6, spec.md §4.6): linear step execution with
//! `{{var}}` substitution, JSONPath variable extraction, and a small
//! condition grammar gating each step against the previous response.

use std::collections::HashMap;
use std::time::Duration;

use regex::Regex;
use tracing::warn;

use crate::common::error::{AppError, Result};
use crate::domains::chains::model::{ChainStep, StepCondition};
use crate::kernel::probes::http;

/// Interpreter-wide state threaded through all steps (spec.md §4.6
/// "context").
#[derive(Debug, Clone, Default)]
pub struct ChainContext {
    pub variables: HashMap<String, String>,
    pub previous_status_code: Option<u16>,
    pub previous_body: Option<String>,
    pub success_count: u32,
    pub failure_count: u32,
    pub skipped_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone)]
pub struct StepResult {
    pub outcome: StepOutcome,
    pub response_code: Option<i32>,
    pub response_body: Option<String>,
    pub error: Option<String>,
    pub condition_matched: Option<bool>,
    pub attempt: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainFinalStatus {
    Success,
    Failed,
    Partial,
}

pub struct ChainRunOutcome {
    pub context: ChainContext,
    pub step_results: Vec<(ChainStep, StepResult)>,
    pub final_status: ChainFinalStatus,
    pub stopped_early: Option<String>,
}

/// Substitute every `{{var}}` occurrence in `template`. A reference to a
/// variable not present in the context fails the whole substitution
/// (spec.md §4.6 step 2).
pub fn substitute(template: &str, vars: &HashMap<String, String>) -> Result<String> {
    let re = Regex::new(r"\{\{\s*([a-zA-Z_][a-zA-Z0-9_]*)\s*\}\}").unwrap();
    let mut missing: Option<String> = None;
    let rendered = re.replace_all(template, |caps: &regex::Captures| {
        let name = &caps[1];
        match vars.get(name) {
            Some(value) => value.clone(),
            None => {
                if missing.is_none() {
                    missing = Some(name.to_string());
                }
                String::new()
            }
        }
    });
    if let Some(name) = missing {
        return Err(AppError::VariableSubstitution(format!("missing variable '{name}'")));
    }
    Ok(rendered.into_owned())
}

/// Extracts `{var_name: jsonpath}` entries from a response body. Missing
/// values are simply omitted (spec.md §4.6 step 4), not an error.
pub fn extract_variables(body: &str, extract: &HashMap<String, String>) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let parsed: serde_json::Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(_) => return out,
    };
    for (name, path) in extract {
        if let Ok(matches) = jsonpath_lib::select(&parsed, path) {
            if let Some(first) = matches.first() {
                out.insert(name.clone(), json_value_to_string(first));
            }
        }
    }
    out
}

fn json_value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Evaluates a step's `condition` against the previous step's response
/// (spec.md §4.6 "Condition grammar"). `None` condition is always true.
pub fn evaluate_condition(
    condition: Option<&StepCondition>,
    previous_status_code: Option<u16>,
    previous_body: Option<&str>,
) -> bool {
    let condition = match condition {
        Some(c) => c,
        None => return true,
    };

    match condition.operator.as_str() {
        "status_code_equals" => status_matches(condition, previous_status_code, |code, value| code == value),
        "status_code_in" => status_in(condition, previous_status_code, true),
        "status_code_not_in" => status_in(condition, previous_status_code, false),
        "equals" | "not_equals" | "contains" | "not_contains" | "regex" => {
            evaluate_body_condition(condition, previous_body)
        }
        "exists" | "not_exists" => evaluate_existence_condition(condition, previous_body),
        other => {
            warn!(operator = other, "unknown condition operator, treating as false");
            false
        }
    }
}

fn status_matches(condition: &StepCondition, status: Option<u16>, cmp: impl Fn(i64, i64) -> bool) -> bool {
    let status = match status {
        Some(s) => s as i64,
        None => return false,
    };
    match &condition.value {
        Some(serde_json::Value::Number(n)) => n.as_i64().map(|v| cmp(status, v)).unwrap_or(false),
        _ => false,
    }
}

fn status_in(condition: &StepCondition, status: Option<u16>, want_member: bool) -> bool {
    let status = match status {
        Some(s) => s as i64,
        None => return !want_member,
    };
    let list: Vec<i64> = match &condition.value {
        Some(serde_json::Value::Array(values)) => values.iter().filter_map(|v| v.as_i64()).collect(),
        _ => Vec::new(),
    };
    let is_member = list.contains(&status);
    if want_member {
        is_member
    } else {
        !is_member
    }
}

fn field_string(body: Option<&str>, field: Option<&str>) -> Option<String> {
    let body = body?;
    let field = field?;
    let parsed: serde_json::Value = serde_json::from_str(body).ok()?;
    let matches = jsonpath_lib::select(&parsed, field).ok()?;
    matches.first().map(|v| json_value_to_string(v))
}

fn evaluate_body_condition(condition: &StepCondition, body: Option<&str>) -> bool {
    let is_negative = matches!(condition.operator.as_str(), "not_equals" | "not_contains");
    let field_value = field_string(body, condition.field.as_deref());

    let expected = condition
        .value
        .as_ref()
        .map(|v| json_value_to_string(v))
        .unwrap_or_default();

    match condition.operator.as_str() {
        "equals" => field_value.as_deref() == Some(expected.as_str()),
        "not_equals" => match field_value {
            Some(v) => v != expected,
            None => true,
        },
        "contains" => field_value.map(|v| v.contains(&expected)).unwrap_or(false),
        "not_contains" => match field_value {
            Some(v) => !v.contains(&expected),
            None => true,
        },
        "regex" => match (field_value, Regex::new(&expected)) {
            (Some(v), Ok(re)) => re.is_match(&v),
            _ => false,
        },
        _ => !is_negative,
    }
}

fn evaluate_existence_condition(condition: &StepCondition, body: Option<&str>) -> bool {
    let exists = field_string(body, condition.field.as_deref()).is_some();
    match condition.operator.as_str() {
        "exists" => exists,
        "not_exists" => !exists,
        _ => false,
    }
}

/// Runs every enabled step in order, driving the HTTP probe with per-step
/// retry, updating the context, and deciding whether to continue past a
/// failed step (spec.md §4.6 steps 1-6).
pub async fn run_chain(
    client: &reqwest::Client,
    steps: &[ChainStep],
    stop_on_failure: bool,
    max_response_bytes: usize,
) -> ChainRunOutcome {
    let mut context = ChainContext::default();
    let mut step_results = Vec::new();
    let mut stopped_early = None;

    for (index, step) in steps.iter().filter(|s| s.is_enabled).enumerate() {
        let step_number = index + 1;

        if !evaluate_condition(
            step.condition().as_ref(),
            context.previous_status_code,
            context.previous_body.as_deref(),
        ) {
            context.skipped_count += 1;
            step_results.push((
                step.clone(),
                StepResult {
                    outcome: StepOutcome::Skipped,
                    response_code: None,
                    response_body: None,
                    error: None,
                    condition_matched: Some(false),
                    attempt: 0,
                },
            ));
            continue;
        }

        let result = run_step_with_retry(client, step, &mut context, max_response_bytes).await;

        let failed = matches!(result.outcome, StepOutcome::Failed);
        if failed {
            context.previous_status_code = result.response_code.map(|c| c as u16);
            context.previous_body = result.response_body.clone();
            context.failure_count += 1;
        } else {
            context.previous_status_code = result.response_code.map(|c| c as u16);
            context.previous_body = result.response_body.clone();
            context.success_count += 1;
            if let Some(body) = &result.response_body {
                let extracted = extract_variables(body, &step.extract_variables_map());
                context.variables.extend(extracted);
            }
        }

        step_results.push((step.clone(), result));

        if failed && !(step.continue_on_failure || !stop_on_failure) {
            stopped_early = Some(format!("Chain stopped at step {step_number}: {}", step.name));
            break;
        }
    }

    let final_status = if context.failure_count == 0 && context.skipped_count == 0 && context.success_count > 0 {
        ChainFinalStatus::Success
    } else if context.success_count == 0 {
        ChainFinalStatus::Failed
    } else {
        ChainFinalStatus::Partial
    };

    ChainRunOutcome {
        context,
        step_results,
        final_status,
        stopped_early,
    }
}

async fn run_step_with_retry(
    client: &reqwest::Client,
    step: &ChainStep,
    context: &mut ChainContext,
    max_response_bytes: usize,
) -> StepResult {
    let mut attempt = 0;
    loop {
        let substituted = substitute_step(step, &context.variables);
        let (url, headers, body) = match substituted {
            Ok(v) => v,
            Err(e) => {
                return StepResult {
                    outcome: StepOutcome::Failed,
                    response_code: None,
                    response_body: None,
                    error: Some(e.to_string()),
                    condition_matched: None,
                    attempt,
                }
            }
        };

        let probe_result = http::run(
            client,
            &url,
            step.method,
            &headers,
            body.as_deref(),
            Duration::from_secs(step.timeout_seconds as u64),
            max_response_bytes,
            None,
        )
        .await;

        if probe_result.success || attempt >= step.retry_count {
            return StepResult {
                outcome: if probe_result.success {
                    StepOutcome::Success
                } else {
                    StepOutcome::Failed
                },
                response_code: probe_result.status_code.map(|c| c as i32),
                response_body: probe_result.response_body,
                error: probe_result.error,
                condition_matched: None,
                attempt,
            };
        }

        attempt += 1;
        let delay = Duration::from_secs(step.retry_delay_seconds as u64 * attempt as u64);
        tokio::time::sleep(delay).await;
    }
}

fn substitute_step(
    step: &ChainStep,
    vars: &HashMap<String, String>,
) -> Result<(String, HashMap<String, String>, Option<String>)> {
    let url = substitute(&step.url, vars)?;
    let mut headers = HashMap::new();
    for (k, v) in step.headers_map() {
        headers.insert(k, substitute(&v, vars)?);
    }
    let body = match &step.body {
        Some(b) => Some(substitute(b, vars)?),
        None => None,
    };
    Ok((url, headers, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitute_fills_known_variable() {
        let mut vars = HashMap::new();
        vars.insert("token".to_string(), "abc123".to_string());
        let rendered = substitute("Bearer {{token}}", &vars).unwrap();
        assert_eq!(rendered, "Bearer abc123");
    }

    #[test]
    fn substitute_fails_on_missing_variable() {
        let vars = HashMap::new();
        let err = substitute("Bearer {{token}}", &vars).unwrap_err();
        assert!(matches!(err, AppError::VariableSubstitution(_)));
    }

    #[test]
    fn extract_variables_reads_jsonpath_and_skips_missing() {
        let body = r#"{"access_token": "xyz", "nested": {"id": 42}}"#;
        let mut extract = HashMap::new();
        extract.insert("token".to_string(), "$.access_token".to_string());
        extract.insert("id".to_string(), "$.nested.id".to_string());
        extract.insert("missing".to_string(), "$.does_not_exist".to_string());

        let vars = extract_variables(body, &extract);
        assert_eq!(vars.get("token"), Some(&"xyz".to_string()));
        assert_eq!(vars.get("id"), Some(&"42".to_string()));
        assert!(!vars.contains_key("missing"));
    }

    #[test]
    fn status_code_equals_condition() {
        let condition = StepCondition {
            operator: "status_code_equals".to_string(),
            field: None,
            value: Some(serde_json::json!(200)),
        };
        assert!(evaluate_condition(Some(&condition), Some(200), None));
        assert!(!evaluate_condition(Some(&condition), Some(404), None));
    }

    #[test]
    fn status_code_not_in_treats_missing_status_as_pass() {
        let condition = StepCondition {
            operator: "status_code_not_in".to_string(),
            field: None,
            value: Some(serde_json::json!([500, 502])),
        };
        assert!(evaluate_condition(Some(&condition), None, None));
    }

    #[test]
    fn equals_condition_reads_jsonpath_field() {
        let body = r#"{"status": "ok"}"#;
        let condition = StepCondition {
            operator: "equals".to_string(),
            field: Some("$.status".to_string()),
            value: Some(serde_json::json!("ok")),
        };
        assert!(evaluate_condition(Some(&condition), None, Some(body)));
    }

    #[test]
    fn not_contains_is_true_when_field_missing() {
        let condition = StepCondition {
            operator: "not_contains".to_string(),
            field: Some("$.missing".to_string()),
            value: Some(serde_json::json!("x")),
        };
        assert!(evaluate_condition(Some(&condition), None, Some("{}")));
    }

    #[test]
    fn none_condition_is_always_true() {
        assert!(evaluate_condition(None, None, None));
    }
}
