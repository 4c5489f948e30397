use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Execution status of a single step instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Result of a finished step execution. Immutable once set unless the
/// step is explicitly retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
}

impl StepResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: HashMap::new(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: HashMap::new(),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }
}

/// A conditional branch attached to a step. When the carrying step
/// completes, the first branch whose condition matches the data bag
/// (or the default branch) replaces the remainder of the step list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepBranch {
    /// Condition evaluated against the data bag
    /// (`key == "v"`, `key != "v"`, `key contains "v"`).
    #[serde(default)]
    pub condition: Option<String>,
    /// Taken when no conditional branch matches.
    #[serde(default)]
    pub is_default: bool,
    pub steps: Vec<Step>,
}

impl StepBranch {
    pub fn when(condition: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            condition: Some(condition.into()),
            is_default: false,
            steps,
        }
    }

    pub fn default_branch(steps: Vec<Step>) -> Self {
        Self {
            condition: None,
            is_default: true,
            steps,
        }
    }
}

/// One unit of work in a flow: declarative definition plus mutable
/// per-instance execution state, interpreted by the generic scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Step name, unique within the flow.
    pub name: String,
    /// Names of steps that must have succeeded before this one runs.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Data bag keys that must exist before this step runs, mapped to
    /// the step expected to produce them.
    #[serde(default)]
    pub data_dependencies: HashMap<String, String>,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Per-attempt timeout; the engine default applies when absent.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// A failing critical step fails the flow immediately, no retries.
    #[serde(default)]
    pub critical: bool,
    /// Safe to re-run after a crash without duplicating side effects.
    #[serde(default)]
    pub idempotent: bool,
    /// May execute concurrently with adjacent parallel-capable steps.
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub branches: Option<Vec<StepBranch>>,

    // Instance state
    #[serde(default = "default_step_status")]
    pub status: StepStatus,
    #[serde(default)]
    pub result: Option<StepResult>,
    #[serde(default)]
    pub attempts: u32,
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_step_status() -> StepStatus {
    StepStatus::Pending
}

impl Step {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            data_dependencies: HashMap::new(),
            max_retries: 0,
            retry_delay_ms: default_retry_delay_ms(),
            timeout_secs: None,
            critical: false,
            idempotent: false,
            parallel: false,
            branches: None,
            status: StepStatus::Pending,
            result: None,
            attempts: 0,
        }
    }

    pub fn depends_on(mut self, step: impl Into<String>) -> Self {
        self.depends_on.push(step.into());
        self
    }

    pub fn data_dependency(
        mut self,
        key: impl Into<String>,
        producer: impl Into<String>,
    ) -> Self {
        self.data_dependencies.insert(key.into(), producer.into());
        self
    }

    pub fn retries(mut self, max_retries: u32, delay_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_delay_ms = delay_ms;
        self
    }

    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    pub fn branches(mut self, branches: Vec<StepBranch>) -> Self {
        self.branches = Some(branches);
        self
    }

    pub fn succeeded(&self) -> bool {
        self.status == StepStatus::Completed
            && self.result.as_ref().is_some_and(|r| r.success)
    }

    /// True when every step dependency has succeeded and every data
    /// dependency key is present in the data bag.
    pub fn is_eligible(
        &self,
        steps: &[Step],
        data: &HashMap<String, serde_json::Value>,
    ) -> bool {
        let deps_ok = self.depends_on.iter().all(|dep| {
            steps
                .iter()
                .find(|s| s.name == *dep)
                .is_some_and(|s| s.succeeded())
        });
        let data_ok = self
            .data_dependencies
            .keys()
            .all(|key| data.contains_key(key));
        deps_ok && data_ok
    }

    /// Reset instance state for an explicit retry.
    pub fn reset_for_retry(&mut self) {
        self.status = StepStatus::Pending;
        self.result = None;
        self.attempts = 0;
    }
}

/// Evaluate a simple conditional expression against the data bag.
///
/// Supported expressions:
/// - `key == "value"` — exact match
/// - `key != "value"` — not equal
/// - `key contains "substr"` — substring match
///
/// Returns `false` for unparseable expressions.
pub fn evaluate_condition(
    expr: &str,
    data: &HashMap<String, serde_json::Value>,
) -> bool {
    let expr = expr.trim();

    // key contains "value"
    if let Some((key, substr)) = parse_operator(expr, "contains") {
        return data
            .get(key)
            .and_then(|v| v.as_str())
            .is_some_and(|s| s.contains(substr));
    }

    // key != "value"
    if let Some((key, value)) = parse_operator(expr, "!=") {
        return data
            .get(key)
            .and_then(|v| v.as_str())
            .is_some_and(|s| s != value);
    }

    // key == "value"
    if let Some((key, value)) = parse_operator(expr, "==") {
        return data
            .get(key)
            .and_then(|v| v.as_str())
            .is_some_and(|s| s == value);
    }

    false
}

/// Parse `key OP "value"` expressions, returning (key, value).
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let parts: Vec<&str> = expr.splitn(2, op).collect();
    if parts.len() != 2 {
        return None;
    }
    let key = parts[0].trim();
    let val = parts[1].trim().trim_matches('"');
    Some((key, val))
}

/// Pick the branch to follow: first condition that holds in
/// declaration order, otherwise the default branch.
pub fn select_branch<'a>(
    branches: &'a [StepBranch],
    data: &HashMap<String, serde_json::Value>,
) -> Option<&'a StepBranch> {
    for branch in branches {
        if let Some(expr) = &branch.condition {
            if evaluate_condition(expr, data) {
                return Some(branch);
            }
        }
    }
    branches.iter().find(|b| b.is_default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_builders() {
        let step = Step::new("place-orders")
            .depends_on("allocate-assets")
            .data_dependency("allocations_ready", "allocate-assets")
            .retries(3, 100)
            .timeout(30)
            .parallel();

        assert_eq!(step.name, "place-orders");
        assert_eq!(step.depends_on, vec!["allocate-assets"]);
        assert_eq!(step.max_retries, 3);
        assert_eq!(step.timeout_secs, Some(30));
        assert!(step.parallel);
        assert!(!step.critical);
        assert_eq!(step.status, StepStatus::Pending);
    }

    #[test]
    fn test_eligibility_requires_dep_success() {
        let mut first = Step::new("a");
        let second = Step::new("b").depends_on("a");
        let data = HashMap::new();

        let steps = vec![first.clone(), second.clone()];
        assert!(!steps[1].is_eligible(&steps, &data));

        first.status = StepStatus::Completed;
        first.result = Some(StepResult::ok("done"));
        let steps = vec![first, second];
        assert!(steps[1].is_eligible(&steps, &data));
    }

    #[test]
    fn test_eligibility_requires_data_keys() {
        let step = Step::new("b").data_dependency("charge_verified", "a");
        let steps = vec![step.clone()];

        let mut data = HashMap::new();
        assert!(!step.is_eligible(&steps, &data));

        data.insert("charge_verified".into(), serde_json::json!(true));
        assert!(step.is_eligible(&steps, &data));
    }

    #[test]
    fn test_condition_equals() {
        let mut data = HashMap::new();
        data.insert("currency".into(), serde_json::json!("USD"));

        assert!(evaluate_condition(r#"currency == "USD""#, &data));
        assert!(!evaluate_condition(r#"currency == "EUR""#, &data));
    }

    #[test]
    fn test_condition_not_equals() {
        let mut data = HashMap::new();
        data.insert("currency".into(), serde_json::json!("USD"));

        assert!(evaluate_condition(r#"currency != "EUR""#, &data));
        assert!(!evaluate_condition(r#"currency != "USD""#, &data));
    }

    #[test]
    fn test_condition_contains() {
        let mut data = HashMap::new();
        data.insert("memo".into(), serde_json::json!("fast settlement requested"));

        assert!(evaluate_condition(r#"memo contains "settlement""#, &data));
        assert!(!evaluate_condition(r#"memo contains "refund""#, &data));
    }

    #[test]
    fn test_condition_missing_key_or_garbage() {
        let data = HashMap::new();
        assert!(!evaluate_condition(r#"missing == "value""#, &data));
        assert!(!evaluate_condition("this is not valid", &data));
    }

    #[test]
    fn test_select_branch_first_match_wins() {
        let mut data = HashMap::new();
        data.insert("currency".into(), serde_json::json!("USD"));

        let branches = vec![
            StepBranch::when(r#"currency == "EUR""#, vec![Step::new("convert-eur")]),
            StepBranch::when(r#"currency == "USD""#, vec![Step::new("settle-usd")]),
            StepBranch::default_branch(vec![Step::new("manual-review")]),
        ];

        let chosen = select_branch(&branches, &data).unwrap();
        assert_eq!(chosen.steps[0].name, "settle-usd");
    }

    #[test]
    fn test_select_branch_falls_back_to_default() {
        let mut data = HashMap::new();
        data.insert("currency".into(), serde_json::json!("GBP"));

        let branches = vec![
            StepBranch::when(r#"currency == "EUR""#, vec![Step::new("convert-eur")]),
            StepBranch::default_branch(vec![Step::new("manual-review")]),
        ];

        let chosen = select_branch(&branches, &data).unwrap();
        assert!(chosen.is_default);
        assert_eq!(chosen.steps[0].name, "manual-review");
    }

    #[test]
    fn test_serialization_roundtrip() {
        let step = Step::new("reconcile")
            .depends_on("settle-orders")
            .retries(2, 250)
            .idempotent();
        let json = serde_json::to_string(&step).unwrap();
        let parsed: Step = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.name, "reconcile");
        assert!(parsed.idempotent);
        assert_eq!(parsed.max_retries, 2);
    }
}
