use std::path::PathBuf;

pub fn default_version() -> u32 {
    1
}

pub fn default_runs_dir() -> PathBuf {
    PathBuf::from("runs")
}

pub fn default_runtime_dir() -> PathBuf {
    PathBuf::from("frameworks")
}

pub fn default_hitl_file() -> PathBuf {
    PathBuf::from("config/hitl/expanded_spec.txt")
}

pub fn default_step_timeout_sec() -> u64 {
    600
}

pub fn default_grace_period_sec() -> u64 {
    10
}

pub fn default_max_attempts() -> u32 {
    3
}

pub fn default_backoff_base_ms() -> u64 {
    1000
}

pub fn default_backoff_multiplier() -> f64 {
    2.0
}

pub fn default_probe_interval_sec() -> u64 {
    5
}

pub fn default_min_runs() -> usize {
    5
}

pub fn default_max_runs() -> usize {
    50
}

pub fn default_half_width_fraction() -> f64 {
    0.10
}

pub fn default_bootstrap_samples() -> usize {
    10_000
}

pub fn default_confidence_level() -> f64 {
    0.95
}

pub fn default_tracked_metrics() -> Vec<String> {
    vec![
        "total_tokens_in".to_string(),
        "total_duration_seconds".to_string(),
        "aei".to_string(),
    ]
}

pub fn default_interval_minutes() -> i64 {
    60
}

pub fn default_stable_threshold() -> usize {
    3
}

pub fn default_data_unavailable_after_minutes() -> i64 {
    60
}

pub fn default_min_age_minutes() -> i64 {
    30
}

pub fn default_max_age_hours() -> i64 {
    168
}

pub fn default_usage_api_url() -> String {
    "https://api.openai.com/v1/organization/usage/completions".to_string()
}

pub fn default_reconcile_concurrency() -> usize {
    4
}

pub fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

pub fn default_usage_api_key_env() -> String {
    "OPENAI_API_KEY_USAGE_TRACKING".to_string()
}

pub fn default_clarification_pattern() -> String {
    r"\[NEEDS CLARIFICATION:?[^\]]*\]".to_string()
}

pub fn default_max_hitl_rounds() -> u32 {
    3
}

pub fn default_startup_timeout_sec() -> u64 {
    120
}

pub fn default_poll_interval_ms() -> u64 {
    2000
}

pub fn default_llm_api_url() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

pub fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

pub fn default_request_timeout_sec() -> u64 {
    300
}

pub fn default_true() -> bool {
    true
}

pub fn default_false() -> bool {
    false
}
