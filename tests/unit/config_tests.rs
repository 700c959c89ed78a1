//! Unit tests for configuration parsing and validation.

use std::io::Write;

use docflow::config::GlobalConfig;
use docflow::models::phase::Phase;
use docflow::models::task::Priority;
use docflow::AppError;

const SAMPLE: &str = r#"
db_path = "data/docflow.db"
retention_days = 14
max_retries = 3
default_agent_concurrency = 2
audit_log_dir = "logs/audit"

[agents.research]
max_concurrency = 4

[agents.drafting]
max_concurrency = 1

[phases.intake]
[[phases.intake.tasks]]
id = "collect_facts"
capability = "intake"

[phases.research]
requires_approval = true

[[phases.research.tasks]]
id = "case_law"
capability = "research"
priority = "high"
input = { topic = "precedent" }

[[phases.research.tasks]]
id = "memo"
capability = "drafting"
depends_on = ["case_law"]
requires_approval = true
max_retries = 0
"#;

#[test]
fn parses_full_sample() {
    let config = GlobalConfig::from_toml_str(SAMPLE).expect("valid config");

    assert_eq!(
        config.db_path.as_deref(),
        Some(std::path::Path::new("data/docflow.db"))
    );
    assert_eq!(config.retention_days, 14);
    assert_eq!(config.max_retries, 3);
    assert_eq!(config.default_agent_concurrency, 2);

    let research = config.phase(Phase::Research).expect("research phase");
    assert!(research.requires_approval);
    assert_eq!(research.tasks.len(), 2);
    assert_eq!(research.tasks[0].priority, Priority::High);
    assert_eq!(research.tasks[1].depends_on, vec!["case_law"]);
    assert_eq!(research.tasks[1].max_retries, Some(0));
    assert!(research.tasks[1].requires_approval);
}

#[test]
fn empty_document_uses_defaults() {
    let config = GlobalConfig::from_toml_str("").expect("empty config is valid");
    assert_eq!(config, GlobalConfig::default());
    assert!(config.db_path.is_none());
    assert_eq!(config.retention_days, 30);
    assert_eq!(config.max_retries, 2);
    assert_eq!(config.default_agent_concurrency, 1);
}

#[test]
fn approval_lookup_defaults_to_false() {
    let config = GlobalConfig::from_toml_str(SAMPLE).expect("valid config");
    assert!(config.requires_approval(Phase::Research));
    assert!(!config.requires_approval(Phase::Intake));
    assert!(!config.requires_approval(Phase::Drafting));
}

#[test]
fn concurrency_falls_back_to_default() {
    let config = GlobalConfig::from_toml_str(SAMPLE).expect("valid config");
    assert_eq!(config.concurrency_for("research"), 4);
    assert_eq!(config.concurrency_for("drafting"), 1);
    assert_eq!(config.concurrency_for("editing"), 2);
}

#[test]
fn unknown_phase_name_is_rejected() {
    let err = GlobalConfig::from_toml_str("[phases.brainstorm]\nrequires_approval = true\n")
        .expect_err("unknown phase");
    assert!(matches!(err, AppError::Config(_)));
    assert!(err.to_string().contains("brainstorm"));
}

#[test]
fn zero_concurrency_is_rejected() {
    let err = GlobalConfig::from_toml_str("[agents.research]\nmax_concurrency = 0\n")
        .expect_err("zero concurrency");
    assert!(err.to_string().contains("agents.research.max_concurrency"));

    let err = GlobalConfig::from_toml_str("default_agent_concurrency = 0\n")
        .expect_err("zero default concurrency");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn duplicate_task_ids_across_phases_are_rejected() {
    let raw = r#"
[[phases.intake.tasks]]
id = "same"
capability = "intake"

[[phases.outline.tasks]]
id = "same"
capability = "outline"
"#;
    let err = GlobalConfig::from_toml_str(raw).expect_err("duplicate id");
    assert_eq!(err.to_string(), "config: duplicate task id: same");
}

#[test]
fn dependency_outside_phase_is_rejected() {
    let raw = r#"
[[phases.intake.tasks]]
id = "facts"
capability = "intake"

[[phases.outline.tasks]]
id = "toc"
capability = "outline"
depends_on = ["facts"]
"#;
    let err = GlobalConfig::from_toml_str(raw).expect_err("cross-phase edge");
    assert!(err.to_string().contains("not planned in phase outline"));
}

#[test]
fn malformed_toml_is_a_config_error() {
    let err = GlobalConfig::from_toml_str("retention_days = \"soon\"").expect_err("bad type");
    assert!(err.to_string().starts_with("config: invalid config:"));
}

#[test]
fn loads_from_file() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(SAMPLE.as_bytes()).expect("write config");

    let config = GlobalConfig::load_from_path(file.path()).expect("load");
    assert_eq!(config.retention_days, 14);
}

#[test]
fn missing_file_is_a_config_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = GlobalConfig::load_from_path(dir.path().join("absent.toml")).expect_err("missing");
    assert!(matches!(err, AppError::Config(_)));
}
