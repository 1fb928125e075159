//! Workflow Parser
//!
//! Handles loading and saving workflow definitions as YAML. Loaded
//! workflows are validated and topologically ordered before they are
//! returned.

use std::fs;

use log::{debug, info};

use super::error::WorkflowError;
use super::model::WorkflowSpec;
use super::validator::validate_workflow;

/// Loads a workflow from a YAML file.
///
/// This function:
/// 1. Reads and parses the YAML file
/// 2. Validates the workflow structure
/// 3. Orders steps by phase and dependency
///
/// # Example
///
/// ```rust,no_run
/// use dbflow::workflow::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workflow = load_workflow("migration.yaml")?;
///     println!("Loaded {} steps", workflow.steps.len());
///     Ok(())
/// }
/// ```
pub fn load_workflow(path: &str) -> Result<WorkflowSpec, WorkflowError> {
    info!("Loading workflow from: {}", path);

    let yaml_content = fs::read_to_string(path).map_err(|e| WorkflowError::Load {
        path: path.to_string(),
        message: format!(
            "{}. Check that the file exists and is readable.",
            e
        ),
    })?;

    debug!("YAML content loaded ({} bytes)", yaml_content.len());

    let mut workflow = parse_workflow(&yaml_content).map_err(|e| match e {
        WorkflowError::Load { message, .. } => WorkflowError::Load {
            path: path.to_string(),
            message,
        },
        other => other,
    })?;

    if workflow.name.is_empty() {
        workflow.name = std::path::Path::new(path)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("workflow")
            .to_string();
    }

    Ok(workflow)
}

/// Parses and validates a workflow from YAML text.
pub fn parse_workflow(yaml: &str) -> Result<WorkflowSpec, WorkflowError> {
    let mut workflow: WorkflowSpec = serde_yaml::from_str(yaml).map_err(|e| WorkflowError::Load {
        path: "<inline>".to_string(),
        message: format!("Failed to parse workflow YAML: {}. Check the file format.", e),
    })?;

    info!(
        "Parsed workflow '{}' with {} steps",
        workflow.name,
        workflow.steps.len()
    );

    validate_workflow(&mut workflow)?;
    Ok(workflow)
}

/// Saves a workflow to a YAML file.
pub fn save_workflow(workflow: &WorkflowSpec, path: &str) -> Result<(), WorkflowError> {
    let to_load_error = |message: String| WorkflowError::Load {
        path: path.to_string(),
        message,
    };

    let yaml_content = serde_yaml::to_string(workflow).map_err(|e| to_load_error(e.to_string()))?;
    fs::write(path, yaml_content).map_err(|e| to_load_error(e.to_string()))?;
    info!("Workflow saved to: {}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety::OperationCategory;
    use crate::workflow::model::{AgentKind, Phase};
    use std::io::Write;
    use tempfile::NamedTempFile;

    const MIGRATION: &str = r#"
name: add_flags
description: Add a flags column to users
steps:
  - id: migrate
    phase: REFINEMENT
    agent: command_execution
    depends_on: [design]
    params:
      command: echo migrate
    operation:
      category: DATABASE_DDL
      statement: ALTER TABLE users ADD COLUMN flags int
    retry:
      max_attempts: 3
      backoff_ms: 100
  - id: requirements
    phase: SPECIFICATION
    agent: research
    params:
      result: { table: users }
    outputs: table
  - id: design
    phase: ARCHITECTURE
    agent: analysis
    depends_on: requirements
    optional: true
"#;

    #[test]
    fn test_parse_orders_steps() {
        let workflow = parse_workflow(MIGRATION).unwrap();

        let order: Vec<_> = workflow.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(order, vec!["requirements", "design", "migrate"]);
        assert_eq!(workflow.name, "add_flags");

        let migrate = workflow.get_step("migrate").unwrap();
        assert_eq!(migrate.phase, Phase::Refinement);
        assert_eq!(migrate.agent, AgentKind::CommandExecution);
        assert_eq!(migrate.retry.max_attempts, 3);
        assert_eq!(
            migrate.operation.as_ref().unwrap().category,
            OperationCategory::DatabaseDdl
        );
        assert!(workflow.get_step("design").unwrap().optional);
        assert_eq!(workflow.get_step("requirements").unwrap().outputs, vec!["table"]);
    }

    #[test]
    fn test_load_from_file_defaults_name() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            "steps:\n  - id: only\n    phase: COMPLETION\n    agent: analysis\n"
        )
        .unwrap();

        let workflow = load_workflow(file.path().to_str().unwrap()).unwrap();
        assert_eq!(workflow.len(), 1);
        assert!(!workflow.name.is_empty());
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_workflow("/nonexistent/workflow.yaml").unwrap_err();
        assert!(matches!(err, WorkflowError::Load { ref path, .. } if path == "/nonexistent/workflow.yaml"));
    }

    #[test]
    fn test_parse_rejects_unknown_agent() {
        let yaml = "steps:\n  - id: a\n    phase: SPECIFICATION\n    agent: astrology\n";
        assert!(matches!(parse_workflow(yaml), Err(WorkflowError::Load { .. })));
    }

    #[test]
    fn test_parse_reports_validation_errors() {
        let yaml = r#"
steps:
  - id: a
    phase: SPECIFICATION
    agent: research
    depends_on: b
  - id: b
    phase: SPECIFICATION
    agent: research
    depends_on: a
"#;
        let err = parse_workflow(yaml).unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));
        assert!(err.to_string().contains("cyclic"));
    }

    #[test]
    fn test_save_and_reload() {
        let workflow = parse_workflow(MIGRATION).unwrap();
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();

        save_workflow(&workflow, path).unwrap();
        let reloaded = load_workflow(path).unwrap();
        assert_eq!(reloaded, workflow);
    }
}
