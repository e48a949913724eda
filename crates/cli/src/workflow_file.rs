//! Loading task graphs and run parameters from disk.

use std::path::Path;

use anyhow::{bail, Context, Result};
use engine::{RunParameters, Task};

/// Read a JSON task definition graph.
pub fn load_task(path: &Path) -> Result<Task> {
    let content = std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid task graph in {}", path.display()))
}

/// Combine an optional JSON parameters file with `KEY=VALUE` overrides.
///
/// `KEY=VALUE` is run-wide; `TASK:KEY=VALUE` applies to one task.
/// Command-line values win over the file.
pub fn load_parameters(path: Option<&Path>, overrides: &[String]) -> Result<RunParameters> {
    let mut parameters = match path {
        Some(path) => {
            let content =
                std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
            serde_json::from_str(&content).with_context(|| format!("invalid parameters in {}", path.display()))?
        }
        None => RunParameters::default(),
    };

    for entry in overrides {
        let Some((target, value)) = entry.split_once('=') else {
            bail!("parameter '{entry}' is not of the form KEY=VALUE");
        };
        match target.split_once(':') {
            Some((task, key)) => {
                parameters
                    .per_task
                    .entry(task.into())
                    .or_default()
                    .insert(key.to_string(), value.to_string());
            }
            None => {
                parameters.run_wide.insert(target.to_string(), value.to_string());
            }
        }
    }

    Ok(parameters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::TaskId;

    #[test]
    fn overrides_split_into_run_wide_and_per_task() {
        let params = load_parameters(None, &["env=prod".into(), "deploy:region=eu".into()]).unwrap();
        assert_eq!(params.run_wide["env"], "prod");
        assert_eq!(params.per_task[&TaskId::from("deploy")]["region"], "eu");
    }

    #[test]
    fn malformed_override_is_rejected() {
        assert!(load_parameters(None, &["nonsense".into()]).is_err());
    }
}
