//! `gode run` command implementation

use crate::CliError;
use colored::Colorize;
use gode_kernel::{HostConfig, RunOutcome};
use gode_runtime::ScriptEngineHost;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Execute the `gode run` command
pub fn run(config: HostConfig, entry: &Path, timeout_ms: Option<u64>) -> Result<(), CliError> {
    let mut host = ScriptEngineHost::new(config)?;
    host.on_output(|line| println!("{}", line));

    debug!("Running {}", entry.display());
    let value = host.eval_file(entry)?;
    let outcome = match timeout_ms {
        Some(ms) => host.run_for(Duration::from_millis(ms)),
        None => {
            host.run_until_idle();
            RunOutcome::Idle
        }
    };

    if !value.is_null() {
        println!("{} {}", "→".green(), value.to_json());
    }
    for (id, reason) in host.unhandled_rejections() {
        eprintln!("{} unhandled rejection {}: {}", "!".yellow(), id, reason.to_json());
    }

    let report = host.dispose();
    debug!("Disposed {} plugins after {:?}", report.disposed.len(), outcome);
    for failure in &report.failures {
        eprintln!("{} {}", "✗".red(), failure);
    }

    match (outcome, timeout_ms) {
        (RunOutcome::TimedOut, Some(ms)) => Err(CliError::Timeout(ms)),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> HostConfig {
        HostConfig {
            base_dir: Some(dir.path().to_path_buf()),
            ..HostConfig::default()
        }
    }

    #[test]
    fn test_runs_entry_to_completion() {
        let dir = TempDir::new().unwrap();
        let entry = dir.path().join("main.rhai");
        fs::write(
            &entry,
            r#"import "gode:timers" as t; t::set_timeout(5, || print("done")); 42"#,
        )
        .unwrap();

        run(config_in(&dir), &entry, None).unwrap();
    }

    #[test]
    fn test_timeout_is_an_error() {
        let dir = TempDir::new().unwrap();
        let entry = dir.path().join("slow.rhai");
        fs::write(
            &entry,
            r#"import "gode:timers" as t; t::set_timeout(2000, || print("late"));"#,
        )
        .unwrap();

        let err = run(config_in(&dir), &entry, Some(10)).unwrap_err();
        assert!(matches!(err, CliError::Timeout(10)));
    }

    #[test]
    fn test_script_errors_carry_context() {
        let dir = TempDir::new().unwrap();
        let entry = dir.path().join("bad.rhai");
        fs::write(&entry, r#"import "./missing" as m;"#).unwrap();

        let err = run(config_in(&dir), &entry, None).unwrap_err();
        let CliError::Host(rendered) = err else {
            panic!("expected a host error");
        };
        assert!(rendered.contains("./missing"));
        assert!(rendered.contains("bad.rhai"));
    }
}
