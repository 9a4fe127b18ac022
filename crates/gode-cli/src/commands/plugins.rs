//! `gode plugins` command implementation

use crate::CliError;
use colored::Colorize;
use gode_kernel::HostConfig;
use gode_runtime::ScriptEngineHost;
use std::path::PathBuf;
use tracing::debug;

/// Execute the `gode plugins` command
pub fn run(config: HostConfig, libraries: &[PathBuf]) -> Result<(), CliError> {
    let mut host = ScriptEngineHost::new(config)?;

    let mut failed = 0;
    for library in libraries {
        debug!("Loading plugin library {}", library.display());
        if let Err(report) = host.load_plugin(library) {
            failed += 1;
            println!("{} {}: {}", "✗".red(), library.display(), report.current_context());
        }
    }

    for descriptor in host.descriptors() {
        println!();
        println!(
            "  {} {} ({})",
            descriptor.name.bold(),
            descriptor.version.yellow(),
            descriptor.state.to_string().cyan()
        );
        if !descriptor.description.is_empty() {
            println!("    {}", descriptor.description);
        }
        if let Some(path) = &descriptor.library_path {
            println!("    Library: {}", path.display());
        }
        if let Some(hash) = &descriptor.file_hash {
            println!("    SHA-256: {}", hash);
        }
        if !descriptor.exports.is_empty() {
            println!("    Exports: {}", descriptor.exports.join(", ").green());
        }
    }
    println!();

    let report = host.dispose();
    for failure in &report.failures {
        println!("{} {}", "✗".red(), failure);
    }

    if failed > 0 {
        return Err(CliError::PluginsFailed(failed, libraries.len()));
    }
    Ok(())
}
