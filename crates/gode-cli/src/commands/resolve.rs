//! `gode resolve` command implementation

use crate::CliError;
use colored::Colorize;
use gode_kernel::HostConfig;
use gode_runtime::{ModuleResolver, PLUGIN_NAMESPACE};

/// Execute the `gode resolve` command
pub fn run(config: &HostConfig, specifier: &str, referrer: &str, json: bool) -> Result<(), CliError> {
    let mut resolver = ModuleResolver::from_config(config);
    resolver.add_builtin_namespace(PLUGIN_NAMESPACE);

    let module = resolver.resolve(specifier, referrer)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&module)?);
        return Ok(());
    }

    println!("{} {}", "✓".green(), specifier.bold());
    println!("  Kind: {}", module.kind.to_string().cyan());
    println!("  Key:  {}", module.canonical_key.yellow());
    if let Some(path) = &module.path {
        let marker = if path.is_file() { "" } else { " (missing)" };
        println!("  Path: {}{}", path.display(), marker.red());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unresolvable_specifier_is_an_error() {
        let config = HostConfig::default();

        assert!(run(&config, "gode:core", "", true).is_ok());
        let err = run(&config, "left-pad", "", false).unwrap_err();
        assert!(matches!(err, CliError::Resolution(_)));
    }
}
