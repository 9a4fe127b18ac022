//! Import map: alias → target substitution.

use std::collections::BTreeMap;
use std::path::Path;

/// Alias table loaded once from configuration; read-only afterwards.
///
/// Keys ending in `/` are prefix aliases. Other keys match the exact
/// specifier, or the specifier followed by `/`. Relative targets are made
/// absolute against the configuration directory when the map is built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportMap {
    entries: BTreeMap<String, String>,
}

impl ImportMap {
    pub fn new(entries: &BTreeMap<String, String>, base_dir: &Path) -> Self {
        let entries = entries
            .iter()
            .map(|(alias, target)| {
                let target = if target.starts_with("./") || target.starts_with("../") {
                    format!("{}/{}", base_dir.display(), target)
                } else {
                    target.clone()
                };
                (alias.clone(), target)
            })
            .collect();
        Self { entries }
    }

    /// Longest matching alias and the substituted specifier.
    pub fn substitute(&self, specifier: &str) -> Option<(String, String)> {
        self.entries
            .iter()
            .filter_map(|(alias, target)| {
                let rest = specifier.strip_prefix(alias.as_str())?;
                let matches = alias.ends_with('/') || rest.is_empty() || rest.starts_with('/');
                matches.then(|| (alias, format!("{}{}", target, rest)))
            })
            .max_by_key(|(alias, _)| alias.len())
            .map(|(alias, target)| (alias.clone(), target))
    }

    pub fn get(&self, alias: &str) -> Option<&str> {
        self.entries.get(alias).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> ImportMap {
        let entries = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ImportMap::new(&entries, Path::new("/project"))
    }

    #[test]
    fn test_longest_prefix_wins() {
        let imports = map(&[("@lib/", "/a/"), ("@lib/net/", "/b/")]);

        assert_eq!(
            imports.substitute("@lib/net/http.rhai"),
            Some(("@lib/net/".to_string(), "/b/http.rhai".to_string()))
        );
        assert_eq!(
            imports.substitute("@lib/fs.rhai"),
            Some(("@lib/".to_string(), "/a/fs.rhai".to_string()))
        );
    }

    #[test]
    fn test_bare_keys_match_whole_segments() {
        let imports = map(&[("utils", "./lib/utils")]);

        assert_eq!(
            imports.substitute("utils").map(|(_, t)| t),
            Some("/project/./lib/utils".to_string())
        );
        assert_eq!(
            imports.substitute("utils/str.rhai").map(|(_, t)| t),
            Some("/project/./lib/utils/str.rhai".to_string())
        );
        assert_eq!(imports.substitute("utilsx"), None);
    }

    #[test]
    fn test_non_relative_targets_are_kept() {
        let imports = map(&[("@a", "@b"), ("std", "gode:core")]);
        assert_eq!(imports.get("@a"), Some("@b"));
        assert_eq!(imports.get("std"), Some("gode:core"));
        assert_eq!(imports.len(), 2);
    }
}
