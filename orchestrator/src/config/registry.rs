use super::ConfigErrors;
use itertools::Itertools;
use serde_yaml::Value;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};
use tracing::warn;

/// Maps human production identifiers to configuration file paths.
///
/// Scans `<config-root>/productions/*.yaml` and registers each file under
/// `{version}_{name}` and, when unambiguous, the bare name. Files that do
/// not parse or lack a production section are skipped with a warning so a
/// single broken file cannot take down `list`.
#[derive(Debug, Default)]
pub struct ConfigRegistry {
    entries: BTreeMap<String, PathBuf>,
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml" | "yml")
    )
}

impl ConfigRegistry {
    pub fn scan(config_root: &Path) -> Self {
        let mut entries = BTreeMap::new();
        let productions_dir = config_root.join("productions");

        let Ok(dir) = fs::read_dir(&productions_dir) else {
            return Self { entries };
        };

        for entry in dir.flatten() {
            let path = entry.path();
            if !is_yaml(&path) {
                continue;
            }

            let value = match super::load_yaml(&path) {
                Ok(value) => value,
                Err(error) => {
                    warn!(path = ?path, "Skipping unreadable production config: {error}");
                    continue;
                }
            };

            let name = value
                .get("production")
                .and_then(|production| production.get("name"))
                .and_then(Value::as_str);
            let version = value
                .get("production")
                .and_then(|production| production.get("version"))
                .and_then(Value::as_str);

            match (name, version) {
                (Some(name), Some(version)) => {
                    entries.insert(format!("{version}_{name}"), path.clone());
                    entries.entry(name.to_owned()).or_insert(path);
                }
                _ => {
                    warn!(path = ?path, "Skipping config without production name/version");
                }
            }
        }

        Self { entries }
    }

    /// Resolve a production name or a literal configuration path.
    pub fn resolve(&self, name_or_path: &str) -> Result<PathBuf, ConfigErrors> {
        let path = Path::new(name_or_path);
        if path.is_file() && is_yaml(path) {
            return Ok(path.to_path_buf());
        }

        if let Some(found) = self.entries.get(name_or_path) {
            return Ok(found.clone());
        }

        Err(ConfigErrors::UnknownProduction {
            name: name_or_path.to_owned(),
            available: if self.entries.is_empty() {
                "(none)".to_owned()
            } else {
                self.entries.keys().join(", ")
            },
        })
    }

    pub fn entries(&self) -> &BTreeMap<String, PathBuf> {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &Path, file: &str, name: &str, version: &str) -> PathBuf {
        let path = dir.join(file);
        let mut handle = fs::File::create(&path).unwrap();
        writeln!(
            handle,
            "production:\n  name: {name}\n  version: {version}"
        )
        .unwrap();

        path
    }

    #[test]
    fn resolves_names_versions_and_paths() {
        let root = tempfile::tempdir().unwrap();
        let productions = root.path().join("productions");
        fs::create_dir_all(&productions).unwrap();

        let alpha = write_config(&productions, "alpha.yaml", "alpha", "v1.0");
        write_config(&productions, "beta.yaml", "beta", "v2.1");

        let registry = ConfigRegistry::scan(root.path());

        assert_eq!(registry.resolve("alpha").unwrap(), alpha);
        assert_eq!(registry.resolve("v1.0_alpha").unwrap(), alpha);
        assert_eq!(
            registry.resolve(alpha.to_str().unwrap()).unwrap(),
            alpha
        );
        assert_eq!(registry.entries().len(), 4);
    }

    #[test]
    fn unknown_name_lists_what_exists() {
        let root = tempfile::tempdir().unwrap();
        let productions = root.path().join("productions");
        fs::create_dir_all(&productions).unwrap();
        write_config(&productions, "alpha.yaml", "alpha", "v1.0");

        let registry = ConfigRegistry::scan(root.path());

        match registry.resolve("gamma") {
            Err(ConfigErrors::UnknownProduction { available, .. }) => {
                assert!(available.contains("alpha"));
                assert!(available.contains("v1.0_alpha"));
            }
            other => panic!("expected UnknownProduction, got {other:?}"),
        }
    }

    #[test]
    fn broken_files_are_skipped() {
        let root = tempfile::tempdir().unwrap();
        let productions = root.path().join("productions");
        fs::create_dir_all(&productions).unwrap();
        fs::write(productions.join("broken.yaml"), ": : :").unwrap();
        write_config(&productions, "alpha.yaml", "alpha", "v1.0");

        let registry = ConfigRegistry::scan(root.path());

        assert!(registry.resolve("alpha").is_ok());
        assert_eq!(registry.entries().len(), 2);
    }

    #[test]
    fn empty_registry_resolves_nothing() {
        let root = tempfile::tempdir().unwrap();
        let registry = ConfigRegistry::scan(root.path());

        assert!(registry.resolve("anything").is_err());
    }
}
