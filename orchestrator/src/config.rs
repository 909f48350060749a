pub mod registry;

use crate::retry::RetryPolicy;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use sha2::{Digest, Sha256};
use std::{
    collections::BTreeMap,
    fmt, fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Closed vocabulary of declarative resource profiles. A machine defaults
/// file maps each of these to concrete resource parameters.
pub const JOB_TYPES: [&str; 5] = [
    "cpu-intensive",
    "gpu-intensive",
    "memory-intensive",
    "io-intensive",
    "balanced",
];

/// One failed schema check, addressed by its dotted field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub path: String,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

fn format_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|violation| format!("  {violation}"))
        .join("\n")
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("failed to read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("configuration is malformed: {0}")]
    Shape(#[source] serde_yaml::Error),
    #[error("no defaults found for machine '{machine}' at {path}")]
    UnknownMachine { machine: String, path: PathBuf },
    #[error("production '{name}' not found. Available productions: {available}")]
    UnknownProduction { name: String, available: String },
    #[error("configuration validation failed:\n{}", format_violations(.0))]
    Invalid(Vec<Violation>),
}

/// Fully resolved, schema-validated production configuration. Downstream
/// components only ever see this typed form, never raw YAML trees.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProductionConfig {
    pub production: ProductionSection,
    pub science: ScienceSection,
    pub execution: ExecutionSection,
    pub resources: ResourceSection,
    pub outputs: OutputSection,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProductionSection {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ScienceSection {
    pub cosmology: String,
    pub redshifts: Vec<f64>,
    pub realizations: RealizationRange,
    // free-form catalog parameters, passed through to the job payload
    #[serde(default)]
    pub catalog: BTreeMap<String, Value>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RealizationRange {
    pub start: u32,
    pub count: u32,
    #[serde(default = "default_step")]
    pub step: u32,
}

fn default_step() -> u32 {
    1
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ExecutionSection {
    pub job_type: String,
    pub batch_size: usize,
    pub timeout_hours: f64,
    pub retry_policy: RetryPolicy,
    // the job executable every array task runs (the payload contract)
    pub payload: PathBuf,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ResourceSection {
    pub account: String,
    pub partition: String,
    #[serde(default)]
    pub constraint: Option<String>,
    pub nodes_per_job: u32,
    pub tasks_per_node: u32,
    pub cpus_per_task: u32,
    #[serde(default)]
    pub gpus_per_node: u32,
    #[serde(default)]
    pub memory_gb: Option<u32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct OutputSection {
    pub base_path: PathBuf,
    #[serde(default)]
    pub structure: DirectoryStructure,
    #[serde(default)]
    pub compression: Compression,
    #[serde(default)]
    pub cleanup_policy: CleanupPolicy,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DirectoryStructure {
    #[default]
    Hierarchical,
    Flat,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Lzf,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    #[default]
    KeepAll,
    KeepFinal,
    KeepNone,
}

/// Load a YAML document with error context.
pub fn load_yaml(path: &Path) -> Result<Value, ConfigErrors> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigErrors::Io {
        path: path.to_path_buf(),
        source,
    })?;

    serde_yaml::from_str(&raw).map_err(|source| ConfigErrors::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Merge machine defaults, the job-type resource profile and the production
/// declaration into one validated `ProductionConfig`.
///
/// Merge order is strictly machine defaults < job-type override <
/// declaration: later layers override only the keys they set, unset keys
/// fall through. Pure apart from the inputs.
pub fn resolve(machine_defaults: &Value, declaration: &Value) -> Result<ProductionConfig, ConfigErrors> {
    let mut base = machine_defaults.clone();

    // job_type_overrides is machine metadata, not part of the resolved config
    let overrides = match &mut base {
        Value::Mapping(map) => map.remove(Value::from("job_type_overrides")),
        _ => None,
    };

    let job_type = job_type_of(declaration).or_else(|| job_type_of(&base));

    if let (Some(overrides), Some(job_type)) = (overrides, job_type) {
        if let Some(profile) = overrides.get(Value::from(job_type.as_str())) {
            apply_resource_profile(&mut base, profile.clone());
        }
    }

    let merged = merge_values(base, declaration.clone());
    let config: ProductionConfig = serde_yaml::from_value(merged).map_err(ConfigErrors::Shape)?;

    let violations = config.validate();
    if violations.is_empty() {
        Ok(config)
    } else {
        Err(ConfigErrors::Invalid(violations))
    }
}

/// Load machine defaults and a production declaration from disk and resolve.
pub fn load_production_config(
    config_root: &Path,
    machine: &str,
    declaration_path: &Path,
) -> Result<ProductionConfig, ConfigErrors> {
    let defaults_path = config_root.join("defaults").join(format!("{machine}.yaml"));
    if !defaults_path.is_file() {
        return Err(ConfigErrors::UnknownMachine {
            machine: machine.to_owned(),
            path: defaults_path,
        });
    }

    let defaults = load_yaml(&defaults_path)?;
    let declaration = load_yaml(declaration_path)?;

    resolve(&defaults, &declaration)
}

fn job_type_of(value: &Value) -> Option<String> {
    value
        .get("execution")?
        .get("job_type")?
        .as_str()
        .map(str::to_owned)
}

fn apply_resource_profile(base: &mut Value, profile: Value) {
    if let Value::Mapping(map) = base {
        let key = Value::from("resources");
        let resources = map.remove(&key).unwrap_or(Value::Mapping(Default::default()));
        map.insert(key, merge_values(resources, profile));
    }
}

/// Deep merge: mappings recurse, anything else is replaced by the overlay.
fn merge_values(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Mapping(mut base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                let merged = match base.remove(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }

            Value::Mapping(base)
        }
        (_, overlay) => overlay,
    }
}

fn valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    matches!(chars.next(), Some('a'..='z'))
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

impl ProductionConfig {
    /// Schema validation. Collects every violation instead of stopping at
    /// the first so the user can fix all of them in one pass.
    pub fn validate(&self) -> Vec<Violation> {
        let mut violations = Vec::new();
        let mut violate = |path: &str, message: String| {
            violations.push(Violation {
                path: path.to_owned(),
                message,
            })
        };

        if !valid_name(&self.production.name) {
            violate(
                "production.name",
                format!(
                    "'{}' must match [a-z][a-z0-9_]*",
                    self.production.name
                ),
            );
        }
        if self.production.version.is_empty() {
            violate("production.version", "must not be empty".to_owned());
        }

        if self.science.redshifts.is_empty() {
            violate("science.redshifts", "must list at least one redshift".to_owned());
        }
        for (index, redshift) in self.science.redshifts.iter().enumerate() {
            if !(*redshift > 0.0 && *redshift <= 20.0) {
                violate(
                    &format!("science.redshifts[{index}]"),
                    format!("value {redshift} outside the valid range (0, 20]"),
                );
            }
        }
        if self.science.realizations.count < 1 {
            violate("science.realizations.count", "must be at least 1".to_owned());
        }
        if self.science.realizations.step < 1 {
            violate("science.realizations.step", "must be at least 1".to_owned());
        }

        if !JOB_TYPES.contains(&self.execution.job_type.as_str()) {
            violate(
                "execution.job_type",
                format!(
                    "'{}' is not one of: {}",
                    self.execution.job_type,
                    JOB_TYPES.join(", ")
                ),
            );
        }
        if self.execution.batch_size < 1 {
            violate("execution.batch_size", "must be at least 1".to_owned());
        }
        if !(self.execution.timeout_hours > 0.0) {
            violate("execution.timeout_hours", "must be positive".to_owned());
        }
        if self.execution.retry_policy.backoff_multiplier < 1.0 {
            violate(
                "execution.retry_policy.backoff_multiplier",
                "must be at least 1.0".to_owned(),
            );
        }
        if self.execution.retry_policy.initial_delay_minutes < 0.0 {
            violate(
                "execution.retry_policy.initial_delay_minutes",
                "must not be negative".to_owned(),
            );
        }
        if self.execution.payload.as_os_str().is_empty() {
            violate("execution.payload", "must name the job executable".to_owned());
        }

        if self.resources.account.is_empty() {
            violate("resources.account", "must not be empty".to_owned());
        }
        if self.resources.partition.is_empty() {
            violate("resources.partition", "must not be empty".to_owned());
        }
        if self.resources.nodes_per_job < 1 {
            violate("resources.nodes_per_job", "must be at least 1".to_owned());
        }
        if self.resources.tasks_per_node < 1 {
            violate("resources.tasks_per_node", "must be at least 1".to_owned());
        }
        if self.resources.cpus_per_task < 1 {
            violate("resources.cpus_per_task", "must be at least 1".to_owned());
        }

        if self.outputs.base_path.as_os_str().is_empty() {
            violate("outputs.base_path", "must not be empty".to_owned());
        }

        violations
    }

    /// Stable content hash of the resolved configuration, used to detect
    /// drift between an initialized production and a re-run of init.
    pub fn hash(&self) -> String {
        let canonical = serde_yaml::to_string(self).unwrap_or_default();
        let digest = Sha256::digest(canonical.as_bytes());

        digest.iter().map(|byte| format!("{byte:02x}")).collect()
    }

    /// Working directory of the production under the configured base path.
    pub fn work_dir(&self) -> PathBuf {
        self.outputs.base_path.join("productions").join(format!(
            "{}_{}",
            self.production.version, self.production.name
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine_defaults() -> Value {
        serde_yaml::from_str(
            r#"
            execution:
              batch_size: 16
              timeout_hours: 4.0
              retry_policy:
                max_retries: 3
                backoff_multiplier: 2.0
                initial_delay_minutes: 5.0
              payload: /opt/pipeline/bin/generate_mock
            resources:
              account: cosmo
              partition: regular
              nodes_per_job: 1
              tasks_per_node: 8
              cpus_per_task: 4
            outputs:
              base_path: /scratch/mocks
            job_type_overrides:
              gpu-intensive:
                gpus_per_node: 4
                cpus_per_task: 32
              cpu-intensive:
                cpus_per_task: 16
            "#,
        )
        .unwrap()
    }

    fn declaration() -> Value {
        serde_yaml::from_str(
            r#"
            production:
              name: alpha
              version: v1.0
              description: first light
            science:
              cosmology: planck18
              redshifts: [1.0, 1.5]
              realizations:
                start: 0
                count: 2
            execution:
              job_type: gpu-intensive
              batch_size: 4
            "#,
        )
        .unwrap()
    }

    #[test]
    fn layers_merge_most_specific_wins() {
        let config = resolve(&machine_defaults(), &declaration()).unwrap();

        // declaration overrides machine default
        assert_eq!(config.execution.batch_size, 4);
        // machine default falls through where the declaration is silent
        assert_eq!(config.execution.timeout_hours, 4.0);
        assert_eq!(config.resources.account, "cosmo");
        // job-type profile overrides the machine resource defaults
        assert_eq!(config.resources.gpus_per_node, 4);
        assert_eq!(config.resources.cpus_per_task, 32);
        assert_eq!(config.resources.tasks_per_node, 8);
    }

    #[test]
    fn declaration_resources_beat_the_job_type_profile() {
        let mut declaration = declaration();
        let extra: Value = serde_yaml::from_str("resources:\n  cpus_per_task: 2").unwrap();
        declaration = merge_values(declaration, extra);

        let config = resolve(&machine_defaults(), &declaration).unwrap();

        assert_eq!(config.resources.cpus_per_task, 2);
        assert_eq!(config.resources.gpus_per_node, 4);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let mut declaration = declaration();
        let extra: Value = serde_yaml::from_str("production:\n  nam: typo").unwrap();
        declaration = merge_values(declaration, extra);

        assert!(matches!(
            resolve(&machine_defaults(), &declaration),
            Err(ConfigErrors::Shape(_))
        ));
    }

    #[test]
    fn every_violation_is_reported_at_once() {
        let mut declaration = declaration();
        let broken: Value = serde_yaml::from_str(
            r#"
            production:
              name: Not_Valid
            science:
              redshifts: [25.0]
              realizations:
                count: 0
            execution:
              batch_size: 0
              job_type: quantum
            "#,
        )
        .unwrap();
        declaration = merge_values(declaration, broken);

        match resolve(&machine_defaults(), &declaration) {
            Err(ConfigErrors::Invalid(violations)) => {
                let paths: Vec<_> = violations.iter().map(|v| v.path.as_str()).collect();
                assert!(paths.contains(&"production.name"));
                assert!(paths.contains(&"science.redshifts[0]"));
                assert!(paths.contains(&"science.realizations.count"));
                assert!(paths.contains(&"execution.batch_size"));
                assert!(paths.contains(&"execution.job_type"));
            }
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn hash_is_stable_and_drift_sensitive() {
        let first = resolve(&machine_defaults(), &declaration()).unwrap();
        let second = resolve(&machine_defaults(), &declaration()).unwrap();
        assert_eq!(first.hash(), second.hash());

        let mut changed = declaration();
        let extra: Value = serde_yaml::from_str("execution:\n  batch_size: 8").unwrap();
        changed = merge_values(changed, extra);
        let third = resolve(&machine_defaults(), &changed).unwrap();
        assert_ne!(first.hash(), third.hash());
    }

    #[test]
    fn work_dir_is_versioned() {
        let config = resolve(&machine_defaults(), &declaration()).unwrap();

        assert_eq!(
            config.work_dir(),
            PathBuf::from("/scratch/mocks/productions/v1.0_alpha")
        );
    }
}
