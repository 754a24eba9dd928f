//! Configuration schema and layered loader
//!
//! Loads configuration from:
//! 1. Default values
//! 2. User-level config: ~/.lakeslice/lakeslice.toml
//! 3. Project-level config: ./.lakeslice/lakeslice.toml (or `--config <file>`)
//!
//! Later layers override earlier ones key by key, so a project file that
//! only sets `[execution] max_parallelism` keeps every other user setting.

use anyhow::{bail, Context, Result};
use lakeslice_core::{
    BreakPolicy, FormatConfig, OrchestratorConfig, OutputFormat, RetryPolicy, SampleSpecPatch,
    SampleSpecResolver, Strategy,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info};

/// Row budget used when no layer sets one.
pub const DEFAULT_ROW_BUDGET: u64 = 1_000;

/// Main lakeslice configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LakesliceConfig {
    /// Global default sampling spec (partial)
    pub sampling: SampleSpecPatch,

    /// Per-table partial specs, keyed by table name
    pub table_overrides: BTreeMap<String, SampleSpecPatch>,

    pub execution: ExecutionConfig,
    pub graph: GraphConfig,
    pub output: OutputConfig,
    pub state: StateConfig,
    pub logging: LoggingConfig,
}

/// Execution configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Worker slots shared by every wave
    pub max_parallelism: usize,

    /// Per-attempt limit in seconds; unset means no limit
    pub table_timeout_secs: Option<u64>,

    /// What to do with a cyclic table graph
    pub on_cycle: BreakPolicy,

    pub retry: RetryPolicy,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_parallelism: 4,
            table_timeout_secs: None,
            on_cycle: BreakPolicy::FailFast,
            retry: RetryPolicy::default(),
        }
    }
}

/// Which tables take part and how edges are found
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Add edges for `<table>_id` columns that are not declared foreign keys
    pub infer_foreign_keys: bool,

    /// Tables to sync; empty means all
    pub include: Vec<String>,

    pub exclude: Vec<String>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            infer_foreign_keys: true,
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

/// Output configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: PathBuf,
    pub format: OutputFormat,
    pub compression: Option<String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./lakeslice-data"),
            format: OutputFormat::Jsonl,
            compression: None,
        }
    }
}

/// Where run checkpoints live
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub dir: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./.lakeslice/runs"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directive, e.g. `info` or `lakeslice_core=debug`
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LakesliceConfig {
    /// Reject settings the orchestrator cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.execution.max_parallelism == 0 {
            bail!("execution.max_parallelism must be at least 1");
        }
        if self.execution.table_timeout_secs == Some(0) {
            bail!("execution.table_timeout_secs must be at least 1 when set");
        }
        if let Err(reason) = self.execution.retry.validate() {
            bail!("execution.{}", reason);
        }
        Ok(())
    }

    /// The configured default over the built-in one (`random`, 1000 rows).
    pub fn default_sampling(&self) -> SampleSpecPatch {
        self.sampling.over(
            &SampleSpecPatch::strategy(Strategy::Random).with_row_budget(DEFAULT_ROW_BUDGET),
        )
    }

    pub fn spec_resolver(&self) -> SampleSpecResolver {
        SampleSpecResolver::new(
            self.default_sampling(),
            self.table_overrides
                .iter()
                .map(|(table, patch)| (table.as_str(), patch.clone())),
        )
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_parallelism: self.execution.max_parallelism,
            retry: self.execution.retry.clone(),
            table_timeout: self.execution.table_timeout_secs.map(Duration::from_secs),
            break_policy: self.execution.on_cycle,
        }
    }

    pub fn format_config(&self) -> FormatConfig {
        FormatConfig {
            format: self.output.format,
            output_dir: self.output.dir.clone(),
            compression: self.output.compression.clone(),
        }
    }
}

/// Configuration loader that handles both user and project configs
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    user_config_path: Option<PathBuf>,
    project_config_path: PathBuf,
    /// The project slot was given explicitly and must exist
    required: bool,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            user_config_path: Self::default_user_config_path(),
            project_config_path: PathBuf::from(".lakeslice").join("lakeslice.toml"),
            required: false,
        }
    }

    /// Use `path` instead of the project-level file. It must exist.
    pub fn with_config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.project_config_path = path.into();
        self.required = true;
        self
    }

    /// Override (or disable) the user-level file.
    pub fn with_user_config_path(mut self, path: Option<PathBuf>) -> Self {
        self.user_config_path = path;
        self
    }

    /// ~/.lakeslice/lakeslice.toml, when a home directory is known
    fn default_user_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".lakeslice").join("lakeslice.toml"))
    }

    pub fn user_config_path(&self) -> Option<&Path> {
        self.user_config_path.as_deref()
    }

    pub fn project_config_path(&self) -> &Path {
        &self.project_config_path
    }

    /// Load and validate the merged configuration.
    ///
    /// Missing files are skipped; a file that exists but does not parse is an
    /// error.
    pub async fn load(&self) -> Result<LakesliceConfig> {
        let mut merged = toml::Table::new();

        if let Some(user) = &self.user_config_path {
            if let Some(layer) = Self::read_layer(user).await? {
                debug!(path = %user.display(), "Loaded user-level config");
                merge_tables(&mut merged, layer);
            }
        }

        match Self::read_layer(&self.project_config_path).await? {
            Some(layer) => {
                debug!(path = %self.project_config_path.display(), "Loaded project-level config");
                merge_tables(&mut merged, layer);
            }
            None if self.required => {
                bail!(
                    "Config file not found: {}",
                    self.project_config_path.display()
                );
            }
            None => {}
        }

        let config: LakesliceConfig = toml::Value::Table(merged)
            .try_into()
            .context("Failed to interpret merged configuration")?;
        config.validate()?;
        info!("Configuration loaded");
        Ok(config)
    }

    async fn read_layer(path: &Path) -> Result<Option<toml::Table>> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            debug!(path = %path.display(), "Config file not present");
            return Ok(None);
        }
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let table = content
            .parse::<toml::Table>()
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(Some(table))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Deep-merge `overlay` into `base`; tables merge recursively, everything
/// else is replaced.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lakeslice_core::SampleSpec;
    use tempfile::TempDir;

    fn loader(user: Option<PathBuf>, project: PathBuf) -> ConfigLoader {
        let mut loader = ConfigLoader::new().with_user_config_path(user);
        loader.project_config_path = project;
        loader
    }

    #[test]
    fn test_config_paths() {
        let loader = ConfigLoader::new();
        assert!(loader
            .project_config_path()
            .ends_with(".lakeslice/lakeslice.toml"));
        if let Some(user) = loader.user_config_path() {
            assert!(user.ends_with(".lakeslice/lakeslice.toml"));
        }
    }

    #[tokio::test]
    async fn test_load_returns_defaults_when_no_files() {
        let config = loader(None, PathBuf::from("/nonexistent/lakeslice.toml"))
            .load()
            .await
            .unwrap();

        assert_eq!(config, LakesliceConfig::default());
        assert_eq!(config.execution.max_parallelism, 4);
        assert_eq!(config.logging.level, "info");
        assert_eq!(
            config.spec_resolver().resolve("anything", None).unwrap(),
            SampleSpec::Random {
                row_budget: DEFAULT_ROW_BUDGET,
                seed: None
            }
        );
    }

    #[tokio::test]
    async fn test_project_overrides_user_key_by_key() {
        let dir = TempDir::new().unwrap();
        let user = dir.path().join("user.toml");
        let project = dir.path().join("project.toml");

        fs::write(
            &user,
            r#"
[sampling]
strategy = "head"
row_budget = 250

[execution]
max_parallelism = 8

[execution.retry]
max_attempts = 5

[table_overrides.orders]
strategy = "recent"
"#,
        )
        .await
        .unwrap();
        fs::write(
            &project,
            r#"
[execution]
table_timeout_secs = 60

[table_overrides.orders]
date_column = "created_at"

[logging]
level = "debug"
"#,
        )
        .await
        .unwrap();

        let config = loader(Some(user), project).load().await.unwrap();

        assert_eq!(config.execution.max_parallelism, 8);
        assert_eq!(config.execution.table_timeout_secs, Some(60));
        assert_eq!(config.execution.retry.max_attempts, 5);
        assert_eq!(config.logging.level, "debug");

        let specs = config.spec_resolver();
        assert_eq!(
            specs.resolve("ORDERS", None).unwrap(),
            SampleSpec::Recent {
                row_budget: 250,
                date_column: "created_at".into()
            }
        );
        assert_eq!(
            specs.resolve("customers", None).unwrap(),
            SampleSpec::Head { row_budget: 250 }
        );
    }

    #[tokio::test]
    async fn test_orchestrator_settings_from_config() {
        let dir = TempDir::new().unwrap();
        let project = dir.path().join("lakeslice.toml");
        fs::write(
            &project,
            r#"
[execution]
max_parallelism = 2
table_timeout_secs = 30
on_cycle = "break_arbitrary"

[output]
dir = "/tmp/slices"
format = "json"
"#,
        )
        .await
        .unwrap();

        let config = loader(None, project).load().await.unwrap();
        let orchestrator = config.orchestrator_config();
        assert_eq!(orchestrator.max_parallelism, 2);
        assert_eq!(orchestrator.table_timeout, Some(Duration::from_secs(30)));
        assert_eq!(orchestrator.break_policy, BreakPolicy::BreakArbitrary);

        let format = config.format_config();
        assert_eq!(format.format, OutputFormat::Json);
        assert_eq!(format.location_for("t"), PathBuf::from("/tmp/slices/t.json"));
    }

    #[tokio::test]
    async fn test_invalid_toml_is_an_error() {
        let dir = TempDir::new().unwrap();
        let project = dir.path().join("lakeslice.toml");
        fs::write(&project, "[execution\nmax_parallelism = 2\n")
            .await
            .unwrap();

        let err = loader(None, project).load().await.unwrap_err();
        assert!(err.to_string().contains("Failed to parse"));
    }

    #[tokio::test]
    async fn test_unknown_spec_field_is_rejected() {
        let dir = TempDir::new().unwrap();
        let project = dir.path().join("lakeslice.toml");
        fs::write(&project, "[sampling]\nrows = 10\n").await.unwrap();

        assert!(loader(None, project).load().await.is_err());
    }

    #[tokio::test]
    async fn test_validation_rejects_zero_parallelism() {
        let dir = TempDir::new().unwrap();
        let project = dir.path().join("lakeslice.toml");
        fs::write(&project, "[execution]\nmax_parallelism = 0\n")
            .await
            .unwrap();

        let err = loader(None, project).load().await.unwrap_err();
        assert!(err.to_string().contains("max_parallelism"));
    }

    #[tokio::test]
    async fn test_explicit_config_file_must_exist() {
        let err = ConfigLoader::new()
            .with_user_config_path(None)
            .with_config_file("/nonexistent/custom.toml")
            .load()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_merge_tables_is_deep() {
        let mut base: toml::Table = "[a]\nx = 1\ny = 2\n[b]\nz = 3\n".parse().unwrap();
        let overlay: toml::Table = "[a]\ny = 20\n[c]\nw = 4\n".parse().unwrap();
        merge_tables(&mut base, overlay);

        assert_eq!(base["a"]["x"].as_integer(), Some(1));
        assert_eq!(base["a"]["y"].as_integer(), Some(20));
        assert_eq!(base["b"]["z"].as_integer(), Some(3));
        assert_eq!(base["c"]["w"].as_integer(), Some(4));
    }
}
