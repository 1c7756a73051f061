use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::llm::ModelParams;
use crate::prompts::{
    DEFAULT_NARRATION_SYSTEM, DEFAULT_NARRATION_TEMPLATE, DEFAULT_SYNTHESIS_SYSTEM,
    DEFAULT_SYNTHESIS_TEMPLATE, PromptSet,
};
use crate::retrieval::DEFAULT_SNIPPET_COUNT;
use crate::schema::{DEFAULT_TABLE_NAME, SchemaDescriptor};
use crate::sql::{DEFAULT_MAX_LIMIT, QueryLimits};
use crate::store::DEFAULT_BUSY_TIMEOUT_MS;

pub const CONFIG_DIR_NAME: &str = ".floatchat";
pub const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    pub home_dir: PathBuf,
    pub cwd: PathBuf,
}

impl RuntimePaths {
    #[must_use]
    pub fn default_config_path(&self) -> PathBuf {
        self.home_dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME)
    }

    /// `~` expands to the home directory; relative paths resolve against
    /// the working directory.
    pub fn resolve(&self, path: &Path) -> Result<PathBuf> {
        resolve_user_path(path, &self.home_dir, &self.cwd)
    }
}

pub fn resolve_runtime_paths(home_dir: &Path, cwd: &Path) -> Result<RuntimePaths> {
    if !home_dir.is_absolute() {
        bail!("home_dir must be absolute: {}", home_dir.display());
    }
    if !cwd.is_absolute() {
        bail!("cwd must be absolute: {}", cwd.display());
    }

    Ok(RuntimePaths {
        home_dir: normalize_lexical(home_dir),
        cwd: normalize_lexical(cwd),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub table: String,
    pub max_limit: u64,
    pub default_limit: u64,
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("argo_cleaned.db"),
            table: DEFAULT_TABLE_NAME.to_string(),
            max_limit: DEFAULT_MAX_LIMIT,
            default_limit: DEFAULT_MAX_LIMIT,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchemaConfig {
    /// TOML descriptor replacing the built-in ARGO one; its table wins over
    /// `store.table`.
    pub descriptor_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrievalConfig {
    pub endpoint: Option<String>,
    pub k: usize,
    pub timeout_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            k: DEFAULT_SNIPPET_COUNT,
            timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GenerationConfig {
    pub endpoint: String,
    pub api_key_env: String,
    pub timeout_ms: u64,
    pub max_transport_retries: u32,
    pub synthesis: ModelParams,
    pub narration: ModelParams,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_ms: 30_000,
            max_transport_retries: 1,
            synthesis: ModelParams {
                model: "gpt-4o-mini".to_string(),
                temperature: 0.0,
                max_tokens: None,
            },
            narration: ModelParams {
                model: "gpt-4".to_string(),
                temperature: 0.2,
                max_tokens: None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PromptConfig {
    pub synthesis_system: String,
    pub synthesis_template: String,
    pub narration_system: String,
    pub narration_template: String,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            synthesis_system: DEFAULT_SYNTHESIS_SYSTEM.to_string(),
            synthesis_template: DEFAULT_SYNTHESIS_TEMPLATE.to_string(),
            narration_system: DEFAULT_NARRATION_SYSTEM.to_string(),
            narration_template: DEFAULT_NARRATION_TEMPLATE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FloatchatConfig {
    pub store: StoreConfig,
    pub schema: SchemaConfig,
    pub retrieval: RetrievalConfig,
    pub generation: GenerationConfig,
    pub prompts: PromptConfig,
}

impl FloatchatConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).context("failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.store.table.trim().is_empty() {
            bail!("store.table must not be empty");
        }
        if self.store.max_limit == 0 {
            bail!("store.max_limit must be greater than zero");
        }
        if self.store.default_limit == 0 || self.store.default_limit > self.store.max_limit {
            bail!(
                "store.default_limit must be between 1 and store.max_limit ({})",
                self.store.max_limit
            );
        }
        if self.retrieval.k == 0 {
            bail!("retrieval.k must be greater than zero");
        }
        if self.generation.endpoint.trim().is_empty() {
            bail!("generation.endpoint must not be empty");
        }
        for (section, params) in [
            ("generation.synthesis", &self.generation.synthesis),
            ("generation.narration", &self.generation.narration),
        ] {
            if params.model.trim().is_empty() {
                bail!("{section}.model must not be empty");
            }
            if !(0.0..=2.0).contains(&params.temperature) {
                bail!("{section}.temperature must be within 0.0..=2.0");
            }
        }
        self.prompt_set()?;
        Ok(())
    }

    pub fn prompt_set(&self) -> Result<PromptSet> {
        PromptSet::new(
            &self.prompts.synthesis_system,
            &self.prompts.synthesis_template,
            &self.prompts.narration_system,
            &self.prompts.narration_template,
        )
        .context("invalid [prompts] configuration")
    }

    #[must_use]
    pub fn query_limits(&self) -> QueryLimits {
        QueryLimits {
            max_limit: self.store.max_limit,
            default_limit: self.store.default_limit,
        }
    }

    /// `db_override` (from `--db`) wins over `store.path`.
    pub fn store_path(&self, paths: &RuntimePaths, db_override: Option<&Path>) -> Result<PathBuf> {
        paths.resolve(db_override.unwrap_or(&self.store.path))
    }

    pub fn load_descriptor(&self, paths: &RuntimePaths) -> Result<SchemaDescriptor> {
        match &self.schema.descriptor_path {
            Some(path) => SchemaDescriptor::load_toml(&paths.resolve(path)?),
            None => Ok(SchemaDescriptor::argo_profiles(&self.store.table)),
        }
    }
}

/// Loads `explicit` if given (it must exist), otherwise
/// `<home>/.floatchat/config.toml` when present, otherwise the defaults.
pub fn load_config(paths: &RuntimePaths, explicit: Option<&Path>) -> Result<FloatchatConfig> {
    let path = match explicit {
        Some(path) => paths.resolve(path)?,
        None => {
            let default_path = paths.default_config_path();
            if !default_path.exists() {
                return Ok(FloatchatConfig::default());
            }
            default_path
        }
    };

    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read configuration: {}", path.display()))?;
    FloatchatConfig::from_toml_str(&raw)
        .with_context(|| format!("invalid configuration: {}", path.display()))
}

fn resolve_user_path(path: &Path, home_dir: &Path, cwd: &Path) -> Result<PathBuf> {
    let expanded = expand_tilde(path, home_dir)?;
    let resolved = if expanded.is_absolute() {
        expanded
    } else {
        cwd.join(expanded)
    };

    Ok(normalize_lexical(&resolved))
}

fn expand_tilde(path: &Path, home_dir: &Path) -> Result<PathBuf> {
    let mut components = path.components();
    match components.next() {
        Some(Component::Normal(first)) if first == "~" => {
            let mut expanded = home_dir.to_path_buf();
            for component in components {
                expanded.push(component.as_os_str());
            }
            Ok(expanded)
        }
        Some(Component::Normal(first))
            if first
                .to_str()
                .is_some_and(|segment| segment.starts_with('~')) =>
        {
            bail!(
                "unsupported home expansion syntax (only `~` and `~/...` are supported): {}",
                path.display()
            )
        }
        _ => Ok(path.to_path_buf()),
    }
}

fn normalize_lexical(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push(component.as_os_str());
                }
            }
            _ => normalized.push(component.as_os_str()),
        }
    }

    normalized
}
