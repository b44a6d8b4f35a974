//! Configuration for clipforge.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (CLIPFORGE_HOME, CLIPFORGE_STORAGE_ROOT,
//!    CLIPFORGE_METADATA_URL, CLIPFORGE_METADATA_KEY, CLIPFORGE_UNIT_TOKEN)
//! 2. Config file (.clipforge/config.yaml)
//! 3. Defaults (~/.clipforge)
//!
//! Config file discovery:
//! - Searches current directory and parents for .clipforge/config.yaml
//! - `paths.home` is relative to the .clipforge/ directory, every other path
//!   is relative to the project root (the parent of .clipforge/)

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::{AngleTable, ExtractionSettings, OrchestratorSettings, RetryPolicy, StorageLayout};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub angles: Option<AngleTable>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Journal directory (relative to .clipforge/)
    pub home: Option<String>,
    /// Parent for scratch directories (system temp when unset)
    pub work_dir: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    pub root: Option<String>,
    pub uri_base: Option<String>,
    pub source_prefix: Option<String>,
    pub output_prefix: Option<String>,
    pub combined_prefix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataKind {
    Postgrest,
    JsonDir,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetadataConfig {
    pub kind: Option<MetadataKind>,
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub table: Option<String>,
    pub group_column: Option<String>,
    pub order_column: Option<String>,
    pub dir: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtractionConfig {
    pub transcode_timeout_seconds: Option<u64>,
    pub io_timeout_seconds: Option<u64>,
    pub unit_timeout_seconds: Option<u64>,
    pub file_concurrency: Option<usize>,
    pub validation_ratio: Option<f64>,
    pub split_seed: Option<u64>,
    pub ffmpeg_binary: Option<String>,
    pub retry: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrchestratorConfig {
    pub poll_interval_seconds: Option<u64>,
    pub max_wait_minutes: Option<u64>,
    pub max_concurrent_units: Option<usize>,
    pub dispatch_timeout_seconds: Option<u64>,
    pub io_timeout_seconds: Option<u64>,
    pub reuse_existing_manifests: Option<bool>,
    pub unit_endpoint: Option<String>,
    pub unit_token: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to clipforge home (pipeline journals)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub storage: StorageSettings,
    pub metadata: MetadataSettings,
    pub extraction: ExtractionSettings,
    pub ffmpeg_binary: String,
    pub orchestrator: OrchestratorSettings,
    pub dispatch: DispatchSettings,
    pub angles: AngleTable,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    /// Directory standing in for the bucket
    pub root: PathBuf,
    /// URI prefix for object references in manifests
    pub uri_base: Option<String>,
    pub layout: StorageLayout,
}

#[derive(Debug, Clone)]
pub struct MetadataSettings {
    pub kind: MetadataKind,
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub table: String,
    pub group_column: String,
    pub order_column: String,
    pub dir: PathBuf,
}

/// How units are started by the orchestrator
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub max_wait: Duration,
    pub max_concurrent_units: usize,
    pub dispatch_timeout: Duration,
    /// Remote unit endpoint; units run in-process when unset
    pub unit_endpoint: Option<String>,
    /// Bearer token for the remote endpoint
    pub unit_token: Option<String>,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(120 * 60),
            max_concurrent_units: 8,
            dispatch_timeout: Duration::from_secs(10),
            unit_endpoint: None,
            unit_token: None,
        }
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".clipforge").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let config_file = find_config_file();
    let raw = match config_file {
        Some(ref path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };
    resolve(raw, config_file.as_deref())
}

/// Apply env overrides and defaults to a parsed config file
fn resolve(raw: ConfigFile, config_path: Option<&Path>) -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".clipforge");

    // .clipforge/ and the project root above it
    let clipforge_dir = config_path.and_then(Path::parent);
    let base_dir = clipforge_dir.and_then(Path::parent).unwrap_or(Path::new("."));
    let relative = |p: &str| resolve_path(base_dir, p);

    let home = if let Some(env_home) = env_var("CLIPFORGE_HOME") {
        PathBuf::from(env_home)
    } else if let (Some(dir), Some(home_path)) = (clipforge_dir, raw.paths.home.as_deref()) {
        resolve_path(dir, home_path)
    } else {
        default_home
    };

    let storage = StorageSettings {
        root: env_var("CLIPFORGE_STORAGE_ROOT")
            .map(PathBuf::from)
            .or_else(|| raw.storage.root.as_deref().map(relative))
            .unwrap_or_else(|| home.join("storage")),
        uri_base: raw.storage.uri_base,
        layout: {
            let defaults = StorageLayout::default();
            StorageLayout {
                source_prefix: raw.storage.source_prefix.unwrap_or(defaults.source_prefix),
                output_prefix: raw.storage.output_prefix.unwrap_or(defaults.output_prefix),
                combined_prefix: raw.storage.combined_prefix.unwrap_or(defaults.combined_prefix),
            }
        },
    };

    let url = env_var("CLIPFORGE_METADATA_URL").or(raw.metadata.url);
    let metadata = MetadataSettings {
        // A configured URL implies the REST backend unless told otherwise
        kind: raw.metadata.kind.unwrap_or(if url.is_some() {
            MetadataKind::Postgrest
        } else {
            MetadataKind::JsonDir
        }),
        url,
        api_key: env_var("CLIPFORGE_METADATA_KEY").or(raw.metadata.api_key),
        table: raw.metadata.table.unwrap_or_else(|| "plays".to_string()),
        group_column: raw
            .metadata
            .group_column
            .unwrap_or_else(|| "game_id".to_string()),
        order_column: raw
            .metadata
            .order_column
            .unwrap_or_else(|| "start_timestamp".to_string()),
        dir: raw
            .metadata
            .dir
            .as_deref()
            .map(relative)
            .unwrap_or_else(|| home.join("metadata")),
    };

    let ext = raw.extraction;
    let defaults = ExtractionSettings::default();
    let extraction = ExtractionSettings {
        transcode_timeout: ext
            .transcode_timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(defaults.transcode_timeout),
        io_timeout: ext
            .io_timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(defaults.io_timeout),
        unit_timeout: ext
            .unit_timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(defaults.unit_timeout),
        file_concurrency: ext.file_concurrency.unwrap_or(defaults.file_concurrency).max(1),
        validation_ratio: ext.validation_ratio.unwrap_or(defaults.validation_ratio),
        split_seed: ext.split_seed,
        retry: ext.retry.clone().unwrap_or(defaults.retry),
        work_dir: raw.paths.work_dir.as_deref().map(relative),
    };
    if !(0.0..=1.0).contains(&extraction.validation_ratio) {
        anyhow::bail!(
            "extraction.validation_ratio must be within 0..=1, got {}",
            extraction.validation_ratio
        );
    }

    let orch = raw.orchestrator;
    let orchestrator_defaults = OrchestratorSettings::default();
    let orchestrator = OrchestratorSettings {
        poll_interval: orch
            .poll_interval_seconds
            .map(Duration::from_secs)
            .unwrap_or(orchestrator_defaults.poll_interval),
        io_timeout: orch
            .io_timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(orchestrator_defaults.io_timeout),
        reuse_existing_manifests: orch
            .reuse_existing_manifests
            .unwrap_or(orchestrator_defaults.reuse_existing_manifests),
        retry: ext.retry.unwrap_or(orchestrator_defaults.retry),
    };

    let dispatch_defaults = DispatchSettings::default();
    let dispatch = DispatchSettings {
        max_wait: orch
            .max_wait_minutes
            .map(|m| Duration::from_secs(m * 60))
            .unwrap_or(dispatch_defaults.max_wait),
        max_concurrent_units: orch
            .max_concurrent_units
            .unwrap_or(dispatch_defaults.max_concurrent_units)
            .max(1),
        dispatch_timeout: orch
            .dispatch_timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(dispatch_defaults.dispatch_timeout),
        unit_endpoint: orch.unit_endpoint,
        unit_token: env_var("CLIPFORGE_UNIT_TOKEN").or(orch.unit_token),
    };

    let angles = raw.angles.unwrap_or_default();
    angles.validate().context("Invalid angles table")?;

    Ok(ResolvedConfig {
        home,
        config_file: config_path.map(Path::to_path_buf),
        storage,
        metadata,
        extraction,
        ffmpeg_binary: ext.ffmpeg_binary.unwrap_or_else(|| "ffmpeg".to_string()),
        orchestrator,
        dispatch,
        angles,
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the clipforge home directory.
pub fn clipforge_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the runs directory ($CLIPFORGE_HOME/runs)
pub fn runs_dir() -> Result<PathBuf> {
    Ok(config()?.home.join("runs"))
}
