//! Configuration for the Map Local agent.
//!
//! Defines mapping rules, the operating mode and file cache settings.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for the Map Local agent.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct MapLocalConfig {
    /// Ordered list of mapping rules
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,

    /// Global settings
    #[serde(default)]
    pub settings: GlobalSettings,
}

impl MapLocalConfig {
    /// Load configuration from a YAML file.
    ///
    /// A relative `settings.root` is resolved against the directory holding
    /// the configuration file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml(&content)?;
        if let (Some(root), Some(parent)) = (&config.settings.root, path.parent()) {
            if root.is_relative() {
                config.settings.root = Some(parent.join(root));
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string without validating it.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Validate the configuration by compiling every rule and scope pattern.
    pub fn validate(&self) -> anyhow::Result<()> {
        crate::rules::RuleSet::compile(self)?;
        Ok(())
    }
}

/// A single mapping rule as written in the configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleDefinition {
    /// Unique identifier; defaults to `rule-<index>`
    #[serde(default)]
    pub id: Option<String>,

    /// Optional name/description
    #[serde(default)]
    pub name: Option<String>,

    /// URL pattern
    pub pattern: String,

    /// How `pattern` is interpreted
    #[serde(default, rename = "match")]
    pub match_kind: PatternKind,

    /// Case-insensitive path/URL matching (the host is always case-insensitive)
    #[serde(default)]
    pub ignore_case: bool,

    /// HTTP method(s) to match (empty = any)
    #[serde(default)]
    pub methods: Vec<String>,

    /// File served for matching requests, absolute or relative to the root
    #[serde(alias = "localPath")]
    pub local_path: String,

    /// Priority (higher = matched first, ties keep declaration order)
    #[serde(default)]
    pub priority: i32,

    /// Whether this rule is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Status code of the replacement response
    #[serde(default, alias = "statusOverride")]
    pub status_override: Option<u16>,

    /// Content type of the replacement response
    #[serde(default, alias = "mimeOverride")]
    pub mime_override: Option<String>,

    /// Extra headers set on the replacement response, applied in name order
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl RuleDefinition {
    /// Shorthand for an enabled exact rule with default settings.
    pub fn new(pattern: impl Into<String>, local_path: impl Into<String>) -> Self {
        Self {
            id: None,
            name: None,
            pattern: pattern.into(),
            match_kind: PatternKind::default(),
            ignore_case: false,
            methods: Vec::new(),
            local_path: local_path.into(),
            priority: 0,
            enabled: true,
            status_override: None,
            mime_override: None,
            headers: BTreeMap::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// How a rule pattern is compared against the request URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    /// Same scheme, host and path (and query, when the pattern has one)
    #[default]
    Exact,
    /// Pattern occurs anywhere in the URL
    Contains,
    /// Glob over the whole URL, `*` also spans `/`
    Wildcard,
    /// Regular expression searched anywhere in the URL
    Regex,
}

/// Operating mode of the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Map every matching exchange
    #[default]
    Standard,
    /// Only map exchanges whose URL is in scope
    Protect,
    /// Never map anything
    Safe,
}

/// What to do when a rule matched but its file could not be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Forward the original response and log the failure
    #[default]
    Passthrough,
    /// Answer with a block page
    Block,
}

/// Global settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalSettings {
    /// Directory every local path must stay inside; relative paths are
    /// resolved against it
    #[serde(default)]
    pub root: Option<PathBuf>,

    /// Operating mode
    #[serde(default)]
    pub mode: Mode,

    /// URL regexes that are in scope for `protect` mode
    #[serde(default)]
    pub scope: Vec<String>,

    /// Behaviour when a mapped file cannot be served
    #[serde(default)]
    pub fallback: FallbackPolicy,

    /// Status code of the block page
    #[serde(default = "default_block_status")]
    pub block_status: u16,

    /// Status code of replacement responses without an override
    #[serde(default = "default_status")]
    pub default_status: u16,

    /// Log every mapped exchange
    #[serde(default = "default_true")]
    pub log_matches: bool,

    /// Log exchanges no rule matched
    #[serde(default)]
    pub log_unmatched: bool,

    /// File cache settings
    #[serde(default)]
    pub cache: CacheSettings,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            root: None,
            mode: Mode::default(),
            scope: Vec::new(),
            fallback: FallbackPolicy::default(),
            block_status: default_block_status(),
            default_status: default_status(),
            log_matches: true,
            log_unmatched: false,
            cache: CacheSettings::default(),
        }
    }
}

fn default_block_status() -> u16 {
    502
}

fn default_status() -> u16 {
    200
}

/// File cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSettings {
    /// Maximum age of a cache entry in seconds (0 = only mtime invalidation)
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Largest file that will be served, in bytes
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Read timeout in milliseconds
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Maximum number of cached files
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl CacheSettings {
    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_secs > 0).then(|| Duration::from_secs(self.ttl_secs))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            max_file_size: default_max_file_size(),
            read_timeout_ms: default_read_timeout_ms(),
            max_entries: default_max_entries(),
        }
    }
}

fn default_ttl_secs() -> u64 {
    30
}

fn default_max_file_size() -> u64 {
    10 * 1024 * 1024
}

fn default_read_timeout_ms() -> u64 {
    2_000
}

fn default_max_entries() -> usize {
    256
}
