//! Rule compilation and the atomically swapped rule store.
//!
//! A [`RuleSet`] is built completely before it is published, so a reload that
//! fails validation never touches the active set and readers never observe a
//! half-updated one.

use crate::config::{MapLocalConfig, Mode, PatternKind, RuleDefinition};
use crate::error::ConfigError;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use globset::{GlobBuilder, GlobMatcher};
use regex::{Regex, RegexBuilder};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// A compiled, immutable mapping rule.
#[derive(Debug)]
pub struct MappingRule {
    pub id: String,
    pub name: Option<String>,
    /// Pattern as written in the configuration
    pub source: String,
    pub kind: PatternKind,
    pub pattern: CompiledPattern,
    pub ignore_case: bool,
    /// Upper-cased method filter (empty = any)
    pub methods: Vec<String>,
    /// Resolved and normalised local path
    pub local_path: PathBuf,
    pub priority: i32,
    pub enabled: bool,
    pub status_override: Option<u16>,
    pub mime_override: Option<String>,
    pub headers: Vec<(String, String)>,
    /// Position in the configuration, used to break priority ties
    pub index: usize,
}

/// Pattern compiled once at load time.
#[derive(Debug)]
pub enum CompiledPattern {
    Exact(ExactTarget),
    Contains(String),
    Wildcard(GlobMatcher),
    Regex(Regex),
}

/// Components an exact rule compares against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExactTarget {
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
    pub query: Option<String>,
}

/// One published generation of rules.
#[derive(Debug)]
pub struct RuleSet {
    /// Rules in evaluation order: priority descending, then declaration order
    pub rules: Vec<Arc<MappingRule>>,
    pub mode: Mode,
    pub scope: Vec<Regex>,
    pub root: Option<PathBuf>,
    pub version: u64,
    pub loaded_at: DateTime<Utc>,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            mode: Mode::default(),
            scope: Vec::new(),
            root: None,
            version: 0,
            loaded_at: Utc::now(),
        }
    }
}

impl RuleSet {
    /// Compile a full configuration (rules, mode and scope).
    pub fn compile(config: &MapLocalConfig) -> Result<Self, ConfigError> {
        let settings = &config.settings;
        for (label, status) in [
            ("settings.block_status", settings.block_status),
            ("settings.default_status", settings.default_status),
        ] {
            if !(100..=599).contains(&status) {
                return Err(ConfigError::InvalidStatus {
                    rule_id: label.to_string(),
                    status,
                });
            }
        }

        let scope = settings
            .scope
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| ConfigError::InvalidPattern {
                    rule_id: "settings.scope".to_string(),
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let rules = compile_rules(&config.rules, settings.root.as_deref())?;

        Ok(Self {
            rules,
            mode: settings.mode,
            scope,
            root: settings.root.clone(),
            version: 0,
            loaded_at: Utc::now(),
        })
    }

    /// Whether `url` is covered by one of the scope patterns.
    pub fn in_scope(&self, url: &str) -> bool {
        self.scope.iter().any(|re| re.is_match(url))
    }

    pub fn enabled_count(&self) -> usize {
        self.rules.iter().filter(|r| r.enabled).count()
    }
}

/// Holds the active [`RuleSet`] behind an atomic pointer.
///
/// Readers take a snapshot without locking; a reload publishes a new set in a
/// single swap. Exchanges already holding a snapshot keep using it.
#[derive(Debug, Default)]
pub struct RuleStore {
    current: ArcSwap<RuleSet>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a full configuration.
    pub fn from_config(config: &MapLocalConfig) -> Result<Self, ConfigError> {
        let store = Self::new();
        store.load_config(config)?;
        Ok(store)
    }

    /// Current rule set.
    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.current.load_full()
    }

    /// Replace the rules, keeping the current mode, scope and root.
    pub fn load(&self, definitions: &[RuleDefinition]) -> Result<(), ConfigError> {
        let current = self.snapshot();
        let rules = compile_rules(definitions, current.root.as_deref())?;
        self.publish(RuleSet {
            rules,
            mode: current.mode,
            scope: current.scope.clone(),
            root: current.root.clone(),
            version: 0,
            loaded_at: Utc::now(),
        });
        Ok(())
    }

    /// Replace rules, mode, scope and root from a configuration.
    pub fn load_config(&self, config: &MapLocalConfig) -> Result<(), ConfigError> {
        let set = RuleSet::compile(config)?;
        self.publish(set);
        Ok(())
    }

    fn publish(&self, mut set: RuleSet) {
        set.version = self.current.load().version + 1;
        info!(
            version = set.version,
            rules = set.rules.len(),
            enabled = set.enabled_count(),
            mode = ?set.mode,
            "Rule set published"
        );
        self.current.store(Arc::new(set));
    }
}

/// Compile rule definitions into evaluation order.
fn compile_rules(
    definitions: &[RuleDefinition],
    root: Option<&Path>,
) -> Result<Vec<Arc<MappingRule>>, ConfigError> {
    let mut seen = HashSet::new();
    let mut rules = Vec::with_capacity(definitions.len());

    for (index, def) in definitions.iter().enumerate() {
        let id = def.id.clone().unwrap_or_else(|| format!("rule-{}", index));
        if !seen.insert(id.clone()) {
            return Err(ConfigError::DuplicateRuleId(id));
        }
        rules.push(compile_rule(id, index, def, root)?);
    }

    // Stable sort: equal priorities keep declaration order
    rules.sort_by(|a, b| b.priority.cmp(&a.priority));
    debug!(count = rules.len(), "Compiled mapping rules");

    Ok(rules.into_iter().map(Arc::new).collect())
}

fn compile_rule(
    id: String,
    index: usize,
    def: &RuleDefinition,
    root: Option<&Path>,
) -> Result<MappingRule, ConfigError> {
    if let Some(status) = def.status_override {
        if !(100..=599).contains(&status) {
            return Err(ConfigError::InvalidStatus { rule_id: id, status });
        }
    }

    let pattern = compile_pattern(&id, def)?;
    let local_path = resolve_local_path(&id, &def.local_path, root)?;

    Ok(MappingRule {
        name: def.name.clone(),
        source: def.pattern.clone(),
        kind: def.match_kind,
        pattern,
        ignore_case: def.ignore_case,
        methods: def.methods.iter().map(|m| m.to_uppercase()).collect(),
        local_path,
        priority: def.priority,
        enabled: def.enabled,
        status_override: def.status_override,
        mime_override: def.mime_override.clone(),
        headers: def
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        index,
        id,
    })
}

fn compile_pattern(id: &str, def: &RuleDefinition) -> Result<CompiledPattern, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidPattern {
        rule_id: id.to_string(),
        pattern: def.pattern.clone(),
        reason,
    };

    if def.pattern.trim().is_empty() {
        return Err(invalid("pattern is empty".to_string()));
    }

    match def.match_kind {
        PatternKind::Exact => {
            let url = url::Url::parse(&def.pattern).map_err(|e| invalid(e.to_string()))?;
            let host = url
                .host_str()
                .ok_or_else(|| invalid("pattern has no host".to_string()))?;
            let fold = |s: &str| {
                if def.ignore_case {
                    s.to_lowercase()
                } else {
                    s.to_string()
                }
            };
            Ok(CompiledPattern::Exact(ExactTarget {
                scheme: url.scheme().to_string(),
                host: host.to_ascii_lowercase(),
                port: url.port_or_known_default(),
                path: fold(url.path()),
                query: url.query().map(fold),
            }))
        }
        PatternKind::Contains => Ok(CompiledPattern::Contains(if def.ignore_case {
            def.pattern.to_lowercase()
        } else {
            def.pattern.clone()
        })),
        PatternKind::Wildcard => {
            let glob = GlobBuilder::new(&lowercase_authority(&def.pattern))
                .case_insensitive(def.ignore_case)
                .literal_separator(false)
                .build()
                .map_err(|e| invalid(e.to_string()))?;
            Ok(CompiledPattern::Wildcard(glob.compile_matcher()))
        }
        PatternKind::Regex => {
            let regex = RegexBuilder::new(&def.pattern)
                .case_insensitive(def.ignore_case)
                .build()
                .map_err(|e| invalid(e.to_string()))?;
            // Requests are matched with the host already lower-cased
            if !def.ignore_case && host_has_upper_case(&def.pattern) {
                return Err(invalid(
                    "host must be lower case unless ignore_case is set".to_string(),
                ));
            }
            Ok(CompiledPattern::Regex(regex))
        }
    }
}

/// Whether the host part of a regex pattern holds a literal upper-case letter.
///
/// The host is whatever follows `://` up to the next `/`, or a leading
/// dotted segment such as `API\.example\.com/`. Escapes (`\D`) and group
/// flags (`(?P<name>`) are not literals.
fn host_has_upper_case(pattern: &str) -> bool {
    let host = match pattern.find("://") {
        Some(pos) => {
            let rest = &pattern[pos + 3..];
            &rest[..rest.find('/').unwrap_or(rest.len())]
        }
        None => {
            let lead = pattern.trim_start_matches('^');
            let segment = &lead[..lead.find('/').unwrap_or(lead.len())];
            let dotted = segment.contains('.')
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '\\'));
            if !dotted {
                return false;
            }
            segment
        }
    };

    let mut prev = None;
    host.chars().any(|c| {
        let literal = c.is_ascii_uppercase() && !matches!(prev, Some('\\') | Some('?'));
        prev = Some(c);
        literal
    })
}

/// Lower-case the `scheme://authority` part of a URL-like pattern so host
/// comparison stays case-insensitive regardless of the rule's case mode.
fn lowercase_authority(pattern: &str) -> String {
    match pattern.find("://") {
        Some(pos) => {
            let rest_start = pos + 3;
            let authority_end = pattern[rest_start..]
                .find('/')
                .map(|i| rest_start + i)
                .unwrap_or(pattern.len());
            format!(
                "{}{}",
                pattern[..authority_end].to_ascii_lowercase(),
                &pattern[authority_end..]
            )
        }
        None => pattern.to_string(),
    }
}

/// Resolve a rule's local path against the root and reject traversal.
///
/// Purely lexical: the file does not need to exist at load time.
fn resolve_local_path(id: &str, raw: &str, root: Option<&Path>) -> Result<PathBuf, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidPath {
        rule_id: id.to_string(),
        path: raw.to_string(),
        reason: reason.to_string(),
    };

    if raw.trim().is_empty() {
        return Err(invalid("local path is empty"));
    }

    let raw_path = Path::new(raw);
    let candidate = match root {
        Some(root) if raw_path.is_relative() => root.join(raw_path),
        _ => raw_path.to_path_buf(),
    };
    let resolved = normalize(&candidate);

    if let Some(root) = root {
        let root = normalize(root);
        if !resolved.starts_with(&root) {
            return Err(invalid("path escapes the allowed root"));
        }
    }

    Ok(resolved)
}

/// Collapse `.` and `..` components without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = matches!(
                    out.components().next_back(),
                    Some(Component::Normal(_))
                ) && out.pop();
                if !popped && !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
