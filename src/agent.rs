//! Main Map Local agent implementation.

use crate::config::{FallbackPolicy, GlobalSettings, MapLocalConfig, Mode};
use crate::error::{ConfigError, FileError};
use crate::exchange::Exchange;
use crate::hook::{Action, BlockResponse, Interceptor};
use crate::matcher::{find_match, RequestTarget};
use crate::resolver::FileResolver;
use crate::rules::{MappingRule, RuleStore};
use crate::substitute::ResponseSubstitutor;
use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, error, info, warn};

/// Map Local Agent
///
/// Replaces responses of matching exchanges with the content of local files.
pub struct MapLocalAgent {
    settings: GlobalSettings,
    store: RuleStore,
    resolver: FileResolver,
    substitutor: ResponseSubstitutor,
    /// Total exchanges processed.
    requests_total: AtomicU64,
    /// Exchanges answered from a local file.
    requests_mapped: AtomicU64,
    /// Exchanges no rule matched.
    requests_unmatched: AtomicU64,
    /// Exchanges whose mapped file could not be served.
    requests_failed: AtomicU64,
    /// Exchanges skipped because of the mode or scope.
    requests_skipped: AtomicU64,
    /// Whether the agent is draining (passes everything through).
    draining: AtomicBool,
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AgentStats {
    pub requests_total: u64,
    pub requests_mapped: u64,
    pub requests_unmatched: u64,
    pub requests_failed: u64,
    pub requests_skipped: u64,
}

/// Internal outcome, counted and logged before becoming an [`Action`].
enum Outcome {
    Skipped,
    Unmatched,
    Mapped(Action),
    Failed(Action),
}

impl MapLocalAgent {
    /// Create a new agent with the given configuration.
    pub fn new(config: MapLocalConfig) -> Result<Self, ConfigError> {
        let store = RuleStore::from_config(&config)?;
        let settings = config.settings;

        info!(
            rules = config.rules.len(),
            mode = ?settings.mode,
            fallback = ?settings.fallback,
            "Map local agent initialized"
        );

        Ok(Self {
            resolver: FileResolver::new(&settings.cache),
            substitutor: ResponseSubstitutor::new(settings.default_status),
            settings,
            store,
            requests_total: AtomicU64::new(0),
            requests_mapped: AtomicU64::new(0),
            requests_unmatched: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            requests_skipped: AtomicU64::new(0),
            draining: AtomicBool::new(false),
        })
    }

    /// Create from a YAML configuration string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config = MapLocalConfig::from_yaml(yaml)?;
        Ok(Self::new(config)?)
    }

    /// Replace the rule set (rules, mode, scope, root).
    ///
    /// On error the previous rules stay active. Cache and fallback settings
    /// are fixed for the agent's lifetime.
    pub fn reload(&self, config: &MapLocalConfig) -> Result<(), ConfigError> {
        match self.store.load_config(config) {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(error = %e, "Rule reload rejected, keeping previous rules");
                Err(e)
            }
        }
    }

    pub fn rules(&self) -> &RuleStore {
        &self.store
    }

    pub fn resolver(&self) -> &FileResolver {
        &self.resolver
    }

    /// Check if the agent is draining.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> AgentStats {
        AgentStats {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_mapped: self.requests_mapped.load(Ordering::Relaxed),
            requests_unmatched: self.requests_unmatched.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            requests_skipped: self.requests_skipped.load(Ordering::Relaxed),
        }
    }

    /// Run the full pipeline for one exchange.
    async fn evaluate(&self, exchange: &Exchange) -> Outcome {
        if self.is_draining() {
            debug!("Agent is draining, passing through exchange");
            return Outcome::Skipped;
        }

        let snapshot = self.store.snapshot();
        let request = RequestTarget::new(&exchange.method, &exchange.url);
        match snapshot.mode {
            Mode::Safe => return Outcome::Skipped,
            Mode::Protect if !snapshot.in_scope(&request.url) => {
                debug!(url = %exchange.url, "Out of scope in protect mode");
                return Outcome::Skipped;
            }
            _ => {}
        }

        let result = find_match(&request, &snapshot);
        let rule = match result.rule {
            Some(rule) => rule,
            None => {
                if self.settings.log_unmatched {
                    debug!(method = %exchange.method, url = %exchange.url, "No matching rule");
                }
                return Outcome::Unmatched;
            }
        };

        match self.resolver.resolve(&rule.local_path).await {
            Ok(entry) => {
                if self.settings.log_matches {
                    info!(
                        rule_id = %rule.id,
                        method = %exchange.method,
                        url = %exchange.url,
                        path = %entry.path.display(),
                        size = entry.size,
                        "Mapped response to local file"
                    );
                }
                let replacement = self.substitutor.substitute(
                    &exchange.method,
                    exchange.response.as_ref(),
                    &rule,
                    &entry,
                );
                Outcome::Mapped(Action::Replace(replacement))
            }
            Err(e) => Outcome::Failed(self.fallback(&rule, exchange, &e)),
        }
    }

    fn fallback(&self, rule: &MappingRule, exchange: &Exchange, err: &FileError) -> Action {
        warn!(
            rule_id = %rule.id,
            url = %exchange.url,
            path = %rule.local_path.display(),
            error_kind = err.kind(),
            error = %err,
            fallback = ?self.settings.fallback,
            "Failed to serve mapped file"
        );
        match self.settings.fallback {
            FallbackPolicy::Passthrough => Action::Passthrough,
            FallbackPolicy::Block => {
                Action::Block(BlockResponse::new(self.settings.block_status, err.to_string()))
            }
        }
    }
}

#[async_trait]
impl Interceptor for MapLocalAgent {
    fn name(&self) -> &str {
        "map-local"
    }

    async fn on_exchange(&self, exchange: &Exchange) -> Action {
        self.requests_total.fetch_add(1, Ordering::Relaxed);

        let outcome = match AssertUnwindSafe(self.evaluate(exchange))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(url = %exchange.url, "Panic while mapping exchange, passing through");
                Outcome::Failed(Action::Passthrough)
            }
        };

        match outcome {
            Outcome::Skipped => {
                self.requests_skipped.fetch_add(1, Ordering::Relaxed);
                Action::Passthrough
            }
            Outcome::Unmatched => {
                self.requests_unmatched.fetch_add(1, Ordering::Relaxed);
                Action::Passthrough
            }
            Outcome::Mapped(action) => {
                self.requests_mapped.fetch_add(1, Ordering::Relaxed);
                action
            }
            Outcome::Failed(action) => {
                self.requests_failed.fetch_add(1, Ordering::Relaxed);
                action
            }
        }
    }

    async fn on_configure(&self, config: serde_json::Value) -> Result<(), String> {
        if config.is_null() {
            return Ok(());
        }

        info!("Received configuration update");
        let config: MapLocalConfig =
            serde_json::from_value(config).map_err(|e| format!("invalid configuration: {}", e))?;
        self.reload(&config).map_err(|e| e.to_string())
    }

    async fn on_shutdown(&self) {
        info!(stats = ?self.stats(), "Map local agent shutdown requested");
        self.draining.store(true, Ordering::SeqCst);
        self.resolver.clear().await;
    }
}
