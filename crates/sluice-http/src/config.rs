use std::{collections::HashMap, fs, path::Path, sync::Arc};

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::{
    handler::{HandlerOptions, HandlerRegistry, HttpHandler},
    session::HttpRequestData,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file")]
    Io(#[from] std::io::Error),
    #[error("malformed config file")]
    Parse(#[from] serde_yaml::Error),
    #[error("no handler module named `{0}` is registered")]
    UnknownModule(String),
    #[error("url rule `{0}` is not a valid regex")]
    BadRegex(String),
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}

fn one() -> usize {
    1
}

fn default_handler_pool() -> usize {
    2
}

fn default_listen_queue() -> i32 {
    128
}

/// Top-level YAML configuration of the server binary.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_address")]
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub handlers: Vec<HandlerSpec>,
    #[serde(default)]
    pub host: Vec<VHostSpec>,
    #[serde(default = "one")]
    pub read_stage_pool_size: usize,
    #[serde(default = "one")]
    pub write_stage_pool_size: usize,
    #[serde(default = "one")]
    pub recycle_threshold: usize,
    #[serde(default = "default_handler_pool")]
    pub handler_stage_pool_size: usize,
    #[serde(default = "default_listen_queue")]
    pub listen_queue_size: i32,
    /// Seconds; 0 disables idle eviction.
    #[serde(default)]
    pub idle_timeout: u32,
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Ok(Self::parse(&text)?)
    }

    pub fn parse(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }
}

/// One `handlers:` entry: a named instance of a handler module plus
/// whatever options the module understands.
#[derive(Debug, Deserialize)]
pub struct HandlerSpec {
    pub name: String,
    pub module: String,
    #[serde(flatten)]
    pub options: HashMap<String, serde_yaml::Value>,
}

impl HandlerSpec {
    /// Options are free-form scalars in YAML; handlers consume strings.
    pub fn handler_options(&self) -> HandlerOptions {
        let mut options = HandlerOptions::new();
        for (key, value) in &self.options {
            let text = match value {
                serde_yaml::Value::String(s) => s.clone(),
                serde_yaml::Value::Number(n) => n.to_string(),
                serde_yaml::Value::Bool(b) => b.to_string(),
                other => {
                    warn!(key = %key, value = ?other, "ignoring non-scalar handler option");
                    continue;
                }
            };
            options.set(key, text);
        }
        options
    }
}

#[derive(Debug, Deserialize)]
pub struct VHostSpec {
    pub domain: String,
    #[serde(rename = "url-rules")]
    pub url_rules: Vec<UrlRuleSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum UrlRuleSpec {
    /// Path prefix match; on match the prefix is stripped from the request
    /// path.
    Prefix { prefix: String, chain: Vec<String> },
    /// Full-uri regex match, no rewrite.
    Regex { regex: String, chain: Vec<String> },
}

enum RuleMatcher {
    Prefix(String),
    Regex(regex::Regex),
}

/// A compiled URL rule bound to its handler chain.
pub struct UrlRule {
    matcher: RuleMatcher,
    pub chain: Vec<Arc<dyn HttpHandler>>,
}

impl UrlRule {
    /// Checks the rule against a request; prefix matches rewrite the path.
    fn matches(&self, request: &mut HttpRequestData) -> bool {
        match &self.matcher {
            RuleMatcher::Prefix(prefix) => {
                if !request.path.starts_with(prefix.as_str()) {
                    return false;
                }
                let rest = request.path[prefix.len()..].to_string();
                request.path =
                    if rest.starts_with('/') { rest } else { format!("/{rest}") };
                true
            }
            RuleMatcher::Regex(regex) => regex.is_match(&request.uri),
        }
    }
}

/// Virtual-host rule tree: domain → ordered rule list, with a `default`
/// domain as the fallback.
pub struct VHostConfig {
    hosts: HashMap<String, Vec<Arc<UrlRule>>>,
}

impl VHostConfig {
    pub fn empty() -> Self {
        Self { hosts: HashMap::new() }
    }

    /// Compiles the vhost blocks, resolving handler chains against the
    /// registry. Unresolvable handler names are skipped with a warning.
    pub fn build(specs: &[VHostSpec], registry: &HandlerRegistry) -> Result<Self, ConfigError> {
        let mut hosts = HashMap::new();
        for spec in specs {
            let mut rules = Vec::new();
            for rule_spec in &spec.url_rules {
                let (matcher, chain_names) = match rule_spec {
                    UrlRuleSpec::Prefix { prefix, chain } => {
                        (RuleMatcher::Prefix(prefix.clone()), chain)
                    }
                    UrlRuleSpec::Regex { regex, chain } => {
                        let compiled = regex::Regex::new(regex)
                            .map_err(|_| ConfigError::BadRegex(regex.clone()))?;
                        (RuleMatcher::Regex(compiled), chain)
                    }
                };
                let mut chain = Vec::new();
                for name in chain_names {
                    match registry.get_instance(name) {
                        Some(handler) => chain.push(handler),
                        None => warn!(name = %name, "cannot find handler instance"),
                    }
                }
                rules.push(Arc::new(UrlRule { matcher, chain }));
            }
            hosts.insert(spec.domain.clone(), rules);
        }
        Ok(Self { hosts })
    }

    /// Binds a request to the first matching rule of its host, falling back
    /// to the `default` domain. Prefix matches rewrite the request path.
    pub fn match_uri(&self, host: &str, request: &mut HttpRequestData) -> Option<Arc<UrlRule>> {
        let rules = self
            .hosts
            .get(host)
            .or_else(|| host.rsplit_once(':').and_then(|(bare, _)| self.hosts.get(bare)))
            .or_else(|| self.hosts.get("default"))?;
        rules.iter().find(|rule| rule.matches(request)).map(Arc::clone)
    }
}
