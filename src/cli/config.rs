use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_DOMAIN: &str = "http://localhost:8000";
pub const DEFAULT_USER_AGENT: &str = "hakai";
pub const DEFAULT_SSH_KEY: &str = "~/.ssh/id_rsa";
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Load-time problems with a scenario document. All of them abort the run
/// before any request is sent.
#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error("invalid domain '{domain}': {source}")]
    InvalidDomain {
        domain: String,
        source: url::ParseError,
    },

    #[error("unsupported http_version {0} (expected 1 or 2)")]
    UnsupportedHttpVersion(u8),

    #[error("invalid node '{host}': {reason}")]
    InvalidNode { host: String, reason: String },

    #[error("action #{index} ({path}): invalid scan pattern: {source}")]
    InvalidScanPattern {
        index: usize,
        path: String,
        source: regex::Error,
    },

    #[error("action #{index} ({path}): invalid method '{method}'")]
    InvalidMethod {
        index: usize,
        path: String,
        method: String,
    },
}

/// A variable pool backed by a line-delimited file.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct VarSource {
    pub name: String,
    /// Relative paths are resolved against the scenario document's directory.
    pub file: PathBuf,
}

/// One HTTP step of a scenario.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Action {
    /// Templated path, may carry its own query string.
    pub path: String,
    /// HTTP method, GET when absent.
    pub method: Option<String>,
    /// Templated raw request body.
    pub content: Option<String>,
    /// Form fields, only used for POST. Values are templated.
    pub post_params: Option<BTreeMap<String, String>>,
    pub content_type: Option<String>,
    /// Regular expression the response body must match. Named captures feed
    /// the extracted variable pool.
    pub scan: Option<String>,
}

impl Action {
    pub fn method(&self) -> String {
        self.method
            .as_deref()
            .map(str::to_uppercase)
            .unwrap_or_else(|| "GET".to_string())
    }

    pub fn is_form_post(&self) -> bool {
        self.method() == "POST" && self.post_params.is_some()
    }
}

/// A node entry as written in the scenario document.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct NodeSpec {
    #[serde(default = "default_proc")]
    pub proc: usize,
    /// `[user@]host[:port]`
    pub host: Option<String>,
    pub ssh_key: Option<String>,
}

fn default_proc() -> usize {
    1
}

/// A resolved execution target.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub procs: usize,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub ssh_key: PathBuf,
}

impl Node {
    pub fn is_local(&self) -> bool {
        self.host == "localhost"
    }

    pub fn address(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }
}

impl NodeSpec {
    pub fn resolve(&self) -> Result<Node, ScenarioError> {
        let raw = self.host.clone().unwrap_or_default();
        let invalid = |reason: &str| ScenarioError::InvalidNode {
            host: raw.clone(),
            reason: reason.to_string(),
        };

        if self.proc == 0 {
            return Err(invalid("proc must be at least 1"));
        }

        let (user, host_port) = match raw.split_once('@') {
            Some((user, rest)) if !user.is_empty() => (user.to_string(), rest),
            Some(_) => return Err(invalid("empty user name")),
            None => (
                current_user().ok_or_else(|| invalid("cannot determine current user"))?,
                raw.as_str(),
            ),
        };

        let (host, port) = match host_port.split_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| invalid("port is not a number"))?;
                (host.to_string(), port)
            }
            None => (host_port.to_string(), DEFAULT_SSH_PORT),
        };
        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        let key = self.ssh_key.as_deref().unwrap_or(DEFAULT_SSH_KEY);

        Ok(Node {
            procs: self.proc,
            host,
            port,
            user,
            ssh_key: expand_home(key),
        })
    }
}

fn current_user() -> Option<String> {
    ["USER", "LOGNAME", "USERNAME"]
        .iter()
        .find_map(|k| std::env::var(k).ok().filter(|v| !v.is_empty()))
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix('~'), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest.trim_start_matches('/')),
        _ => PathBuf::from(path),
    }
}

/// The full scenario document.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Scenario {
    pub domain: String,
    pub user_agent: String,
    /// Print the per-path latency table in the final report.
    pub show_report: bool,
    pub gzip: bool,
    /// Transport timeout in seconds.
    pub timeout: u64,
    pub http_version: u8,
    pub headers: BTreeMap<String, String>,
    pub query_params: BTreeMap<String, String>,
    pub consts: HashMap<String, String>,
    pub vars: Vec<VarSource>,
    pub exvars: Vec<VarSource>,
    pub actions: Vec<Action>,
    pub nodes: Vec<NodeSpec>,
    /// Directory of the scenario document; variable files are relative to it.
    #[serde(skip)]
    pub root: PathBuf,
}

impl Scenario {
    /// Read, default and validate a scenario document.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read scenario '{}'", path.display()))?;
        let mut scenario = Self::from_yaml(&raw)
            .with_context(|| format!("failed to parse scenario '{}'", path.display()))?;
        scenario.root = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(scenario)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let mut scenario: Scenario = serde_yaml::from_str(raw)?;
        scenario.apply_defaults();
        scenario.validate()?;
        Ok(scenario)
    }

    fn apply_defaults(&mut self) {
        if self.domain.is_empty() {
            self.domain = DEFAULT_DOMAIN.to_string();
        }
        if self.user_agent.is_empty() {
            self.user_agent = DEFAULT_USER_AGENT.to_string();
        }
        if self.timeout == 0 {
            self.timeout = 1;
        }
        if self.http_version == 0 {
            self.http_version = 1;
        }
    }

    fn validate(&self) -> Result<(), ScenarioError> {
        url::Url::parse(&self.domain).map_err(|source| ScenarioError::InvalidDomain {
            domain: self.domain.clone(),
            source,
        })?;
        if !matches!(self.http_version, 1 | 2) {
            return Err(ScenarioError::UnsupportedHttpVersion(self.http_version));
        }
        for (index, action) in self.actions.iter().enumerate() {
            if http::Method::from_bytes(action.method().as_bytes()).is_err() {
                return Err(ScenarioError::InvalidMethod {
                    index,
                    path: action.path.clone(),
                    method: action.method(),
                });
            }
            if let Some(pattern) = &action.scan {
                regex::Regex::new(pattern).map_err(|source| ScenarioError::InvalidScanPattern {
                    index,
                    path: action.path.clone(),
                    source,
                })?;
            }
        }
        Ok(())
    }

    pub fn base_url(&self) -> Result<url::Url, ScenarioError> {
        url::Url::parse(&self.domain).map_err(|source| ScenarioError::InvalidDomain {
            domain: self.domain.clone(),
            source,
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn resolve_nodes(&self) -> Result<Vec<Node>, ScenarioError> {
        self.nodes.iter().map(NodeSpec::resolve).collect()
    }

    pub fn source_path(&self, source: &VarSource) -> PathBuf {
        self.root.join(&source.file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_defaults() {
        let scenario = Scenario::from_yaml("actions:\n  - path: /\n").unwrap();
        assert_eq!(scenario.domain, DEFAULT_DOMAIN);
        assert_eq!(scenario.user_agent, DEFAULT_USER_AGENT);
        assert_eq!(scenario.timeout(), Duration::from_secs(1));
        assert_eq!(scenario.http_version, 1);
        assert!(!scenario.gzip);
        assert_eq!(scenario.actions[0].method(), "GET");
    }

    #[test]
    fn test_scenario_full_document() {
        let yaml = r#"
domain: https://example.com
user_agent: bench
gzip: true
timeout: 5
http_version: 2
show_report: true
headers:
  X-Token: "%(token)%"
query_params:
  lang: ja
consts:
  token: abc
vars:
  - name: user
    file: users.txt
exvars:
  - name: account
    file: accounts.txt
actions:
  - path: /login
    method: post
    post_params:
      user: "%(user)%"
    scan: 'token=(?P<session>\w+)'
  - path: /home?tab=1
nodes:
  - proc: 2
    host: bench@10.0.0.1:2222
    ssh_key: /keys/id
"#;
        let scenario = Scenario::from_yaml(yaml).unwrap();
        assert_eq!(scenario.http_version, 2);
        assert_eq!(scenario.headers["X-Token"], "%(token)%");
        assert_eq!(scenario.vars[0].file, PathBuf::from("users.txt"));
        assert!(scenario.actions[0].is_form_post());
        assert!(!scenario.actions[1].is_form_post());

        let nodes = scenario.resolve_nodes().unwrap();
        assert_eq!(
            nodes[0],
            Node {
                procs: 2,
                host: "10.0.0.1".to_string(),
                port: 2222,
                user: "bench".to_string(),
                ssh_key: PathBuf::from("/keys/id"),
            }
        );
        assert!(!nodes[0].is_local());
    }

    #[test]
    fn test_node_defaults() {
        let spec = NodeSpec {
            proc: 1,
            host: Some("root@localhost".to_string()),
            ssh_key: None,
        };
        let node = spec.resolve().unwrap();
        assert!(node.is_local());
        assert_eq!(node.port, DEFAULT_SSH_PORT);
        assert!(node.ssh_key.ends_with(".ssh/id_rsa"));
    }

    #[test]
    fn test_invalid_node_port_is_rejected() {
        // nodes are only resolved by the coordinator, node processes never look
        let scenario = Scenario::from_yaml("nodes:\n  - host: a@b:xyz\n").unwrap();
        let err = scenario.resolve_nodes().unwrap_err();
        assert!(err.to_string().contains("port"), "{}", err);
    }

    #[test]
    fn test_invalid_scan_pattern_fails_load() {
        let yaml = r#"
actions:
  - path: /ok
  - path: /broken
    scan: '(unclosed'
nodes:
  - proc: 1
    host: u@localhost
"#;
        let err = Scenario::from_yaml(yaml).unwrap_err();
        let err = err.downcast::<ScenarioError>().unwrap();
        assert!(
            matches!(err, ScenarioError::InvalidScanPattern { index: 1, .. }),
            "{}",
            err
        );
    }

    #[test]
    fn test_zero_proc_is_rejected() {
        let spec = NodeSpec {
            proc: 0,
            host: Some("u@h".to_string()),
            ssh_key: None,
        };
        assert!(matches!(
            spec.resolve(),
            Err(ScenarioError::InvalidNode { .. })
        ));
    }

    #[test]
    fn test_invalid_http_version() {
        let err = Scenario::from_yaml("http_version: 3\n").unwrap_err();
        assert!(err.to_string().contains("http_version"));
    }

    #[test]
    fn test_invalid_domain() {
        assert!(Scenario::from_yaml("domain: \"not a url\"\n").is_err());
    }

    #[test]
    fn test_malformed_yaml() {
        assert!(Scenario::from_yaml("actions: [path: \n").is_err());
    }

    #[test]
    fn test_load_sets_root() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scenario.yml");
        std::fs::write(&path, "actions:\n  - path: /\n").unwrap();
        let scenario = Scenario::load(&path).unwrap();
        assert_eq!(scenario.root, dir.path());
        let source = VarSource {
            name: "a".to_string(),
            file: PathBuf::from("a.txt"),
        };
        assert_eq!(scenario.source_path(&source), dir.path().join("a.txt"));
    }
}
