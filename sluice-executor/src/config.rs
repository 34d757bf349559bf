use std::{collections::BTreeMap, time::Duration};

use chrono::TimeDelta;
use sluice_client::SlaveNode;
use sluice_protocol::cluster::PeerNode;
use thiserror::Error;
use url::Url;

/// Errors that can occur during configuration validation
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Node name cannot be empty")]
    EmptyNodeName,

    #[error("Username and password cannot be empty")]
    EmptyCredentials,

    #[error("Max log lines must be at least 1")]
    InvalidLogLimit,

    #[error("{0} must be greater than zero")]
    InvalidTimeout(&'static str),

    #[error("Invalid master url '{url}': {message}")]
    InvalidMaster { url: String, message: String },

    #[error("Invalid repository '{0}', expected name=location")]
    InvalidRepository(String),

    #[error("Invalid property '{0}', expected name=value")]
    InvalidProperty(String),
}

/// Configuration for one node
#[derive(Debug, Clone)]
pub struct Config {
    /// How this node announces itself to others
    pub node: PeerNode,
    pub username: String,
    pub password: String,
    /// Buffered execution log lines kept per log channel
    pub max_log_lines: usize,
    /// Age after which log lines are dropped, kept until removal when unset
    pub log_retention: Option<TimeDelta>,
    /// Age after which finished executions are removed
    pub object_retention: TimeDelta,
    pub janitor_interval: Duration,
    /// Peers that did not register again within this window are reported inactive
    pub peer_timeout: TimeDelta,
    /// Start value of sequences created on first use, unknown sequences are rejected when unset
    pub sequence_auto_start: Option<i64>,
    /// Masters this node registers with
    pub masters: Vec<SlaveNode>,
    /// Metadata repositories by name
    pub repositories: Vec<(String, String)>,
    /// Served to peers that read this node's properties
    pub properties: BTreeMap<String, String>,
}

impl Config {
    /// Create a new config with validation and default limits
    pub fn try_new(
        node: PeerNode,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let username = username.into();
        let password = password.into();

        if node.name.trim().is_empty() {
            return Err(ConfigError::EmptyNodeName);
        }
        if username.is_empty() || password.is_empty() {
            return Err(ConfigError::EmptyCredentials);
        }

        Ok(Self {
            node,
            username,
            password,
            max_log_lines: 5000,
            log_retention: None,
            object_retention: TimeDelta::minutes(1440),
            janitor_interval: Duration::from_secs(60),
            peer_timeout: TimeDelta::minutes(5),
            sequence_auto_start: None,
            masters: vec![],
            repositories: vec![],
            properties: BTreeMap::new(),
        })
    }

    pub fn with_log_limits(
        mut self,
        max_lines: usize,
        retention_minutes: Option<u64>,
    ) -> Result<Self, ConfigError> {
        if max_lines == 0 {
            return Err(ConfigError::InvalidLogLimit);
        }

        self.max_log_lines = max_lines;
        self.log_retention = match retention_minutes {
            Some(0) => return Err(ConfigError::InvalidTimeout("Log retention")),
            Some(minutes) => Some(minutes_delta(minutes)),
            None => None,
        };
        Ok(self)
    }

    pub fn with_object_retention(mut self, minutes: u64) -> Result<Self, ConfigError> {
        if minutes == 0 {
            return Err(ConfigError::InvalidTimeout("Object retention"));
        }

        self.object_retention = minutes_delta(minutes);
        Ok(self)
    }

    pub fn with_janitor_interval(mut self, interval: Duration) -> Result<Self, ConfigError> {
        if interval.is_zero() {
            return Err(ConfigError::InvalidTimeout("Janitor interval"));
        }

        self.janitor_interval = interval;
        Ok(self)
    }

    pub fn with_peer_timeout(mut self, seconds: u64) -> Result<Self, ConfigError> {
        if seconds == 0 {
            return Err(ConfigError::InvalidTimeout("Peer timeout"));
        }

        self.peer_timeout = i64::try_from(seconds)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX);
        Ok(self)
    }

    pub fn with_sequence_auto_start(mut self, start: Option<i64>) -> Self {
        self.sequence_auto_start = start;
        self
    }

    /// Register with masters given as urls, using this node's credentials
    pub fn with_masters<'a>(
        mut self,
        urls: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self, ConfigError> {
        self.masters = urls
            .into_iter()
            .map(|url| master_node(url, &self.username, &self.password))
            .collect::<Result<_, _>>()?;
        Ok(self)
    }

    /// Repositories given as `name=location`
    pub fn with_repositories<'a>(
        mut self,
        specs: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self, ConfigError> {
        self.repositories = specs
            .into_iter()
            .map(|spec| {
                named_value(spec).ok_or_else(|| ConfigError::InvalidRepository(spec.to_string()))
            })
            .collect::<Result<_, _>>()?;
        Ok(self)
    }

    /// Node properties given as `name=value`, a later name overrides an earlier one
    pub fn with_properties<'a>(
        mut self,
        specs: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self, ConfigError> {
        self.properties = specs
            .into_iter()
            .map(|spec| {
                named_value(spec).ok_or_else(|| ConfigError::InvalidProperty(spec.to_string()))
            })
            .collect::<Result<_, _>>()?;
        Ok(self)
    }
}

fn named_value(spec: &str) -> Option<(String, String)> {
    match spec.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Some((name.trim().to_string(), value.trim().to_string()))
        }
        _ => None,
    }
}

fn minutes_delta(minutes: u64) -> TimeDelta {
    i64::try_from(minutes)
        .ok()
        .and_then(TimeDelta::try_minutes)
        .unwrap_or(TimeDelta::MAX)
}

fn master_node(raw: &str, username: &str, password: &str) -> Result<SlaveNode, ConfigError> {
    let invalid = |message: &str| ConfigError::InvalidMaster {
        url: raw.to_string(),
        message: message.to_string(),
    };

    let url = Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;
    let hostname = url.host_str().ok_or_else(|| invalid("missing host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| invalid("missing port"))?;

    let web_app_path = Some(url.path().trim_matches('/'))
        .filter(|path| !path.is_empty())
        .map(String::from);

    Ok(SlaveNode {
        web_app_path,
        master: true,
        ssl: url.scheme() == "https",
        ..SlaveNode::new(hostname, hostname, port.to_string()).with_credentials(username, password)
    })
}
