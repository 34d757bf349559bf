//! Description of a remote node and the resolution of its connection details.
//!
//! Every field may contain `${NAME}` tokens. They are resolved against a
//! [`Variables`] map each time a call is made, never cached.

use std::{fmt, sync::OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use sluice_protocol::cluster::PeerNode;
use url::Url;

use crate::{error::ClientError, variables::Variables};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaveNode {
    pub name: String,
    pub hostname: String,
    pub port: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_app_path: Option<String>,
    pub username: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_port: Option<String>,
    /// Regular expression matched against the whole hostname to bypass the proxy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub non_proxy_hosts: Option<String>,
    pub master: bool,
    pub ssl: bool,
}

impl SlaveNode {
    pub fn new(
        name: impl Into<String>,
        hostname: impl Into<String>,
        port: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            hostname: hostname.into(),
            port: port.into(),
            ..Default::default()
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_proxy(mut self, hostname: impl Into<String>, port: impl Into<String>) -> Self {
        self.proxy_hostname = Some(hostname.into());
        self.proxy_port = Some(port.into());
        self
    }

    pub fn resolve(&self, variables: &Variables) -> ResolvedNode {
        let resolve_opt = |value: &Option<String>| {
            value
                .as_deref()
                .map(|value| variables.substitute(value))
                .filter(|value| !value.trim().is_empty())
        };

        ResolvedNode {
            name: variables.substitute(&self.name),
            hostname: variables.substitute(&self.hostname),
            port: variables.substitute(&self.port),
            web_app_path: resolve_opt(&self.web_app_path),
            username: variables.substitute(&self.username),
            password: variables.substitute(&self.password),
            proxy_hostname: resolve_opt(&self.proxy_hostname),
            proxy_port: resolve_opt(&self.proxy_port),
            non_proxy_hosts: resolve_opt(&self.non_proxy_hosts),
            ssl: self.ssl,
        }
    }

    /// The descriptor as announced to other nodes
    pub fn to_peer(&self, variables: &Variables) -> PeerNode {
        let resolved = self.resolve(variables);
        PeerNode {
            name: resolved.name,
            hostname: resolved.hostname,
            port: resolved.port,
            web_app_path: resolved.web_app_path,
            master: self.master,
        }
    }
}

impl fmt::Display for SlaveNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A [`SlaveNode`] with every variable resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedNode {
    pub name: String,
    pub hostname: String,
    pub port: String,
    pub web_app_path: Option<String>,
    pub username: String,
    pub password: String,
    pub proxy_hostname: Option<String>,
    pub proxy_port: Option<String>,
    pub non_proxy_hosts: Option<String>,
    pub ssl: bool,
}

impl ResolvedNode {
    /// `:port`, or nothing for an empty port or the default http port
    pub fn port_specification(&self) -> String {
        let port = self.port.trim();
        if port.is_empty() || port == "80" {
            String::new()
        } else {
            format!(":{port}")
        }
    }

    /// Hostname used in urls. `localhost` becomes `127.0.0.1` behind a proxy.
    pub fn url_hostname(&self) -> &str {
        if self.proxy_hostname.is_some() && self.hostname == "localhost" {
            "127.0.0.1"
        } else {
            &self.hostname
        }
    }

    /// Proxy url to route calls through, unless the hostname is exempt
    pub fn proxy_url(&self) -> Result<Option<String>, ClientError> {
        let (Some(host), Some(port)) = (&self.proxy_hostname, &self.proxy_port) else {
            return Ok(None);
        };

        if let Some(pattern) = &self.non_proxy_hosts {
            let anchored = Regex::new(&format!("^(?:{pattern})$")).map_err(|e| {
                ClientError::InvalidUrl(format!("invalid non-proxy host pattern '{pattern}': {e}"))
            })?;
            if anchored.is_match(&self.hostname) {
                return Ok(None);
            }
        }

        Ok(Some(format!("http://{host}:{port}")))
    }

    /// Url of a service given as unencoded path segments
    pub fn service_url<'a>(
        &self,
        segments: impl IntoIterator<Item = &'a str>,
    ) -> Result<Url, ClientError> {
        let scheme = if self.ssl { "https" } else { "http" };
        let base = format!(
            "{scheme}://{}{}",
            self.url_hostname(),
            self.port_specification()
        );
        let mut url = Url::parse(&base)
            .map_err(|e| ClientError::InvalidUrl(format!("'{base}' for node '{}': {e}", self.name)))?;

        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| ClientError::InvalidUrl(format!("'{base}' cannot carry a path")))?;
            path.clear();
            if let Some(prefix) = &self.web_app_path {
                path.extend(prefix.split('/').filter(|segment| !segment.is_empty()));
            }
            path.extend(segments);
        }

        Ok(url)
    }
}

/// Whether a descriptor field still holds an unresolved `${NAME}` token
pub fn has_unresolved_variables(value: &str) -> bool {
    static TOKEN_REGEX: OnceLock<Regex> = OnceLock::new();

    TOKEN_REGEX
        .get_or_init(|| Regex::new(r"\$\{[^}]+\}").expect("invalid regex"))
        .is_match(value)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn node(hostname: &str, port: &str) -> SlaveNode {
        SlaveNode::new("slave-1", hostname, port)
    }

    #[rstest]
    #[case::explicit_port(node("node-a", "8081"), "http://node-a:8081/control/pipeline/status/r1")]
    #[case::default_port(node("node-a", "80"), "http://node-a/control/pipeline/status/r1")]
    #[case::empty_port(node("node-a", ""), "http://node-a/control/pipeline/status/r1")]
    #[case::ssl(SlaveNode { ssl: true, ..node("node-a", "8443") }, "https://node-a:8443/control/pipeline/status/r1")]
    #[case::web_app(
        SlaveNode { web_app_path: Some("/sluice/".into()), ..node("node-a", "8081") },
        "http://node-a:8081/sluice/control/pipeline/status/r1"
    )]
    #[case::localhost_behind_proxy(
        node("localhost", "8081").with_proxy("proxy", "3128"),
        "http://127.0.0.1:8081/control/pipeline/status/r1"
    )]
    #[case::localhost_without_proxy(node("localhost", "8081"), "http://localhost:8081/control/pipeline/status/r1")]
    fn service_url(#[case] node: SlaveNode, #[case] expected: &str) {
        let url = node
            .resolve(&Variables::new())
            .service_url(["control", "pipeline", "status", "r1"])
            .unwrap();

        assert_eq!(url.as_str(), expected);
    }

    #[test]
    fn path_segments_are_percent_encoded() {
        let url = node("node-a", "8081")
            .resolve(&Variables::new())
            .service_url(["control", "cluster", "sequence", "order ids/v2"])
            .unwrap();

        assert_eq!(
            url.as_str(),
            "http://node-a:8081/control/cluster/sequence/order%20ids%2Fv2"
        );
    }

    #[test]
    fn fields_are_resolved_at_call_time() {
        let node = SlaveNode::new("slave-${ID}", "${HOST}", "${PORT}").with_credentials("${USER}", "secret");
        let mut variables = Variables::new();
        variables.set("ID", "7").set("HOST", "node-7").set("PORT", "9000").set("USER", "admin");

        let resolved = node.resolve(&variables);

        assert_eq!(resolved.name, "slave-7");
        assert_eq!(resolved.username, "admin");
        assert_eq!(
            resolved.service_url(["api", "health"]).unwrap().as_str(),
            "http://node-7:9000/api/health"
        );
        assert!(has_unresolved_variables(&node.hostname));
        assert!(!has_unresolved_variables(&resolved.hostname));
    }

    #[rstest]
    #[case::no_pattern(None, "node-a", Some("http://proxy:3128"))]
    #[case::matching(Some("node-.*"), "node-a", None)]
    #[case::alternatives(Some("localhost|node-a"), "node-a", None)]
    #[case::partial_match_is_not_enough(Some("node"), "node-a", Some("http://proxy:3128"))]
    fn proxy_bypass(#[case] pattern: Option<&str>, #[case] hostname: &str, #[case] expected: Option<&str>) {
        let node = SlaveNode {
            non_proxy_hosts: pattern.map(String::from),
            ..node(hostname, "8081").with_proxy("proxy", "3128")
        };

        let proxy = node.resolve(&Variables::new()).proxy_url().unwrap();

        assert_eq!(proxy.as_deref(), expected);
    }

    #[test]
    fn no_proxy_without_port() {
        let node = SlaveNode {
            proxy_hostname: Some("proxy".into()),
            ..node("node-a", "8081")
        };

        assert_eq!(node.resolve(&Variables::new()).proxy_url().unwrap(), None);
    }
}
