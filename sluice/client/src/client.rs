//! Calls against the control-plane API of one remote node.
//!
//! Credentials, proxy and url are resolved from the node descriptor for
//! every request. HTTP clients are built once per proxy setting and shared
//! by clones, so connections to the node are pooled. Instances can be
//! shared freely between tasks.

use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use reqwest::{Method, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sluice_protocol::{
    cluster::{
        NodeProperties, PeerNode, PortAllocation, PortAllocationRequest, RowSample, SequenceValue,
        ServerStatus, SlaveDetection, SniffRequest,
    },
    configuration::{JobConfiguration, PipelineConfiguration},
    status::ExecutionStatus,
    ExecutionKind, RunEntry, WebResult,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::ClientConfig,
    descriptor::{has_unresolved_variables, ResolvedNode, SlaveNode},
    error::ClientError,
    variables::Variables,
};

const CONTROL: &str = "control";

/// One HTTP call, described before any variable is resolved
struct Call<'a> {
    method: Method,
    segments: Vec<&'a str>,
    query: Vec<(&'static str, String)>,
    body: Option<serde_json::Value>,
    retryable: bool,
}

impl<'a> Call<'a> {
    fn get(segments: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            method: Method::GET,
            segments: segments.into_iter().collect(),
            query: vec![],
            body: None,
            retryable: false,
        }
    }

    fn with_body(
        method: Method,
        segments: impl IntoIterator<Item = &'a str>,
        body: &impl Serialize,
    ) -> Result<Self, ClientError> {
        Ok(Self {
            method,
            segments: segments.into_iter().collect(),
            query: vec![],
            body: Some(serde_json::to_value(body)?),
            retryable: false,
        })
    }

    fn query(mut self, name: &'static str, value: impl ToString) -> Self {
        self.query.push((name, value.to_string()));
        self
    }

    /// Mark a call without side effects on the node. Lifecycle verbs are plain
    /// GETs too, and a repeated start or remove is not the same request twice.
    fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

fn error_message(body: &str) -> String {
    if let Ok(error) = serde_json::from_str::<ErrorBody>(body) {
        return error.error;
    }
    if let Ok(result) = serde_json::from_str::<WebResult>(body) {
        return result.message;
    }

    match body.trim() {
        "" => "no message".to_string(),
        text => text.to_string(),
    }
}

/// HTTP clients keyed by the proxy url they go through, `None` for direct
type HttpClients = Arc<Mutex<HashMap<Option<String>, reqwest::Client>>>;

/// Client for the control-plane API of one remote node
#[derive(Debug, Clone)]
pub struct RemoteExecutionClient {
    node: SlaveNode,
    variables: Variables,
    config: ClientConfig,
    clients: HttpClients,
}

impl RemoteExecutionClient {
    pub fn new(node: SlaveNode) -> Self {
        Self {
            node,
            variables: Variables::new(),
            config: ClientConfig::default(),
            clients: HttpClients::default(),
        }
    }

    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        // pooled clients carry the old timeouts
        self.clients = HttpClients::default();
        self
    }

    pub fn node(&self) -> &SlaveNode {
        &self.node
    }

    /// Client for the proxy setting of `resolved`, built on first use
    fn http_client(&self, resolved: &ResolvedNode, url: &Url) -> Result<reqwest::Client, ClientError> {
        let proxy = resolved.proxy_url()?;

        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = clients.get(&proxy) {
            return Ok(client.clone());
        }

        let builder = reqwest::Client::builder()
            .connect_timeout(self.config.connect_timeout)
            .timeout(self.config.timeout);

        let builder = match &proxy {
            Some(proxy) => {
                let proxy = reqwest::Proxy::all(proxy)
                    .map_err(|e| ClientError::InvalidUrl(format!("proxy '{proxy}': {e}")))?;
                builder.proxy(proxy)
            }
            None => builder.no_proxy(),
        };

        let client = builder.build().map_err(|source| ClientError::Transport {
            url: url.to_string(),
            source,
        })?;
        debug!(node = %self.node, proxy = ?proxy, "Built HTTP client");

        clients.insert(proxy, client.clone());
        Ok(client)
    }

    async fn execute(&self, call: &Call<'_>) -> Result<Response, ClientError> {
        let retries = if call.retryable {
            self.config.retries
        } else {
            0
        };

        let mut attempt = 0;
        loop {
            match self.execute_once(call).await {
                Err(e) if attempt < retries && e.is_retryable() => {
                    let delay = self.config.backoff(attempt);
                    warn!(
                        node = %self.node,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn execute_once(&self, call: &Call<'_>) -> Result<Response, ClientError> {
        let resolved = self.node.resolve(&self.variables);
        if has_unresolved_variables(&resolved.hostname) {
            warn!(node = %self.node, hostname = %resolved.hostname, "Hostname has unresolved variables");
        }

        let url = resolved.service_url(call.segments.iter().copied())?;
        let client = self.http_client(&resolved, &url)?;

        let mut request = client.request(call.method.clone(), url.clone());
        if !call.query.is_empty() {
            request = request.query(&call.query);
        }
        if !resolved.username.is_empty() {
            request = request.basic_auth(&resolved.username, Some(&resolved.password));
        }
        if let Some(body) = &call.body {
            request = request.json(body);
        }

        debug!(method = %call.method, url = %url, "Calling node");
        let response = request
            .send()
            .await
            .map_err(|source| ClientError::Transport {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        // the body is always drained so the connection goes back to the pool
        let message = error_message(&response.text().await.unwrap_or_default());
        if status == StatusCode::NOT_FOUND {
            Err(ClientError::NotFound {
                node: resolved.name,
                url: url.to_string(),
                message,
            })
        } else {
            Err(ClientError::RemoteCallFailed {
                status: status.as_u16(),
                url: url.to_string(),
                message,
            })
        }
    }

    async fn fetch<T: DeserializeOwned>(&self, call: Call<'_>) -> Result<T, ClientError> {
        let response = self.execute(&call).await?;
        let url = response.url().to_string();

        response
            .json::<T>()
            .await
            .map_err(|e| ClientError::InvalidResponse {
                url,
                message: e.to_string(),
            })
    }

    async fn fetch_text(&self, call: Call<'_>) -> Result<String, ClientError> {
        let response = self.execute(&call).await?;
        let url = response.url().to_string();

        response
            .text()
            .await
            .map_err(|e| ClientError::InvalidResponse {
                url,
                message: e.to_string(),
            })
    }

    async fn expect_ok(&self, call: Call<'_>) -> Result<WebResult, ClientError> {
        let result: WebResult = self.fetch(call).await?;
        if result.is_ok() {
            Ok(result)
        } else {
            Err(ClientError::Rejected {
                node: self.node.name.clone(),
                message: result.message,
            })
        }
    }

    fn lifecycle<'a>(kind: ExecutionKind, verb: &'a str, run_id: &'a str) -> Call<'a> {
        Call::get([CONTROL, kind.path_segment(), verb, run_id])
    }

    pub async fn health(&self) -> Result<(), ClientError> {
        self.fetch_text(Call::get(["api", "health"]).retryable())
            .await
            .map(|_| ())
    }

    pub async fn server_status(&self) -> Result<ServerStatus, ClientError> {
        self.fetch(Call::get([CONTROL, "status"]).retryable()).await
    }

    pub async fn node_properties(&self) -> Result<NodeProperties, ClientError> {
        self.fetch(Call::get([CONTROL, "properties"]).retryable())
            .await
    }

    pub async fn list(&self, kind: ExecutionKind) -> Result<Vec<RunEntry>, ClientError> {
        self.fetch(Call::get([CONTROL, kind.path_segment()]).retryable())
            .await
    }

    pub async fn list_detailed(&self, kind: ExecutionKind) -> Result<Vec<ExecutionStatus>, ClientError> {
        self.fetch(Call::get([CONTROL, kind.path_segment(), "detailed"]).retryable())
            .await
    }

    pub async fn submit_pipeline(
        &self,
        configuration: &PipelineConfiguration,
    ) -> Result<ExecutionStatus, ClientError> {
        let call = Call::with_body(Method::PUT, [CONTROL, "pipeline", "add"], configuration)?;
        self.fetch(call).await
    }

    pub async fn submit_job(&self, configuration: &JobConfiguration) -> Result<ExecutionStatus, ClientError> {
        let call = Call::with_body(Method::PUT, [CONTROL, "job", "add"], configuration)?;
        self.fetch(call).await
    }

    pub async fn prepare_pipeline(&self, run_id: &str) -> Result<ExecutionStatus, ClientError> {
        self.fetch(Self::lifecycle(ExecutionKind::Pipeline, "prepare", run_id))
            .await
    }

    pub async fn start(&self, kind: ExecutionKind, run_id: &str) -> Result<ExecutionStatus, ClientError> {
        self.fetch(Self::lifecycle(kind, "start", run_id)).await
    }

    pub async fn stop(&self, kind: ExecutionKind, run_id: &str) -> Result<ExecutionStatus, ClientError> {
        self.fetch(Self::lifecycle(kind, "stop", run_id)).await
    }

    pub async fn pause_pipeline(&self, run_id: &str) -> Result<ExecutionStatus, ClientError> {
        self.fetch(Self::lifecycle(ExecutionKind::Pipeline, "pause", run_id))
            .await
    }

    pub async fn resume_pipeline(&self, run_id: &str) -> Result<ExecutionStatus, ClientError> {
        self.fetch(Self::lifecycle(ExecutionKind::Pipeline, "resume", run_id))
            .await
    }

    /// Release step resources, or only the cluster ports of the run with `sockets_only`
    pub async fn cleanup_pipeline(
        &self,
        run_id: &str,
        sockets_only: bool,
    ) -> Result<ExecutionStatus, ClientError> {
        let mut call = Self::lifecycle(ExecutionKind::Pipeline, "cleanup", run_id);
        if sockets_only {
            call = call.query("sockets", true);
        }
        self.fetch(call).await
    }

    pub async fn status(&self, kind: ExecutionKind, run_id: &str) -> Result<ExecutionStatus, ClientError> {
        self.fetch(Self::lifecycle(kind, "status", run_id).retryable())
            .await
    }

    /// Status snapshot carrying the log lines from `from_line` onward
    pub async fn status_with_log(
        &self,
        kind: ExecutionKind,
        run_id: &str,
        from_line: u64,
    ) -> Result<ExecutionStatus, ClientError> {
        let call = Self::lifecycle(kind, "status", run_id)
            .query("from", from_line)
            .retryable();
        self.fetch(call).await
    }

    pub async fn log(&self, kind: ExecutionKind, run_id: &str, from_line: u64) -> Result<String, ClientError> {
        let from_line = from_line.to_string();
        self.fetch_text(Call::get([
            CONTROL,
            kind.path_segment(),
            "log",
            run_id,
            from_line.as_str(),
        ])
        .retryable())
        .await
    }

    pub async fn remove(&self, kind: ExecutionKind, run_id: &str) -> Result<(), ClientError> {
        self.expect_ok(Self::lifecycle(kind, "remove", run_id))
            .await
            .map(|_| ())
    }

    pub async fn sniff_step(&self, run_id: &str, request: &SniffRequest) -> Result<RowSample, ClientError> {
        let call = Call::get([CONTROL, "pipeline", "sniff", run_id])
            .query("step", &request.step)
            .query("copy", request.copy)
            .query("lines", request.lines)
            .query("kind", request.kind)
            .retryable();
        self.fetch(call).await
    }

    pub async fn list_slaves(&self) -> Result<Vec<SlaveDetection>, ClientError> {
        self.fetch(Call::get([CONTROL, "cluster", "slaves"]).retryable())
            .await
    }

    pub async fn register_slave(&self, peer: &PeerNode) -> Result<(), ClientError> {
        let call = Call::with_body(Method::POST, [CONTROL, "cluster", "slaves", "register"], peer)?;
        self.expect_ok(call).await.map(|_| ())
    }

    /// Allocate a port for streaming between two step copies.
    ///
    /// The hostname is resolved to an IP address first so the remote node
    /// keys the allocation by address.
    pub async fn allocate_port(&self, request: &PortAllocationRequest) -> Result<u16, ClientError> {
        let address = resolve_address(&request.hostname).await?;

        let call = Call::get([CONTROL, "cluster", "ports", "allocate"])
            .query("run_id", &request.run_id)
            .query("range_start", request.range_start)
            .query("hostname", address)
            .query("pipeline_name", &request.pipeline_name)
            .query("source_node", &request.source_node)
            .query("source_step", &request.source_step)
            .query("source_copy", request.source_copy)
            .query("target_node", &request.target_node)
            .query("target_step", &request.target_step)
            .query("target_copy", request.target_copy);

        let allocation: PortAllocation = self.fetch(call).await?;
        debug!(node = %self.node, run_id = %request.run_id, port = allocation.port, "Allocated remote port");
        Ok(allocation.port)
    }

    pub async fn release_ports(&self, run_id: &str) -> Result<(), ClientError> {
        self.expect_ok(Call::get([CONTROL, "cluster", "ports", "release", run_id]))
            .await
            .map(|_| ())
    }

    /// Reserve `increment` values of a sequence, returning the first one
    pub async fn next_sequence_value(&self, name: &str, increment: i64) -> Result<i64, ClientError> {
        let call = Call::get([CONTROL, "cluster", "sequence", name]).query("increment", increment);
        let value: SequenceValue = self.fetch(call).await?;
        Ok(value.value)
    }

    /// Submit, prepare and start a pipeline, returning its run id
    pub async fn run_pipeline(&self, configuration: &PipelineConfiguration) -> Result<String, ClientError> {
        let submitted = self.accepted(self.submit_pipeline(configuration).await?)?;
        let run_id = submitted.run_id;

        self.accepted(self.prepare_pipeline(&run_id).await?)?;
        self.accepted(self.start(ExecutionKind::Pipeline, &run_id).await?)?;

        info!(node = %self.node, run_id = %run_id, pipeline = %configuration.definition.name, "Pipeline started remotely");
        Ok(run_id)
    }

    /// Submit and start a job, returning its run id
    pub async fn run_job(&self, configuration: &JobConfiguration) -> Result<String, ClientError> {
        let submitted = self.accepted(self.submit_job(configuration).await?)?;
        let run_id = submitted.run_id;

        self.accepted(self.start(ExecutionKind::Job, &run_id).await?)?;

        info!(node = %self.node, run_id = %run_id, job = %configuration.definition.name, "Job started remotely");
        Ok(run_id)
    }

    /// Poll the status of a run until it reaches a terminal state
    pub async fn wait_for(
        &self,
        kind: ExecutionKind,
        run_id: &str,
        interval: Duration,
    ) -> Result<ExecutionStatus, ClientError> {
        loop {
            let status = self.status(kind, run_id).await?;
            if status.is_finished() {
                return Ok(status);
            }
            debug!(node = %self.node, run_id = %run_id, state = %status.state, "Waiting for run to finish");
            tokio::time::sleep(interval).await;
        }
    }

    fn accepted(&self, status: ExecutionStatus) -> Result<ExecutionStatus, ClientError> {
        match &status.error {
            Some(message) => Err(ClientError::Rejected {
                node: self.node.name.clone(),
                message: format!("{} ({}): {message}", status.name, status.run_id),
            }),
            None => Ok(status),
        }
    }
}

async fn resolve_address(hostname: &str) -> Result<IpAddr, ClientError> {
    if let Ok(address) = hostname.parse::<IpAddr>() {
        return Ok(address);
    }

    let mut addresses = tokio::net::lookup_host((hostname, 0))
        .await
        .map_err(|e| ClientError::AddressResolution {
            hostname: hostname.to_string(),
            message: e.to_string(),
        })?;

    addresses
        .next()
        .map(|address| address.ip())
        .ok_or_else(|| ClientError::AddressResolution {
            hostname: hostname.to_string(),
            message: "no address found".to_string(),
        })
}
