//! Runs a single [`GridProbe`] against one Pod.
//!
//! Remote failures (refused connections, timeouts, non-zero exit codes, bad status codes) are
//! reported as [`ProbeResult::Failure`]. Problems with the probe definition itself, such as a
//! port name that the Pod does not declare, are reported as [`ProbeResult::Unknown`].

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use k8s_openapi::{
    api::core::v1::{ExecAction, HTTPGetAction, Pod, TCPSocketAction},
    apimachinery::pkg::util::intstr::IntOrString,
};
use kube::ResourceExt;
use reqwest::header::HOST;
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::net::TcpStream;

use crate::{
    crd::{CONTAINER_NAME, GridProbe, ProbeAction},
    store::{ObjectKey, RemoteExec},
};

const USER_AGENT: &str = concat!("coherence-operator/", env!("CARGO_PKG_VERSION"));

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to build HTTP client"))]
    BuildHttpClient { source: reqwest::Error },

    #[snafu(display("cannot find {CONTAINER_NAME} container in Pod {pod:?}"))]
    MissingContainer { pod: String },

    #[snafu(display("cannot find port {port:?} in {CONTAINER_NAME} container in Pod {pod:?}"))]
    MissingPort { port: String, pod: String },

    #[snafu(display("port {port} is out of range"))]
    PortOutOfRange {
        source: std::num::TryFromIntError,
        port: i32,
    },

    #[snafu(display("exec probe has no command"))]
    EmptyCommand,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProbeResult {
    Success,
    Failure,
    Unknown,
}

impl fmt::Display for ProbeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Unknown => "unknown",
        };
        f.write_str(text)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProbeOutcome {
    pub result: ProbeResult,
    pub diagnostic: String,
}

impl ProbeOutcome {
    pub fn success(diagnostic: impl Into<String>) -> Self {
        Self {
            result: ProbeResult::Success,
            diagnostic: diagnostic.into(),
        }
    }

    pub fn failure(diagnostic: impl Into<String>) -> Self {
        Self {
            result: ProbeResult::Failure,
            diagnostic: diagnostic.into(),
        }
    }

    pub fn unknown(diagnostic: impl Into<String>) -> Self {
        Self {
            result: ProbeResult::Unknown,
            diagnostic: diagnostic.into(),
        }
    }
}

/// Something that can run a probe against a Pod.
#[async_trait]
pub trait PodProber: Send + Sync {
    /// `service` is the headless service the Pod is addressed through.
    async fn run(&self, pod: &Pod, probe: &GridProbe, service: &str) -> ProbeOutcome;
}

/// Maps a named container port to the port number the operator should dial.
pub type PortTranslator = Arc<dyn Fn(&str, i32) -> i32 + Send + Sync>;

/// Overrides the address a Pod is dialed at.
pub type HostResolver = Arc<dyn Fn(&Pod) -> Option<String> + Send + Sync>;

pub struct Prober {
    http: reqwest::Client,
    exec: Arc<dyn RemoteExec>,
    translate_port: PortTranslator,
    resolve_host: Option<HostResolver>,
}

impl Prober {
    pub fn new(exec: Arc<dyn RemoteExec>) -> Result<Self> {
        // Kubernetes probes don't verify certificates either
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .danger_accept_invalid_certs(true)
            .no_proxy()
            .build()
            .context(BuildHttpClientSnafu)?;
        Ok(Self {
            http,
            exec,
            translate_port: Arc::new(|_, port| port),
            resolve_host: None,
        })
    }

    pub fn with_port_translator(mut self, translate_port: PortTranslator) -> Self {
        self.translate_port = translate_port;
        self
    }

    pub fn with_host_resolver(mut self, resolve_host: HostResolver) -> Self {
        self.resolve_host = Some(resolve_host);
        self
    }

    async fn probe_exec(&self, pod: &Pod, action: &ExecAction, timeout: Duration) -> ProbeOutcome {
        let command = match action.command.as_deref() {
            Some(command) if !command.is_empty() => command,
            _ => return ProbeOutcome::unknown(EmptyCommandSnafu.build().to_string()),
        };
        let key = ObjectKey::new(pod.namespace().unwrap_or_default(), pod.name_any());

        match tokio::time::timeout(timeout, self.exec.exec(&key, CONTAINER_NAME, command)).await {
            Err(_) => ProbeOutcome::failure(format!(
                "command {command:?} timed out after {}",
                humantime::format_duration(timeout)
            )),
            Ok(Err(err)) => ProbeOutcome::failure(err.to_string()),
            Ok(Ok(output)) if output.exit_code == 0 => ProbeOutcome::success(output.stdout),
            Ok(Ok(output)) => ProbeOutcome::failure(format!(
                "command {command:?} exited with {}: {}",
                output.exit_code, output.stderr
            )),
        }
    }

    async fn probe_http(
        &self,
        pod: &Pod,
        action: &HTTPGetAction,
        service: &str,
        timeout: Duration,
    ) -> ProbeOutcome {
        let port = match self.find_port(pod, &action.port) {
            Ok(port) => port,
            Err(err) => return ProbeOutcome::unknown(err.to_string()),
        };
        let scheme = action
            .scheme
            .as_deref()
            .filter(|scheme| !scheme.is_empty())
            .unwrap_or("HTTP")
            .to_lowercase();
        let host = self.target_host(pod, action.host.as_deref());
        let path = action.path.as_deref().unwrap_or_default();
        let path = path.strip_prefix('/').unwrap_or(path);
        let url = format!("{scheme}://{}:{port}/{path}", bracket_ipv6(&host));

        let mut request = self
            .http
            .get(&url)
            .timeout(timeout)
            .header(HOST, pod_host_name(pod, service));
        for header in action.http_headers.iter().flatten() {
            request = request.header(header.name.as_str(), header.value.as_str());
        }

        let outcome = match request.send().await {
            Ok(response) => {
                let status = response.status();
                if (200..400).contains(&status.as_u16()) {
                    ProbeOutcome::success(format!("HTTP probe succeeded with statuscode: {status}"))
                } else {
                    ProbeOutcome::failure(format!("HTTP probe failed with statuscode: {status}"))
                }
            }
            Err(err) => ProbeOutcome::failure(format!("HTTP probe failed: {err}")),
        };
        tracing::debug!(
            %url,
            result = %outcome.result,
            diagnostic = %outcome.diagnostic,
            "executed HTTP probe"
        );
        outcome
    }

    async fn probe_tcp(
        &self,
        pod: &Pod,
        action: &TCPSocketAction,
        timeout: Duration,
    ) -> ProbeOutcome {
        let port = match self
            .find_port(pod, &action.port)
            .and_then(|port| u16::try_from(port).context(PortOutOfRangeSnafu { port }))
        {
            Ok(port) => port,
            Err(err) => return ProbeOutcome::unknown(err.to_string()),
        };
        let host = self.target_host(pod, action.host.as_deref());

        let connect = TcpStream::connect((host.as_str(), port));
        let outcome = match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(stream)) => {
                drop(stream);
                ProbeOutcome::success(format!("connected to {host}:{port}"))
            }
            Ok(Err(err)) => ProbeOutcome::failure(format!("dial {host}:{port} failed: {err}")),
            Err(_) => ProbeOutcome::failure(format!(
                "dial {host}:{port} timed out after {}",
                humantime::format_duration(timeout)
            )),
        };
        tracing::debug!(%host, port, result = %outcome.result, "executed TCP probe");
        outcome
    }

    fn target_host(&self, pod: &Pod, explicit: Option<&str>) -> String {
        match explicit.filter(|host| !host.is_empty()) {
            Some(host) => host.to_owned(),
            None => self.pod_address(pod),
        }
    }

    /// The address a Pod is dialed at: the resolver hook, the Pod IP, or its DNS name.
    pub fn pod_address(&self, pod: &Pod) -> String {
        if let Some(host) = self.resolve_host.as_ref().and_then(|resolve| resolve(pod)) {
            return host;
        }
        let pod_ip = pod
            .status
            .as_ref()
            .and_then(|status| status.pod_ip.as_deref())
            .filter(|ip| !ip.is_empty());
        match pod_ip {
            Some(ip) => ip.to_owned(),
            None => {
                let spec = pod.spec.as_ref();
                format!(
                    "{}.{}.{}.svc",
                    spec.and_then(|s| s.hostname.as_deref()).unwrap_or_default(),
                    spec.and_then(|s| s.subdomain.as_deref()).unwrap_or_default(),
                    pod.namespace().unwrap_or_default()
                )
            }
        }
    }

    /// Resolves a probe port. Numbers (or numeric strings) are used as-is, names are looked up
    /// in the ports of the `coherence` container and passed through the port translator.
    pub fn find_port(&self, pod: &Pod, port: &IntOrString) -> Result<i32> {
        let name = match port {
            IntOrString::Int(port) => return Ok(*port),
            IntOrString::String(name) => name,
        };
        if let Ok(port) = name.parse::<i32>() {
            return Ok(port);
        }

        let container = pod
            .spec
            .iter()
            .flat_map(|spec| &spec.containers)
            .find(|container| container.name == CONTAINER_NAME)
            .context(MissingContainerSnafu { pod: pod.name_any() })?;
        container
            .ports
            .iter()
            .flatten()
            .find(|p| p.name.as_deref() == Some(name.as_str()))
            .map(|p| (self.translate_port)(name, p.container_port))
            .context(MissingPortSnafu {
                port: name.clone(),
                pod: pod.name_any(),
            })
    }
}

#[async_trait]
impl PodProber for Prober {
    async fn run(&self, pod: &Pod, probe: &GridProbe, service: &str) -> ProbeOutcome {
        let timeout = probe.timeout();
        match &probe.handler {
            None => ProbeOutcome::success("no probe handler configured"),
            Some(ProbeAction::Exec(action)) => self.probe_exec(pod, action, timeout).await,
            Some(ProbeAction::HttpGet(action)) => {
                self.probe_http(pod, action, service, timeout).await
            }
            Some(ProbeAction::TcpSocket(action)) => self.probe_tcp(pod, action, timeout).await,
        }
    }
}

fn pod_host_name(pod: &Pod, service: &str) -> String {
    format!(
        "{}.{service}.{}",
        pod.name_any(),
        pod.namespace().unwrap_or_default()
    )
}

fn bracket_ipv6(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_owned()
    }
}
