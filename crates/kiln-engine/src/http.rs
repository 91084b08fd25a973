use crate::engine::{
    api_version_at_least, ContainerEngine, ContainerInfo, ContainerSpec, ContainerSummary,
    EngineVersion, ExecOutput, HistoryEntry, ImageSummary, NetworkSummary, PortBinding,
};
use crate::stream::{demux, follow_lines, LineBuffer};
use crate::EngineError;
use kiln_schema::{ContainerId, EngineSection, ImageId, NetworkId};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::time::Duration;
use tracing::debug;
use ureq::http::Response;
use ureq::{Agent, Body, SendBody};

const DEFAULT_DAEMON_URL: &str = "unix:///var/run/docker.sock";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Container engine reached over the daemon's HTTP API.
///
/// Only TCP endpoints are supported (`tcp://` and `http(s)://`). Short
/// requests run with the configured global timeout; streaming requests
/// (build, attach, exec, import) only bound the connect phase since they
/// last as long as the work they observe.
pub struct HttpEngine {
    base: String,
    host: String,
    agent: Agent,
    stream_agent: Agent,
}

impl HttpEngine {
    /// Connect and verify the daemon speaks at least `min_api_version`.
    pub fn connect(config: &EngineSection) -> Result<Self, EngineError> {
        let base = resolve_daemon_url(config.url.as_deref())?;
        let engine = Self::new(&base, Duration::from_secs(config.request_timeout_secs));

        let version = engine.version().map_err(|e| {
            EngineError::Unavailable(format!("cannot reach container engine at {base}: {e}"))
        })?;
        if !api_version_at_least(&version.api_version, &config.min_api_version) {
            return Err(EngineError::Unavailable(format!(
                "engine API {} is older than the required {}",
                version.api_version, config.min_api_version
            )));
        }
        debug!(
            "connected to engine {} (API {}) at {base}",
            version.version, version.api_version
        );
        Ok(engine)
    }

    /// Build a client without contacting the daemon.
    pub fn new(base: &str, timeout: Duration) -> Self {
        let agent: Agent = Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();
        let stream_agent: Agent = Agent::config_builder()
            .timeout_connect(Some(CONNECT_TIMEOUT))
            .build()
            .into();
        let base = base.trim_end_matches('/').to_owned();
        Self {
            host: url_host(&base),
            base,
            agent,
            stream_agent,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    /// Whether the daemon answers `/version` within a few seconds.
    pub fn is_alive(&self) -> bool {
        let quick: Agent = Agent::config_builder()
            .timeout_global(Some(PROBE_TIMEOUT))
            .build()
            .into();
        quick.get(&self.url("/version")).call().is_ok()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<Response<Body>, EngineError> {
        debug!("GET {path}");
        let mut req = self.agent.get(&self.url(path));
        for (k, v) in query {
            req = req.query(*k, *v);
        }
        req.call().map_err(|e| map_err(path, e))
    }

    fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, EngineError> {
        read_json(self.get(path, query)?)
    }

    fn post(
        &self,
        agent: &Agent,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<Response<Body>, EngineError> {
        debug!("POST {path}");
        let mut req = agent.post(&self.url(path));
        for (k, v) in query {
            req = req.query(*k, *v);
        }
        let result = match body {
            Some(value) => {
                let bytes = serde_json::to_vec(value)?;
                req.header("Content-Type", "application/json")
                    .send(&bytes[..])
            }
            None => req.send_empty(),
        };
        result.map_err(|e| map_err(path, e))
    }

    fn delete(&self, path: &str, query: &[(&str, &str)]) -> Result<(), EngineError> {
        debug!("DELETE {path}");
        let mut req = self.agent.delete(&self.url(path));
        for (k, v) in query {
            req = req.query(*k, *v);
        }
        req.call().map_err(|e| map_err(path, e))?;
        Ok(())
    }
}

impl ContainerEngine for HttpEngine {
    fn version(&self) -> Result<EngineVersion, EngineError> {
        let raw: RawVersion = self.get_json("/version", &[])?;
        Ok(EngineVersion {
            version: raw.version,
            api_version: raw.api_version,
        })
    }

    fn daemon_host(&self) -> String {
        self.host.clone()
    }

    fn list_images(&self) -> Result<Vec<ImageSummary>, EngineError> {
        let raw: Vec<RawImage> = self.get_json("/images/json", &[])?;
        Ok(raw
            .into_iter()
            .map(|i| ImageSummary {
                id: ImageId::new(i.id),
                repo_tags: i
                    .repo_tags
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|rt| rt != "<none>:<none>")
                    .collect(),
                created: i.created,
            })
            .collect())
    }

    fn image_history(&self, image: &ImageId) -> Result<Vec<HistoryEntry>, EngineError> {
        let raw: Vec<RawHistory> = self.get_json(&format!("/images/{image}/history"), &[])?;
        Ok(raw
            .into_iter()
            .map(|h| HistoryEntry {
                id: h.id,
                created_by: h.created_by,
            })
            .collect())
    }

    fn import_image(
        &self,
        archive: &Path,
        repository: &str,
        tag: &str,
    ) -> Result<ImageId, EngineError> {
        let path = "/images/create";
        debug!("POST {path} fromSrc=- repo={repository} tag={tag}");
        let mut file = File::open(archive)?;
        let resp = self
            .stream_agent
            .post(&self.url(path))
            .query("fromSrc", "-")
            .query("repo", repository)
            .query("tag", tag)
            .header("Content-Type", "application/x-tar")
            .send(SendBody::from_reader(&mut file))
            .map_err(|e| map_err(path, e))?;
        for_each_message(resp, |message| match message.get("error").and_then(Value::as_str) {
            Some(error) => Err(EngineError::Protocol(format!("import failed: {error}"))),
            None => Ok(()),
        })?;

        let raw: RawId = self.get_json(&format!("/images/{repository}:{tag}/json"), &[])?;
        Ok(ImageId::new(raw.id))
    }

    fn build_image(
        &self,
        context: &[u8],
        on_line: &mut dyn FnMut(&str),
    ) -> Result<(), EngineError> {
        let path = "/build";
        debug!("POST {path} ({} byte context)", context.len());
        let resp = self
            .stream_agent
            .post(&self.url(path))
            .query("rm", "1")
            .header("Content-Type", "application/x-tar")
            .send(context)
            .map_err(|e| map_err(path, e))?;

        let mut lines = LineBuffer::new();
        for_each_message(resp, |message| {
            if let Some(text) = message.get("stream").and_then(Value::as_str) {
                lines.push(text.as_bytes(), on_line);
            } else if let Some(error) = message.get("error").and_then(Value::as_str) {
                lines.finish(on_line);
                on_line(&format!("error: {error}"));
            }
            Ok(())
        })?;
        lines.finish(on_line);
        Ok(())
    }

    fn tag_image(&self, image: &ImageId, repository: &str, tag: &str) -> Result<(), EngineError> {
        self.post(
            &self.agent,
            &format!("/images/{image}/tag"),
            &[("repo", repository), ("tag", tag)],
            None,
        )?;
        Ok(())
    }

    fn remove_image(&self, image: &ImageId) -> Result<(), EngineError> {
        self.delete(&format!("/images/{image}"), &[])
    }

    fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerId, EngineError> {
        let resp = self.post(
            &self.agent,
            "/containers/create",
            &[],
            Some(&create_body(spec)),
        )?;
        let raw: RawId = read_json(resp)?;
        Ok(ContainerId::new(raw.id))
    }

    fn start_container(&self, id: &ContainerId) -> Result<(), EngineError> {
        self.post(&self.agent, &format!("/containers/{id}/start"), &[], None)?;
        Ok(())
    }

    fn stop_container(&self, id: &ContainerId, timeout_secs: u32) -> Result<(), EngineError> {
        let t = timeout_secs.to_string();
        self.post(
            &self.stream_agent,
            &format!("/containers/{id}/stop"),
            &[("t", t.as_str())],
            None,
        )?;
        Ok(())
    }

    fn inspect_container(&self, id: &ContainerId) -> Result<ContainerInfo, EngineError> {
        let raw: RawInspect = self.get_json(&format!("/containers/{id}/json"), &[])?;
        let mut ports = BTreeMap::new();
        for (key, bindings) in raw.network_settings.ports.unwrap_or_default() {
            let Some(port) = key
                .strip_suffix("/tcp")
                .and_then(|p| p.parse::<u16>().ok())
            else {
                continue;
            };
            let bindings = bindings
                .unwrap_or_default()
                .into_iter()
                .filter_map(|b| {
                    Some(PortBinding {
                        host_port: b.host_port.parse().ok()?,
                        host_ip: b.host_ip,
                    })
                })
                .collect();
            ports.insert(port, bindings);
        }
        let gateways = raw
            .network_settings
            .networks
            .unwrap_or_default()
            .into_values()
            .map(|n| n.gateway)
            .filter(|g| !g.is_empty())
            .collect();

        Ok(ContainerInfo {
            id: ContainerId::new(raw.id),
            name: raw.name.trim_start_matches('/').to_owned(),
            image: ImageId::new(raw.image),
            running: raw.state.running,
            exit_code: raw.state.exit_code,
            ports,
            gateways,
        })
    }

    fn remove_container(
        &self,
        id: &ContainerId,
        force: bool,
        volumes: bool,
    ) -> Result<(), EngineError> {
        self.delete(
            &format!("/containers/{id}"),
            &[("force", flag(force)), ("v", flag(volumes))],
        )
    }

    fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, EngineError> {
        let raw: Vec<RawContainer> = self.get_json("/containers/json", &[("all", flag(all))])?;
        Ok(raw
            .into_iter()
            .map(|c| ContainerSummary {
                id: ContainerId::new(c.id),
                image: ImageId::new(c.image_id),
                running: c.state == "running",
            })
            .collect())
    }

    fn attach(
        &self,
        id: &ContainerId,
        logs: bool,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<(), EngineError> {
        let path = format!("/containers/{id}/logs");
        debug!("GET {path} follow=1 logs={logs}");
        let resp = self
            .stream_agent
            .get(&self.url(&path))
            .query("follow", "1")
            .query("stdout", "1")
            .query("stderr", "1")
            .query("tail", if logs { "all" } else { "0" })
            .call()
            .map_err(|e| map_err(&path, e))?;

        let stopped = || self.inspect_container(id).map_or(true, |info| !info.running);
        let result = follow_lines(resp.into_body().into_reader(), stopped, on_line);
        // A dropped connection is an early end of stream, not a failure.
        if let Err(e) = result {
            debug!("attach stream for {id} ended early: {e}");
        }
        Ok(())
    }

    fn exec(&self, id: &ContainerId, cmd: &[String]) -> Result<ExecOutput, EngineError> {
        let body = json!({
            "AttachStdout": true,
            "AttachStderr": false,
            "Cmd": cmd,
        });
        let created: RawId = read_json(self.post(
            &self.agent,
            &format!("/containers/{id}/exec"),
            &[],
            Some(&body),
        )?)?;

        let resp = self.post(
            &self.stream_agent,
            &format!("/exec/{}/start", created.id),
            &[],
            Some(&json!({"Detach": false, "Tty": false})),
        )?;
        let mut stdout = Vec::new();
        demux(resp.into_body().into_reader(), &mut |stream, payload| {
            if stream == 1 {
                stdout.extend_from_slice(payload);
            }
        })?;

        let inspected: RawExecInspect = self.get_json(&format!("/exec/{}/json", created.id), &[])?;
        Ok(ExecOutput {
            exit_code: inspected.exit_code.unwrap_or(0),
            stdout,
        })
    }

    fn commit_container(
        &self,
        id: &ContainerId,
        repository: &str,
        tag: &str,
    ) -> Result<ImageId, EngineError> {
        let resp = self.post(
            &self.stream_agent,
            "/commit",
            &[("container", id.as_str()), ("repo", repository), ("tag", tag)],
            None,
        )?;
        let raw: RawId = read_json(resp)?;
        Ok(ImageId::new(raw.id))
    }

    fn get_archive(&self, id: &ContainerId, path: &str) -> Result<Vec<u8>, EngineError> {
        let resp = self.get(&format!("/containers/{id}/archive"), &[("path", path)])?;
        let mut data = Vec::new();
        std::io::copy(&mut resp.into_body().into_reader(), &mut data)?;
        Ok(data)
    }

    fn list_networks(&self) -> Result<Vec<NetworkSummary>, EngineError> {
        let raw: Vec<RawNetwork> = self.get_json("/networks", &[])?;
        Ok(raw
            .into_iter()
            .map(|n| NetworkSummary {
                gateway: n
                    .ipam
                    .and_then(|ipam| ipam.config)
                    .and_then(|configs| configs.into_iter().find_map(|c| c.gateway)),
                id: NetworkId::new(n.id),
                name: n.name,
            })
            .collect())
    }

    fn create_network(&self, name: &str) -> Result<NetworkId, EngineError> {
        let resp = self.post(
            &self.agent,
            "/networks/create",
            &[],
            Some(&json!({"Name": name, "CheckDuplicate": true})),
        )?;
        let raw: RawId = read_json(resp)?;
        Ok(NetworkId::new(raw.id))
    }

    fn remove_network(&self, id: &NetworkId) -> Result<(), EngineError> {
        self.delete(&format!("/networks/{id}"), &[])
    }
}

/// Resolve the daemon URL from configuration, then `DOCKER_HOST`.
///
/// `tcp://` is rewritten to `http://`; unix sockets are rejected.
pub fn resolve_daemon_url(configured: Option<&str>) -> Result<String, EngineError> {
    let raw = configured
        .map(str::to_owned)
        .or_else(|| std::env::var("DOCKER_HOST").ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| DEFAULT_DAEMON_URL.to_owned());

    if let Some(rest) = raw.strip_prefix("tcp://") {
        return Ok(format!("http://{}", rest.trim_end_matches('/')));
    }
    if raw.starts_with("http://") || raw.starts_with("https://") {
        return Ok(raw.trim_end_matches('/').to_owned());
    }
    let hint = if raw == DEFAULT_DAEMON_URL {
        format!(
            "the default socket {DEFAULT_DAEMON_URL} is not supported; \
             set engine.url or DOCKER_HOST to a TCP endpoint"
        )
    } else {
        "only tcp:// and http(s):// endpoints are supported".to_owned()
    };
    Err(EngineError::Unavailable(format!(
        "unsupported daemon url '{raw}': {hint} (e.g. DOCKER_HOST=tcp://127.0.0.1:2375)"
    )))
}

fn url_host(base: &str) -> String {
    let rest = base.split_once("://").map_or(base, |(_, r)| r);
    let authority = rest.split('/').next().unwrap_or(rest);
    if let Some(v6) = authority.strip_prefix('[') {
        return v6.split(']').next().unwrap_or(v6).to_owned();
    }
    authority
        .rsplit_once(':')
        .map_or(authority, |(h, _)| h)
        .to_owned()
}

fn flag(on: bool) -> &'static str {
    if on {
        "1"
    } else {
        "0"
    }
}

fn map_err(context: &str, e: ureq::Error) -> EngineError {
    match e {
        ureq::Error::StatusCode(404) => EngineError::NotFound(context.to_owned()),
        ureq::Error::StatusCode(status) => EngineError::Api {
            status,
            context: context.to_owned(),
        },
        ureq::Error::Io(e) => EngineError::Io(e),
        other => EngineError::Unavailable(format!("{context}: {other}")),
    }
}

fn read_json<T: DeserializeOwned>(resp: Response<Body>) -> Result<T, EngineError> {
    Ok(serde_json::from_reader(resp.into_body().into_reader())?)
}

/// Visit each of the concatenated JSON messages of a progress stream.
fn for_each_message(
    resp: Response<Body>,
    mut f: impl FnMut(Value) -> Result<(), EngineError>,
) -> Result<(), EngineError> {
    let reader = resp.into_body().into_reader();
    for message in serde_json::Deserializer::from_reader(reader).into_iter::<Value>() {
        f(message?)?;
    }
    Ok(())
}

fn create_body(spec: &ContainerSpec) -> Value {
    let mut body = Map::new();
    body.insert("Image".to_owned(), json!(spec.image));
    if !spec.cmd.is_empty() {
        body.insert("Cmd".to_owned(), json!(spec.cmd));
    }
    if !spec.labels.is_empty() {
        body.insert("Labels".to_owned(), json!(spec.labels));
    }
    if !spec.volumes.is_empty() {
        let volumes: Map<String, Value> = spec
            .volumes
            .iter()
            .map(|v| (v.clone(), json!({})))
            .collect();
        body.insert("Volumes".to_owned(), Value::Object(volumes));
    }

    let mut host_config = Map::new();
    if !spec.published_ports.is_empty() {
        let exposed: Map<String, Value> = spec
            .published_ports
            .iter()
            .map(|p| (format!("{p}/tcp"), json!({})))
            .collect();
        let bindings: Map<String, Value> = spec
            .published_ports
            .iter()
            .map(|p| (format!("{p}/tcp"), json!([{"HostIp": "", "HostPort": ""}])))
            .collect();
        body.insert("ExposedPorts".to_owned(), Value::Object(exposed));
        host_config.insert("PortBindings".to_owned(), Value::Object(bindings));
    }
    if !spec.volumes_from.is_empty() {
        host_config.insert("VolumesFrom".to_owned(), json!(spec.volumes_from));
    }
    body.insert("HostConfig".to_owned(), Value::Object(host_config));
    Value::Object(body)
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawVersion {
    version: String,
    api_version: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawId {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawImage {
    id: String,
    #[serde(default)]
    repo_tags: Option<Vec<String>>,
    #[serde(default)]
    created: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawHistory {
    id: String,
    #[serde(default)]
    created_by: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawContainer {
    id: String,
    #[serde(rename = "ImageID", default)]
    image_id: String,
    #[serde(default)]
    state: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawInspect {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    image: String,
    state: RawState,
    #[serde(default)]
    network_settings: RawNetworkSettings,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawState {
    running: bool,
    #[serde(default)]
    exit_code: Option<i64>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct RawNetworkSettings {
    #[serde(default)]
    ports: Option<BTreeMap<String, Option<Vec<RawBinding>>>>,
    #[serde(default)]
    networks: Option<BTreeMap<String, RawEndpoint>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawBinding {
    #[serde(default)]
    host_ip: String,
    #[serde(default)]
    host_port: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawEndpoint {
    #[serde(default)]
    gateway: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawExecInspect {
    #[serde(default)]
    exit_code: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawNetwork {
    id: String,
    name: String,
    #[serde(rename = "IPAM", default)]
    ipam: Option<RawIpam>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawIpam {
    #[serde(default)]
    config: Option<Vec<RawIpamConfig>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawIpamConfig {
    #[serde(default)]
    gateway: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_urls_are_rewritten() {
        assert_eq!(
            resolve_daemon_url(Some("tcp://127.0.0.1:2375/")).unwrap(),
            "http://127.0.0.1:2375"
        );
        assert_eq!(
            resolve_daemon_url(Some("https://docker.example:2376")).unwrap(),
            "https://docker.example:2376"
        );
    }

    #[test]
    fn unix_sockets_are_unavailable() {
        let err = resolve_daemon_url(Some("unix:///var/run/docker.sock")).unwrap_err();
        let EngineError::Unavailable(message) = err else {
            panic!("expected Unavailable, got {err:?}");
        };
        assert!(message.contains("default socket unix:///var/run/docker.sock"), "{message}");
        assert!(message.contains("DOCKER_HOST=tcp://"), "{message}");

        let err = resolve_daemon_url(Some("unix:///run/user/1000/podman.sock")).unwrap_err();
        assert!(!err.to_string().contains("default socket"), "{err}");
    }

    #[test]
    fn host_is_taken_from_url() {
        assert_eq!(url_host("http://127.0.0.1:2375"), "127.0.0.1");
        assert_eq!(url_host("http://docker.example"), "docker.example");
        assert_eq!(url_host("http://[::1]:2375"), "::1");
        let engine = HttpEngine::new("http://localhost:2375/", Duration::from_secs(1));
        assert_eq!(engine.daemon_host(), "localhost");
        assert_eq!(engine.base_url(), "http://localhost:2375");
    }

    #[test]
    fn create_body_publishes_ports_and_volumes() {
        let spec = ContainerSpec::new("img")
            .volume("/vct-mount")
            .publish(873)
            .label("vct", "")
            .volumes_from("sync");
        let body = create_body(&spec);
        assert_eq!(body["Image"], "img");
        assert!(body["Volumes"]["/vct-mount"].is_object());
        assert!(body["ExposedPorts"]["873/tcp"].is_object());
        assert_eq!(body["HostConfig"]["PortBindings"]["873/tcp"][0]["HostPort"], "");
        assert_eq!(body["HostConfig"]["VolumesFrom"][0], "sync");
        assert!(body.get("Cmd").is_none());
    }

    #[test]
    fn inspect_payload_parses() {
        let raw: RawInspect = serde_json::from_value(json!({
            "Id": "abc",
            "Name": "/vct",
            "Image": "sha256:img",
            "State": {"Running": true, "ExitCode": 0},
            "NetworkSettings": {
                "Ports": {"873/tcp": [{"HostIp": "0.0.0.0", "HostPort": "32768"}], "22/tcp": null},
                "Networks": {"bridge": {"Gateway": "172.17.0.1"}}
            }
        }))
        .unwrap();
        assert!(raw.state.running);
        let ports = raw.network_settings.ports.unwrap();
        assert_eq!(ports["873/tcp"].as_ref().unwrap()[0].host_port, "32768");
        assert!(ports["22/tcp"].is_none());
    }

    #[test]
    fn unreachable_daemon_is_unavailable() {
        let config = EngineSection {
            url: Some("tcp://127.0.0.1:1".to_owned()),
            request_timeout_secs: 1,
            ..EngineSection::default()
        };
        let err = HttpEngine::connect(&config).err().unwrap();
        assert!(matches!(err, EngineError::Unavailable(_)));
    }
}
