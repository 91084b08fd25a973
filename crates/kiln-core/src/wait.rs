//! Service readiness waits and published-port resolution.

use crate::CoreError;
use kiln_engine::{ContainerEngine, ContainerInfo};
use kiln_schema::ContainerId;
use std::io::Read;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Extra condition polled alongside a wait. An error aborts the wait, for
/// example when the container behind the service stopped.
pub type ExtraCheck<'a> = &'a dyn Fn() -> Result<(), CoreError>;

/// A port number currently free for binding.
pub fn available_port() -> Result<u16, CoreError> {
    let listener = TcpListener::bind(("0.0.0.0", 0))?;
    Ok(listener.local_addr()?.port())
}

fn poll_until(
    what: &str,
    timeout: Duration,
    extra_check: Option<ExtraCheck<'_>>,
    mut ready: impl FnMut() -> bool,
) -> Result<(), CoreError> {
    let start = Instant::now();
    loop {
        if ready() {
            return Ok(());
        }
        if let Some(check) = extra_check {
            check()?;
        }
        if start.elapsed() > timeout {
            return Err(CoreError::Timeout {
                what: what.to_owned(),
                after: timeout,
            });
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Wait until `http://host:port/path` answers 200.
pub fn wait_for_http(
    host: &str,
    port: u16,
    path: &str,
    timeout: Duration,
    extra_check: Option<ExtraCheck<'_>>,
) -> Result<(), CoreError> {
    let url = format!("http://{host}:{port}/{}", path.trim_start_matches('/'));
    let agent: ureq::Agent = ureq::Agent::config_builder()
        .timeout_global(Some(PROBE_TIMEOUT))
        .build()
        .into();
    poll_until(&format!("HTTP at {url}"), timeout, extra_check, || {
        agent
            .get(&url)
            .call()
            .is_ok_and(|resp| resp.status().as_u16() == 200)
    })
}

/// Wait until a TCP connection to `host:port` succeeds.
pub fn wait_for_tcp(
    host: &str,
    port: u16,
    timeout: Duration,
    extra_check: Option<ExtraCheck<'_>>,
) -> Result<(), CoreError> {
    poll_until(&format!("TCP at {host}:{port}"), timeout, extra_check, || {
        connect(host, port).is_some()
    })
}

/// Wait until an SSH server at `host:port` sends its identification banner.
pub fn wait_for_ssh(
    host: &str,
    port: u16,
    timeout: Duration,
    extra_check: Option<ExtraCheck<'_>>,
) -> Result<(), CoreError> {
    poll_until(&format!("SSH at {host}:{port}"), timeout, extra_check, || {
        let Some(mut stream) = connect(host, port) else {
            return false;
        };
        if stream.set_read_timeout(Some(PROBE_TIMEOUT)).is_err() {
            return false;
        }
        let mut banner = [0u8; 4];
        stream.read_exact(&mut banner).is_ok() && &banner == b"SSH-"
    })
}

fn connect(host: &str, port: u16) -> Option<TcpStream> {
    let addr = (host, port).to_socket_addrs().ok()?.next()?;
    TcpStream::connect_timeout(&addr, PROBE_TIMEOUT).ok()
}

/// Host address and port where `port` of a container is reachable.
///
/// The binding's host IP wins unless it is the wildcard address. Otherwise a
/// remote daemon's hostname is used; for a local daemon the container's
/// network gateway, then the default bridge gateway.
pub fn host_endpoint(
    engine: &dyn ContainerEngine,
    info: &ContainerInfo,
    port: u16,
) -> Result<(String, u16), CoreError> {
    let binding = info
        .ports
        .get(&port)
        .and_then(|b| b.first())
        .ok_or_else(|| CoreError::PortNotPublished {
            container: info.id.clone(),
            port,
        })?;

    if !binding.host_ip.is_empty() && binding.host_ip != "0.0.0.0" {
        return Ok((binding.host_ip.clone(), binding.host_port));
    }

    let daemon = engine.daemon_host();
    if !is_local(&daemon) {
        return Ok((daemon, binding.host_port));
    }

    if let Some(gateway) = info.gateways.iter().find(|g| !g.is_empty()) {
        return Ok((gateway.clone(), binding.host_port));
    }

    engine
        .list_networks()?
        .into_iter()
        .find(|n| n.name == "bridge")
        .and_then(|n| n.gateway)
        .map(|gateway| (gateway, binding.host_port))
        .ok_or_else(|| CoreError::NoHostAddress(info.id.clone()))
}

fn is_local(host: &str) -> bool {
    matches!(host, "" | "localhost" | "127.0.0.1" | "::1" | "localunixsocket")
}

/// A check that fails once container `id` is gone or stopped.
pub fn assert_running_fn(
    engine: &dyn ContainerEngine,
    id: ContainerId,
) -> impl Fn() -> Result<(), CoreError> + '_ {
    move || match engine.inspect_container(&id) {
        Ok(info) if info.running => Ok(()),
        Ok(_) => Err(CoreError::ContainerStopped(id.clone())),
        Err(e) if e.is_not_found() => Err(CoreError::ContainerStopped(id.clone())),
        Err(e) => Err(e.into()),
    }
}
