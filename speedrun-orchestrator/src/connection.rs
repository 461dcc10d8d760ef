use serde_json::Value;
use speedrun_common::{Endpoint, Instance};

pub const DEFAULT_SSH_PORT: u16 = 22;
const SSH_CONTAINER_PORT: &str = "22/tcp";

/// A connectivity shape an instance record may expose.
type Strategy = fn(&Instance) -> Option<Endpoint>;

/// Resolution order; first match wins. Different host configurations expose
/// SSH differently, so every shape stays in the list.
const STRATEGIES: [(&str, Strategy); 3] = [
    ("ssh_host/ssh_port", direct_ssh_fields),
    ("ports[22/tcp]", port_mapping),
    ("direct_port_start", direct_port_start),
];

/// Derive the SSH endpoint of an instance. Never fails: without any
/// connectivity field the public address on port 22 is used.
pub fn resolve(instance: &Instance) -> Endpoint {
    advertised(instance).unwrap_or_else(|| default_endpoint(instance))
}

/// Endpoint from the first connectivity field the record carries, if any.
pub fn advertised(instance: &Instance) -> Option<Endpoint> {
    STRATEGIES.iter().find_map(|(name, strategy)| {
        let endpoint = strategy(instance)?;
        tracing::debug!(strategy = *name, endpoint = %endpoint, "resolved ssh endpoint");
        Some(endpoint)
    })
}

/// Public address on the standard SSH port.
pub fn default_endpoint(instance: &Instance) -> Endpoint {
    Endpoint {
        host: public_host(instance),
        port: DEFAULT_SSH_PORT,
    }
}

fn public_host(instance: &Instance) -> String {
    instance.public_ipaddr.clone().unwrap_or_default()
}

/// Ports arrive as numbers or numeric strings depending on the record.
fn as_port(value: &Value) -> Option<u16> {
    let port = match value {
        Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Value::String(s) => s.trim().parse::<u16>().ok(),
        _ => None,
    };
    port.filter(|p| *p != 0)
}

fn direct_ssh_fields(instance: &Instance) -> Option<Endpoint> {
    let host = instance
        .metadata
        .get("ssh_host")?
        .as_str()
        .map(str::trim)
        .filter(|h| !h.is_empty())?;
    let port = as_port(instance.metadata.get("ssh_port")?)?;
    Some(Endpoint {
        host: host.to_string(),
        port,
    })
}

fn port_mapping(instance: &Instance) -> Option<Endpoint> {
    let binding = instance.metadata.get("ports")?.get(SSH_CONTAINER_PORT)?;
    let port = match binding {
        Value::Array(bindings) => as_port(bindings.first()?.get("HostPort")?)?,
        other => as_port(other)?,
    };
    Some(Endpoint {
        host: public_host(instance),
        port,
    })
}

fn direct_port_start(instance: &Instance) -> Option<Endpoint> {
    let port = as_port(instance.metadata.get("direct_port_start")?)?;
    Some(Endpoint {
        host: public_host(instance),
        port,
    })
}
