//! Coordination backend (DCS) section
//!
//! Variables named `<DCS>_<PARAM>` configure the distributed configuration
//! store used by Patroni. Only parameters declared for a backend are picked
//! up; anything else sharing the prefix (e.g. `KUBERNETES_SERVICE_HOST`) is
//! ignored.

use crate::error::{ConfigureError, Result};
use crate::placeholders::{PlaceholderValue, Placeholders, KUBERNETES_DEFAULT_LABELS};
use crate::system;
use common::Environment;
use serde_yaml::{Mapping, Value};
use tracing::warn;

/// Supported coordination backends, in selection order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dcs {
    Kubernetes,
    Zookeeper,
    Exhibitor,
    Consul,
    Etcd3,
    Etcd,
}

const ETCD_PARAMS: &[&str] = &[
    "host",
    "hosts",
    "url",
    "proxy",
    "srv",
    "srv_suffix",
    "discovery_domain",
    "protocol",
    "username",
    "password",
    "cacert",
    "cert",
    "key",
    "use_proxies",
];

impl Dcs {
    pub const ALL: [Dcs; 6] = [
        Self::Kubernetes,
        Self::Zookeeper,
        Self::Exhibitor,
        Self::Consul,
        Self::Etcd3,
        Self::Etcd,
    ];

    /// Section name in the Patroni configuration.
    pub fn name(self) -> &'static str {
        match self {
            Self::Kubernetes => "kubernetes",
            Self::Zookeeper => "zookeeper",
            Self::Exhibitor => "exhibitor",
            Self::Consul => "consul",
            Self::Etcd3 => "etcd3",
            Self::Etcd => "etcd",
        }
    }

    /// Recognised parameter names (lower case).
    pub fn params(self) -> &'static [&'static str] {
        match self {
            Self::Kubernetes => &[
                "labels",
                "role_label",
                "scope_label",
                "use_configmaps",
                "bypass_api_service",
                "leader_label_value",
                "follower_label_value",
                "standby_leader_label_value",
                "tmp_role_label",
                "pod_ip",
                "cacert",
                "context",
                "retriable_http_codes",
            ],
            Self::Zookeeper => &[
                "hosts",
                "use_ssl",
                "cacert",
                "cert",
                "key",
                "key_password",
                "verify",
                "set_acls",
                "auth_data",
            ],
            Self::Exhibitor => &["hosts", "port", "poll_interval"],
            Self::Consul => &[
                "host",
                "url",
                "port",
                "scheme",
                "token",
                "verify",
                "cacert",
                "cert",
                "key",
                "dc",
                "consistency",
                "checks",
                "register_service",
                "service_tags",
                "service_check_interval",
                "service_check_tls_server_name",
            ],
            Self::Etcd3 | Self::Etcd => ETCD_PARAMS,
        }
    }

    /// Whether a top-level configuration key names a backend.
    pub fn is_section(key: &str) -> bool {
        Self::ALL.iter().any(|dcs| dcs.name() == key)
    }

    fn env_prefix(self) -> String {
        format!("{}_", self.name().to_uppercase())
    }
}

/// Build the DCS part of the configuration document.
///
/// Kubernetes is used when orchestrated with `DCS_ENABLE_KUBERNETES_API`;
/// otherwise the first other backend with any parameter wins. A non-default
/// namespace is added as top-level `namespace`.
pub fn dcs_config(placeholders: &Placeholders, env: &Environment) -> Result<Mapping> {
    let mut config = Mapping::new();

    if system::is_orchestrated(env) && placeholders.truthy("DCS_ENABLE_KUBERNETES_API") {
        let params = collect_params(placeholders, Dcs::Kubernetes)?;
        config.insert(
            Value::from(Dcs::Kubernetes.name()),
            Value::Mapping(kubernetes_section(params)),
        );
    } else {
        for dcs in Dcs::ALL.into_iter().filter(|d| *d != Dcs::Kubernetes) {
            let params = collect_params(placeholders, dcs)?;
            if !params.is_empty() {
                config.insert(Value::from(dcs.name()), Value::Mapping(params));
                break;
            }
        }
    }

    let namespace = placeholders.text_or_empty("NAMESPACE");
    if !matches!(namespace.as_str(), "" | "default") {
        config.insert(Value::from("namespace"), Value::from(namespace));
    }

    Ok(config)
}

fn collect_params(placeholders: &Placeholders, dcs: Dcs) -> Result<Mapping> {
    let prefix = dcs.env_prefix();
    let mut params = Mapping::new();

    for (name, value) in placeholders.iter() {
        let Some(param) = name.strip_prefix(&prefix).map(str::to_lowercase) else {
            continue;
        };
        if !dcs.params().contains(&param.as_str()) {
            continue;
        }

        let (key, value) = match param.as_str() {
            "hosts" => ("hosts".to_string(), parse_hosts(name, value)?),
            "discovery_domain" => ("discovery_srv".to_string(), yaml_value(value)),
            _ => (param, yaml_value(value)),
        };
        params.insert(Value::from(key), value);
    }

    Ok(params)
}

/// Hosts are a YAML list; a bare comma separated list is accepted too.
fn parse_hosts(name: &str, value: &PlaceholderValue) -> Result<Value> {
    let text = value.as_text().map(|t| t.into_owned()).unwrap_or_default();
    let text = if text.trim().starts_with('-') || text.contains('[') {
        text
    } else {
        format!("[{}]", text)
    };
    serde_yaml::from_str(&text).map_err(|source| ConfigureError::Yaml {
        what: name.to_string(),
        source,
    })
}

fn yaml_value(value: &PlaceholderValue) -> Value {
    match value {
        PlaceholderValue::Str(s) => Value::from(s.as_str()),
        PlaceholderValue::Bool(b) => Value::from(*b),
        PlaceholderValue::Int(i) => Value::from(*i),
        PlaceholderValue::List(_) | PlaceholderValue::Map(_) => {
            serde_yaml::to_value(value).unwrap_or(Value::Null)
        }
    }
}

fn kubernetes_section(mut section: Mapping) -> Mapping {
    let labels_text = section
        .get("labels")
        .and_then(Value::as_str)
        .map(str::to_string);
    let labels = match labels_text.as_deref().map(serde_json::from_str::<serde_json::Value>) {
        Some(Ok(labels)) => labels,
        Some(Err(e)) => {
            warn!(error = %e, default = KUBERNETES_DEFAULT_LABELS,
                "Could not parse kubernetes labels as JSON, reverting to the default");
            default_labels()
        }
        None => {
            warn!(default = KUBERNETES_DEFAULT_LABELS, "No kubernetes labels set, using the default");
            default_labels()
        }
    };
    section.insert(
        Value::from("labels"),
        serde_yaml::to_value(labels).unwrap_or(Value::Null),
    );

    let use_configmaps = section
        .remove("use_configmaps")
        .is_some_and(|v| v.as_str().map_or(!v.is_null(), |s| !s.is_empty()));
    if !use_configmaps {
        section.insert(Value::from("use_endpoints"), Value::from(true));
        let mut port = Mapping::new();
        port.insert(Value::from("port"), Value::from(5432));
        port.insert(Value::from("name"), Value::from("postgresql"));
        section.insert(
            Value::from("ports"),
            Value::Sequence(vec![Value::Mapping(port)]),
        );
    }

    let bypass = section
        .remove("bypass_api_service")
        .and_then(|v| v.as_str().map(str::to_lowercase));
    if bypass.as_deref() == Some("true") {
        section.insert(Value::from("bypass_api_service"), Value::from(true));
    }

    section
}

fn default_labels() -> serde_json::Value {
    serde_json::json!({"application": "spilo"})
}
