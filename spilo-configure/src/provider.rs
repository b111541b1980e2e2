//! Hosting provider resolution
//!
//! Precedence: explicit `SPILO_PROVIDER`, then the `DEVELOP` flag, then
//! probing the link-local metadata service. An unreachable service means a
//! local container.

use crate::metadata::{MetadataClient, MetadataError};
use common::Environment;
use std::fmt;
use std::str::FromStr;
use tracing::{error, info};

const GOOGLE_FLAVOR: &str = "Google";

/// Hosting environment of the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Aws,
    Google,
    Openstack,
    Local,
    Unsupported,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aws => "aws",
            Self::Google => "google",
            Self::Openstack => "openstack",
            Self::Local => "local",
            Self::Unsupported => "unsupported",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Only the four selectable providers parse; `unsupported` is a result, not a choice.
impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aws" => Ok(Self::Aws),
            "google" => Ok(Self::Google),
            "openstack" => Ok(Self::Openstack),
            "local" => Ok(Self::Local),
            other => Err(other.to_string()),
        }
    }
}

/// Resolve the provider for this run.
pub async fn resolve_provider<C: MetadataClient>(env: &Environment, client: &C) -> Provider {
    if let Some(requested) = env.non_empty("SPILO_PROVIDER") {
        return requested.parse().unwrap_or_else(|unknown| {
            error!(provider = %unknown, "Unknown SPILO_PROVIDER");
            Provider::Unsupported
        });
    }

    if env.flag("DEVELOP") {
        return Provider::Local;
    }

    info!("Figuring out my environment (Google? AWS? Openstack? Local?)");
    match probe(client).await {
        Ok(provider) => provider,
        Err(MetadataError::Parse { .. }) => {
            info!("Could not parse response from the metadata service, assuming local setup");
            Provider::Local
        }
        Err(e) => {
            info!(error = %e, "Could not connect to the metadata service, assuming local setup");
            Provider::Local
        }
    }
}

async fn probe<C: MetadataClient>(client: &C) -> Result<Provider, MetadataError> {
    let root = client.get("/", &[]).await?;
    if root.header("Metadata-Flavor") == Some(GOOGLE_FLAVOR) {
        return Ok(Provider::Google);
    }

    // reachable on OpenStack only; some proxies answer with non-JSON bodies
    let path = "/openstack/latest/meta_data.json";
    let openstack = client.get(path, &[]).await?;
    if openstack.is_success() {
        openstack.json(path)?;
        return Ok(Provider::Openstack);
    }

    // answered by both AWS and OpenStack
    let ami = client.get("/latest/meta-data/ami-id", &[]).await?;
    Ok(if ami.is_success() {
        Provider::Aws
    } else {
        Provider::Unsupported
    })
}
