//! Instance metadata lookup per provider

use super::{MetadataClient, MetadataError};
use crate::provider::Provider;
use crate::system::SystemFacts;
use common::Environment;
use serde::Serialize;
use tracing::info;

const GOOGLE_INSTANCE: &str = "/computeMetadata/v1/instance";
const GOOGLE_HEADERS: &[(&str, &str)] = &[("Metadata-Flavor", "Google")];
const AWS_META_DATA: &str = "/latest/meta-data";
const OPENSTACK_META_DATA: &str = "/openstack/latest/meta_data.json";
const OPENSTACK_EC2_META_DATA: &str = "/2009-04-04/meta-data";

/// Network identity of the running instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceMetadata {
    pub ip: String,
    pub id: String,
    pub zone: String,
}

impl InstanceMetadata {
    /// Locally derivable defaults; under orchestration `POD_IP` wins for `ip`.
    pub fn local(system: &SystemFacts, env: &Environment, orchestrated: bool) -> Self {
        let ip = match env.get("POD_IP") {
            Some(pod_ip) if orchestrated => pod_ip.to_string(),
            _ => system.host_ip.clone(),
        };
        Self {
            ip,
            id: system.hostname.clone(),
            zone: "local".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Field {
    Ip,
    Id,
    Zone,
}

impl InstanceMetadata {
    fn set(&mut self, field: Field, value: String) {
        match field {
            Field::Ip => self.ip = value,
            Field::Id => self.id = value,
            Field::Zone => self.zone = value,
        }
    }
}

/// Fetch instance metadata for a committed provider.
///
/// Orchestrators assign ip and id themselves, so those fields are only
/// looked up outside of orchestration. Any fetch failure is returned.
pub async fn fetch_instance_metadata<C: MetadataClient>(
    client: &C,
    provider: Provider,
    defaults: InstanceMetadata,
    orchestrated: bool,
) -> Result<InstanceMetadata, MetadataError> {
    let mut metadata = defaults;

    let (base, headers, mapping): (&str, &[(&str, &str)], Vec<(Field, &str)>) = match provider
    {
        Provider::Google => {
            let mut mapping = vec![(Field::Zone, "zone")];
            if !orchestrated {
                mapping.push((Field::Id, "id"));
            }
            (GOOGLE_INSTANCE, GOOGLE_HEADERS, mapping)
        }
        Provider::Aws => {
            let mut mapping = vec![(Field::Zone, "placement/availability-zone")];
            if !orchestrated {
                mapping.push((Field::Ip, "local-ipv4"));
                mapping.push((Field::Id, "instance-id"));
            }
            (AWS_META_DATA, &[], mapping)
        }
        Provider::Openstack => {
            let document = client
                .get(OPENSTACK_META_DATA, &[])
                .await?
                .into_text(OPENSTACK_META_DATA)?;
            let document: serde_json::Value =
                serde_json::from_str(&document).map_err(|source| MetadataError::Parse {
                    url: OPENSTACK_META_DATA.to_string(),
                    source,
                })?;
            metadata.zone = json_field(&document, "availability_zone")?;

            let mut mapping = Vec::new();
            if !orchestrated {
                metadata.id = json_field(&document, "uuid")?;
                // prefer the EC2 compatible API when the cloud offers it
                let ec2 = client.get(OPENSTACK_EC2_META_DATA, &[]).await?;
                if ec2.is_success() {
                    mapping.push((Field::Ip, "local-ipv4"));
                    mapping.push((Field::Id, "instance-id"));
                }
            }
            (OPENSTACK_EC2_META_DATA, &[], mapping)
        }
        Provider::Local | Provider::Unsupported => {
            info!("No meta-data available for this provider");
            return Ok(metadata);
        }
    };

    for (field, sub_path) in mapping {
        let path = format!("{}/{}", base, sub_path);
        let value = client.get(&path, headers).await?.into_text(&path)?;
        metadata.set(field, value.trim().to_string());
    }

    Ok(metadata)
}

fn json_field(document: &serde_json::Value, field: &'static str) -> Result<String, MetadataError> {
    document
        .get(field)
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .ok_or(MetadataError::MissingField {
            url: OPENSTACK_META_DATA.to_string(),
            field,
        })
}
