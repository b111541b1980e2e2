//! SSL certificates for PostgreSQL and the REST API
//!
//! Provided certificate content is written to the configured paths. Without
//! it a self-signed certificate is generated with the openssl crate.

use super::files::{make_private, FileWriter};
use crate::placeholders::Placeholders;
use anyhow::{Context, Result};
use openssl::asn1::{Asn1Integer, Asn1Time};
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::{X509NameBuilder, X509};
use std::path::Path;
use tracing::{debug, info, warn};

/// Subject of the generated certificate.
pub const SELF_SIGNED_CN: &str = "spilo.example.org";
const SELF_SIGNED_DAYS: u32 = 30;
const RSA_BITS: u32 = 2048;

/// PEM encoded certificate and private key.
#[derive(Debug)]
pub struct SelfSigned {
    pub certificate: String,
    pub private_key: String,
}

/// Generate an RSA key and a self-signed certificate for `common_name`.
pub fn generate_self_signed(common_name: &str, days: u32) -> Result<SelfSigned> {
    let key = PKey::from_rsa(Rsa::generate(RSA_BITS).context("Failed to generate RSA key")?)
        .context("Failed to wrap RSA key")?;

    let mut name = X509NameBuilder::new().context("Failed to create X509 name")?;
    name.append_entry_by_nid(Nid::COMMONNAME, common_name)
        .context("Failed to set common name")?;
    let name = name.build();

    let mut builder = X509::builder().context("Failed to create X509 builder")?;
    builder.set_version(2).context("Failed to set X509 version")?;
    let serial = random_serial()?;
    builder
        .set_serial_number(&serial)
        .context("Failed to set serial number")?;
    builder.set_subject_name(&name).context("Failed to set subject")?;
    builder.set_issuer_name(&name).context("Failed to set issuer")?;
    builder.set_pubkey(&key).context("Failed to set public key")?;
    let not_before = Asn1Time::days_from_now(0).context("Failed to get current time")?;
    builder.set_not_before(&not_before).context("Failed to set start date")?;
    let not_after = Asn1Time::days_from_now(days).context("Failed to compute expiry")?;
    builder.set_not_after(&not_after).context("Failed to set expiry")?;
    builder
        .sign(&key, MessageDigest::sha256())
        .context("Failed to sign certificate")?;
    let certificate = builder.build();

    Ok(SelfSigned {
        certificate: pem_string(certificate.to_pem().context("Failed to encode certificate")?)?,
        private_key: pem_string(
            key.private_key_to_pem_pkcs8()
                .context("Failed to encode private key")?,
        )?,
    })
}

fn random_serial() -> Result<Asn1Integer> {
    let mut serial = BigNum::new().context("Failed to allocate serial")?;
    serial
        .rand(127, MsbOption::MAYBE_ZERO, false)
        .context("Failed to generate serial")?;
    serial.to_asn1_integer().context("Failed to encode serial")
}

fn pem_string(pem: Vec<u8>) -> Result<String> {
    String::from_utf8(pem).context("PEM output is not valid UTF-8")
}

/// Write or generate the PostgreSQL server certificate.
pub fn write_certificates(placeholders: &Placeholders, writer: &FileWriter) -> Result<()> {
    let key_file = placeholders.require_text("SSL_PRIVATE_KEY_FILE")?;
    let cert_file = placeholders.require_text("SSL_CERTIFICATE_FILE")?;
    let key_path = Path::new(&key_file);

    if placeholders.contains("SSL_CERTIFICATE") && placeholders.contains("SSL_PRIVATE_KEY") {
        info!("Writing custom ssl certificate");
        write_provided(placeholders, writer, "SSL_CERTIFICATE", &cert_file)?;
        write_provided(placeholders, writer, "SSL_PRIVATE_KEY", &key_file)?;
        write_optional(placeholders, writer, "SSL_CA", "SSL_CA_FILE", "ca certificate")?;
        write_optional(placeholders, writer, "SSL_CRL", "SSL_CRL_FILE", "certificate revocation list")?;
    } else {
        if key_path.exists() && !writer.force() {
            warn!(
                path = %key_path.display(),
                "Private key already exists, not overwriting. (Use option --force if necessary)"
            );
            return Ok(());
        }
        info!(cn = SELF_SIGNED_CN, "Generating ssl self-signed certificate");
        let generated = generate_self_signed(SELF_SIGNED_CN, SELF_SIGNED_DAYS)?;
        writer.write_always(&generated.private_key, key_path)?;
        writer.write_always(&generated.certificate, Path::new(&cert_file))?;
    }

    make_private(key_path)?;
    writer.chown(key_path)
}

/// Write the REST API certificate when both certificate and key are provided.
pub fn write_restapi_certificates(placeholders: &Placeholders, writer: &FileWriter) -> Result<()> {
    if !(placeholders.contains("SSL_RESTAPI_CERTIFICATE")
        && placeholders.contains("SSL_RESTAPI_PRIVATE_KEY"))
    {
        debug!("No REST API certificate provided");
        return Ok(());
    }

    info!("Writing REST API custom ssl certificate");
    let cert_file = placeholders.require_text("SSL_RESTAPI_CERTIFICATE_FILE")?;
    let key_file = placeholders.require_text("SSL_RESTAPI_PRIVATE_KEY_FILE")?;
    write_provided(placeholders, writer, "SSL_RESTAPI_CERTIFICATE", &cert_file)?;
    write_provided(placeholders, writer, "SSL_RESTAPI_PRIVATE_KEY", &key_file)?;
    write_optional(
        placeholders,
        writer,
        "SSL_RESTAPI_CA",
        "SSL_RESTAPI_CA_FILE",
        "REST API ca certificate",
    )?;

    let key_path = Path::new(&key_file);
    make_private(key_path)?;
    writer.chown(key_path)
}

fn write_provided(placeholders: &Placeholders, writer: &FileWriter, content_key: &str, path: &str) -> Result<()> {
    let content = placeholders.require_text(content_key)?;
    writer.write(&content, Path::new(path))?;
    Ok(())
}

fn write_optional(
    placeholders: &Placeholders,
    writer: &FileWriter,
    content_key: &str,
    path_key: &str,
    what: &str,
) -> Result<()> {
    if !placeholders.contains(content_key) {
        info!("No {} to write", what);
        return Ok(());
    }
    info!("Writing ssl {}", what);
    write_provided(placeholders, writer, content_key, &placeholders.require_text(path_key)?)
}
