//! configure-spilo - Generate the Patroni configuration and companion files
//!
//! Detects the platform, derives the placeholder mapping, assembles the
//! Patroni document and runs the requested sections.

use anyhow::Result;
use clap::Parser;
use common::{init_logging, resolve_level, Environment};
use spilo_configure::document::assemble;
use spilo_configure::metadata::{
    fetch_instance_metadata, HttpMetadataClient, InstanceMetadata, FETCH_TIMEOUT, PROBE_TIMEOUT,
};
use spilo_configure::paths;
use spilo_configure::placeholders::{derive_placeholders, DerivationInput};
use spilo_configure::provider::resolve_provider;
use spilo_configure::sections::{run_section, Section, SectionContext};
use spilo_configure::system::{is_orchestrated, SystemFacts};
use spilo_configure::template::render_config;
use spilo_configure::writers::{runit, FileWriter};
use std::process::ExitCode;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "configure-spilo", about = "Configures Spilo", version)]
struct Cli {
    /// Sections to configure
    #[arg(value_enum, required = true, num_args = 1..)]
    sections: Vec<Section>,

    /// Log level (DEBUG=1 in the environment forces debug)
    #[arg(short, long)]
    loglevel: Option<String>,

    /// Overwrite files if they exist
    #[arg(short, long)]
    force: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let env = Environment::capture();

    let debug = matches!(env.get("DEBUG"), Some("1" | "true" | "TRUE" | "on" | "ON"));
    let _guard = init_logging("configure-spilo", resolve_level(debug, cli.loglevel.as_deref()));

    let client = HttpMetadataClient::new(PROBE_TIMEOUT);
    let provider = resolve_provider(&env, &client).await;
    info!("Looks like you are running {}", provider);

    let system = SystemFacts::detect(&env);
    let orchestrated = is_orchestrated(&env);
    let defaults = InstanceMetadata::local(&system, &env, orchestrated);
    let client = client.with_timeout(FETCH_TIMEOUT);
    let instance = fetch_instance_metadata(&client, provider, defaults, orchestrated).await?;

    let mut placeholders = derive_placeholders(&DerivationInput {
        env: &env,
        provider,
        instance,
        system: &system,
    })?;
    let rendered = render_config(&placeholders)?;
    let document = assemble(rendered, &mut placeholders, &env, provider, paths::LIB_DIR).await?;

    if document.local_etcd {
        let rw_dir = paths::rw_dir(&env);
        runit::link_service(&rw_dir, "etcd")?;
    }

    let writer = FileWriter::for_postgres(cli.force)?;
    let mut ctx = SectionContext {
        placeholders: &mut placeholders,
        document: &document,
        writer: &writer,
    };
    for section in Section::expand(&cli.sections) {
        run_section(section, &mut ctx).await?;
    }

    // Non-zero tells the entrypoint that WAL archiving is off.
    Ok(if placeholders.truthy("USE_WALE") {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sections_are_required() {
        assert!(Cli::try_parse_from(["configure-spilo"]).is_err());
        assert!(Cli::try_parse_from(["configure-spilo", "-f"]).is_err());

        let cli = Cli::try_parse_from(["configure-spilo", "patroni", "wal-e", "--force"]).unwrap();
        assert_eq!(cli.sections, [Section::Patroni, Section::WalE]);
        assert!(cli.force);
    }
}
