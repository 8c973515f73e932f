use clap::Parser;
use color_eyre::eyre::WrapErr;
use kube::{Client, Config};

use local_static_provisioner::config::{Cli, ProvisionerConfig};
use local_static_provisioner::controller::ProvisionController;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let storage_class_map_yaml = std::fs::read_to_string(&cli.storage_class_map_path)
        .wrap_err_with(|| {
            format!(
                "reading storageClassMap from {}",
                cli.storage_class_map_path.display()
            )
        })?;

    let config = ProvisionerConfig::assemble(cli, &storage_class_map_yaml)
        .wrap_err("assembling provisioner configuration")?;

    tracing::info!(
        node = %config.node_name,
        classes = config.storage_classes.names().count(),
        "starting local-static-provisioner"
    );

    let client = build_client().await.wrap_err("building cluster client")?;

    let controller = ProvisionController::create(config, client)
        .await
        .wrap_err("initializing controller")?;

    controller
        .run(shutdown_signal())
        .await
        .wrap_err("controller exited with error")?;

    Ok(())
}

async fn build_client() -> color_eyre::Result<Client> {
    match Client::try_default().await {
        Ok(client) => Ok(client),
        Err(_) => {
            let config = Config::incluster_env().wrap_err("loading in-cluster kube config")?;
            Client::try_from(config).wrap_err("building in-cluster kube client")
        }
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
