use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use utils::version;
use vfio_device_plugin::config;
use vfio_device_plugin::config::Cli;
use vfio_device_plugin::config::PluginConfig;
use vfio_device_plugin::controller::Controller;
use vfio_device_plugin::controller::EventSources;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    utils::logging::init();

    tracing::info!(
        "Starting VFIO device plugin for Kubernetes {}",
        &**version::VERSION
    );

    let config = config::load(&cli.config)
        .await
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    run(&config).await?;

    tracing::info!("VFIO device plugin stopped");
    Ok(())
}

/// Drive the controller from the filesystem and signal sources until a
/// shutdown. A controller failure is returned, the caller reports it.
async fn run(config: &PluginConfig) -> Result<()> {
    let mut sources = EventSources::start(&config.plugin_dir, config.kubelet_socket_path())
        .map_err(|report| anyhow::anyhow!("{report:?}"))?;

    Controller::from_config(config)
        .run(&mut sources.events)
        .await
        .map_err(|report| anyhow::anyhow!("device plugin controller failed: {report:?}"))
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use test_log::test;

    use super::*;

    #[test(tokio::test)]
    async fn controller_failure_is_returned_to_the_caller() {
        let dir = TempDir::new().expect("should create temp dir");
        let config = PluginConfig {
            sysfs_root: dir.path().join("missing-sys"),
            plugin_dir: dir.path().to_path_buf(),
            ..PluginConfig::default()
        };

        let err = run(&config)
            .await
            .expect_err("an unreadable sysfs root should end the controller");
        let message = err.to_string();
        assert!(message.starts_with("device plugin controller failed"));
        assert!(message.contains("Device discovery failed"));
    }
}
