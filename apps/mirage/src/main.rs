use std::io::SeekFrom;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use rand::distributions::Alphanumeric;
use rand::Rng;
use range_fetch::RangeReader;
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

use mirage::cli::{Cli, Commands};
use mirage::client;
use mirage::config::Config;
use mirage::endpoint::ServerEndpointConfig;
use mirage::session::{LocalController, SessionServer, VmController};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve {
            bind,
            token,
            display,
            name,
            chunk_stats,
            image,
        } => {
            let mut config = Config::from_env();
            if let Some(bind) = bind {
                config.bind = bind;
            }
            if let Some(token) = token {
                config.auth_token = Some(token);
            }
            if let Some(display) = display {
                config.display = display;
            }
            if let Some(name) = name {
                config.vm_name = name;
            }
            if let Some(chunk_stats) = chunk_stats {
                config.chunk_stats = Some(chunk_stats);
            }
            if let Some(image) = image {
                config.image_url = Some(image);
            }
            serve(config).await
        }
        Commands::Connect {
            address,
            start,
            viewer,
        } => client::run_from_address(&address, start, viewer).await,
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    if let Some(image) = &config.image_url {
        preflight_image(image.clone()).await?;
    }

    let auth_token = match &config.auth_token {
        Some(token) => token.clone(),
        None => {
            let token = generate_token();
            info!(target: "mirage", %token, "generated viewer password");
            token
        }
    };

    let controller = LocalController::new(
        config.vm_name.clone(),
        config.display.clone(),
        config.chunk_stats.clone(),
        config.check_display,
    );
    controller
        .initialize()
        .await
        .map_err(|err| anyhow::anyhow!("controller initialization failed: {err}"))?;

    let server = SessionServer::bind(
        &config.bind,
        ServerEndpointConfig {
            auth_token,
            max_mouse_rate: config.max_mouse_rate,
            server_timeout_min: config.server_timeout_min,
            server_timeout_max: config.server_timeout_max,
        },
        controller.clone(),
    )
    .await
    .with_context(|| format!("failed to bind {}", config.bind))?;

    tokio::select! {
        result = server.run() => result.context("listener failed")?,
        _ = tokio::signal::ctrl_c() => {
            info!(target: "mirage", "shutting down");
            controller.shutdown().await;
        }
    }
    Ok(())
}

/// Verify the image server honors ranged requests before accepting
/// clients; a server that streams whole multi-gigabyte images on every
/// read is a misconfiguration worth failing on early.
async fn preflight_image(image: String) -> anyhow::Result<()> {
    let url = Url::parse(&image).context("invalid image URL")?;
    let length = tokio::task::spawn_blocking(move || -> Result<u64, range_fetch::FetchError> {
        let mut reader = RangeReader::open(url)?;
        let length = reader.len()?;
        if length > 0 {
            let probe = length.min(4096) as i64;
            reader.seek(SeekFrom::End(-probe))?;
            reader.read(Some(probe as usize))?;
        }
        Ok(length)
    })
    .await
    .context("preflight task failed")?
    .context("image preflight failed")?;
    info!(target: "mirage", image, length, "image preflight ok");
    Ok(())
}

fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect()
}
