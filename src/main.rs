use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod catalog;
mod cli;
mod config;
mod engine;
#[cfg(test)]
mod tests;
mod web;

use catalog::Product;
use config::Config;
use engine::MatchEngine;

fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn load_products(path: Option<&Path>) -> anyhow::Result<Vec<Product>> {
    match path {
        Some(path) => catalog::load_catalog(path),
        None => catalog::sample_catalog(),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();
    init_logging();

    let base_path = config::base_path()?;
    let config = Config::load_with(&base_path)?;
    let engine = Arc::new(MatchEngine::from_config(&config));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    runtime.block_on(async move {
        match args.command {
            cli::Command::Match {
                image,
                threshold,
                limit,
                catalog,
            } => {
                if let Some(t) = threshold {
                    anyhow::ensure!(
                        (0.0..=1.0).contains(&t),
                        "threshold must be between 0.0 and 1.0, got {t}"
                    );
                }
                let products = load_products(catalog.catalog.as_deref())?;

                let mut outcome = engine.match_image(&image, &products, threshold).await?;
                if let Some(limit) = limit {
                    outcome.results.truncate(limit);
                }

                if let Some(notice) = &outcome.notice {
                    log::warn!("{notice}");
                }
                print_json(&outcome)?;
            }

            cli::Command::Precompute { catalog } => {
                let products = load_products(catalog.catalog.as_deref())?;
                let report = engine.precompute(&products).await?;
                print_json(&report)?;
            }

            cli::Command::SelfTest { image } => {
                let image = match image {
                    Some(image) => image,
                    None => catalog::sample_catalog()?
                        .into_iter()
                        .next()
                        .map(|p| p.image_url)
                        .context("sample catalog is empty")?,
                };

                let report = engine.self_test(&image).await;
                print_json(&report)?;
                anyhow::ensure!(report.ok, "self-test failed");
            }

            cli::Command::Serve { listen, catalog } => {
                let products = load_products(catalog.catalog.as_deref())?;
                log::info!("serving {} catalog products", products.len());

                let listen = listen.unwrap_or_else(|| config.server.listen.clone());
                let state = web::SharedState::new(engine, products);
                web::serve(state, &listen).await?;
            }
        }

        Ok::<(), anyhow::Error>(())
    })
}
