//! kube-broker entry point

use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use jsonwebtoken::DecodingKey;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kube_broker::applier::Fabricator;
use kube_broker::broker::{broker_router, BrokerContext};
use kube_broker::catalog::{DynamicRegistry, ServicesCatalog};
use kube_broker::config::BrokerSettings;
use kube_broker::creator::{ClusterDirectory, CreatorClient};
use kube_broker::jobs::JobPoller;
use kube_broker::progress::ProgressStore;
use kube_broker::registry::ConsulRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Failed to install crypto provider");

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let settings = BrokerSettings::parse();
    tracing::info!(port = settings.port, "kube-broker starting");

    // the catalog is load-bearing: refuse to start without it
    let catalog = ServicesCatalog::load(&settings.catalog_path)
        .with_context(|| format!("loading catalog from {}", settings.catalog_path))?;
    tracing::info!(
        services = catalog.services.len(),
        root = %settings.catalog_path,
        "catalog loaded"
    );

    let creator = CreatorClient::new(
        &settings.creator_url,
        &settings.creator_user,
        &settings.creator_pass,
        settings.http_timeout(),
        settings.insecure_skip_verify,
    )
    .context("building cluster-creator client")?;
    let directory = Arc::new(ClusterDirectory::new(
        Arc::new(creator),
        settings.max_org_quota,
    ));

    let registry = Arc::new(
        ConsulRegistry::new(settings.http_timeout(), settings.insecure_skip_verify)
            .context("building service registry client")?,
    );
    let kubernetes = Arc::new(Fabricator::new(
        registry,
        settings.domain.clone(),
        settings.insecure_skip_verify,
    ));

    let jwt_key = match &settings.jwt_public_key_file {
        Some(path) => {
            let pem = std::fs::read(path)
                .with_context(|| format!("reading JWT public key from {path}"))?;
            Some(DecodingKey::from_rsa_pem(&pem).context("parsing JWT public key")?)
        }
        None => {
            tracing::warn!("JWT public key not configured, /rest routes will reject all requests");
            None
        }
    };

    let progress = Arc::new(ProgressStore::new());
    let jobs = Arc::new(JobPoller::new(
        kubernetes.clone(),
        progress.clone(),
        settings.job_poll_interval(),
    ));

    let tracker = TaskTracker::new();
    let shutdown = CancellationToken::new();
    jobs.clone().spawn(&tracker, shutdown.clone());

    let ctx = BrokerContext {
        settings: Arc::new(settings.clone()),
        catalog: Arc::new(RwLock::new(catalog)),
        dynamic: Arc::new(DynamicRegistry::new()),
        progress,
        directory,
        kubernetes,
        jobs,
        tracker: tracker.clone(),
        shutdown: shutdown.clone(),
        jwt_key,
    };

    let app = broker_router(ctx);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], settings.port));

    let handle = axum_server::Handle::new();
    tokio::spawn(wait_for_shutdown(handle.clone(), shutdown.clone()));

    if settings.ssl_active {
        let cert = settings
            .ssl_cert_file
            .as_deref()
            .context("CONTAINER_BROKER_SSL_CERT_FILE_LOCATION required when SSL is active")?;
        let key = settings
            .ssl_key_file
            .as_deref()
            .context("CONTAINER_BROKER_SSL_KEY_FILE_LOCATION required when SSL is active")?;
        let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key)
            .await
            .context("loading TLS certificate")?;

        tracing::info!(%addr, "listening with TLS");
        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await
            .context("server error")?;
    } else {
        tracing::info!(%addr, "listening");
        axum_server::bind(addr)
            .handle(handle)
            .serve(app.into_make_service())
            .await
            .context("server error")?;
    }

    // let reapers and the job poller observe the token and finish
    tracker.close();
    tracker.wait().await;
    tracing::info!("kube-broker stopped");
    Ok(())
}

/// Translate SIGINT into a graceful server stop plus task cancellation
async fn wait_for_shutdown(handle: axum_server::Handle, shutdown: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::error!("failed to listen for shutdown signal");
        return;
    }
    tracing::info!("shutdown signal received");
    shutdown.cancel();
    handle.graceful_shutdown(Some(Duration::from_secs(30)));
}
