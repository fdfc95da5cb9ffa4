//! stratad — the strata provider daemon.
//!
//! Reads the TOML configuration, starts one listener per configured
//! provider (storage control + bulk, block-device meta-data, IOV backend,
//! share service), and runs until SIGINT/SIGTERM. Shutdown fans out over a
//! broadcast channel; every listener drains and returns.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use strata_core::config::{IovParameter, StrataConfig};
use strata_rpc::bulk::serve_bulk;
use strata_rpc::server::serve;
use strata_services::block::command::BlockCommands;
use strata_services::block::{BlockIndex, BlockSize};
use strata_services::iov::command::IovCommands;
use strata_services::iov::db::MetaDb;
use strata_services::iov::{IovBackend, SegmentOps};
use strata_services::share::{ShareCommands, ShareService};
use strata_storage::commands::ControlCommands;
use strata_storage::trace::{LogTracer, NoopTracer, Tracer};
use strata_storage::StorageProvider;

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity, e.g. RUST_LOG=debug stratad
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = StrataConfig::load(config_path.as_deref()).context("loading configuration")?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut servers = tokio::task::JoinSet::new();

    if let Some(storage) = &config.storage {
        let tracer: Arc<dyn Tracer> = if storage.trace_log.as_os_str().is_empty() {
            Arc::new(NoopTracer)
        } else {
            Arc::new(
                LogTracer::create(&storage.trace_log)
                    .with_context(|| format!("opening trace log {}", storage.trace_log.display()))?,
            )
        };
        let provider = Arc::new(StorageProvider::new(tracer));

        let control = TcpListener::bind(&storage.listen)
            .await
            .with_context(|| format!("binding control listener {}", storage.listen))?;
        tracing::info!(listen = %storage.listen, "storage provider up");
        servers.spawn(serve::<ControlCommands, _>(
            control,
            provider.clone(),
            shutdown_tx.subscribe(),
        ));

        let bulk = TcpListener::bind(&storage.bulk_listen)
            .await
            .with_context(|| format!("binding bulk listener {}", storage.bulk_listen))?;
        tracing::info!(listen = %storage.bulk_listen, "bulk transport up");
        servers.spawn(serve_bulk(bulk, provider, shutdown_tx.subscribe()));
    }

    if let Some(block_device) = &config.block_device {
        let block_size =
            BlockSize::new(block_device.block_size).context("block_device.block_size")?;
        let index = Arc::new(BlockIndex::new(block_size));
        let listener = TcpListener::bind(&block_device.listen)
            .await
            .with_context(|| format!("binding block-device listener {}", block_device.listen))?;
        tracing::info!(listen = %block_device.listen, %block_size, "block-device provider up");
        servers.spawn(serve::<BlockCommands, _>(
            listener,
            index,
            shutdown_tx.subscribe(),
        ));
    }

    if let Some(iov) = &config.iov {
        let listen = if iov.parameter_file.as_os_str().is_empty() {
            iov.listen.clone()
        } else {
            let parameter = IovParameter::load(&iov.parameter_file).with_context(|| {
                format!("loading IOV parameter file {}", iov.parameter_file.display())
            })?;
            parameter.provider
        };
        let db = if iov.database.as_os_str().is_empty() {
            None
        } else {
            Some(
                MetaDb::open(&iov.database)
                    .with_context(|| format!("opening meta-database {}", iov.database.display()))?,
            )
        };
        let backend = Arc::new(IovBackend::new(
            strata_services::iov::RemoteSegmentOps::new(),
            db,
        ));
        let listener = TcpListener::bind(&listen)
            .await
            .with_context(|| format!("binding IOV listener {listen}"))?;
        tracing::info!(listen = %listen, "IOV backend up");
        servers.spawn(serve_iov(listener, backend, shutdown_tx.subscribe()));
    }

    if let Some(share) = &config.share {
        let provider = Arc::new(StorageProvider::new(Arc::new(NoopTracer)));
        let endpoint = share
            .listen
            .parse()
            .with_context(|| format!("share listen address {}", share.listen))?;
        let service = Arc::new(ShareService::new(provider, endpoint));
        let listener = TcpListener::bind(&share.listen)
            .await
            .with_context(|| format!("binding share listener {}", share.listen))?;
        tracing::info!(listen = %share.listen, "share service up");
        servers.spawn(serve::<ShareCommands, _>(
            listener,
            service,
            shutdown_tx.subscribe(),
        ));
    }

    if servers.is_empty() {
        anyhow::bail!(
            "no provider configured; set at least one of [storage], [block_device], [iov], [share]"
        );
    }

    // Run until a signal or the first listener failure.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(());
        }
        result = servers.join_next() => {
            tracing::error!(?result, "listener exited unexpectedly");
            let _ = shutdown_tx.send(());
        }
    }

    while let Some(result) = servers.join_next().await {
        if let Err(e) = result {
            tracing::warn!(error = %e, "listener task join failed");
        }
    }
    tracing::info!("stratad stopped");
    Ok(())
}

/// Wrapper so the IOV serve call's generic handler type is spelled once.
async fn serve_iov<Ops: SegmentOps + 'static>(
    listener: TcpListener,
    backend: Arc<IovBackend<Ops>>,
    shutdown: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    serve::<IovCommands, _>(listener, backend, shutdown).await
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
