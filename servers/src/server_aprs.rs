use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::broadcast;

use lib_common::core::{IdentityFilter, Supervisor};
use lib_common::delivery::{DeliveryQueue, DryRunPushTarget, PushTarget, Uploader};
use lib_common::ingestors::{PacketRecorder, PacketSource, ReplayPacketSource, TcpPacketSource};
use lib_common::parsers::{AprsParser, LocalDstCorrection, OgnParser, PacketParser};
use lib_common::retrieve::GlideportClient;

mod aprs_logic;
use aprs_logic::config::{self, Dialect, DstMode, GatewaySettings};
use aprs_logic::logger;

fn build_source(settings: &GatewaySettings) -> Box<dyn PacketSource> {
    match &settings.replay_file {
        Some(path) => Box::new(ReplayPacketSource::new(path.clone())),
        None => Box::new(TcpPacketSource::new(settings.connection.clone())),
    }
}

fn build_parser(settings: &GatewaySettings) -> Box<dyn PacketParser> {
    match settings.dialect {
        Dialect::Aprs => Box::new(AprsParser::new()),
        Dialect::Ogn => Box::new(OgnParser::new(
            settings.rx_names_to_reject.iter().cloned(),
            settings.address_types_accepted.iter().copied(),
        )),
    }
}

fn build_target(settings: &GatewaySettings) -> Result<Arc<dyn PushTarget>> {
    if settings.upload {
        let client = GlideportClient::new(&settings.glideport_url)?;
        Ok(Arc::new(client))
    } else {
        log::warn!("uploads disabled, payloads are only logged");
        Ok(Arc::new(DryRunPushTarget))
    }
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut term_signal = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                log::info!("Ctrl-C received, initiating shutdown.");
            }
            _ = term_signal.recv() => {
                log::info!("SIGTERM received, initiating shutdown.");
            }
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        log::info!("Ctrl-C received, initiating shutdown.");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = config::load_config()?.resolve()?;
    logger::setup_logging(&settings.log_dir, &settings.log_level)?;

    let (shutdown_tx, _) = broadcast::channel(1);

    let queue = Arc::new(DeliveryQueue::new(&settings.queue));
    let uploader = Uploader::new(Arc::clone(&queue), build_target(&settings)?, settings.uploader.clone()).spawn();

    let mut filter = IdentityFilter::new(settings.identities.clone(), settings.filter.clone());
    match settings.dst {
        DstMode::Off => {}
        DstMode::Local => filter = filter.with_correction(Box::new(LocalDstCorrection::new())),
        DstMode::Fixed(correction) => filter = filter.with_correction(Box::new(correction)),
    }

    let mut supervisor = Supervisor::new(
        build_source(&settings),
        build_parser(&settings),
        filter,
        Arc::clone(&queue),
        settings.supervisor.clone(),
    );

    if let Some(path) = &settings.record_packets {
        let recorder = PacketRecorder::open(path)
            .await
            .with_context(|| format!("cannot open packet recording {}", path.display()))?;
        supervisor = supervisor.with_recorder(recorder);
    }

    let mut supervisor_handle = tokio::spawn(supervisor.run(uploader, shutdown_tx.subscribe()));

    // The supervisor also returns on its own when the uploader dies.
    let report = tokio::select! {
        result = wait_for_signal() => {
            result?;
            let _ = shutdown_tx.send(());
            (&mut supervisor_handle).await?
        }
        report = &mut supervisor_handle => report?,
    };

    if report.delivery.is_none() {
        log::warn!("uploader did not drain before the shutdown timeout, {} payloads abandoned", queue.len());
    }
    log::info!("Shutdown complete.");
    Ok(())
}
