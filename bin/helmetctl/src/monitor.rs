//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Operator CLI for the smart helmet telemetry link."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Args;
use helmet_logging::{helmet_info, helmet_warn, LogContext};
use helmet_telemetry::{
    ClientConfig, ConnectionManager, Coordinate, DistanceCache, FleetState, LinkEvent,
    LoopbackTransport, SosEvent, SOS_BROADCAST, TELEMETRY_TOPIC,
};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::info;

/// Frames replayed through the loopback transport on a dry run.
const DEMO_FRAMES: [&str; 3] = [
    "H-01,0,1.02,0.31,13.736717,100.523186,78",
    "H-02,0,0.98,0.12,13.741,100.53,91",
    "H-03,1,4.75,3.40,13.7391,100.5262,0",
];

#[derive(Debug, Args)]
pub struct MonitorArgs {
    /// Use the in-process loopback transport and replay demo frames.
    #[arg(long)]
    loopback: bool,

    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(long, value_name = "SECS")]
    duration: Option<u64>,

    /// Reference point for distance reporting, as "lat,lon".
    #[arg(long, value_name = "LAT,LON", allow_hyphen_values = true)]
    origin: Option<Coordinate>,

    /// Seconds between fleet summaries.
    #[arg(long, value_name = "SECS", default_value_t = 10)]
    summary_every: u64,
}

#[derive(Debug, Args)]
pub struct SosArgs {
    /// Helmet id to alert; defaults to every helmet.
    #[arg(default_value = SOS_BROADCAST)]
    target: String,

    /// Use the in-process loopback transport.
    #[arg(long)]
    loopback: bool,
}

#[derive(Debug, Serialize)]
struct DeviceLine {
    device: String,
    status: &'static str,
    color: &'static str,
    distance_km: Option<f64>,
    heart_rate: Option<i64>,
}

fn manager(config: ClientConfig, loopback: bool) -> Result<ConnectionManager> {
    let manager = if loopback {
        ConnectionManager::new(config, LoopbackTransport::auto())?
    } else {
        ConnectionManager::mqtt(config)?
    };
    Ok(manager)
}

fn report(fleet: &FleetState, origin: Option<Coordinate>, cache: &DistanceCache) -> Result<()> {
    let summary = fleet.summary();
    info!(
        total = summary.total,
        online = summary.online,
        sos = summary.sos,
        "fleet summary"
    );
    for device in fleet.device_ids() {
        let Some(snapshot) = fleet.get(&device) else {
            continue;
        };
        let status = snapshot.status();
        let line = DeviceLine {
            distance_km: origin.and_then(|origin| cache.distance_km(Some(origin), snapshot.position())),
            heart_rate: snapshot.record.heart_rate,
            status: status.text(),
            color: status.color().as_str(),
            device,
        };
        println!("{}", serde_json::to_string(&line)?);
    }
    Ok(())
}

/// Connect, fold telemetry into a fleet view and print it periodically.
pub async fn run(config: ClientConfig, args: MonitorArgs) -> Result<()> {
    let cache = DistanceCache::from_config(&config.distance_cache);
    let manager = manager(config, args.loopback)?;
    let fleet = Arc::new(FleetState::new());
    let _fleet = manager.on_telemetry(fleet.clone());
    let _alerts = manager.on_sos_fn(|event: &SosEvent| {
        match event.target() {
            Some(device) => helmet_warn!(
                context = LogContext::new().with_device(device),
                "SOS raised for helmet"
            ),
            None => helmet_warn!("SOS broadcast received"),
        }
        Ok(())
    });
    let mut events = manager.subscribe_events();

    manager
        .connect()
        .await
        .context("unable to reach the telemetry broker")?;
    helmet_info!("monitoring as {}", manager.client_id());

    if args.loopback {
        for frame in DEMO_FRAMES {
            manager.publish(TELEMETRY_TOPIC, frame)?;
        }
    }

    let deadline = async {
        match args.duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);
    let mut ticker = tokio::time::interval(Duration::from_secs(args.summary_every.max(1)));
    ticker.tick().await;

    let outcome = loop {
        tokio::select! {
            _ = &mut deadline => break Ok(()),
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                break Ok(());
            }
            _ = ticker.tick() => report(&fleet, args.origin, &cache)?,
            event = events.recv() => match event {
                Ok(LinkEvent::Exhausted { attempts }) => {
                    break Err(anyhow::anyhow!("broker unreachable after {attempts} redials"));
                }
                Ok(event) => info!(?event, "link event"),
                Err(RecvError::Lagged(skipped)) => info!(skipped, "missed link events"),
                Err(RecvError::Closed) => break Ok(()),
            },
        }
    };

    // Let echoed demo frames land before the final report.
    tokio::task::yield_now().await;
    report(&fleet, args.origin, &cache)?;
    manager.shutdown().await;
    outcome
}

/// Connect, publish one SOS frame and wait for it to leave the process.
pub async fn send_sos(config: ClientConfig, args: SosArgs) -> Result<()> {
    if args.target.trim().is_empty() {
        bail!("SOS target must not be empty");
    }
    let manager = manager(config, args.loopback)?;
    manager
        .connect()
        .await
        .context("unable to reach the telemetry broker")?;
    manager.publish_sos(&args.target)?;
    helmet_info!(
        context = LogContext::new().with_device(&args.target),
        "SOS published"
    );
    manager.shutdown().await;
    Ok(())
}
