//! Collection Service (colsrv)
//!
//! Binary entry point: loads configuration, builds one device worker per
//! enabled device, wires the shared bus locks and the pipeline channel, and
//! runs until SIGINT.

use clap::Parser;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use colsrv::{new_bus_lock, AppConfig, BusLock, ChannelSink, DeviceWorker, DriverRegistry};

#[derive(Debug, Parser)]
#[command(name = "colsrv", about = "Industrial data-collection service", version)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "COLSRV_CONFIG", default_value = "config/colsrv.yaml")]
    config: String,

    /// Log filter override (otherwise RUST_LOG, then the configured level)
    #[arg(long)]
    log_level: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    validate: bool,
}

fn init_logging(args: &Args, configured_level: &str) {
    let filter = match &args.log_level {
        Some(level) => EnvFilter::new(level.clone()),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(configured_level.to_string())),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Build the workers declared in configuration. Devices naming the same
/// `bus` share one lock; groups come from the device's group list, falling
/// back to a single default group over all points.
fn build_workers(
    config: &AppConfig,
    registry: &DriverRegistry,
    sink: Arc<ChannelSink>,
) -> colsrv::Result<Vec<Arc<DeviceWorker>>> {
    let mut bus_locks: HashMap<String, BusLock> = HashMap::new();
    let mut workers = Vec::new();

    for spec in config.enabled_devices() {
        let driver = registry.create(&spec.device.protocol)?;
        let bus = spec
            .device
            .bus
            .as_ref()
            .map(|name| bus_locks.entry(name.clone()).or_insert_with(new_bus_lock).clone());

        let worker = Arc::new(DeviceWorker::new(
            spec.device.clone(),
            spec.points.clone(),
            driver,
            sink.clone(),
            bus,
        ));

        if spec.groups.is_empty() {
            if !spec.points.is_empty() {
                let point_ids: Vec<String> = spec.points.iter().map(|p| p.id.clone()).collect();
                worker.add_polling_group(
                    "default",
                    Default::default(),
                    Duration::from_secs(1),
                    &point_ids,
                )?;
            }
        } else {
            for group in &spec.groups {
                worker.add_polling_group(
                    group.name.clone(),
                    group.address.clone(),
                    group.interval(),
                    &group.points,
                )?;
            }
        }
        workers.push(worker);
    }
    Ok(workers)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = AppConfig::from_file(&args.config)?;
    init_logging(&args, &config.service.log_level);

    if args.validate {
        info!("configuration is valid: {} device(s)", config.devices.len());
        return Ok(());
    }

    info!(
        "starting {} with {} configured device(s)",
        config.service.name,
        config.devices.len()
    );

    let registry = DriverRegistry::with_builtin();
    let (sink, mut pipeline_rx) = ChannelSink::new(config.service.pipeline_capacity);

    // Pipeline consumer. A full deployment forwards batches to cache and
    // storage services; the standalone binary just accounts for them.
    let drain = tokio::spawn(async move {
        let mut batches: u64 = 0;
        let mut values: u64 = 0;
        while let Some(batch) = pipeline_rx.recv().await {
            batches += 1;
            values += batch.len() as u64;
            debug!("pipeline batch {}: {} value(s), {} total", batches, batch.len(), values);
        }
    });

    let workers = build_workers(&config, &registry, sink.clone())?;
    for worker in &workers {
        if let Err(e) = worker.start().await {
            error!("[{}] failed to start: {}", worker.device_id(), e);
        }
    }
    info!("{} worker(s) started", workers.len());

    let health_window = config.service.health_window();
    let status_interval = config.service.status_interval_secs;
    let mut status_tick = tokio::time::interval(Duration::from_secs(status_interval.max(1)));
    status_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    status_tick.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
            _ = status_tick.tick(), if status_interval > 0 => {
                for worker in &workers {
                    if !worker.check_task_health(health_window) {
                        warn!("[{}] has stalled tasks", worker.device_id());
                    }
                    debug!("[{}] status: {}", worker.device_id(), worker.status_json());
                }
                if sink.dropped_batches() > 0 {
                    warn!("pipeline dropped {} batch(es) so far", sink.dropped_batches());
                }
            }
        }
    }

    let stops = workers.iter().map(|worker| {
        let worker = worker.clone();
        async move {
            if let Err(e) = worker.stop().await {
                error!("[{}] stop failed: {}", worker.device_id(), e);
            }
        }
    });
    futures::future::join_all(stops).await;
    drain.abort();
    info!("{} stopped", config.service.name);
    Ok(())
}
