use std::sync::Arc;
use std::time::Duration;

use tokio::{task, time};
use tracing::{debug, info};

use crate::gossip::engine::GossipEngine;
use crate::registry::ServiceRegistry;
use crate::shutdown::Shutdown;
use crate::types::SysInfo;

/// Background loops of a running supervisor. Returns once both have seen
/// the shutdown signal.
pub async fn run_workers(
    shutdown: Arc<Shutdown>,
    engine: Arc<GossipEngine>,
    registry: Arc<ServiceRegistry>,
    sys: SysInfo,
    spec_scan_interval: Duration,
) {
    info!("Worker runtime started");

    let gossip = task::spawn(gossip_loop(shutdown.clone(), engine.clone()));
    let specs = task::spawn(spec_loop(shutdown, engine, registry, sys, spec_scan_interval));

    let _ = futures_util::future::join_all(vec![gossip, specs]).await;

    info!("Worker runtime exited");
}

async fn gossip_loop(shutdown: Arc<Shutdown>, engine: Arc<GossipEngine>) {
    if engine.join().await == 0 {
        debug!("No seed answered yet; will keep retrying");
    }
    let interval = engine.timing().probe_interval;
    loop {
        tokio::select! {
            _ = time::sleep(interval) => {
                let report = engine.tick().await;
                if !report.suspected.is_empty() || !report.confirmed.is_empty() {
                    debug!(
                        "Tick: probed {}, suspected {:?}, confirmed {:?}",
                        report.probed.len(),
                        report.suspected,
                        report.confirmed
                    );
                }
            }
            _ = shutdown.wait() => {
                info!("Gossip worker: shutdown signal received");
                break;
            }
        }
    }
}

/// Keep the registry in step with the spec directory and publish what it
/// holds to the ring.
async fn spec_loop(
    shutdown: Arc<Shutdown>,
    engine: Arc<GossipEngine>,
    registry: Arc<ServiceRegistry>,
    sys: SysInfo,
    interval: Duration,
) {
    loop {
        sync_services(&engine, &registry, &sys);
        tokio::select! {
            _ = time::sleep(interval) => {}
            _ = shutdown.wait() => {
                info!("Spec worker: shutdown signal received");
                break;
            }
        }
    }
}

/// One reconcile pass. Returns how many service rumors were new to the ring.
pub fn sync_services(engine: &GossipEngine, registry: &ServiceRegistry, sys: &SysInfo) -> usize {
    let report = registry.reconcile_dir();
    if report.changed() {
        info!(
            "Spec dir changed: loaded {:?}, unloaded {:?}",
            report.loaded, report.unloaded
        );
    }
    registry
        .service_rumors(engine.local_id(), sys)
        .into_iter()
        .filter(|rumor| engine.publish_service(rumor.clone()))
        .count()
}
