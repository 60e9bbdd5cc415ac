//! Standby - hot-standby admission front for a reuseport listener group
//!
//! # Usage
//!
//! ```bash
//! # Primary and standby members behind 127.0.0.1:8080, control on :8081
//! standby-core
//!
//! # Host only the primary; the port is not shared with other processes
//! MEMBERS=primary standby-core
//!
//! # Force failover by clearing the primary slot
//! curl -X DELETE http://127.0.0.1:8081/v1/slots/0
//! ```
//!
//! See `standby_core::config` for every environment variable.

use std::sync::Arc;

use standby_core::admission::{AdmissionMetrics, AdmissionServer};
use standby_core::config::StandbyConfig;
use standby_core::control::{ControlServer, ControlState};
use standby_core::member::{register_member, MemberHandle};
use standby_core::registry::RegistryNamespace;
use standby_core::runtime::build_runtime;
use standby_core::service::spawn_member;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() {
    init_tracing();

    let config = match StandbyConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            std::process::exit(1);
        }
    };

    info!(
        worker_threads = config.runtime.worker_threads,
        cpu_pinning = config.runtime.enable_cpu_pinning,
        "Initializing Standby runtime"
    );

    let runtime = match build_runtime(config.runtime.clone()) {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "Failed to build runtime");
            std::process::exit(1);
        }
    };

    runtime.block_on(async {
        if let Err(e) = run(config).await {
            error!(error = %e, "Standby admission front failed");
            std::process::exit(1);
        }
    });
}

/// Initialize the tracing subscriber.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("standby_core=debug,info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true)
        .init();
}

async fn run(config: StandbyConfig) -> standby_core::Result<()> {
    // Create-on-attach: the registry exists from here until shutdown.
    let namespace = RegistryNamespace::<MemberHandle>::new();
    let registry = namespace.open(&config.registry_name);
    let metrics = Arc::new(AdmissionMetrics::default());

    let mut members = Vec::with_capacity(config.members.len());
    for role in &config.members {
        let member = register_member(&registry, *role, config.member_backlog)?;
        members.push((*role, member.handle()));
        spawn_member(member);
    }

    let control_state = ControlState::new(
        config.control.clone(),
        Arc::clone(&registry),
        Arc::clone(&metrics),
    );
    let control_server = ControlServer::new(control_state);
    let control_listener = TcpListener::bind(config.control.listen_addr).await?;
    tokio::spawn(async move {
        if let Err(e) = control_server.serve(control_listener).await {
            error!(error = %e, "Control plane server failed");
        }
    });
    info!(control_addr = %config.control.listen_addr, "Control plane started");

    let admission = AdmissionServer::new(config.admission.clone(), Arc::clone(&registry), metrics);

    let result = tokio::select! {
        result = admission.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            Ok(())
        }
    };

    // Destroy-on-detach.
    for (role, handle) in &members {
        if let Err(e) = registry.depopulate_if(role.slot().index(), handle) {
            warn!(role = %role, error = %e, "Failed to clear member slot");
        }
    }
    namespace.unpin(&config.registry_name)?;

    let snapshot = admission.metrics().snapshot();
    info!(
        connections = snapshot.connections_total,
        primary = snapshot.accepted_primary,
        fallback = snapshot.accepted_fallback,
        dropped = snapshot.dropped_no_target + snapshot.dropped_protocol,
        "Standby admission front stopped"
    );

    result
}
