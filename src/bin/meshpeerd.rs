//! meshpeer daemon binary
//!
//! Loads configuration, binds the underlay socket and runs the peer
//! registry with its handshake tasks until Ctrl+C.

use clap::Parser;
use meshpeer::dns::run_dns_responder;
use meshpeer::{
    AddressCache, Config, DnsRecords, HandshakeManager, HostMap, MessageSender,
    Outside, OutsideSender, UdpOutside,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// How often registry sizes are logged.
const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// meshpeer overlay peer daemon
#[derive(Parser, Debug)]
#[command(name = "meshpeerd", version, about)]
struct Args {
    /// Path to configuration file (overrides default search paths)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print the effective configuration as YAML and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Initialize logging
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let args = Args::parse();

    info!("meshpeer starting");

    // Load configuration
    let (config, loaded_paths) = if let Some(config_path) = &args.config {
        // Explicit config file specified - load only that file
        match Config::load_file(config_path) {
            Ok(config) => (config, vec![config_path.clone()]),
            Err(e) => {
                error!("Failed to load configuration from {}: {}", config_path.display(), e);
                std::process::exit(1);
            }
        }
    } else {
        match Config::load() {
            Ok(result) => result,
            Err(e) => {
                error!("Failed to load configuration: {}", e);
                std::process::exit(1);
            }
        }
    };

    if loaded_paths.is_empty() {
        info!("No config files found, using defaults");
    } else {
        for path in &loaded_paths {
            info!(path = %path.display(), "Loaded config file");
        }
    }

    if let Err(e) = config.validate() {
        error!("{}", e);
        std::process::exit(1);
    }

    if args.print_config {
        match config.to_yaml() {
            Ok(yaml) => print!("{}", yaml),
            Err(e) => {
                error!("Failed to serialize configuration: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    // Underlay socket
    let outside = match UdpOutside::bind(config.listen.bind_addr()).await {
        Ok(outside) => Arc::new(outside),
        Err(e) => {
            error!("Failed to bind underlay socket: {}", e);
            std::process::exit(1);
        }
    };
    let outside_dyn: Arc<dyn Outside> = outside.clone();

    // Main registry
    let main_map = Arc::new(HostMap::new(
        "main",
        config.vpn_cidr,
        config.preferred_ranges(),
    ));
    main_map.add_unsafe_routes(&config.unsafe_routes);

    // Address cache and main map seeded from the static host map
    let cache = Arc::new(AddressCache::with_lighthouses(
        config.lighthouse.hosts.clone(),
    ));
    cache.load_static_host_map(&main_map, &config.lighthouse.static_host_map);
    for lighthouse in &config.lighthouse.hosts {
        if !config.lighthouse.static_host_map.contains_key(lighthouse) {
            warn!(lighthouse = %lighthouse, "Lighthouse has no static host map entry");
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut manager = HandshakeManager::new(
        main_map.clone(),
        cache.clone(),
        outside_dyn.clone(),
        config.handshakes.clone(),
    );

    // Peer name responder
    if config.dns.enabled {
        let records = Arc::new(DnsRecords::new());
        match UdpSocket::bind(config.dns.bind_addr()).await {
            Ok(socket) => {
                info!(bind_addr = config.dns.bind_addr(), "DNS responder started");
                tokio::spawn(run_dns_responder(
                    socket,
                    records.clone(),
                    config.dns.ttl(),
                    shutdown_rx.clone(),
                ));
            }
            Err(e) => {
                warn!(bind_addr = config.dns.bind_addr(), error = %e, "Failed to bind DNS responder");
            }
        }
        manager = manager.with_name_registry(records);
    }

    let manager = Arc::new(manager);
    let sender: Arc<dyn MessageSender> =
        Arc::new(OutsideSender::new(outside_dyn.clone(), main_map.clone()));
    let tasks = match manager.spawn(sender, shutdown_rx.clone()) {
        Ok(tasks) => tasks,
        Err(e) => {
            error!("Failed to start handshake manager: {}", e);
            std::process::exit(1);
        }
    };

    // NAT keepalives
    let punchy = if config.punchy.enabled {
        Some(tokio::spawn(main_map.clone().punchy(
            outside_dyn,
            config.punchy.interval(),
            shutdown_rx,
        )))
    } else {
        None
    };

    info!(
        local_addr = %outside.local_addr(),
        lighthouses = config.lighthouse.hosts.len(),
        static_hosts = cache.len(),
        "meshpeer running, press Ctrl+C to exit"
    );

    let mut stats = tokio::time::interval(STATS_INTERVAL);
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                match signal {
                    Ok(()) => info!("Shutdown signal received"),
                    Err(e) => error!("Failed to listen for shutdown signal: {}", e),
                }
                break;
            }
            _ = stats.tick() => {
                main_map.emit_stats();
                debug!(
                    pending_inbound = manager.pending_inbound().stats().indexes,
                    pending_outbound = manager.pending_outbound().stats().hosts,
                    inbound_timers = manager.inbound_timer_len(),
                    outbound_timers = manager.outbound_timer_len(),
                    "Handshake stats"
                );
            }
        }
    }

    info!("meshpeer shutting down");

    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(Duration::from_secs(5), tasks.join())
        .await
        .is_err()
    {
        warn!("Handshake tasks did not stop in time");
    }
    if let Some(punchy) = punchy {
        let _ = punchy.await;
    }

    main_map.emit_stats();
    info!("meshpeer shutdown complete");
}
