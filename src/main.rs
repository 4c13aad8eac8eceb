mod accept_stream;
mod auth;
mod census;
mod client;
mod config;
mod error;
mod gossip;
mod handlers;
mod member;
mod membership_store;
mod os_service;
mod registry;
mod server_loop;
mod shutdown;
mod spec_dir;
mod sys_info;
mod types;
mod workers;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::{signal, task};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::accept_stream::tcp_accept_stream;
use crate::auth::GatewayAuth;
use crate::census::CensusAggregator;
use crate::config::{ConfigLayer, SupConfig, DEFAULT_ROOT};
use crate::error::SupError;
use crate::gossip::engine::GossipEngine;
use crate::gossip::server::serve_gossip;
use crate::gossip::transport::{TcpTransport, Transport};
use crate::gossip::wire::GossipMessage;
use crate::handlers::{handle_connection, GatewayState};
use crate::member::Member;
use crate::membership_store::MembershipStore;
use crate::registry::spec::{ServiceSpec, DEFAULT_GROUP};
use crate::registry::ServiceRegistry;
use crate::server_loop::serve_stream;
use crate::shutdown::Shutdown;
use crate::spec_dir::SpecDir;
use crate::types::GenericBoxedStream;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
struct Args {
    /// Supervisor state directory
    #[arg(long, global = true, env = "RINGSUP_ROOT")]
    root: Option<PathBuf>,

    /// Supervisor config file (default: <root>/sup/default/config/sup.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    member_id: Option<String>,

    #[arg(long, global = true, help = "Gossip listener, e.g. 0.0.0.0:9638")]
    listen_gossip: Option<SocketAddr>,

    #[arg(long, global = true, help = "HTTP gateway listener, e.g. 0.0.0.0:9631")]
    listen_http: Option<SocketAddr>,

    /// Do not start the HTTP gateway
    #[arg(long, global = true)]
    http_disable: bool,

    /// Initial peer to join through, host:port (repeatable)
    #[arg(long = "peer", global = true)]
    peers: Vec<String>,

    /// Keep probing this member even after it is confirmed dead
    #[arg(long, global = true)]
    permanent_peer: bool,

    #[arg(
        long,
        global = true,
        env = "RINGSUP_GATEWAY_AUTH_TOKEN",
        hide_env_values = true
    )]
    gateway_auth_token: Option<String>,

    #[arg(long, global = true, env = "RINGSUP_RING_KEY", hide_env_values = true)]
    ring_key: Option<String>,

    /// Organization reported with this member's services
    #[arg(long, global = true)]
    org: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the supervisor (the default)
    Run,

    /// Manage services of the local supervisor
    Svc {
        #[command(subcommand)]
        action: SvcCommand,
    },

    /// Ask the ring, through the given --peer, to mark a member departed
    Depart { departing: String },

    /// Start the supervisor's system service
    Start,

    /// Stop the supervisor's system service
    Stop,

    /// Show the supervisor's system service state
    Status,

    /// Print a systemd unit for the current flags
    Unit {
        #[arg(long, default_value = "/usr/bin/ringsup")]
        binary: String,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum SvcCommand {
    /// Write a spec file for the running supervisor to pick up
    Load {
        /// Package ident, e.g. klm/effortless
        ident: String,
        #[arg(long, default_value = DEFAULT_GROUP)]
        group: String,
        #[arg(long)]
        channel: Option<String>,
        #[arg(long)]
        url: Option<String>,
        #[arg(long, default_value = "standalone")]
        topology: String,
        #[arg(long)]
        strategy: Option<String>,
        #[arg(long)]
        update_condition: Option<String>,
        /// alias:service.group (repeatable)
        #[arg(long = "bind")]
        binds: Vec<String>,
        /// Load with desired state down
        #[arg(long)]
        down: bool,
    },

    /// Remove a service's spec file
    Unload { ident: String },

    /// Ask the local gateway for service status
    Status,
}

impl Args {
    fn cli_layer(&self) -> ConfigLayer {
        ConfigLayer {
            root: self.root.clone(),
            member_id: self.member_id.clone(),
            listen_gossip: self.listen_gossip,
            listen_http: self.listen_http,
            http_disable: self.http_disable.then_some(true),
            peers: self.peers.clone(),
            permanent_peer: self.permanent_peer.then_some(true),
            gateway_auth_token: self.gateway_auth_token.clone(),
            ring_key: self.ring_key.clone(),
            org: self.org.clone(),
            ..Default::default()
        }
    }

    fn resolve_config(&self) -> Result<SupConfig, SupError> {
        let root = self.root.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT));
        let file = match &self.config {
            Some(path) => Some(ConfigLayer::from_file(path)?.ok_or_else(|| {
                SupError::Config(format!("config file {} not found", path.display()))
            })?),
            None => ConfigLayer::from_file(&SupConfig::default_file_path(&root))?,
        };
        SupConfig::resolve(file, self.cli_layer())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();
    let config = args.resolve_config()?;

    match args.command.clone().unwrap_or(Command::Run) {
        Command::Run => run_supervisor(Arc::new(config)).await?,
        Command::Svc { action } => svc(action, &config).await?,
        Command::Depart { departing } => depart(&config, &departing).await?,
        Command::Start => os_service::start()?,
        Command::Stop => os_service::stop()?,
        Command::Status => println!("{}: {}", os_service::SERVICE_NAME, os_service::status()?),
        Command::Unit { binary } => print!("{}", os_service::render_unit(&unit_options(&args, binary))),
    }
    Ok(())
}

/// Flags worth baking into a unit file. Secrets travel as environment.
fn unit_options(args: &Args, binary: String) -> os_service::UnitOptions {
    let mut run_args = Vec::new();
    if let Some(root) = &args.root {
        run_args.push(format!("--root {}", root.display()));
    }
    if let Some(addr) = args.listen_gossip {
        run_args.push(format!("--listen-gossip {}", addr));
    }
    if let Some(addr) = args.listen_http {
        run_args.push(format!("--listen-http {}", addr));
    }
    if args.http_disable {
        run_args.push("--http-disable".to_string());
    }
    for peer in &args.peers {
        run_args.push(format!("--peer {}", peer));
    }
    if args.permanent_peer {
        run_args.push("--permanent-peer".to_string());
    }
    if let Some(org) = &args.org {
        run_args.push(format!("--org {}", org));
    }
    os_service::UnitOptions {
        binary,
        run_args,
        gateway_auth_token: args.gateway_auth_token.clone(),
        ring_key: args.ring_key.clone(),
    }
}

async fn run_supervisor(config: Arc<SupConfig>) -> Result<(), Box<dyn std::error::Error>> {
    let member_id = match &config.member_id {
        Some(id) => id.clone(),
        None => sys_info::load_or_create_member_id(&config.root)?,
    };
    let sys = sys_info::discover(config.listen_gossip, config.listen_http, config.org.clone());
    let gossip_addr = sys_info::advertised(config.listen_gossip, sys_info::local_ip());
    info!("Member {} ({}) gossiping at {}", member_id, sys.hostname, gossip_addr);

    let mut local = Member::new(member_id.clone(), gossip_addr.to_string());
    local.persistent = config.permanent_peer;

    let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new(
        config.ring_key.clone(),
        config.swim.ping_timeout,
    ));
    let engine = Arc::new(GossipEngine::new(
        local,
        MembershipStore::new(),
        transport,
        config.swim.clone(),
        config.peers.clone(),
    ));
    let store = engine.store().clone();
    let registry = Arc::new(ServiceRegistry::new(&config.root));
    info!("Loading specs from {}", registry.spec_dir().path().display());

    let shutdown = Arc::new(Shutdown::new());
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            shutdown.trigger();
        }
    });

    // Bind both listeners before anything else runs so a port clash fails
    // the start instead of a background task.
    let gossip_listener = TcpListener::bind(config.listen_gossip).await?;
    info!("Gossip listening on {}", config.listen_gossip);
    let http_listener = if config.http_disable {
        info!("HTTP gateway disabled");
        None
    } else {
        let listener = TcpListener::bind(config.listen_http).await?;
        info!("HTTP gateway listening on http://{}", config.listen_http);
        Some(listener)
    };

    let gossip_handle = tokio::spawn(serve_gossip(
        gossip_listener,
        engine.clone(),
        config.ring_key.as_deref().map(Arc::from),
        shutdown.clone(),
    ));

    let http_handle = tokio::spawn({
        let state = Arc::new(GatewayState {
            auth: GatewayAuth::new(config.gateway_auth_token.clone()),
            census: CensusAggregator::new(store.clone(), registry.clone(), member_id.clone()),
            store,
            registry: registry.clone(),
            member_id,
        });
        if http_listener.is_some() && !state.auth.is_configured() {
            warn!("No gateway auth token configured; every gateway request will get 401");
        }
        let shutdown = shutdown.clone();
        async move {
            if let Some(listener) = http_listener {
                let stream: GenericBoxedStream<_> = Box::pin(tcp_accept_stream(listener));
                serve_stream("http", stream, shutdown, move |(conn, _peer)| {
                    task::spawn(handle_connection(conn, state.clone()))
                })
                .await;
            }
        }
    });

    let worker_handle = tokio::spawn(workers::run_workers(
        shutdown.clone(),
        engine,
        registry,
        sys,
        config.spec_scan_interval,
    ));

    let _ = tokio::try_join!(gossip_handle, http_handle, worker_handle);
    info!("Supervisor stopped");
    Ok(())
}

async fn svc(action: SvcCommand, config: &SupConfig) -> Result<(), Box<dyn std::error::Error>> {
    let specs = SpecDir::under_sup_root(&config.root);
    match action {
        SvcCommand::Load {
            ident,
            group,
            channel,
            url,
            topology,
            strategy,
            update_condition,
            binds,
            down,
        } => {
            let mut doc = toml::Table::new();
            doc.insert("ident".into(), ident.into());
            doc.insert("group".into(), group.into());
            doc.insert("topology".into(), topology.into());
            let optional = [
                ("channel", channel),
                ("bldr_url", url),
                ("update_strategy", strategy),
                ("update_condition", update_condition),
            ];
            for (key, value) in optional {
                if let Some(value) = value {
                    doc.insert(key.into(), value.into());
                }
            }
            doc.insert("binds".into(), binds.into());
            if down {
                doc.insert("desired_state".into(), "down".into());
            }
            // Same validation the supervisor applies when it loads the file.
            let contents = toml::to_string(&doc).map_err(|e| SupError::Codec(e.to_string()))?;
            let spec = ServiceSpec::from_toml(&PathBuf::from("<command line>"), &contents)?;
            let path = specs.write(&spec)?;
            println!("Wrote {} ({} in {})", path.display(), spec.ident, spec.service_group());
        }
        SvcCommand::Unload { ident } => {
            let name = ident.split('/').nth(1).unwrap_or(&ident);
            if specs.remove(name)? {
                println!("Removed spec for {}", name);
            } else {
                println!("No spec loaded for {}", name);
            }
        }
        SvcCommand::Status => {
            let ip = if config.listen_http.ip().is_unspecified() {
                Ipv4Addr::LOCALHOST.into()
            } else {
                config.listen_http.ip()
            };
            let addr = SocketAddr::new(ip, config.listen_http.port());
            let services = client::fetch_services(
                addr,
                config.gateway_auth_token.as_deref(),
                Duration::from_secs(5),
            )
            .await?;
            if services.is_empty() {
                println!("No services loaded.");
            }
            for s in services {
                println!(
                    "{:<32} {:<24} {:<8} {:<6} {}",
                    s.ident, s.service_group, s.status, s.desired_state, s.topology
                );
            }
        }
    }
    Ok(())
}

async fn depart(config: &SupConfig, departing: &str) -> Result<(), Box<dyn std::error::Error>> {
    if config.peers.is_empty() {
        return Err(SupError::Config("depart needs at least one --peer".into()).into());
    }
    let transport = TcpTransport::new(config.ring_key.clone(), config.swim.pingreq_timeout);
    let mut delivered = 0;
    for peer in &config.peers {
        let message = GossipMessage::Depart {
            member_id: departing.to_string(),
        };
        match tokio::time::timeout(config.swim.pingreq_timeout, transport.request(peer, message)).await {
            Ok(Ok(_)) => {
                println!("{} departed via {}", departing, peer);
                delivered += 1;
            }
            Ok(Err(e)) => warn!("{} did not take the departure: {}", peer, e),
            Err(_) => warn!("{} did not answer within {:?}", peer, config.swim.pingreq_timeout),
        }
    }
    if delivered == 0 {
        return Err(SupError::Network {
            addr: config.peers.join(","),
            reason: "no peer accepted the departure".into(),
        }
        .into());
    }
    Ok(())
}
