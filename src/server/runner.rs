use crate::server::accessor::Accessor;
use crate::server::config::{ConfigStore, StaticConfig, DEFAULT_MTU, DEFAULT_PORT};
use crate::server::config_watcher::ConfigWatcher;
use crate::server::engine::{ControlLink, Engine};
use crate::server::peer::{self, PeerTracker};
use crate::server::session::SessionTable;
use crate::utils;
use crate::utils::device::{DeviceHandler, TunConfig};
use crate::utils::sys_route::SysRoute;
use clap::{ArgAction, Parser};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

const HEALTH_INTERVAL: Duration = Duration::from_secs(30);

/// Desktop side of the docker VM tunnel
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Config file path, resolved against the executable directory when relative
    #[arg(long, default_value = "docker-connector.conf")]
    pub config: String,

    /// Reload the config file on change
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub watch: bool,

    /// Log verbosity: DEBUG, INFO, WARNING or ERROR
    #[arg(long, default_value = "INFO")]
    pub log_level: String,

    /// Optional log file
    #[arg(long, default_value = "")]
    pub log_file: String,

    /// Overlay address (overridden by the config file)
    #[arg(long, default_value = "192.168.251.1/24")]
    pub addr: String,

    /// UDP listen port
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// UDP bind address
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Provision a TUN interface
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub bind: bool,

    /// Fixed client address; disables peer memo persistence
    #[arg(long, default_value = "")]
    pub cli: String,

    /// Accessor listen address
    #[arg(long, default_value = "")]
    pub expose: String,
}

impl Args {
    /// Static parameters from the flags; the config file overrides these.
    fn static_defaults(&self) -> crate::Result<StaticConfig> {
        let addr = self
            .addr
            .parse()
            .map_err(|_| format!("invalid overlay address: {}", self.addr))?;
        let host = self
            .host
            .parse()
            .map_err(|_| format!("invalid bind host: {}", self.host))?;
        let expose = if self.expose.is_empty() {
            None
        } else {
            Some(
                self.expose
                    .parse()
                    .map_err(|_| format!("invalid expose address: {}", self.expose))?,
            )
        };
        Ok(StaticConfig {
            addr,
            port: self.port,
            host,
            mtu: DEFAULT_MTU,
            bind: self.bind,
            tokens: HashMap::new(),
            expose,
        })
    }
}

pub async fn run(args: Args) -> crate::Result<()> {
    let config_path = utils::resolve_path(&args.config);
    tracing::info!("config file => {} (watch: {})", config_path.display(), args.watch);

    let store = Arc::new(ConfigStore::load(config_path.clone(), args.static_defaults()?)?);
    let statics = store.statics().clone();

    let local_ip = statics.local_ip();
    let peer_ip = statics.peer_ip();
    let subnet = statics.subnet();
    tracing::info!(
        "overlay {}: local ip {}, peer ip {}, mtu {}",
        subnet,
        local_ip,
        peer_ip,
        statics.mtu
    );

    let token = CancellationToken::new();
    let routes = Arc::new(SysRoute::new(peer_ip));

    let device = if statics.bind {
        Some(DeviceHandler::open(
            TunConfig {
                local_ip,
                peer_ip,
                subnet,
                mtu: statics.mtu,
            },
            token.clone(),
        )?)
    } else {
        tracing::warn!("no tun interface bound, running in proxy mode only");
        None
    };

    for route in store.snapshot().routes.keys() {
        if let Err(e) = routes.add(*route) {
            tracing::warn!("failed to add route {}: {}", route, e);
        }
    }

    let socket = UdpSocket::bind((statics.host, statics.port))
        .await
        .map_err(|e| format!("failed to listen {}:{} => {}", statics.host, statics.port, e))?;
    let socket = Arc::new(socket);
    tracing::info!("listening on {}", socket.local_addr()?);

    let link = Arc::new(ControlLink::new(socket.clone(), statics.mtu));

    let fixed_cli = parse_cli_flag(&args.cli);
    let peers = Arc::new(PeerTracker::new(fixed_cli, peer::default_memo_path()));
    peers.load_memo();

    let sessions = Arc::new(SessionTable::new());

    let expose_socket = match statics.expose {
        Some(addr) => {
            let expose = UdpSocket::bind(addr)
                .await
                .map_err(|e| format!("failed to listen accessor {} => {}", addr, e))?;
            Some(Arc::new(expose))
        }
        None => None,
    };
    if let Some(expose) = &expose_socket {
        Accessor::new(
            expose.clone(),
            link.clone(),
            peers.clone(),
            sessions.clone(),
            token.clone(),
        )
        .spawn();
    }

    let reloader = Arc::new(Reloader::new(
        store.clone(),
        routes.clone(),
        peers.clone(),
        link.clone(),
    ));
    if args.watch {
        ConfigWatcher::new(reloader, config_path, token.clone()).spawn();
    }

    {
        let peers = peers.clone();
        let token = token.clone();
        let bound = statics.bind;
        tokio::spawn(async move {
            health_loop(peers, bound, token).await;
        });
    }

    let engine = Engine::new(
        socket,
        link,
        device,
        expose_socket,
        store,
        peers,
        sessions,
        token.clone(),
    );
    let mut engine_task = tokio::spawn(engine.run());

    let engine_finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
            false
        }
        result = &mut engine_task => {
            match result {
                Ok(Ok(())) => tracing::info!("engine stopped"),
                Ok(Err(e)) => tracing::error!("engine error: {}", e),
                Err(e) => tracing::error!("engine task failed: {}", e),
            }
            true
        }
    };

    // stop path: flag first, then installed routes, then the sockets and the
    // TUN close as their tasks observe the cancellation
    token.cancel();
    routes.clear();
    if !engine_finished {
        let _ = tokio::time::timeout(Duration::from_secs(1), engine_task).await;
    }
    tracing::info!("stopped");
    Ok(())
}

fn parse_cli_flag(cli: &str) -> Option<SocketAddr> {
    if cli.is_empty() {
        return None;
    }
    match cli.parse() {
        Ok(addr) => {
            tracing::info!("using configured peer {}", addr);
            Some(addr)
        }
        Err(e) => {
            tracing::warn!("failed to parse configured peer '{}': {}", cli, e);
            None
        }
    }
}

/// Applies a debounced config reload: sync host routes to the route delta,
/// then push a fresh control frame to the current peer, if any.
pub struct Reloader {
    store: Arc<ConfigStore>,
    routes: Arc<SysRoute>,
    peers: Arc<PeerTracker>,
    link: Arc<ControlLink>,
}

impl Reloader {
    pub fn new(
        store: Arc<ConfigStore>,
        routes: Arc<SysRoute>,
        peers: Arc<PeerTracker>,
        link: Arc<ControlLink>,
    ) -> Self {
        Reloader {
            store,
            routes,
            peers,
            link,
        }
    }

    pub async fn apply(&self) {
        let outcome = match self.store.reload() {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("config reload failed: {}", e);
                return;
            }
        };
        tracing::info!(
            "config reloaded: {} routes added, {} removed, changed: {}",
            outcome.delta.added.len(),
            outcome.delta.removed.len(),
            outcome.changed
        );

        for subnet in &outcome.delta.removed {
            if let Err(e) = self.routes.del(*subnet) {
                tracing::warn!("failed to remove route {}: {}", subnet, e);
            }
        }
        for subnet in &outcome.delta.added {
            if let Err(e) = self.routes.add(*subnet) {
                tracing::warn!("failed to add route {}: {}", subnet, e);
            }
        }

        // the intent and hosts tables are rebuilt in full on every reload;
        // re-sync the client whenever one is connected
        if let Some(peer) = self.peers.current() {
            let cfg = self.store.snapshot();
            if let Err(e) = self.link.push(&cfg, peer).await {
                tracing::warn!("control push to {} failed: {}", peer, e);
            }
        }
    }
}

async fn health_loop(peers: Arc<PeerTracker>, bound: bool, token: CancellationToken) {
    let mut ticker = interval(HEALTH_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match peers.current() {
            Some(peer) => tracing::debug!("health: client connected {}", peer),
            None => tracing::warn!("health: no client connected, waiting for heartbeat"),
        }
        if !bound {
            tracing::debug!("health: running without a tun interface");
        }
    }
}
