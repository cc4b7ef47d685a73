//! Bus bootstrap and teardown.
//!
//! A process gets exactly one bus connection; the factory refuses a second.
//! Startup acquires the daemon's well-known name (primary ownership or bust),
//! wires the dispatcher and the built-in handlers, and seeds the peer
//! trackers with the configured services of interest.

pub mod send;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{bail, Context, Result};
use enumflags2::BitFlags;
use tokio::sync::mpsc;
use tracing::{info, warn};
use zbus::{
    fdo::{DBusProxy, RequestNameFlags, RequestNameReply},
    proxy::CacheProperties,
    Connection,
};

use crate::{
    config::Store,
    datapipe::Datapipe,
    dispatch::Dispatcher,
    peer::{self, Peers, PrivilegedIds},
    registry::{Cookie, Registry},
    service,
    services_file::SeedService,
    wakelock::WakelockHub,
};

static CONNECTED: AtomicBool = AtomicBool::new(false);

pub struct BusOptions {
    /// Session bus instead of the system bus.
    pub session: bool,
    /// Grace window before stopped private peers are dropped.
    pub grace: Duration,
    /// Services of interest to track from boot.
    pub seeds: Vec<SeedService>,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            session: false,
            grace: peer::DEFAULT_DELETE_GRACE,
            seeds: Vec::new(),
        }
    }
}

/// The daemon's bus attachment.
pub struct Bus {
    conn: Connection,
    dbus: DBusProxy<'static>,
    registry: Arc<Registry>,
    peers: Arc<Peers>,
    wakelocks: Arc<WakelockHub>,
    config: Arc<dyn Store>,
    datapipe: Arc<Datapipe>,
    dispatcher: Option<Dispatcher>,
    cookies: Vec<Cookie>,
    config_sub: u64,
}

impl Bus {
    /// Connect and bootstrap. There is one bus connection per process; a
    /// second call fails until the first [`Bus`] has been cleaned up.
    pub async fn connect(options: BusOptions, config: Arc<dyn Store>) -> Result<Self> {
        if CONNECTED.swap(true, Ordering::SeqCst) {
            bail!("the process already owns a bus connection");
        }
        match Self::connect_inner(options, config).await {
            Ok(bus) => Ok(bus),
            Err(e) => {
                CONNECTED.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn connect_inner(options: BusOptions, config: Arc<dyn Store>) -> Result<Self> {
        let conn = if options.session {
            Connection::session().await
        } else {
            Connection::system().await
        }
        .context("failed to connect to the bus")?;
        info!(
            "connected as {}",
            conn.unique_name().map(|n| n.as_str()).unwrap_or("-")
        );
        let dbus = DBusProxy::builder(&conn)
            .cache_properties(CacheProperties::No)
            .build()
            .await?;

        let wakelocks = WakelockHub::with_default_sink();
        let privileged = PrivilegedIds::resolve();
        let peers = Peers::new(
            privileged,
            options.grace,
            peer::SANDBOX_PROXY_BINARY.into(),
        );
        peers.attach_bus(conn.clone(), dbus.clone(), wakelocks.clone());

        let registry = Registry::new();
        registry.attach(conn.clone(), dbus.clone());

        let (replay_tx, replay_rx) = mpsc::unbounded_channel();
        peers.attach_replay(replay_tx);
        let dispatcher = Dispatcher::new(
            conn.clone(),
            registry.clone(),
            peers.clone(),
            wakelocks.clone(),
            config.clone(),
            replay_rx,
        );

        let cookies = service::register_builtin(&registry)?;
        let config_sub = service::forward_config_changes(
            conn.clone(),
            wakelocks.clone(),
            registry.clone(),
            config.as_ref(),
        );

        let flags: BitFlags<RequestNameFlags> = RequestNameFlags::DoNotQueue.into();
        let reply = dbus
            .request_name(service::WELL_KNOWN_NAME.try_into()?, flags)
            .await?;
        if reply != RequestNameReply::PrimaryOwner {
            bail!(
                "could not become primary owner of {} ({:?})",
                service::WELL_KNOWN_NAME,
                reply
            );
        }
        info!("acquired {}", service::WELL_KNOWN_NAME);

        let datapipe = Arc::new(Datapipe::new());
        for seed in &options.seeds {
            let topic = datapipe.topic(&seed.topic);
            peers.track_with_topic(&seed.name, topic);
        }

        Ok(Self {
            conn,
            dbus,
            registry,
            peers,
            wakelocks,
            config,
            datapipe,
            dispatcher: Some(dispatcher),
            cookies,
            config_sub,
        })
    }

    /// Serve inbound messages until the connection goes away.
    pub async fn run(&mut self) -> Result<()> {
        match self.dispatcher.take() {
            Some(dispatcher) => dispatcher.run().await,
            None => bail!("the bus is already running"),
        }
    }

    /// Tear everything down in reverse bootstrap order.
    pub async fn cleanup(self) -> Result<()> {
        let Self {
            conn,
            dbus,
            registry,
            peers,
            wakelocks: _,
            config,
            datapipe: _,
            dispatcher: _,
            cookies,
            config_sub,
        } = self;

        config.unsubscribe(config_sub);
        for cookie in cookies {
            registry.unregister(cookie);
        }
        registry.sweep();
        peers.clear();

        if let Err(e) = dbus.release_name(service::WELL_KNOWN_NAME.try_into()?).await {
            warn!("failed to release {}: {}", service::WELL_KNOWN_NAME, e);
        }
        // The connection closes when its last reference drops.
        drop(dbus);
        drop(conn);
        CONNECTED.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn peers(&self) -> &Arc<Peers> {
        &self.peers
    }

    pub fn wakelocks(&self) -> &Arc<WakelockHub> {
        &self.wakelocks
    }

    pub fn datapipe(&self) -> &Arc<Datapipe> {
        &self.datapipe
    }
}
