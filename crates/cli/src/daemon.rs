//! Daemon assembly: everything a node needs, wired together.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cluster::{ClusterDriver, LocalBus, MachineParams, VdiRegistry};
use corelib::{
    ClusterConfig, ClusterView, EpochLog, Node, NodeId, Result, SharedView, Status, WorkQueues,
};
use parking_lot::RwLock;
use replication::{Gateway, LocalOps};
use store::ObjectStore;
use tokio::net::TcpListener;
use transport::{ConnectionPool, PeerClient};

use crate::config::CliConfig;
use crate::server::{self, ServerCtx};

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(15);
const PEER_TIMEOUT: Duration = Duration::from_secs(5);

/// Construction-time parameters, decoupled from the clap surface so tests
/// can boot nodes directly.
#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub addr: IpAddr,
    pub port: u16,
    pub zone: u32,
    pub vnodes: u16,
    pub dir: PathBuf,
    pub cluster: ClusterConfig,
    pub driver: String,
}

impl DaemonConfig {
    pub fn from_cli(cli: &CliConfig) -> Result<Self> {
        Ok(Self {
            addr: cli.myaddr,
            port: cli.port,
            zone: cli.zone,
            vnodes: cli.vnodes,
            dir: cli.dir.clone(),
            cluster: cli.cluster_config()?,
            driver: cli.cluster.clone(),
        })
    }
}

/// One running node.
pub struct Daemon {
    node: Node,
    view: SharedView,
    driver: Arc<dyn ClusterDriver>,
    outstanding: Arc<AtomicUsize>,
    accept_task: tokio::task::JoinHandle<()>,
    reaper_task: tokio::task::JoinHandle<()>,
    local_addr: SocketAddr,
}

impl Daemon {
    /// Boot a node with the driver named in its configuration.
    pub async fn start(config: DaemonConfig) -> Result<Self> {
        Self::start_inner(config, None).await
    }

    /// Boot a node onto a shared in-process bus (multi-node tests).
    pub async fn start_on_bus(config: DaemonConfig, bus: Arc<LocalBus>) -> Result<Self> {
        Self::start_inner(config, Some(bus)).await
    }

    async fn start_inner(config: DaemonConfig, bus: Option<Arc<LocalBus>>) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)?;

        // Bind first: the advertised identity needs the final port.
        let listener = TcpListener::bind((config.addr, config.port)).await?;
        let local_addr = listener.local_addr()?;
        let node = Node::new(
            NodeId::new(config.addr, local_addr.port()),
            config.zone,
            config.vnodes,
        );

        let driver: Arc<dyn ClusterDriver> = match bus {
            Some(bus) => bus.handle(node),
            None => cluster::connect(&config.driver, node)?,
        };

        let epoch_log = Arc::new(EpochLog::open(&config.dir)?);
        let store = Arc::new(ObjectStore::open(&config.dir, &config.cluster)?);
        let view = SharedView::new(ClusterView::unformatted());
        let queues = Arc::new(WorkQueues::start());
        let registry = Arc::new(RwLock::new(VdiRegistry::new()));

        let pool = ConnectionPool::new(POOL_IDLE_TIMEOUT);
        let reaper_task = pool.spawn_reaper();
        let client = PeerClient::new(pool, PEER_TIMEOUT);

        let local = LocalOps::new(view.clone(), Arc::clone(&store), Arc::clone(&queues));
        let gateway = Gateway::new(
            node.nid,
            view.clone(),
            local.clone(),
            client.clone(),
            config.cluster.write_policy,
        );

        let handle = cluster::spawn(MachineParams {
            me: node,
            view: view.clone(),
            epoch_log: Arc::clone(&epoch_log),
            registry: Arc::clone(&registry),
            store,
            queues,
            gateway: gateway.clone(),
            client: client.clone(),
            driver: Arc::clone(&driver),
        })?;

        let outstanding = Arc::new(AtomicUsize::new(0));
        let ctx = ServerCtx {
            node,
            view: view.clone(),
            registry,
            epoch_log,
            local,
            gateway,
            cluster: handle,
            client,
            outstanding: Arc::clone(&outstanding),
        };
        let accept_task = tokio::spawn(server::serve(listener, ctx));

        tracing::info!(node = %node, dir = %config.dir.display(), "node started");
        Ok(Self {
            node,
            view,
            driver,
            outstanding,
            accept_task,
            reaper_task,
            local_addr,
        })
    }

    pub fn node(&self) -> Node {
        self.node
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn status(&self) -> Status {
        self.view.get().status
    }

    pub fn view(&self) -> Arc<ClusterView> {
        self.view.get()
    }

    /// The shared view handle, for signal handlers and tests.
    pub fn view_handle(&self) -> SharedView {
        self.view.clone()
    }

    /// Flip into graceful shutdown (signal handler path).
    pub fn begin_shutdown(&self) {
        self.view.set_status(Status::ShuttingDown);
    }

    /// Block until the node should exit: immediately when killed, after the
    /// last outstanding request when shutting down.
    pub async fn wait(&self) -> Status {
        loop {
            let status = self.view.get().status;
            match status {
                Status::Killed => return status,
                Status::ShuttingDown if self.outstanding.load(Ordering::SeqCst) == 0 => {
                    return status;
                }
                _ => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }
    }

    /// Tear the node down without leaving the cluster, as a crashed node
    /// would. The bus keeps the member until a failure detector (or a
    /// peer's explicit leave) reports it.
    pub fn kill(self) {
        self.accept_task.abort();
        self.reaper_task.abort();
        tracing::info!(node = %self.node, "node killed");
    }

    /// Leave the cluster and tear the node down.
    pub async fn stop(self) -> Result<()> {
        let _ = self.driver.leave(self.node.nid).await;
        self.accept_task.abort();
        self.reaper_task.abort();
        tracing::info!(node = %self.node, "node stopped");
        Ok(())
    }
}
