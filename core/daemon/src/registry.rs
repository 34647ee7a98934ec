//! Per-folder listener lifecycle.
//!
//! The registry owns one `Remote` (endpoint, listener task, active connection)
//! per open project folder. `reconcile` brings the set of remotes in line with
//! the desired folder set: every teardown finishes before any bind starts, so a
//! listener that is going away can never hold the endpoint a new one needs.
//! Creation failures are isolated to their folder.
//!
//! Mutation takes `&mut self`; callers serialize reconcile calls by owning the
//! registry. Only in-flight I/O runs concurrently.

use ide_mocha_protocol::{allocate, Endpoint, InterfaceMode};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::connection::{serve_connection, CloseReason};
use crate::error::RegistryError;
use crate::router::NotificationRouter;

const ACCEPT_RETRY_DELAY_MS: u64 = 100;
const NO_CONNECTION: u64 = 0;

/// Settings that decide where and how listeners bind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerSettings {
    /// Raw interface mode string; parsed on every create.
    pub interface: String,
    pub socket_dir: PathBuf,
    pub max_event_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteInfo {
    pub folder: PathBuf,
    #[serde(serialize_with = "serialize_endpoint")]
    pub endpoint: Endpoint,
    pub listener_id: u64,
    pub connected: bool,
}

fn serialize_endpoint<S: serde::Serializer>(
    endpoint: &Endpoint,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(endpoint)
}

#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub destroyed: Vec<PathBuf>,
    pub created: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, RegistryError)>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.destroyed.is_empty() && self.created.is_empty() && self.failed.is_empty()
    }
}

struct Remote {
    folder: PathBuf,
    endpoint: Endpoint,
    listener_id: u64,
    active_connection: Arc<AtomicU64>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Remote {
    fn info(&self) -> RemoteInfo {
        RemoteInfo {
            folder: self.folder.clone(),
            endpoint: self.endpoint.clone(),
            listener_id: self.listener_id,
            connected: self.active_connection.load(Ordering::SeqCst) != NO_CONNECTION,
        }
    }

    async fn close(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            warn!(
                folder = %self.folder.display(),
                error = %err,
                "Listener task ended abnormally"
            );
        }
        if let Some(path) = self.endpoint.socket_path() {
            if unlink_socket(path).await {
                debug!(path = %path.display(), "Removed socket file");
            }
        }
        info!(
            folder = %self.folder.display(),
            endpoint = %self.endpoint,
            listener_id = self.listener_id,
            "Remote destroyed"
        );
    }
}

pub struct RemoteRegistry {
    settings: ListenerSettings,
    router: Arc<NotificationRouter>,
    remotes: HashMap<PathBuf, Remote>,
    next_listener_id: u64,
}

impl RemoteRegistry {
    pub fn new(settings: ListenerSettings, router: Arc<NotificationRouter>) -> Self {
        Self {
            settings,
            router,
            remotes: HashMap::new(),
            next_listener_id: 0,
        }
    }

    pub fn settings(&self) -> &ListenerSettings {
        &self.settings
    }

    /// Applies to remotes created from now on. Existing listeners keep their
    /// endpoint until they are rebuilt.
    pub fn set_settings(&mut self, settings: ListenerSettings) {
        self.settings = settings;
    }

    pub fn len(&self) -> usize {
        self.remotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.remotes.is_empty()
    }

    pub fn folders(&self) -> BTreeSet<PathBuf> {
        self.remotes.keys().cloned().collect()
    }

    pub fn remote(&self, folder: &Path) -> Option<RemoteInfo> {
        self.remotes.get(folder).map(Remote::info)
    }

    pub fn endpoint_for(&self, folder: &Path) -> Option<&Endpoint> {
        self.remotes.get(folder).map(|remote| &remote.endpoint)
    }

    pub fn remotes(&self) -> Vec<RemoteInfo> {
        let mut remotes: Vec<RemoteInfo> = self.remotes.values().map(Remote::info).collect();
        remotes.sort_by(|a, b| a.folder.cmp(&b.folder));
        remotes
    }

    pub async fn reconcile(&mut self, desired: &BTreeSet<PathBuf>) -> ReconcileReport {
        let removed: Vec<PathBuf> = self
            .remotes
            .keys()
            .filter(|folder| !desired.contains(*folder))
            .cloned()
            .collect();
        let added: Vec<PathBuf> = desired
            .iter()
            .filter(|folder| !self.remotes.contains_key(*folder))
            .cloned()
            .collect();

        let destroyed = self.destroy_all(removed).await;
        let (created, failed) = self.create_all(added).await;

        if !destroyed.is_empty() || !created.is_empty() || !failed.is_empty() {
            info!(
                destroyed = destroyed.len(),
                created = created.len(),
                failed = failed.len(),
                remotes = self.remotes.len(),
                "Registry reconciled"
            );
        }

        ReconcileReport {
            destroyed,
            created,
            failed,
        }
    }

    /// Returns `Ok(false)` when the folder already has a remote.
    pub async fn create_remote(&mut self, folder: PathBuf) -> Result<bool, RegistryError> {
        if self.remotes.contains_key(&folder) {
            return Ok(false);
        }
        let endpoint = self.claim_endpoint(&folder, &HashMap::new())?;
        let listener_id = self.allocate_listener_id();
        let remote = open_remote(
            folder.clone(),
            endpoint,
            self.settings.max_event_bytes,
            Arc::clone(&self.router),
            listener_id,
        )
        .await?;
        self.remotes.insert(folder, remote);
        Ok(true)
    }

    /// Returns `false` when the folder had no remote.
    pub async fn destroy_remote(&mut self, folder: &Path) -> bool {
        match self.remotes.remove(folder) {
            Some(remote) => {
                remote.close().await;
                true
            }
            None => false,
        }
    }

    /// Tears every remote down and waits for sockets to be released.
    pub async fn shutdown(&mut self) -> ReconcileReport {
        self.reconcile(&BTreeSet::new()).await
    }

    /// The endpoint `folder` would bind, unless a tracked remote or an earlier
    /// folder of the same batch already holds it. Base names are not unique
    /// across parents, so two folders can derive the same address.
    fn claim_endpoint(
        &self,
        folder: &Path,
        claimed: &HashMap<Endpoint, PathBuf>,
    ) -> Result<Endpoint, RegistryError> {
        let mode: InterfaceMode = self.settings.interface.parse()?;
        let endpoint = allocate(folder, mode, &self.settings.socket_dir)?;

        let owner = self
            .remotes
            .values()
            .find(|remote| remote.endpoint == endpoint)
            .map(|remote| remote.folder.clone())
            .or_else(|| claimed.get(&endpoint).cloned());
        match owner {
            Some(owner) => Err(RegistryError::EndpointCollision {
                folder: folder.to_path_buf(),
                endpoint,
                owner,
            }),
            None => Ok(endpoint),
        }
    }

    fn allocate_listener_id(&mut self) -> u64 {
        self.next_listener_id += 1;
        self.next_listener_id
    }

    async fn destroy_all(&mut self, folders: Vec<PathBuf>) -> Vec<PathBuf> {
        let mut tasks = JoinSet::new();
        for folder in folders {
            if let Some(remote) = self.remotes.remove(&folder) {
                tasks.spawn(async move {
                    remote.close().await;
                    folder
                });
            }
        }

        let mut destroyed = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(folder) => destroyed.push(folder),
                Err(err) => warn!(error = %err, "Remote teardown task failed"),
            }
        }
        destroyed.sort();
        destroyed
    }

    async fn create_all(
        &mut self,
        folders: Vec<PathBuf>,
    ) -> (Vec<PathBuf>, Vec<(PathBuf, RegistryError)>) {
        let mut pending: HashSet<PathBuf> = HashSet::new();
        let mut claimed: HashMap<Endpoint, PathBuf> = HashMap::new();
        let mut failed = Vec::new();
        let mut tasks = JoinSet::new();
        for folder in folders {
            let endpoint = match self.claim_endpoint(&folder, &claimed) {
                Ok(endpoint) => endpoint,
                Err(err) => {
                    warn!(folder = %folder.display(), error = %err, "Failed to create remote");
                    failed.push((folder, err));
                    continue;
                }
            };
            claimed.insert(endpoint.clone(), folder.clone());

            let listener_id = self.allocate_listener_id();
            let max_event_bytes = self.settings.max_event_bytes;
            let router = Arc::clone(&self.router);
            pending.insert(folder.clone());
            tasks.spawn(async move {
                let result =
                    open_remote(folder.clone(), endpoint, max_event_bytes, router, listener_id)
                        .await;
                (folder, result)
            });
        }

        let mut created = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((folder, Ok(remote))) => {
                    pending.remove(&folder);
                    self.remotes.insert(folder.clone(), remote);
                    created.push(folder);
                }
                Ok((folder, Err(err))) => {
                    pending.remove(&folder);
                    warn!(folder = %folder.display(), error = %err, "Failed to create remote");
                    failed.push((folder, err));
                }
                Err(err) => warn!(error = %err, "Remote setup task failed"),
            }
        }

        for folder in pending {
            failed.push((
                folder.clone(),
                RegistryError::TaskFailed {
                    folder,
                    details: "setup task panicked or was cancelled".to_string(),
                },
            ));
        }

        created.sort();
        failed.sort_by(|a, b| a.0.cmp(&b.0));
        (created, failed)
    }
}

enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

enum Accepted {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Listener {
    async fn accept(&self) -> std::io::Result<Accepted> {
        match self {
            Listener::Unix(listener) => listener
                .accept()
                .await
                .map(|(stream, _addr)| Accepted::Unix(stream)),
            Listener::Tcp(listener) => listener
                .accept()
                .await
                .map(|(stream, _addr)| Accepted::Tcp(stream)),
        }
    }
}

async fn open_remote(
    folder: PathBuf,
    endpoint: Endpoint,
    max_event_bytes: usize,
    router: Arc<NotificationRouter>,
    listener_id: u64,
) -> Result<Remote, RegistryError> {
    let listener = bind_endpoint(&folder, &endpoint).await?;

    let (shutdown, shutdown_rx) = watch::channel(false);
    let active_connection = Arc::new(AtomicU64::new(NO_CONNECTION));
    let task = tokio::spawn(run_listener(
        listener,
        folder.clone(),
        router,
        shutdown_rx,
        Arc::clone(&active_connection),
        max_event_bytes,
    ));

    info!(
        folder = %folder.display(),
        endpoint = %endpoint,
        listener_id,
        "Remote listening"
    );

    Ok(Remote {
        folder,
        endpoint,
        listener_id,
        active_connection,
        shutdown,
        task,
    })
}

async fn bind_endpoint(folder: &Path, endpoint: &Endpoint) -> Result<Listener, RegistryError> {
    let bind_failure = |source: std::io::Error| RegistryError::BindFailure {
        folder: folder.to_path_buf(),
        endpoint: endpoint.clone(),
        source,
    };

    match endpoint {
        Endpoint::LocalSocket(path) => {
            // Leftover from an unclean shutdown. Paths held by a tracked
            // remote are rejected before this point.
            if unlink_socket(path).await {
                debug!(path = %path.display(), "Removed stale socket file");
            }
            UnixListener::bind(path)
                .map(Listener::Unix)
                .map_err(bind_failure)
        }
        Endpoint::Tcp(port) => TcpListener::bind((Ipv4Addr::LOCALHOST, *port))
            .await
            .map(Listener::Tcp)
            .map_err(bind_failure),
    }
}

/// Best-effort removal. Returns whether a file was actually removed.
async fn unlink_socket(path: &Path) -> bool {
    match fs_err::tokio::remove_file(path).await {
        Ok(()) => true,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => false,
        Err(err) => {
            debug!(path = %path.display(), error = %err, "Could not remove socket file");
            false
        }
    }
}

struct ActiveConnection {
    id: u64,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<CloseReason>,
}

impl ActiveConnection {
    fn spawn(
        stream: Accepted,
        id: u64,
        folder: &Path,
        router: &Arc<NotificationRouter>,
        active_connection: &Arc<AtomicU64>,
        max_event_bytes: usize,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let folder = folder.to_path_buf();
        let router = Arc::clone(router);
        let active = Arc::clone(active_connection);
        active.store(id, Ordering::SeqCst);

        let task = tokio::spawn(async move {
            let reason = match stream {
                Accepted::Unix(stream) => {
                    serve_connection(stream, folder, router, shutdown_rx, max_event_bytes).await
                }
                Accepted::Tcp(stream) => {
                    serve_connection(stream, folder, router, shutdown_rx, max_event_bytes).await
                }
            };
            let _ = active.compare_exchange(id, NO_CONNECTION, Ordering::SeqCst, Ordering::SeqCst);
            reason
        });

        Self { id, shutdown, task }
    }

    async fn close(self, folder: &Path) {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(reason) => debug!(
                folder = %folder.display(),
                connection_id = self.id,
                reason = ?reason,
                "Connection closed"
            ),
            Err(err) => warn!(
                folder = %folder.display(),
                connection_id = self.id,
                error = %err,
                "Connection task ended abnormally"
            ),
        }
    }
}

async fn run_listener(
    listener: Listener,
    folder: PathBuf,
    router: Arc<NotificationRouter>,
    mut shutdown: watch::Receiver<bool>,
    active_connection: Arc<AtomicU64>,
    max_event_bytes: usize,
) {
    let mut active: Option<ActiveConnection> = None;
    let mut next_connection_id = NO_CONNECTION;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok(stream) => {
                        // One reporter per folder: the newcomer replaces the
                        // previous connection, which closes out its run first.
                        if let Some(previous) = active.take() {
                            if !previous.task.is_finished() {
                                info!(
                                    folder = %folder.display(),
                                    connection_id = previous.id,
                                    "Superseding active reporter connection"
                                );
                            }
                            previous.close(&folder).await;
                        }
                        next_connection_id += 1;
                        active = Some(ActiveConnection::spawn(
                            stream,
                            next_connection_id,
                            &folder,
                            &router,
                            &active_connection,
                            max_event_bytes,
                        ));
                    }
                    Err(err) => {
                        warn!(folder = %folder.display(), error = %err, "Failed to accept reporter connection");
                        tokio::time::sleep(Duration::from_millis(ACCEPT_RETRY_DELAY_MS)).await;
                    }
                }
            }
        }
    }

    if let Some(previous) = active.take() {
        previous.close(&folder).await;
    }
    drop(listener);
}
