use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use bson::oid::ObjectId;
use tokio::sync::{mpsc, watch};

use super::{
    description::server::ServerDescription,
    description::topology::{TopologyDescription, TopologyType},
    monitor::{Monitor, MonitorRequester},
    public::ServerInfo,
};
use crate::{
    cmap::{establish::ConnectionEstablisher, options::ConnectionPoolOptions, ConnectionPool},
    error::{Error, ErrorKind, Result},
    event::sdam::{
        SdamEventHandler,
        ServerClosedEvent,
        ServerDescriptionChangedEvent,
        ServerOpeningEvent,
        ServerSelectionEmptyEvent,
        TopologyClosedEvent,
        TopologyDescriptionChangedEvent,
        TopologyOpeningEvent,
    },
    options::{ClientOptions, ServerAddress},
    runtime::{self, AcknowledgedMessage, WorkerHandle, WorkerHandleListener},
    selection_criteria::SelectionCriteria,
};

pub(crate) const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// A server in the topology: its connection pool plus the handle used to nudge its monitor.
/// Exactly one `Server` (and therefore one monitor) exists per address at any moment; dropping
/// it retires the address.
#[derive(Debug)]
pub(crate) struct Server {
    pub(crate) address: ServerAddress,
    pub(crate) pool: ConnectionPool,
    monitor_requester: MonitorRequester,

    /// Dropping this stops the address's monitor.
    _monitor_handle: WorkerHandle,
}

impl Server {
    pub(crate) fn request_immediate_check(&self) {
        self.monitor_requester.request_immediate_check();
    }
}

/// The topology state published to watchers: the description plus the live servers backing it.
#[derive(Debug, Clone)]
pub(crate) struct TopologyState {
    pub(crate) description: TopologyDescription,
    pub(crate) servers: HashMap<ServerAddress, Arc<Server>>,
}

/// The driver's live model of the deployment. Holds the worker that owns the
/// `TopologyDescription`, the channel used to feed it monitor updates, and the watch channel
/// used to observe it.
#[derive(Debug)]
pub(crate) struct Topology {
    watcher: TopologyWatcher,
    updater: TopologyUpdater,
    event_emitter: SdamEventEmitter,
    _worker_handle: WorkerHandle,
}

impl Topology {
    pub(crate) fn new(options: ClientOptions) -> Result<Topology> {
        let description = TopologyDescription::new(&options)?;
        let id = ObjectId::new();

        let event_emitter = SdamEventEmitter {
            handler: options.sdam_event_handler.clone(),
        };

        event_emitter.emit(|handler| {
            handler.handle_topology_opening_event(TopologyOpeningEvent { topology_id: id })
        });

        let establisher = ConnectionEstablisher::new(&options)?;

        let (update_sender, update_receiver) = mpsc::unbounded_channel();
        let updater = TopologyUpdater {
            sender: update_sender,
        };

        let (state_sender, state_receiver) = watch::channel(TopologyState {
            description: description.clone(),
            servers: HashMap::new(),
        });
        let watcher = TopologyWatcher {
            receiver: state_receiver,
        };

        let (worker_handle, handle_listener) = WorkerHandleListener::channel();

        let worker = TopologyWorker {
            id,
            state: TopologyState {
                description,
                servers: HashMap::new(),
            },
            publisher: state_sender,
            update_receiver,
            updater: updater.clone(),
            watcher: watcher.clone(),
            event_emitter: event_emitter.clone(),
            establisher,
            options,
            handle_listener,
        };
        worker.start();

        Ok(Topology {
            watcher,
            updater,
            event_emitter,
            _worker_handle: worker_handle,
        })
    }

    pub(crate) fn updater(&self) -> TopologyUpdater {
        self.updater.clone()
    }

    /// The latest published topology state.
    pub(crate) fn latest_state(&self) -> TopologyState {
        self.watcher.peek_latest()
    }

    pub(crate) fn logical_session_timeout(&self) -> Option<Duration> {
        self.watcher.peek_latest().description.logical_session_timeout
    }

    /// Hand an application-level error to the worker, returning whether the topology changed as
    /// a result.
    pub(crate) async fn handle_application_error(
        &self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        self.updater
            .handle_application_error(address, error, phase)
            .await
    }

    /// Stop the worker, retiring every monitor and pool. Idempotent.
    pub(crate) async fn shutdown(&self) {
        self.updater.shutdown().await;
    }

    /// Selects a server per the server selection algorithm, waiting for topology updates until
    /// `timeout` when no server is immediately suitable.
    pub(crate) async fn select_server(
        &self,
        criteria: &SelectionCriteria,
        operation_name: &str,
        timeout: Duration,
    ) -> Result<SelectedServer> {
        let start = Instant::now();
        let mut watcher = self.watcher.clone();

        loop {
            let state = watcher.observe_latest();

            if let Some(message) = state.description.compatibility_error() {
                return Err(ErrorKind::IncompatibleServer {
                    message: message.clone(),
                }
                .into());
            }

            let selected = state
                .description
                .select_server(criteria)
                .and_then(|description| state.servers.get(&description.address));

            if let Some(server) = selected {
                return Ok(SelectedServer {
                    server: server.clone(),
                });
            }

            self.event_emitter.emit(|handler| {
                handler.handle_server_selection_empty_event(ServerSelectionEmptyEvent {
                    operation_name: operation_name.to_string(),
                    criteria: criteria.clone(),
                    topology_description: (&state.description).into(),
                })
            });

            // No suitable server; ask the monitors to re-check sooner and wait for the topology
            // to change.
            for server in state.servers.values() {
                server.request_immediate_check();
            }

            let remaining = match timeout.checked_sub(start.elapsed()) {
                Some(remaining) if remaining > Duration::ZERO => remaining,
                _ => {
                    return Err(ErrorKind::ServerSelection {
                        message: format!(
                            "Server selection timeout: None of the available servers suitable \
                             for criteria {:?}. Topology: {:?}",
                            criteria, state.description
                        ),
                    }
                    .into())
                }
            };

            watcher.wait_for_update(remaining).await;
        }
    }
}

/// A server selected for an operation. Holds the server alive for the duration of the operation
/// even if it is concurrently removed from the topology.
#[derive(Debug)]
pub(crate) struct SelectedServer {
    server: Arc<Server>,
}

impl std::ops::Deref for SelectedServer {
    type Target = Server;

    fn deref(&self) -> &Self::Target {
        &self.server
    }
}

/// Enum describing how far into the handshake process a connection was when an application error
/// occurred, used to decide whether the error still reflects the server's current state.
#[derive(Debug, Clone)]
pub(crate) enum HandshakePhase {
    /// The error occurred before the connection completed its handshake.
    PreHello { generation: u32 },

    /// The error occurred on a fully established connection.
    AfterCompletion {
        generation: u32,
        max_wire_version: Option<i32>,
    },
}

impl HandshakePhase {
    pub(crate) fn after_completion(connection: &crate::cmap::Connection) -> Self {
        Self::AfterCompletion {
            generation: connection.generation,
            max_wire_version: connection
                .stream_description
                .as_ref()
                .and_then(|description| description.max_wire_version),
        }
    }

    fn generation(&self) -> u32 {
        match self {
            Self::PreHello { generation } => *generation,
            Self::AfterCompletion { generation, .. } => *generation,
        }
    }

    fn max_wire_version(&self) -> Option<i32> {
        match self {
            Self::PreHello { .. } => None,
            Self::AfterCompletion {
                max_wire_version, ..
            } => *max_wire_version,
        }
    }
}

/// Sends updates to the topology worker, which is the single writer of the
/// `TopologyDescription`.
#[derive(Debug, Clone)]
pub(crate) struct TopologyUpdater {
    sender: mpsc::UnboundedSender<AcknowledgedUpdate>,
}

impl TopologyUpdater {
    /// Apply a fresh server description produced by a monitor, returning whether the topology
    /// changed.
    pub(crate) async fn update(&self, description: ServerDescription) -> bool {
        let (message, receiver) = AcknowledgedMessage::package(UpdateMessage::ServerUpdate(
            Box::new(description),
        ));
        if self.sender.send(message).is_err() {
            return false;
        }
        receiver.wait_for_acknowledgment().await.unwrap_or(false)
    }

    /// Mark a server unknown because its monitor's check failed.
    pub(crate) async fn handle_monitor_error(&self, address: ServerAddress, error: Error) -> bool {
        let (message, receiver) =
            AcknowledgedMessage::package(UpdateMessage::MonitorError { address, error });
        if self.sender.send(message).is_err() {
            return false;
        }
        receiver.wait_for_acknowledgment().await.unwrap_or(false)
    }

    pub(crate) async fn handle_application_error(
        &self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        let (message, receiver) = AcknowledgedMessage::package(UpdateMessage::ApplicationError {
            address,
            error,
            phase,
        });
        if self.sender.send(message).is_err() {
            return false;
        }
        receiver.wait_for_acknowledgment().await.unwrap_or(false)
    }

    pub(crate) async fn shutdown(&self) {
        let (message, receiver) = AcknowledgedMessage::package(UpdateMessage::Shutdown);
        if self.sender.send(message).is_err() {
            return;
        }
        receiver.wait_for_acknowledgment().await;
    }
}

/// Observes the latest published topology state. Clones share the same underlying channel.
#[derive(Debug, Clone)]
pub(crate) struct TopologyWatcher {
    receiver: watch::Receiver<TopologyState>,
}

impl TopologyWatcher {
    /// Whether the topology worker is still running.
    pub(crate) fn is_alive(&self) -> bool {
        self.receiver.has_changed().is_ok()
    }

    pub(crate) fn server_description(
        &self,
        address: &ServerAddress,
    ) -> Option<ServerDescription> {
        self.receiver
            .borrow()
            .description
            .get_server_description(address)
            .cloned()
    }

    /// Clone the latest state, marking it as seen for the purposes of `wait_for_update`.
    pub(crate) fn observe_latest(&mut self) -> TopologyState {
        self.receiver.borrow_and_update().clone()
    }

    /// Clone the latest state without affecting change tracking.
    pub(crate) fn peek_latest(&self) -> TopologyState {
        self.receiver.borrow().clone()
    }

    /// Wait up to `timeout` for a state newer than the last observed one, returning whether one
    /// arrived.
    pub(crate) async fn wait_for_update(&mut self, timeout: Duration) -> bool {
        matches!(
            runtime::timeout(timeout, self.receiver.changed()).await,
            Ok(Ok(()))
        )
    }
}

/// Emits SDAM events to the application's handler, if one is registered.
#[derive(Clone)]
pub(crate) struct SdamEventEmitter {
    pub(super) handler: Option<Arc<dyn SdamEventHandler>>,
}

impl std::fmt::Debug for SdamEventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SdamEventEmitter")
            .field("registered", &self.handler.is_some())
            .finish()
    }
}

impl SdamEventEmitter {
    pub(crate) fn emit<F>(&self, emit: F)
    where
        F: FnOnce(&dyn SdamEventHandler),
    {
        if let Some(ref handler) = self.handler {
            emit(handler.as_ref())
        }
    }
}

enum UpdateMessage {
    ServerUpdate(Box<ServerDescription>),
    MonitorError {
        address: ServerAddress,
        error: Error,
    },
    ApplicationError {
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    },
    Shutdown,
}

type AcknowledgedUpdate = AcknowledgedMessage<UpdateMessage, bool>;

struct TopologyWorker {
    id: ObjectId,
    state: TopologyState,
    publisher: watch::Sender<TopologyState>,
    update_receiver: mpsc::UnboundedReceiver<AcknowledgedUpdate>,
    updater: TopologyUpdater,
    watcher: TopologyWatcher,
    event_emitter: SdamEventEmitter,
    establisher: ConnectionEstablisher,
    options: ClientOptions,
    handle_listener: WorkerHandleListener,
}

impl TopologyWorker {
    fn start(mut self) {
        runtime::spawn(async move {
            // Spin up a server (pool + monitor) for each seed and publish the seeded state.
            let addresses: Vec<_> = self.state.description.server_addresses().cloned().collect();
            for address in addresses {
                self.event_emitter.emit(|handler| {
                    handler.handle_server_opening_event(ServerOpeningEvent {
                        address: address.clone(),
                        topology_id: self.id,
                    })
                });
                let server = self.create_server(address.clone());
                self.state.servers.insert(address, server);
            }
            self.publish();

            loop {
                tokio::select! {
                    Some(update) = self.update_receiver.recv() => {
                        let (update, ack) = update.into_parts();
                        match update {
                            UpdateMessage::ServerUpdate(description) => {
                                let changed = self.apply_update(*description);
                                ack.acknowledge(changed);
                            }
                            UpdateMessage::MonitorError { address, error } => {
                                let changed = self.handle_monitor_error(address, error);
                                ack.acknowledge(changed);
                            }
                            UpdateMessage::ApplicationError { address, error, phase } => {
                                let changed = self.handle_application_error(address, error, phase);
                                ack.acknowledge(changed);
                            }
                            UpdateMessage::Shutdown => {
                                ack.acknowledge(true);
                                break;
                            }
                        }
                    }
                    _ = self.handle_listener.wait_for_all_handle_drops() => break,
                }
            }

            // Dropping the worker drops the watch sender, which stops every monitor the next
            // time it consults its watcher.
            self.event_emitter.emit(|handler| {
                handler.handle_topology_closed_event(TopologyClosedEvent { topology_id: self.id })
            });
        });
    }

    fn create_server(&self, address: ServerAddress) -> Arc<Server> {
        let pool = ConnectionPool::new(
            address.clone(),
            self.establisher.clone(),
            ConnectionPoolOptions::from_client_options(&self.options),
        );

        let (monitor_requester, monitor_handle) = Monitor::start(
            address.clone(),
            self.updater.clone(),
            self.watcher.clone(),
            self.event_emitter.clone(),
            self.establisher.clone(),
            self.options.clone(),
        );

        Arc::new(Server {
            address,
            pool,
            monitor_requester,
            _monitor_handle: monitor_handle,
        })
    }

    /// Apply a new server description to the topology, synchronizing the server set and
    /// publishing events for whatever changed. Returns whether the topology changed.
    fn apply_update(&mut self, description: ServerDescription) -> bool {
        let previous_description = self.state.description.clone();

        let mut new_description = previous_description.clone();
        if let Err(_e) = new_description.update(description) {
            // `TopologyDescription::update` can only fail when reading fields out of an errored
            // hello reply, which the SDAM algorithm never does for Unknown servers.
            return false;
        }

        self.update_state(previous_description, new_description)
    }

    fn update_state(
        &mut self,
        previous_description: TopologyDescription,
        new_description: TopologyDescription,
    ) -> bool {
        let diff = match previous_description.diff(&new_description) {
            Some(diff) => diff,
            None => return false,
        };

        let mut added = Vec::new();
        for address in diff.added_addresses {
            added.push(address.clone());
        }
        let mut removed = Vec::new();
        for address in diff.removed_addresses {
            removed.push(address.clone());
        }
        let changed: Vec<_> = diff
            .changed_servers
            .iter()
            .map(|(address, (previous, new))| {
                ((*address).clone(), (*previous).clone(), (*new).clone())
            })
            .collect();

        for address in added {
            self.event_emitter.emit(|handler| {
                handler.handle_server_opening_event(ServerOpeningEvent {
                    address: address.clone(),
                    topology_id: self.id,
                })
            });
            let server = self.create_server(address.clone());
            self.state.servers.insert(address, server);
        }

        for address in removed {
            self.state.servers.remove(&address);
            self.event_emitter.emit(|handler| {
                handler.handle_server_closed_event(ServerClosedEvent {
                    address: address.clone(),
                    topology_id: self.id,
                })
            });
        }

        for (address, previous, new) in changed {
            // A server that just became usable unblocks its pool; one that became unknown
            // already had its pool cleared by the error path.
            if new.server_type.is_data_bearing()
                || (new_description.topology_type() == TopologyType::Single
                    && new.server_type.is_available())
            {
                if let Some(server) = self.state.servers.get(&address) {
                    server.pool.mark_as_ready();
                }
            }

            self.event_emitter.emit(|handler| {
                handler.handle_server_description_changed_event(ServerDescriptionChangedEvent {
                    address,
                    topology_id: self.id,
                    previous_description: ServerInfo::new_owned(previous),
                    new_description: ServerInfo::new_owned(new),
                })
            });
        }

        self.event_emitter.emit(|handler| {
            handler.handle_topology_description_changed_event(TopologyDescriptionChangedEvent {
                topology_id: self.id,
                previous_description: (&previous_description).into(),
                new_description: (&new_description).into(),
            })
        });

        self.state.description = new_description;
        self.publish();

        true
    }

    fn handle_monitor_error(&mut self, address: ServerAddress, error: Error) -> bool {
        let updated = self.mark_server_as_unknown(address.clone(), error);
        if updated {
            if let Some(server) = self.state.servers.get(&address) {
                server.pool.clear();
            }
        }
        updated
    }

    /// Handle an error that occurred during operation execution, per the SDAM
    /// "application errors" rules. Returns whether the topology changed.
    fn handle_application_error(
        &mut self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        let server = match self.state.servers.get(&address) {
            Some(server) => server.clone(),
            None => return false,
        };

        // A stale generation means the pool already recycled its connections in response to
        // another error; this one carries no new information.
        if phase.generation() < server.pool.generation() {
            return false;
        }

        if error.is_state_change_error() {
            let updated = self.mark_server_as_unknown(address, error.clone());

            if updated && (error.is_shutting_down() || phase.max_wire_version().unwrap_or(0) < 8) {
                server.pool.clear();
            }
            server.request_immediate_check();

            updated
        } else if error.is_non_timeout_network_error()
            || (matches!(phase, HandshakePhase::PreHello { .. })
                && (error.is_auth_error()
                    || error.is_network_timeout()
                    || error.is_command_error()))
        {
            let updated = self.mark_server_as_unknown(address, error);
            if updated {
                server.pool.clear();
                server.request_immediate_check();
            }
            updated
        } else {
            false
        }
    }

    /// Marks a server in the cluster as unknown due to the given `error`.
    fn mark_server_as_unknown(&mut self, address: ServerAddress, error: Error) -> bool {
        let description = ServerDescription::new_from_error(address, error);
        self.apply_update(description)
    }

    fn publish(&self) {
        let _: std::result::Result<_, _> = self.publisher.send(self.state.clone());
    }
}
