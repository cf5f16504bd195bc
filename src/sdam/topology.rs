use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::{
    broadcast,
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    watch::{self, Ref},
};

use super::{
    description::{
        server::{ServerDescription, ServerType},
        topology::{
            server_selection::{attempt_to_select_server, SelectedServer},
            SessionSupportStatus,
            TopologyDescription,
            TopologyType,
            TransactionSupportStatus,
        },
    },
    monitor::Monitor,
    server::Server,
};
use crate::{
    bson::oid::ObjectId,
    client::session::ClusterTime,
    cmap::{establish::ConnectionEstablisher, Command, Connection},
    error::{Error, ErrorKind, Result},
    event::sdam::{
        SdamEventEmitter,
        ServerClosedEvent,
        ServerDescriptionChangedEvent,
        ServerOpeningEvent,
        TopologyClosedEvent,
        TopologyDescriptionChangedEvent,
        TopologyOpeningEvent,
    },
    options::{ClientOptions, ServerAddress},
    runtime::{self, AcknowledgedMessage, WorkerHandle, WorkerHandleListener},
    selection_criteria::SelectionCriteria,
    trace::server_selection::SelectionTrace,
};

const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Servers older than this wire version clear their pool on every state change error.
const KEEPS_POOL_ON_STEP_DOWN_WIRE_VERSION: i32 = 8;

/// The client's view of the deployment.
///
/// One background task owns the topology state and applies every change to it. Everyone else
/// reads published snapshots through a [`TopologyWatcher`], so selection never observes a
/// half-applied update. The task stops on [`Topology::shutdown`] or when the last handle drops.
#[derive(Debug)]
pub(crate) struct Topology {
    id: ObjectId,
    watcher: TopologyWatcher,
    updater: TopologyUpdater,
    check_requester: CheckRequester,
    selection_timeout: Duration,
    _worker_handle: WorkerHandle,
}

impl Topology {
    pub(crate) fn new(options: ClientOptions) -> Result<Topology> {
        let id = ObjectId::new();
        let seeds = TopologyDescription::new(&options);
        let establisher = ConnectionEstablisher::new(&options)?;
        let events = SdamEventEmitter::new(
            options.sdam_event_handler.clone(),
            id,
            options.tracing_max_document_length_bytes,
        );
        let selection_timeout = options
            .server_selection_timeout
            .unwrap_or(DEFAULT_SERVER_SELECTION_TIMEOUT);

        let (updater, updates) = TopologyUpdater::channel();
        let (worker_handle, handle_listener) = WorkerHandleListener::channel();
        let (watcher, publisher) = TopologyWatcher::channel(TopologyState::default());
        let check_requester = CheckRequester::new();

        let worker = TopologyWorker {
            id,
            updates,
            handle_listener,
            publisher,
            options,
            establisher,
            events,
            watcher: watcher.clone(),
            updater: updater.clone(),
            check_requester: check_requester.clone(),
        };
        worker.run(seeds);

        Ok(Topology {
            id,
            watcher,
            updater,
            check_requester,
            selection_timeout,
            _worker_handle: worker_handle,
        })
    }

    pub(crate) fn id(&self) -> ObjectId {
        self.id
    }

    fn latest(&self) -> Ref<'_, TopologyState> {
        self.watcher.borrow_latest()
    }

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

    pub(crate) fn cluster_time(&self) -> Option<ClusterTime> {
        self.latest().description.cluster_time().cloned()
    }

    pub(crate) async fn advance_cluster_time(&self, to: ClusterTime) {
        self.updater.advance_cluster_time(to).await;
    }

    pub(crate) fn topology_type(&self) -> TopologyType {
        self.latest().description.topology_type
    }

    pub(crate) fn session_support_status(&self) -> SessionSupportStatus {
        self.latest().description.session_support_status()
    }

    pub(crate) fn transaction_support_status(&self) -> TransactionSupportStatus {
        self.latest().description.transaction_support_status()
    }

    /// Adds `$readPreference` to `command` when the server at `address` needs one.
    pub(crate) fn update_command_with_read_pref(
        &self,
        address: &ServerAddress,
        command: &mut Command,
        criteria: Option<&SelectionCriteria>,
    ) {
        self.latest()
            .description
            .update_command_with_read_pref(address, command, criteria)
    }

    /// Picks a server matching `criteria`. While nothing matches, monitors are asked for an
    /// immediate check and selection retries on every published change until the selection
    /// timeout runs out.
    pub(crate) async fn select_server(
        &self,
        criteria: &SelectionCriteria,
        operation_name: &str,
    ) -> Result<SelectedServer> {
        let deadline = Instant::now() + self.selection_timeout;
        let trace = SelectionTrace::new(self.id, criteria, operation_name, deadline);

        let mut watcher = self.watcher.clone();
        let mut announced_wait = false;
        trace.started(&watcher.clone_latest().description);

        loop {
            if !watcher.is_alive() {
                return Err(ErrorKind::Shutdown.into());
            }
            let state = watcher.clone_latest();
            match attempt_to_select_server(criteria, &state.description, &state.servers) {
                Ok(Some(server)) => {
                    trace.succeeded(&state.description, server.address());
                    return Ok(server);
                }
                Ok(None) => {}
                Err(error) => {
                    trace.failed(&state.description, &error);
                    return Err(error);
                }
            }

            if !announced_wait {
                trace.waiting(&state.description);
                announced_wait = true;
            }
            self.check_requester.request();

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || !watcher.wait_for_update(remaining).await {
                if !watcher.is_alive() {
                    return Err(ErrorKind::Shutdown.into());
                }
                let state = watcher.clone_latest();
                let error = Error::from(ErrorKind::ServerSelection {
                    message: state
                        .description
                        .server_selection_timeout_error_message(criteria),
                });
                trace.failed(&state.description, &error);
                return Err(error);
            }
        }
    }

    /// Stops every monitor and closes the topology. Pending selections fail with a shutdown
    /// error.
    pub(crate) async fn shutdown(&self) {
        self.updater.send(TopologyUpdate::Shutdown).await;
    }

    #[cfg(test)]
    pub(crate) fn description(&self) -> TopologyDescription {
        self.latest().description.clone()
    }
}

/// What the worker publishes: the description and one [`Server`] per address in it.
#[derive(Debug, Clone, Default)]
pub(crate) struct TopologyState {
    pub(crate) description: TopologyDescription,
    pub(crate) servers: HashMap<ServerAddress, Arc<Server>>,
}

#[derive(Debug)]
pub(crate) enum TopologyUpdate {
    ServerChecked(Box<ServerDescription>),
    MonitorFailed {
        address: ServerAddress,
        error: Error,
    },
    OperationFailed {
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    },
    ClusterTime(ClusterTime),
    Shutdown,
}

/// What an application error means for the server it came from.
#[derive(Debug, PartialEq)]
enum ErrorResponse {
    /// Nothing about the server is known to have changed.
    Ignore,

    /// Mark the server unknown. The flag says whether its pool is cleared too.
    MarkUnknown { clear_pool: bool },
}

impl ErrorResponse {
    fn to(error: &Error, phase: &HandshakePhase) -> Self {
        if error.is_state_change_error() {
            let old_server = phase
                .wire_version()
                .is_none_or(|wire| wire < KEEPS_POOL_ON_STEP_DOWN_WIRE_VERSION);
            return Self::MarkUnknown {
                clear_pool: error.is_shutting_down() || old_server,
            };
        }
        let during_handshake = phase.is_before_completion()
            && (error.is_auth_error() || error.is_network_timeout() || error.is_command_error());
        if error.is_non_timeout_network_error() || during_handshake {
            Self::MarkUnknown { clear_pool: true }
        } else {
            Self::Ignore
        }
    }
}

struct TopologyWorker {
    id: ObjectId,
    updates: TopologyUpdateReceiver,
    handle_listener: WorkerHandleListener,
    publisher: StatePublisher,
    options: ClientOptions,
    establisher: ConnectionEstablisher,
    events: SdamEventEmitter,

    // Handed to the monitors and pools this worker creates.
    watcher: TopologyWatcher,
    updater: TopologyUpdater,
    check_requester: CheckRequester,
}

impl TopologyWorker {
    fn run(mut self, seeds: TopologyDescription) {
        self.events
            .emit_event(|| TopologyOpeningEvent { topology_id: self.id }.into());
        let mut state = self.publisher.latest();
        let empty = std::mem::replace(&mut state.description, seeds);
        self.add_and_remove_servers(&mut state);
        self.emit_changes(&empty, &state.description);
        self.publisher.publish(state);

        runtime::execute(async move {
            let shutdown_ack = loop {
                let message = tokio::select! {
                    Some(message) = self.updates.recv() => message,
                    _ = self.handle_listener.wait_for_all_handle_drops() => break None,
                };
                let (update, ack) = message.into_parts();
                let changed = match update {
                    TopologyUpdate::Shutdown => break Some(ack),
                    TopologyUpdate::ServerChecked(description) => {
                        self.apply_server_description(*description).await
                    }
                    TopologyUpdate::MonitorFailed { address, error } => {
                        let response = ErrorResponse::MarkUnknown { clear_pool: true };
                        self.on_error(address, error, response).await
                    }
                    TopologyUpdate::OperationFailed {
                        address,
                        error,
                        phase,
                    } => self.on_application_error(address, error, phase).await,
                    TopologyUpdate::ClusterTime(to) => {
                        let mut state = self.publisher.latest();
                        state.description.advance_cluster_time(&to);
                        self.publisher.publish(state);
                        true
                    }
                };
                ack.acknowledge(changed);
            };

            self.close();
            if let Some(ack) = shutdown_ack {
                ack.acknowledge(true);
            }
        });
    }

    fn close(self) {
        let state = self.publisher.latest();
        let closed = TopologyDescription {
            servers: HashMap::new(),
            ..state.description.clone()
        };
        self.emit_changes(&state.description, &closed);
        self.publisher.publish(TopologyState {
            description: closed,
            servers: HashMap::new(),
        });
        self.events
            .emit_event(|| TopologyClosedEvent { topology_id: self.id }.into());
        tracing::debug!(topologyId = %self.id, "topology closed");
    }

    /// Gives every address in the description a [`Server`] and a monitor, and drops servers whose
    /// address is gone. A dropped server's pool closes with its last handle.
    fn add_and_remove_servers(&self, state: &mut TopologyState) {
        let addresses: HashSet<&ServerAddress> = state.description.server_addresses().collect();
        state.servers.retain(|address, _| addresses.contains(address));

        let added: Vec<ServerAddress> = addresses
            .into_iter()
            .filter(|address| !state.servers.contains_key(*address))
            .cloned()
            .collect();
        for address in added {
            let server = Server::new(
                address.clone(),
                &self.options,
                self.establisher.clone(),
                self.updater.clone(),
                self.id,
            );
            state.servers.insert(address.clone(), server);
            Monitor::start(
                address,
                self.updater.clone(),
                self.watcher.clone(),
                self.check_requester.subscribe(),
                self.events.clone(),
                self.establisher.clone(),
                &self.options,
            );
        }
    }

    /// Folds a server description into the topology and publishes the result if anything
    /// changed. Returns whether it did.
    async fn apply_server_description(&mut self, description: ServerDescription) -> bool {
        let address = description.address.clone();
        let server_type = description.server_type;
        let mut state = self.publisher.latest();
        let previous = state.description.clone();

        if let Err(error) = state.description.update(description) {
            tracing::warn!(
                serverHost = address.host(),
                serverPort = address.port(),
                error = %error,
                "ignoring invalid server description"
            );
            return false;
        }
        self.add_and_remove_servers(&mut state);
        let changed = self.emit_changes(&previous, &state.description);

        // A pool opens once a check has shown its server can take operations.
        let usable = server_type.is_data_bearing()
            || (server_type != ServerType::Unknown
                && state.description.topology_type() == TopologyType::Single);
        if usable {
            if let Some(server) = state.servers.get(&address) {
                server.pool.mark_as_ready().await;
            }
        }

        if changed {
            self.publisher.publish(state);
        }
        changed
    }

    /// Emits the SDAM events for the difference between two descriptions. Returns false when
    /// there is none.
    fn emit_changes(&self, previous: &TopologyDescription, current: &TopologyDescription) -> bool {
        let Some(diff) = previous.diff(current) else {
            return false;
        };
        if !self.events.is_listening() {
            return true;
        }

        let topology_id = self.id;
        for (address, (before, after)) in diff.changed_servers {
            self.events.emit_event(|| {
                Box::new(ServerDescriptionChangedEvent {
                    address: address.clone(),
                    topology_id,
                    previous_description: before.clone(),
                    new_description: after.clone(),
                })
                .into()
            });
        }
        for address in diff.removed_addresses {
            self.events.emit_event(|| {
                ServerClosedEvent {
                    address: address.clone(),
                    topology_id,
                }
                .into()
            });
        }
        for address in diff.added_addresses {
            self.events.emit_event(|| {
                ServerOpeningEvent {
                    address: address.clone(),
                    topology_id,
                }
                .into()
            });
        }
        self.events.emit_event(|| {
            Box::new(TopologyDescriptionChangedEvent {
                topology_id,
                previous_description: previous.clone(),
                new_description: current.clone(),
            })
            .into()
        });
        true
    }

    async fn on_application_error(
        &mut self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        // A connection from before the last clear reports an error the clear already handled.
        let stale = self
            .server(&address)
            .is_some_and(|server| phase.generation() < server.pool.generation());
        if stale {
            return false;
        }
        let response = ErrorResponse::to(&error, &phase);
        if response == ErrorResponse::Ignore {
            return false;
        }
        let changed = self.on_error(address, error, response).await;
        self.check_requester.request();
        changed
    }

    /// Marks the server unknown and clears its pool if `response` says so and the server's
    /// description actually changed.
    async fn on_error(
        &mut self,
        address: ServerAddress,
        error: Error,
        response: ErrorResponse,
    ) -> bool {
        let Some(server) = self.server(&address) else {
            return false;
        };
        let unknown = ServerDescription::new_from_error(address, error.clone());
        let changed = self.apply_server_description(unknown).await;
        if changed && response == (ErrorResponse::MarkUnknown { clear_pool: true }) {
            server.pool.clear(error).await;
        }
        changed
    }

    fn server(&self, address: &ServerAddress) -> Option<Arc<Server>> {
        self.publisher.state.borrow().servers.get(address).cloned()
    }
}

/// Queues updates for the topology worker. Every send waits until the worker has applied the
/// update and reports whether the topology changed.
#[derive(Debug, Clone)]
pub(crate) struct TopologyUpdater {
    sender: UnboundedSender<AcknowledgedMessage<TopologyUpdate, bool>>,
}

impl TopologyUpdater {
    pub(crate) fn channel() -> (TopologyUpdater, TopologyUpdateReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, TopologyUpdateReceiver { receiver })
    }

    async fn send(&self, update: TopologyUpdate) -> bool {
        let (message, ack) = AcknowledgedMessage::package(update);
        if self.sender.send(message).is_err() {
            return false;
        }
        ack.wait().await.unwrap_or(false)
    }

    pub(crate) async fn update(&self, description: ServerDescription) -> bool {
        self.send(TopologyUpdate::ServerChecked(Box::new(description)))
            .await
    }

    pub(crate) async fn handle_monitor_error(&self, address: ServerAddress, error: Error) -> bool {
        self.send(TopologyUpdate::MonitorFailed { address, error })
            .await
    }

    pub(crate) async fn handle_application_error(
        &self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        self.send(TopologyUpdate::OperationFailed {
            address,
            error,
            phase,
        })
        .await
    }

    pub(crate) async fn advance_cluster_time(&self, to: ClusterTime) {
        self.send(TopologyUpdate::ClusterTime(to)).await;
    }
}

pub(crate) struct TopologyUpdateReceiver {
    receiver: UnboundedReceiver<AcknowledgedMessage<TopologyUpdate, bool>>,
}

impl TopologyUpdateReceiver {
    pub(crate) async fn recv(&mut self) -> Option<AcknowledgedMessage<TopologyUpdate, bool>> {
        self.receiver.recv().await
    }
}

/// A reader of the published topology state.
#[derive(Debug, Clone)]
pub(crate) struct TopologyWatcher {
    receiver: watch::Receiver<TopologyState>,
}

impl TopologyWatcher {
    fn channel(initial: TopologyState) -> (TopologyWatcher, StatePublisher) {
        let (state, receiver) = watch::channel(initial);
        (Self { receiver }, StatePublisher { state })
    }

    /// False once the worker has stopped.
    pub(crate) fn is_alive(&self) -> bool {
        self.receiver.has_changed().is_ok()
    }

    pub(crate) fn server_description(&self, address: &ServerAddress) -> Option<ServerDescription> {
        self.receiver
            .borrow()
            .description
            .get_server_description(address)
            .cloned()
    }

    /// The latest state, which also counts as seen.
    pub(crate) fn clone_latest(&mut self) -> TopologyState {
        self.receiver.borrow_and_update().clone()
    }

    /// Waits up to `timeout` for a state this watcher has not seen. False on timeout or when the
    /// worker stopped.
    async fn wait_for_update(&mut self, timeout: Duration) -> bool {
        let changed = runtime::timeout(timeout, self.receiver.changed()).await;
        matches!(changed, Ok(Ok(())))
    }

    pub(crate) fn borrow_latest(&self) -> Ref<'_, TopologyState> {
        self.receiver.borrow()
    }
}

struct StatePublisher {
    state: watch::Sender<TopologyState>,
}

impl StatePublisher {
    fn latest(&self) -> TopologyState {
        self.state.borrow().clone()
    }

    fn publish(&self, state: TopologyState) {
        self.state.send_replace(state);
    }
}

/// Asks every monitor for an immediate check.
#[derive(Clone, Debug)]
struct CheckRequester {
    sender: broadcast::Sender<()>,
}

impl CheckRequester {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self { sender }
    }

    fn request(&self) {
        let _ = self.sender.send(());
    }

    fn subscribe(&self) -> CheckRequestReceiver {
        CheckRequestReceiver {
            receiver: self.sender.subscribe(),
        }
    }
}

/// A monitor's end of the [`CheckRequester`].
pub(crate) struct CheckRequestReceiver {
    receiver: broadcast::Receiver<()>,
}

impl CheckRequestReceiver {
    /// Returns after `timeout`, or earlier if a check is requested.
    pub(crate) async fn wait(&mut self, timeout: Duration) {
        let _ = runtime::timeout(timeout, self.receiver.recv()).await;
    }

    /// Forgets requests that arrived while a check was already running.
    pub(crate) fn clear(&mut self) {
        while self.receiver.try_recv().is_ok() {}
    }
}

/// How far the connection that saw an error had got through its handshake. Decides how the
/// error affects the server's description and pool.
#[derive(Debug, Clone)]
pub(crate) enum HandshakePhase {
    /// The initial `hello` had not completed.
    PreHello { generation: u32 },

    /// `hello` had completed but authentication had not.
    PostHello { generation: u32 },

    /// The connection was fully established.
    AfterCompletion {
        generation: u32,
        max_wire_version: i32,
    },
}

impl HandshakePhase {
    pub(crate) fn after_completion(connection: &Connection) -> Self {
        let max_wire_version = connection
            .stream_description()
            .ok()
            .and_then(|description| description.max_wire_version)
            .unwrap_or(0);
        Self::AfterCompletion {
            generation: connection.generation,
            max_wire_version,
        }
    }

    fn generation(&self) -> u32 {
        match *self {
            Self::PreHello { generation }
            | Self::PostHello { generation }
            | Self::AfterCompletion { generation, .. } => generation,
        }
    }

    pub(crate) fn is_before_completion(&self) -> bool {
        !matches!(self, Self::AfterCompletion { .. })
    }

    /// Only known once the handshake completed.
    pub(crate) fn wire_version(&self) -> Option<i32> {
        match *self {
            Self::AfterCompletion {
                max_wire_version, ..
            } => Some(max_wire_version),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::{ErrorResponse, HandshakePhase};
    use crate::error::{CommandError, Error, ErrorKind};

    fn command_error(code: i32) -> Error {
        ErrorKind::Command(CommandError {
            code,
            code_name: String::new(),
            message: String::new(),
        })
        .into()
    }

    fn established(max_wire_version: i32) -> HandshakePhase {
        HandshakePhase::AfterCompletion {
            generation: 0,
            max_wire_version,
        }
    }

    #[test]
    fn step_down_keeps_the_pool_on_modern_servers() {
        // NotWritablePrimary
        let error = command_error(10107);
        assert_eq!(
            ErrorResponse::to(&error, &established(17)),
            ErrorResponse::MarkUnknown { clear_pool: false }
        );
        assert_eq!(
            ErrorResponse::to(&error, &established(7)),
            ErrorResponse::MarkUnknown { clear_pool: true }
        );
    }

    #[test]
    fn shutdown_always_clears_the_pool() {
        // InterruptedAtShutdown
        let error = command_error(11600);
        assert_eq!(
            ErrorResponse::to(&error, &established(17)),
            ErrorResponse::MarkUnknown { clear_pool: true }
        );
    }

    #[test]
    fn command_errors_only_matter_during_the_handshake() {
        let error = command_error(18);
        assert_eq!(
            ErrorResponse::to(&error, &established(17)),
            ErrorResponse::Ignore
        );
        assert_eq!(
            ErrorResponse::to(&error, &HandshakePhase::PostHello { generation: 0 }),
            ErrorResponse::MarkUnknown { clear_pool: true }
        );
    }

    #[test]
    fn timeouts_after_the_handshake_are_ignored() {
        let timeout = Error::from(std::io::Error::from(std::io::ErrorKind::TimedOut));
        assert_eq!(
            ErrorResponse::to(&timeout, &established(17)),
            ErrorResponse::Ignore
        );
        let reset = Error::from(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert_eq!(
            ErrorResponse::to(&reset, &established(17)),
            ErrorResponse::MarkUnknown { clear_pool: true }
        );
    }
}
