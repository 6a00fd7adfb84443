//! Command orchestrator driving the protocol flows against the server

use crate::coalescer::MovementCoalescer;
use crate::config::ClientConfig;
use crate::error::{ClientError, TransportError};
use crate::status::{ClientStatus, StatusMachine, StatusSnapshot};
use crate::supervisor::{FlowKind, FlowSupervisor};
use crate::transport::Transport;
use log::{debug, error, info, warn};
use servolink_shared::codec::{self, PAYLOAD_INDEX};
use servolink_shared::{ErrorCode, Frame, ServoCommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;

const CONNECT_FROM: [ClientStatus; 2] = [ClientStatus::StartingUp, ClientStatus::NoServerConn];
const SELECT_FROM: [ClientStatus; 2] = [ClientStatus::Idle, ClientStatus::StartingUp];
const SELECT_FROM_IDLE: [ClientStatus; 1] = [ClientStatus::Idle];
const FETCH_FROM: [ClientStatus; 2] = [ClientStatus::Idle, ClientStatus::RetrievingInfoAfterSelect];
const SESSION_FLOWS: [FlowKind; 2] = [FlowKind::Connect, FlowKind::Disconnect];

/// Client for one servo server connection
///
/// Every operation except [`send_movement`](Self::send_movement) is
/// fire-and-forget: it launches a flow on the tokio runtime and returns at
/// once. An operation requested from a phase that does not allow it is
/// ignored. Outcomes are observed through [`status`](Self::status),
/// [`get_last_error`](Self::get_last_error) or [`subscribe`](Self::subscribe).
///
/// Cloning is cheap; clones drive the same connection.
#[derive(Clone)]
pub struct RemoteClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    status: StatusMachine,
    transport: Transport,
    coalescer: MovementCoalescer,
    flows: Arc<FlowSupervisor>,
    runtime: Handle,
}

impl RemoteClient {
    /// Creates a client bound to the current tokio runtime
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let runtime = Handle::try_current().map_err(|_| ClientError::NoRuntime)?;
        Ok(Self::with_runtime(config, runtime))
    }

    /// Creates a client whose flows run on `runtime`
    pub fn with_runtime(config: ClientConfig, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                status: StatusMachine::new(),
                transport: Transport::new(),
                coalescer: MovementCoalescer::new(),
                flows: FlowSupervisor::new(),
                runtime,
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Host initialization hook; connects to the configured server
    pub fn start(&self) {
        self.connect();
    }

    /// Opens the connection and logs in, then selects the default MCU if one
    /// is configured
    pub fn connect(&self) {
        self.inner.connect();
    }

    /// Closes the connection once an in-flight flow has settled
    ///
    /// Waits for `Idle` or an error, bounded by
    /// [`ClientConfig::drain_timeout`]; past that the socket is closed anyway,
    /// which unblocks a flow stuck on a receive.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    pub fn select_mcu(&self, name: &str) {
        self.inner.select_mcu(name.to_string());
    }

    pub fn fetch_info(&self) {
        self.inner.fetch_info();
    }

    /// Queues servo positions for delivery
    ///
    /// The batch is validated as a whole before anything is queued; a
    /// rejected batch is also recorded as the sticky error. Accepted
    /// positions are merged with anything still pending (latest wins per
    /// servo) and a drain loop is started if none is running. While the
    /// client is errored the call is ignored and returns `Ok(())`.
    pub fn send_movement(&self, commands: &[ServoCommand]) -> Result<(), ClientError> {
        self.inner.send_movement(commands)
    }

    /// Device-confirmed positions in user-facing units
    pub fn get_current_positions(&self) -> Vec<ServoCommand> {
        self.inner.coalescer.current_positions()
    }

    /// Device-confirmed positions with the +1 wire offset kept
    pub fn raw_positions(&self) -> Vec<u8> {
        self.inner.coalescer.raw_positions()
    }

    /// Clears the sticky error; refused before a connection exists
    ///
    /// The phase is reset to `Idle` only when no flow is still running.
    pub fn clear_error(&self) -> bool {
        let busy = self.inner.flows.any_running_except(&[FlowKind::Disconnect]);
        let cleared = self.inner.status.clear_error(!busy);
        if cleared {
            info!("Error cleared");
        } else {
            debug!("Clear error ignored without a server connection");
        }
        cleared
    }

    pub fn get_last_error(&self) -> ErrorCode {
        self.inner.status.snapshot().last_error
    }

    pub fn status(&self) -> ClientStatus {
        self.inner.status.snapshot().status
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.status.snapshot()
    }

    pub fn is_errored(&self) -> bool {
        self.inner.status.snapshot().errored
    }

    pub fn servo_count(&self) -> usize {
        self.inner.coalescer.servo_count()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.inner.status.subscribe()
    }

    pub fn is_flow_running(&self, kind: FlowKind) -> bool {
        self.inner.flows.is_running(kind)
    }

    /// Whether any flow is still in progress
    pub fn is_busy(&self) -> bool {
        self.inner.flows.any_running()
    }

    /// Waits until the status satisfies `predicate`, up to `timeout`
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&StatusSnapshot) -> bool,
        timeout: Duration,
    ) -> Option<StatusSnapshot> {
        self.inner.status.wait_for(predicate, timeout).await
    }

    /// Disconnects and waits for every flow to finish
    ///
    /// A connect still in progress is allowed to finish first, since a
    /// disconnect issued alongside it would be ignored. Returns `false` if
    /// some flow was still running after the drain timeout plus the connect
    /// timeout.
    pub async fn shutdown(&self) -> bool {
        let config = &self.inner.config;
        if self.is_flow_running(FlowKind::Connect) {
            let others = [
                FlowKind::SelectMcu,
                FlowKind::FetchInfo,
                FlowKind::Movement,
                FlowKind::Disconnect,
            ];
            if !self
                .inner
                .flows
                .wait_settled(&others, config.connect_timeout)
                .await
            {
                warn!("Connect still running at shutdown");
            }
        }

        self.disconnect();
        let limit = config.drain_timeout + config.connect_timeout;
        let settled = self.inner.flows.wait_settled(&[], limit).await;
        if !settled {
            warn!("Shutdown finished with flows still running");
        }
        settled
    }
}

impl Inner {
    fn connect(self: &Arc<Self>) {
        if !CONNECT_FROM.contains(&self.status.snapshot().status) {
            debug!("Connect ignored: already connected");
            return;
        }
        let Some(guard) = self.flows.try_claim(FlowKind::Connect, &SESSION_FLOWS) else {
            debug!("Connect ignored: connect or disconnect in progress");
            return;
        };

        let inner = Arc::clone(self);
        self.flows
            .spawn(&self.runtime, guard, async move { inner.run_connect().await });
    }

    async fn run_connect(self: Arc<Self>) {
        let addr = self.config.server_addr();
        info!("Connecting to server at {}", addr);

        let result = async {
            self.transport
                .connect(&self.config.host, self.config.port, self.config.connect_timeout)
                .await?;
            self.transport.send(&codec::encode_login()).await
        }
        .await;

        if let Err(e) = result {
            error!("Failed to connect to {}: {}", addr, e);
            self.status.disconnected();
            self.transport.close().await;
            return;
        }

        info!("Logged in to {}", addr);
        self.status.logged_in();

        match &self.config.default_mcu {
            Some(name) => self.select_mcu(name.clone()),
            None => {
                self.status.advance(&[ClientStatus::StartingUp], ClientStatus::Idle);
            }
        }
    }

    fn disconnect(self: &Arc<Self>) {
        if self.status.snapshot().status == ClientStatus::NoServerConn {
            debug!("Disconnect ignored: not connected");
            return;
        }
        let Some(guard) = self.flows.try_claim(FlowKind::Disconnect, &SESSION_FLOWS) else {
            debug!("Disconnect ignored: connect or disconnect in progress");
            return;
        };

        let inner = Arc::clone(self);
        self.flows
            .spawn(&self.runtime, guard, async move { inner.run_disconnect().await });
    }

    async fn run_disconnect(self: Arc<Self>) {
        let timeout = self.config.drain_timeout;
        let settled = self
            .status
            .wait_for(
                |s| {
                    s.errored
                        || matches!(
                            s.status,
                            ClientStatus::Idle | ClientStatus::StartingUp | ClientStatus::NoServerConn
                        )
                },
                timeout,
            )
            .await;

        if settled.is_none() {
            warn!(
                "Flow did not settle within {:?}, forcing disconnect",
                timeout
            );
        }

        // Status first, so a receive unblocked by the close cannot record a
        // late transport error
        self.status.disconnected();
        self.transport.close().await;
        info!("Disconnected from server");
    }

    fn select_mcu(self: &Arc<Self>, name: String) {
        // StartingUp only counts as logged in once the socket is open
        let allowed: &[ClientStatus] = if self.transport.is_open() {
            &SELECT_FROM
        } else {
            &SELECT_FROM_IDLE
        };
        if !self.status.try_begin(allowed, ClientStatus::OnMcuSelect) {
            debug!("Select MCU '{}' ignored in {:?}", name, self.status.snapshot().status);
            return;
        }

        let guard = self.flows.claim(FlowKind::SelectMcu);
        let inner = Arc::clone(self);
        self.flows
            .spawn(&self.runtime, guard, async move { inner.run_select_mcu(name).await });
    }

    async fn run_select_mcu(self: Arc<Self>, name: String) {
        let reply = match self.exchange(&codec::encode_select_mcu(&name)).await {
            Ok(reply) => reply,
            Err(e) => {
                error!("Select MCU '{}' failed: {}", name, e);
                self.status.fail(ErrorCode::ServerConnError);
                return;
            }
        };

        match codec::classify(&reply) {
            Frame::Ack => {
                info!("MCU '{}' selected", name);
                if self.status.advance(
                    &[ClientStatus::OnMcuSelect],
                    ClientStatus::RetrievingInfoAfterSelect,
                ) {
                    self.fetch_info();
                }
            }
            Frame::Nack(reason) => {
                warn!("Server refused MCU '{}': {} ({})", name, reason, reason.code());
                self.status.fail_to_idle(reason.into());
            }
            Frame::Info | Frame::Corrupt => {
                error!("Corrupt response to select MCU: {:?}", reply);
                self.status.fail(ErrorCode::ServerConnError);
            }
        }
    }

    fn fetch_info(self: &Arc<Self>) {
        if !self.status.try_begin(&FETCH_FROM, ClientStatus::RetrievingInfo) {
            debug!("Fetch info ignored in {:?}", self.status.snapshot().status);
            return;
        }

        let guard = self.flows.claim(FlowKind::FetchInfo);
        let inner = Arc::clone(self);
        self.flows
            .spawn(&self.runtime, guard, async move { inner.run_fetch_info().await });
    }

    async fn run_fetch_info(self: Arc<Self>) {
        let reply = match self.exchange(&codec::encode_fetch_info()).await {
            Ok(reply) => reply,
            Err(e) => {
                error!("Fetch info failed: {}", e);
                self.status.fail(ErrorCode::ServerConnError);
                return;
            }
        };

        match codec::classify(&reply) {
            Frame::Info => match codec::decode_info_frame(&reply) {
                Ok(info) => {
                    info!("MCU reports {} servos", info.servo_count);
                    self.coalescer.reset(info.positions);
                    self.status
                        .advance(&[ClientStatus::RetrievingInfo], ClientStatus::Idle);
                }
                Err(e) => {
                    error!("Information from server (iMCU) was corrupted: {}", e);
                    self.status.fail(ErrorCode::CorruptedInfo);
                }
            },
            Frame::Nack(reason) => {
                warn!("Server refused info request: {} ({})", reason, reason.code());
                self.status.fail_to_idle(reason.into());
            }
            Frame::Ack | Frame::Corrupt => {
                error!("Corrupt response to info request: {:?}", reply);
                self.status.fail(ErrorCode::ServerConnError);
            }
        }
    }

    fn send_movement(self: &Arc<Self>, commands: &[ServoCommand]) -> Result<(), ClientError> {
        if commands.is_empty() {
            return Ok(());
        }
        if self.status.snapshot().errored {
            debug!("Movement ignored while errored");
            return Ok(());
        }

        if let Err(e) = self.coalescer.submit(commands) {
            warn!("Movement rejected: {}", e);
            self.status.fail(match e {
                ClientError::InvalidServoPosition { .. } => ErrorCode::InvalidServoPosition,
                _ => ErrorCode::InvalidServoId,
            });
            return Err(e);
        }

        if self
            .status
            .try_begin(&[ClientStatus::Idle], ClientStatus::WaitingServerAck)
        {
            let guard = self.flows.claim(FlowKind::Movement);
            let inner = Arc::clone(self);
            self.flows
                .spawn(&self.runtime, guard, async move { inner.run_movement().await });
        } else {
            debug!("Movement queued behind active flow");
        }
        Ok(())
    }

    async fn run_movement(self: Arc<Self>) {
        self.coalescer
            .drain(&self.status, |snapshot| {
                let inner = Arc::clone(&self);
                async move { inner.deliver_movement(snapshot).await }
            })
            .await;
        debug!("Movement drain finished");
    }

    /// One drain iteration: send the snapshot, then await the server ACK and
    /// the device ACK in that order
    async fn deliver_movement(&self, snapshot: Vec<u8>) -> bool {
        let query = codec::encode_movement(&snapshot);
        debug!("Sending movement with {} items", query[PAYLOAD_INDEX]);

        let reply = match self.exchange(&query).await {
            Ok(reply) => reply,
            Err(e) => {
                error!("Movement send failed: {}", e);
                self.status.fail(ErrorCode::ServerConnError);
                return false;
            }
        };
        if !self.accept_ack(&reply, "server") {
            return false;
        }
        if !self.status.advance(
            &[ClientStatus::WaitingServerAck],
            ClientStatus::WaitingDeviceAck,
        ) {
            return false;
        }

        let reply = match self.transport.receive(self.config.recv_buffer_size).await {
            Ok(reply) => reply,
            Err(e) => {
                error!("Waiting for device acknowledgement failed: {}", e);
                self.status.fail(ErrorCode::ServerConnError);
                return false;
            }
        };
        if !self.accept_ack(&reply, "device") {
            return false;
        }

        debug!("Movement acknowledged by device");
        true
    }

    fn accept_ack(&self, reply: &[u8], phase: &str) -> bool {
        match codec::classify(reply) {
            Frame::Ack => true,
            Frame::Nack(reason) => {
                warn!("Movement refused at {} phase: {} ({})", phase, reason, reason.code());
                self.status.fail_to_idle(reason.into());
                false
            }
            Frame::Info | Frame::Corrupt => {
                error!("Corrupt {} acknowledgement: {:?}", phase, reply);
                self.status.fail(ErrorCode::ServerConnError);
                false
            }
        }
    }

    /// Sends a query and returns the single frame read in reply
    async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>, TransportError> {
        self.transport.send(query).await?;
        self.transport.receive(self.config.recv_buffer_size).await
    }
}
