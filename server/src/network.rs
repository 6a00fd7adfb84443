//! Simulated servo server speaking the client protocol over TCP

use crate::mcu::{McuRegistry, SimMcu};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rand::Rng;
use servolink_shared::codec;
use servolink_shared::{NackReason, Query, ServoCommand};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Receive buffer cap before an unterminated query is discarded
const MAX_PENDING_BYTES: usize = 4096;

/// Queries whose next response can be scripted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    SelectMcu,
    FetchInfo,
    Movement,
}

/// Scripted response replacing the normal handling of one query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Injection {
    /// NACK instead of the first response
    Nack(NackReason),
    /// Movement only: server ACK, then NACK in place of the device ACK
    DeviceNack(NackReason),
    /// Read the query and never answer it
    Stall,
    /// Answer with bytes that match no frame
    Garbage,
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Delay between the server ACK and the device ACK of a movement
    pub device_latency: Duration,
    /// Random extra delay added to `device_latency`, up to this much
    pub device_jitter: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            device_latency: Duration::from_millis(20),
            device_jitter: Duration::ZERO,
        }
    }
}

/// State shared by the accept loop, every connection and test handles
struct SimState {
    config: SimConfig,
    registry: Mutex<McuRegistry>,
    movements: Mutex<Vec<Vec<ServoCommand>>>,
    injections: Mutex<HashMap<QueryKind, Injection>>,
}

/// Cloneable control handle for a running [`SimServer`]
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<SimState>,
    addr: SocketAddr,
}

impl SimHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Movement item lists in the order they were accepted
    pub fn movements(&self) -> Vec<Vec<ServoCommand>> {
        self.state.movements.lock().clone()
    }

    /// Replaces the normal response to the next query of `kind`
    pub fn inject(&self, kind: QueryKind, injection: Injection) {
        self.state.injections.lock().insert(kind, injection);
    }

    pub fn set_online(&self, mcu: &str, online: bool) -> bool {
        self.state.registry.lock().set_online(mcu, online)
    }

    /// Current servo table of `mcu` in user-facing units
    pub fn positions(&self, mcu: &str) -> Option<Vec<ServoCommand>> {
        self.state.registry.lock().get(mcu).map(SimMcu::positions)
    }
}

pub struct SimServer {
    listener: TcpListener,
    state: Arc<SimState>,
}

impl SimServer {
    pub async fn bind(
        addr: &str,
        registry: McuRegistry,
        config: SimConfig,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(addr).await?;
        info!(
            "Simulated server listening on {} with {} MCUs",
            listener.local_addr()?,
            registry.len()
        );

        Ok(SimServer {
            listener,
            state: Arc::new(SimState {
                config,
                registry: Mutex::new(registry),
                movements: Mutex::new(Vec::new()),
                injections: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> std::io::Result<SimHandle> {
        Ok(SimHandle {
            state: Arc::clone(&self.state),
            addr: self.local_addr()?,
        })
    }

    /// Runs the accept loop on a background task
    pub fn spawn(self) -> std::io::Result<(SimHandle, JoinHandle<()>)> {
        let handle = self.handle()?;
        let task = tokio::spawn(async move { self.run().await });
        Ok((handle, task))
    }

    /// Accepts connections forever, one task per connection
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((socket, peer)) => {
                    let state = Arc::clone(&self.state);
                    tokio::spawn(async move {
                        info!("Client connected from {}", peer);
                        if let Err(e) = handle_connection(&state, socket).await {
                            warn!("Connection {} ended with error: {}", peer, e);
                        }
                        info!("Client {} disconnected", peer);
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }
}

/// Per-connection protocol state
#[derive(Default)]
struct Session {
    logged_in: bool,
    active_mcu: Option<String>,
}

enum Outcome {
    Continue,
    Close,
}

async fn handle_connection(state: &SimState, mut socket: TcpStream) -> std::io::Result<()> {
    socket.set_nodelay(true)?;
    let mut session = Session::default();
    let mut pending = Vec::new();
    let mut buffer = [0u8; 1024];

    loop {
        while let Some(bytes) = codec::take_query(&mut pending) {
            if let Outcome::Close = process_query(state, &mut session, &mut socket, &bytes).await? {
                return Ok(());
            }
        }

        if pending.len() > MAX_PENDING_BYTES {
            warn!("Discarding {} unterminated bytes", pending.len());
            pending.clear();
            socket.write_all(&codec::encode_nack(NackReason::InvalidQuery)).await?;
        }

        let n = socket.read(&mut buffer).await?;
        if n == 0 {
            return Ok(());
        }
        pending.extend_from_slice(&buffer[..n]);
    }
}

async fn process_query(
    state: &SimState,
    session: &mut Session,
    socket: &mut TcpStream,
    bytes: &[u8],
) -> std::io::Result<Outcome> {
    let query = codec::decode_query(bytes);

    if !session.logged_in {
        if query == Some(Query::Login) {
            debug!("Client logged in");
            session.logged_in = true;
            return Ok(Outcome::Continue);
        }
        warn!("Query before login, closing connection");
        socket.write_all(&codec::encode_nack(NackReason::InvalidQuery)).await?;
        return Ok(Outcome::Close);
    }

    let Some(query) = query else {
        warn!("Unrecognized query: {:?}", bytes);
        socket.write_all(&codec::encode_nack(NackReason::InvalidQuery)).await?;
        return Ok(Outcome::Continue);
    };

    let kind = match &query {
        Query::Login => {
            debug!("Repeated login ignored");
            return Ok(Outcome::Continue);
        }
        Query::SelectMcu(_) => QueryKind::SelectMcu,
        Query::FetchInfo => QueryKind::FetchInfo,
        Query::Movement(_) => QueryKind::Movement,
    };

    let injection = state.injections.lock().remove(&kind);
    match injection {
        Some(Injection::Nack(reason)) => {
            debug!("Injected NACK {} for {:?}", reason.code(), kind);
            socket.write_all(&codec::encode_nack(reason)).await?;
            return Ok(Outcome::Continue);
        }
        Some(Injection::Stall) => {
            debug!("Stalling {:?}", kind);
            return Ok(Outcome::Continue);
        }
        Some(Injection::Garbage) => {
            socket.write_all(b"!s-????-e!").await?;
            return Ok(Outcome::Continue);
        }
        Some(Injection::DeviceNack(_)) | None => {}
    }

    let response = match query {
        Query::SelectMcu(name) => select_mcu(state, session, name),
        Query::FetchInfo => fetch_info(state, session),
        Query::Movement(commands) => {
            let device_nack = match injection {
                Some(Injection::DeviceNack(reason)) => Some(reason),
                _ => None,
            };
            return movement(state, session, socket, commands, device_nack).await;
        }
        Query::Login => return Ok(Outcome::Continue),
    };

    socket.write_all(&response).await?;
    Ok(Outcome::Continue)
}

fn select_mcu(state: &SimState, session: &mut Session, name: String) -> Vec<u8> {
    let registry = state.registry.lock();
    match registry.get(&name) {
        None => {
            warn!("Unknown MCU '{}'", name);
            codec::encode_nack(NackReason::InvalidParameter)
        }
        Some(mcu) if !mcu.online => {
            warn!("MCU '{}' is offline", name);
            codec::encode_nack(NackReason::McuOffline)
        }
        Some(_) => {
            info!("MCU '{}' selected", name);
            session.active_mcu = Some(name);
            codec::encode_ack()
        }
    }
}

fn fetch_info(state: &SimState, session: &Session) -> Vec<u8> {
    let Some(name) = &session.active_mcu else {
        return codec::encode_nack(NackReason::NoActiveMcu);
    };

    let registry = state.registry.lock();
    match registry.get(name) {
        Some(mcu) if mcu.online => codec::encode_info_frame(mcu.raw_positions()),
        Some(_) => codec::encode_nack(NackReason::McuOffline),
        None => codec::encode_nack(NackReason::NoMcuInfo),
    }
}

async fn movement(
    state: &SimState,
    session: &Session,
    socket: &mut TcpStream,
    commands: Vec<ServoCommand>,
    device_nack: Option<NackReason>,
) -> std::io::Result<Outcome> {
    let Some(name) = &session.active_mcu else {
        socket.write_all(&codec::encode_nack(NackReason::NoActiveMcu)).await?;
        return Ok(Outcome::Continue);
    };

    let accepted = state
        .registry
        .lock()
        .get(name)
        .map(|mcu| mcu.accepts(&commands));
    match accepted {
        Some(true) => {}
        Some(false) => {
            warn!("Movement addresses servos MCU '{}' does not have", name);
            socket
                .write_all(&codec::encode_nack(NackReason::ServoCountMismatch))
                .await?;
            return Ok(Outcome::Continue);
        }
        None => {
            socket.write_all(&codec::encode_nack(NackReason::NoMcuInfo)).await?;
            return Ok(Outcome::Continue);
        }
    }

    debug!("Movement with {} items for '{}'", commands.len(), name);
    state.movements.lock().push(commands.clone());
    socket.write_all(&codec::encode_ack()).await?;

    tokio::time::sleep(device_delay(&state.config)).await;

    if let Some(reason) = device_nack {
        socket.write_all(&codec::encode_nack(reason)).await?;
        return Ok(Outcome::Continue);
    }

    let reply = {
        let mut registry = state.registry.lock();
        match registry.get_mut(name) {
            Some(mcu) if mcu.online => {
                mcu.apply(&commands);
                codec::encode_ack()
            }
            _ => codec::encode_nack(NackReason::ErrorContactingMcu),
        }
    };
    socket.write_all(&reply).await?;
    Ok(Outcome::Continue)
}

fn device_delay(config: &SimConfig) -> Duration {
    let jitter_ms = config.device_jitter.as_millis() as u64;
    if jitter_ms == 0 {
        return config.device_latency;
    }
    config.device_latency + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
}
