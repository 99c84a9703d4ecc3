use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    select,
    sync::mpsc,
    task::JoinSet,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::RelayConfig,
    error::{RelayError, RelayResult},
    handshake::{self, Established},
    protocol,
    registry::{ChatEvent, ConnectionId, ConnectionRecord, Registry, OUTBOUND_CAPACITY},
    transport,
};

pub struct Relay {
    listener: TcpListener,
    state: Arc<RelayState>,
}

/// How long shutdown waits for peers to receive their last lines.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const SHUTDOWN_NOTICE: &str = "server shutting down";

struct RelayState {
    config: RelayConfig,
    registry: Arc<Registry>,
    stopping: CancellationToken,
}

impl Relay {
    pub fn new(listener: TcpListener, config: RelayConfig) -> Self {
        Self {
            listener,
            state: Arc::new(RelayState {
                config,
                registry: Arc::new(Registry::new()),
                stopping: CancellationToken::new(),
            }),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.state.registry)
    }

    /// Accepts connections until `shutdown` resolves or the listener fails for good.
    ///
    /// On shutdown every connected peer is told so, and this returns only once
    /// their connections are closed or a short grace period has passed.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay { listener, state } = self;
        let mut peers = JoinSet::new();
        tokio::pin!(shutdown);

        let outcome = loop {
            select! {
                biased;
                _ = &mut shutdown => break Ok(()),
                accept_result = listener.accept() => {
                    if let Err(err) = handle_accept_result(accept_result, &state, &mut peers) {
                        break Err(err);
                    }
                }
                finished = peers.join_next(), if !peers.is_empty() => {
                    if let Some(Err(err)) = finished {
                        log_peer_task_failure(&err);
                    }
                }
            }
        };

        drop(listener);
        handle_shutdown(&state, peers).await;
        outcome
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_shutdown(state: &RelayState, mut peers: JoinSet<()>) {
    info!(connections = peers.len(), "relay shutting down");
    state.stopping.cancel();

    let drained = timeout(SHUTDOWN_GRACE, async {
        while let Some(finished) = peers.join_next().await {
            if let Err(err) = finished {
                log_peer_task_failure(&err);
            }
        }
    })
    .await;

    if drained.is_err() {
        warn!(remaining = peers.len(), "peers did not close in time; aborting them");
        peers.shutdown().await;
    }
}

fn log_peer_task_failure(err: &tokio::task::JoinError) {
    if err.is_panic() {
        error!(error = ?err, "peer task panicked");
    } else {
        debug!(error = ?err, "peer task cancelled");
    }
}

fn handle_accept_result(
    result: io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<RelayState>,
    peers: &mut JoinSet<()>,
) -> Result<()> {
    match result {
        Ok((stream, peer)) => {
            spawn_peer_handler(stream, peer, state, peers);
            Ok(())
        }
        Err(err) if is_transient_accept_error(&err) => {
            warn!(error = ?err, "failed to accept connection");
            Ok(())
        }
        Err(err) => Err(err).context("listening socket failed"),
    }
}

fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

fn spawn_peer_handler(stream: TcpStream, peer: SocketAddr, state: &Arc<RelayState>, peers: &mut JoinSet<()>) {
    let state = Arc::clone(state);
    peers.spawn(async move {
        match handle_connection(stream, peer, state).await {
            Ok(()) => {}
            Err(RelayError::Handshake(reason)) => {
                warn!(peer = %peer, %reason, "handshake failed; connection dropped");
            }
            Err(err) => {
                warn!(peer = %peer, error = %err, "connection closed with error");
            }
        }
    });
}

/// Lifecycle of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Handshaking,
    Active,
    Closing,
    Closed,
}

impl PeerState {
    pub fn can_advance_to(self, next: PeerState) -> bool {
        use PeerState::*;
        matches!(
            (self, next),
            (Connecting, Handshaking)
                | (Handshaking, Active)
                | (Handshaking, Closing)
                | (Active, Closing)
                | (Closing, Closed)
        )
    }
}

struct PeerSession {
    id: ConnectionId,
    peer: SocketAddr,
    state: PeerState,
}

impl PeerSession {
    fn new(id: ConnectionId, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            state: PeerState::Connecting,
        }
    }

    fn advance(&mut self, next: PeerState) {
        if !self.state.can_advance_to(next) {
            warn!(connection = %self.id, from = ?self.state, to = ?next, "unexpected peer state change");
        }
        debug!(connection = %self.id, peer = %self.peer, from = ?self.state, to = ?next, "peer state change");
        self.state = next;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Quit,
    EndOfStream,
    Shutdown,
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, state: Arc<RelayState>) -> RelayResult<()> {
    let mut session = PeerSession::new(state.registry.next_id(), peer);
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    session.advance(PeerState::Handshaking);
    let handshake = select! {
        established = handshake::accept(&mut reader, &mut writer, &state.config) => established,
        _ = state.stopping.cancelled() => Err(RelayError::Handshake("relay is shutting down".to_string())),
    };
    let Established {
        session_key,
        display_name,
    } = match handshake {
        Ok(established) => established,
        Err(err) => {
            session.advance(PeerState::Closing);
            session.advance(PeerState::Closed);
            return Err(err);
        }
    };

    let (sink, outbox) = mpsc::channel(OUTBOUND_CAPACITY);
    let writer_task = tokio::spawn(pump_outbound(writer, outbox));
    let record = ConnectionRecord::new(session.id, display_name, Arc::new(session_key), sink);

    state.registry.register(record.clone()).await;
    session.advance(PeerState::Active);
    info!(peer = %peer, connection = %session.id, nickname = %record.display_name(), "client joined");
    state
        .registry
        .broadcast(
            &ChatEvent::system(protocol::joined_notice(record.display_name())),
            Some(session.id),
        )
        .await;

    let outcome = select! {
        outcome = run_session(&mut reader, &record, &state.registry) => outcome,
        _ = state.stopping.cancelled() => Ok(SessionEnd::Shutdown),
    };

    session.advance(PeerState::Closing);
    match outcome {
        Ok(SessionEnd::Quit) => {
            send_last_line(&record, protocol::FAREWELL);
            teardown(&state.registry, session.id).await;
        }
        Ok(SessionEnd::Shutdown) => {
            send_last_line(&record, SHUTDOWN_NOTICE);
            state.registry.unregister(session.id).await;
        }
        Ok(SessionEnd::EndOfStream) | Err(_) => {
            teardown(&state.registry, session.id).await;
        }
    }

    // Dropping the last sender lets the writer flush what is queued and close.
    drop(record);
    drop(reader);
    if let Err(error) = writer_task.await {
        warn!(connection = %session.id, ?error, "writer task failed");
    }
    session.advance(PeerState::Closed);

    outcome.map(|_| ())
}

fn send_last_line(record: &ConnectionRecord, body: &str) {
    let line = ChatEvent::system(body).to_string();
    if let Err(error) = record.deliver(&line) {
        debug!(connection = %record.id(), %error, "closing line not delivered");
    }
}

async fn run_session<R>(reader: &mut R, record: &ConnectionRecord, registry: &Registry) -> RelayResult<SessionEnd>
where
    R: AsyncBufRead + Unpin,
{
    let session_key = record.session_key();
    loop {
        match transport::receive_encrypted_line(reader, session_key).await {
            Ok(Some(line)) => {
                if protocol::is_quit_marker(&line) {
                    return Ok(SessionEnd::Quit);
                }
                debug!(connection = %record.id(), nickname = %record.display_name(), "relaying line");
                registry
                    .broadcast(&ChatEvent::from_peer(record.display_name(), line), Some(record.id()))
                    .await;
            }
            Ok(None) => return Ok(SessionEnd::EndOfStream),
            Err(error) if error.is_line_local() => {
                warn!(connection = %record.id(), nickname = %record.display_name(), %error, "dropping undecryptable line");
            }
            Err(error) => return Err(error),
        }
    }
}

async fn pump_outbound<W>(mut writer: W, mut outbox: mpsc::Receiver<String>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = outbox.recv().await {
        if let Err(error) = transport::write_line(&mut writer, &frame).await {
            debug!(?error, "failed to deliver frame to peer");
            return;
        }
    }

    if let Err(error) = writer.shutdown().await {
        debug!(?error, "failed to shut down peer writer cleanly");
    }
}

/// Removes `id` and tells everyone else it left. Repeated calls are no-ops;
/// returns whether this call did the work.
pub async fn teardown(registry: &Registry, id: ConnectionId) -> bool {
    match registry.unregister(id).await {
        Some(record) => {
            info!(connection = %id, nickname = %record.display_name(), "client left");
            registry
                .broadcast(
                    &ChatEvent::system(protocol::left_notice(record.display_name())),
                    Some(id),
                )
                .await;
            true
        }
        None => false,
    }
}
