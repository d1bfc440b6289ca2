use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use talon_core::types::{ChannelCapabilities, InboundMessage, OutboundMessage};
use talon_protocol::channel::{ChannelRequest, ChannelResponse};
use talon_protocol::handshake::{SocketNetwork, CHANNEL_SOCK_DIR_ENV, CHANNEL_SOCK_FILE};
use talon_protocol::{read_frame, write_frame};

use crate::error::{BrokerError, Result};
use crate::net::{self, BoxedStream};
use crate::refmode::{parse_channel_ref, ChannelMode};
use crate::supervisor::{Supervisor, DEFAULT_STOP_GRACE};

/// Poll interval while waiting for a launched channel binary to create its
/// socket file.
const SOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);
/// Inbound messages buffered between the receive loop and dispatch.
const INBOX_CAPACITY: usize = 64;

type AckSlot = Arc<StdMutex<Option<oneshot::Sender<ChannelResponse>>>>;

/// Broker-side client for one channel adapter connection.
///
/// Two logical roles share the connection with a single reader: request
/// acks and an unbounded inbound-message stream. `send` installs the
/// single-slot pending ack before writing, and the receive loop routes
/// every frame either to that slot or to the inbox — an ack is never
/// consumed as an inbound message and vice versa, regardless of arrival
/// order.
pub struct ChannelClient {
    caps: ChannelCapabilities,
    writer: Mutex<WriteHalf<BoxedStream>>,
    reader: StdMutex<Option<ReadHalf<BoxedStream>>>,
    pending_ack: AckSlot,
    inbox_tx: StdMutex<Option<mpsc::Sender<InboundMessage>>>,
    inbox_rx: StdMutex<Option<mpsc::Receiver<InboundMessage>>>,
    cancel: CancellationToken,
    recv_task: Mutex<Option<JoinHandle<()>>>,
    supervisor: Mutex<Option<Supervisor>>,
    /// Keeps the socket directory alive for the child's lifetime.
    _sock_dir: Option<tempfile::TempDir>,
}

impl std::fmt::Debug for ChannelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelClient").field("caps", &self.caps).finish_non_exhaustive()
    }
}

impl ChannelClient {
    /// Resolve a configured reference and connect. Binary references are
    /// launched under the supervisor in sock-dir mode; `grpc://` dials TCP;
    /// the reserved schemes fail with `mode not yet implemented`.
    pub async fn connect(source: &str, handshake_timeout: Duration) -> Result<Self> {
        match parse_channel_ref(source) {
            ChannelMode::Binary(path) => Self::connect_binary(&path, handshake_timeout).await,
            ChannelMode::Grpc(addr) => {
                let stream = net::dial(SocketNetwork::Tcp, &addr, handshake_timeout).await?;
                Self::from_stream(stream, None, None).await
            }
            other => Err(BrokerError::ModeNotImplemented {
                scheme: other.scheme().to_string(),
            }),
        }
    }

    /// Launch a channel binary with `OPENTALON_CHANNEL_SOCK_DIR` set and
    /// poll for its socket file, racing child exit against the timeout.
    async fn connect_binary(path: &str, handshake_timeout: Duration) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("opentalon-chan-")
            .tempdir()?;
        let mut supervisor = Supervisor::new(path).env(
            CHANNEL_SOCK_DIR_ENV,
            dir.path().to_string_lossy().to_string(),
        );
        supervisor.start_silent()?;

        let sock_path = dir.path().join(CHANNEL_SOCK_FILE);
        let deadline = Instant::now() + handshake_timeout;
        while !sock_path.exists() {
            if !supervisor.running() {
                return Err(BrokerError::EarlyExit {
                    status: "channel binary exited before creating its socket".to_string(),
                });
            }
            if Instant::now() >= deadline {
                let _ = supervisor.stop(Duration::from_millis(500)).await;
                return Err(BrokerError::HandshakeTimeout {
                    timeout_ms: handshake_timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(SOCK_POLL_INTERVAL).await;
        }

        let stream = net::dial(
            SocketNetwork::Unix,
            &sock_path.to_string_lossy(),
            handshake_timeout,
        )
        .await?;
        Self::from_stream(stream, Some(supervisor), Some(dir)).await
    }

    /// Dial an address a standalone channel declared in its handshake line.
    pub async fn connect_handshake(
        network: SocketNetwork,
        address: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let stream = net::dial(network, address, timeout).await?;
        Self::from_stream(stream, None, None).await
    }

    /// Pre-start capabilities exchange, then hold the split halves until
    /// `start` spawns the receive loop.
    async fn from_stream(
        mut stream: BoxedStream,
        supervisor: Option<Supervisor>,
        sock_dir: Option<tempfile::TempDir>,
    ) -> Result<Self> {
        write_frame(&mut stream, &ChannelRequest::capabilities()).await?;
        let resp: ChannelResponse = read_frame(&mut stream).await?;
        if let Some(err) = resp.error {
            return Err(BrokerError::SendRejected(err));
        }
        let caps = resp.caps.ok_or(BrokerError::EmptyCapabilities)?;
        debug!(channel = %caps.id, threads = caps.threads, "channel capabilities fetched");

        let (read_half, write_half) = tokio::io::split(stream);
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);

        Ok(Self {
            caps,
            writer: Mutex::new(write_half),
            reader: StdMutex::new(Some(read_half)),
            pending_ack: Arc::new(StdMutex::new(None)),
            inbox_tx: StdMutex::new(Some(inbox_tx)),
            inbox_rx: StdMutex::new(Some(inbox_rx)),
            cancel: CancellationToken::new(),
            recv_task: Mutex::new(None),
            supervisor: Mutex::new(supervisor),
            _sock_dir: sock_dir,
        })
    }

    pub fn id(&self) -> &str {
        &self.caps.id
    }

    pub fn capabilities(&self) -> &ChannelCapabilities {
        &self.caps
    }

    /// Tell the channel to begin streaming and spawn the receive loop — the
    /// connection's only reader from here on.
    pub async fn start(&self) -> Result<()> {
        let reader = self
            .reader
            .lock()
            .unwrap()
            .take()
            .ok_or(BrokerError::AlreadyStarted)?;
        let inbox_tx = self
            .inbox_tx
            .lock()
            .unwrap()
            .take()
            .ok_or(BrokerError::AlreadyStarted)?;

        {
            let mut writer = self.writer.lock().await;
            write_frame(&mut *writer, &ChannelRequest::start()).await?;
        }

        let handle = tokio::spawn(receive_loop(
            self.caps.id.clone(),
            reader,
            Arc::clone(&self.pending_ack),
            inbox_tx,
            self.cancel.clone(),
        ));
        *self.recv_task.lock().await = Some(handle);
        Ok(())
    }

    /// Take the inbound message stream. Yields `None` after the first call.
    pub fn take_inbox(&self) -> Option<mpsc::Receiver<InboundMessage>> {
        self.inbox_rx.lock().unwrap().take()
    }

    /// Deliver one outbound message and wait for the channel's ack.
    ///
    /// Only one ack slot exists, so a second in-flight `send` is refused
    /// rather than queued.
    pub async fn send(&self, msg: OutboundMessage) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        {
            let mut slot = self.pending_ack.lock().unwrap();
            if slot.is_some() {
                return Err(BrokerError::ConcurrentSend);
            }
            *slot = Some(tx);
        }

        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = write_frame(&mut *writer, &ChannelRequest::send(msg)).await {
                self.pending_ack.lock().unwrap().take();
                return Err(e.into());
            }
        }

        tokio::select! {
            ack = rx => match ack {
                Ok(resp) => match resp.error {
                    Some(err) => Err(BrokerError::SendRejected(err)),
                    None => Ok(()),
                },
                Err(_) => Err(BrokerError::ConnectionClosed),
            },
            _ = self.cancel.cancelled() => {
                self.pending_ack.lock().unwrap().take();
                Err(BrokerError::Cancelled)
            }
        }
    }

    /// Cancel, close the connection to unblock the reader, wait for the
    /// receive loop, and stop the supervised child if there is one.
    pub async fn stop(&self) {
        self.cancel.cancel();
        {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        }
        if let Some(handle) = self.recv_task.lock().await.take() {
            let _ = handle.await;
        }
        if let Some(mut supervisor) = self.supervisor.lock().await.take() {
            let _ = supervisor.stop(DEFAULT_STOP_GRACE).await;
        }
        debug!(channel = %self.caps.id, "channel stopped");
    }
}

/// The single reader. Push frames (`msg` set) go to the inbox even while an
/// ack is pending; bare frames resolve the pending ack when one is armed
/// and are dropped otherwise.
async fn receive_loop(
    id: String,
    mut reader: ReadHalf<BoxedStream>,
    pending_ack: AckSlot,
    inbox: mpsc::Sender<InboundMessage>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = read_frame::<_, ChannelResponse>(&mut reader) => match frame {
                Ok(resp) => {
                    if let Some(msg) = resp.msg {
                        if inbox.send(msg).await.is_err() {
                            break;
                        }
                    } else {
                        let waiter = pending_ack.lock().unwrap().take();
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(resp);
                            }
                            None => trace!(channel = %id, "unsolicited ack dropped"),
                        }
                    }
                }
                Err(e) => {
                    warn!(channel = %id, error = %e, "channel read ended");
                    break;
                }
            }
        }
    }
    // Dropping the inbox sender tears the inbox down; a waiter blocked on a
    // pending ack observes the oneshot drop as ConnectionClosed.
}
