use enum_primitive_derive::Primitive;
use futures_util::StreamExt;
use num_traits::FromPrimitive;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use crate::radar::RadarError;
use crate::radar::spoke::{Spoke, decode_radar_message};
use crate::util::PrintableSpoke;

pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(5000);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// Spokes waiting for the writer; a full queue slows down reading the socket
const SPOKE_QUEUE_LENGTH: usize = 1024;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Primitive, Serialize)]
pub enum ReceiverState {
    Idle = 0,
    Connecting = 1,
    Streaming = 2,
    Closing = 3,
    Faulted = 4,
}

impl fmt::Display for ReceiverState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiverStatistics {
    pub state: ReceiverState,
    pub connected: bool,
    pub spokes_received: u64,
    pub bytes_received: u64,
    pub messages_received: u64,
    pub decode_errors: u64,
    pub connection_attempts: u64,
    pub consecutive_failures: u64,
}

struct ReceiverShared {
    key: String,
    state: AtomicU8,
    connected: AtomicBool,
    should_run: AtomicBool,
    spokes_received: AtomicU64,
    bytes_received: AtomicU64,
    messages_received: AtomicU64,
    decode_errors: AtomicU64,
    connection_attempts: AtomicU64,
    consecutive_failures: AtomicU64,
}

impl ReceiverShared {
    fn new(key: &str) -> Self {
        ReceiverShared {
            key: key.to_owned(),
            state: AtomicU8::new(ReceiverState::Idle as u8),
            connected: AtomicBool::new(false),
            should_run: AtomicBool::new(false),
            spokes_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            connection_attempts: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
        }
    }

    fn state(&self) -> ReceiverState {
        ReceiverState::from_u8(self.state.load(Ordering::Acquire)).unwrap_or(ReceiverState::Idle)
    }

    fn set_state(&self, state: ReceiverState) {
        let old = self.state.swap(state as u8, Ordering::AcqRel);
        if old != state as u8 {
            log::debug!(
                "{}: spoke stream {} -> {}",
                self.key,
                ReceiverState::from_u8(old).unwrap_or(ReceiverState::Idle),
                state
            );
        }
    }

    fn on_open(&self) {
        self.connected.store(true, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.set_state(ReceiverState::Streaming);
    }

    fn on_lost(&self, state: ReceiverState) {
        self.connected.store(false, Ordering::Release);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        self.set_state(state);
    }
}

///
/// Keeps a websocket to the spoke stream of one radar open for as long as it
/// runs. Every binary frame is decoded into spokes which are handed, in
/// order, to a single writer task that calls the `on_spoke` callback.
///
/// Any close or error leads to a new attempt after `reconnect_interval`;
/// only `stop()` ends it. Must be started from within a tokio runtime.
///
pub struct SpokeReceiver {
    url: String,
    reconnect_interval: Duration,
    idle_timeout: Option<Duration>,
    shared: Arc<ReceiverShared>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SpokeReceiver {
    pub fn new(key: &str, url: &str, reconnect_interval: Duration) -> Self {
        SpokeReceiver {
            url: url.to_owned(),
            reconnect_interval,
            idle_timeout: None,
            shared: Arc::new(ReceiverShared::new(key)),
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// Treat a connection that is silent for this long as dead.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = Some(idle_timeout);
        self
    }

    pub fn key(&self) -> &str {
        &self.shared.key
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn start<F>(&mut self, on_spoke: F)
    where
        F: FnMut(Spoke) + Send + 'static,
    {
        if !self.tasks.is_empty() {
            log::debug!("{}: spoke receiver already running", self.shared.key);
            return;
        }
        if self.cancel.is_cancelled() {
            log::warn!("{}: spoke receiver was stopped, not restarting", self.shared.key);
            return;
        }

        self.shared.should_run.store(true, Ordering::Release);
        self.shared.set_state(ReceiverState::Connecting);

        let (spoke_tx, spoke_rx) = mpsc::channel(SPOKE_QUEUE_LENGTH);

        let writer = tokio::spawn(write_loop(self.cancel.clone(), spoke_rx, on_spoke));

        let stream = StreamLoop {
            shared: self.shared.clone(),
            url: self.url.clone(),
            reconnect_interval: self.reconnect_interval,
            idle_timeout: self.idle_timeout,
            cancel: self.cancel.clone(),
            spoke_tx,
        };
        let reader = tokio::spawn(stream.run());

        self.tasks.push(reader);
        self.tasks.push(writer);
    }

    ///
    /// Close the stream and wait for both tasks to finish. Once this returns
    /// the callback will not be called again. Calling it twice is harmless.
    ///
    pub async fn stop(&mut self) {
        self.shared.should_run.store(false, Ordering::Release);
        self.cancel.cancel();

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                log::warn!("{}: receiver task ended abnormally: {}", self.shared.key, e);
            }
        }
        self.shared.connected.store(false, Ordering::Release);
        self.shared.set_state(ReceiverState::Idle);
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty() && self.shared.should_run.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ReceiverState {
        self.shared.state()
    }

    pub fn spokes_received(&self) -> u64 {
        self.shared.spokes_received.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.shared.bytes_received.load(Ordering::Relaxed)
    }

    pub fn statistics(&self) -> ReceiverStatistics {
        let s = &self.shared;
        ReceiverStatistics {
            state: s.state(),
            connected: s.connected.load(Ordering::Acquire),
            spokes_received: s.spokes_received.load(Ordering::Relaxed),
            bytes_received: s.bytes_received.load(Ordering::Relaxed),
            messages_received: s.messages_received.load(Ordering::Relaxed),
            decode_errors: s.decode_errors.load(Ordering::Relaxed),
            connection_attempts: s.connection_attempts.load(Ordering::Relaxed),
            consecutive_failures: s.consecutive_failures.load(Ordering::Relaxed),
        }
    }
}

impl Drop for SpokeReceiver {
    fn drop(&mut self) {
        // Tasks notice this at their next await; only stop() waits for them.
        self.cancel.cancel();
    }
}

impl fmt::Debug for SpokeReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SpokeReceiver {{ key: {}, url: {}, state: {} }}",
            self.shared.key,
            self.url,
            self.state()
        )
    }
}

async fn write_loop<F>(cancel: CancellationToken, mut spoke_rx: mpsc::Receiver<Spoke>, mut on_spoke: F)
where
    F: FnMut(Spoke) + Send + 'static,
{
    loop {
        tokio::select! { biased;
            _ = cancel.cancelled() => {
                break;
            },
            r = spoke_rx.recv() => {
                match r {
                    Some(spoke) => on_spoke(spoke),
                    None => break,
                }
            }
        }
    }
}

struct StreamLoop {
    shared: Arc<ReceiverShared>,
    url: String,
    reconnect_interval: Duration,
    idle_timeout: Option<Duration>,
    cancel: CancellationToken,
    spoke_tx: mpsc::Sender<Spoke>,
}

impl StreamLoop {
    async fn run(self) {
        let key = self.shared.key.clone();
        log::debug!("{}: spoke stream to {} (re)start", key, self.url);

        loop {
            self.shared.set_state(ReceiverState::Connecting);

            match self.connect().await {
                Ok(ws) => {
                    self.shared.on_open();
                    log::info!("{}: receiving spokes from {}", key, self.url);

                    match self.receive_loop(ws).await {
                        Err(RadarError::Shutdown) => {
                            log::debug!("{}: receive_loop shutdown", key);
                            break;
                        }
                        Ok(()) => {
                            log::info!("{}: spoke stream closed by server", key);
                            self.shared.on_lost(ReceiverState::Closing);
                        }
                        Err(e) => {
                            log::warn!("{}: spoke stream lost: {}", key, e);
                            self.shared.on_lost(ReceiverState::Faulted);
                        }
                    }
                }
                Err(RadarError::Shutdown) => {
                    break;
                }
                Err(e) => {
                    log::debug!("{}: cannot connect to {}: {}", key, self.url, e);
                    self.shared.on_lost(ReceiverState::Faulted);
                }
            }

            log::trace!(
                "{}: reconnect in {:?} (failure #{})",
                key,
                self.reconnect_interval,
                self.shared.consecutive_failures.load(Ordering::Relaxed)
            );
            tokio::select! { biased;
                _ = self.cancel.cancelled() => {
                    break;
                },
                _ = sleep(self.reconnect_interval) => {}
            }
            if !self.shared.should_run.load(Ordering::Acquire) {
                break;
            }
        }

        self.shared.connected.store(false, Ordering::Release);
        self.shared.set_state(ReceiverState::Idle);
    }

    async fn connect(&self) -> Result<WsStream, RadarError> {
        self.shared.connection_attempts.fetch_add(1, Ordering::Relaxed);

        tokio::select! { biased;
            _ = self.cancel.cancelled() => Err(RadarError::Shutdown),
            r = timeout(CONNECT_TIMEOUT, connect_async(self.url.as_str())) => match r {
                Ok(Ok((ws, _response))) => Ok(ws),
                Ok(Err(e)) => Err(RadarError::WebSocket(e)),
                Err(_) => Err(RadarError::Timeout),
            }
        }
    }

    async fn next_message(
        &self,
        ws: &mut WsStream,
    ) -> Result<Option<Result<Message, tokio_tungstenite::tungstenite::Error>>, RadarError> {
        match self.idle_timeout {
            Some(idle) => timeout(idle, ws.next())
                .await
                .map_err(|_| RadarError::Timeout),
            None => Ok(ws.next().await),
        }
    }

    // Ok(()) means the server closed the stream
    async fn receive_loop(&self, mut ws: WsStream) -> Result<(), RadarError> {
        loop {
            let next = tokio::select! { biased;
                _ = self.cancel.cancelled() => None,
                r = self.next_message(&mut ws) => Some(r),
            };

            let Some(next) = next else {
                self.shared.set_state(ReceiverState::Closing);
                if let Err(e) = ws.close(None).await {
                    log::trace!("{}: close: {}", self.shared.key, e);
                }
                return Err(RadarError::Shutdown);
            };

            match next? {
                Some(Ok(Message::Binary(data))) => {
                    self.process_message(&data).await?;
                }
                Some(Ok(Message::Close(frame))) => {
                    log::debug!("{}: close frame {:?}", self.shared.key, frame);
                    return Ok(());
                }
                Some(Ok(_)) => {
                    // Text, ping and pong frames carry no spokes
                }
                Some(Err(e)) => {
                    return Err(RadarError::WebSocket(e));
                }
                None => {
                    return Ok(());
                }
            }
        }
    }

    async fn process_message(&self, data: &[u8]) -> Result<(), RadarError> {
        let shared = &self.shared;
        shared.messages_received.fetch_add(1, Ordering::Relaxed);
        shared
            .bytes_received
            .fetch_add(data.len() as u64, Ordering::Relaxed);

        let spokes = match decode_radar_message(data) {
            Ok(spokes) => spokes,
            Err(e) => {
                shared.decode_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "{}: dropping message of {} bytes: {}",
                    shared.key,
                    data.len(),
                    e
                );
                return Ok(());
            }
        };

        for spoke in spokes {
            log::trace!(
                "{}: spoke {} range {} {}",
                shared.key,
                spoke.angle,
                spoke.range_meters,
                PrintableSpoke::new(&spoke.samples)
            );
            if self.spoke_tx.send(spoke).await.is_err() {
                // Writer is gone, so we are stopping
                return Err(RadarError::Shutdown);
            }
            shared.spokes_received.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}
