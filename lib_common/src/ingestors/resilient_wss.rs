//! # Resilient WebSocket Client
//!
//! Keeps at most one live push-channel connection per handle and reconnects
//! with exponential backoff whenever it drops. The decisions live in the
//! [`ReconnectMachine`]; this module is the async driver that performs its
//! effects against a [`Connector`] and the owner's [`StreamHandler`].
//!
//! Inbound text and binary frames are parsed as JSON when possible and
//! delivered raw otherwise, one at a time and in arrival order.
//!
//! ```rust,ignore
//! let handle = ResilientWs::new("wss://farm.example/ws/pens?token=...")
//!     .spawn(MyHandler::default());
//! // ...
//! handle.close(); // no callback runs after this returns
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::stream::{BoxStream, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::reconnect::{ConnectionState, Effect, ReconnectMachine, ReconnectPolicy, StreamEvent};

/// Failures of a single connection. They never reach the owner; the
/// connection is simply closed and retried.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Handshake or socket failure reported by tungstenite.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The stream URL could not be built.
    #[error("invalid stream URL: {0}")]
    Url(#[from] url::ParseError),

    /// Any other transport failure.
    #[error("transport error: {0}")]
    Transport(String),
}

/// A data frame as read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A UTF-8 text frame.
    Text(String),
    /// A binary frame.
    Binary(Vec<u8>),
}

/// What the owner receives for every inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamPayload {
    /// The frame parsed as JSON.
    Json(Value),
    /// The frame did not parse; its content is passed on unchanged.
    Raw(String),
}

impl StreamPayload {
    /// Parses a frame, falling back to the raw content.
    pub fn from_frame(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Self::from_text(text),
            Frame::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => Self::from_text(text),
                Err(e) => Self::Raw(String::from_utf8_lossy(e.as_bytes()).into_owned()),
            },
        }
    }

    fn from_text(text: String) -> Self {
        match serde_json::from_str(&text) {
            Ok(value) => Self::Json(value),
            Err(_) => Self::Raw(text),
        }
    }

    /// The parsed value, if the frame was JSON.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Raw(_) => None,
        }
    }
}

/// The frames of one established connection. The stream ending means the
/// connection closed; dropping it closes the socket.
pub type FrameStream = BoxStream<'static, Result<Frame, StreamError>>;

/// Opens connections. The production implementation is [`TungsteniteConnector`];
/// tests substitute scripted ones.
pub trait Connector: Send + Sync + 'static {
    /// Establishes one connection to `url`.
    fn connect(&self, url: &str)
        -> impl Future<Output = Result<FrameStream, StreamError>> + Send;
}

/// Connects with `tokio-tungstenite`, TLS included.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<FrameStream, StreamError> {
        let (ws_stream, _) = connect_async(url).await?;

        let frames = ws_stream.filter_map(|msg| async move {
            match msg {
                Ok(WsMessage::Text(text)) => Some(Ok(Frame::Text(text.as_str().to_owned()))),
                Ok(WsMessage::Binary(bin)) => Some(Ok(Frame::Binary(bin.to_vec()))),
                // Ping/Pong are answered by tungstenite; Close ends the stream.
                Ok(_) => None,
                Err(e) => Some(Err(StreamError::from(e))),
            }
        });

        Ok(frames.boxed())
    }
}

/// Callbacks of the owner of a stream.
///
/// Callbacks run on the driver task, one at a time. They must not call
/// [`StreamHandle::close`] on their own handle.
pub trait StreamHandler: Send + 'static {
    /// Invoked for every inbound frame while the connection is open.
    fn on_message(&mut self, payload: StreamPayload);

    /// Invoked each time a connection is established.
    fn on_open(&mut self) {}

    /// Invoked each time a connection is lost, before the reconnect is scheduled.
    fn on_close(&mut self) {}
}

type HandlerSlot = Arc<Mutex<Option<Box<dyn StreamHandler>>>>;

/// Builder for a resilient stream.
pub struct ResilientWs<C = TungsteniteConnector> {
    url: String,
    policy: ReconnectPolicy,
    connector: C,
}

impl ResilientWs {
    /// A stream to `url` with the default policy and the tungstenite connector.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            policy: ReconnectPolicy::default(),
            connector: TungsteniteConnector,
        }
    }
}

impl<C: Connector> ResilientWs<C> {
    /// Overrides the reconnect schedule.
    pub fn policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Swaps the connector.
    pub fn connector<D: Connector>(self, connector: D) -> ResilientWs<D> {
        ResilientWs {
            url: self.url,
            policy: self.policy,
            connector,
        }
    }

    /// Starts connecting on a background task and returns the owning handle.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<H: StreamHandler>(self, handler: H) -> StreamHandle {
        let cancel = CancellationToken::new();
        let handler: Box<dyn StreamHandler> = Box::new(handler);
        let slot: HandlerSlot = Arc::new(Mutex::new(Some(handler)));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (connect_tx, connect_rx) = mpsc::unbounded_channel();

        tokio::spawn(drive(
            self.url,
            self.connector,
            self.policy,
            Arc::clone(&slot),
            cancel.clone(),
            state_tx,
            connect_rx,
        ));

        StreamHandle {
            cancel,
            handler: slot,
            state: state_rx,
            connect: connect_tx,
        }
    }
}

/// Owning handle of a running stream. Dropping it closes the stream.
pub struct StreamHandle {
    cancel: CancellationToken,
    handler: HandlerSlot,
    state: watch::Receiver<ConnectionState>,
    connect: mpsc::UnboundedSender<()>,
}

impl StreamHandle {
    /// Asks for a connection now.
    ///
    /// A no-op while a connection is open or being opened, and after
    /// `close()`. While waiting out a reconnect delay it connects at once.
    /// The stream already connects on `spawn`.
    pub fn connect(&self) {
        let _ = self.connect.send(());
    }

    /// Disposes the stream: cancels any pending reconnect and closes the
    /// active connection. Once this returns no callback will run again.
    pub fn close(&self) {
        self.cancel.cancel();
        // Taking the handler waits out a callback already in progress.
        let mut slot = self.handler.lock().unwrap_or_else(PoisonError::into_inner);
        slot.take();
    }

    /// Whether `close()` has been called.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The driver's current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// A receiver notified on every state change.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.close();
    }
}

fn notify(slot: &HandlerSlot, callback: impl FnOnce(&mut dyn StreamHandler)) {
    let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(handler) = guard.as_mut() {
        callback(handler.as_mut());
    }
}

/// The stream URL without its query string, which carries the token.
fn redacted(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.to_string()
        }
        Err(_) => "<invalid url>".to_string(),
    }
}

async fn drive<C: Connector>(
    url: String,
    connector: C,
    policy: ReconnectPolicy,
    handler: HandlerSlot,
    cancel: CancellationToken,
    state_tx: watch::Sender<ConnectionState>,
    mut connect_requests: mpsc::UnboundedReceiver<()>,
) {
    let target = redacted(&url);
    let mut machine = ReconnectMachine::new(policy);
    let mut connection: Option<FrameStream> = None;
    let mut pending: VecDeque<Effect<StreamPayload>> = VecDeque::new();
    let mut event = Some(StreamEvent::ConnectRequested);

    loop {
        if let Some(ev) = event.take() {
            pending.extend(machine.handle(ev));
            let state = machine.state();
            if state_tx.send_replace(state) != state {
                log::debug!("{}: {:?}", target, state);
            }
        }

        event = match pending.pop_front() {
            Some(Effect::OpenConnection) => {
                log::info!("Connecting to {}", target);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Some(StreamEvent::Disposed),
                    result = connector.connect(&url) => {
                        // Requests made during the attempt are answered by it.
                        while connect_requests.try_recv().is_ok() {}
                        match result {
                            Ok(frames) => {
                                log::info!("Connected to {}", target);
                                connection = Some(frames);
                                Some(StreamEvent::Opened)
                            }
                            Err(e) => {
                                log::warn!("Failed to connect to {}: {}", target, e);
                                Some(StreamEvent::Errored)
                            }
                        }
                    }
                }
            }
            Some(Effect::CloseConnection) => {
                // Dropping the stream closes the socket, which reports a drop
                // like any other close.
                connection = None;
                Some(StreamEvent::Dropped)
            }
            Some(Effect::ScheduleReconnect(delay)) => {
                log::info!("Reconnecting to {} in {:?}", target, delay);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Some(StreamEvent::Disposed),
                    Some(()) = connect_requests.recv() => Some(StreamEvent::ConnectRequested),
                    _ = sleep(delay) => Some(StreamEvent::ReconnectTimerFired),
                }
            }
            // The timer only exists inside the select above.
            Some(Effect::CancelReconnect) => None,
            Some(Effect::NotifyOpen) => {
                notify(&handler, |h| h.on_open());
                None
            }
            Some(Effect::NotifyClose) => {
                notify(&handler, |h| h.on_close());
                None
            }
            Some(Effect::Deliver(payload)) => {
                notify(&handler, |h| h.on_message(payload));
                None
            }
            None => {
                let Some(frames) = connection.as_mut() else {
                    break;
                };
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => StreamEvent::Disposed,
                    Some(()) = connect_requests.recv() => StreamEvent::ConnectRequested,
                    frame = frames.next() => match frame {
                        Some(Ok(frame)) => StreamEvent::Message(StreamPayload::from_frame(frame)),
                        Some(Err(e)) => {
                            log::warn!("Stream error on {}: {}", target, e);
                            StreamEvent::Errored
                        }
                        None => {
                            log::warn!("Stream {} closed by remote host.", target);
                            StreamEvent::Dropped
                        }
                    },
                };
                if next == StreamEvent::Dropped {
                    connection = None;
                }
                Some(next)
            }
        };
    }

    log::debug!("{}: driver stopped", target);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    type FrameTx = mpsc::UnboundedSender<Result<Frame, StreamError>>;

    enum Plan {
        Refuse,
        Accept(mpsc::UnboundedReceiver<Result<Frame, StreamError>>),
    }

    #[derive(Default)]
    struct ScriptedConnector {
        plans: Mutex<VecDeque<Plan>>,
        connects: Arc<Mutex<Vec<Instant>>>,
    }

    impl ScriptedConnector {
        fn with_plans(plans: Vec<Plan>) -> Self {
            Self {
                plans: Mutex::new(plans.into()),
                ..Self::default()
            }
        }
    }

    impl Connector for ScriptedConnector {
        async fn connect(&self, _url: &str) -> Result<FrameStream, StreamError> {
            self.connects.lock().unwrap().push(Instant::now());
            let plan = self.plans.lock().unwrap().pop_front().unwrap_or(Plan::Refuse);
            match plan {
                Plan::Refuse => Err(StreamError::Transport("connection refused".into())),
                Plan::Accept(rx) => Ok(futures_util::stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|frame| (frame, rx))
                })
                .boxed()),
            }
        }
    }

    fn accept() -> (FrameTx, Plan) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Plan::Accept(rx))
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    impl StreamHandler for Recorder {
        fn on_message(&mut self, payload: StreamPayload) {
            let entry = match payload {
                StreamPayload::Json(v) => format!("json:{}", v),
                StreamPayload::Raw(s) => format!("raw:{}", s),
            };
            self.0.lock().unwrap().push(entry);
        }

        fn on_open(&mut self) {
            self.0.lock().unwrap().push("open".into());
        }

        fn on_close(&mut self) {
            self.0.lock().unwrap().push("close".into());
        }
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..10_000 {
            if done() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn assert_gap(from: Instant, to: Instant, expected_ms: u64) {
        let gap = to - from;
        let expected = Duration::from_millis(expected_ms);
        assert!(
            gap >= expected && gap < expected + Duration::from_millis(20),
            "gap {:?}, expected {:?}",
            gap,
            expected
        );
    }

    fn spawn(connector: ScriptedConnector, recorder: &Recorder) -> StreamHandle {
        ResilientWs::new("ws://farm.test/ws/pens/3?token=secret")
            .connector(connector)
            .spawn(recorder.clone())
    }

    #[test]
    fn test_payload_parsing_falls_back_to_raw() {
        assert_eq!(
            StreamPayload::from_frame(Frame::Text(r#"{"activity":5}"#.into())),
            StreamPayload::Json(json!({"activity": 5}))
        );
        assert_eq!(
            StreamPayload::from_frame(Frame::Text("hello".into())),
            StreamPayload::Raw("hello".into())
        );
        assert_eq!(
            StreamPayload::from_frame(Frame::Binary(b"[1,2]".to_vec())),
            StreamPayload::Json(json!([1, 2]))
        );
        assert!(matches!(
            StreamPayload::from_frame(Frame::Binary(vec![0xff, 0xfe])),
            StreamPayload::Raw(_)
        ));
    }

    #[test]
    fn test_redacted_drops_token() {
        assert_eq!(
            redacted("wss://farm.test/ws/pens?token=secret"),
            "wss://farm.test/ws/pens"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_connections_back_off_exponentially() {
        let connector = ScriptedConnector::default();
        let connects = Arc::clone(&connector.connects);
        let recorder = Recorder::default();
        let handle = spawn(connector, &recorder);

        wait_until(|| connects.lock().unwrap().len() >= 4).await;
        handle.close();

        let times = connects.lock().unwrap().clone();
        assert_gap(times[0], times[1], 1_000);
        assert_gap(times[1], times[2], 2_000);
        assert_gap(times[2], times[3], 4_000);
        // A refused connect still reports a close, and never an open.
        assert!(recorder.events().iter().all(|e| e == "close"));
        assert!(recorder.events().len() >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_delivered_in_order_and_backoff_resets_after_open() {
        let (tx1, plan1) = accept();
        let (tx2, plan2) = accept();
        let (_tx3, plan3) = accept();
        let connector = ScriptedConnector::with_plans(vec![plan1, plan2, plan3]);
        let connects = Arc::clone(&connector.connects);
        let recorder = Recorder::default();
        let handle = spawn(connector, &recorder);

        wait_until(|| handle.state() == ConnectionState::Open).await;
        tx1.send(Ok(Frame::Text(r#"{"activity":1}"#.into()))).unwrap();
        tx1.send(Ok(Frame::Text("garbage".into()))).unwrap();
        wait_until(|| recorder.events().len() == 3).await;

        let first_drop = Instant::now();
        drop(tx1);
        wait_until(|| connects.lock().unwrap().len() == 2).await;
        assert_gap(first_drop, connects.lock().unwrap()[1], 1_000);

        wait_until(|| handle.state() == ConnectionState::Open).await;
        let second_drop = Instant::now();
        tx2.send(Err(StreamError::Transport("reset".into()))).unwrap();
        wait_until(|| connects.lock().unwrap().len() == 3).await;
        assert_gap(second_drop, connects.lock().unwrap()[2], 1_000);

        wait_until(|| handle.state() == ConnectionState::Open).await;
        assert_eq!(
            recorder.events(),
            vec![
                "open",
                r#"json:{"activity":1}"#,
                "raw:garbage",
                "close",
                "open",
                "close",
                "open"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_callbacks_after_close() {
        let (tx, plan) = accept();
        let connector = ScriptedConnector::with_plans(vec![plan]);
        let connects = Arc::clone(&connector.connects);
        let recorder = Recorder::default();
        let handle = spawn(connector, &recorder);

        wait_until(|| handle.state() == ConnectionState::Open).await;
        handle.close();
        assert!(handle.is_closed());

        // Whatever the transport does now must not reach the handler.
        let _ = tx.send(Ok(Frame::Text(r#"{"activity":9}"#.into())));
        drop(tx);
        sleep(Duration::from_secs(120)).await;

        assert_eq!(recorder.events(), vec!["open"]);
        assert_eq!(handle.state(), ConnectionState::Closed);
        assert_eq!(connects.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_pending_reconnect() {
        let connector = ScriptedConnector::default();
        let connects = Arc::clone(&connector.connects);
        let recorder = Recorder::default();
        let handle = spawn(connector, &recorder);

        wait_until(|| handle.state() == ConnectionState::Reconnecting).await;
        drop(handle);
        sleep(Duration::from_secs(120)).await;

        assert_eq!(connects.lock().unwrap().len(), 1);
        assert_eq!(recorder.events(), vec!["close"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_skips_the_reconnect_delay() {
        let (_tx, plan) = accept();
        let connector = ScriptedConnector::with_plans(vec![Plan::Refuse, plan]);
        let connects = Arc::clone(&connector.connects);
        let recorder = Recorder::default();
        let handle = spawn(connector, &recorder);

        wait_until(|| handle.state() == ConnectionState::Reconnecting).await;
        let requested = Instant::now();
        handle.connect();
        wait_until(|| handle.state() == ConnectionState::Open).await;

        let times = connects.lock().unwrap().clone();
        assert_eq!(times.len(), 2);
        // Well under the 1s reconnect delay.
        assert!(times[1] - requested < Duration::from_millis(50));
        assert_eq!(recorder.events(), vec!["close", "open"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_a_no_op_when_open_or_closed() {
        let (_tx, plan) = accept();
        let connector = ScriptedConnector::with_plans(vec![plan]);
        let connects = Arc::clone(&connector.connects);
        let recorder = Recorder::default();
        let handle = spawn(connector, &recorder);

        wait_until(|| handle.state() == ConnectionState::Open).await;
        handle.connect();
        handle.connect();
        sleep(Duration::from_secs(5)).await;
        assert_eq!(connects.lock().unwrap().len(), 1);
        assert_eq!(handle.state(), ConnectionState::Open);

        handle.close();
        handle.connect();
        sleep(Duration::from_secs(5)).await;
        assert_eq!(connects.lock().unwrap().len(), 1);
        assert_eq!(handle.state(), ConnectionState::Closed);
        assert_eq!(recorder.events(), vec!["open"]);
    }
}
