//! The channel itself: a hot multicast event stream over a transport that is
//! torn down, watched for failure, and rebuilt behind the scenes.
//!
//! A single controller task owns the live transport connection exclusively.
//! Everything else talks to it through channels: inbound frames fan out over
//! a broadcast channel, connectivity transitions over a second one, and the
//! lifecycle state (including the terminal event) rides a watch channel so
//! that late subscribers still observe how the channel ended.

use std::pin::pin;
use std::sync::Arc;
use std::time::Instant;

use async_stream::stream;
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;
use futures::future::ready;
use futures::{Stream, StreamExt as _};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::mpsc::error::TryRecvError as MpscTryRecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::Result;
use crate::codec;
use crate::config::Config;
use crate::error::Error;
use crate::transport::{Connection, Frame, Transport, WsTransport};

/// Broadcast capacity for inbound frames.
const EVENT_CAPACITY: usize = 1024;
/// Broadcast capacity for connectivity transitions.
const STATUS_CAPACITY: usize = 16;

/// Lifecycle state of a [`Channel`].
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum ChannelState {
    /// A connect attempt is in flight
    Connecting,
    /// Transport is live
    Connected {
        /// When the connection was established
        since: Instant,
    },
    /// Waiting out the retry interval before the numbered attempt
    Retrying {
        /// Reconnect attempt about to be made, starting at 1
        attempt: u32,
    },
    /// Retries exhausted; the channel completed cleanly and cannot be reused
    Closed,
    /// A fatal transport error terminated the channel
    Failed(Error),
}

impl ChannelState {
    /// Check whether a transport connection is currently live.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    /// Check whether the channel has permanently terminated.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed(_))
    }
}

/// A self-reconnecting bidirectional message channel.
///
/// Presents one continuous multicast event stream while the underlying
/// transport connection is transparently rebuilt on disconnect, with a
/// bounded, fixed-interval retry budget. Once the budget is exhausted the
/// channel completes; a transport error on a live connection terminates it
/// with that error. Either way termination is permanent.
///
/// Cloning is cheap and every clone drives the same connection. The
/// controller shuts down once every handle and every derived stream has been
/// dropped.
///
/// # Example
///
/// ```no_run
/// use futures::StreamExt as _;
/// use ws_channel::Channel;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let channel = Channel::connect("wss://example.com/socket")?;
///     channel.emit("join", &"lobby")?;
///
///     let mut chat = Box::pin(channel.on("chat"));
///     while let Some(data) = chat.next().await {
///         println!("chat: {data}");
///     }
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

#[derive(Debug)]
struct ChannelInner {
    /// Configuration the channel was built with
    config: Config,
    /// Outbound frames for the controller to transmit
    outbound_tx: mpsc::UnboundedSender<Frame>,
    /// Fan-out for inbound frames
    events_tx: broadcast::Sender<Frame>,
    /// Fan-out for connectivity transitions
    status_tx: broadcast::Sender<bool>,
    /// Lifecycle state published by the controller
    state_rx: watch::Receiver<ChannelState>,
}

impl Channel {
    /// Connect to the given address with default configuration.
    pub fn connect<S: Into<String>>(address: S) -> Result<Self> {
        Self::with_config(Config::new(address))
    }

    /// Connect with the given configuration over the default WebSocket
    /// transport.
    pub fn with_config(config: Config) -> Result<Self> {
        Self::with_transport(config, Arc::new(WsTransport))
    }

    /// Connect over an injected transport implementation.
    ///
    /// The controller task starts immediately and makes its first connect
    /// attempt right away.
    pub fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Result<Self> {
        validate_address(&config.address)?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (status_tx, _) = broadcast::channel(STATUS_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);

        let controller = Controller {
            config: config.clone(),
            transport,
            outbound_rx,
            events_tx: events_tx.clone(),
            status_tx: status_tx.clone(),
            state_tx,
            last_status: None,
        };
        tokio::spawn(controller.run());

        Ok(Self {
            inner: Arc::new(ChannelInner {
                config,
                outbound_tx,
                events_tx,
                status_tx,
                state_rx,
            }),
        })
    }

    /// The configuration this channel was built with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Snapshot of the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.inner.state_rx.borrow().clone()
    }

    /// Send a value over the live transport.
    ///
    /// String values pass through unchanged; everything else is
    /// JSON-encoded. While no transport is live the frame is silently
    /// dropped (nothing is queued across reconnects). Once the channel has
    /// terminated, sending fails with [`Error::Terminated`].
    pub fn send<T>(&self, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let value = serde_json::to_value(value)?;
        self.send_frame(Frame::Text(codec::serialize(&value)))
    }

    /// Send a pre-encoded text payload unchanged.
    pub fn send_text(&self, text: &str) -> Result<()> {
        self.send_frame(Frame::Text(text.to_owned()))
    }

    /// Send a raw binary payload unchanged.
    pub fn send_bytes(&self, data: Vec<u8>) -> Result<()> {
        self.send_frame(Frame::Binary(data))
    }

    /// Send a named event as the conventional `{event, data}` shape.
    pub fn emit<T>(&self, event: &str, data: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let data = serde_json::to_value(data)?;
        let message = json!({ "event": event, "data": data });
        self.send_frame(Frame::Text(codec::serialize(&message)))
    }

    fn send_frame(&self, frame: Frame) -> Result<()> {
        let state = self.inner.state_rx.borrow().clone();
        if state.is_terminal() {
            return Err(Error::Terminated);
        }
        if !state.is_connected() {
            tracing::debug!("no live transport, dropping outbound frame");
            return Ok(());
        }
        // The controller only stops consuming once terminated; a lost race
        // here is equivalent to the frame being dropped in flight.
        _ = self.inner.outbound_tx.send(frame);
        Ok(())
    }

    /// Subscribe to the raw event stream.
    ///
    /// A hot multicast stream: subscribers see frames from subscription time
    /// onward, in transport delivery order, with no replay. Not every `Err`
    /// item is terminal: a subscriber that falls behind receives
    /// [`Error::Lagged`] and the stream continues past it. A fatal transport
    /// error is delivered as the final `Err` item, after which the stream
    /// ends; clean completion ends it without one. Subscribers joining after
    /// termination observe the terminal event immediately.
    pub fn frames(&self) -> impl Stream<Item = Result<Frame>> + Send + 'static {
        let channel = Arc::clone(&self.inner);
        let mut frames_rx = self.inner.events_tx.subscribe();
        let mut state_rx = self.inner.state_rx.clone();

        stream! {
            // Keeps the controller alive while any subscriber exists.
            let _channel = channel;
            loop {
                let state = state_rx.borrow_and_update().clone();
                if state.is_terminal() {
                    // Frames already queued are delivered ahead of the
                    // terminal event.
                    loop {
                        match frames_rx.try_recv() {
                            Ok(frame) => yield Ok(frame),
                            Err(TryRecvError::Lagged(count)) => {
                                yield Err(Error::Lagged { count });
                            }
                            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                        }
                    }
                    if let ChannelState::Failed(error) = state {
                        yield Err(error);
                    }
                    return;
                }

                tokio::select! {
                    frame = frames_rx.recv() => match frame {
                        Ok(frame) => yield Ok(frame),
                        Err(RecvError::Lagged(count)) => {
                            tracing::warn!(count, "subscriber lagged, missed frames");
                            yield Err(Error::Lagged { count });
                        }
                        Err(RecvError::Closed) => return,
                    },
                    changed = state_rx.changed() => if changed.is_err() {
                        return;
                    },
                }
            }
        }
    }

    /// Subscribe to every inbound message as a decoded value.
    ///
    /// Text frames are decoded leniently (non-JSON text passes through as a
    /// string); binary frames surface as arrays of byte values. Terminal
    /// semantics are those of [`frames`](Self::frames).
    pub fn messages(&self) -> impl Stream<Item = Result<Value>> + Send + 'static {
        self.frames().map(|item| {
            item.map(|frame| match frame {
                Frame::Text(text) => codec::deserialize(&text),
                Frame::Binary(data) => Value::Array(data.into_iter().map(Value::from).collect()),
            })
        })
    }

    /// Subscribe to the `data` payloads of a named event.
    ///
    /// Inbound frames are decoded, framing envelopes unwrapped, and only
    /// messages of the shape `{event, data}` whose `event` equals `name`
    /// are delivered. The reserved `"error"` and `"close"` names never
    /// match, and messages without a `data` payload are skipped.
    pub fn on<S: Into<String>>(&self, name: S) -> impl Stream<Item = Value> + Send + 'static {
        let name = name.into();
        self.frames()
            .filter_map(move |item| ready(item.ok().and_then(|f| codec::event_data(&f, &name))))
    }

    /// Subscribe to raw binary payloads.
    ///
    /// Binary frames yield their bytes; text frames carrying a binary
    /// framing envelope are unwrapped; other text passes through as its raw
    /// bytes.
    pub fn bytes(&self) -> impl Stream<Item = Vec<u8>> + Send + 'static {
        self.frames()
            .filter_map(|item| ready(item.ok().map(|frame| codec::bytes(&frame))))
    }

    /// Subscribe to the terminal error as a regular stream item.
    ///
    /// Yields at most one error and then ends; ends without an item when the
    /// channel completes cleanly. Lets callers observe failure without their
    /// own stream erroring out.
    pub fn errors(&self) -> impl Stream<Item = Error> + Send + 'static {
        let channel = Arc::clone(&self.inner);
        let mut state_rx = self.inner.state_rx.clone();

        stream! {
            let _channel = channel;
            loop {
                let state = state_rx.borrow_and_update().clone();
                match state {
                    ChannelState::Failed(error) => {
                        yield error;
                        return;
                    }
                    ChannelState::Closed => return,
                    _ => {}
                }
                if state_rx.changed().await.is_err() {
                    return;
                }
            }
        }
    }

    /// Resolve when the channel completes cleanly.
    ///
    /// Fires exactly once, on retry exhaustion. A channel terminated by a
    /// fatal transport error never resolves this future; observe that path
    /// through [`errors`](Self::errors) instead.
    pub async fn closed(&self) {
        let mut state_rx = self.inner.state_rx.clone();
        loop {
            let state = state_rx.borrow_and_update().clone();
            match state {
                ChannelState::Closed => return,
                ChannelState::Failed(_) => std::future::pending::<()>().await,
                _ => {}
            }
            if state_rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Subscribe to connectivity transitions.
    ///
    /// Emits `true` right after the transport opens and `false` right after
    /// it closes. Never yields the same value twice in a row, regardless of
    /// when the subscriber joined, and completes when the channel
    /// terminates.
    pub fn status(&self) -> impl Stream<Item = bool> + Send + 'static {
        let channel = Arc::clone(&self.inner);
        let mut status_rx = self.inner.status_tx.subscribe();
        let mut state_rx = self.inner.state_rx.clone();

        stream! {
            let _channel = channel;
            let mut last = None;
            loop {
                if state_rx.borrow_and_update().is_terminal() {
                    loop {
                        match status_rx.try_recv() {
                            Ok(value) => {
                                if last != Some(value) {
                                    last = Some(value);
                                    yield value;
                                }
                            }
                            Err(TryRecvError::Lagged(_)) => {}
                            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                        }
                    }
                    return;
                }

                tokio::select! {
                    value = status_rx.recv() => match value {
                        Ok(value) => {
                            // Deduplicated here as well, so the invariant
                            // holds even for a subscriber that lagged.
                            if last != Some(value) {
                                last = Some(value);
                                yield value;
                            }
                        }
                        Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => return,
                    },
                    changed = state_rx.changed() => if changed.is_err() {
                        return;
                    },
                }
            }
        }
    }

    /// Run a callback for every `data` payload of a named event.
    ///
    /// The callback runs on a spawned task; abort the returned handle to
    /// unsubscribe. Other subscribers and the transport are unaffected.
    pub fn on_each<S, F>(&self, name: S, mut callback: F) -> JoinHandle<()>
    where
        S: Into<String>,
        F: FnMut(Value) + Send + 'static,
    {
        let events = self.on(name);
        tokio::spawn(async move {
            let mut events = pin!(events);
            while let Some(data) = events.next().await {
                callback(data);
            }
        })
    }

    /// Run a callback for every raw binary payload.
    ///
    /// Same subscription semantics as [`on_each`](Self::on_each).
    pub fn bytes_each<F>(&self, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut(Vec<u8>) + Send + 'static,
    {
        let payloads = self.bytes();
        tokio::spawn(async move {
            let mut payloads = pin!(payloads);
            while let Some(data) = payloads.next().await {
                callback(data);
            }
        })
    }
}

fn validate_address(address: &str) -> Result<()> {
    let url = url::Url::parse(address).map_err(|e| Error::InvalidAddress {
        address: address.to_owned(),
        source: Some(Arc::new(e)),
    })?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(Error::InvalidAddress {
            address: address.to_owned(),
            source: None,
        });
    }
    Ok(())
}

/// Outcome of driving one live connection.
enum Served {
    /// Transport closed without an application-fatal cause
    Closed,
    /// Transport errored while live; terminal for the whole channel
    Fatal(Error),
    /// Every channel handle was dropped
    HandleDropped,
}

/// Outcome of one reconnection session.
enum Session {
    Reconnected(Box<dyn Connection>),
    Exhausted,
    HandleDropped,
}

/// The reconnection controller. One task, exclusive owner of the transport
/// handle; runs the whole lifecycle as an explicit state machine.
struct Controller {
    config: Config,
    transport: Arc<dyn Transport>,
    outbound_rx: mpsc::UnboundedReceiver<Frame>,
    events_tx: broadcast::Sender<Frame>,
    status_tx: broadcast::Sender<bool>,
    state_tx: watch::Sender<ChannelState>,
    last_status: Option<bool>,
}

impl Controller {
    async fn run(mut self) {
        tracing::debug!(address = %self.config.address, "channel starting");
        let mut live = self.attempt().await;

        loop {
            if let Some(conn) = live.take() {
                match self.serve(conn).await {
                    Served::Closed => {
                        tracing::info!("transport disconnected");
                        self.publish_status(false);
                    }
                    Served::Fatal(error) => {
                        tracing::error!(%error, "fatal transport error, terminating channel");
                        self.publish_status(false);
                        _ = self.state_tx.send(ChannelState::Failed(error));
                        return;
                    }
                    Served::HandleDropped => {
                        tracing::debug!("all channel handles dropped, shutting down");
                        _ = self.state_tx.send(ChannelState::Closed);
                        return;
                    }
                }
            }

            // No live transport: exactly one reconnection session runs, here.
            match self.retry_session().await {
                Session::Reconnected(conn) => live = Some(conn),
                Session::Exhausted => {
                    tracing::warn!(
                        attempts = self.config.max_retries,
                        "retry attempts exhausted, completing channel"
                    );
                    _ = self.state_tx.send(ChannelState::Closed);
                    return;
                }
                Session::HandleDropped => {
                    _ = self.state_tx.send(ChannelState::Closed);
                    return;
                }
            }
        }
    }

    /// Make one connect attempt, publishing state and status on success.
    async fn attempt(&mut self) -> Option<Box<dyn Connection>> {
        _ = self.state_tx.send(ChannelState::Connecting);
        tracing::debug!(address = %self.config.address, "connecting");

        match self.transport.open(&self.config).await {
            Ok(conn) => {
                _ = self.state_tx.send(ChannelState::Connected {
                    since: Instant::now(),
                });
                self.publish_status(true);
                tracing::info!(address = %self.config.address, "transport connected");
                Some(conn)
            }
            Err(error) => {
                tracing::debug!(%error, "connect attempt failed");
                None
            }
        }
    }

    /// Drive a live connection until it closes, errors, or the channel is
    /// dropped.
    async fn serve(&mut self, mut conn: Box<dyn Connection>) -> Served {
        loop {
            tokio::select! {
                inbound = conn.recv() => match inbound {
                    Some(Ok(frame)) => {
                        // No subscribers is fine; the stream is hot either way.
                        _ = self.events_tx.send(frame);
                    }
                    Some(Err(error)) => {
                        conn.close().await;
                        return Served::Fatal(error);
                    }
                    None => return Served::Closed,
                },
                outbound = self.outbound_rx.recv() => match outbound {
                    Some(frame) => {
                        if let Err(error) = conn.send(frame).await {
                            tracing::warn!(%error, "send failed, treating transport as closed");
                            conn.close().await;
                            return Served::Closed;
                        }
                    }
                    None => {
                        conn.close().await;
                        return Served::HandleDropped;
                    }
                },
            }
        }
    }

    /// One bounded retry session: a strictly interval-paced tick per
    /// attempt, up to the configured budget.
    async fn retry_session(&mut self) -> Session {
        // Nothing is queued across reconnects.
        if self.discard_pending_outbound() {
            return Session::HandleDropped;
        }

        let mut pacer: ExponentialBackoff = (&self.config).into();
        for attempt in 1..=self.config.max_retries {
            _ = self.state_tx.send(ChannelState::Retrying { attempt });
            if let Some(delay) = pacer.next_backoff() {
                sleep(delay).await;
            }
            if self.discard_pending_outbound() {
                return Session::HandleDropped;
            }

            tracing::warn!(attempt, max = self.config.max_retries, "reconnecting");
            if let Some(conn) = self.attempt().await {
                return Session::Reconnected(conn);
            }
        }

        Session::Exhausted
    }

    /// Drop frames sent while no transport was live. Returns `true` once
    /// every channel handle is gone.
    fn discard_pending_outbound(&mut self) -> bool {
        loop {
            match self.outbound_rx.try_recv() {
                Ok(_frame) => {
                    tracing::debug!("discarding outbound frame sent while disconnected");
                }
                Err(MpscTryRecvError::Empty) => return false,
                Err(MpscTryRecvError::Disconnected) => return true,
            }
        }
    }

    /// Publish a connectivity transition, deduplicated at the source so the
    /// status stream is distinct-consecutive by construction.
    fn publish_status(&mut self, connected: bool) {
        if self.last_status != Some(connected) {
            self.last_status = Some(connected);
            _ = self.status_tx.send(connected);
        }
    }
}
