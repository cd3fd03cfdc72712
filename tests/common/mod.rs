#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]
#![allow(
    unused,
    reason = "Not every test binary exercises every helper"
)]

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::{SinkExt as _, StreamExt as _};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use ws_channel::{Config, Connection, Error, Frame, Result, Transport};

/// Install a subscriber once so failing tests come with channel logs.
/// Later calls are no-ops.
pub fn init_tracing() {
    drop(
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_e| tracing_subscriber::EnvFilter::new("debug")),
            )
            .with_test_writer()
            .try_init(),
    );
}

/// Mock WebSocket server.
pub struct MockWsServer {
    addr: SocketAddr,
    /// Broadcast messages to ALL connected clients
    message_tx: broadcast::Sender<String>,
    /// Tells every live connection to perform a clean close
    close_tx: broadcast::Sender<()>,
    /// Receives messages clients sent to the server
    received_rx: mpsc::UnboundedReceiver<String>,
}

impl MockWsServer {
    /// Start a mock WebSocket server on a random port.
    pub async fn start() -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (message_tx, _) = broadcast::channel::<String>(100);
        let (close_tx, _) = broadcast::channel::<()>(4);
        let (received_tx, received_rx) = mpsc::unbounded_channel::<String>();

        let broadcast_tx = message_tx.clone();
        let kill_tx = close_tx.clone();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                let Ok(ws_stream) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };

                let (mut write, mut read) = ws_stream.split();
                let received = received_tx.clone();
                let mut msg_rx = broadcast_tx.subscribe();
                let mut close_rx = kill_tx.subscribe();

                // Spawn a task to handle this connection
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Text(text))) => {
                                        drop(received.send(text.to_string()));
                                    }
                                    Some(Ok(_)) => {}
                                    _ => break,
                                }
                            }
                            msg = msg_rx.recv() => {
                                match msg {
                                    Ok(text) => {
                                        if write.send(Message::Text(text.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(_) => break,
                                }
                            }
                            // Clean close: handshake, not a dropped socket
                            _ = close_rx.recv() => {
                                drop(write.send(Message::Close(None)).await);
                                break;
                            }
                        }
                    }
                });
            }
        });

        Self {
            addr,
            message_tx,
            close_tx,
            received_rx,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Send a message to every connected client.
    pub fn broadcast<S: Into<String>>(&self, text: S) {
        drop(self.message_tx.send(text.into()));
    }

    /// Next message a client sent to the server.
    pub async fn next_received(&mut self) -> Option<String> {
        self.received_rx.recv().await
    }

    /// Cleanly close every live connection.
    pub fn close_clients(&self) {
        drop(self.close_tx.send(()));
    }
}

/// What the next connect attempt against a [`MockTransport`] does.
pub enum Script {
    /// Fail the attempt
    Refuse,
    /// Hand the channel this connection
    Accept(MockConnection),
}

/// Scripted in-process transport: each connect attempt consumes the next
/// script entry, and attempts past the end of the script are refused.
pub struct MockTransport {
    scripts: Mutex<VecDeque<Script>>,
    attempts: AtomicU32,
}

impl MockTransport {
    pub fn new<I: IntoIterator<Item = Script>>(scripts: I) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            attempts: AtomicU32::new(0),
        })
    }

    /// Total connect attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, _config: &Config) -> Result<Box<dyn Connection>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match self.scripts.lock().unwrap().pop_front() {
            Some(Script::Accept(conn)) => Ok(Box::new(conn)),
            Some(Script::Refuse) | None => Err(Error::Connect(Arc::new(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            )))),
        }
    }
}

/// Channel-side end of a scripted connection.
pub struct MockConnection {
    inbound: mpsc::UnboundedReceiver<Result<Frame>>,
    sent: mpsc::UnboundedSender<Frame>,
}

/// Test-side end of a scripted connection. Dropping it closes the connection
/// cleanly, as a peer going away does.
pub struct RemoteEnd {
    inbound_tx: mpsc::UnboundedSender<Result<Frame>>,
    sent_rx: mpsc::UnboundedReceiver<Frame>,
}

impl MockConnection {
    pub fn pair() -> (Self, RemoteEnd) {
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (sent, sent_rx) = mpsc::unbounded_channel();
        (
            Self { inbound, sent },
            RemoteEnd {
                inbound_tx,
                sent_rx,
            },
        )
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        self.sent.send(frame).map_err(|_e| {
            Error::Transport(Arc::new(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "peer gone",
            )))
        })
    }

    async fn recv(&mut self) -> Option<Result<Frame>> {
        self.inbound.recv().await
    }

    async fn close(&mut self) {
        self.inbound.close();
    }
}

impl RemoteEnd {
    /// Deliver a text frame to the channel.
    pub fn push_text<S: Into<String>>(&self, text: S) {
        self.inbound_tx.send(Ok(Frame::Text(text.into()))).unwrap();
    }

    /// Deliver a raw frame to the channel.
    pub fn push_frame(&self, frame: Frame) {
        self.inbound_tx.send(Ok(frame)).unwrap();
    }

    /// Fail the live connection with a transport error.
    pub fn fail(&self) {
        let error = Error::Transport(Arc::new(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        )));
        self.inbound_tx.send(Err(error)).unwrap();
    }

    /// Close the connection cleanly.
    pub fn close(self) {
        drop(self);
    }

    /// Next frame the channel transmitted.
    pub async fn next_sent(&mut self) -> Option<Frame> {
        self.sent_rx.recv().await
    }

    /// Next transmitted frame, if one is already waiting.
    pub fn try_next_sent(&mut self) -> Option<Frame> {
        self.sent_rx.try_recv().ok()
    }
}
