//! Message dispatcher backed by one coordination node
//!
//! Every peer watches the same node. A broadcast is a single unconditional
//! write to it, so the coordination service's write order on that node is
//! the broadcast order. Last write wins: a watcher that wakes late sees only
//! the latest message, so receivers must treat a message as "this is the
//! latest change", never as a reliable queue entry.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use coordination::{normalize_path, CoordinationHandle, Watch, WatchEvent};
use parking_lot::{Mutex, RwLock};
use relevance_core::config::DispatcherConfig;
use relevance_core::{Error, MessageType, Result, SenderId};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::message::Message;

/// Upper bound for the watch re-arm retry delay
pub const MAX_REARM_BACKOFF: Duration = Duration::from_secs(5);

/// Callback invoked for every received, actionable message
pub trait MessageReceiver: Send + Sync {
    /// `is_sender` is true when this process sent the message
    fn on_message(&self, msg_type: MessageType, is_sender: bool, payload: &str);
}

type Receivers = Arc<RwLock<Vec<Arc<dyn MessageReceiver>>>>;

/// Dispatcher lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatcherState {
    Uninitialized,
    Initialized { sender: SenderId },
    Shutdown,
}

/// Broadcasts model change notifications to every peer
pub struct MessageDispatcher {
    client: CoordinationHandle,
    path: String,
    host: String,
    rearm_backoff: Duration,
    state: RwLock<DispatcherState>,
    init_lock: tokio::sync::Mutex<()>,
    receivers: Receivers,
    shutdown_tx: broadcast::Sender<()>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl MessageDispatcher {
    /// Create a dispatcher for the notification node at `config.notification_path`
    pub fn new(client: CoordinationHandle, config: &DispatcherConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            client,
            path: normalize_path(&config.notification_path),
            host: config.host_id.clone().unwrap_or_else(SenderId::local_host),
            rearm_backoff: config.rearm_backoff,
            state: RwLock::new(DispatcherState::Uninitialized),
            init_lock: tokio::sync::Mutex::new(()),
            receivers: Arc::new(RwLock::new(Vec::new())),
            shutdown_tx,
            listener: Mutex::new(None),
        }
    }

    /// Notification node path
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn state(&self) -> DispatcherState {
        self.state.read().clone()
    }

    /// Identity stamped on outgoing messages, once initialized
    pub fn sender_id(&self) -> Option<SenderId> {
        match &*self.state.read() {
            DispatcherState::Initialized { sender } => Some(sender.clone()),
            _ => None,
        }
    }

    /// Set up the notification node and start listening
    ///
    /// Must be called before any other operation.
    #[instrument(skip(self), fields(path = %self.path))]
    pub async fn initialize(&self) -> Result<()> {
        let _guard = self.init_lock.lock().await;

        match self.state() {
            DispatcherState::Initialized { .. } => {
                info!("MessageDispatcher is already initialized");
                return Ok(());
            }
            DispatcherState::Shutdown => return Err(Error::DispatcherShutdown),
            DispatcherState::Uninitialized => {}
        }

        let sender = SenderId::generate(&self.host);

        match self.client.create_node(&self.path, Message::idle_value()).await {
            Ok(()) => info!("Created notification node"),
            Err(Error::NodeExists { .. }) => {
                info!("Notification node already created by others, will not be created again")
            }
            Err(e) => {
                return Err(Error::Initialization {
                    message: format!("can not create notification node {}: {}", self.path, e),
                })
            }
        }

        let watch = self
            .client
            .watch(&self.path)
            .await
            .map_err(|e| Error::Initialization {
                message: format!("can not watch notification node {}: {}", self.path, e),
            })?;

        // subscribe before publishing the state so a later shutdown reaches the listener
        let shutdown_rx = self.shutdown_tx.subscribe();
        {
            let mut state = self.state.write();
            if *state == DispatcherState::Shutdown {
                info!("MessageDispatcher shut down while initializing");
                return Err(Error::DispatcherShutdown);
            }
            *state = DispatcherState::Initialized {
                sender: sender.clone(),
            };
        }

        let listener = Listener {
            client: Arc::clone(&self.client),
            path: self.path.clone(),
            sender: sender.clone(),
            receivers: Arc::clone(&self.receivers),
            rearm_backoff: self.rearm_backoff,
        };
        *self.listener.lock() = Some(tokio::spawn(listener.run(watch, shutdown_rx)));

        info!(
            sender = %sender,
            session = self.client.session_id(),
            "MessageDispatcher is successfully initialized"
        );
        Ok(())
    }

    /// Broadcast a message to every peer, this process included
    ///
    /// Only ADD, UPDATE, DEL and EMPTY are broadcast; anything else is
    /// logged and dropped.
    ///
    /// # Errors
    /// `Error::Dispatch` if the write fails; the caller decides whether to retry
    #[instrument(skip(self, payload), fields(path = %self.path, size = payload.len()))]
    pub async fn dispatch(&self, msg_type: MessageType, payload: &str) -> Result<()> {
        let sender = match self.state() {
            DispatcherState::Initialized { sender } => sender,
            DispatcherState::Uninitialized => {
                error!("Message dispatcher has not been initialized to be used");
                return Err(Error::NotInitialized {
                    component: "MessageDispatcher".to_string(),
                });
            }
            DispatcherState::Shutdown => return Err(Error::DispatcherShutdown),
        };

        if !msg_type.is_broadcastable() {
            error!(msg_type = %msg_type, "Message type can not be broadcast");
            return Ok(());
        }

        let raw = Message::new(msg_type, sender, payload).encode()?;
        self.client
            .set_data(&self.path, raw)
            .await
            .map_err(|e| Error::Dispatch {
                message: format!("{} message: {}", msg_type, e),
            })?;

        debug!(msg_type = %msg_type, "Message sent");
        Ok(())
    }

    /// Register a callback for received messages
    pub fn register_receiver(&self, receiver: Arc<dyn MessageReceiver>) -> Result<()> {
        match self.state() {
            DispatcherState::Initialized { .. } => {
                self.receivers.write().push(receiver);
                Ok(())
            }
            _ => {
                error!("Not initialized dispatcher to be used, can not register message receiver");
                Err(Error::NotInitialized {
                    component: "MessageDispatcher".to_string(),
                })
            }
        }
    }

    /// Stop listening and release the coordination session; idempotent
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.write();
            if *state == DispatcherState::Shutdown {
                return;
            }
            *state = DispatcherState::Shutdown;
        }

        let _ = self.shutdown_tx.send(());
        self.client.close().await;

        let handle = self.listener.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Notification listener ended abnormally");
            }
        }
        info!(path = %self.path, "MessageDispatcher shut down");
    }
}

impl Drop for MessageDispatcher {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Task that turns watch firings into receiver callbacks
struct Listener {
    client: CoordinationHandle,
    path: String,
    sender: SenderId,
    receivers: Receivers,
    rearm_backoff: Duration,
}

impl Listener {
    async fn run(self, mut watch: Watch, mut shutdown_rx: broadcast::Receiver<()>) {
        debug!(path = %self.path, "Notification listener started");

        loop {
            let event = tokio::select! {
                event = &mut watch => event,
                _ = shutdown_rx.recv() => break,
            };

            if event == WatchEvent::SessionClosed {
                info!(path = %self.path, "Coordination session closed");
                break;
            }

            // re-arm before reading so a change landing during handling still fires
            watch = match self.rearm(&mut shutdown_rx).await {
                Some(watch) => watch,
                None => break,
            };
            debug!(path = %self.path, ?event, "Re-attached the watcher");

            match event {
                WatchEvent::NodeDataChanged | WatchEvent::NodeCreated => self.handle_change().await,
                _ => debug!(path = %self.path, ?event, "Ignoring notification event"),
            }
        }

        debug!(path = %self.path, "Notification listener stopped");
    }

    async fn rearm(&self, shutdown_rx: &mut broadcast::Receiver<()>) -> Option<Watch> {
        let mut delay = self.rearm_backoff;
        loop {
            match self.client.watch(&self.path).await {
                Ok(watch) => return Some(watch),
                Err(Error::SessionClosed) => return None,
                Err(e) => {
                    warn!(
                        path = %self.path,
                        error = %e,
                        retry_ms = delay.as_millis() as u64,
                        "Failed to re-attach the watcher"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_rx.recv() => return None,
                    }
                    delay = (delay * 2).min(MAX_REARM_BACKOFF);
                }
            }
        }
    }

    async fn handle_change(&self) {
        let raw: Bytes = match self.client.get_data(&self.path).await {
            Ok(raw) => raw,
            Err(e) => {
                error!(path = %self.path, error = %e, "Failed to read notification");
                return;
            }
        };

        let message = match Message::decode(&raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(path = %self.path, error = %e, "Dropping undecodable notification");
                return;
            }
        };

        if message.msg_type == MessageType::None {
            return;
        }

        let is_sender = message.sender == self.sender;
        debug!(
            msg_type = %message.msg_type,
            sender = %message.sender,
            is_sender,
            "Got notification"
        );

        let receivers: Vec<_> = self.receivers.read().iter().cloned().collect();
        for receiver in receivers {
            receiver.on_message(message.msg_type, is_sender, &message.payload);
        }
    }
}
