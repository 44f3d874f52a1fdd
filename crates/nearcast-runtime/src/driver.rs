//! Async driver - runs a `Node` against a `Transport` on tokio
//!
//! The driver owns the node. Transport callbacks, application requests and
//! command completions all arrive on one channel, so the node sees them in a
//! single order. Transport calls run on spawned tasks and report back as
//! events; the node itself is never touched outside the driver loop.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

use nearcast_core::{
    NearcastError, NearcastResult, PeerId, Timestamp, TrackedPayload, TransportEvent,
};
use nearcast_transport::Transport;

use crate::broadcast::PassReport;
use crate::dispatcher::NodeEvent;
use crate::node::{Command, Node, NodeSnapshot, Notification};

/// Message on the driver's inbound channel
#[derive(Debug)]
pub enum DriverMessage {
    Event(NodeEvent),
    Shutdown(oneshot::Sender<()>),
}

/// Where a transport implementation reports what it observes
#[derive(Clone, Debug)]
pub struct TransportEventSink {
    tx: mpsc::UnboundedSender<DriverMessage>,
}

impl TransportEventSink {
    pub fn emit(&self, event: TransportEvent) -> NearcastResult<()> {
        self.tx
            .send(DriverMessage::Event(event.into()))
            .map_err(|_| NearcastError::Shutdown)
    }
}

/// Application side of a running node
#[derive(Clone, Debug)]
pub struct NodeHandle {
    tx: mpsc::UnboundedSender<DriverMessage>,
}

impl NodeHandle {
    /// Replace the tracked payload and wait for its fan-out pass to be issued
    pub async fn track(&self, payload: TrackedPayload) -> NearcastResult<PassReport> {
        let (reply, rx) = oneshot::channel();
        self.send(NodeEvent::Track {
            payload,
            reply: Some(reply),
        })?;
        rx.await.map_err(|_| NearcastError::Shutdown)?
    }

    /// Node state after every event queued before this call
    pub async fn snapshot(&self) -> NearcastResult<NodeSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(NodeEvent::Inspect { reply })?;
        rx.await.map_err(|_| NearcastError::Shutdown)
    }

    pub fn event_sink(&self) -> TransportEventSink {
        TransportEventSink {
            tx: self.tx.clone(),
        }
    }

    /// Stop advertising and browsing, then stop the driver
    pub async fn shutdown(&self) -> NearcastResult<()> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(DriverMessage::Shutdown(done))
            .map_err(|_| NearcastError::Shutdown)?;
        rx.await.map_err(|_| NearcastError::Shutdown)
    }

    fn send(&self, event: NodeEvent) -> NearcastResult<()> {
        self.tx
            .send(DriverMessage::Event(event))
            .map_err(|_| NearcastError::Shutdown)
    }
}

/// Runs a node until shut down
pub struct NodeDriver<T: Transport> {
    node: Node,
    transport: Arc<T>,
    // Weak so the loop ends once every handle and sink is dropped
    tx: mpsc::WeakUnboundedSender<DriverMessage>,
    rx: mpsc::UnboundedReceiver<DriverMessage>,
    notifications: mpsc::Sender<Notification>,
}

impl<T: Transport> NodeDriver<T> {
    /// Wrap `node`. Notifications are delivered on the returned receiver,
    /// which holds at most `max_notifications` undelivered entries.
    pub fn new(node: Node, transport: Arc<T>) -> (Self, NodeHandle, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (notify_tx, notify_rx) = mpsc::channel(node.config().max_notifications.max(1));

        let driver = NodeDriver {
            node,
            transport,
            tx: tx.downgrade(),
            rx,
            notifications: notify_tx,
        };
        (driver, NodeHandle { tx }, notify_rx)
    }

    /// Advertise, browse and process events until `NodeHandle::shutdown`
    /// or until every handle and event sink has been dropped
    pub async fn run(mut self) -> NearcastResult<()> {
        self.node.config().validate()?;
        let service = self.node.config().service_id.clone();
        let local = self.node.local_peer().clone();

        self.transport.advertise(&service, &local).await?;
        self.transport.browse(&service).await?;
        tracing::info!(local = %local, service = %service, "node started");

        let started = Instant::now();
        let mut ticker = tokio::time::interval(self.node.config().tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                message = self.rx.recv() => match message {
                    Some(DriverMessage::Event(event)) => self.node.enqueue(event),
                    Some(DriverMessage::Shutdown(done)) => {
                        self.pump();
                        self.stop(&local).await;
                        let _ = done.send(());
                        return Ok(());
                    }
                    None => {
                        tracing::debug!("all handles dropped");
                        self.pump();
                        self.stop(&local).await;
                        return Ok(());
                    }
                },
                _ = ticker.tick() => {
                    let elapsed = started.elapsed().as_millis() as u64;
                    self.node.tick(Timestamp::from_millis(elapsed));
                }
            }
            self.pump();
        }
    }

    async fn stop(&self, local: &PeerId) {
        if let Err(e) = self.transport.stop_advertise().await {
            tracing::warn!(error = %e, "stop advertise failed");
        }
        if let Err(e) = self.transport.stop_browse().await {
            tracing::warn!(error = %e, "stop browse failed");
        }
        tracing::info!(local = %local, "node stopped");
    }

    /// Drain the node: process events, start commands, forward notifications
    fn pump(&mut self) {
        self.node.process_pending();

        while let Some(command) = self.node.pop_command() {
            self.execute(command);
        }

        while let Some(notification) = self.node.pop_notification() {
            match self.notifications.try_send(notification) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(dropped)) => {
                    tracing::warn!(notification = ?dropped, "notification receiver full, dropping");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::trace!("notification receiver closed");
                }
            }
        }
    }

    fn execute(&self, command: Command) {
        let transport = Arc::clone(&self.transport);
        let tx = self.tx.clone();
        let report = move |event: NodeEvent| {
            // Nothing to report to once the driver has stopped
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(DriverMessage::Event(event));
            }
        };

        match command {
            Command::SendInvite {
                peer,
                attempt,
                context,
                timeout,
            } => {
                tokio::spawn(async move {
                    let pending = match transport.send_invite(&peer, context, timeout).await {
                        Ok(pending) => pending,
                        Err(e) => {
                            report(NodeEvent::InviteSendFailed {
                                peer,
                                attempt,
                                reason: e.to_string(),
                            });
                            return;
                        }
                    };
                    report(NodeEvent::InviteSent {
                        peer: peer.clone(),
                        attempt,
                    });

                    // The node's own deadline decides the timeout
                    match tokio::time::timeout(timeout, pending).await {
                        Ok(Ok(reply)) => report(NodeEvent::InviteAnswered {
                            peer,
                            attempt,
                            reply,
                        }),
                        Ok(Err(_)) => {
                            tracing::debug!(peer = %peer, attempt = %attempt, "transport abandoned invite");
                        }
                        Err(_) => {
                            tracing::trace!(peer = %peer, attempt = %attempt, "no answer before deadline");
                        }
                    }
                });
            }
            Command::SendData { peer, pass, bytes } => {
                tokio::spawn(async move {
                    match transport.send_data(&peer, bytes).await {
                        Ok(()) => report(NodeEvent::DataSent { peer, pass }),
                        Err(e) => report(NodeEvent::DataSendFailed {
                            peer,
                            pass,
                            reason: e.to_string(),
                        }),
                    }
                });
            }
            Command::RespondToInvitation { peer, accept } => {
                tokio::spawn(async move {
                    if let Err(e) = transport.respond_to_invitation(&peer, accept).await {
                        tracing::warn!(peer = %peer, error = %e, "invitation response failed");
                    }
                });
            }
            Command::CloseSession { peer, session } => {
                tokio::spawn(async move {
                    if let Err(e) = transport.close_session(&peer, session).await {
                        tracing::debug!(peer = %peer, session = %session, error = %e, "close session failed");
                    }
                });
            }
        }
    }
}
