// SPDX-License-Identifier: MPL-2.0

use crate::server::ConnectionEvent;
use crate::session::SessionManager;
use anyhow::{anyhow, Error};
use crowddetector_signalling_protocol as p;
use futures::channel::mpsc;
use futures::prelude::*;
use futures::ready;
use futures::stream::{BoxStream, SelectAll};
use pin_project_lite::pin_project;
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use tracing::{debug, info, instrument, warn};

type ConnectionId = String;

struct Connection {
    session_id: String,
    /// Messages produced on behalf of this connection by session tasks
    sender: mpsc::UnboundedSender<p::OutgoingMessage>,
}

pin_project! {
    #[must_use = "streams do nothing unless polled"]
    pub struct Handler {
        #[pin]
        stream: Pin<Box<dyn Stream<Item=(ConnectionId, ConnectionEvent)> + Send>>,
        items: VecDeque<(ConnectionId, p::OutgoingMessage)>,
        outbound: SelectAll<BoxStream<'static, (ConnectionId, p::OutgoingMessage)>>,
        connections: HashMap<ConnectionId, Connection>,
        sessions: SessionManager,
    }
}

impl Handler {
    #[instrument(level = "debug", skip(sessions, stream))]
    /// Create a handler
    pub fn new(
        sessions: SessionManager,
        stream: Pin<Box<dyn Stream<Item = (ConnectionId, ConnectionEvent)> + Send>>,
    ) -> Self {
        Self {
            stream,
            items: VecDeque::new(),
            outbound: SelectAll::new(),
            connections: Default::default(),
            sessions,
        }
    }

    #[instrument(level = "trace", skip(self))]
    fn handle(&mut self, connection_id: &str, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Opened { session_id } => self.open(connection_id, session_id),
            ConnectionEvent::Message(text) => {
                if let Err(err) = self.handle_message(connection_id, &text) {
                    self.items.push_back((
                        connection_id.to_string(),
                        p::OutgoingMessage::Error {
                            message: err.to_string(),
                        },
                    ));
                }
            }
            ConnectionEvent::Closed => self.close(connection_id),
        }
    }

    fn open(&mut self, connection_id: &str, session_id: String) {
        info!(connection_id, session_id = %session_id, "Connection received");

        let (sender, receiver) = mpsc::unbounded();
        let id = connection_id.to_string();
        self.outbound
            .push(receiver.map(move |msg| (id.clone(), msg)).boxed());
        self.connections
            .insert(connection_id.to_string(), Connection { session_id, sender });
    }

    /// The connection is gone, so is its session
    #[instrument(level = "debug", skip(self))]
    fn close(&mut self, connection_id: &str) {
        let Some(connection) = self.connections.remove(connection_id) else {
            return;
        };

        info!(session_id = %connection.session_id, "Connection closed");
        tokio::spawn(self.sessions.stop(&connection.session_id));
    }

    fn handle_message(&mut self, connection_id: &str, text: &str) -> Result<(), Error> {
        let connection = self
            .connections
            .get(connection_id)
            .ok_or_else(|| anyhow!("Connection '{connection_id}' hasn't been opened"))?;

        let msg = serde_json::from_str::<p::IncomingMessage>(text).map_err(|err| {
            debug!(connection_id, "Failed to parse incoming message: {}", err);
            anyhow!("Invalid message {text}")
        })?;

        debug!(session_id = %connection.session_id, "received message {:?}", msg);

        match msg {
            p::IncomingMessage::Start { sdp_offer } => {
                let start = self.sessions.start(
                    &connection.session_id,
                    sdp_offer,
                    connection.sender.clone(),
                );
                let sender = connection.sender.clone();
                tokio::spawn(async move {
                    if let Err(err) = start.await {
                        let _ = sender.unbounded_send(p::OutgoingMessage::Error {
                            message: err.to_string(),
                        });
                    }
                });
            }
            p::IncomingMessage::Stop => {
                tokio::spawn(self.sessions.stop(&connection.session_id));
            }
            p::IncomingMessage::OnIceCandidate { candidate } => {
                self.sessions
                    .on_ice_candidate(&connection.session_id, candidate);
            }
        }

        Ok(())
    }
}

impl Stream for Handler {
    type Item = (ConnectionId, p::OutgoingMessage);

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let this = self.as_mut().project();

            if let Some(item) = this.items.pop_front() {
                break Poll::Ready(Some(item));
            }

            if let Poll::Ready(Some(item)) = this.outbound.poll_next_unpin(cx) {
                break Poll::Ready(Some(item));
            }

            match ready!(this.stream.poll_next(cx)) {
                Some((connection_id, event)) => self.handle(&connection_id, event),
                None => {
                    if !self.connections.is_empty() {
                        warn!("Shutting down with {} open connections", self.connections.len());
                    }
                    break Poll::Ready(None);
                }
            }
        }
    }
}
