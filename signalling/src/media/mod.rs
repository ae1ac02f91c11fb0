// SPDX-License-Identifier: MPL-2.0

//! Client for the remote media server: pipelines, the elements created in
//! them and the events they raise

pub mod crowd_detector;
#[cfg(test)]
pub(crate) mod mock;
pub mod rpc;

use crowddetector_signalling_protocol as p;
use futures::channel::mpsc;
use futures::future::{BoxFuture, Shared};
use futures::prelude::*;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tracing::{debug, info, instrument, trace};

pub use crowd_detector::{CrowdDetectorConfig, CrowdDetectorEvent};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("could not find media server at {uri}: {details}")]
    Unreachable { uri: String, details: String },
    #[error("media server error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("connection to the media server was lost")]
    Closed,
    #[error("unexpected message from media server: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, PartialEq)]
/// An event raised by a remote media object
pub struct MediaEvent {
    pub object: String,
    pub kind: String,
    pub data: Value,
}

/// Request/response channel to the media server. Events are delivered out of
/// band, through the receiver handed to [`MediaServerClient::new`].
pub trait RpcTransport: Send + Sync {
    fn request(
        &self,
        method: &'static str,
        params: Value,
    ) -> BoxFuture<'static, Result<Value, MediaError>>;

    fn is_closed(&self) -> bool;
}

type Listener = (u64, mpsc::UnboundedSender<Value>);
type Listeners = Arc<Mutex<HashMap<(String, String), Vec<Listener>>>>;

#[derive(Clone)]
/// A connected media server client, shared by all sessions
pub struct MediaServerClient {
    transport: Arc<dyn RpcTransport>,
    listeners: Listeners,
    next_listener: Arc<AtomicU64>,
}

impl MediaServerClient {
    /// Wrap a transport, routing its events to subscriptions
    pub fn new(
        transport: Arc<dyn RpcTransport>,
        mut events: mpsc::UnboundedReceiver<MediaEvent>,
    ) -> Self {
        let listeners = Listeners::default();

        let listeners_clone = listeners.clone();
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let mut listeners = listeners_clone.lock().unwrap();
                match listeners.get_mut(&(event.object.clone(), event.kind.clone())) {
                    Some(targets) => {
                        targets.retain(|(_, tx)| tx.unbounded_send(event.data.clone()).is_ok())
                    }
                    None => trace!(
                        object = %event.object,
                        "Dropping {} event without subscribers",
                        event.kind
                    ),
                }
            }

            debug!("Media server event stream ended");
        });

        Self {
            transport,
            listeners,
            next_listener: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn create_pipeline(&self) -> Result<MediaPipeline, MediaError> {
        let result = self
            .transport
            .request(
                "create",
                json!({
                    "type": "MediaPipeline",
                    "constructorParams": {},
                    "properties": {},
                }),
            )
            .await?;
        let id = value_string(&result)?;

        info!(pipeline = %id, "created pipeline");

        Ok(MediaPipeline {
            object: MediaObject {
                client: self.clone(),
                id,
            },
            released: Arc::new(AtomicBool::new(false)),
        })
    }
}

fn value_string(result: &Value) -> Result<String, MediaError> {
    result
        .get("value")
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| MediaError::Protocol(format!("expected a string value in {result}")))
}

#[derive(Clone)]
/// Handle to an object living on the media server
pub struct MediaObject {
    client: MediaServerClient,
    id: String,
}

impl std::fmt::Debug for MediaObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("MediaObject").field(&self.id).finish()
    }
}

impl MediaObject {
    pub fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(&self, operation: &str, params: Value) -> Result<Value, MediaError> {
        self.client
            .transport
            .request(
                "invoke",
                json!({
                    "object": self.id,
                    "operation": operation,
                    "operationParams": params,
                }),
            )
            .await
    }

    /// Send this element's media to `sink`
    #[instrument(level = "debug", skip(self, sink), fields(source = %self.id, sink = %sink.id))]
    pub async fn connect(&self, sink: &MediaObject) -> Result<(), MediaError> {
        self.invoke("connect", json!({ "sink": sink.id })).await?;

        Ok(())
    }

    /// Register for events of `kind` raised by this object. The listener is
    /// registered before the remote subscription so nothing raised in between
    /// is lost.
    #[instrument(level = "debug", skip(self), fields(object = %self.id))]
    pub async fn subscribe(&self, kind: &str) -> Result<Subscription, MediaError> {
        let (tx, rx) = mpsc::unbounded();
        let token = self.client.next_listener.fetch_add(1, Ordering::Relaxed);
        let key = (self.id.clone(), kind.to_string());
        self.client
            .listeners
            .lock()
            .unwrap()
            .entry(key.clone())
            .or_default()
            .push((token, tx));

        let subscription = Subscription {
            receiver: rx,
            listeners: self.client.listeners.clone(),
            key,
            token,
        };

        self.client
            .transport
            .request("subscribe", json!({ "type": kind, "object": self.id }))
            .await?;

        Ok(subscription)
    }
}

/// Events of one kind raised by one remote object. Dropping it unregisters
/// the listener.
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<Value>,
    listeners: Listeners,
    key: (String, String),
    token: u64,
}

impl Stream for Subscription {
    type Item = Value;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_next_unpin(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut listeners = self.listeners.lock().unwrap();
        if let Some(targets) = listeners.get_mut(&self.key) {
            targets.retain(|(token, _)| *token != self.token);
            if targets.is_empty() {
                listeners.remove(&self.key);
            }
        }
    }
}

#[derive(Clone, Debug)]
/// A remote container of connected media elements, released as a unit
pub struct MediaPipeline {
    object: MediaObject,
    released: Arc<AtomicBool>,
}

impl MediaPipeline {
    pub fn id(&self) -> &str {
        self.object.id()
    }

    /// Create an element of type `kind` owned by this pipeline
    #[instrument(level = "debug", skip(self, options), fields(pipeline = %self.id()))]
    pub async fn create_element(
        &self,
        kind: &str,
        mut options: Map<String, Value>,
    ) -> Result<MediaObject, MediaError> {
        options.insert("mediaPipeline".to_string(), json!(self.id()));

        let result = self
            .object
            .client
            .transport
            .request(
                "create",
                json!({
                    "type": kind,
                    "constructorParams": options,
                    "properties": {},
                }),
            )
            .await?;

        Ok(MediaObject {
            client: self.object.client.clone(),
            id: value_string(&result)?,
        })
    }

    pub async fn create_webrtc_endpoint(&self) -> Result<WebRtcEndpoint, MediaError> {
        self.create_element("WebRtcEndpoint", Map::new())
            .await
            .map(WebRtcEndpoint)
    }

    pub async fn create_crowd_detector(
        &self,
        config: &CrowdDetectorConfig,
    ) -> Result<CrowdDetectorFilter, MediaError> {
        self.create_element("CrowdDetectorFilter", config.constructor_params())
            .await
            .map(CrowdDetectorFilter)
    }

    /// Release the pipeline and, remotely, every element created in it.
    /// Only the first call reaches the media server.
    #[instrument(level = "debug", skip(self), fields(pipeline = %self.id()))]
    pub async fn release(&self) -> Result<(), MediaError> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("Releasing pipeline");
        self.object
            .client
            .transport
            .request("release", json!({ "object": self.id() }))
            .await?;

        Ok(())
    }
}

#[derive(Clone, Debug)]
/// The element negotiating media with the browser
pub struct WebRtcEndpoint(MediaObject);

impl Deref for WebRtcEndpoint {
    type Target = MediaObject;

    fn deref(&self) -> &MediaObject {
        &self.0
    }
}

impl WebRtcEndpoint {
    /// Hand the browser's offer to the endpoint and obtain its answer
    pub async fn process_offer(&self, offer: &str) -> Result<String, MediaError> {
        let result = self.invoke("processOffer", json!({ "offer": offer })).await?;

        value_string(&result)
    }

    pub async fn add_ice_candidate(&self, candidate: &p::IceCandidate) -> Result<(), MediaError> {
        self.invoke(
            "addIceCandidate",
            json!({
                "candidate": {
                    "__module__": "kurento",
                    "__type__": "IceCandidate",
                    "candidate": candidate.candidate,
                    "sdpMid": candidate.sdp_mid,
                    "sdpMLineIndex": candidate.sdp_m_line_index,
                }
            }),
        )
        .await?;

        Ok(())
    }

    pub async fn gather_candidates(&self) -> Result<(), MediaError> {
        self.invoke("gatherCandidates", json!({})).await?;

        Ok(())
    }

    /// Candidates discovered locally by the endpoint
    pub async fn subscribe_ice_candidates(
        &self,
    ) -> Result<impl Stream<Item = p::IceCandidate> + Send + 'static, MediaError> {
        let id = self.id().to_string();
        let subscription = self.subscribe("OnIceCandidate").await?;

        Ok(subscription.filter_map(move |data| {
            let candidate = data
                .get("candidate")
                .cloned()
                .and_then(|c| serde_json::from_value::<p::IceCandidate>(c).ok());
            if candidate.is_none() {
                debug!(endpoint = %id, "Ignoring malformed candidate event {data}");
            }
            future::ready(candidate)
        }))
    }
}

#[derive(Clone, Debug)]
/// The element analysing the browser's video for crowd activity
pub struct CrowdDetectorFilter(MediaObject);

impl Deref for CrowdDetectorFilter {
    type Target = MediaObject;

    fn deref(&self) -> &MediaObject {
        &self.0
    }
}

impl CrowdDetectorFilter {
    pub async fn subscribe_event(
        &self,
        event: CrowdDetectorEvent,
    ) -> Result<impl Stream<Item = p::OutgoingMessage> + Send + 'static, MediaError> {
        let subscription = self.subscribe(event.event_type()).await?;

        Ok(subscription.map(move |data| event.into_message(data)))
    }
}

type Connector = Arc<dyn Fn() -> BoxFuture<'static, Result<MediaServerClient, MediaError>> + Send + Sync>;
type PendingClient = Shared<BoxFuture<'static, Result<MediaServerClient, MediaError>>>;

#[derive(Clone)]
/// Lazily connected, process wide access to the media server.
///
/// Concurrent callers share one connection attempt. A failed attempt, or a
/// client whose connection was lost, is forgotten so the next caller retries.
pub struct MediaServer {
    connector: Connector,
    client: Arc<Mutex<Option<PendingClient>>>,
}

impl MediaServer {
    /// Media server reachable over a JSON-RPC websocket at `uri`
    pub fn new(uri: impl Into<String>) -> Self {
        let uri = uri.into();

        Self::with_connector(move || rpc::connect(uri.clone()).boxed())
    }

    pub fn with_connector<F>(connector: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<MediaServerClient, MediaError>> + Send + Sync + 'static,
    {
        Self {
            connector: Arc::new(connector),
            client: Default::default(),
        }
    }

    pub async fn client(&self) -> Result<MediaServerClient, MediaError> {
        let pending = {
            let mut client = self.client.lock().unwrap();
            match &*client {
                Some(pending) if !matches!(pending.peek(), Some(Ok(c)) if c.is_closed()) => {
                    pending.clone()
                }
                _ => {
                    debug!("Connecting to media server");
                    let pending = (self.connector)().shared();
                    *client = Some(pending.clone());
                    pending
                }
            }
        };

        let res = pending.clone().await;

        if res.is_err() {
            let mut client = self.client.lock().unwrap();
            if client
                .as_ref()
                .is_some_and(|current| current.ptr_eq(&pending))
            {
                *client = None;
            }
        }

        res
    }
}
