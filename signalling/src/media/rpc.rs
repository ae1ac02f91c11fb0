// SPDX-License-Identifier: MPL-2.0

//! JSON-RPC 2.0 transport to a Kurento compatible media server

use super::{MediaError, MediaEvent, MediaServerClient, RpcTransport};
use async_tungstenite::tungstenite::Message as WsMessage;
use futures::channel::{mpsc, oneshot};
use futures::future::BoxFuture;
use futures::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task;
use tracing::{debug, error, info, instrument, trace, warn};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(240);

#[derive(Serialize, Debug)]
struct Request<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize, Debug)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Deserialize, Debug)]
/// Either a response to one of our requests or a notification
struct Incoming {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize, Debug)]
struct EventParams {
    value: EventValue,
}

#[derive(Deserialize, Debug)]
struct EventValue {
    object: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Default)]
struct State {
    next_id: u64,
    /// Assigned by the media server in its first response
    session_id: Option<String>,
    pending: HashMap<u64, oneshot::Sender<Result<Value, MediaError>>>,
    closed: bool,
}

pub struct JsonRpcTransport {
    state: Arc<Mutex<State>>,
    sender: mpsc::Sender<String>,
}

impl RpcTransport for JsonRpcTransport {
    fn request(
        &self,
        method: &'static str,
        mut params: Value,
    ) -> BoxFuture<'static, Result<Value, MediaError>> {
        let (tx, rx) = oneshot::channel();

        let (id, msg) = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return future::ready(Err(MediaError::Closed)).boxed();
            }

            state.next_id += 1;
            let id = state.next_id;

            if let (Some(session_id), Value::Object(params)) = (&state.session_id, &mut params) {
                params.insert("sessionId".to_string(), json!(session_id));
            }

            let msg = match serde_json::to_string(&Request {
                jsonrpc: "2.0",
                id,
                method,
                params,
            }) {
                Ok(msg) => msg,
                Err(err) => {
                    return future::ready(Err(MediaError::Protocol(err.to_string()))).boxed()
                }
            };

            state.pending.insert(id, tx);
            (id, msg)
        };

        let mut sender = self.sender.clone();
        let state = self.state.clone();
        async move {
            if sender.send(msg).await.is_err() {
                state.lock().unwrap().pending.remove(&id);
                return Err(MediaError::Closed);
            }

            rx.await.unwrap_or(Err(MediaError::Closed))
        }
        .boxed()
    }

    fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

fn dispatch(state: &Mutex<State>, events: &mpsc::UnboundedSender<MediaEvent>, text: &str) {
    let incoming = match serde_json::from_str::<Incoming>(text) {
        Ok(incoming) => incoming,
        Err(err) => {
            warn!("Failed to parse media server message: {} ({})", err, text);
            return;
        }
    };

    match (incoming.id, incoming.method.as_deref()) {
        (_, Some("onEvent")) => {
            match incoming
                .params
                .map(serde_json::from_value::<EventParams>)
                .transpose()
            {
                Ok(Some(EventParams { value })) => {
                    trace!(object = %value.object, "{} event", value.kind);
                    let _ = events.unbounded_send(MediaEvent {
                        object: value.object,
                        kind: value.kind,
                        data: value.data,
                    });
                }
                Ok(None) => warn!("Event without parameters: {}", text),
                Err(err) => warn!("Failed to parse event: {} ({})", err, text),
            }
        }
        (Some(id), None) => {
            let pending = {
                let mut state = state.lock().unwrap();
                if let Some(session_id) = incoming
                    .result
                    .as_ref()
                    .and_then(|result| result.get("sessionId"))
                    .and_then(Value::as_str)
                {
                    if state.session_id.as_deref() != Some(session_id) {
                        debug!("Media server session is {}", session_id);
                        state.session_id = Some(session_id.to_string());
                    }
                }
                state.pending.remove(&id)
            };

            let res = match (incoming.result, incoming.error) {
                (_, Some(err)) => Err(MediaError::Rpc {
                    code: err.code,
                    message: err.message,
                }),
                (result, None) => Ok(result.unwrap_or_default()),
            };

            match pending {
                Some(tx) => {
                    let _ = tx.send(res);
                }
                None => warn!("Response to unknown request {}", id),
            }
        }
        (_, Some(method)) => debug!("Ignoring media server request {}", method),
        (None, None) => warn!("Unexpected media server message {}", text),
    }
}

/// Connect to the media server at `uri`
#[instrument(level = "debug")]
pub async fn connect(uri: String) -> Result<MediaServerClient, MediaError> {
    let (ws, _) = async_tungstenite::tokio::connect_async(uri.as_str())
        .await
        .map_err(|err| {
            error!("Could not find media server at address {}", uri);
            MediaError::Unreachable {
                uri: uri.clone(),
                details: err.to_string(),
            }
        })?;

    info!("Connected to media server at {}", uri);

    let state = Arc::new(Mutex::new(State::default()));
    let (events_tx, events_rx) = mpsc::unbounded();

    // 1000 is completely arbitrary, we simply don't want infinite piling
    // up of messages as with unbounded
    let (sender, mut receiver) = mpsc::channel::<String>(1000);
    let (mut ws_sink, mut ws_stream) = ws.split();

    task::spawn(async move {
        while let Some(msg) = receiver.next().await {
            trace!("Sending {}", msg);
            if let Err(err) = ws_sink.send(WsMessage::text(msg)).await {
                error!("Quitting media server send loop: {err}");
                break;
            }
        }

        debug!("Done sending to media server");

        let _ = ws_sink.close(None).await;
    });

    let state_clone = state.clone();
    task::spawn(async move {
        while let Some(msg) = ws_stream.next().await {
            match msg {
                Ok(WsMessage::Text(text)) => {
                    trace!("Received {}", text.as_str());
                    dispatch(&state_clone, &events_tx, text.as_str());
                }
                Ok(WsMessage::Close(reason)) => {
                    info!("Media server connection closed: {:?}", reason);
                    break;
                }
                Ok(_) => (),
                Err(err) => {
                    warn!("Media server recv error: {}", err);
                    break;
                }
            }
        }

        let pending = {
            let mut state = state_clone.lock().unwrap();
            state.closed = true;
            std::mem::take(&mut state.pending)
        };

        for (_, tx) in pending {
            let _ = tx.send(Err(MediaError::Closed));
        }
    });

    let transport = Arc::new(JsonRpcTransport { state, sender });

    let weak = Arc::downgrade(&transport);
    task::spawn(async move {
        let mut interval = tokio::time::interval(KEEPALIVE_INTERVAL);
        interval.tick().await;

        loop {
            interval.tick().await;

            let Some(transport) = weak.upgrade() else {
                break;
            };
            if transport.is_closed() {
                break;
            }

            let ping = transport.request(
                "ping",
                json!({ "interval": KEEPALIVE_INTERVAL.as_millis() as u64 }),
            );
            drop(transport);

            if let Err(err) = ping.await {
                warn!("Media server keepalive failed: {}", err);
            }
        }
    });

    Ok(MediaServerClient::new(transport, events_rx))
}
