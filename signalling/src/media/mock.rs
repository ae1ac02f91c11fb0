// SPDX-License-Identifier: MPL-2.0

//! Scripted in-memory media server for tests

use super::{MediaError, MediaEvent, MediaServer, MediaServerClient, RpcTransport};
use futures::channel::{mpsc, oneshot};
use futures::future::BoxFuture;
use futures::prelude::*;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct State {
    calls: Vec<(String, Value)>,
    next_object: u32,
    failures: Vec<(String, String)>,
    gates: HashMap<(String, String), oneshot::Receiver<()>>,
    closed: bool,
}

pub(crate) struct MockTransport {
    state: Mutex<State>,
    events: mpsc::UnboundedSender<MediaEvent>,
}

/// What a call is about: the created type, the invoked operation, or the
/// object for everything else
fn target(method: &str, params: &Value) -> String {
    let key = match method {
        "create" | "subscribe" => "type",
        "invoke" => "operation",
        _ => "object",
    };

    params
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

impl MockTransport {
    pub(crate) fn new() -> (Arc<Self>, MediaServerClient) {
        let (events, events_rx) = mpsc::unbounded();
        let transport = Arc::new(Self {
            state: Default::default(),
            events,
        });
        let client = MediaServerClient::new(transport.clone(), events_rx);

        (transport, client)
    }

    pub(crate) fn media_server(client: MediaServerClient) -> MediaServer {
        MediaServer::with_connector(move || future::ready(Ok(client.clone())).boxed())
    }

    /// Make every later `method` call about `target` fail
    pub(crate) fn fail(&self, method: &str, target: &str) {
        self.state
            .lock()
            .unwrap()
            .failures
            .push((method.to_string(), target.to_string()));
    }

    /// Hold the next `method` call about `target` until the returned sender
    /// fires or is dropped
    pub(crate) fn pause(&self, method: &str, target: &str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.state
            .lock()
            .unwrap()
            .gates
            .insert((method.to_string(), target.to_string()), rx);
        tx
    }

    pub(crate) fn calls(&self, method: &str) -> Vec<Value> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, params)| params.clone())
            .collect()
    }

    /// Sequence of `method:target` for every call so far
    pub(crate) fn history(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .map(|(method, params)| format!("{method}:{}", target(method, params)))
            .collect()
    }

    pub(crate) fn count(&self, method: &str, target_: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(m, params)| m == method && target(m, params) == target_)
            .count()
    }

    /// Ids of the objects created with type `kind`
    pub(crate) fn created(&self, kind: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(m, params)| m == "create" && params["type"] == kind)
            .filter_map(|(_, params)| params.get("__id").and_then(Value::as_str))
            .map(String::from)
            .collect()
    }

    pub(crate) fn emit(&self, object: &str, kind: &str, data: Value) {
        let _ = self.events.unbounded_send(MediaEvent {
            object: object.to_string(),
            kind: kind.to_string(),
            data,
        });
    }

    /// Behave like a transport whose connection was lost
    pub(crate) fn close(&self) {
        self.state.lock().unwrap().closed = true;
    }
}

impl RpcTransport for MockTransport {
    fn request(
        &self,
        method: &'static str,
        mut params: Value,
    ) -> BoxFuture<'static, Result<Value, MediaError>> {
        let mut state = self.state.lock().unwrap();
        let target = target(method, &params);

        let result = if state
            .failures
            .iter()
            .any(|(m, t)| m == method && *t == target)
        {
            Err(MediaError::Rpc {
                code: 40101,
                message: format!("{method} {target} failed"),
            })
        } else {
            state.next_object += 1;
            let n = state.next_object;
            match method {
                "create" => {
                    let id = match params["constructorParams"]["mediaPipeline"].as_str() {
                        Some(pipeline) => format!("{pipeline}/{target}-{n}"),
                        None => format!("{target}-{n}"),
                    };
                    params["__id"] = json!(id);
                    Ok(json!({ "value": id, "sessionId": "mock-session" }))
                }
                "invoke" if target == "processOffer" => Ok(json!({
                    "value": format!("answer to {}", params["operationParams"]["offer"].as_str().unwrap_or_default()),
                })),
                "subscribe" => Ok(json!({ "value": format!("subscription-{n}") })),
                _ => Ok(json!({})),
            }
        };

        let gate = state.gates.remove(&(method.to_string(), target));
        state.calls.push((method.to_string(), params));

        async move {
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            result
        }
        .boxed()
    }

    fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

/// Wait until `condition` holds, panicking after a second
pub(crate) async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
