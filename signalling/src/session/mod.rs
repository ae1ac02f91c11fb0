// SPDX-License-Identifier: MPL-2.0

//! Lifecycle of a client's media session: negotiating a crowd detector
//! pipeline on the media server, feeding it ICE candidates and tearing it
//! down again.

mod registry;

pub use registry::{CandidateRoute, Registry};

use crate::media::{
    CrowdDetectorConfig, CrowdDetectorEvent, CrowdDetectorFilter, MediaError, MediaPipeline,
    MediaServer, WebRtcEndpoint,
};
use crowddetector_signalling_protocol as p;
use futures::channel::{mpsc, oneshot};
use futures::future::BoxFuture;
use futures::prelude::*;
use futures::stream::{BoxStream, SelectAll};
use registry::{EventForwarder, Removed, Session};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("Cannot use undefined sessionId")]
    InvalidSession,
    #[error("Session {0} is already started, stop it first")]
    AlreadyActive(String),
    #[error("Media server unavailable: {0}")]
    ServiceUnavailable(MediaError),
    #[error("Failed to create media pipeline: {0}")]
    PipelineCreationFailed(MediaError),
    #[error("Failed to create media element: {0}")]
    ElementCreationFailed(MediaError),
    #[error("Failed to connect media elements: {0}")]
    WiringFailed(MediaError),
    #[error("Failed to subscribe to media events: {0}")]
    SubscriptionFailed(MediaError),
    #[error("Failed to negotiate media: {0}")]
    NegotiationFailed(MediaError),
    #[error("Session {0} was stopped during negotiation")]
    Stopped(String),
}

/// Where a session's messages for its client go
pub type Notifier = mpsc::UnboundedSender<p::OutgoingMessage>;

#[derive(Clone)]
/// Drives every session against the shared media server
pub struct SessionManager {
    media: MediaServer,
    filter_config: Arc<CrowdDetectorConfig>,
    registry: Arc<Registry>,
}

impl SessionManager {
    pub fn new(media: MediaServer, filter_config: CrowdDetectorConfig) -> Self {
        Self {
            media,
            filter_config: Arc::new(filter_config),
            registry: Default::default(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Negotiate a session for `session_id` from the client's offer.
    ///
    /// The session id is claimed right away, before the returned future is
    /// polled. On success the answer is sent to `notifier` before any event,
    /// and also returned.
    pub fn start(
        &self,
        session_id: &str,
        sdp_offer: String,
        notifier: Notifier,
    ) -> BoxFuture<'static, Result<String, SessionError>> {
        if session_id.is_empty() {
            return future::ready(Err(SessionError::InvalidSession)).boxed();
        }

        let generation = match self.registry.reserve(session_id) {
            Ok(generation) => generation,
            Err(err) => return future::ready(Err(err)).boxed(),
        };

        let this = self.clone();
        let session_id = session_id.to_string();
        async move {
            let res = this
                .negotiate(&session_id, generation, &sdp_offer, notifier)
                .await;

            if let Err(ref err) = res {
                warn!(session_id = %session_id, "Negotiation failed: {}", err);
                this.registry.abandon(&session_id, generation);
            }

            res
        }
        .boxed()
    }

    #[instrument(level = "debug", skip(self, sdp_offer, notifier))]
    async fn negotiate(
        &self,
        session_id: &str,
        generation: u64,
        sdp_offer: &str,
        notifier: Notifier,
    ) -> Result<String, SessionError> {
        let client = self
            .media
            .client()
            .await
            .map_err(SessionError::ServiceUnavailable)?;

        let pipeline = client
            .create_pipeline()
            .await
            .map_err(SessionError::PipelineCreationFailed)?;

        match self
            .build(session_id, generation, &pipeline, sdp_offer, notifier)
            .await
        {
            Ok(answer) => Ok(answer),
            Err(err) => {
                if let Err(release_err) = pipeline.release().await {
                    warn!(pipeline = %pipeline.id(), "Failed to release pipeline: {}", release_err);
                }
                Err(err)
            }
        }
    }

    fn ensure_current(&self, session_id: &str, generation: u64) -> Result<(), SessionError> {
        if self.registry.is_current(session_id, generation) {
            Ok(())
        } else {
            info!(session_id, "stop requested during negotiation");
            Err(SessionError::Stopped(session_id.to_string()))
        }
    }

    /// Everything after pipeline creation. Any error returned here makes the
    /// caller release the pipeline.
    async fn build(
        &self,
        session_id: &str,
        generation: u64,
        pipeline: &MediaPipeline,
        sdp_offer: &str,
        notifier: Notifier,
    ) -> Result<String, SessionError> {
        self.ensure_current(session_id, generation)?;

        let endpoint = pipeline
            .create_webrtc_endpoint()
            .await
            .map_err(SessionError::ElementCreationFailed)?;
        let filter = pipeline
            .create_crowd_detector(&self.filter_config)
            .await
            .map_err(SessionError::ElementCreationFailed)?;

        let (candidates_tx, candidates_rx) = mpsc::unbounded();
        tokio::spawn(forward_candidates(
            session_id.to_string(),
            endpoint.clone(),
            candidates_rx,
        ));
        if !self
            .registry
            .attach_endpoint(session_id, generation, candidates_tx)
        {
            return Err(SessionError::Stopped(session_id.to_string()));
        }

        endpoint
            .connect(&filter)
            .await
            .map_err(SessionError::WiringFailed)?;
        filter
            .connect(&endpoint)
            .await
            .map_err(SessionError::WiringFailed)?;
        self.ensure_current(session_id, generation)?;

        let events = subscribe(&endpoint, &filter)
            .await
            .map_err(SessionError::SubscriptionFailed)?;
        self.ensure_current(session_id, generation)?;

        let answer = endpoint
            .process_offer(sdp_offer)
            .await
            .map_err(SessionError::NegotiationFailed)?;
        self.ensure_current(session_id, generation)?;

        // Events wait for the answer, which is only sent once the session is
        // active
        let (answered_tx, answered_rx) = oneshot::channel::<()>();
        let events_notifier = notifier.clone();
        let forwarder = EventForwarder::new(tokio::spawn(async move {
            if answered_rx.await.is_ok() {
                let _ = events.map(Ok).forward(events_notifier).await;
            }
        }));

        let session = Session {
            pipeline: pipeline.clone(),
            endpoint: endpoint.clone(),
            _events: forwarder,
        };
        if self
            .registry
            .activate(session_id, generation, session)
            .is_err()
        {
            return Err(SessionError::Stopped(session_id.to_string()));
        }

        let _ = notifier.unbounded_send(p::OutgoingMessage::StartResponse {
            sdp_answer: answer.clone(),
        });
        let _ = answered_tx.send(());

        let session_id = session_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = endpoint.gather_candidates().await {
                warn!(session_id = %session_id, "Failed to gather candidates: {}", err);
                let _ = notifier.unbounded_send(p::OutgoingMessage::Error {
                    message: format!("Failed to gather candidates: {err}"),
                });
            }
        });

        Ok(answer)
    }

    /// Tear down whatever exists for `session_id`.
    ///
    /// The registry is updated right away; the returned future releases the
    /// remote pipeline. Unknown or already stopped ids are a no-op.
    pub fn stop(&self, session_id: &str) -> BoxFuture<'static, ()> {
        match self.registry.remove(session_id) {
            Removed::Active(session) => {
                let session_id = session_id.to_string();
                async move {
                    info!(session_id = %session_id, "Releasing pipeline");
                    let Session { pipeline, .. } = session;
                    if let Err(err) = pipeline.release().await {
                        warn!(session_id = %session_id, "Failed to release pipeline: {}", err);
                    }
                }
                .boxed()
            }
            Removed::Negotiating => {
                debug!(session_id, "Stopping session still negotiating");
                future::ready(()).boxed()
            }
            Removed::Nothing => future::ready(()).boxed(),
        }
    }

    /// A candidate from the client: forwarded to the endpoint when it exists,
    /// queued otherwise
    pub fn on_ice_candidate(&self, session_id: &str, candidate: p::IceCandidate) -> CandidateRoute {
        let route = self.registry.add_candidate(session_id, candidate);
        debug!(session_id, "candidate {:?}", route);
        route
    }
}

/// Subscribe to every event a session forwards to its client
async fn subscribe(
    endpoint: &WebRtcEndpoint,
    filter: &CrowdDetectorFilter,
) -> Result<SelectAll<BoxStream<'static, p::OutgoingMessage>>, MediaError> {
    let mut events = SelectAll::new();

    for event in CrowdDetectorEvent::ALL {
        events.push(filter.subscribe_event(event).await?.boxed());
    }

    events.push(
        endpoint
            .subscribe_ice_candidates()
            .await?
            .map(|candidate| p::OutgoingMessage::IceCandidate { candidate })
            .boxed(),
    );

    Ok(events)
}

/// Hand candidates to the endpoint one at a time, in arrival order
async fn forward_candidates(
    session_id: String,
    endpoint: WebRtcEndpoint,
    mut candidates: mpsc::UnboundedReceiver<p::IceCandidate>,
) {
    while let Some(candidate) = candidates.next().await {
        if let Err(err) = endpoint.add_ice_candidate(&candidate).await {
            warn!(session_id = %session_id, "Failed to add candidate: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::mock::{eventually, MockTransport};
    use serde_json::json;

    fn manager() -> (Arc<MockTransport>, SessionManager) {
        let (mock, client) = MockTransport::new();
        let manager = SessionManager::new(
            MockTransport::media_server(client),
            CrowdDetectorConfig::default(),
        );

        (mock, manager)
    }

    fn candidate(n: u32) -> p::IceCandidate {
        p::IceCandidate {
            candidate: format!("candidate:{n} 1 UDP 2122252543 10.0.0.{n} 5000 typ host"),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }
    }

    fn added_candidates(mock: &MockTransport) -> Vec<String> {
        mock.calls("invoke")
            .into_iter()
            .filter(|params| params["operation"] == "addIceCandidate")
            .map(|params| {
                params["operationParams"]["candidate"]["candidate"]
                    .as_str()
                    .unwrap()
                    .to_string()
            })
            .collect()
    }

    #[test_log::test(tokio::test)]
    async fn test_start() {
        let (mock, manager) = manager();
        let (tx, mut rx) = mpsc::unbounded();

        let answer = manager.start("s1", "offer".into(), tx).await.unwrap();

        assert_eq!(answer, "answer to offer");
        assert_eq!(
            rx.next().await.unwrap(),
            p::OutgoingMessage::StartResponse {
                sdp_answer: "answer to offer".to_string()
            }
        );
        assert!(manager.registry().is_active("s1"));
        assert_eq!(manager.registry().len(), 1);

        // candidate gathering runs in the background, after the answer
        let history = mock
            .history()
            .into_iter()
            .filter(|call| call != "invoke:gatherCandidates")
            .collect::<Vec<_>>();
        assert_eq!(
            history,
            vec![
                "create:MediaPipeline",
                "create:WebRtcEndpoint",
                "create:CrowdDetectorFilter",
                "invoke:connect",
                "invoke:connect",
                "subscribe:CrowdDetectorDirection",
                "subscribe:CrowdDetectorFluidity",
                "subscribe:CrowdDetectorOccupancy",
                "subscribe:OnIceCandidate",
                "invoke:processOffer",
            ]
        );

        let endpoint = mock.created("WebRtcEndpoint").remove(0);
        let filter = mock.created("CrowdDetectorFilter").remove(0);
        let connects = mock.calls("invoke");
        assert_eq!(connects[0]["object"], endpoint.as_str());
        assert_eq!(connects[0]["operationParams"]["sink"], filter.as_str());
        assert_eq!(connects[1]["object"], filter.as_str());
        assert_eq!(connects[1]["operationParams"]["sink"], endpoint.as_str());

        eventually(|| mock.count("invoke", "gatherCandidates") == 1).await;
    }

    #[tokio::test]
    async fn test_start_without_session_id() {
        let (mock, manager) = manager();
        let (tx, _rx) = mpsc::unbounded();

        let err = manager.start("", "offer".into(), tx).await.unwrap_err();

        assert!(matches!(err, SessionError::InvalidSession));
        assert!(mock.history().is_empty());
        assert!(manager.registry().is_empty());
    }

    #[tokio::test]
    async fn test_start_twice() {
        let (mock, manager) = manager();
        let (tx, _rx) = mpsc::unbounded();

        manager.start("s1", "offer".into(), tx.clone()).await.unwrap();
        let err = manager.start("s1", "offer".into(), tx).await.unwrap_err();

        assert!(matches!(err, SessionError::AlreadyActive(_)));
        assert_eq!(mock.count("create", "MediaPipeline"), 1);
        assert_eq!(manager.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let (mock, manager) = manager();
        let (tx, _rx) = mpsc::unbounded();

        manager.start("s1", "offer".into(), tx.clone()).await.unwrap();
        manager.stop("s1").await;
        manager.start("s1", "offer".into(), tx).await.unwrap();

        let pipelines = mock.created("MediaPipeline");
        assert_eq!(pipelines.len(), 2);
        assert_eq!(mock.count("release", &pipelines[0]), 1);
        assert_eq!(mock.count("release", &pipelines[1]), 0);
        assert!(manager.registry().is_active("s1"));
    }

    #[tokio::test]
    async fn test_service_unavailable() {
        let manager = SessionManager::new(
            MediaServer::with_connector(|| {
                future::ready(Err(MediaError::Unreachable {
                    uri: "ws://localhost:8888/kurento".into(),
                    details: "connection refused".into(),
                }))
                .boxed()
            }),
            CrowdDetectorConfig::default(),
        );
        let (tx, _rx) = mpsc::unbounded();

        let err = manager.start("s1", "offer".into(), tx).await.unwrap_err();

        assert!(matches!(err, SessionError::ServiceUnavailable(_)));
        assert!(manager.registry().is_empty());
    }

    #[tokio::test]
    async fn test_pipeline_creation_failure() {
        let (mock, manager) = manager();
        mock.fail("create", "MediaPipeline");
        let (tx, _rx) = mpsc::unbounded();

        let err = manager.start("s1", "offer".into(), tx).await.unwrap_err();

        assert!(matches!(err, SessionError::PipelineCreationFailed(_)));
        assert!(mock.calls("release").is_empty());
        assert!(manager.registry().is_empty());
    }

    #[tokio::test]
    async fn test_element_creation_failure_releases_pipeline() {
        let (mock, manager) = manager();
        mock.fail("create", "CrowdDetectorFilter");
        let (tx, _rx) = mpsc::unbounded();

        let err = manager.start("s1", "offer".into(), tx).await.unwrap_err();

        assert!(matches!(err, SessionError::ElementCreationFailed(_)));
        let pipeline = mock.created("MediaPipeline").remove(0);
        assert_eq!(mock.count("release", &pipeline), 1);
        assert_eq!(mock.calls("release").len(), 1);
        assert!(manager.registry().is_empty());
    }

    #[tokio::test]
    async fn test_wiring_failure_releases_pipeline() {
        let (mock, manager) = manager();
        mock.fail("invoke", "connect");
        let (tx, _rx) = mpsc::unbounded();

        let err = manager.start("s1", "offer".into(), tx).await.unwrap_err();

        assert!(matches!(err, SessionError::WiringFailed(_)));
        assert_eq!(mock.calls("release").len(), 1);
        assert_eq!(mock.count("invoke", "processOffer"), 0);
        assert!(manager.registry().is_empty());
    }

    #[tokio::test]
    async fn test_negotiation_failure_releases_pipeline() {
        let (mock, manager) = manager();
        mock.fail("invoke", "processOffer");
        let (tx, mut rx) = mpsc::unbounded();

        let err = manager.start("s1", "offer".into(), tx).await.unwrap_err();

        assert!(matches!(err, SessionError::NegotiationFailed(_)));
        assert_eq!(mock.calls("release").len(), 1);
        assert!(manager.registry().is_empty());
        assert!(rx.try_next().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_gather_failure_keeps_session() {
        let (mock, manager) = manager();
        mock.fail("invoke", "gatherCandidates");
        let (tx, mut rx) = mpsc::unbounded();

        manager.start("s1", "offer".into(), tx).await.unwrap();

        assert!(matches!(
            rx.next().await.unwrap(),
            p::OutgoingMessage::StartResponse { .. }
        ));
        assert!(matches!(
            rx.next().await.unwrap(),
            p::OutgoingMessage::Error { .. }
        ));
        assert!(manager.registry().is_active("s1"));
        assert!(mock.calls("release").is_empty());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (mock, manager) = manager();
        let (tx, _rx) = mpsc::unbounded();

        manager.stop("never-started").await;
        assert!(mock.history().is_empty());

        manager.start("s1", "offer".into(), tx).await.unwrap();
        manager.stop("s1").await;
        manager.stop("s1").await;

        assert_eq!(mock.calls("release").len(), 1);
        assert!(manager.registry().is_empty());
    }

    #[tokio::test]
    async fn test_stop_during_negotiation() {
        let (mock, manager) = manager();
        let resume = mock.pause("invoke", "processOffer");
        let (tx, mut rx) = mpsc::unbounded();

        let start = tokio::spawn(manager.start("s1", "offer".into(), tx));
        eventually(|| mock.count("invoke", "processOffer") == 1).await;

        manager.stop("s1").await;
        assert!(manager.registry().is_empty());
        resume.send(()).unwrap();

        let err = start.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::Stopped(_)));
        assert_eq!(mock.calls("release").len(), 1);
        assert!(manager.registry().is_empty());

        // a stopped negotiation never answers
        assert!(rx.next().await.is_none());
    }

    #[tokio::test]
    async fn test_answer_precedes_early_events() {
        let (mock, manager) = manager();
        let resume = mock.pause("invoke", "processOffer");
        let (tx, mut rx) = mpsc::unbounded();

        let start = tokio::spawn(manager.start("s1", "offer".into(), tx));
        eventually(|| mock.count("invoke", "processOffer") == 1).await;

        let filter = mock.created("CrowdDetectorFilter").remove(0);
        mock.emit(&filter, "CrowdDetectorOccupancy", json!({"occupancyPercentage": 10.0}));
        tokio::task::yield_now().await;

        resume.send(()).unwrap();
        start.await.unwrap().unwrap();

        assert_eq!(
            rx.next().await.unwrap(),
            p::OutgoingMessage::StartResponse {
                sdp_answer: "answer to offer".to_string()
            }
        );
        assert_eq!(
            rx.next().await.unwrap(),
            p::OutgoingMessage::CrowdDetectorOccupancy {
                event_data: json!({"occupancyPercentage": 10.0})
            }
        );
        assert!(manager.registry().is_active("s1"));
    }

    #[tokio::test]
    async fn test_early_candidates_are_replayed_in_order() {
        let (mock, manager) = manager();
        let (tx, _rx) = mpsc::unbounded();

        for n in 1..=3 {
            assert_eq!(
                manager.on_ice_candidate("s1", candidate(n)),
                CandidateRoute::Queued
            );
        }

        manager.start("s1", "offer".into(), tx).await.unwrap();
        assert_eq!(
            manager.on_ice_candidate("s1", candidate(4)),
            CandidateRoute::Forwarded
        );

        eventually(|| added_candidates(&mock).len() == 4).await;
        assert_eq!(
            added_candidates(&mock),
            (1..=4).map(|n| candidate(n).candidate).collect::<Vec<_>>()
        );
        assert_eq!(manager.registry().pending_candidates("s1"), 0);

        let endpoint = manager.registry().endpoint("s1").unwrap();
        let first = mock
            .calls("invoke")
            .into_iter()
            .find(|params| params["operation"] == "addIceCandidate")
            .unwrap();
        assert_eq!(first["object"], endpoint.id());
        assert_eq!(first["operationParams"]["candidate"]["__type__"], "IceCandidate");
    }

    #[tokio::test]
    async fn test_candidates_during_negotiation() {
        let (mock, manager) = manager();
        let resume = mock.pause("invoke", "processOffer");
        let (tx, _rx) = mpsc::unbounded();

        manager.on_ice_candidate("s1", candidate(1));
        let start = tokio::spawn(manager.start("s1", "offer".into(), tx));
        eventually(|| mock.count("invoke", "processOffer") == 1).await;

        assert_eq!(
            manager.on_ice_candidate("s1", candidate(2)),
            CandidateRoute::Forwarded
        );
        resume.send(()).unwrap();
        start.await.unwrap().unwrap();

        eventually(|| added_candidates(&mock).len() == 2).await;
        assert_eq!(
            added_candidates(&mock),
            vec![candidate(1).candidate, candidate(2).candidate]
        );
    }

    #[tokio::test]
    async fn test_stop_discards_queued_candidates() {
        let (mock, manager) = manager();
        let (tx, _rx) = mpsc::unbounded();

        manager.on_ice_candidate("s1", candidate(1));
        manager.stop("s1").await;
        manager.start("s1", "offer".into(), tx).await.unwrap();

        tokio::task::yield_now().await;
        assert!(added_candidates(&mock).is_empty());
    }

    #[tokio::test]
    async fn test_events_are_forwarded() {
        let (mock, manager) = manager();
        let (tx, mut rx) = mpsc::unbounded();

        manager.start("s1", "offer".into(), tx).await.unwrap();
        assert!(matches!(
            rx.next().await.unwrap(),
            p::OutgoingMessage::StartResponse { .. }
        ));

        let filter = mock.created("CrowdDetectorFilter").remove(0);
        let endpoint = mock.created("WebRtcEndpoint").remove(0);

        mock.emit(&filter, "CrowdDetectorDirection", json!({"directionAngle": 45.0}));
        assert_eq!(
            rx.next().await.unwrap(),
            p::OutgoingMessage::CrowdDetectorDirection {
                event_data: json!({"directionAngle": 45.0})
            }
        );

        mock.emit(&filter, "CrowdDetectorFluidity", json!({"fluidityPercentage": 20.0}));
        assert_eq!(
            rx.next().await.unwrap(),
            p::OutgoingMessage::CrowdDetectorFluidity {
                event_data: json!({"fluidityPercentage": 20.0})
            }
        );

        mock.emit(&filter, "CrowdDetectorOccupancy", json!({"occupancyPercentage": 60.0}));
        assert_eq!(
            rx.next().await.unwrap(),
            p::OutgoingMessage::CrowdDetectorOccupancy {
                event_data: json!({"occupancyPercentage": 60.0})
            }
        );

        mock.emit(
            &endpoint,
            "OnIceCandidate",
            json!({"candidate": {
                "__module__": "kurento",
                "__type__": "IceCandidate",
                "candidate": "candidate:9 1 UDP 1 10.0.0.9 9 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0
            }}),
        );
        assert_eq!(
            rx.next().await.unwrap(),
            p::OutgoingMessage::IceCandidate {
                candidate: p::IceCandidate {
                    candidate: "candidate:9 1 UDP 1 10.0.0.9 9 typ host".to_string(),
                    sdp_mid: Some("0".to_string()),
                    sdp_m_line_index: Some(0),
                }
            }
        );

        manager.stop("s1").await;
        mock.emit(&filter, "CrowdDetectorDirection", json!({"directionAngle": 0.0}));
        tokio::task::yield_now().await;
        assert!(rx.try_next().map_or(true, |msg| msg.is_none()));
    }
}
