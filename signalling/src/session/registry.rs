// SPDX-License-Identifier: MPL-2.0

//! Which sessions exist, and the ICE candidates waiting for their endpoint.
//!
//! Every check-then-act sequence happens under the single registry lock, so
//! operations on the same session id are atomic with respect to each other.

use super::SessionError;
use crate::media::{MediaPipeline, WebRtcEndpoint};
use crowddetector_signalling_protocol as p;
use futures::channel::mpsc;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Forwards a session's media events to its client until dropped
pub(crate) struct EventForwarder(JoinHandle<()>);

impl EventForwarder {
    pub(crate) fn new(handle: JoinHandle<()>) -> Self {
        Self(handle)
    }
}

impl Drop for EventForwarder {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// A negotiated session: its pipeline and endpoint live and die together
pub(crate) struct Session {
    pub(crate) pipeline: MediaPipeline,
    pub(crate) endpoint: WebRtcEndpoint,
    pub(crate) _events: EventForwarder,
}

enum Slot {
    Negotiating {
        generation: u64,
        /// Set once the endpoint exists and the pending queue was drained
        candidates: Option<mpsc::UnboundedSender<p::IceCandidate>>,
    },
    Active {
        generation: u64,
        session: Session,
        candidates: mpsc::UnboundedSender<p::IceCandidate>,
    },
}

impl Slot {
    fn generation(&self) -> u64 {
        match self {
            Slot::Negotiating { generation, .. } | Slot::Active { generation, .. } => *generation,
        }
    }
}

/// What [`Registry::remove`] took out
pub(crate) enum Removed {
    Nothing,
    Negotiating,
    Active(Session),
}

/// Where [`Registry::add_candidate`] put a candidate
#[derive(Debug, PartialEq, Eq)]
pub enum CandidateRoute {
    Forwarded,
    Queued,
}

#[derive(Default)]
struct Inner {
    next_generation: u64,
    slots: HashMap<String, Slot>,
    pending: HashMap<String, VecDeque<p::IceCandidate>>,
}

#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    /// Claim `session_id` for a new negotiation, identified by the returned
    /// generation
    pub(crate) fn reserve(&self, session_id: &str) -> Result<u64, SessionError> {
        let mut inner = self.inner.lock().unwrap();

        if inner.slots.contains_key(session_id) {
            return Err(SessionError::AlreadyActive(session_id.to_string()));
        }

        inner.next_generation += 1;
        let generation = inner.next_generation;
        inner.slots.insert(
            session_id.to_string(),
            Slot::Negotiating {
                generation,
                candidates: None,
            },
        );

        Ok(generation)
    }

    /// Whether the negotiation `generation` still owns `session_id`
    pub(crate) fn is_current(&self, session_id: &str, generation: u64) -> bool {
        self.inner
            .lock()
            .unwrap()
            .slots
            .get(session_id)
            .is_some_and(|slot| slot.generation() == generation)
    }

    /// Replay the candidates queued for `session_id` into `candidates`, then
    /// route every later candidate there too. Both happen under the lock, so
    /// a live candidate can never overtake a queued one.
    pub(crate) fn attach_endpoint(
        &self,
        session_id: &str,
        generation: u64,
        candidates: mpsc::UnboundedSender<p::IceCandidate>,
    ) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Inner { slots, pending, .. } = &mut *inner;

        match slots.get_mut(session_id) {
            Some(Slot::Negotiating {
                generation: current,
                candidates: slot_candidates,
            }) if *current == generation => {
                if let Some(queue) = pending.remove(session_id) {
                    debug!(session_id, "Draining {} queued candidates", queue.len());
                    for candidate in queue {
                        let _ = candidates.unbounded_send(candidate);
                    }
                }
                *slot_candidates = Some(candidates);
                true
            }
            _ => false,
        }
    }

    /// Turn the negotiation `generation` into an active session. Hands the
    /// session back if the negotiation was stopped in the meantime.
    pub(crate) fn activate(
        &self,
        session_id: &str,
        generation: u64,
        session: Session,
    ) -> Result<(), Session> {
        let mut inner = self.inner.lock().unwrap();

        let Some(slot) = inner.slots.remove(session_id) else {
            return Err(session);
        };

        match slot {
            Slot::Negotiating {
                generation: current,
                candidates: Some(candidates),
            } if current == generation => {
                info!(session_id, pipeline = %session.pipeline.id(), "session active");
                inner.slots.insert(
                    session_id.to_string(),
                    Slot::Active {
                        generation,
                        session,
                        candidates,
                    },
                );
                Ok(())
            }
            slot => {
                inner.slots.insert(session_id.to_string(), slot);
                Err(session)
            }
        }
    }

    /// Forget a failed negotiation, if it still owns `session_id`
    pub(crate) fn abandon(&self, session_id: &str, generation: u64) {
        let mut inner = self.inner.lock().unwrap();

        if inner
            .slots
            .get(session_id)
            .is_some_and(|slot| slot.generation() == generation)
        {
            inner.slots.remove(session_id);
        }
    }

    /// Remove whatever exists for `session_id`, queued candidates included
    pub(crate) fn remove(&self, session_id: &str) -> Removed {
        let mut inner = self.inner.lock().unwrap();

        inner.pending.remove(session_id);

        match inner.slots.remove(session_id) {
            None => Removed::Nothing,
            Some(Slot::Negotiating { .. }) => Removed::Negotiating,
            Some(Slot::Active { session, .. }) => Removed::Active(session),
        }
    }

    /// Hand a candidate to the session's endpoint, or queue it until the
    /// endpoint exists
    pub fn add_candidate(&self, session_id: &str, candidate: p::IceCandidate) -> CandidateRoute {
        let mut inner = self.inner.lock().unwrap();

        let sender = match inner.slots.get(session_id) {
            Some(Slot::Negotiating {
                candidates: Some(candidates),
                ..
            })
            | Some(Slot::Active { candidates, .. }) => Some(candidates.clone()),
            _ => None,
        };

        match sender {
            Some(sender) if sender.unbounded_send(candidate.clone()).is_ok() => {
                CandidateRoute::Forwarded
            }
            _ => {
                inner
                    .pending
                    .entry(session_id.to_string())
                    .or_default()
                    .push_back(candidate);
                CandidateRoute::Queued
            }
        }
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        matches!(
            self.inner.lock().unwrap().slots.get(session_id),
            Some(Slot::Active { .. })
        )
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.inner.lock().unwrap().slots.contains_key(session_id)
    }

    /// Number of sessions, negotiating or active
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_candidates(&self, session_id: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .pending
            .get(session_id)
            .map_or(0, VecDeque::len)
    }

    pub fn endpoint(&self, session_id: &str) -> Option<WebRtcEndpoint> {
        match self.inner.lock().unwrap().slots.get(session_id) {
            Some(Slot::Active { session, .. }) => Some(session.endpoint.clone()),
            _ => None,
        }
    }
}
