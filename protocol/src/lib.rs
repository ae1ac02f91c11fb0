// SPDX-License-Identifier: MPL-2.0

/// The protocol spoken between browsers and the crowd detector signalling server
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
/// A network reachability descriptor exchanged between peers
pub struct IceCandidate {
    /// The candidate string
    pub candidate: String,
    /// The media stream identification tag the candidate applies to
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    /// The mline index the candidate applies to
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_m_line_index: Option<u32>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(tag = "id")]
#[serde(rename_all = "camelCase")]
/// Messages received by the server from browsers
pub enum IncomingMessage {
    /// Start a media session with the given offer
    #[serde(rename_all = "camelCase")]
    Start { sdp_offer: String },
    /// Tear down the current media session
    Stop,
    /// A candidate discovered by the browser's peer connection
    OnIceCandidate { candidate: IceCandidate },
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(tag = "id")]
#[serde(rename_all = "camelCase")]
/// Messages sent from the server to browsers
pub enum OutgoingMessage {
    /// Negotiation succeeded, carries the media server's answer
    #[serde(rename_all = "camelCase")]
    StartResponse { sdp_answer: String },
    /// Something went wrong, at any stage
    Error { message: String },
    /// A candidate discovered by the media server endpoint
    IceCandidate { candidate: IceCandidate },
    /// Crowd direction analytics
    CrowdDetectorDirection { event_data: serde_json::Value },
    /// Crowd fluidity analytics
    CrowdDetectorFluidity { event_data: serde_json::Value },
    /// Crowd occupancy analytics
    CrowdDetectorOccupancy { event_data: serde_json::Value },
}
