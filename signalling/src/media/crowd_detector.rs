// SPDX-License-Identifier: MPL-2.0

//! Static configuration of the remote crowd detector filter and the
//! analytics events it raises

use crowddetector_signalling_protocol as p;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::path::Path;

const MODULE: &str = "crowddetector";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read filter configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse filter configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid filter configuration: {0}")]
    Invalid(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
/// A point expressed as a fraction of the frame size
pub struct RelativePoint {
    pub x: f32,
    pub y: f32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
/// Thresholds used by the filter to decide when to raise events for a region
pub struct RegionOfInterestConfig {
    pub occupancy_level_min: i32,
    pub occupancy_level_med: i32,
    pub occupancy_level_max: i32,
    pub occupancy_num_frames_to_event: i32,
    pub fluidity_level_min: i32,
    pub fluidity_level_med: i32,
    pub fluidity_level_max: i32,
    pub fluidity_num_frames_to_event: i32,
    pub send_optical_flow_event: bool,
    pub optical_flow_num_frames_to_event: i32,
    pub optical_flow_num_frames_to_reset: i32,
    pub optical_flow_angle_offset: i32,
}

impl Default for RegionOfInterestConfig {
    fn default() -> Self {
        Self {
            occupancy_level_min: 10,
            occupancy_level_med: 35,
            occupancy_level_max: 65,
            occupancy_num_frames_to_event: 5,
            fluidity_level_min: 10,
            fluidity_level_med: 35,
            fluidity_level_max: 65,
            fluidity_num_frames_to_event: 5,
            send_optical_flow_event: false,
            optical_flow_num_frames_to_event: 3,
            optical_flow_num_frames_to_reset: 3,
            optical_flow_angle_offset: 0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegionOfInterest {
    pub id: String,
    pub points: Vec<RelativePoint>,
    #[serde(default)]
    pub region_of_interest_config: RegionOfInterestConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
/// Regions watched by the crowd detector, shared by every session
pub struct CrowdDetectorConfig {
    pub rois: Vec<RegionOfInterest>,
}

impl Default for CrowdDetectorConfig {
    fn default() -> Self {
        Self {
            rois: vec![RegionOfInterest {
                id: "roi1".to_string(),
                points: vec![
                    RelativePoint { x: 0.0, y: 0.0 },
                    RelativePoint { x: 0.5, y: 0.0 },
                    RelativePoint { x: 0.5, y: 0.5 },
                    RelativePoint { x: 0.0, y: 0.5 },
                ],
                region_of_interest_config: Default::default(),
            }],
        }
    }
}

impl CrowdDetectorConfig {
    /// Load and validate a configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rois.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one region of interest is required".into(),
            ));
        }

        let mut ids = HashSet::new();
        for roi in &self.rois {
            if roi.id.is_empty() {
                return Err(ConfigError::Invalid("region ids must not be empty".into()));
            }

            if !ids.insert(roi.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate region id {}",
                    roi.id
                )));
            }

            if roi.points.len() < 3 {
                return Err(ConfigError::Invalid(format!(
                    "region {} needs at least 3 points, got {}",
                    roi.id,
                    roi.points.len()
                )));
            }

            if let Some(point) = roi
                .points
                .iter()
                .find(|p| !(0.0..=1.0).contains(&p.x) || !(0.0..=1.0).contains(&p.y))
            {
                return Err(ConfigError::Invalid(format!(
                    "region {} has point ({}, {}) outside of the frame",
                    roi.id, point.x, point.y
                )));
            }

            let c = &roi.region_of_interest_config;
            if !(c.occupancy_level_min <= c.occupancy_level_med
                && c.occupancy_level_med <= c.occupancy_level_max)
            {
                return Err(ConfigError::Invalid(format!(
                    "region {} occupancy levels must be ordered min <= med <= max",
                    roi.id
                )));
            }

            if !(c.fluidity_level_min <= c.fluidity_level_med
                && c.fluidity_level_med <= c.fluidity_level_max)
            {
                return Err(ConfigError::Invalid(format!(
                    "region {} fluidity levels must be ordered min <= med <= max",
                    roi.id
                )));
            }
        }

        Ok(())
    }

    /// Constructor parameters of the remote filter, with the type tags the
    /// media server expects on complex values
    pub(crate) fn constructor_params(&self) -> Map<String, Value> {
        let rois = self
            .rois
            .iter()
            .map(|roi| {
                let c = &roi.region_of_interest_config;
                json!({
                    "__module__": MODULE,
                    "__type__": "RegionOfInterest",
                    "id": roi.id,
                    "points": roi.points.iter().map(|p| json!({
                        "__module__": MODULE,
                        "__type__": "RelativePoint",
                        "x": p.x,
                        "y": p.y,
                    })).collect::<Vec<_>>(),
                    "regionOfInterestConfig": {
                        "__module__": MODULE,
                        "__type__": "RegionOfInterestConfig",
                        "occupancyLevelMin": c.occupancy_level_min,
                        "occupancyLevelMed": c.occupancy_level_med,
                        "occupancyLevelMax": c.occupancy_level_max,
                        "occupancyNumFramesToEvent": c.occupancy_num_frames_to_event,
                        "fluidityLevelMin": c.fluidity_level_min,
                        "fluidityLevelMed": c.fluidity_level_med,
                        "fluidityLevelMax": c.fluidity_level_max,
                        "fluidityNumFramesToEvent": c.fluidity_num_frames_to_event,
                        "sendOpticalFlowEvent": c.send_optical_flow_event,
                        "opticalFlowNumFramesToEvent": c.optical_flow_num_frames_to_event,
                        "opticalFlowNumFramesToReset": c.optical_flow_num_frames_to_reset,
                        "opticalFlowAngleOffset": c.optical_flow_angle_offset,
                    },
                })
            })
            .collect::<Vec<_>>();

        let mut params = Map::new();
        params.insert("rois".to_string(), Value::Array(rois));
        params
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Analytics events raised by the crowd detector filter
pub enum CrowdDetectorEvent {
    Direction,
    Fluidity,
    Occupancy,
}

impl CrowdDetectorEvent {
    pub const ALL: [CrowdDetectorEvent; 3] = [Self::Direction, Self::Fluidity, Self::Occupancy];

    /// Event type name used by the media server
    pub fn event_type(self) -> &'static str {
        match self {
            Self::Direction => "CrowdDetectorDirection",
            Self::Fluidity => "CrowdDetectorFluidity",
            Self::Occupancy => "CrowdDetectorOccupancy",
        }
    }

    pub fn into_message(self, event_data: Value) -> p::OutgoingMessage {
        match self {
            Self::Direction => p::OutgoingMessage::CrowdDetectorDirection { event_data },
            Self::Fluidity => p::OutgoingMessage::CrowdDetectorFluidity { event_data },
            Self::Occupancy => p::OutgoingMessage::CrowdDetectorOccupancy { event_data },
        }
    }
}
