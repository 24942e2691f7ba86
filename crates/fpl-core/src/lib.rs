//! Core domain model for the FPL assistant: the store-side shape of every synced entity.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "fpl-core";

/// Playing position, derived from the upstream `element_type` code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Position {
    #[serde(rename = "GK")]
    Goalkeeper,
    #[serde(rename = "DEF")]
    Defender,
    #[serde(rename = "MID")]
    Midfielder,
    #[serde(rename = "FWD")]
    Forward,
    #[serde(rename = "UNK")]
    Unknown,
}

impl Position {
    pub fn from_element_type(element_type: i32) -> Self {
        match element_type {
            1 => Self::Goalkeeper,
            2 => Self::Defender,
            3 => Self::Midfielder,
            4 => Self::Forward,
            _ => Self::Unknown,
        }
    }

    /// Short code used in the persisted row.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Goalkeeper => "GK",
            Self::Defender => "DEF",
            Self::Midfielder => "MID",
            Self::Forward => "FWD",
            Self::Unknown => "UNK",
        }
    }

    /// Inverse of [`Position::code`]; anything unrecognised reads back as `Unknown`.
    pub fn from_code(code: &str) -> Self {
        match code.trim() {
            "GK" => Self::Goalkeeper,
            "DEF" => Self::Defender,
            "MID" => Self::Midfielder,
            "FWD" => Self::Forward,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub id: i32,
    pub name: String,
    pub short_name: String,
    pub code: i32,
}

/// Persisted player row.
///
/// `start_price` is captured on first insert and carried forward on every later
/// update; `current_price` always mirrors the latest feed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    pub id: i32,
    pub first_name: String,
    pub second_name: String,
    pub web_name: String,
    pub team_id: i32,
    pub position: Position,
    pub start_price: f64,
    pub current_price: f64,
    pub total_points: i32,
    pub form: String,
    pub selected_by_percent: f64,
    pub transfers_in: i64,
    pub transfers_in_event: i64,
    pub transfers_out: i64,
    pub transfers_out_event: i64,
    pub value_form: f64,
    pub event_points: i32,
    pub ict_index: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fixture {
    pub id: i32,
    pub event: Option<i32>,
    pub kickoff_time: Option<DateTime<Utc>>,
    pub started: bool,
    pub finished: bool,
    pub provisional_start_time: bool,
    pub team_h_id: i32,
    pub team_a_id: i32,
    pub team_h_score: Option<i32>,
    pub team_a_score: Option<i32>,
    pub team_h_difficulty: i32,
    pub team_a_difficulty: i32,
    pub minutes: i32,
    pub pulse_id: i64,
    pub code: i64,
}

/// Chip definition. `overrides` is stored as an opaque JSON blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chip {
    pub id: i32,
    pub name: String,
    pub number: i32,
    pub start_event: i32,
    pub stop_event: i32,
    pub chip_type: String,
    pub overrides: JsonValue,
}
