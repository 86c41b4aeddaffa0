use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::Role;
use crate::settings::{LocalModelParams, ModelParams, Provider, Settings};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Turn {
    pub round: u32,
    pub role: Role,
    pub agent: String,
    pub content: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

/// Text the user typed between rounds. It is handed to every agent in `round`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Interjection {
    pub round: u32,
    pub content: String,
}

/// Where the turns came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionMeta {
    pub provider: Provider,
    pub base_url: String,
    pub model: String,
    pub model_params: ModelParams,
    pub local: LocalModelParams,
}

impl From<&Settings> for SessionMeta {
    fn from(s: &Settings) -> Self {
        Self {
            provider: s.provider,
            base_url: s.base_url.clone(),
            model: s.model.clone(),
            model_params: s.model_params.clone(),
            local: s.local.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub topic: String,
    pub meta: SessionMeta,
    pub rounds: u32,
    pub concluded: bool,
    pub turns: Vec<Turn>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interjections: Vec<Interjection>,
}

impl Session {
    pub fn new(topic: impl Into<String>, meta: SessionMeta) -> Self {
        let created_at = Utc::now();
        Self {
            id: session_id(created_at),
            created_at,
            topic: topic.into(),
            meta,
            rounds: 0,
            concluded: false,
            turns: Vec::new(),
            interjections: Vec::new(),
        }
    }

    pub fn push_turn(&mut self, turn: Turn) {
        self.rounds = self.rounds.max(turn.round);
        self.turns.push(turn);
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            created_at: self.created_at,
            topic: self.topic.clone(),
            turns: self.turns.len(),
            path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSummary {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub topic: String,
    pub turns: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// `YYYYMMDD_HHMMSS_xxxxxx`: the creation time plus six random hex digits.
fn session_id(at: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}_{}", at.format("%Y%m%d_%H%M%S"), &suffix[..6])
}

/// Session ids only ever contain ASCII digits, letters and underscores.
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
