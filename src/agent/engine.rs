use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;

use crate::agent::{default_panel, AgentProfile, CONCLUSION_MARKER, CONTINUE_MARKER};
use crate::models::{ChatMessage, LanguageModel, LlmError, ModelRequest};
use crate::session::{Interjection, Turn};
use crate::settings::{ModelParams, Settings};

const CONTEXT_ROUNDS: u32 = 3;
const CONTEXT_CHARS: usize = 200;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("topic must not be empty")]
    EmptyTopic,

    #[error("{agent} failed to respond in round {round}")]
    Turn {
        agent: String,
        round: u32,
        #[source]
        source: LlmError,
    },
}

impl EngineError {
    pub fn llm_error(&self) -> Option<&LlmError> {
        match self {
            EngineError::Turn { source, .. } => Some(source),
            EngineError::EmptyTopic => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub turns: Vec<Turn>,
    pub rounds: u32,
    pub concluded: bool,
    pub interjections: Vec<Interjection>,
}

/// What happens after a round in which the judge asked for another one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundDecision {
    Continue,
    Stop,
    /// Continue, handing this text to the next round.
    Input(String),
}

/// Consulted between rounds, only when another round would follow.
#[async_trait]
pub trait RoundControl: Send {
    async fn after_round(&mut self, round: u32, turns: &[Turn]) -> RoundDecision;
}

/// Always continues; used when nobody is asked.
pub struct AutoContinue;

#[async_trait]
impl RoundControl for AutoContinue {
    async fn after_round(&mut self, _round: u32, _turns: &[Turn]) -> RoundDecision {
        RoundDecision::Continue
    }
}

/// Runs the panel over a topic, one blocking model call per turn.
pub struct Discussion<'a, M: LanguageModel + ?Sized> {
    model: &'a M,
    model_name: String,
    params: ModelParams,
    panel: Vec<AgentProfile>,
    max_rounds: u32,
}

impl<'a, M: LanguageModel + ?Sized> Discussion<'a, M> {
    pub fn new(model: &'a M, model_name: impl Into<String>, params: ModelParams) -> Self {
        Self { model, model_name: model_name.into(), params, panel: default_panel(1), max_rounds: 1 }
    }

    pub fn from_settings(model: &'a M, settings: &Settings) -> Self {
        Self::new(model, settings.model.clone(), settings.model_params.clone()).max_rounds(settings.max_rounds)
    }

    /// Also rebuilds the panel so the judge knows whether it may ask for
    /// another round.
    pub fn max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = max_rounds.max(1);
        self.panel = default_panel(self.max_rounds);
        self
    }

    pub async fn run(&self, topic: &str, on_turn: impl FnMut(&Turn)) -> Result<Transcript, EngineError> {
        self.run_with(topic, on_turn, &mut AutoContinue).await
    }

    pub async fn run_with(
        &self,
        topic: &str,
        mut on_turn: impl FnMut(&Turn),
        control: &mut dyn RoundControl,
    ) -> Result<Transcript, EngineError> {
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(EngineError::EmptyTopic);
        }

        let mut turns: Vec<Turn> = Vec::new();
        let mut concluded = false;
        let mut round = 0;
        let mut interjections: Vec<Interjection> = Vec::new();

        while round < self.max_rounds {
            round += 1;
            tracing::info!(round, "starting round");
            let context = context_summary(&turns, round);
            let round_start = turns.len();

            for agent in &self.panel {
                let mut system = agent.system_prompt.clone();
                if let Some(ctx) = &context {
                    system.push_str(ctx);
                }
                let mut messages = vec![ChatMessage::system(system)];
                let added = interjections.iter().find(|i| i.round == round);
                match (round, added) {
                    (1, _) => messages.push(ChatMessage::user(topic)),
                    (_, Some(added)) => messages.push(ChatMessage::user(format!(
                        "Continue the discussion of: {topic}\nThe user adds: {}",
                        added.content
                    ))),
                    (_, None) => messages.push(ChatMessage::user(format!("Continue the discussion of: {topic}"))),
                }
                for earlier in &turns[round_start..] {
                    messages.push(ChatMessage::assistant(format!("{}: {}", earlier.agent, earlier.content)));
                }

                let req = ModelRequest {
                    model: self.model_name.clone(),
                    messages,
                    temperature: Some(self.params.temperature),
                    max_tokens: Some(self.params.max_tokens),
                };
                let started = Instant::now();
                let resp = self.model.generate(req).await.map_err(|source| {
                    tracing::error!(agent = %agent.name, round, error = %source, "turn failed");
                    EngineError::Turn { agent: agent.name.clone(), round, source }
                })?;
                let elapsed = started.elapsed();
                metrics::counter!("triad_turns_total", "role" => agent.role.as_str()).increment(1);
                metrics::histogram!("triad_completion_seconds").record(elapsed.as_secs_f64());

                let content = resp.content.trim().to_string();
                if content.is_empty() {
                    return Err(EngineError::Turn { agent: agent.name.clone(), round, source: LlmError::EmptyResponse });
                }
                tracing::info!(agent = %agent.name, round, chars = content.len(), elapsed_ms = elapsed.as_millis() as u64, "turn complete");

                let turn = Turn {
                    round,
                    role: agent.role,
                    agent: agent.name.clone(),
                    content,
                    model: resp.model,
                    created_at: Utc::now(),
                };
                on_turn(&turn);
                turns.push(turn);
            }

            let Some(last) = turns.last() else { break };
            if contains_marker(&last.content, CONCLUSION_MARKER) {
                concluded = true;
                break;
            }
            if !contains_marker(&last.content, CONTINUE_MARKER) {
                break;
            }
            if round < self.max_rounds {
                match control.after_round(round, &turns).await {
                    RoundDecision::Continue => {}
                    RoundDecision::Stop => {
                        tracing::info!(round, "stopped between rounds");
                        break;
                    }
                    RoundDecision::Input(text) => {
                        interjections.push(Interjection { round: round + 1, content: text.trim().to_string() });
                    }
                }
            }
        }

        Ok(Transcript { turns, rounds: round, concluded, interjections })
    }
}

fn contains_marker(content: &str, marker: &str) -> bool {
    let marker = marker.trim_end_matches('.').to_lowercase();
    content.to_lowercase().contains(&marker)
}

/// Recap of up to `CONTEXT_ROUNDS` rounds before `round`, or `None` in round 1.
fn context_summary(turns: &[Turn], round: u32) -> Option<String> {
    let first = round.saturating_sub(CONTEXT_ROUNDS).max(1);
    let recent: Vec<&Turn> = turns.iter().filter(|t| t.round >= first && t.round < round).collect();
    if recent.is_empty() {
        return None;
    }
    let mut out = String::from("\n\n=== Discussion so far ===\n");
    for t in recent {
        let mut excerpt: String = t.content.chars().take(CONTEXT_CHARS).collect();
        if t.content.chars().count() > CONTEXT_CHARS {
            excerpt.push_str("...");
        }
        out.push_str(&format!("Round {} [{}]: {}\n", t.round, t.agent, excerpt));
    }
    out.push_str("=== End of discussion so far ===\n");
    Some(out)
}
