use serde::{Deserialize, Serialize};

use crate::agent::Role;
use crate::session::{Session, Turn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentStats {
    pub role: Role,
    pub agent: String,
    pub turns: usize,
    pub total_chars: usize,
    pub avg_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionStats {
    pub id: String,
    pub topic: String,
    pub rounds: u32,
    pub turns: usize,
    pub concluded: bool,
    pub interjections: usize,
    pub total_chars: usize,
    /// Turn count per round, round 1 first.
    pub turns_per_round: Vec<usize>,
    pub agents: Vec<AgentStats>,
}

/// Totals over every saved session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OverallStats {
    pub sessions: usize,
    pub concluded: usize,
    pub avg_rounds: f64,
    pub avg_turns: f64,
    pub agents: Vec<AgentStats>,
}

fn chars(turn: &Turn) -> usize {
    turn.content.chars().count()
}

/// One entry per role that spoke, in panel order.
fn agent_stats<'a>(turns: impl Iterator<Item = &'a Turn> + Clone) -> Vec<AgentStats> {
    Role::ALL
        .iter()
        .filter_map(|role| {
            let mine: Vec<&Turn> = turns.clone().filter(|t| t.role == *role).collect();
            let first = mine.first()?;
            let total_chars: usize = mine.iter().map(|t| chars(t)).sum();
            Some(AgentStats {
                role: *role,
                agent: first.agent.clone(),
                turns: mine.len(),
                total_chars,
                avg_chars: total_chars / mine.len(),
            })
        })
        .collect()
}

pub fn analyze(session: &Session) -> SessionStats {
    let turns_per_round = (1..=session.rounds)
        .map(|r| session.turns.iter().filter(|t| t.round == r).count())
        .collect();
    SessionStats {
        id: session.id.clone(),
        topic: session.topic.clone(),
        rounds: session.rounds,
        turns: session.turns.len(),
        concluded: session.concluded,
        interjections: session.interjections.len(),
        total_chars: session.turns.iter().map(chars).sum(),
        turns_per_round,
        agents: agent_stats(session.turns.iter()),
    }
}

pub fn summarize(sessions: &[Session]) -> OverallStats {
    let n = sessions.len();
    let avg = |total: usize| if n == 0 { 0.0 } else { total as f64 / n as f64 };
    OverallStats {
        sessions: n,
        concluded: sessions.iter().filter(|s| s.concluded).count(),
        avg_rounds: avg(sessions.iter().map(|s| s.rounds as usize).sum()),
        avg_turns: avg(sessions.iter().map(|s| s.turns.len()).sum()),
        agents: agent_stats(sessions.iter().flat_map(|s| s.turns.iter())),
    }
}
