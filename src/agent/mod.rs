use serde::{Deserialize, Serialize};

pub mod engine;

/// Phrase the judge must end with once the discussion is over.
pub const CONCLUSION_MARKER: &str = "This concludes the discussion.";
/// Phrase the judge ends with to ask for another round.
pub const CONTINUE_MARKER: &str = "Proceeding to the next round.";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Speaker,
    Verifier,
    Judge,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Speaker, Role::Verifier, Role::Judge];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Speaker => "speaker",
            Role::Verifier => "verifier",
            Role::Judge => "judge",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Role::Speaker => "Speaker",
            Role::Verifier => "Verifier",
            Role::Judge => "Judge",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentProfile {
    pub role: Role,
    pub name: String,
    pub system_prompt: String,
}

impl AgentProfile {
    pub fn new(role: Role, system_prompt: impl Into<String>) -> Self {
        Self { role, name: role.display_name().to_string(), system_prompt: system_prompt.into() }
    }
}

/// The speaker, verifier and judge, in turn order.
pub fn default_panel(max_rounds: u32) -> Vec<AgentProfile> {
    Role::ALL.iter().map(|role| AgentProfile::new(*role, system_prompt(*role, max_rounds))).collect()
}

fn system_prompt(role: Role, max_rounds: u32) -> String {
    match role {
        Role::Speaker => "You are a creative storyteller.\n\
            - Share bold, free-thinking opinions on the user's topic.\n\
            - Use your imagination; vivid or exaggerated language is welcome.\n\
            - Do not be afraid of speculation; creativity matters more than accuracy here.\n\
            - You open the discussion, so set its direction from an original angle.\n\
            - Answer in 150-250 words."
            .to_string(),
        Role::Verifier => "You are a careful verifier.\n\
            - Read the storyteller's statement closely and check its content.\n\
            - Agree openly with the good points.\n\
            - Point out clear factual errors or heavy exaggeration constructively, \
            e.g. \"That is an interesting angle, but in reality...\".\n\
            - Stay cooperative; raise the quality of the discussion without being harsh.\n\
            - Answer in 150-250 words."
            .to_string(),
        Role::Judge => {
            let mut prompt = String::from(
                "You are an impartial judge.\n\
                - Summarise the discussion so far.\n\
                - Weigh both the storyteller's and the verifier's views.\n\
                - Reach a balanced conclusion and offer one or two alternatives.\n\
                - Keep the conclusion concise and practical.\n\
                - Answer in 200-300 words.\n",
            );
            if max_rounds > 1 {
                prompt.push_str(&format!(
                    "- If the topic needs another round of discussion, end with exactly \"{CONTINUE_MARKER}\".\n\
                    - Otherwise end with exactly \"{CONCLUSION_MARKER}\"."
                ));
            } else {
                prompt.push_str(&format!("- Always end with exactly \"{CONCLUSION_MARKER}\"."));
            }
            prompt
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panel_is_in_turn_order() {
        let panel = default_panel(1);
        let roles: Vec<Role> = panel.iter().map(|a| a.role).collect();
        assert_eq!(roles, vec![Role::Speaker, Role::Verifier, Role::Judge]);
        assert_eq!(panel[1].name, "Verifier");
    }

    #[test]
    fn judge_mentions_continue_marker_only_for_multi_round() {
        let single = default_panel(1);
        assert!(single[2].system_prompt.contains(CONCLUSION_MARKER));
        assert!(!single[2].system_prompt.contains(CONTINUE_MARKER));

        let multi = default_panel(3);
        assert!(multi[2].system_prompt.contains(CONTINUE_MARKER));
        assert!(multi[2].system_prompt.contains(CONCLUSION_MARKER));
    }
}
