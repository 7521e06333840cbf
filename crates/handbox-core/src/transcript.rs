// ABOUTME: Append-only records of agent execution: ReAct turns and multi-agent rounds.
// ABOUTME: These are the transcripts strategies return to callers alongside their final answer.

use serde::{Deserialize, Serialize};

/// One ReAct iteration. `observation` is absent on the finishing turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentTurn {
    pub iteration: u32,
    pub thought: String,
    pub action: String,
    pub action_input: String,
    pub observation: Option<String>,
}

/// A single agent's contribution within a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub agent: String,
    pub content: String,
}

/// One multi-agent round; outputs are kept in agent declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Round {
    pub round_number: u32,
    pub outputs: Vec<AgentMessage>,
}

impl Round {
    pub fn new(round_number: u32) -> Self {
        Self {
            round_number,
            outputs: Vec::new(),
        }
    }

    pub fn push(&mut self, agent: impl Into<String>, content: impl Into<String>) {
        self.outputs.push(AgentMessage {
            agent: agent.into(),
            content: content.into(),
        });
    }

    pub fn output_of(&self, agent: &str) -> Option<&str> {
        self.outputs
            .iter()
            .find(|m| m.agent == agent)
            .map(|m| m.content.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_preserves_declaration_order() {
        let mut round = Round::new(1);
        round.push("optimist", "ship it");
        round.push("skeptic", "wait");

        assert_eq!(round.outputs[0].agent, "optimist");
        assert_eq!(round.outputs[1].agent, "skeptic");
        assert_eq!(round.output_of("skeptic"), Some("wait"));
        assert_eq!(round.output_of("nobody"), None);
    }
}
