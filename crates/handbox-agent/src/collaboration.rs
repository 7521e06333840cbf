// ABOUTME: Multi-agent collaboration: fixed rounds of strictly sequential agent turns plus one synthesis.
// ABOUTME: Each agent sees its own history and the latest output of every other agent.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use handbox_core::{ExecutionContext, HandboxError, Round, extract_structured, value_to_text};

use crate::llm::{ModelSettings, invoke_model};
use crate::registry::ProviderRegistry;

const DEFAULT_ROUNDS: u32 = 3;

/// One participant. `provider`/`model` override the shared model settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collaborator {
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

impl Collaborator {
    pub fn new(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            system_prompt: None,
            provider: None,
            model: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollaborationConfig {
    pub agents: Vec<Collaborator>,
    pub rounds: u32,
    /// Agent that writes the synthesis; the last declared agent when absent.
    pub final_agent: Option<String>,
    #[serde(flatten)]
    pub llm: ModelSettings,
}

impl Default for CollaborationConfig {
    fn default() -> Self {
        Self {
            agents: Vec::new(),
            rounds: DEFAULT_ROUNDS,
            final_agent: None,
            llm: ModelSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Consensus {
    pub summary: String,
    pub recommendations: Vec<String>,
    pub confidence: Option<f64>,
    /// Present when the synthesis could not be parsed; `summary` then holds the same text.
    pub raw: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaborationOutcome {
    pub topic: String,
    pub rounds: Vec<Round>,
    pub consensus: Consensus,
    pub final_agent: String,
    /// Provider calls made, including the synthesis.
    pub invocations: u32,
}

pub struct Collaboration {
    config: CollaborationConfig,
}

impl Collaboration {
    pub fn new(config: CollaborationConfig) -> Result<Self, HandboxError> {
        if config.agents.is_empty() {
            return Err(HandboxError::InvalidInput(
                "collaboration needs at least one agent".to_string(),
            ));
        }
        let mut names = HashSet::new();
        for agent in &config.agents {
            if !names.insert(agent.name.as_str()) {
                return Err(HandboxError::InvalidInput(format!(
                    "duplicate agent name '{}'",
                    agent.name
                )));
            }
        }
        if let Some(final_agent) = &config.final_agent
            && !names.contains(final_agent.as_str())
        {
            return Err(HandboxError::InvalidInput(format!(
                "final agent '{}' is not a declared agent",
                final_agent
            )));
        }
        Ok(Self { config })
    }

    pub async fn run(
        &self,
        providers: &ProviderRegistry,
        ctx: &ExecutionContext,
        topic: &str,
    ) -> Result<CollaborationOutcome, HandboxError> {
        let mut rounds: Vec<Round> = Vec::new();
        let mut invocations = 0u32;

        for round_number in 1..=self.config.rounds {
            let mut round = Round::new(round_number);
            for agent in &self.config.agents {
                let prompt = turn_prompt(topic, agent, &rounds, &round);
                let settings = self.settings_for(agent);
                let request = settings.request(Some(agent_system_prompt(agent)), prompt);
                let response = invoke_model(providers, ctx, &settings, request).await?;
                invocations += 1;
                tracing::debug!(
                    trace_id = %ctx.trace_id,
                    round = round_number,
                    agent = %agent.name,
                    "collaboration turn"
                );
                round.push(agent.name.clone(), response.text);
            }
            rounds.push(round);
        }

        let final_agent = self.final_agent()?;
        let settings = self.settings_for(final_agent);
        let request = settings.request(
            Some(agent_system_prompt(final_agent)),
            synthesis_prompt(topic, &rounds),
        );
        let response = invoke_model(providers, ctx, &settings, request).await?;
        invocations += 1;

        let consensus = parse_consensus(&response.text);
        if consensus.raw.is_some() {
            tracing::warn!(trace_id = %ctx.trace_id, agent = %final_agent.name, "synthesis was not structured, using raw text");
        }
        tracing::info!(
            trace_id = %ctx.trace_id,
            rounds = rounds.len(),
            invocations,
            "collaboration finished"
        );

        Ok(CollaborationOutcome {
            topic: topic.to_string(),
            rounds,
            consensus,
            final_agent: final_agent.name.clone(),
            invocations,
        })
    }

    fn final_agent(&self) -> Result<&Collaborator, HandboxError> {
        let chosen = match self.config.final_agent.as_deref() {
            Some(name) => self.config.agents.iter().find(|a| a.name == name),
            None => self.config.agents.last(),
        };
        chosen.ok_or_else(|| HandboxError::InvalidInput("no final agent available".to_string()))
    }

    fn settings_for(&self, agent: &Collaborator) -> ModelSettings {
        let mut settings = self.config.llm.clone();
        if agent.provider.is_some() {
            settings.provider = agent.provider.clone();
        }
        if agent.model.is_some() {
            settings.model = agent.model.clone();
        }
        settings
    }
}

fn agent_system_prompt(agent: &Collaborator) -> String {
    agent.system_prompt.clone().unwrap_or_else(|| {
        if agent.role.is_empty() {
            format!("You are {}, a member of a collaborating team.", agent.name)
        } else {
            format!(
                "You are {}, a member of a collaborating team. Your role: {}",
                agent.name, agent.role
            )
        }
    })
}

/// What `agent` sees: its own earlier outputs in full, plus the most recent
/// output of every other agent (from this round if they already spoke).
fn turn_prompt(topic: &str, agent: &Collaborator, history: &[Round], current: &Round) -> String {
    let mut prompt = format!("Topic: {}\n", topic);

    let own: Vec<(u32, &str)> = history
        .iter()
        .filter_map(|r| r.output_of(&agent.name).map(|o| (r.round_number, o)))
        .collect();
    if !own.is_empty() {
        prompt.push_str("\nYour previous contributions:\n");
        for (round, output) in own {
            prompt.push_str(&format!("[round {}] {}\n", round, output));
        }
    }

    let others: Vec<(&str, &str)> = history
        .iter()
        .chain(std::iter::once(current))
        .flat_map(|r| r.outputs.iter())
        .filter(|m| m.agent != agent.name)
        .fold(Vec::new(), |mut latest: Vec<(&str, &str)>, m| {
            match latest.iter_mut().find(|(name, _)| *name == m.agent) {
                Some(slot) => slot.1 = m.content.as_str(),
                None => latest.push((m.agent.as_str(), m.content.as_str())),
            }
            latest
        });
    if !others.is_empty() {
        prompt.push_str("\nLatest from the other agents:\n");
        for (name, output) in others {
            prompt.push_str(&format!("{}: {}\n", name, output));
        }
    }

    prompt.push_str(&format!(
        "\nRound {}: give your contribution as {}.",
        current.round_number, agent.name
    ));
    prompt
}

fn synthesis_prompt(topic: &str, rounds: &[Round]) -> String {
    let mut prompt = format!("Topic: {}\n\nFull discussion:\n", topic);
    for round in rounds {
        prompt.push_str(&format!("\n## Round {}\n", round.round_number));
        for message in &round.outputs {
            prompt.push_str(&format!("{}: {}\n", message.agent, message.content));
        }
    }
    prompt.push_str(
        "\nSynthesize the discussion into a final decision. Respond with JSON: \
         {\"summary\": \"...\", \"recommendations\": [\"...\"], \"confidence\": <0.0-1.0>}",
    );
    prompt
}

pub fn parse_consensus(text: &str) -> Consensus {
    let raw_fallback = || Consensus {
        summary: text.trim().to_string(),
        recommendations: Vec::new(),
        confidence: None,
        raw: Some(text.to_string()),
    };

    let Ok(Value::Object(fields)) = extract_structured(text) else {
        return raw_fallback();
    };
    let Some(summary) = fields.get("summary").and_then(Value::as_str) else {
        return raw_fallback();
    };

    Consensus {
        summary: summary.to_string(),
        recommendations: fields
            .get("recommendations")
            .and_then(Value::as_array)
            .map(|items| items.iter().map(value_to_text).collect())
            .unwrap_or_default(),
        confidence: fields
            .get("confidence")
            .and_then(Value::as_f64)
            .map(|c| c.clamp(0.0, 1.0)),
        raw: None,
    }
}
