// ABOUTME: Stateless single-call reviewer producing a review, per-criterion scores and suggestions.
// ABOUTME: Criteria are supplied or inferred from the content; unparseable reviews fall back to raw text.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use handbox_core::{ExecutionContext, HandboxError, extract_structured, value_to_text};

use crate::llm::{ModelSettings, invoke_model};
use crate::registry::ProviderRegistry;

const DEFAULT_SCALE: f64 = 10.0;
const CODE_MARKERS: &[&str] = &[
    "fn ", "def ", "class ", "function ", "import ", "=>", "#include", "return ", "};",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CriticConfig {
    pub criteria: Vec<String>,
    /// Scores run from 0 to this value.
    pub scale: f64,
    #[serde(flatten)]
    pub llm: ModelSettings,
}

impl Default for CriticConfig {
    fn default() -> Self {
        Self {
            criteria: Vec::new(),
            scale: DEFAULT_SCALE,
            llm: ModelSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Critique {
    pub review: String,
    pub scores: BTreeMap<String, f64>,
    pub suggestions: Vec<String>,
    pub criteria: Vec<String>,
    pub raw: Option<String>,
}

impl Critique {
    pub fn average_score(&self) -> Option<f64> {
        if self.scores.is_empty() {
            return None;
        }
        Some(self.scores.values().sum::<f64>() / self.scores.len() as f64)
    }
}

pub struct Critic {
    config: CriticConfig,
}

impl Critic {
    pub fn new(config: CriticConfig) -> Self {
        Self { config }
    }

    pub async fn review(
        &self,
        providers: &ProviderRegistry,
        ctx: &ExecutionContext,
        content: &Value,
    ) -> Result<Critique, HandboxError> {
        let criteria = if self.config.criteria.is_empty() {
            infer_criteria(content)
        } else {
            self.config.criteria.clone()
        };
        let scale = if self.config.scale > 0.0 {
            self.config.scale
        } else {
            DEFAULT_SCALE
        };

        let request = self.config.llm.request(
            Some("You are a rigorous, constructive reviewer. Answer with JSON only.".to_string()),
            review_prompt(&serialize_content(content), &criteria, scale),
        );
        let response = invoke_model(providers, ctx, &self.config.llm, request).await?;

        let critique = parse_critique(&response.text, criteria, scale);
        if critique.raw.is_some() {
            tracing::warn!(trace_id = %ctx.trace_id, "critic review was not structured, using raw text");
        } else {
            tracing::info!(trace_id = %ctx.trace_id, average = ?critique.average_score(), "content reviewed");
        }
        Ok(critique)
    }
}

/// Pick default criteria from the shape of the content.
pub fn infer_criteria(content: &Value) -> Vec<String> {
    let criteria: &[&str] = match content {
        Value::Object(_) | Value::Array(_) => &["completeness", "consistency", "structure"],
        Value::String(text) if looks_like_code(text) => {
            &["correctness", "readability", "maintainability", "error handling"]
        }
        _ => &["clarity", "accuracy", "completeness", "tone"],
    };
    criteria.iter().map(|c| c.to_string()).collect()
}

fn looks_like_code(text: &str) -> bool {
    text.contains("```") || CODE_MARKERS.iter().filter(|m| text.contains(*m)).count() >= 2
}

fn serialize_content(content: &Value) -> String {
    match content {
        Value::Object(_) | Value::Array(_) => {
            serde_json::to_string_pretty(content).unwrap_or_else(|_| content.to_string())
        }
        other => value_to_text(other),
    }
}

fn review_prompt(content: &str, criteria: &[String], scale: f64) -> String {
    format!(
        "Review the following content.\n\n---\n{}\n---\n\nCriteria: {}\n\
         Score each criterion from 0 to {}. Respond with JSON: \
         {{\"review\": \"...\", \"scores\": {{\"<criterion>\": <number>}}, \"suggestions\": [\"...\"]}}",
        content,
        criteria.join(", "),
        scale
    )
}

pub fn parse_critique(text: &str, criteria: Vec<String>, scale: f64) -> Critique {
    let raw_fallback = |criteria: Vec<String>| Critique {
        review: text.trim().to_string(),
        scores: BTreeMap::new(),
        suggestions: Vec::new(),
        criteria,
        raw: Some(text.to_string()),
    };

    let Ok(Value::Object(fields)) = extract_structured(text) else {
        return raw_fallback(criteria);
    };

    let review = ["review", "summary", "feedback"]
        .iter()
        .find_map(|k| fields.get(*k).and_then(Value::as_str));
    let scores = fields.get("scores").and_then(Value::as_object);
    // An object carrying neither part is not a critique.
    if review.is_none() && scores.is_none() {
        return raw_fallback(criteria);
    }

    let scores = scores
        .map(|scores| {
            scores
                .iter()
                .filter_map(|(name, v)| {
                    let score = match v {
                        Value::Number(n) => n.as_f64(),
                        Value::String(s) => s.trim().parse().ok(),
                        _ => None,
                    }?;
                    Some((name.clone(), score.clamp(0.0, scale)))
                })
                .collect()
        })
        .unwrap_or_default();

    let suggestions = fields
        .get("suggestions")
        .and_then(Value::as_array)
        .map(|items| items.iter().map(value_to_text).collect())
        .unwrap_or_default();

    Critique {
        review: review.unwrap_or_default().to_string(),
        scores,
        suggestions,
        criteria,
        raw: None,
    }
}
