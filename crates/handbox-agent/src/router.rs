// ABOUTME: Two-phase input router: case-insensitive keyword fast path, then a model classifier.
// ABOUTME: Any unparseable or unknown classification resolves to the configured fallback route.

use serde::{Deserialize, Serialize};

use handbox_core::{ExecutionContext, HandboxError, extract_typed};

use crate::llm::{ModelSettings, invoke_model};
use crate::registry::ProviderRegistry;

const DEFAULT_FALLBACK_ROUTE: &str = "default";
const DEFAULT_KEYWORD_CONFIDENCE: f64 = 0.9;
const DEFAULT_MODEL_CONFIDENCE: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub routes: Vec<Route>,
    pub fallback_route: String,
    /// Confidence reported for keyword matches.
    pub keyword_confidence: f64,
    /// Ask the model when no keyword matches.
    pub use_model: bool,
    #[serde(flatten)]
    pub llm: ModelSettings,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            routes: Vec::new(),
            fallback_route: DEFAULT_FALLBACK_ROUTE.to_string(),
            keyword_confidence: DEFAULT_KEYWORD_CONFIDENCE,
            use_model: true,
            llm: ModelSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteMethod {
    Keyword,
    Model,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub route: String,
    pub confidence: f64,
    pub method: RouteMethod,
    pub reasoning: Option<String>,
}

#[derive(Deserialize)]
struct Classification {
    route: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    reasoning: Option<String>,
}

pub struct Router {
    config: RouterConfig,
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// First declared route with a keyword contained in `input`.
    pub fn keyword_match(&self, input: &str) -> Option<&Route> {
        let haystack = input.to_lowercase();
        self.config.routes.iter().find(|route| {
            route
                .keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .any(|k| !k.is_empty() && haystack.contains(&k))
        })
    }

    pub async fn route(
        &self,
        providers: &ProviderRegistry,
        ctx: &ExecutionContext,
        input: &str,
    ) -> Result<RouteDecision, HandboxError> {
        if let Some(route) = self.keyword_match(input) {
            tracing::info!(trace_id = %ctx.trace_id, route = %route.name, method = "keyword", "input routed");
            return Ok(RouteDecision {
                route: route.name.clone(),
                confidence: self.config.keyword_confidence.clamp(0.0, 1.0),
                method: RouteMethod::Keyword,
                reasoning: Some("keyword match".to_string()),
            });
        }

        if !self.config.use_model || self.config.routes.is_empty() {
            return Ok(self.fallback("no keyword matched"));
        }

        let request = self
            .config
            .llm
            .request(Some(self.system_prompt()), self.classification_prompt(input));
        let response = invoke_model(providers, ctx, &self.config.llm, request).await?;

        let classification = match extract_typed::<Classification>(&response.text) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(trace_id = %ctx.trace_id, raw = %e.raw, "router could not parse classification");
                return Ok(self.fallback("classifier output was not parseable"));
            }
        };

        let wanted = classification.route.trim();
        let Some(route) = self
            .config
            .routes
            .iter()
            .find(|r| r.name.eq_ignore_ascii_case(wanted))
        else {
            tracing::warn!(trace_id = %ctx.trace_id, route = wanted, "classifier chose an undeclared route");
            return Ok(self.fallback("classifier chose an undeclared route"));
        };

        tracing::info!(trace_id = %ctx.trace_id, route = %route.name, method = "model", "input routed");
        Ok(RouteDecision {
            route: route.name.clone(),
            confidence: classification
                .confidence
                .unwrap_or(DEFAULT_MODEL_CONFIDENCE)
                .clamp(0.0, 1.0),
            method: RouteMethod::Model,
            reasoning: classification.reasoning,
        })
    }

    fn fallback(&self, reason: &str) -> RouteDecision {
        RouteDecision {
            route: self.config.fallback_route.clone(),
            confidence: 0.0,
            method: RouteMethod::Fallback,
            reasoning: Some(reason.to_string()),
        }
    }

    fn system_prompt(&self) -> String {
        "You classify user input into exactly one of the listed routes. \
         Answer with a single JSON object and nothing else."
            .to_string()
    }

    fn classification_prompt(&self, input: &str) -> String {
        let routes: Vec<String> = self
            .config
            .routes
            .iter()
            .map(|r| format!("- {}: {}", r.name, r.description))
            .collect();
        format!(
            "Routes:\n{}\n\nInput:\n{}\n\nRespond with JSON: \
             {{\"route\": \"<route name>\", \"confidence\": <0.0-1.0>, \"reasoning\": \"<one sentence>\"}}",
            routes.join("\n"),
            input
        )
    }
}
