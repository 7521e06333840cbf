// ABOUTME: Test utilities for handbox-agent, including a scripted provider.
// ABOUTME: Used in tests to drive strategies with canned model answers without real API calls.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use handbox_core::{
    ConnectionState, Credentials, EmbedRequest, EmbedResponse, InvokeRequest, InvokeResponse,
    Provider, ProviderCategory, ProviderError,
};

type Responder = Box<dyn Fn(&InvokeRequest) -> String + Send + Sync>;

/// A provider that answers from a script.
///
/// Responses are served from a queue in order. When the queue is empty the
/// responder (if any) computes the answer from the request, then the
/// fallback text is used, and otherwise the call fails. Every request is
/// recorded so tests can assert on prompts and call counts.
pub struct ScriptedProvider {
    id: String,
    category: ProviderCategory,
    queue: Mutex<VecDeque<Result<InvokeResponse, ProviderError>>>,
    responder: Option<Responder>,
    fallback: Option<String>,
    connect_result: bool,
    state: Mutex<ConnectionState>,
    requests: Mutex<Vec<InvokeRequest>>,
    connect_calls: Mutex<u32>,
}

impl ScriptedProvider {
    /// A generative provider answering with `responses` in order.
    pub fn new<I, S>(id: &str, responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.to_owned(),
            category: ProviderCategory::Generative,
            queue: Mutex::new(
                responses
                    .into_iter()
                    .map(|text| Ok(InvokeResponse::text(text)))
                    .collect(),
            ),
            responder: None,
            fallback: None,
            connect_result: true,
            state: Mutex::new(ConnectionState::Disconnected),
            requests: Mutex::new(Vec::new()),
            connect_calls: Mutex::new(0),
        }
    }

    /// A provider that always answers with the same text.
    pub fn always(id: &str, text: &str) -> Self {
        Self::new(id, Vec::<String>::new()).with_fallback(text)
    }

    /// A provider whose answer is computed from each request.
    pub fn responding<F>(id: &str, responder: F) -> Self
    where
        F: Fn(&InvokeRequest) -> String + Send + Sync + 'static,
    {
        let mut provider = Self::new(id, Vec::<String>::new());
        provider.responder = Some(Box::new(responder));
        provider
    }

    pub fn with_category(mut self, category: ProviderCategory) -> Self {
        self.category = category;
        self
    }

    pub fn with_fallback(mut self, text: &str) -> Self {
        self.fallback = Some(text.to_owned());
        self
    }

    pub fn with_connect_result(mut self, connect_result: bool) -> Self {
        self.connect_result = connect_result;
        self
    }

    /// Queue a failure to be returned by the next unanswered call.
    pub fn push_error(&self, error: ProviderError) {
        self.queue
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(Err(error));
    }

    pub fn requests(&self) -> Vec<InvokeRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn connect_calls(&self) -> u32 {
        *self.connect_calls.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn category(&self) -> ProviderCategory {
        self.category
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn connect(&self, _credentials: &Credentials) -> bool {
        *self.connect_calls.lock().unwrap_or_else(|p| p.into_inner()) += 1;
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = if self.connect_result {
            ConnectionState::Connected
        } else {
            ConnectionState::Failed
        };
        self.connect_result
    }

    async fn invoke(&self, request: &InvokeRequest) -> Result<InvokeResponse, ProviderError> {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(request.clone());

        let queued = self
            .queue
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();
        if let Some(next) = queued {
            return next;
        }
        if let Some(responder) = &self.responder {
            return Ok(InvokeResponse::text(responder(request)));
        }
        match &self.fallback {
            Some(text) => Ok(InvokeResponse::text(text.clone())),
            None => Err(ProviderError::InvalidResponse(format!(
                "script for '{}' exhausted",
                self.id
            ))),
        }
    }

    /// Deterministic vectors: `[chars, words, 1.0]` per text.
    async fn embed(&self, request: &EmbedRequest) -> Result<EmbedResponse, ProviderError> {
        let embeddings: Vec<Vec<f32>> = request
            .texts
            .iter()
            .map(|t| {
                vec![
                    t.chars().count() as f32,
                    t.split_whitespace().count() as f32,
                    1.0,
                ]
            })
            .collect();
        Ok(EmbedResponse {
            dimension: if embeddings.is_empty() { 0 } else { 3 },
            embeddings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_responses_are_served_in_order() {
        let provider = ScriptedProvider::new("stub", ["first", "second"]);
        let a = provider.invoke(&InvokeRequest::new("1")).await.unwrap();
        let b = provider.invoke(&InvokeRequest::new("2")).await.unwrap();
        assert_eq!(a.text, "first");
        assert_eq!(b.text, "second");

        let err = provider.invoke(&InvokeRequest::new("3")).await.unwrap_err();
        assert!(err.to_string().contains("exhausted"));
        assert_eq!(provider.call_count(), 3);
        assert_eq!(provider.requests()[1].prompt, "2");
    }

    #[tokio::test]
    async fn queued_errors_and_fallback() {
        let provider = ScriptedProvider::always("stub", "Done.");
        provider.push_error(ProviderError::RateLimited);

        assert!(provider.invoke(&InvokeRequest::new("x")).await.is_err());
        assert_eq!(
            provider.invoke(&InvokeRequest::new("x")).await.unwrap().text,
            "Done."
        );
    }

    #[tokio::test]
    async fn responder_sees_the_request() {
        let provider = ScriptedProvider::responding("echo", |req| req.prompt.to_uppercase());
        let resp = provider.invoke(&InvokeRequest::new("shout")).await.unwrap();
        assert_eq!(resp.text, "SHOUT");
    }

    #[tokio::test]
    async fn connect_result_is_configurable() {
        let provider = ScriptedProvider::always("stub", "ok").with_connect_result(false);
        assert!(!provider.connect(&Credentials::new()).await);
        assert_eq!(provider.connection_state(), ConnectionState::Failed);
        assert_eq!(provider.connect_calls(), 1);
    }
}
