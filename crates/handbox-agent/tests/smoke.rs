// ABOUTME: End-to-end tests driving the engine through capability names, as an outer caller would.
// ABOUTME: Covers plan -> execute -> review, routing, collaboration, ReAct budgets, memory and failure outcomes.

use std::sync::Arc;

use serde_json::{Value, json};

use handbox_agent::testing::ScriptedProvider;
use handbox_agent::{CapabilityMap, Engine, RegistryEvent};
use handbox_core::{MemoryConfig, ProviderCategory, ProviderError};

fn map(value: Value) -> CapabilityMap {
    value.as_object().cloned().unwrap_or_default()
}

fn engine_with(provider: Arc<ScriptedProvider>) -> Engine {
    let engine = Engine::new(MemoryConfig::default(), 4);
    engine.providers.register(provider);
    engine
}

#[tokio::test]
async fn plan_execute_and_review() {
    let provider = Arc::new(ScriptedProvider::responding("stub", |req| {
        if req.prompt.starts_with("Goal:") {
            r#"Here is the plan:
```json
{"tasks": [
  {"id": "1", "name": "Collect requirements"},
  {"id": "2", "name": "Draft outline", "dependencies": ["1"]},
  {"id": "3", "name": "Draft budget", "dependencies": ["1"]},
  {"id": "4", "name": "Assemble proposal", "dependencies": ["2", "3"]}
]}
```"#
                .to_string()
        } else if req.prompt.starts_with("Review the following content") {
            r#"{"review": "Thorough", "scores": {"clarity": 8, "completeness": 9}, "suggestions": ["Add a timeline"]}"#
                .to_string()
        } else {
            format!("done: {}", req.prompt.lines().next().unwrap_or_default())
        }
    }));
    let engine = engine_with(provider.clone());
    let ctx = engine.context();

    let planned = engine
        .invoke("agent.plan", &map(json!({"goal": "Write a grant proposal"})), &CapabilityMap::new(), &ctx)
        .await;
    assert!(planned.success, "{:?}", planned.error);
    let planned = planned.output.unwrap();
    assert_eq!(planned["degraded"], false);
    assert_eq!(planned["plan"]["critical_path"], json!(["1", "2", "4"]));

    let report = engine
        .invoke(
            "agent.execute_plan",
            &map(json!({"plan": planned["plan"].clone()})),
            &map(json!({"policy": "dependency", "max_parallel": 2})),
            &ctx,
        )
        .await;
    assert!(report.success, "{:?}", report.error);
    let report = report.output.unwrap();
    assert_eq!(report["status"]["completed"], 4);
    assert_eq!(report["batches"], json!([["1"], ["2", "3"], ["4"]]));

    let last = &report["results"][3];
    assert_eq!(last["task_id"], "4");
    assert_eq!(last["output"]["text"], "done: Assemble proposal");

    let critique = engine
        .invoke(
            "agent.critic",
            &map(json!({"content": last["output"]["text"].clone()})),
            &map(json!({"criteria": ["clarity", "completeness"]})),
            &ctx,
        )
        .await;
    assert!(critique.success);
    let critique = critique.output.unwrap();
    assert_eq!(critique["scores"]["completeness"], 9.0);
    assert_eq!(critique["suggestions"], json!(["Add a timeline"]));

    // 1 plan + 4 tasks + 1 review
    assert_eq!(provider.call_count(), 6);
}

#[tokio::test]
async fn keyword_routes_never_consult_the_model() {
    let provider = Arc::new(ScriptedProvider::always(
        "stub",
        r#"{"route": "sales", "confidence": 0.99}"#,
    ));
    let engine = engine_with(provider.clone());
    let config = map(json!({
        "routes": [
            {"name": "billing", "description": "Payments", "keywords": ["invoice", "refund"]},
            {"name": "sales", "description": "New business", "keywords": ["pricing"]}
        ]
    }));

    let keyword = engine
        .invoke("agent.route", &map(json!({"input": "Where is my REFUND?"})), &config, &engine.context())
        .await
        .output
        .unwrap();
    assert_eq!(keyword["route"], "billing");
    assert_eq!(keyword["method"], "keyword");
    assert_eq!(provider.call_count(), 0);

    let classified = engine
        .invoke("agent.route", &map(json!({"input": "Can we talk volume deals"})), &config, &engine.context())
        .await
        .output
        .unwrap();
    assert_eq!(classified["route"], "sales");
    assert_eq!(classified["method"], "model");
    assert_eq!(provider.call_count(), 1);
}

#[tokio::test]
async fn collaboration_makes_one_call_per_turn_plus_synthesis() {
    let provider = Arc::new(ScriptedProvider::responding("stub", |req| {
        if req.prompt.contains("Synthesize") {
            r#"{"summary": "Launch in Q3", "recommendations": ["Hire support"], "confidence": 0.8}"#
                .to_string()
        } else {
            "I have thoughts.".to_string()
        }
    }));
    let engine = engine_with(provider.clone());
    let config = map(json!({
        "rounds": 3,
        "agents": [
            {"name": "optimist", "role": "argue for launching"},
            {"name": "skeptic", "role": "find the risks"}
        ]
    }));

    let outcome = engine
        .invoke("agent.collaborate", &map(json!({"topic": "Should we launch?"})), &config, &engine.context())
        .await;
    assert!(outcome.success, "{:?}", outcome.error);
    let outcome = outcome.output.unwrap();
    assert_eq!(outcome["rounds"].as_array().unwrap().len(), 3);
    assert_eq!(outcome["consensus"]["summary"], "Launch in Q3");
    assert_eq!(outcome["final_agent"], "skeptic");
    assert_eq!(provider.call_count(), 7);
}

#[tokio::test]
async fn react_budget_exhaustion_is_not_a_failure() {
    let provider = Arc::new(ScriptedProvider::always(
        "stub",
        "Thought: I should look this up\nAction: memory.search\nAction Input: {\"query\": \"weather\"}",
    ));
    let engine = engine_with(provider.clone());

    let outcome = engine
        .invoke(
            "agent.react",
            &map(json!({"goal": "What is the weather?"})),
            &map(json!({"max_iterations": 3, "tools": ["memory.search"]})),
            &engine.context(),
        )
        .await;
    assert!(outcome.success);
    let outcome = outcome.output.unwrap();
    assert_eq!(outcome["achieved"], false);
    assert_eq!(outcome["final_state"], "iteration_exhausted");
    assert_eq!(outcome["total_iterations"], 3);
    assert_eq!(outcome["tool_calls"], 3);
    assert_eq!(provider.call_count(), 3);
}

#[tokio::test]
async fn react_turns_can_be_saved_to_memory() {
    let provider = Arc::new(ScriptedProvider::new(
        "stub",
        [
            "Thought: store the fact\nAction: memory.store\nAction Input: {\"key\": \"capital\", \"value\": \"Paris\"}",
            "Thought: stored\nAction: FINISH\nAction Input: Paris",
        ],
    ));
    let engine = engine_with(provider);

    let outcome = engine
        .invoke(
            "agent.react",
            &map(json!({"goal": "Remember the capital of France"})),
            &map(json!({"memory_namespace": "session-7"})),
            &engine.context(),
        )
        .await
        .output
        .unwrap();
    assert_eq!(outcome["achieved"], true);
    assert_eq!(outcome["answer"], "Paris");

    assert_eq!(engine.memory.retrieve("default", "capital"), Some(json!("Paris")));
    let turns = engine.memory.search(Some("session-7"), ":turn:");
    assert_eq!(turns.len(), 2);
}

#[tokio::test]
async fn memory_capacity_evicts_oldest_write() {
    let engine = Engine::new(
        MemoryConfig {
            max_entries: 2,
            ttl_seconds: 0,
        },
        4,
    );
    let ctx = engine.context();
    for (key, value) in [("a", 1), ("b", 2), ("c", 3)] {
        let stored = engine
            .invoke("memory.store", &map(json!({"key": key, "value": value})), &CapabilityMap::new(), &ctx)
            .await;
        assert!(stored.success);
    }

    assert_eq!(engine.memory.len(), 2);
    let first = engine
        .invoke("memory.retrieve", &map(json!({"key": "a"})), &CapabilityMap::new(), &ctx)
        .await
        .output
        .unwrap();
    assert_eq!(first["found"], false);
}

#[tokio::test]
async fn failures_come_back_as_structured_outcomes() {
    let provider = Arc::new(ScriptedProvider::always("stub", "fine"));
    provider.push_error(ProviderError::RateLimited);
    let engine = engine_with(provider);
    let ctx = engine.context();

    let limited = engine
        .invoke("llm.invoke", &map(json!({"prompt": "hi"})), &CapabilityMap::new(), &ctx)
        .await;
    assert!(!limited.success);
    assert_eq!(limited.error.as_deref(), Some("Rate limited"));

    let recovered = engine
        .invoke("llm.invoke", &map(json!({"prompt": "hi"})), &CapabilityMap::new(), &ctx)
        .await;
    assert!(recovered.success);

    let missing = engine
        .invoke("llm.invoke", &map(json!({"prompt": "hi"})), &map(json!({"provider": "ghost"})), &ctx)
        .await;
    assert!(!missing.success);
    assert!(missing.error.unwrap().contains("ghost"));
}

#[tokio::test]
async fn registry_events_follow_active_provider_changes() {
    let engine = Engine::new(MemoryConfig::default(), 4);
    let mut events = engine.providers.subscribe();

    engine.providers.register(Arc::new(ScriptedProvider::always("first", "1")));
    engine.providers.register(Arc::new(ScriptedProvider::always("second", "2")));
    assert!(engine.providers.unregister("first"));

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.contains(&RegistryEvent::ActiveChanged {
        category: ProviderCategory::Generative,
        id: Some("second".to_string()),
    }));
    assert_eq!(
        engine.providers.active_id(ProviderCategory::Generative).as_deref(),
        Some("second")
    );
}
