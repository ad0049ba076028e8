//! End-to-end tracing pipeline demonstration
//!
//! Runs a small simulated agent (planning step, a tool that consults an LLM, a final
//! answer) under a tracer, ingests the captured events into an in-memory collector,
//! and prints the reconstructed execution tree with its totals.
//!
//! # Running the example
//!
//! ```bash
//! RUST_LOG=runscope=debug cargo run --example pipeline_demo
//! ```

use runscope::buffer::MemorySink;
use runscope::collector::Collector;
use runscope::config::TracerConfig;
use runscope::event::LlmCall;
use runscope::tracer::{ChatCompletionExtractor, Tracer};
use runscope::usage::TokenCounter;
use serde_json::json;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn fake_completion(model: &str, content: &str) -> serde_json::Value {
    json!({
        "model": model,
        "choices": [{"message": {"role": "assistant", "content": content}}],
        "usage": {"prompt_tokens": 420, "completion_tokens": 64}
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("{}", "=".repeat(80));
    println!("Tracing pipeline demonstration");
    println!("{}", "=".repeat(80));

    let sink = MemorySink::new();
    let config = TracerConfig::default().with_agent_name("travel_planner");
    let tracer = Tracer::with_sink(config, Arc::new(sink.clone()))?;
    let counter = TokenCounter::default();

    let answer: Result<String, String> = tracer.track_agent("Plan a weekend in Lisbon", || {
        let plan = tracer.track_step("plan", "Plan a weekend in Lisbon", || {
            tracer.capture(
                &ChatCompletionExtractor::new().with_prompt("Break the trip into tasks"),
                &fake_completion("gpt-4-0613", "1. weather 2. sights"),
            );
            Ok::<_, String>(vec!["weather", "sights"])
        })?;

        let weather = tracer.track_tool("weather_lookup", &json!({"city": "Lisbon"}), || {
            Ok::<_, String>(json!({"forecast": "sunny", "high_c": 24}))
        })?;

        tracer.track_node("compose", &json!({"plan": plan, "weather": weather}), || {
            let call = LlmCall::new("claude-3-haiku-20240307")
                .with_prompt("Write the itinerary")
                .with_completion("Day 1: Alfama. Day 2: Belem.")
                .with_latency_ms(850.0)
                .with_estimated_usage(&counter);
            tracer.record(call);
            Ok("Day 1: Alfama. Day 2: Belem.".to_string())
        })
    });

    println!("\nAgent answered: {:?}", answer);
    tracer.shutdown().await;

    let events = sink.events();
    println!("Captured {} events in {} batches", events.len(), sink.batches().len());
    for event in &events {
        println!("{}", event.printable_summary());
    }

    let collector = Collector::in_memory();
    let run_id = events
        .first()
        .map(|e| e.run_id().to_string())
        .ok_or_else(|| anyhow::anyhow!("no events captured"))?;

    // deliver twice to show that re-delivery changes nothing
    collector.ingest(events.clone()).await?;
    let response = collector.ingest(events).await?;
    println!("\nSecond ingestion: {:?}", response);

    let trace = collector.trace(&run_id).await?;
    println!("\nExecution tree for run {}:", run_id);
    print!("{}", trace.tree.render());

    let summary = &trace.summary;
    println!("\nTotal cost:      ${:.4}", summary.total_cost);
    println!("Total duration:  {:.1}ms", summary.total_duration_ms);
    println!("Tokens in/out:   {}/{}", summary.total_tokens_in, summary.total_tokens_out);
    println!("Events by type:  {:?}", summary.event_counts);
    println!("Max depth:       {}", summary.max_depth);

    Ok(())
}
