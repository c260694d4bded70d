// crates/stillcli/src/main.rs

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use stillcore::{ExecutionEvent, FlowDefinition, NodeEvent, NodeSpec, RunStatus, Value, MAIN_HANDLE};
use stillruntime::{FlowRuntime, NodeRegistry, RuntimeConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "still")]
#[command(about = "Suspendable flow engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a flow file
    Run {
        /// Path to flow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Run input as JSON string
        #[arg(short, long)]
        input: Option<String>,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,

        /// Publish `channel=json` once the run is waiting (repeatable)
        #[arg(short, long = "event", value_parser = parse_event)]
        events: Vec<(String, serde_json::Value)>,

        /// How long to keep a waiting run alive for timers and events
        #[arg(short, long, default_value_t = 10)]
        wait_secs: u64,
    },

    /// Validate a flow file
    Validate {
        /// Path to flow JSON file
        file: PathBuf,
    },

    /// List available node types
    Nodes,

    /// Create a new example flow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "flow.json")]
        output: PathBuf,
    },
}

fn parse_event(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (channel, payload) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected channel=json, got '{}'", raw))?;
    let payload = serde_json::from_str(payload).map_err(|e| format!("invalid event payload: {}", e))?;
    Ok((channel.to_string(), payload))
}

fn registry() -> NodeRegistry {
    stillnodes::standard_registry()
}

fn load_flow(file: &PathBuf) -> Result<FlowDefinition> {
    let json = std::fs::read_to_string(file)?;
    Ok(serde_json::from_str(&json)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            input,
            verbose,
            events,
            wait_secs,
        } => {
            let default_level = if verbose { "debug" } else { "info" };
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
                )
                .init();

            run_flow(file, input, events, Duration::from_secs(wait_secs)).await?;
        }

        Commands::Validate { file } => {
            validate_flow(file)?;
        }

        Commands::Nodes => {
            list_nodes();
        }

        Commands::Init { output } => {
            create_example_flow(output)?;
        }
    }

    Ok(())
}

fn print_event(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::RunStarted { run_id, .. } => {
            println!("▶️  Run {} started", run_id);
        }
        ExecutionEvent::NodeStarted {
            node_id,
            node_type,
            execution_type,
            ..
        } => {
            println!("  ⚡ {:?} node: {} ({})", execution_type, node_id, node_type);
        }
        ExecutionEvent::NodeCompleted {
            node_id,
            handles,
            duration_ms,
            ..
        } => {
            println!(
                "  ✅ Node {} completed in {}ms via [{}]",
                node_id,
                duration_ms,
                handles.join(", ")
            );
        }
        ExecutionEvent::NodeFailed { node_id, error, .. } => {
            println!("  ❌ Node {} failed: {}", node_id, error);
        }
        ExecutionEvent::NodeSuspended {
            node_id,
            correlation_id,
            kind,
            ..
        } => {
            println!("  ⏸️  Node {} waiting ({:?}) on {}", node_id, kind, correlation_id);
        }
        ExecutionEvent::RunResumed { node_id, .. } => {
            println!("  ⏯️  Resuming node {}", node_id);
        }
        ExecutionEvent::NodeEvent { node_id, event, .. } => match event {
            NodeEvent::Info { message } => {
                println!("     ℹ️  [{}] {}", node_id, message);
            }
            NodeEvent::Warning { message } => {
                println!("     ⚠️  [{}] {}", node_id, message);
            }
            NodeEvent::Progress { percent, message } => {
                if let Some(msg) = message {
                    println!("     📊 [{}] {}% - {}", node_id, percent, msg);
                } else {
                    println!("     📊 [{}] {}%", node_id, percent);
                }
            }
            NodeEvent::Data { .. } => {}
        },
        ExecutionEvent::RunWaiting { correlation_ids, .. } => {
            println!("💤 Run waiting on {} registration(s)", correlation_ids.len());
        }
        ExecutionEvent::RunCompleted { duration_ms, .. } => {
            println!("✨ Run completed successfully in {}ms", duration_ms);
        }
        ExecutionEvent::RunFailed { node_id, error, .. } => {
            println!("💥 Run failed at {}: {}", node_id, error);
        }
        ExecutionEvent::RunStopped { .. } => {
            println!("🛑 Run stopped");
        }
    }
}

async fn run_flow(
    file: PathBuf,
    input: Option<String>,
    events: Vec<(String, serde_json::Value)>,
    wait: Duration,
) -> Result<()> {
    println!("🚀 Loading flow from: {}", file.display());

    let flow = load_flow(&file)?;

    println!("📋 Flow: {}", flow.name);
    println!("   Nodes: {}", flow.nodes.len());
    println!("   Edges: {}", flow.edges.len());
    println!();

    let input = match input {
        Some(raw) => Value::from_json(serde_json::from_str(&raw)?),
        None => Value::Null,
    };

    let runtime = FlowRuntime::builder()
        .config(RuntimeConfig::from_env()?)
        .registry(registry())
        .build()
        .await?;
    runtime.start().await?;

    let mut subscription = runtime.subscribe_events();
    let printer = tokio::spawn(async move {
        while let Ok(event) = subscription.recv().await {
            print_event(&event);
        }
    });

    let run_id = runtime.start_run(&flow, input).await?;
    let mut run = runtime.get_run(run_id).await?;

    if run.status == RunStatus::Waiting {
        for (channel, payload) in events {
            println!("📨 Publishing on {}", channel);
            runtime.publish(&channel, Value::from_json(payload)).await?;
        }

        let deadline = tokio::time::Instant::now() + wait;
        while run.status == RunStatus::Waiting && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
            run = runtime.get_run(run_id).await?;
        }
    }

    // Let the printer drain before the summary
    tokio::time::sleep(Duration::from_millis(100)).await;
    printer.abort();

    println!();
    println!("📊 Run Summary:");
    println!("   Run ID: {}", run.run_id);
    println!("   Status: {}", run.status.as_str());

    if run.status == RunStatus::Waiting {
        println!("   Still waiting on: {}", run.waiting_correlations().join(", "));
        let stopped = runtime.stop(run_id).await?;
        println!("   Stopped after {}s: {}", wait.as_secs(), stopped.as_str());
    }

    if let Some(failure) = &run.failure {
        println!("   Failed at {}: {}", failure.node_id, failure.message);
    }

    if !run.context.is_empty() {
        println!();
        println!("📤 Outputs:");
        let mut nodes: Vec<_> = run.context.iter().collect();
        nodes.sort_by(|a, b| a.0.cmp(b.0));
        for (node_id, output) in nodes {
            println!("   Node {}: {}", node_id, serde_json::to_string(&output.to_json())?);
        }
    }

    runtime.shutdown().await?;

    if run.status == RunStatus::Failed {
        return Err(anyhow!("run {} failed", run.run_id));
    }
    Ok(())
}

fn validate_flow(file: PathBuf) -> Result<()> {
    println!("🔍 Validating flow: {}", file.display());

    let flow = load_flow(&file)?;
    registry().validate_flow(&flow)?;

    println!("✅ Flow is valid:");
    println!("   Name: {}", flow.name);
    println!("   Nodes: {}", flow.nodes.len());
    println!("   Edges: {}", flow.edges.len());
    println!("   Entry nodes: {}", flow.entry_nodes().join(", "));

    Ok(())
}

fn list_nodes() {
    println!("📦 Available Node Types:");
    println!();

    let registry = registry();
    let mut node_types = registry.list_node_types();
    node_types.sort();

    for node_type in node_types {
        if let Some(metadata) = registry.get_metadata(&node_type) {
            let suspends = if metadata.suspends { ", suspends" } else { "" };
            println!("  • {} ({}{})", node_type, metadata.category, suspends);
            println!("    {}", metadata.description);
            if !metadata.handles.is_empty() {
                println!("    handles: {}", metadata.handles.join(", "));
            }
        } else {
            println!("  • {}", node_type);
        }
    }
}

fn create_example_flow(output: PathBuf) -> Result<()> {
    let mut flow = FlowDefinition::new("Order approval");
    flow.description = Some("Waits for an approval event, giving up after 30 seconds".to_string());

    let wait = flow.add_node(
        NodeSpec::new("await_approval", "wait.channel")
            .with_name("Await approval")
            .with_config("channel", "orders.approved")
            .with_config("timeout_secs", 30.0)
            .with_position(100.0, 100.0),
    );
    let approved = flow.add_node(
        NodeSpec::new("approved", "debug.log")
            .with_name("Log approval")
            .with_config("message", "Order approved")
            .with_position(300.0, 50.0),
    );
    let timed_out = flow.add_node(
        NodeSpec::new("timed_out", "debug.log")
            .with_name("Log timeout")
            .with_config("message", "Approval timed out")
            .with_position(300.0, 150.0),
    );

    flow.connect(&wait, MAIN_HANDLE, &approved);
    flow.connect(&wait, stillnodes::TIMEOUT_HANDLE, &timed_out);

    let json = serde_json::to_string_pretty(&flow)?;
    std::fs::write(&output, json)?;

    println!("✨ Created example flow: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  still run --file {} --event 'orders.approved={{\"approved\": true}}'",
        output.display()
    );

    Ok(())
}
