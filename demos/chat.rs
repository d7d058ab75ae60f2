//! Interactive chat REPL over the completion engine.
//!
//! Usage:
//!   ANTHROPIC_API_KEY=sk-... cargo run --example chat
//!   ANTHROPIC_API_KEY=sk-... cargo run --example chat -- --thinking 4000 --show-intermediate
//!   LLM_PROVIDER=vertex VERTEX_PROJECT_ID=my-proj VERTEX_REGIONS=us-east5,europe-west1 \
//!     VERTEX_ACCESS_TOKEN=$(gcloud auth print-access-token) cargo run --example chat
//!   LLM_PROVIDER=bedrock AWS_REGION=us-west-2 cargo run --example chat -- --model anthropic.claude-3-5-sonnet-20241022-v2:0
//!
//! Ctrl-C or type "exit" / "quit" to leave.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use completion_engine::{
    CacheOptions, Client, CompletionOptions, ConversationBuffer, EngineConfig, StreamEventKind,
    ToolDefinition, ToolHandler, ToolRegistry,
};
use futures::StreamExt;
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "chat", about = "Chat with a tool-augmented model")]
struct Cli {
    /// Model to use (overrides LLM_MODEL)
    #[arg(long)]
    model: Option<String>,

    /// System prompt
    #[arg(long, short = 's')]
    system: Option<String>,

    /// Max output tokens per call
    #[arg(long)]
    max_tokens: Option<u32>,

    /// Tool-calling iterations before a final answer is forced
    #[arg(long, default_value_t = 2)]
    max_iterations: usize,

    /// Enable extended thinking with the given token budget
    #[arg(long)]
    thinking: Option<u32>,

    /// Stream text from tool-requesting turns too
    #[arg(long)]
    show_intermediate: bool,

    /// Mark system, tools and history as cacheable
    #[arg(long)]
    cache: bool,

    /// Organization recorded on every completion
    #[arg(long)]
    org: Option<String>,
}

struct Calculator;

#[async_trait]
impl ToolHandler for Calculator {
    async fn call(&self, input: &Value) -> Result<String, String> {
        let a = input["a"].as_f64().ok_or("a must be a number")?;
        let b = input["b"].as_f64().ok_or("b must be a number")?;
        let result = match input["op"].as_str().unwrap_or("+") {
            "+" => a + b,
            "-" => a - b,
            "*" => a * b,
            "/" if b == 0.0 => return Err("division by zero".into()),
            "/" => a / b,
            op => return Err(format!("unsupported operator {op}")),
        };
        Ok(result.to_string())
    }
}

fn tools() -> Arc<ToolRegistry> {
    Arc::new(ToolRegistry::new().add(
        ToolDefinition::new(
            "calculator",
            "Apply +, -, * or / to two numbers",
            json!({
                "type": "object",
                "properties": {
                    "a": {"type": "number"},
                    "b": {"type": "number"},
                    "op": {"type": "string", "enum": ["+", "-", "*", "/"]}
                },
                "required": ["a", "b", "op"]
            }),
        ),
        Calculator,
    ))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let mut config = EngineConfig::from_env().unwrap_or_else(|e| {
        eprintln!("error: {e}");
        std::process::exit(1);
    });
    if let Some(ref model) = cli.model {
        config.model = model.clone();
    }
    if let Some(max_tokens) = cli.max_tokens {
        config.max_tokens = max_tokens;
    }
    let client = Client::from_config(&config).await.unwrap_or_else(|e| {
        eprintln!("error: {e}");
        std::process::exit(1);
    });

    let mut options = CompletionOptions::new()
        .with_memory(Arc::new(ConversationBuffer::with_limit(50)))
        .with_max_tool_iterations(cli.max_iterations)
        .with_intermediate(cli.show_intermediate);
    if let Some(ref sys) = cli.system {
        options = options.with_system(sys.clone());
    }
    if let Some(budget) = cli.thinking {
        options = options.with_thinking(budget);
    }
    if cli.cache {
        options = options.with_cache(CacheOptions::all());
    }
    if let Some(ref org) = cli.org {
        options = options.with_organization(org.clone());
    }
    let tools = tools();

    eprintln!("completion-engine chat");
    eprintln!("model: {}", client.engine().model());
    if let Some(ref sys) = cli.system {
        eprintln!("system: {sys}");
    }
    eprintln!("tools: {}", tools.tool_names().join(", "));
    eprintln!("---");

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        eprint!("\x1b[1;36myou>\x1b[0m ");
        io::stderr().flush().ok();

        let line = match lines.next() {
            Some(Ok(line)) => line,
            _ => break,
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if matches!(trimmed, "exit" | "quit" | "/q") {
            break;
        }

        let mut stream = match client.stream_with_tools(trimmed, tools.clone(), &options).await {
            Ok(stream) => stream,
            Err(e) => {
                eprintln!("\x1b[1;31merror:\x1b[0m {e}");
                continue;
            }
        };

        let mut started = false;
        while let Some(event) = stream.next().await {
            match event.kind {
                StreamEventKind::ThinkingDelta { text, .. } => {
                    eprint!("\x1b[2;3m{text}\x1b[0m");
                }
                StreamEventKind::ContentDelta { text, .. } => {
                    if !started {
                        eprint!("\x1b[1;32mmodel>\x1b[0m ");
                        started = true;
                    }
                    print!("{text}");
                    io::stdout().flush().ok();
                }
                StreamEventKind::ToolUse { call, .. } => {
                    eprintln!("\x1b[33m  [tool: {}]\x1b[0m {}", call.name, call.arguments);
                }
                StreamEventKind::MessageStop { usage, .. } => {
                    if started {
                        println!();
                        started = false;
                    }
                    eprintln!(
                        "\x1b[2m  [{}in / {}out tokens]\x1b[0m",
                        usage.input_tokens, usage.output_tokens
                    );
                }
                StreamEventKind::Error { message } => {
                    eprintln!("\x1b[1;31merror:\x1b[0m {message}");
                }
                _ => {}
            }
        }
        stream.finish().await;
    }

    eprintln!("bye.");
}
