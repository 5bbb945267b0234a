//! rag-chat: terminal front end for the RAG backend.
//! Reads config, opens the WebSocket channel (HTTP is used while it is down),
//! sends each question and prints the transcript entries it produces.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rag_chat_client::config::{self, Config};
use rag_chat_client::{
    ConnectionState, ConversationController, DeliveryStatus, Payload, Role, TranscriptEntry,
    TransportClient,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rag-chat")]
#[command(about = "Ask questions of a RAG server")]
struct Cli {
    /// Config file (default: ~/.rag-chat/config.yaml)
    #[arg(long, env = "RAG_CHAT_CONFIG")]
    config: Option<PathBuf>,

    /// Question to ask; without it, questions are read from stdin one per line
    question: Option<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let loaded = match &cli.config {
        Some(path) => config::load(path),
        None => config::load_default(),
    };
    let cfg = match loaded {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: failed to load config: {}", e);
            process::exit(1);
        }
    };

    let questions: Vec<String> = match cli.question {
        Some(q) => vec![q],
        None => io::stdin()
            .lock()
            .lines()
            .map_while(Result::ok)
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect(),
    };
    if questions.is_empty() {
        eprintln!("Error: no question provided");
        process::exit(1);
    }

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| {
            eprintln!("Error: failed to create runtime: {}", e);
            process::exit(1);
        });

    let ok = rt.block_on(run(cfg, questions));
    if !ok {
        process::exit(1);
    }
}

/// Returns false if any query ended in a failed entry.
async fn run(cfg: Config, questions: Vec<String>) -> bool {
    let transport = Arc::new(TransportClient::new(cfg.endpoint()));
    let mut controller = ConversationController::new(transport.clone());
    if let Some(greeting) = &cfg.chat.greeting {
        controller = controller.with_greeting(greeting.clone());
    }

    transport.connect();
    wait_for_channel(&transport, Duration::from_millis(cfg.connect_wait_ms())).await;
    controller.process_pending();

    let mut printed = 0;
    let mut ok = true;
    for question in questions {
        if let Err(e) = controller.submit_query(&question) {
            eprintln!("Skipped {:?}: {}", question, e);
            continue;
        }
        controller.wait_idle().await;
        for entry in &controller.transcript()[printed..] {
            if entry.delivery_status == Some(DeliveryStatus::Failed) {
                ok = false;
            }
            print_entry(entry);
        }
        printed = controller.transcript().len();
    }

    controller.dispose();
    transport.disconnect();
    ok
}

/// Give the channel up to `wait` to leave the connecting state.
async fn wait_for_channel(transport: &TransportClient, wait: Duration) {
    let settled = tokio::time::timeout(wait, async {
        while transport.state() == ConnectionState::Connecting {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    if settled.is_err() {
        tracing::info!("channel still connecting, falling back to HTTP");
    }
}

fn print_entry(entry: &TranscriptEntry) {
    if entry.role == Role::System && entry.delivery_status == Some(DeliveryStatus::Failed) {
        eprintln!("{}", entry.payload.text());
        return;
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    match (&entry.role, &entry.payload) {
        (Role::User, payload) => {
            let _ = writeln!(out, "> {}", payload.text());
        }
        (Role::System, payload) => {
            let _ = writeln!(out, "[system] {}", payload.text());
        }
        (Role::Assistant, Payload::Answer(result)) if result.is_error() => {
            let _ = writeln!(out, "[error] {}", result.display_text());
        }
        (Role::Assistant, Payload::Answer(result)) => {
            let _ = writeln!(out, "{}", result.answer);
            if !result.source_attribution.is_empty() {
                let _ = writeln!(out, "\nSources:");
                for attribution in &result.source_attribution {
                    let methods: Vec<String> = attribution
                        .methods
                        .iter()
                        .map(|m| {
                            format!("{}: {:.0}%", m.method.replacen('_', " ", 1), m.confidence * 100.0)
                        })
                        .collect();
                    if methods.is_empty() {
                        let _ = writeln!(out, "  {}", attribution.source);
                    } else {
                        let _ = writeln!(out, "  {} ({})", attribution.source, methods.join(", "));
                    }
                }
            } else if !result.sources.is_empty() {
                let _ = writeln!(out, "\nSources:");
                for src in &result.sources {
                    let _ = writeln!(out, "  {}", src);
                }
            }
        }
        (Role::Assistant, Payload::Text(text)) => {
            let _ = writeln!(out, "{}", text);
        }
    }
    let _ = out.flush();
}
