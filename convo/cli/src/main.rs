//! Convo - Terminal Chat Client
//!
//! Streams answers from a chat API into the terminal using `convo-core`.
//!
//! # Usage
//!
//! ```bash
//! # One question, answer streamed to stdout
//! convo "What is the capital of France?"
//!
//! # Interactive session against another server
//! convo --base-url https://chat.example.com/api
//!
//! # Input variables and suggested follow-ups
//! convo --input city=Paris --input days=3 --suggested-questions "Plan my trip"
//!
//! # Verbose logging (to stderr)
//! RUST_LOG=convo_core=debug convo "hello"
//! ```
//!
//! # Interactive Commands
//!
//! - `/stop`: stop the current answer (Ctrl-C does the same)
//! - `/restart`: start a new conversation
//! - `/switch <answer-id>`: show another branch of the conversation
//! - `/thread`: print the active thread
//! - `/quit`: exit

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use convo_core::{
    load_config_from_path, ChatSession, ConfigOverrides, EngineConfig, EnrichmentOptions,
    HttpChatBackend, SendRequest, SessionUpdate, Turn,
};

/// Convo - streaming chat in the terminal
#[derive(Parser, Debug)]
#[command(name = "convo")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Question to ask (omit for an interactive session)
    query: Option<String>,

    /// Base URL of the chat API
    #[arg(short = 'u', long, value_name = "URL")]
    base_url: Option<String>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "CONVO_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Connection timeout in milliseconds
    #[arg(long, value_name = "MS")]
    connect_timeout_ms: Option<u64>,

    /// Fetch suggested follow-up questions after each answer
    #[arg(short = 's', long)]
    suggested_questions: bool,

    /// Endpoint questions are sent to
    #[arg(short = 'e', long, default_value = "/chat-messages")]
    endpoint: String,

    /// Input variable as `name=value` (value parsed as JSON when possible)
    #[arg(short = 'i', long = "input", value_name = "NAME=VALUE")]
    inputs: Vec<String>,

    /// End-user identifier sent with every question
    #[arg(long, env = "CONVO_USER", default_value = "convo-cli")]
    user: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "CONVO_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("convo={level},convo_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

/// Parse `name=value`; the value is JSON if it parses, a string otherwise
fn parse_input(raw: &str) -> Result<(String, Value)> {
    let (name, value) = raw
        .split_once('=')
        .with_context(|| format!("Input must look like name=value, got {raw:?}"))?;
    let name = name.trim();
    if name.is_empty() {
        anyhow::bail!("Input name is empty in {raw:?}");
    }

    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

fn resolve_config(args: &Args) -> Result<EngineConfig> {
    let mut config =
        load_config_from_path(args.config.clone()).context("Failed to load configuration")?;

    let mut overrides = ConfigOverrides::new();
    if let Some(ref url) = args.base_url {
        overrides = overrides.with_base_url(url.clone());
    }
    if let Some(ms) = args.connect_timeout_ms {
        overrides = overrides.with_connect_timeout_ms(ms);
    }
    if args.suggested_questions {
        overrides = overrides.with_suggested_questions(true);
    }
    overrides.apply(&mut config);

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

// ============================================================================
// Rendering
// ============================================================================

/// Prints streamed answer text incrementally
#[derive(Default)]
struct Printer {
    /// Bytes already printed per answer id
    printed: HashMap<String, usize>,
    /// Answer currently being printed
    current: Option<String>,
}

impl Printer {
    fn render(&mut self, session: &ChatSession<HttpChatBackend>) {
        let thread = session.thread();
        let Some(answer) = thread.last().filter(|t| t.is_answer() && !t.is_opening_statement)
        else {
            return;
        };

        let text = display_text(answer);
        // A renamed answer continues from where its previous id left off
        let offset = self
            .printed
            .get(&answer.id)
            .or_else(|| self.current.as_ref().and_then(|prev| self.printed.get(prev)))
            .copied()
            .unwrap_or(0);

        let mut stdout = std::io::stdout().lock();
        match text.get(offset..) {
            Some(delta) => {
                let _ = write!(stdout, "{delta}");
            }
            // Content was replaced wholesale
            None => {
                let _ = write!(stdout, "\n{text}");
            }
        }
        let _ = stdout.flush();

        self.printed.insert(answer.id.clone(), text.len());
        self.current = Some(answer.id.clone());
    }

    fn finish(&mut self) {
        if self.current.take().is_some() {
            println!();
        }
    }
}

fn display_text(answer: &Turn) -> String {
    if answer.content.is_empty() {
        answer
            .agent_thoughts
            .iter()
            .map(|t| t.thought.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    } else {
        answer.content.clone()
    }
}

fn print_thread(session: &ChatSession<HttpChatBackend>) {
    for turn in session.thread() {
        let who = if turn.is_question() { "you" } else { "bot" };
        println!("[{who} {}] {}", turn.id, display_text(turn));
        if !turn.is_answer() || turn.is_opening_statement {
            continue;
        }
        let siblings = session.transcript().siblings(&turn.id);
        if siblings.len() > 1 {
            let ids: Vec<&str> = siblings.iter().map(|t| t.id.as_str()).collect();
            println!("    branches: {}", ids.join(", "));
        }
    }
}

// ============================================================================
// Driving
// ============================================================================

/// Drive the session until idle, stopping on Ctrl-C
async fn drive(session: &mut ChatSession<HttpChatBackend>, printer: &mut Printer) {
    loop {
        let update = tokio::select! {
            update = session.next_update() => update,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping");
                session.stop();
                None
            }
        };
        let Some(update) = update else {
            break;
        };

        match update {
            SessionUpdate::Changed { .. } | SessionUpdate::Enriched { .. } => {
                printer.render(session);
            }
            SessionUpdate::Paused {
                workflow_run_id,
                answer_id,
            } => {
                printer.finish();
                let forms = session
                    .transcript()
                    .get(&answer_id)
                    .map(|t| t.human_input_forms.clone())
                    .unwrap_or_default();
                println!("-- workflow {workflow_run_id} is waiting for input:");
                for form in forms {
                    println!("   {} ({})", form.node_title, form.node_id);
                }
            }
            SessionUpdate::Failed { role, error } => {
                printer.finish();
                eprintln!("error ({role}): {error}");
            }
            SessionUpdate::Completed { .. } => printer.finish(),
            SessionUpdate::SuggestedQuestions(questions) => {
                for question in questions {
                    println!("  > {question}");
                }
            }
        }
    }
    printer.finish();
}

fn request_for(args: &Args, query: &str, inputs: &[(String, Value)]) -> SendRequest {
    let mut request =
        SendRequest::new(query).with_extra("user", Value::String(args.user.clone()));
    for (name, value) in inputs {
        request = request.with_input(name.clone(), value.clone());
    }
    request
}

async fn interactive(
    args: &Args,
    session: &mut ChatSession<HttpChatBackend>,
    enrichment: EnrichmentOptions,
    inputs: &[(String, Value)],
) -> Result<()> {
    let mut printer = Printer::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    print_thread(session);
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        match line.split_once(' ').map_or((line, ""), |(cmd, rest)| (cmd, rest.trim())) {
            ("", _) => {}
            ("/quit", _) => break,
            ("/stop", _) => session.stop(),
            ("/restart", _) => {
                session.restart();
                print_thread(session);
            }
            ("/thread", _) => print_thread(session),
            ("/switch", id) => {
                if session.switch_to_sibling(id, enrichment) {
                    print_thread(session);
                    drive(session, &mut printer).await;
                } else {
                    eprintln!("unknown turn {id:?}");
                }
            }
            _ => {
                if session.send(&args.endpoint, request_for(args, line, inputs), enrichment) {
                    drive(session, &mut printer).await;
                } else {
                    eprintln!("question not sent (see log)");
                }
            }
        }
    }

    session.stop();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config = resolve_config(&args)?;
    info!(base_url = %config.base_url, source = %config.source(), "Configuration loaded");

    let inputs = args
        .inputs
        .iter()
        .map(|raw| parse_input(raw))
        .collect::<Result<Vec<_>>>()?;

    let backend = HttpChatBackend::from_config(&config).context("Failed to build HTTP client")?;
    let enrichment = EnrichmentOptions::from_config(&config);
    let mut session = ChatSession::new(backend, &config);

    match args.query.clone() {
        Some(query) => {
            if !session.send(&args.endpoint, request_for(&args, &query, &inputs), enrichment) {
                anyhow::bail!("Question was not sent");
            }
            drive(&mut session, &mut Printer::default()).await;
        }
        None => interactive(&args, &mut session, enrichment, &inputs).await?,
    }

    if session.is_responding() {
        warn!("Exiting while a response is still streaming");
        session.stop();
    }
    Ok(())
}
