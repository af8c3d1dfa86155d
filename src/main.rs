use clap::{CommandFactory, Parser};
use colored::*;
use std::io::{self, Write};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;

use chatprob::cli::Args;
use chatprob::render::{render_probabilities, render_tokens, render_turn};
use chatprob::{
    Config, DeliveryMode, ModelBackend, OpenAiBackend, SnapshotFile, TurnCoordinator, TurnEvent,
    TurnOutcome,
};

// ---------------------------------------------------------------------------
// REPL commands
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
enum Command {
    Send(String),
    Toggle(Option<usize>),
    Probs { turn: usize, token: usize },
    Tokens(Option<usize>),
    History,
    Clear,
    Help,
    Quit,
}

fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Command::Send(line.to_string()));
    };
    let mut parts = rest.split_whitespace();
    let name = parts.next().unwrap_or("");
    let mut number = |what: &str| -> Result<Option<usize>, String> {
        parts
            .next()
            .map(|s| s.parse::<usize>().map_err(|_| format!("{what} must be a number, got {s:?}")))
            .transpose()
    };
    match name {
        "toggle" | "t" => Ok(Command::Toggle(number("turn")?)),
        "tokens" => Ok(Command::Tokens(number("turn")?)),
        "probs" | "p" => {
            let turn = number("turn")?.ok_or("usage: /probs <turn> <token>")?;
            let token = number("token")?.ok_or("usage: /probs <turn> <token>")?;
            Ok(Command::Probs { turn, token })
        }
        "history" | "h" => Ok(Command::History),
        "clear" => Ok(Command::Clear),
        "help" | "?" => Ok(Command::Help),
        "quit" | "exit" | "q" => Ok(Command::Quit),
        other => Err(format!("unknown command /{other} (try /help)")),
    }
}

fn print_help() {
    println!("{}", "Commands:".bright_green());
    println!("  <text>                 send a message");
    println!("  /toggle [turn]         show the next candidate (default: last reply)");
    println!("  /tokens [turn]         list the tokens of the shown candidate");
    println!("  /probs <turn> <token>  top alternatives for one token");
    println!("  /history               reprint the conversation");
    println!("  /clear                 start over and delete the saved session");
    println!("  /quit                  leave");
}

fn print_banner<B: ModelBackend>(coordinator: &TurnCoordinator<B>, model: &str, heat: bool) {
    println!("{}", "CHATPROB".bright_cyan().bold());
    println!("{}: {}", "Model".bright_yellow(), model);
    println!(
        "{}: {} candidates, top {} alternatives",
        "Sampling".bright_yellow(),
        coordinator.params().candidates,
        coordinator.params().top_k
    );
    println!("{}: {:?}", "Delivery".bright_yellow(), coordinator.mode());
    if heat {
        println!(
            "{}: {} {} {} {}",
            "Legend".bright_white(),
            "Confident".on_blue(),
            "Unsure".on_yellow(),
            "Doubtful".on_red(),
            "Unlikely".on_bright_red().bright_white()
        );
    }
    println!("{}", "=".repeat(50).bright_blue());
}

fn print_history<B: ModelBackend>(coordinator: &TurnCoordinator<B>, heat: bool) {
    if coordinator.turns().is_empty() {
        println!("{}", "(empty conversation)".dimmed());
    }
    for (i, turn) in coordinator.turns().iter().enumerate() {
        print!("{}", render_turn(i, turn, heat));
    }
}

/// Index of the newest assistant turn, for commands whose turn is optional.
fn last_reply<B: ModelBackend>(coordinator: &TurnCoordinator<B>) -> Option<usize> {
    coordinator
        .turns()
        .iter()
        .rposition(|t| t.role == chatprob::Role::Assistant)
}

// ---------------------------------------------------------------------------
// Live turn display
// ---------------------------------------------------------------------------

/// Print the part of `content` not shown yet.
fn print_delta(shown: &mut usize, content: &str) {
    if let Some(new) = content.get(*shown..) {
        print!("{new}");
        let _ = io::stdout().flush();
    }
    *shown = content.len();
}

async fn run_turn<B: ModelBackend>(
    coordinator: &mut TurnCoordinator<B>,
    rx: &mut mpsc::UnboundedReceiver<TurnEvent>,
    text: &str,
    heat: bool,
) {
    let mut shown = 0usize;
    let mut live = false;
    let outcome = {
        let submit = coordinator.submit(text);
        tokio::pin!(submit);
        loop {
            tokio::select! {
                outcome = &mut submit => break outcome,
                Some(event) = rx.recv() => {
                    if let TurnEvent::Content { content, .. } = event {
                        if !live {
                            println!("{}", "AI".bright_cyan().bold());
                            live = true;
                        }
                        print_delta(&mut shown, &content);
                    }
                }
            }
        }
    };
    while rx.try_recv().is_ok() {}
    if live {
        println!();
    }

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            eprintln!("{}", e.to_string().bright_red());
            return;
        }
    };
    if let TurnOutcome::Errored { error, .. } = &outcome {
        eprintln!("{} {}", "error:".bright_red(), error);
    }
    if let Some(turn) = coordinator.turns().get(outcome.index()) {
        // The settled text can differ from what streamed; show it in full.
        print!("{}", render_turn(outcome.index(), turn, heat));
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("chatprob=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Some(shell) = args.completions {
        let mut cmd = Args::command();
        clap_complete::generate(shell, &mut cmd, "chatprob", &mut io::stdout());
        return Ok(());
    }

    init_logging();

    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);

    let backend = OpenAiBackend::from_config(&config)?;
    let model = backend.model().to_string();
    let mode: DeliveryMode = config.delivery.resolve();

    let (tx, mut rx) = mpsc::unbounded_channel::<TurnEvent>();
    let mut coordinator = TurnCoordinator::new(backend, config.generation.clone(), mode).with_events(tx);
    if let Some(path) = &config.session_path {
        coordinator = coordinator.with_autosave(SnapshotFile::new(path));
    }

    print_banner(&coordinator, &model, args.heatmap);
    match coordinator.restore_from_autosave() {
        Ok(0) => {}
        Ok(n) => {
            println!("{}", format!("Restored {n} turns.").dimmed());
            print_history(&coordinator, args.heatmap);
        }
        Err(e) => eprintln!("{} {}", "could not restore session:".bright_red(), e),
    }
    println!("{}", "Type a message, or /help.".dimmed());

    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    loop {
        print!("{} ", ">".bright_green());
        let _ = io::stdout().flush();

        let Some(line) = lines.next().await.transpose()? else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let command = match parse_command(&line) {
            Ok(c) => c,
            Err(msg) => {
                eprintln!("{}", msg.bright_red());
                continue;
            }
        };

        match command {
            Command::Send(text) => run_turn(&mut coordinator, &mut rx, &text, args.heatmap).await,
            Command::Toggle(turn) => {
                let Some(index) = turn.or_else(|| last_reply(&coordinator)) else {
                    eprintln!("{}", "nothing to toggle yet".bright_red());
                    continue;
                };
                match coordinator.toggle(index) {
                    Ok(_) => {
                        if let Some(t) = coordinator.turns().get(index) {
                            print!("{}", render_turn(index, t, args.heatmap));
                        }
                    }
                    Err(e) => eprintln!("{}", e.to_string().bright_red()),
                }
            }
            Command::Tokens(turn) => {
                let candidate = turn
                    .or_else(|| last_reply(&coordinator))
                    .and_then(|i| coordinator.turns().get(i))
                    .and_then(|t| t.active_candidate());
                match candidate {
                    Some(c) => println!("{}", render_tokens(c)),
                    None => eprintln!("{}", "no candidate at that turn".bright_red()),
                }
            }
            Command::Probs { turn, token } => {
                let trace = coordinator
                    .turns()
                    .get(turn)
                    .and_then(|t| t.active_candidate())
                    .and_then(|c| c.token_trace.get(token));
                match trace {
                    Some(t) => print!("{}", render_probabilities(t)),
                    None => eprintln!("{}", format!("no token {token} in turn {turn}").bright_red()),
                }
            }
            Command::History => print_history(&coordinator, args.heatmap),
            Command::Clear => {
                match coordinator.reset() {
                    Ok(()) => println!("{}", "Conversation cleared.".dimmed()),
                    Err(e) => eprintln!("{} {}", "could not delete session:".bright_red(), e),
                }
            }
            Command::Help => print_help(),
            Command::Quit => break,
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
