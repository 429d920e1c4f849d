//! Interactive shell for chatting with Eddie.
//!
//! Eddie streams replies from any OpenAI-compatible endpoint and keeps a list
//! of things it has learned about you between sessions.
//!
//! # Usage
//!
//! ```bash
//! # Talk to the OpenAI API (reads EDDIE_API_KEY or OPENAI_API_KEY)
//! eddie
//!
//! # Talk to a local Ollama server
//! eddie --base-url http://localhost:11434/v1 --model llama3.1
//!
//! # More logging
//! RUST_LOG=eddie=debug eddie
//! ```
//!
//! # Commands
//!
//! - `/help` - Show available commands
//! - `/clear` - Clear conversation history
//! - `/memories` - List saved memories
//! - `/forget <n>` - Delete a saved memory
//! - `/model <name>` - Change the model
//! - `/stats` - Show session statistics
//! - `/quit` - Exit the application

use std::cell::Cell;
use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arrrg::CommandLine;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing_subscriber::EnvFilter;

use eddie::commands::{ChatCommand, help_text, parse_command};
use eddie::{CompletionEndpoint, EddieArgs, EddieConfig, SessionEngine};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    let (args, _) = EddieArgs::from_command_line_relaxed("eddie [OPTIONS]");
    let config = EddieConfig::load(&args)?;
    // Set while a reply is streaming; the engine stops at the next fragment.
    let interrupted = Arc::new(AtomicBool::new(false));
    let interrupted_clone = interrupted.clone();
    ctrlc::set_handler(move || {
        interrupted_clone.store(true, Ordering::SeqCst);
    })?;

    let client = config.client()?.with_interrupt(interrupted.clone());
    let store = config.memory_store()?;
    let mut session = SessionEngine::new(client, store, config.session_config())?;
    let mut rl = DefaultEditor::new()?;

    println!("Eddie (model: {})", session.model());
    println!("Type /help for commands, /quit to exit\n");
    println!("Eddie: {}\n", session.first_message());

    loop {
        interrupted.store(false, Ordering::SeqCst);

        match rl.readline("You: ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(line);

                if let Some(cmd) = parse_command(line) {
                    if !run_command(&mut session, cmd) {
                        break;
                    }
                    continue;
                }

                let line_open = Cell::new(false);
                let result = session
                    .chat_with(
                        line,
                        |chunk| {
                            if !line_open.replace(true) {
                                print!("Eddie: ");
                            }
                            print!("{chunk}");
                            let _ = io::stdout().flush();
                        },
                        |memory| {
                            if line_open.replace(false) {
                                println!();
                            }
                            println!("    (memorized: {memory})");
                        },
                        &interrupted,
                    )
                    .await;
                if line_open.get() {
                    println!();
                }
                match result {
                    Ok(_) => println!(),
                    Err(err) if err.is_abort() => println!("[interrupted]\n"),
                    Err(err) => eprintln!("Error: {err}\n"),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!();
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("\nGoodbye!");
                break;
            }
            Err(err) => {
                eprintln!("Input error: {err}");
                break;
            }
        }
    }

    Ok(())
}

/// Run a slash command.  Returns false when the shell should exit.
fn run_command<E: CompletionEndpoint>(session: &mut SessionEngine<E>, cmd: ChatCommand) -> bool {
    match cmd {
        ChatCommand::Quit => {
            println!("Goodbye!");
            return false;
        }
        ChatCommand::Clear => {
            session.clear();
            println!("    Conversation cleared.");
        }
        ChatCommand::Help => {
            for line in help_text().lines() {
                println!("    {line}");
            }
        }
        ChatCommand::Model(model) => {
            println!("    Model changed to: {model}");
            session.set_model(model);
        }
        ChatCommand::Memories => match session.load_memories() {
            Ok(memories) if memories.is_empty() => println!("    No memories saved."),
            Ok(memories) => {
                for (idx, memory) in memories.iter().enumerate() {
                    println!("    {}. {memory}", idx + 1);
                }
            }
            Err(err) => eprintln!("    Error: {err}"),
        },
        ChatCommand::Forget(index) => {
            let forgotten = session.memories().get(index).cloned();
            match session.delete_memory(index) {
                Ok(()) => match forgotten {
                    Some(memory) => println!("    Forgot: {memory}"),
                    None => println!("    Forgot memory {}.", index + 1),
                },
                Err(err) => eprintln!("    Error: {err}"),
            }
        }
        ChatCommand::Stats => {
            let stats = session.stats();
            println!("    Session Statistics:");
            println!("      Model: {}", stats.model);
            println!("      Messages: {}", stats.message_count);
            println!("      Memories: {} ({})", stats.memory_count, session.store().path().display());
            println!("      Turns: {}", stats.total_turns);
            println!("      Requests: {}", stats.total_requests);
            println!("      Tool calls: {}", stats.total_tool_calls);
        }
        ChatCommand::Version => {
            println!("    eddie {}", env!("CARGO_PKG_VERSION"));
        }
        ChatCommand::Invalid(message) => {
            eprintln!("    {message}");
        }
    }
    true
}
