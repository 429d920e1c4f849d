//! Slash command parsing for the interactive shell.
//!
//! Input that starts with `/` controls the session and is never sent to the
//! model.

/// A parsed slash command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    /// Clear the conversation history.
    Clear,

    /// Change the model.
    Model(String),

    /// List saved memories.
    Memories,

    /// Delete a saved memory by its zero-based index.
    Forget(usize),

    /// Display session statistics.
    Stats,

    /// Print the crate version.
    Version,

    /// Display help information.
    Help,

    /// Exit the shell.
    Quit,

    /// Report a parsing error back to the caller.
    Invalid(String),
}

/// Parses user input for slash commands.
///
/// Returns `Some(ChatCommand)` if the input is a command, or `None` if it
/// should be sent to the model.
///
/// ```
/// # use eddie::commands::{ChatCommand, parse_command};
/// assert_eq!(parse_command("/quit"), Some(ChatCommand::Quit));
/// assert_eq!(parse_command("/forget 2"), Some(ChatCommand::Forget(1)));
/// assert!(parse_command("What's the weather like?").is_none());
/// ```
pub fn parse_command(input: &str) -> Option<ChatCommand> {
    let input = input.trim();
    let rest = input.strip_prefix('/')?;

    let mut parts = rest.splitn(2, ' ');
    let command = parts.next()?.to_lowercase();
    let argument = parts.next().map(str::trim).filter(|s| !s.is_empty());

    let result = match command.as_str() {
        "clear" => ChatCommand::Clear,
        "model" => match argument {
            Some(model) => ChatCommand::Model(model.to_string()),
            None => ChatCommand::Invalid("/model requires a model name".to_string()),
        },
        "memories" | "memory" => ChatCommand::Memories,
        "forget" => match argument.map(str::parse::<usize>) {
            Some(Ok(n)) if n >= 1 => ChatCommand::Forget(n - 1),
            Some(_) => ChatCommand::Invalid("/forget expects a memory number from /memories".to_string()),
            None => ChatCommand::Invalid("/forget requires a memory number".to_string()),
        },
        "stats" | "status" => ChatCommand::Stats,
        "version" => ChatCommand::Version,
        "help" | "?" => ChatCommand::Help,
        "quit" | "exit" | "q" => ChatCommand::Quit,
        _ => ChatCommand::Invalid(format!("Unknown command: /{command}")),
    };

    Some(result)
}

/// Returns help text describing available commands.
pub fn help_text() -> &'static str {
    r#"Available commands:
  /clear                 Clear conversation history (memories are kept)
  /model <name>          Change the model (e.g., /model gpt-4o-mini)
  /memories              List saved memories
  /forget <n>            Delete memory number n
  /stats                 Show session statistics
  /version               Show the version
  /help                  Show this help message
  /quit                  Exit"#
}
