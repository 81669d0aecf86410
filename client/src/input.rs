//! Terminal command parsing and the stdin reader task

use log::{debug, warn};
use shared::BOARD_SIZE;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::error::ClientError;

/// One line of user input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Place { row: usize, col: usize },
    Attack { row: usize, col: usize },
    Show,
    New,
    Quit,
}

pub const HELP: &str = "commands: place <row> <col> | attack <row> <col> | show | new | quit";

fn coordinate(word: Option<&str>, name: &str) -> Result<usize, ClientError> {
    let word = word.ok_or_else(|| ClientError::Input(format!("missing {}", name)))?;
    let value: usize = word
        .parse()
        .map_err(|_| ClientError::Input(format!("{} '{}' is not a number", name, word)))?;
    if value >= BOARD_SIZE {
        return Err(ClientError::Input(format!(
            "{} {} is off the {}x{} board",
            name, value, BOARD_SIZE, BOARD_SIZE
        )));
    }
    Ok(value)
}

/// Parses one command line. Matching is case-insensitive.
pub fn parse_command(line: &str) -> Result<Command, ClientError> {
    let lowered = line.trim().to_lowercase();
    let mut words = lowered.split_whitespace();
    let verb = words
        .next()
        .ok_or_else(|| ClientError::Input("empty command".to_string()))?;

    let command = match verb {
        "place" | "p" => Command::Place {
            row: coordinate(words.next(), "row")?,
            col: coordinate(words.next(), "col")?,
        },
        "attack" | "a" | "fire" => Command::Attack {
            row: coordinate(words.next(), "row")?,
            col: coordinate(words.next(), "col")?,
        },
        "show" | "s" => Command::Show,
        "new" => Command::New,
        "quit" | "q" | "exit" => Command::Quit,
        other => return Err(ClientError::Input(format!("unknown command '{}'", other))),
    };

    if words.next().is_some() {
        return Err(ClientError::Input("too many arguments".to_string()));
    }
    Ok(command)
}

/// Spawns task that reads stdin line by line and forwards parsed commands.
/// End of input is forwarded as `Quit`.
pub fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<Command> {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match parse_command(&line) {
                    Ok(command) => {
                        debug!("Command: {:?}", command);
                        if tx.send(command).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        println!("{}", e);
                        println!("{}", HELP);
                    }
                },
                Ok(None) => {
                    let _ = tx.send(Command::Quit);
                    break;
                }
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    let _ = tx.send(Command::Quit);
                    break;
                }
            }
        }
    });

    rx
}
