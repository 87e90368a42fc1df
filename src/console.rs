//! # Operator Console
//!
//! Line commands typed on standard input. A reader task parses lines and
//! forwards commands over a bounded channel; the control loop takes at most
//! one command per tick and stays the only writer of node state.

use std::fmt;
use std::str::FromStr;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Commands waiting for the control loop
pub const COMMAND_QUEUE_DEPTH: usize = 8;

pub const HELP_TEXT: &str = "Commands:\n  \
    config (c)  enter configuration mode\n  \
    reset  (r)  clear saved configuration and restart\n  \
    status (s)  print node status\n  \
    help   (h)  show this help\n  \
    reboot (b)  restart the node";

/// One operator command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCommand {
    EnterConfig,
    ResetCredentials,
    Status,
    Help,
    Reboot,
}

impl FromStr for ConsoleCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        match line.trim().to_ascii_lowercase().as_str() {
            "config" | "c" => Ok(ConsoleCommand::EnterConfig),
            "reset" | "r" => Ok(ConsoleCommand::ResetCredentials),
            "status" | "s" => Ok(ConsoleCommand::Status),
            "help" | "h" | "?" => Ok(ConsoleCommand::Help),
            "reboot" | "b" => Ok(ConsoleCommand::Reboot),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for ConsoleCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsoleCommand::EnterConfig => "config",
            ConsoleCommand::ResetCredentials => "reset",
            ConsoleCommand::Status => "status",
            ConsoleCommand::Help => "help",
            ConsoleCommand::Reboot => "reboot",
        };
        f.write_str(name)
    }
}

/// Read commands from `input` until it closes or the receiver is dropped.
pub fn spawn_reader<R>(input: R) -> (mpsc::Receiver<ConsoleCommand>, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    let handle = tokio::spawn(async move {
        let mut lines = BufReader::new(input).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    debug!("Console input closed");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Console read failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match line.parse::<ConsoleCommand>() {
                Ok(command) => {
                    if tx.send(command).await.is_err() {
                        break;
                    }
                }
                Err(unknown) => warn!(command = %unknown, "Unknown command; type 'help'"),
            }
        }
    });
    (rx, handle)
}

/// Read commands from the process's standard input.
pub fn spawn_stdin_reader() -> (mpsc::Receiver<ConsoleCommand>, JoinHandle<()>) {
    spawn_reader(tokio::io::stdin())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_parse_commands_and_aliases() {
        assert_eq!("config".parse::<ConsoleCommand>(), Ok(ConsoleCommand::EnterConfig));
        assert_eq!(" C \r".parse::<ConsoleCommand>(), Ok(ConsoleCommand::EnterConfig));
        assert_eq!("r".parse::<ConsoleCommand>(), Ok(ConsoleCommand::ResetCredentials));
        assert_eq!("STATUS".parse::<ConsoleCommand>(), Ok(ConsoleCommand::Status));
        assert_eq!("h".parse::<ConsoleCommand>(), Ok(ConsoleCommand::Help));
        assert_eq!("b".parse::<ConsoleCommand>(), Ok(ConsoleCommand::Reboot));
        assert_eq!("fly".parse::<ConsoleCommand>(), Err("fly".to_string()));
    }

    #[test]
    fn test_help_lists_every_command() {
        for command in [
            ConsoleCommand::EnterConfig,
            ConsoleCommand::ResetCredentials,
            ConsoleCommand::Status,
            ConsoleCommand::Help,
            ConsoleCommand::Reboot,
        ] {
            assert!(HELP_TEXT.contains(&command.to_string()), "{}", command);
        }
    }

    #[tokio::test]
    async fn test_reader_forwards_known_commands() {
        let (mut writer, reader) = tokio::io::duplex(256);
        let (mut rx, handle) = spawn_reader(reader);

        writer.write_all(b"status\n\nbogus\nconfig\n").await.unwrap();
        drop(writer);

        assert_eq!(rx.recv().await, Some(ConsoleCommand::Status));
        assert_eq!(rx.recv().await, Some(ConsoleCommand::EnterConfig));
        assert_eq!(rx.recv().await, None);
        handle.await.unwrap();
    }
}
