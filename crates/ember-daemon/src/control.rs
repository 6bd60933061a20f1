//! Line-oriented control surface
//!
//! One command per line in, one reply out. Commands map onto `DaemonHandle`.

use crate::coordinator::DaemonHandle;
use crate::error::DaemonError;
use std::path::PathBuf;
use std::str::FromStr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

pub const HELP: &str = "\
commands:
  veto [reason]     force the judge mask on the next tick
  ask <text>        hand a question to the deliberative loop
  status            show resources and behavior
  export [path]     write a signed seed
  import <path>     resume from a signed seed
  verify            check the receipt chain
  help              this text
  quit              shut down";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Veto(Option<String>),
    Ask(String),
    Status,
    Export(Option<PathBuf>),
    Import(PathBuf),
    Verify,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlParseError {
    #[error("empty command")]
    Empty,
    #[error("unknown command {0:?} (try `help`)")]
    Unknown(String),
    #[error("`{0}` needs an argument")]
    MissingArgument(&'static str),
}

impl FromStr for ControlCommand {
    type Err = ControlParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };
        let arg = (!rest.is_empty()).then(|| rest.to_string());

        match verb.to_ascii_lowercase().as_str() {
            "" => Err(ControlParseError::Empty),
            "veto" => Ok(ControlCommand::Veto(arg)),
            "ask" => arg.map(ControlCommand::Ask).ok_or(ControlParseError::MissingArgument("ask")),
            "status" => Ok(ControlCommand::Status),
            "export" => Ok(ControlCommand::Export(arg.map(PathBuf::from))),
            "import" => arg
                .map(|p| ControlCommand::Import(PathBuf::from(p)))
                .ok_or(ControlParseError::MissingArgument("import")),
            "verify" => Ok(ControlCommand::Verify),
            "help" | "?" => Ok(ControlCommand::Help),
            "quit" | "exit" => Ok(ControlCommand::Quit),
            other => Err(ControlParseError::Unknown(other.to_string())),
        }
    }
}

/// Run one command. The bool is true when the surface should close.
pub async fn execute(command: ControlCommand, handle: &DaemonHandle) -> (String, bool) {
    let reply = match command {
        ControlCommand::Veto(reason) => handle.veto(reason).map(|_| "veto queued".to_string()),
        ControlCommand::Ask(text) => handle.query(text).map(|_| "question queued".to_string()),
        ControlCommand::Status => Ok(handle.status().await.to_string()),
        ControlCommand::Export(path) => handle
            .export(path)
            .await
            .map(|p| format!("exported {}", p.display())),
        ControlCommand::Import(path) => handle
            .import(&path)
            .await
            .map(|_| format!("imported {}", path.display())),
        ControlCommand::Verify => Ok(match handle.verify().await {
            Ok(n) => format!("chain ok ({} receipts)", n),
            Err(fault) => format!("chain broken: {}", fault),
        }),
        ControlCommand::Help => Ok(HELP.to_string()),
        ControlCommand::Quit => {
            handle.shutdown();
            return ("bye".to_string(), true);
        }
    };
    match reply {
        Ok(text) => (text, false),
        Err(DaemonError::Stopped) => ("daemon has stopped".to_string(), true),
        Err(e) => (format!("error: {}", e), false),
    }
}

/// Serve commands from `reader` until EOF, `quit`, or the daemon stopping.
pub async fn serve<R, W>(reader: R, mut writer: W, handle: DaemonHandle) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    loop {
        let line = tokio::select! {
            _ = handle.stopped() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        debug!("control: {}", line);

        let (reply, done) = match line.parse::<ControlCommand>() {
            Ok(command) => execute(command, &handle).await,
            Err(e) => {
                warn!("Invalid control command {:?}: {}", line, e);
                (format!("error: {}", e), false)
            }
        };
        writer.write_all(reply.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        if done {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Result<ControlCommand, ControlParseError> {
        s.parse()
    }

    #[test]
    fn parses_every_command() {
        assert_eq!(parse("veto"), Ok(ControlCommand::Veto(None)));
        assert_eq!(parse("veto  too hot "), Ok(ControlCommand::Veto(Some("too hot".into()))));
        assert_eq!(parse("ask how are you?"), Ok(ControlCommand::Ask("how are you?".into())));
        assert_eq!(parse("STATUS"), Ok(ControlCommand::Status));
        assert_eq!(parse("export"), Ok(ControlCommand::Export(None)));
        assert_eq!(
            parse("export /tmp/a.seed"),
            Ok(ControlCommand::Export(Some("/tmp/a.seed".into())))
        );
        assert_eq!(parse("import a.seed"), Ok(ControlCommand::Import("a.seed".into())));
        assert_eq!(parse("verify"), Ok(ControlCommand::Verify));
        assert_eq!(parse("help"), Ok(ControlCommand::Help));
        assert_eq!(parse("quit"), Ok(ControlCommand::Quit));
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(parse("   "), Err(ControlParseError::Empty));
        assert_eq!(parse("ask"), Err(ControlParseError::MissingArgument("ask")));
        assert_eq!(parse("import   "), Err(ControlParseError::MissingArgument("import")));
        assert!(matches!(parse("dance"), Err(ControlParseError::Unknown(_))));
    }
}
