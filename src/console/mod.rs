//! Console - Line-based operator commands read from stdin

use std::io::BufRead;
use std::path::PathBuf;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::network::NodeEvent;
use crate::overlay::work::StartRequest;
use crate::protocol::{CheckerRef, Range};

/// Operator commands
#[derive(Debug, Clone)]
pub enum Command {
    Start(StartRequest),
    Disconnect,
    Routes,
}

/// Console parse errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Missing argument: {0}")]
    MissingArgument(&'static str),

    #[error("Malformed argument: {0}")]
    MalformedArgument(String),

    #[error("Invalid range: {0}")]
    InvalidRange(String),
}

/// Parse one console line. Blank lines yield `None`.
pub fn parse(line: &str) -> Result<Option<Command>, ParseError> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };

    match verb {
        "start" => parse_start(words).map(Some),
        "disconnect" => Ok(Some(Command::Disconnect)),
        "routes" => Ok(Some(Command::Routes)),
        other => Err(ParseError::UnknownCommand(other.to_string())),
    }
}

fn parse_start<'a>(words: impl Iterator<Item = &'a str>) -> Result<Command, ParseError> {
    let mut locator = None;
    let mut name = None;
    let mut from = None;
    let mut to = None;
    let mut output = None;

    for word in words {
        let (key, value) = word
            .split_once('=')
            .ok_or_else(|| ParseError::MalformedArgument(word.to_string()))?;
        match key {
            "locator" => locator = Some(value.to_string()),
            "name" => name = Some(value.to_string()),
            "from" => from = Some(parse_bound(value)?),
            "to" => to = Some(parse_bound(value)?),
            "output" => output = Some(PathBuf::from(value)),
            _ => return Err(ParseError::MalformedArgument(word.to_string())),
        }
    }

    let locator = locator.ok_or(ParseError::MissingArgument("locator"))?;
    let name = name.ok_or(ParseError::MissingArgument("name"))?;
    let from = from.ok_or(ParseError::MissingArgument("from"))?;
    let to = to.ok_or(ParseError::MissingArgument("to"))?;
    let range = Range::new(from, to).map_err(|e| ParseError::InvalidRange(e.to_string()))?;

    Ok(Command::Start(StartRequest {
        checker: CheckerRef::new(locator, name),
        range,
        output,
    }))
}

fn parse_bound(value: &str) -> Result<i64, ParseError> {
    value
        .parse()
        .map_err(|_| ParseError::MalformedArgument(value.to_string()))
}

/// Read commands from stdin and forward them to the node loop.
///
/// Runs on a plain thread so a pending read never holds up runtime shutdown.
pub fn spawn(
    events: mpsc::UnboundedSender<NodeEvent>,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("console".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::error!("Console read failed: {}", e);
                        break;
                    }
                };
                match parse(&line) {
                    Ok(Some(command)) => {
                        if events.send(NodeEvent::Command(command)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!("{}", e),
                }
            }
            tracing::debug!("Console closed");
        })
}
