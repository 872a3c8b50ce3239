//! Line-oriented operator console on stdin.

use anyhow::{Context, Result};
use tiller_core::SupervisorHandle;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConsoleCommand {
    Throttle(f64),
    Steering(f64),
    Stop,
    Connect,
    Disconnect,
    Quit,
}

pub fn parse_line(line: &str) -> Result<Option<ConsoleCommand>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let value = |name: &str, raw: Option<&str>| -> Result<f64, String> {
        raw.ok_or_else(|| format!("{name} needs a value in [-1, 1]"))?
            .parse::<f64>()
            .map_err(|err| format!("bad {name} value: {err}"))
    };
    let command = match verb {
        "t" | "throttle" => ConsoleCommand::Throttle(value("throttle", words.next())?),
        "s" | "steer" | "steering" => ConsoleCommand::Steering(value("steering", words.next())?),
        "stop" => ConsoleCommand::Stop,
        "connect" => ConsoleCommand::Connect,
        "disconnect" => ConsoleCommand::Disconnect,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => return Err(format!("unknown command `{other}`")),
    };
    Ok(Some(command))
}

/// Reads commands until `quit` or end of input.
pub async fn run(handle: SupervisorHandle) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        match parse_line(&line) {
            Ok(Some(ConsoleCommand::Throttle(value))) => handle.setpoints().set_throttle(value),
            Ok(Some(ConsoleCommand::Steering(value))) => handle.setpoints().set_steering(value),
            Ok(Some(ConsoleCommand::Stop)) => handle.setpoints().halt(),
            Ok(Some(ConsoleCommand::Connect)) => handle.connect(),
            Ok(Some(ConsoleCommand::Disconnect)) => handle.disconnect(),
            Ok(Some(ConsoleCommand::Quit)) => {
                info!("quit requested");
                return Ok(());
            }
            Ok(None) => {}
            Err(message) => warn!("{message}"),
        }
    }
    Ok(())
}
