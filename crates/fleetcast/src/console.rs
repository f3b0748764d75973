//! Line-oriented operator console.
//!
//! Reads one command per line and turns it into group operations. The
//! console never touches synchronization itself; every broadcast blocks in
//! [`BroadcastGroup::broadcast`] until the round is complete.
//!
//! Lines arrive over a channel fed by [`spawn_reader`], so an interrupt can
//! end the console between rounds even while a read is pending.

use anyhow::Result;
use broadcast::{BroadcastGroup, DirectiveKind, HostFilter, Outcome, RoundReport};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, Sender};
use std::thread;
use tracing::{debug, info, warn};

const HELP: &str = "\
commands:
  hosts <all|none|ADDR|NET>   restrict later rounds to matching hosts
  run <command>               run a command on every targeted host
  upload <local> <remote>     copy a local file to every targeted host
                              (quote paths that contain spaces)
  admit                       add sessions registered since the group formed
  list                        show group members
  help                        show this text
  exit                        shut the group down and quit";

/// One unit of console input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleInput {
    Line(String),
    /// Operator interrupt: stop serving before the next command.
    Interrupted,
    /// End of input.
    Closed,
}

/// Forward lines from `input` until it ends or fails.
pub fn spawn_reader(
    input: impl BufRead + Send + 'static,
    tx: Sender<ConsoleInput>,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("console-reader".into())
        .spawn(move || {
            for line in input.lines() {
                match line {
                    Ok(line) => {
                        if tx.send(ConsoleInput::Line(line)).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to read console input");
                        break;
                    }
                }
            }
            let _ = tx.send(ConsoleInput::Closed);
        })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Hosts(HostFilter),
    Run(String),
    Upload { local: PathBuf, remote: String },
    Admit,
    List,
    Help,
    Exit,
}

impl ConsoleCommand {
    /// Parse one input line. Blank lines yield `Ok(None)`.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };

        let command = match verb {
            "hosts" => {
                let filter = rest.parse().map_err(|e| format!("{e}"))?;
                Self::Hosts(filter)
            }
            "run" if !rest.is_empty() => Self::Run(rest.to_string()),
            "run" => return Err("usage: run <command>".into()),
            "upload" => match split_args(rest)?.as_slice() {
                [local, remote] => Self::Upload {
                    local: PathBuf::from(local),
                    remote: remote.clone(),
                },
                _ => return Err("usage: upload <local> <remote>".into()),
            },
            "admit" => Self::Admit,
            "list" => Self::List,
            "help" | "?" => Self::Help,
            "exit" | "quit" => Self::Exit,
            other => return Err(format!("unknown command {other:?}, try \"help\"")),
        };
        Ok(Some(command))
    }
}

/// Whitespace-separated words; double quotes group a word with spaces.
fn split_args(text: &str) -> Result<Vec<String>, String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quoted = false;

    for c in text.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                in_word = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_word {
                    args.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if quoted {
        return Err("unterminated quote".into());
    }
    if in_word {
        args.push(current);
    }
    Ok(args)
}

/// Serve commands from `input` until `exit`, an interrupt, or end of input.
///
/// Broadcast errors are fatal: a group that lost track of its members must
/// not keep broadcasting.
pub fn run(
    group: &mut BroadcastGroup,
    input: &Receiver<ConsoleInput>,
    out: &mut impl Write,
) -> Result<()> {
    writeln!(out, "{} sessions ready, type \"help\" for commands", group.len())?;

    loop {
        write!(out, "fleetcast> ")?;
        out.flush()?;
        let line = match input.recv() {
            Ok(ConsoleInput::Line(line)) => line,
            Ok(ConsoleInput::Interrupted) => {
                writeln!(out, "interrupted")?;
                info!("Console interrupted");
                break;
            }
            Ok(ConsoleInput::Closed) | Err(_) => {
                writeln!(out)?;
                break;
            }
        };

        let command = match ConsoleCommand::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(message) => {
                writeln!(out, "{message}")?;
                continue;
            }
        };
        debug!(?command, "Console command");

        match command {
            ConsoleCommand::Hosts(filter) => {
                group.set_host_filter(filter);
                writeln!(out, "host filter: {filter}")?;
            }
            ConsoleCommand::Run(command) => {
                let report = group.broadcast(DirectiveKind::RunCommand(command))?;
                print_report(out, &report)?;
            }
            ConsoleCommand::Upload { local, remote } => {
                if !local.is_file() {
                    writeln!(out, "{} is not a file", local.display())?;
                    continue;
                }
                let report = group.broadcast(DirectiveKind::UploadFile { local, remote })?;
                print_report(out, &report)?;
            }
            ConsoleCommand::Admit => {
                let admitted = group.admit_registered()?;
                writeln!(out, "admitted {admitted} sessions")?;
            }
            ConsoleCommand::List => {
                for (attempt, liveness) in group.members() {
                    writeln!(out, "{attempt} ({liveness})")?;
                }
                writeln!(out, "{} members, filter {}", group.len(), group.host_filter())?;
            }
            ConsoleCommand::Help => writeln!(out, "{HELP}")?,
            ConsoleCommand::Exit => break,
        }
    }
    Ok(())
}

fn print_report(out: &mut impl Write, report: &RoundReport) -> Result<()> {
    for result in &report.results {
        match &result.outcome {
            Outcome::Output(output) => {
                writeln!(out, "--- {}", result.attempt)?;
                out.write_all(&output.stdout)?;
                for line in output.stderr_lossy().lines() {
                    writeln!(out, "stderr: {line}")?;
                }
            }
            Outcome::UploadAck => writeln!(out, "--- {} uploaded", result.attempt)?,
            Outcome::Failure(reason) => writeln!(
                out,
                "--- {} failed: {reason} ({})",
                result.attempt, result.liveness
            )?,
            Outcome::Skipped => {}
        }
    }
    writeln!(
        out,
        "round {}: {} ok, {} failed, {} skipped",
        report.round,
        report.succeeded().count(),
        report.failed().count(),
        report.skipped().count()
    )?;
    Ok(())
}
