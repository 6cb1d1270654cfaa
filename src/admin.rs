//! Line-oriented admin console.
//!
//! One command per line. Every response is zero or more body lines followed
//! by a final `OK`, or a single `ERR <message>` line. A bad command never
//! closes the session; only `quit` or end of input does.

use std::net::Ipv4Addr;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::lease::ClientId;

const GREETING: &str = "slowlease admin console, type 'help' for commands";

const HELP: &[(&str, &str)] = &[
    ("leases", "list the lease table (alias: hosts)"),
    ("release <client-id>", "drop a client's lease and pending replies"),
    ("exclude <address>", "take a pool address out of service"),
    ("include <address>", "return an excluded address to the pool"),
    ("events", "protocol events from the last 24 hours"),
    ("configuration", "current server configuration"),
    ("pending", "replies waiting out the delay"),
    ("help", "this list"),
    ("quit", "close the session"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Leases,
    Release(ClientId),
    Exclude(Ipv4Addr),
    Include(Ipv4Addr),
    Events,
    Configuration,
    Pending,
    Quit,
}

fn no_argument(name: &str, argument: Option<&str>, command: Command) -> Result<Command> {
    match argument {
        None => Ok(command),
        Some(_) => Err(Error::AdminProtocol(format!(
            "{} takes no arguments",
            name
        ))),
    }
}

fn address_argument(name: &str, argument: Option<&str>) -> Result<Ipv4Addr> {
    let argument = argument
        .ok_or_else(|| Error::AdminProtocol(format!("usage: {} <address>", name)))?;
    argument
        .parse()
        .map_err(|_| Error::AdminProtocol(format!("invalid address: {}", argument)))
}

/// Parses one console line.
///
/// # Errors
///
/// Returns [`Error::AdminProtocol`] for unknown commands and bad arguments.
pub fn parse_command(line: &str) -> Result<Command> {
    let mut words = line.split_whitespace();
    let Some(name) = words.next() else {
        return Err(Error::AdminProtocol("empty command".to_string()));
    };
    let name = name.to_ascii_lowercase();
    let argument = words.next();
    if words.next().is_some() {
        return Err(Error::AdminProtocol(format!(
            "too many arguments for {}",
            name
        )));
    }

    match name.as_str() {
        "help" | "?" => no_argument(&name, argument, Command::Help),
        "leases" | "hosts" => no_argument(&name, argument, Command::Leases),
        "events" => no_argument(&name, argument, Command::Events),
        "configuration" | "config" => no_argument(&name, argument, Command::Configuration),
        "pending" => no_argument(&name, argument, Command::Pending),
        "quit" | "exit" => no_argument(&name, argument, Command::Quit),
        "release" => {
            let argument = argument
                .ok_or_else(|| Error::AdminProtocol("usage: release <client-id>".to_string()))?;
            Ok(Command::Release(argument.parse()?))
        }
        "exclude" => Ok(Command::Exclude(address_argument(&name, argument)?)),
        "include" => Ok(Command::Include(address_argument(&name, argument)?)),
        _ => Err(Error::AdminProtocol(format!("unknown command: {}", name))),
    }
}

/// What a session writes back for one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub lines: Vec<String>,
    /// The session ends after this response.
    pub close: bool,
}

impl Response {
    fn ok(mut body: Vec<String>, close: bool) -> Self {
        body.push("OK".to_string());
        Self { lines: body, close }
    }

    fn err(error: &Error) -> Self {
        Self {
            lines: vec![format!("ERR {}", error)],
            close: false,
        }
    }

    /// The response as it goes on the wire, one line per `\r\n`.
    pub fn render(&self) -> String {
        let mut text = self.lines.join("\r\n");
        text.push_str("\r\n");
        text
    }
}

/// Executes console commands against the shared engine state.
#[derive(Debug, Clone)]
pub struct AdminConsole {
    engine: Engine,
}

impl AdminConsole {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    /// Runs `command` and returns its body lines.
    pub async fn execute(&self, command: &Command) -> Result<Vec<String>> {
        match command {
            Command::Help => Ok(HELP
                .iter()
                .map(|(usage, description)| format!("{:<22}{}", usage, description))
                .collect()),
            Command::Leases => {
                let leases = self.engine.leases();
                let now = Utc::now();
                let mut lines: Vec<String> = leases
                    .list()
                    .await
                    .iter()
                    .map(|lease| {
                        format!(
                            "{} {} {} expires in {}s{}",
                            lease.client_id,
                            lease.address,
                            lease.state,
                            lease.remaining_seconds(now),
                            lease
                                .hostname
                                .as_ref()
                                .map(|name| format!(" ({})", name))
                                .unwrap_or_default()
                        )
                    })
                    .collect();
                lines.push(format!(
                    "{} lease(s), {} free address(es)",
                    leases.active_count().await,
                    leases.free_count().await
                ));
                Ok(lines)
            }
            Command::Release(client_id) => {
                let cancelled = self.engine.scheduler().cancel_all_for(client_id);
                let lease = self.engine.leases().release(client_id, None).await;
                match lease {
                    Some(lease) => {
                        info!("Admin released {} from {}", lease.address, client_id);
                        self.engine.events().record(format!(
                            "admin released {} from {}",
                            lease.address, client_id
                        ));
                        Ok(vec![format!(
                            "released {} from {} ({} pending reply(s) cancelled)",
                            lease.address, client_id, cancelled
                        )])
                    }
                    None if cancelled > 0 => Ok(vec![format!(
                        "no lease for {}, {} pending reply(s) cancelled",
                        client_id, cancelled
                    )]),
                    None => Err(Error::AdminProtocol(format!("no lease for {}", client_id))),
                }
            }
            Command::Exclude(address) => {
                let changed = self.engine.leases().exclude(*address).await?;
                if changed {
                    info!("Admin excluded {}", address);
                    self.engine
                        .events()
                        .record(format!("admin excluded {}", address));
                    Ok(vec![format!("excluded {}", address)])
                } else {
                    Ok(vec![format!("{} was already excluded", address)])
                }
            }
            Command::Include(address) => {
                let changed = self.engine.leases().include(*address).await?;
                if changed {
                    info!("Admin included {}", address);
                    self.engine
                        .events()
                        .record(format!("admin included {}", address));
                    Ok(vec![format!("included {}", address)])
                } else {
                    Ok(vec![format!("{} was not excluded", address)])
                }
            }
            Command::Events => Ok(self
                .engine
                .events()
                .snapshot(Utc::now())
                .iter()
                .map(ToString::to_string)
                .collect()),
            Command::Configuration => {
                let mut lines: Vec<String> = serde_json::to_string_pretty(self.engine.config())?
                    .lines()
                    .map(str::to_string)
                    .collect();
                let excluded = self.engine.leases().excluded().await;
                lines.push(format!(
                    "excluded now: {}",
                    excluded
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", ")
                ));
                Ok(lines)
            }
            Command::Pending => {
                let scheduler = self.engine.scheduler();
                let mut lines: Vec<String> = scheduler
                    .pending_clients()
                    .into_iter()
                    .map(|(client_id, count)| format!("{} {}", client_id, count))
                    .collect();
                lines.push(format!("{} pending reply(s)", scheduler.pending_count()));
                Ok(lines)
            }
            Command::Quit => Ok(vec!["bye".to_string()]),
        }
    }

    /// Parses and executes one line, framing the result.
    ///
    /// Blank lines yield `None`.
    pub async fn handle_line(&self, line: &str) -> Option<Response> {
        if line.trim().is_empty() {
            return None;
        }

        let command = match parse_command(line) {
            Ok(command) => command,
            Err(error) => return Some(Response::err(&error)),
        };

        let close = command == Command::Quit;
        Some(match self.execute(&command).await {
            Ok(body) => Response::ok(body, close),
            Err(error) => Response::err(&error),
        })
    }

    /// Accepts connections until the listener fails, one task per session.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        if let Ok(address) = listener.local_addr() {
            info!("Admin console listening on {}", address);
        }

        loop {
            let (stream, peer) = listener.accept().await?;
            debug!("Admin session from {}", peer);

            let console = self.clone();
            tokio::spawn(async move {
                if let Err(error) = console.session(stream).await {
                    warn!("Admin session {} ended with error: {}", peer, error);
                }
                debug!("Admin session from {} closed", peer);
            });
        }
    }

    async fn session(&self, stream: TcpStream) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        writer
            .write_all(format!("{}\r\n", GREETING).as_bytes())
            .await?;

        while let Some(line) = lines.next_line().await? {
            let Some(response) = self.handle_line(&line).await else {
                continue;
            };
            writer.write_all(response.render().as_bytes()).await?;
            if response.close {
                break;
            }
        }

        writer.shutdown().await?;
        Ok(())
    }
}
