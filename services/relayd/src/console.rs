//! Line-based control console.
//!
//! Reads one command per line and applies it to every live connection:
//!
//! ```text
//! drop <c2u|u2c|both> <on|off>
//! suspend <c2u|u2c|both> <on|off>
//! reset
//! disconnect
//! list
//! stats
//! quit
//! ```
//!
//! Blank lines and `#` comments are ignored. A line that fails to parse is
//! logged and skipped.

use std::str::FromStr;

use faultline_relay::{Direction, ExecuteReport, Proxy};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{info, warn};

/// Errors from parsing a console line.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command: {0}")]
    Unknown(String),

    #[error("{command}: missing {argument}")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },

    #[error("invalid direction: {0} (expected c2u, u2c or both)")]
    InvalidDirection(String),

    #[error("invalid switch: {0} (expected on or off)")]
    InvalidSwitch(String),

    #[error("unexpected argument: {0}")]
    UnexpectedArgument(String),
}

/// Which directions a command applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directions {
    ClientToUpstream,
    UpstreamToClient,
    Both,
}

impl Directions {
    pub fn directions(&self) -> &'static [Direction] {
        match self {
            Self::ClientToUpstream => &[Direction::ClientToUpstream],
            Self::UpstreamToClient => &[Direction::UpstreamToClient],
            Self::Both => &Direction::ALL,
        }
    }
}

impl FromStr for Directions {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "c2u" | "up" | "client_to_upstream" => Ok(Self::ClientToUpstream),
            "u2c" | "down" | "upstream_to_client" => Ok(Self::UpstreamToClient),
            "both" | "all" => Ok(Self::Both),
            _ => Err(CommandError::InvalidDirection(s.to_string())),
        }
    }
}

/// A parsed console command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Drop { directions: Directions, enabled: bool },
    Suspend { directions: Directions, enabled: bool },
    Reset,
    Disconnect,
    List,
    Stats,
    Quit,
}

impl Command {
    /// Parse a console line. Blank lines and comments yield `None`.
    pub fn parse_line(line: &str) -> Result<Option<Self>, CommandError> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        line.parse().map(Some)
    }
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = s.split_whitespace();
        let name = words.next().unwrap_or_default().to_ascii_lowercase();

        let command = match name.as_str() {
            "drop" | "suspend" => {
                let command = if name == "drop" { "drop" } else { "suspend" };
                let directions: Directions = words
                    .next()
                    .ok_or(CommandError::MissingArgument {
                        command,
                        argument: "direction",
                    })?
                    .parse()?;
                let enabled = parse_switch(words.next().ok_or(CommandError::MissingArgument {
                    command,
                    argument: "on|off",
                })?)?;
                if command == "drop" {
                    Self::Drop {
                        directions,
                        enabled,
                    }
                } else {
                    Self::Suspend {
                        directions,
                        enabled,
                    }
                }
            }
            "reset" => Self::Reset,
            "disconnect" => Self::Disconnect,
            "list" => Self::List,
            "stats" => Self::Stats,
            "quit" | "exit" => Self::Quit,
            _ => return Err(CommandError::Unknown(name)),
        };

        match words.next() {
            Some(extra) => Err(CommandError::UnexpectedArgument(extra.to_string())),
            None => Ok(command),
        }
    }
}

fn parse_switch(s: &str) -> Result<bool, CommandError> {
    match s.to_ascii_lowercase().as_str() {
        "on" | "true" | "1" => Ok(true),
        "off" | "false" | "0" => Ok(false),
        _ => Err(CommandError::InvalidSwitch(s.to_string())),
    }
}

/// Whether the console should keep reading after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Apply a command to the relay.
pub fn apply(proxy: &Proxy, command: Command) -> Flow {
    let report = match command {
        Command::Drop {
            directions,
            enabled,
        } => proxy.execute(|conn| {
            for direction in directions.directions() {
                conn.streamer(*direction).set_drop(enabled);
            }
        }),
        Command::Suspend {
            directions,
            enabled,
        } => proxy.execute(|conn| {
            for direction in directions.directions() {
                conn.streamer(*direction).set_suspended(enabled);
            }
        }),
        Command::Reset => proxy.execute(|conn| {
            conn.client_to_upstream().reset();
            conn.upstream_to_client().reset();
        }),
        Command::Disconnect => proxy.execute(|conn| conn.dispose()),
        Command::List => proxy.execute(|conn| {
            let c2u = conn.client_to_upstream();
            let u2c = conn.upstream_to_client();
            info!(
                conn_id = %conn.id(),
                peer_addr = %conn.peer_addr(),
                upstream_addr = %conn.upstream_addr(),
                c2u_drop = c2u.is_dropping(),
                c2u_suspended = c2u.is_suspended(),
                u2c_drop = u2c.is_dropping(),
                u2c_suspended = u2c.is_suspended(),
                "Connection"
            );
        }),
        Command::Stats => {
            let stats = proxy.stats();
            info!(
                connections_accepted = stats.connections_accepted,
                connections_active = stats.connections_active,
                connections_closed = stats.connections_closed,
                upstream_connect_failed = stats.upstream_connect_failed,
                accept_errors = stats.accept_errors,
                action_failures = stats.action_failures,
                bytes_client_to_upstream = stats.bytes_client_to_upstream,
                bytes_upstream_to_client = stats.bytes_upstream_to_client,
                bytes_dropped = stats.bytes_dropped,
                "Relay stats"
            );
            return Flow::Continue;
        }
        Command::Quit => return Flow::Quit,
    };

    log_report(&command, report);
    Flow::Continue
}

fn log_report(command: &Command, report: ExecuteReport) {
    info!(
        command = ?command,
        connections = report.visited,
        failed = report.failed,
        "Command applied"
    );
}

/// Read commands from `input` until `quit` or end of input.
pub async fn run<R>(proxy: &Proxy, input: R) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(input).lines();

    while let Some(line) = lines.next_line().await? {
        match Command::parse_line(&line) {
            Ok(Some(command)) => {
                if apply(proxy, command) == Flow::Quit {
                    info!("Quit requested");
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => warn!(line = %line.trim(), error = %e, "Ignoring console line"),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use faultline_relay::RelayConfig;
    use rstest::rstest;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};

    #[rstest]
    #[case("drop c2u on", Command::Drop { directions: Directions::ClientToUpstream, enabled: true })]
    #[case("DROP u2c off", Command::Drop { directions: Directions::UpstreamToClient, enabled: false })]
    #[case("suspend both on", Command::Suspend { directions: Directions::Both, enabled: true })]
    #[case("  suspend   up   0 ", Command::Suspend { directions: Directions::ClientToUpstream, enabled: false })]
    #[case("reset", Command::Reset)]
    #[case("disconnect", Command::Disconnect)]
    #[case("list", Command::List)]
    #[case("stats", Command::Stats)]
    #[case("exit", Command::Quit)]
    fn test_parse_command(#[case] line: &str, #[case] expected: Command) {
        assert_eq!(Command::parse_line(line), Ok(Some(expected)));
    }

    #[rstest]
    #[case("")]
    #[case("   ")]
    #[case("# drop c2u on")]
    fn test_parse_ignored(#[case] line: &str) {
        assert_eq!(Command::parse_line(line), Ok(None));
    }

    #[rstest]
    #[case("partition", CommandError::Unknown("partition".to_string()))]
    #[case("drop", CommandError::MissingArgument { command: "drop", argument: "direction" })]
    #[case("suspend c2u", CommandError::MissingArgument { command: "suspend", argument: "on|off" })]
    #[case("drop sideways on", CommandError::InvalidDirection("sideways".to_string()))]
    #[case("drop c2u maybe", CommandError::InvalidSwitch("maybe".to_string()))]
    #[case("reset now", CommandError::UnexpectedArgument("now".to_string()))]
    fn test_parse_errors(#[case] line: &str, #[case] expected: CommandError) {
        assert_eq!(Command::parse_line(line), Err(expected));
    }

    #[rstest]
    #[case(Directions::ClientToUpstream, &[Direction::ClientToUpstream])]
    #[case(Directions::UpstreamToClient, &[Direction::UpstreamToClient])]
    #[case(Directions::Both, &[Direction::ClientToUpstream, Direction::UpstreamToClient])]
    fn test_directions(#[case] directions: Directions, #[case] expected: &[Direction]) {
        assert_eq!(directions.directions(), expected);
    }

    /// Relay in front of a silent upstream with one connected client.
    async fn relay_with_client() -> (Proxy, TcpStream, TcpListener) {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = upstream.local_addr().unwrap();
        let proxy = Proxy::bind(RelayConfig::new("127.0.0.1", addr.port(), 0))
            .await
            .unwrap();

        let client = TcpStream::connect(proxy.local_addr()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while proxy.connection_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("connection should register");

        (proxy, client, upstream)
    }

    #[tokio::test]
    async fn test_console_applies_faults() {
        let (proxy, _client, _upstream) = relay_with_client().await;

        let script: &[u8] = b"# partition the client\ndrop c2u on\nsuspend u2c on\nbogus\nlist\n";
        run(&proxy, script).await.unwrap();

        let connections = proxy.connections();
        let conn = &connections[0];
        assert!(conn.client_to_upstream().is_dropping());
        assert!(!conn.client_to_upstream().is_suspended());
        assert!(conn.upstream_to_client().is_suspended());
        assert!(!conn.upstream_to_client().is_dropping());

        run(&proxy, &b"reset\n"[..]).await.unwrap();
        assert!(!conn.client_to_upstream().is_dropping());
        assert!(!conn.upstream_to_client().is_suspended());
    }

    #[tokio::test]
    async fn test_console_quit_stops_reading() {
        let (proxy, _client, _upstream) = relay_with_client().await;

        run(&proxy, &b"quit\ndisconnect\n"[..]).await.unwrap();
        assert_eq!(proxy.connection_count(), 1);

        run(&proxy, &b"disconnect\n"[..]).await.unwrap();
        assert_eq!(proxy.connection_count(), 0);
    }
}
