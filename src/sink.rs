use std::fs::{File, OpenOptions};
use std::io::{self, Write};

use chrono::Local;

use crate::endpoint::Endpoint;
use crate::token::Token;

/// The phase symbol a log line carries: downstream tools grep on this
/// column, so the set is fixed and symbolic rather than free text.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    /// `><` plain open proxy confirmed.
    SameProxy,
    /// `()` ingress side of a discovered tunnel.
    TunnelIngress,
    /// `)(` egress side of a discovered tunnel.
    TunnelEgress,
    /// `--` failure or timeout.
    Failure,
}

impl Phase {
    fn symbol(self) -> &'static str {
        match self {
            Phase::SameProxy => "><",
            Phase::TunnelIngress => "()",
            Phase::TunnelEgress => ")(",
            Phase::Failure => "--",
        }
    }
}

/// A single structured event: everything the surrounding program needs to
/// render a line without reaching back into the engine's
/// internal tables. The sink's contract is deliberately narrow — a phase
/// symbol, the handle, its state, its endpoint, and a message — and
/// nothing else, so this is a plain record type, not a trait.
pub struct Event {
    pub phase: Phase,
    pub token: Token,
    pub state: &'static str,
    pub endpoint: Endpoint,
    pub message: String,
}

impl Event {
    pub fn new(phase: Phase, token: Token, state: &'static str, endpoint: Endpoint, message: impl Into<String>) -> Event {
        Event {
            phase,
            token,
            state,
            endpoint,
            message: message.into(),
        }
    }
}

/// Appends rendered events to the log file. Rotation and color are left to
/// the surrounding program; this only ever appends one line per event, each
/// with its own timestamp.
pub struct LogSink {
    file: File,
}

impl LogSink {
    pub fn open(path: &str) -> io::Result<LogSink> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(LogSink { file })
    }

    pub fn emit(&mut self, event: &Event) -> io::Result<()> {
        let line = format!(
            "{} {} {} {} {} {}\n",
            Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
            event.phase.symbol(),
            event.token,
            event.state,
            event.endpoint,
            event.message,
        );
        self.file.write_all(line.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;
    use std::net::Ipv4Addr;

    #[test]
    fn emits_a_line_with_the_expected_symbol() {
        let dir = std::env::temp_dir().join(format!("slitscan-sink-test-{}", std::process::id()));
        let mut sink = LogSink::open(dir.to_str().unwrap()).unwrap();
        let endpoint = Endpoint::new(Ipv4Addr::new(10, 0, 0, 5), 8080).unwrap();
        let event = Event::new(Phase::SameProxy, Token(3), "SAME_BACK", endpoint, "plain proxy confirmed");

        sink.emit(&event).unwrap();

        let contents = std::fs::read_to_string(&dir).unwrap();
        assert!(contents.contains("><"));
        assert!(contents.contains("10.0.0.5:8080"));
        let _ = std::fs::remove_file(&dir);
    }
}
