use std::time::Instant;

use socket2::Socket;

use crate::endpoint::Endpoint;
use crate::nonce::Nonce;
use crate::ready::Interest;

/// The maximum bytes read in one pass of an HTTP banner or a connect-back's
/// first line: enough for a status line or a 64-byte nonce plus line
/// terminator, with room to spare. Anything past the first line in that
/// read is discarded.
pub const BANNER_MAX: usize = 128;

/// Coarse reap deadline for any probe not in `Initiated`.
pub const REAP_DEADLINE_SECS: u64 = 45;

/// Per-attempt lifecycle. Kept as one tagged enum rather than a shared base
/// struct with optional fields: the ancillary attributes (nonce, http code)
/// belong to the states that actually use them, not to a lowest-common-
/// denominator struct shared with the listener and the ingest pipe.
pub enum ProbeState {
    /// Outbound connect issued, waiting for the connect to resolve.
    Initiated,
    /// TCP handshake completed; the `CONNECT` line has just been written.
    SentConnect,
    /// Status line parsed; `http_code` is meaningful.
    RecvCode { http_code: u16 },
    /// 200 received, nonce generated and written; waiting only for the far
    /// end to hang up (ingress side of a possible tunnel).
    SentToken { nonce: Nonce },
    /// A connect-back whose source IP matched a live outbound probe's
    /// target IP — a plain open proxy, already resolved.
    SameBack,
    /// A connect-back whose source IP didn't match anything in the IP
    /// index; waiting to read a nonce.
    DiffBack,
    /// A `DiffBack` probe that read a recognized nonce and joined with its
    /// ingress probe.
    Discovered { nonce: Nonce },
}

impl ProbeState {
    pub fn label(&self) -> &'static str {
        match self {
            ProbeState::Initiated => "INITIATED",
            ProbeState::SentConnect => "SENT_CONNECT",
            ProbeState::RecvCode { .. } => "RECV_CODE",
            ProbeState::SentToken { .. } => "SENT_TOKEN",
            ProbeState::SameBack => "SAME_BACK",
            ProbeState::DiffBack => "DIFF_BACK",
            ProbeState::Discovered { .. } => "DISCOVERED",
        }
    }
}

/// An origin records whether a probe's socket was obtained by dialing out
/// or by accepting an inbound connect-back.
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum Origin {
    Outbound,
    ConnectBack,
}

/// A registered probe record. Owns its socket exclusively; the socket is
/// closed when the `Probe` is dropped (the engine's `unregister` is what
/// drops it).
pub struct Probe {
    pub socket: Socket,
    pub endpoint: Endpoint,
    pub origin: Origin,
    pub state: ProbeState,
    pub interest: Interest,
    pub last_activity: Instant,
}

impl Probe {
    pub fn outbound(socket: Socket, endpoint: Endpoint) -> Probe {
        Probe {
            socket,
            endpoint,
            origin: Origin::Outbound,
            state: ProbeState::Initiated,
            interest: Interest::writable() | Interest::readable() | Interest::error_hup(),
            last_activity: Instant::now(),
        }
    }

    pub fn connect_back(socket: Socket, endpoint: Endpoint, state: ProbeState, interest: Interest) -> Probe {
        Probe {
            socket,
            endpoint,
            origin: Origin::ConnectBack,
            state,
            interest,
            last_activity: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Only non-`Initiated` probes are subject to the coarse reap deadline —
    /// `Initiated` relies on the OS SYN-retry budget instead.
    pub fn is_reapable(&self, now: Instant) -> bool {
        !matches!(self.state, ProbeState::Initiated)
            && now.duration_since(self.last_activity).as_secs() >= REAP_DEADLINE_SECS
    }
}

/// Splits the first line out of a raw read: anything after the first
/// `\r\n` or `\n` is dropped.
pub fn first_line(buf: &[u8]) -> &[u8] {
    let end = buf
        .iter()
        .position(|&b| b == b'\n')
        .unwrap_or(buf.len());
    let line = &buf[..end];
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Parses an HTTP status line: exactly three space-separated fields,
/// protocol must be literally `HTTP/1.0` or `HTTP/1.1`, second field must
/// be a decimal integer.
pub fn parse_status_line(line: &[u8]) -> Option<u16> {
    let line = std::str::from_utf8(line).ok()?;
    let mut fields = line.splitn(3, ' ');
    let proto = fields.next()?;
    let code = fields.next()?;
    let _reason = fields.next()?;

    if proto != "HTTP/1.0" && proto != "HTTP/1.1" {
        return None;
    }

    code.parse().ok()
}
