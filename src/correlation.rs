use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;

use slab::Slab;

use crate::nonce::Nonce;
use crate::probe::Probe;
use crate::token::Token;

/// What a registered handle actually is — a tagged variant over the three
/// kinds of fd the engine ever watches, rather than one shared base record
/// carrying fields only some of them need.
pub enum Registered {
    Probe(Probe),
    Listener { fd: RawFd },
    Pipe { fd: RawFd },
}

impl Registered {
    pub fn raw_fd(&self) -> RawFd {
        use std::os::unix::io::AsRawFd;
        match self {
            Registered::Probe(p) => p.socket.as_raw_fd(),
            Registered::Listener { fd } => *fd,
            Registered::Pipe { fd } => *fd,
        }
    }

    pub fn as_probe(&self) -> Option<&Probe> {
        match self {
            Registered::Probe(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_probe_mut(&mut self) -> Option<&mut Probe> {
        match self {
            Registered::Probe(p) => Some(p),
            _ => None,
        }
    }
}

/// Owns the registered-handle table and the two correlation indices.
/// Insert and remove are only reachable through the `register_*` and
/// `unregister` methods so a handle enters and leaves every table it
/// belongs to atomically — nothing outside this module can update one
/// table without the others.
///
/// The handle table itself is `slab::Slab`: a `Token` is exactly a slab
/// index, so registering a handle and handing back its `Token` is a single
/// `slab.insert(..)` call, and unregistering is a single `slab.remove(..)`.
#[derive(Default)]
pub struct HandleTable {
    handles: Slab<Registered>,
    by_ip: HashMap<Ipv4Addr, Token>,
    by_nonce: HashMap<Nonce, Token>,
}

impl HandleTable {
    pub fn new() -> HandleTable {
        HandleTable::default()
    }

    /// Number of registered network probes — excludes the listener and pipe
    /// handles, which never count against the in-flight cap.
    pub fn probe_count(&self) -> usize {
        self.handles
            .iter()
            .filter(|(_, r)| matches!(r, Registered::Probe(_)))
            .count()
    }

    pub fn get(&self, token: Token) -> Option<&Registered> {
        self.handles.get(token.0)
    }

    /// Tokens of every currently registered probe, for the reaper's sweep.
    /// Snapshotted into a `Vec` rather than borrowed, since the reaper
    /// unregisters entries from `self` while iterating.
    pub fn probe_tokens(&self) -> Vec<Token> {
        self.handles
            .iter()
            .filter(|(_, r)| matches!(r, Registered::Probe(_)))
            .map(|(i, _)| Token(i))
            .collect()
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut Registered> {
        self.handles.get_mut(token.0)
    }

    /// Registers the listener or pipe handle — no IP/nonce index entry, no
    /// uniqueness check: only probes participate in the correlation indices.
    pub fn register_fixed(&mut self, registered: Registered) -> Token {
        Token(self.handles.insert(registered))
    }

    /// True if `ip` already has a live outbound probe registered. The
    /// factory consults this before dialing so at most one probe per target
    /// IP is ever in flight.
    pub fn ip_in_use(&self, ip: Ipv4Addr) -> bool {
        self.by_ip.contains_key(&ip)
    }

    pub fn find_by_ip(&self, ip: Ipv4Addr) -> Option<Token> {
        self.by_ip.get(&ip).copied()
    }

    pub fn find_by_nonce(&self, nonce: &Nonce) -> Option<Token> {
        self.by_nonce.get(nonce).copied()
    }

    /// Registers a freshly-dialed outbound probe: enters the handle table
    /// and the IP index atomically. Panics if `ip` is already registered —
    /// callers must check `ip_in_use` first and drop the endpoint for this
    /// cycle instead of calling this.
    pub fn register_outbound(&mut self, probe: Probe) -> Token {
        let ip = probe.endpoint.addr();
        debug_assert!(!self.by_ip.contains_key(&ip));
        let token = Token(self.handles.insert(Registered::Probe(probe)));
        self.by_ip.insert(ip, token);
        token
    }

    /// Registers a fresh `DIFF_BACK` connect-back: handle table only, no IP
    /// index entry, since its source IP was, by construction, not a match.
    pub fn register_diff_back(&mut self, probe: Probe) -> Token {
        Token(self.handles.insert(Registered::Probe(probe)))
    }

    /// Records that `token`'s probe has emitted `nonce`. A probe enters the
    /// nonce index only once it actually sends one, not at registration.
    pub fn record_nonce(&mut self, token: Token, nonce: Nonce) {
        self.by_nonce.insert(nonce, token);
    }

    /// Removes `token` from every table it appears in and returns the
    /// `Registered` value so the caller can close its socket. Idempotent: a
    /// no-op, not an error, if `token` is already gone.
    pub fn unregister(&mut self, token: Token) -> Option<Registered> {
        if !self.handles.contains(token.0) {
            return None;
        }
        let registered = self.handles.remove(token.0);

        if let Registered::Probe(probe) = &registered {
            self.by_ip.remove(&probe.endpoint.addr());
            if let Some(nonce) = emitted_nonce(probe) {
                // Only remove if it still points at this token: a nonce
                // collision retry never overwrites a live entry, so this is
                // always safe, but the check keeps the invariant explicit.
                if self.by_nonce.get(&nonce) == Some(&token) {
                    self.by_nonce.remove(&nonce);
                }
            }
        }

        Some(registered)
    }
}

fn emitted_nonce(probe: &Probe) -> Option<Nonce> {
    match &probe.state {
        crate::probe::ProbeState::SentToken { nonce } => Some(*nonce),
        crate::probe::ProbeState::Discovered { nonce } => Some(*nonce),
        _ => None,
    }
}
