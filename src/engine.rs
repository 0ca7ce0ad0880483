use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::config::{Config, IN_FLIGHT_CAP};
use crate::correlation::{HandleTable, Registered};
use crate::endpoint::Endpoint;
use crate::error::{EngineError, ProbeError};
use crate::ingest::Pipe;
use crate::nonce::{self, Nonce};
use crate::probe::{self, Probe, ProbeState, BANNER_MAX};
use crate::queue::StagingQueue;
use crate::ready::Interest;
use crate::sink::{self, LogSink, Phase};
use crate::sys::{self, Epoll, Events};
use crate::token::Token;

const SYN_RETRIES: u32 = 7;
const EVENTS_CAPACITY: usize = 1024;
const WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// What a finished dispatch step on a probe should cause the engine to do
/// next. Kept separate from the per-state transition functions so that the
/// cross-probe bookkeeping (correlation lookups, unregistration, the sink)
/// never has to run while a `Probe` is still mutably borrowed out of the
/// handle table.
enum Step {
    Continue,
    Done,
    Fail(FailKind),
    Need200,
    NeedNonceLookup(Nonce),
}

#[derive(Copy, Clone)]
enum FailKind {
    Transport,
    Discord(&'static str),
    Deadline,
}

enum ProbeKind {
    Initiated,
    SentConnect,
    SentToken,
    DiffBack,
    Other,
}

impl ProbeKind {
    fn of(state: &ProbeState) -> ProbeKind {
        match state {
            ProbeState::Initiated => ProbeKind::Initiated,
            ProbeState::SentConnect => ProbeKind::SentConnect,
            ProbeState::SentToken { .. } => ProbeKind::SentToken,
            ProbeState::DiffBack => ProbeKind::DiffBack,
            _ => ProbeKind::Other,
        }
    }
}

/// The central readiness loop and everything it owns: the epoll handle, the
/// registered-handle table and its two correlation indices, the staging
/// queue, the ingest pipe, and the connect-back listener. Everything above
/// `main` talks to the system only through this one aggregate.
pub struct Engine {
    epoll: Epoll,
    events: Events,
    handles: HandleTable,
    queue: StagingQueue,
    pipe: Pipe,
    listener: Socket,
    listener_token: Token,
    pipe_token: Token,
    sink: LogSink,
    advertise_ip: Ipv4Addr,
    advertise_port: u16,
}

impl Engine {
    pub fn new(config: Config) -> Result<Engine, EngineError> {
        let epoll = Epoll::new().map_err(EngineError::InitFailure)?;
        let events = Events::with_capacity(EVENTS_CAPACITY);

        let listener = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(EngineError::InitFailure)?;
        listener.set_reuse_address(true).map_err(EngineError::InitFailure)?;
        listener
            .bind(&SockAddr::from(std::net::SocketAddr::V4(config.bind)))
            .map_err(|source| EngineError::BindFailed { addr: config.bind, source })?;
        listener
            .listen(1024)
            .map_err(|source| EngineError::BindFailed { addr: config.bind, source })?;
        listener.set_nonblocking(true).map_err(EngineError::InitFailure)?;

        let pipe = Pipe::open(&config.ingest_path).map_err(|source| EngineError::PipeUnusable {
            path: config.ingest_path.clone(),
            source,
        })?;

        let mut handles = HandleTable::new();
        let listener_token = handles.register_fixed(Registered::Listener { fd: listener.as_raw_fd() });
        let pipe_token = handles.register_fixed(Registered::Pipe { fd: pipe.as_raw_fd() });

        epoll
            .add(listener.as_raw_fd(), listener_token, Interest::readable() | Interest::error_hup())
            .map_err(EngineError::InitFailure)?;
        epoll
            .add(pipe.as_raw_fd(), pipe_token, Interest::readable() | Interest::error_hup())
            .map_err(EngineError::InitFailure)?;

        let sink = LogSink::open(&config.log_path).map_err(EngineError::InitFailure)?;

        let advertise_ip = config.advertise_ip();
        let advertise_port = config.advertise_port();

        Ok(Engine {
            epoll,
            events,
            handles,
            queue: StagingQueue::new(),
            pipe,
            listener,
            listener_token,
            pipe_token,
            sink,
            advertise_ip,
            advertise_port,
        })
    }

    /// Runs the readiness loop until a subsystem-level error occurs: reap,
    /// then factory, then block on readiness, then dispatch every event the
    /// kernel handed back, in the order it returned them.
    pub fn run(&mut self) -> Result<(), EngineError> {
        loop {
            self.reap();
            self.run_factory();

            let n = self
                .epoll
                .wait(&mut self.events, Some(WAIT_TIMEOUT))
                .map_err(EngineError::ReadinessWaitFailed)?;

            for i in 0..n {
                if let Some(event) = self.events.get(i) {
                    self.dispatch(event)?;
                }
            }
        }
    }

    fn dispatch(&mut self, event: sys::Event) -> Result<(), EngineError> {
        let token = event.token();
        let interest = event.interest();

        if token == self.listener_token {
            if interest.is_error() || interest.is_hup() {
                return Err(EngineError::ListenerAnomaly(io::Error::new(io::ErrorKind::Other, "listener socket error")));
            }
            self.accept_connect_back();
            Ok(())
        } else if token == self.pipe_token {
            self.handle_ingest()
        } else {
            self.handle_probe(token, interest);
            Ok(())
        }
    }

    fn handle_ingest(&mut self) -> Result<(), EngineError> {
        match self.pipe.drain() {
            Ok(Some(endpoints)) => {
                for endpoint in endpoints {
                    self.queue.insert(endpoint);
                }
                Ok(())
            }
            Ok(None) => self.pipe.reopen().map_err(EngineError::IngestAnomaly),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(EngineError::IngestAnomaly(e)),
        }
    }

    fn accept_connect_back(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((socket, addr)) => self.classify_connect_back(socket, addr),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::error!("listener accept error: {e}");
                    break;
                }
            }
        }
    }

    fn classify_connect_back(&mut self, socket: Socket, addr: SockAddr) {
        if let Err(e) = sys::harden_socket(&socket) {
            log::warn!("failed to harden accepted socket: {e}");
        }

        let Some(source) = addr.as_socket_ipv4() else {
            log::warn!("connect-back from non-IPv4 source, dropping");
            return;
        };
        let source_ip = *source.ip();

        if let Some(ingress_token) = self.handles.find_by_ip(source_ip) {
            let ingress_endpoint = {
                let probe = self.handles.get_mut(ingress_token).and_then(Registered::as_probe_mut);
                probe.map(|p| {
                    p.state = ProbeState::SameBack;
                    p.endpoint
                })
            };
            if let Some(endpoint) = ingress_endpoint {
                let _ = self.sink.emit(&sink::Event::new(Phase::SameProxy, ingress_token, "SAME_BACK", endpoint, "plain proxy confirmed"));
                log::info!("same-IP connect-back from {endpoint}");
            }
            self.close_and_unregister(ingress_token);
            // The inbound socket is never registered for a SAME_BACK: drop
            // it (closes, hard-reset per its linger setting).
            drop(socket);
            return;
        }

        let Some(endpoint) = Endpoint::new(source_ip, source.port()) else {
            log::warn!("connect-back from {source_ip} with port 0, dropping");
            return;
        };

        let probe = Probe::connect_back(socket, endpoint, ProbeState::DiffBack, Interest::readable() | Interest::error_hup());
        let fd = probe.socket.as_raw_fd();
        let interest = probe.interest;
        let token = self.handles.register_diff_back(probe);

        if let Err(e) = self.epoll.add(fd, token, interest) {
            log::warn!("failed to register connect-back from {endpoint}: {e}");
            self.handles.unregister(token);
        } else {
            log::debug!("registered DIFF_BACK probe from {endpoint}");
        }
    }

    fn reap(&mut self) {
        let now = Instant::now();
        for token in self.handles.probe_tokens() {
            let reapable = self
                .handles
                .get(token)
                .and_then(Registered::as_probe)
                .map(|p| p.is_reapable(now))
                .unwrap_or(false);

            if reapable {
                self.fail_probe(token, FailKind::Deadline);
            }
        }
    }

    fn run_factory(&mut self) {
        while self.handles.probe_count() < IN_FLIGHT_CAP {
            let Some(endpoint) = self.queue.pop_front() else { break };

            if self.handles.ip_in_use(endpoint.addr()) {
                continue;
            }

            if let Err(e) = self.dial(endpoint) {
                log::warn!("failed to dial {endpoint}: {e}");
            }
        }
    }

    fn dial(&mut self, endpoint: Endpoint) -> io::Result<()> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        sys::harden_socket(&socket)?;
        if let Err(e) = sys::set_syn_retries(&socket, SYN_RETRIES) {
            log::warn!("SYN retry count unsupported on this platform: {e}");
        }

        let addr = SocketAddrV4::new(endpoint.addr(), endpoint.port());
        match socket.connect(&SockAddr::from(std::net::SocketAddr::V4(addr))) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => return Err(e),
        }

        let probe = Probe::outbound(socket, endpoint);
        let fd = probe.socket.as_raw_fd();
        let interest = probe.interest;
        let token = self.handles.register_outbound(probe);
        self.epoll.add(fd, token, interest)?;

        log::info!("attempt {endpoint}");
        Ok(())
    }

    fn handle_probe(&mut self, token: Token, interest: Interest) {
        let kind = match self.handles.get(token).and_then(Registered::as_probe) {
            Some(probe) => ProbeKind::of(&probe.state),
            None => return,
        };

        if let Some(probe) = self.handles.get_mut(token).and_then(Registered::as_probe_mut) {
            probe.touch();
        }

        let step = match kind {
            ProbeKind::Initiated => self.step_initiated(token, interest),
            ProbeKind::SentConnect => self.step_sent_connect(token, interest),
            ProbeKind::SentToken => self.step_sent_token(interest),
            ProbeKind::DiffBack => self.step_diff_back(token, interest),
            ProbeKind::Other => Step::Continue,
        };

        self.apply_step(token, step);
    }

    fn apply_step(&mut self, token: Token, step: Step) {
        match step {
            Step::Continue => self.sync_interest(token),
            Step::Done => self.finish_probe_quiet(token),
            Step::Fail(kind) => self.fail_probe(token, kind),
            Step::Need200 => self.emit_nonce(token),
            Step::NeedNonceLookup(nonce) => self.resolve_diff_back(token, nonce),
        }
    }

    /// INITIATED: writable means the non-blocking connect resolved; check
    /// `SO_ERROR` to tell success from a failed connect.
    fn step_initiated(&mut self, token: Token, interest: Interest) -> Step {
        if interest.is_error() || interest.is_hup() {
            return Step::Fail(FailKind::Transport);
        }
        if !interest.is_writable() {
            return Step::Continue;
        }

        let advertise_ip = self.advertise_ip;
        let advertise_port = self.advertise_port;

        let Some(probe) = self.handles.get_mut(token).and_then(Registered::as_probe_mut) else {
            return Step::Continue;
        };

        match probe.socket.take_error() {
            Ok(None) => {
                let line = format!("CONNECT {advertise_ip}:{advertise_port} HTTP/1.0\r\n\r\n");
                match probe.socket.write_all(line.as_bytes()) {
                    Ok(()) => {
                        probe.state = ProbeState::SentConnect;
                        probe.interest = Interest::readable() | Interest::error_hup();
                        Step::Continue
                    }
                    Err(_) => Step::Fail(FailKind::Transport),
                }
            }
            Ok(Some(_)) | Err(_) => Step::Fail(FailKind::Transport),
        }
    }

    /// SENT_CONNECT: readable means the banner arrived; parse its first
    /// line as an HTTP status.
    fn step_sent_connect(&mut self, token: Token, interest: Interest) -> Step {
        if interest.is_error() || interest.is_hup() {
            return Step::Fail(FailKind::Transport);
        }
        if !interest.is_readable() {
            return Step::Continue;
        }

        let Some(probe) = self.handles.get_mut(token).and_then(Registered::as_probe_mut) else {
            return Step::Continue;
        };

        let mut buf = [0u8; BANNER_MAX];
        match probe.socket.read(&mut buf) {
            Ok(0) => Step::Fail(FailKind::Transport),
            Ok(n) => {
                let line = probe::first_line(&buf[..n]);
                match probe::parse_status_line(line) {
                    Some(code) => {
                        probe.state = ProbeState::RecvCode { http_code: code };
                        if code == 200 {
                            Step::Need200
                        } else {
                            Step::Fail(FailKind::Discord("non-200 status"))
                        }
                    }
                    None => Step::Fail(FailKind::Discord("malformed banner")),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Step::Continue,
            Err(_) => Step::Fail(FailKind::Transport),
        }
    }

    /// SENT_TOKEN: hangup/error here is the expected teardown once the far
    /// end closes after forwarding — not a failure. Terminal; correlation,
    /// if any, already happened via nonce match.
    fn step_sent_token(&self, interest: Interest) -> Step {
        if interest.is_error() || interest.is_hup() {
            Step::Done
        } else {
            Step::Continue
        }
    }

    /// DIFF_BACK: readable means a first line arrived; it must be exactly a
    /// 64-byte nonce. The actual index lookup happens back in the engine,
    /// since it may touch a sibling probe.
    fn step_diff_back(&mut self, token: Token, interest: Interest) -> Step {
        if interest.is_error() || interest.is_hup() {
            return Step::Fail(FailKind::Transport);
        }
        if !interest.is_readable() {
            return Step::Continue;
        }

        let Some(probe) = self.handles.get_mut(token).and_then(Registered::as_probe_mut) else {
            return Step::Continue;
        };

        let mut buf = [0u8; BANNER_MAX];
        match probe.socket.read(&mut buf) {
            Ok(0) => Step::Fail(FailKind::Transport),
            Ok(n) => {
                let line = probe::first_line(&buf[..n]);
                match Nonce::from_bytes(line) {
                    Some(nonce) => Step::NeedNonceLookup(nonce),
                    None => Step::Fail(FailKind::Discord("unrecognized nonce")),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Step::Continue,
            Err(_) => Step::Fail(FailKind::Transport),
        }
    }

    /// RECV_CODE → SENT_TOKEN: generate a nonce unique against the live
    /// index, send it, and record it.
    fn emit_nonce(&mut self, token: Token) {
        let nonce = {
            let handles = &self.handles;
            nonce::generate_unique(|candidate| handles.find_by_nonce(candidate).is_some())
        };

        let write_result = {
            let Some(probe) = self.handles.get_mut(token).and_then(Registered::as_probe_mut) else {
                return;
            };
            let result = probe.socket.write_all(nonce.as_bytes());
            if result.is_ok() {
                probe.state = ProbeState::SentToken { nonce };
                probe.interest = Interest::error_hup();
            }
            result
        };

        match write_result {
            Ok(()) => {
                self.handles.record_nonce(token, nonce);
                self.sync_interest(token);
                if let Some(endpoint) = self.handles.get(token).and_then(Registered::as_probe).map(|p| p.endpoint) {
                    log::info!("sent nonce to {endpoint}");
                }
            }
            Err(_) => self.fail_probe(token, FailKind::Transport),
        }
    }

    /// DIFF_BACK → RECV_TOKEN: join the egress probe (`token`) with the
    /// ingress probe that emitted `nonce`, if any. This is what joins
    /// ingress and egress into a tunnel pair.
    fn resolve_diff_back(&mut self, token: Token, nonce: Nonce) {
        match self.handles.find_by_nonce(&nonce) {
            Some(ingress_token) if ingress_token != token => {
                let ingress_endpoint = self.handles.get_mut(ingress_token).and_then(Registered::as_probe_mut).map(|p| {
                    p.state = ProbeState::Discovered { nonce };
                    p.endpoint
                });
                let egress_endpoint = self.handles.get_mut(token).and_then(Registered::as_probe_mut).map(|p| {
                    p.state = ProbeState::Discovered { nonce };
                    p.endpoint
                });

                if let (Some(ingress_endpoint), Some(egress_endpoint)) = (ingress_endpoint, egress_endpoint) {
                    let _ = self.sink.emit(&sink::Event::new(
                        Phase::TunnelIngress,
                        ingress_token,
                        "DISCOVERED",
                        ingress_endpoint,
                        "tunnel ingress confirmed",
                    ));
                    let _ = self.sink.emit(&sink::Event::new(
                        Phase::TunnelEgress,
                        token,
                        "DISCOVERED",
                        egress_endpoint,
                        "tunnel egress confirmed",
                    ));
                    log::info!("tunnel discovered: ingress {ingress_endpoint} / egress {egress_endpoint}");
                }

                self.close_and_unregister(ingress_token);
                self.close_and_unregister(token);
            }
            _ => self.fail_probe(token, FailKind::Discord("unrecognized nonce")),
        }
    }

    fn fail_probe(&mut self, token: Token, kind: FailKind) {
        let info = self.handles.get(token).and_then(Registered::as_probe).map(|p| (p.endpoint, p.state.label()));

        if let Some((endpoint, state_label)) = info {
            let err = match kind {
                FailKind::Transport => ProbeError::TransportDisconnect {
                    endpoint,
                    source: io::Error::new(io::ErrorKind::Other, "transport disconnect"),
                },
                FailKind::Discord(reason) => ProbeError::ProtocolDiscord { endpoint, reason },
                FailKind::Deadline => ProbeError::DeadlineExceeded { endpoint },
            };
            let _ = self.sink.emit(&sink::Event::new(Phase::Failure, token, state_label, endpoint, err.to_string()));
            log::info!("{err}");
        }

        self.close_and_unregister(token);
    }

    fn finish_probe_quiet(&mut self, token: Token) {
        if let Some(endpoint) = self.handles.get(token).and_then(Registered::as_probe).map(|p| p.endpoint) {
            log::debug!("sent-token probe at {endpoint} closed");
        }
        self.close_and_unregister(token);
    }

    fn sync_interest(&mut self, token: Token) {
        let Some(probe) = self.handles.get(token).and_then(Registered::as_probe) else {
            return;
        };
        let fd = probe.socket.as_raw_fd();
        let interest = probe.interest;
        let _ = self.epoll.modify(fd, token, interest);
    }

    fn close_and_unregister(&mut self, token: Token) {
        if let Some(registered) = self.handles.get(token) {
            let _ = self.epoll.delete(registered.raw_fd());
        }
        self.handles.unregister(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn unique_path(tag: &str) -> String {
        std::env::temp_dir()
            .join(format!("slitscan-engine-test-{tag}-{}", std::process::id()))
            .to_str()
            .unwrap()
            .to_string()
    }

    /// Drives `run_factory` directly against a queue holding more endpoints
    /// than the in-flight cap allows. Each candidate gets its own loopback
    /// alias with a listener behind it, so every dial actually completes a
    /// handshake instead of racing a refusal — the cap, not reachability, is
    /// what this test is checking.
    #[test]
    fn factory_respects_the_in_flight_cap() {
        let total = IN_FLIGHT_CAP + 20;
        let port: u16 = 19199;
        let listeners: Vec<TcpListener> = (0..total)
            .map(|i| TcpListener::bind((Ipv4Addr::new(127, 0, 1, i as u8), port)).unwrap())
            .collect();

        let config = Config {
            bind: "127.0.0.1:19198".parse().unwrap(),
            advertise: "127.0.0.1:19198".parse().unwrap(),
            ingest_path: unique_path("cap-fifo"),
            log_path: unique_path("cap-log"),
        };
        let mut engine = Engine::new(config).unwrap();

        for i in 0..total {
            let ip = Ipv4Addr::new(127, 0, 1, i as u8);
            engine.queue.insert(Endpoint::new(ip, port).unwrap());
        }

        engine.run_factory();

        assert_eq!(engine.handles.probe_count(), IN_FLIGHT_CAP);
        assert_eq!(engine.queue.len(), total - IN_FLIGHT_CAP);

        drop(listeners);
    }
}
