use std::net::{Ipv4Addr, SocketAddrV4};

use clap::Parser;

/// The hard cap on simultaneously registered network probes.
pub const IN_FLIGHT_CAP: usize = 128;

/// `--bind` is the address the connect-back listener actually binds;
/// `--advertise` is the address written into the `CONNECT` request body sent
/// to each candidate. They default to the same value but are independently
/// settable, since the bind IP and the advertised callback IP are
/// independent in general — a host behind NAT binds one address but needs
/// candidates to dial back a different, externally-reachable one.
#[derive(Parser, Debug)]
#[command(name = "slitscand", about = "Active open-proxy and proxy-tunnel detector")]
pub struct Cli {
    /// Address the connect-back listener binds.
    #[arg(long, default_value = "0.0.0.0:1234")]
    pub bind: SocketAddrV4,

    /// Address advertised inside the CONNECT request body. Defaults to
    /// `--bind` when omitted.
    #[arg(long)]
    pub advertise: Option<SocketAddrV4>,

    /// Path to the named pipe endpoints are ingested from. Created as a
    /// FIFO if it does not already exist.
    #[arg(long, default_value = "/tmp/slitscan.fifo")]
    pub ingest_path: String,

    /// Append-only log file path.
    #[arg(long, default_value = "slitscan.log")]
    pub log_path: String,
}

/// The resolved configuration the engine actually runs on, after applying
/// the `--advertise` default.
pub struct Config {
    pub bind: SocketAddrV4,
    pub advertise: SocketAddrV4,
    pub ingest_path: String,
    pub log_path: String,
}

impl From<Cli> for Config {
    fn from(cli: Cli) -> Config {
        let advertise = cli.advertise.unwrap_or(cli.bind);
        Config {
            bind: cli.bind,
            advertise,
            ingest_path: cli.ingest_path,
            log_path: cli.log_path,
        }
    }
}

impl Config {
    pub fn advertise_ip(&self) -> Ipv4Addr {
        *self.advertise.ip()
    }

    pub fn advertise_port(&self) -> u16 {
        self.advertise.port()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advertise_defaults_to_bind() {
        let cli = Cli {
            bind: "127.0.0.1:1234".parse().unwrap(),
            advertise: None,
            ingest_path: "/tmp/x".into(),
            log_path: "x.log".into(),
        };
        let config: Config = cli.into();
        assert_eq!(config.advertise, config.bind);
    }

    #[test]
    fn advertise_overrides_bind() {
        let cli = Cli {
            bind: "0.0.0.0:1234".parse().unwrap(),
            advertise: Some("203.0.113.9:1234".parse().unwrap()),
            ingest_path: "/tmp/x".into(),
            log_path: "x.log".into(),
        };
        let config: Config = cli.into();
        assert_eq!(config.advertise_ip(), Ipv4Addr::new(203, 0, 113, 9));
    }
}
