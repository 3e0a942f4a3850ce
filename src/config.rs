use clap::{ArgAction, Parser};
use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;

#[derive(Parser, Debug)]
#[command(
    name = "negotiate-tunnel",
    version,
    about = "Open a Kerberos authenticated CONNECT tunnel through an HTTP proxy and relay stdin/stdout over it"
)]
pub(crate) struct TunnelArgs {
    /// Proxy address (host:port)
    #[arg(short = 'P', long)]
    pub proxy: HostPort,

    /// Target address (host:port)
    #[arg(short = 'T', long)]
    pub target: HostPort,

    /// Service class of the proxy's principal, used as <service>/<proxy host>
    #[arg(long, default_value = "HTTP")]
    pub service: String,

    /// Give up once the proxy has answered 401 this many times (unbounded by default)
    #[arg(long)]
    pub max_rounds: Option<NonZeroU32>,

    /// Increase log verbosity on stderr (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

/// A `host:port` pair. IPv6 literals are written and printed as `[addr]:port`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct HostPort {
    host: String,
    port: u16,
}

impl HostPort {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl FromStr for HostPort {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (host, port) = value
            .rsplit_once(':')
            .ok_or_else(|| format!("expected <host>:<port>, got '{}'", value))?;

        let host = match host.strip_prefix('[') {
            Some(bracketed) => bracketed
                .strip_suffix(']')
                .ok_or_else(|| format!("unterminated IPv6 literal in '{}'", value))?,
            None if host.contains(':') => {
                return Err(format!("IPv6 addresses must be bracketed, got '{}'", value));
            }
            None => host,
        };

        if host.is_empty() {
            return Err(format!("missing host in '{}'", value));
        }

        let port = u16::from_str(port).map_err(|_| format!("invalid port in '{}'", value))?;

        Ok(Self {
            host: host.to_owned(),
            port,
        })
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
