use thiserror::Error;

/// Everything that can abort a tunnel attempt. All variants are fatal.
#[derive(Debug, Error)]
pub(crate) enum TunnelError {
    #[error("Failed to connect to proxy {addr}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Proxy connection error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Proxy closed the connection before sending a complete response")]
    ProxyClosed,

    #[error("Malformed response from proxy: {0}")]
    MalformedResponse(String),

    #[error("Could not find usable Kerberos ticket - your TGT may have expired (hint: try kinit)")]
    CredentialsMissing,

    /// Provider failure, surfaced as the provider reported it.
    #[error("{0}")]
    Negotiation(String),

    #[error("Proxy still demanded authentication after {0} rounds")]
    RoundLimit(u32),
}
