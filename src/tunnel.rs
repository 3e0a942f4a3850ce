use std::num::NonZeroU32;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::config::HostPort;
use crate::error::TunnelError;
use crate::http::{TunnelRequest, discard_body, read_response};
use crate::kerberos::{Negotiator, Token};

/// A proxy connection whose CONNECT exchange has finished.
pub(crate) struct Established<S> {
    /// The proxy connection, with any bytes read past the final response head still buffered.
    pub stream: BufReader<S>,
    pub status: u16,
    pub reason: String,
    pub rounds: u32,
}

impl<S> Established<S> {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub(crate) async fn connect_proxy(proxy: &HostPort) -> Result<TcpStream, TunnelError> {
    let addr = proxy.to_string();
    let stream = TcpStream::connect((proxy.host(), proxy.port()))
        .await
        .map_err(|source| TunnelError::Connect {
            addr: addr.clone(),
            source,
        })?;
    stream.set_nodelay(true)?;
    debug!(proxy = %addr, "connected to proxy");
    Ok(stream)
}

/// Run CONNECT rounds on `stream` until the proxy answers with anything but 401.
///
/// Each round feeds the previous challenge to `negotiator`, sends the
/// resulting token and reads one response. Without `max_rounds` a proxy that
/// keeps answering 401 keeps the loop going.
pub(crate) async fn establish<S, N>(
    stream: S,
    negotiator: &mut N,
    spn: &str,
    target: &str,
    max_rounds: Option<NonZeroU32>,
) -> Result<Established<S>, TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    N: Negotiator + ?Sized,
{
    let mut stream = BufReader::new(stream);
    let mut challenge: Option<Token> = None;
    let mut rounds = 0u32;

    loop {
        if let Some(limit) = max_rounds {
            if rounds >= limit.get() {
                return Err(TunnelError::RoundLimit(rounds));
            }
        }
        rounds += 1;

        let round = negotiator.advance(spn, challenge.take())?;
        debug!(
            round = rounds,
            continue_needed = round.continue_needed,
            has_token = round.token.is_some(),
            "security context advanced"
        );

        let request = TunnelRequest::new(target, round.token);
        stream.write_all(&request.encode()).await?;
        stream.flush().await?;
        drop(request);

        let response = read_response(&mut stream).await?;
        debug!(round = rounds, status = response.status, "proxy responded");
        challenge = response.negotiate_challenge();

        if !response.is_auth_required() {
            info!(
                destination = target,
                status = response.status,
                rounds,
                "CONNECT negotiation finished"
            );
            return Ok(Established {
                stream,
                status: response.status,
                reason: response.reason,
                rounds,
            });
        }

        discard_body(&mut stream, &response).await?;
    }
}
