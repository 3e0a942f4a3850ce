use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tracing::{debug, warn};

use crate::error::TunnelError;
use crate::kerberos::Token;

pub(crate) const AUTH_REQUIRED: u16 = 401;
pub(crate) const NEGOTIATE_SCHEME: &str = "Negotiate";

const MAX_HEAD_SIZE: usize = 16 * 1024;
const MAX_HEADERS: usize = 64;

/// A `CONNECT` request carrying the current outgoing token, if any.
pub(crate) struct TunnelRequest<'a> {
    target: &'a str,
    token: Option<Token>,
}

impl<'a> TunnelRequest<'a> {
    pub fn new(target: &'a str, token: Option<Token>) -> Self {
        Self { target, token }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut request = format!(
            "CONNECT {} HTTP/1.1\r\nHost: {}\r\n",
            self.target, self.target
        );
        if let Some(token) = &self.token {
            request.push_str(&format!(
                "Authorization: {} {}\r\n",
                NEGOTIATE_SCHEME,
                token.to_base64()
            ));
        }
        request.push_str("\r\n");
        request.into_bytes()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    Empty,
    Length(u64),
    Chunked,
}

/// Status line and headers of a proxy response.
#[derive(Debug)]
pub(crate) struct TunnelResponse {
    pub status: u16,
    pub reason: String,
    headers: Vec<(String, Vec<u8>)>,
}

impl TunnelResponse {
    pub fn is_auth_required(&self) -> bool {
        self.status == AUTH_REQUIRED
    }

    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers(name).next()
    }

    fn headers<'s>(&'s self, name: &'s str) -> impl Iterator<Item = &'s [u8]> + 's {
        self.headers
            .iter()
            .filter(move |(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_slice())
    }

    /// The token of the first `WWW-Authenticate: Negotiate <token>` header.
    /// A bare `Negotiate` or an undecodable token counts as no challenge.
    pub fn negotiate_challenge(&self) -> Option<Token> {
        self.headers("WWW-Authenticate").find_map(|value| {
            let value = std::str::from_utf8(value).ok()?.trim();
            let (scheme, encoded) = value.split_once(' ')?;
            if !scheme.eq_ignore_ascii_case(NEGOTIATE_SCHEME) {
                return None;
            }
            let token = Token::from_base64(encoded);
            if token.is_none() {
                warn!("ignoring malformed Negotiate challenge from proxy");
            }
            token
        })
    }

    pub fn body_framing(&self) -> Result<BodyFraming, TunnelError> {
        if let Some(encoding) = self.header("Transfer-Encoding") {
            let encoding = String::from_utf8_lossy(encoding);
            if encoding
                .rsplit(',')
                .next()
                .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"))
            {
                return Ok(BodyFraming::Chunked);
            }
        }

        match self.header("Content-Length") {
            Some(length) => std::str::from_utf8(length)
                .ok()
                .and_then(|length| length.trim().parse::<u64>().ok())
                .map(BodyFraming::Length)
                .ok_or_else(|| {
                    TunnelError::MalformedResponse(format!(
                        "invalid Content-Length: {}",
                        String::from_utf8_lossy(length)
                    ))
                }),
            None => Ok(BodyFraming::Empty),
        }
    }
}

/// Read one response head. Bytes past the blank line stay in `reader`.
pub(crate) async fn read_response<R>(reader: &mut R) -> Result<TunnelResponse, TunnelError>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::with_capacity(512);
    loop {
        let remaining = (MAX_HEAD_SIZE + 1 - head.len()) as u64;
        let read = (&mut *reader)
            .take(remaining)
            .read_until(b'\n', &mut head)
            .await?;
        if read == 0 {
            return Err(TunnelError::ProxyClosed);
        }
        if head.len() > MAX_HEAD_SIZE {
            return Err(TunnelError::MalformedResponse(format!(
                "response head exceeds {} bytes",
                MAX_HEAD_SIZE
            )));
        }
        if head.ends_with(b"\r\n\r\n") || head.ends_with(b"\n\n") {
            break;
        }
    }

    parse_head(&head)
}

fn parse_head(head: &[u8]) -> Result<TunnelResponse, TunnelError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);

    match response.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(TunnelError::MalformedResponse(
                "incomplete response head".to_owned(),
            ));
        }
        Err(err) => return Err(TunnelError::MalformedResponse(err.to_string())),
    }

    let status = response
        .code
        .ok_or_else(|| TunnelError::MalformedResponse("missing status code".to_owned()))?;

    Ok(TunnelResponse {
        status,
        reason: response.reason.unwrap_or_default().to_owned(),
        headers: response
            .headers
            .iter()
            .map(|header| (header.name.to_owned(), header.value.to_vec()))
            .collect(),
    })
}

/// Consume the body of `response` so the next response on the same
/// connection starts at a head.
pub(crate) async fn discard_body<R>(
    reader: &mut R,
    response: &TunnelResponse,
) -> Result<(), TunnelError>
where
    R: AsyncBufRead + Unpin,
{
    match response.body_framing()? {
        BodyFraming::Empty => Ok(()),
        BodyFraming::Length(length) => {
            debug!(length, "discarding response body");
            discard_exact(reader, length).await
        }
        BodyFraming::Chunked => {
            debug!("discarding chunked response body");
            discard_chunked(reader).await
        }
    }
}

async fn discard_exact<R>(reader: &mut R, length: u64) -> Result<(), TunnelError>
where
    R: AsyncBufRead + Unpin,
{
    let copied = tokio::io::copy(&mut reader.take(length), &mut tokio::io::sink()).await?;
    if copied < length {
        return Err(TunnelError::ProxyClosed);
    }
    Ok(())
}

async fn discard_chunked<R>(reader: &mut R) -> Result<(), TunnelError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let size_line = read_line(reader).await?;
        let size = size_line
            .split(';')
            .next()
            .and_then(|size| u64::from_str_radix(size.trim(), 16).ok())
            .ok_or_else(|| {
                TunnelError::MalformedResponse(format!("invalid chunk size: {}", size_line.trim()))
            })?;

        if size == 0 {
            // trailers end with an empty line
            while !read_line(reader).await?.trim().is_empty() {}
            return Ok(());
        }

        discard_exact(reader, size).await?;
        read_line(reader).await?;
    }
}

async fn read_line<R>(reader: &mut R) -> Result<String, TunnelError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let read = (&mut *reader)
        .take(MAX_HEAD_SIZE as u64)
        .read_until(b'\n', &mut line)
        .await?;
    if read == 0 {
        return Err(TunnelError::ProxyClosed);
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}
