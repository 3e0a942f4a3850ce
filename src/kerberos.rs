use std::fmt;

use base64::Engine;
use base64::engine::general_purpose;
use bytes::Bytes;
use libgssapi::context::{ClientCtx, CtxFlags, SecurityContext as _};
use libgssapi::error::{Error as GssError, MajorFlags};
use libgssapi::name::Name;
use libgssapi::oid::{GSS_MECH_SPNEGO, GSS_NT_KRB5_PRINCIPAL};
use tracing::debug;

use crate::error::TunnelError;

/// Opaque negotiation token, either produced for the proxy or taken from its challenge.
#[derive(Clone, PartialEq, Eq)]
pub(crate) struct Token(Bytes);

impl Token {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn from_base64(encoded: &str) -> Option<Self> {
        general_purpose::STANDARD
            .decode(encoded.trim())
            .ok()
            .filter(|bytes| !bytes.is_empty())
            .map(Self::new)
    }

    pub fn to_base64(&self) -> String {
        general_purpose::STANDARD.encode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({} bytes)", self.0.len())
    }
}

/// Result of one call to [`Negotiator::advance`].
#[derive(Debug)]
pub(crate) struct Round {
    pub token: Option<Token>,
    pub continue_needed: bool,
}

pub(crate) trait Negotiator {
    /// Feed the latest challenge (absent on the first call) into the security
    /// context and produce the next token for the proxy.
    fn advance(&mut self, spn: &str, challenge: Option<Token>) -> Result<Round, TunnelError>;
}

/// `<service>/<host>`, e.g. `HTTP/proxy.corp.example`.
pub(crate) fn service_principal(service: &str, host: &str) -> String {
    format!("{}/{}", service, host)
}

/// A client security context as seen by the negotiator.
pub(crate) trait SecurityContext {
    /// Run one initiation step. `challenge` is absent on the first step.
    fn step(&mut self, challenge: Option<&[u8]>) -> Result<Option<Token>, TunnelError>;

    fn is_complete(&self) -> bool;
}

/// Creates fresh security contexts for a service principal.
pub(crate) trait ContextProvider {
    type Context: SecurityContext;

    fn new_context(&self, spn: &str) -> Result<Self::Context, TunnelError>;
}

/// Drives a single security context slot through the CONNECT rounds.
///
/// The slot starts empty and is filled on the first call. A pending context
/// is stepped with each challenge. When the proxy answers without a challenge,
/// or keeps rejecting a completed context, the slot is replaced by a fresh
/// context.
pub(crate) struct SpnegoNegotiator<P: ContextProvider = GssProvider> {
    provider: P,
    context: Option<P::Context>,
}

impl SpnegoNegotiator<GssProvider> {
    pub fn new() -> Self {
        Self::with_provider(GssProvider::default())
    }
}

impl<P: ContextProvider> SpnegoNegotiator<P> {
    pub fn with_provider(provider: P) -> Self {
        Self {
            provider,
            context: None,
        }
    }
}

impl<P: ContextProvider> Negotiator for SpnegoNegotiator<P> {
    fn advance(&mut self, spn: &str, mut challenge: Option<Token>) -> Result<Round, TunnelError> {
        let mut context = match self.context.take() {
            Some(context) if !context.is_complete() && challenge.is_some() => context,
            previous => {
                match (&previous, &challenge) {
                    (None, Some(_)) => {
                        debug!("ignoring challenge received before any context existed")
                    }
                    (None, None) => {}
                    (Some(previous), _) if previous.is_complete() => {
                        debug!("proxy rejected an established context, starting over")
                    }
                    (Some(_), _) => {
                        debug!("proxy sent no challenge for a pending context, starting over")
                    }
                }
                drop(previous);
                challenge = None;
                self.provider.new_context(spn)?
            }
        };

        let token = context.step(challenge.as_ref().map(Token::as_bytes))?;
        let continue_needed = !context.is_complete();
        self.context = Some(context);

        Ok(Round {
            token,
            continue_needed,
        })
    }
}

/// SPNEGO contexts from the system GSSAPI library, using the default credential.
pub(crate) struct GssProvider {
    flags: CtxFlags,
}

impl Default for GssProvider {
    fn default() -> Self {
        Self {
            flags: CtxFlags::empty(),
        }
    }
}

impl ContextProvider for GssProvider {
    type Context = GssContext;

    fn new_context(&self, spn: &str) -> Result<GssContext, TunnelError> {
        let target = Name::new(spn.as_bytes(), Some(&GSS_NT_KRB5_PRINCIPAL))
            .map_err(classify_failure)?;
        Ok(GssContext(ClientCtx::new(
            None,
            target,
            self.flags,
            Some(&GSS_MECH_SPNEGO),
        )))
    }
}

pub(crate) struct GssContext(ClientCtx);

impl SecurityContext for GssContext {
    fn step(&mut self, challenge: Option<&[u8]>) -> Result<Option<Token>, TunnelError> {
        let token = self.0.step(challenge, None).map_err(classify_failure)?;
        Ok(token
            .filter(|buf| !buf.is_empty())
            .map(|buf| Token::new(Bytes::copy_from_slice(&buf))))
    }

    fn is_complete(&self) -> bool {
        self.0.is_complete()
    }
}

/// Routine errors are a number in bits 16..24 of the major status, not flags.
const ROUTINE_ERROR_MASK: u32 = 0xff << 16;

/// Major codes meaning the caller has no usable ticket. SPNEGO reports
/// `BAD_MECH` when no mechanism has a credential.
fn is_missing_credential(major: MajorFlags) -> bool {
    let routine = major.bits() & ROUTINE_ERROR_MASK;
    [
        MajorFlags::GSS_S_NO_CRED,
        MajorFlags::GSS_S_BAD_MECH,
        MajorFlags::GSS_S_CREDENTIALS_EXPIRED,
    ]
    .iter()
    .any(|code| code.bits() == routine)
}

fn classify_failure(err: GssError) -> TunnelError {
    if is_missing_credential(err.major) {
        debug!(error = %err, "provider reported no usable credential");
        TunnelError::CredentialsMissing
    } else {
        TunnelError::Negotiation(err.to_string())
    }
}
