//! Per-connection SASL AUTH bookkeeping. The mechanisms themselves are
//! implemented elsewhere; this tracks what was negotiated and carries
//! the scratch buffers for one challenge/response exchange.
use data_encoding::BASE64;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SaslError {
    #[error("Already authenticated")]
    AlreadyAuthenticated,
    #[error("Authentication mechanism {0} is not supported")]
    UnsupportedMechanism(String),
    #[error("An authentication exchange is already in progress")]
    ExchangeInProgress,
    #[error("No authentication exchange is in progress")]
    NoExchange,
    #[error("Authentication aborted by client")]
    Cancelled,
    #[error("Malformed SASL response: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Default)]
pub struct SaslContext {
    mechanisms: Vec<String>,
    /// Mechanism of the exchange currently in progress
    pending: Option<String>,
    method: Option<String>,
    username: Option<String>,
    sender: Option<String>,
    encoded: String,
    decoded: Vec<u8>,
}

impl SaslContext {
    pub fn new<S: AsRef<str>>(mechanisms: &[S]) -> Self {
        Self {
            mechanisms: mechanisms
                .iter()
                .map(|m| m.as_ref().to_ascii_uppercase())
                .collect(),
            ..Self::default()
        }
    }

    /// The mechanisms offered in the EHLO response
    pub fn mechanisms(&self) -> &[String] {
        &self.mechanisms
    }

    /// The mechanism list formatted for the `AUTH` EHLO keyword
    pub fn mechanism_list(&self) -> String {
        self.mechanisms.join(" ")
    }

    /// Start an exchange using `mechanism`
    pub fn begin(&mut self, mechanism: &str) -> Result<(), SaslError> {
        if self.username.is_some() {
            return Err(SaslError::AlreadyAuthenticated);
        }
        if self.pending.is_some() {
            return Err(SaslError::ExchangeInProgress);
        }
        let mechanism = mechanism.to_ascii_uppercase();
        if !self.mechanisms.contains(&mechanism) {
            return Err(SaslError::UnsupportedMechanism(mechanism));
        }
        self.pending.replace(mechanism);
        Ok(())
    }

    /// Encode a server challenge for transmission to the client
    pub fn encode_challenge(&mut self, challenge: &[u8]) -> Result<&str, SaslError> {
        if self.pending.is_none() {
            return Err(SaslError::NoExchange);
        }
        self.encoded.clear();
        BASE64.encode_append(challenge, &mut self.encoded);
        Ok(&self.encoded)
    }

    /// Decode a client response line
    pub fn decode_response(&mut self, response: &str) -> Result<&[u8], SaslError> {
        if self.pending.is_none() {
            return Err(SaslError::NoExchange);
        }
        let response = response.trim();
        if response == "*" {
            self.abort();
            return Err(SaslError::Cancelled);
        }
        self.decoded = BASE64
            .decode(response.as_bytes())
            .map_err(|err| SaslError::Malformed(format!("{err:#}")))?;
        Ok(&self.decoded)
    }

    /// The exchange succeeded and authenticated `username`
    pub fn complete(&mut self, username: &str) -> Result<(), SaslError> {
        let method = self.pending.take().ok_or(SaslError::NoExchange)?;
        tracing::info!("sasl_method={method}, sasl_username={username}");
        self.method.replace(method);
        self.username.replace(username.to_string());
        self.clear_buffers();
        Ok(())
    }

    /// Abandon the exchange in progress, if any
    pub fn abort(&mut self) {
        if let Some(method) = self.pending.take() {
            tracing::debug!("sasl {method} exchange aborted");
        }
        self.clear_buffers();
    }

    fn clear_buffers(&mut self) {
        self.encoded.clear();
        self.decoded.clear();
    }

    /// Set the authenticated sender override (`MAIL FROM ... AUTH=`)
    pub fn set_sender(&mut self, sender: Option<String>) {
        self.sender = sender;
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.username.is_some()
    }

    pub fn is_exchange_in_progress(&self) -> bool {
        self.pending.is_some()
    }
}
