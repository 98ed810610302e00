//! The state of one SMTP session, from connection accept to disconnect.
//!
//! Fields fall into two lifetimes. Message-scoped state describes the
//! transaction in progress and is cleared by [ResetScope::Message] at
//! every message boundary. Connection-scoped state (the peer identity,
//! anything forwarded by a trusted upstream, authentication and the
//! error counters) survives until [ResetScope::Connection] or
//! [Session::disconnect].
use crate::attr::{AttrCategory, ClientAttrs, Effective, UNKNOWN};
use crate::config::SmtpdConfig;
use crate::error::SessionError;
use crate::mode::{SubmissionMode, SubmissionStream};
use crate::policy::{
    Decision, DeferralPolicy, NotifyClass, PendingAction, PendingActions, Verdict,
};
#[cfg(feature = "sasl")]
use crate::sasl::SaslContext;
use crate::transport::{ProcessIdentity, Transport};
use crate::xforward::{
    xtext_encode, XforwardError, XforwardFeatures, XforwardFlags, XforwardOverlay,
    XforwardUpdate, XFORWARD_TEMPUNAVAIL, XFORWARD_UNAVAILABLE,
};
use chrono::{DateTime, Utc};
use peer_resolver::{resolve_peer, PeerCode, PeerIdentity, Resolver};
use serde::Serialize;
use std::net::IpAddr;

/// How much state [Session::reset] discards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetScope {
    /// End of a mail transaction: RSET, HELO, or a completed message
    Message,
    /// End of the connection
    Connection,
}

/// Where in the conversation the session is. Used in
/// "lost connection after ..." diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum Stage {
    Connect,
    Helo,
    Ehlo,
    Auth,
    Mail,
    Rcpt,
    Data,
    EndOfMessage,
    Rset,
    Xforward,
    Etrn,
    Quit,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        let label = match self {
            Self::Connect => "CONNECT",
            Self::Helo => "HELO",
            Self::Ehlo => "EHLO",
            Self::Auth => "AUTH",
            Self::Mail => "MAIL",
            Self::Rcpt => "RCPT",
            Self::Data => "DATA",
            Self::EndOfMessage => "END-OF-MESSAGE",
            Self::Rset => "RSET",
            Self::Xforward => "XFORWARD",
            Self::Etrn => "ETRN",
            Self::Quit => "QUIT",
        };
        fmt.write_str(label)
    }
}

/// A queue id that was allocated but never committed when the
/// client went away. The queue file must be cleaned up by the owner
/// of the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AbandonedSubmission {
    pub queue_id: String,
    pub stage: Stage,
}

/// A point-in-time view of a session, for logging and diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub peer: String,
    pub start_time: DateTime<Utc>,
    pub client_name: String,
    pub client_addr: String,
    pub client_namaddr: String,
    pub client_protocol: String,
    pub client_helo: Option<String>,
    pub client_forwarded: bool,
    pub peer_code: PeerCode,
    pub message_ident: Option<String>,
    pub stage: Stage,
    pub error_count: usize,
    pub rcpt_count: usize,
    pub submission_mode: Option<SubmissionMode>,
    pub pending: PendingActions,
    pub sasl_username: Option<String>,
}

#[derive(Debug)]
pub struct Session {
    transport: Transport,
    start_time: DateTime<Utc>,
    process: ProcessIdentity,

    error_count: usize,
    error_mask: NotifyClass,
    notify_mask: NotifyClass,
    junk_cmds: usize,
    rcpt_count: usize,
    etrn_name: Option<String>,

    real: ClientAttrs,
    peer_code: PeerCode,
    peer_port: Option<u16>,
    overlay: XforwardOverlay,
    #[cfg(feature = "sasl")]
    sasl: Option<SaslContext>,

    stage: Stage,
    queue_id: Option<String>,
    sender: Option<String>,
    recipient: Option<String>,
    message_rcpt_count: usize,
    message_size: Option<u64>,
    encoding: Option<String>,
    verp_delims: Option<String>,
    history: Vec<String>,
    access_denied: Option<String>,
    reason: Option<String>,

    policy: DeferralPolicy,
    pending: PendingActions,

    mode: Option<SubmissionMode>,
    stream: Option<Box<dyn SubmissionStream>>,
    proxy_features: XforwardFeatures,
}

impl Session {
    /// A session with nothing known about the peer
    fn pristine(transport: Transport) -> Self {
        let unknown = PeerIdentity::unknown();
        Self {
            transport,
            start_time: Utc::now(),
            process: ProcessIdentity::current(),
            error_count: 0,
            error_mask: NotifyClass::empty(),
            notify_mask: NotifyClass::empty(),
            junk_cmds: 0,
            rcpt_count: 0,
            etrn_name: None,
            real: ClientAttrs::default(),
            peer_code: unknown.code,
            peer_port: None,
            overlay: XforwardOverlay::init(),
            #[cfg(feature = "sasl")]
            sasl: None,
            stage: Stage::Connect,
            queue_id: None,
            sender: None,
            recipient: None,
            message_rcpt_count: 0,
            message_size: None,
            encoding: None,
            verp_delims: None,
            history: vec![],
            access_denied: None,
            reason: None,
            policy: DeferralPolicy::default(),
            pending: PendingActions::default(),
            mode: None,
            stream: None,
            proxy_features: XforwardFeatures::empty(),
        }
    }

    /// Set up the state for a newly accepted connection, resolving the
    /// name of the peer. Resolution problems are never fatal; they
    /// leave the name unknown.
    pub async fn init(
        transport: Transport,
        config: &SmtpdConfig,
        resolver: &dyn Resolver,
    ) -> Result<Self, SessionError> {
        #[cfg(feature = "sasl")]
        let sasl = if config.sasl.enabled {
            if config.sasl.mechanisms.is_empty() {
                return Err(SessionError::NoSaslMechanisms);
            }
            Some(SaslContext::new(&config.sasl.mechanisms))
        } else {
            None
        };
        #[cfg(not(feature = "sasl"))]
        if config.sasl.enabled {
            tracing::warn!("SASL is enabled in the configuration but support is not compiled in");
        }

        let mut session = Self::pristine(transport);
        #[cfg(feature = "sasl")]
        {
            session.sasl = sasl;
        }
        session.notify_mask = config.notify_classes;

        let peer = resolve_peer(resolver, &transport.peer, config.peer_lookup_timeout).await;
        session.set_peer(peer);
        tracing::info!(
            "connect from {} peer_code={}",
            session.real_namaddr(),
            session.peer_code.reply_class()
        );
        Ok(session)
    }

    fn set_peer(&mut self, peer: PeerIdentity) {
        self.real.set_endpoint(&peer.name, &peer.addr);
        self.peer_code = peer.code;
        self.peer_port = peer.port;
    }

    fn real_namaddr(&self) -> &str {
        self.real.get(AttrCategory::NameAddr).unwrap_or(UNKNOWN)
    }

    /// Discard state. Safe to call any number of times.
    pub fn reset(&mut self, scope: ResetScope) {
        self.queue_id = None;
        self.sender = None;
        self.recipient = None;
        self.message_rcpt_count = 0;
        self.message_size = None;
        self.encoding = None;
        self.verp_delims = None;
        self.history.clear();
        self.access_denied = None;
        self.reason = None;
        self.policy.reset();
        self.pending = PendingActions::default();
        if let Some(stream) = self.stream.take() {
            tracing::debug!("aborting submission of {}", stream.queue_id());
            stream.abort();
        }
        #[cfg(feature = "sasl")]
        if let Some(sasl) = &mut self.sasl {
            sasl.set_sender(None);
        }

        if scope == ResetScope::Connection {
            self.real = ClientAttrs::default();
            self.peer_code = PeerIdentity::unknown().code;
            self.peer_port = None;
            self.overlay.reset();
            #[cfg(feature = "sasl")]
            {
                self.sasl = None;
            }
            self.error_count = 0;
            self.error_mask = NotifyClass::empty();
            self.notify_mask = NotifyClass::empty();
            self.junk_cmds = 0;
            self.rcpt_count = 0;
            self.etrn_name = None;
            self.mode = None;
            self.proxy_features = XforwardFeatures::empty();
            self.stage = Stage::Connect;
        }
    }

    /// The client went away without saying QUIT. Returns the queue id
    /// of a message that was started but not committed, so that its
    /// queue file can be removed.
    pub fn disconnect(&mut self) -> Option<AbandonedSubmission> {
        tracing::info!(
            "lost connection after {} from {}",
            self.stage,
            self.client_namaddr()
        );
        let abandoned = self.queue_id.take().map(|queue_id| AbandonedSubmission {
            queue_id,
            stage: self.stage,
        });
        self.reset(ResetScope::Connection);
        abandoned
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn peer_code(&self) -> PeerCode {
        self.peer_code
    }

    pub fn peer_port(&self) -> Option<u16> {
        self.peer_port
    }

    /// The value of `category` that access control should use
    pub fn effective(&self, category: AttrCategory) -> Effective<'_> {
        self.overlay
            .effective(category, &self.real, self.queue_id.as_deref())
    }

    /// Returns true if the effective value of `category` is known
    pub fn is_available(&self, category: AttrCategory) -> bool {
        category.is_available(self.effective(category).value())
    }

    pub fn client_name(&self) -> &str {
        self.effective(AttrCategory::Name).or_unknown()
    }

    pub fn client_addr(&self) -> &str {
        self.effective(AttrCategory::Addr).or_unknown()
    }

    pub fn client_namaddr(&self) -> &str {
        self.effective(AttrCategory::NameAddr).or_unknown()
    }

    pub fn client_protocol(&self) -> &str {
        self.effective(AttrCategory::Protocol).or_unknown()
    }

    pub fn client_helo(&self) -> Option<&str> {
        self.effective(AttrCategory::Helo).value()
    }

    pub fn message_ident(&self) -> Option<&str> {
        self.effective(AttrCategory::Ident).value()
    }

    /// Returns true if the connected peer, as opposed to whoever it
    /// forwards for, may send XFORWARD
    pub fn is_xforward_peer(&self, config: &SmtpdConfig) -> bool {
        self.real
            .get(AttrCategory::Addr)
            .and_then(|addr| addr.parse::<IpAddr>().ok())
            .map(|ip| config.is_xforward_host(ip))
            .unwrap_or(false)
    }

    /// Prepare to receive forwarded attributes
    pub fn xforward_preset(&mut self) {
        self.overlay.preset();
    }

    pub fn xforward_apply(&mut self, update: XforwardUpdate) {
        self.overlay.apply(update);
    }

    /// Decode and apply the arguments of an XFORWARD command.
    /// Nothing is applied unless every attribute is valid.
    /// The caller is responsible for checking that the peer is trusted.
    pub fn xforward_command(&mut self, args: &str) -> Result<(), XforwardError> {
        let updates = XforwardUpdate::parse_command(args)?;
        self.overlay.preset();
        for update in updates {
            self.overlay.apply(update);
        }
        tracing::debug!(
            "xforward from {}: now {}",
            self.real_namaddr(),
            self.client_namaddr()
        );
        Ok(())
    }

    pub fn xforward_reset(&mut self) {
        self.overlay.reset();
    }

    pub fn xforward_flags(&self) -> XforwardFlags {
        self.overlay.flags()
    }

    /// Record which XFORWARD attributes the before-queue proxy accepts
    pub fn set_proxy_features(&mut self, features: XforwardFeatures) {
        self.proxy_features = features;
    }

    pub fn proxy_features(&self) -> XforwardFeatures {
        self.proxy_features
    }

    /// The `NAME=value` pairs to send to the before-queue proxy so that
    /// it sees the same client identity that we do. Only the attributes
    /// the proxy advertised are included.
    pub fn proxy_xforward_attributes(&self) -> Vec<String> {
        let mut attrs = vec![];
        let unavailable = |category: AttrCategory| {
            // A name that we could not look up due to a transient
            // error is reported as such
            if category == AttrCategory::Name
                && !self.overlay.is_client_forwarded()
                && self.peer_code == PeerCode::Temp
            {
                XFORWARD_TEMPUNAVAIL.to_string()
            } else {
                XFORWARD_UNAVAILABLE.to_string()
            }
        };

        for (feature, label, category) in [
            (XforwardFeatures::NAME, "NAME", AttrCategory::Name),
            (XforwardFeatures::ADDR, "ADDR", AttrCategory::Addr),
            (XforwardFeatures::PROTO, "PROTO", AttrCategory::Protocol),
            (XforwardFeatures::HELO, "HELO", AttrCategory::Helo),
            (XforwardFeatures::IDENT, "IDENT", AttrCategory::Ident),
        ] {
            if !self.proxy_features.contains(feature) {
                continue;
            }
            let value = match self.effective(category).value() {
                Some(value) if category.is_available(Some(value)) => {
                    match value.parse::<IpAddr>() {
                        Ok(IpAddr::V6(_)) if category == AttrCategory::Addr => {
                            format!("IPV6:{value}")
                        }
                        _ => value.to_string(),
                    }
                }
                _ => unavailable(category),
            };
            attrs.push(format!("{label}={}", xtext_encode(&value)));
        }
        attrs
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn set_stage(&mut self, stage: Stage) {
        self.stage = stage;
    }

    /// Count an error reply sent to the client
    pub fn record_error(&mut self, class: NotifyClass) {
        self.error_count += 1;
        self.error_mask |= class;
    }

    pub fn error_count(&self) -> usize {
        self.error_count
    }

    pub fn error_mask(&self) -> NotifyClass {
        self.error_mask
    }

    /// Returns true if an error of a class that the postmaster
    /// wants to hear about has occurred
    pub fn should_notify_postmaster(&self) -> bool {
        self.error_mask.intersects(self.notify_mask)
    }

    /// Count a command that did nothing useful
    pub fn record_junk(&mut self) -> usize {
        self.junk_cmds += 1;
        self.junk_cmds
    }

    pub fn junk_cmds(&self) -> usize {
        self.junk_cmds
    }

    /// Remember a command of the current transaction, for error reports
    pub fn push_history(&mut self, command: &str) {
        self.history.push(command.to_string());
    }

    pub fn history(&self) -> &[String] {
        &self.history
    }

    /// The client introduced itself. This also ends any
    /// transaction in progress.
    pub fn helo(&mut self, name: &str, extended: bool) {
        self.reset(ResetScope::Message);
        self.real.set_helo(Some(name.to_string()));
        self.real
            .set_protocol(if extended { "ESMTP" } else { "SMTP" }.to_string());
        self.stage = if extended { Stage::Ehlo } else { Stage::Helo };
    }

    /// Start a mail transaction for `sender`
    pub fn begin_message(&mut self, queue_id: Option<String>, sender: &str) {
        if queue_id.is_some() {
            self.queue_id = queue_id;
        }
        self.sender.replace(sender.to_string());
        self.stage = Stage::Mail;
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn queue_id(&self) -> Option<&str> {
        self.queue_id.as_deref()
    }

    pub fn add_recipient(&mut self, recipient: &str) {
        self.recipient.replace(recipient.to_string());
        self.message_rcpt_count += 1;
        self.rcpt_count += 1;
        self.stage = Stage::Rcpt;
    }

    /// The most recently accepted recipient
    pub fn recipient(&self) -> Option<&str> {
        self.recipient.as_deref()
    }

    /// Recipients accepted for the current message
    pub fn message_rcpt_count(&self) -> usize {
        self.message_rcpt_count
    }

    /// Recipients accepted over the whole connection
    pub fn rcpt_count(&self) -> usize {
        self.rcpt_count
    }

    pub fn set_message_size(&mut self, size: u64) {
        self.message_size.replace(size);
    }

    pub fn message_size(&self) -> Option<u64> {
        self.message_size
    }

    /// Record the `BODY=` and `XVERP` parameters of MAIL FROM
    pub fn set_mail_params(&mut self, encoding: Option<String>, verp_delims: Option<String>) {
        self.encoding = encoding;
        self.verp_delims = verp_delims;
    }

    pub fn encoding(&self) -> Option<&str> {
        self.encoding.as_deref()
    }

    pub fn verp_delims(&self) -> Option<&str> {
        self.verp_delims.as_deref()
    }

    pub fn set_access_denied(&mut self, text: &str) {
        self.access_denied.replace(text.to_string());
    }

    pub fn access_denied(&self) -> Option<&str> {
        self.access_denied.as_deref()
    }

    pub fn set_reason(&mut self, reason: &str) {
        self.reason.replace(reason.to_string());
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn set_etrn_name(&mut self, name: &str) {
        self.etrn_name.replace(name.to_string());
        self.stage = Stage::Etrn;
    }

    pub fn etrn_name(&self) -> Option<&str> {
        self.etrn_name.as_deref()
    }

    pub fn policy(&self) -> &DeferralPolicy {
        &self.policy
    }

    pub fn policy_mut(&mut self) -> &mut DeferralPolicy {
        &mut self.policy
    }

    /// Apply the armed policy overrides to an access-control verdict
    pub fn evaluate(&mut self, verdict: Verdict, config: &SmtpdConfig) -> Decision {
        let decision = self.policy.evaluate(verdict, config.defer_code);
        match &decision {
            Decision::Defer { class, .. } => self.error_mask |= *class,
            Decision::Reject { .. } => self.error_mask |= NotifyClass::POLICY,
            Decision::Accept | Decision::Warn { .. } | Decision::Discard { .. } => {}
        }
        decision
    }

    /// Stage an action for the end of the message
    pub fn postpone(&mut self, action: PendingAction) {
        tracing::debug!("{}: postponing {action:?}", self.client_namaddr());
        self.pending.push(action);
    }

    pub fn pending(&self) -> &PendingActions {
        &self.pending
    }

    /// Hand the postponed actions to the end-of-message step
    pub fn take_pending(&mut self) -> PendingActions {
        std::mem::take(&mut self.pending)
    }

    /// Override the process identity used to choose the submission mode
    pub fn set_process_identity(&mut self, process: ProcessIdentity) {
        self.process = process;
    }

    /// How this session submits mail. Decided the first time it is
    /// asked for and then fixed until the connection is reset.
    pub fn submission_mode(&mut self, config: &SmtpdConfig) -> &SubmissionMode {
        self.mode
            .get_or_insert_with(|| SubmissionMode::select(&self.transport, self.process, config))
    }

    /// Take ownership of an opened submission. The queue id of the
    /// submission becomes the queue id of the message.
    pub fn attach_stream(&mut self, stream: Box<dyn SubmissionStream>) {
        if let Some(previous) = self.stream.take() {
            tracing::warn!(
                "replacing unfinished submission {} with {}",
                previous.queue_id(),
                stream.queue_id()
            );
            previous.abort();
        }
        self.queue_id.replace(stream.queue_id().to_string());
        self.stream.replace(stream);
    }

    /// Take the submission in order to commit it
    pub fn take_stream(&mut self) -> Option<Box<dyn SubmissionStream>> {
        self.stream.take()
    }

    pub fn has_stream(&self) -> bool {
        self.stream.is_some()
    }

    #[cfg(feature = "sasl")]
    pub fn sasl(&self) -> Option<&SaslContext> {
        self.sasl.as_ref()
    }

    #[cfg(feature = "sasl")]
    pub fn sasl_mut(&mut self) -> Option<&mut SaslContext> {
        self.sasl.as_mut()
    }

    fn sasl_username(&self) -> Option<String> {
        #[cfg(feature = "sasl")]
        {
            self.sasl
                .as_ref()
                .and_then(|sasl| sasl.username())
                .map(|s| s.to_string())
        }
        #[cfg(not(feature = "sasl"))]
        {
            None
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            peer: self.transport.peer.to_string(),
            start_time: self.start_time,
            client_name: self.client_name().to_string(),
            client_addr: self.client_addr().to_string(),
            client_namaddr: self.client_namaddr().to_string(),
            client_protocol: self.client_protocol().to_string(),
            client_helo: self.client_helo().map(|s| s.to_string()),
            client_forwarded: self.overlay.is_client_forwarded(),
            peer_code: self.peer_code,
            message_ident: self.message_ident().map(|s| s.to_string()),
            stage: self.stage,
            error_count: self.error_count,
            rcpt_count: self.rcpt_count,
            submission_mode: self.mode.clone(),
            pending: self.pending.clone(),
            sasl_username: self.sasl_username(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::policy::PermitTriggers;
    use crate::reply::{EnhancedStatusCode, Reply};
    use k9::assert_equal;
    use peer_resolver::TestResolver;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn resolver() -> TestResolver {
        TestResolver::default()
            .with_ptr(ip("192.0.2.1"), "mail.example.com")
            .with_ip("mail.example.com", ip("192.0.2.1"))
    }

    fn inet(peer: &str) -> Transport {
        Transport::inet(peer.parse().unwrap(), "192.0.2.25:25".parse().unwrap())
    }

    async fn session() -> Session {
        Session::init(inet("192.0.2.1:4000"), &SmtpdConfig::default(), &resolver())
            .await
            .unwrap()
    }

    #[derive(Debug)]
    struct TestStream {
        queue_id: String,
        aborted: Arc<AtomicBool>,
    }

    impl TestStream {
        fn new(queue_id: &str) -> (Box<dyn SubmissionStream>, Arc<AtomicBool>) {
            let aborted = Arc::new(AtomicBool::new(false));
            (
                Box::new(Self {
                    queue_id: queue_id.to_string(),
                    aborted: aborted.clone(),
                }),
                aborted,
            )
        }
    }

    impl SubmissionStream for TestStream {
        fn queue_id(&self) -> &str {
            &self.queue_id
        }

        fn abort(self: Box<Self>) {
            self.aborted.store(true, Ordering::SeqCst);
        }
    }

    fn rejected() -> Verdict {
        Verdict::Reject(Reply::new(
            554,
            Some(EnhancedStatusCode {
                class: 5,
                subject: 7,
                detail: 1,
            }),
            "Access denied",
        ))
    }

    #[tokio::test]
    async fn init() {
        let session = session().await;
        assert_equal!(session.client_name(), "mail.example.com");
        assert_equal!(session.client_addr(), "192.0.2.1");
        assert_equal!(session.client_namaddr(), "mail.example.com[192.0.2.1]");
        assert_equal!(session.client_protocol(), UNKNOWN);
        assert_equal!(session.client_helo(), None);
        assert_equal!(session.message_ident(), None);
        assert_equal!(session.peer_code(), PeerCode::Ok);
        assert_equal!(session.peer_port(), Some(4000));
        assert_equal!(session.stage(), Stage::Connect);
        assert_equal!(session.error_count(), 0);
        assert_equal!(session.rcpt_count(), 0);
        assert_equal!(session.xforward_flags(), XforwardFlags::empty());
        assert!(!session.policy().is_armed());
        #[cfg(feature = "sasl")]
        assert!(session.sasl().is_none());
    }

    #[tokio::test]
    async fn init_unresolvable_peer() {
        let session = Session::init(
            inet("198.51.100.9:4000"),
            &SmtpdConfig::default(),
            &resolver(),
        )
        .await
        .unwrap();
        assert_equal!(session.client_name(), UNKNOWN);
        assert_equal!(session.client_namaddr(), "unknown[198.51.100.9]");
        assert_equal!(session.peer_code(), PeerCode::Perm);
        assert!(!session.is_available(AttrCategory::Name));
        assert!(session.is_available(AttrCategory::Addr));
    }

    #[tokio::test]
    async fn init_local_stream() {
        let session = Session::init(
            Transport::local(),
            &SmtpdConfig::default(),
            &TestResolver::default(),
        )
        .await
        .unwrap();
        assert_equal!(session.client_namaddr(), "localhost[127.0.0.1]");
        assert_equal!(session.peer_code(), PeerCode::Ok);
    }

    #[cfg(feature = "sasl")]
    #[tokio::test]
    async fn init_with_sasl() {
        let mut config = SmtpdConfig::default();
        config.sasl.enabled = true;
        let session = Session::init(inet("192.0.2.1:4000"), &config, &resolver())
            .await
            .unwrap();
        assert_equal!(
            session.sasl().map(|sasl| sasl.mechanism_list()),
            Some("PLAIN LOGIN".to_string())
        );

        config.sasl.mechanisms.clear();
        let err = Session::init(inet("192.0.2.1:4000"), &config, &resolver())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NoSaslMechanisms));
    }

    #[cfg(feature = "sasl")]
    #[tokio::test]
    async fn authentication_outlives_the_message_but_not_the_connection() {
        let mut config = SmtpdConfig::default();
        config.sasl.enabled = true;
        let mut session = Session::init(inet("192.0.2.1:4000"), &config, &resolver())
            .await
            .unwrap();

        let sasl = session.sasl_mut().unwrap();
        sasl.begin("plain").unwrap();
        sasl.complete("alice").unwrap();
        sasl.set_sender(Some("alice@example.com".to_string()));
        session.begin_message(None, "alice@example.com");

        session.reset(ResetScope::Message);
        let sasl = session.sasl().unwrap();
        assert_equal!(sasl.username(), Some("alice"));
        assert_equal!(sasl.method(), Some("PLAIN"));
        assert!(sasl.is_authenticated());
        assert_equal!(sasl.sender(), None);
        assert_equal!(session.summary().sasl_username, Some("alice".to_string()));

        session.reset(ResetScope::Connection);
        assert!(session.sasl().is_none());
        assert_equal!(session.summary().sasl_username, None);
    }

    #[tokio::test]
    async fn forwarded_value_is_effective_until_reset() {
        let mut session = session().await;
        session.xforward_apply(XforwardUpdate::Name("relay.example.net".to_string()));
        assert_equal!(session.client_name(), "relay.example.net");
        assert!(session.effective(AttrCategory::Name).is_forwarded());

        session.reset(ResetScope::Message);
        assert_equal!(session.client_name(), "relay.example.net");

        session.xforward_reset();
        assert_equal!(session.client_name(), "mail.example.com");
    }

    #[tokio::test]
    async fn forwarded_name_takes_the_address_with_it() {
        let mut session = session().await;
        assert_equal!(session.client_name(), "mail.example.com");

        session.xforward_apply(XforwardUpdate::Name("relay.upstream.example".to_string()));
        assert_equal!(session.client_name(), "relay.upstream.example");
        assert_equal!(session.client_addr(), UNKNOWN);
        assert!(session.effective(AttrCategory::Addr).is_forwarded());
        assert_equal!(session.client_namaddr(), "relay.upstream.example");

        session.xforward_apply(XforwardUpdate::Addr("198.51.100.7".to_string()));
        assert_equal!(
            session.client_namaddr(),
            "relay.upstream.example[198.51.100.7]"
        );
    }

    /// Forwarding only an address switches every client attribute
    /// over to the forwarded set, leaving the others at their defaults
    #[tokio::test]
    async fn client_attributes_are_forwarded_together() {
        let mut session = session().await;
        session.helo("mail.example.com", true);
        session.xforward_preset();
        session.xforward_apply(XforwardUpdate::Addr("203.0.113.5".to_string()));

        assert_equal!(session.client_addr(), "203.0.113.5");
        assert_equal!(session.client_name(), UNKNOWN);
        assert_equal!(session.client_namaddr(), "unknown[203.0.113.5]");
        assert_equal!(session.client_protocol(), UNKNOWN);
        assert_equal!(session.client_helo(), None);
        assert!(!session.is_available(AttrCategory::Name));
        assert!(!session.is_available(AttrCategory::Helo));
        assert_equal!(
            session.xforward_flags(),
            XforwardFlags::INIT | XforwardFlags::ADDR
        );
    }

    #[tokio::test]
    async fn preset_and_apply_in_either_order() {
        let mut session = session().await;
        session.xforward_preset();
        session.xforward_apply(XforwardUpdate::Protocol("SMTP".to_string()));
        assert_equal!(session.client_protocol(), "SMTP");

        let mut session = self::session().await;
        session.xforward_apply(XforwardUpdate::Protocol("SMTP".to_string()));
        session.xforward_preset();
        assert_equal!(session.client_protocol(), "SMTP");
    }

    #[tokio::test]
    async fn xforward_command() {
        let mut session = session().await;
        assert!(!session.is_xforward_peer(&SmtpdConfig::default()));

        session
            .xforward_command("NAME=relay.example.net ADDR=IPv6:2001:db8::7 IDENT=ABC123")
            .unwrap();
        assert_equal!(session.client_namaddr(), "relay.example.net[2001:db8::7]");

        // The forwarded identifier replaces our own queue id
        session.begin_message(Some("LOCALQID".to_string()), "sender@example.com");
        assert_equal!(session.message_ident(), Some("ABC123"));

        // Invalid commands change nothing
        assert!(session
            .xforward_command("NAME=other.example.net ADDR=bogus")
            .is_err());
        assert_equal!(session.client_name(), "relay.example.net");
    }

    #[tokio::test]
    async fn xforward_peer_trust() {
        let session = Session::init(
            inet("127.0.0.1:4000"),
            &SmtpdConfig::default(),
            &TestResolver::default(),
        )
        .await
        .unwrap();
        assert!(session.is_xforward_peer(&SmtpdConfig::default()));
    }

    #[tokio::test]
    async fn message_reset() {
        let mut session = session().await;
        session.helo("client.example.com", true);
        session.xforward_apply(XforwardUpdate::Ident(Some("UP1".to_string())));
        let (stream, aborted) = TestStream::new("QID1");
        session.begin_message(None, "sender@example.com");
        session.attach_stream(stream);
        session.set_mail_params(Some("8BITMIME".to_string()), Some("+=".to_string()));
        session.add_recipient("one@example.com");
        session.add_recipient("two@example.com");
        session.set_message_size(1024);
        session.push_history("MAIL");
        session.set_access_denied("denied");
        session.set_reason("because");
        session.record_error(NotifyClass::PROTOCOL);
        session
            .policy_mut()
            .defer_if_reject("greylisted", NotifyClass::POLICY);
        session.policy_mut().discard("spamtrap");
        session.postpone(PendingAction::Hold("look at this".to_string()));
        session.set_stage(Stage::Data);

        session.reset(ResetScope::Message);

        assert_equal!(session.queue_id(), None);
        assert_equal!(session.sender(), None);
        assert_equal!(session.recipient(), None);
        assert_equal!(session.message_rcpt_count(), 0);
        assert_equal!(session.message_size(), None);
        assert_equal!(session.encoding(), None);
        assert_equal!(session.verp_delims(), None);
        assert!(session.history().is_empty());
        assert_equal!(session.access_denied(), None);
        assert_equal!(session.reason(), None);
        assert!(!session.policy().is_armed());
        assert!(session.pending().is_empty());
        assert!(aborted.load(Ordering::SeqCst));
        assert!(!session.has_stream());

        // connection state survives
        assert_equal!(session.rcpt_count(), 2);
        assert_equal!(session.error_count(), 1);
        assert_equal!(session.client_namaddr(), "mail.example.com[192.0.2.1]");
        assert_equal!(session.client_helo(), Some("client.example.com"));
        assert_equal!(session.client_protocol(), "ESMTP");
        assert_equal!(session.message_ident(), Some("UP1"));
        assert_equal!(session.stage(), Stage::Data);

        // and a second reset is harmless
        session.reset(ResetScope::Message);
        assert_equal!(session.rcpt_count(), 2);
    }

    #[tokio::test]
    async fn connection_reset() {
        let mut session = session().await;
        session.helo("client.example.com", false);
        session.xforward_apply(XforwardUpdate::Name("relay.example.net".to_string()));
        session.record_error(NotifyClass::PROTOCOL);
        session.record_junk();
        session.add_recipient("one@example.com");
        session.set_etrn_name("example.com");
        session.set_proxy_features(XforwardFeatures::NAME);
        session.submission_mode(&SmtpdConfig::default());

        session.reset(ResetScope::Connection);

        assert_equal!(session.client_namaddr(), UNKNOWN);
        assert_equal!(session.client_helo(), None);
        assert_equal!(session.client_protocol(), UNKNOWN);
        assert_equal!(session.xforward_flags(), XforwardFlags::empty());
        assert_equal!(session.error_count(), 0);
        assert_equal!(session.error_mask(), NotifyClass::empty());
        assert_equal!(session.junk_cmds(), 0);
        assert_equal!(session.rcpt_count(), 0);
        assert_equal!(session.etrn_name(), None);
        assert_equal!(session.proxy_features(), XforwardFeatures::empty());
        assert_equal!(session.stage(), Stage::Connect);
        assert_equal!(session.summary().submission_mode, None);

        session.reset(ResetScope::Connection);
        assert_equal!(session.error_count(), 0);
    }

    #[tokio::test]
    async fn error_count_never_decreases_within_connection() {
        let mut session = session().await;
        let mut last = session.error_count();
        for _ in 0..3 {
            session.record_error(NotifyClass::PROTOCOL);
            assert!(session.error_count() > last);
            last = session.error_count();
            session.reset(ResetScope::Message);
            assert_equal!(session.error_count(), last);
        }
        assert_equal!(last, 3);
    }

    #[tokio::test]
    async fn postmaster_notification() {
        let mut session = session().await;
        session.record_error(NotifyClass::PROTOCOL);
        assert!(!session.should_notify_postmaster());
        session.record_error(NotifyClass::SOFTWARE);
        assert!(session.should_notify_postmaster());
    }

    #[tokio::test]
    async fn greylisting_defers_until_message_reset() {
        let config = SmtpdConfig::default();
        let mut session = session().await;
        session
            .policy_mut()
            .defer_if_reject("Service unavailable; greylisted", NotifyClass::POLICY);

        let decision = session.evaluate(rejected(), &config);
        let reply = decision.reply().unwrap();
        assert_equal!(reply.code, 450);
        assert_equal!(
            reply.to_single_line(),
            "450 4.7.1 Service unavailable; greylisted"
        );
        assert!(session.error_mask().contains(NotifyClass::POLICY));

        session.reset(ResetScope::Message);
        assert_equal!(
            session.evaluate(rejected(), &config).reply().unwrap().code,
            554
        );
    }

    #[tokio::test]
    async fn defer_if_permit_uses_configured_code() {
        let config = SmtpdConfig {
            defer_code: 451,
            ..SmtpdConfig::default()
        };
        let mut session = session().await;
        session.policy_mut().defer_if_permit(
            PermitTriggers::CLIENT,
            "try again later",
            NotifyClass::POLICY,
        );
        let decision = session.evaluate(Verdict::Accept, &config);
        assert!(!decision.is_accepted());
        assert_equal!(decision.reply().unwrap().code, 451);
    }

    #[tokio::test]
    async fn pending_actions() {
        let mut session = session().await;
        session.postpone(PendingAction::Filter("smtp:[127.0.0.1]:10025".to_string()));
        session.postpone(PendingAction::Redirect("abuse@example.com".to_string()));
        let pending = session.take_pending();
        assert_equal!(pending.filter.as_deref(), Some("smtp:[127.0.0.1]:10025"));
        assert_equal!(pending.redirect.as_deref(), Some("abuse@example.com"));
        assert!(session.pending().is_empty());
    }

    #[tokio::test]
    async fn submission_mode_is_cached_until_connection_reset() {
        let mut session = Session::init(
            Transport::local(),
            &SmtpdConfig::default(),
            &TestResolver::default(),
        )
        .await
        .unwrap();
        session.set_process_identity(ProcessIdentity { uid: 1000 });

        let standalone = SmtpdConfig {
            owner_uid: 89,
            ..SmtpdConfig::default()
        };
        let daemon = SmtpdConfig {
            owner_uid: 1000,
            proxy_filter: Some("127.0.0.1:10025".to_string()),
            ..SmtpdConfig::default()
        };

        assert_equal!(
            session.submission_mode(&standalone),
            &SubmissionMode::Standalone
        );
        // A different configuration does not change an earlier decision
        assert_equal!(
            session.submission_mode(&daemon),
            &SubmissionMode::Standalone
        );
        session.reset(ResetScope::Message);
        assert_equal!(
            session.submission_mode(&daemon),
            &SubmissionMode::Standalone
        );

        session.reset(ResetScope::Connection);
        assert_equal!(
            session.submission_mode(&daemon),
            &SubmissionMode::Proxy {
                target: "127.0.0.1:10025".to_string()
            }
        );
    }

    #[tokio::test]
    async fn disconnect_reports_uncommitted_message() {
        let mut session = session().await;
        let (stream, aborted) = TestStream::new("QID1");
        session.begin_message(None, "sender@example.com");
        session.attach_stream(stream);
        session.set_stage(Stage::Data);

        assert_equal!(
            session.disconnect(),
            Some(AbandonedSubmission {
                queue_id: "QID1".to_string(),
                stage: Stage::Data,
            })
        );
        assert!(aborted.load(Ordering::SeqCst));
        assert_equal!(session.stage(), Stage::Connect);
        assert_equal!(session.disconnect(), None);
    }

    #[tokio::test]
    async fn committed_message_is_not_abandoned() {
        let mut session = session().await;
        let (stream, aborted) = TestStream::new("QID1");
        session.attach_stream(stream);
        let stream = session.take_stream().unwrap();
        assert_equal!(stream.queue_id(), "QID1");
        session.set_stage(Stage::EndOfMessage);
        session.reset(ResetScope::Message);
        assert_equal!(session.disconnect(), None);
        assert!(!aborted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn proxy_attributes() {
        let mut session = Session::init(
            inet("198.51.100.9:4000"),
            &SmtpdConfig::default(),
            &TestResolver::default().with_ptr_failure(ip("198.51.100.9")),
        )
        .await
        .unwrap();
        session.helo("client example", true);
        session.set_proxy_features(XforwardFeatures::from_ehlo_param(
            "NAME ADDR PROTO HELO IDENT",
        ));
        assert_equal!(
            session.proxy_xforward_attributes(),
            vec![
                "NAME=[TEMPUNAVAIL]".to_string(),
                "ADDR=198.51.100.9".to_string(),
                "PROTO=ESMTP".to_string(),
                "HELO=client+20example".to_string(),
                "IDENT=[UNAVAILABLE]".to_string(),
            ]
        );

        session.xforward_apply(XforwardUpdate::Addr("2001:db8::1".to_string()));
        session.set_proxy_features(XforwardFeatures::NAME | XforwardFeatures::ADDR);
        assert_equal!(
            session.proxy_xforward_attributes(),
            vec![
                "NAME=[UNAVAILABLE]".to_string(),
                "ADDR=IPV6:2001:db8::1".to_string(),
            ]
        );
    }

    #[test]
    fn lost_connection_stage_names() {
        assert_equal!(Stage::EndOfMessage.to_string(), "END-OF-MESSAGE");
        assert_equal!(Stage::Connect.to_string(), "CONNECT");
        assert_equal!(
            serde_json::to_string(&Stage::EndOfMessage).unwrap(),
            "\"END-OF-MESSAGE\""
        );
    }

    #[tokio::test]
    async fn session_is_send() {
        fn assert_send<T: Send>(_: &T) {}
        assert_send(&session().await);
    }
}
