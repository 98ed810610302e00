//! Overrides that change the disposition of an access-control verdict
//! for the rest of the current message, without changing how that
//! verdict is computed.
use crate::reply::{EnhancedStatusCode, Reply};
use serde::Serialize;

bitflags::bitflags! {
    /// Error notification classes. Used both to classify an event and
    /// to select which classes of event are reported to the postmaster.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct NotifyClass: u16 {
        const BOUNCE = 1 << 0;
        const DOUBLE_BOUNCE = 1 << 1;
        const DELAY = 1 << 2;
        const POLICY = 1 << 3;
        const PROTOCOL = 1 << 4;
        const RESOURCE = 1 << 5;
        const SOFTWARE = 1 << 6;
        const DATA = 1 << 7;
    }
}

impl NotifyClass {
    /// Parse a single class name as used in configuration,
    /// eg: `policy` or `2bounce`
    pub fn parse_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "bounce" => Some(Self::BOUNCE),
            "2bounce" | "double_bounce" => Some(Self::DOUBLE_BOUNCE),
            "delay" => Some(Self::DELAY),
            "policy" => Some(Self::POLICY),
            "protocol" => Some(Self::PROTOCOL),
            "resource" => Some(Self::RESOURCE),
            "software" => Some(Self::SOFTWARE),
            "data" => Some(Self::DATA),
            _ => None,
        }
    }
}

/// The state of one deferral override category
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DeferDecision {
    #[default]
    Inactive,
    Active {
        reason: String,
        class: NotifyClass,
    },
}

impl DeferDecision {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    /// Arm the override. Within a message the first reason wins;
    /// returns false if it was already armed.
    fn arm(&mut self, reason: &str, class: NotifyClass) -> bool {
        if self.is_active() {
            return false;
        }
        *self = Self::Active {
            reason: reason.to_string(),
            class,
        };
        true
    }
}

bitflags::bitflags! {
    /// Which restriction stages asked for an otherwise permitted
    /// message to be deferred
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct PermitTriggers: u8 {
        const CLIENT = 1 << 0;
        const HELO = 1 << 1;
        const SENDER = 1 << 2;
    }
}

/// The base verdict produced by access-control evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject(Reply),
}

/// The verdict after the armed overrides have been applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Accept,
    /// A reject was downgraded to an accept; `suppressed` is the
    /// reply that would otherwise have been sent
    Warn { suppressed: Reply },
    /// The verdict was converted into a temporary failure
    Defer { reply: Reply, class: NotifyClass },
    Reject { reply: Reply },
    /// Accept the message and then silently drop it
    Discard { reason: String },
}

impl Decision {
    /// Returns true if the client should see a positive reply
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accept | Self::Warn { .. } | Self::Discard { .. })
    }

    /// The reply to send in place of the positive one, if any
    pub fn reply(&self) -> Option<&Reply> {
        match self {
            Self::Defer { reply, .. } | Self::Reject { reply } => Some(reply),
            Self::Accept | Self::Warn { .. } | Self::Discard { .. } => None,
        }
    }
}

/// The overrides armed for the current message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeferralPolicy {
    warn_if_reject: bool,
    defer_if_reject: DeferDecision,
    defer_if_permit: DeferDecision,
    permit_triggers: PermitTriggers,
    discard: Option<String>,
}

impl DeferralPolicy {
    /// Turn rejects into logged warnings
    pub fn warn_if_reject(&mut self) {
        self.warn_if_reject = true;
    }

    /// Turn permanent rejects into temporary failures
    pub fn defer_if_reject(&mut self, reason: &str, class: NotifyClass) {
        if !self.defer_if_reject.arm(reason, class) {
            tracing::trace!("defer_if_reject already armed; ignoring {reason:?}");
        }
    }

    /// Turn an eventual permit into a temporary failure.
    /// `trigger` records which stage asked for it.
    pub fn defer_if_permit(&mut self, trigger: PermitTriggers, reason: &str, class: NotifyClass) {
        self.permit_triggers |= trigger;
        if !self.defer_if_permit.arm(reason, class) {
            tracing::trace!("defer_if_permit already armed; ignoring {reason:?}");
        }
    }

    /// Accept, then drop, the current message regardless of any
    /// other override
    pub fn discard(&mut self, reason: &str) {
        if self.discard.is_none() {
            self.discard.replace(reason.to_string());
        }
    }

    pub fn is_warn_if_reject(&self) -> bool {
        self.warn_if_reject
    }

    pub fn defer_if_reject_state(&self) -> &DeferDecision {
        &self.defer_if_reject
    }

    pub fn defer_if_permit_state(&self) -> &DeferDecision {
        &self.defer_if_permit
    }

    pub fn permit_triggers(&self) -> PermitTriggers {
        self.permit_triggers
    }

    pub fn is_discard(&self) -> bool {
        self.discard.is_some()
    }

    /// Returns true if any override is armed
    pub fn is_armed(&self) -> bool {
        self.warn_if_reject
            || self.defer_if_reject.is_active()
            || self.defer_if_permit.is_active()
            || self.discard.is_some()
    }

    /// Disarm every override
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Apply the armed overrides to `verdict`.
    /// `defer_code` is the SMTP code used for substituted
    /// temporary failures.
    pub fn evaluate(&self, verdict: Verdict, defer_code: u16) -> Decision {
        if let Some(reason) = &self.discard {
            return Decision::Discard {
                reason: reason.clone(),
            };
        }

        match verdict {
            Verdict::Reject(reply) => {
                if self.warn_if_reject {
                    tracing::info!("reject_warning: {reply}");
                    return Decision::Warn { suppressed: reply };
                }
                match &self.defer_if_reject {
                    DeferDecision::Active { reason, class } if reply.is_permanent() => {
                        let enhanced_code = match reply.enhanced_code {
                            Some(enh) if enh.class == 5 => EnhancedStatusCode { class: 4, ..enh },
                            _ => EnhancedStatusCode {
                                class: 4,
                                subject: 7,
                                detail: 1,
                            },
                        };
                        tracing::debug!("defer_if_reject: {reply} -> {defer_code} {reason}");
                        Decision::Defer {
                            reply: Reply::new(defer_code, Some(enhanced_code), reason.as_str()),
                            class: *class,
                        }
                    }
                    _ => Decision::Reject { reply },
                }
            }
            Verdict::Accept => match &self.defer_if_permit {
                DeferDecision::Active { reason, class } => {
                    tracing::debug!(
                        "defer_if_permit triggered by {:?}: {reason}",
                        self.permit_triggers
                    );
                    Decision::Defer {
                        reply: Reply::new(
                            defer_code,
                            Some(EnhancedStatusCode {
                                class: 4,
                                subject: 7,
                                detail: 1,
                            }),
                            reason.as_str(),
                        ),
                        class: *class,
                    }
                }
                DeferDecision::Inactive => Decision::Accept,
            },
        }
    }
}

/// An action that policy decided on before the message content was
/// received, but which can only be carried out at end of message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingAction {
    /// Route the message through this content filter
    Filter(String),
    /// Deliver the message to this address instead
    Redirect(String),
    /// Place the message on hold
    Hold(String),
    /// Accept the message and drop it
    Discard(String),
}

/// Actions postponed until end of message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PendingActions {
    pub filter: Option<String>,
    pub redirect: Option<String>,
    pub hold: Option<String>,
    pub discard: Option<String>,
}

impl PendingActions {
    /// Stage `action`. A later filter or redirect replaces an earlier
    /// one; hold and discard keep their first reason.
    pub fn push(&mut self, action: PendingAction) {
        match action {
            PendingAction::Filter(filter) => {
                self.filter.replace(filter);
            }
            PendingAction::Redirect(addr) => {
                self.redirect.replace(addr);
            }
            PendingAction::Hold(reason) => {
                self.hold.get_or_insert(reason);
            }
            PendingAction::Discard(reason) => {
                self.discard.get_or_insert(reason);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.filter.is_none()
            && self.redirect.is_none()
            && self.hold.is_none()
            && self.discard.is_none()
    }
}
