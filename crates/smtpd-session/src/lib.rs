//! Per-connection state for an SMTP server front-end.
//!
//! A [Session] is created when a connection is accepted and is passed
//! by `&mut` to every command handler until the connection ends. It
//! tracks what the client has told us, what access control has decided
//! for the current message, and which client identity access control
//! should see: normally the connected peer, but a trusted upstream may
//! override it with XFORWARD.
pub mod attr;
pub mod config;
pub mod error;
pub mod mode;
pub mod policy;
pub mod reply;
#[cfg(feature = "sasl")]
pub mod sasl;
pub mod session;
pub mod transport;
pub mod xforward;

pub use attr::{AttrCategory, Effective, UNKNOWN};
pub use config::SmtpdConfig;
pub use error::SessionError;
pub use mode::{SubmissionMode, SubmissionStream};
pub use policy::{Decision, DeferralPolicy, NotifyClass, PendingAction, PendingActions, Verdict};
pub use reply::{EnhancedStatusCode, Reply};
#[cfg(feature = "sasl")]
pub use sasl::{SaslContext, SaslError};
pub use session::{AbandonedSubmission, ResetScope, Session, SessionSummary, Stage};
pub use transport::{ProcessIdentity, Transport};
pub use xforward::{XforwardError, XforwardFeatures, XforwardFlags, XforwardUpdate};
