//! Choosing how an accepted message is handed to the queue.
use crate::config::SmtpdConfig;
use crate::transport::{ProcessIdentity, Transport};
use serde::Serialize;

/// How the session submits mail
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SubmissionMode {
    /// Invoked by hand on a local stream by someone other than the
    /// mail system owner. Mail is written straight to a queue file;
    /// the cleanup service is not used.
    Standalone,
    /// Normal daemon operation via the cleanup service
    Cleanup,
    /// Daemon operation with mail passed through a before-queue
    /// content filter listening at `target`
    Proxy { target: String },
}

impl SubmissionMode {
    pub fn select(transport: &Transport, process: ProcessIdentity, config: &SmtpdConfig) -> Self {
        let mode = if transport.is_local() && process.uid != config.owner_uid {
            Self::Standalone
        } else if let Some(target) = config.proxy_target() {
            Self::Proxy {
                target: target.to_string(),
            }
        } else {
            Self::Cleanup
        };
        tracing::debug!(
            "submission mode {mode:?} for peer {} uid {}",
            transport.peer,
            process.uid
        );
        mode
    }

    pub fn is_standalone(&self) -> bool {
        matches!(self, Self::Standalone)
    }

    /// Returns true if handlers may talk to the cleanup service.
    /// A proxy filter stands in for cleanup, so proxy mode does not.
    pub fn uses_cleanup(&self) -> bool {
        matches!(self, Self::Cleanup)
    }

    pub fn uses_proxy(&self) -> bool {
        matches!(self, Self::Proxy { .. })
    }
}

/// A message submission in progress, owned by the session
/// until the end-of-message handler takes it to commit.
pub trait SubmissionStream: Send + std::fmt::Debug {
    /// The queue id allocated to the message
    fn queue_id(&self) -> &str;

    /// Abandon the submission, discarding anything written so far
    fn abort(self: Box<Self>);
}
