use std::fmt;
use std::future::pending;
use std::time::Duration;

use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

/// Which source fired an [`AbortSignal`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AbortReason {
    /// The caller cancelled its token.
    Aborted,
    /// The per-attempt timeout elapsed.
    Timeout,
}

impl AbortReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Aborted => "AbortError",
            Self::Timeout => "TimeoutError",
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Cancellation for a single attempt: the caller's token combined with a
/// deadline derived from the configured timeout.
///
/// A signal is never reused across attempts; the retry loop derives a fresh one
/// so an elapsed deadline cannot leak into the next attempt.
#[derive(Clone, Debug, Default)]
pub struct AbortSignal {
    user: Option<CancellationToken>,
    deadline: Option<Instant>,
}

impl AbortSignal {
    /// A timeout too large to be represented as a deadline means no deadline.
    pub fn derive(user: Option<&CancellationToken>, timeout: Option<Duration>) -> Self {
        Self {
            user: user.cloned(),
            deadline: timeout
                .filter(|timeout| !timeout.is_zero())
                .and_then(|timeout| Instant::now().checked_add(timeout)),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The reason the signal has fired, if it has. A user abort wins over an
    /// elapsed deadline.
    pub fn reason(&self) -> Option<AbortReason> {
        if self.is_user_aborted() {
            return Some(AbortReason::Aborted);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(AbortReason::Timeout),
            _ => None,
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.reason().is_some()
    }

    pub fn is_user_aborted(&self) -> bool {
        self.user
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    /// Completes when either source fires. Never completes for a signal with
    /// no sources.
    pub async fn aborted(&self) -> AbortReason {
        let user = async {
            match &self.user {
                Some(token) => token.cancelled().await,
                None => pending().await,
            }
        };
        let timer = async {
            match self.deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => pending().await,
            }
        };
        tokio::select! {
            biased;
            () = user => AbortReason::Aborted,
            () = timer => AbortReason::Timeout,
        }
    }
}
