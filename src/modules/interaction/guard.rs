use crate::utils::truncate_message;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{mapref::one::RefMut, DashMap};
use futures::FutureExt;
use std::{
    fmt,
    panic::AssertUnwindSafe,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, error, warn};

/// Discord's limit on message content.
pub const MESSAGE_LIMIT: usize = 2000;
/// Time Discord allows for the initial response.
pub const ACK_DEADLINE: Duration = Duration::from_secs(3);
/// Lifetime of the interaction token, and with it of followups.
pub const FOLLOWUP_WINDOW: Duration = Duration::from_secs(15 * 60);

const GENERIC_ERROR: &str = "❌ An error occurred while processing your command.";

/// Errors Discord returns for interaction sends that the guard knows how to absorb.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("interaction has already been acknowledged")]
    AlreadyAcknowledged,
    #[error("unknown interaction")]
    UnknownInteraction,
    #[error("{0}")]
    Other(String),
}

/// The parts of an inbound interaction the guard needs.
#[async_trait]
pub trait InteractionSession: Send + Sync {
    fn id(&self) -> u64;
    fn created_at(&self) -> DateTime<Utc>;
    /// Whether the platform already holds an initial response for this session.
    fn is_acknowledged(&self) -> bool;
    fn is_expired(&self) -> bool {
        age(self.created_at()) >= FOLLOWUP_WINDOW
    }
    async fn defer(&self) -> Result<(), PlatformError>;
    async fn respond(&self, message: &str) -> Result<(), PlatformError>;
    async fn followup(&self, message: &str) -> Result<(), PlatformError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Fresh,
    Responded,
    Expired,
}

#[derive(Debug, Clone)]
pub struct InteractionState {
    pub session_id: u64,
    pub phase: Phase,
    /// Discord's timestamp, from the snowflake. Bounds the followup window.
    pub created_at: DateTime<Utc>,
    /// Local arrival time. Bounds the acknowledgement deadline, immune to clock skew.
    pub seen_at: Instant,
    pub responded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    Expired,
    AlreadyAcknowledged,
    UnknownInteraction,
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expired => write!(f, "interaction expired"),
            Self::AlreadyAcknowledged => write!(f, "already acknowledged"),
            Self::UnknownInteraction => write!(f, "unknown interaction"),
        }
    }
}

#[derive(Error, Debug)]
pub enum SendError {
    #[error("interaction ignored: {0}")]
    Ignored(IgnoreReason),
    #[error("interaction send failed: {0}")]
    Failed(String),
}

enum Claim {
    Primary,
    Followup,
    Expired,
}

fn age(created_at: DateTime<Utc>) -> Duration {
    (Utc::now() - created_at).to_std().unwrap_or_default()
}

/// Per-session response bookkeeping.
///
/// The primary response path is claimed at most once per session; later
/// sends go through followups. Races with Discord's own deadline come back
/// as [`SendError::Ignored`] instead of errors.
#[derive(Debug, Default)]
pub struct InteractionGuard {
    sessions: DashMap<u64, InteractionState>,
}

impl InteractionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn track<S: InteractionSession + ?Sized>(
        &self,
        session: &S,
    ) -> RefMut<'_, u64, InteractionState> {
        self.sessions
            .entry(session.id())
            .or_insert_with(|| InteractionState {
                session_id: session.id(),
                phase: Phase::Fresh,
                created_at: session.created_at(),
                seen_at: Instant::now(),
                responded_at: None,
            })
    }

    /// Records a new command invocation. Call as early as possible.
    pub fn begin<S: InteractionSession + ?Sized>(&self, session: &S) {
        self.track(session);
    }

    pub fn phase(&self, session_id: u64) -> Option<Phase> {
        self.sessions.get(&session_id).map(|s| s.phase)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn can_respond<S: InteractionSession + ?Sized>(&self, session: &S) -> bool {
        let state = self.track(session);
        state.phase == Phase::Fresh
            && !session.is_acknowledged()
            && state.seen_at.elapsed() < ACK_DEADLINE
    }

    fn claim<S: InteractionSession + ?Sized>(&self, session: &S) -> Claim {
        let mut state = self.track(session);

        match state.phase {
            Phase::Fresh if session.is_acknowledged() => {
                state.phase = Phase::Responded;
                state.responded_at = Some(Utc::now());
                Claim::Followup
            }
            Phase::Fresh if state.seen_at.elapsed() < ACK_DEADLINE => {
                state.phase = Phase::Responded;
                state.responded_at = Some(Utc::now());
                Claim::Primary
            }
            Phase::Fresh => {
                state.phase = Phase::Expired;
                Claim::Expired
            }
            Phase::Responded => Claim::Followup,
            Phase::Expired => Claim::Expired,
        }
    }

    fn expire(&self, session_id: u64) {
        if let Some(mut state) = self.sessions.get_mut(&session_id) {
            state.phase = Phase::Expired;
        }
    }

    /// Acknowledges the session without content. A no-op once responded.
    pub async fn safe_defer<S: InteractionSession + ?Sized>(
        &self,
        session: &S,
    ) -> Result<(), SendError> {
        match self.claim(session) {
            Claim::Primary => match session.defer().await {
                Ok(()) | Err(PlatformError::AlreadyAcknowledged) => Ok(()),
                Err(PlatformError::UnknownInteraction) => {
                    self.expire(session.id());
                    debug!("Interaction {} vanished before defer", session.id());
                    Err(SendError::Ignored(IgnoreReason::UnknownInteraction))
                }
                Err(PlatformError::Other(e)) => {
                    warn!("Failed to defer interaction {}: {}", session.id(), e);
                    Err(SendError::Failed(e))
                }
            },
            Claim::Followup => Ok(()),
            Claim::Expired => {
                warn!("Skipping defer on expired interaction {}", session.id());
                Err(SendError::Ignored(IgnoreReason::Expired))
            }
        }
    }

    pub async fn safe_respond<S: InteractionSession + ?Sized>(
        &self,
        session: &S,
        message: &str,
    ) -> Result<(), SendError> {
        let message = truncate_message(message, MESSAGE_LIMIT);

        match self.claim(session) {
            Claim::Primary => match session.respond(&message).await {
                Ok(()) => Ok(()),
                Err(PlatformError::AlreadyAcknowledged) => {
                    debug!(
                        "Interaction {} was already acknowledged, sending followup",
                        session.id()
                    );
                    self.followup(session, &message).await
                }
                Err(PlatformError::UnknownInteraction) => {
                    self.expire(session.id());
                    debug!("Interaction {} vanished before response", session.id());
                    Err(SendError::Ignored(IgnoreReason::UnknownInteraction))
                }
                Err(PlatformError::Other(e)) => {
                    warn!("HTTP error when responding to interaction {}: {}", session.id(), e);
                    Err(SendError::Failed(e))
                }
            },
            Claim::Followup => self.followup(session, &message).await,
            Claim::Expired => {
                warn!("Skipping response to expired interaction {}", session.id());
                Err(SendError::Ignored(IgnoreReason::Expired))
            }
        }
    }

    pub async fn safe_followup<S: InteractionSession + ?Sized>(
        &self,
        session: &S,
        message: &str,
    ) -> Result<(), SendError> {
        self.begin(session);
        let message = truncate_message(message, MESSAGE_LIMIT);
        self.followup(session, &message).await
    }

    async fn followup<S: InteractionSession + ?Sized>(
        &self,
        session: &S,
        message: &str,
    ) -> Result<(), SendError> {
        if self.phase(session.id()) == Some(Phase::Expired) || session.is_expired() {
            self.expire(session.id());
            warn!("Skipping followup to expired interaction {}", session.id());
            return Err(SendError::Ignored(IgnoreReason::Expired));
        }

        match session.followup(message).await {
            Ok(()) => Ok(()),
            Err(PlatformError::UnknownInteraction) => {
                self.expire(session.id());
                debug!("Interaction {} vanished before followup", session.id());
                Err(SendError::Ignored(IgnoreReason::UnknownInteraction))
            }
            Err(PlatformError::AlreadyAcknowledged) => {
                Err(SendError::Ignored(IgnoreReason::AlreadyAcknowledged))
            }
            Err(PlatformError::Other(e)) => {
                warn!("HTTP error when sending followup to interaction {}: {}", session.id(), e);
                Err(SendError::Failed(e))
            }
        }
    }

    /// Tells the user a command failed. Never fails or panics outward.
    pub async fn report_error<S: InteractionSession + ?Sized>(&self, session: &S, message: &str) {
        let first = AssertUnwindSafe(self.safe_respond(session, message))
            .catch_unwind()
            .await;

        match first {
            Ok(Ok(())) => return,
            Ok(Err(SendError::Ignored(reason))) => {
                debug!(
                    "Error report for interaction {} dropped: {}",
                    session.id(),
                    reason
                );
                return;
            }
            Ok(Err(SendError::Failed(e))) => {
                error!("Secondary error in error handler: {}", e);
            }
            Err(_) => error!("Error handler panicked for interaction {}", session.id()),
        }

        let fallback = AssertUnwindSafe(self.safe_followup(session, GENERIC_ERROR))
            .catch_unwind()
            .await;
        if !matches!(fallback, Ok(Ok(()))) {
            error!(
                "Failed to send any error response for interaction {}",
                session.id()
            );
        }
    }

    /// Drops sessions whose followup window has passed. Returns how many went.
    pub fn sweep(&self) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, state| age(state.created_at) < FOLLOWUP_WINDOW);
        before.saturating_sub(self.sessions.len())
    }
}
