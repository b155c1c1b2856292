//! Connection status line shown above the conversation list.

use std::time::Duration;

use openagents_gateway_client::{ConnectionQuality, SupervisorPhase, SupervisorStatus};
use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BannerTone {
    Connected,
    Connecting,
    Retrying,
    Offline,
    /// The user must change something (token, pairing) before retrying helps.
    ActionRequired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionBanner {
    pub tone: BannerTone,
    pub headline: String,
    pub detail: Option<String>,
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_in: Option<Duration>,
    /// Show a "retry now" control.
    pub can_retry: bool,
}

impl ConnectionBanner {
    #[must_use]
    pub fn from_status(
        status: &SupervisorStatus,
        quality: ConnectionQuality,
        now: Instant,
    ) -> Self {
        let detail = status.last_error.as_ref().map(|error| error.user_message());
        let error_code = status.last_error.as_ref().map(|error| error.code().to_string());
        let needs_user = status
            .last_error
            .as_ref()
            .is_some_and(openagents_gateway_client::ConnectionFailure::needs_user_action);

        match status.phase {
            SupervisorPhase::Ready => Self {
                tone: BannerTone::Connected,
                headline: match quality {
                    ConnectionQuality::Poor => "Connected (slow connection)".to_string(),
                    _ => "Connected".to_string(),
                },
                detail: None,
                error_code: None,
                retry_in: None,
                can_retry: false,
            },
            SupervisorPhase::Attempting => Self {
                tone: BannerTone::Connecting,
                headline: if status.attempt_count == 0 {
                    "Connecting…".to_string()
                } else {
                    format!("Reconnecting (attempt {})…", status.attempt_count + 1)
                },
                detail,
                error_code,
                retry_in: None,
                can_retry: false,
            },
            SupervisorPhase::Backoff => {
                let retry_in = status
                    .retry_at
                    .map(|at| at.saturating_duration_since(now));
                Self {
                    tone: if needs_user {
                        BannerTone::ActionRequired
                    } else {
                        BannerTone::Retrying
                    },
                    headline: match retry_in {
                        Some(wait) => format!("Disconnected. Retrying in {}s", wait.as_secs()),
                        None => "Disconnected. Retrying soon".to_string(),
                    },
                    detail,
                    error_code,
                    retry_in,
                    can_retry: true,
                }
            }
            SupervisorPhase::Halted => Self {
                tone: if needs_user {
                    BannerTone::ActionRequired
                } else {
                    BannerTone::Offline
                },
                headline: "Reconnecting paused".to_string(),
                detail,
                error_code,
                retry_in: None,
                can_retry: true,
            },
            SupervisorPhase::Idle => Self {
                tone: BannerTone::Offline,
                headline: "Not connected".to_string(),
                detail,
                error_code,
                retry_in: None,
                can_retry: status.last_error.is_some(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openagents_gateway_client::{ConnectionFailure, HandshakeRejection};
    use openagents_gateway_proto::ErrorShape;

    fn status(phase: SupervisorPhase) -> SupervisorStatus {
        SupervisorStatus {
            phase,
            ..SupervisorStatus::default()
        }
    }

    #[test]
    fn backoff_shows_countdown_and_retry() {
        let now = Instant::now();
        let mut backoff = status(SupervisorPhase::Backoff);
        backoff.attempt_count = 2;
        backoff.retry_at = Some(now + Duration::from_secs(10));
        backoff.last_error = Some(ConnectionFailure::Transport {
            message: "refused".to_string(),
        });

        let banner = ConnectionBanner::from_status(&backoff, ConnectionQuality::Unknown, now);
        assert_eq!(banner.tone, BannerTone::Retrying);
        assert_eq!(banner.headline, "Disconnected. Retrying in 10s");
        assert_eq!(banner.retry_in, Some(Duration::from_secs(10)));
        assert_eq!(banner.error_code.as_deref(), Some("transport"));
        assert!(banner.can_retry);
        assert!(banner.detail.is_some_and(|detail| detail.contains("Cannot reach")));
    }

    #[test]
    fn rejected_token_asks_for_action() {
        let mut halted = status(SupervisorPhase::Backoff);
        halted.last_error = Some(ConnectionFailure::Rejected(HandshakeRejection::from(
            ErrorShape::new("UNAUTHORIZED", "bad token"),
        )));
        let banner = ConnectionBanner::from_status(&halted, ConnectionQuality::Unknown, Instant::now());
        assert_eq!(banner.tone, BannerTone::ActionRequired);
        assert_eq!(banner.error_code.as_deref(), Some("unauthorized"));
    }

    #[test]
    fn ready_banner_reflects_quality() {
        let ready = status(SupervisorPhase::Ready);
        let banner = ConnectionBanner::from_status(&ready, ConnectionQuality::Poor, Instant::now());
        assert_eq!(banner.tone, BannerTone::Connected);
        assert_eq!(banner.headline, "Connected (slow connection)");
        assert!(!banner.can_retry);
    }

    #[test]
    fn first_attempt_reads_as_connecting() {
        let banner = ConnectionBanner::from_status(
            &status(SupervisorPhase::Attempting),
            ConnectionQuality::Unknown,
            Instant::now(),
        );
        assert_eq!(banner.headline, "Connecting…");
    }
}
