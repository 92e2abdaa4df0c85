//! Session lifecycle states and their allowed transitions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a sync session is in its lifecycle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "message")]
pub enum SessionState {
    /// Not trying to sync. Sessions start and end here.
    Inactive,
    Connecting,
    Connected,
    /// Stopped by the application; resuming reconnects.
    Suspended,
    /// Stopped by a failure reported by the transport.
    Error(String),
}

/// The connection as an observer sees it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// A lifecycle request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    Connect,
    Connected,
    Suspend,
    Resume,
    Fail(String),
    Close,
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Connected => "mark connected",
            Self::Suspend => "suspend",
            Self::Resume => "resume",
            Self::Fail(_) => "fail",
            Self::Close => "close",
        }
    }
}

impl SessionState {
    /// The state reached by `transition`, or `None` if it is not allowed.
    ///
    /// `Fail` and `Close` are accepted from every state.
    pub fn apply(&self, transition: &Transition) -> Option<SessionState> {
        use SessionState::*;
        match (self, transition) {
            (Inactive | Error(_), Transition::Connect) => Some(Connecting),
            (Connecting, Transition::Connected) => Some(Connected),
            (Connecting | Connected, Transition::Suspend) => Some(Suspended),
            (Suspended, Transition::Resume) => Some(Connecting),
            (_, Transition::Fail(message)) => Some(Error(message.clone())),
            (_, Transition::Close) => Some(Inactive),
            _ => None,
        }
    }

    pub fn connection(&self) -> ConnectionState {
        match self {
            Self::Connecting => ConnectionState::Connecting,
            Self::Connected => ConnectionState::Connected,
            Self::Inactive | Self::Suspended | Self::Error(_) => ConnectionState::Disconnected,
        }
    }

    /// Returns `true` while the session is trying to sync.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inactive => f.write_str("inactive"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::Suspended => f.write_str("suspended"),
            Self::Error(message) => write!(f, "in error ({message})"),
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_cycle() {
        let mut state = SessionState::Inactive;
        for (transition, expected) in [
            (Transition::Connect, SessionState::Connecting),
            (Transition::Connected, SessionState::Connected),
            (Transition::Suspend, SessionState::Suspended),
            (Transition::Resume, SessionState::Connecting),
            (Transition::Connected, SessionState::Connected),
            (Transition::Close, SessionState::Inactive),
        ] {
            state = state.apply(&transition).unwrap();
            assert_eq!(state, expected);
        }
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        assert!(SessionState::Inactive.apply(&Transition::Connected).is_none());
        assert!(SessionState::Inactive.apply(&Transition::Resume).is_none());
        assert!(SessionState::Connected.apply(&Transition::Connect).is_none());
        assert!(SessionState::Suspended.apply(&Transition::Suspend).is_none());
    }

    #[test]
    fn errored_session_can_reconnect() {
        let state = SessionState::Connected
            .apply(&Transition::Fail("reset by peer".into()))
            .unwrap();
        assert_eq!(state.connection(), ConnectionState::Disconnected);
        assert_eq!(state.to_string(), "in error (reset by peer)");
        assert_eq!(
            state.apply(&Transition::Connect),
            Some(SessionState::Connecting)
        );
    }

    #[test]
    fn serde_tags_states() {
        let json = serde_json::to_string(&SessionState::Error("x".into())).unwrap();
        assert_eq!(json, r#"{"state":"error","message":"x"}"#);
        let back: SessionState = serde_json::from_str(r#"{"state":"suspended"}"#).unwrap();
        assert_eq!(back, SessionState::Suspended);
    }
}
