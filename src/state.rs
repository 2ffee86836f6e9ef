//! Session state flags and derived masks.

use bitflags::bitflags;

bitflags! {
    /// State of an exchange session.
    ///
    /// Several flags can be active at once; a serving session that has
    /// accepted a peer is `SERVING | CONNECTED`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SessionState: u32 {
        /// Waiting for an incoming connection.
        const WAITING      = 0x0000_0001;
        /// A peer stream is attached.
        const CONNECTED    = 0x0000_0002;
        /// No peer stream; connecting is possible.
        const DISCONNECTED = 0x0000_0004;
        /// The session has been closed.
        const CLOSED       = 0x0000_0008;
        /// The receive loop is running.
        const SERVING      = 0x0000_0010;
        /// A connect attempt missed its deadline.
        const TIMEOUT      = 0x8000_0000;
        /// The session failed.
        const ERROR        = 0x4000_0000;
    }
}

impl SessionState {
    /// Nothing is known about the session.
    pub const UNKNOWN: SessionState = SessionState::empty();

    /// The listener could not start: the stream is disconnected and the
    /// session does not own a listening socket.
    pub const ERROR_DISCONNECTED: SessionState =
        SessionState::ERROR.union(SessionState::DISCONNECTED);

    /// Listening or serving.
    pub const LISTEN_MASK: SessionState = SessionState::WAITING.union(SessionState::SERVING);

    /// Any error condition.
    pub const ERROR_MASK: SessionState = SessionState::TIMEOUT.union(SessionState::ERROR);

    /// True when the session is listening for, or serving, a peer.
    pub fn is_listening(self) -> bool {
        self.intersects(Self::LISTEN_MASK)
    }

    /// True when the state carries an error condition.
    pub fn is_error(self) -> bool {
        self.intersects(Self::ERROR_MASK)
    }

    /// True when a peer stream is attached.
    pub fn is_connected(self) -> bool {
        self.contains(Self::CONNECTED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masks() {
        assert!(SessionState::WAITING.is_listening());
        assert!(SessionState::SERVING.is_listening());
        assert!((SessionState::SERVING | SessionState::CONNECTED).is_listening());
        assert!(!SessionState::CONNECTED.is_listening());
        assert!(!SessionState::DISCONNECTED.is_listening());

        assert!(SessionState::TIMEOUT.is_error());
        assert!(SessionState::ERROR.is_error());
        assert!(SessionState::ERROR_DISCONNECTED.is_error());
        assert!(!SessionState::CLOSED.is_error());
        assert!(!SessionState::UNKNOWN.is_error());
    }

    #[test]
    fn test_flag_values() {
        assert_eq!(SessionState::WAITING.bits(), 1);
        assert_eq!(SessionState::CONNECTED.bits(), 2);
        assert_eq!(SessionState::DISCONNECTED.bits(), 4);
        assert_eq!(SessionState::CLOSED.bits(), 8);
        assert_eq!(SessionState::SERVING.bits(), 16);
        assert_eq!(SessionState::TIMEOUT.bits(), 0x8000_0000);
        assert_eq!(SessionState::ERROR.bits(), 0x4000_0000);
        assert_eq!(SessionState::UNKNOWN.bits(), 0);
    }
}
