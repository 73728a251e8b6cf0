//! Transport layer state machine (RFC 4253).
//!
//! Tracks one session's progress from the banner exchange to the
//! connection service, and back through key exchange on rekey:
//!
//! ```text
//! Banner -> Kex -> NewKeys -> ServiceRequest -> Userauth -> Connection
//!             ^                                                 |
//!             +----------------- rekey ------------------------+
//! ```
//!
//! Rekeying triggers when the byte count since the last exchange passes
//! the configured limit, when the interval elapses, or when the peer
//! sends KEXINIT. While a rekey is in flight, channel data keeps flowing
//! but other outbound packets are queued until NEWKEYS; the queue is
//! drained by the session once the new keys are installed.
//!
//! Failure model: version mismatch, negotiation failure and MAC failure
//! are fatal (disconnect with reason code); authentication failures stay
//! inside the userauth service.

use crate::ssh::kex::KexInit;
use crate::ssh::version::Version;
use keel_platform::{KeelError, KeelResult};
use std::time::{Duration, Instant};

/// Transport state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Identification banner exchange.
    Banner,
    /// KEXINIT exchanged, key exchange running.
    Kex,
    /// Waiting for / sending NEWKEYS.
    NewKeys,
    /// Encrypted; waiting for SERVICE_REQUEST.
    ServiceRequest,
    /// ssh-userauth service active.
    Userauth,
    /// ssh-connection service active.
    Connection,
    /// Tear-down in progress.
    Closing,
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Our identification banner.
    pub version: Version,
    /// Our algorithm preferences.
    pub kex_init: KexInit,
    /// Rekey after this many bytes (default 1 GiB).
    pub rekey_bytes_limit: u64,
    /// Rekey after this long (default 1 hour).
    pub rekey_time_limit: Duration,
    /// Client (true) or server (false).
    pub is_client: bool,
}

impl TransportConfig {
    /// Creates a configuration for one side of the connection.
    pub fn new(is_client: bool) -> Self {
        Self {
            version: Version::default_keel(),
            kex_init: KexInit::new_default(),
            rekey_bytes_limit: 1024 * 1024 * 1024,
            rekey_time_limit: Duration::from_secs(3600),
            is_client,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Transport state machine for one session.
#[derive(Debug)]
pub struct TransportState {
    state: State,
    config: TransportConfig,
    peer_version: Option<Version>,
    peer_kex_init: Option<KexInit>,
    /// Set after the first NEWKEYS; distinguishes initial KEX from rekey.
    initial_kex_done: bool,
    /// The state to return to when a rekey completes.
    resume_state: State,
    rekey_in_progress: bool,
    last_kex_time: Option<Instant>,
}

impl TransportState {
    /// Creates the machine in the Banner state.
    pub fn new(config: TransportConfig) -> Self {
        Self {
            state: State::Banner,
            config,
            peer_version: None,
            peer_kex_init: None,
            initial_kex_done: false,
            resume_state: State::ServiceRequest,
            rekey_in_progress: false,
            last_kex_time: None,
        }
    }

    /// Current state.
    pub fn current(&self) -> State {
        self.state
    }

    /// Configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Peer banner, once received.
    pub fn peer_version(&self) -> Option<&Version> {
        self.peer_version.as_ref()
    }

    /// Peer KEXINIT, once received.
    pub fn peer_kex_init(&self) -> Option<&KexInit> {
        self.peer_kex_init.as_ref()
    }

    /// Records the peer banner.
    pub fn set_peer_version(&mut self, version: Version) {
        self.peer_version = Some(version);
    }

    /// Records the peer KEXINIT.
    pub fn set_peer_kex_init(&mut self, kex_init: KexInit) {
        self.peer_kex_init = Some(kex_init);
    }

    /// Whether the first key exchange has completed.
    pub fn initial_kex_done(&self) -> bool {
        self.initial_kex_done
    }

    /// Whether a rekey is currently in flight (non-channel outbound
    /// packets must queue).
    pub fn rekey_in_progress(&self) -> bool {
        self.rekey_in_progress
    }

    /// Validates and performs a state transition.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::Protocol`] for transitions the protocol does
    /// not allow (e.g. jumping from Banner to Connection).
    pub fn transition(&mut self, next: State) -> KeelResult<()> {
        let valid = match (self.state, next) {
            (State::Banner, State::Kex) => true,
            (State::Kex, State::NewKeys) => true,
            (State::NewKeys, State::ServiceRequest) => !self.initial_kex_done,
            // Rekey completion resumes where the session was.
            (State::NewKeys, State::Userauth) => self.initial_kex_done,
            (State::NewKeys, State::Connection) => self.initial_kex_done,
            (State::ServiceRequest, State::Userauth) => true,
            (State::Userauth, State::Connection) => true,
            // Peer- or limit-triggered rekey.
            (State::Userauth, State::Kex) => self.initial_kex_done,
            (State::Connection, State::Kex) => true,
            (_, State::Closing) => true,
            (a, b) if a == b => true,
            _ => false,
        };

        if !valid {
            return Err(KeelError::Protocol(format!(
                "Invalid state transition: {:?} -> {:?}",
                self.state, next
            )));
        }

        match (self.state, next) {
            (State::Userauth, State::Kex) | (State::Connection, State::Kex) => {
                self.resume_state = self.state;
                self.rekey_in_progress = true;
            }
            (State::NewKeys, _) => {
                self.initial_kex_done = true;
                self.rekey_in_progress = false;
                self.last_kex_time = Some(Instant::now());
            }
            _ => {}
        }

        self.state = next;
        Ok(())
    }

    /// The state a completed rekey resumes into.
    pub fn resume_state(&self) -> State {
        self.resume_state
    }

    /// Whether a rekey should be initiated now.
    ///
    /// # Arguments
    ///
    /// * `bytes_since_kex` - outbound bytes sealed since the last key
    ///   installation
    pub fn needs_rekey(&self, bytes_since_kex: u64) -> bool {
        if self.state != State::Connection || self.rekey_in_progress {
            return false;
        }
        if bytes_since_kex >= self.config.rekey_bytes_limit {
            return true;
        }
        match self.last_kex_time {
            Some(at) => at.elapsed() >= self.config.rekey_time_limit,
            None => false,
        }
    }

    /// Whether `service` may be requested in the current state.
    ///
    /// Only `ssh-userauth` is accepted before authentication;
    /// `ssh-connection` never arrives as a SERVICE_REQUEST (it is entered
    /// through USERAUTH_SUCCESS) but is permitted once authenticated.
    pub fn service_permitted(&self, service: &str) -> bool {
        match service {
            "ssh-userauth" => self.state == State::ServiceRequest,
            "ssh-connection" => self.state == State::Connection,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> TransportState {
        TransportState::new(TransportConfig::new(false))
    }

    fn run_to_connection(state: &mut TransportState) {
        state.transition(State::Kex).unwrap();
        state.transition(State::NewKeys).unwrap();
        state.transition(State::ServiceRequest).unwrap();
        state.transition(State::Userauth).unwrap();
        state.transition(State::Connection).unwrap();
    }

    #[test]
    fn test_normal_progression() {
        let mut state = machine();
        assert_eq!(state.current(), State::Banner);
        run_to_connection(&mut state);
        assert_eq!(state.current(), State::Connection);
        assert!(state.initial_kex_done());
    }

    #[test]
    fn test_invalid_transitions() {
        let mut state = machine();
        assert!(state.transition(State::Connection).is_err());
        assert!(state.transition(State::Userauth).is_err());

        state.transition(State::Kex).unwrap();
        // NewKeys cannot resume into Connection before the first KEX.
        state.transition(State::NewKeys).unwrap();
        assert!(state.transition(State::Connection).is_err());
    }

    #[test]
    fn test_rekey_cycle() {
        let mut state = machine();
        run_to_connection(&mut state);

        state.transition(State::Kex).unwrap();
        assert!(state.rekey_in_progress());
        assert_eq!(state.resume_state(), State::Connection);

        state.transition(State::NewKeys).unwrap();
        state.transition(State::Connection).unwrap();
        assert!(!state.rekey_in_progress());
        assert_eq!(state.current(), State::Connection);
    }

    #[test]
    fn test_closing_from_anywhere() {
        let mut state = machine();
        state.transition(State::Closing).unwrap();

        let mut state = machine();
        run_to_connection(&mut state);
        state.transition(State::Closing).unwrap();
        assert_eq!(state.current(), State::Closing);
    }

    #[test]
    fn test_needs_rekey_bytes() {
        let mut state = machine();
        assert!(!state.needs_rekey(u64::MAX));

        run_to_connection(&mut state);
        assert!(!state.needs_rekey(1024));
        assert!(state.needs_rekey(state.config().rekey_bytes_limit));
    }

    #[test]
    fn test_needs_rekey_time() {
        let mut config = TransportConfig::new(false);
        config.rekey_time_limit = Duration::from_millis(0);
        let mut state = TransportState::new(config);
        run_to_connection(&mut state);
        assert!(state.needs_rekey(0));
    }

    #[test]
    fn test_no_rekey_during_rekey() {
        let mut state = machine();
        run_to_connection(&mut state);
        state.transition(State::Kex).unwrap();
        assert!(!state.needs_rekey(u64::MAX));
    }

    #[test]
    fn test_service_gating() {
        let mut state = machine();
        assert!(!state.service_permitted("ssh-userauth"));

        state.transition(State::Kex).unwrap();
        state.transition(State::NewKeys).unwrap();
        state.transition(State::ServiceRequest).unwrap();
        assert!(state.service_permitted("ssh-userauth"));
        assert!(!state.service_permitted("ssh-connection"));
        assert!(!state.service_permitted("sftp"));

        state.transition(State::Userauth).unwrap();
        state.transition(State::Connection).unwrap();
        assert!(state.service_permitted("ssh-connection"));
        assert!(!state.service_permitted("ssh-userauth"));
    }
}
