//! SSH user authentication (RFC 4252, RFC 4256).
//!
//! Wire messages plus the server-side authentication state machine. On
//! each SSH_MSG_USERAUTH_REQUEST the service either:
//!
//! - succeeds (switch services),
//! - fails with the list of methods that may continue and a
//!   partial-success flag, or
//! - continues the current method (PK_OK for a public-key probe,
//!   INFO_REQUEST for keyboard-interactive).
//!
//! Methods are pluggable through [`PasswordAuthenticator`],
//! [`PublickeyAuthenticator`] and [`InteractiveChallenger`]; a session
//! exceeding its attempt budget is disconnected.
//!
//! # Security
//!
//! - Password comparison helpers are constant-time
//! - Passwords are zeroized on drop
//! - Public-key signatures are verified over the exact RFC 4252 Section 7
//!   blob, bound to the session id

use crate::ssh::buffer::Buffer;
use crate::ssh::hostkey::verify_signature;
use crate::ssh::message::{DisconnectReason, MessageType};
use keel_platform::{KeelError, KeelResult};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use zeroize::Zeroize;

/// Default per-session authentication attempt budget.
pub const DEFAULT_MAX_AUTH_ATTEMPTS: u32 = 20;

/// SSH authentication method carried by a USERAUTH_REQUEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// No authentication; used to probe available methods.
    None,
    /// Password authentication.
    Password(String),
    /// Public key authentication.
    PublicKey {
        /// Algorithm name (e.g., "ssh-ed25519", "rsa-sha2-256")
        algorithm: String,
        /// Public key blob
        public_key: Vec<u8>,
        /// Signature (present in the sign phase, absent in the probe)
        signature: Option<Vec<u8>>,
    },
    /// Keyboard-interactive authentication (RFC 4256).
    KeyboardInteractive {
        /// Language tag (deprecated, usually empty)
        language: String,
        /// Comma-separated submethod hints
        submethods: String,
    },
}

impl AuthMethod {
    /// Returns the method name.
    pub fn name(&self) -> &str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password(_) => "password",
            AuthMethod::PublicKey { .. } => "publickey",
            AuthMethod::KeyboardInteractive { .. } => "keyboard-interactive",
        }
    }
}

impl Drop for AuthMethod {
    fn drop(&mut self) {
        if let AuthMethod::Password(ref mut password) = self {
            password.zeroize();
        }
    }
}

/// SSH_MSG_USERAUTH_REQUEST message (RFC 4252 Section 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    user_name: String,
    service_name: String,
    method: AuthMethod,
}

impl AuthRequest {
    /// Creates a new authentication request.
    pub fn new(user_name: &str, service_name: &str, method: AuthMethod) -> Self {
        Self {
            user_name: user_name.to_string(),
            service_name: service_name.to_string(),
            method,
        }
    }

    /// Returns the user name.
    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    /// Returns the service name.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Returns the authentication method.
    pub fn method(&self) -> &AuthMethod {
        &self.method
    }

    /// Serializes to bytes.
    ///
    /// Format (RFC 4252 Section 5):
    /// ```text
    /// byte      SSH_MSG_USERAUTH_REQUEST (50)
    /// string    user name
    /// string    service name
    /// string    method name
    /// ....      method specific fields
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Buffer::new();
        buf.put_u8(MessageType::UserauthRequest as u8);
        buf.put_str(&self.user_name);
        buf.put_str(&self.service_name);
        buf.put_str(self.method.name());

        match &self.method {
            AuthMethod::None => {}
            AuthMethod::Password(password) => {
                // boolean FALSE (not changing password)
                buf.put_bool(false);
                buf.put_str(password);
            }
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature,
            } => {
                buf.put_bool(signature.is_some());
                buf.put_str(algorithm);
                buf.put_string(public_key);
                if let Some(sig) = signature {
                    buf.put_string(sig);
                }
            }
            AuthMethod::KeyboardInteractive {
                language,
                submethods,
            } => {
                buf.put_str(language);
                buf.put_str(submethods);
            }
        }

        buf.into_bytes()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut buf = Buffer::from(data);
        let msg_type = buf.get_u8()?;
        if msg_type != MessageType::UserauthRequest as u8 {
            return Err(KeelError::Protocol(format!(
                "Invalid message type: expected 50 (SSH_MSG_USERAUTH_REQUEST), got {}",
                msg_type
            )));
        }

        let user_name = buf.get_string_utf8()?;
        let service_name = buf.get_string_utf8()?;
        let method_name = buf.get_string_utf8()?;

        let method = match method_name.as_str() {
            "none" => AuthMethod::None,
            "password" => {
                let _changing = buf.get_bool()?;
                AuthMethod::Password(buf.get_string_utf8()?)
            }
            "publickey" => {
                let has_signature = buf.get_bool()?;
                let algorithm = buf.get_string_utf8()?;
                let public_key = buf.get_string()?;
                let signature = if has_signature {
                    Some(buf.get_string()?)
                } else {
                    None
                };
                AuthMethod::PublicKey {
                    algorithm,
                    public_key,
                    signature,
                }
            }
            "keyboard-interactive" => AuthMethod::KeyboardInteractive {
                language: buf.get_string_utf8()?,
                submethods: buf.get_string_utf8()?,
            },
            _ => {
                return Err(KeelError::Auth(format!(
                    "Unsupported authentication method: '{}'",
                    method_name
                )))
            }
        };

        Ok(Self {
            user_name,
            service_name,
            method,
        })
    }
}

/// SSH_MSG_USERAUTH_FAILURE message (RFC 4252 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    methods_can_continue: Vec<String>,
    partial_success: bool,
}

impl AuthFailure {
    /// Creates a new authentication failure message.
    pub fn new(methods: Vec<String>, partial_success: bool) -> Self {
        Self {
            methods_can_continue: methods,
            partial_success,
        }
    }

    /// Returns the methods that can continue.
    pub fn methods_can_continue(&self) -> &[String] {
        &self.methods_can_continue
    }

    /// Returns whether partial success was achieved.
    pub fn partial_success(&self) -> bool {
        self.partial_success
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Buffer::new();
        buf.put_u8(MessageType::UserauthFailure as u8);
        buf.put_name_list(&self.methods_can_continue);
        buf.put_bool(self.partial_success);
        buf.into_bytes()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut buf = Buffer::from(data);
        let msg_type = buf.get_u8()?;
        if msg_type != MessageType::UserauthFailure as u8 {
            return Err(KeelError::Protocol(format!(
                "Invalid message type: expected 51 (SSH_MSG_USERAUTH_FAILURE), got {}",
                msg_type
            )));
        }
        Ok(Self {
            methods_can_continue: buf.get_name_list()?,
            partial_success: buf.get_bool()?,
        })
    }
}

/// SSH_MSG_USERAUTH_SUCCESS message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AuthSuccess;

impl AuthSuccess {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![MessageType::UserauthSuccess as u8]
    }
}

/// SSH_MSG_USERAUTH_BANNER message (RFC 4252 Section 5.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthBanner {
    /// Banner text shown to the user before authentication.
    pub message: String,
    /// Language tag.
    pub language: String,
}

impl AuthBanner {
    /// Creates a banner.
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
            language: String::new(),
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Buffer::new();
        buf.put_u8(MessageType::UserauthBanner as u8);
        buf.put_str(&self.message);
        buf.put_str(&self.language);
        buf.into_bytes()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut buf = Buffer::from(data);
        let msg_type = buf.get_u8()?;
        if msg_type != MessageType::UserauthBanner as u8 {
            return Err(KeelError::Protocol(
                "Expected SSH_MSG_USERAUTH_BANNER".to_string(),
            ));
        }
        Ok(Self {
            message: buf.get_string_utf8()?,
            language: buf.get_string_utf8()?,
        })
    }
}

/// SSH_MSG_USERAUTH_PK_OK message (RFC 4252 Section 7).
///
/// Answers a public-key probe: the server would accept this key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPkOk {
    algorithm: String,
    public_key: Vec<u8>,
}

impl AuthPkOk {
    /// Creates a PK_OK echoing the probe's algorithm and key blob.
    pub fn new(algorithm: String, public_key: Vec<u8>) -> Self {
        Self {
            algorithm,
            public_key,
        }
    }

    /// Returns the algorithm name.
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Returns the public key blob.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Buffer::new();
        buf.put_u8(MessageType::UserauthPkOk as u8);
        buf.put_str(&self.algorithm);
        buf.put_string(&self.public_key);
        buf.into_bytes()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut buf = Buffer::from(data);
        let msg_type = buf.get_u8()?;
        if msg_type != MessageType::UserauthPkOk as u8 {
            return Err(KeelError::Protocol(
                "Expected SSH_MSG_USERAUTH_PK_OK".to_string(),
            ));
        }
        Ok(Self {
            algorithm: buf.get_string_utf8()?,
            public_key: buf.get_string()?,
        })
    }
}

/// One prompt within a keyboard-interactive challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InteractivePrompt {
    /// Prompt text.
    pub prompt: String,
    /// Whether the response may be echoed.
    pub echo: bool,
}

/// A keyboard-interactive challenge (SSH_MSG_USERAUTH_INFO_REQUEST,
/// RFC 4256 Section 3.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InteractiveChallenge {
    /// Challenge name.
    pub name: String,
    /// Instruction text.
    pub instruction: String,
    /// Prompts, in order.
    pub prompts: Vec<InteractivePrompt>,
}

impl InteractiveChallenge {
    /// Serializes to bytes (message 60 within keyboard-interactive).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Buffer::new();
        buf.put_u8(MessageType::UserauthPkOk as u8); // 60 = INFO_REQUEST here
        buf.put_str(&self.name);
        buf.put_str(&self.instruction);
        buf.put_str(""); // language tag
        buf.put_u32(self.prompts.len() as u32);
        for prompt in &self.prompts {
            buf.put_str(&prompt.prompt);
            buf.put_bool(prompt.echo);
        }
        buf.into_bytes()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut buf = Buffer::from(data);
        let msg_type = buf.get_u8()?;
        if msg_type != MessageType::UserauthPkOk as u8 {
            return Err(KeelError::Protocol(
                "Expected SSH_MSG_USERAUTH_INFO_REQUEST".to_string(),
            ));
        }
        let name = buf.get_string_utf8()?;
        let instruction = buf.get_string_utf8()?;
        let _language = buf.get_string_utf8()?;
        let count = buf.get_u32()? as usize;
        if count > 64 {
            return Err(KeelError::Protocol(format!(
                "Too many keyboard-interactive prompts: {}",
                count
            )));
        }
        let mut prompts = Vec::with_capacity(count);
        for _ in 0..count {
            prompts.push(InteractivePrompt {
                prompt: buf.get_string_utf8()?,
                echo: buf.get_bool()?,
            });
        }
        Ok(Self {
            name,
            instruction,
            prompts,
        })
    }
}

/// SSH_MSG_USERAUTH_INFO_RESPONSE (RFC 4256 Section 3.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InteractiveResponse {
    /// Responses, one per prompt.
    pub responses: Vec<String>,
}

impl InteractiveResponse {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Buffer::new();
        buf.put_u8(MessageType::UserauthInfoResponse as u8);
        buf.put_u32(self.responses.len() as u32);
        for response in &self.responses {
            buf.put_str(response);
        }
        buf.into_bytes()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> KeelResult<Self> {
        let mut buf = Buffer::from(data);
        let msg_type = buf.get_u8()?;
        if msg_type != MessageType::UserauthInfoResponse as u8 {
            return Err(KeelError::Protocol(
                "Expected SSH_MSG_USERAUTH_INFO_RESPONSE".to_string(),
            ));
        }
        let count = buf.get_u32()? as usize;
        if count > 64 {
            return Err(KeelError::Protocol(format!(
                "Too many keyboard-interactive responses: {}",
                count
            )));
        }
        let mut responses = Vec::with_capacity(count);
        for _ in 0..count {
            responses.push(buf.get_string_utf8()?);
        }
        Ok(Self { responses })
    }
}

/// Constructs the blob a public-key signature covers (RFC 4252 Section 7):
///
/// ```text
/// string    session identifier
/// byte      SSH_MSG_USERAUTH_REQUEST (50)
/// string    user name
/// string    service name
/// string    "publickey"
/// boolean   TRUE
/// string    public key algorithm name
/// string    public key blob
/// ```
pub fn construct_signature_data(
    session_id: &[u8],
    user_name: &str,
    service_name: &str,
    algorithm: &str,
    public_key: &[u8],
) -> Vec<u8> {
    let mut buf = Buffer::new();
    buf.put_string(session_id);
    buf.put_u8(MessageType::UserauthRequest as u8);
    buf.put_str(user_name);
    buf.put_str(service_name);
    buf.put_str("publickey");
    buf.put_bool(true);
    buf.put_str(algorithm);
    buf.put_string(public_key);
    buf.into_bytes()
}

/// Constant-time byte comparison.
pub fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Verifies a password against credentials, `(user, password, session)`.
#[async_trait::async_trait]
pub trait PasswordAuthenticator: Send + Sync {
    /// Returns true when the password is acceptable for the user.
    async fn authenticate(&self, username: &str, password: &str) -> KeelResult<bool>;
}

/// Decides whether a public key may authenticate a user. Signature
/// verification is done by the service; this only answers the policy
/// question.
#[async_trait::async_trait]
pub trait PublickeyAuthenticator: Send + Sync {
    /// Returns true when the key is acceptable for the user.
    async fn authenticate(
        &self,
        username: &str,
        algorithm: &str,
        public_key: &[u8],
    ) -> KeelResult<bool>;
}

/// Generates and checks keyboard-interactive challenges.
#[async_trait::async_trait]
pub trait InteractiveChallenger: Send + Sync {
    /// Produces the challenge for a user.
    async fn generate_challenge(&self, username: &str) -> KeelResult<InteractiveChallenge>;

    /// Checks the responses against the last challenge.
    async fn check_responses(&self, username: &str, responses: &[String]) -> KeelResult<bool>;
}

/// Outcome of processing one authentication-layer message.
#[derive(Debug)]
pub enum AuthOutcome {
    /// Authenticated; the connection service may start.
    Success {
        /// The authenticated user name.
        username: String,
    },
    /// The attempt failed; transport stays open.
    Failure {
        /// Methods that can continue.
        methods: Vec<String>,
        /// Whether a method already succeeded (multi-method policies).
        partial: bool,
    },
    /// A method-continuation reply to send (PK_OK or INFO_REQUEST).
    Continue(Vec<u8>),
    /// The attempt budget is exhausted; disconnect.
    Disconnect(DisconnectReason),
}

/// Server-side authentication service for one session.
pub struct UserAuthService {
    password: Option<Arc<dyn PasswordAuthenticator>>,
    publickey: Option<Arc<dyn PublickeyAuthenticator>>,
    interactive: Option<Arc<dyn InteractiveChallenger>>,
    session_id: Vec<u8>,
    attempts: u32,
    max_attempts: u32,
    partial_success: bool,
    /// Username of an in-flight keyboard-interactive exchange.
    pending_interactive: Option<String>,
}

impl UserAuthService {
    /// Creates the service bound to a session id.
    pub fn new(
        session_id: Vec<u8>,
        max_attempts: u32,
        password: Option<Arc<dyn PasswordAuthenticator>>,
        publickey: Option<Arc<dyn PublickeyAuthenticator>>,
        interactive: Option<Arc<dyn InteractiveChallenger>>,
    ) -> Self {
        Self {
            password,
            publickey,
            interactive,
            session_id,
            attempts: 0,
            max_attempts,
            partial_success: false,
            pending_interactive: None,
        }
    }

    /// Methods that can continue, in advertisement order.
    pub fn available_methods(&self) -> Vec<String> {
        let mut methods = Vec::new();
        if self.publickey.is_some() {
            methods.push("publickey".to_string());
        }
        if self.password.is_some() {
            methods.push("password".to_string());
        }
        if self.interactive.is_some() {
            methods.push("keyboard-interactive".to_string());
        }
        methods
    }

    fn failure(&self) -> AuthOutcome {
        AuthOutcome::Failure {
            methods: self.available_methods(),
            partial: self.partial_success,
        }
    }

    fn budget_exceeded(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Processes one authentication-layer payload (USERAUTH_REQUEST or
    /// INFO_RESPONSE).
    pub async fn handle_message(&mut self, payload: &[u8]) -> KeelResult<AuthOutcome> {
        match payload.first().copied() {
            Some(t) if t == MessageType::UserauthRequest as u8 => {
                let request = AuthRequest::from_bytes(payload)?;
                self.handle_request(request).await
            }
            Some(t) if t == MessageType::UserauthInfoResponse as u8 => {
                let response = InteractiveResponse::from_bytes(payload)?;
                self.handle_info_response(response).await
            }
            other => Err(KeelError::Protocol(format!(
                "Unexpected message during authentication: {:?}",
                other
            ))),
        }
    }

    async fn handle_request(&mut self, request: AuthRequest) -> KeelResult<AuthOutcome> {
        if request.service_name() != "ssh-connection" {
            warn!(service = %request.service_name(), "auth request for unknown service");
            return Ok(AuthOutcome::Disconnect(
                DisconnectReason::ServiceNotAvailable,
            ));
        }

        // A fresh request abandons any half-finished interactive exchange.
        self.pending_interactive = None;

        match request.method() {
            AuthMethod::None => {
                self.attempts += 1;
                if self.budget_exceeded() {
                    return Ok(AuthOutcome::Disconnect(
                        DisconnectReason::NoMoreAuthMethodsAvailable,
                    ));
                }
                Ok(self.failure())
            }
            AuthMethod::Password(password) => {
                self.attempts += 1;
                if self.budget_exceeded() {
                    return Ok(AuthOutcome::Disconnect(
                        DisconnectReason::NoMoreAuthMethodsAvailable,
                    ));
                }
                let Some(authenticator) = &self.password else {
                    return Ok(self.failure());
                };
                if authenticator
                    .authenticate(request.user_name(), password)
                    .await?
                {
                    Ok(AuthOutcome::Success {
                        username: request.user_name().to_string(),
                    })
                } else {
                    debug!(user = %request.user_name(), "password rejected");
                    Ok(self.failure())
                }
            }
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature,
            } => {
                let Some(authenticator) = &self.publickey else {
                    self.attempts += 1;
                    return Ok(self.failure());
                };

                let accepted = authenticator
                    .authenticate(request.user_name(), algorithm, public_key)
                    .await?;

                match signature {
                    None => {
                        // Probe phase does not count against the budget.
                        if accepted {
                            let pk_ok =
                                AuthPkOk::new(algorithm.clone(), public_key.clone());
                            Ok(AuthOutcome::Continue(pk_ok.to_bytes()))
                        } else {
                            self.attempts += 1;
                            if self.budget_exceeded() {
                                return Ok(AuthOutcome::Disconnect(
                                    DisconnectReason::NoMoreAuthMethodsAvailable,
                                ));
                            }
                            Ok(self.failure())
                        }
                    }
                    Some(signature) => {
                        self.attempts += 1;
                        if self.budget_exceeded() {
                            return Ok(AuthOutcome::Disconnect(
                                DisconnectReason::NoMoreAuthMethodsAvailable,
                            ));
                        }
                        let signed_data = construct_signature_data(
                            &self.session_id,
                            request.user_name(),
                            "ssh-connection",
                            algorithm,
                            public_key,
                        );
                        let verified =
                            verify_signature(algorithm, public_key, &signed_data, signature)
                                .unwrap_or(false);
                        if accepted && verified {
                            Ok(AuthOutcome::Success {
                                username: request.user_name().to_string(),
                            })
                        } else {
                            debug!(
                                user = %request.user_name(),
                                accepted, verified, "publickey rejected"
                            );
                            Ok(self.failure())
                        }
                    }
                }
            }
            AuthMethod::KeyboardInteractive { .. } => {
                let Some(challenger) = &self.interactive else {
                    self.attempts += 1;
                    return Ok(self.failure());
                };
                let challenge = challenger.generate_challenge(request.user_name()).await?;
                self.pending_interactive = Some(request.user_name().to_string());
                Ok(AuthOutcome::Continue(challenge.to_bytes()))
            }
        }
    }

    async fn handle_info_response(
        &mut self,
        response: InteractiveResponse,
    ) -> KeelResult<AuthOutcome> {
        let Some(username) = self.pending_interactive.take() else {
            return Err(KeelError::Protocol(
                "INFO_RESPONSE without a pending keyboard-interactive exchange".to_string(),
            ));
        };

        self.attempts += 1;
        if self.budget_exceeded() {
            return Ok(AuthOutcome::Disconnect(
                DisconnectReason::NoMoreAuthMethodsAvailable,
            ));
        }

        let Some(challenger) = &self.interactive else {
            return Ok(self.failure());
        };

        if challenger
            .check_responses(&username, &response.responses)
            .await?
        {
            Ok(AuthOutcome::Success { username })
        } else {
            Ok(self.failure())
        }
    }

    /// Records that a method succeeded but further methods are required.
    pub fn mark_partial_success(&mut self) {
        self.partial_success = true;
    }

    /// Attempts consumed so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::hostkey::{Ed25519HostKey, HostKey};

    struct FixedPassword;

    #[async_trait::async_trait]
    impl PasswordAuthenticator for FixedPassword {
        async fn authenticate(&self, username: &str, password: &str) -> KeelResult<bool> {
            Ok(username == "alice" && constant_time_compare(password.as_bytes(), b"sesame"))
        }
    }

    struct AcceptAllKeys;

    #[async_trait::async_trait]
    impl PublickeyAuthenticator for AcceptAllKeys {
        async fn authenticate(&self, _u: &str, _a: &str, _k: &[u8]) -> KeelResult<bool> {
            Ok(true)
        }
    }

    struct PinChallenger;

    #[async_trait::async_trait]
    impl InteractiveChallenger for PinChallenger {
        async fn generate_challenge(&self, _username: &str) -> KeelResult<InteractiveChallenge> {
            Ok(InteractiveChallenge {
                name: "PIN".to_string(),
                instruction: "Enter your PIN".to_string(),
                prompts: vec![InteractivePrompt {
                    prompt: "PIN: ".to_string(),
                    echo: false,
                }],
            })
        }

        async fn check_responses(&self, _username: &str, responses: &[String]) -> KeelResult<bool> {
            Ok(responses == ["1234"])
        }
    }

    fn service(max_attempts: u32) -> UserAuthService {
        UserAuthService::new(
            vec![0xaa; 32],
            max_attempts,
            Some(Arc::new(FixedPassword)),
            Some(Arc::new(AcceptAllKeys)),
            Some(Arc::new(PinChallenger)),
        )
    }

    #[test]
    fn test_auth_request_password_round_trip() {
        let request = AuthRequest::new(
            "alice",
            "ssh-connection",
            AuthMethod::Password("secret".to_string()),
        );
        let parsed = AuthRequest::from_bytes(&request.to_bytes()).unwrap();
        assert_eq!(parsed.user_name(), "alice");
        assert_eq!(parsed.method().name(), "password");
    }

    #[test]
    fn test_auth_request_publickey_round_trip() {
        let request = AuthRequest::new(
            "bob",
            "ssh-connection",
            AuthMethod::PublicKey {
                algorithm: "ssh-ed25519".to_string(),
                public_key: vec![1, 2, 3],
                signature: Some(vec![4, 5, 6]),
            },
        );
        let parsed = AuthRequest::from_bytes(&request.to_bytes()).unwrap();
        match parsed.method() {
            AuthMethod::PublicKey {
                algorithm,
                signature,
                ..
            } => {
                assert_eq!(algorithm, "ssh-ed25519");
                assert_eq!(signature.as_deref(), Some(&[4u8, 5, 6][..]));
            }
            other => panic!("Expected PublicKey, got {:?}", other),
        }
    }

    #[test]
    fn test_auth_failure_round_trip() {
        let failure = AuthFailure::new(
            vec!["publickey".to_string(), "password".to_string()],
            false,
        );
        let parsed = AuthFailure::from_bytes(&failure.to_bytes()).unwrap();
        assert_eq!(parsed.methods_can_continue().len(), 2);
        assert!(!parsed.partial_success());
    }

    #[test]
    fn test_interactive_challenge_round_trip() {
        let challenge = InteractiveChallenge {
            name: "OTP".to_string(),
            instruction: String::new(),
            prompts: vec![InteractivePrompt {
                prompt: "Code: ".to_string(),
                echo: true,
            }],
        };
        let parsed = InteractiveChallenge::from_bytes(&challenge.to_bytes()).unwrap();
        assert_eq!(parsed, challenge);
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare(b"same", b"same"));
        assert!(!constant_time_compare(b"same", b"different"));
        assert!(!constant_time_compare(b"same", b"sam"));
    }

    #[tokio::test]
    async fn test_password_success() {
        let mut service = service(20);
        let request = AuthRequest::new(
            "alice",
            "ssh-connection",
            AuthMethod::Password("sesame".to_string()),
        );
        match service.handle_message(&request.to_bytes()).await.unwrap() {
            AuthOutcome::Success { username } => assert_eq!(username, "alice"),
            other => panic!("Expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_password_failure_lists_methods() {
        let mut service = service(20);
        let request = AuthRequest::new(
            "alice",
            "ssh-connection",
            AuthMethod::Password("wrong".to_string()),
        );
        match service.handle_message(&request.to_bytes()).await.unwrap() {
            AuthOutcome::Failure { methods, partial } => {
                assert!(methods.contains(&"password".to_string()));
                assert!(methods.contains(&"publickey".to_string()));
                assert!(!partial);
            }
            other => panic!("Expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_none_method_fails_with_methods() {
        let mut service = service(20);
        let request = AuthRequest::new("alice", "ssh-connection", AuthMethod::None);
        match service.handle_message(&request.to_bytes()).await.unwrap() {
            AuthOutcome::Failure { methods, .. } => assert!(!methods.is_empty()),
            other => panic!("Expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_attempt_budget_disconnects() {
        let mut service = service(2);
        let request = AuthRequest::new(
            "alice",
            "ssh-connection",
            AuthMethod::Password("wrong".to_string()),
        );
        let bytes = request.to_bytes();
        // First failure stays in the service.
        assert!(matches!(
            service.handle_message(&bytes).await.unwrap(),
            AuthOutcome::Failure { .. }
        ));
        // Budget of 2 reached: second attempt disconnects.
        assert!(matches!(
            service.handle_message(&bytes).await.unwrap(),
            AuthOutcome::Disconnect(DisconnectReason::NoMoreAuthMethodsAvailable)
        ));
    }

    #[tokio::test]
    async fn test_publickey_probe_then_sign() {
        let key = Ed25519HostKey::generate().unwrap();
        let blob = key.public_key_blob();
        let session_id = vec![0xaa; 32];

        let mut service = service(20);

        // Probe: no signature, expect PK_OK.
        let probe = AuthRequest::new(
            "alice",
            "ssh-connection",
            AuthMethod::PublicKey {
                algorithm: "ssh-ed25519".to_string(),
                public_key: blob.clone(),
                signature: None,
            },
        );
        let reply = match service.handle_message(&probe.to_bytes()).await.unwrap() {
            AuthOutcome::Continue(reply) => reply,
            other => panic!("Expected PK_OK, got {:?}", other),
        };
        let pk_ok = AuthPkOk::from_bytes(&reply).unwrap();
        assert_eq!(pk_ok.algorithm(), "ssh-ed25519");
        assert_eq!(pk_ok.public_key(), &blob[..]);
        // The probe must not consume an attempt.
        assert_eq!(service.attempts(), 0);

        // Sign phase.
        let signed_data =
            construct_signature_data(&session_id, "alice", "ssh-connection", "ssh-ed25519", &blob);
        let signature = key.sign("ssh-ed25519", &signed_data).unwrap();
        let sign = AuthRequest::new(
            "alice",
            "ssh-connection",
            AuthMethod::PublicKey {
                algorithm: "ssh-ed25519".to_string(),
                public_key: blob,
                signature: Some(signature),
            },
        );
        assert!(matches!(
            service.handle_message(&sign.to_bytes()).await.unwrap(),
            AuthOutcome::Success { .. }
        ));
    }

    #[tokio::test]
    async fn test_publickey_bad_signature_fails() {
        let key = Ed25519HostKey::generate().unwrap();
        let blob = key.public_key_blob();

        let mut service = service(20);
        let signature = key.sign("ssh-ed25519", b"not the auth blob").unwrap();
        let sign = AuthRequest::new(
            "alice",
            "ssh-connection",
            AuthMethod::PublicKey {
                algorithm: "ssh-ed25519".to_string(),
                public_key: blob,
                signature: Some(signature),
            },
        );
        assert!(matches!(
            service.handle_message(&sign.to_bytes()).await.unwrap(),
            AuthOutcome::Failure { .. }
        ));
    }

    #[tokio::test]
    async fn test_keyboard_interactive_flow() {
        let mut service = service(20);

        let request = AuthRequest::new(
            "alice",
            "ssh-connection",
            AuthMethod::KeyboardInteractive {
                language: String::new(),
                submethods: String::new(),
            },
        );
        let challenge_bytes = match service.handle_message(&request.to_bytes()).await.unwrap() {
            AuthOutcome::Continue(bytes) => bytes,
            other => panic!("Expected challenge, got {:?}", other),
        };
        let challenge = InteractiveChallenge::from_bytes(&challenge_bytes).unwrap();
        assert_eq!(challenge.prompts.len(), 1);

        let response = InteractiveResponse {
            responses: vec!["1234".to_string()],
        };
        assert!(matches!(
            service.handle_message(&response.to_bytes()).await.unwrap(),
            AuthOutcome::Success { .. }
        ));
    }

    #[tokio::test]
    async fn test_info_response_without_pending_is_protocol_error() {
        let mut service = service(20);
        let response = InteractiveResponse { responses: vec![] };
        assert!(service
            .handle_message(&response.to_bytes())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_unknown_service_disconnects() {
        let mut service = service(20);
        let request = AuthRequest::new("alice", "ssh-userauth", AuthMethod::None);
        assert!(matches!(
            service.handle_message(&request.to_bytes()).await.unwrap(),
            AuthOutcome::Disconnect(DisconnectReason::ServiceNotAvailable)
        ));
    }
}
