//! C8: the authentication handshake and per-invocation authorization hook.
//!
//! Grounded on spec §4.8 and the teacher's SASL-style negotiation shape in
//! `freeq-server`'s connection setup (challenge issued by the listener,
//! response validated before any application traffic is allowed through).

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use parking_lot::Mutex;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::codec::{read_message, write_message, Message};
use crate::error::RmiError;

/// Installed on the listening side; validates `(remoteAddress, authId,
/// credential)` at connection setup.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, remote_addr: SocketAddr, auth_id: &str, credential: &[u8]) -> Result<(), RmiError>;
}

/// Accepts every connection. The default when no authentication is
/// configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAuthAuthenticator;

impl Authenticator for NoAuthAuthenticator {
    fn authenticate(&self, _remote_addr: SocketAddr, _auth_id: &str, _credential: &[u8]) -> Result<(), RmiError> {
        Ok(())
    }
}

/// Fixed `authId -> passphrase` table, compared byte-for-byte.
#[derive(Debug, Default)]
pub struct StaticAuthenticator {
    credentials: HashMap<String, Vec<u8>>,
}

impl StaticAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(mut self, auth_id: impl Into<String>, passphrase: impl Into<Vec<u8>>) -> Self {
        self.credentials.insert(auth_id.into(), passphrase.into());
        self
    }
}

impl Authenticator for StaticAuthenticator {
    fn authenticate(&self, _remote_addr: SocketAddr, auth_id: &str, credential: &[u8]) -> Result<(), RmiError> {
        match self.credentials.get(auth_id) {
            Some(expected) if expected.as_slice() == credential => Ok(()),
            _ => Err(RmiError::Authentication(format!("rejected credential for {auth_id}"))),
        }
    }
}

#[derive(Clone)]
pub struct AuthTarget<'a> {
    pub object_id: &'a str,
    pub class_name: &'a str,
    pub method: &'a str,
}

/// Installed on the listening side; checked before every dispatched
/// invocation (spec §4.8).
pub trait Authorizer: Send + Sync {
    fn authorize(&self, auth_id: Option<&str>, target: AuthTarget<'_>) -> bool;
}

/// Authorizes everything, subject to the registry's `defaultAuthorize` flag.
pub struct DefaultAuthorizer {
    pub allow: bool,
}

impl Authorizer for DefaultAuthorizer {
    fn authorize(&self, _auth_id: Option<&str>, _target: AuthTarget<'_>) -> bool {
        self.allow
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Principal {
    User(String),
    Role(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Scope {
    ObjectMethod(String, String),
    Method(String),
    Object(String),
    Class(String),
}

fn scopes_for(target: &AuthTarget<'_>) -> [Scope; 4] {
    [
        Scope::ObjectMethod(target.object_id.to_string(), target.method.to_string()),
        Scope::Method(target.method.to_string()),
        Scope::Object(target.object_id.to_string()),
        Scope::Class(target.class_name.to_string()),
    ]
}

/// The reference authorizer named informatively in spec §4.8: a
/// four-granularity, two-level permission grid. Precedence, most to least
/// specific: user positive, user negative, role positive, role negative,
/// then the process-wide default.
#[derive(Default)]
pub struct GridAuthorizer {
    default_authorize: bool,
    user_roles: Mutex<HashMap<String, HashSet<String>>>,
    rules: Mutex<HashMap<(Principal, Scope), bool>>,
}

impl GridAuthorizer {
    pub fn new(default_authorize: bool) -> Self {
        Self {
            default_authorize,
            user_roles: Mutex::new(HashMap::new()),
            rules: Mutex::new(HashMap::new()),
        }
    }

    pub fn assign_role(&self, user: impl Into<String>, role: impl Into<String>) {
        self.user_roles.lock().entry(user.into()).or_default().insert(role.into());
    }

    pub fn allow_user_object_method(&self, user: impl Into<String>, object_id: &str, method: &str) {
        self.set_rule(Principal::User(user.into()), Scope::ObjectMethod(object_id.into(), method.into()), true);
    }
    pub fn deny_user_object_method(&self, user: impl Into<String>, object_id: &str, method: &str) {
        self.set_rule(Principal::User(user.into()), Scope::ObjectMethod(object_id.into(), method.into()), false);
    }
    pub fn allow_user_method(&self, user: impl Into<String>, method: &str) {
        self.set_rule(Principal::User(user.into()), Scope::Method(method.into()), true);
    }
    pub fn deny_user_method(&self, user: impl Into<String>, method: &str) {
        self.set_rule(Principal::User(user.into()), Scope::Method(method.into()), false);
    }
    pub fn allow_user_object(&self, user: impl Into<String>, object_id: &str) {
        self.set_rule(Principal::User(user.into()), Scope::Object(object_id.into()), true);
    }
    pub fn deny_user_object(&self, user: impl Into<String>, object_id: &str) {
        self.set_rule(Principal::User(user.into()), Scope::Object(object_id.into()), false);
    }
    pub fn allow_user_class(&self, user: impl Into<String>, class_name: &str) {
        self.set_rule(Principal::User(user.into()), Scope::Class(class_name.into()), true);
    }
    pub fn deny_user_class(&self, user: impl Into<String>, class_name: &str) {
        self.set_rule(Principal::User(user.into()), Scope::Class(class_name.into()), false);
    }

    pub fn allow_role_object_method(&self, role: impl Into<String>, object_id: &str, method: &str) {
        self.set_rule(Principal::Role(role.into()), Scope::ObjectMethod(object_id.into(), method.into()), true);
    }
    pub fn deny_role_object_method(&self, role: impl Into<String>, object_id: &str, method: &str) {
        self.set_rule(Principal::Role(role.into()), Scope::ObjectMethod(object_id.into(), method.into()), false);
    }
    pub fn allow_role_method(&self, role: impl Into<String>, method: &str) {
        self.set_rule(Principal::Role(role.into()), Scope::Method(method.into()), true);
    }
    pub fn deny_role_method(&self, role: impl Into<String>, method: &str) {
        self.set_rule(Principal::Role(role.into()), Scope::Method(method.into()), false);
    }
    pub fn allow_role_object(&self, role: impl Into<String>, object_id: &str) {
        self.set_rule(Principal::Role(role.into()), Scope::Object(object_id.into()), true);
    }
    pub fn deny_role_object(&self, role: impl Into<String>, object_id: &str) {
        self.set_rule(Principal::Role(role.into()), Scope::Object(object_id.into()), false);
    }
    pub fn allow_role_class(&self, role: impl Into<String>, class_name: &str) {
        self.set_rule(Principal::Role(role.into()), Scope::Class(class_name.into()), true);
    }
    pub fn deny_role_class(&self, role: impl Into<String>, class_name: &str) {
        self.set_rule(Principal::Role(role.into()), Scope::Class(class_name.into()), false);
    }

    fn set_rule(&self, principal: Principal, scope: Scope, allow: bool) {
        self.rules.lock().insert((principal, scope), allow);
    }

    fn tier_verdict(&self, principal: &Principal, target: &AuthTarget<'_>, allow: bool) -> bool {
        let rules = self.rules.lock();
        scopes_for(target)
            .into_iter()
            .any(|scope| rules.get(&(principal.clone(), scope)) == Some(&allow))
    }
}

impl Authorizer for GridAuthorizer {
    fn authorize(&self, auth_id: Option<&str>, target: AuthTarget<'_>) -> bool {
        let Some(user) = auth_id else {
            return self.default_authorize;
        };
        let user_principal = Principal::User(user.to_string());
        if self.tier_verdict(&user_principal, &target, true) {
            return true;
        }
        if self.tier_verdict(&user_principal, &target, false) {
            return false;
        }
        let roles: Vec<String> = self
            .user_roles
            .lock()
            .get(user)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        for role in &roles {
            if self.tier_verdict(&Principal::Role(role.clone()), &target, true) {
                return true;
            }
        }
        for role in &roles {
            if self.tier_verdict(&Principal::Role(role.clone()), &target, false) {
                return false;
            }
        }
        self.default_authorize
    }
}

fn generate_nonce() -> String {
    let mut rng = rand::thread_rng();
    (0..24).map(|_| char::from(rng.sample(rand::distributions::Alphanumeric))).collect()
}

/// Listener side of the handshake (spec §6): emit `AuthChallenge`, block
/// for `AuthResponse`, validate it. On rejection the caller must close the
/// transport without sending a `Close` frame.
pub async fn run_listener_handshake<S>(
    stream: &mut S,
    authenticator: &dyn Authenticator,
    remote_addr: SocketAddr,
) -> Result<Option<String>, RmiError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let nonce = generate_nonce();
    write_message(stream, &Message::AuthChallenge { nonce }).await?;
    match read_message(stream).await? {
        Message::AuthResponse { auth_id, credential } => {
            if auth_id.is_empty() {
                return Ok(None);
            }
            authenticator.authenticate(remote_addr, &auth_id, &credential)?;
            Ok(Some(auth_id))
        }
        other => Err(RmiError::Protocol(format!("expected AuthResponse, got {other:?}"))),
    }
}

/// Initiator side: wait for the challenge, answer it. There is no explicit
/// accept message on the wire (spec §6) — a rejected handshake is observed
/// indirectly when the transport closes instead of entering `Running`.
pub async fn run_initiator_handshake<S>(
    stream: &mut S,
    auth_id: Option<&str>,
    credential: &[u8],
) -> Result<(), RmiError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    match read_message(stream).await? {
        Message::AuthChallenge { .. } => {
            write_message(
                stream,
                &Message::AuthResponse {
                    auth_id: auth_id.unwrap_or("").to_string(),
                    credential: credential.to_vec(),
                },
            )
            .await
        }
        other => Err(RmiError::Protocol(format!("expected AuthChallenge, got {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_authenticator_accepts_matching_credential() {
        let auth = StaticAuthenticator::new().with_credential("user", b"secret".to_vec());
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        assert!(auth.authenticate(addr, "user", b"secret").is_ok());
        assert!(auth.authenticate(addr, "user", b"wrong").is_err());
        assert!(auth.authenticate(addr, "nobody", b"secret").is_err());
    }

    #[test]
    fn grid_default_applies_to_anonymous_calls() {
        let grid = GridAuthorizer::new(true);
        let target = AuthTarget {
            object_id: "calc",
            class_name: "Calculator",
            method: "add",
        };
        assert!(grid.authorize(None, target));
    }

    #[test]
    fn grid_user_positive_overrides_role_negative() {
        let grid = GridAuthorizer::new(false);
        grid.assign_role("alice", "guests");
        grid.deny_role_method("guests", "add");
        grid.allow_user_method("alice", "add");
        let target = AuthTarget {
            object_id: "calc",
            class_name: "Calculator",
            method: "add",
        };
        assert!(grid.authorize(Some("alice"), target));
    }

    #[test]
    fn grid_role_negative_beats_default_allow() {
        let grid = GridAuthorizer::new(true);
        grid.assign_role("bob", "guests");
        grid.deny_role_object_method("guests", "calc", "reset");
        let target = AuthTarget {
            object_id: "calc",
            class_name: "Calculator",
            method: "reset",
        };
        assert!(!grid.authorize(Some("bob"), target));
    }

    #[test]
    fn grid_falls_back_to_default_with_no_matching_rule() {
        let grid = GridAuthorizer::new(true);
        let target = AuthTarget {
            object_id: "calc",
            class_name: "Calculator",
            method: "add",
        };
        assert!(grid.authorize(Some("carol"), target));
    }
}
