//! Token-based login/ping/new-work-conn signing and verification (spec
//! §4.3). The only auth method this core implements is the shared-token
//! `PrivilegeKey`; STCP/SUDP/XTCP visitor `sign_key`s use the same MD5
//! construction but are verified against a per-proxy secret instead of the
//! server's token (see [`crate::crypto::sign_key`] / `verify_sign_key`).

use crate::crypto::sign_key;
use crate::msg::{Login, NewWorkConn, Ping};
use crate::{Error, Result};
use std::time::{SystemTime, UNIX_EPOCH};

/// Which message kinds get a `PrivilegeKey` stamp, mirroring frp's
/// `AuthenticateHeartBeats` / `AuthenticateNewWorkConns` config toggles.
#[derive(Debug, Clone, Copy)]
pub struct AuthScope {
    pub heartbeats: bool,
    pub new_work_conns: bool,
}

impl Default for AuthScope {
    fn default() -> Self {
        AuthScope {
            heartbeats: false,
            new_work_conns: false,
        }
    }
}

/// Client-side: stamps outgoing messages with the shared token.
#[derive(Clone)]
pub struct TokenAuthSetter {
    token: String,
    scope: AuthScope,
}

impl TokenAuthSetter {
    pub fn new(token: impl Into<String>, scope: AuthScope) -> Self {
        TokenAuthSetter {
            token: token.into(),
            scope,
        }
    }

    fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }

    pub fn sign_login(&self, login: &mut Login) {
        let ts = Self::now();
        login.timestamp = ts;
        login.privilege_key = sign_key(&self.token, ts);
    }

    pub fn sign_ping(&self, ping: &mut Ping) {
        let ts = Self::now();
        ping.timestamp = ts;
        if self.scope.heartbeats {
            ping.privilege_key = sign_key(&self.token, ts);
        }
    }

    pub fn sign_new_work_conn(&self, msg: &mut NewWorkConn) {
        let ts = Self::now();
        msg.timestamp = ts;
        if self.scope.new_work_conns {
            msg.privilege_key = sign_key(&self.token, ts);
        }
    }
}

/// Server-side: verifies an incoming message's `PrivilegeKey`/timestamp
/// against the configured token within `max_skew_secs` of clock skew
/// (default 900s per spec §4.3).
#[derive(Clone)]
pub struct TokenAuthVerifier {
    token: String,
    max_skew_secs: i64,
}

impl TokenAuthVerifier {
    pub fn new(token: impl Into<String>, max_skew_secs: i64) -> Self {
        TokenAuthVerifier {
            token: token.into(),
            max_skew_secs,
        }
    }

    fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }

    pub fn verify_login(&self, login: &Login) -> Result<()> {
        self.verify(login.timestamp, &login.privilege_key)
    }

    pub fn verify_ping(&self, ping: &Ping) -> Result<()> {
        self.verify(ping.timestamp, &ping.privilege_key)
    }

    pub fn verify_new_work_conn(&self, msg: &NewWorkConn) -> Result<()> {
        self.verify(msg.timestamp, &msg.privilege_key)
    }

    fn verify(&self, timestamp: i64, privilege_key: &str) -> Result<()> {
        let expected = sign_key(&self.token, timestamp);
        let now = Self::now();
        if (now - timestamp).abs() > self.max_skew_secs {
            return Err(Error::auth("timestamp outside allowed clock skew"));
        }
        use subtle::ConstantTimeEq;
        if expected.as_bytes().ct_eq(privilege_key.as_bytes()).into() {
            Ok(())
        } else {
            Err(Error::auth("invalid privilege key"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setter_and_verifier_agree_on_login() {
        let setter = TokenAuthSetter::new("shared-token", AuthScope::default());
        let verifier = TokenAuthVerifier::new("shared-token", 900);

        let mut login = Login::default();
        setter.sign_login(&mut login);
        assert!(verifier.verify_login(&login).is_ok());
    }

    #[test]
    fn verifier_rejects_wrong_token() {
        let setter = TokenAuthSetter::new("token-a", AuthScope::default());
        let verifier = TokenAuthVerifier::new("token-b", 900);

        let mut login = Login::default();
        setter.sign_login(&mut login);
        assert!(verifier.verify_login(&login).is_err());
    }

    #[test]
    fn ping_only_stamped_when_scope_includes_heartbeats() {
        let setter = TokenAuthSetter::new(
            "t",
            AuthScope {
                heartbeats: false,
                new_work_conns: false,
            },
        );
        let mut ping = Ping::default();
        setter.sign_ping(&mut ping);
        assert!(ping.privilege_key.is_empty());

        let setter = TokenAuthSetter::new(
            "t",
            AuthScope {
                heartbeats: true,
                new_work_conns: false,
            },
        );
        let mut ping = Ping::default();
        setter.sign_ping(&mut ping);
        assert!(!ping.privilege_key.is_empty());
    }

    #[test]
    fn verifier_rejects_stale_timestamp() {
        let verifier = TokenAuthVerifier::new("t", 5);
        let stale_ts = TokenAuthVerifier::now() - 100;
        let key = sign_key("t", stale_ts);
        let ping = Ping {
            privilege_key: key,
            timestamp: stale_ts,
        };
        assert!(verifier.verify_ping(&ping).is_err());
    }
}
