//! Session gate, login lockout and password policy.
//!
//! The device has a single operator account (`admin`) and at most one live
//! session. Minting a new session replaces the previous token, so the old
//! cookie simply stops matching.

use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::prefs::{keys, Preferences, PrefsError, PrefsRead, WriteScope};

pub const SESSION_COOKIE: &str = "BEE_SESSION";
pub const ADMIN_USERNAME: &str = "admin";
pub const DEFAULT_PASSWORD: &str = "admin";
pub const MAX_LOGIN_ATTEMPTS: u32 = 5;
pub const LOCKOUT_WINDOW_MS: u64 = 5 * 60 * 1000;
pub const MIN_PASSWORD_LEN: usize = 8;

/// `Set-Cookie` value that makes the browser drop the session cookie.
pub const CLEAR_SESSION_COOKIE: &str = "BEE_SESSION=; Path=/; Expires=Thu, 01 Jan 1970 00:00:00 GMT";

#[derive(Debug, Error)]
pub enum LoginError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Too many failed login attempts. Please try again in 5 minutes.")]
    AccountLocked,

    #[error(transparent)]
    Prefs(#[from] PrefsError),
}

#[derive(Debug, Error)]
pub enum PasswordError {
    #[error("Missing fields")]
    Missing,

    #[error("Incorrect current password")]
    IncorrectCurrent,

    #[error("New passwords do not match")]
    Mismatch,

    #[error("Password must be at least 8 characters and contain uppercase, lowercase, a digit and a symbol")]
    Complexity,

    #[error(transparent)]
    Prefs(#[from] PrefsError),
}

/// Storage for the process-wide session token.
pub trait SessionStore: Send + Sync {
    fn get(&self) -> Option<String>;
    fn set(&self, token: String);
    fn clear(&self);
}

/// Session token held in memory; a restart logs everyone out.
#[derive(Default)]
pub struct MemorySessionStore {
    token: Mutex<Option<String>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self) -> Option<String> {
        self.token.lock().ok().and_then(|t| t.clone())
    }

    fn set(&self, token: String) {
        if let Ok(mut current) = self.token.lock() {
            *current = Some(token);
        }
    }

    fn clear(&self) {
        if let Ok(mut current) = self.token.lock() {
            *current = None;
        }
    }
}

/// Persisted failed-login bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoginAttemptCounter {
    pub fail_count: u32,
    /// Monotonic uptime (ms) of the most recent failure.
    pub last_failure_ms: u64,
}

impl LoginAttemptCounter {
    pub fn load(scope: &impl PrefsRead) -> Result<Self, PrefsError> {
        Ok(Self {
            fail_count: scope.get_u64_or(keys::LOGIN_FAILS, 0)? as u32,
            last_failure_ms: scope.get_u64_or(keys::LAST_FAIL_TIME, 0)?,
        })
    }

    pub fn store(&self, scope: &mut WriteScope<'_>) {
        scope.set_u64(keys::LOGIN_FAILS, self.fail_count as u64);
        scope.set_u64(keys::LAST_FAIL_TIME, self.last_failure_ms);
    }

    /// Whether further attempts are refused at `now_ms`.
    ///
    /// A failure time later than `now_ms` comes from before a reboot and no
    /// longer locks anything.
    pub fn is_locked(&self, now_ms: u64, max_attempts: u32, window_ms: u64) -> bool {
        if self.fail_count < max_attempts || self.last_failure_ms > now_ms {
            return false;
        }
        now_ms - self.last_failure_ms < window_ms
    }

    pub fn record_failure(&mut self, now_ms: u64) {
        self.fail_count = self.fail_count.saturating_add(1);
        self.last_failure_ms = now_ms;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Result of a successful login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginSuccess {
    pub token: String,
    /// The account still uses the factory password.
    pub must_change_password: bool,
}

impl LoginSuccess {
    /// Where the browser goes next.
    pub fn redirect(&self) -> &'static str {
        if self.must_change_password {
            "/changepass"
        } else {
            "/"
        }
    }

    pub fn set_cookie(&self) -> String {
        session_cookie(&self.token)
    }
}

/// `Set-Cookie` value carrying a session token.
pub fn session_cookie(token: &str) -> String {
    format!("{}={}; Path=/; HttpOnly; SameSite=Strict", SESSION_COOKIE, token)
}

/// Lowercase hex SHA-256 of `input`.
pub fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Compare without bailing out at the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Find the session cookie value in a `Cookie` header.
pub fn session_from_cookie_header(header: &str) -> Option<&str> {
    header.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name.trim() == SESSION_COOKIE).then(|| value.trim())
    })
}

/// Check a new password against the policy: at least 8 characters with an
/// uppercase letter, a lowercase letter, a digit and a non-alphanumeric
/// character.
pub fn validate_password(password: &str, confirm: &str) -> Result<(), PasswordError> {
    if password.is_empty() || confirm.is_empty() {
        return Err(PasswordError::Missing);
    }
    if password != confirm {
        return Err(PasswordError::Mismatch);
    }
    let has_upper = password.chars().any(|c| c.is_ascii_uppercase());
    let has_lower = password.chars().any(|c| c.is_ascii_lowercase());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    let has_symbol = password.chars().any(|c| !c.is_ascii_alphanumeric());
    if password.chars().count() < MIN_PASSWORD_LEN || !(has_upper && has_lower && has_digit && has_symbol) {
        return Err(PasswordError::Complexity);
    }
    Ok(())
}

/// Authorization gate shared by all request handlers.
pub struct AuthGate {
    sessions: Arc<dyn SessionStore>,
    prefs: Preferences,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
    lockout_window_ms: u64,
}

impl AuthGate {
    pub fn new(sessions: Arc<dyn SessionStore>, prefs: Preferences, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions,
            prefs,
            clock,
            max_attempts: MAX_LOGIN_ATTEMPTS,
            lockout_window_ms: LOCKOUT_WINDOW_MS,
        }
    }

    pub fn with_lockout(mut self, max_attempts: u32, window_ms: u64) -> Self {
        self.max_attempts = max_attempts;
        self.lockout_window_ms = window_ms;
        self
    }

    /// Verify credentials and mint a session.
    ///
    /// A locked account is refused before the credentials are looked at and
    /// the refused attempt is not counted.
    pub fn login(&self, username: &str, password: &str) -> Result<LoginSuccess, LoginError> {
        let now = self.clock.uptime_ms();
        let mut scope = self.prefs.write()?;
        let mut counter = LoginAttemptCounter::load(&scope)?;

        if counter.is_locked(now, self.max_attempts, self.lockout_window_ms) {
            warn!(fail_count = counter.fail_count, "login refused: account locked");
            return Err(LoginError::AccountLocked);
        }

        let is_default = scope.get_bool_or(keys::IS_DEFAULT_PASS, true)?;
        let stored_hash = scope.get_string_or(keys::ADMIN_PASS, "")?;
        let user_ok = constant_time_eq(username.as_bytes(), ADMIN_USERNAME.as_bytes());
        let password_ok = if is_default {
            constant_time_eq(password.as_bytes(), DEFAULT_PASSWORD.as_bytes())
        } else {
            !stored_hash.is_empty()
                && constant_time_eq(sha256_hex(password).as_bytes(), stored_hash.as_bytes())
        };

        if !(user_ok && password_ok) {
            counter.record_failure(now);
            counter.store(&mut scope);
            scope.commit()?;
            warn!(fail_count = counter.fail_count, "login failed");
            return Err(LoginError::InvalidCredentials);
        }

        counter.reset();
        counter.store(&mut scope);
        scope.commit()?;

        let token = Uuid::new_v4().simple().to_string();
        self.sessions.set(token.clone());
        info!(default_password = is_default, "login succeeded");
        Ok(LoginSuccess {
            token,
            must_change_password: is_default,
        })
    }

    /// True iff a session exists and the request carries exactly its token.
    pub fn is_authenticated(&self, cookie_header: Option<&str>) -> bool {
        let Some(current) = self.sessions.get() else {
            return false;
        };
        cookie_header
            .and_then(session_from_cookie_header)
            .map(|presented| constant_time_eq(presented.as_bytes(), current.as_bytes()))
            .unwrap_or(false)
    }

    /// End the session presented in `cookie_header`.
    ///
    /// Always returns the clearing cookie. The open session is only dropped
    /// when the caller holds it, so an anonymous request changes nothing.
    pub fn logout(&self, cookie_header: Option<&str>) -> &'static str {
        if self.is_authenticated(cookie_header) {
            self.sessions.clear();
            debug!("session cleared");
        }
        CLEAR_SESSION_COOKIE
    }

    pub fn is_default_password(&self) -> Result<bool, PrefsError> {
        self.prefs.read()?.get_bool_or(keys::IS_DEFAULT_PASS, true)
    }

    pub fn attempts(&self) -> Result<LoginAttemptCounter, PrefsError> {
        LoginAttemptCounter::load(&self.prefs.read()?)
    }

    /// Set a new password (first-run flow; the caller is already logged in).
    pub fn change_password(&self, new_password: &str, confirm: &str) -> Result<(), PasswordError> {
        validate_password(new_password, confirm)?;
        let mut scope = self.prefs.write()?;
        Self::store_password(&mut scope, new_password);
        scope.commit()?;
        info!("admin password changed");
        Ok(())
    }

    /// Set a new password after re-checking the current one (admin page).
    pub fn change_admin_password(
        &self,
        current: &str,
        new_password: &str,
        confirm: &str,
    ) -> Result<(), PasswordError> {
        if current.is_empty() || new_password.is_empty() || confirm.is_empty() {
            return Err(PasswordError::Missing);
        }
        let mut scope = self.prefs.write()?;
        let is_default = scope.get_bool_or(keys::IS_DEFAULT_PASS, true)?;
        let current_ok = if is_default {
            constant_time_eq(current.as_bytes(), DEFAULT_PASSWORD.as_bytes())
        } else {
            let stored = scope.get_string_or(keys::ADMIN_PASS, "")?;
            constant_time_eq(sha256_hex(current).as_bytes(), stored.as_bytes())
        };
        if !current_ok {
            return Err(PasswordError::IncorrectCurrent);
        }
        validate_password(new_password, confirm)?;
        Self::store_password(&mut scope, new_password);
        scope.commit()?;
        info!("admin password changed from admin page");
        Ok(())
    }

    fn store_password(scope: &mut WriteScope<'_>, password: &str) {
        scope.set_string(keys::ADMIN_PASS, &sha256_hex(password));
        scope.set_bool(keys::IS_DEFAULT_PASS, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use pretty_assertions::assert_eq;

    fn gate() -> (AuthGate, ManualClock) {
        let clock = ManualClock::new(1_000, 0);
        let prefs = Preferences::in_memory();
        prefs.ensure_defaults("BeeCounter").unwrap();
        let gate = AuthGate::new(
            Arc::new(MemorySessionStore::new()),
            prefs,
            Arc::new(clock.clone()),
        );
        (gate, clock)
    }

    fn cookie(token: &str) -> String {
        format!("theme=dark; {}={}", SESSION_COOKIE, token)
    }

    #[test]
    fn test_default_login_requires_password_change() {
        let (gate, _) = gate();
        let ok = gate.login("admin", "admin").unwrap();
        assert!(ok.must_change_password);
        assert_eq!(ok.redirect(), "/changepass");
        assert_eq!(ok.token.len(), 32);
        assert!(ok.set_cookie().starts_with("BEE_SESSION="));
        assert!(gate.is_authenticated(Some(&cookie(&ok.token))));
    }

    #[test]
    fn test_new_session_replaces_old() {
        let (gate, _) = gate();
        let first = gate.login("admin", "admin").unwrap();
        let second = gate.login("admin", "admin").unwrap();
        assert_ne!(first.token, second.token);
        assert!(!gate.is_authenticated(Some(&cookie(&first.token))));
        assert!(gate.is_authenticated(Some(&cookie(&second.token))));
    }

    #[test]
    fn test_cookie_must_match_exactly() {
        let (gate, _) = gate();
        let ok = gate.login("admin", "admin").unwrap();
        assert!(!gate.is_authenticated(None));
        assert!(!gate.is_authenticated(Some(&cookie(&ok.token[..10]))));
        assert!(!gate.is_authenticated(Some(&format!("X{}={}", SESSION_COOKIE, ok.token))));
        assert!(!gate.is_authenticated(Some(&cookie(&format!("{}0", ok.token)))));
    }

    #[test]
    fn test_no_session_never_authenticates() {
        let (gate, _) = gate();
        assert!(!gate.is_authenticated(Some("BEE_SESSION=")));
        assert!(!gate.is_authenticated(Some("BEE_SESSION=anything")));
    }

    #[test]
    fn test_lockout_after_five_failures() {
        let (gate, clock) = gate();
        for _ in 0..5 {
            assert!(matches!(
                gate.login("admin", "wrong"),
                Err(LoginError::InvalidCredentials)
            ));
            clock.advance_ms(1_000);
        }
        // Correct credentials are refused while locked, and not counted.
        assert!(matches!(gate.login("admin", "admin"), Err(LoginError::AccountLocked)));
        assert_eq!(gate.attempts().unwrap().fail_count, 5);

        clock.advance_ms(LOCKOUT_WINDOW_MS);
        assert!(gate.login("admin", "admin").is_ok());
        assert_eq!(gate.attempts().unwrap(), LoginAttemptCounter::default());
    }

    #[test]
    fn test_lockout_from_before_reboot_expires() {
        let counter = LoginAttemptCounter {
            fail_count: 5,
            last_failure_ms: 90_000,
        };
        assert!(counter.is_locked(100_000, 5, LOCKOUT_WINDOW_MS));
        assert!(!counter.is_locked(2_000, 5, LOCKOUT_WINDOW_MS));
    }

    #[test]
    fn test_wrong_username_counts_as_failure() {
        let (gate, _) = gate();
        assert!(gate.login("root", "admin").is_err());
        assert_eq!(gate.attempts().unwrap().fail_count, 1);
    }

    #[test]
    fn test_logout_is_idempotent() {
        let (gate, _) = gate();
        let ok = gate.login("admin", "admin").unwrap();
        let presented = cookie(&ok.token);
        assert_eq!(gate.logout(Some(&presented)), CLEAR_SESSION_COOKIE);
        assert_eq!(gate.logout(Some(&presented)), CLEAR_SESSION_COOKIE);
        assert!(!gate.is_authenticated(Some(&presented)));
    }

    #[test]
    fn test_logout_without_session_keeps_owner_logged_in() {
        let (gate, _) = gate();
        let ok = gate.login("admin", "admin").unwrap();
        assert_eq!(gate.logout(None), CLEAR_SESSION_COOKIE);
        assert_eq!(gate.logout(Some("BEE_SESSION=guess")), CLEAR_SESSION_COOKIE);
        assert!(gate.is_authenticated(Some(&cookie(&ok.token))));
    }

    #[test]
    fn test_password_policy() {
        assert!(matches!(
            validate_password("abcdefgh", "abcdefgh"),
            Err(PasswordError::Complexity)
        ));
        assert!(validate_password("Abcdef1!", "Abcdef1!").is_ok());
        assert!(matches!(
            validate_password("Abcdef1!", "Abcdef1?"),
            Err(PasswordError::Mismatch)
        ));
        assert!(matches!(validate_password("Ab1!", "Ab1!"), Err(PasswordError::Complexity)));
        assert!(matches!(validate_password("", ""), Err(PasswordError::Missing)));
    }

    #[test]
    fn test_changed_password_is_hashed() {
        let (gate, _) = gate();
        gate.change_password("Abcdef1!", "Abcdef1!").unwrap();
        assert!(!gate.is_default_password().unwrap());
        assert!(matches!(gate.login("admin", "admin"), Err(LoginError::InvalidCredentials)));
        let ok = gate.login("admin", "Abcdef1!").unwrap();
        assert_eq!(ok.redirect(), "/");
    }

    #[test]
    fn test_admin_change_checks_current() {
        let (gate, _) = gate();
        assert!(matches!(
            gate.change_admin_password("nope", "Abcdef1!", "Abcdef1!"),
            Err(PasswordError::IncorrectCurrent)
        ));
        gate.change_admin_password("admin", "Abcdef1!", "Abcdef1!").unwrap();
        assert!(matches!(
            gate.change_admin_password("Abcdef1!", "Xyzabc2?", "Xyzabc2!"),
            Err(PasswordError::Mismatch)
        ));
        gate.change_admin_password("Abcdef1!", "Xyzabc2?", "Xyzabc2?").unwrap();
        assert!(gate.login("admin", "Xyzabc2?").is_ok());
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
