//! Per-profile renewal, lookup and revocation

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use lk_core::config::RenewalPolicy;
use lk_core::{Profile, StoreError, Token, TokenStore};
use lk_exec::{
    parse_auth_response, parse_lookup_response, CaptureBuffer, Environment, ExecContext,
    ExecError, ExecutionResult, Executor, LookupInfo, ParseError,
};

use crate::token_state::{evaluate, RenewalDecision};

const RENEW_ARGS: &[&str] = &["token", "renew", "-format=json"];
const LOOKUP_ARGS: &[&str] = &["token", "lookup", "-format=json"];
const REVOKE_ARGS: &[&str] = &["token", "revoke", "-self"];

/// Longest error detail kept from the binary's output
const MAX_DETAIL: usize = 200;

/// Why a profile was skipped without running anything
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No stored token
    NotLoggedIn,
    /// The credential binary could not be found
    BinaryMissing,
}

/// Category of a failed renewal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Binary ran and exited non-zero
    ExitCode(i32),
    /// Binary could not be started or communicated with
    Execution,
    /// Call exceeded the operation timeout
    TimedOut,
    /// Renewed token could not be saved
    Store,
}

/// Result of one renewal cycle for one profile
#[derive(Debug, Clone, PartialEq)]
pub enum RenewalOutcome {
    NotDue,
    Skipped(SkipReason),
    Renewed {
        /// The server issued a different client token
        rotated: bool,
        expires_at: Option<DateTime<Utc>>,
    },
    /// Binary exited 0 but its output could not be parsed; the stored
    /// token is left as it was
    RenewedUnverified,
    Expired,
    /// Profile parameters failed validation
    Invalid(String),
    Failed {
        kind: FailureKind,
        message: String,
    },
    /// Shutdown interrupted the call
    Cancelled,
}

impl RenewalOutcome {
    /// Renewal went through (possibly unverified)
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            RenewalOutcome::Renewed { .. } | RenewalOutcome::RenewedUnverified
        )
    }

    /// Renewal was attempted and failed; feeds backoff
    pub fn is_failure(&self) -> bool {
        matches!(self, RenewalOutcome::Failed { .. })
    }

    /// Short machine-readable label
    pub fn label(&self) -> &'static str {
        match self {
            RenewalOutcome::NotDue => "not_due",
            RenewalOutcome::Skipped(SkipReason::NotLoggedIn) => "not_logged_in",
            RenewalOutcome::Skipped(SkipReason::BinaryMissing) => "binary_missing",
            RenewalOutcome::Renewed { .. } => "renewed",
            RenewalOutcome::RenewedUnverified => "renewed_unverified",
            RenewalOutcome::Expired => "expired",
            RenewalOutcome::Invalid(_) => "invalid",
            RenewalOutcome::Failed { .. } => "failed",
            RenewalOutcome::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RenewalOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenewalOutcome::NotDue => write!(f, "renewal not due"),
            RenewalOutcome::Skipped(SkipReason::NotLoggedIn) => write!(f, "not logged in"),
            RenewalOutcome::Skipped(SkipReason::BinaryMissing) => {
                write!(f, "credential binary not found")
            }
            RenewalOutcome::Renewed { rotated: true, .. } => write!(f, "renewed with a new token"),
            RenewalOutcome::Renewed { rotated: false, .. } => write!(f, "lease extended"),
            RenewalOutcome::RenewedUnverified => {
                write!(f, "renew reported success but the response was unreadable")
            }
            RenewalOutcome::Expired => write!(f, "token has expired, log in again"),
            RenewalOutcome::Invalid(reason) => write!(f, "invalid profile: {}", reason),
            RenewalOutcome::Failed { kind, message } => match kind {
                FailureKind::ExitCode(code) => write!(f, "renew exited with {}: {}", code, message),
                FailureKind::Execution => write!(f, "could not run renew: {}", message),
                FailureKind::TimedOut => write!(f, "renew timed out: {}", message),
                FailureKind::Store => write!(f, "could not save renewed token: {}", message),
            },
            RenewalOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Errors from explicit lookup and revoke operations
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("profile {0} is not logged in")]
    NotLoggedIn(String),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("command exited with {code}: {message}")]
    Exit { code: i32, message: String },

    #[error("unreadable response: {0}")]
    Parse(#[from] ParseError),

    #[error("token store: {0}")]
    Store(#[from] StoreError),
}

/// Runs credential operations for one profile at a time
pub struct RenewalEngine {
    executor: Executor,
    store: Arc<dyn TokenStore>,
    policy: RenewalPolicy,
    base_env: Environment,
}

impl RenewalEngine {
    /// Engine whose children inherit this process's environment
    pub fn new(executor: Executor, store: Arc<dyn TokenStore>, policy: RenewalPolicy) -> Self {
        Self {
            executor,
            store,
            policy,
            base_env: Environment::capture(),
        }
    }

    /// Replace the base environment children start from
    pub fn with_base_env(mut self, env: Environment) -> Self {
        self.base_env = env;
        self
    }

    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.store
    }

    pub fn policy(&self) -> &RenewalPolicy {
        &self.policy
    }

    /// Renew the profile's token if its lease calls for it
    pub async fn renew_if_needed(
        &self,
        profile: &Profile,
        cancel: &CancellationToken,
    ) -> RenewalOutcome {
        let token = match self.stored_token(profile) {
            Ok(Some(token)) => token,
            Ok(None) => return RenewalOutcome::Skipped(SkipReason::NotLoggedIn),
            Err(outcome) => return outcome,
        };

        match evaluate(&token, Utc::now(), &self.policy) {
            RenewalDecision::NotDue => RenewalOutcome::NotDue,
            RenewalDecision::Expired => RenewalOutcome::Expired,
            RenewalDecision::Due(reason) => {
                tracing::debug!(profile = %profile.name, ?reason, "Renewal due");
                self.renew(profile, &token, cancel).await
            }
        }
    }

    /// Renew the profile's token regardless of its lease
    pub async fn renew_now(&self, profile: &Profile, cancel: &CancellationToken) -> RenewalOutcome {
        match self.stored_token(profile) {
            Ok(Some(token)) => self.renew(profile, &token, cancel).await,
            Ok(None) => RenewalOutcome::Skipped(SkipReason::NotLoggedIn),
            Err(outcome) => outcome,
        }
    }

    /// Introspect the stored token
    pub async fn lookup(
        &self,
        profile: &Profile,
        cancel: &CancellationToken,
    ) -> Result<LookupInfo, EngineError> {
        let token = self
            .store
            .get(&profile.name)?
            .ok_or_else(|| EngineError::NotLoggedIn(profile.name.clone()))?;

        let capture = CaptureBuffer::new();
        let result = self
            .run(profile, &token, LOOKUP_ARGS, Some(&capture), cancel)
            .await;
        check_exit(result, &capture)?;

        Ok(parse_lookup_response(&capture.to_string_lossy())?)
    }

    /// Revoke the stored token and remove it from the store
    pub async fn revoke(
        &self,
        profile: &Profile,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let token = self
            .store
            .get(&profile.name)?
            .ok_or_else(|| EngineError::NotLoggedIn(profile.name.clone()))?;

        let capture = CaptureBuffer::new();
        let result = self
            .run(profile, &token, REVOKE_ARGS, Some(&capture), cancel)
            .await;
        check_exit(result, &capture)?;

        self.store.delete(&profile.name)?;
        tracing::info!(profile = %profile.name, "Token revoked");
        Ok(())
    }

    fn stored_token(&self, profile: &Profile) -> Result<Option<Token>, RenewalOutcome> {
        self.store.get(&profile.name).map_err(|e| {
            tracing::error!(profile = %profile.name, "Failed to read stored token: {}", e);
            RenewalOutcome::Failed {
                kind: FailureKind::Store,
                message: e.to_string(),
            }
        })
    }

    async fn run(
        &self,
        profile: &Profile,
        token: &Token,
        args: &[&str],
        capture: Option<&CaptureBuffer>,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let ctx = ExecContext::for_profile(profile, self.base_env.clone())
            .with_token(token.client_token.clone())
            .with_timeout(self.policy.operation_timeout)
            .with_cancel(cancel.child_token());
        self.executor.execute(&ctx, args, capture).await
    }

    async fn renew(
        &self,
        profile: &Profile,
        token: &Token,
        cancel: &CancellationToken,
    ) -> RenewalOutcome {
        let capture = CaptureBuffer::new();
        let result = self
            .run(profile, token, RENEW_ARGS, Some(&capture), cancel)
            .await;

        if let Some(err) = result.error {
            return outcome_for_exec_error(profile, err);
        }
        if result.exit_code != 0 {
            let message = error_detail(&capture);
            tracing::warn!(
                profile = %profile.name,
                exit_code = result.exit_code,
                "Token renewal rejected: {}",
                message
            );
            return RenewalOutcome::Failed {
                kind: FailureKind::ExitCode(result.exit_code),
                message,
            };
        }

        if capture.truncated() {
            tracing::warn!(
                profile = %profile.name,
                "Renew output exceeded {} bytes, the rest was dropped",
                capture.limit()
            );
        }
        let auth = match parse_auth_response(&capture.to_string_lossy()) {
            Ok(auth) => auth,
            Err(e) => {
                tracing::warn!(
                    profile = %profile.name,
                    "Renew succeeded but its response could not be parsed: {}",
                    e
                );
                return RenewalOutcome::RenewedUnverified;
            }
        };

        let renewed = merge_renewed(token, auth.into_token(Utc::now()));
        let rotated = renewed.client_token != token.client_token;
        let expires_at = renewed.expires_at;

        if let Err(e) = self.store.set(&profile.name, &renewed) {
            tracing::error!(profile = %profile.name, "Failed to store renewed token: {}", e);
            return RenewalOutcome::Failed {
                kind: FailureKind::Store,
                message: e.to_string(),
            };
        }

        tracing::info!(
            profile = %profile.name,
            rotated,
            lease_secs = renewed.lease_duration,
            "Token renewed"
        );
        RenewalOutcome::Renewed {
            rotated,
            expires_at,
        }
    }
}

/// Renew responses can omit identity fields; keep what the store knew
fn merge_renewed(previous: &Token, mut renewed: Token) -> Token {
    if renewed.accessor.is_empty() {
        renewed.accessor = previous.accessor.clone();
    }
    if renewed.policies.is_empty() {
        renewed.policies = previous.policies.clone();
    }
    if renewed.entity_id.is_empty() {
        renewed.entity_id = previous.entity_id.clone();
    }
    renewed
}

fn outcome_for_exec_error(profile: &Profile, err: ExecError) -> RenewalOutcome {
    match err {
        ExecError::Validation(e) => {
            tracing::debug!(profile = %profile.name, "Profile failed validation: {}", e);
            RenewalOutcome::Invalid(e.to_string())
        }
        ExecError::BinaryNotFound { binary } => {
            tracing::debug!(profile = %profile.name, "Credential binary {:?} not found", binary);
            RenewalOutcome::Skipped(SkipReason::BinaryMissing)
        }
        ExecError::Cancelled => RenewalOutcome::Cancelled,
        ExecError::TimedOut(after) => {
            tracing::warn!(profile = %profile.name, "Renewal timed out after {:?}", after);
            RenewalOutcome::Failed {
                kind: FailureKind::TimedOut,
                message: format!("no exit after {:?}", after),
            }
        }
        other => {
            tracing::error!(profile = %profile.name, "Could not run credential binary: {}", other);
            RenewalOutcome::Failed {
                kind: FailureKind::Execution,
                message: other.to_string(),
            }
        }
    }
}

fn check_exit(result: ExecutionResult, capture: &CaptureBuffer) -> Result<(), EngineError> {
    let code = result.into_result()?;
    if code != 0 {
        return Err(EngineError::Exit {
            code,
            message: error_detail(capture),
        });
    }
    Ok(())
}

/// First non-empty line of the output, bounded
fn error_detail(capture: &CaptureBuffer) -> String {
    let output = capture.to_string_lossy();
    let line = output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("no output");
    line.chars().take(MAX_DETAIL).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use lk_core::MemoryTokenStore;
    use lk_exec::{ExecutorConfig, OutputSink, Script, ScriptedRunner};
    use std::time::Duration;

    const RENEWED: &str = "{\"auth\":{\"client_token\":\"s.new\",\"accessor\":\"acc2\",\"lease_duration\":3600,\"renewable\":true}}";

    struct Fixture {
        engine: RenewalEngine,
        runner: ScriptedRunner,
        store: Arc<MemoryTokenStore>,
        profile: Profile,
    }

    fn fixture() -> Fixture {
        let runner = ScriptedRunner::new().with_binary("vault", "/usr/bin/vault");
        let store = Arc::new(MemoryTokenStore::new());
        let executor = Executor::with_runner(
            Arc::new(runner.clone()),
            ExecutorConfig {
                stdout: OutputSink::Discard,
                stderr: OutputSink::Discard,
                kill_grace: Duration::from_millis(20),
                forward_signals: false,
                ..ExecutorConfig::default()
            },
        );
        let engine = RenewalEngine::new(executor, store.clone(), RenewalPolicy::default())
            .with_base_env(Environment::empty());
        Fixture {
            engine,
            runner,
            store,
            profile: Profile::new("dev", "http://127.0.0.1:8200"),
        }
    }

    /// Token with `ttl_secs` left of a one hour lease
    fn token_with_ttl(client_token: &str, ttl_secs: i64) -> Token {
        let issued = Utc::now() - TimeDelta::seconds(3600 - ttl_secs);
        let mut token = Token::issued(client_token, 3600, true, issued);
        token.accessor = "acc1".to_string();
        token.policies = vec!["default".to_string()];
        token
    }

    #[tokio::test]
    async fn test_not_logged_in_is_silent_skip() {
        let f = fixture();
        let outcome = f
            .engine
            .renew_if_needed(&f.profile, &CancellationToken::new())
            .await;
        assert_eq!(outcome, RenewalOutcome::Skipped(SkipReason::NotLoggedIn));
        assert_eq!(f.runner.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_not_due_does_not_spawn() {
        let f = fixture();
        f.store.set("dev", &token_with_ttl("s.old", 3000)).unwrap();
        let outcome = f
            .engine
            .renew_if_needed(&f.profile, &CancellationToken::new())
            .await;
        assert_eq!(outcome, RenewalOutcome::NotDue);
        assert_eq!(f.runner.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_expired_is_not_renewed() {
        let f = fixture();
        f.store.set("dev", &token_with_ttl("s.old", -10)).unwrap();
        let outcome = f
            .engine
            .renew_if_needed(&f.profile, &CancellationToken::new())
            .await;
        assert_eq!(outcome, RenewalOutcome::Expired);
        assert_eq!(f.runner.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_rotation_replaces_stored_token() {
        let f = fixture();
        f.store.set("dev", &token_with_ttl("s.old", 120)).unwrap();
        f.runner
            .push(Script::success(format!("WARNING! proxy set\n{}", RENEWED)));

        let outcome = f
            .engine
            .renew_if_needed(&f.profile, &CancellationToken::new())
            .await;
        assert!(matches!(outcome, RenewalOutcome::Renewed { rotated: true, .. }));

        let calls = f.runner.invocations();
        assert_eq!(calls[0].args, vec!["token", "renew", "-format=json"]);
        assert_eq!(calls[0].env.get("VAULT_TOKEN").unwrap(), "s.old");

        let stored = f.store.get("dev").unwrap().unwrap();
        assert_eq!(stored.client_token, "s.new");
        assert_eq!(stored.accessor, "acc2");
        assert_eq!(stored.policies, vec!["default"]);
        assert!(stored.ttl_at(Utc::now()).unwrap() > TimeDelta::seconds(3500));
    }

    #[tokio::test]
    async fn test_renew_in_place_refreshes_expiry() {
        let f = fixture();
        f.store.set("dev", &token_with_ttl("s.same", 120)).unwrap();
        f.runner.push(Script::success(
            "{\"auth\":{\"client_token\":\"s.same\",\"lease_duration\":3600,\"renewable\":true}}",
        ));

        let outcome = f
            .engine
            .renew_if_needed(&f.profile, &CancellationToken::new())
            .await;
        assert!(matches!(outcome, RenewalOutcome::Renewed { rotated: false, .. }));
        let stored = f.store.get("dev").unwrap().unwrap();
        assert_eq!(stored.client_token, "s.same");
        assert_eq!(stored.accessor, "acc1");
        assert!(stored.ttl_at(Utc::now()).unwrap() > TimeDelta::seconds(3500));
    }

    #[tokio::test]
    async fn test_nonzero_exit_leaves_store_untouched() {
        let f = fixture();
        let original = token_with_ttl("s.old", 120);
        f.store.set("dev", &original).unwrap();
        f.runner
            .push(Script::exit(2).with_stderr("\nError renewing token: permission denied\n"));

        let outcome = f
            .engine
            .renew_if_needed(&f.profile, &CancellationToken::new())
            .await;
        assert_eq!(
            outcome,
            RenewalOutcome::Failed {
                kind: FailureKind::ExitCode(2),
                message: "Error renewing token: permission denied".to_string(),
            }
        );
        assert!(outcome.is_failure());
        assert_eq!(f.store.get("dev").unwrap().unwrap(), original);
    }

    #[tokio::test]
    async fn test_unparseable_success_is_unverified() {
        let f = fixture();
        let original = token_with_ttl("s.old", 120);
        f.store.set("dev", &original).unwrap();
        f.runner.push(Script::success("Success! Renewed."));

        let outcome = f
            .engine
            .renew_if_needed(&f.profile, &CancellationToken::new())
            .await;
        assert_eq!(outcome, RenewalOutcome::RenewedUnverified);
        assert!(outcome.is_success());
        assert_eq!(f.store.get("dev").unwrap().unwrap(), original);
    }

    #[tokio::test]
    async fn test_exec_error_categories() {
        let f = fixture();
        f.store.set("dev", &token_with_ttl("s.old", 120)).unwrap();

        f.runner.push(Script::spawn_failure());
        let outcome = f
            .engine
            .renew_if_needed(&f.profile, &CancellationToken::new())
            .await;
        assert!(matches!(
            outcome,
            RenewalOutcome::Failed {
                kind: FailureKind::Execution,
                ..
            }
        ));

        let mut missing = f.profile.clone();
        missing.binary = Some("bao-not-installed".to_string());
        let outcome = f
            .engine
            .renew_if_needed(&missing, &CancellationToken::new())
            .await;
        assert_eq!(outcome, RenewalOutcome::Skipped(SkipReason::BinaryMissing));

        let mut invalid = f.profile.clone();
        invalid.address = "ftp://server".to_string();
        let outcome = f
            .engine
            .renew_if_needed(&invalid, &CancellationToken::new())
            .await;
        assert!(matches!(outcome, RenewalOutcome::Invalid(_)));
        assert!(!outcome.is_failure());
    }

    #[tokio::test]
    async fn test_cancelled_renewal() {
        let f = fixture();
        f.store.set("dev", &token_with_ttl("s.old", 120)).unwrap();
        f.runner.push(Script::hang());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let outcome = f.engine.renew_if_needed(&f.profile, &cancel).await;
        assert_eq!(outcome, RenewalOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_renew_now_ignores_decision() {
        let f = fixture();
        f.store.set("dev", &token_with_ttl("s.old", 3500)).unwrap();
        f.runner.push(Script::success(RENEWED));
        let outcome = f.engine.renew_now(&f.profile, &CancellationToken::new()).await;
        assert!(matches!(outcome, RenewalOutcome::Renewed { rotated: true, .. }));
        assert_eq!(f.runner.spawn_count(), 1);
    }

    #[tokio::test]
    async fn test_lookup() {
        let f = fixture();
        f.store.set("dev", &token_with_ttl("s.old", 3000)).unwrap();
        f.runner.push(Script::success(
            "{\"data\":{\"id\":\"s.old\",\"display_name\":\"token\",\"ttl\":3000,\"path\":\"auth/token/create\"}}",
        ));

        let info = f
            .engine
            .lookup(&f.profile, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(info.ttl, 3000);
        assert_eq!(info.path, "auth/token/create");
        assert_eq!(f.runner.invocations()[0].args, vec!["token", "lookup", "-format=json"]);
    }

    #[tokio::test]
    async fn test_revoke_deletes_only_on_success() {
        let f = fixture();
        f.store.set("dev", &token_with_ttl("s.old", 3000)).unwrap();

        f.runner.push(Script::exit(2).with_stderr("Error revoking token: 403"));
        let err = f
            .engine
            .revoke(&f.profile, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Exit { code: 2, .. }));
        assert!(f.store.get("dev").unwrap().is_some());

        f.runner.push(Script::success("Success! Revoked token (if it existed)"));
        f.engine
            .revoke(&f.profile, &CancellationToken::new())
            .await
            .unwrap();
        assert!(f.store.get("dev").unwrap().is_none());
        assert_eq!(f.runner.invocations()[1].args, vec!["token", "revoke", "-self"]);

        let err = f
            .engine
            .revoke(&f.profile, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotLoggedIn(_)));
    }
}
