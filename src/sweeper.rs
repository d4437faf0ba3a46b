//! Background reissue of activation tokens for accounts that never activated.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::auth::repo::{StoreError, TokenStore};
use crate::auth::repo_types::{Purge, Scope};
use crate::auth::services::activation_mail;
use crate::auth::tokens::Token;
use crate::mailer::{MailQueue, Template};
use crate::state::AppState;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub reissued: usize,
    /// Users who got a live activation token after the listing ran.
    pub skipped: usize,
    pub failed: usize,
}

pub struct Sweeper {
    tokens: Arc<dyn TokenStore>,
    mail: MailQueue,
    interval: Duration,
    jitter: Duration,
    max_backoff: Duration,
    renewal_ttl: time::Duration,
}

impl Sweeper {
    pub fn from_state(state: &AppState) -> Self {
        let cfg = &state.config.sweeper;
        Self {
            tokens: Arc::clone(&state.tokens),
            mail: state.mail.clone(),
            interval: Duration::from_secs(cfg.interval_secs.max(1)),
            jitter: Duration::from_secs(cfg.jitter_secs),
            max_backoff: Duration::from_secs(cfg.max_backoff_secs.max(cfg.interval_secs)),
            renewal_ttl: state.config.tokens.renewal_ttl(),
        }
    }

    /// One pass. Only the initial listing can fail the pass; a failure for a
    /// single user is logged and counted.
    #[instrument(skip(self))]
    pub async fn sweep_once(&self) -> Result<SweepReport, StoreError> {
        let users = self.tokens.list_unactivated_with_expired_token().await?;
        let mut report = SweepReport::default();

        for user in users {
            let token = Token::generate(user.id, self.renewal_ttl, Scope::Activation);
            match self.tokens.replace(&token, Purge::Expired).await {
                Ok(true) => {
                    self.mail
                        .dispatch(activation_mail(&user, &token, Template::ActivationRenewal));
                    report.reissued += 1;
                }
                Ok(false) => {
                    debug!(user_id = %user.id, "live activation token appeared, skipping");
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(user_id = %user.id, error = %e, "activation reissue failed");
                    report.failed += 1;
                }
            }
        }

        if report.reissued + report.skipped + report.failed > 0 {
            info!(
                reissued = report.reissued,
                skipped = report.skipped,
                failed = report.failed,
                "sweep finished"
            );
        }
        Ok(report)
    }

    fn next_delay(&self, consecutive_failures: u32) -> Duration {
        let base = if consecutive_failures == 0 {
            self.interval
        } else {
            let factor = 1u32 << consecutive_failures.min(16);
            self.interval.saturating_mul(factor).min(self.max_backoff)
        };
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    /// Runs until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.interval, "sweeper started");
        let mut failures = 0u32;
        loop {
            let delay = self.next_delay(failures);
            debug!(?delay, "next sweep scheduled");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            match self.sweep_once().await {
                Ok(_) => failures = 0,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    error!(error = %e, failures, "sweep failed");
                }
            }
        }
        info!("sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::services::LoginOutcome;
    use crate::testing::{seed_user, Fixture, TEST_PASSWORD};
    use time::OffsetDateTime;

    async fn stale_activation(fx: &Fixture, email: &str) -> (crate::auth::repo_types::User, Token) {
        let user = seed_user(&fx.store, email, false).await;
        let old = Token::generate(user.id, time::Duration::minutes(-1), Scope::Activation);
        fx.state.tokens.insert(&old).await.unwrap();
        (user, old)
    }

    #[tokio::test]
    async fn reissues_one_token_for_stale_user() {
        let fx = Fixture::new();
        let (user, old) = stale_activation(&fx, "stale@example.com").await;
        let sweeper = Sweeper::from_state(&fx.state);

        let report = sweeper.sweep_once().await.unwrap();
        assert_eq!(report, SweepReport { reissued: 1, skipped: 0, failed: 0 });

        let expiries = fx.store.tokens_for(user.id, Scope::Activation);
        assert_eq!(expiries.len(), 1);
        let ttl = expiries[0] - OffsetDateTime::now_utc();
        assert!(ttl > time::Duration::minutes(59) && ttl <= time::Duration::minutes(60));

        assert!(fx
            .state
            .tokens
            .lookup_user(Scope::Activation, &old.plaintext)
            .await
            .is_err());

        let sent = fx.wait_for_mail(1).await;
        assert_eq!(sent[0].0, "stale@example.com");
        assert_eq!(sent[0].1, Template::ActivationRenewal);
        let fresh = sent[0].2["activationToken"].as_str().unwrap();
        let resolved = fx
            .state
            .tokens
            .lookup_user(Scope::Activation, fresh)
            .await
            .unwrap();
        assert_eq!(resolved.id, user.id);

        // Freshly reissued, so nothing to do on the next pass.
        assert_eq!(sweeper.sweep_once().await.unwrap(), SweepReport::default());
    }

    #[tokio::test]
    async fn user_with_live_token_is_left_alone() {
        let fx = Fixture::new();
        let (user, _) = stale_activation(&fx, "mixed@example.com").await;
        let live = Token::generate(user.id, time::Duration::hours(1), Scope::Activation);
        fx.state.tokens.insert(&live).await.unwrap();

        let report = Sweeper::from_state(&fx.state).sweep_once().await.unwrap();
        assert_eq!(report.reissued, 0);
    }

    #[tokio::test]
    async fn failure_for_one_user_does_not_stop_the_pass() {
        let fx = Fixture::new();
        let (broken, _) = stale_activation(&fx, "broken@example.com").await;
        let (healthy, _) = stale_activation(&fx, "healthy@example.com").await;
        fx.store.fail_writes_for(broken.id);

        let report = Sweeper::from_state(&fx.state).sweep_once().await.unwrap();
        assert_eq!(report, SweepReport { reissued: 1, skipped: 0, failed: 1 });

        let expiries = fx.store.tokens_for(healthy.id, Scope::Activation);
        assert_eq!(expiries.len(), 1);
        assert!(expiries[0] > OffsetDateTime::now_utc());
    }

    #[tokio::test]
    async fn login_between_listing_and_reissue_keeps_one_live_token() {
        let fx = Fixture::new();
        let (user, _) = stale_activation(&fx, "racer@example.com").await;
        fx.store.freeze_listing();

        let outcome = crate::auth::services::login(&fx.state, "racer@example.com", TEST_PASSWORD)
            .await
            .unwrap();
        assert!(matches!(outcome, LoginOutcome::ActivationRequired));
        fx.wait_for_mail(1).await;

        let report = Sweeper::from_state(&fx.state).sweep_once().await.unwrap();
        assert_eq!(report, SweepReport { reissued: 0, skipped: 1, failed: 0 });

        let expiries = fx.store.tokens_for(user.id, Scope::Activation);
        assert_eq!(expiries.len(), 1);
        assert!(expiries[0] - OffsetDateTime::now_utc() > time::Duration::hours(71));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fx
            .mailer
            .sent()
            .iter()
            .all(|(_, template, _)| *template != Template::ActivationRenewal));
    }

    #[tokio::test]
    async fn expired_purge_does_not_stack_on_a_live_token() {
        let fx = Fixture::new();
        let (user, _) = stale_activation(&fx, "stack@example.com").await;
        let live = Token::generate(user.id, time::Duration::hours(72), Scope::Activation);
        fx.state.tokens.replace(&live, Purge::Scope).await.unwrap();

        let renewal = Token::generate(user.id, time::Duration::hours(1), Scope::Activation);
        let inserted = fx.state.tokens.replace(&renewal, Purge::Expired).await.unwrap();
        assert!(!inserted);
        assert_eq!(fx.store.tokens_for(user.id, Scope::Activation).len(), 1);
        assert!(fx
            .state
            .tokens
            .lookup_user(Scope::Activation, &renewal.plaintext)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn listing_failure_fails_the_pass() {
        let fx = Fixture::new();
        stale_activation(&fx, "stale@example.com").await;
        fx.store.fail_listing();
        let err = Sweeper::from_state(&fx.state).sweep_once().await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout));
    }

    #[tokio::test]
    async fn backoff_grows_and_is_capped() {
        let fx = Fixture::new();
        let sweeper = Sweeper::from_state(&fx.state);
        assert_eq!(sweeper.next_delay(0), Duration::from_secs(60));
        assert_eq!(sweeper.next_delay(1), Duration::from_secs(120));
        assert_eq!(sweeper.next_delay(2), Duration::from_secs(240));
        assert_eq!(sweeper.next_delay(3), Duration::from_secs(300));
        assert_eq!(sweeper.next_delay(40), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn stops_on_shutdown() {
        let fx = Fixture::new();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Sweeper::from_state(&fx.state).run(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }
}
