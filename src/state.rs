use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;

use crate::auth::repo::{PgTokenStore, PgUserStore, TokenStore, UserStore};
use crate::config::AppConfig;
use crate::mailer::{LogMailer, MailQueue, MailWorkers, Mailer, SmtpMailer};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub users: Arc<dyn UserStore>,
    pub tokens: Arc<dyn TokenStore>,
    pub mail: MailQueue,
}

impl AppState {
    /// Wires the Postgres stores and starts the mail workers.
    pub fn init(config: Arc<AppConfig>, db: PgPool) -> anyhow::Result<(Self, MailWorkers)> {
        let timeout = config.store_timeout();
        let users = Arc::new(PgUserStore::new(db.clone(), timeout)) as Arc<dyn UserStore>;
        let tokens = Arc::new(PgTokenStore::new(db, timeout)) as Arc<dyn TokenStore>;

        let mailer: Arc<dyn Mailer> = match &config.mailer.smtp_url {
            Some(url) => Arc::new(
                SmtpMailer::new(url, &config.mailer.from_address).context("configure smtp mailer")?,
            ),
            None => {
                tracing::warn!("SMTP_URL not set; outgoing mail will only be logged");
                Arc::new(LogMailer)
            }
        };
        let (mail, workers) = MailQueue::start(
            mailer,
            config.mailer.workers,
            config.mailer.queue_capacity,
        );

        Ok((Self::from_parts(config, users, tokens, mail), workers))
    }

    pub fn from_parts(
        config: Arc<AppConfig>,
        users: Arc<dyn UserStore>,
        tokens: Arc<dyn TokenStore>,
        mail: MailQueue,
    ) -> Self {
        Self {
            config,
            users,
            tokens,
            mail,
        }
    }
}
