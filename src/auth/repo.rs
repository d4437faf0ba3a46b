use std::future::Future;
use std::time::Duration;

use axum::async_trait;
use sqlx::{PgExecutor, PgPool};
use time::OffsetDateTime;
use thiserror::Error;
use uuid::Uuid;

use super::repo_types::{NewUser, Purge, Scope, User};
use super::tokens::{hash_token, Token};

const USER_COLUMNS: &str =
    "id, created_at, updated_at, name, surname, email, password_hash, role, activated, version";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("edit conflict")]
    EditConflict,
    #[error("duplicate email")]
    DuplicateEmail,
    #[error("store operation timed out")]
    Timeout,
    #[error("database error: {0}")]
    Persistence(#[from] sqlx::Error),
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<User, StoreError>;
    async fn get_by_email(&self, email: &str) -> Result<User, StoreError>;
    async fn insert(&self, user: NewUser) -> Result<User, StoreError>;
    /// Persists `user` if its version is still current, bumping `user.version`.
    async fn update(&self, user: &mut User) -> Result<(), StoreError>;
    /// `update`, deleting the user's `scope` tokens in the same transaction.
    async fn update_revoking(&self, user: &mut User, scope: Scope) -> Result<(), StoreError>;
    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn insert(&self, token: &Token) -> Result<(), StoreError>;
    async fn delete_all_for_scope(&self, scope: Scope, user_id: Uuid) -> Result<(), StoreError>;
    async fn delete_expired(&self, user_id: Uuid) -> Result<(), StoreError>;
    async fn delete_all_for_user(&self, user_id: Uuid) -> Result<(), StoreError>;
    /// Purges then inserts `token` atomically. With `Purge::Expired` nothing is
    /// inserted while the user still holds a live token of the same scope, and
    /// `false` is returned.
    async fn replace(&self, token: &Token, purge: Purge) -> Result<bool, StoreError>;
    async fn lookup_user(&self, scope: Scope, plaintext: &str) -> Result<User, StoreError>;
    /// Unactivated users with no live activation token left but at least one expired.
    async fn list_unactivated_with_expired_token(&self) -> Result<Vec<User>, StoreError>;
}

/// Runs a store call under `budget`.
async fn bounded<T, F>(budget: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(budget, fut)
        .await
        .unwrap_or(Err(StoreError::Timeout))
}

fn map_unique_email(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        if db.constraint() == Some("users_email_key") {
            return StoreError::DuplicateEmail;
        }
    }
    StoreError::Persistence(e)
}

async fn write_user<'e, E>(
    exec: E,
    user: &User,
) -> Result<Option<(i32, OffsetDateTime)>, StoreError>
where
    E: PgExecutor<'e>,
{
    sqlx::query_as::<_, (i32, OffsetDateTime)>(
        r#"
        UPDATE users
           SET name = $1, surname = $2, email = $3, password_hash = $4,
               activated = $5, updated_at = now(), version = version + 1
         WHERE id = $6 AND version = $7
        RETURNING version, updated_at
        "#,
    )
    .bind(&user.name)
    .bind(&user.surname)
    .bind(&user.email)
    .bind(&user.password_hash)
    .bind(user.activated)
    .bind(user.id)
    .bind(user.version)
    .fetch_optional(exec)
    .await
    .map_err(map_unique_email)
}

#[derive(Clone)]
pub struct PgUserStore {
    db: PgPool,
    timeout: Duration,
}

impl PgUserStore {
    pub fn new(db: PgPool, timeout: Duration) -> Self {
        Self { db, timeout }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn get(&self, id: Uuid) -> Result<User, StoreError> {
        bounded(self.timeout, async {
            sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.db)
                .await?
                .ok_or(StoreError::NotFound)
        })
        .await
    }

    async fn get_by_email(&self, email: &str) -> Result<User, StoreError> {
        bounded(self.timeout, async {
            sqlx::query_as::<_, User>(&format!(
                "SELECT {USER_COLUMNS} FROM users WHERE email = $1"
            ))
            .bind(email)
            .fetch_optional(&self.db)
            .await?
            .ok_or(StoreError::NotFound)
        })
        .await
    }

    async fn insert(&self, user: NewUser) -> Result<User, StoreError> {
        bounded(self.timeout, async {
            sqlx::query_as::<_, User>(&format!(
                r#"
                INSERT INTO users (name, surname, email, password_hash, role)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING {USER_COLUMNS}
                "#
            ))
            .bind(&user.name)
            .bind(&user.surname)
            .bind(&user.email)
            .bind(&user.password_hash)
            .bind(&user.role)
            .fetch_one(&self.db)
            .await
            .map_err(map_unique_email)
        })
        .await
    }

    async fn update(&self, user: &mut User) -> Result<(), StoreError> {
        let current: &User = user;
        let row = bounded(self.timeout, write_user(&self.db, current)).await?;

        let (version, updated_at) = row.ok_or(StoreError::EditConflict)?;
        user.version = version;
        user.updated_at = updated_at;
        Ok(())
    }

    async fn update_revoking(&self, user: &mut User, scope: Scope) -> Result<(), StoreError> {
        let current: &User = user;
        let row = bounded(self.timeout, async {
            let mut tx = self.db.begin().await?;
            let row = write_user(&mut *tx, current).await?;
            if row.is_some() {
                sqlx::query("DELETE FROM tokens WHERE scope = $1 AND user_id = $2")
                    .bind(scope.as_str())
                    .bind(current.id)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
            }
            Ok::<_, StoreError>(row)
        })
        .await?;

        let (version, updated_at) = row.ok_or(StoreError::EditConflict)?;
        user.version = version;
        user.updated_at = updated_at;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        bounded(self.timeout, async {
            let res = sqlx::query("DELETE FROM users WHERE id = $1")
                .bind(id)
                .execute(&self.db)
                .await?;
            if res.rows_affected() == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
        .await
    }
}

#[derive(Clone)]
pub struct PgTokenStore {
    db: PgPool,
    timeout: Duration,
}

impl PgTokenStore {
    pub fn new(db: PgPool, timeout: Duration) -> Self {
        Self { db, timeout }
    }
}

#[async_trait]
impl TokenStore for PgTokenStore {
    async fn insert(&self, token: &Token) -> Result<(), StoreError> {
        bounded(self.timeout, async {
            sqlx::query(
                r#"
                INSERT INTO tokens (hash, user_id, scope, expiry, created_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(&token.hash)
            .bind(token.user_id)
            .bind(token.scope.as_str())
            .bind(token.expiry)
            .bind(token.created_at)
            .execute(&self.db)
            .await?;
            Ok::<_, StoreError>(())
        })
        .await
    }

    async fn delete_all_for_scope(&self, scope: Scope, user_id: Uuid) -> Result<(), StoreError> {
        bounded(self.timeout, async {
            sqlx::query("DELETE FROM tokens WHERE scope = $1 AND user_id = $2")
                .bind(scope.as_str())
                .bind(user_id)
                .execute(&self.db)
                .await?;
            Ok::<_, StoreError>(())
        })
        .await
    }

    async fn delete_expired(&self, user_id: Uuid) -> Result<(), StoreError> {
        bounded(self.timeout, async {
            sqlx::query("DELETE FROM tokens WHERE user_id = $1 AND expiry <= now()")
                .bind(user_id)
                .execute(&self.db)
                .await?;
            Ok::<_, StoreError>(())
        })
        .await
    }

    async fn delete_all_for_user(&self, user_id: Uuid) -> Result<(), StoreError> {
        bounded(self.timeout, async {
            sqlx::query("DELETE FROM tokens WHERE user_id = $1")
                .bind(user_id)
                .execute(&self.db)
                .await?;
            Ok::<_, StoreError>(())
        })
        .await
    }

    async fn replace(&self, token: &Token, purge: Purge) -> Result<bool, StoreError> {
        bounded(self.timeout, async {
            let mut tx = self.db.begin().await?;
            // Serializes replacements for the same user.
            sqlx::query("SELECT id FROM users WHERE id = $1 FOR UPDATE")
                .bind(token.user_id)
                .execute(&mut *tx)
                .await?;
            match purge {
                Purge::Scope => {
                    sqlx::query("DELETE FROM tokens WHERE scope = $1 AND user_id = $2")
                        .bind(token.scope.as_str())
                        .bind(token.user_id)
                        .execute(&mut *tx)
                        .await?;
                }
                Purge::Expired => {
                    sqlx::query("DELETE FROM tokens WHERE user_id = $1 AND expiry <= now()")
                        .bind(token.user_id)
                        .execute(&mut *tx)
                        .await?;
                    let live: bool = sqlx::query_scalar(
                        r#"
                        SELECT EXISTS (
                            SELECT 1 FROM tokens
                             WHERE user_id = $1 AND scope = $2 AND expiry > now()
                        )
                        "#,
                    )
                    .bind(token.user_id)
                    .bind(token.scope.as_str())
                    .fetch_one(&mut *tx)
                    .await?;
                    if live {
                        tx.commit().await?;
                        return Ok(false);
                    }
                }
            }
            sqlx::query(
                r#"
                INSERT INTO tokens (hash, user_id, scope, expiry, created_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(&token.hash)
            .bind(token.user_id)
            .bind(token.scope.as_str())
            .bind(token.expiry)
            .bind(token.created_at)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok::<_, StoreError>(true)
        })
        .await
    }

    async fn lookup_user(&self, scope: Scope, plaintext: &str) -> Result<User, StoreError> {
        let hash = hash_token(plaintext);
        bounded(self.timeout, async {
            sqlx::query_as::<_, User>(
                r#"
                SELECT u.id, u.created_at, u.updated_at, u.name, u.surname, u.email,
                       u.password_hash, u.role, u.activated, u.version
                  FROM users u
                  JOIN tokens t ON t.user_id = u.id
                 WHERE t.hash = $1
                   AND t.scope = $2
                   AND t.expiry > now()
                "#,
            )
            .bind(&hash)
            .bind(scope.as_str())
            .fetch_optional(&self.db)
            .await?
            .ok_or(StoreError::NotFound)
        })
        .await
    }

    async fn list_unactivated_with_expired_token(&self) -> Result<Vec<User>, StoreError> {
        bounded(self.timeout, async {
            let users = sqlx::query_as::<_, User>(
                r#"
                SELECT u.id, u.created_at, u.updated_at, u.name, u.surname, u.email,
                       u.password_hash, u.role, u.activated, u.version
                  FROM users u
                  JOIN tokens t ON t.user_id = u.id AND t.scope = 'activation'
                 WHERE u.activated = false
                 GROUP BY u.id
                HAVING MAX(t.expiry) <= now()
                "#,
            )
            .fetch_all(&self.db)
            .await?;
            Ok::<_, StoreError>(users)
        })
        .await
    }
}
