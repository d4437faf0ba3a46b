use lazy_static::lazy_static;
use serde_json::json;
use time::format_description::well_known::Rfc3339;
use tracing::{info, warn};

use super::password::{hash_password, verify_password};
use super::repo::StoreError;
use super::repo_types::{NewUser, Scope, User};
use super::tokens::{issue_token, validate_token_plaintext, Token};
use crate::error::AppError;
use crate::mailer::{MailJob, Template};
use crate::state::AppState;
use crate::validator::{validate_email, validate_name, validate_password_plaintext, Validator};

lazy_static! {
    // Verified against on unknown emails so both login failures cost one Argon2 run.
    static ref DUMMY_PASSWORD_HASH: Option<String> =
        hash_password("gatekeeper-dummy-password").ok();
}

/// Where a credential submission ends up.
#[derive(Debug)]
pub enum LoginOutcome {
    ActivationRequired,
    Authenticated(Token),
}

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Mail payload carrying an activation token.
pub(crate) fn activation_mail(user: &User, token: &Token, template: Template) -> MailJob {
    MailJob::new(
        user.email.clone(),
        template,
        json!({
            "activationToken": token.plaintext,
            "userID": user.id,
            "expiry": token.expiry.format(&Rfc3339).unwrap_or_default(),
        }),
    )
}

// Argon2 is CPU-bound; keep it off the async workers.
async fn hash_off_thread(plain: String) -> Result<String, AppError> {
    tokio::task::spawn_blocking(move || hash_password(&plain))
        .await
        .map_err(|e| AppError::ServerError(e.into()))?
        .map_err(AppError::from)
}

async fn verify_off_thread(plain: String, hash: String) -> Result<bool, AppError> {
    tokio::task::spawn_blocking(move || verify_password(&plain, &hash))
        .await
        .map_err(|e| AppError::ServerError(e.into()))?
        .map_err(AppError::from)
}

async fn verify_dummy_off_thread(plain: String) {
    let res = tokio::task::spawn_blocking(move || {
        if let Some(hash) = DUMMY_PASSWORD_HASH.as_deref() {
            let _ = verify_password(&plain, hash);
        }
    })
    .await;
    if let Err(e) = res {
        warn!(error = %e, "dummy password verification failed");
    }
}

/// Replaces the user's activation tokens and queues delivery of the new one.
async fn issue_activation(
    state: &AppState,
    user: &User,
    template: Template,
) -> Result<Token, AppError> {
    let token = issue_token(
        state.tokens.as_ref(),
        user.id,
        state.config.tokens.activation_ttl(),
        Scope::Activation,
    )
    .await?;
    state.mail.dispatch(activation_mail(user, &token, template));
    Ok(token)
}

/// Credentials → activation-required or a fresh authentication token.
///
/// Unknown email and wrong password both yield `InvalidCredentials`.
pub async fn login(state: &AppState, email: &str, password: &str) -> Result<LoginOutcome, AppError> {
    let email = normalize_email(email);
    let mut v = Validator::new();
    validate_email(&mut v, &email);
    validate_password_plaintext(&mut v, password);
    v.finish()?;

    let user = match state.users.get_by_email(&email).await {
        Ok(u) => u,
        Err(StoreError::NotFound) => {
            verify_dummy_off_thread(password.to_string()).await;
            warn!(email = %email, "login unknown email");
            return Err(AppError::InvalidCredentials);
        }
        Err(e) => return Err(e.into()),
    };

    if !user.activated {
        issue_activation(state, &user, Template::Activation).await?;
        info!(user_id = %user.id, "login deferred, activation token reissued");
        return Ok(LoginOutcome::ActivationRequired);
    }

    if !verify_off_thread(password.to_string(), user.password_hash.clone()).await? {
        warn!(user_id = %user.id, "login invalid password");
        return Err(AppError::InvalidCredentials);
    }

    let token = issue_token(
        state.tokens.as_ref(),
        user.id,
        state.config.tokens.authentication_ttl(),
        Scope::Authentication,
    )
    .await?;
    info!(user_id = %user.id, "user logged in");
    Ok(LoginOutcome::Authenticated(token))
}

pub async fn register(
    state: &AppState,
    name: &str,
    surname: &str,
    email: &str,
    password: &str,
) -> Result<User, AppError> {
    let email = normalize_email(email);
    let mut v = Validator::new();
    validate_name(&mut v, "name", name);
    validate_name(&mut v, "surname", surname);
    validate_email(&mut v, &email);
    validate_password_plaintext(&mut v, password);
    v.finish()?;

    let password_hash = hash_off_thread(password.to_string()).await?;
    if password_hash.is_empty() {
        return Err(AppError::ServerError(anyhow::anyhow!("empty password hash")));
    }

    let user = state
        .users
        .insert(NewUser {
            name: name.trim().to_string(),
            surname: surname.trim().to_string(),
            email,
            password_hash,
            role: "user".into(),
        })
        .await?;

    issue_activation(state, &user, Template::Welcome).await?;
    info!(user_id = %user.id, "user registered");
    Ok(user)
}

/// Marks the token's owner activated and burns their activation tokens.
pub async fn activate(state: &AppState, plaintext: &str) -> Result<User, AppError> {
    let mut v = Validator::new();
    validate_token_plaintext(&mut v, "token", plaintext);
    v.finish()?;

    let mut user = match state.tokens.lookup_user(Scope::Activation, plaintext).await {
        Ok(u) => u,
        Err(StoreError::NotFound) => {
            return Err(AppError::field("token", "invalid or expired activation token"))
        }
        Err(e) => return Err(e.into()),
    };

    user.activated = true;
    state
        .users
        .update_revoking(&mut user, Scope::Activation)
        .await?;
    info!(user_id = %user.id, "user activated");
    Ok(user)
}

/// Applies a profile edit on top of the `version` the client last saw.
pub async fn update_profile(
    state: &AppState,
    mut user: User,
    name: Option<&str>,
    surname: Option<&str>,
    version: i32,
) -> Result<User, AppError> {
    let mut v = Validator::new();
    if let Some(name) = name {
        validate_name(&mut v, "name", name);
    }
    if let Some(surname) = surname {
        validate_name(&mut v, "surname", surname);
    }
    v.finish()?;

    if let Some(name) = name {
        user.name = name.trim().to_string();
    }
    if let Some(surname) = surname {
        user.surname = surname.trim().to_string();
    }
    user.version = version;
    state.users.update(&mut user).await?;
    info!(user_id = %user.id, version = user.version, "profile updated");
    Ok(user)
}

pub async fn resend_activation(state: &AppState, email: &str) -> Result<(), AppError> {
    let email = normalize_email(email);
    let mut v = Validator::new();
    validate_email(&mut v, &email);
    v.finish()?;

    let user = match state.users.get_by_email(&email).await {
        Ok(u) => u,
        Err(StoreError::NotFound) => {
            return Err(AppError::field("email", "no matching email address found"))
        }
        Err(e) => return Err(e.into()),
    };
    if user.activated {
        return Err(AppError::field("email", "user has already been activated"));
    }

    issue_activation(state, &user, Template::Activation).await?;
    info!(user_id = %user.id, "activation token resent");
    Ok(())
}

pub async fn logout(state: &AppState, user: &User) -> Result<(), AppError> {
    state
        .tokens
        .delete_all_for_scope(Scope::Authentication, user.id)
        .await?;
    info!(user_id = %user.id, "user logged out");
    Ok(())
}

pub async fn delete_account(state: &AppState, user: &User) -> Result<(), AppError> {
    state.tokens.delete_all_for_user(user.id).await?;
    state.users.delete(user.id).await?;
    info!(user_id = %user.id, "account deleted");
    Ok(())
}
