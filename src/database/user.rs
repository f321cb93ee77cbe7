use crate::database::postgres_repository::PostgresRepository;
use crate::error::app_error::AppError;
use crate::models::user::{User, UserProfileResponse};
use crate::models::vip::VipStatus;
use argon2::Argon2;
use password_hash::rand_core::OsRng;
use password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use std::sync::LazyLock;
use uuid::Uuid;

/// A real Argon2 hash generated once, used as a timing decoy so that login
/// requests for unknown emails cost the same as requests for real accounts.
static DUMMY_HASH: LazyLock<Option<String>> = LazyLock::new(|| hash_password("dummy-never-matches").ok());

const USER_COLUMNS: &str = "id, name, email, password_hash, is_admin, created_at";

impl PostgresRepository {
    pub async fn create_user(&self, name: &str, email: &str, password: &str) -> Result<User, AppError> {
        let password_hash = hash_password(password)?;

        let query = format!(
            r#"
            INSERT INTO users (name, email, password_hash)
            VALUES ($1, $2, $3)
            RETURNING {USER_COLUMNS}
            "#
        );

        let user = sqlx::query_as::<_, User>(&query)
            .bind(name)
            .bind(email)
            .bind(&password_hash)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match AppError::from(e) {
                AppError::Conflict(_) => AppError::UserAlreadyExists(email.to_string()),
                other => other,
            })?;

        Ok(user)
    }

    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, AppError> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1");
        let user = sqlx::query_as::<_, User>(&query).bind(email).fetch_optional(&self.pool).await?;

        Ok(user)
    }

    pub async fn get_user_by_id(&self, id: &Uuid) -> Result<Option<User>, AppError> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let user = sqlx::query_as::<_, User>(&query).bind(id).fetch_optional(&self.pool).await?;

        Ok(user)
    }

    pub async fn is_admin(&self, id: &Uuid) -> Result<bool, AppError> {
        let is_admin = sqlx::query_scalar::<_, bool>("SELECT is_admin FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(is_admin.unwrap_or(false))
    }

    /// Profile plus the credit balance and VIP record redemptions write to.
    pub async fn get_user_profile(&self, id: &Uuid) -> Result<UserProfileResponse, AppError> {
        let user = self.get_user_by_id(id).await?.ok_or(AppError::UserNotFound)?;

        let credits = sqlx::query_scalar::<_, i64>("SELECT credits FROM users WHERE id = $1")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;

        let vip = sqlx::query_as::<_, VipStatus>("SELECT is_vip, vip_expire_date, vip_level FROM user_vip WHERE user_id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .unwrap_or_default();

        Ok(UserProfileResponse {
            id: user.id,
            name: user.name,
            email: user.email,
            credits,
            vip,
        })
    }

    pub fn verify_password(&self, user: &User, password: &str) -> Result<(), AppError> {
        let password_hash = PasswordHash::new(&user.password_hash).map_err(|e| AppError::password_hash("Failed to parse stored password hash", e))?;
        Argon2::default()
            .verify_password(password.as_bytes(), &password_hash)
            .map_err(|_| AppError::InvalidCredentials)?;

        Ok(())
    }

    /// Throwaway Argon2 verification so unknown accounts cannot be told apart
    /// from real ones by response latency.
    pub fn dummy_verify(password: &str) {
        if let Some(hash) = DUMMY_HASH.as_deref().and_then(|hash| PasswordHash::new(hash).ok()) {
            let _ = Argon2::default().verify_password(password.as_bytes(), &hash);
        }
    }

    /// Verifies the current password and updates it to the new one.
    pub async fn change_password(&self, user_id: &Uuid, current_password: &str, new_password: &str) -> Result<(), AppError> {
        let user = self.get_user_by_id(user_id).await?.ok_or(AppError::UserNotFound)?;
        self.verify_password(&user, current_password)
            .map_err(|_| AppError::BadRequest("Current password is incorrect".to_string()))?;

        let new_hash = hash_password(new_password)?;
        sqlx::query("UPDATE users SET password_hash = $1 WHERE id = $2")
            .bind(&new_hash)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

pub(crate) fn hash_password(password: &str) -> Result<String, AppError> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default().hash_password(password.as_bytes(), &salt)?;

    Ok(hash.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn user_with_password(password: &str) -> User {
        User {
            id: Uuid::new_v4(),
            name: "Reader".to_string(),
            email: "reader@example.com".to_string(),
            password_hash: hash_password(password).unwrap(),
            is_admin: false,
            created_at: Utc::now(),
        }
    }

    fn lazy_repository() -> PostgresRepository {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .unwrap();
        PostgresRepository::new(pool)
    }

    #[tokio::test]
    async fn verify_password_accepts_the_original() {
        let repo = lazy_repository();
        let user = user_with_password("correct horse battery staple");

        assert!(repo.verify_password(&user, "correct horse battery staple").is_ok());
        assert!(matches!(repo.verify_password(&user, "wrong"), Err(AppError::InvalidCredentials)));
    }

    #[test]
    fn hashes_are_salted() {
        let first = hash_password("same-password").unwrap();
        let second = hash_password("same-password").unwrap();
        assert_ne!(first, second);
        assert!(first.starts_with("$argon2"));
    }

    #[test]
    fn dummy_verify_does_not_panic() {
        PostgresRepository::dummy_verify("anything");
    }
}
