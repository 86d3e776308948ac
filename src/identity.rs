use crate::error::IdentityError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// A stable Automagik user shared by all channels.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: String,
    pub phone_number: Option<String>,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A channel-local identity linked to a [`User`].
#[derive(Debug, Clone, Serialize)]
pub struct ExternalId {
    pub id: i64,
    pub user_id: String,
    pub provider: String,
    pub external_id: String,
    pub instance_name: Option<String>,
}

/// Many-to-one mapping from channel identities to stable users.
///
/// Stateless over the connection pool; uniqueness of
/// `(provider, external_id, instance_name)` is enforced by the database.
pub struct IdentityService;

impl IdentityService {
    /// WhatsApp first-contact path: upsert a user by phone number. On
    /// creation, also link `(whatsapp, phone)` for the originating instance.
    pub async fn get_or_create_by_phone(
        pool: &SqlitePool,
        phone: &str,
        display_name: Option<&str>,
        instance: Option<&str>,
    ) -> Result<User, IdentityError> {
        if let Some(user) = Self::find_by_phone(pool, phone).await? {
            if let Some(name) = display_name {
                if user.display_name.as_deref() != Some(name) {
                    sqlx::query("UPDATE users SET display_name = ?, updated_at = ? WHERE id = ?")
                        .bind(name)
                        .bind(Utc::now().to_rfc3339())
                        .bind(&user.id)
                        .execute(pool)
                        .await?;
                }
            }
            return Ok(User {
                display_name: display_name
                    .map(str::to_string)
                    .or(user.display_name.clone()),
                ..user
            });
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let mut tx = pool.begin().await?;
        sqlx::query(
            "INSERT INTO users (id, phone_number, display_name, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(phone)
        .bind(display_name)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO user_external_ids
                (user_id, provider, external_id, instance_name, created_at)
             VALUES (?, 'whatsapp', ?, ?, ?)",
        )
        .bind(&id)
        .bind(phone)
        .bind(instance)
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::info!(user_id = %id, phone = %phone, "created user on first contact");

        Ok(User {
            id,
            phone_number: Some(phone.to_string()),
            display_name: display_name.map(str::to_string),
            created_at: now,
            updated_at: now,
        })
    }

    /// Resolve a channel identity to a user, if a link exists. Lookup order:
    /// exact `(provider, external_id, instance)`, then the instance-agnostic
    /// `(provider, external_id, NULL)` link.
    pub async fn resolve_external(
        pool: &SqlitePool,
        provider: &str,
        external_id: &str,
        instance: Option<&str>,
    ) -> Result<Option<User>, IdentityError> {
        if let Some(instance) = instance {
            let scoped: Option<(String,)> = sqlx::query_as(
                "SELECT user_id FROM user_external_ids
                 WHERE provider = ? AND external_id = ? AND instance_name = ?",
            )
            .bind(provider)
            .bind(external_id)
            .bind(instance)
            .fetch_optional(pool)
            .await?;

            if let Some((user_id,)) = scoped {
                return Self::get(pool, &user_id).await.map(Some);
            }
        }

        let global: Option<(String,)> = sqlx::query_as(
            "SELECT user_id FROM user_external_ids
             WHERE provider = ? AND external_id = ? AND instance_name IS NULL",
        )
        .bind(provider)
        .bind(external_id)
        .fetch_optional(pool)
        .await?;

        match global {
            Some((user_id,)) => Self::get(pool, &user_id).await.map(Some),
            None => Ok(None),
        }
    }

    /// Link a channel identity to a user. Idempotent for identical
    /// arguments; a tuple already linked to a *different* user fails with
    /// [`IdentityError::UniqueViolation`].
    pub async fn link_external(
        pool: &SqlitePool,
        user_id: &str,
        provider: &str,
        external_id: &str,
        instance: Option<&str>,
    ) -> Result<(), IdentityError> {
        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT user_id FROM user_external_ids
             WHERE provider = ? AND external_id = ?
               AND coalesce(instance_name, '') = coalesce(?, '')",
        )
        .bind(provider)
        .bind(external_id)
        .bind(instance)
        .fetch_optional(pool)
        .await?;

        if let Some((linked,)) = existing {
            if linked == user_id {
                return Ok(());
            }
            return Err(IdentityError::UniqueViolation {
                provider: provider.to_string(),
                external_id: external_id.to_string(),
            });
        }

        if Self::get_optional(pool, user_id).await?.is_none() {
            return Err(IdentityError::UserNotFound(user_id.to_string()));
        }

        sqlx::query(
            "INSERT INTO user_external_ids
                (user_id, provider, external_id, instance_name, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(provider)
        .bind(external_id)
        .bind(instance)
        .bind(Utc::now().to_rfc3339())
        .execute(pool)
        .await?;

        tracing::info!(user_id, provider, external_id, "linked external identity");
        Ok(())
    }

    pub async fn get(pool: &SqlitePool, user_id: &str) -> Result<User, IdentityError> {
        Self::get_optional(pool, user_id)
            .await?
            .ok_or_else(|| IdentityError::UserNotFound(user_id.to_string()))
    }

    pub async fn get_optional(
        pool: &SqlitePool,
        user_id: &str,
    ) -> Result<Option<User>, IdentityError> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(pool)
            .await?;
        row.map(|r| row_to_user(&r)).transpose()
    }

    pub async fn links_for(
        pool: &SqlitePool,
        user_id: &str,
    ) -> Result<Vec<ExternalId>, IdentityError> {
        let rows = sqlx::query("SELECT * FROM user_external_ids WHERE user_id = ? ORDER BY id")
            .bind(user_id)
            .fetch_all(pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| ExternalId {
                id: row.get("id"),
                user_id: row.get("user_id"),
                provider: row.get("provider"),
                external_id: row.get("external_id"),
                instance_name: row.get("instance_name"),
            })
            .collect())
    }

    async fn find_by_phone(
        pool: &SqlitePool,
        phone: &str,
    ) -> Result<Option<User>, IdentityError> {
        let row = sqlx::query("SELECT * FROM users WHERE phone_number = ?")
            .bind(phone)
            .fetch_optional(pool)
            .await?;
        row.map(|r| row_to_user(&r)).transpose()
    }
}

fn row_to_user(row: &SqliteRow) -> Result<User, IdentityError> {
    let parse = |raw: String| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now())
    };
    Ok(User {
        id: row.get("id"),
        phone_number: row.get("phone_number"),
        display_name: row.get("display_name"),
        created_at: parse(row.get("created_at")),
        updated_at: parse(row.get("updated_at")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_test_pool;

    #[tokio::test]
    async fn first_contact_creates_user_and_whatsapp_link() {
        let pool = open_test_pool().await.unwrap();
        let user =
            IdentityService::get_or_create_by_phone(&pool, "5511999", Some("Ana"), Some("acme"))
                .await
                .unwrap();

        assert_eq!(user.phone_number.as_deref(), Some("5511999"));

        let links = IdentityService::links_for(&pool, &user.id).await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].provider, "whatsapp");
        assert_eq!(links[0].external_id, "5511999");
        assert_eq!(links[0].instance_name.as_deref(), Some("acme"));
    }

    #[tokio::test]
    async fn second_contact_reuses_the_user() {
        let pool = open_test_pool().await.unwrap();
        let first = IdentityService::get_or_create_by_phone(&pool, "5511999", None, None)
            .await
            .unwrap();
        let second = IdentityService::get_or_create_by_phone(&pool, "5511999", Some("Ana"), None)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.display_name.as_deref(), Some("Ana"));
    }

    #[tokio::test]
    async fn resolve_prefers_instance_scoped_link() {
        let pool = open_test_pool().await.unwrap();
        let a = IdentityService::get_or_create_by_phone(&pool, "111", None, None)
            .await
            .unwrap();
        let b = IdentityService::get_or_create_by_phone(&pool, "222", None, None)
            .await
            .unwrap();

        IdentityService::link_external(&pool, &a.id, "discord", "42", None)
            .await
            .unwrap();
        IdentityService::link_external(&pool, &b.id, "discord", "42", Some("d1"))
            .await
            .unwrap();

        let scoped = IdentityService::resolve_external(&pool, "discord", "42", Some("d1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(scoped.id, b.id);

        let fallback = IdentityService::resolve_external(&pool, "discord", "42", Some("other"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fallback.id, a.id, "unknown instance falls back to the global link");
    }

    #[tokio::test]
    async fn resolve_unknown_returns_none() {
        let pool = open_test_pool().await.unwrap();
        let missing = IdentityService::resolve_external(&pool, "discord", "404", None)
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn link_is_idempotent_for_same_user() {
        let pool = open_test_pool().await.unwrap();
        let user = IdentityService::get_or_create_by_phone(&pool, "111", None, None)
            .await
            .unwrap();

        IdentityService::link_external(&pool, &user.id, "discord", "42", Some("d1"))
            .await
            .unwrap();
        IdentityService::link_external(&pool, &user.id, "discord", "42", Some("d1"))
            .await
            .unwrap();

        let links = IdentityService::links_for(&pool, &user.id).await.unwrap();
        assert_eq!(links.len(), 2, "whatsapp link + one discord link");
    }

    #[tokio::test]
    async fn link_collision_with_other_user_is_rejected() {
        let pool = open_test_pool().await.unwrap();
        let a = IdentityService::get_or_create_by_phone(&pool, "111", None, None)
            .await
            .unwrap();
        let b = IdentityService::get_or_create_by_phone(&pool, "222", None, None)
            .await
            .unwrap();

        IdentityService::link_external(&pool, &a.id, "discord", "42", None)
            .await
            .unwrap();
        let err = IdentityService::link_external(&pool, &b.id, "discord", "42", None)
            .await
            .unwrap_err();
        assert!(matches!(err, IdentityError::UniqueViolation { .. }));
    }

    #[tokio::test]
    async fn same_external_id_under_different_instances_is_permitted() {
        let pool = open_test_pool().await.unwrap();
        let a = IdentityService::get_or_create_by_phone(&pool, "111", None, None)
            .await
            .unwrap();
        let b = IdentityService::get_or_create_by_phone(&pool, "222", None, None)
            .await
            .unwrap();

        IdentityService::link_external(&pool, &a.id, "discord", "42", Some("d1"))
            .await
            .unwrap();
        IdentityService::link_external(&pool, &b.id, "discord", "42", Some("d2"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn link_to_missing_user_errors() {
        let pool = open_test_pool().await.unwrap();
        let err = IdentityService::link_external(&pool, "ghost", "discord", "42", None)
            .await
            .unwrap_err();
        assert!(matches!(err, IdentityError::UserNotFound(_)));
    }

    #[tokio::test]
    async fn deleting_user_cascades_links() {
        let pool = open_test_pool().await.unwrap();
        let user = IdentityService::get_or_create_by_phone(&pool, "111", None, None)
            .await
            .unwrap();

        sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(&user.id)
            .execute(&pool)
            .await
            .unwrap();

        let links = IdentityService::links_for(&pool, &user.id).await.unwrap();
        assert!(links.is_empty());
    }
}
