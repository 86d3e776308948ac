use crate::error::AccessError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    Allow,
    Deny,
}

impl RuleType {
    pub fn as_db(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw {
            "deny" => Self::Deny,
            _ => Self::Allow,
        }
    }
}

/// A persisted firewall rule. `instance_name = None` is a global rule.
#[derive(Debug, Clone, Serialize)]
pub struct AccessRule {
    pub id: i64,
    pub rule_type: RuleType,
    pub phone_number: String,
    pub instance_name: Option<String>,
    pub label: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewRule<'a> {
    pub rule_type: RuleType,
    pub phone_number: &'a str,
    pub instance_name: Option<&'a str>,
    pub label: Option<&'a str>,
}

#[derive(Debug, Clone, Default)]
pub struct RuleFilter {
    pub rule_type: Option<RuleType>,
    pub instance_name: Option<String>,
}

/// Insert a rule; an existing `(rule_type, pattern, instance)` tuple returns
/// the existing id instead of erroring.
pub(super) async fn insert(pool: &SqlitePool, new: &NewRule<'_>) -> Result<i64, AccessError> {
    let pattern = new.phone_number.trim();
    if pattern.is_empty() {
        return Err(AccessError::InvalidPattern("empty pattern".into()));
    }
    let stem = pattern.strip_suffix('*').unwrap_or(pattern);
    if stem.contains('*') {
        return Err(AccessError::InvalidPattern(format!(
            "{pattern}: only a trailing * wildcard is supported"
        )));
    }

    let existing: Option<(i64,)> = sqlx::query_as(
        "SELECT id FROM access_rules
         WHERE rule_type = ? AND phone_number = ?
           AND coalesce(instance_name, '') = coalesce(?, '')",
    )
    .bind(new.rule_type.as_db())
    .bind(pattern)
    .bind(new.instance_name)
    .fetch_optional(pool)
    .await?;

    if let Some((id,)) = existing {
        return Ok(id);
    }

    let result = sqlx::query(
        "INSERT INTO access_rules
            (rule_type, phone_number, instance_name, label, is_active, created_at)
         VALUES (?, ?, ?, ?, 1, ?)",
    )
    .bind(new.rule_type.as_db())
    .bind(pattern)
    .bind(new.instance_name)
    .bind(new.label)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;

    Ok(result.last_insert_rowid())
}

pub(super) async fn delete(pool: &SqlitePool, id: i64) -> Result<(), AccessError> {
    let result = sqlx::query("DELETE FROM access_rules WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(AccessError::RuleNotFound(id));
    }
    Ok(())
}

pub(super) async fn list_active(pool: &SqlitePool) -> Result<Vec<AccessRule>, AccessError> {
    let rows = sqlx::query("SELECT * FROM access_rules WHERE is_active = 1 ORDER BY id")
        .fetch_all(pool)
        .await?;
    rows.iter().map(row_to_rule).collect()
}

pub(super) async fn list(
    pool: &SqlitePool,
    filter: &RuleFilter,
) -> Result<Vec<AccessRule>, AccessError> {
    let mut builder = sqlx::QueryBuilder::new("SELECT * FROM access_rules WHERE 1=1");
    if let Some(rule_type) = filter.rule_type {
        builder.push(" AND rule_type = ").push_bind(rule_type.as_db());
    }
    if let Some(instance) = &filter.instance_name {
        builder
            .push(" AND instance_name = ")
            .push_bind(instance.clone());
    }
    builder.push(" ORDER BY id");

    let rows = builder.build().fetch_all(pool).await?;
    rows.iter().map(row_to_rule).collect()
}

fn row_to_rule(row: &SqliteRow) -> Result<AccessRule, AccessError> {
    let created_raw: String = row.get("created_at");
    let created_at = DateTime::parse_from_rfc3339(&created_raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());

    Ok(AccessRule {
        id: row.get("id"),
        rule_type: RuleType::from_db(&row.get::<String, _>("rule_type")),
        phone_number: row.get("phone_number"),
        instance_name: row.get("instance_name"),
        label: row.get("label"),
        is_active: row.get("is_active"),
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_test_pool;

    #[tokio::test]
    async fn interior_wildcard_is_rejected() {
        let pool = open_test_pool().await.unwrap();
        let err = insert(
            &pool,
            &NewRule {
                rule_type: RuleType::Deny,
                phone_number: "55*99",
                instance_name: None,
                label: None,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AccessError::InvalidPattern(_)));
    }

    #[tokio::test]
    async fn trailing_wildcard_is_accepted() {
        let pool = open_test_pool().await.unwrap();
        let id = insert(
            &pool,
            &NewRule {
                rule_type: RuleType::Deny,
                phone_number: "5511*",
                instance_name: None,
                label: Some("spam block"),
            },
        )
        .await
        .unwrap();
        assert!(id > 0);
    }

    #[tokio::test]
    async fn same_pattern_different_type_is_distinct() {
        let pool = open_test_pool().await.unwrap();
        let deny = insert(
            &pool,
            &NewRule {
                rule_type: RuleType::Deny,
                phone_number: "1234",
                instance_name: None,
                label: None,
            },
        )
        .await
        .unwrap();
        let allow = insert(
            &pool,
            &NewRule {
                rule_type: RuleType::Allow,
                phone_number: "1234",
                instance_name: None,
                label: None,
            },
        )
        .await
        .unwrap();
        assert_ne!(deny, allow);
    }

    #[tokio::test]
    async fn list_filters_by_type() {
        let pool = open_test_pool().await.unwrap();
        for (rule_type, pattern) in [(RuleType::Allow, "1"), (RuleType::Deny, "2")] {
            insert(
                &pool,
                &NewRule {
                    rule_type,
                    phone_number: pattern,
                    instance_name: None,
                    label: None,
                },
            )
            .await
            .unwrap();
        }

        let denies = list(
            &pool,
            &RuleFilter {
                rule_type: Some(RuleType::Deny),
                instance_name: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(denies.len(), 1);
        assert_eq!(denies[0].phone_number, "2");
    }
}
