use super::error::ApiError;
use super::AppState;
use crate::access::{NewRule, RuleFilter, RuleType};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::Deserialize;

#[derive(Deserialize, Default)]
pub struct ListQuery {
    pub list_type: Option<String>,
    pub instance_name: Option<String>,
}

/// GET /access-control: rule listing with optional type/instance filter.
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let rule_type = query
        .list_type
        .as_deref()
        .map(parse_list_type)
        .transpose()?;

    let rules = state
        .access
        .list_rules(
            &state.pool,
            &RuleFilter {
                rule_type,
                instance_name: query.instance_name,
            },
        )
        .await?;
    Ok(Json(serde_json::json!({ "rules": rules })))
}

#[derive(Deserialize)]
pub struct AddRuleBody {
    pub phone_number: String,
    pub instance_name: Option<String>,
    pub label: Option<String>,
}

/// POST /access-control/{allow|deny}
pub async fn add(
    State(state): State<AppState>,
    Path(list_type): Path<String>,
    Json(body): Json<AddRuleBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let rule_type = parse_list_type(&list_type)?;

    if let Some(instance) = body.instance_name.as_deref() {
        if state.registry.get(instance).is_none() {
            return Err(ApiError::not_found(format!("instance {instance} not found")));
        }
    }

    let id = state
        .access
        .add_rule(
            &state.pool,
            NewRule {
                rule_type,
                phone_number: &body.phone_number,
                instance_name: body.instance_name.as_deref(),
                label: body.label.as_deref(),
            },
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "id": id,
            "rule_type": rule_type,
            "phone_number": body.phone_number,
            "instance_name": body.instance_name,
        })),
    ))
}

/// DELETE /access-control/rules/{id}
pub async fn remove(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.access.remove_rule(&state.pool, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn parse_list_type(raw: &str) -> Result<RuleType, ApiError> {
    match raw {
        "allow" => Ok(RuleType::Allow),
        "deny" => Ok(RuleType::Deny),
        other => Err(ApiError::bad_request(format!(
            "list_type must be allow or deny, got {other}"
        ))),
    }
}
