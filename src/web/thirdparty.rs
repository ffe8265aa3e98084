use std::collections::HashMap;

use salvo::prelude::*;
use serde::Serialize;
use serde_json::json;

use crate::web::web_state;

#[derive(Debug, Clone, Serialize)]
pub struct ThirdPartyProtocol {
    pub user_fields: Vec<String>,
    pub location_fields: Vec<String>,
    pub field_types: HashMap<String, ThirdPartyFieldType>,
    pub instances: Vec<ThirdPartyInstance>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThirdPartyFieldType {
    #[serde(rename = "type")]
    pub field_type: String,
    pub placeholder: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThirdPartyInstance {
    pub network_id: String,
    pub bot_user_id: String,
    pub desc: String,
    pub icon: Option<String>,
    pub fields: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThirdPartyLocation {
    pub alias: String,
    pub protocol: String,
    pub fields: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThirdPartyUser {
    pub userid: String,
    pub protocol: String,
    pub fields: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThirdPartyNetwork {
    pub name: String,
    pub protocol: String,
    pub fields: HashMap<String, String>,
}

fn render_error(res: &mut Response, status: StatusCode, message: &str) {
    res.status_code(status);
    res.render(Json(json!({ "error": message })));
}

fn protocol_payload(bot_user_id: &str) -> ThirdPartyProtocol {
    let mut field_types = HashMap::new();
    field_types.insert(
        "team_id".to_string(),
        ThirdPartyFieldType {
            field_type: "text".to_string(),
            placeholder: "Slack team id".to_string(),
        },
    );
    field_types.insert(
        "channel_id".to_string(),
        ThirdPartyFieldType {
            field_type: "text".to_string(),
            placeholder: "Slack channel id".to_string(),
        },
    );
    field_types.insert(
        "userid".to_string(),
        ThirdPartyFieldType {
            field_type: "text".to_string(),
            placeholder: "Slack user id".to_string(),
        },
    );

    ThirdPartyProtocol {
        user_fields: vec!["userid".to_string()],
        location_fields: vec!["team_id".to_string(), "channel_id".to_string()],
        field_types,
        instances: vec![ThirdPartyInstance {
            network_id: "slack".to_string(),
            bot_user_id: bot_user_id.to_string(),
            desc: "Slack".to_string(),
            icon: None,
            fields: HashMap::new(),
        }],
    }
}

#[handler]
pub async fn get_protocol(res: &mut Response) {
    let matrix_client = &web_state().matrix_client;
    let bot_user_id = matrix_client.bot_user_id();
    res.render(Json(protocol_payload(&bot_user_id)));
}

async fn known_team_ids() -> Result<Vec<String>, crate::db::DatabaseError> {
    let logins = web_state().db_manager.user_login_store().get_all_logins().await?;
    let mut team_ids: Vec<String> = logins.into_iter().map(|l| l.team_id).collect();
    team_ids.sort();
    team_ids.dedup();
    Ok(team_ids)
}

#[handler]
pub async fn get_networks(res: &mut Response) {
    match known_team_ids().await {
        Ok(team_ids) => {
            let networks: Vec<ThirdPartyNetwork> = team_ids
                .into_iter()
                .map(|team_id| ThirdPartyNetwork {
                    name: team_id.clone(),
                    protocol: "slack".to_string(),
                    fields: HashMap::from([("team_id".to_string(), team_id)]),
                })
                .collect();
            res.render(Json(networks));
        }
        Err(err) => {
            render_error(res, StatusCode::INTERNAL_SERVER_ERROR, &format!("database error: {}", err));
        }
    }
}

#[handler]
pub async fn get_locations(req: &mut Request, res: &mut Response) {
    let team_filter = req.query::<String>("team_id");
    let channel_filter = req.query::<String>("channel_id");
    let domain = web_state().matrix_client.config().bridge.domain.clone();

    let team_ids = match &team_filter {
        Some(team_id) => vec![team_id.clone()],
        None => match known_team_ids().await {
            Ok(ids) => ids,
            Err(err) => {
                render_error(res, StatusCode::INTERNAL_SERVER_ERROR, &format!("database error: {}", err));
                return;
            }
        },
    };

    let mut locations = Vec::new();
    for team_id in team_ids {
        let portals = match web_state().db_manager.portal_store().get_portals_by_team(&team_id).await {
            Ok(p) => p,
            Err(err) => {
                render_error(res, StatusCode::INTERNAL_SERVER_ERROR, &format!("database error: {}", err));
                return;
            }
        };
        locations.extend(
            portals
                .into_iter()
                .filter(|p| channel_filter.as_ref().map(|c| &p.channel_id == c).unwrap_or(true))
                .map(|p| ThirdPartyLocation {
                    alias: format!("#_slack_{}:{}", p.channel_id, domain),
                    protocol: "slack".to_string(),
                    fields: HashMap::from([
                        ("team_id".to_string(), p.team_id),
                        ("channel_id".to_string(), p.channel_id),
                    ]),
                }),
        );
    }
    res.render(Json(locations));
}

/// Directory search with no filter isn't backed by a store query (ghosts
/// aren't enumerable without a team+staleness scope); an exact `userid`
/// (a ghost id, `team-slackuser`) resolves directly, anything else yields
/// an empty result rather than a full-table scan.
#[handler]
pub async fn get_users(req: &mut Request, res: &mut Response) {
    let domain = web_state().matrix_client.config().bridge.domain.clone();
    let user_filter = req
        .query::<String>("userid")
        .or_else(|| req.query::<String>("user_id"));

    let Some(ghost_id) = user_filter else {
        res.render(Json(Vec::<ThirdPartyUser>::new()));
        return;
    };

    match web_state().db_manager.ghost_store().get_ghost(&ghost_id).await {
        Ok(Some(ghost)) => {
            let user = ThirdPartyUser {
                userid: format!("@_slack_{}:{}", ghost.ghost_id, domain),
                protocol: "slack".to_string(),
                fields: HashMap::from([("userid".to_string(), ghost.ghost_id)]),
            };
            res.render(Json(vec![user]));
        }
        Ok(None) => {
            res.render(Json(Vec::<ThirdPartyUser>::new()));
        }
        Err(err) => {
            render_error(res, StatusCode::INTERNAL_SERVER_ERROR, &format!("database error: {}", err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::protocol_payload;

    #[test]
    fn protocol_payload_contains_expected_fields() {
        let payload = protocol_payload("@_slack_bot:example.org");
        assert!(!payload.user_fields.is_empty());
        assert!(!payload.location_fields.is_empty());
        assert_eq!(payload.instances[0].network_id, "slack");
    }
}
