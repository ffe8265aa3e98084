use salvo::prelude::*;
use serde_json::json;

use crate::web::web_state;

fn render_error(res: &mut Response, status: StatusCode, message: &str) {
    res.status_code(status);
    res.render(Json(json!({ "error": message })));
}

/// Aggregates portals across every known team — there is no single
/// cross-team store query, so this fans out over `get_all_logins`'
/// distinct team ids.
async fn all_portals() -> Result<Vec<crate::db::Portal>, crate::db::DatabaseError> {
    let logins = web_state().db_manager.user_login_store().get_all_logins().await?;
    let mut team_ids: Vec<String> = logins.into_iter().map(|l| l.team_id).collect();
    team_ids.sort();
    team_ids.dedup();

    let mut portals = Vec::new();
    for team_id in team_ids {
        portals.extend(web_state().db_manager.portal_store().get_portals_by_team(&team_id).await?);
    }
    Ok(portals)
}

#[handler]
pub async fn list_rooms(req: &mut Request, res: &mut Response) {
    let limit = req.query::<usize>("limit").unwrap_or(100).clamp(1, 1000);
    let offset = req.query::<usize>("offset").unwrap_or(0);

    match all_portals().await {
        Ok(portals) => {
            let page: Vec<_> = portals.into_iter().skip(offset).take(limit).collect();
            res.render(Json(json!({
                "rooms": page,
                "count": page.len(),
                "limit": limit,
                "offset": offset,
            })));
        }
        Err(err) => {
            render_error(res, StatusCode::INTERNAL_SERVER_ERROR, &format!("database error: {}", err));
        }
    }
}

/// Matrix room → Slack channel creation is out of scope; portals are only
/// ever created by the bridge observing an inbound Slack event.
#[handler]
pub async fn create_bridge(res: &mut Response) {
    render_error(
        res,
        StatusCode::BAD_REQUEST,
        "creating a bridge from the Matrix side is not supported; portals are created from Slack activity",
    );
}

#[handler]
pub async fn delete_bridge(req: &mut Request, res: &mut Response) {
    let portal_id = match req.param::<String>("id") {
        Some(v) if !v.is_empty() => v,
        _ => {
            render_error(res, StatusCode::BAD_REQUEST, "invalid bridge id");
            return;
        }
    };

    let portal_store = web_state().db_manager.portal_store();
    let mut portal = match portal_store.get_portal(&portal_id).await {
        Ok(Some(p)) => p,
        Ok(None) => {
            render_error(res, StatusCode::NOT_FOUND, "bridge not found");
            return;
        }
        Err(err) => {
            render_error(res, StatusCode::INTERNAL_SERVER_ERROR, &err.to_string());
            return;
        }
    };

    if let Some(room_id) = portal.matrix_room_id.take() {
        if let Err(err) = web_state().matrix_client.leave_room(&room_id).await {
            render_error(res, StatusCode::INTERNAL_SERVER_ERROR, &err.to_string());
            return;
        }
        web_state().bridge.forget_portal_room(&room_id);
    }

    portal.updated_at = chrono::Utc::now();
    if let Err(err) = portal_store.upsert_portal(&portal).await {
        render_error(res, StatusCode::INTERNAL_SERVER_ERROR, &err.to_string());
        return;
    }

    res.render(Json(json!({ "ok": true, "message": format!("unbridged {}", portal_id) })));
}

#[handler]
pub async fn get_bridge_info(req: &mut Request, res: &mut Response) {
    let portal_id = match req.param::<String>("id") {
        Some(v) if !v.is_empty() => v,
        _ => {
            render_error(res, StatusCode::BAD_REQUEST, "invalid bridge id");
            return;
        }
    };

    match web_state().db_manager.portal_store().get_portal(&portal_id).await {
        Ok(Some(portal)) => {
            res.render(Json(json!({ "portal": portal })));
        }
        Ok(None) => {
            render_error(res, StatusCode::NOT_FOUND, "bridge not found");
        }
        Err(err) => {
            render_error(res, StatusCode::INTERNAL_SERVER_ERROR, &format!("database error: {}", err));
        }
    }
}
