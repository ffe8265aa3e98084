//! Event Pipeline: turns raw RTM event values into uniform `RemoteEvent`s
//! carrying the portal key, sender, and derived ids the Portal Coordinator
//! needs, per the Slack event-type mapping table.

use serde_json::Value;

use crate::db::RoomType;
use crate::ids::{self, SlackTimestamp};
use crate::session::RawRtmEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEventKind {
    Message,
    Edit,
    MessageRemove,
    ChatResync,
    Reaction,
    ReactionRemove,
    Typing,
    ReadReceipt,
    ChatInfoChange,
    Emoji,
}

#[derive(Debug, Clone)]
pub struct EventMeta {
    pub portal_id: String,
    pub team_id: String,
    pub channel_id: String,
    pub sender: Option<String>,
    pub timestamp: Option<SlackTimestamp>,
    pub message_id: Option<String>,
    pub create_portal: bool,
}

#[derive(Debug, Clone)]
pub struct RemoteEvent {
    pub kind: RemoteEventKind,
    pub meta: EventMeta,
    pub raw: Value,
    /// Present for `MessageRemove`/`Reaction(Remove)`/`Edit`: the id of the
    /// message being targeted, which may differ from `meta.message_id`
    /// (e.g. a `message_deleted` subtype carries the deleted timestamp,
    /// not the wrapper event's own timestamp).
    pub target_id: Option<String>,
}

/// A Slack user or bot id, turned into the canonical sender form used
/// everywhere else (`make_event_sender`).
pub fn make_event_sender(team_id: &str, slack_user_or_bot_id: &str) -> String {
    ids::make_user_id(team_id, slack_user_or_bot_id)
}

/// Converts one raw RTM frame into zero or one `RemoteEvent`s. Events with
/// no spec-assigned `RemoteEvent` (hello/hello-latency/file-*/redundant
/// membership echoes) return `None`.
pub fn convert(team_id: &str, raw: RawRtmEvent) -> Option<RemoteEvent> {
    let event = raw.payload;
    let event_type = event.get("type").and_then(Value::as_str)?;

    match event_type {
        "message" => convert_message(team_id, &event),
        "reaction_added" => convert_reaction(team_id, &event, RemoteEventKind::Reaction),
        "reaction_removed" => convert_reaction(team_id, &event, RemoteEventKind::ReactionRemove),
        "user_typing" => convert_typing(team_id, &event),
        "channel_marked" | "im_marked" | "group_marked" => convert_read_receipt(team_id, &event),
        "channel_joined" | "group_joined" => convert_self_membership(team_id, &event, true),
        "channel_left" | "group_left" => convert_self_membership(team_id, &event, false),
        "member_joined_channel" | "member_left_channel" => convert_member_membership(team_id, &event),
        "channel_update" => convert_channel_update(team_id, &event),
        "emoji_changed" => Some(RemoteEvent {
            kind: RemoteEventKind::Emoji,
            meta: channel_meta(team_id, "", None, None, false),
            raw: event,
            target_id: None,
        }),
        _ => None,
    }
}

fn channel_meta(
    team_id: &str,
    channel_id: &str,
    sender: Option<String>,
    timestamp: Option<SlackTimestamp>,
    create_portal: bool,
) -> EventMeta {
    EventMeta {
        portal_id: ids::make_portal_id(team_id, channel_id),
        team_id: team_id.to_string(),
        channel_id: channel_id.to_string(),
        sender,
        timestamp,
        message_id: None,
        create_portal,
    }
}

fn convert_message(team_id: &str, event: &Value) -> Option<RemoteEvent> {
    let channel_id = event.get("channel").and_then(Value::as_str)?;
    let ts_raw = event.get("ts").and_then(Value::as_str)?;
    let ts = SlackTimestamp::parse(ts_raw);
    let subtype = event.get("subtype").and_then(Value::as_str).unwrap_or("");

    match subtype {
        "" => {
            let sender_id = event
                .get("user")
                .and_then(Value::as_str)
                .or_else(|| event.get("bot_id").and_then(Value::as_str))
                .or_else(|| event.pointer("/message/user").and_then(Value::as_str));
            let mut meta = channel_meta(
                team_id,
                channel_id,
                sender_id.map(|id| make_event_sender(team_id, id)),
                ts,
                true,
            );
            meta.message_id = Some(ids::make_message_id(team_id, channel_id, ts_raw));
            Some(RemoteEvent {
                kind: RemoteEventKind::Message,
                meta,
                raw: event.clone(),
                target_id: None,
            })
        }
        "message_changed" => {
            if event.pointer("/message/subtype").and_then(Value::as_str) == Some("huddle_thread") {
                return None;
            }
            let mut meta = channel_meta(team_id, channel_id, None, ts, false);
            meta.message_id = Some(ids::make_message_id(team_id, channel_id, ts_raw));
            Some(RemoteEvent {
                kind: RemoteEventKind::Edit,
                target_id: meta.message_id.clone(),
                meta,
                raw: event.clone(),
            })
        }
        "message_deleted" => {
            let deleted_ts = event.get("deleted_ts").and_then(Value::as_str)?;
            let target_id = ids::make_message_id(team_id, channel_id, deleted_ts);
            let meta = channel_meta(team_id, channel_id, None, ts, false);
            Some(RemoteEvent {
                kind: RemoteEventKind::MessageRemove,
                meta,
                raw: event.clone(),
                target_id: Some(target_id),
            })
        }
        "channel_topic" | "channel_purpose" | "channel_name" | "group_topic" | "group_purpose"
        | "group_name" => {
            let meta = channel_meta(team_id, channel_id, None, ts, false);
            Some(RemoteEvent {
                kind: RemoteEventKind::ChatResync,
                meta,
                raw: event.clone(),
                target_id: None,
            })
        }
        "message_replied" | "channel_join" | "channel_leave" | "group_join" | "group_leave"
        | "thread_broadcast" => None,
        _ => None,
    }
}

fn convert_reaction(team_id: &str, event: &Value, kind: RemoteEventKind) -> Option<RemoteEvent> {
    let channel_id = event.pointer("/item/channel").and_then(Value::as_str)?;
    let item_ts = event.pointer("/item/ts").and_then(Value::as_str)?;
    let user_id = event.get("user").and_then(Value::as_str);
    let target_id = ids::make_message_id(team_id, channel_id, item_ts);

    let meta = channel_meta(
        team_id,
        channel_id,
        user_id.map(|id| make_event_sender(team_id, id)),
        None,
        false,
    );
    Some(RemoteEvent {
        kind,
        meta,
        raw: event.clone(),
        target_id: Some(target_id),
    })
}

fn convert_typing(team_id: &str, event: &Value) -> Option<RemoteEvent> {
    let channel_id = event.get("channel").and_then(Value::as_str)?;
    let user_id = event.get("user").and_then(Value::as_str);
    let meta = channel_meta(
        team_id,
        channel_id,
        user_id.map(|id| make_event_sender(team_id, id)),
        None,
        false,
    );
    Some(RemoteEvent {
        kind: RemoteEventKind::Typing,
        meta,
        raw: event.clone(),
        target_id: None,
    })
}

fn convert_read_receipt(team_id: &str, event: &Value) -> Option<RemoteEvent> {
    let channel_id = event.get("channel").and_then(Value::as_str)?;
    let meta = channel_meta(team_id, channel_id, None, None, false);
    Some(RemoteEvent {
        kind: RemoteEventKind::ReadReceipt,
        meta,
        raw: event.clone(),
        target_id: None,
    })
}

fn convert_self_membership(team_id: &str, event: &Value, _joined: bool) -> Option<RemoteEvent> {
    let channel_id = event.get("channel").and_then(Value::as_str)?;
    let meta = channel_meta(team_id, channel_id, None, None, true);
    Some(RemoteEvent {
        kind: RemoteEventKind::ChatInfoChange,
        meta,
        raw: event.clone(),
        target_id: None,
    })
}

fn convert_member_membership(team_id: &str, event: &Value) -> Option<RemoteEvent> {
    let channel_id = event.get("channel").and_then(Value::as_str)?;
    let user_id = event.get("user").and_then(Value::as_str);
    let meta = channel_meta(
        team_id,
        channel_id,
        user_id.map(|id| make_event_sender(team_id, id)),
        None,
        false,
    );
    Some(RemoteEvent {
        kind: RemoteEventKind::ChatInfoChange,
        meta,
        raw: event.clone(),
        target_id: None,
    })
}

fn convert_channel_update(team_id: &str, event: &Value) -> Option<RemoteEvent> {
    let channel_id = event.get("channel").and_then(Value::as_str)?;
    let meta = channel_meta(team_id, channel_id, None, None, true);
    Some(RemoteEvent {
        kind: RemoteEventKind::ChatResync,
        meta,
        raw: event.clone(),
        target_id: None,
    })
}

/// Derives the receiver id used to key a Portal for a DM/GroupDM vs a
/// shared channel. `room_type` must already be known (from the Resolver's
/// `ChatInfo` or a fresh `conversations.info` lookup) before calling this.
pub fn derive_receiver(room_type: RoomType, login_id: &str) -> String {
    match room_type {
        RoomType::Dm | RoomType::GroupDm => login_id.to_string(),
        RoomType::Channel | RoomType::Space => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn raw(payload: Value) -> RawRtmEvent {
        RawRtmEvent {
            login_id: "T1-U1".to_string(),
            payload,
        }
    }

    #[test]
    fn plain_message_creates_portal_and_message_id() {
        let event = raw(json!({
            "type": "message",
            "channel": "C1",
            "user": "U9",
            "ts": "100.000001"
        }));
        let converted = convert("T1", event).unwrap();
        assert_eq!(converted.kind, RemoteEventKind::Message);
        assert!(converted.meta.create_portal);
        assert_eq!(converted.meta.sender.as_deref(), Some("t1-u9"));
        assert_eq!(
            converted.meta.message_id.as_deref(),
            Some("T1-C1-100.000001")
        );
    }

    #[test]
    fn message_changed_huddle_thread_is_dropped() {
        let event = raw(json!({
            "type": "message",
            "subtype": "message_changed",
            "channel": "C1",
            "ts": "100.0",
            "message": { "subtype": "huddle_thread" }
        }));
        assert!(convert("T1", event).is_none());
    }

    #[test]
    fn message_changed_is_edit_with_same_id() {
        let event = raw(json!({
            "type": "message",
            "subtype": "message_changed",
            "channel": "C1",
            "ts": "100.0",
            "message": { "ts": "100.0" }
        }));
        let converted = convert("T1", event).unwrap();
        assert_eq!(converted.kind, RemoteEventKind::Edit);
        assert_eq!(converted.target_id.as_deref(), Some("T1-C1-100.0"));
    }

    #[test]
    fn message_deleted_targets_deleted_ts_not_wrapper_ts() {
        let event = raw(json!({
            "type": "message",
            "subtype": "message_deleted",
            "channel": "C1",
            "ts": "200.0",
            "deleted_ts": "100.0"
        }));
        let converted = convert("T1", event).unwrap();
        assert_eq!(converted.kind, RemoteEventKind::MessageRemove);
        assert_eq!(converted.target_id.as_deref(), Some("T1-C1-100.0"));
    }

    #[test]
    fn reaction_added_targets_item_timestamp() {
        let event = raw(json!({
            "type": "reaction_added",
            "user": "U2",
            "item": { "channel": "C1", "ts": "100.0" }
        }));
        let converted = convert("T1", event).unwrap();
        assert_eq!(converted.kind, RemoteEventKind::Reaction);
        assert_eq!(converted.target_id.as_deref(), Some("T1-C1-100.0"));
        assert_eq!(converted.meta.sender.as_deref(), Some("t1-u2"));
    }

    #[test]
    fn redundant_membership_subtypes_are_dropped() {
        let event = raw(json!({
            "type": "message",
            "subtype": "channel_join",
            "channel": "C1",
            "ts": "100.0"
        }));
        assert!(convert("T1", event).is_none());
    }

    #[test]
    fn emoji_changed_routes_without_channel() {
        let event = raw(json!({ "type": "emoji_changed", "subtype": "add" }));
        let converted = convert("T1", event).unwrap();
        assert_eq!(converted.kind, RemoteEventKind::Emoji);
    }

    #[test]
    fn hello_event_is_ignored() {
        let event = raw(json!({ "type": "hello" }));
        assert!(convert("T1", event).is_none());
    }

    #[test]
    fn receiver_is_login_id_for_dm_and_empty_for_channel() {
        assert_eq!(derive_receiver(RoomType::Dm, "T1-U1"), "T1-U1");
        assert_eq!(derive_receiver(RoomType::Channel, "T1-U1"), "");
    }
}
