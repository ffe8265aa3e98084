diesel::table! {
    teams (team_id) {
        team_id -> Text,
        domain -> Text,
        name -> Text,
        icon_url -> Nullable<Text>,
        space_room_id -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    user_logins (login_id) {
        login_id -> Text,
        matrix_user_id -> Text,
        team_id -> Text,
        slack_user_id -> Text,
        token -> Text,
        cookie_token -> Nullable<Text>,
        connection_state -> Text,
        last_sync_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    portals (portal_id) {
        portal_id -> Text,
        team_id -> Text,
        channel_id -> Text,
        matrix_room_id -> Nullable<Text>,
        room_type -> Text,
        receiver -> Text,
        name -> Nullable<Text>,
        topic -> Nullable<Text>,
        more_to_backfill -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    ghosts (ghost_id) {
        ghost_id -> Text,
        team_id -> Text,
        slack_user_id -> Text,
        name -> Nullable<Text>,
        avatar_url -> Nullable<Text>,
        avatar_mxc -> Nullable<Text>,
        is_bot -> Bool,
        remote_updated_at -> Nullable<BigInt>,
        last_synced_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    messages (portal_id, slack_timestamp, part_id) {
        portal_id -> Text,
        slack_timestamp -> Text,
        part_id -> Text,
        matrix_event_id -> Text,
        matrix_room_id -> Text,
        sender_id -> Text,
        thread_root_ts -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    reactions (portal_id, slack_timestamp, sender_id, emoji_shortcode) {
        portal_id -> Text,
        slack_timestamp -> Text,
        sender_id -> Text,
        emoji_shortcode -> Text,
        matrix_event_id -> Text,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    emoji (team_id, emoji_id) {
        team_id -> Text,
        emoji_id -> Text,
        value -> Text,
        mxc_url -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    backfill_tasks (team_id, user_login_id, channel_id) {
        team_id -> Text,
        user_login_id -> Text,
        channel_id -> Text,
        state -> Text,
        priority -> Integer,
        anchor_ts -> Nullable<Text>,
        forward -> Bool,
        dispatched_at -> Nullable<Timestamptz>,
        completed_at -> Nullable<Timestamptz>,
        cooldown_until -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    teams,
    user_logins,
    portals,
    ghosts,
    messages,
    reactions,
    emoji,
    backfill_tasks,
);
