//! Store operations grouped per table. Each function runs against the
//! connection it is handed, usually a transaction opened with [`crate::db::begin`].

pub mod check_service;
pub mod flip_service;
pub mod ping_service;

/// JSON array of a check's channels in the queue wire shape. Expects the
/// enclosing query to alias `checks` as `ch`.
pub(crate) const CHANNELS_SNAPSHOT: &str = r#"COALESCE((
        SELECT json_agg(json_strip_nulls(json_build_object(
            'kind', c.kind,
            'email', c.email,
            'webhookURLUp', c.webhook_url_up,
            'webhookURLDown', c.webhook_url_down
        )) ORDER BY c.id)
        FROM checks_channels cc
        JOIN channels c ON c.id = cc.channel_id
        WHERE cc.check_id = ch.id
    ), '[]'::json)"#;
