// SQLite schema for the mapping store

diesel::table! {
    message_mappings (id) {
        id -> Integer,
        source_chat_id -> BigInt,
        source_msg_id -> BigInt,
        backup_chat_id -> BigInt,
        backup_msg_id -> BigInt,
        target_topic_id -> Nullable<BigInt>,
        created_at -> Text,
    }
}
