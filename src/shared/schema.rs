diesel::table! {
    users (id) {
        id -> Uuid,
        email -> Text,
        password_hash -> Text,
        role -> Text,
        skills -> Array<Text>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    tickets (id) {
        id -> Uuid,
        title -> Text,
        description -> Text,
        status -> Text,
        priority -> Text,
        helpful_notes -> Nullable<Text>,
        related_skills -> Array<Text>,
        created_by -> Uuid,
        assigned_to -> Nullable<Uuid>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    ticket_replies (id) {
        id -> Uuid,
        ticket_id -> Uuid,
        body -> Text,
        sent_by -> Uuid,
        sent_at -> Timestamptz,
    }
}

diesel::table! {
    triage_events (id) {
        id -> Uuid,
        ticket_id -> Uuid,
        name -> Text,
        title -> Text,
        description -> Text,
        created_by -> Uuid,
        state -> Text,
        cursor -> Text,
        attempts -> Int4,
        last_error -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::joinable!(ticket_replies -> tickets (ticket_id));
diesel::joinable!(triage_events -> tickets (ticket_id));

diesel::allow_tables_to_appear_in_same_query!(users, tickets, ticket_replies, triage_events);
