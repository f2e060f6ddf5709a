use diesel::{allow_tables_to_appear_in_same_query, table};

table! {
    waba_tenants (id) {
        id -> Text,
        name -> Text,
        phone_number_id -> Text,
        access_token_enc -> Nullable<Text>,
        webhook_verify_token -> Nullable<Text>,
        webhook_verified_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

table! {
    waba_messages (id) {
        id -> Text,
        tenant_id -> Text,
        message_type -> Text,
        content -> Jsonb,
        status -> Text,
        scheduled_at -> Nullable<Timestamptz>,
        provider_message_id -> Nullable<Text>,
        error -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

table! {
    waba_message_recipients (id) {
        id -> BigInt,
        message_id -> Text,
        recipient -> Text,
        status -> Text,
        provider_message_id -> Nullable<Text>,
        error -> Nullable<Text>,
        updated_at -> Timestamptz,
    }
}

table! {
    waba_interactions (id) {
        id -> BigInt,
        tenant_id -> Text,
        recipient -> Text,
        last_inbound_at -> Timestamptz,
    }
}

table! {
    waba_templates (id) {
        id -> BigInt,
        tenant_id -> Text,
        provider_template_id -> Text,
        name -> Text,
        language -> Text,
        category -> Text,
        status -> Text,
        rejection_reason -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

allow_tables_to_appear_in_same_query!(
    waba_tenants,
    waba_messages,
    waba_message_recipients,
    waba_interactions,
    waba_templates,
);
