use indoc::indoc;

use super::CourierMigration;

pub const M000003_MIGRATION: CourierMigration = CourierMigration {
    name: "m000003",
    is_breaking: false,
    stmts: &[
        indoc! {r#"
            create table disappearing_configs (
                conversation_id text primary key,
                enabled boolean not null default 0,
                duration_ms integer,
                version integer not null default 0,
                updated_at integer not null,
                check (not enabled or (duration_ms is not null and duration_ms > 0))
            );
        "#},
        indoc! {r#"
            create table messages (
                id text primary key,
                conversation_id text not null,
                direction text not null check (direction in ('incoming', 'outgoing')),
                body text not null,
                created_at integer not null,
                read_at integer,
                expire_started_at integer,
                expires_at integer,
                check ((expire_started_at is null) = (expires_at is null))
            );
        "#},
        indoc! {r#"
            create index messages_conversation_created_idx
                on messages (conversation_id, created_at);
        "#},
        indoc! {r#"
            create index messages_expires_at_idx
                on messages (expires_at)
                where expires_at is not null;
        "#},
        indoc! {r#"
            create trigger messages_expiration_immutable
                before update of expire_started_at, expires_at on messages
                when old.expire_started_at is not null
                    and (new.expire_started_at is not old.expire_started_at
                        or new.expires_at is not old.expires_at)
            begin
                select raise(abort, 'message expiration is immutable once started');
            end;
        "#},
    ],
};
