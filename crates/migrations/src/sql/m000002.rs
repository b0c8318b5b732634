use indoc::indoc;

use super::CourierMigration;

pub const M000002_MIGRATION: CourierMigration = CourierMigration {
    name: "m000002",
    is_breaking: false,
    stmts: &[indoc! {r#"
        create table processed_envelopes (
            envelope_id text primary key,
            processed_at integer not null
        );
    "#}],
};
