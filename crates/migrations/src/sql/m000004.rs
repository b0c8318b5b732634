use indoc::indoc;

use super::CourierMigration;

pub const M000004_MIGRATION: CourierMigration = CourierMigration {
    name: "m000004",
    is_breaking: false,
    stmts: &[
        // Waiting on dependencies is kept apart from `run_at`, which stays the
        // time the producer asked for.
        indoc! {r#"
            alter table jobs add column deferred_until integer;
        "#},
        indoc! {r#"
            create index jobs_running_locked_at_idx
                on jobs (locked_at)
                where state = 'running';
        "#},
    ],
};
