use indoc::indoc;

use super::CourierMigration;

pub const M000001_MIGRATION: CourierMigration = CourierMigration {
    name: "m000001",
    is_breaking: false,
    stmts: &[
        indoc! {r#"
            create table jobs (
                sort_key integer primary key autoincrement,
                id text not null unique,
                job_key text unique,
                job_type text not null,
                partition_key text not null default '',
                payload text not null,
                state text not null default 'ready'
                    check (state in ('ready', 'running', 'retrying', 'failed', 'done')),
                attempts integer not null default 0 check (attempts >= 0),
                max_attempts integer not null default 25 check (max_attempts >= 1),
                run_at integer not null,
                last_error text,
                locked_by text,
                locked_at integer,
                cancelled boolean not null default 0,
                created_at integer not null,
                updated_at integer not null
            );
        "#},
        indoc! {r#"
            create index jobs_lane_idx
                on jobs (job_type, partition_key, sort_key);
        "#},
        indoc! {r#"
            create index jobs_state_run_at_idx
                on jobs (job_type, state, run_at);
        "#},
        indoc! {r#"
            create index jobs_locked_by_idx
                on jobs (locked_by)
                where locked_by is not null;
        "#},
        indoc! {r#"
            create trigger jobs_attempts_never_decrease
                before update of attempts on jobs
                when new.attempts < old.attempts
            begin
                select raise(abort, 'job attempts cannot decrease');
            end;
        "#},
        indoc! {r#"
            create trigger jobs_failed_is_terminal
                before update of state on jobs
                when old.state = 'failed' and new.state <> 'failed'
            begin
                select raise(abort, 'failed jobs cannot be revived');
            end;
        "#},
        indoc! {r#"
            create table job_dependencies (
                job_id text not null references jobs (id) on delete cascade,
                depends_on text not null,
                primary key (job_id, depends_on)
            );
        "#},
        indoc! {r#"
            create index job_dependencies_depends_on_idx
                on job_dependencies (depends_on);
        "#},
    ],
};
