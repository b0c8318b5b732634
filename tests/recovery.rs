use std::time::Duration;

use courier::sql::get_job::claim_job;
use courier::{Clock, JobPayload, JobSpec};

use crate::helpers::{data, envelope, outgoing};

mod helpers;

#[tokio::test]
async fn jobs_left_running_are_released_at_startup() {
    helpers::with_test_db(|test_db| async move {
        let job = test_db
            .worker_utils()
            .enqueue_outgoing(outgoing("m-1", "conv", "alice"))
            .await
            .expect("Failed to add job")
            .expect("job key is free");

        // A worker claimed the job and died before releasing it.
        claim_job(&test_db.pool, job.id(), "dead_worker", test_db.clock.now())
            .await
            .expect("Failed to claim job")
            .expect("job is claimable");
        test_db.clock.advance(Duration::from_secs(61));

        let worker = test_db
            .create_worker_options()
            .init()
            .await
            .expect("Failed to create worker");

        let row = test_db.get_job(job.id()).await.expect("job is kept");
        assert_eq!(row.state, "ready");
        assert_eq!(row.locked_by, None);
        assert_eq!(row.attempts, 1, "the interrupted attempt stays counted");

        worker.run_once().await.expect("Failed to run worker");

        assert_eq!(test_db.transport.sent_message_ids("alice"), ["m-1"]);
        assert!(test_db.get_jobs().await.is_empty());
    })
    .await;
}

#[tokio::test]
async fn recent_locks_are_kept_at_startup() {
    helpers::with_test_db(|test_db| async move {
        let job = test_db
            .worker_utils()
            .enqueue_outgoing(outgoing("m-1", "conv", "alice"))
            .await
            .expect("Failed to add job")
            .expect("job key is free");

        claim_job(&test_db.pool, job.id(), "busy_worker", test_db.clock.now())
            .await
            .expect("Failed to claim job")
            .expect("job is claimable");
        test_db.clock.advance(Duration::from_secs(10));

        let worker = test_db
            .create_worker_options()
            .job_expiry(Duration::from_secs(30))
            .init()
            .await
            .expect("Failed to create worker");

        let row = test_db.get_job(job.id()).await.expect("job is kept");
        assert_eq!(row.state, "running");
        assert_eq!(row.locked_by.as_deref(), Some("busy_worker"));

        worker.run_once().await.expect("Failed to run worker");
        assert!(test_db.transport.calls().is_empty());
    })
    .await;
}

#[tokio::test]
async fn starting_worker_leaves_jobs_of_a_live_worker_alone() {
    helpers::with_test_db(|test_db| async move {
        let first = test_db
            .create_worker_options()
            .job_expiry(Duration::from_millis(40))
            .shutdown_timeout(Duration::from_millis(10))
            .init()
            .await
            .expect("Failed to create worker");

        let job = first
            .create_utils()
            .enqueue_outgoing(outgoing("m-1", "conv", "alice"))
            .await
            .expect("Failed to add job")
            .expect("job key is free");
        test_db.transport.hang();

        let second = async {
            test_db.transport.started.notified().await;

            // Long after the claim, the running worker still refreshes its lock.
            test_db.clock.advance(Duration::from_secs(120));
            let now = test_db.clock_now_millis();
            for _ in 0..200 {
                let row = test_db.get_job(job.id()).await.expect("job is kept");
                if row.locked_at == Some(now) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            let row = test_db.get_job(job.id()).await.expect("job is kept");
            assert_eq!(row.locked_at, Some(now));

            let second = test_db
                .create_worker_options()
                .init()
                .await
                .expect("Failed to create worker");

            let row = test_db.get_job(job.id()).await.expect("job is kept");
            assert_eq!(row.state, "running");
            assert_eq!(row.locked_by.as_ref(), Some(first.worker_id()));

            second.run_once().await.expect("Failed to run worker");
            first.request_shutdown();
        };
        let (result, ()) = tokio::join!(first.run_once(), second);
        result.expect("Failed to run worker");

        assert_eq!(test_db.transport.calls_to("alice"), 1);
        let row = test_db.get_job(job.id()).await.expect("job is kept");
        assert_eq!(row.state, "retrying");
        assert_eq!(row.attempts, 1);
    })
    .await;
}

#[tokio::test]
async fn force_unlock_releases_only_the_given_workers() {
    helpers::with_test_db(|test_db| async move {
        let utils = test_db.worker_utils();
        let mut ids = Vec::new();
        for recipient in ["alice", "bob"] {
            let job = utils
                .add_job(
                    JobPayload::SendOutgoing(outgoing(&format!("{recipient}-1"), "conv", recipient)),
                    JobSpec::default(),
                )
                .await
                .expect("Failed to add job")
                .expect("no job key");
            ids.push(job.id().clone());
        }

        let now = test_db.clock.now();
        claim_job(&test_db.pool, &ids[0], "worker_a", now)
            .await
            .expect("Failed to claim job")
            .expect("job is claimable");
        claim_job(&test_db.pool, &ids[1], "worker_b", now)
            .await
            .expect("Failed to claim job")
            .expect("job is claimable");

        let released = utils
            .force_unlock_workers(&["worker_a".to_string()])
            .await
            .expect("Failed to unlock workers");
        assert_eq!(released, 1);

        let a = test_db.get_job(&ids[0]).await.expect("job is kept");
        assert_eq!(a.state, "ready");
        assert_eq!(a.locked_by, None);

        let b = test_db.get_job(&ids[1]).await.expect("job is kept");
        assert_eq!(b.state, "running");
        assert_eq!(b.locked_by.as_deref(), Some("worker_b"));
    })
    .await;
}

#[tokio::test]
async fn pending_expirations_are_reloaded_by_a_new_worker() {
    helpers::with_test_db(|test_db| async move {
        let worker = test_db
            .create_worker_options()
            .init()
            .await
            .expect("Failed to create worker");
        let utils = worker.create_utils();

        worker
            .expirations()
            .set_configuration("conv", Some(Duration::from_secs(60)))
            .await
            .expect("Failed to configure conversation");
        utils
            .enqueue_envelopes(&[envelope("env-1", "alice", &data("conv", "hello"))])
            .await
            .expect("Failed to enqueue envelope");
        worker.run_once().await.expect("Failed to run worker");

        let read_at = test_db.clock.now();
        worker
            .expirations()
            .mark_read("env-1", read_at)
            .await
            .expect("Failed to mark read")
            .expect("expiration starts");
        drop(worker);

        let restarted = test_db
            .create_worker_options()
            .init()
            .await
            .expect("Failed to create worker");
        assert_eq!(
            restarted.expirations().next_deadline(),
            Some(read_at + chrono::Duration::seconds(60))
        );

        test_db.clock.advance(Duration::from_secs(61));
        restarted.run_once().await.expect("Failed to run worker");

        assert!(test_db.get_messages().await.is_empty());
        assert_eq!(restarted.expirations().next_deadline(), None);
    })
    .await;
}

#[tokio::test]
async fn read_messages_without_a_deadline_get_one_at_startup() {
    helpers::with_test_db(|test_db| async move {
        let worker = test_db
            .create_worker_options()
            .init()
            .await
            .expect("Failed to create worker");

        worker
            .expirations()
            .set_configuration("conv", Some(Duration::from_secs(30)))
            .await
            .expect("Failed to configure conversation");
        worker
            .create_utils()
            .enqueue_envelopes(&[envelope("env-1", "alice", &data("conv", "hello"))])
            .await
            .expect("Failed to enqueue envelope");
        worker.run_once().await.expect("Failed to run worker");

        // Crash between recording the read and starting the expiration.
        let read_at = test_db.clock_now_millis();
        sqlx::query("update messages set read_at = ?1 where id = 'env-1'")
            .bind(read_at)
            .execute(&test_db.pool)
            .await
            .expect("Failed to mark read");
        drop(worker);

        test_db.clock.advance(Duration::from_secs(10));
        let _restarted = test_db
            .create_worker_options()
            .init()
            .await
            .expect("Failed to create worker");

        let messages = test_db.get_messages().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].expire_started_at, Some(read_at));
        assert_eq!(messages[0].expires_at, Some(read_at + 30_000));
    })
    .await;
}
