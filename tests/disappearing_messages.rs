use std::time::Duration;

use courier::{Clock, Content, CourierError};

use crate::helpers::{data, envelope, outgoing};

mod helpers;

#[tokio::test]
async fn deadline_uses_the_duration_when_the_timer_started() {
    helpers::with_test_db(|test_db| async move {
        let worker = test_db
            .create_worker_options()
            .init()
            .await
            .expect("Failed to create worker");
        let expirations = worker.expirations();
        let finder = worker.message_finder();

        expirations
            .set_configuration("conv", Some(Duration::from_secs(60)))
            .await
            .expect("Failed to configure conversation");
        worker
            .create_utils()
            .enqueue_envelopes(&[envelope("env-1", "alice", &data("conv", "hello"))])
            .await
            .expect("Failed to enqueue envelope");
        worker.run_once().await.expect("Failed to run worker");

        let pending = expirations
            .mark_read("env-1", test_db.clock.now())
            .await
            .expect("Failed to mark read")
            .expect("expiration starts");
        assert_eq!(pending.deadline(), test_db.clock.now() + chrono::Duration::seconds(60));

        test_db.clock.advance(Duration::from_secs(30));
        expirations
            .set_configuration("conv", Some(Duration::from_secs(60 * 60)))
            .await
            .expect("Failed to configure conversation");

        test_db.clock.advance(Duration::from_secs(29));
        worker.run_once().await.expect("Failed to run worker");
        assert!(finder
            .get("env-1")
            .await
            .expect("Failed to get message")
            .is_some());

        test_db.clock.advance(Duration::from_secs(2));
        // Hidden from readers even before the sweep deleted it.
        assert!(finder
            .get("env-1")
            .await
            .expect("Failed to get message")
            .is_none());
        assert_eq!(test_db.get_messages().await.len(), 1);

        worker.run_once().await.expect("Failed to run worker");
        assert!(test_db.get_messages().await.is_empty());

        let expired = test_db.reporter.expirations();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].conversation_id, "conv");
        assert_eq!(expired[0].message_ids, ["env-1"]);
    })
    .await;
}

#[tokio::test]
async fn disabling_keeps_started_deadlines() {
    helpers::with_test_db(|test_db| async move {
        let worker = test_db
            .create_worker_options()
            .init()
            .await
            .expect("Failed to create worker");
        let expirations = worker.expirations();

        expirations
            .set_configuration("conv", Some(Duration::from_secs(10)))
            .await
            .expect("Failed to configure conversation");
        worker
            .create_utils()
            .enqueue_envelopes(&[
                envelope("env-1", "alice", &data("conv", "first")),
                envelope("env-2", "alice", &data("conv", "second")),
            ])
            .await
            .expect("Failed to enqueue envelopes");
        worker.run_once().await.expect("Failed to run worker");

        expirations
            .mark_read("env-1", test_db.clock.now())
            .await
            .expect("Failed to mark read")
            .expect("expiration starts");

        let config = expirations
            .set_configuration("conv", None)
            .await
            .expect("Failed to configure conversation");
        assert!(!config.enabled());
        assert_eq!(config.version(), 2);
        assert_eq!(config.last_duration(), Some(Duration::from_secs(10)));

        // No new timer while disabled.
        assert!(expirations
            .mark_read("env-2", test_db.clock.now())
            .await
            .expect("Failed to mark read")
            .is_none());

        test_db.clock.advance(Duration::from_secs(11));
        worker.run_once().await.expect("Failed to run worker");

        let remaining: Vec<_> = test_db
            .get_messages()
            .await
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(remaining, ["env-2"]);
    })
    .await;
}

#[tokio::test]
async fn zero_duration_is_rejected() {
    helpers::with_test_db(|test_db| async move {
        let worker = test_db
            .create_worker_options()
            .init()
            .await
            .expect("Failed to create worker");

        let result = worker
            .expirations()
            .set_configuration("conv", Some(Duration::ZERO))
            .await;
        assert!(matches!(
            result,
            Err(CourierError::InvalidExpirationDuration(_))
        ));
        assert!(worker
            .expirations()
            .get_configuration("conv")
            .await
            .expect("Failed to get configuration")
            .is_none());
    })
    .await;
}

#[tokio::test]
async fn timer_update_from_a_peer_changes_the_configuration() {
    helpers::with_test_db(|test_db| async move {
        let worker = test_db
            .create_worker_options()
            .init()
            .await
            .expect("Failed to create worker");

        let update = Content::ExpirationTimerUpdate {
            conversation_id: "conv".into(),
            duration_ms: Some(5_000),
        };
        worker
            .create_utils()
            .enqueue_envelopes(&[envelope("env-1", "alice", &update)])
            .await
            .expect("Failed to enqueue envelope");
        worker.run_once().await.expect("Failed to run worker");

        let config = worker
            .expirations()
            .get_configuration("conv")
            .await
            .expect("Failed to get configuration")
            .expect("conversation is configured");
        assert!(config.enabled());
        assert_eq!(config.duration(), Some(Duration::from_secs(5)));
        assert_eq!(config.version(), 1);
    })
    .await;
}

#[tokio::test]
async fn sent_messages_start_expiring_once_sent() {
    helpers::with_test_db(|test_db| async move {
        let worker = test_db
            .create_worker_options()
            .init()
            .await
            .expect("Failed to create worker");

        worker
            .expirations()
            .set_configuration("conv", Some(Duration::from_secs(5)))
            .await
            .expect("Failed to configure conversation");
        worker
            .create_utils()
            .enqueue_outgoing(outgoing("m-1", "conv", "alice"))
            .await
            .expect("Failed to add job");
        worker.run_once().await.expect("Failed to run worker");

        let messages = test_db.get_messages().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].direction, "outgoing");
        let started = test_db.clock_now_millis();
        assert_eq!(messages[0].expire_started_at, Some(started));
        assert_eq!(messages[0].expires_at, Some(started + 5_000));
    })
    .await;
}

#[tokio::test]
async fn scheduler_deletes_at_the_earliest_deadline_while_running() {
    helpers::with_test_db(|test_db| async move {
        let worker = test_db
            .create_worker_options()
            .init()
            .await
            .expect("Failed to create worker");

        worker
            .expirations()
            .set_configuration("conv", Some(Duration::from_secs(10)))
            .await
            .expect("Failed to configure conversation");
        worker
            .create_utils()
            .enqueue_envelopes(&[envelope("env-1", "alice", &data("conv", "hello"))])
            .await
            .expect("Failed to enqueue envelope");
        worker.run_once().await.expect("Failed to run worker");
        worker
            .expirations()
            .mark_read("env-1", test_db.clock.now())
            .await
            .expect("Failed to mark read");

        let driver = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(test_db.get_messages().await.len(), 1);

            test_db.clock.advance(Duration::from_secs(10));
            for _ in 0..200 {
                if test_db.get_messages().await.is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            worker.request_shutdown();
        };

        let (result, ()) = tokio::join!(worker.run(), driver);
        result.expect("Failed to run worker");

        assert!(test_db.get_messages().await.is_empty());
        assert_eq!(test_db.reporter.expirations().len(), 1);
    })
    .await;
}
