#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use courier::collaborators::{
    AttachmentUploader, Ciphertext, DecryptError, ExpiredMessages, JobFailure, Reporter,
    ServiceError, SessionCipher, SyncProcessor, Transport,
};
use courier::{
    AttachmentPointer, Content, Envelope, MockClock, SendOutgoing, WorkerOptions, WorkerUtils,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use tokio::sync::{Notify, OnceCell};
use tokio::task::LocalSet;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(FromRow, Debug, Clone, PartialEq, Eq)]
pub struct JobRow {
    pub sort_key: i64,
    pub id: String,
    pub job_key: Option<String>,
    pub job_type: String,
    pub partition_key: String,
    pub state: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub run_at: i64,
    pub deferred_until: Option<i64>,
    pub last_error: Option<String>,
    pub locked_by: Option<String>,
    pub locked_at: Option<i64>,
    pub cancelled: bool,
}

#[derive(FromRow, Debug, Clone, PartialEq, Eq)]
pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub direction: String,
    pub read_at: Option<i64>,
    pub expire_started_at: Option<i64>,
    pub expires_at: Option<i64>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Records every send. Failures are scripted per recipient and consumed in order.
#[derive(Default)]
pub struct MockTransport {
    calls: Mutex<Vec<String>>,
    sent: Mutex<Vec<(String, Vec<u8>)>>,
    failures: Mutex<HashMap<String, VecDeque<ServiceError>>>,
    hang: AtomicBool,
    gate: Mutex<Option<Arc<Notify>>>,
    pub started: Notify,
}

impl MockTransport {
    pub fn fail_next(&self, recipient: &str, error: ServiceError) {
        lock(&self.failures)
            .entry(recipient.to_string())
            .or_default()
            .push_back(error);
    }

    /// Every later send never returns.
    pub fn hang(&self) {
        self.hang.store(true, Ordering::SeqCst);
    }

    /// Makes every later send wait for the returned notify before it returns.
    pub fn hold(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *lock(&self.gate) = Some(gate.clone());
        gate
    }

    /// Recipients of every send attempt, successful or not.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn calls_to(&self, recipient: &str) -> usize {
        lock(&self.calls).iter().filter(|r| *r == recipient).count()
    }

    /// Message ids of the successful sends to `recipient`, in send order.
    pub fn sent_message_ids(&self, recipient: &str) -> Vec<String> {
        lock(&self.sent)
            .iter()
            .filter(|(r, _)| r == recipient)
            .filter_map(|(_, body)| {
                let body: serde_json::Value = serde_json::from_slice(body).ok()?;
                body["message_id"].as_str().map(str::to_string)
            })
            .collect()
    }

    pub fn sent_count(&self) -> usize {
        lock(&self.sent).len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, recipient: &str, ciphertext: &Ciphertext) -> Result<(), ServiceError> {
        lock(&self.calls).push(recipient.to_string());
        self.started.notify_one();

        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let gate = lock(&self.gate).clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let failure = lock(&self.failures)
            .get_mut(recipient)
            .and_then(VecDeque::pop_front);
        if let Some(error) = failure {
            return Err(error);
        }

        lock(&self.sent).push((recipient.to_string(), ciphertext.0.clone()));
        Ok(())
    }
}

/// Envelope content is the JSON of a [`Content`]. Encryption is the identity.
#[derive(Default)]
pub struct MockCipher {
    decrypt_failures: Mutex<HashMap<String, DecryptError>>,
    decrypted: Mutex<Vec<String>>,
    archived: Mutex<Vec<String>>,
    archive_gate: Mutex<Option<Arc<Notify>>>,
    pub archive_started: Notify,
}

impl MockCipher {
    pub fn fail_decrypt(&self, envelope_id: &str, error: DecryptError) {
        lock(&self.decrypt_failures).insert(envelope_id.to_string(), error);
    }

    pub fn clear_decrypt_failures(&self) {
        lock(&self.decrypt_failures).clear();
    }

    pub fn decrypted(&self) -> Vec<String> {
        lock(&self.decrypted).clone()
    }

    pub fn archived(&self) -> Vec<String> {
        lock(&self.archived).clone()
    }

    /// Makes `archive_session` wait for the returned notify before returning.
    pub fn hold_archive(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *lock(&self.archive_gate) = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl SessionCipher for MockCipher {
    async fn decrypt(&self, envelope: &Envelope) -> Result<Content, DecryptError> {
        if let Some(error) = lock(&self.decrypt_failures).get(&envelope.id).cloned() {
            return Err(error);
        }
        let content = serde_json::from_slice(&envelope.content)
            .map_err(|e| DecryptError::Terminal(e.to_string()))?;
        lock(&self.decrypted).push(envelope.id.clone());
        Ok(content)
    }

    async fn encrypt(&self, plaintext: &[u8], _recipient: &str) -> Result<Ciphertext, ServiceError> {
        Ok(Ciphertext(plaintext.to_vec()))
    }

    async fn archive_session(&self, recipient: &str) -> Result<(), ServiceError> {
        lock(&self.archived).push(recipient.to_string());
        self.archive_started.notify_one();

        let gate = lock(&self.archive_gate).clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MockSync {
    groups: Mutex<Vec<Vec<u8>>>,
    contacts: Mutex<Vec<(Vec<u8>, bool)>>,
    failures: Mutex<VecDeque<ServiceError>>,
}

impl MockSync {
    pub fn fail_next(&self, error: ServiceError) {
        lock(&self.failures).push_back(error);
    }

    pub fn groups(&self) -> Vec<Vec<u8>> {
        lock(&self.groups).clone()
    }

    pub fn contacts(&self) -> Vec<(Vec<u8>, bool)> {
        lock(&self.contacts).clone()
    }
}

#[async_trait]
impl SyncProcessor for MockSync {
    async fn apply_group_sync(&self, data: &[u8]) -> Result<(), ServiceError> {
        if let Some(error) = lock(&self.failures).pop_front() {
            return Err(error);
        }
        lock(&self.groups).push(data.to_vec());
        Ok(())
    }

    async fn apply_contact_sync(&self, data: &[u8], is_complete: bool) -> Result<(), ServiceError> {
        if let Some(error) = lock(&self.failures).pop_front() {
            return Err(error);
        }
        lock(&self.contacts).push((data.to_vec(), is_complete));
        Ok(())
    }
}

#[derive(Default)]
pub struct MockUploader {
    uploads: Mutex<Vec<String>>,
}

impl MockUploader {
    pub fn uploads(&self) -> Vec<String> {
        lock(&self.uploads).clone()
    }
}

#[async_trait]
impl AttachmentUploader for MockUploader {
    async fn upload(&self, attachment_id: &str) -> Result<AttachmentPointer, ServiceError> {
        lock(&self.uploads).push(attachment_id.to_string());
        Ok(AttachmentPointer {
            attachment_id: attachment_id.to_string(),
            cdn_key: format!("cdn/{attachment_id}"),
        })
    }
}

#[derive(Default)]
pub struct RecordingReporter {
    failures: Mutex<Vec<JobFailure>>,
    expirations: Mutex<Vec<ExpiredMessages>>,
}

impl RecordingReporter {
    pub fn failures(&self) -> Vec<JobFailure> {
        lock(&self.failures).clone()
    }

    pub fn expirations(&self) -> Vec<ExpiredMessages> {
        lock(&self.expirations).clone()
    }
}

impl Reporter for RecordingReporter {
    fn job_failed(&self, failure: &JobFailure) {
        lock(&self.failures).push(failure.clone());
    }

    fn messages_expired(&self, expired: &ExpiredMessages) {
        lock(&self.expirations).push(expired.clone());
    }
}

#[derive(Clone)]
pub struct TestDatabase {
    pub pool: SqlitePool,
    pub path: PathBuf,
    pub clock: MockClock,
    pub transport: Arc<MockTransport>,
    pub cipher: Arc<MockCipher>,
    pub sync: Arc<MockSync>,
    pub uploader: Arc<MockUploader>,
    pub reporter: Arc<RecordingReporter>,
}

impl TestDatabase {
    async fn drop(&self) {
        self.pool.close().await;
        for suffix in ["", "-wal", "-shm"] {
            let mut path = self.path.clone().into_os_string();
            path.push(suffix);
            let _ = std::fs::remove_file(path);
        }
    }

    /// Worker options wired to this database, the mock clock and the mock
    /// collaborators. OS signals are ignored so tests never shut each other down.
    pub fn create_worker_options(&self) -> WorkerOptions {
        WorkerOptions::default()
            .pool(self.pool.clone())
            .clock(Arc::new(self.clock.clone()))
            .listen_os_shutdown_signals(false)
            .concurrency(4)
            .transport(self.transport.clone())
            .cipher(self.cipher.clone())
            .sync_processor(self.sync.clone())
            .uploader(self.uploader.clone())
            .reporter(self.reporter.clone())
    }

    pub fn worker_utils(&self) -> WorkerUtils {
        WorkerUtils::new(self.pool.clone()).with_clock(Arc::new(self.clock.clone()))
    }

    pub async fn get_jobs(&self) -> Vec<JobRow> {
        sqlx::query_as(
            r#"
                select sort_key, id, job_key, job_type, partition_key, state, attempts,
                    max_attempts, run_at, deferred_until, last_error, locked_by, locked_at,
                    cancelled
                    from jobs
                    order by sort_key asc
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .expect("Failed to get jobs")
    }

    pub async fn get_job(&self, job_id: &str) -> Option<JobRow> {
        self.get_jobs()
            .await
            .into_iter()
            .find(|job| job.id == job_id)
    }

    /// Every stored message, expired or not.
    pub async fn get_messages(&self) -> Vec<MessageRow> {
        sqlx::query_as(
            r#"
                select id, conversation_id, direction, read_at, expire_started_at, expires_at
                    from messages
                    order by created_at asc, id asc
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .expect("Failed to get messages")
    }

    pub async fn processed_envelope_count(&self) -> i64 {
        sqlx::query_scalar("select count(*) from processed_envelopes")
            .fetch_one(&self.pool)
            .await
            .expect("Failed to count processed envelopes")
    }

    /// Advances the mock clock to the time a job becomes due, its `run_at` or
    /// the end of its dependency wait.
    pub async fn advance_to_run_at(&self, job_id: &str) {
        let job = self.get_job(job_id).await.expect("job should exist");
        let due = job.run_at.max(job.deferred_until.unwrap_or(job.run_at));
        let now = self.clock_now_millis();
        if due > now {
            self.clock.advance(Duration::from_millis((due - now) as u64));
        }
    }

    pub fn clock_now_millis(&self) -> i64 {
        courier::Clock::now(&self.clock).timestamp_millis()
    }
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub async fn create_test_database() -> TestDatabase {
    let path = std::env::temp_dir().join(format!(
        "__test_courier_{}.db",
        uuid::Uuid::now_v7().simple()
    ));

    let connect_options = SqliteConnectOptions::new()
        .filename(&path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(connect_options)
        .await
        .expect("Failed to open test database");

    WorkerUtils::new(pool.clone())
        .migrate()
        .await
        .expect("Failed to migrate test database");

    TestDatabase {
        pool,
        path,
        clock: MockClock::new(start_time()),
        transport: Default::default(),
        cipher: Default::default(),
        sync: Default::default(),
        uploader: Default::default(),
        reporter: Default::default(),
    }
}

pub async fn with_test_db<F, Fut>(test_fn: F)
where
    F: FnOnce(TestDatabase) -> Fut + 'static,
    Fut: std::future::Future<Output = ()>,
{
    let local_set = LocalSet::new();

    local_set
        .run_until(async move {
            let test_db = create_test_database().await;
            let test_db_2 = test_db.clone();

            let result = tokio::task::spawn_local(async move {
                test_fn(test_db_2).await;
            })
            .await;

            test_db.drop().await;
            result.expect("Test failed");
        })
        .await;
}

pub fn envelope(id: &str, source: &str, content: &Content) -> Envelope {
    Envelope {
        id: id.to_string(),
        source: source.to_string(),
        source_device: 1,
        timestamp: start_time().timestamp_millis(),
        content: serde_json::to_vec(content).expect("content serializes"),
    }
}

pub fn data(conversation_id: &str, body: &str) -> Content {
    Content::Data {
        conversation_id: conversation_id.to_string(),
        body: body.to_string(),
    }
}

pub fn outgoing(message_id: &str, conversation_id: &str, recipient: &str) -> SendOutgoing {
    SendOutgoing {
        message_id: message_id.to_string(),
        conversation_id: conversation_id.to_string(),
        recipient: recipient.to_string(),
        body: format!("body of {message_id}"),
        attachments: vec![],
    }
}

pub async fn enable_logs() {
    static ONCE: OnceCell<()> = OnceCell::const_new();

    ONCE.get_or_init(|| async {
        let fmt_layer = tracing_subscriber::fmt::layer();
        // Log level set to debug except for sqlx set at warn (to not show all sql requests)
        let filter_layer = EnvFilter::try_new("debug,sqlx=warn").unwrap();

        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .init();
    })
    .await;
}
