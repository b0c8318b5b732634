#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier::collaborators::{Ciphertext, DecryptError, ServiceError, SessionCipher};
use courier::{BatchMessageProcessor, Content, Envelope, SystemClock, WorkerUtils};
use courier::streams::JobSignals;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct BenchDatabase {
    pub pool: SqlitePool,
    pub path: PathBuf,
}

impl BenchDatabase {
    pub async fn drop(&self) {
        self.pool.close().await;
        for suffix in ["", "-wal", "-shm"] {
            let mut path = self.path.clone().into_os_string();
            path.push(suffix);
            let _ = std::fs::remove_file(path);
        }
    }

    pub fn worker_utils(&self) -> WorkerUtils {
        WorkerUtils::new(self.pool.clone())
    }

    pub fn batch_processor(&self) -> BatchMessageProcessor {
        BatchMessageProcessor::new(
            self.pool.clone(),
            Arc::new(JsonCipher),
            Arc::new(SystemClock),
            JobSignals::new(),
        )
    }

    pub async fn clear_jobs(&self) {
        sqlx::query("delete from jobs")
            .execute(&self.pool)
            .await
            .expect("Failed to clear jobs");
        sqlx::query("delete from processed_envelopes")
            .execute(&self.pool)
            .await
            .expect("Failed to clear processed envelopes");
    }

    pub async fn job_count(&self) -> i64 {
        sqlx::query_scalar("select count(*) from jobs")
            .fetch_one(&self.pool)
            .await
            .expect("Failed to count jobs")
    }
}

pub async fn create_bench_database() -> BenchDatabase {
    let path = std::env::temp_dir().join(format!("__bench_courier_{}.db", Uuid::now_v7().simple()));

    let connect_options = SqliteConnectOptions::new()
        .filename(&path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(connect_options)
        .await
        .expect("Failed to open bench database");

    WorkerUtils::new(pool.clone())
        .migrate()
        .await
        .expect("Failed to migrate bench database");

    BenchDatabase { pool, path }
}

/// Envelope content is plain JSON.
pub struct JsonCipher;

#[async_trait]
impl SessionCipher for JsonCipher {
    async fn decrypt(&self, envelope: &Envelope) -> Result<Content, DecryptError> {
        serde_json::from_slice(&envelope.content).map_err(|e| DecryptError::Terminal(e.to_string()))
    }

    async fn encrypt(&self, plaintext: &[u8], _recipient: &str) -> Result<Ciphertext, ServiceError> {
        Ok(Ciphertext(plaintext.to_vec()))
    }

    async fn archive_session(&self, _recipient: &str) -> Result<(), ServiceError> {
        Ok(())
    }
}

/// `count` envelopes from a handful of senders, ids unique per `round`.
pub fn bench_envelopes(round: u64, count: usize) -> Vec<Envelope> {
    (0..count)
        .map(|i| {
            let content = Content::Data {
                conversation_id: format!("conv-{}", i % 8),
                body: format!("benchmark_message_{i}"),
            };
            Envelope {
                id: format!("env-{round}-{i}"),
                source: format!("sender-{}", i % 8),
                source_device: 1,
                timestamp: 1_700_000_000_000 + i as i64,
                content: serde_json::to_vec(&content).expect("content serializes"),
            }
        })
        .collect()
}
