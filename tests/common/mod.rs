//! Shared harness for the in-memory integration suites.
#![allow(dead_code)]

use image::{ImageBuffer, ImageFormat, Rgba};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use imagebatch_core::config::{Backend, CompletionPolicyKind, ImageBatchConfig};
use imagebatch_core::messaging::{InMemoryTaskQueue, Lane, TaskQueue};
use imagebatch_core::orchestration::{BatchProgress, OrchestrationSystem, OrchestrationSystemBuilder};
use imagebatch_core::store::{BatchStore, InMemoryBatchStore};

/// Encoded RGBA PNG of the given size
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = ImageBuffer::from_fn(width, height, |x, y| {
        Rgba([(x % 256) as u8, (y % 256) as u8, 128, 255])
    });
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .expect("encode test png");
    bytes
}

/// Serves source images and receives delivery callbacks
pub struct ImageServer {
    pub server: MockServer,
}

impl ImageServer {
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    pub fn url(&self, route: &str) -> String {
        format!("{}{route}", self.server.uri())
    }

    pub async fn serve_png(&self, route: &str, width: u32, height: u32) -> String {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/png")
                    .set_body_bytes(png_bytes(width, height)),
            )
            .mount(&self.server)
            .await;
        self.url(route)
    }

    pub async fn serve_status(&self, route: &str, status: u16) -> String {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.server)
            .await;
        self.url(route)
    }

    /// Accept delivery callbacks on `route` with the given status
    pub async fn accept_callbacks(&self, route: &str, status: u16) -> String {
        Mock::given(method("POST"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.server)
            .await;
        self.url(route)
    }

    pub async fn callback_bodies(&self, route: &str) -> Vec<serde_json::Value> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|r| r.method.as_str() == "POST" && r.url.path() == route)
            .filter_map(|r| serde_json::from_slice(&r.body).ok())
            .collect()
    }
}

pub fn test_config(output_dir: &std::path::Path) -> ImageBatchConfig {
    let mut config = ImageBatchConfig::default();
    config.database.backend = Backend::Memory;
    config.database.run_migrations = false;
    config.queue.poll_interval_ms = 10;
    config.queue.visibility_timeout_seconds = 1;
    config.queue.max_read_count = 3;
    config.worker.concurrency = 4;
    config.worker.shutdown_timeout_seconds = 5;
    config.fetch.timeout_seconds = 5;
    config.storage.output_dir = output_dir.to_path_buf();
    config.finalization.policy = CompletionPolicyKind::AllSucceeded;
    config
}

/// An in-memory system with direct handles on its store and queue
pub struct TestSystem {
    pub system: OrchestrationSystem,
    pub store: Arc<InMemoryBatchStore>,
    pub queue: Arc<InMemoryTaskQueue>,
    pub output: TempDir,
}

impl TestSystem {
    pub fn new(configure: impl FnOnce(&mut ImageBatchConfig)) -> Self {
        Self::with_builder(configure, |builder| builder)
    }

    pub fn with_builder(
        configure: impl FnOnce(&mut ImageBatchConfig),
        customize: impl FnOnce(OrchestrationSystemBuilder) -> OrchestrationSystemBuilder,
    ) -> Self {
        let output = tempfile::tempdir().expect("tempdir");
        let mut config = test_config(output.path());
        configure(&mut config);

        let store = Arc::new(InMemoryBatchStore::new());
        let queue = Arc::new(InMemoryTaskQueue::new());
        let builder = OrchestrationSystemBuilder::new(
            config,
            Arc::clone(&store) as Arc<dyn BatchStore>,
            Arc::clone(&queue) as Arc<dyn TaskQueue>,
        );
        let system = customize(builder).build().expect("build system");

        Self {
            system,
            store,
            queue,
            output,
        }
    }

    /// Poll every lane until a full round reads nothing. Returns messages read.
    pub async fn drain(&self) -> usize {
        let mut total = 0;
        loop {
            let mut round = 0;
            for lane in Lane::ALL {
                round += self
                    .system
                    .worker_pool()
                    .poll_once(lane)
                    .await
                    .expect("poll lane");
            }
            if round == 0 {
                return total;
            }
            total += round;
        }
    }

    pub async fn status(&self, batch_uuid: Uuid) -> BatchProgress {
        self.system.get_status(batch_uuid).await.expect("status")
    }

    pub async fn lane_depth(&self, lane: Lane) -> i64 {
        self.queue.depth(lane).await.expect("depth")
    }
}

/// Wait until a batch leaves its active states
pub async fn wait_for_terminal(system: &OrchestrationSystem, batch_uuid: Uuid) -> BatchProgress {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let progress = system.get_status(batch_uuid).await.expect("status");
            if progress.status.is_terminal() {
                return progress;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("batch reached a terminal state")
}
