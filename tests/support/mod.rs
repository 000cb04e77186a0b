//! Mock backend shared by the integration tests
//!
//! Plays the role a real driver plays in production: a switchable backend
//! whose sessions go bad when it is taken down.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tarn::config::PoolConfig;
use tarn::error::{Error, Result};
use tarn::hooks::{AlertSink, PoolListener, SessionInfo};
use tarn::session::{Session, SessionConfig, SessionFactory, Statement};

/// Shared switch standing in for the database server.
pub struct MockBackend {
    up: AtomicBool,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            up: AtomicBool::new(true),
            opened: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        })
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct MockFactory {
    backend: Arc<MockBackend>,
}

impl MockFactory {
    pub fn new(backend: Arc<MockBackend>) -> Arc<Self> {
        Arc::new(Self { backend })
    }
}

#[async_trait]
impl SessionFactory for MockFactory {
    async fn open(&self, _config: &SessionConfig) -> Result<Arc<dyn Session>> {
        if !self.backend.is_up() {
            return Err(Error::backend("backend refused the connection"));
        }
        self.backend.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockSession {
            backend: self.backend.clone(),
            schema: Mutex::new(None),
        }))
    }
}

pub struct MockSession {
    backend: Arc<MockBackend>,
    schema: Mutex<Option<String>>,
}

#[async_trait]
impl Session for MockSession {
    async fn ping(&self, _timeout: Duration) -> bool {
        self.backend.is_up()
    }

    async fn execute(&self, _sql: &str) -> Result<()> {
        if self.backend.is_up() {
            Ok(())
        } else {
            Err(Error::backend("lost connection to backend"))
        }
    }

    async fn commit(&self) -> Result<()> {
        Ok(())
    }

    async fn prepare(&self, sql: &str) -> Result<Arc<dyn Statement>> {
        Ok(Arc::new(MockStatement {
            sql: sql.to_string(),
        }))
    }

    async fn set_schema(&self, schema: &str) -> Result<()> {
        *self.schema.lock() = Some(schema.to_string());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.backend.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockStatement {
    sql: String,
}

#[async_trait]
impl Statement for MockStatement {
    async fn execute(&self) -> Result<u64> {
        Ok(0)
    }

    fn sql(&self) -> &str {
        &self.sql
    }
}

/// Counts alert edges.
#[derive(Default)]
pub struct RecordingAlerts {
    pub downs: AtomicUsize,
    pub ups: AtomicUsize,
    pub warnings: AtomicUsize,
}

impl RecordingAlerts {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl AlertSink for RecordingAlerts {
    fn on_down(&self, _pool_name: &str) {
        self.downs.fetch_add(1, Ordering::SeqCst);
    }

    fn on_up(&self, _pool_name: &str) {
        self.ups.fetch_add(1, Ordering::SeqCst);
    }

    fn on_warning(&self, _subject: &str, _message: &str) {
        self.warnings.fetch_add(1, Ordering::SeqCst);
    }
}

/// Counts listener hook invocations.
#[derive(Default)]
pub struct RecordingListener {
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl PoolListener for RecordingListener {
    fn after_acquire(&self, _session: &SessionInfo) {
        self.acquired.fetch_add(1, Ordering::SeqCst);
    }

    fn before_release(&self, _session: &SessionInfo) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Base configuration for tests: credentials set, monitor off.
pub fn test_config(min: usize, max: usize) -> PoolConfig {
    PoolConfig::new("postgres://localhost/tests")
        .with_name("test")
        .with_credentials("app", "secret")
        .with_min_size(min)
        .with_max_size(max)
        .with_heartbeat_freq(Duration::ZERO)
}
