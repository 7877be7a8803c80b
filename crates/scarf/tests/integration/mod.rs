//! Shared fixtures for the loopback integration tests

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use scarf::{
    handler_fn, Client, Handler, HandlerError, MethodTable, Outcome, Server, ServerConfig, ServerHandle,
    StreamSink, Value,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tracing_subscriber::EnvFilter;

/// Install a `RUST_LOG` driven subscriber once per test binary
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub async fn success(_args: Vec<Value>) -> Result<Outcome, HandlerError> {
    Ok(Outcome::value(json!([])))
}

pub async fn failure(_args: Vec<Value>) -> Result<Outcome, HandlerError> {
    Err(HandlerError::new("Failed to join"))
}

pub async fn echo(args: Vec<Value>) -> Result<Outcome, HandlerError> {
    Ok(Outcome::value(Value::Array(args)))
}

/// Sleeps for the number of milliseconds given as first argument
pub async fn sleep_then_echo(args: Vec<Value>) -> Result<Outcome, HandlerError> {
    let millis = args.first().and_then(Value::as_u64).unwrap_or(0);
    tokio::time::sleep(Duration::from_millis(millis)).await;
    Ok(Outcome::value(Value::Array(args)))
}

/// Produces three `{"beep": "boop"}` chunks from a background task
pub async fn beeps(_args: Vec<Value>) -> Result<Outcome, HandlerError> {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        for _ in 0..3 {
            if tx.send(json!({"beep": "boop"})).await.is_err() {
                break;
            }
        }
    });
    Ok(Outcome::from_receiver(rx))
}

/// Panics the way a synchronous throw would
pub struct Exploding;

#[async_trait]
impl Handler for Exploding {
    async fn call(&self, _args: Vec<Value>) -> Result<Outcome, HandlerError> {
        panic!("Fatal")
    }
}

/// Readable handler whose chunks the test pushes by hand
pub struct Controlled {
    source: Mutex<Option<mpsc::Receiver<Value>>>,
}

impl Controlled {
    pub fn pair() -> (Self, mpsc::Sender<Value>) {
        let (tx, rx) = mpsc::channel(16);
        let handler = Self {
            source: Mutex::new(Some(rx)),
        };
        (handler, tx)
    }
}

#[async_trait]
impl Handler for Controlled {
    async fn call(&self, _args: Vec<Value>) -> Result<Outcome, HandlerError> {
        let source = self.source.lock().unwrap().take();
        source
            .map(Outcome::from_receiver)
            .ok_or_else(|| HandlerError::new("source already consumed"))
    }
}

/// What a [`Collector`] sink has seen
#[derive(Clone, Default)]
pub struct Collected {
    pub chunks: Arc<Mutex<Vec<Value>>>,
    pub finished: Arc<AtomicBool>,
    pub aborted: Arc<Mutex<Option<String>>>,
}

impl Collected {
    pub fn chunks(&self) -> Vec<Value> {
        self.chunks.lock().unwrap().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn aborted(&self) -> Option<String> {
        self.aborted.lock().unwrap().clone()
    }
}

/// Writable handler recording every chunk; `finish` takes a while
pub struct Collector {
    collected: Collected,
    reject: Option<String>,
}

impl Collector {
    pub fn pair() -> (Self, Collected) {
        let collected = Collected::default();
        let handler = Self {
            collected: collected.clone(),
            reject: None,
        };
        (handler, collected)
    }

    /// Collector whose sink rejects chunks equal to `value`
    pub fn rejecting(value: &str) -> (Self, Collected) {
        let (mut handler, collected) = Self::pair();
        handler.reject = Some(value.to_string());
        (handler, collected)
    }
}

struct CollectorSink {
    collected: Collected,
    reject: Option<String>,
}

#[async_trait]
impl StreamSink for CollectorSink {
    async fn write(&mut self, chunk: Value) -> Result<(), HandlerError> {
        if self.reject.as_deref().is_some_and(|reject| chunk == json!(reject)) {
            return Err(HandlerError::new(format!("rejected {}", chunk)));
        }
        self.collected.chunks.lock().unwrap().push(chunk);
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), HandlerError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.collected.finished.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn abort(&mut self, reason: &str) {
        *self.collected.aborted.lock().unwrap() = Some(reason.to_string());
    }
}

#[async_trait]
impl Handler for Collector {
    async fn call(&self, _args: Vec<Value>) -> Result<Outcome, HandlerError> {
        Ok(Outcome::writable(CollectorSink {
            collected: self.collected.clone(),
            reject: self.reject.clone(),
        }))
    }
}

/// Release valve for a [`Gated`] sink
#[derive(Clone)]
pub struct Gate {
    permits: Arc<Semaphore>,
    taken: Arc<AtomicUsize>,
}

impl Gate {
    /// Let the sink take `chunks` more chunks
    pub fn release(&self, chunks: usize) {
        self.permits.add_permits(chunks);
    }

    /// Chunks the sink has taken so far
    pub fn taken(&self) -> usize {
        self.taken.load(Ordering::SeqCst)
    }
}

/// Writable handler whose sink takes a chunk only once the test releases it
///
/// Without a release the sink never drains.
pub struct Gated {
    gate: Gate,
}

impl Gated {
    pub fn pair() -> (Self, Gate) {
        let gate = Gate {
            permits: Arc::new(Semaphore::new(0)),
            taken: Arc::new(AtomicUsize::new(0)),
        };
        (Self { gate: gate.clone() }, gate)
    }
}

struct GatedSink {
    gate: Gate,
}

#[async_trait]
impl StreamSink for GatedSink {
    async fn write(&mut self, _chunk: Value) -> Result<(), HandlerError> {
        let permit = self
            .gate
            .permits
            .acquire()
            .await
            .map_err(|_| HandlerError::new("gate closed"))?;
        permit.forget();
        self.gate.taken.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Handler for Gated {
    async fn call(&self, _args: Vec<Value>) -> Result<Outcome, HandlerError> {
        Ok(Outcome::writable(GatedSink {
            gate: self.gate.clone(),
        }))
    }
}

/// Method table covering the plain call paths
pub fn basic_methods() -> MethodTable {
    MethodTable::new()
        .with_method("success", handler_fn(success))
        .with_method("error", handler_fn(failure))
        .with_method("exception", Exploding)
        .with_method("echo", handler_fn(echo))
        .with_method("sleep", handler_fn(sleep_then_echo))
        .with_method("readable", handler_fn(beeps))
        .with_method("nested.method", handler_fn(success))
}

/// Start a loopback server and connect one client to it
pub async fn start(methods: MethodTable) -> Result<(ServerHandle, Client)> {
    start_with(methods, ServerConfig::default()).await
}

/// Like [`start`], with explicit server configuration
pub async fn start_with(methods: MethodTable, config: ServerConfig) -> Result<(ServerHandle, Client)> {
    init_tracing();
    let server = Server::with_config(methods, config);
    let handle = server.listen("127.0.0.1:0").await?;
    let client = Client::connect(handle.local_addr()).await?;
    Ok((handle, client))
}

/// Poll `condition` until it holds or a second has passed
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
