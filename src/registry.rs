use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};

use serde_json::{Map, Value};
use tokio::sync::RwLock;

/// A named, invokable callback. Synchronous and asynchronous callbacks are
/// handled uniformly through this trait — the "sync-or-async uniformity"
/// seam from the design notes. `SyncCallback` below wraps a plain function
/// into an already-resolved future so the execution loop never has to
/// branch on which kind it got.
pub trait Callback: Send + Sync {
    fn invoke(
        &self,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;
}

/// Adapts a synchronous `Fn(args, kwargs) -> Result<Value>` into a
/// `Callback`.
pub struct SyncCallback<F>(pub F)
where
    F: Fn(Vec<Value>, Map<String, Value>) -> anyhow::Result<Value> + Send + Sync + 'static;

impl<F> Callback for SyncCallback<F>
where
    F: Fn(Vec<Value>, Map<String, Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    fn invoke(
        &self,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>> {
        let result = (self.0)(args, kwargs);
        Box::pin(async move { result })
    }
}

/// Adapts an `async fn(args, kwargs) -> Result<Value>` into a `Callback`.
pub struct AsyncCallback<F>(pub F);

impl<F, Fut> Callback for AsyncCallback<F>
where
    F: Fn(Vec<Value>, Map<String, Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    fn invoke(
        &self,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>> {
        Box::pin((self.0)(args, kwargs))
    }
}

/// §4.3: named lookup of user-supplied callbacks. Registration is
/// idempotent by name — a later `register` replaces an earlier one.
#[derive(Default)]
pub struct CallbackRegistry {
    callbacks: RwLock<HashMap<String, Arc<dyn Callback>>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, name: impl Into<String>, callback: Arc<dyn Callback>) {
        self.callbacks.write().await.insert(name.into(), callback);
    }

    pub async fn lookup(&self, name: &str) -> Option<Arc<dyn Callback>> {
        self.callbacks.read().await.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        self.callbacks.read().await.keys().cloned().collect()
    }
}

/// Handle surface shared by a real `Scheduler` and the `NoopServer`
/// stand-in, so plugin modules can call `get_server().register_callback(...)`
/// without knowing whether a real server is running (§5 "Global state").
pub trait ServerHandle: Send + Sync {
    fn register_callback(&self, name: String, callback: Arc<dyn Callback>);
}

/// A plugin module's registration captured while no real server is active.
/// Not replayed into a later real server — see DESIGN.md's Open Question
/// decision, which preserves the source's behavior.
pub struct NoopServer {
    captured: std::sync::Mutex<Vec<String>>,
}

impl NoopServer {
    fn new() -> Self {
        NoopServer {
            captured: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Names captured via `register_callback` while this stand-in was active.
    pub fn captured_names(&self) -> Vec<String> {
        self.captured.lock().unwrap().clone()
    }
}

impl ServerHandle for NoopServer {
    fn register_callback(&self, name: String, _callback: Arc<dyn Callback>) {
        self.captured.lock().unwrap().push(name);
    }
}

static CURRENT_SERVER: OnceLock<RwLock<Option<Arc<dyn ServerHandle>>>> = OnceLock::new();

fn slot() -> &'static RwLock<Option<Arc<dyn ServerHandle>>> {
    CURRENT_SERVER.get_or_init(|| RwLock::new(None))
}

/// Set the process-wide "current server" pointer (§5). Cleared or
/// replaced on the next server construction; never cleared on shutdown.
pub async fn set_server(server: Arc<dyn ServerHandle>) {
    *slot().write().await = Some(server);
}

/// Get the current server, or a fresh `NoopServer` stand-in if none is set.
pub async fn get_server() -> Arc<dyn ServerHandle> {
    match slot().read().await.clone() {
        Some(server) => server,
        None => Arc::new(NoopServer::new()),
    }
}
