use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::DispatchError;
use crate::message::{Message, RunningScheduleEntry};
use crate::plugins::PluginSource;
use crate::registry::{Callback, CallbackRegistry, ServerHandle};
use crate::schedule::Schedule;
use crate::task::ScheduleTask;

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub update_path: Option<PathBuf>,
}

/// The scheduler server (§4.4). One `RwLock`-guarded table of live
/// `ScheduleTask`s, one accept loop, one handler task per connection —
/// ordering falls out of that shape for free, see DESIGN.md.
pub struct Scheduler {
    host: String,
    port: u16,
    update_path: Option<PathBuf>,
    table: Arc<RwLock<HashMap<String, ScheduleTask>>>,
    callbacks: Arc<CallbackRegistry>,
    plugin_sources: Arc<Vec<Box<dyn PluginSource>>>,
    cancel: CancellationToken,
    serving: Arc<std::sync::atomic::AtomicBool>,
}

impl Scheduler {
    pub fn new(config: ServerConfig, callbacks: Arc<CallbackRegistry>, plugin_sources: Vec<Box<dyn PluginSource>>) -> Arc<Scheduler> {
        Arc::new(Scheduler {
            host: config.host,
            port: config.port,
            update_path: config.update_path,
            table: Arc::new(RwLock::new(HashMap::new())),
            callbacks,
            plugin_sources: Arc::new(plugin_sources),
            cancel: CancellationToken::new(),
            serving: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        })
    }

    pub fn is_serving(&self) -> bool {
        self.serving.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Binds the listener and spawns the accept loop. Safe to call once
    /// per instance.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<std::net::SocketAddr> {
        let listener = TcpListener::bind((self.host.as_str(), self.port)).await?;
        let addr = listener.local_addr()?;
        self.serving.store(true, std::sync::atomic::Ordering::SeqCst);
        info!(addr = %addr, "scheduler server listening");

        let server = self.clone();
        tokio::spawn(async move {
            server.accept_loop(listener).await;
        });
        Ok(addr)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("accept loop shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let server = self.clone();
                            tokio::spawn(async move {
                                server.handle_connection(stream, peer).await;
                            });
                        }
                        Err(err) => {
                            warn!(error = %err, "failed to accept connection");
                        }
                    }
                }
            }
        }
        self.serving.store(false, std::sync::atomic::Ordering::SeqCst);
    }

    /// Per-connection state machine: Accepted -> Reading -> Dispatching
    /// -> Writing -> Reading (loop) -> Closed.
    async fn handle_connection(self: Arc<Self>, mut stream: TcpStream, peer: std::net::SocketAddr) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];

        loop {
            if !self.is_serving() {
                break;
            }

            let request = loop {
                if let Some((message, consumed)) = match Message::decode_prefix(&buf) {
                    Ok(decoded) => decoded,
                    Err(err) => {
                        error!(peer = %peer, error = %err, "failed to decode frame");
                        buf.clear();
                        None
                    }
                } {
                    buf.drain(..consumed);
                    break Some(message);
                }

                let n = tokio::select! {
                    _ = self.cancel.cancelled() => break None,
                    read = stream.read(&mut chunk) => match read {
                        Ok(n) => n,
                        Err(err) => {
                            warn!(peer = %peer, error = %err, "read failed");
                            break None;
                        }
                    },
                };
                if n == 0 {
                    break None; // EOF
                }
                buf.extend_from_slice(&chunk[..n]);
            };

            let Some(request) = request else {
                break;
            };

            let response = self.dispatch(request).await;
            if stream.write_all(&response.encode()).await.is_err() {
                break;
            }
            if matches!(response, Message::Message { ref message } if message == "Stopping server") {
                let server = self.clone();
                tokio::spawn(async move { server.stop().await });
            }
        }
        info!(peer = %peer, "connection closed");
    }

    async fn dispatch(self: &Arc<Self>, request: Message) -> Message {
        match request {
            Message::Quit => Message::ok("Stopping server"),
            Message::Update { module_name } => self.handle_update(module_name).await,
            Message::ListSchedules { .. } => {
                let schedules = self.list().await;
                Message::ListSchedules {
                    schedules: schedules
                        .into_iter()
                        .map(|(name, schedule)| RunningScheduleEntry { name, schedule })
                        .collect(),
                }
            }
            Message::RunCommand { callback_name, args, kwargs } => self.handle_run_command(callback_name, args, kwargs).await,
            Message::ScheduleCommand {
                name,
                schedule,
                callback_name,
                args,
                kwargs,
            } => self.handle_schedule_command(name, schedule, callback_name, args, kwargs).await,
            Message::StopSchedule { name } => self.handle_stop_schedule(name).await,
            _ => Message::err("Unknown command given!"),
        }
    }

    async fn handle_update(self: &Arc<Self>, module_name: String) -> Message {
        let Some(update_path) = self.update_path.clone() else {
            return Message::err("No update path configured");
        };
        let restrict = if module_name.is_empty() { None } else { Some(module_name.as_str()) };
        match self
            .callbacks
            .update_from_directory(&update_path, restrict, &self.plugin_sources)
            .await
        {
            Ok(()) => Message::ok(format!("Updated Command {module_name}")),
            Err(err) => Message::err(err.to_string()),
        }
    }

    async fn handle_run_command(&self, name: String, args: Vec<Value>, kwargs: Map<String, Value>) -> Message {
        let Some(callback) = self.callbacks.lookup(&name).await else {
            return Message::err(DispatchError::UnknownCallback(name).to_string());
        };
        match callback.invoke(args, kwargs).await {
            Ok(_) => Message::ok(format!("Command \"{name}\" ran successfully!")),
            Err(source) => Message::err(DispatchError::CallbackFailed { name, source }.to_string()),
        }
    }

    async fn handle_schedule_command(
        self: &Arc<Self>,
        name: String,
        schedule: Schedule,
        callback_name: String,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Message {
        let Some(callback) = self.callbacks.lookup(&callback_name).await else {
            return Message::err(DispatchError::UnknownCallback(callback_name).to_string());
        };
        self.add(name, schedule, callback, args, kwargs).await;
        Message::ok(format!("Scheduled Command \"{callback_name}\" is running!"))
    }

    async fn handle_stop_schedule(&self, name: String) -> Message {
        if self.remove(&name).await {
            Message::ok(format!("Stopped running the schedule named \"{name}\"!"))
        } else {
            Message::err(format!("No schedule named '{name}'"))
        }
    }

    /// §4.4 `add`: removes-and-cancels any existing same-named task first.
    pub async fn add(
        &self,
        name: String,
        schedule: Schedule,
        callback: Arc<dyn Callback>,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) {
        let task = ScheduleTask::spawn(name.clone(), schedule, callback, args, kwargs);
        let mut table = self.table.write().await;
        if let Some(old) = table.insert(name, task) {
            old.cancel();
        }
    }

    /// §4.4 `remove`: cancels the task and removes the table entry. No-op if absent.
    pub async fn remove(&self, name: &str) -> bool {
        let mut table = self.table.write().await;
        match table.remove(name) {
            Some(task) => {
                task.cancel();
                true
            }
            None => false,
        }
    }

    /// §4.4 `list`: a consistent snapshot of every live schedule.
    pub async fn list(&self) -> Vec<(String, Schedule)> {
        let table = self.table.read().await;
        let mut result = Vec::with_capacity(table.len());
        for (name, task) in table.iter() {
            result.push((name.clone(), task.schedule_snapshot().await));
        }
        result
    }

    /// §4.4 `stop`: cancels every task and the accept loop, closes the
    /// listener (dropped once the accept loop returns).
    pub async fn stop(&self) {
        self.cancel.cancel();
        let mut table = self.table.write().await;
        for (_, task) in table.drain() {
            task.cancel();
        }
        self.serving.store(false, std::sync::atomic::Ordering::SeqCst);
    }
}

impl ServerHandle for Scheduler {
    fn register_callback(&self, name: String, callback: Arc<dyn Callback>) {
        let callbacks = self.callbacks.clone();
        tokio::spawn(async move {
            callbacks.register(name, callback).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SyncCallback;
    use tokio::net::TcpStream;

    async fn start_test_server() -> (Arc<Scheduler>, std::net::SocketAddr) {
        let callbacks = Arc::new(CallbackRegistry::new());
        callbacks
            .register("ping", Arc::new(SyncCallback(|_, _| Ok(Value::from("pong")))))
            .await;
        let scheduler = Scheduler::new(
            ServerConfig {
                host: "127.0.0.1".into(),
                port: 0,
                update_path: None,
            },
            callbacks,
            vec![],
        );
        let addr = scheduler.start().await.unwrap();
        (scheduler, addr)
    }

    async fn roundtrip(stream: &mut TcpStream, message: &Message) -> Message {
        stream.write_all(&message.encode()).await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            if let Some((decoded, _)) = Message::decode_prefix(&buf).unwrap() {
                return decoded;
            }
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before a full response arrived");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    #[tokio::test]
    async fn run_command_invokes_registered_callback() {
        let (_scheduler, addr) = start_test_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let response = roundtrip(
            &mut stream,
            &Message::RunCommand {
                callback_name: "ping".into(),
                args: vec![],
                kwargs: Map::new(),
            },
        )
        .await;
        assert_eq!(response, Message::ok("Command \"ping\" ran successfully!"));
    }

    #[tokio::test]
    async fn run_command_unknown_callback_is_an_error() {
        let (_scheduler, addr) = start_test_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let response = roundtrip(
            &mut stream,
            &Message::RunCommand {
                callback_name: "missing".into(),
                args: vec![],
                kwargs: Map::new(),
            },
        )
        .await;
        assert!(matches!(response, Message::Error { .. }));
    }

    #[tokio::test]
    async fn schedule_then_list_then_stop_then_list_empty() {
        let (_scheduler, addr) = start_test_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let schedule = Schedule {
            seconds: 3600.0,
            repeat: true,
            ..Default::default()
        };
        let response = roundtrip(
            &mut stream,
            &Message::ScheduleCommand {
                name: "hourly-ping".into(),
                schedule,
                callback_name: "ping".into(),
                args: vec![],
                kwargs: Map::new(),
            },
        )
        .await;
        assert_eq!(response, Message::ok("Scheduled Command \"ping\" is running!"));

        let response = roundtrip(&mut stream, &Message::ListSchedules { schedules: vec![] }).await;
        match response {
            Message::ListSchedules { schedules } => assert_eq!(schedules.len(), 1),
            other => panic!("unexpected response: {other:?}"),
        }

        let response = roundtrip(&mut stream, &Message::StopSchedule { name: "hourly-ping".into() }).await;
        assert_eq!(response, Message::ok("Stopped running the schedule named \"hourly-ping\"!"));

        let response = roundtrip(&mut stream, &Message::ListSchedules { schedules: vec![] }).await;
        match response {
            Message::ListSchedules { schedules } => assert!(schedules.is_empty()),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stopping_an_absent_schedule_is_an_error() {
        let (_scheduler, addr) = start_test_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let response = roundtrip(&mut stream, &Message::StopSchedule { name: "nope".into() }).await;
        assert!(matches!(response, Message::Error { .. }));
    }

    #[tokio::test]
    async fn adding_same_name_twice_cancels_the_first() {
        let (scheduler, _addr) = start_test_server().await;
        let cb = scheduler.callbacks.lookup("ping").await.unwrap();
        scheduler
            .add("dup".into(), Schedule::default(), cb.clone(), vec![], Map::new())
            .await;
        scheduler.add("dup".into(), Schedule::default(), cb, vec![], Map::new()).await;
        assert_eq!(scheduler.table.read().await.len(), 1);
    }

    #[tokio::test]
    async fn quit_stops_the_server() {
        let (scheduler, addr) = start_test_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let response = roundtrip(&mut stream, &Message::Quit).await;
        assert_eq!(response, Message::ok("Stopping server"));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!scheduler.is_serving());
    }
}
