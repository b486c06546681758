use anyhow::Result;
use serde_json::{Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, info};

use crate::error::DecodeError;
use crate::message::Message;
use crate::schedule::Schedule;

/// §4.5: owns a single TCP connection, one method per request kind.
pub struct Client {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl Client {
    pub async fn connect(addr: impl ToSocketAddrs + std::fmt::Display) -> Result<Self> {
        let addr_display = addr.to_string();
        let stream = TcpStream::connect(addr).await?;
        info!(addr = %addr_display, "client connected");
        Ok(Client { stream, buf: Vec::new() })
    }

    async fn request(&mut self, message: &Message) -> Result<Message> {
        self.stream.write_all(&message.encode()).await?;
        self.stream.flush().await?;
        self.read_response().await
    }

    /// Read once, then retry once on an empty read, until a full message
    /// decodes or the connection closes (§4.5).
    async fn read_response(&mut self) -> Result<Message> {
        let mut empty_reads = 0;
        let mut chunk = [0u8; 4096];
        loop {
            if let Some((message, consumed)) = Message::decode_prefix(&self.buf)? {
                self.buf.drain(..consumed);
                return Ok(message);
            }

            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                empty_reads += 1;
                if empty_reads > 1 {
                    return Err(DecodeError::Closed.into());
                }
                continue;
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    pub async fn quit_server(&mut self) -> Result<Message> {
        self.request(&Message::Quit).await
    }

    pub async fn update_server(&mut self, module_name: impl Into<String>) -> Result<Message> {
        self.request(&Message::Update { module_name: module_name.into() }).await
    }

    pub async fn request_schedules(&mut self) -> Result<Message> {
        self.request(&Message::ListSchedules { schedules: vec![] }).await
    }

    pub async fn run_command(&mut self, callback_name: impl Into<String>, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<Message> {
        self.request(&Message::RunCommand {
            callback_name: callback_name.into(),
            args,
            kwargs,
        })
        .await
    }

    pub async fn schedule_command(
        &mut self,
        name: impl Into<String>,
        schedule: Schedule,
        callback_name: impl Into<String>,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Message> {
        self.request(&Message::ScheduleCommand {
            name: name.into(),
            schedule,
            callback_name: callback_name.into(),
            args,
            kwargs,
        })
        .await
    }

    pub async fn stop_schedule(&mut self, name: impl Into<String>) -> Result<Message> {
        self.request(&Message::StopSchedule { name: name.into() }).await
    }

    pub async fn close(mut self) -> Result<()> {
        self.stream.shutdown().await?;
        debug!("client connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{CallbackRegistry, SyncCallback};
    use crate::server::{Scheduler, ServerConfig};
    use std::sync::Arc;

    async fn start_test_server() -> std::net::SocketAddr {
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
        scheduler.start().await.unwrap()
    }

    #[tokio::test]
    async fn run_command_round_trip() {
        let addr = start_test_server().await;
        let mut client = Client::connect(addr).await.unwrap();
        let response = client.run_command("ping", vec![], Map::new()).await.unwrap();
        assert_eq!(response, Message::ok("Command \"ping\" ran successfully!"));
    }

    #[tokio::test]
    async fn schedule_list_stop_round_trip() {
        let addr = start_test_server().await;
        let mut client = Client::connect(addr).await.unwrap();

        let schedule = Schedule {
            seconds: 3600.0,
            repeat: true,
            ..Default::default()
        };
        client
            .schedule_command("hourly", schedule, "ping", vec![], Map::new())
            .await
            .unwrap();

        let response = client.request_schedules().await.unwrap();
        match response {
            Message::ListSchedules { schedules } => assert_eq!(schedules.len(), 1),
            other => panic!("unexpected response: {other:?}"),
        }

        let response = client.stop_schedule("hourly").await.unwrap();
        assert_eq!(response, Message::ok("Stopped running the schedule named \"hourly\"!"));
    }

    #[tokio::test]
    async fn quit_server_then_close() {
        let addr = start_test_server().await;
        let mut client = Client::connect(addr).await.unwrap();
        let response = client.quit_server().await.unwrap();
        assert_eq!(response, Message::ok("Stopping server"));
        client.close().await.unwrap();
    }
}
