use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::Value;

use crate::error::ScheduleError;
use crate::schedule::{Schedule, WeekdaySet};
use crate::time_util::{parse_datetime, parse_time_of_day, parse_weekday};

#[derive(Parser)]
#[command(name = "async-sched", about = "Network-reachable job scheduler")]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, global = true, default_value = "config.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the scheduler server
    Server {
        #[command(subcommand)]
        command: ServerCommands,
    },
    /// Talk to a running scheduler server
    Client {
        #[command(subcommand)]
        command: ClientCommands,
    },
}

#[derive(Subcommand)]
pub enum ServerCommands {
    /// Start accepting connections
    Run {
        /// Directory scanned by `update` for plugin modules
        #[arg(long)]
        update_path: Option<PathBuf>,
        /// Export ASYNC_SCHED_HOST/ASYNC_SCHED_PORT once the listener is bound
        #[arg(long)]
        set_env: bool,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
}

#[derive(Subcommand)]
pub enum ClientCommands {
    /// Ask the server to shut down
    QuitServer(ConnectArgs),
    /// List currently running schedules
    RequestSchedules(ConnectArgs),
    /// Re-scan the update path for plugin modules
    UpdateServer {
        #[arg(long)]
        module: Option<String>,
        #[command(flatten)]
        connect: ConnectArgs,
    },
    /// Cancel a running schedule by name
    StopSchedule {
        #[arg(long)]
        name: String,
        #[command(flatten)]
        connect: ConnectArgs,
    },
    /// Invoke a registered callback once
    RunCommand {
        #[arg(long)]
        name: String,
        /// A positional argument, as a JSON literal. May repeat.
        #[arg(long = "arg")]
        args: Vec<Value>,
        /// A keyword argument as key=value, value parsed as JSON. May repeat.
        #[arg(long = "kwarg", value_parser = parse_kwarg)]
        kwargs: Vec<(String, Value)>,
        #[command(flatten)]
        connect: ConnectArgs,
    },
    /// Install a new recurring or one-shot schedule
    ScheduleCommand {
        #[arg(long)]
        name: String,
        #[arg(long)]
        callback: String,
        #[arg(long = "arg")]
        args: Vec<Value>,
        #[arg(long = "kwarg", value_parser = parse_kwarg)]
        kwargs: Vec<(String, Value)>,
        #[command(flatten)]
        schedule: ScheduleArgs,
        #[command(flatten)]
        connect: ConnectArgs,
    },
}

#[derive(clap::Args)]
pub struct ConnectArgs {
    #[arg(long)]
    pub host: Option<String>,
    #[arg(long)]
    pub port: Option<u16>,
}

#[derive(clap::Args)]
pub struct ScheduleArgs {
    #[arg(long, default_value_t = 0)]
    pub weeks: i64,
    #[arg(long, default_value_t = 0)]
    pub days: i64,
    #[arg(long, default_value_t = 0)]
    pub hours: i64,
    #[arg(long, default_value_t = 0)]
    pub minutes: i64,
    #[arg(long, default_value_t = 0.0)]
    pub seconds: f64,
    /// Time of day the callback should fire at, e.g. "18:30"
    #[arg(long)]
    pub at: Option<String>,
    /// Weekday allowed to fire, e.g. "mon". May repeat; omit for every day.
    #[arg(long = "weekday")]
    pub weekdays: Vec<String>,
    #[arg(long)]
    pub repeat: bool,
    /// When the schedule's interval starts counting from, e.g. "2024-01-01 09:00:00"
    #[arg(long)]
    pub start_on: Option<String>,
    /// When the schedule stops firing, same format as --start-on
    #[arg(long)]
    pub end_on: Option<String>,
}

impl ScheduleArgs {
    pub fn into_schedule(self) -> Result<Schedule> {
        if self.weeks < 0 || self.days < 0 || self.hours < 0 || self.minutes < 0 || self.seconds < 0.0 {
            return Err(ScheduleError::InvalidField {
                field: "interval".into(),
                message: "interval components must be non-negative".into(),
            }
            .into());
        }
        let at = self.at.as_deref().map(parse_time_of_day).transpose()?;
        let weekdays = self
            .weekdays
            .iter()
            .map(|w| parse_weekday(w))
            .collect::<Result<Vec<_>>>()?;
        let start_on = self.start_on.as_deref().map(parse_datetime).transpose()?;
        let end_on = self.end_on.as_deref().map(parse_datetime).transpose()?;
        Ok(Schedule {
            weeks: self.weeks,
            days: self.days,
            hours: self.hours,
            minutes: self.minutes,
            seconds: self.seconds,
            at,
            weekdays: WeekdaySet::from_days(weekdays),
            repeat: self.repeat,
            start_on: start_on.unwrap_or_else(|| chrono::Local::now().naive_local()),
            end_on,
            ..Default::default()
        })
    }
}

fn parse_kwarg(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw.split_once('=').ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let value: Value = serde_json::from_str(value).map_err(|e| format!("invalid JSON for '{key}': {e}"))?;
    Ok((key.to_string(), value))
}

/// Resolve the default listen/connect address: `--host`/`--port` flag,
/// else `ASYNC_SCHED_HOST`/`ASYNC_SCHED_PORT`, else `127.0.0.1`/`8000` (§6.2).
pub fn resolve_addr(host: Option<String>, port: Option<u16>) -> (String, u16) {
    let host = host
        .or_else(|| std::env::var("ASYNC_SCHED_HOST").ok())
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let port = port
        .or_else(|| std::env::var("ASYNC_SCHED_PORT").ok().and_then(|p| p.parse().ok()))
        .unwrap_or(8000);
    (host, port)
}
