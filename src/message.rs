use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DecodeError;
use crate::schedule::Schedule;

/// §6.1 wire envelope: one JSON object per logical message, tagged by an
/// explicit `type` field — the idiomatic stand-in for the source's
/// class-name-driven polymorphic decoder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
#[allow(clippy::enum_variant_names)]
pub enum Message {
    Message {
        message: String,
    },
    Error {
        message: String,
    },
    Quit,
    Update {
        #[serde(default)]
        module_name: String,
    },
    RunCommand {
        callback_name: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default)]
        kwargs: Map<String, Value>,
    },
    ScheduleCommand {
        name: String,
        schedule: Schedule,
        callback_name: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default)]
        kwargs: Map<String, Value>,
    },
    RunningSchedule {
        name: String,
        schedule: Schedule,
    },
    ListSchedules {
        #[serde(default)]
        schedules: Vec<RunningScheduleEntry>,
    },
    StopSchedule {
        name: String,
    },
}

/// Same shape as the `RunningSchedule` wire tag, used as the element type
/// of `ListSchedules.schedules` so it nests without re-tagging itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunningScheduleEntry {
    pub name: String,
    pub schedule: Schedule,
}

impl Message {
    pub fn ok(message: impl Into<String>) -> Message {
        Message::Message { message: message.into() }
    }

    pub fn err(message: impl Into<String>) -> Message {
        Message::Error { message: message.into() }
    }

    /// One JSON object, newline terminated. Still byte-compatible with a
    /// reader that only accepts an unframed single write, since the
    /// trailing `\n` follows the complete object (§6.1).
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = serde_json::to_vec(self).expect("Message always serializes");
        bytes.push(b'\n');
        bytes
    }

    /// Decode the first complete JSON object found at the start of
    /// `buf`, returning it along with how many bytes it consumed
    /// (including a trailing newline, if present). Accepts both a
    /// newline-delimited frame and a bare unframed object.
    pub fn decode_prefix(buf: &[u8]) -> Result<Option<(Message, usize)>, DecodeError> {
        if buf.is_empty() {
            return Ok(None);
        }
        let mut de = serde_json::Deserializer::from_slice(buf).into_iter::<Message>();
        match de.next() {
            Some(Ok(message)) => {
                let mut consumed = de.byte_offset();
                if buf.get(consumed) == Some(&b'\n') {
                    consumed += 1;
                }
                Ok(Some((message, consumed)))
            }
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(e)) => Err(DecodeError::Malformed(e)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sample_schedule() -> Schedule {
        Schedule {
            seconds: 5.0,
            repeat: true,
            start_on: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(12, 0, 0).unwrap(),
            ..Default::default()
        }
    }

    fn round_trip(m: Message) {
        let encoded = m.encode();
        let (decoded, consumed) = Message::decode_prefix(&encoded).unwrap().unwrap();
        assert_eq!(decoded, m);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn round_trips_every_variant() {
        round_trip(Message::ok("hello"));
        round_trip(Message::err("boom"));
        round_trip(Message::Quit);
        round_trip(Message::Update { module_name: "foo".into() });
        round_trip(Message::RunCommand {
            callback_name: "print".into(),
            args: vec![Value::from(1)],
            kwargs: Map::new(),
        });
        round_trip(Message::ScheduleCommand {
            name: "5 Seconds".into(),
            schedule: sample_schedule(),
            callback_name: "print".into(),
            args: vec![],
            kwargs: Map::new(),
        });
        round_trip(Message::RunningSchedule {
            name: "5 Seconds".into(),
            schedule: sample_schedule(),
        });
        round_trip(Message::ListSchedules {
            schedules: vec![RunningScheduleEntry {
                name: "5 Seconds".into(),
                schedule: sample_schedule(),
            }],
        });
        round_trip(Message::StopSchedule { name: "5 Seconds".into() });
    }

    #[test]
    fn decodes_unframed_object_without_trailing_newline() {
        let mut encoded = Message::ok("hi").encode();
        encoded.pop(); // drop the newline — still must decode
        let (decoded, consumed) = Message::decode_prefix(&encoded).unwrap().unwrap();
        assert_eq!(decoded, Message::ok("hi"));
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn reports_incomplete_frame_as_none() {
        let encoded = Message::ok("hi").encode();
        let partial = &encoded[..encoded.len() - 3];
        assert!(Message::decode_prefix(partial).unwrap().is_none());
    }

    #[test]
    fn rejects_garbage() {
        assert!(Message::decode_prefix(b"not json at all\n").is_err());
    }
}
