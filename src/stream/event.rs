//! Header and event model for the recording format.

use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub const ASCIICAST_VERSION: u32 = 2;

/// First line of every stream file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsciicastHeader {
    pub version: u32,
    pub width: u16,
    pub height: u16,
    /// Unix seconds at recording start; event times are relative to this.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

impl AsciicastHeader {
    pub fn new(width: u16, height: u16, timestamp: i64) -> Self {
        Self {
            version: ASCIICAST_VERSION,
            width,
            height,
            timestamp,
            command: None,
            title: None,
            env: HashMap::new(),
        }
    }
}

/// One recorded event. On the wire this is the heterogeneous array
/// `[t, type, data]` with `type` one of `"o"`, `"i"`, `"r"`.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Output { time: f64, data: String },
    Input { time: f64, data: String },
    Resize { time: f64, cols: u16, rows: u16 },
}

impl StreamEvent {
    pub fn time(&self) -> f64 {
        match self {
            StreamEvent::Output { time, .. }
            | StreamEvent::Input { time, .. }
            | StreamEvent::Resize { time, .. } => *time,
        }
    }

    /// Returns a copy shifted so that `base` becomes t=0.
    pub fn rebased(&self, base: f64) -> Self {
        let shift = |t: f64| (t - base).max(0.0);
        match self {
            StreamEvent::Output { time, data } => StreamEvent::Output {
                time: shift(*time),
                data: data.clone(),
            },
            StreamEvent::Input { time, data } => StreamEvent::Input {
                time: shift(*time),
                data: data.clone(),
            },
            StreamEvent::Resize { time, cols, rows } => StreamEvent::Resize {
                time: shift(*time),
                cols: *cols,
                rows: *rows,
            },
        }
    }
}

impl Serialize for StreamEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(3))?;
        match self {
            StreamEvent::Output { time, data } => {
                seq.serialize_element(time)?;
                seq.serialize_element("o")?;
                seq.serialize_element(data)?;
            }
            StreamEvent::Input { time, data } => {
                seq.serialize_element(time)?;
                seq.serialize_element("i")?;
                seq.serialize_element(data)?;
            }
            StreamEvent::Resize { time, cols, rows } => {
                seq.serialize_element(time)?;
                seq.serialize_element("r")?;
                seq.serialize_element(&format!("{cols}x{rows}"))?;
            }
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for StreamEvent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EventVisitor;

        impl<'de> Visitor<'de> for EventVisitor {
            type Value = StreamEvent;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "a [time, type, data] event array")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let time: f64 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let kind: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                let data: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(2, &self))?;

                match kind.as_str() {
                    "o" => Ok(StreamEvent::Output { time, data }),
                    "i" => Ok(StreamEvent::Input { time, data }),
                    "r" => {
                        let (cols, rows) = parse_resize(&data).ok_or_else(|| {
                            de::Error::custom(format!("bad resize payload {data:?}"))
                        })?;
                        Ok(StreamEvent::Resize { time, cols, rows })
                    }
                    other => Err(de::Error::custom(format!("unknown event type {other:?}"))),
                }
            }
        }

        deserializer.deserialize_seq(EventVisitor)
    }
}

fn parse_resize(data: &str) -> Option<(u16, u16)> {
    let (cols, rows) = data.split_once('x')?;
    Some((cols.parse().ok()?, rows.parse().ok()?))
}
