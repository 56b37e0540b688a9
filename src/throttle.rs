//! Byterate pacing for blob streaming.

use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::oci::BlobStream;

/// A transfer rate in bytes per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Byterate(u64);

impl Byterate {
    pub fn new(bytes_per_second: u64) -> Self {
        Self(bytes_per_second)
    }

    pub fn bytes_per_second(&self) -> u64 {
        self.0
    }
}

impl std::str::FromStr for Byterate {
    type Err = Error;

    /// Parse rates like `1048576`, `512KB` or `100MB`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        let (number, unit) = s.split_at(split);
        let number: u64 = number
            .parse()
            .map_err(|_| Error::other(format!("invalid byterate: {s}")))?;
        let multiplier = match unit.trim() {
            "" | "B" => 1,
            "KB" => 1_000,
            "MB" => 1_000_000,
            "GB" => 1_000_000_000,
            _ => return Err(Error::other(format!("invalid byterate unit: {s}"))),
        };
        Ok(Self(number * multiplier))
    }
}

impl std::fmt::Display for Byterate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (unit, multiplier) in [("GB", 1_000_000_000), ("MB", 1_000_000), ("KB", 1_000)] {
            if self.0 >= multiplier && self.0 % multiplier == 0 {
                return write!(f, "{}{unit}", self.0 / multiplier);
            }
        }
        write!(f, "{}B", self.0)
    }
}

impl TryFrom<String> for Byterate {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Byterate> for String {
    fn from(rate: Byterate) -> Self {
        rate.to_string()
    }
}

/// Token-bucket pacer for blob writes.
///
/// Cumulative output may not run ahead of `rate * elapsed`; a chunk that
/// would overdraw the bucket sleeps on the tokio clock first. Chunks are
/// never split, so a single oversized chunk can overshoot by one chunk
/// length at most.
#[derive(Debug, Clone, Copy)]
pub struct Throttler {
    rate: Byterate,
}

impl Throttler {
    pub fn new(rate: Byterate) -> Self {
        Self { rate }
    }

    /// Wrap a blob stream so its chunks drain at the configured rate.
    pub fn throttle(&self, stream: BlobStream) -> BlobStream {
        let rate = self.rate.bytes_per_second().max(1);
        let start = Instant::now();
        Box::pin(futures::stream::unfold(
            (stream, 0u64),
            move |(mut stream, mut sent)| async move {
                let item = stream.next().await?;
                if let Ok(chunk) = &item {
                    sent += chunk.len() as u64;
                    let due = start + Duration::from_secs_f64(sent as f64 / rate as f64);
                    if due > Instant::now() {
                        tokio::time::sleep_until(due).await;
                    }
                }
                Some((item, (stream, sent)))
            },
        ))
    }
}
