//! State-file codec (spec §4.A) — decodes the two replication checkpoint
//! text formats. Pure parsing: never touches the network or a file handle
//! directly (callers pass the bytes in, from disk or from an HTTP body).

use std::io::Read;

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::{Error, Result};

/// Replication cadence. Each variant has a canonical tag string used both
/// in server paths (`datadir/<tag>/AAA/BBB/CCC...`) and in the `states`
/// table's `frequency` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Frequency {
    Changeset,
    Minutely,
    Hourly,
    Daily,
}

impl Frequency {
    pub const fn tag(self) -> &'static str {
        match self {
            Frequency::Changeset => "changeset",
            Frequency::Minutely => "minute",
            Frequency::Hourly => "hour",
            Frequency::Daily => "day",
        }
    }

    /// Lexical inference on a `states.path` fragment. Purely textual, as
    /// the catalog's `put` contract requires (spec §4.B).
    pub fn from_path(path: &str) -> Option<Frequency> {
        if path.contains("changeset") {
            Some(Frequency::Changeset)
        } else if path.contains("minute") {
            Some(Frequency::Minutely)
        } else if path.contains("hour") {
            Some(Frequency::Hourly)
        } else if path.contains("day") {
            Some(Frequency::Daily)
        } else {
            None
        }
    }

    pub fn from_tag(tag: &str) -> Option<Frequency> {
        match tag {
            "changeset" => Some(Frequency::Changeset),
            "minute" => Some(Frequency::Minutely),
            "hour" => Some(Frequency::Hourly),
            "day" => Some(Frequency::Daily),
            _ => None,
        }
    }
}

/// A replication checkpoint. Immutable once constructed — either decoded
/// from a remote `.state.txt` body or reconstructed from a `states` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateFile {
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
    /// Server-relative directory, without the `.state.txt` suffix.
    pub path: String,
    pub frequency: Frequency,
}

impl StateFile {
    pub fn new(timestamp: DateTime<Utc>, sequence: u64, path: impl Into<String>) -> Self {
        let path = path.into();
        let frequency = Frequency::from_path(&path).unwrap_or(Frequency::Minutely);
        Self {
            timestamp,
            sequence,
            path,
            frequency,
        }
    }

    /// Decode a state file body already in memory, associating it with the
    /// path it was fetched from (the codec itself has no notion of paths).
    pub fn parse(body: &str, path: impl Into<String>) -> Result<Self> {
        let (timestamp, sequence) = decode_fields(body)?;
        Ok(Self::new(timestamp, sequence, path))
    }

    /// Decode a state file from disk.
    pub fn parse_file(mut reader: impl Read, path: impl Into<String>) -> Result<Self> {
        let mut body = String::new();
        reader.read_to_string(&mut body)?;
        Self::parse(&body, path)
    }

    /// Re-encode in the diff-state format. Used for the round-trip
    /// invariant in tests; it is a strict superset of what a changeset
    /// state carries, so it always round-trips through this shape.
    pub fn encode(&self) -> String {
        let ts = self.timestamp.format("%Y-%m-%dT%H\\:%M\\:%S%.6fZ");
        format!(
            "#osmreplica\nsequenceNumber={}\ntimestamp={ts}\n",
            self.sequence
        )
    }
}

fn decode_fields(body: &str) -> Result<(DateTime<Utc>, u64)> {
    let mut lines = body.lines();
    let first = lines.next().unwrap_or_default().trim();
    if first == "---" {
        decode_changeset(lines)
    } else {
        decode_diff(std::iter::once(first).chain(lines))
    }
}

/// ```text
/// ---
/// last_run: 2020-10-08 22:30:01.737719000 +00:00
/// sequence: 4139992
/// ```
fn decode_changeset<'a>(mut lines: impl Iterator<Item = &'a str>) -> Result<(DateTime<Utc>, u64)> {
    let last_run = lines
        .next()
        .ok_or_else(|| Error::BadState("missing last_run line".into()))?;
    let (_, value) = last_run
        .split_once(' ')
        .ok_or_else(|| Error::BadState(format!("malformed last_run line: {last_run}")))?;
    let timestamp = DateTime::parse_from_str(value.trim(), "%Y-%m-%d %H:%M:%S%.f %:z")
        .map_err(|e| Error::BadState(format!("bad last_run timestamp {value:?}: {e}")))?
        .with_timezone(&Utc);

    let sequence_line = lines
        .next()
        .ok_or_else(|| Error::BadState("missing sequence line".into()))?;
    let (_, seq) = sequence_line
        .split_once(' ')
        .ok_or_else(|| Error::BadState(format!("malformed sequence line: {sequence_line}")))?;
    let sequence: u64 = seq
        .trim()
        .parse()
        .map_err(|e| Error::BadState(format!("bad sequence {seq:?}: {e}")))?;

    Ok((timestamp, sequence))
}

/// ```text
/// #Fri Oct 09 10:03:04 UTC 2020
/// sequenceNumber=4230996
/// txnMaxQueried=3083073477
/// txnActiveList=
/// txnReadyList=
/// txnMax=3083073477
/// timestamp=2020-10-09T10\:03\:02Z
/// ```
/// All keys other than `sequenceNumber` and `timestamp` are ignored.
fn decode_diff<'a>(lines: impl Iterator<Item = &'a str>) -> Result<(DateTime<Utc>, u64)> {
    let mut sequence = None;
    let mut timestamp = None;

    for line in lines {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key {
            "sequenceNumber" => {
                sequence = Some(value.parse::<u64>().map_err(|e| {
                    Error::BadState(format!("bad sequenceNumber {value:?}: {e}"))
                })?);
            }
            "timestamp" => {
                let unescaped = value.replace("\\:", ":");
                let unescaped = unescaped.strip_suffix('Z').unwrap_or(&unescaped);
                let naive = NaiveDateTime::parse_from_str(unescaped, "%Y-%m-%dT%H:%M:%S%.f")
                    .map_err(|e| Error::BadState(format!("bad timestamp {value:?}: {e}")))?;
                timestamp = Some(naive.and_utc());
            }
            _ => {}
        }
    }

    let sequence = sequence.ok_or_else(|| Error::BadState("missing sequenceNumber".into()))?;
    let timestamp = timestamp.ok_or_else(|| Error::BadState("missing timestamp".into()))?;
    Ok((timestamp, sequence))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHANGESET: &str = "---\nlast_run: 2020-10-08 22:30:01.737719000 +00:00\nsequence: 4139992\n";
    const DIFF: &str = "#Fri Oct 09 10:03:04 UTC 2020\nsequenceNumber=4230996\ntxnMaxQueried=3083073477\ntxnActiveList=\ntxnReadyList=\ntxnMax=3083073477\ntimestamp=2020-10-09T10\\:03\\:02Z\n";

    #[test]
    fn decodes_changeset_state_s1() {
        let state = StateFile::parse(CHANGESET, "000/413/999").unwrap();
        assert_eq!(state.sequence, 4_139_992);
        assert_eq!(
            state.timestamp.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
            "2020-10-08 22:30:01.737719"
        );
        assert_eq!(state.frequency, Frequency::Changeset);
    }

    #[test]
    fn decodes_diff_state_s2() {
        let state = StateFile::parse(DIFF, "000/423/099").unwrap();
        assert_eq!(state.sequence, 4_230_996);
        assert_eq!(
            state.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            "2020-10-09 10:03:02"
        );
    }

    #[test]
    fn frequency_inferred_lexically_from_path() {
        assert_eq!(
            Frequency::from_path("replication/minute/000/423/099"),
            Some(Frequency::Minutely)
        );
        assert_eq!(
            Frequency::from_path("replication/changesets/000/413/999"),
            Some(Frequency::Changeset)
        );
        assert_eq!(Frequency::from_path("nonsense"), None);
    }

    #[test]
    fn round_trips_timestamp_sequence_path_frequency() {
        let original = StateFile::parse(DIFF, "replication/hour/000/423/099").unwrap();
        let encoded = original.encode();
        let decoded = StateFile::parse(&encoded, original.path.clone()).unwrap();
        assert_eq!(original.timestamp, decoded.timestamp);
        assert_eq!(original.sequence, decoded.sequence);
        assert_eq!(original.path, decoded.path);
        assert_eq!(original.frequency, decoded.frequency);
    }

    #[test]
    fn round_trip_preserves_changeset_sub_second_precision() {
        let original = StateFile::parse(CHANGESET, "000/413/999").unwrap();
        let encoded = original.encode();
        let decoded = StateFile::parse(&encoded, original.path.clone()).unwrap();
        assert_eq!(original.timestamp, decoded.timestamp);
    }

    #[test]
    fn rejects_missing_sequence() {
        let bad = "#Fri Oct 09 10:03:04 UTC 2020\ntimestamp=2020-10-09T10\\:03\\:02Z\n";
        assert!(matches!(
            StateFile::parse(bad, "x").unwrap_err(),
            Error::BadState(_)
        ));
    }

    #[test]
    fn rejects_malformed_timestamp() {
        let bad = "#Fri Oct 09 10:03:04 UTC 2020\nsequenceNumber=1\ntimestamp=not-a-date\n";
        assert!(matches!(
            StateFile::parse(bad, "x").unwrap_err(),
            Error::BadState(_)
        ));
    }

    #[test]
    fn parses_from_a_file_on_disk() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(DIFF.as_bytes()).unwrap();
        let state = StateFile::parse_file(file.reopen().unwrap(), "000/423/099").unwrap();
        assert_eq!(state.sequence, 4_230_996);
    }
}
