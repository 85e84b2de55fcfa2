//! Redis Streams job queue.
//!
//! Commands are built with `redis::cmd` and replies parsed from
//! `redis::Value` by hand, so reply-shape quirks across server versions stay
//! visible in one place. Processed entries are acknowledged and then deleted;
//! the two commands are not atomic, and the result store's idempotent
//! transitions absorb the replay window between them.

use judge_protocol::JobRequest;
use redis::Value;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue payload field '{field}' {problem}")]
    InvalidPayload {
        field: &'static str,
        problem: &'static str,
    },
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// One delivered stream entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

/// Consumer-group counters used for backlog checks and gauges.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GroupCounters {
    pub pending: i64,
    pub lag: i64,
}

#[derive(Clone)]
pub struct JobQueue {
    conn: ConnectionManager,
}

impl JobQueue {
    pub async fn connect(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    /// Create the consumer group if it does not exist. `BUSYGROUP` replies
    /// are the idempotent-success case.
    pub async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let result: Result<Value, redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(err) if err.to_string().contains("BUSYGROUP") => {
                debug!("consumer group {group} already exists on {stream}");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Validate and append a job entry. Invalid payloads fail before any
    /// command is sent.
    pub async fn enqueue(&self, stream: &str, request: &JobRequest) -> Result<String, QueueError> {
        let fields = fields_for(request)?;
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("*");
        for (key, value) in &fields {
            cmd.arg(*key).arg(value);
        }
        let mut conn = self.conn.clone();
        let id: String = cmd.query_async(&mut conn).await?;
        Ok(id)
    }

    /// Blocking consumer-group read of at most one entry. `None` on block
    /// timeout.
    pub async fn read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block_ms: u64,
    ) -> Result<Option<StreamEntry>, QueueError> {
        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(stream)
            .arg(">")
            .query_async(&mut conn)
            .await?;
        Ok(parse_read_reply(&reply).into_iter().next())
    }

    /// XACK then XDEL. Returns `(acked, deleted)` so callers can log drift
    /// from the non-atomic pair.
    pub async fn ack_and_delete(
        &self,
        stream: &str,
        group: &str,
        msg_id: &str,
    ) -> Result<(i64, i64), QueueError> {
        let mut conn = self.conn.clone();
        let acked: i64 = redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(msg_id)
            .query_async(&mut conn)
            .await?;
        let deleted: i64 = redis::cmd("XDEL")
            .arg(stream)
            .arg(msg_id)
            .query_async(&mut conn)
            .await?;
        Ok((acked, deleted))
    }

    /// Entries this group still owes work for: pending + outstanding lag.
    /// A missing stream or group reads as zero.
    pub async fn backlog(&self, stream: &str, group: &str) -> Result<i64, QueueError> {
        match self.group_counters(stream, group).await? {
            Some(counters) => Ok(counters.pending + counters.lag.max(0)),
            None => Ok(0),
        }
    }

    /// Per-group counters from `XINFO GROUPS`, `None` when the stream or
    /// group does not exist yet.
    pub async fn group_counters(
        &self,
        stream: &str,
        group: &str,
    ) -> Result<Option<GroupCounters>, QueueError> {
        let mut conn = self.conn.clone();
        let reply: Result<Value, redis::RedisError> = redis::cmd("XINFO")
            .arg("GROUPS")
            .arg(stream)
            .query_async(&mut conn)
            .await;
        match reply {
            Ok(value) => Ok(parse_groups_reply(&value, group)),
            Err(err) if is_response_error(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn stream_len(&self, stream: &str) -> Result<i64, QueueError> {
        let mut conn = self.conn.clone();
        let reply: Result<i64, redis::RedisError> =
            redis::cmd("XLEN").arg(stream).query_async(&mut conn).await;
        match reply {
            Ok(len) => Ok(len),
            Err(err) if is_response_error(&err) => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    /// Claim pending entries idle for at least `min_idle_ms`, scanning from
    /// the start of the PEL. Reply-shape and missing-group errors return an
    /// empty batch.
    pub async fn autoclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<StreamEntry>, QueueError> {
        let mut conn = self.conn.clone();
        let reply: Result<Value, redis::RedisError> = redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle_ms)
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await;
        match reply {
            Ok(value) => Ok(parse_autoclaim_reply(&value)),
            Err(err) if is_response_error(&err) => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }
}

fn is_response_error(err: &redis::RedisError) -> bool {
    err.kind() == redis::ErrorKind::ResponseError
}

/// Field validation mirrored by the worker on read: identity fields must be
/// non-empty after trimming, `created_at` must be non-negative.
fn fields_for(request: &JobRequest) -> Result<Vec<(&'static str, String)>, QueueError> {
    let job_id = require_non_empty("job_id", &request.job_id)?;
    let problem_id = require_non_empty("problem_id", &request.problem_id)?;
    let problem_key = require_non_empty("problem_key", &request.problem_key)?;
    let created_at = match request.created_at {
        None => String::new(),
        Some(seconds) if seconds >= 0 => seconds.to_string(),
        Some(_) => {
            return Err(QueueError::InvalidPayload {
                field: "created_at",
                problem: "must be a non-negative unix timestamp",
            });
        }
    };
    Ok(vec![
        ("job_id", job_id),
        ("problem_id", problem_id),
        ("problem_key", problem_key),
        ("profile", request.profile.as_str().to_string()),
        ("kind", request.kind.as_str().to_string()),
        ("code", request.code.clone()),
        ("created_at", created_at),
    ])
}

fn require_non_empty(field: &'static str, value: &str) -> Result<String, QueueError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(QueueError::InvalidPayload {
            field,
            problem: "must be a non-empty string",
        });
    }
    Ok(trimmed.to_string())
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::SimpleString(text) => Some(text.clone()),
        Value::Int(number) => Some(number.to_string()),
        _ => None,
    }
}

fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Int(number) => Some(*number),
        Value::BulkString(bytes) => String::from_utf8_lossy(bytes).parse().ok(),
        _ => None,
    }
}

/// `[[stream, [[id, [k, v, ...]], ...]]]`
fn parse_read_reply(reply: &Value) -> Vec<StreamEntry> {
    let Value::Array(streams) = reply else {
        return Vec::new();
    };
    let Some(Value::Array(stream_data)) = streams.first() else {
        return Vec::new();
    };
    match stream_data.get(1) {
        Some(entries) => parse_entries(entries),
        None => Vec::new(),
    }
}

/// `[next_cursor, [[id, [k, v, ...]], ...], (deleted_ids)]`
fn parse_autoclaim_reply(reply: &Value) -> Vec<StreamEntry> {
    let Value::Array(parts) = reply else {
        return Vec::new();
    };
    match parts.get(1) {
        Some(entries) => parse_entries(entries),
        None => Vec::new(),
    }
}

fn parse_entries(value: &Value) -> Vec<StreamEntry> {
    let Value::Array(items) = value else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let Value::Array(pair) = item else {
                return None;
            };
            let id = as_string(pair.first()?)?;
            let mut fields = HashMap::new();
            if let Some(Value::Array(flat)) = pair.get(1) {
                for chunk in flat.chunks_exact(2) {
                    if let (Some(key), Some(field_value)) =
                        (as_string(&chunk[0]), as_string(&chunk[1]))
                    {
                        fields.insert(key, field_value);
                    }
                }
            }
            Some(StreamEntry { id, fields })
        })
        .collect()
}

/// `XINFO GROUPS` reply: one flat key/value array (or map) per group.
fn parse_groups_reply(reply: &Value, group: &str) -> Option<GroupCounters> {
    let Value::Array(groups) = reply else {
        return None;
    };
    for info in groups {
        let pairs: Vec<(String, &Value)> = match info {
            Value::Array(flat) => flat
                .chunks_exact(2)
                .filter_map(|chunk| Some((as_string(&chunk[0])?, &chunk[1])))
                .collect(),
            Value::Map(entries) => entries
                .iter()
                .filter_map(|(key, value)| Some((as_string(key)?, value)))
                .collect(),
            _ => continue,
        };
        let name = pairs
            .iter()
            .find(|(key, _)| key == "name")
            .and_then(|(_, value)| as_string(value));
        if name.as_deref() != Some(group) {
            continue;
        }
        let pending = pairs
            .iter()
            .find(|(key, _)| key == "pending")
            .and_then(|(_, value)| as_int(value))
            .unwrap_or(0);
        let lag = pairs
            .iter()
            .find(|(key, _)| key == "lag")
            .and_then(|(_, value)| as_int(value))
            .unwrap_or(0);
        return Some(GroupCounters { pending, lag });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use judge_protocol::JobKind;
    use judge_protocol::Profile;
    use pretty_assertions::assert_eq;

    fn request() -> JobRequest {
        JobRequest {
            job_id: "7c9e6679-7425-40de-944b-e07fc1f90ae7".to_string(),
            problem_id: "course/ch1/add".to_string(),
            problem_key: "course/ch1/add".to_string(),
            profile: Profile::Light,
            kind: JobKind::Run,
            code: "def add(a, b):\n    return a + b\n".to_string(),
            created_at: Some(1_700_000_000),
        }
    }

    fn bulk(text: &str) -> Value {
        Value::BulkString(text.as_bytes().to_vec())
    }

    #[test]
    fn fields_are_trimmed_and_ordered() {
        let mut req = request();
        req.problem_key = "  course/ch1/add  ".to_string();
        let fields = fields_for(&req).unwrap();
        let keys: Vec<&str> = fields.iter().map(|(key, _)| *key).collect();
        assert_eq!(
            keys,
            ["job_id", "problem_id", "problem_key", "profile", "kind", "code", "created_at"]
        );
        assert_eq!(fields[2].1, "course/ch1/add");
        assert_eq!(fields[6].1, "1700000000");
    }

    #[test]
    fn empty_identity_fields_are_rejected() {
        let mut req = request();
        req.job_id = "   ".to_string();
        assert!(matches!(
            fields_for(&req),
            Err(QueueError::InvalidPayload { field: "job_id", .. })
        ));
    }

    #[test]
    fn missing_created_at_encodes_as_empty_string() {
        let mut req = request();
        req.created_at = None;
        let fields = fields_for(&req).unwrap();
        assert_eq!(fields[6].1, "");
        req.created_at = Some(-5);
        assert!(fields_for(&req).is_err());
    }

    #[test]
    fn read_reply_parses_one_entry() {
        let reply = Value::Array(vec![Value::Array(vec![
            bulk("queue:light"),
            Value::Array(vec![Value::Array(vec![
                bulk("1700000000-0"),
                Value::Array(vec![bulk("job_id"), bulk("j1"), bulk("kind"), bulk("run")]),
            ])]),
        ])]);
        let entries = parse_read_reply(&reply);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "1700000000-0");
        assert_eq!(entries[0].fields.get("kind").map(String::as_str), Some("run"));
    }

    #[test]
    fn nil_read_reply_is_empty() {
        assert_eq!(parse_read_reply(&Value::Nil), Vec::new());
    }

    #[test]
    fn autoclaim_reply_parses_claimed_entries() {
        let reply = Value::Array(vec![
            bulk("0-0"),
            Value::Array(vec![Value::Array(vec![
                bulk("1700000001-0"),
                Value::Array(vec![bulk("job_id"), bulk("j2")]),
            ])]),
            Value::Array(vec![]),
        ]);
        let entries = parse_autoclaim_reply(&reply);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].fields.get("job_id").map(String::as_str), Some("j2"));
    }

    #[test]
    fn group_counters_sum_pending_and_lag() {
        let reply = Value::Array(vec![Value::Array(vec![
            bulk("name"),
            bulk("workers-light"),
            bulk("pending"),
            Value::Int(3),
            bulk("lag"),
            Value::Int(4),
        ])]);
        assert_eq!(
            parse_groups_reply(&reply, "workers-light"),
            Some(GroupCounters { pending: 3, lag: 4 })
        );
        assert_eq!(parse_groups_reply(&reply, "workers-torch"), None);
    }
}
