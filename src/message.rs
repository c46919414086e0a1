//! Notification messages describing available data products
//!
//! A [`Message`] is the unit the flow engine moves between worklist
//! partitions. The well-known fields are typed; anything else the producer
//! put on the wire is kept verbatim in [`Message::extra`] and written back
//! out unchanged.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::flow::report::Report;

/// Compact publication timestamp layout (`20240131T235959.123`)
pub const TIMESTR_FORMAT: &str = "%Y%m%dT%H%M%S";

/// Field names the engine itself reads or writes
const REQUIRED_FIELDS: [&str; 3] = ["pubTime", "baseUrl", "relPath"];

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("message {rel_path} has not been acknowledged; transient fields must be kept")]
    NotAcknowledged { rel_path: String },

    #[error("invalid publication time '{value}'")]
    InvalidTime { value: String },

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("message encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Engine-assigned identity of an in-flight message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u64);

impl MessageId {
    /// Messages created by stages start out unassigned
    pub const UNASSIGNED: MessageId = MessageId(0);

    pub fn is_assigned(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where an in-flight message came from, which decides how it is acknowledged
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Origin {
    /// Fetched from the flow's message source
    #[default]
    Source,
    /// Produced by the `gather`/`do_poll` entry point of the stage at this load index
    Stage(usize),
    /// Re-injected from the retry queue (already acknowledged)
    Retry,
}

/// Transfer-integrity method advertised by the producer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum IntegrityMethod {
    Sha512,
    Md5,
    Md5Name,
    Arbitrary,
    Random,
    Cod,
    /// The product was removed at the source
    Remove,
    /// The product is a symbolic link
    Link,
    /// No integrity check
    None,
    /// Any method this build does not know about
    Other(String),
}

impl IntegrityMethod {
    pub fn as_str(&self) -> &str {
        match self {
            IntegrityMethod::Sha512 => "sha512",
            IntegrityMethod::Md5 => "md5",
            IntegrityMethod::Md5Name => "md5name",
            IntegrityMethod::Arbitrary => "arbitrary",
            IntegrityMethod::Random => "random",
            IntegrityMethod::Cod => "cod",
            IntegrityMethod::Remove => "remove",
            IntegrityMethod::Link => "link",
            IntegrityMethod::None => "none",
            IntegrityMethod::Other(name) => name,
        }
    }

    /// Content-hash methods (as opposed to remove/link/none)
    pub fn is_content_hash(&self) -> bool {
        matches!(
            self,
            IntegrityMethod::Sha512
                | IntegrityMethod::Md5
                | IntegrityMethod::Md5Name
                | IntegrityMethod::Arbitrary
                | IntegrityMethod::Random
                | IntegrityMethod::Cod
        )
    }
}

impl From<String> for IntegrityMethod {
    fn from(name: String) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "sha512" => IntegrityMethod::Sha512,
            "md5" => IntegrityMethod::Md5,
            "md5name" => IntegrityMethod::Md5Name,
            "arbitrary" => IntegrityMethod::Arbitrary,
            "random" => IntegrityMethod::Random,
            "cod" => IntegrityMethod::Cod,
            "remove" => IntegrityMethod::Remove,
            "link" => IntegrityMethod::Link,
            "none" => IntegrityMethod::None,
            _ => IntegrityMethod::Other(name),
        }
    }
}

impl From<IntegrityMethod> for String {
    fn from(method: IntegrityMethod) -> Self {
        method.as_str().to_string()
    }
}

/// Integrity descriptor: method plus (optional) encoded value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Integrity {
    pub method: IntegrityMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl Integrity {
    pub fn new(method: IntegrityMethod) -> Self {
        Self {
            method,
            value: None,
        }
    }
}

/// Partition descriptor for products sent in blocks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blocks {
    /// `inplace` or `partitioned`
    pub method: String,
    /// Block size in bytes
    pub size: u64,
    /// Total number of blocks
    pub count: u64,
    /// Size of the last block when it is short (0 = all blocks full)
    pub remainder: u64,
    /// Zero-based index of the block this message describes
    pub number: u64,
}

impl Blocks {
    /// Byte offset of this block within the product
    pub fn offset(&self) -> u64 {
        self.number.saturating_mul(self.size)
    }

    /// Length in bytes of this block
    pub fn length(&self) -> u64 {
        let last = self.count.saturating_sub(1);
        if self.number == last && self.remainder > 0 {
            self.remainder
        } else {
            self.size
        }
    }
}

/// One data-product notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(skip)]
    id: MessageId,

    #[serde(skip)]
    origin: Origin,

    #[serde(skip)]
    acknowledged: bool,

    /// Publication time in [`TIMESTR_FORMAT`] (fractional seconds allowed)
    #[serde(rename = "pubTime")]
    pub pub_time: String,

    /// Scheme, host and root of the product location
    #[serde(rename = "baseUrl")]
    pub base_url: String,

    /// Path of the product relative to `base_url`
    #[serde(rename = "relPath", default)]
    pub rel_path: String,

    /// Already-resolved retrieval path, wins over `rel_path` when present
    #[serde(rename = "retPath", default, skip_serializing_if = "Option::is_none")]
    pub ret_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_dir: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_file: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<Integrity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocks: Option<Blocks>,

    #[serde(rename = "isRetry", default, skip_serializing_if = "is_false")]
    pub is_retry: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<Report>,

    #[serde(rename = "_deleteOnPost", default)]
    delete_on_post: BTreeSet<String>,

    /// Unknown fields, passed through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl Message {
    /// Create a message published now
    pub fn new(base_url: impl Into<String>, rel_path: impl Into<String>) -> Self {
        Self {
            id: MessageId::UNASSIGNED,
            origin: Origin::Source,
            acknowledged: false,
            pub_time: format_timestr(Utc::now()),
            base_url: base_url.into(),
            rel_path: rel_path.into(),
            ret_path: None,
            new_dir: None,
            new_file: None,
            integrity: None,
            size: None,
            blocks: None,
            is_retry: false,
            report: None,
            delete_on_post: BTreeSet::new(),
            extra: Map::new(),
        }
    }

    /// Decode a wire message, normalising legacy shapes first.
    ///
    /// A v2-style `parts` header (`"m,size,count,remainder,number"`) becomes
    /// either a flat `size` or a `blocks` descriptor, and a string `size` is
    /// coerced to an integer.
    pub fn from_value(mut value: Value) -> Result<Self, MessageError> {
        let fields = value
            .as_object_mut()
            .ok_or_else(|| MessageError::Malformed("message is not a JSON object".into()))?;

        if let Some(parts) = fields.remove("parts") {
            let parts = parts
                .as_str()
                .ok_or_else(|| MessageError::Malformed("parts header is not a string".into()))?
                .to_string();
            normalise_parts(fields, &parts)?;
        } else if let Some(Value::String(size)) = fields.get("size") {
            let size: u64 = size
                .trim()
                .parse()
                .map_err(|_| MessageError::Malformed(format!("size '{}' is not a number", size)))?;
            fields.insert("size".into(), Value::from(size));
        }

        Ok(serde_json::from_value(value)?)
    }

    /// Encode to the wire shape, including transient fields
    pub fn to_value(&self) -> Result<Value, MessageError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: MessageId) {
        self.id = id;
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub(crate) fn set_origin(&mut self, origin: Origin) {
        self.origin = origin;
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged
    }

    pub(crate) fn mark_acknowledged(&mut self) {
        self.acknowledged = true;
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_blocks(mut self, blocks: Blocks) -> Self {
        self.blocks = Some(blocks);
        self
    }

    pub fn with_integrity(mut self, method: IntegrityMethod) -> Self {
        self.integrity = Some(Integrity::new(method));
        self
    }

    pub fn with_destination(mut self, new_dir: impl Into<String>, new_file: impl Into<String>) -> Self {
        self.new_dir = Some(new_dir.into());
        self.new_file = Some(new_file.into());
        self
    }

    pub fn with_pub_time(mut self, time: DateTime<Utc>) -> Self {
        self.pub_time = format_timestr(time);
        self
    }

    pub fn integrity_method(&self) -> Option<&IntegrityMethod> {
        self.integrity.as_ref().map(|i| &i.method)
    }

    /// Removal notifications carry no data to fetch
    pub fn is_removal(&self) -> bool {
        matches!(self.integrity_method(), Some(IntegrityMethod::Remove))
    }

    pub fn is_link(&self) -> bool {
        matches!(self.integrity_method(), Some(IntegrityMethod::Link))
    }

    /// Parsed publication time
    pub fn published_at(&self) -> Result<DateTime<Utc>, MessageError> {
        parse_timestr(&self.pub_time)
    }

    /// Declared size of what this message asks to transfer
    pub fn declared_size(&self) -> Option<u64> {
        match &self.blocks {
            Some(blocks) => Some(blocks.size),
            None => self.size,
        }
    }

    pub fn retrieval_path(&self) -> &str {
        self.ret_path.as_deref().unwrap_or(&self.rel_path)
    }

    /// `base_url` joined with the retrieval path
    pub fn retrieval_url(&self) -> String {
        join_url(&self.base_url, self.retrieval_path())
    }

    /// URL scheme of `base_url` (`http`, `sftp`, `file`, ...)
    pub fn scheme(&self) -> Option<&str> {
        self.base_url
            .split_once("://")
            .map(|(scheme, _)| scheme)
            .filter(|s| !s.is_empty())
    }

    /// Final local destination (`new_dir/new_file`), when both are set
    pub fn local_path(&self) -> Option<PathBuf> {
        match (&self.new_dir, &self.new_file) {
            (Some(dir), Some(file)) => Some(PathBuf::from(dir).join(file)),
            _ => None,
        }
    }

    /// Stable key identifying this product version across retries.
    /// Each block of a partitioned product gets its own key.
    pub fn retry_key(&self) -> String {
        match &self.blocks {
            Some(blocks) => format!("{}@{}#{}", self.retrieval_url(), self.pub_time, blocks.number),
            None => format!("{}@{}", self.retrieval_url(), self.pub_time),
        }
    }

    /// Human-readable identity for logs
    pub fn describe(&self) -> String {
        format!("{} {}", self.id, self.rel_path)
    }

    pub fn delete_on_post(&self) -> &BTreeSet<String> {
        &self.delete_on_post
    }

    /// Mark `field` as transient: stripped before the message is posted
    pub fn add_delete_on_post(&mut self, field: impl Into<String>) {
        self.delete_on_post.insert(field.into());
    }

    /// Set the retry flag; the flag itself never travels downstream
    pub fn set_retry(&mut self, is_retry: bool) {
        self.is_retry = is_retry;
        self.add_delete_on_post("isRetry");
    }

    /// Pass-through field lookup
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.extra.get(field)
    }

    /// Set a pass-through field
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.extra.insert(field.into(), value.into());
    }

    /// Remove every `deleteOnPost` field and the list itself.
    ///
    /// Only legal after acknowledgment: before it, re-delivery bookkeeping may
    /// still depend on those fields.
    pub fn strip_for_post(&mut self) -> Result<Vec<String>, MessageError> {
        if !self.acknowledged {
            return Err(MessageError::NotAcknowledged {
                rel_path: self.rel_path.clone(),
            });
        }

        let fields = std::mem::take(&mut self.delete_on_post);
        let mut removed = Vec::with_capacity(fields.len());
        for field in fields {
            if self.clear_field(&field) {
                removed.push(field);
            }
        }
        Ok(removed)
    }

    fn clear_field(&mut self, field: &str) -> bool {
        match field {
            f if REQUIRED_FIELDS.contains(&f) => false,
            "isRetry" => std::mem::replace(&mut self.is_retry, false),
            "retPath" => self.ret_path.take().is_some(),
            "new_dir" => self.new_dir.take().is_some(),
            "new_file" => self.new_file.take().is_some(),
            "integrity" => self.integrity.take().is_some(),
            "size" => self.size.take().is_some(),
            "blocks" => self.blocks.take().is_some(),
            "report" => self.report.take().is_some(),
            other => self.extra.remove(other).is_some(),
        }
    }
}

fn normalise_parts(fields: &mut Map<String, Value>, parts: &str) -> Result<(), MessageError> {
    let pieces: Vec<&str> = parts.split(',').map(str::trim).collect();
    let [method, size, count, remainder, number] = pieces[..] else {
        return Err(MessageError::Malformed(format!(
            "parts header '{}' needs 5 fields",
            parts
        )));
    };

    let number_of = |s: &str| -> Result<u64, MessageError> {
        s.parse()
            .map_err(|_| MessageError::Malformed(format!("parts field '{}' is not a number", s)))
    };

    if method == "1" {
        fields.insert("size".into(), Value::from(number_of(size)?));
        return Ok(());
    }

    let method = match method {
        "i" => "inplace",
        "p" => "partitioned",
        other => other,
    };
    let blocks = Blocks {
        method: method.to_string(),
        size: number_of(size)?,
        count: number_of(count)?,
        remainder: number_of(remainder)?,
        number: number_of(number)?,
    };
    fields.insert("blocks".into(), serde_json::to_value(blocks)?);
    Ok(())
}

/// Join a base URL and a path with exactly one separator
pub fn join_url(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) if !path.is_empty() => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

/// Format a timestamp as `YYYYMMDDTHHMMSS.mmm`
pub fn format_timestr(time: DateTime<Utc>) -> String {
    time.format("%Y%m%dT%H%M%S%.3f").to_string()
}

/// Parse a compact (`20240131T235959.5`) or RFC 3339 timestamp
pub fn parse_timestr(value: &str) -> Result<DateTime<Utc>, MessageError> {
    let invalid = || MessageError::InvalidTime {
        value: value.to_string(),
    };

    if value.contains('-') {
        return DateTime::parse_from_rfc3339(value)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| invalid());
    }

    let trimmed = value.trim_end_matches('Z');
    let (whole, fraction) = match trimmed.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (trimmed, ""),
    };

    let naive = NaiveDateTime::parse_from_str(whole, TIMESTR_FORMAT).map_err(|_| invalid())?;

    let nanos = if fraction.is_empty() {
        0
    } else {
        if !fraction.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let digits: String = fraction.chars().take(9).collect();
        let scale = 10u32.pow(9 - digits.len() as u32);
        digits.parse::<u32>().map_err(|_| invalid())? * scale
    };

    Ok(Utc.from_utc_datetime(&naive) + chrono::Duration::nanoseconds(i64::from(nanos)))
}
