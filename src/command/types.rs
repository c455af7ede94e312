//! # Command / Response Wire Types
//!
//! JSON request/response pair carried over the command topics (§3, §6).
//! `Op` is internally tagged on `"op"` so a wire message looks like
//! `{"id":"r1","op":"SET","key":"k","value":"v"}` — flat, not nested,
//! matching the teacher's text protocol in spirit even though the wire
//! format here is JSON rather than line-oriented text.

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum Op {
    #[serde(rename = "GET")]
    Get { key: String },
    #[serde(rename = "SET")]
    Set { key: String, value: String },
    #[serde(rename = "DEL")]
    Del { key: String },
    #[serde(rename = "INCR")]
    Incr {
        key: String,
        #[serde(default)]
        amount: Option<i64>,
    },
    #[serde(rename = "DECR")]
    Decr {
        key: String,
        #[serde(default)]
        amount: Option<i64>,
    },
    #[serde(rename = "APPEND")]
    Append { key: String, value: String },
    #[serde(rename = "PREPEND")]
    Prepend { key: String, value: String },
    #[serde(rename = "MGET")]
    Mget { keys: Vec<String> },
    #[serde(rename = "MSET")]
    Mset { key_values: Vec<(String, String)> },
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Get { .. } => "GET",
            Op::Set { .. } => "SET",
            Op::Del { .. } => "DEL",
            Op::Incr { .. } => "INCR",
            Op::Decr { .. } => "DECR",
            Op::Append { .. } => "APPEND",
            Op::Prepend { .. } => "PREPEND",
            Op::Mget { .. } => "MGET",
            Op::Mset { .. } => "MSET",
        }
    }

    /// Whether this op mutates storage and therefore needs a `seq` and a
    /// replication event. GET/MGET are read-only.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Op::Get { .. } | Op::Mget { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    #[serde(flatten)]
    pub op: Op,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Ok,
    Error,
}

/// One element of a bulk `results` array (§3, §4.4). Used for both MGET
/// (`status` is `OK`/`NOT_FOUND`, never a hard error) and MSET
/// (per-pair success or failure, independent of the overall top-level
/// status).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultItem {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl ResultItem {
    pub fn ok() -> Self {
        Self { status: Status::Ok, value: None, error_code: None, error: None }
    }
    pub fn ok_value(value: String) -> Self {
        Self { status: Status::Ok, value: Some(value), error_code: None, error: None }
    }
    pub fn not_found() -> Self {
        Self { status: Status::Error, value: None, error_code: Some(ErrorCode::NotFound), error: Some(ErrorCode::NotFound.default_message().to_string()) }
    }
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { status: Status::Error, value: None, error_code: Some(code), error: Some(message.into()) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub results: Option<Vec<ResultItem>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(id: impl Into<String>) -> Self {
        Self { id: id.into(), status: Status::Ok, value: None, results: None, error_code: None, error: None }
    }
    pub fn ok_value(id: impl Into<String>, value: impl Into<String>) -> Self {
        Self { id: id.into(), status: Status::Ok, value: Some(value.into()), results: None, error_code: None, error: None }
    }
    pub fn ok_results(id: impl Into<String>, results: Vec<ResultItem>) -> Self {
        Self { id: id.into(), status: Status::Ok, value: None, results: Some(results), error_code: None, error: None }
    }
    pub fn error(id: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self { id: id.into(), status: Status::Error, value: None, results: None, error_code: Some(code), error: Some(message.into()) }
    }
}
