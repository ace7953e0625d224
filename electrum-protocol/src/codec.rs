//! Request encoding and id assignment.
//!
//! Requests are written as single-line JSON documents with the key order
//! `jsonrpc, method, params, id`. A batch is a bracketed, comma-separated
//! list of such requests sharing one write.

use crate::error::ProtocolError;
use crate::message::{value_kind, Response, RpcError};
use crate::JSONRPC_VERSION;
use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Request envelope. Field order here is the wire key order.
#[derive(Debug, Serialize)]
struct Request<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: &'a [Value],
    id: u64,
}

/// Monotonic request id source owned by a single client.
///
/// The counter starts at 0 and every call to [`IdGenerator::next_id`]
/// returns the incremented value, so the first id is 1. Ids are never
/// reset or reused.
#[derive(Debug, Default)]
pub struct IdGenerator {
    last: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves and returns the next id.
    pub fn next_id(&self) -> u64 {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns the most recently issued id (0 if none).
    pub fn last_id(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }
}

/// Encodes a single request document (no trailing newline).
pub fn make_request(method: &str, params: &[Value], id: u64) -> Result<String, ProtocolError> {
    let request = Request {
        jsonrpc: JSONRPC_VERSION,
        method,
        params,
        id,
    };
    Ok(serde_json::to_string(&request)?)
}

/// Encodes a batch of `method` calls, one per element of `params`.
///
/// Each member's params are `[param]`, or `[param, second]` when a second
/// parameter is given. Ids are drawn from `ids` in input order.
pub fn make_batch(
    method: &str,
    params: &[Value],
    second: Option<&Value>,
    ids: &IdGenerator,
) -> Result<BatchRequest, ProtocolError> {
    let mut payload = String::from("[");
    let mut members = Vec::with_capacity(params.len());

    for (index, param) in params.iter().enumerate() {
        let id = ids.next_id();
        let member_params = match second {
            Some(second) => vec![param.clone(), second.clone()],
            None => vec![param.clone()],
        };
        if index > 0 {
            payload.push(',');
        }
        payload.push_str(&make_request(method, &member_params, id)?);
        members.push((id, param.clone()));
    }
    payload.push(']');

    Ok(BatchRequest { payload, members })
}

/// Appends the newline terminator to an encoded document.
pub fn encode_line(payload: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 1);
    buf.put_slice(payload.as_bytes());
    buf.put_u8(b'\n');
    buf.freeze()
}

/// An encoded batch plus the id → input parameter side table.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    /// Encoded `[req,req,...]` document.
    pub payload: String,
    /// `(id, param)` for every member, in input order.
    pub members: Vec<(u64, Value)>,
}

/// One member of a batch after correlating the response array.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntry {
    pub id: u64,
    /// The input parameter that produced this member.
    pub param: Value,
    /// `None` when the response array carried no element for `id`.
    pub outcome: Option<Result<Value, RpcError>>,
}

impl BatchRequest {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.members.iter().map(|(id, _)| *id)
    }

    /// The id the shared completion handler is filed under.
    pub fn last_id(&self) -> Option<u64> {
        self.members.last().map(|(id, _)| *id)
    }

    /// Maps a raw batch response array back onto the input parameters.
    ///
    /// Entries come back in input order regardless of the order the server
    /// answered in. Elements that are not id-bearing objects are ignored.
    pub fn align(self, raw: Value) -> Result<Vec<BatchEntry>, ProtocolError> {
        let elements = match raw {
            Value::Array(elements) => elements,
            other => return Err(ProtocolError::NotABatch(value_kind(&other))),
        };

        let mut by_id: HashMap<u64, Response> = HashMap::with_capacity(elements.len());
        for element in elements {
            if let Ok(response) = Response::from_value(element) {
                by_id.entry(response.id).or_insert(response);
            }
        }

        Ok(self
            .members
            .into_iter()
            .map(|(id, param)| BatchEntry {
                id,
                param,
                outcome: by_id.remove(&id).map(|r| r.outcome),
            })
            .collect())
    }
}
