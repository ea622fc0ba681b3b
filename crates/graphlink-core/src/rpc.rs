//! JSON-RPC 2.0 framing on top of a [`Channel`].
//!
//! [`RpcClient`] issues one call at a time and validates each response.
//! [`RpcServer`] pulls requests one at a time; the caller completes each with
//! [`RpcServer::reply`] or [`RpcServer::reply_error`] before pulling the next.

use crate::event::present;
use crate::transport::Channel;
use crate::{ErrorKind, ProtocolError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

pub const JSONRPC_VERSION: &str = "2.0";

/// A request frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl Request {
    pub fn new(id: impl Into<Value>, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// The `error` member of a response frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl From<&ProtocolError> for RpcError {
    fn from(err: &ProtocolError) -> Self {
        Self {
            code: err.code(),
            message: err.message().to_string(),
        }
    }
}

/// A response frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: &ProtocolError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Check a raw frame against the id of the call it answers.
    pub fn validate(frame: Value, expected_id: &str) -> Result<Value, ProtocolError> {
        let invalid = |what: String| ProtocolError::new(ErrorKind::InvalidResponse, what);
        let Value::Object(_) = &frame else {
            return Err(invalid(format!("response was not an object: {frame}")));
        };
        let response: Response = serde_json::from_value(frame)
            .map_err(|e| invalid(format!("response has the wrong shape: {e}")))?;
        if response.jsonrpc != JSONRPC_VERSION {
            return Err(invalid(format!(
                "response has jsonrpc '{}', expected '{JSONRPC_VERSION}'",
                response.jsonrpc
            )));
        }
        if response.id.as_str() != Some(expected_id) {
            return Err(invalid(format!(
                "response id {} did not match request id {expected_id}",
                response.id
            )));
        }
        match (response.result, response.error) {
            (_, Some(error)) => Err(ProtocolError::from_wire(error.code, error.message)),
            (Some(result), None) => Ok(result),
            (None, None) => Err(invalid("response has neither result nor error".into())),
        }
    }
}

/// Caller half: sends requests and waits for the matching response.
pub struct RpcClient<C> {
    channel: C,
    next_id: u64,
    closed: bool,
}

impl<C: Channel> RpcClient<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            next_id: 0,
            closed: false,
        }
    }

    /// Issue `method` and wait for its result.
    pub async fn call(&mut self, method: &str, params: Value) -> Result<Value, ProtocolError> {
        if self.closed {
            return Err(ProtocolError::transport("channel is closed"));
        }
        self.next_id += 1;
        let id = format!("id{}", self.next_id);
        let request = Request::new(id.as_str(), method, params);
        tracing::debug!(%id, method, "rpc call");

        let frame = serde_json::to_value(&request).map_err(ProtocolError::transport)?;
        self.channel.send(frame).await?;
        let frame = self
            .channel
            .recv()
            .await?
            .ok_or_else(ProtocolError::end_of_stream)?;
        Response::validate(frame, &id)
    }

    /// Release the channel. Idempotent.
    pub async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.channel.close().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// A request pulled by [`RpcServer::next_call`].
#[derive(Debug, Clone, PartialEq)]
pub struct Incoming {
    pub id: Value,
    pub method: String,
    pub params: Value,
}

/// Callee half: pulls requests and completes them.
pub struct RpcServer<C> {
    channel: C,
    in_progress: HashSet<String>,
}

impl<C: Channel> RpcServer<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            in_progress: HashSet::new(),
        }
    }

    /// Wait for the next well-formed call.
    ///
    /// Malformed frames are answered with `InvalidRequest` and skipped;
    /// notifications are dropped. End of stream is an `EndOfStream` error.
    pub async fn next_call(&mut self) -> Result<Incoming, ProtocolError> {
        loop {
            let frame = self
                .channel
                .recv()
                .await?
                .ok_or_else(ProtocolError::end_of_stream)?;
            match self.check_request(frame) {
                Ok(Some(incoming)) => {
                    self.in_progress.insert(incoming.id.to_string());
                    return Ok(incoming);
                }
                Ok(None) => continue,
                Err((id, err)) => {
                    tracing::warn!(error = %err, "rejecting malformed request");
                    self.send(Response::failure(id, &err)).await?;
                }
            }
        }
    }

    fn check_request(&self, frame: Value) -> Result<Option<Incoming>, (Value, ProtocolError)> {
        let invalid = |id: &Value, what: &str| {
            (
                id.clone(),
                ProtocolError::new(ErrorKind::InvalidRequest, what),
            )
        };
        let Value::Object(mut obj) = frame else {
            return Err(invalid(
                &Value::Null,
                "request is not an object (batches are not supported)",
            ));
        };
        let id = obj.remove("id").unwrap_or(Value::Null);
        if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Err(invalid(&id, "request is missing jsonrpc header or has the wrong value"));
        }
        let method = match obj.remove("method") {
            Some(Value::String(method)) => method,
            Some(_) => return Err(invalid(&id, "request method is not a string")),
            None => return Err(invalid(&id, "request is missing a method field")),
        };
        if id.is_null() {
            tracing::warn!(%method, "dropping notification");
            return Ok(None);
        }
        if self.in_progress.contains(&id.to_string()) {
            return Err(invalid(&id, "id is a duplicate of an in-progress call"));
        }
        let params = obj
            .remove("params")
            .unwrap_or_else(|| Value::Object(Map::new()));
        Ok(Some(Incoming { id, method, params }))
    }

    /// Complete `id` with a result.
    pub async fn reply(&mut self, id: &Value, result: Value) -> Result<(), ProtocolError> {
        self.in_progress.remove(&id.to_string());
        self.send(Response::success(id.clone(), result)).await
    }

    /// Complete `id` with an error.
    pub async fn reply_error(&mut self, id: &Value, err: &ProtocolError) -> Result<(), ProtocolError> {
        self.in_progress.remove(&id.to_string());
        self.send(Response::failure(id.clone(), err)).await
    }

    async fn send(&mut self, response: Response) -> Result<(), ProtocolError> {
        let frame = serde_json::to_value(&response).map_err(ProtocolError::transport)?;
        self.channel.send(frame).await?;
        Ok(())
    }

    /// Watch the peer while a call is still being worked on.
    ///
    /// Resolves only if the peer acts before the reply is sent. A new frame
    /// breaks the one-call-at-a-time rule and comes back as `Ok` with an
    /// `InvalidRequest` error to report. A hangup or channel failure is `Err`.
    pub async fn interrupted(&mut self) -> Result<ProtocolError, ProtocolError> {
        match self.channel.recv().await? {
            Some(_) => Ok(ProtocolError::new(
                ErrorKind::InvalidRequest,
                "request arrived while another call was in progress",
            )),
            None => Err(ProtocolError::end_of_stream()),
        }
    }

    /// Release the channel.
    pub async fn close(&mut self) {
        self.channel.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory_pair;
    use serde_json::json;

    #[test]
    fn validate_accepts_null_result() {
        let frame = json!({"jsonrpc": "2.0", "id": "id1", "result": null});
        assert_eq!(Response::validate(frame, "id1").unwrap(), Value::Null);
    }

    #[test]
    fn validate_rejects_bad_frames() {
        let cases = [
            json!([1, 2]),
            json!({"jsonrpc": "1.0", "id": "id1", "result": {}}),
            json!({"jsonrpc": "2.0", "id": "id2", "result": {}}),
            json!({"jsonrpc": "2.0", "id": "id1"}),
        ];
        for frame in cases {
            let err = Response::validate(frame, "id1").unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidResponse);
        }
    }

    #[test]
    fn validate_maps_error_codes() {
        let frame = json!({"jsonrpc": "2.0", "id": "id1",
            "error": {"code": -3, "message": "ext9: no such device"}});
        let err = Response::validate(frame, "id1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidDevice);
        assert_eq!(err.message(), "ext9: no such device");
    }

    #[tokio::test]
    async fn client_and_server_exchange_calls() {
        let (client_side, server_side) = memory_pair();
        let mut client = RpcClient::new(client_side);
        let mut server = RpcServer::new(server_side);

        let serve = tokio::spawn(async move {
            let call = server.next_call().await.unwrap();
            assert_eq!(call.method, "f1");
            assert_eq!(call.params, json!({"p1": 10}));
            server.reply(&call.id, json!({"x": 10})).await.unwrap();

            let call = server.next_call().await.unwrap();
            assert_eq!(call.params, json!({}));
            server
                .reply_error(&call.id, &ProtocolError::new(ErrorKind::Engine, "wibble"))
                .await
                .unwrap();
            server.next_call().await.unwrap_err().kind()
        });

        assert_eq!(client.call("f1", json!({"p1": 10})).await.unwrap(), json!({"x": 10}));
        let err = client.call("f2", Value::Null).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Engine);
        assert_eq!(err.message(), "wibble");

        client.close().await;
        client.close().await;
        assert_eq!(serve.await.unwrap(), ErrorKind::EndOfStream);
        assert_eq!(
            client.call("f3", Value::Null).await.unwrap_err().kind(),
            ErrorKind::Transport
        );
    }

    #[tokio::test]
    async fn server_skips_malformed_requests() {
        let (mut peer, server_side) = memory_pair();
        let mut server = RpcServer::new(server_side);

        peer.send(json!("not an object")).await.unwrap();
        peer.send(json!({"jsonrpc": "2.0", "id": "a", "method": 7})).await.unwrap();
        peer.send(json!({"jsonrpc": "2.0", "method": "poll"})).await.unwrap();
        peer.send(json!({"jsonrpc": "2.0", "id": "b", "method": "run"})).await.unwrap();

        let call = server.next_call().await.unwrap();
        assert_eq!(call.id, json!("b"));
        assert_eq!(call.method, "run");

        let first = peer.recv().await.unwrap().unwrap();
        assert_eq!(first["error"]["code"], json!(-32600));
        assert_eq!(first["id"], Value::Null);
        let second = peer.recv().await.unwrap().unwrap();
        assert_eq!(second["id"], json!("a"));
        assert_eq!(second["error"]["code"], json!(-32600));
    }

    #[tokio::test]
    async fn interrupted_reports_stray_frames_and_hangups() {
        let (mut peer, server_side) = memory_pair();
        let mut server = RpcServer::new(server_side);

        peer.send(json!({"jsonrpc": "2.0", "id": "x", "method": "poll"})).await.unwrap();
        let stray = server.interrupted().await.unwrap();
        assert_eq!(stray.kind(), ErrorKind::InvalidRequest);

        drop(peer);
        let gone = server.interrupted().await.unwrap_err();
        assert_eq!(gone.kind(), ErrorKind::EndOfStream);
    }
}
