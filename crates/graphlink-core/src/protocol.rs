//! Typed params and results of the five protocol methods.

use crate::{Endpoint, Event, MulticastMessage, Operation, ProtocolError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Filter value matching any graph type or instance.
pub const WILDCARD: &str = "*";

/// Marker the engine puts into every bind result.
pub const SERVER_MAGIC: &str = "POETS-external-JSON-server";

/// Owner assumed when a bind request names none.
pub const DEFAULT_OWNER: &str = "user";

/// True if `filter` is the wildcard or equals `actual`.
pub fn filter_matches(filter: &str, actual: &str) -> bool {
    filter == WILDCARD || filter == actual
}

fn default_owner() -> String {
    DEFAULT_OWNER.to_string()
}

fn wildcard() -> String {
    WILDCARD.to_string()
}

/// Params of `bind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindParams {
    #[serde(default = "default_owner")]
    pub owner: String,
    #[serde(default)]
    pub owner_cookie: Option<String>,
    #[serde(default = "wildcard")]
    pub graph_type: String,
    #[serde(default = "wildcard")]
    pub graph_instance: String,
    #[serde(default)]
    pub owned_devices: BTreeSet<String>,
}

impl BindParams {
    /// Bind `devices` as the default owner, in any graph.
    pub fn new<I, S>(devices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            owner: default_owner(),
            owner_cookie: None,
            graph_type: wildcard(),
            graph_instance: wildcard(),
            owned_devices: devices.into_iter().map(Into::into).collect(),
        }
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn owner_cookie(mut self, cookie: impl Into<String>) -> Self {
        self.owner_cookie = Some(cookie.into());
        self
    }

    pub fn graph_type(mut self, graph_type: impl Into<String>) -> Self {
        self.graph_type = graph_type.into();
        self
    }

    pub fn graph_instance(mut self, graph_instance: impl Into<String>) -> Self {
        self.graph_instance = graph_instance.into();
        self
    }
}

/// Source endpoint to the destinations wired to receive from it, restricted
/// to the owned devices of one connection. Fixed for the connection lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IncomingEdges(BTreeMap<Endpoint, Vec<Endpoint>>);

impl IncomingEdges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an edge `src → dst`. Repeated edges are kept once.
    pub fn insert(&mut self, src: Endpoint, dst: Endpoint) {
        let dsts = self.0.entry(src).or_default();
        if !dsts.contains(&dst) {
            dsts.push(dst);
        }
    }

    /// Destinations fed by `src`, in wiring order.
    pub fn destinations(&self, src: &str) -> &[Endpoint] {
        self.0.get(src).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains_source(&self, src: &str) -> bool {
        self.0.contains_key(src)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Endpoint, &[Endpoint])> {
        self.0.iter().map(|(src, dsts)| (src, dsts.as_slice()))
    }

    /// Number of distinct sources.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(Endpoint, Endpoint)> for IncomingEdges {
    fn from_iter<T: IntoIterator<Item = (Endpoint, Endpoint)>>(iter: T) -> Self {
        let mut edges = Self::new();
        for (src, dst) in iter {
            edges.insert(src, dst);
        }
        edges
    }
}

/// What the engine bound a connection to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindResult {
    pub graph_type: String,
    pub graph_instance: String,
    pub incoming_edges: IncomingEdges,
}

/// Wire form of [`BindResult`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub magic: Option<String>,
    pub graph_type: String,
    pub graph_instance: String,
    #[serde(default)]
    pub incoming_edges: IncomingEdges,
}

impl From<BindResult> for BindReply {
    fn from(result: BindResult) -> Self {
        Self {
            magic: Some(SERVER_MAGIC.to_string()),
            graph_type: result.graph_type,
            graph_instance: result.graph_instance,
            incoming_edges: result.incoming_edges,
        }
    }
}

impl TryFrom<BindReply> for BindResult {
    type Error = ProtocolError;

    fn try_from(reply: BindReply) -> Result<Self, Self::Error> {
        if let Some(magic) = reply.magic.as_deref()
            && magic != SERVER_MAGIC
        {
            return Err(ProtocolError::new(
                crate::ErrorKind::InvalidResponse,
                format!("unexpected server magic '{magic}'"),
            ));
        }
        Ok(Self {
            graph_type: reply.graph_type,
            graph_instance: reply.graph_instance,
            incoming_edges: reply.incoming_edges,
        })
    }
}

/// Params of `poll`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollParams {
    #[serde(
        default,
        alias = "max_messages",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_events: Option<u64>,
}

/// Result of `poll`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PollReply {
    #[serde(default)]
    pub events: Vec<Event>,
}

/// Params of `send`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SendParams {
    #[serde(default)]
    pub messages: Vec<MulticastMessage>,
}

/// Params of `halt`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaltParams {
    pub code: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A decoded request, as dispatched by the engine side.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Bind(BindParams),
    Run,
    Poll(PollParams),
    Send(SendParams),
    Halt(HaltParams),
}

impl Call {
    /// Decode the params of `op`. A missing params object decodes as `{}`.
    pub fn decode(op: Operation, params: Value) -> Result<Self, ProtocolError> {
        let params = match params {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        let invalid = |e: serde_json::Error| ProtocolError::invalid_params(format!("{op}: {e}"));
        Ok(match op {
            Operation::Bind => Call::Bind(serde_json::from_value(params).map_err(invalid)?),
            Operation::Run => Call::Run,
            Operation::Poll => Call::Poll(serde_json::from_value(params).map_err(invalid)?),
            Operation::Send => Call::Send(serde_json::from_value(params).map_err(invalid)?),
            Operation::Halt => Call::Halt(serde_json::from_value(params).map_err(invalid)?),
        })
    }

    pub fn operation(&self) -> Operation {
        match self {
            Call::Bind(_) => Operation::Bind,
            Call::Run => Operation::Run,
            Call::Poll(_) => Operation::Poll,
            Call::Send(_) => Operation::Send,
            Call::Halt(_) => Operation::Halt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use serde_json::json;

    fn ep(s: &str) -> Endpoint {
        s.parse().unwrap()
    }

    #[test]
    fn bind_defaults() {
        let call = Call::decode(Operation::Bind, json!({"owned_devices": ["ext0"]})).unwrap();
        let Call::Bind(params) = call else {
            panic!("expected bind");
        };
        assert_eq!(params, BindParams::new(["ext0"]));
        assert_eq!(params.owner, "user");
        assert_eq!(params.graph_type, "*");
        assert_eq!(params.owner_cookie, None);
    }

    #[test]
    fn bind_builder_serializes_all_fields() {
        let params = BindParams::new(["ext1", "ext0"])
            .owner("alice")
            .owner_cookie("c00k1e")
            .graph_type("echo")
            .graph_instance("echo_2");
        assert_eq!(
            serde_json::to_value(&params).unwrap(),
            json!({
                "owner": "alice",
                "owner_cookie": "c00k1e",
                "graph_type": "echo",
                "graph_instance": "echo_2",
                "owned_devices": ["ext0", "ext1"],
            })
        );
    }

    #[test]
    fn incoming_edges_wire_form() {
        let edges: IncomingEdges = [
            (ep("int0:out"), ep("ext0:in")),
            (ep("int0:out"), ep("ext0:in")),
            (ep("int0:out"), ep("ext1:in")),
        ]
        .into_iter()
        .collect();
        assert_eq!(edges.destinations("int0:out"), [ep("ext0:in"), ep("ext1:in")]);
        assert!(edges.destinations("int9:out").is_empty());
        let routes: Vec<_> = edges.iter().collect();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].0, &ep("int0:out"));
        assert_eq!(routes[0].1, [ep("ext0:in"), ep("ext1:in")]);
        assert_eq!(
            serde_json::to_value(&edges).unwrap(),
            json!({"int0:out": ["ext0:in", "ext1:in"]})
        );
        let back: IncomingEdges =
            serde_json::from_value(json!({"int0:out": ["ext0:in", "ext1:in"]})).unwrap();
        assert_eq!(back, edges);
    }

    #[test]
    fn bind_reply_checks_magic() {
        let good = BindReply {
            magic: Some(SERVER_MAGIC.into()),
            graph_type: "gt0".into(),
            graph_instance: "gi0".into(),
            incoming_edges: IncomingEdges::new(),
        };
        assert!(BindResult::try_from(good.clone()).is_ok());
        let absent = BindReply { magic: None, ..good.clone() };
        assert!(BindResult::try_from(absent).is_ok());
        let bad = BindReply {
            magic: Some("something-else".into()),
            ..good
        };
        assert_eq!(
            BindResult::try_from(bad).unwrap_err().kind(),
            ErrorKind::InvalidResponse
        );
    }

    #[test]
    fn poll_accepts_legacy_alias() {
        let call = Call::decode(Operation::Poll, json!({"max_messages": 1})).unwrap();
        assert_eq!(call, Call::Poll(PollParams { max_events: Some(1) }));
        let call = Call::decode(Operation::Poll, Value::Null).unwrap();
        assert_eq!(call, Call::Poll(PollParams::default()));
    }

    #[test]
    fn bad_params_are_invalid_params() {
        let err = Call::decode(Operation::Halt, json!({"message": "no code"})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParams);
        let err = Call::decode(Operation::Send, json!({"messages": [{"src": "nosep"}]}))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParams);
    }

    #[test]
    fn wildcard_filter() {
        assert!(filter_matches("*", "echo"));
        assert!(filter_matches("echo", "echo"));
        assert!(!filter_matches("heat", "echo"));
    }
}
