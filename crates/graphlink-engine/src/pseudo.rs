//! In-memory reference engine.
//!
//! Internal devices run their [`DeviceBehaviour`] synchronously inside `send`;
//! traffic reaching an external device is queued for the connection that owns
//! it until that connection polls.

use crate::EngineHandler;
use crate::topology::{Direction, Topology, TopologyError};
use graphlink_core::protocol::filter_matches;
use graphlink_core::{
    BindParams, BindResult, ErrorKind, Event, Halt, MulticastMessage, ProtocolError,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, watch};

/// Upper bound on messages routed by one `send`; stops behaviours that feed
/// each other forever.
const MAX_ROUTED_PER_SEND: usize = 1 << 16;

/// Engine policy.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Owners allowed to bind. Empty admits anyone.
    pub allowed_owners: BTreeSet<String>,
    /// Hold `run` until every external device is bound.
    pub wait_for_all_externals: bool,
}

type ConnectionId = u64;

#[derive(Default)]
struct Outbox {
    events: VecDeque<MulticastMessage>,
}

struct EngineState {
    topology: Topology,
    owners: BTreeMap<String, ConnectionId>,
    outboxes: HashMap<ConnectionId, Outbox>,
    halt: Option<Halt>,
}

struct Shared {
    state: Mutex<EngineState>,
    options: EngineOptions,
    externals: usize,
    bound: watch::Sender<usize>,
    next_id: AtomicU64,
}

/// Cheaply cloneable handle on one running graph.
#[derive(Clone)]
pub struct PseudoEngine {
    shared: Arc<Shared>,
}

impl PseudoEngine {
    pub fn new(topology: Topology, options: EngineOptions) -> Self {
        let externals = topology.externals().count();
        let (bound, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(EngineState {
                    topology,
                    owners: BTreeMap::new(),
                    outboxes: HashMap::new(),
                    halt: None,
                }),
                options,
                externals,
                bound,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Echo graph with `pairs` device pairs and default options.
    pub fn echo(pairs: usize) -> Result<Self, TopologyError> {
        Ok(Self::new(Topology::echo(pairs)?, EngineOptions::default()))
    }

    /// A handler for one new connection.
    pub fn session(&self) -> Session {
        Session {
            engine: self.clone(),
            id: self.shared.next_id.fetch_add(1, Ordering::Relaxed),
            owned: BTreeSet::new(),
        }
    }

    /// The halt recorded by the engine, if any.
    pub async fn halted(&self) -> Option<Halt> {
        self.shared.state.lock().await.halt.clone()
    }

    /// Number of external devices currently bound.
    pub fn bound_devices(&self) -> usize {
        *self.shared.bound.borrow()
    }
}

impl EngineState {
    /// Deliver `initial` and everything internal devices emit in response,
    /// breadth first.
    fn route(&mut self, initial: Vec<MulticastMessage>) {
        let mut pending: VecDeque<MulticastMessage> = initial.into();
        let mut routed = 0;
        while let Some(msg) = pending.pop_front() {
            routed += 1;
            if routed > MAX_ROUTED_PER_SEND {
                tracing::warn!(
                    dropped = pending.len() + 1,
                    "routing limit reached, dropping remaining messages"
                );
                return;
            }
            let dsts = self.topology.destinations(&msg.src).to_vec();
            let mut delivered = BTreeSet::new();
            for dst in &dsts {
                let Some(device) = self.topology.device_mut(dst.device()) else {
                    continue;
                };
                if let Some(behaviour) = device.behaviour_mut() {
                    pending.extend(behaviour.receive(dst, msg.data.as_ref()));
                    continue;
                }
                match self.owners.get(dst.device()) {
                    // One copy per connection, however many of its inputs are wired.
                    Some(&owner) if delivered.insert(owner) => {
                        if let Some(outbox) = self.outboxes.get_mut(&owner) {
                            outbox.events.push_back(msg.clone());
                        }
                    }
                    Some(_) => {}
                    None => tracing::trace!(%dst, "dropping message for unbound device"),
                }
            }
        }
    }
}

/// Per-connection [`EngineHandler`] of a [`PseudoEngine`].
pub struct Session {
    engine: PseudoEngine,
    id: ConnectionId,
    owned: BTreeSet<String>,
}

impl Session {
    fn check_bind(
        &self,
        state: &EngineState,
        params: &BindParams,
    ) -> Result<(), ProtocolError> {
        let allowed = &self.engine.shared.options.allowed_owners;
        if !allowed.is_empty() && !allowed.contains(&params.owner) {
            return Err(ProtocolError::new(
                ErrorKind::InvalidOwner,
                format!("owner '{}' is not permitted", params.owner),
            ));
        }
        if params.owner_cookie.is_some() {
            return Err(ProtocolError::new(
                ErrorKind::InvalidCookie,
                "owner cookies are not supported by this engine",
            ));
        }
        let topology = &state.topology;
        if !filter_matches(&params.graph_type, topology.graph_type()) {
            return Err(ProtocolError::new(
                ErrorKind::GraphTypeMismatch,
                format!(
                    "requested graph type '{}', running '{}'",
                    params.graph_type,
                    topology.graph_type()
                ),
            ));
        }
        if !filter_matches(&params.graph_instance, topology.graph_instance()) {
            return Err(ProtocolError::new(
                ErrorKind::GraphInstanceMismatch,
                format!(
                    "requested graph instance '{}', running '{}'",
                    params.graph_instance,
                    topology.graph_instance()
                ),
            ));
        }
        for id in &params.owned_devices {
            match topology.device(id) {
                None => return Err(ProtocolError::invalid_device(id, "no such device")),
                Some(device) if !device.is_external() => {
                    return Err(ProtocolError::invalid_device(id, "device is internal"));
                }
                Some(_) => {}
            }
            if state.owners.get(id).is_some_and(|&owner| owner != self.id) {
                return Err(ProtocolError::invalid_device(
                    id,
                    "already bound by another connection",
                ));
            }
        }
        Ok(())
    }

    fn check_send(&self, state: &EngineState, msg: &MulticastMessage) -> Result<(), ProtocolError> {
        let src = &msg.src;
        if !self.owned.contains(src.device()) {
            return Err(ProtocolError::invalid_device(
                src.device(),
                "not owned by this connection",
            ));
        }
        state
            .topology
            .check_port(src, Direction::Output)
            .map_err(|err| match err {
                TopologyError::WrongDirection(ep) => ProtocolError::new(
                    ErrorKind::InvalidDirection,
                    format!("{ep} is an input port"),
                ),
                other => ProtocolError::new(ErrorKind::InvalidEndpoint, other.to_string()),
            })
    }
}

impl EngineHandler for Session {
    async fn on_connect(&mut self, params: BindParams) -> Result<BindResult, ProtocolError> {
        let shared = &self.engine.shared;
        let mut state = shared.state.lock().await;
        self.check_bind(&state, &params)?;

        for id in &params.owned_devices {
            state.owners.insert(id.clone(), self.id);
        }
        state.outboxes.entry(self.id).or_default();
        shared.bound.send_replace(state.owners.len());
        self.owned = params.owned_devices;

        tracing::info!(
            connection = self.id,
            owner = %params.owner,
            devices = ?self.owned,
            "devices bound"
        );
        Ok(BindResult {
            graph_type: state.topology.graph_type().to_string(),
            graph_instance: state.topology.graph_instance().to_string(),
            incoming_edges: state.topology.incoming_edges(&self.owned),
        })
    }

    async fn on_run(&mut self) -> Result<(), ProtocolError> {
        let shared = &self.engine.shared;
        if shared.options.wait_for_all_externals {
            let want = shared.externals;
            tracing::info!(connection = self.id, want, "waiting for all externals to bind");
            let mut bound = shared.bound.subscribe();
            bound
                .wait_for(|&n| n >= want)
                .await
                .map_err(|e| ProtocolError::new(ErrorKind::Engine, e.to_string()))?;
        }
        tracing::debug!(connection = self.id, "running");
        Ok(())
    }

    async fn on_poll(&mut self, max_events: Option<u64>) -> Result<Vec<Event>, ProtocolError> {
        let limit = max_events.map_or(usize::MAX, |n| usize::try_from(n).unwrap_or(usize::MAX));
        let mut state = self.engine.shared.state.lock().await;
        let halt = state.halt.clone();
        let outbox = state.outboxes.get_mut(&self.id).ok_or_else(|| {
            ProtocolError::new(ErrorKind::Engine, "connection has no outbox")
        })?;

        let take = limit.min(outbox.events.len());
        let mut events: Vec<Event> = outbox.events.drain(..take).map(Event::Message).collect();
        if let Some(halt) = halt
            && events.len() < limit
        {
            events.push(Event::Halt(halt));
        }
        Ok(events)
    }

    async fn on_send(&mut self, messages: Vec<MulticastMessage>) -> Result<(), ProtocolError> {
        let mut state = self.engine.shared.state.lock().await;
        for msg in &messages {
            self.check_send(&state, msg)?;
        }
        tracing::debug!(connection = self.id, count = messages.len(), "routing");
        state.route(messages);
        Ok(())
    }

    async fn on_halt(&mut self, code: i64, message: Option<String>) -> Result<(), ProtocolError> {
        let mut state = self.engine.shared.state.lock().await;
        match &state.halt {
            Some(first) => {
                tracing::debug!(connection = self.id, code, first = first.code, "halt already recorded");
            }
            None => {
                tracing::info!(connection = self.id, code, ?message, "halt requested");
                state.halt = Some(Halt::new(code, message));
            }
        }
        Ok(())
    }

    async fn on_close(&mut self) {
        let shared = &self.engine.shared;
        let mut state = shared.state.lock().await;
        let id = self.id;
        state.owners.retain(|_, owner| *owner != id);
        state.outboxes.remove(&id);
        shared.bound.send_replace(state.owners.len());
        if !self.owned.is_empty() {
            tracing::info!(connection = id, devices = ?self.owned, "devices released");
        }
        self.owned.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn ep(s: &str) -> graphlink_core::Endpoint {
        s.parse().unwrap()
    }

    async fn bound(engine: &PseudoEngine, devices: &[&str]) -> Session {
        let mut session = engine.session();
        session
            .on_connect(BindParams::new(devices.iter().copied()))
            .await
            .unwrap();
        session
    }

    #[tokio::test]
    async fn bind_reports_scoped_edges() {
        let engine = PseudoEngine::echo(2).unwrap();
        let mut session = engine.session();
        let result = session
            .on_connect(BindParams::new(["ext1"]).graph_type("echo").graph_instance("*"))
            .await
            .unwrap();
        assert_eq!(result.graph_type, "echo");
        assert_eq!(result.graph_instance, "echo_2");
        assert_eq!(result.incoming_edges.destinations("int1:out"), [ep("ext1:in")]);
        assert_eq!(result.incoming_edges.len(), 1);
        assert_eq!(engine.bound_devices(), 1);
    }

    #[tokio::test]
    async fn bind_rejections() {
        let engine = PseudoEngine::new(
            Topology::echo(1).unwrap(),
            EngineOptions {
                allowed_owners: BTreeSet::from(["alice".to_string()]),
                ..EngineOptions::default()
            },
        );
        let cases = [
            (BindParams::new(["ext0"]), ErrorKind::InvalidOwner),
            (
                BindParams::new(["ext0"]).owner("alice").owner_cookie("c"),
                ErrorKind::InvalidCookie,
            ),
            (
                BindParams::new(["ext0"]).owner("alice").graph_type("heat"),
                ErrorKind::GraphTypeMismatch,
            ),
            (
                BindParams::new(["ext0"]).owner("alice").graph_instance("echo_9"),
                ErrorKind::GraphInstanceMismatch,
            ),
            (BindParams::new(["int0"]).owner("alice"), ErrorKind::InvalidDevice),
            (BindParams::new(["ext7"]).owner("alice"), ErrorKind::InvalidDevice),
        ];
        for (params, kind) in cases {
            let err = engine.session().on_connect(params).await.unwrap_err();
            assert_eq!(err.kind(), kind, "{err}");
        }
        assert_eq!(engine.bound_devices(), 0);
    }

    #[tokio::test]
    async fn overlapping_binds_and_release() {
        let engine = PseudoEngine::echo(3).unwrap();
        let mut first = bound(&engine, &["ext0", "ext1"]).await;
        let mut second = engine.session();
        let err = second
            .on_connect(BindParams::new(["ext1", "ext2"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidDevice);
        // A rejected bind claims nothing.
        assert_eq!(engine.bound_devices(), 2);

        first.on_close().await;
        assert_eq!(engine.bound_devices(), 0);
        second
            .on_connect(BindParams::new(["ext1", "ext2"]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn send_is_echoed_back_in_order() {
        let engine = PseudoEngine::echo(2).unwrap();
        let mut a = bound(&engine, &["ext0"]).await;
        let mut b = bound(&engine, &["ext1"]).await;

        a.on_send(vec![
            MulticastMessage::with_data(ep("ext0:out"), json!([0])),
            MulticastMessage::with_data(ep("ext0:out"), json!([1])),
        ])
        .await
        .unwrap();
        b.on_send(vec![MulticastMessage::new(ep("ext1:out"))])
            .await
            .unwrap();

        let first = a.on_poll(Some(1)).await.unwrap();
        assert_eq!(
            first,
            [Event::Message(MulticastMessage::with_data(ep("int0:out"), json!([0])))]
        );
        let rest = a.on_poll(None).await.unwrap();
        assert_eq!(
            rest,
            [Event::Message(MulticastMessage::with_data(ep("int0:out"), json!([1])))]
        );
        assert!(a.on_poll(None).await.unwrap().is_empty());
        assert_eq!(
            b.on_poll(None).await.unwrap(),
            [Event::Message(MulticastMessage::new(ep("int1:out")))]
        );
    }

    #[tokio::test]
    async fn send_checks_source() {
        let engine = PseudoEngine::echo(2).unwrap();
        let mut session = bound(&engine, &["ext0"]).await;
        let cases = [
            ("ext1:out", ErrorKind::InvalidDevice),
            ("ext0:nope", ErrorKind::InvalidEndpoint),
            ("ext0:in", ErrorKind::InvalidDirection),
        ];
        for (src, kind) in cases {
            let err = session
                .on_send(vec![MulticastMessage::new(ep(src))])
                .await
                .unwrap_err();
            assert_eq!(err.kind(), kind, "{src}");
        }
    }

    #[tokio::test]
    async fn halt_is_appended_when_the_batch_has_room() {
        let engine = PseudoEngine::echo(1).unwrap();
        let mut session = bound(&engine, &["ext0"]).await;
        session
            .on_send(vec![
                MulticastMessage::new(ep("ext0:out")),
                MulticastMessage::new(ep("ext0:out")),
            ])
            .await
            .unwrap();
        session.on_halt(4, Some("done".into())).await.unwrap();
        session.on_halt(9, None).await.unwrap();
        assert_eq!(engine.halted().await, Some(Halt::new(4, Some("done".into()))));

        let full = session.on_poll(Some(2)).await.unwrap();
        assert_eq!(full.len(), 2);
        assert!(!full.iter().any(Event::is_halt));
        assert!(session.on_poll(Some(0)).await.unwrap().is_empty());
        let last = session.on_poll(Some(5)).await.unwrap();
        assert_eq!(last, [Event::Halt(Halt::new(4, Some("done".into())))]);
    }

    #[tokio::test]
    async fn run_waits_for_every_external() {
        let engine = PseudoEngine::new(
            Topology::echo(2).unwrap(),
            EngineOptions {
                wait_for_all_externals: true,
                ..EngineOptions::default()
            },
        );
        let mut first = bound(&engine, &["ext0"]).await;
        let waiting = tokio::spawn(async move { first.on_run().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        let _second = bound(&engine, &["ext1"]).await;
        tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
