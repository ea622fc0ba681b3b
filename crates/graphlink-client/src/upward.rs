//! Controller side of a connection.

use graphlink_core::protocol::{BindReply, HaltParams, PollParams, PollReply, SendParams};
use graphlink_core::rpc::RpcClient;
use graphlink_core::transport::Channel;
use graphlink_core::{
    BindParams, BindResult, ConnectionState, ErrorKind, Event, IncomingEdges, MulticastMessage,
    Operation, ProtocolError, StateMachine,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeSet;

/// The controller's handle on a set of bound devices.
///
/// Every operation is checked against the local [`StateMachine`] first; a
/// call that the state does not permit never reaches the channel. Any failure
/// leaves the connection `ERRORED`, and from then on every call except
/// [`close`](Self::close) fails with `ConnectionErrored`.
pub struct UpwardConnection<C> {
    rpc: RpcClient<C>,
    machine: StateMachine,
    owned_devices: BTreeSet<String>,
    binding: Option<BindResult>,
}

impl<C: Channel> UpwardConnection<C> {
    pub fn new(channel: C) -> Self {
        Self {
            rpc: RpcClient::new(channel),
            machine: StateMachine::new(),
            owned_devices: BTreeSet::new(),
            binding: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    /// What `bind` resolved to, once bound.
    pub fn binding(&self) -> Option<&BindResult> {
        self.binding.as_ref()
    }

    pub fn graph_type(&self) -> Option<&str> {
        self.binding.as_ref().map(|b| b.graph_type.as_str())
    }

    pub fn graph_instance(&self) -> Option<&str> {
        self.binding.as_ref().map(|b| b.graph_instance.as_str())
    }

    pub fn incoming_edges(&self) -> Option<&IncomingEdges> {
        self.binding.as_ref().map(|b| &b.incoming_edges)
    }

    pub fn owned_devices(&self) -> &BTreeSet<String> {
        &self.owned_devices
    }

    /// Claim ownership of `params.owned_devices`.
    pub async fn bind(&mut self, params: BindParams) -> Result<BindResult, ProtocolError> {
        self.machine.begin(Operation::Bind)?;
        let reply: BindReply = self.call(Operation::Bind, &params).await?;
        let result = self.check(BindResult::try_from(reply))?;

        tracing::info!(
            graph_type = %result.graph_type,
            graph_instance = %result.graph_instance,
            devices = params.owned_devices.len(),
            sources = result.incoming_edges.len(),
            "bound"
        );
        self.owned_devices = params.owned_devices;
        self.binding = Some(result.clone());
        self.machine.succeed(Operation::Bind, false);
        Ok(result)
    }

    /// Ask the engine to start traffic for the owned devices.
    pub async fn run(&mut self) -> Result<(), ProtocolError> {
        self.machine.begin(Operation::Run)?;
        self.call_unit(Operation::Run, Value::Null).await?;
        tracing::info!("running");
        self.machine.succeed(Operation::Run, false);
        Ok(())
    }

    /// Drain up to `max_events` pending events, in delivery order.
    ///
    /// An empty batch means nothing has arrived yet. A batch ending in a
    /// `Halt` moves the connection to `FINISHED` once it has been returned.
    pub async fn poll(&mut self, max_events: Option<u64>) -> Result<Vec<Event>, ProtocolError> {
        self.machine.begin(Operation::Poll)?;
        let reply: PollReply = self.call(Operation::Poll, &PollParams { max_events }).await?;
        let events = self.check(validate_batch(reply.events, max_events))?;

        let halted = events.last().is_some_and(Event::is_halt);
        if self.machine.succeed(Operation::Poll, halted) == ConnectionState::Finished {
            tracing::info!("halt observed, connection finished");
        } else {
            tracing::debug!(count = events.len(), "polled");
        }
        Ok(events)
    }

    /// Inject messages on the output ports of owned devices.
    pub async fn send(&mut self, messages: Vec<MulticastMessage>) -> Result<(), ProtocolError> {
        self.machine.begin(Operation::Send)?;
        if let Some(stray) = messages
            .iter()
            .find(|m| !self.owned_devices.contains(m.src.device()))
        {
            let err = ProtocolError::invalid_device(
                stray.src.device(),
                "message source is not an owned device",
            );
            return self.check(Err(err));
        }
        let count = messages.len();
        let params = serde_json::to_value(SendParams { messages })
            .map_err(|e| ProtocolError::invalid_params(e.to_string()));
        let params = self.check(params)?;
        self.call_unit(Operation::Send, params).await?;
        tracing::debug!(count, "sent");
        self.machine.succeed(Operation::Send, false);
        Ok(())
    }

    /// Request termination. The stop itself is observed as a `Halt` event
    /// from a later [`poll`](Self::poll).
    pub async fn halt(&mut self, code: i64, message: Option<String>) -> Result<(), ProtocolError> {
        self.machine.begin(Operation::Halt)?;
        let params = HaltParams { code, message };
        let params = serde_json::to_value(params)
            .map_err(|e| ProtocolError::invalid_params(e.to_string()));
        let params = self.check(params)?;
        self.call_unit(Operation::Halt, params).await?;
        tracing::info!(code, "halt requested");
        self.machine.succeed(Operation::Halt, false);
        Ok(())
    }

    /// Release the channel and force `ERRORED`. Never fails; idempotent.
    pub async fn close(&mut self) {
        self.machine.close();
        if !self.rpc.is_closed() {
            tracing::debug!("closing connection");
            self.rpc.close().await;
        }
    }

    async fn call<P, R>(&mut self, op: Operation, params: &P) -> Result<R, ProtocolError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)
            .map_err(|e| ProtocolError::invalid_params(e.to_string()));
        let params = self.check(params)?;
        let result = self.call_unit(op, params).await?;
        let decoded = serde_json::from_value(result).map_err(|e| {
            ProtocolError::new(ErrorKind::InvalidResponse, format!("{op} result: {e}"))
        });
        self.check(decoded)
    }

    async fn call_unit(&mut self, op: Operation, params: Value) -> Result<Value, ProtocolError> {
        let result = self.rpc.call(op.method(), params).await;
        self.check(result)
    }

    /// Any failure is terminal for the connection.
    fn check<T>(&mut self, result: Result<T, ProtocolError>) -> Result<T, ProtocolError> {
        if let Err(err) = &result {
            tracing::warn!(error = %err, "connection failed");
            self.machine.fail();
        }
        result
    }
}

/// Enforce delivery rules on a poll batch: no more than requested, and
/// nothing after a halt.
fn validate_batch(events: Vec<Event>, max_events: Option<u64>) -> Result<Vec<Event>, ProtocolError> {
    let invalid = |what: String| ProtocolError::new(ErrorKind::InvalidResponse, what);
    if let Some(max) = max_events
        && events.len() as u64 > max
    {
        return Err(invalid(format!(
            "poll returned {} events, at most {max} requested",
            events.len()
        )));
    }
    if let Some(pos) = events.iter().position(Event::is_halt)
        && pos + 1 != events.len()
    {
        return Err(invalid("poll returned events after a halt".to_string()));
    }
    Ok(events)
}
