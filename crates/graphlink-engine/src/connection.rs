//! Engine side of a connection.

use crate::EngineHandler;
use graphlink_core::protocol::{BindReply, Call, PollReply};
use graphlink_core::rpc::RpcServer;
use graphlink_core::transport::Channel;
use graphlink_core::{
    ConnectionState, ErrorKind, Operation, ProtocolError, StateMachine, contains_halt,
};
use serde::Serialize;
use serde_json::Value;

/// Receives calls from one controller and dispatches them to an
/// [`EngineHandler`].
///
/// Requests the connection state does not permit are answered without
/// reaching the handler.
pub struct DownwardConnection<C> {
    rpc: RpcServer<C>,
    machine: StateMachine,
    closed: bool,
}

impl<C: Channel> DownwardConnection<C> {
    pub fn new(channel: C) -> Self {
        Self {
            rpc: RpcServer::new(channel),
            machine: StateMachine::new(),
            closed: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    /// Handle exactly one request and return the operation it named.
    ///
    /// The error of a rejected request is returned after it has been sent to
    /// the peer. When the peer hangs up this fails with `EndOfStream`, after
    /// `on_close` has run.
    pub async fn do_events<H: EngineHandler>(
        &mut self,
        handler: &mut H,
    ) -> Result<Operation, ProtocolError> {
        if self.closed {
            return Err(ProtocolError::end_of_stream());
        }
        let call = match self.rpc.next_call().await {
            Ok(call) => call,
            Err(err) => {
                self.close(handler).await;
                return Err(err);
            }
        };

        let Some(op) = Operation::from_method(&call.method) else {
            self.machine.fail();
            let err = ProtocolError::new(
                ErrorKind::MethodNotFound,
                format!("unknown method '{}'", call.method),
            );
            self.respond(handler, &call.id, Err(err.clone())).await?;
            return Err(err);
        };

        tracing::debug!(method = %op, state = %self.machine.state(), "dispatching");
        let outcome = self.dispatch(op, call.params, handler).await;
        match outcome {
            Ok(result) => {
                self.respond(handler, &call.id, Ok(result)).await?;
                Ok(op)
            }
            // The peer left mid-call; nobody is listening for the reply.
            Err(err) if self.closed => Err(err),
            Err(err) => {
                self.respond(handler, &call.id, Err(err.clone())).await?;
                Err(err)
            }
        }
    }

    /// Handle requests until the peer goes away.
    pub async fn serve<H: EngineHandler>(mut self, mut handler: H) {
        loop {
            match self.do_events(&mut handler).await {
                Ok(op) => tracing::trace!(method = %op, "handled"),
                Err(err) if self.closed => {
                    match err.kind() {
                        ErrorKind::EndOfStream => tracing::info!("controller disconnected"),
                        _ => tracing::warn!(error = %err, "connection lost"),
                    }
                    break;
                }
                Err(err) => tracing::warn!(error = %err, "request rejected"),
            }
        }
    }

    /// Release the channel and notify the handler. Idempotent.
    pub async fn close<H: EngineHandler>(&mut self, handler: &mut H) {
        self.machine.close();
        if !self.closed {
            self.closed = true;
            self.rpc.close().await;
            handler.on_close().await;
        }
    }

    async fn dispatch<H: EngineHandler>(
        &mut self,
        op: Operation,
        params: Value,
        handler: &mut H,
    ) -> Result<Value, ProtocolError> {
        self.machine.begin(op)?;
        // Callbacks may suspend for a long time; a hangup meanwhile must still
        // release the connection.
        let outcome = tokio::select! {
            biased;
            outcome = invoke(op, params, &mut *handler) => Ok(outcome),
            interrupted = self.rpc.interrupted() => interrupted.map(Err),
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(gone) => {
                tracing::warn!(method = %op, error = %gone, "controller went away mid-call");
                self.close(handler).await;
                return Err(gone);
            }
        };
        match outcome {
            Ok((result, halted)) => {
                let state = self.machine.succeed(op, halted);
                if state == ConnectionState::Finished {
                    tracing::info!("halt delivered, connection finished");
                }
                Ok(result)
            }
            Err(err) => {
                self.machine.fail();
                Err(err)
            }
        }
    }

    async fn respond<H: EngineHandler>(
        &mut self,
        handler: &mut H,
        id: &Value,
        outcome: Result<Value, ProtocolError>,
    ) -> Result<(), ProtocolError> {
        let sent = match &outcome {
            Ok(result) => self.rpc.reply(id, result.clone()).await,
            Err(err) => self.rpc.reply_error(id, err).await,
        };
        if let Err(err) = sent {
            self.close(handler).await;
            return Err(err);
        }
        Ok(())
    }
}

/// Decode params, run the callback and encode its result. The flag reports
/// whether a poll batch carried the halt.
async fn invoke<H: EngineHandler>(
    op: Operation,
    params: Value,
    handler: &mut H,
) -> Result<(Value, bool), ProtocolError> {
    Ok(match Call::decode(op, params)? {
        Call::Bind(params) => {
            let result = handler.on_connect(params).await?;
            (encode(BindReply::from(result))?, false)
        }
        Call::Run => {
            handler.on_run().await?;
            (Value::Null, false)
        }
        Call::Poll(params) => {
            let events = handler.on_poll(params.max_events).await?;
            let halted = contains_halt(&events);
            (encode(PollReply { events })?, halted)
        }
        Call::Send(params) => {
            handler.on_send(params.messages).await?;
            (Value::Null, false)
        }
        Call::Halt(params) => {
            handler.on_halt(params.code, params.message).await?;
            (Value::Null, false)
        }
    })
}

fn encode(result: impl Serialize) -> Result<Value, ProtocolError> {
    serde_json::to_value(result)
        .map_err(|e| ProtocolError::new(ErrorKind::Engine, format!("unencodable result: {e}")))
}
