use graphlink_core::{BindParams, BindResult, Event, MulticastMessage, ProtocolError};
use std::future::Future;

/// Engine callbacks driven by a [`DownwardConnection`](crate::DownwardConnection).
///
/// One handler serves one connection. Callbacks only run for requests that
/// the connection state permits; an `Err` becomes the RPC error response and
/// leaves the connection `ERRORED`.
pub trait EngineHandler: Send {
    /// Resolve a `bind`: check credentials and filters, then claim the
    /// devices. Must reject devices owned by any other live connection.
    fn on_connect(
        &mut self,
        params: BindParams,
    ) -> impl Future<Output = Result<BindResult, ProtocolError>> + Send;

    fn on_run(&mut self) -> impl Future<Output = Result<(), ProtocolError>> + Send;

    /// Up to `max_events` pending events in delivery order. A `Halt`, if
    /// present, must be last.
    fn on_poll(
        &mut self,
        max_events: Option<u64>,
    ) -> impl Future<Output = Result<Vec<Event>, ProtocolError>> + Send;

    fn on_send(
        &mut self,
        messages: Vec<MulticastMessage>,
    ) -> impl Future<Output = Result<(), ProtocolError>> + Send;

    fn on_halt(
        &mut self,
        code: i64,
        message: Option<String>,
    ) -> impl Future<Output = Result<(), ProtocolError>> + Send;

    /// The peer is gone. Called once per connection.
    fn on_close(&mut self) -> impl Future<Output = ()> + Send {
        async {}
    }
}
