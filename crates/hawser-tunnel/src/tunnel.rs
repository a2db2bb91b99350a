use std::sync::Arc;

use futures_util::stream::BoxStream;
use hawser_proto::{AgentDescriptor, ConnectRequest, ConnectResponse};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tonic::Status;

use crate::registry::TunnelRegistry;

/// Authenticated identity of a connected agent.
#[derive(Debug, Clone)]
pub struct AgentInfo {
    pub id: i64,
    pub name: String,
}

/// Inbound frames of one agent stream. The server glue adapts a tonic
/// `Streaming<ConnectRequest>` into this; tests script it directly.
pub type FrameStream = BoxStream<'static, Result<ConnectRequest, Status>>;

pub(crate) struct TunnelStreams {
    pub(crate) incoming: FrameStream,
    pub(crate) outgoing: mpsc::Sender<Result<ConnectResponse, Status>>,
}

/// Tunnel lifecycle. `Matched { piping }` distinguishes "assigned to a
/// find-request" from "actively forwarding" so cancellation knows whether a
/// pipe result is still coming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TunnelState {
    Ready,
    Matched { piping: bool },
    Closing,
    Done,
}

pub(crate) struct TunnelShared {
    pub(crate) agent_id: i64,
    pub(crate) descriptor: AgentDescriptor,
    pub(crate) state: Mutex<TunnelState>,
    pub(crate) streams: Mutex<Option<TunnelStreams>>,
    pub(crate) ret: Mutex<Option<oneshot::Sender<Result<(), Status>>>>,
}

impl TunnelShared {
    pub(crate) fn new(
        agent_id: i64,
        descriptor: AgentDescriptor,
        incoming: FrameStream,
        outgoing: mpsc::Sender<Result<ConnectResponse, Status>>,
        ret: oneshot::Sender<Result<(), Status>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            agent_id,
            descriptor,
            state: Mutex::new(TunnelState::Ready),
            streams: Mutex::new(Some(TunnelStreams { incoming, outgoing })),
            ret: Mutex::new(Some(ret)),
        })
    }

    /// Matched{piping: false} -> Matched{piping: true}. Any other state
    /// means the tunnel was cancelled or misused before forwarding began.
    pub(crate) fn begin_piping(&self) -> Result<(), Status> {
        let mut state = self.state.lock();
        match *state {
            TunnelState::Matched { piping: false } => {
                *state = TunnelState::Matched { piping: true };
                Ok(())
            }
            TunnelState::Matched { piping: true } => {
                Err(Status::internal("forward called more than once"))
            }
            TunnelState::Closing => Err(Status::cancelled("tunnel is closing")),
            TunnelState::Done => Err(Status::internal("forward called on finished tunnel")),
            TunnelState::Ready => Err(Status::internal("unreachable: forward on idle tunnel")),
        }
    }

    /// Ends a forwarding run: transitions to Done and hands the tunnel-side
    /// result to the blocked `handle_tunnel`.
    pub(crate) fn finish_piping(&self, result: Result<(), Status>) {
        {
            let mut state = self.state.lock();
            debug_assert_eq!(*state, TunnelState::Matched { piping: true });
            *state = TunnelState::Done;
        }
        if let Some(ret) = self.ret.lock().take() {
            let _ = ret.send(result);
        }
    }

    pub(crate) fn take_streams(&self) -> Option<TunnelStreams> {
        self.streams.lock().take()
    }
}

/// A matched tunnel, exclusively owned by the find-request it satisfied.
/// Dropping it without forwarding returns the tunnel to the registry;
/// [`crate::forward`] consumes it.
pub struct Tunnel {
    pub(crate) shared: Arc<TunnelShared>,
    pub(crate) registry: Arc<TunnelRegistry>,
    pub(crate) consumed: bool,
}

impl Tunnel {
    pub fn agent_id(&self) -> i64 {
        self.shared.agent_id
    }

    pub fn descriptor(&self) -> &AgentDescriptor {
        &self.shared.descriptor
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("agent_id", &self.shared.agent_id)
            .field("consumed", &self.consumed)
            .finish_non_exhaustive()
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        if !self.consumed {
            self.registry.on_tunnel_unused(&self.shared);
        }
    }
}
