// Server side of the reverse tunnel: the registry pairs inbound proxied
// requests with waiting agent streams, the pipe forwards one logical RPC
// over a matched stream, and the router falls back to peer brokers found
// via presence when no local tunnel matches.

mod peer_auth;
mod pipe;
mod registry;
mod router;
mod service;
mod tunnel;

pub use pipe::{PipeRequest, TunnelDataSink, forward};
pub use registry::{FindHandle, TunnelRegistry};
pub use router::{PeerPool, ProxyResponse, RoutedRequest, TunnelRouter};
pub use service::{
    ConnectStream, GatewayTunnelServer, GatewayTunnelService, ProxyTunnelStream,
    ReverseTunnelClient, ReverseTunnelHandler, ReverseTunnelServer,
};
pub use tunnel::{AgentInfo, FrameStream, Tunnel};
