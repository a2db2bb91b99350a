// Wire types for the reverse-tunnel and peer-gateway protocols.
//
// The message set is small and the routing layer addresses methods by path
// with explicit codecs, so the types are declared here directly with prost
// derives and every other crate depends on this single type source.

mod gateway;
mod meta;
mod presence;
mod status;
mod tunnel;

pub use gateway::*;
pub use meta::*;
pub use presence::*;
pub use status::*;
pub use tunnel::*;

/// Full gRPC method of the agent-facing tunnel stream.
pub const CONNECT_FULL_METHOD: &str = "/hawser.tunnel.v1.ReverseTunnel/Connect";

/// Full gRPC method of the peer-to-peer forwarding stream.
pub const PROXY_TUNNEL_FULL_METHOD: &str = "/hawser.gateway.v1.GatewayTunnel/ProxyTunnel";

/// Service/method pair agents advertise to serve proxied Kubernetes API
/// calls. The gateway routes every proxied HTTP request to this method.
pub const KUBERNETES_PROXY_SERVICE: &str = "hawser.k8s.v1.KubernetesProxy";
pub const KUBERNETES_PROXY_METHOD: &str = "Proxy";
pub const KUBERNETES_PROXY_FULL_METHOD: &str = "/hawser.k8s.v1.KubernetesProxy/Proxy";

/// gRPC metadata keys used on the peer forwarding hop.
pub const ROUTING_AGENT_ID_KEY: &str = "hawser-routing-agent-id";
pub const ROUTING_METHOD_KEY: &str = "hawser-routing-method";

/// Splits a full gRPC method name (`/package.Service/Method`) into its
/// service and method parts.
pub fn split_full_method(full_method: &str) -> Option<(&str, &str)> {
    let rest = full_method.strip_prefix('/')?;
    let (service, method) = rest.split_once('/')?;
    if service.is_empty() || method.is_empty() {
        return None;
    }
    Some((service, method))
}
