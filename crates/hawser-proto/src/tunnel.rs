use std::collections::HashMap;

use crate::{RpcStatus, Values};

/// Frame sent by the agent on its tunnel stream. The first frame MUST be a
/// descriptor; afterwards the agent may only send response frames for the
/// one request that is piped through the tunnel.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ConnectRequest {
    #[prost(oneof = "connect_request::Msg", tags = "1, 2, 3, 4, 5")]
    pub msg: Option<connect_request::Msg>,
}

pub mod connect_request {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Msg {
        #[prost(message, tag = "1")]
        Descriptor(super::AgentDescriptor),
        #[prost(message, tag = "2")]
        Header(super::Header),
        #[prost(message, tag = "3")]
        Message(super::Message),
        #[prost(message, tag = "4")]
        Trailer(super::Trailer),
        #[prost(message, tag = "5")]
        Error(super::Error),
    }
}

/// Frame sent by the server into the tunnel: exactly one request info,
/// zero or more message chunks, then a close-send marker.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ConnectResponse {
    #[prost(oneof = "connect_response::Msg", tags = "1, 2, 3")]
    pub msg: Option<connect_response::Msg>,
}

pub mod connect_response {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Msg {
        #[prost(message, tag = "1")]
        RequestInfo(super::RequestInfo),
        #[prost(message, tag = "2")]
        Message(super::Message),
        #[prost(message, tag = "3")]
        CloseSend(super::CloseSend),
    }
}

impl ConnectRequest {
    pub fn descriptor(descriptor: AgentDescriptor) -> Self {
        Self { msg: Some(connect_request::Msg::Descriptor(descriptor)) }
    }

    pub fn header(meta: HashMap<String, Values>) -> Self {
        Self { msg: Some(connect_request::Msg::Header(Header { meta })) }
    }

    pub fn message(data: Vec<u8>) -> Self {
        Self { msg: Some(connect_request::Msg::Message(Message { data })) }
    }

    pub fn trailer(meta: HashMap<String, Values>) -> Self {
        Self { msg: Some(connect_request::Msg::Trailer(Trailer { meta })) }
    }

    pub fn error(status: RpcStatus) -> Self {
        Self { msg: Some(connect_request::Msg::Error(Error { status: Some(status) })) }
    }
}

impl ConnectResponse {
    pub fn request_info(info: RequestInfo) -> Self {
        Self { msg: Some(connect_response::Msg::RequestInfo(info)) }
    }

    pub fn message(data: Vec<u8>) -> Self {
        Self { msg: Some(connect_response::Msg::Message(Message { data })) }
    }

    pub fn close_send() -> Self {
        Self { msg: Some(connect_response::Msg::CloseSend(CloseSend {})) }
    }
}

/// The set of (service, method) pairs an agent can serve.
#[derive(Clone, PartialEq, prost::Message)]
pub struct AgentDescriptor {
    #[prost(message, repeated, tag = "1")]
    pub services: Vec<ServiceDescriptor>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ServiceDescriptor {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, repeated, tag = "2")]
    pub methods: Vec<MethodDescriptor>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MethodDescriptor {
    #[prost(string, tag = "1")]
    pub name: String,
}

impl AgentDescriptor {
    /// Whether the agent advertised the given service and method.
    pub fn supports_service_and_method(&self, service: &str, method: &str) -> bool {
        self.services
            .iter()
            .filter(|s| s.name == service)
            .any(|s| s.methods.iter().any(|m| m.name == method))
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Header {
    #[prost(map = "string, message", tag = "1")]
    pub meta: HashMap<String, Values>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Message {
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Trailer {
    #[prost(map = "string, message", tag = "1")]
    pub meta: HashMap<String, Values>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Error {
    #[prost(message, optional, tag = "1")]
    pub status: Option<RpcStatus>,
}

/// Describes the logical RPC piped through the tunnel. `meta` carries the
/// request metadata, including the `:method`/`:path` pseudo entries for
/// proxied HTTP requests; `extra` is opaque to the transport and carries an
/// encoded [`ImpersonationConfig`] when the request acts as a user.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RequestInfo {
    #[prost(string, tag = "1")]
    pub method_name: String,
    #[prost(map = "string, message", tag = "2")]
    pub meta: HashMap<String, Values>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub extra: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CloseSend {}

/// Identity the proxied call should act as inside the agent's cluster.
/// Omitted entirely when the caller accesses the cluster as the agent
/// itself.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ImpersonationConfig {
    #[prost(string, tag = "1")]
    pub username: String,
    #[prost(string, repeated, tag = "2")]
    pub groups: Vec<String>,
    #[prost(string, repeated, tag = "3")]
    pub roles: Vec<String>,
}

impl ImpersonationConfig {
    pub fn encode_to_extra(&self) -> Vec<u8> {
        use prost::Message as _;
        self.encode_to_vec()
    }

    pub fn decode_from_extra(extra: &[u8]) -> Result<Self, prost::DecodeError> {
        use prost::Message as _;
        Self::decode(extra)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> AgentDescriptor {
        AgentDescriptor {
            services: vec![
                ServiceDescriptor {
                    name: "hawser.k8s.v1.KubernetesProxy".into(),
                    methods: vec![MethodDescriptor { name: "Proxy".into() }],
                },
                ServiceDescriptor {
                    name: "other.Service".into(),
                    methods: vec![
                        MethodDescriptor { name: "A".into() },
                        MethodDescriptor { name: "B".into() },
                    ],
                },
            ],
        }
    }

    #[test]
    fn descriptor_matches_advertised_pairs() {
        let d = descriptor();
        assert!(d.supports_service_and_method("hawser.k8s.v1.KubernetesProxy", "Proxy"));
        assert!(d.supports_service_and_method("other.Service", "B"));
        assert!(!d.supports_service_and_method("hawser.k8s.v1.KubernetesProxy", "B"));
        assert!(!d.supports_service_and_method("unknown.Service", "Proxy"));
    }

    #[test]
    fn request_info_extra_round_trips() {
        use prost::Message as _;

        let imp = ImpersonationConfig {
            username: "u1".into(),
            groups: vec!["g".into()],
            roles: vec!["r".into()],
        };
        let info = RequestInfo {
            method_name: "/hawser.k8s.v1.KubernetesProxy/Proxy".into(),
            meta: HashMap::new(),
            extra: Some(imp.encode_to_extra()),
        };
        let decoded = RequestInfo::decode(info.encode_to_vec().as_slice()).unwrap();
        let extra = decoded.extra.as_deref().unwrap();
        assert_eq!(ImpersonationConfig::decode_from_extra(extra).unwrap(), imp);

        // Access-as-agent requests carry no extra at all.
        let info = RequestInfo {
            method_name: info.method_name.clone(),
            meta: HashMap::new(),
            extra: None,
        };
        let decoded = RequestInfo::decode(info.encode_to_vec().as_slice()).unwrap();
        assert!(decoded.extra.is_none());
    }
}
