use crate::{CloseSend, Error, Header, Message, RequestInfo, Trailer};

/// Frame sent by the routing peer on the forwarding stream. The first frame
/// MUST be `start_streaming`, sent only after the serving peer has answered
/// `tunnel_ready`; until then the attempt is side-effect free and can be
/// abandoned.
#[derive(Clone, PartialEq, prost::Message)]
pub struct GatewayRequest {
    #[prost(oneof = "gateway_request::Msg", tags = "1, 2, 3, 4")]
    pub msg: Option<gateway_request::Msg>,
}

pub mod gateway_request {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Msg {
        #[prost(message, tag = "1")]
        StartStreaming(super::StartStreaming),
        #[prost(message, tag = "2")]
        RequestInfo(super::RequestInfo),
        #[prost(message, tag = "3")]
        Message(super::Message),
        #[prost(message, tag = "4")]
        CloseSend(super::CloseSend),
    }
}

/// Frame sent by the serving peer: one `tunnel_ready` once a local tunnel
/// has been matched, then the tunnel's response frames relayed verbatim.
#[derive(Clone, PartialEq, prost::Message)]
pub struct GatewayResponse {
    #[prost(oneof = "gateway_response::Msg", tags = "1, 2, 3, 4, 5")]
    pub msg: Option<gateway_response::Msg>,
}

pub mod gateway_response {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Msg {
        #[prost(message, tag = "1")]
        TunnelReady(super::TunnelReady),
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

#[derive(Clone, PartialEq, prost::Message)]
pub struct TunnelReady {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StartStreaming {}

impl GatewayRequest {
    pub fn start_streaming() -> Self {
        Self {
            msg: Some(gateway_request::Msg::StartStreaming(StartStreaming {})),
        }
    }

    pub fn request_info(info: RequestInfo) -> Self {
        Self {
            msg: Some(gateway_request::Msg::RequestInfo(info)),
        }
    }

    pub fn message(data: Vec<u8>) -> Self {
        Self {
            msg: Some(gateway_request::Msg::Message(Message { data })),
        }
    }

    pub fn close_send() -> Self {
        Self {
            msg: Some(gateway_request::Msg::CloseSend(CloseSend {})),
        }
    }
}

impl GatewayResponse {
    pub fn tunnel_ready() -> Self {
        Self {
            msg: Some(gateway_response::Msg::TunnelReady(TunnelReady {})),
        }
    }

    pub fn header(header: Header) -> Self {
        Self {
            msg: Some(gateway_response::Msg::Header(header)),
        }
    }

    pub fn message(data: Vec<u8>) -> Self {
        Self {
            msg: Some(gateway_response::Msg::Message(Message { data })),
        }
    }

    pub fn trailer(trailer: Trailer) -> Self {
        Self {
            msg: Some(gateway_response::Msg::Trailer(trailer)),
        }
    }

    pub fn error(error: Error) -> Self {
        Self {
            msg: Some(gateway_response::Msg::Error(error)),
        }
    }
}
