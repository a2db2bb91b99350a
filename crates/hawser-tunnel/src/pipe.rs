use std::pin::pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use hawser_proto::{ConnectResponse, Meta, RequestInfo, RpcStatus, connect_request};
use tokio::sync::mpsc;
use tonic::Status;

use crate::tunnel::{FrameStream, Tunnel};

/// One logical request to forward over a tunnel: the request info frame
/// fields plus the opaque body chunks.
pub struct PipeRequest {
    pub method: String,
    pub meta: Meta,
    pub extra: Option<Vec<u8>>,
    pub body: BoxStream<'static, Result<Bytes, Status>>,
}

/// Receives the response side of a piped request in protocol order: one
/// header, then messages, then at most one trailer or a terminal error.
#[async_trait]
pub trait TunnelDataSink: Send {
    async fn header(&mut self, meta: Meta) -> Result<(), Status>;
    async fn message(&mut self, data: Vec<u8>) -> Result<(), Status>;
    async fn trailer(&mut self, meta: Meta) -> Result<(), Status>;
    async fn error(&mut self, status: RpcStatus) -> Result<(), Status>;
}

/// Outbound writer half of a conduit to an agent, local or via a peer.
#[async_trait]
pub(crate) trait FrameTx: Send {
    async fn send_info(&mut self, info: RequestInfo) -> Result<(), Status>;
    async fn send_data(&mut self, data: Vec<u8>) -> Result<(), Status>;
    async fn send_close(&mut self) -> Result<(), Status>;
}

/// Inbound reader half of a conduit.
#[async_trait]
pub(crate) trait FrameRx: Send {
    async fn recv(&mut self) -> Result<Option<InboundFrame>, Status>;
}

pub(crate) enum InboundFrame {
    Header(Meta),
    Message(Vec<u8>),
    Trailer(Meta),
    Error(RpcStatus),
    /// A frame type that is illegal at this point of the stream, by name.
    Unexpected(&'static str),
}

/// Result split between the two parties of a pipe: the tunnel handler gets
/// `for_tunnel` as its stream outcome, the requester gets `for_caller`.
pub(crate) struct PipeOutcome {
    pub(crate) for_tunnel: Result<(), Status>,
    pub(crate) for_caller: Result<(), Status>,
}

impl PipeOutcome {
    fn ok() -> Self {
        Self { for_tunnel: Ok(()), for_caller: Ok(()) }
    }

    fn err(pair: ErrPair) -> Self {
        Self { for_tunnel: Err(pair.0), for_caller: Err(pair.1) }
    }
}

type ErrPair = (Status, Status);

/// Forwards one request over a matched local tunnel and feeds the response
/// into `sink`. Consumes the tunnel; its handler is released with the
/// tunnel-side verdict when the pipe ends.
pub async fn forward<S>(mut tunnel: Tunnel, request: PipeRequest, sink: &mut S) -> Result<(), Status>
where
    S: TunnelDataSink + ?Sized,
{
    tunnel.shared.begin_piping()?;
    tunnel.consumed = true;
    let shared = tunnel.shared.clone();
    drop(tunnel);
    let Some(streams) = shared.take_streams() else {
        let status = Status::internal("tunnel streams already taken");
        shared.finish_piping(Err(status.clone()));
        return Err(status);
    };
    let outcome = run_pipe(
        LocalFrameTx { tx: streams.outgoing },
        LocalFrameRx { rx: streams.incoming },
        request,
        sink,
    )
    .await;
    shared.finish_piping(outcome.for_tunnel);
    outcome.for_caller
}

/// Runs both directions of a pipe under one supervisor: either side's
/// failure tears the other down, and the outcome carries distinct statuses
/// for the tunnel and the requester.
pub(crate) async fn run_pipe<T, R, S>(
    mut tx: T,
    mut rx: R,
    request: PipeRequest,
    sink: &mut S,
) -> PipeOutcome
where
    T: FrameTx,
    R: FrameRx,
    S: TunnelDataSink + ?Sized,
{
    let PipeRequest { method, meta, extra, mut body } = request;

    let send_half = async move {
        let info = RequestInfo { method_name: method, meta, extra };
        tx.send_info(info).await.map_err(both)?;
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(data) => tx.send_data(data.to_vec()).await.map_err(both)?,
                Err(status) => {
                    // The requester's stream failed; cancel the tunnel.
                    return Err((Status::cancelled("read from inbound stream failed"), status));
                }
            }
        }
        tx.send_close().await.map_err(both)?;
        Ok::<(), ErrPair>(())
    };

    let recv_half = async move {
        let mut got_header = false;
        let mut trailer: Option<Meta> = None;
        let mut errored = false;
        loop {
            let frame = match rx.recv().await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(status) => return Err(both(status)),
            };
            if errored {
                // Nothing after an error frame is processed; the stream is
                // only drained to its end.
                continue;
            }
            match frame {
                InboundFrame::Header(meta) if !got_header => {
                    got_header = true;
                    sink.header(meta).await.map_err(sink_failed)?;
                }
                InboundFrame::Header(_) => return Err(protocol_violation("duplicate header frame")),
                InboundFrame::Message(data) if got_header => {
                    sink.message(data).await.map_err(sink_failed)?;
                }
                InboundFrame::Message(_) => {
                    return Err(protocol_violation("message frame before header"));
                }
                InboundFrame::Trailer(meta) if got_header && trailer.is_none() => {
                    // Senders may emit the trailer before EOF; hold it so
                    // the sink still observes it after all messages.
                    trailer = Some(meta);
                }
                InboundFrame::Trailer(_) => {
                    return Err(protocol_violation("unexpected trailer frame"));
                }
                InboundFrame::Error(status) => {
                    errored = true;
                    sink.error(status).await.map_err(sink_failed)?;
                }
                InboundFrame::Unexpected(name) => {
                    return Err(protocol_violation_owned(format!("unexpected {name} frame")));
                }
            }
        }
        if !errored {
            if !got_header {
                let status = Status::internal("tunnel closed before response header");
                return Err((status.clone(), status));
            }
            if let Some(meta) = trailer.take() {
                sink.trailer(meta).await.map_err(sink_failed)?;
            }
        }
        Ok::<(), ErrPair>(())
    };

    let mut send_half = pin!(send_half);
    let mut recv_half = pin!(recv_half);
    tokio::select! {
        s = &mut send_half => match s {
            Err(pair) => PipeOutcome::err(pair),
            Ok(()) => match recv_half.await {
                Err(pair) => PipeOutcome::err(pair),
                Ok(()) => PipeOutcome::ok(),
            },
        },
        r = &mut recv_half => match r {
            Err(pair) => PipeOutcome::err(pair),
            Ok(()) => match send_half.await {
                Err(pair) => PipeOutcome::err(pair),
                Ok(()) => PipeOutcome::ok(),
            },
        },
    }
}

fn both(status: Status) -> ErrPair {
    (status.clone(), status)
}

fn sink_failed(status: Status) -> ErrPair {
    (Status::cancelled("inbound stream closed"), status)
}

fn protocol_violation(msg: &'static str) -> ErrPair {
    protocol_violation_owned(msg.to_string())
}

fn protocol_violation_owned(msg: String) -> ErrPair {
    (
        Status::invalid_argument(msg.clone()),
        Status::internal(format!("agent protocol error: {msg}")),
    )
}

pub(crate) struct LocalFrameTx {
    pub(crate) tx: mpsc::Sender<Result<ConnectResponse, Status>>,
}

#[async_trait]
impl FrameTx for LocalFrameTx {
    async fn send_info(&mut self, info: RequestInfo) -> Result<(), Status> {
        self.send(ConnectResponse::request_info(info)).await
    }

    async fn send_data(&mut self, data: Vec<u8>) -> Result<(), Status> {
        self.send(ConnectResponse::message(data)).await
    }

    async fn send_close(&mut self) -> Result<(), Status> {
        self.send(ConnectResponse::close_send()).await
    }
}

impl LocalFrameTx {
    async fn send(&mut self, frame: ConnectResponse) -> Result<(), Status> {
        self.tx
            .send(Ok(frame))
            .await
            .map_err(|_| Status::unavailable("tunnel stream closed"))
    }
}

pub(crate) struct LocalFrameRx {
    pub(crate) rx: FrameStream,
}

#[async_trait]
impl FrameRx for LocalFrameRx {
    async fn recv(&mut self) -> Result<Option<InboundFrame>, Status> {
        match self.rx.next().await {
            None => Ok(None),
            Some(Err(status)) => Err(status),
            Some(Ok(frame)) => Ok(Some(match frame.msg {
                Some(connect_request::Msg::Header(h)) => InboundFrame::Header(h.meta),
                Some(connect_request::Msg::Message(m)) => InboundFrame::Message(m.data),
                Some(connect_request::Msg::Trailer(t)) => InboundFrame::Trailer(t.meta),
                Some(connect_request::Msg::Error(e)) => {
                    InboundFrame::Error(e.status.unwrap_or_else(|| {
                        RpcStatus::from_status(&Status::unknown("agent reported an empty error"))
                    }))
                }
                Some(connect_request::Msg::Descriptor(_)) => InboundFrame::Unexpected("descriptor"),
                None => InboundFrame::Unexpected("empty"),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use hawser_proto::meta_insert;
    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug, PartialEq)]
    enum Sent {
        Info(String),
        Data(Vec<u8>),
        Close,
    }

    #[derive(Clone, Default)]
    struct RecordingTx {
        sent: Arc<Mutex<Vec<Sent>>>,
    }

    #[async_trait]
    impl FrameTx for RecordingTx {
        async fn send_info(&mut self, info: RequestInfo) -> Result<(), Status> {
            self.sent.lock().push(Sent::Info(info.method_name));
            Ok(())
        }

        async fn send_data(&mut self, data: Vec<u8>) -> Result<(), Status> {
            self.sent.lock().push(Sent::Data(data));
            Ok(())
        }

        async fn send_close(&mut self) -> Result<(), Status> {
            self.sent.lock().push(Sent::Close);
            Ok(())
        }
    }

    struct ScriptedRx {
        frames: VecDeque<InboundFrame>,
    }

    #[async_trait]
    impl FrameRx for ScriptedRx {
        async fn recv(&mut self) -> Result<Option<InboundFrame>, Status> {
            Ok(self.frames.pop_front())
        }
    }

    #[derive(Debug, PartialEq)]
    enum Event {
        Header,
        Message(Vec<u8>),
        Trailer,
        Error(i32),
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Vec<Event>,
    }

    #[async_trait]
    impl TunnelDataSink for RecordingSink {
        async fn header(&mut self, _meta: Meta) -> Result<(), Status> {
            self.events.push(Event::Header);
            Ok(())
        }

        async fn message(&mut self, data: Vec<u8>) -> Result<(), Status> {
            self.events.push(Event::Message(data));
            Ok(())
        }

        async fn trailer(&mut self, _meta: Meta) -> Result<(), Status> {
            self.events.push(Event::Trailer);
            Ok(())
        }

        async fn error(&mut self, status: RpcStatus) -> Result<(), Status> {
            self.events.push(Event::Error(status.code));
            Ok(())
        }
    }

    fn request(chunks: &[&[u8]]) -> PipeRequest {
        let mut meta = Meta::new();
        meta_insert(&mut meta, ":path", "/api/v1/namespaces/");
        let body: Vec<Result<Bytes, Status>> =
            chunks.iter().map(|c| Ok(Bytes::copy_from_slice(c))).collect();
        PipeRequest {
            method: "/core/Proxy".into(),
            meta,
            extra: None,
            body: Box::pin(futures_util::stream::iter(body)),
        }
    }

    fn header_frame() -> InboundFrame {
        InboundFrame::Header(Meta::new())
    }

    #[tokio::test]
    async fn body_chunks_become_message_frames_then_close_send() {
        let tx = RecordingTx::default();
        let rx = ScriptedRx { frames: VecDeque::from([header_frame()]) };
        let mut sink = RecordingSink::default();
        let outcome = run_pipe(tx.clone(), rx, request(&[b"ab", b"c"]), &mut sink).await;
        assert!(outcome.for_tunnel.is_ok());
        assert!(outcome.for_caller.is_ok());
        assert_eq!(
            *tx.sent.lock(),
            vec![
                Sent::Info("/core/Proxy".into()),
                Sent::Data(b"ab".to_vec()),
                Sent::Data(b"c".to_vec()),
                Sent::Close,
            ]
        );
        assert_eq!(sink.events, vec![Event::Header]);
    }

    #[tokio::test]
    async fn trailer_is_delivered_after_late_messages() {
        let tx = RecordingTx::default();
        let rx = ScriptedRx {
            frames: VecDeque::from([
                header_frame(),
                InboundFrame::Message(b"a".to_vec()),
                InboundFrame::Trailer(Meta::new()),
                InboundFrame::Message(b"b".to_vec()),
            ]),
        };
        let mut sink = RecordingSink::default();
        let outcome = run_pipe(tx.clone(), rx, request(&[]), &mut sink).await;
        assert!(outcome.for_caller.is_ok());
        assert_eq!(
            sink.events,
            vec![
                Event::Header,
                Event::Message(b"a".to_vec()),
                Event::Message(b"b".to_vec()),
                Event::Trailer,
            ]
        );
    }

    #[tokio::test]
    async fn nothing_is_processed_after_an_error_frame() {
        let tx = RecordingTx::default();
        let rx = ScriptedRx {
            frames: VecDeque::from([
                header_frame(),
                InboundFrame::Error(RpcStatus { code: 14, message: "boom".into() }),
                InboundFrame::Message(b"late".to_vec()),
                InboundFrame::Trailer(Meta::new()),
            ]),
        };
        let mut sink = RecordingSink::default();
        let outcome = run_pipe(tx.clone(), rx, request(&[]), &mut sink).await;
        assert!(outcome.for_caller.is_ok());
        assert_eq!(sink.events, vec![Event::Header, Event::Error(14)]);
    }

    #[tokio::test]
    async fn message_before_header_is_a_protocol_error() {
        let tx = RecordingTx::default();
        let rx = ScriptedRx {
            frames: VecDeque::from([InboundFrame::Message(b"x".to_vec())]),
        };
        let mut sink = RecordingSink::default();
        let outcome = run_pipe(tx.clone(), rx, request(&[]), &mut sink).await;
        let tunnel_err = outcome.for_tunnel.unwrap_err();
        assert_eq!(tunnel_err.code(), tonic::Code::InvalidArgument);
        assert!(outcome.for_caller.is_err());
        assert!(sink.events.is_empty());
    }

    #[tokio::test]
    async fn duplicate_header_is_a_protocol_error() {
        let tx = RecordingTx::default();
        let rx = ScriptedRx {
            frames: VecDeque::from([header_frame(), header_frame()]),
        };
        let mut sink = RecordingSink::default();
        let outcome = run_pipe(tx.clone(), rx, request(&[]), &mut sink).await;
        assert_eq!(
            outcome.for_tunnel.unwrap_err().code(),
            tonic::Code::InvalidArgument
        );
    }

    #[tokio::test]
    async fn eof_before_header_fails_the_caller() {
        let tx = RecordingTx::default();
        let rx = ScriptedRx { frames: VecDeque::new() };
        let mut sink = RecordingSink::default();
        let outcome = run_pipe(tx.clone(), rx, request(&[]), &mut sink).await;
        assert_eq!(outcome.for_caller.unwrap_err().code(), tonic::Code::Internal);
    }
}
