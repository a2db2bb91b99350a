/// gRPC status pair carried in terminal `Error` frames.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RpcStatus {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
}

fn code_from_i32(v: i32) -> tonic::Code {
    match v {
        0 => tonic::Code::Ok,
        1 => tonic::Code::Cancelled,
        2 => tonic::Code::Unknown,
        3 => tonic::Code::InvalidArgument,
        4 => tonic::Code::DeadlineExceeded,
        5 => tonic::Code::NotFound,
        6 => tonic::Code::AlreadyExists,
        7 => tonic::Code::PermissionDenied,
        8 => tonic::Code::ResourceExhausted,
        9 => tonic::Code::FailedPrecondition,
        10 => tonic::Code::Aborted,
        11 => tonic::Code::OutOfRange,
        12 => tonic::Code::Unimplemented,
        13 => tonic::Code::Internal,
        14 => tonic::Code::Unavailable,
        15 => tonic::Code::DataLoss,
        16 => tonic::Code::Unauthenticated,
        _ => tonic::Code::Unknown,
    }
}

impl RpcStatus {
    pub fn from_status(status: &tonic::Status) -> Self {
        Self {
            code: status.code() as i32,
            message: status.message().to_string(),
        }
    }

    pub fn to_status(&self) -> tonic::Status {
        tonic::Status::new(code_from_i32(self.code), self.message.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_code_and_message() {
        let s = tonic::Status::deadline_exceeded("took too long");
        let rpc = RpcStatus::from_status(&s);
        let back = rpc.to_status();
        assert_eq!(back.code(), tonic::Code::DeadlineExceeded);
        assert_eq!(back.message(), "took too long");
    }

    #[test]
    fn unknown_code_maps_to_unknown() {
        let rpc = RpcStatus { code: 99, message: String::new() };
        assert_eq!(rpc.to_status().code(), tonic::Code::Unknown);
    }
}
