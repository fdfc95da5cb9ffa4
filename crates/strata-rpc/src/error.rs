//! Client-visible RPC failures.
//!
//! Everything here is `Clone`: a connection loss fails every outstanding
//! call with the same reason, so the error fans out.

use strata_core::wire::CommandId;

fn join_errors(errors: &[RpcError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors surfaced at a client call site.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    /// The provider's fingerprint does not start with the client's.
    #[error(
        "handshake failed: clients must support a prefix of the commands \
         that the dispatcher of the provider provides"
    )]
    HandshakeFailed,

    /// The handler raised an error; only its rendered message survives the
    /// wire.
    #[error("handler error: {0}")]
    Handler(String),

    /// The call's completion was failed: the connection died or the client
    /// handle was dropped while the call was outstanding.
    #[error("completion failure: {0}")]
    CompletionFailure(String),

    /// The provider does not know the command id. Fatal for the connection.
    #[error("unknown command id {0}")]
    UnknownCommand(CommandId),

    /// The response payload did not decode.
    #[error("response decode failed: {0}")]
    Decode(String),

    /// Transport-level failure, rendered from the underlying I/O error.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Aggregated failures of a multi-client fan-out.
    #[error("multi-client errors: [{}]", join_errors(.0))]
    Errors(Vec<RpcError>),
}

impl RpcError {
    pub fn connection(err: &std::io::Error) -> RpcError {
        RpcError::Connection(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_variant_lists_each_failure() {
        let err = RpcError::Errors(vec![
            RpcError::Handler("OutOfQuota".into()),
            RpcError::CompletionFailure("connection reset".into()),
        ]);
        let text = err.to_string();
        assert!(text.contains("OutOfQuota"));
        assert!(text.contains("connection reset"));
    }
}
