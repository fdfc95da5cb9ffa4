//! Error-chain rendering shared by every crate in the workspace.

use std::error::Error;

/// Render an error and its source chain as `outer: inner: ...`.
///
/// This is the textual form a failed command presents at the client call
/// site; the chain is all that survives a wire crossing.
pub fn error_chain(err: &(dyn Error + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        text.push_str(": ");
        text.push_str(&inner.to_string());
        source = inner.source();
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("outer failure")]
    struct Outer {
        #[source]
        cause: Inner,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("inner failure")]
    struct Inner;

    #[test]
    fn chain_renders_outer_then_inner() {
        let err = Outer { cause: Inner };
        assert_eq!(error_chain(&err), "outer failure: inner failure");
    }

    #[test]
    fn chain_without_source_is_just_the_message() {
        assert_eq!(error_chain(&Inner), "inner failure");
    }
}
