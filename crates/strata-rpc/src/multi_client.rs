//! Fan one logical call over several child clients.

use futures::future::join_all;

use crate::client::Client;
use crate::command::{Command, CommandSet, Member};
use crate::error::RpcError;
use crate::policy::AccessPolicy;

/// How many child calls may be in flight at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParallelCallsLimit {
    Unlimited,
    AtMost(usize),
}

impl ParallelCallsLimit {
    /// A positive cap on parallel calls.
    pub fn at_most(limit: usize) -> Result<ParallelCallsLimit, ParallelCallsError> {
        if limit == 0 {
            return Err(ParallelCallsError::MustBePositive);
        }
        Ok(ParallelCallsLimit::AtMost(limit))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParallelCallsError {
    #[error("parallel calls limit must be positive")]
    MustBePositive,
}

/// A client fanning each call over all of its children.
///
/// A call succeeds when every child succeeds; otherwise the per-child
/// failures are collected into [`RpcError::Errors`] after the whole fan-out
/// concludes.
pub struct MultiClient<S: CommandSet, P: AccessPolicy> {
    children: Vec<Client<S, P>>,
    limit: ParallelCallsLimit,
}

impl<S: CommandSet, P: AccessPolicy> MultiClient<S, P> {
    pub fn new(children: Vec<Client<S, P>>, limit: ParallelCallsLimit) -> Self {
        Self { children, limit }
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Send the same command to every child.
    pub async fn call_all<C>(&self, command: C) -> Result<Vec<C::Response>, RpcError>
    where
        C: Command + Clone,
        S: Member<C>,
    {
        let commands = vec![command; self.children.len()];
        self.call_each(commands).await
    }

    /// Send one command per child, in child order.
    pub async fn call_each<C>(&self, commands: Vec<C>) -> Result<Vec<C::Response>, RpcError>
    where
        C: Command,
        S: Member<C>,
    {
        assert_eq!(
            commands.len(),
            self.children.len(),
            "one command per child client"
        );

        let mut outcomes: Vec<Result<C::Response, RpcError>> =
            Vec::with_capacity(self.children.len());
        let batch = match self.limit {
            ParallelCallsLimit::Unlimited => self.children.len().max(1),
            ParallelCallsLimit::AtMost(limit) => limit,
        };

        let mut pairs: Vec<(&Client<S, P>, C)> =
            self.children.iter().zip(commands).collect();
        while !pairs.is_empty() {
            let window: Vec<(&Client<S, P>, C)> =
                pairs.drain(..batch.min(pairs.len())).collect();
            let calls = window
                .into_iter()
                .map(|(child, command)| child.call(command));
            outcomes.extend(join_all(calls).await);
        }

        let mut responses = Vec::with_capacity(outcomes.len());
        let mut errors = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(response) => responses.push(response),
                Err(error) => errors.push(error),
            }
        }
        if !errors.is_empty() {
            return Err(RpcError::Errors(errors));
        }
        Ok(responses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_most_zero_is_rejected() {
        assert_eq!(
            ParallelCallsLimit::at_most(0).unwrap_err(),
            ParallelCallsError::MustBePositive
        );
        assert_eq!(
            ParallelCallsLimit::at_most(3).unwrap(),
            ParallelCallsLimit::AtMost(3)
        );
    }
}
