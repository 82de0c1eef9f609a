//! ReplyFuture: the caller side of a session-correlated call.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::error::{Result, ServiceError};
use crate::protocol::Reply;
use crate::task::Suspend;
use crate::types::SessionId;

/// Future returned by [`ServiceContext::call`](crate::ServiceContext::call)
/// and the other session waits.
///
/// The request is already on its way when this future is created. Awaiting
/// it parks the current task until the router delivers the response, an
/// error message, or the watcher's death.
///
/// Errors raised while setting up the call (unknown protocol, no current
/// task) are reported on the first poll.
pub struct ReplyFuture {
    state: ReplyState,
}

enum ReplyState {
    Waiting {
        suspend: Suspend,
        session: Option<SessionId>,
    },
    Failed(Option<ServiceError>),
}

impl ReplyFuture {
    pub(crate) fn waiting(suspend: Suspend, session: Option<SessionId>) -> Self {
        Self {
            state: ReplyState::Waiting { suspend, session },
        }
    }

    pub(crate) fn failed(error: ServiceError) -> Self {
        Self {
            state: ReplyState::Failed(Some(error)),
        }
    }

    /// Session the reply is correlated with, `None` for timer waits and
    /// calls that failed to start.
    pub fn session(&self) -> Option<SessionId> {
        match &self.state {
            ReplyState::Waiting { session, .. } => *session,
            ReplyState::Failed(_) => None,
        }
    }
}

impl Future for ReplyFuture {
    type Output = Result<Reply>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            ReplyState::Waiting { suspend, .. } => {
                Pin::new(suspend).poll(cx).map(|resumed| resumed.into_result())
            }
            ReplyState::Failed(error) => match error.take() {
                Some(error) => Poll::Ready(Err(error)),
                None => Poll::Pending,
            },
        }
    }
}
