//! Creating, finding, and removing services; quitting and shutdown.

use std::future::Future;
use std::panic::Location;
use std::rc::Rc;

use serde_json::Value;

use crate::config::ServiceConfig;
use crate::error::{Result, ServiceError};
use crate::protocol::{LocalBoxFuture, Reply};
use crate::types::{Address, SessionId};

use super::{ReplyFuture, ServiceContext, ShutdownHook};

impl ServiceContext {
    /// Ask the transport to create a service and wait for its address.
    ///
    /// # Errors
    ///
    /// - `Config` if the config is invalid
    /// - `SpawnFailed` if the transport answers with address 0
    #[track_caller]
    pub fn new_service(
        &self,
        config: ServiceConfig,
    ) -> impl Future<Output = Result<Address>> + 'static {
        let location = Location::caller();
        let kind = config.kind.clone();
        let encoded = config.validate().and_then(|()| config.to_json());
        let reply = match encoded {
            Ok(blob) => {
                let transport = self.state.transport.clone();
                self.begin_wait(location, None, move |session| {
                    transport.spawn_service(
                        &config.kind,
                        &blob,
                        config.unique,
                        config.worker_hint,
                        session,
                    )
                })
            }
            Err(err) => ReplyFuture::failed(err),
        };

        async move {
            let reply = reply.await?;
            match parse_address(&reply) {
                Some(address) if !address.is_none() => Ok(address),
                _ => Err(ServiceError::SpawnFailed(kind)),
            }
        }
    }

    /// Remove a service. With `wait`, suspends until the transport confirms
    /// and returns its answer.
    #[track_caller]
    pub fn remove_service(
        &self,
        address: Address,
        wait: bool,
    ) -> impl Future<Output = Result<Option<Reply>>> + 'static {
        let location = Location::caller();
        let pending = if wait {
            let transport = self.state.transport.clone();
            Ok(Some(self.begin_wait(location, None, move |session| {
                transport.kill(address, session)
            })))
        } else {
            self.ensure_alive()
                .and_then(|()| self.state.transport.kill(address, SessionId::NONE))
                .map(|()| None)
        };

        async move {
            match pending? {
                Some(reply) => Ok(Some(reply.await?)),
                None => Ok(None),
            }
        }
    }

    /// Address of a uniquely named service.
    pub fn query_service(&self, name: &str) -> Option<Address> {
        self.state
            .transport
            .query_service(name)
            .filter(|address| !address.is_none())
    }

    /// Describe the services hosted by `worker_id`.
    #[track_caller]
    pub fn scan_services(&self, worker_id: u32) -> ReplyFuture {
        let location = Location::caller();
        let transport = self.state.transport.clone();
        self.begin_wait(location, None, move |session| {
            transport.scan_services(worker_id, session)
        })
    }

    /// Stop this service.
    ///
    /// Every pending session and timer not owned by the running task is
    /// tombstoned and the tasks waiting on them are dropped without being
    /// resumed. Responses that arrive later are swallowed. The transport is
    /// then asked to remove the service.
    pub fn quit(&self) -> Result<()> {
        self.ensure_alive()?;
        let keep = self.current_task();

        let mut tasks = self.state.sessions.borrow_mut().discard_all_except(keep);
        let sleeping = self.state.timers.borrow_mut().discard_all_except(keep);
        for task in sleeping {
            if !tasks.contains(&task) {
                tasks.push(task);
            }
        }

        let closed = tasks
            .into_iter()
            .filter(|task| self.state.scheduler.close(*task))
            .count();
        tracing::debug!(service = %self.address(), closed, "service quitting");

        self.state.transport.kill(self.address(), SessionId::NONE)
    }

    /// Replace what happens when the service receives a shutdown message.
    ///
    /// By default the service quits. A hook that never calls
    /// [`quit`](Self::quit) leaves a service that shutdown cannot stop.
    pub fn on_shutdown<F, Fut>(&self, hook: F)
    where
        F: Fn(ServiceContext) -> Fut + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        let hook: ShutdownHook =
            Rc::new(move |ctx: ServiceContext| -> LocalBoxFuture<Result<()>> { Box::pin(hook(ctx)) });
        *self.state.shutdown_hook.borrow_mut() = Some(hook);
    }

    pub(crate) async fn handle_shutdown(&self) -> Result<()> {
        let hook = self.state.shutdown_hook.borrow().clone();
        match hook {
            Some(hook) => hook(self.clone()).await,
            None => self.quit(),
        }
    }
}

fn parse_address(reply: &Reply) -> Option<Address> {
    let raw = match reply {
        Reply::Values(values) => match values.first()? {
            Value::String(text) => text.trim().parse().ok()?,
            Value::Number(number) => u32::try_from(number.as_u64()?).ok()?,
            _ => return None,
        },
        Reply::Raw(message) => message.payload_text().trim().parse().ok()?,
    };
    Some(Address::new(raw))
}
