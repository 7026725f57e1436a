//! Self-healing broker link.
//!
//! A `Link` owns one session at a time. A watcher task waits for the broker
//! to close it, reconnects under the retry policy, re-declares the topology
//! and publishes the new session through a `watch` channel:
//!
//! ```text
//! Connecting ─► Ready ─► Disconnected ─► Connecting ─► Ready ...
//!                                            └─► Failed   (retries exhausted)
//! any ─► Closed                                           (shutdown / cancel)
//! ```

use std::fmt;
use std::sync::Arc;

use calendar_core::config::{BrokerConfig, ExchangeType};
use calendar_core::error::{CalendarError, Result};
use calendar_core::retry::RetryPolicy;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::transport::{BrokerConnector, BrokerSession};

/// What a link declares on every fresh session.
#[derive(Debug, Clone)]
pub struct Topology {
    pub exchange: String,
    pub exchange_type: ExchangeType,
    /// `(queue, binding_key)` for consuming links.
    pub queue: Option<(String, String)>,
    pub confirms: bool,
}

impl Topology {
    pub fn producer(config: &BrokerConfig) -> Self {
        Self {
            exchange: config.exchange.clone(),
            exchange_type: config.exchange_type,
            queue: None,
            confirms: config.reliable,
        }
    }

    pub fn consumer(config: &BrokerConfig) -> Self {
        Self {
            exchange: config.exchange.clone(),
            exchange_type: config.exchange_type,
            queue: Some((config.queue.clone(), config.binding_key.clone())),
            confirms: false,
        }
    }

    pub async fn declare(&self, session: &dyn BrokerSession) -> Result<()> {
        if self.confirms {
            session.enable_confirms().await?;
        }
        tracing::debug!(exchange = %self.exchange, kind = ?self.exchange_type, "declaring exchange");
        session.declare_exchange(&self.exchange, self.exchange_type).await?;

        if let Some((queue, binding_key)) = &self.queue {
            session.declare_queue(queue).await?;
            session.bind_queue(queue, &self.exchange, binding_key).await?;
            tracing::debug!(%queue, %binding_key, exchange = %self.exchange, "queue bound");
        }
        Ok(())
    }
}

/// A usable session. `generation` grows by one with every reconnect.
#[derive(Clone)]
pub struct LinkSession {
    pub generation: u64,
    pub session: Arc<dyn BrokerSession>,
}

impl fmt::Debug for LinkSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkSession")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Ready(LinkSession),
    Failed(String),
    Closed,
}

impl LinkState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Ready(_) => "ready",
            Self::Failed(_) => "failed",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Debug for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(ready) => write!(f, "Ready(generation {})", ready.generation),
            Self::Failed(reason) => write!(f, "Failed({reason})"),
            other => f.write_str(other.name()),
        }
    }
}

struct Supervisor {
    name: &'static str,
    connector: Arc<dyn BrokerConnector>,
    uri: String,
    topology: Topology,
    policy: RetryPolicy,
    cancel: CancellationToken,
    state: watch::Sender<LinkState>,
}

impl Supervisor {
    fn set(&self, state: LinkState) {
        tracing::debug!(link = self.name, state = state.name(), "link state changed");
        self.state.send_replace(state);
    }

    async fn establish(&self) -> Result<Arc<dyn BrokerSession>> {
        let what = format!("connect {} link to broker", self.name);
        self.policy
            .run(&what, &self.cancel, |_| async move {
                let session = self.connector.connect(&self.uri).await?;
                if let Err(e) = self.topology.declare(session.as_ref()).await {
                    if let Err(close) = session.close().await {
                        tracing::debug!(error = %close, "closing half-initialized session failed");
                    }
                    return Err(e);
                }
                Ok(session)
            })
            .await
    }

    /// Runs until cancelled or reconnection fails. Returns the session that
    /// was current at exit, if any, so shutdown can close it.
    async fn supervise(self: Arc<Self>, mut current: LinkSession) -> Option<Arc<dyn BrokerSession>> {
        loop {
            let reason = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                reason = current.session.closed() => reason,
            };
            if self.cancel.is_cancelled() {
                break;
            }

            tracing::warn!(link = self.name, %reason, "broker connection lost");
            self.set(LinkState::Disconnected);
            self.set(LinkState::Connecting);

            match self.establish().await {
                Ok(session) => {
                    current = LinkSession { generation: current.generation + 1, session };
                    tracing::info!(link = self.name, generation = current.generation, "reconnected to broker");
                    self.set(LinkState::Ready(current.clone()));
                }
                Err(CalendarError::Cancelled) => {
                    self.set(LinkState::Closed);
                    return None;
                }
                Err(e) => {
                    tracing::error!(link = self.name, error = %e, "giving up on broker connection");
                    let reason = match e {
                        CalendarError::ConnectionExhausted { reason, .. } => reason,
                        other => other.to_string(),
                    };
                    self.set(LinkState::Failed(reason));
                    return None;
                }
            }
        }

        self.set(LinkState::Closed);
        Some(current.session)
    }
}

pub struct Link {
    name: &'static str,
    policy: RetryPolicy,
    state: watch::Receiver<LinkState>,
    supervisor: Arc<Supervisor>,
    watcher: Mutex<Option<JoinHandle<Option<Arc<dyn BrokerSession>>>>>,
}

impl Link {
    /// Connect, declare `topology` and start the reconnect watcher.
    ///
    /// Fails with `ConnectionExhausted` when the first connection cannot be
    /// made within the retry policy, or `Cancelled` if `cancel` fires first.
    pub async fn open(
        name: &'static str,
        connector: Arc<dyn BrokerConnector>,
        uri: impl Into<String>,
        topology: Topology,
        policy: RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let (tx, rx) = watch::channel(LinkState::Connecting);
        let supervisor = Arc::new(Supervisor {
            name,
            connector,
            uri: uri.into(),
            topology,
            policy,
            cancel: cancel.child_token(),
            state: tx,
        });

        let session = supervisor.establish().await?;
        let ready = LinkSession { generation: 1, session };
        supervisor.set(LinkState::Ready(ready.clone()));
        tracing::info!(link = name, "broker link ready");

        let watcher = tokio::spawn(supervisor.clone().supervise(ready));
        Ok(Self { name, policy, state: rx, supervisor, watcher: Mutex::new(Some(watcher)) })
    }

    pub fn state(&self) -> LinkState {
        self.state.borrow().clone()
    }

    /// Wait for any ready session.
    pub async fn ready(&self) -> Result<LinkSession> {
        self.ready_after(0).await
    }

    /// Wait for a ready session newer than `generation`, or for the link to
    /// fail or close.
    pub async fn ready_after(&self, generation: u64) -> Result<LinkSession> {
        let mut state = self.state.clone();
        let settled = state
            .wait_for(|s| match s {
                LinkState::Ready(ready) => ready.generation > generation,
                LinkState::Failed(_) | LinkState::Closed => true,
                LinkState::Disconnected | LinkState::Connecting => false,
            })
            .await
            .map_err(|_| CalendarError::Closed)?;

        match &*settled {
            LinkState::Ready(ready) => Ok(ready.clone()),
            LinkState::Failed(reason) => Err(CalendarError::ConnectionExhausted {
                attempts: self.policy.max_attempts,
                reason: reason.clone(),
            }),
            _ => Err(CalendarError::Closed),
        }
    }

    /// Stop the watcher and close the current session. Safe to call twice.
    pub async fn shutdown(&self) -> Result<()> {
        self.supervisor.cancel.cancel();
        let Some(watcher) = self.watcher.lock().await.take() else {
            return Ok(());
        };

        let mut errors = Vec::new();
        let session = match watcher.await {
            Ok(session) => session,
            Err(e) => {
                errors.push(format!("{} link watcher failed: {e}", self.name));
                None
            }
        };
        if let Some(session) = session {
            match session.close().await {
                Ok(()) => {}
                Err(CalendarError::Shutdown(list)) => errors.extend(list),
                Err(e) => errors.push(e.to_string()),
            }
        }
        self.supervisor.set(LinkState::Closed);

        if errors.is_empty() {
            tracing::info!(link = self.name, "broker link closed");
            Ok(())
        } else {
            Err(CalendarError::Shutdown(errors))
        }
    }
}
