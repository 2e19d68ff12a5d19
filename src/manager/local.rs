//! In-process session manager
//!
//! Every assigned shard runs as its own task next to a dispatcher task that
//! feeds its events to the handler registry. A supervisor task joins the
//! shard tasks, reports how each one ended and restarts failed shards when
//! the policy allows it.

use super::assign::{AllShards, ShardAssigner};
use super::{ApInfo, SessionManager};
use crate::config::SessionPolicy;
use crate::error::GatewayError;
use crate::events::handler::run_dispatch;
use crate::events::{EventCategory, EventHandler, HandlerRegistry, ShardExit};
use crate::intents::Intents;
use crate::limiter::IdentifyLimiter;
use crate::metrics::GatewayMetrics;
use crate::rest::{GatewayInfoSource, GatewayResolver};
use crate::shard::{Connector, ShardConnection, ShardContext, ShardSpec, ShardState, WsConnector};
use crate::token::TokenSource;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, warn};

struct Running {
    cancel: CancellationToken,
    supervisor: JoinHandle<()>,
}

/// Default single-process `SessionManager`
pub struct LocalSessionManager {
    resolver: GatewayResolver,
    connector: Arc<dyn Connector>,
    assigner: Arc<dyn ShardAssigner>,
    policy: SessionPolicy,
    metrics: GatewayMetrics,
    registry: HandlerRegistry,
    state: ShardState,
    running: Mutex<Option<Running>>,
}

impl LocalSessionManager {
    pub fn new(info_source: Arc<dyn GatewayInfoSource>) -> Self {
        Self {
            resolver: GatewayResolver::new(info_source),
            connector: Arc::new(WsConnector),
            assigner: Arc::new(AllShards),
            policy: SessionPolicy::default(),
            metrics: GatewayMetrics::disabled(),
            registry: HandlerRegistry::new(),
            state: ShardState::new(),
            running: Mutex::new(None),
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_assigner(mut self, assigner: Arc<dyn ShardAssigner>) -> Self {
        self.assigner = assigner;
        self
    }

    pub fn with_policy(mut self, policy: SessionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_metrics(mut self, metrics: GatewayMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Shared status tracker (for health checks)
    pub fn shard_state(&self) -> ShardState {
        self.state.clone()
    }

    /// True while any shard of the current start is still running
    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|running| !running.supervisor.is_finished())
    }
}

#[async_trait]
impl SessionManager for LocalSessionManager {
    async fn start(
        &self,
        ap_info: ApInfo,
        token: Arc<dyn TokenSource>,
        intents: Intents,
    ) -> Result<(), GatewayError> {
        let mut running = self.running.lock().await;
        if running
            .as_ref()
            .is_some_and(|running| !running.supervisor.is_finished())
        {
            return Err(GatewayError::AlreadyStarted);
        }

        if intents.is_empty() {
            return Err(GatewayError::Config("intents must not be empty".to_string()));
        }

        let current = token.token().await?;
        let info = self.resolver.resolve(&current).await?;

        let total_shards = ap_info.shards.unwrap_or(info.shards);
        if total_shards == 0 {
            return Err(GatewayError::Config("shard count must be at least 1".to_string()));
        }

        let shard_ids = self.assigner.assign(total_shards);
        if shard_ids.is_empty() {
            return Err(GatewayError::Config(format!(
                "no shards assigned to this process out of {total_shards}"
            )));
        }

        self.state.reset(total_shards, shard_ids.iter().copied());
        self.metrics.set_shards_ready(0);

        let ctx = ShardContext {
            endpoint: ap_info.url.unwrap_or(info.url),
            token,
            intents,
            limiter: Arc::new(IdentifyLimiter::new(
                info.session_start_limit,
                self.policy.identify_window,
            )),
            connector: Arc::clone(&self.connector),
            policy: self.policy.clone(),
            state: self.state.clone(),
            metrics: self.metrics.clone(),
        };

        info!(
            total_shards,
            shard_count = shard_ids.len(),
            max_concurrency = info.session_start_limit.max_concurrency,
            endpoint = %ctx.endpoint,
            "Starting shards"
        );

        let cancel = CancellationToken::new();
        let mut shards = JoinSet::new();
        for shard_id in shard_ids {
            spawn_shard(
                &mut shards,
                ShardSpec::new(shard_id, total_shards),
                ctx.clone(),
                self.registry.clone(),
                cancel.clone(),
            );
        }

        let supervisor = tokio::spawn(supervise(
            shards,
            ctx,
            self.registry.clone(),
            cancel.clone(),
        ));

        *running = Some(Running { cancel, supervisor });
        Ok(())
    }

    fn register_handler(&self, category: EventCategory, handler: Arc<dyn EventHandler>) {
        debug!(category = category.as_str(), "Registering event handler");
        self.registry.register(category, handler);
    }

    async fn stop(&self) -> Result<(), GatewayError> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };

        info!("Stopping shards");
        running.cancel.cancel();

        let mut supervisor = running.supervisor;
        match timeout(self.policy.shutdown_timeout, &mut supervisor).await {
            Ok(Ok(())) => {
                info!(
                    closed = self.state.closed_shards(),
                    "All shards stopped"
                );
                Ok(())
            }
            Ok(Err(e)) => {
                error!(error = %e, "Shard supervisor ended abnormally");
                Ok(())
            }
            Err(_) => {
                // Dropping the supervisor's JoinSet aborts the shard tasks
                supervisor.abort();
                error!(
                    timeout_secs = self.policy.shutdown_timeout.as_secs(),
                    "Shards did not stop in time, aborted"
                );
                Err(GatewayError::ShutdownTimeout {
                    timeout: self.policy.shutdown_timeout,
                })
            }
        }
    }
}

fn spawn_shard(
    shards: &mut JoinSet<(ShardSpec, ShardExit)>,
    spec: ShardSpec,
    ctx: ShardContext,
    registry: HandlerRegistry,
    cancel: CancellationToken,
) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let dispatcher = AbortOnDropHandle::new(tokio::spawn(run_dispatch(
        spec.shard_id,
        events_rx,
        registry,
        ctx.metrics.clone(),
    )));
    let connection = ShardConnection::new(spec, ctx, events_tx);

    shards.spawn(async move {
        let exit = connection.run(cancel).await;
        // The shard counts as finished once its handlers saw everything
        if let Err(e) = dispatcher.await {
            warn!(shard_id = spec.shard_id, error = %e, "Shard dispatcher ended abnormally");
        }
        (spec, exit)
    });
}

async fn supervise(
    mut shards: JoinSet<(ShardSpec, ShardExit)>,
    ctx: ShardContext,
    registry: HandlerRegistry,
    cancel: CancellationToken,
) {
    let max_restarts = ctx.policy.max_shard_restarts;
    let mut restarts: HashMap<u32, u32> = HashMap::new();

    while let Some(joined) = shards.join_next().await {
        ctx.metrics.set_shards_ready(ctx.state.ready_shards());

        let (spec, exit) = match joined {
            Ok(done) => done,
            Err(e) => {
                error!(error = %e, "Shard task panicked");
                continue;
            }
        };
        let shard_id = spec.shard_id;

        match &exit {
            ShardExit::Stopped => {
                debug!(shard_id, "Shard stopped");
            }
            ShardExit::FatalAuth { code, reason } => {
                error!(shard_id, code, reason = %reason, "Shard closed: authentication rejected");
            }
            ShardExit::Failed { attempts, reason } => {
                let used = restarts.entry(shard_id).or_insert(0);
                if !cancel.is_cancelled() && *used < max_restarts {
                    *used += 1;
                    warn!(
                        shard_id,
                        attempts,
                        restart = *used,
                        max_restarts,
                        "Restarting failed shard"
                    );
                    ctx.state.set_exit(shard_id, None);
                    spawn_shard(&mut shards, spec, ctx.clone(), registry.clone(), cancel.clone());
                    continue;
                }
                error!(shard_id, attempts, reason = %reason, "Shard failed permanently");
            }
        }
    }

    info!(
        closed = ctx.state.closed_shards(),
        "All shard tasks finished"
    );
}
