//! Gateway assembly.
//!
//! Builds every component against one broker adapter, owns the worker
//! set, and exposes the producer-facing `submit` surface plus the
//! emergency control surface.

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::pipeline::PipelineWorker;
use exg_audit::AuditLog;
use exg_broker::{Broker, BrokerPool};
use exg_core::{Profile, ProfileId, Signal, Symbol};
use exg_emergency::{EmergencyCell, EmergencyController};
use exg_executor::Executor;
use exg_gate::{GateResult, SignalGate, SubmitOutcome};
use exg_risk::RiskSizer;
use exg_store::StateStore;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// The assembled signal execution gateway.
pub struct Gateway {
    config: AppConfig,
    store: Arc<StateStore>,
    audit: Arc<AuditLog>,
    pool: Arc<BrokerPool>,
    gate: Arc<SignalGate>,
    sizer: Arc<RiskSizer>,
    executor: Arc<Executor>,
    emergency: Arc<EmergencyController>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    /// Assemble the gateway against a broker adapter.
    pub fn new(config: AppConfig, broker: Arc<dyn Broker>) -> AppResult<Self> {
        config.gateway.validate()?;

        let store = Arc::new(StateStore::new());
        let audit = match &config.persistence.audit_path {
            Some(path) => Arc::new(AuditLog::with_sink(path)?),
            None => Arc::new(AuditLog::in_memory()),
        };
        let pool = Arc::new(BrokerPool::new(
            broker,
            Arc::clone(&store),
            Arc::clone(&audit),
            &config.gateway,
        ));
        let cell = Arc::new(EmergencyCell::new());
        let emergency = Arc::new(EmergencyController::new(
            Arc::clone(&cell),
            Arc::clone(&pool),
            Arc::clone(&store),
            Arc::clone(&audit),
            &config.gateway,
        ));
        let allowed_symbols: HashSet<Symbol> =
            config.symbols.iter().map(|s| Symbol::new(s.clone())).collect();
        let gate = Arc::new(SignalGate::new(
            config.gateway.clone(),
            allowed_symbols,
            Arc::clone(&audit),
            Arc::clone(&store),
            cell,
        ));
        let sizer = Arc::new(RiskSizer::new(config.gateway.clone()));
        let executor = Arc::new(Executor::new(
            Arc::clone(&pool),
            Arc::clone(&audit),
            Arc::clone(&store),
            &config.gateway,
        ));

        Ok(Self {
            config,
            store,
            audit,
            pool,
            gate,
            sizer,
            executor,
            emergency,
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Register a profile: broker session, session monitor, pipeline
    /// worker, and tick pumps for the configured symbols.
    pub async fn add_profile(&self, profile: Profile, initial_equity: Decimal) -> AppResult<()> {
        let profile_id = profile.id;
        self.store.upsert_profile(profile.clone(), initial_equity);
        self.pool.register_profile(profile).await?;

        let mut workers = self.workers.lock();
        workers.push(
            self.pool
                .spawn_monitor(profile_id, self.shutdown.child_token()),
        );

        let rx = self.gate.register_worker(profile_id);
        let worker = PipelineWorker::new(
            Arc::clone(&self.sizer),
            Arc::clone(&self.executor),
            Arc::clone(&self.audit),
            Arc::clone(&self.store),
            Arc::clone(&self.emergency),
            &self.config.gateway,
        );
        workers.push(worker.spawn(rx, self.shutdown.child_token()));
        drop(workers);

        for symbol_name in &self.config.symbols {
            self.spawn_tick_pump(profile_id, Symbol::new(symbol_name.clone()))
                .await?;
        }

        info!(profile = %profile_id, "profile added to gateway");
        Ok(())
    }

    /// Feed broker ticks into the state store and the emergency monitor.
    async fn spawn_tick_pump(&self, profile_id: ProfileId, symbol: Symbol) -> AppResult<()> {
        let mut ticks = self
            .pool
            .broker()
            .subscribe_ticks(profile_id, &symbol)
            .await
            .map_err(AppError::Broker)?;
        let store = Arc::clone(&self.store);
        let emergency = Arc::clone(&self.emergency);
        let shutdown = self.shutdown.child_token();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    tick = ticks.recv() => {
                        let Some(tick) = tick else { break };
                        let mid = tick.mid();
                        store.record_mark(profile_id, &tick.symbol, mid);
                        let now_ms = tick.at.timestamp_millis();
                        if let Err(e) = emergency
                            .on_tick(&tick.symbol, mid, tick.spread(), now_ms)
                            .await
                        {
                            error!(?e, symbol = %tick.symbol, "emergency tick handling failed");
                        }
                    }
                }
            }
        });
        self.workers.lock().push(handle);
        Ok(())
    }

    /// Producer ingress: one signal in, one decision out.
    pub async fn submit(&self, signal: Signal) -> GateResult<SubmitOutcome> {
        self.gate.submit(signal).await
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn pool(&self) -> &Arc<BrokerPool> {
        &self.pool
    }

    pub fn emergency(&self) -> &Arc<EmergencyController> {
        &self.emergency
    }

    pub fn gate(&self) -> &Arc<SignalGate> {
        &self.gate
    }

    /// Stop every worker and wait for them to finish.
    pub async fn shutdown(&self) {
        info!("gateway shutting down");
        self.shutdown.cancel();
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.await;
        }
    }
}
