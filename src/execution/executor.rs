use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

use crate::engine::EngineEvent;
use crate::models::{OrderSide, Variant};

/// Market order handed to the execution gateway
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderRequest {
    pub id: Uuid,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub variant: Variant,
    pub position_id: Uuid,
    /// Book price the decision was made at
    pub reference_price: Decimal,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum GatewayError {
    #[error("Order rejected by exchange: {0}")]
    Rejected(String),

    #[error("Order submission timed out after {0}ms")]
    Timeout(u64),

    #[error("Transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Accepted { order_id: String },
    Rejected { error: String },
}

/// Result of one order submission
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionReport {
    pub request: OrderRequest,
    pub outcome: ExecutionOutcome,
    pub completed_at: DateTime<Utc>,
}

impl ExecutionReport {
    pub fn order_id(&self) -> Option<&str> {
        match &self.outcome {
            ExecutionOutcome::Accepted { order_id } => Some(order_id),
            ExecutionOutcome::Rejected { .. } => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, ExecutionOutcome::Rejected { .. })
    }
}

/// Boundary to whatever actually places orders
#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    /// Submit a market order, returning the exchange order id
    async fn submit(&self, request: &OrderRequest) -> Result<String, GatewayError>;

    fn name(&self) -> &str;
}

/// Accepts every order with a sequential `paper-N` id
#[derive(Debug, Default)]
pub struct PaperGateway {
    next_id: AtomicU64,
}

impl PaperGateway {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionGateway for PaperGateway {
    async fn submit(&self, request: &OrderRequest) -> Result<String, GatewayError> {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let order_id = format!("paper-{}", n);

        tracing::info!(
            order_id = %order_id,
            symbol = %request.symbol,
            side = %request.side,
            quantity = %request.quantity,
            price = %request.reference_price,
            variant = %request.variant,
            "Paper order filled"
        );

        Ok(order_id)
    }

    fn name(&self) -> &str {
        "paper"
    }
}

#[derive(Default)]
struct LogEntries {
    by_id: HashMap<Uuid, ExecutionReport>,
    order: VecDeque<Uuid>,
}

/// Thread-safe record of the newest `capacity` execution reports
#[derive(Clone)]
pub struct ExecutionLog {
    entries: Arc<RwLock<LogEntries>>,
    capacity: usize,
}

impl ExecutionLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(LogEntries::default())),
            capacity,
        }
    }

    pub fn record(&self, report: ExecutionReport) -> Result<(), String> {
        let mut entries = self.entries.write().map_err(|e| e.to_string())?;
        let id = report.request.id;
        if entries.by_id.insert(id, report).is_none() {
            entries.order.push_back(id);
        }
        while entries.order.len() > self.capacity {
            if let Some(evicted) = entries.order.pop_front() {
                entries.by_id.remove(&evicted);
            }
        }
        Ok(())
    }

    pub fn get(&self, request_id: Uuid) -> Result<Option<ExecutionReport>, String> {
        let entries = self.entries.read().map_err(|e| e.to_string())?;
        Ok(entries.by_id.get(&request_id).cloned())
    }

    /// Failed submissions still in the log, oldest first
    pub fn failures(&self) -> Result<Vec<ExecutionReport>, String> {
        let entries = self.entries.read().map_err(|e| e.to_string())?;
        Ok(entries
            .order
            .iter()
            .filter_map(|id| entries.by_id.get(id))
            .filter(|r| r.is_failure())
            .cloned()
            .collect())
    }
}

/// Submits orders off the pipeline path
///
/// Each request runs in its own task. Failures are recorded and broadcast;
/// the book state that produced the order is never rolled back.
#[derive(Clone)]
pub struct ExecutionDispatcher {
    gateway: Arc<dyn ExecutionGateway>,
    log: ExecutionLog,
    events: broadcast::Sender<EngineEvent>,
    submit_timeout: Duration,
}

impl ExecutionDispatcher {
    pub fn new(
        gateway: Arc<dyn ExecutionGateway>,
        events: broadcast::Sender<EngineEvent>,
        submit_timeout: Duration,
        history: usize,
    ) -> Self {
        Self {
            gateway,
            log: ExecutionLog::new(history),
            events,
            submit_timeout,
        }
    }

    pub fn log(&self) -> &ExecutionLog {
        &self.log
    }

    /// Fire-and-continue submission
    pub fn dispatch(&self, request: OrderRequest) -> JoinHandle<()> {
        self.dispatch_then(request, |_| {})
    }

    /// Like [`dispatch`](Self::dispatch), running `on_report` once the
    /// report is logged and before it is broadcast
    pub fn dispatch_then<F>(&self, request: OrderRequest, on_report: F) -> JoinHandle<()>
    where
        F: FnOnce(&ExecutionReport) + Send + 'static,
    {
        let gateway = self.gateway.clone();
        let log = self.log.clone();
        let events = self.events.clone();
        let submit_timeout = self.submit_timeout;

        tokio::spawn(async move {
            let result = match timeout(submit_timeout, gateway.submit(&request)).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::Timeout(submit_timeout.as_millis() as u64)),
            };

            let outcome = match result {
                Ok(order_id) => ExecutionOutcome::Accepted { order_id },
                Err(e) => {
                    tracing::error!(
                        gateway = gateway.name(),
                        request_id = %request.id,
                        symbol = %request.symbol,
                        side = %request.side,
                        variant = %request.variant,
                        error = %e,
                        "Order submission failed; book position kept"
                    );
                    ExecutionOutcome::Rejected {
                        error: e.to_string(),
                    }
                }
            };

            let report = ExecutionReport {
                request,
                outcome,
                completed_at: Utc::now(),
            };

            if let Err(e) = log.record(report.clone()) {
                tracing::error!("Failed to record execution report: {}", e);
            }
            on_report(&report);

            let event = if report.is_failure() {
                EngineEvent::ExecutionFailed(report)
            } else {
                EngineEvent::ExecutionCompleted(report)
            };
            // No subscribers is fine
            let _ = events.send(event);
        })
    }
}
