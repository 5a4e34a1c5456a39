//! Composition root: wires a live session to the host state tree.
//!
//! One `Adapter` instance owns all per-adapter mutable state (vin set,
//! projector, tracker, dispatcher); there are no ambient globals. Events are
//! pumped on a single task, so handlers never overlap.

use std::sync::Arc;

use carlink_proto::PushEvent;
use carlink_session::{Session, SessionEvent};

use crate::commands::CommandDispatcher;
use crate::history::{FuelPriceSource, HistoryConfig, HistoryTracker};
use crate::projector::StateProjector;
use crate::tree::StateTree;

/// Host-supplied configuration for one adapter instance.
#[derive(Default)]
pub struct AdapterConfig {
    pub history: HistoryConfig,
    /// Security pin attached to protected commands.
    pub pin: Option<String>,
    /// Optional unit-price lookup for fuel episodes.
    pub fuel_price: Option<Arc<dyn FuelPriceSource>>,
}

pub struct Adapter {
    tree: Arc<dyn StateTree>,
    session: Session,
    projector: StateProjector,
    history: HistoryTracker,
    dispatcher: CommandDispatcher,
    vins: Vec<String>,
}

impl Adapter {
    pub fn new(tree: Arc<dyn StateTree>, session: Session, config: AdapterConfig) -> Self {
        let dispatcher = CommandDispatcher::new(tree.clone(), session.sender(), config.pin);
        let mut history = HistoryTracker::new(tree.clone(), config.history);
        if let Some(source) = config.fuel_price {
            history = history.with_fuel_price(source);
        }
        Self {
            tree: tree.clone(),
            session,
            projector: StateProjector::new(tree),
            history,
            dispatcher,
            vins: Vec::new(),
        }
    }

    /// Clone of the command dispatcher, for routing host write intents while
    /// [`run`](Adapter::run) owns the adapter.
    pub fn dispatcher(&self) -> CommandDispatcher {
        self.dispatcher.clone()
    }

    pub fn vins(&self) -> &[String] {
        &self.vins
    }

    /// Pump session events until the session ends. Per-event failures are
    /// logged and skipped; only terminal authentication loss stops the pump.
    pub async fn run(mut self) {
        while let Some(event) = self.session.next().await {
            match event {
                SessionEvent::Connected => {
                    self.set_connected(true).await;
                }
                SessionEvent::Disconnected { reason } => {
                    tracing::info!(?reason, "push connection lost");
                    self.set_connected(false).await;
                }
                SessionEvent::AuthExpired => {
                    tracing::error!("authentication expired; re-login required");
                    self.set_connected(false).await;
                    break;
                }
                SessionEvent::Push(event) => self.handle_push(event).await,
            }
        }
        tracing::info!("session ended, adapter stopped");
    }

    async fn handle_push(&mut self, event: PushEvent) {
        match event {
            PushEvent::Telemetry(batch) => {
                // The acknowledgment went out before this event was handed
                // over; projection failures only degrade derived state.
                let ticks = match self.projector.project(&batch).await {
                    Ok(ticks) => ticks,
                    Err(e) => {
                        tracing::warn!("telemetry projection failed: {e}");
                        return;
                    }
                };
                for tick in ticks {
                    if let Err(e) = self.history.on_level(&tick.vin, tick.metric, tick.value).await
                    {
                        tracing::warn!(vin = %tick.vin, "history tracking failed: {e}");
                    }
                }
            }
            PushEvent::CommandStatus(update) => {
                for (vin, statuses) in &update.updates {
                    for status in statuses {
                        if status.errors.is_empty() {
                            tracing::debug!(
                                vin = %vin,
                                request_id = status.request_id.as_deref().unwrap_or(""),
                                status = status.status.as_deref().unwrap_or(""),
                                "command status update"
                            );
                        } else {
                            tracing::error!(vin = %vin, errors = ?status.errors, "command failed");
                        }
                    }
                }
            }
            PushEvent::AssignedVehicles(vehicles) => {
                tracing::debug!(vins = ?vehicles.vins, "assigned vehicles updated");
                self.vins = vehicles.vins;
            }
            PushEvent::PendingCommand(pending) => {
                tracing::debug!(
                    request_id = pending.request_id.as_deref().unwrap_or(""),
                    "pending command request"
                );
            }
            PushEvent::Debug(debug_evt) => {
                tracing::debug!(text = debug_evt.message.as_deref().unwrap_or(""), "backend debug message");
            }
            PushEvent::Unknown(action) => {
                tracing::debug!(action, "ignoring unknown push event");
            }
        }
    }

    async fn set_connected(&self, connected: bool) {
        if let Err(e) = self.tree.set("info.connection", connected.into()).await {
            tracing::warn!("failed to publish connectivity fact: {e}");
        }
    }
}
