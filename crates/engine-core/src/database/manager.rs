use crate::{
    database::{DatabaseLatch, DatabaseManager},
    error::LatchError,
    latch::{Latch, LatchController, LatchMode, LatchState, LatchTicket, LatchableService, Lease},
};
use async_trait::async_trait;
use connectors::handle::DatabaseHandle;
use model::cancel::CancelState;
use std::{
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};
use tracing::info;

type CurrentHandle = Arc<RwLock<DatabaseHandle>>;

fn read_current(current: &CurrentHandle) -> DatabaseHandle {
    current
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Database manager holding the current handle behind a [`LatchController`].
pub struct DefaultDatabaseManager {
    current: CurrentHandle,
    controller: LatchController,
}

impl DefaultDatabaseManager {
    pub fn new(handle: DatabaseHandle, controller: LatchController) -> Self {
        DefaultDatabaseManager {
            current: Arc::new(RwLock::new(handle)),
            controller,
        }
    }

    pub fn controller(&self) -> &LatchController {
        &self.controller
    }

    /// Admits one database operation, waiting while the manager is latched.
    pub async fn lease(&self, cancel: &CancelState) -> Result<Lease, LatchError> {
        self.controller.lease(cancel).await
    }

    fn latch_for(&self, ticket: LatchTicket) -> Arc<dyn DatabaseLatch> {
        Arc::new(ManagedDatabaseLatch {
            ticket,
            controller: self.controller.clone(),
            current: self.current.clone(),
        })
    }
}

#[async_trait]
impl LatchableService for DefaultDatabaseManager {
    type Latch = dyn DatabaseLatch;

    async fn acquire_latch(
        &self,
        mode: LatchMode,
        id: Option<String>,
    ) -> Result<Arc<dyn DatabaseLatch>, LatchError> {
        let ticket = self.controller.acquire(mode, id).await?;
        Ok(self.latch_for(ticket))
    }

    fn current_latch(&self) -> Option<Arc<dyn DatabaseLatch>> {
        self.controller.current().map(|ticket| self.latch_for(ticket))
    }

    fn state(&self) -> LatchState {
        self.controller.state()
    }
}

impl DatabaseManager for DefaultDatabaseManager {
    fn handle(&self) -> DatabaseHandle {
        read_current(&self.current)
    }
}

/// Latch handed out by [`DefaultDatabaseManager`].
pub struct ManagedDatabaseLatch {
    ticket: LatchTicket,
    controller: LatchController,
    current: CurrentHandle,
}

impl ManagedDatabaseLatch {
    /// False when the latch was already active before it was requested.
    pub fn created(&self) -> bool {
        self.ticket.created
    }
}

#[async_trait]
impl Latch for ManagedDatabaseLatch {
    fn id(&self) -> &str {
        &self.ticket.id
    }

    fn mode(&self) -> LatchMode {
        self.ticket.mode
    }

    async fn drain(&self, timeout: Duration) -> bool {
        self.controller.drain(timeout).await
    }

    async fn force_drain(&self, timeout: Duration) -> bool {
        self.controller.force_drain(timeout).await
    }

    async fn unlatch(&self) {
        self.controller.unlatch(&self.ticket.id).await;
    }
}

#[async_trait]
impl DatabaseLatch for ManagedDatabaseLatch {
    async fn unlatch_to(&self, handle: DatabaseHandle) {
        if self.controller.current().is_some_and(|t| t.id == self.ticket.id) {
            let previous = {
                let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
                std::mem::replace(&mut *current, handle)
            };
            info!(
                latch_id = %self.ticket.id,
                from = %previous.describe(),
                to = %read_current(&self.current).describe(),
                "Switched current database"
            );
        }
        self.controller.unlatch(&self.ticket.id).await;
    }
}
