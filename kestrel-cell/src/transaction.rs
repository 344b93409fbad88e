//! Transaction engine.
//!
//! A registry of executors keyed by request kind. Each incoming message
//! is dispatched into its own task, bound to a fresh session id, with the
//! module handles its executor was constructed with. The engine owns
//! neither reply channels nor module state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use kestrel_hypervisor::{CellError, Result};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::protocol::{Message, MessageKind, SessionId};

/// One request-kind handler.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Drive a single request to completion. Errors are for the log; the
    /// user-visible failure has already been sent as a reply.
    async fn execute(&self, session: SessionId, request: Message) -> Result<()>;
}

/// Registry and dispatcher.
#[derive(Default)]
pub struct TransactionEngine {
    executors: HashMap<MessageKind, Arc<dyn Executor>>,
    next_session: AtomicU32,
}

impl TransactionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the executor for a request kind; a second registration of
    /// the same kind is a conflict.
    pub fn register(&mut self, kind: MessageKind, executor: Arc<dyn Executor>) -> Result<()> {
        if self.executors.contains_key(&kind) {
            return Err(CellError::Conflict(format!(
                "executor for {kind:?} already registered"
            )));
        }
        self.executors.insert(kind, executor);
        Ok(())
    }

    /// Dispatch a request into its executor task.
    pub fn launch(&self, request: Message) -> Result<JoinHandle<()>> {
        let executor = self
            .executors
            .get(&request.kind)
            .cloned()
            .ok_or_else(|| CellError::NotFound(format!("no executor for {request:?}", request = request.kind)))?;
        let session = self.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        let kind = request.kind;
        debug!(session = format_args!("{session:08X}"), ?kind, "request dispatched");
        Ok(tokio::spawn(async move {
            if let Err(err) = executor.execute(session, request).await {
                warn!(session = format_args!("{session:08X}"), ?kind, error = %err, "executor failed");
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct FlagExecutor {
        hit: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Executor for FlagExecutor {
        async fn execute(&self, _session: SessionId, _request: Message) -> Result<()> {
            self.hit.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatches_to_the_registered_executor() {
        let hit = Arc::new(AtomicBool::new(false));
        let mut engine = TransactionEngine::new();
        engine
            .register(
                MessageKind::StartInstanceRequest,
                Arc::new(FlagExecutor { hit: hit.clone() }),
            )
            .unwrap();

        let handle = engine
            .launch(Message::new(MessageKind::StartInstanceRequest))
            .unwrap();
        handle.await.unwrap();
        assert!(hit.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn duplicate_registration_conflicts() {
        let hit = Arc::new(AtomicBool::new(false));
        let mut engine = TransactionEngine::new();
        engine
            .register(
                MessageKind::StartInstanceRequest,
                Arc::new(FlagExecutor { hit: hit.clone() }),
            )
            .unwrap();
        assert!(matches!(
            engine.register(
                MessageKind::StartInstanceRequest,
                Arc::new(FlagExecutor { hit }),
            ),
            Err(CellError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn unknown_kind_is_rejected() {
        let engine = TransactionEngine::new();
        assert!(matches!(
            engine.launch(Message::new(MessageKind::StopInstanceRequest)),
            Err(CellError::NotFound(_))
        ));
    }
}
