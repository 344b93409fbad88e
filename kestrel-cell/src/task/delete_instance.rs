//! Delete-guest executor.

use async_trait::async_trait;
use kestrel_hypervisor::Result;
use tracing::{info, warn};

use crate::protocol::{Message, MessageKind, ParamKey, SessionId};
use crate::task::{instance_param, respond_fail, CellModules};
use crate::transaction::Executor;

pub struct DeleteInstanceExecutor {
    modules: CellModules,
}

impl DeleteInstanceExecutor {
    pub fn new(modules: CellModules) -> Self {
        Self { modules }
    }
}

#[async_trait]
impl Executor for DeleteInstanceExecutor {
    async fn execute(&self, session: SessionId, request: Message) -> Result<()> {
        let mut response = Message::response_to(&request, MessageKind::DeleteGuestResponse, session);
        let target = request.sender.clone();

        let id = match instance_param(&request) {
            Ok(id) => id,
            Err(err) => return respond_fail(self.modules.sender.as_ref(), response, &err, &target),
        };

        // The domain goes first; it refuses while the guest runs, and
        // nothing else is touched in that case.
        if let Err(err) = self.modules.instance.delete_instance(id).await {
            warn!(session = format_args!("{session:08X}"), guest = %id, error = %err, "delete instance failed");
            return respond_fail(self.modules.sender.as_ref(), response, &err, &target);
        }
        if let Err(err) = self.modules.storage.delete_volumes(id).await {
            warn!(session = format_args!("{session:08X}"), guest = %id, error = %err, "release volumes failed");
        }
        if let Err(err) = self.modules.network.deallocate_all_resource(id).await {
            warn!(session = format_args!("{session:08X}"), guest = %id, error = %err, "release network failed");
        }

        info!(session = format_args!("{session:08X}"), guest = %id, "guest deleted");
        response.success = true;
        self.modules.sender.send(response, &target)?;

        let mut event = Message::event(MessageKind::GuestDeletedEvent, session);
        event.set_string(ParamKey::Instance, id.to_string());
        if let Err(err) = self.modules.sender.send(event, &target) {
            warn!(session = format_args!("{session:08X}"), error = %err, "notify guest deleted failed");
        }
        Ok(())
    }
}
