//! CD-ROM media executors.

use async_trait::async_trait;
use kestrel_hypervisor::{CellError, Result};
use tracing::info;

use crate::protocol::{Message, MessageKind, ParamKey, SessionId};
use crate::task::{instance_param, respond_fail, CellModules};
use crate::transaction::Executor;

pub struct InsertMediaExecutor {
    modules: CellModules,
}

impl InsertMediaExecutor {
    pub fn new(modules: CellModules) -> Self {
        Self { modules }
    }
}

#[async_trait]
impl Executor for InsertMediaExecutor {
    async fn execute(&self, session: SessionId, request: Message) -> Result<()> {
        let mut response = Message::response_to(&request, MessageKind::InsertMediaResponse, session);
        let target = request.sender.clone();

        let outcome = async {
            let id = instance_param(&request)?;
            let url = request.get_string(ParamKey::Image)?;
            let host = request.get_string(ParamKey::Host)?;
            let port = u16::try_from(request.get_uint(ParamKey::Port)?)
                .map_err(|_| CellError::InvalidInput("media port out of range".to_string()))?;
            self.modules.instance.insert_media(id, host, url, port).await?;
            info!(session = format_args!("{session:08X}"), guest = %id, "media inserted");
            Ok::<_, CellError>(())
        }
        .await;

        match outcome {
            Ok(()) => {
                response.success = true;
                self.modules.sender.send(response, &target)
            }
            Err(err) => respond_fail(self.modules.sender.as_ref(), response, &err, &target),
        }
    }
}

pub struct EjectMediaExecutor {
    modules: CellModules,
}

impl EjectMediaExecutor {
    pub fn new(modules: CellModules) -> Self {
        Self { modules }
    }
}

#[async_trait]
impl Executor for EjectMediaExecutor {
    async fn execute(&self, session: SessionId, request: Message) -> Result<()> {
        let mut response = Message::response_to(&request, MessageKind::EjectMediaResponse, session);
        let target = request.sender.clone();

        let outcome = async {
            let id = instance_param(&request)?;
            self.modules.instance.eject_media(id).await?;
            info!(session = format_args!("{session:08X}"), guest = %id, "media ejected");
            Ok::<_, CellError>(())
        }
        .await;

        match outcome {
            Ok(()) => {
                response.success = true;
                self.modules.sender.send(response, &target)
            }
            Err(err) => respond_fail(self.modules.sender.as_ref(), response, &err, &target),
        }
    }
}
