//! Start and stop executors.

use async_trait::async_trait;
use kestrel_hypervisor::{CellError, Result};
use tracing::{info, warn};

use crate::protocol::{Message, MessageKind, ParamKey, SessionId};
use crate::task::{instance_param, respond_fail, CellModules};
use crate::transaction::Executor;

pub struct StartInstanceExecutor {
    modules: CellModules,
}

impl StartInstanceExecutor {
    pub fn new(modules: CellModules) -> Self {
        Self { modules }
    }
}

#[async_trait]
impl Executor for StartInstanceExecutor {
    async fn execute(&self, session: SessionId, request: Message) -> Result<()> {
        let mut response = Message::response_to(&request, MessageKind::StartInstanceResponse, session);
        let target = request.sender.clone();

        let outcome = async {
            let id = instance_param(&request)?;
            // An optional media triple boots the guest from a remote ISO.
            if request.has(ParamKey::Image) {
                let url = request.get_string(ParamKey::Image)?;
                let host = request.get_string(ParamKey::Host)?;
                let port = u16::try_from(request.get_uint(ParamKey::Port)?)
                    .map_err(|_| CellError::InvalidInput("media port out of range".to_string()))?;
                self.modules.instance.start_with_media(id, host, url, port).await?;
            } else {
                self.modules.instance.start_instance(id).await?;
            }
            Ok::<_, CellError>(id)
        }
        .await;

        match outcome {
            Ok(id) => {
                info!(session = format_args!("{session:08X}"), guest = %id, "guest started");
                response.success = true;
                self.modules.sender.send(response, &target)?;
                let mut event = Message::event(MessageKind::GuestStartedEvent, session);
                event.set_string(ParamKey::Instance, id.to_string());
                if let Err(err) = self.modules.sender.send(event, &target) {
                    warn!(session = format_args!("{session:08X}"), error = %err, "notify guest started failed");
                }
                Ok(())
            }
            Err(err) => respond_fail(self.modules.sender.as_ref(), response, &err, &target),
        }
    }
}

pub struct StopInstanceExecutor {
    modules: CellModules,
}

impl StopInstanceExecutor {
    pub fn new(modules: CellModules) -> Self {
        Self { modules }
    }
}

#[async_trait]
impl Executor for StopInstanceExecutor {
    async fn execute(&self, session: SessionId, request: Message) -> Result<()> {
        let mut response = Message::response_to(&request, MessageKind::StopInstanceResponse, session);
        let target = request.sender.clone();

        let outcome = async {
            let id = instance_param(&request)?;
            let options = request.get_uint_array(ParamKey::Option)?;
            if options.len() != 2 {
                return Err(CellError::InvalidInput(format!(
                    "unexpected stop options count {}",
                    options.len()
                )));
            }
            let (reboot, force) = (options[0] == 1, options[1] == 1);
            self.modules.instance.stop_instance(id, reboot, force).await?;
            Ok::<_, CellError>((id, reboot))
        }
        .await;

        match outcome {
            Ok((id, reboot)) => {
                info!(session = format_args!("{session:08X}"), guest = %id, reboot, "stop request issued");
                response.success = true;
                self.modules.sender.send(response, &target)?;
                if !reboot {
                    let mut event = Message::event(MessageKind::GuestStoppedEvent, session);
                    event.set_string(ParamKey::Instance, id.to_string());
                    if let Err(err) = self.modules.sender.send(event, &target) {
                        warn!(session = format_args!("{session:08X}"), error = %err, "notify guest stopped failed");
                    }
                }
                Ok(())
            }
            Err(err) => respond_fail(self.modules.sender.as_ref(), response, &err, &target),
        }
    }
}
