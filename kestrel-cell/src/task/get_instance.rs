//! Query executors: guest configuration, runtime status, credentials.

use async_trait::async_trait;
use kestrel_hypervisor::Result;
use tracing::debug;

use crate::protocol::{Message, MessageKind, ParamKey, SessionId};
use crate::task::{instance_param, respond_fail, CellModules};
use crate::transaction::Executor;

pub struct GetInstanceConfigExecutor {
    modules: CellModules,
}

impl GetInstanceConfigExecutor {
    pub fn new(modules: CellModules) -> Self {
        Self { modules }
    }
}

#[async_trait]
impl Executor for GetInstanceConfigExecutor {
    async fn execute(&self, session: SessionId, request: Message) -> Result<()> {
        let mut response = Message::response_to(&request, MessageKind::GetGuestResponse, session);
        let target = request.sender.clone();

        let outcome = async {
            let id = instance_param(&request)?;
            self.modules.instance.get_config(id).await
        }
        .await;

        match outcome {
            Ok(config) => {
                response.set_string(ParamKey::Name, config.name);
                response.set_string(ParamKey::User, config.user);
                response.set_string(ParamKey::Group, config.group);
                response.set_uint(ParamKey::Core, u64::from(config.cores));
                response.set_uint(ParamKey::Memory, config.memory);
                response.set_uint_array(ParamKey::Disk, config.disks);
                response.set_bool(ParamKey::Option, config.auto_start);
                response.set_uint(ParamKey::Monitor, u64::from(config.monitor_port));
                response.set_string(ParamKey::Hardware, config.hardware_address);
                response.set_string(ParamKey::Pool, config.storage_pool);
                response.set_string_array(
                    ParamKey::Address,
                    vec![
                        config.internal_address.unwrap_or_default(),
                        config.external_address.unwrap_or_default(),
                    ],
                );
                response.set_bool(ParamKey::Enable, config.created);
                response.success = true;
                self.modules.sender.send(response, &target)
            }
            Err(err) => respond_fail(self.modules.sender.as_ref(), response, &err, &target),
        }
    }
}

pub struct GetInstanceStatusExecutor {
    modules: CellModules,
}

impl GetInstanceStatusExecutor {
    pub fn new(modules: CellModules) -> Self {
        Self { modules }
    }
}

#[async_trait]
impl Executor for GetInstanceStatusExecutor {
    async fn execute(&self, session: SessionId, request: Message) -> Result<()> {
        let mut response =
            Message::response_to(&request, MessageKind::GetInstanceStatusResponse, session);
        let target = request.sender.clone();

        let outcome = async {
            let id = instance_param(&request)?;
            self.modules.instance.get_status(id).await
        }
        .await;

        match outcome {
            Ok(status) => {
                debug!(session = format_args!("{session:08X}"), running = status.running, "status queried");
                response.set_bool(ParamKey::Enable, status.running);
                response.set_uint(ParamKey::Memory, status.available_memory);
                response.set_uint_array(
                    ParamKey::Disk,
                    vec![status.bytes_read, status.bytes_written],
                );
                response.set_uint_array(
                    ParamKey::Io,
                    vec![status.bytes_received, status.bytes_sent],
                );
                response.set_uint(ParamKey::Core, u64::from(status.cores));
                response.set_uint(ParamKey::Time, status.cpu_time_ns);
                response.success = true;
                self.modules.sender.send(response, &target)
            }
            Err(err) => respond_fail(self.modules.sender.as_ref(), response, &err, &target),
        }
    }
}

pub struct GetGuestPasswordExecutor {
    modules: CellModules,
}

impl GetGuestPasswordExecutor {
    pub fn new(modules: CellModules) -> Self {
        Self { modules }
    }
}

#[async_trait]
impl Executor for GetGuestPasswordExecutor {
    async fn execute(&self, session: SessionId, request: Message) -> Result<()> {
        let mut response = Message::response_to(&request, MessageKind::GetAuthResponse, session);
        let target = request.sender.clone();

        let outcome = async {
            let id = instance_param(&request)?;
            self.modules.instance.get_auth(id).await
        }
        .await;

        match outcome {
            Ok((user, secret)) => {
                response.set_string(ParamKey::User, user);
                response.set_string(ParamKey::Secret, secret);
                response.success = true;
                self.modules.sender.send(response, &target)
            }
            Err(err) => respond_fail(self.modules.sender.as_ref(), response, &err, &target),
        }
    }
}
