//! Modify executors: name, cores, memory, priority, thresholds and
//! credentials.
//!
//! The wire format of the Modify* requests carries an `immediate` flag in
//! the option slot; it is accepted and ignored, all changes land in the
//! persistent configuration.

use async_trait::async_trait;
use kestrel_hypervisor::{CellError, CpuPriority, Result};
use tracing::info;

use crate::protocol::{Message, MessageKind, ParamKey, SessionId};
use crate::task::{instance_param, respond_fail, CellModules};
use crate::transaction::Executor;

macro_rules! simple_executor {
    ($name:ident, $response:ident, |$modules:ident, $session:ident, $request:ident, $reply:ident| $body:expr) => {
        pub struct $name {
            modules: CellModules,
        }

        impl $name {
            pub fn new(modules: CellModules) -> Self {
                Self { modules }
            }
        }

        #[async_trait]
        impl Executor for $name {
            async fn execute(&self, session: SessionId, request: Message) -> Result<()> {
                let mut response =
                    Message::response_to(&request, MessageKind::$response, session);
                let target = request.sender.clone();
                let outcome: std::result::Result<(), CellError> = {
                    let $modules = &self.modules;
                    let $session = session;
                    let $request = &request;
                    let $reply = &mut response;
                    $body
                };
                match outcome {
                    Ok(()) => {
                        response.success = true;
                        self.modules.sender.send(response, &target)
                    }
                    Err(err) => {
                        respond_fail(self.modules.sender.as_ref(), response, &err, &target)
                    }
                }
            }
        }
    };
}

simple_executor!(ModifyGuestNameExecutor, ModifyGuestNameResponse, |modules,
                                                                    session,
                                                                    request,
                                                                    _reply| {
    async {
        let id = instance_param(request)?;
        let name = request.get_string(ParamKey::Name)?;
        modules.instance.rename(id, name.clone()).await?;
        info!(session = format_args!("{session:08X}"), guest = %id, name = %name, "guest renamed");
        Ok(())
    }
    .await
});

simple_executor!(ModifyGuestCoreExecutor, ModifyCoreResponse, |modules,
                                                               session,
                                                               request,
                                                               _reply| {
    async {
        let id = instance_param(request)?;
        let cores = u32::try_from(request.get_uint(ParamKey::Core)?)
            .map_err(|_| CellError::InvalidInput("core count out of range".to_string()))?;
        modules.instance.modify_cores(id, cores).await?;
        info!(session = format_args!("{session:08X}"), guest = %id, cores, "guest cores modified");
        Ok(())
    }
    .await
});

simple_executor!(ModifyGuestMemoryExecutor, ModifyMemoryResponse, |modules,
                                                                   session,
                                                                   request,
                                                                   _reply| {
    async {
        let id = instance_param(request)?;
        let memory = request.get_uint(ParamKey::Memory)?;
        modules.instance.modify_memory(id, memory).await?;
        info!(session = format_args!("{session:08X}"), guest = %id, memory_mb = memory >> 20, "guest memory modified");
        Ok(())
    }
    .await
});

simple_executor!(ModifyCpuPriorityExecutor, ModifyPriorityResponse, |modules,
                                                                     session,
                                                                     request,
                                                                     _reply| {
    async {
        let id = instance_param(request)?;
        let priority = CpuPriority::try_from(request.get_uint(ParamKey::Priority)?)?;
        modules.instance.modify_priority(id, priority).await?;
        info!(session = format_args!("{session:08X}"), guest = %id, ?priority, "guest priority modified");
        Ok(())
    }
    .await
});

simple_executor!(
    ModifyDiskThresholdExecutor,
    ModifyDiskThresholdResponse,
    |modules, session, request, _reply| {
        async {
            let id = instance_param(request)?;
            let limits = request.get_uint_array(ParamKey::Limit)?;
            if limits.len() != 4 {
                return Err(CellError::InvalidInput(format!(
                    "invalid disk threshold count {}",
                    limits.len()
                )));
            }
            modules
                .instance
                .modify_disk_threshold(id, limits[0], limits[1], limits[2], limits[3])
                .await?;
            info!(session = format_args!("{session:08X}"), guest = %id, "disk threshold modified");
            Ok(())
        }
        .await
    }
);

simple_executor!(
    ModifyNetworkThresholdExecutor,
    ModifyNetworkThresholdResponse,
    |modules, session, request, _reply| {
        async {
            let id = instance_param(request)?;
            let limits = request.get_uint_array(ParamKey::Limit)?;
            if limits.len() != 2 {
                return Err(CellError::InvalidInput(format!(
                    "invalid network threshold count {}",
                    limits.len()
                )));
            }
            modules
                .instance
                .modify_network_threshold(id, limits[0], limits[1])
                .await?;
            info!(session = format_args!("{session:08X}"), guest = %id, "network threshold modified");
            Ok(())
        }
        .await
    }
);

simple_executor!(
    ModifyGuestPasswordExecutor,
    ModifyAuthResponse,
    |modules, session, request, reply| {
        async {
            let id = instance_param(request)?;
            let user = request.get_string(ParamKey::User).ok();
            let secret = request.get_string(ParamKey::Secret).ok();
            let effective = modules.instance.modify_auth(id, user, secret).await?;
            reply.set_string(ParamKey::Secret, effective);
            info!(session = format_args!("{session:08X}"), guest = %id, "guest password modified");
            Ok(())
        }
        .await
    }
);

simple_executor!(
    ResetMonitorSecretExecutor,
    ResetSecretResponse,
    |modules, session, request, reply| {
        async {
            let id = instance_param(request)?;
            let secret = modules.instance.reset_monitor_secret(id).await?;
            reply.set_string(ParamKey::Secret, secret);
            info!(session = format_args!("{session:08X}"), guest = %id, "monitor secret reset");
            Ok(())
        }
        .await
    }
);
