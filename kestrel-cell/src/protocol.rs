//! Typed RPC message model.
//!
//! The cluster transport itself lives outside the cell; this module models
//! the surface the cell consumes: request kinds, session correlation, a
//! typed parameter map and the sender used for replies and events.

use std::collections::HashMap;

use kestrel_hypervisor::{CellError, Result};
use tokio::sync::mpsc;

/// Session identifier correlating a request with its replies and events.
pub type SessionId = u32;

/// Every message kind the cell receives or emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    // Requests from the controller.
    GetComputePoolCellRequest,
    CreateGuestRequest,
    DeleteGuestRequest,
    GetGuestRequest,
    GetInstanceStatusRequest,
    StartInstanceRequest,
    StopInstanceRequest,
    AttachInstanceRequest,
    DetachInstanceRequest,
    ModifyGuestNameRequest,
    ModifyCoreRequest,
    ModifyMemoryRequest,
    ModifyPriorityRequest,
    ModifyDiskThresholdRequest,
    ModifyNetworkThresholdRequest,
    ModifyAuthRequest,
    GetAuthRequest,
    ResetSystemRequest,
    InsertMediaRequest,
    EjectMediaRequest,
    CreateDiskImageRequest,
    ResizeDiskRequest,
    ShrinkDiskRequest,
    QuerySnapshotRequest,
    GetSnapshotRequest,
    CreateSnapshotRequest,
    DeleteSnapshotRequest,
    RestoreSnapshotRequest,
    ResetSecretRequest,
    QueryCellStorageRequest,
    ModifyCellStorageRequest,

    // Cluster events the cell consumes.
    ComputePoolReadyEvent,
    ComputeCellRemovedEvent,
    AddressPoolChangedEvent,

    // Responses.
    GetComputePoolCellResponse,
    CreateGuestResponse,
    DeleteGuestResponse,
    GetGuestResponse,
    GetInstanceStatusResponse,
    StartInstanceResponse,
    StopInstanceResponse,
    AttachInstanceResponse,
    DetachInstanceResponse,
    ModifyGuestNameResponse,
    ModifyCoreResponse,
    ModifyMemoryResponse,
    ModifyPriorityResponse,
    ModifyDiskThresholdResponse,
    ModifyNetworkThresholdResponse,
    ModifyAuthResponse,
    GetAuthResponse,
    ResetSystemResponse,
    InsertMediaResponse,
    EjectMediaResponse,
    CreateDiskImageResponse,
    ResizeDiskResponse,
    ShrinkDiskResponse,
    QuerySnapshotResponse,
    GetSnapshotResponse,
    CreateSnapshotResponse,
    DeleteSnapshotResponse,
    RestoreSnapshotResponse,
    ResetSecretResponse,
    QueryCellStorageResponse,
    ModifyCellStorageResponse,

    // Events the cell emits.
    GuestCreatedEvent,
    GuestDeletedEvent,
    GuestStartedEvent,
    GuestStoppedEvent,
    GuestUpdatedEvent,
    GuestReconfigureEvent,
}

impl MessageKind {
    /// The response kind paired with a request kind.
    pub fn response(&self) -> Option<MessageKind> {
        use MessageKind::*;
        let kind = match self {
            GetComputePoolCellRequest => GetComputePoolCellResponse,
            CreateGuestRequest => CreateGuestResponse,
            DeleteGuestRequest => DeleteGuestResponse,
            GetGuestRequest => GetGuestResponse,
            GetInstanceStatusRequest => GetInstanceStatusResponse,
            StartInstanceRequest => StartInstanceResponse,
            StopInstanceRequest => StopInstanceResponse,
            AttachInstanceRequest => AttachInstanceResponse,
            DetachInstanceRequest => DetachInstanceResponse,
            ModifyGuestNameRequest => ModifyGuestNameResponse,
            ModifyCoreRequest => ModifyCoreResponse,
            ModifyMemoryRequest => ModifyMemoryResponse,
            ModifyPriorityRequest => ModifyPriorityResponse,
            ModifyDiskThresholdRequest => ModifyDiskThresholdResponse,
            ModifyNetworkThresholdRequest => ModifyNetworkThresholdResponse,
            ModifyAuthRequest => ModifyAuthResponse,
            GetAuthRequest => GetAuthResponse,
            ResetSystemRequest => ResetSystemResponse,
            InsertMediaRequest => InsertMediaResponse,
            EjectMediaRequest => EjectMediaResponse,
            CreateDiskImageRequest => CreateDiskImageResponse,
            ResizeDiskRequest => ResizeDiskResponse,
            ShrinkDiskRequest => ShrinkDiskResponse,
            QuerySnapshotRequest => QuerySnapshotResponse,
            GetSnapshotRequest => GetSnapshotResponse,
            CreateSnapshotRequest => CreateSnapshotResponse,
            DeleteSnapshotRequest => DeleteSnapshotResponse,
            RestoreSnapshotRequest => RestoreSnapshotResponse,
            ResetSecretRequest => ResetSecretResponse,
            QueryCellStorageRequest => QueryCellStorageResponse,
            ModifyCellStorageRequest => ModifyCellStorageResponse,
            _ => return None,
        };
        Some(kind)
    }
}

/// Parameter slots of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKey {
    Name,
    Instance,
    User,
    Group,
    Core,
    Memory,
    Disk,
    Option,
    Admin,
    Template,
    Mode,
    Image,
    Host,
    Port,
    Size,
    Address,
    Priority,
    Limit,
    Policy,
    Action,
    Module,
    Flag,
    Secret,
    Path,
    Monitor,
    Hardware,
    Progress,
    Enable,
    Pool,
    Volume,
    Snapshot,
    Current,
    Backing,
    Created,
    Io,
    Time,
    Storage,
}

/// A typed parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Bool(bool),
    UInt(u64),
    Str(String),
    UIntArray(Vec<u64>),
    StrArray(Vec<String>),
}

/// One RPC message: kind, session correlation and typed parameters.
#[derive(Debug, Clone)]
pub struct Message {
    pub kind: MessageKind,
    /// Session of the side that produced the message.
    pub session: SessionId,
    /// Session of the side the message answers.
    pub to_session: SessionId,
    /// Name of the sending endpoint.
    pub sender: String,
    pub success: bool,
    pub error: String,
    params: HashMap<ParamKey, ParamValue>,
}

impl Message {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            session: 0,
            to_session: 0,
            sender: String::new(),
            success: true,
            error: String::new(),
            params: HashMap::new(),
        }
    }

    /// A response correlated with a request; starts unsuccessful until the
    /// executor proves otherwise.
    pub fn response_to(request: &Message, kind: MessageKind, session: SessionId) -> Self {
        let mut message = Self::new(kind);
        message.session = session;
        message.to_session = request.session;
        message.success = false;
        message
    }

    /// An event originating from an executor session.
    pub fn event(kind: MessageKind, session: SessionId) -> Self {
        let mut message = Self::new(kind);
        message.session = session;
        message
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.success = false;
        self.error = error.into();
    }

    // -------------------------------------------------------------------------
    // Setters
    // -------------------------------------------------------------------------

    pub fn set_bool(&mut self, key: ParamKey, value: bool) {
        self.params.insert(key, ParamValue::Bool(value));
    }

    pub fn set_uint(&mut self, key: ParamKey, value: u64) {
        self.params.insert(key, ParamValue::UInt(value));
    }

    pub fn set_string(&mut self, key: ParamKey, value: impl Into<String>) {
        self.params.insert(key, ParamValue::Str(value.into()));
    }

    pub fn set_uint_array(&mut self, key: ParamKey, value: Vec<u64>) {
        self.params.insert(key, ParamValue::UIntArray(value));
    }

    pub fn set_string_array(&mut self, key: ParamKey, value: Vec<String>) {
        self.params.insert(key, ParamValue::StrArray(value));
    }

    // -------------------------------------------------------------------------
    // Getters; a missing or mistyped parameter is an input error
    // -------------------------------------------------------------------------

    fn get(&self, key: ParamKey) -> Result<&ParamValue> {
        self.params
            .get(&key)
            .ok_or_else(|| CellError::InvalidInput(format!("missing parameter {key:?}")))
    }

    pub fn has(&self, key: ParamKey) -> bool {
        self.params.contains_key(&key)
    }

    pub fn get_bool(&self, key: ParamKey) -> Result<bool> {
        match self.get(key)? {
            ParamValue::Bool(value) => Ok(*value),
            _ => Err(CellError::InvalidInput(format!("parameter {key:?} is not a flag"))),
        }
    }

    pub fn get_uint(&self, key: ParamKey) -> Result<u64> {
        match self.get(key)? {
            ParamValue::UInt(value) => Ok(*value),
            _ => Err(CellError::InvalidInput(format!(
                "parameter {key:?} is not an unsigned integer"
            ))),
        }
    }

    pub fn get_string(&self, key: ParamKey) -> Result<String> {
        match self.get(key)? {
            ParamValue::Str(value) => Ok(value.clone()),
            _ => Err(CellError::InvalidInput(format!("parameter {key:?} is not a string"))),
        }
    }

    pub fn get_uint_array(&self, key: ParamKey) -> Result<Vec<u64>> {
        match self.get(key)? {
            ParamValue::UIntArray(value) => Ok(value.clone()),
            _ => Err(CellError::InvalidInput(format!(
                "parameter {key:?} is not an unsigned array"
            ))),
        }
    }

    pub fn get_string_array(&self, key: ParamKey) -> Result<Vec<String>> {
        match self.get(key)? {
            ParamValue::StrArray(value) => Ok(value.clone()),
            _ => Err(CellError::InvalidInput(format!(
                "parameter {key:?} is not a string array"
            ))),
        }
    }
}

/// Outbound side of the RPC framework.
pub trait MessageSender: Send + Sync {
    /// Deliver a message to a named endpoint.
    fn send(&self, message: Message, target: &str) -> Result<()>;
}

/// Channel-backed sender: messages land on an in-process queue.
///
/// The daemon wires this to the cluster transport; tests read the queue
/// directly.
pub struct ChannelSender {
    tx: mpsc::UnboundedSender<(String, Message)>,
}

impl ChannelSender {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, Message)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl MessageSender for ChannelSender {
    fn send(&self, message: Message, target: &str) -> Result<()> {
        self.tx
            .send((target.to_string(), message))
            .map_err(|_| CellError::Internal("message sink closed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_getters_enforce_presence_and_type() {
        let mut message = Message::new(MessageKind::CreateGuestRequest);
        message.set_uint(ParamKey::Core, 4);

        assert_eq!(message.get_uint(ParamKey::Core).unwrap(), 4);
        assert!(matches!(
            message.get_string(ParamKey::Core),
            Err(CellError::InvalidInput(_))
        ));
        assert!(matches!(
            message.get_uint(ParamKey::Memory),
            Err(CellError::InvalidInput(_))
        ));
    }

    #[test]
    fn response_correlates_sessions() {
        let mut request = Message::new(MessageKind::StartInstanceRequest);
        request.session = 0x2A;

        let response = Message::response_to(
            &request,
            request.kind.response().unwrap(),
            0x99,
        );
        assert_eq!(response.kind, MessageKind::StartInstanceResponse);
        assert_eq!(response.to_session, 0x2A);
        assert_eq!(response.session, 0x99);
        assert!(!response.success);
    }

    #[test]
    fn every_request_has_a_response_kind() {
        use MessageKind::*;
        for kind in [
            GetComputePoolCellRequest,
            CreateGuestRequest,
            DeleteGuestRequest,
            GetGuestRequest,
            GetInstanceStatusRequest,
            StartInstanceRequest,
            StopInstanceRequest,
            AttachInstanceRequest,
            DetachInstanceRequest,
            ModifyGuestNameRequest,
            ModifyCoreRequest,
            ModifyMemoryRequest,
            ModifyPriorityRequest,
            ModifyDiskThresholdRequest,
            ModifyNetworkThresholdRequest,
            ModifyAuthRequest,
            GetAuthRequest,
            ResetSystemRequest,
            InsertMediaRequest,
            EjectMediaRequest,
            CreateDiskImageRequest,
            ResizeDiskRequest,
            ShrinkDiskRequest,
            QuerySnapshotRequest,
            GetSnapshotRequest,
            CreateSnapshotRequest,
            DeleteSnapshotRequest,
            RestoreSnapshotRequest,
            ResetSecretRequest,
            QueryCellStorageRequest,
            ModifyCellStorageRequest,
        ] {
            assert!(kind.response().is_some(), "{kind:?}");
        }
        assert!(GuestCreatedEvent.response().is_none());
    }

    #[tokio::test]
    async fn channel_sender_delivers_in_order() {
        let (sender, mut rx) = ChannelSender::new();
        sender
            .send(Message::new(MessageKind::GuestCreatedEvent), "controller")
            .unwrap();
        sender
            .send(Message::new(MessageKind::GuestStartedEvent), "controller")
            .unwrap();

        let (target, first) = rx.recv().await.unwrap();
        assert_eq!(target, "controller");
        assert_eq!(first.kind, MessageKind::GuestCreatedEvent);
        let (_, second) = rx.recv().await.unwrap();
        assert_eq!(second.kind, MessageKind::GuestStartedEvent);
    }
}
