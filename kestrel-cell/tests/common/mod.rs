//! Shared fixture: a fully wired cell against the in-memory hypervisor,
//! the plain-file image tool and an in-process message sink.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kestrel_cell::instance::InstanceModule;
use kestrel_cell::network::{NetworkConfig, NetworkHandle, NetworkModule};
use kestrel_cell::protocol::{ChannelSender, Message, MessageKind, ParamKey};
use kestrel_cell::scheduler::ImageServiceClient;
use kestrel_cell::storage::{StorageConfig, StorageHandle, StorageModule};
use kestrel_cell::task::{register_executors, CellModules};
use kestrel_cell::transaction::TransactionEngine;
use kestrel_hypervisor::{FileImageTool, MockHypervisor};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Origin name the fixture stamps on requests.
pub const CONTROLLER: &str = "controller";

pub struct TestCell {
    pub engine: TransactionEngine,
    pub outbound: mpsc::UnboundedReceiver<(String, Message)>,
    pub mock: Arc<MockHypervisor>,
    pub storage: StorageHandle,
    pub network: NetworkHandle,
    pub pool_path: PathBuf,
    _dir: tempfile::TempDir,
}

impl TestCell {
    /// Spin up every module. The image channel uses plain HTTP so tests
    /// can stand up a local peer.
    pub async fn start(operate_timeout: Duration) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let pool_path = dir.path().join("volumes");
        let data_path = dir.path().join("data");

        let mock = Arc::new(MockHypervisor::new());
        let storage = StorageModule::start(
            StorageConfig {
                pool_name: "local".to_string(),
                pool_path: pool_path.clone(),
                data_path: data_path.clone(),
            },
            Arc::new(FileImageTool::new()),
            ImageServiceClient::with_scheme("http").expect("build image client"),
        )
        .expect("start storage module");
        let network =
            NetworkModule::start(NetworkConfig::new("br0", &data_path)).expect("start network");
        let (instance, _events) =
            InstanceModule::start(mock.clone(), data_path).expect("start instance module");

        let (sender, outbound) = ChannelSender::new();
        let mut engine = TransactionEngine::new();
        register_executors(
            &mut engine,
            CellModules {
                sender: Arc::new(sender),
                instance,
                storage: storage.clone(),
                network: network.clone(),
                operate_timeout,
            },
        )
        .expect("register executors");

        Self {
            engine,
            outbound,
            mock,
            storage,
            network,
            pool_path,
            _dir: dir,
        }
    }

    /// Run one request to completion.
    pub async fn run(&mut self, request: Message) {
        self.engine
            .launch(request)
            .expect("launch request")
            .await
            .expect("executor task");
    }

    /// Next outbound message, bounded so a missing send fails the test.
    pub async fn next_message(&mut self) -> Message {
        let (target, message) = tokio::time::timeout(Duration::from_secs(10), self.outbound.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("message stream closed");
        assert_eq!(target, CONTROLLER);
        message
    }

    /// Skip progress events until a terminal message of `kind` arrives.
    pub async fn next_message_of(&mut self, kind: MessageKind) -> Message {
        loop {
            let message = self.next_message().await;
            if message.kind == kind {
                return message;
            }
        }
    }

    /// Skip successful progress updates until the failed one arrives.
    pub async fn next_failed_update(&mut self) -> Message {
        loop {
            let message = self.next_message().await;
            if message.kind == MessageKind::GuestUpdatedEvent && !message.success {
                return message;
            }
        }
    }
}

/// A minimal, valid create-guest request.
pub fn create_guest_request(id: Uuid, name: &str) -> Message {
    let mut request = Message::new(MessageKind::CreateGuestRequest);
    request.session = 7;
    request.sender = CONTROLLER.to_string();
    request.set_string(ParamKey::Name, name);
    request.set_string(ParamKey::Instance, id.to_string());
    request.set_string(ParamKey::User, "admin");
    request.set_string(ParamKey::Group, "dev");
    request.set_uint(ParamKey::Core, 2);
    request.set_uint(ParamKey::Memory, 2 << 30);
    request.set_uint_array(ParamKey::Disk, vec![1 << 20]);
    request.set_bool(ParamKey::Option, false);
    request.set_string(ParamKey::Admin, "root");
    // OS, Disk, Network, Display, Control, USB, Tablet
    request.set_uint_array(ParamKey::Template, vec![0, 1, 2, 0, 0, 1, 1]);
    request.set_uint_array(ParamKey::Mode, vec![0, 0]);
    request.set_uint_array(ParamKey::Flag, vec![0]);
    request
}

/// A request targeting one guest.
pub fn instance_request(kind: MessageKind, id: Uuid) -> Message {
    let mut request = Message::new(kind);
    request.session = 9;
    request.sender = CONTROLLER.to_string();
    request.set_string(ParamKey::Instance, id.to_string());
    request
}
