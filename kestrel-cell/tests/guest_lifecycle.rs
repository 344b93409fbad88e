//! Lifecycle flows through the executors: power matrix, delete, volume
//! attach/detach and the snapshot chain.

mod common;

use std::time::Duration;

use common::{create_guest_request, instance_request, TestCell};
use kestrel_cell::protocol::{Message, MessageKind, ParamKey};
use kestrel_hypervisor::mock::PowerVerb;
use kestrel_hypervisor::Hypervisor;
use uuid::Uuid;

const OPERATE_TIMEOUT: Duration = Duration::from_secs(3);

async fn created_guest(cell: &mut TestCell) -> Uuid {
    let id = Uuid::new_v4();
    cell.run(create_guest_request(id, &format!("dev.g{}", &id.to_string()[..8])))
        .await;
    let response = cell.next_message().await;
    assert!(response.success, "create failed: {}", response.error);
    cell.next_message().await; // created event
    id
}

fn stop_request(id: Uuid, reboot: bool, force: bool) -> Message {
    let mut request = instance_request(MessageKind::StopInstanceRequest, id);
    request.set_uint_array(
        ParamKey::Option,
        vec![u64::from(reboot), u64::from(force)],
    );
    request
}

#[tokio::test]
async fn stop_matrix_issues_the_four_verbs() {
    let mut cell = TestCell::start(OPERATE_TIMEOUT).await;
    let id = created_guest(&mut cell).await;

    cell.run(instance_request(MessageKind::StartInstanceRequest, id))
        .await;
    let started = cell.next_message().await;
    assert!(started.success);
    cell.next_message().await; // started event

    for (reboot, force) in [(true, false), (true, true), (false, true)] {
        cell.run(stop_request(id, reboot, force)).await;
        let response = cell.next_message().await;
        assert!(response.success, "stop({reboot},{force}): {}", response.error);
        if !reboot {
            cell.next_message().await; // stopped event
        }
    }

    let verbs: Vec<PowerVerb> = cell
        .mock
        .recorded_verbs()
        .await
        .into_iter()
        .map(|(_, verb)| verb)
        .collect();
    assert_eq!(
        verbs,
        vec![
            PowerVerb::Start,
            PowerVerb::Reboot,
            PowerVerb::Reset,
            PowerVerb::Destroy,
        ]
    );

    // Stopping a stopped guest reports not-running.
    cell.run(stop_request(id, false, false)).await;
    let response = cell.next_message().await;
    assert!(!response.success);
    assert!(response.error.contains("not running"), "error: {}", response.error);
}

#[tokio::test]
async fn delete_releases_every_resource_and_is_refused_while_running() {
    let mut cell = TestCell::start(OPERATE_TIMEOUT).await;
    let id = created_guest(&mut cell).await;

    cell.run(instance_request(MessageKind::StartInstanceRequest, id))
        .await;
    assert!(cell.next_message().await.success);
    cell.next_message().await;

    cell.run(instance_request(MessageKind::DeleteGuestRequest, id))
        .await;
    let refused = cell.next_message().await;
    assert!(!refused.success);

    cell.run(stop_request(id, false, false)).await;
    assert!(cell.next_message().await.success);
    cell.next_message().await;

    cell.run(instance_request(MessageKind::DeleteGuestRequest, id))
        .await;
    let response = cell.next_message().await;
    assert!(response.success, "delete failed: {}", response.error);
    let deleted = cell.next_message().await;
    assert_eq!(deleted.kind, MessageKind::GuestDeletedEvent);

    assert!(!cell.mock.exists(id).await);
    assert!(cell.storage.find_group(id).await.unwrap().is_none());
    assert_eq!(cell.network.count_allocations().await.unwrap(), 0);
}

#[tokio::test]
async fn attach_then_detach_data_volume() {
    let mut cell = TestCell::start(OPERATE_TIMEOUT).await;
    let id = created_guest(&mut cell).await;

    let mut attach = instance_request(MessageKind::AttachInstanceRequest, id);
    attach.set_uint(ParamKey::Size, 1 << 20);
    cell.run(attach).await;
    let response = cell.next_message().await;
    assert!(response.success, "attach failed: {}", response.error);
    let volume = response.get_string(ParamKey::Volume).unwrap();
    assert!(volume.ends_with("_data0"));
    assert!(cell.pool_path.join(format!("{volume}.qcow2")).exists());

    let group = cell.storage.find_group(id).await.unwrap().expect("group");
    assert_eq!(group.volumes.len(), 2);

    let mut detach = instance_request(MessageKind::DetachInstanceRequest, id);
    detach.set_string(ParamKey::Volume, volume.clone());
    cell.run(detach).await;
    let response = cell.next_message().await;
    assert!(response.success, "detach failed: {}", response.error);
    assert!(!cell.pool_path.join(format!("{volume}.qcow2")).exists());
    let group = cell.storage.find_group(id).await.unwrap().expect("group");
    assert_eq!(group.volumes.len(), 1);
}

fn snapshot_request(kind: MessageKind, id: Uuid, name: &str) -> Message {
    let mut request = instance_request(kind, id);
    request.set_string(ParamKey::Snapshot, name);
    request
}

#[tokio::test]
async fn snapshot_chain_create_delete_restore() {
    let mut cell = TestCell::start(OPERATE_TIMEOUT).await;
    let id = created_guest(&mut cell).await;

    let group = cell.storage.find_group(id).await.unwrap().expect("group");
    let volume_path = cell
        .pool_path
        .join(format!("{}.qcow2", group.volumes[0].name));

    tokio::fs::write(&volume_path, b"state-1").await.unwrap();
    cell.run(snapshot_request(MessageKind::CreateSnapshotRequest, id, "s1"))
        .await;
    assert!(cell.next_message().await.success);

    tokio::fs::write(&volume_path, b"state-2").await.unwrap();
    cell.run(snapshot_request(MessageKind::CreateSnapshotRequest, id, "s2"))
        .await;
    assert!(cell.next_message().await.success);

    // The chain reads current ← s2 ← s1.
    cell.run(instance_request(MessageKind::QuerySnapshotRequest, id))
        .await;
    let listing = cell.next_message().await;
    assert!(listing.success);
    let names = listing.get_string_array(ParamKey::Snapshot).unwrap();
    let parents = listing.get_string_array(ParamKey::Backing).unwrap();
    assert_eq!(names, vec!["s1".to_string(), "s2".to_string()]);
    assert_eq!(parents, vec![String::new(), "s1".to_string()]);
    assert_eq!(listing.get_string(ParamKey::Current).unwrap(), "s2");

    // Delete s1: one file fewer, the live state survives.
    tokio::fs::write(&volume_path, b"state-3").await.unwrap();
    cell.run(snapshot_request(MessageKind::DeleteSnapshotRequest, id, "s1"))
        .await;
    assert!(cell.next_message().await.success);
    cell.run(instance_request(MessageKind::QuerySnapshotRequest, id))
        .await;
    let listing = cell.next_message().await;
    assert_eq!(
        listing.get_string_array(ParamKey::Snapshot).unwrap(),
        vec!["s2".to_string()]
    );
    assert_eq!(
        tokio::fs::read(&volume_path).await.unwrap(),
        b"state-3".to_vec()
    );

    // Restore s2: the live file is rebuilt from the snapshot state.
    cell.run(snapshot_request(MessageKind::RestoreSnapshotRequest, id, "s2"))
        .await;
    assert!(cell.next_message().await.success);
    assert_eq!(
        tokio::fs::read(&volume_path).await.unwrap(),
        b"state-2".to_vec()
    );

    // Snapshot work is refused while the guest runs.
    cell.run(instance_request(MessageKind::StartInstanceRequest, id))
        .await;
    assert!(cell.next_message().await.success);
    cell.next_message().await;
    cell.run(snapshot_request(MessageKind::CreateSnapshotRequest, id, "s3"))
        .await;
    let refused = cell.next_message().await;
    assert!(!refused.success);
    assert!(refused.error.contains("busy"), "error: {}", refused.error);
}

#[tokio::test]
async fn modify_and_query_round_trip() {
    let mut cell = TestCell::start(OPERATE_TIMEOUT).await;
    let id = created_guest(&mut cell).await;

    let mut rename = instance_request(MessageKind::ModifyGuestNameRequest, id);
    rename.set_string(ParamKey::Name, "dev.renamed");
    cell.run(rename).await;
    assert!(cell.next_message().await.success);

    let mut cores = instance_request(MessageKind::ModifyCoreRequest, id);
    cores.set_uint(ParamKey::Core, 4);
    cell.run(cores).await;
    assert!(cell.next_message().await.success);

    let mut memory = instance_request(MessageKind::ModifyMemoryRequest, id);
    memory.set_uint(ParamKey::Memory, 4 << 30);
    cell.run(memory).await;
    assert!(cell.next_message().await.success);

    cell.run(instance_request(MessageKind::GetGuestRequest, id))
        .await;
    let config = cell.next_message().await;
    assert!(config.success);
    assert_eq!(config.get_string(ParamKey::Name).unwrap(), "dev.renamed");
    assert_eq!(config.get_uint(ParamKey::Core).unwrap(), 4);
    assert_eq!(config.get_uint(ParamKey::Memory).unwrap(), 4 << 30);

    // Disk thresholds refuse while the guest runs and leave the domain
    // untouched.
    cell.run(instance_request(MessageKind::StartInstanceRequest, id))
        .await;
    assert!(cell.next_message().await.success);
    cell.next_message().await;

    let mut threshold = instance_request(MessageKind::ModifyDiskThresholdRequest, id);
    threshold.set_uint_array(ParamKey::Limit, vec![1 << 20, 1 << 20, 500, 500]);
    cell.run(threshold).await;
    let refused = cell.next_message().await;
    assert!(!refused.success);
    let definition = cell.mock.get_definition(id).await.unwrap();
    assert!(definition.devices.disks[1].iotune.is_none());
}

#[tokio::test]
async fn reset_secret_and_auth_queries() {
    let mut cell = TestCell::start(OPERATE_TIMEOUT).await;
    let id = created_guest(&mut cell).await;

    cell.run(instance_request(MessageKind::ResetSecretRequest, id))
        .await;
    let response = cell.next_message().await;
    assert!(response.success);
    let secret = response.get_string(ParamKey::Secret).unwrap();
    assert_eq!(secret.len(), 8);

    cell.run(instance_request(MessageKind::GetAuthRequest, id))
        .await;
    let auth = cell.next_message().await;
    assert!(auth.success);
    assert_eq!(auth.get_string(ParamKey::User).unwrap(), "root");
}
