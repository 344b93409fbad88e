//! Create-guest pipeline: the staged happy path, validation rejections
//! and compensating rollback around the image channel.

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use common::{create_guest_request, instance_request, TestCell};
use kestrel_cell::protocol::{MessageKind, ParamKey};
use kestrel_hypervisor::Hypervisor;
use sha1::{Digest, Sha1};
use uuid::Uuid;

const OPERATE_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn minimal_create_replies_and_emits_created_event() {
    let mut cell = TestCell::start(OPERATE_TIMEOUT).await;
    let id = Uuid::new_v4();

    cell.run(create_guest_request(id, "dev.alpha")).await;

    let response = cell.next_message().await;
    assert_eq!(response.kind, MessageKind::CreateGuestResponse);
    assert!(response.success, "create failed: {}", response.error);
    assert_eq!(response.get_string(ParamKey::Instance).unwrap(), id.to_string());
    assert!(response.get_bool(ParamKey::Enable).unwrap());
    assert_eq!(response.to_session, 7);

    let created = cell.next_message().await;
    assert_eq!(created.kind, MessageKind::GuestCreatedEvent);
    let port = created.get_uint(ParamKey::Monitor).unwrap();
    assert!((5901..=6000).contains(&port), "port {port} outside range");
    let mac = created.get_string(ParamKey::Hardware).unwrap();
    assert!(mac.starts_with("00:16:3e"));
    assert_eq!(mac.split(':').count(), 6);
    assert!(!created.get_string(ParamKey::Secret).unwrap().is_empty());

    // Domain defined, system volume on disk, network reservation held.
    assert!(cell.mock.exists(id).await);
    let group = cell.storage.find_group(id).await.unwrap().expect("group");
    assert!(group.volumes[0].name.ends_with("_sys"));
    assert!(cell
        .pool_path
        .join(format!("{}.qcow2", group.volumes[0].name))
        .exists());
    assert!(cell.network.get_allocation(id).await.unwrap().is_some());
}

#[tokio::test]
async fn empty_disk_list_is_rejected_before_any_allocation() {
    let mut cell = TestCell::start(OPERATE_TIMEOUT).await;
    let id = Uuid::new_v4();

    let mut request = create_guest_request(id, "dev.alpha");
    request.set_uint_array(ParamKey::Disk, vec![]);
    cell.run(request).await;

    let response = cell.next_message().await;
    assert!(!response.success);
    assert!(response.error.contains("disk size"));

    assert_eq!(cell.network.count_allocations().await.unwrap(), 0);
    assert!(cell.storage.find_group(id).await.unwrap().is_none());
    assert_eq!(cell.mock.domain_count().await, 0);
}

#[tokio::test]
async fn wrong_template_shape_is_rejected() {
    let mut cell = TestCell::start(OPERATE_TIMEOUT).await;
    let id = Uuid::new_v4();

    let mut request = create_guest_request(id, "dev.alpha");
    request.set_uint_array(ParamKey::Template, vec![0, 1, 2]);
    cell.run(request).await;

    let response = cell.next_message().await;
    assert!(!response.success);
    assert_eq!(cell.network.count_allocations().await.unwrap(), 0);
}

#[tokio::test]
async fn odd_core_count_rolls_back_network_and_storage() {
    let mut cell = TestCell::start(OPERATE_TIMEOUT).await;
    let id = Uuid::new_v4();

    // Three cores pass the wire checks but fail domain composition, so
    // the failure happens after both allocation stages.
    let mut request = create_guest_request(id, "dev.alpha");
    request.set_uint(ParamKey::Core, 3);
    cell.run(request).await;

    let response = cell.next_message().await;
    assert!(!response.success);
    assert!(response.error.contains("even core number"));

    assert!(cell.storage.find_group(id).await.unwrap().is_none());
    assert_eq!(cell.network.count_allocations().await.unwrap(), 0);
    assert_eq!(cell.mock.domain_count().await, 0);
}

#[tokio::test]
async fn second_create_with_same_id_fails_and_leaves_the_first_alone() {
    let mut cell = TestCell::start(OPERATE_TIMEOUT).await;
    let id = Uuid::new_v4();

    cell.run(create_guest_request(id, "dev.alpha")).await;
    cell.next_message().await;
    cell.next_message().await;

    cell.run(create_guest_request(id, "dev.beta")).await;
    let response = cell.next_message().await;
    assert!(!response.success);

    // The original guest keeps its resources.
    assert!(cell.mock.exists(id).await);
    assert!(cell.storage.find_group(id).await.unwrap().is_some());
    assert!(cell.network.get_allocation(id).await.unwrap().is_some());
}

// =============================================================================
// Image-channel scenarios
// =============================================================================

#[derive(Clone)]
struct ImagePayload {
    body: Vec<u8>,
    signature: String,
    /// Delay between the response headers and the body bytes; long
    /// enough to observe at least one progress tick.
    body_delay: Duration,
    status: StatusCode,
}

async fn serve_image(State(payload): State<ImagePayload>) -> axum::response::Response {
    if !payload.status.is_success() {
        return (payload.status, Vec::new()).into_response();
    }
    let bytes = payload.body.clone();
    let delay = payload.body_delay;
    let stream = futures::stream::once(async move {
        tokio::time::sleep(delay).await;
        Ok::<_, std::io::Error>(bytes)
    });
    (
        payload.status,
        [("Signature", payload.signature.clone())],
        axum::body::Body::from_stream(stream),
    )
        .into_response()
}

async fn accept_upload(_body: axum::body::Bytes) -> impl IntoResponse {
    axum::Json(serde_json::json!({ "error_code": 0, "message": "" }))
}

/// Serve one disk image over plain HTTP on an ephemeral port.
async fn start_image_server(payload: ImagePayload) -> SocketAddr {
    let app = Router::new()
        .route(
            "/api/v1/disk_images/:image/file/",
            get(serve_image).put(accept_upload),
        )
        .with_state(payload);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind image server");
    let addr = listener.local_addr().expect("server addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("image server");
    });
    addr
}

fn clone_request(id: Uuid, name: &str, addr: SocketAddr, image_size: u64) -> kestrel_cell::Message {
    let mut request = create_guest_request(id, name);
    request.set_string(ParamKey::Image, "img-1");
    request.set_string(ParamKey::Host, addr.ip().to_string());
    request.set_uint(ParamKey::Port, u64::from(addr.port()));
    request.set_uint(ParamKey::Size, image_size);
    request
}

#[tokio::test]
async fn clone_from_image_streams_progress_then_created() {
    let body = vec![0xA5u8; 64 << 10];
    let signature = hex::encode(Sha1::digest(&body));
    // The response stalls past one progress tick so at least one update
    // event goes out before completion.
    let addr = start_image_server(ImagePayload {
        body: body.clone(),
        signature,
        body_delay: Duration::from_millis(1500),
        status: StatusCode::OK,
    })
    .await;

    let mut cell = TestCell::start(OPERATE_TIMEOUT).await;
    let id = Uuid::new_v4();
    cell.run(clone_request(id, "dev.clone", addr, body.len() as u64))
        .await;

    let response = cell.next_message().await;
    assert!(response.success, "create failed: {}", response.error);

    let mut saw_progress = false;
    let created = loop {
        let message = cell.next_message().await;
        match message.kind {
            MessageKind::GuestUpdatedEvent => {
                assert!(message.success);
                saw_progress = true;
            }
            MessageKind::GuestCreatedEvent => break message,
            other => panic!("unexpected message {other:?}"),
        }
    };
    assert!(saw_progress, "no progress event before completion");
    assert!(created.get_uint(ParamKey::Monitor).is_ok());

    // The system volume carries the downloaded image, grown to the
    // requested disk size.
    let group = cell.storage.find_group(id).await.unwrap().expect("group");
    let system = cell
        .pool_path
        .join(format!("{}.qcow2", group.volumes[0].name));
    let content = tokio::fs::read(&system).await.unwrap();
    assert_eq!(content.len() as u64, 1 << 20);
    assert_eq!(&content[..body.len()], &body[..]);
}

#[tokio::test]
async fn clone_failure_rolls_back_instance_storage_and_network() {
    let addr = start_image_server(ImagePayload {
        body: Vec::new(),
        signature: String::new(),
        body_delay: Duration::ZERO,
        status: StatusCode::INTERNAL_SERVER_ERROR,
    })
    .await;

    let mut cell = TestCell::start(OPERATE_TIMEOUT).await;
    let id = Uuid::new_v4();
    cell.run(clone_request(id, "dev.clone", addr, 4 << 10)).await;

    // The initial reply still reports the defined guest.
    let response = cell.next_message().await;
    assert!(response.success);

    let failure = cell.next_failed_update().await;
    assert!(!failure.error.is_empty());

    // Full rollback: no files, no port, no domain.
    assert!(cell.storage.find_group(id).await.unwrap().is_none());
    assert_eq!(cell.network.count_allocations().await.unwrap(), 0);
    assert_eq!(cell.mock.domain_count().await, 0);
    let mut entries = tokio::fs::read_dir(&cell.pool_path).await.unwrap();
    while let Some(entry) = entries.next_entry().await.unwrap() {
        let name = entry.file_name().to_string_lossy().to_string();
        assert!(
            !name.ends_with(".qcow2"),
            "volume file '{name}' left behind"
        );
    }
}

#[tokio::test]
async fn checksum_mismatch_is_corrupted_and_rolls_back() {
    let body = vec![0x5Au8; 8 << 10];
    let addr = start_image_server(ImagePayload {
        body,
        signature: "deadbeef".to_string(),
        body_delay: Duration::ZERO,
        status: StatusCode::OK,
    })
    .await;

    let mut cell = TestCell::start(OPERATE_TIMEOUT).await;
    let id = Uuid::new_v4();
    cell.run(clone_request(id, "dev.clone", addr, 8 << 10)).await;

    let response = cell.next_message().await;
    assert!(response.success);

    let failure = cell.next_failed_update().await;
    assert!(failure.error.contains("corrupted"), "error: {}", failure.error);

    assert!(cell.storage.find_group(id).await.unwrap().is_none());
    assert_eq!(cell.network.count_allocations().await.unwrap(), 0);
    assert_eq!(cell.mock.domain_count().await, 0);
}

#[tokio::test]
async fn create_disk_image_uploads_the_system_volume() {
    let addr = start_image_server(ImagePayload {
        body: Vec::new(),
        signature: String::new(),
        body_delay: Duration::ZERO,
        status: StatusCode::OK,
    })
    .await;

    let mut cell = TestCell::start(OPERATE_TIMEOUT).await;
    let id = Uuid::new_v4();
    cell.run(create_guest_request(id, "dev.export")).await;
    assert!(cell.next_message().await.success);
    cell.next_message().await;

    let mut request = instance_request(MessageKind::CreateDiskImageRequest, id);
    request.set_string(ParamKey::Image, "img-out");
    request.set_string(ParamKey::Host, addr.ip().to_string());
    request.set_uint(ParamKey::Port, u64::from(addr.port()));
    cell.run(request).await;

    let response = cell
        .next_message_of(MessageKind::CreateDiskImageResponse)
        .await;
    assert!(response.success, "upload failed: {}", response.error);
    assert_eq!(response.get_uint(ParamKey::Size).unwrap(), 1 << 20);
}

#[tokio::test]
async fn cloud_init_create_provisions_a_boot_iso_entry() {
    let mut cell = TestCell::start(OPERATE_TIMEOUT).await;
    let id = Uuid::new_v4();

    let mut request = create_guest_request(id, "dev.ci");
    request.set_string_array(
        ParamKey::Module,
        vec!["qemu".to_string(), "cloud-init".to_string()],
    );
    request.set_string(ParamKey::Secret, "hunter2".to_string());
    request.set_string(ParamKey::Path, String::new());
    request.set_uint_array(ParamKey::Flag, vec![1]);
    cell.run(request).await;

    let response = cell.next_message().await;
    // The ISO tool may be missing on the test host; in that case the
    // stage fails and everything must have been rolled back.
    if response.success {
        let group = cell.storage.find_group(id).await.unwrap().expect("group");
        assert!(group.boot_image.is_some());
        let definition = cell.mock.get_definition(id).await.unwrap();
        assert_eq!(definition.devices.disks[1].target.device, "hdb");
    } else {
        assert!(cell.storage.find_group(id).await.unwrap().is_none());
        assert_eq!(cell.network.count_allocations().await.unwrap(), 0);
    }
}

#[tokio::test]
async fn get_guest_reports_the_stored_configuration() {
    let mut cell = TestCell::start(OPERATE_TIMEOUT).await;
    let id = Uuid::new_v4();

    cell.run(create_guest_request(id, "dev.alpha")).await;
    cell.next_message().await;
    cell.next_message().await;

    cell.run(instance_request(MessageKind::GetGuestRequest, id))
        .await;
    let response = cell.next_message().await;
    assert!(response.success);
    assert_eq!(response.get_string(ParamKey::Name).unwrap(), "dev.alpha");
    assert_eq!(response.get_uint(ParamKey::Core).unwrap(), 2);
    assert_eq!(response.get_uint(ParamKey::Memory).unwrap(), 2 << 30);
    assert_eq!(response.get_string(ParamKey::Pool).unwrap(), "local");
    assert!(response.get_bool(ParamKey::Enable).unwrap());
}
