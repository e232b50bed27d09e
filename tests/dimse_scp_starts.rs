use std::path::{Path, PathBuf};
use std::sync::Arc;

use courier::storage::PassthroughAnonymizer;
use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
use dimse::{
    result_queue, DimseConfig, DimseError, DimseScu, Endpoint, ExportJob, Exporter,
    ServerState, StorageServer,
};
use serial_test::serial;
use tempfile::TempDir;
use tokio::net::TcpStream;

const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

fn ct_instance(patient_id: &str, sop_uid: &str) -> InMemDicomObject {
    let text = |tag, vr, value: &str| DataElement::new(tag, vr, PrimitiveValue::from(value));
    InMemDicomObject::from_element_iter([
        text(tags::SOP_CLASS_UID, VR::UI, CT_IMAGE_STORAGE),
        text(tags::SOP_INSTANCE_UID, VR::UI, sop_uid),
        text(tags::STUDY_DATE, VR::DA, "20240315"),
        text(tags::MODALITY, VR::CS, "CT"),
        text(tags::PATIENT_NAME, VR::PN, "DOE^JANE"),
        text(tags::PATIENT_ID, VR::LO, patient_id),
        text(tags::STUDY_INSTANCE_UID, VR::UI, "1.2.826.0.1.3680043.2.1"),
        text(tags::SERIES_INSTANCE_UID, VR::UI, "1.2.826.0.1.3680043.2.1.1"),
        text(tags::SERIES_NUMBER, VR::IS, "1"),
        text(tags::INSTANCE_NUMBER, VR::IS, "1"),
    ])
}

fn write_file(root: &Path, obj: InMemDicomObject, patient_id: &str, sop_uid: &str) -> PathBuf {
    let dir = root.join(patient_id);
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{}.dcm", sop_uid));
    obj.with_meta(
        FileMetaTableBuilder::new()
            .transfer_syntax(EXPLICIT_VR_LE)
            .media_storage_sop_class_uid(CT_IMAGE_STORAGE)
            .media_storage_sop_instance_uid(sop_uid),
    )
    .unwrap()
    .write_to_file(&path)
    .unwrap();
    path
}

fn write_instance(root: &Path, patient_id: &str, sop_uid: &str) -> PathBuf {
    write_file(root, ct_instance(patient_id, sop_uid), patient_id, sop_uid)
}

fn config() -> DimseConfig {
    DimseConfig {
        timeout_secs: 5,
        ..DimseConfig::default()
    }
}

async fn start_server(storage: &Path) -> (StorageServer, Endpoint) {
    let mut server = StorageServer::new(
        Endpoint::server("127.0.0.1", 0, "COURIER_SCP"),
        storage,
        Arc::new(PassthroughAnonymizer),
        config(),
    );
    let addr = server.start().await.expect("storage server starts");
    let remote = Endpoint::new("127.0.0.1", addr.port(), "COURIER_SCP");
    (server, remote)
}

fn calling() -> Endpoint {
    Endpoint::new("127.0.0.1", 0, "TEST_SCU")
}

/// Number of `.dcm` files below `dir`
fn stored_files(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                stored_files(&path)
            } else if path.extension().is_some_and(|ext| ext == "dcm") {
                1
            } else {
                0
            }
        })
        .sum()
}

#[tokio::test]
#[serial]
async fn dimse_scp_accepts_connections() {
    let storage = TempDir::new().unwrap();
    let (mut server, remote) = start_server(storage.path()).await;
    assert_eq!(server.state(), ServerState::Listening);

    let addr = server.local_addr().expect("bound address");
    TcpStream::connect(addr)
        .await
        .expect("listener accepts TCP connections");

    let scu = DimseScu::new(config());
    assert!(scu.echo(&calling(), &remote).await);

    server.stop(true).await;
    assert_eq!(server.state(), ServerState::Stopped);
    assert!(server.local_addr().is_none());
}

#[tokio::test]
#[serial]
async fn second_server_in_process_is_rejected() {
    let storage = TempDir::new().unwrap();
    let (mut first, _) = start_server(storage.path()).await;

    let mut second = StorageServer::new(
        Endpoint::server("127.0.0.1", 0, "OTHER_SCP"),
        storage.path(),
        Arc::new(PassthroughAnonymizer),
        config(),
    );
    assert!(matches!(second.start().await, Err(DimseError::Runtime(_))));
    assert_eq!(second.state(), ServerState::Stopped);

    first.stop(false).await;

    // the port and the process-wide slot are free again
    second.start().await.expect("starts once the first one stopped");
    second.stop(true).await;
}

#[tokio::test]
#[serial]
async fn stored_instance_lands_once_in_storage() {
    let outbox = TempDir::new().unwrap();
    let storage = TempDir::new().unwrap();
    let (mut server, remote) = start_server(storage.path()).await;

    let file = write_instance(outbox.path(), "P001", "1.2.826.0.1.3680043.2.1.1.1");
    let scu = DimseScu::new(config());

    let sent = scu
        .send_files(&calling(), &remote, vec![file.clone()])
        .await
        .expect("C-STORE succeeds");
    assert!(sent);

    // a duplicate is acknowledged but not stored again
    scu.send_files(&calling(), &remote, vec![file])
        .await
        .expect("duplicate is acknowledged");

    server.stop(true).await;

    assert_eq!(server.handler().registry().len(), 1);
    assert_eq!(stored_files(storage.path()), 1);
    assert!(storage
        .path()
        .join("P001")
        .join("1.2.826.0.1.3680043.2.1")
        .join("1.2.826.0.1.3680043.2.1.1")
        .join("1.2.826.0.1.3680043.2.1.1.1.dcm")
        .exists());
}

#[tokio::test]
#[serial]
async fn instance_missing_required_attribute_is_refused() {
    let outbox = TempDir::new().unwrap();
    let storage = TempDir::new().unwrap();
    let (mut server, remote) = start_server(storage.path()).await;

    let mut obj = ct_instance("P002", "1.2.826.0.1.3680043.2.1.1.2");
    obj.remove_element(tags::MODALITY);
    let file = write_file(outbox.path(), obj, "P002", "1.2.826.0.1.3680043.2.1.1.2");

    let scu = DimseScu::new(config());
    let result = scu.send_files(&calling(), &remote, vec![file]).await;

    server.stop(true).await;

    let err = result.expect_err("the SCP refuses the instance");
    assert_eq!(err.status(), Some(0x0120));
    assert!(server.handler().registry().is_empty());
    assert_eq!(stored_files(storage.path()), 0);
}

#[tokio::test]
#[serial]
async fn export_sends_every_stored_file() {
    let outbox = TempDir::new().unwrap();
    let storage = TempDir::new().unwrap();
    let (mut server, remote) = start_server(storage.path()).await;

    for (patient, sop) in [
        ("P1", "1.2.826.0.1.3680043.2.1.1.10"),
        ("P1", "1.2.826.0.1.3680043.2.1.1.11"),
        ("P2", "1.2.826.0.1.3680043.2.1.1.20"),
    ] {
        write_instance(outbox.path(), patient, sop);
    }

    let job = ExportJob {
        patient_ids: vec!["P1".into(), "P2".into()],
        storage_root: outbox.path().to_path_buf(),
        source: calling(),
        destination: remote,
    };

    let (queue, mut events) = result_queue();
    let handle = Exporter::new(config()).export_patients(job, queue);
    let summary = handle.wait().await.expect("export finishes");

    let mut seen = 0;
    while events.try_recv().is_ok() {
        seen += 1;
    }

    server.stop(true).await;

    assert!(!summary.aborted);
    assert_eq!(summary.files_to_send, 3);
    assert_eq!(summary.files_sent, 3);
    assert_eq!(summary.errors, 0);
    assert_eq!(summary.patients_completed, 2);
    assert!(seen >= 2);
    assert_eq!(stored_files(storage.path()), 3);
}
