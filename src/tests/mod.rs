use insta::assert_debug_snapshot;

use crate::driver::fake::FakeDriver;
use crate::driver::ObjectKind;
use crate::mode::test_mode;
use crate::transaction::TransactionState;
use crate::{CommitFlags, KmsDevice};

#[test]
fn configure_commit_reconfigure() {
    let driver = FakeDriver::reference();
    let device = KmsDevice::new(&driver).unwrap();

    let mode_a = test_mode(1920, 1080, 60, true);
    device.configure(10, 20, 30, &mode_a).unwrap();
    let b1 = device.selection().unwrap().mode_blob_id;

    let mut txn = device.new_transaction();
    let mut flags = CommitFlags::empty();
    txn.stage_modeset_properties(&mut flags).unwrap();
    txn.commit(flags, 7).unwrap();
    assert_eq!(txn.state(), TransactionState::Committed);

    let commits = driver.commits();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].entries.len(), 3);
    assert_eq!(commits[0].flags, CommitFlags::ALLOW_MODESET);
    assert_eq!(commits[0].user_data, 7);

    let mode_b = test_mode(1280, 720, 60, false);
    device.configure(10, 20, 30, &mode_b).unwrap();
    let b2 = device.selection().unwrap().mode_blob_id;

    assert_ne!(b1, b2);
    assert_eq!(driver.destroyed_blobs(), [b1]);
    assert_eq!(driver.live_blobs(), [b2]);
    assert_eq!(driver.blob_data(b2).unwrap(), mode_b.as_bytes());

    device.close().unwrap();
    assert!(driver.live_blobs().is_empty());
}

#[test]
fn modeset_writes() {
    let driver = FakeDriver::reference();
    let device = KmsDevice::new(&driver).unwrap();
    device
        .configure(10, 20, 30, &test_mode(1920, 1080, 60, true))
        .unwrap();

    let mut txn = device.new_transaction();
    let mut flags = CommitFlags::NONBLOCK;
    txn.stage_modeset_properties(&mut flags).unwrap();
    txn.put_plane_property(40, "FB_ID", 55).unwrap();
    txn.commit(flags, 0).unwrap();

    let entries: Vec<_> = driver.commits()[0]
        .entries
        .iter()
        .map(|e| (e.object, e.property, e.value))
        .collect();
    assert_debug_snapshot!(entries, @r"
    [
        (
            10,
            1000,
            30,
        ),
        (
            30,
            1001,
            1,
        ),
        (
            30,
            1002,
            1,
        ),
        (
            40,
            1003,
            55,
        ),
    ]
    ");
    assert_eq!(
        driver.commits()[0].flags,
        CommitFlags::NONBLOCK | CommitFlags::ALLOW_MODESET
    );
}

#[test]
fn catalog_matches_driver() {
    let driver = FakeDriver::reference();
    let device = KmsDevice::new(&driver).unwrap();
    let catalog = device.catalog();

    for kind in ObjectKind::ALL {
        assert_eq!(catalog.objects(kind).len(), 1);
        let object = &catalog.objects(kind)[0];
        assert_eq!(object.kind(), kind);

        let ids: Vec<_> = object.properties.iter().map(|p| p.id).collect();
        assert_eq!(ids, driver.object_property_ids(kind, object.id));
    }
}
