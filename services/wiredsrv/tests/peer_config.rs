#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use device_model::{DeviceDescription, ParamValue, ParameterSetKind};
use wiredsrv::bootstrap::persist_peers;
use wiredsrv::core::transport::MockBus;
use wiredsrv::core::ConfigurationBlock;
use wiredsrv::{
    BusPacket, BusTimings, ItemOutcome, LinkPeer, PeerRepository, WiredBus, WiredError, WiredPeer,
};

const CENTRAL: u32 = 0x0000_0001;
const DEVICE: u32 = 0x0000_0042;

fn description() -> Arc<DeviceDescription> {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/hbw_switch.xml");
    Arc::new(device_model::xml::from_file(&path).unwrap())
}

fn bound_peer() -> (Arc<MockBus>, WiredPeer) {
    let mock = Arc::new(MockBus::new());
    mock.add_device(DEVICE, 256);
    let bus = Arc::new(WiredBus::new(mock.clone(), CENTRAL, BusTimings::fast()));
    bus.start();
    let peer = WiredPeer::new(12, DEVICE, "JEQ0004711", description(), bus);
    (mock, peer)
}

fn values(items: &[(&str, ParamValue)]) -> BTreeMap<String, ParamValue> {
    items
        .iter()
        .map(|(id, value)| (id.to_string(), value.clone()))
        .collect()
}

#[tokio::test]
async fn test_master_values_reach_device_memory() {
    let (mock, peer) = bound_peer();

    let report = peer
        .put_paramset(
            0,
            ParameterSetKind::Master,
            None,
            values(&[
                ("LOGGING_TIME", ParamValue::Float(2.5)),
                ("REPORT_INTERVAL", ParamValue::Integer(4660)),
                ("NO_SUCH_PARAMETER", ParamValue::Integer(1)),
            ]),
        )
        .await
        .unwrap();

    assert_eq!(report.outcome("LOGGING_TIME"), Some(&ItemOutcome::Ok));
    assert_eq!(report.outcome("REPORT_INTERVAL"), Some(&ItemOutcome::Ok));
    assert_eq!(
        report.outcome("NO_SUCH_PARAMETER"),
        Some(&ItemOutcome::UnknownParameter)
    );
    assert!(!report.all_ok());

    // REPORT_INTERVAL straddles the first two blocks
    let eeprom = mock.eeprom(DEVICE).unwrap();
    assert_eq!(eeprom[0x01], 25);
    assert_eq!(eeprom[0x0F], 0x12);
    assert_eq!(eeprom[0x10], 0x34);
    assert!(peer.dirty_blocks().await.is_empty());

    let read = peer
        .get_paramset(0, ParameterSetKind::Master, None)
        .await
        .unwrap();
    assert_eq!(read.get("LOGGING_TIME"), Some(&ParamValue::Float(2.5)));
    assert_eq!(read.get("REPORT_INTERVAL"), Some(&ParamValue::Integer(4660)));
    assert!(!read.contains_key("CENTRAL_ADDRESS"));
}

#[tokio::test]
async fn test_channel_master_uses_record_addressing() {
    let (mock, peer) = bound_peer();

    let report = peer
        .put_paramset(
            2,
            ParameterSetKind::Master,
            None,
            values(&[("LOCKED", ParamValue::Boolean(true))]),
        )
        .await
        .unwrap();
    assert!(report.all_ok());

    // record 2 starts at 0x32, LOCKED sits in bits 2..5
    let eeprom = mock.eeprom(DEVICE).unwrap();
    assert_eq!(eeprom[0x32], 0xC7);
    assert_eq!(eeprom[0x30], 0xFF);
}

#[tokio::test]
async fn test_config_interface_is_not_flushed_with_the_batch() {
    let (mock, peer) = bound_peer();

    let report = peer
        .put_paramset(
            0,
            ParameterSetKind::Master,
            None,
            values(&[("LED_MODE", ParamValue::Integer(2))]),
        )
        .await
        .unwrap();
    assert!(report.all_ok());
    assert_eq!(mock.eeprom(DEVICE).unwrap()[0x20], 0xFF);
    assert!(peer.dirty_blocks().await.contains(&0x20));

    assert_eq!(peer.flush().await.unwrap(), 1);
    assert_eq!(mock.eeprom(DEVICE).unwrap()[0x20], 2);
    assert!(peer.dirty_blocks().await.is_empty());
}

#[tokio::test]
async fn test_link_parameters_follow_the_link_record() {
    let (mock, peer) = bound_peer();
    let link = LinkPeer {
        remote_id: 77,
        remote_channel: 3,
        config_address: 0x88,
    };
    peer.add_link(1, link).await.unwrap();
    assert_eq!(peer.links(1).await, vec![link]);

    let report = peer
        .put_paramset(
            1,
            ParameterSetKind::Link,
            Some((77, 3)),
            values(&[
                ("ACTION_TYPE", ParamValue::Integer(0)),
                ("ON_TIME", ParamValue::Float(1.5)),
            ]),
        )
        .await
        .unwrap();
    assert!(report.all_ok());

    let eeprom = mock.eeprom(DEVICE).unwrap();
    assert_eq!(eeprom[0x8D], 0xFC);
    assert_eq!(eeprom[0x8E], 15);

    let read = peer
        .get_paramset(1, ParameterSetKind::Link, Some((77, 3)))
        .await
        .unwrap();
    assert_eq!(read.get("ACTION_TYPE"), Some(&ParamValue::Integer(0)));
    assert_eq!(read.get("ON_TIME"), Some(&ParamValue::Float(1.5)));

    let err = peer
        .get_paramset(1, ParameterSetKind::Link, Some((78, 1)))
        .await
        .unwrap_err();
    assert!(matches!(err, WiredError::NotPaired { remote_id: 78, .. }));
}

#[tokio::test]
async fn test_command_value_sends_set_request() {
    let (mock, peer) = bound_peer();

    peer.set_value(2, "STATE", ParamValue::Boolean(true)).await.unwrap();
    let sent = mock.messages_to(DEVICE);
    assert_eq!(sent.last().unwrap().payload, vec![b'x', 0x01, 200]);
    assert_eq!(peer.get_value(2, "STATE").await.unwrap(), ParamValue::Boolean(true));

    peer.set_value(2, "TOGGLE_STATE", ParamValue::Boolean(true))
        .await
        .unwrap();
    let sent = mock.messages_to(DEVICE);
    assert_eq!(sent.last().unwrap().payload, vec![b'x', 0x01, 0]);
    assert_eq!(peer.get_value(2, "STATE").await.unwrap(), ParamValue::Boolean(false));
    // channel 1 was never touched
    assert_eq!(peer.get_value(1, "STATE").await.unwrap(), ParamValue::Boolean(false));
}

#[tokio::test]
async fn test_event_frame_updates_values() {
    let (_mock, peer) = bound_peer();

    let packet = BusPacket::message(DEVICE, CENTRAL, vec![b'i', 0x00, 0xC8]);
    let updates = peer.handle_event(&packet).await.unwrap();
    assert_eq!(
        updates,
        vec![(1, "STATE".to_string(), ParamValue::Boolean(true))]
    );
    assert_eq!(peer.get_value(1, "STATE").await.unwrap(), ParamValue::Boolean(true));

    let unknown = BusPacket::message(DEVICE, CENTRAL, vec![b'?', 0x00]);
    assert!(peer.handle_event(&unknown).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_flush_reports_communication_failure() {
    let (mock, peer) = bound_peer();
    peer.restore_blocks(vec![ConfigurationBlock {
        address: 0x00,
        data: vec![0xFF; 16],
        dirty: false,
        storage_id: None,
    }])
    .await;
    mock.set_silent(DEVICE, true);

    let report = peer
        .put_paramset(
            0,
            ParameterSetKind::Master,
            None,
            values(&[("LOGGING_TIME", ParamValue::Float(1.0))]),
        )
        .await
        .unwrap();
    assert!(matches!(
        report.outcome("LOGGING_TIME"),
        Some(ItemOutcome::CommunicationFailure(_))
    ));
    assert!(peer.dirty_blocks().await.contains(&0x00));

    let read = peer.get_paramset(0, ParameterSetKind::Values, None).await.unwrap();
    assert_eq!(read.get("UNREACH"), Some(&ParamValue::Boolean(true)));
}

#[tokio::test]
async fn test_slots_and_blocks_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let repository = PeerRepository::new(dir.path().join("wired.db")).await.unwrap();

    let (_mock, peer) = bound_peer();
    peer.set_value(1, "INHIBIT", ParamValue::Boolean(true)).await.unwrap();
    peer.put_paramset(
        0,
        ParameterSetKind::Master,
        None,
        values(&[("LOGGING_TIME", ParamValue::Float(2.5))]),
    )
    .await
    .unwrap();
    repository.save_peer(&peer).await.unwrap();

    let (_mock, restarted) = bound_peer();
    let (blocks, slots) = repository.restore_peer(&restarted).await.unwrap();
    assert_eq!(blocks, 1);
    assert!(slots >= 1);
    assert_eq!(
        restarted.get_value(1, "INHIBIT").await.unwrap(),
        ParamValue::Boolean(true)
    );
    let cached = restarted.snapshot_blocks().await;
    assert_eq!(cached[0].address, 0x00);
    assert_eq!(cached[0].data[0x01], 25);
}

#[tokio::test]
async fn test_shutdown_flushes_pending_configuration() {
    let repository = PeerRepository::in_memory().await.unwrap();
    let (mock, peer) = bound_peer();
    peer.put_paramset(
        0,
        ParameterSetKind::Master,
        None,
        values(&[("LED_MODE", ParamValue::Integer(2))]),
    )
    .await
    .unwrap();

    let peers = vec![Arc::new(peer)];
    assert_eq!(persist_peers(&repository, &peers).await, 1);
    assert_eq!(mock.eeprom(DEVICE).unwrap()[0x20], 2);
    let stored = repository.load_blocks(12).await.unwrap();
    assert!(stored.iter().all(|block| !block.dirty));
}

#[tokio::test]
async fn test_pending_configuration_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let repository = PeerRepository::new(dir.path().join("wired.db")).await.unwrap();

    let (mock, peer) = bound_peer();
    peer.put_paramset(
        0,
        ParameterSetKind::Master,
        None,
        values(&[("LED_MODE", ParamValue::Integer(2))]),
    )
    .await
    .unwrap();
    // the device is gone by the time the service stops
    mock.set_silent(DEVICE, true);
    let peers = vec![Arc::new(peer)];
    assert_eq!(persist_peers(&repository, &peers).await, 1);
    assert_eq!(mock.eeprom(DEVICE).unwrap()[0x20], 0xFF);

    let (mock, restarted) = bound_peer();
    repository.restore_peer(&restarted).await.unwrap();
    assert!(restarted.dirty_blocks().await.contains(&0x20));

    assert_eq!(restarted.flush().await.unwrap(), 1);
    assert_eq!(mock.eeprom(DEVICE).unwrap()[0x20], 2);
    assert!(restarted.dirty_blocks().await.is_empty());
}

#[tokio::test]
async fn test_disposed_peer_rejects_operations() {
    let (_mock, peer) = bound_peer();
    peer.dispose();
    assert!(peer.is_disposing());
    assert!(matches!(
        peer.get_paramset(0, ParameterSetKind::Master, None).await,
        Err(WiredError::Disposing)
    ));
    assert!(matches!(
        peer.set_value(1, "STATE", ParamValue::Boolean(true)).await,
        Err(WiredError::Disposing)
    ));
}
