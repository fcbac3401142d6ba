//! Driver lifecycle, mode and connection tests against a scripted module.

mod common;

use common::{assert_quiet, driver, driver_with, next, recorder, MockModule};
use short_range::{
    edm, ConnHandle, ConnectionStatus, DriverConfig, ErrorKind, Mode, ModuleEvent, ModuleType,
    BleRole, BtAddress, ShortRange, ShortRangeError, SpsStatusEvent, TransportHandle,
    MAX_AT_PAYLOAD,
};
use std::collections::HashSet;
use std::time::Duration;

const PEER_ADDRESS: &str = "0012F398DD12p";

fn address() -> BtAddress {
    BtAddress::parse(PEER_ADDRESS).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_instance_lifecycle() {
    let (driver, module, _sink) = driver().await;
    let transport = module.open(1);

    let handle = driver.add(ModuleType::B1, transport).unwrap();
    assert_eq!(driver.mode(handle).unwrap(), Mode::Command);
    assert_eq!(driver.transport(handle).unwrap(), transport);
    assert_eq!(
        driver.add(ModuleType::B1, transport),
        Err(ShortRangeError::AlreadyBound(transport))
    );

    driver.attention(handle).await.unwrap();
    assert_eq!(module.commands(), vec!["AT"]);

    driver.remove(handle);
    let err = driver.attention(handle).await.unwrap_err();
    assert_eq!(err, ShortRangeError::UnknownHandle(handle));
    assert_eq!(err.kind(), ErrorKind::NotConfigured);

    // The transport is free again once its instance is gone
    let again = driver.add(ModuleType::B1, transport).unwrap();
    assert_ne!(again, handle);

    driver.deinit().await;
    assert!(!driver.is_initialized());
    assert_eq!(
        driver.attention(again).await,
        Err(ShortRangeError::NotConfigured)
    );
}

#[tokio::test(start_paused = true)]
async fn test_init_is_idempotent_and_add_requires_init() {
    let module = MockModule::new();
    let driver = ShortRange::new(module.clone());
    assert_eq!(
        driver.add(ModuleType::B1, TransportHandle(1)),
        Err(ShortRangeError::NotConfigured)
    );

    driver.init().await.unwrap();
    let handle = driver.add(ModuleType::B1, module.open(1)).unwrap();
    driver.init().await.unwrap();
    assert_eq!(driver.mode(handle).unwrap(), Mode::Command);

    // Removing something that was never added is a no-op
    driver.remove(handle);
    driver.remove(handle);
    driver.deinit().await;
    driver.deinit().await;
}

#[tokio::test(start_paused = true)]
async fn test_handles_not_reused_across_reinit() {
    let (driver, module, _sink) = driver().await;
    let first = driver.add(ModuleType::B1, module.open(1)).unwrap();
    driver.deinit().await;

    driver.init().await.unwrap();
    let second = driver.add(ModuleType::B1, TransportHandle(1)).unwrap();
    assert_ne!(first, second);
    assert_eq!(
        driver.mode(first),
        Err(ShortRangeError::UnknownHandle(first))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_handles_not_reused_when_init_races_deinit() {
    let (driver, module, _sink) = driver().await;
    let mut issued = HashSet::new();
    for round in 0..50u32 {
        let handle = driver.add(ModuleType::B1, module.open(round)).unwrap();
        assert!(issued.insert(handle), "{} issued twice", handle);

        let stopping = tokio::spawn({
            let driver = driver.clone();
            async move { driver.deinit().await }
        });
        let starting = tokio::spawn({
            let driver = driver.clone();
            async move { driver.init().await }
        });
        stopping.await.unwrap();
        starting.await.unwrap().unwrap();
        driver.init().await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_instance_slots_exhausted() {
    let config = DriverConfig {
        max_instances: 2,
        ..Default::default()
    };
    let (driver, module, _sink) = driver_with(config).await;
    driver.add(ModuleType::B1, module.open(1)).unwrap();
    driver.add(ModuleType::B1, module.open(2)).unwrap();
    assert_eq!(
        driver.add(ModuleType::B1, module.open(3)),
        Err(ShortRangeError::NoResources("instance"))
    );
}

#[tokio::test(start_paused = true)]
async fn test_invalid_config_rejected_by_init() {
    let config = DriverConfig {
        max_instances: 0,
        ..Default::default()
    };
    let driver = ShortRange::with_config(MockModule::new(), config);
    let err = driver.init().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValueOutOfRange);
    assert!(!driver.is_initialized());
}

#[tokio::test(start_paused = true)]
async fn test_sps_connection_lifecycle() {
    let (driver, module, sink) = driver().await;
    let transport = module.open(1);
    let handle = driver.add(ModuleType::B1, transport).unwrap();
    let (callback, mut events) = recorder::<SpsStatusEvent>();
    driver.set_sps_status_callback(handle, callback).unwrap();

    let conn = driver.connect_sps(handle, PEER_ADDRESS).await.unwrap();
    assert_eq!(module.commands(), vec!["AT+UDCP=sps://0012F398DD12p"]);
    let pending = driver.connection(handle, conn).unwrap().unwrap();
    assert_eq!(pending.status, ConnectionStatus::Connecting);
    assert_eq!(pending.peer, 1);

    // Sending before the link is up is refused
    assert!(matches!(
        driver.send(handle, conn, b"hi").await,
        Err(ShortRangeError::ConnectionNotReady {
            status: ConnectionStatus::Connecting,
            ..
        })
    ));

    assert!(sink.post(
        transport,
        ModuleEvent::SpsConnected {
            peer: 1,
            address: address()
        }
    ));
    let up = next(&mut events).await;
    assert_eq!(up.conn, conn);
    assert_eq!(up.status, ConnectionStatus::Connected);
    assert_eq!(up.address, address());

    driver.send(handle, conn, b"hi").await.unwrap();
    assert_eq!(module.commands().last().unwrap(), "AT+UDATW=1,6869");

    sink.post(transport, ModuleEvent::SpsDisconnected { peer: 1 });
    let down = next(&mut events).await;
    assert_eq!(down.conn, conn);
    assert_eq!(down.status, ConnectionStatus::Disconnected);
    assert!(driver.connections(handle).unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_reports_once() {
    let (driver, module, sink) = driver().await;
    let transport = module.open(1);
    let handle = driver.add(ModuleType::B1, transport).unwrap();
    let (callback, mut events) = recorder::<SpsStatusEvent>();
    driver.set_sps_status_callback(handle, callback).unwrap();

    let conn = driver.connect_sps(handle, PEER_ADDRESS).await.unwrap();
    driver.disconnect(handle, conn).await.unwrap();
    assert_eq!(module.commands().last().unwrap(), "AT+UDCPC=1");

    // The module's own report arrives late and must not be delivered twice
    sink.post(transport, ModuleEvent::SpsDisconnected { peer: 1 });
    let down = next(&mut events).await;
    assert_eq!(down.conn, conn);
    assert_eq!(down.status, ConnectionStatus::Disconnected);
    assert_quiet(&mut events).await;
    assert!(driver.connections(handle).unwrap().is_empty());

    // Unknown or already closed connections succeed without I/O
    let issued = module.commands().len();
    driver.disconnect(handle, conn).await.unwrap();
    driver.disconnect(handle, ConnHandle(99)).await.unwrap();
    assert_eq!(module.commands().len(), issued);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_on_reused_link_before_reap() {
    let (driver, module, sink) = driver().await;
    let transport = module.open(1);
    let handle = driver.add(ModuleType::B1, transport).unwrap();
    let (callback, mut events) = recorder::<SpsStatusEvent>();
    driver.set_sps_status_callback(handle, callback).unwrap();
    module.reuse_peer(0);

    let first = driver.connect_sps(handle, PEER_ADDRESS).await.unwrap();
    sink.post(
        transport,
        ModuleEvent::SpsConnected {
            peer: 0,
            address: address(),
        },
    );
    assert_eq!(next(&mut events).await.status, ConnectionStatus::Connected);

    // Reconnect while the local disconnect is still queued
    driver.disconnect(handle, first).await.unwrap();
    let second = driver.connect_sps(handle, PEER_ADDRESS).await.unwrap();
    assert_ne!(first, second);

    let down = next(&mut events).await;
    assert_eq!((down.conn, down.status), (first, ConnectionStatus::Disconnected));
    assert_quiet(&mut events).await;
    let pending = driver.connection(handle, second).unwrap().unwrap();
    assert_eq!((pending.peer, pending.status), (0, ConnectionStatus::Connecting));
    assert_eq!(driver.connection(handle, first).unwrap(), None);

    sink.post(
        transport,
        ModuleEvent::SpsConnected {
            peer: 0,
            address: address(),
        },
    );
    let up = next(&mut events).await;
    assert_eq!((up.conn, up.status), (second, ConnectionStatus::Connected));
}

#[tokio::test(start_paused = true)]
async fn test_connection_slots_exhausted() {
    let (driver, module, _sink) = driver().await;
    let handle = driver.add(ModuleType::B1, module.open(1)).unwrap();
    let max = ModuleType::B1.profile().max_connections;
    for _ in 0..max {
        driver.connect_sps(handle, PEER_ADDRESS).await.unwrap();
    }
    let issued = module.commands().len();

    assert_eq!(
        driver.connect_sps(handle, PEER_ADDRESS).await,
        Err(ShortRangeError::NoResources("connection"))
    );
    assert_eq!(module.commands().len(), issued);
    assert_eq!(driver.connections(handle).unwrap().len(), max);
}

#[tokio::test(start_paused = true)]
async fn test_connect_rejects_bad_address() {
    let (driver, module, _sink) = driver().await;
    let handle = driver.add(ModuleType::B1, module.open(1)).unwrap();
    for bad in ["", "0012F398DD1", "0012F398DD12x", "GG12F398DD12"] {
        let err = driver.connect_sps(handle, bad).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValueOutOfRange, "{:?}", bad);
    }
    assert!(module.commands().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_connect_checks_instance_and_mode_before_address() {
    let (driver, module, _sink) = driver().await;
    let handle = driver.add(ModuleType::B1, module.open(1)).unwrap();
    driver.enter_data_mode(handle).await.unwrap();

    let err = driver.connect_sps(handle, "bad").await.unwrap_err();
    assert!(matches!(err, ShortRangeError::InvalidMode { mode: Mode::Data, .. }));

    driver.remove(handle);
    let err = driver.connect_sps(handle, "bad").await.unwrap_err();
    assert_eq!(err, ShortRangeError::UnknownHandle(handle));
    assert_eq!(err.kind(), ErrorKind::NotConfigured);
}

#[tokio::test(start_paused = true)]
async fn test_failed_connect_records_nothing() {
    let (driver, module, _sink) = driver().await;
    let handle = driver.add(ModuleType::B1, module.open(1)).unwrap();
    module.fail("AT+UDCP=sps://0012F398DD12p");

    let err = driver.connect_sps(handle, PEER_ADDRESS).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AtFailure);
    assert_eq!(err.code(), -4096);
    assert!(driver.connections(handle).unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_inbound_connection_recorded() {
    let (driver, module, sink) = driver().await;
    let transport = module.open(1);
    let handle = driver.add(ModuleType::B1, transport).unwrap();
    let (callback, mut events) = recorder::<SpsStatusEvent>();
    driver.set_sps_status_callback(handle, callback).unwrap();

    sink.post(
        transport,
        ModuleEvent::SpsConnected {
            peer: 7,
            address: address(),
        },
    );
    let up = next(&mut events).await;
    assert_eq!(up.status, ConnectionStatus::Connected);

    let recorded = driver.connection(handle, up.conn).unwrap().unwrap();
    assert_eq!(recorded.peer, 7);
    assert_eq!(recorded.status, ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_data_mode_rules() {
    let (driver, module, sink) = driver().await;
    let transport = module.open(1);
    let handle = driver.add(ModuleType::B1, transport).unwrap();
    let conn = driver.connect_sps(handle, PEER_ADDRESS).await.unwrap();
    sink.post(
        transport,
        ModuleEvent::SpsConnected {
            peer: 1,
            address: address(),
        },
    );

    tokio::time::sleep(Duration::from_millis(1)).await;

    let change = driver.enter_data_mode(handle).await.unwrap();
    assert_eq!(change.mode, Mode::Data);
    assert_eq!(driver.mode(handle).unwrap(), Mode::Data);
    assert!(!module.is_attached(transport));

    // Command-mode operations are refused and leave everything untouched
    let before = driver.connections(handle).unwrap();
    for err in [
        driver.enter_data_mode(handle).await.unwrap_err(),
        driver.attention(handle).await.unwrap_err(),
        driver.connect_sps(handle, PEER_ADDRESS).await.unwrap_err(),
        driver.disconnect(handle, conn).await.unwrap_err(),
        driver.configure(handle).await.unwrap_err(),
    ] {
        assert!(matches!(err, ShortRangeError::InvalidMode { mode: Mode::Data, .. }));
        assert_eq!(err.code(), -4099);
    }
    assert_eq!(driver.connections(handle).unwrap(), before);

    // Payload waits for the stream to settle
    assert!(matches!(
        driver.send(handle, conn, b"early").await,
        Err(ShortRangeError::NotReady { .. })
    ));
    change.settle().await;
    driver.send(handle, conn, b"raw bytes").await.unwrap();
    assert_eq!(module.written(), vec![b"raw bytes".to_vec()]);
}

#[tokio::test(start_paused = true)]
async fn test_command_mode_recovery_rebinds_transport() {
    let (driver, module, sink) = driver().await;
    let transport = module.open(1);
    let handle = driver.add(ModuleType::B1, transport).unwrap();
    driver.enter_data_mode(handle).await.unwrap();

    let fresh = driver.enter_command_mode(handle).await.unwrap();
    assert_ne!(fresh, transport);
    assert_eq!(driver.transport(handle).unwrap(), fresh);
    assert_eq!(driver.mode(handle).unwrap(), Mode::Command);
    assert_eq!(module.written(), vec![b"+++".to_vec()]);
    assert_eq!(module.commands_on(fresh), vec!["AT"]);

    // Events on the dead handle no longer route
    let event = ModuleEvent::BtDisconnected { link: 0 };
    assert!(!sink.post(transport, event.clone()));
    assert!(sink.post(fresh, event));

    driver.attention(handle).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_command_mode_recovery_from_command_mode() {
    let (driver, module, _sink) = driver().await;
    let transport = module.open(1);
    let handle = driver.add(ModuleType::B1, transport).unwrap();

    let fresh = driver.enter_command_mode(handle).await.unwrap();
    assert_ne!(fresh, transport);
    assert_eq!(driver.mode(handle).unwrap(), Mode::Command);
}

#[tokio::test(start_paused = true)]
async fn test_failed_recovery_keeps_mode_and_can_be_retried() {
    let (driver, module, sink) = driver().await;
    let transport = module.open(1);
    let handle = driver.add(ModuleType::B1, transport).unwrap();
    driver.enter_data_mode(handle).await.unwrap();
    module.fail("AT");

    let err = driver.enter_command_mode(handle).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AtFailure);
    assert_eq!(driver.mode(handle).unwrap(), Mode::Data);

    // The client has retired the old handle, so the instance follows the new one
    let rebound = driver.transport(handle).unwrap();
    assert_ne!(rebound, transport);
    assert_eq!(module.commands_on(rebound), vec!["AT"]);
    let event = ModuleEvent::BtDisconnected { link: 0 };
    assert!(!sink.post(transport, event.clone()));
    assert!(sink.post(rebound, event));

    module.heal("AT");
    let fresh = driver.enter_command_mode(handle).await.unwrap();
    assert_ne!(fresh, rebound);
    assert_eq!(driver.transport(handle).unwrap(), fresh);
    assert_eq!(driver.mode(handle).unwrap(), Mode::Command);
}

#[tokio::test(start_paused = true)]
async fn test_mode_switch_timeout_keeps_mode() {
    let (driver, module, _sink) = driver().await;
    let transport = module.open(1);
    let handle = driver.add(ModuleType::B1, transport).unwrap();
    module.hang("ATO1");

    let err = driver.enter_data_mode(handle).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AtFailure);
    assert_eq!(driver.mode(handle).unwrap(), Mode::Command);
    assert!(module.is_attached(transport));
}

#[tokio::test(start_paused = true)]
async fn test_extended_data_mode_frames_payload() {
    let (driver, module, sink) = driver().await;
    let transport = module.open(1);
    let handle = driver.add(ModuleType::B1, transport).unwrap();
    let (callback, mut events) = recorder::<SpsStatusEvent>();
    driver.set_sps_status_callback(handle, callback).unwrap();

    let conn = driver.connect_sps(handle, PEER_ADDRESS).await.unwrap();
    sink.post(
        transport,
        ModuleEvent::SpsConnected {
            peer: 1,
            address: address(),
        },
    );
    next(&mut events).await;

    let change = driver.enter_extended_data_mode(handle).await.unwrap();
    assert_eq!(module.commands().last().unwrap(), "ATO2");
    change.settle().await;

    driver.send(handle, conn, b"hi").await.unwrap();
    assert_eq!(module.written(), edm::data_frames(1, b"hi").unwrap());

    assert!(matches!(
        driver.send(handle, ConnHandle(2), b"hi").await,
        Err(ShortRangeError::ConnectionNotReady { .. })
    ));

    // Command-mode operations are refused; it is left through the escape sequence
    let before = driver.connections(handle).unwrap();
    for err in [
        driver.enter_data_mode(handle).await.unwrap_err(),
        driver.attention(handle).await.unwrap_err(),
        driver.connect_sps(handle, PEER_ADDRESS).await.unwrap_err(),
        driver.disconnect(handle, conn).await.unwrap_err(),
        driver.check_ble_role(handle).await.unwrap_err(),
        driver.configure(handle).await.unwrap_err(),
    ] {
        assert!(matches!(
            err,
            ShortRangeError::InvalidMode {
                mode: Mode::ExtendedData,
                ..
            }
        ));
    }
    assert_eq!(driver.connections(handle).unwrap(), before);
    assert_eq!(driver.mode(handle).unwrap(), Mode::ExtendedData);
    driver.enter_command_mode(handle).await.unwrap();
    assert_eq!(driver.mode(handle).unwrap(), Mode::Command);
}

#[tokio::test(start_paused = true)]
async fn test_command_mode_send_size_limit() {
    let (driver, module, sink) = driver().await;
    let transport = module.open(1);
    let handle = driver.add(ModuleType::B1, transport).unwrap();
    let conn = driver.connect_sps(handle, PEER_ADDRESS).await.unwrap();
    sink.post(
        transport,
        ModuleEvent::SpsConnected {
            peer: 1,
            address: address(),
        },
    );
    tokio::time::sleep(Duration::from_millis(1)).await;

    let err = driver
        .send(handle, conn, &vec![0u8; MAX_AT_PAYLOAD + 1])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValueOutOfRange);
    driver
        .send(handle, conn, &vec![0u8; MAX_AT_PAYLOAD])
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_configure_restarts_and_drops_connections() {
    let config = DriverConfig {
        ble_role: BleRole::Central,
        ..Default::default()
    };
    let (driver, module, _sink) = driver_with(config).await;
    let handle = driver.add(ModuleType::B1, module.open(1)).unwrap();
    let (callback, mut events) = recorder::<SpsStatusEvent>();
    driver.set_sps_status_callback(handle, callback).unwrap();
    let conn = driver.connect_sps(handle, PEER_ADDRESS).await.unwrap();

    driver.configure(handle).await.unwrap();
    assert_eq!(
        module.commands()[1..].to_vec(),
        vec!["ATE0", "AT+UBTLE=1", "AT&W", "AT+CPWROFF", "AT"]
    );
    assert_eq!(driver.ble_role(handle).unwrap(), Some(BleRole::Central));

    let dropped = next(&mut events).await;
    assert_eq!(dropped.conn, conn);
    assert_eq!(dropped.status, ConnectionStatus::Disconnected);
    assert!(driver.connections(handle).unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_configure_fails_when_module_stays_silent() {
    let (driver, module, _sink) = driver().await;
    let handle = driver.add(ModuleType::B1, module.open(1)).unwrap();
    module.fail("AT");

    let err = driver.configure(handle).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AtFailure);
    let attempts = module.commands().iter().filter(|c| *c == "AT").count();
    assert_eq!(attempts, driver.config().boot_attempts as usize);
    assert_eq!(driver.ble_role(handle).unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn test_check_ble_role() {
    let (driver, module, _sink) = driver().await;
    let handle = driver.add(ModuleType::B1, module.open(1)).unwrap();
    assert_eq!(driver.ble_role(handle).unwrap(), None);

    module.set_ble_role("1");
    assert_eq!(driver.check_ble_role(handle).await.unwrap(), BleRole::Central);
    assert_eq!(driver.ble_role(handle).unwrap(), Some(BleRole::Central));

    module.set_ble_role("9");
    let err = driver.check_ble_role(handle).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AtFailure);
    assert_eq!(driver.ble_role(handle).unwrap(), Some(BleRole::Central));
}

#[test]
fn test_error_codes() {
    assert_eq!(ErrorKind::from(-4097), ErrorKind::NotConfigured);
    assert_eq!(ErrorKind::from(-4098), ErrorKind::ValueOutOfRange);
    assert_eq!(ErrorKind::InvalidMode.code(), -4099);
    assert_eq!(ShortRangeError::NotConfigured.code(), -4097);
}
