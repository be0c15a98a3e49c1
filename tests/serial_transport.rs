//! Serial-framed transports driven end to end over in-memory streams.
//!
//! A `tokio::io::duplex` pair stands in for the serial port; the far end is a
//! small fake instrument or Prologix controller task.

use async_trait::async_trait;
use bytes::Bytes;
use daq_comm::transport::modbus::{self, ModbusClient, WordOrder};
use daq_comm::transport::prologix::PrologixLink;
use daq_comm::transport::{MockBackend, MockCall, MockReply, SerialLink};
use daq_comm::{
    Address, Backend, BackendKind, ChannelMediator, Link, ReadUntil, RetryPolicy, Session,
    TransportSettings,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;

fn settings() -> TransportSettings {
    TransportSettings::default()
        .with_timeout(Duration::from_secs(1))
        .with_inter_command_delay(Duration::ZERO)
}

fn address(raw: &str) -> Address {
    Address::parse(raw).unwrap()
}

/// Read CR-terminated commands from `device` until the host hangs up.
async fn read_command(reader: &mut BufReader<tokio::io::ReadHalf<DuplexStream>>) -> Option<String> {
    let mut line = Vec::new();
    match reader.read_until(b'\r', &mut line).await {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(String::from_utf8_lossy(&line).trim().to_string()),
    }
}

// =============================================================================
// Fake Prologix controller
// =============================================================================

/// Answers `++read eoi` with `<gpib address>.5`, logging every command.
async fn run_controller(device: DuplexStream, log: Arc<Mutex<Vec<String>>>) {
    let (reader, mut writer) = tokio::io::split(device);
    let mut reader = BufReader::new(reader);
    let mut current = 0u32;

    while let Some(command) = read_command(&mut reader).await {
        log.lock().unwrap().push(command.clone());
        if let Some(n) = command.strip_prefix("++addr ") {
            current = n.parse().unwrap_or(0);
        } else if command == "++read eoi" {
            let reply = format!("{}.5\n", current);
            if writer.write_all(reply.as_bytes()).await.is_err() {
                break;
            }
        }
    }
}

#[derive(Debug, Default, Clone)]
struct FakeController {
    log: Arc<Mutex<Vec<String>>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl FakeController {
    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    async fn finished(&self) {
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            task.await.unwrap();
        }
    }
}

#[async_trait]
impl Backend for FakeController {
    fn kind(&self) -> BackendKind {
        BackendKind::Prologix
    }

    async fn open(
        &self,
        locator: &str,
        settings: &TransportSettings,
    ) -> anyhow::Result<Box<dyn Link>> {
        let (host, device) = tokio::io::duplex(1024);
        let task = tokio::spawn(run_controller(device, self.log.clone()));
        self.tasks.lock().unwrap().push(task);

        let serial = SerialLink::new(Box::new(host), settings.clone(), locator);
        Ok(Box::new(PrologixLink::initialize(serial, Duration::ZERO).await?))
    }
}

#[tokio::test]
async fn prologix_sessions_share_one_controller() {
    let controller = FakeController::default();
    let mediator = Arc::new(ChannelMediator::new());
    let session_for = |raw: &str| {
        Session::new(
            address(raw),
            Arc::new(controller.clone()),
            settings(),
            RetryPolicy::immediate(),
            mediator.clone(),
        )
    };
    let smu = session_for("COM8::5");
    let dmm = session_for("COM8::9");
    smu.open().await.unwrap();
    dmm.open().await.unwrap();
    assert_eq!(mediator.channel_count(), 1);

    assert_eq!(smu.query("MEAS?", None).await.unwrap().text(), "5.5");
    assert_eq!(dmm.query("MEAS?", None).await.unwrap().text(), "9.5");
    // Same instrument again: no re-addressing
    assert_eq!(dmm.query("MEAS?", None).await.unwrap().text(), "9.5");

    smu.close().await.unwrap();
    dmm.close().await.unwrap();
    controller.finished().await;

    assert_eq!(
        controller.log(),
        vec![
            "++rst", "++mode 1", "++auto 0", //
            "++addr 5", "MEAS?", "++read eoi", //
            "++addr 9", "MEAS?", "++read eoi", //
            "MEAS?", "++read eoi", //
            "++addr 5", "++clr", "++loc", //
            "++addr 9", "++clr", "++loc",
        ]
    );
}

#[tokio::test]
async fn prologix_rejects_unattached_instrument() {
    let (host, device) = tokio::io::duplex(1024);
    let log = Arc::new(Mutex::new(Vec::new()));
    let controller = tokio::spawn(run_controller(device, log.clone()));

    let serial = SerialLink::new(Box::new(host), settings(), "COM8");
    let mut link = PrologixLink::initialize(serial, Duration::ZERO).await.unwrap();
    link.attach(&address("COM8::5")).await.unwrap();

    let err = link.write(&address("COM8::12"), b"*RST").await.unwrap_err();
    assert!(err.to_string().contains("not connected"));
    assert!(link.write(&address("COM8::40"), b"*RST").await.is_err());

    link.write(&address("COM8::5"), b"VOLT +1").await.unwrap();
    assert_eq!(link.devices(), &[5]);

    link.close().await.unwrap();
    controller.await.unwrap();

    let log = log.lock().unwrap().clone();
    assert_eq!(log[..4], ["++rst", "++mode 1", "++auto 0", "++addr 5"]);
    // '+' in instrument data travels escaped
    assert_eq!(log[4].as_bytes(), b"VOLT \x1b+1");
}

// =============================================================================
// Plain serial instrument
// =============================================================================

#[derive(Debug, Default, Clone)]
struct EchoInstrument {
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

/// Replies `ECHO <command>` to every command ending in `?`.
async fn run_echo(device: DuplexStream) {
    let (reader, mut writer) = tokio::io::split(device);
    let mut reader = BufReader::new(reader);
    while let Some(command) = read_command(&mut reader).await {
        if command.ends_with('?') {
            let reply = format!("ECHO {}\n", command);
            if writer.write_all(reply.as_bytes()).await.is_err() {
                break;
            }
        }
    }
}

#[async_trait]
impl Backend for EchoInstrument {
    fn kind(&self) -> BackendKind {
        BackendKind::Serial
    }

    async fn open(
        &self,
        locator: &str,
        settings: &TransportSettings,
    ) -> anyhow::Result<Box<dyn Link>> {
        let (host, device) = tokio::io::duplex(1024);
        self.tasks.lock().unwrap().push(tokio::spawn(run_echo(device)));
        Ok(Box::new(SerialLink::new(Box::new(host), settings.clone(), locator)))
    }
}

#[tokio::test]
async fn serial_session_round_trip() {
    let instrument = EchoInstrument::default();
    let session = Session::new(
        address("/dev/ttyUSB0"),
        Arc::new(instrument.clone()),
        settings(),
        RetryPolicy::immediate(),
        Arc::new(ChannelMediator::new()),
    );
    session.open().await.unwrap();

    session.write("*RST", None).await.unwrap();
    let reply = session.query("*IDN?", None).await.unwrap();
    assert_eq!(reply.text(), "ECHO *IDN?");

    session.close().await.unwrap();
    let tasks: Vec<_> = instrument.tasks.lock().unwrap().drain(..).collect();
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn serial_silence_escalates_to_communication_lost() {
    let instrument = EchoInstrument::default();
    let session = Session::new(
        address("/dev/ttyUSB0"),
        Arc::new(instrument.clone()),
        settings().with_timeout(Duration::from_millis(10)),
        RetryPolicy::immediate(),
        Arc::new(ChannelMediator::new()),
    );
    session.open().await.unwrap();

    // Commands without '?' get no reply, so every read times out
    let err = session.query("VOLT 1", None).await.unwrap_err();
    assert!(err.is_fatal());
    assert!(err.to_string().contains("timed out"));
    // Initial link plus the reconnect
    assert_eq!(instrument.tasks.lock().unwrap().len(), 2);
}

/// Replies `<command without ?>` to every query; the first reply arrives
/// `first_delay` late.
async fn run_slow_starter(device: DuplexStream, first_delay: Duration) {
    let (reader, mut writer) = tokio::io::split(device);
    let mut reader = BufReader::new(reader);
    let mut first = true;
    while let Some(command) = read_command(&mut reader).await {
        if first {
            first = false;
            tokio::time::sleep(first_delay).await;
        }
        let reply = format!("{}\n", command.trim_end_matches('?'));
        if writer.write_all(reply.as_bytes()).await.is_err() {
            break;
        }
    }
}

#[derive(Debug, Clone)]
struct SlowStarter {
    first_delay: Duration,
}

#[async_trait]
impl Backend for SlowStarter {
    fn kind(&self) -> BackendKind {
        BackendKind::Serial
    }

    async fn open(
        &self,
        locator: &str,
        settings: &TransportSettings,
    ) -> anyhow::Result<Box<dyn Link>> {
        let (host, device) = tokio::io::duplex(1024);
        tokio::spawn(run_slow_starter(device, self.first_delay));
        Ok(Box::new(SerialLink::new(Box::new(host), settings.clone(), locator)))
    }
}

#[tokio::test]
async fn late_reply_is_not_taken_by_the_next_query() {
    let session = Session::new(
        address("/dev/ttyUSB1"),
        Arc::new(SlowStarter {
            first_delay: Duration::from_millis(60),
        }),
        settings().with_timeout(Duration::from_millis(40)),
        RetryPolicy::immediate(),
        Arc::new(ChannelMediator::new()),
    );
    session.open().await.unwrap();

    let volt = session.query("VOLT?", None).await.unwrap();
    let curr = session.query("CURR?", None).await.unwrap();
    let again = session.query("VOLT?", None).await.unwrap();

    assert_eq!(volt.text(), "VOLT");
    assert_eq!(curr.text(), "CURR");
    assert_eq!(again.text(), "VOLT");
    assert_eq!(session.stats().failed_attempts, 1);
    assert_eq!(session.stats().reconnects, 0);
}

// =============================================================================
// Modbus through a session
// =============================================================================

fn modbus_session(mock: &MockBackend, raw: &str) -> Session {
    Session::new(
        address(raw),
        Arc::new(mock.clone()),
        settings(),
        RetryPolicy::immediate(),
        Arc::new(ChannelMediator::new()),
    )
}

#[tokio::test]
async fn modbus_corrupt_frame_is_retried() {
    let good = modbus::seal(vec![0x02, 0x03, 0x04, 0x41, 0x20, 0x00, 0x00]);
    let mut corrupt = good.clone();
    corrupt[4] ^= 0x01;

    let mock = MockBackend::new()
        .with_kind(BackendKind::Modbus)
        .with_script([MockReply::Data(Bytes::from(corrupt)), MockReply::Data(Bytes::from(good))]);
    let session = modbus_session(&mock, "COM4::2");
    session.open().await.unwrap();
    let client = ModbusClient::new(session.clone()).unwrap();

    let value = client.read_float(0x0000, WordOrder::HighFirst).await.unwrap();

    assert_eq!(value, 10.0);
    assert_eq!(mock.read_count(), 2);
    assert_eq!(session.stats().failed_attempts, 1);
    // The retry resends the identical request frame
    let request = modbus::read_holding_request(2, 0x0000, 2);
    let writes: Vec<Vec<u8>> = mock
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            MockCall::Write(_, payload) => Some(payload),
            _ => None,
        })
        .collect();
    assert_eq!(writes, vec![request.clone(), request]);
}

#[tokio::test]
async fn modbus_write_register_checks_echo() {
    let echo = modbus::write_single_request(3, 0x0010, 500);
    let mock = MockBackend::new()
        .with_kind(BackendKind::Modbus)
        .with_script([MockReply::Data(Bytes::from(echo.clone()))]);
    let session = modbus_session(&mock, "COM4::3");
    session.open().await.unwrap();

    let client = ModbusClient::new(session).unwrap();
    client.write_register(0x0010, 500).await.unwrap();
    assert_eq!(mock.read_count(), 1);
}

#[tokio::test]
async fn modbus_write_float_spans_two_registers() {
    let echo = modbus::seal(vec![0x05, 0x10, 0x00, 0x20, 0x00, 0x02]);
    let mock = MockBackend::new()
        .with_kind(BackendKind::Modbus)
        .with_script([MockReply::Data(Bytes::from(echo))]);
    let session = modbus_session(&mock, "COM4::5");
    session.open().await.unwrap();

    let client = ModbusClient::new(session).unwrap();
    client.write_float(0x0020, 10.0, WordOrder::HighFirst).await.unwrap();

    let written = mock
        .calls()
        .into_iter()
        .find_map(|call| match call {
            MockCall::Write(_, payload) => Some(payload),
            _ => None,
        })
        .unwrap();
    // slave, function, start, count, byte count, 0x4120 0x0000
    assert_eq!(
        &written[..11],
        &[0x05, 0x10, 0x00, 0x20, 0x00, 0x02, 0x04, 0x41, 0x20, 0x00, 0x00]
    );
}

#[tokio::test]
async fn modbus_client_needs_slave_id() {
    let mock = MockBackend::new().with_kind(BackendKind::Modbus);
    assert!(ModbusClient::new(modbus_session(&mock, "COM4")).is_err());
    assert!(ModbusClient::new(modbus_session(&mock, "COM4::0")).is_err());
    assert!(ModbusClient::new(modbus_session(&mock, "COM4::248")).is_err());
    assert_eq!(ModbusClient::new(modbus_session(&mock, "COM4::17")).unwrap().slave(), 17);
}

#[tokio::test]
async fn read_until_length_passes_binary_through_session() {
    let mock = MockBackend::new().with_script([MockReply::Data(Bytes::from_static(&[0, 0x0A, 0]))]);
    let session = modbus_session(&mock, "COM4");
    session.open().await.unwrap();

    let response = session
        .read_until(ReadUntil::Length(3), Some(&daq_comm::Validator::length(3)))
        .await
        .unwrap();
    assert_eq!(&response.bytes()[..], &[0, 0x0A, 0]);
}
