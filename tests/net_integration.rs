//! Integration tests for the network backend.
//!
//! A small fake `saned` runs on a loopback listener and answers the
//! procedures the client uses: INIT, GET_DEVICES, OPEN (with optional
//! authorization), GET_OPTION_DESCRIPTORS, CONTROL_OPTION, GET_PARAMETERS,
//! START with a data connection, CANCEL, CLOSE and EXIT.
//!
//! # Running
//!
//! ```bash
//! cargo test --test net_integration -- --nocapture
//! ```

use std::io::{BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

use md5::{Digest, Md5};
use pretty_assertions::assert_eq;
use sane_client::backend::{OptionDescriptor, RawConstraint};
use sane_client::net::wire::{encode_option_descriptor, WireReader, WireWriter};
use sane_client::net::{Procedure, BYTE_ORDER_LITTLE_ENDIAN, END_OF_DATA, VERSION_CODE};
use sane_client::options::Capabilities;
use sane_client::{
    CredentialStore, Device, DeviceAuthentication, NetBackend, NewValue, OptionValue, Sane,
    SaneConfig, SaneError, SaneHost, StandardOption, Status,
};
use tokio::sync::mpsc;

const MODE_SIZE: usize = 16;
const STATUS_GOOD: i32 = 0;
const STATUS_INVALID: i32 = 4;
const STATUS_EOF: u8 = 5;
const STATUS_ACCESS_DENIED: i32 = 11;
const TYPE_STRING: i32 = 3;
const SALT: &str = "0123456789";

/// Image served by the fake scanner: 4x3 gray, one byte per pixel.
const IMAGE: [u8; 12] = [0, 10, 20, 30, 40, 50, 60, 70, 80, 90, 100, 110];

// =============================================================================
// Fake saned
// =============================================================================

struct ServerState {
    credentials: Option<(String, String)>,
    resolution: i32,
    mode: String,
}

struct FakeSaned {
    port: u16,
    log: Arc<Mutex<Vec<String>>>,
}

impl FakeSaned {
    fn spawn(credentials: Option<(&str, &str)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let log = Arc::new(Mutex::new(Vec::new()));
        let server_log = Arc::clone(&log);
        let mut state = ServerState {
            credentials: credentials.map(|(u, p)| (u.to_string(), p.to_string())),
            resolution: 150,
            mode: "Gray".to_string(),
        };
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                // A client hanging up mid-request only ends that connection.
                let _ = serve(stream, &mut state, &server_log);
            }
        });
        Self { port, log }
    }

    fn host(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    fn config(&self) -> SaneConfig {
        SaneConfig {
            hosts: vec![SaneHost::new(self.host())],
            timeout_secs: 5,
            ..SaneConfig::default()
        }
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.log().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

fn descriptors() -> Vec<OptionDescriptor> {
    let rw = Capabilities::SOFT_SELECT | Capabilities::SOFT_DETECT;
    vec![
        OptionDescriptor {
            name: Some(String::new()),
            title: Some("Number of options".into()),
            description: None,
            value_type: 1,
            unit: 0,
            size: 4,
            capabilities: Capabilities::SOFT_DETECT,
            constraint: RawConstraint::None,
        },
        OptionDescriptor {
            name: Some("resolution".into()),
            title: Some("Scan resolution".into()),
            description: Some("Sets the resolution of the scanned image.".into()),
            value_type: 1,
            unit: 4,
            size: 4,
            capabilities: rw,
            constraint: RawConstraint::Range {
                min: 75,
                max: 600,
                quant: 0,
            },
        },
        OptionDescriptor {
            name: Some("mode".into()),
            title: Some("Scan mode".into()),
            description: None,
            value_type: TYPE_STRING,
            unit: 0,
            size: MODE_SIZE as i32,
            capabilities: rw | Capabilities::AUTOMATIC,
            constraint: RawConstraint::StringList(vec!["Gray".into(), "Color".into()]),
        },
    ]
}

fn send(writer: &mut TcpStream, reply: WireWriter) -> std::io::Result<()> {
    writer.write_all(&reply.finish())?;
    writer.flush()
}

fn padded(value: &str, size: usize) -> Vec<u8> {
    let mut bytes = value.as_bytes().to_vec();
    bytes.resize(size, 0);
    bytes
}

fn serve(
    stream: TcpStream,
    state: &mut ServerState,
    log: &Mutex<Vec<String>>,
) -> sane_client::Result<()> {
    let mut writer = stream.try_clone()?;
    let mut reader = WireReader::new(BufReader::new(stream));
    let record = |entry: String| log.lock().unwrap().push(entry);

    loop {
        let Ok(code) = reader.word() else {
            return Ok(());
        };
        match Procedure::from_code(code) {
            Some(Procedure::Init) => {
                let _version = reader.word()?;
                let user = reader.string()?.unwrap_or_default();
                record(format!("INIT {}", user));
                send(&mut writer, WireWriter::new().word(STATUS_GOOD).word(VERSION_CODE))?;
            }
            Some(Procedure::GetDevices) => {
                record("GET_DEVICES".into());
                let reply = WireWriter::new()
                    .word(STATUS_GOOD)
                    .word(2)
                    .word(0)
                    .string(Some("fake:0"))
                    .string(Some("Acme"))
                    .string(Some("Flatbed 9000"))
                    .string(Some("flatbed scanner"))
                    .word(1);
                send(&mut writer, reply)?;
            }
            Some(Procedure::Open) => {
                let name = reader.string()?.unwrap_or_default();
                record(format!("OPEN {}", name));
                let mut status = STATUS_GOOD;
                if let Some((user, password)) = state.credentials.clone() {
                    let ask = WireWriter::new()
                        .word(STATUS_GOOD)
                        .word(0)
                        .string(Some(&format!("fake:0$MD5${}", SALT)));
                    send(&mut writer, ask)?;
                    assert_eq!(reader.word()?, Procedure::Authorize.code());
                    let resource = reader.string()?.unwrap_or_default();
                    let got_user = reader.string()?.unwrap_or_default();
                    let got_password = reader.string()?.unwrap_or_default();
                    record(format!("AUTHORIZE {} {}", resource, got_user));
                    send(&mut writer, WireWriter::new().word(0))?;
                    // Salted resources only accept the digest of salt and password.
                    let digest = Md5::new()
                        .chain_update(SALT)
                        .chain_update(&password)
                        .finalize();
                    let expected = format!("$MD5${:x}", digest);
                    if got_user != user || got_password != expected {
                        status = STATUS_ACCESS_DENIED;
                    }
                }
                send(
                    &mut writer,
                    WireWriter::new().word(status).word(7).string(None),
                )?;
            }
            Some(Procedure::Close) => {
                let handle = reader.word()?;
                record(format!("CLOSE {}", handle));
                send(&mut writer, WireWriter::new().word(0))?;
            }
            Some(Procedure::GetOptionDescriptors) => {
                let _handle = reader.word()?;
                record("GET_OPTION_DESCRIPTORS".into());
                let table = descriptors();
                let mut reply = WireWriter::new().word(table.len() as i32);
                for descriptor in &table {
                    reply = encode_option_descriptor(reply, descriptor);
                }
                send(&mut writer, reply)?;
            }
            Some(Procedure::ControlOption) => {
                let _handle = reader.word()?;
                let option = reader.word()?;
                let action = reader.word()?;
                let value_type = reader.word()?;
                let value_size = reader.word()?;
                let (words, chars) = if value_type == TYPE_STRING {
                    (Vec::new(), reader.chars()?)
                } else {
                    (reader.words()?, Vec::new())
                };
                let action_name = ["GET", "SET", "SET_AUTO"]
                    .get(action as usize)
                    .copied()
                    .unwrap_or("?");
                record(format!("CONTROL {} {} size={}", action_name, option, value_size));

                let mut status = STATUS_GOOD;
                let mut info = 0;
                match (option, action) {
                    (0, 0) | (1, 0) | (2, 0) => {}
                    (1, 1) => {
                        state.resolution = words.first().copied().unwrap_or(0);
                        info = 4;
                    }
                    (2, 1) => {
                        let end = chars.iter().position(|b| *b == 0).unwrap_or(chars.len());
                        state.mode = String::from_utf8_lossy(&chars[..end]).into_owned();
                        info = 2 | 4;
                    }
                    (2, 2) => {
                        state.mode = "Color".into();
                        info = 2 | 4;
                    }
                    _ => status = STATUS_INVALID,
                }

                let mut reply = WireWriter::new()
                    .word(status)
                    .word(info)
                    .word(value_type)
                    .word(value_size);
                reply = match (option, value_size) {
                    (_, 0) if value_type == TYPE_STRING => reply.chars(&[]),
                    (_, 0) => reply.words(&[]),
                    (0, _) => reply.words(&[3]),
                    (1, _) => reply.words(&[state.resolution]),
                    _ => reply.chars(&padded(&state.mode, value_size as usize)),
                };
                send(&mut writer, reply.string(None))?;
            }
            Some(Procedure::GetParameters) => {
                let _handle = reader.word()?;
                record("GET_PARAMETERS".into());
                let reply = WireWriter::new()
                    .word(STATUS_GOOD)
                    .word(0)
                    .word(1)
                    .word(4)
                    .word(4)
                    .word(3)
                    .word(8);
                send(&mut writer, reply)?;
            }
            Some(Procedure::Start) => {
                let _handle = reader.word()?;
                record("START".into());
                let data = TcpListener::bind("127.0.0.1:0")?;
                let port = data.local_addr()?.port();
                thread::spawn(move || {
                    if let Ok((mut socket, _)) = data.accept() {
                        let mut bytes = Vec::new();
                        for chunk in [&IMAGE[..5], &IMAGE[5..]] {
                            bytes.extend_from_slice(&(chunk.len() as u32).to_be_bytes());
                            bytes.extend_from_slice(chunk);
                        }
                        bytes.extend_from_slice(&END_OF_DATA.to_be_bytes());
                        bytes.push(STATUS_EOF);
                        let _ = socket.write_all(&bytes);
                    }
                });
                let reply = WireWriter::new()
                    .word(STATUS_GOOD)
                    .word(i32::from(port))
                    .word(BYTE_ORDER_LITTLE_ENDIAN)
                    .string(None);
                send(&mut writer, reply)?;
            }
            Some(Procedure::Cancel) => {
                let _handle = reader.word()?;
                record("CANCEL".into());
                send(&mut writer, WireWriter::new().word(0))?;
            }
            Some(Procedure::Exit) => {
                record("EXIT".into());
                return Ok(());
            }
            Some(Procedure::Authorize) | None => {
                record(format!("UNEXPECTED {}", code));
                return Ok(());
            }
        }
    }
}

async fn network_device(sane: &Sane) -> Device {
    let devices = sane.update_devices().await.expect("device list");
    assert_eq!(devices.len(), 1);
    devices.into_iter().next().expect("one device")
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_devices_are_prefixed_with_host() {
    let saned = FakeSaned::spawn(None);
    let config = saned.config();
    let (sane, _events) = Sane::spawn(NetBackend::with_config(&config), config);

    let device = network_device(&sane).await;
    assert_eq!(device.name(), format!("[{}]:fake:0", saned.host()));
    assert_eq!(device.vendor(), "Acme");
    assert_eq!(device.model(), "Flatbed 9000");
    assert_eq!(saned.count("INIT"), 1);
    assert_eq!(saned.count("GET_DEVICES"), 1);
}

#[tokio::test]
async fn test_unreachable_host_is_skipped() {
    let saned = FakeSaned::spawn(None);
    let mut config = saned.config();
    // Nothing listens on the discard port of the loopback interface.
    config.hosts.insert(0, SaneHost::new("127.0.0.1:9"));
    let (sane, _events) = Sane::spawn(NetBackend::with_config(&config), config);

    let devices = sane.update_devices().await.unwrap();
    assert_eq!(devices.len(), 1);
}

#[tokio::test]
async fn test_options_are_listed_and_written() {
    let saned = FakeSaned::spawn(None);
    let config = saned.config();
    let (sane, _events) = Sane::spawn(NetBackend::with_config(&config), config);
    let device = network_device(&sane).await;

    sane.open_device(&device, true).await.unwrap();
    assert_eq!(device.options().len(), 2);
    assert_eq!(
        device.option(StandardOption::Resolution).and_then(|o| o.value()),
        Some(OptionValue::Int(150))
    );
    assert_eq!(
        device.option(StandardOption::Mode).and_then(|o| o.value()),
        Some(OptionValue::String("Gray".into()))
    );

    let resolution = device.option(StandardOption::Resolution).unwrap();
    sane.update_option(&device, &resolution, OptionValue::Int(300))
        .await
        .unwrap();
    assert_eq!(
        device.option(StandardOption::Resolution).and_then(|o| o.value()),
        Some(OptionValue::Int(300))
    );

    // Strings go out at their length plus terminator.
    let mode = device.option(StandardOption::Mode).unwrap();
    sane.update_option(&device, &mode, OptionValue::String("Color".into()))
        .await
        .unwrap();
    assert!(saned.log().contains(&"CONTROL SET 2 size=6".to_string()));
    assert_eq!(saned.count("GET_OPTION_DESCRIPTORS"), 2);

    let mode = device.option(StandardOption::Mode).unwrap();
    sane.update_option(&device, &mode, NewValue::Auto).await.unwrap();
    assert!(saned.log().contains(&"CONTROL SET_AUTO 2 size=0".to_string()));

    sane.close_device(&device).await.unwrap();
    assert_eq!(saned.count("CLOSE 7"), 1);
}

#[tokio::test]
async fn test_scan_over_data_connection() {
    let saned = FakeSaned::spawn(None);
    let config = saned.config();
    let (sane, _events) = Sane::spawn(NetBackend::with_config(&config), config);
    let device = network_device(&sane).await;
    sane.open_device(&device, true).await.unwrap();

    let (progress, _rx) = mpsc::unbounded_channel();
    let pages = sane.scan(&device, false, progress).await.unwrap();
    assert_eq!(pages.len(), 1);
    let gray = pages[0].image.to_luma8();
    assert_eq!((gray.width(), gray.height()), (4, 3));
    assert_eq!(gray.into_raw(), IMAGE.to_vec());
    assert_eq!(saned.count("START"), 1);
    assert_eq!(saned.count("CANCEL"), 1);
}

struct Stored(&'static str, &'static str);

impl CredentialStore for Stored {
    fn credentials(&self, _device_name: &str) -> Option<DeviceAuthentication> {
        Some(DeviceAuthentication {
            username: self.0.into(),
            password: self.1.into(),
        })
    }
}

#[tokio::test]
async fn test_authorization_roundtrip() {
    let saned = FakeSaned::spawn(Some(("scan", "secret")));
    let config = saned.config();
    let (sane, _events) = Sane::builder(NetBackend::with_config(&config))
        .config(config)
        .credential_store(Stored("scan", "secret"))
        .spawn();
    let device = network_device(&sane).await;

    sane.open_device(&device, false).await.unwrap();
    assert!(saned
        .log()
        .contains(&"AUTHORIZE fake:0$MD5$0123456789 scan".to_string()));
}

#[tokio::test]
async fn test_wrong_credentials_are_denied() {
    let saned = FakeSaned::spawn(Some(("scan", "secret")));
    let config = saned.config();
    let (sane, _events) = Sane::builder(NetBackend::with_config(&config))
        .config(config)
        .credential_store(Stored("scan", "guess"))
        .spawn();
    let device = network_device(&sane).await;

    let err = sane.open_device(&device, false).await.unwrap_err();
    assert!(matches!(err, SaneError::Backend(Status::AccessDenied)));
}
