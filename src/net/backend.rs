//! [`Backend`] implementation over the SANE network protocol.

use std::collections::HashMap;
use std::io::{BufReader, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::backend::{
    AuthCallback, Backend, BackendVersion, ControlAction, FrameParameters, HandleId, Info,
    OptionDescriptor, RawDevice,
};
use crate::config::{SaneConfig, SaneHost};
use crate::error::{Result, SaneError, Status};
use crate::models::FrameKind;
use crate::net::wire::{WireReader, WireWriter};
use crate::net::{
    authorization_password, device_name, host_is_little_endian, resource_display_name,
    split_device_name, swap_16bit_samples, Procedure, BYTE_ORDER_LITTLE_ENDIAN, END_OF_DATA,
    PROTOCOL_VERSION, VERSION_CODE,
};
use crate::options::{ValueType, WORD_SIZE};

type Reader = WireReader<BufReader<TcpStream>>;

/// Open a TCP connection, trying every resolved address.
fn connect(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    let mut last_error = None;
    for addr in addrs {
        let attempt = if timeout.is_zero() {
            TcpStream::connect(addr)
        } else {
            TcpStream::connect_timeout(&addr, timeout)
        };
        match attempt {
            Ok(stream) => {
                if !timeout.is_zero() {
                    stream.set_read_timeout(Some(timeout))?;
                }
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error
        .map(SaneError::Io)
        .unwrap_or_else(|| SaneError::Protocol(format!("no address for {}", host))))
}

// =============================================================================
// Control connection
// =============================================================================

struct Connection {
    peer: IpAddr,
    reader: Reader,
    writer: TcpStream,
}

impl Connection {
    fn open(host: &SaneHost, timeout: Duration, username: &str) -> Result<Self> {
        let (hostname, port) = host.address();
        tracing::debug!("Connecting to saned at {}:{}", hostname, port);
        let stream = connect(&hostname, port, timeout)?;
        let peer = stream.peer_addr()?.ip();
        let writer = stream.try_clone()?;
        let mut connection = Self {
            peer,
            reader: WireReader::new(BufReader::new(stream)),
            writer,
        };

        connection.send(
            WireWriter::new()
                .word(Procedure::Init.code())
                .word(VERSION_CODE)
                .string(Some(username))
                .finish(),
        )?;
        let status = connection.reader.status()?;
        let version = BackendVersion::from_code(connection.reader.word()? as u32);
        if status != Status::Good {
            return Err(SaneError::from_status(status));
        }
        if version.major != 1 || u32::from(version.build) < 2 {
            return Err(SaneError::Protocol(format!(
                "unsupported saned protocol {}",
                version
            )));
        }
        tracing::info!("Connected to saned on {} (protocol {})", host.hostname, version);
        Ok(connection)
    }

    fn send(&mut self, request: Vec<u8>) -> Result<()> {
        self.writer.write_all(&request)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Send `request` and read its reply, answering authorization requests
    /// in between. `read_reply` returns the reply and the resource to
    /// authorize, if any.
    fn call<T>(
        &mut self,
        auth: Option<&AuthCallback>,
        request: Vec<u8>,
        mut read_reply: impl FnMut(&mut Reader) -> Result<(T, Option<String>)>,
    ) -> Result<T> {
        self.send(request)?;
        loop {
            let (reply, resource) = read_reply(&mut self.reader)?;
            match resource.filter(|r| !r.is_empty()) {
                Some(resource) => self.authorize(auth, &resource)?,
                None => return Ok(reply),
            }
        }
    }

    fn authorize(&mut self, auth: Option<&AuthCallback>, resource: &str) -> Result<()> {
        let credentials = auth.and_then(|callback| callback(resource_display_name(resource)));
        if credentials.is_none() {
            tracing::info!("Authorization for {} declined", resource_display_name(resource));
        }
        let (username, password) = credentials
            .map(|c| (c.username, c.password))
            .unwrap_or_default();
        self.send(
            WireWriter::new()
                .word(Procedure::Authorize.code())
                .string(Some(resource))
                .string(Some(&username))
                .string(Some(&authorization_password(resource, &password)))
                .finish(),
        )?;
        let _dummy = self.reader.word()?;
        Ok(())
    }
}

// =============================================================================
// Data connection
// =============================================================================

struct DataStream {
    stream: BufReader<TcpStream>,
    record_remaining: usize,
    server_little_endian: bool,
    /// First byte of a 16-bit sample split across reads.
    carry: Option<u8>,
    finished: Option<Status>,
}

impl DataStream {
    fn end_error(&self) -> SaneError {
        match self.finished {
            Some(Status::Good) | None => SaneError::Backend(Status::Eof),
            Some(status) => SaneError::from_status(status),
        }
    }

    /// Read from the current record. `None` once the end marker arrived.
    fn read_record(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        if self.record_remaining == 0 {
            let mut length = [0u8; 4];
            self.stream.read_exact(&mut length)?;
            let length = u32::from_be_bytes(length);
            if length == END_OF_DATA {
                let mut status = [0u8; 1];
                self.stream.read_exact(&mut status)?;
                self.finished = Some(Status::from_code(i32::from(status[0])));
                return Ok(None);
            }
            self.record_remaining = length as usize;
            if length == 0 {
                return Ok(Some(0));
            }
        }
        let wanted = buf.len().min(self.record_remaining);
        let read = self.stream.read(&mut buf[..wanted])?;
        if read == 0 && wanted > 0 {
            return Err(SaneError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "data connection closed mid-record",
            )));
        }
        self.record_remaining -= read;
        Ok(Some(read))
    }

    fn read(&mut self, buf: &mut [u8], swap: bool) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut filled = 0;
        if let Some(byte) = self.carry.take() {
            buf[0] = byte;
            filled = 1;
        }
        if self.finished.is_none() {
            if let Some(read) = self.read_record(&mut buf[filled..])? {
                filled += read;
            }
        }
        if filled == 0 {
            return match self.finished {
                Some(_) => Err(self.end_error()),
                None => Ok(0),
            };
        }
        if swap && self.finished.is_none() && filled % 2 == 1 {
            filled -= 1;
            self.carry = Some(buf[filled]);
        }
        if swap {
            swap_16bit_samples(&mut buf[..filled]);
        }
        Ok(filled)
    }
}

// =============================================================================
// Backend
// =============================================================================

struct RemoteHandle {
    host: String,
    remote: i32,
    descriptors: Option<Vec<OptionDescriptor>>,
    depth: i32,
    data: Option<DataStream>,
}

/// Talks to one or more `saned` hosts.
pub struct NetBackend {
    hosts: Vec<SaneHost>,
    timeout: Duration,
    username: String,
    auth: Option<AuthCallback>,
    connections: HashMap<String, Connection>,
    handles: HashMap<HandleId, RemoteHandle>,
    next_handle: HandleId,
}

impl Default for NetBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl NetBackend {
    pub fn new() -> Self {
        let config = SaneConfig::default();
        Self {
            hosts: Vec::new(),
            timeout: config.timeout(),
            username: std::env::var("USER").unwrap_or_else(|_| "sane-client".to_string()),
            auth: None,
            connections: HashMap::new(),
            handles: HashMap::new(),
            next_handle: 1,
        }
    }

    pub fn with_config(config: &SaneConfig) -> Self {
        let mut backend = Self::new();
        backend.configure(config);
        backend
    }

    fn known_host(&self, hostname: &str) -> Option<&SaneHost> {
        self.hosts.iter().find(|h| h.hostname == hostname)
    }

    /// Host and remote name of a device name. Names without a host prefix
    /// go to the last configured host; unknown prefixes become ad-hoc hosts.
    fn resolve(&mut self, name: &str) -> Result<(String, String)> {
        match split_device_name(name) {
            (Some(host), remote) if self.known_host(host).is_some() => {
                Ok((host.to_string(), remote.to_string()))
            }
            (Some(host), remote) => {
                tracing::debug!("Adding ad-hoc host {}", host);
                self.hosts.push(SaneHost::new(host));
                Ok((host.to_string(), remote.to_string()))
            }
            (None, remote) => self
                .hosts
                .last()
                .map(|h| (h.hostname.clone(), remote.to_string()))
                .ok_or(SaneError::Backend(Status::Invalid)),
        }
    }

    fn ensure_connected(&mut self, hostname: &str) -> Result<()> {
        if self.connections.contains_key(hostname) {
            return Ok(());
        }
        let host = self
            .known_host(hostname)
            .cloned()
            .unwrap_or_else(|| SaneHost::new(hostname));
        let connection = Connection::open(&host, self.timeout, &self.username)?;
        self.connections.insert(hostname.to_string(), connection);
        Ok(())
    }

    fn call<T>(
        &mut self,
        hostname: &str,
        request: Vec<u8>,
        read_reply: impl FnMut(&mut Reader) -> Result<(T, Option<String>)>,
    ) -> Result<T> {
        self.ensure_connected(hostname)?;
        let connection = self
            .connections
            .get_mut(hostname)
            .ok_or(SaneError::Backend(Status::IoError))?;
        let result = connection.call(self.auth.as_ref(), request, read_reply);
        if matches!(result, Err(SaneError::Io(_)) | Err(SaneError::Protocol(_))) {
            tracing::warn!("Dropping broken connection to {}", hostname);
            self.connections.remove(hostname);
        }
        result
    }

    fn remote(&self, handle: HandleId) -> Result<(String, i32)> {
        self.handles
            .get(&handle)
            .map(|h| (h.host.clone(), h.remote))
            .ok_or(SaneError::Backend(Status::Invalid))
    }

    fn descriptors(&mut self, handle: HandleId) -> Result<&[OptionDescriptor]> {
        let cached = self
            .handles
            .get(&handle)
            .ok_or(SaneError::Backend(Status::Invalid))?
            .descriptors
            .is_some();
        if !cached {
            let (host, remote) = self.remote(handle)?;
            let descriptors = self.call(
                &host,
                WireWriter::new()
                    .word(Procedure::GetOptionDescriptors.code())
                    .word(remote)
                    .finish(),
                |r| Ok((r.option_descriptors()?, None)),
            )?;
            if let Some(h) = self.handles.get_mut(&handle) {
                h.descriptors = Some(descriptors);
            }
        }
        self.handles
            .get(&handle)
            .and_then(|h| h.descriptors.as_deref())
            .ok_or(SaneError::Backend(Status::Invalid))
    }
}

fn words_from_native(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(WORD_SIZE)
        .map(|chunk| {
            let mut word = [0u8; WORD_SIZE];
            word.copy_from_slice(chunk);
            i32::from_ne_bytes(word)
        })
        .collect()
}

fn words_to_native(words: &[i32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_ne_bytes()).collect()
}

/// Value carried by a CONTROL_OPTION request or reply.
enum WireOptionValue {
    Words(Vec<i32>),
    Chars(Vec<u8>),
}

struct ControlReply {
    status: Status,
    info: Info,
    value_size: i32,
    value: WireOptionValue,
}

impl Backend for NetBackend {
    fn name(&self) -> &str {
        "net"
    }

    fn configure(&mut self, config: &SaneConfig) {
        self.hosts = config.all_hosts().cloned().collect();
        self.timeout = config.timeout();
    }

    fn init(&mut self, auth: AuthCallback) -> Result<BackendVersion> {
        self.auth = Some(auth);
        self.connections.clear();
        self.handles.clear();
        Ok(BackendVersion {
            major: 1,
            minor: 0,
            build: PROTOCOL_VERSION as u16,
        })
    }

    fn exit(&mut self) {
        for (host, mut connection) in self.connections.drain() {
            let request = WireWriter::new().word(Procedure::Exit.code()).finish();
            if let Err(e) = connection.send(request) {
                tracing::debug!("EXIT to {} failed: {}", host, e);
            }
        }
        self.handles.clear();
        self.auth = None;
    }

    fn devices(&mut self, local_only: bool) -> Result<Vec<RawDevice>> {
        if local_only {
            return Ok(Vec::new());
        }
        let mut devices = Vec::new();
        let hostnames: Vec<String> = self.hosts.iter().map(|h| h.hostname.clone()).collect();
        for hostname in hostnames {
            let request = WireWriter::new()
                .word(Procedure::GetDevices.code())
                .finish();
            let reply = self.call(&hostname, request, |r| {
                let status = r.status()?;
                let list = r.devices()?;
                Ok(((status, list), None))
            });
            match reply {
                Ok((Status::Good, list)) => {
                    devices.extend(list.into_iter().map(|d| RawDevice {
                        name: device_name(&hostname, &d.name),
                        ..d
                    }));
                }
                Ok((status, _)) => {
                    tracing::warn!("Listing devices on {} failed: {}", hostname, status)
                }
                Err(e) => tracing::warn!("Listing devices on {} failed: {}", hostname, e),
            }
        }
        Ok(devices)
    }

    fn open(&mut self, name: &str) -> Result<HandleId> {
        let (host, remote_name) = self.resolve(name)?;
        let request = WireWriter::new()
            .word(Procedure::Open.code())
            .string(Some(&remote_name))
            .finish();
        let (status, remote) = self.call(&host, request, |r| {
            let status = r.status()?;
            let handle = r.word()?;
            let resource = r.string()?;
            Ok(((status, handle), resource))
        })?;
        if status != Status::Good {
            return Err(SaneError::from_status(status));
        }
        let handle = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(
            handle,
            RemoteHandle {
                host,
                remote,
                descriptors: None,
                depth: 8,
                data: None,
            },
        );
        Ok(handle)
    }

    fn close(&mut self, handle: HandleId) {
        let Some(remote) = self.handles.remove(&handle) else {
            return;
        };
        let request = WireWriter::new()
            .word(Procedure::Close.code())
            .word(remote.remote)
            .finish();
        if let Err(e) = self.call(&remote.host, request, |r| Ok((r.word()?, None))) {
            tracing::warn!("CLOSE on {} failed: {}", remote.host, e);
        }
    }

    fn option_descriptor(&mut self, handle: HandleId, index: usize) -> Result<OptionDescriptor> {
        self.descriptors(handle)?
            .get(index)
            .cloned()
            .ok_or(SaneError::Backend(Status::Invalid))
    }

    fn control_option(
        &mut self,
        handle: HandleId,
        index: usize,
        action: ControlAction<'_>,
    ) -> Result<Info> {
        let descriptor = self.option_descriptor(handle, index)?;
        let (host, remote) = self.remote(handle)?;
        let value_type = ValueType::from_code(descriptor.value_type);
        let size = descriptor.size.max(0) as usize;
        let action_code = action.code();

        let mut request = WireWriter::new()
            .word(Procedure::ControlOption.code())
            .word(remote)
            .word(index as i32)
            .word(action_code);

        let (buffer, value_size) = match action {
            ControlAction::SetAuto => {
                // The value is ignored but its header still goes on the wire.
                request = request.word(descriptor.value_type).word(0).words(&[]);
                (None, 0)
            }
            ControlAction::GetValue(buf) => {
                let value_size = match value_type {
                    Some(ValueType::Button | ValueType::Group) => 0,
                    _ => size,
                };
                let zeros = vec![0u8; value_size];
                request = request.word(descriptor.value_type).word(value_size as i32);
                request = match value_type {
                    Some(ValueType::String) => request.chars(&zeros),
                    _ => request.words(&words_from_native(&zeros)),
                };
                (Some(buf), value_size)
            }
            ControlAction::SetValue(buf) => {
                let value_size = match value_type {
                    Some(ValueType::Button | ValueType::Group) => 0,
                    Some(ValueType::String) => {
                        let len = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
                        (len + 1).min(size)
                    }
                    _ => size,
                };
                let payload = &buf[..value_size.min(buf.len())];
                request = request.word(descriptor.value_type).word(value_size as i32);
                request = match value_type {
                    Some(ValueType::String) => {
                        let mut chars = payload.to_vec();
                        chars.resize(value_size, 0);
                        request.chars(&chars)
                    }
                    _ => request.words(&words_from_native(payload)),
                };
                (Some(buf), value_size)
            }
        };

        let reply = self.call(&host, request.finish(), |r| {
            let status = r.status()?;
            let info = Info(r.word()? as u32);
            let reply_type = r.word()?;
            let reply_size = r.word()?;
            let value = if reply_type == ValueType::String.code() {
                WireOptionValue::Chars(r.chars()?)
            } else {
                WireOptionValue::Words(r.words()?)
            };
            let resource = r.string()?;
            Ok((
                ControlReply {
                    status,
                    info,
                    value_size: reply_size,
                    value,
                },
                resource,
            ))
        })?;

        if reply.status != Status::Good {
            return Err(SaneError::from_status(reply.status));
        }
        if let Some(buf) = buffer {
            if value_size > 0 && reply.value_size as usize == value_size {
                let bytes = match reply.value {
                    WireOptionValue::Words(words) => words_to_native(&words),
                    WireOptionValue::Chars(chars) => chars,
                };
                let len = bytes.len().min(buf.len());
                buf[..len].copy_from_slice(&bytes[..len]);
            } else if value_size > 0 {
                tracing::debug!(
                    "Option {} size changed from {} to {}",
                    index,
                    value_size,
                    reply.value_size
                );
            }
        }
        if reply.info.reload_options() {
            if let Some(h) = self.handles.get_mut(&handle) {
                h.descriptors = None;
            }
        }
        Ok(reply.info)
    }

    fn parameters(&mut self, handle: HandleId) -> Result<FrameParameters> {
        let (host, remote) = self.remote(handle)?;
        let request = WireWriter::new()
            .word(Procedure::GetParameters.code())
            .word(remote)
            .finish();
        let (status, parameters) = self.call(&host, request, |r| {
            let status = r.status()?;
            let parameters = FrameParameters {
                format: FrameKind::from_code(r.word()?),
                last_frame: r.word()? != 0,
                bytes_per_line: r.word()?,
                pixels_per_line: r.word()?,
                lines: r.word()?,
                depth: r.word()?,
            };
            Ok(((status, parameters), None))
        })?;
        if status != Status::Good {
            return Err(SaneError::from_status(status));
        }
        if let Some(h) = self.handles.get_mut(&handle) {
            h.depth = parameters.depth;
        }
        Ok(parameters)
    }

    fn start(&mut self, handle: HandleId) -> Result<()> {
        let (host, remote) = self.remote(handle)?;
        if let Some(h) = self.handles.get_mut(&handle) {
            h.data = None;
        }
        let request = WireWriter::new()
            .word(Procedure::Start.code())
            .word(remote)
            .finish();
        let (status, port, byte_order) = self.call(&host, request, |r| {
            let status = r.status()?;
            let port = r.word()?;
            let byte_order = r.word()?;
            let resource = r.string()?;
            Ok(((status, port, byte_order), resource))
        })?;
        if status != Status::Good {
            return Err(SaneError::from_status(status));
        }

        let peer = self
            .connections
            .get(&host)
            .map(|c| c.peer)
            .ok_or(SaneError::Backend(Status::IoError))?;
        let port = u16::try_from(port)
            .map_err(|_| SaneError::Protocol(format!("invalid data port {}", port)))?;
        let stream = connect(&peer.to_string(), port, self.timeout)?;
        tracing::debug!("Data connection to {}:{} open", peer, port);
        if let Some(h) = self.handles.get_mut(&handle) {
            h.data = Some(DataStream {
                stream: BufReader::new(stream),
                record_remaining: 0,
                server_little_endian: byte_order == BYTE_ORDER_LITTLE_ENDIAN,
                carry: None,
                finished: None,
            });
        }
        Ok(())
    }

    fn set_io_mode(&mut self, _handle: HandleId, non_blocking: bool) -> Result<()> {
        if non_blocking {
            return Err(SaneError::Backend(Status::Unsupported));
        }
        Ok(())
    }

    fn read(&mut self, handle: HandleId, buf: &mut [u8]) -> Result<usize> {
        let remote = self
            .handles
            .get_mut(&handle)
            .ok_or(SaneError::Backend(Status::Invalid))?;
        let depth = remote.depth;
        let data = remote
            .data
            .as_mut()
            .ok_or(SaneError::Backend(Status::Invalid))?;
        let swap = depth == 16 && data.server_little_endian != host_is_little_endian();
        data.read(buf, swap)
    }

    fn cancel(&mut self, handle: HandleId) {
        let Ok((host, remote)) = self.remote(handle) else {
            return;
        };
        if let Some(h) = self.handles.get_mut(&handle) {
            h.data = None;
        }
        let request = WireWriter::new()
            .word(Procedure::Cancel.code())
            .word(remote)
            .finish();
        if let Err(e) = self.call(&host, request, |r| Ok((r.word()?, None))) {
            tracing::warn!("CANCEL on {} failed: {}", host, e);
        }
    }
}
