//! The net-iogress pair: a network sink that serializes one input port
//! onto a framed TCP stream, and a network source that replays the stream
//! out of one output port. Topologies splice these in when a flow's
//! endpoints straddle process boundaries.
//!
//! Frames carry a 2-byte type tag (0 buffer, 1 label, 2 message), an
//! 8-byte stream index, and a 4-byte payload length, all big-endian.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{mpsc, Arc, Mutex, Once, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::block::{Block, BlockBuilder, BlockHandle, Ports};
use crate::registry::BlockRegistry;
use crate::{BufferChunk, Dtype, Error, Label, Object, Result};

pub(crate) const PACKET_TYPE_BUFFER: u16 = 0;
pub(crate) const PACKET_TYPE_LABEL: u16 = 1;
pub(crate) const PACKET_TYPE_MESSAGE: u16 = 2;

const MAX_PAYLOAD: usize = 1 << 24;

/// Register the net-iogress factories. Safe to call repeatedly.
pub(crate) fn ensure_registered() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let result = BlockRegistry::register("/blocks/network_sink", |args| {
            let (uri, bind, dtype) = parse_args(args)?;
            NetworkSink::make(&uri, bind, dtype)
        })
        .and_then(|()| {
            BlockRegistry::register("/blocks/network_source", |args| {
                let (uri, bind, dtype) = parse_args(args)?;
                NetworkSource::make(&uri, bind, dtype)
            })
        });
        if let Err(e) = result {
            log::error!("failed to register network blocks: {}", e);
        }
    });
}

fn parse_args(args: &[Object]) -> Result<(String, bool, Dtype)> {
    let uri = args
        .first()
        .ok_or_else(|| Error::invalid_argument("network block needs a uri"))?
        .as_str()?
        .to_owned();
    let mode = args
        .get(1)
        .ok_or_else(|| Error::invalid_argument("network block needs a mode"))?
        .as_str()?;
    let bind = match mode {
        "BIND" => true,
        "CONNECT" => false,
        other => {
            return Err(Error::invalid_argument(format!(
                "network mode must be BIND or CONNECT, not \"{}\"",
                other
            )))
        }
    };
    let dtype = match args.get(2).and_then(|o| o.as_str().ok()) {
        Some(name) => Dtype::parse(name)?,
        None => Dtype::default(),
    };
    Ok((uri, bind, dtype))
}

/// Split `tcp://host[:port]` into host and port (0 when absent).
pub(crate) fn parse_tcp_uri(uri: &str) -> Result<(String, u16)> {
    let rest = uri
        .strip_prefix("tcp://")
        .ok_or_else(|| Error::invalid_argument(format!("unsupported uri scheme in \"{}\"", uri)))?;
    match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| Error::invalid_argument(format!("bad port in \"{}\"", uri)))?;
            Ok((host.to_owned(), port))
        }
        None => Ok((rest.to_owned(), 0)),
    }
}

fn write_frame(
    mut stream: &TcpStream,
    packet_type: u16,
    index: u64,
    payload: &[u8],
) -> std::io::Result<()> {
    let mut header = [0u8; 14];
    header[0..2].copy_from_slice(&packet_type.to_be_bytes());
    header[2..10].copy_from_slice(&index.to_be_bytes());
    header[10..14].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    stream.write_all(&header)?;
    stream.write_all(payload)
}

fn read_frame(mut stream: &TcpStream) -> Result<(u16, u64, Vec<u8>)> {
    let mut header = [0u8; 14];
    stream.read_exact(&mut header)?;
    let packet_type = u16::from_be_bytes([header[0], header[1]]);
    let index = u64::from_be_bytes([
        header[2], header[3], header[4], header[5], header[6], header[7], header[8], header[9],
    ]);
    let length = u32::from_be_bytes([header[10], header[11], header[12], header[13]]) as usize;
    if packet_type > PACKET_TYPE_MESSAGE {
        return Err(Error::DataFormat(format!(
            "unknown packet type {}",
            packet_type
        )));
    }
    if length > MAX_PAYLOAD {
        return Err(Error::DataFormat(format!(
            "oversized frame of {} bytes",
            length
        )));
    }
    let mut payload = vec![0u8; length];
    stream.read_exact(&mut payload)?;
    Ok((packet_type, index, payload))
}

/// Label wire layout: id length, id, width, then the serialized value.
fn encode_label(label: &Label) -> Result<Vec<u8>> {
    let value = label.data.serialize()?;
    let id = label.id.as_bytes();
    let mut out = Vec::with_capacity(2 + id.len() + 8 + value.len());
    out.extend_from_slice(&(id.len() as u16).to_be_bytes());
    out.extend_from_slice(id);
    out.extend_from_slice(&(label.width as u64).to_be_bytes());
    out.extend_from_slice(&value);
    Ok(out)
}

fn decode_label(payload: &[u8]) -> Result<(String, usize, Object)> {
    if payload.len() < 2 {
        return Err(Error::DataFormat("truncated label frame".into()));
    }
    let id_len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    let width_end = 2 + id_len + 8;
    if payload.len() < width_end {
        return Err(Error::DataFormat("truncated label frame".into()));
    }
    let id = std::str::from_utf8(&payload[2..2 + id_len])
        .map_err(|_| Error::DataFormat("label id is not utf-8".into()))?
        .to_owned();
    let mut width_bytes = [0u8; 8];
    width_bytes.copy_from_slice(&payload[2 + id_len..width_end]);
    let width = u64::from_be_bytes(width_bytes) as usize;
    let value = Object::deserialize(&payload[width_end..])?;
    Ok((id, width, value))
}

/// Connection state shared with the endpoint handler thread.
struct Endpoint {
    stream: Mutex<Option<TcpStream>>,
    ready: AtomicBool,
    running: AtomicBool,
}

impl Endpoint {
    fn new() -> Arc<Endpoint> {
        Arc::new(Endpoint {
            stream: Mutex::new(None),
            ready: AtomicBool::new(false),
            running: AtomicBool::new(false),
        })
    }

    fn stream(&self) -> Option<TcpStream> {
        self.stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(|s| s.try_clone().ok())
    }

    fn set_stream(&self, stream: TcpStream) {
        *self.stream.lock().unwrap_or_else(PoisonError::into_inner) = Some(stream);
        self.ready.store(true, Ordering::Release);
    }

    fn close(&self) {
        self.ready.store(false, Ordering::Release);
        let stream = self
            .stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(stream) = stream {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

/// Wait for a peer: accept on the bound listener, or connect with retry.
fn establish(
    endpoint: &Arc<Endpoint>,
    listener: Option<&TcpListener>,
    connect_addr: Option<&str>,
) -> Option<TcpStream> {
    if let Some(listener) = listener {
        if listener.set_nonblocking(true).is_err() {
            return None;
        }
        while endpoint.running.load(Ordering::Acquire) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    log::debug!("network block accepted {}", peer);
                    let _ = stream.set_nodelay(true);
                    return Some(stream);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => {
                    log::error!("network block accept failed: {}", e);
                    return None;
                }
            }
        }
        None
    } else if let Some(addr) = connect_addr {
        while endpoint.running.load(Ordering::Acquire) {
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    return Some(stream);
                }
                Err(_) => std::thread::sleep(Duration::from_millis(20)),
            }
        }
        None
    } else {
        None
    }
}

/***********************************************************************
 * network sink
 **********************************************************************/

/// Send-only block: serializes messages, then labels, then the stream
/// buffer of its single input. Labels go ahead of buffers so ordering
/// survives at the destination.
struct NetworkSink {
    endpoint: Arc<Endpoint>,
    listener: Option<TcpListener>,
    connect_addr: Option<String>,
    actual_port: u16,
    handler: Option<JoinHandle<()>>,
    messages_sent: u64,
}

impl NetworkSink {
    fn make(uri: &str, bind: bool, dtype: Dtype) -> Result<BlockHandle> {
        let (host, port) = parse_tcp_uri(uri)?;
        let (listener, connect_addr, actual_port) = if bind {
            let listener = TcpListener::bind((host.as_str(), port))?;
            let actual_port = listener.local_addr()?.port();
            (Some(listener), None, actual_port)
        } else {
            (None, Some(format!("{}:{}", host, port)), port)
        };
        let sink = NetworkSink {
            endpoint: Endpoint::new(),
            listener,
            connect_addr,
            actual_port,
            handler: None,
            messages_sent: 0,
        };
        Ok(BlockBuilder::new("network_sink")
            .input_with_domain(0, dtype, "")
            .call("get_actual_port", |sink: &mut NetworkSink, _args| {
                Ok(Object::from(sink.actual_port as u64))
            })
            .build(sink))
    }
}

impl Block for NetworkSink {
    fn activate(&mut self, io: &mut Ports) -> Result<()> {
        self.endpoint.running.store(true, Ordering::Release);
        let endpoint = Arc::clone(&self.endpoint);
        let listener = self.listener.as_ref().map(|l| l.try_clone()).transpose()?;
        let connect_addr = self.connect_addr.clone();
        let waker = io.waker();
        self.handler = Some(std::thread::spawn(move || {
            if let Some(stream) =
                establish(&endpoint, listener.as_ref(), connect_addr.as_deref())
            {
                endpoint.set_stream(stream);
                waker.wake();
            }
        }));
        Ok(())
    }

    fn deactivate(&mut self, _io: &mut Ports) -> Result<()> {
        self.endpoint.running.store(false, Ordering::Release);
        self.endpoint.close();
        if let Some(handler) = self.handler.take() {
            let _ = handler.join();
        }
        Ok(())
    }

    fn work(&mut self, io: &mut Ports) -> Result<()> {
        if !self.endpoint.ready.load(Ordering::Acquire) {
            return Ok(());
        }
        let stream = match self.endpoint.stream() {
            Some(stream) => stream,
            None => return Ok(()),
        };
        let input = io.input(0);

        while input.has_message() {
            let message = input.pop_message();
            let payload = message.serialize()?;
            write_frame(&stream, PACKET_TYPE_MESSAGE, self.messages_sent, &payload)?;
            self.messages_sent += 1;
        }

        // all labels are sent before buffers to keep ordering at the peer
        for label in input.labels() {
            let absolute = input.totals().elements + label.index as u64;
            let payload = encode_label(&label)?;
            write_frame(&stream, PACKET_TYPE_LABEL, absolute, &payload)?;
            input.remove_label(&label);
        }

        let buffer = input.buffer();
        if buffer.length != 0 {
            write_frame(
                &stream,
                PACKET_TYPE_BUFFER,
                input.totals().elements,
                buffer.as_slice(),
            )?;
            let elements = input.elements();
            input.consume(elements);
        }
        Ok(())
    }
}

impl Drop for NetworkSink {
    fn drop(&mut self) {
        self.endpoint.running.store(false, Ordering::Release);
        self.endpoint.close();
        if let Some(handler) = self.handler.take() {
            let _ = handler.join();
        }
    }
}

/***********************************************************************
 * network source
 **********************************************************************/

/// Receive-only block: replays buffers, labels, and messages from the
/// framed stream out of its single output, in arrival order.
struct NetworkSource {
    endpoint: Arc<Endpoint>,
    listener: Option<TcpListener>,
    connect_addr: Option<String>,
    actual_port: u16,
    handler: Option<JoinHandle<()>>,
    frames: Option<Receiver<(u16, u64, Vec<u8>)>>,
    dtype: Dtype,
    elements_posted: u64,
}

impl NetworkSource {
    fn make(uri: &str, bind: bool, dtype: Dtype) -> Result<BlockHandle> {
        let (host, port) = parse_tcp_uri(uri)?;
        let (listener, connect_addr, actual_port) = if bind {
            let listener = TcpListener::bind((host.as_str(), port))?;
            let actual_port = listener.local_addr()?.port();
            (Some(listener), None, actual_port)
        } else {
            (None, Some(format!("{}:{}", host, port)), port)
        };
        let source = NetworkSource {
            endpoint: Endpoint::new(),
            listener,
            connect_addr,
            actual_port,
            handler: None,
            frames: None,
            dtype,
            elements_posted: 0,
        };
        Ok(BlockBuilder::new("network_source")
            .output_with_domain(0, dtype, "")
            .call("get_actual_port", |source: &mut NetworkSource, _args| {
                Ok(Object::from(source.actual_port as u64))
            })
            .build(source))
    }
}

fn reader_loop(
    endpoint: Arc<Endpoint>,
    frames: Sender<(u16, u64, Vec<u8>)>,
    waker: crate::worker::ActorWaker,
) {
    let stream = match endpoint.stream() {
        Some(stream) => stream,
        None => return,
    };
    while endpoint.running.load(Ordering::Acquire) {
        match read_frame(&stream) {
            Ok(frame) => {
                if frames.send(frame).is_err() {
                    return;
                }
                waker.wake();
            }
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                log::debug!("network source peer closed");
                return;
            }
            Err(e) => {
                if endpoint.running.load(Ordering::Acquire) {
                    log::error!("network source receive failed: {}", e);
                }
                return;
            }
        }
    }
}

impl Block for NetworkSource {
    fn activate(&mut self, io: &mut Ports) -> Result<()> {
        self.endpoint.running.store(true, Ordering::Release);
        let (tx, rx) = mpsc::channel();
        self.frames = Some(rx);

        let endpoint = Arc::clone(&self.endpoint);
        let listener = self.listener.as_ref().map(|l| l.try_clone()).transpose()?;
        let connect_addr = self.connect_addr.clone();
        let waker = io.waker();
        self.handler = Some(std::thread::spawn(move || {
            if let Some(stream) =
                establish(&endpoint, listener.as_ref(), connect_addr.as_deref())
            {
                endpoint.set_stream(stream);
                reader_loop(endpoint, tx, waker);
            }
        }));
        Ok(())
    }

    fn deactivate(&mut self, _io: &mut Ports) -> Result<()> {
        self.endpoint.running.store(false, Ordering::Release);
        self.endpoint.close();
        if let Some(handler) = self.handler.take() {
            let _ = handler.join();
        }
        self.frames = None;
        Ok(())
    }

    fn work(&mut self, io: &mut Ports) -> Result<()> {
        let frames = match &self.frames {
            Some(frames) => frames,
            None => return Ok(()),
        };
        let elem_size = self.dtype.size();
        let output = io.output(0);

        while let Ok((packet_type, index, payload)) = frames.try_recv() {
            match packet_type {
                PACKET_TYPE_BUFFER => {
                    let elements = payload.len() / elem_size;
                    let mut chunk = BufferChunk::alloc(self.dtype, elements)?;
                    chunk
                        .as_mut_slice()
                        .copy_from_slice(&payload[..elements * elem_size]);
                    output.post_buffer(chunk);
                    self.elements_posted += elements as u64;
                }
                PACKET_TYPE_LABEL => {
                    let (id, width, value) = decode_label(&payload)?;
                    let relative = index.saturating_sub(self.elements_posted) as usize;
                    output.post_label(Label::new(id, value, relative).with_width(width));
                }
                PACKET_TYPE_MESSAGE => {
                    output.post_message(Object::deserialize(&payload)?);
                }
                _ => return Err(Error::DataFormat(format!("unknown packet type {}", packet_type))),
            }
        }
        Ok(())
    }
}

impl Drop for NetworkSource {
    fn drop(&mut self) {
        self.endpoint.running.store(false, Ordering::Release);
        self.endpoint.close();
        if let Some(handler) = self.handler.take() {
            let _ = handler.join();
        }
    }
}
