// Not all fixtures are used by all tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};

use runnel::{
    Block, BlockBuilder, BlockHandle, BufferChunk, Dtype, Error, Label, Object, Ports, Result,
};

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = env_logger::try_init();
    });
}

/// Wait for quiescence, failing the test on timeout.
pub fn settle(topology: &runnel::Topology) {
    assert!(
        topology.wait_inactive_for(
            std::time::Duration::from_millis(150),
            std::time::Duration::from_secs(10),
        ),
        "topology did not quiesce"
    );
}

/***********************************************************************
 * feeder source: replays a scripted queue of buffers/labels/messages
 **********************************************************************/

pub enum FeedItem {
    Buffer(BufferChunk),
    Label(Label),
    Message(Object),
}

struct FeederSource {
    queue: Arc<Mutex<VecDeque<FeedItem>>>,
}

impl Block for FeederSource {
    fn work(&mut self, io: &mut Ports) -> Result<()> {
        let mut queue = self.queue.lock().expect("feeder queue");
        let output = io.output(0);
        while let Some(item) = queue.pop_front() {
            match item {
                FeedItem::Buffer(chunk) => output.post_buffer(chunk),
                FeedItem::Label(label) => output.post_label(label),
                FeedItem::Message(message) => output.post_message(message),
            }
        }
        Ok(())
    }
}

/// Drives a feeder after construction (and after commit, via `kick`).
#[derive(Clone)]
pub struct FeederCtl {
    queue: Arc<Mutex<VecDeque<FeedItem>>>,
    handle: BlockHandle,
}

impl FeederCtl {
    pub fn feed_buffer(&self, chunk: BufferChunk) {
        self.queue
            .lock()
            .expect("feeder queue")
            .push_back(FeedItem::Buffer(chunk));
        self.kick();
    }

    pub fn feed_elements<T: Copy>(&self, dtype: Dtype, values: &[T]) {
        let mut chunk = BufferChunk::alloc(dtype, values.len()).expect("feeder chunk");
        chunk.as_typed_mut::<T>().copy_from_slice(values);
        self.feed_buffer(chunk);
    }

    pub fn feed_label(&self, label: Label) {
        self.queue
            .lock()
            .expect("feeder queue")
            .push_back(FeedItem::Label(label));
        self.kick();
    }

    pub fn feed_message(&self, message: Object) {
        self.queue
            .lock()
            .expect("feeder queue")
            .push_back(FeedItem::Message(message));
        self.kick();
    }

    /// Re-run the feeder's work so queued items post after a commit.
    pub fn kick(&self) {
        let _ = self.handle.call("kick", &[]);
    }
}

pub fn feeder(dtype: Dtype) -> (BlockHandle, FeederCtl) {
    let queue: Arc<Mutex<VecDeque<FeedItem>>> = Arc::new(Mutex::new(VecDeque::new()));
    let handle = BlockBuilder::new("feeder")
        .output(0, dtype)
        .call("kick", |_feeder: &mut FeederSource, _args| Ok(Object::null()))
        .build(FeederSource {
            queue: Arc::clone(&queue),
        });
    let ctl = FeederCtl {
        queue,
        handle: handle.clone(),
    };
    (handle, ctl)
}

/***********************************************************************
 * collector sink: records everything it observes
 **********************************************************************/

#[derive(Default)]
pub struct Collected {
    pub buffers: Vec<Vec<u8>>,
    pub labels: Vec<Label>,
    pub messages: Vec<Object>,
}

struct CollectorSink {
    collected: Arc<Mutex<Collected>>,
}

impl Block for CollectorSink {
    fn work(&mut self, io: &mut Ports) -> Result<()> {
        let input = io.input(0);
        let mut collected = self.collected.lock().expect("collector state");

        while input.has_message() {
            collected.messages.push(input.pop_message());
        }

        for label in input.labels() {
            input.remove_label(&label);
            collected.labels.push(label);
        }

        let buffer = input.buffer();
        if buffer.length != 0 {
            collected.buffers.push(buffer.as_slice().to_vec());
            let elements = input.elements();
            input.consume(elements);
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct CollectorProbe {
    collected: Arc<Mutex<Collected>>,
}

impl CollectorProbe {
    pub fn num_buffers(&self) -> usize {
        self.collected.lock().expect("collector state").buffers.len()
    }

    /// All collected payload bytes, in arrival order.
    pub fn bytes(&self) -> Vec<u8> {
        let collected = self.collected.lock().expect("collector state");
        collected.buffers.iter().flatten().copied().collect()
    }

    pub fn typed<T: Copy>(&self) -> Vec<T> {
        let bytes = self.bytes();
        let size = std::mem::size_of::<T>();
        assert_eq!(bytes.len() % size, 0, "partial element collected");
        let mut chunk = BufferChunk::alloc(Dtype::new(runnel::Scalar::U8), bytes.len())
            .expect("collector view");
        chunk.as_mut_slice().copy_from_slice(&bytes);
        chunk.as_typed::<T>().to_vec()
    }

    pub fn labels(&self) -> Vec<Label> {
        self.collected.lock().expect("collector state").labels.clone()
    }

    pub fn messages(&self) -> Vec<Object> {
        self.collected.lock().expect("collector state").messages.clone()
    }
}

pub fn collector(dtype: Dtype) -> (BlockHandle, CollectorProbe) {
    let collected: Arc<Mutex<Collected>> = Arc::new(Mutex::new(Collected::default()));
    let handle = BlockBuilder::new("collector")
        .input(0, dtype)
        .build(CollectorSink {
            collected: Arc::clone(&collected),
        });
    (handle, CollectorProbe { collected })
}

/***********************************************************************
 * gateway: forward, back up, or drop its input stream
 **********************************************************************/

pub struct Gateway {
    mode: String,
    forward: bool,
    backup: bool,
    drop: bool,
}

impl Gateway {
    pub fn set_mode(&mut self, mode: &str) -> Result<()> {
        self.mode = mode.to_owned();
        self.forward = mode == "FORWARD";
        self.backup = mode == "BACKUP";
        self.drop = mode == "DROP";
        if !(self.forward || self.backup || self.drop) {
            return Err(Error::InvalidArgument(format!(
                "gateway mode must be FORWARD, BACKUP, or DROP, not \"{}\"",
                mode
            )));
        }
        Ok(())
    }
}

impl Block for Gateway {
    fn work(&mut self, io: &mut Ports) -> Result<()> {
        // backup mode: just return, consume nothing
        if self.backup {
            return Ok(());
        }

        if self.drop {
            let input = io.input(0);
            while input.has_message() {
                input.pop_message();
            }
            for label in input.labels() {
                input.remove_label(&label);
            }
            let elements = input.elements();
            input.consume(elements);
            return Ok(());
        }

        if !self.forward {
            return Ok(());
        }

        while io.input_ref(0).has_message() {
            let message = io.input(0).pop_message();
            io.output(0).post_message(message);
        }

        let buffer = io.input_ref(0).buffer();
        if buffer.length != 0 {
            io.output(0).post_buffer(buffer);
            let elements = io.input_ref(0).elements();
            io.input(0).consume(elements);
        }
        Ok(())
    }
}

pub fn gateway(dtype: Dtype, mode: &str) -> BlockHandle {
    static GATEWAY_COUNT: AtomicUsize = AtomicUsize::new(0);
    // unique domain because of buffer forwarding
    let domain = format!("gateway{}", GATEWAY_COUNT.fetch_add(1, Ordering::Relaxed));
    let mut block = Gateway {
        mode: String::new(),
        forward: false,
        backup: false,
        drop: false,
    };
    block.set_mode(mode).expect("gateway mode");
    BlockBuilder::new("gateway")
        .input(0, dtype)
        .output_with_domain(0, dtype, &domain)
        .call("set_mode", |gateway: &mut Gateway, args: &[Object]| {
            gateway.set_mode(args[0].as_str()?)?;
            Ok(Object::null())
        })
        .call("get_mode", |gateway: &mut Gateway, _args| {
            Ok(Object::from(gateway.mode.as_str()))
        })
        .build(block)
}

/***********************************************************************
 * symbol mapper: out[n] = map[in[n] & mask]
 **********************************************************************/

pub struct SymbolMapper {
    map: Vec<f32>,
    mask: u8,
}

impl SymbolMapper {
    fn set_map(&mut self, map: Vec<f32>) -> Result<()> {
        if map.is_empty() {
            return Err(Error::InvalidArgument("map must be nonzero size".into()));
        }
        if !map.len().is_power_of_two() {
            return Err(Error::InvalidArgument(
                "map must be a power of two in length".into(),
            ));
        }
        self.mask = (map.len() - 1) as u8;
        self.map = map;
        Ok(())
    }
}

impl Block for SymbolMapper {
    fn work(&mut self, io: &mut Ports) -> Result<()> {
        let n = io.work_info().min_elements;
        if n == 0 {
            return Ok(());
        }

        let input_buffer = io.input_ref(0).buffer();
        let mut output_buffer = io.output_ref(0).buffer();
        {
            let input = input_buffer.as_typed::<u8>();
            let output = output_buffer.as_typed_mut::<f32>();
            for i in 0..n {
                output[i] = self.map[(input[i] & self.mask) as usize];
            }
        }

        io.input(0).consume(n);
        io.output(0).produce(n);
        Ok(())
    }
}

pub fn symbol_mapper(map: Vec<f32>) -> BlockHandle {
    let mut block = SymbolMapper {
        map: Vec::new(),
        mask: 0,
    };
    block.set_map(map).expect("symbol map");
    BlockBuilder::new("symbol_mapper")
        .input(0, Dtype::new(runnel::Scalar::U8))
        .output(0, Dtype::new(runnel::Scalar::F32))
        .call("set_map", |mapper: &mut SymbolMapper, args: &[Object]| {
            let values = args[0]
                .get::<Vec<Object>>()
                .ok_or_else(|| Error::InvalidArgument("set_map takes a list".into()))?;
            let map = values
                .iter()
                .map(|v| v.as_f64().map(|f| f as f32))
                .collect::<Result<Vec<f32>>>()?;
            mapper.set_map(map)?;
            Ok(Object::null())
        })
        .build(block)
}

/***********************************************************************
 * bytes to symbols: unpack bytes into N-bit symbols
 **********************************************************************/

#[derive(Copy, Clone, PartialEq, Eq)]
pub enum BitOrder {
    MsBit,
    LsBit,
}

pub struct BytesToSymbols {
    modulus: u32,
    remainder: u32,
    bits_held: u32,
    order: BitOrder,
}

impl Block for BytesToSymbols {
    fn work(&mut self, io: &mut Ports) -> Result<()> {
        let in_elements = io.input_ref(0).elements();
        let out_elements = io.output_ref(0).elements();
        if in_elements == 0 || out_elements == 0 {
            return Ok(());
        }

        let input_buffer = io.input_ref(0).buffer();
        let mut output_buffer = io.output_ref(0).buffer();
        let input = input_buffer.as_typed::<u8>();
        let output = output_buffer.as_typed_mut::<u8>();

        let mut n = 0;
        let mut m = 0;
        match self.order {
            BitOrder::LsBit => {
                while n < in_elements && m < out_elements {
                    self.remainder |= (input[n] as u32) << self.bits_held;
                    n += 1;
                    self.bits_held += 8;
                    while self.bits_held >= self.modulus && m < out_elements {
                        let mut symbol = 0u8;
                        for _ in 0..self.modulus {
                            symbol <<= 1;
                            symbol |= (self.remainder & 1) as u8;
                            self.remainder >>= 1;
                        }
                        output[m] = symbol;
                        m += 1;
                        self.bits_held -= self.modulus;
                    }
                }
            }
            BitOrder::MsBit => {
                const SHIFT: u32 = 32;
                while n < in_elements && m < out_elements {
                    self.remainder |= (input[n] as u32) << (SHIFT - 8 - self.bits_held);
                    n += 1;
                    self.bits_held += 8;
                    while self.bits_held >= self.modulus && m < out_elements {
                        output[m] = (self.remainder >> (SHIFT - self.modulus)) as u8;
                        self.remainder <<= self.modulus;
                        self.bits_held -= self.modulus;
                        m += 1;
                    }
                }
            }
        }

        io.input(0).consume(n);
        io.output(0).produce(m);
        Ok(())
    }
}

pub fn bytes_to_symbols(modulus: u32, order: BitOrder) -> BlockHandle {
    assert!(modulus >= 1 && modulus <= 8, "modulus must be 1..=8");
    BlockBuilder::new("bytes_to_symbols")
        .input(0, Dtype::new(runnel::Scalar::U8))
        .output(0, Dtype::new(runnel::Scalar::U8))
        .build(BytesToSymbols {
            modulus,
            remainder: 0,
            bits_held: 0,
            order,
        })
}
