//! Receiver engine
//!
//! A sink tracks any number of remote sources, each discovered lazily from
//! its `/format` announcement. The network thread reassembles incoming
//! fragments into blocks, decodes them in sequence order into per-source
//! rings and asks upstream for retransmission of anything missing. The
//! audio thread drains the rings through a drift-tracking resampler and
//! mix-adds every source into the host's output buffer.

use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;
use std::net::SocketAddr;

use crate::audio::{AudioRing, BlockInfo, InfoRing, Resampler, Sample};
use crate::codec::{find_codec, Decoder};
use crate::error::{MessageError, Result};
use crate::event::{Event, StreamState, MAX_EVENTS_PER_TICK};
use crate::protocol::{self, DataMessage, FormatMessage, Role, MAX_PACKET_SIZE};
use crate::stream::block::BlockQueue;
use crate::stream::resend::AckList;
use crate::time::{TimeDll, TimeTag, Timer, TimerState};
use crate::{ReplyFn, WILDCARD_ID};

/// Host-side configuration of a sink.
#[derive(Debug, Clone, Copy)]
pub struct SinkSettings {
    /// Channels of the host DSP callback.
    pub channels: u32,
    /// Sample rate of the host DSP callback.
    pub sample_rate: u32,
    /// Block size of the host DSP callback in sample frames.
    pub block_size: u32,
    /// Receive latency in milliseconds; sizes each source's jitter buffer.
    pub buffer_ms: f64,
    /// How often one block may be re-requested before giving up.
    pub resend_limit: i32,
    /// Minimum spacing between re-requests for the same block.
    pub resend_interval_ms: f64,
    /// Per-burst cap on requested fragments.
    pub resend_max_frames: i32,
    /// Upper bound on one `/resend` datagram in bytes.
    pub resend_packet_size: usize,
    /// Time-filter (DLL) bandwidth.
    pub time_filter_bandwidth: f64,
    /// Clamp the mixed output to [-1, 1].
    pub clip_output: bool,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            channels: 2,
            sample_rate: 48000,
            block_size: 64,
            buffer_ms: crate::constants::DEFAULT_SINK_BUFFER_MS,
            resend_limit: crate::constants::DEFAULT_RESEND_LIMIT,
            resend_interval_ms: crate::constants::DEFAULT_RESEND_INTERVAL_MS,
            resend_max_frames: crate::constants::DEFAULT_RESEND_MAX_FRAMES,
            resend_packet_size: crate::constants::DEFAULT_RESEND_PACKET_SIZE,
            time_filter_bandwidth: crate::constants::DEFAULT_TIME_FILTER_BANDWIDTH,
            clip_output: false,
        }
    }
}

/// Audio callback: non-interleaved channel slices plus this tick's events.
pub type ProcessFn = Box<dyn FnMut(&[&[Sample]], &[Event]) + Send>;

struct Rings {
    audio: AudioRing,
    info: InfoRing,
}

impl Rings {
    /// Queue one silent gap-filler block; fails when either ring is full.
    fn push_silent(&self, sample_rate: f64) -> bool {
        if self.audio.write_available() > 0 && self.info.write_available() > 0 {
            self.audio.push(self.audio.silent_block());
            self.info.push(BlockInfo {
                sample_rate,
                channel: 0,
                state: StreamState::Stop,
            });
            true
        } else {
            false
        }
    }
}

/// Everything the sink knows about one remote source.
struct SourceDesc {
    endpoint: SocketAddr,
    reply: ReplyFn,
    id: i32,
    salt: i32,
    decoder: Option<Box<dyn Decoder>>,
    rings: Option<Rings>,
    resampler: Option<Resampler>,
    queue: BlockQueue,
    acks: AckList,
    /// Next sequence expected by the in-order drain; -1 until the first block.
    next: i32,
    /// Highest sequence seen this stream generation.
    newest: i32,
    last_state: StreamState,
    sample_rate: f64,
    channel: i32,
}

impl SourceDesc {
    fn new(endpoint: SocketAddr, reply: ReplyFn, id: i32, salt: i32) -> Self {
        Self {
            endpoint,
            reply,
            id,
            salt,
            decoder: None,
            rings: None,
            resampler: None,
            queue: BlockQueue::new(1),
            acks: AckList::new(0),
            next: -1,
            newest: 0,
            last_state: StreamState::Stop,
            sample_rate: 0.0,
            channel: 0,
        }
    }

    fn send(&self, bytes: &[u8]) {
        if let Err(e) = (self.reply)(self.endpoint, bytes) {
            tracing::warn!("transport error replying to {}: {}", self.endpoint, e);
        }
    }
}

/// Audio-thread state.
struct ClockState {
    timer: Timer,
    dll: TimeDll,
    /// Channel-major mix buffer, `channels * block_size` samples.
    buffer: Vec<Sample>,
    process_fn: Option<ProcessFn>,
}

/// A receiving endpoint mixing any number of remote streams.
pub struct Sink {
    id: i32,
    settings: Mutex<SinkSettings>,
    clock: Mutex<ClockState>,
    /// Seconds elapsed on the audio clock, published for ack rate limiting.
    elapsed: AtomicCell<f64>,
    sources: Mutex<Vec<SourceDesc>>,
}

impl Sink {
    pub fn new(id: i32) -> Self {
        let settings = SinkSettings::default();
        Self {
            id,
            settings: Mutex::new(settings),
            clock: Mutex::new(ClockState {
                timer: Timer::new(settings.sample_rate as f64, settings.block_size as f64),
                dll: TimeDll::default(),
                buffer: Vec::new(),
                process_fn: None,
            }),
            elapsed: AtomicCell::new(0.0),
            sources: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    /// Apply host-side geometry and install the audio callback. Existing
    /// source descriptors are re-sized for the new geometry.
    pub fn setup(&self, mut settings: SinkSettings, process_fn: ProcessFn) {
        settings.buffer_ms = settings.buffer_ms.max(0.0);
        settings.resend_limit = settings.resend_limit.max(0);
        settings.resend_interval_ms = settings.resend_interval_ms.max(0.0);
        settings.resend_max_frames = settings.resend_max_frames.max(1);
        settings.resend_packet_size = settings.resend_packet_size.clamp(64, MAX_PACKET_SIZE);
        settings.time_filter_bandwidth = settings.time_filter_bandwidth.clamp(0.0, 1.0);
        *self.settings.lock() = settings;

        let mut clock = self.clock.lock();
        clock.timer = Timer::new(settings.sample_rate as f64, settings.block_size as f64);
        clock.dll = TimeDll::default();
        clock.buffer = vec![0.0; settings.block_size as usize * settings.channels as usize];
        clock.process_fn = Some(process_fn);
        drop(clock);
        self.elapsed.store(0.0);

        let mut sources = self.sources.lock();
        for desc in sources.iter_mut() {
            Self::update_source(desc, &settings);
        }
    }

    /// Handle an incoming sink-bound datagram (`/format` or `/data`).
    pub fn handle_message(&self, bytes: &[u8], endpoint: SocketAddr, reply: ReplyFn) -> Result<()> {
        let msg = protocol::decode(bytes).map_err(|e| {
            tracing::warn!("{}", e);
            e
        })?;
        let (role, id, leaf) = protocol::parse_address(&msg.addr).map_err(|e| {
            tracing::warn!("not an AoO message");
            e
        })?;
        if role != Role::Sink {
            tracing::warn!("message for wrong role");
            return Err(MessageError::NotAoo.into());
        }
        if id != self.id && id != WILDCARD_ID {
            tracing::warn!("wrong sink id {}", id);
            return Err(MessageError::WrongId(id).into());
        }

        match leaf {
            protocol::MSG_FORMAT => {
                let format = protocol::parse_format(&msg)?;
                self.handle_format(endpoint, reply, &format);
                Ok(())
            }
            protocol::MSG_DATA => {
                let data = protocol::parse_data(&msg)?;
                self.handle_data(endpoint, reply, &data);
                Ok(())
            }
            other => {
                tracing::warn!("unknown message '{}'", other);
                Err(MessageError::UnknownMessage(other.to_string()).into())
            }
        }
    }

    fn handle_format(&self, endpoint: SocketAddr, reply: ReplyFn, format: &FormatMessage) {
        tracing::trace!("handle format message");
        let settings = *self.settings.lock();
        let mut sources = self.sources.lock();

        if format.source_id == WILDCARD_ID {
            for desc in sources.iter_mut().filter(|s| s.endpoint == endpoint) {
                desc.salt = format.salt;
                Self::apply_format(desc, format, &settings);
            }
        } else {
            let desc = match sources
                .iter_mut()
                .position(|s| s.endpoint == endpoint && s.id == format.source_id)
            {
                Some(index) => &mut sources[index],
                None => {
                    sources.push(SourceDesc::new(endpoint, reply, format.source_id, format.salt));
                    sources.last_mut().unwrap()
                }
            };
            desc.salt = format.salt;
            Self::apply_format(desc, format, &settings);
        }
    }

    fn apply_format(desc: &mut SourceDesc, format: &FormatMessage, settings: &SinkSettings) {
        let replace = match &desc.decoder {
            Some(decoder) => decoder.name() != format.codec,
            None => true,
        };
        if replace {
            match find_codec(&format.codec) {
                Some(codec) => desc.decoder = Some(codec.new_decoder()),
                None => {
                    tracing::error!("codec '{}' not supported", format.codec);
                    return;
                }
            }
        }
        let decoder = desc.decoder.as_mut().unwrap();
        if let Err(e) = decoder.read_format(format.header, &format.settings) {
            tracing::error!("couldn't read format: {}", e);
            return;
        }
        Self::update_source(desc, settings);
    }

    /// Recompute a descriptor's buffer geometry from its decoder.
    fn update_source(desc: &mut SourceDesc, settings: &SinkSettings) {
        let Some(decoder) = &desc.decoder else { return };
        let rate = decoder.sample_rate();
        let block = decoder.block_size();
        let channels = decoder.channels();
        if rate == 0 || block == 0 || channels == 0 {
            return;
        }

        let buffer_samples = settings.buffer_ms * rate as f64 * 0.001;
        let nbuffers = ((buffer_samples / block as f64).ceil() as usize).max(1);
        let block_samples = channels as usize * block as usize;

        // pre-fill with silence so the sink outputs the buffer latency
        // immediately instead of popping when the stream starts
        let rings = Rings {
            audio: AudioRing::new(nbuffers, block_samples),
            info: InfoRing::new(nbuffers),
        };
        while rings.push_silent(rate as f64) {}
        desc.rings = Some(rings);

        desc.resampler = Some(Resampler::new(
            block as usize,
            settings.block_size as usize,
            rate as f64,
            settings.sample_rate as f64,
            channels as usize,
        ));
        desc.queue = BlockQueue::new(nbuffers);
        desc.acks.setup(settings.resend_limit);
        desc.next = -1;
        desc.newest = 0;
        desc.channel = 0;
        desc.sample_rate = rate as f64;
        tracing::debug!(
            "update source {}: rate = {}, block size = {}, channels = {}, nbuffers = {}",
            desc.id,
            rate,
            block,
            channels,
            nbuffers
        );
    }

    fn handle_data(&self, endpoint: SocketAddr, reply: ReplyFn, data: &DataMessage) {
        let settings = *self.settings.lock();
        let elapsed = self.elapsed.load();
        let mut sources = self.sources.lock();

        // the salt must match: the source format might have changed
        // without us noticing, e.g. because of dropped datagrams
        let matched = sources
            .iter_mut()
            .find(|s| s.endpoint == endpoint && s.id == data.source_id)
            .map_or(false, |desc| {
                if desc.salt == data.salt {
                    Self::process_data(self.id, desc, data, &settings, elapsed);
                    true
                } else {
                    false
                }
            });
        drop(sources);
        if !matched {
            self.request_format(endpoint, &reply, data.source_id);
        }
    }

    fn process_data(
        sink_id: i32,
        desc: &mut SourceDesc,
        data: &DataMessage,
        settings: &SinkSettings,
        elapsed: f64,
    ) {
        if desc.decoder.is_none() || desc.rings.is_none() {
            tracing::trace!("ignore data message");
            return;
        }
        let nframes = data.nframes.max(1);
        if data.frame < 0 || data.frame >= nframes || data.total_size < 0 {
            tracing::warn!("malformed data message");
            return;
        }
        tracing::trace!(
            "got block: seq = {}, rate = {}, channel = {}, total = {}, nframes = {}, frame = {}",
            data.sequence,
            data.sample_rate,
            data.channel,
            data.total_size,
            nframes,
            data.frame
        );

        if desc.next < 0 {
            desc.next = data.sequence;
        }
        if data.sequence < desc.next {
            tracing::debug!("discarded old block {}", data.sequence);
            return;
        }
        if data.sequence < desc.newest {
            if desc.acks.contains(data.sequence) {
                tracing::trace!("resent block {}", data.sequence);
            } else {
                tracing::debug!("block {} out of order", data.sequence);
            }
        } else if desc.newest > 0 && (data.sequence - desc.newest) > 1 {
            tracing::debug!("skipped {} blocks", data.sequence - desc.newest - 1);
        }

        let nominal_rate = desc.decoder.as_ref().unwrap().sample_rate() as f64;
        let rings = desc.rings.as_ref().unwrap();

        if (data.sequence as i64 - desc.newest as i64) > desc.queue.capacity() as i64 {
            // the gap exceeds the jitter window: network trouble or the
            // stream temporarily stopped. restart from here and keep the
            // output continuous with silence, leaving one slot free.
            desc.queue.clear();
            desc.acks.clear();
            desc.next = data.sequence;
            let mut count = 0;
            while rings.audio.write_available() > 1 && rings.info.write_available() > 1 {
                rings.push_silent(nominal_rate);
                count += 1;
            }
            tracing::debug!("wrote {} silent blocks for transmission gap", count);
        }

        match desc.queue.find_mut(data.sequence) {
            Some(block) => {
                if block.has_frame(data.frame as usize) {
                    tracing::debug!(
                        "frame {} of block {} already received",
                        data.frame,
                        data.sequence
                    );
                    return;
                }
                block.add_frame(data.frame as usize, &data.payload);
            }
            None => {
                if desc.queue.full() {
                    // evict the oldest block; the audio stays continuous
                    // with one silent entry in its place
                    rings.push_silent(nominal_rate);
                    if let Some(front) = desc.queue.front() {
                        tracing::debug!("dropped block {}", front.sequence);
                        desc.acks.remove(front.sequence);
                    }
                    desc.queue.pop_front();
                }
                let block = desc.queue.insert(
                    data.sequence,
                    data.sample_rate,
                    data.channel,
                    data.total_size as usize,
                    nframes as usize,
                );
                block.add_frame(data.frame as usize, &data.payload);
            }
        }

        if let Some(block) = desc.queue.find_mut(data.sequence) {
            if block.complete() {
                // the block is no longer missing anything
                desc.acks.remove(data.sequence);
            }
        }

        if data.sequence > desc.newest {
            desc.newest = data.sequence;
        }

        Self::drain_in_order(desc);
        Self::evict_outdated(desc);

        if !desc.queue.is_empty() {
            Self::request_missing(sink_id, desc, settings, elapsed);
            let removed = desc.acks.remove_before(desc.next);
            if removed > 0 {
                tracing::trace!("ack list: removed {} outdated entries", removed);
            }
        } else if !desc.acks.is_empty() {
            desc.acks.clear();
        }
    }

    /// Decode consecutive complete blocks into the rings while no earlier
    /// block is still missing.
    fn drain_in_order(desc: &mut SourceDesc) {
        let rings = desc.rings.as_ref().unwrap();
        let decoder = desc.decoder.as_mut().unwrap();
        let block_samples = rings.audio.block_samples();

        let mut next = desc.next;
        let mut count = 0;
        for block in desc.queue.iter() {
            if block.sequence != next
                || !block.complete()
                || rings.audio.write_available() == 0
                || rings.info.write_available() == 0
            {
                break;
            }
            let mut samples = vec![0.0; block_samples];
            match decoder.decode(block.payload(), &mut samples) {
                Ok(n) if n > 0 => {}
                Ok(_) | Err(_) => {
                    tracing::debug!(
                        "bad block: size = {}, samples = {}",
                        block.size(),
                        block_samples
                    );
                    samples.fill(0.0);
                }
            }
            rings.audio.push(samples);
            rings.info.push(BlockInfo {
                sample_rate: block.sample_rate,
                channel: block.channel,
                state: StreamState::Play,
            });
            next += 1;
            count += 1;
        }
        desc.next = next;
        for _ in 0..count {
            desc.queue.pop_front();
        }
    }

    /// Drop front blocks that fell behind the jitter window.
    fn evict_outdated(desc: &mut SourceDesc) {
        while let Some(front) = desc.queue.front() {
            let old = front.sequence;
            if (desc.newest as i64 - old as i64) < desc.queue.capacity() as i64 {
                break;
            }
            tracing::debug!("pop outdated block {}", old);
            desc.acks.remove(old);
            desc.queue.pop_front();
            if desc.next <= old {
                desc.next = old + 1;
            }
        }
    }

    /// Scan the queue for holes and emit rate-limited `/resend` requests:
    /// first missing fragments of incomplete blocks (except the newest),
    /// then whole blocks missing between `next` and the queued ones.
    fn request_missing(sink_id: i32, desc: &mut SourceDesc, settings: &SinkSettings, elapsed: f64) {
        let interval = settings.resend_interval_ms * 0.001;
        let max_frames = settings.resend_max_frames;
        let mut requests: Vec<(i32, i32)> = Vec::new();
        let mut numframes = 0i32;

        let len = desc.queue.len();
        'incomplete: for block in desc.queue.iter().take(len.saturating_sub(1)) {
            if block.complete() {
                continue;
            }
            if !desc.acks.get(block.sequence).check(elapsed, interval) {
                continue;
            }
            for frame in 0..block.num_frames() {
                if block.has_frame(frame) {
                    continue;
                }
                if numframes >= max_frames {
                    break 'incomplete;
                }
                requests.push((block.sequence, frame as i32));
                numframes += 1;
            }
        }

        let mut next = desc.next;
        'missing: for block in desc.queue.iter() {
            let missing = block.sequence - next;
            for i in 0..missing.max(0) {
                if !desc.acks.get(next + i).check(elapsed, interval) {
                    continue;
                }
                if numframes + block.num_frames() as i32 > max_frames {
                    break 'missing;
                }
                requests.push((next + i, -1));
                numframes += block.num_frames() as i32;
            }
            next = block.sequence + 1;
        }

        if requests.is_empty() {
            return;
        }
        tracing::trace!("requesting {} frames", numframes);

        // split so each datagram stays under the resend packet budget
        let max_addr = 32usize;
        let max_data = settings.resend_packet_size.saturating_sub(max_addr + 16).max(10);
        let max_requests = (max_data / 10).max(1);
        for chunk in requests.chunks(max_requests) {
            match protocol::encode_resend(desc.id, sink_id, desc.salt, chunk) {
                Ok(bytes) => desc.send(&bytes),
                Err(e) => tracing::error!("invalid resend message: {}", e),
            }
        }
    }

    /// Ask a source to (re-)announce its format.
    fn request_format(&self, endpoint: SocketAddr, reply: &ReplyFn, source_id: i32) {
        tracing::debug!("request format from source {}", source_id);
        match protocol::encode_request(source_id, self.id) {
            Ok(bytes) => {
                if let Err(e) = reply(endpoint, &bytes) {
                    tracing::warn!("transport error replying to {}: {}", endpoint, e);
                }
            }
            Err(e) => tracing::error!("invalid request message: {}", e),
        }
    }

    /// Produce one block of mixed output and hand it to the host callback.
    ///
    /// Called from the audio thread with the wall-clock time of this tick.
    /// Returns true iff any source contributed audio or events.
    pub fn process(&self, t: TimeTag) -> bool {
        let settings = *self.settings.lock();
        let mut clock = self.clock.lock();
        let clock = &mut *clock;
        if clock.process_fn.is_none() {
            return false;
        }

        match clock.timer.update(t) {
            TimerState::Reset => {
                tracing::debug!("setup time DLL for sink");
                clock.dll.setup(
                    settings.sample_rate as f64,
                    settings.block_size as f64,
                    settings.time_filter_bandwidth,
                    0.0,
                );
            }
            TimerState::Ok => {
                let elapsed = clock.timer.elapsed();
                clock.dll.update(elapsed);
            }
            TimerState::Error(_) => {
                clock.timer.reset();
            }
        }
        self.elapsed.store(clock.timer.elapsed());

        clock.buffer.fill(0.0);
        let local_block = settings.block_size as usize;
        let local_channels = settings.channels as usize;
        let dll_rate = clock.dll.sample_rate();

        let mut events: Vec<Event> = Vec::new();
        let mut did_something = false;

        let mut sources = self.sources.lock();
        for desc in sources.iter_mut() {
            let Some(decoder) = &desc.decoder else { continue };
            let channels = decoder.channels() as usize;
            let dec_block = decoder.block_size() as usize;
            let Some(rings) = &desc.rings else { continue };
            let Some(resampler) = &mut desc.resampler else { continue };

            // move finished blocks into the resampler
            while !rings.audio.is_empty()
                && !rings.info.is_empty()
                && resampler.write_available() >= dec_block
            {
                let Some(info) = rings.info.pop() else { break };
                let Some(block) = rings.audio.pop() else { break };
                desc.channel = info.channel;
                desc.sample_rate = info.sample_rate;
                resampler.write(&block);

                if info.state != desc.last_state && events.len() < MAX_EVENTS_PER_TICK {
                    events.push(Event::SourceState {
                        endpoint: desc.endpoint,
                        id: desc.id,
                        state: info.state,
                    });
                    desc.last_state = info.state;
                }
            }

            resampler.update(desc.sample_rate, dll_rate);

            if resampler.read_available() >= local_block {
                let mut samples = vec![0.0; local_block * channels];
                resampler.read(&mut samples);

                // mix-add at the requested channel onset; out-of-range
                // source channels are silently ignored
                for i in 0..channels {
                    let channel = i as i64 + desc.channel as i64;
                    if channel < 0 || channel >= local_channels as i64 {
                        continue;
                    }
                    let offset = channel as usize * local_block;
                    for j in 0..local_block {
                        clock.buffer[offset + j] += samples[j * channels + i];
                    }
                }
                did_something = true;
            } else if desc.last_state != StreamState::Stop && events.len() < MAX_EVENTS_PER_TICK {
                // the buffer ran out
                events.push(Event::SourceState {
                    endpoint: desc.endpoint,
                    id: desc.id,
                    state: StreamState::Stop,
                });
                desc.last_state = StreamState::Stop;
                did_something = true;
            }
        }
        drop(sources);

        if !did_something {
            return false;
        }
        if settings.clip_output {
            for sample in clock.buffer.iter_mut() {
                *sample = sample.clamp(-1.0, 1.0);
            }
        }
        let slices: Vec<&[Sample]> = clock
            .buffer
            .chunks(local_block)
            .take(local_channels)
            .collect();
        (clock.process_fn.as_mut().unwrap())(&slices, &events);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::pcm;
    use crate::codec::FormatHeader;
    use std::sync::Arc;

    fn endpoint() -> SocketAddr {
        "10.0.0.1:7000".parse().unwrap()
    }

    fn capture() -> (ReplyFn, Arc<Mutex<Vec<Vec<u8>>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let reply_log = log.clone();
        let reply: ReplyFn = Arc::new(move |_addr, bytes: &[u8]| {
            reply_log.lock().push(bytes.to_vec());
            Ok(bytes.len())
        });
        (reply, log)
    }

    fn test_sink() -> (Sink, Arc<Mutex<Vec<Vec<f32>>>>) {
        crate::initialize();
        let sink = Sink::new(2);
        let output = Arc::new(Mutex::new(Vec::new()));
        let output_log = output.clone();
        sink.setup(
            SinkSettings {
                channels: 1,
                sample_rate: 44100,
                block_size: 64,
                buffer_ms: 20.0,
                ..Default::default()
            },
            Box::new(move |channels, _events| {
                output_log.lock().push(channels[0].to_vec());
            }),
        );
        (sink, output)
    }

    fn format_bytes(salt: i32) -> Vec<u8> {
        protocol::encode_format(
            2,
            1,
            salt,
            FormatHeader {
                channels: 1,
                sample_rate: 44100,
                block_size: 64,
            },
            pcm::CODEC_NAME,
            &[0, 0, 0, 2],
        )
        .unwrap()
    }

    fn data_bytes(salt: i32, sequence: i32, value: f32) -> Vec<u8> {
        let samples = vec![value; 64];
        let mut payload = vec![0u8; 64 * 4];
        for (sample, chunk) in samples.iter().zip(payload.chunks_exact_mut(4)) {
            chunk.copy_from_slice(&sample.to_be_bytes());
        }
        protocol::encode_data(
            2,
            1,
            salt,
            &protocol::DataPacket {
                sequence,
                sample_rate: 44100.0,
                channel: 0,
                total_size: payload.len() as i32,
                nframes: 1,
                frame: 0,
                payload: &payload,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_format_creates_descriptor_with_silence() {
        let (sink, output) = test_sink();
        let (reply, log) = capture();
        sink.handle_message(&format_bytes(11), endpoint(), reply)
            .unwrap();
        assert!(log.lock().is_empty());

        // the pre-filled buffer plays out as silence right away
        assert!(sink.process(TimeTag::from_seconds(1.0)));
        let blocks = output.lock();
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_salt_mismatch_requests_format() {
        let (sink, _) = test_sink();
        let (reply, log) = capture();
        sink.handle_message(&format_bytes(11), endpoint(), reply.clone())
            .unwrap();

        sink.handle_message(&data_bytes(99, 0, 0.5), endpoint(), reply)
            .unwrap();

        let packets = log.lock();
        assert_eq!(packets.len(), 1);
        let msg = protocol::decode(&packets[0]).unwrap();
        assert_eq!(msg.addr, "/AoO/src/1/request");
        let request = protocol::parse_request(&msg).unwrap();
        assert_eq!(request.sink_id, 2);
    }

    #[test]
    fn test_unknown_source_requests_format() {
        let (sink, _) = test_sink();
        let (reply, log) = capture();
        sink.handle_message(&data_bytes(11, 0, 0.5), endpoint(), reply)
            .unwrap();
        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn test_data_decodes_in_order_and_only_once() {
        let (sink, output) = test_sink();
        let (reply, _) = capture();
        sink.handle_message(&format_bytes(11), endpoint(), reply.clone())
            .unwrap();

        // 14 blocks of 64 samples cover the 20 ms buffer at 44.1 kHz;
        // feed enough audio to flush the pre-filled silence through
        for sequence in 0..28 {
            // a duplicate delivery must be ignored
            sink.handle_message(&data_bytes(11, sequence, 0.5), endpoint(), reply.clone())
                .unwrap();
            sink.handle_message(&data_bytes(11, sequence, 0.9), endpoint(), reply.clone())
                .unwrap();
            sink.process(TimeTag::from_seconds(1.0 + sequence as f64 * 64.0 / 44100.0));
        }

        let blocks = output.lock();
        let last = blocks.last().unwrap();
        // had the duplicate been decoded too, the level would read 0.9
        assert!(last.iter().all(|&x| (x - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_reorder_triggers_resend_for_missing_block() {
        let (sink, _) = test_sink();
        let (reply, log) = capture();
        sink.handle_message(&format_bytes(11), endpoint(), reply.clone())
            .unwrap();

        for sequence in [0, 1, 3] {
            sink.handle_message(&data_bytes(11, sequence, 0.5), endpoint(), reply.clone())
                .unwrap();
        }

        let packets = log.lock();
        assert_eq!(packets.len(), 1);
        let msg = protocol::decode(&packets[0]).unwrap();
        assert_eq!(msg.addr, "/AoO/src/1/resend");
        let resend = protocol::parse_resend(&msg).unwrap();
        assert_eq!(resend.sink_id, 2);
        assert_eq!(resend.salt, 11);
        assert_eq!(resend.pairs, vec![(2, -1)]);
    }

    #[test]
    fn test_large_gap_resets_stream() {
        let (sink, _) = test_sink();
        let (reply, log) = capture();
        sink.handle_message(&format_bytes(11), endpoint(), reply.clone())
            .unwrap();

        for sequence in 0..5 {
            sink.handle_message(&data_bytes(11, sequence, 0.5), endpoint(), reply.clone())
                .unwrap();
        }
        log.lock().clear();

        // far beyond the 14-block window
        sink.handle_message(&data_bytes(11, 100, 0.5), endpoint(), reply.clone())
            .unwrap();
        // no resend for the skipped range: the stream restarted at 100
        assert!(log.lock().is_empty());

        sink.handle_message(&data_bytes(11, 101, 0.5), endpoint(), reply)
            .unwrap();
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_format_change_discards_old_salt() {
        let (sink, _) = test_sink();
        let (reply, log) = capture();
        sink.handle_message(&format_bytes(11), endpoint(), reply.clone())
            .unwrap();
        sink.handle_message(&format_bytes(12), endpoint(), reply.clone())
            .unwrap();

        // data for the previous stream generation elicits a /request
        sink.handle_message(&data_bytes(11, 0, 0.5), endpoint(), reply.clone())
            .unwrap();
        assert_eq!(log.lock().len(), 1);
        log.lock().clear();

        // the new generation is accepted silently
        sink.handle_message(&data_bytes(12, 0, 0.5), endpoint(), reply)
            .unwrap();
        assert!(log.lock().is_empty());
    }
}
