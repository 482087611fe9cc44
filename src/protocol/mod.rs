//! OSC wire format
//!
//! All traffic lives under the `/AoO` address space:
//!
//! ```text
//! /AoO/sink/<id>/format   iiiiisb   src_id salt channels rate block codec settings
//! /AoO/sink/<id>/data     iiidiiiib src_id salt seq rate chan_onset total nframes frame payload
//! /AoO/src/<id>/request   i         sink_id
//! /AoO/src/<id>/resend    ii(ii)*   sink_id salt [seq frame]...
//! ```
//!
//! `<id>` may be the literal `*` to address every matching object behind an
//! endpoint. Encoding and decoding go through `rosc`, which handles the
//! big-endian scalars and 4-byte blob padding of OSC 1.0.

use rosc::{OscMessage, OscPacket, OscType};

use crate::codec::FormatHeader;
use crate::error::MessageError;
use crate::WILDCARD_ID;

/// Hard upper bound on any datagram the engine emits.
pub const MAX_PACKET_SIZE: usize = 4096;
/// Default `/data` datagram budget.
pub const DEFAULT_PACKET_SIZE: usize = 512;
/// Worst-case bytes of a `/data` message around the payload blob
/// (address pattern, type tags, scalar arguments).
pub const DATA_HEADER_SIZE: usize = 80;

pub const MSG_FORMAT: &str = "format";
pub const MSG_DATA: &str = "data";
pub const MSG_REQUEST: &str = "request";
pub const MSG_RESEND: &str = "resend";

/// Which kind of object a message addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Source,
    Sink,
}

fn id_token(id: i32) -> String {
    if id == WILDCARD_ID {
        "*".to_string()
    } else {
        id.to_string()
    }
}

/// Address of a sink-bound message (`/AoO/sink/<id>/<leaf>`).
pub fn sink_address(id: i32, leaf: &str) -> String {
    format!("/AoO/sink/{}/{}", id_token(id), leaf)
}

/// Address of a source-bound message (`/AoO/src/<id>/<leaf>`).
pub fn source_address(id: i32, leaf: &str) -> String {
    format!("/AoO/src/{}/{}", id_token(id), leaf)
}

/// Split an address pattern into role, target id and leaf.
pub fn parse_address(addr: &str) -> Result<(Role, i32, &str), MessageError> {
    let rest = addr.strip_prefix("/AoO/").ok_or(MessageError::NotAoo)?;
    let (role, rest) = rest.split_once('/').ok_or(MessageError::NotAoo)?;
    let role = match role {
        "src" => Role::Source,
        "sink" => Role::Sink,
        _ => return Err(MessageError::NotAoo),
    };
    let (id, leaf) = rest
        .split_once('/')
        .ok_or_else(|| MessageError::Malformed(format!("missing leaf in '{addr}'")))?;
    let id = if id == "*" {
        WILDCARD_ID
    } else {
        id.parse()
            .map_err(|_| MessageError::Malformed(format!("bad id in '{addr}'")))?
    };
    Ok((role, id, leaf))
}

/// Decode a datagram into a single OSC message, rejecting bundles.
pub fn decode(bytes: &[u8]) -> Result<OscMessage, MessageError> {
    let (_, packet) = rosc::decoder::decode_udp(bytes)
        .map_err(|e| MessageError::Malformed(format!("{e:?}")))?;
    match packet {
        OscPacket::Message(msg) => Ok(msg),
        OscPacket::Bundle(_) => Err(MessageError::Bundle),
    }
}

fn encode(msg: OscMessage) -> Result<Vec<u8>, MessageError> {
    rosc::encoder::encode(&OscPacket::Message(msg))
        .map_err(|e| MessageError::Malformed(format!("{e:?}")))
}

/// One `/data` payload unit: a single fragment of an encoded block.
#[derive(Debug, Clone)]
pub struct DataPacket<'a> {
    pub sequence: i32,
    pub sample_rate: f64,
    pub channel: i32,
    pub total_size: i32,
    pub nframes: i32,
    pub frame: i32,
    pub payload: &'a [u8],
}

/// Build a `/AoO/sink/<id>/data` message.
pub fn encode_data(
    sink_id: i32,
    source_id: i32,
    salt: i32,
    packet: &DataPacket<'_>,
) -> Result<Vec<u8>, MessageError> {
    encode(OscMessage {
        addr: sink_address(sink_id, MSG_DATA),
        args: vec![
            OscType::Int(source_id),
            OscType::Int(salt),
            OscType::Int(packet.sequence),
            OscType::Double(packet.sample_rate),
            OscType::Int(packet.channel),
            OscType::Int(packet.total_size),
            OscType::Int(packet.nframes),
            OscType::Int(packet.frame),
            OscType::Blob(packet.payload.to_vec()),
        ],
    })
}

/// Build a `/AoO/sink/<id>/format` message.
pub fn encode_format(
    sink_id: i32,
    source_id: i32,
    salt: i32,
    header: FormatHeader,
    codec: &str,
    settings: &[u8],
) -> Result<Vec<u8>, MessageError> {
    encode(OscMessage {
        addr: sink_address(sink_id, MSG_FORMAT),
        args: vec![
            OscType::Int(source_id),
            OscType::Int(salt),
            OscType::Int(header.channels as i32),
            OscType::Int(header.sample_rate as i32),
            OscType::Int(header.block_size as i32),
            OscType::String(codec.to_string()),
            OscType::Blob(settings.to_vec()),
        ],
    })
}

/// Build a `/AoO/src/<id>/request` message.
pub fn encode_request(source_id: i32, sink_id: i32) -> Result<Vec<u8>, MessageError> {
    encode(OscMessage {
        addr: source_address(source_id, MSG_REQUEST),
        args: vec![OscType::Int(sink_id)],
    })
}

/// Build a `/AoO/src/<id>/resend` message from `(sequence, frame)` pairs;
/// `frame == -1` requests every fragment of the block.
pub fn encode_resend(
    source_id: i32,
    sink_id: i32,
    salt: i32,
    pairs: &[(i32, i32)],
) -> Result<Vec<u8>, MessageError> {
    let mut args = Vec::with_capacity(2 + pairs.len() * 2);
    args.push(OscType::Int(sink_id));
    args.push(OscType::Int(salt));
    for &(sequence, frame) in pairs {
        args.push(OscType::Int(sequence));
        args.push(OscType::Int(frame));
    }
    encode(OscMessage {
        addr: source_address(source_id, MSG_RESEND),
        args,
    })
}

fn int_arg(args: &[OscType], index: usize, pattern: &'static str) -> Result<i32, MessageError> {
    match args.get(index) {
        Some(OscType::Int(v)) => Ok(*v),
        _ => Err(MessageError::BadArgument { pattern, index }),
    }
}

fn double_arg(args: &[OscType], index: usize, pattern: &'static str) -> Result<f64, MessageError> {
    match args.get(index) {
        Some(OscType::Double(v)) => Ok(*v),
        _ => Err(MessageError::BadArgument { pattern, index }),
    }
}

fn string_arg(args: &[OscType], index: usize, pattern: &'static str) -> Result<String, MessageError> {
    match args.get(index) {
        Some(OscType::String(v)) => Ok(v.clone()),
        _ => Err(MessageError::BadArgument { pattern, index }),
    }
}

fn blob_arg(args: &[OscType], index: usize, pattern: &'static str) -> Result<Vec<u8>, MessageError> {
    match args.get(index) {
        Some(OscType::Blob(v)) => Ok(v.clone()),
        _ => Err(MessageError::BadArgument { pattern, index }),
    }
}

/// Parsed `/format` arguments.
#[derive(Debug, Clone)]
pub struct FormatMessage {
    pub source_id: i32,
    pub salt: i32,
    pub header: FormatHeader,
    pub codec: String,
    pub settings: Vec<u8>,
}

pub fn parse_format(msg: &OscMessage) -> Result<FormatMessage, MessageError> {
    const PATTERN: &str = "/format";
    if msg.args.len() != 7 {
        return Err(MessageError::Arity {
            pattern: PATTERN,
            count: msg.args.len(),
        });
    }
    Ok(FormatMessage {
        source_id: int_arg(&msg.args, 0, PATTERN)?,
        salt: int_arg(&msg.args, 1, PATTERN)?,
        header: FormatHeader {
            channels: int_arg(&msg.args, 2, PATTERN)?.max(0) as u32,
            sample_rate: int_arg(&msg.args, 3, PATTERN)?.max(0) as u32,
            block_size: int_arg(&msg.args, 4, PATTERN)?.max(0) as u32,
        },
        codec: string_arg(&msg.args, 5, PATTERN)?,
        settings: blob_arg(&msg.args, 6, PATTERN)?,
    })
}

/// Parsed `/data` arguments.
#[derive(Debug, Clone)]
pub struct DataMessage {
    pub source_id: i32,
    pub salt: i32,
    pub sequence: i32,
    pub sample_rate: f64,
    pub channel: i32,
    pub total_size: i32,
    pub nframes: i32,
    pub frame: i32,
    pub payload: Vec<u8>,
}

pub fn parse_data(msg: &OscMessage) -> Result<DataMessage, MessageError> {
    const PATTERN: &str = "/data";
    if msg.args.len() != 9 {
        return Err(MessageError::Arity {
            pattern: PATTERN,
            count: msg.args.len(),
        });
    }
    Ok(DataMessage {
        source_id: int_arg(&msg.args, 0, PATTERN)?,
        salt: int_arg(&msg.args, 1, PATTERN)?,
        sequence: int_arg(&msg.args, 2, PATTERN)?,
        sample_rate: double_arg(&msg.args, 3, PATTERN)?,
        channel: int_arg(&msg.args, 4, PATTERN)?,
        total_size: int_arg(&msg.args, 5, PATTERN)?,
        nframes: int_arg(&msg.args, 6, PATTERN)?,
        frame: int_arg(&msg.args, 7, PATTERN)?,
        payload: blob_arg(&msg.args, 8, PATTERN)?,
    })
}

/// Parsed `/request` arguments.
#[derive(Debug, Clone, Copy)]
pub struct RequestMessage {
    pub sink_id: i32,
}

pub fn parse_request(msg: &OscMessage) -> Result<RequestMessage, MessageError> {
    const PATTERN: &str = "/request";
    if msg.args.len() != 1 {
        return Err(MessageError::Arity {
            pattern: PATTERN,
            count: msg.args.len(),
        });
    }
    Ok(RequestMessage {
        sink_id: int_arg(&msg.args, 0, PATTERN)?,
    })
}

/// Parsed `/resend` arguments.
#[derive(Debug, Clone)]
pub struct ResendMessage {
    pub sink_id: i32,
    pub salt: i32,
    pub pairs: Vec<(i32, i32)>,
}

pub fn parse_resend(msg: &OscMessage) -> Result<ResendMessage, MessageError> {
    const PATTERN: &str = "/resend";
    if msg.args.len() < 4 || msg.args.len() % 2 != 0 {
        return Err(MessageError::Arity {
            pattern: PATTERN,
            count: msg.args.len(),
        });
    }
    let npairs = (msg.args.len() - 2) / 2;
    let mut pairs = Vec::with_capacity(npairs);
    for i in 0..npairs {
        pairs.push((
            int_arg(&msg.args, 2 + i * 2, PATTERN)?,
            int_arg(&msg.args, 3 + i * 2, PATTERN)?,
        ));
    }
    Ok(ResendMessage {
        sink_id: int_arg(&msg.args, 0, PATTERN)?,
        salt: int_arg(&msg.args, 1, PATTERN)?,
        pairs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        let (role, id, leaf) = parse_address("/AoO/sink/7/data").unwrap();
        assert_eq!(role, Role::Sink);
        assert_eq!(id, 7);
        assert_eq!(leaf, "data");

        let (role, id, leaf) = parse_address("/AoO/src/*/resend").unwrap();
        assert_eq!(role, Role::Source);
        assert_eq!(id, WILDCARD_ID);
        assert_eq!(leaf, "resend");
    }

    #[test]
    fn test_parse_address_rejects_foreign_patterns() {
        assert!(parse_address("/status").is_err());
        assert!(parse_address("/AoO/peer/1/ping").is_err());
        assert!(parse_address("/AoO/sink/abc/data").is_err());
        assert!(parse_address("/AoO/sink/3").is_err());
    }

    #[test]
    fn test_address_builders_roundtrip() {
        assert_eq!(sink_address(3, MSG_FORMAT), "/AoO/sink/3/format");
        assert_eq!(source_address(WILDCARD_ID, MSG_REQUEST), "/AoO/src/*/request");
    }

    #[test]
    fn test_data_message_roundtrip() {
        let payload = vec![1u8, 2, 3, 4, 5];
        let bytes = encode_data(
            2,
            1,
            0x1234_5678,
            &DataPacket {
                sequence: 42,
                sample_rate: 44100.5,
                channel: 3,
                total_size: 5,
                nframes: 1,
                frame: 0,
                payload: &payload,
            },
        )
        .unwrap();
        assert!(bytes.len() <= DATA_HEADER_SIZE + payload.len());

        let msg = decode(&bytes).unwrap();
        let (role, id, leaf) = parse_address(&msg.addr).unwrap();
        assert_eq!((role, id, leaf), (Role::Sink, 2, MSG_DATA));

        let data = parse_data(&msg).unwrap();
        assert_eq!(data.source_id, 1);
        assert_eq!(data.salt, 0x1234_5678);
        assert_eq!(data.sequence, 42);
        assert_eq!(data.sample_rate, 44100.5);
        assert_eq!(data.channel, 3);
        assert_eq!(data.payload, payload);
    }

    #[test]
    fn test_format_message_roundtrip() {
        let header = FormatHeader {
            channels: 2,
            sample_rate: 48000,
            block_size: 256,
        };
        let bytes = encode_format(5, 1, -7, header, "pcm", &[0, 0, 0, 2]).unwrap();
        let msg = decode(&bytes).unwrap();
        let format = parse_format(&msg).unwrap();
        assert_eq!(format.source_id, 1);
        assert_eq!(format.salt, -7);
        assert_eq!(format.header, header);
        assert_eq!(format.codec, "pcm");
        assert_eq!(format.settings, vec![0, 0, 0, 2]);
    }

    #[test]
    fn test_resend_message_roundtrip() {
        let bytes = encode_resend(1, 2, 99, &[(10, -1), (11, 3)]).unwrap();
        let msg = decode(&bytes).unwrap();
        let resend = parse_resend(&msg).unwrap();
        assert_eq!(resend.sink_id, 2);
        assert_eq!(resend.salt, 99);
        assert_eq!(resend.pairs, vec![(10, -1), (11, 3)]);
    }

    #[test]
    fn test_bundles_are_rejected() {
        let bundle = rosc::OscPacket::Bundle(rosc::OscBundle {
            timetag: rosc::OscTime { seconds: 0, fractional: 1 },
            content: vec![],
        });
        let bytes = rosc::encoder::encode(&bundle).unwrap();
        assert!(matches!(decode(&bytes), Err(MessageError::Bundle)));
    }

    #[test]
    fn test_wrong_arity_is_rejected() {
        let bytes = encode_request(1, 2).unwrap();
        let msg = decode(&bytes).unwrap();
        assert!(parse_format(&msg).is_err());
        assert!(parse_request(&msg).is_ok());
    }
}
