use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::{GearworkError, Result};

/// Magic prefix of packets travelling client/worker → server.
pub const MAGIC_REQUEST: [u8; 4] = [0, b'R', b'E', b'Q'];
/// Magic prefix of packets travelling server → client/worker.
pub const MAGIC_RESPONSE: [u8; 4] = [0, b'R', b'E', b'S'];

/// Upper bound on a single packet payload. The queue never legitimately
/// sends anything close to this; larger lengths indicate a broken stream.
const MAX_PAYLOAD_BYTES: usize = 16 * 1024 * 1024;

/// The subset of the Gearman binary packet types this library speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PacketType {
    CanDo = 1,
    PreSleep = 4,
    Noop = 6,
    SubmitJob = 7,
    JobCreated = 8,
    GrabJob = 9,
    NoJob = 10,
    JobAssign = 11,
    WorkStatus = 12,
    WorkComplete = 13,
    WorkFail = 14,
    GetStatus = 15,
    EchoReq = 16,
    EchoRes = 17,
    SubmitJobBg = 18,
    Error = 19,
    StatusRes = 20,
    SubmitJobHigh = 21,
    CanDoTimeout = 23,
    SubmitJobHighBg = 32,
    SubmitJobLow = 33,
    SubmitJobLowBg = 34,
}

impl PacketType {
    pub fn from_code(code: u32) -> Option<Self> {
        use PacketType::*;
        let packet_type = match code {
            1 => CanDo,
            4 => PreSleep,
            6 => Noop,
            7 => SubmitJob,
            8 => JobCreated,
            9 => GrabJob,
            10 => NoJob,
            11 => JobAssign,
            12 => WorkStatus,
            13 => WorkComplete,
            14 => WorkFail,
            15 => GetStatus,
            16 => EchoReq,
            17 => EchoRes,
            18 => SubmitJobBg,
            19 => Error,
            20 => StatusRes,
            21 => SubmitJobHigh,
            23 => CanDoTimeout,
            32 => SubmitJobHighBg,
            33 => SubmitJobLow,
            34 => SubmitJobLowBg,
            _ => return None,
        };
        Some(packet_type)
    }

    pub fn code(self) -> u32 {
        self as u32
    }
}

/// One framed packet: a 12-byte header (magic, big-endian type, big-endian
/// payload length) followed by the payload, whose arguments are
/// NUL-separated. The final argument may itself contain NUL bytes (result
/// payloads are opaque), so splitting is bounded by the expected count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a packet from NUL-joined argument slices.
    pub fn new(packet_type: PacketType, args: &[&[u8]]) -> Self {
        Packet {
            packet_type,
            payload: args.join(&0u8),
        }
    }

    /// Split the payload into exactly `count` arguments. The last argument
    /// receives the remainder, NUL bytes included.
    pub fn args(&self, count: usize) -> Result<Vec<&[u8]>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut parts = Vec::with_capacity(count);
        let mut rest: &[u8] = &self.payload;
        for _ in 0..count - 1 {
            let split = rest.iter().position(|&b| b == 0).ok_or_else(|| {
                GearworkError::Queue(format!(
                    "{:?} packet carries fewer than {count} arguments",
                    self.packet_type
                ))
            })?;
            parts.push(&rest[..split]);
            rest = &rest[split + 1..];
        }
        parts.push(rest);
        Ok(parts)
    }

    /// Split the payload and decode every argument as UTF-8 text.
    pub fn text_args(&self, count: usize) -> Result<Vec<String>> {
        self.args(count)?
            .into_iter()
            .map(|arg| {
                String::from_utf8(arg.to_vec()).map_err(|_| {
                    GearworkError::Queue(format!(
                        "{:?} packet argument is not valid UTF-8",
                        self.packet_type
                    ))
                })
            })
            .collect()
    }
}

/// Write one packet with the given magic prefix.
pub async fn write_packet<W>(writer: &mut W, magic: [u8; 4], packet: &Packet) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut frame = Vec::with_capacity(12 + packet.payload.len());
    frame.extend_from_slice(&magic);
    frame.extend_from_slice(&packet.packet_type.code().to_be_bytes());
    frame.extend_from_slice(&(packet.payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&packet.payload);

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one packet, validating the magic prefix and the payload length.
pub async fn read_packet<R>(reader: &mut R, magic: [u8; 4]) -> Result<Packet>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 12];
    reader.read_exact(&mut header).await?;

    if header[..4] != magic {
        return Err(GearworkError::Queue(format!(
            "unexpected packet magic {:?}",
            &header[..4]
        )));
    }

    let code = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    let packet_type = PacketType::from_code(code)
        .ok_or_else(|| GearworkError::Queue(format!("unknown packet type {code}")))?;

    let length = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
    if length > MAX_PAYLOAD_BYTES {
        return Err(GearworkError::Queue(format!(
            "packet payload of {length} bytes exceeds the {MAX_PAYLOAD_BYTES} byte limit"
        )));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    Ok(Packet {
        packet_type,
        payload,
    })
}

/// Map a server `ERROR` packet to a queue error carrying the backend text.
pub fn error_from_packet(packet: &Packet) -> GearworkError {
    match packet.text_args(2) {
        Ok(args) => GearworkError::Queue(format!("server error {}: {}", args[0], args[1])),
        Err(_) => GearworkError::Queue("server error with unreadable payload".into()),
    }
}
