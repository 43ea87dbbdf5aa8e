//! D-Bus message framing and header decoding.
//!
//! Framing and decoding fail in different ways. A framing error means the
//! byte stream can no longer be split into messages, so the session is torn
//! down. A header decode error only affects one message, which the relay
//! then denies.
//!
//! Parsing never indexes or panics: every read goes through `Buf` after a
//! `remaining()` check.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Fixed part of every message: endianness, type, flags, version, body
/// length, serial and the byte length of the header field array.
pub const FIXED_HEADER_LEN: usize = 16;

/// Largest message the protocol allows.
pub const MAX_MESSAGE_SIZE: usize = 128 * 1024 * 1024;

pub const PROTOCOL_VERSION: u8 = 1;

pub const FLAG_NO_REPLY_EXPECTED: u8 = 0x1;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("invalid endianness marker {0:#04x}")]
    BadEndianness(u8),

    #[error("unsupported protocol version {0}")]
    BadVersion(u8),

    #[error("message of {0} bytes exceeds the maximum size")]
    TooLarge(usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("message truncated")]
    Truncated,

    #[error("invalid endianness marker")]
    BadEndianness,

    #[error("unknown message type {0}")]
    UnknownType(u8),

    #[error("string is not valid UTF-8 or not NUL-terminated")]
    InvalidString,

    #[error("header field {code} has signature '{signature}'")]
    FieldType { code: u8, signature: String },

    #[error("header field {code} has an unsupported value type '{signature}'")]
    UnsupportedFieldType { code: u8, signature: String },

    #[error("{0} message lacks the {1} header field")]
    MissingField(&'static str, &'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    fn from_marker(marker: u8) -> Option<Self> {
        match marker {
            b'l' => Some(Self::Little),
            b'B' => Some(Self::Big),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

impl MessageType {
    fn from_byte(b: u8) -> Result<Self, DecodeError> {
        match b {
            1 => Ok(Self::MethodCall),
            2 => Ok(Self::MethodReturn),
            3 => Ok(Self::Error),
            4 => Ok(Self::Signal),
            other => Err(DecodeError::UnknownType(other)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MethodCall => "method_call",
            Self::MethodReturn => "method_return",
            Self::Error => "error",
            Self::Signal => "signal",
        }
    }
}

/// Splits a byte stream into whole messages without decoding them.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = Bytes;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, WireError> {
        if src.len() < FIXED_HEADER_LEN {
            return Ok(None);
        }

        let mut head = &src[..FIXED_HEADER_LEN];
        let marker = head.get_u8();
        let endian = Endian::from_marker(marker).ok_or(WireError::BadEndianness(marker))?;
        let _msg_type = head.get_u8();
        let _flags = head.get_u8();
        let version = head.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(WireError::BadVersion(version));
        }
        let (body_len, fields_len) = match endian {
            Endian::Little => {
                let body = head.get_u32_le();
                let _serial = head.get_u32_le();
                (body, head.get_u32_le())
            }
            Endian::Big => {
                let body = head.get_u32();
                let _serial = head.get_u32();
                (body, head.get_u32())
            }
        };

        let header_len = pad8(FIXED_HEADER_LEN as u64 + u64::from(fields_len));
        let total = header_len + u64::from(body_len);
        if total > MAX_MESSAGE_SIZE as u64 {
            return Err(WireError::TooLarge(total as usize));
        }
        let total = total as usize;

        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        Ok(Some(src.split_to(total).freeze()))
    }
}

impl Encoder<Bytes> for MessageCodec {
    type Error = WireError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), WireError> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

fn pad8(n: u64) -> u64 {
    (n + 7) & !7
}

/// The parts of a message header the relay looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub endian: Endian,
    pub message_type: MessageType,
    pub flags: u8,
    pub serial: u32,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub reply_serial: Option<u32>,
    pub destination: Option<String>,
    pub sender: Option<String>,
    pub signature: Option<String>,
    pub unix_fds: Option<u32>,
    body_offset: usize,
}

impl Header {
    pub fn expects_reply(&self) -> bool {
        self.message_type == MessageType::MethodCall && self.flags & FLAG_NO_REPLY_EXPECTED == 0
    }

    /// First body argument, when the body signature starts with a string.
    pub fn first_string_arg(&self, frame: &[u8]) -> Option<String> {
        if !self.signature.as_deref()?.starts_with('s') {
            return None;
        }
        let mut r = Reader::new(frame, self.endian);
        r.skip(self.body_offset).ok()?;
        r.string().ok()
    }
}

const FIELD_PATH: u8 = 1;
const FIELD_INTERFACE: u8 = 2;
const FIELD_MEMBER: u8 = 3;
const FIELD_ERROR_NAME: u8 = 4;
const FIELD_REPLY_SERIAL: u8 = 5;
const FIELD_DESTINATION: u8 = 6;
const FIELD_SENDER: u8 = 7;
const FIELD_SIGNATURE: u8 = 8;
const FIELD_UNIX_FDS: u8 = 9;

/// Decode the header of one framed message.
pub fn parse_header(frame: &[u8]) -> Result<Header, DecodeError> {
    let marker = frame.first().copied().ok_or(DecodeError::Truncated)?;
    let endian = Endian::from_marker(marker).ok_or(DecodeError::BadEndianness)?;
    let mut r = Reader::new(frame, endian);

    r.skip(1)?;
    let message_type = MessageType::from_byte(r.u8()?)?;
    let flags = r.u8()?;
    let _version = r.u8()?;
    let _body_len = r.u32()?;
    let serial = r.u32()?;
    let fields_len = r.u32()? as usize;
    let fields_end = FIXED_HEADER_LEN
        .checked_add(fields_len)
        .ok_or(DecodeError::Truncated)?;

    let mut header = Header {
        endian,
        message_type,
        flags,
        serial,
        path: None,
        interface: None,
        member: None,
        error_name: None,
        reply_serial: None,
        destination: None,
        sender: None,
        signature: None,
        unix_fds: None,
        body_offset: 0,
    };

    while r.pos() < fields_end {
        r.align(8)?;
        let code = r.u8()?;
        let signature = r.signature()?;
        let expect = |wanted: &str| {
            if signature == wanted {
                Ok(())
            } else {
                Err(DecodeError::FieldType {
                    code,
                    signature: signature.clone(),
                })
            }
        };
        match code {
            FIELD_PATH => {
                expect("o")?;
                header.path = Some(r.string()?);
            }
            FIELD_INTERFACE | FIELD_MEMBER | FIELD_ERROR_NAME | FIELD_DESTINATION | FIELD_SENDER => {
                expect("s")?;
                let value = Some(r.string()?);
                match code {
                    FIELD_INTERFACE => header.interface = value,
                    FIELD_MEMBER => header.member = value,
                    FIELD_ERROR_NAME => header.error_name = value,
                    FIELD_DESTINATION => header.destination = value,
                    _ => header.sender = value,
                }
            }
            FIELD_REPLY_SERIAL | FIELD_UNIX_FDS => {
                expect("u")?;
                let value = Some(r.u32()?);
                if code == FIELD_REPLY_SERIAL {
                    header.reply_serial = value;
                } else {
                    header.unix_fds = value;
                }
            }
            FIELD_SIGNATURE => {
                expect("g")?;
                header.signature = Some(r.signature()?);
            }
            _ => r.skip_value(code, &signature)?,
        }
    }
    if r.pos() != fields_end {
        return Err(DecodeError::Truncated);
    }
    r.align(8)?;
    header.body_offset = r.pos();

    check_required(&header)?;
    Ok(header)
}

fn check_required(h: &Header) -> Result<(), DecodeError> {
    let kind = h.message_type.as_str();
    let require = |present: bool, field: &'static str| {
        if present {
            Ok(())
        } else {
            Err(DecodeError::MissingField(kind, field))
        }
    };
    match h.message_type {
        MessageType::MethodCall => {
            require(h.path.is_some(), "PATH")?;
            require(h.member.is_some(), "MEMBER")
        }
        MessageType::Signal => {
            require(h.path.is_some(), "PATH")?;
            require(h.interface.is_some(), "INTERFACE")?;
            require(h.member.is_some(), "MEMBER")
        }
        MessageType::Error => {
            require(h.error_name.is_some(), "ERROR_NAME")?;
            require(h.reply_serial.is_some(), "REPLY_SERIAL")
        }
        MessageType::MethodReturn => require(h.reply_serial.is_some(), "REPLY_SERIAL"),
    }
}

/// Cursor over a whole message. Alignment is relative to the message start.
struct Reader<'a> {
    buf: &'a [u8],
    len: usize,
    endian: Endian,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], endian: Endian) -> Self {
        Self {
            buf,
            len: buf.len(),
            endian,
        }
    }

    fn pos(&self) -> usize {
        self.len - self.buf.remaining()
    }

    fn skip(&mut self, n: usize) -> Result<(), DecodeError> {
        if self.buf.remaining() < n {
            return Err(DecodeError::Truncated);
        }
        self.buf.advance(n);
        Ok(())
    }

    fn align(&mut self, to: usize) -> Result<(), DecodeError> {
        let pad = (to - self.pos() % to) % to;
        self.skip(pad)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.remaining() < n {
            return Err(DecodeError::Truncated);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        if self.buf.remaining() < 1 {
            return Err(DecodeError::Truncated);
        }
        Ok(self.buf.get_u8())
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        self.align(4)?;
        if self.buf.remaining() < 4 {
            return Err(DecodeError::Truncated);
        }
        Ok(match self.endian {
            Endian::Little => self.buf.get_u32_le(),
            Endian::Big => self.buf.get_u32(),
        })
    }

    fn text(&mut self, len: usize) -> Result<String, DecodeError> {
        let bytes = self.take(len)?;
        if self.u8()? != 0 {
            return Err(DecodeError::InvalidString);
        }
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidString)
    }

    fn string(&mut self) -> Result<String, DecodeError> {
        let len = self.u32()? as usize;
        self.text(len)
    }

    fn signature(&mut self) -> Result<String, DecodeError> {
        let len = self.u8()? as usize;
        self.text(len)
    }

    /// Skip a header field value of a basic type. Unknown fields must be
    /// ignored, but container values are not worth walking here.
    fn skip_value(&mut self, code: u8, signature: &str) -> Result<(), DecodeError> {
        let (align, size) = match signature {
            "y" => (1, 1),
            "n" | "q" => (2, 2),
            "b" | "i" | "u" | "h" => (4, 4),
            "x" | "t" | "d" => (8, 8),
            "s" | "o" => {
                self.string()?;
                return Ok(());
            }
            "g" => {
                self.signature()?;
                return Ok(());
            }
            _ => {
                return Err(DecodeError::UnsupportedFieldType {
                    code,
                    signature: signature.to_string(),
                })
            }
        };
        self.align(align)?;
        self.skip(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MessageBuilder;

    fn decode_all(codec: &mut MessageCodec, buf: &mut BytesMut) -> Vec<Bytes> {
        let mut out = Vec::new();
        while let Some(frame) = codec.decode(buf).unwrap() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn frames_split_across_reads() {
        let a = MessageBuilder::method_call("/a", "com.X.A", "One").serial(1).build();
        let b = MessageBuilder::signal("/b", "com.X.B", "Two").serial(2).build();
        let mut stream = BytesMut::new();
        stream.extend_from_slice(&a);
        stream.extend_from_slice(&b);
        let all = stream.freeze();

        let mut codec = MessageCodec;
        let mut buf = BytesMut::new();
        let mut frames = Vec::new();
        for chunk in all.chunks(5) {
            buf.extend_from_slice(chunk);
            frames.extend(decode_all(&mut codec, &mut buf));
        }
        assert_eq!(frames, vec![a, b]);
        assert!(buf.is_empty());
    }

    #[test]
    fn encoder_copies_bytes_unchanged() {
        let msg = MessageBuilder::method_call("/", "a.b", "C").build();
        let mut dst = BytesMut::new();
        MessageCodec.encode(msg.clone(), &mut dst).unwrap();
        assert_eq!(&dst[..], &msg[..]);
    }

    #[test]
    fn framing_rejects_bad_marker_version_and_size() {
        let mut buf = BytesMut::from(&[b'x', 1, 0, 1, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0][..]);
        assert!(matches!(MessageCodec.decode(&mut buf), Err(WireError::BadEndianness(b'x'))));

        let mut buf = BytesMut::from(&[b'l', 1, 0, 2, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0][..]);
        assert!(matches!(MessageCodec.decode(&mut buf), Err(WireError::BadVersion(2))));

        let mut buf = BytesMut::from(&[b'l', 1, 0, 1, 0xff, 0xff, 0xff, 0xff, 1, 0, 0, 0, 0, 0, 0, 0][..]);
        assert!(matches!(MessageCodec.decode(&mut buf), Err(WireError::TooLarge(_))));
    }

    #[test]
    fn parses_call_header_fields() {
        let frame = MessageBuilder::method_call("/org/x", "org.x.Iface", "Ping")
            .destination(":1.5")
            .sender(":1.9")
            .serial(42)
            .body_string("hello")
            .build();
        let h = parse_header(&frame).unwrap();
        assert_eq!(h.message_type, MessageType::MethodCall);
        assert_eq!(h.serial, 42);
        assert_eq!(h.path.as_deref(), Some("/org/x"));
        assert_eq!(h.interface.as_deref(), Some("org.x.Iface"));
        assert_eq!(h.member.as_deref(), Some("Ping"));
        assert_eq!(h.destination.as_deref(), Some(":1.5"));
        assert_eq!(h.sender.as_deref(), Some(":1.9"));
        assert_eq!(h.signature.as_deref(), Some("s"));
        assert!(h.expects_reply());
        assert_eq!(h.first_string_arg(&frame).as_deref(), Some("hello"));
    }

    #[test]
    fn parses_big_endian_reply() {
        let frame = MessageBuilder::method_return(7).big_endian().serial(3).build();
        let h = parse_header(&frame).unwrap();
        assert_eq!(h.endian, Endian::Big);
        assert_eq!(h.message_type, MessageType::MethodReturn);
        assert_eq!(h.reply_serial, Some(7));
        assert_eq!(h.serial, 3);
    }

    #[test]
    fn no_reply_flag_is_honoured() {
        let frame = MessageBuilder::method_call("/", "a.b", "C").no_reply().build();
        assert!(!parse_header(&frame).unwrap().expects_reply());
    }

    #[test]
    fn missing_required_field_is_a_decode_error() {
        let frame = MessageBuilder::signal("/p", "a.b", "S").without_interface().build();
        assert_eq!(
            parse_header(&frame),
            Err(DecodeError::MissingField("signal", "INTERFACE"))
        );
    }

    #[test]
    fn wrong_field_signature_is_a_decode_error() {
        let mut frame = MessageBuilder::method_call("/p", "a.b", "M").build().to_vec();
        // First field is PATH; its variant signature 'o' sits at offset 18.
        assert_eq!(frame[16], FIELD_PATH);
        frame[18] = b's';
        assert!(matches!(
            parse_header(&frame),
            Err(DecodeError::FieldType { code: FIELD_PATH, .. })
        ));
    }

    #[test]
    fn truncated_and_garbage_never_panic() {
        let frame = MessageBuilder::method_call("/p", "a.b", "M").body_string("x").build();
        for cut in 0..frame.len() {
            let _ = parse_header(&frame[..cut]);
        }
        assert_eq!(parse_header(&[]), Err(DecodeError::Truncated));
        assert_eq!(parse_header(b"zzzz"), Err(DecodeError::BadEndianness));
    }

    #[test]
    fn unknown_type_is_a_decode_error() {
        let mut frame = MessageBuilder::method_call("/p", "a.b", "M").build().to_vec();
        frame[1] = 9;
        assert_eq!(parse_header(&frame), Err(DecodeError::UnknownType(9)));
    }
}
