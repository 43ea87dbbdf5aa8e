//! Builders for well-formed D-Bus messages and a scripted SASL exchange, so
//! tests work on real wire bytes.

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

pub const DRIVER: &str = "org.freedesktop.DBus";

#[derive(Debug, Clone)]
pub struct MessageBuilder {
    big_endian: bool,
    msg_type: u8,
    flags: u8,
    serial: u32,
    path: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    error_name: Option<String>,
    reply_serial: Option<u32>,
    destination: Option<String>,
    sender: Option<String>,
    body: Vec<String>,
}

impl MessageBuilder {
    fn new(msg_type: u8) -> Self {
        Self {
            big_endian: false,
            msg_type,
            flags: 0,
            serial: 1,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            reply_serial: None,
            destination: None,
            sender: None,
            body: Vec::new(),
        }
    }

    pub fn method_call(path: &str, interface: &str, member: &str) -> Self {
        let mut b = Self::new(1);
        b.path = Some(path.into());
        b.interface = Some(interface.into());
        b.member = Some(member.into());
        b
    }

    pub fn signal(path: &str, interface: &str, member: &str) -> Self {
        let mut b = Self::method_call(path, interface, member);
        b.msg_type = 4;
        b
    }

    pub fn method_return(reply_serial: u32) -> Self {
        let mut b = Self::new(2);
        b.reply_serial = Some(reply_serial);
        b
    }

    pub fn error(reply_serial: u32, name: &str) -> Self {
        let mut b = Self::new(3);
        b.reply_serial = Some(reply_serial);
        b.error_name = Some(name.into());
        b
    }

    /// The bus driver's reply to `Hello`, assigning `unique`.
    pub fn hello_reply(reply_serial: u32, unique: &str) -> Self {
        Self::method_return(reply_serial)
            .sender(DRIVER)
            .destination(unique)
            .body_string(unique)
    }

    pub fn name_signal(member: &str, unique: &str, name: &str) -> Self {
        Self::signal("/org/freedesktop/DBus", DRIVER, member)
            .sender(DRIVER)
            .destination(unique)
            .body_string(name)
    }

    pub fn serial(mut self, serial: u32) -> Self {
        self.serial = serial;
        self
    }

    pub fn destination(mut self, name: &str) -> Self {
        self.destination = Some(name.into());
        self
    }

    pub fn sender(mut self, name: &str) -> Self {
        self.sender = Some(name.into());
        self
    }

    pub fn body_string(mut self, s: &str) -> Self {
        self.body.push(s.into());
        self
    }

    pub fn no_reply(mut self) -> Self {
        self.flags |= 0x1;
        self
    }

    pub fn big_endian(mut self) -> Self {
        self.big_endian = true;
        self
    }

    pub fn without_interface(mut self) -> Self {
        self.interface = None;
        self
    }

    pub fn build(&self) -> Bytes {
        let mut w = Writer {
            buf: vec![0; 16],
            big_endian: self.big_endian,
        };

        let strings = [
            (1, "o", &self.path),
            (2, "s", &self.interface),
            (3, "s", &self.member),
            (4, "s", &self.error_name),
        ];
        for (code, sig, value) in strings {
            if let Some(v) = value {
                w.field_header(code, sig);
                w.string(v);
            }
        }
        if let Some(serial) = self.reply_serial {
            w.field_header(5, "u");
            w.u32(serial);
        }
        for (code, value) in [(6, &self.destination), (7, &self.sender)] {
            if let Some(v) = value {
                w.field_header(code, "s");
                w.string(v);
            }
        }
        if !self.body.is_empty() {
            w.field_header(8, "g");
            w.signature(&"s".repeat(self.body.len()));
        }
        let fields_len = w.buf.len() - 16;
        w.pad(8);

        let body_start = w.buf.len();
        for s in &self.body {
            w.string(s);
        }
        let body_len = w.buf.len() - body_start;

        let mut fixed = Vec::with_capacity(16);
        fixed.extend_from_slice(&[
            if self.big_endian { b'B' } else { b'l' },
            self.msg_type,
            self.flags,
            1,
        ]);
        for n in [body_len as u32, self.serial, fields_len as u32] {
            fixed.extend_from_slice(&w.encode_u32(n));
        }
        w.buf[..16].copy_from_slice(&fixed);
        Bytes::from(w.buf)
    }
}

struct Writer {
    buf: Vec<u8>,
    big_endian: bool,
}

impl Writer {
    fn pad(&mut self, to: usize) {
        while self.buf.len() % to != 0 {
            self.buf.push(0);
        }
    }

    fn encode_u32(&self, n: u32) -> [u8; 4] {
        if self.big_endian {
            n.to_be_bytes()
        } else {
            n.to_le_bytes()
        }
    }

    fn u32(&mut self, n: u32) {
        self.pad(4);
        let bytes = self.encode_u32(n);
        self.buf.extend_from_slice(&bytes);
    }

    fn string(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    fn signature(&mut self, s: &str) {
        self.buf.push(s.len() as u8);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    fn field_header(&mut self, code: u8, sig: &str) {
        self.pad(8);
        self.buf.push(code);
        self.signature(sig);
    }
}

/// Client side of an EXTERNAL handshake, as a sandboxed peer would send it.
pub async fn client_handshake<S>(stream: &mut S)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    stream.write_all(b"\0AUTH EXTERNAL 31303030\r\n").await.unwrap();
    let mut reader = BufReader::new(&mut *stream);
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    assert!(line.starts_with("OK "), "unexpected auth reply {line:?}");
    stream.write_all(b"BEGIN\r\n").await.unwrap();
}

/// Bus side of the same handshake: accept whatever credentials arrive.
pub async fn bus_handshake<S>(stream: &mut S)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut nul = [0u8; 1];
    stream.read_exact(&mut nul).await.unwrap();
    assert_eq!(nul[0], 0);
    let mut reader = BufReader::new(&mut *stream);
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    assert!(line.starts_with("AUTH "), "unexpected auth line {line:?}");
    drop(reader);
    stream
        .write_all(b"OK 0123456789abcdef0123456789abcdef\r\n")
        .await
        .unwrap();
    let mut begin = [0u8; 7];
    stream.read_exact(&mut begin).await.unwrap();
    assert_eq!(&begin, b"BEGIN\r\n");
}
