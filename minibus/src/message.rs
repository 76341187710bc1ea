//! One wire message: header fields, body buffer, container navigation,
//! sealing, reply construction and the frame codec.

use log::debug;

use crate::codec;
use crate::error::{Error, Result};
use crate::path::object_path_is_valid;
use crate::signature::{
    find_array_element, find_dict_end, find_struct_end, is_basic_token, validate_signature,
    SignatureIter,
};
use crate::value::Value;
use crate::wire::{align_up, alignment_of, LengthToken, WireCursor, WireWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    MethodCall,
    MethodReply,
    Error,
    Signal,
}

impl MessageType {
    fn to_wire(self) -> u8 {
        match self {
            MessageType::MethodCall => 1,
            MessageType::MethodReply => 2,
            MessageType::Error => 3,
            MessageType::Signal => 4,
        }
    }

    fn from_wire(raw: u8) -> Result<MessageType> {
        match raw {
            1 => Ok(MessageType::MethodCall),
            2 => Ok(MessageType::MethodReply),
            3 => Ok(MessageType::Error),
            4 => Ok(MessageType::Signal),
            _ => Err(Error::Frame("unknown message type")),
        }
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MessageFlags: u8 {
        const NO_REPLY_EXPECTED = 1 << 0;
        const NO_AUTO_START = 1 << 1;
        const ALLOW_INTERACTIVE_AUTHORIZATION = 1 << 2;
    }
}

// Header field codes per the marshaling spec.
const FIELD_PATH: u8 = 1;
const FIELD_INTERFACE: u8 = 2;
const FIELD_MEMBER: u8 = 3;
const FIELD_ERROR_NAME: u8 = 4;
const FIELD_REPLY_SERIAL: u8 = 5;
const FIELD_DESTINATION: u8 = 6;
const FIELD_SENDER: u8 = 7;
const FIELD_SIGNATURE: u8 = 8;

#[derive(Debug, Clone)]
struct WriteContainer {
    length: Option<LengthToken>,
}

#[derive(Debug, Clone)]
struct ReadContainer {
    kind: char,
    end: Option<usize>,
}

/// An owned wire message. Outbound messages start unsealed and accept append
/// operations; sealing freezes them. Inbound messages arrive sealed and only
/// accept read operations.
#[derive(Debug, Clone)]
pub struct Message {
    msg_type: MessageType,
    flags: MessageFlags,
    serial: u32,
    reply_serial: Option<u32>,
    path: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    destination: Option<String>,
    sender: Option<String>,
    error_name: Option<String>,
    body_signature: String,
    body: WireWriter,
    rpos: usize,
    sealed: bool,
    write_stack: Vec<WriteContainer>,
    read_stack: Vec<ReadContainer>,
}

impl Message {
    fn empty(msg_type: MessageType) -> Message {
        Message {
            msg_type,
            flags: MessageFlags::empty(),
            serial: 0,
            reply_serial: None,
            path: None,
            interface: None,
            member: None,
            destination: None,
            sender: None,
            error_name: None,
            body_signature: String::new(),
            body: WireWriter::new(),
            rpos: 0,
            sealed: false,
            write_stack: Vec::new(),
            read_stack: Vec::new(),
        }
    }

    pub fn new_method_call(
        destination: &str,
        path: &str,
        interface: &str,
        member: &str,
    ) -> Result<Message> {
        if !object_path_is_valid(path) {
            return Err(Error::InvalidPath(path.to_owned()));
        }
        let mut msg = Message::empty(MessageType::MethodCall);
        msg.destination = Some(destination.to_owned());
        msg.path = Some(path.to_owned());
        msg.interface = Some(interface.to_owned());
        msg.member = Some(member.to_owned());
        Ok(msg)
    }

    pub fn new_signal(path: &str, interface: &str, member: &str) -> Result<Message> {
        if !object_path_is_valid(path) {
            return Err(Error::InvalidPath(path.to_owned()));
        }
        let mut msg = Message::empty(MessageType::Signal);
        msg.path = Some(path.to_owned());
        msg.interface = Some(interface.to_owned());
        msg.member = Some(member.to_owned());
        Ok(msg)
    }

    /// A `org.freedesktop.DBus.Properties.Get` call with the target interface
    /// and property name already appended.
    pub fn new_property_get(
        destination: &str,
        path: &str,
        interface: &str,
        property: &str,
    ) -> Result<Message> {
        let mut msg = Message::new_method_call(
            destination,
            path,
            "org.freedesktop.DBus.Properties",
            "Get",
        )?;
        msg.append("ss", &[Value::from(interface), Value::from(property)])?;
        Ok(msg)
    }

    /// An error reply addressed by reply serial, used when the failed call is
    /// no longer at hand.
    pub fn new_error(
        reply_serial: u32,
        destination: Option<&str>,
        name: &str,
        text: &str,
    ) -> Result<Message> {
        let mut msg = Message::empty(MessageType::Error);
        msg.reply_serial = Some(reply_serial);
        msg.destination = destination.map(str::to_owned);
        msg.error_name = Some(name.to_owned());
        msg.append("s", &[Value::from(text)])?;
        Ok(msg)
    }

    pub fn message_type(&self) -> MessageType {
        self.msg_type
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub(crate) fn set_serial(&mut self, serial: u32) {
        self.serial = serial;
    }

    pub fn reply_serial(&self) -> Option<u32> {
        self.reply_serial
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    pub fn member(&self) -> Option<&str> {
        self.member.as_deref()
    }

    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn error_name(&self) -> Option<&str> {
        self.error_name.as_deref()
    }

    pub fn signature(&self) -> &str {
        &self.body_signature
    }

    pub fn flags(&self) -> MessageFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: MessageFlags) {
        self.flags = flags;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    fn check_unsealed(&self) -> Result<()> {
        if self.sealed {
            return Err(Error::State("message is sealed"));
        }
        Ok(())
    }

    fn check_readable(&self) -> Result<()> {
        if !self.sealed {
            return Err(Error::State("message is not sealed"));
        }
        Ok(())
    }

    /// Freezes the message. Idempotent; fails while a container is open.
    pub fn seal(&mut self) -> Result<()> {
        if self.sealed {
            return Ok(());
        }
        if !self.write_stack.is_empty() {
            return Err(Error::State("cannot seal with an open container"));
        }
        self.sealed = true;
        Ok(())
    }

    /// Appends values against a basic-only signature, one value per token.
    pub fn append_basic(&mut self, sig: &str, values: &[Value]) -> Result<()> {
        self.check_unsealed()?;
        if let Some(token) = sig.chars().find(|t| !is_basic_token(*t)) {
            return Err(Error::Signature(format!(
                "'{}' is not a basic token",
                token
            )));
        }
        if sig.len() != values.len() {
            return Err(Error::TypeMismatch {
                expected: "one value per signature token",
                found: "mismatched value count",
            });
        }
        for (token, value) in sig.chars().zip(values) {
            self.write_basic(token, value)?;
        }
        if self.write_stack.is_empty() {
            self.body_signature.push_str(sig);
        }
        Ok(())
    }

    /// Appends values against an arbitrary signature, one value per complete
    /// top-level type.
    pub fn append(&mut self, sig: &str, values: &[Value]) -> Result<()> {
        self.check_unsealed()?;
        validate_signature(sig)?;
        codec::encode_body(self, sig, values)?;
        if self.write_stack.is_empty() {
            self.body_signature.push_str(sig);
        }
        Ok(())
    }

    /// Appends a contiguous byte buffer as an `ay` array.
    pub fn add_bytes_array(&mut self, bytes: &[u8]) -> Result<()> {
        self.check_unsealed()?;
        self.write_byte_array(bytes)?;
        if self.write_stack.is_empty() {
            self.body_signature.push_str("ay");
        }
        Ok(())
    }

    pub(crate) fn write_byte_array(&mut self, bytes: &[u8]) -> Result<()> {
        let token = self.body.begin_length(1);
        self.body.put_bytes(bytes);
        self.body.end_length(token)
    }

    pub(crate) fn write_basic(&mut self, token: char, value: &Value) -> Result<()> {
        self.check_unsealed()?;
        match token {
            'y' => {
                let n = int_value(value)?;
                check_range(token, n, 0, u8::MAX as i128)?;
                self.body.put_u8(n as u8);
            }
            'n' => {
                let n = int_value(value)?;
                check_range(token, n, i16::MIN as i128, i16::MAX as i128)?;
                self.body.put_i16(n as i16);
            }
            'q' => {
                let n = int_value(value)?;
                check_range(token, n, 0, u16::MAX as i128)?;
                self.body.put_u16(n as u16);
            }
            'i' => {
                let n = int_value(value)?;
                check_range(token, n, i32::MIN as i128, i32::MAX as i128)?;
                self.body.put_i32(n as i32);
            }
            'u' => {
                let n = int_value(value)?;
                check_range(token, n, 0, u32::MAX as i128)?;
                self.body.put_u32(n as u32);
            }
            'x' => {
                let n = int_value(value)?;
                check_range(token, n, i64::MIN as i128, i64::MAX as i128)?;
                self.body.put_i64(n as i64);
            }
            't' => {
                let n = int_value(value)?;
                check_range(token, n, 0, u64::MAX as i128)?;
                self.body.put_u64(n as u64);
            }
            'h' => {
                let n = int_value(value)?;
                check_range(token, n, 0, u32::MAX as i128)?;
                self.body.put_u32(n as u32);
            }
            'b' => match value {
                Value::Bool(b) => self.body.put_u32(*b as u32),
                other => {
                    return Err(Error::TypeMismatch {
                        expected: "bool",
                        found: other.kind_name(),
                    })
                }
            },
            'd' => match value {
                Value::F64(f) => self.body.put_f64(*f),
                other => {
                    return Err(Error::TypeMismatch {
                        expected: "f64",
                        found: other.kind_name(),
                    })
                }
            },
            's' => {
                let s = text_value(value)?;
                self.body.put_str(s);
            }
            'o' => {
                let s = text_value(value)?;
                if !object_path_is_valid(s) {
                    return Err(Error::InvalidPath(s.to_owned()));
                }
                self.body.put_str(s);
            }
            'g' => {
                let s = text_value(value)?;
                validate_signature(s)?;
                self.body.put_signature(s);
            }
            other => {
                return Err(Error::Signature(format!(
                    "'{}' is not a basic token",
                    other
                )))
            }
        }
        Ok(())
    }

    pub(crate) fn read_basic(&mut self, token: char) -> Result<Value> {
        self.check_readable()?;
        let mut cur = WireCursor::at(self.body.as_bytes(), self.rpos);
        let value = match token {
            'y' => Value::U8(cur.get_u8()?),
            'b' => Value::Bool(cur.get_u32()? != 0),
            'n' => Value::I16(cur.get_i16()?),
            'q' => Value::U16(cur.get_u16()?),
            'i' => Value::I32(cur.get_i32()?),
            'u' => Value::U32(cur.get_u32()?),
            'x' => Value::I64(cur.get_i64()?),
            't' => Value::U64(cur.get_u64()?),
            'd' => Value::F64(cur.get_f64()?),
            's' => Value::Str(cur.get_str()?.to_owned()),
            'o' => Value::ObjectPath(cur.get_str()?.to_owned()),
            'g' => Value::Signature(cur.get_signature_str()?.to_owned()),
            'h' => Value::Fd(cur.get_u32()?),
            other => {
                return Err(Error::Signature(format!(
                    "'{}' is not a basic token",
                    other
                )))
            }
        };
        self.rpos = cur.pos();
        Ok(value)
    }

    pub(crate) fn read_byte_array(&mut self) -> Result<Vec<u8>> {
        self.check_readable()?;
        let mut cur = WireCursor::at(self.body.as_bytes(), self.rpos);
        let len = cur.get_u32()? as usize;
        let bytes = cur.take(len)?.to_vec();
        self.rpos = cur.pos();
        Ok(bytes)
    }

    /// Opens a write container: `a` array, `r` struct, `e` dict entry, `v`
    /// variant. `contents` is the contained signature (for variants, the
    /// signature of the single contained value).
    pub fn open_container(&mut self, kind: char, contents: &str) -> Result<()> {
        self.check_unsealed()?;
        let at_top = self.write_stack.is_empty();
        let fragment = match kind {
            'a' => {
                validate_array_contents(contents)?;
                format!("a{}", contents)
            }
            'r' => {
                validate_signature(contents)?;
                if contents.is_empty() {
                    return Err(Error::Signature("empty struct signature".to_owned()));
                }
                format!("({})", contents)
            }
            'e' => {
                if at_top {
                    return Err(Error::Signature(
                        "dict entry is only legal inside an array".to_owned(),
                    ));
                }
                validate_dict_contents(contents)?;
                String::new()
            }
            'v' => {
                validate_variant_contents(contents)?;
                "v".to_owned()
            }
            other => {
                return Err(Error::Signature(format!(
                    "unknown container kind '{}'",
                    other
                )))
            }
        };
        self.open_inner(kind, contents)?;
        if at_top {
            self.body_signature.push_str(&fragment);
        }
        Ok(())
    }

    pub(crate) fn open_inner(&mut self, kind: char, contents: &str) -> Result<()> {
        self.check_unsealed()?;
        let length = match kind {
            'a' => {
                let first = contents
                    .chars()
                    .next()
                    .ok_or_else(|| Error::Signature("empty array element signature".to_owned()))?;
                Some(self.body.begin_length(alignment_of(first)?))
            }
            'r' | 'e' => {
                self.body.align(8);
                None
            }
            'v' => {
                self.body.put_signature(contents);
                None
            }
            other => {
                return Err(Error::Signature(format!(
                    "unknown container kind '{}'",
                    other
                )))
            }
        };
        self.write_stack.push(WriteContainer { length });
        Ok(())
    }

    pub fn close_container(&mut self) -> Result<()> {
        self.check_unsealed()?;
        let container = self
            .write_stack
            .pop()
            .ok_or(Error::State("no open container to close"))?;
        if let Some(token) = container.length {
            self.body.end_length(token)?;
        }
        Ok(())
    }

    /// Enters a read container. For variants, `contents` may be empty to
    /// accept whatever inner signature is on the wire.
    pub fn enter_container(&mut self, kind: char, contents: &str) -> Result<()> {
        match kind {
            'v' => {
                let actual = self.enter_variant()?;
                if !contents.is_empty() && actual != contents {
                    return Err(Error::TypeMismatch {
                        expected: "requested variant signature",
                        found: "different signature on the wire",
                    });
                }
                Ok(())
            }
            _ => self.enter_inner(kind, contents),
        }
    }

    pub(crate) fn enter_inner(&mut self, kind: char, contents: &str) -> Result<()> {
        self.check_readable()?;
        let mut cur = WireCursor::at(self.body.as_bytes(), self.rpos);
        let end = match kind {
            'a' => {
                let first = contents
                    .chars()
                    .next()
                    .ok_or_else(|| Error::Signature("empty array element signature".to_owned()))?;
                let len = cur.get_u32()? as usize;
                cur.align(alignment_of(first)?)?;
                Some(cur.pos() + len)
            }
            'r' | 'e' => {
                cur.align(8)?;
                None
            }
            other => {
                return Err(Error::Signature(format!(
                    "unknown container kind '{}'",
                    other
                )))
            }
        };
        self.rpos = cur.pos();
        self.read_stack.push(ReadContainer { kind, end });
        Ok(())
    }

    /// Enters a variant and returns the signature of its contained value.
    pub fn enter_variant(&mut self) -> Result<String> {
        self.check_readable()?;
        let mut cur = WireCursor::at(self.body.as_bytes(), self.rpos);
        let sig = cur.get_signature_str()?.to_owned();
        self.rpos = cur.pos();
        self.read_stack.push(ReadContainer {
            kind: 'v',
            end: None,
        });
        Ok(sig)
    }

    pub fn exit_container(&mut self) -> Result<()> {
        let container = self
            .read_stack
            .pop()
            .ok_or(Error::State("no entered container to exit"))?;
        if let Some(end) = container.end {
            if self.rpos != end {
                return Err(Error::State("array contents not fully consumed"));
            }
        }
        Ok(())
    }

    /// Whether the innermost entered array still has unread contents.
    pub(crate) fn container_remaining(&self) -> Result<bool> {
        match self.read_stack.last() {
            Some(ReadContainer {
                kind: 'a',
                end: Some(end),
            }) => Ok(self.rpos < *end),
            _ => Err(Error::State("not inside an entered array")),
        }
    }

    /// Restarts the read cursor at the beginning of the body.
    pub fn rewind(&mut self) {
        self.rpos = 0;
        self.read_stack.clear();
    }

    /// Decodes the whole body. `None` for an empty body, the bare value when
    /// the signature holds exactly one complete type, a tuple otherwise.
    pub fn get_contents(&mut self) -> Result<Option<Value>> {
        self.check_readable()?;
        self.rewind();
        let mut values = codec::decode_body(self)?;
        match values.len() {
            0 => Ok(None),
            1 => Ok(values.pop()),
            _ => Ok(Some(Value::Struct(values))),
        }
    }

    /// A fresh unsealed reply pre-addressed to the caller. Only valid on a
    /// received method call.
    pub fn create_reply(&self) -> Result<Message> {
        if self.msg_type != MessageType::MethodCall {
            return Err(Error::State("only method calls can be replied to"));
        }
        if !self.sealed || self.serial == 0 {
            return Err(Error::State("reply requires a received call"));
        }
        let mut reply = Message::empty(MessageType::MethodReply);
        reply.reply_serial = Some(self.serial);
        reply.destination = self.sender.clone();
        Ok(reply)
    }

    /// An error reply to this received call.
    pub fn create_error_reply(&self, name: &str, text: &str) -> Result<Message> {
        if self.msg_type != MessageType::MethodCall {
            return Err(Error::State("only method calls can be replied to"));
        }
        if !self.sealed || self.serial == 0 {
            return Err(Error::State("reply requires a received call"));
        }
        Message::new_error(self.serial, self.sender.as_deref(), name, text)
    }

    /// Logs a debug rendering of the header and body size.
    pub fn dump(&self) {
        debug!(
            "message type={:?} serial={} reply_serial={:?} path={:?} interface={:?} \
             member={:?} destination={:?} sender={:?} error={:?} signature={:?} body={}B",
            self.msg_type,
            self.serial,
            self.reply_serial,
            self.path,
            self.interface,
            self.member,
            self.destination,
            self.sender,
            self.error_name,
            self.body_signature,
            self.body.len()
        );
    }

    /// Emits the full wire frame under the given serial.
    pub fn to_wire(&self, serial: u32) -> Result<Vec<u8>> {
        if !self.sealed {
            return Err(Error::State("message must be sealed before sending"));
        }
        match self.msg_type {
            MessageType::MethodCall => {
                if self.path.is_none() || self.member.is_none() {
                    return Err(Error::State("method call requires path and member"));
                }
            }
            MessageType::MethodReply => {
                if self.reply_serial.is_none() {
                    return Err(Error::State("reply requires a reply serial"));
                }
            }
            MessageType::Error => {
                if self.reply_serial.is_none() || self.error_name.is_none() {
                    return Err(Error::State("error requires a reply serial and error name"));
                }
            }
            MessageType::Signal => {
                if self.path.is_none() || self.interface.is_none() || self.member.is_none() {
                    return Err(Error::State("signal requires path, interface and member"));
                }
            }
        }

        let mut w = WireWriter::new();
        w.put_u8(b'l');
        w.put_u8(self.msg_type.to_wire());
        w.put_u8(self.flags.bits());
        w.put_u8(1);
        w.put_u32(self.body.len() as u32);
        w.put_u32(serial);

        let fields = w.begin_length(8);
        if let Some(path) = &self.path {
            w.align(8);
            w.put_u8(FIELD_PATH);
            w.put_signature("o");
            w.put_str(path);
        }
        if let Some(interface) = &self.interface {
            w.align(8);
            w.put_u8(FIELD_INTERFACE);
            w.put_signature("s");
            w.put_str(interface);
        }
        if let Some(member) = &self.member {
            w.align(8);
            w.put_u8(FIELD_MEMBER);
            w.put_signature("s");
            w.put_str(member);
        }
        if let Some(name) = &self.error_name {
            w.align(8);
            w.put_u8(FIELD_ERROR_NAME);
            w.put_signature("s");
            w.put_str(name);
        }
        if let Some(reply_serial) = self.reply_serial {
            w.align(8);
            w.put_u8(FIELD_REPLY_SERIAL);
            w.put_signature("u");
            w.put_u32(reply_serial);
        }
        if let Some(destination) = &self.destination {
            w.align(8);
            w.put_u8(FIELD_DESTINATION);
            w.put_signature("s");
            w.put_str(destination);
        }
        if let Some(sender) = &self.sender {
            w.align(8);
            w.put_u8(FIELD_SENDER);
            w.put_signature("s");
            w.put_str(sender);
        }
        if !self.body_signature.is_empty() {
            w.align(8);
            w.put_u8(FIELD_SIGNATURE);
            w.put_signature("g");
            w.put_signature(&self.body_signature);
        }
        w.end_length(fields)?;
        w.align(8);
        w.put_bytes(self.body.as_bytes());
        Ok(w.into_bytes())
    }

    /// Parses a complete little-endian frame into a sealed message.
    pub fn from_wire(data: &[u8]) -> Result<Message> {
        let mut cur = WireCursor::new(data);
        if cur.get_u8()? != b'l' {
            return Err(Error::Frame("unsupported endianness"));
        }
        let msg_type = MessageType::from_wire(cur.get_u8()?)?;
        let flags = MessageFlags::from_bits_truncate(cur.get_u8()?);
        let _protocol_version = cur.get_u8()?;
        let body_len = cur.get_u32()? as usize;
        let serial = cur.get_u32()?;
        let fields_len = cur.get_u32()? as usize;
        let fields_end = cur.pos() + fields_len;

        let mut msg = Message::empty(msg_type);
        msg.flags = flags;
        msg.serial = serial;

        while cur.pos() < fields_end {
            cur.align(8)?;
            let code = cur.get_u8()?;
            let sig = cur.get_signature_str()?.to_owned();
            match (code, sig.as_str()) {
                (FIELD_PATH, "o") => msg.path = Some(cur.get_str()?.to_owned()),
                (FIELD_INTERFACE, "s") => msg.interface = Some(cur.get_str()?.to_owned()),
                (FIELD_MEMBER, "s") => msg.member = Some(cur.get_str()?.to_owned()),
                (FIELD_ERROR_NAME, "s") => msg.error_name = Some(cur.get_str()?.to_owned()),
                (FIELD_REPLY_SERIAL, "u") => msg.reply_serial = Some(cur.get_u32()?),
                (FIELD_DESTINATION, "s") => msg.destination = Some(cur.get_str()?.to_owned()),
                (FIELD_SENDER, "s") => msg.sender = Some(cur.get_str()?.to_owned()),
                (FIELD_SIGNATURE, "g") => {
                    let body_sig = cur.get_signature_str()?.to_owned();
                    validate_signature(&body_sig)?;
                    msg.body_signature = body_sig;
                }
                // Unknown header fields must be ignored.
                _ => {
                    let mut it = SignatureIter::new(&sig);
                    skip_value(&mut cur, &mut it)?;
                }
            }
        }
        if cur.pos() != fields_end {
            return Err(Error::Frame("header fields overran their length"));
        }
        cur.align(8)?;
        let body = cur.take(body_len)?;
        let mut writer = WireWriter::new();
        writer.put_bytes(body);
        msg.body = writer;
        msg.sealed = true;
        Ok(msg)
    }

    /// The total frame size of the message starting at `buf`, once enough
    /// header bytes are present to tell.
    pub fn frame_len(buf: &[u8]) -> Option<usize> {
        if buf.len() < 16 || (buf[0] != b'l' && buf[0] != b'B') {
            return None;
        }
        let (body_len, fields_len) = if buf[0] == b'l' {
            (
                u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize,
                u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]) as usize,
            )
        } else {
            (
                u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize,
                u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]) as usize,
            )
        };
        Some(align_up(16 + fields_len, 8) + body_len)
    }
}

fn int_value(value: &Value) -> Result<i128> {
    value.as_int().ok_or(Error::TypeMismatch {
        expected: "integer",
        found: value.kind_name(),
    })
}

fn check_range(token: char, value: i128, min: i128, max: i128) -> Result<()> {
    if value > max {
        return Err(Error::Overflow { token, value });
    }
    if value < min {
        return Err(Error::Underflow { token, value });
    }
    Ok(())
}

fn text_value(value: &Value) -> Result<&str> {
    value.as_str().ok_or(Error::TypeMismatch {
        expected: "string",
        found: value.kind_name(),
    })
}

fn validate_array_contents(contents: &str) -> Result<()> {
    if contents.starts_with('{') {
        // dict entries are only well-formed under their array
        return validate_signature(&format!("a{}", contents));
    }
    validate_signature(contents)?;
    let mut iter = SignatureIter::new(contents);
    find_array_element(&mut iter)?;
    if !iter.is_empty() {
        return Err(Error::Signature(
            "array contents must be one complete type".to_owned(),
        ));
    }
    Ok(())
}

fn validate_dict_contents(contents: &str) -> Result<()> {
    validate_signature(&format!("a{{{}}}", contents))
}

fn validate_variant_contents(contents: &str) -> Result<()> {
    validate_signature(contents)?;
    let mut iter = SignatureIter::new(contents);
    find_array_element(&mut iter)?;
    if !iter.is_empty() {
        return Err(Error::Signature(
            "variant contents must be one complete type".to_owned(),
        ));
    }
    Ok(())
}

/// Skips one complete value of an unknown header field.
fn skip_value(cur: &mut WireCursor<'_>, iter: &mut SignatureIter<'_>) -> Result<()> {
    match iter.next() {
        Some('y') => {
            cur.get_u8()?;
        }
        Some('n') | Some('q') => {
            cur.get_u16()?;
        }
        Some('b') | Some('i') | Some('u') | Some('h') => {
            cur.get_u32()?;
        }
        Some('x') | Some('t') | Some('d') => {
            cur.get_u64()?;
        }
        Some('s') | Some('o') => {
            cur.get_str()?;
        }
        Some('g') => {
            cur.get_signature_str()?;
        }
        Some('a') => {
            let elem = find_array_element(iter)?;
            let first = elem
                .chars()
                .next()
                .ok_or_else(|| Error::Signature("empty array element signature".to_owned()))?;
            let len = cur.get_u32()? as usize;
            cur.align(alignment_of(first)?)?;
            cur.take(len)?;
        }
        Some('(') => {
            let inner = find_struct_end(iter)?;
            cur.align(8)?;
            let mut it = SignatureIter::new(&inner);
            while !it.is_empty() {
                skip_value(cur, &mut it)?;
            }
        }
        Some('{') => {
            let inner = find_dict_end(iter)?;
            cur.align(8)?;
            let mut it = SignatureIter::new(&inner);
            while !it.is_empty() {
                skip_value(cur, &mut it)?;
            }
        }
        Some('v') => {
            let sig = cur.get_signature_str()?.to_owned();
            let mut it = SignatureIter::new(&sig);
            while !it.is_empty() {
                skip_value(cur, &mut it)?;
            }
        }
        Some(other) => {
            return Err(Error::Signature(format!("unknown token '{}'", other)));
        }
        None => {
            return Err(Error::Signature("signature ended early".to_owned()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_basic_writes_exact_bytes() {
        let mut msg = Message::new_signal("/", "org.example", "Ping").unwrap();
        msg.append_basic("yi", &[Value::U8(1), Value::I32(37)]).unwrap();
        assert_eq!(msg.signature(), "yi");
        assert_eq!(msg.body.as_bytes(), &[1, 0, 0, 0, 37, 0, 0, 0]);
    }

    #[test]
    fn range_checks_enforced() {
        let mut msg = Message::new_signal("/", "org.example", "Ping").unwrap();
        assert!(matches!(
            msg.write_basic('q', &Value::I32(65536)),
            Err(Error::Overflow { token: 'q', .. })
        ));
        assert!(matches!(
            msg.write_basic('q', &Value::I32(-1)),
            Err(Error::Underflow { token: 'q', .. })
        ));
        msg.write_basic('n', &Value::I32(32767)).unwrap();
        assert!(matches!(
            msg.write_basic('n', &Value::I32(32768)),
            Err(Error::Overflow { token: 'n', .. })
        ));
    }

    #[test]
    fn bool_token_rejects_non_bool() {
        let mut msg = Message::new_signal("/", "org.example", "Ping").unwrap();
        assert!(matches!(
            msg.write_basic('b', &Value::I32(1)),
            Err(Error::TypeMismatch { .. })
        ));
        msg.write_basic('b', &Value::Bool(true)).unwrap();
    }

    #[test]
    fn sealed_message_rejects_mutation() {
        let mut msg = Message::new_signal("/", "org.example", "Ping").unwrap();
        msg.append_basic("s", &[Value::from("x")]).unwrap();
        msg.seal().unwrap();
        assert!(matches!(
            msg.append_basic("s", &[Value::from("y")]),
            Err(Error::State(_))
        ));
        assert!(matches!(
            msg.open_container('a', "i"),
            Err(Error::State(_))
        ));
    }

    #[test]
    fn seal_with_open_container_fails() {
        let mut msg = Message::new_signal("/", "org.example", "Ping").unwrap();
        msg.open_container('a', "i").unwrap();
        assert!(matches!(msg.seal(), Err(Error::State(_))));
        msg.close_container().unwrap();
        msg.seal().unwrap();
    }

    #[test]
    fn close_without_open_fails() {
        let mut msg = Message::new_signal("/", "org.example", "Ping").unwrap();
        assert!(matches!(msg.close_container(), Err(Error::State(_))));
    }

    #[test]
    fn frame_round_trip_preserves_header_and_body() {
        let mut msg =
            Message::new_method_call("org.example", "/org/example", "org.example.Iface", "Echo")
                .unwrap();
        msg.append("s", &[Value::from("ping")]).unwrap();
        msg.seal().unwrap();
        let frame = msg.to_wire(7).unwrap();
        assert_eq!(Message::frame_len(&frame), Some(frame.len()));

        let mut parsed = Message::from_wire(&frame).unwrap();
        assert_eq!(parsed.message_type(), MessageType::MethodCall);
        assert_eq!(parsed.serial(), 7);
        assert_eq!(parsed.path(), Some("/org/example"));
        assert_eq!(parsed.interface(), Some("org.example.Iface"));
        assert_eq!(parsed.member(), Some("Echo"));
        assert_eq!(parsed.destination(), Some("org.example"));
        assert_eq!(parsed.signature(), "s");
        assert_eq!(
            parsed.get_contents().unwrap(),
            Some(Value::Str("ping".into()))
        );
    }

    #[test]
    fn error_frame_round_trip() {
        let mut msg = Message::new_error(
            9,
            Some(":1.7"),
            "org.freedesktop.DBus.Error.UnknownMethod",
            "no such member",
        )
        .unwrap();
        msg.seal().unwrap();
        let frame = msg.to_wire(3).unwrap();
        let parsed = Message::from_wire(&frame).unwrap();
        assert_eq!(parsed.message_type(), MessageType::Error);
        assert_eq!(parsed.reply_serial(), Some(9));
        assert_eq!(
            parsed.error_name(),
            Some("org.freedesktop.DBus.Error.UnknownMethod")
        );
    }

    #[test]
    fn reply_is_preaddressed() {
        let mut call =
            Message::new_method_call("org.example", "/", "org.example.Iface", "Echo").unwrap();
        call.seal().unwrap();
        let frame = call.to_wire(21).unwrap();
        let received = Message::from_wire(&frame).unwrap();
        let reply = received.create_reply().unwrap();
        assert_eq!(reply.message_type(), MessageType::MethodReply);
        assert_eq!(reply.reply_serial(), Some(21));
        assert!(!reply.is_sealed());
    }

    #[test]
    fn reply_requires_received_call() {
        let call =
            Message::new_method_call("org.example", "/", "org.example.Iface", "Echo").unwrap();
        // not sealed, no serial: this is an outbound call, not a received one
        assert!(matches!(call.create_reply(), Err(Error::State(_))));

        let mut signal = Message::new_signal("/", "org.example", "Ping").unwrap();
        signal.seal().unwrap();
        assert!(matches!(signal.create_reply(), Err(Error::State(_))));
    }

    #[test]
    fn unknown_header_fields_are_skipped() {
        let mut msg = Message::new_signal("/", "org.example", "Ping").unwrap();
        msg.seal().unwrap();
        let mut frame = msg.to_wire(1).unwrap();

        // splice in an unknown field (code 200, type u) by rebuilding the
        // field array by hand
        let mut w = WireWriter::new();
        w.put_bytes(&frame[..12]);
        let fields_len = u32::from_le_bytes([frame[12], frame[13], frame[14], frame[15]]) as usize;
        let fields_end = align_up(16 + fields_len, 8);
        let token = w.begin_length(8);
        w.put_bytes(&frame[16..16 + fields_len]);
        w.align(8);
        w.put_u8(200);
        w.put_signature("u");
        w.put_u32(77);
        w.end_length(token).unwrap();
        w.align(8);
        w.put_bytes(&frame[fields_end..]);
        frame = w.into_bytes();

        let parsed = Message::from_wire(&frame).unwrap();
        assert_eq!(parsed.member(), Some("Ping"));
    }
}
