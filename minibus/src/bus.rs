//! The connection: serial assignment, synchronous and asynchronous calls,
//! the non-blocking dispatch pump, object registration and signal queues.
//!
//! One connection multiplexes everything over a provided [`Transport`]. The
//! transport is consumed, not implemented, here; [`pair`] builds an
//! in-memory crosswired pair for tests and local plumbing.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, MutexGuard, TryLockError, Weak};
use std::task::{Context, Poll};

use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, RemoteErrorKind, Result};
use crate::interface::{Interface, Vtable};
use crate::message::{Message, MessageFlags, MessageType};
use crate::path::object_path_is_valid;
use crate::spawn::TaskSpawner;
use crate::value::Value;

const DBUS_SERVICE: &str = "org.freedesktop.DBus";
const DBUS_PATH: &str = "/org/freedesktop/DBus";
const DBUS_INTERFACE: &str = "org.freedesktop.DBus";
const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

const ERROR_UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
const ERROR_UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";
const ERROR_UNKNOWN_PROPERTY: &str = "org.freedesktop.DBus.Error.UnknownProperty";
const ERROR_PROPERTY_READ_ONLY: &str = "org.freedesktop.DBus.Error.PropertyReadOnly";
const ERROR_INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
const ERROR_FAILED: &str = "org.freedesktop.DBus.Error.Failed";

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RequestNameFlags: u32 {
        const ALLOW_REPLACEMENT = 1 << 0;
        const REPLACE_EXISTING = 1 << 1;
        const DO_NOT_QUEUE = 1 << 2;
    }
}

/// The provided connection handle: sends and receives complete message
/// frames. Authentication and socket establishment happen before a transport
/// is handed over.
pub trait Transport: Send {
    fn send_frame(&mut self, frame: &[u8]) -> Result<()>;

    /// Blocks until a frame arrives.
    fn recv_frame(&mut self) -> Result<Vec<u8>>;

    /// Returns `Ok(None)` when no frame is ready.
    fn try_recv_frame(&mut self) -> Result<Option<Vec<u8>>>;

    /// A poll-able readiness descriptor, when the transport has one.
    fn readiness_fd(&self) -> Option<i32> {
        None
    }
}

/// One half of an in-memory transport pair.
pub struct PairTransport {
    tx: std_mpsc::Sender<Vec<u8>>,
    rx: std_mpsc::Receiver<Vec<u8>>,
}

/// Two crosswired in-memory transports.
pub fn pair() -> (PairTransport, PairTransport) {
    let (tx_a, rx_b) = std_mpsc::channel();
    let (tx_b, rx_a) = std_mpsc::channel();
    (
        PairTransport { tx: tx_a, rx: rx_a },
        PairTransport { tx: tx_b, rx: rx_b },
    )
}

impl Transport for PairTransport {
    fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.tx
            .send(frame.to_vec())
            .map_err(|_| Error::Disconnected)
    }

    fn recv_frame(&mut self) -> Result<Vec<u8>> {
        self.rx.recv().map_err(|_| Error::Disconnected)
    }

    fn try_recv_frame(&mut self) -> Result<Option<Vec<u8>>> {
        match self.rx.try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(std_mpsc::TryRecvError::Empty) => Ok(None),
            Err(std_mpsc::TryRecvError::Disconnected) => Err(Error::Disconnected),
        }
    }
}

/// What one [`Connection::drive`] pass accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveOutcome {
    /// Nothing was ready.
    Idle,
    /// This many inbound messages were routed.
    Processed(usize),
    /// The transport reported a connection reset; the connection has been
    /// torn down.
    Disconnected,
}

struct PendingSlot {
    tx: oneshot::Sender<Result<Message>>,
    cancelled: Arc<AtomicBool>,
}

struct SignalMatch {
    id: u64,
    sender: Option<String>,
    path: String,
    interface: String,
    member: String,
    tx: mpsc::UnboundedSender<Message>,
}

impl SignalMatch {
    fn matches(&self, msg: &Message) -> bool {
        msg.path() == Some(self.path.as_str())
            && msg.interface() == Some(self.interface.as_str())
            && msg.member() == Some(self.member.as_str())
            && (self.sender.is_none() || msg.sender() == self.sender.as_deref())
    }
}

#[derive(Default)]
struct BusState {
    pending: HashMap<u32, PendingSlot>,
    backlog: VecDeque<Message>,
    objects: HashMap<(String, String), Arc<Vtable>>,
    signals: Vec<SignalMatch>,
    next_match_id: u64,
    closed: bool,
}

struct ConnectionInner {
    transport: Mutex<Box<dyn Transport>>,
    state: Mutex<BusState>,
    serial: AtomicU32,
    spawner: Arc<dyn TaskSpawner>,
}

/// A multiplexed bus connection. Cheap to clone; clones share the underlying
/// transport and state.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

/// A not-yet-resolved asynchronous call. Resolved exactly once by
/// [`Connection::drive`]; after [`PendingReply::cancel`] the eventual reply
/// is discarded silently and the future never resolves.
pub struct PendingReply {
    rx: oneshot::Receiver<Result<Message>>,
    cancelled: Arc<AtomicBool>,
}

impl PendingReply {
    /// Suppresses result delivery. Nothing is sent on the wire.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Future for PendingReply {
    type Output = Result<Message>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<Message>> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Poll::Pending;
        }
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Disconnected)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A signal delivery sink. The bus-side match slot lives exactly as long as
/// the queue; dropping the queue releases it.
pub struct SignalQueue {
    rx: mpsc::UnboundedReceiver<Message>,
    _guard: MatchGuard,
}

impl SignalQueue {
    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

struct MatchGuard {
    id: u64,
    rule: String,
    conn: Weak<ConnectionInner>,
}

impl Drop for MatchGuard {
    fn drop(&mut self) {
        let inner = match self.conn.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        if let Ok(mut state) = inner.state.lock() {
            let id = self.id;
            state.signals.retain(|m| m.id != id);
        }
        // best-effort RemoveMatch; the daemon side may already be gone
        let conn = Connection { inner };
        if let Ok(mut msg) =
            Message::new_method_call(DBUS_SERVICE, DBUS_PATH, DBUS_INTERFACE, "RemoveMatch")
        {
            if msg.append("s", &[Value::from(self.rule.as_str())]).is_ok() {
                let _ = conn.send(msg);
            }
        }
    }
}

impl Connection {
    pub fn new(transport: Box<dyn Transport>, spawner: Arc<dyn TaskSpawner>) -> Connection {
        Connection {
            inner: Arc::new(ConnectionInner {
                transport: Mutex::new(transport),
                state: Mutex::new(BusState::default()),
                serial: AtomicU32::new(1),
                spawner,
            }),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, BusState>> {
        self.inner
            .state
            .lock()
            .map_err(|_| Error::State("connection state lock poisoned"))
    }

    fn transport(&self) -> Result<MutexGuard<'_, Box<dyn Transport>>> {
        self.inner
            .transport
            .lock()
            .map_err(|_| Error::State("transport lock poisoned"))
    }

    fn next_serial(&self) -> u32 {
        self.inner.serial.fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.state().map(|s| s.closed).unwrap_or(true)
    }

    /// Seals, assigns a serial and transmits. Returns the assigned serial.
    pub fn send(&self, mut msg: Message) -> Result<u32> {
        msg.seal()?;
        let serial = self.next_serial();
        msg.set_serial(serial);
        let frame = msg.to_wire(serial)?;
        self.transport()?.send_frame(&frame)?;
        Ok(serial)
    }

    /// Synchronous round trip: blocks the calling thread until the matching
    /// reply or error arrives. Frames that answer someone else are queued for
    /// the next [`Connection::drive`]. Must not be issued from the thread
    /// driving this connection.
    pub fn call(&self, mut msg: Message) -> Result<Message> {
        if msg.message_type() != MessageType::MethodCall {
            return Err(Error::State("call requires a method call message"));
        }
        msg.seal()?;
        let serial = self.next_serial();
        msg.set_serial(serial);
        let frame = msg.to_wire(serial)?;

        let mut transport = self.transport()?;
        transport.send_frame(&frame)?;
        loop {
            let inbound = Message::from_wire(&transport.recv_frame()?)?;
            let answers_us = matches!(
                inbound.message_type(),
                MessageType::MethodReply | MessageType::Error
            ) && inbound.reply_serial() == Some(serial);
            if !answers_us {
                self.state()?.backlog.push_back(inbound);
                continue;
            }
            if inbound.message_type() == MessageType::Error {
                return Err(remote_error(inbound));
            }
            return Ok(inbound);
        }
    }

    /// Registers a completion slot keyed by serial, transmits and returns
    /// immediately. The slot resolves from [`Connection::drive`].
    pub fn call_async(&self, mut msg: Message) -> Result<PendingReply> {
        if msg.message_type() != MessageType::MethodCall {
            return Err(Error::State("call requires a method call message"));
        }
        msg.seal()?;
        let serial = self.next_serial();
        msg.set_serial(serial);
        let frame = msg.to_wire(serial)?;

        let cancelled = Arc::new(AtomicBool::new(false));
        let (tx, rx) = oneshot::channel();
        self.state()?.pending.insert(
            serial,
            PendingSlot {
                tx,
                cancelled: cancelled.clone(),
            },
        );
        let sent = self.transport()?.send_frame(&frame);
        if let Err(e) = sent {
            self.state()?.pending.remove(&serial);
            return Err(e);
        }
        Ok(PendingReply { rx, cancelled })
    }

    /// Non-blocking pump: routes queued and ready inbound messages until
    /// none are left. A transport connection reset tears the connection down
    /// and reports [`DriveOutcome::Disconnected`] instead of an error.
    pub fn drive(&self) -> Result<DriveOutcome> {
        let mut processed = 0usize;
        loop {
            let queued = self.state()?.backlog.pop_front();
            let msg = match queued {
                Some(msg) => msg,
                None => {
                    let polled = match self.inner.transport.try_lock() {
                        Ok(mut transport) => transport.try_recv_frame(),
                        // a blocking call holds the transport right now
                        Err(TryLockError::WouldBlock) => Ok(None),
                        Err(TryLockError::Poisoned(_)) => {
                            Err(Error::State("transport lock poisoned"))
                        }
                    };
                    match polled {
                        Ok(Some(frame)) => Message::from_wire(&frame)?,
                        Ok(None) => break,
                        Err(Error::Disconnected) => {
                            self.teardown()?;
                            return Ok(DriveOutcome::Disconnected);
                        }
                        Err(e) => return Err(e),
                    }
                }
            };
            self.route(msg)?;
            processed += 1;
        }
        Ok(if processed == 0 {
            DriveOutcome::Idle
        } else {
            DriveOutcome::Processed(processed)
        })
    }

    fn teardown(&self) -> Result<()> {
        let mut state = self.state()?;
        state.closed = true;
        // dropping the slots resolves their receivers as disconnected, and
        // dropping the match senders ends their queues
        state.pending.clear();
        state.signals.clear();
        Ok(())
    }

    fn route(&self, msg: Message) -> Result<()> {
        msg.dump();
        match msg.message_type() {
            MessageType::MethodCall => self.dispatch_call(msg),
            MessageType::MethodReply | MessageType::Error => {
                let reply_serial = match msg.reply_serial() {
                    Some(serial) => serial,
                    None => {
                        warn!("dropping reply without a reply serial");
                        return Ok(());
                    }
                };
                let slot = self.state()?.pending.remove(&reply_serial);
                match slot {
                    Some(slot) => {
                        if slot.cancelled.load(Ordering::SeqCst) {
                            debug!("discarding reply for cancelled call {}", reply_serial);
                            return Ok(());
                        }
                        let result = if msg.message_type() == MessageType::Error {
                            Err(remote_error(msg))
                        } else {
                            Ok(msg)
                        };
                        let _ = slot.tx.send(result);
                    }
                    None => debug!("no pending call for reply serial {}", reply_serial),
                }
                Ok(())
            }
            MessageType::Signal => {
                let targets: Vec<mpsc::UnboundedSender<Message>> = {
                    let mut state = self.state()?;
                    state.signals.retain(|m| !m.tx.is_closed());
                    state
                        .signals
                        .iter()
                        .filter(|m| m.matches(&msg))
                        .map(|m| m.tx.clone())
                        .collect()
                };
                for tx in targets {
                    let _ = tx.send(msg.clone());
                }
                Ok(())
            }
        }
    }

    fn dispatch_call(&self, msg: Message) -> Result<()> {
        let path = msg.path().unwrap_or("").to_owned();
        let interface = msg.interface().unwrap_or("").to_owned();
        let member = msg.member().unwrap_or("").to_owned();

        if interface == PROPERTIES_INTERFACE && (member == "Get" || member == "Set") {
            return self.dispatch_property(msg, &path, &member);
        }

        let vtable = self
            .state()?
            .objects
            .get(&(path, interface))
            .cloned();
        let vtable = match vtable {
            Some(vtable) => vtable,
            None => return self.send_error_reply(&msg, ERROR_UNKNOWN_METHOD, "no such object"),
        };
        let handler = match vtable.method(&member) {
            Some(entry) => {
                if entry.input_signature != msg.signature() {
                    return self.send_error_reply(
                        &msg,
                        ERROR_INVALID_ARGS,
                        "call signature does not match the method",
                    );
                }
                entry.handler.clone()
            }
            None => return self.send_error_reply(&msg, ERROR_UNKNOWN_METHOD, "no such method"),
        };

        let call_serial = msg.serial();
        let call_sender = msg.sender().map(str::to_owned);
        let no_reply = msg.flags().contains(MessageFlags::NO_REPLY_EXPECTED);
        let conn = self.clone();
        let fut = (handler)(msg);
        self.inner.spawner.spawn(Box::pin(async move {
            let outcome = fut.await;
            if no_reply {
                if let Err(e) = outcome {
                    debug!("handler failed with no reply expected: {}", e);
                }
                return;
            }
            let sent = match outcome {
                Ok(reply) => conn.send(reply).map(|_| ()),
                Err(e) => conn.send_error_for(call_serial, call_sender.as_deref(), e),
            };
            if let Err(e) = sent {
                warn!("failed to send reply: {}", e);
            }
        }));
        Ok(())
    }

    fn dispatch_property(&self, mut msg: Message, path: &str, member: &str) -> Result<()> {
        let args = match msg.get_contents() {
            Ok(args) => args,
            Err(_) => {
                return self.send_error_reply(&msg, ERROR_INVALID_ARGS, "malformed property call")
            }
        };
        let args = match args {
            Some(Value::Struct(args)) => args,
            _ => {
                return self.send_error_reply(&msg, ERROR_INVALID_ARGS, "malformed property call")
            }
        };
        let (target_interface, property) = match (args.first(), args.get(1)) {
            (Some(Value::Str(i)), Some(Value::Str(p))) => (i.clone(), p.clone()),
            _ => {
                return self.send_error_reply(&msg, ERROR_INVALID_ARGS, "malformed property call")
            }
        };

        let vtable = self
            .state()?
            .objects
            .get(&(path.to_owned(), target_interface))
            .cloned();
        let vtable = match vtable {
            Some(vtable) => vtable,
            None => {
                return self.send_error_reply(&msg, ERROR_UNKNOWN_INTERFACE, "no such interface")
            }
        };
        let entry = match vtable.property(&property) {
            Some(entry) => entry,
            None => {
                return self.send_error_reply(&msg, ERROR_UNKNOWN_PROPERTY, "no such property")
            }
        };

        if member == "Get" {
            let value = match (entry.getter)() {
                Ok(value) => value,
                Err(e) => return self.send_dispatch_failure(&msg, e),
            };
            let mut reply = msg.create_reply()?;
            reply.append(
                "v",
                &[Value::Variant(entry.signature.clone(), Box::new(value))],
            )?;
            return self.send(reply).map(|_| ());
        }

        // Set
        let setter = match &entry.setter {
            Some(setter) => setter.clone(),
            None => {
                return self.send_error_reply(
                    &msg,
                    ERROR_PROPERTY_READ_ONLY,
                    "property is read-only",
                )
            }
        };
        let value = match args.into_iter().nth(2) {
            Some(Value::Variant(sig, value)) => {
                if sig != entry.signature {
                    return self.send_error_reply(
                        &msg,
                        ERROR_INVALID_ARGS,
                        "value signature does not match the property",
                    );
                }
                *value
            }
            _ => {
                return self.send_error_reply(&msg, ERROR_INVALID_ARGS, "malformed property call")
            }
        };
        match (setter)(value) {
            Ok(()) => {
                let reply = msg.create_reply()?;
                self.send(reply).map(|_| ())
            }
            Err(e) => self.send_dispatch_failure(&msg, e),
        }
    }

    fn send_error_reply(&self, call: &Message, name: &str, text: &str) -> Result<()> {
        let reply = call.create_error_reply(name, text)?;
        self.send(reply).map(|_| ())
    }

    fn send_dispatch_failure(&self, call: &Message, e: Error) -> Result<()> {
        let (name, text) = error_name_and_text(e);
        self.send_error_reply(call, &name, &text)
    }

    fn send_error_for(&self, reply_serial: u32, destination: Option<&str>, e: Error) -> Result<()> {
        let (name, text) = error_name_and_text(e);
        let msg = Message::new_error(reply_serial, destination, &name, &text)?;
        self.send(msg).map(|_| ())
    }

    /// Builds the interface's vtable if needed and registers it at
    /// `(path, interface_name)`.
    pub fn add_interface(
        &self,
        interface: &mut Interface,
        path: &str,
        interface_name: &str,
    ) -> Result<()> {
        if !object_path_is_valid(path) {
            return Err(Error::InvalidPath(path.to_owned()));
        }
        interface.create_vtable()?;
        let vtable = interface
            .vtable()
            .ok_or(Error::State("vtable missing after build"))?;
        let mut state = self.state()?;
        let key = (path.to_owned(), interface_name.to_owned());
        if state.objects.contains_key(&key) {
            return Err(Error::State("interface is already registered at this path"));
        }
        state.objects.insert(key, vtable);
        Ok(())
    }

    /// Builds and transmits a signal.
    pub fn emit_signal(
        &self,
        path: &str,
        interface: &str,
        member: &str,
        sig: &str,
        values: &[Value],
    ) -> Result<()> {
        let mut msg = Message::new_signal(path, interface, member)?;
        if !sig.is_empty() {
            msg.append(sig, values)?;
        }
        self.send(msg).map(|_| ())
    }

    /// Subscribes to signals matching the given fields. Issues an `AddMatch`
    /// to the daemon, then binds a local queue whose lifetime owns the match
    /// slot.
    pub async fn get_signal_queue_async(
        &self,
        sender: Option<&str>,
        path: &str,
        interface: &str,
        member: &str,
    ) -> Result<SignalQueue> {
        let mut rule = format!(
            "type='signal',path='{}',interface='{}',member='{}'",
            path, interface, member
        );
        if let Some(sender) = sender {
            rule.push_str(&format!(",sender='{}'", sender));
        }
        let mut msg =
            Message::new_method_call(DBUS_SERVICE, DBUS_PATH, DBUS_INTERFACE, "AddMatch")?;
        msg.append("s", &[Value::from(rule.as_str())])?;
        self.call_async(msg)?.await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.state()?;
            let id = state.next_match_id;
            state.next_match_id += 1;
            state.signals.push(SignalMatch {
                id,
                sender: sender.map(str::to_owned),
                path: path.to_owned(),
                interface: interface.to_owned(),
                member: member.to_owned(),
                tx,
            });
            id
        };
        Ok(SignalQueue {
            rx,
            _guard: MatchGuard {
                id,
                rule,
                conn: Arc::downgrade(&self.inner),
            },
        })
    }

    /// Asynchronous name-ownership request, resolved like any other pending
    /// call.
    pub fn request_name_async(
        &self,
        name: &str,
        flags: RequestNameFlags,
    ) -> Result<PendingReply> {
        let mut msg =
            Message::new_method_call(DBUS_SERVICE, DBUS_PATH, DBUS_INTERFACE, "RequestName")?;
        msg.append(
            "su",
            &[Value::from(name), Value::U32(flags.bits())],
        )?;
        self.call_async(msg)
    }
}

fn remote_error(mut msg: Message) -> Error {
    let name = msg.error_name().unwrap_or("").to_owned();
    let message = match msg.get_contents() {
        Ok(Some(Value::Str(text))) => text,
        Ok(Some(Value::Struct(values))) => values
            .into_iter()
            .find_map(|v| match v {
                Value::Str(text) => Some(text),
                _ => None,
            })
            .unwrap_or_default(),
        _ => String::new(),
    };
    Error::Remote {
        kind: RemoteErrorKind::from_name(&name),
        name,
        message,
    }
}

fn error_name_and_text(e: Error) -> (String, String) {
    match e {
        Error::Remote { name, message, .. } if !name.is_empty() => (name, message),
        other => (ERROR_FAILED.to_owned(), other.to_string()),
    }
}
