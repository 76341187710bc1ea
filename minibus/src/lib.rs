//!Client and server support for the D-Bus wire protocol: message
//!marshaling, signature handling, interface vtables and a multiplexed
//!connection with a non-blocking dispatch pump.
//!
//!Messages are built field by field and sealed before transmission:
//!
//!```rust
//!use minibus::{Message, Value};
//!
//!# fn main() -> minibus::Result<()> {
//!let mut call = Message::new_method_call(
//!    "org.example.Pinger",
//!    "/org/example/Pinger",
//!    "org.example.Pinger",
//!    "Ping",
//!)?;
//!call.append("s", &[Value::from("ping")])?;
//!call.seal()?;
//!
//!let frame = call.to_wire(1)?;
//!let mut received = Message::from_wire(&frame)?;
//!assert_eq!(received.get_contents()?, Some(Value::Str("ping".into())));
//!# Ok(())
//!# }
//!```
//!
//!A server declares an [`Interface`], registers it on a [`Connection`] and
//!pumps inbound traffic with [`Connection::drive`]:
//!
//!```rust
//!use std::sync::Arc;
//!use minibus::{sync_method, Connection, Interface, Value, VtableFlags};
//!
//!# fn main() -> minibus::Result<()> {
//!let (transport, _peer) = minibus::pair();
//!let conn = Connection::new(
//!    Box::new(transport),
//!    Arc::new(minibus::BlockingSpawner::new()?),
//!);
//!
//!let mut iface = Interface::new();
//!iface.add_method(
//!    "Ping",
//!    "s",
//!    &["ping"],
//!    "s",
//!    &["pong"],
//!    VtableFlags::empty(),
//!    sync_method(|mut call| {
//!        let text = call.get_contents()?;
//!        let mut reply = call.create_reply()?;
//!        if let Some(text) = text {
//!            reply.append("s", &[text])?;
//!        }
//!        Ok(reply)
//!    }),
//!)?;
//!conn.add_interface(&mut iface, "/org/example/Pinger", "org.example.Pinger")?;
//!# Ok(())
//!# }
//!```

mod bus;
mod codec;
mod error;
mod interface;
mod message;
mod path;
mod signature;
mod spawn;
mod value;
mod wire;

pub use crate::bus::{
    pair, Connection, DriveOutcome, PairTransport, PendingReply, RequestNameFlags, SignalQueue,
    Transport,
};
pub use crate::error::{register_error_name, Error, RemoteErrorKind, Result};
pub use crate::interface::{
    sync_method, Interface, MethodEntry, MethodFuture, MethodHandler, PropertyEntry,
    PropertyGetter, PropertySetter, SignalEntry, Vtable, VtableEntry, VtableFlags,
};
pub use crate::message::{Message, MessageFlags, MessageType};
pub use crate::path::{decode_object_path, encode_object_path, object_path_is_valid};
pub use crate::signature::{
    count_complete_types, find_array_element, find_dict_end, find_struct_end, validate_signature,
    SignatureIter,
};
pub use crate::spawn::{BlockingSpawner, Task, TaskSpawner, TokioSpawner};
pub use crate::value::{DictKey, Value};

#[cfg(test)]
mod test {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Connection: Send, Sync, Clone);
    assert_impl_all!(Message: Send, Clone);
    assert_impl_all!(Value: Send, Clone, PartialEq);
    assert_impl_all!(DictKey: Send, Ord);
    assert_impl_all!(Error: Send, Sync);
}
