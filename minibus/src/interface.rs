//! Interface declaration and vtable assembly.
//!
//! An [`Interface`] accumulates method, property and signal declarations in
//! three registries. Registration performs only shallow checks;
//! [`Interface::create_vtable`] validates the stored declarations and builds
//! the one contiguous dispatch table the connection routes calls through.
//! Building is idempotent.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::message::Message;
use crate::signature::{count_complete_types, validate_signature};
use crate::value::Value;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VtableFlags: u64 {
        const DEPRECATED = 1 << 0;
        const HIDDEN = 1 << 1;
        const UNPRIVILEGED = 1 << 2;
        const METHOD_NO_REPLY = 1 << 3;
        const PROPERTY_EMITS_CHANGE = 1 << 4;
        const PROPERTY_EMITS_INVALIDATION = 1 << 5;
        const PROPERTY_EXPLICIT = 1 << 6;
        const SENSITIVE = 1 << 7;
    }
}

pub type MethodFuture = Pin<Box<dyn Future<Output = Result<Message>> + Send>>;

/// A method handler takes the received call and resolves to the reply,
/// typically built with [`Message::create_reply`]. A handler that finishes
/// without suspending should return a ready future.
pub type MethodHandler = Arc<dyn Fn(Message) -> MethodFuture + Send + Sync>;

pub type PropertyGetter = Arc<dyn Fn() -> Result<Value> + Send + Sync>;
pub type PropertySetter = Arc<dyn Fn(Value) -> Result<()> + Send + Sync>;

/// Wraps a plain function as a [`MethodHandler`] with immediate resumption.
pub fn sync_method<F>(f: F) -> MethodHandler
where
    F: Fn(Message) -> Result<Message> + Send + Sync + 'static,
{
    Arc::new(move |msg| {
        let result = f(msg);
        Box::pin(std::future::ready(result)) as MethodFuture
    })
}

struct MethodSpec {
    name: String,
    input_signature: String,
    input_names: Vec<String>,
    result_signature: String,
    result_names: Vec<String>,
    flags: VtableFlags,
    handler: MethodHandler,
}

struct PropertySpec {
    name: String,
    signature: String,
    getter: PropertyGetter,
    setter: Option<PropertySetter>,
    flags: VtableFlags,
}

struct SignalSpec {
    name: String,
    signature: String,
    names: Vec<String>,
    flags: VtableFlags,
}

pub struct MethodEntry {
    pub name: String,
    pub input_signature: String,
    pub result_signature: String,
    /// Input then result argument names, each terminated by NUL. The binding
    /// layer consumes this blob byte-for-byte.
    pub arg_names: Vec<u8>,
    pub flags: VtableFlags,
    pub(crate) handler: MethodHandler,
}

pub struct PropertyEntry {
    pub name: String,
    pub signature: String,
    pub flags: VtableFlags,
    pub(crate) getter: PropertyGetter,
    pub(crate) setter: Option<PropertySetter>,
}

impl PropertyEntry {
    /// Writability is derived from setter presence at build time.
    pub fn is_writable(&self) -> bool {
        self.setter.is_some()
    }
}

pub struct SignalEntry {
    pub name: String,
    pub signature: String,
    pub arg_names: Vec<u8>,
    pub flags: VtableFlags,
}

pub enum VtableEntry {
    Start { flags: VtableFlags },
    Method(MethodEntry),
    Property(PropertyEntry),
    Signal(SignalEntry),
    End,
}

/// The contiguous dispatch table for one interface: start marker, methods,
/// properties and signals in declaration order, end marker.
pub struct Vtable {
    entries: Vec<VtableEntry>,
    method_index: HashMap<String, usize>,
    property_index: HashMap<String, usize>,
}

impl Vtable {
    pub fn entries(&self) -> &[VtableEntry] {
        &self.entries
    }

    pub fn method(&self, name: &str) -> Option<&MethodEntry> {
        match self.entries.get(*self.method_index.get(name)?) {
            Some(VtableEntry::Method(entry)) => Some(entry),
            _ => None,
        }
    }

    pub fn property(&self, name: &str) -> Option<&PropertyEntry> {
        match self.entries.get(*self.property_index.get(name)?) {
            Some(VtableEntry::Property(entry)) => Some(entry),
            _ => None,
        }
    }
}

#[derive(Default)]
pub struct Interface {
    methods: Vec<MethodSpec>,
    properties: Vec<PropertySpec>,
    signals: Vec<SignalSpec>,
    vtable: Option<Arc<Vtable>>,
}

impl Interface {
    pub fn new() -> Interface {
        Interface::default()
    }

    /// Declares a method. Member names must be unique per interface; the
    /// signatures are validated later by [`Interface::create_vtable`].
    #[allow(clippy::too_many_arguments)]
    pub fn add_method(
        &mut self,
        name: &str,
        input_signature: &str,
        input_names: &[&str],
        result_signature: &str,
        result_names: &[&str],
        flags: VtableFlags,
        handler: MethodHandler,
    ) -> Result<()> {
        self.check_mutable()?;
        self.check_member_free(name)?;
        self.methods.push(MethodSpec {
            name: name.to_owned(),
            input_signature: input_signature.to_owned(),
            input_names: input_names.iter().map(|s| (*s).to_owned()).collect(),
            result_signature: result_signature.to_owned(),
            result_names: result_names.iter().map(|s| (*s).to_owned()).collect(),
            flags,
            handler,
        });
        Ok(())
    }

    /// Declares a property. A property without a setter is read-only.
    pub fn add_property(
        &mut self,
        name: &str,
        signature: &str,
        getter: PropertyGetter,
        setter: Option<PropertySetter>,
        flags: VtableFlags,
    ) -> Result<()> {
        self.check_mutable()?;
        self.check_member_free(name)?;
        self.properties.push(PropertySpec {
            name: name.to_owned(),
            signature: signature.to_owned(),
            getter,
            setter,
            flags,
        });
        Ok(())
    }

    /// Declares a signal with its argument names.
    pub fn add_signal(
        &mut self,
        name: &str,
        signature: &str,
        names: &[&str],
        flags: VtableFlags,
    ) -> Result<()> {
        self.check_mutable()?;
        self.check_member_free(name)?;
        self.signals.push(SignalSpec {
            name: name.to_owned(),
            signature: signature.to_owned(),
            names: names.iter().map(|s| (*s).to_owned()).collect(),
            flags,
        });
        Ok(())
    }

    fn check_mutable(&self) -> Result<()> {
        if self.vtable.is_some() {
            return Err(Error::State("vtable is already built"));
        }
        Ok(())
    }

    fn check_member_free(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::State("member name must not be empty"));
        }
        let taken = self.methods.iter().any(|m| m.name == name)
            || self.properties.iter().any(|p| p.name == name)
            || self.signals.iter().any(|s| s.name == name);
        if taken {
            return Err(Error::State("member name is already registered"));
        }
        Ok(())
    }

    /// Validates all stored declarations and assembles the vtable. The first
    /// call builds; subsequent calls are no-ops.
    pub fn create_vtable(&mut self) -> Result<()> {
        if self.vtable.is_some() {
            return Ok(());
        }

        let mut entries = Vec::new();
        entries
            .try_reserve(self.methods.len() + self.properties.len() + self.signals.len() + 2)
            .map_err(|_| Error::Allocation)?;
        let mut method_index = HashMap::new();
        let mut property_index = HashMap::new();

        entries.push(VtableEntry::Start {
            flags: VtableFlags::empty(),
        });

        for spec in &self.methods {
            validate_signature(&spec.input_signature)?;
            validate_signature(&spec.result_signature)?;
            let arity = count_complete_types(&spec.input_signature)?
                + count_complete_types(&spec.result_signature)?;
            let name_count = spec.input_names.len() + spec.result_names.len();
            if name_count != 0 && name_count != arity {
                return Err(Error::TypeMismatch {
                    expected: "one argument name per signature type",
                    found: "mismatched name count",
                });
            }
            let mut arg_names = Vec::new();
            for n in spec.input_names.iter().chain(&spec.result_names) {
                arg_names.extend_from_slice(n.as_bytes());
                arg_names.push(0);
            }
            method_index.insert(spec.name.clone(), entries.len());
            entries.push(VtableEntry::Method(MethodEntry {
                name: spec.name.clone(),
                input_signature: spec.input_signature.clone(),
                result_signature: spec.result_signature.clone(),
                arg_names,
                flags: spec.flags,
                handler: spec.handler.clone(),
            }));
        }

        for spec in &self.properties {
            validate_signature(&spec.signature)?;
            if count_complete_types(&spec.signature)? != 1 {
                return Err(Error::Signature(
                    "property signature must be one complete type".to_owned(),
                ));
            }
            property_index.insert(spec.name.clone(), entries.len());
            entries.push(VtableEntry::Property(PropertyEntry {
                name: spec.name.clone(),
                signature: spec.signature.clone(),
                flags: spec.flags,
                getter: spec.getter.clone(),
                setter: spec.setter.clone(),
            }));
        }

        for spec in &self.signals {
            validate_signature(&spec.signature)?;
            let mut arg_names = Vec::new();
            for n in &spec.names {
                arg_names.extend_from_slice(n.as_bytes());
                arg_names.push(0);
            }
            entries.push(VtableEntry::Signal(SignalEntry {
                name: spec.name.clone(),
                signature: spec.signature.clone(),
                arg_names,
                flags: spec.flags,
            }));
        }

        entries.push(VtableEntry::End);

        self.vtable = Some(Arc::new(Vtable {
            entries,
            method_index,
            property_index,
        }));
        Ok(())
    }

    /// The built vtable, once [`Interface::create_vtable`] has run.
    pub fn vtable(&self) -> Option<Arc<Vtable>> {
        self.vtable.clone()
    }
}
