//! Native callback bridge: host-registered functions that JavaScript can
//! call by name, typed over the small set of shapes the core round-trips
//! through JSON ({`string`, `list<string>`, `map<string,string>`}).

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use sandrun_common::RomaError;

/// The signature shape of a binding argument or return value, in either
/// direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingType {
    /// A UTF-8 string.
    String,
    /// An ordered list of strings.
    ListString,
    /// A string-to-string map.
    MapStringString,
}

/// A value matching one of the [`BindingType`] shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum BindingValue {
    String(String),
    ListString(Vec<String>),
    MapStringString(HashMap<String, String>),
}

impl BindingValue {
    /// The shape this value carries.
    pub fn binding_type(&self) -> BindingType {
        match self {
            Self::String(_) => BindingType::String,
            Self::ListString(_) => BindingType::ListString,
            Self::MapStringString(_) => BindingType::MapStringString,
        }
    }
}

type NativeFn = dyn Fn(&[BindingValue]) -> Result<BindingValue, RomaError> + Send + Sync;

/// One host-registered function, installed on the JS global object under
/// `name` at isolate-creation time.
#[derive(Clone)]
pub struct FunctionBinding {
    name: String,
    param_types: Vec<BindingType>,
    return_type: BindingType,
    func: Arc<NativeFn>,
}

impl fmt::Debug for FunctionBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionBinding")
            .field("name", &self.name)
            .field("param_types", &self.param_types)
            .field("return_type", &self.return_type)
            .finish()
    }
}

impl FunctionBinding {
    /// Register a new binding. `func` runs on the worker's single thread,
    /// inside the isolate's call stack, so it must not block indefinitely.
    pub fn new(
        name: impl Into<String>,
        param_types: Vec<BindingType>,
        return_type: BindingType,
        func: impl Fn(&[BindingValue]) -> Result<BindingValue, RomaError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            param_types,
            return_type,
            func: Arc::new(func),
        }
    }

    /// The name this binding is installed under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The return shape, used to interpret the marshalled result.
    pub fn return_type(&self) -> BindingType {
        self.return_type
    }

    /// The expected shape of each argument, in order.
    pub fn param_types(&self) -> &[BindingType] {
        &self.param_types
    }

    /// Validate arity and per-argument shape, then invoke the native
    /// function. Error messages match the wire contract JS code observes
    /// as thrown `Error`s.
    pub fn call(&self, args: &[BindingValue]) -> Result<BindingValue, RomaError> {
        if args.len() != self.param_types.len() {
            return Err(RomaError::Other(format!(
                "({}) Unexpected number of inputs",
                self.name
            )));
        }
        for (arg, expected) in args.iter().zip(&self.param_types) {
            if arg.binding_type() != *expected {
                return Err(RomaError::Other(format!(
                    "({}) Error encountered while converting types",
                    self.name
                )));
            }
        }
        (self.func)(args)
    }
}

/// The set of bindings registered at `init` time, shared by every worker
/// (and re-sent to a respawned worker by the pool).
#[derive(Clone, Default)]
pub struct BindingRegistry {
    bindings: Arc<RwLock<HashMap<String, FunctionBinding>>>,
}

impl BindingRegistry {
    /// A registry with no bindings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a binding by name.
    pub fn register(&self, binding: FunctionBinding) {
        self.bindings
            .write()
            .expect("binding registry lock poisoned")
            .insert(binding.name().to_string(), binding);
    }

    /// Look up a binding by name.
    pub fn get(&self, name: &str) -> Option<FunctionBinding> {
        self.bindings
            .read()
            .expect("binding registry lock poisoned")
            .get(name)
            .cloned()
    }

    /// Every registered binding, for reinstallation into a new isolate.
    pub fn all(&self) -> Vec<FunctionBinding> {
        self.bindings
            .read()
            .expect("binding registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}
