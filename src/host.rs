//! Host-side objects and functions callable from PHP.
//!
//! When PHP code touches a host symbol (`RustWorld::fail()`, `new
//! RustWorld\Logger`, reading a property of a handle it was given), the
//! dispatcher resolves the target handle in the registry and drives one of
//! the [`HostObject`] operations below. Errors are plain strings; the
//! dispatcher stringifies and round-trips them so PHP raises an equivalent
//! exception, and they never tear down the channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use crate::value::Value;
use crate::world::PhpWorld;

/// Outcome of a host-side operation requested by PHP.
pub type OpOutcome = std::result::Result<Value, String>;

fn unsupported(what: &str) -> String {
    format!("host object does not support {}", what)
}

/// A host object PHP holds a handle to.
///
/// Operations that may call back into PHP receive the bridge (`world`) and
/// run at re-entry level N+1; everything they submit completes before the
/// reverse reply is written. All methods have failing or inert defaults, so
/// implementors pick the surface they need.
#[async_trait]
pub trait HostObject: Send + Sync {
    /// Read a property.
    async fn get(&self, _world: &mut PhpWorld, name: &str) -> OpOutcome {
        Err(unsupported(&format!("reading '{}'", name)))
    }

    /// Write a property.
    async fn set(&self, _world: &mut PhpWorld, name: &str, _value: Value) -> Result<(), String> {
        Err(unsupported(&format!("writing '{}'", name)))
    }

    /// Call a named method.
    async fn call(&self, _world: &mut PhpWorld, name: &str, _args: Vec<Value>) -> OpOutcome {
        Err(unsupported(&format!("calling '{}'", name)))
    }

    /// Invoke the object itself as a callable.
    async fn invoke(&self, _world: &mut PhpWorld, _args: Vec<Value>) -> OpOutcome {
        Err(unsupported("invocation"))
    }

    /// Construct an instance; only meaningful for class-like objects
    /// resolved through a reverse `GET_CLASS`.
    async fn construct(&self, _world: &mut PhpWorld, _args: Vec<Value>) -> OpOutcome {
        Err(unsupported("construction"))
    }

    /// Materialize the object's items for PHP-side iteration.
    async fn iterate(&self, _world: &mut PhpWorld) -> Result<Vec<Value>, String> {
        Err(unsupported("iteration"))
    }

    /// String conversion (`(string)$obj` on the PHP side).
    fn to_display(&self) -> Result<String, String> {
        Err(unsupported("string conversion"))
    }

    /// Property existence probe.
    fn isset(&self, _name: &str) -> bool {
        false
    }

    /// Remove a property.
    fn unset(&self, name: &str) -> Result<(), String> {
        Err(unsupported(&format!("unsetting '{}'", name)))
    }

    /// Enumerable property names.
    fn props(&self) -> Vec<String> {
        Vec::new()
    }

    /// Plain-JSON projection for reverse `JSON_ENCODE` requests.
    fn json(&self) -> Result<serde_json::Value, String> {
        Err(unsupported("JSON encoding"))
    }

    /// Element count, when the object has one. Advertised to PHP in the
    /// reply capability bits so the bootstrap can synthesize `Countable`.
    fn len(&self) -> Option<usize> {
        None
    }

    /// Whether [`iterate`](HostObject::iterate) is supported.
    fn has_iterator(&self) -> bool {
        false
    }

    /// Disposal hook, run when the handle is released. Errors are logged
    /// and swallowed.
    fn dispose(&self) -> Result<(), String> {
        Ok(())
    }
}

// =============================================================================
// Host functions
// =============================================================================

type HostFnInner =
    dyn for<'a> Fn(&'a mut PhpWorld, Vec<Value>) -> BoxFuture<'a, OpOutcome> + Send + Sync;

/// A host function PHP can call (or construct through).
///
/// The function receives the bridge, so it can submit nested PHP operations
/// while servicing the call.
#[derive(Clone)]
pub struct HostFn(Arc<HostFnInner>);

impl HostFn {
    pub fn new<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a mut PhpWorld, Vec<Value>) -> BoxFuture<'a, OpOutcome>
            + Send
            + Sync
            + 'static,
    {
        Self(Arc::new(f))
    }

    /// Wrap a synchronous function that does not call back into PHP.
    pub fn from_sync<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> OpOutcome + Send + Sync + 'static,
    {
        let inner: Arc<HostFnInner> = Arc::new(move |_world, args| {
            let out = f(args);
            Box::pin(async move { out })
        });
        Self(inner)
    }

    pub async fn call(&self, world: &mut PhpWorld, args: Vec<Value>) -> OpOutcome {
        (self.0)(world, args).await
    }

    pub(crate) fn ptr_eq(&self, other: &HostFn) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Adapter registering a [`HostFn`] in the handle registry: PHP sees a
/// callable that can also be constructed through (for class symbols whose
/// "constructor" is a factory function).
pub struct FnObject(pub HostFn);

#[async_trait]
impl HostObject for FnObject {
    async fn invoke(&self, world: &mut PhpWorld, args: Vec<Value>) -> OpOutcome {
        self.0.call(world, args).await
    }

    async fn construct(&self, world: &mut PhpWorld, args: Vec<Value>) -> OpOutcome {
        self.0.call(world, args).await
    }
}

/// Call a resolved symbol value.
pub(crate) async fn call_value(world: &mut PhpWorld, callee: Value, args: Vec<Value>) -> OpOutcome {
    match callee {
        Value::Fun(f) => f.call(world, args).await,
        Value::Obj(obj) => obj.invoke(world, args).await,
        other => Err(format!("symbol is not callable: {:?}", other)),
    }
}

/// Capability bits for a handle reply.
pub(crate) fn features(obj: &dyn HostObject) -> u32 {
    use crate::protocol::data_flags::{HAS_ITERATOR, HAS_LENGTH};
    let mut flags = 0;
    if obj.has_iterator() {
        flags |= HAS_ITERATOR;
    }
    if obj.len().is_some() {
        flags |= HAS_LENGTH;
    }
    flags
}

// =============================================================================
// The host global namespace
// =============================================================================

/// Fallback symbol resolver, consulted when a name is not defined in the
/// symbol table (the `onsymbol` setting).
pub type OnSymbol = Arc<dyn Fn(&str) -> Option<Value> + Send + Sync>;

/// The host global namespace, pinned at handle 1.
///
/// PHP resolves `RustWorld::name(...)`, `RustWorld\Name` classes, and bare
/// host symbols against this table first, then against the `onsymbol`
/// resolver.
#[derive(Default)]
pub struct SymbolTable {
    symbols: Mutex<HashMap<String, Value>>,
    resolver: Mutex<Option<OnSymbol>>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define or replace a symbol.
    pub fn define(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.symbols.lock().unwrap().insert(name.into(), value.into());
    }

    pub fn remove(&self, name: &str) -> bool {
        self.symbols.lock().unwrap().remove(name).is_some()
    }

    pub(crate) fn set_resolver(&self, resolver: Option<OnSymbol>) {
        *self.resolver.lock().unwrap() = resolver;
    }

    /// Look a name up in the table, then in the fallback resolver.
    pub fn resolve(&self, name: &str) -> Option<Value> {
        if let Some(v) = self.symbols.lock().unwrap().get(name) {
            return Some(v.clone());
        }
        let resolver = self.resolver.lock().unwrap().clone();
        resolver.and_then(|r| r(name))
    }
}

#[async_trait]
impl HostObject for SymbolTable {
    async fn get(&self, _world: &mut PhpWorld, name: &str) -> OpOutcome {
        self.resolve(name)
            .ok_or_else(|| format!("undefined host symbol '{}'", name))
    }

    async fn set(&self, _world: &mut PhpWorld, name: &str, value: Value) -> Result<(), String> {
        self.define(name, value);
        Ok(())
    }

    async fn call(&self, world: &mut PhpWorld, name: &str, args: Vec<Value>) -> OpOutcome {
        let callee = self
            .resolve(name)
            .ok_or_else(|| format!("undefined host function '{}'", name))?;
        call_value(world, callee, args).await
    }

    fn isset(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }

    fn unset(&self, name: &str) -> Result<(), String> {
        self.remove(name);
        Ok(())
    }

    fn props(&self) -> Vec<String> {
        self.symbols.lock().unwrap().keys().cloned().collect()
    }
}

/// The bridge instance itself, pinned at handle 0. Reverse calls that do not
/// target a specific instance land here and resolve through the global
/// namespace.
pub(crate) struct BridgeRoot {
    pub globals: Arc<SymbolTable>,
}

#[async_trait]
impl HostObject for BridgeRoot {
    async fn get(&self, world: &mut PhpWorld, name: &str) -> OpOutcome {
        self.globals.get(world, name).await
    }

    async fn set(&self, world: &mut PhpWorld, name: &str, value: Value) -> Result<(), String> {
        self.globals.set(world, name, value).await
    }

    async fn call(&self, world: &mut PhpWorld, name: &str, args: Vec<Value>) -> OpOutcome {
        self.globals.call(world, name, args).await
    }

    fn isset(&self, name: &str) -> bool {
        self.globals.isset(name)
    }
}

// =============================================================================
// PropertyBag
// =============================================================================

/// A plain mutable property container, handy for handing structured state to
/// PHP without writing a [`HostObject`] implementation by hand.
#[derive(Default)]
pub struct PropertyBag {
    props: Mutex<HashMap<String, Value>>,
}

impl PropertyBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.props.lock().unwrap().insert(name.into(), value.into());
        self
    }
}

#[async_trait]
impl HostObject for PropertyBag {
    async fn get(&self, _world: &mut PhpWorld, name: &str) -> OpOutcome {
        Ok(self.props.lock().unwrap().get(name).cloned().unwrap_or(Value::Null))
    }

    async fn set(&self, _world: &mut PhpWorld, name: &str, value: Value) -> Result<(), String> {
        self.props.lock().unwrap().insert(name.to_string(), value);
        Ok(())
    }

    async fn iterate(&self, _world: &mut PhpWorld) -> Result<Vec<Value>, String> {
        Ok(self.props.lock().unwrap().values().cloned().collect())
    }

    fn isset(&self, name: &str) -> bool {
        self.props.lock().unwrap().contains_key(name)
    }

    fn unset(&self, name: &str) -> Result<(), String> {
        self.props.lock().unwrap().remove(name);
        Ok(())
    }

    fn props(&self) -> Vec<String> {
        self.props.lock().unwrap().keys().cloned().collect()
    }

    fn json(&self) -> Result<serde_json::Value, String> {
        let props = self.props.lock().unwrap();
        let mut map = serde_json::Map::new();
        for (k, v) in props.iter() {
            map.insert(
                k.clone(),
                crate::marshal::to_plain_json(v)
                    .ok_or_else(|| format!("property '{}' is not JSON-serializable", k))?,
            );
        }
        Ok(serde_json::Value::Object(map))
    }

    fn len(&self) -> Option<usize> {
        Some(self.props.lock().unwrap().len())
    }

    fn has_iterator(&self) -> bool {
        true
    }
}
