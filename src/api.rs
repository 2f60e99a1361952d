//! The typed façade over PHP symbols.
//!
//! A dynamic-language bridge intercepts attribute access; here the same
//! record set is reached through small builders: [`PhpWorld::var`],
//! [`PhpWorld::func`], [`PhpWorld::class`], and [`PhpWorld::obj`]
//! accumulate a path, and a terminal method (`get`, `set`, `unset`, `call`,
//! `construct`, `iterate`) resolves it into one framed request.
//!
//! ```rust,ignore
//! let mut php = PhpWorld::new(Settings::default());
//! let size = php.constant("PHP_INT_SIZE").await?;
//! php.var("config").set(serde_json::json!({"debug": true})).await?;
//! let debug = php.var("config").path("debug").get().await?;
//! let obj = php.class("ArrayObject").construct(&["x".into()]).await?;
//! let count = php.obj(&obj).call("count", &[]).await?;
//! ```

use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::protocol::Opcode;
use crate::value::Value;
use crate::world::{PhpWorld, Reply};

// =============================================================================
// Validation
// =============================================================================

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidUsage("empty name".to_string()));
    }
    if name.chars().any(|c| c.is_whitespace()) {
        return Err(Error::InvalidUsage(format!("no spaces allowed in '{}'", name)));
    }
    Ok(())
}

fn validate_class(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidUsage("empty class name".to_string()));
    }
    let ok = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '\\');
    if !ok {
        return Err(Error::InvalidUsage(format!(
            "class or namespace '{}' may only contain [A-Za-z0-9_\\]",
            name
        )));
    }
    Ok(())
}

fn json_path(path: &[String]) -> String {
    serde_json::to_string(path).expect("string array serialization")
}

// =============================================================================
// PHP object handles
// =============================================================================

/// A handle to an object instance retained by the PHP side.
///
/// Dropping the handle queues a fire-and-forget `DESTRUCT`, flushed before
/// the bridge's next request; [`PhpWorld::drop_object`] releases it
/// immediately.
pub struct PhpObject {
    id: u32,
    class_name: Option<String>,
    destructor: Option<mpsc::UnboundedSender<u32>>,
}

impl PhpObject {
    pub(crate) fn new(
        id: u32,
        class_name: Option<String>,
        destructor: mpsc::UnboundedSender<u32>,
    ) -> Self {
        Self {
            id,
            class_name,
            destructor: Some(destructor),
        }
    }

    /// The PHP-side handle ID.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Class name reported at construction, when PHP sent one.
    pub fn class_name(&self) -> Option<&str> {
        self.class_name.as_deref()
    }

    /// The portable form for embedding in payloads: the PHP instance
    /// sentinel.
    pub fn to_value(&self) -> Value {
        Value::PhpRef(self.id)
    }

    fn defuse(mut self) -> u32 {
        self.destructor = None;
        self.id
    }
}

impl Drop for PhpObject {
    fn drop(&mut self) {
        if let Some(tx) = self.destructor.take() {
            let _ = tx.send(self.id);
        }
    }
}

impl From<&PhpObject> for Value {
    fn from(obj: &PhpObject) -> Self {
        Value::PhpRef(obj.id)
    }
}

// =============================================================================
// Entry points
// =============================================================================

impl PhpWorld {
    /// A global variable (`$name` in PHP).
    pub fn var(&mut self, name: impl Into<String>) -> VarRef<'_> {
        VarRef {
            world: self,
            name: name.into(),
            path: Vec::new(),
        }
    }

    /// A global (or namespaced, or `Cls::method`) function.
    pub fn func(&mut self, name: impl Into<String>) -> FnRef<'_> {
        FnRef {
            world: self,
            name: name.into(),
        }
    }

    /// A class, as a namespace for construction, statics, and constants.
    pub fn class(&mut self, name: impl Into<String>) -> ClassRef<'_> {
        ClassRef {
            world: self,
            name: name.into(),
        }
    }

    /// Operations on a PHP object handle.
    pub fn obj<'a>(&'a mut self, obj: &PhpObject) -> ObjRef<'a> {
        ObjRef {
            world: self,
            id: obj.id,
        }
    }

    /// Read a constant: `php.constant("PHP_INT_SIZE")`,
    /// `php.constant("App\\Config::VERSION")`.
    pub async fn constant(&mut self, name: impl Into<String>) -> Result<Value> {
        let name = name.into();
        validate_name(&name)?;
        let reply = self.request(Opcode::Const, name).await?;
        reply.into_value(self.registry())
    }

    /// Evaluate PHP source, returning the expression value.
    pub async fn eval(&mut self, code: impl Into<String>) -> Result<Value> {
        let payload = serde_json::Value::String(code.into()).to_string();
        let reply = self.request(Opcode::CallEval, payload).await?;
        reply.into_value(self.registry())
    }

    /// Evaluate PHP source, returning the result as an object handle.
    pub async fn eval_this(&mut self, code: impl Into<String>) -> Result<PhpObject> {
        let payload = serde_json::Value::String(code.into()).to_string();
        let reply = self.request(Opcode::CallEvalThis, payload).await?;
        self.adopt_handle(reply)
    }

    /// `echo` the arguments.
    pub async fn echo(&mut self, args: &[Value]) -> Result<()> {
        let payload = self.encode_arg_array(args);
        self.request(Opcode::CallEcho, payload).await?;
        Ok(())
    }

    pub async fn include(&mut self, path: impl Into<String>) -> Result<Value> {
        self.load_script(Opcode::CallInclude, path.into()).await
    }

    pub async fn include_once(&mut self, path: impl Into<String>) -> Result<Value> {
        self.load_script(Opcode::CallIncludeOnce, path.into()).await
    }

    pub async fn require(&mut self, path: impl Into<String>) -> Result<Value> {
        self.load_script(Opcode::CallRequire, path.into()).await
    }

    pub async fn require_once(&mut self, path: impl Into<String>) -> Result<Value> {
        self.load_script(Opcode::CallRequireOnce, path.into()).await
    }

    async fn load_script(&mut self, op: Opcode, path: String) -> Result<Value> {
        let payload = serde_json::Value::String(path).to_string();
        let reply = self.request(op, payload).await?;
        reply.into_value(self.registry())
    }

    /// Ask PHP to exit; resolves with the interpreter's exit code.
    pub async fn exit(&mut self, status: i32) -> Result<i32> {
        match self.request(Opcode::Call, format!("exit [{}]", status)).await {
            Err(Error::InterpreterExit { code }) => Ok(code),
            Ok(_) => Ok(self.terminate().await),
            Err(e) => Err(e),
        }
    }

    /// Release a PHP object handle now (rather than on drop).
    pub async fn drop_object(&mut self, obj: PhpObject) -> Result<()> {
        let id = obj.defuse();
        if !self.is_connected() {
            return Ok(());
        }
        self.send_oneway(Opcode::Destruct, id.to_string()).await
    }

    /// Promote a [`Value::PhpRef`] out of a decoded payload into an owned
    /// handle that participates in disposal.
    pub fn to_object(&mut self, value: &Value) -> Result<PhpObject> {
        match value {
            Value::PhpRef(id) => {
                self.note_remote_handle(*id);
                Ok(PhpObject::new(*id, None, self.destruct_queue()))
            }
            other => Err(Error::InvalidUsage(format!(
                "not a PHP instance reference: {:?}",
                other
            ))),
        }
    }

    fn adopt_handle(&mut self, reply: Reply) -> Result<PhpObject> {
        let (id, class_name) = reply.into_handle()?;
        self.note_remote_handle(id);
        Ok(PhpObject::new(id, class_name, self.destruct_queue()))
    }

    fn encode_arg_array(&mut self, args: &[Value]) -> String {
        let items: Vec<String> = args.iter().map(|v| self.encode_value(v)).collect();
        format!("[{}]", items.join(","))
    }
}

// =============================================================================
// Variables
// =============================================================================

/// Builder for global-variable access, with an optional index path.
pub struct VarRef<'a> {
    world: &'a mut PhpWorld,
    name: String,
    path: Vec<String>,
}

impl<'a> VarRef<'a> {
    /// Descend one index or property step.
    pub fn path(mut self, seg: impl Into<String>) -> Self {
        self.path.push(seg.into());
        self
    }

    pub async fn get(self) -> Result<Value> {
        validate_name(&self.name)?;
        let payload = if self.path.is_empty() {
            self.name
        } else {
            format!("{} {}", self.name, json_path(&self.path))
        };
        let reply = self.world.request(Opcode::Get, payload).await?;
        reply.into_value(self.world.registry())
    }

    /// Read the value as an object handle instead of a JSON copy.
    pub async fn get_this(self) -> Result<PhpObject> {
        validate_name(&self.name)?;
        let payload = if self.path.is_empty() {
            self.name
        } else {
            format!("{} {}", self.name, json_path(&self.path))
        };
        let reply = self.world.request(Opcode::GetThis, payload).await?;
        self.world.adopt_handle(reply)
    }

    pub async fn set(self, value: impl Into<Value>) -> Result<()> {
        validate_name(&self.name)?;
        let value = value.into();
        let (op, encoded) = if value.is_handle_eligible() {
            let id = self.world.register_handle(value);
            let op = if self.path.is_empty() {
                Opcode::SetInst
            } else {
                Opcode::SetPathInst
            };
            (op, id.to_string())
        } else {
            let op = if self.path.is_empty() {
                Opcode::Set
            } else {
                Opcode::SetPath
            };
            (op, self.world.encode_value(&value))
        };
        let payload = if self.path.is_empty() {
            format!("{} {}", self.name, encoded)
        } else {
            format!("{} [{},{}]", self.name, json_path(&self.path), encoded)
        };
        self.world.request(op, payload).await?;
        Ok(())
    }

    pub async fn unset(mut self) -> Result<()> {
        validate_name(&self.name)?;
        let payload = match self.path.pop() {
            None => {
                self.world.request(Opcode::Unset, self.name).await?;
                return Ok(());
            }
            Some(last) if self.path.is_empty() => format!("{} {}", self.name, last),
            Some(last) => format!("{} {} {}", self.name, last, json_path(&self.path)),
        };
        self.world.request(Opcode::UnsetPath, payload).await?;
        Ok(())
    }

    /// Iterate the variable's entries; obtains an object handle first.
    pub async fn iterate(self) -> Result<PhpIter<'a>> {
        let world = self.world;
        let name = self.name;
        let path = self.path;
        validate_name(&name)?;
        let payload = if path.is_empty() {
            name
        } else {
            format!("{} {}", name, json_path(&path))
        };
        let reply = world.request(Opcode::GetThis, payload).await?;
        let obj = world.adopt_handle(reply)?;
        PhpIter::begin(world, obj).await
    }
}

// =============================================================================
// Functions
// =============================================================================

/// Builder for function and static-method calls.
pub struct FnRef<'a> {
    world: &'a mut PhpWorld,
    name: String,
}

impl<'a> FnRef<'a> {
    pub async fn call(self, args: &[Value]) -> Result<Value> {
        validate_name(&self.name)?;
        // The language constructs get dedicated opcodes.
        let lowered = self.name.to_ascii_lowercase();
        let (op, payload) = match lowered.as_str() {
            "eval" => (Opcode::CallEval, Self::single_string_arg(&lowered, args)?),
            "include" => (Opcode::CallInclude, Self::single_string_arg(&lowered, args)?),
            "include_once" => (Opcode::CallIncludeOnce, Self::single_string_arg(&lowered, args)?),
            "require" => (Opcode::CallRequire, Self::single_string_arg(&lowered, args)?),
            "require_once" => (Opcode::CallRequireOnce, Self::single_string_arg(&lowered, args)?),
            "echo" => {
                let payload = self.world.encode_arg_array(args);
                (Opcode::CallEcho, payload)
            }
            _ => {
                let payload = if args.is_empty() {
                    self.name.clone()
                } else {
                    format!("{} {}", self.name, self.world.encode_arg_array(args))
                };
                (Opcode::Call, payload)
            }
        };
        let reply = self.world.request(op, payload).await?;
        reply.into_value(self.world.registry())
    }

    /// Call, keeping the result on the PHP side as an object handle.
    pub async fn call_this(self, args: &[Value]) -> Result<PhpObject> {
        validate_name(&self.name)?;
        if self.name.eq_ignore_ascii_case("eval") {
            let payload = Self::single_string_arg("eval", args)?;
            let reply = self.world.request(Opcode::CallEvalThis, payload).await?;
            return self.world.adopt_handle(reply);
        }
        let payload = if args.is_empty() {
            self.name.clone()
        } else {
            format!("{} {}", self.name, self.world.encode_arg_array(args))
        };
        let reply = self.world.request(Opcode::CallThis, payload).await?;
        self.world.adopt_handle(reply)
    }

    fn single_string_arg(what: &str, args: &[Value]) -> Result<String> {
        match args {
            [Value::Str(s)] => Ok(serde_json::Value::String(s.clone()).to_string()),
            _ => Err(Error::InvalidUsage(format!(
                "{} takes exactly one string argument",
                what
            ))),
        }
    }
}

// =============================================================================
// Classes
// =============================================================================

/// Builder for class-level access: construction, statics, constants.
pub struct ClassRef<'a> {
    world: &'a mut PhpWorld,
    name: String,
}

impl<'a> ClassRef<'a> {
    /// Append a namespace or class segment (`\`-joined).
    pub fn path(mut self, seg: impl Into<String>) -> Self {
        let seg = seg.into();
        self.name.push('\\');
        self.name.push_str(&seg);
        self
    }

    pub async fn construct(self, args: &[Value]) -> Result<PhpObject> {
        validate_class(&self.name)?;
        let payload = if args.is_empty() {
            self.name.clone()
        } else {
            format!("{} {}", self.name, self.world.encode_arg_array(args))
        };
        let reply = self.world.request(Opcode::Construct, payload).await?;
        self.world.adopt_handle(reply)
    }

    /// A static property (`Cls::$name`).
    pub fn static_prop(self, name: impl Into<String>) -> StaticPropRef<'a> {
        StaticPropRef {
            world: self.world,
            class: self.name,
            name: name.into(),
            path: Vec::new(),
        }
    }

    /// Call a static method (`Cls::method(...)`).
    pub async fn call(self, method: &str, args: &[Value]) -> Result<Value> {
        validate_class(&self.name)?;
        validate_name(method)?;
        let name = format!("{}::{}", self.name, method);
        FnRef {
            world: self.world,
            name,
        }
        .call(args)
        .await
    }

    /// Call a static method, keeping the result as an object handle.
    pub async fn call_this(self, method: &str, args: &[Value]) -> Result<PhpObject> {
        validate_class(&self.name)?;
        validate_name(method)?;
        let name = format!("{}::{}", self.name, method);
        FnRef {
            world: self.world,
            name,
        }
        .call_this(args)
        .await
    }

    /// Read a class constant (`Cls::NAME`).
    pub async fn constant(self, name: &str) -> Result<Value> {
        validate_class(&self.name)?;
        validate_name(name)?;
        let qualified = format!("{}::{}", self.name, name);
        let reply = self.world.request(Opcode::Const, qualified).await?;
        reply.into_value(self.world.registry())
    }
}

/// Builder for static-property access.
pub struct StaticPropRef<'a> {
    world: &'a mut PhpWorld,
    class: String,
    name: String,
    path: Vec<String>,
}

impl<'a> StaticPropRef<'a> {
    pub fn path(mut self, seg: impl Into<String>) -> Self {
        self.path.push(seg.into());
        self
    }

    fn member(&self) -> Result<String> {
        validate_class(&self.class)?;
        validate_name(&self.name)?;
        Ok(format!("{}::{}", self.class, self.name))
    }

    pub async fn get(self) -> Result<Value> {
        let member = self.member()?;
        let payload = if self.path.is_empty() {
            member
        } else {
            format!("{} {}", member, json_path(&self.path))
        };
        let reply = self.world.request(Opcode::ClassStaticGet, payload).await?;
        reply.into_value(self.world.registry())
    }

    pub async fn get_this(self) -> Result<PhpObject> {
        let member = self.member()?;
        let payload = if self.path.is_empty() {
            member
        } else {
            format!("{} {}", member, json_path(&self.path))
        };
        let reply = self.world.request(Opcode::ClassStaticGetThis, payload).await?;
        self.world.adopt_handle(reply)
    }

    pub async fn set(self, value: impl Into<Value>) -> Result<()> {
        let member = self.member()?;
        let value = value.into();
        let (op, encoded) = if value.is_handle_eligible() {
            let id = self.world.register_handle(value);
            let op = if self.path.is_empty() {
                Opcode::ClassStaticSetInst
            } else {
                Opcode::ClassStaticSetPathInst
            };
            (op, id.to_string())
        } else {
            let op = if self.path.is_empty() {
                Opcode::ClassStaticSet
            } else {
                Opcode::ClassStaticSetPath
            };
            (op, self.world.encode_value(&value))
        };
        let payload = if self.path.is_empty() {
            format!("{} {}", member, encoded)
        } else {
            format!("{} [{},{}]", member, json_path(&self.path), encoded)
        };
        self.world.request(op, payload).await?;
        Ok(())
    }

    pub async fn unset(self) -> Result<()> {
        let member = self.member()?;
        self.world.request(Opcode::ClassStaticUnset, member).await?;
        Ok(())
    }
}

// =============================================================================
// Instances
// =============================================================================

/// Builder for operations on a PHP object handle.
pub struct ObjRef<'a> {
    world: &'a mut PhpWorld,
    id: u32,
}

impl<'a> ObjRef<'a> {
    /// A property of the instance.
    pub fn prop(self, name: impl Into<String>) -> PropRef<'a> {
        PropRef {
            world: self.world,
            id: self.id,
            name: name.into(),
            path: Vec::new(),
        }
    }

    /// Call a method.
    pub async fn call(self, method: &str, args: &[Value]) -> Result<Value> {
        validate_name(method)?;
        let payload = if args.is_empty() {
            format!("{} {}", self.id, method)
        } else {
            format!("{} {} {}", self.id, method, self.world.encode_arg_array(args))
        };
        let reply = self.world.request(Opcode::ClassCall, payload).await?;
        reply.into_value(self.world.registry())
    }

    /// Call a method reached through a property path
    /// (`$obj->a->b->method(...)`).
    pub async fn call_path(self, path: &[&str], method: &str, args: &[Value]) -> Result<Value> {
        validate_name(method)?;
        let path: Vec<String> = path.iter().map(|s| s.to_string()).collect();
        let payload = format!(
            "{} {} [{},{}]",
            self.id,
            method,
            json_path(&path),
            self.world.encode_arg_array(args),
        );
        let reply = self.world.request(Opcode::ClassCallPath, payload).await?;
        reply.into_value(self.world.registry())
    }

    /// Invoke the object as a callable (`$obj(...)`).
    pub async fn invoke(self, args: &[Value]) -> Result<Value> {
        let payload = if args.is_empty() {
            self.id.to_string()
        } else {
            format!("{} {}", self.id, self.world.encode_arg_array(args))
        };
        let reply = self.world.request(Opcode::ClassInvoke, payload).await?;
        reply.into_value(self.world.registry())
    }

    /// Iterate the object (`foreach` semantics).
    pub async fn iterate(self) -> Result<PhpIter<'a>> {
        let world = self.world;
        let id = self.id;
        world.request(Opcode::ClassIterateBegin, id.to_string()).await?;
        Ok(PhpIter {
            world,
            id,
            _owner: None,
            done: false,
        })
    }
}

/// Builder for instance-property access.
pub struct PropRef<'a> {
    world: &'a mut PhpWorld,
    id: u32,
    name: String,
    path: Vec<String>,
}

impl<'a> PropRef<'a> {
    pub fn path(mut self, seg: impl Into<String>) -> Self {
        self.path.push(seg.into());
        self
    }

    pub async fn get(self) -> Result<Value> {
        validate_name(&self.name)?;
        let payload = if self.path.is_empty() {
            format!("{} {}", self.id, self.name)
        } else {
            format!("{} {} {}", self.id, self.name, json_path(&self.path))
        };
        let reply = self.world.request(Opcode::ClassGet, payload).await?;
        reply.into_value(self.world.registry())
    }

    /// Read the property as an object handle.
    pub async fn get_this(self) -> Result<PhpObject> {
        validate_name(&self.name)?;
        let payload = if self.path.is_empty() {
            format!("{} {}", self.id, self.name)
        } else {
            format!("{} {} {}", self.id, self.name, json_path(&self.path))
        };
        let reply = self.world.request(Opcode::ClassGetThis, payload).await?;
        self.world.adopt_handle(reply)
    }

    pub async fn set(self, value: impl Into<Value>) -> Result<()> {
        validate_name(&self.name)?;
        let value = value.into();
        let (op, encoded) = if value.is_handle_eligible() {
            let id = self.world.register_handle(value);
            let op = if self.path.is_empty() {
                Opcode::ClassSetInst
            } else {
                Opcode::ClassSetPathInst
            };
            (op, id.to_string())
        } else {
            let op = if self.path.is_empty() {
                Opcode::ClassSet
            } else {
                Opcode::ClassSetPath
            };
            (op, self.world.encode_value(&value))
        };
        let payload = if self.path.is_empty() {
            format!("{} {} {}", self.id, self.name, encoded)
        } else {
            format!("{} {} [{},{}]", self.id, self.name, json_path(&self.path), encoded)
        };
        self.world.request(op, payload).await?;
        Ok(())
    }

    pub async fn unset(self) -> Result<()> {
        validate_name(&self.name)?;
        let (op, payload) = if self.path.is_empty() {
            (Opcode::ClassUnset, format!("{} {}", self.id, self.name))
        } else {
            (
                Opcode::ClassUnsetPath,
                format!("{} {} {}", self.id, self.name, json_path(&self.path)),
            )
        };
        self.world.request(op, payload).await?;
        Ok(())
    }
}

// =============================================================================
// Iteration
// =============================================================================

#[derive(serde::Deserialize)]
struct IterStep {
    done: bool,
    #[serde(default)]
    key: serde_json::Value,
    #[serde(default)]
    value: serde_json::Value,
}

/// An active `foreach` over a PHP value. Each `next` advances the remote
/// iterator by one record.
pub struct PhpIter<'a> {
    world: &'a mut PhpWorld,
    id: u32,
    /// Present when the iterator owns the handle (variable iteration); its
    /// release is queued when the iterator drops.
    _owner: Option<PhpObject>,
    done: bool,
}

impl<'a> PhpIter<'a> {
    pub(crate) async fn begin(world: &'a mut PhpWorld, obj: PhpObject) -> Result<PhpIter<'a>> {
        let id = obj.id();
        world.request(Opcode::ClassIterateBegin, id.to_string()).await?;
        Ok(PhpIter {
            world,
            id,
            _owner: Some(obj),
            done: false,
        })
    }

    /// The next `(key, value)` entry, or `None` once exhausted.
    pub async fn next(&mut self) -> Result<Option<(Value, Value)>> {
        if self.done {
            return Ok(None);
        }
        let reply = self
            .world
            .request(Opcode::ClassIterate, self.id.to_string())
            .await?;
        let step: IterStep = match reply {
            Reply::Payload(s) => serde_json::from_str(&s).map_err(|e| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("bad iterator record: {}", e),
                ))
            })?,
            _ => {
                self.done = true;
                return Ok(None);
            }
        };
        if step.done {
            self.done = true;
            return Ok(None);
        }
        let key = crate::marshal::decode(step.key, self.world.registry());
        let value = crate::marshal::decode(step.value, self.world.registry());
        Ok(Some((key, value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    fn world() -> PhpWorld {
        PhpWorld::new(Settings::default())
    }

    #[tokio::test]
    async fn test_name_validation() {
        let mut php = world();
        assert!(matches!(
            php.var("has space").get().await,
            Err(Error::InvalidUsage(_))
        ));
        assert!(matches!(
            php.var("").get().await,
            Err(Error::InvalidUsage(_))
        ));
        assert!(matches!(
            php.constant("two words").await,
            Err(Error::InvalidUsage(_))
        ));
    }

    #[tokio::test]
    async fn test_class_validation() {
        let mut php = world();
        assert!(matches!(
            php.class("Bad-Name").construct(&[]).await,
            Err(Error::InvalidUsage(_))
        ));
        assert!(matches!(
            php.class("$Cls").construct(&[]).await,
            Err(Error::InvalidUsage(_))
        ));
        assert!(matches!(
            php.class("App").path("Money$").construct(&[]).await,
            Err(Error::InvalidUsage(_))
        ));
    }

    #[tokio::test]
    async fn test_eval_arg_validation() {
        let mut php = world();
        assert!(matches!(
            php.func("eval").call(&[Value::Int(1)]).await,
            Err(Error::InvalidUsage(_))
        ));
        assert!(matches!(
            php.func("require").call(&[]).await,
            Err(Error::InvalidUsage(_))
        ));
    }

    #[test]
    fn test_php_object_to_value() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let obj = PhpObject::new(5, Some("ArrayObject".to_string()), tx);
        assert_eq!(obj.id(), 5);
        assert_eq!(obj.class_name(), Some("ArrayObject"));
        assert_eq!(obj.to_value(), Value::PhpRef(5));
        assert_eq!(Value::from(&obj), Value::PhpRef(5));

        // Dropping queues the fire-and-forget destruct.
        drop(obj);
        assert_eq!(rx.try_recv().unwrap(), 5);
    }

    #[test]
    fn test_json_path() {
        assert_eq!(json_path(&["a".to_string(), "b".to_string()]), "[\"a\",\"b\"]");
    }
}
