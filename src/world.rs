//! The bridge: one PHP control channel, its registries, and the dispatcher.
//!
//! `PhpWorld` owns exactly one control channel and one listener at a time.
//! Every operation takes `&mut self`, so program-order serialization per
//! re-entry level is enforced by the borrow checker rather than a scheduling
//! queue; the dispatcher keeps the numeric re-entry depth for the reverse
//! request handler. After a write, the read loop pumps records until the
//! matching result arrives, recursively executing reverse requests from PHP
//! along the way.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use rand::RngCore;
use tokio::process::Child;
use tokio::sync::mpsc;

use crate::config::{Settings, StdoutMode};
use crate::error::{Error, InterpreterError, Result};
use crate::host::{call_value, features, BridgeRoot, FnObject, HostObject, OpOutcome, SymbolTable};
use crate::marshal;
use crate::protocol::{data_flags, Channel, InRecord, Opcode, ReverseOp};
use crate::registry::{HandleRegistry, BRIDGE_HANDLE, GLOBALS_HANDLE};
use crate::stdout::{StdoutMux, StdoutReader};
use crate::transport::{child, fcgi, ControlListener, ControlStream};
use crate::value::Value;

/// The PHP side of the protocol, shipped inside the binary.
pub(crate) const BOOTSTRAP_PHP: &str = include_str!("bootstrap.php");

/// Grace period for the interpreter to exit after the channel closes.
const EXIT_TIMEOUT: Duration = Duration::from_secs(5);
/// Grace period for the stdout multiplexer to drain after exit.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Uninitialized,
    Initializing,
    Initialized,
    InitFailed,
    Terminated,
}

/// Result payload of one request.
#[derive(Debug)]
pub(crate) enum Reply {
    Payload(String),
    Null,
    Undefined,
}

impl Reply {
    /// Decode as a marshalled JSON value.
    pub(crate) fn into_value(self, reg: &HandleRegistry) -> Result<Value> {
        match self {
            Reply::Payload(s) => {
                let json: serde_json::Value =
                    serde_json::from_str(&s).map_err(|e| protocol_err(format!("bad result JSON: {}", e)))?;
                Ok(marshal::decode(json, reg))
            }
            Reply::Null | Reply::Undefined => Ok(Value::Null),
        }
    }

    /// Decode as `<handle>` or `<handle> <class-name>`.
    pub(crate) fn into_handle(self) -> Result<(u32, Option<String>)> {
        let s = match self {
            Reply::Payload(s) => s,
            other => return Err(protocol_err(format!("expected a handle, got {:?}", other))),
        };
        let (id_str, class) = match s.split_once(' ') {
            Some((id, class)) => (id, Some(class.to_string())),
            None => (s.as_str(), None),
        };
        let id = id_str
            .parse::<u32>()
            .map_err(|_| protocol_err(format!("bad handle {:?}", id_str)))?;
        Ok((id, class))
    }

    pub(crate) fn into_int(self) -> Result<i64> {
        match self {
            Reply::Payload(s) => s
                .trim()
                .parse::<i64>()
                .map_err(|_| protocol_err(format!("expected an integer, got {:?}", s))),
            other => Err(protocol_err(format!("expected an integer, got {:?}", other))),
        }
    }
}

fn protocol_err(msg: String) -> Error {
    Error::Io(io::Error::new(io::ErrorKind::InvalidData, msg))
}

/// The bridge. See the crate docs for the full API tour.
pub struct PhpWorld {
    settings: Settings,
    state: State,
    /// A failed initialize latches here until terminate clears it.
    init_error: Option<String>,
    chan: Option<Channel<ControlStream>>,
    listener: Option<ControlListener>,
    child: Option<Child>,
    fcgi: Option<fcgi::OngoingFcgi>,
    /// Keeps the on-disk bootstrap copy alive in FastCGI mode.
    fcgi_script: Option<tempfile::NamedTempFile>,
    stdout_mux: Option<StdoutMux>,
    registry: HandleRegistry,
    globals: Arc<SymbolTable>,
    /// Re-entry depth: 0 outside reverse requests.
    depth: u32,
    /// Frame-stack markers (values of `last_remote_handle` at push time).
    frames: Vec<u32>,
    /// Highest PHP-side handle observed so far.
    last_remote_handle: u32,
    destruct_tx: mpsc::UnboundedSender<u32>,
    destruct_rx: mpsc::UnboundedReceiver<u32>,
}

impl PhpWorld {
    pub fn new(settings: Settings) -> Self {
        let globals = Arc::new(SymbolTable::new());
        globals.set_resolver(settings.onsymbol.clone());
        let mut registry = HandleRegistry::new();
        registry.pin(
            BRIDGE_HANDLE,
            Arc::new(BridgeRoot {
                globals: globals.clone(),
            }),
        );
        registry.pin(GLOBALS_HANDLE, globals.clone());
        let (destruct_tx, destruct_rx) = mpsc::unbounded_channel();
        Self {
            settings,
            state: State::Uninitialized,
            init_error: None,
            chan: None,
            listener: None,
            child: None,
            fcgi: None,
            fcgi_script: None,
            stdout_mux: None,
            registry,
            globals,
            depth: 0,
            frames: Vec::new(),
            last_remote_handle: 0,
            destruct_tx,
            destruct_rx,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The host global namespace PHP resolves symbols against.
    pub fn globals(&self) -> &SymbolTable {
        &self.globals
    }

    /// Current re-entry depth; non-zero while servicing a reverse request.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Bring the interpreter up. Idempotent; every operation calls this
    /// implicitly, and a terminated bridge respawns on the next operation.
    pub async fn initialize(&mut self) -> Result<()> {
        match self.state {
            State::Initialized => return Ok(()),
            State::InitFailed => return Err(self.latched_error()),
            State::Initializing => {
                return Err(Error::InvalidUsage("re-entrant initialize".to_string()))
            }
            State::Uninitialized | State::Terminated => {}
        }
        self.state = State::Initializing;
        match self.do_initialize().await {
            Ok(()) => {
                self.state = State::Initialized;
                tracing::debug!("bridge initialized");
                Ok(())
            }
            Err(e) => {
                let msg = e.to_string();
                self.shutdown_process().await;
                self.state = State::InitFailed;
                self.init_error = Some(msg);
                Err(e)
            }
        }
    }

    fn latched_error(&self) -> Error {
        Error::Handshake(format!(
            "initialization previously failed: {}",
            self.init_error.as_deref().unwrap_or("unknown error")
        ))
    }

    async fn do_initialize(&mut self) -> Result<()> {
        let listener = ControlListener::bind(&self.settings).await?;
        let endpoint = listener.endpoint(&self.settings.localhost_name)?;

        let mut key = [0u8; 32];
        let mut stdout_sentinel = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        rand::thread_rng().fill_bytes(&mut stdout_sentinel);
        let key_b64 = general_purpose::STANDARD.encode(key);

        let handshake_line = format!(
            "{} {} {} {}",
            key_b64,
            general_purpose::STANDARD.encode(stdout_sentinel),
            general_purpose::STANDARD.encode(endpoint.as_bytes()),
            general_purpose::STANDARD.encode(self.settings.init_php_file.as_bytes()),
        );

        let stream = if self.settings.php_fpm.is_enabled() {
            self.start_fcgi(&listener, &handshake_line, &key_b64).await?
        } else {
            self.start_child(&listener, &handshake_line, &key_b64, stdout_sentinel)
                .await?
        };

        self.chan = Some(Channel::new(stream));
        self.listener = Some(listener);

        if !self.settings.init_php_file.is_empty() {
            // The bootstrap runs the init script, then emits one no-content
            // result. Reverse requests from the script are served here.
            self.read_reply().await?;
        }
        Ok(())
    }

    async fn start_child(
        &mut self,
        listener: &ControlListener,
        handshake_line: &str,
        key_b64: &str,
        stdout_sentinel: [u8; 32],
    ) -> Result<ControlStream> {
        let inline = BOOTSTRAP_PHP
            .trim_start_matches("<?php")
            .trim_start()
            .to_string();
        let mut child = child::spawn(&self.settings, handshake_line, &inline).await?;

        if self.settings.stdout == StdoutMode::Piped {
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| Error::Handshake("child stdout unavailable".to_string()))?;
            self.stdout_mux = Some(StdoutMux::new(stdout, stdout_sentinel));
        }

        let stream = loop {
            tokio::select! {
                conn = listener.accept() => {
                    let mut conn = conn?;
                    match conn.read_line().await {
                        Ok(line) if line == key_b64 => break conn,
                        Ok(_) => tracing::warn!("control connection rejected: bad handshake key"),
                        Err(e) => tracing::warn!(error = %e, "control connection rejected"),
                    }
                }
                status = child.wait() => {
                    let code = status.ok().and_then(|s| s.code()).unwrap_or(-1);
                    tracing::error!(code, "interpreter exited before handshake");
                    return Err(Error::InterpreterExit { code });
                }
            }
        };
        self.child = Some(child);
        Ok(stream)
    }

    async fn start_fcgi(
        &mut self,
        listener: &ControlListener,
        handshake_line: &str,
        key_b64: &str,
    ) -> Result<ControlStream> {
        use std::io::Write;

        let mut script = tempfile::Builder::new()
            .prefix("php_world_bootstrap")
            .suffix(".php")
            .tempfile()?;
        script.write_all(BOOTSTRAP_PHP.as_bytes())?;
        script.flush()?;
        let script_path = script.path().to_string_lossy().into_owned();

        let mut ongoing = fcgi::start(
            &self.settings.php_fpm,
            vec![
                ("PHP_WORLD_HELO".to_string(), handshake_line.to_string()),
                ("SCRIPT_FILENAME".to_string(), script_path),
            ],
        );

        let stream = loop {
            tokio::select! {
                conn = listener.accept() => {
                    let mut conn = conn?;
                    match conn.read_line().await {
                        Ok(line) if line == key_b64 => break conn,
                        Ok(_) => tracing::warn!("control connection rejected: bad handshake key"),
                        Err(e) => tracing::warn!(error = %e, "control connection rejected"),
                    }
                }
                done = &mut ongoing.done => {
                    // The response finished before the bootstrap connected
                    // back: the handshake failed.
                    return Err(match done {
                        Ok(Ok(outcome)) => Error::Fcgi {
                            status: outcome.status,
                            body: String::from_utf8_lossy(&outcome.body).into_owned(),
                        },
                        Ok(Err(e)) => e,
                        Err(_) => Error::Handshake("FastCGI task vanished".to_string()),
                    });
                }
            }
        };
        self.fcgi = Some(ongoing);
        self.fcgi_script = Some(script);
        Ok(stream)
    }

    /// Tear everything down and collect the interpreter's exit code (0 on
    /// success, -1 when unavailable). The bridge respawns on the next
    /// operation.
    pub async fn terminate(&mut self) -> i32 {
        self.shutdown_process().await
    }

    async fn shutdown_process(&mut self) -> i32 {
        // Closing the control socket is the interpreter's cue to exit.
        self.chan = None;

        let mut code = 0;
        if let Some(mut child) = self.child.take() {
            code = match tokio::time::timeout(EXIT_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => status.code().unwrap_or(-1),
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "failed to collect interpreter exit status");
                    -1
                }
                Err(_) => {
                    tracing::warn!("interpreter did not exit; killing");
                    let _ = child.start_kill();
                    match child.wait().await {
                        Ok(status) => status.code().unwrap_or(-1),
                        Err(_) => -1,
                    }
                }
            };
        }

        if let Some(mux) = self.stdout_mux.take() {
            mux.join(DRAIN_TIMEOUT).await;
        }
        if let Some(ongoing) = self.fcgi.take() {
            // Discard the still-streaming response body.
            ongoing.abort();
        }
        self.fcgi_script = None;
        if let Some(listener) = self.listener.take() {
            listener.cleanup();
        }

        self.registry.reset();
        self.frames.clear();
        self.last_remote_handle = 0;
        self.depth = 0;
        // Fresh queue: handles from the dead session must not release IDs
        // that a respawned interpreter will reuse.
        let (tx, rx) = mpsc::unbounded_channel();
        self.destruct_tx = tx;
        self.destruct_rx = rx;

        self.state = State::Terminated;
        self.init_error = None;
        tracing::debug!(code, "bridge terminated");
        code
    }

    async fn ensure_init(&mut self) -> Result<()> {
        match self.state {
            State::Initialized => Ok(()),
            State::InitFailed => Err(self.latched_error()),
            _ => self.initialize().await,
        }
    }

    // =========================================================================
    // Dispatcher
    // =========================================================================

    /// Submit one operation: write the request, then pump records until its
    /// result arrives, servicing reverse requests along the way.
    pub(crate) async fn request(&mut self, op: Opcode, payload: String) -> Result<Reply> {
        self.ensure_init().await?;
        self.flush_destructs().await?;
        tracing::trace!(?op, payload = %payload, "request");
        self.write_frame(op, payload.as_bytes()).await?;
        self.read_reply().await
    }

    /// Send a fire-and-forget record (no result follows).
    pub(crate) async fn send_oneway(&mut self, op: Opcode, payload: String) -> Result<()> {
        self.ensure_init().await?;
        self.flush_destructs().await?;
        self.write_frame(op, payload.as_bytes()).await
    }

    /// Queue a PHP-side handle release; flushed before the next request.
    pub(crate) fn destruct_queue(&self) -> mpsc::UnboundedSender<u32> {
        self.destruct_tx.clone()
    }

    async fn flush_destructs(&mut self) -> Result<()> {
        while let Ok(id) = self.destruct_rx.try_recv() {
            self.write_frame(Opcode::Destruct, id.to_string().as_bytes()).await?;
        }
        Ok(())
    }

    async fn write_frame(&mut self, op: Opcode, payload: &[u8]) -> Result<()> {
        let chan = match self.chan.as_mut() {
            Some(chan) => chan,
            None => return Err(Error::InterpreterExit { code: -1 }),
        };
        match chan.write_record(op, payload).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.channel_lost(e).await),
        }
    }

    async fn read_reply(&mut self) -> Result<Reply> {
        loop {
            let rec = match self.chan.as_mut() {
                Some(chan) => chan.read_record().await,
                None => return Err(Error::InterpreterExit { code: -1 }),
            };
            match rec {
                Ok(InRecord::Result(s)) => return Ok(Reply::Payload(s)),
                Ok(InRecord::Null) => return Ok(Reply::Null),
                Ok(InRecord::Undefined) => return Ok(Reply::Undefined),
                Ok(InRecord::Request { target, op, payload }) => {
                    if op == ReverseOp::Error {
                        return Err(self.interpreter_error(&payload));
                    }
                    self.serve_reverse(target, op, payload).await?;
                }
                Err(e) => return Err(self.channel_lost(e).await),
            }
        }
    }

    /// An I/O failure on the channel means the interpreter is gone: clean up
    /// and surface the exit.
    async fn channel_lost(&mut self, err: io::Error) -> Error {
        tracing::debug!(error = %err, "control channel lost");
        let had_child = self.child.is_some();
        let code = self.shutdown_process().await;
        Error::InterpreterExit {
            code: if had_child { code } else { -1 },
        }
    }

    fn interpreter_error(&self, payload: &str) -> Error {
        match serde_json::from_str::<(String, u32, String, String)>(payload) {
            Ok((file, line, message, trace)) => {
                Error::Interpreter(InterpreterError::new(message, file, line, trace))
            }
            Err(_) => Error::Interpreter(InterpreterError::new(payload, "", 0, "")),
        }
    }

    // =========================================================================
    // Reverse requests
    // =========================================================================

    async fn serve_reverse(&mut self, target: u32, op: ReverseOp, payload: String) -> Result<()> {
        self.depth += 1;
        tracing::debug!(depth = self.depth, target, ?op, "serving reverse request");
        let outcome = self.dispatch_reverse(target, op, &payload).await;
        self.depth -= 1;

        if op == ReverseOp::Destruct {
            // Fire-and-forget in both directions.
            return Ok(());
        }
        if let Err(e) = &outcome {
            tracing::warn!(target, ?op, error = %e, "host-side callback error");
        }
        let (flags, data) = self.compose_data(outcome);
        let reply = format!("{} {}", flags, data);
        self.write_frame(Opcode::Data, reply.as_bytes()).await
    }

    async fn dispatch_reverse(&mut self, target: u32, op: ReverseOp, payload: &str) -> OpOutcome {
        match op {
            ReverseOp::Error => unreachable!("handled by the read loop"),
            ReverseOp::Destruct => {
                self.registry.release(target);
                Ok(Value::Null)
            }
            ReverseOp::GetClass => {
                let name: String = parse_json(payload)?;
                self.globals
                    .resolve(&name)
                    .ok_or_else(|| format!("undefined host class '{}'", name))
            }
            ReverseOp::Construct => {
                let obj = self.reverse_target(target)?;
                let args = self.decode_args(payload)?;
                obj.construct(self, args).await
            }
            ReverseOp::ClassGet => {
                let obj = self.reverse_target(target)?;
                let name: String = parse_json(payload)?;
                obj.get(self, &name).await
            }
            ReverseOp::ClassSet => {
                let obj = self.reverse_target(target)?;
                let (name, value): (String, serde_json::Value) = parse_json(payload)?;
                let value = marshal::decode(value, &self.registry);
                obj.set(self, &name, value).await.map(|_| Value::Null)
            }
            ReverseOp::ClassCall | ReverseOp::ClassStaticCall | ReverseOp::Call => {
                let obj = self.reverse_target(target)?;
                let (name, args): (String, Vec<serde_json::Value>) = parse_json(payload)?;
                let args = self.decode_arg_list(args);
                obj.call(self, &name, args).await
            }
            ReverseOp::ClassInvoke => {
                let obj = self.reverse_target(target)?;
                let args = self.decode_args(payload)?;
                obj.invoke(self, args).await
            }
            ReverseOp::ClassGetIterator => {
                let obj = self.reverse_target(target)?;
                obj.iterate(self).await.map(Value::Arr)
            }
            ReverseOp::ClassToString => {
                let obj = self.reverse_target(target)?;
                obj.to_display().map(Value::Str)
            }
            ReverseOp::ClassIsset => {
                let obj = self.reverse_target(target)?;
                let name: String = parse_json(payload)?;
                Ok(Value::Bool(obj.isset(&name)))
            }
            ReverseOp::ClassUnset => {
                let obj = self.reverse_target(target)?;
                let name: String = parse_json(payload)?;
                obj.unset(&name).map(|_| Value::Null)
            }
            ReverseOp::ClassProps => {
                let obj = self.reverse_target(target)?;
                Ok(Value::Arr(obj.props().into_iter().map(Value::Str).collect()))
            }
            ReverseOp::JsonEncode => {
                let obj = self.reverse_target(target)?;
                obj.json().map(|j| Value::Str(j.to_string()))
            }
        }
    }

    fn reverse_target(&self, target: u32) -> std::result::Result<Arc<dyn HostObject>, String> {
        self.registry
            .lookup(target)
            .ok_or_else(|| format!("unknown handle {}", target))
    }

    fn decode_args(&self, payload: &str) -> std::result::Result<Vec<Value>, String> {
        if payload.is_empty() {
            return Ok(Vec::new());
        }
        let items: Vec<serde_json::Value> = parse_json(payload)?;
        Ok(self.decode_arg_list(items))
    }

    fn decode_arg_list(&self, items: Vec<serde_json::Value>) -> Vec<Value> {
        items
            .into_iter()
            .map(|v| marshal::decode(v, &self.registry))
            .collect()
    }

    /// Build the `DATA` reply: type flags, a space, then the payload.
    fn compose_data(&mut self, outcome: OpOutcome) -> (u32, String) {
        match outcome {
            Err(msg) => (data_flags::IS_ERROR, msg),
            Ok(Value::Str(s)) => (data_flags::IS_STRING, s),
            Ok(Value::Obj(obj)) => {
                let flags = features(&*obj);
                let id = self.registry.register(obj);
                (flags, id.to_string())
            }
            Ok(Value::Fun(f)) => {
                let obj: Arc<dyn HostObject> = Arc::new(FnObject(f));
                let flags = features(&*obj);
                let id = self.registry.register(obj);
                (flags, id.to_string())
            }
            Ok(v) => {
                let json = marshal::encode(&v, &mut self.registry);
                (data_flags::IS_JSON, json.to_string())
            }
        }
    }

    // =========================================================================
    // Frame stack and handle bookkeeping
    // =========================================================================

    /// Checkpoint the PHP-side handle allocator.
    pub fn push_frame(&mut self) {
        self.frames.push(self.last_remote_handle);
    }

    /// Destruct every PHP-side handle allocated after the matching
    /// `push_frame` and rewind the allocator.
    pub async fn pop_frame(&mut self) -> Result<()> {
        let marker = self
            .frames
            .pop()
            .ok_or_else(|| Error::InvalidUsage("pop_frame without a matching push_frame".to_string()))?;
        self.request(Opcode::PopFrame, marker.to_string()).await?;
        self.last_remote_handle = marker;
        Ok(())
    }

    /// Number of live PHP-side handles.
    pub async fn n_objects(&mut self) -> Result<i64> {
        self.request(Opcode::NObjects, String::new()).await?.into_int()
    }

    pub(crate) fn note_remote_handle(&mut self, id: u32) {
        if id > self.last_remote_handle {
            self.last_remote_handle = id;
        }
    }

    pub(crate) fn registry(&self) -> &HandleRegistry {
        &self.registry
    }

    /// Marshal a value into wire JSON text, registering handles as needed.
    pub(crate) fn encode_value(&mut self, value: &Value) -> String {
        marshal::encode(value, &mut self.registry).to_string()
    }

    /// Register a handle-eligible value, returning its fresh handle.
    pub(crate) fn register_handle(&mut self, value: Value) -> u32 {
        match value {
            Value::Obj(obj) => self.registry.register(obj),
            Value::Fun(f) => self.registry.register(Arc::new(FnObject(f))),
            other => unreachable!("not handle-eligible: {:?}", other),
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.chan.is_some()
    }

    // =========================================================================
    // Stdout
    // =========================================================================

    /// Cut the piped interpreter stdout at the sentinel and return a reader
    /// for everything written before the cut.
    pub async fn get_stdout_reader(&mut self) -> Result<StdoutReader> {
        self.ensure_init().await?;
        if self.stdout_mux.is_none() {
            return Err(Error::InvalidUsage(
                "get_stdout_reader requires stdout = piped".to_string(),
            ));
        }
        self.request(Opcode::EndStdout, String::new()).await?;
        let mux = self
            .stdout_mux
            .as_ref()
            .ok_or(Error::InterpreterExit { code: -1 })?;
        Ok(mux.attach().await)
    }

    /// Evaluate host `callee(args)` on behalf of a host object
    /// implementation; mirrors what a reverse `CALL` does.
    pub async fn call_host(&mut self, callee: Value, args: Vec<Value>) -> OpOutcome {
        call_value(self, callee, args).await
    }
}

impl Drop for PhpWorld {
    fn drop(&mut self) {
        // Dropping the channel closes the socket; the interpreter exits on
        // its own. Exit-status collection needs `.terminate().await`.
        if self.state == State::Initialized {
            tracing::debug!("bridge dropped while initialized");
        }
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(payload: &str) -> std::result::Result<T, String> {
    serde_json::from_str(payload).map_err(|e| format!("malformed reverse payload: {}", e))
}
