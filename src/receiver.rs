//! The receiver runtime: a long-polling loop over a dynamic queue set,
//! dispatching decoded requests to registered handlers and answering control
//! messages about itself.

use crate::control::{
    self, AddQueue, GetRegisteredMessages, RegisterAll, RegisterMessage,
    RemoveQueue, SetReceiverTags, ShutDownReceiver, UnregisterMessage, CONTROL_CLASS_IDS,
};
use crate::dispatcher::{self, Dispatcher, ReceiverStatus};
use crate::error::{RpcError, RpcErrorKind};
use crate::handler::{CallContext, HandlerEntry, HandlerInstance, HandlerRegistry};
use crate::identity;
use crate::message::{self, broadcast_queue_name, direct_queue_name, RpcMessage};
use crate::payload::{HandlerError, JsonMap, MessageEnvelope, RequestPayload, ResponsePayload};
use redis::Commands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Default service name; scopes queue names and the uid heartbeat hash.
pub const RECEIVER_SERVICE_NAME: &str = "receiver";

/// Construction knobs for a [`Receiver`](Receiver).
#[derive(Clone)]
pub struct ReceiverConfig {
    /// Uid for this instance. Fresh uuid when absent.
    pub uid: Option<String>,
    pub service_name: String,
    /// How long one poll blocks before the loop heartbeats and polls again.
    pub polling_timeout: Duration,
    /// Log captured handler failures before returning them to the caller.
    pub log_handler_errors: bool,
    /// Registry to resolve handlers from. The process-wide one when absent.
    pub registry: Option<Arc<HandlerRegistry>>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            uid: None,
            service_name: RECEIVER_SERVICE_NAME.to_string(),
            polling_timeout: Duration::from_secs(1),
            log_handler_errors: true,
            registry: None,
        }
    }
}

#[derive(Default)]
struct ReceiverFlags {
    stopping: AtomicBool,
    suspended: AtomicBool,
    running_loops: AtomicU32,
}

/// Cross-thread control surface for a running receiver.
#[derive(Clone)]
pub struct ReceiverHandle {
    flags: Arc<ReceiverFlags>,
}

impl ReceiverHandle {
    /// Makes the loop exit after its current iteration.
    pub fn stop(&self) {
        self.flags.stopping.store(true, Ordering::SeqCst);
    }

    /// Stops serving broadcast queues. Direct queues keep being served.
    pub fn suspend(&self) {
        self.flags.suspended.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.flags.suspended.store(false, Ordering::SeqCst);
    }

    pub fn is_stopping(&self) -> bool {
        self.flags.stopping.load(Ordering::SeqCst)
    }

    pub fn is_suspended(&self) -> bool {
        self.flags.suspended.load(Ordering::SeqCst)
    }

    /// Whether a process loop is currently running.
    pub fn is_active(&self) -> bool {
        self.flags.running_loops.load(Ordering::SeqCst) > 0
    }
}

/// Overridable lifecycle callbacks around the process loop.
pub trait ReceiverHooks: Send {
    /// Runs once when the loop starts.
    fn on_start(&mut self, _uid: &str) {}
    /// Runs after a task was popped, before its handler.
    fn pre(&mut self, _queue: &str) {}
    /// Runs after the response was pushed.
    fn post(&mut self, _queue: &str) {}
    fn on_handler_error(&mut self, _error: &HandlerError) {}
}

/// A receiver owns its queue sets, handler table and tags, and serves tasks
/// until stopped. Every registered class is reachable over its broadcast
/// queue (shared with siblings) and this instance's direct queue.
pub struct Receiver {
    uid: String,
    service_name: String,
    dispatcher: Dispatcher,
    registry: Arc<HandlerRegistry>,
    handlers: HashMap<String, HandlerEntry>,
    broadcast_queues: BTreeSet<String>,
    direct_queues: BTreeSet<String>,
    tags: JsonMap,
    flags: Arc<ReceiverFlags>,
    hooks: Option<Box<dyn ReceiverHooks>>,
    polling_timeout: Duration,
    log_handler_errors: bool,
}

impl Receiver {
    pub fn new(dispatcher: Dispatcher) -> Result<Self, RpcError> {
        Self::with_config(dispatcher, ReceiverConfig::default())
    }

    pub fn with_config(dispatcher: Dispatcher, config: ReceiverConfig) -> Result<Self, RpcError> {
        let uid = config.uid.unwrap_or_else(identity::new_service_uid);
        message::validate_name_component(&uid)?;
        message::validate_name_component(&config.service_name)?;
        let registry = config.registry.unwrap_or_else(HandlerRegistry::global);
        let mut receiver = Self {
            uid,
            service_name: config.service_name,
            dispatcher,
            registry,
            handlers: HashMap::new(),
            broadcast_queues: BTreeSet::new(),
            direct_queues: BTreeSet::new(),
            tags: JsonMap::new(),
            flags: Arc::new(ReceiverFlags::default()),
            hooks: None,
            polling_timeout: config.polling_timeout,
            log_handler_errors: config.log_handler_errors,
        };
        for class_id in CONTROL_CLASS_IDS {
            receiver.listen_on_class_queues(class_id);
        }
        receiver.publish_status()?;
        info!(uid = %receiver.uid, service = %receiver.service_name, "receiver initialized");
        Ok(receiver)
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn tags(&self) -> &JsonMap {
        &self.tags
    }

    pub fn broadcast_queues(&self) -> &BTreeSet<String> {
        &self.broadcast_queues
    }

    pub fn direct_queues(&self) -> &BTreeSet<String> {
        &self.direct_queues
    }

    /// Control surface usable from other threads while the loop runs.
    pub fn handle(&self) -> ReceiverHandle {
        ReceiverHandle {
            flags: self.flags.clone(),
        }
    }

    pub fn set_hooks(&mut self, hooks: impl ReceiverHooks + 'static) {
        self.hooks = Some(Box::new(hooks));
    }

    pub fn stop(&self) {
        self.flags.stopping.store(true, Ordering::SeqCst);
    }

    pub fn suspend(&self) {
        self.flags.suspended.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.flags.suspended.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.flags.running_loops.load(Ordering::SeqCst) > 0
    }

    /// Registered class ids, control classes included.
    pub fn registered_messages(&self) -> BTreeSet<String> {
        let mut classes: BTreeSet<String> =
            CONTROL_CLASS_IDS.iter().map(|s| s.to_string()).collect();
        classes.extend(self.handlers.keys().cloned());
        classes
    }

    /// Starts handling `M`. The receiver joins the class's broadcast queue
    /// and its own direct queue for it. Registering a class twice is an
    /// error and leaves the receiver unchanged.
    pub fn register<M: RpcMessage>(&mut self, instance: HandlerInstance) -> Result<(), RpcError> {
        self.register_class(M::CLASS_ID, instance)
    }

    pub fn register_class(
        &mut self,
        class_id: &str,
        instance: HandlerInstance,
    ) -> Result<(), RpcError> {
        message::validate_name_component(class_id)?;
        if control::is_control_class(class_id) {
            return Err(RpcError::invalid_argument(format!(
                "{class_id} is a control class and is always registered"
            )));
        }
        if self.handlers.contains_key(class_id) {
            return Err(RpcError::invalid_argument(format!(
                "message class {class_id} is already registered here"
            )));
        }
        let entry = self
            .registry
            .create_handler(class_id, instance, self.handlers.values())?;
        self.listen_on_class_queues(class_id);
        self.handlers.insert(class_id.to_string(), entry);
        info!(uid = %self.uid, class = class_id, "registered message class");
        self.publish_status()
    }

    pub fn unregister<M: RpcMessage>(&mut self) -> Result<(), RpcError> {
        self.unregister_class(M::CLASS_ID)
    }

    /// Stops handling the class and leaves both of its queues.
    pub fn unregister_class(&mut self, class_id: &str) -> Result<(), RpcError> {
        if control::is_control_class(class_id) {
            return Err(RpcError::invalid_argument(format!(
                "{class_id} is a control class and cannot be unregistered"
            )));
        }
        if self.handlers.remove(class_id).is_none() {
            return Err(RpcError::invalid_argument(format!(
                "message class {class_id} is not registered here"
            )));
        }
        self.leave_class_queues(class_id);
        info!(uid = %self.uid, class = class_id, "unregistered message class");
        self.publish_status()
    }

    /// Drops every non-control registration.
    pub fn unregister_all(&mut self) -> Result<(), RpcError> {
        let classes: Vec<String> = self.handlers.keys().cloned().collect();
        for class_id in classes {
            self.handlers.remove(&class_id);
            self.leave_class_queues(&class_id);
        }
        self.publish_status()
    }

    /// Registers every class whose handler is bound to the named state type,
    /// all sharing one instance. Fails before mutating anything if any of
    /// those classes is already registered.
    pub fn register_all(
        &mut self,
        state_name: &str,
        instance: HandlerInstance,
    ) -> Result<(), RpcError> {
        let entries = self.registry.create_handlers_for_state(state_name, instance)?;
        for (class_id, _) in &entries {
            message::validate_name_component(class_id)?;
            if self.handlers.contains_key(class_id) {
                return Err(RpcError::invalid_argument(format!(
                    "message class {class_id} is already registered here"
                )));
            }
        }
        for (class_id, entry) in entries {
            self.listen_on_class_queues(&class_id);
            self.handlers.insert(class_id, entry);
        }
        info!(uid = %self.uid, state = state_name, "registered all classes bound to state");
        self.publish_status()
    }

    /// Joins an arbitrary broadcast queue. Anything arriving there is
    /// dispatched by its envelope class.
    pub fn add_queue(&mut self, name: &str) -> Result<(), RpcError> {
        message::validate_name_component(name)?;
        self.broadcast_queues.insert(name.to_string());
        debug!(uid = %self.uid, queue = name, "listening on queue");
        self.publish_status()
    }

    pub fn remove_queue(&mut self, name: &str) -> Result<(), RpcError> {
        self.broadcast_queues.remove(name);
        debug!(uid = %self.uid, queue = name, "left queue");
        self.publish_status()
    }

    /// Replaces the routing tags wholesale.
    pub fn set_tags(&mut self, tags: JsonMap) -> Result<(), RpcError> {
        self.tags = tags;
        self.publish_status()
    }

    /// Current status snapshot, as published into the discovery hash.
    pub fn status(&self) -> Result<ReceiverStatus, RpcError> {
        let mut listening = self.direct_queues.clone();
        listening.extend(self.broadcast_queues.iter().cloned());
        Ok(ReceiverStatus {
            uid: self.uid.clone(),
            registered_messages: self.registered_messages(),
            listening_queues: listening,
            tags: self.tags.clone(),
            stopping: self.flags.stopping.load(Ordering::SeqCst),
            timestamp: dispatcher::unix_time_seconds()?,
        })
    }

    pub fn publish_status(&self) -> Result<(), RpcError> {
        self.dispatcher.update_receiver_status(&self.status()?)
    }

    /// Runs the poll/dispatch loop until stopped. Handler and broker errors
    /// are logged and swallowed; only [`stop`](Self::stop) or a shutdown
    /// control message ends the loop.
    pub fn process(&mut self) -> Result<(), RpcError> {
        if let Some(hooks) = self.hooks.as_mut() {
            hooks.on_start(&self.uid);
        }
        self.publish_status()?;
        self.flags.running_loops.fetch_add(1, Ordering::SeqCst);
        info!(uid = %self.uid, "receiver loop started");
        while !self.flags.stopping.load(Ordering::SeqCst) {
            if let Err(e) = self.process_one(self.polling_timeout) {
                match e.kind() {
                    RpcErrorKind::InternalInvariantViolation => {
                        error!(uid = %self.uid, error = %e, "dropped request with mismatched task id")
                    }
                    _ => warn!(uid = %self.uid, error = %e, "receiver iteration failed; continuing"),
                }
                // don't spin while the broker is down
                thread::sleep(Duration::from_millis(50));
            }
            if let Err(e) = self.heartbeat() {
                warn!(uid = %self.uid, error = %e, "heartbeat failed");
            }
        }
        self.flags.running_loops.fetch_sub(1, Ordering::SeqCst);
        info!(uid = %self.uid, "receiver loop stopped");
        Ok(())
    }

    /// One poll cycle: blocks up to `timeout` for a task on the current
    /// queue set and serves it. Returns without error on a poll timeout.
    pub fn process_one(&mut self, timeout: Duration) -> Result<(), RpcError> {
        let queues = self.poll_queues();
        if queues.is_empty() {
            return Ok(());
        }
        let mut conn = self.dispatcher.connection()?;
        let result =
            conn.brpop::<&[String], Option<(String, String)>>(&queues, timeout.as_secs_f64())?;
        drop(conn);
        let Some((queue, task_id)) = result else {
            return Ok(());
        };
        if !self.listens_on(&queue) {
            // the queue was dropped between polls; the task is not ours
            debug!(uid = %self.uid, %queue, "popped from an unrouted queue; dropping");
            return Ok(());
        }
        self.serve_task(&queue, &task_id)
    }

    fn serve_task(&mut self, queue: &str, task_id: &str) -> Result<(), RpcError> {
        let mut conn = self.dispatcher.connection()?;
        let raw: Option<Vec<u8>> = conn.get(identity::request_key(task_id))?;
        let Some(raw) = raw else {
            debug!(uid = %self.uid, task_id, "request record expired before pickup; dropping");
            return Ok(());
        };
        let payload: RequestPayload = self.dispatcher.decode(&raw)?;
        if payload.task_id != task_id {
            return Err(RpcError::new(
                RpcErrorKind::InternalInvariantViolation,
                format!(
                    "popped task id {task_id} does not match payload task id {}",
                    payload.task_id
                ),
            ));
        }
        if let Some(hooks) = self.hooks.as_mut() {
            hooks.pre(queue);
        }
        let mut ctx = CallContext::new(task_id, payload.session_data.clone());
        let started = Instant::now();
        let result = self.invoke(&payload.message, &mut ctx);
        let processing_time_seconds = started.elapsed().as_secs_f64();
        let (returned_value, raised_exception) = match result {
            Ok(value) => (Some(value), None),
            Err(failure) => {
                if self.log_handler_errors {
                    warn!(
                        uid = %self.uid,
                        class = %payload.message.class,
                        task_id,
                        error = %failure,
                        "handler failed"
                    );
                }
                if let Some(hooks) = self.hooks.as_mut() {
                    hooks.on_handler_error(&failure);
                }
                (None, Some(failure))
            }
        };
        let session_data = if payload.session_data.is_some() {
            ctx.session_data
        } else {
            None
        };
        let response = ResponsePayload {
            returned_value,
            raised_exception,
            processing_time_seconds,
            service_uid: self.uid.clone(),
            session_data,
        };
        let encoded = self.dispatcher.encode(&response)?;
        conn.lpush::<&str, &[u8], ()>(task_id, &encoded)?;
        conn.expire::<&str, ()>(task_id, payload.timeout as i64)?;
        if let Some(hooks) = self.hooks.as_mut() {
            hooks.post(queue);
        }
        Ok(())
    }

    fn invoke(
        &mut self,
        envelope: &MessageEnvelope,
        ctx: &mut CallContext,
    ) -> Result<Value, HandlerError> {
        if control::is_control_class(&envelope.class) {
            return self.handle_control(envelope);
        }
        let Some(entry) = self.handlers.get(&envelope.class).cloned() else {
            return Err(HandlerError::new(
                "unregistered_message",
                format!("received a message of unregistered class {}", envelope.class),
            ));
        };
        let body = envelope.body.clone();
        // a panicking handler must not take the loop down
        match panic::catch_unwind(AssertUnwindSafe(|| entry.invoke(body, ctx))) {
            Ok(result) => result,
            Err(panic) => Err(HandlerError::new("panic", panic_text(panic))),
        }
    }

    fn handle_control(&mut self, envelope: &MessageEnvelope) -> Result<Value, HandlerError> {
        let body = envelope.body.clone();
        match envelope.class.as_str() {
            RegisterMessage::CLASS_ID => {
                let m: RegisterMessage = decode_control(body)?;
                self.register_class(&m.class_id, m.instance.into())?;
                control_reply(&self.registered_messages())
            }
            UnregisterMessage::CLASS_ID => {
                let m: UnregisterMessage = decode_control(body)?;
                self.unregister_class(&m.class_id)?;
                control_reply(&self.registered_messages())
            }
            GetRegisteredMessages::CLASS_ID => control_reply(&self.registered_messages()),
            AddQueue::CLASS_ID => {
                let m: AddQueue = decode_control(body)?;
                self.add_queue(&m.name)?;
                control_reply(&self.broadcast_queues)
            }
            RemoveQueue::CLASS_ID => {
                let m: RemoveQueue = decode_control(body)?;
                self.remove_queue(&m.name)?;
                control_reply(&self.broadcast_queues)
            }
            SetReceiverTags::CLASS_ID => {
                let m: SetReceiverTags = decode_control(body)?;
                self.set_tags(m.tags)?;
                control_reply(&self.tags)
            }
            RegisterAll::CLASS_ID => {
                let m: RegisterAll = decode_control(body)?;
                self.register_all(&m.state_name, m.instance.into())?;
                control_reply(&self.registered_messages())
            }
            ShutDownReceiver::CLASS_ID => {
                self.stop();
                self.publish_status()?;
                info!(uid = %self.uid, "shutdown requested");
                control_reply(&true)
            }
            other => Err(HandlerError::new(
                "unregistered_message",
                format!("unknown control class {other}"),
            )),
        }
    }

    fn heartbeat(&self) -> Result<(), RpcError> {
        self.dispatcher.heartbeat(&self.service_name, &self.uid)?;
        self.publish_status()
    }

    fn listen_on_class_queues(&mut self, class_id: &str) {
        self.broadcast_queues
            .insert(broadcast_queue_name(&self.service_name, class_id));
        self.direct_queues
            .insert(direct_queue_name(&self.uid, &self.service_name, class_id));
    }

    fn leave_class_queues(&mut self, class_id: &str) {
        self.broadcast_queues
            .remove(&broadcast_queue_name(&self.service_name, class_id));
        self.direct_queues
            .remove(&direct_queue_name(&self.uid, &self.service_name, class_id));
    }

    fn poll_queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self.direct_queues.iter().cloned().collect();
        if !self.flags.suspended.load(Ordering::SeqCst) {
            queues.extend(self.broadcast_queues.iter().cloned());
        }
        queues
    }

    fn listens_on(&self, queue: &str) -> bool {
        self.direct_queues.contains(queue) || self.broadcast_queues.contains(queue)
    }
}

fn decode_control<T: DeserializeOwned>(body: Value) -> Result<T, HandlerError> {
    serde_json::from_value(body)
        .map_err(|e| HandlerError::new("codec", format!("cannot decode control message: {e}")))
}

fn control_reply<T: Serialize>(reply: &T) -> Result<Value, HandlerError> {
    serde_json::to_value(reply)
        .map_err(|e| HandlerError::new("codec", format!("cannot encode control reply: {e}")))
}

fn panic_text(panic: Box<dyn Any + Send>) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "handler panicked".to_string()
    }
}
