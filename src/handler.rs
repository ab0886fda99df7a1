//! The process-wide handler registry.
//!
//! A handler is registered once per message class, at module initialization,
//! as either a free function or a function bound to a state type. Receivers
//! resolve registry entries into concrete handlers, supplying (or
//! constructing, or borrowing from a sibling) the state instance bound
//! handlers run against.

use crate::error::{RpcError, RpcErrorKind};
use crate::message::RpcMessage;
use crate::payload::{HandlerError, JsonMap, SessionData};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

/// State type that bound handlers operate on. It needs a stable name so
/// registration control messages can refer to it, and a serde constructor so
/// instances can be built from keyword maps sent over the wire.
pub trait HandlerState: DeserializeOwned + Send + 'static {
    const NAME: &'static str;
}

/// A handler instance shared between sibling handlers on one receiver.
pub type SharedInstance = Arc<Mutex<dyn Any + Send>>;

/// Per-invocation context handed to every handler.
pub struct CallContext {
    /// Id of the task being served.
    pub task_id: String,
    /// Session data the request carried, if any. Mutations flow back to the
    /// caller in the response.
    pub session_data: Option<SessionData>,
}

impl CallContext {
    pub fn new(task_id: impl Into<String>, session_data: Option<SessionData>) -> Self {
        Self {
            task_id: task_id.into(),
            session_data,
        }
    }
}

type FreeFn = Arc<dyn Fn(Value, &mut CallContext) -> Result<Value, HandlerError> + Send + Sync>;
type BoundFn =
    Arc<dyn Fn(&SharedInstance, Value, &mut CallContext) -> Result<Value, HandlerError> + Send + Sync>;
type ConstructFn = Arc<dyn Fn(&JsonMap) -> Result<SharedInstance, HandlerError> + Send + Sync>;

/// Identity of the state type a bound handler belongs to, plus its
/// keyword-map constructor.
#[derive(Clone)]
pub(crate) struct StateClass {
    pub name: &'static str,
    pub type_id: TypeId,
    construct: ConstructFn,
}

impl StateClass {
    fn construct(&self, kwargs: &JsonMap) -> Result<SharedInstance, RpcError> {
        (self.construct)(kwargs).map_err(|e| {
            RpcError::new(RpcErrorKind::InvalidHandlerInstance, e.to_string())
        })
    }
}

/// What the registry stores per message class.
#[derive(Clone)]
pub(crate) enum HandlerDescriptor {
    Free(FreeFn),
    Bound { state: StateClass, call: BoundFn },
}

/// Instance parameter for resolving a bound handler at registration time.
pub enum HandlerInstance {
    /// No instance. Valid for free handlers; bound handlers will try to
    /// borrow a sibling's instance.
    None,
    /// Keyword arguments for constructing a fresh instance of the owning
    /// state type.
    Kwargs(JsonMap),
    /// An already-built instance. Only available to local callers; over the
    /// wire instances travel as keyword maps.
    Shared(SharedInstance),
}

impl HandlerInstance {
    /// Wraps a state value for local registration.
    pub fn shared<S: Send + 'static>(state: S) -> Self {
        HandlerInstance::Shared(Arc::new(Mutex::new(state)))
    }
}

/// A registry entry resolved onto a concrete receiver.
#[derive(Clone)]
pub(crate) struct HandlerEntry {
    pub descriptor: HandlerDescriptor,
    pub instance: Option<SharedInstance>,
}

impl std::fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("has_instance", &self.instance.is_some())
            .finish()
    }
}

impl HandlerEntry {
    pub fn invoke(&self, body: Value, ctx: &mut CallContext) -> Result<Value, HandlerError> {
        match &self.descriptor {
            HandlerDescriptor::Free(call) => call(body, ctx),
            HandlerDescriptor::Bound { call, state } => {
                let instance = self.instance.as_ref().ok_or_else(|| {
                    HandlerError::new(
                        "missing_handler_instance",
                        format!("bound handler for state {} has no instance", state.name),
                    )
                })?;
                call(instance, body, ctx)
            }
        }
    }
}

/// Message class id to handler descriptor. One registry per process; use
/// [`HandlerRegistry::global()`](HandlerRegistry::global) unless a test needs
/// an isolated one.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, HandlerDescriptor>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// The process-wide registry.
    pub fn global() -> Arc<HandlerRegistry> {
        static GLOBAL: OnceLock<Arc<HandlerRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(HandlerRegistry::new())).clone()
    }

    /// Drops every registration. Test hook.
    pub fn reset(&self) {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.clear();
        }
    }

    /// Registers a handler that needs no state.
    pub fn set_free_handler<M, F>(&self, handler: F) -> Result<(), RpcError>
    where
        M: RpcMessage,
        F: Fn(M, &mut CallContext) -> Result<M::Reply, HandlerError> + Send + Sync + 'static,
    {
        let erased: FreeFn = Arc::new(move |body, ctx| {
            let message: M = decode_body(M::CLASS_ID, body)?;
            let reply = handler(message, ctx)?;
            encode_reply(M::CLASS_ID, &reply)
        });
        self.insert(M::CLASS_ID, HandlerDescriptor::Free(erased))
    }

    /// Registers a handler bound to a state type. Every class bound to the
    /// same `S` on one receiver shares a single instance.
    pub fn set_bound_handler<M, S, F>(&self, handler: F) -> Result<(), RpcError>
    where
        M: RpcMessage,
        S: HandlerState,
        F: Fn(&mut S, M, &mut CallContext) -> Result<M::Reply, HandlerError> + Send + Sync + 'static,
    {
        let call: BoundFn = Arc::new(move |instance, body, ctx| {
            let message: M = decode_body(M::CLASS_ID, body)?;
            let mut guard = instance.lock().map_err(|_| {
                HandlerError::new("memory_access_error", "handler instance lock is poisoned")
            })?;
            let state = guard.downcast_mut::<S>().ok_or_else(|| {
                HandlerError::new(
                    "invalid_handler_instance",
                    format!("handler instance is not a {}", S::NAME),
                )
            })?;
            let reply = handler(state, message, ctx)?;
            encode_reply(M::CLASS_ID, &reply)
        });
        let construct: ConstructFn = Arc::new(|kwargs| {
            let state: S = serde_json::from_value(Value::Object(kwargs.clone())).map_err(|e| {
                HandlerError::new(
                    "invalid_handler_instance",
                    format!("cannot construct {} from keyword map: {e}", S::NAME),
                )
            })?;
            Ok(Arc::new(Mutex::new(state)) as SharedInstance)
        });
        self.insert(
            M::CLASS_ID,
            HandlerDescriptor::Bound {
                state: StateClass {
                    name: S::NAME,
                    type_id: TypeId::of::<S>(),
                    construct,
                },
                call,
            },
        )
    }

    fn insert(&self, class_id: &str, descriptor: HandlerDescriptor) -> Result<(), RpcError> {
        let mut handlers = self.handlers.write()?;
        if handlers.contains_key(class_id) {
            return Err(RpcError::invalid_argument(format!(
                "a handler has already been set for {class_id}"
            )));
        }
        handlers.insert(class_id.to_string(), descriptor);
        Ok(())
    }

    pub(crate) fn descriptor(&self, class_id: &str) -> Result<Option<HandlerDescriptor>, RpcError> {
        Ok(self.handlers.read()?.get(class_id).cloned())
    }

    /// Lists the class ids with a registered handler.
    pub fn registered_classes(&self) -> Vec<String> {
        self.handlers
            .read()
            .map(|handlers| handlers.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Resolves a registry entry into a concrete handler for one receiver.
    ///
    /// For bound handlers the instance is taken from `instance`, constructed
    /// from a keyword map, or borrowed from a sibling handler whose instance
    /// has the owning state type.
    pub(crate) fn create_handler<'a>(
        &self,
        class_id: &str,
        instance: HandlerInstance,
        siblings: impl Iterator<Item = &'a HandlerEntry>,
    ) -> Result<HandlerEntry, RpcError> {
        let descriptor = self.descriptor(class_id)?.ok_or_else(|| {
            RpcError::invalid_argument(format!(
                "no handler is registered for message class {class_id}"
            ))
        })?;
        let instance = match &descriptor {
            HandlerDescriptor::Free(_) => match instance {
                HandlerInstance::None => None,
                _ => {
                    return Err(RpcError::new(
                        RpcErrorKind::InvalidHandlerInstance,
                        format!("handler for {class_id} is a free function and takes no instance"),
                    ))
                }
            },
            HandlerDescriptor::Bound { state, .. } => match instance {
                HandlerInstance::Kwargs(kwargs) => Some(state.construct(&kwargs)?),
                HandlerInstance::Shared(shared) => {
                    check_instance_type(&shared, state)?;
                    Some(shared)
                }
                HandlerInstance::None => Some(borrow_sibling_instance(state, siblings)?),
            },
        };
        Ok(HandlerEntry {
            descriptor,
            instance,
        })
    }

    /// Resolves one shared instance and returns a handler for every class
    /// whose registered function is bound to the named state type.
    pub(crate) fn create_handlers_for_state(
        &self,
        state_name: &str,
        instance: HandlerInstance,
    ) -> Result<Vec<(String, HandlerEntry)>, RpcError> {
        let matching: Vec<(String, HandlerDescriptor)> = {
            let handlers = self.handlers.read()?;
            handlers
                .iter()
                .filter(|(_, descriptor)| {
                    matches!(descriptor, HandlerDescriptor::Bound { state, .. } if state.name == state_name)
                })
                .map(|(class_id, descriptor)| (class_id.clone(), descriptor.clone()))
                .collect()
        };
        let Some((_, first)) = matching.first() else {
            return Err(RpcError::invalid_argument(format!(
                "no registered handlers are bound to state {state_name}"
            )));
        };
        let HandlerDescriptor::Bound { state, .. } = first else {
            unreachable!("filtered to bound descriptors");
        };
        let shared = match instance {
            HandlerInstance::Kwargs(kwargs) => state.construct(&kwargs)?,
            HandlerInstance::Shared(shared) => {
                check_instance_type(&shared, state)?;
                shared
            }
            HandlerInstance::None => {
                return Err(RpcError::new(
                    RpcErrorKind::MissingHandlerInstance,
                    format!("bulk registration for {state_name} needs an instance or a keyword map"),
                ))
            }
        };
        let mut entries = Vec::with_capacity(matching.len());
        for (class_id, descriptor) in matching {
            entries.push((
                class_id,
                HandlerEntry {
                    descriptor,
                    instance: Some(shared.clone()),
                },
            ));
        }
        Ok(entries)
    }
}

fn check_instance_type(shared: &SharedInstance, state: &StateClass) -> Result<(), RpcError> {
    let guard = shared.lock()?;
    if (*guard).type_id() != state.type_id {
        return Err(RpcError::new(
            RpcErrorKind::InvalidHandlerInstance,
            format!("supplied instance is not a {}", state.name),
        ));
    }
    Ok(())
}

fn borrow_sibling_instance<'a>(
    state: &StateClass,
    siblings: impl Iterator<Item = &'a HandlerEntry>,
) -> Result<SharedInstance, RpcError> {
    for sibling in siblings {
        if let Some(instance) = &sibling.instance {
            let guard = instance.lock()?;
            if (*guard).type_id() == state.type_id {
                drop(guard);
                return Ok(instance.clone());
            }
        }
    }
    Err(RpcError::new(
        RpcErrorKind::MissingHandlerInstance,
        format!(
            "no instance supplied and no sibling handler holds a {}",
            state.name
        ),
    ))
}

fn decode_body<M: DeserializeOwned>(class_id: &str, body: Value) -> Result<M, HandlerError> {
    serde_json::from_value(body)
        .map_err(|e| HandlerError::new("codec", format!("cannot decode {class_id} message: {e}")))
}

fn encode_reply<T: serde::Serialize>(class_id: &str, reply: &T) -> Result<Value, HandlerError> {
    serde_json::to_value(reply)
        .map_err(|e| HandlerError::new("codec", format!("cannot encode {class_id} reply: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Serialize, Deserialize)]
    struct Double {
        value: i64,
    }

    impl RpcMessage for Double {
        const CLASS_ID: &'static str = "tests.double";
        type Reply = i64;
    }

    #[derive(Serialize, Deserialize)]
    struct Bump {
        by: i64,
    }

    impl RpcMessage for Bump {
        const CLASS_ID: &'static str = "tests.bump";
        type Reply = i64;
    }

    #[derive(Serialize, Deserialize)]
    struct Read;

    impl RpcMessage for Read {
        const CLASS_ID: &'static str = "tests.read";
        type Reply = i64;
    }

    #[derive(Deserialize)]
    struct Counter {
        #[serde(default)]
        count: i64,
    }

    impl HandlerState for Counter {
        const NAME: &'static str = "tests.counter";
    }

    fn registry_with_handlers() -> HandlerRegistry {
        let registry = HandlerRegistry::new();
        registry
            .set_free_handler::<Double, _>(|m, _ctx| Ok(m.value * 2))
            .unwrap();
        registry
            .set_bound_handler::<Bump, Counter, _>(|state, m, _ctx| {
                state.count += m.by;
                Ok(state.count)
            })
            .unwrap();
        registry
            .set_bound_handler::<Read, Counter, _>(|state, _m, _ctx| Ok(state.count))
            .unwrap();
        registry
    }

    fn ctx() -> CallContext {
        CallContext::new("task-1", None)
    }

    #[test]
    fn second_registration_for_a_class_is_fatal() {
        let registry = registry_with_handlers();
        let result = registry.set_free_handler::<Double, _>(|m, _| Ok(m.value));
        assert!(matches!(
            result.unwrap_err().kind(),
            RpcErrorKind::InvalidArgument
        ));
    }

    #[test]
    fn free_handler_runs_without_an_instance() {
        let registry = registry_with_handlers();
        let entry = registry
            .create_handler(Double::CLASS_ID, HandlerInstance::None, std::iter::empty())
            .unwrap();
        let reply = entry.invoke(json!({"value": 21}), &mut ctx()).unwrap();
        assert_eq!(reply, json!(42));
    }

    #[test]
    fn free_handler_rejects_an_instance() {
        let registry = registry_with_handlers();
        let result = registry.create_handler(
            Double::CLASS_ID,
            HandlerInstance::Kwargs(JsonMap::new()),
            std::iter::empty(),
        );
        assert!(matches!(
            result.unwrap_err().kind(),
            RpcErrorKind::InvalidHandlerInstance
        ));
    }

    #[test]
    fn bound_handler_builds_its_state_from_kwargs() {
        let registry = registry_with_handlers();
        let mut kwargs = JsonMap::new();
        kwargs.insert("count".into(), json!(10));
        let entry = registry
            .create_handler(Bump::CLASS_ID, HandlerInstance::Kwargs(kwargs), std::iter::empty())
            .unwrap();
        assert_eq!(entry.invoke(json!({"by": 5}), &mut ctx()).unwrap(), json!(15));
        assert_eq!(entry.invoke(json!({"by": 1}), &mut ctx()).unwrap(), json!(16));
    }

    #[test]
    fn bound_handler_borrows_a_sibling_instance() {
        let registry = registry_with_handlers();
        let first = registry
            .create_handler(
                Bump::CLASS_ID,
                HandlerInstance::Kwargs(JsonMap::new()),
                std::iter::empty(),
            )
            .unwrap();
        first.invoke(json!({"by": 7}), &mut ctx()).unwrap();

        let siblings = vec![first];
        let second = registry
            .create_handler(Read::CLASS_ID, HandlerInstance::None, siblings.iter())
            .unwrap();
        // shares the same counter
        assert_eq!(second.invoke(json!(null), &mut ctx()).unwrap(), json!(7));
    }

    #[test]
    fn bound_handler_without_any_instance_fails() {
        let registry = registry_with_handlers();
        let result = registry.create_handler(Bump::CLASS_ID, HandlerInstance::None, std::iter::empty());
        assert!(matches!(
            result.unwrap_err().kind(),
            RpcErrorKind::MissingHandlerInstance
        ));
    }

    #[test]
    fn foreign_instances_are_rejected() {
        let registry = registry_with_handlers();
        let result = registry.create_handler(
            Bump::CLASS_ID,
            HandlerInstance::shared(String::from("not a counter")),
            std::iter::empty(),
        );
        assert!(matches!(
            result.unwrap_err().kind(),
            RpcErrorKind::InvalidHandlerInstance
        ));
    }

    #[test]
    fn bulk_resolution_shares_one_instance() {
        let registry = registry_with_handlers();
        let entries = registry
            .create_handlers_for_state("tests.counter", HandlerInstance::Kwargs(JsonMap::new()))
            .unwrap();
        assert_eq!(entries.len(), 2);
        let bump = entries
            .iter()
            .find(|(class, _)| class == Bump::CLASS_ID)
            .unwrap();
        let read = entries
            .iter()
            .find(|(class, _)| class == Read::CLASS_ID)
            .unwrap();
        bump.1.invoke(json!({"by": 3}), &mut ctx()).unwrap();
        assert_eq!(read.1.invoke(json!(null), &mut ctx()).unwrap(), json!(3));
    }

    #[test]
    fn bulk_resolution_needs_an_instance() {
        let registry = registry_with_handlers();
        let result = registry.create_handlers_for_state("tests.counter", HandlerInstance::None);
        assert!(matches!(
            result.unwrap_err().kind(),
            RpcErrorKind::MissingHandlerInstance
        ));
    }

    #[test]
    fn reset_clears_the_registry() {
        let registry = registry_with_handlers();
        registry.reset();
        assert!(registry.registered_classes().is_empty());
        registry
            .set_free_handler::<Double, _>(|m, _| Ok(m.value * 2))
            .unwrap();
    }
}
