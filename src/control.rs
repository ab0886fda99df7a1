//! Messages every receiver answers about itself: runtime registration,
//! queue subscriptions, tags, introspection and shutdown. They travel like
//! any other message and are handled in-band by the receiver's own loop.

use crate::message::RpcMessage;
use crate::payload::JsonMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Instance parameter carried by registration messages. A live instance
/// cannot cross the wire; remote callers send constructor keyword maps.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub enum InstanceParam {
    #[default]
    None,
    Kwargs(JsonMap),
}

impl From<InstanceParam> for crate::handler::HandlerInstance {
    fn from(param: InstanceParam) -> Self {
        match param {
            InstanceParam::None => crate::handler::HandlerInstance::None,
            InstanceParam::Kwargs(kwargs) => crate::handler::HandlerInstance::Kwargs(kwargs),
        }
    }
}

/// Start handling a message class. The receiver begins listening on the
/// class's broadcast and direct queues. Replies with the new set of
/// registered class ids.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RegisterMessage {
    pub class_id: String,
    #[serde(default)]
    pub instance: InstanceParam,
}

impl RpcMessage for RegisterMessage {
    const CLASS_ID: &'static str = "receiver.register_message";
    type Reply = BTreeSet<String>;
}

/// Stop handling a message class and leave both of its queues. Replies with
/// the new set of registered class ids.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UnregisterMessage {
    pub class_id: String,
}

impl RpcMessage for UnregisterMessage {
    const CLASS_ID: &'static str = "receiver.unregister_message";
    type Reply = BTreeSet<String>;
}

/// Ask for the currently registered class ids.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GetRegisteredMessages;

impl RpcMessage for GetRegisteredMessages {
    const CLASS_ID: &'static str = "receiver.get_registered_messages";
    type Reply = BTreeSet<String>;
}

/// Listen on an arbitrary named queue. Any registered class arriving there
/// is dispatched by its envelope. Replies with the new broadcast-queue set.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AddQueue {
    pub name: String,
}

impl RpcMessage for AddQueue {
    const CLASS_ID: &'static str = "receiver.add_queue";
    type Reply = BTreeSet<String>;
}

/// Stop listening on a queue added with [`AddQueue`](AddQueue). Replies with
/// the new broadcast-queue set.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RemoveQueue {
    pub name: String,
}

impl RpcMessage for RemoveQueue {
    const CLASS_ID: &'static str = "receiver.remove_queue";
    type Reply = BTreeSet<String>;
}

/// Replace the receiver's routing tags wholesale. Replies with the new tags.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SetReceiverTags {
    pub tags: JsonMap,
}

impl RpcMessage for SetReceiverTags {
    const CLASS_ID: &'static str = "receiver.set_tags";
    type Reply = JsonMap;
}

/// Register every message class whose handler is bound to the named state
/// type, all sharing one instance. Replies with the new set of registered
/// class ids.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RegisterAll {
    pub state_name: String,
    #[serde(default)]
    pub instance: InstanceParam,
}

impl RpcMessage for RegisterAll {
    const CLASS_ID: &'static str = "receiver.register_all";
    type Reply = BTreeSet<String>;
}

/// Flip the receiver's stopping flag; its loop exits after the current
/// iteration. Replies with an acknowledgement.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ShutDownReceiver;

impl RpcMessage for ShutDownReceiver {
    const CLASS_ID: &'static str = "receiver.shut_down";
    type Reply = bool;
}

/// Class ids every receiver serves from construction on.
pub const CONTROL_CLASS_IDS: [&str; 8] = [
    RegisterMessage::CLASS_ID,
    UnregisterMessage::CLASS_ID,
    GetRegisteredMessages::CLASS_ID,
    AddQueue::CLASS_ID,
    RemoveQueue::CLASS_ID,
    SetReceiverTags::CLASS_ID,
    RegisterAll::CLASS_ID,
    ShutDownReceiver::CLASS_ID,
];

pub(crate) fn is_control_class(class_id: &str) -> bool {
    CONTROL_CLASS_IDS.contains(&class_id)
}
