#![allow(dead_code)]

use rand::{distr::Alphanumeric, Rng};
use redis_rpc::{
    Dispatcher, DispatcherConfig, HandlerError, HandlerInstance, HandlerRegistry, HandlerState,
    Receiver, ReceiverConfig, RpcMessage,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;
use std::sync::Once;
use std::time::Duration;

static INIT: Once = Once::new();

/// Poll window for a receiver step that is expected to find a task.
pub const POLL: Duration = Duration::from_secs(1);
/// Poll window for a receiver step that is expected to find nothing.
pub const SHORT_POLL: Duration = Duration::from_millis(200);
/// Caller-side wait window.
pub const WAIT: Option<Duration> = Some(Duration::from_secs(2));

pub fn random_string(len: u8) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len as usize)
        .map(char::from)
        .collect()
}

fn redis_url() -> String {
    env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/0".to_string())
}

/// One isolated fabric per test: its own discovery namespace and service
/// name, so parallel tests sharing the broker never see each other.
pub struct TestBed {
    pub dispatcher: Dispatcher,
    pub service: String,
}

pub fn testbed() -> TestBed {
    INIT.call_once(|| {
        let _ = dotenvy::dotenv();
        register_test_handlers();
    });
    let config = DispatcherConfig {
        redis_url: redis_url(),
        namespace: format!("test:{}:", random_string(10)),
        ..DispatcherConfig::default()
    };
    TestBed {
        dispatcher: Dispatcher::with_config(config).expect("Redis pool cannot be built."),
        service: format!("svc{}", random_string(8)),
    }
}

pub fn spawn_receiver(bed: &TestBed) -> Receiver {
    spawn_receiver_named(bed, &bed.service)
}

pub fn spawn_receiver_named(bed: &TestBed, service: &str) -> Receiver {
    Receiver::with_config(
        bed.dispatcher.clone(),
        ReceiverConfig {
            service_name: service.to_string(),
            ..ReceiverConfig::default()
        },
    )
    .expect("receiver cannot be built")
}

pub fn empty_kwargs() -> HandlerInstance {
    HandlerInstance::Kwargs(serde_json::Map::new())
}

// test model

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SumMessage {
    pub first: i64,
    pub second: i64,
}

impl RpcMessage for SumMessage {
    const CLASS_ID: &'static str = "tests.sum";
    type Reply = i64;
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AddMessage {
    pub amount: i64,
}

impl RpcMessage for AddMessage {
    const CLASS_ID: &'static str = "tests.add";
    type Reply = i64;
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SubtractMessage {
    pub amount: i64,
}

impl RpcMessage for SubtractMessage {
    const CLASS_ID: &'static str = "tests.subtract";
    type Reply = i64;
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FailMessage {
    pub reason: String,
}

impl RpcMessage for FailMessage {
    const CLASS_ID: &'static str = "tests.fail";
    type Reply = ();
}

/// Shared state for the `AddMessage`/`SubtractMessage` handlers.
#[derive(Deserialize)]
pub struct Summer {
    #[serde(default)]
    pub sum: i64,
}

impl HandlerState for Summer {
    const NAME: &'static str = "tests.summer";
}

fn register_test_handlers() {
    let registry = HandlerRegistry::global();
    registry
        .set_free_handler::<SumMessage, _>(|m, _ctx| Ok(m.first + m.second))
        .unwrap();
    registry
        .set_bound_handler::<AddMessage, Summer, _>(|state, m, ctx| {
            state.sum += m.amount;
            if let Some(data) = ctx.session_data.as_mut() {
                data.insert("sum".to_string(), Value::from(state.sum));
            }
            Ok(state.sum)
        })
        .unwrap();
    registry
        .set_bound_handler::<SubtractMessage, Summer, _>(|state, m, _ctx| {
            state.sum -= m.amount;
            Ok(state.sum)
        })
        .unwrap();
    registry
        .set_free_handler::<FailMessage, _>(|m, _ctx| Err(HandlerError::new("sabotage", m.reason)))
        .unwrap();
}
