mod common;

use common::*;
use redis_rpc::{HandlerInstance, MultiRequest, Request, RpcErrorKind};
use serde_json::json;
use std::thread;
use std::time::Duration;

#[test_log::test]
fn fan_out_gathers_every_reply() {
    let bed = testbed();
    let mut first = spawn_receiver(&bed);
    let mut second = spawn_receiver(&bed);
    first
        .register::<SumMessage>(HandlerInstance::None)
        .unwrap();
    second
        .register::<SumMessage>(HandlerInstance::None)
        .unwrap();

    let mut multi = MultiRequest::new(bed.dispatcher.clone(), SumMessage { first: 1, second: 3 });
    multi.send_async().unwrap();
    first.process_one(POLL).unwrap();
    second.process_one(POLL).unwrap();

    assert_eq!(multi.wait(WAIT).unwrap(), vec![4, 4]);
}

#[test_log::test]
fn tag_filtered_fan_out_leaves_others_untouched() {
    let bed = testbed();
    let mut receivers: Vec<_> = (0..4).map(|_| spawn_receiver(&bed)).collect();
    for receiver in receivers.iter_mut() {
        receiver.register::<AddMessage>(empty_kwargs()).unwrap();
    }
    for receiver in receivers.iter_mut().take(2) {
        let mut tags = serde_json::Map::new();
        tags.insert("foo".to_string(), json!("bar"));
        receiver.set_tags(tags).unwrap();
    }

    let mut multi = MultiRequest::new(bed.dispatcher.clone(), AddMessage { amount: 3 })
        .filter(|status| status.tags.get("foo") == Some(&json!("bar")));
    multi.send_async().unwrap();
    for receiver in receivers.iter_mut() {
        receiver.process_one(SHORT_POLL).unwrap();
    }
    assert_eq!(multi.wait(WAIT).unwrap(), vec![3, 3]);

    // the untagged summers never saw a task
    for receiver in receivers.iter_mut().skip(2) {
        let mut probe = Request::new(bed.dispatcher.clone(), AddMessage { amount: 0 })
            .targets([receiver.uid().to_string()]);
        probe.send_async().unwrap();
        receiver.process_one(POLL).unwrap();
        assert_eq!(probe.wait(WAIT).unwrap(), 0);
    }
}

#[test_log::test]
fn missing_replies_surface_as_partial_timeout() {
    let bed = testbed();
    let mut served = spawn_receiver(&bed);
    let silent = spawn_receiver(&bed);
    served
        .register::<SumMessage>(HandlerInstance::None)
        .unwrap();

    let mut multi = MultiRequest::new(bed.dispatcher.clone(), SumMessage { first: 1, second: 1 })
        .targets([served.uid().to_string(), silent.uid().to_string()]);
    multi.send_async().unwrap();
    served.process_one(POLL).unwrap();

    let error = multi.wait(Some(Duration::from_secs(1))).unwrap_err();
    match error.kind() {
        RpcErrorKind::PartialTimeout { got, expected } => {
            assert_eq!(*got, 1);
            assert_eq!(*expected, 2);
        }
        other => panic!("expected a partial timeout, got {other:?}"),
    }
}

#[test_log::test]
fn repeated_fan_out_is_stable() {
    let bed = testbed();
    let mut first = spawn_receiver(&bed);
    let mut second = spawn_receiver(&bed);
    first
        .register::<SumMessage>(HandlerInstance::None)
        .unwrap();
    second
        .register::<SumMessage>(HandlerInstance::None)
        .unwrap();

    let mut runs = Vec::new();
    for _ in 0..2 {
        let mut multi =
            MultiRequest::new(bed.dispatcher.clone(), SumMessage { first: 2, second: 2 });
        multi.send_async().unwrap();
        first.process_one(POLL).unwrap();
        second.process_one(POLL).unwrap();
        assert_eq!(multi.wait(WAIT).unwrap(), vec![4, 4]);
        runs.push(multi.target_uids());
    }
    assert_eq!(runs[0], runs[1]);
}

/// Two receivers under different service names share no queue, so the
/// request has to provision one and ask both targets to join it.
#[test_log::test]
fn a_queue_is_provisioned_for_an_unserved_target_set() {
    let bed = testbed();
    let other_service = format!("svc{}", random_string(8));
    let mut first = spawn_receiver(&bed);
    let mut second = spawn_receiver_named(&bed, &other_service);
    first
        .register::<SumMessage>(HandlerInstance::None)
        .unwrap();
    second
        .register::<SumMessage>(HandlerInstance::None)
        .unwrap();
    let handles = [first.handle(), second.handle()];

    let workers = [
        thread::spawn(move || first.process().unwrap()),
        thread::spawn(move || second.process().unwrap()),
    ];

    let sum = Request::new(bed.dispatcher.clone(), SumMessage { first: 1, second: 3 })
        .send_and_wait(None)
        .unwrap();
    assert_eq!(sum, 4);

    for handle in &handles {
        handle.stop();
    }
    for worker in workers {
        worker.join().unwrap();
    }
}
