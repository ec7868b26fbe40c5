//! End-to-end tests over the in-process loopback transport.
//!
//! A real service and a real pipeline talk through `LoopbackNet`; these
//! tests exercise the full decode-dispatch-reply cycle both ways.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use markrpc::interceptor::{JsonInterceptor, JsonServiceInterceptor};
use markrpc::net::{LoopbackNet, Net};
use markrpc::proto::{proto_name, Body, ProtoBinder};
use markrpc::protocol::{PackHeader, RES_CODE_SUCCESS, RES_CODE_SYS_ERR};
use markrpc::{BaseService, Pipeline, RpcError, RpcHandler, Service};

#[derive(Serialize, Deserialize, Default, Debug, PartialEq, Clone)]
struct Echo {
    msg: String,
}

#[derive(Serialize, Deserialize, Default, Debug, PartialEq)]
struct Notify {
    event: String,
}

const SERVICE_MARK: &str = "game";
const ECHO_FUNC_NO: u16 = 2;

fn echo_binder() -> Arc<ProtoBinder> {
    let binder = Arc::new(ProtoBinder::new());
    binder.register_proto::<Echo>().unwrap();
    binder.register_proto::<Notify>().unwrap();
    binder
        .bind_proto("game.echo", proto_name::<Echo>(), proto_name::<Echo>())
        .unwrap();
    binder
        .bind_proto("game.notify", proto_name::<Notify>(), "")
        .unwrap();
    binder
}

fn echo_handler() -> RpcHandler {
    Arc::new(|req: &mut Body, resp: &mut Body, _t, _n| {
        let msg = req.downcast_ref::<Echo>().unwrap().msg.clone();
        resp.downcast_mut::<Echo>().unwrap().msg = msg;
        Ok(RES_CODE_SUCCESS)
    })
}

struct Harness {
    pipeline: Arc<Pipeline>,
    service: Arc<BaseService>,
}

/// Echo service plus an attached pipeline, both running.
fn start_echo_pair(configure: impl FnOnce(&BaseService)) -> Harness {
    let (cli_net, srv_net) = LoopbackNet::pair(256, (2, 1), (1, 1));

    let service = Arc::new(BaseService::new(srv_net));
    service.set_name(SERVICE_MARK);
    service.set_interceptor(Arc::new(JsonServiceInterceptor::new(echo_binder())));
    service.add_processor(echo_handler(), ECHO_FUNC_NO, "echo");
    configure(&service);
    service.clone().start();

    let pipeline = Arc::new(Pipeline::new(cli_net, 1, 1, SERVICE_MARK));
    pipeline.set_interceptor(Arc::new(JsonInterceptor));
    pipeline.start();

    Harness { pipeline, service }
}

async fn within<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), fut)
        .await
        .expect("test deadline exceeded")
}

/// Scenario: echo call through the JSON interceptor, after discovery.
#[tokio::test]
async fn test_echo_call_with_json_interceptor() {
    let h = start_echo_pair(|_| {});

    within(h.pipeline.fetch_func_list()).await.unwrap();

    let req = Echo {
        msg: "hi".to_string(),
    };
    let mut out = Echo::default();
    let code = within(h.pipeline.call("echo", &req, Some(&mut out)))
        .await
        .unwrap();

    assert_eq!(code, RES_CODE_SUCCESS);
    assert_eq!(out.msg, "hi");
}

/// Scenario: a function number the service never exported comes back as a
/// system error with the reason text, not a transit error.
#[tokio::test]
async fn test_unknown_func_no_replies_sys_err() {
    let h = start_echo_pair(|_| {});

    let (code, payload) = within(h.pipeline.call_by_func_no(42, &[])).await.unwrap();

    assert_eq!(code, RES_CODE_SYS_ERR);
    let text = String::from_utf8(payload.to_vec()).unwrap();
    assert!(text.contains("no handler for funcNo 42"), "got: {text}");
}

/// Scenario: 100 concurrent calls, each answered by its own response.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_fan_out_correlates_every_call() {
    let h = start_echo_pair(|_| {});

    let mut join = tokio::task::JoinSet::new();
    for i in 0..100u32 {
        let pipeline = h.pipeline.clone();
        join.spawn(async move {
            let req = Echo {
                msg: i.to_string(),
            };
            let payload = serde_json::to_vec(&req).unwrap();
            let (code, resp) = pipeline
                .call_by_func_no(ECHO_FUNC_NO, &[Bytes::from(payload)])
                .await
                .unwrap();

            assert_eq!(code, RES_CODE_SUCCESS);
            let back: Echo = serde_json::from_slice(&resp).unwrap();
            assert_eq!(back.msg, i.to_string());
        });
    }

    within(async {
        while let Some(result) = join.join_next().await {
            result.unwrap();
        }
    })
    .await;

    assert_eq!(h.pipeline.last_serial_no(), 100);
    assert_eq!(h.pipeline.pending_calls(), 0);
}

/// Scenario: a slow handler trips the per-call timeout; the pipeline stays
/// usable and the stale late reply is dropped.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_timeout_then_pipeline_still_usable() {
    let h = start_echo_pair(|service| {
        service.add_processor(
            Arc::new(|_req: &mut Body, resp: &mut Body, _t, _n| {
                std::thread::sleep(Duration::from_millis(1500));
                *resp = Body::Empty;
                Ok(RES_CODE_SUCCESS)
            }),
            3,
            "slow",
        );
    });

    h.pipeline.set_timeout(1);

    let started = Instant::now();
    let result = within(h.pipeline.call_by_func_no(3, &[])).await;
    assert!(matches!(result, Err(RpcError::CallTimeout(1))));
    assert!(started.elapsed() >= Duration::from_millis(900));
    assert!(started.elapsed() < Duration::from_millis(1400));
    assert_eq!(h.pipeline.pending_calls(), 0);

    // The slow handler is still blocking the service loop; once it drains,
    // its stale reply must not confuse the next call.
    let payload = serde_json::to_vec(&Echo {
        msg: "after".to_string(),
    })
    .unwrap();
    let (code, resp) = within(h.pipeline.call_by_func_no(ECHO_FUNC_NO, &[Bytes::from(payload)]))
        .await
        .unwrap();

    assert_eq!(code, RES_CODE_SUCCESS);
    let back: Echo = serde_json::from_slice(&resp).unwrap();
    assert_eq!(back.msg, "after");
    assert_eq!(h.pipeline.pending_calls(), 0);
}

/// Scenario: name-based calls fail before discovery and work after it.
#[tokio::test]
async fn test_discovery_gates_name_based_calls() {
    let h = start_echo_pair(|_| {});

    let req = Echo {
        msg: "x".to_string(),
    };
    let before = h.pipeline.call("echo", &req, None).await;
    assert!(matches!(before, Err(RpcError::NotSupportFunc)));

    within(h.pipeline.fetch_func_list()).await.unwrap();
    assert!(h.pipeline.func_list().contains(&"echo".to_string()));

    let mut out = Echo::default();
    let code = within(h.pipeline.call("echo", &req, Some(&mut out)))
        .await
        .unwrap();
    assert_eq!(code, RES_CODE_SUCCESS);
    assert_eq!(out.msg, "x");
}

/// Scenario: stop with calls in flight; everything returns promptly and
/// the pending table is empty.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_mid_flight_cancels_all() {
    // No service on the other end: calls stay pending until stopped.
    let (cli_net, _srv_net) = LoopbackNet::pair(256, (2, 1), (1, 1));
    let pipeline = Arc::new(Pipeline::new(cli_net, 1, 1, SERVICE_MARK));
    pipeline.start();

    let mut join = tokio::task::JoinSet::new();
    for _ in 0..10 {
        let pipeline = pipeline.clone();
        join.spawn(async move { pipeline.call_by_func_no(ECHO_FUNC_NO, &[]).await });
    }

    within(async {
        while pipeline.pending_calls() < 10 {
            tokio::task::yield_now().await;
        }
    })
    .await;

    let stopped = Instant::now();
    pipeline.stop();

    within(async {
        while let Some(result) = join.join_next().await {
            let call = result.unwrap();
            assert!(matches!(call, Err(RpcError::ForceCallStop)));
        }
    })
    .await;

    assert!(stopped.elapsed() < Duration::from_millis(50));
    assert_eq!(pipeline.pending_calls(), 0);
}

/// Scenario: fire-and-forget reaches the handler without blocking the
/// caller or enqueuing a pending call.
#[tokio::test]
async fn test_fire_and_forget_notify() {
    let hits = Arc::new(AtomicUsize::new(0));
    let handler_hits = hits.clone();

    let h = start_echo_pair(move |service| {
        service.add_processor(
            Arc::new(move |req: &mut Body, _resp: &mut Body, _t, _n| {
                assert_eq!(req.downcast_ref::<Notify>().unwrap().event, "boom");
                handler_hits.fetch_add(1, Ordering::SeqCst);
                Ok(RES_CODE_SUCCESS)
            }),
            4,
            "notify",
        );
    });

    within(h.pipeline.fetch_func_list()).await.unwrap();

    let req = Notify {
        event: "boom".to_string(),
    };
    within(h.pipeline.call_no_return("notify", &req))
        .await
        .unwrap();
    assert_eq!(h.pipeline.pending_calls(), 0);

    within(async {
        while hits.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    // At-most-once: exactly one handler invocation for one packet.
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

/// Wrong-mark, wrong-funcNo, and unknown-serial responses are all dropped;
/// the real response still lands.
#[tokio::test]
async fn test_bogus_responses_dropped() {
    let (cli_net, srv_net) = LoopbackNet::pair(256, (2, 1), (1, 1));
    let pipeline = Arc::new(Pipeline::new(cli_net, 1, 1, SERVICE_MARK));
    pipeline.start();

    let call = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.call_by_func_no(ECHO_FUNC_NO, &[]).await })
    };

    // Play the server by hand.
    let pack = within(srv_net.read_rpc_pack()).await.unwrap();
    let req_header =
        PackHeader::decode(&Bytes::from_static(b"game"), &pack.payload).unwrap();

    // Wrong mark.
    let bad_mark = PackHeader::new(
        Bytes::from_static(b"chat"),
        req_header.serial_no,
        req_header.func_no,
    );
    srv_net
        .write_rpc_pack(2, 1, &[Bytes::from(bad_mark.encode())])
        .await
        .unwrap();

    // Wrong funcNo.
    let bad_func = PackHeader::new(
        Bytes::from_static(b"game"),
        req_header.serial_no,
        req_header.func_no + 1,
    );
    srv_net
        .write_rpc_pack(2, 1, &[Bytes::from(bad_func.encode())])
        .await
        .unwrap();

    // Unknown serial.
    let bad_serial = PackHeader::new(
        Bytes::from_static(b"game"),
        req_header.serial_no.wrapping_add(1),
        req_header.func_no,
    );
    srv_net
        .write_rpc_pack(2, 1, &[Bytes::from(bad_serial.encode())])
        .await
        .unwrap();

    // The real one.
    let good = req_header.clone();
    srv_net
        .write_rpc_pack(
            2,
            1,
            &[Bytes::from(good.encode()), Bytes::from_static(b"real")],
        )
        .await
        .unwrap();

    let (code, payload) = within(call).await.unwrap().unwrap();
    assert_eq!(code, RES_CODE_SUCCESS);
    assert_eq!(&payload[..], b"real");
}

/// Async variants deliver through their callbacks.
#[tokio::test]
async fn test_async_call_and_discovery() {
    let h = start_echo_pair(|_| {});

    let (tx, rx) = tokio::sync::oneshot::channel();
    h.pipeline.async_fetch_func_list(move |err| {
        tx.send(err).unwrap();
    });
    assert!(within(rx).await.unwrap().is_none());

    let (tx, rx) = tokio::sync::oneshot::channel();
    h.pipeline.async_call(
        move |code, resp, err| {
            let _ = tx.send((code, resp, err));
        },
        "echo",
        Box::new(Echo {
            msg: "async".to_string(),
        }),
        Box::new(Echo::default()),
    );

    let (code, resp, err) = within(rx).await.unwrap();
    assert!(err.is_none());
    assert_eq!(code, RES_CODE_SUCCESS);
    let out = resp.as_any().downcast_ref::<Echo>().unwrap();
    assert_eq!(out.msg, "async");
}

/// The registries wire both roles together and tear them down.
#[tokio::test]
async fn test_registries_end_to_end() {
    let (cli_net, srv_net) = LoopbackNet::pair(256, (2, 1), (1, 1));

    let server = markrpc::Server::new();
    let service = Arc::new(BaseService::new(srv_net));
    service.set_name(SERVICE_MARK);
    service.set_interceptor(Arc::new(JsonServiceInterceptor::new(echo_binder())));
    service.add_processor(echo_handler(), ECHO_FUNC_NO, "echo");
    server.add_service(service);

    let client = markrpc::Client::new();
    let pipeline = client.add_pipeline(cli_net, 1, 1, SERVICE_MARK, 5);
    pipeline.set_interceptor(Arc::new(JsonInterceptor));
    within(pipeline.fetch_func_list()).await.unwrap();

    let mut out = Echo::default();
    let code = within(client.call(
        1,
        1,
        "echo",
        &Echo {
            msg: "routed".to_string(),
        },
        Some(&mut out),
    ))
    .await
    .unwrap();
    assert_eq!(code, RES_CODE_SUCCESS);
    assert_eq!(out.msg, "routed");

    client.remove_all_pipelines();
    server.remove_all_services();
    assert!(client.pipeline(1, 1).is_none());
    assert!(server.service(SERVICE_MARK).is_none());
}

/// Discovery exposes exactly the exported functions, reserved entry
/// included, and replaces the local map wholesale.
#[tokio::test]
async fn test_discovery_map_contents() {
    let h = start_echo_pair(|service| {
        service.add_processor(echo_handler(), 9, "echo2");
    });

    within(h.pipeline.fetch_func_list()).await.unwrap();

    let mut names = h.pipeline.func_list();
    names.sort();
    assert_eq!(names, vec!["FetchFuncList", "echo", "echo2"]);
    assert_eq!(h.service.func_list().len(), 3);
}
