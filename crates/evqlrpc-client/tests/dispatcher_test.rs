use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use evqlrpc_client::{
    ChannelHandler, Dispatcher, DispatcherConfig, PoolConfig, ResultAction, StaticDirectory, Task,
    TaskEvent, TaskHandler,
};
use evqlrpc_common::auth::{AuthConfig, AuthData};
use evqlrpc_common::transport::{Frame, FrameCodec};
use evqlrpc_common::{frame_flags, opcode, EvqlError, ReadyFrame, Result};
use evqlrpc_server::{NativeServer, Operation, ServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Records every callback, keyed by the task's index.
#[derive(Default)]
struct Recorder {
    started: Vec<(usize, String)>,
    results: Vec<(usize, Frame)>,
    failovers: Vec<(usize, String, String)>,
    done: Vec<(usize, Result<()>)>,
    stop_after_first: bool,
    reject: Option<&'static [u8]>,
}

impl Recorder {
    fn outcome(&self, task: usize) -> &Result<()> {
        let matching: Vec<&Result<()>> = self
            .done
            .iter()
            .filter(|(t, _)| *t == task)
            .map(|(_, outcome)| outcome)
            .collect();
        assert_eq!(matching.len(), 1, "task {} completed {} times", task, matching.len());
        matching[0]
    }

    fn payloads(&self, task: usize) -> Vec<Bytes> {
        self.results
            .iter()
            .filter(|(t, _)| *t == task)
            .map(|(_, frame)| frame.payload.clone())
            .collect()
    }
}

impl TaskHandler for Recorder {
    type Context = usize;

    fn on_task_started(&mut self, ctx: &mut usize, host: &str) {
        self.started.push((*ctx, host.to_string()));
    }

    fn on_result(&mut self, ctx: &mut usize, frame: &Frame) -> ResultAction {
        self.results.push((*ctx, frame.clone()));
        if self.reject == Some(frame.payload.as_ref()) {
            ResultAction::Fail(EvqlError::Protocol("corrupt result".to_string()))
        } else if self.stop_after_first {
            ResultAction::Stop
        } else {
            ResultAction::Continue
        }
    }

    fn on_failover(&mut self, ctx: &mut usize, host: &str, error: &EvqlError) {
        self.failovers.push((*ctx, host.to_string(), error.to_string()));
    }

    fn on_task_done(&mut self, ctx: usize, outcome: Result<()>) {
        self.done.push((ctx, outcome));
    }
}

async fn spawn_server<F, Fut>(config: ServerConfig, handler: F) -> SocketAddr
where
    F: Fn(Operation) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Vec<Frame>>> + Send + 'static,
{
    let server = NativeServer::bind("127.0.0.1:0", config).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.run_with_handler(handler).await;
    });
    addr
}

fn reply(payload: &'static [u8]) -> Result<Vec<Frame>> {
    Ok(vec![Frame::new(opcode::QUERY_RESULT, 0, Bytes::from_static(payload))])
}

async fn spawn_ok_server() -> SocketAddr {
    spawn_ok_server_with(ServerConfig::default()).await
}

async fn spawn_ok_server_with(config: ServerConfig) -> SocketAddr {
    spawn_server(config, |_op| async { reply(b"ok") }).await
}

/// A peer that completes the handshake, then answers the request with `answer`
/// written verbatim.
async fn spawn_raw_peer(answer: Bytes) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = [0u8; 256];
            let _ = stream.read(&mut buf).await;
            let ready = FrameCodec::new()
                .encode_frame(&Frame::new(opcode::READY, 0, ReadyFrame::new(1_000_000).encode()))
                .unwrap();
            let _ = stream.write_all(&ready).await;
            let _ = stream.read(&mut buf).await;
            let _ = stream.write_all(&answer).await;
            // hold the socket open until the client hangs up
            let _ = stream.read(&mut buf).await;
        }
    });
    addr
}

/// An address nothing listens on.
fn refused_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

fn task(hosts: &[&str], index: usize) -> Task<usize> {
    Task::new(
        opcode::QUERY,
        Bytes::from(format!("task-{}", index)),
        hosts.iter().copied(),
        index,
    )
}

#[tokio::test]
async fn test_three_hosts_end_to_end() {
    init_tracing();
    let mut directory = StaticDirectory::new();
    for host in ["h1", "h2", "h3"] {
        directory.add_host(host, spawn_ok_server().await);
    }

    let config = DispatcherConfig::new(3, 1);
    let mut dispatcher = Dispatcher::new(config, directory, Recorder::default()).unwrap();
    for (i, host) in ["h1", "h2", "h3"].iter().enumerate() {
        dispatcher.enqueue(task(&[*host], i)).unwrap();
    }

    dispatcher.execute().await.unwrap();
    assert_eq!(dispatcher.stats().num_tasks_complete, 3);

    let recorder = dispatcher.handler();
    for i in 0..3 {
        assert!(recorder.outcome(i).is_ok());
        assert_eq!(recorder.payloads(i), vec![Bytes::from_static(b"ok")]);
    }
    assert!(recorder.failovers.is_empty());

    let snapshot = dispatcher.metrics().snapshot();
    assert_eq!(snapshot.tasks_succeeded, 3);
    assert_eq!(snapshot.connections_opened, 3);
    assert_eq!(snapshot.tasks_running, 0);
}

#[tokio::test]
async fn test_failover_follows_host_order() {
    init_tracing();
    let directory = StaticDirectory::new()
        .with_host("a", refused_addr())
        .with_host("b", refused_addr())
        .with_host("c", spawn_ok_server().await);

    let mut dispatcher =
        Dispatcher::new(DispatcherConfig::default(), directory, Recorder::default()).unwrap();
    dispatcher.enqueue(task(&["a", "b", "c"], 0)).unwrap();
    dispatcher.execute().await.unwrap();

    let recorder = dispatcher.handler();
    assert!(recorder.outcome(0).is_ok());
    let failed: Vec<&str> = recorder.failovers.iter().map(|(_, h, _)| h.as_str()).collect();
    assert_eq!(failed, vec!["a", "b"]);
    assert_eq!(recorder.payloads(0), vec![Bytes::from_static(b"ok")]);
    assert_eq!(dispatcher.metrics().snapshot().failovers, 2);
}

#[tokio::test]
async fn test_exhaustion_reports_once() {
    init_tracing();
    let directory = StaticDirectory::new()
        .with_host("a", refused_addr())
        .with_host("b", refused_addr());

    let mut dispatcher =
        Dispatcher::new(DispatcherConfig::default(), directory, Recorder::default()).unwrap();
    dispatcher.enqueue(task(&["a", "b"], 0)).unwrap();
    dispatcher.execute().await.unwrap();

    let recorder = dispatcher.handler();
    assert!(matches!(
        recorder.outcome(0),
        Err(EvqlError::HostsExhausted(_))
    ));
    let failed: Vec<&str> = recorder.failovers.iter().map(|(_, h, _)| h.as_str()).collect();
    assert_eq!(failed, vec!["a", "b"]);
    assert_eq!(dispatcher.stats().num_tasks_complete, 1);
}

#[tokio::test]
async fn test_fifo_per_host_without_head_of_line_blocking() {
    init_tracing();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_by_server = seen.clone();
    let slow = spawn_server(ServerConfig::default(), move |op: Operation| {
        let seen = seen_by_server.clone();
        async move {
            seen.lock().unwrap().push(op.payload.clone());
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, EvqlError>(vec![Frame::new(opcode::QUERY_RESULT, 0, op.payload)])
        }
    })
    .await;
    let other = spawn_ok_server().await;
    let directory = StaticDirectory::new()
        .with_host("h", slow)
        .with_host("g", other);

    let mut dispatcher =
        Dispatcher::new(DispatcherConfig::new(4, 1), directory, Recorder::default()).unwrap();
    dispatcher.enqueue(task(&["h"], 0)).unwrap();
    dispatcher.enqueue(task(&["h"], 1)).unwrap();
    dispatcher.enqueue(task(&["g"], 2)).unwrap();
    dispatcher.execute().await.unwrap();

    let recorder = dispatcher.handler();
    let order: Vec<usize> = recorder.started.iter().map(|(t, _)| *t).collect();
    assert_eq!(order, vec![0, 2, 1]);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![Bytes::from_static(b"task-0"), Bytes::from_static(b"task-1")]
    );

    // task 1 reused the connection task 0 finished on
    let snapshot = dispatcher.metrics().snapshot();
    assert_eq!(snapshot.hosts["h"].peak_open_connections, 1);
    assert_eq!(snapshot.connections_opened, 2);
}

#[tokio::test]
async fn test_concurrency_stays_bounded() {
    init_tracing();
    let handler = |op: Operation| async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        Ok::<_, EvqlError>(vec![Frame::new(opcode::QUERY_RESULT, 0, op.payload)])
    };
    let directory = StaticDirectory::new()
        .with_host("a", spawn_server(ServerConfig::default(), handler).await)
        .with_host("b", spawn_server(ServerConfig::default(), handler).await);

    let mut dispatcher =
        Dispatcher::new(DispatcherConfig::new(3, 2), directory, Recorder::default()).unwrap();
    for i in 0..12 {
        let hosts: &[&str] = if i % 2 == 0 { &["a", "b"] } else { &["b", "a"] };
        dispatcher.enqueue(task(hosts, i)).unwrap();
    }
    dispatcher.execute().await.unwrap();

    let snapshot = dispatcher.metrics().snapshot();
    assert_eq!(snapshot.tasks_succeeded, 12);
    assert!(snapshot.peak_tasks_running <= 3);
    assert!(snapshot.max_host_peak() <= 2);
    assert_eq!(dispatcher.stats().num_tasks_running, 0);
}

#[tokio::test]
async fn test_rejected_handshake_fails_over() {
    init_tracing();
    let secured = spawn_server(
        ServerConfig::default().with_auth(AuthConfig::with_token("secret")),
        |_op| async { reply(b"secured") },
    )
    .await;
    let directory = StaticDirectory::new()
        .with_host("secured", secured)
        .with_host("open", spawn_ok_server().await);

    let mut dispatcher =
        Dispatcher::new(DispatcherConfig::default(), directory, Recorder::default()).unwrap();
    dispatcher.enqueue(task(&["secured", "open"], 0)).unwrap();
    dispatcher.execute().await.unwrap();

    let recorder = dispatcher.handler();
    assert!(recorder.outcome(0).is_ok());
    assert_eq!(recorder.failovers.len(), 1);
    assert!(recorder.failovers[0].2.contains("handshake rejected"));
    assert_eq!(recorder.payloads(0), vec![Bytes::from_static(b"ok")]);
}

#[tokio::test]
async fn test_valid_token_is_accepted() {
    init_tracing();
    let secured = spawn_server(
        ServerConfig::default().with_auth(AuthConfig::with_token("secret")),
        |_op| async { reply(b"secured") },
    )
    .await;
    let directory = StaticDirectory::new().with_host("secured", secured);
    let config = DispatcherConfig::default().with_auth_data(AuthData::with_token("secret"));

    let mut dispatcher = Dispatcher::new(config, directory, Recorder::default()).unwrap();
    dispatcher.enqueue(task(&["secured"], 0)).unwrap();
    dispatcher.execute().await.unwrap();

    assert_eq!(
        dispatcher.handler().payloads(0),
        vec![Bytes::from_static(b"secured")]
    );
}

#[tokio::test]
async fn test_heartbeats_keep_slow_operation_alive() {
    init_tracing();
    let slow = spawn_server(
        ServerConfig::default().with_heartbeat_interval_ms(50),
        |_op| async {
            tokio::time::sleep(Duration::from_millis(800)).await;
            reply(b"late")
        },
    )
    .await;
    let directory = StaticDirectory::new().with_host("slow", slow);
    let config = DispatcherConfig::default().with_idle_timeout_ms(300);

    let mut dispatcher = Dispatcher::new(config, directory, Recorder::default()).unwrap();
    dispatcher.enqueue(task(&["slow"], 0)).unwrap();
    dispatcher.execute().await.unwrap();

    assert!(dispatcher.handler().outcome(0).is_ok());
    assert_eq!(dispatcher.handler().payloads(0), vec![Bytes::from_static(b"late")]);
    assert_eq!(dispatcher.metrics().snapshot().timeouts, 0);
}

#[tokio::test]
async fn test_silent_host_times_out() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let silent = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    let directory = StaticDirectory::new()
        .with_host("silent", silent)
        .with_host(
            "ok",
            spawn_ok_server_with(ServerConfig::default().with_heartbeat_interval_ms(50)).await,
        );
    let config = DispatcherConfig::default().with_idle_timeout_ms(200);

    let mut dispatcher = Dispatcher::new(config, directory, Recorder::default()).unwrap();
    dispatcher.enqueue(task(&["silent", "ok"], 0)).unwrap();
    dispatcher.execute().await.unwrap();

    let recorder = dispatcher.handler();
    assert!(recorder.outcome(0).is_ok());
    assert!(recorder.failovers[0].2.contains("timed out"));
    assert_eq!(dispatcher.metrics().snapshot().timeouts, 1);
}

#[tokio::test]
async fn test_unexpected_opcode_fails_over() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let broken = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = [0u8; 64];
            let _ = stream.read(&mut buf).await;
            let reply = FrameCodec::new()
                .encode_frame(&Frame::new(opcode::QUERY_RESULT, 0, Bytes::from_static(b"?")))
                .unwrap();
            let _ = stream.write_all(&reply).await;
        }
    });
    let directory = StaticDirectory::new()
        .with_host("broken", broken)
        .with_host("ok", spawn_ok_server().await);

    let mut dispatcher =
        Dispatcher::new(DispatcherConfig::default(), directory, Recorder::default()).unwrap();
    dispatcher.enqueue(task(&["broken", "ok"], 0)).unwrap();
    dispatcher.execute().await.unwrap();

    let recorder = dispatcher.handler();
    assert!(recorder.outcome(0).is_ok());
    assert!(recorder.failovers[0].2.contains("Unexpected opcode"));
}

#[tokio::test]
async fn test_connection_lost_mid_exchange_fails_over() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let flaky = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = [0u8; 256];
            let _ = stream.read(&mut buf).await;
            let ready = FrameCodec::new()
                .encode_frame(&Frame::new(opcode::READY, 0, ReadyFrame::new(1_000_000).encode()))
                .unwrap();
            let _ = stream.write_all(&ready).await;
            // read the request, then hang up without answering
            let _ = stream.read(&mut buf).await;
        }
    });
    let directory = StaticDirectory::new()
        .with_host("flaky", flaky)
        .with_host("ok", spawn_ok_server().await);

    let mut dispatcher =
        Dispatcher::new(DispatcherConfig::default(), directory, Recorder::default()).unwrap();
    dispatcher.enqueue(task(&["flaky", "ok"], 0)).unwrap();
    dispatcher.execute().await.unwrap();

    let recorder = dispatcher.handler();
    assert!(recorder.outcome(0).is_ok());
    assert_eq!(recorder.failovers.len(), 1);
    assert_eq!(recorder.failovers[0].1, "flaky");
}

#[tokio::test]
async fn test_pool_reuses_connections_across_batches() {
    init_tracing();
    let directory = StaticDirectory::new().with_host("a", spawn_ok_server().await);
    let config = DispatcherConfig::default().with_pool(PoolConfig::default());

    let mut dispatcher = Dispatcher::new(config, directory, Recorder::default()).unwrap();
    dispatcher.enqueue(task(&["a"], 0)).unwrap();
    dispatcher.execute().await.unwrap();
    assert_eq!(dispatcher.stats().idle_connections, 1);
    assert_eq!(dispatcher.stats().active_connections, 0);

    dispatcher.enqueue(task(&["a"], 1)).unwrap();
    dispatcher.execute().await.unwrap();

    let snapshot = dispatcher.metrics().snapshot();
    assert_eq!(snapshot.connections_opened, 1);
    assert_eq!(snapshot.connections_reused, 1);
    assert!(dispatcher.handler().outcome(1).is_ok());

    dispatcher.shutdown();
    assert_eq!(dispatcher.stats().idle_connections, 0);
}

#[tokio::test]
async fn test_remote_errors_follow_retryable_bit() {
    init_tracing();
    let failing = spawn_server(ServerConfig::default(), |op: Operation| async move {
        let retryable = op.payload.as_ref() == b"task-1";
        Err::<Vec<Frame>, _>(EvqlError::Remote {
            message: "table not found".to_string(),
            retryable,
        })
    })
    .await;
    let directory = StaticDirectory::new()
        .with_host("failing", failing)
        .with_host("ok", spawn_ok_server().await);

    let mut dispatcher =
        Dispatcher::new(DispatcherConfig::default(), directory, Recorder::default()).unwrap();
    dispatcher.enqueue(task(&["failing", "ok"], 0)).unwrap();
    dispatcher.enqueue(task(&["failing", "ok"], 1)).unwrap();
    dispatcher.execute().await.unwrap();

    let recorder = dispatcher.handler();
    match recorder.outcome(0) {
        Err(EvqlError::Remote { message, retryable }) => {
            assert_eq!(message, "table not found");
            assert!(!retryable);
        }
        other => panic!("expected permanent remote error, got {:?}", other),
    }
    assert!(recorder.started.iter().all(|(t, h)| *t != 0 || h == "failing"));

    assert!(recorder.outcome(1).is_ok());
    assert_eq!(recorder.payloads(1), vec![Bytes::from_static(b"ok")]);
}

#[tokio::test]
async fn test_streamed_frames_arrive_in_order() {
    init_tracing();
    let streaming = spawn_server(ServerConfig::default(), |_op| async {
        Ok::<_, EvqlError>(
            ["a", "b", "c"]
                .iter()
                .map(|part| Frame::new(opcode::QUERY_PARTIALAGGR_RESULT, 0, Bytes::from(*part)))
                .collect::<Vec<_>>(),
        )
    })
    .await;
    let directory = StaticDirectory::new().with_host("s", streaming);

    let mut dispatcher =
        Dispatcher::new(DispatcherConfig::default(), directory, Recorder::default()).unwrap();
    dispatcher.enqueue(task(&["s"], 0)).unwrap();
    dispatcher.execute().await.unwrap();

    let recorder = dispatcher.handler();
    assert_eq!(
        recorder.payloads(0),
        vec![
            Bytes::from_static(b"a"),
            Bytes::from_static(b"b"),
            Bytes::from_static(b"c")
        ]
    );
    let flags: Vec<u16> = recorder.results.iter().map(|(_, f)| f.flags).collect();
    assert_eq!(
        flags,
        vec![
            frame_flags::MORE_DATA,
            frame_flags::MORE_DATA,
            frame_flags::END_OF_REQUEST
        ]
    );
}

#[tokio::test]
async fn test_stop_completes_task_and_closes_connection() {
    init_tracing();
    let streaming = spawn_server(ServerConfig::default(), |_op| async {
        Ok::<_, EvqlError>(vec![
            Frame::new(opcode::QUERY_RESULT, 0, Bytes::from_static(b"first")),
            Frame::new(opcode::QUERY_RESULT, 0, Bytes::from_static(b"second")),
        ])
    })
    .await;
    let directory = StaticDirectory::new().with_host("s", streaming);
    let config = DispatcherConfig::default().with_pool(PoolConfig::default());
    let recorder = Recorder {
        stop_after_first: true,
        ..Recorder::default()
    };

    let mut dispatcher = Dispatcher::new(config, directory, recorder).unwrap();
    dispatcher.enqueue(task(&["s"], 0)).unwrap();
    dispatcher.execute().await.unwrap();

    assert!(dispatcher.handler().outcome(0).is_ok());
    assert_eq!(dispatcher.handler().payloads(0), vec![Bytes::from_static(b"first")]);
    assert_eq!(dispatcher.stats().idle_connections, 0);
    assert_eq!(dispatcher.metrics().snapshot().connections_closed, 1);
}

#[tokio::test]
async fn test_intolerant_dispatcher_returns_error() {
    init_tracing();
    let directory = StaticDirectory::new()
        .with_host("down", refused_addr())
        .with_host("ok", spawn_ok_server().await);
    let config = DispatcherConfig::new(1, 1).with_tolerate_failures(false);

    let mut dispatcher = Dispatcher::new(config, directory, Recorder::default()).unwrap();
    dispatcher.enqueue(task(&["down"], 0)).unwrap();
    dispatcher.enqueue(task(&["ok"], 1)).unwrap();

    let result = dispatcher.execute().await;
    assert!(matches!(result, Err(EvqlError::TaskFailed(_))));

    let recorder = dispatcher.handler();
    assert!(recorder.outcome(0).is_err());
    assert!(matches!(recorder.outcome(1), Err(EvqlError::Shutdown)));
}

#[tokio::test]
async fn test_shutdown_completes_queued_tasks() {
    init_tracing();
    let directory = StaticDirectory::new().with_host("a", refused_addr());
    let (handler, mut events) = ChannelHandler::new();

    let mut dispatcher = Dispatcher::new(DispatcherConfig::default(), directory, handler).unwrap();
    dispatcher.enqueue(task(&["a"], 0)).unwrap();
    dispatcher.enqueue(task(&["a"], 1)).unwrap();
    dispatcher.shutdown();

    let mut done = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let TaskEvent::Done { context, outcome } = event {
            assert!(matches!(outcome, Err(EvqlError::Shutdown)));
            done.push(context);
        }
    }
    done.sort();
    assert_eq!(done, vec![0, 1]);
    assert_eq!(dispatcher.stats().num_tasks_complete, 2);

    // nothing left to run
    dispatcher.execute().await.unwrap();
}

#[tokio::test]
async fn test_channel_handler_end_to_end() {
    init_tracing();
    let directory = StaticDirectory::new().with_host("a", spawn_ok_server().await);
    let (handler, mut events) = ChannelHandler::new();

    let mut dispatcher = Dispatcher::new(DispatcherConfig::default(), directory, handler).unwrap();
    dispatcher.enqueue(task(&["a"], 5)).unwrap();
    dispatcher.execute().await.unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(*event.context(), 5);
        kinds.push(match event {
            TaskEvent::Started { .. } => "started",
            TaskEvent::Result { .. } => "result",
            TaskEvent::Failover { .. } => "failover",
            TaskEvent::Done { .. } => "done",
        });
    }
    assert_eq!(kinds, vec!["started", "result", "done"]);
}

#[tokio::test]
async fn test_rejected_result_moves_to_next_host() {
    init_tracing();
    let corrupt = spawn_server(ServerConfig::default(), |_op| async { reply(b"garbage") }).await;
    let directory = StaticDirectory::new()
        .with_host("corrupt", corrupt)
        .with_host("ok", spawn_ok_server().await);
    let recorder = Recorder {
        reject: Some(b"garbage"),
        ..Recorder::default()
    };

    let mut dispatcher = Dispatcher::new(DispatcherConfig::default(), directory, recorder).unwrap();
    dispatcher.enqueue(task(&["corrupt", "ok"], 0)).unwrap();
    dispatcher.execute().await.unwrap();

    let recorder = dispatcher.handler();
    assert!(recorder.outcome(0).is_ok());
    assert_eq!(recorder.failovers.len(), 1);
    assert_eq!(recorder.failovers[0].1, "corrupt");
    assert!(recorder.failovers[0].2.contains("corrupt result"));
    assert_eq!(
        recorder.payloads(0),
        vec![Bytes::from_static(b"garbage"), Bytes::from_static(b"ok")]
    );
}

#[tokio::test]
async fn test_non_retryable_rejection_fails_task() {
    init_tracing();
    let directory = StaticDirectory::new()
        .with_host("a", spawn_ok_server().await)
        .with_host("b", spawn_ok_server().await);

    struct Refuse;
    impl TaskHandler for Refuse {
        type Context = ();

        fn on_result(&mut self, _ctx: &mut Self::Context, _frame: &Frame) -> ResultAction {
            ResultAction::Fail(EvqlError::InvalidTask("cannot use this result".to_string()))
        }

        fn on_task_done(&mut self, _ctx: Self::Context, _outcome: Result<()>) {}
    }

    let config = DispatcherConfig::default().with_tolerate_failures(true);
    let mut dispatcher = Dispatcher::new(config, directory, Refuse).unwrap();
    dispatcher
        .enqueue(Task::new(opcode::QUERY, Bytes::from_static(b"q"), ["a", "b"], ()))
        .unwrap();
    dispatcher.execute().await.unwrap();

    let snapshot = dispatcher.metrics().snapshot();
    assert_eq!(snapshot.tasks_failed, 1);
    assert_eq!(snapshot.failovers, 0);
}

#[tokio::test]
async fn test_bye_mid_exchange_is_not_a_result() {
    init_tracing();
    let bye = FrameCodec::new()
        .encode_frame(&Frame::empty(opcode::BYE))
        .unwrap();
    let leaving = spawn_raw_peer(bye).await;
    let directory = StaticDirectory::new()
        .with_host("leaving", leaving)
        .with_host("ok", spawn_ok_server().await);

    let mut dispatcher =
        Dispatcher::new(DispatcherConfig::default(), directory, Recorder::default()).unwrap();
    dispatcher.enqueue(task(&["leaving", "ok"], 0)).unwrap();
    dispatcher.execute().await.unwrap();

    let recorder = dispatcher.handler();
    assert!(recorder.outcome(0).is_ok());
    assert!(recorder.results.iter().all(|(_, f)| f.opcode != opcode::BYE));
    assert_eq!(recorder.payloads(0), vec![Bytes::from_static(b"ok")]);
    assert_eq!(recorder.failovers.len(), 1);
    assert!(recorder.failovers[0].2.contains("said BYE"));
}

#[tokio::test]
async fn test_oversized_frame_from_peer_fails_over() {
    init_tracing();
    // QUERY_RESULT header declaring a u32::MAX payload
    const HUGE: &[u8] = &[0x00, 0x07, 0x00, 0x01, 0xff, 0xff, 0xff, 0xff];
    let huge = spawn_raw_peer(Bytes::from_static(HUGE)).await;
    let directory = StaticDirectory::new()
        .with_host("huge", huge)
        .with_host("ok", spawn_ok_server().await);

    let mut dispatcher =
        Dispatcher::new(DispatcherConfig::default(), directory, Recorder::default()).unwrap();
    dispatcher.enqueue(task(&["huge", "ok"], 0)).unwrap();
    dispatcher.execute().await.unwrap();

    let recorder = dispatcher.handler();
    assert!(recorder.outcome(0).is_ok());
    assert!(recorder.results.iter().all(|(_, f)| f.opcode == opcode::QUERY_RESULT));
    assert_eq!(recorder.payloads(0), vec![Bytes::from_static(b"ok")]);
    assert_eq!(recorder.failovers.len(), 1);
    assert_eq!(recorder.failovers[0].1, "huge");
    assert!(recorder.failovers[0].2.to_lowercase().contains("too large"));
}
