//! End-to-end tests running several services on one LocalNode.

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use moonpool_service::{
    dispatch_fn, service_init, Address, LocalNode, ProtocolTag, ServiceConfig, ServiceContext,
    ServiceError, ServiceInit, DEAD_SERVICE,
};
use serde_json::{json, Value};

type Log<T> = Rc<RefCell<Vec<T>>>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

async fn run_local<F: Future<Output = ()>>(test: F) {
    let local = tokio::task::LocalSet::new();
    local.run_until(test).await;
}

/// Let every queued message and spawned native request run.
async fn settle(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

fn peer_of(config: &ServiceConfig) -> Address {
    let raw = config
        .get_param("peer")
        .and_then(Value::as_u64)
        .unwrap_or_default();
    Address::new(raw as u32)
}

/// Answers every generic call with its own arguments, or with an error when
/// the first argument is "fail".
fn echo_kind() -> ServiceInit {
    service_init(|ctx: ServiceContext, _config| async move {
        ctx.set_dispatch(
            "lua",
            dispatch_fn(|ctx, msg, unpack| async move {
                let args = match unpack {
                    Some(unpack) => unpack(&msg.payload)?,
                    None => Vec::new(),
                };
                if args.first() == Some(&json!("fail")) {
                    return ctx.respond_error(msg.sender, msg.reply_session(), "echo refused");
                }
                ctx.respond("lua", msg.sender, msg.reply_session(), args)
            }),
        )?;
        Ok(())
    })
}

/// Records fire-and-forget arguments and never answers.
fn collector_kind(log: Log<Value>) -> ServiceInit {
    service_init(move |ctx: ServiceContext, _config| {
        let log = log.clone();
        async move {
            ctx.set_dispatch(
                "lua",
                dispatch_fn(move |_, msg, unpack| {
                    let log = log.clone();
                    async move {
                        if let Some(unpack) = unpack {
                            log.borrow_mut().extend(unpack(&msg.payload)?);
                        }
                        Ok(())
                    }
                }),
            )?;
            Ok(())
        }
    })
}

/// Calls its peer once with `args` and records the outcome.
fn caller_kind(args: Vec<Value>, log: Log<Result<Vec<Value>, String>>) -> ServiceInit {
    service_init(move |ctx: ServiceContext, config| {
        let (args, log) = (args.clone(), log.clone());
        async move {
            let outcome = ctx
                .call("lua", peer_of(&config), args)
                .await
                .map(|reply| reply.into_values())
                .map_err(|err| err.to_string());
            log.borrow_mut().push(outcome);
            Ok(())
        }
    })
}

#[tokio::test(start_paused = true)]
async fn test_call_round_trip() {
    init_tracing();
    run_local(async {
        let log = Rc::new(RefCell::new(Vec::new()));
        let node = LocalNode::builder()
            .kind("echo", echo_kind())
            .kind("client", caller_kind(vec![json!("ping"), json!(7)], log.clone()))
            .build()
            .unwrap();

        let echo = node.spawn(ServiceConfig::new("echo", "echo")).unwrap();
        node.spawn(ServiceConfig::new("client", "client").param("peer", echo.as_u32()))
            .unwrap();
        settle(1).await;

        assert_eq!(*log.borrow(), vec![Ok(vec![json!("ping"), json!(7)])]);
        let stats = node.context(echo).unwrap().stats();
        assert_eq!(stats.tasks_running, 0);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_remote_error_reaches_caller() {
    init_tracing();
    run_local(async {
        let log = Rc::new(RefCell::new(Vec::new()));
        let node = LocalNode::builder()
            .kind("echo", echo_kind())
            .kind("client", caller_kind(vec![json!("fail")], log.clone()))
            .build()
            .unwrap();

        let echo = node.spawn(ServiceConfig::new("echo", "echo")).unwrap();
        node.spawn(ServiceConfig::new("client", "client").param("peer", echo.as_u32()))
            .unwrap();
        settle(1).await;

        let log = log.borrow();
        let err = log[0].as_ref().unwrap_err();
        assert!(err.contains("echo refused"), "unexpected error: {err}");
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_call_to_dead_address_is_bounced() {
    init_tracing();
    run_local(async {
        let log = Rc::new(RefCell::new(Vec::new()));
        let node = LocalNode::builder()
            .kind("client", caller_kind(vec![json!("hello")], log.clone()))
            .build()
            .unwrap();

        node.spawn(ServiceConfig::new("client", "client").param("peer", 99))
            .unwrap();
        settle(1).await;

        let log = log.borrow();
        let err = log[0].as_ref().unwrap_err();
        assert!(err.contains(DEAD_SERVICE), "unexpected error: {err}");
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_fire_and_forget_send() {
    init_tracing();
    run_local(async {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let node = LocalNode::builder()
            .kind("collector", collector_kind(seen.clone()))
            .kind(
                "sender",
                service_init(|ctx: ServiceContext, config| async move {
                    let peer = peer_of(&config);
                    ctx.send("lua", peer, vec![json!("a")])?;
                    ctx.send("lua", peer, vec![json!("b"), json!(2)])?;
                    Ok(())
                }),
            )
            .build()
            .unwrap();

        let collector = node.spawn(ServiceConfig::new("collector", "collector")).unwrap();
        let sender = node
            .spawn(ServiceConfig::new("sender", "sender").param("peer", collector.as_u32()))
            .unwrap();
        settle(1).await;

        assert_eq!(*seen.borrow(), vec![json!("a"), json!("b"), json!(2)]);
        assert_eq!(node.context(sender).unwrap().stats().sessions_allocated, 0);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_timers_fire_in_deadline_order() {
    init_tracing();
    run_local(async {
        let fired = Rc::new(RefCell::new(Vec::new()));
        let log = fired.clone();
        let node = LocalNode::builder()
            .kind(
                "sleeper",
                service_init(move |ctx: ServiceContext, _config| {
                    let log = log.clone();
                    async move {
                        for delay in [10u64, 5] {
                            let (ctx2, log) = (ctx.clone(), log.clone());
                            ctx.spawn(async move {
                                ctx2.sleep(delay).await?;
                                log.borrow_mut().push((delay, ctx2.now()));
                                Ok(())
                            })?;
                        }
                        Ok(())
                    }
                }),
            )
            .build()
            .unwrap();

        let sleeper = node.spawn(ServiceConfig::new("sleeper", "sleeper")).unwrap();
        settle(2).await;
        assert!(fired.borrow().is_empty());

        settle(20).await;
        let fired = fired.borrow();
        assert_eq!(fired.iter().map(|(d, _)| *d).collect::<Vec<_>>(), vec![5, 10]);
        assert!(fired[0].1 >= 5);
        assert!(fired[1].1 >= 10);
        assert_eq!(node.context(sleeper).unwrap().stats().timers_fired, 2);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_killed_service_fails_pending_calls() {
    init_tracing();
    run_local(async {
        let log = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::new(RefCell::new(Vec::new()));
        let node = LocalNode::builder()
            .kind("silent", collector_kind(seen.clone()))
            .kind("client", caller_kind(vec![json!("anyone?")], log.clone()))
            .build()
            .unwrap();

        let silent = node.spawn(ServiceConfig::new("silent", "silent")).unwrap();
        let client = node
            .spawn(ServiceConfig::new("client", "client").param("peer", silent.as_u32()))
            .unwrap();
        settle(1).await;
        assert_eq!(*seen.borrow(), vec![json!("anyone?")]);
        assert!(log.borrow().is_empty());

        assert!(node.kill(silent));
        assert!(!node.kill(silent));
        settle(1).await;

        let log = log.borrow();
        let err = log[0].as_ref().unwrap_err();
        assert!(err.contains("exited"), "unexpected error: {err}");
        assert_eq!(node.service_count(), 1);
        assert_eq!(node.context(client).unwrap().stats().sessions_waiting, 0);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_debug_protocol() {
    init_tracing();
    run_local(async {
        let replies = Rc::new(RefCell::new(Vec::new()));
        let log = replies.clone();
        let node = LocalNode::builder()
            .kind("echo", echo_kind())
            .kind(
                "debugger",
                service_init(move |ctx: ServiceContext, config| {
                    let log = log.clone();
                    async move {
                        let peer = peer_of(&config);
                        for command in ["ping", "state", "launch"] {
                            let reply = ctx.call(ProtocolTag::DEBUG, peer, vec![json!(command)]).await?;
                            log.borrow_mut().push(reply.first().cloned().unwrap_or_default());
                        }
                        Ok(())
                    }
                }),
            )
            .build()
            .unwrap();

        let echo = node.spawn(ServiceConfig::new("echo", "echo")).unwrap();
        node.spawn(ServiceConfig::new("debugger", "debugger").param("peer", echo.as_u32()))
            .unwrap();
        settle(1).await;

        let replies = replies.borrow();
        assert_eq!(replies.len(), 3);
        assert_eq!(replies[0], json!("pong"));
        assert_eq!(replies[1]["sessions_waiting"], json!(0));
        assert!(replies[2].as_str().is_some_and(|s| s.contains("launch")));
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_unique_names() {
    init_tracing();
    run_local(async {
        let node = LocalNode::builder().kind("echo", echo_kind()).build().unwrap();

        let db = node.spawn(ServiceConfig::new("db", "echo").unique(true)).unwrap();
        assert_eq!(node.query("db"), Some(db));

        let err = node
            .spawn(ServiceConfig::new("db", "echo").unique(true))
            .unwrap_err();
        assert!(matches!(err, ServiceError::SpawnFailed(_)));

        let other = node.spawn(ServiceConfig::new("db", "echo")).unwrap();
        assert_ne!(other, db);

        node.kill(db);
        assert_eq!(node.query("db"), None);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_service_lifecycle_from_inside_a_service() {
    init_tracing();
    run_local(async {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        let node = LocalNode::builder()
            .workers(2)
            .kind("echo", echo_kind())
            .kind(
                "parent",
                service_init(move |ctx: ServiceContext, _config| {
                    let sink = sink.clone();
                    async move {
                        let child = ctx
                            .new_service(ServiceConfig::new("kid", "echo").unique(true).worker_hint(2))
                            .await?;
                        sink.borrow_mut().push(json!(ctx.query_service("kid") == Some(child)));

                        let reply = ctx.call("lua", child, vec![json!("hi")]).await?;
                        sink.borrow_mut().extend(reply.into_values());

                        let listing = ctx.scan_services(2).await?;
                        let listing: Value = listing
                            .first()
                            .and_then(Value::as_str)
                            .map(serde_json::from_str::<Value>)
                            .transpose()?
                            .unwrap_or_default();
                        sink.borrow_mut().push(listing[0]["name"].clone());

                        let missing = ctx.new_service(ServiceConfig::new("ghost", "nope")).await;
                        sink.borrow_mut().push(json!(missing.is_err()));

                        let removed = ctx.remove_service(child, true).await?;
                        sink.borrow_mut().extend(removed.map(|r| r.into_values()).unwrap_or_default());
                        Ok(())
                    }
                }),
            )
            .build()
            .unwrap();

        node.spawn(ServiceConfig::new("parent", "parent").worker_hint(1))
            .unwrap();
        settle(1).await;

        let log = log.borrow();
        assert_eq!(log[0], json!(true));
        assert_eq!(log[1], json!("hi"));
        assert_eq!(log[2], json!("kid"));
        assert_eq!(log[3], json!(true));
        assert!(log[4].as_str().is_some_and(|s| s.contains("removed")));
        assert_eq!(node.service_count(), 1);
        assert_eq!(node.query("kid"), None);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_every_service() {
    init_tracing();
    run_local(async {
        let hooked = Rc::new(RefCell::new(Vec::new()));
        let log = hooked.clone();
        let node = LocalNode::builder()
            .kind("echo", echo_kind())
            .kind(
                "graceful",
                service_init(move |ctx: ServiceContext, _config| {
                    let log = log.clone();
                    async move {
                        ctx.on_shutdown(move |ctx| {
                            let log = log.clone();
                            async move {
                                ctx.sleep(5).await?;
                                log.borrow_mut().push(ctx.name().to_string());
                                ctx.quit()
                            }
                        });
                        Ok(())
                    }
                }),
            )
            .build()
            .unwrap();

        node.spawn(ServiceConfig::new("a", "echo")).unwrap();
        node.spawn(ServiceConfig::new("b", "echo")).unwrap();
        node.spawn(ServiceConfig::new("g", "graceful")).unwrap();
        assert_eq!(node.service_count(), 3);

        node.shutdown();
        node.wait_all_exited().await;

        assert_eq!(node.service_count(), 0);
        assert_eq!(*hooked.borrow(), vec!["g".to_string()]);
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_init_removes_service() {
    init_tracing();
    run_local(async {
        let node = LocalNode::builder()
            .kind(
                "broken",
                service_init(|_ctx: ServiceContext, _config| async {
                    Err(ServiceError::Config("missing setting".to_string()))
                }),
            )
            .build()
            .unwrap();

        let err = node.spawn(ServiceConfig::new("b", "broken")).unwrap_err();
        assert!(matches!(err, ServiceError::TaskFault { .. }));
        assert_eq!(node.service_count(), 0);

        let err = node.spawn(ServiceConfig::new("x", "unknown")).unwrap_err();
        assert!(matches!(err, ServiceError::SpawnFailed(_)));
    })
    .await;
}

#[test]
fn test_builder_rejects_zero_workers() {
    let err = LocalNode::builder().workers(0).build().err();
    assert!(matches!(err, Some(ServiceError::Config(_))));
}
