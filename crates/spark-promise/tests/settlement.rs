//! `settlement` 集成测试：从公开 API 视角验证结算状态机与链式延续。
//!
//! # 测试目标（Why）
//! - 延续必须异步运行、按附加顺序运行，且对已结算 Promise 的附加同样生效；
//! - 跟随、thenable 采纳与自解决检测共同决定“以什么解决”这一核心语义；
//! - `finally`/`tap`/`catch_if`/`done` 等派生操作的透传规则在此逐一钉住。
//!
//! # 结构安排（How）
//! - 每个测试自建 [`Engine`]，以 `run_until_idle` 显式推进；
//! - 共享状态使用 `Rc<RefCell<_>>` 记录回调序列。

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use spark_promise::{
    Engine, EngineError, ErrorFilter, ErrorKind, Inspection, Promise, Rejection, Resolution,
    Resolver,
};

fn value<T>(v: T) -> Result<Resolution<T>, Rejection> {
    Ok(Resolution::Value(v))
}

fn drive(engine: &Engine) {
    engine.run_until_idle().expect("不应出现致命拒绝");
}

#[test]
fn continuations_never_run_synchronously() {
    let engine = Engine::new();
    let ran = Rc::new(Cell::new(false));
    let flag = Rc::clone(&ran);
    let _next = engine.resolve(1).then(move |v| {
        flag.set(true);
        value(v)
    });
    assert!(!ran.get(), "附加调用内不得同步执行处理器");
    drive(&engine);
    assert!(ran.get());
}

/// 验证同一 Promise 上的处理器按附加顺序执行，且结算前后附加的处理器都不会丢失。
#[test]
fn handlers_run_in_attachment_order() {
    let engine = Engine::new();
    let (promise, resolver) = engine.deferred::<&'static str>();
    let log = Rc::new(RefCell::new(Vec::new()));
    for tag in 0..3 {
        let log = Rc::clone(&log);
        let _ = promise.then(move |v| {
            log.borrow_mut().push((tag, v));
            value(())
        });
    }
    resolver.resolve("ok");
    let late = Rc::clone(&log);
    let _ = promise.then(move |v| {
        late.borrow_mut().push((3, v));
        value(())
    });
    drive(&engine);
    assert_eq!(
        *log.borrow(),
        vec![(0, "ok"), (1, "ok"), (2, "ok"), (3, "ok")]
    );
}

#[test]
fn first_resolution_wins() {
    let engine = Engine::new();
    let promise = engine.promise(|resolver: Resolver<u32>| {
        resolver.resolve(1);
        resolver.reject("ignored");
        resolver.resolve(2);
        Ok(())
    });
    drive(&engine);
    assert_eq!(promise.value(), Some(1));
}

#[test]
fn executor_failures_reject() {
    let engine = Engine::new();
    let errored: Promise<u32> = engine.promise(|_| Err(Rejection::type_error("bad input")));
    let panicked: Promise<u32> = engine.promise(|_| panic!("executor exploded"));
    let resolved_first: Promise<u32> = engine.promise(|resolver| {
        resolver.resolve(7);
        Err(Rejection::type_error("too late"))
    });
    engine.on_possibly_unhandled_rejection(|_, _| {});
    drive(&engine);

    assert_eq!(errored.reason().map(|r| r.kind()), Some(ErrorKind::Type));
    let reason = panicked.reason().expect("panic 应转为拒绝");
    assert_eq!(reason.kind(), ErrorKind::Panicked);
    assert!(reason.to_string().contains("executor exploded"));
    assert_eq!(resolved_first.value(), Some(7));
}

#[test]
fn following_preserves_rejection_identity() {
    let engine = Engine::new();
    let reason = Rejection::range_error("out of range");
    let source: Promise<u32> = engine.reject(reason.clone());
    let follower = engine.resolve_with(source);
    let caught = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&caught);
    let _ = follower.catch(move |r| {
        *sink.borrow_mut() = Some(r);
        value(0)
    });
    drive(&engine);
    let seen = caught.borrow_mut().take().expect("拒绝应当透传到处理器");
    assert!(seen.ptr_eq(&reason));
    assert!(follower.reason().expect("跟随者被拒绝").ptr_eq(&reason));
}

#[test]
fn rejection_skips_fulfilment_handlers_until_caught() {
    let engine = Engine::new();
    let touched = Rc::new(Cell::new(0));
    let counter = Rc::clone(&touched);
    let recovered = engine
        .reject::<u32>("nope")
        .then(move |v| {
            counter.set(counter.get() + 1);
            value(v)
        })
        .map(|v| v * 10)
        .catch(|reason| value(reason.payload_ref::<String>().map_or(0, |s| s.len() as u32)));
    drive(&engine);
    assert_eq!(touched.get(), 0);
    assert_eq!(recovered.value(), Some(4));
}

#[test]
fn resolving_with_itself_is_rejected() {
    let engine = Engine::new();
    let (promise, resolver) = engine.deferred::<u32>();
    let _ = promise.catch(|_| value(0));
    resolver.resolve_with(promise.clone());
    drive(&engine);
    assert_eq!(
        promise.reason().map(|r| r.kind()),
        Some(ErrorKind::SelfResolution)
    );
}

#[test]
fn follow_cycles_are_detected() {
    let engine = Engine::new();
    let (a, resolve_a) = engine.deferred::<u32>();
    let (b, resolve_b) = engine.deferred::<u32>();
    let _ = a.catch(|_| value(0));
    let _ = b.catch(|_| value(0));
    resolve_a.resolve_with(b.clone());
    resolve_b.resolve_with(a.clone());
    drive(&engine);
    assert_eq!(b.reason().map(|r| r.kind()), Some(ErrorKind::SelfResolution));
    assert_eq!(a.reason().map(|r| r.kind()), Some(ErrorKind::SelfResolution));
}

#[test]
fn thenables_are_adopted_on_a_later_tick() {
    let engine = Engine::new();
    let called = Rc::new(Cell::new(false));
    let flag = Rc::clone(&called);
    let thenable = move |resolver: Resolver<u32>| -> Result<(), Rejection> {
        flag.set(true);
        resolver.resolve(5);
        resolver.resolve(6);
        Ok(())
    };
    let adopted = engine.resolve_with(Resolution::adopt(thenable));
    assert!(!called.get());
    drive(&engine);
    assert!(called.get());
    assert_eq!(adopted.value(), Some(5));
}

#[test]
fn failing_thenable_rejects_unless_already_resolved() {
    let engine = Engine::new();
    let failing = |_: Resolver<u32>| -> Result<(), Rejection> {
        Err(Rejection::type_error("then failed"))
    };
    let settling = |resolver: Resolver<u32>| -> Result<(), Rejection> {
        resolver.resolve(9);
        Err(Rejection::type_error("ignored"))
    };
    let failed = engine.resolve_with(Resolution::adopt(failing));
    let settled_first = engine.resolve_with(Resolution::adopt(settling));
    let _ = failed.catch(|_| value(0));
    drive(&engine);
    assert_eq!(failed.reason().map(|r| r.kind()), Some(ErrorKind::Type));
    assert_eq!(settled_first.value(), Some(9));
}

#[test]
fn handler_results_are_flattened() {
    let engine = Engine::new();
    let inner = engine.clone();
    let chained = engine
        .resolve(3)
        .and_then(move |v| inner.resolve(v + 1))
        .then(|v| value(v * 2));
    drive(&engine);
    assert_eq!(chained.value(), Some(8));
}

#[test]
fn catch_if_only_handles_matching_reasons() {
    let engine = Engine::new();
    let handled = engine
        .reject::<u32>(Rejection::range_error("too big"))
        .catch_if(ErrorKind::Range, |_| value(1));
    let passed = engine
        .reject::<u32>(Rejection::type_error("wrong"))
        .catch_if(ErrorKind::Range, |_| value(1));
    let by_payload = engine
        .reject::<u32>(Rejection::payload(404_u16))
        .catch_if(ErrorFilter::payload::<u16>(), |r| {
            value(u32::from(*r.payload_ref::<u16>().expect("u16 载荷")))
        });
    let _ = passed.catch(|_| value(0));
    drive(&engine);
    assert_eq!(handled.value(), Some(1));
    assert_eq!(passed.reason().map(|r| r.kind()), Some(ErrorKind::Type));
    assert_eq!(by_payload.value(), Some(404));
}

#[test]
fn finally_passes_the_original_outcome_through() {
    let engine = Engine::new();
    let cleanups = Rc::new(Cell::new(0));
    let first = Rc::clone(&cleanups);
    let second = Rc::clone(&cleanups);
    let fulfilled = engine.resolve(5).finally(move || {
        first.set(first.get() + 1);
        value(())
    });
    let reason = Rejection::type_error("kept");
    let rejected = engine.reject::<u32>(reason.clone()).finally(move || {
        second.set(second.get() + 1);
        value(())
    });
    let _ = rejected.catch(|_| value(0));
    drive(&engine);
    assert_eq!(cleanups.get(), 2);
    assert_eq!(fulfilled.value(), Some(5));
    assert!(rejected.reason().expect("原拒绝透传").ptr_eq(&reason));
}

#[test]
fn finally_waits_for_its_promise_and_may_replace_the_outcome() {
    let engine = Engine::new();
    let (gate, open) = engine.deferred::<()>();
    let waiting = engine
        .resolve(1)
        .finally(move || Ok(Resolution::Follow(gate)));
    drive(&engine);
    assert!(waiting.is_pending());
    open.resolve(());
    drive(&engine);
    assert_eq!(waiting.value(), Some(1));

    let failing_engine = engine.clone();
    let replaced = engine.resolve(2).finally(move || {
        Ok(Resolution::Follow(failing_engine.reject("cleanup failed")))
    });
    let _ = replaced.catch(|_| value(0));
    drive(&engine);
    let reason = replaced.reason().expect("清理失败应取代原结果");
    assert_eq!(
        reason.payload_ref::<String>().map(String::as_str),
        Some("cleanup failed")
    );
}

#[test]
fn tap_observes_without_changing_the_value() {
    let engine = Engine::new();
    let seen = Rc::new(Cell::new(0));
    let sink = Rc::clone(&seen);
    let tapped = engine.resolve(11).tap(move |v| {
        sink.set(*v);
        Ok(())
    });
    let failed = engine
        .resolve(11)
        .tap(|_| Err(Rejection::type_error("tap failed")));
    let _ = failed.catch(|_| value(0));
    drive(&engine);
    assert_eq!(seen.get(), 11);
    assert_eq!(tapped.value(), Some(11));
    assert_eq!(failed.reason().map(|r| r.kind()), Some(ErrorKind::Type));
}

#[test]
fn handler_panics_reject_the_derived_promise() {
    let engine = Engine::new();
    let derived: Promise<u32> = engine.resolve(1).then(|_| panic!("handler bug"));
    let _ = derived.catch(|_| value(0));
    drive(&engine);
    let reason = derived.reason().expect("panic 转为拒绝");
    assert_eq!(reason.kind(), ErrorKind::Panicked);
}

#[test]
fn progress_flows_down_the_chain_until_settlement() {
    let engine = Engine::new();
    let (source, resolver) = engine.deferred::<u32>();
    let direct = Rc::new(RefCell::new(Vec::new()));
    let forwarded = Rc::new(RefCell::new(Vec::new()));
    let direct_sink = Rc::clone(&direct);
    let forwarded_sink = Rc::clone(&forwarded);
    let child = source.then_with_progress(value, Err, move |p| direct_sink.borrow_mut().push(p));
    let _grandchild = child.progressed(move |p| forwarded_sink.borrow_mut().push(p));

    resolver.progress(0.25);
    drive(&engine);
    resolver.progress(0.75);
    drive(&engine);
    resolver.resolve(1);
    resolver.progress(1.0);
    drive(&engine);

    assert_eq!(*direct.borrow(), vec![0.25, 0.75]);
    assert_eq!(*forwarded.borrow(), vec![0.25, 0.75]);
}

#[test]
fn bound_context_is_passed_to_every_handler() {
    let engine = Engine::new();
    let bound = engine
        .resolve(4_u32)
        .bind(String::from("ctx"))
        .then(|ctx: &String, v| value(v + ctx.len() as u32))
        .then(|ctx: &String, v| {
            if v > 5 {
                Err(Rejection::range_error(format!("{ctx}: {v}")))
            } else {
                value(v)
            }
        })
        .catch(|ctx: &String, _| value(ctx.len() as u32));
    assert_eq!(bound.context(), "ctx");
    let promise = bound.into_promise();
    drive(&engine);
    assert_eq!(promise.value(), Some(3));
}

#[test]
fn inspection_reflects_the_current_state() {
    let engine = Engine::new();
    let (promise, resolver) = engine.deferred::<u32>();
    assert!(matches!(promise.inspect(), Inspection::Pending));
    assert!(promise.is_pending());
    resolver.resolve(8);
    assert!(promise.is_fulfilled());
    assert_eq!(promise.inspect().value(), Some(&8));

    let rejected: Promise<u32> = engine.reject("x");
    let _ = rejected.catch(|_| value(0));
    assert!(rejected.is_rejected());
    assert!(rejected.inspect().reason().is_some());
    assert_eq!(rejected.value(), None);
    drive(&engine);
}

#[test]
fn done_turns_rejections_into_fatal_errors() {
    let engine = Engine::new();
    let reason = Rejection::type_error("nobody handled this");
    engine.reject::<u32>(reason.clone()).done();
    match engine.run_until_idle() {
        Err(EngineError::Fatal(escaped)) => assert!(escaped.ptr_eq(&reason)),
        other => panic!("expected fatal rejection, got {other:?}"),
    }
}

#[test]
fn fatal_hook_keeps_the_tick_running() {
    let engine = Engine::new();
    let fatal = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&fatal);
    engine.on_fatal(move |reason| sink.borrow_mut().push(reason.kind()));
    engine
        .resolve(1)
        .done_with(|_| Err(Rejection::range_error("handler failed")), Err);
    let after = engine.resolve(2).map(|v| v + 1);
    drive(&engine);
    assert_eq!(*fatal.borrow(), vec![ErrorKind::Range]);
    assert_eq!(after.value(), Some(3));
}

#[test]
fn try_call_wraps_results() {
    let engine = Engine::new();
    let ok = engine.try_call(|| value(1));
    let err: Promise<u32> = engine.try_call(|| Err(Rejection::type_error("sync failure")));
    let _ = err.catch(|_| value(0));
    drive(&engine);
    assert_eq!(ok.value(), Some(1));
    assert_eq!(err.reason().map(|r| r.kind()), Some(ErrorKind::Type));
}

#[test]
fn then_or_else_routes_by_outcome() {
    let engine = Engine::new();
    let ok = engine
        .resolve(4)
        .then_or_else(|v| value(v * 2), |_| value(0));
    let recovered = engine
        .reject::<i32>("broken")
        .then_or_else(|v| value(v * 2), |_| value(-1));
    drive(&engine);
    assert_eq!(ok.value(), Some(8));
    assert_eq!(recovered.value(), Some(-1));
}
