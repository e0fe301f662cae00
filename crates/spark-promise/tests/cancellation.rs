//! `cancellation` 集成测试：上行取消、超时与延迟。
//!
//! 所有涉及时间的用例都注入 [`ManualClock`]，由测试显式推进虚拟时间。

use std::time::Duration;

use spark_promise::{Engine, ErrorKind, ManualClock, Rejection, Resolution};

fn value<T>(v: T) -> Result<Resolution<T>, Rejection> {
    Ok(Resolution::Value(v))
}

fn drive(engine: &Engine) {
    engine.run_until_idle().expect("不应出现致命拒绝");
}

fn manual_engine() -> (Engine, ManualClock) {
    let clock = ManualClock::new();
    let engine = Engine::builder().clock(clock.clone()).build();
    (engine, clock)
}

#[test]
fn cancel_reaches_the_outermost_cancellable_ancestor() {
    let engine = Engine::new();
    let (root, _resolver) = engine.deferred::<u32>();
    let root = root.cancellable();
    let middle = root.then(|v| value(v + 1));
    let leaf = middle.map(|v| v * 2);
    assert!(leaf.is_cancellable());

    assert!(leaf.cancel());
    assert!(root.is_pending(), "取消在慢队列中执行");
    drive(&engine);

    assert!(root.is_cancelled());
    assert!(middle.is_cancelled());
    assert!(leaf.is_cancelled());
    let reason = leaf.reason().expect("leaf 被拒绝");
    assert!(reason.ptr_eq(&root.reason().expect("root 被拒绝")));
}

#[test]
fn plain_promises_ignore_cancel() {
    let engine = Engine::new();
    let (promise, _resolver) = engine.deferred::<u32>();
    assert!(!promise.is_cancellable());
    assert!(!promise.cancel());
    drive(&engine);
    assert!(promise.is_pending());
}

#[test]
fn settled_promises_cannot_be_cancelled() {
    let engine = Engine::new();
    let promise = engine.resolve(1).cancellable();
    assert!(!promise.cancel());
    drive(&engine);
    assert_eq!(promise.value(), Some(1));
}

#[test]
fn uncancellable_followers_shield_the_source() {
    let engine = Engine::new();
    let (root, resolver) = engine.deferred::<u32>();
    let root = root.cancellable();
    let shielded = root.uncancellable();
    let downstream = shielded.then(|v| value(v + 1));
    assert!(!shielded.cancel());
    assert!(!downstream.cancel());
    drive(&engine);
    assert!(root.is_pending());

    resolver.resolve(1);
    drive(&engine);
    assert_eq!(downstream.value(), Some(2));
}

#[test]
fn followers_of_cancellable_promises_are_cancellable() {
    let engine = Engine::new();
    let (root, _resolver) = engine.deferred::<&'static str>();
    let root = root.cancellable();
    let follower = engine.resolve_with(root.clone());
    assert!(follower.is_cancellable());
    assert!(follower.cancel_with(Rejection::cancelled("user aborted")));
    drive(&engine);
    assert!(root.is_cancelled());
    assert!(follower.is_cancelled());
    assert_eq!(
        follower.reason().map(|r| r.to_string()),
        root.reason().map(|r| r.to_string())
    );
}

#[test]
fn cancellation_can_be_caught_downstream() {
    let engine = Engine::new();
    let (root, _resolver) = engine.deferred::<u32>();
    let root = root.cancellable();
    let leaf = root.then(value);
    let recovered = leaf.catch_if(ErrorKind::Cancelled, |_| value(0));
    leaf.cancel();
    drive(&engine);
    assert_eq!(recovered.value(), Some(0));
}

#[test]
fn timeout_rejects_the_derived_promise() {
    let (engine, clock) = manual_engine();
    let (slow, _resolver) = engine.deferred::<u32>();
    let limited = slow.timeout_with(Duration::from_millis(100), "too slow");
    let _ = limited.catch(|_| value(0));
    drive(&engine);
    assert!(limited.is_pending());

    clock.advance(Duration::from_millis(99));
    drive(&engine);
    assert!(limited.is_pending());

    clock.advance(Duration::from_millis(1));
    drive(&engine);
    let reason = limited.reason().expect("超时拒绝");
    assert!(reason.is_timeout());
    assert!(reason.to_string().contains("too slow"));
    assert!(slow.is_pending(), "不可取消的源不受影响");
}

#[test]
fn timeout_cancels_cancellable_chains() {
    let (engine, clock) = manual_engine();
    let (source, _resolver) = engine.deferred::<u32>();
    let source = source.cancellable();
    let limited = source.timeout(Duration::from_secs(1));
    let _ = limited.catch(|_| value(0));
    clock.advance(Duration::from_secs(1));
    drive(&engine);
    assert_eq!(source.reason().map(|r| r.kind()), Some(ErrorKind::Timeout));
    assert_eq!(limited.reason().map(|r| r.kind()), Some(ErrorKind::Timeout));
}

#[test]
fn settlement_clears_the_timeout_timer() {
    let (engine, _clock) = manual_engine();
    let (fast, resolver) = engine.deferred::<u32>();
    let limited = fast.timeout(Duration::from_secs(5));
    assert_eq!(engine.pending_timers(), 1);
    resolver.resolve(3);
    drive(&engine);
    assert_eq!(limited.value(), Some(3));
    assert_eq!(engine.pending_timers(), 0);
}

#[test]
fn delay_postpones_fulfilment_only() {
    let (engine, clock) = manual_engine();
    let delayed = engine.resolve(5).delay(Duration::from_millis(50));
    let failed = engine
        .reject::<u32>("immediate")
        .delay(Duration::from_millis(50));
    let _ = failed.catch(|_| value(0));
    drive(&engine);
    assert!(delayed.is_pending());
    assert!(failed.is_rejected());

    clock.advance(Duration::from_millis(50));
    drive(&engine);
    assert_eq!(delayed.value(), Some(5));
}

#[test]
fn run_to_completion_sleeps_until_every_timer_fired() {
    let (engine, clock) = manual_engine();
    let first = engine.delay_value("first", Duration::from_millis(10));
    let second = engine
        .delay(Duration::from_millis(30))
        .map(|()| "second");
    engine.run_to_completion().expect("不应出现致命拒绝");
    assert_eq!(first.value(), Some("first"));
    assert_eq!(second.value(), Some("second"));
    assert_eq!(clock.elapsed(), Duration::from_millis(30));
    assert_eq!(engine.pending_timers(), 0);
}
