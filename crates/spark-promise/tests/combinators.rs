//! `combinators` 集成测试：All/Props/Race/Some/Any/Settle/Map/Filter/Reduce 的聚合语义。
//!
//! # 测试目标（Why）
//! - 结果顺序只由输入顺序决定，与完成顺序无关（Race/Some 除外）；
//! - 聚合 Promise 恰好结算一次，拒绝原因保持同一性；
//! - Map 的并发上限与 Reduce 的顺序推进都必须在异步输入下成立。

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use spark_promise::{
    Engine, ErrorKind, Input, KeyedSource, MapOptions, Promise, Rejection, Resolution, Resolver,
    Source,
};

fn value<T>(v: T) -> Result<Resolution<T>, Rejection> {
    Ok(Resolution::Value(v))
}

fn drive(engine: &Engine) {
    engine.run_until_idle().expect("不应出现致命拒绝");
}

#[test]
fn all_keeps_input_order() {
    let engine = Engine::new();
    let (a, resolve_a) = engine.deferred::<u32>();
    let (b, resolve_b) = engine.deferred::<u32>();
    let all = engine.all(vec![Input::Promise(a), Input::Value(2), Input::Promise(b)]);
    resolve_b.resolve(3);
    drive(&engine);
    assert!(all.is_pending());
    resolve_a.resolve(1);
    drive(&engine);
    assert_eq!(all.value(), Some(vec![1, 2, 3]));
}

#[test]
fn all_rejects_with_the_first_reason() {
    let engine = Engine::new();
    let (a, _keep_pending) = engine.deferred::<u32>();
    let (b, reject_b) = engine.deferred::<u32>();
    let (c, reject_c) = engine.deferred::<u32>();
    let all = engine.all(vec![a, b, c]);
    let first = Rejection::type_error("first");
    reject_b.reject(first.clone());
    reject_c.reject("second");
    let _ = all.catch(|_| value(Vec::new()));
    drive(&engine);
    assert!(all.reason().expect("all 应被拒绝").ptr_eq(&first));
}

#[test]
fn all_of_nothing_fulfils_immediately() {
    let engine = Engine::new();
    let all = engine.all(Vec::<Promise<u32>>::new());
    assert_eq!(all.value(), Some(Vec::new()));
}

#[test]
fn deferred_sources_are_awaited_first() {
    let engine = Engine::new();
    let (list, resolve_list) = engine.deferred::<Vec<u32>>();
    let all = engine.all(Source::deferred(list));
    drive(&engine);
    assert!(all.is_pending());
    resolve_list.resolve(vec![4, 5]);
    drive(&engine);
    assert_eq!(all.value(), Some(vec![4, 5]));

    let failed = engine.all(Source::<u32>::deferred(engine.reject("no list")));
    let _ = failed.catch(|_| value(Vec::new()));
    drive(&engine);
    assert!(failed.is_rejected());
}

#[test]
fn props_rebuilds_the_keys() {
    let engine = Engine::new();
    let (late, resolve_late) = engine.deferred::<&'static str>();
    let props = engine.props([
        ("host", Input::Value("localhost")),
        ("port", Input::Promise(late)),
    ]);
    resolve_late.resolve("8080");
    drive(&engine);
    let map = props.value().expect("props 应兑现");
    assert_eq!(map.get("host"), Some(&"localhost"));
    assert_eq!(map.get("port"), Some(&"8080"));
}

#[test]
fn props_waits_for_a_deferred_map() {
    let engine = Engine::new();
    let (entries, resolve_entries) = engine.deferred::<Vec<(&'static str, Input<u32>)>>();
    let (port, resolve_port) = engine.deferred::<u32>();
    let props = engine.props(entries);
    drive(&engine);
    assert!(props.is_pending());

    resolve_entries.resolve(vec![("workers", Input::Value(4)), ("port", Input::Promise(port))]);
    drive(&engine);
    assert!(props.is_pending());
    resolve_port.resolve(8080);
    drive(&engine);
    let map = props.value().expect("props 应兑现");
    assert_eq!(map.get("workers"), Some(&4));
    assert_eq!(map.get("port"), Some(&8080));

    let plain = engine.props(KeyedSource::deferred(engine.resolve(BTreeMap::from([("a", 1)]))));
    let failed = engine.props(KeyedSource::<&str, u32>::deferred(engine.reject("no map")));
    let _ = failed.catch(|_| value(BTreeMap::new()));
    drive(&engine);
    assert_eq!(plain.value(), Some(BTreeMap::from([("a", 1)])));
    assert!(failed.is_rejected());
}

#[test]
fn race_settles_with_the_first_outcome() {
    let engine = Engine::new();
    let (a, resolve_a) = engine.deferred::<u32>();
    let (b, reject_b) = engine.deferred::<u32>();
    let race = engine.race(vec![a, b]);
    let reason = Rejection::timeout("b lost");
    reject_b.reject(reason.clone());
    resolve_a.resolve(1);
    let _ = race.catch(|_| value(0));
    drive(&engine);
    assert!(race.reason().expect("先结算者胜出").ptr_eq(&reason));

    let (never, _resolver) = engine.deferred::<u32>();
    let immediate = engine.race(vec![Input::Promise(never), Input::Value(9)]);
    drive(&engine);
    assert_eq!(immediate.value(), Some(9));
}

#[test]
fn race_of_nothing_stays_pending() {
    let engine = Engine::new();
    let race = engine.race(Vec::<Promise<u32>>::new());
    drive(&engine);
    assert!(race.is_pending());
}

#[test]
fn some_collects_in_arrival_order() {
    let engine = Engine::new();
    let deferred: Vec<(Promise<u32>, Resolver<u32>)> = (0..4).map(|_| engine.deferred()).collect();
    let some = engine.some(
        deferred.iter().map(|(p, _)| p.clone()).collect::<Vec<_>>(),
        2,
    );
    deferred[2].1.resolve(30);
    drive(&engine);
    deferred[0].1.reject("zero failed");
    deferred[3].1.resolve(40);
    deferred[1].1.resolve(10);
    drive(&engine);
    assert_eq!(some.value(), Some(vec![30, 40]));
}

#[test]
fn some_rejects_once_the_count_is_unreachable() {
    let engine = Engine::new();
    let some = engine.some(
        vec![
            engine.reject::<u32>("a"),
            engine.resolve(1),
            engine.reject::<u32>("b"),
        ],
        2,
    );
    let _ = some.catch(|_| value(Vec::new()));
    drive(&engine);
    let reason = some.reason().expect("凑不满时拒绝");
    assert_eq!(reason.kind(), ErrorKind::Aggregate);
    assert_eq!(reason.reasons().len(), 2);

    let too_many = engine.some(vec![engine.resolve(1)], 2);
    let _ = too_many.catch(|_| value(Vec::new()));
    drive(&engine);
    assert_eq!(too_many.reason().map(|r| r.kind()), Some(ErrorKind::Range));

    let none = engine.some(vec![engine.resolve(1)], 0);
    assert_eq!(none.value(), Some(Vec::new()));
}

#[test]
fn any_takes_the_first_fulfilment() {
    let engine = Engine::new();
    let any = engine.any(vec![
        engine.reject::<u32>("a"),
        engine.resolve(2),
        engine.resolve(3),
    ]);
    drive(&engine);
    assert_eq!(any.value(), Some(2));

    let failed = engine.any(vec![engine.reject::<u32>("x"), engine.reject::<u32>("y")]);
    let _ = failed.catch(|_| value(0));
    drive(&engine);
    let reason = failed.reason().expect("全部拒绝");
    assert_eq!(reason.kind(), ErrorKind::Aggregate);
    let payloads: Vec<_> = reason
        .reasons()
        .iter()
        .filter_map(|r| r.payload_ref::<String>().cloned())
        .collect();
    assert_eq!(payloads, ["x", "y"]);
}

#[test]
fn settle_never_rejects() {
    let engine = Engine::new();
    let settled = engine.settle(vec![engine.resolve(1), engine.reject("bad")]);
    drive(&engine);
    let results = settled.value().expect("settle 总是兑现");
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].value(), Some(&1));
    assert!(results[1].is_rejected());
}

/// 验证并发上限：任意时刻挂起的映射结果不超过 2 个，且结果仍按输入顺序排列。
#[test]
fn map_respects_the_concurrency_limit() {
    let engine = Engine::new();
    let pending: Rc<RefCell<Vec<(u32, Resolver<u32>)>>> = Rc::default();
    let sink = Rc::clone(&pending);
    let mapper_engine = engine.clone();
    let mapped = engine.map_with(
        Source::values(vec![1, 2, 3, 4, 5]),
        MapOptions::concurrency(2),
        move |v: u32, _, _| {
            let (promise, resolver) = mapper_engine.deferred();
            sink.borrow_mut().push((v, resolver));
            Ok(Resolution::Follow(promise))
        },
    );
    assert!(pending.borrow().is_empty(), "映射器不应在创建调用内运行");
    drive(&engine);

    let mut rounds = 0;
    loop {
        let batch: Vec<_> = pending.borrow_mut().drain(..).collect();
        if batch.is_empty() {
            break;
        }
        assert!(batch.len() <= 2, "并发上限被突破：{}", batch.len());
        for (v, resolver) in batch.into_iter().rev() {
            resolver.resolve(v * 10);
        }
        drive(&engine);
        rounds += 1;
    }
    assert!(rounds >= 3);
    assert_eq!(mapped.value(), Some(vec![10, 20, 30, 40, 50]));
}

#[test]
fn map_passes_index_and_length() {
    let engine = Engine::new();
    let mapped = engine.map(Source::values(vec!['a', 'b']), |c: char, index, len| {
        value(format!("{c}{index}/{len}"))
    });
    drive(&engine);
    assert_eq!(mapped.value(), Some(vec!["a0/2".to_owned(), "b1/2".to_owned()]));
}

#[test]
fn map_failures_reject_the_aggregate() {
    let engine = Engine::new();
    let failed = engine.map(Source::values(vec![1, 2, 3]), |v: u32, _, _| {
        if v == 2 {
            Err(Rejection::range_error("two"))
        } else {
            value(v)
        }
    });
    let buggy = |_: u32, _: usize, _: usize| -> Result<Resolution<u32>, Rejection> {
        panic!("mapper bug")
    };
    let panicked = engine.map(Source::values(vec![1]), buggy);
    let _ = failed.catch(|_| value(Vec::new()));
    let _ = panicked.catch(|_| value(Vec::new()));
    drive(&engine);
    assert_eq!(failed.reason().map(|r| r.kind()), Some(ErrorKind::Range));
    assert_eq!(panicked.reason().map(|r| r.kind()), Some(ErrorKind::Panicked));
}

#[test]
fn filter_keeps_order() {
    let engine = Engine::new();
    let async_engine = engine.clone();
    let kept = engine.filter(Source::values(vec![1, 2, 3, 4, 5, 6]), move |v: &u32, _, _| {
        if *v > 4 {
            Ok(Resolution::Follow(async_engine.resolve(true)))
        } else {
            value(v % 2 == 0)
        }
    });
    drive(&engine);
    assert_eq!(kept.value(), Some(vec![2, 4, 5, 6]));
}

#[test]
fn reduce_folds_sequentially_in_input_order() {
    let engine = Engine::new();
    let (a, resolve_a) = engine.deferred::<u32>();
    let (b, resolve_b) = engine.deferred::<u32>();
    let (c, resolve_c) = engine.deferred::<u32>();
    let visited = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&visited);
    let step_engine = engine.clone();
    let total = engine.reduce(
        vec![a, b, c],
        move |acc: u32, v: u32, index, len| {
            log.borrow_mut().push((index, len));
            Ok(Resolution::Follow(step_engine.resolve(acc * 10 + v)))
        },
        Resolution::Follow(engine.resolve(9)),
    );
    resolve_c.resolve(3);
    resolve_b.resolve(2);
    drive(&engine);
    assert!(total.is_pending());
    resolve_a.resolve(1);
    drive(&engine);
    assert_eq!(total.value(), Some(9123));
    assert_eq!(*visited.borrow(), vec![(0, 3), (1, 3), (2, 3)]);
}

#[test]
fn reduce_with_initial_value_on_empty_input() {
    let engine = Engine::new();
    let total = engine.reduce(
        Vec::<Promise<u32>>::new(),
        |acc: u32, v: u32, _, _| value(acc + v),
        Resolution::Value(42),
    );
    drive(&engine);
    assert_eq!(total.value(), Some(42));
}

#[test]
fn reduce1_seeds_with_the_first_element() {
    let engine = Engine::new();
    let indices = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&indices);
    let total = engine.reduce1(Source::values(vec![1, 2, 3, 4]), move |acc: u32, v, index, _| {
        log.borrow_mut().push(index);
        value(acc + v)
    });
    drive(&engine);
    assert_eq!(total.value(), Some(10));
    assert_eq!(*indices.borrow(), vec![1, 2, 3]);

    let empty = engine.reduce1(Vec::<Promise<u32>>::new(), |a: u32, b, _, _| value(a + b));
    let _ = empty.catch(|_| value(0));
    drive(&engine);
    assert_eq!(empty.reason().map(|r| r.kind()), Some(ErrorKind::Type));
}

#[test]
fn reducer_errors_stop_the_fold() {
    let engine = Engine::new();
    let calls = Rc::new(Cell::new(0));
    let counter = Rc::clone(&calls);
    let total = engine.reduce(
        Source::values(vec![1, 2, 3]),
        move |acc: u32, v: u32, _, _| {
            counter.set(counter.get() + 1);
            if v == 2 {
                Err(Rejection::type_error("bad element"))
            } else {
                value(acc + v)
            }
        },
        Resolution::Value(0),
    );
    let _ = total.catch(|_| value(0));
    drive(&engine);
    assert_eq!(calls.get(), 2);
    assert_eq!(total.reason().map(|r| r.kind()), Some(ErrorKind::Type));
}

/// 验证用户回调从不在创建聚合的调用栈内运行。
///
/// # 测试目标（Why）
/// - 输入全部为普通值时，映射器、谓词与归约器也只能在后续调度轮次执行；
/// - 调用方在创建聚合期间持有的 `RefCell` 借用不会与回调冲突。
#[test]
fn callbacks_never_run_inside_the_creating_call() {
    let engine = Engine::new();
    let calls = Rc::new(Cell::new(0));
    let (map_calls, filter_calls, reduce_calls) =
        (Rc::clone(&calls), Rc::clone(&calls), Rc::clone(&calls));
    let mapped = engine.map(Source::values(vec![1, 2, 3]), move |v: u32, _, _| {
        map_calls.set(map_calls.get() + 1);
        value(v * 2)
    });
    let kept = engine.filter(Source::values(vec![1, 2, 3]), move |v: &u32, _, _| {
        filter_calls.set(filter_calls.get() + 1);
        value(*v != 2)
    });
    let total = engine.reduce1(Source::values(vec![1, 2, 3]), move |acc: u32, v, _, _| {
        reduce_calls.set(reduce_calls.get() + 1);
        value(acc + v)
    });
    assert_eq!(calls.get(), 0, "回调不应在创建调用内运行");

    drive(&engine);
    assert_eq!(calls.get(), 3 + 3 + 2);
    assert_eq!(mapped.value(), Some(vec![2, 4, 6]));
    assert_eq!(kept.value(), Some(vec![1, 3]));
    assert_eq!(total.value(), Some(6));
}

#[test]
fn reduce_tolerates_a_caller_side_borrow() {
    let engine = Engine::new();
    let seen: Rc<RefCell<Vec<u32>>> = Rc::default();
    let total = {
        let mut guard = seen.borrow_mut();
        let log = Rc::clone(&seen);
        let total = engine.reduce(
            Source::values(vec![1, 2, 3]),
            move |acc: u32, v: u32, _, _| {
                log.borrow_mut().push(v);
                value(acc + v)
            },
            Resolution::Value(0),
        );
        guard.push(0);
        total
    };
    drive(&engine);
    assert_eq!(total.value(), Some(6));
    assert_eq!(*seen.borrow(), vec![0, 1, 2, 3]);
}
