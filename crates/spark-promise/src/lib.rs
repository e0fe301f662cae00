#![deny(unsafe_code)]
#![doc = "spark-promise: 单线程协作式 Promise 引擎。"]
#![doc = ""]
#![doc = "== 执行模型 =="]
#![doc = "所有延续都经由引擎的微任务调度器异步运行：快队列承载延续，慢队列承载同一 tick 末尾的检查（未处理拒绝、致命错误、取消）。"]
#![doc = "宿主通过 [`Engine::run_tick`]、[`Engine::run_until_idle`] 或 [`Engine::run_to_completion`] 驱动引擎；可注入 [`TickHook`] 以便在有工作时被通知。"]
#![doc = ""]
#![doc = "== 线程约束 =="]
#![doc = "引擎与 Promise 都是 `!Send`：内部以 `Rc`/`RefCell` 实现，只能在创建它们的线程上使用。"]

//! # 快速上手
//!
//! ```
//! use spark_promise::{Engine, Resolution};
//!
//! let engine = Engine::new();
//! let doubled = engine
//!     .resolve(21)
//!     .then(|value| Ok(Resolution::Value(value * 2)));
//! engine.run_until_idle().expect("no fatal rejection");
//! assert_eq!(doubled.value(), Some(42));
//! ```

pub mod adapt;
mod cancel;
pub mod combinator;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod ids;
pub mod promise;
pub mod ring;
pub mod scheduler;
pub mod time;

pub use adapt::{Callback, MultiCallback, PromiseFuture, Promisified};
pub use combinator::{Input, KeyedSource, MapOptions, Source};
pub use config::{ConfigError, EngineConfig};
pub use diagnostics::{FatalHook, RejectionHook, TraceFrame};
pub use engine::{Engine, EngineBuilder};
pub use error::{EngineError, ErrorFilter, ErrorKind, PromiseError, Rejection};
pub use ids::{PromiseId, TimerId};
pub use promise::{Bound, Inspection, Promise, Resolution, Resolver, Settled, Thenable};
pub use ring::RingBuffer;
pub use scheduler::{ManualTick, Scheduler, TickHook, TickReport};
pub use time::{Clock, ManualClock, SystemClock};
