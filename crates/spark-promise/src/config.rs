//! 引擎配置。
//!
//! # 设计背景（Why）
//! - 长栈追踪与未处理拒绝告警都有运行期成本，生产与调试环境需要不同取值；
//! - 配置既可以随宿主的配置文件反序列化得到，也可以由环境变量覆盖，便于在不改代码的情况下排障。
//!
//! # 契约说明（What）
//! - [`EngineConfig`] 的所有字段都有默认值，反序列化时缺省字段回落到 [`Default`]；
//! - [`EngineConfig::from_env`] 读取下列环境变量：
//!   - `SPARK_PROMISE_DEBUG`：同时开启长栈追踪与告警；
//!   - `SPARK_PROMISE_LONG_STACK_TRACES`：单独控制长栈追踪；
//!   - `SPARK_PROMISE_WARNINGS`：控制默认的未处理拒绝告警；
//!   - `SPARK_PROMISE_QUEUE_CAPACITY`：调度队列的初始容量。
//! - 专项变量优先于 `SPARK_PROMISE_DEBUG`；取值非法时返回 [`ConfigError`]，而不是静默忽略。

use std::borrow::Cow;

use thiserror::Error;

pub const ENV_DEBUG: &str = "SPARK_PROMISE_DEBUG";
pub const ENV_LONG_STACK_TRACES: &str = "SPARK_PROMISE_LONG_STACK_TRACES";
pub const ENV_WARNINGS: &str = "SPARK_PROMISE_WARNINGS";
pub const ENV_QUEUE_CAPACITY: &str = "SPARK_PROMISE_QUEUE_CAPACITY";

/// 引擎运行期配置。
///
/// - `long_stack_traces`：为每个 Promise 记录创建位置，并把拒绝与首次落入的位置关联；
/// - `warnings`：未注册钩子时，以 `tracing::warn!` 报告可能未处理的拒绝；
/// - `initial_queue_capacity`：调度器两条队列的初始容量；
/// - `max_trace_depth`：渲染长栈追踪时保留的最大帧数。
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub long_stack_traces: bool,
    pub warnings: bool,
    pub initial_queue_capacity: usize,
    pub max_trace_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            long_stack_traces: false,
            warnings: true,
            initial_queue_capacity: crate::ring::MIN_CAPACITY,
            max_trace_depth: 32,
        }
    }
}

impl EngineConfig {
    pub fn with_long_stack_traces(mut self, enabled: bool) -> Self {
        self.long_stack_traces = enabled;
        self
    }

    pub fn with_warnings(mut self, enabled: bool) -> Self {
        self.warnings = enabled;
        self
    }

    pub fn with_initial_queue_capacity(mut self, capacity: usize) -> Self {
        self.initial_queue_capacity = capacity;
        self
    }

    pub fn with_max_trace_depth(mut self, depth: usize) -> Self {
        self.max_trace_depth = depth;
        self
    }

    /// 以默认值为基础，应用进程环境变量。
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 以默认值为基础，应用 `lookup` 提供的变量。
    ///
    /// # 逻辑解析（How）
    /// 先应用 `SPARK_PROMISE_DEBUG`，再让专项变量覆盖它，最后解析队列容量。
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(raw) = lookup(ENV_DEBUG) {
            let debug = parse_flag(ENV_DEBUG, &raw)?;
            config.long_stack_traces = debug;
            config.warnings = debug || config.warnings;
        }
        if let Some(raw) = lookup(ENV_LONG_STACK_TRACES) {
            config.long_stack_traces = parse_flag(ENV_LONG_STACK_TRACES, &raw)?;
        }
        if let Some(raw) = lookup(ENV_WARNINGS) {
            config.warnings = parse_flag(ENV_WARNINGS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_QUEUE_CAPACITY) {
            config.initial_queue_capacity =
                raw.trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidNumber {
                        key: ENV_QUEUE_CAPACITY,
                        value: raw.clone(),
                    })?;
        }
        Ok(config)
    }
}

fn parse_flag(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidFlag {
            key,
            value: Cow::Owned(raw.to_owned()),
        }),
    }
}

/// 配置解析错误。
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("invalid value `{value}` for {key}: expected a boolean flag")]
    InvalidFlag {
        key: &'static str,
        value: Cow<'static, str>,
    },
    #[error("invalid value `{value}` for {key}: expected a non-negative integer")]
    InvalidNumber { key: &'static str, value: String },
}
