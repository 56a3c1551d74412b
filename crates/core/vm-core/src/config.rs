//! 统一配置管理
//!
//! 运行时的每个可调参数（层级阈值、桩生成插桩、代码缓存容量）都是实现了
//! [`Config`] 的 serde 结构体。启动时用 [`Constraints`] 按声明的范围统一校验一次，
//! 之后使用方只读取已校验的值。

use std::fmt::Display;

use serde::Serialize;

/// 统一配置 Trait
///
/// ```rust,ignore
/// use vm_core::config::{Config, ConfigError, Constraints};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct QueueConfig {
///     pub threshold: u32,
/// }
///
/// impl Config for QueueConfig {
///     fn validate(&self) -> Result<(), ConfigError> {
///         let mut c = Constraints::new("QueueConfig");
///         c.range("threshold", self.threshold, 0, 1000);
///         c.finish()
///     }
///
///     fn defaults() -> Self {
///         Self { threshold: 100 }
///     }
/// }
/// ```
pub trait Config: Serialize + serde::de::DeserializeOwned {
    /// 验证配置的有效性
    ///
    /// # 错误
    ///
    /// 返回 `ConfigError::Validation`，列出所有违反的约束
    fn validate(&self) -> Result<(), ConfigError>;

    /// 获取默认配置
    fn defaults() -> Self;

    /// 合并两个配置
    ///
    /// `self` 为基础配置，`other` 优先级更高。默认实现直接采用 `other`。
    fn merge(&self, other: &Self) -> Result<Self, ConfigError>
    where
        Self: Sized + Clone,
    {
        Ok(other.clone())
    }

    /// 从 TOML 字符串加载配置
    fn from_toml(toml: &str) -> Result<Self, ConfigError>
    where
        Self: Sized,
    {
        toml::from_str(toml).map_err(|e| ConfigError::Parse(format!("TOML parse error: {}", e)))
    }

    /// 从 JSON 字符串加载配置
    fn from_json(json: &str) -> Result<Self, ConfigError>
    where
        Self: Sized,
    {
        serde_json::from_str(json)
            .map_err(|e| ConfigError::Parse(format!("JSON parse error: {}", e)))
    }

    /// 将配置序列化为 TOML
    fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(format!("TOML serialize error: {}", e)))
    }

    /// 将配置序列化为 JSON
    fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(format!("JSON serialize error: {}", e)))
    }
}

/// 配置错误类型
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// 无效的配置
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// 配置合并冲突
    #[error("Configuration merge conflict: {0}")]
    MergeConflict(String),

    /// 解析错误
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// 序列化错误
    #[error("Failed to serialize configuration: {0}")]
    Serialize(String),

    /// IO 错误
    #[error("IO error: {0}")]
    Io(String),

    /// 验证错误
    #[error("Validation failed: {0}")]
    Validation(String),

    /// 当前模式不支持的配置项
    #[error("Not supported: {0}")]
    NotSupported(String),
}

/// Collects constraint violations for one configuration struct so that every
/// bad value is reported in a single error.
#[derive(Debug)]
pub struct Constraints {
    owner: &'static str,
    violations: Vec<String>,
}

impl Constraints {
    pub fn new(owner: &'static str) -> Self {
        Self {
            owner,
            violations: Vec::new(),
        }
    }

    /// `min <= value <= max`
    pub fn range<T>(&mut self, name: &str, value: T, min: T, max: T) -> &mut Self
    where
        T: PartialOrd + Display + Copy,
    {
        if value < min || value > max {
            self.violations.push(format!(
                "{} = {} is outside the allowed range [{} ... {}]",
                name, value, min, max
            ));
        }
        self
    }

    /// `value >= min`
    pub fn at_least<T>(&mut self, name: &str, value: T, min: T) -> &mut Self
    where
        T: PartialOrd + Display + Copy,
    {
        if value < min {
            self.violations
                .push(format!("{} = {} must be at least {}", name, value, min));
        }
        self
    }

    /// `lower <= upper` for two related flags.
    pub fn ordered<T>(&mut self, lower: (&str, T), upper: (&str, T)) -> &mut Self
    where
        T: PartialOrd + Display + Copy,
    {
        if lower.1 > upper.1 {
            self.violations.push(format!(
                "{} ({}) must be less than or equal to {} ({})",
                lower.0, lower.1, upper.0, upper.1
            ));
        }
        self
    }

    pub fn check(&mut self, ok: bool, message: impl Into<String>) -> &mut Self {
        if !ok {
            self.violations.push(message.into());
        }
        self
    }

    pub fn violations(&self) -> &[String] {
        &self.violations
    }

    pub fn finish(&self) -> Result<(), ConfigError> {
        if self.violations.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(format!(
                "{}: {}",
                self.owner,
                self.violations.join("; ")
            )))
        }
    }
}

/// 配置构建器
///
/// 按优先级合并：defaults < file < overrides，然后统一验证。
pub struct ConfigBuilder<C: Config + Clone> {
    base: C,
    overrides: Vec<C>,
}

impl<C: Config + Clone> Default for ConfigBuilder<C> {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl<C: Config + Clone> ConfigBuilder<C> {
    /// 使用默认配置
    pub fn with_defaults() -> Self {
        Self {
            base: C::defaults(),
            overrides: Vec::new(),
        }
    }

    /// 从文件加载配置
    pub fn with_file(mut self, path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("Failed to read {}: {}", path, e)))?;

        let config = C::from_toml(&content)?;
        self.overrides.push(config);
        Ok(self)
    }

    /// 从 TOML 字符串加载配置
    pub fn with_toml(mut self, toml: &str) -> Result<Self, ConfigError> {
        self.overrides.push(C::from_toml(toml)?);
        Ok(self)
    }

    /// 添加配置覆盖
    pub fn with_override(mut self, config: C) -> Self {
        self.overrides.push(config);
        self
    }

    /// 构建最终配置
    pub fn build(mut self) -> Result<C, ConfigError> {
        let mut current = self.base;

        for override_config in self.overrides.drain(..) {
            current = current.merge(&override_config)?;
        }

        current.validate()?;
        Ok(current)
    }
}
