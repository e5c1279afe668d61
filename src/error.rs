//! 错误类型
//!
//! 构造期错误（配置不一致）直接终止整个运行；
//! 单步数值错误只中止当前训练步，由上层计数。

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Seq2SeqError {
    /// batch / 序列维度不一致
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// 损失或 logits 中出现 NaN / Inf
    #[error("non-finite value in {0}")]
    NonFiniteLoss(String),

    /// 配置前后矛盾（仅在构造期出现）
    #[error("inconsistent configuration: {0}")]
    ConfigInconsistency(String),

    /// 数据序列格式错误
    #[error("malformed data: {0}")]
    Data(String),

    /// 在两个 batch 之间被取消
    #[error("run cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("binary serialization error: {0}")]
    Bincode(#[from] bincode::Error),
}

impl Seq2SeqError {
    /// 是否为只影响当前训练步的数值错误
    pub fn is_step_local(&self) -> bool {
        matches!(self, Seq2SeqError::NonFiniteLoss(_))
    }
}

pub type Result<T> = std::result::Result<T, Seq2SeqError>;

/// 构造 `ShapeMismatch` 的便捷宏
macro_rules! shape_err {
    ($($arg:tt)*) => {
        $crate::error::Seq2SeqError::ShapeMismatch(format!($($arg)*))
    };
}

/// 构造 `ConfigInconsistency` 的便捷宏
macro_rules! config_err {
    ($($arg:tt)*) => {
        $crate::error::Seq2SeqError::ConfigInconsistency(format!($($arg)*))
    };
}

pub(crate) use config_err;
pub(crate) use shape_err;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_local_classification() {
        assert!(Seq2SeqError::NonFiniteLoss("loss".into()).is_step_local());
        assert!(!Seq2SeqError::ShapeMismatch("x".into()).is_step_local());
        assert!(!Seq2SeqError::Cancelled.is_step_local());
    }

    #[test]
    fn test_macros_format() {
        let err = shape_err!("expected {} got {}", 3, 4);
        assert_eq!(err.to_string(), "shape mismatch: expected 3 got 4");
        let err = config_err!("bad {}", "weights");
        assert!(matches!(err, Seq2SeqError::ConfigInconsistency(_)));
    }
}
