//! 早停机制
//!
//! 基于验证集指标（如 BLEU）的早停。

use log::info;
use serde::{Deserialize, Serialize};

/// 早停模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EarlyStoppingMode {
    /// 指标越小越好（如 loss）
    Min,
    /// 指标越大越好（如 BLEU）
    Max,
}

impl EarlyStoppingMode {
    /// 判断新指标是否优于旧指标
    pub fn is_better(&self, old_value: f32, new_value: f32, min_delta: f32) -> bool {
        match self {
            EarlyStoppingMode::Min => new_value < old_value - min_delta,
            EarlyStoppingMode::Max => new_value > old_value + min_delta,
        }
    }

    pub fn initial_value(&self) -> f32 {
        match self {
            EarlyStoppingMode::Min => f32::INFINITY,
            EarlyStoppingMode::Max => f32::NEG_INFINITY,
        }
    }
}

/// 早停配置
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EarlyStoppingConfig {
    /// 验证指标连续多少个 epoch 没有改善就停止
    pub patience: usize,

    /// 只有改善幅度超过此值才算改善
    #[serde(default)]
    pub min_delta: f32,

    pub mode: EarlyStoppingMode,

    /// 停止后是否恢复最佳参数
    #[serde(default = "default_restore")]
    pub restore_best_weights: bool,
}

fn default_restore() -> bool {
    true
}

impl EarlyStoppingConfig {
    pub fn new(patience: usize, mode: EarlyStoppingMode) -> Self {
        Self {
            patience,
            min_delta: 0.0,
            mode,
            restore_best_weights: true,
        }
    }

    pub fn with_min_delta(mut self, min_delta: f32) -> Self {
        self.min_delta = min_delta;
        self
    }

    /// 最小化模式（用于 loss）
    pub fn min(patience: usize) -> Self {
        Self::new(patience, EarlyStoppingMode::Min)
    }

    /// 最大化模式（用于 BLEU、准确率）
    pub fn max(patience: usize) -> Self {
        Self::new(patience, EarlyStoppingMode::Max)
    }
}

/// 早停器
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    config: EarlyStoppingConfig,
    best_score: f32,
    epochs_no_improve: usize,
    best_epoch: usize,
    stopped_epoch: Option<usize>,
}

impl EarlyStopping {
    pub fn new(config: EarlyStoppingConfig) -> Self {
        Self {
            best_score: config.mode.initial_value(),
            epochs_no_improve: 0,
            best_epoch: 0,
            stopped_epoch: None,
            config,
        }
    }

    /// 记录一个 epoch 的验证指标，返回是否应该停止
    pub fn update(&mut self, current_score: f32, epoch: usize) -> bool {
        if self.stopped_epoch.is_some() {
            return true;
        }

        if self.config.mode.is_better(self.best_score, current_score, self.config.min_delta) {
            self.best_score = current_score;
            self.epochs_no_improve = 0;
            self.best_epoch = epoch;
        } else {
            self.epochs_no_improve += 1;
        }

        if self.epochs_no_improve >= self.config.patience {
            self.stopped_epoch = Some(epoch);
            info!("{}", self.stop_reason());
            return true;
        }

        false
    }

    /// 最近一次 `update` 是否刷新了最佳值
    pub fn improved(&self) -> bool {
        self.epochs_no_improve == 0
    }

    pub fn best_score(&self) -> f32 {
        self.best_score
    }

    pub fn best_epoch(&self) -> usize {
        self.best_epoch
    }

    pub fn stopped_epoch(&self) -> Option<usize> {
        self.stopped_epoch
    }

    pub fn should_stop(&self) -> bool {
        self.stopped_epoch.is_some()
    }

    pub fn should_restore_best_weights(&self) -> bool {
        self.config.restore_best_weights && self.stopped_epoch.is_some()
    }

    pub fn remaining_patience(&self) -> usize {
        self.config.patience.saturating_sub(self.epochs_no_improve)
    }

    pub fn stop_reason(&self) -> String {
        if self.stopped_epoch.is_none() {
            return "training is ongoing".to_string();
        }

        format!(
            "no improvement for {} epochs (patience {}), best score {:.6} at epoch {}",
            self.epochs_no_improve, self.config.patience, self.best_score, self.best_epoch
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_comparison() {
        assert!(EarlyStoppingMode::Min.is_better(1.0, 0.5, 0.0));
        assert!(!EarlyStoppingMode::Min.is_better(1.0, 0.95, 0.1));
        assert!(EarlyStoppingMode::Max.is_better(0.5, 0.8, 0.1));
        assert!(!EarlyStoppingMode::Max.is_better(0.5, 0.5, 0.0));
    }

    #[test]
    fn test_stops_after_patience() {
        let mut es = EarlyStopping::new(EarlyStoppingConfig::max(2));

        assert!(!es.update(10.0, 1));
        assert!(es.improved());
        assert!(!es.update(12.0, 2));
        assert!(!es.update(11.0, 3));
        assert!(!es.improved());
        assert_eq!(es.remaining_patience(), 1);
        assert!(es.update(11.5, 4));

        assert_eq!(es.best_epoch(), 2);
        assert_eq!(es.best_score(), 12.0);
        assert_eq!(es.stopped_epoch(), Some(4));
        assert!(es.should_restore_best_weights());
        // 停止后一直保持停止
        assert!(es.update(100.0, 5));
    }

    #[test]
    fn test_min_delta() {
        let mut es = EarlyStopping::new(EarlyStoppingConfig::min(1).with_min_delta(0.1));
        assert!(!es.update(1.0, 1));
        assert!(es.update(0.95, 2));
        assert!(es.stop_reason().contains("patience 1"));
    }
}
