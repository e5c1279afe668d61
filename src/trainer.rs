//! 训练器
//!
//! 多目标训练：每个输出头的损失乘以各自的权重求和，再加上 L2 正则项。
//! 一个训练步依次做前向、数值检查、反向、全局范数裁剪和参数更新；
//! 任何一项损失或梯度出现 NaN / Inf 时整步放弃，参数保持不变。

use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::autograd::{Graph, Var};
use crate::dataset::Dataset;
use crate::early_stopping::{EarlyStopping, EarlyStoppingConfig};
use crate::error::{config_err, Result, Seq2SeqError};
use crate::gradient_clip::clip_global_norm;
use crate::metrics::Evaluator;
use crate::model::{HeadRef, Seq2SeqModel};
use crate::optimizer::{Optimizer, OptimizerConfig};
use crate::params::ParamStore;
use crate::runner::{CancellationToken, Runner};

/// 训练配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// 参与训练的输出头（序列解码器或对齐解码器）的名字
    pub decoders: Vec<String>,
    /// 与 `decoders` 一一对应；缺省时全部为 1
    #[serde(default)]
    pub decoder_weights: Option<Vec<f32>>,
    #[serde(default)]
    pub l2_weight: f32,
    /// 梯度全局范数上限
    pub clip_norm: f32,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    /// dropout / 噪声的随机种子
    #[serde(default)]
    pub seed: u64,
}

/// 一个训练步的结果
#[derive(Debug, Clone, PartialEq)]
pub struct TrainStepReport {
    /// `Σ wᵢ·Lᵢ + l2_weight·L2`
    pub total_loss: f32,
    /// 每个输出头未加权的损失，顺序同配置
    pub decoder_losses: Vec<f32>,
    /// 正则化参数的平方和
    pub l2: f32,
    /// 裁剪前的全局梯度范数
    pub grad_norm: f32,
    pub clipped: bool,
}

/// 目标函数在图上的结果
struct Objective {
    total: Var,
    decoder_losses: Vec<f32>,
    l2: f32,
}

/// 多目标训练器
#[derive(Debug)]
pub struct Trainer {
    config: TrainerConfig,
    heads: Vec<HeadRef>,
    weights: Vec<f32>,
    optimizer: Box<dyn Optimizer>,
    rng: StdRng,
    steps: usize,
    non_finite_steps: usize,
}

impl Trainer {
    /// 把输出头名字解析为模型中的下标；列表长度不一致或名字未知都是配置错误
    pub fn new(config: TrainerConfig, model: &Seq2SeqModel) -> Result<Self> {
        if config.decoders.is_empty() {
            return Err(config_err!("trainer needs at least one decoder"));
        }
        let weights = match &config.decoder_weights {
            Some(w) if w.len() != config.decoders.len() => {
                return Err(config_err!(
                    "{} decoder(s) but {} weight(s)",
                    config.decoders.len(),
                    w.len()
                ));
            }
            Some(w) => w.clone(),
            None => vec![1.0; config.decoders.len()],
        };
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(config_err!("decoder weights must be finite and non-negative"));
        }
        if !(config.l2_weight.is_finite() && config.l2_weight >= 0.0) {
            return Err(config_err!("invalid l2 weight {}", config.l2_weight));
        }
        if !(config.clip_norm.is_finite() && config.clip_norm > 0.0) {
            return Err(config_err!("clip norm must be positive, got {}", config.clip_norm));
        }
        if config.optimizer.learning_rate() <= 0.0 {
            return Err(config_err!("learning rate must be positive"));
        }

        let heads = config
            .decoders
            .iter()
            .map(|name| {
                model
                    .head(name)
                    .ok_or_else(|| config_err!("trainer refers to unknown decoder `{}`", name))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            optimizer: config.optimizer.build(),
            rng: StdRng::seed_from_u64(config.seed),
            config,
            heads,
            weights,
            steps: 0,
            non_finite_steps: 0,
        })
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn optimizer(&self) -> &dyn Optimizer {
        self.optimizer.as_ref()
    }

    /// 成功执行的训练步数
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// 因非有限值而放弃的训练步数
    pub fn non_finite_steps(&self) -> usize {
        self.non_finite_steps
    }

    fn objective(&self, g: &mut Graph, model: &Seq2SeqModel, batch: &Dataset) -> Result<Objective> {
        let losses = model.losses(g, batch, &self.heads)?;
        let decoder_losses: Vec<f32> = losses.iter().map(|&l| g.scalar(l)).collect();

        for (name, loss) in self.config.decoders.iter().zip(&decoder_losses) {
            if !loss.is_finite() {
                return Err(Seq2SeqError::NonFiniteLoss(format!("loss of `{}`", name)));
            }
        }

        // 权重为 0 的项不进入总损失
        let mut terms: Vec<Var> = losses
            .iter()
            .zip(&self.weights)
            .filter(|(_, w)| **w != 0.0)
            .map(|(&l, &w)| g.scale(l, w))
            .collect();

        let l2 = model.params.l2_squared();
        if self.config.l2_weight != 0.0 {
            let squares: Vec<Var> = model
                .params
                .iter()
                .filter(|(_, p)| p.regularize)
                .map(|(id, _)| {
                    let v = g.param(&model.params, id);
                    g.sum_squares(v)
                })
                .collect();
            if !squares.is_empty() {
                let sum = g.add_n(&squares)?;
                terms.push(g.scale(sum, self.config.l2_weight));
            }
        }

        let total = if terms.is_empty() {
            g.zeros((1, 1))
        } else {
            g.add_n(&terms)?
        };
        if !g.scalar(total).is_finite() {
            return Err(Seq2SeqError::NonFiniteLoss("total loss".into()));
        }

        Ok(Objective {
            total,
            decoder_losses,
            l2,
        })
    }

    /// 只做前向（推理模式，无 dropout），返回总损失和各项损失
    pub fn evaluate_loss(&self, model: &Seq2SeqModel, batch: &Dataset) -> Result<(f32, Vec<f32>)> {
        let mut g = Graph::inference();
        let objective = self.objective(&mut g, model, batch)?;
        Ok((g.scalar(objective.total), objective.decoder_losses))
    }

    /// 执行一个训练步
    pub fn train_step(&mut self, model: &mut Seq2SeqModel, batch: &Dataset) -> Result<TrainStepReport> {
        let mut g = Graph::training(self.rng.gen());

        let result = self.objective(&mut g, model, batch).and_then(|objective| {
            let grads = g.backward(objective.total)?;
            if grads.iter().any(|(_, grad)| grad.iter().any(|v| !v.is_finite())) {
                return Err(Seq2SeqError::NonFiniteLoss("gradients".into()));
            }
            Ok((objective, grads))
        });

        let (objective, mut grads) = match result {
            Ok(ok) => ok,
            Err(e) => {
                if e.is_step_local() {
                    self.non_finite_steps += 1;
                    warn!(
                        "training step {} aborted: {} ({} aborted so far)",
                        self.steps + self.non_finite_steps,
                        e,
                        self.non_finite_steps
                    );
                }
                return Err(e);
            }
        };

        let clip = clip_global_norm(&mut grads, self.config.clip_norm);
        self.optimizer.apply(&mut model.params, &grads);
        self.steps += 1;

        let report = TrainStepReport {
            total_loss: g.scalar(objective.total),
            decoder_losses: objective.decoder_losses,
            l2: objective.l2,
            grad_norm: clip.norm,
            clipped: clip.clipped(),
        };
        debug!(
            "step {}: loss {:.6}, grad norm {:.4}{}",
            self.steps,
            report.total_loss,
            report.grad_norm,
            if report.clipped { " (clipped)" } else { "" }
        );
        Ok(report)
    }
}

/// 训练循环配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingLoopConfig {
    pub epochs: usize,
    pub batch_size: usize,
    #[serde(default = "default_shuffle")]
    pub shuffle: bool,
    #[serde(default)]
    pub seed: u64,
}

fn default_shuffle() -> bool {
    true
}

/// 每个 epoch 之后的验证设置
pub struct Validation {
    pub runner: Box<dyn Runner>,
    /// 参考译文所在的序列
    pub reference_series: String,
    /// 第一个评估器的分数用于早停
    pub evaluators: Vec<Box<dyn Evaluator>>,
    pub early_stopping: Option<EarlyStoppingConfig>,
}

/// 一个 epoch 的统计
#[derive(Debug, Clone, PartialEq)]
pub struct EpochReport {
    pub epoch: usize,
    /// 成功的训练步的平均总损失
    pub mean_loss: f32,
    pub steps: usize,
    pub skipped_steps: usize,
    /// (评估器名, 分数)
    pub validation: Vec<(String, f32)>,
}

/// 整个训练的结果
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    pub epochs: Vec<EpochReport>,
    pub stopped_early: bool,
    /// 恢复了最佳参数时为最佳 epoch
    pub restored_epoch: Option<usize>,
}

/// 训练循环
pub struct TrainingLoop {
    config: TrainingLoopConfig,
    validation: Option<Validation>,
    rng: StdRng,
}

impl TrainingLoop {
    pub fn new(config: TrainingLoopConfig) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(config_err!("batch size must be positive"));
        }
        Ok(Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            validation: None,
        })
    }

    pub fn with_validation(mut self, validation: Validation) -> Result<Self> {
        if validation.evaluators.is_empty() && validation.early_stopping.is_some() {
            return Err(config_err!("early stopping needs at least one evaluator"));
        }
        self.validation = Some(validation);
        Ok(self)
    }

    pub fn run(
        &mut self,
        trainer: &mut Trainer,
        model: &mut Seq2SeqModel,
        train: &Dataset,
        validation_data: Option<&Dataset>,
    ) -> Result<TrainingReport> {
        let mut early = self
            .validation
            .as_ref()
            .and_then(|v| v.early_stopping)
            .map(EarlyStopping::new);
        let mut best_params: Option<ParamStore> = None;
        let mut report = TrainingReport {
            epochs: Vec::new(),
            stopped_early: false,
            restored_epoch: None,
        };

        for epoch in 1..=self.config.epochs {
            let batches = if self.config.shuffle {
                train.shuffled_batches(self.config.batch_size, &mut self.rng)
            } else {
                train.batches(self.config.batch_size)
            };

            let mut loss_sum = 0.0;
            let mut steps = 0;
            let mut skipped = 0;
            for batch in &batches {
                match trainer.train_step(model, batch) {
                    Ok(step) => {
                        loss_sum += step.total_loss;
                        steps += 1;
                    }
                    Err(e) if e.is_step_local() => skipped += 1,
                    Err(e) => return Err(e),
                }
            }
            let mean_loss = if steps > 0 { loss_sum / steps as f32 } else { f32::NAN };

            let scores = match (&self.validation, validation_data) {
                (Some(v), Some(data)) => validate(v, model, data)?,
                _ => Vec::new(),
            };

            info!(
                "epoch {}/{}: mean loss {:.6} over {} step(s), {} skipped{}",
                epoch,
                self.config.epochs,
                mean_loss,
                steps,
                skipped,
                scores
                    .iter()
                    .map(|(name, score)| format!(", {} {:.4}", name, score))
                    .collect::<String>()
            );

            report.epochs.push(EpochReport {
                epoch,
                mean_loss,
                steps,
                skipped_steps: skipped,
                validation: scores.clone(),
            });

            if let (Some(es), Some((_, score))) = (early.as_mut(), scores.first()) {
                let stop = es.update(*score, epoch);
                if es.improved() {
                    best_params = Some(model.params.clone());
                }
                if stop {
                    report.stopped_early = true;
                    if es.should_restore_best_weights() {
                        if let Some(best) = best_params.take() {
                            info!("restoring parameters from epoch {}", es.best_epoch());
                            model.params = best;
                            report.restored_epoch = Some(es.best_epoch());
                        }
                    }
                    break;
                }
            }
        }

        Ok(report)
    }
}

fn validate(validation: &Validation, model: &Seq2SeqModel, data: &Dataset) -> Result<Vec<(String, f32)>> {
    let output = validation
        .runner
        .run_dataset(&[model], data, &CancellationToken::new())?;
    let hypotheses = output.decoded();
    let references = data.series(&validation.reference_series)?;
    Ok(validation
        .evaluators
        .iter()
        .map(|e| (e.name().to_string(), e.evaluate(&hypotheses, references)))
        .collect())
}
