//! 推理 runner
//!
//! runner 驱动一个或多个训练好的模型做自回归解码，产出 token 序列、每步对数概率
//! 和注意力矩阵。greedy 与 beam search 共用这里的集成打分函数：多个模型的分布
//! 先对概率求算术平均，再取对数。单模型也走同一条路径，因此单模型和
//! “同一模型复制两份”的集成得到逐位相同的分数。
//!
//! 取消只发生在两个 batch 之间，正在解码的 batch 总会完整结束。
//!
//! `<pad>` 和 `<s>` 不参与选择，永远不会被生成；对数概率仍然是完整分布上的值。

use log::{debug, info, warn};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::beam_search::{BeamSearchConfig, BeamSearchRunner};
use crate::dataset::{Dataset, Sentence};
use crate::decoder::Decoder;
use crate::error::{config_err, Result, Seq2SeqError};
use crate::model::Seq2SeqModel;
use crate::tensor::{argmax, TensorExt};
use crate::vocabulary::{END_ID, PAD_ID, START_ID};

/// 取消令牌：在 batch 之间检查
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// n-best 列表中的一个假设
#[derive(Debug, Clone, PartialEq)]
pub struct Hypothesis {
    /// 不含 `</s>`
    pub ids: Vec<usize>,
    /// 排序用的分数（可能经过长度归一化）
    pub score: f64,
    /// 是否以 `</s>` 结束
    pub finished: bool,
}

/// 一个输入句子的解码结果
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSentence {
    /// 输出 id，不含 `</s>`
    pub ids: Vec<usize>,
    pub tokens: Sentence,
    /// 累计对数概率（beam search 时为排序分数）
    pub score: f64,
    /// 每个生成 token（含 `</s>`）的对数概率
    pub token_log_probs: Vec<f32>,
    /// `[steps, src_len]`，第一个注意力的权重；解码器没有注意力时列数为 0
    pub attention: Array2<f32>,
    /// 到达最大长度仍未生成 `</s>`
    pub unterminated: bool,
    /// beam search 的 n-best 列表（greedy 为空）
    pub n_best: Vec<Hypothesis>,
}

/// runner 在整个数据集上的输出
#[derive(Debug, Clone, Default)]
pub struct RunnerOutput {
    pub output_series: String,
    pub sentences: Vec<DecodedSentence>,
    /// 被取消时只包含已完成的 batch
    pub cancelled: bool,
}

impl RunnerOutput {
    pub fn decoded(&self) -> Vec<Sentence> {
        self.sentences.iter().map(|s| s.tokens.clone()).collect()
    }

    pub fn unterminated_count(&self) -> usize {
        self.sentences.iter().filter(|s| s.unterminated).count()
    }

    /// 被取消的运行转换为 `Cancelled` 错误，部分结果被丢弃
    pub fn into_completed(self) -> Result<Self> {
        if self.cancelled {
            return Err(Seq2SeqError::Cancelled);
        }
        Ok(self)
    }

    /// 写入数据集为输出序列登记的文件；被取消的运行不写出
    pub fn write_to(&self, dataset: &Dataset) -> Result<bool> {
        if self.cancelled {
            return Ok(false);
        }
        dataset.write_series(&self.output_series, &self.decoded())
    }
}

/// runner 类型
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerKind {
    #[default]
    Greedy,
    BeamSearch(BeamSearchConfig),
}

/// runner 配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// 输出序列名
    pub output_series: String,
    /// 每个模型中参与解码的解码器名字
    pub decoder: String,
    #[serde(default)]
    pub kind: RunnerKind,
    /// 覆盖解码器的 `max_output_len`
    #[serde(default)]
    pub max_output_len: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_batch_size() -> usize {
    32
}

impl RunnerConfig {
    pub fn build(&self) -> Result<Box<dyn Runner>> {
        if self.max_output_len == Some(0) || self.batch_size == 0 {
            return Err(config_err!("runner `{}` has a zero size", self.output_series));
        }
        let runner: Box<dyn Runner> = match self.kind {
            RunnerKind::Greedy => Box::new(GreedyRunner::new(self.clone())),
            RunnerKind::BeamSearch(beam) => Box::new(BeamSearchRunner::new(self.clone(), beam)?),
        };
        Ok(runner)
    }
}

/// runner 接口
pub trait Runner {
    fn config(&self) -> &RunnerConfig;

    /// 解码一个 batch
    fn run_batch(&self, models: &[&Seq2SeqModel], batch: &Dataset) -> Result<Vec<DecodedSentence>>;

    /// 逐 batch 解码整个数据集，在 batch 之间检查取消
    fn run_dataset(
        &self,
        models: &[&Seq2SeqModel],
        dataset: &Dataset,
        cancel: &CancellationToken,
    ) -> Result<RunnerOutput> {
        let config = self.config();
        let mut output = RunnerOutput {
            output_series: config.output_series.clone(),
            ..Default::default()
        };

        for (i, batch) in dataset.batches(config.batch_size).iter().enumerate() {
            if cancel.is_cancelled() {
                info!("runner `{}` cancelled before batch {}", config.output_series, i);
                output.cancelled = true;
                break;
            }
            output.sentences.extend(self.run_batch(models, batch)?);
        }

        let unterminated = output.unterminated_count();
        if unterminated > 0 {
            warn!(
                "runner `{}`: {} of {} outputs reached the length limit without `</s>`",
                config.output_series,
                unterminated,
                output.sentences.len()
            );
        }
        Ok(output)
    }
}

/// 参与解码的一个模型及其解码器
#[derive(Debug, Clone, Copy)]
pub(crate) struct Member<'a> {
    pub model: &'a Seq2SeqModel,
    pub decoder: &'a Decoder,
}

/// 在每个模型中找到同名解码器，并检查输出词表大小一致
pub(crate) fn resolve_members<'a>(models: &[&'a Seq2SeqModel], decoder: &str) -> Result<Vec<Member<'a>>> {
    if models.is_empty() {
        return Err(config_err!("runner needs at least one model"));
    }
    let members = models
        .iter()
        .map(|&model| {
            model
                .decoder(decoder)
                .map(|decoder| Member { model, decoder })
                .ok_or_else(|| config_err!("model has no decoder `{}`", decoder))
        })
        .collect::<Result<Vec<_>>>()?;

    let vocab_size = members[0].decoder.vocab_size();
    if members.iter().any(|m| m.decoder.vocab_size() != vocab_size) {
        return Err(config_err!(
            "ensembled decoders `{}` have different vocabulary sizes",
            decoder
        ));
    }
    Ok(members)
}

/// 集成打分：概率的算术平均取对数，`[batch, vocab]`
pub fn ensemble_log_probs(logits: &[Array2<f32>]) -> Result<Array2<f32>> {
    let first = logits
        .first()
        .ok_or_else(|| config_err!("no logits to ensemble"))?;
    if logits.iter().any(|l| !l.all_finite()) {
        return Err(Seq2SeqError::NonFiniteLoss("decoder logits".into()));
    }

    let mut mean = Array2::<f32>::zeros(first.dim());
    for l in logits {
        if l.dim() != first.dim() {
            return Err(crate::error::shape_err!(
                "ensemble logits {:?} vs {:?}",
                l.dim(),
                first.dim()
            ));
        }
        mean += &l.softmax_rows();
    }
    let n = logits.len() as f32;
    Ok(mean.mapv(|p| (p / n).max(f32::MIN_POSITIVE).ln()))
}

/// 解码时可以被选中的 token
pub(crate) fn is_emittable(token: usize) -> bool {
    token != PAD_ID && token != START_ID
}

/// 实际使用的最大输出长度
pub(crate) fn max_output_len(config: &RunnerConfig, decoder: &Decoder) -> usize {
    config.max_output_len.unwrap_or_else(|| decoder.max_output_len())
}

/// 把若干步的注意力行拼成 `[steps, src_len]`
pub(crate) fn stack_rows(rows: &[Vec<f32>], src_len: usize) -> Array2<f32> {
    let mut out = Array2::zeros((rows.len(), src_len));
    for (mut dst, src) in out.rows_mut().into_iter().zip(rows) {
        for (d, &s) in dst.iter_mut().zip(src) {
            *d = s;
        }
    }
    out
}

/// 贪心解码
#[derive(Debug, Clone)]
pub struct GreedyRunner {
    config: RunnerConfig,
}

impl GreedyRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }
}

impl Runner for GreedyRunner {
    fn config(&self) -> &RunnerConfig {
        &self.config
    }

    fn run_batch(&self, models: &[&Seq2SeqModel], batch: &Dataset) -> Result<Vec<DecodedSentence>> {
        if models.len() != 1 {
            return Err(config_err!(
                "greedy runner `{}` takes exactly one model, got {}",
                self.config.output_series,
                models.len()
            ));
        }
        let member = resolve_members(models, &self.config.decoder)?[0];
        let (model, decoder) = (member.model, member.decoder);
        let max_len = max_output_len(&self.config, decoder);

        let encoded = model.encode_for_inference(batch)?;
        let size = batch.len();
        let src_len = decoder
            .attention_encoder(0)
            .map_or(0, |e| encoded[e].source_len());

        let mut state = decoder.infer_initial_state(&model.params, &encoded)?;
        let mut prev = vec![START_ID; size];
        let mut finished = vec![false; size];
        let mut ids = vec![Vec::new(); size];
        let mut log_probs = vec![Vec::new(); size];
        let mut attention = vec![Vec::new(); size];

        for step in 0..max_len {
            if finished.iter().all(|&f| f) {
                debug!("greedy decoding finished after {} steps", step);
                break;
            }

            let out = decoder.infer_step(&model.params, &encoded, &prev, &state)?;
            let scores = ensemble_log_probs(std::slice::from_ref(&out.logits))?;

            for b in 0..size {
                if finished[b] {
                    prev[b] = END_ID;
                    continue;
                }
                let token = argmax(
                    scores
                        .row(b)
                        .iter()
                        .enumerate()
                        .map(|(t, &lp)| if is_emittable(t) { lp } else { f32::NEG_INFINITY }),
                );
                ids[b].push(token);
                log_probs[b].push(scores[[b, token]]);
                if let Some(weights) = out.attention.first() {
                    attention[b].push(weights.row(b).to_vec());
                }
                finished[b] = token == END_ID;
                prev[b] = token;
            }
            state = out.state;
        }

        let vocab = decoder.vocabulary();
        Ok((0..size)
            .map(|b| {
                let mut out_ids = std::mem::take(&mut ids[b]);
                if finished[b] {
                    out_ids.pop();
                }
                let score = log_probs[b].iter().map(|&lp| f64::from(lp)).sum();
                DecodedSentence {
                    tokens: vocab.decode(&out_ids),
                    ids: out_ids,
                    score,
                    token_log_probs: std::mem::take(&mut log_probs[b]),
                    attention: stack_rows(&attention[b], src_len),
                    unterminated: !finished[b],
                    n_best: Vec::new(),
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn test_cancellation_token_is_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_ensemble_of_duplicates_is_identical() {
        let logits = arr2(&[[0.3, -1.2, 2.0, 0.0], [5.0, 5.0, -3.0, 1.0]]);
        let single = ensemble_log_probs(&[logits.clone()]).unwrap();
        let double = ensemble_log_probs(&[logits.clone(), logits]).unwrap();
        assert_eq!(single, double);
        for row in single.rows() {
            let total: f32 = row.iter().map(|lp| lp.exp()).sum();
            assert!((total - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_ensemble_averages_probabilities() {
        let a = arr2(&[[10.0, 0.0]]);
        let b = arr2(&[[0.0, 10.0]]);
        let mixed = ensemble_log_probs(&[a, b]).unwrap();
        assert!((mixed[[0, 0]] - 0.5f32.ln()).abs() < 1e-4);
        assert!((mixed[[0, 1]] - 0.5f32.ln()).abs() < 1e-4);
    }

    #[test]
    fn test_non_finite_logits_rejected() {
        let bad = arr2(&[[f32::NAN, 0.0]]);
        assert!(matches!(
            ensemble_log_probs(&[bad]),
            Err(Seq2SeqError::NonFiniteLoss(_))
        ));
    }

    #[test]
    fn test_cancelled_output_is_an_error() {
        let done = RunnerOutput::default();
        assert!(done.into_completed().is_ok());

        let cancelled = RunnerOutput {
            cancelled: true,
            ..Default::default()
        };
        assert!(matches!(cancelled.into_completed(), Err(Seq2SeqError::Cancelled)));
    }

    #[test]
    fn test_special_ids_are_not_emitted() {
        assert!(!is_emittable(PAD_ID));
        assert!(!is_emittable(START_ID));
        assert!(is_emittable(END_ID));
        assert!(is_emittable(crate::vocabulary::UNK_ID));
    }

    #[test]
    fn test_stack_rows() {
        let stacked = stack_rows(&[vec![0.5, 0.5], vec![1.0, 0.0]], 2);
        assert_eq!(stacked, arr2(&[[0.5, 0.5], [1.0, 0.0]]));
        assert_eq!(stack_rows(&[], 3).dim(), (0, 3));
    }
}
