//! 循环编码器
//!
//! ```text
//! factor ids ──Embedding──▶ concat ──▶ GRU →  ─┐
//!                                     GRU ←  ─┴─▶ states[t] = [→h_t; ←h_t]
//!                                                  summary   = [→h_last; ←h_0]
//! ```
//!
//! 填充位置不更新隐状态（按掩码门控），输出状态在填充位置为 0，
//! 因此填充内容既不影响 summary 也不会泄漏到注意力中。
//! 全部为空句的 batch 展开一个完全被掩码的位置，summary 为 0。

use ndarray::Array2;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::autograd::{Graph, Var};
use crate::dataset::{Dataset, SequenceBatch};
use crate::error::{shape_err, Result};
use crate::layers::{Embedding, GruCell, RnnCellKind};
use crate::params::ParamStore;
use crate::tensor::TensorExt;
use crate::vocabulary::Vocabulary;

/// 输入因子：一个数据序列及其词表和嵌入维度
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FactorConfig {
    pub data_id: String,
    pub vocabulary: String,
    pub embedding_size: usize,
}

/// 编码器配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    pub name: String,
    pub factors: Vec<FactorConfig>,
    pub rnn_size: usize,
    #[serde(default)]
    pub cell: RnnCellKind,
    #[serde(default = "default_true")]
    pub bidirectional: bool,
    /// 包含可选的 `<s>` / `</s>`
    pub max_input_len: usize,
    #[serde(default)]
    pub add_start_symbol: bool,
    #[serde(default)]
    pub add_end_symbol: bool,
    #[serde(default = "default_keep_prob")]
    pub dropout_keep_prob: f32,
}

fn default_true() -> bool {
    true
}

pub(crate) fn default_keep_prob() -> f32 {
    1.0
}

/// 计算图中的编码结果
#[derive(Debug, Clone)]
pub struct EncodedVars {
    /// 每个时间步一个 `[batch, state_size]`
    pub states: Vec<Var>,
    /// `[batch, state_size]`
    pub summary: Var,
    /// `[batch, time]`
    pub mask: Array2<f32>,
}

impl EncodedVars {
    /// 取出数值，脱离计算图
    pub fn to_output(&self, g: &Graph) -> EncoderOutput {
        EncoderOutput {
            states: self.states.iter().map(|&s| g.value(s).clone()).collect(),
            summary: g.value(self.summary).clone(),
            mask: self.mask.clone(),
        }
    }
}

/// 脱离计算图的编码结果，推理时每个 batch 只计算一次
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderOutput {
    pub states: Vec<Array2<f32>>,
    pub summary: Array2<f32>,
    pub mask: Array2<f32>,
}

impl EncoderOutput {
    /// 作为常量放入新的计算图
    pub fn to_vars(&self, g: &mut Graph) -> EncodedVars {
        EncodedVars {
            states: self.states.iter().map(|s| g.constant(s.clone())).collect(),
            summary: g.constant(self.summary.clone()),
            mask: self.mask.clone(),
        }
    }

    /// 按 batch 下标挑选（可重复），用于 beam 展开
    pub fn select_rows(&self, rows: &[usize]) -> Self {
        Self {
            states: self.states.iter().map(|s| s.select_rows(rows)).collect(),
            summary: self.summary.select_rows(rows),
            mask: self.mask.select_rows(rows),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.summary.nrows()
    }

    pub fn source_len(&self) -> usize {
        self.mask.ncols()
    }

    /// 第 b 个句子的真实长度
    pub fn length(&self, b: usize) -> usize {
        self.mask.row(b).iter().filter(|&&m| m > 0.0).count()
    }
}

/// 循环编码器
#[derive(Debug, Clone)]
pub struct Encoder {
    pub config: EncoderConfig,
    factors: Vec<(Arc<Vocabulary>, Embedding)>,
    forward_cell: GruCell,
    backward_cell: Option<GruCell>,
}

impl Encoder {
    /// `vocabularies` 与 `config.factors` 一一对应
    pub fn new<R: Rng + ?Sized>(
        store: &mut ParamStore,
        config: EncoderConfig,
        vocabularies: Vec<Arc<Vocabulary>>,
        rng: &mut R,
    ) -> Result<Self> {
        if vocabularies.len() != config.factors.len() {
            return Err(crate::error::config_err!(
                "encoder `{}` has {} factors but {} vocabularies",
                config.name,
                config.factors.len(),
                vocabularies.len()
            ));
        }

        let mut factors = Vec::with_capacity(vocabularies.len());
        for (i, (factor, vocab)) in config.factors.iter().zip(vocabularies).enumerate() {
            let emb = Embedding::new(
                store,
                &format!("{}/embedding_{}", config.name, i),
                vocab.len(),
                factor.embedding_size,
                rng,
            )?;
            factors.push((vocab, emb));
        }

        let input_size: usize = config.factors.iter().map(|f| f.embedding_size).sum();
        let forward_cell = GruCell::new(
            store,
            &format!("{}/forward", config.name),
            config.cell,
            input_size,
            config.rnn_size,
            rng,
        )?;
        let backward_cell = if config.bidirectional {
            Some(GruCell::new(
                store,
                &format!("{}/backward", config.name),
                config.cell,
                input_size,
                config.rnn_size,
                rng,
            )?)
        } else {
            None
        };

        Ok(Self {
            config,
            factors,
            forward_cell,
            backward_cell,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// 输出状态维度
    pub fn state_size(&self) -> usize {
        if self.backward_cell.is_some() {
            2 * self.config.rnn_size
        } else {
            self.config.rnn_size
        }
    }

    /// 从数据集读取各因子并转换为 batch，超长部分截断到 `max_input_len`
    /// （按配置加上的 `<s>` / `</s>` 也算在内）
    pub fn feed(&self, dataset: &Dataset) -> Result<Vec<SequenceBatch>> {
        self.config
            .factors
            .iter()
            .zip(&self.factors)
            .map(|(factor, (vocab, _))| {
                let sentences = dataset.series(&factor.data_id)?;
                Ok(vocab.sentences_to_batch(
                    sentences,
                    self.config.max_input_len,
                    self.config.add_start_symbol,
                    self.config.add_end_symbol,
                ))
            })
            .collect()
    }

    /// 编码
    ///
    /// # 输入
    /// - `inputs`: 每个因子一个 batch，长度必须一致且不超过 `max_input_len`
    pub fn encode(&self, g: &mut Graph, store: &ParamStore, inputs: &[SequenceBatch]) -> Result<EncodedVars> {
        let first = inputs
            .first()
            .ok_or_else(|| shape_err!("encoder `{}` got no input factors", self.name()))?;
        if inputs.len() != self.factors.len() {
            return Err(shape_err!(
                "encoder `{}` expects {} factors, got {}",
                self.name(),
                self.factors.len(),
                inputs.len()
            ));
        }
        if inputs.iter().any(|b| b.lengths != first.lengths) {
            return Err(shape_err!("factor lengths differ in encoder `{}`", self.name()));
        }
        let max_len = first.max_len();
        if max_len > self.config.max_input_len {
            return Err(shape_err!(
                "batch length {} exceeds max_input_len {} of encoder `{}`",
                max_len,
                self.config.max_input_len,
                self.name()
            ));
        }
        // 全是空句
        let padded: Vec<SequenceBatch>;
        let inputs = if max_len == 0 {
            padded = inputs.iter().map(|b| b.padded_to(1)).collect();
            &padded[..]
        } else {
            inputs
        };
        let first = &inputs[0];
        let max_len = first.max_len();

        let batch = first.batch_size();
        let mut embedded = Vec::with_capacity(max_len);
        let mut masks = Vec::with_capacity(max_len);
        for t in 0..max_len {
            let mut parts = Vec::with_capacity(self.factors.len());
            for ((_, emb), input) in self.factors.iter().zip(inputs) {
                parts.push(emb.forward(g, store, &input.column(t))?);
            }
            let x = g.concat_cols(&parts)?;
            embedded.push(g.dropout(x, self.config.dropout_keep_prob)?);
            masks.push(g.constant(first.mask_column(t)));
        }

        let (forward_states, forward_last) =
            run_direction(g, store, &self.forward_cell, &embedded, &masks, batch, false)?;
        let (states, summary) = match &self.backward_cell {
            None => (forward_states, forward_last),
            Some(cell) => {
                let (backward_states, backward_last) =
                    run_direction(g, store, cell, &embedded, &masks, batch, true)?;
                let mut states = Vec::with_capacity(max_len);
                for (fw, bw) in forward_states.into_iter().zip(backward_states) {
                    states.push(g.concat_cols(&[fw, bw])?);
                }
                (states, g.concat_cols(&[forward_last, backward_last])?)
            }
        };

        let states = states
            .into_iter()
            .map(|s| g.dropout(s, self.config.dropout_keep_prob))
            .collect::<Result<Vec<_>>>()?;

        Ok(EncodedVars {
            states,
            summary,
            mask: first.mask.clone(),
        })
    }
}

/// 单方向展开；返回按时间顺序排列的输出和最终状态
fn run_direction(
    g: &mut Graph,
    store: &ParamStore,
    cell: &GruCell,
    inputs: &[Var],
    masks: &[Var],
    batch: usize,
    reverse: bool,
) -> Result<(Vec<Var>, Var)> {
    let mut h = g.zeros((batch, cell.hidden_size));
    let mut outputs = vec![h; inputs.len()];

    let order: Vec<usize> = if reverse {
        (0..inputs.len()).rev().collect()
    } else {
        (0..inputs.len()).collect()
    };
    for t in order {
        let candidate = cell.step(g, store, inputs[t], h)?;
        // h ← h + m·(h' − h)，填充位置保持不变
        let delta = g.sub(candidate, h)?;
        let gated = g.mul_col(delta, masks[t])?;
        h = g.add(h, gated)?;
        outputs[t] = g.mul_col(h, masks[t])?;
    }
    Ok((outputs, h))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocabulary::{END_ID, START_ID};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn build(bidirectional: bool) -> (ParamStore, Encoder) {
        let mut store = ParamStore::new();
        let mut rng = StdRng::seed_from_u64(42);
        let vocab = Arc::new(Vocabulary::from_tokens(["a", "b", "c", "d", "e", "f"]));
        let config = EncoderConfig {
            name: "encoder".into(),
            factors: vec![FactorConfig {
                data_id: "source".into(),
                vocabulary: "source".into(),
                embedding_size: 4,
            }],
            rnn_size: 5,
            cell: RnnCellKind::Gru,
            bidirectional,
            max_input_len: 6,
            add_start_symbol: false,
            add_end_symbol: false,
            dropout_keep_prob: 1.0,
        };
        let encoder = Encoder::new(&mut store, config, vec![vocab], &mut rng).unwrap();
        (store, encoder)
    }

    #[test]
    fn test_output_shapes() {
        let (store, encoder) = build(true);
        assert_eq!(encoder.state_size(), 10);

        let batch = SequenceBatch::from_sequences(vec![vec![4, 5, 6], vec![7]]);
        let mut g = Graph::inference();
        let enc = encoder.encode(&mut g, &store, &[batch]).unwrap();

        assert_eq!(enc.states.len(), 3);
        assert_eq!(g.dim(enc.states[0]), (2, 10));
        assert_eq!(g.dim(enc.summary), (2, 10));
        // 填充位置状态为 0
        assert!(g.value(enc.states[2]).row(1).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_padding_does_not_leak() {
        let (store, encoder) = build(true);
        let clean = SequenceBatch::from_sequences(vec![vec![4, 5, 6], vec![7, 8]]);
        let mut noisy = clean.clone();
        noisy.ids[1][2] = 9;

        let run = |batch: SequenceBatch| {
            let mut g = Graph::inference();
            let enc = encoder.encode(&mut g, &store, &[batch]).unwrap();
            enc.to_output(&g)
        };
        assert_eq!(run(clean), run(noisy));
    }

    #[test]
    fn test_rejects_overlong_batch() {
        let (store, encoder) = build(false);
        let batch = SequenceBatch::from_sequences(vec![vec![4; 7]]);
        let mut g = Graph::inference();
        assert!(encoder.encode(&mut g, &store, &[batch]).is_err());
    }

    #[test]
    fn test_feed_truncates() {
        let (_, mut encoder) = build(false);
        let words: Vec<String> = "a b c d e f a b".split(' ').map(String::from).collect();
        let data = Dataset::new("d").with_series("source", vec![words]).unwrap();
        let batches = encoder.feed(&data).unwrap();
        assert_eq!(batches[0].lengths, vec![6]);

        encoder.config.add_start_symbol = true;
        encoder.config.add_end_symbol = true;
        let batches = encoder.feed(&data).unwrap();
        assert_eq!(batches[0].lengths, vec![6]);
        assert_eq!(batches[0].ids[0][0], START_ID);
        assert_eq!(batches[0].ids[0][5], END_ID);
    }

    #[test]
    fn test_empty_batch_encodes_to_zeros() {
        let (store, encoder) = build(true);
        let batch = SequenceBatch::from_sequences(vec![vec![], vec![]]);
        let mut g = Graph::inference();
        let out = encoder.encode(&mut g, &store, &[batch]).unwrap().to_output(&g);

        assert_eq!(out.source_len(), 1);
        assert_eq!(out.length(0), 0);
        assert!(out.summary.iter().all(|&v| v == 0.0));
        assert!(out.states[0].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_select_rows() {
        let (store, encoder) = build(true);
        let batch = SequenceBatch::from_sequences(vec![vec![4, 5], vec![6]]);
        let mut g = Graph::inference();
        let out = encoder.encode(&mut g, &store, &[batch]).unwrap().to_output(&g);

        let picked = out.select_rows(&[1, 1, 0]);
        assert_eq!(picked.batch_size(), 3);
        assert_eq!(picked.summary.row(0), out.summary.row(1));
        assert_eq!(picked.length(2), 2);
        assert_eq!(picked.length(0), 1);
    }
}
