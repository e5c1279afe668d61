//! 循环解码器
//!
//! 状态机 `INIT → STEP* → DONE`：
//!
//! ```text
//! INIT  h_0 = 初始状态策略(编码器 summary)，contexts = 0
//! STEP  x_t   = [emb(y_{t-1}); contexts_{t-1}]
//!       h_t   = GRU(x_t, h_{t-1})
//!       c_t^i = Attention_i(h_t, encoder_i)
//!       logits_t = OutputProjection([h_t; c_t; emb(y_{t-1})])
//! ```
//!
//! 训练（teacher forcing）与推理共用同一个 `step`，区别只在于上一步输入来自
//! 标注还是来自模型自己的选择。

use ndarray::Array2;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::attention::{Attention, AttentionConfig, AttentionKeys, AttentionLoopVars};
use crate::autograd::{Graph, Var};
use crate::dataset::{Dataset, SequenceBatch};
use crate::encoder::{default_keep_prob, EncodedVars, Encoder, EncoderOutput};
use crate::error::{config_err, shape_err, Result};
use crate::layers::{Embedding, GruCell, Linear, RnnCellKind};
use crate::params::ParamStore;
use crate::tensor::TensorExt;
use crate::vocabulary::{Vocabulary, START_ID};

/// 输出投影方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputProjectionKind {
    /// 直接线性映射到词表
    #[default]
    Linear,
    /// `tanh` 隐层后再映射到词表
    Nonlinear { size: usize },
    /// 投影到 `2·size` 后相邻两两取最大，再映射到词表
    Maxout { size: usize },
}

/// 多个编码器 summary 的合并方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderCombination {
    /// 各自投影后相加
    Sum,
    /// 拼接后统一投影
    ConcatProject,
}

/// 初始隐状态策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InitialState {
    Zero,
    FromEncoders { combine: EncoderCombination },
}

impl Default for InitialState {
    fn default() -> Self {
        InitialState::FromEncoders {
            combine: EncoderCombination::Sum,
        }
    }
}

/// 解码器配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecoderConfig {
    pub name: String,
    /// 目标序列的 data id
    pub data_id: String,
    pub vocabulary: String,
    /// 用于初始化隐状态的编码器
    pub encoders: Vec<String>,
    #[serde(default)]
    pub attentions: Vec<AttentionConfig>,
    pub embedding_size: usize,
    pub rnn_size: usize,
    #[serde(default)]
    pub cell: RnnCellKind,
    pub max_output_len: usize,
    #[serde(default)]
    pub output_projection: OutputProjectionKind,
    #[serde(default)]
    pub initial_state: InitialState,
    #[serde(default = "default_keep_prob")]
    pub dropout_keep_prob: f32,
}

#[derive(Debug, Clone)]
enum OutputProjection {
    Linear { out: Linear },
    Nonlinear { hidden: Linear, out: Linear },
    Maxout { hidden: Linear, out: Linear },
}

impl OutputProjection {
    fn new<R: Rng + ?Sized>(
        store: &mut ParamStore,
        name: &str,
        kind: OutputProjectionKind,
        input_size: usize,
        vocab_size: usize,
        rng: &mut R,
    ) -> Result<Self> {
        let out_name = format!("{}/output", name);
        let hidden_name = format!("{}/output_hidden", name);
        Ok(match kind {
            OutputProjectionKind::Linear => OutputProjection::Linear {
                out: Linear::new(store, &out_name, input_size, vocab_size, rng)?,
            },
            OutputProjectionKind::Nonlinear { size } => OutputProjection::Nonlinear {
                hidden: Linear::new(store, &hidden_name, input_size, size, rng)?,
                out: Linear::new(store, &out_name, size, vocab_size, rng)?,
            },
            OutputProjectionKind::Maxout { size } => OutputProjection::Maxout {
                hidden: Linear::new(store, &hidden_name, input_size, 2 * size, rng)?,
                out: Linear::new(store, &out_name, size, vocab_size, rng)?,
            },
        })
    }

    fn forward(&self, g: &mut Graph, store: &ParamStore, x: Var) -> Result<Var> {
        match self {
            OutputProjection::Linear { out } => out.forward(g, store, x),
            OutputProjection::Nonlinear { hidden, out } => {
                let h = hidden.forward(g, store, x)?;
                let h = g.tanh(h);
                out.forward(g, store, h)
            }
            OutputProjection::Maxout { hidden, out } => {
                let h = hidden.forward(g, store, x)?;
                let h = g.maxout(h, 2)?;
                out.forward(g, store, h)
            }
        }
    }
}

#[derive(Debug, Clone)]
enum InitialProjection {
    Zero,
    Sum(Vec<Linear>),
    ConcatProject(Linear),
}

/// 计算图中的解码器状态
#[derive(Debug, Clone)]
pub struct StepVars {
    pub hidden: Var,
    pub contexts: Vec<Var>,
    pub attention: Vec<AttentionLoopVars>,
}

/// 计算图中的单步输出
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// `[batch, vocab]`
    pub logits: Var,
    /// 每个注意力一个 `[batch, src_len]`
    pub weights: Vec<Var>,
    pub state: StepVars,
}

/// 脱离计算图的解码器状态，推理时逐步传递
#[derive(Debug, Clone, PartialEq)]
pub struct DecoderState {
    pub hidden: Array2<f32>,
    pub contexts: Vec<Array2<f32>>,
    pub coverage: Vec<Option<Array2<f32>>>,
}

impl DecoderState {
    pub fn batch_size(&self) -> usize {
        self.hidden.nrows()
    }

    /// 按下标挑选行（可重复），用于 beam 重排
    pub fn select_rows(&self, rows: &[usize]) -> Self {
        Self {
            hidden: self.hidden.select_rows(rows),
            contexts: self.contexts.iter().map(|c| c.select_rows(rows)).collect(),
            coverage: self
                .coverage
                .iter()
                .map(|c| c.as_ref().map(|c| c.select_rows(rows)))
                .collect(),
        }
    }

    fn to_vars(&self, g: &mut Graph) -> StepVars {
        StepVars {
            hidden: g.constant(self.hidden.clone()),
            contexts: self.contexts.iter().map(|c| g.constant(c.clone())).collect(),
            attention: self
                .coverage
                .iter()
                .map(|c| AttentionLoopVars {
                    coverage: c.as_ref().map(|c| g.constant(c.clone())),
                })
                .collect(),
        }
    }

    fn from_vars(g: &Graph, vars: &StepVars) -> Self {
        Self {
            hidden: g.value(vars.hidden).clone(),
            contexts: vars.contexts.iter().map(|&c| g.value(c).clone()).collect(),
            coverage: vars
                .attention
                .iter()
                .map(|a| a.coverage.map(|c| g.value(c).clone()))
                .collect(),
        }
    }
}

/// 推理单步的结果
#[derive(Debug, Clone)]
pub struct InferenceStep {
    /// `[batch, vocab]`
    pub logits: Array2<f32>,
    /// 每个注意力一个 `[batch, src_len]`
    pub attention: Vec<Array2<f32>>,
    pub state: DecoderState,
}

/// teacher forcing 展开的结果
#[derive(Debug, Clone)]
pub struct DecoderRun {
    /// 每步 `[batch, vocab]`
    pub logits: Vec<Var>,
    /// `[attention][step]`，每个 `[batch, src_len]`
    pub attention: Vec<Vec<Var>>,
    /// 目标掩码 `[batch, steps]`
    pub mask: Array2<f32>,
}

/// 循环解码器
#[derive(Debug, Clone)]
pub struct Decoder {
    pub config: DecoderConfig,
    vocabulary: Arc<Vocabulary>,
    embedding: Embedding,
    cell: GruCell,
    /// (模型中编码器下标, 注意力)
    attentions: Vec<(usize, Attention)>,
    /// 用于初始化的编码器下标
    summary_sources: Vec<usize>,
    initial: InitialProjection,
    projection: OutputProjection,
}

impl Decoder {
    /// `encoders` 是模型中的全部编码器，按名字解析引用
    pub fn new<R: Rng + ?Sized>(
        store: &mut ParamStore,
        config: DecoderConfig,
        vocabulary: Arc<Vocabulary>,
        encoders: &[Encoder],
        rng: &mut R,
    ) -> Result<Self> {
        if config.rnn_size == 0 || config.embedding_size == 0 || config.max_output_len == 0 {
            return Err(config_err!("decoder `{}` has a zero size", config.name));
        }
        if !(config.dropout_keep_prob > 0.0 && config.dropout_keep_prob <= 1.0) {
            return Err(config_err!(
                "decoder `{}` keep probability {} outside (0, 1]",
                config.name,
                config.dropout_keep_prob
            ));
        }

        let resolve = |name: &str| {
            encoders
                .iter()
                .position(|e| e.name() == name)
                .ok_or_else(|| config_err!("decoder `{}` refers to unknown encoder `{}`", config.name, name))
        };
        let summary_sources = config
            .encoders
            .iter()
            .map(|n| resolve(n))
            .collect::<Result<Vec<_>>>()?;

        let name = config.name.clone();
        let embedding = Embedding::new(
            store,
            &format!("{}/embedding", name),
            vocabulary.len(),
            config.embedding_size,
            rng,
        )?;

        let mut attentions = Vec::with_capacity(config.attentions.len());
        for (i, att) in config.attentions.iter().enumerate() {
            let idx = resolve(&att.encoder)?;
            let attention = Attention::new(
                store,
                &format!("{}/attention_{}", name, i),
                att,
                config.rnn_size,
                encoders[idx].state_size(),
                config.rnn_size,
                rng,
            )?;
            attentions.push((idx, attention));
        }
        let context_size: usize = attentions.iter().map(|(_, a)| a.state_size).sum();

        let cell = GruCell::new(
            store,
            &format!("{}/cell", name),
            config.cell,
            config.embedding_size + context_size,
            config.rnn_size,
            rng,
        )?;

        let initial = match config.initial_state {
            InitialState::Zero => InitialProjection::Zero,
            InitialState::FromEncoders { .. } if summary_sources.is_empty() => {
                return Err(config_err!(
                    "decoder `{}` initialises from encoders but lists none",
                    name
                ));
            }
            InitialState::FromEncoders {
                combine: EncoderCombination::Sum,
            } => InitialProjection::Sum(
                summary_sources
                    .iter()
                    .enumerate()
                    .map(|(i, &e)| {
                        Linear::new(
                            store,
                            &format!("{}/initial_{}", name, i),
                            encoders[e].state_size(),
                            config.rnn_size,
                            rng,
                        )
                    })
                    .collect::<Result<Vec<_>>>()?,
            ),
            InitialState::FromEncoders {
                combine: EncoderCombination::ConcatProject,
            } => {
                let total: usize = summary_sources.iter().map(|&e| encoders[e].state_size()).sum();
                InitialProjection::ConcatProject(Linear::new(
                    store,
                    &format!("{}/initial", name),
                    total,
                    config.rnn_size,
                    rng,
                )?)
            }
        };

        let projection = OutputProjection::new(
            store,
            &name,
            config.output_projection,
            config.rnn_size + context_size + config.embedding_size,
            vocabulary.len(),
            rng,
        )?;

        Ok(Self {
            config,
            vocabulary,
            embedding,
            cell,
            attentions,
            summary_sources,
            initial,
            projection,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn data_id(&self) -> &str {
        &self.config.data_id
    }

    pub fn vocabulary(&self) -> &Arc<Vocabulary> {
        &self.vocabulary
    }

    pub fn vocab_size(&self) -> usize {
        self.vocabulary.len()
    }

    pub fn max_output_len(&self) -> usize {
        self.config.max_output_len
    }

    pub fn attention_count(&self) -> usize {
        self.attentions.len()
    }

    /// 第 i 个注意力关注的编码器下标
    pub fn attention_encoder(&self, i: usize) -> Option<usize> {
        self.attentions.get(i).map(|(e, _)| *e)
    }

    /// 读取目标序列：截断到 `max_output_len` 并以 `</s>` 结尾
    pub fn feed(&self, dataset: &Dataset) -> Result<SequenceBatch> {
        let sentences = dataset.series(&self.config.data_id)?;
        Ok(self
            .vocabulary
            .sentences_to_batch(sentences, self.config.max_output_len, false, true))
    }

    fn batch_size(&self, encoded: &[EncodedVars]) -> Result<usize> {
        encoded
            .first()
            .map(|e| e.mask.nrows())
            .ok_or_else(|| shape_err!("decoder `{}` got no encoder outputs", self.name()))
    }

    fn encoded_at<'a>(&self, encoded: &'a [EncodedVars], idx: usize) -> Result<&'a EncodedVars> {
        encoded
            .get(idx)
            .ok_or_else(|| shape_err!("decoder `{}` needs encoder #{}", self.name(), idx))
    }

    /// INIT：初始状态
    pub fn initial_vars(&self, g: &mut Graph, store: &ParamStore, encoded: &[EncodedVars]) -> Result<StepVars> {
        let batch = self.batch_size(encoded)?;

        let hidden = match &self.initial {
            InitialProjection::Zero => g.zeros((batch, self.config.rnn_size)),
            InitialProjection::Sum(projections) => {
                let mut parts = Vec::with_capacity(projections.len());
                for (proj, &e) in projections.iter().zip(&self.summary_sources) {
                    let summary = self.encoded_at(encoded, e)?.summary;
                    parts.push(proj.forward(g, store, summary)?);
                }
                let summed = g.add_n(&parts)?;
                g.tanh(summed)
            }
            InitialProjection::ConcatProject(proj) => {
                let summaries = self
                    .summary_sources
                    .iter()
                    .map(|&e| self.encoded_at(encoded, e).map(|enc| enc.summary))
                    .collect::<Result<Vec<_>>>()?;
                let joined = g.concat_cols(&summaries)?;
                let projected = proj.forward(g, store, joined)?;
                g.tanh(projected)
            }
        };

        let mut contexts = Vec::with_capacity(self.attentions.len());
        let mut attention = Vec::with_capacity(self.attentions.len());
        for (e, att) in &self.attentions {
            let src_len = self.encoded_at(encoded, *e)?.states.len();
            contexts.push(g.zeros((batch, att.state_size)));
            attention.push(att.initial_state(g, batch, src_len));
        }

        Ok(StepVars {
            hidden,
            contexts,
            attention,
        })
    }

    /// 为每个注意力投影编码器状态
    pub fn prepare_keys(&self, g: &mut Graph, store: &ParamStore, encoded: &[EncodedVars]) -> Result<Vec<AttentionKeys>> {
        self.attentions
            .iter()
            .map(|(e, att)| att.prepare(g, store, self.encoded_at(encoded, *e)?))
            .collect()
    }

    /// STEP：输入上一步的 token，输出 logits 和新状态
    pub fn step(
        &self,
        g: &mut Graph,
        store: &ParamStore,
        encoded: &[EncodedVars],
        keys: &[AttentionKeys],
        prev_ids: &[usize],
        state: &StepVars,
    ) -> Result<StepOutput> {
        if prev_ids.len() != g.dim(state.hidden).0 {
            return Err(shape_err!(
                "decoder `{}` got {} inputs for a batch of {}",
                self.name(),
                prev_ids.len(),
                g.dim(state.hidden).0
            ));
        }

        let emb = self.embedding.forward(g, store, prev_ids)?;
        let emb = g.dropout(emb, self.config.dropout_keep_prob)?;

        let mut cell_input = vec![emb];
        cell_input.extend(&state.contexts);
        let cell_input = g.concat_cols(&cell_input)?;
        let hidden = self.cell.step(g, store, cell_input, state.hidden)?;

        let mut contexts = Vec::with_capacity(self.attentions.len());
        let mut weights = Vec::with_capacity(self.attentions.len());
        let mut attention = Vec::with_capacity(self.attentions.len());
        for (((e, att), key), loop_state) in self.attentions.iter().zip(keys).zip(&state.attention) {
            let step = att.attend(g, store, hidden, self.encoded_at(encoded, *e)?, key, *loop_state)?;
            contexts.push(step.context);
            weights.push(step.weights);
            attention.push(step.next);
        }

        let output = g.dropout(hidden, self.config.dropout_keep_prob)?;
        let mut features = vec![output];
        features.extend(&contexts);
        features.push(emb);
        let features = g.concat_cols(&features)?;
        let logits = self.projection.forward(g, store, features)?;

        Ok(StepOutput {
            logits,
            weights,
            state: StepVars {
                hidden,
                contexts,
                attention,
            },
        })
    }

    /// 训练展开：每一步的输入都是标注序列的上一个 token
    pub fn run_teacher_forced(
        &self,
        g: &mut Graph,
        store: &ParamStore,
        encoded: &[EncodedVars],
        targets: &SequenceBatch,
    ) -> Result<DecoderRun> {
        let batch = self.batch_size(encoded)?;
        if targets.batch_size() != batch {
            return Err(shape_err!(
                "decoder `{}` got {} targets for a batch of {}",
                self.name(),
                targets.batch_size(),
                batch
            ));
        }
        if targets.max_len() > self.config.max_output_len {
            return Err(shape_err!(
                "target length {} exceeds max_output_len {} of decoder `{}`",
                targets.max_len(),
                self.config.max_output_len,
                self.name()
            ));
        }

        let keys = self.prepare_keys(g, store, encoded)?;
        let mut state = self.initial_vars(g, store, encoded)?;
        let mut logits = Vec::with_capacity(targets.max_len());
        let mut attention = vec![Vec::with_capacity(targets.max_len()); self.attentions.len()];

        let mut prev = vec![START_ID; batch];
        for t in 0..targets.max_len() {
            let out = self.step(g, store, encoded, &keys, &prev, &state)?;
            logits.push(out.logits);
            for (history, w) in attention.iter_mut().zip(out.weights) {
                history.push(w);
            }
            state = out.state;
            prev = targets.column(t);
        }

        Ok(DecoderRun {
            logits,
            attention,
            mask: targets.mask.clone(),
        })
    }

    /// 推理用的初始状态
    pub fn infer_initial_state(&self, store: &ParamStore, encoded: &[EncoderOutput]) -> Result<DecoderState> {
        let mut g = Graph::inference();
        let vars: Vec<EncodedVars> = encoded.iter().map(|e| e.to_vars(&mut g)).collect();
        let state = self.initial_vars(&mut g, store, &vars)?;
        Ok(DecoderState::from_vars(&g, &state))
    }

    /// 推理单步：在一次性的推理图上执行 `step`
    pub fn infer_step(
        &self,
        store: &ParamStore,
        encoded: &[EncoderOutput],
        prev_ids: &[usize],
        state: &DecoderState,
    ) -> Result<InferenceStep> {
        let mut g = Graph::inference();
        let vars: Vec<EncodedVars> = encoded.iter().map(|e| e.to_vars(&mut g)).collect();
        let keys = self.prepare_keys(&mut g, store, &vars)?;
        let state = state.to_vars(&mut g);
        let out = self.step(&mut g, store, &vars, &keys, prev_ids, &state)?;

        Ok(InferenceStep {
            logits: g.value(out.logits).clone(),
            attention: out.weights.iter().map(|&w| g.value(w).clone()).collect(),
            state: DecoderState::from_vars(&g, &out.state),
        })
    }
}
