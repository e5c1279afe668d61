//! 编码器-解码器注意力
//!
//! 给定解码器查询状态和编码器状态序列，计算每个源位置的权重和上下文向量：
//!
//! ```text
//! e_t     = score(q, s_t [, coverage_t])
//! α       = masked_softmax(e)          填充位置权重恰好为 0
//! context = Σ_t α_t · s_t
//! ```
//!
//! 三种打分方式由 `AttentionKind` 选择，接口完全相同。
//!
//! 多头缩放点积注意力把查询、键、值各自投影后按列切成 `n_heads` 份，每个头
//! 单独做 masked softmax，上下文为各头上下文的拼接；对外的 `weights` 是各头
//! 权重的平均，仍然是一个分布。

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::autograd::{Graph, Var};
use crate::encoder::EncodedVars;
use crate::error::{config_err, shape_err, Result};
use crate::layers::Linear;
use crate::params::ParamStore;

/// 注意力打分方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AttentionKind {
    /// `vᵀ tanh(W_q q + W_k s_t + b)`
    #[default]
    Bahdanau,
    /// Bahdanau 打分再加上累计覆盖度特征 `W_c · Σ_{τ<t} α_τ`
    Coverage,
    /// 每个头 `(W_q q)_h · (W_k s_t)_h / √d_h`，值为 `W_v s_t`
    ScaledDotProduct,
}

/// 注意力配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttentionConfig {
    /// 被关注的编码器名字
    pub encoder: String,
    #[serde(default)]
    pub kind: AttentionKind,
    /// 头数，只对 `ScaledDotProduct` 有意义；编码器状态维度必须能被整除
    #[serde(default = "default_heads")]
    pub n_heads: usize,
}

fn default_heads() -> usize {
    1
}

/// 每个解码过程中逐步更新的注意力状态（计算图内）
#[derive(Debug, Clone, Copy)]
pub struct AttentionLoopVars {
    /// 覆盖度 `[batch, src_len]`，只有 Coverage 使用
    pub coverage: Option<Var>,
}

/// 预先投影好的编码器状态，一次解码只计算一次
#[derive(Debug, Clone)]
pub struct AttentionKeys {
    keys: Vec<Var>,
    /// 计算上下文用的值；只有多头注意力会投影
    values: Vec<Var>,
}

/// 单步注意力结果
#[derive(Debug, Clone)]
pub struct AttentionStep {
    /// `[batch, state_size]`
    pub context: Var,
    /// `[batch, src_len]`
    pub weights: Var,
    /// 每个头的权重 `[batch, src_len]`；单头打分时只有一项，即 `weights`
    pub head_weights: Vec<Var>,
    pub next: AttentionLoopVars,
}

/// 注意力层
#[derive(Debug, Clone)]
pub struct Attention {
    pub kind: AttentionKind,
    query_proj: Linear,
    key_proj: Option<Linear>,
    value_proj: Option<Linear>,
    coverage_proj: Option<Linear>,
    energy: Option<Linear>,
    pub n_heads: usize,
    pub query_size: usize,
    /// 编码器状态维度，也是上下文向量维度
    pub state_size: usize,
}

impl Attention {
    pub fn new<R: Rng + ?Sized>(
        store: &mut ParamStore,
        name: &str,
        config: &AttentionConfig,
        query_size: usize,
        state_size: usize,
        hidden_size: usize,
        rng: &mut R,
    ) -> Result<Self> {
        let kind = config.kind;
        let n_heads = config.n_heads;
        if n_heads == 0 {
            return Err(config_err!("attention `{}` needs at least one head", name));
        }
        if kind != AttentionKind::ScaledDotProduct && n_heads != 1 {
            return Err(config_err!("attention `{}`: only scaled dot-product attention has heads", name));
        }
        if state_size % n_heads != 0 {
            return Err(config_err!(
                "attention `{}`: state size {} is not divisible by {} heads",
                name,
                state_size,
                n_heads
            ));
        }

        let (query_proj, key_proj, value_proj, coverage_proj, energy) = match kind {
            AttentionKind::ScaledDotProduct => (
                Linear::with_bias_init(store, &format!("{}/query", name), query_size, state_size, None, rng)?,
                Some(Linear::with_bias_init(store, &format!("{}/key", name), state_size, state_size, None, rng)?),
                Some(Linear::with_bias_init(store, &format!("{}/value", name), state_size, state_size, None, rng)?),
                None,
                None,
            ),
            AttentionKind::Bahdanau | AttentionKind::Coverage => {
                let query = Linear::with_bias_init(
                    store,
                    &format!("{}/query", name),
                    query_size,
                    hidden_size,
                    None,
                    rng,
                )?;
                let key = Linear::new(store, &format!("{}/key", name), state_size, hidden_size, rng)?;
                let coverage = if kind == AttentionKind::Coverage {
                    Some(Linear::with_bias_init(
                        store,
                        &format!("{}/coverage", name),
                        1,
                        hidden_size,
                        None,
                        rng,
                    )?)
                } else {
                    None
                };
                let energy = Linear::with_bias_init(
                    store,
                    &format!("{}/energy", name),
                    hidden_size,
                    1,
                    None,
                    rng,
                )?;
                (query, Some(key), None, coverage, Some(energy))
            }
        };

        Ok(Self {
            kind,
            query_proj,
            key_proj,
            value_proj,
            coverage_proj,
            energy,
            n_heads,
            query_size,
            state_size,
        })
    }

    /// 新解码开始时的状态（覆盖度清零）
    pub fn initial_state(&self, g: &mut Graph, batch: usize, src_len: usize) -> AttentionLoopVars {
        AttentionLoopVars {
            coverage: match self.kind {
                AttentionKind::Coverage => Some(g.zeros((batch, src_len))),
                _ => None,
            },
        }
    }

    /// 投影编码器状态
    pub fn prepare(&self, g: &mut Graph, store: &ParamStore, encoded: &EncodedVars) -> Result<AttentionKeys> {
        Ok(AttentionKeys {
            keys: project_states(g, store, self.key_proj.as_ref(), &encoded.states)?,
            values: project_states(g, store, self.value_proj.as_ref(), &encoded.states)?,
        })
    }

    /// 计算一步注意力
    ///
    /// # 输入
    /// - `query`: [batch, query_size]
    /// - `encoded`: 被关注的编码结果
    /// - `keys`: `prepare` 的结果
    pub fn attend(
        &self,
        g: &mut Graph,
        store: &ParamStore,
        query: Var,
        encoded: &EncodedVars,
        keys: &AttentionKeys,
        state: AttentionLoopVars,
    ) -> Result<AttentionStep> {
        let src_len = encoded.states.len();
        if keys.keys.len() != src_len || encoded.mask.ncols() != src_len {
            return Err(shape_err!(
                "attention over {} states with {} keys and mask {:?}",
                src_len,
                keys.keys.len(),
                encoded.mask.dim()
            ));
        }
        if g.dim(query).0 != encoded.mask.nrows() {
            return Err(shape_err!(
                "query batch {} vs encoder batch {}",
                g.dim(query).0,
                encoded.mask.nrows()
            ));
        }

        let projected = self.query_proj.forward(g, store, query)?;
        let Some(energy) = &self.energy else {
            return self.attend_heads(g, projected, encoded, keys);
        };

        let mut energies = Vec::with_capacity(src_len);
        for (t, &key) in keys.keys.iter().enumerate() {
            let mut hidden = g.add(projected, key)?;
            if let (Some(proj), Some(coverage)) = (&self.coverage_proj, state.coverage) {
                let column = g.slice_cols(coverage, t, t + 1)?;
                let feature = proj.forward(g, store, column)?;
                hidden = g.add(hidden, feature)?;
            }
            let hidden = g.tanh(hidden);
            energies.push(energy.forward(g, store, hidden)?);
        }

        let energies = g.concat_cols(&energies)?;
        let weights = g.masked_softmax(energies, &encoded.mask)?;
        let context = weighted_sum(g, &keys.values, weights)?;

        let coverage = match state.coverage {
            Some(c) => Some(g.add(c, weights)?),
            None => None,
        };

        Ok(AttentionStep {
            context,
            weights,
            head_weights: vec![weights],
            next: AttentionLoopVars { coverage },
        })
    }

    /// 多头缩放点积；`projected` 为已投影的查询 `[batch, state_size]`
    fn attend_heads(
        &self,
        g: &mut Graph,
        projected: Var,
        encoded: &EncodedVars,
        keys: &AttentionKeys,
    ) -> Result<AttentionStep> {
        let head_dim = self.state_size / self.n_heads;
        let scaling = 1.0 / (head_dim as f32).sqrt();
        let query = g.scale(projected, scaling);

        let mut head_weights = Vec::with_capacity(self.n_heads);
        let mut contexts = Vec::with_capacity(self.n_heads);
        for h in 0..self.n_heads {
            let (lo, hi) = (h * head_dim, (h + 1) * head_dim);
            let q = g.slice_cols(query, lo, hi)?;

            let mut energies = Vec::with_capacity(keys.keys.len());
            for &key in &keys.keys {
                let k = g.slice_cols(key, lo, hi)?;
                let dot = g.mul(q, k)?;
                energies.push(g.row_sum(dot));
            }
            let energies = g.concat_cols(&energies)?;
            let weights = g.masked_softmax(energies, &encoded.mask)?;

            let values = keys
                .values
                .iter()
                .map(|&v| g.slice_cols(v, lo, hi))
                .collect::<Result<Vec<_>>>()?;
            contexts.push(weighted_sum(g, &values, weights)?);
            head_weights.push(weights);
        }

        let context = g.concat_cols(&contexts)?;
        let weights = if self.n_heads == 1 {
            head_weights[0]
        } else {
            let total = g.add_n(&head_weights)?;
            g.scale(total, 1.0 / self.n_heads as f32)
        };

        Ok(AttentionStep {
            context,
            weights,
            head_weights,
            next: AttentionLoopVars { coverage: None },
        })
    }
}

fn project_states(g: &mut Graph, store: &ParamStore, proj: Option<&Linear>, states: &[Var]) -> Result<Vec<Var>> {
    match proj {
        None => Ok(states.to_vec()),
        Some(proj) => states.iter().map(|&s| proj.forward(g, store, s)).collect(),
    }
}

/// `Σ_t α_t · v_t`
fn weighted_sum(g: &mut Graph, values: &[Var], weights: Var) -> Result<Var> {
    let mut weighted = Vec::with_capacity(values.len());
    for (t, &v) in values.iter().enumerate() {
        let alpha = g.slice_cols(weights, t, t + 1)?;
        weighted.push(g.mul_col(v, alpha)?);
    }
    g.add_n(&weighted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr2, Array2};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn encoded(g: &mut Graph) -> EncodedVars {
        let states = (0..3)
            .map(|t| g.constant(Array2::from_elem((2, 4), t as f32 * 0.5 - 0.4)))
            .collect();
        let summary = g.zeros((2, 4));
        EncodedVars {
            states,
            summary,
            mask: arr2(&[[1.0, 1.0, 1.0], [1.0, 0.0, 0.0]]),
        }
    }

    fn config(kind: AttentionKind, n_heads: usize) -> AttentionConfig {
        AttentionConfig {
            encoder: "enc".into(),
            kind,
            n_heads,
        }
    }

    #[test]
    fn test_weights_are_distributions() {
        for kind in [
            AttentionKind::Bahdanau,
            AttentionKind::Coverage,
            AttentionKind::ScaledDotProduct,
        ] {
            let mut store = ParamStore::new();
            let mut rng = StdRng::seed_from_u64(7);
            let attention = Attention::new(&mut store, "att", &config(kind, 1), 3, 4, 5, &mut rng).unwrap();

            let mut g = Graph::inference();
            let enc = encoded(&mut g);
            let keys = attention.prepare(&mut g, &store, &enc).unwrap();
            let mut state = attention.initial_state(&mut g, 2, 3);
            for _ in 0..3 {
                let query = g.constant(Array2::from_elem((2, 3), 0.3));
                let step = attention.attend(&mut g, &store, query, &enc, &keys, state).unwrap();
                let w = g.value(step.weights);

                assert!((w.row(0).sum() - 1.0).abs() < 1e-5);
                assert!((w[[1, 0]] - 1.0).abs() < 1e-6);
                assert_eq!(w[[1, 1]], 0.0);
                assert_eq!(w[[1, 2]], 0.0);
                assert_eq!(g.dim(step.context), (2, 4));
                state = step.next;
            }
        }
    }

    #[test]
    fn test_coverage_accumulates() {
        let mut store = ParamStore::new();
        let mut rng = StdRng::seed_from_u64(8);
        let attention = Attention::new(&mut store, "att", &config(AttentionKind::Coverage, 1), 3, 4, 5, &mut rng).unwrap();

        let mut g = Graph::inference();
        let enc = encoded(&mut g);
        let keys = attention.prepare(&mut g, &store, &enc).unwrap();
        let mut state = attention.initial_state(&mut g, 2, 3);
        for _ in 0..2 {
            let query = g.zeros((2, 3));
            state = attention.attend(&mut g, &store, query, &enc, &keys, state).unwrap().next;
        }
        let coverage = g.value(state.coverage.unwrap());
        assert!((coverage.row(0).sum() - 2.0).abs() < 1e-5);
        assert!((coverage[[1, 0]] - 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_batch_mismatch() {
        let mut store = ParamStore::new();
        let mut rng = StdRng::seed_from_u64(9);
        let attention = Attention::new(&mut store, "att", &config(AttentionKind::Bahdanau, 1), 3, 4, 5, &mut rng).unwrap();

        let mut g = Graph::inference();
        let enc = encoded(&mut g);
        let keys = attention.prepare(&mut g, &store, &enc).unwrap();
        let state = attention.initial_state(&mut g, 2, 3);
        let query = g.zeros((5, 3));
        assert!(attention.attend(&mut g, &store, query, &enc, &keys, state).is_err());
    }

    #[test]
    fn test_multi_head_weights() {
        let mut store = ParamStore::new();
        let mut rng = StdRng::seed_from_u64(10);
        let attention = Attention::new(
            &mut store,
            "att",
            &config(AttentionKind::ScaledDotProduct, 2),
            3,
            4,
            5,
            &mut rng,
        )
        .unwrap();
        assert!(store.id_of("att/key/weight").is_some());
        assert!(store.id_of("att/value/weight").is_some());

        let mut g = Graph::inference();
        let enc = encoded(&mut g);
        let keys = attention.prepare(&mut g, &store, &enc).unwrap();
        let state = attention.initial_state(&mut g, 2, 3);
        let query = g.constant(Array2::from_shape_fn((2, 3), |(b, i)| (b + i) as f32 * 0.4 - 0.5));
        let step = attention.attend(&mut g, &store, query, &enc, &keys, state).unwrap();

        assert_eq!(step.head_weights.len(), 2);
        assert_eq!(g.dim(step.context), (2, 4));
        let mean = (g.value(step.head_weights[0]) + g.value(step.head_weights[1])) / 2.0;
        let weights = g.value(step.weights);
        for (&w, &m) in weights.iter().zip(mean.iter()) {
            assert!((w - m).abs() < 1e-6);
        }
        for &head in &step.head_weights {
            let w = g.value(head);
            assert!((w.row(0).sum() - 1.0).abs() < 1e-5);
            assert_eq!(w[[1, 1]], 0.0);
            assert_eq!(w[[1, 2]], 0.0);
        }
    }

    #[test]
    fn test_head_count_validation() {
        let mut store = ParamStore::new();
        let mut rng = StdRng::seed_from_u64(11);
        let mut build = |kind, heads| Attention::new(&mut store, "att", &config(kind, heads), 3, 4, 5, &mut rng);

        assert!(build(AttentionKind::ScaledDotProduct, 3).is_err());
        assert!(build(AttentionKind::ScaledDotProduct, 0).is_err());
        assert!(build(AttentionKind::Bahdanau, 2).is_err());
    }

    #[test]
    fn test_heads_default_to_one() {
        let config: AttentionConfig =
            serde_json::from_str(r#"{"encoder": "enc", "kind": "scaled_dot_product"}"#).unwrap();
        assert_eq!(config.n_heads, 1);
    }
}
