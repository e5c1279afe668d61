//! 基础层
//!
//! 全连接层、嵌入层和 GRU 单元（含带噪激活的变体）。
//! 各层只保存 `ParamId`，前向计算在给定的 `Graph` 上进行。

use ndarray::Array2;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::autograd::{Graph, Var};
use crate::error::{shape_err, Result};
use crate::params::{ParamId, ParamStore};

/// 全连接层 `y = x W + b`
#[derive(Debug, Clone)]
pub struct Linear {
    weight: ParamId,
    bias: Option<ParamId>,
    pub input_dim: usize,
    pub output_dim: usize,
}

impl Linear {
    /// 创建全连接层，偏置初始化为 0
    pub fn new<R: Rng + ?Sized>(
        store: &mut ParamStore,
        name: &str,
        input_dim: usize,
        output_dim: usize,
        rng: &mut R,
    ) -> Result<Self> {
        Self::with_bias_init(store, name, input_dim, output_dim, Some(0.0), rng)
    }

    /// 指定偏置初值；`None` 表示没有偏置
    pub fn with_bias_init<R: Rng + ?Sized>(
        store: &mut ParamStore,
        name: &str,
        input_dim: usize,
        output_dim: usize,
        bias_init: Option<f32>,
        rng: &mut R,
    ) -> Result<Self> {
        let weight = store.weight(format!("{}/weight", name), (input_dim, output_dim), rng)?;
        let bias = bias_init
            .map(|init| store.bias(format!("{}/bias", name), output_dim, init))
            .transpose()?;

        Ok(Self {
            weight,
            bias,
            input_dim,
            output_dim,
        })
    }

    /// 前向传播
    ///
    /// # 输入
    /// - `x`: [batch, input_dim]
    ///
    /// # 输出
    /// - [batch, output_dim]
    pub fn forward(&self, g: &mut Graph, store: &ParamStore, x: Var) -> Result<Var> {
        if g.dim(x).1 != self.input_dim {
            return Err(shape_err!(
                "linear layer expects {} inputs, got {:?}",
                self.input_dim,
                g.dim(x)
            ));
        }
        let w = g.param(store, self.weight);
        let y = g.matmul(x, w)?;
        match self.bias {
            Some(b) => {
                let b = g.param(store, b);
                g.add_row(y, b)
            }
            None => Ok(y),
        }
    }
}

/// 嵌入层
#[derive(Debug, Clone)]
pub struct Embedding {
    table: ParamId,
    pub vocab_size: usize,
    pub dim: usize,
}

impl Embedding {
    pub fn new<R: Rng + ?Sized>(
        store: &mut ParamStore,
        name: &str,
        vocab_size: usize,
        dim: usize,
        rng: &mut R,
    ) -> Result<Self> {
        let table = store.weight(name, (vocab_size, dim), rng)?;
        Ok(Self {
            table,
            vocab_size,
            dim,
        })
    }

    /// 查表：`ids` 长度为 batch，返回 [batch, dim]
    pub fn forward(&self, g: &mut Graph, store: &ParamStore, ids: &[usize]) -> Result<Var> {
        let table = g.param(store, self.table);
        g.gather(table, ids)
    }
}

/// 循环单元类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RnnCellKind {
    #[default]
    Gru,
    /// 带半正态噪声的饱和激活（arXiv:1603.00391）
    NoisyGru,
}

/// 带噪激活的混合系数 α
const NOISY_ALPHA: f32 = 1.1;

/// GRU 单元
///
/// ```text
/// [r, u] = σ(W_g [x; h] + b_g)      b_g 初始化为 1
/// c      = tanh(W_c [x; r ⊙ h] + b_c)
/// h'     = u ⊙ h + (1 − u) ⊙ c
/// ```
#[derive(Debug, Clone)]
pub struct GruCell {
    gates: Linear,
    candidate: Linear,
    /// 带噪版本的可学习斜率 p（两个激活各一个）
    noise_slopes: Option<(ParamId, ParamId)>,
    pub input_size: usize,
    pub hidden_size: usize,
}

impl GruCell {
    pub fn new<R: Rng + ?Sized>(
        store: &mut ParamStore,
        name: &str,
        kind: RnnCellKind,
        input_size: usize,
        hidden_size: usize,
        rng: &mut R,
    ) -> Result<Self> {
        let joint = input_size + hidden_size;
        let gates = Linear::with_bias_init(
            store,
            &format!("{}/gates", name),
            joint,
            2 * hidden_size,
            Some(1.0),
            rng,
        )?;
        let candidate = Linear::new(store, &format!("{}/candidate", name), joint, hidden_size, rng)?;

        let noise_slopes = match kind {
            RnnCellKind::Gru => None,
            RnnCellKind::NoisyGru => Some((
                store.register(format!("{}/gates/noise_p", name), Array2::ones((1, 1)), false)?,
                store.register(format!("{}/candidate/noise_p", name), Array2::ones((1, 1)), false)?,
            )),
        };

        Ok(Self {
            gates,
            candidate,
            noise_slopes,
            input_size,
            hidden_size,
        })
    }

    pub fn kind(&self) -> RnnCellKind {
        if self.noise_slopes.is_some() {
            RnnCellKind::NoisyGru
        } else {
            RnnCellKind::Gru
        }
    }

    /// 单步前向
    ///
    /// # 输入
    /// - `x`: [batch, input_size]
    /// - `h`: [batch, hidden_size]
    ///
    /// # 输出
    /// - 新的隐状态 [batch, hidden_size]
    pub fn step(&self, g: &mut Graph, store: &ParamStore, x: Var, h: Var) -> Result<Var> {
        let xh = g.concat_cols(&[x, h])?;
        let gate_logits = self.gates.forward(g, store, xh)?;
        let gates = match self.noise_slopes {
            None => g.sigmoid(gate_logits),
            Some((p, _)) => {
                let p = g.param(store, p);
                noisy_sigmoid(g, gate_logits, p)?
            }
        };

        let n = self.hidden_size;
        let reset = g.slice_cols(gates, 0, n)?;
        let update = g.slice_cols(gates, n, 2 * n)?;

        let reset_h = g.mul(reset, h)?;
        let x_rh = g.concat_cols(&[x, reset_h])?;
        let cand_logits = self.candidate.forward(g, store, x_rh)?;
        let cand = match self.noise_slopes {
            None => g.tanh(cand_logits),
            Some((_, p)) => {
                let p = g.param(store, p);
                noisy_tanh(g, cand_logits, p)?
            }
        };

        let keep = g.mul(update, h)?;
        let one_minus_u = g.one_minus(update);
        let write = g.mul(one_minus_u, cand)?;
        g.add(keep, write)
    }
}

/// TF 风格的符号函数，sign(0) = 0
fn sign(v: f32) -> f32 {
    if v > 0.0 {
        1.0
    } else if v < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// 带噪激活：`α·h(x) + (1 − α)·u(x) + d·(σ(p·(h(x) − u(x))) − ½)²·ξ`
///
/// `u` 是 `h` 在 0 处的一阶展开，`d = −sign(x)·sign(1 − α)`，
/// ξ 在训练时是半正态噪声，推理时取其期望。
fn noisy_activation(
    g: &mut Graph,
    x: Var,
    generic: Var,
    linearized: Var,
    p: Var,
) -> Result<Var> {
    let delta = g.sub(generic, linearized)?;
    let scaled = g.scale_by(delta, p)?;
    let squashed = g.sigmoid(scaled);
    let centered = g.affine(squashed, 1.0, -0.5);
    let spread = g.mul(centered, centered)?;

    let direction = g
        .value(x)
        .mapv(|v| -sign(v) * sign(1.0 - NOISY_ALPHA));
    let direction = g.constant(direction);
    let noise_term = g.mul(direction, spread)?;
    let noise = g.half_normal_noise();
    let noise_term = g.scale(noise_term, noise);

    let mixed_h = g.scale(generic, NOISY_ALPHA);
    let mixed_u = g.scale(linearized, 1.0 - NOISY_ALPHA);
    let mixed = g.add(mixed_h, mixed_u)?;
    g.add(mixed, noise_term)
}

fn noisy_sigmoid(g: &mut Graph, x: Var, p: Var) -> Result<Var> {
    let generic = g.sigmoid(x);
    let linearized = g.affine(x, 0.25, 0.5);
    noisy_activation(g, x, generic, linearized, p)
}

fn noisy_tanh(g: &mut Graph, x: Var, p: Var) -> Result<Var> {
    let generic = g.tanh(x);
    let linearized = g.scale(x, 1.0);
    noisy_activation(g, x, generic, linearized, p)
}
