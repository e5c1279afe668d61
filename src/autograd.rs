//! 自动求导
//!
//! 基于计算图（tape）的反向模式自动求导。每个运算都在 `Graph` 中追加一个节点，
//! `Var` 只是节点下标。训练和推理使用同一套运算：训练模式的图额外带一个
//! 随机数发生器，用于 dropout 和带噪激活。
//!
//! ```text
//! ParamStore ──param()──▶ Graph ──ops──▶ loss ──backward()──▶ Gradients
//! ```

use ndarray::{s, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap};

use crate::error::{shape_err, Result};
use crate::params::{ParamId, ParamStore};
use crate::tensor::TensorExt;

/// 计算图中的变量句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Var(usize);

/// 计算图节点的运算类型
#[derive(Debug, Clone)]
enum TensorOp {
    /// 常量（不需要梯度）
    Constant,
    /// 参数叶子节点
    Param(ParamId),
    MatMul(Var, Var),
    Add(Var, Var),
    Sub(Var, Var),
    /// `[n, m] + [1, m]`
    AddRow(Var, Var),
    /// 逐元素乘法
    Mul(Var, Var),
    /// `[n, m] * [n, 1]`
    MulCol(Var, Var),
    /// `[n, m] * [1, 1]`
    ScaleBy(Var, Var),
    /// `a * x + b`，只需保存斜率
    Affine(Var, f32),
    Sigmoid(Var),
    Tanh(Var),
    ConcatCols(Vec<Var>),
    /// 列切片的起始列（宽度由节点值决定）
    SliceCols(Var, usize),
    /// 按行查表（嵌入）
    Gather(Var, Vec<usize>),
    /// 相邻 k 列取最大值
    Maxout(Var, usize),
    RowSum(Var),
    /// 掩码 softmax，输出存放在节点值中
    MaskedSoftmax(Var),
    /// softmax 交叉熵：logits、目标 id、每行权重
    SoftmaxXent(Var, Vec<usize>, Vec<f32>),
    /// 分布交叉熵：概率、目标分布、每行权重、eps
    DistXent(Var, Array2<f32>, Vec<f32>, f32),
    SumSquares(Var),
}

#[derive(Debug, Clone)]
struct Node {
    value: Array2<f32>,
    op: TensorOp,
}

/// 计算图
#[derive(Debug)]
pub struct Graph {
    nodes: Vec<Node>,
    params: HashMap<ParamId, Var>,
    /// 训练模式下的随机源；推理模式为 None
    rng: Option<StdRng>,
}

impl Graph {
    /// 训练模式：dropout 生效，带噪激活采样噪声
    pub fn training(seed: u64) -> Self {
        Self {
            nodes: Vec::new(),
            params: HashMap::new(),
            rng: Some(StdRng::seed_from_u64(seed)),
        }
    }

    /// 推理模式：完全确定
    pub fn inference() -> Self {
        Self {
            nodes: Vec::new(),
            params: HashMap::new(),
            rng: None,
        }
    }

    pub fn is_training(&self) -> bool {
        self.rng.is_some()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn push(&mut self, value: Array2<f32>, op: TensorOp) -> Var {
        self.nodes.push(Node { value, op });
        Var(self.nodes.len() - 1)
    }

    pub fn value(&self, v: Var) -> &Array2<f32> {
        &self.nodes[v.0].value
    }

    /// `[1, 1]` 变量的标量值
    pub fn scalar(&self, v: Var) -> f32 {
        self.nodes[v.0].value[[0, 0]]
    }

    pub fn dim(&self, v: Var) -> (usize, usize) {
        self.nodes[v.0].value.dim()
    }

    pub fn constant(&mut self, value: Array2<f32>) -> Var {
        self.push(value, TensorOp::Constant)
    }

    pub fn zeros(&mut self, shape: (usize, usize)) -> Var {
        self.constant(Array2::zeros(shape))
    }

    /// 参数叶子；同一参数在一张图中只出现一次
    pub fn param(&mut self, store: &ParamStore, id: ParamId) -> Var {
        if let Some(&v) = self.params.get(&id) {
            return v;
        }
        let v = self.push(store.value(id).clone(), TensorOp::Param(id));
        self.params.insert(id, v);
        v
    }

    pub fn matmul(&mut self, a: Var, b: Var) -> Result<Var> {
        let (av, bv) = (self.value(a), self.value(b));
        if av.ncols() != bv.nrows() {
            return Err(shape_err!("matmul {:?} x {:?}", av.dim(), bv.dim()));
        }
        let value = av.dot(bv);
        Ok(self.push(value, TensorOp::MatMul(a, b)))
    }

    fn same_dim(&self, a: Var, b: Var, what: &str) -> Result<()> {
        if self.dim(a) != self.dim(b) {
            return Err(shape_err!("{} {:?} vs {:?}", what, self.dim(a), self.dim(b)));
        }
        Ok(())
    }

    pub fn add(&mut self, a: Var, b: Var) -> Result<Var> {
        self.same_dim(a, b, "add")?;
        let value = self.value(a) + self.value(b);
        Ok(self.push(value, TensorOp::Add(a, b)))
    }

    pub fn sub(&mut self, a: Var, b: Var) -> Result<Var> {
        self.same_dim(a, b, "sub")?;
        let value = self.value(a) - self.value(b);
        Ok(self.push(value, TensorOp::Sub(a, b)))
    }

    /// 多个同形变量求和
    pub fn add_n(&mut self, vars: &[Var]) -> Result<Var> {
        let (&first, rest) = vars
            .split_first()
            .ok_or_else(|| shape_err!("add_n over an empty list"))?;
        rest.iter().try_fold(first, |acc, &v| self.add(acc, v))
    }

    /// 行广播加法（偏置）
    pub fn add_row(&mut self, x: Var, row: Var) -> Result<Var> {
        let (xv, rv) = (self.value(x), self.value(row));
        if rv.nrows() != 1 || rv.ncols() != xv.ncols() {
            return Err(shape_err!("add_row {:?} + {:?}", xv.dim(), rv.dim()));
        }
        let value = xv + rv;
        Ok(self.push(value, TensorOp::AddRow(x, row)))
    }

    pub fn mul(&mut self, a: Var, b: Var) -> Result<Var> {
        self.same_dim(a, b, "mul")?;
        let value = self.value(a) * self.value(b);
        Ok(self.push(value, TensorOp::Mul(a, b)))
    }

    /// 列广播乘法：每行乘以同一个系数
    pub fn mul_col(&mut self, x: Var, col: Var) -> Result<Var> {
        let (xv, cv) = (self.value(x), self.value(col));
        if cv.ncols() != 1 || cv.nrows() != xv.nrows() {
            return Err(shape_err!("mul_col {:?} * {:?}", xv.dim(), cv.dim()));
        }
        let value = xv * cv;
        Ok(self.push(value, TensorOp::MulCol(x, col)))
    }

    /// 乘以 `[1, 1]` 变量
    pub fn scale_by(&mut self, x: Var, s: Var) -> Result<Var> {
        if self.dim(s) != (1, 1) {
            return Err(shape_err!("scale_by expects a [1, 1] factor, got {:?}", self.dim(s)));
        }
        let factor = self.scalar(s);
        let value = self.value(x).mapv(|v| v * factor);
        Ok(self.push(value, TensorOp::ScaleBy(x, s)))
    }

    pub fn scale(&mut self, x: Var, a: f32) -> Var {
        self.affine(x, a, 0.0)
    }

    /// `a * x + b`
    pub fn affine(&mut self, x: Var, a: f32, b: f32) -> Var {
        let value = self.value(x).mapv(|v| a * v + b);
        self.push(value, TensorOp::Affine(x, a))
    }

    /// `1 - x`
    pub fn one_minus(&mut self, x: Var) -> Var {
        self.affine(x, -1.0, 1.0)
    }

    pub fn sigmoid(&mut self, x: Var) -> Var {
        let value = self.value(x).mapv(|v| 1.0 / (1.0 + (-v).exp()));
        self.push(value, TensorOp::Sigmoid(x))
    }

    pub fn tanh(&mut self, x: Var) -> Var {
        let value = self.value(x).mapv(f32::tanh);
        self.push(value, TensorOp::Tanh(x))
    }

    /// 按列拼接
    pub fn concat_cols(&mut self, parts: &[Var]) -> Result<Var> {
        if parts.len() == 1 {
            return Ok(parts[0]);
        }
        let views: Vec<_> = parts.iter().map(|&p| self.value(p).view()).collect();
        let value = ndarray::concatenate(Axis(1), &views)
            .map_err(|e| shape_err!("concat_cols: {}", e))?;
        Ok(self.push(value, TensorOp::ConcatCols(parts.to_vec())))
    }

    /// 取 `[start, end)` 列
    pub fn slice_cols(&mut self, x: Var, start: usize, end: usize) -> Result<Var> {
        let xv = self.value(x);
        if start > end || end > xv.ncols() {
            return Err(shape_err!("slice_cols {}..{} of {:?}", start, end, xv.dim()));
        }
        let value = xv.slice(s![.., start..end]).to_owned();
        Ok(self.push(value, TensorOp::SliceCols(x, start)))
    }

    /// 嵌入查表：返回 `[ids.len(), dim]`
    pub fn gather(&mut self, table: Var, ids: &[usize]) -> Result<Var> {
        let tv = self.value(table);
        if let Some(&bad) = ids.iter().find(|&&id| id >= tv.nrows()) {
            return Err(shape_err!("id {} outside table of {} rows", bad, tv.nrows()));
        }
        let value = tv.select(Axis(0), ids);
        Ok(self.push(value, TensorOp::Gather(table, ids.to_vec())))
    }

    /// Maxout：相邻 `pool` 列取最大值
    pub fn maxout(&mut self, x: Var, pool: usize) -> Result<Var> {
        let xv = self.value(x);
        if pool == 0 || xv.ncols() % pool != 0 {
            return Err(shape_err!("maxout pool {} over {} columns", pool, xv.ncols()));
        }
        let (n, m) = xv.dim();
        let value = Array2::from_shape_fn((n, m / pool), |(i, j)| {
            (0..pool)
                .map(|k| xv[[i, j * pool + k]])
                .fold(f32::NEG_INFINITY, f32::max)
        });
        Ok(self.push(value, TensorOp::Maxout(x, pool)))
    }

    /// `[n, m] -> [n, 1]`
    pub fn row_sum(&mut self, x: Var) -> Var {
        let value = self.value(x).sum_axis(Axis(1)).insert_axis(Axis(1));
        self.push(value, TensorOp::RowSum(x))
    }

    /// 掩码 softmax（按行）
    ///
    /// 掩码为 0 的位置权重恰好为 0，与原始分数无关；全部被掩码的行输出全 0。
    pub fn masked_softmax(&mut self, x: Var, mask: &Array2<f32>) -> Result<Var> {
        let xv = self.value(x);
        if xv.dim() != mask.dim() {
            return Err(shape_err!("masked_softmax {:?} with mask {:?}", xv.dim(), mask.dim()));
        }

        let mut value = Array2::zeros(xv.dim());
        for ((mut out, row), m) in value
            .rows_mut()
            .into_iter()
            .zip(xv.rows())
            .zip(mask.rows())
        {
            let max = row
                .iter()
                .zip(m.iter())
                .filter(|(_, &m)| m > 0.0)
                .map(|(&v, _)| v)
                .fold(f32::NEG_INFINITY, f32::max);
            if max == f32::NEG_INFINITY {
                continue;
            }
            let mut sum = 0.0;
            for ((o, &v), &m) in out.iter_mut().zip(row.iter()).zip(m.iter()) {
                if m > 0.0 {
                    *o = (v - max).exp();
                    sum += *o;
                }
            }
            out.mapv_inplace(|o| o / sum);
        }
        Ok(self.push(value, TensorOp::MaskedSoftmax(x)))
    }

    /// softmax 交叉熵，返回 `[1, 1]`
    ///
    /// `loss = Σ_b w_b · −log softmax(logits_b)[target_b]`，权重为 0 的行被跳过。
    pub fn softmax_cross_entropy(
        &mut self,
        logits: Var,
        targets: &[usize],
        weights: &[f32],
    ) -> Result<Var> {
        let lv = self.value(logits);
        if targets.len() != lv.nrows() || weights.len() != lv.nrows() {
            return Err(shape_err!(
                "cross entropy over {} rows with {} targets and {} weights",
                lv.nrows(),
                targets.len(),
                weights.len()
            ));
        }
        if let Some(&bad) = targets.iter().find(|&&t| t >= lv.ncols()) {
            return Err(shape_err!("target id {} outside {} classes", bad, lv.ncols()));
        }

        let log_probs = lv.log_softmax_rows();
        let loss: f32 = targets
            .iter()
            .zip(weights)
            .enumerate()
            .filter(|(_, (_, &w))| w != 0.0)
            .map(|(b, (&t, &w))| -w * log_probs[[b, t]])
            .sum();

        Ok(self.push(
            Array2::from_elem((1, 1), loss),
            TensorOp::SoftmaxXent(logits, targets.to_vec(), weights.to_vec()),
        ))
    }

    /// 分布交叉熵 `−Σ_b w_b Σ_j target[b,j]·ln(p[b,j] + eps)`
    pub fn distribution_cross_entropy(
        &mut self,
        probs: Var,
        target: &Array2<f32>,
        weights: &[f32],
        eps: f32,
    ) -> Result<Var> {
        let pv = self.value(probs);
        if pv.dim() != target.dim() || weights.len() != pv.nrows() {
            return Err(shape_err!(
                "distribution cross entropy {:?} vs target {:?}",
                pv.dim(),
                target.dim()
            ));
        }

        let mut loss = 0.0;
        for (b, &w) in weights.iter().enumerate() {
            if w == 0.0 {
                continue;
            }
            for j in 0..pv.ncols() {
                let t = target[[b, j]];
                if t != 0.0 {
                    loss -= w * t * (pv[[b, j]] + eps).ln();
                }
            }
        }

        Ok(self.push(
            Array2::from_elem((1, 1), loss),
            TensorOp::DistXent(probs, target.clone(), weights.to_vec(), eps),
        ))
    }

    /// `Σ x²`，返回 `[1, 1]`
    pub fn sum_squares(&mut self, x: Var) -> Var {
        let value = Array2::from_elem((1, 1), self.value(x).squared_norm());
        self.push(value, TensorOp::SumSquares(x))
    }

    /// 训练模式下的 dropout；推理模式或 keep_prob >= 1 时原样返回
    pub fn dropout(&mut self, x: Var, keep_prob: f32) -> Result<Var> {
        if keep_prob >= 1.0 {
            return Ok(x);
        }
        let dim = self.dim(x);
        let mask = match self.rng.as_mut() {
            None => return Ok(x),
            Some(rng) => Array2::from_shape_fn(dim, |_| {
                if rng.gen::<f32>() < keep_prob {
                    1.0 / keep_prob
                } else {
                    0.0
                }
            }),
        };
        let mask = self.constant(mask);
        self.mul(x, mask)
    }

    /// 半正态噪声 |N(0, 1)|；推理模式返回其期望 √(2/π)
    pub fn half_normal_noise(&mut self) -> f32 {
        match self.rng.as_mut() {
            None => (2.0 / std::f32::consts::PI).sqrt(),
            Some(rng) => {
                // Box-Muller
                let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
                let u2: f32 = rng.gen();
                ((-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()).abs()
            }
        }
    }

    /// 反向传播，返回每个参数的梯度
    pub fn backward(&self, root: Var) -> Result<Gradients> {
        if self.dim(root) != (1, 1) {
            return Err(shape_err!("backward from a non-scalar of shape {:?}", self.dim(root)));
        }

        let mut grads: Vec<Option<Array2<f32>>> = vec![None; root.0 + 1];
        grads[root.0] = Some(Array2::ones((1, 1)));
        let mut by_param = BTreeMap::new();

        for i in (0..=root.0).rev() {
            let Some(g) = grads[i].take() else { continue };
            let node = &self.nodes[i];

            match &node.op {
                TensorOp::Constant => {}
                TensorOp::Param(id) => {
                    by_param.insert(*id, g);
                }
                TensorOp::MatMul(a, b) => {
                    let ga = g.dot(&self.value(*b).t());
                    let gb = self.value(*a).t().dot(&g);
                    accumulate(&mut grads, *a, ga);
                    accumulate(&mut grads, *b, gb);
                }
                TensorOp::Add(a, b) => {
                    accumulate(&mut grads, *a, g.clone());
                    accumulate(&mut grads, *b, g);
                }
                TensorOp::Sub(a, b) => {
                    accumulate(&mut grads, *a, g.clone());
                    accumulate(&mut grads, *b, -g);
                }
                TensorOp::AddRow(x, row) => {
                    let grow = g.sum_axis(Axis(0)).insert_axis(Axis(0));
                    accumulate(&mut grads, *x, g);
                    accumulate(&mut grads, *row, grow);
                }
                TensorOp::Mul(a, b) => {
                    let ga = &g * self.value(*b);
                    let gb = &g * self.value(*a);
                    accumulate(&mut grads, *a, ga);
                    accumulate(&mut grads, *b, gb);
                }
                TensorOp::MulCol(x, col) => {
                    let gx = &g * self.value(*col);
                    let gcol = (&g * self.value(*x)).sum_axis(Axis(1)).insert_axis(Axis(1));
                    accumulate(&mut grads, *x, gx);
                    accumulate(&mut grads, *col, gcol);
                }
                TensorOp::ScaleBy(x, s) => {
                    let factor = self.scalar(*s);
                    let gs = (&g * self.value(*x)).sum();
                    accumulate(&mut grads, *x, g.mapv(|v| v * factor));
                    accumulate(&mut grads, *s, Array2::from_elem((1, 1), gs));
                }
                TensorOp::Affine(x, a) => {
                    accumulate(&mut grads, *x, g.mapv(|v| v * a));
                }
                TensorOp::Sigmoid(x) => {
                    let gx = &g * &node.value.mapv(|y| y * (1.0 - y));
                    accumulate(&mut grads, *x, gx);
                }
                TensorOp::Tanh(x) => {
                    let gx = &g * &node.value.mapv(|y| 1.0 - y * y);
                    accumulate(&mut grads, *x, gx);
                }
                TensorOp::ConcatCols(parts) => {
                    let mut offset = 0;
                    for &part in parts {
                        let width = self.value(part).ncols();
                        let gp = g.slice(s![.., offset..offset + width]).to_owned();
                        accumulate(&mut grads, part, gp);
                        offset += width;
                    }
                }
                TensorOp::SliceCols(x, start) => {
                    let width = node.value.ncols();
                    let mut gx = Array2::zeros(self.dim(*x));
                    let mut window = gx.slice_mut(s![.., *start..*start + width]);
                    window += &g;
                    accumulate(&mut grads, *x, gx);
                }
                TensorOp::Gather(table, ids) => {
                    let mut gt = Array2::zeros(self.dim(*table));
                    for (i, &id) in ids.iter().enumerate() {
                        let mut row = gt.row_mut(id);
                        row += &g.row(i);
                    }
                    accumulate(&mut grads, *table, gt);
                }
                TensorOp::Maxout(x, pool) => {
                    let xv = self.value(*x);
                    let mut gx = Array2::zeros(xv.dim());
                    for ((i, j), &gij) in g.indexed_iter() {
                        let base = j * pool;
                        let mut best = base;
                        for k in base + 1..base + pool {
                            if xv[[i, k]] > xv[[i, best]] {
                                best = k;
                            }
                        }
                        gx[[i, best]] += gij;
                    }
                    accumulate(&mut grads, *x, gx);
                }
                TensorOp::RowSum(x) => {
                    let gx = Array2::from_shape_fn(self.dim(*x), |(i, _)| g[[i, 0]]);
                    accumulate(&mut grads, *x, gx);
                }
                TensorOp::MaskedSoftmax(x) => {
                    let y = &node.value;
                    let dot = (&g * y).sum_axis(Axis(1)).insert_axis(Axis(1));
                    let gx = y * &(&g - &dot);
                    accumulate(&mut grads, *x, gx);
                }
                TensorOp::SoftmaxXent(logits, targets, weights) => {
                    let upstream = g[[0, 0]];
                    let mut gx = self.value(*logits).softmax_rows();
                    for (b, (&t, &w)) in targets.iter().zip(weights).enumerate() {
                        let mut row = gx.row_mut(b);
                        if w == 0.0 {
                            row.fill(0.0);
                            continue;
                        }
                        row[t] -= 1.0;
                        row *= upstream * w;
                    }
                    accumulate(&mut grads, *logits, gx);
                }
                TensorOp::DistXent(probs, target, weights, eps) => {
                    let upstream = g[[0, 0]];
                    let pv = self.value(*probs);
                    let gp = Array2::from_shape_fn(pv.dim(), |(b, j)| {
                        let w = weights[b];
                        if w == 0.0 || target[[b, j]] == 0.0 {
                            0.0
                        } else {
                            -upstream * w * target[[b, j]] / (pv[[b, j]] + eps)
                        }
                    });
                    accumulate(&mut grads, *probs, gp);
                }
                TensorOp::SumSquares(x) => {
                    let upstream = g[[0, 0]];
                    let gx = self.value(*x).mapv(|v| 2.0 * v * upstream);
                    accumulate(&mut grads, *x, gx);
                }
            }
        }

        Ok(Gradients { by_param })
    }
}

fn accumulate(grads: &mut [Option<Array2<f32>>], v: Var, delta: Array2<f32>) {
    match &mut grads[v.0] {
        Some(g) => *g += &delta,
        slot @ None => *slot = Some(delta),
    }
}

/// 参数梯度（按参数顺序排列，保证确定性）
#[derive(Debug, Clone, Default)]
pub struct Gradients {
    by_param: BTreeMap<ParamId, Array2<f32>>,
}

impl Gradients {
    pub fn get(&self, id: ParamId) -> Option<&Array2<f32>> {
        self.by_param.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParamId, &Array2<f32>)> {
        self.by_param.iter().map(|(&id, g)| (id, g))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ParamId, &mut Array2<f32>)> {
        self.by_param.iter_mut().map(|(&id, g)| (id, g))
    }

    pub fn len(&self) -> usize {
        self.by_param.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_param.is_empty()
    }

    pub fn insert(&mut self, id: ParamId, grad: Array2<f32>) {
        self.by_param.insert(id, grad);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    /// 数值梯度：中心差分
    fn numeric_grad<F>(store: &ParamStore, id: ParamId, f: F) -> Array2<f32>
    where
        F: Fn(&ParamStore) -> f32,
    {
        let eps = 1e-3;
        let mut grad = Array2::zeros(store.value(id).dim());
        for idx in 0..grad.len() {
            let (r, c) = (idx / grad.ncols(), idx % grad.ncols());
            let mut plus = store.clone();
            plus.value_mut(id)[[r, c]] += eps;
            let mut minus = store.clone();
            minus.value_mut(id)[[r, c]] -= eps;
            grad[[r, c]] = (f(&plus) - f(&minus)) / (2.0 * eps);
        }
        grad
    }

    fn assert_close(a: &Array2<f32>, b: &Array2<f32>, tol: f32) {
        assert_eq!(a.dim(), b.dim());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < tol, "{} vs {}", x, y);
        }
    }

    #[test]
    fn test_matmul_tanh_xent_gradient() {
        let mut store = ParamStore::new();
        let w = store
            .register("w", arr2(&[[0.3, -0.2, 0.5], [0.1, 0.4, -0.6]]), true)
            .unwrap();
        let b = store.register("b", arr2(&[[0.05, -0.1, 0.2]]), false).unwrap();
        let x = arr2(&[[1.0, 2.0], [-0.5, 0.3]]);

        let loss_of = |store: &ParamStore| -> (Graph, Var) {
            let mut g = Graph::inference();
            let xv = g.constant(x.clone());
            let wv = g.param(store, w);
            let bv = g.param(store, b);
            let h = g.matmul(xv, wv).unwrap();
            let h = g.add_row(h, bv).unwrap();
            let h = g.tanh(h);
            let loss = g.softmax_cross_entropy(h, &[2, 0], &[0.5, 0.5]).unwrap();
            (g, loss)
        };

        let (g, loss) = loss_of(&store);
        let grads = g.backward(loss).unwrap();

        let num_w = numeric_grad(&store, w, |s| {
            let (g, l) = loss_of(s);
            g.scalar(l)
        });
        assert_close(grads.get(w).unwrap(), &num_w, 1e-3);

        let num_b = numeric_grad(&store, b, |s| {
            let (g, l) = loss_of(s);
            g.scalar(l)
        });
        assert_close(grads.get(b).unwrap(), &num_b, 1e-3);
    }

    #[test]
    fn test_masked_softmax_zeroes_masked_positions() {
        let mut g = Graph::inference();
        let x = g.constant(arr2(&[[1.0, 50.0, 2.0], [f32::NAN, 0.0, 0.0]]));
        let mask = arr2(&[[1.0, 0.0, 1.0], [0.0, 1.0, 1.0]]);
        let y = g.masked_softmax(x, &mask).unwrap();
        let yv = g.value(y);

        assert_eq!(yv[[0, 1]], 0.0);
        assert_eq!(yv[[1, 0]], 0.0);
        for row in yv.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_masked_softmax_and_gather_gradient() {
        let mut store = ParamStore::new();
        let table = store
            .register("table", arr2(&[[0.2, -0.3, 0.1], [0.4, 0.0, -0.2], [0.3, 0.3, 0.3]]), true)
            .unwrap();
        let mask = arr2(&[[1.0, 1.0, 0.0], [1.0, 1.0, 1.0]]);
        let target = arr2(&[[0.0, 1.0, 0.0], [0.5, 0.0, 0.5]]);

        let loss_of = |store: &ParamStore| -> (Graph, Var) {
            let mut g = Graph::inference();
            let t = g.param(store, table);
            let rows = g.gather(t, &[0, 2]).unwrap();
            let doubled = g.scale(rows, 2.0);
            let p = g.masked_softmax(doubled, &mask).unwrap();
            let loss = g.distribution_cross_entropy(p, &target, &[1.0, 1.0], 1e-8).unwrap();
            (g, loss)
        };

        let (g, loss) = loss_of(&store);
        let grads = g.backward(loss).unwrap();
        let num = numeric_grad(&store, table, |s| {
            let (g, l) = loss_of(s);
            g.scalar(l)
        });
        assert_close(grads.get(table).unwrap(), &num, 2e-3);
        // 第 1 行没有被查表，梯度为 0
        assert!(grads.get(table).unwrap().row(1).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_maxout_concat_mulcol_gradient() {
        let mut store = ParamStore::new();
        let a = store
            .register("a", arr2(&[[0.5, -0.1, 0.3, 0.9], [0.2, 0.7, -0.4, 0.1]]), true)
            .unwrap();
        let c = store.register("c", arr2(&[[0.8], [-1.2]]), true).unwrap();

        let loss_of = |store: &ParamStore| -> (Graph, Var) {
            let mut g = Graph::inference();
            let av = g.param(store, a);
            let cv = g.param(store, c);
            let m = g.maxout(av, 2).unwrap();
            let left = g.slice_cols(av, 0, 1).unwrap();
            let joined = g.concat_cols(&[m, left]).unwrap();
            let scaled = g.mul_col(joined, cv).unwrap();
            let s = g.sigmoid(scaled);
            let loss = g.sum_squares(s);
            (g, loss)
        };

        let (g, loss) = loss_of(&store);
        let grads = g.backward(loss).unwrap();
        for id in [a, c] {
            let num = numeric_grad(&store, id, |s| {
                let (g, l) = loss_of(s);
                g.scalar(l)
            });
            assert_close(grads.get(id).unwrap(), &num, 2e-3);
        }
    }

    #[test]
    fn test_backward_requires_scalar() {
        let mut g = Graph::inference();
        let x = g.constant(Array2::zeros((2, 2)));
        assert!(g.backward(x).is_err());
    }

    #[test]
    fn test_dropout_only_in_training() {
        let mut g = Graph::inference();
        let x = g.constant(Array2::ones((4, 4)));
        assert_eq!(g.dropout(x, 0.5).unwrap(), x);

        let mut g = Graph::training(3);
        let x = g.constant(Array2::ones((4, 4)));
        let y = g.dropout(x, 0.5).unwrap();
        assert!(g.value(y).iter().all(|&v| v == 0.0 || v == 2.0));
    }

    #[test]
    fn test_half_normal_noise() {
        let mut g = Graph::inference();
        assert!((g.half_normal_noise() - 0.797_884_6).abs() < 1e-5);

        let mut g = Graph::training(11);
        for _ in 0..20 {
            let n = g.half_normal_noise();
            assert!(n >= 0.0 && n.is_finite());
        }
    }
}
