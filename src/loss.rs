//! 损失函数
//!
//! 在计算图上构造解码器的损失项，结果均为 `[1, 1]`。

use ndarray::Array2;

use crate::autograd::{Graph, Var};
use crate::dataset::SequenceBatch;
use crate::error::{shape_err, Result};

/// 按真实长度掩码的 token 级交叉熵
///
/// ```text
/// L = −(1 / Σ mask) · Σ_t Σ_b mask[b,t] · log p_t(y[b,t])
/// ```
///
/// 填充位置不参与平均；整个 batch 都为空时损失为 0。
pub fn sequence_cross_entropy(g: &mut Graph, logits: &[Var], targets: &SequenceBatch) -> Result<Var> {
    if logits.len() != targets.max_len() {
        return Err(shape_err!(
            "{} logit steps for targets of length {}",
            logits.len(),
            targets.max_len()
        ));
    }

    let total: f32 = targets.mask.sum();
    if total == 0.0 {
        return Ok(g.zeros((1, 1)));
    }

    let mut terms = Vec::with_capacity(logits.len());
    for (t, &step_logits) in logits.iter().enumerate() {
        let weights: Vec<f32> = targets.mask.column(t).iter().map(|&m| m / total).collect();
        terms.push(g.softmax_cross_entropy(step_logits, &targets.column(t), &weights)?);
    }
    g.add_n(&terms)
}

/// 分布交叉熵（用于对齐监督）
///
/// `distributions[t]` 是第 t 步的 `[batch, src_len]`，`targets[t]` 是同形的目标分布，
/// `row_weights[t][b]` 为 0 的行不参与。
pub fn distribution_cross_entropy(
    g: &mut Graph,
    distributions: &[Var],
    targets: &[Array2<f32>],
    row_weights: &[Vec<f32>],
) -> Result<Var> {
    if distributions.len() != targets.len() || targets.len() != row_weights.len() {
        return Err(shape_err!(
            "{} distributions, {} targets, {} weight rows",
            distributions.len(),
            targets.len(),
            row_weights.len()
        ));
    }
    if distributions.is_empty() {
        return Ok(g.zeros((1, 1)));
    }

    let mut terms = Vec::with_capacity(distributions.len());
    for ((&p, target), weights) in distributions.iter().zip(targets).zip(row_weights) {
        terms.push(g.distribution_cross_entropy(p, target, weights, 1e-8)?);
    }
    g.add_n(&terms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn test_padding_excluded_from_average() {
        let mut g = Graph::inference();
        // 两个位置的 logits 全相同：每个有效 token 的损失都是 ln 4
        let logits: Vec<Var> = (0..2).map(|_| g.zeros((2, 4))).collect();
        let targets = SequenceBatch::from_sequences(vec![vec![1, 2], vec![3]]);

        let loss = sequence_cross_entropy(&mut g, &logits, &targets).unwrap();
        assert!((g.scalar(loss) - 4.0f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn test_padding_logits_do_not_matter() {
        let targets = SequenceBatch::from_sequences(vec![vec![1, 2], vec![3]]);
        let loss_with = |pad_value: f32| {
            let mut g = Graph::inference();
            let first = g.zeros((2, 4));
            let mut second = Array2::zeros((2, 4));
            second.row_mut(1).fill(pad_value);
            let second = g.constant(second);
            let loss = sequence_cross_entropy(&mut g, &[first, second], &targets).unwrap();
            g.scalar(loss)
        };
        assert_eq!(loss_with(0.0), loss_with(25.0));
    }

    #[test]
    fn test_length_mismatch() {
        let mut g = Graph::inference();
        let logits = vec![g.zeros((1, 4))];
        let targets = SequenceBatch::from_sequences(vec![vec![1, 2]]);
        assert!(sequence_cross_entropy(&mut g, &logits, &targets).is_err());
    }

    #[test]
    fn test_distribution_cross_entropy() {
        let mut g = Graph::inference();
        let p = g.constant(arr2(&[[0.5, 0.5], [0.9, 0.1]]));
        let target = arr2(&[[1.0, 0.0], [0.0, 1.0]]);
        let loss = distribution_cross_entropy(&mut g, &[p], &[target], &[vec![1.0, 0.0]]).unwrap();
        assert!((g.scalar(loss) - 2.0f32.ln()).abs() < 1e-5);
    }
}
