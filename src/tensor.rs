//! 张量操作扩展和工具函数
//!
//! 基于 ndarray 实现编码器、注意力和解码器所需的张量操作。

use ndarray::{Array2, Axis};
use rand::Rng;

/// 张量扩展 trait
pub trait TensorExt {
    /// 创建随机张量（Xavier 均匀初始化）
    fn random_xavier<R: Rng + ?Sized>(shape: (usize, usize), rng: &mut R) -> Array2<f32>;

    /// 按行做数值稳定的 softmax（先减去最大值）
    fn softmax_rows(&self) -> Array2<f32>;

    /// 按行计算 log-softmax
    fn log_softmax_rows(&self) -> Array2<f32>;

    /// 每行最大值所在的列（并列时取最左侧）
    fn argmax_rows(&self) -> Vec<usize>;

    /// 按索引挑选行（可重复）
    fn select_rows(&self, rows: &[usize]) -> Array2<f32>;

    /// 所有元素都是有限值
    fn all_finite(&self) -> bool;

    /// Frobenius 范数的平方
    fn squared_norm(&self) -> f32;
}

impl TensorExt for Array2<f32> {
    fn random_xavier<R: Rng + ?Sized>(shape: (usize, usize), rng: &mut R) -> Array2<f32> {
        let limit = (6.0 / (shape.0 + shape.1).max(1) as f32).sqrt();

        Array2::from_shape_fn(shape, |_| rng.gen_range(-limit..limit))
    }

    fn softmax_rows(&self) -> Array2<f32> {
        let max = self.fold_axis(Axis(1), f32::NEG_INFINITY, |a, &b| a.max(b));
        let max_view = max.insert_axis(Axis(1));

        let exp = (self - &max_view).mapv(f32::exp);
        let sum = exp.sum_axis(Axis(1)).insert_axis(Axis(1));

        exp / sum
    }

    fn log_softmax_rows(&self) -> Array2<f32> {
        let max = self.fold_axis(Axis(1), f32::NEG_INFINITY, |a, &b| a.max(b));
        let max_view = max.insert_axis(Axis(1));

        let shifted = self - &max_view;
        let log_sum = shifted
            .mapv(f32::exp)
            .sum_axis(Axis(1))
            .mapv(f32::ln)
            .insert_axis(Axis(1));

        shifted - log_sum
    }

    fn argmax_rows(&self) -> Vec<usize> {
        self.rows()
            .into_iter()
            .map(|row| argmax(row.iter().copied()))
            .collect()
    }

    fn select_rows(&self, rows: &[usize]) -> Array2<f32> {
        self.select(Axis(0), rows)
    }

    fn all_finite(&self) -> bool {
        self.iter().all(|x| x.is_finite())
    }

    fn squared_norm(&self) -> f32 {
        self.iter().map(|x| x * x).sum()
    }
}

/// 最大值下标；并列时取第一个
pub fn argmax<I: IntoIterator<Item = f32>>(values: I) -> usize {
    let mut best = 0;
    let mut best_value = f32::NEG_INFINITY;
    for (i, v) in values.into_iter().enumerate() {
        if v > best_value {
            best = i;
            best_value = v;
        }
    }
    best
}

/// 填充掩码：`[batch, max_len]`，有效位置为 1.0
pub fn padding_mask(lengths: &[usize], max_len: usize) -> Array2<f32> {
    let mut mask = Array2::zeros((lengths.len(), max_len));
    for (b, &len) in lengths.iter().enumerate() {
        for t in 0..len.min(max_len) {
            mask[[b, t]] = 1.0;
        }
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_xavier_is_seeded() {
        let a: Array2<f32> = Array2::random_xavier((4, 3), &mut StdRng::seed_from_u64(7));
        let b: Array2<f32> = Array2::random_xavier((4, 3), &mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);

        let limit = (6.0f32 / 7.0).sqrt();
        assert!(a.iter().all(|x| x.abs() <= limit));
    }

    #[test]
    fn test_softmax_rows() {
        let x: Array2<f32> = arr2(&[[1.0, 2.0, 3.0], [1000.0, 1000.0, 1000.0]]);
        let s = x.softmax_rows();

        for row in s.rows() {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-6);
        }
        // 大数值不溢出
        assert!((s[[1, 0]] - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_log_softmax_matches_softmax() {
        let x: Array2<f32> = arr2(&[[0.5, -1.0, 2.0]]);
        let log_p = x.log_softmax_rows();
        let p = x.softmax_rows();
        for j in 0..3 {
            assert!((log_p[[0, j]].exp() - p[[0, j]]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_argmax_ties_take_first() {
        assert_eq!(argmax([0.1, 0.7, 0.7, 0.2]), 1);
        let x: Array2<f32> = arr2(&[[3.0, 1.0], [2.0, 2.0]]);
        assert_eq!(x.argmax_rows(), vec![0, 0]);
    }

    #[test]
    fn test_padding_mask() {
        let mask = padding_mask(&[2, 0, 3], 3);
        assert_eq!(mask, arr2(&[[1.0, 1.0, 0.0], [0.0, 0.0, 0.0], [1.0, 1.0, 1.0]]));
    }
}
