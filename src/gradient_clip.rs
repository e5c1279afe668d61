//! 梯度裁剪
//!
//! 按全局 L2 范数裁剪：所有参数的梯度视为一个向量，
//! 范数超过 `clip_norm` 时整体等比缩放到 `clip_norm`，否则原样保留。

use crate::autograd::Gradients;
use crate::tensor::TensorExt;

/// 一次裁剪的结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipReport {
    /// 裁剪前的全局范数
    pub norm: f32,
    /// 实际使用的缩放因子（未裁剪时为 1）
    pub scale: f32,
}

impl ClipReport {
    pub fn clipped(&self) -> bool {
        self.scale < 1.0
    }
}

/// 全局梯度范数
///
/// ||g|| = sqrt(Σ_p Σ_ij g_pij²)
pub fn global_norm(grads: &Gradients) -> f32 {
    grads
        .iter()
        .map(|(_, g)| g.squared_norm())
        .sum::<f32>()
        .sqrt()
}

/// 按全局范数裁剪（原地）
pub fn clip_global_norm(grads: &mut Gradients, clip_norm: f32) -> ClipReport {
    let norm = global_norm(grads);

    if norm > clip_norm && norm > 0.0 {
        let scale = clip_norm / norm;
        for (_, g) in grads.iter_mut() {
            g.mapv_inplace(|v| v * scale);
        }
        ClipReport { norm, scale }
    } else {
        ClipReport { norm, scale: 1.0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamId;
    use ndarray::{arr2, Array2};

    fn grads(values: &[Array2<f32>]) -> Gradients {
        let mut grads = Gradients::default();
        for (i, v) in values.iter().enumerate() {
            grads.insert(ParamId(i), v.clone());
        }
        grads
    }

    #[test]
    fn test_global_norm() {
        // sqrt(3² + 4²) = 5
        let g = grads(&[arr2(&[[3.0, 0.0]]), arr2(&[[0.0], [4.0]])]);
        assert!((global_norm(&g) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_clip_scales_to_clip_norm() {
        let mut g = grads(&[arr2(&[[3.0, 0.0]]), arr2(&[[0.0], [4.0]])]);
        let report = clip_global_norm(&mut g, 2.5);

        assert!(report.clipped());
        assert!((report.scale - 0.5).abs() < 1e-6);
        assert!((global_norm(&g) - 2.5).abs() < 1e-5);
        assert!((g.get(ParamId(0)).unwrap()[[0, 0]] - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_below_threshold_unchanged() {
        let original = grads(&[arr2(&[[1.0, 1.0]]), arr2(&[[0.5]])]);
        let mut g = original.clone();
        let report = clip_global_norm(&mut g, 10.0);

        assert!(!report.clipped());
        for ((_, a), (_, b)) in g.iter().zip(original.iter()) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_clip_property_over_many_vectors() {
        for k in 1..20 {
            let v = k as f32 * 0.37;
            let mut g = grads(&[Array2::from_elem((2, 3), v), Array2::from_elem((1, 4), -v)]);
            let before = global_norm(&g);
            clip_global_norm(&mut g, 3.0);
            let after = global_norm(&g);
            if before > 3.0 {
                assert!((after - 3.0).abs() < 1e-4);
            } else {
                assert_eq!(after, before);
            }
        }
    }
}
