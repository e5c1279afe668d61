//! 优化器
//!
//! SGD（可选动量）和 Adam。优化器状态按参数名保存，
//! 因此从检查点恢复参数后状态仍然对应得上。

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::autograd::Gradients;
use crate::params::ParamStore;

/// 优化器 trait
pub trait Optimizer: std::fmt::Debug {
    /// 更新单个参数
    fn step(&mut self, param: &mut Array2<f32>, grad: &Array2<f32>, param_name: &str);

    /// 获取当前学习率
    fn lr(&self) -> f32;

    /// 设置学习率
    fn set_lr(&mut self, lr: f32);

    /// 优化器名称
    fn name(&self) -> &str;

    /// 用一组梯度更新参数存储；没有梯度的参数不动
    fn apply(&mut self, store: &mut ParamStore, grads: &Gradients) {
        for (id, grad) in grads.iter() {
            let name = store.get(id).name.clone();
            self.step(store.value_mut(id), grad, &name);
        }
    }
}

/// 优化器配置
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OptimizerConfig {
    Sgd {
        learning_rate: f32,
        #[serde(default)]
        momentum: f32,
    },
    Adam {
        learning_rate: f32,
        #[serde(default = "default_beta1")]
        beta1: f32,
        #[serde(default = "default_beta2")]
        beta2: f32,
        #[serde(default = "default_epsilon")]
        epsilon: f32,
    },
}

fn default_beta1() -> f32 {
    0.9
}

fn default_beta2() -> f32 {
    0.999
}

fn default_epsilon() -> f32 {
    1e-8
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig::Adam {
            learning_rate: 1e-3,
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_epsilon(),
        }
    }
}

impl OptimizerConfig {
    pub fn build(&self) -> Box<dyn Optimizer> {
        match *self {
            OptimizerConfig::Sgd {
                learning_rate,
                momentum,
            } => Box::new(SGD::new(learning_rate).with_momentum(momentum)),
            OptimizerConfig::Adam {
                learning_rate,
                beta1,
                beta2,
                epsilon,
            } => Box::new(
                Adam::new(learning_rate)
                    .with_betas(beta1, beta2)
                    .with_eps(epsilon),
            ),
        }
    }

    pub fn learning_rate(&self) -> f32 {
        match *self {
            OptimizerConfig::Sgd { learning_rate, .. } | OptimizerConfig::Adam { learning_rate, .. } => {
                learning_rate
            }
        }
    }
}

/// SGD（随机梯度下降）
///
/// ```text
/// v     = μ v + lr · grad
/// param = param − v
/// ```
#[derive(Debug, Clone)]
pub struct SGD {
    /// 学习率
    lr: f32,
    /// 动量系数
    momentum: f32,
    /// 参数的动量（缓存）
    velocities: HashMap<String, Array2<f32>>,
}

impl SGD {
    pub fn new(lr: f32) -> Self {
        Self {
            lr,
            momentum: 0.0,
            velocities: HashMap::new(),
        }
    }

    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }
}

impl Optimizer for SGD {
    fn step(&mut self, param: &mut Array2<f32>, grad: &Array2<f32>, param_name: &str) {
        if self.momentum > 0.0 {
            let velocity = self
                .velocities
                .entry(param_name.to_string())
                .or_insert_with(|| Array2::zeros(param.dim()));

            let (momentum, lr) = (self.momentum, self.lr);
            velocity.zip_mut_with(grad, |v, &g| *v = momentum * *v + lr * g);
            *param -= &*velocity;
        } else {
            param.scaled_add(-self.lr, grad);
        }
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    fn name(&self) -> &str {
        "SGD"
    }
}

/// Adam 优化器
///
/// ```text
/// m = β1 * m + (1 - β1) * grad
/// v = β2 * v + (1 - β2) * grad²
/// m_hat = m / (1 - β1^t)
/// v_hat = v / (1 - β2^t)
/// param = param - lr * m_hat / (√v_hat + ε)
/// ```
#[derive(Debug, Clone)]
pub struct Adam {
    /// 学习率
    lr: f32,
    /// β1：一阶矩估计的指数衰减率
    beta1: f32,
    /// β2：二阶矩估计的指数衰减率
    beta2: f32,
    /// ε：数值稳定性常数
    eps: f32,
    /// 每个参数的 (一阶矩, 二阶矩, 时间步)
    moments: HashMap<String, (Array2<f32>, Array2<f32>, i32)>,
}

impl Adam {
    pub fn new(lr: f32) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            moments: HashMap::new(),
        }
    }

    pub fn with_betas(mut self, beta1: f32, beta2: f32) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    pub fn with_eps(mut self, eps: f32) -> Self {
        self.eps = eps;
        self
    }
}

impl Optimizer for Adam {
    fn step(&mut self, param: &mut Array2<f32>, grad: &Array2<f32>, param_name: &str) {
        let (m, v, t) = self
            .moments
            .entry(param_name.to_string())
            .or_insert_with(|| (Array2::zeros(param.dim()), Array2::zeros(param.dim()), 0));
        *t += 1;

        let (beta1, beta2) = (self.beta1, self.beta2);
        m.zip_mut_with(grad, |m, &g| *m = beta1 * *m + (1.0 - beta1) * g);
        v.zip_mut_with(grad, |v, &g| *v = beta2 * *v + (1.0 - beta2) * g * g);

        // 偏差修正
        let m_correction = 1.0 - beta1.powi(*t);
        let v_correction = 1.0 - beta2.powi(*t);

        let (lr, eps) = (self.lr, self.eps);
        ndarray::Zip::from(param)
            .and(&*m)
            .and(&*v)
            .for_each(|p, &m, &v| {
                let m_hat = m / m_correction;
                let v_hat = v / v_correction;
                *p -= lr * m_hat / (v_hat.sqrt() + eps);
            });
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    fn name(&self) -> &str {
        "Adam"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn test_sgd() {
        let mut optimizer = SGD::new(0.01);
        let mut param = arr2(&[[1.0, 2.0]]);
        let grad = arr2(&[[0.1, 0.2]]);

        optimizer.step(&mut param, &grad, "test");

        // param = param - lr * grad
        assert!((param[[0, 0]] - 0.999).abs() < 1e-5);
        assert!((param[[0, 1]] - 1.998).abs() < 1e-5);
    }

    #[test]
    fn test_sgd_momentum() {
        let mut optimizer = SGD::new(0.1).with_momentum(0.9);
        let mut param = arr2(&[[1.0]]);
        let grad = arr2(&[[1.0]]);

        optimizer.step(&mut param, &grad, "test");
        assert!((param[[0, 0]] - 0.9).abs() < 1e-6);

        // v = 0.9 * 0.1 + 0.1 = 0.19
        optimizer.step(&mut param, &grad, "test");
        assert!((param[[0, 0]] - 0.71).abs() < 1e-6);
    }

    #[test]
    fn test_adam_first_step_is_lr_sized() {
        let mut optimizer = Adam::new(0.01);
        let mut param = arr2(&[[1.0, 2.0]]);
        let grad = arr2(&[[0.1, -0.2]]);

        optimizer.step(&mut param, &grad, "test");

        // 第一步的偏差修正后更新量约为 lr · sign(grad)
        assert!((param[[0, 0]] - 0.99).abs() < 1e-4);
        assert!((param[[0, 1]] - 2.01).abs() < 1e-4);
    }

    #[test]
    fn test_adam_time_step_per_parameter() {
        let mut optimizer = Adam::new(0.01);
        let mut a = arr2(&[[1.0]]);
        let mut b = arr2(&[[1.0]]);
        let grad = arr2(&[[0.5]]);

        optimizer.step(&mut a, &grad, "a");
        optimizer.step(&mut b, &grad, "b");
        assert_eq!(a, b);
    }

    #[test]
    fn test_apply_over_store() {
        let mut store = ParamStore::new();
        let w = store.register("w", arr2(&[[1.0, 1.0]]), true).unwrap();
        let untouched = store.register("u", arr2(&[[5.0]]), true).unwrap();
        let mut grads = Gradients::default();
        grads.insert(w, arr2(&[[1.0, -1.0]]));

        let mut optimizer = OptimizerConfig::Sgd {
            learning_rate: 0.5,
            momentum: 0.0,
        }
        .build();
        optimizer.apply(&mut store, &grads);

        assert_eq!(store.value(w), &arr2(&[[0.5, 1.5]]));
        assert_eq!(store.value(untouched), &arr2(&[[5.0]]));
        assert_eq!(optimizer.name(), "SGD");
    }

    #[test]
    fn test_lr_scheduling() {
        let mut optimizer = SGD::new(0.01);

        assert_eq!(optimizer.lr(), 0.01);

        optimizer.set_lr(0.001);

        assert_eq!(optimizer.lr(), 0.001);
    }
}
