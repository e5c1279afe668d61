//! 参数存储
//!
//! 所有可训练参数按名字登记在 `ParamStore` 中，模型各部件只持有 `ParamId`。
//! 训练图和推理图都从同一个存储读取参数。

use ndarray::Array2;
use rand::Rng;
use std::collections::HashMap;

use crate::error::{config_err, Result};
use crate::tensor::TensorExt;

/// 参数句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId(pub(crate) usize);

/// 单个可训练参数
#[derive(Debug, Clone)]
pub struct Parameter {
    /// 全局唯一的名字，例如 `encoder/embedding_0`
    pub name: String,
    /// 权重数据
    pub value: Array2<f32>,
    /// 是否计入 L2 正则项（偏置不计入）
    pub regularize: bool,
}

/// 参数存储
#[derive(Debug, Clone, Default)]
pub struct ParamStore {
    params: Vec<Parameter>,
    by_name: HashMap<String, ParamId>,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一个参数；名字重复属于配置错误
    pub fn register(
        &mut self,
        name: impl Into<String>,
        value: Array2<f32>,
        regularize: bool,
    ) -> Result<ParamId> {
        let name = name.into();
        if self.by_name.contains_key(&name) {
            return Err(config_err!("parameter `{}` registered twice", name));
        }

        let id = ParamId(self.params.len());
        self.by_name.insert(name.clone(), id);
        self.params.push(Parameter {
            name,
            value,
            regularize,
        });
        Ok(id)
    }

    /// Xavier 初始化的权重矩阵
    pub fn weight<R: Rng + ?Sized>(
        &mut self,
        name: impl Into<String>,
        shape: (usize, usize),
        rng: &mut R,
    ) -> Result<ParamId> {
        self.register(name, Array2::random_xavier(shape, rng), true)
    }

    /// 常数初始化的偏置 `[1, size]`
    pub fn bias(&mut self, name: impl Into<String>, size: usize, init: f32) -> Result<ParamId> {
        self.register(name, Array2::from_elem((1, size), init), false)
    }

    pub fn get(&self, id: ParamId) -> &Parameter {
        &self.params[id.0]
    }

    pub fn value(&self, id: ParamId) -> &Array2<f32> {
        &self.params[id.0].value
    }

    pub fn value_mut(&mut self, id: ParamId) -> &mut Array2<f32> {
        &mut self.params[id.0].value
    }

    pub fn id_of(&self, name: &str) -> Option<ParamId> {
        self.by_name.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParamId, &Parameter)> {
        self.params.iter().enumerate().map(|(i, p)| (ParamId(i), p))
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// 标量参数总数
    pub fn param_count(&self) -> usize {
        self.params.iter().map(|p| p.value.len()).sum()
    }

    /// Σ‖p‖²，只统计需要正则化的参数
    pub fn l2_squared(&self) -> f32 {
        self.params
            .iter()
            .filter(|p| p.regularize)
            .map(|p| p.value.squared_norm())
            .sum()
    }

    /// 所有参数均为有限值
    pub fn all_finite(&self) -> bool {
        self.params.iter().all(|p| p.value.all_finite())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_register_and_lookup() {
        let mut store = ParamStore::new();
        let mut rng = StdRng::seed_from_u64(0);
        let w = store.weight("w", (3, 2), &mut rng).unwrap();
        let b = store.bias("b", 2, 0.5).unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.param_count(), 8);
        assert_eq!(store.id_of("w"), Some(w));
        assert_eq!(store.value(b), &arr2(&[[0.5, 0.5]]));
        assert!(!store.get(b).regularize);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut store = ParamStore::new();
        store.bias("b", 2, 0.0).unwrap();
        assert!(store.bias("b", 2, 0.0).is_err());
    }

    #[test]
    fn test_l2_skips_biases() {
        let mut store = ParamStore::new();
        store.register("w", arr2(&[[1.0, 2.0]]), true).unwrap();
        store.register("b", arr2(&[[10.0]]), false).unwrap();

        assert!((store.l2_squared() - 5.0).abs() < 1e-6);
    }
}
