//! 模型检查点保存和加载
//!
//! 参数按名字保存，JSON（可读）或 bincode（紧凑）两种格式。
//! 加载时要求名字一一对应、形状一致。

use log::info;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::error::{shape_err, Result};
use crate::params::ParamStore;
use crate::trainer::EpochReport;

/// 可序列化的 Array2 包装器
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializableArray {
    /// 数据（行优先）
    pub data: Vec<f32>,
    /// 形状 (rows, cols)
    pub shape: (usize, usize),
}

impl SerializableArray {
    pub fn from_array(arr: &Array2<f32>) -> Self {
        Self {
            data: arr.iter().copied().collect(),
            shape: arr.dim(),
        }
    }

    pub fn to_array(&self) -> Result<Array2<f32>> {
        Array2::from_shape_vec(self.shape, self.data.clone())
            .map_err(|e| shape_err!("stored array {:?}: {}", self.shape, e))
    }
}

/// 一个命名参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedArray {
    pub name: String,
    pub value: SerializableArray,
}

/// 训练检查点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// epoch 编号
    pub epoch: usize,
    /// 已执行的训练步数
    pub step: usize,
    pub params: Vec<NamedArray>,
}

impl Checkpoint {
    pub fn from_store(store: &ParamStore, epoch: usize, step: usize) -> Self {
        Self {
            epoch,
            step,
            params: store
                .iter()
                .map(|(_, p)| NamedArray {
                    name: p.name.clone(),
                    value: SerializableArray::from_array(&p.value),
                })
                .collect(),
        }
    }

    /// 写回参数存储；名字集合和形状必须完全一致，失败时存储不变
    pub fn restore(&self, store: &mut ParamStore) -> Result<()> {
        if self.params.len() != store.len() {
            return Err(shape_err!(
                "checkpoint has {} parameters, model has {}",
                self.params.len(),
                store.len()
            ));
        }

        let mut updates = Vec::with_capacity(self.params.len());
        for named in &self.params {
            let id = store
                .id_of(&named.name)
                .ok_or_else(|| shape_err!("checkpoint parameter `{}` not in model", named.name))?;
            let value = named.value.to_array()?;
            if value.dim() != store.value(id).dim() {
                return Err(shape_err!(
                    "parameter `{}`: checkpoint {:?}, model {:?}",
                    named.name,
                    value.dim(),
                    store.value(id).dim()
                ));
            }
            updates.push((id, value));
        }

        for (id, value) in updates {
            *store.value_mut(id) = value;
        }
        Ok(())
    }

    /// 保存为 JSON 格式
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let writer = BufWriter::new(File::create(path.as_ref())?);
        serde_json::to_writer_pretty(writer, self)?;
        info!("saved checkpoint (epoch {}) to {}", self.epoch, path.as_ref().display());
        Ok(())
    }

    /// 从 JSON 格式加载
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    /// 保存为二进制格式（更紧凑）
    pub fn save_binary<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let writer = BufWriter::new(File::create(path.as_ref())?);
        bincode::serialize_into(writer, self)?;
        info!("saved checkpoint (epoch {}) to {}", self.epoch, path.as_ref().display());
        Ok(())
    }

    /// 从二进制格式加载
    pub fn load_binary<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(bincode::deserialize_from(reader)?)
    }
}

/// 训练历史记录
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    /// 每个 epoch 的平均训练损失
    pub train_losses: Vec<f32>,
    /// 每个 epoch 的验证分数 (评估器名, 分数)
    pub validation: Vec<Vec<(String, f32)>>,
    /// 每个 epoch 放弃的训练步数
    pub skipped_steps: Vec<usize>,
}

impl TrainingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, epoch: &EpochReport) {
        self.train_losses.push(epoch.mean_loss);
        self.validation.push(epoch.validation.clone());
        self.skipped_steps.push(epoch.skipped_steps);
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    /// 第一个评估器分数最高的 epoch（从 1 开始）
    pub fn best_epoch(&self) -> Option<usize> {
        self.validation
            .iter()
            .enumerate()
            .filter_map(|(i, scores)| scores.first().map(|(_, s)| (i + 1, *s)))
            .fold(None, |best: Option<(usize, f32)>, (epoch, score)| match best {
                Some((_, b)) if b >= score => best,
                _ => Some((epoch, score)),
            })
            .map(|(epoch, _)| epoch)
    }

    pub fn summary(&self) -> String {
        format!(
            "Training Summary:\n  Epochs: {}\n  Best epoch: {}\n  Final Train Loss: {:.4}\n  Skipped steps: {}",
            self.train_losses.len(),
            self.best_epoch().map_or_else(|| "-".to_string(), |e| e.to_string()),
            self.train_losses.last().copied().unwrap_or(f32::NAN),
            self.skipped_steps.iter().sum::<usize>()
        )
    }
}
