//! 实验配置
//!
//! 所有部件都由带类型的配置结构构造，配置整体从 JSON 加载。
//! 名字引用（词表、编码器、解码器、runner）只在 `ExperimentConfig::build`
//! 中按依赖顺序解析一次：数据 → 词表 → 模型 → 训练器 → runner。

use log::info;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::alignment::AlignmentDecoderConfig;
use crate::dataset::{tokenize, Dataset};
use crate::decoder::DecoderConfig;
use crate::early_stopping::EarlyStoppingConfig;
use crate::encoder::EncoderConfig;
use crate::error::{config_err, Result};
use crate::metrics::{Bleu, Evaluator, SequenceAccuracy};
use crate::model::Seq2SeqModel;
use crate::runner::{CancellationToken, Runner, RunnerConfig, RunnerOutput};
use crate::trainer::{Trainer, TrainerConfig, TrainingLoop, TrainingLoopConfig, TrainingReport, Validation};
use crate::vocabulary::Vocabulary;

/// 模型结构
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub encoders: Vec<EncoderConfig>,
    pub decoders: Vec<DecoderConfig>,
    #[serde(default)]
    pub alignment_decoders: Vec<AlignmentDecoderConfig>,
    /// 参数初始化种子
    #[serde(default)]
    pub seed: u64,
}

/// 数据集：文件（每行一句）或直接内联的句子
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub name: String,
    #[serde(default)]
    pub files: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub inline: BTreeMap<String, Vec<String>>,
    /// 输出序列 → 输出文件
    #[serde(default)]
    pub outputs: BTreeMap<String, PathBuf>,
}

impl DatasetConfig {
    pub fn load(&self) -> Result<Dataset> {
        let files: Vec<(&str, &PathBuf)> = self.files.iter().map(|(id, p)| (id.as_str(), p)).collect();
        let mut dataset = Dataset::load_plain(&self.name, &files)?;
        for (id, lines) in &self.inline {
            if self.files.contains_key(id) {
                return Err(config_err!("series `{}` of `{}` given twice", id, self.name));
            }
            dataset = dataset.with_series(id.clone(), lines.iter().map(|l| tokenize(l)).collect())?;
        }
        for (id, path) in &self.outputs {
            dataset = dataset.with_output(id.clone(), path.clone());
        }
        Ok(dataset)
    }
}

/// 词表：从 JSON 文件加载，或从训练数据的某个序列统计
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VocabularyConfig {
    pub name: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// 训练集中用于统计词频的序列
    #[serde(default)]
    pub build_from: Option<String>,
    #[serde(default)]
    pub max_size: Option<usize>,
    #[serde(default = "default_min_freq")]
    pub min_freq: usize,
}

fn default_min_freq() -> usize {
    1
}

impl VocabularyConfig {
    fn load(&self, train: &Dataset) -> Result<Vocabulary> {
        match (&self.path, &self.build_from) {
            (Some(path), None) => Vocabulary::load(path),
            (None, Some(series)) => Ok(Vocabulary::from_sentences(
                train.series(series)?,
                self.max_size,
                self.min_freq,
            )),
            _ => Err(config_err!(
                "vocabulary `{}` needs exactly one of `path` and `build_from`",
                self.name
            )),
        }
    }
}

/// 评估器
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EvaluatorConfig {
    Bleu {
        #[serde(default = "default_bleu_n")]
        n: usize,
    },
    Accuracy,
}

fn default_bleu_n() -> usize {
    4
}

impl EvaluatorConfig {
    pub fn build(&self) -> Box<dyn Evaluator> {
        match *self {
            EvaluatorConfig::Bleu { n } => Box::new(Bleu::new(n)),
            EvaluatorConfig::Accuracy => Box::new(SequenceAccuracy),
        }
    }
}

/// 每个 epoch 之后的验证
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// `runners` 中某个 runner 的输出序列名
    pub runner: String,
    pub reference_series: String,
    pub evaluators: Vec<EvaluatorConfig>,
    #[serde(default)]
    pub early_stopping: Option<EarlyStoppingConfig>,
}

/// 顶层实验配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub train: DatasetConfig,
    #[serde(default)]
    pub validation_data: Option<DatasetConfig>,
    #[serde(default)]
    pub test_data: Option<DatasetConfig>,
    pub vocabularies: Vec<VocabularyConfig>,
    pub model: ModelConfig,
    pub trainer: TrainerConfig,
    pub training: TrainingLoopConfig,
    #[serde(default)]
    pub runners: Vec<RunnerConfig>,
    #[serde(default)]
    pub validation: Option<ValidationConfig>,
}

/// 构造完成的实验
pub struct Experiment {
    pub train: Dataset,
    pub validation_data: Option<Dataset>,
    pub test_data: Option<Dataset>,
    pub vocabularies: BTreeMap<String, Arc<Vocabulary>>,
    pub model: Seq2SeqModel,
    pub trainer: Trainer,
    pub training: TrainingLoop,
    pub runners: Vec<Box<dyn Runner>>,
}

impl ExperimentConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    /// 按依赖顺序构造全部部件；任何引用错误都在这里报出
    pub fn build(&self) -> Result<Experiment> {
        let train = self.train.load()?;
        let validation_data = self.validation_data.as_ref().map(DatasetConfig::load).transpose()?;
        let test_data = self.test_data.as_ref().map(DatasetConfig::load).transpose()?;

        let mut vocabularies = BTreeMap::new();
        for vocab in &self.vocabularies {
            let loaded = Arc::new(vocab.load(&train)?);
            info!("vocabulary `{}`: {} tokens", vocab.name, loaded.len());
            if vocabularies.insert(vocab.name.clone(), loaded).is_some() {
                return Err(config_err!("vocabulary `{}` defined twice", vocab.name));
            }
        }

        let model = Seq2SeqModel::new(&self.model, &vocabularies)?;
        let trainer = Trainer::new(self.trainer.clone(), &model)?;

        let mut series = HashSet::new();
        for runner in &self.runners {
            if model.decoder(&runner.decoder).is_none() {
                return Err(config_err!(
                    "runner `{}` refers to unknown decoder `{}`",
                    runner.output_series,
                    runner.decoder
                ));
            }
            if !series.insert(runner.output_series.as_str()) {
                return Err(config_err!("output series `{}` used twice", runner.output_series));
            }
        }
        let runners = self
            .runners
            .iter()
            .map(RunnerConfig::build)
            .collect::<Result<Vec<_>>>()?;

        let mut training = TrainingLoop::new(self.training.clone())?;
        if let Some(validation) = &self.validation {
            if validation_data.is_none() {
                return Err(config_err!("validation configured without validation data"));
            }
            let runner = self
                .runners
                .iter()
                .find(|r| r.output_series == validation.runner)
                .ok_or_else(|| config_err!("validation refers to unknown runner `{}`", validation.runner))?;
            training = training.with_validation(Validation {
                runner: runner.build()?,
                reference_series: validation.reference_series.clone(),
                evaluators: validation.evaluators.iter().map(EvaluatorConfig::build).collect(),
                early_stopping: validation.early_stopping,
            })?;
        }

        Ok(Experiment {
            train,
            validation_data,
            test_data,
            vocabularies,
            model,
            trainer,
            training,
            runners,
        })
    }
}

impl Experiment {
    /// 在训练集上训练，按配置做验证和早停
    pub fn train(&mut self) -> Result<TrainingReport> {
        self.training.run(
            &mut self.trainer,
            &mut self.model,
            &self.train,
            self.validation_data.as_ref(),
        )
    }

    /// 在测试集上运行所有 runner，并写出登记了文件的输出
    ///
    /// 被取消时返回 `Cancelled`，被取消的 runner 不写出任何结果
    pub fn run(&self, cancel: &CancellationToken) -> Result<Vec<RunnerOutput>> {
        let Some(data) = &self.test_data else {
            return Ok(Vec::new());
        };
        let mut outputs = Vec::with_capacity(self.runners.len());
        for runner in &self.runners {
            let output = runner.run_dataset(&[&self.model], data, cancel)?.into_completed()?;
            output.write_to(data)?;
            outputs.push(output);
        }
        Ok(outputs)
    }
}
