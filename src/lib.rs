//! # Mini Seq2Seq
//!
//! 一个从零实现的小型带注意力的序列到序列工具包，用于学习神经机器翻译的原理。
//!
//! ## 架构概览
//!
//! ```text
//! Source → Embedding → [Bidirectional GRU Encoder] ──┐
//!                                                     │ states / summary
//! <s> → Embedding → [GRU Decoder Step] ← Attention ←──┘
//!                          │
//!                 Output Projection → logits → Greedy / Beam Search
//! ```
//!
//! 训练时解码器使用 teacher forcing，多个输出头（序列解码器、词对齐监督）的
//! 损失加权求和后一起优化；推理时 runner 逐步自回归解码，可以集成多个模型。

pub mod alignment;
pub mod attention;
pub mod autograd;
pub mod beam_search;
pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod decoder;
pub mod early_stopping;
pub mod encoder;
pub mod error;
pub mod gradient_clip;
pub mod layers;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod params;
pub mod runner;
pub mod tensor;
pub mod trainer;
pub mod vocabulary;

pub use alignment::{parse_alignment, AlignmentDecoderConfig, WordAlignmentDecoder};
pub use attention::{Attention, AttentionConfig, AttentionKind};
pub use autograd::{Gradients, Graph, Var};
pub use beam_search::{BeamSearchConfig, BeamSearchRunner, FinishedPolicy, LengthNormalization};
pub use checkpoint::{Checkpoint, TrainingHistory};
pub use config::{
    DatasetConfig, EvaluatorConfig, Experiment, ExperimentConfig, ModelConfig, ValidationConfig,
    VocabularyConfig,
};
pub use dataset::{tokenize, Dataset, Sentence, SequenceBatch};
pub use decoder::{
    Decoder, DecoderConfig, DecoderState, EncoderCombination, InitialState, OutputProjectionKind,
};
pub use early_stopping::{EarlyStopping, EarlyStoppingConfig, EarlyStoppingMode};
pub use encoder::{Encoder, EncoderConfig, EncoderOutput, FactorConfig};
pub use error::{Result, Seq2SeqError};
pub use gradient_clip::{clip_global_norm, global_norm, ClipReport};
pub use layers::RnnCellKind;
pub use metrics::{Bleu, Evaluator, SequenceAccuracy};
pub use model::{HeadRef, Seq2SeqModel};
pub use optimizer::{Adam, Optimizer, OptimizerConfig, SGD};
pub use params::{ParamId, ParamStore};
pub use runner::{
    ensemble_log_probs, CancellationToken, DecodedSentence, GreedyRunner, Hypothesis, Runner,
    RunnerConfig, RunnerKind, RunnerOutput,
};
pub use tensor::TensorExt;
pub use trainer::{
    EpochReport, TrainStepReport, Trainer, TrainerConfig, TrainingLoop, TrainingLoopConfig,
    TrainingReport, Validation,
};
pub use vocabulary::{Vocabulary, END_ID, PAD_ID, START_ID, UNK_ID};
