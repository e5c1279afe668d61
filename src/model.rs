//! 序列到序列模型
//!
//! 把编码器、序列解码器和对齐解码器组装在一起。所有部件共享一个 `ParamStore`；
//! 解码器只通过下标引用编码器，对齐解码器只通过下标引用主解码器。

use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::alignment::WordAlignmentDecoder;
use crate::autograd::{Graph, Var};
use crate::config::ModelConfig;
use crate::dataset::Dataset;
use crate::decoder::{Decoder, DecoderRun};
use crate::encoder::{EncodedVars, Encoder, EncoderOutput};
use crate::error::{config_err, Result};
use crate::loss::sequence_cross_entropy;
use crate::params::ParamStore;
use crate::vocabulary::Vocabulary;

/// 训练目标引用的输出头
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadRef {
    /// 序列解码器（交叉熵）
    Sequence(usize),
    /// 词对齐解码器（分布交叉熵）
    Alignment(usize),
}

/// 序列到序列模型
#[derive(Debug, Clone)]
pub struct Seq2SeqModel {
    pub params: ParamStore,
    encoders: Vec<Encoder>,
    decoders: Vec<Decoder>,
    aligners: Vec<WordAlignmentDecoder>,
}

fn lookup(vocabularies: &BTreeMap<String, Arc<Vocabulary>>, name: &str, user: &str) -> Result<Arc<Vocabulary>> {
    vocabularies
        .get(name)
        .cloned()
        .ok_or_else(|| config_err!("`{}` refers to unknown vocabulary `{}`", user, name))
}

impl Seq2SeqModel {
    /// 按依赖顺序构造：编码器 → 序列解码器 → 对齐解码器
    pub fn new(config: &ModelConfig, vocabularies: &BTreeMap<String, Arc<Vocabulary>>) -> Result<Self> {
        let mut names = HashSet::new();
        let all_names = config
            .encoders
            .iter()
            .map(|e| &e.name)
            .chain(config.decoders.iter().map(|d| &d.name))
            .chain(config.alignment_decoders.iter().map(|a| &a.name));
        for name in all_names {
            if !names.insert(name.as_str()) {
                return Err(config_err!("component name `{}` used twice", name));
            }
        }
        if config.encoders.is_empty() {
            return Err(config_err!("model needs at least one encoder"));
        }

        let mut params = ParamStore::new();
        let mut rng = StdRng::seed_from_u64(config.seed);

        let mut encoders = Vec::with_capacity(config.encoders.len());
        for enc in &config.encoders {
            if enc.rnn_size == 0 || enc.max_input_len == 0 || enc.factors.is_empty() {
                return Err(config_err!("encoder `{}` has a zero size or no factors", enc.name));
            }
            if !(enc.dropout_keep_prob > 0.0 && enc.dropout_keep_prob <= 1.0) {
                return Err(config_err!(
                    "encoder `{}` keep probability {} outside (0, 1]",
                    enc.name,
                    enc.dropout_keep_prob
                ));
            }
            let vocabs = enc
                .factors
                .iter()
                .map(|f| lookup(vocabularies, &f.vocabulary, &enc.name))
                .collect::<Result<Vec<_>>>()?;
            encoders.push(Encoder::new(&mut params, enc.clone(), vocabs, &mut rng)?);
        }

        let mut decoders = Vec::with_capacity(config.decoders.len());
        for dec in &config.decoders {
            let vocab = lookup(vocabularies, &dec.vocabulary, &dec.name)?;
            decoders.push(Decoder::new(&mut params, dec.clone(), vocab, &encoders, &mut rng)?);
        }

        let decoder_refs: Vec<&Decoder> = decoders.iter().collect();
        let aligners = config
            .alignment_decoders
            .iter()
            .map(|a| WordAlignmentDecoder::new(a.clone(), &decoder_refs))
            .collect::<Result<Vec<_>>>()?;

        info!(
            "built model: {} encoder(s), {} decoder(s), {} alignment decoder(s), {} parameters",
            encoders.len(),
            decoders.len(),
            aligners.len(),
            params.param_count()
        );

        Ok(Self {
            params,
            encoders,
            decoders,
            aligners,
        })
    }

    pub fn encoders(&self) -> &[Encoder] {
        &self.encoders
    }

    pub fn decoders(&self) -> &[Decoder] {
        &self.decoders
    }

    pub fn aligners(&self) -> &[WordAlignmentDecoder] {
        &self.aligners
    }

    pub fn decoder(&self, name: &str) -> Option<&Decoder> {
        self.decoders.iter().find(|d| d.name() == name)
    }

    /// 按名字查找输出头
    pub fn head(&self, name: &str) -> Option<HeadRef> {
        self.decoders
            .iter()
            .position(|d| d.name() == name)
            .map(HeadRef::Sequence)
            .or_else(|| {
                self.aligners
                    .iter()
                    .position(|a| a.name() == name)
                    .map(HeadRef::Alignment)
            })
    }

    /// 在计算图上运行所有编码器
    pub fn encode(&self, g: &mut Graph, dataset: &Dataset) -> Result<Vec<EncodedVars>> {
        self.encoders
            .iter()
            .map(|enc| {
                let inputs = enc.feed(dataset)?;
                enc.encode(g, &self.params, &inputs)
            })
            .collect()
    }

    /// 推理用：运行所有编码器并取出数值
    pub fn encode_for_inference(&self, dataset: &Dataset) -> Result<Vec<EncoderOutput>> {
        let mut g = Graph::inference();
        let encoded = self.encode(&mut g, dataset)?;
        Ok(encoded.iter().map(|e| e.to_output(&g)).collect())
    }

    /// 计算若干输出头的损失（每个 `[1, 1]`，顺序与 `heads` 一致）
    ///
    /// 每个需要的序列解码器只展开一次；对齐解码器读取其主解码器的展开结果。
    pub fn losses(&self, g: &mut Graph, dataset: &Dataset, heads: &[HeadRef]) -> Result<Vec<Var>> {
        let encoded = self.encode(g, dataset)?;

        let mut runs: BTreeMap<usize, (DecoderRun, Var)> = BTreeMap::new();
        for head in heads {
            let index = match *head {
                HeadRef::Sequence(i) => i,
                HeadRef::Alignment(i) => self.aligners[i].decoder_index,
            };
            if runs.contains_key(&index) {
                continue;
            }
            let decoder = &self.decoders[index];
            let targets = decoder.feed(dataset)?;
            let run = decoder.run_teacher_forced(g, &self.params, &encoded, &targets)?;
            let xent = sequence_cross_entropy(g, &run.logits, &targets)?;
            runs.insert(index, (run, xent));
        }

        heads
            .iter()
            .map(|head| match *head {
                HeadRef::Sequence(i) => Ok(runs[&i].1),
                HeadRef::Alignment(i) => {
                    let aligner = &self.aligners[i];
                    aligner.loss(g, &runs[&aligner.decoder_index].0, dataset)
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::toy_model_config;
    use crate::dataset::tokenize;

    fn vocabularies() -> BTreeMap<String, Arc<Vocabulary>> {
        let mut vocabs = BTreeMap::new();
        vocabs.insert(
            "source".to_string(),
            Arc::new(Vocabulary::from_tokens(["a", "b", "c"])),
        );
        vocabs.insert(
            "target".to_string(),
            Arc::new(Vocabulary::from_tokens(["x", "y", "z"])),
        );
        vocabs
    }

    fn dataset() -> Dataset {
        Dataset::new("toy")
            .with_series("source", vec![tokenize("a b c"), tokenize("c a")])
            .unwrap()
            .with_series("target", vec![tokenize("x y"), tokenize("z")])
            .unwrap()
            .with_series("alignment", vec![tokenize("0-0 1-1"), tokenize("0-0")])
            .unwrap()
    }

    #[test]
    fn test_build_and_losses() {
        let model = Seq2SeqModel::new(&toy_model_config(), &vocabularies()).unwrap();
        assert_eq!(model.head("decoder"), Some(HeadRef::Sequence(0)));
        assert_eq!(model.head("alignment"), Some(HeadRef::Alignment(0)));
        assert_eq!(model.head("missing"), None);

        let mut g = Graph::training(0);
        let losses = model
            .losses(&mut g, &dataset(), &[HeadRef::Sequence(0), HeadRef::Alignment(0)])
            .unwrap();
        assert_eq!(losses.len(), 2);
        assert!(g.scalar(losses[0]) > 0.0);
        assert!(g.scalar(losses[1]).is_finite());
    }

    #[test]
    fn test_same_seed_same_parameters() {
        let a = Seq2SeqModel::new(&toy_model_config(), &vocabularies()).unwrap();
        let b = Seq2SeqModel::new(&toy_model_config(), &vocabularies()).unwrap();
        for ((_, pa), (_, pb)) in a.params.iter().zip(b.params.iter()) {
            assert_eq!(pa.name, pb.name);
            assert_eq!(pa.value, pb.value);
        }
    }

    #[test]
    fn test_unknown_vocabulary_is_config_error() {
        let mut config = toy_model_config();
        config.decoders[0].vocabulary = "nope".into();
        assert!(Seq2SeqModel::new(&config, &vocabularies()).is_err());
    }

    #[test]
    fn test_duplicate_component_name() {
        let mut config = toy_model_config();
        config.decoders[0].name = "encoder".into();
        config.alignment_decoders.clear();
        assert!(Seq2SeqModel::new(&config, &vocabularies()).is_err());
    }
}
