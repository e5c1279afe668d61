//! 词对齐监督
//!
//! 辅助“解码器”：读取 Pharaoh 格式的对齐序列（`i-j`，i 为源位置、j 为目标位置），
//! 把主解码器某个注意力的权重历史和对齐分布做交叉熵。
//! 它没有自己的参数，也不修改主解码器的状态，只在损失汇总时与主解码器组合。

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::autograd::{Graph, Var};
use crate::dataset::{Dataset, Sentence};
use crate::decoder::{Decoder, DecoderRun};
use crate::error::{config_err, Result, Seq2SeqError};
use crate::loss::distribution_cross_entropy;

/// 对齐解码器配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlignmentDecoderConfig {
    pub name: String,
    /// 对齐序列的 data id
    pub data_id: String,
    /// 被监督的主解码器
    pub decoder: String,
    /// 主解码器中第几个注意力
    #[serde(default)]
    pub attention: usize,
}

/// 词对齐解码器
#[derive(Debug, Clone)]
pub struct WordAlignmentDecoder {
    pub config: AlignmentDecoderConfig,
    /// 主解码器在模型中的下标
    pub decoder_index: usize,
}

impl WordAlignmentDecoder {
    /// `decoders` 是模型中已构造的序列解码器
    pub fn new(config: AlignmentDecoderConfig, decoders: &[&Decoder]) -> Result<Self> {
        let decoder_index = decoders
            .iter()
            .position(|d| d.name() == config.decoder)
            .ok_or_else(|| {
                config_err!(
                    "alignment decoder `{}` refers to unknown decoder `{}`",
                    config.name,
                    config.decoder
                )
            })?;
        if config.attention >= decoders[decoder_index].attention_count() {
            return Err(config_err!(
                "decoder `{}` has no attention #{}",
                config.decoder,
                config.attention
            ));
        }
        Ok(Self {
            config,
            decoder_index,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// 对齐损失
    ///
    /// 第 j 个目标位置的目标分布是所有 `i-j` 链接的均匀分布；没有链接或被截断的
    /// 位置不参与，损失在有链接的 (句子, 位置) 上取平均。
    pub fn loss(&self, g: &mut Graph, run: &DecoderRun, dataset: &Dataset) -> Result<Var> {
        let history = run.attention.get(self.config.attention).ok_or_else(|| {
            Seq2SeqError::ShapeMismatch(format!("run has no attention #{}", self.config.attention))
        })?;
        let Some(&first) = history.first() else {
            return Ok(g.zeros((1, 1)));
        };
        let (batch, src_len) = g.dim(first);

        let alignments = dataset.series(&self.config.data_id)?;
        if alignments.len() != batch {
            return Err(Seq2SeqError::ShapeMismatch(format!(
                "{} alignments for a batch of {}",
                alignments.len(),
                batch
            )));
        }

        let (targets, mut weights) = alignment_targets(alignments, history.len(), src_len)?;
        let rows: f32 = weights.iter().flatten().sum();
        if rows == 0.0 {
            return Ok(g.zeros((1, 1)));
        }
        for w in weights.iter_mut().flatten() {
            *w /= rows;
        }

        distribution_cross_entropy(g, history, &targets, &weights)
    }
}

/// 解析一句的 Pharaoh 对齐，例如 `0-0 1-2 2-1`
pub fn parse_alignment(tokens: &[String]) -> Result<Vec<(usize, usize)>> {
    tokens
        .iter()
        .map(|token| {
            let parsed = token
                .split_once('-')
                .and_then(|(i, j)| Some((i.parse::<usize>().ok()?, j.parse::<usize>().ok()?)));
            parsed.ok_or_else(|| Seq2SeqError::Data(format!("malformed alignment link `{}`", token)))
        })
        .collect()
}

/// 每个目标步一个 `[batch, src_len]` 目标分布，以及每行是否有链接（1.0 / 0.0）
fn alignment_targets(
    alignments: &[Sentence],
    steps: usize,
    src_len: usize,
) -> Result<(Vec<Array2<f32>>, Vec<Vec<f32>>)> {
    let batch = alignments.len();
    let mut targets = vec![Array2::<f32>::zeros((batch, src_len)); steps];
    let mut weights = vec![vec![0.0; batch]; steps];

    for (b, sentence) in alignments.iter().enumerate() {
        for (i, j) in parse_alignment(sentence)? {
            if i < src_len && j < steps {
                targets[j][[b, i]] += 1.0;
                weights[j][b] = 1.0;
            }
        }
    }

    for target in &mut targets {
        for mut row in target.rows_mut() {
            let sum = row.sum();
            if sum > 0.0 {
                row /= sum;
            }
        }
    }
    Ok((targets, weights))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::tokenize;
    use ndarray::arr2;

    #[test]
    fn test_parse_alignment() {
        assert_eq!(
            parse_alignment(&tokenize("0-0 2-1 1-1")).unwrap(),
            vec![(0, 0), (2, 1), (1, 1)]
        );
        assert!(parse_alignment(&tokenize("0:1")).is_err());
        assert!(parse_alignment(&tokenize("a-1")).is_err());
    }

    #[test]
    fn test_alignment_targets_normalised() {
        let (targets, weights) =
            alignment_targets(&[tokenize("0-0 2-1 1-1 7-0"), tokenize("")], 3, 3).unwrap();
        assert_eq!(targets[0], arr2(&[[1.0, 0.0, 0.0], [0.0, 0.0, 0.0]]));
        assert_eq!(targets[1], arr2(&[[0.0, 0.5, 0.5], [0.0, 0.0, 0.0]]));
        assert_eq!(weights[0], vec![1.0, 0.0]);
        assert_eq!(weights[2], vec![0.0, 0.0]);
    }

    #[test]
    fn test_loss_on_attention_history() {
        let mut g = Graph::inference();
        let step0 = g.constant(arr2(&[[0.5, 0.5]]));
        let step1 = g.constant(arr2(&[[0.25, 0.75]]));
        let run = DecoderRun {
            logits: vec![],
            attention: vec![vec![step0, step1]],
            mask: Array2::ones((1, 2)),
        };
        let dataset = Dataset::new("d")
            .with_series("ali", vec![tokenize("0-0 1-1")])
            .unwrap();
        let aligner = WordAlignmentDecoder {
            config: AlignmentDecoderConfig {
                name: "ali".into(),
                data_id: "ali".into(),
                decoder: "dec".into(),
                attention: 0,
            },
            decoder_index: 0,
        };

        let loss = aligner.loss(&mut g, &run, &dataset).unwrap();
        let expected = -(0.5f32.ln() + 0.75f32.ln()) / 2.0;
        assert!((g.scalar(loss) - expected).abs() < 1e-5);
    }
}
