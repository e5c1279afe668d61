//! 评估指标
//!
//! 评估器只在打分阶段使用：输入解码得到的句子和参考句子，输出一个标量。

use std::collections::HashMap;

use crate::dataset::Sentence;

/// 评估器接口
pub trait Evaluator {
    /// 指标名称
    fn name(&self) -> &str;

    /// 语料级分数
    fn evaluate(&self, hypotheses: &[Sentence], references: &[Sentence]) -> f32;
}

/// BLEU Score
///
/// 机器翻译和文本生成的评估指标（语料级，单参考）
///
/// # 参考文献
/// Papineni, K., Roukos, S., Ward, T., & Zhu, W. J. (2002).
/// BLEU: a method for automatic evaluation of machine translation.
#[derive(Debug, Clone)]
pub struct Bleu {
    /// n-gram 大小（通常为 4）
    n: usize,
    name: String,
}

impl Bleu {
    pub fn new(n: usize) -> Self {
        Self {
            n: n.max(1),
            name: format!("BLEU-{}", n.max(1)),
        }
    }

    /// 默认 BLEU-4
    pub fn bleu4() -> Self {
        Self::new(4)
    }
}

impl Default for Bleu {
    fn default() -> Self {
        Self::bleu4()
    }
}

impl Evaluator for Bleu {
    fn name(&self) -> &str {
        &self.name
    }

    /// 返回 [0, 1]；长度不一致时只比较公共部分
    fn evaluate(&self, hypotheses: &[Sentence], references: &[Sentence]) -> f32 {
        let mut log_precision_sum = 0.0;

        for n in 1..=self.n {
            let mut correct = 0;
            let mut total = 0;

            for (hyp, reference) in hypotheses.iter().zip(references) {
                let ref_ngrams = count_ngrams(reference, n);
                let hyp_ngrams = count_ngrams(hyp, n);

                for (ngram, &count) in &hyp_ngrams {
                    correct += count.min(ref_ngrams.get(ngram).copied().unwrap_or(0));
                }
                total += hyp_ngrams.values().sum::<usize>();
            }

            if correct == 0 || total == 0 {
                return 0.0;
            }
            log_precision_sum += (correct as f32 / total as f32).ln();
        }

        // 长度惩罚
        let hyp_len: usize = hypotheses.iter().map(Vec::len).sum();
        let ref_len: usize = references.iter().take(hypotheses.len()).map(Vec::len).sum();
        let bp = if hyp_len < ref_len {
            (1.0 - ref_len as f32 / hyp_len as f32).exp()
        } else {
            1.0
        };

        // 几何平均
        bp * (log_precision_sum / self.n as f32).exp()
    }
}

/// 计算 n-gram 计数
fn count_ngrams(tokens: &[String], n: usize) -> HashMap<&[String], usize> {
    let mut ngrams = HashMap::new();
    if tokens.len() < n {
        return ngrams;
    }
    for window in tokens.windows(n) {
        *ngrams.entry(window).or_insert(0) += 1;
    }
    ngrams
}

/// token 级准确率：按位置比较，分母取两者中较长的长度
#[derive(Debug, Clone, Copy, Default)]
pub struct SequenceAccuracy;

impl Evaluator for SequenceAccuracy {
    fn name(&self) -> &str {
        "accuracy"
    }

    fn evaluate(&self, hypotheses: &[Sentence], references: &[Sentence]) -> f32 {
        let mut correct = 0;
        let mut total = 0;
        for (hyp, reference) in hypotheses.iter().zip(references) {
            correct += hyp.iter().zip(reference).filter(|(h, r)| h == r).count();
            total += hyp.len().max(reference.len());
        }
        if total == 0 {
            return 1.0;
        }
        correct as f32 / total as f32
    }
}
