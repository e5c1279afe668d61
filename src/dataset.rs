//! 数据集和数据处理
//!
//! 数据集由若干命名序列（data series）组成，每个序列是一列分好词的句子，
//! 所有序列长度相同。模型只通过 `data_id → 句子` 的方式访问数据。

use ndarray::Array2;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, Seq2SeqError};
use crate::tensor::padding_mask;
use crate::vocabulary::PAD_ID;

/// 一个分好词的句子
pub type Sentence = Vec<String>;

/// 填充后的 id batch
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceBatch {
    /// `[batch][max_len]`，不足部分为 `<pad>`
    pub ids: Vec<Vec<usize>>,
    /// 每个序列的真实长度
    pub lengths: Vec<usize>,
    /// `[batch, max_len]`，有效位置为 1.0
    pub mask: Array2<f32>,
}

impl SequenceBatch {
    /// 从不等长的 id 序列构造，按最长序列填充
    pub fn from_sequences(sequences: Vec<Vec<usize>>) -> Self {
        let lengths: Vec<usize> = sequences.iter().map(Vec::len).collect();
        let max_len = lengths.iter().copied().max().unwrap_or(0);
        let ids = sequences
            .into_iter()
            .map(|mut seq| {
                seq.resize(max_len, PAD_ID);
                seq
            })
            .collect();
        let mask = padding_mask(&lengths, max_len);
        Self { ids, lengths, mask }
    }

    pub fn batch_size(&self) -> usize {
        self.ids.len()
    }

    pub fn max_len(&self) -> usize {
        self.mask.ncols()
    }

    /// 补齐到至少 `len` 列，新增位置为 `<pad>` 且掩码为 0
    pub fn padded_to(&self, len: usize) -> Self {
        let len = len.max(self.max_len());
        let ids = self
            .ids
            .iter()
            .map(|seq| {
                let mut seq = seq.clone();
                seq.resize(len, PAD_ID);
                seq
            })
            .collect();
        Self {
            ids,
            lengths: self.lengths.clone(),
            mask: padding_mask(&self.lengths, len),
        }
    }

    /// 第 t 个时间步上整个 batch 的 id
    pub fn column(&self, t: usize) -> Vec<usize> {
        self.ids.iter().map(|seq| seq[t]).collect()
    }

    /// 第 t 个时间步的掩码 `[batch, 1]`
    pub fn mask_column(&self, t: usize) -> Array2<f32> {
        self.mask.column(t).to_owned().insert_axis(ndarray::Axis(1))
    }
}

/// 数据集
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub name: String,
    series: BTreeMap<String, Vec<Sentence>>,
    outputs: BTreeMap<String, PathBuf>,
}

impl Dataset {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// 添加一个序列；长度必须与已有序列一致
    pub fn with_series(mut self, data_id: impl Into<String>, sentences: Vec<Sentence>) -> Result<Self> {
        let data_id = data_id.into();
        if let Some(len) = self.len_if_any() {
            if len != sentences.len() {
                return Err(Seq2SeqError::Data(format!(
                    "series `{}` has {} items, dataset `{}` has {}",
                    data_id,
                    sentences.len(),
                    self.name,
                    len
                )));
            }
        }
        self.series.insert(data_id, sentences);
        Ok(self)
    }

    /// 为某个序列登记输出文件
    pub fn with_output(mut self, data_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.outputs.insert(data_id.into(), path.into());
        self
    }

    /// 从每行一句、空格分词的文本文件加载
    pub fn load_plain<P: AsRef<Path>>(name: &str, files: &[(&str, P)]) -> Result<Self> {
        let mut dataset = Self::new(name);
        for (data_id, path) in files {
            let reader = BufReader::new(File::open(path)?);
            let sentences = reader
                .lines()
                .map(|line| -> Result<Sentence> { Ok(tokenize(&line?)) })
                .collect::<Result<Vec<Sentence>>>()?;
            dataset = dataset.with_series(*data_id, sentences)?;
        }
        Ok(dataset)
    }

    fn len_if_any(&self) -> Option<usize> {
        self.series.values().next().map(Vec::len)
    }

    pub fn len(&self) -> usize {
        self.len_if_any().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_series(&self, data_id: &str) -> bool {
        self.series.contains_key(data_id)
    }

    pub fn series_ids(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(String::as_str)
    }

    pub fn series(&self, data_id: &str) -> Result<&[Sentence]> {
        self.series
            .get(data_id)
            .map(Vec::as_slice)
            .ok_or_else(|| Seq2SeqError::Data(format!("dataset `{}` has no series `{}`", self.name, data_id)))
    }

    pub fn output_path(&self, data_id: &str) -> Option<&Path> {
        self.outputs.get(data_id).map(PathBuf::as_path)
    }

    /// 按下标挑选子集（保持顺序）
    pub fn subset(&self, indices: &[usize]) -> Self {
        let series = self
            .series
            .iter()
            .map(|(id, sentences)| {
                let picked = indices.iter().map(|&i| sentences[i].clone()).collect();
                (id.clone(), picked)
            })
            .collect();
        Self {
            name: self.name.clone(),
            series,
            outputs: self.outputs.clone(),
        }
    }

    /// 按顺序切分为 batch，最后一个可能不满
    pub fn batches(&self, batch_size: usize) -> Vec<Dataset> {
        let indices: Vec<usize> = (0..self.len()).collect();
        indices
            .chunks(batch_size.max(1))
            .map(|chunk| self.subset(chunk))
            .collect()
    }

    /// 打乱后切分为 batch
    pub fn shuffled_batches<R: Rng + ?Sized>(&self, batch_size: usize, rng: &mut R) -> Vec<Dataset> {
        let mut indices: Vec<usize> = (0..self.len()).collect();
        indices.shuffle(rng);
        indices
            .chunks(batch_size.max(1))
            .map(|chunk| self.subset(chunk))
            .collect()
    }

    /// 把解码结果写入该序列登记的输出文件；没有登记时返回 `Ok(false)`
    pub fn write_series(&self, data_id: &str, sentences: &[Sentence]) -> Result<bool> {
        let Some(path) = self.output_path(data_id) else {
            return Ok(false);
        };
        let mut writer = BufWriter::new(File::create(path)?);
        for sentence in sentences {
            writeln!(writer, "{}", sentence.join(" "))?;
        }
        writer.flush()?;
        log::info!("wrote {} sentences of `{}` to {}", sentences.len(), data_id, path.display());
        Ok(true)
    }
}

/// 空格分词的便捷函数
pub fn tokenize(line: &str) -> Sentence {
    line.split_whitespace().map(String::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn toy() -> Dataset {
        Dataset::new("toy")
            .with_series("source", vec![tokenize("a b"), tokenize("c"), tokenize("d e f")])
            .unwrap()
            .with_series("target", vec![tokenize("x"), tokenize("y y"), tokenize("z")])
            .unwrap()
    }

    #[test]
    fn test_sequence_batch_padding() {
        let batch = SequenceBatch::from_sequences(vec![vec![5, 6, 7], vec![8]]);
        assert_eq!(batch.max_len(), 3);
        assert_eq!(batch.ids[1], vec![8, PAD_ID, PAD_ID]);
        assert_eq!(batch.column(0), vec![5, 8]);
        assert_eq!(batch.mask_column(1)[[1, 0]], 0.0);
        assert_eq!(batch.mask_column(1)[[0, 0]], 1.0);

        let empty = SequenceBatch::from_sequences(vec![vec![], vec![]]).padded_to(1);
        assert_eq!(empty.ids, vec![vec![PAD_ID], vec![PAD_ID]]);
        assert_eq!(empty.lengths, vec![0, 0]);
        assert!(empty.mask.iter().all(|&m| m == 0.0));
    }

    #[test]
    fn test_series_length_mismatch() {
        let result = Dataset::new("bad")
            .with_series("a", vec![tokenize("x")])
            .unwrap()
            .with_series("b", vec![tokenize("x"), tokenize("y")]);
        assert!(matches!(result, Err(Seq2SeqError::Data(_))));
    }

    #[test]
    fn test_batches_preserve_order() {
        let data = toy();
        let batches = data.batches(2);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].series("source").unwrap()[1], tokenize("c"));
        assert_eq!(batches[1].len(), 1);
        assert!(data.series("missing").is_err());
    }

    #[test]
    fn test_shuffled_batches_cover_everything() {
        let data = toy();
        let mut rng = StdRng::seed_from_u64(0);
        let batches = data.shuffled_batches(2, &mut rng);
        let mut seen: Vec<Sentence> = batches
            .iter()
            .flat_map(|b| b.series("target").unwrap().to_vec())
            .collect();
        seen.sort();
        assert_eq!(seen, vec![tokenize("x"), tokenize("y y"), tokenize("z")]);
    }

    #[test]
    fn test_write_and_load_plain() {
        let path = std::env::temp_dir().join("mini_seq2seq_dataset_test.txt");
        let data = toy().with_output("target", &path);
        assert!(data.write_series("target", &[tokenize("p q"), tokenize("r")]).unwrap());
        assert!(!data.write_series("source", &[]).unwrap());

        let loaded = Dataset::load_plain("reloaded", &[("target", &path)]).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded.series("target").unwrap(), &[tokenize("p q"), tokenize("r")]);
    }
}
