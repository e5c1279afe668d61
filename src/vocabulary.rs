//! 词汇表
//!
//! token 与整数 id 的双向映射，保留 4 个特殊符号：
//!
//! | id | token  | 含义     |
//! |----|--------|----------|
//! | 0  | `<pad>`| 填充     |
//! | 1  | `<unk>`| 未登录词 |
//! | 2  | `<s>`  | 解码起始 |
//! | 3  | `</s>` | 句子结束 |

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::dataset::SequenceBatch;
use crate::error::Result;

pub const PAD_TOKEN: &str = "<pad>";
pub const UNK_TOKEN: &str = "<unk>";
pub const START_TOKEN: &str = "<s>";
pub const END_TOKEN: &str = "</s>";

pub const PAD_ID: usize = 0;
pub const UNK_ID: usize = 1;
pub const START_ID: usize = 2;
pub const END_ID: usize = 3;

/// 词汇表
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Vocabulary {
    /// ID 到 token 的映射
    id_to_token: Vec<String>,
    /// token 到 ID 的映射（由 id_to_token 重建）
    #[serde(skip)]
    token_to_id: HashMap<String, usize>,
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self::new()
    }
}

impl Vocabulary {
    /// 只含特殊符号的词汇表
    pub fn new() -> Self {
        Self::from_tokens(Vec::<String>::new())
    }

    /// 特殊符号之后依次加入给定 token（重复的忽略）
    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut vocab = Self {
            id_to_token: Vec::new(),
            token_to_id: HashMap::new(),
        };
        for special in [PAD_TOKEN, UNK_TOKEN, START_TOKEN, END_TOKEN] {
            vocab.add(special);
        }
        for token in tokens {
            vocab.add(token);
        }
        vocab
    }

    /// 从分好词的句子构建词汇表
    ///
    /// 按频率降序，频率相同按首次出现顺序；只保留频率 ≥ `min_freq` 的词，
    /// `max_size` 限制总大小（含特殊符号）。
    pub fn from_sentences(sentences: &[Vec<String>], max_size: Option<usize>, min_freq: usize) -> Self {
        let mut freq: HashMap<&str, (usize, usize)> = HashMap::new();
        for token in sentences.iter().flatten() {
            let order = freq.len();
            freq.entry(token.as_str()).or_insert((0, order)).0 += 1;
        }

        let mut words: Vec<_> = freq
            .into_iter()
            .filter(|(_, (count, _))| *count >= min_freq)
            .collect();
        words.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then(a.1 .1.cmp(&b.1 .1)));

        let mut vocab = Self::new();
        for (word, _) in words {
            if max_size.map_or(false, |max| vocab.len() >= max) {
                break;
            }
            vocab.add(word);
        }
        vocab
    }

    fn add(&mut self, token: impl Into<String>) {
        let token = token.into();
        if !self.token_to_id.contains_key(&token) {
            self.token_to_id.insert(token.clone(), self.id_to_token.len());
            self.id_to_token.push(token);
        }
    }

    pub fn len(&self) -> usize {
        self.id_to_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_token.is_empty()
    }

    pub fn contains(&self, token: &str) -> bool {
        self.token_to_id.contains_key(token)
    }

    pub fn id(&self, token: &str) -> usize {
        self.token_to_id.get(token).copied().unwrap_or(UNK_ID)
    }

    pub fn token(&self, id: usize) -> &str {
        self.id_to_token.get(id).map_or(UNK_TOKEN, String::as_str)
    }

    /// token 序列转 id，未登录词映射为 `<unk>`
    pub fn encode<S: AsRef<str>>(&self, tokens: &[S]) -> Vec<usize> {
        tokens.iter().map(|t| self.id(t.as_ref())).collect()
    }

    /// id 序列转 token：遇到 `</s>` 停止，跳过 `<pad>`
    pub fn decode(&self, ids: &[usize]) -> Vec<String> {
        ids.iter()
            .take_while(|&&id| id != END_ID)
            .filter(|&&id| id != PAD_ID)
            .map(|&id| self.token(id).to_string())
            .collect()
    }

    /// 把一批句子转换成填充后的 batch
    ///
    /// 超出 `max_len` 的部分从句尾截掉；`add_start` / `add_end` 在句首 / 句尾
    /// 加上 `<s>` / `</s>`，两者都计入 `max_len`。
    pub fn sentences_to_batch<S: AsRef<str>>(
        &self,
        sentences: &[Vec<S>],
        max_len: usize,
        add_start: bool,
        add_end: bool,
    ) -> SequenceBatch {
        let body_len = max_len.saturating_sub(usize::from(add_start) + usize::from(add_end));
        let sequences = sentences
            .iter()
            .map(|sentence| {
                let mut ids = Vec::with_capacity(max_len);
                if add_start && ids.len() < max_len {
                    ids.push(START_ID);
                }
                ids.extend(self.encode(&sentence[..sentence.len().min(body_len)]));
                if add_end && ids.len() < max_len {
                    ids.push(END_ID);
                }
                ids
            })
            .collect();
        SequenceBatch::from_sequences(sequences)
    }

    /// 保存为 JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    /// 从 JSON 加载
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let stored: Vocabulary = serde_json::from_reader(reader)?;
        Ok(Self::from_tokens(stored.id_to_token.into_iter().skip(4)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(s: &str) -> Vec<String> {
        s.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn test_special_symbols() {
        let vocab = Vocabulary::new();
        assert_eq!(vocab.len(), 4);
        assert_eq!(vocab.id(PAD_TOKEN), PAD_ID);
        assert_eq!(vocab.id(END_TOKEN), END_ID);
        assert_eq!(vocab.id("missing"), UNK_ID);
    }

    #[test]
    fn test_from_sentences_orders_by_frequency() {
        let vocab = Vocabulary::from_sentences(
            &[words("b a c a"), words("c a d")],
            None,
            2,
        );
        // a:3, b:1, c:2, d:1
        assert_eq!(vocab.len(), 6);
        assert_eq!(vocab.id("a"), 4);
        assert_eq!(vocab.id("c"), 5);
        assert_eq!(vocab.id("b"), UNK_ID);

        let capped = Vocabulary::from_sentences(&[words("b a c a")], Some(5), 1);
        assert_eq!(capped.len(), 5);
        assert_eq!(capped.token(4), "a");
    }

    #[test]
    fn test_encode_decode() {
        let vocab = Vocabulary::from_tokens(["hello", "world"]);
        let ids = vocab.encode(&["hello", "there", "world"]);
        assert_eq!(ids, vec![4, UNK_ID, 5]);

        let decoded = vocab.decode(&[4, PAD_ID, 5, END_ID, 4]);
        assert_eq!(decoded, vec!["hello", "world"]);
    }

    #[test]
    fn test_sentences_to_batch_truncates_from_end() {
        let vocab = Vocabulary::from_tokens(["a", "b", "c"]);
        let batch = vocab.sentences_to_batch(&[words("a b c"), words("c")], 3, false, true);

        assert_eq!(batch.lengths, vec![3, 2]);
        assert_eq!(batch.ids[0], vec![4, 5, END_ID]);
        assert_eq!(batch.ids[1], vec![6, END_ID, PAD_ID]);

        let plain = vocab.sentences_to_batch(&[words("a b c")], 2, false, false);
        assert_eq!(plain.ids[0], vec![4, 5]);
    }

    #[test]
    fn test_sentences_to_batch_start_and_end() {
        let vocab = Vocabulary::from_tokens(["a", "b", "c"]);
        let batch = vocab.sentences_to_batch(&[words("a b c"), words("")], 4, true, true);

        assert_eq!(batch.ids[0], vec![START_ID, 4, 5, END_ID]);
        assert_eq!(batch.ids[1], vec![START_ID, END_ID, PAD_ID, PAD_ID]);
        assert_eq!(batch.lengths, vec![4, 2]);

        let start_only = vocab.sentences_to_batch(&[words("a b c")], 3, true, false);
        assert_eq!(start_only.ids[0], vec![START_ID, 4, 5]);
    }

    #[test]
    fn test_save_and_load() {
        let vocab = Vocabulary::from_tokens(["x", "y"]);
        let path = std::env::temp_dir().join("mini_seq2seq_vocab_test.json");
        vocab.save(&path).unwrap();
        let loaded = Vocabulary::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded, vocab);
        assert_eq!(loaded.id("y"), 5);
    }
}
