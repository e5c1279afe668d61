//! Beam search 解码
//!
//! 每个输入句子单独展开一个 beam。每一步把所有存活假设的所有扩展放进一个新的
//! 候选池，按（归一化后的）分数稳定排序后保留前 `beam_width` 个。候选按
//! “父假设在 beam 中的位置，再按 token id”的顺序创建，所以分数相同时先创建的
//! 候选排在前面。
//!
//! 已结束的假设有两种处理方式：
//! - `Freeze`：留在 beam 中占一个位置，分数不再变化，和新候选一起排序；
//! - `Retire`：移出 beam 放进结果池，不占 beam 的位置，beam 继续保持
//!   `beam_width` 个存活假设；结果池满 `beam_width` 个后停止。最终排序时
//!   已结束的假设排在未结束的之前。

use log::debug;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::dataset::Dataset;
use crate::decoder::DecoderState;
use crate::encoder::EncoderOutput;
use crate::error::{config_err, Result};
use crate::model::Seq2SeqModel;
use crate::runner::{
    ensemble_log_probs, is_emittable, max_output_len, resolve_members, stack_rows, DecodedSentence,
    Hypothesis, Member, Runner, RunnerConfig,
};
use crate::vocabulary::{END_ID, START_ID};

/// 长度归一化
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LengthNormalization {
    /// 直接使用累计对数概率
    #[default]
    None,
    /// 除以生成长度
    Average,
    /// `score / ((5 + len)^α / 6^α)`
    Gnmt { alpha: f32 },
}

impl LengthNormalization {
    /// `len` 为已生成 token 数（含 `</s>`）
    pub fn apply(&self, score: f64, len: usize) -> f64 {
        let len = len.max(1) as f64;
        match *self {
            LengthNormalization::None => score,
            LengthNormalization::Average => score / len,
            LengthNormalization::Gnmt { alpha } => {
                let alpha = f64::from(alpha);
                score / ((5.0 + len).powf(alpha) / 6f64.powf(alpha))
            }
        }
    }
}

/// 已结束假设的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FinishedPolicy {
    #[default]
    Freeze,
    Retire,
}

/// Beam search 配置
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BeamSearchConfig {
    pub beam_width: usize,
    #[serde(default)]
    pub length_normalization: LengthNormalization,
    #[serde(default)]
    pub finished_policy: FinishedPolicy,
    /// n-best 列表长度，默认等于 `beam_width`
    #[serde(default)]
    pub n_best: Option<usize>,
}

impl BeamSearchConfig {
    pub fn new(beam_width: usize) -> Self {
        Self {
            beam_width,
            length_normalization: LengthNormalization::None,
            finished_policy: FinishedPolicy::Freeze,
            n_best: None,
        }
    }
}

/// beam 中的一个假设
#[derive(Debug, Clone)]
struct BeamHypothesis {
    /// 含 `</s>`（如果已结束）
    ids: Vec<usize>,
    log_probs: Vec<f32>,
    attention: Vec<Vec<f32>>,
    /// 累计对数概率
    score: f64,
    finished: bool,
    /// 存活假设在解码器状态中的行号
    state_row: Option<usize>,
}

impl BeamHypothesis {
    fn rank(&self, norm: LengthNormalization) -> f64 {
        norm.apply(self.score, self.ids.len())
    }

    fn last_token(&self) -> usize {
        self.ids.last().copied().unwrap_or(START_ID)
    }
}

/// 候选：父假设加一个 token，或者原样保留的已结束假设
#[derive(Debug, Clone, Copy)]
struct Candidate {
    parent: usize,
    /// 在本步存活假设中的行号；`None` 表示冻结的已结束假设
    live_row: Option<usize>,
    token: usize,
    log_prob: f32,
    score: f64,
    rank: f64,
}

fn by_rank_desc(a: f64, b: f64) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}

/// 从排好序的候选中选出下一步的 beam，同时返回存活假设在本步状态中的行号
///
/// `Retire` 时已结束的候选移入 `retired`，继续往下取，直到有 `width` 个存活
/// 假设或候选用完。
fn select_next(
    beam: &[BeamHypothesis],
    candidates: &[Candidate],
    attention: Option<&Array2<f32>>,
    width: usize,
    policy: FinishedPolicy,
    retired: &mut Vec<BeamHypothesis>,
) -> (Vec<BeamHypothesis>, Vec<usize>) {
    let mut next_beam = Vec::with_capacity(width);
    let mut keep_rows = Vec::with_capacity(width);
    for cand in candidates {
        if next_beam.len() >= width {
            break;
        }
        let parent = &beam[cand.parent];
        let Some(live_row) = cand.live_row else {
            next_beam.push(parent.clone());
            continue;
        };

        let mut hyp = parent.clone();
        hyp.ids.push(cand.token);
        hyp.log_probs.push(cand.log_prob);
        if let Some(weights) = attention {
            hyp.attention.push(weights.row(live_row).to_vec());
        }
        hyp.score = cand.score;
        hyp.finished = cand.token == END_ID;
        if hyp.finished {
            hyp.state_row = None;
            if policy == FinishedPolicy::Retire {
                retired.push(hyp);
                continue;
            }
        } else {
            keep_rows.push(live_row);
            hyp.state_row = Some(keep_rows.len() - 1);
        }
        next_beam.push(hyp);
    }
    (next_beam, keep_rows)
}

/// 结果池排序并截断到 `n`
fn rank_pool(
    mut pool: Vec<BeamHypothesis>,
    norm: LengthNormalization,
    policy: FinishedPolicy,
    n: usize,
) -> Vec<BeamHypothesis> {
    pool.sort_by(|a, b| {
        let finished_first = match policy {
            FinishedPolicy::Retire => b.finished.cmp(&a.finished),
            FinishedPolicy::Freeze => Ordering::Equal,
        };
        finished_first.then_with(|| by_rank_desc(a.rank(norm), b.rank(norm)))
    });
    pool.truncate(n);
    pool
}

/// Beam search runner，支持多个模型集成
#[derive(Debug, Clone)]
pub struct BeamSearchRunner {
    config: RunnerConfig,
    beam: BeamSearchConfig,
}

impl BeamSearchRunner {
    pub fn new(config: RunnerConfig, beam: BeamSearchConfig) -> Result<Self> {
        if beam.beam_width == 0 {
            return Err(config_err!("beam width of `{}` must be positive", config.output_series));
        }
        if beam.n_best == Some(0) {
            return Err(config_err!("n-best size of `{}` must be positive", config.output_series));
        }
        Ok(Self { config, beam })
    }

    pub fn beam_config(&self) -> &BeamSearchConfig {
        &self.beam
    }

    /// 解码一个句子；`encoded[m]` 为第 m 个模型对该句子的编码（batch 为 1）
    fn search(&self, members: &[Member<'_>], encoded: &[Vec<EncoderOutput>]) -> Result<DecodedSentence> {
        let width = self.beam.beam_width;
        let norm = self.beam.length_normalization;
        let primary = members[0].decoder;
        let max_len = max_output_len(&self.config, primary);
        let src_len = primary
            .attention_encoder(0)
            .map_or(0, |e| encoded[0][e].source_len());

        let mut states = members
            .iter()
            .zip(encoded)
            .map(|(m, enc)| m.decoder.infer_initial_state(&m.model.params, enc))
            .collect::<Result<Vec<DecoderState>>>()?;

        let mut beam = vec![BeamHypothesis {
            ids: Vec::new(),
            log_probs: Vec::new(),
            attention: Vec::new(),
            score: 0.0,
            finished: false,
            state_row: Some(0),
        }];
        let mut retired: Vec<BeamHypothesis> = Vec::new();

        for step in 0..max_len {
            let live: Vec<usize> = (0..beam.len()).filter(|&i| !beam[i].finished).collect();
            if live.is_empty() {
                debug!("beam finished after {} steps", step);
                break;
            }
            if self.beam.finished_policy == FinishedPolicy::Retire && retired.len() >= width {
                break;
            }

            let rows: Vec<usize> = live
                .iter()
                .map(|&i| beam[i].state_row.unwrap_or(0))
                .collect();
            let prev: Vec<usize> = live.iter().map(|&i| beam[i].last_token()).collect();
            let expand = vec![0; live.len()];

            let mut logits = Vec::with_capacity(members.len());
            let mut next_states = Vec::with_capacity(members.len());
            let mut attention = None;
            for ((member, enc), state) in members.iter().zip(encoded).zip(&states) {
                let enc: Vec<EncoderOutput> = enc.iter().map(|e| e.select_rows(&expand)).collect();
                let out = member
                    .decoder
                    .infer_step(&member.model.params, &enc, &prev, &state.select_rows(&rows))?;
                logits.push(out.logits);
                next_states.push(out.state);
                if attention.is_none() {
                    attention = Some(out.attention.into_iter().next());
                }
            }
            let attention = attention.flatten();
            let scores = ensemble_log_probs(&logits)?;

            // 新的候选池
            let mut candidates = Vec::new();
            let mut row = 0;
            for (i, hyp) in beam.iter().enumerate() {
                if hyp.finished {
                    candidates.push(Candidate {
                        parent: i,
                        live_row: None,
                        token: END_ID,
                        log_prob: 0.0,
                        score: hyp.score,
                        rank: hyp.rank(norm),
                    });
                    continue;
                }
                for (token, &lp) in scores.row(row).iter().enumerate() {
                    if !is_emittable(token) {
                        continue;
                    }
                    let score = hyp.score + f64::from(lp);
                    candidates.push(Candidate {
                        parent: i,
                        live_row: Some(row),
                        token,
                        log_prob: lp,
                        score,
                        rank: norm.apply(score, hyp.ids.len() + 1),
                    });
                }
                row += 1;
            }
            candidates.sort_by(|a, b| by_rank_desc(a.rank, b.rank));

            let (next_beam, keep_rows) = select_next(
                &beam,
                &candidates,
                attention.as_ref(),
                width,
                self.beam.finished_policy,
                &mut retired,
            );
            debug!(
                "beam step {}: {} live, {} retired",
                step,
                keep_rows.len(),
                retired.len()
            );

            states = next_states.iter().map(|s| s.select_rows(&keep_rows)).collect();
            beam = next_beam;
        }

        let mut pool = retired;
        pool.extend(beam);
        let pool = rank_pool(
            pool,
            norm,
            self.beam.finished_policy,
            self.beam.n_best.unwrap_or(width),
        );

        let n_best = pool
            .iter()
            .map(|h| Hypothesis {
                ids: strip_end(&h.ids, h.finished),
                score: h.rank(norm),
                finished: h.finished,
            })
            .collect();

        let best = pool
            .into_iter()
            .next()
            .ok_or_else(|| config_err!("beam `{}` produced no hypothesis", self.config.output_series))?;
        let ids = strip_end(&best.ids, best.finished);
        Ok(DecodedSentence {
            tokens: primary.vocabulary().decode(&ids),
            ids,
            score: best.rank(norm),
            token_log_probs: best.log_probs,
            attention: stack_rows(&best.attention, src_len),
            unterminated: !best.finished,
            n_best,
        })
    }
}

fn strip_end(ids: &[usize], finished: bool) -> Vec<usize> {
    if finished {
        ids[..ids.len() - 1].to_vec()
    } else {
        ids.to_vec()
    }
}

impl Runner for BeamSearchRunner {
    fn config(&self) -> &RunnerConfig {
        &self.config
    }

    fn run_batch(&self, models: &[&Seq2SeqModel], batch: &Dataset) -> Result<Vec<DecodedSentence>> {
        let members = resolve_members(models, &self.config.decoder)?;
        let encoded = members
            .iter()
            .map(|m| m.model.encode_for_inference(batch))
            .collect::<Result<Vec<_>>>()?;

        (0..batch.len())
            .map(|b| {
                let single: Vec<Vec<EncoderOutput>> = encoded
                    .iter()
                    .map(|enc| enc.iter().map(|e| e.select_rows(&[b])).collect())
                    .collect();
                self.search(&members, &single)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_normalization() {
        assert_eq!(LengthNormalization::None.apply(-4.0, 2), -4.0);
        assert_eq!(LengthNormalization::Average.apply(-4.0, 2), -2.0);
        // len = 1 时 GNMT 惩罚为 1
        let gnmt = LengthNormalization::Gnmt { alpha: 0.6 };
        assert!((gnmt.apply(-3.0, 1) + 3.0).abs() < 1e-12);
        assert!(gnmt.apply(-3.0, 10) > -3.0);
    }

    #[test]
    fn test_rank_sort_is_stable() {
        let mut items = vec![(0, -1.0), (1, -0.5), (2, -1.0), (3, -0.5)];
        items.sort_by(|a, b| by_rank_desc(a.1, b.1));
        let order: Vec<usize> = items.iter().map(|i| i.0).collect();
        assert_eq!(order, vec![1, 3, 0, 2]);
    }

    #[test]
    fn test_strip_end() {
        assert_eq!(strip_end(&[5, 6, END_ID], true), vec![5, 6]);
        assert_eq!(strip_end(&[5, 6], false), vec![5, 6]);
    }

    #[test]
    fn test_zero_width_rejected() {
        let config = RunnerConfig {
            output_series: "out".into(),
            decoder: "decoder".into(),
            kind: Default::default(),
            max_output_len: None,
            batch_size: 4,
        };
        assert!(BeamSearchRunner::new(config.clone(), BeamSearchConfig::new(0)).is_err());
        assert!(BeamSearchRunner::new(config, BeamSearchConfig::new(3)).is_ok());
    }

    #[test]
    fn test_config_from_json() {
        let config: BeamSearchConfig = serde_json::from_str(
            r#"{"beam_width": 4, "length_normalization": {"type": "gnmt", "alpha": 0.6}}"#,
        )
        .unwrap();
        assert_eq!(config.beam_width, 4);
        assert_eq!(config.finished_policy, FinishedPolicy::Freeze);
        assert_eq!(config.length_normalization, LengthNormalization::Gnmt { alpha: 0.6 });
    }

    fn hypothesis(ids: &[usize], score: f64, finished: bool) -> BeamHypothesis {
        BeamHypothesis {
            ids: ids.to_vec(),
            log_probs: vec![0.0; ids.len()],
            attention: Vec::new(),
            score,
            finished,
            state_row: if finished { None } else { Some(0) },
        }
    }

    fn expansions(tokens: &[(usize, f32)]) -> Vec<Candidate> {
        tokens
            .iter()
            .map(|&(token, lp)| Candidate {
                parent: 0,
                live_row: Some(0),
                token,
                log_prob: lp,
                score: f64::from(lp),
                rank: f64::from(lp),
            })
            .collect()
    }

    #[test]
    fn test_retire_keeps_beam_full() {
        let beam = vec![hypothesis(&[], 0.0, false)];
        let candidates = expansions(&[(END_ID, -0.1), (4, -1.0), (5, -1.2), (6, -1.5), (7, -2.0)]);

        let mut retired = Vec::new();
        let (next, rows) = select_next(&beam, &candidates, None, 3, FinishedPolicy::Retire, &mut retired);
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].ids, vec![END_ID]);
        assert_eq!(next.len(), 3);
        assert!(next.iter().all(|h| !h.finished));
        assert_eq!(next.iter().map(|h| h.ids[0]).collect::<Vec<_>>(), vec![4, 5, 6]);
        assert_eq!(rows, vec![0, 0, 0]);
        assert_eq!(next[2].state_row, Some(2));
    }

    #[test]
    fn test_freeze_keeps_finished_in_beam() {
        let beam = vec![hypothesis(&[], 0.0, false)];
        let candidates = expansions(&[(END_ID, -0.1), (4, -1.0), (5, -1.2), (6, -1.5)]);

        let mut retired = Vec::new();
        let (next, rows) = select_next(&beam, &candidates, None, 3, FinishedPolicy::Freeze, &mut retired);
        assert!(retired.is_empty());
        assert_eq!(next.len(), 3);
        assert!(next[0].finished);
        assert_eq!(next[0].state_row, None);
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_length_normalization_changes_winner() {
        let short = hypothesis(&[5, END_ID], -1.0, true);
        let long = hypothesis(&[5, 6, 7, 8, END_ID], -2.0, true);
        let pool = || vec![short.clone(), long.clone()];
        let best = |norm| rank_pool(pool(), norm, FinishedPolicy::Freeze, 2)[0].ids.len();

        assert_eq!(best(LengthNormalization::None), 2);
        assert_eq!(best(LengthNormalization::Average), 5);
        assert_eq!(best(LengthNormalization::Gnmt { alpha: 2.0 }), 5);
        assert_eq!(best(LengthNormalization::Gnmt { alpha: 0.5 }), 2);
    }

    #[test]
    fn test_retired_pool_ranks_finished_first() {
        let pool = vec![
            hypothesis(&[5], -0.1, false),
            hypothesis(&[6, END_ID], -3.0, true),
            hypothesis(&[7, END_ID], -2.0, true),
        ];
        let retire = rank_pool(pool.clone(), LengthNormalization::None, FinishedPolicy::Retire, 2);
        assert!(retire.iter().all(|h| h.finished));
        assert_eq!(retire[0].ids, vec![7, END_ID]);

        let freeze = rank_pool(pool, LengthNormalization::None, FinishedPolicy::Freeze, 2);
        assert!(!freeze[0].finished);
    }
}
