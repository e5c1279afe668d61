//! 玩具翻译示例
//!
//! 学习一个“逐词替换并反转语序”的小语言：训练、验证（BLEU + 早停），
//! 然后分别用贪心解码和 beam search 翻译测试句子。
//!
//! 运行：`RUST_LOG=info cargo run --example toy_translation`

use mini_seq2seq::{
    Bleu, CancellationToken, Evaluator, ExperimentConfig, Result, Runner, TrainingHistory,
};

const SOURCE: [&str; 8] = [
    "a b c", "b c d", "c d e", "d e a", "a c e", "b d", "e a", "c a b d",
];

fn translate_word(w: &str) -> &'static str {
    match w {
        "a" => "un",
        "b" => "deux",
        "c" => "trois",
        "d" => "quatre",
        _ => "cinq",
    }
}

/// 目标语言：逐词翻译后反转
fn reference(sentence: &str) -> String {
    let mut words: Vec<&str> = sentence.split_whitespace().map(translate_word).collect();
    words.reverse();
    words.join(" ")
}

fn config_json() -> String {
    let targets: Vec<String> = SOURCE.iter().map(|s| reference(s)).collect();
    format!(
        r#"{{
        "train": {{
            "name": "train",
            "inline": {{ "source": {src}, "target": {tgt} }}
        }},
        "validation_data": {{
            "name": "dev",
            "inline": {{ "source": ["a b", "d c"], "target": ["{dev0}", "{dev1}"] }}
        }},
        "test_data": {{
            "name": "test",
            "inline": {{ "source": ["a b c", "e d", "b a c e"] }}
        }},
        "vocabularies": [
            {{ "name": "source", "build_from": "source" }},
            {{ "name": "target", "build_from": "target" }}
        ],
        "model": {{
            "encoders": [{{
                "name": "encoder",
                "factors": [{{ "data_id": "source", "vocabulary": "source", "embedding_size": 16 }}],
                "rnn_size": 24,
                "max_input_len": 8
            }}],
            "decoders": [{{
                "name": "decoder",
                "data_id": "target",
                "vocabulary": "target",
                "encoders": ["encoder"],
                "attentions": [{{ "encoder": "encoder", "kind": "bahdanau" }}],
                "embedding_size": 16,
                "rnn_size": 24,
                "max_output_len": 8,
                "output_projection": {{ "type": "maxout", "size": 16 }}
            }}],
            "seed": 42
        }},
        "trainer": {{
            "decoders": ["decoder"],
            "l2_weight": 1e-5,
            "clip_norm": 5.0,
            "optimizer": {{ "type": "adam", "learning_rate": 0.01 }}
        }},
        "training": {{ "epochs": 60, "batch_size": 4 }},
        "runners": [
            {{ "output_series": "greedy", "decoder": "decoder" }},
            {{
                "output_series": "beam",
                "decoder": "decoder",
                "kind": {{
                    "type": "beam_search",
                    "beam_width": 4,
                    "length_normalization": {{ "type": "gnmt", "alpha": 0.6 }}
                }}
            }}
        ],
        "validation": {{
            "runner": "greedy",
            "reference_series": "target",
            "evaluators": [{{ "type": "bleu", "n": 2 }}, {{ "type": "accuracy" }}],
            "early_stopping": {{ "patience": 15, "mode": "max" }}
        }}
    }}"#,
        src = serde_json::to_string(&SOURCE).unwrap_or_default(),
        tgt = serde_json::to_string(&targets).unwrap_or_default(),
        dev0 = reference("a b"),
        dev1 = reference("d c"),
    )
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    println!("╔════════════════════════════════════════════════╗");
    println!("║        玩具翻译：带注意力的 seq2seq           ║");
    println!("╚════════════════════════════════════════════════╝\n");

    let mut experiment = ExperimentConfig::from_json_str(&config_json())?.build()?;
    println!("📊 参数数量: {}", experiment.model.params.param_count());
    for (name, vocab) in &experiment.vocabularies {
        println!("  词汇表 `{}`: {} tokens", name, vocab.len());
    }

    println!("\n🚀 开始训练...");
    let report = experiment.train()?;
    let mut history = TrainingHistory::new();
    for epoch in &report.epochs {
        history.push(epoch);
    }
    println!("\n{}", history.summary());
    if let Some(epoch) = report.restored_epoch {
        println!("  已恢复第 {} 个 epoch 的参数", epoch);
    }

    println!("\n🔎 翻译测试句子");
    let test = match &experiment.test_data {
        Some(test) => test,
        None => return Ok(()),
    };
    let sources = test.series("source")?;
    let references: Vec<Vec<String>> = sources
        .iter()
        .map(|s| reference(&s.join(" ")).split(' ').map(String::from).collect())
        .collect();

    let cancel = CancellationToken::new();
    for runner in &experiment.runners {
        let output = runner.run_dataset(&[&experiment.model], test, &cancel)?;
        println!("\n━━ {} ━━", output.output_series);
        for (source, sentence) in sources.iter().zip(&output.sentences) {
            println!(
                "  {:<10} → {:<28} score {:>8.4}{}",
                source.join(" "),
                sentence.tokens.join(" "),
                sentence.score,
                if sentence.unterminated { "  (unterminated)" } else { "" }
            );
        }
        let bleu = Bleu::new(2);
        println!("  {}: {:.4}", bleu.name(), bleu.evaluate(&output.decoded(), &references));
    }

    Ok(())
}
