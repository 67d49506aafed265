//! Example: generate minimal pairs and patch GPT-2 on the first one
//!
//! Run with: cargo run --example minimal_pairs

use anyhow::Result;
use sva_patch::{
    generate_minimal_pairs, get_critical_heads, rank_heads, run_activation_patching, PatchModel,
    TargetTokens,
};

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let plural = ["keys", "dogs", "authors", "pilots"];
    let singular = ["key", "dog", "author", "pilot"];
    let distractors = ["near the cabinet", "behind the old tree", "of the book"];
    let templates = ["The {subject} {distractor}", "The {subject} that the man saw"];

    let pairs = generate_minimal_pairs(&plural, &singular, &distractors, &templates, 5, 42)?;
    println!("Generated {} pairs:", pairs.len());
    for pair in &pairs {
        println!("  {:?} / {:?}", pair.clean, pair.corrupted);
    }

    let model = PatchModel::from_pretrained("gpt2")?;
    let targets = TargetTokens::resolve(&model, " are", " is")?;

    let result = run_activation_patching(&model, &pairs[0], targets)?;
    println!(
        "\nBaselines: clean {:+.3}, corrupted {:+.3}",
        result.clean_logit_diff, result.corrupted_logit_diff
    );

    println!("Top 5 heads:");
    for head in rank_heads(&result.scores).iter().take(5) {
        println!("  L{:2} H{:2}: {:+.4}", head.layer, head.head, head.score);
    }

    let critical = get_critical_heads(&result.scores, 95.0)?;
    println!("{} heads at or above the 95th percentile", critical.len());

    Ok(())
}
