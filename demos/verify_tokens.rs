//! Token Verification
//! Prints GPT-2 tokenization of a minimal pair and the target verb IDs, to
//! check that both sentences have the same length and each target is one token
//!
//! Run with: cargo run --example verify_tokens

use anyhow::Result;
use sva_patch::{PatchModel, PatchingConfig, TargetTokens};

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    println!("Loading GPT-2...\n");
    let model = PatchModel::from_pretrained_with_device("gpt2", Some(true))?;
    let config = PatchingConfig::default();

    let pairs = [
        ("The keys to the cabinet", "The key to the cabinet"),
        ("The dogs near the tree", "The dog near the tree"),
        ("The authors of the book", "The author of the book"),
    ];

    for (clean, corrupted) in pairs {
        println!("═══════════════════════════════════════════════════════════════════");
        for sentence in [clean, corrupted] {
            let tokens = model.tokenize(sentence)?;
            println!("{sentence:?} -> {} tokens", tokens.len());
            for (i, &id) in tokens.ids().iter().enumerate() {
                println!("{:3}: {:6} {:?}", i, id, model.decode_token(id));
            }
        }
        let same = model.tokenize(clean)?.len() == model.tokenize(corrupted)?.len();
        println!("Same length: {}", if same { "yes" } else { "NO - cannot patch" });
    }

    println!("\n═══════════════════════════════════════════════════════════════════");
    let targets = TargetTokens::resolve(&model, &config.target_correct, &config.target_incorrect)?;
    println!(
        "Targets: {:?} -> {}, {:?} -> {}",
        config.target_correct, targets.correct, config.target_incorrect, targets.incorrect
    );

    Ok(())
}
