//! Minimal pairs: loading and seeded generation

use std::path::Path;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{PatchError, Result};

/// Two sentences differing only in the grammatical number of the subject
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinimalPair {
    /// Plural subject
    pub clean: String,
    /// Singular subject
    pub corrupted: String,
}

impl MinimalPair {
    pub fn new(clean: impl Into<String>, corrupted: impl Into<String>) -> Self {
        Self {
            clean: clean.into(),
            corrupted: corrupted.into(),
        }
    }
}

/// Inputs for [`generate_minimal_pairs`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairGenerator {
    pub plural_subjects: Vec<String>,
    pub singular_subjects: Vec<String>,
    pub distractors: Vec<String>,
    /// Sentences with `{subject}` and `{distractor}` placeholders
    pub templates: Vec<String>,
    #[serde(default = "default_num_examples")]
    pub num_examples: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_num_examples() -> usize {
    5
}

fn default_seed() -> u64 {
    42
}

impl PairGenerator {
    pub fn generate(&self) -> Result<Vec<MinimalPair>> {
        generate_minimal_pairs(
            &self.plural_subjects,
            &self.singular_subjects,
            &self.distractors,
            &self.templates,
            self.num_examples,
            self.seed,
        )
    }
}

fn fill(template: &str, subject: &str, distractor: &str) -> String {
    template
        .replace("{subject}", subject)
        .replace("{distractor}", distractor)
}

fn pick<'a, R: rand::Rng>(items: &'a [String], rng: &mut R, what: &str) -> Result<&'a String> {
    items
        .choose(rng)
        .ok_or_else(|| PatchError::Config(format!("no {what} to choose from")))
}

/// Generate `num_examples` pairs by filling random templates.
///
/// Each pair uses one template, one plural subject (clean), one singular
/// subject (corrupted) and one distractor. The same inputs and seed always
/// give the same pairs.
pub fn generate_minimal_pairs<S: AsRef<str>>(
    plural_subjects: &[S],
    singular_subjects: &[S],
    distractors: &[S],
    templates: &[S],
    num_examples: usize,
    seed: u64,
) -> Result<Vec<MinimalPair>> {
    let owned = |items: &[S]| -> Vec<String> { items.iter().map(|s| s.as_ref().to_string()).collect() };
    let plural = owned(plural_subjects);
    let singular = owned(singular_subjects);
    let distractors = owned(distractors);
    let templates = owned(templates);

    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut pairs = Vec::with_capacity(num_examples);

    for _ in 0..num_examples {
        let template = pick(&templates, &mut rng, "templates")?;
        let plural_subject = pick(&plural, &mut rng, "plural subjects")?;
        let singular_subject = pick(&singular, &mut rng, "singular subjects")?;
        let distractor = pick(&distractors, &mut rng, "distractors")?;

        let pair = MinimalPair::new(
            fill(template, plural_subject, distractor),
            fill(template, singular_subject, distractor),
        );
        if pair.clean == pair.corrupted {
            return Err(PatchError::Config(format!(
                "template {template:?} with subjects {plural_subject:?}/{singular_subject:?} gives identical sentences"
            )));
        }
        pairs.push(pair);
    }

    Ok(pairs)
}

/// Pair file contents: explicit pairs or a generator spec
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PairFile {
    Pairs { pairs: Vec<MinimalPair> },
    Generator { generator: PairGenerator },
}

/// Collection of minimal pairs for an experiment
#[derive(Debug, Clone, Default)]
pub struct PairSet {
    pairs: Vec<MinimalPair>,
}

impl PairSet {
    pub fn new(pairs: Vec<MinimalPair>) -> Self {
        Self { pairs }
    }

    /// Load from JSON: `{"pairs": [{"clean": .., "corrupted": ..}]}` or
    /// `{"generator": {...}}`
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let file: PairFile = serde_json::from_str(&content)?;
        let pairs = match file {
            PairFile::Pairs { pairs } => pairs,
            PairFile::Generator { generator } => generator.generate()?,
        };
        if pairs.is_empty() {
            return Err(PatchError::Config("pair file contains no pairs".into()));
        }
        Ok(Self { pairs })
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn pairs(&self) -> &[MinimalPair] {
        &self.pairs
    }
}
