//! Paired prompt datasets for control vector extraction
//!
//! Every sample draws one pre/post stem pair, one tuple of class
//! continuations and one writing prompt. The baseline class gets the bare
//! stem, each other class gets the stem plus its continuation, and all
//! classes share the same writing prompt so the only difference between
//! paired samples is the class-specific instruction.

use std::path::Path;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Name given to the reference class
pub const BASELINE_CLASS: &str = "baseline";

/// Prompt stems file: `{"pre": [...], "post": [...]}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptStems {
    pub pre: Vec<String>,
    pub post: Vec<String>,
}

/// Continuations file: class names plus one continuation per class per entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Continuations {
    pub classes: Vec<String>,
    pub data: Vec<Vec<String>>,
}

/// One sample of one class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptSample {
    pub system_message: String,
    pub writing_prompt: String,
}

/// How a sample is laid out as a chat conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageLayout {
    /// Single user turn: `"<system message> <writing prompt>"`
    #[default]
    Combined,
    /// System turn followed by a user turn
    SeparateSystem,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

impl PromptSample {
    pub fn conversation(&self, layout: MessageLayout) -> Vec<ChatMessage> {
        match layout {
            MessageLayout::Combined => vec![ChatMessage::new(
                "user",
                format!("{} {}", self.system_message, self.writing_prompt),
            )],
            MessageLayout::SeparateSystem => vec![
                ChatMessage::new("system", self.system_message.clone()),
                ChatMessage::new("user", self.writing_prompt.clone()),
            ],
        }
    }
}

/// Per-class prompt datasets, index 0 being the baseline
#[derive(Debug, Clone)]
pub struct PromptDataset {
    class_names: Vec<String>,
    datasets: Vec<Vec<PromptSample>>,
}

impl PromptDataset {
    /// Load the three input files and sample `num_samples_per_class` prompts
    pub fn load(
        stems_path: &Path,
        continuations_path: &Path,
        writing_prompts_path: &Path,
        num_samples_per_class: usize,
        seed: u64,
    ) -> Result<Self> {
        let stems: PromptStems = read_json(stems_path)?;
        info!(
            "Loaded {} + {} prompt stems from {}",
            stems.pre.len(),
            stems.post.len(),
            stems_path.display()
        );

        let continuations: Continuations = read_json(continuations_path)?;
        info!(
            "Loaded {} classes with {} continuations from {}",
            continuations.classes.len(),
            continuations.data.len(),
            continuations_path.display()
        );

        let content = std::fs::read_to_string(writing_prompts_path)
            .with_context(|| format!("Failed to read {}", writing_prompts_path.display()))?;
        let writing_prompts: Vec<String> = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect();
        info!(
            "Loaded {} writing prompts from {}",
            writing_prompts.len(),
            writing_prompts_path.display()
        );

        Self::generate(
            &stems,
            &continuations,
            &writing_prompts,
            num_samples_per_class,
            seed,
        )
    }

    /// Sample paired prompts for every class
    pub fn generate(
        stems: &PromptStems,
        continuations: &Continuations,
        writing_prompts: &[String],
        num_samples_per_class: usize,
        seed: u64,
    ) -> Result<Self> {
        anyhow::ensure!(
            num_samples_per_class > 0,
            "num_samples_per_class must be greater than 0"
        );
        anyhow::ensure!(
            !stems.pre.is_empty() && !stems.post.is_empty(),
            "Prompt stems need at least one 'pre' and one 'post' entry"
        );
        anyhow::ensure!(!continuations.classes.is_empty(), "No classes declared");
        anyhow::ensure!(!continuations.data.is_empty(), "No continuations loaded");
        anyhow::ensure!(!writing_prompts.is_empty(), "No writing prompts loaded");
        if let Some(bad) = continuations
            .data
            .iter()
            .find(|tuple| tuple.len() != continuations.classes.len())
        {
            anyhow::bail!(
                "Continuation {:?} has {} entries, expected one per class ({})",
                bad,
                bad.len(),
                continuations.classes.len()
            );
        }

        let mut class_names = vec![BASELINE_CLASS.to_string()];
        class_names.extend(continuations.classes.iter().cloned());

        let mut rng = StdRng::seed_from_u64(seed);
        let mut datasets: Vec<Vec<PromptSample>> = (0..class_names.len())
            .map(|_| Vec::with_capacity(num_samples_per_class))
            .collect();

        for _ in 0..num_samples_per_class {
            let messages = system_messages(stems, continuations, &mut rng)?;
            let writing_prompt = writing_prompts
                .choose(&mut rng)
                .ok_or_else(|| anyhow::anyhow!("No writing prompts loaded"))?;
            // Every class shares the same writing prompt for this sample
            for (dataset, system_message) in datasets.iter_mut().zip(messages) {
                dataset.push(PromptSample {
                    system_message,
                    writing_prompt: writing_prompt.clone(),
                });
            }
        }

        let dataset = Self {
            class_names,
            datasets,
        };
        info!(
            "Generated {} classes x {} prompts ({} total)",
            dataset.num_classes(),
            num_samples_per_class,
            dataset.total_samples()
        );
        Ok(dataset)
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// Samples per class (all classes have the same count)
    pub fn samples_per_class(&self) -> usize {
        self.datasets.first().map_or(0, Vec::len)
    }

    pub fn total_samples(&self) -> usize {
        self.datasets.iter().map(Vec::len).sum()
    }

    pub fn samples(&self, class: usize) -> Option<&[PromptSample]> {
        self.datasets.get(class).map(Vec::as_slice)
    }
}

/// Baseline message followed by one message per class
fn system_messages(
    stems: &PromptStems,
    continuations: &Continuations,
    rng: &mut StdRng,
) -> Result<Vec<String>> {
    let pre = stems.pre.choose(rng);
    let post = stems.post.choose(rng);
    let tuple = continuations.data.choose(rng);
    let (Some(pre), Some(post), Some(tuple)) = (pre, post, tuple) else {
        anyhow::bail!("Cannot sample from empty prompt stems or continuations");
    };

    let stem = format!("{pre} {post}");
    let mut messages = Vec::with_capacity(tuple.len() + 1);
    messages.push(format!("{stem}."));
    messages.extend(tuple.iter().map(|cont| format!("{stem} {cont}.")));
    Ok(messages)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stems() -> PromptStems {
        PromptStems {
            pre: vec!["You are".into(), "Act as".into()],
            post: vec!["an author".into()],
        }
    }

    fn continuations() -> Continuations {
        Continuations {
            classes: vec!["honest".into(), "deceptive".into()],
            data: vec![vec!["who never lies".into(), "who always lies".into()]],
        }
    }

    #[test]
    fn test_generate_pairs_classes() {
        let prompts = vec!["Write a story.".to_string(), "Write a poem.".to_string()];
        let dataset = PromptDataset::generate(&stems(), &continuations(), &prompts, 5, 42).unwrap();

        assert_eq!(dataset.class_names(), ["baseline", "honest", "deceptive"]);
        assert_eq!(dataset.samples_per_class(), 5);
        assert_eq!(dataset.total_samples(), 15);

        let baseline = dataset.samples(0).unwrap();
        let honest = dataset.samples(1).unwrap();
        let deceptive = dataset.samples(2).unwrap();
        for i in 0..5 {
            assert_eq!(baseline[i].writing_prompt, honest[i].writing_prompt);
            assert_eq!(baseline[i].writing_prompt, deceptive[i].writing_prompt);

            let stem = baseline[i].system_message.trim_end_matches('.');
            assert_eq!(honest[i].system_message, format!("{stem} who never lies."));
            assert_eq!(deceptive[i].system_message, format!("{stem} who always lies."));
        }
    }

    #[test]
    fn test_generate_deterministic() {
        let prompts = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let first = PromptDataset::generate(&stems(), &continuations(), &prompts, 8, 7).unwrap();
        let second = PromptDataset::generate(&stems(), &continuations(), &prompts, 8, 7).unwrap();

        assert_eq!(first.samples(1), second.samples(1));
    }

    #[test]
    fn test_generate_rejects_bad_input() {
        let prompts = vec!["a".to_string()];
        assert!(PromptDataset::generate(&stems(), &continuations(), &prompts, 0, 1).is_err());
        assert!(PromptDataset::generate(&stems(), &continuations(), &[], 3, 1).is_err());

        let mut ragged = continuations();
        ragged.data.push(vec!["only one".into()]);
        assert!(PromptDataset::generate(&stems(), &ragged, &prompts, 3, 1).is_err());
    }

    #[test]
    fn test_conversation_layouts() {
        let sample = PromptSample {
            system_message: "You are terse.".into(),
            writing_prompt: "Describe the sea.".into(),
        };

        let combined = sample.conversation(MessageLayout::Combined);
        assert_eq!(combined.len(), 1);
        assert_eq!(combined[0].role, "user");
        assert_eq!(combined[0].content, "You are terse. Describe the sea.");

        let separate = sample.conversation(MessageLayout::SeparateSystem);
        assert_eq!(separate.len(), 2);
        assert_eq!(separate[0].role, "system");
        assert_eq!(separate[1].content, "Describe the sea.");
    }
}
