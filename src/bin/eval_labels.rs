//! Label accuracy of one or more vision models over a Food-101 style image tree.
//!
//! Usage:
//! ```bash
//! cargo run --bin eval_labels -- --data-dir food-101/images \
//!     --models "qwen3-vl:8b,llava:7b" --num-samples 100
//! ```
//!
//! Class names come from the directory names (`<data-dir>/<class>/*.jpg`).

use anyhow::{Context, Result};
use clap::Parser;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Instant;
use walkdir::WalkDir;

use nutrition_agent::config::AppConfig;
use nutrition_agent::services::{image_prep, VisionDispatcher};

static NON_ALNUM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9 ]+").unwrap());
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "webp"];

#[derive(Parser)]
#[command(
    name = "eval_labels",
    about = "Evaluate VLM food labels against a Food-101 style dataset"
)]
struct EvalArgs {
    /// Comma-separated model names
    #[arg(long)]
    models: String,

    /// Vision backend (ollama or openai)
    #[arg(long, default_value = "ollama")]
    backend: String,

    /// Number of images to evaluate
    #[arg(long, default_value_t = 50)]
    num_samples: usize,

    /// Dataset root containing one directory per class
    #[arg(long, default_value = "food-101/images")]
    data_dir: PathBuf,
}

/// Lowercase, underscores to spaces, punctuation stripped, spaces collapsed.
fn normalize_label(s: &str) -> String {
    let s = s.to_lowercase().replace('_', " ");
    let s = NON_ALNUM.replace_all(&s, " ");
    WHITESPACE.replace_all(&s, " ").trim().to_string()
}

fn labels_match(predicted: &str, truth: &str) -> bool {
    predicted == truth
        || (!predicted.is_empty() && (truth.contains(predicted) || predicted.contains(truth)))
}

struct Sample {
    path: PathBuf,
    class: String,
}

/// First `limit` images, ordered by class then file name.
fn collect_samples(root: &Path, limit: usize) -> Vec<Sample> {
    let mut samples: Vec<Sample> = WalkDir::new(root)
        .min_depth(2)
        .max_depth(2)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|x| x.to_str())
                .is_some_and(|x| IMAGE_EXTENSIONS.contains(&x.to_lowercase().as_str()))
        })
        .filter_map(|e| {
            let class = e.path().parent()?.file_name()?.to_string_lossy().to_string();
            Some(Sample {
                path: e.into_path(),
                class,
            })
        })
        .collect();
    samples.sort_by(|a, b| a.path.cmp(&b.path));
    samples.truncate(limit);
    samples
}

#[derive(Default)]
struct ModelStats {
    total: usize,
    correct: usize,
    latency_sum: f64,
    latency_count: usize,
}

impl ModelStats {
    fn accuracy(&self) -> f64 {
        self.correct as f64 / self.total.max(1) as f64
    }

    fn avg_latency(&self) -> f64 {
        if self.latency_count == 0 {
            f64::NAN
        } else {
            self.latency_sum / self.latency_count as f64
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    dotenv::dotenv().ok();

    let args = EvalArgs::parse();
    let models: Vec<String> = args
        .models
        .split(',')
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
        .collect();
    if models.is_empty() {
        anyhow::bail!("No models provided via --models");
    }

    let config = AppConfig::from_env()?;
    let vision = VisionDispatcher::from_config(&config);

    println!("Using backend={}, models={:?}", args.backend, models);
    let samples = collect_samples(&args.data_dir, args.num_samples);
    if samples.is_empty() {
        anyhow::bail!("No images found under {}", args.data_dir.display());
    }
    println!("Evaluating {} images from {}", samples.len(), args.data_dir.display());

    let mut stats: Vec<ModelStats> = models.iter().map(|_| ModelStats::default()).collect();

    for (idx, sample) in samples.iter().enumerate() {
        let truth = normalize_label(&sample.class);
        println!("\n=== Sample {}/{} | GT: {} ===", idx + 1, samples.len(), sample.class);

        let bytes = std::fs::read(&sample.path)
            .with_context(|| format!("Failed to read {}", sample.path.display()))?;
        let image = match image_prep::decode(&bytes) {
            Ok(image) => image,
            Err(e) => {
                log::warn!("⚠️ Skipping {}: {:#}", sample.path.display(), e);
                continue;
            }
        };

        for (model, stat) in models.iter().zip(stats.iter_mut()) {
            stat.total += 1;
            let t0 = Instant::now();
            match vision.classify(&image, &args.backend, Some(model.as_str())).await {
                Ok(result) => {
                    let dt = t0.elapsed().as_secs_f64();
                    let predicted = normalize_label(&result.label);
                    let correct = labels_match(&predicted, &truth);
                    stat.correct += usize::from(correct);
                    stat.latency_sum += dt;
                    stat.latency_count += 1;
                    println!(
                        "[{}] pred='{}' (norm='{}') | gt='{}' | correct={} | latency={:.3}s",
                        model, result.label, predicted, truth, correct, dt
                    );
                }
                Err(e) => println!("[{}] ERROR: {:#}", model, e),
            }
        }
    }

    println!("\n===== SUMMARY =====");
    println!("{:30} {:>10} {:>16}", "Model", "Accuracy", "Avg Latency (s)");
    println!("{}", "-".repeat(60));
    for (model, stat) in models.iter().zip(&stats) {
        println!("{:30} {:>10.3} {:>16.3}", model, stat.accuracy(), stat.avg_latency());
    }

    Ok(())
}
