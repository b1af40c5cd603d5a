use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::sampler::Split;

/// Journal file receiving one line per generation pass.
pub const GENERATION_LOG: &str = "generation.jsonl";
/// Journal file receiving one line per training or evaluation step.
pub const RUN_LOG: &str = "run.jsonl";

fn timestamp_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

fn append_json_line<P: AsRef<Path>, T: Serialize>(path: P, value: &T) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    serde_json::to_writer(&mut file, value)
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
    file.write_all(b"\n")
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationLogEntry {
    pub split: Split,
    pub num_meta_batches: usize,
    pub meta_batch_size: usize,
    pub num_classes_per_batch: usize,
    pub batch_size: usize,
    pub num_tasks: usize,
    pub timestamp_ms: u128,
}

impl GenerationLogEntry {
    pub fn new(
        split: Split,
        num_meta_batches: usize,
        config: &crate::config::SamplerConfig,
        num_tasks: usize,
    ) -> Self {
        Self {
            split,
            num_meta_batches,
            meta_batch_size: config.meta_batch_size,
            num_classes_per_batch: config.num_classes_per_batch,
            batch_size: config.batch_size,
            num_tasks,
            timestamp_ms: timestamp_ms(),
        }
    }
}

pub fn log_generation<P: AsRef<Path>>(dir: P, entry: &GenerationLogEntry) -> io::Result<()> {
    fs::create_dir_all(&dir)?;
    append_json_line(dir.as_ref().join(GENERATION_LOG), entry)
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingLogEntry {
    pub step: usize,
    pub split: Split,
    pub loss: f32,
    pub accuracy: Option<f32>,
    pub timestamp_ms: u128,
}

impl TrainingLogEntry {
    pub fn new(step: usize, split: Split, loss: f32, accuracy: Option<f32>) -> Self {
        Self {
            step,
            split,
            loss,
            accuracy,
            timestamp_ms: timestamp_ms(),
        }
    }
}

pub fn log_training_step<P: AsRef<Path>>(dir: P, entry: &TrainingLogEntry) -> io::Result<()> {
    fs::create_dir_all(&dir)?;
    append_json_line(dir.as_ref().join(RUN_LOG), entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_training_log_appends_lines() {
        let mut dir = std::env::temp_dir();
        dir.push(format!("metagrad_logs_{}", uuid::Uuid::new_v4()));

        log_training_step(&dir, &TrainingLogEntry::new(0, Split::Train, 2.3, None)).unwrap();
        log_training_step(&dir, &TrainingLogEntry::new(1, Split::Eval, 1.9, Some(0.5))).unwrap();

        let contents = fs::read_to_string(dir.join(RUN_LOG)).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["step"], 1);
        assert_eq!(second["split"], "eval");
        assert_eq!(second["accuracy"], 0.5);

        fs::remove_dir_all(&dir).ok();
    }
}
