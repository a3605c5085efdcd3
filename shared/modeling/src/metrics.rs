//! Per-step training metrics, written as one JSON object per line.

use serde::{Deserialize, Serialize};
use std::{
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    pub step: u32,
    pub loss: f64,
    pub lr: f64,
    /// Pre-clip global gradient norm, when clipping is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grad_norm: Option<f64>,
    pub duration_secs: f64,
    pub tokens_per_sec: f64,
    /// Milliseconds since UNIX epoch
    pub timestamp_ms: u64,
}

impl StepMetrics {
    pub fn new(step: u32, loss: f64, lr: f64, duration: Duration, tokens: i64) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let duration_secs = duration.as_secs_f64();
        let tokens_per_sec = if duration_secs > 0.0 {
            tokens as f64 / duration_secs
        } else {
            0.0
        };

        Self {
            step,
            loss,
            lr,
            grad_norm: None,
            duration_secs,
            tokens_per_sec,
            timestamp_ms,
        }
    }

    pub fn with_grad_norm(mut self, grad_norm: Option<f64>) -> Self {
        self.grad_norm = grad_norm;
        self
    }
}

/// Appends [`StepMetrics`] to a JSONL file. A disabled recorder drops everything.
#[derive(Debug)]
pub struct MetricsRecorder {
    output_path: Option<PathBuf>,
    writer: Option<BufWriter<File>>,
    steps_recorded: u32,
}

impl MetricsRecorder {
    pub fn new(output_path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let output_path = output_path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&output_path)?;

        Ok(Self {
            output_path: Some(output_path),
            writer: Some(BufWriter::new(file)),
            steps_recorded: 0,
        })
    }

    pub fn disabled() -> Self {
        Self {
            output_path: None,
            writer: None,
            steps_recorded: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.writer.is_some()
    }

    pub fn record(&mut self, metrics: &StepMetrics) -> std::io::Result<()> {
        if let Some(writer) = &mut self.writer {
            let json = serde_json::to_string(metrics)?;
            writeln!(writer, "{json}")?;
            writer.flush()?;
            self.steps_recorded += 1;
        }
        Ok(())
    }

    pub fn steps_recorded(&self) -> u32 {
        self.steps_recorded
    }

    pub fn output_path(&self) -> Option<&Path> {
        self.output_path.as_deref()
    }
}

impl Drop for MetricsRecorder {
    fn drop(&mut self) {
        if let Some(writer) = &mut self.writer {
            let _ = writer.flush();
        }
    }
}

pub fn load_metrics(path: impl AsRef<Path>) -> std::io::Result<Vec<StepMetrics>> {
    let reader = BufReader::new(File::open(path)?);
    let mut metrics = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if !line.trim().is_empty() {
            metrics.push(serde_json::from_str(&line)?);
        }
    }
    Ok(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_per_sec() {
        let metrics = StepMetrics::new(3, 2.5, 3e-4, Duration::from_millis(500), 1024);
        assert!((metrics.tokens_per_sec - 2048.0).abs() < 1e-9);
        assert!(metrics.grad_norm.is_none());

        let instant = StepMetrics::new(0, 1.0, 3e-4, Duration::ZERO, 1024);
        assert_eq!(instant.tokens_per_sec, 0.0);
    }

    #[test]
    fn test_recorder_writes_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.jsonl");

        let written = vec![
            StepMetrics::new(0, 5.5, 3e-4, Duration::from_millis(20), 64),
            StepMetrics::new(1, 5.1, 3e-4, Duration::from_millis(18), 64).with_grad_norm(Some(0.7)),
        ];
        {
            let mut recorder = MetricsRecorder::new(&path).unwrap();
            for metrics in &written {
                recorder.record(metrics).unwrap();
            }
            assert_eq!(recorder.steps_recorded(), 2);
            assert_eq!(recorder.output_path(), Some(path.as_path()));
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(!contents.lines().next().unwrap().contains("grad_norm"));
        assert_eq!(load_metrics(&path).unwrap(), written);
    }

    #[test]
    fn test_disabled_recorder() {
        let mut recorder = MetricsRecorder::disabled();
        assert!(!recorder.is_enabled());
        recorder
            .record(&StepMetrics::new(0, 1.0, 1e-3, Duration::ZERO, 1))
            .unwrap();
        assert_eq!(recorder.steps_recorded(), 0);
    }
}
