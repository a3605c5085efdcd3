use crate::{TokenCodec, TokenizerError};
use std::path::{Path, PathBuf};
use tch::{Device, Kind, Tensor};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum BatchSourceError {
    #[error("failed to read corpus {path}: {source}")]
    ResourceNotFound {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to tokenize corpus: {0}")]
    Tokenize(#[from] TokenizerError),

    #[error("corpus has {tokens} tokens, but one batch needs {required}")]
    CorpusTooShort { tokens: usize, required: usize },

    #[error("batch size and sequence length must be non-zero")]
    EmptyBatch,
}

/// Next-token training pair; `target[i][t] == input[i][t + 1]` in the corpus.
#[derive(Debug)]
pub struct Batch {
    pub input: Tensor,
    pub target: Tensor,
}

impl Batch {
    pub fn to(&self, device: Device) -> Self {
        Self {
            input: self.input.to(device),
            target: self.target.to(device),
        }
    }

    pub fn num_tokens(&self) -> i64 {
        self.input.numel() as i64
    }
}

/// Cycles sequentially through a tokenized corpus in `(batch_size, sequence_length)` windows.
///
/// Each batch consumes `batch_size * sequence_length + 1` ids. When the next window
/// would run past the end, the cursor goes back to 0; the tail is never served.
#[derive(Debug)]
pub struct BatchSource {
    tokens: Tensor,
    len: usize,
    batch_size: usize,
    sequence_length: usize,
    cursor: usize,
}

impl BatchSource {
    pub fn new(
        tokens: Vec<i64>,
        batch_size: usize,
        sequence_length: usize,
    ) -> Result<Self, BatchSourceError> {
        if batch_size == 0 || sequence_length == 0 {
            return Err(BatchSourceError::EmptyBatch);
        }
        let required = batch_size * sequence_length + 1;
        if tokens.len() < required {
            return Err(BatchSourceError::CorpusTooShort {
                tokens: tokens.len(),
                required,
            });
        }
        let len = tokens.len();
        Ok(Self {
            tokens: Tensor::from_slice(&tokens),
            len,
            batch_size,
            sequence_length,
            cursor: 0,
        })
    }

    /// Reads the whole text file at `path` and tokenizes it with `codec`.
    pub fn from_corpus(
        path: impl AsRef<Path>,
        codec: &dyn TokenCodec,
        batch_size: usize,
        sequence_length: usize,
    ) -> Result<Self, BatchSourceError> {
        let path = path.as_ref();
        let text =
            std::fs::read_to_string(path).map_err(|source| BatchSourceError::ResourceNotFound {
                path: path.to_path_buf(),
                source,
            })?;
        let tokens: Vec<i64> = codec.encode(&text)?.into_iter().map(i64::from).collect();

        info!(
            path = %path.display(),
            tokens = tokens.len(),
            batches_per_epoch = tokens.len() / (batch_size * sequence_length).max(1),
            "loaded corpus"
        );
        Self::new(tokens, batch_size, sequence_length)
    }

    fn window(&self) -> usize {
        self.batch_size * self.sequence_length + 1
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn num_tokens(&self) -> usize {
        self.len
    }

    pub fn next_batch(&mut self) -> Batch {
        let window = self.window();
        let (b, t) = (self.batch_size as i64, self.sequence_length as i64);
        let buf = self.tokens.narrow(0, self.cursor as i64, window as i64);

        let input = buf.narrow(0, 0, b * t).view([b, t]).to_kind(Kind::Int64);
        let target = buf.narrow(0, 1, b * t).view([b, t]).to_kind(Kind::Int64);

        self.cursor += window;
        if self.cursor + window > self.len {
            debug!(cursor = self.cursor, len = self.len, "batch source wrapped around");
            self.cursor = 0;
        }
        Batch { input, target }
    }
}

impl Iterator for BatchSource {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        Some(self.next_batch())
    }
}
