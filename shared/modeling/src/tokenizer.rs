use std::path::Path;
use thiserror::Error;
use tokenizers::Tokenizer;

#[derive(Debug, Error)]
pub enum TokenizerError {
    #[error("failed to load tokenizer from {path}: {message}")]
    Load { path: String, message: String },

    #[error("failed to encode text: {0}")]
    Encode(String),

    #[error("failed to decode ids: {0}")]
    Decode(String),

    #[error("token id {id} is outside the vocabulary of size {vocab_size}")]
    InvalidId { id: u32, vocab_size: usize },
}

/// Text <-> token id conversion with a fixed vocabulary.
pub trait TokenCodec: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>, TokenizerError>;
    fn decode(&self, ids: &[u32]) -> Result<String, TokenizerError>;
    fn vocab_size(&self) -> usize;
}

impl TokenCodec for Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>, TokenizerError> {
        let encoding = (**self)
            .encode(text, false)
            .map_err(|err| TokenizerError::Encode(err.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String, TokenizerError> {
        (**self)
            .decode(ids, true)
            .map_err(|err| TokenizerError::Decode(err.to_string()))
    }

    fn vocab_size(&self) -> usize {
        self.get_vocab_size(true)
    }
}

/// One token per byte. Lossy on decode when the ids don't form valid UTF-8.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    pub const VOCAB_SIZE: usize = 256;
}

impl TokenCodec for ByteTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>, TokenizerError> {
        Ok(text.bytes().map(u32::from).collect())
    }

    fn decode(&self, ids: &[u32]) -> Result<String, TokenizerError> {
        let bytes = ids
            .iter()
            .map(|&id| {
                u8::try_from(id).map_err(|_| TokenizerError::InvalidId {
                    id,
                    vocab_size: Self::VOCAB_SIZE,
                })
            })
            .collect::<Result<Vec<u8>, _>>()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn vocab_size(&self) -> usize {
        Self::VOCAB_SIZE
    }
}

/// Loads a `tokenizer.json`, or the one inside `path` if it is a directory.
pub fn auto_tokenizer(path: impl AsRef<Path>) -> Result<Tokenizer, TokenizerError> {
    let path = path.as_ref();
    let file = if path.is_dir() {
        path.join("tokenizer.json")
    } else {
        path.to_path_buf()
    };
    Tokenizer::from_file(&file).map_err(|err| TokenizerError::Load {
        path: file.display().to_string(),
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_tokenizer() {
        let tokenizer = ByteTokenizer;
        let ids = tokenizer.encode("Hi, é").unwrap();
        assert_eq!(ids, vec![72, 105, 44, 32, 195, 169]);
        assert!(ids.iter().all(|&id| (id as usize) < tokenizer.vocab_size()));
        assert_eq!(tokenizer.decode(&ids).unwrap(), "Hi, é");
    }

    #[test]
    fn test_byte_tokenizer_rejects_large_ids() {
        assert!(matches!(
            ByteTokenizer.decode(&[65, 300]),
            Err(TokenizerError::InvalidId { id: 300, .. })
        ));
    }

    #[test]
    fn test_auto_tokenizer_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            auto_tokenizer(dir.path()),
            Err(TokenizerError::Load { .. })
        ));
    }
}
