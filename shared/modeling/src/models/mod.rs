mod gpt;

pub use gpt::{GptForCausalLM, LM_HEAD_WEIGHT, TOKEN_EMBEDDING_WEIGHT};
