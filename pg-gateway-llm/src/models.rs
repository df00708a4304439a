//! Model ID constants for the supported provider.

pub mod openai {
    pub const GPT_4O_ID: &str = "gpt-4o";
    pub const GPT_4O_NAME: &str = "GPT-4o";

    pub const GPT_4O_MINI_ID: &str = "gpt-4o-mini";
    pub const GPT_4O_MINI_NAME: &str = "GPT-4o Mini";

    pub const GPT_4_TURBO_ID: &str = "gpt-4-turbo";
    pub const GPT_4_TURBO_NAME: &str = "GPT-4 Turbo";
}

pub use openai::*;
