pub mod openai_chat;
pub mod simple_expert;

pub use openai_chat::OpenAIChatProvider;
pub use simple_expert::SimpleExpertProvider;
