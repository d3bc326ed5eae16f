pub mod auth;
pub mod intent;
pub mod llm;
pub mod memory;
pub mod tts;

pub use auth::StaticTokenValidator;
pub use intent::KeywordIntentClassifier;
pub use llm::OpenAiChatAdapter;
pub use memory::MemoryStore;
pub use tts::OpenAiTtsAdapter;
