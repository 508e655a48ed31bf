pub mod gemini;
pub mod media;

pub use gemini::{extract_text_from_image, generate_chat_reply, GeminiError};
pub use media::{download_media, InlineImage};
