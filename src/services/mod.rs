pub mod fdc; // USDA FoodData Central client
pub mod food_match;
pub mod guidance; // Retrieval over local guidance docs
pub mod image_prep;
pub mod nutrients;
pub mod tips;
pub mod vision; // Ollama / OpenAI vision backends
pub mod vlm_response;

pub use fdc::FdcClient;
pub use guidance::{Embedder, GuidanceIndex, OllamaEmbedder};
pub use vision::{OllamaVision, OpenAiVision, VisionBackend, VisionDispatcher};
