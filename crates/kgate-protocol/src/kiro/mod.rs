pub mod event_stream;
pub mod events;
pub mod models;
pub mod payload;

pub use event_stream::{EventStreamDecoder, Frame, FrameError, HeaderValue};
pub use events::{KiroEvent, KiroEventDecoder};
pub use models::{ListAvailableModelsResponse, ModelInfo, TokenLimits};
pub use payload::*;
