pub mod request;
pub mod response;
pub mod stream;
pub mod types;

pub use request::CreateMessageRequestBody;
pub use response::Message;
pub use stream::{StreamContentBlock, StreamContentBlockDelta, StreamEvent, StreamMessage};
pub use types::*;
