// Live quote stream
pub mod messages;
pub mod stream;

pub use messages::{decode_ticks, MessageType, SubscriptionRequest};
pub use stream::QuoteStreamClient;
