//! Channel abstraction for message I/O.

pub mod channel;
pub mod markdown;
pub mod media;
pub mod telegram;

pub use channel::{Channel, IncomingMessage, MessageStream, OutgoingResponse};
pub use media::{SpeechSynthesizer, TextExtractor, Transcriber};
pub use telegram::TelegramChannel;
