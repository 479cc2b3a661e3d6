//! WebSocket 스트림 클라이언트.

pub mod stream;

pub use stream::BinanceStreamClient;
