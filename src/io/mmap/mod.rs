pub mod arena;
pub use arena::Arena;

pub mod buffer;
pub use buffer::Frame;

pub mod stream;
pub use stream::{Poll, State, Stream};
