//! Bounded byte buffer with line awareness and watermark callbacks, plus a
//! reactor-driven buffered file-descriptor reader/writer pair. See spec
//! §4.2 and §4.3.

mod buffer;
mod fdio;

pub use buffer::Buffer;
pub use fdio::{BufferedFdReader, BufferedFdWriter};
