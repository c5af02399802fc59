pub mod forward;
pub mod framed;

pub use forward::relay;
pub use framed::{split, ConnReader, ConnWriter, FramedReader, FramedWriter, TransportError};
