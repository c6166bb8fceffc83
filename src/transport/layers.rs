//! Tower layers for the outbound transport stack.

mod serialize;

pub use serialize::{SerializeLayer, SerializeService};
