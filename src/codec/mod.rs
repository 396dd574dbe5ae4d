pub mod binary;
pub mod buffer;
pub mod dynamic;
pub mod embedded;
pub mod envelope;
pub mod formatters;
pub mod options;
pub mod resolver;
pub mod serialize;
pub mod stream;

pub use binary::{ExtensionHeader, WireType};
pub use buffer::*;
pub use dynamic::*;
pub use embedded::*;
pub use envelope::*;
pub use formatters::*;
pub use options::*;
pub use resolver::*;
pub use serialize::*;
pub use stream::*;
