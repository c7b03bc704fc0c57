pub mod builder;
pub mod codec;
pub mod header;
pub mod types;

pub use codec::Event;
pub use header::Header;
