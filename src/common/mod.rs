pub mod addr;
pub mod error;
pub mod stream;

pub use addr::Address;
pub use error::{SudokuError, SudokuErrorKind};
pub use stream::{AsyncStream, PrefixedStream, ProxyStream};
