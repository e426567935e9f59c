mod index_reader;
mod pagination;
mod token;
mod transfer_source;
mod wallet;

pub use index_reader::*;
pub use pagination::*;
pub use token::*;
pub use transfer_source::*;
pub use wallet::*;
