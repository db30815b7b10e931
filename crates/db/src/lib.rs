mod chunks;
mod connection;
mod files;
mod filter;
mod schema;

pub use connection::{CHUNKS_TABLE, DbError, FILE_META_TABLE, IndexDb, Result};
pub use files::FileMeta;
pub use filter::{escape_literal, filepath_filter, sanitize_filepath};
