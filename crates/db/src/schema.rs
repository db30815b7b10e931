use std::sync::Arc;

use arrow_schema::{DataType, Field, Schema};

/// Schema for the code_chunks table
pub fn chunks_schema(vector_dim: usize) -> Arc<Schema> {
  Arc::new(Schema::new(vec![
    Field::new("id", DataType::Utf8, false),
    Field::new("filepath", DataType::Utf8, false),
    Field::new("content", DataType::Utf8, false),
    Field::new("start_line", DataType::UInt32, false),
    Field::new("end_line", DataType::UInt32, false),
    Field::new("language", DataType::Utf8, false),
    Field::new("symbol_kind", DataType::Utf8, true),
    Field::new("symbol_name", DataType::Utf8, true),
    Field::new(
      "vector",
      DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), vector_dim as i32),
      false,
    ),
  ]))
}

/// Schema for the file_metadata table (mtime in Unix milliseconds)
pub fn file_meta_schema() -> Arc<Schema> {
  Arc::new(Schema::new(vec![
    Field::new("filepath", DataType::Utf8, false),
    Field::new("mtime", DataType::Int64, false),
  ]))
}
