//! Java node-kind tables

use super::LanguageSpec;

pub fn spec() -> LanguageSpec {
  LanguageSpec {
    grammar: tree_sitter_java::LANGUAGE.into(),
    wrappers: &[],
    imports: &["import_declaration"],
    functions: &[],
    top_level_methods: &[],
    classes: &["class_declaration"],
    interfaces: &["interface_declaration", "annotation_type_declaration"],
    types: &["enum_declaration", "record_declaration"],
    variables: &[],
    methods: &["method_declaration", "constructor_declaration"],
  }
}
