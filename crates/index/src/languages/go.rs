//! Go node-kind tables

use super::LanguageSpec;

pub fn spec() -> LanguageSpec {
  LanguageSpec {
    grammar: tree_sitter_go::LANGUAGE.into(),
    wrappers: &[],
    imports: &["import_declaration"],
    functions: &["function_declaration"],
    top_level_methods: &["method_declaration"],
    classes: &[],
    interfaces: &[],
    types: &["type_declaration"],
    variables: &["const_declaration", "var_declaration"],
    methods: &[],
  }
}
