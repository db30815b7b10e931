//! Python node-kind tables

use super::LanguageSpec;

pub fn spec() -> LanguageSpec {
  LanguageSpec {
    grammar: tree_sitter_python::LANGUAGE.into(),
    // Decorated definitions wrap the real function/class one level down
    wrappers: &["decorated_definition"],
    imports: &["import_statement", "import_from_statement", "future_import_statement"],
    functions: &["function_definition"],
    top_level_methods: &[],
    classes: &["class_definition"],
    interfaces: &[],
    types: &[],
    variables: &[],
    methods: &["function_definition"],
  }
}
