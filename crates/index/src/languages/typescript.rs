//! TypeScript / JavaScript family node-kind tables
//!
//! One table shape serves ts/tsx/js/jsx; only the grammar differs. Export
//! statements are transparent wrappers around the real declaration.

use super::LanguageSpec;

const WRAPPERS: &[&str] = &["export_statement"];
const IMPORTS: &[&str] = &["import_statement"];
const FUNCTIONS: &[&str] = &["function_declaration", "generator_function_declaration"];
const CLASSES: &[&str] = &["class_declaration"];
const INTERFACES: &[&str] = &["interface_declaration"];
const TYPES: &[&str] = &["type_alias_declaration", "enum_declaration"];
const VARIABLES: &[&str] = &["lexical_declaration", "variable_declaration"];
const METHODS: &[&str] = &["method_definition"];

fn family_spec(grammar: tree_sitter::Language) -> LanguageSpec {
  LanguageSpec {
    grammar,
    wrappers: WRAPPERS,
    imports: IMPORTS,
    functions: FUNCTIONS,
    top_level_methods: &[],
    classes: CLASSES,
    interfaces: INTERFACES,
    types: TYPES,
    variables: VARIABLES,
    methods: METHODS,
  }
}

pub fn spec_typescript() -> LanguageSpec {
  family_spec(tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into())
}

pub fn spec_tsx() -> LanguageSpec {
  family_spec(tree_sitter_typescript::LANGUAGE_TSX.into())
}

pub fn spec_javascript() -> LanguageSpec {
  family_spec(tree_sitter_javascript::LANGUAGE.into())
}
