//! Ruby node-kind tables
//!
//! Requires are plain method calls in the grammar, so Ruby files carry no
//! import chunk.

use super::LanguageSpec;

pub fn spec() -> LanguageSpec {
  LanguageSpec {
    grammar: tree_sitter_ruby::LANGUAGE.into(),
    wrappers: &[],
    imports: &[],
    functions: &["method"],
    top_level_methods: &[],
    classes: &["class", "module"],
    interfaces: &[],
    types: &[],
    variables: &[],
    methods: &["method", "singleton_method"],
  }
}

#[cfg(test)]
mod tests {
  use codectx_core::SymbolKind;

  use crate::Chunker;

  #[test]
  fn test_ruby_class_and_method() {
    let source = r#"class Greeter
  def hello(name)
    puts "hi #{name}"
  end
end

def standalone
  42
end
"#;
    let chunks = Chunker::default().chunk_file("greeter.rb", source);

    let class = chunks.iter().find(|c| c.symbol_name.as_deref() == Some("Greeter")).unwrap();
    assert_eq!(class.symbol_kind, Some(SymbolKind::Class));
    assert_eq!(class.language, "ruby");

    let func = chunks.iter().find(|c| c.symbol_name.as_deref() == Some("standalone")).unwrap();
    assert_eq!(func.symbol_kind, Some(SymbolKind::Function));
  }

  #[test]
  fn test_ruby_oversized_class_splits_into_methods() {
    let mut source = String::from("class Fat\n");
    for i in 0..40 {
      source.push_str(&format!("  def op{}\n    a = 1\n    a + 1\n  end\n", i));
    }
    source.push_str("end\n");

    let chunks = Chunker::with_limits(100, 20).chunk_file("fat.rb", &source);
    assert!(chunks.iter().any(|c| c.symbol_name.as_deref() == Some("Fat.op0")));
  }
}
