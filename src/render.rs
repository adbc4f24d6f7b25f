//! ASCII rendering of feather hierarchies.

use featherbone_core::feather::{Feather, Primitive, PropertyType};
use featherbone_core::Catalog;

const REGULAR: char = '●';
const CHILD: char = '○';
const SYSTEM: char = '◆';

fn kind_symbol(feather: &Feather) -> char {
    if feather.is_system {
        SYSTEM
    } else if feather.is_child {
        CHILD
    } else {
        REGULAR
    }
}

/// Render every feather under its parent.
///
/// Example output:
/// ```text
/// Object
/// ├── ● Contact
/// │   └── ● Customer
/// └── ○ OrderLine
/// ```
pub fn render_tree(catalog: &Catalog) -> String {
    let mut output = String::new();
    let roots: Vec<&Feather> = catalog
        .feathers()
        .filter(|f| f.inherits.is_none())
        .map(|f| f.as_ref())
        .collect();
    for (i, root) in roots.iter().enumerate() {
        let is_last = i == roots.len() - 1;
        render_node(&mut output, catalog, root, "", is_last, true);
    }
    output
}

fn render_node(
    output: &mut String,
    catalog: &Catalog,
    feather: &Feather,
    prefix: &str,
    is_last: bool,
    is_root: bool,
) {
    if is_root {
        output.push_str(&feather.name);
        output.push('\n');
    } else {
        let branch = if is_last { "└── " } else { "├── " };
        output.push_str(prefix);
        output.push_str(branch);
        output.push(kind_symbol(feather));
        output.push(' ');
        output.push_str(&feather.name);
        output.push('\n');
    }

    let child_prefix = if is_root {
        String::new()
    } else {
        let continuation = if is_last { "    " } else { "│   " };
        format!("{}{}", prefix, continuation)
    };

    let direct: Vec<_> = catalog
        .children_of(&feather.name)
        .into_iter()
        .filter(|child| child.inherits.as_deref() == Some(feather.name.as_str()))
        .collect();
    for (i, child) in direct.iter().enumerate() {
        let child_is_last = i == direct.len() - 1;
        render_node(output, catalog, child, &child_prefix, child_is_last, false);
    }
}

fn type_label(kind: &PropertyType) -> String {
    match kind {
        PropertyType::Primitive(Primitive::Other(name)) => name.clone(),
        PropertyType::Primitive(primitive) => primitive.as_str().to_string(),
        PropertyType::ToOne { feather, .. } => format!("-> {feather}"),
        PropertyType::ToMany { feather, .. } => format!("[{feather}]"),
    }
}

/// One line per effective property: name, type, flags and the feather that
/// declared it when inherited.
pub fn render_properties(feather: &Feather) -> String {
    let width = feather
        .properties
        .keys()
        .map(String::len)
        .max()
        .unwrap_or(0);
    let mut output = format!("{} {}\n", kind_symbol(feather), feather.name);
    for property in feather.properties.values() {
        let mut line = format!("  {:width$}  {}", property.name, type_label(&property.kind));
        if property.is_required {
            line.push_str(" required");
        }
        if property.is_read_only {
            line.push_str(" read-only");
        }
        if property.declared_by != feather.name {
            line.push_str(&format!(" (from {})", property.declared_by));
        }
        output.push_str(line.trim_end());
        output.push('\n');
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn catalog() -> Catalog {
        let mut catalog = Catalog::new();
        catalog
            .load(json!({
                "Contact": {"properties": {"name": {"type": "string", "isRequired": true}}},
                "Customer": {"inherits": "Contact", "properties": {
                    "lines": {"type": {"relation": "OrderLine", "parentOf": "customer"}}
                }},
                "OrderLine": {"isChild": true, "properties": {
                    "customer": {"type": {"relation": "Customer", "childOf": "lines"}}
                }}
            }))
            .unwrap();
        catalog
    }

    #[test]
    fn test_inheritance_tree() {
        let output = render_tree(&catalog());
        assert_eq!(
            output,
            "Object\n├── ● Contact\n│   └── ● Customer\n└── ○ OrderLine\n"
        );
    }

    #[test]
    fn test_effective_properties() {
        let catalog = catalog();
        let customer = catalog.get_feather("Customer").unwrap();
        let output = render_properties(&customer);
        assert!(output.starts_with("● Customer\n"));
        assert!(output.contains("name       string required (from Contact)"));
        assert!(output.contains("lines      [OrderLine]\n"));
        assert!(output.contains("etag       string read-only (from Object)"));
    }
}
