//! Small XML helpers shared by the SOAP and esxcli layers.

use roxmltree::Node;

pub const XSI_NS: &str = "http://www.w3.org/2001/XMLSchema-instance";

/// Escape text for inclusion in an XML element or attribute.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// `xsi:type` of an element, without any namespace prefix
pub fn xsi_type<'a>(node: Node<'a, '_>) -> Option<&'a str> {
    node.attribute((XSI_NS, "type"))
        .map(|t| t.rsplit(':').next().unwrap_or(t))
}

/// Element children of a node
pub fn elements<'a, 'input>(node: Node<'a, 'input>) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children().filter(|n| n.is_element())
}

/// First element child with the given local name
pub fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    elements(node).find(|n| n.tag_name().name() == name)
}

/// Trimmed text of the first element child with the given local name
pub fn child_text(node: Node<'_, '_>, name: &str) -> Option<String> {
    child(node, name).map(|n| text(n))
}

/// Concatenated, trimmed text content of a node
pub fn text(node: Node<'_, '_>) -> String {
    node.descendants()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect::<String>()
        .trim()
        .to_string()
}

/// All descendant elements with the given local name
pub fn descendants_named<'a, 'input>(
    node: Node<'a, 'input>,
    name: &'a str,
) -> impl Iterator<Item = Node<'a, 'input>> + 'a {
    node.descendants()
        .filter(move |n| n.is_element() && n.tag_name().name() == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape() {
        assert_eq!(escape("a<b & 'c'"), "a&lt;b &amp; &apos;c&apos;");
    }

    #[test]
    fn test_xsi_type_strips_prefix() {
        let doc = roxmltree::Document::parse(
            r#"<obj xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xsi:type="xsd:string">x</obj>"#,
        )
        .unwrap();
        assert_eq!(xsi_type(doc.root_element()), Some("string"));
    }

    #[test]
    fn test_child_text() {
        let doc = roxmltree::Document::parse("<a><b> one </b><c><d>two</d></c></a>").unwrap();
        let root = doc.root_element();
        assert_eq!(child_text(root, "b").as_deref(), Some("one"));
        assert_eq!(child_text(root, "c").as_deref(), Some("two"));
        assert!(child_text(root, "z").is_none());
    }
}
