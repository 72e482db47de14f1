//! A forgiving markup parser for model output.
//!
//! Models emit loosely tag-structured text: unclosed tags, stray `<`, bare
//! attributes. Tokens come from a `quick_xml` reader with end-name checks off;
//! the tree is built here and never fails. A `<` that does not open markup is
//! kept as text and reading resumes right after it. Unmatched close tags are
//! literal text, and elements still open at the end of input are closed
//! implicitly.

use quick_xml::events::{BytesStart, Event};
use quick_xml::escape::{escape, unescape};
use quick_xml::reader::Reader;

/// A node in the parsed tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Text(String),
    Element(Element),
}

impl Node {
    pub fn to_markup(&self) -> String {
        match self {
            Node::Text(text) => escape(text.as_str()).into_owned(),
            Node::Element(el) => el.to_markup(),
        }
    }
}

/// A tag with its attributes and children.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Concatenated text of all descendants.
    pub fn text(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        for child in &self.children {
            match child {
                Node::Text(t) => out.push_str(t),
                Node::Element(el) => el.collect_text(out),
            }
        }
    }

    /// First descendant element named `name`, depth-first.
    pub fn find(&self, name: &str) -> Option<&Element> {
        for child in &self.children {
            if let Node::Element(el) = child {
                if el.name == name {
                    return Some(el);
                }
                if let Some(found) = el.find(name) {
                    return Some(found);
                }
            }
        }
        None
    }

    /// Re-render with text and attribute values escaped.
    pub fn to_markup(&self) -> String {
        let mut out = format!("<{}", self.name);
        for (k, v) in &self.attrs {
            out.push_str(&format!(" {k}=\"{}\"", escape(v.as_str())));
        }
        out.push('>');
        for child in &self.children {
            out.push_str(&child.to_markup());
        }
        out.push_str(&format!("</{}>", self.name));
        out
    }
}

fn unescape_lossy(raw: &str) -> String {
    unescape(raw)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

fn is_tag_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ':' | '.'))
}

/// An element for a start tag, or `None` if the tag name is not one.
fn element_from(tag: &BytesStart<'_>) -> Option<Element> {
    let name = tag.name();
    let name = std::str::from_utf8(name.as_ref()).ok()?;
    if !is_tag_name(name) {
        return None;
    }
    let mut el = Element::new(name);
    for attr in tag.html_attributes().flatten() {
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = unescape_lossy(&String::from_utf8_lossy(&attr.value));
        el.attrs.push((key, value));
    }
    Some(el)
}

/// Builds the node tree from reader events.
struct TreeBuilder {
    /// Open elements; index 0 is the synthetic root.
    stack: Vec<Element>,
}

impl TreeBuilder {
    fn top(&mut self) -> &mut Element {
        // The root is never popped.
        let last = self.stack.len() - 1;
        &mut self.stack[last]
    }

    fn text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        let top = self.top();
        match top.children.last_mut() {
            Some(Node::Text(prev)) => prev.push_str(text),
            _ => top.children.push(Node::Text(text.to_string())),
        }
    }

    fn close_top(&mut self) {
        if self.stack.len() > 1
            && let Some(done) = self.stack.pop()
        {
            self.top().children.push(Node::Element(done));
        }
    }

    /// Close the innermost open element named `name` and everything inside it.
    fn close(&mut self, name: &str) -> bool {
        let Some(depth) = self.stack.iter().skip(1).rposition(|el| el.name == name) else {
            return false;
        };
        // rposition on the skipped iterator is relative to index 1.
        while self.stack.len() > depth + 1 {
            self.close_top();
        }
        true
    }

    /// Keep the character at `at` as text. Returns where reading resumes.
    fn literal(&mut self, rest: &str, base: usize, at: usize) -> usize {
        match rest.get(at..).and_then(|s| s.chars().next()) {
            Some(c) => {
                self.text(c.encode_utf8(&mut [0; 4]));
                base + at + c.len_utf8()
            }
            None => base + rest.len(),
        }
    }

    /// Read events from `base` until the input ends or a `<` turns out not to
    /// open markup. Returns the offset to resume from.
    fn feed(&mut self, input: &str, base: usize) -> usize {
        let rest = input.get(base..).unwrap_or_default();
        let mut reader = Reader::from_str(rest);
        let config = reader.config_mut();
        config.check_end_names = false;
        config.allow_unmatched_ends = true;
        config.check_comments = false;
        config.allow_dangling_amp = true;

        loop {
            let at = reader.buffer_position() as usize;
            let event = reader.read_event();
            let end = reader.buffer_position() as usize;
            let raw = rest.get(at..end).unwrap_or_default();
            match event {
                Ok(Event::Eof) => return input.len(),
                Ok(Event::Start(tag)) => match element_from(&tag) {
                    Some(el) => self.stack.push(el),
                    None => return self.literal(rest, base, at),
                },
                Ok(Event::Empty(tag)) => match element_from(&tag) {
                    Some(el) => self.top().children.push(Node::Element(el)),
                    None => return self.literal(rest, base, at),
                },
                Ok(Event::End(tag)) => {
                    let name = String::from_utf8_lossy(tag.name().as_ref()).into_owned();
                    if !self.close(&name) {
                        self.text(raw);
                    }
                }
                Ok(Event::Comment(_)) => {}
                // Text, references, CDATA and declarations are kept as text.
                Ok(_) => self.text(&unescape_lossy(raw)),
                Err(_) => return self.literal(rest, base, at),
            }
        }
    }

    fn finish(mut self) -> Vec<Node> {
        while self.stack.len() > 1 {
            self.close_top();
        }
        self.stack.pop().map(|root| root.children).unwrap_or_default()
    }
}

/// Parse `input` into its top-level nodes.
pub fn parse(input: &str) -> Vec<Node> {
    let mut tree = TreeBuilder {
        stack: vec![Element::new("")],
    };
    let mut offset = 0;
    while offset < input.len() {
        offset = tree.feed(input, offset);
    }
    tree.finish()
}

/// Parse and wrap the top-level nodes in a nameless root element.
pub fn parse_root(input: &str) -> Element {
    Element {
        children: parse(input),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(node: &Node) -> &Element {
        match node {
            Node::Element(el) => el,
            Node::Text(t) => panic!("expected element, got text {t:?}"),
        }
    }

    #[test]
    fn text_and_elements_in_order() {
        let nodes = parse("I will list files.\n<bash>ls -la</bash>\nDone.");
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0], Node::Text("I will list files.\n".into()));
        let bash = element(&nodes[1]);
        assert_eq!(bash.name, "bash");
        assert_eq!(bash.text(), "ls -la");
        assert_eq!(nodes[2], Node::Text("\nDone.".into()));
    }

    #[test]
    fn attributes_quoted_unquoted_and_bare() {
        let nodes = parse(r#"<file path="a &amp; b.txt" mode=w overwrite>x</file>"#);
        let file = element(&nodes[0]);
        assert_eq!(file.attr("path"), Some("a & b.txt"));
        assert_eq!(file.attr("mode"), Some("w"));
        assert_eq!(file.attr("overwrite"), Some(""));
    }

    #[test]
    fn stray_angle_brackets_are_text() {
        let nodes = parse("if a < b and c<3 then </nope> done");
        assert_eq!(nodes, vec![Node::Text("if a < b and c<3 then </nope> done".into())]);
    }

    #[test]
    fn tag_after_stray_bracket_is_found() {
        let nodes = parse("a < b <bash>ls</bash>");
        assert_eq!(nodes[0], Node::Text("a < b ".into()));
        assert_eq!(element(&nodes[1]).text(), "ls");
        assert_eq!(nodes.len(), 2);
    }

    #[test]
    fn bracket_inside_element_stays_text() {
        let nodes = parse("<bash>grep '<x' notes.txt && echo a&b</bash>");
        assert_eq!(nodes.len(), 1);
        assert_eq!(element(&nodes[0]).text(), "grep '<x' notes.txt && echo a&b");
    }

    #[test]
    fn unclosed_element_closes_at_end() {
        let nodes = parse("<plan><step>one");
        let plan = element(&nodes[0]);
        assert_eq!(plan.find("step").map(Element::text), Some("one".into()));
    }

    #[test]
    fn close_tag_closes_intermediate_elements() {
        let nodes = parse("<a><b>inner</a>after");
        let a = element(&nodes[0]);
        assert_eq!(a.children.len(), 1);
        assert_eq!(element(&a.children[0]).name, "b");
        assert_eq!(nodes[1], Node::Text("after".into()));
    }

    #[test]
    fn comments_are_dropped() {
        assert_eq!(
            parse("a<!-- hidden -->b"),
            vec![Node::Text("ab".into())]
        );
    }

    #[test]
    fn self_closing_element() {
        let nodes = parse("<br/>x");
        assert_eq!(element(&nodes[0]).name, "br");
        assert!(element(&nodes[0]).children.is_empty());
    }

    #[test]
    fn markup_escapes_text_and_attrs() {
        let mut el = Element::new("bash");
        el.attrs.push(("note".into(), "\"q\"".into()));
        el.children.push(Node::Text("a < b && c".into()));
        assert_eq!(
            el.to_markup(),
            "<bash note=\"&quot;q&quot;\">a &lt; b &amp;&amp; c</bash>"
        );
    }

    #[test]
    fn entities_unescaped_in_text() {
        let nodes = parse("<bash>echo &lt;hi&gt;</bash>");
        assert_eq!(element(&nodes[0]).text(), "echo <hi>");
    }
}
