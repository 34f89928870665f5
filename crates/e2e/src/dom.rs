//! In-memory element tree that locators can be evaluated against

use std::collections::BTreeMap;

use crate::driver::ElementInfo;
use crate::locator::{normalize_whitespace, Locator, Relation};

/// Builder-side element description
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    pub tag: String,
    pub attrs: BTreeMap<String, String>,
    pub text: String,
    pub children: Vec<Node>,
}

impl Node {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into().to_ascii_lowercase(),
            ..Self::default()
        }
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    pub fn class(self, class: impl Into<String>) -> Self {
        let class = class.into();
        let merged = match self.attrs.get("class") {
            Some(existing) => format!("{existing} {class}"),
            None => class,
        };
        self.attr("class", merged)
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn child(mut self, child: Node) -> Self {
        self.children.push(child);
        self
    }

    pub fn children(mut self, children: impl IntoIterator<Item = Node>) -> Self {
        self.children.extend(children);
        self
    }
}

#[derive(Debug, Clone)]
struct Slot {
    tag: String,
    attrs: BTreeMap<String, String>,
    own_text: String,
    parent: Option<usize>,
    children: Vec<usize>,
}

/// Flattened, immutable document. Indices are in document (pre-)order.
#[derive(Debug, Clone)]
pub struct Document {
    slots: Vec<Slot>,
}

impl Document {
    pub fn new(root: Node) -> Self {
        let mut slots = Vec::new();
        flatten(root, None, &mut slots);
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn tag(&self, id: usize) -> &str {
        &self.slots[id].tag
    }

    pub fn attr(&self, id: usize, name: &str) -> Option<&str> {
        self.slots[id].attrs.get(name).map(String::as_str)
    }

    /// Concatenated text of the element and its descendants
    pub fn text_content(&self, id: usize) -> String {
        let mut out = String::new();
        self.collect_text(id, &mut out);
        out
    }

    fn collect_text(&self, id: usize, out: &mut String) {
        let slot = &self.slots[id];
        if !slot.own_text.is_empty() {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(&slot.own_text);
        }
        for &child in &slot.children {
            self.collect_text(child, out);
        }
    }

    /// Full rendered text of the page
    pub fn page_text(&self) -> String {
        if self.slots.is_empty() {
            return String::new();
        }
        normalize_whitespace(&self.text_content(0))
    }

    pub fn is_ancestor(&self, ancestor: usize, id: usize) -> bool {
        let mut cur = self.slots[id].parent;
        while let Some(p) = cur {
            if p == ancestor {
                return true;
            }
            cur = self.slots[p].parent;
        }
        false
    }

    fn is_following_sibling(&self, earlier: usize, id: usize) -> bool {
        earlier < id && self.slots[earlier].parent.is_some()
            && self.slots[earlier].parent == self.slots[id].parent
    }

    /// All matches in document order, honoring the locator's index
    pub fn select(&self, locator: &Locator) -> Vec<usize> {
        let mut matches: Vec<usize> = (0..self.slots.len())
            .filter(|&id| self.matches_own(id, locator))
            .collect();

        for relation in &locator.relations {
            matches = match relation {
                Relation::Within(outer) => {
                    let outers = self.select(outer);
                    matches
                        .into_iter()
                        .filter(|&id| outers.iter().any(|&o| self.is_ancestor(o, id)))
                        .collect()
                }
                Relation::Has(inner) => {
                    let inners = self.select(inner);
                    matches
                        .into_iter()
                        .filter(|&id| inners.iter().any(|&i| self.is_ancestor(id, i)))
                        .collect()
                }
                Relation::FollowingSiblingOf(sib) => {
                    let sibs = self.select(sib);
                    matches
                        .into_iter()
                        .filter(|&id| sibs.iter().any(|&s| self.is_following_sibling(s, id)))
                        .collect()
                }
            };
        }

        match locator.index {
            Some(i) => matches.into_iter().nth(i).into_iter().collect(),
            None => matches,
        }
    }

    fn matches_own(&self, id: usize, locator: &Locator) -> bool {
        let slot = &self.slots[id];

        if let Some(tag) = &locator.tag {
            if &slot.tag != tag {
                return false;
            }
        }

        if !locator.classes.is_empty() {
            let classes: Vec<&str> = slot
                .attrs
                .get("class")
                .map(|c| c.split_whitespace().collect())
                .unwrap_or_default();
            if !locator.classes.iter().all(|c| classes.contains(&c.as_str())) {
                return false;
            }
        }

        if !locator
            .attrs
            .iter()
            .all(|a| a.matches(slot.attrs.get(&a.name).map(String::as_str)))
        {
            return false;
        }

        match &locator.text {
            Some(text) => text.matches(&self.text_content(id)),
            None => true,
        }
    }

    /// Snapshot of one element for callers outside the document
    pub fn info(&self, id: usize) -> ElementInfo {
        let slot = &self.slots[id];
        ElementInfo {
            tag: slot.tag.clone(),
            text: normalize_whitespace(&self.text_content(id)),
            attrs: slot.attrs.clone(),
            value: slot.attrs.get("value").cloned(),
            checked: slot.attrs.contains_key("checked"),
        }
    }
}

fn flatten(node: Node, parent: Option<usize>, slots: &mut Vec<Slot>) -> usize {
    let id = slots.len();
    slots.push(Slot {
        tag: node.tag,
        attrs: node.attrs,
        own_text: node.text,
        parent,
        children: Vec::new(),
    });
    for child in node.children {
        let child_id = flatten(child, Some(id), slots);
        slots[id].children.push(child_id);
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    fn visit_table() -> Document {
        Document::new(
            Node::new("body").child(
                Node::new("table")
                    .attr("lk-region-name", "Data")
                    .child(
                        Node::new("tr")
                            .child(Node::new("td").text("Day 120 - 127"))
                            .child(Node::new("td").text("AssayTestControl1"))
                            .child(Node::new("td").text("5.0")),
                    )
                    .child(
                        Node::new("tr")
                            .child(Node::new("td").text("Day 152 - 159"))
                            .child(Node::new("td").text("AssayTestControl2"))
                            .child(Node::new("td").text("6.0")),
                    ),
            ),
        )
    }

    #[test]
    fn sibling_relation_pins_row_context() {
        let doc = visit_table();
        let loc = Locator::tag("td")
            .with_text("6.0")
            .following_sibling_of(Locator::tag("td").with_text("Day 152 - 159"));
        assert_eq!(doc.select(&loc).len(), 1);

        let wrong_row = Locator::tag("td")
            .with_text("6.0")
            .following_sibling_of(Locator::tag("td").with_text("Day 120 - 127"));
        assert!(doc.select(&wrong_row).is_empty());
    }

    #[test]
    fn within_and_has_are_structural() {
        let doc = visit_table();
        let cells = Locator::tag("td").within(Locator::region("Data"));
        assert_eq!(doc.select(&cells).len(), 6);

        let row = Locator::tag("tr").has(Locator::tag("td").with_text("AssayTestControl2"));
        let rows = doc.select(&row);
        assert_eq!(rows.len(), 1);
        assert!(doc.text_content(rows[0]).contains("Day 152 - 159"));
    }

    #[test]
    fn class_match_requires_every_class() {
        let doc = Document::new(
            Node::new("div").child(
                Node::new("a")
                    .class("labkey-button")
                    .class("labkey-disabled-button")
                    .text("Next"),
            ),
        );
        assert_eq!(doc.select(&Locator::button("Next")).len(), 1);
        let both = Locator::css_class("labkey-button").class("primary");
        assert!(doc.select(&both).is_empty());
    }

    #[test]
    fn nth_is_explicit_and_bounded() {
        let doc = visit_table();
        let second = Locator::tag("tr").nth(1);
        let picked = doc.select(&second);
        assert_eq!(picked.len(), 1);
        assert!(doc.text_content(picked[0]).contains("AssayTestControl2"));
        assert!(doc.select(&Locator::tag("tr").nth(5)).is_empty());
    }

    #[test]
    fn page_text_is_normalized() {
        let doc = visit_table();
        assert!(doc.page_text().contains("AssayTestControl1 5.0 Day 152 - 159"));
    }
}
