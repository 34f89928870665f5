//! Declarative element locators
//!
//! A [`Locator`] is a value: a tag/class/attribute/text predicate plus
//! structural relations (`within`, `has`, `following_sibling_of`) and an
//! optional explicit index. It never caches a resolution; every query is
//! evaluated against the document as it is at that moment, either by the
//! in-memory [`crate::dom::Document`] or, through [`Locator::to_js`], in a
//! real browser.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How element text is compared
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextMatch {
    /// Whitespace-normalized text equals the value
    Exact(String),
    /// Whitespace-normalized text contains the value
    Contains(String),
}

impl TextMatch {
    pub fn matches(&self, text: &str) -> bool {
        let normalized = normalize_whitespace(text);
        match self {
            TextMatch::Exact(t) => normalized == normalize_whitespace(t),
            TextMatch::Contains(t) => normalized.contains(&normalize_whitespace(t)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrMatch {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub contains: bool,
}

impl AttrMatch {
    pub fn matches(&self, actual: Option<&str>) -> bool {
        match actual {
            Some(v) if self.contains => v.contains(&self.value),
            Some(v) => v == self.value,
            None => false,
        }
    }
}

/// Structural relationship to another locator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    /// Element is a descendant of some match of the inner locator
    Within(Box<Locator>),
    /// Element has a descendant matching the inner locator
    Has(Box<Locator>),
    /// Element is a later sibling of some match of the inner locator
    FollowingSiblingOf(Box<Locator>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Locator {
    pub tag: Option<String>,
    pub classes: Vec<String>,
    pub attrs: Vec<AttrMatch>,
    pub text: Option<TextMatch>,
    pub relations: Vec<Relation>,
    /// Zero-based pick among all matches, in document order
    pub index: Option<usize>,
}

impl Locator {
    /// Any element
    pub fn any() -> Self {
        Self::default()
    }

    pub fn tag(tag: impl Into<String>) -> Self {
        Self {
            tag: Some(tag.into().to_ascii_lowercase()),
            ..Self::default()
        }
    }

    pub fn css_class(class: impl Into<String>) -> Self {
        Self::any().class(class)
    }

    pub fn by_name(name: impl Into<String>) -> Self {
        Self::any().attr("name", name)
    }

    pub fn by_id(id: impl Into<String>) -> Self {
        Self::any().attr("id", id)
    }

    pub fn link_with_text(text: impl Into<String>) -> Self {
        Self::tag("a").with_text(text)
    }

    pub fn link_containing_text(text: impl Into<String>) -> Self {
        Self::tag("a").containing_text(text)
    }

    /// A rendered action button (`a.labkey-button` / ext button) by label
    pub fn button(label: impl Into<String>) -> Self {
        Self::css_class("labkey-button").with_text(label)
    }

    /// Wizard page header carrying the page title
    pub fn page_header(title: impl Into<String>) -> Self {
        Self::tag("div").class("labkey-nav-page-header").with_text(title)
    }

    /// Modal dialog window with the given title
    pub fn dialog(title: impl Into<String>) -> Self {
        Self::css_class("x-window")
            .has(Self::css_class("x-window-header-text").with_text(title))
    }

    pub fn radio(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::tag("input")
            .attr("type", "radio")
            .attr("name", name)
            .attr("value", value)
    }

    pub fn checkbox(name: impl Into<String>) -> Self {
        Self::tag("input").attr("type", "checkbox").attr("name", name)
    }

    /// Data region table by its logical region name
    pub fn region(name: impl Into<String>) -> Self {
        Self::tag("table").attr("lk-region-name", name)
    }

    /// Innermost-agnostic text search; any element whose text contains `text`
    pub fn text_anywhere(text: impl Into<String>) -> Self {
        Self::any().containing_text(text)
    }

    pub fn class(mut self, class: impl Into<String>) -> Self {
        self.classes.push(class.into());
        self
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.push(AttrMatch {
            name: name.into(),
            value: value.into(),
            contains: false,
        });
        self
    }

    pub fn attr_contains(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.push(AttrMatch {
            name: name.into(),
            value: value.into(),
            contains: true,
        });
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(TextMatch::Exact(text.into()));
        self
    }

    pub fn containing_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(TextMatch::Contains(text.into()));
        self
    }

    pub fn within(mut self, ancestor: Locator) -> Self {
        self.relations.push(Relation::Within(Box::new(ancestor)));
        self
    }

    pub fn has(mut self, descendant: Locator) -> Self {
        self.relations.push(Relation::Has(Box::new(descendant)));
        self
    }

    pub fn following_sibling_of(mut self, sibling: Locator) -> Self {
        self.relations
            .push(Relation::FollowingSiblingOf(Box::new(sibling)));
        self
    }

    /// Pick the nth match (zero-based). This is always an explicit choice.
    pub fn nth(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }

    /// CSS selector for the tag/class/attribute part of the predicate
    pub fn css(&self) -> String {
        let mut css = self.tag.clone().unwrap_or_else(|| "*".to_string());
        for class in &self.classes {
            css.push('.');
            css.push_str(class);
        }
        for attr in &self.attrs {
            let op = if attr.contains { "*=" } else { "=" };
            css.push_str(&format!("[{}{}{:?}]", attr.name, op, attr.value));
        }
        css
    }

    /// JavaScript expression evaluating to an array of matching elements
    pub fn to_js(&self) -> String {
        let mut expr = format!(
            "Array.from(document.querySelectorAll({:?}))",
            self.css()
        );

        if let Some(text) = &self.text {
            let norm = "(el.textContent || '').replace(/\\s+/g, ' ').trim()";
            expr = match text {
                TextMatch::Exact(t) => {
                    format!("{expr}.filter(el => {norm} === {:?})", normalize_whitespace(t))
                }
                TextMatch::Contains(t) => {
                    format!("{expr}.filter(el => {norm}.includes({:?}))", normalize_whitespace(t))
                }
            };
        }

        for relation in &self.relations {
            expr = match relation {
                Relation::Within(outer) => format!(
                    "((outer) => {expr}.filter(el => outer.some(o => o !== el && o.contains(el))))({})",
                    outer.to_js()
                ),
                Relation::Has(inner) => format!(
                    "((inner) => {expr}.filter(el => inner.some(i => i !== el && el.contains(i))))({})",
                    inner.to_js()
                ),
                Relation::FollowingSiblingOf(sib) => format!(
                    "((sibs) => {expr}.filter(el => sibs.some(s => s.parentNode === el.parentNode \
                     && (s.compareDocumentPosition(el) & Node.DOCUMENT_POSITION_FOLLOWING))))({})",
                    sib.to_js()
                ),
            };
        }

        if let Some(i) = self.index {
            expr = format!("{expr}.slice({i}, {})", i + 1);
        }

        expr
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.css())?;
        match &self.text {
            Some(TextMatch::Exact(t)) => write!(f, "[text={t:?}]")?,
            Some(TextMatch::Contains(t)) => write!(f, "[text~={t:?}]")?,
            None => {}
        }
        for relation in &self.relations {
            match relation {
                Relation::Within(o) => write!(f, " within ({o})")?,
                Relation::Has(i) => write!(f, " has ({i})")?,
                Relation::FollowingSiblingOf(s) => write!(f, " after ({s})")?,
            }
        }
        if let Some(i) = self.index {
            write!(f, "[{i}]")?;
        }
        Ok(())
    }
}

/// Collapse whitespace runs and trim, the way rendered text is compared
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn css_combines_tag_classes_and_attributes() {
        let loc = Locator::tag("input")
            .class("x-form-field")
            .attr("name", "studyName")
            .attr_contains("id", "ext-gen");
        assert_eq!(
            loc.css(),
            r#"input.x-form-field[name="studyName"][id*="ext-gen"]"#
        );
    }

    #[test]
    fn exact_text_ignores_surrounding_whitespace() {
        let m = TextMatch::Exact("General Setup".to_string());
        assert!(m.matches("  General\n   Setup "));
        assert!(!m.matches("General Setup (2)"));
    }

    #[test]
    fn display_describes_relations_and_index() {
        let loc = Locator::tag("td")
            .with_text("AssayTestControl1")
            .following_sibling_of(Locator::tag("td").with_text("Day 120 - 127"))
            .nth(0);
        let shown = loc.to_string();
        assert!(shown.starts_with("td[text=\"AssayTestControl1\"]"));
        assert!(shown.contains("after (td[text=\"Day 120 - 127\"])"));
        assert!(shown.ends_with("[0]"));
    }

    #[test]
    fn js_expression_applies_index_last() {
        let js = Locator::link_with_text("Republish").nth(2).to_js();
        assert!(js.starts_with("Array.from(document.querySelectorAll(\"a\"))"));
        assert!(js.ends_with(".slice(2, 3)"));
    }

    #[test]
    fn locator_round_trips_through_yaml() {
        let yaml = r#"
tag: div
classes: [labkey-nav-page-header]
text:
  exact: Mice
"#;
        let loc: Locator = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(loc, Locator::page_header("Mice"));
    }
}
