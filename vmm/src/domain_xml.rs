// Copyright © 2024 The vmhost Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Lossless ordered tree model of a workload hardware description.
//!
//! Every node keeps the exact source text it was parsed from. Serializing a
//! tree that was not modified reproduces the input byte for byte, and an edit
//! only re-renders the start tag of the element it touched. New elements are
//! indented like their siblings.

use std::fmt::{self, Write};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("Malformed document at byte {offset}: {reason}")]
    Parse { offset: usize, reason: String },
    #[error("Unexpected document structure: {0}")]
    Structure(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    /// Character data, kept escaped exactly as found in the source.
    Text(String),
    /// Comment including its delimiters.
    Comment(String),
    /// Processing instruction, CDATA section or doctype, verbatim.
    Other(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Attribute {
    name: String,
    /// Escaped value.
    raw: String,
    quote: char,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Element {
    name: String,
    attrs: Vec<Attribute>,
    children: Vec<Node>,
    self_closing: bool,
    raw_open: Option<String>,
    raw_close: Option<String>,
}

pub(crate) fn escape(value: &str, quote: char) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' if quote == '\'' => out.push_str("&apos;"),
            '"' if quote == '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(idx) = rest.find('&') {
        out.push_str(&rest[..idx]);
        rest = &rest[idx..];
        let Some(end) = rest.find(';') else {
            break;
        };
        let entity = &rest[1..end];
        let decoded = match entity {
            "lt" => Some('<'),
            "gt" => Some('>'),
            "amp" => Some('&'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|d| d.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn is_blank(node: &Node) -> bool {
    matches!(node, Node::Text(t) if t.trim().is_empty())
}

impl Element {
    pub fn new(name: &str) -> Self {
        Element {
            name: name.to_owned(),
            attrs: Vec::new(),
            children: Vec::new(),
            self_closing: true,
            raw_open: None,
            raw_close: None,
        }
    }

    /// Builder form of [`Element::set_attr`].
    pub fn with_attr(mut self, name: &str, value: &str) -> Self {
        self.set_attr(name, value);
        self
    }

    /// Builder form of [`Element::push`].
    pub fn with_child(mut self, child: Element) -> Self {
        self.push(child);
        self
    }

    /// Builder form of [`Element::set_text`].
    pub fn with_text(mut self, text: &str) -> Self {
        self.set_text(text);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn touch(&mut self) {
        self.raw_open = None;
    }

    fn open_for_children(&mut self) {
        if self.self_closing {
            self.self_closing = false;
            self.raw_open = None;
            self.raw_close = None;
        }
    }

    pub fn attr(&self, name: &str) -> Option<String> {
        self.attrs
            .iter()
            .find(|a| a.name == name)
            .map(|a| unescape(&a.raw))
    }

    /// Set an attribute, keeping its position when it already exists.
    pub fn set_attr(&mut self, name: &str, value: &str) {
        match self.attrs.iter_mut().find(|a| a.name == name) {
            Some(attr) => {
                let raw = escape(value, attr.quote);
                if attr.raw != raw {
                    attr.raw = raw;
                    self.raw_open = None;
                }
            }
            None => {
                self.attrs.push(Attribute {
                    name: name.to_owned(),
                    raw: escape(value, '\''),
                    quote: '\'',
                });
                self.touch();
            }
        }
    }

    pub fn remove_attr(&mut self, name: &str) -> bool {
        let before = self.attrs.len();
        self.attrs.retain(|a| a.name != name);
        let removed = self.attrs.len() != before;
        if removed {
            self.touch();
        }
        removed
    }

    /// Unescaped concatenation of the element's direct text content.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|n| match n {
                Node::Text(t) => Some(unescape(t)),
                _ => None,
            })
            .collect()
    }

    /// Replace all children with a single text node.
    pub fn set_text(&mut self, text: &str) {
        let raw = escape(text, '\0');
        if matches!(self.children.as_slice(), [Node::Text(t)] if *t == raw) {
            return;
        }
        self.open_for_children();
        self.children = vec![Node::Text(raw)];
    }

    pub fn nodes(&self) -> &[Node] {
        &self.children
    }

    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            _ => None,
        })
    }

    pub fn elements_mut(&mut self) -> impl Iterator<Item = &mut Element> {
        self.children.iter_mut().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            _ => None,
        })
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.elements().filter(move |e| e.name == name)
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.elements().find(|e| e.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Element> {
        self.elements_mut().find(|e| e.name == name)
    }

    /// Follow a `/` separated path of child names.
    pub fn find(&self, path: &str) -> Option<&Element> {
        path.split('/')
            .try_fold(self, |el, name| el.child(name))
    }

    pub fn find_mut(&mut self, path: &str) -> Option<&mut Element> {
        path.split('/')
            .try_fold(self, |el, name| el.child_mut(name))
    }

    /// True when the element holds no child element and no non-blank text.
    pub fn is_empty(&self) -> bool {
        self.children.iter().all(is_blank)
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.children
            .iter()
            .position(|n| matches!(n, Node::Element(e) if e.name == name))
    }

    /// Whitespace preceding the first child element, past its last newline.
    fn child_indent(&self) -> Option<String> {
        let first = self
            .children
            .iter()
            .position(|n| matches!(n, Node::Element(_)))?;
        match first.checked_sub(1).map(|i| &self.children[i]) {
            Some(Node::Text(t)) if t.trim().is_empty() => {
                Some(t.rsplit('\n').next().unwrap_or("").to_owned())
            }
            _ => None,
        }
    }

    /// Append `child` after the last child element.
    pub fn push(&mut self, child: Element) {
        self.open_for_children();
        let last = self
            .children
            .iter()
            .rposition(|n| matches!(n, Node::Element(_)));
        match (last, self.child_indent()) {
            (Some(idx), Some(indent)) => {
                self.children
                    .insert(idx + 1, Node::Text(format!("\n{indent}")));
                self.children.insert(idx + 2, Node::Element(child));
            }
            (Some(idx), None) => self.children.insert(idx + 1, Node::Element(child)),
            (None, _) => {
                // Keep trailing whitespace before the closing tag.
                let idx = if self.children.last().is_some_and(is_blank) {
                    self.children.len() - 1
                } else {
                    self.children.len()
                };
                self.children.insert(idx, Node::Element(child));
            }
        }
    }

    /// Insert `child` right before the first child element named `anchor`.
    ///
    /// Returns the child back when there is no such anchor.
    pub fn insert_before(&mut self, anchor: &str, child: Element) -> std::result::Result<(), Element> {
        let Some(idx) = self.position(anchor) else {
            return Err(child);
        };
        let indent = match idx.checked_sub(1).map(|i| &self.children[i]) {
            Some(Node::Text(t)) if t.trim().is_empty() => {
                Some(t.rsplit('\n').next().unwrap_or("").to_owned())
            }
            _ => None,
        };
        self.children.insert(idx, Node::Element(child));
        if let Some(indent) = indent {
            self.children.insert(idx + 1, Node::Text(format!("\n{indent}")));
        }
        Ok(())
    }

    /// Insert `child` right after the first child element named `anchor`.
    ///
    /// Returns the child back when there is no such anchor.
    pub fn insert_after(&mut self, anchor: &str, child: Element) -> std::result::Result<(), Element> {
        let Some(idx) = self.position(anchor) else {
            return Err(child);
        };
        match self.child_indent() {
            Some(indent) => {
                self.children.insert(idx + 1, Node::Text(format!("\n{indent}")));
                self.children.insert(idx + 2, Node::Element(child));
            }
            None => self.children.insert(idx + 1, Node::Element(child)),
        }
        Ok(())
    }

    /// Insert `child` before `anchor`, or append it when the anchor is absent.
    pub fn insert_before_or_push(&mut self, anchor: &str, child: Element) {
        if let Err(child) = self.insert_before(anchor, child) {
            self.push(child);
        }
    }

    /// Remove every child element named `name` along with the whitespace
    /// that preceded it. Returns how many were removed.
    pub fn remove_children(&mut self, name: &str) -> usize {
        self.remove_children_where(|e| e.name == name)
    }

    /// Like [`Element::remove_children`], for every child element matching
    /// `pred`.
    pub fn remove_children_where(&mut self, pred: impl Fn(&Element) -> bool) -> usize {
        let mut removed = 0;
        while let Some(idx) = self
            .children
            .iter()
            .position(|n| matches!(n, Node::Element(e) if pred(e)))
        {
            self.children.remove(idx);
            if idx > 0 && is_blank(&self.children[idx - 1]) {
                self.children.remove(idx - 1);
            }
            removed += 1;
        }
        removed
    }

    /// Replace the first child named like `child` in place, or append it.
    pub fn replace_child(&mut self, child: Element) {
        match self.position(&child.name) {
            Some(idx) => self.children[idx] = Node::Element(child),
            None => self.push(child),
        }
    }

    /// Structural comparison ignoring blank text, attribute quoting and order.
    pub fn same_as(&self, other: &Element) -> bool {
        if self.name != other.name || self.attrs.len() != other.attrs.len() {
            return false;
        }
        let attrs_match = self
            .attrs
            .iter()
            .all(|a| other.attr(&a.name) == Some(unescape(&a.raw)));
        if !attrs_match {
            return false;
        }

        let significant = |e: &Element| -> Vec<Node> {
            e.children.iter().filter(|n| !is_blank(n)).cloned().collect()
        };
        let (ours, theirs) = (significant(self), significant(other));
        ours.len() == theirs.len()
            && ours.iter().zip(theirs.iter()).all(|pair| match pair {
                (Node::Element(a), Node::Element(b)) => a.same_as(b),
                (Node::Text(a), Node::Text(b)) => unescape(a).trim() == unescape(b).trim(),
                (a, b) => a == b,
            })
    }

    fn write_to(&self, out: &mut String) -> fmt::Result {
        match &self.raw_open {
            Some(raw) => out.push_str(raw),
            None => {
                write!(out, "<{}", self.name)?;
                for a in &self.attrs {
                    write!(out, " {}={}{}{}", a.name, a.quote, a.raw, a.quote)?;
                }
                out.push_str(if self.self_closing { "/>" } else { ">" });
            }
        }
        if self.self_closing {
            return Ok(());
        }

        for child in &self.children {
            write_node(child, out)?;
        }
        match &self.raw_close {
            Some(raw) => out.push_str(raw),
            None => write!(out, "</{}>", self.name)?,
        }
        Ok(())
    }
}

fn write_node(node: &Node, out: &mut String) -> fmt::Result {
    match node {
        Node::Element(e) => e.write_to(out),
        Node::Text(t) | Node::Comment(t) | Node::Other(t) => {
            out.push_str(t);
            Ok(())
        }
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut out = String::new();
        self.write_to(&mut out)?;
        f.write_str(&out)
    }
}

/// A parsed document: the root element with whatever surrounds it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Document {
    prolog: Vec<Node>,
    root: Element,
    epilog: Vec<Node>,
}

impl Document {
    pub fn parse(input: &str) -> Result<Self> {
        Parser { src: input, pos: 0 }.document()
    }

    /// Parse and require the root element to be named `root`.
    pub fn parse_rooted(input: &str, root: &str) -> Result<Self> {
        let doc = Self::parse(input)?;
        if !doc.root.name.eq_ignore_ascii_case(root) {
            return Err(Error::Structure(format!(
                "root element is <{}>, expected <{root}>",
                doc.root.name
            )));
        }
        Ok(doc)
    }

    pub fn root(&self) -> &Element {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut Element {
        &mut self.root
    }

    pub fn into_root(self) -> Element {
        self.root
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut out = String::new();
        for node in self.prolog.iter() {
            write_node(node, &mut out)?;
        }
        self.root.write_to(&mut out)?;
        for node in self.epilog.iter() {
            write_node(node, &mut out)?;
        }
        f.write_str(&out)
    }
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn error<T>(&self, reason: &str) -> Result<T> {
        Err(Error::Parse {
            offset: self.pos,
            reason: reason.to_owned(),
        })
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    /// Consume up to and including `terminator`, returning the consumed text.
    fn take_through(&mut self, terminator: &str, what: &str) -> Result<String> {
        match self.rest().find(terminator) {
            Some(idx) => {
                let end = self.pos + idx + terminator.len();
                let text = self.src[self.pos..end].to_owned();
                self.pos = end;
                Ok(text)
            }
            None => self.error(&format!("unterminated {what}")),
        }
    }

    fn take_text(&mut self) -> String {
        let len = self.rest().find('<').unwrap_or(self.rest().len());
        let text = self.src[self.pos..self.pos + len].to_owned();
        self.pos += len;
        text
    }

    /// Comments, processing instructions and doctypes, if one starts here.
    fn misc(&mut self) -> Result<Option<Node>> {
        let rest = self.rest();
        if rest.starts_with("<!--") {
            Ok(Some(Node::Comment(self.take_through("-->", "comment")?)))
        } else if rest.starts_with("<?") {
            Ok(Some(Node::Other(
                self.take_through("?>", "processing instruction")?,
            )))
        } else if rest.starts_with("<!DOCTYPE") {
            Ok(Some(Node::Other(self.take_through(">", "doctype")?)))
        } else {
            Ok(None)
        }
    }

    fn document(mut self) -> Result<Document> {
        let mut prolog = Vec::new();
        loop {
            if self.rest().is_empty() {
                return self.error("no root element");
            }
            if let Some(node) = self.misc()? {
                prolog.push(node);
                continue;
            }
            if self.rest().starts_with('<') {
                break;
            }
            let text = self.take_text();
            if !text.trim().is_empty() {
                return self.error("text before root element");
            }
            prolog.push(Node::Text(text));
        }

        let root = self.element()?;

        let mut epilog = Vec::new();
        while !self.rest().is_empty() {
            if let Some(node) = self.misc()? {
                epilog.push(node);
                continue;
            }
            let text = self.take_text();
            if text.trim().is_empty() && !text.is_empty() {
                epilog.push(Node::Text(text));
            } else {
                return self.error("content after root element");
            }
        }

        Ok(Document {
            prolog,
            root,
            epilog,
        })
    }

    fn skip_whitespace(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.src.len() - trimmed.len();
    }

    fn name(&mut self) -> Result<String> {
        let len = self
            .rest()
            .find(|c: char| c.is_whitespace() || matches!(c, '/' | '>' | '=' | '<'))
            .unwrap_or(self.rest().len());
        if len == 0 {
            return self.error("expected a name");
        }
        let name = self.src[self.pos..self.pos + len].to_owned();
        self.pos += len;
        Ok(name)
    }

    fn element(&mut self) -> Result<Element> {
        let start = self.pos;
        if !self.rest().starts_with('<') {
            return self.error("expected an element");
        }
        self.pos += 1;
        let name = self.name()?;

        let mut attrs: Vec<Attribute> = Vec::new();
        let self_closing = loop {
            self.skip_whitespace();
            let rest = self.rest();
            if rest.starts_with("/>") {
                self.pos += 2;
                break true;
            }
            if rest.starts_with('>') {
                self.pos += 1;
                break false;
            }
            if rest.is_empty() {
                return self.error("unterminated start tag");
            }

            let attr_name = self.name()?;
            self.skip_whitespace();
            if !self.rest().starts_with('=') {
                return self.error("expected '=' after attribute name");
            }
            self.pos += 1;
            self.skip_whitespace();
            let quote = match self.rest().chars().next() {
                Some(q @ ('\'' | '"')) => q,
                _ => return self.error("expected quoted attribute value"),
            };
            self.pos += 1;
            let Some(len) = self.rest().find(quote) else {
                return self.error("unterminated attribute value");
            };
            let raw = self.src[self.pos..self.pos + len].to_owned();
            if raw.contains('<') {
                return self.error("'<' in attribute value");
            }
            self.pos += len + 1;
            if attrs.iter().any(|a| a.name == attr_name) {
                return self.error(&format!("duplicate attribute {attr_name}"));
            }
            attrs.push(Attribute {
                name: attr_name,
                raw,
                quote,
            });
        };
        let raw_open = Some(self.src[start..self.pos].to_owned());

        let mut element = Element {
            name,
            attrs,
            children: Vec::new(),
            self_closing,
            raw_open,
            raw_close: None,
        };
        if self_closing {
            return Ok(element);
        }

        loop {
            let rest = self.rest();
            if rest.is_empty() {
                return self.error(&format!("missing </{}>", element.name));
            }
            if rest.starts_with("</") {
                let close_start = self.pos;
                self.pos += 2;
                let close = self.name()?;
                if close != element.name {
                    return self.error(&format!(
                        "</{close}> does not close <{}>",
                        element.name
                    ));
                }
                self.skip_whitespace();
                if !self.rest().starts_with('>') {
                    return self.error("unterminated end tag");
                }
                self.pos += 1;
                element.raw_close = Some(self.src[close_start..self.pos].to_owned());
                return Ok(element);
            }
            if rest.starts_with("<![CDATA[") {
                let cdata = self.take_through("]]>", "CDATA section")?;
                element.children.push(Node::Other(cdata));
                continue;
            }
            if let Some(node) = self.misc()? {
                element.children.push(node);
                continue;
            }
            if rest.starts_with('<') {
                let child = self.element()?;
                element.children.push(Node::Element(child));
                continue;
            }
            element.children.push(Node::Text(self.take_text()));
        }
    }
}
