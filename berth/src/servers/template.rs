//! Address template rendering.
//!
//! Supports the subset of StringTemplate syntax used by address templates:
//!
//! - `<name>` substitutes a property (unknown names render empty)
//! - `<if(name)>...<else>...<endif>` and `<if(!name)>...<endif>`, nestable
//! - `\<` and `\>` for literal angle brackets
//!
//! A parsed [`Template`] is immutable and can be rendered any number of times
//! against different [`TemplateProperties`].

use berth_shared::errors::{BerthError, BerthResult};
use std::collections::HashMap;
use std::str::FromStr;

/// Value bound to a template property.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TemplateValue {
    Text(String),
    Flag(bool),
}

impl TemplateValue {
    fn is_truthy(&self) -> bool {
        match self {
            TemplateValue::Text(s) => !s.is_empty(),
            TemplateValue::Flag(b) => *b,
        }
    }

    fn render_into(&self, out: &mut String) {
        match self {
            TemplateValue::Text(s) => out.push_str(s),
            TemplateValue::Flag(b) => out.push_str(if *b { "true" } else { "false" }),
        }
    }
}

/// Named values available to a render call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TemplateProperties {
    values: HashMap<String, TemplateValue>,
}

impl TemplateProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_text(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        self.values
            .insert(name.to_string(), TemplateValue::Text(value.into()));
        self
    }

    pub fn set_flag(&mut self, name: &str, value: bool) -> &mut Self {
        self.values
            .insert(name.to_string(), TemplateValue::Flag(value));
        self
    }

    pub fn get(&self, name: &str) -> Option<&TemplateValue> {
        self.values.get(name)
    }

    /// Text value of a property; flags render as `true`/`false`.
    pub fn text(&self, name: &str) -> Option<String> {
        self.values.get(name).map(|v| {
            let mut out = String::new();
            v.render_into(&mut out);
            out
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Node {
    Text(String),
    Attr(String),
    If {
        name: String,
        negated: bool,
        then: Vec<Node>,
        otherwise: Vec<Node>,
    },
}

#[derive(Debug, PartialEq, Eq)]
enum Token {
    Text(String),
    Attr(String),
    If { name: String, negated: bool },
    Else,
    EndIf,
}

/// A parsed address template.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Template {
    source: String,
    nodes: Vec<Node>,
}

impl Template {
    pub fn parse(source: &str) -> BerthResult<Self> {
        let tokens = tokenize(source)?;
        let mut iter = tokens.into_iter().peekable();
        let nodes = parse_nodes(&mut iter, source, false)?;
        Ok(Self {
            source: source.to_string(),
            nodes,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn render(&self, properties: &TemplateProperties) -> String {
        let mut out = String::with_capacity(self.source.len());
        render_nodes(&self.nodes, properties, &mut out);
        out
    }
}

impl FromStr for Template {
    type Err = BerthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Template::parse(s)
    }
}

/// Parse and render in one go.
pub fn render(source: &str, properties: &TemplateProperties) -> BerthResult<String> {
    Ok(Template::parse(source)?.render(properties))
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn malformed(source: &str, detail: impl std::fmt::Display) -> BerthError {
    BerthError::InvalidArgument(format!("malformed template '{}': {}", source, detail))
}

fn tokenize(source: &str) -> BerthResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut text = String::new();
    let mut chars = source.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if matches!(chars.peek(), Some('<') | Some('>')) => {
                if let Some(escaped) = chars.next() {
                    text.push(escaped);
                }
            }
            '<' => {
                let mut tag = String::new();
                let mut closed = false;
                for t in chars.by_ref() {
                    if t == '>' {
                        closed = true;
                        break;
                    }
                    tag.push(t);
                }
                if !closed {
                    return Err(malformed(source, "unterminated '<'"));
                }
                if !text.is_empty() {
                    tokens.push(Token::Text(std::mem::take(&mut text)));
                }
                tokens.push(classify_tag(source, tag.trim())?);
            }
            _ => text.push(c),
        }
    }

    if !text.is_empty() {
        tokens.push(Token::Text(text));
    }
    Ok(tokens)
}

fn classify_tag(source: &str, tag: &str) -> BerthResult<Token> {
    match tag {
        "else" => return Ok(Token::Else),
        "endif" => return Ok(Token::EndIf),
        _ => {}
    }

    if let Some(cond) = tag.strip_prefix("if(").and_then(|r| r.strip_suffix(')')) {
        let cond = cond.trim();
        let (negated, name) = match cond.strip_prefix('!') {
            Some(rest) => (true, rest.trim()),
            None => (false, cond),
        };
        if !is_identifier(name) {
            return Err(malformed(source, format!("bad condition '{}'", cond)));
        }
        return Ok(Token::If {
            name: name.to_string(),
            negated,
        });
    }

    if is_identifier(tag) {
        Ok(Token::Attr(tag.to_string()))
    } else {
        Err(malformed(source, format!("bad expression '<{}>'", tag)))
    }
}

fn parse_nodes<I>(
    tokens: &mut std::iter::Peekable<I>,
    source: &str,
    in_if: bool,
) -> BerthResult<Vec<Node>>
where
    I: Iterator<Item = Token>,
{
    let mut nodes = Vec::new();
    while let Some(token) = tokens.peek() {
        match token {
            Token::Else | Token::EndIf => {
                if in_if {
                    return Ok(nodes);
                }
                return Err(malformed(source, "<else>/<endif> without <if>"));
            }
            _ => {}
        }

        match tokens.next() {
            Some(Token::Text(s)) => nodes.push(Node::Text(s)),
            Some(Token::Attr(name)) => nodes.push(Node::Attr(name)),
            Some(Token::If { name, negated }) => {
                let then = parse_nodes(tokens, source, true)?;
                let otherwise = if tokens.peek() == Some(&Token::Else) {
                    tokens.next();
                    parse_nodes(tokens, source, true)?
                } else {
                    Vec::new()
                };
                if tokens.next() != Some(Token::EndIf) {
                    return Err(malformed(source, format!("<if({})> without <endif>", name)));
                }
                nodes.push(Node::If {
                    name,
                    negated,
                    then,
                    otherwise,
                });
            }
            _ => {}
        }
    }

    if in_if {
        return Err(malformed(source, "<if> without <endif>"));
    }
    Ok(nodes)
}

fn render_nodes(nodes: &[Node], properties: &TemplateProperties, out: &mut String) {
    for node in nodes {
        match node {
            Node::Text(s) => out.push_str(s),
            Node::Attr(name) => {
                if let Some(value) = properties.get(name) {
                    value.render_into(out);
                }
            }
            Node::If {
                name,
                negated,
                then,
                otherwise,
            } => {
                let truthy = properties.get(name).is_some_and(TemplateValue::is_truthy);
                if truthy != *negated {
                    render_nodes(then, properties, out);
                } else {
                    render_nodes(otherwise, properties, out);
                }
            }
        }
    }
}
